use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::str::FromStr;

use crate::error::PluginError;
use crate::query::Query;
use crate::sink::MetricSink;
use crate::template::PluginTemplate;

/// Whether a plugin is allowed to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginState {
    Enabled,
    /// Terminal: a disabled plugin is never re-enabled
    Disabled { reason: String },
}

impl PluginState {
    pub fn is_enabled(&self) -> bool {
        matches!(self, PluginState::Enabled)
    }
}

/// Trait for all metric plugins.
///
/// A plugin is constructed once from configuration, may disable itself
/// during construction, and is then invoked by the scheduler every
/// `interval_secs`. It reports only through the sink.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Unique plugin name, also the `[plugins.<name>]` config section
    fn name(&self) -> &str;

    /// Seconds between runs
    fn interval_secs(&self) -> u64;

    fn state(&self) -> &PluginState;

    fn is_enabled(&self) -> bool {
        self.state().is_enabled()
    }

    /// Query, compute and report once.
    ///
    /// Failures of individual entities are handled inside; an error here
    /// comes from the query or sink layer and is left to the scheduler.
    async fn run(&mut self, query: &dyn Query, sink: &dyn MetricSink) -> Result<()>;

    /// Items, graphs, triggers and discovery rules this plugin reports
    fn template(&self) -> PluginTemplate {
        PluginTemplate::default()
    }

    /// Group of backend agent parameters this plugin belongs to, if any
    fn agent_plugin_type(&self) -> Option<&'static str> {
        None
    }

    /// Keys with the commands a backend agent runs to answer them without
    /// this process
    fn keys_and_queries(&self) -> Vec<AgentParameter> {
        Vec::new()
    }
}

/// One backend agent parameter.
///
/// The agent passes the key arguments to `command` as `$1`, `$2`, ... The
/// last one is the path of the SQL client and the one before it the
/// connection options; per-database keys take the database name first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentParameter {
    pub key: String,
    pub command: String,
}

impl std::fmt::Display for AgentParameter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "UserParameter={},{}", self.key, self.command)
    }
}

/// String option table of one plugin.
///
/// Layers, later wins: global defaults (`enabled`, `interval`), the plugin's
/// own default table, then overrides from the config file.
#[derive(Debug, Clone)]
pub struct PluginOptions {
    plugin: String,
    values: HashMap<String, String>,
}

impl PluginOptions {
    pub fn new(
        plugin: &str,
        interval: u64,
        defaults: &[(&str, &str)],
        overrides: &HashMap<String, String>,
    ) -> Self {
        let mut values = HashMap::new();
        values.insert("enabled".to_string(), "true".to_string());
        values.insert("interval".to_string(), interval.to_string());
        for (key, value) in defaults {
            values.insert(key.to_string(), value.to_string());
        }
        for (key, value) in overrides {
            if !values.contains_key(key) {
                tracing::warn!(plugin, option = %key, "Unknown plugin option ignored");
                continue;
            }
            values.insert(key.clone(), value.clone());
        }
        Self { plugin: plugin.to_string(), values }
    }

    pub fn get(&self, option: &str) -> Result<&str, PluginError> {
        self.values
            .get(option)
            .map(String::as_str)
            .ok_or_else(|| PluginError::MissingOption {
                plugin: self.plugin.clone(),
                option: option.to_string(),
            })
    }

    /// Parse an option into `T`
    pub fn parse<T>(&self, option: &str) -> Result<T, PluginError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let raw = self.get(option)?;
        raw.trim().parse().map_err(|e: T::Err| self.invalid(option, raw, e.to_string()))
    }

    /// Parse a boolean option; accepts true/false, yes/no, on/off, 1/0 in any case
    pub fn boolean(&self, option: &str) -> Result<bool, PluginError> {
        let raw = self.get(option)?;
        match raw.trim().to_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Ok(true),
            "false" | "no" | "off" | "0" => Ok(false),
            _ => Err(self.invalid(option, raw, "expected true or false".into())),
        }
    }

    /// Positive interval in seconds
    pub fn interval(&self) -> Result<u64, PluginError> {
        let interval: u64 = self.parse("interval")?;
        if interval == 0 {
            return Err(self.invalid("interval", "0", "must be at least 1 second".into()));
        }
        Ok(interval)
    }

    fn invalid(&self, option: &str, value: &str, reason: String) -> PluginError {
        PluginError::InvalidOption {
            plugin: self.plugin.clone(),
            option: option.to_string(),
            value: value.to_string(),
            reason,
        }
    }
}

/// Log why a plugin will not run and build the terminal state
pub fn disable(plugin: &str, cause: &PluginError) -> PluginState {
    tracing::error!(plugin, error = %cause, "Plugin disabled");
    PluginState::Disabled { reason: cause.to_string() }
}

/// State for a plugin switched off with `enabled = false`
pub fn disabled_by_config(plugin: &str) -> PluginState {
    tracing::info!(plugin, "Plugin disabled by configuration");
    PluginState::Disabled { reason: "disabled in configuration".into() }
}
