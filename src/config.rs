use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;

/// Top-level configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub postgres: PostgresConfig,
    #[serde(default)]
    pub zabbix: ZabbixConfig,
    /// Per-plugin option overrides, keyed by plugin name
    #[serde(default)]
    pub plugins: HashMap<String, toml::Table>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_proc_root")]
    pub proc_root: String,
    #[serde(default = "default_os_release")]
    pub os_release: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            log_level: default_log_level(),
            proc_root: default_proc_root(),
            os_release: default_os_release(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PostgresConfig {
    #[serde(default = "default_pg_host")]
    pub host: String,
    #[serde(default = "default_pg_port")]
    pub port: u16,
    #[serde(default = "default_pg_user")]
    pub user: String,
    pub password: Option<String>,
    #[serde(default = "default_pg_database")]
    pub database: String,
    #[serde(default = "default_application_name")]
    pub application_name: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: default_pg_host(),
            port: default_pg_port(),
            user: default_pg_user(),
            password: None,
            database: default_pg_database(),
            application_name: default_application_name(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ZabbixConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_zabbix_address")]
    pub address: String,
    #[serde(default = "default_zabbix_port")]
    pub port: u16,
    /// Host name the metrics are attributed to on the backend
    pub client: Option<String>,
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,
    #[serde(default = "default_max_queue")]
    pub max_queue_size: usize,
    /// Deadline for connecting, sending a batch and reading the reply
    #[serde(default = "default_zabbix_timeout")]
    pub timeout_secs: u64,
}

impl Default for ZabbixConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: default_zabbix_address(),
            port: default_zabbix_port(),
            client: None,
            flush_interval_secs: default_flush_interval(),
            max_queue_size: default_max_queue(),
            timeout_secs: default_zabbix_timeout(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        // Expand environment variables
        let expanded = expand_env_vars(content)?;

        let config: Config = toml::from_str(&expanded)
            .with_context(|| "Failed to parse configuration")?;

        Ok(config)
    }

    /// Option overrides for one plugin, stringified the way plugin options are stored
    pub fn plugin_overrides(&self, plugin: &str) -> HashMap<String, String> {
        self.plugins
            .get(plugin)
            .map(|table| {
                table
                    .iter()
                    .map(|(k, v)| (k.to_lowercase(), toml_value_to_string(v)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Host name reported to the backend
    pub fn client_hostname(&self) -> &str {
        self.zabbix.client.as_deref().unwrap_or(&self.agent.hostname)
    }
}

fn toml_value_to_string(value: &toml::Value) -> String {
    match value {
        toml::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Expand ${ENV_VAR} references in config string
fn expand_env_vars(input: &str) -> Result<String> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}")?;
    Ok(re
        .replace_all(input, |caps: &regex::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_default()
        })
        .to_string())
}

// Default value functions
fn default_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}
fn default_log_level() -> String { "info".to_string() }
fn default_proc_root() -> String { "/proc".to_string() }
fn default_os_release() -> String { "/etc/os-release".to_string() }
fn default_pg_host() -> String { "localhost".to_string() }
fn default_pg_port() -> u16 { 5432 }
fn default_pg_user() -> String { "postgres".to_string() }
fn default_pg_database() -> String { "postgres".to_string() }
fn default_application_name() -> String { "pgpulse".to_string() }
fn default_connect_timeout() -> u64 { 10 }
fn default_true() -> bool { true }
fn default_zabbix_address() -> String { "127.0.0.1".to_string() }
fn default_zabbix_port() -> u16 { 10051 }
fn default_flush_interval() -> u64 { 2 }
fn default_max_queue() -> usize { 2048 }
fn default_zabbix_timeout() -> u64 { 10 }
