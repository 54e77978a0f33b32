pub mod databases;
pub mod memory_leak;

use crate::config::Config;
use crate::plugin::{AgentParameter, Plugin};
use crate::template::{JsonTemplate, TemplateBuilder};
use memory_leak::probe::HostProbe;

/// Build every known plugin from configuration.
///
/// Plugins that fail validation are returned in the disabled state; the
/// scheduler skips them.
pub fn create_plugins(config: &Config) -> Vec<Box<dyn Plugin>> {
    let plugins: Vec<Box<dyn Plugin>> = vec![
        Box::new(databases::DatabasesPlugin::new(
            &config.plugin_overrides(databases::NAME),
        )),
        Box::new(memory_leak::MemoryLeakDiagnostic::new(
            &config.plugin_overrides(memory_leak::NAME),
            HostProbe::from_host(&config.agent),
        )),
    ];

    let known: Vec<&str> = plugins.iter().map(|p| p.name()).collect();
    for name in config.plugins.keys() {
        if !known.contains(&name.as_str()) {
            tracing::warn!(plugin = %name, "Configuration for unknown plugin ignored");
        }
    }

    let enabled = plugins.iter().filter(|p| p.is_enabled()).count();
    tracing::info!(count = plugins.len(), enabled, "Initialized plugins");
    plugins
}

/// Render the template records of all plugins into `builder`
pub fn render_template(plugins: &[Box<dyn Plugin>], builder: &mut dyn TemplateBuilder) {
    for plugin in plugins {
        plugin.template().render(builder);
    }
}

/// Template of all plugins as a JSON document
pub fn json_template(name: &str, plugins: &[Box<dyn Plugin>]) -> serde_json::Value {
    let mut builder = JsonTemplate::new(name);
    render_template(plugins, &mut builder);
    builder.finish()
}

/// Agent parameters of every plugin in the `plugin_type` group
pub fn agent_parameters(plugins: &[Box<dyn Plugin>], plugin_type: &str) -> Vec<AgentParameter> {
    plugins
        .iter()
        .filter(|p| p.agent_plugin_type() == Some(plugin_type))
        .flat_map(|p| p.keys_and_queries())
        .collect()
}
