use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use crate::plugin::Plugin;
use crate::query::Query;
use crate::sink::MetricSink;

/// Runs every enabled plugin on its own interval.
///
/// Each plugin gets its own task; a slow run only delays that plugin's next
/// tick. Plugins share the query and sink handles but no mutable state.
pub struct Scheduler {
    plugins: Vec<Box<dyn Plugin>>,
    query: Arc<dyn Query>,
    sink: Arc<dyn MetricSink>,
}

impl Scheduler {
    pub fn new(plugins: Vec<Box<dyn Plugin>>, query: Arc<dyn Query>, sink: Arc<dyn MetricSink>) -> Self {
        Self { plugins, query, sink }
    }

    /// Spawn one task per enabled plugin
    pub fn spawn(self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        for mut plugin in self.plugins {
            if !plugin.is_enabled() {
                tracing::info!(plugin = plugin.name(), "Plugin not scheduled");
                continue;
            }

            let query = self.query.clone();
            let sink = self.sink.clone();
            tracing::info!(plugin = plugin.name(), interval = plugin.interval_secs(), "Scheduling plugin");

            handles.push(tokio::spawn(async move {
                loop {
                    let interval = plugin.interval_secs();
                    if let Err(e) = run_once(plugin.as_mut(), query.as_ref(), sink.as_ref()).await {
                        tracing::warn!(plugin = plugin.name(), error = %e, "Plugin run failed");
                    }
                    tokio::time::sleep(Duration::from_secs(interval)).await;
                }
            }));
        }

        handles
    }
}

/// Execute a single tick of `plugin`. Disabled plugins do nothing.
pub async fn run_once(plugin: &mut dyn Plugin, query: &dyn Query, sink: &dyn MetricSink) -> Result<()> {
    if !plugin.is_enabled() {
        return Ok(());
    }

    let started = Instant::now();
    plugin
        .run(query, sink)
        .await
        .with_context(|| format!("plugin {} failed", plugin.name()))?;
    tracing::debug!(
        plugin = plugin.name(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Plugin run complete"
    );
    Ok(())
}
