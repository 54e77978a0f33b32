pub mod zabbix;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use crate::config::Config;
use crate::types::MetricValue;

/// Destination for metric values.
///
/// Keys follow the backend naming convention, for example
/// `pgsql.database.size[postgres]` or `pgsql.database.discovery[]`.
#[async_trait]
pub trait MetricSink: Send + Sync {
    /// Sink name for logging
    fn name(&self) -> &str;

    /// Queue or deliver one value
    async fn send(&self, key: &str, value: MetricValue) -> Result<()>;

    /// Deliver anything still buffered. Called once on shutdown.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Writes every metric to the log instead of a backend
pub struct LogSink;

#[async_trait]
impl MetricSink for LogSink {
    fn name(&self) -> &str { "log" }

    async fn send(&self, key: &str, value: MetricValue) -> Result<()> {
        tracing::info!(key, value = %value, "metric");
        Ok(())
    }
}

/// Create the sink selected by configuration
pub fn create_sink(config: &Config) -> Arc<dyn MetricSink> {
    if config.zabbix.enabled {
        let sender = Arc::new(zabbix::ZabbixSender::new(&config.zabbix, config.client_hostname()));
        sender.clone().spawn_flusher();
        tracing::info!(
            address = %config.zabbix.address,
            port = config.zabbix.port,
            "Sending metrics to zabbix"
        );
        sender
    } else {
        tracing::info!("Zabbix disabled, logging metrics");
        Arc::new(LogSink)
    }
}
