use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::config::ZabbixConfig;
use crate::types::MetricValue;
use super::MetricSink;

const HEADER: &[u8; 5] = b"ZBXD\x01";
const MAX_RESPONSE: u64 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Serialize)]
struct SenderEntry {
    host: String,
    key: String,
    value: String,
    clock: i64,
}

#[derive(Serialize)]
struct SenderRequest<'a> {
    request: &'static str,
    data: &'a [SenderEntry],
    clock: i64,
}

#[derive(Debug, Deserialize)]
struct SenderResponse {
    response: String,
    #[serde(default)]
    info: String,
}

/// Batches metrics and delivers them with the Zabbix sender protocol
pub struct ZabbixSender {
    address: String,
    port: u16,
    host: String,
    flush_interval: Duration,
    max_queue: usize,
    timeout: Duration,
    queue: Mutex<VecDeque<SenderEntry>>,
}

impl ZabbixSender {
    pub fn new(config: &ZabbixConfig, host: &str) -> Self {
        Self {
            address: config.address.clone(),
            port: config.port,
            host: host.to_string(),
            flush_interval: Duration::from_secs(config.flush_interval_secs.max(1)),
            max_queue: config.max_queue_size.max(1),
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Flush the queue in the background every `flush_interval_secs`
    pub fn spawn_flusher(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(self.flush_interval).await;
                if let Err(e) = self.flush().await {
                    tracing::warn!(error = %e, "Zabbix flush failed");
                }
            }
        })
    }

    pub async fn queued(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Deliver everything queued so far. Entries are dropped on failure.
    pub async fn flush(&self) -> Result<()> {
        let batch = Vec::from(std::mem::take(&mut *self.queue.lock().await));
        if batch.is_empty() {
            return Ok(());
        }

        let frame = encode(&batch, Utc::now().timestamp())?;
        let mut stream = self
            .deadline("connect", TcpStream::connect((self.address.as_str(), self.port)))
            .await?
            .with_context(|| format!("Failed to connect to {}:{}", self.address, self.port))?;
        self.deadline("send", stream.write_all(&frame)).await??;

        let response = self.deadline("read reply", read_response(&mut stream)).await??;
        if response.response != "success" {
            bail!("zabbix rejected batch: {}", response.info);
        }
        tracing::debug!(count = batch.len(), info = %response.info, "Zabbix batch delivered");
        Ok(())
    }

    async fn deadline<T>(&self, step: &str, fut: impl Future<Output = T>) -> Result<T> {
        tokio::time::timeout(self.timeout, fut).await.map_err(|_| {
            anyhow!(
                "zabbix {} to {}:{} timed out after {}s",
                step,
                self.address,
                self.port,
                self.timeout.as_secs()
            )
        })
    }
}

#[async_trait]
impl MetricSink for ZabbixSender {
    fn name(&self) -> &str { "zabbix" }

    async fn close(&self) -> Result<()> {
        self.flush().await
    }

    async fn send(&self, key: &str, value: MetricValue) -> Result<()> {
        let mut queue = self.queue.lock().await;
        if queue.len() >= self.max_queue {
            tracing::warn!(size = queue.len(), "Zabbix queue full, dropping oldest metric");
            queue.pop_front();
        }
        queue.push_back(SenderEntry {
            host: self.host.clone(),
            key: key.to_string(),
            value: value.to_string(),
            clock: Utc::now().timestamp(),
        });
        Ok(())
    }
}

fn encode(entries: &[SenderEntry], clock: i64) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(&SenderRequest {
        request: "sender data",
        data: entries,
        clock,
    })?;
    let mut frame = Vec::with_capacity(HEADER.len() + 8 + body.len());
    frame.extend_from_slice(HEADER);
    frame.extend_from_slice(&(body.len() as u64).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

async fn read_response(stream: &mut TcpStream) -> Result<SenderResponse> {
    let mut header = [0u8; 13];
    stream
        .read_exact(&mut header)
        .await
        .context("Failed to read zabbix response header")?;
    if &header[..5] != HEADER {
        bail!("unexpected zabbix response header");
    }
    let mut len = [0u8; 8];
    len.copy_from_slice(&header[5..]);
    let len = u64::from_le_bytes(len);
    if len > MAX_RESPONSE {
        return Err(anyhow!("zabbix response too large: {} bytes", len));
    }

    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}
