//! In-memory query and sink fakes for unit tests.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::Mutex;

use crate::query::{Query, Row, Value};
use crate::sink::MetricSink;
use crate::types::MetricValue;

struct Canned {
    database: Option<String>,
    fragment: String,
    result: std::result::Result<Vec<Row>, String>,
}

/// Answers queries whose text contains a registered fragment
#[derive(Default)]
pub struct StaticQuery {
    canned: Vec<Canned>,
    calls: Mutex<Vec<(Option<String>, String)>>,
}

impl StaticQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(mut self, fragment: &str, rows: Vec<Vec<Value>>) -> Self {
        self.canned.push(Canned {
            database: None,
            fragment: fragment.to_string(),
            result: Ok(rows.into_iter().map(Row::new).collect()),
        });
        self
    }

    pub fn rows_in(mut self, database: &str, fragment: &str, rows: Vec<Vec<Value>>) -> Self {
        self.canned.push(Canned {
            database: Some(database.to_string()),
            fragment: fragment.to_string(),
            result: Ok(rows.into_iter().map(Row::new).collect()),
        });
        self
    }

    pub fn fail_in(mut self, database: &str, fragment: &str, message: &str) -> Self {
        self.canned.push(Canned {
            database: Some(database.to_string()),
            fragment: fragment.to_string(),
            result: Err(message.to_string()),
        });
        self
    }

    pub fn calls(&self) -> Vec<(Option<String>, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Query for StaticQuery {
    async fn query(&self, sql: &str, _params: &[&str], database: Option<&str>) -> Result<Vec<Row>> {
        self.calls
            .lock()
            .unwrap()
            .push((database.map(str::to_string), sql.to_string()));

        let hit = self.canned.iter().find(|c| {
            sql.contains(&c.fragment)
                && (c.database.is_none() || c.database.as_deref() == database)
        });
        match hit {
            Some(c) => c.result.clone().map_err(|e| anyhow!(e)),
            None => Err(anyhow!("no canned result for query in {:?}: {}", database, sql)),
        }
    }
}

/// Keeps every metric it receives
#[derive(Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<(String, MetricValue)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(String, MetricValue)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn value(&self, key: &str) -> Option<MetricValue> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }
}

#[async_trait]
impl MetricSink for RecordingSink {
    fn name(&self) -> &str { "recording" }

    async fn send(&self, key: &str, value: MetricValue) -> Result<()> {
        self.sent.lock().unwrap().push((key.to_string(), value));
        Ok(())
    }
}

/// A sink that rejects everything
pub struct FailingSink;

#[async_trait]
impl MetricSink for FailingSink {
    fn name(&self) -> &str { "failing" }

    async fn send(&self, _key: &str, _value: MetricValue) -> Result<()> {
        Err(anyhow!("sink unavailable"))
    }
}
