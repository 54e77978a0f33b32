use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::{Client, NoTls};

use crate::config::PostgresConfig;

/// A single column value returned by the query layer
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Text(String),
    Bool(bool),
    Null,
}

/// One result row, columns in select-list order
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row(Vec<Value>);

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.0.get(idx)
    }

    /// Column `idx` as an integer. Numeric text is accepted.
    pub fn int(&self, idx: usize) -> Result<i64> {
        match self.get(idx) {
            Some(Value::Int(v)) => Ok(*v),
            Some(Value::Text(s)) => s
                .trim()
                .parse()
                .with_context(|| format!("column {} is not an integer: '{}'", idx, s)),
            Some(other) => Err(anyhow!("column {} is not an integer: {:?}", idx, other)),
            None => Err(anyhow!("row has no column {}", idx)),
        }
    }

    pub fn text(&self, idx: usize) -> Result<&str> {
        match self.get(idx) {
            Some(Value::Text(s)) => Ok(s),
            Some(other) => Err(anyhow!("column {} is not text: {:?}", idx, other)),
            None => Err(anyhow!("row has no column {}", idx)),
        }
    }
}

impl From<Vec<Value>> for Row {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}

/// Executes SQL against the monitored server.
///
/// `params` bind to `$1`, `$2`, ... as text. `database` selects the target
/// database; `None` means the configured default one.
#[async_trait]
pub trait Query: Send + Sync {
    async fn query(&self, sql: &str, params: &[&str], database: Option<&str>) -> Result<Vec<Row>>;
}

/// Lazily connected `tokio-postgres` clients, one per database
pub struct PgPool {
    config: PostgresConfig,
    clients: Mutex<HashMap<String, Arc<Client>>>,
}

impl PgPool {
    pub fn new(config: &PostgresConfig) -> Self {
        Self {
            config: config.clone(),
            clients: Mutex::new(HashMap::new()),
        }
    }

    async fn client(&self, database: &str) -> Result<Arc<Client>> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(database) {
            if !client.is_closed() {
                return Ok(client.clone());
            }
            tracing::debug!(database, "Dropping closed connection");
            clients.remove(database);
        }

        let client = Arc::new(self.connect(database).await?);
        clients.insert(database.to_string(), client.clone());
        Ok(client)
    }

    async fn connect(&self, database: &str) -> Result<Client> {
        let mut pg = tokio_postgres::Config::new();
        pg.host(&self.config.host)
            .port(self.config.port)
            .user(&self.config.user)
            .dbname(database)
            .application_name(&self.config.application_name)
            .connect_timeout(Duration::from_secs(self.config.connect_timeout_secs));
        if let Some(ref password) = self.config.password {
            pg.password(password);
        }

        let (client, connection) = pg
            .connect(NoTls)
            .await
            .with_context(|| format!("Failed to connect to database {}", database))?;

        let db = database.to_string();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!(database = %db, error = %e, "Postgres connection closed");
            }
        });

        tracing::info!(host = %self.config.host, database, "Connected to postgres");
        Ok(client)
    }
}

#[async_trait]
impl Query for PgPool {
    async fn query(&self, sql: &str, params: &[&str], database: Option<&str>) -> Result<Vec<Row>> {
        let database = database.unwrap_or(&self.config.database);
        let client = self.client(database).await?;

        let params: Vec<&(dyn ToSql + Sync)> = params
            .iter()
            .map(|p| p as &(dyn ToSql + Sync))
            .collect();

        let rows = client
            .query(sql, &params)
            .await
            .with_context(|| format!("Query failed in database {}", database))?;

        rows.iter().map(convert_row).collect()
    }
}

fn convert_row(row: &tokio_postgres::Row) -> Result<Row> {
    let mut values = Vec::with_capacity(row.len());
    for (idx, column) in row.columns().iter().enumerate() {
        let ty = column.type_();
        let value = if *ty == Type::INT2 {
            row.try_get::<_, Option<i16>>(idx)?.map(|v| Value::Int(v.into()))
        } else if *ty == Type::INT4 {
            row.try_get::<_, Option<i32>>(idx)?.map(|v| Value::Int(v.into()))
        } else if *ty == Type::INT8 {
            row.try_get::<_, Option<i64>>(idx)?.map(Value::Int)
        } else if *ty == Type::OID {
            row.try_get::<_, Option<u32>>(idx)?.map(|v| Value::Int(v.into()))
        } else if *ty == Type::FLOAT4 {
            row.try_get::<_, Option<f32>>(idx)?.map(|v| Value::Float(v.into()))
        } else if *ty == Type::FLOAT8 {
            row.try_get::<_, Option<f64>>(idx)?.map(Value::Float)
        } else if *ty == Type::BOOL {
            row.try_get::<_, Option<bool>>(idx)?.map(Value::Bool)
        } else if [Type::TEXT, Type::VARCHAR, Type::NAME, Type::BPCHAR].contains(ty) {
            row.try_get::<_, Option<String>>(idx)?.map(Value::Text)
        } else {
            return Err(anyhow!(
                "unsupported column type {} for column {}",
                ty,
                column.name()
            ));
        };
        values.push(value.unwrap_or(Value::Null));
    }
    Ok(Row::new(values))
}
