use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;

use crate::discovery::{entity_key, prototype_key, scalar_key, Discovery};
use crate::error::PluginError;
use crate::plugin::{
    disable, disabled_by_config, AgentParameter, Plugin, PluginOptions, PluginState,
};
use crate::query::Query;
use crate::sink::MetricSink;
use crate::template::{
    Condition, DiscoveryRule, Graph, GraphItem, Item, PluginTemplate, Trigger, Units,
};

pub const NAME: &str = "databases";
pub const AGENT_PLUGIN_TYPE: &str = "pg";
const DEFAULT_INTERVAL: u64 = 5 * 60;
const DEFAULT_CONFIG: &[(&str, &str)] = &[("min_rows", "50"), ("bloat_scale", "0.2")];

pub const DATABASE_MACRO: &str = "{#DATABASE}";

pub const KEY_DISCOVERY: &str = "pgsql.database.discovery";
pub const KEY_SIZE: &str = "pgsql.database.size";
pub const KEY_AGE: &str = "pgsql.database.max_age";
pub const KEY_BLOATING_TABLES: &str = "pgsql.database.bloating_tables";
pub const KEY_INVALID_INDEXES: &str = "pgsql.database.invalid_indexes";
/// Reported by the autovacuum plugin; drawn on the bloat and age graphs
const KEY_AUTOVACUUM_COUNT: &str = "pgsql.autovacuum.count[]";

const DATABASES_SQL: &str = "SELECT datname, \
        pg_database_size(datname::text), \
        age(datfrozenxid) \
    FROM pg_catalog.pg_database \
    WHERE datistemplate = false \
    AND datallowconn";

// Agent-side queries; `:'p1'` is bound by the SQL client
const AGENT_DISCOVERY_SQL: &str = "SELECT json_build_object('data', \
        json_agg(json_build_object('{#DATABASE}', d.datname))) \
    FROM pg_catalog.pg_database d \
    WHERE NOT datistemplate \
    AND datallowconn \
    AND datname != 'postgres'";

const AGENT_SIZE_SQL: &str = "SELECT pg_database_size(datname::text) \
    FROM pg_catalog.pg_database \
    WHERE datistemplate = false \
    AND datname = :'p1';";

const AGENT_AGE_SQL: &str = "SELECT age(datfrozenxid) \
    FROM pg_catalog.pg_database \
    WHERE datistemplate = false \
    AND datname = :'p1';";

const INVALID_INDEXES_SQL: &str = "SELECT count(*) \
    FROM pg_catalog.pg_index i \
    LEFT JOIN pg_catalog.pg_locks l ON (i.indexrelid = l.relation) \
    WHERE NOT (i.indisvalid AND i.indisready) \
    AND l.relation IS NULL";

fn bloating_tables_sql(bloat_scale: f64, min_rows: u64) -> String {
    format!(
        "SELECT count(*) \
        FROM pg_catalog.pg_stat_all_tables \
        WHERE (n_dead_tup / (n_live_tup + n_dead_tup)::float8) > {} \
        AND (n_live_tup + n_dead_tup) > {}",
        bloat_scale, min_rows
    )
}

/// Typed options of the databases plugin
#[derive(Debug, Clone, PartialEq)]
pub struct DatabasesSettings {
    pub interval: u64,
    /// Tables with fewer live+dead tuples are never counted as bloated
    pub min_rows: u64,
    /// Dead tuple ratio above which a table counts as bloated
    pub bloat_scale: f64,
}

impl Default for DatabasesSettings {
    fn default() -> Self {
        Self { interval: DEFAULT_INTERVAL, min_rows: 50, bloat_scale: 0.2 }
    }
}

impl DatabasesSettings {
    fn from_options(options: &PluginOptions) -> crate::error::Result<Self> {
        let bloat_scale: f64 = options.parse("bloat_scale")?;
        if !bloat_scale.is_finite() || bloat_scale < 0.0 {
            return Err(PluginError::InvalidOption {
                plugin: NAME.to_string(),
                option: "bloat_scale".to_string(),
                value: bloat_scale.to_string(),
                reason: "must be a non-negative ratio".to_string(),
            });
        }
        Ok(Self {
            interval: options.interval()?,
            min_rows: options.parse("min_rows")?,
            bloat_scale,
        })
    }
}

/// Per-database details gathered inside that database
struct DatabaseStats {
    bloating_tables: i64,
    invalid_indexes: i64,
}

/// Size, transaction id age, bloat and invalid indexes of every database
pub struct DatabasesPlugin {
    state: PluginState,
    settings: DatabasesSettings,
}

impl DatabasesPlugin {
    pub fn new(overrides: &HashMap<String, String>) -> Self {
        let options = PluginOptions::new(NAME, DEFAULT_INTERVAL, DEFAULT_CONFIG, overrides);

        let configured = DatabasesSettings::from_options(&options)
            .and_then(|settings| Ok((settings, options.boolean("enabled")?)));
        match configured {
            Ok((settings, true)) => Self { state: PluginState::Enabled, settings },
            Ok((settings, false)) => Self { state: disabled_by_config(NAME), settings },
            Err(e) => Self { state: disable(NAME, &e), settings: DatabasesSettings::default() },
        }
    }

    pub fn settings(&self) -> &DatabasesSettings {
        &self.settings
    }

    async fn inspect(&self, query: &dyn Query, database: &str) -> Result<DatabaseStats> {
        let sql = bloating_tables_sql(self.settings.bloat_scale, self.settings.min_rows);
        let bloating_tables = first_count(query, &sql, database).await?;
        let invalid_indexes = first_count(query, INVALID_INDEXES_SQL, database).await?;
        Ok(DatabaseStats { bloating_tables, invalid_indexes })
    }
}

async fn first_count(query: &dyn Query, sql: &str, database: &str) -> Result<i64> {
    let rows = query.query(sql, &[], Some(database)).await?;
    match rows.first() {
        Some(row) => row.int(0),
        None => Ok(0),
    }
}

#[async_trait]
impl Plugin for DatabasesPlugin {
    fn name(&self) -> &str { NAME }

    fn interval_secs(&self) -> u64 { self.settings.interval }

    fn state(&self) -> &PluginState { &self.state }

    async fn run(&mut self, query: &dyn Query, sink: &dyn MetricSink) -> Result<()> {
        let rows = query.query(DATABASES_SQL, &[], None).await?;
        let mut discovery = Discovery::new(DATABASE_MACRO);

        for row in &rows {
            let database = row.text(0)?;
            let size = row.int(1)?;
            let age = row.int(2)?;

            // A database dropped or locked since listing is left out of this run
            let stats = match self.inspect(query, database).await {
                Ok(stats) => stats,
                Err(e) => {
                    tracing::warn!(plugin = NAME, database, error = %e, "Skipping database");
                    continue;
                }
            };

            sink.send(&entity_key(KEY_SIZE, database), size.into()).await?;
            sink.send(&entity_key(KEY_AGE, database), age.into()).await?;
            sink.send(&entity_key(KEY_BLOATING_TABLES, database), stats.bloating_tables.into()).await?;
            sink.send(&entity_key(KEY_INVALID_INDEXES, database), stats.invalid_indexes.into()).await?;
            discovery.add(database);
        }

        tracing::debug!(plugin = NAME, databases = discovery.entities().len(), "Databases reported");
        sink.send(&scalar_key(KEY_DISCOVERY), discovery.payload()).await?;
        Ok(())
    }

    fn agent_plugin_type(&self) -> Option<&'static str> {
        Some(AGENT_PLUGIN_TYPE)
    }

    fn keys_and_queries(&self) -> Vec<AgentParameter> {
        let key = |base: &str| prototype_key(base, "*");
        let by_name = |base: &str, sql: &str| AgentParameter {
            key: key(base),
            command: format!("echo \"{}\" | $3 $2 -v p1=\"$1\"", sql),
        };
        let in_database = |base: &str, sql: &str| AgentParameter {
            key: key(base),
            command: format!("$3 $2 -d \"$1\" -c \"{}\"", sql),
        };

        vec![
            AgentParameter {
                key: key(KEY_DISCOVERY),
                command: format!("$2 $1 -c \"{}\"", AGENT_DISCOVERY_SQL),
            },
            by_name(KEY_SIZE, AGENT_SIZE_SQL),
            by_name(KEY_AGE, AGENT_AGE_SQL),
            in_database(
                KEY_BLOATING_TABLES,
                &bloating_tables_sql(self.settings.bloat_scale, self.settings.min_rows),
            ),
            in_database(KEY_INVALID_INDEXES, INVALID_INDEXES_SQL),
        ]
    }

    fn template(&self) -> PluginTemplate {
        let interval = self.settings.interval;
        let key = |base: &str| prototype_key(base, DATABASE_MACRO);

        let items = vec![
            Item::new("PostgreSQL Databases: {#DATABASE} size", key(KEY_SIZE), interval)
                .units(Units::Bytes),
            Item::new("PostgreSQL Databases: Max datfrozenxid Age in: {#DATABASE}", key(KEY_AGE), interval),
            Item::new(
                "PostgreSQL Databases: Count of Bloating Tables in {#DATABASE}",
                key(KEY_BLOATING_TABLES),
                interval,
            ),
            Item::new(
                "PostgreSQL Databases: Count of Invalid Indexes in {#DATABASE}",
                key(KEY_INVALID_INDEXES),
                interval,
            ),
        ];

        let with_autovacuum = |name: &str, base: &str| Graph {
            name: name.to_string(),
            graph_type: None,
            items: vec![
                GraphItem { drawtype: Some(2), ..GraphItem::new(key(base), "87C2B9") },
                GraphItem {
                    drawtype: Some(2),
                    yaxisside: Some(1),
                    ..GraphItem::new(KEY_AUTOVACUUM_COUNT, "793F5D")
                },
            ],
        };

        let graphs = vec![
            Graph {
                name: "PostgreSQL Databases: {#DATABASE} size".to_string(),
                graph_type: Some(1),
                items: vec![GraphItem { drawtype: Some(2), ..GraphItem::new(key(KEY_SIZE), "A39B98") }],
            },
            with_autovacuum("PostgreSQL Databases: {#DATABASE} Bloating Overview", KEY_BLOATING_TABLES),
            with_autovacuum("PostgreSQL Databases: {#DATABASE} Max age(datfrozenxid)", KEY_AGE),
        ];

        let triggers = vec![Trigger {
            name: "PostgreSQL Databases: invalid indexes in {#DATABASE} \
                (hostname={HOSTNAME} value={ITEM.LASTVALUE})"
                .to_string(),
            expression: format!("{{#TEMPLATE:{}.last()}}>0", key(KEY_INVALID_INDEXES)),
        }];

        PluginTemplate {
            discovery_rules: vec![DiscoveryRule {
                name: "PostgreSQL Databases Discovery".to_string(),
                key: scalar_key(KEY_DISCOVERY),
                conditions: vec![Condition {
                    macro_name: DATABASE_MACRO.to_string(),
                    value: ".*".to_string(),
                    operator: 8,
                    formula_id: "A".to_string(),
                }],
                items,
                graphs,
                triggers,
            }],
            ..Default::default()
        }
    }
}
