//! Reports backend processes whose private anonymous memory exceeds a
//! configured threshold.
//!
//! How anonymous memory is measured depends on the kernel: from 4.5 on (and on
//! CentOS 7, which backports it) `/proc/<pid>/status` carries `RssAnon`; older
//! kernels only offer `/proc/<pid>/statm`, where resident minus shared pages
//! is used instead. The choice is made once at construction.

pub mod probe;
pub mod sample;
pub mod threshold;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;

use crate::discovery::scalar_key;
use crate::error::PluginError;
use crate::plugin::{disable, disabled_by_config, Plugin, PluginOptions, PluginState};
use crate::query::Query;
use crate::sink::MetricSink;
use crate::template::{Graph, GraphItem, Item, PluginTemplate, Trigger, ValueType};
use probe::{HostProbe, Strategy};
use sample::MemorySample;
use threshold::Threshold;

pub const NAME: &str = "memory_leak_diagnostic";
const DEFAULT_INTERVAL: u64 = 60;
const DEFAULT_CONFIG: &[(&str, &str)] = &[
    ("enabled", "false"),
    ("private_anon_mem_threshold", "1GB"),
];

const PIDS_SQL: &str = "SELECT pid FROM pg_catalog.pg_stat_activity";

pub const KEY_COUNT: &str = "pgsql.memory_leak_diagnostic.count_diff";
pub const KEY_TEXT: &str = "pgsql.memory_leak_diagnostic.msg_text";

const NAME_COUNT: &str =
    "PostgreSQL: number of pids which private anonymous memory exceeds private_anon_mem_threshold";
const NAME_TEXT: &str = "PostgreSQL: number of pids which private anonymous memory exceeds \
    private_anon_mem_threshold, text of message";

/// Everything decided at construction for an enabled plugin
#[derive(Debug, Clone)]
struct Engine {
    threshold: Threshold,
    strategy: Strategy,
    proc_root: PathBuf,
}

/// A process over the threshold
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub pid: i64,
    pub sample: MemorySample,
}

pub struct MemoryLeakDiagnostic {
    state: PluginState,
    interval: u64,
    engine: Option<Engine>,
}

impl MemoryLeakDiagnostic {
    pub fn new(overrides: &HashMap<String, String>, host: HostProbe) -> Self {
        let options = PluginOptions::new(NAME, DEFAULT_INTERVAL, DEFAULT_CONFIG, overrides);
        let interval = options.interval().unwrap_or(DEFAULT_INTERVAL);

        match Self::configure(&options, &host) {
            Ok(Some(engine)) => Self { state: PluginState::Enabled, interval, engine: Some(engine) },
            Ok(None) => Self { state: disabled_by_config(NAME), interval, engine: None },
            Err(e) => Self { state: disable(NAME, &e), interval, engine: None },
        }
    }

    fn configure(options: &PluginOptions, host: &HostProbe) -> crate::error::Result<Option<Engine>> {
        options.interval()?;
        if !options.boolean("enabled")? {
            return Ok(None);
        }
        if !host.is_linux() {
            return Err(PluginError::UnsupportedPlatform {
                plugin: NAME.to_string(),
                required: "linux".to_string(),
            });
        }
        let threshold = Threshold::parse(options.get("private_anon_mem_threshold")?)?;
        let strategy = host.strategy()?;

        Ok(Some(Engine {
            threshold,
            strategy,
            proc_root: host.proc_root.clone(),
        }))
    }

    pub fn threshold(&self) -> Option<Threshold> {
        self.engine.as_ref().map(|e| e.threshold)
    }

    pub fn strategy(&self) -> Option<Strategy> {
        self.engine.as_ref().map(|e| e.strategy)
    }

    /// Inspect every pid and keep the ones above the threshold.
    /// Pids that cannot be read any more are skipped.
    pub async fn violations(&self, pids: &[i64]) -> Vec<Violation> {
        let Some(engine) = self.engine.as_ref() else {
            return Vec::new();
        };

        let mut violations = Vec::new();
        for &pid in pids {
            let sample = match engine.strategy.read(&engine.proc_root, pid).await {
                Ok(sample) => sample,
                Err(e) => {
                    tracing::debug!(plugin = NAME, pid, error = %e, "Skipping process");
                    continue;
                }
            };
            if sample.anonymous() > engine.threshold.bytes {
                violations.push(Violation { pid, sample });
            }
        }
        violations
    }
}

#[async_trait]
impl Plugin for MemoryLeakDiagnostic {
    fn name(&self) -> &str { NAME }

    fn interval_secs(&self) -> u64 { self.interval }

    fn state(&self) -> &PluginState { &self.state }

    async fn run(&mut self, query: &dyn Query, sink: &dyn MetricSink) -> Result<()> {
        let Some(threshold) = self.threshold() else {
            return Ok(());
        };

        let rows = query.query(PIDS_SQL, &[], None).await?;
        let pids = rows
            .iter()
            .map(|row| row.int(0))
            .collect::<Result<Vec<i64>>>()?;

        let violations = self.violations(&pids).await;
        let text: String = violations
            .iter()
            .map(|v| v.sample.describe(v.pid, threshold.bytes))
            .collect();

        tracing::debug!(plugin = NAME, pids = pids.len(), violations = violations.len(), "Memory check done");

        sink.send(&scalar_key(KEY_COUNT), (violations.len() as i64).into()).await?;
        sink.send(&scalar_key(KEY_TEXT), text.into()).await?;
        Ok(())
    }

    fn template(&self) -> PluginTemplate {
        PluginTemplate {
            items: vec![
                Item::new(NAME_COUNT, scalar_key(KEY_COUNT), self.interval),
                Item::new(NAME_TEXT, scalar_key(KEY_TEXT), self.interval)
                    .value_type(ValueType::Text),
            ],
            graphs: vec![Graph {
                name: NAME_COUNT.to_string(),
                graph_type: None,
                items: vec![GraphItem::new(scalar_key(KEY_COUNT), "EEEEEE")],
            }],
            triggers: vec![Trigger {
                name: format!("{} on {{HOSTNAME}}. {{ITEM.LASTVALUE}}", NAME_COUNT),
                expression: format!("{{#TEMPLATE:{}.strlen()}}>1", scalar_key(KEY_TEXT)),
            }],
            discovery_rules: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Value;
    use crate::testing::{RecordingSink, StaticQuery};
    use crate::types::MetricValue;
    use std::path::Path;

    const MB: u64 = 1024 * 1024;

    struct FakeHost {
        dir: tempfile::TempDir,
    }

    impl FakeHost {
        fn new(kernel: &str, os_release: &str) -> Self {
            let dir = tempfile::tempdir().unwrap();
            std::fs::create_dir_all(dir.path().join("sys/kernel")).unwrap();
            std::fs::write(dir.path().join("sys/kernel/osrelease"), format!("{}\n", kernel)).unwrap();
            std::fs::write(dir.path().join("os-release"), os_release).unwrap();
            Self { dir }
        }

        fn root(&self) -> &Path {
            self.dir.path()
        }

        fn probe(&self) -> HostProbe {
            HostProbe {
                os: "linux".into(),
                proc_root: self.root().to_path_buf(),
                os_release: self.root().join("os-release"),
                page_size: 4096,
            }
        }

        fn status(&self, pid: i64, anon_kb: u64) {
            let dir = self.root().join(pid.to_string());
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(
                dir.join("status"),
                format!(
                    "Name:\tpostgres\nVmRSS:\t{} kB\nRssAnon:\t{} kB\nRssFile:\t100 kB\nRssShmem:\t50 kB\n",
                    anon_kb + 150,
                    anon_kb
                ),
            )
            .unwrap();
        }

        fn statm(&self, pid: i64, resident_pages: u64, shared_pages: u64) {
            let dir = self.root().join(pid.to_string());
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(
                dir.join("statm"),
                format!("90000 {} {} 100 0 2000 0\n", resident_pages, shared_pages),
            )
            .unwrap();
        }
    }

    fn enabled(threshold: &str) -> HashMap<String, String> {
        HashMap::from([
            ("enabled".to_string(), "true".to_string()),
            ("private_anon_mem_threshold".to_string(), threshold.to_string()),
        ])
    }

    fn pids(pids: &[i64]) -> StaticQuery {
        StaticQuery::new().rows(
            "pg_stat_activity",
            pids.iter().map(|p| vec![Value::Int(*p)]).collect(),
        )
    }

    #[test]
    fn disabled_by_default() {
        let host = FakeHost::new("5.10.0", "ID=debian\nVERSION_ID=\"11\"\n");
        let plugin = MemoryLeakDiagnostic::new(&HashMap::new(), host.probe());
        assert!(!plugin.is_enabled());
        assert!(plugin.strategy().is_none());
        assert_eq!(plugin.interval_secs(), 60);
    }

    #[test]
    fn non_linux_is_disabled() {
        let host = FakeHost::new("5.10.0", "ID=debian\n");
        let mut probe = host.probe();
        probe.os = "freebsd".into();
        let plugin = MemoryLeakDiagnostic::new(&enabled("1GB"), probe);
        let PluginState::Disabled { reason } = plugin.state() else {
            panic!("expected disabled");
        };
        assert!(reason.contains("linux"));
    }

    #[test]
    fn unreadable_os_release_disables() {
        let host = FakeHost::new("5.10.0", "ID=debian\n");
        let mut probe = host.probe();
        probe.os_release = host.root().join("nope");
        let plugin = MemoryLeakDiagnostic::new(&enabled("1GB"), probe);
        assert!(!plugin.is_enabled());
    }

    #[test]
    fn missing_threshold_number_disables() {
        let host = FakeHost::new("5.10.0", "ID=debian\n");
        let plugin = MemoryLeakDiagnostic::new(&enabled("GB"), host.probe());
        assert!(!plugin.is_enabled());
    }

    #[test]
    fn invalid_unit_keeps_plugin_enabled() {
        let host = FakeHost::new("5.10.0", "ID=debian\n");
        let plugin = MemoryLeakDiagnostic::new(&enabled("3XB"), host.probe());
        assert!(plugin.is_enabled());
        let threshold = plugin.threshold().unwrap();
        assert!(threshold.unit_fallback);
        assert_eq!(threshold.bytes, 3 * 1024 * MB);
    }

    #[test]
    fn strategy_follows_kernel_and_distribution() {
        let host = FakeHost::new("4.4.0-210-generic", "ID=ubuntu\nVERSION_ID=\"16.04\"\n");
        let plugin = MemoryLeakDiagnostic::new(&enabled("1GB"), host.probe());
        assert_eq!(plugin.strategy(), Some(Strategy::Legacy { page_size: 4096 }));

        let host = FakeHost::new("5.10.0", "ID=ubuntu\nVERSION_ID=\"22.04\"\n");
        let plugin = MemoryLeakDiagnostic::new(&enabled("1GB"), host.probe());
        assert_eq!(plugin.strategy(), Some(Strategy::Modern));

        let host = FakeHost::new("4.4.0", "ID=\"centos\"\nVERSION_ID=\"7\"\n");
        let plugin = MemoryLeakDiagnostic::new(&enabled("1GB"), host.probe());
        assert_eq!(plugin.strategy(), Some(Strategy::Modern));
    }

    #[tokio::test]
    async fn no_violations_sends_zero_and_empty_text() {
        let host = FakeHost::new("5.10.0", "ID=debian\n");
        host.status(100, 1024);
        host.status(101, 2048);
        let mut plugin = MemoryLeakDiagnostic::new(&enabled("1GB"), host.probe());

        let sink = RecordingSink::new();
        plugin.run(&pids(&[100, 101]), &sink).await.unwrap();

        assert_eq!(
            sink.sent(),
            vec![
                ("pgsql.memory_leak_diagnostic.count_diff[]".to_string(), MetricValue::Int(0)),
                ("pgsql.memory_leak_diagnostic.msg_text[]".to_string(), MetricValue::Text(String::new())),
            ]
        );
    }

    #[tokio::test]
    async fn one_violation_one_line() {
        let host = FakeHost::new("5.10.0", "ID=debian\n");
        host.status(100, 1024);
        host.status(200, 20 * 1024);
        let mut plugin = MemoryLeakDiagnostic::new(&enabled("10MB"), host.probe());

        let sink = RecordingSink::new();
        plugin.run(&pids(&[100, 200]), &sink).await.unwrap();

        assert_eq!(sink.value("pgsql.memory_leak_diagnostic.count_diff[]"), Some(MetricValue::Int(1)));
        let Some(MetricValue::Text(text)) = sink.value("pgsql.memory_leak_diagnostic.msg_text[]") else {
            panic!("text metric missing");
        };
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 1);
        assert_eq!(
            lines[0],
            format!(
                "pid: 200,  RssAnon {} more than {}, VmRSS {}, RssFile {}, RssShmem {}",
                20 * MB,
                10 * MB,
                (20 * 1024 + 150) * 1024,
                100 * 1024,
                50 * 1024
            )
        );
    }

    #[tokio::test]
    async fn vanished_pid_is_skipped() {
        let host = FakeHost::new("5.10.0", "ID=debian\n");
        host.status(300, 20 * 1024);
        let mut plugin = MemoryLeakDiagnostic::new(&enabled("10MB"), host.probe());

        let sink = RecordingSink::new();
        // 999 was listed but has no /proc entry
        plugin.run(&pids(&[999, 300]), &sink).await.unwrap();

        assert_eq!(sink.value("pgsql.memory_leak_diagnostic.count_diff[]"), Some(MetricValue::Int(1)));
        let Some(MetricValue::Text(text)) = sink.value("pgsql.memory_leak_diagnostic.msg_text[]") else {
            panic!("text metric missing");
        };
        assert!(!text.contains("999"));
        assert!(text.starts_with("pid: 300,"));
    }

    #[tokio::test]
    async fn legacy_strategy_uses_resident_minus_shared() {
        let host = FakeHost::new("3.10.0-1160.el7.x86_64", "ID=\"rhel\"\nVERSION_ID=\"7.9\"\n");
        // 3000 pages resident, 500 shared: 2500 * 4096 = 10_240_000 bytes private
        host.statm(10, 3000, 500);
        // 2000 resident, 1900 shared: well under
        host.statm(11, 2000, 1900);
        let mut plugin = MemoryLeakDiagnostic::new(&enabled("9MB"), host.probe());
        assert_eq!(plugin.strategy(), Some(Strategy::Legacy { page_size: 4096 }));

        let sink = RecordingSink::new();
        plugin.run(&pids(&[10, 11]), &sink).await.unwrap();

        assert_eq!(sink.value("pgsql.memory_leak_diagnostic.count_diff[]"), Some(MetricValue::Int(1)));
        assert_eq!(
            sink.value("pgsql.memory_leak_diagnostic.msg_text[]"),
            Some(MetricValue::Text(format!(
                "pid: 10,  RES {} - SHR {} more than {}\n",
                3000 * 4096,
                500 * 4096,
                9 * MB
            )))
        );
    }

    #[tokio::test]
    async fn legacy_strategy_skips_pid_without_statm() {
        let host = FakeHost::new("3.10.0-1160.el7.x86_64", "ID=\"rhel\"\nVERSION_ID=\"7.9\"\n");
        host.statm(10, 3000, 500);
        // exited between listing and reading: only a stale status file is left
        host.status(12, 64 * 1024);
        let mut plugin = MemoryLeakDiagnostic::new(&enabled("9MB"), host.probe());

        let sink = RecordingSink::new();
        plugin.run(&pids(&[12, 13, 10]), &sink).await.unwrap();

        assert_eq!(sink.value("pgsql.memory_leak_diagnostic.count_diff[]"), Some(MetricValue::Int(1)));
        let Some(MetricValue::Text(text)) = sink.value("pgsql.memory_leak_diagnostic.msg_text[]") else {
            panic!("text metric missing");
        };
        assert_eq!(text.lines().count(), 1);
        assert!(text.starts_with("pid: 10,"));
    }

    #[tokio::test]
    async fn repeated_runs_are_identical() {
        let host = FakeHost::new("5.10.0", "ID=debian\n");
        host.status(1, 4096);
        host.status(2, 16 * 1024);
        let mut plugin = MemoryLeakDiagnostic::new(&enabled("2MB"), host.probe());
        let query = pids(&[1, 2]);

        let first = RecordingSink::new();
        plugin.run(&query, &first).await.unwrap();
        let second = RecordingSink::new();
        plugin.run(&query, &second).await.unwrap();
        assert_eq!(first.sent(), second.sent());
    }

    #[test]
    fn template_declares_count_and_text_items() {
        let host = FakeHost::new("5.10.0", "ID=debian\n");
        let plugin = MemoryLeakDiagnostic::new(&enabled("1GB"), host.probe());
        let template = plugin.template();
        assert_eq!(template.items.len(), 2);
        assert_eq!(template.items[1].value_type, ValueType::Text);
        assert_eq!(
            template.triggers[0].expression,
            "{#TEMPLATE:pgsql.memory_leak_diagnostic.msg_text[].strlen()}>1"
        );
    }
}
