pub mod config;
pub mod discovery;
pub mod error;
pub mod plugin;
pub mod plugins;
pub mod query;
pub mod scheduler;
pub mod sink;
pub mod template;

#[cfg(test)]
pub(crate) mod testing;

/// Common types used across modules
pub mod types {
    use serde::Serialize;

    /// A value reported to the metrics sink
    #[derive(Debug, Clone, PartialEq, Serialize)]
    #[serde(untagged)]
    pub enum MetricValue {
        Int(i64),
        Float(f64),
        Text(String),
    }

    impl std::fmt::Display for MetricValue {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                MetricValue::Int(v) => write!(f, "{}", v),
                MetricValue::Float(v) => write!(f, "{}", v),
                MetricValue::Text(v) => write!(f, "{}", v),
            }
        }
    }

    impl From<i64> for MetricValue {
        fn from(v: i64) -> Self { MetricValue::Int(v) }
    }

    impl From<u64> for MetricValue {
        fn from(v: u64) -> Self { MetricValue::Int(i64::try_from(v).unwrap_or(i64::MAX)) }
    }

    impl From<f64> for MetricValue {
        fn from(v: f64) -> Self { MetricValue::Float(v) }
    }

    impl From<String> for MetricValue {
        fn from(v: String) -> Self { MetricValue::Text(v) }
    }

    impl From<&str> for MetricValue {
        fn from(v: &str) -> Self { MetricValue::Text(v.to_string()) }
    }
}
