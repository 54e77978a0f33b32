//! Low-level discovery (LLD) support.
//!
//! A plugin whose metric keys are parameterized by a dynamic entity set
//! reports each metric as `base[entity]` and, once per run, a discovery
//! payload listing exactly those entities. The backend creates item
//! instances for listed entities and retires the ones that disappear.

use serde_json::{json, Map, Value};

use crate::types::MetricValue;

/// Key for a metric of one discovered entity, e.g. `pgsql.database.size[app]`
pub fn entity_key(base: &str, entity: &str) -> String {
    format!("{}[{}]", base, entity)
}

/// Key for a scalar or discovery metric, e.g. `pgsql.database.discovery[]`
pub fn scalar_key(base: &str) -> String {
    format!("{}[]", base)
}

/// Key used in item prototypes, e.g. `pgsql.database.size[{#DATABASE}]`
pub fn prototype_key(base: &str, macro_name: &str) -> String {
    format!("{}[{}]", base, macro_name)
}

/// Entities discovered during a single run
#[derive(Debug, Clone)]
pub struct Discovery {
    macro_name: &'static str,
    entities: Vec<String>,
}

impl Discovery {
    pub fn new(macro_name: &'static str) -> Self {
        Self { macro_name, entities: Vec::new() }
    }

    pub fn add(&mut self, entity: impl Into<String>) {
        self.entities.push(entity.into());
    }

    pub fn entities(&self) -> &[String] {
        &self.entities
    }

    /// `{"data": [{"{#MACRO}": "entity"}, ...]}`
    pub fn to_json(&self) -> Value {
        let data: Vec<Value> = self
            .entities
            .iter()
            .map(|entity| {
                let mut obj = Map::new();
                obj.insert(self.macro_name.to_string(), Value::String(entity.clone()));
                Value::Object(obj)
            })
            .collect();
        json!({ "data": data })
    }

    /// The payload as the text value sent under the discovery key
    pub fn payload(&self) -> MetricValue {
        MetricValue::Text(self.to_json().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_formats() {
        assert_eq!(entity_key("pgsql.database.size", "app"), "pgsql.database.size[app]");
        assert_eq!(scalar_key("pgsql.database.discovery"), "pgsql.database.discovery[]");
        assert_eq!(
            prototype_key("pgsql.database.size", "{#DATABASE}"),
            "pgsql.database.size[{#DATABASE}]"
        );
    }

    #[test]
    fn payload_lists_entities_in_order() {
        let mut discovery = Discovery::new("{#DATABASE}");
        discovery.add("app");
        discovery.add("billing");

        let MetricValue::Text(text) = discovery.payload() else {
            panic!("discovery payload must be text");
        };
        let parsed: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            parsed,
            json!({"data": [{"{#DATABASE}": "app"}, {"{#DATABASE}": "billing"}]})
        );
    }

    #[test]
    fn empty_discovery_still_has_data_array() {
        let discovery = Discovery::new("{#DATABASE}");
        assert_eq!(discovery.to_json(), json!({"data": []}));
    }
}
