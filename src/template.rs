//! Declarative description of what a plugin reports, used to generate the
//! backend template. Pure data: nothing here runs during metric collection.

use serde::Serialize;
use serde_json::{json, Value};

/// Placeholder for the template name inside trigger expressions
pub const TEMPLATE_MACRO: &str = "#TEMPLATE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Units {
    #[serde(rename = "")]
    None,
    #[serde(rename = "b")]
    Bytes,
}

/// Backend value type codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    NumericUnsigned,
    Text,
}

impl ValueType {
    pub fn code(self) -> u8 {
        match self {
            ValueType::NumericUnsigned => 3,
            ValueType::Text => 4,
        }
    }
}

impl Serialize for ValueType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Item {
    pub name: String,
    pub key: String,
    pub units: Units,
    pub value_type: ValueType,
    /// Polling delay expression, seconds or a backend interval string
    pub delay: String,
}

impl Item {
    pub fn new(name: impl Into<String>, key: impl Into<String>, delay: u64) -> Self {
        Self {
            name: name.into(),
            key: key.into(),
            units: Units::None,
            value_type: ValueType::NumericUnsigned,
            delay: delay.to_string(),
        }
    }

    pub fn units(mut self, units: Units) -> Self {
        self.units = units;
        self
    }

    pub fn value_type(mut self, value_type: ValueType) -> Self {
        self.value_type = value_type;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphItem {
    pub key: String,
    pub color: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drawtype: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub yaxisside: Option<u8>,
}

impl GraphItem {
    pub fn new(key: impl Into<String>, color: &str) -> Self {
        Self { key: key.into(), color: color.to_string(), drawtype: None, yaxisside: None }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Graph {
    pub name: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub graph_type: Option<u8>,
    pub items: Vec<GraphItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trigger {
    pub name: String,
    pub expression: String,
}

/// Filter condition of a discovery rule
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Condition {
    #[serde(rename = "macro")]
    pub macro_name: String,
    pub value: String,
    pub operator: u8,
    #[serde(rename = "formulaid")]
    pub formula_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveryRule {
    pub name: String,
    pub key: String,
    pub conditions: Vec<Condition>,
    pub items: Vec<Item>,
    pub graphs: Vec<Graph>,
    pub triggers: Vec<Trigger>,
}

/// Everything one plugin contributes to the template
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PluginTemplate {
    pub items: Vec<Item>,
    pub graphs: Vec<Graph>,
    pub triggers: Vec<Trigger>,
    pub discovery_rules: Vec<DiscoveryRule>,
}

impl PluginTemplate {
    pub fn render(&self, builder: &mut dyn TemplateBuilder) {
        for item in &self.items {
            builder.item(item);
        }
        for graph in &self.graphs {
            builder.graph(graph);
        }
        for trigger in &self.triggers {
            builder.trigger(trigger);
        }
        for rule in &self.discovery_rules {
            builder.discovery_rule(rule);
        }
    }
}

/// Serializes template records into a concrete backend format
pub trait TemplateBuilder {
    fn item(&mut self, item: &Item);
    fn graph(&mut self, graph: &Graph);
    fn trigger(&mut self, trigger: &Trigger);
    fn discovery_rule(&mut self, rule: &DiscoveryRule);
}

/// Builds the template as a JSON document
pub struct JsonTemplate {
    name: String,
    items: Vec<Value>,
    graphs: Vec<Value>,
    triggers: Vec<Value>,
    discovery_rules: Vec<Value>,
}

impl JsonTemplate {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            items: Vec::new(),
            graphs: Vec::new(),
            triggers: Vec::new(),
            discovery_rules: Vec::new(),
        }
    }

    fn expand(&self, trigger: &Trigger) -> Value {
        json!({
            "name": trigger.name,
            "expression": trigger.expression.replace(TEMPLATE_MACRO, &self.name),
        })
    }

    pub fn finish(self) -> Value {
        json!({
            "template": self.name,
            "items": self.items,
            "graphs": self.graphs,
            "triggers": self.triggers,
            "discovery_rules": self.discovery_rules,
        })
    }
}

impl TemplateBuilder for JsonTemplate {
    fn item(&mut self, item: &Item) {
        self.items.push(json!(item));
    }

    fn graph(&mut self, graph: &Graph) {
        self.graphs.push(json!(graph));
    }

    fn trigger(&mut self, trigger: &Trigger) {
        let value = self.expand(trigger);
        self.triggers.push(value);
    }

    fn discovery_rule(&mut self, rule: &DiscoveryRule) {
        let triggers: Vec<Value> = rule.triggers.iter().map(|t| self.expand(t)).collect();
        self.discovery_rules.push(json!({
            "name": rule.name,
            "key": rule.key,
            "conditions": rule.conditions,
            "items": rule.items,
            "graphs": rule.graphs,
            "triggers": triggers,
        }));
    }
}
