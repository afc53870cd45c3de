//! Minimal telemetry data model for the processor contract.
//!
//! The pipeline hands the processor batches of spans and metric data points;
//! each carries a mutable attribute bag plus the batch-level resource
//! attributes. Only the shapes needed to read and rewrite attributes are
//! modeled here.

use std::{collections::BTreeMap, fmt};

/// An attribute value. String is the only variant the resolver acts on; the
/// others pass through untouched.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Str(String),
    Int(i64),
    Double(f64),
    Bool(bool),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => f.write_str(s),
            Value::Int(i) => write!(f, "{i}"),
            Value::Double(d) => write!(f, "{d}"),
            Value::Bool(b) => write!(f, "{b}"),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Double(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

/// A mutable, string-keyed attribute bag.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Attributes(BTreeMap<String, Value>);

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// The attribute's string value, or `None` if absent or not a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn put(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Attributes {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        )
    }
}

/// One span in a traces batch.
#[derive(Clone, Debug, Default)]
pub struct Span {
    pub name: String,
    pub attributes: Attributes,
}

/// A traces batch sharing one resource attribute bag.
#[derive(Clone, Debug, Default)]
pub struct TraceBatch {
    pub resource: Attributes,
    pub spans: Vec<Span>,
}

/// One data point of a metric.
#[derive(Clone, Debug, Default)]
pub struct DataPoint {
    pub attributes: Attributes,
}

#[derive(Clone, Debug, Default)]
pub struct Metric {
    pub name: String,
    pub data_points: Vec<DataPoint>,
}

/// A metrics batch sharing one resource attribute bag.
#[derive(Clone, Debug, Default)]
pub struct MetricBatch {
    pub resource: Attributes,
    pub metrics: Vec<Metric>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_lookup_ignores_other_value_types() {
        let attrs: Attributes = [
            ("service", Value::from("cart")),
            ("retries", Value::from(3_i64)),
        ]
        .into_iter()
        .collect();

        assert_eq!(attrs.get_str("service"), Some("cart"));
        assert_eq!(attrs.get_str("retries"), None);
        assert_eq!(attrs.get_str("absent"), None);
    }

    #[test]
    fn put_overwrites_existing_values() {
        let mut attrs = Attributes::new();
        attrs.put("service", "10.1.0.5");
        attrs.put("service", "cart");

        assert_eq!(attrs.get_str("service"), Some("cart"));
        assert_eq!(attrs.len(), 1);
    }

    #[test]
    fn values_render_for_logging() {
        assert_eq!(Value::from("x").to_string(), "x");
        assert_eq!(Value::from(7_i64).to_string(), "7");
        assert_eq!(Value::from(true).to_string(), "true");
    }
}
