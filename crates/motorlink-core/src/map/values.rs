//! Typed value access
//!
//! Decoded parameter values, and readings that keep the shape of the request.

use serde::ser::{Serialize, SerializeMap, Serializer};
use std::fmt;

use super::ParamRequest;

/// A decoded controller value
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Plain integer (byte or 16-bit word)
    Number(u32),
    /// Percent of range, 0..=100
    Percent(u8),
    /// Raw bit field
    Flags(u8),
    /// Hex or ASCII rendering
    Text(String),
}

impl Value {
    /// Get as a number, returning None for text values
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(v) => Some(*v as f64),
            Value::Percent(v) | Value::Flags(v) => Some(*v as f64),
            Value::Text(_) => None,
        }
    }

    /// Get as text, returning None if not a text value
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(v) => write!(f, "{}", v),
            Value::Percent(v) => write!(f, "{}%", v),
            Value::Flags(v) => write!(f, "{:08b}", v),
            Value::Text(s) => f.write_str(s),
        }
    }
}

/// Result of a completed read, shaped like the request that produced it
#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    Value(Value),
    Bundle(Vec<(String, Reading)>),
}

impl Reading {
    /// Rebuild the request's shape from values decoded in expansion order
    ///
    /// Returns None if there are fewer values than descriptors in `shape`.
    pub fn assemble(
        shape: &ParamRequest,
        values: &mut impl Iterator<Item = Value>,
    ) -> Option<Reading> {
        match shape {
            ParamRequest::Single(_) => values.next().map(Reading::Value),
            ParamRequest::Bundle(entries) => {
                let mut out = Vec::with_capacity(entries.len());
                for (name, entry) in entries {
                    out.push((name.clone(), Reading::assemble(entry, values)?));
                }
                Some(Reading::Bundle(out))
            }
        }
    }

    /// The value of a single-parameter reading
    pub fn value(&self) -> Option<&Value> {
        match self {
            Reading::Value(v) => Some(v),
            Reading::Bundle(_) => None,
        }
    }

    /// Look up a nested reading by dotted path
    pub fn get(&self, path: &str) -> Option<&Reading> {
        let mut current = self;
        for segment in path.split('.').filter(|s| !s.is_empty()) {
            match current {
                Reading::Bundle(entries) => {
                    current = entries
                        .iter()
                        .find(|(name, _)| name == segment)
                        .map(|(_, r)| r)?;
                }
                Reading::Value(_) => return None,
            }
        }
        Some(current)
    }

    /// All values, depth-first
    pub fn values(&self) -> Vec<&Value> {
        let mut out = Vec::new();
        self.collect(&mut out);
        out
    }

    fn collect<'a>(&'a self, out: &mut Vec<&'a Value>) {
        match self {
            Reading::Value(v) => out.push(v),
            Reading::Bundle(entries) => entries.iter().for_each(|(_, r)| r.collect(out)),
        }
    }
}

impl Serialize for Reading {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Reading::Value(v) => v.serialize(serializer),
            Reading::Bundle(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (name, reading) in entries {
                    map.serialize_entry(name, reading)?;
                }
                map.end()
            }
        }
    }
}
