//! Universal value type matching Neo4j's type system.

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Node, PropertyMap, Relationship};
use crate::{Error, Result};

/// Neo4j-compatible value type.
///
/// Covers the domain values an entity field can hold plus the structures
/// the protocol hands back:
/// - Scalars: Bool, Int, Float, String, Bytes
/// - Containers: List, Map
/// - Graph: Node, Relationship
/// - Temporal: Date, DateTime, LocalDateTime, Duration, and the zoned
///   wire structure which [`Value::decode`] turns into `DateTime`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(PropertyMap),

    // Graph types
    Node(Box<Node>),
    Relationship(Box<Relationship>),

    // Temporal types
    Date(NaiveDate),
    DateTime(DateTime<Utc>),
    LocalDateTime(NaiveDateTime),
    Duration(IsoDuration),
    ZonedDateTime(ZonedDateTime),
}

/// ISO 8601 duration (months, days, seconds, nanoseconds)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IsoDuration {
    pub months: i64,
    pub days: i64,
    pub seconds: i64,
    pub nanoseconds: i32,
}

/// Timezone-aware timestamp as it travels on the wire: seconds since the
/// epoch (UTC), sub-second nanoseconds, and the zone name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZonedDateTime {
    pub seconds: i64,
    pub nanoseconds: u32,
    pub zone: String,
}

impl ZonedDateTime {
    pub fn from_utc(dt: &DateTime<Utc>) -> Self {
        Self {
            seconds: dt.timestamp(),
            nanoseconds: dt.timestamp_subsec_nanos(),
            zone: "UTC".into(),
        }
    }

    /// The instant this structure denotes. The zone name only affects
    /// presentation, so it is dropped.
    pub fn to_utc(&self) -> Result<DateTime<Utc>> {
        DateTime::<Utc>::from_timestamp(self.seconds, self.nanoseconds).ok_or_else(|| {
            Error::TypeError {
                expected: "timestamp within chrono range".into(),
                got: format!("{}s+{}ns [{}]", self.seconds, self.nanoseconds, self.zone),
            }
        })
    }
}

// ============================================================================
// Type checking
// ============================================================================

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Bool(_) => "BOOLEAN",
            Value::Int(_) => "INTEGER",
            Value::Float(_) => "FLOAT",
            Value::String(_) => "STRING",
            Value::Bytes(_) => "BYTES",
            Value::List(_) => "LIST",
            Value::Map(_) => "MAP",
            Value::Node(_) => "NODE",
            Value::Relationship(_) => "RELATIONSHIP",
            Value::Date(_) => "DATE",
            Value::DateTime(_) => "DATETIME",
            Value::LocalDateTime(_) => "LOCAL_DATETIME",
            Value::Duration(_) => "DURATION",
            Value::ZonedDateTime(_) => "DATETIME",
        }
    }

    pub fn is_null(&self) -> bool { matches!(self, Value::Null) }
    pub fn is_numeric(&self) -> bool { matches!(self, Value::Int(_) | Value::Float(_)) }
    pub fn is_string(&self) -> bool { matches!(self, Value::String(_)) }

    /// Structured values can be expanded into per-key statement fragments.
    pub fn is_structured(&self) -> bool {
        matches!(self, Value::Map(_))
    }

    /// Attempt to extract as i64
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    /// Attempt to extract as f64
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Attempt to extract as &str
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&PropertyMap> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }
}

// ============================================================================
// Wire <-> domain
// ============================================================================

impl Value {
    /// Convert a value received from the protocol into its domain form.
    ///
    /// Zoned timestamps become `DateTime<Utc>`; containers and the property
    /// maps of graph elements are converted recursively.
    pub fn decode(self) -> Result<Value> {
        Ok(match self {
            Value::ZonedDateTime(z) => Value::DateTime(z.to_utc()?),
            Value::List(items) => Value::List(
                items.into_iter().map(Value::decode).collect::<Result<_>>()?,
            ),
            Value::Map(map) => Value::Map(decode_map(map)?),
            Value::Node(mut node) => {
                node.properties = decode_map(std::mem::take(&mut node.properties))?;
                Value::Node(node)
            }
            Value::Relationship(mut rel) => {
                rel.properties = decode_map(std::mem::take(&mut rel.properties))?;
                Value::Relationship(rel)
            }
            other => other,
        })
    }

    /// Convert a domain value into the form sent as a statement parameter.
    pub fn encode(&self) -> Value {
        match self {
            Value::DateTime(dt) => Value::ZonedDateTime(ZonedDateTime::from_utc(dt)),
            Value::List(items) => Value::List(items.iter().map(Value::encode).collect()),
            Value::Map(map) => Value::Map(encode_map(map)),
            other => other.clone(),
        }
    }
}

pub(crate) fn decode_map(map: PropertyMap) -> Result<PropertyMap> {
    map.into_iter()
        .map(|(k, v)| Ok((k, v.decode()?)))
        .collect()
}

pub(crate) fn encode_map(map: &PropertyMap) -> PropertyMap {
    map.iter().map(|(k, v)| (k.clone(), v.encode())).collect()
}

// ============================================================================
// Conversions (From impls)
// ============================================================================

impl From<bool> for Value { fn from(v: bool) -> Self { Value::Bool(v) } }
impl From<i32> for Value { fn from(v: i32) -> Self { Value::Int(v as i64) } }
impl From<i64> for Value { fn from(v: i64) -> Self { Value::Int(v) } }
impl From<f64> for Value { fn from(v: f64) -> Self { Value::Float(v) } }
impl From<String> for Value { fn from(v: String) -> Self { Value::String(v) } }
impl From<&str> for Value { fn from(v: &str) -> Self { Value::String(v.to_owned()) } }
impl From<DateTime<Utc>> for Value { fn from(v: DateTime<Utc>) -> Self { Value::DateTime(v) } }
impl From<NaiveDate> for Value { fn from(v: NaiveDate) -> Self { Value::Date(v) } }
impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self { Value::List(v.into_iter().map(Into::into).collect()) }
}
impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self { v.map(Into::into).unwrap_or(Value::Null) }
}

// ============================================================================
// Display
// ============================================================================

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::String(s) => write!(f, "\"{}\"", s.replace('"', "\\\"")),
            Value::Bytes(b) => write!(f, "<bytes[{}]>", b.len()),
            Value::List(l) => {
                write!(f, "[")?;
                for (i, v) in l.iter().enumerate() {
                    if i > 0 { write!(f, ", ")?; }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
            Value::Map(m) => {
                write!(f, "{{")?;
                for (i, (k, v)) in m.iter().enumerate() {
                    if i > 0 { write!(f, ", ")?; }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
            Value::Node(n) => write!(f, "({}:{})", n.id, n.labels.join(":")),
            Value::Relationship(r) => write!(f, "({})-[{}:{}]->({})", r.src, r.id, r.rel_type, r.dst),
            Value::Date(d) => write!(f, "{d}"),
            Value::DateTime(dt) => write!(f, "{dt}"),
            Value::LocalDateTime(dt) => write!(f, "{dt}"),
            Value::Duration(d) => write!(f, "P{}M{}DT{}S", d.months, d.days, d.seconds),
            Value::ZonedDateTime(z) => write!(f, "{}.{:09}[{}]", z.seconds, z.nanoseconds, z.zone),
        }
    }
}

// ============================================================================
// Comparison (Neo4j ordering rules)
// ============================================================================

impl Value {
    /// Neo4j comparison. Returns None for incompatible types (like SQL NULL behavior).
    pub fn neo4j_cmp(&self, other: &Value) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => None,
            (Value::Bool(a), Value::Bool(b)) => a.partial_cmp(b),
            (Value::Int(a), Value::Int(b)) => a.partial_cmp(b),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Value::String(a), Value::String(b)) => a.partial_cmp(b),
            (Value::DateTime(a), Value::DateTime(b)) => a.partial_cmp(b),
            (Value::ZonedDateTime(a), Value::ZonedDateTime(b)) => {
                (a.seconds, a.nanoseconds).partial_cmp(&(b.seconds, b.nanoseconds))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_from() {
        assert_eq!(Value::from("hello"), Value::String("hello".into()));
        assert_eq!(Value::from(42), Value::Int(42));
        assert_eq!(Value::from(2.5), Value::Float(2.5));
        assert_eq!(Value::from(true), Value::Bool(true));
        assert_eq!(Value::from(None::<i64>), Value::Null);
    }

    #[test]
    fn test_null_comparison() {
        assert_eq!(Value::Null.neo4j_cmp(&Value::Null), None);
        assert_eq!(Value::Null.neo4j_cmp(&Value::Int(1)), None);
    }

    #[test]
    fn test_numeric_comparison() {
        assert_eq!(
            Value::Int(1).neo4j_cmp(&Value::Float(1.5)),
            Some(std::cmp::Ordering::Less)
        );
    }

    #[test]
    fn test_zoned_timestamp_decodes_to_utc() {
        let wire = Value::ZonedDateTime(ZonedDateTime {
            seconds: 1_700_000_000,
            nanoseconds: 5,
            zone: "Europe/Berlin".into(),
        });
        let Value::DateTime(dt) = wire.decode().unwrap() else {
            panic!("expected a DateTime");
        };
        assert_eq!(dt.timestamp(), 1_700_000_000);
        assert_eq!(dt.timestamp_subsec_nanos(), 5);
    }

    #[test]
    fn test_datetime_encodes_to_zoned_structure() {
        let dt = DateTime::<Utc>::from_timestamp(42, 7).unwrap();
        let wire = Value::List(vec![Value::DateTime(dt)]).encode();
        assert_eq!(
            wire,
            Value::List(vec![Value::ZonedDateTime(ZonedDateTime {
                seconds: 42,
                nanoseconds: 7,
                zone: "UTC".into(),
            })])
        );
        assert_eq!(wire.decode().unwrap(), Value::List(vec![Value::DateTime(dt)]));
    }

    #[test]
    fn test_decode_reaches_node_properties() {
        let node = Node::new(super::super::ServerId(1)).with_property(
            "born",
            Value::ZonedDateTime(ZonedDateTime { seconds: 0, nanoseconds: 0, zone: "UTC".into() }),
        );
        let Value::Node(node) = Value::Node(Box::new(node)).decode().unwrap() else {
            panic!("expected a node");
        };
        assert!(matches!(node.get("born"), Some(Value::DateTime(_))));
    }
}
