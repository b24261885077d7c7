//! PropertyMap: the key-value store on nodes and relationships.
//!
//! Keys keep their insertion order, so an expanded parameter lists its
//! entries the way the map was declared. Equality ignores order.

use indexmap::IndexMap;
use super::Value;

/// A map of property names to values.
pub type PropertyMap = IndexMap<String, Value>;

/// Build a PropertyMap from (key, value) pairs.
pub fn props<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> PropertyMap
where
    K: Into<String>,
    V: Into<Value>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect()
}

impl From<PropertyMap> for Value {
    fn from(map: PropertyMap) -> Self {
        Value::Map(map)
    }
}
