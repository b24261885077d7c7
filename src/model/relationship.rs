//! Relationship (edge) as reported by the server.

use serde::{Deserialize, Serialize};
use super::{PropertyMap, ServerId, Value};

/// Traversal direction, seen from the node that owns a relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// `(owner)-[]->(other)`
    Outgoing,
    /// `(owner)<-[]-(other)`
    Incoming,
    /// Either way round. New edges are written outgoing.
    Both,
}

impl Direction {
    /// The left and right arrow pieces of a pattern, `(a){left}[r]{right}(b)`.
    pub fn arrows(self) -> (&'static str, &'static str) {
        match self {
            Direction::Outgoing => ("-", "->"),
            Direction::Incoming => ("<-", "-"),
            Direction::Both => ("-", "-"),
        }
    }
}

/// A graph-relationship wire value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub id: ServerId,
    pub src: ServerId,
    pub dst: ServerId,
    pub rel_type: String,
    pub properties: PropertyMap,
}

impl Relationship {
    pub fn new(id: ServerId, src: ServerId, dst: ServerId, rel_type: impl Into<String>) -> Self {
        Self {
            id,
            src,
            dst,
            rel_type: rel_type.into(),
            properties: PropertyMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// The "other" end of the relationship from the given node.
    pub fn other_node(&self, from: ServerId) -> Option<ServerId> {
        if from == self.src { Some(self.dst) }
        else if from == self.dst { Some(self.src) }
        else { None }
    }
}
