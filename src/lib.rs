//! # neo4j-ogm: Object-Graph Mapping over a Property Graph Protocol
//!
//! Typed in-memory entities that track their own changes, and a queue that
//! turns those changes into the minimal set of batched graph statements.
//!
//! ## Design Principles
//!
//! 1. **One owner**: the [`Graph`] owns every [`Content`]; entities, edges and
//!    relations are keys into its store
//! 2. **Diff, don't dump**: only `active` properties that differ from
//!    `loaded` are written
//! 3. **Trait-first**: [`Protocol`] is the contract between the mapper and
//!    the database
//! 4. **Ordered commits**: creates before the edges that need them, edge
//!    deletes before the nodes they hang off
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use neo4j_ogm::{Field, Graph, MemoryProtocol, NodeSchema};
//!
//! struct Person;
//! impl NodeSchema for Person {
//!     const NAME: &'static str = "Person";
//!     const LABELS: &'static [&'static str] = &["Person"];
//!     const FIELDS: &'static [Field] = &[Field::required("name")];
//! }
//!
//! # async fn example() -> neo4j_ogm::Result<()> {
//! let mut graph = Graph::new(MemoryProtocol::new());
//! graph.register_node::<Person>()?;
//!
//! let ada = graph.entity::<Person>()?;
//! ada.set("name", "Ada")?;
//! graph.attach(&[&ada])?;
//! graph.save().await?;
//!
//! let found = graph.match_nodes(["Person"])
//!     .filter(|w| w.eq("name", "Ada"))
//!     .find_one::<Person>()
//!     .await?;
//! assert!(found.is_some());
//! # Ok(())
//! # }
//! ```
//!
//! ## Protocols
//!
//! | Protocol | Description |
//! |----------|-------------|
//! | [`MemoryProtocol`] | In-memory graph for testing/embedding |
//! | [`ScriptedProtocol`] | Replays canned responses |

// ============================================================================
// Modules
// ============================================================================

pub mod model;
pub mod content;
pub mod schema;
pub mod entity;
pub mod relation;
pub mod query;
pub mod queue;
pub mod protocol;
pub mod config;
pub mod graph;

// ============================================================================
// Re-exports: Model (the DTOs)
// ============================================================================

pub use model::{
    Node, Relationship, Value, PropertyMap, ServerId,
    Direction, ZonedDateTime, IsoDuration, props,
};

// ============================================================================
// Re-exports: Mapping
// ============================================================================

pub use content::{Content, ContentKey, Event, Status, Transition};
pub use schema::{EdgeSchema, Field, Hook, NodeSchema};
pub use entity::{Edge, Element, Entity};
pub use relation::{Cardinality, Exclusion, LoadMode, Ownership, Relation, RelationSpec};

// ============================================================================
// Re-exports: Queries and persistence
// ============================================================================

pub use query::{FromValue, IntoOperand, MatchQuery, Order, Query, Rule, Term, Where};
pub use queue::{Manifest, Operations, Queue};

// ============================================================================
// Re-exports: Protocol
// ============================================================================

pub use protocol::{
    BufferedStream, MemoryProtocol, Protocol, Response, ResponseContent,
    ResponseStream, ScriptedProtocol, Signal,
};

pub use config::GraphConfig;
pub use graph::Graph;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid usage: {0}")]
    InvalidUsage(String),

    #[error("{0}")]
    InvalidTransition(Transition),

    #[error("queue is spent; merge again before run")]
    Spent,

    #[error("Multiplicity error: expected at most {expected} result(s), found {found}")]
    Multiplicity { expected: usize, found: usize },

    #[error("Compile error: {0}")]
    Compile(String),

    #[error("Remote failure: {message}\n{statement}")]
    Remote { message: String, statement: String },

    #[error("Type error: expected {expected}, got {got}")]
    TypeError { expected: String, got: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
