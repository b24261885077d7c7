//! # Property Graph Model
//!
//! Clean DTOs for the values that cross the protocol boundary: scalars,
//! containers, graph elements as the server reports them, and temporal
//! structures.
//!
//! Design rule: this module is pure data. No I/O, no state, no async.
//! Tracked, mutable state lives in [`crate::content`].

pub mod node;
pub mod relationship;
pub mod value;
pub mod property_map;

pub use node::{Node, ServerId};
pub use relationship::{Relationship, Direction};
pub use value::{Value, ZonedDateTime, IsoDuration};
pub use property_map::{PropertyMap, props};
