//! Attachment lifecycle of nodes, edges and labels.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Where an element stands relative to the graph.
///
/// `Fastened` elements exist in memory only. `Inducted` ones are tracked
/// and pending creation, `Attached` ones are persisted, `Released` ones are
/// tracked and pending deletion. `Detached` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Fastened,
    Inducted,
    Attached,
    Released,
    Detached,
}

/// Something that moves an element between statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Event {
    /// `Graph::attach`
    Attach,
    /// `Graph::detach`
    Detach,
    /// A CREATE for the element was committed.
    Created,
    /// A DELETE for the element was committed.
    Deleted,
}

impl Status {
    /// Apply `event`, failing for every pair outside the lifecycle table.
    pub fn on(self, event: Event) -> Result<Status> {
        use Event::*;
        use Status::*;
        match (self, event) {
            (Fastened, Attach) => Ok(Inducted),
            (Released, Attach) => Ok(Attached),
            (Inducted, Created) => Ok(Attached),
            (Attached, Detach) => Ok(Released),
            (Released, Deleted) => Ok(Detached),
            (Inducted, Detach) => Ok(Fastened),
            (from, event) => Err(Error::InvalidTransition(Transition { from, event })),
        }
    }

    /// Whether the graph's node/edge store holds the element.
    pub fn is_tracked(self) -> bool {
        matches!(self, Status::Inducted | Status::Attached | Status::Released)
    }

    /// Tracked and not on its way out.
    pub fn is_live(self) -> bool {
        matches!(self, Status::Inducted | Status::Attached)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Fastened => "fastened",
            Status::Inducted => "inducted",
            Status::Attached => "attached",
            Status::Released => "released",
            Status::Detached => "detached",
        };
        f.write_str(name)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Event::Attach => "attach",
            Event::Detach => "detach",
            Event::Created => "create",
            Event::Deleted => "delete",
        };
        f.write_str(name)
    }
}

/// A rejected `(status, event)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: Status,
    pub event: Event,
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.from, self.event) {
            (Status::Detached, Event::Attach) => f.write_str("cannot reattach a detached element"),
            (from, event) => write!(f, "cannot {event} an element that is {from}"),
        }
    }
}
