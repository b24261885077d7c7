//! Protocol collaborator: the seam between the mapper and a database.
//!
//! The mapper only needs to run a statement with parameters and pull the
//! responses back. Everything else (connections, authentication, the binary
//! encoding) belongs to the collaborator behind [`Protocol`].
//!
//! Two implementations ship with the crate:
//!
//! - [`MemoryProtocol`]: an in-memory graph that executes the statement
//!   dialect the mapper emits.
//! - [`ScriptedProtocol`]: replays canned responses.

mod dialect;
pub mod memory;
pub mod scripted;

use std::collections::VecDeque;

use async_trait::async_trait;

use crate::model::{PropertyMap, Value};
use crate::Result;

pub use memory::MemoryProtocol;
pub use scripted::ScriptedProtocol;

/// Terminal or streaming marker of one response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    Record,
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseContent {
    /// One row, in wire form.
    Record(Vec<Value>),
    /// Statement summary.
    Success(PropertyMap),
    Failure { message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub signal: Signal,
    pub content: ResponseContent,
}

impl Response {
    pub fn record(fields: Vec<Value>) -> Self {
        Self { signal: Signal::Record, content: ResponseContent::Record(fields) }
    }

    pub fn success(summary: PropertyMap) -> Self {
        Self { signal: Signal::Success, content: ResponseContent::Success(summary) }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self { signal: Signal::Failure, content: ResponseContent::Failure { message: message.into() } }
    }
}

/// Responses of one running statement.
#[async_trait]
pub trait ResponseStream: Send {
    /// Responses up to and including the first whose signal is in `until`,
    /// or everything left when none matches. Empty once exhausted.
    async fn pull(&mut self, until: &[Signal]) -> Result<Vec<Response>>;
}

/// A database reachable by statement.
#[async_trait]
pub trait Protocol: Send + Sync + 'static {
    /// Start running `statement`. Parameters are in wire form.
    async fn run(&self, statement: &str, params: PropertyMap) -> Result<Box<dyn ResponseStream>>;
}

/// A stream over responses that are already in memory.
#[derive(Debug, Default)]
pub struct BufferedStream {
    pending: VecDeque<Response>,
}

impl BufferedStream {
    pub fn new(responses: impl IntoIterator<Item = Response>) -> Self {
        Self { pending: responses.into_iter().collect() }
    }
}

#[async_trait]
impl ResponseStream for BufferedStream {
    async fn pull(&mut self, until: &[Signal]) -> Result<Vec<Response>> {
        let mut out = Vec::new();
        while let Some(response) = self.pending.pop_front() {
            let stop = until.contains(&response.signal);
            out.push(response);
            if stop {
                break;
            }
        }
        Ok(out)
    }
}
