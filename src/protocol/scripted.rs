//! A protocol that replays canned responses, one script entry per
//! statement, and remembers what it was asked to run.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{BufferedStream, Protocol, Response, ResponseStream};
use crate::model::{PropertyMap, Value};
use crate::Result;

/// Cloning shares the script and the log.
#[derive(Debug, Clone, Default)]
pub struct ScriptedProtocol {
    inner: Arc<ScriptedInner>,
}

#[derive(Debug, Default)]
struct ScriptedInner {
    script: Mutex<VecDeque<Vec<Response>>>,
    log: Mutex<Vec<(String, PropertyMap)>>,
}

impl ScriptedProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the responses for the next statement.
    pub fn push(&self, responses: Vec<Response>) -> &Self {
        self.inner.script.lock().push_back(responses);
        self
    }

    /// Queue a successful result made of `rows`.
    pub fn push_records(&self, rows: Vec<Vec<Value>>) -> &Self {
        let mut responses: Vec<Response> = rows.into_iter().map(Response::record).collect();
        responses.push(Response::success(PropertyMap::new()));
        self.push(responses)
    }

    pub fn push_failure(&self, message: &str) -> &Self {
        self.push(vec![Response::failure(message)])
    }

    pub fn statements(&self) -> Vec<String> {
        self.inner.log.lock().iter().map(|(s, _)| s.clone()).collect()
    }

    pub fn calls(&self) -> Vec<(String, PropertyMap)> {
        self.inner.log.lock().clone()
    }
}

#[async_trait]
impl Protocol for ScriptedProtocol {
    async fn run(&self, statement: &str, params: PropertyMap) -> Result<Box<dyn ResponseStream>> {
        self.inner.log.lock().push((statement.to_string(), params));
        let responses = self.inner.script.lock().pop_front()
            .unwrap_or_else(|| vec![Response::success(PropertyMap::new())]);
        Ok(Box::new(BufferedStream::new(responses)))
    }
}
