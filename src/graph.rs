//! The composition root: owns the content store, the persistence queue and
//! the protocol collaborator.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::GraphConfig;
use crate::content::{Content, ContentKey, Event, Status, Store};
use crate::entity::{Edge, Element, Entity};
use crate::model::{Direction, PropertyMap, Value};
use crate::protocol::Protocol;
use crate::query::{MatchQuery, Query, Rule};
use crate::queue::{Manifest, Queue};
use crate::schema::{EdgeSchema, NodeSchema};
use crate::{Error, Result};

#[derive(Debug)]
pub struct Graph<P: Protocol> {
    protocol: P,
    store: Arc<RwLock<Store>>,
    queue: Queue,
    config: GraphConfig,
}

impl<P: Protocol> Graph<P> {
    pub fn new(protocol: P) -> Self {
        Self::with_config(protocol, GraphConfig::default())
    }

    pub fn with_config(protocol: P, config: GraphConfig) -> Self {
        tracing::debug!(database = ?config.database, "opening graph");
        Self {
            protocol,
            store: Arc::new(RwLock::new(Store::new())),
            queue: Queue::new(config.keyed_upsert),
            config,
        }
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    /// Access the protocol collaborator (for advanced use).
    pub fn protocol(&self) -> &P {
        &self.protocol
    }

    pub(crate) fn store(&self) -> &Arc<RwLock<Store>> {
        &self.store
    }

    fn handle(&self) -> std::sync::Weak<RwLock<Store>> {
        Arc::downgrade(&self.store)
    }

    // ========================================================================
    // Types
    // ========================================================================

    /// Register a node type. Edge types its relationships use must be
    /// registered first.
    pub fn register_node<T: NodeSchema>(&self) -> Result<()> {
        self.store.write().registry.register_node::<T>().map(|_| ())
    }

    pub fn register_edge<E: EdgeSchema>(&self) -> Result<()> {
        self.store.write().registry.register_edge::<E>().map(|_| ())
    }

    // ========================================================================
    // Handles
    // ========================================================================

    /// A new, unfastened entity of type `T`.
    pub fn entity<T: NodeSchema>(&self) -> Result<Entity<T>> {
        if self.store.read().registry().node(T::NAME).is_none() {
            return Err(Error::InvalidUsage(format!("node type {} is not registered", T::NAME)));
        }
        Ok(Entity::new(self.handle()))
    }

    /// The entity bound to `key`, which must hold a `T`.
    pub fn entity_at<T: NodeSchema>(&self, key: ContentKey) -> Result<Entity<T>> {
        Ok(self.typed::<T>(&[key])?.remove(0))
    }

    pub fn edge_at<E: EdgeSchema>(&self, key: ContentKey) -> Result<Edge<E>> {
        Ok(self.typed_edges::<E>(&[key])?.remove(0))
    }

    pub(crate) fn typed<T: NodeSchema>(&self, keys: &[ContentKey]) -> Result<Vec<Entity<T>>> {
        let store = self.store.read();
        keys.iter()
            .map(|key| {
                let content = store.get(*key)?;
                match content.type_name() {
                    Some(name) if name == T::NAME && !content.is_edge() => {
                        Ok(Entity::bound(self.handle(), content.key()))
                    }
                    other => Err(Error::TypeError {
                        expected: T::NAME.into(),
                        got: other.unwrap_or("untyped content").into(),
                    }),
                }
            })
            .collect()
    }

    pub(crate) fn typed_edges<E: EdgeSchema>(&self, keys: &[ContentKey]) -> Result<Vec<Edge<E>>> {
        let store = self.store.read();
        keys.iter()
            .map(|key| {
                let content = store.get(*key)?;
                match content.rel_type() {
                    Some(rel_type) if rel_type == E::TYPE => Ok(Edge::bound(self.handle(), content.key())),
                    other => Err(Error::TypeError {
                        expected: E::TYPE.into(),
                        got: other.unwrap_or("node").into(),
                    }),
                }
            })
            .collect()
    }

    /// Inspect the content behind any element.
    pub fn with_content<R>(&self, element: &dyn Element, f: impl FnOnce(&Content) -> R) -> Result<R> {
        let key = element.fasten()?;
        Ok(f(self.store.read().get(key)?))
    }

    pub fn status(&self, element: &dyn Element) -> Result<Status> {
        self.with_content(element, Content::status)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Track elements for creation, or revive released ones.
    ///
    /// All or nothing: when any element cannot be attached, none is.
    pub fn attach(&self, elements: &[&dyn Element]) -> Result<()> {
        self.transition_all(elements, Event::Attach)
    }

    /// Release persisted elements, or drop pending ones.
    ///
    /// All or nothing, like [`attach`](Self::attach).
    pub fn detach(&self, elements: &[&dyn Element]) -> Result<()> {
        self.transition_all(elements, Event::Detach)
    }

    fn transition_all(&self, elements: &[&dyn Element], event: Event) -> Result<()> {
        let keys = elements.iter().map(|e| e.fasten()).collect::<Result<Vec<_>>>()?;
        let mut store = self.store.write();

        let mut seen = hashbrown::HashSet::new();
        let mut planned = Vec::with_capacity(keys.len());
        for key in keys {
            let key = store.canonical(key);
            if !seen.insert(key) {
                continue;
            }
            let before = store.get(key)?.status();
            before.on(event)?;
            planned.push((key, before));
        }

        for (key, before) in planned {
            // A detached node may already have taken its pending edges along.
            if store.get(key)?.status() != before {
                continue;
            }
            let status = match event {
                Event::Attach => store.attach(key)?,
                _ => store.detach(key)?,
            };
            tracing::trace!(%key, %status, ?event, "transitioned");
        }
        Ok(())
    }

    pub fn merge(&mut self) -> Result<Manifest> {
        self.queue.merge(&mut self.store.write())
    }

    pub async fn run(&mut self) -> Result<()> {
        self.queue.run(&self.store, &self.protocol).await
    }

    /// `merge` then `run`.
    pub async fn save(&mut self) -> Result<Manifest> {
        let manifest = self.merge()?;
        self.run().await?;
        Ok(manifest)
    }

    // ========================================================================
    // Reading
    // ========================================================================

    /// Nodes carrying every label in `labels`.
    pub fn match_nodes<I, S>(&self, labels: I) -> MatchQuery<'_, P>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        MatchQuery::nodes(self, labels, Rule::All)
    }

    /// Nodes carrying at least one label in `labels`.
    pub fn match_any<I, S>(&self, labels: I) -> MatchQuery<'_, P>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        MatchQuery::nodes(self, labels, Rule::Any)
    }

    /// Outgoing edges of the given types. See [`MatchQuery::direction`].
    pub fn match_edges<I, S>(&self, types: I, rule: Rule) -> MatchQuery<'_, P>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        MatchQuery::edge_pattern(self, types, rule, Direction::Outgoing)
    }

    /// Fold a wire node or relationship into the store.
    pub fn resolve(&self, value: &Value) -> Result<ContentKey> {
        let mut store = self.store.write();
        match value.clone().decode()? {
            Value::Node(node) => store.resolve_node(&node),
            Value::Relationship(rel) => store.resolve_relationship(&rel),
            other => Err(Error::TypeError {
                expected: "NODE or RELATIONSHIP".into(),
                got: other.type_name().into(),
            }),
        }
    }

    /// Run a raw statement. Nodes and relationships in the result are
    /// resolved into the store as a side effect.
    pub async fn query(&self, statement: &str, params: PropertyMap) -> Result<Vec<Vec<Value>>> {
        let mut query = Query::new();
        query.push(statement);
        for (name, value) in params {
            query.param(name, value);
        }
        let records = query.records(&self.protocol).await?;

        let mut store = self.store.write();
        for value in records.iter().flatten() {
            match value {
                Value::Node(node) => { store.resolve_node(node)?; }
                Value::Relationship(rel) => { store.resolve_relationship(rel)?; }
                _ => {}
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Node, ServerId};
    use crate::protocol::ScriptedProtocol;
    use crate::schema::Field;

    struct City;
    impl NodeSchema for City {
        const NAME: &'static str = "City";
        const LABELS: &'static [&'static str] = &["City"];
        const FIELDS: &'static [Field] = &[Field::required("name")];
    }

    #[test]
    fn test_entity_requires_registration() {
        let graph = Graph::new(ScriptedProtocol::new());
        assert!(graph.entity::<City>().is_err());
        graph.register_node::<City>().unwrap();
        let city = graph.entity::<City>().unwrap();
        assert_eq!(city.status().unwrap(), Status::Fastened);
    }

    #[test]
    fn test_resolve_types_by_label() {
        let graph = Graph::new(ScriptedProtocol::new());
        graph.register_node::<City>().unwrap();
        let wire = Value::Node(Box::new(
            Node::new(ServerId(3)).with_labels(["City"]).with_property("name", "Oslo"),
        ));
        let key = graph.resolve(&wire).unwrap();
        assert_eq!(graph.resolve(&wire).unwrap(), key);
        let city = graph.entity_at::<City>(key).unwrap();
        assert_eq!(city.get("name").unwrap(), Value::from("Oslo"));
        assert_eq!(city.status().unwrap(), Status::Attached);
        assert!(graph.resolve(&Value::Int(1)).is_err());
    }

    #[test]
    fn test_attach_and_detach_pending() {
        let graph = Graph::new(ScriptedProtocol::new());
        graph.register_node::<City>().unwrap();
        let city = graph.entity::<City>().unwrap();
        graph.attach(&[&city]).unwrap();
        assert_eq!(city.status().unwrap(), Status::Inducted);
        assert!(graph.attach(&[&city]).is_err());
        graph.detach(&[&city]).unwrap();
        assert_eq!(city.status().unwrap(), Status::Fastened);
    }

    #[test]
    fn test_failed_batch_changes_nothing() {
        let graph = Graph::new(ScriptedProtocol::new());
        graph.register_node::<City>().unwrap();
        let oslo = graph.entity::<City>().unwrap();
        let bergen = graph.entity::<City>().unwrap();
        graph.attach(&[&bergen]).unwrap();

        let err = graph.attach(&[&oslo, &bergen]).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition(_)), "{err}");
        assert_eq!(oslo.status().unwrap(), Status::Fastened);
        assert_eq!(bergen.status().unwrap(), Status::Inducted);

        let err = graph.detach(&[&bergen, &oslo]).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition(_)), "{err}");
        assert_eq!(bergen.status().unwrap(), Status::Inducted);
    }

    #[test]
    fn test_repeated_element_in_batch_transitions_once() {
        let graph = Graph::new(ScriptedProtocol::new());
        graph.register_node::<City>().unwrap();
        let oslo = graph.entity::<City>().unwrap();
        let alias = oslo.clone();
        graph.attach(&[&oslo, &alias]).unwrap();
        assert_eq!(oslo.status().unwrap(), Status::Inducted);
    }
}
