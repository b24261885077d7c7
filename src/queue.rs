//! # Persistence queue
//!
//! [`Queue::merge`] settles relationship propagation over the tracked
//! contents and classifies each into create, update or delete.
//! [`Queue::run`] then writes the classified contents out in six phases,
//! one statement per phase:
//!
//! 1. node creates
//! 2. node updates
//! 3. edge creates (endpoints exist by now)
//! 4. edge updates
//! 5. edge deletes
//! 6. node deletes (their edges are gone by now)
//!
//! The store lock is never held while a statement is in flight.

use std::time::{Duration, Instant};

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::content::{ContentKey, Event, Status, Store};
use crate::model::{PropertyMap, ServerId, Value};
use crate::protocol::Protocol;
use crate::query::{escape, Query};
use crate::relation;
use crate::{Error, Result};

/// Keys classified into one bucket kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Operations {
    pub create: Vec<ContentKey>,
    pub update: Vec<ContentKey>,
    pub delete: Vec<ContentKey>,
}

impl Operations {
    pub fn len(&self) -> usize {
        self.create.len() + self.update.len() + self.delete.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What one merge decided to write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Manifest {
    pub nodes: Operations,
    pub edges: Operations,
    /// Time spent merging.
    pub elapsed: Duration,
}

impl Manifest {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    CreateNodes,
    UpdateNodes,
    CreateEdges,
    UpdateEdges,
    DeleteEdges,
    DeleteNodes,
}

const PHASES: [Phase; 6] = [
    Phase::CreateNodes,
    Phase::UpdateNodes,
    Phase::CreateEdges,
    Phase::UpdateEdges,
    Phase::DeleteEdges,
    Phase::DeleteNodes,
];

impl Phase {
    fn expects(self) -> Status {
        match self {
            Phase::CreateNodes | Phase::CreateEdges => Status::Inducted,
            Phase::UpdateNodes | Phase::UpdateEdges => Status::Attached,
            Phase::DeleteEdges | Phase::DeleteNodes => Status::Released,
        }
    }

    fn keys(self, manifest: &Manifest) -> &[ContentKey] {
        match self {
            Phase::CreateNodes => &manifest.nodes.create,
            Phase::UpdateNodes => &manifest.nodes.update,
            Phase::CreateEdges => &manifest.edges.create,
            Phase::UpdateEdges => &manifest.edges.update,
            Phase::DeleteEdges => &manifest.edges.delete,
            Phase::DeleteNodes => &manifest.nodes.delete,
        }
    }
}

#[derive(Debug)]
pub struct Queue {
    manifest: Option<Manifest>,
    spent: bool,
    keyed_upsert: bool,
}

impl Queue {
    pub fn new(keyed_upsert: bool) -> Self {
        Self { manifest: None, spent: true, keyed_upsert }
    }

    /// True until the next merge.
    pub fn is_spent(&self) -> bool {
        self.spent
    }

    pub fn manifest(&self) -> Option<&Manifest> {
        self.manifest.as_ref()
    }

    // ========================================================================
    // Merge
    // ========================================================================

    pub fn merge(&mut self, store: &mut Store) -> Result<Manifest> {
        let started = Instant::now();
        propagate(store)?;

        let mut manifest = Manifest::default();
        for key in store.tracked_nodes() {
            classify(store, key, &mut manifest.nodes)?;
        }
        for key in store.tracked_edges() {
            classify(store, key, &mut manifest.edges)?;
        }
        for edge in &manifest.edges.create {
            let content = store.get(*edge)?;
            let (source, target) = content.endpoints()
                .ok_or_else(|| Error::InvalidUsage(format!("{edge} is not an edge")))?;
            for end in [source, target] {
                let status = store.get(end)?.status();
                if !status.is_live() {
                    return Err(Error::InvalidUsage(format!(
                        "edge {edge} ({}) connects {end}, which is {status}; attach it first",
                        content.rel_type().unwrap_or_default(),
                    )));
                }
            }
        }

        manifest.elapsed = started.elapsed();
        tracing::debug!(
            node_creates = manifest.nodes.create.len(),
            node_updates = manifest.nodes.update.len(),
            node_deletes = manifest.nodes.delete.len(),
            edge_creates = manifest.edges.create.len(),
            edge_updates = manifest.edges.update.len(),
            edge_deletes = manifest.edges.delete.len(),
            elapsed_us = manifest.elapsed.as_micros() as u64,
            "merged persistence queue"
        );
        self.manifest = Some(manifest.clone());
        self.spent = false;
        Ok(manifest)
    }

    // ========================================================================
    // Run
    // ========================================================================

    /// Execute the phases of the last merge.
    ///
    /// The queue is spent as soon as this starts, even if a phase fails:
    /// merge again to recompute what is still pending.
    pub async fn run<P: Protocol + ?Sized>(&mut self, store: &RwLock<Store>, protocol: &P) -> Result<()> {
        if self.spent {
            return Err(Error::Spent);
        }
        self.spent = true;
        let manifest = self.manifest.clone().unwrap_or_default();

        for phase in PHASES {
            let keys = phase.keys(&manifest);
            if keys.is_empty() {
                continue;
            }
            let (mut query, keys) = {
                let store = store.read();
                let keys: Vec<ContentKey> = keys.iter()
                    .map(|k| store.canonical(*k))
                    .filter(|k| store.get(*k).is_ok_and(|c| c.status() == phase.expects()))
                    .collect();
                (build(&store, phase, &keys, self.keyed_upsert)?, keys)
            };
            if keys.is_empty() {
                continue;
            }
            let records = query.records(protocol).await?;
            apply(&mut store.write(), phase, &keys, records)?;
        }

        relation::settle(&mut store.write())
    }
}

// ============================================================================
// Merge helpers
// ============================================================================

/// Work-list traversal: a node re-enters whenever its status changed since
/// it was last propagated. Each status moves forward at most twice per
/// merge, so the loop settles.
fn propagate(store: &mut Store) -> Result<()> {
    let mut seen: HashMap<ContentKey, Status> = HashMap::new();
    let limit = 4 * (store.tracked_nodes().len() + store.tracked_edges().len()) + 8;
    for pass in 1.. {
        let mut work = Vec::new();
        for key in store.tracked_nodes() {
            let status = store.get(key)?.status();
            if seen.get(&key) != Some(&status) {
                work.push((key, status));
            }
        }
        if work.is_empty() {
            return Ok(());
        }
        if pass > limit {
            return Err(Error::InvalidUsage("relationship propagation did not settle".into()));
        }
        tracing::trace!(pass, nodes = work.len(), "propagating relationship status");
        for (key, status) in work {
            seen.insert(key, status);
            relation::propagate(store, key)?;
        }
    }
    Ok(())
}

fn classify(store: &mut Store, key: ContentKey, ops: &mut Operations) -> Result<()> {
    match store.get(key)?.status() {
        Status::Inducted => {
            run_hooks(store, key, true)?;
            let content = store.get(key)?;
            if let Some(schema) = content.schema() {
                let missing = schema.missing_required(content);
                if !missing.is_empty() {
                    return Err(Error::InvalidUsage(format!(
                        "{} {key} is missing required field(s): {}",
                        schema.name(),
                        missing.join(", ")
                    )));
                }
            }
            ops.create.push(key);
        }
        Status::Attached if store.get(key)?.is_dirty() => {
            run_hooks(store, key, false)?;
            ops.update.push(key);
        }
        Status::Released => ops.delete.push(key),
        _ => {}
    }
    Ok(())
}

/// Create hooks fill gaps only; update hooks always win.
fn run_hooks(store: &mut Store, key: ContentKey, creating: bool) -> Result<()> {
    let content = store.get_mut(key)?;
    let Some(schema) = content.schema().cloned() else {
        return Ok(());
    };
    let hooks = if creating { schema.create_hooks() } else { schema.update_hooks() };
    for hook in hooks {
        for (field, value) in hook(content) {
            schema.check_field(&field)?;
            if creating && content.get(&field).is_some_and(|v| !v.is_null()) {
                continue;
            }
            content.set(field, value);
        }
    }
    Ok(())
}

// ============================================================================
// Statements
// ============================================================================

fn identity(store: &Store, key: ContentKey) -> Result<ServerId> {
    store.get(key)?.identity()
        .ok_or_else(|| Error::Protocol(format!("{key} has no server identity")))
}

fn build(store: &Store, phase: Phase, keys: &[ContentKey], keyed_upsert: bool) -> Result<Query> {
    let mut query = Query::new();
    match phase {
        Phase::CreateNodes => {
            for (i, key) in keys.iter().enumerate() {
                let alias = format!("n{i}");
                let content = store.get(*key)?;
                let properties = store.snapshot(*key)?;
                let declared: &[&str] = content.schema().map_or(&[], |s| s.labels());
                let merge_keys: &[&str] = content.schema().map_or(&[], |s| s.keys());
                let upsert = keyed_upsert
                    && !merge_keys.is_empty()
                    && merge_keys.iter().all(|k| properties.contains_key(*k));
                if upsert {
                    let key_map: PropertyMap = merge_keys.iter()
                        .filter_map(|k| properties.get(*k).map(|v| ((*k).to_string(), v.clone())))
                        .collect();
                    let key_param = format!("k{i}");
                    let labels: String = declared.iter().map(|l| format!(":{}", escape(l))).collect();
                    query.param(key_param.clone(), Value::Map(key_map));
                    query.param(alias.clone(), Value::Map(properties));
                    query.push(format!("MERGE ({alias}{labels} {{@expand({key_param})}})"));
                    query.push(format!("SET {alias} += ${alias}"));
                    for extra in content.labels().into_iter().filter(|l| !declared.contains(l)) {
                        query.push(format!("SET {alias}:{}", escape(extra)));
                    }
                } else {
                    let labels: String = content.labels().iter().map(|l| format!(":{}", escape(l))).collect();
                    query.param(alias.clone(), Value::Map(properties));
                    query.push(format!("CREATE ({alias}{labels} ${alias})"));
                }
            }
            query.push(returning("n", keys.len()));
        }
        Phase::UpdateNodes => {
            for (i, key) in keys.iter().enumerate() {
                let p = query.bind(identity(store, *key)?.into());
                query.push(format!("MATCH (n{i}) WHERE id(n{i}) = {p}"));
            }
            for (i, key) in keys.iter().enumerate() {
                let content = store.get(*key)?;
                let changes = content.changes();
                if !changes.is_empty() {
                    query.param(format!("u{i}"), Value::Map(changes));
                    query.push(format!("SET n{i} += $u{i}"));
                }
                for label in content.labels_with(Status::Inducted) {
                    query.push(format!("SET n{i}:{}", escape(label)));
                }
                for label in content.labels_with(Status::Released) {
                    query.push(format!("REMOVE n{i}:{}", escape(label)));
                }
            }
            query.push(returning("n", keys.len()));
        }
        Phase::CreateEdges => {
            for (i, key) in keys.iter().enumerate() {
                let (source, target) = endpoints(store, *key)?;
                let p = query.bind(identity(store, source)?.into());
                query.push(format!("MATCH (s{i}) WHERE id(s{i}) = {p}"));
                let p = query.bind(identity(store, target)?.into());
                query.push(format!("MATCH (t{i}) WHERE id(t{i}) = {p}"));
            }
            for (i, key) in keys.iter().enumerate() {
                let content = store.get(*key)?;
                let rel_type = content.rel_type().unwrap_or_default();
                query.param(format!("e{i}"), Value::Map(store.snapshot(*key)?));
                query.push(format!("CREATE (s{i})-[e{i}:{} $e{i}]->(t{i})", escape(rel_type)));
            }
            query.push(returning("e", keys.len()));
        }
        Phase::UpdateEdges => {
            for (i, key) in keys.iter().enumerate() {
                let p = query.bind(identity(store, *key)?.into());
                query.push(format!("MATCH ()-[e{i}]->() WHERE id(e{i}) = {p}"));
            }
            for (i, key) in keys.iter().enumerate() {
                query.param(format!("u{i}"), Value::Map(store.get(*key)?.changes()));
                query.push(format!("SET e{i} += $u{i}"));
            }
            query.push(returning("e", keys.len()));
        }
        Phase::DeleteEdges => {
            for (i, key) in keys.iter().enumerate() {
                let p = query.bind(identity(store, *key)?.into());
                query.push(format!("MATCH ()-[e{i}]->() WHERE id(e{i}) = {p}"));
            }
            query.push(format!("DELETE {}", aliases("e", keys.len())));
        }
        Phase::DeleteNodes => {
            for (i, key) in keys.iter().enumerate() {
                let p = query.bind(identity(store, *key)?.into());
                query.push(format!("MATCH (n{i}) WHERE id(n{i}) = {p}"));
            }
            query.push(format!("DELETE {}", aliases("n", keys.len())));
        }
    }
    Ok(query)
}

fn endpoints(store: &Store, key: ContentKey) -> Result<(ContentKey, ContentKey)> {
    let (source, target) = store.get(key)?.endpoints()
        .ok_or_else(|| Error::InvalidUsage(format!("{key} is not an edge")))?;
    Ok((store.canonical(source), store.canonical(target)))
}

fn aliases(prefix: &str, count: usize) -> String {
    (0..count).map(|i| format!("{prefix}{i}")).collect::<Vec<_>>().join(", ")
}

fn returning(prefix: &str, count: usize) -> String {
    format!("RETURN {}", aliases(prefix, count))
}

// ============================================================================
// Reconciliation
// ============================================================================

fn returned(records: Vec<Vec<Value>>, expected: usize) -> Result<Vec<Value>> {
    let mut records = records.into_iter();
    let (Some(record), None) = (records.next(), records.next()) else {
        return Err(Error::Protocol(format!("expected one record of {expected} elements")));
    };
    if record.len() != expected {
        return Err(Error::Protocol(format!(
            "expected {expected} elements back, got {}", record.len()
        )));
    }
    Ok(record)
}

fn apply(store: &mut Store, phase: Phase, keys: &[ContentKey], records: Vec<Vec<Value>>) -> Result<()> {
    match phase {
        Phase::CreateNodes | Phase::UpdateNodes => {
            for (key, value) in keys.iter().zip(returned(records, keys.len())?) {
                let Value::Node(node) = value else {
                    return Err(Error::TypeError { expected: "NODE".into(), got: value.type_name().into() });
                };
                let owner = match phase {
                    Phase::CreateNodes => store.assign_identity(*key, node.id)?,
                    _ => store.canonical(*key),
                };
                store.resolve_node(&node)?;
                let content = store.get_mut(owner)?;
                if content.status() == Status::Inducted {
                    content.transition(Event::Created)?;
                } else {
                    content.commit_labels();
                }
            }
        }
        Phase::CreateEdges | Phase::UpdateEdges => {
            for (key, value) in keys.iter().zip(returned(records, keys.len())?) {
                let Value::Relationship(rel) = value else {
                    return Err(Error::TypeError {
                        expected: "RELATIONSHIP".into(),
                        got: value.type_name().into(),
                    });
                };
                let owner = match phase {
                    Phase::CreateEdges => store.assign_identity(*key, rel.id)?,
                    _ => store.canonical(*key),
                };
                store.resolve_relationship(&rel)?;
                let content = store.get_mut(owner)?;
                if content.status() == Status::Inducted {
                    content.transition(Event::Created)?;
                }
            }
        }
        Phase::DeleteEdges | Phase::DeleteNodes => {
            for key in keys {
                store.forget(*key)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{props, Node};
    use crate::relation::RelationSpec;
    use crate::content::Content;
    use crate::schema::{EdgeSchema, Field, Hook, NodeSchema};
    use pretty_assertions::assert_eq;

    struct Wrote;
    impl EdgeSchema for Wrote {
        const TYPE: &'static str = "WROTE";
    }

    struct Person;
    impl NodeSchema for Person {
        const NAME: &'static str = "Person";
        const LABELS: &'static [&'static str] = &["Person"];
        const FIELDS: &'static [Field] = &[Field::required("name"), Field::optional("slug")];
        const KEYS: &'static [&'static str] = &["name"];
        fn relations() -> Vec<RelationSpec> {
            vec![RelationSpec::new("wrote", "WROTE")]
        }
        fn create_hooks() -> Vec<Hook> {
            vec![slug as Hook]
        }
    }

    fn slug(content: &Content) -> PropertyMap {
        let name = content.get("name").and_then(Value::as_str).unwrap_or_default();
        props([("slug", name.to_lowercase())])
    }

    fn store() -> Store {
        let mut store = Store::new();
        store.registry.register_edge::<Wrote>().unwrap();
        store.registry.register_node::<Person>().unwrap();
        store
    }

    fn person(store: &mut Store, name: &str) -> ContentKey {
        let info = store.registry().node("Person").cloned();
        let key = store.fasten_node(info);
        store.get_mut(key).unwrap().set("name", Value::from(name));
        store.attach(key).unwrap();
        key
    }

    #[test]
    fn test_classification() {
        let mut s = store();
        let created = person(&mut s, "Ada");
        let persisted = s.resolve_node(
            &Node::new(ServerId(9)).with_labels(["Person"]).with_property("name", "Bob"),
        ).unwrap();
        let mut queue = Queue::new(true);

        let manifest = queue.merge(&mut s).unwrap();
        assert_eq!(manifest.nodes.create, vec![created]);
        assert!(manifest.nodes.update.is_empty(), "clean nodes are skipped");
        assert!(!queue.is_spent());

        s.get_mut(persisted).unwrap().set("name", Value::from("Robert"));
        let manifest = queue.merge(&mut s).unwrap();
        assert_eq!(manifest.nodes.update, vec![persisted]);
    }

    #[test]
    fn test_create_hooks_fill_gaps_only() {
        let mut s = store();
        let a = person(&mut s, "Ada");
        let b = person(&mut s, "Bob");
        s.get_mut(b).unwrap().set("slug", Value::from("custom"));
        Queue::new(true).merge(&mut s).unwrap();
        assert_eq!(s.get(a).unwrap().get("slug"), Some(&Value::from("ada")));
        assert_eq!(s.get(b).unwrap().get("slug"), Some(&Value::from("custom")));
    }

    #[test]
    fn test_missing_required_field() {
        let mut s = store();
        let info = s.registry().node("Person").cloned();
        let key = s.fasten_node(info);
        s.attach(key).unwrap();
        let err = Queue::new(true).merge(&mut s).unwrap_err();
        assert!(err.to_string().contains("name"), "{err}");
    }

    #[test]
    fn test_upsert_statement() {
        let mut s = store();
        let key = person(&mut s, "Ada");
        let query = build(&s, Phase::CreateNodes, &[key], true).unwrap();
        assert_eq!(
            query.compile().unwrap(),
            "MERGE (n0:Person {name:$k0.name})\nSET n0 += $n0\nRETURN n0"
        );
        let query = build(&s, Phase::CreateNodes, &[key], false).unwrap();
        assert_eq!(query.compile().unwrap(), "CREATE (n0:Person $n0)\nRETURN n0");
    }

    #[test]
    fn test_dangling_edge_is_rejected() {
        let mut s = store();
        let a = person(&mut s, "Ada");
        let info = s.registry().node("Person").cloned();
        let b = s.fasten_node(info);
        relation::link(&mut s, a, "wrote", b, PropertyMap::new()).unwrap();
        let err = Queue::new(true).merge(&mut s).unwrap_err();
        assert!(matches!(err, Error::InvalidUsage(_)), "{err}");
    }

    #[tokio::test]
    async fn test_run_requires_merge() {
        let store = RwLock::new(store());
        let protocol = crate::protocol::ScriptedProtocol::new();
        let mut queue = Queue::new(true);
        assert!(matches!(queue.run(&store, &protocol).await, Err(Error::Spent)));
        queue.merge(&mut store.write()).unwrap();
        queue.run(&store, &protocol).await.unwrap();
        assert!(matches!(queue.run(&store, &protocol).await, Err(Error::Spent)));
        assert!(protocol.statements().is_empty(), "nothing to write");
    }
}
