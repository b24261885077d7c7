//! Relationships: typed, cardinality- and ownership-constrained groups of
//! edges hanging off a source node.
//!
//! A node's relation state lives in its [`Content`](crate::content::Content)
//! as two edge sets: `active` (what the application links now) and
//! `loaded` (what was persisted as of the last commit or load). The merge
//! traversal compares the two and pushes status changes onto edges and,
//! for owned relations, onto targets.

use std::collections::BTreeSet;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::content::{ContentKey, Status, Store};
use crate::entity::Element;
use crate::graph::Graph;
use crate::model::{Direction, PropertyMap, Value};
use crate::protocol::Protocol;
use crate::query::{escape, Query, Where};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    One,
    Many,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Attaching the source attaches edges, not targets.
    Independent,
    /// Targets follow the source in and out of the graph.
    Owned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// Loaded whenever a matched source node is resolved.
    Eager,
    /// Loaded on the first [`Relation::fetch`].
    Lazy,
    /// Only loaded by an explicit [`Relation::load`].
    Manual,
}

/// What happens to a persisted edge that was unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exclusion {
    /// Delete the edge on the next commit.
    Detach,
    /// Leave the edge in the database; it just stops being part of the relation.
    Keep,
}

/// Declaration of one relationship field of a node type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationSpec {
    pub name: &'static str,
    pub edge_type: &'static str,
    /// Allowed target node type names. Empty means unconstrained.
    pub targets: Vec<&'static str>,
    pub direction: Direction,
    pub cardinality: Cardinality,
    pub ownership: Ownership,
    pub load: LoadMode,
    pub on_unset: Exclusion,
}

impl RelationSpec {
    pub fn new(name: &'static str, edge_type: &'static str) -> Self {
        Self {
            name,
            edge_type,
            targets: Vec::new(),
            direction: Direction::Outgoing,
            cardinality: Cardinality::Many,
            ownership: Ownership::Independent,
            load: LoadMode::Lazy,
            on_unset: Exclusion::Detach,
        }
    }

    pub fn to(mut self, targets: &[&'static str]) -> Self {
        self.targets = targets.to_vec();
        self
    }

    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn one(mut self) -> Self {
        self.cardinality = Cardinality::One;
        self
    }

    pub fn many(mut self) -> Self {
        self.cardinality = Cardinality::Many;
        self
    }

    pub fn owned(mut self) -> Self {
        self.ownership = Ownership::Owned;
        self
    }

    pub fn load(mut self, mode: LoadMode) -> Self {
        self.load = mode;
        self
    }

    pub fn keep_unset(mut self) -> Self {
        self.on_unset = Exclusion::Keep;
        self
    }

    fn cascades(&self) -> bool {
        self.ownership == Ownership::Owned
    }

    fn allows(&self, type_name: Option<&str>) -> bool {
        self.targets.is_empty() || type_name.is_some_and(|t| self.targets.contains(&t))
    }
}

/// Per-node state of one relationship.
#[derive(Debug, Clone)]
pub struct RelationState {
    pub(crate) spec: Arc<RelationSpec>,
    pub(crate) active: BTreeSet<ContentKey>,
    pub(crate) loaded: BTreeSet<ContentKey>,
    pub(crate) fetched: bool,
}

impl RelationState {
    pub(crate) fn new(spec: Arc<RelationSpec>) -> Self {
        Self { spec, active: BTreeSet::new(), loaded: BTreeSet::new(), fetched: false }
    }

    pub fn spec(&self) -> &RelationSpec { &self.spec }
    pub fn active(&self) -> &BTreeSet<ContentKey> { &self.active }
    pub fn loaded(&self) -> &BTreeSet<ContentKey> { &self.loaded }

    /// Take over the edges of a duplicate that is being merged away.
    pub(crate) fn absorb(&mut self, other: RelationState) {
        self.active.extend(other.active);
        self.loaded.extend(other.loaded);
        self.fetched |= other.fetched;
    }
}

// ============================================================================
// Store-level operations
// ============================================================================

fn state<'s>(store: &'s Store, owner: ContentKey, name: &str) -> Result<&'s RelationState> {
    let content = store.get(owner)?;
    content.relations.get(name).ok_or_else(|| {
        Error::InvalidUsage(format!(
            "{} has no relationship {name:?}", content.type_name().unwrap_or("untyped node")
        ))
    })
}

fn state_mut<'s>(store: &'s mut Store, owner: ContentKey, name: &str) -> Result<&'s mut RelationState> {
    let content = store.get_mut(owner)?;
    let type_name = content.type_name();
    content.relations.get_mut(name).ok_or_else(|| {
        Error::InvalidUsage(format!(
            "{} has no relationship {name:?}", type_name.unwrap_or("untyped node")
        ))
    })
}

/// The endpoint of `edge` that is not `owner`.
pub(crate) fn other_end(store: &Store, edge: ContentKey, owner: ContentKey) -> Result<ContentKey> {
    let owner = store.canonical(owner);
    let (source, target) = store.get(edge)?.endpoints()
        .ok_or_else(|| Error::InvalidUsage(format!("{edge} is not an edge")))?;
    Ok(if source == owner { target } else { source })
}

fn find_edge(
    store: &Store,
    edges: &BTreeSet<ContentKey>,
    owner: ContentKey,
    target: ContentKey,
) -> Result<Option<ContentKey>> {
    for edge in edges {
        if other_end(store, *edge, owner)? == target {
            return Ok(Some(*edge));
        }
    }
    Ok(None)
}

fn assign(store: &mut Store, edge: ContentKey, data: PropertyMap) -> Result<()> {
    let content = store.get_mut(edge)?;
    if let Some(schema) = content.schema() {
        for key in data.keys() {
            schema.check_field(key)?;
        }
    }
    for (key, value) in data {
        content.set(key, value);
    }
    Ok(())
}

/// Link `owner` to `target` through the relation `name`, returning the edge.
pub(crate) fn link(
    store: &mut Store,
    owner: ContentKey,
    name: &str,
    target: ContentKey,
    data: PropertyMap,
) -> Result<ContentKey> {
    let owner = store.canonical(owner);
    let target = store.canonical(target);
    let spec = state(store, owner, name)?.spec.clone();

    let owner_status = store.get(owner)?.status();
    if matches!(owner_status, Status::Released | Status::Detached) {
        return Err(Error::InvalidUsage(format!(
            "cannot link from {owner}: it is {owner_status}"
        )));
    }
    let target_content = store.get(target)?;
    if target_content.is_edge() || target_content.status() == Status::Detached {
        return Err(Error::InvalidUsage(format!("{target} cannot be linked")));
    }
    if !spec.allows(target_content.type_name()) {
        return Err(Error::InvalidUsage(format!(
            "{} does not accept {} as a target of {:?}",
            store.get(owner)?.type_name().unwrap_or("node"),
            target_content.type_name().unwrap_or("an untyped node"),
            spec.name,
        )));
    }

    let active = state(store, owner, name)?.active.clone();
    if let Some(edge) = find_edge(store, &active, owner, target)? {
        assign(store, edge, data)?;
        return Ok(edge);
    }
    if spec.cardinality == Cardinality::One {
        for edge in active {
            unlink_edge(store, owner, name, edge)?;
        }
    }

    let loaded = state(store, owner, name)?.loaded.clone();
    let edge = match find_edge(store, &loaded, owner, target)? {
        Some(edge) => {
            if store.get(edge)?.status() == Status::Released {
                store.attach(edge)?;
            }
            edge
        }
        None => {
            let (source, dest) = match spec.direction {
                Direction::Incoming => (target, owner),
                Direction::Outgoing | Direction::Both => (owner, target),
            };
            store.fasten_edge(spec.edge_type, source, dest)?
        }
    };
    assign(store, edge, data)?;
    state_mut(store, owner, name)?.active.insert(edge);
    Ok(edge)
}

/// Drop the link to `target`. Returns whether one existed.
pub(crate) fn unlink(store: &mut Store, owner: ContentKey, name: &str, target: ContentKey) -> Result<bool> {
    let owner = store.canonical(owner);
    let target = store.canonical(target);
    let active = state(store, owner, name)?.active.clone();
    match find_edge(store, &active, owner, target)? {
        Some(edge) => {
            unlink_edge(store, owner, name, edge)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

fn unlink_edge(store: &mut Store, owner: ContentKey, name: &str, edge: ContentKey) -> Result<()> {
    state_mut(store, owner, name)?.active.remove(&edge);
    // Persisted edges stay in `loaded` until the merge traversal sees the removal.
    if store.get(edge)?.status() == Status::Inducted {
        store.detach(edge)?;
    }
    Ok(())
}

fn release(store: &mut Store, key: ContentKey) -> Result<()> {
    match store.get(key)?.status() {
        Status::Attached | Status::Inducted => { store.detach(key)?; }
        _ => {}
    }
    Ok(())
}

/// Merge hook: push the node's status onto its relations.
pub(crate) fn propagate(store: &mut Store, node: ContentKey) -> Result<()> {
    let content = store.get(node)?;
    let status = content.status();
    let relations: Vec<(Arc<RelationSpec>, BTreeSet<ContentKey>, BTreeSet<ContentKey>)> = content
        .relations
        .values()
        .map(|s| (s.spec.clone(), s.active.clone(), s.loaded.clone()))
        .collect();

    match status {
        Status::Inducted | Status::Attached => {
            for (spec, active, loaded) in &relations {
                for edge in active {
                    if store.get(*edge)?.status() == Status::Fastened {
                        store.attach(*edge)?;
                    }
                    if spec.cascades() {
                        let target = other_end(store, *edge, node)?;
                        if store.get(target)?.status() == Status::Fastened {
                            store.attach(target)?;
                        }
                    }
                }
                if spec.cascades() || spec.on_unset == Exclusion::Detach {
                    for edge in loaded.difference(active) {
                        if store.get(*edge)?.status() == Status::Attached {
                            store.detach(*edge)?;
                        }
                        if spec.cascades() {
                            let target = other_end(store, *edge, node)?;
                            if store.get(target)?.status() == Status::Attached {
                                store.detach(target)?;
                            }
                        }
                    }
                }
            }
        }
        Status::Released | Status::Detached => {
            for (spec, active, loaded) in &relations {
                for edge in active.union(loaded) {
                    release(store, *edge)?;
                    if spec.cascades() {
                        let target = other_end(store, *edge, node)?;
                        release(store, target)?;
                    }
                }
            }
            for edge in store.edges_touching(node) {
                release(store, edge)?;
            }
        }
        Status::Fastened => {}
    }
    Ok(())
}

/// After a commit: drop deleted edges, and record what is now persisted.
pub(crate) fn settle(store: &mut Store) -> Result<()> {
    let mut updates = Vec::new();
    for node in store.tracked_nodes() {
        for (name, state) in &store.get(node)?.relations {
            let mut active = BTreeSet::new();
            let mut loaded = BTreeSet::new();
            for edge in &state.active {
                match store.get(*edge).map(|c| c.status()) {
                    Ok(Status::Detached) | Err(_) => {}
                    Ok(status) => {
                        active.insert(store.canonical(*edge));
                        if status == Status::Attached {
                            loaded.insert(store.canonical(*edge));
                        }
                    }
                }
            }
            updates.push((node, name.clone(), active, loaded));
        }
    }
    for (node, name, active, loaded) in updates {
        let state = state_mut(store, node, &name)?;
        state.active = active;
        state.loaded = loaded;
    }
    Ok(())
}

// ============================================================================
// Relation handle
// ============================================================================

/// A relationship field of one node.
#[derive(Debug, Clone)]
pub struct Relation {
    store: Weak<RwLock<Store>>,
    owner: ContentKey,
    name: String,
}

impl Relation {
    pub(crate) fn new(store: Weak<RwLock<Store>>, owner: ContentKey, name: &str) -> Self {
        Self { store, owner, name: name.to_string() }
    }

    fn store(&self) -> Result<Arc<RwLock<Store>>> {
        self.store.upgrade()
            .ok_or_else(|| Error::InvalidUsage("the graph owning this relation was dropped".into()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> ContentKey {
        self.owner
    }

    pub fn spec(&self) -> Result<Arc<RelationSpec>> {
        let store = self.store()?;
        let store = store.read();
        Ok(state(&store, self.owner, &self.name)?.spec.clone())
    }

    /// Link to `target` and assign `data` to the edge.
    ///
    /// For cardinality One, an existing link to a different node is unset
    /// first. A previously persisted edge to `target` is reused.
    pub fn set(&self, target: &dyn Element, data: PropertyMap) -> Result<ContentKey> {
        let target = target.fasten()?;
        let store = self.store()?;
        let mut store = store.write();
        link(&mut store, self.owner, &self.name, target, data)
    }

    pub fn unset(&self, target: &dyn Element) -> Result<bool> {
        let target = target.fasten()?;
        let store = self.store()?;
        let mut store = store.write();
        unlink(&mut store, self.owner, &self.name, target)
    }

    pub fn clear(&self) -> Result<()> {
        let store = self.store()?;
        let mut store = store.write();
        let active = state(&store, self.owner, &self.name)?.active.clone();
        for edge in active {
            unlink_edge(&mut store, self.owner, &self.name, edge)?;
        }
        Ok(())
    }

    pub fn edges(&self) -> Result<Vec<ContentKey>> {
        let store = self.store()?;
        let store = store.read();
        Ok(state(&store, self.owner, &self.name)?.active.iter().copied().collect())
    }

    pub fn targets(&self) -> Result<Vec<ContentKey>> {
        let store = self.store()?;
        let store = store.read();
        state(&store, self.owner, &self.name)?.active.iter()
            .map(|edge| other_end(&store, *edge, self.owner))
            .collect()
    }

    pub fn contains(&self, target: &dyn Element) -> Result<bool> {
        let target = target.fasten()?;
        let store = self.store()?;
        let target = store.read().canonical(target);
        Ok(self.targets()?.contains(&target))
    }

    /// The single linked target. More than one is a multiplicity error.
    pub fn one(&self) -> Result<Option<ContentKey>> {
        let targets = self.targets()?;
        match targets.len() {
            0 => Ok(None),
            1 => Ok(Some(targets[0])),
            found => Err(Error::Multiplicity { expected: 1, found }),
        }
    }

    /// Query the database for the edges of this relation and record them
    /// as persisted. Returns the linked targets.
    pub async fn load<P: Protocol>(&self, graph: &Graph<P>) -> Result<Vec<ContentKey>> {
        let store = self.store()?;
        if !Arc::ptr_eq(&store, graph.store()) {
            return Err(Error::InvalidUsage("relation belongs to a different graph".into()));
        }

        let (mut query, spec) = {
            let store = store.read();
            let owner = store.get(self.owner)?;
            let identity = owner.identity().ok_or_else(|| {
                Error::InvalidUsage(format!("{} has not been persisted yet", self.owner))
            })?;
            let spec = state(&store, self.owner, &self.name)?.spec.clone();
            let labels = match spec.targets.as_slice() {
                [only] => store.registry().node(only)
                    .map(|t| t.labels().iter().map(|l| format!(":{}", escape(l))).collect::<String>())
                    .unwrap_or_default(),
                _ => String::new(),
            };
            let (left, right) = spec.direction.arrows();
            let mut query = Query::new();
            query.push(format!("MATCH (s){left}[r:{}]{right}(t{labels})", escape(&spec.edge_type)));
            let predicate = Where::new("s").id(Value::from(identity));
            let rendered = predicate.render(&mut query)?;
            query.push(format!("WHERE {rendered}"));
            query.push("RETURN r, t");
            (query, spec)
        };

        let records = query.records(graph.protocol()).await?;

        let mut store = store.write();
        let mut found = Vec::new();
        for record in records {
            let [Value::Relationship(rel), Value::Node(node)] = record.as_slice() else {
                return Err(Error::TypeError {
                    expected: "[RELATIONSHIP, NODE]".into(),
                    got: format!("{} fields", record.len()),
                });
            };
            let target = store.resolve_node(node)?;
            if !spec.allows(store.get(target)?.type_name()) {
                tracing::warn!(relation = %self.name, %target, "skipping edge to a disallowed target type");
                continue;
            }
            let edge = store.resolve_relationship(rel)?;
            found.push(edge);
        }
        if spec.cardinality == Cardinality::One && found.len() > 1 {
            return Err(Error::Multiplicity { expected: 1, found: found.len() });
        }

        let owner = self.owner;
        let mut statuses = Vec::with_capacity(found.len());
        for edge in &found {
            statuses.push(store.get(*edge)?.status());
        }
        let state = state_mut(&mut store, owner, &self.name)?;
        for (edge, status) in found.into_iter().zip(statuses) {
            let unset_locally = state.loaded.contains(&edge) && !state.active.contains(&edge);
            state.loaded.insert(edge);
            if !unset_locally && status != Status::Released {
                state.active.insert(edge);
            }
        }
        state.fetched = true;
        drop(store);
        self.targets()
    }

    /// Targets, loading first according to the relation's load mode.
    pub async fn fetch<P: Protocol>(&self, graph: &Graph<P>) -> Result<Vec<ContentKey>> {
        let (mode, fetched, persisted) = {
            let store = self.store()?;
            let store = store.read();
            let state = state(&store, self.owner, &self.name)?;
            (state.spec.load, state.fetched, store.get(self.owner)?.identity().is_some())
        };
        if mode == LoadMode::Lazy && !fetched && persisted {
            return self.load(graph).await;
        }
        self.targets()
    }
}
