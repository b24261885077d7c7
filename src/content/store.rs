//! The graph's content store.
//!
//! Sole owner of every [`Content`]. Entities, edges and relations hold
//! [`ContentKey`]s into it. A content is *tracked* (part of the graph's node
//! or edge store) while its status is Inducted, Attached or Released.

use std::collections::BTreeSet;
use std::sync::Arc;

use hashbrown::HashMap;

use crate::model::{Node, PropertyMap, Relationship, ServerId};
use crate::schema::{Registry, TypeInfo};
use crate::{Error, Result};
use super::{Content, ContentKey, Event, Kind, Status};

#[derive(Debug, Default)]
pub struct Store {
    pub(crate) registry: Registry,
    contents: HashMap<ContentKey, Content>,
    nodes: BTreeSet<ContentKey>,
    edges: BTreeSet<ContentKey>,
    node_ids: HashMap<ServerId, ContentKey>,
    edge_ids: HashMap<ServerId, ContentKey>,
    /// Keys of duplicates that were merged away, pointing at the survivor.
    redirects: HashMap<ContentKey, ContentKey>,
    next_key: u64,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn next_key(&mut self) -> ContentKey {
        self.next_key += 1;
        ContentKey(self.next_key)
    }

    /// Follow merge redirects to the surviving key.
    pub fn canonical(&self, mut key: ContentKey) -> ContentKey {
        while let Some(next) = self.redirects.get(&key) {
            key = *next;
        }
        key
    }

    pub fn get(&self, key: ContentKey) -> Result<&Content> {
        let key = self.canonical(key);
        self.contents.get(&key)
            .ok_or_else(|| Error::NotFound(format!("content {key}")))
    }

    pub fn get_mut(&mut self, key: ContentKey) -> Result<&mut Content> {
        let key = self.canonical(key);
        self.contents.get_mut(&key)
            .ok_or_else(|| Error::NotFound(format!("content {key}")))
    }

    pub fn tracked_nodes(&self) -> Vec<ContentKey> {
        self.nodes.iter().copied().collect()
    }

    pub fn tracked_edges(&self) -> Vec<ContentKey> {
        self.edges.iter().copied().collect()
    }

    pub fn is_tracked(&self, key: ContentKey) -> bool {
        let key = self.canonical(key);
        self.nodes.contains(&key) || self.edges.contains(&key)
    }

    pub fn node_by_identity(&self, id: ServerId) -> Option<ContentKey> {
        self.node_ids.get(&id).copied()
    }

    pub fn edge_by_identity(&self, id: ServerId) -> Option<ContentKey> {
        self.edge_ids.get(&id).copied()
    }

    // ========================================================================
    // Fastening
    // ========================================================================

    pub(crate) fn fasten_node(&mut self, schema: Option<Arc<TypeInfo>>) -> ContentKey {
        let key = self.next_key();
        self.contents.insert(key, Content::new(key, Kind::Node, schema));
        key
    }

    /// Create an edge between two existing contents. The endpoints are
    /// fixed for the lifetime of the edge.
    pub(crate) fn fasten_edge(
        &mut self,
        rel_type: &str,
        source: ContentKey,
        target: ContentKey,
    ) -> Result<ContentKey> {
        let source = self.canonical(source);
        let target = self.canonical(target);
        for end in [source, target] {
            if self.get(end)?.is_edge() {
                return Err(Error::InvalidUsage(format!("edge endpoint {end} is not a node")));
            }
        }
        let schema = self.registry.edge(rel_type).cloned();
        let key = self.next_key();
        let kind = Kind::Edge { rel_type: rel_type.to_string(), source, target };
        self.contents.insert(key, Content::new(key, kind, schema));
        Ok(key)
    }

    // ========================================================================
    // Attach / detach
    // ========================================================================

    pub(crate) fn attach(&mut self, key: ContentKey) -> Result<Status> {
        let content = self.get_mut(key)?;
        let status = content.transition(Event::Attach)?;
        let (key, edge) = (content.key, content.is_edge());
        self.track(key, edge);
        Ok(status)
    }

    pub(crate) fn detach(&mut self, key: ContentKey) -> Result<Status> {
        let content = self.get_mut(key)?;
        let status = content.transition(Event::Detach)?;
        let (key, edge) = (content.key, content.is_edge());
        if status == Status::Fastened {
            self.untrack(key, edge);
            if !edge {
                // Never-committed edges cannot outlive their endpoint's induction.
                for e in self.edges_touching(key) {
                    if self.get(e)?.status() == Status::Inducted {
                        self.detach(e)?;
                    }
                }
            }
        }
        Ok(status)
    }

    fn track(&mut self, key: ContentKey, edge: bool) {
        if edge { self.edges.insert(key); } else { self.nodes.insert(key); }
    }

    fn untrack(&mut self, key: ContentKey, edge: bool) {
        if edge { self.edges.remove(&key); } else { self.nodes.remove(&key); }
    }

    /// Tracked edges with `key` as an endpoint.
    pub fn edges_touching(&self, key: ContentKey) -> Vec<ContentKey> {
        let key = self.canonical(key);
        self.edges.iter()
            .filter(|e| {
                self.contents.get(*e)
                    .and_then(|c| c.endpoints())
                    .is_some_and(|(s, t)| s == key || t == key)
            })
            .copied()
            .collect()
    }

    // ========================================================================
    // Commit reconciliation
    // ========================================================================

    /// Give a freshly created content its server identity.
    ///
    /// If another content already holds that identity, the two are the same
    /// persisted element: the existing one survives, the new one's relations
    /// move over, and its key redirects to the survivor. Returns the key
    /// that now owns the identity.
    pub(crate) fn assign_identity(&mut self, key: ContentKey, id: ServerId) -> Result<ContentKey> {
        let key = self.canonical(key);
        let edge = self.get(key)?.is_edge();
        let index = if edge { &mut self.edge_ids } else { &mut self.node_ids };
        match index.get(&id).copied() {
            Some(winner) if winner != key => {
                tracing::debug!(%key, %winner, identity = %id, "merging duplicate content");
                self.merge_into(key, winner)?;
                Ok(winner)
            }
            _ => {
                index.insert(id, key);
                self.get_mut(key)?.identity = Some(id);
                Ok(key)
            }
        }
    }

    fn merge_into(&mut self, loser: ContentKey, winner: ContentKey) -> Result<()> {
        let lost = self.contents.remove(&loser)
            .ok_or_else(|| Error::NotFound(format!("content {loser}")))?;
        self.untrack(loser, lost.is_edge());
        self.redirects.insert(loser, winner);

        for content in self.contents.values_mut() {
            if let Kind::Edge { source, target, .. } = &mut content.kind {
                if *source == loser { *source = winner; }
                if *target == loser { *target = winner; }
            }
        }

        let survivor = self.get_mut(winner)?;
        for (name, state) in lost.relations {
            match survivor.relations.get_mut(&name) {
                Some(existing) => existing.absorb(state),
                None => { survivor.relations.insert(name, state); }
            }
        }
        for (label, status) in lost.labels {
            survivor.labels.entry(label).or_insert(status);
        }
        Ok(())
    }

    /// Settle a content after the server confirmed its deletion.
    pub(crate) fn forget(&mut self, key: ContentKey) -> Result<()> {
        let content = self.get_mut(key)?;
        content.transition(Event::Deleted)?;
        let (key, edge, identity) = (content.key, content.is_edge(), content.identity.take());
        self.untrack(key, edge);
        if let Some(id) = identity {
            if edge { self.edge_ids.remove(&id); } else { self.node_ids.remove(&id); }
        }
        Ok(())
    }

    // ========================================================================
    // Resolving protocol records
    // ========================================================================

    /// Fold a server node into the store, creating an Attached content for
    /// identities not seen before.
    pub fn resolve_node(&mut self, node: &Node) -> Result<ContentKey> {
        let key = match self.node_ids.get(&node.id).copied() {
            Some(key) => key,
            None => {
                let schema = self.registry.node_for_labels(&node.labels).cloned();
                let key = self.fasten_node(schema);
                self.adopt(key, node.id, Kind::Node)?;
                key
            }
        };
        let schema = self.registry.node_for_labels(&node.labels).cloned();
        let content = self.get_mut(key)?;
        if let Some(info) = schema {
            content.upgrade_schema(info);
        }
        content.reconcile(&node.properties);
        content.reconcile_labels(&node.labels);
        Ok(key)
    }

    /// Fold a server relationship into the store. Endpoints not seen yet
    /// get placeholder node contents carrying only their identity.
    pub fn resolve_relationship(&mut self, rel: &Relationship) -> Result<ContentKey> {
        let key = match self.edge_ids.get(&rel.id).copied() {
            Some(key) => key,
            None => {
                let source = self.placeholder(rel.src)?;
                let target = self.placeholder(rel.dst)?;
                let key = self.fasten_edge(&rel.rel_type, source, target)?;
                let kind = self.get(key)?.kind.clone();
                self.adopt(key, rel.id, kind)?;
                key
            }
        };
        self.get_mut(key)?.reconcile(&rel.properties);
        Ok(key)
    }

    fn placeholder(&mut self, id: ServerId) -> Result<ContentKey> {
        if let Some(key) = self.node_ids.get(&id) {
            return Ok(*key);
        }
        let key = self.fasten_node(None);
        self.adopt(key, id, Kind::Node)?;
        Ok(key)
    }

    /// Mark a fresh content as persisted under `id`.
    fn adopt(&mut self, key: ContentKey, id: ServerId, kind: Kind) -> Result<()> {
        let edge = matches!(kind, Kind::Edge { .. });
        let content = self.get_mut(key)?;
        content.identity = Some(id);
        content.status = Status::Attached;
        content.commit_labels();
        if edge { self.edge_ids.insert(id, key); } else { self.node_ids.insert(id, key); }
        self.track(key, edge);
        Ok(())
    }

    /// Properties of a tracked content, for building parameters.
    pub(crate) fn snapshot(&self, key: ContentKey) -> Result<PropertyMap> {
        Ok(self.get(key)?.creatable())
    }
}
