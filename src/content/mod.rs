//! # Content
//!
//! The mutable backing record of one node or edge. Typed entities are thin
//! accessors over a [`Content`] living in the graph's [`Store`]; they never
//! cache values of their own.
//!
//! Dirty tracking compares `active` (what the application wants) against
//! `loaded` (what the server last reported). Only the difference is written.

pub mod status;
pub mod store;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::model::{PropertyMap, ServerId, Value};
use crate::relation::RelationState;
use crate::schema::TypeInfo;
use crate::{Error, Result};

pub use status::{Event, Status, Transition};
pub use store::Store;

/// Stable key of a content record inside a [`Store`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentKey(pub u64);

impl std::fmt::Display for ContentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What kind of graph element a content record backs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Kind {
    Node,
    /// Endpoints are fixed when the edge is fastened.
    Edge {
        rel_type: String,
        source: ContentKey,
        target: ContentKey,
    },
}

/// Backing record for one node or edge.
#[derive(Debug, Clone)]
pub struct Content {
    pub(crate) key: ContentKey,
    pub(crate) kind: Kind,
    pub(crate) schema: Option<Arc<TypeInfo>>,
    pub(crate) identity: Option<ServerId>,
    pub(crate) labels: BTreeMap<String, Status>,
    pub(crate) active: PropertyMap,
    pub(crate) loaded: PropertyMap,
    pub(crate) status: Status,
    pub(crate) relations: BTreeMap<String, RelationState>,
}

impl Content {
    pub(crate) fn new(key: ContentKey, kind: Kind, schema: Option<Arc<TypeInfo>>) -> Self {
        let mut content = Self {
            key,
            kind,
            schema: None,
            identity: None,
            labels: BTreeMap::new(),
            active: PropertyMap::new(),
            loaded: PropertyMap::new(),
            status: Status::Fastened,
            relations: BTreeMap::new(),
        };
        if let Some(info) = schema {
            for label in info.labels() {
                content.labels.insert((*label).to_string(), Status::Fastened);
            }
            for spec in info.relations() {
                content.relations.insert(spec.name.to_string(), RelationState::new(spec.clone()));
            }
            content.schema = Some(info);
        }
        content
    }

    /// Give a placeholder its type once the server reveals its labels.
    pub(crate) fn upgrade_schema(&mut self, info: Arc<TypeInfo>) {
        if self.schema.is_some() {
            return;
        }
        for spec in info.relations() {
            self.relations.entry(spec.name.to_string())
                .or_insert_with(|| RelationState::new(spec.clone()));
        }
        self.schema = Some(info);
    }

    pub fn key(&self) -> ContentKey { self.key }
    pub fn kind(&self) -> &Kind { &self.kind }
    pub fn identity(&self) -> Option<ServerId> { self.identity }
    pub fn status(&self) -> Status { self.status }
    pub fn active(&self) -> &PropertyMap { &self.active }
    pub fn loaded(&self) -> &PropertyMap { &self.loaded }
    pub fn schema(&self) -> Option<&Arc<TypeInfo>> { self.schema.as_ref() }

    pub fn type_name(&self) -> Option<&'static str> {
        self.schema.as_ref().map(|s| s.name())
    }

    pub fn is_edge(&self) -> bool {
        matches!(self.kind, Kind::Edge { .. })
    }

    /// `(source, target)` for edges.
    pub fn endpoints(&self) -> Option<(ContentKey, ContentKey)> {
        match &self.kind {
            Kind::Edge { source, target, .. } => Some((*source, *target)),
            Kind::Node => None,
        }
    }

    pub fn rel_type(&self) -> Option<&str> {
        match &self.kind {
            Kind::Edge { rel_type, .. } => Some(rel_type),
            Kind::Node => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.active.get(key)
    }

    /// Setting `Null` removes the property.
    pub(crate) fn set(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        if value.is_null() {
            self.active.shift_remove(&key);
        } else {
            self.active.insert(key, value);
        }
    }

    pub(crate) fn remove(&mut self, key: &str) -> Option<Value> {
        self.active.shift_remove(key)
    }

    /// Properties whose active value differs from the loaded one.
    ///
    /// A key present in `loaded` but removed from `active` is reported as
    /// `Null`, which a `SET n += $changes` turns into a removal.
    pub fn changes(&self) -> PropertyMap {
        let mut changes: PropertyMap = self.active.iter()
            .filter(|(k, v)| self.loaded.get(*k) != Some(*v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for key in self.loaded.keys() {
            if !self.active.contains_key(key) {
                changes.insert(key.clone(), Value::Null);
            }
        }
        changes
    }

    /// Properties changed, or labels waiting to be added/removed.
    pub fn is_dirty(&self) -> bool {
        !self.changes().is_empty() || self.has_pending_labels()
    }

    // ========================================================================
    // Labels
    // ========================================================================

    /// Labels the element carries or will carry once committed.
    pub fn labels(&self) -> Vec<&str> {
        self.labels.iter()
            .filter(|(_, s)| !matches!(s, Status::Released | Status::Detached))
            .map(|(l, _)| l.as_str())
            .collect()
    }

    pub(crate) fn labels_with(&self, status: Status) -> Vec<&str> {
        self.labels.iter()
            .filter(|(_, s)| **s == status)
            .map(|(l, _)| l.as_str())
            .collect()
    }

    fn has_pending_labels(&self) -> bool {
        self.status == Status::Attached
            && self.labels.values().any(|s| matches!(s, Status::Inducted | Status::Released))
    }

    pub(crate) fn add_label(&mut self, label: &str) -> Result<()> {
        let next = match (self.labels.get(label).copied(), self.status) {
            (_, Status::Released | Status::Detached) => {
                return Err(Error::InvalidUsage(format!(
                    "cannot label {} element {}", self.status, self.key
                )));
            }
            (Some(Status::Released), _) => Status::Attached,
            (Some(_), _) => return Ok(()),
            (None, Status::Attached) => Status::Inducted,
            (None, status) => status,
        };
        self.labels.insert(label.to_string(), next);
        Ok(())
    }

    pub(crate) fn remove_label(&mut self, label: &str) -> Result<()> {
        if self.schema.as_ref().is_some_and(|s| s.labels().contains(&label)) {
            return Err(Error::InvalidUsage(format!(
                "label {label} is declared by type {}", self.type_name().unwrap_or_default()
            )));
        }
        match self.labels.get(label).copied() {
            Some(Status::Attached) => { self.labels.insert(label.to_string(), Status::Released); }
            Some(Status::Released | Status::Detached) | None => {}
            Some(_) => { self.labels.remove(label); }
        }
        Ok(())
    }

    /// Settle label statuses after a committed CREATE or UPDATE.
    pub(crate) fn commit_labels(&mut self) {
        self.labels.retain(|_, s| !matches!(s, Status::Released | Status::Detached));
        for status in self.labels.values_mut() {
            *status = Status::Attached;
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Move through the lifecycle. Labels follow the element into and out
    /// of the graph.
    pub(crate) fn transition(&mut self, event: Event) -> Result<Status> {
        let next = self.status.on(event)?;
        match (self.status, next) {
            (Status::Fastened, Status::Inducted) => {
                for s in self.labels.values_mut() {
                    if *s == Status::Fastened { *s = Status::Inducted; }
                }
            }
            (Status::Inducted, Status::Fastened) => {
                for s in self.labels.values_mut() {
                    if *s == Status::Inducted { *s = Status::Fastened; }
                }
            }
            (Status::Inducted, Status::Attached) => self.commit_labels(),
            _ => {}
        }
        self.status = next;
        Ok(next)
    }

    /// Fold a freshly resolved property map into this record.
    ///
    /// `loaded` always takes the fresh value. `active` takes it only where
    /// the application had not changed the property locally, so pending
    /// edits survive and are written on the next commit.
    pub(crate) fn reconcile(&mut self, fresh: &PropertyMap) {
        let keys: BTreeSet<String> = fresh.keys().chain(self.loaded.keys()).cloned().collect();
        for key in keys {
            let untouched = self.active.get(&key) == self.loaded.get(&key);
            match fresh.get(&key).filter(|v| !v.is_null()) {
                Some(value) => {
                    if untouched {
                        self.active.insert(key.clone(), value.clone());
                    }
                    self.loaded.insert(key, value.clone());
                }
                None => {
                    if untouched {
                        self.active.shift_remove(&key);
                    }
                    self.loaded.shift_remove(&key);
                }
            }
        }
    }

    /// Add server-reported labels as persisted.
    pub(crate) fn reconcile_labels<'a>(&mut self, labels: impl IntoIterator<Item = &'a String>) {
        for label in labels {
            self.labels.entry(label.clone()).or_insert(Status::Attached);
        }
    }

    /// Properties that are not `Null`, as sent in a CREATE.
    pub(crate) fn creatable(&self) -> PropertyMap {
        self.active.iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::props;
    use proptest::prelude::*;

    fn node() -> Content {
        Content::new(ContentKey(1), Kind::Node, None)
    }

    #[test]
    fn test_changes_are_the_diff() {
        let mut c = node();
        c.set("name", Value::from("A"));
        c.set("age", Value::from(1));
        c.reconcile(&props([("name", Value::from("A")), ("age", Value::from(1))]));
        assert!(c.changes().is_empty());

        c.set("age", Value::from(2));
        assert_eq!(c.changes(), props([("age", 2)]));
    }

    #[test]
    fn test_removed_property_is_a_null_change() {
        let mut c = node();
        c.reconcile(&props([("age", 1)]));
        c.remove("age");
        assert_eq!(c.changes(), props([("age", Value::Null)]));
    }

    #[test]
    fn test_null_is_absence() {
        let mut c = node();
        c.set("age", Value::Null);
        assert!(c.active().is_empty());
        assert!(c.changes().is_empty());

        c.reconcile(&props([("age", Value::from(1)), ("nick", Value::Null)]));
        assert!(!c.loaded().contains_key("nick"));
        c.set("age", Value::Null);
        assert_eq!(c.changes(), props([("age", Value::Null)]));
        c.reconcile(&PropertyMap::new());
        assert!(c.changes().is_empty());
    }

    #[test]
    fn test_foreign_write_wins_over_untouched_value() {
        let mut c = node();
        c.reconcile(&props([("age", 1)]));
        c.reconcile(&props([("age", 5)]));
        assert_eq!(c.get("age"), Some(&Value::Int(5)));
        assert_eq!(c.loaded().get("age"), Some(&Value::Int(5)));
    }

    #[test]
    fn test_local_edit_survives_foreign_write() {
        let mut c = node();
        c.reconcile(&props([("age", 1)]));
        c.set("age", Value::from(2));
        c.reconcile(&props([("age", 5)]));
        assert_eq!(c.get("age"), Some(&Value::Int(2)));
        assert_eq!(c.loaded().get("age"), Some(&Value::Int(5)));
        assert_eq!(c.changes(), props([("age", 2)]));
    }

    #[test]
    fn test_loaded_is_a_copy() {
        let mut c = node();
        c.reconcile(&props([("tags", Value::from(vec!["a"]))]));
        if let Some(Value::List(items)) = c.active.get_mut("tags") {
            items.push(Value::from("b"));
        }
        assert_eq!(c.loaded().get("tags"), Some(&Value::from(vec!["a"])));
        assert_eq!(c.changes().len(), 1);
    }

    #[test]
    fn test_label_lifecycle_on_attached_node() {
        let mut c = node();
        c.labels.insert("Person".into(), Status::Fastened);
        c.transition(Event::Attach).unwrap();
        c.transition(Event::Created).unwrap();
        assert!(!c.is_dirty());

        c.add_label("Admin").unwrap();
        assert!(c.is_dirty());
        assert_eq!(c.labels_with(Status::Inducted), vec!["Admin"]);

        c.remove_label("Person").unwrap();
        assert_eq!(c.labels(), vec!["Admin"]);
        c.commit_labels();
        assert_eq!(c.labels(), vec!["Admin"]);
        assert!(!c.is_dirty());
    }

    #[test]
    fn test_labels_follow_attach_and_detach() {
        let mut c = node();
        c.add_label("Draft").unwrap();
        c.transition(Event::Attach).unwrap();
        assert_eq!(c.labels_with(Status::Inducted), vec!["Draft"]);
        c.transition(Event::Detach).unwrap();
        assert_eq!(c.labels_with(Status::Fastened), vec!["Draft"]);
    }

    proptest! {
        #[test]
        fn prop_changes_empty_iff_active_equals_loaded(
            loaded in proptest::collection::btree_map("[a-d]", 0i64..4, 0..4),
            active in proptest::collection::btree_map("[a-d]", 0i64..4, 0..4),
        ) {
            let mut c = node();
            c.loaded = loaded.iter().map(|(k, v)| (k.clone(), Value::Int(*v))).collect();
            c.active = active.iter().map(|(k, v)| (k.clone(), Value::Int(*v))).collect();
            prop_assert_eq!(c.changes().is_empty(), c.active == c.loaded);
        }

        #[test]
        fn prop_reconcile_with_own_values_clears_changes(
            active in proptest::collection::btree_map("[a-d]", 0i64..4, 0..4),
        ) {
            let mut c = node();
            c.active = active.iter().map(|(k, v)| (k.clone(), Value::Int(*v))).collect();
            let fresh = c.active.clone();
            c.reconcile(&fresh);
            prop_assert!(c.changes().is_empty());
        }
    }
}
