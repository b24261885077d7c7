//! Typed entities: thin accessors over a [`Content`](crate::content::Content).
//!
//! An [`Entity`] or [`Edge`] owns nothing but a key into the graph's store.
//! Reads and writes go straight to the content's `active` map, so two
//! handles on the same content always agree.

use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::RwLock;

use crate::content::{Content, ContentKey, Status, Store};
use crate::model::{PropertyMap, ServerId, Value};
use crate::query::FromValue;
use crate::relation::Relation;
use crate::schema::{EdgeSchema, NodeSchema};
use crate::{Error, Result};

/// Anything that can be bound to a content record.
pub trait Element {
    /// Bind to a content, creating it on first use. Idempotent.
    fn fasten(&self) -> Result<ContentKey>;
}

impl Element for ContentKey {
    fn fasten(&self) -> Result<ContentKey> {
        Ok(*self)
    }
}

fn upgrade(store: &Weak<RwLock<Store>>) -> Result<Arc<RwLock<Store>>> {
    store.upgrade()
        .ok_or_else(|| Error::InvalidUsage("the graph owning this element was dropped".into()))
}

// ============================================================================
// Entity (nodes)
// ============================================================================

/// A node of type `T`. Clones share one binding, so a clone taken before
/// the first access still reaches the same content.
pub struct Entity<T: NodeSchema> {
    store: Weak<RwLock<Store>>,
    key: Arc<OnceLock<ContentKey>>,
    _schema: PhantomData<fn() -> T>,
}

impl<T: NodeSchema> Entity<T> {
    /// An unfastened entity. Its content is created on first access.
    pub(crate) fn new(store: Weak<RwLock<Store>>) -> Self {
        Self { store, key: Arc::new(OnceLock::new()), _schema: PhantomData }
    }

    pub(crate) fn bound(store: Weak<RwLock<Store>>, key: ContentKey) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(key);
        Self { store, key: Arc::new(cell), _schema: PhantomData }
    }

    /// The content key, if fastened.
    pub fn key(&self) -> Option<ContentKey> {
        self.key.get().copied()
    }

    fn read<R>(&self, f: impl FnOnce(&Content) -> Result<R>) -> Result<R> {
        let key = self.fasten()?;
        let store = upgrade(&self.store)?;
        let store = store.read();
        f(store.get(key)?)
    }

    fn write<R>(&self, f: impl FnOnce(&mut Content) -> Result<R>) -> Result<R> {
        let key = self.fasten()?;
        let store = upgrade(&self.store)?;
        let mut store = store.write();
        f(store.get_mut(key)?)
    }

    /// Current value of a declared field, `Null` when unset.
    pub fn get(&self, field: &str) -> Result<Value> {
        self.read(|c| {
            check(c, field)?;
            Ok(c.get(field).cloned().unwrap_or(Value::Null))
        })
    }

    pub fn get_as<V: FromValue>(&self, field: &str) -> Result<V> {
        V::from_value(&self.get(field)?)
    }

    pub fn set(&self, field: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        self.write(|c| {
            check(c, field)?;
            writable(c)?;
            c.set(field, value);
            Ok(())
        })
    }

    pub fn remove(&self, field: &str) -> Result<()> {
        self.write(|c| {
            check(c, field)?;
            writable(c)?;
            c.remove(field);
            Ok(())
        })
    }

    pub fn status(&self) -> Result<Status> {
        self.read(|c| Ok(c.status()))
    }

    pub fn identity(&self) -> Result<Option<ServerId>> {
        self.read(|c| Ok(c.identity()))
    }

    pub fn changes(&self) -> Result<PropertyMap> {
        self.read(|c| Ok(c.changes()))
    }

    pub fn labels(&self) -> Result<Vec<String>> {
        self.read(|c| Ok(c.labels().into_iter().map(String::from).collect()))
    }

    pub fn add_label(&self, label: &str) -> Result<()> {
        self.write(|c| c.add_label(label))
    }

    pub fn remove_label(&self, label: &str) -> Result<()> {
        self.write(|c| c.remove_label(label))
    }

    /// A relationship field declared by `T`.
    pub fn relation(&self, name: &str) -> Result<Relation> {
        let key = self.fasten()?;
        self.read(|c| {
            if c.relations.contains_key(name) {
                Ok(())
            } else {
                Err(Error::InvalidUsage(format!("{} has no relationship {name:?}", T::NAME)))
            }
        })?;
        Ok(Relation::new(self.store.clone(), key, name))
    }

    /// Inspect the backing content.
    pub fn with_content<R>(&self, f: impl FnOnce(&Content) -> R) -> Result<R> {
        self.read(|c| Ok(f(c)))
    }
}

impl<T: NodeSchema> Element for Entity<T> {
    fn fasten(&self) -> Result<ContentKey> {
        let store = upgrade(&self.store)?;
        if let Some(key) = self.key.get() {
            return Ok(store.read().canonical(*key));
        }
        let mut guard = store.write();
        // Another clone may have won the race for the write lock.
        if let Some(key) = self.key.get() {
            return Ok(guard.canonical(*key));
        }
        let info = guard.registry().node(T::NAME).cloned().ok_or_else(|| {
            Error::InvalidUsage(format!("node type {} is not registered", T::NAME))
        })?;
        let key = guard.fasten_node(Some(info));
        Ok(*self.key.get_or_init(|| key))
    }
}

impl<T: NodeSchema> Clone for Entity<T> {
    fn clone(&self) -> Self {
        Self { store: self.store.clone(), key: Arc::clone(&self.key), _schema: PhantomData }
    }
}

impl<T: NodeSchema> fmt::Debug for Entity<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("type", &T::NAME)
            .field("key", &self.key.get())
            .finish()
    }
}

// ============================================================================
// Edge
// ============================================================================

/// An edge of type `E`. Always bound: edges are created by relations or by
/// resolving protocol records.
pub struct Edge<E: EdgeSchema> {
    store: Weak<RwLock<Store>>,
    key: ContentKey,
    _schema: PhantomData<fn() -> E>,
}

impl<E: EdgeSchema> Edge<E> {
    pub(crate) fn bound(store: Weak<RwLock<Store>>, key: ContentKey) -> Self {
        Self { store, key, _schema: PhantomData }
    }

    pub fn key(&self) -> ContentKey {
        self.key
    }

    fn read<R>(&self, f: impl FnOnce(&Content) -> Result<R>) -> Result<R> {
        let store = upgrade(&self.store)?;
        let store = store.read();
        f(store.get(self.key)?)
    }

    pub fn get(&self, field: &str) -> Result<Value> {
        self.read(|c| {
            check(c, field)?;
            Ok(c.get(field).cloned().unwrap_or(Value::Null))
        })
    }

    pub fn get_as<V: FromValue>(&self, field: &str) -> Result<V> {
        V::from_value(&self.get(field)?)
    }

    pub fn set(&self, field: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let store = upgrade(&self.store)?;
        let mut store = store.write();
        let content = store.get_mut(self.key)?;
        check(content, field)?;
        writable(content)?;
        content.set(field, value);
        Ok(())
    }

    pub fn status(&self) -> Result<Status> {
        self.read(|c| Ok(c.status()))
    }

    pub fn identity(&self) -> Result<Option<ServerId>> {
        self.read(|c| Ok(c.identity()))
    }

    pub fn changes(&self) -> Result<PropertyMap> {
        self.read(|c| Ok(c.changes()))
    }

    /// `(source, target)` content keys.
    pub fn endpoints(&self) -> Result<(ContentKey, ContentKey)> {
        self.read(|c| {
            c.endpoints().ok_or_else(|| Error::InvalidUsage(format!("{} is not an edge", self.key)))
        })
    }
}

impl<E: EdgeSchema> Element for Edge<E> {
    fn fasten(&self) -> Result<ContentKey> {
        let store = upgrade(&self.store)?;
        Ok(store.read().canonical(self.key))
    }
}

impl<E: EdgeSchema> Clone for Edge<E> {
    fn clone(&self) -> Self {
        Self { store: self.store.clone(), key: self.key, _schema: PhantomData }
    }
}

impl<E: EdgeSchema> fmt::Debug for Edge<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Edge").field("type", &E::TYPE).field("key", &self.key).finish()
    }
}

fn check(content: &Content, field: &str) -> Result<()> {
    match content.schema() {
        Some(schema) => schema.check_field(field),
        None => Ok(()),
    }
}

fn writable(content: &Content) -> Result<()> {
    if content.status() == Status::Detached {
        return Err(Error::InvalidUsage(format!(
            "{} is detached; its properties can no longer change", content.key()
        )));
    }
    Ok(())
}
