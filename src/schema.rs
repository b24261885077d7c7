//! Statically declared entity types.
//!
//! Every node or edge type describes itself once through [`NodeSchema`] or
//! [`EdgeSchema`]. Registration turns the declaration into a [`TypeInfo`]
//! and validates it, so nothing is discovered by reflection at call time.

use std::sync::Arc;

use hashbrown::{HashMap, HashSet};

use crate::content::Content;
use crate::model::PropertyMap;
use crate::relation::RelationSpec;
use crate::{Error, Result};

/// A lifecycle hook. Receives the content about to be written and returns
/// the properties it wants merged into `active`.
pub type Hook = fn(&Content) -> PropertyMap;

/// A declared property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub name: &'static str,
    pub required: bool,
}

impl Field {
    pub const fn required(name: &'static str) -> Self {
        Self { name, required: true }
    }

    pub const fn optional(name: &'static str) -> Self {
        Self { name, required: false }
    }
}

/// Declaration of a node type.
pub trait NodeSchema: 'static {
    /// Type name, referenced by relationship target sets.
    const NAME: &'static str;
    const LABELS: &'static [&'static str];
    const FIELDS: &'static [Field];
    /// Fields identifying the node for idempotent (MERGE) creation.
    const KEYS: &'static [&'static str] = &[];

    fn relations() -> Vec<RelationSpec> {
        Vec::new()
    }

    fn create_hooks() -> Vec<Hook> {
        Vec::new()
    }

    fn update_hooks() -> Vec<Hook> {
        Vec::new()
    }
}

/// Declaration of an edge type.
pub trait EdgeSchema: 'static {
    const TYPE: &'static str;
    const FIELDS: &'static [Field] = &[];

    fn create_hooks() -> Vec<Hook> {
        Vec::new()
    }

    fn update_hooks() -> Vec<Hook> {
        Vec::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeKind {
    Node { labels: &'static [&'static str] },
    Edge { rel_type: &'static str },
}

/// Registered, validated form of a schema.
#[derive(Debug)]
pub struct TypeInfo {
    name: &'static str,
    kind: TypeKind,
    fields: &'static [Field],
    keys: &'static [&'static str],
    relations: Vec<Arc<RelationSpec>>,
    create_hooks: Vec<Hook>,
    update_hooks: Vec<Hook>,
}

impl TypeInfo {
    pub fn of_node<T: NodeSchema>() -> Self {
        Self {
            name: T::NAME,
            kind: TypeKind::Node { labels: T::LABELS },
            fields: T::FIELDS,
            keys: T::KEYS,
            relations: T::relations().into_iter().map(Arc::new).collect(),
            create_hooks: T::create_hooks(),
            update_hooks: T::update_hooks(),
        }
    }

    pub fn of_edge<E: EdgeSchema>() -> Self {
        Self {
            name: E::TYPE,
            kind: TypeKind::Edge { rel_type: E::TYPE },
            fields: E::FIELDS,
            keys: &[],
            relations: Vec::new(),
            create_hooks: E::create_hooks(),
            update_hooks: E::update_hooks(),
        }
    }

    pub fn name(&self) -> &'static str { self.name }
    pub fn kind(&self) -> &TypeKind { &self.kind }
    pub fn fields(&self) -> &'static [Field] { self.fields }
    pub fn keys(&self) -> &'static [&'static str] { self.keys }
    pub fn relations(&self) -> &[Arc<RelationSpec>] { &self.relations }
    pub fn create_hooks(&self) -> &[Hook] { &self.create_hooks }
    pub fn update_hooks(&self) -> &[Hook] { &self.update_hooks }

    pub fn labels(&self) -> &'static [&'static str] {
        match self.kind {
            TypeKind::Node { labels } => labels,
            TypeKind::Edge { .. } => &[],
        }
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn relation(&self, name: &str) -> Option<&Arc<RelationSpec>> {
        self.relations.iter().find(|r| r.name == name)
    }

    /// Reject access to properties the type does not declare.
    pub fn check_field(&self, name: &str) -> Result<()> {
        if self.field(name).is_some() {
            return Ok(());
        }
        Err(Error::InvalidUsage(format!(
            "{} has no accessible property {name:?}", self.name
        )))
    }

    pub fn missing_required(&self, content: &Content) -> Vec<&'static str> {
        self.fields.iter()
            .filter(|f| f.required && content.get(f.name).is_none_or(|v| v.is_null()))
            .map(|f| f.name)
            .collect()
    }
}

/// All registered types of one graph.
#[derive(Debug, Default)]
pub struct Registry {
    nodes: Vec<Arc<TypeInfo>>,
    edges: HashMap<&'static str, Arc<TypeInfo>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_node<T: NodeSchema>(&mut self) -> Result<Arc<TypeInfo>> {
        if let Some(info) = self.node(T::NAME) {
            return Ok(info.clone());
        }
        let info = TypeInfo::of_node::<T>();
        self.validate(&info)?;
        let info = Arc::new(info);
        self.nodes.push(info.clone());
        Ok(info)
    }

    pub fn register_edge<E: EdgeSchema>(&mut self) -> Result<Arc<TypeInfo>> {
        if let Some(info) = self.edges.get(E::TYPE) {
            return Ok(info.clone());
        }
        let info = TypeInfo::of_edge::<E>();
        self.validate(&info)?;
        let info = Arc::new(info);
        self.edges.insert(E::TYPE, info.clone());
        Ok(info)
    }

    fn validate(&self, info: &TypeInfo) -> Result<()> {
        let invalid = |msg: String| Err(Error::InvalidUsage(format!("type {}: {msg}", info.name)));

        let mut seen = HashSet::new();
        for field in info.fields {
            if !seen.insert(field.name) {
                return invalid(format!("field {:?} declared twice", field.name));
            }
        }
        for key in info.keys {
            if info.field(key).is_none() {
                return invalid(format!("merge key {key:?} is not a declared field"));
            }
        }
        if let TypeKind::Node { labels } = info.kind
            && labels.is_empty()
        {
            return invalid("a node type needs at least one label".into());
        }
        for spec in &info.relations {
            if !seen.insert(spec.name) {
                return invalid(format!("relationship {:?} collides with a field", spec.name));
            }
            if !self.edges.contains_key(spec.edge_type) {
                return invalid(format!(
                    "relationship {:?} uses {:?}, which is not a registered edge type",
                    spec.name, spec.edge_type
                ));
            }
        }
        Ok(())
    }

    pub fn node(&self, name: &str) -> Option<&Arc<TypeInfo>> {
        self.nodes.iter().find(|t| t.name == name)
    }

    pub fn edge(&self, rel_type: &str) -> Option<&Arc<TypeInfo>> {
        self.edges.get(rel_type)
    }

    /// The most specific registered node type whose labels a node carries.
    pub fn node_for_labels(&self, labels: &[String]) -> Option<&Arc<TypeInfo>> {
        self.nodes.iter()
            .filter(|t| t.labels().iter().all(|l| labels.iter().any(|have| have == l)))
            .fold(None, |best: Option<&Arc<TypeInfo>>, t| match best {
                Some(b) if b.labels().len() >= t.labels().len() => Some(b),
                _ => Some(t),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Owns;
    impl EdgeSchema for Owns {
        const TYPE: &'static str = "OWNS";
    }

    struct Person;
    impl NodeSchema for Person {
        const NAME: &'static str = "Person";
        const LABELS: &'static [&'static str] = &["Person"];
        const FIELDS: &'static [Field] = &[Field::required("name"), Field::optional("age")];
        const KEYS: &'static [&'static str] = &["name"];
    }

    struct Employee;
    impl NodeSchema for Employee {
        const NAME: &'static str = "Employee";
        const LABELS: &'static [&'static str] = &["Person", "Employee"];
        const FIELDS: &'static [Field] = &[Field::required("name")];
    }

    struct Owner;
    impl NodeSchema for Owner {
        const NAME: &'static str = "Owner";
        const LABELS: &'static [&'static str] = &["Owner"];
        const FIELDS: &'static [Field] = &[];
        fn relations() -> Vec<RelationSpec> {
            vec![RelationSpec::new("things", "OWNS")]
        }
    }

    struct Twice;
    impl NodeSchema for Twice {
        const NAME: &'static str = "Twice";
        const LABELS: &'static [&'static str] = &["Twice"];
        const FIELDS: &'static [Field] = &[Field::optional("a"), Field::optional("a")];
    }

    struct BadKey;
    impl NodeSchema for BadKey {
        const NAME: &'static str = "BadKey";
        const LABELS: &'static [&'static str] = &["BadKey"];
        const FIELDS: &'static [Field] = &[];
        const KEYS: &'static [&'static str] = &["uuid"];
    }

    #[test]
    fn test_relationship_needs_registered_edge_type() {
        let mut registry = Registry::new();
        assert!(matches!(registry.register_node::<Owner>(), Err(Error::InvalidUsage(_))));
        registry.register_edge::<Owns>().unwrap();
        assert!(registry.register_node::<Owner>().is_ok());
    }

    #[test]
    fn test_invalid_declarations_are_rejected() {
        let mut registry = Registry::new();
        assert!(registry.register_node::<Twice>().is_err());
        assert!(registry.register_node::<BadKey>().is_err());
    }

    #[test]
    fn test_most_specific_type_wins() {
        let mut registry = Registry::new();
        registry.register_node::<Person>().unwrap();
        registry.register_node::<Employee>().unwrap();
        let labels = vec!["Employee".to_string(), "Person".to_string()];
        assert_eq!(registry.node_for_labels(&labels).unwrap().name(), "Employee");
        let labels = vec!["Person".to_string()];
        assert_eq!(registry.node_for_labels(&labels).unwrap().name(), "Person");
        assert!(registry.node_for_labels(&["Robot".to_string()]).is_none());
    }

    #[test]
    fn test_check_field() {
        let info = TypeInfo::of_node::<Person>();
        assert!(info.check_field("age").is_ok());
        assert!(matches!(info.check_field("salary"), Err(Error::InvalidUsage(_))));
    }
}
