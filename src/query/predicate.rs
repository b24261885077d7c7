//! Predicate builder.
//!
//! A [`Where`] is bound to one pattern alias. Each method returns a [`Term`]
//! that renders into a [`Query`] by registering its operand as a fresh
//! parameter and returning a fragment that references the placeholder.

use std::fmt;

use chrono::{DateTime, Utc};

use super::{escape, Query};
use crate::entity::{Edge, Entity};
use crate::model::{ServerId, Value};
use crate::schema::{EdgeSchema, NodeSchema};
use crate::{Error, Result};

type Render = dyn Fn(&mut Query) -> Result<String> + Send + Sync;

/// A renderable predicate.
pub struct Term(Box<Render>);

impl Term {
    fn new(render: impl Fn(&mut Query) -> Result<String> + Send + Sync + 'static) -> Self {
        Self(Box::new(render))
    }

    /// Register this term's parameters on `query` and return its fragment.
    pub fn render(&self, query: &mut Query) -> Result<String> {
        (self.0)(query)
    }
}

impl fmt::Debug for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Term(..)")
    }
}

// ============================================================================
// Operands
// ============================================================================

/// Values usable on the right-hand side of a comparison.
pub trait IntoOperand {
    fn into_operand(self) -> Result<Value>;
}

macro_rules! plain_operand {
    ($($ty:ty),* $(,)?) => {
        $(impl IntoOperand for $ty {
            fn into_operand(self) -> Result<Value> {
                Ok(Value::from(self))
            }
        })*
    };
}

plain_operand!(Value, bool, i32, i64, f64, String, &str, ServerId, DateTime<Utc>, Vec<Value>);

impl IntoOperand for Vec<&str> {
    fn into_operand(self) -> Result<Value> {
        Ok(Value::List(self.into_iter().map(Value::from).collect()))
    }
}

impl IntoOperand for Vec<i64> {
    fn into_operand(self) -> Result<Value> {
        Ok(Value::List(self.into_iter().map(Value::from).collect()))
    }
}

/// An entity compares by its server identity.
impl<T: NodeSchema> IntoOperand for &Entity<T> {
    fn into_operand(self) -> Result<Value> {
        self.identity()?.map(Value::from).ok_or_else(|| {
            Error::InvalidUsage(format!("a {} without identity cannot appear in a predicate", T::NAME))
        })
    }
}

impl<E: EdgeSchema> IntoOperand for &Edge<E> {
    fn into_operand(self) -> Result<Value> {
        self.identity()?.map(Value::from).ok_or_else(|| {
            Error::InvalidUsage(format!("a {} without identity cannot appear in a predicate", E::TYPE))
        })
    }
}

// ============================================================================
// Builder
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Where {
    alias: String,
}

impl Where {
    pub fn new(alias: impl Into<String>) -> Self {
        Self { alias: alias.into() }
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// A builder for another alias in the same pattern.
    pub fn scope(&self, alias: impl Into<String>) -> Where {
        Where::new(alias)
    }

    /// Build one term against another alias.
    pub fn with(&self, alias: impl Into<String>, build: impl FnOnce(&Where) -> Term) -> Term {
        build(&self.scope(alias))
    }

    fn compare(&self, field: &str, op: &'static str, value: impl IntoOperand) -> Term {
        let subject = format!("{}.{}", self.alias, escape(field));
        // Operand errors surface when the term is rendered.
        let operand = value.into_operand().map_err(|e| e.to_string());
        Term::new(move |query| {
            let value = operand.clone().map_err(Error::InvalidUsage)?;
            Ok(format!("{subject} {op} {}", query.bind(value)))
        })
    }

    pub fn eq(&self, field: &str, value: impl IntoOperand) -> Term {
        self.compare(field, "=", value)
    }

    pub fn ne(&self, field: &str, value: impl IntoOperand) -> Term {
        self.compare(field, "<>", value)
    }

    pub fn gt(&self, field: &str, value: impl IntoOperand) -> Term {
        self.compare(field, ">", value)
    }

    pub fn gte(&self, field: &str, value: impl IntoOperand) -> Term {
        self.compare(field, ">=", value)
    }

    pub fn lt(&self, field: &str, value: impl IntoOperand) -> Term {
        self.compare(field, "<", value)
    }

    pub fn lte(&self, field: &str, value: impl IntoOperand) -> Term {
        self.compare(field, "<=", value)
    }

    pub fn is_in(&self, field: &str, values: impl IntoOperand) -> Term {
        self.compare(field, "IN", values)
    }

    pub fn contains(&self, field: &str, value: impl IntoOperand) -> Term {
        self.compare(field, "CONTAINS", value)
    }

    pub fn starts_with(&self, field: &str, value: impl IntoOperand) -> Term {
        self.compare(field, "STARTS WITH", value)
    }

    pub fn ends_with(&self, field: &str, value: impl IntoOperand) -> Term {
        self.compare(field, "ENDS WITH", value)
    }

    pub fn is_null(&self, field: &str) -> Term {
        let fragment = format!("{}.{} IS NULL", self.alias, escape(field));
        Term::new(move |_| Ok(fragment.clone()))
    }

    pub fn not_null(&self, field: &str) -> Term {
        let fragment = format!("{}.{} IS NOT NULL", self.alias, escape(field));
        Term::new(move |_| Ok(fragment.clone()))
    }

    /// Match on server identity.
    pub fn id(&self, value: impl IntoOperand) -> Term {
        let alias = self.alias.clone();
        let operand = value.into_operand().map_err(|e| e.to_string());
        Term::new(move |query| {
            let value = operand.clone().map_err(Error::InvalidUsage)?;
            Ok(format!("id({alias}) = {}", query.bind(value)))
        })
    }

    pub fn has_label(&self, label: &str) -> Term {
        let fragment = format!("{}:{}", self.alias, escape(label));
        Term::new(move |_| Ok(fragment.clone()))
    }

    /// A fragment used verbatim. Placeholders in it must be declared on the
    /// query separately.
    pub fn raw(&self, fragment: impl Into<String>) -> Term {
        let fragment = fragment.into();
        Term::new(move |_| Ok(fragment.clone()))
    }

    pub fn all(&self, terms: impl IntoIterator<Item = Term>) -> Term {
        join(terms.into_iter().collect(), " AND ", "true")
    }

    pub fn any(&self, terms: impl IntoIterator<Item = Term>) -> Term {
        join(terms.into_iter().collect(), " OR ", "false")
    }

    pub fn not(&self, term: Term) -> Term {
        Term::new(move |query| Ok(format!("NOT ({})", term.render(query)?)))
    }
}

fn join(terms: Vec<Term>, separator: &'static str, empty: &'static str) -> Term {
    Term::new(move |query| {
        let parts = terms.iter()
            .map(|t| t.render(query))
            .collect::<Result<Vec<_>>>()?;
        Ok(match parts.len() {
            0 => empty.to_string(),
            1 => parts.into_iter().next().unwrap_or_default(),
            _ => format!("({})", parts.join(separator)),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_comparison_binds_parameter() {
        let mut q = Query::new();
        let term = Where::new("n").eq("name", "Ada");
        assert_eq!(term.render(&mut q).unwrap(), "n.name = $p1");
        assert_eq!(q.params().get("p1"), Some(&Value::from("Ada")));
    }

    #[test]
    fn test_composition() {
        let w = Where::new("n");
        let term = w.all([
            w.gt("age", 30),
            w.any([w.eq("city", "Oslo"), w.not(w.is_null("email"))]),
        ]);
        let mut q = Query::new();
        assert_eq!(
            term.render(&mut q).unwrap(),
            "(n.age > $p1 AND (n.city = $p2 OR NOT (n.email IS NULL)))"
        );
        assert_eq!(q.params().len(), 2);
    }

    #[test]
    fn test_scoping_rebinds_alias() {
        let w = Where::new("n");
        let term = w.all([w.eq("name", "Ada"), w.with("t", |t| t.has_label("Admin"))]);
        let mut q = Query::new();
        assert_eq!(term.render(&mut q).unwrap(), "(n.name = $p1 AND t:Admin)");
        assert_eq!(w.alias(), "n");
    }

    #[test]
    fn test_empty_composites() {
        let w = Where::new("n");
        let mut q = Query::new();
        assert_eq!(w.all([]).render(&mut q).unwrap(), "true");
        assert_eq!(w.any([]).render(&mut q).unwrap(), "false");
    }

    #[test]
    fn test_id_and_membership() {
        let w = Where::new("r");
        let mut q = Query::new();
        assert_eq!(w.id(ServerId(7)).render(&mut q).unwrap(), "id(r) = $p1");
        assert_eq!(w.is_in("kind", vec!["a", "b"]).render(&mut q).unwrap(), "r.kind IN $p2");
        assert_eq!(q.params().get("p1"), Some(&Value::Int(7)));
    }
}
