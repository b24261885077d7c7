//! # Statement compiler
//!
//! [`Query`] accumulates statement fragments and a named parameter map and
//! compiles them into one executable statement. [`Where`] builds predicates
//! that register their values as parameters; [`MatchQuery`] composes a
//! whole `MATCH ... RETURN` from a label set and a predicate.
//!
//! ## Expansion directives
//!
//! A fragment may contain `@expand(P)` or `@expand(P, x)`. At compile time
//! the directive is replaced by one entry per key of the map parameter `P`:
//!
//! | Directive | `P = {a: 1, b: 2}` |
//! |-----------|--------------------|
//! | `@expand(P)` | `a:$P.a,b:$P.b` |
//! | `@expand(P, x)` | `x.a=$P.a,x.b=$P.b` |

pub mod predicate;
pub mod matching;

use std::borrow::Cow;

use chrono::{DateTime, Utc};

use crate::model::value::encode_map;
use crate::model::{Node, PropertyMap, Relationship, Value};
use crate::protocol::{Protocol, Response, ResponseContent, Signal};
use crate::{Error, Result};

pub use matching::{MatchQuery, Order, Rule};
pub use predicate::{IntoOperand, Term, Where};

const DIRECTIVE: &str = "@expand(";

/// `name` as a statement identifier: unchanged when it is a plain one,
/// otherwise backtick-quoted with inner backticks doubled.
pub fn escape(name: &str) -> Cow<'_, str> {
    let mut chars = name.chars();
    let plain = chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if plain {
        Cow::Borrowed(name)
    } else {
        Cow::Owned(format!("`{}`", name.replace('`', "``")))
    }
}

/// A statement under construction plus its parameters and cached response.
#[derive(Debug, Default)]
pub struct Query {
    fragments: Vec<String>,
    params: PropertyMap,
    next_param: usize,
    responses: Option<Vec<Response>>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment. Any cached response is discarded.
    pub fn push(&mut self, fragment: impl Into<String>) -> &mut Self {
        self.responses = None;
        self.fragments.push(fragment.into());
        self
    }

    /// Declare a named parameter. Any cached response is discarded.
    pub fn param(&mut self, name: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.responses = None;
        self.params.insert(name.into(), value.into());
        self
    }

    /// Register `value` under the next free `p<n>` name and return its
    /// placeholder.
    pub fn bind(&mut self, value: Value) -> String {
        let name = loop {
            self.next_param += 1;
            let name = format!("p{}", self.next_param);
            if !self.params.contains_key(&name) {
                break name;
            }
        };
        let placeholder = format!("${name}");
        self.param(name, value);
        placeholder
    }

    pub fn params(&self) -> &PropertyMap {
        &self.params
    }

    pub fn fragments(&self) -> &[String] {
        &self.fragments
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Join the fragments and run the expansion pass.
    ///
    /// Fails before anything is sent when a directive or placeholder names
    /// an undeclared parameter, or a directive names a scalar one.
    pub fn compile(&self) -> Result<String> {
        let expanded = self.expand(&self.fragments.join("\n"))?;
        self.check_references(&expanded)?;
        Ok(expanded)
    }

    fn expand(&self, text: &str) -> Result<String> {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(start) = rest.find(DIRECTIVE) {
            out.push_str(&rest[..start]);
            let after = &rest[start + DIRECTIVE.len()..];
            let end = after.find(')')
                .ok_or_else(|| Error::Compile("unterminated @expand directive".into()))?;
            let args: Vec<&str> = after[..end].split(',').map(str::trim).collect();
            let (name, prefix) = match args.as_slice() {
                [name] if !name.is_empty() => (*name, None),
                [name, prefix] if !name.is_empty() && !prefix.is_empty() => (*name, Some(*prefix)),
                _ => {
                    return Err(Error::Compile(format!(
                        "malformed directive @expand({})", &after[..end]
                    )));
                }
            };
            out.push_str(&self.expansion(name, prefix)?);
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }

    fn expansion(&self, name: &str, prefix: Option<&str>) -> Result<String> {
        let value = self.params.get(name).ok_or_else(|| {
            Error::Compile(format!("expansion references undeclared parameter ${name}"))
        })?;
        let Value::Map(map) = value else {
            return Err(Error::Compile(format!(
                "cannot expand scalar parameter ${name} of type {}", value.type_name()
            )));
        };
        let entries: Vec<String> = map.keys()
            .map(|key| escape(key))
            .map(|key| match prefix {
                None => format!("{key}:${name}.{key}"),
                Some(alias) => format!("{alias}.{key}=${name}.{key}"),
            })
            .collect();
        Ok(entries.join(","))
    }

    /// Every `$name` outside string literals must be a declared parameter.
    fn check_references(&self, text: &str) -> Result<()> {
        let mut chars = text.chars().peekable();
        let mut quote: Option<char> = None;
        while let Some(c) = chars.next() {
            match (quote, c) {
                (Some(_), '\\') => { chars.next(); }
                (Some(q), c) if c == q => quote = None,
                (Some(_), _) => {}
                (None, '\'' | '"') => quote = Some(c),
                (None, '$') => {
                    let mut name = String::new();
                    while let Some(&n) = chars.peek() {
                        if n.is_ascii_alphanumeric() || n == '_' {
                            name.push(n);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    if !name.is_empty() && !self.params.contains_key(&name) {
                        return Err(Error::Compile(format!("undeclared parameter ${name}")));
                    }
                }
                (None, _) => {}
            }
        }
        Ok(())
    }

    /// Execute once and cache every response up to the terminal signal.
    ///
    /// A `Failure` aborts pulling and surfaces with the compiled statement.
    pub async fn responses<P: Protocol + ?Sized>(&mut self, protocol: &P) -> Result<&[Response]> {
        if self.responses.is_none() {
            let statement = self.compile()?;
            let params = encode_map(&self.params);
            tracing::debug!(%statement, params = params.len(), "running statement");
            let mut stream = protocol.run(&statement, params).await?;
            let mut collected = Vec::new();
            'pull: loop {
                let batch = stream.pull(&[Signal::Success, Signal::Failure]).await?;
                if batch.is_empty() {
                    break;
                }
                for response in batch {
                    match response.signal {
                        Signal::Failure => {
                            let message = match response.content {
                                ResponseContent::Failure { message } => message,
                                other => format!("{other:?}"),
                            };
                            return Err(Error::Remote { message, statement });
                        }
                        Signal::Success => {
                            collected.push(response);
                            break 'pull;
                        }
                        Signal::Record => collected.push(response),
                    }
                }
            }
            self.responses = Some(collected);
        }
        Ok(self.responses.as_deref().unwrap_or_default())
    }

    /// Record rows, decoded into domain values.
    pub async fn records<P: Protocol + ?Sized>(&mut self, protocol: &P) -> Result<Vec<Vec<Value>>> {
        self.responses(protocol).await?
            .iter()
            .filter_map(|r| match &r.content {
                ResponseContent::Record(fields) => Some(fields),
                _ => None,
            })
            .map(|fields| fields.iter().cloned().map(Value::decode).collect())
            .collect()
    }
}

// ============================================================================
// Typed extraction
// ============================================================================

/// Convert from Value to concrete types.
pub trait FromValue: Sized {
    fn from_value(val: &Value) -> Result<Self>;
}

fn type_error(expected: &str, val: &Value) -> Error {
    Error::TypeError { expected: expected.into(), got: val.type_name().into() }
}

impl FromValue for Value {
    fn from_value(val: &Value) -> Result<Self> {
        Ok(val.clone())
    }
}

impl FromValue for Node {
    fn from_value(val: &Value) -> Result<Self> {
        match val {
            Value::Node(n) => Ok(*n.clone()),
            _ => Err(type_error("Node", val)),
        }
    }
}

impl FromValue for Relationship {
    fn from_value(val: &Value) -> Result<Self> {
        match val {
            Value::Relationship(r) => Ok(*r.clone()),
            _ => Err(type_error("Relationship", val)),
        }
    }
}

impl FromValue for String {
    fn from_value(val: &Value) -> Result<Self> {
        match val {
            Value::String(s) => Ok(s.clone()),
            _ => Err(type_error("String", val)),
        }
    }
}

impl FromValue for i64 {
    fn from_value(val: &Value) -> Result<Self> {
        val.as_int().ok_or_else(|| type_error("Integer", val))
    }
}

impl FromValue for f64 {
    fn from_value(val: &Value) -> Result<Self> {
        val.as_float().ok_or_else(|| type_error("Float", val))
    }
}

impl FromValue for bool {
    fn from_value(val: &Value) -> Result<Self> {
        match val {
            Value::Bool(b) => Ok(*b),
            _ => Err(type_error("Boolean", val)),
        }
    }
}

impl FromValue for DateTime<Utc> {
    fn from_value(val: &Value) -> Result<Self> {
        match val {
            Value::DateTime(dt) => Ok(*dt),
            Value::ZonedDateTime(z) => z.to_utc(),
            _ => Err(type_error("DateTime", val)),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(val: &Value) -> Result<Self> {
        match val {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::props;
    use crate::protocol::ScriptedProtocol;
    use pretty_assertions::assert_eq;

    fn info() -> Value {
        Value::Map(props([("a", 1), ("b", 2)]))
    }

    #[test]
    fn test_expand_without_prefix() {
        let mut q = Query::new();
        q.param("info", info());
        q.push("MERGE (n:Thing {@expand(info)})");
        assert_eq!(q.compile().unwrap(), "MERGE (n:Thing {a:$info.a,b:$info.b})");
    }

    #[test]
    fn test_expand_with_prefix() {
        let mut q = Query::new();
        q.param("info", info());
        q.push("MATCH (x) WHERE @expand(info, x)");
        assert_eq!(q.compile().unwrap(), "MATCH (x) WHERE x.a=$info.a,x.b=$info.b");
    }

    #[test]
    fn test_expand_keeps_declaration_order() {
        let mut q = Query::new();
        q.param("person", Value::Map(props([
            ("name", Value::from("Ada")),
            ("age", Value::from(36)),
            ("born", Value::from(1815)),
        ])));
        q.push("MERGE (n:Person {@expand(person)})");
        q.push("SET @expand(person, n)");
        assert_eq!(
            q.compile().unwrap(),
            "MERGE (n:Person {name:$person.name,age:$person.age,born:$person.born})\n\
             SET n.name=$person.name,n.age=$person.age,n.born=$person.born"
        );
    }

    #[test]
    fn test_expand_quotes_odd_keys() {
        let mut q = Query::new();
        q.param("info", Value::Map(props([("first name", "Ada")])));
        q.push("SET @expand(info, n)");
        assert_eq!(q.compile().unwrap(), "SET n.`first name`=$info.`first name`");
    }

    #[test]
    fn test_escape() {
        assert_eq!(escape("age"), "age");
        assert_eq!(escape("_x1"), "_x1");
        assert_eq!(escape("1st"), "`1st`");
        assert_eq!(escape("a b"), "`a b`");
        assert_eq!(escape("x`) DELETE n //"), "`x``) DELETE n //`");
    }

    #[tokio::test]
    async fn test_responses_are_cached_until_the_query_changes() {
        let protocol = ScriptedProtocol::new();
        protocol.push_records(vec![vec![Value::Int(1)]]);
        protocol.push_records(vec![vec![Value::Int(2)]]);
        protocol.push_records(vec![vec![Value::Int(3)]]);

        let mut q = Query::new();
        q.push("RETURN 1");
        assert_eq!(q.responses(&protocol).await.unwrap().len(), 2);
        assert_eq!(q.records(&protocol).await.unwrap(), vec![vec![Value::Int(1)]]);
        assert_eq!(protocol.statements().len(), 1);

        q.push("LIMIT 1");
        assert_eq!(q.records(&protocol).await.unwrap(), vec![vec![Value::Int(2)]]);
        assert_eq!(protocol.statements().len(), 2);

        q.param("unused", 0);
        assert_eq!(q.records(&protocol).await.unwrap(), vec![vec![Value::Int(3)]]);
        assert_eq!(q.records(&protocol).await.unwrap(), vec![vec![Value::Int(3)]]);
        assert_eq!(
            protocol.statements(),
            vec!["RETURN 1".to_string(), "RETURN 1\nLIMIT 1".to_string(), "RETURN 1\nLIMIT 1".to_string()]
        );
    }

    #[test]
    fn test_expand_undeclared_parameter() {
        let mut q = Query::new();
        q.push("MERGE (n {@expand(missing)})");
        assert!(matches!(q.compile(), Err(Error::Compile(_))));
    }

    #[test]
    fn test_expand_scalar_parameter() {
        let mut q = Query::new();
        q.param("age", 3);
        q.push("MERGE (n {@expand(age)})");
        let err = q.compile().unwrap_err();
        assert!(err.to_string().contains("scalar"), "{err}");
    }

    #[test]
    fn test_malformed_directives() {
        for fragment in ["@expand(", "@expand()", "@expand(a, b, c)"] {
            let mut q = Query::new();
            q.param("a", info());
            q.push(fragment);
            assert!(matches!(q.compile(), Err(Error::Compile(_))), "{fragment}");
        }
    }

    #[test]
    fn test_undeclared_placeholder() {
        let mut q = Query::new();
        q.push("MATCH (n) WHERE n.age = $age RETURN n");
        assert!(matches!(q.compile(), Err(Error::Compile(_))));
        q.param("age", 3);
        assert!(q.compile().is_ok());
    }

    #[test]
    fn test_dollar_inside_string_literal_is_ignored() {
        let mut q = Query::new();
        q.push("RETURN 'costs $5', \"and $ten\"");
        assert!(q.compile().is_ok());
    }

    #[test]
    fn test_bind_numbers_parameters() {
        let mut q = Query::new();
        q.param("p1", "taken");
        assert_eq!(q.bind(Value::Int(1)), "$p2");
        assert_eq!(q.bind(Value::Int(2)), "$p3");
        assert_eq!(q.params().len(), 3);
    }

    #[test]
    fn test_from_value() {
        assert_eq!(i64::from_value(&Value::Int(3)).unwrap(), 3);
        assert_eq!(Option::<String>::from_value(&Value::Null).unwrap(), None);
        assert!(matches!(bool::from_value(&Value::Int(1)), Err(Error::TypeError { .. })));
    }
}
