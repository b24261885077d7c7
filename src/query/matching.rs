//! `MATCH` composition over labels or relationship types.

use std::sync::Arc;

use smallvec::SmallVec;

use super::{escape, Query, Term, Where};
use crate::content::ContentKey;
use crate::entity::{Edge, Entity};
use crate::graph::Graph;
use crate::model::{Direction, Value};
use crate::protocol::Protocol;
use crate::relation::{LoadMode, Relation};
use crate::schema::{EdgeSchema, NodeSchema};
use crate::{Error, Result};

/// How multiple labels (or relationship types) combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    /// Every label must be present.
    All,
    /// At least one label must be present.
    Any,
}

/// A sort key on the matched alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    field: String,
    descending: bool,
}

impl Order {
    pub fn asc(field: impl Into<String>) -> Self {
        Self { field: field.into(), descending: false }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self { field: field.into(), descending: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pattern {
    Nodes,
    Edges(Direction),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Projection {
    Rows,
    Count,
}

/// A match over nodes (alias `n`) or edges (alias `r`, endpoints `s`, `t`).
#[derive(Debug)]
pub struct MatchQuery<'g, P: Protocol> {
    graph: &'g Graph<P>,
    pattern: Pattern,
    labels: SmallVec<[String; 4]>,
    rule: Rule,
    terms: Vec<Term>,
    orders: Vec<Order>,
    skip: Option<usize>,
    limit: Option<usize>,
}

impl<'g, P: Protocol> MatchQuery<'g, P> {
    pub(crate) fn nodes(
        graph: &'g Graph<P>,
        labels: impl IntoIterator<Item = impl Into<String>>,
        rule: Rule,
    ) -> Self {
        Self::with_pattern(graph, Pattern::Nodes, labels, rule)
    }

    pub(crate) fn edge_pattern(
        graph: &'g Graph<P>,
        types: impl IntoIterator<Item = impl Into<String>>,
        rule: Rule,
        direction: Direction,
    ) -> Self {
        Self::with_pattern(graph, Pattern::Edges(direction), types, rule)
    }

    fn with_pattern(
        graph: &'g Graph<P>,
        pattern: Pattern,
        labels: impl IntoIterator<Item = impl Into<String>>,
        rule: Rule,
    ) -> Self {
        Self {
            graph,
            pattern,
            labels: labels.into_iter().map(Into::into).collect(),
            rule,
            terms: Vec::new(),
            orders: Vec::new(),
            skip: None,
            limit: None,
        }
    }

    /// The alias predicates and sort keys apply to.
    pub fn alias(&self) -> &'static str {
        match self.pattern {
            Pattern::Nodes => "n",
            Pattern::Edges(_) => "r",
        }
    }

    /// Add a predicate. Multiple filters are conjoined.
    pub fn filter(mut self, build: impl FnOnce(&Where) -> Term) -> Self {
        let term = build(&Where::new(self.alias()));
        self.terms.push(term);
        self
    }

    /// Orientation of an edge pattern. Ignored for node matches.
    pub fn direction(mut self, direction: Direction) -> Self {
        if let Pattern::Edges(_) = self.pattern {
            self.pattern = Pattern::Edges(direction);
        }
        self
    }

    pub fn take(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn sort(mut self, orders: impl IntoIterator<Item = Order>) -> Self {
        self.orders.extend(orders);
        self
    }

    /// The statement this match would run.
    pub fn compile(&self) -> Result<Query> {
        self.build(Projection::Rows, self.limit)
    }

    fn build(&self, projection: Projection, limit: Option<usize>) -> Result<Query> {
        let alias = self.alias();
        let mut query = Query::new();
        let mut conditions = Vec::new();

        let labels: Vec<_> = self.labels.iter().map(|l| escape(l)).collect();
        match self.pattern {
            Pattern::Nodes => match (self.rule, labels.len()) {
                (_, 0) => { query.push("MATCH (n)"); }
                (Rule::All, _) | (Rule::Any, 1) => {
                    query.push(format!("MATCH (n:{})", labels.join(":")));
                }
                (Rule::Any, _) => {
                    query.push("MATCH (n)");
                    let any: Vec<String> = labels.iter().map(|l| format!("n:{l}")).collect();
                    conditions.push(format!("({})", any.join(" OR ")));
                }
            },
            Pattern::Edges(direction) => {
                let types = match (self.rule, labels.len()) {
                    (_, 0) => String::new(),
                    (Rule::All, 1) | (Rule::Any, _) => format!(":{}", labels.join("|")),
                    (Rule::All, _) => {
                        return Err(Error::InvalidUsage(
                            "a relationship has exactly one type; match several with Rule::Any".into(),
                        ));
                    }
                };
                let (left, right) = direction.arrows();
                query.push(format!("MATCH (s){left}[r{types}]{right}(t)"));
            }
        }

        for term in &self.terms {
            conditions.push(term.render(&mut query)?);
        }
        if !conditions.is_empty() {
            query.push(format!("WHERE {}", conditions.join(" AND ")));
        }

        match projection {
            Projection::Count => {
                query.push(format!("RETURN count(DISTINCT {alias})"));
                return Ok(query);
            }
            Projection::Rows => { query.push(format!("RETURN DISTINCT {alias}")); }
        }
        if !self.orders.is_empty() {
            let keys: Vec<String> = self.orders.iter()
                .map(|o| format!("{alias}.{} {}", escape(&o.field), if o.descending { "DESC" } else { "ASC" }))
                .collect();
            query.push(format!("ORDER BY {}", keys.join(", ")));
        }
        if let Some(skip) = self.skip {
            query.push(format!("SKIP {skip}"));
        }
        if let Some(limit) = limit {
            query.push(format!("LIMIT {limit}"));
        }
        Ok(query)
    }

    async fn run_keys(&self, limit: Option<usize>) -> Result<Vec<ContentKey>> {
        let mut query = self.build(Projection::Rows, limit)?;
        let records = query.records(self.graph.protocol()).await?;

        let keys = {
            let mut store = self.graph.store().write();
            let mut keys = Vec::with_capacity(records.len());
            for record in &records {
                let key = match record.first() {
                    Some(Value::Node(node)) => store.resolve_node(node)?,
                    Some(Value::Relationship(rel)) => store.resolve_relationship(rel)?,
                    other => {
                        return Err(Error::TypeError {
                            expected: "NODE or RELATIONSHIP".into(),
                            got: other.map_or("nothing", Value::type_name).into(),
                        });
                    }
                };
                keys.push(key);
            }
            keys
        };

        if self.pattern == Pattern::Nodes && self.graph.config().eager_loading {
            self.load_eager(&keys).await?;
        }
        Ok(keys)
    }

    async fn load_eager(&self, keys: &[ContentKey]) -> Result<()> {
        let store = Arc::downgrade(self.graph.store());
        for key in keys {
            let eager: Vec<String> = {
                let guard = self.graph.store().read();
                guard.get(*key)?.relations.iter()
                    .filter(|(_, state)| state.spec().load == LoadMode::Eager && !state.fetched)
                    .map(|(name, _)| name.clone())
                    .collect()
            };
            for name in eager {
                Relation::new(store.clone(), *key, &name).load(self.graph).await?;
            }
        }
        Ok(())
    }

    /// Content keys of every match, resolved into the graph.
    pub async fn keys(&self) -> Result<Vec<ContentKey>> {
        self.run_keys(self.limit).await
    }

    /// Matches as typed entities. A match of another type is a type error.
    pub async fn results<T: NodeSchema>(&self) -> Result<Vec<Entity<T>>> {
        let keys = self.keys().await?;
        self.graph.typed::<T>(&keys)
    }

    pub async fn first<T: NodeSchema>(&self) -> Result<Option<Entity<T>>> {
        let keys = self.run_keys(Some(1)).await?;
        Ok(self.graph.typed::<T>(&keys)?.into_iter().next())
    }

    /// The only match, if any. More than one is a multiplicity error.
    pub async fn find_one<T: NodeSchema>(&self) -> Result<Option<Entity<T>>> {
        let mut found = self.results::<T>().await?;
        if found.len() > 1 {
            return Err(Error::Multiplicity { expected: 1, found: found.len() });
        }
        Ok(found.pop())
    }

    /// Matches of an edge pattern as typed edges.
    pub async fn edges<E: EdgeSchema>(&self) -> Result<Vec<Edge<E>>> {
        let keys = self.keys().await?;
        self.graph.typed_edges::<E>(&keys)
    }

    pub async fn count(&self) -> Result<u64> {
        let mut query = self.build(Projection::Count, None)?;
        let records = query.records(self.graph.protocol()).await?;
        let count = records.first().and_then(|r| r.first()).and_then(Value::as_int).unwrap_or(0);
        Ok(u64::try_from(count).unwrap_or(0))
    }
}
