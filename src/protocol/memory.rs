//! In-memory protocol.
//!
//! This is the reference implementation of `Protocol`. It keeps a property
//! graph in memory and executes the statement dialect parsed by
//! [`dialect`](super::dialect).
//!
//! ## Limitations
//!
//! - **Statement-level atomicity only**: each statement runs against a copy
//!   of the graph that replaces the stored one when the statement succeeds.
//!   There are no multi-statement transactions.
//! - **No aggregation beyond `count`**, no `WITH`, no `OPTIONAL MATCH`.
//! - **No indexes**: every `MATCH` is a scan.
//!
//! Use this protocol for:
//! - Testing the mapper end to end without a server
//! - Inspecting the statements the mapper emits

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use super::dialect::{self, Clause, Cond, Expr, Item, NodePat, Op, Outcome, Pattern, RelPat, RemoveItem, SetItem};
use super::{BufferedStream, Protocol, Response, ResponseStream};
use crate::model::{Direction, Node, PropertyMap, Relationship, ServerId, Value};
use crate::Result;

// ============================================================================
// MemoryProtocol
// ============================================================================

/// In-memory property graph reachable by statement. Cloning shares the graph.
#[derive(Debug, Clone)]
pub struct MemoryProtocol {
    inner: Arc<MemoryInner>,
}

#[derive(Debug)]
struct MemoryInner {
    graph: RwLock<GraphData>,
    next_node_id: AtomicU64,
    next_rel_id: AtomicU64,
    log: Mutex<Vec<(String, PropertyMap)>>,
    failures: Mutex<Vec<String>>,
}

#[derive(Debug, Clone, Default)]
struct GraphData {
    nodes: BTreeMap<u64, Node>,
    relationships: BTreeMap<u64, Relationship>,
}

impl Default for MemoryProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProtocol {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                graph: RwLock::new(GraphData::default()),
                next_node_id: AtomicU64::new(1),
                next_rel_id: AtomicU64::new(1),
                log: Mutex::new(Vec::new()),
                failures: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Answer every later statement containing `fragment` with a failure.
    pub fn fail_on(&self, fragment: impl Into<String>) {
        self.inner.failures.lock().push(fragment.into());
    }

    pub fn clear_failures(&self) {
        self.inner.failures.lock().clear();
    }

    /// Every statement received so far, in order.
    pub fn statements(&self) -> Vec<String> {
        self.inner.log.lock().iter().map(|(s, _)| s.clone()).collect()
    }

    pub fn calls(&self) -> Vec<(String, PropertyMap)> {
        self.inner.log.lock().clone()
    }

    pub fn clear_log(&self) {
        self.inner.log.lock().clear();
    }

    pub fn node_count(&self) -> usize {
        self.inner.graph.read().nodes.len()
    }

    pub fn relationship_count(&self) -> usize {
        self.inner.graph.read().relationships.len()
    }

    pub fn node(&self, id: ServerId) -> Option<Node> {
        self.inner.graph.read().nodes.get(&id.0).cloned()
    }

    pub fn relationship(&self, id: ServerId) -> Option<Relationship> {
        self.inner.graph.read().relationships.get(&id.0).cloned()
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.inner.graph.read().nodes.values().cloned().collect()
    }

    pub fn relationships(&self) -> Vec<Relationship> {
        self.inner.graph.read().relationships.values().cloned().collect()
    }

    fn execute(&self, statement: &str, params: &PropertyMap) -> Outcome<Vec<Vec<Value>>> {
        if let Some(fragment) = self.inner.failures.lock().iter().find(|f| statement.contains(f.as_str())) {
            return Err(format!("statement rejected (matched {fragment:?})"));
        }
        let clauses = dialect::parse(statement)?;
        let mut graph = self.inner.graph.write();
        let mut data = graph.clone();
        let records = Executor { data: &mut data, params, inner: &self.inner }.run(&clauses)?;
        *graph = data;
        Ok(records)
    }
}

#[async_trait]
impl Protocol for MemoryProtocol {
    async fn run(&self, statement: &str, params: PropertyMap) -> Result<Box<dyn ResponseStream>> {
        self.inner.log.lock().push((statement.to_string(), params.clone()));
        let responses = match self.execute(statement, &params) {
            Ok(records) => {
                let mut responses: Vec<Response> = records.into_iter().map(Response::record).collect();
                responses.push(Response::success(PropertyMap::new()));
                responses
            }
            Err(message) => {
                tracing::debug!(%statement, %message, "memory protocol failure");
                vec![Response::failure(message)]
            }
        };
        Ok(Box::new(BufferedStream::new(responses)))
    }
}

// ============================================================================
// Execution
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bound {
    Node(u64),
    Rel(u64),
}

type Row = BTreeMap<String, Bound>;

struct Executor<'a> {
    data: &'a mut GraphData,
    params: &'a PropertyMap,
    inner: &'a MemoryInner,
}

impl Executor<'_> {
    fn run(&mut self, clauses: &[Clause]) -> Outcome<Vec<Vec<Value>>> {
        let mut rows: Vec<Row> = vec![Row::new()];
        let mut iter = clauses.iter();
        while let Some(clause) = iter.next() {
            match clause {
                Clause::Match(patterns) => {
                    for pattern in patterns {
                        let mut next = Vec::new();
                        for row in &rows {
                            next.extend(self.match_pattern(row, pattern)?);
                        }
                        rows = next;
                    }
                }
                Clause::Where(cond) => {
                    let mut kept = Vec::with_capacity(rows.len());
                    for row in rows {
                        if self.test(cond, &row)? {
                            kept.push(row);
                        }
                    }
                    rows = kept;
                }
                Clause::Create(patterns) => {
                    for row in &mut rows {
                        for pattern in patterns {
                            self.create(row, pattern)?;
                        }
                    }
                }
                Clause::Merge(node) => {
                    for row in &mut rows {
                        self.merge(row, node)?;
                    }
                }
                Clause::Set(items) => {
                    for row in &rows {
                        for item in items {
                            self.set(row, item)?;
                        }
                    }
                }
                Clause::Remove(items) => {
                    for row in &rows {
                        for item in items {
                            self.remove(row, item)?;
                        }
                    }
                }
                Clause::Delete { detach, aliases } => self.delete(&rows, aliases, *detach)?,
                Clause::Return { distinct, items } => {
                    let tail: Vec<&Clause> = iter.by_ref().collect();
                    return self.project(rows, *distinct, items, &tail);
                }
                Clause::OrderBy(_) | Clause::Skip(_) | Clause::Limit(_) => {
                    return Err("ORDER BY, SKIP and LIMIT must follow RETURN".into());
                }
            }
        }
        Ok(Vec::new())
    }

    // ------------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------------

    fn element(&self, bound: Bound) -> Outcome<Value> {
        match bound {
            Bound::Node(id) => self.data.nodes.get(&id)
                .map(|n| Value::Node(Box::new(n.clone())))
                .ok_or_else(|| format!("node {id} no longer exists")),
            Bound::Rel(id) => self.data.relationships.get(&id)
                .map(|r| Value::Relationship(Box::new(r.clone())))
                .ok_or_else(|| format!("relationship {id} no longer exists")),
        }
    }

    fn properties(&self, bound: Bound) -> Option<&PropertyMap> {
        match bound {
            Bound::Node(id) => self.data.nodes.get(&id).map(|n| &n.properties),
            Bound::Rel(id) => self.data.relationships.get(&id).map(|r| &r.properties),
        }
    }

    fn properties_mut(&mut self, bound: Bound) -> Option<&mut PropertyMap> {
        match bound {
            Bound::Node(id) => self.data.nodes.get_mut(&id).map(|n| &mut n.properties),
            Bound::Rel(id) => self.data.relationships.get_mut(&id).map(|r| &mut r.properties),
        }
    }

    fn bound(row: &Row, alias: &str) -> Outcome<Bound> {
        row.get(alias).copied().ok_or_else(|| format!("variable `{alias}` not defined"))
    }

    fn eval(&self, expr: &Expr, row: &Row) -> Outcome<Value> {
        match expr {
            Expr::Var(alias) => self.element(Self::bound(row, alias)?),
            Expr::Prop(alias, field) => {
                let bound = Self::bound(row, alias)?;
                Ok(self.properties(bound).and_then(|p| p.get(field)).cloned().unwrap_or(Value::Null))
            }
            Expr::Id(alias) => Ok(match Self::bound(row, alias)? {
                Bound::Node(id) | Bound::Rel(id) => Value::Int(id as i64),
            }),
            Expr::Param(path) => {
                let (name, keys) = path.split_first().ok_or("empty parameter path")?;
                let mut value = self.params.get(name).cloned()
                    .ok_or_else(|| format!("expected parameter(s): {name}"))?;
                for key in keys {
                    value = match value {
                        Value::Map(map) => map.get(key).cloned().unwrap_or(Value::Null),
                        _ => Value::Null,
                    };
                }
                Ok(value)
            }
            Expr::Lit(value) => Ok(value.clone()),
            Expr::Map(entries) => {
                let mut map = PropertyMap::new();
                for (key, expr) in entries {
                    map.insert(key.clone(), self.eval(expr, row)?);
                }
                Ok(Value::Map(map))
            }
            Expr::List(items) => items.iter().map(|e| self.eval(e, row)).collect::<Outcome<_>>().map(Value::List),
        }
    }

    fn eval_map(&self, expr: &Expr, row: &Row) -> Outcome<PropertyMap> {
        match self.eval(expr, row)? {
            Value::Map(map) => Ok(map),
            other => Err(format!("expected a map, got {}", other.type_name())),
        }
    }

    fn test(&self, cond: &Cond, row: &Row) -> Outcome<bool> {
        Ok(match cond {
            Cond::And(a, b) => self.test(a, row)? && self.test(b, row)?,
            Cond::Or(a, b) => self.test(a, row)? || self.test(b, row)?,
            Cond::Not(inner) => !self.test(inner, row)?,
            Cond::IsNull(expr, negated) => self.eval(expr, row)?.is_null() != *negated,
            Cond::HasLabels(alias, labels) => match Self::bound(row, alias)? {
                Bound::Node(id) => self.data.nodes.get(&id)
                    .is_some_and(|n| labels.iter().all(|l| n.has_label(l))),
                Bound::Rel(id) => self.data.relationships.get(&id)
                    .is_some_and(|r| labels.iter().all(|l| r.rel_type == *l)),
            },
            Cond::Truthy(expr) => self.eval(expr, row)? == Value::Bool(true),
            Cond::Compare(lhs, op, rhs) => {
                compare(&self.eval(lhs, row)?, *op, &self.eval(rhs, row)?)
            }
        })
    }

    // ------------------------------------------------------------------------
    // Patterns
    // ------------------------------------------------------------------------

    fn node_fits(&self, id: u64, pat: &NodePat, row: &Row) -> Outcome<bool> {
        let Some(node) = self.data.nodes.get(&id) else { return Ok(false) };
        if !pat.labels.iter().all(|l| node.has_label(l)) {
            return Ok(false);
        }
        match &pat.props {
            Some(expr) => Ok(contains_all(&node.properties, &self.eval_map(expr, row)?)),
            None => Ok(true),
        }
    }

    /// Bind `pat` to node `id` in a copy of `row`, if it fits.
    fn bind_node(&self, row: &Row, pat: &NodePat, id: u64) -> Outcome<Option<Row>> {
        if let Some(alias) = &pat.alias
            && let Some(existing) = row.get(alias)
            && *existing != Bound::Node(id)
        {
            return Ok(None);
        }
        if !self.node_fits(id, pat, row)? {
            return Ok(None);
        }
        let mut row = row.clone();
        if let Some(alias) = &pat.alias {
            row.insert(alias.clone(), Bound::Node(id));
        }
        Ok(Some(row))
    }

    fn rel_fits(&self, rel: &Relationship, pat: &RelPat, row: &Row) -> Outcome<bool> {
        if !pat.types.is_empty() && !pat.types.contains(&rel.rel_type) {
            return Ok(false);
        }
        if let Some(alias) = &pat.alias
            && let Some(existing) = row.get(alias)
            && *existing != Bound::Rel(rel.id.0)
        {
            return Ok(false);
        }
        match &pat.props {
            Some(expr) => Ok(contains_all(&rel.properties, &self.eval_map(expr, row)?)),
            None => Ok(true),
        }
    }

    fn match_pattern(&self, row: &Row, pattern: &Pattern) -> Outcome<Vec<Row>> {
        let mut out = Vec::new();
        match pattern {
            Pattern::Node(pat) => {
                if let Some(Bound::Node(id)) = pat.alias.as_ref().and_then(|a| row.get(a)) {
                    out.extend(self.bind_node(row, pat, *id)?);
                    return Ok(out);
                }
                for id in self.data.nodes.keys() {
                    out.extend(self.bind_node(row, pat, *id)?);
                }
            }
            Pattern::Path(left, rel, right) => {
                for r in self.data.relationships.values() {
                    if !self.rel_fits(r, rel, row)? {
                        continue;
                    }
                    let (src, dst) = (r.src.0, r.dst.0);
                    let orientations: Vec<(u64, u64)> = match rel.direction {
                        Direction::Outgoing => vec![(src, dst)],
                        Direction::Incoming => vec![(dst, src)],
                        Direction::Both if src == dst => vec![(src, dst)],
                        Direction::Both => vec![(src, dst), (dst, src)],
                    };
                    for (a, b) in orientations {
                        let Some(bound) = self.bind_node(row, left, a)? else { continue };
                        let Some(mut bound) = self.bind_node(&bound, right, b)? else { continue };
                        if let Some(alias) = &rel.alias {
                            bound.insert(alias.clone(), Bound::Rel(r.id.0));
                        }
                        out.push(bound);
                    }
                }
            }
        }
        Ok(out)
    }

    // ------------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------------

    fn create_node(&mut self, row: &mut Row, pat: &NodePat) -> Outcome<u64> {
        if let Some(alias) = &pat.alias
            && let Some(bound) = row.get(alias)
        {
            return match bound {
                Bound::Node(id) if pat.labels.is_empty() && pat.props.is_none() => Ok(*id),
                _ => Err(format!("variable `{alias}` already declared")),
            };
        }
        let properties = match &pat.props {
            Some(expr) => without_nulls(self.eval_map(expr, row)?),
            None => PropertyMap::new(),
        };
        let id = self.inner.next_node_id.fetch_add(1, Ordering::Relaxed);
        let mut node = Node::new(ServerId(id)).with_labels(pat.labels.iter().cloned());
        node.properties = properties;
        self.data.nodes.insert(id, node);
        if let Some(alias) = &pat.alias {
            row.insert(alias.clone(), Bound::Node(id));
        }
        Ok(id)
    }

    fn create(&mut self, row: &mut Row, pattern: &Pattern) -> Outcome<()> {
        match pattern {
            Pattern::Node(pat) => {
                self.create_node(row, pat)?;
            }
            Pattern::Path(left, rel, right) => {
                let [rel_type] = rel.types.as_slice() else {
                    return Err("a created relationship needs exactly one type".into());
                };
                let a = self.create_node(row, left)?;
                let b = self.create_node(row, right)?;
                let (src, dst) = match rel.direction {
                    Direction::Outgoing => (a, b),
                    Direction::Incoming => (b, a),
                    Direction::Both => return Err("only directed relationships can be created".into()),
                };
                let properties = match &rel.props {
                    Some(expr) => without_nulls(self.eval_map(expr, row)?),
                    None => PropertyMap::new(),
                };
                let id = self.inner.next_rel_id.fetch_add(1, Ordering::Relaxed);
                let mut created = Relationship::new(ServerId(id), ServerId(src), ServerId(dst), rel_type.clone());
                created.properties = properties;
                self.data.relationships.insert(id, created);
                if let Some(alias) = &rel.alias {
                    row.insert(alias.clone(), Bound::Rel(id));
                }
            }
        }
        Ok(())
    }

    fn merge(&mut self, row: &mut Row, pat: &NodePat) -> Outcome<()> {
        let mut found = None;
        for id in self.data.nodes.keys() {
            if self.node_fits(*id, pat, row)? {
                found = Some(*id);
                break;
            }
        }
        match (found, &pat.alias) {
            (Some(id), Some(alias)) => {
                row.insert(alias.clone(), Bound::Node(id));
            }
            (Some(_), None) => {}
            (None, _) => {
                self.create_node(row, pat)?;
            }
        }
        Ok(())
    }

    fn set(&mut self, row: &Row, item: &SetItem) -> Outcome<()> {
        match item {
            SetItem::Merge(alias, expr) => {
                let changes = self.eval_map(expr, row)?;
                let bound = Self::bound(row, alias)?;
                if let Some(props) = self.properties_mut(bound) {
                    for (key, value) in changes {
                        if value.is_null() {
                            props.shift_remove(&key);
                        } else {
                            props.insert(key, value);
                        }
                    }
                }
            }
            SetItem::Prop(alias, field, expr) => {
                let value = self.eval(expr, row)?;
                let bound = Self::bound(row, alias)?;
                if let Some(props) = self.properties_mut(bound) {
                    if value.is_null() {
                        props.shift_remove(field);
                    } else {
                        props.insert(field.clone(), value);
                    }
                }
            }
            SetItem::Labels(alias, labels) => {
                let Bound::Node(id) = Self::bound(row, alias)? else {
                    return Err(format!("`{alias}` is not a node"));
                };
                if let Some(node) = self.data.nodes.get_mut(&id) {
                    for label in labels {
                        if !node.has_label(label) {
                            node.labels.push(label.clone());
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn remove(&mut self, row: &Row, item: &RemoveItem) -> Outcome<()> {
        match item {
            RemoveItem::Prop(alias, field) => {
                let bound = Self::bound(row, alias)?;
                if let Some(props) = self.properties_mut(bound) {
                    props.shift_remove(field);
                }
            }
            RemoveItem::Labels(alias, labels) => {
                let Bound::Node(id) = Self::bound(row, alias)? else {
                    return Err(format!("`{alias}` is not a node"));
                };
                if let Some(node) = self.data.nodes.get_mut(&id) {
                    node.labels.retain(|l| !labels.contains(l));
                }
            }
        }
        Ok(())
    }

    fn delete(&mut self, rows: &[Row], aliases: &[String], detach: bool) -> Outcome<()> {
        let mut nodes = BTreeSet::new();
        let mut rels = BTreeSet::new();
        for row in rows {
            for alias in aliases {
                match Self::bound(row, alias)? {
                    Bound::Node(id) => { nodes.insert(id); }
                    Bound::Rel(id) => { rels.insert(id); }
                }
            }
        }
        if detach {
            for r in self.data.relationships.values() {
                if nodes.contains(&r.src.0) || nodes.contains(&r.dst.0) {
                    rels.insert(r.id.0);
                }
            }
        }
        for id in &rels {
            self.data.relationships.remove(id);
        }
        for id in &nodes {
            if self.data.relationships.values().any(|r| r.src.0 == *id || r.dst.0 == *id) {
                return Err(format!(
                    "Cannot delete node<{id}>, because it still has relationships. \
                     To delete this node, you must first delete its relationships."
                ));
            }
            self.data.nodes.remove(id);
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Projection
    // ------------------------------------------------------------------------

    fn project(
        &self,
        rows: Vec<Row>,
        distinct: bool,
        items: &[Item],
        tail: &[&Clause],
    ) -> Outcome<Vec<Vec<Value>>> {
        if items.iter().any(|i| matches!(i, Item::Count { .. })) {
            let mut record = Vec::with_capacity(items.len());
            for item in items {
                record.push(match item {
                    Item::Count { distinct, expr } => {
                        let mut seen: Vec<Value> = Vec::new();
                        let mut total = 0_i64;
                        for row in &rows {
                            let value = self.eval(expr, row)?;
                            if value.is_null() || (*distinct && seen.contains(&value)) {
                                continue;
                            }
                            if *distinct {
                                seen.push(value);
                            }
                            total += 1;
                        }
                        Value::Int(total)
                    }
                    Item::Expr(expr) => match rows.first() {
                        Some(row) => self.eval(expr, row)?,
                        None => Value::Null,
                    },
                });
            }
            return Ok(vec![record]);
        }

        let mut keyed = Vec::with_capacity(rows.len());
        let orders: Vec<&(Expr, bool)> = tail.iter()
            .filter_map(|c| match c {
                Clause::OrderBy(orders) => Some(orders.iter()),
                _ => None,
            })
            .flatten()
            .collect();
        for row in &rows {
            let keys = orders.iter().map(|(e, _)| self.eval(e, row)).collect::<Outcome<Vec<_>>>()?;
            keyed.push((keys, row));
        }
        keyed.sort_by(|(a, _), (b, _)| {
            for (i, (x, y)) in a.iter().zip(b).enumerate() {
                let ord = order_values(x, y);
                let ord = if orders[i].1 { ord.reverse() } else { ord };
                if ord != std::cmp::Ordering::Equal {
                    return ord;
                }
            }
            std::cmp::Ordering::Equal
        });

        let mut records: Vec<Vec<Value>> = Vec::with_capacity(keyed.len());
        for (_, row) in keyed {
            let record = items.iter()
                .map(|item| match item {
                    Item::Expr(expr) => self.eval(expr, row),
                    Item::Count { .. } => Ok(Value::Null),
                })
                .collect::<Outcome<Vec<_>>>()?;
            if distinct && records.contains(&record) {
                continue;
            }
            records.push(record);
        }

        for clause in tail {
            match clause {
                Clause::Skip(n) => { records.drain(..(*n).min(records.len())); }
                Clause::Limit(n) => records.truncate(*n),
                Clause::OrderBy(_) => {}
                other => return Err(format!("unexpected clause after RETURN: {other:?}")),
            }
        }
        Ok(records)
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    a == b || a.neo4j_cmp(b) == Some(std::cmp::Ordering::Equal)
}

fn compare(lhs: &Value, op: Op, rhs: &Value) -> bool {
    use std::cmp::Ordering::{Equal, Greater, Less};
    if lhs.is_null() || rhs.is_null() {
        return false;
    }
    match op {
        Op::Eq => values_equal(lhs, rhs),
        Op::Ne => !values_equal(lhs, rhs),
        Op::Lt => lhs.neo4j_cmp(rhs) == Some(Less),
        Op::Lte => matches!(lhs.neo4j_cmp(rhs), Some(Less | Equal)),
        Op::Gt => lhs.neo4j_cmp(rhs) == Some(Greater),
        Op::Gte => matches!(lhs.neo4j_cmp(rhs), Some(Greater | Equal)),
        Op::In => match rhs {
            Value::List(items) => items.iter().any(|i| values_equal(lhs, i)),
            _ => false,
        },
        Op::Contains | Op::StartsWith | Op::EndsWith => match (lhs.as_str(), rhs.as_str()) {
            (Some(l), Some(r)) => match op {
                Op::Contains => l.contains(r),
                Op::StartsWith => l.starts_with(r),
                _ => l.ends_with(r),
            },
            _ => false,
        },
    }
}

/// Nulls sort last.
fn order_values(a: &Value, b: &Value) -> std::cmp::Ordering {
    use std::cmp::Ordering::{Equal, Greater, Less};
    match (a.is_null(), b.is_null()) {
        (true, true) => Equal,
        (true, false) => Greater,
        (false, true) => Less,
        (false, false) => a.neo4j_cmp(b).unwrap_or(Equal),
    }
}

fn contains_all(have: &PropertyMap, want: &PropertyMap) -> bool {
    want.iter().all(|(k, v)| have.get(k).is_some_and(|h| values_equal(h, v)))
}

fn without_nulls(map: PropertyMap) -> PropertyMap {
    map.into_iter().filter(|(_, v)| !v.is_null()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::props;
    use crate::protocol::{ResponseContent, Signal};

    async fn exec(protocol: &MemoryProtocol, statement: &str, params: PropertyMap) -> Vec<Response> {
        let mut stream = protocol.run(statement, params).await.unwrap();
        stream.pull(&[]).await.unwrap()
    }

    fn rows(responses: &[Response]) -> Vec<Vec<Value>> {
        responses.iter()
            .filter_map(|r| match &r.content {
                ResponseContent::Record(fields) => Some(fields.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_create_and_match() {
        let db = MemoryProtocol::new();
        let params = props([("a", Value::Map(props([("name", Value::from("Ada")), ("age", Value::from(36))])))]);
        let out = exec(&db, "CREATE (n0:Person $a)\nRETURN n0", params).await;
        assert_eq!(out.last().map(|r| r.signal), Some(Signal::Success));
        assert_eq!(db.node_count(), 1);

        let params = props([("p1", 30)]);
        let out = exec(&db, "MATCH (n:Person)\nWHERE n.age > $p1\nRETURN DISTINCT n", params).await;
        let found = rows(&out);
        assert_eq!(found.len(), 1);
        let Value::Node(node) = &found[0][0] else { panic!("{found:?}") };
        assert_eq!(node.get("name"), Some(&Value::from("Ada")));
    }

    #[tokio::test]
    async fn test_merge_is_idempotent() {
        let db = MemoryProtocol::new();
        let params = props([
            ("k0", Value::Map(props([("name", "Ada")]))),
            ("n0", Value::Map(props([("name", Value::from("Ada")), ("age", Value::from(1))]))),
        ]);
        let statement = "MERGE (n0:Person {name:$k0.name})\nSET n0 += $n0\nRETURN n0";
        let first = rows(&exec(&db, statement, params.clone()).await);
        let second = rows(&exec(&db, statement, params).await);
        assert_eq!(first, second);
        assert_eq!(db.node_count(), 1);
    }

    #[tokio::test]
    async fn test_relationships_and_delete_guard() {
        let db = MemoryProtocol::new();
        exec(&db, "CREATE (a:P)\nCREATE (b:P)", PropertyMap::new()).await;
        let params = props([("x", 1), ("y", 2)]);
        exec(
            &db,
            "MATCH (s) WHERE id(s) = $x\nMATCH (t) WHERE id(t) = $y\nCREATE (s)-[r:KNOWS]->(t)",
            params,
        ).await;
        assert_eq!(db.relationship_count(), 1);

        let out = exec(&db, "MATCH (n) WHERE id(n) = $x\nDELETE n", props([("x", 1)])).await;
        assert_eq!(out[0].signal, Signal::Failure);
        assert_eq!(db.node_count(), 2);

        let out = exec(&db, "MATCH (s)<-[r:KNOWS]-(t)\nRETURN id(s), id(t)", PropertyMap::new()).await;
        assert_eq!(rows(&out), vec![vec![Value::Int(2), Value::Int(1)]]);
    }

    #[tokio::test]
    async fn test_failed_statement_changes_nothing() {
        let db = MemoryProtocol::new();
        let out = exec(&db, "CREATE (a:P)\nSET a += $missing", PropertyMap::new()).await;
        assert_eq!(out[0].signal, Signal::Failure);
        assert_eq!(db.node_count(), 0);
    }

    #[tokio::test]
    async fn test_order_skip_limit_count() {
        let db = MemoryProtocol::new();
        for age in [3, 1, 2] {
            exec(&db, "CREATE (n:P {age: $a})", props([("a", age)])).await;
        }
        let out = exec(&db, "MATCH (n:P)\nRETURN n.age\nORDER BY n.age DESC\nSKIP 1\nLIMIT 1", PropertyMap::new()).await;
        assert_eq!(rows(&out), vec![vec![Value::Int(2)]]);
        let out = exec(&db, "MATCH (n:P)\nRETURN count(DISTINCT n)", PropertyMap::new()).await;
        assert_eq!(rows(&out), vec![vec![Value::Int(3)]]);
    }

    #[tokio::test]
    async fn test_fail_on() {
        let db = MemoryProtocol::new();
        db.fail_on("DELETE");
        let out = exec(&db, "MATCH (n)\nDELETE n", PropertyMap::new()).await;
        assert_eq!(out[0].signal, Signal::Failure);
        assert_eq!(db.statements().len(), 1);
    }
}
