//! Parser for the statement subset [`MemoryProtocol`](super::MemoryProtocol)
//! executes.
//!
//! Clauses: `MATCH`, `WHERE`, `CREATE`, `MERGE`, `SET`, `REMOVE`,
//! `[DETACH] DELETE`, `RETURN [DISTINCT]`, `ORDER BY`, `SKIP`, `LIMIT`.
//! Clause boundaries are keywords, so line breaks carry no meaning.

use crate::model::{Direction, Value};

pub(crate) type Outcome<T> = std::result::Result<T, String>;

// ============================================================================
// Syntax tree
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Var(String),
    Prop(String, String),
    Id(String),
    /// `$name` optionally followed by `.key` segments.
    Param(Vec<String>),
    Lit(Value),
    Map(Vec<(String, Expr)>),
    List(Vec<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Op {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    In,
    Contains,
    StartsWith,
    EndsWith,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Cond {
    And(Box<Cond>, Box<Cond>),
    Or(Box<Cond>, Box<Cond>),
    Not(Box<Cond>),
    Compare(Expr, Op, Expr),
    IsNull(Expr, bool),
    HasLabels(String, Vec<String>),
    Truthy(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct NodePat {
    pub alias: Option<String>,
    pub labels: Vec<String>,
    pub props: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RelPat {
    pub alias: Option<String>,
    pub types: Vec<String>,
    pub props: Option<Expr>,
    pub direction: Direction,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Pattern {
    Node(NodePat),
    Path(NodePat, RelPat, NodePat),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SetItem {
    Merge(String, Expr),
    Labels(String, Vec<String>),
    Prop(String, String, Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RemoveItem {
    Labels(String, Vec<String>),
    Prop(String, String),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Item {
    Expr(Expr),
    Count { distinct: bool, expr: Expr },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Clause {
    Match(Vec<Pattern>),
    Where(Cond),
    Create(Vec<Pattern>),
    Merge(NodePat),
    Set(Vec<SetItem>),
    Remove(Vec<RemoveItem>),
    Delete { detach: bool, aliases: Vec<String> },
    Return { distinct: bool, items: Vec<Item> },
    OrderBy(Vec<(Expr, bool)>),
    Skip(usize),
    Limit(usize),
}

// ============================================================================
// Tokens
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    /// A backtick-quoted name. Never a keyword.
    Name(String),
    Param(String),
    Int(i64),
    Float(f64),
    Str(String),
    Sym(&'static str),
}

// Longest first.
const SYMBOLS: &[&str] = &[
    "+=", "<>", "<=", ">=", "->", "<-",
    "(", ")", "[", "]", "{", "}", ":", ".", ",", "=", "<", ">", "-", "|",
];

const CLAUSES: &[&str] = &[
    "MATCH", "WHERE", "CREATE", "MERGE", "SET", "REMOVE", "DELETE", "DETACH",
    "RETURN", "ORDER", "SKIP", "LIMIT",
];

fn tokenize(text: &str) -> Outcome<Vec<Token>> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c == '\'' || c == '"' {
            let mut s = String::new();
            i += 1;
            loop {
                match chars.get(i) {
                    None => return Err("unterminated string literal".into()),
                    Some('\\') => {
                        if let Some(next) = chars.get(i + 1) {
                            s.push(*next);
                        }
                        i += 2;
                    }
                    Some(q) if *q == c => {
                        i += 1;
                        break;
                    }
                    Some(ch) => {
                        s.push(*ch);
                        i += 1;
                    }
                }
            }
            tokens.push(Token::Str(s));
        } else if c == '`' {
            let mut name = String::new();
            i += 1;
            loop {
                match (chars.get(i), chars.get(i + 1)) {
                    (None, _) => return Err("unterminated quoted name".into()),
                    (Some('`'), Some('`')) => {
                        name.push('`');
                        i += 2;
                    }
                    (Some('`'), _) => {
                        i += 1;
                        break;
                    }
                    (Some(ch), _) => {
                        name.push(*ch);
                        i += 1;
                    }
                }
            }
            tokens.push(Token::Name(name));
        } else if c == '$' || c.is_alphabetic() || c == '_' {
            let start = if c == '$' { i + 1 } else { i };
            let mut j = start;
            while j < chars.len() && (chars[j].is_alphanumeric() || chars[j] == '_') {
                j += 1;
            }
            let word: String = chars[start..j].iter().collect();
            if c == '$' {
                if word.is_empty() {
                    return Err("expected a parameter name after $".into());
                }
                tokens.push(Token::Param(word));
            } else {
                tokens.push(Token::Word(word));
            }
            i = j;
        } else if c.is_ascii_digit() {
            let mut j = i;
            while j < chars.len() && chars[j].is_ascii_digit() {
                j += 1;
            }
            let fractional = chars.get(j) == Some(&'.')
                && chars.get(j + 1).is_some_and(|d| d.is_ascii_digit());
            if fractional {
                j += 1;
                while j < chars.len() && chars[j].is_ascii_digit() {
                    j += 1;
                }
                let text: String = chars[i..j].iter().collect();
                tokens.push(Token::Float(text.parse().map_err(|_| format!("bad number {text}"))?));
            } else {
                let text: String = chars[i..j].iter().collect();
                tokens.push(Token::Int(text.parse().map_err(|_| format!("bad number {text}"))?));
            }
            i = j;
        } else {
            let rest: String = chars[i..(i + 2).min(chars.len())].iter().collect();
            let sym = SYMBOLS.iter().find(|s| rest.starts_with(**s))
                .ok_or_else(|| format!("unexpected character {c:?}"))?;
            tokens.push(Token::Sym(sym));
            i += sym.len();
        }
    }
    Ok(tokens)
}

// ============================================================================
// Parser
// ============================================================================

struct Cursor {
    tokens: Vec<Token>,
    pos: usize,
}

impl Cursor {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn is_sym(&self, sym: &str) -> bool {
        matches!(self.peek(), Some(Token::Sym(s)) if *s == sym)
    }

    fn eat_sym(&mut self, sym: &str) -> bool {
        let hit = self.is_sym(sym);
        if hit {
            self.pos += 1;
        }
        hit
    }

    fn expect_sym(&mut self, sym: &str) -> Outcome<()> {
        if self.eat_sym(sym) {
            Ok(())
        } else {
            Err(format!("expected `{sym}`, found {}", self.describe()))
        }
    }

    fn is_kw(&self, kw: &str) -> bool {
        matches!(self.peek(), Some(Token::Word(w)) if w.eq_ignore_ascii_case(kw))
    }

    fn eat_kw(&mut self, kw: &str) -> bool {
        let hit = self.is_kw(kw);
        if hit {
            self.pos += 1;
        }
        hit
    }

    fn expect_kw(&mut self, kw: &str) -> Outcome<()> {
        if self.eat_kw(kw) {
            Ok(())
        } else {
            Err(format!("expected {kw}, found {}", self.describe()))
        }
    }

    fn word(&mut self) -> Outcome<String> {
        match self.bump() {
            Some(Token::Word(w) | Token::Name(w)) => Ok(w),
            other => Err(format!("expected a name, found {other:?}")),
        }
    }

    fn at_clause(&self) -> bool {
        self.peek().is_none() || CLAUSES.iter().any(|k| self.is_kw(k))
    }

    fn describe(&self) -> String {
        self.peek().map_or_else(|| "end of statement".to_string(), |t| format!("{t:?}"))
    }

    fn list<T>(&mut self, mut item: impl FnMut(&mut Self) -> Outcome<T>) -> Outcome<Vec<T>> {
        let mut items = vec![item(self)?];
        while self.eat_sym(",") {
            items.push(item(self)?);
        }
        Ok(items)
    }

    fn count(&mut self) -> Outcome<usize> {
        match self.bump() {
            Some(Token::Int(n)) if n >= 0 => Ok(n as usize),
            other => Err(format!("expected a non-negative integer, found {other:?}")),
        }
    }
}

pub(crate) fn parse(statement: &str) -> Outcome<Vec<Clause>> {
    let mut cur = Cursor { tokens: tokenize(statement)?, pos: 0 };
    let mut clauses = Vec::new();
    while cur.peek().is_some() {
        let keyword = match cur.bump() {
            Some(Token::Word(w)) => w.to_ascii_uppercase(),
            other => return Err(format!("expected a clause, found {other:?}")),
        };
        let clause = match keyword.as_str() {
            "MATCH" => Clause::Match(cur.list(pattern)?),
            "WHERE" => Clause::Where(condition(&mut cur)?),
            "CREATE" => Clause::Create(cur.list(pattern)?),
            "MERGE" => Clause::Merge(node(&mut cur)?),
            "SET" => Clause::Set(cur.list(set_item)?),
            "REMOVE" => Clause::Remove(cur.list(remove_item)?),
            "DETACH" => {
                cur.expect_kw("DELETE")?;
                Clause::Delete { detach: true, aliases: cur.list(Cursor::word)? }
            }
            "DELETE" => Clause::Delete { detach: false, aliases: cur.list(Cursor::word)? },
            "RETURN" => {
                let distinct = cur.eat_kw("DISTINCT");
                Clause::Return { distinct, items: cur.list(return_item)? }
            }
            "ORDER" => {
                cur.expect_kw("BY")?;
                Clause::OrderBy(cur.list(|c| {
                    let expr = expr(c)?;
                    let descending = c.eat_kw("DESC");
                    if !descending {
                        c.eat_kw("ASC");
                    }
                    Ok((expr, descending))
                })?)
            }
            "SKIP" => Clause::Skip(cur.count()?),
            "LIMIT" => Clause::Limit(cur.count()?),
            other => return Err(format!("unsupported clause {other}")),
        };
        if !cur.at_clause() {
            return Err(format!("unexpected {} after {keyword}", cur.describe()));
        }
        clauses.push(clause);
    }
    Ok(clauses)
}

fn labels(cur: &mut Cursor) -> Outcome<Vec<String>> {
    let mut labels = Vec::new();
    while cur.eat_sym(":") {
        labels.push(cur.word()?);
    }
    Ok(labels)
}

fn properties(cur: &mut Cursor) -> Outcome<Option<Expr>> {
    if matches!(cur.peek(), Some(Token::Param(_))) || cur.is_sym("{") {
        return expr(cur).map(Some);
    }
    Ok(None)
}

fn node(cur: &mut Cursor) -> Outcome<NodePat> {
    cur.expect_sym("(")?;
    let alias = match cur.peek() {
        Some(Token::Word(_) | Token::Name(_)) => Some(cur.word()?),
        _ => None,
    };
    let labels = labels(cur)?;
    let props = properties(cur)?;
    cur.expect_sym(")")?;
    Ok(NodePat { alias, labels, props })
}

fn pattern(cur: &mut Cursor) -> Outcome<Pattern> {
    let left = node(cur)?;
    let incoming = if cur.eat_sym("<-") {
        true
    } else if cur.is_sym("-") {
        cur.expect_sym("-")?;
        false
    } else {
        return Ok(Pattern::Node(left));
    };

    cur.expect_sym("[")?;
    let alias = match cur.peek() {
        Some(Token::Word(_) | Token::Name(_)) => Some(cur.word()?),
        _ => None,
    };
    let mut types = Vec::new();
    if cur.eat_sym(":") {
        types.push(cur.word()?);
        while cur.eat_sym("|") {
            types.push(cur.word()?);
        }
    }
    let props = properties(cur)?;
    cur.expect_sym("]")?;

    let direction = if incoming {
        cur.expect_sym("-")?;
        Direction::Incoming
    } else if cur.eat_sym("->") {
        Direction::Outgoing
    } else {
        cur.expect_sym("-")?;
        Direction::Both
    };
    let right = node(cur)?;
    Ok(Pattern::Path(left, RelPat { alias, types, props, direction }, right))
}

fn set_item(cur: &mut Cursor) -> Outcome<SetItem> {
    let alias = cur.word()?;
    if cur.eat_sym("+=") {
        return Ok(SetItem::Merge(alias, expr(cur)?));
    }
    if cur.is_sym(":") {
        return Ok(SetItem::Labels(alias, labels(cur)?));
    }
    cur.expect_sym(".")?;
    let field = cur.word()?;
    cur.expect_sym("=")?;
    Ok(SetItem::Prop(alias, field, expr(cur)?))
}

fn remove_item(cur: &mut Cursor) -> Outcome<RemoveItem> {
    let alias = cur.word()?;
    if cur.is_sym(":") {
        return Ok(RemoveItem::Labels(alias, labels(cur)?));
    }
    cur.expect_sym(".")?;
    Ok(RemoveItem::Prop(alias, cur.word()?))
}

fn return_item(cur: &mut Cursor) -> Outcome<Item> {
    let item = if cur.is_kw("count") && matches!(cur.peek_at(1), Some(Token::Sym("("))) {
        cur.bump();
        cur.expect_sym("(")?;
        let distinct = cur.eat_kw("DISTINCT");
        let expr = expr(cur)?;
        cur.expect_sym(")")?;
        Item::Count { distinct, expr }
    } else {
        Item::Expr(expr(cur)?)
    };
    if cur.eat_kw("AS") {
        cur.word()?;
    }
    Ok(item)
}

fn expr(cur: &mut Cursor) -> Outcome<Expr> {
    match cur.bump() {
        Some(Token::Param(name)) => {
            let mut path = vec![name];
            while cur.is_sym(".") && matches!(cur.peek_at(1), Some(Token::Word(_) | Token::Name(_))) {
                cur.bump();
                path.push(cur.word()?);
            }
            Ok(Expr::Param(path))
        }
        Some(Token::Int(n)) => Ok(Expr::Lit(Value::Int(n))),
        Some(Token::Float(f)) => Ok(Expr::Lit(Value::Float(f))),
        Some(Token::Str(s)) => Ok(Expr::Lit(Value::String(s))),
        Some(Token::Sym("{")) => {
            let mut entries = Vec::new();
            if !cur.eat_sym("}") {
                loop {
                    let key = cur.word()?;
                    cur.expect_sym(":")?;
                    entries.push((key, expr(cur)?));
                    if cur.eat_sym("}") {
                        break;
                    }
                    cur.expect_sym(",")?;
                }
            }
            Ok(Expr::Map(entries))
        }
        Some(Token::Sym("[")) => {
            let mut items = Vec::new();
            if !cur.eat_sym("]") {
                items = cur.list(expr)?;
                cur.expect_sym("]")?;
            }
            Ok(Expr::List(items))
        }
        Some(Token::Name(name)) => {
            if cur.eat_sym(".") {
                return Ok(Expr::Prop(name, cur.word()?));
            }
            Ok(Expr::Var(name))
        }
        Some(Token::Word(word)) => {
            if word.eq_ignore_ascii_case("id") && cur.eat_sym("(") {
                let alias = cur.word()?;
                cur.expect_sym(")")?;
                return Ok(Expr::Id(alias));
            }
            if word.eq_ignore_ascii_case("true") {
                return Ok(Expr::Lit(Value::Bool(true)));
            }
            if word.eq_ignore_ascii_case("false") {
                return Ok(Expr::Lit(Value::Bool(false)));
            }
            if word.eq_ignore_ascii_case("null") {
                return Ok(Expr::Lit(Value::Null));
            }
            if cur.eat_sym(".") {
                return Ok(Expr::Prop(word, cur.word()?));
            }
            Ok(Expr::Var(word))
        }
        other => Err(format!("expected an expression, found {other:?}")),
    }
}

fn condition(cur: &mut Cursor) -> Outcome<Cond> {
    let mut left = conjunction(cur)?;
    while cur.eat_kw("OR") {
        left = Cond::Or(Box::new(left), Box::new(conjunction(cur)?));
    }
    Ok(left)
}

fn conjunction(cur: &mut Cursor) -> Outcome<Cond> {
    let mut left = negation(cur)?;
    while cur.eat_kw("AND") {
        left = Cond::And(Box::new(left), Box::new(negation(cur)?));
    }
    Ok(left)
}

fn negation(cur: &mut Cursor) -> Outcome<Cond> {
    if cur.eat_kw("NOT") {
        return Ok(Cond::Not(Box::new(negation(cur)?)));
    }
    atom(cur)
}

fn atom(cur: &mut Cursor) -> Outcome<Cond> {
    if cur.eat_sym("(") {
        let inner = condition(cur)?;
        cur.expect_sym(")")?;
        return Ok(inner);
    }
    let lhs = expr(cur)?;
    if let Expr::Var(alias) = &lhs
        && cur.is_sym(":")
    {
        return Ok(Cond::HasLabels(alias.clone(), labels(cur)?));
    }
    if cur.eat_kw("IS") {
        let negated = cur.eat_kw("NOT");
        cur.expect_kw("NULL")?;
        return Ok(Cond::IsNull(lhs, negated));
    }
    let op = match cur.peek() {
        Some(Token::Sym("=")) => Op::Eq,
        Some(Token::Sym("<>")) => Op::Ne,
        Some(Token::Sym("<")) => Op::Lt,
        Some(Token::Sym("<=")) => Op::Lte,
        Some(Token::Sym(">")) => Op::Gt,
        Some(Token::Sym(">=")) => Op::Gte,
        _ if cur.is_kw("IN") => Op::In,
        _ if cur.is_kw("CONTAINS") => Op::Contains,
        _ if cur.is_kw("STARTS") => Op::StartsWith,
        _ if cur.is_kw("ENDS") => Op::EndsWith,
        _ => return Ok(Cond::Truthy(lhs)),
    };
    cur.bump();
    if matches!(op, Op::StartsWith | Op::EndsWith) {
        cur.expect_kw("WITH")?;
    }
    Ok(Cond::Compare(lhs, op, expr(cur)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_edge_create() {
        let clauses = parse(
            "MATCH (s0) WHERE id(s0) = $p1\nMATCH (t0) WHERE id(t0) = $p2\n\
             CREATE (s0)-[e0:OWNS $e0]->(t0)\nRETURN e0",
        ).unwrap();
        assert_eq!(clauses.len(), 6);
        let Clause::Create(patterns) = &clauses[4] else { panic!("{clauses:?}") };
        let Pattern::Path(_, rel, _) = &patterns[0] else { panic!() };
        assert_eq!(rel.types, vec!["OWNS".to_string()]);
        assert_eq!(rel.direction, Direction::Outgoing);
    }

    #[test]
    fn test_parse_merge_with_key_map() {
        let clauses = parse("MERGE (n0:Person {name:$k0.name})\nSET n0 += $n0").unwrap();
        let Clause::Merge(node) = &clauses[0] else { panic!() };
        assert_eq!(
            node.props,
            Some(Expr::Map(vec![(
                "name".into(),
                Expr::Param(vec!["k0".into(), "name".into()])
            )]))
        );
    }

    #[test]
    fn test_parse_incoming_and_undirected() {
        let clauses = parse("MATCH (s)<-[r:A|B]-(t:X), ()-[e]-()").unwrap();
        let Clause::Match(patterns) = &clauses[0] else { panic!() };
        let Pattern::Path(_, rel, right) = &patterns[0] else { panic!() };
        assert_eq!(rel.direction, Direction::Incoming);
        assert_eq!(rel.types.len(), 2);
        assert_eq!(right.labels, vec!["X".to_string()]);
        let Pattern::Path(_, rel, _) = &patterns[1] else { panic!() };
        assert_eq!(rel.direction, Direction::Both);
    }

    #[test]
    fn test_condition_precedence() {
        let clauses = parse("WHERE (n:A OR n:B) AND NOT n.x STARTS WITH 'a'").unwrap();
        let Clause::Where(Cond::And(left, right)) = &clauses[0] else { panic!("{clauses:?}") };
        assert!(matches!(**left, Cond::Or(..)));
        assert!(matches!(**right, Cond::Not(_)));
    }

    #[test]
    fn test_quoted_names() {
        let clauses = parse("MATCH (n:`Two Words`) WHERE n.`odd``key` = $p1 RETURN n").unwrap();
        let Clause::Match(patterns) = &clauses[0] else { panic!() };
        let Pattern::Node(node) = &patterns[0] else { panic!() };
        assert_eq!(node.labels, vec!["Two Words".to_string()]);
        let Clause::Where(Cond::Compare(lhs, Op::Eq, _)) = &clauses[1] else { panic!("{clauses:?}") };
        assert_eq!(*lhs, Expr::Prop("n".into(), "odd`key".into()));
        assert!(parse("`MATCH` (n)").is_err());
        assert!(parse("MATCH (n:`open)").is_err());
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(parse("EXPLODE (n)").is_err());
        assert!(parse("MATCH (n").is_err());
        assert!(parse("RETURN 'open").is_err());
    }
}
