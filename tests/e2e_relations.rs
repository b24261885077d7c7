//! End-to-end tests for relationships: linking, ownership cascade, commit
//! ordering and loading from the database.

use neo4j_ogm::{
    props, EdgeSchema, Error, Field, Graph, GraphConfig, LoadMode, MemoryProtocol, NodeSchema,
    PropertyMap, RelationSpec, Rule, Status, Value,
};
use pretty_assertions::assert_eq;

struct Employs;
impl EdgeSchema for Employs {
    const TYPE: &'static str = "EMPLOYS";
    const FIELDS: &'static [Field] = &[Field::optional("since")];
}

struct Publishes;
impl EdgeSchema for Publishes {
    const TYPE: &'static str = "PUBLISHES";
    const FIELDS: &'static [Field] = &[Field::optional("year")];
}

struct Publisher;
impl NodeSchema for Publisher {
    const NAME: &'static str = "Publisher";
    const LABELS: &'static [&'static str] = &["Publisher"];
    const FIELDS: &'static [Field] = &[Field::required("name")];
    fn relations() -> Vec<RelationSpec> {
        vec![
            RelationSpec::new("author", "EMPLOYS").to(&["Author"]).one().owned().load(LoadMode::Eager),
            RelationSpec::new("catalog", "PUBLISHES").to(&["Book"]),
        ]
    }
}

struct Author;
impl NodeSchema for Author {
    const NAME: &'static str = "Author";
    const LABELS: &'static [&'static str] = &["Author"];
    const FIELDS: &'static [Field] = &[Field::required("name")];
}

struct Book;
impl NodeSchema for Book {
    const NAME: &'static str = "Book";
    const LABELS: &'static [&'static str] = &["Book"];
    const FIELDS: &'static [Field] = &[Field::required("title")];
}

fn open(db: MemoryProtocol, config: GraphConfig) -> Graph<MemoryProtocol> {
    let graph = Graph::with_config(db, config);
    graph.register_edge::<Employs>().unwrap();
    graph.register_edge::<Publishes>().unwrap();
    graph.register_node::<Publisher>().unwrap();
    graph.register_node::<Author>().unwrap();
    graph.register_node::<Book>().unwrap();
    graph
}

fn graph() -> Graph<MemoryProtocol> {
    open(MemoryProtocol::new(), GraphConfig::default())
}

/// Publisher "Acme" employing author "Ada" and publishing "Notes".
async fn seed(graph: &mut Graph<MemoryProtocol>) {
    let publisher = graph.entity::<Publisher>().unwrap();
    publisher.set("name", "Acme").unwrap();
    let author = graph.entity::<Author>().unwrap();
    author.set("name", "Ada").unwrap();
    let book = graph.entity::<Book>().unwrap();
    book.set("title", "Notes").unwrap();

    publisher.relation("author").unwrap().set(&author, props([("since", 1843)])).unwrap();
    publisher.relation("catalog").unwrap().set(&book, PropertyMap::new()).unwrap();
    graph.attach(&[&publisher, &book]).unwrap();
    graph.save().await.unwrap();
}

// ============================================================================
// 1. Ownership cascade
// ============================================================================

#[tokio::test]
async fn test_attaching_owner_creates_owned_target() {
    let mut graph = graph();
    let publisher = graph.entity::<Publisher>().unwrap();
    publisher.set("name", "Acme").unwrap();
    let author = graph.entity::<Author>().unwrap();
    author.set("name", "Ada").unwrap();
    let edge = publisher.relation("author").unwrap().set(&author, props([("since", 1843)])).unwrap();

    graph.attach(&[&publisher]).unwrap();
    let manifest = graph.save().await.unwrap();
    assert_eq!(manifest.nodes.create.len(), 2);
    assert_eq!(manifest.edges.create, vec![edge]);

    assert_eq!(author.status().unwrap(), Status::Attached);
    assert_eq!(
        graph.protocol().statements(),
        vec![
            "CREATE (n0:Publisher $n0)\nCREATE (n1:Author $n1)\nRETURN n0, n1".to_string(),
            "MATCH (s0) WHERE id(s0) = $p1\nMATCH (t0) WHERE id(t0) = $p2\n\
             CREATE (s0)-[e0:EMPLOYS $e0]->(t0)\nRETURN e0"
                .to_string(),
        ]
    );

    let employs = graph.edge_at::<Employs>(edge).unwrap();
    assert_eq!(employs.status().unwrap(), Status::Attached);
    assert_eq!(employs.get("since").unwrap(), Value::Int(1843));
    let stored = graph.protocol().relationship(employs.identity().unwrap().unwrap()).unwrap();
    assert_eq!(stored.src, publisher.identity().unwrap().unwrap());
    assert_eq!(stored.dst, author.identity().unwrap().unwrap());
}

#[tokio::test]
async fn test_detaching_owner_deletes_owned_target() {
    let mut graph = graph();
    let publisher = graph.entity::<Publisher>().unwrap();
    publisher.set("name", "Acme").unwrap();
    let author = graph.entity::<Author>().unwrap();
    author.set("name", "Ada").unwrap();
    publisher.relation("author").unwrap().set(&author, PropertyMap::new()).unwrap();
    graph.attach(&[&publisher]).unwrap();
    graph.save().await.unwrap();
    graph.protocol().clear_log();

    graph.detach(&[&publisher]).unwrap();
    let manifest = graph.save().await.unwrap();
    assert_eq!(manifest.nodes.delete.len(), 2);
    assert_eq!(manifest.edges.delete.len(), 1);
    assert_eq!(
        graph.protocol().statements(),
        vec![
            "MATCH ()-[e0]->() WHERE id(e0) = $p1\nDELETE e0".to_string(),
            "MATCH (n0) WHERE id(n0) = $p1\nMATCH (n1) WHERE id(n1) = $p2\nDELETE n0, n1".to_string(),
        ]
    );
    assert_eq!(author.status().unwrap(), Status::Detached);
    assert_eq!(graph.protocol().node_count(), 0);
    assert_eq!(graph.protocol().relationship_count(), 0);
}

#[tokio::test]
async fn test_independent_target_must_be_attached() {
    let mut graph = graph();
    let publisher = graph.entity::<Publisher>().unwrap();
    publisher.set("name", "Acme").unwrap();
    let book = graph.entity::<Book>().unwrap();
    book.set("title", "Notes").unwrap();
    publisher.relation("catalog").unwrap().set(&book, PropertyMap::new()).unwrap();
    graph.attach(&[&publisher]).unwrap();

    let err = graph.merge().unwrap_err();
    assert!(matches!(err, Error::InvalidUsage(_)), "{err}");
    assert!(err.to_string().contains("attach it first"), "{err}");
    assert_eq!(book.status().unwrap(), Status::Fastened);
}

#[tokio::test]
async fn test_unset_independent_relation_keeps_target() {
    let mut graph = graph();
    seed(&mut graph).await;
    let publisher = graph.match_nodes(["Publisher"]).first::<Publisher>().await.unwrap().unwrap();
    let book = graph.match_nodes(["Book"]).first::<Book>().await.unwrap().unwrap();

    let catalog = publisher.relation("catalog").unwrap();
    assert!(catalog.contains(&book).unwrap());
    assert!(catalog.unset(&book).unwrap());
    assert!(!catalog.unset(&book).unwrap());

    let manifest = graph.save().await.unwrap();
    assert_eq!(manifest.edges.delete.len(), 1);
    assert!(manifest.nodes.delete.is_empty());
    assert_eq!(book.status().unwrap(), Status::Attached);
    assert_eq!(graph.protocol().node_count(), 3);
    assert_eq!(graph.protocol().relationship_count(), 1);
    assert!(catalog.targets().unwrap().is_empty());
}

// ============================================================================
// 2. Cardinality and commit order
// ============================================================================

#[tokio::test]
async fn test_cardinality_one_replaces_the_link() {
    let graph = graph();
    let publisher = graph.entity::<Publisher>().unwrap();
    let ada = graph.entity::<Author>().unwrap();
    let bob = graph.entity::<Author>().unwrap();
    let author = publisher.relation("author").unwrap();

    author.set(&ada, PropertyMap::new()).unwrap();
    author.set(&bob, PropertyMap::new()).unwrap();
    assert_eq!(author.one().unwrap(), bob.key());
    assert!(!author.contains(&ada).unwrap());

    let book = graph.entity::<Book>().unwrap();
    assert!(matches!(author.set(&book, PropertyMap::new()), Err(Error::InvalidUsage(_))));
    assert!(matches!(publisher.relation("editors"), Err(Error::InvalidUsage(_))));
}

#[tokio::test]
async fn test_phases_run_in_dependency_order() {
    let mut graph = graph();
    seed(&mut graph).await;
    let publisher = graph.match_nodes(["Publisher"]).first::<Publisher>().await.unwrap().unwrap();
    let book = graph.match_nodes(["Book"]).first::<Book>().await.unwrap().unwrap();
    let ada = graph.entity_at::<Author>(publisher.relation("author").unwrap().one().unwrap().unwrap()).unwrap();
    graph.protocol().clear_log();

    // Replace the owned author, rename the publisher and annotate the
    // catalog edge, all in one commit.
    let bob = graph.entity::<Author>().unwrap();
    bob.set("name", "Bob").unwrap();
    publisher.relation("author").unwrap().set(&bob, PropertyMap::new()).unwrap();
    publisher.set("name", "Acme Press").unwrap();
    publisher.relation("catalog").unwrap().set(&book, props([("year", 1843)])).unwrap();

    let manifest = graph.save().await.unwrap();
    assert_eq!(manifest.nodes.create.len(), 1);
    assert_eq!(manifest.nodes.update.len(), 1);
    assert_eq!(manifest.nodes.delete.len(), 1);
    assert_eq!(manifest.edges.create.len(), 1);
    assert_eq!(manifest.edges.update.len(), 1);
    assert_eq!(manifest.edges.delete.len(), 1);

    assert_eq!(
        graph.protocol().statements(),
        vec![
            "CREATE (n0:Author $n0)\nRETURN n0".to_string(),
            "MATCH (n0) WHERE id(n0) = $p1\nSET n0 += $u0\nRETURN n0".to_string(),
            "MATCH (s0) WHERE id(s0) = $p1\nMATCH (t0) WHERE id(t0) = $p2\n\
             CREATE (s0)-[e0:EMPLOYS $e0]->(t0)\nRETURN e0"
                .to_string(),
            "MATCH ()-[e0]->() WHERE id(e0) = $p1\nSET e0 += $u0\nRETURN e0".to_string(),
            "MATCH ()-[e0]->() WHERE id(e0) = $p1\nDELETE e0".to_string(),
            "MATCH (n0) WHERE id(n0) = $p1\nDELETE n0".to_string(),
        ]
    );

    assert_eq!(ada.status().unwrap(), Status::Detached);
    assert_eq!(bob.status().unwrap(), Status::Attached);
    assert_eq!(publisher.relation("author").unwrap().one().unwrap(), bob.key());
    let names: Vec<String> = graph.protocol().nodes().iter()
        .filter(|n| n.has_label("Author"))
        .filter_map(|n| n.get("name").and_then(Value::as_str).map(String::from))
        .collect();
    assert_eq!(names, vec!["Bob".to_string()]);
}

// ============================================================================
// 3. Loading
// ============================================================================

#[tokio::test]
async fn test_eager_and_lazy_loading() {
    let db = MemoryProtocol::new();
    seed(&mut open(db.clone(), GraphConfig::default())).await;

    let reader = open(db.clone(), GraphConfig::default());
    let publisher = reader.match_nodes(["Publisher"]).first::<Publisher>().await.unwrap().unwrap();

    let author = publisher.relation("author").unwrap();
    let key = author.one().unwrap().expect("eager relation loaded with the match");
    assert_eq!(reader.entity_at::<Author>(key).unwrap().get("name").unwrap(), Value::from("Ada"));

    let catalog = publisher.relation("catalog").unwrap();
    assert!(catalog.targets().unwrap().is_empty());
    let books = catalog.fetch(&reader).await.unwrap();
    assert_eq!(books.len(), 1);
    assert_eq!(reader.entity_at::<Book>(books[0]).unwrap().get("title").unwrap(), Value::from("Notes"));

    let issued = db.statements().len();
    assert_eq!(catalog.fetch(&reader).await.unwrap(), books);
    assert_eq!(db.statements().len(), issued, "fetched relations are not queried again");
    assert!(db.statements().last().unwrap().starts_with("MATCH (s)-[r:PUBLISHES]->(t:Book)"));
}

#[tokio::test]
async fn test_eager_loading_can_be_disabled() {
    let db = MemoryProtocol::new();
    seed(&mut open(db.clone(), GraphConfig::default())).await;

    let config = GraphConfig { eager_loading: false, ..Default::default() };
    let reader = open(db, config);
    let publisher = reader.match_nodes(["Publisher"]).first::<Publisher>().await.unwrap().unwrap();
    let author = publisher.relation("author").unwrap();
    assert_eq!(author.fetch(&reader).await.unwrap(), Vec::new());
    assert_eq!(author.load(&reader).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_load_rejects_too_many_for_cardinality_one() {
    let db = MemoryProtocol::new();
    let mut writer = open(db.clone(), GraphConfig::default());
    seed(&mut writer).await;
    writer
        .query(
            "MATCH (p:Publisher)\nCREATE (p)-[r:EMPLOYS]->(x:Author {name: $name})",
            props([("name", "Bob")]),
        )
        .await
        .unwrap();

    let reader = open(db, GraphConfig::default());
    let err = reader.match_nodes(["Publisher"]).first::<Publisher>().await.unwrap_err();
    assert!(matches!(err, Error::Multiplicity { expected: 1, found: 2 }), "{err}");
}

#[tokio::test]
async fn test_load_skips_disallowed_targets() {
    let db = MemoryProtocol::new();
    let mut writer = open(db.clone(), GraphConfig::default());
    seed(&mut writer).await;
    writer
        .query(
            "MATCH (p:Publisher)\nCREATE (p)-[r:PUBLISHES]->(x:Pamphlet {title: $title})",
            props([("title", "Leaflet")]),
        )
        .await
        .unwrap();

    let reader = open(db, GraphConfig::default());
    let publisher = reader.match_nodes(["Publisher"]).first::<Publisher>().await.unwrap().unwrap();
    let relation = publisher.relation("catalog").unwrap();
    let loaded = relation.load(&reader).await.unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(reader.entity_at::<Book>(loaded[0]).unwrap().get("title").unwrap(), Value::from("Notes"));
}

#[tokio::test]
async fn test_match_typed_edges() {
    let mut graph = graph();
    seed(&mut graph).await;
    let edges = graph.match_edges(["EMPLOYS"], Rule::All).edges::<Employs>().await.unwrap();
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].get("since").unwrap(), Value::Int(1843));
    assert!(matches!(
        graph.match_edges(["PUBLISHES"], Rule::All).edges::<Employs>().await,
        Err(Error::TypeError { .. })
    ));
}
