use std::sync::Arc;

use relgraph::{
    Edge, EdgeQuery, EdgeTypeDef, Graph, GraphConfig, GraphError, Node, NodeQuery, NodeTypeDef,
    PropertyDef, Result, Schema,
};
use serde_json::{json, Value};
use tempfile::TempDir;

fn schema() -> Arc<Schema> {
    Schema::builder()
        .node(
            NodeTypeDef::new("file")
                .property(PropertyDef::string("name"))
                .property(PropertyDef::integer("size"))
                .property(PropertyDef::string("md5"))
                .required(["name"]),
        )
        .node(NodeTypeDef::new("aliquot").property(PropertyDef::string("submitter_id")))
        .edge(EdgeTypeDef::new("file", "derived_from", "aliquot").associations("aliquots", "files"))
        .build()
        .unwrap()
}

fn open(config: GraphConfig) -> Result<(TempDir, Graph)> {
    relgraph::logging::init_tracing();
    let dir = tempfile::tempdir()?;
    let graph = Graph::open_with_config(dir.path().join("graph.db"), schema(), config)?;
    Ok((dir, graph))
}

fn insert_file(graph: &Graph, id: &str, props: Value) -> Result<()> {
    graph.transact(|session| {
        let mut file = Node::new(graph.schema(), "file", id)?;
        file.properties_mut().update(props.as_object().cloned().unwrap_or_default())?;
        session.add_node(file)
    })
}

#[test]
fn update_snapshots_the_prior_state() -> Result<()> {
    let (_dir, graph) = open(GraphConfig::default())?;
    insert_file(&graph, "a", json!({"name": "x.txt"}))?;

    graph.transact(|session| {
        let mut file = session.node("file", "a")?.expect("inserted");
        file.set("name", "y.txt")?;
        session.merge_node(file)
    })?;

    let mut read = graph.read_session()?;
    let live = read.node("file", "a")?.expect("still live");
    assert_eq!(live.get("name"), Some(&json!("y.txt")));
    let history = read.node_history("file", "a")?;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].property("name"), Some(&json!("x.txt")));
    assert_eq!(history[0].label, "file");
    assert_eq!(Some(history[0].created), live.created());
    assert!(history[0].voided >= history[0].created);
    Ok(())
}

#[test]
fn disjoint_updates_snapshot_once_each_and_accumulate() -> Result<()> {
    let (_dir, graph) = open(GraphConfig::default())?;
    insert_file(&graph, "a", json!({"name": "x.txt"}))?;

    graph.transact(|session| {
        let mut file = session.node("file", "a")?.expect("inserted");
        file.set("size", &10)?;
        session.merge_node(file)
    })?;
    graph.transact(|session| {
        let mut file = session.node("file", "a")?.expect("inserted");
        file.set("md5", "abc")?;
        session.merge_node(file)
    })?;

    let mut read = graph.read_session()?;
    let live = read.node("file", "a")?.expect("still live");
    assert_eq!(
        live.properties().to_map(),
        *json!({"name": "x.txt", "size": 10, "md5": "abc"}).as_object().unwrap()
    );
    let history = read.node_history("file", "a")?;
    assert_eq!(history.len(), 2);
    // Newest first: the second snapshot holds the first update.
    assert_eq!(history[0].property("size"), Some(&json!(10)));
    assert!(history[0].property("md5").map_or(true, Value::is_null));
    assert!(history[1].property("size").map_or(true, Value::is_null));
    Ok(())
}

#[test]
fn unchanged_merge_writes_no_history() -> Result<()> {
    let (_dir, graph) = open(GraphConfig::default())?;
    insert_file(&graph, "a", json!({"name": "x.txt", "size": 1}))?;
    let mut session = graph.session()?;
    let mut file = session.node("file", "a")?.expect("inserted");
    file.set("size", &1)?;
    session.merge_node(file)?;
    let stats = session.flush()?;
    assert_eq!((stats.unchanged, stats.updated, stats.snapshots), (1, 0, 0));
    session.commit()?;

    let mut read = graph.read_session()?;
    assert!(read.node_history("file", "a")?.is_empty());
    Ok(())
}

#[test]
fn stale_copies_only_write_the_keys_they_changed() -> Result<()> {
    let (_dir, graph) = open(GraphConfig::default())?;
    insert_file(&graph, "a", json!({"name": "x.txt", "size": 1}))?;

    let mut stale = {
        let mut read = graph.read_session()?;
        read.node("file", "a")?.expect("inserted")
    };
    graph.transact(|session| {
        let mut file = session.node("file", "a")?.expect("inserted");
        file.set("size", &2)?;
        session.merge_node(file)
    })?;
    stale.set("name", "z.txt")?;
    graph.transact(|session| session.merge_node(stale.clone()))?;

    let mut read = graph.read_session()?;
    let live = read.node("file", "a")?.expect("live");
    assert_eq!(live.get("name"), Some(&json!("z.txt")));
    assert_eq!(live.get("size"), Some(&json!(2)));
    Ok(())
}

#[test]
fn delete_snapshots_the_last_state_and_incident_edges() -> Result<()> {
    let (_dir, graph) = open(GraphConfig::default())?;
    graph.transact(|session| {
        let mut file = Node::new(graph.schema(), "file", "f1")?;
        file.set("name", "x.txt")?;
        let mut aliquot = Node::new(graph.schema(), "aliquot", "al1")?;
        aliquot.set("submitter_id", "AL-1")?;
        let mut edge = Edge::connect(graph.schema(), &file, &aliquot, None)?;
        edge.system_annotations_mut().set("source", "import")?;
        session.add_node(file)?;
        session.add_node(aliquot)?;
        session.add_edge(edge)
    })?;

    graph.transact(|session| {
        let mut file = session.node("file", "f1")?.expect("inserted");
        file.set("size", &99)?;
        session.delete_node(file)
    })?;

    let mut read = graph.read_session()?;
    assert!(read.node("file", "f1")?.is_none());
    assert_eq!(read.count_edges(&EdgeQuery::label("derived_from"))?, 0);
    assert!(read.node("aliquot", "al1")?.is_some());

    let history = read.node_history("file", "f1")?;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].property("name"), Some(&json!("x.txt")));
    assert_eq!(history[0].property("size"), Some(&json!(99)));

    let edges = read.edge_history("f1", "al1", "derived_from")?;
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].edge_type, "file_derived_from_aliquot");
    assert_eq!(edges[0].system_annotations.get("source"), Some(&json!("import")));
    Ok(())
}

#[test]
fn deleting_a_missing_node_is_a_lookup_error() -> Result<()> {
    let (_dir, graph) = open(GraphConfig::default())?;
    let err = graph
        .transact(|session| session.delete_node(Node::new(graph.schema(), "file", "ghost")?))
        .unwrap_err();
    assert!(matches!(err, GraphError::Lookup { expected: 1, actual: 0, .. }), "{err}");
    Ok(())
}

#[test]
fn one_flush_shares_one_timestamp() -> Result<()> {
    let (_dir, graph) = open(GraphConfig {
        db_clock: false,
        ..GraphConfig::default()
    })?;
    for id in ["a", "b", "c"] {
        insert_file(&graph, id, json!({"name": id}))?;
    }
    graph.transact(|session| {
        for mut node in session.nodes(&NodeQuery::new("file"))? {
            node.set("size", &7)?;
            session.merge_node(node)?;
        }
        Ok(())
    })?;
    let mut read = graph.read_session()?;
    let stamps: Vec<_> = ["a", "b", "c"]
        .iter()
        .map(|id| read.node_history("file", id).map(|h| h[0].voided))
        .collect::<Result<_>>()?;
    assert!(stamps.windows(2).all(|pair| pair[0] == pair[1]));
    Ok(())
}

#[test]
fn edge_updates_are_versioned() -> Result<()> {
    let schema = Schema::builder()
        .node(NodeTypeDef::new("file"))
        .node(NodeTypeDef::new("aliquot"))
        .edge(
            EdgeTypeDef::new("file", "derived_from", "aliquot")
                .property(PropertyDef::string("method")),
        )
        .build()?;
    let dir = tempfile::tempdir()?;
    let graph = Graph::open(dir.path().join("graph.db"), schema)?;
    graph.transact(|session| {
        session.add_node(Node::new(graph.schema(), "file", "f1")?)?;
        session.add_node(Node::new(graph.schema(), "aliquot", "al1")?)?;
        let mut edge = Edge::new(graph.schema(), "f1", "al1", "derived_from")?;
        edge.set("method", "manual")?;
        session.add_edge(edge)
    })?;
    graph.transact(|session| {
        let mut edge = session
            .edges(&EdgeQuery::label("derived_from").src("f1"))?
            .pop()
            .expect("inserted");
        edge.set("method", "pipeline")?;
        session.merge_edge(edge)
    })?;

    let mut read = graph.read_session()?;
    let live = read.edges(&EdgeQuery::all())?;
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].get("method"), Some(&json!("pipeline")));
    let history = read.edge_history("f1", "al1", "derived_from")?;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].property("method"), Some(&json!("manual")));
    Ok(())
}

#[test]
fn history_is_kept_per_label() -> Result<()> {
    let (_dir, graph) = open(GraphConfig::default())?;
    graph.transact(|session| {
        let mut file = Node::new(graph.schema(), "file", "x")?;
        file.set("name", "x.txt")?;
        let mut aliquot = Node::new(graph.schema(), "aliquot", "x")?;
        aliquot.set("submitter_id", "AL-1")?;
        session.add_node(file)?;
        session.add_node(aliquot)
    })?;
    graph.transact(|session| {
        let mut aliquot = session.node("aliquot", "x")?.expect("inserted");
        aliquot.set("submitter_id", "AL-2")?;
        session.merge_node(aliquot)
    })?;

    let mut read = graph.read_session()?;
    assert!(read.node_history("file", "x")?.is_empty());
    let history = read.node_history("aliquot", "x")?;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].label, "aliquot");
    assert_eq!(history[0].property("submitter_id"), Some(&json!("AL-1")));
    Ok(())
}

#[test]
fn merging_a_json_document_replaces_the_stored_acl() -> Result<()> {
    let (_dir, graph) = open(GraphConfig::default())?;
    graph.transact(|session| {
        let mut file = Node::new(graph.schema(), "file", "a")?;
        file.set("name", "x.txt")?;
        file.set_acl(["old"]);
        session.add_node(file)
    })?;

    let mut doc = {
        let mut read = graph.read_session()?;
        read.node("file", "a")?.expect("inserted").to_json()?
    };
    doc["acl"] = json!(["new"]);
    graph.transact(|session| session.merge_node(Node::from_json(graph.schema(), &doc)?))?;

    let mut read = graph.read_session()?;
    let live = read.node("file", "a")?.expect("still live");
    assert_eq!(live.acl(), ["new"]);
    let history = read.node_history("file", "a")?;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].acl, ["old"]);
    Ok(())
}
