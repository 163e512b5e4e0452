use std::thread;

use relgraph::{
    Graph, GraphError, Node, NodeQuery, NodeTypeDef, PropertyDef, Result, Schema, ScopeOptions,
    Session, TxState,
};
use tempfile::TempDir;

fn open() -> Result<(TempDir, Graph)> {
    relgraph::logging::init_tracing();
    let schema = Schema::builder()
        .node(
            NodeTypeDef::new("sample")
                .property(PropertyDef::string("submitter_id"))
                .property(PropertyDef::integer("count")),
        )
        .build()?;
    let dir = tempfile::tempdir()?;
    let graph = Graph::open(dir.path().join("graph.db"), schema)?;
    Ok((dir, graph))
}

/// Inserts a sample inside whatever scope the caller provides.
fn register<'g>(graph: &'g Graph, parent: Option<&mut Session<'g>>, id: &str) -> Result<()> {
    graph.session_scope(parent, ScopeOptions::inherit(), |session| {
        let mut sample = Node::new(graph.schema(), "sample", id)?;
        sample.set("submitter_id", &id.to_uppercase())?;
        session.add_node(sample)
    })
}

#[test]
fn helpers_join_the_callers_transaction() -> Result<()> {
    let (_dir, graph) = open()?;
    let mut session = graph.session()?;
    register(&graph, Some(&mut session), "s1")?;
    register(&graph, Some(&mut session), "s2")?;
    assert_eq!(session.state(), TxState::Active);
    assert_eq!(session.count_nodes(&NodeQuery::new("sample"))?, 2);
    session.rollback()?;

    let mut read = graph.read_session()?;
    assert_eq!(read.count_nodes(&NodeQuery::new("sample"))?, 0);
    Ok(())
}

#[test]
fn helpers_without_a_caller_commit_on_their_own() -> Result<()> {
    let (_dir, graph) = open()?;
    register(&graph, None, "s1")?;
    let mut read = graph.read_session()?;
    assert!(read.node("sample", "s1")?.is_some());
    Ok(())
}

#[test]
fn an_inner_failure_rolls_back_the_owning_scope() -> Result<()> {
    let (_dir, graph) = open()?;
    let result = graph.session_scope(None, ScopeOptions::default(), |session| {
        register(&graph, Some(&mut *session), "s1")?;
        register(&graph, Some(&mut *session), "s1")?;
        session.flush().map(|_| ())
    });
    assert!(matches!(result, Err(GraphError::UniqueViolation(_))));
    let mut read = graph.read_session()?;
    assert!(read.node("sample", "s1")?.is_none());
    Ok(())
}

#[test]
fn concurrent_writers_each_own_a_session() -> Result<()> {
    let (_dir, graph) = open()?;
    let shared = &graph;
    thread::scope(|scope| {
        for worker in 0..4 {
            scope.spawn(move || {
                for i in 0..25 {
                    register(shared, None, &format!("w{worker}-{i:02}")).unwrap();
                }
            });
        }
    });
    let mut read = graph.read_session()?;
    assert_eq!(read.count_nodes(&NodeQuery::new("sample"))?, 100);
    Ok(())
}

#[test]
fn racing_upserts_converge_on_one_row() -> Result<()> {
    let (_dir, graph) = open()?;
    thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                for _ in 0..10 {
                    graph
                        .transact(|session| match session.node("sample", "shared")? {
                            Some(mut sample) => {
                                let count = sample.get("count").and_then(|v| v.as_i64()).unwrap_or(0);
                                sample.set("count", &(count + 1))?;
                                session.merge_node(sample)
                            }
                            None => {
                                let mut sample = Node::new(graph.schema(), "sample", "shared")?;
                                sample.set("count", &1)?;
                                session.add_node(sample)
                            }
                        })
                        .unwrap();
                }
            });
        }
    });
    let mut read = graph.read_session()?;
    let shared = read.node("sample", "shared")?.expect("created by the first writer");
    assert_eq!(shared.get("count").and_then(|v| v.as_i64()), Some(40));
    assert_eq!(read.node_history("sample", "shared")?.len(), 39);
    Ok(())
}
