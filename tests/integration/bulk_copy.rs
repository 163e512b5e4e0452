use std::collections::BTreeMap;
use std::sync::Arc;

use relgraph::{
    BulkCopier, CopyOptions, CopyStrategy, Edge, EdgeQuery, EdgeTypeDef, Graph, Node, NodeQuery,
    NodeTypeDef, PropertyDef, Result, Schema,
};
use serde_json::{Map, Value};
use tempfile::TempDir;

const STATES: usize = 1_000;

fn schema() -> Arc<Schema> {
    Schema::builder()
        .node(
            NodeTypeDef::new("state")
                .property(PropertyDef::string("code"))
                .property(PropertyDef::integer("population")),
        )
        .node(NodeTypeDef::new("city").property(PropertyDef::string("name")))
        .edge(EdgeTypeDef::new("state", "borders", "city").associations("cities", "states"))
        .build()
        .unwrap()
}

struct Fixture {
    _dir: TempDir,
    source: Graph,
    dest: Graph,
}

fn fixture() -> Result<Fixture> {
    relgraph::logging::init_tracing();
    let dir = tempfile::tempdir()?;
    let source = Graph::open(dir.path().join("source.db"), schema())?;
    let dest = Graph::open(dir.path().join("dest.db"), schema())?;
    source.transact(|session| {
        let mut city = Node::new(source.schema(), "city", "city-0")?;
        city.set("name", "Capital")?;
        session.add_node(city)?;
        for i in 0..STATES {
            let id = format!("state-{i:04}");
            let mut state = Node::new(source.schema(), "state", id.as_str())?;
            state.set("code", &format!("S{i}"))?;
            state.set("population", &(i as i64 * 1_000))?;
            state.system_annotations_mut().set("batch", &(i % 7))?;
            session.add_node(state)?;
            session.add_edge(Edge::new(source.schema(), id.as_str(), "city-0", "borders")?)?;
        }
        Ok(())
    })?;
    Ok(Fixture {
        _dir: dir,
        source,
        dest,
    })
}

fn options(strategy: CopyStrategy) -> CopyOptions {
    CopyOptions {
        chunk_size: 100,
        strategy,
        ..CopyOptions::default()
    }
}

fn copy_all(fx: &Fixture, strategy: CopyStrategy) -> Result<Vec<relgraph::CopyReport>> {
    let copier = BulkCopier::new(&fx.source, &fx.dest).with_options(options(strategy));
    Ok(vec![
        copier.copy_nodes(&NodeQuery::new("state"))?,
        copier.copy_nodes(&NodeQuery::new("city"))?,
        copier.copy_edges(&EdgeQuery::label("borders"))?,
    ])
}

fn snapshot(graph: &Graph) -> Result<BTreeMap<String, (Map<String, Value>, Map<String, Value>)>> {
    let mut read = graph.read_session()?;
    let mut out = BTreeMap::new();
    for node in read.nodes(&NodeQuery::all())? {
        out.insert(
            format!("{}/{}", node.label(), node.node_id()),
            (
                node.properties().to_map(),
                node.system_annotations().as_map().clone(),
            ),
        );
    }
    for edge in read.edges(&EdgeQuery::all())? {
        out.insert(
            format!("{}/{}/{}", edge.label(), edge.src_id(), edge.dst_id()),
            (edge.properties().to_map(), Map::new()),
        );
    }
    Ok(out)
}

#[test]
fn copy_into_an_empty_destination_matches_the_source() -> Result<()> {
    for strategy in [CopyStrategy::Client, CopyStrategy::Server] {
        let fx = fixture()?;
        let reports = copy_all(&fx, strategy)?;
        assert_eq!(reports[0].chunks, 10);
        assert_eq!(reports[0].inserted, STATES);
        assert_eq!(reports[1].inserted, 1);
        assert_eq!(reports[2].inserted, STATES);
        assert_eq!(reports[2].skipped, 0);

        let mut read = fx.dest.read_session()?;
        assert_eq!(read.count_nodes(&NodeQuery::new("state"))?, STATES);
        assert_eq!(read.count_nodes(&NodeQuery::new("city"))?, 1);
        assert_eq!(read.count_edges(&EdgeQuery::all())?, STATES);
        drop(read);
        assert_eq!(snapshot(&fx.source)?, snapshot(&fx.dest)?);
    }
    Ok(())
}

#[test]
fn rerunning_a_copy_changes_nothing() -> Result<()> {
    for strategy in [CopyStrategy::Client, CopyStrategy::Server] {
        let fx = fixture()?;
        copy_all(&fx, strategy)?;
        let before = snapshot(&fx.dest)?;
        let again = copy_all(&fx, strategy)?;
        for report in &again {
            assert_eq!(report.inserted, 0, "{}", report.type_name);
            assert_eq!(report.updated, 0, "{}", report.type_name);
            assert_eq!(report.unchanged, report.read, "{}", report.type_name);
        }
        assert_eq!(before, snapshot(&fx.dest)?);
    }
    Ok(())
}

#[test]
fn deleted_rows_come_back_without_duplicates() -> Result<()> {
    for strategy in [CopyStrategy::Client, CopyStrategy::Server] {
        let fx = fixture()?;
        copy_all(&fx, strategy)?;
        fx.dest.transact(|session| {
            for state in session.nodes(&NodeQuery::new("state").limit(STATES / 2))? {
                session.delete_node(state)?;
            }
            Ok(())
        })?;
        {
            let mut read = fx.dest.read_session()?;
            assert_eq!(read.count_nodes(&NodeQuery::new("state"))?, STATES / 2);
            assert_eq!(read.count_edges(&EdgeQuery::all())?, STATES / 2);
        }

        let reports = copy_all(&fx, strategy)?;
        assert_eq!(reports[0].inserted, STATES / 2);
        assert_eq!(reports[0].unchanged, STATES / 2);
        assert_eq!(reports[2].inserted, STATES / 2);

        let mut read = fx.dest.read_session()?;
        assert_eq!(read.count_nodes(&NodeQuery::new("state"))?, STATES);
        assert_eq!(read.count_edges(&EdgeQuery::all())?, STATES);
        drop(read);
        assert_eq!(snapshot(&fx.source)?, snapshot(&fx.dest)?);
    }
    Ok(())
}

#[test]
fn edges_copied_before_their_endpoints_are_skipped() -> Result<()> {
    let fx = fixture()?;
    let copier = BulkCopier::new(&fx.source, &fx.dest).with_options(options(CopyStrategy::Client));
    copier.copy_nodes(&NodeQuery::new("city"))?;
    copier.copy_nodes(&NodeQuery::new("state").limit(250))?;
    let report = copier.copy_edges(&EdgeQuery::label("borders"))?;
    assert_eq!(report.read, STATES);
    assert_eq!(report.inserted, 250);
    assert_eq!(report.skipped, STATES - 250);
    Ok(())
}

#[test]
fn filtered_copies_only_move_matching_rows() -> Result<()> {
    let fx = fixture()?;
    let report = BulkCopier::new(&fx.source, &fx.dest)
        .with_options(options(CopyStrategy::Server))
        .copy_nodes(&NodeQuery::new("state").sysan_eq("batch", 3))?;
    let expected = (0..STATES).filter(|i| i % 7 == 3).count();
    assert_eq!(report.inserted, expected);
    let mut read = fx.dest.read_session()?;
    assert_eq!(read.count_nodes(&NodeQuery::new("state"))?, expected);
    Ok(())
}

#[test]
fn whole_graph_copy_visits_every_type() -> Result<()> {
    let fx = fixture()?;
    let reports = BulkCopier::new(&fx.source, &fx.dest).copy_graph()?;
    let names: Vec<_> = reports.iter().map(|r| r.type_name.as_str()).collect();
    assert_eq!(names, ["city", "state", "state_borders_city"]);
    assert_eq!(snapshot(&fx.source)?, snapshot(&fx.dest)?);
    Ok(())
}
