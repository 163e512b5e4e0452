//! Breadth- and depth-first walks over a materialized [`Subgraph`].
//!
//! The walks never touch storage. A session loads the reachable
//! neighborhood once (see [`Session::subgraph`](crate::Session::subgraph))
//! and the iterators here run over the in-memory adjacency lists.

use std::collections::VecDeque;

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use crate::error::{GraphError, Result};
use crate::model::{Edge, Node};

/// Which edges a walk follows.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum Dir {
    /// Follow outgoing edges to their destination.
    #[default]
    Out,
    /// Follow incoming edges back to their source.
    In,
}

/// Walk configuration.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct WalkOptions {
    /// Direction to follow for edge expansions.
    pub direction: Dir,
    /// Deepest hop count (inclusive) to yield; `None` walks everything
    /// reachable.
    pub max_depth: Option<usize>,
}

impl WalkOptions {
    /// Unbounded walk in `direction`.
    pub fn new(direction: Dir) -> Self {
        Self {
            direction,
            max_depth: None,
        }
    }

    /// Bounds the walk at `depth` hops.
    pub fn max_depth(mut self, depth: usize) -> Self {
        self.max_depth = Some(depth);
        self
    }

    fn expands(&self, depth: usize) -> bool {
        self.max_depth.map_or(true, |max| depth < max)
    }
}

/// One yielded node.
#[derive(Clone, Copy, Debug)]
pub struct Visit<'g> {
    /// The visited node.
    pub node: &'g Node,
    /// Hops from the root along the path that first reached the node.
    pub depth: usize,
}

/// Predicate type of the unfiltered walks.
pub type AnyEdge = fn(&Edge) -> bool;

fn any_edge(_: &Edge) -> bool {
    true
}

#[derive(Debug)]
struct Slot {
    edge: Edge,
    src: usize,
    dst: usize,
}

type NodeKey = (String, String);

/// Nodes and edges loaded into memory with per-node adjacency lists.
#[derive(Debug, Default)]
pub struct Subgraph {
    nodes: Vec<Node>,
    index: FxHashMap<NodeKey, usize>,
    edges: Vec<Slot>,
    edge_index: FxHashSet<(String, String, String)>,
    out: Vec<SmallVec<[usize; 4]>>,
    inc: Vec<SmallVec<[usize; 4]>>,
}

impl Subgraph {
    /// Empty subgraph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node (a no-op for a node already present) and returns its slot.
    pub fn add_node(&mut self, node: Node) -> usize {
        let key = (node.label().to_owned(), node.node_id().to_owned());
        if let Some(&slot) = self.index.get(&key) {
            return slot;
        }
        let slot = self.nodes.len();
        self.nodes.push(node);
        self.out.push(SmallVec::new());
        self.inc.push(SmallVec::new());
        self.index.insert(key, slot);
        slot
    }

    /// Adds an edge between two nodes already present. Returns `false`
    /// when the edge was already loaded.
    pub fn add_edge(&mut self, edge: Edge) -> Result<bool> {
        let ty = edge.edge_type();
        let src = self.slot(ty.src_label(), edge.src_id()).ok_or_else(|| {
            self.missing(&edge, "source", edge.src_id())
        })?;
        let dst = self.slot(ty.dst_label(), edge.dst_id()).ok_or_else(|| {
            self.missing(&edge, "destination", edge.dst_id())
        })?;
        let key = (
            ty.name().to_owned(),
            edge.src_id().to_owned(),
            edge.dst_id().to_owned(),
        );
        if !self.edge_index.insert(key) {
            return Ok(false);
        }
        let slot = self.edges.len();
        self.edges.push(Slot { edge, src, dst });
        self.out[src].push(slot);
        self.inc[dst].push(slot);
        Ok(true)
    }

    fn missing(&self, edge: &Edge, side: &'static str, id: &str) -> GraphError {
        GraphError::MissingEndpoint {
            edge_type: edge.edge_type().name().to_owned(),
            src_id: edge.src_id().to_owned(),
            dst_id: edge.dst_id().to_owned(),
            side,
            missing: id.to_owned(),
        }
    }

    fn slot(&self, label: &str, node_id: &str) -> Option<usize> {
        self.index
            .get(&(label.to_owned(), node_id.to_owned()))
            .copied()
    }

    fn root_slot(&self, root: &Node) -> Result<usize> {
        self.slot(root.label(), root.node_id())
            .ok_or_else(|| GraphError::lookup(root.label(), root.node_id(), 1, 0))
    }

    /// Looks up a loaded node.
    pub fn node(&self, label: &str, node_id: &str) -> Option<&Node> {
        self.slot(label, node_id).map(|slot| &self.nodes[slot])
    }

    /// `true` when `node` is loaded.
    pub fn contains(&self, node: &Node) -> bool {
        self.slot(node.label(), node.node_id()).is_some()
    }

    /// Loaded nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    /// Loaded edges in insertion order.
    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.iter().map(|slot| &slot.edge)
    }

    /// Number of loaded nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of loaded edges.
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Direct neighbors of `node` in `direction`, in edge insertion order.
    pub fn neighbors(&self, node: &Node, direction: Dir) -> Result<Vec<&Node>> {
        let slot = self.root_slot(node)?;
        Ok(self
            .adjacent(slot, direction)
            .iter()
            .map(|&edge| &self.nodes[self.step(edge, direction)])
            .collect())
    }

    fn adjacent(&self, slot: usize, direction: Dir) -> &[usize] {
        match direction {
            Dir::Out => &self.out[slot],
            Dir::In => &self.inc[slot],
        }
    }

    fn step(&self, edge: usize, direction: Dir) -> usize {
        match direction {
            Dir::Out => self.edges[edge].dst,
            Dir::In => self.edges[edge].src,
        }
    }

    /// Breadth-first walk from `root` following every edge.
    pub fn bfs(&self, root: &Node, options: WalkOptions) -> Result<Bfs<'_, AnyEdge>> {
        self.bfs_with(root, options, any_edge as AnyEdge)
    }

    /// Breadth-first walk following only edges accepted by `predicate`.
    pub fn bfs_with<F>(&self, root: &Node, options: WalkOptions, predicate: F) -> Result<Bfs<'_, F>>
    where
        F: FnMut(&Edge) -> bool,
    {
        let root = self.root_slot(root)?;
        let mut queue = VecDeque::new();
        queue.push_back((root, 0));
        let mut visited = FxHashSet::default();
        visited.insert(root);
        Ok(Bfs {
            graph: self,
            options,
            predicate,
            queue,
            visited,
        })
    }

    /// Depth-first (pre-order) walk from `root` following every edge.
    pub fn dfs(&self, root: &Node, options: WalkOptions) -> Result<Dfs<'_, AnyEdge>> {
        self.dfs_with(root, options, any_edge as AnyEdge)
    }

    /// Depth-first walk following only edges accepted by `predicate`.
    pub fn dfs_with<F>(&self, root: &Node, options: WalkOptions, predicate: F) -> Result<Dfs<'_, F>>
    where
        F: FnMut(&Edge) -> bool,
    {
        let root = self.root_slot(root)?;
        let mut shallowest = FxHashMap::default();
        shallowest.insert(root, 0);
        Ok(Dfs {
            graph: self,
            options,
            predicate,
            stack: Vec::new(),
            shallowest,
            root: Some(root),
        })
    }
}

/// Breadth-first iterator. A node is marked visited when it is enqueued,
/// so each node is yielded once, at its shortest hop count.
pub struct Bfs<'g, F> {
    graph: &'g Subgraph,
    options: WalkOptions,
    predicate: F,
    queue: VecDeque<(usize, usize)>,
    visited: FxHashSet<usize>,
}

impl<'g, F> Iterator for Bfs<'g, F>
where
    F: FnMut(&Edge) -> bool,
{
    type Item = Visit<'g>;

    fn next(&mut self) -> Option<Self::Item> {
        let (slot, depth) = self.queue.pop_front()?;
        let graph = self.graph;
        if self.options.expands(depth) {
            for &edge in graph.adjacent(slot, self.options.direction) {
                if !(self.predicate)(&graph.edges[edge].edge) {
                    continue;
                }
                let next = graph.step(edge, self.options.direction);
                if self.visited.insert(next) {
                    self.queue.push_back((next, depth + 1));
                }
            }
        }
        Some(Visit {
            node: &graph.nodes[slot],
            depth,
        })
    }
}

#[derive(Debug)]
struct Frame {
    slot: usize,
    next_edge: usize,
    depth: usize,
}

/// Depth-first iterator with resumable frames.
///
/// Each node is yielded once, at the depth of the path that reached it
/// first. In a bounded walk, a node reached again along a strictly
/// shorter path is pushed again without being yielded, so its
/// descendants that fit under the bound are still found. Unbounded walks
/// never re-push.
pub struct Dfs<'g, F> {
    graph: &'g Subgraph,
    options: WalkOptions,
    predicate: F,
    stack: Vec<Frame>,
    shallowest: FxHashMap<usize, usize>,
    root: Option<usize>,
}

impl<'g, F> Iterator for Dfs<'g, F>
where
    F: FnMut(&Edge) -> bool,
{
    type Item = Visit<'g>;

    fn next(&mut self) -> Option<Self::Item> {
        let graph = self.graph;
        if let Some(root) = self.root.take() {
            self.stack.push(Frame {
                slot: root,
                next_edge: 0,
                depth: 0,
            });
            return Some(Visit {
                node: &graph.nodes[root],
                depth: 0,
            });
        }
        loop {
            let frame = self.stack.last_mut()?;
            let adjacent = graph.adjacent(frame.slot, self.options.direction);
            if !self.options.expands(frame.depth) || frame.next_edge >= adjacent.len() {
                self.stack.pop();
                continue;
            }
            let edge = adjacent[frame.next_edge];
            frame.next_edge += 1;
            let depth = frame.depth + 1;
            if !(self.predicate)(&graph.edges[edge].edge) {
                continue;
            }
            let next = graph.step(edge, self.options.direction);
            match self.shallowest.get(&next).copied() {
                None => {
                    self.shallowest.insert(next, depth);
                    self.stack.push(Frame {
                        slot: next,
                        next_edge: 0,
                        depth,
                    });
                    return Some(Visit {
                        node: &graph.nodes[next],
                        depth,
                    });
                }
                Some(seen) if self.options.max_depth.is_some() && depth < seen => {
                    self.shallowest.insert(next, depth);
                    self.stack.push(Frame {
                        slot: next,
                        next_edge: 0,
                        depth,
                    });
                }
                Some(_) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{EdgeTypeDef, NodeTypeDef, PropertyDef, Schema};
    use proptest::prelude::*;
    use std::cell::Cell;
    use std::collections::{BTreeSet, HashMap};
    use std::sync::Arc;

    fn schema() -> Arc<Schema> {
        Schema::builder()
            .node(NodeTypeDef::new("item"))
            .edge(
                EdgeTypeDef::new("item", "links", "item")
                    .associations("targets", "sources")
                    .property(PropertyDef::boolean("hidden")),
            )
            .build()
            .unwrap()
    }

    fn graph(schema: &Schema, ids: &[&str], edges: &[(&str, &str)]) -> Subgraph {
        let mut graph = Subgraph::new();
        for id in ids {
            graph.add_node(Node::new(schema, "item", *id).unwrap());
        }
        for (src, dst) in edges {
            graph
                .add_edge(Edge::new(schema, *src, *dst, "links").unwrap())
                .unwrap();
        }
        graph
    }

    fn root(graph: &Subgraph, id: &str) -> Node {
        graph.node("item", id).unwrap().clone()
    }

    fn ids<'g>(visits: impl Iterator<Item = Visit<'g>>) -> Vec<(String, usize)> {
        visits
            .map(|visit| (visit.node.node_id().to_owned(), visit.depth))
            .collect()
    }

    fn pairs(expected: &[(&str, usize)]) -> Vec<(String, usize)> {
        expected
            .iter()
            .map(|(id, depth)| ((*id).to_owned(), *depth))
            .collect()
    }

    #[test]
    fn bfs_yields_by_level() {
        let schema = schema();
        let g = graph(
            &schema,
            &["a", "b", "c", "d", "e"],
            &[("a", "b"), ("a", "c"), ("b", "d"), ("c", "d"), ("d", "e")],
        );
        let walk = g.bfs(&root(&g, "a"), WalkOptions::new(Dir::Out)).unwrap();
        assert_eq!(
            ids(walk),
            pairs(&[("a", 0), ("b", 1), ("c", 1), ("d", 2), ("e", 3)])
        );
        let bounded = g
            .bfs(&root(&g, "a"), WalkOptions::new(Dir::Out).max_depth(1))
            .unwrap();
        assert_eq!(ids(bounded), pairs(&[("a", 0), ("b", 1), ("c", 1)]));
    }

    #[test]
    fn incoming_walks_step_to_the_source() {
        let schema = schema();
        let g = graph(&schema, &["a", "b", "c"], &[("a", "b"), ("b", "c")]);
        let walk = g.bfs(&root(&g, "c"), WalkOptions::new(Dir::In)).unwrap();
        assert_eq!(ids(walk), pairs(&[("c", 0), ("b", 1), ("a", 2)]));
        let out = g.dfs(&root(&g, "c"), WalkOptions::new(Dir::Out)).unwrap();
        assert_eq!(ids(out), pairs(&[("c", 0)]));
    }

    #[test]
    fn cycles_terminate() {
        let schema = schema();
        let g = graph(&schema, &["a", "b", "c"], &[("a", "b"), ("b", "c"), ("c", "a")]);
        assert_eq!(g.bfs(&root(&g, "a"), WalkOptions::default()).unwrap().count(), 3);
        assert_eq!(g.dfs(&root(&g, "a"), WalkOptions::default()).unwrap().count(), 3);
    }

    #[test]
    fn dfs_is_preorder_with_first_path_depths() {
        let schema = schema();
        let g = graph(
            &schema,
            &["a", "b", "c", "d"],
            &[("a", "b"), ("b", "c"), ("a", "c"), ("c", "d")],
        );
        let walk = g.dfs(&root(&g, "a"), WalkOptions::new(Dir::Out)).unwrap();
        assert_eq!(
            ids(walk),
            pairs(&[("a", 0), ("b", 1), ("c", 2), ("d", 3)])
        );
    }

    #[test]
    fn bounded_dfs_repushes_a_node_reached_by_a_shorter_path() {
        // a -> b -> x first reaches x at the bound, so y is not expanded;
        // the direct a -> x edge then re-pushes x at depth 1 and y is found.
        let schema = schema();
        let g = graph(
            &schema,
            &["a", "b", "x", "y"],
            &[("a", "b"), ("b", "x"), ("a", "x"), ("x", "y")],
        );
        let walk = g
            .dfs(&root(&g, "a"), WalkOptions::new(Dir::Out).max_depth(2))
            .unwrap();
        assert_eq!(
            ids(walk),
            pairs(&[("a", 0), ("b", 1), ("x", 2), ("y", 2)])
        );
    }

    #[test]
    fn equal_depth_paths_do_not_repush() {
        let schema = schema();
        let g = graph(
            &schema,
            &["a", "b", "c", "d", "e"],
            &[("a", "b"), ("a", "c"), ("b", "d"), ("c", "d"), ("d", "e")],
        );
        let d_to_e = Cell::new(0);
        let walk = g
            .dfs_with(
                &root(&g, "a"),
                WalkOptions::new(Dir::Out).max_depth(5),
                |edge: &Edge| {
                    if edge.src_id() == "d" {
                        d_to_e.set(d_to_e.get() + 1);
                    }
                    true
                },
            )
            .unwrap();
        assert_eq!(walk.count(), 5);
        assert_eq!(d_to_e.get(), 1);
    }

    #[test]
    fn unbounded_dfs_never_repushes() {
        let schema = schema();
        let g = graph(
            &schema,
            &["a", "b", "x", "y"],
            &[("a", "b"), ("b", "x"), ("a", "x"), ("x", "y")],
        );
        let x_to_y = Cell::new(0);
        let walk = g
            .dfs_with(&root(&g, "a"), WalkOptions::new(Dir::Out), |edge: &Edge| {
                if edge.src_id() == "x" {
                    x_to_y.set(x_to_y.get() + 1);
                }
                true
            })
            .unwrap();
        assert_eq!(walk.count(), 4);
        assert_eq!(x_to_y.get(), 1);
    }

    #[test]
    fn predicate_prunes_edges_before_their_endpoint() {
        let schema = schema();
        let mut g = graph(&schema, &["a", "b", "c"], &[("a", "b")]);
        let mut hidden = Edge::new(&schema, "a", "c", "links").unwrap();
        hidden.set("hidden", &true).unwrap();
        g.add_edge(hidden).unwrap();
        let visible = |edge: &Edge| edge.get("hidden") != Some(&serde_json::Value::Bool(true));
        let bfs = g
            .bfs_with(&root(&g, "a"), WalkOptions::default(), visible)
            .unwrap();
        assert_eq!(ids(bfs), pairs(&[("a", 0), ("b", 1)]));
        let dfs = g
            .dfs_with(&root(&g, "a"), WalkOptions::default(), visible)
            .unwrap();
        assert_eq!(ids(dfs), pairs(&[("a", 0), ("b", 1)]));
    }

    #[test]
    fn unknown_roots_and_dangling_edges_are_rejected() {
        let schema = schema();
        let mut g = graph(&schema, &["a"], &[]);
        let stranger = Node::new(&schema, "item", "zz").unwrap();
        assert!(g.bfs(&stranger, WalkOptions::default()).is_err());
        let err = g
            .add_edge(Edge::new(&schema, "a", "zz", "links").unwrap())
            .unwrap_err();
        assert!(matches!(err, GraphError::MissingEndpoint { side: "destination", .. }));
        assert!(g.add_edge(Edge::new(&schema, "a", "a", "links").unwrap()).unwrap());
        assert!(!g.add_edge(Edge::new(&schema, "a", "a", "links").unwrap()).unwrap());
        assert_eq!(g.edge_count(), 1);
    }

    fn shortest_hops(n: usize, edges: &[(usize, usize)], root: usize) -> HashMap<usize, usize> {
        let mut dist = HashMap::new();
        dist.insert(root, 0);
        let mut queue = VecDeque::from([root]);
        while let Some(node) = queue.pop_front() {
            for &(src, dst) in edges {
                if src == node && dst < n && !dist.contains_key(&dst) {
                    dist.insert(dst, dist[&node] + 1);
                    queue.push_back(dst);
                }
            }
        }
        dist
    }

    fn arb_graph() -> impl Strategy<Value = (usize, Vec<(usize, usize)>)> {
        (2usize..12).prop_flat_map(|n| {
            (
                Just(n),
                prop::collection::vec((0..n, 0..n), 0..30),
            )
        })
    }

    proptest! {
        #[test]
        fn prop_unbounded_walks_are_complete((n, raw) in arb_graph()) {
            let schema = schema();
            let names: Vec<String> = (0..n).map(|i| format!("n{i}")).collect();
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            let edges: Vec<(&str, &str)> = raw.iter().map(|&(s, d)| (refs[s], refs[d])).collect();
            let g = graph(&schema, &refs, &edges);
            let reachable: BTreeSet<String> = shortest_hops(n, &raw, 0)
                .keys()
                .map(|&i| names[i].clone())
                .collect();
            let start = root(&g, "n0");

            let bfs: Vec<String> = g.bfs(&start, WalkOptions::default()).unwrap()
                .map(|v| v.node.node_id().to_owned()).collect();
            let dfs: Vec<String> = g.dfs(&start, WalkOptions::default()).unwrap()
                .map(|v| v.node.node_id().to_owned()).collect();
            prop_assert_eq!(bfs.len(), reachable.len());
            prop_assert_eq!(dfs.len(), reachable.len());
            prop_assert_eq!(bfs.into_iter().collect::<BTreeSet<_>>(), reachable.clone());
            prop_assert_eq!(dfs.into_iter().collect::<BTreeSet<_>>(), reachable);
        }

        #[test]
        fn prop_bounded_walks_respect_depth((n, raw) in arb_graph(), k in 0usize..4) {
            let schema = schema();
            let names: Vec<String> = (0..n).map(|i| format!("n{i}")).collect();
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            let edges: Vec<(&str, &str)> = raw.iter().map(|&(s, d)| (refs[s], refs[d])).collect();
            let g = graph(&schema, &refs, &edges);
            let dist = shortest_hops(n, &raw, 0);
            let within: BTreeSet<String> = dist
                .iter()
                .filter(|(_, &d)| d <= k)
                .map(|(&i, _)| names[i].clone())
                .collect();
            let start = root(&g, "n0");
            let options = WalkOptions::default().max_depth(k);

            for visit in g.bfs(&start, options).unwrap() {
                let i: usize = visit.node.node_id()[1..].parse().unwrap();
                prop_assert!(dist[&i] <= k);
                prop_assert_eq!(visit.depth, dist[&i]);
            }
            let mut seen = BTreeSet::new();
            for visit in g.dfs(&start, options).unwrap() {
                let i: usize = visit.node.node_id()[1..].parse().unwrap();
                prop_assert!(visit.depth <= k);
                prop_assert!(dist[&i] <= k);
                prop_assert!(seen.insert(visit.node.node_id().to_owned()));
            }
            prop_assert_eq!(seen, within);
        }
    }
}
