//! Relgraph: a versioned property graph stored in SQLite.
//!
//! Node and edge types are declared up front in a [`Schema`]; each type
//! gets its own table. Writes go through a [`Session`], and every update
//! or delete first copies the prior row into an append-only history
//! table. Loaded neighborhoods can be walked in memory with
//! [`Subgraph`], and [`BulkCopier`] synchronizes rows between two graph
//! files in chunks.
//!
//! ```no_run
//! use relgraph::{Dir, Graph, Node, NodeTypeDef, PropertyDef, Schema};
//!
//! let schema = Schema::builder()
//!     .node(NodeTypeDef::new("file").property(PropertyDef::string("name")))
//!     .build()?;
//! let graph = Graph::open("graph.db", schema)?;
//!
//! graph.transact(|session| {
//!     let mut file = Node::new(graph.schema(), "file", "f1")?;
//!     file.set("name", "x.txt")?;
//!     session.add_node(file)
//! })?;
//!
//! graph.transact(|session| {
//!     let mut file = session.node("file", "f1")?.expect("inserted above");
//!     file.set("name", "y.txt")?;
//!     session.merge_node(file)
//! })?;
//!
//! let mut read = graph.read_session()?;
//! let history = read.node_history("file", "f1")?;
//! assert_eq!(history[0].property("name"), Some(&"x.txt".into()));
//! # let _ = Dir::Out;
//! # Ok::<(), relgraph::GraphError>(())
//! ```

pub mod config;
pub mod copy;
pub mod error;
pub mod logging;
pub mod model;
pub mod sanitize;
pub mod schema;
pub mod session;
pub mod store;
pub mod traversal;

pub use config::{GraphConfig, JournalMode, RetryPolicy, SyncMode, TxBehavior};
pub use copy::{BulkCopier, CopyOptions, CopyReport, CopyStrategy};
pub use error::{GraphError, Result};
pub use model::{Annotations, Edge, MapDiff, Node, Properties, VoidedEdge, VoidedNode};
pub use schema::{
    Association, Dictionary, EdgeSide, EdgeType, EdgeTypeDef, EndpointBinding, NodeType, NodeTypeDef,
    PropertyDef, PropertyKind, PropertySet, Schema,
};
pub use session::{FlushStats, ScopeOptions, Session, TxState};
pub use store::{EdgeQuery, Graph, NodeQuery};
pub use traversal::{Dir, Subgraph, Visit, WalkOptions};
