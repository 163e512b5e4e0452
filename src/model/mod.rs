//! Graph entities: nodes, edges, their property containers and history
//! records.

mod edge;
mod node;
mod props;
mod timestamp;
mod voided;

pub use edge::Edge;
pub use node::Node;
pub use props::{Annotations, MapDiff, Properties};
pub use timestamp::{format_ts, parse_ts};
pub use voided::{VoidedEdge, VoidedNode};

pub(crate) use timestamp::normalize_ts;
