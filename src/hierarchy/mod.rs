//! Producer hierarchy model
//!
//! Relation records come in flat; [`HierarchyGraphBuilder`] turns them into an
//! id-keyed arena ([`HierarchyGraph`]) with derived branch summaries,
//! descendant counts and duplicate-npn groups.

pub mod builder;
pub mod graph;
pub mod node;
pub mod record;

pub use builder::{BuildReport, HierarchyGraphBuilder};
pub use graph::{GraphInvariantError, GraphResult, HierarchyGraph};
pub use node::{BranchSummary, HierarchyNode, NodeMetrics, UplineSource};
pub use record::{RelationRecord, RelationStatus};
