//! Agencygraph
//!
//! Hierarchy synchronization and graph traversal engine for producer/agency
//! structures: pulls relation records from a remote relationship service
//! under a rate limit, builds an acyclic producer hierarchy from them, and
//! computes the visible portion of that hierarchy for an interactive view.
//!
//! # Layout
//!
//! - `config`: engine settings, YAML and environment loading
//! - `transport`: HTTP transport and credential seams
//! - `fetch`: rate limiter, request cache, paginated and fan-out fetchers
//! - `upload`: bulk upload submission and job polling
//! - `hierarchy`: relation records -> hierarchy arena
//! - `traversal`: visible-set computation, view state, layout scheduling
//! - `sync`: fetch -> build -> publish orchestration
//!
//! ## Example Usage
//!
//! ```rust
//! use agencygraph::{compute_visible_set, HierarchyGraphBuilder, RelationRecord, TraversalState};
//!
//! let records = vec![
//!     RelationRecord::new("100", "GA-1").with_name("Principal"),
//!     RelationRecord::new("101", "GA-1").with_upline("100"),
//!     RelationRecord::new("102", "GA-1").with_upline("missing"),
//! ];
//! let graph = HierarchyGraphBuilder::new().build(&records);
//! assert!(graph.validate().is_ok());
//! assert_eq!(graph.root_ids().len(), 2); // "100" and the firm's synthetic root
//!
//! let state = TraversalState::default().with_expanded(["100"]);
//! let visible = compute_visible_set(&graph, &state);
//! assert_eq!(visible.ids(), vec!["100", "101", "synthetic:GA-1"]);
//! ```

#![allow(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod fetch;
pub mod hierarchy;
pub mod sync;
pub mod transport;
pub mod traversal;
pub mod upload;

// Re-export main types for convenience
pub use config::{ConfigError, ConfigResult, EngineConfig, UploadConfig};

pub use transport::{
    Credential, CredentialProvider, HttpTransport, StaticCredentials, Transport, TransportError,
    TransportResponse, TransportResult,
};

pub use fetch::{
    normalize_timestamp, CacheKey, FanOutFetcher, FanOutResult, FetchError, FetchPipeline,
    FetchResult, PaginatedFetcher, RateLimiter, RelationQuery, RequestCache,
};

pub use upload::{
    MonitorEvent, MonitorState, UploadError, UploadFile, UploadJob, UploadJobMonitor,
    UploadJobStatus, UploadResult, UploadValidationError,
};

pub use hierarchy::{
    BranchSummary, BuildReport, GraphInvariantError, HierarchyGraph, HierarchyGraphBuilder,
    HierarchyNode, NodeMetrics, RelationRecord, RelationStatus, UplineSource,
};

pub use traversal::{
    child_window, compute_visible_set, ChildWindow, HierarchyView, LayoutEngine, LayoutError,
    LayoutPositions, LayoutScheduler, NodePosition, TraversalState, VisibleEdge, VisibleNode,
    VisibleSet, VisibleSetCache,
};

pub use sync::HierarchySync;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get version string
pub fn version() -> &'static str {
    VERSION
}
