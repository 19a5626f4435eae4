//! Visible-set traversal
//!
//! [`compute_visible_set`] is a pure function of a [`HierarchyGraph`] and a
//! [`TraversalState`]: which nodes are on screen, at what depth, which edges
//! connect them, and which are highlighted or dimmed. It never mutates the
//! graph and keeps no state between calls.

pub mod cache;
pub mod layout;
pub mod session;

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

use crate::hierarchy::{HierarchyGraph, HierarchyNode};

pub use cache::VisibleSetCache;
pub use layout::{LayoutEngine, LayoutError, LayoutPositions, LayoutScheduler, NodePosition};
pub use session::HierarchyView;

pub const DEFAULT_CHILDREN_PAGE_SIZE: usize = 10;

/// UI state driving a traversal
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TraversalState {
    pub expanded_ids: BTreeSet<String>,
    /// Deepest visible depth below the start node; `None` for unlimited
    pub depth_limit: Option<usize>,
    pub scope_root_id: Option<String>,
    /// Global child page, used when a node has no override
    pub child_page_index: usize,
    pub children_page_size: usize,
    pub show_all_children: bool,
    /// Node id -> child page
    pub per_node_page: BTreeMap<String, usize>,
    pub highlighted_path: Vec<String>,
    pub hovered_id: Option<String>,
    /// Dim everything off the highlighted path
    pub focus_lens: bool,
}

impl Default for TraversalState {
    fn default() -> Self {
        Self {
            expanded_ids: BTreeSet::new(),
            depth_limit: None,
            scope_root_id: None,
            child_page_index: 0,
            children_page_size: DEFAULT_CHILDREN_PAGE_SIZE,
            show_all_children: false,
            per_node_page: BTreeMap::new(),
            highlighted_path: Vec::new(),
            hovered_id: None,
            focus_lens: false,
        }
    }
}

impl TraversalState {
    pub fn with_expanded<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.expanded_ids.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn is_expanded(&self, id: &str) -> bool {
        self.expanded_ids.contains(id)
    }

    fn page_size(&self) -> usize {
        self.children_page_size.max(1)
    }
}

/// Slice of a node's children currently shown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildWindow {
    pub page: usize,
    pub page_count: usize,
    /// Inclusive start index into `children_ids`
    pub start: usize,
    /// Exclusive end index
    pub end: usize,
    pub total: usize,
}

impl ChildWindow {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn is_paged(&self) -> bool {
        self.page_count > 1
    }
}

/// Window of `node_id`'s children under `state`.
///
/// Everything is shown when `show_all_children` is set or the children fit one
/// page; otherwise the node's own page override (else the global page) is
/// clamped to the valid range.
pub fn child_window(total: usize, node_id: &str, state: &TraversalState) -> ChildWindow {
    let size = state.page_size();
    if state.show_all_children || total <= size {
        return ChildWindow {
            page: 0,
            page_count: 1,
            start: 0,
            end: total,
            total,
        };
    }

    let page_count = total.div_ceil(size);
    let requested = state
        .per_node_page
        .get(node_id)
        .copied()
        .unwrap_or(state.child_page_index);
    let page = requested.min(page_count - 1);
    let start = page * size;
    ChildWindow {
        page,
        page_count,
        start,
        end: (start + size).min(total),
        total,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisibleNode {
    pub id: String,
    /// Depth below the traversal start, not the graph depth
    pub depth: usize,
    pub highlighted: bool,
    pub dimmed: bool,
    pub expanded: bool,
    pub child_count: usize,
    /// Present when the node's children are being shown
    pub window: Option<ChildWindow>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisibleEdge {
    pub source: String,
    pub target: String,
    pub highlighted: bool,
}

/// Result of one traversal
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisibleSet {
    /// Pre-order
    pub nodes: Vec<VisibleNode>,
    pub edges: Vec<VisibleEdge>,
    /// Start node when the scope resolved; `None` means all roots
    pub scope_root: Option<String>,
    /// Referenced ids absent from the graph
    pub skipped: Vec<String>,
}

impl VisibleSet {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: &str) -> Option<&VisibleNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.node(id).is_some()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.id.as_str()).collect()
    }
}

/// Highlight and dim rules for one traversal
struct Emphasis<'a> {
    path: FxHashSet<&'a str>,
    hover: Option<FxHashSet<&'a str>>,
    focus: bool,
}

impl<'a> Emphasis<'a> {
    fn new(graph: &'a HierarchyGraph, state: &'a TraversalState) -> Self {
        let hover = state
            .hovered_id
            .as_deref()
            .and_then(|id| graph.get(id))
            .map(one_hop);
        Self {
            path: state.highlighted_path.iter().map(String::as_str).collect(),
            hover,
            focus: state.focus_lens && !state.highlighted_path.is_empty(),
        }
    }

    fn highlighted(&self, id: &str) -> bool {
        self.path.contains(id) || self.hover.as_ref().map(|h| h.contains(id)).unwrap_or(false)
    }

    fn dimmed(&self, id: &str) -> bool {
        let off_focus = self.focus && !self.highlighted(id);
        let off_hover = self.hover.as_ref().map(|h| !h.contains(id)).unwrap_or(false);
        off_focus || off_hover
    }
}

/// A node, its parent and its direct children
fn one_hop(node: &HierarchyNode) -> FxHashSet<&str> {
    let mut set = FxHashSet::default();
    set.insert(node.id.as_str());
    if let Some(parent) = node.parent_id.as_deref() {
        set.insert(parent);
    }
    set.extend(node.children_ids.iter().map(String::as_str));
    set
}

/// Compute what is visible for `state` over `graph`.
///
/// Pre-order depth-first walk from the scope root when it resolves, else from
/// every graph root. A node's children are entered when it is expanded, has
/// children and sits above the depth limit; only its current child window is
/// walked. Ids that no longer resolve are skipped with a warning.
pub fn compute_visible_set(graph: &HierarchyGraph, state: &TraversalState) -> VisibleSet {
    let emphasis = Emphasis::new(graph, state);
    let mut out = VisibleSet::default();

    let starts: Vec<&str> = match state.scope_root_id.as_deref() {
        Some(scope) if graph.contains(scope) => {
            out.scope_root = Some(scope.to_string());
            vec![scope]
        }
        _ => graph.root_ids().iter().map(String::as_str).collect(),
    };

    let mut visited: FxHashSet<&str> = FxHashSet::default();
    let mut stack: Vec<(&str, usize, Option<&str>)> =
        starts.iter().rev().map(|&id| (id, 0, None)).collect();

    while let Some((id, depth, parent)) = stack.pop() {
        let Some(node) = graph.get(id) else {
            warn!("Visible set references missing node {}; skipping", id);
            out.skipped.push(id.to_string());
            continue;
        };
        if !visited.insert(node.id.as_str()) {
            continue;
        }

        let highlighted = emphasis.highlighted(id);
        if let Some(parent) = parent {
            out.edges.push(VisibleEdge {
                source: parent.to_string(),
                target: id.to_string(),
                highlighted: highlighted && emphasis.highlighted(parent),
            });
        }

        let expanded = state.is_expanded(id);
        let within_depth = state.depth_limit.map(|limit| depth < limit).unwrap_or(true);
        let window = (expanded && node.has_children() && within_depth)
            .then(|| child_window(node.children_ids.len(), id, state));

        out.nodes.push(VisibleNode {
            id: id.to_string(),
            depth,
            highlighted,
            dimmed: emphasis.dimmed(id),
            expanded,
            child_count: node.children_ids.len(),
            window,
        });

        if let Some(window) = window {
            for child in node.children_ids[window.start..window.end].iter().rev() {
                stack.push((child.as_str(), depth + 1, Some(node.id.as_str())));
            }
        }
    }

    out
}
