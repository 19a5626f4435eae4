//! Immutable producer hierarchy arena
//!
//! Nodes live in one flat id-keyed map; parent and children links are ids.
//! A graph is only ever produced by [`HierarchyGraphBuilder`](super::HierarchyGraphBuilder)
//! and replaced wholesale on the next sync.

use indexmap::IndexMap;
use rustc_hash::FxBuildHasher;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

use super::builder::BuildReport;
use super::node::{BranchSummary, HierarchyNode};

pub(crate) type NodeMap = IndexMap<String, HierarchyNode, FxBuildHasher>;

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Structural defect found by [`HierarchyGraph::validate`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphInvariantError {
    #[error("Node {0} is missing")]
    MissingNode(String),

    #[error("Root {0} has a parent")]
    RootHasParent(String),

    #[error("Parentless node {0} is not listed as a root")]
    UnlistedRoot(String),

    #[error("Node {child} lists parent {parent} but is not among its children")]
    ParentMismatch { parent: String, child: String },

    #[error("Node {0} appears more than once in a children list")]
    DuplicateChild(String),

    #[error("Node {0} is its own ancestor")]
    Cycle(String),

    #[error("Node {id} has depth {actual}, expected {expected}")]
    DepthMismatch { id: String, expected: usize, actual: usize },

    #[error("Derived metrics of node {0} are stale")]
    StaleMetrics(String),

    #[error("Duplicate group {0} is inconsistent")]
    DuplicateGroup(String),
}

pub type GraphResult<T> = Result<T, GraphInvariantError>;

/// Producer hierarchy
#[derive(Debug, Clone)]
pub struct HierarchyGraph {
    nodes_by_id: NodeMap,
    root_ids: Vec<String>,
    generation: u64,
    report: BuildReport,
}

impl HierarchyGraph {
    pub(crate) fn from_parts(nodes_by_id: NodeMap, root_ids: Vec<String>, report: BuildReport) -> Self {
        Self {
            nodes_by_id,
            root_ids,
            generation: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
            report,
        }
    }

    /// Graph with no nodes
    pub fn empty() -> Self {
        Self::from_parts(NodeMap::default(), Vec::new(), BuildReport::default())
    }

    /// Unique per built graph; used to key traversal caches
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn report(&self) -> &BuildReport {
        &self.report
    }

    pub fn get(&self, id: &str) -> Option<&HierarchyNode> {
        self.nodes_by_id.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes_by_id.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes_by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes_by_id.is_empty()
    }

    /// Nodes in discovery order, synthetic roots last
    pub fn nodes(&self) -> impl Iterator<Item = &HierarchyNode> {
        self.nodes_by_id.values()
    }

    pub fn root_ids(&self) -> &[String] {
        &self.root_ids
    }

    pub fn roots(&self) -> impl Iterator<Item = &HierarchyNode> {
        self.root_ids.iter().filter_map(|id| self.nodes_by_id.get(id))
    }

    pub fn children(&self, id: &str) -> Vec<&HierarchyNode> {
        self.get(id)
            .map(|node| {
                node.children_ids
                    .iter()
                    .filter_map(|child| self.nodes_by_id.get(child))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn parent(&self, id: &str) -> Option<&HierarchyNode> {
        self.get(id)
            .and_then(|node| node.parent_id.as_deref())
            .and_then(|parent| self.get(parent))
    }

    /// Ids from the root down to `id` inclusive; empty for unknown ids
    pub fn path_to_root(&self, id: &str) -> Vec<String> {
        let mut path = Vec::new();
        let mut current = self.get(id);
        while let Some(node) = current {
            if path.len() > self.len() {
                break;
            }
            path.push(node.id.clone());
            current = node.parent_id.as_deref().and_then(|p| self.get(p));
        }
        path.reverse();
        path
    }

    /// Pre-order ids of the subtree rooted at `id`
    pub fn subtree_ids(&self, id: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut stack: Vec<&str> = match self.get(id) {
            Some(node) => vec![node.id.as_str()],
            None => return out,
        };
        while let Some(current) = stack.pop() {
            let Some(node) = self.get(current) else { continue };
            out.push(node.id.clone());
            stack.extend(node.children_ids.iter().rev().map(String::as_str));
        }
        out
    }

    /// Case-insensitive substring match on name, id or npn
    pub fn search(&self, query: &str) -> Vec<&HierarchyNode> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Vec::new();
        }
        self.nodes()
            .filter(|node| {
                node.name.to_lowercase().contains(&needle)
                    || node.id.to_lowercase().contains(&needle)
                    || node
                        .npn
                        .as_deref()
                        .map(|npn| npn.to_lowercase().contains(&needle))
                        .unwrap_or(false)
            })
            .collect()
    }

    pub fn synthetic_root_ids(&self) -> Vec<&str> {
        self.roots()
            .filter(|node| node.is_synthetic)
            .map(|node| node.id.as_str())
            .collect()
    }

    /// Group id -> member ids, for groups of two or more
    pub fn duplicate_groups(&self) -> IndexMap<&str, Vec<&str>> {
        let mut groups: IndexMap<&str, Vec<&str>> = IndexMap::new();
        for node in self.nodes() {
            if let Some(group) = node.duplicate_group_id.as_deref() {
                groups.entry(group).or_default().push(node.id.as_str());
            }
        }
        groups
    }

    /// Check every structural invariant of the arena
    pub fn validate(&self) -> GraphResult<()> {
        let listed: HashSet<&str> = self.root_ids.iter().map(String::as_str).collect();
        for id in &self.root_ids {
            let node = self.get(id).ok_or_else(|| GraphInvariantError::MissingNode(id.clone()))?;
            if node.parent_id.is_some() {
                return Err(GraphInvariantError::RootHasParent(id.clone()));
            }
        }

        for node in self.nodes() {
            match node.parent_id.as_deref() {
                None if !listed.contains(node.id.as_str()) => {
                    return Err(GraphInvariantError::UnlistedRoot(node.id.clone()));
                }
                None => {}
                Some(parent_id) => {
                    let parent = self
                        .get(parent_id)
                        .ok_or_else(|| GraphInvariantError::MissingNode(parent_id.to_string()))?;
                    if !parent.children_ids.contains(&node.id) {
                        return Err(GraphInvariantError::ParentMismatch {
                            parent: parent_id.to_string(),
                            child: node.id.clone(),
                        });
                    }
                    if node.depth != parent.depth + 1 {
                        return Err(GraphInvariantError::DepthMismatch {
                            id: node.id.clone(),
                            expected: parent.depth + 1,
                            actual: node.depth,
                        });
                    }
                }
            }

            let mut seen = HashSet::new();
            let mut summary = node.status.map(BranchSummary::of).unwrap_or_default();
            let mut descendants = 0;
            for child_id in &node.children_ids {
                if !seen.insert(child_id.as_str()) {
                    return Err(GraphInvariantError::DuplicateChild(child_id.clone()));
                }
                let child = self
                    .get(child_id)
                    .ok_or_else(|| GraphInvariantError::MissingNode(child_id.clone()))?;
                if child.parent_id.as_deref() != Some(node.id.as_str()) {
                    return Err(GraphInvariantError::ParentMismatch {
                        parent: node.id.clone(),
                        child: child_id.clone(),
                    });
                }
                summary += child.branch_summary;
                descendants += child.metrics.descendant_count + 1;
            }
            if summary != node.branch_summary || descendants != node.metrics.descendant_count {
                return Err(GraphInvariantError::StaleMetrics(node.id.clone()));
            }

            if node.parent_id.is_none() && node.depth != 0 {
                return Err(GraphInvariantError::DepthMismatch {
                    id: node.id.clone(),
                    expected: 0,
                    actual: node.depth,
                });
            }
        }

        for node in self.nodes() {
            let mut hops = 0;
            let mut current = node.parent_id.as_deref();
            while let Some(id) = current {
                if id == node.id || hops > self.len() {
                    return Err(GraphInvariantError::Cycle(node.id.clone()));
                }
                hops += 1;
                current = self.get(id).and_then(|n| n.parent_id.as_deref());
            }
        }

        for (group, members) in self.duplicate_groups() {
            let npns: HashSet<Option<&str>> = members
                .iter()
                .filter_map(|id| self.get(id))
                .map(|n| n.npn.as_deref())
                .collect();
            let sizes_ok = members
                .iter()
                .filter_map(|id| self.get(id))
                .all(|n| n.duplicate_group_size == members.len());
            if members.len() < 2 || npns.len() != 1 || npns.contains(&None) || !sizes_ok {
                return Err(GraphInvariantError::DuplicateGroup(group.to_string()));
            }
        }

        Ok(())
    }
}

impl Default for HierarchyGraph {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::{HierarchyGraphBuilder, RelationRecord};

    fn sample() -> HierarchyGraph {
        HierarchyGraphBuilder::new().build(&[
            RelationRecord::new("1", "GA").with_name("Ada Lovelace"),
            RelationRecord::new("2", "GA").with_upline("1").with_npn("555"),
            RelationRecord::new("3", "GA").with_upline("2"),
            RelationRecord::new("4", "GA").with_upline("1"),
            RelationRecord::new("5", "GA").with_upline("404"),
        ])
    }

    #[test]
    fn test_queries() {
        let graph = sample();
        assert_eq!(graph.len(), 6);
        assert!(graph.validate().is_ok());
        assert_eq!(graph.path_to_root("3"), vec!["1", "2", "3"]);
        assert!(graph.path_to_root("nope").is_empty());
        assert_eq!(graph.subtree_ids("1"), vec!["1", "2", "3", "4"]);
        assert_eq!(graph.parent("3").map(|n| n.id.as_str()), Some("2"));
        let kids: Vec<&str> = graph.children("1").iter().map(|n| n.id.as_str()).collect();
        assert_eq!(kids, vec!["2", "4"]);
        assert_eq!(graph.synthetic_root_ids(), vec!["synthetic:GA"]);
    }

    #[test]
    fn test_search() {
        let graph = sample();
        let hits: Vec<&str> = graph.search("LOVELACE").iter().map(|n| n.id.as_str()).collect();
        assert_eq!(hits, vec!["1"]);
        assert_eq!(graph.search("555").len(), 1);
        assert!(graph.search("  ").is_empty());
    }

    #[test]
    fn test_generations_are_unique() {
        assert_ne!(sample().generation(), sample().generation());
    }

    #[test]
    fn test_validate_catches_stale_metrics() {
        let graph = sample();
        let mut nodes = graph.nodes_by_id.clone();
        if let Some(node) = nodes.get_mut("1") {
            node.metrics.descendant_count = 99;
        }
        let broken = HierarchyGraph::from_parts(nodes, graph.root_ids.clone(), BuildReport::default());
        assert_eq!(broken.validate(), Err(GraphInvariantError::StaleMetrics("1".to_string())));
    }

    #[test]
    fn test_validate_catches_unlisted_root() {
        let graph = sample();
        let broken = HierarchyGraph::from_parts(
            graph.nodes_by_id.clone(),
            vec!["1".to_string()],
            BuildReport::default(),
        );
        assert!(matches!(broken.validate(), Err(GraphInvariantError::UnlistedRoot(_))));
    }
}
