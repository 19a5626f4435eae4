//! Hierarchy node and its derived metrics

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ops::AddAssign;

use super::record::RelationStatus;

/// Active/inactive/pending counts over a whole subtree
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchSummary {
    pub active: usize,
    pub inactive: usize,
    pub pending: usize,
}

impl BranchSummary {
    pub fn of(status: RelationStatus) -> Self {
        let mut summary = Self::default();
        summary.count(status);
        summary
    }

    pub fn count(&mut self, status: RelationStatus) {
        match status {
            RelationStatus::Active => self.active += 1,
            RelationStatus::Inactive => self.inactive += 1,
            RelationStatus::Pending => self.pending += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.active + self.inactive + self.pending
    }
}

impl AddAssign for BranchSummary {
    fn add_assign(&mut self, other: Self) {
        self.active += other.active;
        self.inactive += other.inactive;
        self.pending += other.pending;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeMetrics {
    /// Nodes below this one
    pub descendant_count: usize,
    /// Most recent `addedOn` in the subtree
    pub last_seen: Option<DateTime<Utc>>,
}

/// Where a node's parent link came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UplineSource {
    /// Declared upline, or a declared top-level producer
    Real,
    /// Attached under a firm placeholder because the upline was unusable
    Synthetic,
}

/// A producer (or firm placeholder) in the hierarchy arena.
///
/// Parent and children are id references into the owning
/// [`HierarchyGraph`](super::HierarchyGraph), never owned pointers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HierarchyNode {
    pub id: String,
    pub name: String,
    pub npn: Option<String>,
    pub firm_id: String,
    pub branch_code: Option<String>,
    /// Own relation status; `None` for synthetic roots
    pub status: Option<RelationStatus>,
    pub parent_id: Option<String>,
    /// Unique, in discovery order
    pub children_ids: Vec<String>,
    pub depth: usize,
    pub branch_summary: BranchSummary,
    pub metrics: NodeMetrics,
    pub duplicate_group_id: Option<String>,
    pub duplicate_group_size: usize,
    pub upline_source: UplineSource,
    pub is_synthetic: bool,
    /// Errors and warnings carried by the node's records
    pub issues: Vec<String>,
}

impl HierarchyNode {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn has_children(&self) -> bool {
        !self.children_ids.is_empty()
    }

    /// True when another node shares this node's npn
    pub fn is_duplicate(&self) -> bool {
        self.duplicate_group_size > 1
    }
}
