//! Flat relation records -> hierarchy arena
//!
//! The build never fails. Every degraded upline reference (unknown producer,
//! self reference, cycle) is re-attached under a per-firm synthetic root so
//! the result is always a forest.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use rustc_hash::{FxBuildHasher, FxHashSet};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::graph::{HierarchyGraph, NodeMap};
use super::node::{BranchSummary, HierarchyNode, NodeMetrics, UplineSource};
use super::record::{non_blank, RelationRecord, RelationStatus};

type FxIndexMap<K, V> = IndexMap<K, V, FxBuildHasher>;

const SYNTHETIC_PREFIX: &str = "synthetic:";

/// What the builder did with its input
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildReport {
    pub record_count: usize,
    /// Records without a producer id
    pub skipped_records: usize,
    pub node_count: usize,
    pub real_roots: usize,
    pub synthetic_roots: usize,
    pub unresolved_uplines: usize,
    pub self_references: usize,
    pub broken_cycles: usize,
    pub duplicate_groups: usize,
    pub nodes_in_duplicate_groups: usize,
}

impl BuildReport {
    /// Nodes attached under a synthetic root, for any reason
    pub fn synthetic_attachments(&self) -> usize {
        self.unresolved_uplines + self.self_references + self.broken_cycles
    }

    pub fn root_count(&self) -> usize {
        self.real_roots + self.synthetic_roots
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    Root,
    Parent(usize),
    Unresolved,
    SelfReference,
    Cycle,
}

/// Everything known about one producer after merging its records
#[derive(Debug)]
struct Draft {
    name: Option<String>,
    firm_id: Option<String>,
    branch_code: Option<String>,
    npn: Option<String>,
    upline: Option<String>,
    status: RelationStatus,
    status_at: Option<DateTime<Utc>>,
    last_seen: Option<DateTime<Utc>>,
    issues: Vec<String>,
}

impl Draft {
    fn from_record(record: &RelationRecord) -> Self {
        let mut draft = Self {
            name: None,
            firm_id: None,
            branch_code: None,
            npn: None,
            upline: None,
            status: record.status,
            status_at: record.added_on,
            last_seen: record.added_on,
            issues: Vec::new(),
        };
        draft.absorb_fields(record);
        draft
    }

    fn merge(&mut self, record: &RelationRecord) {
        // Latest record wins the status; ties keep the first seen
        if record.added_on > self.status_at {
            self.status = record.status;
            self.status_at = record.added_on;
        }
        self.last_seen = self.last_seen.max(record.added_on);
        self.absorb_fields(record);
    }

    fn absorb_fields(&mut self, record: &RelationRecord) {
        fill(&mut self.name, non_blank(record.producer_name.as_deref()));
        fill(&mut self.firm_id, non_blank(Some(record.firm_id.as_str())));
        fill(&mut self.branch_code, non_blank(record.branch_code.as_deref()));
        fill(&mut self.npn, record.npn_ref());
        fill(&mut self.upline, record.upline_ref());
        for issue in [record.errors.as_deref(), record.warnings.as_deref()] {
            if let Some(issue) = non_blank(issue) {
                if !self.issues.iter().any(|i| i == issue) {
                    self.issues.push(issue.to_string());
                }
            }
        }
    }
}

fn fill(slot: &mut Option<String>, value: Option<&str>) {
    if slot.is_none() {
        *slot = value.map(str::to_string);
    }
}

/// Builds a [`HierarchyGraph`] from relation records
#[derive(Debug, Clone, Default)]
pub struct HierarchyGraphBuilder;

impl HierarchyGraphBuilder {
    pub fn new() -> Self {
        Self
    }

    pub fn build(&self, records: &[RelationRecord]) -> HierarchyGraph {
        let mut report = BuildReport {
            record_count: records.len(),
            ..BuildReport::default()
        };

        // One draft per producer id, in discovery order
        let mut drafts: FxIndexMap<String, Draft> = FxIndexMap::default();
        for record in records {
            let id = record.producer_id.trim();
            if id.is_empty() {
                report.skipped_records += 1;
                continue;
            }
            match drafts.get_mut(id) {
                Some(draft) => draft.merge(record),
                None => {
                    drafts.insert(id.to_string(), Draft::from_record(record));
                }
            }
        }
        if report.skipped_records > 0 {
            debug!("Skipped {} records without a producer id", report.skipped_records);
        }

        let mut links = resolve_links(&drafts);
        break_cycles(&mut links);

        let count = drafts.len();
        let mut nodes: Vec<HierarchyNode> = drafts
            .iter()
            .map(|(id, draft)| HierarchyNode {
                id: id.clone(),
                name: draft
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("Producer {}", id)),
                npn: draft.npn.clone(),
                firm_id: draft.firm_id.clone().unwrap_or_default(),
                branch_code: draft.branch_code.clone(),
                status: Some(draft.status),
                parent_id: None,
                children_ids: Vec::new(),
                depth: 0,
                branch_summary: BranchSummary::default(),
                metrics: NodeMetrics {
                    descendant_count: 0,
                    last_seen: draft.last_seen,
                },
                duplicate_group_id: None,
                duplicate_group_size: 0,
                upline_source: UplineSource::Real,
                is_synthetic: false,
                issues: draft.issues.clone(),
            })
            .collect();

        // Synthetic roots, one per firm that needs one
        let mut parents: Vec<Option<usize>> = vec![None; count];
        let mut synthetic_by_firm: FxIndexMap<String, usize> = FxIndexMap::default();
        let mut taken_ids: FxHashSet<String> = drafts.keys().cloned().collect();
        for (i, link) in links.iter().enumerate() {
            match *link {
                Link::Root => {}
                Link::Parent(p) => parents[i] = Some(p),
                degraded => {
                    match degraded {
                        Link::Unresolved => report.unresolved_uplines += 1,
                        Link::SelfReference => report.self_references += 1,
                        _ => report.broken_cycles += 1,
                    }
                    let firm = nodes[i].firm_id.clone();
                    let slot = match synthetic_by_firm.get(&firm) {
                        Some(&slot) => slot,
                        None => {
                            let slot = nodes.len();
                            nodes.push(synthetic_root(&firm, &mut taken_ids));
                            parents.push(None);
                            synthetic_by_firm.insert(firm, slot);
                            slot
                        }
                    };
                    debug!(
                        "Producer {} attached under {} ({:?} upline {:?})",
                        nodes[i].id,
                        nodes[slot].id,
                        degraded,
                        drafts.get_index(i).and_then(|(_, d)| d.upline.as_deref())
                    );
                    nodes[i].upline_source = UplineSource::Synthetic;
                    parents[i] = Some(slot);
                }
            }
        }

        // Children in discovery order
        let mut children: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
        for (i, parent) in parents.iter().enumerate() {
            if let Some(p) = *parent {
                children[p].push(i);
                nodes[i].parent_id = Some(nodes[p].id.clone());
            }
        }
        for (i, kids) in children.iter().enumerate() {
            nodes[i].children_ids = kids.iter().map(|&c| nodes[c].id.clone()).collect();
        }

        let roots: Vec<usize> = (0..count)
            .filter(|&i| parents[i].is_none())
            .chain(count..nodes.len())
            .collect();
        report.real_roots = count - (0..count).filter(|&i| parents[i].is_some()).count();
        report.synthetic_roots = nodes.len() - count;

        assign_duplicate_groups(&mut nodes[..count], &mut report);

        // Depth top-down, then derived metrics bottom-up over the pre-order
        let mut order = Vec::with_capacity(nodes.len());
        let mut stack: Vec<usize> = roots.iter().rev().copied().collect();
        while let Some(i) = stack.pop() {
            order.push(i);
            for &c in children[i].iter().rev() {
                nodes[c].depth = nodes[i].depth + 1;
                stack.push(c);
            }
        }
        for &i in order.iter().rev() {
            let mut summary = nodes[i].status.map(BranchSummary::of).unwrap_or_default();
            let mut descendants = 0;
            let mut last_seen = nodes[i].metrics.last_seen;
            for &c in &children[i] {
                summary += nodes[c].branch_summary;
                descendants += nodes[c].metrics.descendant_count + 1;
                last_seen = last_seen.max(nodes[c].metrics.last_seen);
            }
            let node = &mut nodes[i];
            node.branch_summary = summary;
            node.metrics = NodeMetrics {
                descendant_count: descendants,
                last_seen,
            };
        }

        report.node_count = nodes.len();
        let root_ids = roots.iter().map(|&r| nodes[r].id.clone()).collect();
        let mut nodes_by_id = NodeMap::with_capacity_and_hasher(nodes.len(), FxBuildHasher);
        for node in nodes {
            nodes_by_id.insert(node.id.clone(), node);
        }

        info!(
            "Built hierarchy: {} records, {} nodes, {} roots ({} synthetic), {} synthetic attachments, {} duplicate groups",
            report.record_count,
            report.node_count,
            report.root_count(),
            report.synthetic_roots,
            report.synthetic_attachments(),
            report.duplicate_groups
        );
        HierarchyGraph::from_parts(nodes_by_id, root_ids, report)
    }
}

fn resolve_links(drafts: &FxIndexMap<String, Draft>) -> Vec<Link> {
    drafts
        .iter()
        .map(|(id, draft)| match draft.upline.as_deref() {
            None => Link::Root,
            Some(upline) if upline == id => Link::SelfReference,
            Some(upline) => match drafts.get_index_of(upline) {
                Some(p) => Link::Parent(p),
                None => Link::Unresolved,
            },
        })
        .collect()
}

/// Cut every parent cycle at its earliest-discovered member
fn break_cycles(links: &mut [Link]) {
    const UNSEEN: u8 = 0;
    const ON_PATH: u8 = 1;
    const DONE: u8 = 2;

    let mut state = vec![UNSEEN; links.len()];
    let mut path = Vec::new();
    for start in 0..links.len() {
        if state[start] != UNSEEN {
            continue;
        }
        path.clear();
        let mut current = Some(start);
        while let Some(i) = current {
            match state[i] {
                UNSEEN => {
                    state[i] = ON_PATH;
                    path.push(i);
                    current = match links[i] {
                        Link::Parent(p) => Some(p),
                        _ => None,
                    };
                }
                ON_PATH => {
                    let entry = path.iter().position(|&n| n == i).unwrap_or(0);
                    if let Some(&cut) = path[entry..].iter().min() {
                        debug!("Breaking upline cycle of {} producers at index {}", path.len() - entry, cut);
                        links[cut] = Link::Cycle;
                    }
                    current = None;
                }
                _ => current = None,
            }
        }
        for &i in &path {
            state[i] = DONE;
        }
    }
}

/// Placeholder root for `firm_id`; its id is unique among `taken_ids`,
/// which it joins
fn synthetic_root(firm_id: &str, taken_ids: &mut FxHashSet<String>) -> HierarchyNode {
    let label = if firm_id.is_empty() { "unknown" } else { firm_id };
    let mut id = format!("{}{}", SYNTHETIC_PREFIX, label);
    let mut suffix = 2;
    while taken_ids.contains(&id) {
        id = format!("{}{}#{}", SYNTHETIC_PREFIX, label, suffix);
        suffix += 1;
    }
    taken_ids.insert(id.clone());
    HierarchyNode {
        id,
        name: format!("Unassigned ({})", label),
        npn: None,
        firm_id: firm_id.to_string(),
        branch_code: None,
        status: None,
        parent_id: None,
        children_ids: Vec::new(),
        depth: 0,
        branch_summary: BranchSummary::default(),
        metrics: NodeMetrics::default(),
        duplicate_group_id: None,
        duplicate_group_size: 0,
        upline_source: UplineSource::Real,
        is_synthetic: true,
        issues: Vec::new(),
    }
}

fn assign_duplicate_groups(nodes: &mut [HierarchyNode], report: &mut BuildReport) {
    let mut by_npn: FxIndexMap<String, Vec<usize>> = FxIndexMap::default();
    for (i, node) in nodes.iter().enumerate() {
        if let Some(npn) = node.npn.as_deref() {
            by_npn.entry(npn.to_string()).or_default().push(i);
        }
    }

    let mut grouped = FxHashSet::default();
    for (npn, members) in by_npn {
        if members.len() < 2 {
            for i in members {
                nodes[i].duplicate_group_size = 1;
            }
            continue;
        }
        let group_id = format!("npn:{}", npn);
        debug!("Duplicate npn {} shared by {} producers", npn, members.len());
        report.duplicate_groups += 1;
        for &i in &members {
            nodes[i].duplicate_group_id = Some(group_id.clone());
            nodes[i].duplicate_group_size = members.len();
            grouped.insert(i);
        }
    }
    report.nodes_in_duplicate_groups = grouped.len();
}
