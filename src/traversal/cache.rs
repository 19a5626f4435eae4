//! Memoised visible sets keyed by graph generation and traversal state

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::debug;

use super::{compute_visible_set, TraversalState, VisibleSet};
use crate::hierarchy::HierarchyGraph;

const DEFAULT_CAPACITY: usize = 32;

/// LRU of recent traversals.
///
/// A rebuilt graph has a new generation, so entries for a replaced graph
/// are never served for the new one.
pub struct VisibleSetCache {
    entries: LruCache<(u64, TraversalState), Arc<VisibleSet>>,
    hits: usize,
    misses: usize,
}

impl VisibleSetCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            hits: 0,
            misses: 0,
        }
    }

    /// Cached visible set for `(graph, state)`, computing it on a miss
    pub fn get_or_compute(&mut self, graph: &HierarchyGraph, state: &TraversalState) -> Arc<VisibleSet> {
        let key = (graph.generation(), state.clone());
        if let Some(set) = self.entries.get(&key) {
            self.hits += 1;
            return Arc::clone(set);
        }

        self.misses += 1;
        let set = Arc::new(compute_visible_set(graph, state));
        debug!(
            "Computed visible set for generation {}: {} nodes, {} edges",
            key.0,
            set.nodes.len(),
            set.edges.len()
        );
        self.entries.put(key, Arc::clone(&set));
        set
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hits(&self) -> usize {
        self.hits
    }

    pub fn misses(&self) -> usize {
        self.misses
    }
}

impl Default for VisibleSetCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
