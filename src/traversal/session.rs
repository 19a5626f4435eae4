//! UI-state owner for an interactive hierarchy view
//!
//! Every gesture updates the [`TraversalState`], recomputes the visible set
//! (memoised) and hands it to the layout scheduler when one is attached.

use std::sync::Arc;
use tracing::debug;

use super::cache::VisibleSetCache;
use super::layout::LayoutScheduler;
use super::{child_window, TraversalState, VisibleSet};
use crate::hierarchy::HierarchyGraph;

pub struct HierarchyView {
    graph: Arc<HierarchyGraph>,
    state: TraversalState,
    cache: VisibleSetCache,
    scheduler: Option<LayoutScheduler>,
    visible: Arc<VisibleSet>,
}

impl HierarchyView {
    pub fn new(graph: Arc<HierarchyGraph>) -> Self {
        Self::with_state(graph, TraversalState::default())
    }

    pub fn with_state(graph: Arc<HierarchyGraph>, state: TraversalState) -> Self {
        let mut cache = VisibleSetCache::default();
        let visible = cache.get_or_compute(&graph, &state);
        Self {
            graph,
            state,
            cache,
            scheduler: None,
            visible,
        }
    }

    /// Forward every recomputed visible set to `scheduler`
    pub fn with_layout(mut self, mut scheduler: LayoutScheduler) -> Self {
        scheduler.schedule(Arc::clone(&self.visible));
        self.scheduler = Some(scheduler);
        self
    }

    pub fn graph(&self) -> &Arc<HierarchyGraph> {
        &self.graph
    }

    pub fn state(&self) -> &TraversalState {
        &self.state
    }

    pub fn visible(&self) -> Arc<VisibleSet> {
        Arc::clone(&self.visible)
    }

    pub fn layout(&self) -> Option<&LayoutScheduler> {
        self.scheduler.as_ref()
    }

    pub fn layout_mut(&mut self) -> Option<&mut LayoutScheduler> {
        self.scheduler.as_mut()
    }

    fn refresh(&mut self) -> Arc<VisibleSet> {
        let visible = self.cache.get_or_compute(&self.graph, &self.state);
        if !Arc::ptr_eq(&visible, &self.visible) {
            if let Some(scheduler) = self.scheduler.as_mut() {
                scheduler.schedule(Arc::clone(&visible));
            }
            self.visible = Arc::clone(&visible);
        }
        visible
    }

    pub fn toggle_expanded(&mut self, id: &str) -> Arc<VisibleSet> {
        if !self.state.expanded_ids.remove(id) && self.graph.contains(id) {
            self.state.expanded_ids.insert(id.to_string());
        }
        self.refresh()
    }

    pub fn expand(&mut self, id: &str) -> Arc<VisibleSet> {
        if self.graph.contains(id) {
            self.state.expanded_ids.insert(id.to_string());
        }
        self.refresh()
    }

    pub fn collapse(&mut self, id: &str) -> Arc<VisibleSet> {
        self.state.expanded_ids.remove(id);
        self.refresh()
    }

    /// Expand every node with children above `depth`, counted from the
    /// current scope (or the roots)
    pub fn expand_to_depth(&mut self, depth: usize) -> Arc<VisibleSet> {
        let starts: Vec<String> = match self.state.scope_root_id.as_deref() {
            Some(scope) if self.graph.contains(scope) => vec![scope.to_string()],
            _ => self.graph.root_ids().to_vec(),
        };

        let mut stack: Vec<(&str, usize)> = starts
            .iter()
            .filter_map(|id| self.graph.get(id))
            .map(|n| (n.id.as_str(), 0))
            .collect();
        let mut expanded = Vec::new();
        while let Some((id, d)) = stack.pop() {
            let Some(node) = self.graph.get(id) else { continue };
            if d >= depth || !node.has_children() {
                continue;
            }
            expanded.push(node.id.clone());
            stack.extend(node.children_ids.iter().map(|c| (c.as_str(), d + 1)));
        }
        debug!("Expanding {} nodes to depth {}", expanded.len(), depth);
        self.state.expanded_ids.extend(expanded);
        self.refresh()
    }

    pub fn collapse_all(&mut self) -> Arc<VisibleSet> {
        self.state.expanded_ids.clear();
        self.state.per_node_page.clear();
        self.refresh()
    }

    /// Restrict the view to the subtree under `id`; unknown ids fall back to
    /// the full forest
    pub fn set_scope(&mut self, id: &str) -> Arc<VisibleSet> {
        self.state.scope_root_id = Some(id.to_string());
        self.refresh()
    }

    pub fn clear_scope(&mut self) -> Arc<VisibleSet> {
        self.state.scope_root_id = None;
        self.refresh()
    }

    pub fn set_depth_limit(&mut self, limit: Option<usize>) -> Arc<VisibleSet> {
        self.state.depth_limit = limit;
        self.refresh()
    }

    /// Page of `id`'s children, clamped to the valid range
    pub fn set_child_page(&mut self, id: &str, page: usize) -> Arc<VisibleSet> {
        let page = self.clamp_page(id, page);
        self.state.per_node_page.insert(id.to_string(), page);
        self.refresh()
    }

    pub fn next_child_page(&mut self, id: &str) -> Arc<VisibleSet> {
        let current = self.current_page(id);
        self.set_child_page(id, current + 1)
    }

    pub fn prev_child_page(&mut self, id: &str) -> Arc<VisibleSet> {
        let current = self.current_page(id);
        self.set_child_page(id, current.saturating_sub(1))
    }

    /// Global page used by nodes without their own page
    pub fn set_global_child_page(&mut self, page: usize) -> Arc<VisibleSet> {
        self.state.child_page_index = page;
        self.refresh()
    }

    pub fn set_show_all_children(&mut self, show_all: bool) -> Arc<VisibleSet> {
        self.state.show_all_children = show_all;
        self.refresh()
    }

    pub fn set_children_page_size(&mut self, size: usize) -> Arc<VisibleSet> {
        self.state.children_page_size = size.max(1);
        self.state.per_node_page.clear();
        self.refresh()
    }

    pub fn set_hovered(&mut self, id: Option<&str>) -> Arc<VisibleSet> {
        self.state.hovered_id = id.map(str::to_string);
        self.refresh()
    }

    /// Highlight the root path of `id`, expand its ancestors and move each
    /// ancestor's child page so `id` is on screen
    pub fn focus_on(&mut self, id: &str) -> Arc<VisibleSet> {
        let path = self.graph.path_to_root(id);
        if path.is_empty() {
            return self.refresh();
        }

        for pair in path.windows(2) {
            let (parent, child) = (&pair[0], &pair[1]);
            self.state.expanded_ids.insert(parent.clone());
            if let Some(index) = self
                .graph
                .get(parent)
                .and_then(|p| p.children_ids.iter().position(|c| c == child))
            {
                let page = index / self.state.children_page_size.max(1);
                self.state.per_node_page.insert(parent.clone(), page);
            }
        }
        self.state.highlighted_path = path;
        self.state.focus_lens = true;
        self.refresh()
    }

    pub fn clear_focus(&mut self) -> Arc<VisibleSet> {
        self.state.highlighted_path.clear();
        self.state.focus_lens = false;
        self.refresh()
    }

    /// Swap in a rebuilt graph, dropping state that no longer resolves
    pub fn replace_graph(&mut self, graph: Arc<HierarchyGraph>) -> Arc<VisibleSet> {
        let state = &mut self.state;
        state.expanded_ids.retain(|id| graph.contains(id));
        state.per_node_page.retain(|id, _| graph.contains(id));
        state.highlighted_path.retain(|id| graph.contains(id));
        if state.hovered_id.as_deref().is_some_and(|id| !graph.contains(id)) {
            state.hovered_id = None;
        }
        if state.scope_root_id.as_deref().is_some_and(|id| !graph.contains(id)) {
            state.scope_root_id = None;
        }
        debug!(
            "Replacing graph generation {} with {}",
            self.graph.generation(),
            graph.generation()
        );
        self.graph = graph;
        self.cache.clear();
        self.refresh()
    }

    fn current_page(&self, id: &str) -> usize {
        let total = self.graph.get(id).map(|n| n.children_ids.len()).unwrap_or(0);
        child_window(total, id, &self.state).page
    }

    fn clamp_page(&self, id: &str, page: usize) -> usize {
        let total = self.graph.get(id).map(|n| n.children_ids.len()).unwrap_or(0);
        let size = self.state.children_page_size.max(1);
        page.min(total.div_ceil(size).saturating_sub(1))
    }
}
