//! End-to-end synchronization: fetch relation pages, rebuild, publish
//!
//! The published graph is replaced wholesale on every successful sync.
//! Subscribers (views, the CLI) receive the new `Arc<HierarchyGraph>`
//! through a watch channel; a failed sync leaves the current graph in place.

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

use crate::fetch::paginated::encode;
use crate::fetch::{FanOutFetcher, FanOutResult, FetchPipeline, FetchResult, PaginatedFetcher, RelationQuery};
use crate::hierarchy::{HierarchyGraph, HierarchyGraphBuilder, RelationRecord};

/// Drives fetch -> build -> publish for one account
pub struct HierarchySync {
    pipeline: Arc<FetchPipeline>,
    pages: PaginatedFetcher,
    fan_out: FanOutFetcher,
    builder: HierarchyGraphBuilder,
    current: watch::Sender<Arc<HierarchyGraph>>,
}

impl HierarchySync {
    pub fn new(pipeline: Arc<FetchPipeline>) -> Self {
        let (current, _) = watch::channel(Arc::new(HierarchyGraph::empty()));
        Self {
            pages: PaginatedFetcher::new(Arc::clone(&pipeline)),
            fan_out: FanOutFetcher::new(pipeline.config().min_interval()),
            builder: HierarchyGraphBuilder::new(),
            pipeline,
            current,
        }
    }

    pub fn pipeline(&self) -> &Arc<FetchPipeline> {
        &self.pipeline
    }

    /// Most recently published graph; empty before the first sync
    pub fn current(&self) -> Arc<HierarchyGraph> {
        Arc::clone(&self.current.borrow())
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<HierarchyGraph>> {
        self.current.subscribe()
    }

    /// Fetch every relation for `query`, rebuild and publish
    pub async fn sync(&self, query: &RelationQuery) -> FetchResult<Arc<HierarchyGraph>> {
        let path = query.to_path();
        let records: Vec<RelationRecord> = match self
            .pages
            .fetch_all(&path, self.pipeline.config().page_size)
            .await
        {
            Ok(records) => records,
            Err(e) => {
                error!("Sync of firm {} failed; keeping current graph: {}", query.firm_id, e);
                return Err(e);
            }
        };

        let graph = Arc::new(self.builder.build(&records));
        info!(
            "Synchronized firm {}: {} records -> {} nodes (generation {})",
            query.firm_id,
            records.len(),
            graph.len(),
            graph.generation()
        );
        self.current.send_replace(Arc::clone(&graph));
        Ok(graph)
    }

    /// Forced refresh: drop cached pages, then sync
    pub async fn refresh(&self, query: &RelationQuery) -> FetchResult<Arc<HierarchyGraph>> {
        self.pipeline.clear_cache().await;
        self.sync(query).await
    }

    /// Producer detail for each id; failures are per id
    pub async fn enrich<I>(&self, ids: I) -> FanOutResult<String, Value>
    where
        I: IntoIterator<Item = String>,
    {
        let pipeline = &self.pipeline;
        self.fan_out
            .fetch_many(ids, move |id| async move {
                pipeline.get_json(&producer_detail_path(&id)).await
            })
            .await
    }

    /// [`enrich`](Self::enrich) alongside a bulk text export at `roster_path`
    pub async fn enrich_with_roster<I>(
        &self,
        ids: I,
        roster_path: &str,
    ) -> (FanOutResult<String, Value>, FetchResult<Arc<str>>)
    where
        I: IntoIterator<Item = String>,
    {
        let pipeline = &self.pipeline;
        self.fan_out
            .fetch_many_with_side_channel(
                ids,
                move |id| async move { pipeline.get_json(&producer_detail_path(&id)).await },
                pipeline.get_text(roster_path),
            )
            .await
    }
}

fn producer_detail_path(id: &str) -> String {
    format!("/producers/{}", encode(id))
}
