//! Debounced hand-off of visible sets to an external layout engine
//!
//! Layout is expensive, so a burst of visible-set changes results in one
//! layout pass for the last of them. A new request during the quiet period
//! cancels the pending one and restarts the timer. A failed pass keeps the
//! previously published positions.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::VisibleSet;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LayoutError {
    #[error("Layout failed: {0}")]
    Failed(String),

    #[error("Layout engine unavailable: {0}")]
    Unavailable(String),
}

pub type LayoutResult<T> = Result<T, LayoutError>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NodePosition {
    pub x: f64,
    pub y: f64,
}

/// Node id -> position
pub type LayoutPositions = HashMap<String, NodePosition>;

/// Downstream layout collaborator
#[async_trait]
pub trait LayoutEngine: Send + Sync {
    async fn layout(&self, visible: &VisibleSet) -> LayoutResult<LayoutPositions>;
}

struct Shared {
    ticket: AtomicU64,
    positions: watch::Sender<Arc<LayoutPositions>>,
    completed: AtomicUsize,
    failures: AtomicUsize,
}

struct Pending {
    ticket: u64,
    set: Arc<VisibleSet>,
    started: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Debounced, cancellable layout scheduling.
///
/// [`schedule`](Self::schedule) spawns onto the current Tokio runtime.
pub struct LayoutScheduler {
    engine: Arc<dyn LayoutEngine>,
    debounce: Duration,
    shared: Arc<Shared>,
    pending: Option<Pending>,
}

impl LayoutScheduler {
    pub fn new(engine: Arc<dyn LayoutEngine>, debounce: Duration) -> Self {
        let (positions, _) = watch::channel(Arc::new(LayoutPositions::new()));
        Self {
            engine,
            debounce,
            shared: Arc::new(Shared {
                ticket: AtomicU64::new(0),
                positions,
                completed: AtomicUsize::new(0),
                failures: AtomicUsize::new(0),
            }),
            pending: None,
        }
    }

    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    /// Request a layout of `set` once the quiet period passes
    pub fn schedule(&mut self, set: Arc<VisibleSet>) {
        let ticket = self.shared.ticket.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(previous) = self.pending.take() {
            // A pass already running is left alone; its ticket is stale now
            if !previous.started.load(Ordering::SeqCst) {
                debug!("Cancelling pending layout request {}", previous.ticket);
                previous.handle.abort();
            }
        }

        let started = Arc::new(AtomicBool::new(false));
        let handle = {
            let engine = Arc::clone(&self.engine);
            let shared = Arc::clone(&self.shared);
            let started = Arc::clone(&started);
            let set = Arc::clone(&set);
            let debounce = self.debounce;
            tokio::spawn(async move {
                tokio::time::sleep(debounce).await;
                started.store(true, Ordering::SeqCst);
                run_layout(&shared, engine.as_ref(), &set, ticket).await;
            })
        };

        self.pending = Some(Pending {
            ticket,
            set,
            started,
            handle,
        });
    }

    /// Run the pending request now instead of waiting out the quiet period,
    /// or wait for a pass already in progress.
    pub async fn flush(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        if pending.started.load(Ordering::SeqCst) {
            if let Err(e) = pending.handle.await {
                warn!("Layout task {} ended abnormally: {}", pending.ticket, e);
            }
        } else {
            pending.handle.abort();
            run_layout(&self.shared, self.engine.as_ref(), &pending.set, pending.ticket).await;
        }
    }

    /// Last successfully computed positions
    pub fn positions(&self) -> Arc<LayoutPositions> {
        Arc::clone(&self.shared.positions.borrow())
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<LayoutPositions>> {
        self.shared.positions.subscribe()
    }

    pub fn completed(&self) -> usize {
        self.shared.completed.load(Ordering::SeqCst)
    }

    pub fn failures(&self) -> usize {
        self.shared.failures.load(Ordering::SeqCst)
    }
}

impl Drop for LayoutScheduler {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.handle.abort();
        }
    }
}

async fn run_layout(shared: &Shared, engine: &dyn LayoutEngine, set: &VisibleSet, ticket: u64) {
    if shared.ticket.load(Ordering::SeqCst) != ticket {
        return;
    }
    match engine.layout(set).await {
        Ok(positions) => {
            if shared.ticket.load(Ordering::SeqCst) != ticket {
                debug!("Discarding layout {}; a newer request superseded it", ticket);
                return;
            }
            debug!("Layout {} placed {} nodes", ticket, positions.len());
            shared.positions.send_replace(Arc::new(positions));
            shared.completed.fetch_add(1, Ordering::SeqCst);
        }
        Err(e) => {
            shared.failures.fetch_add(1, Ordering::SeqCst);
            warn!("Layout {} failed, keeping previous positions: {}", ticket, e);
        }
    }
}
