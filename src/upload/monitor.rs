//! Upload job state machine
//!
//! ```text
//!  Idle --Submit--> Submitted --Accepted--> Polling --Observed(queued|processing)--> Polling
//!                      |                      |--Observed(completed)--> Completed
//!                      |                      |--Observed(failed)-----> Failed
//!                      '--Rejected--> Failed  '--PollFailed-----------> Failed
//! ```

use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{UploadError, UploadFile, UploadJob, UploadJobStatus, UploadResult};
use crate::config::UploadConfig;
use crate::fetch::FetchPipeline;

/// Monitor lifecycle
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorState {
    Idle,
    Submitted,
    Polling { job_id: String, polls: u32 },
    Completed(UploadJob),
    Failed { job_id: Option<String>, reason: String },
}

impl MonitorState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MonitorState::Completed(_) | MonitorState::Failed { .. })
    }
}

impl fmt::Display for MonitorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorState::Idle => write!(f, "idle"),
            MonitorState::Submitted => write!(f, "submitted"),
            MonitorState::Polling { job_id, .. } => write!(f, "polling({})", job_id),
            MonitorState::Completed(job) => write!(f, "completed({})", job.id),
            MonitorState::Failed { .. } => write!(f, "failed"),
        }
    }
}

/// Inputs that drive the state machine
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    Submit,
    Accepted(String),
    Rejected(String),
    Observed(UploadJob),
    PollFailed(String),
}

impl fmt::Display for MonitorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorEvent::Submit => write!(f, "submit"),
            MonitorEvent::Accepted(id) => write!(f, "accepted({})", id),
            MonitorEvent::Rejected(_) => write!(f, "rejected"),
            MonitorEvent::Observed(job) => write!(f, "observed({:?})", job.status),
            MonitorEvent::PollFailed(_) => write!(f, "poll-failed"),
        }
    }
}

/// Transition table
pub fn transition(state: &MonitorState, event: MonitorEvent) -> UploadResult<MonitorState> {
    let next = match (state, event) {
        (MonitorState::Idle, MonitorEvent::Submit) => MonitorState::Submitted,
        (MonitorState::Submitted, MonitorEvent::Accepted(job_id)) => MonitorState::Polling { job_id, polls: 0 },
        (MonitorState::Submitted, MonitorEvent::Rejected(reason)) => MonitorState::Failed { job_id: None, reason },
        (MonitorState::Polling { job_id, polls }, MonitorEvent::Observed(job)) => match job.status {
            UploadJobStatus::Completed => MonitorState::Completed(job),
            UploadJobStatus::Failed => MonitorState::Failed {
                job_id: Some(job.id),
                reason: "job reported failure".to_string(),
            },
            UploadJobStatus::Queued | UploadJobStatus::Processing => MonitorState::Polling {
                job_id: job_id.clone(),
                polls: polls + 1,
            },
        },
        (MonitorState::Polling { job_id, .. }, MonitorEvent::PollFailed(reason)) => MonitorState::Failed {
            job_id: Some(job_id.clone()),
            reason,
        },
        (state, event) => {
            return Err(UploadError::InvalidTransition {
                state: state.to_string(),
                event: event.to_string(),
            })
        }
    };
    Ok(next)
}

/// Submits one file and follows its job to a terminal state.
///
/// Poll failures are fatal to the monitor; there is no retry and no
/// cancellation of a running poll loop.
pub struct UploadJobMonitor {
    pipeline: Arc<FetchPipeline>,
    config: UploadConfig,
    state: MonitorState,
}

impl UploadJobMonitor {
    pub fn new(pipeline: Arc<FetchPipeline>) -> Self {
        let config = pipeline.config().upload.clone();
        Self {
            pipeline,
            config,
            state: MonitorState::Idle,
        }
    }

    pub fn state(&self) -> &MonitorState {
        &self.state
    }

    fn apply(&mut self, event: MonitorEvent) -> UploadResult<()> {
        let next = transition(&self.state, event)?;
        if next != self.state {
            info!("Upload monitor: {} -> {}", self.state, next);
        }
        self.state = next;
        Ok(())
    }

    /// Validate and post the file; on acceptance the monitor is `Polling`
    pub async fn submit(&mut self, file: &UploadFile) -> UploadResult<String> {
        // Validation happens before any state change or request
        file.validate(&self.config)?;
        self.apply(MonitorEvent::Submit)?;

        let body = match self.pipeline.post_file(&self.config.submit_path, file).await {
            Ok(body) => body,
            Err(e) => {
                self.apply(MonitorEvent::Rejected(e.to_string()))?;
                return Err(e.into());
            }
        };

        let job_id = match job_id_of(&body) {
            Some(id) => id,
            None => {
                let reason = format!("submission response carries no job id: {}", body);
                self.apply(MonitorEvent::Rejected(reason.clone()))?;
                return Err(UploadError::UnexpectedResponse(reason));
            }
        };

        self.apply(MonitorEvent::Accepted(job_id.clone()))?;
        Ok(job_id)
    }

    /// Poll every `poll_interval` until the job is terminal
    pub async fn poll(
        &mut self,
        mut on_progress: Option<&mut (dyn FnMut(&UploadJob) + Send)>,
    ) -> UploadResult<UploadJob> {
        let job_id = match &self.state {
            MonitorState::Polling { job_id, .. } => job_id.clone(),
            other => {
                return Err(UploadError::InvalidTransition {
                    state: other.to_string(),
                    event: "poll".to_string(),
                })
            }
        };

        let period = self.config.poll_interval();
        let path = self.config.status_path_for(&job_id);
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            debug!("Polling upload job {}", job_id);

            let body = match self.pipeline.get_json_uncached(&path).await {
                Ok(body) => body,
                Err(e) => {
                    self.apply(MonitorEvent::PollFailed(e.to_string()))?;
                    return Err(e.into());
                }
            };

            let job = self.job_from(&job_id, body);
            if let Some(callback) = on_progress.as_mut() {
                callback(&job);
            }

            self.apply(MonitorEvent::Observed(job.clone()))?;
            match job.status {
                UploadJobStatus::Completed => return Ok(job),
                UploadJobStatus::Failed => {
                    return Err(UploadError::JobFailed {
                        job_id: job.id,
                        progress: job.progress,
                    })
                }
                UploadJobStatus::Queued | UploadJobStatus::Processing => {}
            }
        }
    }

    /// Submit then poll to completion
    pub async fn run(
        &mut self,
        file: &UploadFile,
        on_progress: Option<&mut (dyn FnMut(&UploadJob) + Send)>,
    ) -> UploadResult<UploadJob> {
        self.submit(file).await?;
        self.poll(on_progress).await
    }

    fn job_from(&self, job_id: &str, body: Value) -> UploadJob {
        let raw_status = body
            .get("status")
            .or_else(|| body.get("state"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        let status = UploadJobStatus::parse(raw_status).unwrap_or_else(|| {
            warn!("Unknown status {:?} for job {}; still processing", raw_status, job_id);
            UploadJobStatus::Processing
        });

        UploadJob {
            id: job_id.to_string(),
            status,
            progress: body,
            poll_interval: self.config.poll_interval(),
        }
    }
}

fn job_id_of(body: &Value) -> Option<String> {
    ["id", "jobId", "job_id"].iter().find_map(|key| match body.get(*key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::fetch::testing::{pipeline_with, ScriptedTransport};
    use crate::fetch::FetchError;
    use crate::transport::TransportResponse;
    use std::time::Duration;

    fn csv() -> UploadFile {
        UploadFile::new("roster.csv", "text/csv", b"npn,name\n1,A\n".to_vec())
    }

    fn monitor_with(transport: &Arc<ScriptedTransport>) -> UploadJobMonitor {
        let mut config = EngineConfig::default();
        config.upload.poll_interval_ms = 1_000;
        config.min_interval_ms = 0;
        UploadJobMonitor::new(Arc::new(pipeline_with(Arc::clone(transport), config)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_until_completed() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond("/uploads", TransportResponse::new(202, r#"{"jobId":"j1","status":"queued"}"#));
        transport.enqueue("/uploads/j1", TransportResponse::ok(r#"{"status":"queued"}"#));
        transport.enqueue("/uploads/j1", TransportResponse::ok(r#"{"status":"processing","processed":40}"#));
        transport.enqueue("/uploads/j1", TransportResponse::ok(r#"{"status":"completed","processed":100}"#));

        let mut monitor = monitor_with(&transport);
        let start = Instant::now();
        let mut seen = Vec::new();
        let mut record = |job: &UploadJob| seen.push(job.status);
        let job = monitor.run(&csv(), Some(&mut record)).await.unwrap();

        assert_eq!(job.status, UploadJobStatus::Completed);
        assert_eq!(job.progress["processed"], 100);
        assert_eq!(
            seen,
            vec![UploadJobStatus::Queued, UploadJobStatus::Processing, UploadJobStatus::Completed]
        );
        assert_eq!(start.elapsed(), Duration::from_secs(3));
        assert!(matches!(monitor.state(), MonitorState::Completed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_job() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond("/uploads", TransportResponse::ok(r#"{"id":7}"#));
        transport.respond("/uploads/7", TransportResponse::ok(r#"{"status":"failed","errors":["bad row 3"]}"#));

        let mut monitor = monitor_with(&transport);
        let err = monitor.run(&csv(), None).await.unwrap_err();
        match err {
            UploadError::JobFailed { job_id, progress } => {
                assert_eq!(job_id, "7");
                assert_eq!(progress["errors"][0], "bad row 3");
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(monitor.state().is_terminal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_failure_sends_nothing() {
        let transport = Arc::new(ScriptedTransport::new());
        let mut monitor = monitor_with(&transport);
        let empty = UploadFile::new("roster.csv", "text/csv", Vec::new());

        let err = monitor.submit(&empty).await.unwrap_err();
        assert!(matches!(err, UploadError::Validation(_)));
        assert_eq!(transport.request_count(), 0);
        assert_eq!(monitor.state(), &MonitorState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_failure_is_fatal() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond("/uploads", TransportResponse::ok(r#"{"id":"j2"}"#));
        transport.enqueue("/uploads/j2", TransportResponse::ok(r#"{"status":"processing"}"#));
        transport.enqueue("/uploads/j2", TransportResponse::new(502, "bad gateway"));

        let mut monitor = monitor_with(&transport);
        let err = monitor.run(&csv(), None).await.unwrap_err();
        assert_eq!(
            err,
            UploadError::Fetch(FetchError::Transport { status: 502, body: "bad gateway".to_string() })
        );
        assert!(matches!(monitor.state(), MonitorState::Failed { job_id: Some(id), .. } if id == "j2"));
        // submit + two polls, no retry
        assert_eq!(transport.request_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_submission() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond("/uploads", TransportResponse::new(413, "too large"));
        let mut monitor = monitor_with(&transport);

        let err = monitor.submit(&csv()).await.unwrap_err();
        assert!(matches!(err, UploadError::Fetch(FetchError::Transport { status: 413, .. })));
        assert!(matches!(monitor.state(), MonitorState::Failed { job_id: None, .. }));
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(transition(&MonitorState::Idle, MonitorEvent::Accepted("x".into())).is_err());
        assert!(transition(&MonitorState::Submitted, MonitorEvent::Submit).is_err());
        let done = MonitorState::Failed { job_id: None, reason: "x".into() };
        assert!(transition(&done, MonitorEvent::Submit).is_err());
    }

    #[tokio::test]
    async fn test_poll_before_submit() {
        let transport = Arc::new(ScriptedTransport::new());
        let mut monitor = monitor_with(&transport);
        assert!(matches!(
            monitor.poll(None).await,
            Err(UploadError::InvalidTransition { .. })
        ));
    }
}
