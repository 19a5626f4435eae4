//! Bulk upload submission and server-side job tracking

pub mod monitor;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::config::UploadConfig;
use crate::fetch::FetchError;

pub use monitor::{MonitorEvent, MonitorState, UploadJobMonitor};

/// File rejected before any request was sent
#[derive(Error, Debug, Clone, PartialEq)]
pub enum UploadValidationError {
    #[error("File {0} is empty")]
    Empty(String),

    #[error("File {name} is {size} bytes; the limit is {max}")]
    TooLarge { name: String, size: usize, max: usize },

    #[error("File {name} has unsupported type {kind}")]
    UnsupportedType { name: String, kind: String },
}

/// Upload errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum UploadError {
    #[error("Validation failed: {0}")]
    Validation(#[from] UploadValidationError),

    #[error("Request failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("Job {job_id} failed")]
    JobFailed {
        job_id: String,
        progress: serde_json::Value,
    },

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("Invalid transition: {event} while {state}")]
    InvalidTransition { state: String, event: String },
}

pub type UploadResult<T> = Result<T, UploadError>;

/// A file queued for multipart upload
#[derive(Debug, Clone)]
pub struct UploadFile {
    name: String,
    content_type: String,
    contents: Bytes,
}

impl UploadFile {
    pub fn new(name: impl Into<String>, content_type: impl Into<String>, contents: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
            contents: contents.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn contents(&self) -> &Bytes {
        &self.contents
    }

    pub fn len(&self) -> usize {
        self.contents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contents.is_empty()
    }

    fn extension(&self) -> Option<String> {
        self.name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
    }

    /// Check emptiness, size ceiling and type
    pub fn validate(&self, config: &UploadConfig) -> Result<(), UploadValidationError> {
        if self.is_empty() {
            return Err(UploadValidationError::Empty(self.name.clone()));
        }
        if self.len() > config.max_bytes {
            return Err(UploadValidationError::TooLarge {
                name: self.name.clone(),
                size: self.len(),
                max: config.max_bytes,
            });
        }

        let ext_ok = self
            .extension()
            .map(|ext| config.allowed_extensions.iter().any(|a| a.eq_ignore_ascii_case(&ext)))
            .unwrap_or(false);
        if !ext_ok {
            return Err(UploadValidationError::UnsupportedType {
                name: self.name.clone(),
                kind: self.extension().unwrap_or_else(|| "<none>".to_string()),
            });
        }

        let mime_ok = match self.content_type.parse::<mime::Mime>() {
            Ok(m) => {
                m.type_() == mime::TEXT
                    || (m.type_() == mime::APPLICATION
                        && (m.subtype() == mime::OCTET_STREAM || m.subtype() == "vnd.ms-excel"))
            }
            Err(_) => false,
        };
        if !mime_ok {
            return Err(UploadValidationError::UnsupportedType {
                name: self.name.clone(),
                kind: self.content_type.clone(),
            });
        }
        Ok(())
    }
}

/// Server-side job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadJobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl UploadJobStatus {
    /// Lenient parse; unknown strings are `None`
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queued" | "pending" | "submitted" => Some(Self::Queued),
            "processing" | "in_progress" | "running" => Some(Self::Processing),
            "completed" | "complete" | "done" | "success" | "succeeded" => Some(Self::Completed),
            "failed" | "error" | "errored" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A long-running upload job as last observed
#[derive(Debug, Clone, PartialEq)]
pub struct UploadJob {
    pub id: String,
    pub status: UploadJobStatus,
    /// Raw status payload; opaque to the engine
    pub progress: serde_json::Value,
    pub poll_interval: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> UploadConfig {
        UploadConfig::default()
    }

    #[test]
    fn test_valid_csv() {
        let file = UploadFile::new("Roster.CSV", "text/csv", b"a,b\n".to_vec());
        assert!(file.validate(&config()).is_ok());
    }

    #[test]
    fn test_empty_file_rejected() {
        let file = UploadFile::new("roster.csv", "text/csv", Vec::new());
        assert_eq!(
            file.validate(&config()),
            Err(UploadValidationError::Empty("roster.csv".to_string()))
        );
    }

    #[test]
    fn test_size_ceiling() {
        let max = config().max_bytes;
        let file = UploadFile::new("big.csv", "text/csv", vec![b'x'; max + 1]);
        assert!(matches!(
            file.validate(&config()),
            Err(UploadValidationError::TooLarge { size, .. }) if size == max + 1
        ));
        let at_limit = UploadFile::new("big.csv", "text/csv", vec![b'x'; max]);
        assert!(at_limit.validate(&config()).is_ok());
    }

    #[test]
    fn test_unsupported_types() {
        let pdf = UploadFile::new("roster.pdf", "application/pdf", b"%PDF".to_vec());
        assert!(matches!(pdf.validate(&config()), Err(UploadValidationError::UnsupportedType { .. })));

        let disguised = UploadFile::new("roster.csv", "image/png", b"\x89PNG".to_vec());
        assert!(matches!(disguised.validate(&config()), Err(UploadValidationError::UnsupportedType { .. })));

        let excel_csv = UploadFile::new("roster.csv", "application/vnd.ms-excel", b"a".to_vec());
        assert!(excel_csv.validate(&config()).is_ok());
    }

    #[test]
    fn test_status_parse() {
        assert_eq!(UploadJobStatus::parse("IN_PROGRESS"), Some(UploadJobStatus::Processing));
        assert_eq!(UploadJobStatus::parse("done"), Some(UploadJobStatus::Completed));
        assert_eq!(UploadJobStatus::parse("weird"), None);
        assert!(UploadJobStatus::Failed.is_terminal());
        assert!(!UploadJobStatus::Queued.is_terminal());
    }
}
