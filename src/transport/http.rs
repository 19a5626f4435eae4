//! reqwest-backed transport

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use super::{Credential, Transport, TransportError, TransportResponse, TransportResult};
use crate::upload::UploadFile;

/// Transport that talks to the relationship service over HTTP
pub struct HttpTransport {
    base_url: String,
    client: Client,
}

impl HttpTransport {
    /// Create a transport rooted at `base_url` with a per-request timeout
    pub fn new(base_url: &str, timeout: Duration) -> TransportResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    async fn into_response(resp: reqwest::Response) -> TransportResult<TransportResponse> {
        let status = resp.status().as_u16();
        let body = resp.text().await.map_err(map_reqwest_error)?;
        Ok(TransportResponse { status, body })
    }
}

fn map_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(e.to_string())
    } else if e.is_builder() {
        TransportError::InvalidRequest(e.to_string())
    } else {
        TransportError::Network(e.to_string())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, path: &str, credential: &Credential) -> TransportResult<TransportResponse> {
        let url = self.url(path);
        debug!("GET {}", url);

        let resp = self
            .client
            .get(&url)
            .header("Authorization", credential.bearer())
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(map_reqwest_error)?;

        Self::into_response(resp).await
    }

    async fn post_multipart(
        &self,
        path: &str,
        credential: &Credential,
        file: &UploadFile,
    ) -> TransportResult<TransportResponse> {
        let url = self.url(path);
        debug!("POST {} ({} bytes)", url, file.len());

        let part = Part::bytes(file.contents().to_vec())
            .file_name(file.name().to_string())
            .mime_str(file.content_type())
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
        let form = Form::new().part("file", part);

        let resp = self
            .client
            .post(&url)
            .header("Authorization", credential.bearer())
            .multipart(form)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        Self::into_response(resp).await
    }
}
