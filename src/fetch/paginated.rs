//! Offset-paginated retrieval of unbounded record sets

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::{FetchError, FetchPipeline, FetchResult};
use crate::hierarchy::RelationStatus;

/// Characters left alone inside a query value
const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Keys under which a page object may carry its record array
const PAGE_ARRAY_KEYS: [&str; 4] = ["data", "items", "records", "results"];

/// Walks `path` page by page through the pipeline until a short page arrives
pub struct PaginatedFetcher {
    pipeline: Arc<FetchPipeline>,
}

impl PaginatedFetcher {
    pub fn new(pipeline: Arc<FetchPipeline>) -> Self {
        Self { pipeline }
    }

    /// Fetch every record under `path`.
    ///
    /// Pages are requested at offsets `0, page_size, 2 * page_size, ...` and
    /// appended in that order. A page holding fewer than `page_size` records
    /// (zero included) ends the walk. Any failed page aborts the whole walk and
    /// reports its offset; records gathered so far are dropped.
    pub async fn fetch_all<R>(&self, path: &str, page_size: usize) -> FetchResult<Vec<R>>
    where
        R: DeserializeOwned,
    {
        let page_size = page_size.max(1);
        let mut offset = 0;
        let mut records = Vec::new();

        loop {
            let page_path = with_paging(path, offset, page_size);
            let page = match self.fetch_page::<R>(&page_path).await {
                Ok(page) => page,
                Err(e) => {
                    error!("Aborting pagination of {} at offset {}: {}", path, offset, e);
                    return Err(FetchError::Page {
                        offset,
                        source: Box::new(e),
                    });
                }
            };

            let count = page.len();
            debug!("Page at offset {} returned {} records", offset, count);
            records.extend(page);

            if count < page_size {
                break;
            }
            offset += page_size;
        }

        info!("Fetched {} records from {}", records.len(), path);
        Ok(records)
    }

    async fn fetch_page<R: DeserializeOwned>(&self, page_path: &str) -> FetchResult<Vec<R>> {
        let body = self.pipeline.get_json(page_path).await?;
        let decoded = page_items(body).and_then(|items| {
            items
                .into_iter()
                .map(|item| serde_json::from_value(item).map_err(FetchError::from))
                .collect()
        });
        if decoded.is_err() {
            // A page we could not use must not be served again from cache
            self.pipeline.invalidate(page_path).await;
        }
        decoded
    }
}

/// Extract the record array of one page body
fn page_items(body: Value) -> FetchResult<Vec<Value>> {
    match body {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => {
            for key in PAGE_ARRAY_KEYS {
                if let Some(Value::Array(items)) = map.remove(key) {
                    return Ok(items);
                }
            }
            Err(FetchError::Decode("page object carries no record array".to_string()))
        }
        other => Err(FetchError::Decode(format!("unexpected page payload: {}", other))),
    }
}

/// Append `offset`/`limit` query parameters to a path
pub fn with_paging(path: &str, offset: usize, limit: usize) -> String {
    let sep = if path.contains('?') { '&' } else { '?' };
    format!("{}{}offset={}&limit={}", path, sep, offset, limit)
}

/// Canonicalise a user supplied date or timestamp to RFC 3339 UTC with
/// millisecond precision. Unparseable input is cleaned up best-effort and
/// returned rather than rejected.
pub fn normalize_timestamp(input: &str) -> String {
    let trimmed = input.trim();
    match parse_timestamp(trimmed) {
        Some(ts) => ts.to_rfc3339_opts(SecondsFormat::Millis, true),
        None => {
            warn!("Could not parse timestamp {:?}; passing it through", input);
            let mut cleaned = trimmed.replacen(' ', "T", 1);
            let has_zone = cleaned.ends_with('Z')
                || cleaned
                    .rfind(|c| c == '+' || c == '-')
                    .map(|i| i > 10)
                    .unwrap_or(false);
            if !cleaned.is_empty() && !has_zone {
                cleaned.push('Z');
            }
            cleaned
        }
    }
}

pub(crate) fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    for fmt in ["%Y-%m-%d", "%m/%d/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(s, fmt) {
            return date.and_hms_opt(0, 0, 0).map(|naive| Utc.from_utc_datetime(&naive));
        }
    }
    if !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()) {
        // Compact YYYYMMDD before epoch seconds
        if s.len() == 8 {
            if let Ok(date) = NaiveDate::parse_from_str(s, "%Y%m%d") {
                return date.and_hms_opt(0, 0, 0).map(|naive| Utc.from_utc_datetime(&naive));
            }
        }
        let n: i64 = s.parse().ok()?;
        // Thirteen digits and up are milliseconds
        return if s.len() >= 13 {
            Utc.timestamp_millis_opt(n).single()
        } else {
            Utc.timestamp_opt(n, 0).single()
        };
    }
    None
}

/// Relation listing request for one agency
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelationQuery {
    pub firm_id: String,
    pub since: Option<String>,
    pub until: Option<String>,
    pub status: Option<RelationStatus>,
}

impl RelationQuery {
    pub fn for_firm(firm_id: impl Into<String>) -> Self {
        Self {
            firm_id: firm_id.into(),
            ..Self::default()
        }
    }

    pub fn since(mut self, since: impl Into<String>) -> Self {
        self.since = Some(since.into());
        self
    }

    pub fn until(mut self, until: impl Into<String>) -> Self {
        self.until = Some(until.into());
        self
    }

    pub fn status(mut self, status: RelationStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Request path; dates are canonicalised before being embedded
    pub fn to_path(&self) -> String {
        let mut params = Vec::new();
        if let Some(since) = &self.since {
            params.push(format!("since={}", encode(&normalize_timestamp(since))));
        }
        if let Some(until) = &self.until {
            params.push(format!("until={}", encode(&normalize_timestamp(until))));
        }
        if let Some(status) = self.status {
            params.push(format!("status={}", status.as_str()));
        }

        let base = format!("/firms/{}/relations", encode(&self.firm_id));
        if params.is_empty() {
            base
        } else {
            format!("{}?{}", base, params.join("&"))
        }
    }
}

pub(crate) fn encode(value: &str) -> String {
    utf8_percent_encode(value, QUERY_VALUE).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::fetch::testing::{pipeline_with, ScriptedTransport};
    use crate::transport::TransportResponse;
    use serde_json::json;

    fn page_of(start: usize, len: usize) -> TransportResponse {
        let items: Vec<Value> = (start..start + len).map(|i| json!({ "id": i })).collect();
        TransportResponse::ok(Value::Array(items).to_string())
    }

    #[derive(Debug, serde::Deserialize)]
    struct Row {
        id: usize,
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_pages_terminate_on_short_page() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond("/rel?offset=0&limit=1000", page_of(0, 1000));
        transport.respond("/rel?offset=1000&limit=1000", page_of(1000, 1000));
        transport.respond("/rel?offset=2000&limit=1000", page_of(2000, 400));
        let pipeline = Arc::new(pipeline_with(Arc::clone(&transport), EngineConfig::default()));

        let rows: Vec<Row> = PaginatedFetcher::new(pipeline).fetch_all("/rel", 1000).await.unwrap();
        assert_eq!(rows.len(), 2400);
        assert_eq!(transport.request_count(), 3);
        assert!(rows.iter().enumerate().all(|(i, row)| row.id == i));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exact_multiple_needs_empty_terminal_page() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond("/rel?offset=0&limit=2", page_of(0, 2));
        transport.respond("/rel?offset=2&limit=2", TransportResponse::ok("[]"));
        let pipeline = Arc::new(pipeline_with(Arc::clone(&transport), EngineConfig::default()));

        let rows: Vec<Row> = PaginatedFetcher::new(pipeline).fetch_all("/rel", 2).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(transport.request_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_page_aborts_with_offset() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond("/rel?offset=0&limit=2", page_of(0, 2));
        transport.respond("/rel?offset=2&limit=2", TransportResponse::new(500, "upstream down"));
        let pipeline = Arc::new(pipeline_with(transport, EngineConfig::default()));

        let err = PaginatedFetcher::new(pipeline)
            .fetch_all::<Row>("/rel", 2)
            .await
            .unwrap_err();
        match err {
            FetchError::Page { offset, source } => {
                assert_eq!(offset, 2);
                assert_eq!(source.status(), Some(500));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unusable_page_is_fetched_again() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.enqueue("/rel?offset=0&limit=2", TransportResponse::ok(r#"{"total":0}"#));
        transport.enqueue("/rel?offset=0&limit=2", page_of(0, 1));
        let fetcher = PaginatedFetcher::new(Arc::new(pipeline_with(
            Arc::clone(&transport),
            EngineConfig::default(),
        )));

        let err = fetcher.fetch_all::<Row>("/rel", 2).await.unwrap_err();
        match err {
            FetchError::Page { offset, source } => {
                assert_eq!(offset, 0);
                assert!(matches!(*source, FetchError::Decode(_)));
            }
            other => panic!("unexpected error: {:?}", other),
        }

        let rows: Vec<Row> = fetcher.fetch_all("/rel", 2).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(transport.request_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrapped_page_object() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond(
            "/rel?since=x&offset=0&limit=10",
            TransportResponse::ok(r#"{"data":[{"id":0},{"id":1}],"total":2}"#),
        );
        let pipeline = Arc::new(pipeline_with(transport, EngineConfig::default()));

        let rows: Vec<Row> = PaginatedFetcher::new(pipeline)
            .fetch_all("/rel?since=x", 10)
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_normalize_timestamp_formats() {
        assert_eq!(normalize_timestamp("2024-01-31"), "2024-01-31T00:00:00.000Z");
        assert_eq!(normalize_timestamp("01/31/2024"), "2024-01-31T00:00:00.000Z");
        assert_eq!(normalize_timestamp("2024-01-31 13:45:00"), "2024-01-31T13:45:00.000Z");
        assert_eq!(normalize_timestamp("2024-01-31T08:00:00-05:00"), "2024-01-31T13:00:00.000Z");
        assert_eq!(normalize_timestamp("20240131"), "2024-01-31T00:00:00.000Z");
        assert_eq!(normalize_timestamp("1706659200"), "2024-01-31T00:00:00.000Z");
        assert_eq!(normalize_timestamp("1706659200000"), "2024-01-31T00:00:00.000Z");
    }

    #[test]
    fn test_normalize_timestamp_best_effort() {
        assert_eq!(normalize_timestamp(" 2024-13-45 99:00 "), "2024-13-45T99:00Z");
        assert_eq!(normalize_timestamp("yesterday"), "yesterdayZ");
    }

    #[test]
    fn test_relation_query_path() {
        let path = RelationQuery::for_firm("GA-12")
            .since("2024-01-31")
            .status(RelationStatus::Active)
            .to_path();
        assert_eq!(
            path,
            "/firms/GA-12/relations?since=2024-01-31T00%3A00%3A00.000Z&status=active"
        );
        assert_eq!(RelationQuery::for_firm("7").to_path(), "/firms/7/relations");
    }

    #[test]
    fn test_with_paging() {
        assert_eq!(with_paging("/r", 0, 10), "/r?offset=0&limit=10");
        assert_eq!(with_paging("/r?a=1", 10, 10), "/r?a=1&offset=10&limit=10");
    }
}
