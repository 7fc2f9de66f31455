//! reqwest-backed item source for JSON listings paged by offset and limit.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::pipeline::error::SourceError;
use crate::pipeline::source::{ItemSource, Page, SourceRecord};
use crate::sources::DetailSource;

const USER_AGENT: &str = concat!("incremental-collector/", env!("CARGO_PKG_VERSION"));

/// One row of a JSON listing, kept as raw JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRow {
    /// Upstream rank when the row carries one, otherwise its 1-based position.
    pub rank: u64,
    pub id: String,
    pub data: Value,
}

impl JsonRow {
    pub fn field(&self, path: &str) -> Option<&Value> {
        lookup(&self.data, path)
    }

    pub fn str_field(&self, path: &str) -> Option<String> {
        lookup_str(&self.data, path)
    }
}

/// Field lookup by JSON pointer (`/user/slug`) or plain key (`slug`).
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.starts_with('/') {
        value.pointer(path)
    } else {
        value.get(path)
    }
}

/// Non-blank string or number at `path`, as text.
pub fn lookup_str(value: &Value, path: &str) -> Option<String> {
    lookup(value, path).and_then(value_to_string)
}

impl SourceRecord for JsonRow {
    fn rank(&self) -> Option<u64> {
        Some(self.rank)
    }

    fn record_id(&self) -> String {
        self.id.clone()
    }
}

fn value_to_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpSourceConfig {
    pub url: String,
    pub page_size: usize,
    pub offset_param: String,
    pub limit_param: String,
    /// JSON pointer to the array of rows; the body itself when unset.
    pub items_pointer: Option<String>,
    /// Row field holding the upstream rank.
    pub rank_field: Option<String>,
    pub id_field: String,
    pub extra_query: Vec<(String, String)>,
    pub timeout: Duration,
}

impl HttpSourceConfig {
    pub fn new(url: impl Into<String>, page_size: usize) -> Self {
        Self {
            url: url.into(),
            page_size: page_size.max(1),
            offset_param: "offset".into(),
            limit_param: "limit".into(),
            items_pointer: None,
            rank_field: None,
            id_field: "id".into(),
            extra_query: Vec::new(),
            timeout: Duration::from_secs(20),
        }
    }
}

pub fn build_client(timeout: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// `Retry-After` in delta-seconds form.
pub fn parse_retry_after(raw: &str) -> Option<Duration> {
    raw.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Map non-2xx responses onto the source error taxonomy.
pub async fn check_status(resp: Response) -> Result<Response, SourceError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    match status {
        StatusCode::TOO_MANY_REQUESTS => {
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|h| h.to_str().ok())
                .and_then(parse_retry_after);
            Err(SourceError::RateLimited { retry_after })
        }
        StatusCode::NOT_FOUND | StatusCode::GONE => {
            Err(SourceError::Unavailable(resp.url().to_string()))
        }
        _ => {
            let mut body = resp.text().await.unwrap_or_default();
            body.truncate(200);
            Err(SourceError::Http {
                status: status.as_u16(),
                body,
            })
        }
    }
}

/// Turn one response body into rows. Any row that is not an object fails the
/// whole page.
pub fn parse_rows(body: Value, cfg: &HttpSourceConfig, offset: u64) -> Result<Vec<JsonRow>, SourceError> {
    let items = match &cfg.items_pointer {
        Some(ptr) => body
            .pointer(ptr)
            .cloned()
            .ok_or_else(|| SourceError::Decode(format!("no {ptr} in response")))?,
        None => body,
    };
    let Value::Array(rows) = items else {
        return Err(SourceError::Decode("expected a JSON array of rows".into()));
    };

    rows.into_iter()
        .enumerate()
        .map(|(i, data)| {
            if !data.is_object() {
                return Err(SourceError::Decode(format!("row {i} is not an object")));
            }
            let position = offset + i as u64 + 1;
            let rank = cfg
                .rank_field
                .as_deref()
                .and_then(|f| data.get(f))
                .and_then(Value::as_u64)
                .unwrap_or(position);
            let id = data
                .get(&cfg.id_field)
                .and_then(value_to_string)
                .unwrap_or_else(|| rank.to_string());
            Ok(JsonRow { rank, id, data })
        })
        .collect()
}

pub struct JsonPageSource {
    client: Client,
    cfg: HttpSourceConfig,
}

impl JsonPageSource {
    pub fn new(cfg: HttpSourceConfig) -> Self {
        Self {
            client: build_client(cfg.timeout),
            cfg,
        }
    }

    pub fn config(&self) -> &HttpSourceConfig {
        &self.cfg
    }
}

#[async_trait]
impl ItemSource for JsonPageSource {
    type Item = JsonRow;

    fn page_size(&self) -> usize {
        self.cfg.page_size
    }

    async fn fetch_page(&self, offset: u64) -> Result<Page<JsonRow>, SourceError> {
        let paging = [
            (self.cfg.offset_param.as_str(), offset.to_string()),
            (self.cfg.limit_param.as_str(), self.cfg.page_size.to_string()),
        ];
        let resp = self
            .client
            .get(&self.cfg.url)
            .header("Accept", "application/json")
            .query(&paging)
            .query(&self.cfg.extra_query)
            .send()
            .await?;
        let body: Value = check_status(resp)
            .await?
            .json()
            .await
            .map_err(|e| SourceError::Decode(e.to_string()))?;
        let rows = parse_rows(body, &self.cfg, offset)?;
        debug!(url = %self.cfg.url, offset, rows = rows.len(), "page fetched");
        let has_more = rows.len() >= self.cfg.page_size;
        Ok(Page::new(rows, has_more))
    }
}

/// Single-object lookups (`https://host/users/{key}`) used for enrichment.
pub struct JsonDetailClient {
    client: Client,
    url_template: String,
}

impl JsonDetailClient {
    pub fn new(url_template: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: build_client(timeout),
            url_template: url_template.into(),
        }
    }

    pub fn url_for(&self, key: &str) -> String {
        self.url_template.replace("{key}", key)
    }

    pub async fn fetch(&self, key: &str) -> Result<Value, SourceError> {
        let resp = self
            .client
            .get(self.url_for(key))
            .header("Accept", "application/json")
            .send()
            .await?;
        check_status(resp)
            .await?
            .json()
            .await
            .map_err(|e| SourceError::Decode(e.to_string()))
    }
}

#[async_trait]
impl DetailSource for JsonDetailClient {
    async fn detail(&self, key: &str) -> Result<Value, SourceError> {
        self.fetch(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rows_get_positional_rank_without_rank_field() {
        let mut cfg = HttpSourceConfig::new("http://example.invalid", 2);
        cfg.items_pointer = Some("/data/items".into());
        let body = json!({"data": {"items": [{"id": 7}, {"id": "x"}]}});
        let rows = parse_rows(body, &cfg, 40).unwrap();
        assert_eq!(rows[0].rank, 41);
        assert_eq!(rows[0].id, "7");
        assert_eq!(rows[1].rank, 42);
        assert_eq!(rows[1].id, "x");
    }

    #[test]
    fn upstream_rank_field_wins() {
        let mut cfg = HttpSourceConfig::new("http://example.invalid", 20);
        cfg.rank_field = Some("ranking".into());
        let rows = parse_rows(json!([{"ranking": 401, "user": {"slug": "abc"}}]), &cfg, 0).unwrap();
        assert_eq!(rows[0].rank, 401);
        // No id field: the rank stands in.
        assert_eq!(rows[0].id, "401");
        assert_eq!(rows[0].str_field("/user/slug").as_deref(), Some("abc"));
    }

    #[test]
    fn shape_mismatch_fails_the_page() {
        let cfg = HttpSourceConfig::new("http://example.invalid", 20);
        assert!(matches!(
            parse_rows(json!({"items": []}), &cfg, 0),
            Err(SourceError::Decode(_))
        ));
        assert!(matches!(
            parse_rows(json!([{"id": 1}, 5]), &cfg, 0),
            Err(SourceError::Decode(_))
        ));
    }

    #[test]
    fn retry_after_seconds() {
        assert_eq!(parse_retry_after(" 30 "), Some(Duration::from_secs(30)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }

    #[test]
    fn detail_url_substitutes_key() {
        let client = JsonDetailClient::new("https://api.example.invalid/users/{key}", Duration::from_secs(1));
        assert_eq!(client.url_for("abc"), "https://api.example.invalid/users/abc");
    }
}
