//! Outbound HTTP execution.

use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use reqwest::{Client, Method as ReqMethod};
use tracing::{debug, instrument};

use crate::error::NetworkError;
use crate::model::{HttpMethod, RequestSnapshot, ResponseSnapshot};

static SCHEME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9+.\-]*://").expect("failed to compile scheme regex")
});

/// A fully resolved request, ready to send.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    pub timeout: Duration,
}

impl HttpRequest {
    pub fn snapshot(&self) -> RequestSnapshot {
        RequestSnapshot {
            method: self.method.to_string(),
            url: self.url.clone(),
            headers: self.headers.clone(),
            body: self.body.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    /// Header names are lowercase.
    pub headers: BTreeMap<String, String>,
    pub body: String,
    /// Dispatch to end of body read.
    pub duration_ms: u64,
}

impl HttpResponse {
    pub fn snapshot(&self) -> ResponseSnapshot {
        ResponseSnapshot {
            status: self.status,
            headers: self.headers.clone(),
            body: self.body.clone(),
        }
    }

    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_str(&self.body).ok()
    }
}

/// Sends one request and measures it.
#[async_trait]
pub trait HttpExecutor: Send + Sync {
    async fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, NetworkError>;
}

/// [`HttpExecutor`] backed by a shared reqwest client.
#[derive(Debug, Clone, Default)]
pub struct ReqwestExecutor {
    client: Client,
}

impl ReqwestExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

fn convert_method(method: HttpMethod) -> ReqMethod {
    match method {
        HttpMethod::Get => ReqMethod::GET,
        HttpMethod::Post => ReqMethod::POST,
        HttpMethod::Put => ReqMethod::PUT,
        HttpMethod::Delete => ReqMethod::DELETE,
        HttpMethod::Patch => ReqMethod::PATCH,
        HttpMethod::Head => ReqMethod::HEAD,
        HttpMethod::Options => ReqMethod::OPTIONS,
    }
}

fn network_error(err: reqwest::Error) -> NetworkError {
    if err.is_timeout() {
        NetworkError::timeout(format!("request timed out: {err}"))
    } else {
        NetworkError::new(err.to_string())
    }
}

#[async_trait]
impl HttpExecutor for ReqwestExecutor {
    #[instrument(skip(self, request), fields(method = %request.method, url = %request.url))]
    async fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, NetworkError> {
        let url = reqwest::Url::parse(&request.url)
            .map_err(|e| NetworkError::new(format!("invalid URL '{}': {e}", request.url)))?;

        let mut builder = self
            .client
            .request(convert_method(request.method), url)
            .timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        debug!("Sending request");
        let started = Instant::now();
        let response = builder.send().await.map_err(network_error)?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_ascii_lowercase(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body = response.text().await.map_err(network_error)?;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        debug!(status, duration_ms, "Received response");

        Ok(HttpResponse {
            status,
            headers,
            body,
            duration_ms,
        })
    }
}

/// Join `url` onto `base_url` unless it is already absolute.
///
/// Absolute means it starts with a scheme (`http://...`). A relative
/// URL with no base is rejected.
pub fn resolve_url(base_url: Option<&str>, url: &str) -> Result<String, NetworkError> {
    if SCHEME_RE.is_match(url) {
        return Ok(url.to_string());
    }
    let Some(base) = base_url else {
        return Err(NetworkError::new(format!(
            "relative URL '{url}' but the environment has no base_url"
        )));
    };
    let base = base.trim_end_matches('/');
    let path = url.trim_start_matches('/');
    if path.is_empty() {
        Ok(base.to_string())
    } else {
        Ok(format!("{base}/{path}"))
    }
}

/// Merge environment default headers under the step's headers (step
/// wins, names compared case-insensitively) and add a JSON content type
/// when a body is sent without one.
pub fn merge_headers(
    defaults: &std::collections::HashMap<String, String>,
    step_headers: BTreeMap<String, String>,
    has_body: bool,
) -> BTreeMap<String, String> {
    let mut merged = step_headers;
    for (name, value) in defaults {
        if !merged.keys().any(|k| k.eq_ignore_ascii_case(name)) {
            merged.insert(name.clone(), value.clone());
        }
    }
    if has_body && !merged.keys().any(|k| k.eq_ignore_ascii_case("content-type")) {
        merged.insert("Content-Type".to_string(), "application/json".to_string());
    }
    merged
}
