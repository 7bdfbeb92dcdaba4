//! HTTP client used by virtual users.
//!
//! Every request attempt, successful or not, appends exactly one sample to
//! `http_reqs`, `http_req_duration` and `http_req_failed`. Transport failures
//! do not surface as errors: they come back as a [`Response`] with status 0
//! and a [`RequestFailure`], so checks can still run against them.

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

use crate::metrics::{
    Registry, TagSet, DATA_RECEIVED, HTTP_REQS, HTTP_REQ_DURATION, HTTP_REQ_FAILED,
};
use crate::options::HttpOptions;

/// Why a request never produced a usable response.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RequestFailure {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("invalid header: {0}")]
    InvalidHeader(String),
    #[error("transport error: {0}")]
    Transport(String),
}

impl RequestFailure {
    fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            RequestFailure::Timeout
        } else if err.is_connect() {
            RequestFailure::Connect(err.to_string())
        } else if err.is_builder() {
            RequestFailure::InvalidUrl(err.to_string())
        } else {
            RequestFailure::Transport(err.to_string())
        }
    }
}

/// Per-request settings.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Value of the `name` tag; defaults to the URL without its query string.
    pub name: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
    /// Overrides the client-wide timeout.
    pub timeout: Option<Duration>,
    /// Statuses that count as success; defaults to 200..=399.
    pub expected_statuses: Option<Vec<u16>>,
    pub tags: TagSet,
}

impl RequestOptions {
    fn is_expected(&self, status: u16) -> bool {
        match &self.expected_statuses {
            Some(list) => list.contains(&status),
            None => (200..400).contains(&status),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Response {
    pub url: String,
    pub method: Method,
    /// HTTP status, or 0 when no response was received.
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub duration: Duration,
    pub failure: Option<RequestFailure>,
}

impl Response {
    /// Body as UTF-8 text, if there is a body and it is valid UTF-8.
    pub fn text(&self) -> Option<&str> {
        self.body
            .as_deref()
            .and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn body_contains(&self, needle: &str) -> bool {
        self.text().is_some_and(|t| t.contains(needle))
    }

    pub fn is_failure(&self) -> bool {
        self.failure.is_some()
    }

    pub fn into_result(self) -> Result<Response, RequestFailure> {
        match self.failure {
            Some(failure) => Err(failure),
            None => Ok(self),
        }
    }
}

/// Cheap to clone; all VUs of a run share one connection pool.
#[derive(Clone)]
pub struct HttpClient {
    inner: reqwest::Client,
    registry: Arc<Registry>,
}

impl HttpClient {
    pub fn new(options: &HttpOptions, registry: Arc<Registry>) -> Result<Self, reqwest::Error> {
        let mut builder = reqwest::Client::builder()
            .timeout(options.timeout)
            .user_agent(options.user_agent.clone());
        if options.no_connection_reuse {
            // No idle connections are kept, so every request dials a new one.
            builder = builder.pool_max_idle_per_host(0);
        }
        Ok(Self {
            inner: builder.build()?,
            registry,
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub async fn get(&self, url: &str, tags: &TagSet) -> Response {
        self.request(Method::GET, url, RequestOptions::default(), tags)
            .await
    }

    /// Send one request and record its samples under `tags` plus request tags.
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        options: RequestOptions,
        tags: &TagSet,
    ) -> Response {
        let started = Instant::now();
        let outcome = self.send(method.clone(), url, &options).await;
        let duration = started.elapsed();

        let response = match outcome {
            Ok((status, headers, body)) => Response {
                url: url.to_string(),
                method,
                status,
                headers,
                body,
                duration,
                failure: None,
            },
            Err((status, failure)) => {
                debug!(url, error = %failure, "request failed");
                Response {
                    url: url.to_string(),
                    method,
                    status,
                    headers: HeaderMap::new(),
                    body: None,
                    duration,
                    failure: Some(failure),
                }
            }
        };

        self.record(&response, &options, tags);
        response
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        options: &RequestOptions,
    ) -> Result<(u16, HeaderMap, Option<Bytes>), (u16, RequestFailure)> {
        let mut builder = self.inner.request(method, url);
        for (name, value) in &options.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| (0, RequestFailure::InvalidHeader(e.to_string())))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| (0, RequestFailure::InvalidHeader(e.to_string())))?;
            builder = builder.header(name, value);
        }
        if let Some(body) = &options.body {
            builder = builder.body(body.clone());
        }
        if let Some(timeout) = options.timeout {
            builder = builder.timeout(timeout);
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| (0, RequestFailure::from_reqwest(&e)))?;
        let status = resp.status().as_u16();
        let headers = resp.headers().clone();
        let body = resp
            .bytes()
            .await
            .map_err(|e| (status, RequestFailure::from_reqwest(&e)))?;
        Ok((status, headers, (!body.is_empty()).then_some(body)))
    }

    fn record(&self, response: &Response, options: &RequestOptions, tags: &TagSet) {
        let expected = response.failure.is_none() && options.is_expected(response.status);
        let name = options
            .name
            .clone()
            .unwrap_or_else(|| strip_query(&response.url).to_string());

        let mut series = tags.clone();
        for (k, v) in options.tags.iter() {
            series.insert(k, v);
        }
        series.insert("name", name);
        series.insert("method", response.method.as_str());
        series.insert("status", response.status.to_string());
        series.insert("expected_response", expected.to_string());

        self.registry.add(HTTP_REQS, &series, 1.0);
        self.registry.add(
            HTTP_REQ_DURATION,
            &series,
            response.duration.as_secs_f64() * 1000.0,
        );
        self.registry
            .add(HTTP_REQ_FAILED, &series, if expected { 0.0 } else { 1.0 });
        let received = response.body.as_ref().map_or(0, Bytes::len);
        if received > 0 {
            self.registry.add(DATA_RECEIVED, &series, received as f64);
        }
    }
}

fn strip_query(url: &str) -> &str {
    url.split_once('?').map_or(url, |(base, _)| base)
}
