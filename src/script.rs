//! Declarative scenario functions built from a plan file's `[script]` table.
//!
//! Each iteration sends the configured requests in order, runs each request's
//! checks, then sleeps for the configured think time.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Method, Url};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::check::Check;
use crate::duration::parse_duration;
use crate::error::ConfigError;
use crate::http::RequestOptions;
use crate::metrics::TagSet;
use crate::vu::{ScenarioFn, VuContext};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScriptConfig {
    /// Prefix for every request path, e.g. `http://perf-test:8080`.
    pub base_url: String,
    /// Think time at the end of each iteration.
    pub sleep: Option<String>,
    pub requests: Vec<RequestSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestSpec {
    /// Value of the `name` tag; defaults to the URL without its query.
    pub name: Option<String>,
    #[serde(default = "default_method")]
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    pub timeout: Option<String>,
    pub expected_statuses: Option<Vec<u16>>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub checks: Vec<CheckSpec>,
}

/// A check passes when every condition it sets holds.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckSpec {
    pub name: String,
    pub status: Option<u16>,
    pub body_contains: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone)]
struct PreparedRequest {
    method: Method,
    url: String,
    options: RequestOptions,
    checks: Vec<Check>,
}

/// Scenario function that replays a [`ScriptConfig`].
#[derive(Debug, Clone)]
pub struct HttpScript {
    requests: Vec<PreparedRequest>,
    sleep: Option<Duration>,
}

impl HttpScript {
    /// Validate `config` and resolve every request URL.
    ///
    /// `base_url` replaces the configured base URL when given.
    pub fn from_config(config: &ScriptConfig, base_url: Option<&str>) -> Result<Self, ConfigError> {
        if config.requests.is_empty() {
            return Err(ConfigError::InvalidScript("`requests` must not be empty".into()));
        }
        let base = base_url.unwrap_or(&config.base_url);
        let requests = config
            .requests
            .iter()
            .map(|spec| prepare(base, spec))
            .collect::<Result<Vec<_>, _>>()?;
        let sleep = config.sleep.as_deref().map(parse_duration).transpose()?;
        Ok(Self { requests, sleep })
    }

    /// Resolved request URLs, in order.
    pub fn urls(&self) -> impl Iterator<Item = &str> {
        self.requests.iter().map(|r| r.url.as_str())
    }
}

fn prepare(base: &str, spec: &RequestSpec) -> Result<PreparedRequest, ConfigError> {
    let method = Method::from_bytes(spec.method.to_ascii_uppercase().as_bytes())
        .map_err(|_| ConfigError::InvalidScript(format!("invalid method {:?}", spec.method)))?;

    let joined = format!(
        "{}/{}",
        base.trim_end_matches('/'),
        spec.path.trim_start_matches('/')
    );
    let mut url = Url::parse(&joined)
        .map_err(|e| ConfigError::InvalidScript(format!("invalid URL {joined:?}: {e}")))?;
    if !spec.query.is_empty() {
        url.query_pairs_mut().extend_pairs(spec.query.iter());
    }

    let mut tags = TagSet::new();
    for (k, v) in &spec.tags {
        tags.insert(k.as_str(), v.as_str());
    }
    let options = RequestOptions {
        name: spec.name.clone(),
        headers: spec
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        body: spec.body.clone().map(Bytes::from),
        timeout: spec.timeout.as_deref().map(parse_duration).transpose()?,
        expected_statuses: spec.expected_statuses.clone(),
        tags,
    };

    let checks = spec.checks.iter().map(build_check).collect::<Result<_, _>>()?;
    Ok(PreparedRequest {
        method,
        url: url.to_string(),
        options,
        checks,
    })
}

fn build_check(spec: &CheckSpec) -> Result<Check, ConfigError> {
    match (spec.status, spec.body_contains.clone()) {
        (None, None) => Err(ConfigError::InvalidScript(format!(
            "check {:?} needs `status` or `body_contains`",
            spec.name
        ))),
        (Some(status), None) => Ok(Check::new(spec.name.as_str(), move |r| r.status == status)),
        (None, Some(needle)) => Ok(Check::body_contains(spec.name.as_str(), needle)),
        (Some(status), Some(needle)) => Ok(Check::new(spec.name.as_str(), move |r| {
            r.status == status && r.body_contains(&needle)
        })),
    }
}

#[async_trait]
impl ScenarioFn for HttpScript {
    async fn iteration(&self, ctx: VuContext) -> anyhow::Result<()> {
        for request in &self.requests {
            let response = ctx
                .request(request.method.clone(), &request.url, request.options.clone())
                .await;
            ctx.check(&response, &request.checks);
        }
        if let Some(sleep) = self.sleep {
            ctx.sleep(sleep).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::providers::Format;

    fn config(toml_src: &str) -> ScriptConfig {
        figment::Figment::from(figment::providers::Toml::string(toml_src))
            .extract()
            .unwrap()
    }

    #[test]
    fn builds_urls_with_query() {
        let script = HttpScript::from_config(
            &config(
                r#"
                base_url = "http://perf-test:8080/"
                sleep = "2s"
                [[requests]]
                path = "/test-memory"
                query = { mb = "10" }
                checks = [{ name = "status is 200", status = 200 }]
                "#,
            ),
            None,
        )
        .unwrap();
        assert_eq!(
            script.urls().collect::<Vec<_>>(),
            ["http://perf-test:8080/test-memory?mb=10"]
        );
        assert_eq!(script.sleep, Some(Duration::from_secs(2)));
    }

    #[test]
    fn base_url_override_wins() {
        let script = HttpScript::from_config(
            &config(
                r#"
                base_url = "http://perf-test:8080"
                [[requests]]
                path = "healthz"
                "#,
            ),
            Some("http://127.0.0.1:9999"),
        )
        .unwrap();
        assert_eq!(script.urls().next(), Some("http://127.0.0.1:9999/healthz"));
    }

    #[test]
    fn rejects_bad_scripts() {
        let empty_check = config(
            r#"
            base_url = "http://h"
            [[requests]]
            path = "/x"
            checks = [{ name = "nothing" }]
            "#,
        );
        assert!(matches!(
            HttpScript::from_config(&empty_check, None),
            Err(ConfigError::InvalidScript(_))
        ));

        let bad_url = config(
            r#"
            base_url = "not a url"
            [[requests]]
            path = "/x"
            "#,
        );
        assert!(HttpScript::from_config(&bad_url, None).is_err());

        let no_requests = config(
            r#"
            base_url = "http://h"
            requests = []
            "#,
        );
        assert!(HttpScript::from_config(&no_requests, None).is_err());
    }
}
