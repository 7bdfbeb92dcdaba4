//! HTTP client behaviour against a mock server.

use std::sync::Arc;
use std::time::Duration;

use loadstage::http::{HttpClient, RequestFailure, RequestOptions};
use loadstage::metrics::{
    MetricSelector, Registry, Statistic, TagSet, DATA_RECEIVED, HTTP_REQS, HTTP_REQ_DURATION,
    HTTP_REQ_FAILED,
};
use loadstage::options::HttpOptions;
use reqwest::Method;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(registry: &Arc<Registry>) -> HttpClient {
    HttpClient::new(&HttpOptions::default(), registry.clone()).unwrap()
}

fn stat(registry: &Registry, selector: &str, statistic: Statistic) -> Option<f64> {
    let selector: MetricSelector = selector.parse().unwrap();
    registry.snapshot().stat(&selector, &statistic)
}

#[tokio::test]
async fn successful_request_records_samples() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/test-memory"))
        .and(query_param("mb", "10"))
        .respond_with(ResponseTemplate::new(200).set_body_string("Allocated 10 MB of memory"))
        .mount(&server)
        .await;

    let registry = Arc::new(Registry::new());
    let scenario = TagSet::new().with("scenario", "baseline_load");
    let url = format!("{}/test-memory?mb=10", server.uri());
    let response = client(&registry).get(&url, &scenario).await;

    assert_eq!(response.status, 200);
    assert!(response.body_contains("Allocated 10 MB"));
    assert!(response.failure.is_none());

    let name = format!("{}/test-memory", server.uri());
    let by_name = format!("http_reqs{{name:{name},status:200,scenario:baseline_load}}");
    assert_eq!(stat(&registry, &by_name, Statistic::Count), Some(1.0));
    assert_eq!(stat(&registry, HTTP_REQ_FAILED, Statistic::Rate), Some(0.0));
    assert_eq!(
        stat(&registry, DATA_RECEIVED, Statistic::Count),
        Some("Allocated 10 MB of memory".len() as f64)
    );
    assert!(stat(&registry, HTTP_REQ_DURATION, Statistic::Max).unwrap() >= 0.0);
}

#[tokio::test]
async fn server_errors_count_as_failed_but_return_a_response() {
    let server = MockServer::start().await;
    Mock::given(path("/test-cpu"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .mount(&server)
        .await;

    let registry = Arc::new(Registry::new());
    let http = client(&registry);
    let url = format!("{}/test-cpu", server.uri());
    for _ in 0..4 {
        let response = http.get(&url, &TagSet::new()).await;
        assert_eq!(response.status, 503);
        assert_eq!(response.text(), Some("overloaded"));
        assert!(response.into_result().is_ok());
    }

    assert_eq!(stat(&registry, HTTP_REQS, Statistic::Count), Some(4.0));
    assert_eq!(stat(&registry, HTTP_REQ_FAILED, Statistic::Rate), Some(1.0));
    assert_eq!(
        stat(&registry, "http_reqs{expected_response:false}", Statistic::Count),
        Some(4.0)
    );
}

#[tokio::test]
async fn custom_expected_statuses_and_name_tag() {
    let server = MockServer::start().await;
    Mock::given(path("/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let registry = Arc::new(Registry::new());
    let options = RequestOptions {
        name: Some("missing".into()),
        expected_statuses: Some(vec![404]),
        ..Default::default()
    };
    let url = format!("{}/missing", server.uri());
    let response = client(&registry)
        .request(Method::GET, &url, options, &TagSet::new())
        .await;

    assert_eq!(response.status, 404);
    assert!(response.body.is_none());
    assert_eq!(
        stat(&registry, "http_req_failed{name:missing}", Statistic::Rate),
        Some(0.0)
    );
}

#[tokio::test]
async fn timeout_is_a_failed_request_with_status_zero() {
    let server = MockServer::start().await;
    Mock::given(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let registry = Arc::new(Registry::new());
    let options = RequestOptions {
        timeout: Some(Duration::from_millis(100)),
        ..Default::default()
    };
    let url = format!("{}/slow", server.uri());
    let response = client(&registry)
        .request(Method::GET, &url, options, &TagSet::new())
        .await;

    assert_eq!(response.status, 0);
    assert_eq!(response.failure, Some(RequestFailure::Timeout));
    assert!(response.duration < Duration::from_secs(5));
    assert_eq!(stat(&registry, HTTP_REQ_FAILED, Statistic::Rate), Some(1.0));
    assert_eq!(stat(&registry, "http_reqs{status:0}", Statistic::Count), Some(1.0));
}

#[tokio::test]
async fn connection_refused_is_reported() {
    // Bind then drop a listener so the port is known to be closed.
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let registry = Arc::new(Registry::new());
    let response = client(&registry)
        .get(&format!("http://127.0.0.1:{port}/healthz"), &TagSet::new())
        .await;

    assert_eq!(response.status, 0);
    assert!(matches!(response.failure, Some(RequestFailure::Connect(_))));
    assert_eq!(stat(&registry, HTTP_REQ_FAILED, Statistic::Rate), Some(1.0));
}

#[tokio::test]
async fn invalid_url_never_reaches_the_network() {
    let registry = Arc::new(Registry::new());
    let response = client(&registry).get("not a url", &TagSet::new()).await;
    assert_eq!(response.status, 0);
    assert!(response.into_result().is_err());
    assert_eq!(stat(&registry, HTTP_REQS, Statistic::Count), Some(1.0));
}

#[tokio::test]
async fn sends_user_agent_and_headers() {
    let server = MockServer::start().await;
    Mock::given(path("/healthz"))
        .and(header("user-agent", "loadstage-test"))
        .and(header("x-run", "42"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let registry = Arc::new(Registry::new());
    let http = HttpClient::new(
        &HttpOptions {
            no_connection_reuse: true,
            user_agent: "loadstage-test".into(),
            timeout: Duration::from_secs(5),
        },
        registry,
    )
    .unwrap();
    let options = RequestOptions {
        headers: vec![("x-run".into(), "42".into())],
        ..Default::default()
    };
    let response = http
        .request(Method::GET, &format!("{}/healthz", server.uri()), options, &TagSet::new())
        .await;
    assert_eq!(response.status, 200);
}
