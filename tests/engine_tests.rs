//! End-to-end runs against a mock HTTP server.
//!
//! Plans here use second-scale stages so the whole file runs in a few seconds.

use std::time::Duration;

use loadstage::config::PlanFile;
use loadstage::error::{ConfigError, EngineError};
use loadstage::metrics::{MetricKind, MetricSelector, Statistic, ValueType, VUS, VUS_MAX};
use loadstage::summary::{AbortReason, EXIT_INTERRUPTED, EXIT_OK, EXIT_THRESHOLDS_FAILED};
use loadstage::thresholds::Verdict;
use loadstage::vu::VuContext;
use tokio::time::Instant;
use wiremock::matchers::path;
use wiremock::{Mock, MockServer, ResponseTemplate};

const CPU_BODY: &str = "Started a CPU performance test task. Check the server logs for completion.";

async fn perf_server(cpu_status: u16) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(path("/healthz"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&server)
        .await;
    Mock::given(path("/test-cpu"))
        .respond_with(ResponseTemplate::new(cpu_status).set_body_string(CPU_BODY))
        .mount(&server)
        .await;
    server
}

fn plan(options: &str) -> PlanFile {
    let source = format!(
        r#"
        [engine]
        tick = "20ms"
        threshold_interval = "100ms"

        [options]
        {options}

        [script]
        base_url = "http://unused.invalid"
        sleep = "100ms"

        [[script.requests]]
        name = "healthz"
        path = "/healthz"
        checks = [{{ name = "is status 200 (healthz)", status = 200 }}]

        [[script.requests]]
        name = "test-cpu"
        path = "/test-cpu"
        checks = [
            {{ name = "is status 200 (test-cpu)", status = 200 }},
            {{ name = "body has confirmation text", body_contains = "Started a CPU performance test task" }},
        ]
        "#
    );
    PlanFile::from_toml_str(&source).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ramping_run_passes_thresholds() {
    let server = perf_server(200).await;
    let engine = plan(
        r#"
        stages = [
            { duration = "500ms", target = 2 },
            { duration = "1s", target = 2 },
            { duration = "500ms", target = 0 },
        ]
        [options.thresholds]
        http_req_duration = ["p(95)<1000"]
        http_req_failed = ["rate<0.01"]
        checks = ["rate==1"]
        "#,
    )
    .into_engine(Some(&server.uri()))
    .unwrap();

    let report = engine.run().await.unwrap();
    assert!(report.passed(), "{report}");
    assert_eq!(report.exit_code(), EXIT_OK);
    assert!(report.aborted.is_none());
    assert!(report.thresholds.iter().all(|t| t.verdict == Verdict::Pass));

    let reqs = report.metric("http_reqs").unwrap();
    assert!(reqs.values["count"] >= 4.0);
    let iterations = report.metric("iterations").unwrap().values["count"];
    assert_eq!(reqs.values["count"], iterations * 2.0);

    let snapshot = report.snapshot();
    let peak = snapshot.stat(&MetricSelector::metric(VUS), &Statistic::Max).unwrap();
    assert!(peak <= 2.0);
    assert_eq!(
        snapshot.stat(&MetricSelector::metric(VUS_MAX), &Statistic::Value),
        Some(2.0)
    );

    assert_eq!(report.scenarios.len(), 1);
    assert_eq!(report.scenarios[0].executor, "ramping-vus");
    assert_eq!(report.scenarios[0].counts.peak_vus, 2);
    assert_eq!(report.checks.len(), 3);
    assert!(report.checks.iter().all(|c| c.fails == 0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failing_endpoint_fails_thresholds() {
    let server = perf_server(500).await;
    let engine = plan(
        r#"
        vus = 2
        duration = "1s"
        [options.thresholds]
        http_req_failed = ["rate<0.01"]
        "#,
    )
    .into_engine(Some(&server.uri()))
    .unwrap();

    let report = engine.run().await.unwrap();
    assert!(!report.passed());
    assert_eq!(report.exit_code(), EXIT_THRESHOLDS_FAILED);

    let failed = &report.thresholds[0];
    assert_eq!(failed.verdict, Verdict::Fail);
    // healthz passes, test-cpu fails: half the requests.
    let rate = failed.observed.unwrap();
    assert!((rate - 0.5).abs() < 1e-9, "observed {rate}");

    let cpu_status = report
        .checks
        .iter()
        .find(|c| c.name == "is status 200 (test-cpu)")
        .unwrap();
    assert_eq!(cpu_status.passes, 0);
    assert!(cpu_status.fails > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn abort_on_fail_stops_the_run_early() {
    let server = perf_server(503).await;
    let engine = plan(
        r#"
        [options.scenarios.long_haul]
        executor = "constant-vus"
        vus = 2
        duration = "30s"
        gracefulStop = "10s"
        [options.thresholds]
        http_req_failed = [{ threshold = "rate<0.1", abortOnFail = true }]
        "#,
    )
    .into_engine(Some(&server.uri()))
    .unwrap();

    let started = Instant::now();
    let report = engine.run().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5), "{:?}", started.elapsed());
    assert_eq!(report.exit_code(), EXIT_THRESHOLDS_FAILED);
    assert!(matches!(
        report.aborted,
        Some(AbortReason::Threshold { ref metric, .. }) if metric == "http_req_failed"
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancellation_interrupts_the_run() {
    let server = perf_server(200).await;
    let engine = plan(
        r#"
        vus = 3
        duration = "30s"
        "#,
    )
    .into_engine(Some(&server.uri()))
    .unwrap();

    let cancel = engine.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        cancel.cancel();
    });

    let started = Instant::now();
    let report = engine.run().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(report.aborted, Some(AbortReason::Interrupted));
    assert_eq!(report.exit_code(), EXIT_INTERRUPTED);
    assert!(report.scenarios[0].counts.iterations_interrupted > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn threshold_without_samples_fails_with_no_data() {
    let server = perf_server(200).await;
    let engine = plan(
        r#"
        vus = 1
        duration = "300ms"
        [options.thresholds]
        "http_req_duration{name:never-requested}" = ["p(95)<100"]
        "#,
    )
    .into_engine(Some(&server.uri()))
    .unwrap();

    let report = engine.run().await.unwrap();
    assert_eq!(report.thresholds[0].verdict, Verdict::NoData);
    assert_eq!(report.exit_code(), EXIT_THRESHOLDS_FAILED);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn all_zero_ramp_never_starts_a_vu() {
    let server = perf_server(200).await;
    let engine = plan(
        r#"
        stages = [
            { duration = "300ms", target = 0 },
            { duration = "300ms", target = 0 },
        ]
        "#,
    )
    .into_engine(Some(&server.uri()))
    .unwrap();

    let report = engine.run().await.unwrap();
    assert_eq!(report.exit_code(), EXIT_OK);
    let counts = report.scenarios[0].counts;
    assert_eq!(counts.vus_started, 0);
    assert_eq!(counts.peak_vus, 0);
    assert_eq!(counts.iterations_completed, 0);

    let iterations = report
        .snapshot()
        .stat(&MetricSelector::metric("iterations"), &Statistic::Count);
    assert_eq!(iterations.unwrap_or(0.0), 0.0);
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn unknown_threshold_metric_is_a_config_error() {
    let engine = plan(
        r#"
        vus = 1
        duration = "1s"
        [options.thresholds]
        made_up_metric = ["count>0"]
        "#,
    )
    .into_engine(None)
    .unwrap();

    let err = engine.run().await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Config(ConfigError::UnknownMetric(ref name)) if name == "made_up_metric"
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn closure_scenarios_and_custom_metrics() {
    let plan = PlanFile::from_toml_str(
        r#"
        [engine]
        tick = "20ms"

        [options.scenarios.producer]
        executor = "constant-vus"
        vus = 2
        duration = "500ms"

        [options.scenarios.late]
        executor = "ramping-vus"
        startVUs = 1
        stages = [{ duration = "300ms", target = 1 }]
        startTime = "200ms"
        exec = "late"

        [options.thresholds]
        queue_depth = ["max<=10", "count>0"]
        "iterations{scenario:late}" = ["count>0"]
        "#,
    )
    .unwrap();

    let engine = plan.into_engine(None).unwrap();
    engine
        .registry()
        .define("queue_depth", MetricKind::Trend, ValueType::Default)
        .unwrap();
    let engine = engine
        .with_default(|ctx: VuContext| async move {
            ctx.add_sample("queue_depth", (ctx.iteration() % 10) as f64);
            ctx.sleep(Duration::from_millis(50)).await;
            Ok::<_, anyhow::Error>(())
        })
        .with_exec("late", |ctx: VuContext| async move {
            anyhow::ensure!(ctx.scenario() == "late", "wrong scenario {}", ctx.scenario());
            ctx.sleep(Duration::from_millis(50)).await;
            Ok(())
        });

    let report = engine.run().await.unwrap();
    assert!(report.passed(), "{report}");
    let late = report.scenarios.iter().find(|s| s.name == "late").unwrap();
    assert_eq!(late.counts.iterations_failed, 0);
    assert!(late.counts.iterations_completed > 0);
}

#[tokio::test]
async fn missing_exec_is_reported() {
    let plan = PlanFile::from_toml_str(
        r#"
        [options]
        vus = 1
        duration = "1s"
        "#,
    )
    .unwrap();
    let err = plan.into_engine(None).unwrap().run().await.unwrap_err();
    assert!(matches!(err, EngineError::MissingExec { ref exec, .. } if exec == "default"));
}
