use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use reqwest::StatusCode;
use serde_json::json;

use shoptrack_api::app::services::{build_services, AppServices};
use shoptrack_core::Settings;

struct TestServer {
    base_url: String,
    services: Arc<AppServices>,
    handle: tokio::task::JoinHandle<()>,
    _state_dir: tempfile::TempDir,
}

impl TestServer {
    async fn spawn() -> Self {
        shoptrack_observability::tracing::init_for_tests();

        let state_dir = tempfile::tempdir().expect("failed to create state dir");
        let mut settings = Settings::default();
        settings.state_dir = state_dir.path().to_path_buf();
        settings.workers.pool_size = 2;
        settings.workers.poll_interval = Duration::from_millis(10);
        settings.scheduler.tick = Duration::from_millis(50);
        // Cold-start retries stay fast and plentiful so the boot-time PREDICT
        // survives until the test publishes a model.
        settings.retry.max_retries = 200;
        settings.retry.base_delay = Duration::from_millis(20);
        settings.retry.max_delay = Duration::from_millis(50);
        settings.retry.cold_start_multiplier = 1;

        // Same router as prod, bound to an ephemeral port.
        let services = build_services(settings).await.expect("failed to build services");
        let app = shoptrack_api::app::build_app(services.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            services,
            handle,
            _state_dir: state_dir,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
        let services = self.services.clone();
        // Worker threads are joined synchronously; this is not a runtime thread.
        std::thread::spawn(move || services.shutdown());
    }
}

/// Poll `path` until `check` accepts the body or the deadline passes.
async fn get_eventually(
    client: &reqwest::Client,
    url: &str,
    check: impl Fn(&serde_json::Value) -> bool,
) -> serde_json::Value {
    let mut last = serde_json::Value::Null;
    for _ in 0..200 {
        let res = client.get(url).send().await.unwrap();
        if res.status() == StatusCode::OK {
            last = res.json().await.unwrap();
            if check(&last) {
                return last;
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not met for {url}; last body: {last}");
}

async fn seed_sales(client: &reqwest::Client, server: &TestServer) {
    let now = Utc::now();
    let mut sales = Vec::new();
    for h in 1..=48i64 {
        for (i, item) in ["sku-apple", "sku-bread", "sku-milk"].iter().enumerate() {
            sales.push(json!({
                "item_id": item,
                "quantity": (h + i as i64) % 4 + 1,
                "sold_at": now - ChronoDuration::hours(h),
            }));
        }
    }
    let res = client
        .post(server.url("/ingest/sales"))
        .json(&json!({ "sales": sales }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["recorded"], 144);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn health_reports_scheduler_workers_and_model() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let health = get_eventually(&client, &server.url("/health"), |b| b["scheduler_alive"] == true).await;
    assert_eq!(health["status"], "ok");
    assert_eq!(health["worker_pool_size"], 2);
    assert!(health["current_model_version"].is_null());
    assert!(health["publishing_halted"].is_null());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn manual_retrain_publishes_and_predictions_follow() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    seed_sales(&client, &server).await;
    let res = client
        .put(server.url("/ingest/stock/sku-milk"))
        .json(&json!({ "quantity": 3 }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = client.post(server.url("/admin/retrain")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let body: serde_json::Value = res.json().await.unwrap();
    let job_id = body["job_id"].as_str().unwrap().to_string();

    let job = get_eventually(&client, &server.url(&format!("/jobs/{job_id}")), |b| {
        b["status"]["state"] == "SUCCEEDED"
    })
    .await;
    assert_eq!(job["kind"], "RETRAIN");
    assert!(job["status"]["warning"].is_null());

    let health = get_eventually(&client, &server.url("/health"), |b| {
        b["current_model_version"].is_u64()
    })
    .await;
    let version = health["current_model_version"].as_u64().unwrap();

    // The boot-time PREDICT has been retrying on cold start; it now finds the model.
    let predictions = get_eventually(&client, &server.url("/predictions"), |b| b["count"] == 3).await;
    for p in predictions["predictions"].as_array().unwrap() {
        // A boot-time RETRAIN may have published an earlier version first.
        let pinned = p["produced_by_model_version"].as_u64().unwrap();
        assert!(pinned >= 1 && pinned <= version);
        assert_eq!(p["stale"], false);
        let score = p["score"].as_f64().unwrap();
        assert!((0.0..=1.0).contains(&score));
    }

    let one = get_eventually(&client, &server.url("/predictions?item_id=sku-milk&horizon=24"), |b| {
        b["count"] == 1
    })
    .await;
    assert_eq!(one["predictions"][0]["item_id"], "sku-milk");

    let model = get_eventually(&client, &server.url("/admin/model"), |b| b["current"].is_object()).await;
    assert_eq!(model["current"]["version"], version);
    assert_eq!(model["current"]["source_job"], job_id.as_str());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn alerts_endpoints_validate_input() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client.get(server.url("/alerts")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["count"], 0);

    let res = client.get(server.url("/alerts?status=snoozed")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "invalid_input");

    let res = client.post(server.url("/alerts/not-a-uuid/ack")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let unknown = uuid::Uuid::now_v7();
    let res = client
        .post(server.url(&format!("/alerts/{unknown}/ack")))
        .json(&json!({ "acknowledged_by": "ops" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = client
        .post(server.url(&format!("/alerts/{unknown}/resolve")))
        .json(&json!({ "by": "ops" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = client.post(server.url("/alerts/not-a-uuid/dismiss")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = client.get(server.url("/alerts?status=dismissed")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = client.get(server.url("/alerts/stats")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let stats: serde_json::Value = res.json().await.unwrap();
    assert_eq!(stats["total"], 0);

    let res = client.get(server.url("/alerts/operational")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn thresholds_can_be_replaced_but_not_invalidated() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .put(server.url("/admin/thresholds"))
        .json(&json!({
            "alert_threshold": 0.6,
            "low_stock_threshold": 5,
            "rush_prediction_threshold": 0.9,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = client
        .put(server.url("/admin/thresholds"))
        .json(&json!({
            "alert_threshold": 1.4,
            "low_stock_threshold": 5,
            "rush_prediction_threshold": 0.9,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = client.get(server.url("/admin/thresholds")).send().await.unwrap();
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["alert_threshold"], 0.6);
    assert_eq!(body["low_stock_threshold"], 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rollback_to_unknown_version_is_rejected() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client.post(server.url("/admin/model/rollback/42")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = client.post(server.url("/admin/model/resume")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn jobs_are_listed_by_status_and_counted() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    // The first tick enqueues one job per kind.
    let jobs = get_eventually(&client, &server.url("/jobs"), |b| b["count"].as_u64() >= Some(4)).await;
    let kinds: Vec<&str> = jobs["jobs"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|j| j["kind"].as_str())
        .collect();
    for kind in ["RETRAIN", "PREDICT", "EVALUATE", "CLEANUP"] {
        assert!(kinds.contains(&kind), "missing {kind} in {kinds:?}");
    }

    let res = client.get(server.url("/jobs?status=bogus")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = client.get(server.url("/jobs?kind=cleanup")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert!(body["jobs"].as_array().unwrap().iter().all(|j| j["kind"] == "CLEANUP"));

    let res = client.get(server.url("/jobs/stats")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let stats: serde_json::Value = res.json().await.unwrap();
    assert!(stats["pending"].is_u64());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ingest_rejects_non_positive_quantities() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .post(server.url("/ingest/sales"))
        .json(&json!({ "sales": [
            { "item_id": "sku-a", "quantity": 2 },
            { "item_id": "sku-b", "quantity": 0 },
        ]}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}
