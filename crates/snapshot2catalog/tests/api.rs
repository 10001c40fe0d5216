use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use snapshot2catalog::{init_components, router, AppState, Components};
use snapshot2catalog_config::RuntimeConfig;
use snapshot2catalog_core::{Environment, RunId, RunStage};
use tower::ServiceExt;

const CONFIG: &str = r#"
    [identity]
    caller_arn = "arn:aws:iam::111111111111:role/snapshot2catalog-pipeline-dev"

    [schedule]
    enabled = false

    [pipeline]
    poll_initial_secs = 1
    poll_max_interval_secs = 5

    [staging]
    backend = "memory"

    [environments.dev]
    platform_account_id = "111111111111"
    source_account_id = "222222222222"
    cluster_identifier = "db-1"
    database_name = "app"
    kms_key_arn = "arn:aws:kms:ap-northeast-1:222222222222:key/k-1"
    export_principals = ["arn:aws:iam::111111111111:role/snapshot2catalog-pipeline-dev"]
    catalog_principals = ["arn:aws:iam::111111111111:role/snapshot2catalog-pipeline-dev"]

    [[environments.dev.tables]]
    name = "users"
    columns = [{ name = "id", type = "bigint" }, { name = "email", type = "string" }]

    [[environments.dev.tables]]
    name = "posts"
    columns = [{ name = "id", type = "bigint" }, { name = "title", type = "string" }]
"#;

fn setup() -> (Components, Router) {
    let config = RuntimeConfig::from_toml(CONFIG).unwrap();
    let components = init_components(&config).unwrap();
    let app = router(AppState::from_components(&components));
    (components, app)
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            request = request.header("content-type", "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    let response = app
        .clone()
        .oneshot(request.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn health_and_ready() {
    let (_, app) = setup();

    let (status, body) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    let (status, body) = send(&app, "GET", "/ready", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["environments"], json!(["dev"]));
}

#[tokio::test(start_paused = true)]
async fn trigger_returns_run_id_and_run_completes() {
    let (components, app) = setup();

    let (status, body) = send(
        &app,
        "POST",
        "/v1/trigger",
        Some(json!({"environment": "dev", "purpose": "export"})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let run_id: RunId = body["run_id"].as_str().unwrap().parse().unwrap();

    let run = components.scheduler.wait_until_terminal(&run_id).await.unwrap();
    assert_eq!(run.stage, RunStage::Done, "run failed: {:?}", run.error);

    let (status, body) = send(&app, "GET", &format!("/v1/runs/{}", run_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stage"], "done");
    assert_eq!(body["synced_tables"], json!(["users", "posts"]));

    let tables = components.catalog.tables("test-dwh").await.unwrap();
    assert_eq!(tables.len(), 2);
    assert!(tables
        .iter()
        .all(|t| t.location.starts_with(&format!("s3://test-rds-snapshot-dev/{}/", run_id))));

    let (status, body) = send(&app, "GET", "/v1/runs", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["runs"].as_array().unwrap().len(), 1);

    // A finished Run is no longer cancellable
    let (status, body) = send(&app, "POST", &format!("/v1/runs/{}/cancel", run_id), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "E009");

    // Cataloging resolves to the finished Run
    let (status, body) = send(
        &app,
        "POST",
        "/v1/trigger",
        Some(json!({"environment": "dev", "purpose": "catalog"})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["run_id"], run_id.to_string());
}

#[tokio::test]
async fn catalog_trigger_without_runs_conflicts() {
    let (_, app) = setup();

    let (status, body) = send(
        &app,
        "POST",
        "/v1/trigger",
        Some(json!({"environment": "dev", "purpose": "catalog"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "E013");
}

#[tokio::test]
async fn unconfigured_environment_is_bad_request() {
    let (components, app) = setup();

    let (status, body) = send(
        &app,
        "POST",
        "/v1/trigger",
        Some(json!({"environment": "prod", "purpose": "export"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "E011");
    assert!(components.scheduler.list().is_empty());
    assert_eq!(components.scheduler.environments(), vec![Environment::Dev]);
}

#[tokio::test]
async fn malformed_requests_are_rejected() {
    let (_, app) = setup();

    let (status, body) = send(
        &app,
        "POST",
        "/v1/trigger",
        Some(json!({"environment": "dev", "purpose": "vacuum"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
    assert!(body.get("code").is_none());

    let (status, _) = send(&app, "GET", "/v1/runs/not-a-run", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(&app, "GET", &format!("/v1/runs/{}", RunId::new()), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "E013");
}

#[test]
fn scope_plan_reports_scope_or_resolution_error() {
    let config = RuntimeConfig::from_toml(CONFIG).unwrap();
    let mut deployments = config.deployments();

    let plan = snapshot2catalog::plan::scope_plan(&deployments);
    let export = &plan["dev"]["export"];
    assert_eq!(
        export["principals"],
        json!(["arn:aws:iam::111111111111:role/snapshot2catalog-pipeline-dev"])
    );
    assert!(export["scope"].is_object());
    assert!(export["scope"].to_string().contains("{run_id}"));

    if let Some(dev) = deployments.get_mut(&Environment::Dev) {
        dev.source_account_id = None;
    }
    let plan = snapshot2catalog::plan::scope_plan(&deployments);
    assert_eq!(plan["dev"]["export"]["code"], "E002");
}
