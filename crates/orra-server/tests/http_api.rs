use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use orra_core::{Engine, EngineConfig};
use orra_providers::{DefaultPlanValidator, FeatureHashEmbedder, PlanGenerator};
use orra_server::{build_router, AppState};
use orra_store::KvStore;
use orra_types::{ActionParam, Plan, ServiceRecord};

struct StubGenerator;

#[async_trait]
impl PlanGenerator for StubGenerator {
    async fn generate(
        &self,
        _action: &str,
        _params: &[ActionParam],
        _catalog: &[ServiceRecord],
        _grounding: Option<&Value>,
    ) -> anyhow::Result<Plan> {
        Ok(serde_json::from_value(json!({
            "tasks": [
                {"id": "task0", "input": {"productId": null}},
                {"id": "task1", "service": "inventory-service",
                 "input": {"productId": "$task0.productId"}}
            ]
        }))?)
    }
}

async fn test_router() -> (Router, Arc<Engine>) {
    let mut config = EngineConfig::default();
    config.webhook_max_attempts = 1;
    let engine = Engine::start(
        config,
        KvStore::open_in_memory().expect("kv"),
        Arc::new(StubGenerator),
        Arc::new(FeatureHashEmbedder::new()),
        Arc::new(DefaultPlanValidator::new()),
    )
    .await
    .expect("engine");
    (build_router(AppState::new(Arc::clone(&engine))), engine)
}

async fn call(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router
        .clone()
        .oneshot(request)
        .await
        .expect("router response");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

fn post(uri: &str, key: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(key) = key {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {key}"));
    }
    builder.body(Body::from(body.to_string())).expect("request")
}

fn get(uri: &str, key: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(key) = key {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {key}"));
    }
    builder.body(Body::empty()).expect("request")
}

async fn create_project(router: &Router) -> (String, String) {
    let (status, body) = call(router, post("/register/project", None, json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    (
        body["id"].as_str().expect("project id").to_string(),
        body["apiKey"].as_str().expect("api key").to_string(),
    )
}

#[tokio::test]
async fn health_is_public() {
    let (router, _engine) = test_router().await;
    let (status, body) = call(&router, get("/health", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn missing_and_bad_keys_are_unauthorized() {
    let (router, _engine) = test_router().await;
    let (status, body) = call(&router, get("/orchestrations", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["kind"], "unauthorized");

    let (status, body) = call(&router, get("/orchestrations", Some("sk-orra-bogus"))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["kind"], "unauthorized");
}

#[tokio::test]
async fn service_registration_validates_and_versions() {
    let (router, _engine) = test_router().await;
    let (_, key) = create_project(&router).await;

    let (status, body) = call(
        &router,
        post(
            "/register/service",
            Some(&key),
            json!({"name": "Bad_Name", "description": "nope"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "validation");
    assert_eq!(body["error"]["param"], "name");

    let (status, body) = call(
        &router,
        post(
            "/register/service",
            Some(&key),
            json!({
                "name": "inventory-service",
                "description": "stock checks",
                "schema": {"input": {"type": "object"}, "output": {"type": "object"}}
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["version"], 1);
    let service_id = body["id"].as_str().expect("service id").to_string();

    // Unchanged spec keeps the version; a schema change bumps it.
    let (_, body) = call(
        &router,
        post(
            "/register/service",
            Some(&key),
            json!({
                "id": service_id,
                "name": "inventory-service",
                "description": "stock checks",
                "schema": {"input": {"type": "object"}, "output": {"type": "object"}}
            }),
        ),
    )
    .await;
    assert_eq!(body["version"], 1);
    let (_, body) = call(
        &router,
        post(
            "/register/service",
            Some(&key),
            json!({
                "id": service_id,
                "name": "inventory-service",
                "description": "stock checks",
                "schema": {"input": {"type": "object", "required": ["productId"]},
                            "output": {"type": "object"}}
            }),
        ),
    )
    .await;
    assert_eq!(body["version"], 2);
}

#[tokio::test]
async fn revertible_registration_requires_ttl() {
    let (router, _engine) = test_router().await;
    let (_, key) = create_project(&router).await;
    let (status, body) = call(
        &router,
        post(
            "/register/service",
            Some(&key),
            json!({"name": "inventory-service", "revertible": true}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["param"], "revertTTL");

    let (status, body) = call(
        &router,
        post(
            "/register/service",
            Some(&key),
            json!({"name": "inventory-service", "revertible": true, "revertTTL": "1h"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["revertible"], true);
}

#[tokio::test]
async fn orchestration_submission_and_listing() {
    let (router, _engine) = test_router().await;
    let (_, key) = create_project(&router).await;
    call(
        &router,
        post(
            "/register/service",
            Some(&key),
            json!({"name": "inventory-service"}),
        ),
    )
    .await;

    let (status, body) = call(
        &router,
        post(
            "/orchestrations",
            Some(&key),
            json!({
                "action": {"type": "check", "content": "Check stock for PROD-1"},
                "data": [{"field": "productId", "value": "PROD-1"}],
                "webhook": "https://hooks.invalid/orra",
                "timeout": "30s",
                "healthCheckGracePeriod": "5m"
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let orchestration_id = body["id"].as_str().expect("orchestration id").to_string();

    // No service connection: the run parks in a non-terminal bucket.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    let (status, body) = call(&router, get("/orchestrations", Some(&key))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 1);
    let buckets = body["orchestrations"].as_object().expect("buckets");
    let non_terminal: usize = ["pending", "preparing", "processing", "paused"]
        .iter()
        .map(|b| buckets[*b].as_array().map(Vec::len).unwrap_or(0))
        .sum();
    assert_eq!(non_terminal, 1);

    let (status, body) = call(
        &router,
        get(
            &format!("/orchestrations/inspections/{orchestration_id}"),
            Some(&key),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["orchestration"]["id"], orchestration_id.as_str());
    assert!(body["tasks"].as_array().is_some());
    assert!(body["status_history"].as_array().is_some());
}

#[tokio::test]
async fn submission_without_webhook_is_rejected() {
    let (router, _engine) = test_router().await;
    let (_, key) = create_project(&router).await;
    let (status, body) = call(
        &router,
        post(
            "/orchestrations",
            Some(&key),
            json!({
                "action": {"content": "Check stock"},
                "data": [{"field": "productId", "value": "PROD-1"}]
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["param"], "webhook");
}

#[tokio::test]
async fn grounding_roundtrip() {
    let (router, _engine) = test_router().await;
    let (_, key) = create_project(&router).await;

    let (status, _) = call(
        &router,
        post(
            "/groundings",
            Some(&key),
            json!({"name": "inventory-domain", "useCases": ["stock checks"]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = call(&router, get("/groundings", Some(&key))).await;
    assert_eq!(status, StatusCode::OK);
    let groundings = body["groundings"].as_array().expect("groundings");
    assert_eq!(groundings.len(), 1);
    assert_eq!(groundings[0]["name"], "inventory-domain");

    let delete = Request::builder()
        .method("DELETE")
        .uri("/groundings/inventory-domain")
        .header(header::AUTHORIZATION, format!("Bearer {key}"))
        .body(Body::empty())
        .expect("request");
    let (status, _) = call(&router, delete).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = call(&router, get("/groundings", Some(&key))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["groundings"].as_array().expect("groundings").len(), 0);
}

#[tokio::test]
async fn compensation_registry_starts_empty_and_filters_validate() {
    let (router, _engine) = test_router().await;
    let (_, key) = create_project(&router).await;

    let (status, body) = call(&router, get("/compensations", Some(&key))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["compensations"].as_array().expect("list").len(), 0);

    let (status, body) = call(&router, get("/compensations?status=bogus", Some(&key))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "validation");

    let (status, body) = call(&router, get("/compensations/comp_missing", Some(&key))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["kind"], "not found");
}

#[tokio::test]
async fn additional_api_keys_authenticate() {
    let (router, _engine) = test_router().await;
    let (_, key) = create_project(&router).await;
    let (status, body) = call(&router, post("/apikeys", Some(&key), json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    let minted = body["apiKey"].as_str().expect("minted key").to_string();
    let (status, _) = call(&router, get("/services", Some(&minted))).await;
    assert_eq!(status, StatusCode::OK);
}
