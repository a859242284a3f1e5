use axum::extract::{Path, Query, Request, State};
use axum::http::header;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Extension, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};

use orra_core::{RegistrationSpec, SubmitRequest};
use orra_store::keys;
use orra_types::{
    ActionParam, CompensationStatus, Orchestration, OrraError, Project, ResolutionState,
    ServiceKind, ServiceSchema,
};

use crate::ws::ws_handler;
use crate::{parse_duration_ms, ApiError, ApiResult, AppState};

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let authed = Router::new()
        .route("/apikeys", post(mint_api_key))
        .route("/webhooks", post(add_webhook))
        .route(
            "/compensation-failure-webhooks",
            post(add_compensation_failure_webhook),
        )
        .route("/register/service", post(register_service))
        .route("/register/agent", post(register_agent))
        .route("/services", get(list_services))
        .route("/orchestrations", post(submit_orchestration).get(list_orchestrations))
        .route("/orchestrations/inspections/{id}", get(inspect_orchestration))
        .route("/groundings", post(add_grounding).get(list_groundings))
        .route("/groundings/{name}", delete(remove_grounding))
        .route("/compensations", get(list_compensations))
        .route("/compensations/{id}", get(get_compensation))
        .route("/compensations/{id}/resolve", post(resolve_compensation))
        .route("/compensations/{id}/ignore", post(ignore_compensation))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_project,
        ));

    Router::new()
        .route("/register/project", post(register_project))
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .merge(authed)
        .layer(cors)
        .with_state(state)
}

/// Bearer-key authentication; resolves the project and stashes it as a
/// request extension for the handlers.
async fn require_project(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let key = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string);
    let Some(key) = key else {
        return ApiError(OrraError::Unauthorized("missing API key".into())).into_response();
    };
    match state.engine.projects.authenticate(&key).await {
        Ok(project) => {
            request.extensions_mut().insert(project);
            next.run(request).await
        }
        Err(err) => ApiError(err).into_response(),
    }
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let reconnect = state.engine.config.reconnect_policy();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSeconds": state.started_at.elapsed().as_secs(),
        "reconnect": {
            "maxAttempts": reconnect.max_attempts,
            "initialBackoffMs": reconnect.initial_backoff.as_millis() as u64,
            "maxBackoffMs": reconnect.max_backoff.as_millis() as u64,
        },
    }))
}

async fn register_project(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let project = state.engine.projects.create().await?;
    Ok(Json(json!({
        "id": project.id,
        "apiKey": project.api_key,
        "createdAt": project.created_at,
    })))
}

async fn mint_api_key(
    State(state): State<AppState>,
    Extension(project): Extension<Project>,
) -> ApiResult<Json<Value>> {
    let key = state.engine.projects.mint_additional_key(&project.id).await?;
    Ok(Json(json!({"apiKey": key})))
}

#[derive(Debug, Deserialize)]
struct WebhookInput {
    url: String,
}

async fn add_webhook(
    State(state): State<AppState>,
    Extension(project): Extension<Project>,
    Json(input): Json<WebhookInput>,
) -> ApiResult<Json<Value>> {
    let project = state
        .engine
        .projects
        .add_webhook(&project.id, &input.url)
        .await?;
    Ok(Json(json!({"webhooks": project.webhooks})))
}

async fn add_compensation_failure_webhook(
    State(state): State<AppState>,
    Extension(project): Extension<Project>,
    Json(input): Json<WebhookInput>,
) -> ApiResult<Json<Value>> {
    let project = state
        .engine
        .projects
        .add_compensation_failure_webhook(&project.id, &input.url)
        .await?;
    Ok(Json(
        json!({"compensationFailureWebhooks": project.compensation_failure_webhooks}),
    ))
}

#[derive(Debug, Deserialize)]
struct RegisterServiceInput {
    #[serde(default)]
    id: Option<String>,
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    schema: ServiceSchema,
    #[serde(default)]
    revertible: bool,
    #[serde(default, rename = "revertTTL")]
    revert_ttl: Value,
    /// Client-side version hints are accepted but the registry is the
    /// authority on version numbers.
    #[serde(default)]
    #[allow(dead_code)]
    version: Option<u64>,
}

async fn register(
    state: &AppState,
    project: &Project,
    kind: ServiceKind,
    input: RegisterServiceInput,
) -> ApiResult<Json<Value>> {
    let revert_ttl_ms = parse_duration_ms(&input.revert_ttl)?;
    let record = state
        .engine
        .registry
        .register(
            &project.id,
            kind,
            RegistrationSpec {
                id: input.id,
                name: input.name,
                description: input.description,
                schema: input.schema,
                revertible: input.revertible,
                revert_ttl_ms,
            },
        )
        .await?;
    Ok(Json(json!({
        "id": record.id,
        "name": record.name,
        "kind": record.kind,
        "version": record.version,
        "revertible": record.revertible,
    })))
}

async fn register_service(
    State(state): State<AppState>,
    Extension(project): Extension<Project>,
    Json(input): Json<RegisterServiceInput>,
) -> ApiResult<Json<Value>> {
    register(&state, &project, ServiceKind::Service, input).await
}

async fn register_agent(
    State(state): State<AppState>,
    Extension(project): Extension<Project>,
    Json(input): Json<RegisterServiceInput>,
) -> ApiResult<Json<Value>> {
    register(&state, &project, ServiceKind::Agent, input).await
}

async fn list_services(
    State(state): State<AppState>,
    Extension(project): Extension<Project>,
) -> ApiResult<Json<Value>> {
    let services = state.engine.registry.list(&project.id).await?;
    Ok(Json(json!({"services": services})))
}

#[derive(Debug, Deserialize)]
struct ActionInput {
    #[serde(default, rename = "type")]
    #[allow(dead_code)]
    kind: Option<String>,
    content: String,
}

#[derive(Debug, Deserialize)]
struct OrchestrationInput {
    action: ActionInput,
    #[serde(default)]
    data: Vec<ActionParam>,
    #[serde(default)]
    webhook: String,
    #[serde(default)]
    timeout: Value,
    #[serde(default, rename = "healthCheckGracePeriod")]
    health_check_grace_period: Value,
}

async fn submit_orchestration(
    State(state): State<AppState>,
    Extension(project): Extension<Project>,
    Json(input): Json<OrchestrationInput>,
) -> ApiResult<Json<Value>> {
    let orchestration = state
        .engine
        .orchestrator
        .submit(
            &project,
            SubmitRequest {
                action: input.action.content,
                params: input.data,
                webhook: input.webhook,
                timeout_ms: parse_duration_ms(&input.timeout)?,
                health_grace_period_ms: parse_duration_ms(&input.health_check_grace_period)?,
            },
        )
        .await?;
    Ok(Json(json!({
        "id": orchestration.id,
        "status": orchestration.status,
        "createdAt": orchestration.created_at,
    })))
}

fn orchestration_summary(orchestration: &Orchestration) -> Value {
    json!({
        "id": orchestration.id,
        "action": orchestration.action,
        "status": orchestration.status,
        "createdAt": orchestration.created_at,
        "error": orchestration.error,
        "compensation": orchestration.compensation,
    })
}

async fn list_orchestrations(
    State(state): State<AppState>,
    Extension(project): Extension<Project>,
) -> ApiResult<Json<Value>> {
    let orchestrations = state.engine.orchestrator.list(&project.id).await?;
    let mut buckets: serde_json::Map<String, Value> = serde_json::Map::new();
    for status in [
        "pending",
        "preparing",
        "processing",
        "paused",
        "completed",
        "failed",
        "not_actionable",
    ] {
        buckets.insert(status.to_string(), json!([]));
    }
    for orchestration in &orchestrations {
        let bucket = buckets
            .entry(orchestration.status.as_str().to_string())
            .or_insert_with(|| json!([]));
        if let Some(list) = bucket.as_array_mut() {
            list.push(orchestration_summary(orchestration));
        }
    }
    let counts: serde_json::Map<String, Value> = buckets
        .iter()
        .map(|(status, list)| {
            (
                status.clone(),
                json!(list.as_array().map(Vec::len).unwrap_or(0)),
            )
        })
        .collect();
    Ok(Json(json!({
        "total": orchestrations.len(),
        "counts": counts,
        "orchestrations": buckets,
    })))
}

async fn inspect_orchestration(
    State(state): State<AppState>,
    Extension(project): Extension<Project>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let inspection = state.engine.orchestrator.inspect(&project.id, &id).await?;
    Ok(Json(serde_json::to_value(inspection).map_err(OrraError::from)?))
}

#[derive(Debug, Deserialize)]
struct GroundingInput {
    name: String,
    #[serde(flatten)]
    rest: serde_json::Map<String, Value>,
}

async fn add_grounding(
    State(state): State<AppState>,
    Extension(project): Extension<Project>,
    Json(input): Json<GroundingInput>,
) -> ApiResult<Json<Value>> {
    if input.name.trim().is_empty() {
        return Err(OrraError::validation_param("name", "grounding name is required").into());
    }
    let mut body = input.rest;
    body.insert("name".into(), json!(input.name));
    state
        .engine
        .kv
        .put(&keys::grounding_key(&project.id, &input.name), &body)
        .await?;
    Ok(Json(json!({"name": input.name})))
}

async fn list_groundings(
    State(state): State<AppState>,
    Extension(project): Extension<Project>,
) -> ApiResult<Json<Value>> {
    let groundings: Vec<(String, Value)> = state
        .engine
        .kv
        .list_prefix(&keys::grounding_prefix(&project.id))
        .await?;
    Ok(Json(json!({
        "groundings": groundings.into_iter().map(|(_, g)| g).collect::<Vec<_>>(),
    })))
}

async fn remove_grounding(
    State(state): State<AppState>,
    Extension(project): Extension<Project>,
    Path(name): Path<String>,
) -> ApiResult<Json<Value>> {
    let removed = state
        .engine
        .kv
        .delete(&keys::grounding_key(&project.id, &name))
        .await?;
    if !removed {
        return Err(OrraError::NotFound(format!("grounding {name}")).into());
    }
    Ok(Json(json!({"removed": name})))
}

#[derive(Debug, Deserialize)]
struct CompensationFilter {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    resolution: Option<String>,
}

async fn list_compensations(
    State(state): State<AppState>,
    Extension(project): Extension<Project>,
    Query(filter): Query<CompensationFilter>,
) -> ApiResult<Json<Value>> {
    let status = match filter.status.as_deref() {
        Some(raw) => Some(
            serde_json::from_value::<CompensationStatus>(json!(raw))
                .map_err(|_| OrraError::validation_param("status", format!("unknown status {raw:?}")))?,
        ),
        None => None,
    };
    let resolution = match filter.resolution.as_deref() {
        Some(raw) => Some(
            serde_json::from_value::<ResolutionState>(json!(raw)).map_err(|_| {
                OrraError::validation_param("resolution", format!("unknown resolution {raw:?}"))
            })?,
        ),
        None => None,
    };
    let records = state
        .engine
        .compensations
        .list_unresolved(&project.id, status, resolution)
        .await?;
    Ok(Json(json!({"compensations": records})))
}

async fn get_compensation(
    State(state): State<AppState>,
    Extension(project): Extension<Project>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let record = state.engine.compensations.get(&project.id, &id).await?;
    Ok(Json(serde_json::to_value(record).map_err(OrraError::from)?))
}

#[derive(Debug, Deserialize)]
struct ResolutionInput {
    reason: String,
}

async fn resolve_compensation(
    State(state): State<AppState>,
    Extension(project): Extension<Project>,
    Path(id): Path<String>,
    Json(input): Json<ResolutionInput>,
) -> ApiResult<Json<Value>> {
    let record = state
        .engine
        .compensations
        .resolve(&project.id, &id, &input.reason)
        .await?;
    Ok(Json(serde_json::to_value(record).map_err(OrraError::from)?))
}

async fn ignore_compensation(
    State(state): State<AppState>,
    Extension(project): Extension<Project>,
    Path(id): Path<String>,
    Json(input): Json<ResolutionInput>,
) -> ApiResult<Json<Value>> {
    let record = state
        .engine
        .compensations
        .ignore(&project.id, &id, &input.reason)
        .await?;
    Ok(Json(serde_json::to_value(record).map_err(OrraError::from)?))
}
