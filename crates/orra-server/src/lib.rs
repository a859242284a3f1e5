use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::Value;

use orra_core::Engine;
use orra_types::OrraError;
use orra_wire::ApiErrorBody;

mod http;
mod ws;

pub use http::build_router;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            started_at: Instant::now(),
        }
    }
}

/// `OrraError` carried across handler boundaries and rendered as the wire
/// error body `{error: {kind, param?, message}}`.
pub struct ApiError(pub OrraError);

impl From<OrraError> for ApiError {
    fn from(err: OrraError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            OrraError::Validation { .. } => StatusCode::BAD_REQUEST,
            OrraError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            OrraError::NotFound(_) => StatusCode::NOT_FOUND,
            OrraError::InvalidOperation(_) | OrraError::NotActionable(_) => StatusCode::CONFLICT,
            OrraError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(target: "orra.server", error = %self.0, "internal error");
        }
        (status, Json(ApiErrorBody::from(&self.0))).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Accepts durations as integer seconds or `<n>(ms|s|m|h)` strings; returns
/// milliseconds.
pub fn parse_duration_ms(value: &Value) -> Result<Option<u64>, OrraError> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => n
            .as_u64()
            .map(|secs| Some(secs * 1000))
            .ok_or_else(|| OrraError::validation("duration must be a non-negative integer")),
        Value::String(raw) => {
            let raw = raw.trim();
            let (digits, unit): (&str, &str) = match raw.find(|c: char| !c.is_ascii_digit()) {
                Some(idx) => (&raw[..idx], raw[idx..].trim()),
                None => (raw, "s"),
            };
            let amount: u64 = digits
                .parse()
                .map_err(|_| OrraError::validation(format!("invalid duration {raw:?}")))?;
            let ms = match unit {
                "ms" => amount,
                "s" => amount * 1000,
                "m" => amount * 60 * 1000,
                "h" => amount * 60 * 60 * 1000,
                _ => {
                    return Err(OrraError::validation(format!(
                        "invalid duration unit in {raw:?}"
                    )))
                }
            };
            Ok(Some(ms))
        }
        _ => Err(OrraError::validation("duration must be a number or string")),
    }
}

/// Serve the control API and service channel until the engine shuts down.
pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let shutdown = state.engine.shutdown_token();
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(target: "orra.server", %addr, "control API listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn durations_parse_numbers_and_strings() {
        assert_eq!(parse_duration_ms(&json!(30)).unwrap(), Some(30_000));
        assert_eq!(parse_duration_ms(&json!("45s")).unwrap(), Some(45_000));
        assert_eq!(parse_duration_ms(&json!("250ms")).unwrap(), Some(250));
        assert_eq!(parse_duration_ms(&json!("5m")).unwrap(), Some(300_000));
        assert_eq!(parse_duration_ms(&json!("1h")).unwrap(), Some(3_600_000));
        assert_eq!(parse_duration_ms(&Value::Null).unwrap(), None);
        assert!(parse_duration_ms(&json!("5 fortnights")).is_err());
        assert!(parse_duration_ms(&json!(true)).is_err());
    }
}
