use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use orra_core::WebhookNotifier;

#[derive(Clone)]
struct Capture {
    requests: Arc<Mutex<Vec<(String, String, Value)>>>,
    failures_left: Arc<AtomicU32>,
}

async fn hook(
    State(capture): State<Capture>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> StatusCode {
    let event_header = headers
        .get("X-Orra-Event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let user_agent = headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    capture
        .requests
        .lock()
        .await
        .push((event_header, user_agent, body));
    // Fail while the failure budget lasts, then accept.
    let failing = capture
        .failures_left
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if failing {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    }
}

async fn capture_server(failures: u32) -> (String, Capture) {
    let capture = Capture {
        requests: Arc::new(Mutex::new(Vec::new())),
        failures_left: Arc::new(AtomicU32::new(failures)),
    };
    let router = Router::new()
        .route("/hook", post(hook))
        .with_state(capture.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    (format!("http://{addr}/hook"), capture)
}

async fn wait_for_requests(capture: &Capture, count: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if capture.requests.lock().await.len() >= count {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {count} webhook deliveries"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn delivers_with_contract_headers() {
    let (url, capture) = capture_server(0).await;
    let (notifier, _handle) = WebhookNotifier::start(3, 2, CancellationToken::new());
    notifier.notify(
        &url,
        "orchestration.completed",
        "o_1",
        "p_1",
        json!({"results": {"task1": {"ok": true}}}),
    );
    wait_for_requests(&capture, 1).await;

    let requests = capture.requests.lock().await;
    let (event_header, user_agent, body) = &requests[0];
    assert_eq!(event_header, "orchestration.completed");
    assert_eq!(user_agent, "orra/1.0");
    assert_eq!(body["eventType"], "orchestration.completed");
    assert_eq!(body["orchestrationId"], "o_1");
    assert_eq!(body["projectId"], "p_1");
    assert!(body["eventId"].as_str().unwrap_or_default().starts_with("evt_"));
}

#[tokio::test]
async fn retries_preserve_the_event_id() {
    let (url, capture) = capture_server(1).await;
    let (notifier, _handle) = WebhookNotifier::start(3, 2, CancellationToken::new());
    notifier.notify(
        &url,
        "compensation.failed",
        "o_2",
        "p_1",
        json!({"compensationId": "comp_1"}),
    );
    // First attempt is rejected; the retry carries the identical payload.
    wait_for_requests(&capture, 2).await;

    let requests = capture.requests.lock().await;
    assert_eq!(requests.len(), 2);
    let first_id = requests[0].2["eventId"].as_str().unwrap_or_default();
    let second_id = requests[1].2["eventId"].as_str().unwrap_or_default();
    assert!(!first_id.is_empty());
    assert_eq!(first_id, second_id);
}
