use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::Client;
use serde_json::Value;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use orra_types::new_event_id;
use orra_wire::{WebhookEvent, HEADER_EVENT, USER_AGENT};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
struct WebhookJob {
    url: String,
    event: WebhookEvent,
}

/// At-least-once webhook delivery. Events are minted once (stable
/// `event_id`) and retried with exponential backoff; recipients dedupe.
#[derive(Clone)]
pub struct WebhookNotifier {
    tx: mpsc::UnboundedSender<WebhookJob>,
}

impl WebhookNotifier {
    /// Start the delivery loop. Jobs fan out through a bounded worker pool.
    pub fn start(
        max_attempts: u32,
        workers: usize,
        shutdown: CancellationToken,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<WebhookJob>();
        let handle = tokio::spawn(async move {
            let client = Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .user_agent(USER_AGENT)
                .build()
                .unwrap_or_default();
            let permits = Arc::new(Semaphore::new(workers.max(1)));
            loop {
                let job = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    job = rx.recv() => match job {
                        Some(job) => job,
                        None => break,
                    },
                };
                let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                    break;
                };
                let client = client.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    deliver(&client, &job, max_attempts).await;
                });
            }
        });
        (Self { tx }, handle)
    }

    /// Enqueue one event for one endpoint. The event id is fixed here and
    /// survives every retry.
    pub fn notify(
        &self,
        url: &str,
        event_type: &str,
        orchestration_id: &str,
        project_id: &str,
        payload: Value,
    ) {
        let event = WebhookEvent {
            event_id: new_event_id(),
            event_type: event_type.to_string(),
            orchestration_id: orchestration_id.to_string(),
            project_id: project_id.to_string(),
            timestamp: Utc::now(),
            payload,
        };
        if self
            .tx
            .send(WebhookJob {
                url: url.to_string(),
                event,
            })
            .is_err()
        {
            tracing::warn!(target: "orra.webhook", url, "webhook queue closed; event dropped");
        }
    }
}

async fn deliver(client: &Client, job: &WebhookJob, max_attempts: u32) {
    for attempt in 1..=max_attempts {
        let result = client
            .post(&job.url)
            .header(HEADER_EVENT, &job.event.event_type)
            .json(&job.event)
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(
                    target: "orra.webhook",
                    url = %job.url,
                    event_id = %job.event.event_id,
                    attempt,
                    "webhook delivered"
                );
                return;
            }
            Ok(response) => {
                tracing::warn!(
                    target: "orra.webhook",
                    url = %job.url,
                    status = %response.status(),
                    attempt,
                    "webhook delivery rejected"
                );
            }
            Err(err) => {
                tracing::warn!(
                    target: "orra.webhook",
                    url = %job.url,
                    error = %err,
                    attempt,
                    "webhook delivery failed"
                );
            }
        }
        if attempt < max_attempts {
            tokio::time::sleep(backoff_delay(attempt)).await;
        }
    }
    tracing::error!(
        target: "orra.webhook",
        url = %job.url,
        event_id = %job.event.event_id,
        "webhook delivery exhausted retries"
    );
}

fn backoff_delay(attempt: u32) -> Duration {
    let exp = Duration::from_secs(1 << (attempt - 1).min(5));
    exp.min(Duration::from_secs(30))
}
