use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use orra_types::Result;

use crate::keys::{idempotency_entry_key, idempotency_prefix};
use crate::kv::{tx_get_raw, tx_put_raw, KvStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyState {
    InProgress,
    Completed,
    Aborted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyEntry {
    pub execution_id: String,
    pub state: IdempotencyState,
    /// Full wire result, returned verbatim on duplicate delivery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub expires_at: DateTime<Utc>,
}

/// Outcome of claiming an idempotency key for execution.
#[derive(Debug, Clone)]
pub enum BeginOutcome {
    /// First sighting; the caller should execute.
    Fresh,
    /// Another execution holds the key and has not finished.
    InProgress { execution_id: String },
    /// The key already finished; the stored result must be replayed verbatim.
    Finished { entry: IdempotencyEntry },
}

/// Execution dedup keyed by `(service_id, idempotency_key)`. Entries are
/// retained for 24 hours past completion.
#[derive(Clone)]
pub struct IdempotencyStore {
    kv: KvStore,
    retention_ms: u64,
}

impl IdempotencyStore {
    pub fn new(kv: KvStore, retention_ms: u64) -> Self {
        Self { kv, retention_ms }
    }

    fn retention(&self) -> Duration {
        Duration::milliseconds(self.retention_ms as i64)
    }

    /// Claim the key for `execution_id`. The check-and-claim is one
    /// transaction, so concurrent duplicates observe each other.
    pub async fn begin(
        &self,
        service_id: &str,
        idempotency_key: &str,
        execution_id: &str,
    ) -> Result<BeginOutcome> {
        let key = idempotency_entry_key(service_id, idempotency_key);
        let fresh = IdempotencyEntry {
            execution_id: execution_id.to_string(),
            state: IdempotencyState::InProgress,
            result: None,
            expires_at: Utc::now() + self.retention(),
        };
        self.kv
            .with_conn(move |tx| {
                let now = Utc::now();
                let existing: Option<IdempotencyEntry> = match tx_get_raw(tx, &key)? {
                    Some(raw) => serde_json::from_str(&raw).ok(),
                    None => None,
                };
                if let Some(entry) = existing.filter(|e| e.expires_at > now) {
                    return Ok(match entry.state {
                        IdempotencyState::InProgress => BeginOutcome::InProgress {
                            execution_id: entry.execution_id,
                        },
                        IdempotencyState::Completed | IdempotencyState::Aborted => {
                            BeginOutcome::Finished { entry }
                        }
                    });
                }
                let raw = serde_json::to_string(&fresh)
                    .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
                tx_put_raw(tx, &key, &raw)?;
                Ok(BeginOutcome::Fresh)
            })
            .await
    }

    /// Record a terminal outcome for the key. The 24 h retention clock starts
    /// here.
    pub async fn finish(
        &self,
        service_id: &str,
        idempotency_key: &str,
        execution_id: &str,
        state: IdempotencyState,
        result: Value,
    ) -> Result<()> {
        let entry = IdempotencyEntry {
            execution_id: execution_id.to_string(),
            state,
            result: Some(result),
            expires_at: Utc::now() + self.retention(),
        };
        self.kv
            .put(&idempotency_entry_key(service_id, idempotency_key), &entry)
            .await
    }

    pub async fn get(
        &self,
        service_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<IdempotencyEntry>> {
        let entry: Option<IdempotencyEntry> = self
            .kv
            .get(&idempotency_entry_key(service_id, idempotency_key))
            .await?;
        Ok(entry.filter(|e| e.expires_at > Utc::now()))
    }

    /// Drop expired entries; returns how many were removed.
    pub async fn sweep_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let entries: Vec<(String, IdempotencyEntry)> =
            self.kv.list_prefix(idempotency_prefix()).await?;
        let mut removed = 0;
        for (key, entry) in entries {
            if entry.expires_at <= now && self.kv.delete(&key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
