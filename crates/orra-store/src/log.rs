use chrono::Utc;
use serde_json::Value;

use orra_types::{LogEntry, LogEntryKind, OrraError, Result};

use crate::keys::{log_key, log_prefix};
use crate::kv::{tx_last_key, tx_put_raw, KvStore};

/// Append-only log, one sequence per orchestration. The log is the single
/// source of truth for rebuilding orchestration state after restart.
#[derive(Clone)]
pub struct LogStore {
    kv: KvStore,
}

impl LogStore {
    pub fn new(kv: KvStore) -> Self {
        Self { kv }
    }

    /// Append one entry. Offset allocation and the write happen in a single
    /// transaction, so offsets are strictly monotone and gap-free.
    pub async fn append(
        &self,
        orchestration_id: &str,
        kind: LogEntryKind,
        task_id: &str,
        payload: Value,
    ) -> Result<LogEntry> {
        let mut entry = LogEntry {
            offset: 0,
            timestamp: Utc::now(),
            kind,
            task_id: task_id.to_string(),
            payload,
        };
        let prefix = log_prefix(orchestration_id);
        let oid = orchestration_id.to_string();
        let entry = self
            .kv
            .with_conn(move |tx| {
                let next = match tx_last_key(tx, &prefix)? {
                    Some(last) => {
                        let tail = last.rsplit('/').next().unwrap_or("0");
                        tail.parse::<u64>().unwrap_or(0) + 1
                    }
                    None => 0,
                };
                entry.offset = next;
                let raw = serde_json::to_string(&entry)
                    .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
                tx_put_raw(tx, &log_key(&oid, next), &raw)?;
                Ok(entry)
            })
            .await?;
        tracing::trace!(
            target: "orra.store",
            orchestration_id,
            offset = entry.offset,
            kind = entry.kind.as_str(),
            "log append"
        );
        Ok(entry)
    }

    /// Every entry for an orchestration, in offset order.
    pub async fn read(&self, orchestration_id: &str) -> Result<Vec<LogEntry>> {
        let entries: Vec<(String, LogEntry)> = self
            .kv
            .list_prefix(&log_prefix(orchestration_id))
            .await?;
        let out: Vec<LogEntry> = entries.into_iter().map(|(_, e)| e).collect();
        // Key order equals offset order by construction; verify anyway.
        for window in out.windows(2) {
            if window[1].offset <= window[0].offset {
                return Err(OrraError::Store(format!(
                    "log for {orchestration_id} is not monotone at offset {}",
                    window[1].offset
                )));
            }
        }
        Ok(out)
    }
}
