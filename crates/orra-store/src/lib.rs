mod idempotency;
pub mod keys;
mod kv;
mod log;

pub use idempotency::{BeginOutcome, IdempotencyEntry, IdempotencyState, IdempotencyStore};
pub use kv::KvStore;
pub use log::LogStore;
