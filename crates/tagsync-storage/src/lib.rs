//! Record store boundary: the `RecordStore` contract, its HTTP and in-memory
//! implementations, and the helper that routes label/annotation writes through
//! a record's mutation queue.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use tagsync_core::{Feedback, LabelSet, Record, WorkingRecord};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

mod http;
mod memory;

pub use http::{HttpRecordStore, HttpStoreConfig};
pub use memory::{load_records_json, InMemoryRecordStore, WriteCall};

pub const CRATE_NAME: &str = "tagsync-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request failed after retries: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("record {0} not found")]
    NotFound(String),
    #[error("malformed store response: {0}")]
    Decode(String),
}

/// Which part of the collection a pass walks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    /// `Some(false)`: active only, `Some(true)`: archived only, `None`: both.
    pub archived: Option<bool>,
}

impl RecordFilter {
    pub fn active() -> Self {
        Self {
            archived: Some(false),
        }
    }

    pub fn matches(&self, record: &Record) -> bool {
        self.archived.map_or(true, |archived| archived == record.archived)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecordPage {
    pub records: Vec<Record>,
    /// Cursor for the following page, `None` on the last page.
    pub next: Option<String>,
}

/// Remote, eventually consistent record store. Every write is idempotent on
/// the store side.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn fetch(&self, id: &str) -> Result<Record, StoreError>;

    async fn fetch_page(
        &self,
        filter: &RecordFilter,
        cursor: Option<&str>,
    ) -> Result<RecordPage, StoreError>;

    async fn fetch_by_entity(&self, entity_id: &str) -> Result<Vec<Record>, StoreError>;

    /// Completed feedback forms attached to a record.
    async fn fetch_feedback(&self, id: &str) -> Result<Vec<Feedback>, StoreError>;

    async fn add_labels(&self, id: &str, labels: &LabelSet) -> Result<(), StoreError>;

    async fn remove_labels(&self, id: &str, labels: &LabelSet) -> Result<(), StoreError>;

    async fn add_annotations(&self, id: &str, annotations: &LabelSet) -> Result<(), StoreError>;

    async fn remove_annotations(
        &self,
        id: &str,
        annotations: &LabelSet,
    ) -> Result<(), StoreError>;

    /// Append a note; the store bumps the record's activity timestamp, which is returned.
    async fn add_note(&self, id: &str, text: &str) -> Result<DateTime<Utc>, StoreError>;
}

/// Applies label and annotation changes to a working record: queued while the
/// record is batching, sent straight to the store otherwise.
pub struct Mutator<'a> {
    store: &'a dyn RecordStore,
}

impl<'a> Mutator<'a> {
    pub fn new(store: &'a dyn RecordStore) -> Self {
        Self { store }
    }

    pub async fn add_labels(
        &self,
        working: &mut WorkingRecord,
        labels: LabelSet,
    ) -> Result<(), StoreError> {
        if working.queue.is_batching() {
            working.queue.labels.add(labels);
            return Ok(());
        }
        let missing: LabelSet = labels.difference(&working.record.labels).cloned().collect();
        if missing.is_empty() {
            return Ok(());
        }
        self.store.add_labels(working.id(), &missing).await?;
        working.record.labels.extend(missing);
        Ok(())
    }

    pub async fn remove_labels(
        &self,
        working: &mut WorkingRecord,
        labels: LabelSet,
    ) -> Result<(), StoreError> {
        if working.queue.is_batching() {
            working.queue.labels.remove(labels);
            return Ok(());
        }
        let present: LabelSet = labels.intersection(&working.record.labels).cloned().collect();
        if present.is_empty() {
            return Ok(());
        }
        self.store.remove_labels(working.id(), &present).await?;
        working.record.labels.retain(|l| !present.contains(l));
        Ok(())
    }

    pub async fn add_annotations(
        &self,
        working: &mut WorkingRecord,
        annotations: LabelSet,
    ) -> Result<(), StoreError> {
        if working.queue.is_batching() {
            working.queue.annotations.add(annotations);
            return Ok(());
        }
        let missing: LabelSet = annotations
            .difference(&working.record.annotations)
            .cloned()
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        self.store.add_annotations(working.id(), &missing).await?;
        working.record.annotations.extend(missing);
        Ok(())
    }

    pub async fn remove_annotations(
        &self,
        working: &mut WorkingRecord,
        annotations: LabelSet,
    ) -> Result<(), StoreError> {
        if working.queue.is_batching() {
            working.queue.annotations.remove(annotations);
            return Ok(());
        }
        let present: LabelSet = annotations
            .intersection(&working.record.annotations)
            .cloned()
            .collect();
        if present.is_empty() {
            return Ok(());
        }
        self.store.remove_annotations(working.id(), &present).await?;
        working.record.annotations.retain(|a| !present.contains(a));
        Ok(())
    }

    /// Notes are never batched.
    pub async fn add_note(&self, working: &mut WorkingRecord, text: &str) -> Result<(), StoreError> {
        let at = self.store.add_note(working.id(), text).await?;
        working.record_self_touch(at);
        Ok(())
    }

    /// Send the queued diff: at most one call per operation kind. Returns
    /// whether any call was made.
    pub async fn commit(&self, working: &mut WorkingRecord) -> Result<bool, StoreError> {
        let plan = working
            .queue
            .take_plan(&working.record.labels, &working.record.annotations);
        if plan.is_empty() {
            return Ok(false);
        }
        debug!(record_id = %working.id(), ?plan, "committing queued mutations");

        let id = working.id().clone();
        if !plan.add_labels.is_empty() {
            self.store.add_labels(&id, &plan.add_labels).await?;
            working.record.labels.extend(plan.add_labels);
        }
        if !plan.remove_labels.is_empty() {
            self.store.remove_labels(&id, &plan.remove_labels).await?;
            working.record.labels.retain(|l| !plan.remove_labels.contains(l));
        }
        if !plan.add_annotations.is_empty() {
            self.store.add_annotations(&id, &plan.add_annotations).await?;
            working.record.annotations.extend(plan.add_annotations);
        }
        if !plan.remove_annotations.is_empty() {
            self.store.remove_annotations(&id, &plan.remove_annotations).await?;
            working
                .record
                .annotations
                .retain(|a| !plan.remove_annotations.contains(a));
        }
        Ok(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            token_bucket: Some(TokenBucketConfig {
                capacity: 10,
                refill_every: Duration::from_millis(100),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

/// Client-side rate limit for store calls.
#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(id: &str, labels: &[&str]) -> Record {
        Record::new(id, "c-1", Utc.timestamp_opt(1_700_000_000, 0).single().unwrap())
            .with_labels(labels.iter().copied())
    }

    fn set(values: &[&str]) -> LabelSet {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn gateway_errors_are_retryable() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
    }

    #[tokio::test]
    async fn commit_sends_one_call_per_kind() {
        let store = InMemoryRecordStore::new();
        store.insert(record("r1", &["keep", "drop"])).await;
        let mut working = WorkingRecord::new(store.fetch("r1").await.unwrap());
        let mutator = Mutator::new(&store);

        {
            let _batch = working.queue.begin_batch();
            mutator.add_labels(&mut working, set(&["a", "b"])).await.unwrap();
            mutator.remove_labels(&mut working, set(&["drop", "missing"])).await.unwrap();
            mutator.add_labels(&mut working, set(&["keep"])).await.unwrap();
        }
        assert!(store.writes().await.is_empty());

        assert!(mutator.commit(&mut working).await.unwrap());
        assert_eq!(
            store.writes().await,
            vec![
                WriteCall::AddLabels {
                    id: "r1".into(),
                    values: set(&["a", "b"]),
                },
                WriteCall::RemoveLabels {
                    id: "r1".into(),
                    values: set(&["drop"]),
                },
            ]
        );
        assert_eq!(working.record.labels, set(&["a", "b", "keep"]));
        assert!(!mutator.commit(&mut working).await.unwrap());
    }

    #[tokio::test]
    async fn unbatched_writes_go_straight_to_the_store() {
        let store = InMemoryRecordStore::new();
        store.insert(record("r1", &["x"])).await;
        let mut working = WorkingRecord::new(store.fetch("r1").await.unwrap());
        let mutator = Mutator::new(&store);

        mutator.add_labels(&mut working, set(&["x", "y"])).await.unwrap();
        mutator.add_labels(&mut working, set(&["y"])).await.unwrap();

        assert_eq!(
            store.writes().await,
            vec![WriteCall::AddLabels {
                id: "r1".into(),
                values: set(&["y"]),
            }]
        );
        assert_eq!(store.snapshot("r1").await.unwrap().labels, set(&["x", "y"]));
    }

    #[tokio::test]
    async fn notes_mark_the_record_as_self_touched() {
        let store = InMemoryRecordStore::new();
        store.insert(record("r1", &[])).await;
        let mut working = WorkingRecord::new(store.fetch("r1").await.unwrap());

        Mutator::new(&store).add_note(&mut working, "hello").await.unwrap();

        let touched = working.self_touched_at().expect("self touch");
        assert_eq!(store.snapshot("r1").await.unwrap().last_external_activity, touched);
    }
}
