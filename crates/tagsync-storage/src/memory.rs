use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tagsync_core::{Feedback, LabelSet, Record};
use tokio::sync::Mutex;

use crate::{RecordFilter, RecordPage, RecordStore, StoreError};

const DEFAULT_PAGE_SIZE: usize = 100;

/// A write the store received, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteCall {
    AddLabels { id: String, values: LabelSet },
    RemoveLabels { id: String, values: LabelSet },
    AddAnnotations { id: String, values: LabelSet },
    RemoveAnnotations { id: String, values: LabelSet },
    AddNote { id: String, text: String },
}

/// Process-local store used for fixtures and tests. Keeps insertion order so
/// pages are stable.
#[derive(Debug)]
pub struct InMemoryRecordStore {
    page_size: usize,
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    records: Vec<Record>,
    feedback: HashMap<String, Vec<Feedback>>,
    writes: Vec<WriteCall>,
}

impl MemoryState {
    fn record_mut(&mut self, id: &str) -> Result<&mut Record, StoreError> {
        self.records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }
}

impl Default for InMemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            state: Mutex::new(MemoryState::default()),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_records(records: Vec<Record>) -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            state: Mutex::new(MemoryState {
                records,
                ..MemoryState::default()
            }),
        }
    }

    /// Insert or replace by id.
    pub async fn insert(&self, record: Record) {
        let mut state = self.state.lock().await;
        match state.records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record,
            None => state.records.push(record),
        }
    }

    /// Delete a record out of band.
    pub async fn remove(&self, id: &str) -> Option<Record> {
        let mut state = self.state.lock().await;
        state.feedback.remove(id);
        let index = state.records.iter().position(|r| r.id == id)?;
        Some(state.records.remove(index))
    }

    /// Replace the feedback forms listed for a record.
    pub async fn set_feedback(&self, id: &str, feedback: Vec<Feedback>) {
        self.state
            .lock()
            .await
            .feedback
            .insert(id.to_string(), feedback);
    }

    pub async fn snapshot(&self, id: &str) -> Option<Record> {
        let state = self.state.lock().await;
        state.records.iter().find(|r| r.id == id).cloned()
    }

    pub async fn records(&self) -> Vec<Record> {
        self.state.lock().await.records.clone()
    }

    pub async fn writes(&self) -> Vec<WriteCall> {
        self.state.lock().await.writes.clone()
    }

    pub async fn clear_writes(&self) {
        self.state.lock().await.writes.clear();
    }

    /// Edit a record out of band, the way a human would through the store's UI.
    /// Label and annotation edits do not move the activity timestamp.
    pub async fn edit<F>(&self, id: &str, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Record),
    {
        let mut state = self.state.lock().await;
        f(state.record_mut(id)?);
        Ok(())
    }
}

/// Load a JSON array of records, as written by `serde_json` from `Record`.
pub fn load_records_json(path: &Path) -> anyhow::Result<Vec<Record>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading record fixture {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("parsing record fixture {}", path.display()))
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn fetch(&self, id: &str) -> Result<Record, StoreError> {
        let state = self.state.lock().await;
        state
            .records
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn fetch_page(
        &self,
        filter: &RecordFilter,
        cursor: Option<&str>,
    ) -> Result<RecordPage, StoreError> {
        let offset = match cursor {
            Some(raw) => raw
                .parse::<usize>()
                .map_err(|_| StoreError::Decode(format!("bad page cursor {raw:?}")))?,
            None => 0,
        };
        let state = self.state.lock().await;
        let matching: Vec<&Record> = state.records.iter().filter(|r| filter.matches(r)).collect();
        let end = (offset + self.page_size).min(matching.len());
        let records = matching
            .get(offset..end)
            .unwrap_or_default()
            .iter()
            .map(|r| (*r).clone())
            .collect();
        let next = (end < matching.len()).then(|| end.to_string());
        Ok(RecordPage { records, next })
    }

    async fn fetch_by_entity(&self, entity_id: &str) -> Result<Vec<Record>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .records
            .iter()
            .filter(|r| r.entity_id == entity_id)
            .cloned()
            .collect())
    }

    async fn fetch_feedback(&self, id: &str) -> Result<Vec<Feedback>, StoreError> {
        let state = self.state.lock().await;
        if !state.records.iter().any(|r| r.id == id) {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(state.feedback.get(id).cloned().unwrap_or_default())
    }

    async fn add_labels(&self, id: &str, labels: &LabelSet) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.record_mut(id)?.labels.extend(labels.iter().cloned());
        state.writes.push(WriteCall::AddLabels {
            id: id.to_string(),
            values: labels.clone(),
        });
        Ok(())
    }

    async fn remove_labels(&self, id: &str, labels: &LabelSet) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.record_mut(id)?.labels.retain(|l| !labels.contains(l));
        state.writes.push(WriteCall::RemoveLabels {
            id: id.to_string(),
            values: labels.clone(),
        });
        Ok(())
    }

    async fn add_annotations(&self, id: &str, annotations: &LabelSet) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state
            .record_mut(id)?
            .annotations
            .extend(annotations.iter().cloned());
        state.writes.push(WriteCall::AddAnnotations {
            id: id.to_string(),
            values: annotations.clone(),
        });
        Ok(())
    }

    async fn remove_annotations(
        &self,
        id: &str,
        annotations: &LabelSet,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state
            .record_mut(id)?
            .annotations
            .retain(|a| !annotations.contains(a));
        state.writes.push(WriteCall::RemoveAnnotations {
            id: id.to_string(),
            values: annotations.clone(),
        });
        Ok(())
    }

    async fn add_note(&self, id: &str, text: &str) -> Result<DateTime<Utc>, StoreError> {
        let mut state = self.state.lock().await;
        let record = state.record_mut(id)?;
        // strictly after the previous activity, even within one clock tick
        let at = Utc::now().max(record.last_external_activity + Duration::milliseconds(1));
        record.last_external_activity = at;
        state.writes.push(WriteCall::AddNote {
            id: id.to_string(),
            text: text.to_string(),
        });
        Ok(at)
    }
}
