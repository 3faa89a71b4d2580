//! Best-effort change notifications.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tagsync_core::{
    legacy, BucketClass, Change, WorkingRecord, AUTO_LABEL_PREFIX, BOT_ANNOTATION_PREFIX,
};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;

pub const EVENT_RECORD_CHANGED: &str = "record_changed";

/// A change is owed a notification only if it is later than the last
/// notified change by more than this.
pub const NOTIFY_SLACK_MS: i64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadShape {
    Minimal,
    Full,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub url: String,
    pub shape: PayloadShape,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    pub triggered_at: i64,
    pub event: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct MinimalView<'a> {
    candidate_id: &'a str,
    contact_id: &'a str,
    opportunity_id: &'a str,
}

/// Projection of a record sent to full-payload destinations. Engine
/// bookkeeping is left out.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordView {
    pub id: String,
    pub entity_id: String,
    pub bucket: Option<String>,
    /// Human-authored labels.
    pub labels: Vec<String>,
    pub classification_labels: Vec<String>,
    pub annotations: Vec<String>,
    pub created_at: i64,
    pub last_activity_at: i64,
    pub archived: bool,
    pub fields: BTreeMap<String, String>,
    pub change_reason: String,
}

impl RecordView {
    pub fn project(working: &WorkingRecord, change: &Change) -> Self {
        let record = &working.record;
        Self {
            id: record.id.clone(),
            entity_id: record.entity_id.clone(),
            bucket: record.bucket.clone(),
            labels: working
                .labels()
                .into_iter()
                .filter(|l| !l.starts_with(AUTO_LABEL_PREFIX))
                .collect(),
            classification_labels: working.classification_labels().into_iter().collect(),
            annotations: working
                .annotations()
                .into_iter()
                .filter(|a| !a.starts_with(BOT_ANNOTATION_PREFIX))
                .collect(),
            created_at: record.created_at.timestamp_millis(),
            last_activity_at: record.last_external_activity.timestamp_millis(),
            archived: record.archived,
            fields: record.fields.clone(),
            change_reason: change.reason.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub url: String,
    pub payload: WebhookPayload,
}

/// Hands notifications off for delivery. Must return without waiting for it.
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, notification: Notification);
}

/// Posts each notification as JSON from a detached tokio task.
#[derive(Debug, Clone)]
pub struct WebhookDispatcher {
    client: reqwest::Client,
}

impl WebhookDispatcher {
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent.to_string())
            .build()
            .context("building webhook client")?;
        Ok(Self { client })
    }
}

impl Dispatcher for WebhookDispatcher {
    fn dispatch(&self, notification: Notification) {
        let client = self.client.clone();
        tokio::spawn(async move {
            let Notification { url, payload } = notification;
            match client.post(&url).json(&payload).send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!(url = %url, status = %resp.status(), "webhook delivered");
                }
                Ok(resp) => warn!(url = %url, status = %resp.status(), "webhook rejected"),
                Err(err) => warn!(url = %url, error = %err, "webhook delivery failed"),
            }
        });
    }
}

/// Keeps notifications in memory instead of sending them.
#[derive(Debug, Default)]
pub struct RecordingDispatcher {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingDispatcher {
    pub fn sent(&self) -> Vec<Notification> {
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl Dispatcher for RecordingDispatcher {
    fn dispatch(&self, notification: Notification) {
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(notification);
    }
}

/// Last change already accounted for: the notified-change stamp, the
/// record's creation, and any legacy last-change label.
pub fn last_notified_change(working: &mut WorkingRecord) -> DateTime<Utc> {
    let legacy_stamp = working
        .labels_with_prefix(legacy::LAST_CHANGE_PREFIX)
        .iter()
        .filter_map(|l| l.strip_prefix(legacy::LAST_CHANGE_PREFIX))
        .filter_map(|raw| DateTime::parse_from_rfc3339(raw.trim()).ok())
        .map(|t| t.with_timezone(&Utc))
        .max();
    let created_at = working.record.created_at;
    let stamped = working.metadata().last_change_detected();
    [Some(stamped), Some(created_at), legacy_stamp]
        .into_iter()
        .flatten()
        .max()
        .unwrap_or(stamped)
}

pub fn is_notifiable(change: &Change, last_notified: DateTime<Utc>) -> bool {
    change.time > last_notified + chrono::Duration::milliseconds(NOTIFY_SLACK_MS)
}

#[derive(Clone)]
pub struct Notifier {
    destinations: Vec<Destination>,
    dispatcher: Arc<dyn Dispatcher>,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("destinations", &self.destinations)
            .finish_non_exhaustive()
    }
}

impl Notifier {
    pub fn new(destinations: Vec<Destination>, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            destinations,
            dispatcher,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let destinations = config
            .webhook_urls
            .iter()
            .map(|url| Destination {
                url: url.clone(),
                shape: PayloadShape::Minimal,
            })
            .chain(config.full_webhook_urls.iter().map(|url| Destination {
                url: url.clone(),
                shape: PayloadShape::Full,
            }))
            .collect();
        let dispatcher = WebhookDispatcher::new(
            Duration::from_secs(config.http_timeout_secs),
            &config.user_agent,
        )?;
        Ok(Self::new(destinations, Arc::new(dispatcher)))
    }

    pub fn destinations(&self) -> &[Destination] {
        &self.destinations
    }

    fn payload(&self, shape: PayloadShape, working: &WorkingRecord, change: &Change) -> WebhookPayload {
        let record = &working.record;
        let data = match shape {
            PayloadShape::Minimal => serde_json::to_value(MinimalView {
                candidate_id: &record.id,
                contact_id: &record.entity_id,
                opportunity_id: &record.id,
            }),
            PayloadShape::Full => serde_json::to_value(RecordView::project(working, change)),
        }
        .unwrap_or(serde_json::Value::Null);
        WebhookPayload {
            triggered_at: change.time.timestamp_millis(),
            event: EVENT_RECORD_CHANGED.to_string(),
            data,
        }
    }

    /// Dispatch for recognized buckets, then close the detection window at the
    /// change time. Returns how many notifications were handed off.
    pub fn notify_of_change(
        &self,
        working: &mut WorkingRecord,
        bucket: &BucketClass,
        change: &Change,
    ) -> usize {
        let mut sent = 0;
        if bucket.is_recognized() {
            info!(reason = %change.reason, "change detected; notifying");
            for destination in &self.destinations {
                let payload = self.payload(destination.shape, working, change);
                self.dispatcher.dispatch(Notification {
                    url: destination.url.clone(),
                    payload,
                });
                sent += 1;
            }
        }

        let closed_at = working
            .self_touched_at()
            .map_or(change.time, |touched| touched.max(change.time));
        working.metadata().set_last_change_detected(closed_at);
        sent
    }

    /// No change owed a notification: move the stamp past the engine's own
    /// activity so it is not mistaken for an external change next pass.
    pub fn advance_without_change(working: &mut WorkingRecord) {
        let activity = working.record.last_external_activity;
        let touched = working.self_touched_at();
        let metadata = working.metadata();
        let current = metadata.last_change_detected();
        let advanced = [Some(current), Some(activity), touched]
            .into_iter()
            .flatten()
            .max()
            .unwrap_or(current);
        if advanced != current {
            metadata.set_last_change_detected(advanced);
        }
    }
}
