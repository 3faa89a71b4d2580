//! Core record model, reserved prefixes and per-pass working state for tagsync.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod change;
pub mod feedback;
pub mod metadata;
pub mod queue;

pub use change::{Attribute, Change};
pub use feedback::{Feedback, FeedbackSummary};
pub use metadata::BotMetadata;
pub use queue::{BatchScope, CommitPlan, MutationQueue, PendingSet};

pub const CRATE_NAME: &str = "tagsync-core";

pub type LabelSet = BTreeSet<String>;
pub type RecordId = String;
pub type EntityId = String;

/// Engine-authored labels: visible to humans, never part of a change checksum.
pub const AUTO_LABEL_PREFIX: &str = "🤖 ";
/// Engine-authored annotations (derived references and bookkeeping).
pub const AUTO_ANNOTATION_PREFIX: &str = "http://🤖/";
/// Engine-internal bookkeeping labels.
pub const BOT_LABEL_PREFIX: &str = "🤖 [bot] ";
/// Engine-internal bookkeeping annotations.
pub const BOT_ANNOTATION_PREFIX: &str = "http://🤖/bot/";
pub const METADATA_ANNOTATION_PREFIX: &str = "http://🤖/bot/data/";
/// Annotations produced by the rule engine.
pub const RULE_ANNOTATION_PREFIX: &str = "http://🤖/rules/";

pub const LABEL_ARCHIVED_DUPLICATE: &str = "🤖 Archived duplicate";
pub const LABEL_DUPLICATE_PREFIX: &str = "🤖 Duplicate: ";
pub const LABEL_ORIGINAL_PREFIX: &str = "🤖 [Original] ";
pub const LABEL_HISTORIC_PREFIX: &str = "🤖 [Historic] ";
pub const LABEL_CARRIED_PREFIX: &str = "🤖 [Carried] ";

/// Bookkeeping written by earlier releases, adopted or removed on sight.
pub mod legacy {
    pub const TAG_CHECKSUM_PREFIX: &str = "🤖 [bot] tag checksum: ";
    pub const LAST_CHANGE_PREFIX: &str = "🤖 [bot] last change detected: ";
    pub const AUTO_TAG_PREFIX: &str = "🤖 [auto]";
    pub const LINK_CHECKSUM_PREFIX: &str = "http://🤖/bot/checksum/";
    /// Metadata blob written before the owning id was embedded in the prefix.
    pub const METADATA_PREFIX: &str = "http://🤖/bot/data?";
}

/// Engine-authored but not bookkeeping.
pub fn is_classification_label(label: &str) -> bool {
    label.starts_with(AUTO_LABEL_PREFIX) && !label.starts_with(BOT_LABEL_PREFIX)
}

/// Externally owned record as last read from the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub entity_id: EntityId,
    #[serde(default)]
    pub labels: LabelSet,
    #[serde(default)]
    pub annotations: LabelSet,
    /// Annotations in the order the store listed them, when it did.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub annotation_order: Vec<String>,
    pub last_external_activity: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    /// Raw bucket key assigned by the store; `None` means unassigned.
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub anonymized: bool,
    /// Free-form answers consumed by the rule engine.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl Record {
    pub fn new(
        id: impl Into<RecordId>,
        entity_id: impl Into<EntityId>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            entity_id: entity_id.into(),
            labels: LabelSet::new(),
            annotations: LabelSet::new(),
            annotation_order: Vec::new(),
            last_external_activity: created_at,
            created_at,
            bucket: None,
            archived: false,
            anonymized: false,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels.extend(labels.into_iter().map(Into::into));
        self
    }

    /// Labels written by the rule engine or consolidation.
    pub fn classification_labels(&self) -> impl Iterator<Item = &String> {
        self.labels.iter().filter(|l| is_classification_label(l))
    }
}

/// Where a record sits relative to the configured buckets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BucketClass {
    Unassigned,
    Recognized(String),
    OutOfScope,
}

impl BucketClass {
    pub fn is_in_scope(&self) -> bool {
        !matches!(self, BucketClass::OutOfScope)
    }

    pub fn is_recognized(&self) -> bool {
        matches!(self, BucketClass::Recognized(_))
    }
}

/// In-memory copy of a record for the duration of one pass: the store's
/// last-known state plus the lazily decoded metadata and pending mutations.
#[derive(Debug)]
pub struct WorkingRecord {
    pub record: Record,
    pub queue: MutationQueue,
    metadata: Option<BotMetadata>,
    self_touched_at: Option<DateTime<Utc>>,
}

impl WorkingRecord {
    pub fn new(record: Record) -> Self {
        Self {
            record,
            queue: MutationQueue::new(),
            metadata: None,
            self_touched_at: None,
        }
    }

    pub fn id(&self) -> &RecordId {
        &self.record.id
    }

    /// Labels as they will look once pending mutations are committed.
    pub fn labels(&self) -> LabelSet {
        self.queue.labels.effective(&self.record.labels)
    }

    pub fn annotations(&self) -> LabelSet {
        self.queue.annotations.effective(&self.record.annotations)
    }

    pub fn classification_labels(&self) -> LabelSet {
        self.labels()
            .into_iter()
            .filter(|l| is_classification_label(l))
            .collect()
    }

    pub fn has_label(&self, label: &str) -> bool {
        if self.queue.labels.is_queued_for_removal(label) {
            return false;
        }
        self.record.labels.contains(label) || self.queue.labels.is_queued_for_addition(label)
    }

    pub fn labels_with_prefix(&self, prefix: &str) -> LabelSet {
        self.labels()
            .into_iter()
            .filter(|l| l.starts_with(prefix))
            .collect()
    }

    pub fn annotations_with_prefix(&self, prefix: &str) -> LabelSet {
        self.annotations()
            .into_iter()
            .filter(|a| a.starts_with(prefix))
            .collect()
    }

    /// Bot metadata, decoded from the annotations on first access.
    pub fn metadata(&mut self) -> &mut BotMetadata {
        if self.metadata.is_none() {
            let effective = self.annotations();
            let order = &self.record.annotation_order;
            let listed = order.iter().filter(|a| effective.contains(*a));
            let unlisted = effective.iter().filter(|a| !order.contains(a));
            let decoded = metadata::decode(&self.record.id, listed.chain(unlisted));
            self.metadata = Some(decoded);
        }
        self.metadata.get_or_insert_with(BotMetadata::default)
    }

    pub fn loaded_metadata(&self) -> Option<&BotMetadata> {
        self.metadata.as_ref()
    }

    /// Remember that the engine itself bumped the store's activity timestamp.
    pub fn record_self_touch(&mut self, at: DateTime<Utc>) {
        self.self_touched_at = Some(self.self_touched_at.map_or(at, |prev| prev.max(at)));
    }

    pub fn self_touched_at(&self) -> Option<DateTime<Utc>> {
        self.self_touched_at
    }
}
