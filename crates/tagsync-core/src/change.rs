//! Human-edit detection via checksums stored in bot metadata.

use chrono::{DateTime, Utc};
use md5::{Digest, Md5};

use crate::metadata::{KEY_LINK_CHECKSUM, KEY_TAG_CHECKSUM};
use crate::{legacy, LabelSet, WorkingRecord, AUTO_ANNOTATION_PREFIX, AUTO_LABEL_PREFIX};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attribute {
    Labels,
    Annotations,
}

impl Attribute {
    /// Values under this prefix are written by the engine and never count as a change.
    pub fn engine_prefix(self) -> &'static str {
        match self {
            Attribute::Labels => AUTO_LABEL_PREFIX,
            Attribute::Annotations => AUTO_ANNOTATION_PREFIX,
        }
    }

    pub fn metadata_key(self) -> &'static str {
        match self {
            Attribute::Labels => KEY_TAG_CHECKSUM,
            Attribute::Annotations => KEY_LINK_CHECKSUM,
        }
    }

    fn legacy_checksum_prefix(self) -> &'static str {
        match self {
            Attribute::Labels => legacy::TAG_CHECKSUM_PREFIX,
            Attribute::Annotations => legacy::LINK_CHECKSUM_PREFIX,
        }
    }

    fn values(self, working: &WorkingRecord) -> LabelSet {
        match self {
            Attribute::Labels => working.labels(),
            Attribute::Annotations => working.annotations(),
        }
    }

    /// Human-authored values, sorted.
    pub fn human_values(self, values: &LabelSet) -> Vec<String> {
        values
            .iter()
            .filter(|v| !v.starts_with(self.engine_prefix()))
            .cloned()
            .collect()
    }

    fn describe(self, values: &LabelSet) -> String {
        let human = self.human_values(values);
        match self {
            Attribute::Labels => {
                let tags = human
                    .iter()
                    .map(|l| l.replace([' ', '(', ')', ':'], "-"))
                    .collect::<Vec<_>>()
                    .join(" #");
                format!("labels updated\n#{tags}")
            }
            Attribute::Annotations => {
                let mut refs = human;
                refs.sort_by(|a, b| strip_scheme(a).cmp(strip_scheme(b)));
                format!("annotations updated\n📎 {}", refs.join("\n📎 "))
            }
        }
    }
}

fn strip_scheme(value: &str) -> &str {
    value.split_once("://").map_or(value, |(_, rest)| rest)
}

/// A detected change and the time it is attributed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub time: DateTime<Utc>,
    pub reason: String,
}

pub fn checksum(values: &LabelSet, attribute: Attribute) -> String {
    let joined = attribute.human_values(values).join(";;");
    let mut hasher = Md5::new();
    hasher.update(joined.as_bytes());
    hex::encode(hasher.finalize())
}

/// Stored checksum, adopting one from legacy bookkeeping when metadata has none.
pub fn stored_checksum(working: &mut WorkingRecord, attribute: Attribute) -> Option<String> {
    let key = attribute.metadata_key();
    if let Some(existing) = working.metadata().get(key) {
        return Some(existing.to_string());
    }

    let prefix = attribute.legacy_checksum_prefix();
    let adopted = attribute
        .values(working)
        .iter()
        .find_map(|v| v.strip_prefix(prefix).map(str::to_string))?;
    working.metadata().set(key, adopted.clone());
    Some(adopted)
}

/// Compare against the stored checksum and store the new one. A record seen
/// for the first time (nothing stored) never reports a change.
pub fn has_changed(
    working: &mut WorkingRecord,
    attribute: Attribute,
    now: DateTime<Utc>,
) -> Option<Change> {
    let values = attribute.values(working);
    let current = checksum(&values, attribute);
    let existing = stored_checksum(working, attribute);

    if existing.as_deref() == Some(current.as_str()) {
        return None;
    }
    working.metadata().set(attribute.metadata_key(), current);

    existing.map(|_| Change {
        time: now,
        reason: attribute.describe(&values),
    })
}

/// Latest signal among the store's own activity timestamp and the label and
/// annotation checksums. On equal times the checksum signal wins.
pub fn latest_change(working: &mut WorkingRecord, now: DateTime<Utc>) -> Change {
    let activity = Change {
        time: working.record.last_external_activity,
        reason: "a new interaction".to_string(),
    };
    [
        has_changed(working, Attribute::Labels, now),
        has_changed(working, Attribute::Annotations, now),
    ]
    .into_iter()
    .flatten()
    .fold(activity, |best, candidate| {
        if candidate.time >= best.time {
            candidate
        } else {
            best
        }
    })
}
