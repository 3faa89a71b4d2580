//! In-band key/value storage carried by a single annotation.
//!
//! Shape: `http://🤖/bot/data/<record id>?<k=v&...>` with pairs sorted by key and
//! `application/x-www-form-urlencoded` escaping. Records persisted by earlier
//! releases use the same shape, so it must not change.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use tracing::warn;
use url::form_urlencoded;

use crate::{RecordId, WorkingRecord, METADATA_ANNOTATION_PREFIX};

pub const KEY_TAG_CHECKSUM: &str = "tag_checksum";
pub const KEY_LINK_CHECKSUM: &str = "link_checksum";
pub const KEY_LAST_CHANGE_DETECTED: &str = "last_change_detected";
pub const KEY_LINK_RULES: &str = "link_rules";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BotMetadata {
    entries: BTreeMap<String, String>,
}

impl BotMetadata {
    pub fn from_map(entries: BTreeMap<String, String>) -> Self {
        Self { entries }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &BTreeMap<String, String> {
        &self.entries
    }

    /// Time of the last change a notification was recorded for; epoch if
    /// never recorded or unparsable.
    pub fn last_change_detected(&self) -> DateTime<Utc> {
        self.get(KEY_LAST_CHANGE_DETECTED)
            .and_then(|raw| raw.parse::<i64>().ok())
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }

    pub fn set_last_change_detected(&mut self, at: DateTime<Utc>) {
        self.set(KEY_LAST_CHANGE_DETECTED, at.timestamp_millis().to_string());
    }
}

pub fn metadata_prefix(id: &RecordId) -> String {
    format!("{METADATA_ANNOTATION_PREFIX}{id}?")
}

pub fn encode(id: &RecordId, metadata: &BotMetadata) -> String {
    let query = form_urlencoded::Serializer::new(String::new())
        .extend_pairs(metadata.entries().iter())
        .finish();
    format!("{}{}", metadata_prefix(id), query)
}

/// Decode the blob owned by `id`. Missing blob gives an empty map; when more
/// than one blob is present the first one yielded is used.
pub fn decode<'a, I>(id: &RecordId, annotations: I) -> BotMetadata
where
    I: IntoIterator<Item = &'a String>,
{
    let prefix = metadata_prefix(id);
    let mut matching = annotations.into_iter().filter(|a| a.starts_with(&prefix));
    let Some(blob) = matching.next() else {
        return BotMetadata::default();
    };
    let extra = matching.count();
    if extra > 0 {
        warn!(record_id = %id, extra, "multiple metadata annotations; using the first");
    }

    let query = &blob[prefix.len()..];
    let entries = form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    BotMetadata::from_map(entries)
}

/// Queue the replace-prefix write of the cached metadata. Returns `false`
/// when nothing needs writing.
pub fn write_back(working: &mut WorkingRecord) -> bool {
    let Some(metadata) = working.loaded_metadata() else {
        return false;
    };
    if metadata.is_empty() {
        return false;
    }

    let encoded = encode(working.id(), metadata);
    let existing = working.annotations_with_prefix(&metadata_prefix(working.id()));
    if existing.len() == 1 && existing.contains(&encoded) {
        return false;
    }

    working.queue.annotations.remove(existing);
    working.queue.annotations.add([encoded]);
    true
}
