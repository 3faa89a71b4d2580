//! Feedback forms attached to a record and the annotations summarising them.
//!
//! Each summarised form gets `http://🤖/feedback/<feedback id>/<rules version>?<pairs>`;
//! the record additionally carries one roll-up under `http://🤖/feedback/all/`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::form_urlencoded;

pub const FEEDBACK_ANNOTATION_PREFIX: &str = "http://🤖/feedback/";
pub const FEEDBACK_ALL_PREFIX: &str = "http://🤖/feedback/all/";

/// A completed feedback form, as listed by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feedback {
    pub id: String,
    /// Form title.
    pub title: String,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Question text to answer.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

pub type FeedbackSummary = BTreeMap<String, String>;

fn encode_pairs(summary: &FeedbackSummary) -> String {
    form_urlencoded::Serializer::new(String::new())
        .extend_pairs(summary.iter())
        .finish()
}

fn decode_pairs(query: &str) -> FeedbackSummary {
    form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

/// Prefix shared by every summary of one feedback form, whatever the version.
pub fn summary_prefix(feedback_id: &str) -> String {
    format!("{FEEDBACK_ANNOTATION_PREFIX}{feedback_id}/")
}

pub fn summary_annotation(feedback_id: &str, version: &str, summary: &FeedbackSummary) -> String {
    format!("{}{version}?{}", summary_prefix(feedback_id), encode_pairs(summary))
}

pub fn all_annotation(summary: &FeedbackSummary) -> String {
    format!("{FEEDBACK_ALL_PREFIX}?{}", encode_pairs(summary))
}

/// Per-form summary annotations, i.e. everything under the feedback prefix
/// except the roll-up.
pub fn is_form_summary(annotation: &str) -> bool {
    annotation.starts_with(FEEDBACK_ANNOTATION_PREFIX) && !annotation.starts_with(FEEDBACK_ALL_PREFIX)
}

/// The pairs carried by a per-form summary annotation.
pub fn parse_summary(annotation: &str) -> Option<FeedbackSummary> {
    if !is_form_summary(annotation) {
        return None;
    }
    let (_, query) = annotation.split_once('?')?;
    Some(decode_pairs(query))
}

/// True when any per-form summary was written under a different rules version.
pub fn is_outdated<'a, I>(annotations: I, version: &str) -> bool
where
    I: IntoIterator<Item = &'a String>,
{
    let marker = format!("/{version}?");
    annotations
        .into_iter()
        .any(|a| is_form_summary(a) && !a.contains(&marker))
}
