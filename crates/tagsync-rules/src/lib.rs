//! Rule engine: derives classification labels (and optional reference
//! annotations) from a record's application answers.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use sha2::{Digest, Sha256};
use tagsync_core::{
    Feedback, FeedbackSummary, LabelSet, Record, AUTO_LABEL_PREFIX, RULE_ANNOTATION_PREFIX,
};
use thiserror::Error;
use tracing::debug;
use url::form_urlencoded;

pub const CRATE_NAME: &str = "tagsync-rules";

pub const CLASSIFICATION_FILE: &str = "classification.yaml";

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid rule table: {0}")]
    Invalid(String),
    #[error("rule evaluation failed for record {record_id}: {message}")]
    Evaluation { record_id: String, message: String },
}

/// Capability the pass driver consumes. Only `derive_labels` is required.
pub trait RuleEngine: Send + Sync {
    /// Classification labels the record should carry right now.
    fn derive_labels(&self, record: &Record) -> Result<LabelSet, RuleError>;

    /// Every label this engine may ever emit; owned labels not derived for a
    /// record are removed from it.
    fn owned_labels(&self) -> LabelSet {
        LabelSet::new()
    }

    /// Marker stored in bot metadata; annotation rules are re-applied when it moves.
    fn version(&self) -> Option<String> {
        None
    }

    /// Annotations under the rule annotation prefix.
    fn derive_annotations(&self, _record: &Record) -> Result<LabelSet, RuleError> {
        Ok(LabelSet::new())
    }

    /// Note to append to the record when `label` is newly added.
    fn note_for(&self, _record: &Record, _label: &str) -> Option<String> {
        None
    }

    /// False when no feedback form can ever be summarised; feedback is then
    /// never fetched.
    fn summarises_feedback(&self) -> bool {
        false
    }

    /// Pairs summarising one completed form, `None` when no rule covers it.
    fn summarise_feedback(
        &self,
        _record: &Record,
        _feedback: &Feedback,
    ) -> Result<Option<FeedbackSummary>, RuleError> {
        Ok(None)
    }

    /// Roll-up of every per-form summary on a record: distinct values per
    /// key, in the order given, joined with `, `.
    fn summarise_all_feedback(&self, summaries: &[FeedbackSummary]) -> FeedbackSummary {
        let mut merged: BTreeMap<String, Vec<&str>> = BTreeMap::new();
        for summary in summaries {
            for (key, value) in summary {
                let values = merged.entry(key.clone()).or_default();
                if !value.is_empty() && !values.contains(&value.as_str()) {
                    values.push(value.as_str());
                }
            }
        }
        merged
            .into_iter()
            .filter(|(_, values)| !values.is_empty())
            .map(|(key, values)| (key, values.join(", ")))
            .collect()
    }
}

/// Engine with no rules: derives nothing, owns nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRules;

impl RuleEngine for NoRules {
    fn derive_labels(&self, _record: &Record) -> Result<LabelSet, RuleError> {
        Ok(LabelSet::new())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ClassificationFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    categories: Vec<Category>,
    #[serde(default)]
    annotations: Vec<AnnotationRule>,
    #[serde(default)]
    feedback: Vec<FeedbackRule>,
}

#[derive(Debug, Clone, Deserialize)]
struct Category {
    name: String,
    label_prefix: String,
    /// key -> label suffix
    labels: BTreeMap<String, String>,
    #[serde(default)]
    fallback: Option<String>,
    #[serde(default)]
    note: bool,
    #[serde(default)]
    questions: Vec<QuestionRule>,
}

#[derive(Debug, Clone, Deserialize)]
struct QuestionRule {
    question_contains: String,
    /// Label key used when the answer is non-empty, whatever it says.
    #[serde(default)]
    any_answer: Option<String>,
    #[serde(default)]
    answers: Vec<AnswerRule>,
}

#[derive(Debug, Clone, Deserialize)]
struct AnswerRule {
    contains: String,
    label: String,
}

#[derive(Debug, Clone, Deserialize)]
struct AnnotationRule {
    name: String,
    question_contains: String,
}

/// Summarises feedback forms whose title contains `form_contains`; each
/// field becomes `<name>_<key>`.
#[derive(Debug, Clone, Deserialize)]
struct FeedbackRule {
    name: String,
    form_contains: String,
    #[serde(default)]
    fields: Vec<FeedbackField>,
}

#[derive(Debug, Clone, Deserialize)]
struct FeedbackField {
    key: String,
    question_contains: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RuleMatch {
    label: String,
    field: Option<String>,
    value: Option<String>,
}

pub fn normalize_text(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Rule engine backed by `rules/classification.yaml`.
#[derive(Debug, Clone)]
pub struct YamlRuleEngine {
    categories: Vec<Category>,
    annotations: Vec<AnnotationRule>,
    feedback: Vec<FeedbackRule>,
    version: String,
}

impl YamlRuleEngine {
    pub fn from_workspace_root(root: &Path) -> Result<Self, RuleError> {
        Self::from_path(&root.join("rules").join(CLASSIFICATION_FILE))
    }

    pub fn from_path(path: &Path) -> Result<Self, RuleError> {
        let text = std::fs::read_to_string(path).map_err(|source| RuleError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file: ClassificationFile =
            serde_yaml::from_str(&text).map_err(|source| RuleError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_file(file, &text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, RuleError> {
        let file: ClassificationFile =
            serde_yaml::from_str(text).map_err(|source| RuleError::Parse {
                path: PathBuf::from("<inline>"),
                source,
            })?;
        Self::from_file(file, text)
    }

    fn from_file(file: ClassificationFile, text: &str) -> Result<Self, RuleError> {
        for category in &file.categories {
            validate_category(category)?;
        }
        for rule in &file.feedback {
            validate_feedback_rule(rule)?;
        }
        let digest = Sha256::digest(text.as_bytes());
        let version = hex::encode(&digest[..8]);
        debug!(
            categories = file.categories.len(),
            annotation_rules = file.annotations.len(),
            feedback_rules = file.feedback.len(),
            %version,
            "loaded classification rules"
        );
        Ok(Self {
            categories: file.categories,
            annotations: file.annotations,
            feedback: file.feedback,
            version,
        })
    }

    fn classify(&self, category: &Category, record: &Record) -> Option<RuleMatch> {
        if record.fields.is_empty() {
            return None;
        }
        let answers: Vec<(&String, String, &String)> = record
            .fields
            .iter()
            .map(|(question, answer)| (question, normalize_text(question), answer))
            .collect();

        for rule in &category.questions {
            let needle = normalize_text(&rule.question_contains);
            let Some((question, _, answer)) =
                answers.iter().find(|(_, normalized, _)| normalized.contains(&needle))
            else {
                continue;
            };

            let key = match &rule.any_answer {
                Some(key) if !answer.trim().is_empty() => Some(key),
                _ => {
                    let normalized_answer = normalize_text(answer);
                    rule.answers
                        .iter()
                        .filter(|a| normalized_answer.contains(&normalize_text(&a.contains)))
                        .max_by_key(|a| a.contains.len())
                        .map(|a| &a.label)
                }
            };
            if let Some(key) = key {
                return Some(RuleMatch {
                    label: label_for(category, key),
                    field: Some((*question).clone()),
                    value: Some((*answer).clone()),
                });
            }
        }

        category.fallback.as_ref().map(|key| RuleMatch {
            label: label_for(category, key),
            field: None,
            value: None,
        })
    }
}

fn label_for(category: &Category, key: &str) -> String {
    let suffix = category.labels.get(key).map_or(key, String::as_str);
    format!("{}{}", category.label_prefix, suffix)
}

fn validate_category(category: &Category) -> Result<(), RuleError> {
    if !category.label_prefix.starts_with(AUTO_LABEL_PREFIX) {
        return Err(RuleError::Invalid(format!(
            "category `{}`: label_prefix {:?} must start with {:?}",
            category.name, category.label_prefix, AUTO_LABEL_PREFIX
        )));
    }

    let known = |key: &str, context: &str| -> Result<(), RuleError> {
        if category.labels.contains_key(key) {
            Ok(())
        } else {
            Err(RuleError::Invalid(format!(
                "category `{}`: unknown label key `{key}` in {context}",
                category.name
            )))
        }
    };

    if let Some(fallback) = &category.fallback {
        known(fallback, "fallback")?;
    }
    for question in &category.questions {
        let context = format!("question `{}`", question.question_contains);
        if let Some(key) = &question.any_answer {
            known(key, &context)?;
        }
        for answer in &question.answers {
            known(&answer.label, &context)?;
        }
    }
    Ok(())
}

fn validate_feedback_rule(rule: &FeedbackRule) -> Result<(), RuleError> {
    if rule.name.is_empty() || !rule.name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(RuleError::Invalid(format!(
            "feedback rule {:?}: name must be non-empty ascii alphanumerics or `_`",
            rule.name
        )));
    }
    if normalize_text(&rule.form_contains).is_empty() {
        return Err(RuleError::Invalid(format!(
            "feedback rule `{}`: form_contains is empty",
            rule.name
        )));
    }
    Ok(())
}

impl RuleEngine for YamlRuleEngine {
    fn derive_labels(&self, record: &Record) -> Result<LabelSet, RuleError> {
        Ok(self
            .categories
            .iter()
            .filter_map(|category| self.classify(category, record))
            .map(|m| m.label)
            .collect())
    }

    fn owned_labels(&self) -> LabelSet {
        self.categories
            .iter()
            .flat_map(|category| {
                category
                    .labels
                    .values()
                    .map(move |suffix| format!("{}{}", category.label_prefix, suffix))
            })
            .collect()
    }

    fn version(&self) -> Option<String> {
        Some(self.version.clone())
    }

    fn derive_annotations(&self, record: &Record) -> Result<LabelSet, RuleError> {
        let mut out = LabelSet::new();
        for rule in &self.annotations {
            let needle = normalize_text(&rule.question_contains);
            let answer = record
                .fields
                .iter()
                .find(|(question, _)| normalize_text(question).contains(&needle))
                .map(|(_, answer)| answer.trim())
                .filter(|answer| !answer.is_empty());
            if let Some(answer) = answer {
                let query = form_urlencoded::Serializer::new(String::new())
                    .append_pair("value", answer)
                    .finish();
                out.insert(format!("{RULE_ANNOTATION_PREFIX}{}?{query}", rule.name));
            }
        }
        Ok(out)
    }

    fn summarises_feedback(&self) -> bool {
        !self.feedback.is_empty()
    }

    fn summarise_feedback(
        &self,
        record: &Record,
        feedback: &Feedback,
    ) -> Result<Option<FeedbackSummary>, RuleError> {
        let title = normalize_text(&feedback.title);
        let mut matching = self
            .feedback
            .iter()
            .filter(|rule| title.contains(&normalize_text(&rule.form_contains)));
        let Some(rule) = matching.next() else {
            return Ok(None);
        };
        if let Some(other) = matching.next() {
            return Err(RuleError::Evaluation {
                record_id: record.id.clone(),
                message: format!(
                    "feedback form {:?} matches both `{}` and `{}`",
                    feedback.title, rule.name, other.name
                ),
            });
        }

        let mut summary = FeedbackSummary::new();
        for field in &rule.fields {
            let needle = normalize_text(&field.question_contains);
            let answer = feedback
                .fields
                .iter()
                .find(|(question, _)| normalize_text(question).contains(&needle))
                .map(|(_, answer)| answer.trim())
                .filter(|answer| !answer.is_empty());
            if let Some(answer) = answer {
                summary.insert(format!("{}_{}", rule.name, field.key), answer.to_string());
            }
        }
        if let Some(completed_at) = feedback.completed_at {
            summary.insert(
                format!("{}_completed_at", rule.name),
                completed_at.timestamp_millis().to_string(),
            );
        }
        Ok(Some(summary))
    }

    fn note_for(&self, record: &Record, label: &str) -> Option<String> {
        let category = self
            .categories
            .iter()
            .find(|c| c.note && label.starts_with(&c.label_prefix))?;
        let matched = self.classify(category, record)?;
        if matched.label != label {
            return None;
        }
        Some(match (matched.field, matched.value) {
            (Some(field), Some(value)) => {
                format!("Added label {label}\nbecause field \"{field}\"\nis \"{value}\"")
            }
            _ => format!("Added label {label}\nbecause no answer matched a rule"),
        })
    }
}
