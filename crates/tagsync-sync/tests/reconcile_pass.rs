use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use tagsync_core::{
    Feedback, LabelSet, Record, LABEL_ARCHIVED_DUPLICATE, METADATA_ANNOTATION_PREFIX,
};
use tagsync_rules::{NoRules, RuleEngine, YamlRuleEngine};
use tagsync_storage::{
    InMemoryRecordStore, RecordFilter, RecordPage, RecordStore, StoreError, WriteCall,
};
use tagsync_sync::{
    ConsolidationConfig, Destination, Notifier, PassDriver, PassSummary, PayloadShape,
    RecordingDispatcher,
};

const CONSOLIDATION: &str = r#"
version: 1
buckets:
  - { key: posting-a, name: LD15 }
  - { key: posting-b, name: BE6 }
decay_window_days: 180
source_label_prefix: "🤖 self-reported source: "
carry_forward:
  - label: Do not contact
  - prefix: "Flag: "
"#;

const CLASSIFICATION: &str = r#"
version: 1
categories:
  - name: source
    label_prefix: "🤖 self-reported source: "
    note: true
    labels:
      referral: Referral
      organic: Organic
      error: ERROR unknown
    fallback: error
    questions:
      - question_contains: how did you hear about us
        answers:
          - { contains: cohort member, label: referral }
          - { contains: someone else, label: organic }
"#;

const FEEDBACK_RULES: &str = r#"
version: 1
feedback:
  - name: coffee
    form_contains: coffee chat
    fields:
      - { key: rating, question_contains: overall rating }
"#;

const HOOK_URL: &str = "https://hooks.example.test/changed";

struct Harness {
    store: Arc<InMemoryRecordStore>,
    dispatcher: Arc<RecordingDispatcher>,
    driver: PassDriver,
}

impl Harness {
    fn new(records: Vec<Record>, rules: Arc<dyn RuleEngine>) -> Self {
        let store = Arc::new(InMemoryRecordStore::with_records(records).with_page_size(2));
        Self::over(Arc::clone(&store) as Arc<dyn RecordStore>, store, rules)
    }

    /// Harness whose driver writes through a store that rejects one write.
    fn failing(records: Vec<Record>, fail: FailOn, id: &'static str) -> Self {
        let store = Arc::new(InMemoryRecordStore::with_records(records).with_page_size(2));
        let failing = FailingStore {
            inner: Arc::clone(&store),
            fail,
            id,
        };
        Self::over(Arc::new(failing), store, no_rules())
    }

    fn over(
        driver_store: Arc<dyn RecordStore>,
        store: Arc<InMemoryRecordStore>,
        rules: Arc<dyn RuleEngine>,
    ) -> Self {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let notifier = Notifier::new(
            vec![Destination {
                url: HOOK_URL.to_string(),
                shape: PayloadShape::Minimal,
            }],
            dispatcher.clone(),
        );
        let consolidation = ConsolidationConfig::from_yaml_str(CONSOLIDATION).unwrap();
        let driver = PassDriver::new(
            driver_store,
            rules,
            notifier,
            consolidation,
        );
        Self {
            store,
            dispatcher,
            driver,
        }
    }

    async fn pass(&self) -> PassSummary {
        self.driver.run_pass(&RecordFilter::active()).await.unwrap()
    }

    /// Run a pass on a settled store and assert it neither writes nor notifies.
    async fn assert_settled(&self) {
        self.store.clear_writes().await;
        let already_sent = self.dispatcher.sent().len();
        let summary = self.pass().await;
        assert_eq!(self.store.writes().await, Vec::<WriteCall>::new());
        assert_eq!(summary.updated, 0);
        assert_eq!(summary.notified, 0);
        assert_eq!(self.dispatcher.sent().len(), already_sent);
    }

    async fn labels(&self, id: &str) -> Vec<String> {
        self.store
            .snapshot(id)
            .await
            .unwrap()
            .labels
            .into_iter()
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailOn {
    AddLabels,
    AddAnnotations,
}

/// In-memory store that answers one kind of write for one record with a 503.
struct FailingStore {
    inner: Arc<InMemoryRecordStore>,
    fail: FailOn,
    id: &'static str,
}

impl FailingStore {
    fn check(&self, op: FailOn, id: &str) -> Result<(), StoreError> {
        if op == self.fail && id == self.id {
            return Err(StoreError::HttpStatus {
                status: 503,
                url: format!("memory://{id}"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for FailingStore {
    async fn fetch(&self, id: &str) -> Result<Record, StoreError> {
        self.inner.fetch(id).await
    }

    async fn fetch_page(
        &self,
        filter: &RecordFilter,
        cursor: Option<&str>,
    ) -> Result<RecordPage, StoreError> {
        self.inner.fetch_page(filter, cursor).await
    }

    async fn fetch_by_entity(&self, entity_id: &str) -> Result<Vec<Record>, StoreError> {
        self.inner.fetch_by_entity(entity_id).await
    }

    async fn fetch_feedback(&self, id: &str) -> Result<Vec<Feedback>, StoreError> {
        self.inner.fetch_feedback(id).await
    }

    async fn add_labels(&self, id: &str, labels: &LabelSet) -> Result<(), StoreError> {
        self.check(FailOn::AddLabels, id)?;
        self.inner.add_labels(id, labels).await
    }

    async fn remove_labels(&self, id: &str, labels: &LabelSet) -> Result<(), StoreError> {
        self.inner.remove_labels(id, labels).await
    }

    async fn add_annotations(&self, id: &str, annotations: &LabelSet) -> Result<(), StoreError> {
        self.check(FailOn::AddAnnotations, id)?;
        self.inner.add_annotations(id, annotations).await
    }

    async fn remove_annotations(
        &self,
        id: &str,
        annotations: &LabelSet,
    ) -> Result<(), StoreError> {
        self.inner.remove_annotations(id, annotations).await
    }

    async fn add_note(&self, id: &str, text: &str) -> Result<DateTime<Utc>, StoreError> {
        self.inner.add_note(id, text).await
    }
}

fn day(n: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).single().unwrap() + Duration::days(n)
}

fn record(id: &str, entity: &str, created_day: i64, bucket: Option<&str>) -> Record {
    let mut r = Record::new(id, entity, day(created_day));
    r.bucket = bucket.map(str::to_string);
    r
}

fn no_rules() -> Arc<dyn RuleEngine> {
    Arc::new(NoRules)
}

#[tokio::test]
async fn first_pass_writes_metadata_and_second_pass_is_silent() {
    let h = Harness::new(
        vec![record("r1", "e1", 0, Some("posting-a")).with_labels(["Phone screen"])],
        no_rules(),
    );

    let summary = h.pass().await;
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.updated, 1);
    assert_eq!(summary.notified, 0);

    let stored = h.store.snapshot("r1").await.unwrap();
    let blobs: Vec<_> = stored
        .annotations
        .iter()
        .filter(|a| a.starts_with(&format!("{METADATA_ANNOTATION_PREFIX}r1?")))
        .collect();
    assert_eq!(blobs.len(), 1);
    assert!(blobs[0].contains("tag_checksum="));

    h.assert_settled().await;
}

#[tokio::test]
async fn human_label_edit_notifies_once() {
    let h = Harness::new(vec![record("r1", "e1", 0, Some("posting-a"))], no_rules());
    h.pass().await;

    h.store
        .edit("r1", |r| {
            r.labels.insert("Offer sent".to_string());
        })
        .await
        .unwrap();

    let summary = h.pass().await;
    assert_eq!(summary.notified, 1);
    let sent = h.dispatcher.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].url, HOOK_URL);
    assert_eq!(sent[0].payload.event, "record_changed");
    assert_eq!(
        sent[0].payload.data,
        serde_json::json!({"candidateId": "r1", "contactId": "e1", "opportunityId": "r1"})
    );

    h.assert_settled().await;
}

#[tokio::test]
async fn activity_after_creation_notifies_on_first_sight() {
    let mut r = record("r1", "e1", 0, Some("posting-a"));
    r.last_external_activity = day(3);
    let h = Harness::new(vec![r], no_rules());

    let summary = h.pass().await;
    assert_eq!(summary.notified, 1);
    assert_eq!(h.dispatcher.sent()[0].payload.triggered_at, day(3).timestamp_millis());

    h.assert_settled().await;
}

#[tokio::test]
async fn unassigned_records_are_reconciled_without_notifying() {
    let h = Harness::new(vec![record("r1", "e1", 0, None)], no_rules());
    h.pass().await;
    h.store
        .edit("r1", |r| {
            r.labels.insert("Sourcer: Sam".to_string());
        })
        .await
        .unwrap();

    let summary = h.pass().await;
    assert_eq!(summary.updated, 1);
    assert_eq!(summary.notified, 0);
    assert!(h.dispatcher.sent().is_empty());

    h.assert_settled().await;
}

#[tokio::test]
async fn out_of_scope_records_only_lose_legacy_bookkeeping() {
    let h = Harness::new(
        vec![record("r1", "e1", 0, Some("posting-elsewhere"))
            .with_labels(["Interviewing", "🤖 [auto] screened"])],
        no_rules(),
    );

    let summary = h.pass().await;
    assert_eq!(summary.skipped_out_of_scope, 1);
    assert_eq!(h.labels("r1").await, vec!["Interviewing".to_string()]);
    assert!(h.store.snapshot("r1").await.unwrap().annotations.is_empty());

    h.store
        .edit("r1", |r| {
            r.labels.insert("Offer sent".to_string());
        })
        .await
        .unwrap();
    h.assert_settled().await;
}

#[tokio::test]
async fn anonymized_records_are_never_written() {
    let mut r = record("r1", "e1", 0, Some("posting-a")).with_labels(["🤖 [auto] legacy"]);
    r.anonymized = true;
    let h = Harness::new(vec![r], no_rules());

    let summary = h.pass().await;
    assert_eq!(summary.anonymized, 1);
    assert!(h.store.writes().await.is_empty());
}

#[tokio::test]
async fn rule_labels_are_added_with_a_note_and_then_left_alone() {
    let mut r = record("r1", "e1", 0, Some("posting-a"));
    r.fields = BTreeMap::from([(
        "How did you hear about us?".to_string(),
        "A cohort member told me".to_string(),
    )]);
    let rules = Arc::new(YamlRuleEngine::from_yaml_str(CLASSIFICATION).unwrap());
    let h = Harness::new(vec![r], rules);

    let summary = h.pass().await;
    assert_eq!(summary.notified, 0);
    assert!(h
        .labels("r1")
        .await
        .contains(&"🤖 self-reported source: Referral".to_string()));
    let notes: Vec<_> = h
        .store
        .writes()
        .await
        .into_iter()
        .filter_map(|w| match w {
            WriteCall::AddNote { text, .. } => Some(text),
            _ => None,
        })
        .collect();
    assert_eq!(notes.len(), 1);
    assert!(notes[0].contains("is \"A cohort member told me\""));

    h.assert_settled().await;
}

#[tokio::test]
async fn stale_rule_labels_are_replaced_when_answers_change() {
    let mut r = record("r1", "e1", 0, Some("posting-a"));
    r.fields = BTreeMap::from([(
        "How did you hear about us?".to_string(),
        "A cohort member told me".to_string(),
    )]);
    let rules = Arc::new(YamlRuleEngine::from_yaml_str(CLASSIFICATION).unwrap());
    let h = Harness::new(vec![r], rules);
    h.pass().await;

    h.store
        .edit("r1", |r| {
            r.fields.insert(
                "How did you hear about us?".to_string(),
                "Someone else mentioned it".to_string(),
            );
        })
        .await
        .unwrap();
    h.pass().await;

    let labels = h.labels("r1").await;
    assert!(labels.contains(&"🤖 self-reported source: Organic".to_string()));
    assert!(!labels.contains(&"🤖 self-reported source: Referral".to_string()));

    h.assert_settled().await;
}

#[tokio::test]
async fn duplicate_group_gets_type_and_archival_labels() {
    let h = Harness::new(
        vec![
            record("t1", "e1", 0, Some("posting-a")),
            record("t2", "e1", 1, None),
            record("solo", "e2", 1, Some("posting-a")),
            record("t3", "e1", 2, Some("posting-a")),
            record("t4", "e1", 3, Some("posting-b")),
        ],
        no_rules(),
    );

    let summary = h.pass().await;
    assert_eq!(summary.processed, 5);
    assert_eq!(summary.unique_entities, 2);
    assert_eq!(summary.entities_with_duplicates, 1);
    assert_eq!(summary.entities_with_3_plus, 1);
    assert_eq!(summary.consolidated_groups, 1);

    for id in ["t1", "t2", "t3", "t4"] {
        let labels = h.labels(id).await;
        assert!(labels.contains(&"🤖 Duplicate: multiple".to_string()), "{id}: {labels:?}");
        let archived = labels.contains(&LABEL_ARCHIVED_DUPLICATE.to_string());
        assert_eq!(archived, id == "t1", "{id}: {labels:?}");
    }
    assert!(h
        .labels("solo")
        .await
        .iter()
        .all(|l| !l.starts_with("🤖 Duplicate")));

    h.assert_settled().await;
}

#[tokio::test]
async fn group_type_tracks_bucket_moves() {
    let h = Harness::new(
        vec![record("a", "e1", 0, Some("posting-a")), record("b", "e1", 1, None)],
        no_rules(),
    );
    h.pass().await;
    assert!(h
        .labels("a")
        .await
        .contains(&"🤖 Duplicate: single_plus_general".to_string()));

    h.store
        .edit("b", |r| r.bucket = Some("posting-b".to_string()))
        .await
        .unwrap();
    h.pass().await;

    for id in ["a", "b"] {
        let labels = h.labels(id).await;
        assert!(labels.contains(&"🤖 Duplicate: multiple".to_string()));
        assert!(!labels.contains(&"🤖 Duplicate: single_plus_general".to_string()));
    }
    h.assert_settled().await;

    for id in ["a", "b"] {
        h.store.edit(id, |r| r.bucket = None).await.unwrap();
    }
    h.pass().await;
    for id in ["a", "b"] {
        let labels = h.labels(id).await;
        assert!(labels.contains(&"🤖 Duplicate: general".to_string()));
        assert!(!labels.contains(&"🤖 Duplicate: multiple".to_string()));
    }
    h.assert_settled().await;
}

#[tokio::test]
async fn provenance_follows_the_decay_window() {
    let h = Harness::new(
        vec![
            record("a", "e1", 0, Some("posting-a"))
                .with_labels(["🤖 self-reported source: Referral"]),
            record("b", "e1", 100, Some("posting-a"))
                .with_labels(["🤖 self-reported source: Organic"]),
            record("c", "e1", 400, Some("posting-b")),
        ],
        no_rules(),
    );
    h.pass().await;

    assert!(h.labels("a").await.iter().all(|l| !l.starts_with("🤖 [Original]")));
    assert!(h
        .labels("b")
        .await
        .contains(&"🤖 [Original] Referral".to_string()));
    assert!(h
        .labels("c")
        .await
        .contains(&"🤖 [Historic] Referral".to_string()));

    h.assert_settled().await;
}

#[tokio::test]
async fn flags_are_carried_forward_to_later_records() {
    let h = Harness::new(
        vec![
            record("a", "e1", 0, Some("posting-a")).with_labels(["Do not contact"]),
            record("b", "e1", 10, Some("posting-a")).with_labels(["Flag: visa"]),
            record("c", "e1", 20, Some("posting-b")),
        ],
        no_rules(),
    );
    h.pass().await;

    assert!(h.labels("a").await.iter().all(|l| !l.starts_with("🤖 [Carried]")));
    assert!(h
        .labels("b")
        .await
        .contains(&"🤖 [Carried] Do not contact".to_string()));
    let c = h.labels("c").await;
    assert!(c.contains(&"🤖 [Carried] Do not contact".to_string()));
    assert!(c.contains(&"🤖 [Carried] Flag: visa".to_string()));

    h.store
        .edit("a", |r| {
            r.labels.remove("Do not contact");
        })
        .await
        .unwrap();
    h.pass().await;
    assert!(!h
        .labels("c")
        .await
        .contains(&"🤖 [Carried] Do not contact".to_string()));

    h.assert_settled().await;
}

#[tokio::test]
async fn each_record_is_reconciled_a_bounded_number_of_times() {
    let h = Harness::new(
        vec![
            record("a", "e1", 0, Some("posting-a")),
            record("b", "e1", 1, Some("posting-a")),
            record("c", "e1", 2, Some("posting-a")),
        ],
        no_rules(),
    );

    let summary = h.pass().await;
    assert_eq!(summary.processed, 3);
    // one pass of its own plus at most one re-run after consolidation
    assert!(summary.updated <= 6, "{summary:?}");
    let metadata_writes = h
        .store
        .writes()
        .await
        .into_iter()
        .filter(|w| matches!(w, WriteCall::AddAnnotations { .. }))
        .count();
    assert!(metadata_writes <= 6);
}

#[tokio::test]
async fn cancelled_pass_stops_before_the_next_record() {
    let h = Harness::new(
        vec![
            record("r1", "e1", 0, Some("posting-a")),
            record("r2", "e2", 0, Some("posting-a")),
        ],
        no_rules(),
    );
    h.driver.cancel_flag().store(true, Ordering::SeqCst);

    let summary = h.pass().await;
    assert!(summary.cancelled);
    assert_eq!(summary.processed, 0);
    assert!(h.store.writes().await.is_empty());
}

#[tokio::test]
async fn single_record_run_consolidates_its_group() {
    let h = Harness::new(
        vec![record("a", "e1", 0, Some("posting-a")), record("b", "e1", 1, Some("posting-a"))],
        no_rules(),
    );

    let summary = h.driver.process_one("b").await.unwrap();
    assert_eq!(summary.processed, 2);
    assert_eq!(summary.consolidated_groups, 1);
    assert!(h
        .labels("a")
        .await
        .contains(&LABEL_ARCHIVED_DUPLICATE.to_string()));

    assert!(h.driver.process_one("missing").await.is_err());
}

#[tokio::test]
async fn persisted_bookkeeping_is_read_without_a_spurious_change() {
    let blob = format!(
        "{METADATA_ANNOTATION_PREFIX}r1?last_change_detected={}&tag_checksum=e9a2b7ae1acd5a8192b68e1c4aa9fd9e",
        day(0).timestamp_millis()
    );
    let mut r = record("r1", "e1", 0, Some("posting-a")).with_labels(["Phone screen"]);
    r.annotations.insert(blob);
    let h = Harness::new(vec![r], no_rules());

    let summary = h.pass().await;
    assert_eq!(summary.notified, 0);
    assert!(h.dispatcher.sent().is_empty());

    h.assert_settled().await;
}

#[tokio::test]
async fn store_failure_on_one_record_does_not_stop_the_pass() {
    let h = Harness::failing(
        vec![
            record("r1", "e1", 0, Some("posting-a")),
            record("r2", "e2", 0, Some("posting-a")),
        ],
        FailOn::AddAnnotations,
        "r1",
    );

    let summary = h.pass().await;
    assert_eq!(summary.errored, 1);
    assert_eq!(summary.processed, 1);
    assert!(h
        .store
        .writes()
        .await
        .iter()
        .any(|w| matches!(w, WriteCall::AddAnnotations { id, .. } if id == "r2")));
    assert!(h.store.snapshot("r1").await.unwrap().annotations.is_empty());
}

#[tokio::test]
async fn failed_consolidation_commit_is_counted_and_the_group_continues() {
    let h = Harness::failing(
        vec![
            record("a", "e1", 0, Some("posting-a")),
            record("b", "e1", 1, Some("posting-a")),
        ],
        FailOn::AddLabels,
        "a",
    );

    let summary = h.pass().await;
    assert_eq!(summary.errored, 1);
    assert_eq!(summary.consolidated_groups, 1);
    assert!(h.labels("a").await.is_empty());
    assert!(h
        .labels("b")
        .await
        .contains(&"🤖 Duplicate: single".to_string()));
}

#[tokio::test]
async fn newer_record_in_a_settled_group_archives_the_previous_one() {
    let h = Harness::new(
        vec![record("t1", "e1", 0, Some("posting-a")), record("t3", "e1", 2, Some("posting-a"))],
        no_rules(),
    );
    h.pass().await;
    h.assert_settled().await;
    let archived = LABEL_ARCHIVED_DUPLICATE.to_string();
    assert!(!h.labels("t3").await.contains(&archived));

    h.store.insert(record("t4", "e1", 5, Some("posting-a"))).await;
    h.pass().await;

    assert!(h.labels("t1").await.contains(&archived));
    assert!(h.labels("t3").await.contains(&archived));
    let t4 = h.labels("t4").await;
    assert!(!t4.contains(&archived));
    assert!(t4.contains(&"🤖 Duplicate: single".to_string()));

    h.assert_settled().await;
}

#[tokio::test]
async fn record_left_alone_in_its_group_loses_group_labels() {
    let h = Harness::new(
        vec![record("a", "e1", 0, Some("posting-a")), record("b", "e1", 1, Some("posting-a"))],
        no_rules(),
    );
    h.pass().await;
    let a = h.labels("a").await;
    assert!(a.contains(&LABEL_ARCHIVED_DUPLICATE.to_string()));
    assert!(a.contains(&"🤖 Duplicate: single".to_string()));

    h.store
        .edit("b", |r| r.bucket = Some("posting-elsewhere".to_string()))
        .await
        .unwrap();
    let summary = h.pass().await;
    assert_eq!(summary.consolidated_groups, 0);

    let a = h.labels("a").await;
    assert!(!a.contains(&LABEL_ARCHIVED_DUPLICATE.to_string()), "{a:?}");
    assert!(a.iter().all(|l| !l.starts_with("🤖 Duplicate")), "{a:?}");

    h.assert_settled().await;
}

#[tokio::test]
async fn record_whose_sibling_was_deleted_loses_group_labels() {
    let h = Harness::new(
        vec![
            record("a", "e1", 0, Some("posting-a")).with_labels(["Do not contact"]),
            record("b", "e1", 10, Some("posting-b")),
        ],
        no_rules(),
    );
    h.pass().await;
    assert!(h
        .labels("b")
        .await
        .contains(&"🤖 [Carried] Do not contact".to_string()));

    h.store.remove("a").await.unwrap();
    h.pass().await;

    let b = h.labels("b").await;
    assert!(b.iter().all(|l| !l.starts_with("🤖 ")), "{b:?}");

    h.assert_settled().await;
}

fn coffee_chat(id: &str, rating: &str) -> Feedback {
    Feedback {
        id: id.to_string(),
        title: "Coffee chat".to_string(),
        completed_at: None,
        fields: BTreeMap::from([("Overall rating".to_string(), rating.to_string())]),
    }
}

#[tokio::test]
async fn feedback_summaries_follow_the_rules_version() {
    let rules = Arc::new(YamlRuleEngine::from_yaml_str(FEEDBACK_RULES).unwrap());
    let v1 = rules.version().unwrap();
    let h = Harness::new(vec![record("r1", "e1", 0, Some("posting-a"))], rules);
    let mut interview = coffee_chat("fb3", "1");
    interview.title = "Technical interview".to_string();
    h.store
        .set_feedback(
            "r1",
            vec![coffee_chat("fb1", "4"), coffee_chat("fb2", "2"), interview],
        )
        .await;

    let summary = h.pass().await;
    assert_eq!(summary.notified, 0);
    let feedback_annotations = |record: Record| -> Vec<String> {
        record
            .annotations
            .into_iter()
            .filter(|a| a.starts_with("http://🤖/feedback/"))
            .collect()
    };
    assert_eq!(
        feedback_annotations(h.store.snapshot("r1").await.unwrap()),
        vec![
            "http://🤖/feedback/all/?coffee_rating=4%2C+2".to_string(),
            format!("http://🤖/feedback/fb1/{v1}?coffee_rating=4"),
            format!("http://🤖/feedback/fb2/{v1}?coffee_rating=2"),
        ]
    );
    h.assert_settled().await;

    let rules = Arc::new(
        YamlRuleEngine::from_yaml_str(&FEEDBACK_RULES.replace("version: 1", "version: 2"))
            .unwrap(),
    );
    let v2 = rules.version().unwrap();
    assert_ne!(v1, v2);
    let h = Harness::over(
        Arc::clone(&h.store) as Arc<dyn RecordStore>,
        Arc::clone(&h.store),
        rules,
    );
    h.pass().await;
    assert_eq!(
        feedback_annotations(h.store.snapshot("r1").await.unwrap()),
        vec![
            "http://🤖/feedback/all/?coffee_rating=4%2C+2".to_string(),
            format!("http://🤖/feedback/fb1/{v2}?coffee_rating=4"),
            format!("http://🤖/feedback/fb2/{v2}?coffee_rating=2"),
        ]
    );
    h.assert_settled().await;
}

#[tokio::test]
async fn cancellation_during_consolidation_marks_the_summary() {
    let h = Harness::new(
        vec![record("a", "e1", 0, Some("posting-a")), record("b", "e1", 1, Some("posting-a"))],
        no_rules(),
    );
    h.driver.cancel_flag().store(true, Ordering::SeqCst);

    let summary = h.driver.process_one("b").await.unwrap();
    assert!(summary.cancelled);
    assert_eq!(summary.consolidated_groups, 0);
    assert!(h.labels("a").await.is_empty());
}
