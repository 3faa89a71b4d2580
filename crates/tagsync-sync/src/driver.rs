//! Single-record reconciliation and the paged pass over the collection.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tagsync_core::change::{has_changed, latest_change};
use tagsync_core::metadata::{self, KEY_LINK_RULES};
use tagsync_core::{
    legacy, Attribute, EntityId, LabelSet, RecordId, WorkingRecord, LABEL_DUPLICATE_PREFIX,
    RULE_ANNOTATION_PREFIX,
};
use tagsync_rules::RuleEngine;
use tagsync_storage::{Mutator, RecordFilter, RecordStore};
use tracing::{debug, error, info, info_span, Instrument};
use uuid::Uuid;

use crate::config::{BucketCatalog, ConsolidationConfig};
use crate::notify::{is_notifiable, last_notified_change, Notifier};

const PROGRESS_EVERY: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Anonymized,
    /// Bucket not configured: only legacy cleanup ran.
    OutOfScope { updated: bool },
    Reconciled { updated: bool, notified: bool },
}

impl RecordOutcome {
    pub fn updated(&self) -> bool {
        match self {
            RecordOutcome::Anonymized => false,
            RecordOutcome::OutOfScope { updated } => *updated,
            RecordOutcome::Reconciled { updated, .. } => *updated,
        }
    }

    pub fn notified(&self) -> bool {
        matches!(self, RecordOutcome::Reconciled { notified: true, .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PassSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub processed: usize,
    pub updated: usize,
    pub notified: usize,
    pub errored: usize,
    pub anonymized: usize,
    pub skipped_out_of_scope: usize,
    pub unique_entities: usize,
    pub entities_with_duplicates: usize,
    pub entities_with_3_plus: usize,
    pub consolidated_groups: usize,
    pub cancelled: bool,
}

impl PassSummary {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            processed: 0,
            updated: 0,
            notified: 0,
            errored: 0,
            anonymized: 0,
            skipped_out_of_scope: 0,
            unique_entities: 0,
            entities_with_duplicates: 0,
            entities_with_3_plus: 0,
            consolidated_groups: 0,
            cancelled: false,
        }
    }

    fn record(&mut self, outcome: RecordOutcome, first_visit: bool) {
        if first_visit {
            self.processed += 1;
            match outcome {
                RecordOutcome::Anonymized => self.anonymized += 1,
                RecordOutcome::OutOfScope { .. } => self.skipped_out_of_scope += 1,
                RecordOutcome::Reconciled { .. } => {}
            }
        }
        if outcome.notified() {
            self.notified += 1;
        }
        if outcome.updated() {
            self.updated += 1;
            if self.updated % PROGRESS_EVERY == 0 {
                self.log_progress();
            }
        }
    }

    fn log_progress(&self) {
        info!(
            run_id = %self.run_id,
            processed = self.processed,
            entities = self.unique_entities,
            updated = self.updated,
            notified = self.notified,
            errored = self.errored,
            "pass progress"
        );
    }
}

/// Bookkeeping for one pass.
pub(crate) struct PassState {
    pub(crate) processed: HashSet<RecordId>,
    sightings: HashMap<EntityId, usize>,
    consolidated: HashSet<EntityId>,
    pub(crate) summary: PassSummary,
}

impl PassState {
    fn new() -> Self {
        Self {
            processed: HashSet::new(),
            sightings: HashMap::new(),
            consolidated: HashSet::new(),
            summary: PassSummary::new(),
        }
    }

    fn sight(&mut self, entity_id: &str) -> usize {
        let count = self.sightings.entry(entity_id.to_string()).or_insert(0);
        *count += 1;
        match *count {
            1 => self.summary.unique_entities += 1,
            2 => self.summary.entities_with_duplicates += 1,
            3 => self.summary.entities_with_3_plus += 1,
            _ => {}
        }
        *count
    }
}

pub struct PassDriver {
    pub(crate) store: Arc<dyn RecordStore>,
    pub(crate) rules: Arc<dyn RuleEngine>,
    notifier: Notifier,
    pub(crate) consolidation: ConsolidationConfig,
    pub(crate) catalog: BucketCatalog,
    cancel: Arc<AtomicBool>,
}

impl PassDriver {
    pub fn new(
        store: Arc<dyn RecordStore>,
        rules: Arc<dyn RuleEngine>,
        notifier: Notifier,
        consolidation: ConsolidationConfig,
    ) -> Self {
        let catalog = consolidation.catalog();
        Self {
            store,
            rules,
            notifier,
            consolidation,
            catalog,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Reconcile one record: detect changes, apply rules, notify, write
    /// bookkeeping back, commit.
    pub async fn process_record(&self, working: &mut WorkingRecord) -> Result<RecordOutcome> {
        if working.record.anonymized {
            debug!("anonymized; skipping");
            return Ok(RecordOutcome::Anonymized);
        }

        let now = Utc::now();
        let mutator = Mutator::new(self.store.as_ref());
        let bucket = self.catalog.classify(&working.record);
        let mut notified = false;

        {
            let _batch = working.queue.begin_batch();

            let mut change = latest_change(working, now);
            let mut notify = is_notifiable(&change, last_notified_change(working));

            self.remove_legacy_attributes(working, &mutator).await?;

            if bucket.is_in_scope() {
                self.apply_rules(working, &mutator, notify)
                    .await
                    .with_context(|| format!("applying rules to {}", working.id()))?;

                for attribute in [Attribute::Labels, Attribute::Annotations] {
                    if let Some(update) = has_changed(working, attribute, now) {
                        change = update;
                        notify = true;
                    }
                }

                if notify {
                    self.notifier.notify_of_change(working, &bucket, &change);
                    notified = bucket.is_recognized();
                } else {
                    Notifier::advance_without_change(working);
                }
                metadata::write_back(working);
            }
        }

        let updated = mutator
            .commit(working)
            .await
            .with_context(|| format!("committing {}", working.id()))?;

        Ok(if bucket.is_in_scope() {
            RecordOutcome::Reconciled { updated, notified }
        } else {
            RecordOutcome::OutOfScope { updated }
        })
    }

    async fn remove_legacy_attributes(
        &self,
        working: &mut WorkingRecord,
        mutator: &Mutator<'_>,
    ) -> Result<()> {
        let labels: LabelSet = [
            legacy::TAG_CHECKSUM_PREFIX,
            legacy::LAST_CHANGE_PREFIX,
            legacy::AUTO_TAG_PREFIX,
        ]
        .into_iter()
        .flat_map(|prefix| working.labels_with_prefix(prefix))
        .collect();
        let annotations: LabelSet = [legacy::LINK_CHECKSUM_PREFIX, legacy::METADATA_PREFIX]
            .into_iter()
            .flat_map(|prefix| working.annotations_with_prefix(prefix))
            .collect();

        mutator.remove_labels(working, labels).await?;
        mutator.remove_annotations(working, annotations).await?;
        Ok(())
    }

    async fn apply_rules(
        &self,
        working: &mut WorkingRecord,
        mutator: &Mutator<'_>,
        refresh_annotations: bool,
    ) -> Result<()> {
        let derived = self.rules.derive_labels(&working.record)?;
        let stale: LabelSet = working
            .labels()
            .intersection(&self.rules.owned_labels())
            .filter(|label| !derived.contains(*label))
            .cloned()
            .collect();
        let added: Vec<String> = derived
            .iter()
            .filter(|label| !working.has_label(label))
            .cloned()
            .collect();

        mutator.add_labels(working, derived).await?;
        mutator.remove_labels(working, stale).await?;
        for label in &added {
            debug!(label = %label, "rule label added");
            if let Some(note) = self.rules.note_for(&working.record, label) {
                mutator.add_note(working, &note).await?;
            }
        }

        let Some(version) = self.rules.version() else {
            return Ok(());
        };
        let version_moved = working.metadata().get(KEY_LINK_RULES) != Some(version.as_str());
        if version_moved || refresh_annotations {
            let derived = self.rules.derive_annotations(&working.record)?;
            let stale: LabelSet = working
                .annotations_with_prefix(RULE_ANNOTATION_PREFIX)
                .into_iter()
                .filter(|a| !derived.contains(a))
                .collect();
            mutator.add_annotations(working, derived).await?;
            mutator.remove_annotations(working, stale).await?;
            working.metadata().set(KEY_LINK_RULES, version.clone());
        }
        self.refresh_feedback(working, mutator, &version).await
    }

    /// Process a record and fold the outcome into the pass summary. Failures
    /// are logged and counted, never propagated.
    pub(crate) async fn process_tracked(&self, working: &mut WorkingRecord, state: &mut PassState) {
        let record_id = working.id().clone();
        let first_visit = state.processed.insert(record_id.clone());
        let span = info_span!("record", record_id = %record_id);
        match self.process_record(working).instrument(span).await {
            Ok(outcome) => {
                debug!(record_id = %record_id, ?outcome, "record processed");
                state.summary.record(outcome, first_visit);
            }
            Err(err) => {
                error!(record_id = %record_id, error = ?err, "record failed; skipping until next pass");
                state.summary.errored += 1;
            }
        }
    }

    /// One pass over every record matching `filter`.
    pub async fn run_pass(&self, filter: &RecordFilter) -> Result<PassSummary> {
        let mut state = PassState::new();
        info!(run_id = %state.summary.run_id, ?filter, "starting reconciliation pass");

        let mut cursor: Option<String> = None;
        'pages: loop {
            let page = match self.store.fetch_page(filter, cursor.as_deref()).await {
                Ok(page) => page,
                Err(err) => {
                    error!(error = %err, "fetching record page failed; ending pass early");
                    state.summary.errored += 1;
                    break;
                }
            };

            for record in page.records {
                if self.is_cancelled() {
                    info!("cancellation requested; stopping pass");
                    state.summary.cancelled = true;
                    break 'pages;
                }

                let entity_id = record.entity_id.clone();
                let sightings = state.sight(&entity_id);
                let carries_group_labels = record
                    .labels
                    .iter()
                    .any(|label| label.starts_with(LABEL_DUPLICATE_PREFIX));
                if !state.processed.contains(&record.id) {
                    let mut working = WorkingRecord::new(record);
                    self.process_tracked(&mut working, &mut state).await;
                }

                // A record left alone in its group still needs its group labels cleared.
                let group_due = sightings == 2 || (sightings == 1 && carries_group_labels);
                if group_due && state.consolidated.insert(entity_id.clone()) {
                    self.consolidate_tracked(&entity_id, &mut state).await;
                }
            }

            match page.next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        state.summary.finished_at = Utc::now();
        let s = &state.summary;
        info!(
            run_id = %s.run_id,
            processed = s.processed,
            entities = s.unique_entities,
            updated = s.updated,
            notified = s.notified,
            errored = s.errored,
            anonymized = s.anonymized,
            out_of_scope = s.skipped_out_of_scope,
            entities_with_duplicates = s.entities_with_duplicates,
            entities_with_3_plus = s.entities_with_3_plus,
            cancelled = s.cancelled,
            "pass finished"
        );
        Ok(state.summary)
    }

    /// Reconcile a single record by id, consolidating its entity's group when
    /// it has siblings.
    pub async fn process_one(&self, id: &str) -> Result<PassSummary> {
        let mut state = PassState::new();
        let record = self
            .store
            .fetch(id)
            .await
            .with_context(|| format!("fetching record {id}"))?;
        let entity_id = record.entity_id.clone();
        state.sight(&entity_id);

        let mut working = WorkingRecord::new(record);
        self.process_tracked(&mut working, &mut state).await;
        self.consolidate_tracked(&entity_id, &mut state).await;

        state.summary.finished_at = Utc::now();
        Ok(state.summary)
    }

    async fn consolidate_tracked(&self, entity_id: &str, state: &mut PassState) {
        let span = info_span!("consolidate", entity_id);
        if let Err(err) = self.consolidate(entity_id, state).instrument(span).await {
            error!(entity_id, error = ?err, "consolidation failed; skipping group");
            state.summary.errored += 1;
        }
    }
}
