//! Duplicate-group consolidation: records sharing an entity get a duplicate
//! type, archival, provenance and carried-forward labels.

use std::collections::{BTreeSet, HashMap, HashSet};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tagsync_core::{
    BucketClass, LabelSet, RecordId, WorkingRecord, LABEL_ARCHIVED_DUPLICATE, LABEL_CARRIED_PREFIX,
    LABEL_DUPLICATE_PREFIX, LABEL_HISTORIC_PREFIX, LABEL_ORIGINAL_PREFIX,
};
use tagsync_storage::Mutator;
use tracing::{debug, error, info};

use crate::config::ConsolidationConfig;
use crate::driver::{PassDriver, PassState};

const UNASSIGNED_BUCKET_KEY: &str = "unassigned";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateType {
    /// Only unassigned records.
    General,
    /// One recognized bucket, nothing unassigned.
    Single,
    SinglePlusGeneral,
    /// Two or more recognized buckets.
    Multiple,
}

impl DuplicateType {
    pub fn as_str(self) -> &'static str {
        match self {
            DuplicateType::General => "general",
            DuplicateType::Single => "single",
            DuplicateType::SinglePlusGeneral => "single_plus_general",
            DuplicateType::Multiple => "multiple",
        }
    }

    pub fn label(self) -> String {
        format!("{LABEL_DUPLICATE_PREFIX}{}", self.as_str())
    }
}

pub fn classify_duplicate_type<'a, I>(classes: I) -> DuplicateType
where
    I: IntoIterator<Item = &'a BucketClass>,
{
    let mut recognized = BTreeSet::new();
    let mut unassigned = false;
    for class in classes {
        match class {
            BucketClass::Recognized(name) => {
                recognized.insert(name.as_str());
            }
            BucketClass::Unassigned => unassigned = true,
            BucketClass::OutOfScope => {}
        }
    }
    match (recognized.len(), unassigned) {
        (0, _) => DuplicateType::General,
        (1, false) => DuplicateType::Single,
        (1, true) => DuplicateType::SinglePlusGeneral,
        _ => DuplicateType::Multiple,
    }
}

fn bucket_key(class: &BucketClass) -> &str {
    match class {
        BucketClass::Recognized(name) => name,
        _ => UNASSIGNED_BUCKET_KEY,
    }
}

/// What consolidation needs to know about one in-scope group member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberFacts {
    pub id: RecordId,
    pub created_at: DateTime<Utc>,
    pub bucket: BucketClass,
    pub labels: LabelSet,
}

/// Labels consolidation wants on one member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberPlan {
    pub id: RecordId,
    /// Full `[Carried]` labels.
    pub carried: LabelSet,
    /// Full `[Original]`/`[Historic]` label, if the baseline has a source.
    pub provenance: Option<String>,
    pub archived: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupPlan {
    pub duplicate_type: DuplicateType,
    pub members: Vec<MemberPlan>,
}

/// Most recently created member per bucket key.
pub fn latest_per_bucket(members: &[MemberFacts]) -> HashMap<String, RecordId> {
    let mut latest: HashMap<&str, &MemberFacts> = HashMap::new();
    for member in members {
        latest
            .entry(bucket_key(&member.bucket))
            .and_modify(|current| {
                if (current.created_at, &current.id) <= (member.created_at, &member.id) {
                    *current = member;
                }
            })
            .or_insert(member);
    }
    latest
        .into_iter()
        .map(|(key, member)| (key.to_string(), member.id.clone()))
        .collect()
}

fn source_of(labels: &LabelSet, prefix: Option<&str>) -> Option<String> {
    let prefix = prefix?;
    labels
        .iter()
        .find_map(|l| l.strip_prefix(prefix))
        .map(str::to_string)
}

/// Plan labels for a group already ordered by `(created_at, id)`.
pub fn plan_group(members: &[MemberFacts], config: &ConsolidationConfig) -> GroupPlan {
    let duplicate_type = classify_duplicate_type(members.iter().map(|m| &m.bucket));
    let latest = latest_per_bucket(members);
    let window = config.decay_window();
    let source_prefix = config.source_label_prefix.as_deref();

    let mut plans = Vec::with_capacity(members.len());
    let mut accumulated = LabelSet::new();
    let mut baseline_source: Option<String> = None;
    let mut previous: Option<&MemberFacts> = None;

    for member in members {
        let carried: LabelSet = accumulated
            .iter()
            .map(|label| format!("{LABEL_CARRIED_PREFIX}{label}"))
            .collect();

        let provenance = match previous {
            None => {
                baseline_source = source_of(&member.labels, source_prefix);
                None
            }
            Some(prev) => {
                let within_window = member.created_at - prev.created_at <= window;
                let family = if within_window {
                    LABEL_ORIGINAL_PREFIX
                } else {
                    LABEL_HISTORIC_PREFIX
                };
                let label = baseline_source
                    .as_ref()
                    .map(|source| format!("{family}{source}"));
                if !within_window {
                    baseline_source = source_of(&member.labels, source_prefix);
                }
                label
            }
        };

        let archived = latest
            .get(bucket_key(&member.bucket))
            .is_some_and(|latest_id| latest_id != &member.id);

        plans.push(MemberPlan {
            id: member.id.clone(),
            carried,
            provenance,
            archived,
        });

        accumulated.extend(
            member
                .labels
                .iter()
                .filter(|label| config.qualifies_for_carry_forward(label))
                .cloned(),
        );
        previous = Some(member);
    }

    GroupPlan {
        duplicate_type,
        members: plans,
    }
}

/// Queue `desired`, and removal of every other label under `prefixes`.
async fn assert_family(
    mutator: &Mutator<'_>,
    working: &mut WorkingRecord,
    prefixes: &[&str],
    desired: LabelSet,
) -> Result<()> {
    let stale: LabelSet = prefixes
        .iter()
        .flat_map(|prefix| working.labels_with_prefix(prefix))
        .filter(|label| !desired.contains(label))
        .collect();
    mutator.remove_labels(working, stale).await?;
    mutator.add_labels(working, desired).await?;
    Ok(())
}

impl PassDriver {
    pub(crate) async fn consolidate(&self, entity_id: &str, state: &mut PassState) -> Result<()> {
        let group = self
            .store
            .fetch_by_entity(entity_id)
            .await
            .with_context(|| format!("fetching records of entity {entity_id}"))?;

        let mut members: Vec<(WorkingRecord, BucketClass)> = group
            .into_iter()
            .filter(|record| !record.anonymized)
            .map(|record| {
                let class = self.catalog.classify(&record);
                (WorkingRecord::new(record), class)
            })
            .filter(|(_, class)| class.is_in_scope())
            .collect();
        members.sort_by(|(a, _), (b, _)| {
            a.record
                .created_at
                .cmp(&b.record.created_at)
                .then_with(|| a.record.id.cmp(&b.record.id))
        });

        for (working, _) in members.iter_mut() {
            if self.is_cancelled() {
                state.summary.cancelled = true;
                return Ok(());
            }
            if !state.processed.contains(working.id()) {
                self.process_tracked(working, state).await;
            }
        }

        let mutator = Mutator::new(self.store.as_ref());
        let mut rerun: HashSet<RecordId> = HashSet::new();

        if members.len() < 2 {
            debug!(
                in_scope = members.len(),
                "fewer than two in-scope records; clearing consolidation labels"
            );
            for (working, _) in members.iter_mut() {
                let cleared = MemberPlan {
                    id: working.id().clone(),
                    carried: LabelSet::new(),
                    provenance: None,
                    archived: false,
                };
                self.settle_member(&mutator, working, cleared, LabelSet::new(), state, &mut rerun)
                    .await?;
            }
            return Ok(());
        }

        let facts: Vec<MemberFacts> = members
            .iter()
            .map(|(working, class)| MemberFacts {
                id: working.id().clone(),
                created_at: working.record.created_at,
                bucket: class.clone(),
                labels: working.labels(),
            })
            .collect();
        let plan = plan_group(&facts, &self.consolidation);
        state.summary.consolidated_groups += 1;
        info!(
            members = facts.len(),
            duplicate_type = plan.duplicate_type.as_str(),
            "consolidating duplicate group"
        );

        let duplicate_label: LabelSet = [plan.duplicate_type.label()].into();
        for ((working, _), member) in members.iter_mut().zip(plan.members) {
            if self.is_cancelled() {
                state.summary.cancelled = true;
                return Ok(());
            }
            self.settle_member(&mutator, working, member, duplicate_label.clone(), state, &mut rerun)
                .await?;
        }
        Ok(())
    }

    /// Queues one member's consolidation labels in a single batch, commits
    /// them, and re-runs the member once if anything was written.
    async fn settle_member(
        &self,
        mutator: &Mutator<'_>,
        working: &mut WorkingRecord,
        member: MemberPlan,
        duplicate_label: LabelSet,
        state: &mut PassState,
        rerun: &mut HashSet<RecordId>,
    ) -> Result<()> {
        {
            let _batch = working.queue.begin_batch();
            assert_family(mutator, working, &[LABEL_CARRIED_PREFIX], member.carried).await?;
            assert_family(
                mutator,
                working,
                &[LABEL_ORIGINAL_PREFIX, LABEL_HISTORIC_PREFIX],
                member.provenance.into_iter().collect(),
            )
            .await?;
            let archival: LabelSet = [LABEL_ARCHIVED_DUPLICATE.to_string()].into();
            if member.archived {
                mutator.add_labels(working, archival).await?;
            } else {
                mutator.remove_labels(working, archival).await?;
            }
            assert_family(mutator, working, &[LABEL_DUPLICATE_PREFIX], duplicate_label).await?;
        }

        let committed = match mutator.commit(working).await {
            Ok(committed) => committed,
            Err(err) => {
                state.summary.errored += 1;
                error!(record_id = %member.id, error = %err, "failed to commit consolidation labels");
                return Ok(());
            }
        };
        if committed && rerun.insert(member.id.clone()) {
            debug!(record_id = %member.id, "consolidation changed labels; re-running record");
            self.process_tracked(working, state).await;
        }
        Ok(())
    }
}
