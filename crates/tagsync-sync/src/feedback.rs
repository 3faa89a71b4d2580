//! Feedback summaries: one annotation per summarised form, stamped with the
//! rules version, plus a roll-up across forms.

use anyhow::{Context, Result};
use tagsync_core::feedback::{self, FEEDBACK_ALL_PREFIX};
use tagsync_core::{FeedbackSummary, LabelSet, WorkingRecord};
use tagsync_storage::Mutator;
use tracing::debug;

use crate::driver::PassDriver;

impl PassDriver {
    /// Re-summarise the record's feedback when it saw activity since the last
    /// detected change or when a summary was written under other rules, then
    /// keep the roll-up in line with the per-form summaries.
    pub(crate) async fn refresh_feedback(
        &self,
        working: &mut WorkingRecord,
        mutator: &Mutator<'_>,
        version: &str,
    ) -> Result<()> {
        if !self.rules.summarises_feedback() {
            return Ok(());
        }

        let last_change_detected = working.metadata().last_change_detected();
        let active = working.record.last_external_activity > last_change_detected;
        let mut forms = working.annotations();
        forms.retain(|a| feedback::is_form_summary(a));

        if active || feedback::is_outdated(&forms, version) {
            let listed = self
                .store
                .fetch_feedback(working.id())
                .await
                .with_context(|| format!("fetching feedback for {}", working.id()))?;
            let mut desired = LabelSet::new();
            for form in &listed {
                if let Some(summary) = self.rules.summarise_feedback(&working.record, form)? {
                    desired.insert(feedback::summary_annotation(&form.id, version, &summary));
                }
            }
            let stale: LabelSet = forms.difference(&desired).cloned().collect();
            debug!(
                forms = listed.len(),
                summarised = desired.len(),
                stale = stale.len(),
                "feedback summarised"
            );
            mutator.remove_annotations(working, stale).await?;
            mutator.add_annotations(working, desired.clone()).await?;
            forms = desired;
        }

        let summaries: Vec<FeedbackSummary> = forms
            .iter()
            .filter_map(|a| feedback::parse_summary(a))
            .collect();
        let all = self.rules.summarise_all_feedback(&summaries);
        let roll_up: LabelSet = if all.is_empty() {
            LabelSet::new()
        } else {
            [feedback::all_annotation(&all)].into()
        };
        let stale: LabelSet = working
            .annotations_with_prefix(FEEDBACK_ALL_PREFIX)
            .into_iter()
            .filter(|a| !roll_up.contains(a))
            .collect();
        mutator.remove_annotations(working, stale).await?;
        mutator.add_annotations(working, roll_up).await?;
        Ok(())
    }
}
