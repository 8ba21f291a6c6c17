use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use crate::{
    correlation::{CorrelationStore, TargetLink},
    error::{JobErrorKind, OrchestratorResult},
    events::{ChangeEvent, EventKind},
    jobs::{JobOutcome, JobQueue, JobUpdate},
    ledger::{fetch, paths, store},
    models::{ArtifactMeta, TargetJob, TargetRecord, TargetStatus, TargetUpdate},
    portal::Portal,
    registry::Completion,
    state::AppState,
    validation::classify::classify,
};

use super::{rejection, results, settle_document_job, EventHandler, Execution};

/// Target Job Correlator and Target Status Handler.
pub struct TargetJobChange;

impl TargetJobChange {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TargetJobChange {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TargetOutcome {
    Uncorrelated,
    Progress { notes: usize },
    Succeeded(results::ResultOutcome),
    Failed {
        kind: JobErrorKind,
        rejected: bool,
        completion: Completion,
    },
}

#[async_trait]
impl EventHandler for TargetJobChange {
    fn kind(&self) -> EventKind {
        EventKind::TargetJob
    }

    async fn handle(&self, state: Arc<AppState>, event: ChangeEvent) -> Execution {
        let ChangeEvent::TargetJob {
            target_id,
            input,
            updates,
        } = event
        else {
            return Execution::Failed {
                error: "target handler received a non-target event".into(),
            };
        };

        match handle_target_change(&state, &target_id, input.as_deref(), &updates).await {
            Ok(TargetOutcome::Uncorrelated) => {
                Execution::skipped(format!("extraction job {target_id} is not correlated"))
            }
            Ok(_) => Execution::Success,
            Err(err) => {
                warn!(target_id = %target_id, error = %err, "failed to handle extraction job change");
                Execution::from_error(&state, err)
            }
        }
    }
}

pub async fn handle_target_change(
    state: &AppState,
    target_id: &str,
    input: Option<&str>,
    updates: &[(String, TargetUpdate)],
) -> OrchestratorResult<TargetOutcome> {
    let mut link = state.correlations.target(target_id).await?;
    if link.is_none() {
        if let Some(input) = input {
            link = correlate(state, target_id, input).await?;
        }
    }
    let Some(link) = link else {
        return Ok(TargetOutcome::Uncorrelated);
    };

    let record_path = format!(
        "{}/targets/{target_id}",
        paths::document_meta(&link.business_id, &link.document_id)
    );
    let forwarded = fetch::<TargetRecord>(state.ledger.as_ref(), &record_path)
        .await?
        .map(|record| record.forwarded)
        .unwrap_or_default();

    let mut notes = 0;
    for (update_id, update) in updates {
        match update.status {
            TargetStatus::Started | TargetStatus::Identified => {
                if forwarded.contains_key(update_id) {
                    continue;
                }
                forward_progress(state, target_id, &link, update).await?;
                store(
                    state.ledger.as_ref(),
                    &format!("{record_path}/forwarded/{update_id}"),
                    &true,
                )
                .await?;
                notes += 1;
            }
            TargetStatus::Error => {
                state
                    .queue
                    .post_job_update(
                        link.job_id,
                        JobUpdate::note(
                            "target-error",
                            update.information.clone().unwrap_or_default(),
                        ),
                    )
                    .await?;
            }
            TargetStatus::Success => {
                info!(target_id, update_id = %update_id, job_id = %link.job_id, "extraction succeeded");
                return on_success(state, target_id, &link).await;
            }
            TargetStatus::Failure => {
                info!(target_id, update_id = %update_id, job_id = %link.job_id, "extraction failed");
                return on_failure(state, target_id, &link, update, updates).await;
            }
        }
    }

    Ok(TargetOutcome::Progress { notes })
}

/// Attributes a new extraction job to the newest job that staged its input.
/// Returns `None` when the artifact carries no job reference.
pub async fn correlate(
    state: &AppState,
    target_id: &str,
    input: &str,
) -> OrchestratorResult<Option<TargetLink>> {
    let meta: ArtifactMeta = fetch(state.ledger.as_ref(), &paths::artifact_meta(input))
        .await?
        .unwrap_or_default();

    let Some((job_key, job_ref)) = meta.most_recent_job() else {
        warn!(target_id, input, "no job reference on input artifact; abandoning");
        return Ok(None);
    };

    let Some(record) = state.queue.get_job(job_ref.job_id).await? else {
        warn!(target_id, job_id = %job_ref.job_id, "artifact references a missing job; abandoning");
        return Ok(None);
    };

    if record.status.is_terminal() {
        info!(target_id, job_id = %record.id, "job already finished; not correlating");
        return Ok(None);
    }

    let link = TargetLink {
        job_key: job_key.clone(),
        job_id: job_ref.job_id,
        business_id: record.config.business_id.clone(),
        document_id: record.config.document_id.clone(),
        seq: job_ref.seq,
    };

    // A record on the document means this extraction job was correlated
    // before and its link has since been released.
    let meta_path = paths::document_meta(&link.business_id, &link.document_id);
    let seen: Option<TargetRecord> =
        fetch(state.ledger.as_ref(), &format!("{meta_path}/targets/{target_id}")).await?;
    if seen.is_some() {
        info!(target_id, job_id = %link.job_id, "extraction job already handled");
        return Ok(None);
    }

    state.correlations.link_target(target_id, link.clone()).await?;
    store(
        state.ledger.as_ref(),
        &format!("{meta_path}/targets/{target_id}"),
        &TargetRecord {
            job_key: link.job_key.clone(),
            job_id: link.job_id,
            seq: link.seq,
            result: None,
            forwarded: Default::default(),
        },
    )
    .await?;
    state
        .queue
        .post_job_update(
            link.job_id,
            JobUpdate::note("target-linked", format!("Extraction job {target_id} attached")),
        )
        .await?;

    info!(target_id, job_id = %link.job_id, job_key = %link.job_key, seq = link.seq, "extraction job correlated");
    Ok(Some(link))
}

async fn forward_progress(
    state: &AppState,
    target_id: &str,
    link: &TargetLink,
    update: &TargetUpdate,
) -> OrchestratorResult<()> {
    let text = match (update.status, update.information.as_deref()) {
        (TargetStatus::Identified, Some(info)) => format!("Document identified: {info}"),
        (TargetStatus::Identified, None) => "Document identified".to_string(),
        (_, Some(info)) => format!("Extraction started: {info}"),
        (_, None) => "Extraction started".to_string(),
    };

    state
        .queue
        .post_job_update(link.job_id, JobUpdate::note("target-progress", text.clone()))
        .await?;
    state
        .portal
        .post_progress_note(&link.business_id, &link.document_id, &text)
        .await?;
    info!(target_id, job_id = %link.job_id, status = ?update.status, "extraction progress forwarded");
    Ok(())
}

async fn on_success(
    state: &AppState,
    target_id: &str,
    link: &TargetLink,
) -> OrchestratorResult<TargetOutcome> {
    state.queue.mark_in_progress(link.job_id).await?;

    let job: Option<TargetJob> =
        fetch(state.ledger.as_ref(), &paths::target_job(target_id)).await?;
    let Some(result) = job.and_then(|job| job.result) else {
        warn!(target_id, job_id = %link.job_id, "extraction succeeded without a result");
        let completion = settle_document_job(
            state,
            &link.business_id,
            &link.document_id,
            link.job_id,
            JobOutcome::failure(
                JobErrorKind::TargetOther,
                "Extraction reported success without a result.",
            ),
            None,
            None,
        )
        .await?;
        state.correlations.release_target(target_id).await?;
        return Ok(TargetOutcome::Failed {
            kind: JobErrorKind::TargetOther,
            rejected: false,
            completion,
        });
    };

    let meta_path = paths::document_meta(&link.business_id, &link.document_id);
    store(
        state.ledger.as_ref(),
        &format!("{meta_path}/targets/{target_id}/result"),
        &result,
    )
    .await?;

    let outcome = results::validate_and_spawn(state, link, &result).await?;
    state.correlations.release_target(target_id).await?;
    Ok(TargetOutcome::Succeeded(outcome))
}

async fn on_failure(
    state: &AppState,
    target_id: &str,
    link: &TargetLink,
    failure: &TargetUpdate,
    updates: &[(String, TargetUpdate)],
) -> OrchestratorResult<TargetOutcome> {
    let job: Option<TargetJob> =
        fetch(state.ledger.as_ref(), &paths::target_job(target_id)).await?;
    let detail = job
        .as_ref()
        .and_then(TargetJob::latest_error)
        .cloned()
        .or_else(|| {
            updates
                .iter()
                .rev()
                .map(|(_, update)| update)
                .find(|update| update.status == TargetStatus::Error)
                .cloned()
        })
        .unwrap_or_else(|| failure.clone());

    let kind = classify(detail.code.as_deref(), detail.information.as_deref());
    let rejected = kind.rejects_document();
    let message = detail
        .information
        .clone()
        .unwrap_or_else(|| kind.user_message().to_string());

    state
        .queue
        .post_job_update(
            link.job_id,
            JobUpdate::note("target-failure", message.clone()).with_data(json!({
                "kind": kind,
                "auto_reject": rejected,
            })),
        )
        .await?;

    let completion = settle_document_job(
        state,
        &link.business_id,
        &link.document_id,
        link.job_id,
        JobOutcome::failure(kind, message),
        rejection(kind, kind.user_message()),
        None,
    )
    .await?;
    state.correlations.release_target(target_id).await?;

    warn!(
        target_id,
        job_id = %link.job_id,
        %kind,
        auto_reject = rejected,
        ?completion,
        "extraction failure classified"
    );
    Ok(TargetOutcome::Failed {
        kind,
        rejected,
        completion,
    })
}
