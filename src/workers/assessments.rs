use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    correlation::{AssessmentLink, CorrelationStore},
    error::{JobErrorKind, OrchestratorError, OrchestratorResult},
    events::{ChangeEvent, EventKind},
    jobs::{JobOutcome, JobQueue, JobUpdate},
    ledger::{fetch, paths, store},
    models::{Assessment, AssessmentState, DocumentMeta, JobKind, JobRef},
    portal::{ApprovalDecision, Portal},
    registry::Completion,
    state::AppState,
    validation::scoring,
};

use super::{rejection, settle_document_job, EventHandler, Execution};

#[derive(Debug, Clone, PartialEq)]
pub enum ResolverOutcome {
    Uncorrelated,
    Ignored(AssessmentState),
    /// Submitted and scored; `pushed` is the state sent to the portal, if any.
    Scored {
        assessment_job: Uuid,
        passed: bool,
        pushed: Option<AssessmentState>,
    },
    Held {
        assessment_job: Uuid,
    },
    Resolved {
        approved: bool,
        completion: Completion,
    },
}

/// Assessment Resolver.
pub struct AssessmentChangeJob;

impl AssessmentChangeJob {
    pub fn new() -> Self {
        Self
    }
}

impl Default for AssessmentChangeJob {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventHandler for AssessmentChangeJob {
    fn kind(&self) -> EventKind {
        EventKind::Assessment
    }

    async fn handle(&self, state: Arc<AppState>, event: ChangeEvent) -> Execution {
        let ChangeEvent::Assessment {
            business_id,
            assessment_id,
        } = event
        else {
            return Execution::Failed {
                error: "assessment handler received a non-assessment event".into(),
            };
        };

        match resolve_assessment(&state, &business_id, &assessment_id).await {
            Ok(ResolverOutcome::Uncorrelated) => {
                Execution::skipped("assessment was not spawned by this system")
            }
            Ok(ResolverOutcome::Ignored(assessment_state)) => {
                Execution::skipped(format!("no action for state {assessment_state:?}"))
            }
            Ok(_) => Execution::Success,
            Err(err) => {
                warn!(assessment_id = %assessment_id, error = %err, "failed to resolve assessment");
                Execution::from_error(&state, err)
            }
        }
    }
}

pub async fn resolve_assessment(
    state: &AppState,
    business_id: &str,
    assessment_id: &str,
) -> OrchestratorResult<ResolverOutcome> {
    let Some(link) = state.correlations.assessment(assessment_id).await? else {
        return Ok(ResolverOutcome::Uncorrelated);
    };

    let assessment: Assessment = fetch(
        state.ledger.as_ref(),
        &paths::assessment_mirror(business_id, assessment_id),
    )
    .await?
    .ok_or_else(|| {
        OrchestratorError::invalid("assessment", format!("{assessment_id} has no mirror"))
    })?;

    match assessment.state {
        AssessmentState::Submitted => on_submitted(state, &assessment, link).await,
        AssessmentState::Approved if assessment.state_set_by(state.actor()) => {
            on_decided(state, &assessment, &link, true).await
        }
        AssessmentState::Approved => {
            info!(assessment_id, updated_by = ?assessment.updated_by, "assessment approved by another actor; leaving for manual handling");
            Ok(ResolverOutcome::Ignored(AssessmentState::Approved))
        }
        // Rejections from any actor close the chain.
        AssessmentState::Rejected => on_decided(state, &assessment, &link, false).await,
        other => Ok(ResolverOutcome::Ignored(other)),
    }
}

async fn on_submitted(
    state: &AppState,
    assessment: &Assessment,
    mut link: AssessmentLink,
) -> OrchestratorResult<ResolverOutcome> {
    let assessment_job = match link.assessment_job {
        Some(job_id) => job_id,
        None => {
            let job_id = create_assessment_job(state, assessment, &link).await?;
            link.assessment_job = Some(job_id);
            state
                .correlations
                .link_assessment(&assessment.id, link.clone())
                .await?;
            job_id
        }
    };

    let policy = &state.config.policy;
    if !policy.auto_approve_assessments {
        return Ok(ResolverOutcome::Held { assessment_job });
    }

    let verdict = scoring::evaluate(assessment, &state.config.scoring);
    state
        .queue
        .post_job_update(
            assessment_job,
            JobUpdate::note(
                "scored",
                if verdict.passed {
                    "Assessment meets every requirement".to_string()
                } else {
                    verdict.failures.join("; ")
                },
            )
            .with_data(json!({ "passed": verdict.passed, "failures": verdict.failures })),
        )
        .await?;

    let pushed = if verdict.passed {
        Some(AssessmentState::Approved)
    } else if policy.auto_reject_assessments {
        Some(AssessmentState::Rejected)
    } else {
        None
    };

    match pushed {
        Some(next) => {
            state
                .portal
                .set_assessment_status(&assessment.business_id, &assessment.id, next)
                .await?;
            info!(assessment_id = %assessment.id, state = ?next, "assessment decided automatically");
        }
        None => {
            info!(
                assessment_id = %assessment.id,
                failures = ?verdict.failures,
                "assessment below requirements; held for manual review"
            );
        }
    }

    Ok(ResolverOutcome::Scored {
        assessment_job,
        passed: verdict.passed,
        pushed,
    })
}

async fn create_assessment_job(
    state: &AppState,
    assessment: &Assessment,
    link: &AssessmentLink,
) -> OrchestratorResult<Uuid> {
    let parent = state
        .queue
        .get_job(link.job_id)
        .await?
        .ok_or(OrchestratorError::UnknownJob(link.job_id))?;

    let mut config = parent.config;
    config.kind = JobKind::Assessment;
    config.assessment_id = Some(assessment.id.clone());

    let record = state.queue.create_job(config).await?;
    let seq = state.sequence.next().await?;
    let job_key = Uuid::new_v4().simple().to_string();
    store(
        state.ledger.as_ref(),
        &format!(
            "{}/jobs/{job_key}",
            paths::document_meta(&link.business_id, &link.document_id)
        ),
        &JobRef {
            job_id: record.id,
            kind: JobKind::Assessment,
            seq,
            staged: true,
        },
    )
    .await?;
    store(
        state.ledger.as_ref(),
        &paths::job_index_entry(&job_key),
        &json!({
            "job_id": record.id,
            "business_id": link.business_id,
            "document_id": link.document_id,
            "assessment_id": assessment.id,
        }),
    )
    .await?;

    info!(assessment_id = %assessment.id, job_id = %record.id, parent_job_id = %link.job_id, "assessment job created");
    Ok(record.id)
}

async fn on_decided(
    state: &AppState,
    assessment: &Assessment,
    link: &AssessmentLink,
    approved: bool,
) -> OrchestratorResult<ResolverOutcome> {
    let (outcome, decision) = if approved {
        (JobOutcome::success(), Some(ApprovalDecision::Approve))
    } else {
        let kind = JobErrorKind::AssociatedAssessmentRejected;
        (
            JobOutcome::failure(kind, kind.user_message()),
            rejection(kind, kind.user_message()),
        )
    };

    let completion = settle_document_job(
        state,
        &link.business_id,
        &link.document_id,
        link.job_id,
        outcome.clone(),
        decision,
        None,
    )
    .await?;

    if let Some(assessment_job) = link.assessment_job {
        state.registry.complete(assessment_job, outcome).await?;
    }

    release_links(state, &assessment.id, link).await?;
    info!(
        assessment_id = %assessment.id,
        job_id = %link.job_id,
        approved,
        ?completion,
        "assessment resolved"
    );
    Ok(ResolverOutcome::Resolved {
        approved,
        completion,
    })
}

/// Drops the assessment link and any extraction links still held by the
/// same document job.
async fn release_links(
    state: &AppState,
    assessment_id: &str,
    link: &AssessmentLink,
) -> OrchestratorResult<()> {
    let meta: DocumentMeta = fetch(
        state.ledger.as_ref(),
        &paths::document_meta(&link.business_id, &link.document_id),
    )
    .await?
    .unwrap_or_default();

    for (target_id, record) in &meta.targets {
        if record.job_id == link.job_id {
            state.correlations.release_target(target_id).await?;
        }
    }
    state.correlations.release_assessment(assessment_id).await?;
    Ok(())
}
