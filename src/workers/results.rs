use chrono::Utc;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::{
    correlation::{AssessmentLink, CorrelationStore, TargetLink},
    error::{JobErrorKind, OrchestratorError, OrchestratorResult},
    jobs::{JobOutcome, JobQueue, JobUpdate},
    ledger::{fetch, paths, store},
    models::{AssessmentKind, Document, DocumentMeta, TargetResultRef},
    portal::{ApprovalDecision, AssessmentRequest, Portal},
    registry::Completion,
    state::AppState,
    validation::{self, coi::CoiResult, scoring},
};

use super::{rejection, set_document_approval, settle_document_job};

#[derive(Debug, Clone, PartialEq)]
pub enum ResultOutcome {
    Rejected {
        message: String,
        completion: Completion,
    },
    AssessmentSubmitted {
        assessment_id: String,
        created: bool,
    },
    Approved,
}

/// Result Validator & Assessment Spawner.
pub async fn validate_and_spawn(
    state: &AppState,
    link: &TargetLink,
    result: &TargetResultRef,
) -> OrchestratorResult<ResultOutcome> {
    let mirror = paths::document_mirror(&link.business_id, &link.document_id);
    let document: Document = fetch(state.ledger.as_ref(), &mirror)
        .await?
        .ok_or_else(|| OrchestratorError::invalid("document", format!("{mirror} is missing")))?;

    let source = paths::target_result(&result.result_type, &result.key);
    let data: Value = fetch(state.ledger.as_ref(), &source)
        .await?
        .ok_or_else(|| {
            OrchestratorError::invalid("extraction result", format!("{source} is missing"))
        })?;

    let verdict = validation::validate(&document, &data, &state.validation_policy(), Utc::now());
    state
        .queue
        .post_job_update(
            link.job_id,
            JobUpdate::note(
                if verdict.status { "validated" } else { "invalid" },
                verdict
                    .message
                    .clone()
                    .unwrap_or_else(|| "Validation passed".to_string()),
            )
            .with_data(json!({ "status": verdict.status, "message": verdict.message })),
        )
        .await?;

    if !verdict.status {
        let message = verdict
            .message
            .unwrap_or_else(|| JobErrorKind::DocumentValidation.user_message().to_string());
        warn!(document_id = %document.id, job_id = %link.job_id, %message, "document failed validation");

        let completion = settle_document_job(
            state,
            &document.business_id,
            &document.id,
            link.job_id,
            JobOutcome::failure(JobErrorKind::DocumentValidation, message.clone()),
            rejection(JobErrorKind::DocumentValidation, message.clone()),
            Some(message.as_str()),
        )
        .await?;
        return Ok(ResultOutcome::Rejected {
            message,
            completion,
        });
    }

    match document.kind().profile().and_then(|profile| profile.assessment) {
        Some(AssessmentKind::Insurance) => spawn_assessment(state, link, &document, &data).await,
        None => {
            info!(document_id = %document.id, job_id = %link.job_id, "validation passed; approving document");
            set_document_approval(
                state,
                &document.business_id,
                &document.id,
                &ApprovalDecision::Approve,
            )
            .await?;
            Ok(ResultOutcome::Approved)
        }
    }
}

async fn spawn_assessment(
    state: &AppState,
    link: &TargetLink,
    document: &Document,
    data: &Value,
) -> OrchestratorResult<ResultOutcome> {
    let meta_path = paths::document_meta(&document.business_id, &document.id);
    let meta: DocumentMeta = fetch(state.ledger.as_ref(), &meta_path)
        .await?
        .unwrap_or_default();
    let existing = meta.assessments.get(&link.job_key).cloned();

    let coi = CoiResult::from_value(data)
        .map_err(|err| OrchestratorError::invalid("certificate result", err.to_string()))?;
    let request = AssessmentRequest {
        template_id: state.config.policy.coi_assessment_template_id.clone(),
        business_id: document.business_id.clone(),
        answers: scoring::build_answers(&coi),
        existing_id: existing.clone(),
    };
    let assessment_id = state.portal.spawn_or_update_assessment(&request).await?;
    let created = existing.is_none();

    // Record the id first: a redelivery must update, never respawn.
    if existing.as_deref() != Some(assessment_id.as_str()) {
        store(
            state.ledger.as_ref(),
            &format!("{meta_path}/assessments/{}", link.job_key),
            &assessment_id,
        )
        .await?;
    }
    let assessment_job = state
        .correlations
        .assessment(&assessment_id)
        .await?
        .and_then(|link| link.assessment_job);
    state
        .correlations
        .link_assessment(
            &assessment_id,
            AssessmentLink {
                job_key: link.job_key.clone(),
                job_id: link.job_id,
                mirror_path: paths::assessment_mirror(&document.business_id, &assessment_id),
                business_id: document.business_id.clone(),
                document_id: document.id.clone(),
                assessment_job,
            },
        )
        .await?;

    if !meta.linked_assessments.contains_key(&assessment_id) {
        state
            .portal
            .link_assessment_to_document(&document.business_id, &assessment_id, &document.id)
            .await?;
        store(
            state.ledger.as_ref(),
            &format!("{meta_path}/linked_assessments/{assessment_id}"),
            &true,
        )
        .await?;
    }

    state
        .queue
        .post_job_update(
            link.job_id,
            JobUpdate::note("assessment", format!("Assessment {assessment_id} submitted"))
                .with_data(json!({ "assessment_id": assessment_id, "created": created })),
        )
        .await?;
    info!(document_id = %document.id, job_id = %link.job_id, assessment_id = %assessment_id, created, "assessment submitted");

    Ok(ResultOutcome::AssessmentSubmitted {
        assessment_id,
        created,
    })
}
