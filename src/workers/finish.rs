use serde_json::Value;
use tracing::{info, warn};

use crate::{
    error::{OrchestratorError, OrchestratorResult},
    jobs::{JobOutcome, JobQueue, JobUpdate},
    ledger::{fetch, paths, Ledger},
    models::{ApprovalStatus, Document, DocumentMeta},
    registry::Completion,
    state::AppState,
};

use super::Execution;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishOutcome {
    Relocated {
        shelf_path: String,
        completion: Completion,
    },
    Confirmed,
    NothingToRelocate,
}

impl From<FinishOutcome> for Execution {
    fn from(outcome: FinishOutcome) -> Self {
        match outcome {
            FinishOutcome::Relocated { .. } => Execution::Success,
            FinishOutcome::Confirmed => Execution::skipped("rejection already handled"),
            FinishOutcome::NothingToRelocate => {
                Execution::skipped("no extraction result recorded for document")
            }
        }
    }
}

/// Finisher: moves the latest validated result onto the trading partner's
/// shelf and completes the job. Rejections were settled when decided.
pub async fn finish_document(
    state: &AppState,
    document: &Document,
) -> OrchestratorResult<FinishOutcome> {
    if document.approval.status != ApprovalStatus::Approved {
        return Ok(FinishOutcome::Confirmed);
    }

    let meta: DocumentMeta = fetch(
        state.ledger.as_ref(),
        &paths::document_meta(&document.business_id, &document.id),
    )
    .await?
    .unwrap_or_default();

    let Some((target_id, record)) = meta.latest_result() else {
        warn!(document_id = %document.id, "approved document has no extraction result");
        return Ok(FinishOutcome::NothingToRelocate);
    };
    let Some(result) = record.result.as_ref() else {
        return Ok(FinishOutcome::NothingToRelocate);
    };

    let source = paths::target_result(&result.result_type, &result.key);
    let data: Value = fetch(state.ledger.as_ref(), &source).await?.ok_or_else(|| {
        OrchestratorError::invalid("extraction result", format!("{source} does not exist"))
    })?;

    let shelf_path = paths::shelf(
        &document.trading_partner_id,
        &result.result_type,
        &result.key,
    );
    state.ledger.put(&shelf_path, data).await?;

    state
        .queue
        .post_job_update(
            record.job_id,
            JobUpdate::note("finished", format!("Result relocated to {shelf_path}")),
        )
        .await?;
    let completion = state
        .registry
        .complete(record.job_id, JobOutcome::success())
        .await?;

    info!(
        document_id = %document.id,
        job_id = %record.job_id,
        target_id = %target_id,
        shelf_path = %shelf_path,
        ?completion,
        "document finished"
    );
    Ok(FinishOutcome::Relocated {
        shelf_path,
        completion,
    })
}
