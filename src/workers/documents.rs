use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    error::{JobErrorKind, OrchestratorResult},
    events::{ChangeEvent, EventKind},
    jobs::{JobConfig, JobOutcome, JobQueue, JobUpdate},
    ledger::{fetch, paths, store, Ledger},
    models::{ApprovalStatus, Document, DocumentMeta, DocumentProfile, JobKind, JobRef},
    portal::Portal,
    registry::JobHandle,
    state::AppState,
};

use super::{finish, rejection, settle_document_job, EventHandler, Execution};

#[derive(Debug)]
pub enum EnqueueOutcome {
    Created {
        job_key: String,
        job_ref: JobRef,
        handle: JobHandle,
        staging: Staging,
    },
    Resumed {
        job_key: String,
        handle: JobHandle,
        staging: Staging,
    },
    Duplicate {
        job_key: String,
    },
    Skipped {
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Staging {
    Staged { artifacts: usize },
    Failed(JobErrorKind),
}

/// Document Job Enqueuer: reacts to document mirror writes.
pub struct DocumentChangeJob {
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl DocumentChangeJob {
    pub fn new() -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn claim(&self, document_id: &str) -> Option<InFlight> {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        in_flight.insert(document_id.to_string()).then(|| InFlight {
            set: self.in_flight.clone(),
            document_id: document_id.to_string(),
        })
    }
}

impl Default for DocumentChangeJob {
    fn default() -> Self {
        Self::new()
    }
}

struct InFlight {
    set: Arc<Mutex<HashSet<String>>>,
    document_id: String,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.document_id);
    }
}

#[async_trait]
impl EventHandler for DocumentChangeJob {
    fn kind(&self) -> EventKind {
        EventKind::Document
    }

    async fn handle(&self, state: Arc<AppState>, event: ChangeEvent) -> Execution {
        let ChangeEvent::Document {
            business_id,
            document_id,
        } = event
        else {
            return Execution::Failed {
                error: "document handler received a non-document event".into(),
            };
        };

        let Some(_guard) = self.claim(&document_id) else {
            return Execution::skipped("document is already being processed");
        };

        let mirror = paths::document_mirror(&business_id, &document_id);
        let document: Document = match fetch(state.ledger.as_ref(), &mirror).await {
            Ok(Some(document)) => document,
            Ok(None) => return Execution::skipped("document mirror is gone"),
            Err(err) => return Execution::from_error(&state, err.into()),
        };

        match document.approval.status {
            ApprovalStatus::AwaitingReview => match enqueue_document(&state, &document).await {
                Ok(
                    EnqueueOutcome::Created {
                        job_key, handle, ..
                    }
                    | EnqueueOutcome::Resumed {
                        job_key, handle, ..
                    },
                ) => {
                    watch_outcome(document.id.clone(), job_key, handle);
                    Execution::Success
                }
                Ok(EnqueueOutcome::Duplicate { job_key }) => {
                    Execution::skipped(format!("document already has job {job_key}"))
                }
                Ok(EnqueueOutcome::Skipped { reason }) => Execution::Skipped { reason },
                Err(err) => {
                    warn!(document_id = %document.id, error = %err, "failed to enqueue document");
                    Execution::from_error(&state, err)
                }
            },
            ApprovalStatus::Approved | ApprovalStatus::Rejected
                if document.status_set_by(state.actor()) =>
            {
                match finish::finish_document(&state, &document).await {
                    Ok(outcome) => outcome.into(),
                    Err(err) => Execution::from_error(&state, err),
                }
            }
            _ => Execution::skipped("approval status was set by another actor"),
        }
    }
}

fn watch_outcome(document_id: String, job_key: String, handle: JobHandle) {
    tokio::spawn(async move {
        let job_id = handle.job_id();
        match handle.wait().await {
            Some(JobOutcome::Success { .. }) => {
                info!(document_id = %document_id, job_key = %job_key, job_id = %job_id, "document job succeeded");
            }
            Some(JobOutcome::Failure { kind, message }) => {
                warn!(document_id = %document_id, job_key = %job_key, job_id = %job_id, %kind, %message, "document job failed");
            }
            None => {}
        }
    });
}

/// Creates the document job for an awaiting-review document, or resumes one
/// whose attachment staging never finished. A document whose last job ended
/// gets a fresh job once its mirror differs from the one that job started
/// from; redelivery of the same mirror state does not.
pub async fn enqueue_document(
    state: &AppState,
    document: &Document,
) -> OrchestratorResult<EnqueueOutcome> {
    let Some(profile) = document.kind().profile() else {
        info!(document_id = %document.id, document_type = %document.document_type, "unsupported document type; skipping");
        return Ok(EnqueueOutcome::Skipped {
            reason: format!("unsupported document type {}", document.document_type),
        });
    };

    let meta_path = paths::document_meta(&document.business_id, &document.id);
    let meta: DocumentMeta = fetch(state.ledger.as_ref(), &meta_path)
        .await?
        .unwrap_or_default();

    if let Some((job_key, job_ref)) = meta.latest_job(JobKind::Document) {
        let active = state
            .queue
            .get_job(job_ref.job_id)
            .await?
            .is_some_and(|record| !record.status.is_terminal());
        if active {
            if job_ref.staged {
                return Ok(EnqueueOutcome::Duplicate {
                    job_key: job_key.clone(),
                });
            }
            info!(document_id = %document.id, job_key = %job_key, "resuming attachment staging");
            let handle = state.registry.register(job_ref.job_id).await;
            let staging = stage_attachments(state, document, profile, job_key, job_ref).await?;
            return Ok(EnqueueOutcome::Resumed {
                job_key: job_key.clone(),
                handle,
                staging,
            });
        }
        if meta.sources.get(job_key) == Some(document) {
            return Ok(EnqueueOutcome::Duplicate {
                job_key: job_key.clone(),
            });
        }
        info!(document_id = %document.id, previous_job_key = %job_key, "document resubmitted after its last job finished; creating a new job");
    }

    let config = JobConfig {
        kind: JobKind::Document,
        business_id: document.business_id.clone(),
        document_id: document.id.clone(),
        business_name: document.business_name.clone(),
        trading_partner_id: document.trading_partner_id.clone(),
        document_type: document.document_type.clone(),
        assessment_id: None,
    };
    let record = state.queue.create_job(config).await?;
    let seq = state.sequence.next().await?;
    let job_key = Uuid::new_v4().simple().to_string();
    let job_ref = JobRef {
        job_id: record.id,
        kind: JobKind::Document,
        seq,
        staged: false,
    };

    store(
        state.ledger.as_ref(),
        &paths::job_index_entry(&job_key),
        &json!({
            "job_id": record.id,
            "business_id": document.business_id,
            "document_id": document.id,
            "document_type": document.document_type,
        }),
    )
    .await?;
    store(
        state.ledger.as_ref(),
        &format!("{meta_path}/sources/{job_key}"),
        document,
    )
    .await?;
    store(
        state.ledger.as_ref(),
        &format!("{meta_path}/jobs/{job_key}"),
        &job_ref,
    )
    .await?;

    let handle = state.registry.register(record.id).await;
    state
        .queue
        .post_job_update(record.id, JobUpdate::note("pending", "Job created"))
        .await?;
    info!(document_id = %document.id, job_id = %record.id, job_key = %job_key, seq, "document job created");

    let staging = stage_attachments(state, document, profile, &job_key, &job_ref).await?;
    Ok(EnqueueOutcome::Created {
        job_key,
        job_ref,
        handle,
        staging,
    })
}

async fn stage_attachments(
    state: &AppState,
    document: &Document,
    profile: DocumentProfile,
    job_key: &str,
    job_ref: &JobRef,
) -> OrchestratorResult<Staging> {
    let attachments = match state
        .portal
        .fetch_attachments(&document.business_id, &document.id)
        .await
    {
        Ok(attachments) => attachments,
        Err(err) if err.is_permanent() => {
            warn!(document_id = %document.id, error = %err, "attachments could not be retrieved");
            Vec::new()
        }
        Err(err) => return Err(err.into()),
    };

    if attachments.is_empty() {
        return fail_staging(state, document, job_ref, JobErrorKind::BadFlAttachments).await;
    }
    if attachments.len() > 1 && !profile.allows_multiple_files {
        return fail_staging(state, document, job_ref, JobErrorKind::MultiFilesAttached).await;
    }

    for attachment in &attachments {
        let artifact = paths::artifact(&document.id, &attachment.id);
        // Metadata first: the extraction service starts on the blob write.
        store(
            state.ledger.as_ref(),
            &format!("{}/jobs/{job_key}", paths::artifact_meta(&artifact)),
            job_ref,
        )
        .await?;
        state
            .ledger
            .put_blob(
                &artifact,
                attachment.bytes.clone(),
                &attachment.content_type,
            )
            .await?;
    }

    let meta_path = paths::document_meta(&document.business_id, &document.id);
    state
        .ledger
        .put(&format!("{meta_path}/jobs/{job_key}/staged"), json!(true))
        .await?;
    state
        .queue
        .post_job_update(
            job_ref.job_id,
            JobUpdate::note("staged", format!("{} attachment(s) staged", attachments.len())),
        )
        .await?;
    info!(document_id = %document.id, job_key, artifacts = attachments.len(), "attachments staged");

    Ok(Staging::Staged {
        artifacts: attachments.len(),
    })
}

async fn fail_staging(
    state: &AppState,
    document: &Document,
    job_ref: &JobRef,
    kind: JobErrorKind,
) -> OrchestratorResult<Staging> {
    let message = kind.user_message();
    warn!(document_id = %document.id, job_id = %job_ref.job_id, %kind, "rejecting document at staging");
    settle_document_job(
        state,
        &document.business_id,
        &document.id,
        job_ref.job_id,
        JobOutcome::failure(kind, message),
        rejection(kind, message),
        None,
    )
    .await?;
    Ok(Staging::Failed(kind))
}
