use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use tokio::{sync::Semaphore, task::JoinHandle, time::sleep};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    config::WorkerConfig,
    error::{JobErrorKind, OrchestratorError, OrchestratorResult},
    events::{self, ChangeEvent, EventKind},
    jobs::{JobOutcome, JobQueue},
    ledger::{paths, ChangeStream, Ledger, LedgerResult},
    portal::{ApprovalDecision, Portal},
    registry::Completion,
    state::AppState,
};

pub mod assessments;
pub mod documents;
pub mod finish;
pub mod results;
pub mod targets;

#[derive(Debug, Clone, PartialEq)]
pub enum Execution {
    Success,
    Skipped { reason: String },
    Retry { delay: Duration, error: String },
    Failed { error: String },
}

impl Execution {
    pub fn skipped(reason: impl Into<String>) -> Self {
        Execution::Skipped {
            reason: reason.into(),
        }
    }

    /// Transient errors are redelivered; everything else is terminal for
    /// this event.
    pub fn from_error(state: &AppState, err: OrchestratorError) -> Self {
        if err.is_transient() {
            Execution::Retry {
                delay: state.config.worker.retry_delay,
                error: err.to_string(),
            }
        } else {
            Execution::Failed {
                error: err.to_string(),
            }
        }
    }
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    fn kind(&self) -> EventKind;
    async fn handle(&self, state: Arc<AppState>, event: ChangeEvent) -> Execution;
}

pub struct Worker {
    state: Arc<AppState>,
    handlers: Arc<HashMap<EventKind, Arc<dyn EventHandler>>>,
    permits: Arc<Semaphore>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(state: Arc<AppState>, handlers: Vec<Arc<dyn EventHandler>>) -> Self {
        let config = state.config.worker.clone();
        let map = handlers
            .into_iter()
            .map(|handler| (handler.kind(), handler))
            .collect();
        Self {
            state,
            handlers: Arc::new(map),
            permits: Arc::new(Semaphore::new(config.concurrency)),
            config,
        }
    }

    /// Consumes the change feed until the process stops. A dropped or failed
    /// watch is re-established after the retry delay.
    pub async fn run(&self) {
        info!(concurrency = self.config.concurrency, "worker started");
        loop {
            match self.watch().await {
                Ok(mut changes) => {
                    while let Some(change) = changes.next().await {
                        match change {
                            Ok(change) => {
                                if let Some(event) = events::decode(&change) {
                                    self.dispatch(event);
                                }
                            }
                            Err(err) => {
                                warn!(error = %err, "change feed returned an error");
                            }
                        }
                    }
                    warn!("change feed ended; reconnecting");
                }
                Err(err) => {
                    error!(error = %err, "failed to watch ledger");
                }
            }
            sleep(self.config.retry_delay).await;
        }
    }

    async fn watch(&self) -> LedgerResult<ChangeStream> {
        let businesses = self.state.ledger.watch(paths::BUSINESSES).await?;
        let targets = self.state.ledger.watch(paths::TARGET_JOBS).await?;
        Ok(stream::select(businesses, targets).boxed())
    }

    /// Spawns the handler for `event` under the concurrency bound.
    pub fn dispatch(&self, event: ChangeEvent) -> JoinHandle<Execution> {
        let state = self.state.clone();
        let handlers = self.handlers.clone();
        let permits = self.permits.clone();
        let config = self.config.clone();
        tokio::spawn(async move { process(state, handlers, permits, config, event).await })
    }

    /// Runs `event` to completion, including redelivery, and returns the
    /// final execution.
    pub async fn execute(&self, event: ChangeEvent) -> Execution {
        process(
            self.state.clone(),
            self.handlers.clone(),
            self.permits.clone(),
            self.config.clone(),
            event,
        )
        .await
    }
}

async fn process(
    state: Arc<AppState>,
    handlers: Arc<HashMap<EventKind, Arc<dyn EventHandler>>>,
    permits: Arc<Semaphore>,
    config: WorkerConfig,
    event: ChangeEvent,
) -> Execution {
    let kind = event.kind();
    let Some(handler) = handlers.get(&kind).cloned() else {
        error!(?kind, subject = %event.subject(), "no handler registered for event kind");
        return Execution::Failed {
            error: "no handler registered".into(),
        };
    };

    let mut attempt = 1;
    loop {
        let execution = {
            let _permit = match permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(err) => {
                    return Execution::Failed {
                        error: format!("worker is shutting down: {err}"),
                    }
                }
            };
            handler.handle(state.clone(), event.clone()).await
        };

        match &execution {
            Execution::Success => {
                info!(?kind, subject = %event.subject(), attempt, "event handled");
            }
            Execution::Skipped { reason } => {
                debug!(?kind, subject = %event.subject(), %reason, "event skipped");
            }
            Execution::Retry { delay, error } if attempt < config.max_attempts => {
                warn!(?kind, subject = %event.subject(), attempt, %error, "event will be redelivered");
                sleep(*delay).await;
                attempt += 1;
                continue;
            }
            Execution::Retry { error, .. } => {
                error!(?kind, subject = %event.subject(), attempt, %error, "event exhausted its attempts");
            }
            Execution::Failed { error } => {
                error!(?kind, subject = %event.subject(), %error, "event failed");
            }
        }
        return execution;
    }
}

pub fn default_handlers() -> Vec<Arc<dyn EventHandler>> {
    vec![
        Arc::new(documents::DocumentChangeJob::new()),
        Arc::new(targets::TargetJobChange::new()),
        Arc::new(assessments::AssessmentChangeJob::new()),
    ]
}

/// Portal decision for a failure of `kind`: a rejection carrying `reason`
/// when the kind rejects the document, nothing otherwise.
pub(crate) fn rejection(kind: JobErrorKind, reason: impl Into<String>) -> Option<ApprovalDecision> {
    kind.rejects_document().then(|| ApprovalDecision::Reject {
        reason: reason.into(),
    })
}

/// Ends a document job. The job is claimed first; only the claim holder of a
/// non-terminal job posts `note` and applies `decision` in the portal, so
/// concurrent or redelivered settlements act on the portal once.
pub(crate) async fn settle_document_job(
    state: &AppState,
    business_id: &str,
    document_id: &str,
    job_id: Uuid,
    outcome: JobOutcome,
    decision: Option<ApprovalDecision>,
    note: Option<&str>,
) -> OrchestratorResult<Completion> {
    let Some(claim) = state.registry.claim(job_id) else {
        debug!(job_id = %job_id, "job is being settled elsewhere; skipping portal action");
        return Ok(Completion::AlreadySettled);
    };

    match state.queue.get_job(job_id).await? {
        Some(record) if record.status.is_terminal() => {
            debug!(job_id = %job_id, "job already terminal; skipping portal action");
            return Ok(Completion::AlreadySettled);
        }
        Some(_) => {}
        None => return Err(OrchestratorError::UnknownJob(job_id)),
    }

    if let Some(note) = note {
        state
            .portal
            .post_progress_note(business_id, document_id, note)
            .await?;
    }
    if let Some(decision) = decision {
        set_document_approval(state, business_id, document_id, &decision).await?;
    }

    let completion = claim.complete(outcome).await?;
    Ok(completion)
}

/// Sets the approval status and mirrors the portal's view of the document
/// right away, so the change feed sees our own decision.
pub(crate) async fn set_document_approval(
    state: &AppState,
    business_id: &str,
    document_id: &str,
    decision: &ApprovalDecision,
) -> OrchestratorResult<()> {
    state
        .portal
        .set_approval_status(business_id, document_id, decision)
        .await?;
    info!(business_id, document_id, ?decision, "document approval status set");

    match state.portal.get_document(business_id, document_id).await {
        Ok(document) => {
            if let Err(err) = state.mirror.mirror_document(&document).await {
                warn!(document_id, error = %err, "failed to refresh document mirror");
            }
        }
        Err(err) => {
            warn!(document_id, error = %err, "failed to re-read document after approval change");
        }
    }
    Ok(())
}
