//! Job promise registry.
//!
//! A job waiting on an external signal is represented by its durable record
//! (status `pending`/`in-progress`) plus an optional in-process waiter. Every
//! terminal path claims the job with [`JobRegistry::claim`] before acting on
//! it, then finishes through [`SettleClaim::complete`], which performs a
//! check-and-set on the durable record. A job is settled at most once even
//! across restarts, and only the claim holder acts on the portal.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::jobs::{JobOutcome, JobQueue, JobQueueError};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("job queue error: {0}")]
    Queue(#[from] JobQueueError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Settled,
    AlreadySettled,
}

/// Suspended completion handle returned when a job is created.
#[derive(Debug)]
pub struct JobHandle {
    job_id: Uuid,
    receiver: oneshot::Receiver<JobOutcome>,
}

impl JobHandle {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Resolves with the terminal outcome, or `None` if the job was settled
    /// without this process observing the outcome.
    pub async fn wait(self) -> Option<JobOutcome> {
        self.receiver.await.ok()
    }
}

#[derive(Default)]
struct Inner {
    waiters: HashMap<Uuid, oneshot::Sender<JobOutcome>>,
    settling: HashSet<Uuid>,
}

pub struct JobRegistry {
    queue: Arc<dyn JobQueue>,
    inner: Mutex<Inner>,
}

impl JobRegistry {
    pub fn new(queue: Arc<dyn JobQueue>) -> Self {
        Self {
            queue,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub async fn register(&self, job_id: Uuid) -> JobHandle {
        let (sender, receiver) = oneshot::channel();
        if self.lock().waiters.insert(job_id, sender).is_some() {
            warn!(job_id = %job_id, "replacing existing waiter for job");
        }
        JobHandle { job_id, receiver }
    }

    /// Reserves the right to settle `job_id`. Returns `None` while another
    /// task holds the claim; the claim is released when dropped.
    pub fn claim(&self, job_id: Uuid) -> Option<SettleClaim<'_>> {
        if !self.lock().settling.insert(job_id) {
            debug!(job_id = %job_id, "job is already being settled");
            return None;
        }
        Some(SettleClaim {
            registry: self,
            job_id,
        })
    }

    /// Settles `job_id` with `outcome` exactly once.
    pub async fn complete(
        &self,
        job_id: Uuid,
        outcome: JobOutcome,
    ) -> Result<Completion, RegistryError> {
        match self.claim(job_id) {
            Some(claim) => claim.complete(outcome).await,
            None => Ok(Completion::AlreadySettled),
        }
    }
}

/// Exclusive right to settle one job.
pub struct SettleClaim<'a> {
    registry: &'a JobRegistry,
    job_id: Uuid,
}

impl SettleClaim<'_> {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Writes the terminal outcome and wakes the waiter, if any.
    pub async fn complete(self, outcome: JobOutcome) -> Result<Completion, RegistryError> {
        let job_id = self.job_id;
        let waiter = self.registry.lock().waiters.remove(&job_id);

        match self.registry.queue.finish_job(job_id, &outcome).await {
            Ok(true) => {
                if let Some(waiter) = waiter {
                    let _ = waiter.send(outcome);
                }
                Ok(Completion::Settled)
            }
            Ok(false) => {
                debug!(job_id = %job_id, "job already terminal; ignoring outcome");
                Ok(Completion::AlreadySettled)
            }
            Err(err) => {
                if let Some(waiter) = waiter {
                    self.registry.lock().waiters.insert(job_id, waiter);
                }
                Err(err.into())
            }
        }
    }
}

impl Drop for SettleClaim<'_> {
    fn drop(&mut self) {
        self.registry.lock().settling.remove(&self.job_id);
    }
}
