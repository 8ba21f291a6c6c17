use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::error::JobErrorKind;
use crate::ledger::{fetch, paths, store, Ledger, LedgerError};
use crate::models::JobKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

/// Identifiers a job carries through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobConfig {
    pub kind: JobKind,
    pub business_id: String,
    pub document_id: String,
    #[serde(default)]
    pub business_name: String,
    pub trading_partner_id: String,
    pub document_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assessment_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "kebab-case")]
pub enum JobOutcome {
    Success {
        #[serde(default)]
        message: Option<String>,
    },
    Failure {
        kind: JobErrorKind,
        message: String,
    },
}

impl JobOutcome {
    pub fn success() -> Self {
        JobOutcome::Success { message: None }
    }

    pub fn failure(kind: JobErrorKind, message: impl Into<String>) -> Self {
        JobOutcome::Failure {
            kind,
            message: message.into(),
        }
    }

    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Success { .. } => JobStatus::Succeeded,
            JobOutcome::Failure { .. } => JobStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobUpdate {
    pub status: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub time: DateTime<Utc>,
}

impl JobUpdate {
    pub fn note(status: &str, message: impl Into<String>) -> Self {
        Self {
            status: status.to_string(),
            message: message.into(),
            data: None,
            time: Utc::now(),
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub config: JobConfig,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub updates: BTreeMap<String, JobUpdate>,
    #[serde(default)]
    pub outcome: Option<JobOutcome>,
}

#[derive(Debug, Error)]
pub enum JobQueueError {
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("job {0} does not exist")]
    UnknownJob(Uuid),
}

pub type JobQueueResult<T> = Result<T, JobQueueError>;

#[async_trait]
pub trait JobQueue: Send + Sync + 'static {
    async fn create_job(&self, config: JobConfig) -> JobQueueResult<JobRecord>;

    async fn get_job(&self, job_id: Uuid) -> JobQueueResult<Option<JobRecord>>;

    async fn post_job_update(&self, job_id: Uuid, update: JobUpdate) -> JobQueueResult<()>;

    async fn mark_in_progress(&self, job_id: Uuid) -> JobQueueResult<()>;

    /// Moves a non-terminal job to the outcome's terminal status. Returns
    /// `false` when the job was already terminal and nothing was written.
    async fn finish_job(&self, job_id: Uuid, outcome: &JobOutcome) -> JobQueueResult<bool>;
}

/// Job records persisted as ledger resources under `fl-sync/jobs`.
pub struct LedgerJobQueue {
    ledger: Arc<dyn Ledger>,
}

impl LedgerJobQueue {
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self { ledger }
    }

    async fn require(&self, job_id: Uuid) -> JobQueueResult<JobRecord> {
        self.get_job(job_id)
            .await?
            .ok_or(JobQueueError::UnknownJob(job_id))
    }
}

#[async_trait]
impl JobQueue for LedgerJobQueue {
    async fn create_job(&self, config: JobConfig) -> JobQueueResult<JobRecord> {
        let now = Utc::now();
        let record = JobRecord {
            id: Uuid::new_v4(),
            config,
            status: JobStatus::Pending,
            created_at: now,
            updated_at: now,
            updates: BTreeMap::new(),
            outcome: None,
        };

        store(self.ledger.as_ref(), &paths::job(&record.id), &record).await?;
        Ok(record)
    }

    async fn get_job(&self, job_id: Uuid) -> JobQueueResult<Option<JobRecord>> {
        Ok(fetch(self.ledger.as_ref(), &paths::job(&job_id)).await?)
    }

    async fn post_job_update(&self, job_id: Uuid, update: JobUpdate) -> JobQueueResult<()> {
        let path = format!("{}/updates/{}", paths::job(&job_id), Uuid::new_v4());
        store(self.ledger.as_ref(), &path, &update).await?;
        Ok(())
    }

    async fn mark_in_progress(&self, job_id: Uuid) -> JobQueueResult<()> {
        let record = self.require(job_id).await?;
        if record.status != JobStatus::Pending {
            return Ok(());
        }

        self.ledger
            .put(
                &paths::job(&job_id),
                json!({
                    "status": JobStatus::InProgress,
                    "updated_at": Utc::now(),
                }),
            )
            .await?;
        Ok(())
    }

    async fn finish_job(&self, job_id: Uuid, outcome: &JobOutcome) -> JobQueueResult<bool> {
        let record = self.require(job_id).await?;
        if record.status.is_terminal() {
            return Ok(false);
        }

        self.ledger
            .put(
                &paths::job(&job_id),
                json!({
                    "status": outcome.status(),
                    "outcome": outcome,
                    "updated_at": Utc::now(),
                }),
            )
            .await?;
        Ok(true)
    }
}
