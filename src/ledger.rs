use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger path not found: {0}")]
    NotFound(String),
    #[error("ledger request failed: {0}")]
    Transport(String),
    #[error("ledger returned status {status} for {path}")]
    Status { status: u16, path: String },
    #[error("ledger payload could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// One observed write under a watched prefix.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerChange {
    pub path: String,
    pub body: Value,
}

pub type ChangeStream = BoxStream<'static, LedgerResult<LedgerChange>>;

/// Tree-structured system of record. `put` deep-merges into the existing
/// tree (last write wins per leaf); `replace` overwrites the subtree.
#[async_trait]
pub trait Ledger: Send + Sync + 'static {
    async fn get(&self, path: &str) -> LedgerResult<Value>;

    async fn put(&self, path: &str, body: Value) -> LedgerResult<()>;

    async fn delete(&self, path: &str) -> LedgerResult<()>;

    async fn put_blob(&self, path: &str, bytes: Bytes, content_type: &str) -> LedgerResult<()>;

    async fn watch(&self, prefix: &str) -> LedgerResult<ChangeStream>;

    async fn replace(&self, path: &str, body: Value) -> LedgerResult<()> {
        match self.delete(path).await {
            Ok(()) | Err(LedgerError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }
        self.put(path, body).await
    }
}

/// Reads and decodes `path`, mapping "not found" to `None`.
pub async fn fetch<T: DeserializeOwned>(ledger: &dyn Ledger, path: &str) -> LedgerResult<Option<T>> {
    match ledger.get(path).await {
        Ok(value) => Ok(Some(serde_json::from_value(value)?)),
        Err(LedgerError::NotFound(_)) => Ok(None),
        Err(err) => Err(err),
    }
}

pub async fn store<T: Serialize>(ledger: &dyn Ledger, path: &str, value: &T) -> LedgerResult<()> {
    ledger.put(path, serde_json::to_value(value)?).await
}

pub mod paths {
    //! Ledger tree layout.

    pub const BUSINESSES: &str = "businesses";
    pub const TARGET_JOBS: &str = "target/jobs";
    pub const JOBS: &str = "fl-sync/jobs";
    pub const JOB_INDEX: &str = "fl-sync/job-index";
    pub const SEQUENCE: &str = "fl-sync/sequence";
    pub const TARGET_LINKS: &str = "fl-sync/correlation/targets";
    pub const ASSESSMENT_LINKS: &str = "fl-sync/correlation/assessments";

    pub fn document(business_id: &str, document_id: &str) -> String {
        format!("{BUSINESSES}/{business_id}/documents/{document_id}")
    }

    pub fn document_mirror(business_id: &str, document_id: &str) -> String {
        format!("{}/mirror", document(business_id, document_id))
    }

    pub fn document_meta(business_id: &str, document_id: &str) -> String {
        format!("{}/meta", document(business_id, document_id))
    }

    pub fn assessment_mirror(business_id: &str, assessment_id: &str) -> String {
        format!("{BUSINESSES}/{business_id}/assessments/{assessment_id}/mirror")
    }

    pub fn artifact(document_id: &str, attachment_id: &str) -> String {
        format!("artifacts/{document_id}/{attachment_id}")
    }

    pub fn artifact_meta(artifact: &str) -> String {
        format!("{artifact}/meta")
    }

    pub fn target_job(target_id: &str) -> String {
        format!("{TARGET_JOBS}/{target_id}")
    }

    pub fn target_result(result_type: &str, key: &str) -> String {
        format!("results/{result_type}/{key}")
    }

    pub fn shelf(trading_partner_id: &str, result_type: &str, key: &str) -> String {
        format!("trading-partners/{trading_partner_id}/documents/{result_type}/{key}")
    }

    pub fn job(job_id: &uuid::Uuid) -> String {
        format!("{JOBS}/{job_id}")
    }

    pub fn job_index_entry(job_key: &str) -> String {
        format!("{JOB_INDEX}/{job_key}")
    }

    pub fn target_link(target_id: &str) -> String {
        format!("{TARGET_LINKS}/{target_id}")
    }

    pub fn assessment_link(assessment_id: &str) -> String {
        format!("{ASSESSMENT_LINKS}/{assessment_id}")
    }
}
