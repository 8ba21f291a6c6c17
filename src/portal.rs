use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::models::{Assessment, AssessmentState, Document, ScoredAnswer};

#[derive(Debug, Error)]
pub enum PortalError {
    #[error("portal resource not found: {0}")]
    NotFound(String),
    #[error("portal request failed: {0}")]
    Transport(String),
    #[error("portal returned status {status} for {resource}")]
    Status { status: u16, resource: String },
    #[error("portal payload could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),
}

impl PortalError {
    /// Client-side failures that retrying will not fix.
    pub fn is_permanent(&self) -> bool {
        match self {
            PortalError::NotFound(_) | PortalError::Decode(_) => true,
            PortalError::Status { status, .. } => (400..500).contains(status) && *status != 429,
            PortalError::Transport(_) => false,
        }
    }
}

pub type PortalResult<T> = Result<T, PortalError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approve,
    Reject { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub id: String,
    pub file_name: String,
    pub content_type: String,
    pub bytes: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssessmentRequest {
    pub template_id: String,
    pub business_id: String,
    pub answers: Vec<ScoredAnswer>,
    pub existing_id: Option<String>,
}

/// Calls the orchestrator makes against the compliance portal.
#[async_trait]
pub trait Portal: Send + Sync + 'static {
    async fn get_document(&self, business_id: &str, document_id: &str) -> PortalResult<Document>;

    async fn set_approval_status(
        &self,
        business_id: &str,
        document_id: &str,
        decision: &ApprovalDecision,
    ) -> PortalResult<()>;

    async fn post_progress_note(
        &self,
        business_id: &str,
        document_id: &str,
        text: &str,
    ) -> PortalResult<()>;

    async fn fetch_attachments(
        &self,
        business_id: &str,
        document_id: &str,
    ) -> PortalResult<Vec<Attachment>>;

    async fn get_assessment(
        &self,
        business_id: &str,
        assessment_id: &str,
    ) -> PortalResult<Assessment>;

    async fn set_assessment_status(
        &self,
        business_id: &str,
        assessment_id: &str,
        state: AssessmentState,
    ) -> PortalResult<()>;

    /// Creates the assessment, or updates `existing_id` when set. Returns its id.
    async fn spawn_or_update_assessment(&self, request: &AssessmentRequest)
        -> PortalResult<String>;

    async fn link_assessment_to_document(
        &self,
        business_id: &str,
        assessment_id: &str,
        document_id: &str,
    ) -> PortalResult<()>;
}
