use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::jobs::JobQueueError;
use crate::ledger::LedgerError;
use crate::portal::PortalError;
use crate::registry::RegistryError;

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Terminal failure classification carried on a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobErrorKind {
    BadFlAttachments,
    MultiFilesAttached,
    TargetMultipleDocsCombined,
    TargetValidation,
    TargetUnrecognized,
    TargetOther,
    DocumentValidation,
    AssociatedAssessmentRejected,
}

impl JobErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobErrorKind::BadFlAttachments => "bad-fl-attachments",
            JobErrorKind::MultiFilesAttached => "multi-files-attached",
            JobErrorKind::TargetMultipleDocsCombined => "target-multiple-docs-combined",
            JobErrorKind::TargetValidation => "target-validation",
            JobErrorKind::TargetUnrecognized => "target-unrecognized",
            JobErrorKind::TargetOther => "target-other",
            JobErrorKind::DocumentValidation => "document-validation",
            JobErrorKind::AssociatedAssessmentRejected => "associated-assessment-rejected",
        }
    }

    /// Whether this failure rejects the document in the portal.
    pub fn rejects_document(&self) -> bool {
        matches!(
            self,
            JobErrorKind::BadFlAttachments
                | JobErrorKind::MultiFilesAttached
                | JobErrorKind::TargetMultipleDocsCombined
                | JobErrorKind::DocumentValidation
                | JobErrorKind::AssociatedAssessmentRejected
        )
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            JobErrorKind::BadFlAttachments => {
                "The attached file could not be retrieved. Please re-upload the document."
            }
            JobErrorKind::MultiFilesAttached => {
                "Multiple files were attached. Please upload a single file per document."
            }
            JobErrorKind::TargetMultipleDocsCombined => {
                "The file contains multiple documents combined. Please upload each document separately."
            }
            JobErrorKind::TargetValidation => "The document failed automated extraction checks.",
            JobErrorKind::TargetUnrecognized => "The document format was not recognized.",
            JobErrorKind::TargetOther => "Automated extraction failed for this document.",
            JobErrorKind::DocumentValidation => {
                "The document did not match the submitted information."
            }
            JobErrorKind::AssociatedAssessmentRejected => {
                "The associated assessment was rejected."
            }
        }
    }
}

impl fmt::Display for JobErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Portal(#[from] PortalError),
    #[error(transparent)]
    Queue(#[from] JobQueueError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("job {0} not found")]
    UnknownJob(Uuid),
    #[error("invalid {what}: {reason}")]
    Invalid { what: &'static str, reason: String },
}

impl OrchestratorError {
    pub fn invalid(what: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            what,
            reason: reason.into(),
        }
    }

    /// Network-level failures the change feed should redeliver.
    pub fn is_transient(&self) -> bool {
        match self {
            OrchestratorError::Ledger(err) => ledger_is_transient(err),
            OrchestratorError::Portal(err) => !err.is_permanent(),
            OrchestratorError::Queue(JobQueueError::Ledger(err)) => ledger_is_transient(err),
            OrchestratorError::Queue(_) => false,
            OrchestratorError::Registry(RegistryError::Queue(JobQueueError::Ledger(err))) => {
                ledger_is_transient(err)
            }
            OrchestratorError::Registry(_) => false,
            OrchestratorError::UnknownJob(_) | OrchestratorError::Invalid { .. } => false,
        }
    }
}

fn ledger_is_transient(err: &LedgerError) -> bool {
    match err {
        LedgerError::Transport(_) => true,
        LedgerError::Status { status, .. } => *status >= 500 || *status == 429,
        LedgerError::NotFound(_) | LedgerError::Decode(_) => false,
    }
}
