use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalStatus {
    AwaitingReview,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalInfo {
    pub status: ApprovalStatus,
    #[serde(default)]
    pub set_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentRef {
    pub id: String,
    pub file_name: String,
    #[serde(default)]
    pub content_type: Option<String>,
}

/// Mirrored compliance document as the portal reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub document_type: String,
    pub business_id: String,
    #[serde(default)]
    pub business_name: String,
    pub trading_partner_id: String,
    pub approval: ApprovalInfo,
    #[serde(default)]
    pub expiration_date: Option<DateTime<FixedOffset>>,
    #[serde(default)]
    pub attachments: Vec<AttachmentRef>,
}

impl Document {
    pub fn kind(&self) -> DocumentType {
        DocumentType::from_name(&self.document_type)
    }

    /// True when the current approval status was set by `actor`.
    pub fn status_set_by(&self, actor: &str) -> bool {
        self.approval.set_by.as_deref() == Some(actor)
    }
}

/// Document types the portal knows about. Anything else is `Unrecognized`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DocumentType {
    CertificateOfInsurance,
    LetterOfGuarantee,
    W9,
    AchForm,
    GmpAudit,
    GmpAuditCertificate,
    NutritionalInformation,
    NutritionalInformation100g,
    Unrecognized(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AssessmentKind {
    Insurance,
}

/// Pipeline settings for a supported document type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocumentProfile {
    pub result_type: &'static str,
    pub allows_multiple_files: bool,
    pub assessment: Option<AssessmentKind>,
}

impl DocumentType {
    pub fn from_name(name: &str) -> Self {
        match name.trim() {
            "Certificate of Insurance" => Self::CertificateOfInsurance,
            "Letter of Guarantee" => Self::LetterOfGuarantee,
            "W-9" => Self::W9,
            "ACH Form" => Self::AchForm,
            "Third Party Food Safety GMP Audit" => Self::GmpAudit,
            "Third Party Food Safety GMP Audit Certificate" => Self::GmpAuditCertificate,
            "Nutritional Information" => Self::NutritionalInformation,
            "100g Nutritional Information" => Self::NutritionalInformation100g,
            other => Self::Unrecognized(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::CertificateOfInsurance => "Certificate of Insurance",
            Self::LetterOfGuarantee => "Letter of Guarantee",
            Self::W9 => "W-9",
            Self::AchForm => "ACH Form",
            Self::GmpAudit => "Third Party Food Safety GMP Audit",
            Self::GmpAuditCertificate => "Third Party Food Safety GMP Audit Certificate",
            Self::NutritionalInformation => "Nutritional Information",
            Self::NutritionalInformation100g => "100g Nutritional Information",
            Self::Unrecognized(name) => name,
        }
    }

    /// `None` for types the pipeline does not process.
    pub fn profile(&self) -> Option<DocumentProfile> {
        let profile = match self {
            Self::CertificateOfInsurance => DocumentProfile {
                result_type: "cois",
                allows_multiple_files: false,
                assessment: Some(AssessmentKind::Insurance),
            },
            Self::LetterOfGuarantee => DocumentProfile {
                result_type: "letters-of-guarantee",
                allows_multiple_files: false,
                assessment: None,
            },
            Self::W9 => DocumentProfile {
                result_type: "w9s",
                allows_multiple_files: false,
                assessment: None,
            },
            Self::AchForm => DocumentProfile {
                result_type: "ach-forms",
                allows_multiple_files: false,
                assessment: None,
            },
            Self::GmpAudit => DocumentProfile {
                result_type: "fsqa-audits",
                allows_multiple_files: true,
                assessment: None,
            },
            Self::GmpAuditCertificate => DocumentProfile {
                result_type: "fsqa-certificates",
                allows_multiple_files: false,
                assessment: None,
            },
            Self::NutritionalInformation
            | Self::NutritionalInformation100g
            | Self::Unrecognized(_) => return None,
        };
        Some(profile)
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssessmentState {
    #[serde(rename = "Not Started")]
    NotStarted,
    #[serde(rename = "In Progress")]
    InProgress,
    Submitted,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnswerValue {
    Number(f64),
    YesNo(bool),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredAnswer {
    pub column: String,
    pub value: AnswerValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assessment {
    pub id: String,
    pub template_id: String,
    pub business_id: String,
    pub state: AssessmentState,
    #[serde(default)]
    pub updated_by: Option<String>,
    #[serde(default)]
    pub answers: Vec<ScoredAnswer>,
}

impl Assessment {
    /// True when the current state was set by `actor`.
    pub fn state_set_by(&self, actor: &str) -> bool {
        self.updated_by.as_deref() == Some(actor)
    }

    pub fn number(&self, column: &str) -> Option<f64> {
        self.answers
            .iter()
            .find(|answer| answer.column == column)
            .and_then(|answer| match answer.value {
                AnswerValue::Number(value) => Some(value),
                AnswerValue::YesNo(_) => None,
            })
    }

    pub fn yes_no(&self, column: &str) -> Option<bool> {
        self.answers
            .iter()
            .find(|answer| answer.column == column)
            .and_then(|answer| match answer.value {
                AnswerValue::YesNo(value) => Some(value),
                AnswerValue::Number(_) => None,
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetStatus {
    Started,
    Identified,
    Error,
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetUpdate {
    pub status: TargetStatus,
    #[serde(default)]
    pub information: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetResultRef {
    #[serde(rename = "type")]
    pub result_type: String,
    pub key: String,
}

/// Extraction task owned by the external extraction service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetJob {
    pub id: String,
    pub input: String,
    #[serde(default)]
    pub updates: BTreeMap<String, TargetUpdate>,
    #[serde(default)]
    pub result: Option<TargetResultRef>,
}

impl TargetJob {
    /// Updates ordered by time, then by update key.
    pub fn ordered_updates(&self) -> Vec<&TargetUpdate> {
        let mut updates: Vec<(&String, &TargetUpdate)> = self.updates.iter().collect();
        updates.sort_by(|(left_key, left), (right_key, right)| {
            left.time.cmp(&right.time).then_with(|| left_key.cmp(right_key))
        });
        updates.into_iter().map(|(_, update)| update).collect()
    }

    /// Detail of the most recent `error` update, if any.
    pub fn latest_error(&self) -> Option<&TargetUpdate> {
        self.ordered_updates()
            .into_iter()
            .rev()
            .find(|update| update.status == TargetStatus::Error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Document,
    Assessment,
}

/// Job reference stored on documents, artifacts and the job index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRef {
    pub job_id: Uuid,
    pub kind: JobKind,
    pub seq: u64,
    #[serde(default)]
    pub staged: bool,
}

/// Extraction job recorded against a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetRecord {
    pub job_key: String,
    pub job_id: Uuid,
    pub seq: u64,
    #[serde(default)]
    pub result: Option<TargetResultRef>,
    /// Progress updates already forwarded to the portal, by update id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub forwarded: BTreeMap<String, bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentMeta {
    #[serde(default)]
    pub jobs: BTreeMap<String, JobRef>,
    #[serde(default)]
    pub targets: BTreeMap<String, TargetRecord>,
    #[serde(default)]
    pub assessments: BTreeMap<String, String>,
    /// Assessments already linked to the document in the portal.
    #[serde(default)]
    pub linked_assessments: BTreeMap<String, bool>,
    /// Mirrored document each job was created from, by job key.
    #[serde(default)]
    pub sources: BTreeMap<String, Document>,
}

impl DocumentMeta {
    /// Newest job reference of `kind`, by sequence number.
    pub fn latest_job(&self, kind: JobKind) -> Option<(&String, &JobRef)> {
        self.jobs
            .iter()
            .filter(|(_, job)| job.kind == kind)
            .max_by_key(|(_, job)| job.seq)
    }

    /// Newest extraction record that produced a result.
    pub fn latest_result(&self) -> Option<(&String, &TargetRecord)> {
        self.targets
            .iter()
            .filter(|(_, record)| record.result.is_some())
            .max_by_key(|(_, record)| record.seq)
    }
}

/// Metadata attached to a staged input artifact.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    #[serde(default)]
    pub jobs: BTreeMap<String, JobRef>,
}

impl ArtifactMeta {
    pub fn most_recent_job(&self) -> Option<(&String, &JobRef)> {
        self.jobs.iter().max_by_key(|(_, job)| job.seq)
    }
}
