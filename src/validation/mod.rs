pub mod classify;
pub mod coi;
pub mod scoring;

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::PolicyConfig;
use crate::models::{Document, DocumentType};

/// Outcome of checking an extracted result against the submitted document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub status: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ValidationResult {
    pub fn passed() -> Self {
        Self {
            status: true,
            message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: false,
            message: Some(message.into()),
        }
    }
}

/// Validation knobs taken from the policy configuration.
#[derive(Debug, Clone)]
pub struct ValidationPolicy {
    pub coverage_floor: f64,
    pub expiration_offset: FixedOffset,
}

impl From<&PolicyConfig> for ValidationPolicy {
    fn from(policy: &PolicyConfig) -> Self {
        Self {
            coverage_floor: policy.coverage_floor,
            expiration_offset: policy.expiration_offset,
        }
    }
}

/// Runs the type-specific checks for `document`. `now` fixes "today".
pub fn validate(
    document: &Document,
    result: &Value,
    policy: &ValidationPolicy,
    now: DateTime<Utc>,
) -> ValidationResult {
    let today = now.with_timezone(&policy.expiration_offset).date_naive();

    match document.kind() {
        DocumentType::CertificateOfInsurance => coi::validate(document, result, policy, today),
        _ => validate_expiration(document, result, policy, today),
    }
}

/// Non-insurance results are only checked when both sides carry a date.
fn validate_expiration(
    document: &Document,
    result: &Value,
    policy: &ValidationPolicy,
    today: NaiveDate,
) -> ValidationResult {
    let extracted = ["expire_date", "expiration_date"]
        .iter()
        .find_map(|field| result.get(*field).and_then(Value::as_str))
        .and_then(|raw| extracted_date(raw, &policy.expiration_offset));

    match (extracted, document.expiration_date.as_ref()) {
        (Some(extracted), Some(_)) => coi::check_expiration(
            document.expiration_date.as_ref(),
            extracted,
            &policy.expiration_offset,
            today,
        ),
        _ => ValidationResult::passed(),
    }
}

/// Parses an extracted date. Timestamps are shifted into `offset`; bare
/// calendar dates are taken as already expressed there.
pub(crate) fn extracted_date(raw: &str, offset: &FixedOffset) -> Option<NaiveDate> {
    let raw = raw.trim();
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(raw) {
        return Some(timestamp.with_timezone(offset).date_naive());
    }
    ["%Y-%m-%d", "%m/%d/%Y", "%m/%d/%y"]
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(raw, format).ok())
}
