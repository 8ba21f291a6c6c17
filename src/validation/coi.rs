//! Certificate of insurance extraction results and their raw validation.

use std::collections::BTreeMap;

use chrono::{DateTime, FixedOffset, NaiveDate};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use super::{extracted_date, ValidationPolicy, ValidationResult};
use crate::models::Document;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CoiResult {
    #[serde(default)]
    pub policies: BTreeMap<String, Policy>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Policy {
    #[serde(rename = "type")]
    pub policy_type: String,
    #[serde(default)]
    pub expire_date: Option<String>,
    #[serde(default, deserialize_with = "amount")]
    pub each_occurrence: Option<f64>,
    #[serde(default, deserialize_with = "amount")]
    pub general_aggregate: Option<f64>,
    #[serde(default, deserialize_with = "amount")]
    pub products_completed_operations_aggregate: Option<f64>,
    #[serde(default, deserialize_with = "amount")]
    pub combined_single_limit: Option<f64>,
    #[serde(default, deserialize_with = "amount")]
    pub el_each_accident: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyType {
    GeneralLiability,
    Automobile,
    Umbrella,
    EmployersLiability,
    WorkersCompensation,
    Other,
}

impl Policy {
    /// Coverage kinds this line carries. A combined line such as
    /// "Workers Compensation and Employers' Liability" counts for both.
    pub fn kinds(&self) -> Vec<PolicyType> {
        let name = self.policy_type.to_ascii_lowercase();
        let mut kinds = Vec::new();
        if name.contains("general liability") {
            kinds.push(PolicyType::GeneralLiability);
        } else if name.contains("auto") {
            kinds.push(PolicyType::Automobile);
        } else if name.contains("umbrella") || name.contains("excess") {
            kinds.push(PolicyType::Umbrella);
        }
        if name.contains("employer") {
            kinds.push(PolicyType::EmployersLiability);
        }
        if name.contains("workers") {
            kinds.push(PolicyType::WorkersCompensation);
        }
        if kinds.is_empty() {
            kinds.push(PolicyType::Other);
        }
        kinds
    }

    pub fn covers(&self, kind: PolicyType) -> bool {
        self.kinds().contains(&kind)
    }

    /// Coverage amounts this line is expected to carry for `kind`.
    pub fn coverage_lines(&self, kind: PolicyType) -> Vec<(&'static str, Option<f64>)> {
        match kind {
            PolicyType::GeneralLiability => vec![
                ("each_occurrence", self.each_occurrence),
                ("general_aggregate", self.general_aggregate),
                (
                    "products_completed_operations_aggregate",
                    self.products_completed_operations_aggregate,
                ),
            ],
            PolicyType::Automobile => vec![("combined_single_limit", self.combined_single_limit)],
            PolicyType::Umbrella => vec![("each_occurrence", self.each_occurrence)],
            PolicyType::EmployersLiability => vec![("el_each_accident", self.el_each_accident)],
            PolicyType::WorkersCompensation | PolicyType::Other => Vec::new(),
        }
    }

    fn all_coverage_lines(&self) -> Vec<(&'static str, Option<f64>)> {
        self.kinds()
            .into_iter()
            .flat_map(|kind| self.coverage_lines(kind))
            .collect()
    }
}

impl CoiResult {
    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        CoiResult::deserialize(value)
    }

    /// Largest amount of `field` across policies of `kind`.
    pub fn max_amount(&self, kind: PolicyType, field: &str) -> Option<f64> {
        self.policies
            .values()
            .filter(|policy| policy.covers(kind))
            .flat_map(|policy| policy.coverage_lines(kind))
            .filter(|(name, _)| *name == field)
            .filter_map(|(_, amount)| amount)
            .fold(None, |best: Option<f64>, amount| {
                Some(best.map_or(amount, |best| best.max(amount)))
            })
    }

    pub fn has_policy(&self, kind: PolicyType) -> bool {
        self.policies.values().any(|policy| policy.covers(kind))
    }

    /// Earliest expiration across all policies, normalized to `offset`.
    pub fn earliest_expiration(&self, offset: &FixedOffset) -> Option<NaiveDate> {
        self.policies
            .values()
            .filter_map(|policy| policy.expire_date.as_deref())
            .filter_map(|raw| extracted_date(raw, offset))
            .min()
    }
}

pub(super) fn validate(
    document: &Document,
    result: &Value,
    policy: &ValidationPolicy,
    today: NaiveDate,
) -> ValidationResult {
    let coi = match CoiResult::from_value(result) {
        Ok(coi) => coi,
        Err(err) => {
            return ValidationResult::failed(format!(
                "The extracted certificate could not be read: {err}"
            ))
        }
    };

    if coi.policies.is_empty() {
        return ValidationResult::failed("No insurance policies were found on the certificate.");
    }

    for line in coi.policies.values() {
        for (field, amount) in line.all_coverage_lines() {
            if let Some(amount) = amount {
                if amount < policy.coverage_floor {
                    return ValidationResult::failed(format!(
                        "{} {} of {:.0} is below the required minimum of {:.0}.",
                        line.policy_type, field, amount, policy.coverage_floor
                    ));
                }
            }
        }
    }

    let Some(extracted) = coi.earliest_expiration(&policy.expiration_offset) else {
        return ValidationResult::failed("No expiration date was found on the certificate.");
    };

    check_expiration(
        document.expiration_date.as_ref(),
        extracted,
        &policy.expiration_offset,
        today,
    )
}

pub(super) fn check_expiration(
    submitted: Option<&DateTime<FixedOffset>>,
    extracted: NaiveDate,
    offset: &FixedOffset,
    today: NaiveDate,
) -> ValidationResult {
    let Some(submitted) = submitted else {
        return ValidationResult::failed("No expiration date was submitted with the document.");
    };

    let submitted = submitted.with_timezone(offset).date_naive();
    if submitted != extracted {
        return ValidationResult::failed(format!(
            "The submitted expiration date {submitted} does not match the document's expiration date {extracted}."
        ));
    }

    if extracted < today {
        return ValidationResult::failed(format!("The document expired on {extracted}."));
    }

    ValidationResult::passed()
}

fn amount<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(number)) => number.as_f64(),
        Some(Value::String(raw)) => {
            let cleaned: String = raw
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.')
                .collect();
            cleaned.parse().ok()
        }
        _ => None,
    })
}
