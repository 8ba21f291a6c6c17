//! Insurance assessment answers and the pass/fail rule applied to them.

use serde::{Deserialize, Serialize};

use super::coi::{CoiResult, PolicyType};
use crate::models::{AnswerValue, Assessment, ScoredAnswer};

pub const GENERAL_LIABILITY_EACH_OCCURRENCE: &str = "general-liability-each-occurrence";
pub const GENERAL_LIABILITY_AGGREGATE: &str = "general-liability-aggregate";
pub const PRODUCTS_COMPLETED_OPERATIONS: &str = "products-completed-operations";
pub const AUTO_COMBINED_SINGLE_LIMIT: &str = "auto-combined-single-limit";
pub const EMPLOYERS_LIABILITY: &str = "employers-liability";
pub const UMBRELLA_EACH_OCCURRENCE: &str = "umbrella-each-occurrence";
pub const WORKERS_COMPENSATION: &str = "workers-compensation";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Requirement {
    pub column: String,
    pub minimum: f64,
    /// Whether the umbrella amount may be added to this column's value.
    pub umbrella_eligible: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringConfig {
    pub requirements: Vec<Requirement>,
    pub umbrella_column: String,
    pub required_yes: Vec<String>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        let requirement = |column: &str, minimum: f64, umbrella_eligible: bool| Requirement {
            column: column.to_string(),
            minimum,
            umbrella_eligible,
        };

        Self {
            requirements: vec![
                requirement(GENERAL_LIABILITY_EACH_OCCURRENCE, 1_000_000.0, true),
                requirement(GENERAL_LIABILITY_AGGREGATE, 2_000_000.0, true),
                requirement(PRODUCTS_COMPLETED_OPERATIONS, 2_000_000.0, true),
                requirement(AUTO_COMBINED_SINGLE_LIMIT, 1_000_000.0, true),
                requirement(EMPLOYERS_LIABILITY, 1_000_000.0, true),
            ],
            umbrella_column: UMBRELLA_EACH_OCCURRENCE.to_string(),
            required_yes: vec![WORKERS_COMPENSATION.to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoreVerdict {
    pub passed: bool,
    pub failures: Vec<String>,
}

/// Maps extracted coverage onto the assessment template's columns.
pub fn build_answers(coi: &CoiResult) -> Vec<ScoredAnswer> {
    let numeric = [
        (
            GENERAL_LIABILITY_EACH_OCCURRENCE,
            PolicyType::GeneralLiability,
            "each_occurrence",
        ),
        (
            GENERAL_LIABILITY_AGGREGATE,
            PolicyType::GeneralLiability,
            "general_aggregate",
        ),
        (
            PRODUCTS_COMPLETED_OPERATIONS,
            PolicyType::GeneralLiability,
            "products_completed_operations_aggregate",
        ),
        (
            AUTO_COMBINED_SINGLE_LIMIT,
            PolicyType::Automobile,
            "combined_single_limit",
        ),
        (
            EMPLOYERS_LIABILITY,
            PolicyType::EmployersLiability,
            "el_each_accident",
        ),
        (UMBRELLA_EACH_OCCURRENCE, PolicyType::Umbrella, "each_occurrence"),
    ];

    let mut answers: Vec<ScoredAnswer> = numeric
        .iter()
        .map(|(column, kind, field)| ScoredAnswer {
            column: column.to_string(),
            value: AnswerValue::Number(coi.max_amount(*kind, field).unwrap_or(0.0)),
        })
        .collect();

    answers.push(ScoredAnswer {
        column: WORKERS_COMPENSATION.to_string(),
        value: AnswerValue::YesNo(coi.has_policy(PolicyType::WorkersCompensation)),
    });
    answers
}

/// Checks every requirement against the assessment's answers. An eligible
/// column passes when its own value plus the umbrella value meets the minimum.
pub fn evaluate(assessment: &Assessment, config: &ScoringConfig) -> ScoreVerdict {
    let umbrella = assessment.number(&config.umbrella_column).unwrap_or(0.0);
    let mut failures = Vec::new();

    for requirement in &config.requirements {
        let own = assessment.number(&requirement.column).unwrap_or(0.0);
        let effective = if requirement.umbrella_eligible {
            own + umbrella
        } else {
            own
        };
        if effective < requirement.minimum {
            failures.push(format!(
                "{} of {:.0} is below {:.0}",
                requirement.column, effective, requirement.minimum
            ));
        }
    }

    for column in &config.required_yes {
        if assessment.yes_no(column) != Some(true) {
            failures.push(format!("{column} is required"));
        }
    }

    ScoreVerdict {
        passed: failures.is_empty(),
        failures,
    }
}
