use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::FixedOffset;
use url::Url;

use crate::validation::scoring::ScoringConfig;

pub const DEFAULT_CONCURRENCY: usize = 10;
const MAX_CONCURRENCY: usize = 64;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub ledger_url: String,
    pub ledger_token: String,
    pub portal_url: String,
    pub portal_token: String,
    pub automation_actor_id: String,
    pub worker: WorkerConfig,
    pub policy: PolicyConfig,
    pub scoring: ScoringConfig,
}

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            max_attempts: 5,
            retry_delay: Duration::from_secs(30),
        }
    }
}

/// Automation switches for mirroring, validation and assessments.
#[derive(Clone, Debug)]
pub struct PolicyConfig {
    pub force_mirror_write: bool,
    pub auto_approve_assessments: bool,
    pub auto_reject_assessments: bool,
    pub coi_assessment_template_id: String,
    pub coverage_floor: f64,
    pub expiration_offset: FixedOffset,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let ledger_url = env::var("LEDGER_URL").context("LEDGER_URL must be set")?;
        Url::parse(&ledger_url).context("LEDGER_URL must be a valid URL")?;
        let ledger_token = env::var("LEDGER_TOKEN").context("LEDGER_TOKEN must be set")?;
        let portal_url = env::var("PORTAL_URL").context("PORTAL_URL must be set")?;
        Url::parse(&portal_url).context("PORTAL_URL must be a valid URL")?;
        let portal_token = env::var("PORTAL_TOKEN").context("PORTAL_TOKEN must be set")?;
        let automation_actor_id =
            env::var("AUTOMATION_ACTOR_ID").context("AUTOMATION_ACTOR_ID must be set")?;

        let concurrency: usize = env::var("WORKER_CONCURRENCY")
            .unwrap_or_else(|_| DEFAULT_CONCURRENCY.to_string())
            .parse()
            .context("WORKER_CONCURRENCY must be a positive integer")?;
        let max_attempts = env::var("WORKER_MAX_ATTEMPTS")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .context("WORKER_MAX_ATTEMPTS must be an integer")?;
        let retry_delay_secs = env::var("WORKER_RETRY_DELAY_SECS")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .context("WORKER_RETRY_DELAY_SECS must be an integer")?;

        let coi_assessment_template_id = env::var("COI_ASSESSMENT_TEMPLATE_ID")
            .context("COI_ASSESSMENT_TEMPLATE_ID must be set")?;
        let coverage_floor = env::var("COVERAGE_FLOOR")
            .unwrap_or_else(|_| "1".to_string())
            .parse()
            .context("COVERAGE_FLOOR must be a number")?;
        let expiration_offset = env::var("EXPIRATION_UTC_OFFSET")
            .unwrap_or_else(|_| "+00:00".to_string())
            .parse::<FixedOffset>()
            .map_err(|err| anyhow::anyhow!("EXPIRATION_UTC_OFFSET must look like +05:00: {err}"))?;

        Ok(Self {
            ledger_url,
            ledger_token,
            portal_url,
            portal_token,
            automation_actor_id,
            worker: WorkerConfig {
                concurrency: clamp_concurrency(concurrency),
                max_attempts,
                retry_delay: Duration::from_secs(retry_delay_secs),
            },
            policy: PolicyConfig {
                force_mirror_write: env_flag("FORCE_MIRROR_WRITE", false),
                auto_approve_assessments: env_flag("AUTO_APPROVE_ASSESSMENTS", true),
                auto_reject_assessments: env_flag("AUTO_REJECT_ASSESSMENTS", false),
                coi_assessment_template_id,
                coverage_floor,
                expiration_offset,
            },
            scoring: ScoringConfig::default(),
        })
    }

    pub fn redacted_ledger_url(&self) -> String {
        redact_url(&self.ledger_url)
    }

    pub fn redacted_portal_url(&self) -> String {
        redact_url(&self.portal_url)
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    env::var(name)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

fn clamp_concurrency(value: usize) -> usize {
    value.clamp(1, MAX_CONCURRENCY)
}

fn redact_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("*****"));
            }
            if parsed.query().is_some() {
                parsed.set_query(Some("*****"));
            }
            parsed.to_string()
        }
        Err(_) => "***".to_string(),
    }
}
