use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::ledger::{fetch, paths, store, Ledger, LedgerError, LedgerResult};

/// Extraction job → requesting job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetLink {
    pub job_key: String,
    pub job_id: Uuid,
    pub business_id: String,
    pub document_id: String,
    pub seq: u64,
}

/// Assessment → document job that spawned it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssessmentLink {
    pub job_key: String,
    pub job_id: Uuid,
    pub mirror_path: String,
    pub business_id: String,
    pub document_id: String,
    #[serde(default)]
    pub assessment_job: Option<Uuid>,
}

/// Correlation entries that survive restarts.
#[async_trait]
pub trait CorrelationStore: Send + Sync + 'static {
    async fn link_target(&self, target_id: &str, link: TargetLink) -> LedgerResult<()>;

    async fn target(&self, target_id: &str) -> LedgerResult<Option<TargetLink>>;

    async fn release_target(&self, target_id: &str) -> LedgerResult<()>;

    async fn link_assessment(&self, assessment_id: &str, link: AssessmentLink)
        -> LedgerResult<()>;

    async fn assessment(&self, assessment_id: &str) -> LedgerResult<Option<AssessmentLink>>;

    async fn release_assessment(&self, assessment_id: &str) -> LedgerResult<()>;
}

/// Ledger-backed store with an in-memory write-through cache.
pub struct LedgerCorrelationStore {
    ledger: Arc<dyn Ledger>,
    targets: RwLock<HashMap<String, TargetLink>>,
    assessments: RwLock<HashMap<String, AssessmentLink>>,
}

impl LedgerCorrelationStore {
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self {
            ledger,
            targets: RwLock::new(HashMap::new()),
            assessments: RwLock::new(HashMap::new()),
        }
    }

    async fn remove(&self, path: &str) -> LedgerResult<()> {
        match self.ledger.delete(path).await {
            Ok(()) | Err(LedgerError::NotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl CorrelationStore for LedgerCorrelationStore {
    async fn link_target(&self, target_id: &str, link: TargetLink) -> LedgerResult<()> {
        store(self.ledger.as_ref(), &paths::target_link(target_id), &link).await?;
        self.targets.write().await.insert(target_id.to_string(), link);
        Ok(())
    }

    async fn target(&self, target_id: &str) -> LedgerResult<Option<TargetLink>> {
        if let Some(link) = self.targets.read().await.get(target_id) {
            return Ok(Some(link.clone()));
        }

        let link: Option<TargetLink> =
            fetch(self.ledger.as_ref(), &paths::target_link(target_id)).await?;
        if let Some(link) = &link {
            self.targets
                .write()
                .await
                .insert(target_id.to_string(), link.clone());
        }
        Ok(link)
    }

    async fn release_target(&self, target_id: &str) -> LedgerResult<()> {
        self.remove(&paths::target_link(target_id)).await?;
        self.targets.write().await.remove(target_id);
        Ok(())
    }

    async fn link_assessment(
        &self,
        assessment_id: &str,
        link: AssessmentLink,
    ) -> LedgerResult<()> {
        store(
            self.ledger.as_ref(),
            &paths::assessment_link(assessment_id),
            &link,
        )
        .await?;
        self.assessments
            .write()
            .await
            .insert(assessment_id.to_string(), link);
        Ok(())
    }

    async fn assessment(&self, assessment_id: &str) -> LedgerResult<Option<AssessmentLink>> {
        if let Some(link) = self.assessments.read().await.get(assessment_id) {
            return Ok(Some(link.clone()));
        }

        let link: Option<AssessmentLink> =
            fetch(self.ledger.as_ref(), &paths::assessment_link(assessment_id)).await?;
        if let Some(link) = &link {
            self.assessments
                .write()
                .await
                .insert(assessment_id.to_string(), link.clone());
        }
        Ok(link)
    }

    async fn release_assessment(&self, assessment_id: &str) -> LedgerResult<()> {
        self.remove(&paths::assessment_link(assessment_id)).await?;
        self.assessments.write().await.remove(assessment_id);
        Ok(())
    }
}

/// Monotonic counter persisted in the ledger; defines "most recent" for
/// job references.
pub struct SequenceSource {
    ledger: Arc<dyn Ledger>,
    last: Mutex<Option<u64>>,
}

impl SequenceSource {
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self {
            ledger,
            last: Mutex::new(None),
        }
    }

    pub async fn next(&self) -> LedgerResult<u64> {
        let mut last = self.last.lock().await;
        let current = match *last {
            Some(value) => value,
            None => fetch::<u64>(self.ledger.as_ref(), paths::SEQUENCE)
                .await?
                .unwrap_or(0),
        };

        let next = current + 1;
        self.ledger.put(paths::SEQUENCE, json!(next)).await?;
        *last = Some(next);
        Ok(next)
    }
}
