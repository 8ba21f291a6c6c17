use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::ledger::{paths, Ledger, LedgerError, LedgerResult};
use crate::models::{Assessment, Document};

/// Whether `incoming` must be written over the stored mirror.
pub fn needs_sync(stored: Option<&Value>, incoming: &Value, force: bool) -> bool {
    force || stored != Some(incoming)
}

/// Writes portal items into the ledger only when they changed.
pub struct MirrorDiffer {
    ledger: Arc<dyn Ledger>,
    force: bool,
}

impl MirrorDiffer {
    pub fn new(ledger: Arc<dyn Ledger>, force: bool) -> Self {
        Self { ledger, force }
    }

    /// Returns whether a write happened.
    pub async fn sync(&self, path: &str, incoming: &Value) -> LedgerResult<bool> {
        let stored = match self.ledger.get(path).await {
            Ok(value) => Some(value),
            Err(LedgerError::NotFound(_)) => None,
            Err(err) => return Err(err),
        };

        if !needs_sync(stored.as_ref(), incoming, self.force) {
            debug!(path, "mirror unchanged");
            return Ok(false);
        }

        self.ledger.replace(path, incoming.clone()).await?;
        debug!(path, created = stored.is_none(), "mirror written");
        Ok(true)
    }

    pub async fn mirror_document(&self, document: &Document) -> LedgerResult<bool> {
        let path = paths::document_mirror(&document.business_id, &document.id);
        self.sync(&path, &serde_json::to_value(document)?).await
    }

    pub async fn mirror_assessment(&self, assessment: &Assessment) -> LedgerResult<bool> {
        let path = paths::assessment_mirror(&assessment.business_id, &assessment.id);
        self.sync(&path, &serde_json::to_value(assessment)?).await
    }
}
