use std::sync::Arc;

use crate::{
    config::AppConfig,
    correlation::{CorrelationStore, LedgerCorrelationStore, SequenceSource},
    jobs::{JobQueue, LedgerJobQueue},
    ledger::Ledger,
    mirror::MirrorDiffer,
    portal::Portal,
    registry::JobRegistry,
    validation::ValidationPolicy,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub ledger: Arc<dyn Ledger>,
    pub portal: Arc<dyn Portal>,
    pub queue: Arc<dyn JobQueue>,
    pub correlations: Arc<dyn CorrelationStore>,
    pub registry: Arc<JobRegistry>,
    pub sequence: Arc<SequenceSource>,
    pub mirror: Arc<MirrorDiffer>,
}

impl AppState {
    /// Wires the ledger-backed job queue, correlation store and sequence
    /// source over `ledger`.
    pub fn new(config: AppConfig, ledger: Arc<dyn Ledger>, portal: Arc<dyn Portal>) -> Self {
        let queue: Arc<dyn JobQueue> = Arc::new(LedgerJobQueue::new(ledger.clone()));
        let correlations: Arc<dyn CorrelationStore> =
            Arc::new(LedgerCorrelationStore::new(ledger.clone()));
        let mirror = MirrorDiffer::new(ledger.clone(), config.policy.force_mirror_write);

        Self {
            registry: Arc::new(JobRegistry::new(queue.clone())),
            sequence: Arc::new(SequenceSource::new(ledger.clone())),
            mirror: Arc::new(mirror),
            config: Arc::new(config),
            ledger,
            portal,
            queue,
            correlations,
        }
    }

    pub fn actor(&self) -> &str {
        &self.config.automation_actor_id
    }

    pub fn validation_policy(&self) -> ValidationPolicy {
        ValidationPolicy::from(&self.config.policy)
    }
}
