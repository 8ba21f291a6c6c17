#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, FixedOffset, NaiveTime, Utc};
use fl_sync::{
    config::{AppConfig, PolicyConfig, WorkerConfig},
    default_handlers,
    events::{self, ChangeEvent},
    jobs::{JobQueue, JobRecord},
    ledger::{fetch, paths, ChangeStream, Ledger, LedgerChange, LedgerError, LedgerResult},
    models::{
        ApprovalInfo, ApprovalStatus, Assessment, AssessmentState, AttachmentRef, Document,
        DocumentMeta, JobKind, JobRef,
    },
    portal::{
        ApprovalDecision, AssessmentRequest, Attachment, Portal, PortalError, PortalResult,
    },
    state::AppState,
    validation::scoring::ScoringConfig,
    workers::Execution,
    Worker,
};
use futures_util::{stream, StreamExt};
use serde_json::{json, Map, Value};
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

pub const BUSINESS: &str = "b1";
pub const TRADING_PARTNER: &str = "tp1";
pub const ACTOR: &str = "fl-sync-bot";
pub const TEMPLATE: &str = "coi-template";

#[derive(Debug, Clone, PartialEq)]
pub enum Write {
    Put(String),
    Delete(String),
    Blob(String),
}

/// In-memory ledger tree with deep-merge `put` and a broadcast change feed.
pub struct FakeLedger {
    root: Mutex<Value>,
    blobs: Mutex<HashMap<String, (Bytes, String)>>,
    writes: Mutex<Vec<Write>>,
    changes: broadcast::Sender<LedgerChange>,
}

impl Default for FakeLedger {
    fn default() -> Self {
        let (changes, _) = broadcast::channel(1024);
        Self {
            root: Mutex::new(Value::Object(Map::new())),
            blobs: Mutex::new(HashMap::new()),
            writes: Mutex::new(Vec::new()),
            changes,
        }
    }
}

fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|segment| !segment.is_empty()).collect()
}

fn merge(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                merge(target.entry(key).or_insert(Value::Null), value);
            }
        }
        (target, patch) => *target = patch,
    }
}

impl FakeLedger {
    pub async fn writes(&self) -> Vec<Write> {
        self.writes.lock().await.clone()
    }

    /// Number of puts made at exactly `path`.
    pub async fn puts_at(&self, path: &str) -> usize {
        self.writes
            .lock()
            .await
            .iter()
            .filter(|write| matches!(write, Write::Put(written) if written == path))
            .count()
    }

    pub async fn blob(&self, path: &str) -> Option<(Bytes, String)> {
        self.blobs.lock().await.get(path).cloned()
    }

    pub async fn exists(&self, path: &str) -> bool {
        self.get(path).await.is_ok()
    }
}

#[async_trait]
impl Ledger for FakeLedger {
    async fn get(&self, path: &str) -> LedgerResult<Value> {
        let root = self.root.lock().await;
        let mut node = &*root;
        for segment in segments(path) {
            node = node
                .get(segment)
                .ok_or_else(|| LedgerError::NotFound(path.to_string()))?;
        }
        if node.is_null() {
            return Err(LedgerError::NotFound(path.to_string()));
        }
        Ok(node.clone())
    }

    async fn put(&self, path: &str, body: Value) -> LedgerResult<()> {
        {
            let mut root = self.root.lock().await;
            let mut node = &mut *root;
            for segment in segments(path) {
                if !node.is_object() {
                    *node = Value::Object(Map::new());
                }
                node = node
                    .as_object_mut()
                    .ok_or_else(|| LedgerError::Transport("tree corrupted".into()))?
                    .entry(segment.to_string())
                    .or_insert(Value::Null);
            }
            merge(node, body.clone());
        }
        self.writes.lock().await.push(Write::Put(path.to_string()));
        let _ = self.changes.send(LedgerChange {
            path: path.to_string(),
            body,
        });
        Ok(())
    }

    async fn delete(&self, path: &str) -> LedgerResult<()> {
        let parts = segments(path);
        let Some((last, parents)) = parts.split_last() else {
            return Err(LedgerError::NotFound(path.to_string()));
        };
        {
            let mut root = self.root.lock().await;
            let mut node = &mut *root;
            for segment in parents {
                node = node
                    .get_mut(*segment)
                    .ok_or_else(|| LedgerError::NotFound(path.to_string()))?;
            }
            node.as_object_mut()
                .and_then(|object| object.remove(*last))
                .ok_or_else(|| LedgerError::NotFound(path.to_string()))?;
        }
        self.writes.lock().await.push(Write::Delete(path.to_string()));
        Ok(())
    }

    async fn put_blob(&self, path: &str, bytes: Bytes, content_type: &str) -> LedgerResult<()> {
        self.blobs
            .lock()
            .await
            .insert(path.to_string(), (bytes, content_type.to_string()));
        self.writes.lock().await.push(Write::Blob(path.to_string()));
        Ok(())
    }

    async fn watch(&self, prefix: &str) -> LedgerResult<ChangeStream> {
        let receiver = self.changes.subscribe();
        let prefix = prefix.to_string();
        let changes = stream::unfold(receiver, move |mut receiver| {
            let prefix = prefix.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok(change) if change.path.starts_with(&prefix) => {
                            return Some((Ok(change), receiver))
                        }
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(changes.boxed())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PortalCall {
    Approval {
        document_id: String,
        decision: ApprovalDecision,
    },
    Note {
        document_id: String,
        text: String,
    },
    FetchAttachments {
        document_id: String,
    },
    AssessmentStatus {
        assessment_id: String,
        state: AssessmentState,
    },
    Spawn(AssessmentRequest),
    Link {
        assessment_id: String,
        document_id: String,
    },
}

#[derive(Default)]
struct PortalData {
    documents: HashMap<String, Document>,
    assessments: HashMap<String, Assessment>,
    attachments: HashMap<String, Vec<Attachment>>,
    attachment_outages: usize,
    link_outages: usize,
    calls: Vec<PortalCall>,
    spawned: usize,
}

/// Portal double that records every call and applies status changes as the
/// automation actor.
#[derive(Default)]
pub struct FakePortal {
    data: Mutex<PortalData>,
}

impl FakePortal {
    pub async fn insert_document(&self, document: Document, attachments: Vec<Attachment>) {
        let mut data = self.data.lock().await;
        data.attachments.insert(document.id.clone(), attachments);
        data.documents.insert(document.id.clone(), document);
    }

    /// The next `count` attachment downloads fail with a transport error.
    pub async fn fail_attachments(&self, count: usize) {
        self.data.lock().await.attachment_outages = count;
    }

    /// The next `count` assessment links fail with a transport error.
    pub async fn fail_links(&self, count: usize) {
        self.data.lock().await.link_outages = count;
    }

    /// Moves an assessment as a portal user would, without recording a call.
    pub async fn set_assessment_state(&self, assessment_id: &str, state: AssessmentState, by: &str) {
        if let Some(assessment) = self.data.lock().await.assessments.get_mut(assessment_id) {
            assessment.state = state;
            assessment.updated_by = Some(by.to_string());
        }
    }

    pub async fn document(&self, document_id: &str) -> Option<Document> {
        self.data.lock().await.documents.get(document_id).cloned()
    }

    pub async fn assessment(&self, assessment_id: &str) -> Option<Assessment> {
        self.data.lock().await.assessments.get(assessment_id).cloned()
    }

    pub async fn calls(&self) -> Vec<PortalCall> {
        self.data.lock().await.calls.clone()
    }

    pub async fn approvals(&self, document_id: &str) -> Vec<ApprovalDecision> {
        self.calls()
            .await
            .into_iter()
            .filter_map(|call| match call {
                PortalCall::Approval {
                    document_id: id,
                    decision,
                } if id == document_id => Some(decision),
                _ => None,
            })
            .collect()
    }

    pub async fn notes(&self, document_id: &str) -> Vec<String> {
        self.calls()
            .await
            .into_iter()
            .filter_map(|call| match call {
                PortalCall::Note {
                    document_id: id,
                    text,
                } if id == document_id => Some(text),
                _ => None,
            })
            .collect()
    }

    pub async fn assessment_statuses(&self) -> Vec<(String, AssessmentState)> {
        self.calls()
            .await
            .into_iter()
            .filter_map(|call| match call {
                PortalCall::AssessmentStatus {
                    assessment_id,
                    state,
                } => Some((assessment_id, state)),
                _ => None,
            })
            .collect()
    }

    pub async fn spawns(&self) -> Vec<AssessmentRequest> {
        self.calls()
            .await
            .into_iter()
            .filter_map(|call| match call {
                PortalCall::Spawn(request) => Some(request),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Portal for FakePortal {
    async fn get_document(&self, _business_id: &str, document_id: &str) -> PortalResult<Document> {
        self.document(document_id)
            .await
            .ok_or_else(|| PortalError::NotFound(document_id.to_string()))
    }

    async fn set_approval_status(
        &self,
        _business_id: &str,
        document_id: &str,
        decision: &ApprovalDecision,
    ) -> PortalResult<()> {
        let mut data = self.data.lock().await;
        data.calls.push(PortalCall::Approval {
            document_id: document_id.to_string(),
            decision: decision.clone(),
        });
        if let Some(document) = data.documents.get_mut(document_id) {
            document.approval = ApprovalInfo {
                status: match decision {
                    ApprovalDecision::Approve => ApprovalStatus::Approved,
                    ApprovalDecision::Reject { .. } => ApprovalStatus::Rejected,
                },
                set_by: Some(ACTOR.to_string()),
            };
        }
        Ok(())
    }

    async fn post_progress_note(
        &self,
        _business_id: &str,
        document_id: &str,
        text: &str,
    ) -> PortalResult<()> {
        self.data.lock().await.calls.push(PortalCall::Note {
            document_id: document_id.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn fetch_attachments(
        &self,
        _business_id: &str,
        document_id: &str,
    ) -> PortalResult<Vec<Attachment>> {
        let mut data = self.data.lock().await;
        data.calls.push(PortalCall::FetchAttachments {
            document_id: document_id.to_string(),
        });
        if data.attachment_outages > 0 {
            data.attachment_outages -= 1;
            return Err(PortalError::Transport("connection reset".into()));
        }
        data.attachments
            .get(document_id)
            .cloned()
            .ok_or_else(|| PortalError::NotFound(format!("attachments for {document_id}")))
    }

    async fn get_assessment(
        &self,
        _business_id: &str,
        assessment_id: &str,
    ) -> PortalResult<Assessment> {
        self.assessment(assessment_id)
            .await
            .ok_or_else(|| PortalError::NotFound(assessment_id.to_string()))
    }

    async fn set_assessment_status(
        &self,
        _business_id: &str,
        assessment_id: &str,
        state: AssessmentState,
    ) -> PortalResult<()> {
        let mut data = self.data.lock().await;
        data.calls.push(PortalCall::AssessmentStatus {
            assessment_id: assessment_id.to_string(),
            state,
        });
        if let Some(assessment) = data.assessments.get_mut(assessment_id) {
            assessment.state = state;
            assessment.updated_by = Some(ACTOR.to_string());
        }
        Ok(())
    }

    async fn spawn_or_update_assessment(
        &self,
        request: &AssessmentRequest,
    ) -> PortalResult<String> {
        let mut data = self.data.lock().await;
        data.calls.push(PortalCall::Spawn(request.clone()));
        let id = match &request.existing_id {
            Some(existing) => existing.clone(),
            None => {
                data.spawned += 1;
                format!("assessment-{}", data.spawned)
            }
        };
        data.assessments.insert(
            id.clone(),
            Assessment {
                id: id.clone(),
                template_id: request.template_id.clone(),
                business_id: request.business_id.clone(),
                state: AssessmentState::InProgress,
                updated_by: Some(ACTOR.to_string()),
                answers: request.answers.clone(),
            },
        );
        Ok(id)
    }

    async fn link_assessment_to_document(
        &self,
        _business_id: &str,
        assessment_id: &str,
        document_id: &str,
    ) -> PortalResult<()> {
        let mut data = self.data.lock().await;
        if data.link_outages > 0 {
            data.link_outages -= 1;
            return Err(PortalError::Transport("connection reset".into()));
        }
        data.calls.push(PortalCall::Link {
            assessment_id: assessment_id.to_string(),
            document_id: document_id.to_string(),
        });
        Ok(())
    }
}

pub fn test_config() -> AppConfig {
    AppConfig {
        ledger_url: "http://ledger.test".to_string(),
        ledger_token: "ledger-token".to_string(),
        portal_url: "http://portal.test".to_string(),
        portal_token: "portal-token".to_string(),
        automation_actor_id: ACTOR.to_string(),
        worker: WorkerConfig {
            concurrency: 4,
            max_attempts: 2,
            retry_delay: Duration::from_millis(5),
        },
        policy: PolicyConfig {
            force_mirror_write: false,
            auto_approve_assessments: true,
            auto_reject_assessments: false,
            coi_assessment_template_id: TEMPLATE.to_string(),
            coverage_floor: 1.0,
            expiration_offset: FixedOffset::east_opt(0).expect("utc offset"),
        },
        scoring: ScoringConfig::default(),
    }
}

pub struct TestApp {
    pub state: Arc<AppState>,
    pub ledger: Arc<FakeLedger>,
    pub portal: Arc<FakePortal>,
    pub worker: Worker,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: AppConfig) -> Self {
        let ledger = Arc::new(FakeLedger::default());
        let portal = Arc::new(FakePortal::default());
        let ledger_for_state: Arc<dyn Ledger> = ledger.clone();
        let portal_for_state: Arc<dyn Portal> = portal.clone();
        let state = Arc::new(AppState::new(config, ledger_for_state, portal_for_state));
        let worker = Worker::new(state.clone(), default_handlers());
        Self {
            state,
            ledger,
            portal,
            worker,
        }
    }

    /// Puts the document in the portal and mirrors it into the ledger.
    pub async fn add_document(&self, document: &Document, attachments: Vec<Attachment>) -> Result<()> {
        self.portal
            .insert_document(document.clone(), attachments)
            .await;
        self.state.mirror.mirror_document(document).await?;
        Ok(())
    }

    /// Re-reads the portal copy of the document into the mirror.
    pub async fn refresh_document(&self, document_id: &str) -> Result<bool> {
        let document = self
            .portal
            .document(document_id)
            .await
            .ok_or_else(|| anyhow!("document {document_id} not in portal"))?;
        Ok(self.state.mirror.mirror_document(&document).await?)
    }

    pub async fn document_changed(&self, document_id: &str) -> Execution {
        self.worker
            .execute(ChangeEvent::Document {
                business_id: BUSINESS.to_string(),
                document_id: document_id.to_string(),
            })
            .await
    }

    /// Mirrors the portal's assessment and runs the resolver for it.
    pub async fn assessment_changed(&self, assessment_id: &str) -> Result<Execution> {
        let assessment = self
            .portal
            .assessment(assessment_id)
            .await
            .ok_or_else(|| anyhow!("assessment {assessment_id} not in portal"))?;
        self.state.mirror.mirror_assessment(&assessment).await?;
        Ok(self
            .worker
            .execute(ChangeEvent::Assessment {
                business_id: BUSINESS.to_string(),
                assessment_id: assessment_id.to_string(),
            })
            .await)
    }

    /// Writes `body` at `path` and runs whatever event the write decodes to.
    pub async fn emit(&self, path: &str, body: Value) -> Result<Execution> {
        self.ledger.put(path, body.clone()).await?;
        let event = events::decode(&LedgerChange {
            path: path.to_string(),
            body,
        })
        .with_context(|| format!("{path} does not decode to an event"))?;
        Ok(self.worker.execute(event).await)
    }

    pub async fn start_extraction(&self, target_id: &str, input: &str) -> Result<Execution> {
        self.emit(
            &paths::target_job(target_id),
            json!({
                "id": target_id,
                "input": input,
                "updates": { "u0": update("started", None, None) }
            }),
        )
        .await
    }

    pub async fn complete_extraction(
        &self,
        target_id: &str,
        result_type: &str,
        key: &str,
        data: Value,
    ) -> Result<Execution> {
        self.ledger
            .put(&paths::target_result(result_type, key), data)
            .await?;
        self.ledger
            .put(
                &format!("{}/result", paths::target_job(target_id)),
                json!({ "type": result_type, "key": key }),
            )
            .await?;
        self.emit(
            &format!("{}/updates/{}", paths::target_job(target_id), update_key()),
            update("success", None, None),
        )
        .await
    }

    /// Emits an `error` update carrying the detail, then the `failure`.
    pub async fn fail_extraction(
        &self,
        target_id: &str,
        information: &str,
        code: Option<&str>,
    ) -> Result<Execution> {
        self.emit(
            &format!("{}/updates/{}", paths::target_job(target_id), update_key()),
            update("error", Some(information), code),
        )
        .await?;
        self.emit(
            &format!("{}/updates/{}", paths::target_job(target_id), update_key()),
            update("failure", None, None),
        )
        .await
    }

    pub async fn meta(&self, document_id: &str) -> Result<DocumentMeta> {
        Ok(fetch(
            self.ledger.as_ref(),
            &paths::document_meta(BUSINESS, document_id),
        )
        .await?
        .unwrap_or_default())
    }

    pub async fn document_job(&self, document_id: &str) -> Result<(String, JobRef)> {
        let meta = self.meta(document_id).await?;
        meta.latest_job(JobKind::Document)
            .map(|(key, job)| (key.clone(), job.clone()))
            .ok_or_else(|| anyhow!("document {document_id} has no job"))
    }

    pub async fn job(&self, job_id: Uuid) -> Result<JobRecord> {
        self.state
            .queue
            .get_job(job_id)
            .await?
            .ok_or_else(|| anyhow!("job {job_id} missing"))
    }

    pub async fn mirrored_document(&self, document_id: &str) -> Result<Document> {
        fetch(
            self.ledger.as_ref(),
            &paths::document_mirror(BUSINESS, document_id),
        )
        .await?
        .ok_or_else(|| anyhow!("document {document_id} not mirrored"))
    }
}

fn update_key() -> String {
    Uuid::new_v4().simple().to_string()
}

pub fn update(status: &str, information: Option<&str>, code: Option<&str>) -> Value {
    json!({
        "status": status,
        "information": information,
        "code": code,
        "time": Utc::now(),
    })
}

/// An expiration date comfortably in the future, at noon UTC.
pub fn expiration() -> DateTime<FixedOffset> {
    let date = (Utc::now() + chrono::Duration::days(200)).date_naive();
    date.and_time(NaiveTime::from_hms_opt(12, 0, 0).expect("valid time"))
        .and_utc()
        .fixed_offset()
}

pub fn expiration_day() -> String {
    expiration().format("%Y-%m-%d").to_string()
}

pub fn document(id: &str, document_type: &str) -> Document {
    Document {
        id: id.to_string(),
        name: format!("{document_type} {id}"),
        document_type: document_type.to_string(),
        business_id: BUSINESS.to_string(),
        business_name: "Acme Produce".to_string(),
        trading_partner_id: TRADING_PARTNER.to_string(),
        approval: ApprovalInfo {
            status: ApprovalStatus::AwaitingReview,
            set_by: None,
        },
        expiration_date: Some(expiration()),
        attachments: vec![AttachmentRef {
            id: "a1".to_string(),
            file_name: "certificate.pdf".to_string(),
            content_type: Some("application/pdf".to_string()),
        }],
    }
}

pub fn coi(id: &str) -> Document {
    document(id, "Certificate of Insurance")
}

pub fn pdf(id: &str) -> Attachment {
    Attachment {
        id: id.to_string(),
        file_name: format!("{id}.pdf"),
        content_type: "application/pdf".to_string(),
        bytes: Bytes::from_static(b"%PDF-1.7 test"),
    }
}

/// A certificate extraction that passes raw validation.
pub fn coi_result(each_occurrence: f64, expire_date: &str) -> Value {
    json!({
        "policies": {
            "gl": {
                "type": "Commercial General Liability",
                "expire_date": expire_date,
                "each_occurrence": each_occurrence,
                "general_aggregate": 2000000,
                "products_completed_operations_aggregate": 2000000
            },
            "auto": {
                "type": "Automobile Liability",
                "expire_date": expire_date,
                "combined_single_limit": 1000000
            },
            "el": {
                "type": "Employers Liability",
                "expire_date": expire_date,
                "el_each_accident": 1000000
            },
            "wc": {
                "type": "Workers Compensation",
                "expire_date": expire_date
            }
        }
    })
}

/// Drives a document from mirror write through a successful extraction.
pub async fn extract(
    app: &TestApp,
    document: &Document,
    target_id: &str,
    result_type: &str,
    data: Value,
) -> Result<Execution> {
    app.add_document(document, vec![pdf("a1")]).await?;
    anyhow::ensure!(app.document_changed(&document.id).await == Execution::Success);
    app.start_extraction(target_id, &paths::artifact(&document.id, "a1"))
        .await?;
    app.complete_extraction(target_id, result_type, &format!("{}-result", document.id), data)
        .await
}
