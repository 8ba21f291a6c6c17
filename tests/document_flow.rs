mod common;

use anyhow::{bail, Result};
use common::{coi, document, pdf, TestApp, ACTOR, BUSINESS};
use fl_sync::{
    error::JobErrorKind,
    jobs::{JobOutcome, JobStatus},
    ledger::{fetch, paths},
    models::{ApprovalInfo, ApprovalStatus, ArtifactMeta, AttachmentRef},
    portal::ApprovalDecision,
    workers::{
        documents::{enqueue_document, EnqueueOutcome, Staging},
        Execution,
    },
};

#[tokio::test]
async fn unsupported_document_type_creates_no_job() -> Result<()> {
    let app = TestApp::new();
    let nutrition = document("d1", "100g Nutritional Information");
    app.add_document(&nutrition, vec![pdf("a1")]).await?;

    let execution = app.document_changed("d1").await;

    assert!(matches!(execution, Execution::Skipped { .. }));
    assert!(!app.ledger.exists(paths::JOBS).await);
    assert!(app.meta("d1").await?.jobs.is_empty());
    assert!(app.portal.calls().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn awaiting_review_document_gets_job_and_staged_artifact() -> Result<()> {
    let app = TestApp::new();
    app.add_document(&coi("d1"), vec![pdf("a1")]).await?;

    assert_eq!(app.document_changed("d1").await, Execution::Success);

    let (job_key, job_ref) = app.document_job("d1").await?;
    assert!(job_ref.staged);
    assert_eq!(job_ref.seq, 1);

    let record = app.job(job_ref.job_id).await?;
    assert_eq!(record.status, JobStatus::Pending);
    assert_eq!(record.config.document_id, "d1");
    assert_eq!(record.config.trading_partner_id, common::TRADING_PARTNER);
    assert_eq!(record.config.document_type, "Certificate of Insurance");

    let artifact = paths::artifact("d1", "a1");
    let (bytes, content_type) = app
        .ledger
        .blob(&artifact)
        .await
        .expect("artifact blob staged");
    assert_eq!(content_type, "application/pdf");
    assert!(bytes.starts_with(b"%PDF"));

    let meta: ArtifactMeta = fetch(app.ledger.as_ref(), &paths::artifact_meta(&artifact))
        .await?
        .expect("artifact meta written");
    let (linked_key, linked) = meta.most_recent_job().expect("job reference on artifact");
    assert_eq!(linked_key, &job_key);
    assert_eq!(linked.job_id, job_ref.job_id);

    assert!(app.ledger.exists(&paths::job_index_entry(&job_key)).await);
    Ok(())
}

#[tokio::test]
async fn redelivered_mirror_change_is_not_enqueued_twice() -> Result<()> {
    let app = TestApp::new();
    app.add_document(&coi("d1"), vec![pdf("a1")]).await?;

    assert_eq!(app.document_changed("d1").await, Execution::Success);
    let second = app.document_changed("d1").await;

    assert!(matches!(second, Execution::Skipped { .. }));
    assert_eq!(app.meta("d1").await?.jobs.len(), 1);
    Ok(())
}

#[tokio::test]
async fn concurrent_deliveries_create_one_job() -> Result<()> {
    let app = TestApp::new();
    app.add_document(&coi("d1"), vec![pdf("a1")]).await?;

    let event = fl_sync::events::ChangeEvent::Document {
        business_id: BUSINESS.to_string(),
        document_id: "d1".to_string(),
    };
    let handles: Vec<_> = (0..4)
        .map(|_| app.worker.dispatch(event.clone()))
        .collect();
    let mut successes = 0;
    for handle in handles {
        if handle.await? == Execution::Success {
            successes += 1;
        }
    }

    assert_eq!(successes, 1);
    assert_eq!(app.meta("d1").await?.jobs.len(), 1);
    Ok(())
}

#[tokio::test]
async fn missing_attachments_reject_document() -> Result<()> {
    let app = TestApp::new();
    let document = coi("d1");
    app.add_document(&document, Vec::new()).await?;

    let EnqueueOutcome::Created {
        handle, staging, ..
    } = enqueue_document(&app.state, &document).await?
    else {
        bail!("expected a new job");
    };

    assert_eq!(staging, Staging::Failed(JobErrorKind::BadFlAttachments));
    match handle.wait().await {
        Some(JobOutcome::Failure { kind, .. }) => {
            assert_eq!(kind, JobErrorKind::BadFlAttachments)
        }
        other => bail!("unexpected outcome {other:?}"),
    }

    let approvals = app.portal.approvals("d1").await;
    assert_eq!(
        approvals,
        vec![ApprovalDecision::Reject {
            reason: JobErrorKind::BadFlAttachments.user_message().to_string()
        }]
    );
    let mirrored = app.mirrored_document("d1").await?;
    assert_eq!(mirrored.approval.status, ApprovalStatus::Rejected);
    assert!(mirrored.status_set_by(ACTOR));
    Ok(())
}

#[tokio::test]
async fn several_files_rejected_for_single_file_type() -> Result<()> {
    let app = TestApp::new();
    app.add_document(&coi("d1"), vec![pdf("a1"), pdf("a2")]).await?;

    assert_eq!(app.document_changed("d1").await, Execution::Success);

    let (_, job_ref) = app.document_job("d1").await?;
    let record = app.job(job_ref.job_id).await?;
    assert_eq!(record.status, JobStatus::Failed);
    assert!(matches!(
        record.outcome,
        Some(JobOutcome::Failure {
            kind: JobErrorKind::MultiFilesAttached,
            ..
        })
    ));
    assert!(app.ledger.blob(&paths::artifact("d1", "a1")).await.is_none());
    assert_eq!(app.portal.approvals("d1").await.len(), 1);
    Ok(())
}

#[tokio::test]
async fn audit_documents_accept_several_files() -> Result<()> {
    let app = TestApp::new();
    let audit = document("d1", "Third Party Food Safety GMP Audit");
    app.add_document(&audit, vec![pdf("a1"), pdf("a2")]).await?;

    match enqueue_document(&app.state, &audit).await? {
        EnqueueOutcome::Created { staging, .. } => {
            assert_eq!(staging, Staging::Staged { artifacts: 2 })
        }
        other => bail!("unexpected outcome {other:?}"),
    }
    assert!(app.ledger.blob(&paths::artifact("d1", "a2")).await.is_some());
    assert!(app.portal.approvals("d1").await.is_empty());
    Ok(())
}

#[tokio::test]
async fn interrupted_staging_resumes_on_redelivery() -> Result<()> {
    let app = TestApp::new();
    app.add_document(&coi("d1"), vec![pdf("a1")]).await?;
    app.portal.fail_attachments(5).await;

    // Every attempt hits the outage; the job exists but is not staged.
    let first = app.document_changed("d1").await;
    assert!(matches!(first, Execution::Retry { .. }));
    let (_, job_ref) = app.document_job("d1").await?;
    assert!(!job_ref.staged);

    app.portal.fail_attachments(0).await;
    assert_eq!(app.document_changed("d1").await, Execution::Success);

    let meta = app.meta("d1").await?;
    assert_eq!(meta.jobs.len(), 1);
    let (_, resumed) = app.document_job("d1").await?;
    assert_eq!(resumed.job_id, job_ref.job_id);
    assert!(resumed.staged);
    Ok(())
}

#[tokio::test]
async fn approval_by_another_actor_is_left_alone() -> Result<()> {
    let app = TestApp::new();
    let mut approved = coi("d1");
    approved.approval = ApprovalInfo {
        status: ApprovalStatus::Approved,
        set_by: Some("reviewer-7".to_string()),
    };
    app.add_document(&approved, vec![pdf("a1")]).await?;

    let execution = app.document_changed("d1").await;

    assert!(matches!(execution, Execution::Skipped { .. }));
    assert!(app.meta("d1").await?.jobs.is_empty());
    assert!(app.portal.calls().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn resubmitted_document_gets_a_new_job() -> Result<()> {
    let app = TestApp::new();
    app.add_document(&coi("d1"), vec![pdf("a1"), pdf("a2")]).await?;
    assert_eq!(app.document_changed("d1").await, Execution::Success);
    let (first_key, first) = app.document_job("d1").await?;
    assert_eq!(app.job(first.job_id).await?.status, JobStatus::Failed);

    // The supplier uploads a single file and the document returns to review.
    let mut resubmitted = coi("d1");
    resubmitted.approval.set_by = Some("supplier-contact".to_string());
    resubmitted.attachments = vec![AttachmentRef {
        id: "a3".to_string(),
        file_name: "certificate-v2.pdf".to_string(),
        content_type: Some("application/pdf".to_string()),
    }];
    app.add_document(&resubmitted, vec![pdf("a3")]).await?;

    assert_eq!(app.document_changed("d1").await, Execution::Success);

    let (second_key, second) = app.document_job("d1").await?;
    assert_ne!(second_key, first_key);
    assert_ne!(second.job_id, first.job_id);
    assert!(second.seq > first.seq);
    assert!(second.staged);
    assert_eq!(app.job(second.job_id).await?.status, JobStatus::Pending);
    assert!(app.ledger.blob(&paths::artifact("d1", "a3")).await.is_some());
    assert_eq!(app.meta("d1").await?.jobs.len(), 2);

    // Redelivering the same resubmission does not start a third job.
    assert!(matches!(
        app.document_changed("d1").await,
        Execution::Skipped { .. }
    ));
    assert_eq!(app.meta("d1").await?.jobs.len(), 2);
    Ok(())
}

#[tokio::test]
async fn resumed_staging_hands_back_a_job_handle() -> Result<()> {
    let app = TestApp::new();
    let document = coi("d1");
    app.add_document(&document, vec![pdf("a1")]).await?;
    app.portal.fail_attachments(5).await;
    assert!(matches!(
        app.document_changed("d1").await,
        Execution::Retry { .. }
    ));
    let (_, job_ref) = app.document_job("d1").await?;
    app.portal.fail_attachments(0).await;

    let EnqueueOutcome::Resumed {
        handle, staging, ..
    } = enqueue_document(&app.state, &document).await?
    else {
        bail!("expected staging to resume");
    };
    assert_eq!(staging, Staging::Staged { artifacts: 1 });
    assert_eq!(handle.job_id(), job_ref.job_id);

    app.start_extraction("t1", &paths::artifact("d1", "a1"))
        .await?;
    app.fail_extraction("t1", "File is not a Textual PDF", None)
        .await?;
    match handle.wait().await {
        Some(JobOutcome::Failure { kind, .. }) => {
            assert_eq!(kind, JobErrorKind::TargetUnrecognized)
        }
        other => bail!("unexpected outcome {other:?}"),
    }
    Ok(())
}
