use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::json;
use tracing::debug;

use super::join;
use crate::models::{Assessment, AssessmentState, AttachmentRef, Document};
use crate::portal::{
    ApprovalDecision, AssessmentRequest, Attachment, Portal, PortalError, PortalResult,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpPortal {
    client: Client,
    base_url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct Created {
    id: String,
}

impl HttpPortal {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> PortalResult<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(transport)?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            token: token.into(),
        })
    }

    fn document_url(&self, business_id: &str, document_id: &str, rest: &str) -> String {
        join(
            &self.base_url,
            &format!("businesses/{business_id}/documents/{document_id}/{rest}"),
        )
    }

    fn assessment_url(&self, business_id: &str, rest: &str) -> String {
        join(
            &self.base_url,
            &format!("businesses/{business_id}/assessments/{rest}"),
        )
    }

    async fn send(&self, request: RequestBuilder, resource: &str) -> PortalResult<Response> {
        let response = request
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(transport)?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(PortalError::NotFound(resource.to_string())),
            status if status.is_success() => Ok(response),
            status => Err(PortalError::Status {
                status: status.as_u16(),
                resource: resource.to_string(),
            }),
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, url: String, resource: &str) -> PortalResult<T> {
        let response = self.send(self.client.get(url), resource).await?;
        let bytes = response.bytes().await.map_err(transport)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

fn transport(err: reqwest::Error) -> PortalError {
    PortalError::Transport(err.to_string())
}

#[async_trait]
impl Portal for HttpPortal {
    async fn get_document(&self, business_id: &str, document_id: &str) -> PortalResult<Document> {
        self.get_json(
            self.document_url(business_id, document_id, ""),
            &format!("document {document_id}"),
        )
        .await
    }

    async fn set_approval_status(
        &self,
        business_id: &str,
        document_id: &str,
        decision: &ApprovalDecision,
    ) -> PortalResult<()> {
        let body = match decision {
            ApprovalDecision::Approve => json!({ "status": "approved" }),
            ApprovalDecision::Reject { reason } => {
                json!({ "status": "rejected", "reason": reason })
            }
        };
        let url = self.document_url(business_id, document_id, "approval");
        self.send(
            self.client.put(url).json(&body),
            &format!("document {document_id} approval"),
        )
        .await?;
        Ok(())
    }

    async fn post_progress_note(
        &self,
        business_id: &str,
        document_id: &str,
        text: &str,
    ) -> PortalResult<()> {
        let url = self.document_url(business_id, document_id, "notes");
        self.send(
            self.client.post(url).json(&json!({ "text": text })),
            &format!("document {document_id} notes"),
        )
        .await?;
        Ok(())
    }

    async fn fetch_attachments(
        &self,
        business_id: &str,
        document_id: &str,
    ) -> PortalResult<Vec<Attachment>> {
        let listed: Vec<AttachmentRef> = self
            .get_json(
                self.document_url(business_id, document_id, "attachments"),
                &format!("document {document_id} attachments"),
            )
            .await?;

        let mut attachments = Vec::with_capacity(listed.len());
        for reference in listed {
            let url = self.document_url(
                business_id,
                document_id,
                &format!("attachments/{}/content", reference.id),
            );
            let response = self
                .send(
                    self.client.get(url),
                    &format!("attachment {}", reference.id),
                )
                .await?;
            let content_type = reference
                .content_type
                .clone()
                .or_else(|| {
                    response
                        .headers()
                        .get(reqwest::header::CONTENT_TYPE)
                        .and_then(|value| value.to_str().ok())
                        .map(str::to_string)
                })
                .unwrap_or_else(|| "application/octet-stream".to_string());
            let bytes = response.bytes().await.map_err(transport)?;
            debug!(document_id, attachment_id = %reference.id, size = bytes.len(), "attachment downloaded");

            attachments.push(Attachment {
                id: reference.id,
                file_name: reference.file_name,
                content_type,
                bytes,
            });
        }
        Ok(attachments)
    }

    async fn get_assessment(
        &self,
        business_id: &str,
        assessment_id: &str,
    ) -> PortalResult<Assessment> {
        self.get_json(
            self.assessment_url(business_id, assessment_id),
            &format!("assessment {assessment_id}"),
        )
        .await
    }

    async fn set_assessment_status(
        &self,
        business_id: &str,
        assessment_id: &str,
        state: AssessmentState,
    ) -> PortalResult<()> {
        let url = self.assessment_url(business_id, &format!("{assessment_id}/state"));
        self.send(
            self.client.put(url).json(&json!({ "state": state })),
            &format!("assessment {assessment_id} state"),
        )
        .await?;
        Ok(())
    }

    async fn spawn_or_update_assessment(
        &self,
        request: &AssessmentRequest,
    ) -> PortalResult<String> {
        let body = json!({
            "templateId": request.template_id,
            "answers": request.answers,
        });

        match &request.existing_id {
            Some(existing_id) => {
                let url = self.assessment_url(&request.business_id, existing_id);
                self.send(
                    self.client.put(url).json(&body),
                    &format!("assessment {existing_id}"),
                )
                .await?;
                Ok(existing_id.clone())
            }
            None => {
                let url = self.assessment_url(&request.business_id, "");
                let response = self
                    .send(self.client.post(url).json(&body), "assessments")
                    .await?;
                let bytes = response.bytes().await.map_err(transport)?;
                let created: Created = serde_json::from_slice(&bytes)?;
                Ok(created.id)
            }
        }
    }

    async fn link_assessment_to_document(
        &self,
        business_id: &str,
        assessment_id: &str,
        document_id: &str,
    ) -> PortalResult<()> {
        let url = self.document_url(
            business_id,
            document_id,
            &format!("assessments/{assessment_id}"),
        );
        self.send(
            self.client.put(url),
            &format!("document {document_id} assessment link"),
        )
        .await?;
        Ok(())
    }
}
