use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{stream, StreamExt};
use reqwest::{header, Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::join;
use crate::ledger::{ChangeStream, Ledger, LedgerChange, LedgerError, LedgerResult};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
// Long-poll requests are held open by the server for up to this long.
const WATCH_TIMEOUT: Duration = Duration::from_secs(90);

pub struct HttpLedger {
    client: Client,
    base_url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct ChangePage {
    rev: String,
    #[serde(default)]
    changes: Vec<ChangeEntry>,
}

#[derive(Debug, Deserialize)]
struct ChangeEntry {
    path: String,
    #[serde(default)]
    body: Value,
}

struct Feed {
    client: Client,
    url: String,
    token: String,
    since: Option<String>,
    pending: VecDeque<LedgerChange>,
    failed: bool,
}

impl HttpLedger {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> LedgerResult<Self> {
        let client = Client::builder()
            .build()
            .map_err(|err| LedgerError::Transport(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            token: token.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        join(&self.base_url, path)
    }
}

fn transport(err: reqwest::Error) -> LedgerError {
    LedgerError::Transport(err.to_string())
}

fn check(response: Response, path: &str) -> LedgerResult<Response> {
    match response.status() {
        StatusCode::NOT_FOUND => Err(LedgerError::NotFound(path.to_string())),
        status if status.is_success() => Ok(response),
        status => Err(LedgerError::Status {
            status: status.as_u16(),
            path: path.to_string(),
        }),
    }
}

#[async_trait]
impl Ledger for HttpLedger {
    async fn get(&self, path: &str) -> LedgerResult<Value> {
        let response = self
            .client
            .get(self.url(path))
            .bearer_auth(&self.token)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(transport)?;
        let response = check(response, path)?;
        let bytes = response.bytes().await.map_err(transport)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn put(&self, path: &str, body: Value) -> LedgerResult<()> {
        let response = self
            .client
            .put(self.url(path))
            .bearer_auth(&self.token)
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(transport)?;
        check(response, path)?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> LedgerResult<()> {
        let response = self
            .client
            .delete(self.url(path))
            .bearer_auth(&self.token)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(transport)?;
        check(response, path)?;
        Ok(())
    }

    async fn put_blob(&self, path: &str, bytes: Bytes, content_type: &str) -> LedgerResult<()> {
        let response = self
            .client
            .put(self.url(path))
            .bearer_auth(&self.token)
            .timeout(REQUEST_TIMEOUT)
            .header(header::CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await
            .map_err(transport)?;
        check(response, path)?;
        Ok(())
    }

    async fn watch(&self, prefix: &str) -> LedgerResult<ChangeStream> {
        let feed = Feed {
            client: self.client.clone(),
            url: join(&self.base_url, &format!("changes/{prefix}")),
            token: self.token.clone(),
            since: None,
            pending: VecDeque::new(),
            failed: false,
        };

        let changes = stream::unfold(feed, |mut feed| async move {
            loop {
                if let Some(change) = feed.pending.pop_front() {
                    return Some((Ok(change), feed));
                }
                if feed.failed {
                    return None;
                }
                match poll(&feed).await {
                    Ok(page) => {
                        debug!(url = %feed.url, rev = %page.rev, changes = page.changes.len(), "change page received");
                        feed.since = Some(page.rev);
                        feed.pending.extend(page.changes.into_iter().map(|entry| LedgerChange {
                            path: entry.path,
                            body: entry.body,
                        }));
                    }
                    Err(err) => {
                        feed.failed = true;
                        return Some((Err(err), feed));
                    }
                }
            }
        });
        Ok(changes.boxed())
    }
}

async fn poll(feed: &Feed) -> LedgerResult<ChangePage> {
    let mut request = feed
        .client
        .get(&feed.url)
        .bearer_auth(&feed.token)
        .timeout(WATCH_TIMEOUT);
    if let Some(since) = &feed.since {
        request = request.query(&[("since", since)]);
    }
    let response = request.send().await.map_err(transport)?;
    let response = check(response, &feed.url)?;
    let bytes = response.bytes().await.map_err(transport)?;
    Ok(serde_json::from_slice(&bytes)?)
}
