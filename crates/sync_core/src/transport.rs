use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::Client;
use serde::Serialize;
use shared::{
    domain::{ConversationId, DeliveryStatus, MessageId, TenantId},
    error::{ApiError, ApiException, ErrorCode},
    protocol::{ConversationSummary, MessageRecord, RecordChange, SubscriptionScope, SummaryFilter},
};
use storage::PendingSend;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::warn;
use url::Url;

use crate::{ChangeStream, PushEventSource, RecordStore};

const WS_EVENT_BUFFER: usize = 256;

/// JSON REST implementation of the record-store contract.
pub struct HttpRecordStore {
    http: Client,
    server_url: String,
}

impl HttpRecordStore {
    pub fn new(server_url: impl Into<String>) -> Result<Self> {
        let server_url = server_url.into();
        Url::parse(&server_url).with_context(|| format!("invalid server url: {server_url}"))?;
        Ok(Self {
            http: Client::new(),
            server_url: server_url.trim_end_matches('/').to_string(),
        })
    }
}

#[derive(Serialize)]
struct ListMessagesQuery {
    limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    before: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct UpdateStatusRequest {
    status: DeliveryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
}

/// Maps a non-success response into a typed `ApiException`, preferring the
/// backend's own error body when it parses.
async fn expect_ok(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let fallback_code = match status.as_u16() {
        401 | 403 => ErrorCode::Unauthorized,
        404 => ErrorCode::NotFound,
        400 | 422 => ErrorCode::Validation,
        429 => ErrorCode::RateLimited,
        502..=504 => ErrorCode::Unavailable,
        _ => ErrorCode::Internal,
    };
    let text = response.text().await.unwrap_or_default();
    let (code, message) = match serde_json::from_str::<ApiError>(&text) {
        Ok(body) => (body.code, body.message),
        Err(_) if text.is_empty() => (fallback_code, format!("backend returned {status}")),
        Err(_) => (fallback_code, text),
    };
    Err(ApiException::new(code, message).into())
}

#[async_trait]
impl RecordStore for HttpRecordStore {
    async fn list_messages(
        &self,
        conversation_id: &ConversationId,
        limit: u32,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<MessageRecord>> {
        let response = self
            .http
            .get(format!(
                "{}/conversations/{conversation_id}/messages",
                self.server_url
            ))
            .query(&ListMessagesQuery { limit, before })
            .send()
            .await?;
        let messages = expect_ok(response).await?.json().await?;
        Ok(messages)
    }

    async fn create_message(&self, payload: &PendingSend) -> Result<MessageRecord> {
        let response = self
            .http
            .post(format!("{}/messages", self.server_url))
            .json(payload)
            .send()
            .await?;
        let record = expect_ok(response).await?.json().await?;
        Ok(record)
    }

    async fn update_message_status(
        &self,
        id: &MessageId,
        status: DeliveryStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/messages/{id}/status", self.server_url))
            .json(&UpdateStatusRequest {
                status,
                error_message: error.map(str::to_string),
            })
            .send()
            .await?;
        expect_ok(response).await?;
        Ok(())
    }

    async fn list_conversations(
        &self,
        tenant_id: &TenantId,
        filter: &SummaryFilter,
    ) -> Result<Vec<ConversationSummary>> {
        let response = self
            .http
            .get(format!(
                "{}/tenants/{tenant_id}/conversations",
                self.server_url
            ))
            .query(filter)
            .send()
            .await?;
        let summaries = expect_ok(response).await?.json().await?;
        Ok(summaries)
    }
}

/// Websocket implementation of the push-event contract. One socket per
/// scope; frames are JSON-encoded `RecordChange` rows. Undecodable frames
/// are logged and skipped so one malformed event cannot poison the stream.
pub struct WebSocketEventSource {
    server_url: String,
}

impl WebSocketEventSource {
    pub fn new(server_url: impl Into<String>) -> Result<Self> {
        let server_url = server_url.into();
        Url::parse(&server_url).with_context(|| format!("invalid server url: {server_url}"))?;
        Ok(Self {
            server_url: server_url.trim_end_matches('/').to_string(),
        })
    }

    fn ws_endpoint(&self, scope: &SubscriptionScope) -> Result<Url> {
        let mut url = Url::parse(&self.server_url)?;
        let scheme = match url.scheme() {
            "https" => "wss",
            "http" => "ws",
            other => return Err(anyhow!("server url must be http(s), got {other}://")),
        };
        url.set_scheme(scheme)
            .map_err(|_| anyhow!("failed to derive websocket scheme"))?;
        let path = match scope {
            SubscriptionScope::Tenant(tenant_id) => {
                format!("{}/realtime/tenants/{tenant_id}", url.path().trim_end_matches('/'))
            }
            SubscriptionScope::Conversation(conversation_id) => format!(
                "{}/realtime/conversations/{conversation_id}",
                url.path().trim_end_matches('/')
            ),
        };
        url.set_path(&path);
        Ok(url)
    }
}

#[async_trait]
impl PushEventSource for WebSocketEventSource {
    async fn subscribe(&self, scope: SubscriptionScope) -> Result<ChangeStream> {
        let endpoint = self.ws_endpoint(&scope)?;
        let (ws_stream, _) = connect_async(endpoint.as_str())
            .await
            .with_context(|| format!("failed to connect websocket: {endpoint}"))?;
        let (_, mut reader) = ws_stream.split();

        let (tx, rx) = mpsc::channel(WS_EVENT_BUFFER);
        tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<RecordChange>(&text) {
                        Ok(change) => {
                            if tx.send(change).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => warn!("realtime: dropping invalid change frame: {err}"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!("realtime: websocket receive failed: {err}");
                        break;
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
