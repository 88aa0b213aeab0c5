use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{
    Channel, ContactId, ContentType, ConversationId, ConversationState, ConversationStatus,
    DeliveryStatus, MessageId, SenderType, TenantId,
};

/// Maximum length of the summary preview derived from a message body.
pub const PREVIEW_MAX_CHARS: usize = 80;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub file_id: String,
    pub filename: String,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_type: SenderType,
    pub content: String,
    pub content_type: ContentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<AttachmentRef>,
    pub delivery_status: DeliveryStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl MessageRecord {
    /// Short text used for conversation-list previews. Attachment-only
    /// messages fall back to the filename.
    pub fn preview(&self) -> String {
        let text = if self.content.is_empty() {
            self.attachment
                .as_ref()
                .map(|a| a.filename.clone())
                .unwrap_or_default()
        } else {
            self.content.clone()
        };
        text.chars().take(PREVIEW_MAX_CHARS).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactRef {
    pub contact_id: ContactId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: ConversationId,
    pub tenant_id: TenantId,
    pub contact: ContactRef,
    pub channel: Channel,
    pub status: ConversationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_preview: Option<String>,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub state: ConversationState,
}

/// What the user submits. Identity and timestamps are stamped by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDraft {
    pub sender_type: SenderType,
    pub content: String,
    pub content_type: ContentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<AttachmentRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordTable {
    Messages,
    Conversations,
}

/// Raw row-change notification from the push transport. `new` carries the
/// row for inserts/updates, `old` for deletes; rows are decoded lazily so an
/// unknown table or a malformed row never poisons the stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordChange {
    pub change: ChangeKind,
    pub table: RecordTable,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new: Option<Value>,
}

impl RecordChange {
    pub fn message(&self) -> Option<MessageRecord> {
        self.row()
            .and_then(|row| serde_json::from_value(row.clone()).ok())
    }

    pub fn conversation(&self) -> Option<ConversationSummary> {
        self.row()
            .and_then(|row| serde_json::from_value(row.clone()).ok())
    }

    fn row(&self) -> Option<&Value> {
        match self.change {
            ChangeKind::Delete => self.old.as_ref(),
            _ => self.new.as_ref(),
        }
    }
}

/// Key identifying one live push subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", content = "id", rename_all = "snake_case")]
pub enum SubscriptionScope {
    Tenant(TenantId),
    Conversation(ConversationId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Initializing,
    Connecting,
    Connected,
    Disconnected,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SummaryFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ConversationStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ConversationState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
}

impl SummaryFilter {
    pub fn matches(&self, summary: &ConversationSummary) -> bool {
        if let Some(status) = self.status {
            if summary.status != status {
                return false;
            }
        }
        if let Some(state) = self.state {
            if summary.state != state {
                return false;
            }
        }
        if let Some(assigned_to) = &self.assigned_to {
            if summary.assigned_to.as_deref() != Some(assigned_to.as_str()) {
                return false;
            }
        }
        true
    }
}
