use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Utc};
use shared::{
    domain::{Channel, ConversationId, DeliveryStatus, MessageId},
    protocol::{ConversationSummary, MessageDraft, MessageRecord, SummaryFilter},
};

pub(crate) struct CacheState {
    pub(crate) messages: HashMap<ConversationId, Vec<MessageRecord>>,
    pub(crate) summaries: HashMap<ConversationId, ConversationSummary>,
}

/// In-memory store of message threads and conversation summaries. Single
/// source of truth for rendering. Mutations are synchronous and only happen
/// through the optimistic-write and reconcile paths; the mutex is never held
/// across an await.
pub struct ThreadCache {
    pub(crate) inner: Mutex<CacheState>,
}

impl ThreadCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CacheState {
                messages: HashMap::new(),
                summaries: HashMap::new(),
            }),
        }
    }

    /// Optimistic write: stamps a provisional id and a client timestamp,
    /// appends at the tail (the user always sends "now") and patches the
    /// summary preview in the same pass. Cannot fail; delivery failures
    /// surface later through status patches.
    pub fn append_provisional(
        &self,
        conversation_id: &ConversationId,
        draft: &MessageDraft,
    ) -> (MessageRecord, bool) {
        let record = MessageRecord {
            id: MessageId::provisional(),
            conversation_id: conversation_id.clone(),
            sender_type: draft.sender_type,
            content: draft.content.clone(),
            content_type: draft.content_type,
            attachment: draft.attachment.clone(),
            delivery_status: DeliveryStatus::Sending,
            created_at: Utc::now(),
            error_message: None,
        };

        let mut state = self.inner.lock().expect("thread cache poisoned");
        state
            .messages
            .entry(conversation_id.clone())
            .or_default()
            .push(record.clone());
        let summary_changed = Self::refresh_summary_tail(&mut state, conversation_id);
        (record, summary_changed)
    }

    pub fn messages(&self, conversation_id: &ConversationId) -> Vec<MessageRecord> {
        let state = self.inner.lock().expect("thread cache poisoned");
        state
            .messages
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Filtered summary list, most recently active first.
    pub fn summaries(&self, filter: &SummaryFilter) -> Vec<ConversationSummary> {
        let state = self.inner.lock().expect("thread cache poisoned");
        let mut summaries: Vec<ConversationSummary> = state
            .summaries
            .values()
            .filter(|summary| filter.matches(summary))
            .cloned()
            .collect();
        summaries.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
        summaries
    }

    pub fn summary(&self, conversation_id: &ConversationId) -> Option<ConversationSummary> {
        let state = self.inner.lock().expect("thread cache poisoned");
        state.summaries.get(conversation_id).cloned()
    }

    pub fn channel_for(&self, conversation_id: &ConversationId) -> Option<Channel> {
        let state = self.inner.lock().expect("thread cache poisoned");
        state.summaries.get(conversation_id).map(|s| s.channel)
    }

    pub fn upsert_summary(&self, summary: ConversationSummary) -> bool {
        let mut state = self.inner.lock().expect("thread cache poisoned");
        match state.summaries.get(&summary.id) {
            Some(existing) if *existing == summary => false,
            _ => {
                state.summaries.insert(summary.id.clone(), summary);
                true
            }
        }
    }

    pub fn remove_summary(&self, conversation_id: &ConversationId) -> bool {
        let mut state = self.inner.lock().expect("thread cache poisoned");
        state.summaries.remove(conversation_id).is_some()
    }

    pub fn mark_read(&self, conversation_id: &ConversationId) -> bool {
        let mut state = self.inner.lock().expect("thread cache poisoned");
        match state.summaries.get_mut(conversation_id) {
            Some(summary) if summary.unread_count > 0 => {
                summary.unread_count = 0;
                true
            }
            _ => false,
        }
    }

    /// Recomputes the summary's derived fields from the thread tail. Called
    /// under the same lock as the message mutation that triggered it, so the
    /// summary never observably lags its thread.
    pub(crate) fn refresh_summary_tail(
        state: &mut CacheState,
        conversation_id: &ConversationId,
    ) -> bool {
        let tail = state
            .messages
            .get(conversation_id)
            .and_then(|list| list.last())
            .map(|m| (m.created_at, m.preview()));
        let Some(summary) = state.summaries.get_mut(conversation_id) else {
            return false;
        };
        match tail {
            Some((created_at, preview)) => {
                let changed = summary.last_message_at != Some(created_at)
                    || summary.last_message_preview.as_deref() != Some(preview.as_str());
                if changed {
                    summary.last_message_at = Some(created_at);
                    summary.last_message_preview = Some(preview);
                }
                changed
            }
            None => {
                let changed =
                    summary.last_message_at.is_some() || summary.last_message_preview.is_some();
                if changed {
                    summary.last_message_at = None;
                    summary.last_message_preview = None;
                }
                changed
            }
        }
    }
}

impl Default for ThreadCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Position keeping the thread sorted ascending by `created_at`; equal
/// timestamps keep their insertion sequence.
pub(crate) fn sorted_insert_index(list: &[MessageRecord], created_at: DateTime<Utc>) -> usize {
    list.partition_point(|m| m.created_at <= created_at)
}

/// Read-only cache handle. UI surfaces get this instead of the cache itself
/// so all writes stay funneled through the engine.
#[derive(Clone)]
pub struct CacheReader {
    cache: Arc<ThreadCache>,
}

impl CacheReader {
    pub(crate) fn new(cache: Arc<ThreadCache>) -> Self {
        Self { cache }
    }

    pub fn messages(&self, conversation_id: &ConversationId) -> Vec<MessageRecord> {
        self.cache.messages(conversation_id)
    }

    pub fn summaries(&self, filter: &SummaryFilter) -> Vec<ConversationSummary> {
        self.cache.summaries(filter)
    }

    pub fn summary(&self, conversation_id: &ConversationId) -> Option<ConversationSummary> {
        self.cache.summary(conversation_id)
    }
}

#[cfg(test)]
#[path = "tests/cache_tests.rs"]
mod tests;
