use shared::{
    domain::{ConversationId, DeliveryStatus, MessageId, SenderType},
    protocol::MessageRecord,
};
use tracing::debug;

use crate::cache::{sorted_insert_index, ThreadCache};

/// What a reconcile pass did to the cache. `Unchanged` means the record was
/// already applied; callers emit no events for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Inserted,
    ReplacedProvisional,
    Patched,
    Unchanged,
}

impl ThreadCache {
    /// Merges an authoritative record into the thread.
    ///
    /// Resolution order: an id match patches in place (a second identical
    /// apply is a no-op); otherwise a provisional message with the same
    /// content is replaced at its original array position — content is the
    /// only correlation key available before the backend assigns the real
    /// id, a known approximation; otherwise the record is inserted in sorted
    /// position by `created_at`.
    pub fn reconcile_message(
        &self,
        conversation_id: &ConversationId,
        authoritative: MessageRecord,
    ) -> ReconcileOutcome {
        self.reconcile_inner(conversation_id, authoritative, true)
    }

    /// Merges a page of fetched history. Unlike live events, history never
    /// counts toward unread.
    pub fn merge_fetched(
        &self,
        conversation_id: &ConversationId,
        messages: Vec<MessageRecord>,
    ) -> bool {
        let mut changed = false;
        for message in messages {
            changed |=
                self.reconcile_inner(conversation_id, message, false) != ReconcileOutcome::Unchanged;
        }
        changed
    }

    fn reconcile_inner(
        &self,
        conversation_id: &ConversationId,
        authoritative: MessageRecord,
        count_unread: bool,
    ) -> ReconcileOutcome {
        let mut state = self.inner.lock().expect("thread cache poisoned");

        let (outcome, inbound_insert) = {
            let list = state.messages.entry(conversation_id.clone()).or_default();

            if let Some(pos) = list.iter().position(|m| m.id == authoritative.id) {
                if list[pos] == authoritative {
                    return ReconcileOutcome::Unchanged;
                }
                list[pos] = authoritative;
                (ReconcileOutcome::Patched, false)
            } else if let Some(pos) = list
                .iter()
                .position(|m| m.id.is_provisional() && m.content == authoritative.content)
            {
                list[pos] = authoritative;
                (ReconcileOutcome::ReplacedProvisional, false)
            } else {
                let inbound = authoritative.sender_type == SenderType::Contact;
                let index = sorted_insert_index(list, authoritative.created_at);
                list.insert(index, authoritative);
                (ReconcileOutcome::Inserted, inbound)
            }
        };

        if inbound_insert && count_unread {
            if let Some(summary) = state.summaries.get_mut(conversation_id) {
                summary.unread_count += 1;
            }
        }
        Self::refresh_summary_tail(&mut state, conversation_id);
        outcome
    }

    /// Status-only patch, located by authoritative id. Never reorders or
    /// removes; an unknown id is a no-op.
    pub fn set_status(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        status: DeliveryStatus,
        error: Option<String>,
    ) -> bool {
        let mut state = self.inner.lock().expect("thread cache poisoned");
        let Some(list) = state.messages.get_mut(conversation_id) else {
            debug!(conversation_id = %conversation_id, "status patch for unknown conversation");
            return false;
        };
        let Some(message) = list.iter_mut().find(|m| &m.id == message_id) else {
            debug!(message_id = %message_id, "status patch for unknown message");
            return false;
        };
        if message.delivery_status == status && message.error_message == error {
            return false;
        }
        message.delivery_status = status;
        message.error_message = error;
        true
    }

    /// Removes by id and repairs the summary if the tail message went away.
    pub fn remove_message(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> bool {
        let mut state = self.inner.lock().expect("thread cache poisoned");
        let removed = match state.messages.get_mut(conversation_id) {
            Some(list) => match list.iter().position(|m| &m.id == message_id) {
                Some(pos) => {
                    list.remove(pos);
                    true
                }
                None => false,
            },
            None => false,
        };
        if removed {
            Self::refresh_summary_tail(&mut state, conversation_id);
        }
        removed
    }
}

#[cfg(test)]
#[path = "tests/reconcile_tests.rs"]
mod tests;
