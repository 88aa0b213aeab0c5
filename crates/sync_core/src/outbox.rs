use std::{
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use shared::{
    domain::{DeliveryStatus, MessageId, QueueId},
    error::ApiException,
};
use storage::{OutboxEntry, OutboxStorage, PendingSend};
use tracing::{info, warn};

use crate::{EngineEvent, ReconcileOutcome, SyncEngine};

/// Durable Local Store contract for the outbox. The production
/// implementation is the sqlite-backed [`storage::OutboxStorage`]; tests
/// substitute in-memory doubles.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    async fn enqueue(&self, queue_id: &QueueId, payload: &PendingSend) -> Result<()>;
    async fn next_queued(&self) -> Result<Option<OutboxEntry>>;
    async fn mark_sending(&self, queue_id: &QueueId) -> Result<()>;
    async fn requeue(&self, queue_id: &QueueId, last_error: &str) -> Result<()>;
    async fn mark_failed(&self, queue_id: &QueueId, last_error: &str) -> Result<()>;
    async fn attach_record_id(&self, queue_id: &QueueId, record_id: &MessageId) -> Result<()>;
    async fn remove(&self, queue_id: &QueueId) -> Result<bool>;
    async fn list_failed(&self) -> Result<Vec<OutboxEntry>>;
    async fn reset_failed(&self) -> Result<u64>;
    async fn clear_failed(&self) -> Result<u64>;
    async fn recover_interrupted(&self) -> Result<u64>;
}

#[async_trait]
impl OutboxStore for OutboxStorage {
    async fn enqueue(&self, queue_id: &QueueId, payload: &PendingSend) -> Result<()> {
        OutboxStorage::enqueue(self, queue_id, payload).await
    }

    async fn next_queued(&self) -> Result<Option<OutboxEntry>> {
        OutboxStorage::next_queued(self).await
    }

    async fn mark_sending(&self, queue_id: &QueueId) -> Result<()> {
        OutboxStorage::mark_sending(self, queue_id).await
    }

    async fn requeue(&self, queue_id: &QueueId, last_error: &str) -> Result<()> {
        OutboxStorage::requeue(self, queue_id, last_error).await
    }

    async fn mark_failed(&self, queue_id: &QueueId, last_error: &str) -> Result<()> {
        OutboxStorage::mark_failed(self, queue_id, last_error).await
    }

    async fn attach_record_id(&self, queue_id: &QueueId, record_id: &MessageId) -> Result<()> {
        OutboxStorage::attach_record_id(self, queue_id, record_id).await
    }

    async fn remove(&self, queue_id: &QueueId) -> Result<bool> {
        OutboxStorage::remove(self, queue_id).await
    }

    async fn list_failed(&self) -> Result<Vec<OutboxEntry>> {
        OutboxStorage::list_failed(self).await
    }

    async fn reset_failed(&self) -> Result<u64> {
        OutboxStorage::reset_failed(self).await
    }

    async fn clear_failed(&self) -> Result<u64> {
        OutboxStorage::clear_failed(self).await
    }

    async fn recover_interrupted(&self) -> Result<u64> {
        OutboxStorage::recover_interrupted(self).await
    }
}

/// Bounded-retry policy for the drain loop.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
}

impl RetryPolicy {
    /// Exponential backoff before each attempt beyond the first:
    /// `initial_delay * 2^(retry_count - 1)`.
    pub fn backoff_delay(&self, retry_count: u32) -> Option<Duration> {
        if retry_count == 0 {
            return None;
        }
        Some(self.initial_delay * 2u32.saturating_pow(retry_count - 1))
    }
}

fn visible_message_id(entry: &OutboxEntry) -> MessageId {
    entry
        .record_id
        .clone()
        .unwrap_or_else(|| entry.payload.provisional_id.clone())
}

impl SyncEngine {
    pub(crate) fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.config.max_retries,
            initial_delay: Duration::from_millis(self.config.initial_retry_delay_ms),
        }
    }

    pub(crate) fn spawn_drain(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.drain_outbox().await;
        });
    }

    /// Runs one drain pass. At most one pass is active system-wide;
    /// re-entrant calls are no-ops while a pass runs, which keeps backoff
    /// bookkeeping simple and rules out duplicate sends.
    pub async fn drain_outbox(self: &Arc<Self>) {
        if self.drain_active.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.drain_pass().await {
            warn!("outbox: drain pass aborted: {err}");
        }
        self.drain_active.store(false, Ordering::SeqCst);
    }

    async fn drain_pass(&self) -> Result<()> {
        loop {
            if !self.connectivity.is_online() {
                break;
            }
            let Some(mut entry) = self.outbox.next_queued().await? else {
                break;
            };
            self.outbox.mark_sending(&entry.queue_id).await?;

            if let Some(delay) = self.retry_policy().backoff_delay(entry.retry_count) {
                tokio::time::sleep(delay).await;
            }

            match self.attempt_send(&mut entry).await {
                Ok(()) => {
                    self.outbox.remove(&entry.queue_id).await?;
                }
                Err(err) => {
                    let attempts = entry.retry_count + 1;
                    let permanent = err
                        .downcast_ref::<ApiException>()
                        .map(|e| e.is_permanent())
                        .unwrap_or(false);
                    let error_text = err.to_string();
                    if permanent || attempts >= self.retry_policy().max_retries {
                        warn!(
                            queue_id = %entry.queue_id,
                            attempts,
                            permanent,
                            "outbox: send failed terminally: {error_text}"
                        );
                        self.fail_entry(&entry, &error_text).await?;
                    } else {
                        info!(
                            queue_id = %entry.queue_id,
                            attempts,
                            "outbox: transient send failure; requeued: {error_text}"
                        );
                        self.outbox.requeue(&entry.queue_id, &error_text).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// One attempt. Record creation and outward delivery are separate
    /// completion events: the authoritative id is durably attached as soon
    /// as the record exists, so a retry after a gateway failure re-delivers
    /// instead of creating a duplicate record.
    async fn attempt_send(&self, entry: &mut OutboxEntry) -> Result<()> {
        let conversation_id = entry.payload.conversation_id.clone();
        let record_id = match entry.record_id.clone() {
            Some(id) => id,
            None => {
                let record = self.record_store.create_message(&entry.payload).await?;
                let record_id = record.id.clone();
                self.outbox
                    .attach_record_id(&entry.queue_id, &record_id)
                    .await?;
                entry.record_id = Some(record_id.clone());
                let outcome = self.cache.reconcile_message(&conversation_id, record);
                if outcome != ReconcileOutcome::Unchanged {
                    self.emit(EngineEvent::MessagesChanged {
                        conversation_id: conversation_id.clone(),
                    });
                    self.emit(EngineEvent::SummariesChanged);
                }
                record_id
            }
        };

        self.gateway
            .deliver(&record_id, &conversation_id, entry.payload.channel)
            .await?;

        if self
            .cache
            .set_status(&conversation_id, &record_id, DeliveryStatus::Delivered, None)
        {
            self.emit(EngineEvent::MessagesChanged {
                conversation_id: conversation_id.clone(),
            });
        }
        if let Err(err) = self
            .record_store
            .update_message_status(&record_id, DeliveryStatus::Delivered, None)
            .await
        {
            warn!(message_id = %record_id, "outbox: delivered-status propagation failed: {err}");
        }
        Ok(())
    }

    /// Terminal failure: durable `failed` mark first, then the cache patch
    /// so the UI shows the badge and the error text. Never silent.
    async fn fail_entry(&self, entry: &OutboxEntry, error_text: &str) -> Result<()> {
        self.outbox.mark_failed(&entry.queue_id, error_text).await?;
        let conversation_id = entry.payload.conversation_id.clone();
        let message_id = visible_message_id(entry);
        if self.cache.set_status(
            &conversation_id,
            &message_id,
            DeliveryStatus::Failed,
            Some(error_text.to_string()),
        ) {
            self.emit(EngineEvent::MessagesChanged {
                conversation_id: conversation_id.clone(),
            });
        }
        self.emit(EngineEvent::MessageFailed {
            conversation_id,
            message_id: message_id.clone(),
            error: error_text.to_string(),
        });
        if let Some(record_id) = &entry.record_id {
            if let Err(err) = self
                .record_store
                .update_message_status(record_id, DeliveryStatus::Failed, Some(error_text))
                .await
            {
                warn!(message_id = %record_id, "outbox: failed-status propagation failed: {err}");
            }
        }
        Ok(())
    }

    /// Manual control: puts every failed entry back in the queue with a
    /// fresh retry budget and kicks a drain.
    pub async fn retry_failed_messages(self: &Arc<Self>) -> Result<()> {
        let failed = self.outbox.list_failed().await?;
        if failed.is_empty() {
            return Ok(());
        }
        self.outbox.reset_failed().await?;
        for entry in &failed {
            let message_id = visible_message_id(entry);
            if self.cache.set_status(
                &entry.payload.conversation_id,
                &message_id,
                DeliveryStatus::Sending,
                None,
            ) {
                self.emit(EngineEvent::MessagesChanged {
                    conversation_id: entry.payload.conversation_id.clone(),
                });
            }
        }
        if self.connectivity.is_online() {
            self.spawn_drain();
        }
        Ok(())
    }

    /// Manual control: discards failed entries without sending. A failed
    /// entry that never produced a record leaves a dead provisional message
    /// behind; it is discarded with the entry.
    pub async fn clear_failed_messages(&self) -> Result<()> {
        let failed = self.outbox.list_failed().await?;
        if failed.is_empty() {
            return Ok(());
        }
        self.outbox.clear_failed().await?;
        for entry in &failed {
            if entry.record_id.is_none()
                && self
                    .cache
                    .remove_message(&entry.payload.conversation_id, &entry.payload.provisional_id)
            {
                self.emit(EngineEvent::MessagesChanged {
                    conversation_id: entry.payload.conversation_id.clone(),
                });
                self.emit(EngineEvent::SummariesChanged);
            }
        }
        Ok(())
    }
}
