use std::{
    pin::Pin,
    sync::{
        atomic::AtomicBool,
        Arc, Mutex as StdMutex,
    },
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use shared::{
    domain::{Channel, ConversationId, DeliveryStatus, MessageId, TenantId},
    protocol::{
        ChangeKind, ConnectionStatus, ConversationSummary, MessageDraft, MessageRecord,
        RecordChange, RecordTable, SubscriptionScope, SummaryFilter,
    },
};
use storage::PendingSend;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{info, warn};

pub mod cache;
pub mod config;
pub mod connectivity;
mod outbox;
mod reconcile;
pub mod router;
pub mod transport;

pub use cache::{CacheReader, ThreadCache};
pub use config::{load_config, EngineConfig};
pub use connectivity::ConnectivityMonitor;
pub use outbox::{OutboxStore, RetryPolicy};
pub use reconcile::ReconcileOutcome;
pub use router::{RealtimeRouter, ScopeBatch};

/// Page size for the foreground fetch when a conversation view opens. This
/// fetch is also what closes any event gap left by a realtime disconnect.
const OPEN_FETCH_LIMIT: u32 = 100;

/// Stream of raw row-change notifications for one subscription scope.
pub type ChangeStream = Pin<Box<dyn Stream<Item = RecordChange> + Send>>;

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn list_messages(
        &self,
        conversation_id: &ConversationId,
        limit: u32,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<MessageRecord>>;
    /// Creates the authoritative record; the backend assigns the real id and
    /// timestamp.
    async fn create_message(&self, payload: &PendingSend) -> Result<MessageRecord>;
    async fn update_message_status(
        &self,
        id: &MessageId,
        status: DeliveryStatus,
        error: Option<&str>,
    ) -> Result<()>;
    async fn list_conversations(
        &self,
        tenant_id: &TenantId,
        filter: &SummaryFilter,
    ) -> Result<Vec<ConversationSummary>>;
}

pub struct MissingRecordStore;

#[async_trait]
impl RecordStore for MissingRecordStore {
    async fn list_messages(
        &self,
        conversation_id: &ConversationId,
        _limit: u32,
        _before: Option<DateTime<Utc>>,
    ) -> Result<Vec<MessageRecord>> {
        Err(anyhow!(
            "record store unavailable for conversation {conversation_id}"
        ))
    }

    async fn create_message(&self, payload: &PendingSend) -> Result<MessageRecord> {
        Err(anyhow!(
            "record store unavailable for conversation {}",
            payload.conversation_id
        ))
    }

    async fn update_message_status(
        &self,
        id: &MessageId,
        _status: DeliveryStatus,
        _error: Option<&str>,
    ) -> Result<()> {
        Err(anyhow!("record store unavailable for message {id}"))
    }

    async fn list_conversations(
        &self,
        tenant_id: &TenantId,
        _filter: &SummaryFilter,
    ) -> Result<Vec<ConversationSummary>> {
        Err(anyhow!("record store unavailable for tenant {tenant_id}"))
    }
}

/// Outward delivery to the external channel (e.g. WhatsApp). Independent of
/// record creation: both completion events feed the reconciler separately.
#[async_trait]
pub trait DeliveryGateway: Send + Sync {
    async fn deliver(
        &self,
        message_id: &MessageId,
        conversation_id: &ConversationId,
        channel: Channel,
    ) -> Result<()>;
}

pub struct MissingDeliveryGateway;

#[async_trait]
impl DeliveryGateway for MissingDeliveryGateway {
    async fn deliver(
        &self,
        message_id: &MessageId,
        _conversation_id: &ConversationId,
        _channel: Channel,
    ) -> Result<()> {
        Err(anyhow!("delivery gateway unavailable for message {message_id}"))
    }
}

#[async_trait]
pub trait PushEventSource: Send + Sync {
    /// Opens a change stream for one scope. Delivery is at-least-once and
    /// gaps are possible across reconnects; the engine compensates with the
    /// foreground fetch on conversation open.
    async fn subscribe(&self, scope: SubscriptionScope) -> Result<ChangeStream>;
}

pub struct MissingPushEventSource;

#[async_trait]
impl PushEventSource for MissingPushEventSource {
    async fn subscribe(&self, scope: SubscriptionScope) -> Result<ChangeStream> {
        Err(anyhow!("push event source unavailable for scope {scope:?}"))
    }
}

#[derive(Debug, Clone)]
pub enum EngineEvent {
    MessagesChanged {
        conversation_id: ConversationId,
    },
    SummariesChanged,
    MessageFailed {
        conversation_id: ConversationId,
        message_id: MessageId,
        error: String,
    },
    ConnectivityChanged {
        online: bool,
    },
    RealtimeStatusChanged {
        status: ConnectionStatus,
    },
}

struct EngineState {
    tenant_id: Option<TenantId>,
    dispatch_rx: Option<mpsc::UnboundedReceiver<ScopeBatch>>,
    started: bool,
}

/// The synchronization engine: single owner of the local thread cache, fed
/// by the optimistic writer, the outbox drain and the realtime router. UI
/// surfaces read snapshots and observe events; they never mutate the cache.
pub struct SyncEngine {
    record_store: Arc<dyn RecordStore>,
    gateway: Arc<dyn DeliveryGateway>,
    outbox: Arc<dyn OutboxStore>,
    cache: Arc<ThreadCache>,
    router: RealtimeRouter,
    connectivity: ConnectivityMonitor,
    events: broadcast::Sender<EngineEvent>,
    drain_active: AtomicBool,
    config: EngineConfig,
    inner: StdMutex<EngineState>,
}

impl SyncEngine {
    pub fn new(
        config: EngineConfig,
        record_store: Arc<dyn RecordStore>,
        gateway: Arc<dyn DeliveryGateway>,
        outbox: Arc<dyn OutboxStore>,
        push_source: Arc<dyn PushEventSource>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(config.event_channel_capacity);
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let router = RealtimeRouter::new(
            push_source,
            dispatch_tx,
            config.tenant_debounce(),
            config.conversation_debounce(),
        );
        Arc::new(Self {
            record_store,
            gateway,
            outbox,
            cache: Arc::new(ThreadCache::new()),
            router,
            connectivity: ConnectivityMonitor::new(true),
            events,
            drain_active: AtomicBool::new(false),
            config,
            inner: StdMutex::new(EngineState {
                tenant_id: None,
                dispatch_rx: Some(dispatch_rx),
                started: false,
            }),
        })
    }

    /// Brings the engine online for one tenant session: recovers interrupted
    /// outbox entries, loads the summary list, subscribes the tenant scope
    /// and wires the background loops. Subscription failures are non-fatal;
    /// the engine keeps operating local-first.
    pub async fn start(self: &Arc<Self>, tenant_id: TenantId) -> Result<()> {
        let dispatch_rx = {
            let mut inner = self.inner.lock().expect("engine state poisoned");
            if inner.started {
                return Ok(());
            }
            inner.started = true;
            inner.tenant_id = Some(tenant_id.clone());
            inner.dispatch_rx.take()
        };

        if let Some(rx) = dispatch_rx {
            self.spawn_apply_loop(rx);
        }
        self.spawn_connectivity_watcher();
        self.spawn_status_watcher();

        let recovered = self.outbox.recover_interrupted().await?;
        if recovered > 0 {
            info!(recovered, "outbox: reset interrupted entries to queued");
        }

        match self
            .record_store
            .list_conversations(&tenant_id, &SummaryFilter::default())
            .await
        {
            Ok(summaries) => {
                let mut changed = false;
                for summary in summaries {
                    changed |= self.cache.upsert_summary(summary);
                }
                if changed {
                    self.emit(EngineEvent::SummariesChanged);
                }
            }
            Err(err) => {
                warn!(tenant_id = %tenant_id, "summary load failed; continuing local-first: {err}")
            }
        }

        if let Err(err) = self
            .router
            .subscribe(SubscriptionScope::Tenant(tenant_id.clone()))
            .await
        {
            warn!(tenant_id = %tenant_id, "tenant subscription failed; continuing local-first: {err}");
        }

        if self.connectivity.is_online() {
            self.spawn_drain();
        }

        Ok(())
    }

    /// Optimistic write followed by a durable enqueue. The provisional
    /// message is visible in the cache before this returns; the durable
    /// write completes before the message counts as handed to the outbox.
    pub async fn send_message(
        self: &Arc<Self>,
        conversation_id: &ConversationId,
        draft: MessageDraft,
    ) -> Result<MessageRecord> {
        let (provisional, summary_changed) = self.cache.append_provisional(conversation_id, &draft);
        self.emit(EngineEvent::MessagesChanged {
            conversation_id: conversation_id.clone(),
        });
        if summary_changed {
            self.emit(EngineEvent::SummariesChanged);
        }

        let channel = self
            .cache
            .channel_for(conversation_id)
            .unwrap_or(Channel::Whatsapp);
        let payload = PendingSend {
            provisional_id: provisional.id.clone(),
            conversation_id: conversation_id.clone(),
            sender_type: draft.sender_type,
            content: draft.content,
            content_type: draft.content_type,
            attachment: draft.attachment,
            channel,
        };

        let queue_id = shared::domain::QueueId::generate();
        if let Err(err) = self.outbox.enqueue(&queue_id, &payload).await {
            let error = format!("could not persist send request: {err}");
            self.cache.set_status(
                conversation_id,
                &provisional.id,
                DeliveryStatus::Failed,
                Some(error.clone()),
            );
            self.emit(EngineEvent::MessageFailed {
                conversation_id: conversation_id.clone(),
                message_id: provisional.id.clone(),
                error,
            });
            return Err(err);
        }

        if self.connectivity.is_online() {
            self.spawn_drain();
        }

        Ok(provisional)
    }

    /// Fetches recent history and merges it through the reconciler, then
    /// subscribes the conversation-scoped channel. The merge is what closes
    /// any realtime event gap for this thread.
    pub async fn open_conversation(self: &Arc<Self>, conversation_id: &ConversationId) -> Result<()> {
        match self
            .record_store
            .list_messages(conversation_id, OPEN_FETCH_LIMIT, None)
            .await
        {
            Ok(messages) => {
                if self.cache.merge_fetched(conversation_id, messages) {
                    self.emit(EngineEvent::MessagesChanged {
                        conversation_id: conversation_id.clone(),
                    });
                    self.emit(EngineEvent::SummariesChanged);
                }
            }
            Err(err) => {
                warn!(conversation_id = %conversation_id, "history fetch failed; rendering cached thread: {err}")
            }
        }

        if let Err(err) = self
            .router
            .subscribe(SubscriptionScope::Conversation(conversation_id.clone()))
            .await
        {
            warn!(conversation_id = %conversation_id, "conversation subscription failed; continuing local-first: {err}");
        }
        Ok(())
    }

    /// Tears down only the view's subscription. Outstanding outbox entries
    /// keep draining regardless of which conversation is on screen.
    pub async fn close_conversation(&self, conversation_id: &ConversationId) {
        self.router
            .unsubscribe(&SubscriptionScope::Conversation(conversation_id.clone()))
            .await;
    }

    pub fn messages(&self, conversation_id: &ConversationId) -> Vec<MessageRecord> {
        self.cache.messages(conversation_id)
    }

    pub fn conversation_summaries(&self, filter: &SummaryFilter) -> Vec<ConversationSummary> {
        self.cache.summaries(filter)
    }

    /// Read-only cache handle for UI surfaces.
    pub fn reader(&self) -> CacheReader {
        CacheReader::new(Arc::clone(&self.cache))
    }

    pub fn realtime_status(&self) -> ConnectionStatus {
        self.router.status()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.router.subscribe_status()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn mark_conversation_read(&self, conversation_id: &ConversationId) {
        if self.cache.mark_read(conversation_id) {
            self.emit(EngineEvent::SummariesChanged);
        }
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    pub fn set_online(&self, online: bool) {
        self.connectivity.set_online(online);
    }

    pub(crate) fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    fn spawn_apply_loop(self: &Arc<Self>, mut rx: mpsc::UnboundedReceiver<ScopeBatch>) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            while let Some((scope, changes)) = rx.recv().await {
                engine.apply_changes(&scope, changes);
            }
        });
    }

    fn spawn_connectivity_watcher(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        let mut rx = self.connectivity.subscribe();
        tokio::spawn(async move {
            let mut was_online = *rx.borrow();
            while rx.changed().await.is_ok() {
                let online = *rx.borrow();
                engine.emit(EngineEvent::ConnectivityChanged { online });
                if online && !was_online {
                    info!("connectivity: back online; draining outbox");
                    engine.spawn_drain();
                }
                was_online = online;
            }
        });
    }

    fn spawn_status_watcher(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        let mut rx = self.router.subscribe_status();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let status = *rx.borrow();
                engine.emit(EngineEvent::RealtimeStatusChanged { status });
            }
        });
    }

    /// Applies one debounced batch of row changes. Message changes go to the
    /// reconciler; conversation changes to the summary updater, filtered to
    /// the active tenant.
    fn apply_changes(&self, scope: &SubscriptionScope, changes: Vec<RecordChange>) {
        let tenant_id = {
            let inner = self.inner.lock().expect("engine state poisoned");
            inner.tenant_id.clone()
        };

        let mut changed_conversations = Vec::new();
        let mut summaries_changed = false;

        for change in changes {
            match change.table {
                RecordTable::Messages => {
                    let Some(message) = change.message() else {
                        warn!(scope = ?scope, "dropping undecodable message change event");
                        continue;
                    };
                    let conversation_id = message.conversation_id.clone();
                    let outcome = match change.change {
                        ChangeKind::Delete => {
                            if self.cache.remove_message(&conversation_id, &message.id) {
                                ReconcileOutcome::Patched
                            } else {
                                ReconcileOutcome::Unchanged
                            }
                        }
                        _ => self.cache.reconcile_message(&conversation_id, message),
                    };
                    if outcome != ReconcileOutcome::Unchanged {
                        if !changed_conversations.contains(&conversation_id) {
                            changed_conversations.push(conversation_id);
                        }
                        summaries_changed = true;
                    }
                }
                RecordTable::Conversations => {
                    let Some(summary) = change.conversation() else {
                        warn!(scope = ?scope, "dropping undecodable conversation change event");
                        continue;
                    };
                    if let Some(tenant_id) = &tenant_id {
                        if &summary.tenant_id != tenant_id {
                            continue;
                        }
                    }
                    match change.change {
                        ChangeKind::Delete => {
                            summaries_changed |= self.cache.remove_summary(&summary.id);
                        }
                        _ => summaries_changed |= self.cache.upsert_summary(summary),
                    }
                }
            }
        }

        for conversation_id in changed_conversations {
            self.emit(EngineEvent::MessagesChanged { conversation_id });
        }
        if summaries_changed {
            self.emit(EngineEvent::SummariesChanged);
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
