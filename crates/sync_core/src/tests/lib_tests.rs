use super::*;
use anyhow::anyhow;
use async_trait::async_trait;
use shared::{
    domain::{
        Channel, ContactId, ContentType, ConversationState, ConversationStatus, QueueId,
        SenderType,
    },
    error::{ApiException, ErrorCode},
    protocol::ContactRef,
};
use std::{
    sync::Mutex as TestMutex,
    time::Duration,
};
use storage::{OutboxEntry, OutboxStatus};
use tokio_stream::wrappers::ReceiverStream;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

struct MockRecordStore {
    create_calls: TestMutex<Vec<PendingSend>>,
    fail_creates_with: TestMutex<Option<String>>,
    permanent_reject: TestMutex<bool>,
    next_id: TestMutex<u32>,
    status_updates: TestMutex<Vec<(MessageId, DeliveryStatus, Option<String>)>>,
    listed_messages: TestMutex<Vec<MessageRecord>>,
    listed_summaries: TestMutex<Vec<ConversationSummary>>,
}

impl MockRecordStore {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            create_calls: TestMutex::new(Vec::new()),
            fail_creates_with: TestMutex::new(None),
            permanent_reject: TestMutex::new(false),
            next_id: TestMutex::new(100),
            status_updates: TestMutex::new(Vec::new()),
            listed_messages: TestMutex::new(Vec::new()),
            listed_summaries: TestMutex::new(Vec::new()),
        })
    }

    fn fail_creates(&self, error: &str) {
        *self.fail_creates_with.lock().expect("mock") = Some(error.to_string());
    }

    fn succeed_creates(&self) {
        *self.fail_creates_with.lock().expect("mock") = None;
    }

    fn create_count(&self) -> usize {
        self.create_calls.lock().expect("mock").len()
    }
}

#[async_trait]
impl RecordStore for MockRecordStore {
    async fn list_messages(
        &self,
        _conversation_id: &ConversationId,
        _limit: u32,
        _before: Option<DateTime<Utc>>,
    ) -> Result<Vec<MessageRecord>> {
        Ok(self.listed_messages.lock().expect("mock").clone())
    }

    async fn create_message(&self, payload: &PendingSend) -> Result<MessageRecord> {
        self.create_calls.lock().expect("mock").push(payload.clone());
        if *self.permanent_reject.lock().expect("mock") {
            return Err(ApiException::new(ErrorCode::Validation, "payload rejected").into());
        }
        if let Some(error) = self.fail_creates_with.lock().expect("mock").clone() {
            return Err(anyhow!(error));
        }
        let id = {
            let mut next = self.next_id.lock().expect("mock");
            let id = *next;
            *next += 1;
            id
        };
        Ok(MessageRecord {
            id: MessageId::new(format!("m-{id}")),
            conversation_id: payload.conversation_id.clone(),
            sender_type: payload.sender_type,
            content: payload.content.clone(),
            content_type: payload.content_type,
            attachment: payload.attachment.clone(),
            delivery_status: DeliveryStatus::Sent,
            created_at: Utc::now(),
            error_message: None,
        })
    }

    async fn update_message_status(
        &self,
        id: &MessageId,
        status: DeliveryStatus,
        error: Option<&str>,
    ) -> Result<()> {
        self.status_updates.lock().expect("mock").push((
            id.clone(),
            status,
            error.map(str::to_string),
        ));
        Ok(())
    }

    async fn list_conversations(
        &self,
        _tenant_id: &TenantId,
        _filter: &SummaryFilter,
    ) -> Result<Vec<ConversationSummary>> {
        Ok(self.listed_summaries.lock().expect("mock").clone())
    }
}

struct MockGateway {
    deliver_calls: TestMutex<Vec<MessageId>>,
    fail_times: TestMutex<u32>,
}

impl MockGateway {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            deliver_calls: TestMutex::new(Vec::new()),
            fail_times: TestMutex::new(0),
        })
    }

    fn fail_next(&self, times: u32) {
        *self.fail_times.lock().expect("mock") = times;
    }

    fn deliver_count(&self) -> usize {
        self.deliver_calls.lock().expect("mock").len()
    }
}

#[async_trait]
impl DeliveryGateway for MockGateway {
    async fn deliver(
        &self,
        message_id: &MessageId,
        _conversation_id: &ConversationId,
        _channel: Channel,
    ) -> Result<()> {
        self.deliver_calls.lock().expect("mock").push(message_id.clone());
        let mut fail_times = self.fail_times.lock().expect("mock");
        if *fail_times > 0 {
            *fail_times -= 1;
            return Err(anyhow!("gateway timeout"));
        }
        Ok(())
    }
}

struct MemoryOutbox {
    entries: TestMutex<Vec<OutboxEntry>>,
}

impl MemoryOutbox {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: TestMutex::new(Vec::new()),
        })
    }

    fn seed(&self, entry: OutboxEntry) {
        self.entries.lock().expect("mock").push(entry);
    }

    fn len(&self) -> usize {
        self.entries.lock().expect("mock").len()
    }

    fn failed_len(&self) -> usize {
        self.entries
            .lock()
            .expect("mock")
            .iter()
            .filter(|e| e.status == OutboxStatus::Failed)
            .count()
    }

    fn first(&self) -> Option<OutboxEntry> {
        self.entries.lock().expect("mock").first().cloned()
    }
}

#[async_trait]
impl OutboxStore for MemoryOutbox {
    async fn enqueue(&self, queue_id: &QueueId, payload: &PendingSend) -> Result<()> {
        self.entries.lock().expect("mock").push(OutboxEntry {
            queue_id: queue_id.clone(),
            conversation_id: payload.conversation_id.clone(),
            payload: payload.clone(),
            record_id: None,
            status: OutboxStatus::Queued,
            retry_count: 0,
            queued_at: Utc::now(),
            last_error: None,
        });
        Ok(())
    }

    async fn next_queued(&self) -> Result<Option<OutboxEntry>> {
        Ok(self
            .entries
            .lock()
            .expect("mock")
            .iter()
            .find(|e| e.status == OutboxStatus::Queued)
            .cloned())
    }

    async fn mark_sending(&self, queue_id: &QueueId) -> Result<()> {
        let mut entries = self.entries.lock().expect("mock");
        if let Some(entry) = entries.iter_mut().find(|e| &e.queue_id == queue_id) {
            entry.status = OutboxStatus::Sending;
        }
        Ok(())
    }

    async fn requeue(&self, queue_id: &QueueId, last_error: &str) -> Result<()> {
        let mut entries = self.entries.lock().expect("mock");
        if let Some(entry) = entries.iter_mut().find(|e| &e.queue_id == queue_id) {
            entry.status = OutboxStatus::Queued;
            entry.retry_count += 1;
            entry.last_error = Some(last_error.to_string());
        }
        Ok(())
    }

    async fn mark_failed(&self, queue_id: &QueueId, last_error: &str) -> Result<()> {
        let mut entries = self.entries.lock().expect("mock");
        if let Some(entry) = entries.iter_mut().find(|e| &e.queue_id == queue_id) {
            entry.status = OutboxStatus::Failed;
            entry.retry_count += 1;
            entry.last_error = Some(last_error.to_string());
        }
        Ok(())
    }

    async fn attach_record_id(&self, queue_id: &QueueId, record_id: &MessageId) -> Result<()> {
        let mut entries = self.entries.lock().expect("mock");
        if let Some(entry) = entries.iter_mut().find(|e| &e.queue_id == queue_id) {
            entry.record_id = Some(record_id.clone());
        }
        Ok(())
    }

    async fn remove(&self, queue_id: &QueueId) -> Result<bool> {
        let mut entries = self.entries.lock().expect("mock");
        let before = entries.len();
        entries.retain(|e| &e.queue_id != queue_id);
        Ok(entries.len() < before)
    }

    async fn list_failed(&self) -> Result<Vec<OutboxEntry>> {
        Ok(self
            .entries
            .lock()
            .expect("mock")
            .iter()
            .filter(|e| e.status == OutboxStatus::Failed)
            .cloned()
            .collect())
    }

    async fn reset_failed(&self) -> Result<u64> {
        let mut entries = self.entries.lock().expect("mock");
        let mut reset = 0;
        for entry in entries.iter_mut() {
            if entry.status == OutboxStatus::Failed {
                entry.status = OutboxStatus::Queued;
                entry.retry_count = 0;
                entry.last_error = None;
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn clear_failed(&self) -> Result<u64> {
        let mut entries = self.entries.lock().expect("mock");
        let before = entries.len();
        entries.retain(|e| e.status != OutboxStatus::Failed);
        Ok((before - entries.len()) as u64)
    }

    async fn recover_interrupted(&self) -> Result<u64> {
        let mut entries = self.entries.lock().expect("mock");
        let mut recovered = 0;
        for entry in entries.iter_mut() {
            if entry.status == OutboxStatus::Sending {
                entry.status = OutboxStatus::Queued;
                recovered += 1;
            }
        }
        Ok(recovered)
    }
}

struct MockPushSource {
    subscribe_calls: TestMutex<Vec<SubscriptionScope>>,
    senders: TestMutex<Vec<(SubscriptionScope, tokio::sync::mpsc::Sender<RecordChange>)>>,
}

impl MockPushSource {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            subscribe_calls: TestMutex::new(Vec::new()),
            senders: TestMutex::new(Vec::new()),
        })
    }

    fn push(&self, scope: &SubscriptionScope, change: RecordChange) {
        let senders = self.senders.lock().expect("mock");
        let (_, sender) = senders
            .iter()
            .rev()
            .find(|(s, _)| s == scope)
            .expect("no subscription for scope");
        sender.try_send(change).expect("push change");
    }
}

#[async_trait]
impl PushEventSource for MockPushSource {
    async fn subscribe(&self, scope: SubscriptionScope) -> Result<ChangeStream> {
        self.subscribe_calls.lock().expect("mock").push(scope.clone());
        let (tx, rx) = tokio::sync::mpsc::channel(64);
        self.senders.lock().expect("mock").push((scope, tx));
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

fn test_config() -> EngineConfig {
    EngineConfig {
        initial_retry_delay_ms: 5,
        tenant_debounce_ms: 40,
        conversation_debounce_ms: 10,
        ..EngineConfig::default()
    }
}

struct TestHarness {
    engine: Arc<SyncEngine>,
    record_store: Arc<MockRecordStore>,
    gateway: Arc<MockGateway>,
    outbox: Arc<MemoryOutbox>,
    push_source: Arc<MockPushSource>,
}

fn harness() -> TestHarness {
    init_tracing();
    let record_store = MockRecordStore::new();
    let gateway = MockGateway::new();
    let outbox = MemoryOutbox::new();
    let push_source = MockPushSource::new();
    let engine = SyncEngine::new(
        test_config(),
        record_store.clone(),
        gateway.clone(),
        outbox.clone(),
        push_source.clone(),
    );
    TestHarness {
        engine,
        record_store,
        gateway,
        outbox,
        push_source,
    }
}

fn draft(content: &str) -> MessageDraft {
    MessageDraft {
        sender_type: shared::domain::SenderType::Agent,
        content: content.to_string(),
        content_type: ContentType::Text,
        attachment: None,
    }
}

fn sample_summary(conversation: &str, tenant: &str) -> ConversationSummary {
    ConversationSummary {
        id: ConversationId::new(conversation),
        tenant_id: TenantId::new(tenant),
        contact: ContactRef {
            contact_id: ContactId::new("contact-1"),
            name: "Ada".to_string(),
            phone: Some("+5215512345678".to_string()),
        },
        channel: Channel::Whatsapp,
        status: ConversationStatus::Active,
        last_message_at: None,
        last_message_preview: None,
        unread_count: 0,
        assigned_to: None,
        tags: Vec::new(),
        state: ConversationState::Open,
    }
}

fn contact_message(id: &str, conversation: &str, content: &str, created_at: DateTime<Utc>) -> MessageRecord {
    MessageRecord {
        id: MessageId::new(id),
        conversation_id: ConversationId::new(conversation),
        sender_type: SenderType::Contact,
        content: content.to_string(),
        content_type: ContentType::Text,
        attachment: None,
        delivery_status: DeliveryStatus::Delivered,
        created_at,
        error_message: None,
    }
}

fn insert_change(message: &MessageRecord) -> RecordChange {
    RecordChange {
        change: ChangeKind::Insert,
        table: RecordTable::Messages,
        old: None,
        new: Some(serde_json::to_value(message).expect("encode message")),
    }
}

async fn wait_until(description: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if condition() {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for: {description}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn happy_path_send_is_optimistic_then_reconciles_one_authoritative_record() {
    let h = harness();
    let conversation = ConversationId::new("c-1");

    let provisional = h
        .engine
        .send_message(&conversation, draft("Hola"))
        .await
        .expect("send");

    // Visible immediately, before any network round trip completes.
    let messages = h.engine.messages(&conversation);
    assert_eq!(messages.len(), 1);
    assert!(messages[0].id.is_provisional());
    assert_eq!(messages[0].id, provisional.id);
    assert_eq!(messages[0].delivery_status, DeliveryStatus::Sending);

    let engine = h.engine.clone();
    wait_until("message delivered", move || {
        let messages = engine.messages(&conversation);
        messages.len() == 1 && messages[0].delivery_status == DeliveryStatus::Delivered
    })
    .await;

    let conversation = ConversationId::new("c-1");
    let messages = h.engine.messages(&conversation);
    assert_eq!(messages.len(), 1, "no duplicate after reconciliation");
    assert_eq!(messages[0].id, MessageId::new("m-100"));
    assert_eq!(messages[0].content, "Hola");
    assert_eq!(h.outbox.len(), 0, "entry removed on success");
    assert_eq!(h.gateway.deliver_count(), 1);
    assert!(h
        .record_store
        .status_updates
        .lock()
        .expect("mock")
        .iter()
        .any(|(id, status, _)| id == &MessageId::new("m-100")
            && *status == DeliveryStatus::Delivered));
}

#[tokio::test]
async fn offline_send_queues_without_network_and_drains_on_reconnect() {
    let h = harness();
    h.engine
        .start(TenantId::new("t-1"))
        .await
        .expect("start");
    // Let the startup drain pass finish against the empty outbox before
    // going offline.
    tokio::time::sleep(Duration::from_millis(20)).await;
    h.engine.set_online(false);

    let conversation = ConversationId::new("c-1");
    h.engine
        .send_message(&conversation, draft("Test"))
        .await
        .expect("send");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.record_store.create_count(), 0, "no network call while offline");
    assert_eq!(h.outbox.len(), 1);
    assert_eq!(
        h.outbox.first().expect("entry").status,
        OutboxStatus::Queued
    );
    assert_eq!(
        h.engine.messages(&conversation)[0].delivery_status,
        DeliveryStatus::Sending
    );

    h.engine.set_online(true);

    let engine = h.engine.clone();
    wait_until("queued entry drained after reconnect", move || {
        let messages = engine.messages(&ConversationId::new("c-1"));
        messages.len() == 1 && messages[0].delivery_status == DeliveryStatus::Delivered
    })
    .await;
    assert_eq!(h.outbox.len(), 0);
}

#[tokio::test]
async fn exhausted_retries_mark_failed_with_error_and_no_fourth_attempt() {
    let h = harness();
    h.record_store.fail_creates("connection refused");
    let conversation = ConversationId::new("c-1");

    h.engine
        .send_message(&conversation, draft("doomed"))
        .await
        .expect("send");

    let engine = h.engine.clone();
    wait_until("message marked failed", move || {
        let messages = engine.messages(&ConversationId::new("c-1"));
        messages.len() == 1 && messages[0].delivery_status == DeliveryStatus::Failed
    })
    .await;

    assert_eq!(h.record_store.create_count(), 3, "exactly max_retries attempts");
    let message = &h.engine.messages(&conversation)[0];
    assert!(message
        .error_message
        .as_deref()
        .expect("error message populated")
        .contains("connection refused"));

    let failed = h.outbox.first().expect("entry kept");
    assert_eq!(failed.status, OutboxStatus::Failed);
    assert_eq!(failed.retry_count, 3);

    // Bounded observation window: no automatic fourth attempt shows up.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.record_store.create_count(), 3);
}

#[tokio::test]
async fn permanent_backend_rejection_fails_without_burning_retries() {
    let h = harness();
    *h.record_store.permanent_reject.lock().expect("mock") = true;
    let conversation = ConversationId::new("c-1");

    h.engine
        .send_message(&conversation, draft("invalid payload"))
        .await
        .expect("send");

    let engine = h.engine.clone();
    wait_until("message marked failed", move || {
        let messages = engine.messages(&ConversationId::new("c-1"));
        messages.len() == 1 && messages[0].delivery_status == DeliveryStatus::Failed
    })
    .await;

    assert_eq!(h.record_store.create_count(), 1);
    assert_eq!(h.outbox.failed_len(), 1);
}

#[tokio::test]
async fn gateway_failure_retries_delivery_without_duplicating_the_record() {
    let h = harness();
    h.gateway.fail_next(1);
    let conversation = ConversationId::new("c-1");

    h.engine
        .send_message(&conversation, draft("two phase"))
        .await
        .expect("send");

    let engine = h.engine.clone();
    wait_until("message delivered after gateway retry", move || {
        let messages = engine.messages(&ConversationId::new("c-1"));
        messages.len() == 1 && messages[0].delivery_status == DeliveryStatus::Delivered
    })
    .await;

    assert_eq!(
        h.record_store.create_count(),
        1,
        "record created once; retry only re-delivers"
    );
    assert_eq!(h.gateway.deliver_count(), 2);
    assert_eq!(h.outbox.len(), 0);
}

#[tokio::test]
async fn retry_failed_messages_resets_entries_and_sends() {
    let h = harness();
    h.record_store.fail_creates("connection refused");
    let conversation = ConversationId::new("c-1");
    h.engine
        .send_message(&conversation, draft("second chance"))
        .await
        .expect("send");

    let engine = h.engine.clone();
    wait_until("message marked failed", move || {
        let messages = engine.messages(&ConversationId::new("c-1"));
        messages.len() == 1 && messages[0].delivery_status == DeliveryStatus::Failed
    })
    .await;

    h.record_store.succeed_creates();
    h.engine
        .retry_failed_messages()
        .await
        .expect("retry failed");

    let engine = h.engine.clone();
    wait_until("retried message delivered", move || {
        let messages = engine.messages(&ConversationId::new("c-1"));
        messages.len() == 1 && messages[0].delivery_status == DeliveryStatus::Delivered
    })
    .await;
    assert_eq!(h.outbox.len(), 0);
}

#[tokio::test]
async fn clear_failed_messages_discards_entry_and_dead_provisional() {
    let h = harness();
    h.record_store.fail_creates("connection refused");
    let conversation = ConversationId::new("c-1");
    h.engine
        .send_message(&conversation, draft("give up"))
        .await
        .expect("send");

    let engine = h.engine.clone();
    wait_until("message marked failed", move || {
        let messages = engine.messages(&ConversationId::new("c-1"));
        messages.len() == 1 && messages[0].delivery_status == DeliveryStatus::Failed
    })
    .await;

    h.engine
        .clear_failed_messages()
        .await
        .expect("clear failed");

    assert_eq!(h.outbox.len(), 0);
    assert!(h.engine.messages(&conversation).is_empty());
}

#[tokio::test]
async fn inbound_push_while_outbound_pending_keeps_thread_ordered() {
    let h = harness();
    h.engine
        .start(TenantId::new("t-1"))
        .await
        .expect("start");
    h.engine.cache.upsert_summary(sample_summary("c-1", "t-1"));
    tokio::time::sleep(Duration::from_millis(20)).await;
    h.engine.set_online(false);

    let conversation = ConversationId::new("c-1");
    let provisional = h
        .engine
        .send_message(&conversation, draft("Ping"))
        .await
        .expect("send");
    h.engine
        .open_conversation(&conversation)
        .await
        .expect("open");

    // The contact's message was created a minute earlier and must land
    // before the optimistic send regardless of arrival order.
    let scope = SubscriptionScope::Conversation(conversation.clone());
    let earlier = Utc::now() - chrono::Duration::seconds(60);
    h.push_source.push(
        &scope,
        insert_change(&contact_message("m-200", "c-1", "Hey there", earlier)),
    );

    let engine = h.engine.clone();
    wait_until("both messages present", move || {
        engine.messages(&ConversationId::new("c-1")).len() == 2
    })
    .await;

    let messages = h.engine.messages(&conversation);
    assert_eq!(messages[0].id, MessageId::new("m-200"));
    assert_eq!(messages[1].id, provisional.id);
    assert!(messages[0].created_at <= messages[1].created_at);
}

#[tokio::test]
async fn duplicate_push_events_reconcile_idempotently() {
    let h = harness();
    h.engine
        .start(TenantId::new("t-1"))
        .await
        .expect("start");
    h.engine.cache.upsert_summary(sample_summary("c-1", "t-1"));
    let conversation = ConversationId::new("c-1");
    h.engine
        .open_conversation(&conversation)
        .await
        .expect("open");

    let scope = SubscriptionScope::Conversation(conversation.clone());
    let message = contact_message("m-300", "c-1", "once only", Utc::now());
    h.push_source.push(&scope, insert_change(&message));

    let engine = h.engine.clone();
    wait_until("first event applied", move || {
        engine.messages(&ConversationId::new("c-1")).len() == 1
    })
    .await;

    let mut events = h.engine.subscribe_events();
    h.push_source.push(&scope, insert_change(&message));
    tokio::time::sleep(Duration::from_millis(80)).await;

    assert_eq!(h.engine.messages(&conversation).len(), 1);
    // The duplicate flush produced no observable cache diff, so no
    // messages-changed event either.
    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(event, EngineEvent::MessagesChanged { .. }),
            "duplicate event must not re-notify"
        );
    }
}

#[tokio::test]
async fn tenant_scope_events_patch_summaries_for_the_active_tenant_only() {
    let h = harness();
    h.engine
        .start(TenantId::new("t-1"))
        .await
        .expect("start");

    let scope = SubscriptionScope::Tenant(TenantId::new("t-1"));
    let mine = sample_summary("c-10", "t-1");
    let foreign = sample_summary("c-11", "t-2");
    for summary in [&mine, &foreign] {
        h.push_source.push(
            &scope,
            RecordChange {
                change: ChangeKind::Insert,
                table: RecordTable::Conversations,
                old: None,
                new: Some(serde_json::to_value(summary).expect("encode summary")),
            },
        );
    }

    let engine = h.engine.clone();
    wait_until("summary applied", move || {
        !engine
            .conversation_summaries(&SummaryFilter::default())
            .is_empty()
    })
    .await;

    let summaries = h.engine.conversation_summaries(&SummaryFilter::default());
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].id, ConversationId::new("c-10"));
}

#[tokio::test]
async fn inbound_contact_message_bumps_unread_until_marked_read() {
    let h = harness();
    h.engine
        .start(TenantId::new("t-1"))
        .await
        .expect("start");
    h.engine.cache.upsert_summary(sample_summary("c-1", "t-1"));
    let conversation = ConversationId::new("c-1");
    h.engine
        .open_conversation(&conversation)
        .await
        .expect("open");

    let scope = SubscriptionScope::Conversation(conversation.clone());
    h.push_source.push(
        &scope,
        insert_change(&contact_message("m-400", "c-1", "anyone there?", Utc::now())),
    );

    let engine = h.engine.clone();
    wait_until("unread bumped", move || {
        engine
            .reader()
            .summary(&ConversationId::new("c-1"))
            .map(|s| s.unread_count)
            == Some(1)
    })
    .await;

    let summary = h.engine.reader().summary(&conversation).expect("summary");
    assert_eq!(
        summary.last_message_preview.as_deref(),
        Some("anyone there?")
    );

    h.engine.mark_conversation_read(&conversation);
    assert_eq!(
        h.engine
            .reader()
            .summary(&conversation)
            .expect("summary")
            .unread_count,
        0
    );
}

#[tokio::test]
async fn start_recovers_interrupted_entries_and_drains_them() {
    let h = harness();
    let payload = PendingSend {
        provisional_id: MessageId::provisional(),
        conversation_id: ConversationId::new("c-9"),
        sender_type: SenderType::Agent,
        content: "left over from last session".to_string(),
        content_type: ContentType::Text,
        attachment: None,
        channel: Channel::Whatsapp,
    };
    h.outbox.seed(OutboxEntry {
        queue_id: QueueId::generate(),
        conversation_id: payload.conversation_id.clone(),
        payload,
        record_id: None,
        status: OutboxStatus::Sending,
        retry_count: 0,
        queued_at: Utc::now(),
        last_error: None,
    });

    h.engine
        .start(TenantId::new("t-1"))
        .await
        .expect("start");

    let outbox = h.outbox.clone();
    wait_until("recovered entry drained", move || outbox.len() == 0).await;
    assert_eq!(h.record_store.create_count(), 1);
    assert_eq!(
        h.record_store.create_calls.lock().expect("mock")[0].content,
        "left over from last session"
    );
}

#[tokio::test]
async fn enqueue_failure_surfaces_as_failed_message_not_silent_loss() {
    struct BrokenOutbox;

    #[async_trait]
    impl OutboxStore for BrokenOutbox {
        async fn enqueue(&self, _queue_id: &QueueId, _payload: &PendingSend) -> Result<()> {
            Err(anyhow!("disk full"))
        }
        async fn next_queued(&self) -> Result<Option<OutboxEntry>> {
            Ok(None)
        }
        async fn mark_sending(&self, _queue_id: &QueueId) -> Result<()> {
            Ok(())
        }
        async fn requeue(&self, _queue_id: &QueueId, _last_error: &str) -> Result<()> {
            Ok(())
        }
        async fn mark_failed(&self, _queue_id: &QueueId, _last_error: &str) -> Result<()> {
            Ok(())
        }
        async fn attach_record_id(
            &self,
            _queue_id: &QueueId,
            _record_id: &MessageId,
        ) -> Result<()> {
            Ok(())
        }
        async fn remove(&self, _queue_id: &QueueId) -> Result<bool> {
            Ok(false)
        }
        async fn list_failed(&self) -> Result<Vec<OutboxEntry>> {
            Ok(Vec::new())
        }
        async fn reset_failed(&self) -> Result<u64> {
            Ok(0)
        }
        async fn clear_failed(&self) -> Result<u64> {
            Ok(0)
        }
        async fn recover_interrupted(&self) -> Result<u64> {
            Ok(0)
        }
    }

    init_tracing();
    let engine = SyncEngine::new(
        test_config(),
        MockRecordStore::new(),
        MockGateway::new(),
        Arc::new(BrokenOutbox),
        MockPushSource::new(),
    );

    let conversation = ConversationId::new("c-1");
    let err = engine
        .send_message(&conversation, draft("lost?"))
        .await
        .expect_err("enqueue failure must propagate");
    assert!(err.to_string().contains("disk full"));

    let messages = engine.messages(&conversation);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].delivery_status, DeliveryStatus::Failed);
    assert!(messages[0]
        .error_message
        .as_deref()
        .expect("error recorded")
        .contains("could not persist"));
}
