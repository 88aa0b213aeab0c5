use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use anyhow::Result;
use futures::StreamExt;
use shared::protocol::{ConnectionStatus, RecordChange, SubscriptionScope};
use tokio::{
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
};
use tracing::info;

use crate::{ChangeStream, PushEventSource};

/// One debounced flush: the scope it belongs to plus the coalesced changes.
pub type ScopeBatch = (SubscriptionScope, Vec<RecordChange>);

/// Maintains at most one live push subscription per scope, debounces event
/// bursts per scope and forwards coalesced batches to the engine's apply
/// loop.
pub struct RealtimeRouter {
    source: Arc<dyn PushEventSource>,
    subscriptions: Mutex<HashMap<SubscriptionScope, ScopeSubscription>>,
    dispatch: mpsc::UnboundedSender<ScopeBatch>,
    status: Arc<watch::Sender<ConnectionStatus>>,
    tenant_debounce: Duration,
    conversation_debounce: Duration,
}

struct ScopeSubscription {
    reader_task: JoinHandle<()>,
    debounce: Arc<DebounceState>,
}

impl ScopeSubscription {
    fn abort_all(&self) {
        self.reader_task.abort();
        if let Some(flush) = self
            .debounce
            .flush_task
            .lock()
            .expect("debounce timer poisoned")
            .take()
        {
            flush.abort();
        }
    }
}

/// Per-scope debounce: a shared buffer and the single pending flush timer.
/// Retriggering replaces the timer instead of stacking a second one.
#[derive(Default)]
struct DebounceState {
    buffer: StdMutex<Vec<RecordChange>>,
    flush_task: StdMutex<Option<JoinHandle<()>>>,
}

impl RealtimeRouter {
    pub fn new(
        source: Arc<dyn PushEventSource>,
        dispatch: mpsc::UnboundedSender<ScopeBatch>,
        tenant_debounce: Duration,
        conversation_debounce: Duration,
    ) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Initializing);
        Self {
            source,
            subscriptions: Mutex::new(HashMap::new()),
            dispatch,
            status: Arc::new(status),
            tenant_debounce,
            conversation_debounce,
        }
    }

    /// Opens the scope's subscription. Idempotent: a live subscription for
    /// the same key makes this a no-op; a subscription whose stream already
    /// ended is rebuilt.
    pub async fn subscribe(&self, scope: SubscriptionScope) -> Result<()> {
        let mut subs = self.subscriptions.lock().await;
        if let Some(existing) = subs.get(&scope) {
            if !existing.reader_task.is_finished() {
                return Ok(());
            }
        }

        self.set_status(ConnectionStatus::Connecting);
        let stream = match self.source.subscribe(scope.clone()).await {
            Ok(stream) => stream,
            Err(err) => {
                self.set_status(ConnectionStatus::Error);
                return Err(err);
            }
        };

        let debounce = Arc::new(DebounceState::default());
        let reader_task = self.spawn_reader(scope.clone(), stream, Arc::clone(&debounce));
        if let Some(previous) = subs.insert(
            scope,
            ScopeSubscription {
                reader_task,
                debounce,
            },
        ) {
            previous.abort_all();
        }
        self.set_status(ConnectionStatus::Connected);
        Ok(())
    }

    /// Mandatory on scope teardown; otherwise rapid navigation would stack
    /// duplicate handlers for the same conversation.
    pub async fn unsubscribe(&self, scope: &SubscriptionScope) {
        let removed = self.subscriptions.lock().await.remove(scope);
        if let Some(subscription) = removed {
            subscription.abort_all();
            info!(scope = ?scope, "realtime: subscription torn down");
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    fn set_status(&self, status: ConnectionStatus) {
        set_status(&self.status, status);
    }

    fn debounce_window(&self, scope: &SubscriptionScope) -> Duration {
        match scope {
            SubscriptionScope::Tenant(_) => self.tenant_debounce,
            SubscriptionScope::Conversation(_) => self.conversation_debounce,
        }
    }

    fn spawn_reader(
        &self,
        scope: SubscriptionScope,
        mut stream: ChangeStream,
        debounce: Arc<DebounceState>,
    ) -> JoinHandle<()> {
        let dispatch = self.dispatch.clone();
        let status = Arc::clone(&self.status);
        let window = self.debounce_window(&scope);
        tokio::spawn(async move {
            while let Some(change) = stream.next().await {
                debounce
                    .buffer
                    .lock()
                    .expect("debounce buffer poisoned")
                    .push(change);

                let flush = spawn_flush_timer(
                    window,
                    scope.clone(),
                    Arc::clone(&debounce),
                    dispatch.clone(),
                );
                let previous = debounce
                    .flush_task
                    .lock()
                    .expect("debounce timer poisoned")
                    .replace(flush);
                if let Some(previous) = previous {
                    previous.abort();
                }
            }
            info!(scope = ?scope, "realtime: event stream ended");
            set_status(&status, ConnectionStatus::Disconnected);
        })
    }
}

fn spawn_flush_timer(
    window: Duration,
    scope: SubscriptionScope,
    debounce: Arc<DebounceState>,
    dispatch: mpsc::UnboundedSender<ScopeBatch>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(window).await;
        let batch = std::mem::take(
            &mut *debounce
                .buffer
                .lock()
                .expect("debounce buffer poisoned"),
        );
        if !batch.is_empty() {
            let _ = dispatch.send((scope, batch));
        }
    })
}

fn set_status(sender: &watch::Sender<ConnectionStatus>, status: ConnectionStatus) {
    sender.send_if_modified(|current| {
        if *current == status {
            false
        } else {
            *current = status;
            true
        }
    });
}

#[cfg(test)]
#[path = "tests/router_tests.rs"]
mod tests;
