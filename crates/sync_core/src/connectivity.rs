use tokio::sync::watch;

/// Tracks online/offline transitions fed by the host (browser events, OS
/// network callbacks). Purely event-driven; nothing polls.
pub struct ConnectivityMonitor {
    online: watch::Sender<bool>,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (online, _) = watch::channel(initially_online);
        Self { online }
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    /// Flips the state; observers only wake on actual transitions.
    pub fn set_online(&self, online: bool) {
        self.online.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }
}
