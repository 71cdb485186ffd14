use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use tokio::sync::mpsc;

/// Execution state reported by the kernel on the iopub channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelStatus {
    Starting,
    Busy,
    Idle,
    Other(String),
}

impl KernelStatus {
    pub fn from_state(state: &str) -> Self {
        match state {
            "starting" => Self::Starting,
            "busy" => Self::Busy,
            "idle" => Self::Idle,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for KernelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => f.write_str("starting"),
            Self::Busy => f.write_str("busy"),
            Self::Idle => f.write_str("idle"),
            Self::Other(state) => f.write_str(state),
        }
    }
}

pub type SubscriptionId = u64;

/// Receiving end of a status subscription.
pub struct StatusSubscription {
    id: SubscriptionId,
    receiver: mpsc::UnboundedReceiver<KernelStatus>,
}

impl StatusSubscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Waits for the next status change. `None` once unsubscribed or the
    /// client is gone.
    pub async fn recv(&mut self) -> Option<KernelStatus> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<KernelStatus> {
        self.receiver.try_recv().ok()
    }
}

/// Fan-out of status changes to any number of subscribers.
#[derive(Clone, Default)]
pub struct StatusListeners {
    next_id: Arc<AtomicU64>,
    senders: Arc<Mutex<HashMap<SubscriptionId, mpsc::UnboundedSender<KernelStatus>>>>,
}

impl StatusListeners {
    pub fn subscribe(&self) -> StatusSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        if let Ok(mut senders) = self.senders.lock() {
            senders.insert(id, sender);
        }

        StatusSubscription { id, receiver }
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.senders
            .lock()
            .map(|mut senders| senders.remove(&id).is_some())
            .unwrap_or(false)
    }

    pub fn notify(&self, status: &KernelStatus) {
        if let Ok(mut senders) = self.senders.lock() {
            // Dropped subscriptions are pruned here.
            senders.retain(|_, sender| sender.send(status.clone()).is_ok());
        }
    }

    pub fn len(&self) -> usize {
        self.senders.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
