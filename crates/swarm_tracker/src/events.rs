use serde::Serialize;
use swarm_core::{Id20, PeerId};

/// Outbound notification of a single swarm.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationKind {
    PeersChanged {
        peers: Vec<PeerId>,
    },
    ProgressChanged {
        peer: PeerId,
        percent: u32,
    },
    SpeedChanged {
        peer: PeerId,
        download_bps: u64,
        upload_bps: u64,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Notification {
    pub content_id: Id20,
    #[serde(flatten)]
    pub kind: NotificationKind,
}

/// Tracker-wide bus: carries the notifications of every swarm.
#[derive(Clone, Debug)]
pub struct TrackerEventBus {
    event_tx: tokio::sync::broadcast::Sender<Notification>,
}

impl TrackerEventBus {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (event_tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { event_tx }
    }

    pub(crate) fn new_swarm_bus(&self, content_id: Id20) -> SwarmEventBus {
        let (event_tx, _) = tokio::sync::broadcast::channel(128);
        SwarmEventBus {
            content_id,
            tracker_bus: self.clone(),
            event_tx,
        }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Notification> {
        self.event_tx.subscribe()
    }
}

impl Default for TrackerEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug)]
pub struct SwarmEventBus {
    content_id: Id20,
    tracker_bus: TrackerEventBus,
    event_tx: tokio::sync::broadcast::Sender<NotificationKind>,
}

impl SwarmEventBus {
    // Sending only fails when nobody listens, which is fine.
    pub(crate) fn emit(&self, kind: NotificationKind) {
        let _ = self.event_tx.send(kind.clone());
        let _ = self.tracker_bus.event_tx.send(Notification {
            content_id: self.content_id,
            kind,
        });
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<NotificationKind> {
        self.event_tx.subscribe()
    }
}
