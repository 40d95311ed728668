use std::{
    collections::HashMap,
    sync::{Arc, Weak},
    time::Instant,
};

use anyhow::Context;
use parking_lot::{RwLock, RwLockWriteGuard};
use swarm_core::{
    Id20, TorrentDescriptor, rate_window::RateWindow, spawn_utils::spawn_with_cancel,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error_span, info, trace};

use crate::{
    Error,
    coordinator::{SweepReport, TrackerCoordinator},
    events::{Notification, TrackerEventBus},
    messages::{InboundEvent, Response},
    options::TrackerOptions,
};

struct TrackerShared {
    options: Arc<TrackerOptions>,
    // Cloned into every new swarm's progress aggregator.
    empty_rate_window: RateWindow,
    descriptors: RwLock<HashMap<Id20, Arc<TorrentDescriptor>>>,
    // Lock order: `swarms` first, then the swarm's own lock.
    swarms: RwLock<HashMap<Id20, Arc<TrackerCoordinator>>>,
    bus: TrackerEventBus,
    rng_seed: Option<u64>,
    cancellation_token: CancellationToken,
}

impl TrackerShared {
    fn swarm_seed(&self, content_id: &Id20) -> Option<u64> {
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&content_id.0[..8]);
        self.rng_seed.map(|s| s ^ u64::from_be_bytes(prefix))
    }

    /// Removes the swarm if it is still idle. Called without any lock held.
    fn remove_if_idle(&self, content_id: &Id20, now: Instant) -> bool {
        let mut swarms = self.swarms.write();
        let idle = swarms.get(content_id).is_some_and(|s| s.is_idle(now));
        if idle {
            swarms.remove(content_id);
            info!(content_id = %content_id.short(), "dropped idle swarm");
        }
        idle
    }
}

/// Multi-torrent entry point. Owns one [`TrackerCoordinator`] per swarm and
/// routes inbound events to it by content id.
///
/// A swarm is created on the first join of a registered torrent and dropped
/// once it has been empty for `idle_swarm_grace`. When created inside a tokio
/// runtime, every swarm gets a background task running its periodic sweep;
/// otherwise [`Tracker::sweep_all`] has to be called by the owner.
pub struct Tracker {
    shared: Arc<TrackerShared>,
}

impl Tracker {
    pub fn new(options: TrackerOptions) -> anyhow::Result<Self> {
        Self::new_inner(options, None)
    }

    /// Deterministic scheduling and peer-list sampling, for tests and simulations.
    pub fn with_rng_seed(options: TrackerOptions, seed: u64) -> anyhow::Result<Self> {
        Self::new_inner(options, Some(seed))
    }

    fn new_inner(options: TrackerOptions, rng_seed: Option<u64>) -> anyhow::Result<Self> {
        options.validate().context("invalid tracker options")?;
        let empty_rate_window = RateWindow::new(options.rate_window)?;
        Ok(Self {
            shared: Arc::new(TrackerShared {
                options: Arc::new(options),
                empty_rate_window,
                descriptors: Default::default(),
                swarms: Default::default(),
                bus: TrackerEventBus::new(),
                rng_seed,
                cancellation_token: CancellationToken::new(),
            }),
        })
    }

    pub fn options(&self) -> &TrackerOptions {
        &self.shared.options
    }

    /// Registering the same descriptor twice is a no-op.
    pub fn register_torrent(&self, descriptor: Arc<TorrentDescriptor>) -> crate::Result<()> {
        use std::collections::hash_map::Entry;
        let content_id = descriptor.content_id();
        match self.shared.descriptors.write().entry(content_id) {
            Entry::Occupied(occ) => {
                if **occ.get() != *descriptor {
                    return Err(Error::DescriptorConflict(content_id));
                }
            }
            Entry::Vacant(vac) => {
                info!(
                    content_id = %content_id.short(),
                    pieces = descriptor.piece_count(),
                    total_size = descriptor.total_size(),
                    "registered torrent"
                );
                vac.insert(descriptor);
            }
        }
        Ok(())
    }

    pub fn descriptor(&self, content_id: &Id20) -> Option<Arc<TorrentDescriptor>> {
        self.shared.descriptors.read().get(content_id).cloned()
    }

    pub fn swarm(&self, content_id: &Id20) -> Option<Arc<TrackerCoordinator>> {
        self.shared.swarms.read().get(content_id).cloned()
    }

    pub fn swarm_count(&self) -> usize {
        self.shared.swarms.read().len()
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Notification> {
        self.shared.bus.subscribe()
    }

    pub fn handle(&self, event: InboundEvent) -> crate::Result<Response> {
        self.handle_at(event, Instant::now())
    }

    /// Routes `event` to its swarm. The swarm map stays read-locked while the
    /// event is applied, so an idle swarm can't be dropped under a join.
    pub fn handle_at(&self, event: InboundEvent, now: Instant) -> crate::Result<Response> {
        let content_id = event.content_id();
        trace!(content_id = %content_id.short(), event = event.name(), "handling");
        {
            let swarms = self.shared.swarms.read();
            if let Some(swarm) = swarms.get(&content_id) {
                return swarm.handle(event, now);
            }
        }

        let descriptor = self
            .descriptor(&content_id)
            .ok_or(Error::UnknownTorrent(content_id))?;
        if !matches!(event, InboundEvent::PeerJoin { .. }) {
            // Nobody joined this torrent yet.
            return Err(Error::UnknownPeer(event.peer_id()));
        }

        let mut swarms = self.shared.swarms.write();
        let swarm = swarms
            .entry(content_id)
            .or_insert_with(|| self.create_swarm(descriptor))
            .clone();
        let _swarms = RwLockWriteGuard::downgrade(swarms);
        swarm.handle(event, now)
    }

    fn create_swarm(&self, descriptor: Arc<TorrentDescriptor>) -> Arc<TrackerCoordinator> {
        let content_id = descriptor.content_id();
        let swarm = Arc::new(TrackerCoordinator::new(
            descriptor,
            self.shared.options.clone(),
            self.shared.empty_rate_window.clone(),
            self.shared.bus.new_swarm_bus(content_id),
            self.shared.swarm_seed(&content_id),
        ));
        debug!(content_id = %content_id.short(), "created swarm");
        if tokio::runtime::Handle::try_current().is_ok() {
            self.spawn_sweeper(&swarm);
        } else {
            trace!(
                content_id = %content_id.short(),
                "no runtime, swarm won't be swept in the background"
            );
        }
        swarm
    }

    fn spawn_sweeper(&self, swarm: &Arc<TrackerCoordinator>) {
        let content_id = swarm.content_id();
        let interval = self.shared.options.sweep_interval;
        let shared = Arc::downgrade(&self.shared);
        let swarm = Arc::downgrade(swarm);
        spawn_with_cancel(
            error_span!(parent: None, "swarm", content_id = %content_id.short()),
            "sweeper",
            self.shared.cancellation_token.child_token(),
            sweeper(shared, swarm, content_id, interval),
        );
    }

    /// Sweeps every swarm once and drops the idle ones.
    pub fn sweep_all(&self, now: Instant) -> HashMap<Id20, SweepReport> {
        let swarms: Vec<Arc<TrackerCoordinator>> =
            self.shared.swarms.read().values().cloned().collect();
        let mut reports = HashMap::new();
        for swarm in swarms {
            let report = swarm.sweep(now);
            if swarm.is_idle(now) {
                self.shared.remove_if_idle(&swarm.content_id(), now);
            }
            if !report.is_empty() {
                reports.insert(swarm.content_id(), report);
            }
        }
        reports
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        self.shared.cancellation_token.cancel();
    }
}

async fn sweeper(
    shared: Weak<TrackerShared>,
    swarm: Weak<TrackerCoordinator>,
    content_id: Id20,
    interval: std::time::Duration,
) -> anyhow::Result<()> {
    let mut interval = tokio::time::interval(interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let now = Instant::now();
        {
            let swarm = match swarm.upgrade() {
                Some(swarm) => swarm,
                None => return Ok(()),
            };
            let report = swarm.sweep(now);
            if !report.is_empty() {
                debug!(
                    stale = report.stale.len(),
                    departed = report.departed.len(),
                    expired = report.expired,
                    "sweep"
                );
            }
            if !swarm.is_idle(now) {
                continue;
            }
        }
        let shared = shared.upgrade().context("tracker is dead")?;
        if shared.remove_if_idle(&content_id, now) {
            return Ok(());
        }
    }
}
