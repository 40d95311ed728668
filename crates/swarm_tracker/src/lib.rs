//!
//! Tracker-side coordination of torrent-style swarms.
//!
//! The tracker keeps, per torrent, the set of live peers and the pieces they
//! hold, decides which piece a peer should fetch next and from whom (rarest
//! first), follows every piece transfer until it is verified or failed, and
//! aggregates per-peer progress and throughput.
//!
//! Transport is not part of this crate: the caller feeds already-parsed
//! [`InboundEvent`]s into a [`Tracker`] and consumes [`Notification`]s from
//! [`Tracker::subscribe`].
//!
//! # Quick usage example
//!
//! ```
//! use swarm_tracker::*;
//! use swarm_core::{Id20, TorrentDescriptor};
//!
//! let tracker = Tracker::new(TrackerOptions::default()).unwrap();
//! let descriptor =
//!     TorrentDescriptor::new(Id20::new([1; 20]), 1024, 256, vec![Id20::default(); 4]).unwrap();
//! tracker.register_torrent(descriptor).unwrap();
//!
//! let response = tracker
//!     .handle(InboundEvent::PeerJoin {
//!         content_id: Id20::new([1; 20]),
//!         peer_id: swarm_core::peer_id::generate_client_peer_id(),
//!         addr: "127.0.0.1:6881".parse().unwrap(),
//!         pieces: vec![0, 1, 2, 3],
//!     })
//!     .unwrap();
//! assert_eq!(response, Response::Ack);
//! ```

mod availability;
mod coordinator;
mod error;
mod events;
mod messages;
mod options;
mod progress;
mod registry;
mod scheduler;
mod timed_lock;
mod tracker;
mod transfer;
mod type_aliases;

#[cfg(feature = "tracing-subscriber-utils")]
pub mod tracing_subscriber_config_utils;

pub use coordinator::{PeerListEntry, SwarmStats, SweepReport, TrackerCoordinator};
pub use error::{Error, Result};
pub use events::{Notification, NotificationKind, SwarmEventBus, TrackerEventBus};
pub use messages::{InboundEvent, Response, TransferReport};
pub use options::TrackerOptions;
pub use progress::ProgressSnapshot;
pub use registry::{PeerRecord, PeerState};
pub use scheduler::ScheduledPiece;
pub use tracker::Tracker;
pub use transfer::{FailureReason, TransferOutcome, TransferSession, TransferState};
pub use type_aliases::PeerAddr;

#[cfg(test)]
mod tests;

/// The cargo version of swarm-tracker.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
