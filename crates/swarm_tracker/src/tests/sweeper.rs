use std::time::Duration;

use super::test_util::{addr, make_descriptor, peer, setup_test_logging};
use crate::{InboundEvent, NotificationKind, Tracker, TrackerOptions};

#[tokio::test]
async fn test_background_sweep_evicts_silent_peers() {
    setup_test_logging();
    let options = TrackerOptions {
        heartbeat_timeout: Duration::from_millis(50),
        departure_grace: Duration::from_millis(50),
        sweep_interval: Duration::from_millis(10),
        idle_swarm_grace: Duration::from_millis(50),
        ..Default::default()
    };
    let tracker = Tracker::with_rng_seed(options, 0).unwrap();
    let descriptor = make_descriptor(3, 64, 16);
    let content_id = descriptor.content_id();
    tracker.register_torrent(descriptor).unwrap();
    let mut rx = tracker.subscribe();

    tracker
        .handle(InboundEvent::PeerJoin {
            content_id,
            peer_id: peer(1),
            addr: addr(1),
            pieces: vec![0, 1],
        })
        .unwrap();

    let emptied = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let n = rx.recv().await.unwrap();
            if let NotificationKind::PeersChanged { peers } = n.kind {
                if peers.is_empty() {
                    return;
                }
            }
        }
    })
    .await;
    assert!(emptied.is_ok(), "silent peer was never swept");

    tokio::time::timeout(Duration::from_secs(5), async {
        while tracker.swarm_count() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("idle swarm was never dropped");
    assert!(tracker.descriptor(&content_id).is_some());
}
