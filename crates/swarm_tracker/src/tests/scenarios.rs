use std::{collections::HashSet, time::Duration};

use super::test_util::{TestSwarm, addr, drain, make_descriptor, peer, setup_test_logging};
use crate::{
    Error, FailureReason, NotificationKind, TrackerOptions, TransferOutcome, TransferState,
    scheduler::ScheduledPiece,
};

#[test]
fn test_single_holder_single_request() {
    setup_test_logging();
    let mut seen = HashSet::new();
    for seed in 0..32 {
        let s = TestSwarm::new(2, Default::default(), seed);
        s.join(1, &[0, 1]).unwrap();
        s.join(2, &[]).unwrap();
        let got = s.request(2, 1).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].source, peer(1));
        assert!(got[0].piece == 0 || got[0].piece == 1);
        seen.insert(got[0].piece);
        s.swarm().assert_consistent();
    }
    assert_eq!(seen.len(), 2, "tie-break should pick both pieces across seeds");
}

#[test]
fn test_source_departs_mid_transfer() {
    setup_test_logging();
    let s = TestSwarm::new(2, Default::default(), 1);
    s.join(1, &[0, 1]).unwrap();
    s.join(2, &[]).unwrap();
    let got = s.request(2, 1).unwrap();
    let piece = got[0].piece;
    s.ack(2, piece, true).unwrap();
    assert_eq!(s.swarm().stats().open_sessions, 1);

    s.leave(1).unwrap();
    s.swarm().assert_consistent();

    let stats = s.swarm().stats();
    assert_eq!(stats.open_sessions, 0);
    assert_eq!(stats.failed_transfers, 1);
    assert_eq!(stats.unavailable_pieces, 2);
    assert!(matches!(
        s.report_ok(2, piece),
        Err(Error::UnknownSession { .. })
    ));
    assert!(s.request(2, 2).unwrap().is_empty());
}

#[test]
fn test_completion_notified_once() {
    setup_test_logging();
    let s = TestSwarm::new(2, Default::default(), 7);
    let mut rx = s.tracker.subscribe();
    s.join(1, &[0, 1]).unwrap();
    s.join(2, &[]).unwrap();

    for ScheduledPiece { piece, source } in s.request(2, 2).unwrap() {
        assert_eq!(source, peer(1));
        s.ack(2, piece, true).unwrap();
        let report = s.report_ok(2, piece).unwrap();
        assert_eq!(report.state, TransferState::Verified);
        assert_eq!(report.outcome, TransferOutcome::Verified);
    }
    // Re-announcing pieces it already has changes nothing.
    s.heartbeat(2, &[0, 1]).unwrap();

    let progress: Vec<u32> = drain(&mut rx)
        .into_iter()
        .filter_map(|n| match n {
            NotificationKind::ProgressChanged { peer: p, percent } if p == peer(2) => Some(percent),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![0, 50, 100]);

    let snap = s.swarm().snapshot(&peer(2), s.now).unwrap();
    assert!(snap.is_complete());
    assert_eq!(snap.left_bytes, 0);
    assert_eq!(snap.downloaded_bytes, 32);
    assert_eq!(s.swarm().snapshot(&peer(1), s.now).unwrap().uploaded_bytes, 32);
    assert_eq!(s.swarm().stats().seeders, 2);
}

#[test]
fn test_peers_changed_is_deduplicated() {
    let s = TestSwarm::new(2, Default::default(), 0);
    let mut rx = s.tracker.subscribe();
    s.join(1, &[]).unwrap();
    s.join(2, &[]).unwrap();
    s.heartbeat(1, &[]).unwrap();
    s.heartbeat(2, &[0]).unwrap();
    s.leave(1).unwrap();

    let peers: Vec<Vec<_>> = drain(&mut rx)
        .into_iter()
        .filter_map(|n| match n {
            NotificationKind::PeersChanged { peers } => Some(peers),
            _ => None,
        })
        .collect();
    let mut both = vec![peer(1), peer(2)];
    both.sort();
    assert_eq!(peers, vec![vec![peer(1)], both, vec![peer(2)]]);
}

#[test]
fn test_empty_heartbeat_only_refreshes_last_seen() {
    let mut s = TestSwarm::new(2, Default::default(), 0);
    s.join(1, &[0]).unwrap();
    let before = s.swarm().snapshot(&peer(1), s.now).unwrap();
    let stats_before = s.swarm().stats();
    let mut rx = s.tracker.subscribe();

    s.advance(Duration::from_secs(100));
    s.heartbeat(1, &[]).unwrap();
    assert!(drain(&mut rx).is_empty());
    assert_eq!(s.swarm().snapshot(&peer(1), s.now).unwrap(), before);
    assert_eq!(s.swarm().stats(), stats_before);

    // The refreshed last-seen keeps the peer active past the original timeout.
    s.advance(Duration::from_secs(30));
    s.tracker.sweep_all(s.now);
    assert_eq!(s.swarm().stats().active, 1);
}

#[test]
fn test_deadline_sweep_releases_source() {
    let options = TrackerOptions {
        max_fan_out: 1,
        ..Default::default()
    };
    let request_timeout = options.request_timeout;
    let mut s = TestSwarm::new(2, options, 3);
    s.join(1, &[0, 1]).unwrap();
    s.join(2, &[]).unwrap();
    let got = s.request(2, 2).unwrap();
    // Fan-out 1: a single source can serve one piece at a time.
    assert_eq!(got.len(), 1);

    s.advance(request_timeout - Duration::from_secs(1));
    assert!(s.tracker.sweep_all(s.now).is_empty());
    assert_eq!(s.swarm().stats().open_sessions, 1);

    s.advance(Duration::from_secs(1));
    let reports = s.tracker.sweep_all(s.now);
    assert_eq!(reports[&s.content_id()].expired, 1);
    assert_eq!(s.swarm().stats().open_sessions, 0);
    s.swarm().assert_consistent();

    assert!(matches!(
        s.report_ok(2, got[0].piece),
        Err(Error::UnknownSession { .. })
    ));
    assert_eq!(s.request(2, 2).unwrap().len(), 1);
}

#[test]
fn test_accept_extends_deadline() {
    let options = TrackerOptions::default();
    let (request_timeout, transfer_timeout) = (options.request_timeout, options.transfer_timeout);
    let mut s = TestSwarm::new(1, options, 3);
    s.join(1, &[0]).unwrap();
    s.join(2, &[]).unwrap();
    s.request(2, 1).unwrap();
    s.ack(2, 0, true).unwrap();
    let open = s.swarm().open_sessions();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].state, TransferState::InFlight);
    assert_eq!(open[0].deadline, s.now + transfer_timeout);

    s.advance(request_timeout);
    s.tracker.sweep_all(s.now);
    assert_eq!(s.swarm().stats().open_sessions, 1);

    s.advance(transfer_timeout);
    s.tracker.sweep_all(s.now);
    assert_eq!(s.swarm().stats().open_sessions, 0);
}

#[test]
fn test_bad_results_fail_the_session() {
    let s = TestSwarm::new(2, Default::default(), 5);
    s.join(1, &[0, 1]).unwrap();
    s.join(2, &[]).unwrap();
    s.request(2, 2).unwrap();

    let r = s.report(2, 0, true, 15, None).unwrap();
    assert_eq!(
        r.state,
        TransferState::Failed(FailureReason::LengthMismatch {
            expected: 16,
            actual: 15
        })
    );
    assert_eq!(r.outcome, TransferOutcome::Retry);

    s.ack(2, 1, false).unwrap();
    assert!(matches!(
        s.report_ok(2, 1),
        Err(Error::UnknownSession { .. })
    ));

    let snap = s.swarm().snapshot(&peer(2), s.now).unwrap();
    assert_eq!(snap.pieces_complete, 0);
    let stats = s.swarm().stats();
    assert_eq!(stats.failed_transfers, 2);
    assert_eq!(stats.completed_transfers, 0);
}

#[test]
fn test_retries_then_unobtainable() {
    let options = TrackerOptions {
        max_attempts: 2,
        ..Default::default()
    };
    let s = TestSwarm::new(1, options, 11);
    s.join(1, &[0]).unwrap();
    s.join(2, &[0]).unwrap();
    s.join(3, &[]).unwrap();
    let wrong = Some(super::test_util::piece_hash(42));

    let first = s.request(3, 1).unwrap()[0].source;
    let r = s.report(3, 0, true, 16, wrong).unwrap();
    assert_eq!(r.state, TransferState::Failed(FailureReason::HashMismatch));
    assert_eq!((r.attempt, r.outcome), (1, TransferOutcome::Retry));

    // The failed source is avoided while the other holder is eligible.
    let second = s.request(3, 1).unwrap()[0].source;
    assert_ne!(first, second);
    let r = s.report(3, 0, false, 0, None).unwrap();
    assert_eq!((r.attempt, r.outcome), (2, TransferOutcome::Unobtainable));

    // The next pass starts over.
    assert_eq!(s.request(3, 1).unwrap().len(), 1);
    let r = s.report_ok(3, 0).unwrap();
    assert_eq!((r.attempt, r.outcome), (1, TransferOutcome::Verified));
}

#[test]
fn test_result_before_ack_implies_acceptance() {
    let s = TestSwarm::new(1, Default::default(), 0);
    s.join(1, &[0]).unwrap();
    s.join(2, &[]).unwrap();
    s.request(2, 1).unwrap();
    assert_eq!(s.report_ok(2, 0).unwrap().state, TransferState::Verified);
}

#[test]
fn test_short_last_piece() {
    let s = TestSwarm::with_descriptor(make_descriptor(2, 40, 16), Default::default(), 0);
    s.join(1, &[0, 1, 2]).unwrap();
    s.join(2, &[0, 1]).unwrap();
    assert_eq!(s.swarm().snapshot(&peer(2), s.now).unwrap().left_bytes, 8);
    assert_eq!(s.request(2, 5).unwrap().len(), 1);
    assert!(matches!(
        s.report(2, 2, true, 16, None).unwrap().state,
        TransferState::Failed(FailureReason::LengthMismatch { expected: 8, .. })
    ));
    s.request(2, 1).unwrap();
    assert_eq!(s.report_ok(2, 2).unwrap().state, TransferState::Verified);
}

#[test]
fn test_stale_peer_is_not_a_source_until_it_heartbeats() {
    let options = TrackerOptions::default();
    let timeout = options.heartbeat_timeout;
    let grace = options.departure_grace;
    let mut s = TestSwarm::new(1, options, 0);
    s.join(1, &[0]).unwrap();
    s.join(2, &[]).unwrap();

    s.advance(timeout / 2);
    s.heartbeat(2, &[]).unwrap();
    s.advance(timeout / 2 + Duration::from_secs(1));
    let reports = s.tracker.sweep_all(s.now);
    assert_eq!(reports[&s.content_id()].stale, vec![peer(1)]);
    s.swarm().assert_consistent();

    assert!(s.request(2, 1).unwrap().is_empty());
    let stats = s.swarm().stats();
    assert_eq!((stats.active, stats.stale), (1, 1));
    assert!(s.swarm().peer_list(&peer(2), 10).unwrap().is_empty());

    s.heartbeat(1, &[]).unwrap();
    s.swarm().assert_consistent();
    assert_eq!(s.request(2, 1).unwrap()[0].source, peer(1));

    // Nobody heartbeats any more: both end up departed, the swarm goes idle.
    s.advance(timeout + grace + Duration::from_secs(1));
    let reports = s.tracker.sweep_all(s.now);
    assert_eq!(reports[&s.content_id()].departed.len(), 2);
    assert_eq!(s.swarm().stats().open_sessions, 0);
}

#[test]
fn test_speed_changes_and_decays() {
    let mut s = TestSwarm::new(1, Default::default(), 0);
    s.join(1, &[0]).unwrap();
    s.join(2, &[]).unwrap();
    let mut rx = s.tracker.subscribe();
    s.request(2, 1).unwrap();
    s.report_ok(2, 0).unwrap();

    let speeds = |events: Vec<NotificationKind>| -> Vec<(u8, u64, u64)> {
        events
            .into_iter()
            .filter_map(|n| match n {
                NotificationKind::SpeedChanged {
                    peer: p,
                    download_bps,
                    upload_bps,
                } => Some((if p == peer(1) { 1 } else { 2 }, download_bps, upload_bps)),
                _ => None,
            })
            .collect()
    };
    // 16 bytes over the default 5 second window.
    assert_eq!(speeds(drain(&mut rx)), vec![(2, 3, 0), (1, 0, 3)]);

    s.advance(Duration::from_secs(1));
    s.tracker.sweep_all(s.now);
    assert!(speeds(drain(&mut rx)).is_empty());

    s.advance(Duration::from_secs(5));
    s.tracker.sweep_all(s.now);
    let mut decayed = speeds(drain(&mut rx));
    decayed.sort();
    assert_eq!(decayed, vec![(1, 0, 0), (2, 0, 0)]);
}

#[test]
fn test_peer_list() {
    let options = TrackerOptions {
        max_peers_in_response: 3,
        ..Default::default()
    };
    let s = TestSwarm::new(1, options, 9);
    for i in 1..=6 {
        s.join(i, &[]).unwrap();
    }
    let swarm = s.swarm();
    let list = swarm.peer_list(&peer(1), 100).unwrap();
    assert_eq!(list.len(), 3);
    assert!(list.iter().all(|e| e.peer_id != peer(1)));
    assert!(list.iter().all(|e| e.addr != addr(1)));
    assert_eq!(swarm.peer_list(&peer(1), 2).unwrap().len(), 2);
    assert!(matches!(
        swarm.peer_list(&peer(42), 2),
        Err(Error::UnknownPeer(_))
    ));
}

#[test]
fn test_invalid_piece_index() {
    let s = TestSwarm::new(2, Default::default(), 0);
    assert!(matches!(s.join(1, &[0, 2]), Err(Error::InvalidPieceIndex(2))));
    s.join(1, &[0]).unwrap();
    assert!(matches!(s.heartbeat(1, &[9]), Err(Error::InvalidPieceIndex(9))));
    assert!(matches!(s.ack(1, 5, true), Err(Error::InvalidPieceIndex(5))));
    assert!(matches!(s.join(1, &[]), Err(Error::DuplicatePeer(_))));
    assert_eq!(s.swarm().peer_count(), 1);
}

#[test]
fn test_downloader_departure_cancels_its_sessions() {
    let s = TestSwarm::new(2, Default::default(), 0);
    s.join(1, &[0, 1]).unwrap();
    s.join(2, &[]).unwrap();
    assert_eq!(s.request(2, 2).unwrap().len(), 2);
    s.leave(2).unwrap();
    let stats = s.swarm().stats();
    assert_eq!(stats.open_sessions, 0);
    assert_eq!(stats.failed_transfers, 2);
    s.swarm().assert_consistent();
}

#[test]
fn test_requests_and_reports_keep_a_downloader_alive() {
    let options = TrackerOptions {
        heartbeat_timeout: Duration::from_secs(10),
        departure_grace: Duration::from_secs(10),
        request_timeout: Duration::from_secs(60),
        transfer_timeout: Duration::from_secs(60),
        ..Default::default()
    };
    let step = Duration::from_secs(6);
    let mut s = TestSwarm::new(2, options, 4);
    s.join(1, &[0, 1]).unwrap();
    s.join(2, &[]).unwrap();

    s.advance(step);
    s.heartbeat(1, &[]).unwrap();
    let piece = s.request(2, 1).unwrap()[0].piece;
    s.ack(2, piece, true).unwrap();

    // Peer 2 never heartbeats, its request was the last sign of life.
    s.advance(step);
    s.heartbeat(1, &[]).unwrap();
    s.tracker.sweep_all(s.now);
    assert_eq!(s.swarm().stats().stale, 0);

    s.report_ok(2, piece).unwrap();
    s.advance(step);
    s.heartbeat(1, &[]).unwrap();
    s.tracker.sweep_all(s.now);
    assert_eq!(s.swarm().stats().stale, 0);

    // Both go quiet long enough to become stale, then peer 2 asks for more.
    s.advance(Duration::from_secs(11));
    s.tracker.sweep_all(s.now);
    assert_eq!(s.swarm().stats().stale, 2);
    let mut rx = s.tracker.subscribe();
    assert!(s.request(2, 1).unwrap().is_empty());
    let stats = s.swarm().stats();
    assert_eq!((stats.active, stats.stale), (1, 1));
    assert_eq!(
        drain(&mut rx),
        vec![NotificationKind::PeersChanged {
            peers: vec![peer(2)]
        }]
    );
    s.swarm().assert_consistent();
}
