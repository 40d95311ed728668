use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use clap::Parser;
use rand::{Rng, RngCore, SeedableRng, rngs::StdRng};
use size_format::SizeFormatterBinary as SF;
use swarm_core::{Id20, PeerId, TorrentDescriptor, peer_id::generate_client_peer_id};
use swarm_tracker::{
    Error, InboundEvent, NotificationKind, Response, Tracker, TrackerOptions, TransferOutcome,
};
use tracing::{Instrument, debug, error_span, info, trace_span, warn};

#[derive(Parser)]
pub struct SimulateOpts {
    /// Number of peers, including the single seeder.
    #[arg(long, default_value_t = 8)]
    peers: u8,

    #[arg(long, default_value_t = 64)]
    pieces: u32,

    /// Piece size in bytes. The last piece is half as big.
    #[arg(long = "piece-size", default_value_t = 256 * 1024)]
    piece_size: u32,

    /// Pieces requested per round.
    #[arg(long, default_value_t = 4)]
    batch: usize,

    /// Pause between rounds of a peer, e.g. 50ms.
    #[arg(long = "round-interval", value_parser = parse_duration::parse, default_value = "50ms")]
    round_interval: Duration,

    /// Probability that a transfer reports corrupted data.
    #[arg(long = "failure-rate", default_value_t = 0.05)]
    failure_rate: f64,

    /// Probability that a source refuses a request.
    #[arg(long = "reject-rate", default_value_t = 0.02)]
    reject_rate: f64,

    /// Probability that a leecher goes silent for good at some round.
    #[arg(long = "churn", default_value_t = 0.0)]
    churn: f64,

    /// Makes scheduling and peer behaviour reproducible.
    #[arg(long)]
    seed: Option<u64>,

    /// Give up after this long, e.g. 30s.
    #[arg(long, value_parser = parse_duration::parse, default_value = "60s")]
    duration: Duration,
}

fn make_descriptor(
    opts: &SimulateOpts,
    rng: &mut StdRng,
) -> anyhow::Result<Arc<TorrentDescriptor>> {
    let mut content_id = [0u8; 20];
    rng.fill_bytes(&mut content_id);
    let hashes = (0..opts.pieces)
        .map(|_| {
            let mut h = [0u8; 20];
            rng.fill_bytes(&mut h);
            Id20::new(h)
        })
        .collect();
    let total_size =
        opts.piece_size as u64 * (opts.pieces as u64 - 1) + (opts.piece_size as u64 / 2).max(1);
    TorrentDescriptor::new(Id20::new(content_id), total_size, opts.piece_size, hashes)
        .context("error building the simulated torrent")
}

struct SimPeer {
    peer_id: PeerId,
    addr: SocketAddr,
    seeder: bool,
    rng: StdRng,
}

enum PeerEnd {
    Completed,
    WentSilent,
}

async fn run_peer(
    tracker: Arc<Tracker>,
    descriptor: Arc<TorrentDescriptor>,
    mut peer: SimPeer,
    opts: Arc<SimulateOptsShared>,
) -> anyhow::Result<PeerEnd> {
    let content_id = descriptor.content_id();
    let pieces = if peer.seeder {
        (0..descriptor.piece_count()).collect()
    } else {
        Vec::new()
    };
    tracker.handle(InboundEvent::PeerJoin {
        content_id,
        peer_id: peer.peer_id,
        addr: peer.addr,
        pieces,
    })?;
    let swarm = tracker
        .swarm(&content_id)
        .context("swarm vanished right after joining")?;

    let mut interval = tokio::time::interval(opts.round_interval);
    loop {
        interval.tick().await;

        if !peer.seeder && peer.rng.random_bool(opts.churn) {
            debug!("going silent");
            return Ok(PeerEnd::WentSilent);
        }

        tracker.handle(InboundEvent::Heartbeat {
            content_id,
            peer_id: peer.peer_id,
            delta: vec![],
        })?;
        if peer.seeder {
            continue;
        }

        let scheduled = match tracker.handle(InboundEvent::RequestPieces {
            content_id,
            peer_id: peer.peer_id,
            count: opts.batch,
        })? {
            Response::Scheduled { pieces } => pieces,
            other => anyhow::bail!("unexpected response to a piece request: {other:?}"),
        };

        for s in scheduled {
            let accepted = !peer.rng.random_bool(opts.reject_rate);
            let ack = tracker.handle(InboundEvent::PieceRequestResult {
                content_id,
                downloader: peer.peer_id,
                piece: s.piece,
                accepted,
            });
            match ack {
                Ok(_) => {}
                // The source departed or the deadline passed meanwhile.
                Err(Error::UnknownSession { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
            if !accepted {
                continue;
            }

            let piece = descriptor
                .validate_piece_index(s.piece)
                .context("tracker scheduled an invalid piece")?;
            let corrupted = peer.rng.random_bool(opts.failure_rate);
            let hash = if corrupted {
                Id20::new([0xff; 20])
            } else {
                descriptor.piece_hash(piece)
            };
            match tracker.handle(InboundEvent::ReportPieceResult {
                content_id,
                downloader: peer.peer_id,
                piece: s.piece,
                success: true,
                byte_count: descriptor.piece_length(piece) as u64,
                hash: Some(hash),
            }) {
                Ok(Response::Transfer(report)) => {
                    if report.outcome == TransferOutcome::Unobtainable {
                        warn!(piece = s.piece, "piece unobtainable for now");
                    }
                }
                Ok(_) | Err(Error::UnknownSession { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let snapshot = swarm.snapshot(&peer.peer_id, std::time::Instant::now())?;
        if snapshot.is_complete() {
            info!(
                downloaded = %SF::new(snapshot.downloaded_bytes),
                "download complete"
            );
            return Ok(PeerEnd::Completed);
        }
    }
}

// The parts of SimulateOpts the peer tasks need.
struct SimulateOptsShared {
    round_interval: Duration,
    batch: usize,
    failure_rate: f64,
    reject_rate: f64,
    churn: f64,
}

pub async fn run(options: TrackerOptions, opts: &SimulateOpts) -> anyhow::Result<()> {
    if opts.peers < 2 {
        anyhow::bail!("need at least 2 peers: a seeder and a leecher");
    }
    if opts.pieces == 0 {
        anyhow::bail!("need at least one piece");
    }
    for (name, p) in [
        ("failure-rate", opts.failure_rate),
        ("reject-rate", opts.reject_rate),
        ("churn", opts.churn),
    ] {
        if !(0.0..=1.0).contains(&p) {
            anyhow::bail!("{name} must be within [0, 1], got {p}");
        }
    }

    let mut rng = match opts.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };
    let tracker = Arc::new(match opts.seed {
        Some(seed) => Tracker::with_rng_seed(options, seed)?,
        None => Tracker::new(options)?,
    });
    let descriptor = make_descriptor(opts, &mut rng)?;
    let content_id = descriptor.content_id();
    tracker.register_torrent(descriptor.clone())?;
    info!(
        %content_id,
        pieces = descriptor.piece_count(),
        size = %SF::new(descriptor.total_size()),
        peers = opts.peers,
        "simulating swarm"
    );

    let mut notifications = tracker.subscribe();
    let printer = tokio::spawn(
        async move {
            loop {
                match notifications.recv().await {
                    Ok(n) => match n.kind {
                        NotificationKind::ProgressChanged { peer, percent } => {
                            if percent % 25 == 0 {
                                info!(peer = %peer.short(), percent, "progress");
                            }
                        }
                        NotificationKind::PeersChanged { peers } => {
                            info!(active = peers.len(), "peers changed")
                        }
                        NotificationKind::SpeedChanged {
                            peer,
                            download_bps,
                            upload_bps,
                        } => debug!(
                            peer = %peer.short(),
                            down = %SF::new(download_bps),
                            up = %SF::new(upload_bps),
                            "speed"
                        ),
                    },
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        debug!(skipped = n, "notification printer lagged")
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
        }
        .instrument(trace_span!("notifications")),
    );

    let shared = Arc::new(SimulateOptsShared {
        round_interval: opts.round_interval,
        batch: opts.batch,
        failure_rate: opts.failure_rate,
        reject_rate: opts.reject_rate,
        churn: opts.churn,
    });

    let mut leechers = Vec::new();
    let mut seeder = None;
    for i in 0..opts.peers {
        let peer = SimPeer {
            peer_id: generate_client_peer_id(),
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 6881 + i as u16),
            seeder: i == 0,
            rng: StdRng::seed_from_u64(rng.next_u64()),
        };
        let span = error_span!("peer", idx = i, id = %peer.peer_id.short());
        let fut =
            run_peer(tracker.clone(), descriptor.clone(), peer, shared.clone()).instrument(span);
        if i == 0 {
            seeder = Some(tokio::spawn(fut));
        } else {
            leechers.push(fut);
        }
    }

    let results = tokio::time::timeout(opts.duration, futures::future::join_all(leechers)).await;
    let (mut completed, mut silent, mut errored) = (0, 0, 0);
    match results {
        Ok(results) => {
            for r in results {
                match r {
                    Ok(PeerEnd::Completed) => completed += 1,
                    Ok(PeerEnd::WentSilent) => silent += 1,
                    Err(e) => {
                        warn!("peer failed: {e:#}");
                        errored += 1
                    }
                }
            }
        }
        Err(_) => warn!(duration = ?opts.duration, "simulation timed out"),
    }

    if let Some(seeder) = seeder {
        seeder.abort();
    }
    if let Some(swarm) = tracker.swarm(&content_id) {
        let stats = swarm.stats();
        info!(
            completed,
            silent,
            errored,
            stats = %serde_json::to_string(&stats)?,
            "simulation finished"
        );
    }
    printer.abort();
    Ok(())
}
