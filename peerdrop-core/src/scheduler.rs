//! Chunk scheduler (C9, spec §4.9) — the centerpiece. Drives one download:
//! connects to the candidate peer set via the orchestrator (C5), queries
//! metadata, then dispatches chunk requests concurrently, adapting
//! parallelism and peer selection to observed throughput until the file is
//! complete or the download fails terminally.
//!
//! The teacher's own `pea-core/src/scheduler.rs` is a stub whose functions
//! are referenced from `core.rs` but never defined (`assign_chunks_to_peers_weighted`,
//! `reassign_after_peer_left`); this is grounded instead on the weighting
//! *intent* sketched in `pea-core/src/core.rs` (`worker_weights`,
//! `set_peer_metrics`) generalized into the full dispatch loop the spec
//! requires, and on the single-driver-task ownership model already used by
//! `pea-windows/src/transport.rs` for its per-connection I/O task.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::assembler::Assembler;
use crate::connection::Connection;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::orchestrator::{self, OrchestratorOptions};
use crate::peer::{PeerId, PeerStats};
use crate::registry::ConnectionRegistry;
use crate::signaling::SignalingChannel;
use crate::wire::{decode_chunk_payload, WireMessage};

/// A candidate peer and the endpoints it might be reachable at. Peer
/// discovery itself is an out-of-scope collaborator (spec §1); this is the
/// shape the scheduler needs handed in.
#[derive(Debug, Clone)]
pub struct PeerTarget {
    pub id: PeerId,
    pub endpoints: Vec<Endpoint>,
}

/// Per-peer state transition reported to [`DownloadRequest::peer_status_callback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Active,
    Inactive,
    ChunkDownloaded,
}

pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;
pub type PeerStatusCallback = Arc<dyn Fn(&PeerId, PeerState, u64) + Send + Sync>;

pub struct DownloadRequest {
    pub peers: Vec<PeerTarget>,
    pub digest: String,
    pub save_path: PathBuf,
    pub resume: bool,
    pub progress_callback: Option<ProgressCallback>,
    pub peer_status_callback: Option<PeerStatusCallback>,
}

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub min_concurrency: usize,
    pub max_concurrency: usize,
    pub bandwidth_check_interval: Duration,
    pub slow_peer_threshold: f64,
    pub chunk_timeout: Duration,
    pub metadata_timeout: Duration,
    pub orchestrator: OrchestratorOptions,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            min_concurrency: 1,
            max_concurrency: 10,
            bandwidth_check_interval: Duration::from_secs(5),
            slow_peer_threshold: 0.5,
            chunk_timeout: Duration::from_secs(15),
            metadata_timeout: Duration::from_secs(10),
            orchestrator: OrchestratorOptions::default(),
        }
    }
}

const MIB: u64 = 1024 * 1024;

/// A cooperative cancellation handle: setting it closes the file handle and
/// all connections at the next suspension point (spec §4.9 Cancellation).
#[derive(Clone)]
pub struct DownloadHandle {
    abort: Arc<AtomicBool>,
}

impl DownloadHandle {
    pub fn cancel(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }
}

struct PeerSlot {
    connection: Arc<Connection>,
    stats: PeerStats,
    endpoints: Vec<Endpoint>,
}

/// Spawn a download as a background task; returns a cancel handle and the
/// task's join handle so the caller can await the final result separately
/// from requesting cancellation.
pub fn spawn(
    req: DownloadRequest,
    registry: Arc<ConnectionRegistry>,
    signaling: Option<Arc<dyn SignalingChannel>>,
    opts: SchedulerOptions,
) -> (DownloadHandle, tokio::task::JoinHandle<Result<PathBuf>>) {
    let abort = Arc::new(AtomicBool::new(false));
    let download_handle = DownloadHandle { abort: abort.clone() };
    let join = tokio::spawn(run(req, registry, signaling, opts, abort));
    (download_handle, join)
}

async fn run(
    req: DownloadRequest,
    registry: Arc<ConnectionRegistry>,
    signaling: Option<Arc<dyn SignalingChannel>>,
    opts: SchedulerOptions,
    abort: Arc<AtomicBool>,
) -> Result<PathBuf> {
    if req.peers.is_empty() {
        return Err(Error::Validation("no peers given".into()));
    }
    if req.digest.is_empty() {
        return Err(Error::Validation("no digest given".into()));
    }
    if req.save_path.as_os_str().is_empty() {
        return Err(Error::Validation("no save path given".into()));
    }

    let peer_count = req.peers.len();
    let peer_endpoints: HashMap<PeerId, Vec<Endpoint>> = req
        .peers
        .iter()
        .map(|t| (t.id.clone(), t.endpoints.clone()))
        .collect();
    let (connect_tx, mut connect_rx) =
        tokio::sync::mpsc::unbounded_channel::<(PeerId, Result<Arc<Connection>>)>();

    for target in &req.peers {
        let tx = connect_tx.clone();
        let peer_id = target.id.clone();
        let endpoints = target.endpoints.clone();
        let registry = registry.clone();
        let signaling = signaling.clone();
        let orch_opts = opts.orchestrator.clone();
        tokio::spawn(async move {
            let result = orchestrator::connect(&peer_id, &endpoints, &registry, signaling.as_ref(), &orch_opts)
                .await
                .map(|outcome| outcome.connection);
            let _ = tx.send((peer_id, result));
        });
    }
    drop(connect_tx);

    let mut peers: HashMap<PeerId, PeerSlot> = HashMap::new();
    let mut metadata: Option<(u64, u64, u64)> = None;
    let mut connect_failures = 0usize;

    while metadata.is_none() {
        let Some((peer_id, result)) = connect_rx.recv().await else {
            break;
        };
        match result {
            Ok(connection) => {
                peers.insert(
                    peer_id.clone(),
                    PeerSlot {
                        connection: connection.clone(),
                        stats: PeerStats::new(peer_id.clone()),
                        endpoints: peer_endpoints.get(&peer_id).cloned().unwrap_or_default(),
                    },
                );
                match query_metadata(&connection, &req.digest, opts.metadata_timeout).await {
                    Ok(m) => metadata = Some(m),
                    Err(e) => {
                        warn!(peer = %peer_id, error = %e, "metadata query failed, trying next peer");
                    }
                }
            }
            Err(e) => {
                connect_failures += 1;
                warn!(peer = %peer_id, error = %e, "failed to connect to peer");
            }
        }
        if connect_failures == peer_count && peers.is_empty() {
            return Err(Error::NoPeersReachable);
        }
    }
    let Some((total_bytes, chunk_size, total_chunks)) = metadata else {
        return Err(Error::NoMetadata);
    };

    let mut assembler = Assembler::open(&req.save_path, total_bytes, chunk_size, total_chunks, req.resume).await?;
    if assembler.is_complete() {
        return assembler.finalize(&req.digest).await;
    }

    let mut concurrency = initial_concurrency(total_bytes, opts.min_concurrency, opts.max_concurrency);
    let mut missing: VecDeque<u64> = (0..total_chunks)
        .filter(|i| !assembler.is_chunk_complete(*i))
        .collect();
    let mut failures_by_chunk: HashMap<u64, u32> = HashMap::new();
    let mut in_flight: JoinSet<DispatchOutcome> = JoinSet::new();
    let mut throughput_history: VecDeque<f64> = VecDeque::with_capacity(3);
    let mut bytes_since_check = 0u64;
    let mut last_check = Instant::now();
    let mut check_interval = tokio::time::interval(opts.bandwidth_check_interval);
    check_interval.tick().await; // first tick fires immediately

    let result: Result<()> = 'outer: loop {
        if abort.load(Ordering::SeqCst) {
            break 'outer Err(Error::Cancelled);
        }
        if assembler.is_complete() {
            break 'outer Ok(());
        }

        while in_flight.len() < concurrency && !missing.is_empty() {
            let Some(peer_id) = select_peer(&peers) else {
                reactivate_all(&mut peers);
                break;
            };
            let index = missing.pop_front().unwrap();
            let slot = peers.get(&peer_id).expect("selected peer exists");
            let conn = slot.connection.clone();
            let digest = req.digest.clone();
            let timeout = opts.chunk_timeout;
            let pid = peer_id.clone();
            in_flight.spawn(async move {
                let started = Instant::now();
                let outcome = request_chunk(&conn, &digest, index, timeout).await;
                DispatchOutcome {
                    peer_id: pid,
                    index,
                    elapsed: started.elapsed(),
                    outcome,
                }
            });
        }

        tokio::select! {
            biased;

            maybe_late = connect_rx.recv(), if !connect_rx.is_closed() => {
                if let Some((peer_id, result)) = maybe_late {
                    if let Ok(connection) = result {
                        let endpoints = peer_endpoints.get(&peer_id).cloned().unwrap_or_default();
                        peers.entry(peer_id.clone()).or_insert_with(|| PeerSlot {
                            connection,
                            stats: PeerStats::new(peer_id),
                            endpoints,
                        });
                    }
                }
            }

            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                let outcome = match joined {
                    Ok(outcome) => outcome,
                    Err(_) => continue,
                };
                handle_dispatch_outcome(
                    outcome,
                    &mut peers,
                    &mut assembler,
                    &mut missing,
                    &mut failures_by_chunk,
                    peer_count,
                    &mut bytes_since_check,
                    req.progress_callback.as_ref(),
                    req.peer_status_callback.as_ref(),
                    total_bytes,
                    &registry,
                    signaling.as_ref(),
                    &opts.orchestrator,
                ).await?;
            }

            _ = check_interval.tick() => {
                let elapsed = last_check.elapsed().as_secs_f64().max(0.001);
                let instantaneous = bytes_since_check as f64 / elapsed;
                adapt_parallelism(&mut throughput_history, instantaneous, &mut concurrency, opts.min_concurrency, opts.max_concurrency);
                evaluate_peers(&mut peers, opts.slow_peer_threshold, req.peer_status_callback.as_ref());
                bytes_since_check = 0;
                last_check = Instant::now();
            }
        }
    };

    for slot in peers.values() {
        slot.connection.close().await;
    }

    match result {
        Ok(()) => assembler.finalize(&req.digest).await,
        Err(e) => {
            assembler.discard().await;
            Err(e)
        }
    }
}

struct DispatchOutcome {
    peer_id: PeerId,
    index: u64,
    elapsed: Duration,
    outcome: Result<Vec<u8>>,
}

#[allow(clippy::too_many_arguments)]
async fn handle_dispatch_outcome(
    outcome: DispatchOutcome,
    peers: &mut HashMap<PeerId, PeerSlot>,
    assembler: &mut Assembler,
    missing: &mut VecDeque<u64>,
    failures_by_chunk: &mut HashMap<u64, u32>,
    peer_count: usize,
    bytes_since_check: &mut u64,
    progress_callback: Option<&ProgressCallback>,
    peer_status_callback: Option<&PeerStatusCallback>,
    total_bytes: u64,
    registry: &Arc<ConnectionRegistry>,
    signaling: Option<&Arc<dyn SignalingChannel>>,
    orchestrator_opts: &OrchestratorOptions,
) -> Result<()> {
    let DispatchOutcome {
        peer_id,
        index,
        elapsed,
        outcome,
    } = outcome;

    match outcome {
        Ok(bytes) => {
            let n = bytes.len() as u64;
            if let Some(slot) = peers.get_mut(&peer_id) {
                slot.stats.record_success(n, elapsed.as_secs_f64(), slot.connection.method());
            }
            *bytes_since_check += n;
            assembler.write_chunk(index, &bytes).await?;
            if let Some(cb) = peer_status_callback {
                cb(&peer_id, PeerState::ChunkDownloaded, n);
            }
            if let Some(cb) = progress_callback {
                cb(assembler.bytes_received(), total_bytes);
            }
            Ok(())
        }
        Err(e) => {
            warn!(peer = %peer_id, index, error = %e, "chunk request failed");
            missing.push_front(index);

            if matches!(e, Error::Transport { .. }) {
                // spec: on a transport-level error, attempt reconnection once via
                // the orchestrator before deactivating the peer.
                reconnect_or_deactivate(peer_id.clone(), peers, registry, signaling, orchestrator_opts, peer_status_callback)
                    .await;
            } else if let Some(slot) = peers.get_mut(&peer_id) {
                if slot.stats.record_failure() {
                    if let Some(cb) = peer_status_callback {
                        cb(&peer_id, PeerState::Inactive, slot.stats.bytes_transferred);
                    }
                }
            }

            let count = failures_by_chunk.entry(index).or_insert(0);
            *count += 1;
            if *count as usize > 2 * peer_count {
                return Err(Error::ChunkExhausted { index });
            }
            Ok(())
        }
    }
}

/// Reconnect once via C5 after a transport-level failure. Success replaces
/// the peer's connection and leaves it active; failure deactivates it
/// immediately (spec §4.9 Failure model).
async fn reconnect_or_deactivate(
    peer_id: PeerId,
    peers: &mut HashMap<PeerId, PeerSlot>,
    registry: &Arc<ConnectionRegistry>,
    signaling: Option<&Arc<dyn SignalingChannel>>,
    orchestrator_opts: &OrchestratorOptions,
    peer_status_callback: Option<&PeerStatusCallback>,
) {
    let Some(slot) = peers.get(&peer_id) else { return };
    let endpoints = slot.endpoints.clone();
    slot.connection.close().await;

    match orchestrator::connect(&peer_id, &endpoints, registry, signaling, orchestrator_opts).await {
        Ok(outcome) => {
            debug!(peer = %peer_id, "reconnected after transport error");
            if let Some(slot) = peers.get_mut(&peer_id) {
                slot.connection = outcome.connection;
            }
        }
        Err(e) => {
            warn!(peer = %peer_id, error = %e, "reconnection failed, deactivating peer");
            if let Some(slot) = peers.get_mut(&peer_id) {
                slot.stats.active = false;
                if let Some(cb) = peer_status_callback {
                    cb(&peer_id, PeerState::Inactive, slot.stats.bytes_transferred);
                }
            }
        }
    }
}

fn initial_concurrency(total_bytes: u64, min_concurrency: usize, max_concurrency: usize) -> usize {
    if total_bytes < MIB {
        return min_concurrency;
    }
    if total_bytes >= 100 * MIB {
        return max_concurrency;
    }
    let frac = (total_bytes - MIB) as f64 / (100 * MIB - MIB) as f64;
    let scaled = min_concurrency as f64 + frac * (max_concurrency - min_concurrency) as f64;
    scaled.round() as usize
}

fn select_peer(peers: &HashMap<PeerId, PeerSlot>) -> Option<PeerId> {
    let mut active: Vec<&PeerSlot> = peers.values().filter(|s| s.stats.active).collect();
    if active.is_empty() {
        return None;
    }
    active.sort_by(|a, b| {
        b.stats
            .ewma_bytes_per_sec
            .partial_cmp(&a.stats.ewma_bytes_per_sec)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut rng = rand::thread_rng();
    if active[0].stats.ewma_bytes_per_sec > 0.0 && rng.gen_bool(0.7) {
        return Some(active[0].stats.peer_id.clone());
    }
    let top_half = (active.len() / 2).max(1);
    let idx = rng.gen_range(0..top_half);
    Some(active[idx].stats.peer_id.clone())
}

fn reactivate_all(peers: &mut HashMap<PeerId, PeerSlot>) {
    for slot in peers.values_mut() {
        slot.stats.reactivate();
    }
}

fn evaluate_peers(
    peers: &mut HashMap<PeerId, PeerSlot>,
    slow_peer_threshold: f64,
    peer_status_callback: Option<&PeerStatusCallback>,
) {
    let active_ewmas: Vec<f64> = peers
        .values()
        .filter(|s| s.stats.active)
        .map(|s| s.stats.ewma_bytes_per_sec)
        .collect();
    if active_ewmas.is_empty() {
        return;
    }
    let mean = active_ewmas.iter().sum::<f64>() / active_ewmas.len() as f64;
    let threshold = slow_peer_threshold * mean;

    for slot in peers.values_mut() {
        if slot.stats.active && slot.stats.ewma_bytes_per_sec < threshold {
            slot.stats.active = false;
            debug!(peer = %slot.stats.peer_id, "demoted slow peer");
            if let Some(cb) = peer_status_callback {
                cb(&slot.stats.peer_id, PeerState::Inactive, slot.stats.bytes_transferred);
            }
        }
    }

    let floor = peers.len().min(3);
    let active_count = peers.values().filter(|s| s.stats.active).count();
    if active_count < floor {
        let mut inactive: Vec<&mut PeerSlot> = peers.values_mut().filter(|s| !s.stats.active).collect();
        inactive.sort_by(|a, b| {
            b.stats
                .ewma_bytes_per_sec
                .partial_cmp(&a.stats.ewma_bytes_per_sec)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        for slot in inactive.into_iter().take(floor - active_count) {
            slot.stats.reactivate();
            if let Some(cb) = peer_status_callback {
                cb(&slot.stats.peer_id, PeerState::Active, slot.stats.bytes_transferred);
            }
        }
    }
}

fn adapt_parallelism(
    history: &mut VecDeque<f64>,
    latest: f64,
    concurrency: &mut usize,
    min_concurrency: usize,
    max_concurrency: usize,
) {
    if history.len() == 3 {
        history.pop_front();
    }
    let previous = history.back().copied();
    history.push_back(latest);

    let Some(previous) = previous else { return };
    if previous <= 0.0 {
        return;
    }
    if latest > previous * 1.1 {
        *concurrency = (*concurrency + 1).min(max_concurrency);
    } else if latest < previous * 0.9 {
        *concurrency = concurrency.saturating_sub(1).max(min_concurrency);
    }
}

async fn query_metadata(conn: &Connection, digest: &str, timeout: Duration) -> Result<(u64, u64, u64)> {
    enum Reply {
        Ok(u64, u64, u64),
        Err(String),
    }

    let (tx, rx) = oneshot::channel::<Reply>();
    let pending = Arc::new(std::sync::Mutex::new(Some(tx)));

    let digest_owned = digest.to_string();
    let pending_ok = pending.clone();
    let digest_ok = digest_owned.clone();
    let ok_sub = conn
        .subscribe(
            "metadata-response",
            Box::new(move |msg| {
                if let WireMessage::MetadataResponse {
                    digest: d,
                    total_bytes,
                    chunk_size,
                    total_chunks,
                } = &msg
                {
                    if *d == digest_ok {
                        if let Some(tx) = pending_ok.lock().unwrap().take() {
                            let _ = tx.send(Reply::Ok(*total_bytes, *chunk_size, *total_chunks));
                        }
                    }
                }
            }),
        )
        .await;

    let pending_err = pending.clone();
    let digest_err = digest_owned.clone();
    let err_sub = conn
        .subscribe(
            "metadata-error",
            Box::new(move |msg| {
                if let WireMessage::MetadataError { digest: d, error } = &msg {
                    if *d == digest_err {
                        if let Some(tx) = pending_err.lock().unwrap().take() {
                            let _ = tx.send(Reply::Err(error.clone()));
                        }
                    }
                }
            }),
        )
        .await;

    conn.send(WireMessage::Metadata {
        digest: digest_owned,
    })
    .await?;

    let result = tokio::time::timeout(timeout, rx).await;
    conn.unsubscribe("metadata-response", ok_sub).await;
    conn.unsubscribe("metadata-error", err_sub).await;

    match result {
        Ok(Ok(Reply::Ok(total_bytes, chunk_size, total_chunks))) => Ok((total_bytes, chunk_size, total_chunks)),
        Ok(Ok(Reply::Err(error))) => Err(Error::Transport {
            peer: conn.peer_id().clone(),
            cause: format!("metadata error: {error}"),
        }),
        Ok(Err(_)) => Err(Error::Transport {
            peer: conn.peer_id().clone(),
            cause: "metadata channel closed".into(),
        }),
        Err(_) => Err(Error::Transport {
            peer: conn.peer_id().clone(),
            cause: "metadata request timed out".into(),
        }),
    }
}

async fn request_chunk(conn: &Connection, digest: &str, index: u64, timeout: Duration) -> Result<Vec<u8>> {
    enum Reply {
        Ok(Vec<u8>),
        Err(String),
    }

    let (tx, rx) = oneshot::channel::<Reply>();
    let pending = Arc::new(std::sync::Mutex::new(Some(tx)));

    let digest_owned = digest.to_string();
    let pending_ok = pending.clone();
    let digest_ok = digest_owned.clone();
    let ok_sub = conn
        .subscribe(
            "chunk-response",
            Box::new(move |msg| {
                if let WireMessage::ChunkResponse {
                    digest: d,
                    start_chunk,
                    data,
                } = &msg
                {
                    if *d == digest_ok && *start_chunk == index {
                        if let Some(tx) = pending_ok.lock().unwrap().take() {
                            let decoded = decode_chunk_payload(data)
                                .map(Reply::Ok)
                                .unwrap_or_else(|e| Reply::Err(e.to_string()));
                            let _ = tx.send(decoded);
                        }
                    }
                }
            }),
        )
        .await;

    let pending_err = pending.clone();
    let digest_err = digest_owned.clone();
    let err_sub = conn
        .subscribe(
            "chunk-error",
            Box::new(move |msg| {
                if let WireMessage::ChunkError {
                    digest: d,
                    start_chunk,
                    error,
                } = &msg
                {
                    if *d == digest_err && *start_chunk == index {
                        if let Some(tx) = pending_err.lock().unwrap().take() {
                            let _ = tx.send(Reply::Err(error.clone()));
                        }
                    }
                }
            }),
        )
        .await;

    conn.send(WireMessage::ChunkRequest {
        digest: digest_owned,
        start_chunk: index,
    })
    .await?;

    let result = tokio::time::timeout(timeout, rx).await;
    conn.unsubscribe("chunk-response", ok_sub).await;
    conn.unsubscribe("chunk-error", err_sub).await;

    match result {
        Ok(Ok(Reply::Ok(bytes))) => Ok(bytes),
        Ok(Ok(Reply::Err(error))) => Err(Error::Transport {
            peer: conn.peer_id().clone(),
            cause: format!("chunk error: {error}"),
        }),
        Ok(Err(_)) => Err(Error::Transport {
            peer: conn.peer_id().clone(),
            cause: "chunk channel closed".into(),
        }),
        Err(_) => Err(Error::ChunkTimeout {
            peer: conn.peer_id().clone(),
            index,
        }),
    }
}
