//! Host-side request handler (C10, spec §4.10): answers `handshake`,
//! `metadata` and `chunk` requests arriving on any inbound connection, and
//! optionally applies a tit-for-tat choking policy across connected peers.
//!
//! Grounded on the teacher's `pea-windows/src/transport.rs` `handshake_accept`
//! path for "wrap the accepted socket, then drive request/response off its
//! subscriber table" — generalized from PeaPod's single encrypted-tunnel
//! protocol to the spec's metadata/chunk message pair.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use peerdrop_core::wire::encode_chunk_payload;
use peerdrop_core::{Connection, Endpoint, PeerId, WireMessage};
use rand::seq::SliceRandom;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// File metadata a [`ContentProvider`] exposes for one digest.
#[derive(Debug, Clone, Copy)]
pub struct ContentMetadata {
    pub total_bytes: u64,
    pub chunk_size: u64,
    pub total_chunks: u64,
}

/// A source of content this host can serve. Multiple providers can be
/// registered; the handler scans them in order until one claims the digest
/// (spec §4.10: "scanning the content-provider callback until it returns
/// null").
pub trait ContentProvider: Send + Sync {
    fn metadata(&self, digest: &str) -> Option<ContentMetadata>;
    fn chunk(&self, digest: &str, index: u64) -> Option<Vec<u8>>;
}

/// Serves chunks directly out of a directory of `<digest>.bin` files, slicing
/// on the fly. The simplest concrete provider; embedders with a database or
/// cache backing store would implement [`ContentProvider`] themselves.
pub struct DirectoryContentProvider {
    root: std::path::PathBuf,
    chunk_size: u64,
}

impl DirectoryContentProvider {
    pub fn new(root: impl Into<std::path::PathBuf>, chunk_size: u64) -> Self {
        Self {
            root: root.into(),
            chunk_size,
        }
    }

    fn path_for(&self, digest: &str) -> std::path::PathBuf {
        self.root.join(format!("{digest}.bin"))
    }
}

impl ContentProvider for DirectoryContentProvider {
    fn metadata(&self, digest: &str) -> Option<ContentMetadata> {
        let meta = std::fs::metadata(self.path_for(digest)).ok()?;
        let total_bytes = meta.len();
        let total_chunks = total_bytes.div_ceil(self.chunk_size).max(if total_bytes == 0 { 0 } else { 1 });
        Some(ContentMetadata {
            total_bytes,
            chunk_size: self.chunk_size,
            total_chunks,
        })
    }

    fn chunk(&self, digest: &str, index: u64) -> Option<Vec<u8>> {
        use std::io::{Read, Seek, SeekFrom};
        let meta = self.metadata(digest)?;
        if index >= meta.total_chunks {
            return None;
        }
        let start = index * self.chunk_size;
        let end = (start + self.chunk_size).min(meta.total_bytes);
        let mut file = std::fs::File::open(self.path_for(digest)).ok()?;
        file.seek(SeekFrom::Start(start)).ok()?;
        let mut buf = vec![0u8; (end - start) as usize];
        file.read_exact(&mut buf).ok()?;
        Some(buf)
    }
}

#[derive(Debug, Clone)]
pub struct ChokeOptions {
    pub max_unchoked: usize,
    pub update_interval: Duration,
    /// Super-seed variant (spec §4.10): prefer peers with zero contribution
    /// so pieces propagate instead of concentrating on already-fast peers.
    pub super_seed: bool,
}

impl Default for ChokeOptions {
    fn default() -> Self {
        Self {
            max_unchoked: 4,
            update_interval: Duration::from_secs(10),
            super_seed: false,
        }
    }
}

/// Tracks per-peer contribution (bytes this host has served them elsewhere,
/// e.g. as a fellow leecher in a swarm) and the current unchoked set.
/// Contribution bookkeeping is exposed via [`ChokeManager::record_served`];
/// nothing in this crate currently feeds it from the download side, so every
/// peer starts and stays at zero unless an embedder wires it up — which
/// degrades gracefully to "optimistic unchoke only" behavior.
pub struct ChokeManager {
    contributions: RwLock<HashMap<PeerId, u64>>,
    unchoked: RwLock<std::collections::HashSet<PeerId>>,
    opts: ChokeOptions,
}

impl ChokeManager {
    pub fn new(opts: ChokeOptions) -> Arc<Self> {
        Arc::new(Self {
            contributions: RwLock::new(HashMap::new()),
            unchoked: RwLock::new(std::collections::HashSet::new()),
            opts,
        })
    }

    pub async fn register_peer(&self, peer_id: PeerId) {
        self.contributions.write().await.entry(peer_id).or_insert(0);
    }

    pub async fn record_served(&self, peer_id: &PeerId, bytes: u64) {
        let mut contributions = self.contributions.write().await;
        *contributions.entry(peer_id.clone()).or_insert(0) += bytes;
    }

    pub async fn is_unchoked(&self, peer_id: &PeerId) -> bool {
        self.unchoked.read().await.contains(peer_id)
    }

    /// Recompute the unchoked set: top `max_unchoked - 1` contributors plus
    /// one randomly chosen peer (optimistic unchoke). Super-seed prefers
    /// zero-contribution peers first so new pieces spread across the swarm.
    async fn recompute(&self) {
        let contributions = self.contributions.read().await.clone();
        if contributions.is_empty() {
            return;
        }
        let mut peers: Vec<(PeerId, u64)> = contributions.into_iter().collect();
        if self.opts.super_seed {
            peers.sort_by_key(|(_, bytes)| *bytes);
        } else {
            peers.sort_by_key(|(_, bytes)| std::cmp::Reverse(*bytes));
        }

        let top_n = self.opts.max_unchoked.saturating_sub(1);
        let mut unchoked: std::collections::HashSet<PeerId> =
            peers.iter().take(top_n).map(|(id, _)| id.clone()).collect();

        let remaining: Vec<&PeerId> = peers
            .iter()
            .skip(top_n)
            .map(|(id, _)| id)
            .filter(|id| !unchoked.contains(*id))
            .collect();
        if let Some(optimistic) = remaining.choose(&mut rand::thread_rng()) {
            unchoked.insert((*optimistic).clone());
        }

        *self.unchoked.write().await = unchoked;
    }

    /// Spawn the periodic recompute loop; returns its join handle so the
    /// caller can hold it alive for the daemon's lifetime.
    pub fn spawn_recompute_loop(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.opts.update_interval);
            loop {
                interval.tick().await;
                self.recompute().await;
            }
        })
    }
}

/// Subscribe `conn` to `handshake`, `metadata` and `chunk` messages and
/// answer them from `providers`, applying `choke` if given. Runs for the
/// lifetime of the connection; the subscriber callbacks are synchronous
/// (spec §5: "subscribers run on the I/O driver's task and must not block"),
/// so replies are queued onto the connection's outbound channel rather than
/// awaited inline.
pub fn attach(
    conn: Arc<Connection>,
    providers: Arc<Vec<Arc<dyn ContentProvider>>>,
    choke: Option<Arc<ChokeManager>>,
    advertised_endpoints: Arc<Vec<Endpoint>>,
) {
    let handshake_conn = conn.clone();
    let handshake_endpoints = advertised_endpoints.clone();
    let handshake_choke = choke.clone();
    tokio::spawn(attach_handshake(handshake_conn, handshake_endpoints, handshake_choke));
    attach_metadata(conn.clone(), providers.clone());
    attach_chunk(conn, providers, choke);
}

async fn attach_handshake(conn: Arc<Connection>, endpoints: Arc<Vec<Endpoint>>, choke: Option<Arc<ChokeManager>>) {
    let reply_conn = conn.clone();
    conn.subscribe(
        "handshake",
        Box::new(move |msg| {
            let WireMessage::Handshake { client_id, .. } = msg else {
                return;
            };
            let conn = reply_conn.clone();
            let endpoints = endpoints.clone();
            let choke = choke.clone();
            tokio::spawn(async move {
                if let Some(choke) = &choke {
                    choke.register_peer(PeerId::new(client_id)).await;
                }
                let timestamp = now_unix_secs();
                let _ = conn
                    .send(WireMessage::HandshakeResponse {
                        connection_options: (*endpoints).clone(),
                        timestamp,
                    })
                    .await;
            });
        }),
    )
    .await;
}

fn attach_metadata(conn: Arc<Connection>, providers: Arc<Vec<Arc<dyn ContentProvider>>>) {
    let reply_conn = conn.clone();
    tokio::spawn(async move {
        reply_conn
            .subscribe(
                "metadata",
                Box::new(move |msg| {
                    let WireMessage::Metadata { digest } = msg else {
                        return;
                    };
                    let conn = reply_conn.clone();
                    let providers = providers.clone();
                    tokio::spawn(async move {
                        let found = providers.iter().find_map(|p| p.metadata(&digest));
                        let reply = match found {
                            Some(meta) => WireMessage::MetadataResponse {
                                digest,
                                total_bytes: meta.total_bytes,
                                chunk_size: meta.chunk_size,
                                total_chunks: meta.total_chunks,
                            },
                            None => WireMessage::MetadataError {
                                digest,
                                error: "unknown digest".into(),
                            },
                        };
                        let _ = conn.send(reply).await;
                    });
                }),
            )
            .await;
    });
}

fn attach_chunk(conn: Arc<Connection>, providers: Arc<Vec<Arc<dyn ContentProvider>>>, choke: Option<Arc<ChokeManager>>) {
    let peer_id = conn.peer_id().clone();
    let reply_conn = conn.clone();
    tokio::spawn(async move {
        reply_conn
            .subscribe(
                "chunk",
                Box::new(move |msg| {
                    let WireMessage::ChunkRequest { digest, start_chunk } = msg else {
                        return;
                    };
                    let conn = reply_conn.clone();
                    let providers = providers.clone();
                    let choke = choke.clone();
                    let peer_id = peer_id.clone();
                    tokio::spawn(async move {
                        if let Some(choke) = &choke {
                            if !choke.is_unchoked(&peer_id).await {
                                let _ = conn
                                    .send(WireMessage::ChunkError {
                                        digest,
                                        start_chunk,
                                        error: "choked".into(),
                                    })
                                    .await;
                                return;
                            }
                        }
                        let found = providers.iter().find_map(|p| p.chunk(&digest, start_chunk));
                        let reply = match found {
                            Some(bytes) => {
                                if let Some(choke) = &choke {
                                    choke.record_served(&peer_id, bytes.len() as u64).await;
                                }
                                WireMessage::ChunkResponse {
                                    digest,
                                    start_chunk,
                                    data: encode_chunk_payload(&bytes),
                                }
                            }
                            None => WireMessage::ChunkError {
                                digest,
                                start_chunk,
                                error: "chunk not available".into(),
                            },
                        };
                        if conn.send(reply).await.is_err() {
                            warn!(peer = %peer_id, "failed to send chunk reply, connection likely closed");
                        }
                    });
                }),
            )
            .await;
    });
}

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Accept loop for the reliable-stream transport: binds `addr`, and for each
/// incoming stream spawns a [`Connection`] and attaches the request handler.
/// The peer's stable id isn't known until its `handshake` message arrives;
/// until then the connection is keyed by a placeholder derived from the
/// remote socket address, matching how the teacher's `transport::run_transport`
/// names a session before its own handshake completes.
pub async fn accept_stream_loop(
    listener: tokio::net::TcpListener,
    providers: Arc<Vec<Arc<dyn ContentProvider>>>,
    choke: Option<Arc<ChokeManager>>,
    advertised_endpoints: Arc<Vec<Endpoint>>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                info!(%remote, "accepted inbound connection");
                let placeholder_id = PeerId::new(format!("inbound:{remote}"));
                let conn = Connection::spawn(
                    placeholder_id,
                    peerdrop_core::TransportMethod::ReliableStream,
                    peerdrop_core::Transport::Stream(stream),
                );
                attach(conn, providers.clone(), choke.clone(), advertised_endpoints.clone());
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
            }
        }
    }
}
