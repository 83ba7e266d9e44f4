//! Hole-punch / rendezvous (C4, spec §4.4). Not present in the teacher
//! (LAN-only design); built against the [`crate::signaling::SignalingChannel`]
//! abstraction used as the shared rendezvous bus.

use std::net::SocketAddr;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use socket2::{Domain, Socket, Type};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::interval;

use crate::error::{Error, Result};
use crate::peer::PeerId;
use crate::signaling::SignalingChannel;

/// Wire schema for hole-punch coordination (spec §4.4), carried over the
/// signaling channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PunchKind {
    StartPunch,
    PunchReq,
    PunchResp,
    PunchAck,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PunchMessage {
    pub kind: PunchKind,
    pub punch_id: String,
    pub sender: String,
    pub receiver: String,
    pub timestamp: u64,
    pub address: Option<String>,
    pub port: Option<u16>,
}

fn now_unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Clone)]
pub struct PunchOptions {
    /// How long to wait for the peer to appear on the signaling channel.
    pub signal_timeout: Duration,
    /// How long to keep sending punch datagrams/connect attempts before
    /// giving up (default 10s, spec §4.4).
    pub punch_timeout: Duration,
}

impl Default for PunchOptions {
    fn default() -> Self {
        Self {
            signal_timeout: Duration::from_secs(10),
            punch_timeout: Duration::from_secs(10),
        }
    }
}

const RETRY_INTERVAL: Duration = Duration::from_millis(200);

fn rendezvous_topic(punch_id: &str, owner: &PeerId) -> String {
    format!("punch/{punch_id}/{}", owner.as_str())
}

/// Publish our local endpoint and wait (up to `opts.signal_timeout`) for the
/// peer's. Returns the peer's advertised `(address, port)`.
async fn exchange_endpoints(
    signaling: &dyn SignalingChannel,
    punch_id: &str,
    self_id: &PeerId,
    peer_id: &PeerId,
    local: SocketAddr,
    opts: &PunchOptions,
) -> Result<SocketAddr> {
    let mut rx = signaling.subscribe(&rendezvous_topic(punch_id, peer_id)).await;
    let announce = PunchMessage {
        kind: PunchKind::StartPunch,
        punch_id: punch_id.to_string(),
        sender: self_id.as_str().to_string(),
        receiver: peer_id.as_str().to_string(),
        timestamp: now_unix_millis(),
        address: Some(local.ip().to_string()),
        port: Some(local.port()),
    };
    signaling
        .publish(
            &rendezvous_topic(punch_id, self_id),
            serde_json::to_value(&announce).expect("PunchMessage serializes"),
        )
        .await;

    let deadline = Instant::now() + opts.signal_timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::Transport {
                peer: peer_id.clone(),
                cause: "signaling timeout: peer never announced its endpoint".into(),
            });
        }
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Ok(value)) => {
                let Ok(msg) = serde_json::from_value::<PunchMessage>(value) else {
                    continue;
                };
                if msg.kind != PunchKind::StartPunch {
                    continue;
                }
                let (Some(addr), Some(port)) = (msg.address, msg.port) else {
                    continue;
                };
                let parsed: std::net::IpAddr = addr
                    .parse()
                    .map_err(|_| Error::Validation(format!("bad peer address: {addr}")))?;
                return Ok(SocketAddr::new(parsed, port));
            }
            Ok(Err(_)) => {
                return Err(Error::Transport {
                    peer: peer_id.clone(),
                    cause: "signaling channel closed".into(),
                })
            }
            Err(_) => {
                return Err(Error::Transport {
                    peer: peer_id.clone(),
                    cause: "signaling timeout: peer never announced its endpoint".into(),
                })
            }
        }
    }
}

/// Datagram hole punch (spec §4.4). Both peers bind a local UDP socket,
/// exchange observed endpoints via the signaling channel, then exchange
/// `PUNCH_REQ`/`PUNCH_RESP`/`PUNCH_ACK` datagrams directly until the NAT
/// binding opens in both directions or `punch_timeout` elapses. Returns the
/// socket with the remote endpoint locked in (connected).
pub async fn punch_datagram(
    signaling: &dyn SignalingChannel,
    punch_id: &str,
    self_id: &PeerId,
    peer_id: &PeerId,
    opts: &PunchOptions,
) -> Result<UdpSocket> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    let local = socket.local_addr()?;
    let remote = exchange_endpoints(signaling, punch_id, self_id, peer_id, local, opts).await?;

    let mut ticker = interval(RETRY_INTERVAL);
    let deadline = Instant::now() + opts.punch_timeout;
    let mut replied = false;
    let mut buf = [0u8; 512];

    loop {
        if Instant::now() >= deadline {
            return Err(Error::Transport {
                peer: peer_id.clone(),
                cause: "punch timeout: no datagram exchange succeeded".into(),
            });
        }
        tokio::select! {
            _ = ticker.tick() => {
                let req = PunchMessage {
                    kind: PunchKind::PunchReq,
                    punch_id: punch_id.to_string(),
                    sender: self_id.as_str().to_string(),
                    receiver: peer_id.as_str().to_string(),
                    timestamp: now_unix_millis(),
                    address: None,
                    port: None,
                };
                if let Ok(bytes) = serde_json::to_vec(&req) {
                    let _ = socket.send_to(&bytes, remote).await;
                }
            }
            recv = socket.recv_from(&mut buf) => {
                let (n, from) = recv?;
                let Ok(msg) = serde_json::from_slice::<PunchMessage>(&buf[..n]) else { continue };
                match msg.kind {
                    PunchKind::PunchReq if !replied => {
                        replied = true;
                        let resp = PunchMessage {
                            kind: PunchKind::PunchResp,
                            punch_id: punch_id.to_string(),
                            sender: self_id.as_str().to_string(),
                            receiver: peer_id.as_str().to_string(),
                            timestamp: now_unix_millis(),
                            address: None,
                            port: None,
                        };
                        if let Ok(bytes) = serde_json::to_vec(&resp) {
                            let _ = socket.send_to(&bytes, from).await;
                        }
                    }
                    PunchKind::PunchResp => {
                        let ack = PunchMessage {
                            kind: PunchKind::PunchAck,
                            punch_id: punch_id.to_string(),
                            sender: self_id.as_str().to_string(),
                            receiver: peer_id.as_str().to_string(),
                            timestamp: now_unix_millis(),
                            address: None,
                            port: None,
                        };
                        if let Ok(bytes) = serde_json::to_vec(&ack) {
                            let _ = socket.send_to(&bytes, from).await;
                        }
                        socket.connect(from).await?;
                        return Ok(socket);
                    }
                    PunchKind::PunchAck => {
                        socket.connect(from).await?;
                        return Ok(socket);
                    }
                    _ => {}
                }
            }
        }
    }
}

/// Reliable-stream hole punch. Both peers `connect` to the same remote
/// `(addr, port)` simultaneously; first one to succeed wins.
pub async fn punch_stream(remote: SocketAddr, opts: &PunchOptions) -> Result<TcpStream> {
    tokio::time::timeout(opts.punch_timeout, TcpStream::connect(remote))
        .await
        .map_err(|_| Error::Transport {
            peer: PeerId::new(remote.to_string()),
            cause: "punch timeout: simultaneous connect never completed".into(),
        })?
        .map_err(Error::Io)
}

/// Simultaneous-open variant: bind the local port and listen on it *while*
/// also attempting an outbound connect to `remote`. Whichever resolves
/// first — an accepted inbound connection or the outbound connect — wins;
/// the other is discarded.
pub async fn punch_stream_simultaneous_open(
    local_port: u16,
    remote: SocketAddr,
    opts: &PunchOptions,
) -> Result<TcpStream> {
    let domain = if remote.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    let bind_addr: SocketAddr = if remote.is_ipv6() {
        format!("[::]:{local_port}").parse().unwrap()
    } else {
        format!("0.0.0.0:{local_port}").parse().unwrap()
    };
    socket.bind(&bind_addr.into())?;
    socket.listen(1)?;
    socket.set_nonblocking(true)?;
    let std_listener: std::net::TcpListener = socket.into();
    let listener = TcpListener::from_std(std_listener)?;

    let connect_socket = Socket::new(domain, Type::STREAM, None)?;
    connect_socket.set_reuse_address(true)?;
    #[cfg(unix)]
    connect_socket.set_reuse_port(true)?;
    connect_socket.bind(&bind_addr.into())?;
    connect_socket.set_nonblocking(true)?;
    // Non-blocking connect: issue it now so the kernel starts the three-way
    // handshake; `WouldBlock` just means it hasn't completed yet.
    match connect_socket.connect(&remote.into()) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(Error::Io(e)),
    }
    let std_stream: std::net::TcpStream = connect_socket.into();
    let connector = TcpStream::from_std(std_stream)?;

    tokio::select! {
        accepted = listener.accept() => {
            let (stream, _addr) = accepted?;
            Ok(stream)
        }
        connected = tokio::time::timeout(opts.punch_timeout, connect_via(connector)) => {
            connected.map_err(|_| Error::Transport {
                peer: PeerId::new(remote.to_string()),
                cause: "punch timeout: simultaneous open never completed".into(),
            })?
        }
    }
}

async fn connect_via(stream: TcpStream) -> Result<TcpStream> {
    // The connect was already issued non-blocking on the raw socket; wait
    // for writability, then check whether it actually succeeded.
    stream.writable().await?;
    if let Some(err) = stream.take_error()? {
        return Err(Error::Io(err));
    }
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::InMemorySignaling;
    use std::sync::Arc;

    #[tokio::test]
    async fn datagram_punch_between_two_local_peers_succeeds() {
        let signaling = Arc::new(InMemorySignaling::new());
        let a = PeerId::new("a");
        let b = PeerId::new("b");
        let opts = PunchOptions {
            signal_timeout: Duration::from_secs(2),
            punch_timeout: Duration::from_secs(2),
        };

        let sig_a = signaling.clone();
        let opts_a = opts.clone();
        let a_id = a.clone();
        let b_id = b.clone();
        let task_a = tokio::spawn(async move {
            punch_datagram(sig_a.as_ref(), "p1", &a_id, &b_id, &opts_a).await
        });

        let sig_b = signaling.clone();
        let opts_b = opts.clone();
        let task_b = tokio::spawn(async move {
            punch_datagram(sig_b.as_ref(), "p1", &b, &a, &opts_b).await
        });

        let (res_a, res_b) = tokio::join!(task_a, task_b);
        assert!(res_a.unwrap().is_ok());
        assert!(res_b.unwrap().is_ok());
    }

    #[tokio::test]
    async fn signaling_timeout_when_peer_never_announces() {
        let signaling = InMemorySignaling::new();
        let opts = PunchOptions {
            signal_timeout: Duration::from_millis(50),
            punch_timeout: Duration::from_secs(1),
        };
        let result = punch_datagram(&signaling, "p2", &PeerId::new("a"), &PeerId::new("ghost"), &opts)
            .await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("signaling timeout"));
    }
}
