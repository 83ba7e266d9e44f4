//! Connector (C2, spec §4.2): open a reliable-stream or datagram socket to a
//! given endpoint with timeout, family preference, and
//! first-available-of-many semantics.
//!
//! Grounded on `pea-windows/src/transport.rs`'s `TcpStream::connect` /
//! handshake dance for the reliable-stream path, and on
//! `pea-windows/src/discovery.rs`'s `UdpSocket` bind/send-to for the
//! datagram path.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

use crate::address::{self, Family, SocketFamily};
use crate::endpoint::Protocol;
use crate::error::{Error, Result};

/// Per-attempt options (spec §4.2). Callbacks are synchronous and
/// non-blocking, invoked from the connecting task.
pub struct ConnectOptions<'a> {
    pub timeout: Duration,
    pub prefer_v6: bool,
    pub on_error: Option<&'a (dyn Fn(&str, &str) + Send + Sync)>,
    pub on_connect: Option<&'a (dyn Fn(&str) + Send + Sync)>,
}

impl Default for ConnectOptions<'_> {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            prefer_v6: false,
            on_error: None,
            on_connect: None,
        }
    }
}

/// The result of a successful connect: the socket and the family it used.
pub enum Socket {
    Stream(TcpStream),
    Datagram(UdpSocket),
}

/// Open a reliable-stream socket to `addr:port`. Arms a timer for
/// `opts.timeout`; fails with a timed-out error if it elapses first.
pub async fn connect_stream(addr: &str, port: u16, opts: &ConnectOptions<'_>) -> Result<TcpStream> {
    let target: SocketAddr = format!("{addr}:{port}")
        .parse()
        .map_err(|_| Error::Validation(format!("invalid address: {addr}")))?;
    match timeout(opts.timeout, TcpStream::connect(target)).await {
        Ok(Ok(stream)) => {
            if let Some(cb) = opts.on_connect {
                cb(addr);
            }
            Ok(stream)
        }
        Ok(Err(e)) => {
            if let Some(cb) = opts.on_error {
                cb(&e.to_string(), addr);
            }
            Err(Error::Io(e))
        }
        Err(_) => {
            let msg = "timed out".to_string();
            if let Some(cb) = opts.on_error {
                cb(&msg, addr);
            }
            Err(Error::Transport {
                peer: crate::peer::PeerId::new(addr),
                cause: msg,
            })
        }
    }
}

/// Bind a new local datagram socket of the family appropriate for `addr` and
/// send a single short association datagram to `addr:port`, so downstream
/// code can write to and read from it as if it were connection-oriented.
pub async fn connect_datagram(addr: &str, port: u16, opts: &ConnectOptions<'_>) -> Result<UdpSocket> {
    let family = address::socket_family(addr, Protocol::Datagram, opts.prefer_v6);
    let bind_addr = match family {
        SocketFamily::Datagram6 => "[::]:0",
        _ => "0.0.0.0:0",
    };
    let socket = UdpSocket::bind(bind_addr).await?;
    let target: SocketAddr = format!("{addr}:{port}")
        .parse()
        .map_err(|_| Error::Validation(format!("invalid address: {addr}")))?;
    timeout(opts.timeout, socket.connect(target))
        .await
        .map_err(|_| Error::Transport {
            peer: crate::peer::PeerId::new(addr),
            cause: "timed out".into(),
        })??;
    // Association datagram: lets NAT state form and lets the caller start
    // writing immediately afterward (spec §4.2).
    let _ = socket.send(b"\0").await;
    if let Some(cb) = opts.on_connect {
        cb(addr);
    }
    Ok(socket)
}

/// Try each of `addresses` in preference order with a time budget of
/// `timeout / count` per attempt (or the full timeout when only one address
/// is given). Returns the first successful socket, its address, and the
/// resolved family.
pub async fn connect_first_available(
    addresses: &[String],
    port: u16,
    protocol: Protocol,
    opts: &ConnectOptions<'_>,
) -> Result<(Socket, String, SocketFamily)> {
    if addresses.is_empty() {
        return Err(Error::Validation("no addresses given".into()));
    }
    let sorted = address::sort_by_preference(addresses, opts.prefer_v6);
    let per_attempt = if sorted.len() == 1 {
        opts.timeout
    } else {
        opts.timeout / sorted.len() as u32
    };
    let mut last_err = String::new();
    for addr in &sorted {
        if classify_is_v6(addr) && opts.prefer_v6 && !has_v6_interface() {
            last_err = "no v6 interface available".to_string();
            if let Some(cb) = opts.on_error {
                cb(&last_err, addr);
            }
            continue;
        }
        let attempt_opts = ConnectOptions {
            timeout: per_attempt,
            prefer_v6: opts.prefer_v6,
            on_error: opts.on_error,
            on_connect: opts.on_connect,
        };
        let family = address::socket_family(addr, protocol, opts.prefer_v6);
        let result = match protocol {
            Protocol::Stream => connect_stream(addr, port, &attempt_opts).await.map(Socket::Stream),
            Protocol::Datagram => connect_datagram(addr, port, &attempt_opts)
                .await
                .map(Socket::Datagram),
        };
        match result {
            Ok(socket) => return Ok((socket, addr.clone(), family)),
            Err(e) => {
                last_err = e.to_string();
            }
        }
    }
    Err(Error::Transport {
        peer: crate::peer::PeerId::new("unknown"),
        cause: format!("all attempts failed: {last_err}"),
    })
}

fn classify_is_v6(addr: &str) -> bool {
    matches!(address::classify(addr), Family::V6)
}

/// Whether the host has any usable IPv6 interface. A conservative check:
/// binding a v6 wildcard socket succeeds when the stack is available.
fn has_v6_interface() -> bool {
    std::net::UdpSocket::bind("[::]:0").is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connect_stream_succeeds_against_loopback_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await });
        let opts = ConnectOptions::default();
        let stream = connect_stream("127.0.0.1", addr.port(), &opts).await.unwrap();
        drop(stream);
        accept.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn connect_stream_times_out_on_unreachable_address() {
        // TEST-NET-1 (192.0.2.0/24) is reserved and never routable.
        let opts = ConnectOptions {
            timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let result = connect_stream("192.0.2.1", 9, &opts).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn connect_datagram_returns_connected_socket() {
        let local = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = local.local_addr().unwrap();
        let opts = ConnectOptions::default();
        let socket = connect_datagram("127.0.0.1", addr.port(), &opts).await.unwrap();
        socket.send(b"ping").await.unwrap();
        let mut buf = [0u8; 16];
        let (n, _from) = local.recv_from(&mut buf).await.unwrap();
        // first datagram received is the association datagram
        assert_eq!(&buf[..n], b"\0");
    }

    #[tokio::test]
    async fn connect_first_available_uses_full_timeout_for_single_address() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await });
        let opts = ConnectOptions::default();
        let (socket, chosen, _family) =
            connect_first_available(&["127.0.0.1".to_string()], addr.port(), Protocol::Stream, &opts)
                .await
                .unwrap();
        assert!(matches!(socket, Socket::Stream(_)));
        assert_eq!(chosen, "127.0.0.1");
        accept.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn connect_first_available_falls_through_failures() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await });
        let opts = ConnectOptions {
            timeout: Duration::from_millis(300),
            ..Default::default()
        };
        let addrs = vec!["192.0.2.1".to_string(), "127.0.0.1".to_string()];
        let (socket, chosen, _family) =
            connect_first_available(&addrs, addr.port(), Protocol::Stream, &opts)
                .await
                .unwrap();
        assert!(matches!(socket, Socket::Stream(_)));
        assert_eq!(chosen, "127.0.0.1");
        accept.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn connect_first_available_fails_when_all_fail() {
        let opts = ConnectOptions {
            timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let addrs = vec!["192.0.2.1".to_string(), "192.0.2.2".to_string()];
        let result = connect_first_available(&addrs, 9, Protocol::Stream, &opts).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("all attempts failed"));
    }
}
