//! Address toolkit (C1): IP-family classification, preference sort, bind
//! address selection, wildcard/link-local checks. Spec §4.1. Pure parsing,
//! no I/O — built from scratch; the teacher hardcodes `0.0.0.0` binds and
//! never classifies an address.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::endpoint::Protocol;

/// Address family classification. `Invalid` covers anything that is not a
/// syntactically valid IPv4 dotted-quad or IPv6 address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
    Invalid,
}

/// Socket family + protocol combination the connector should open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketFamily {
    Stream4,
    Stream6,
    Datagram4,
    Datagram6,
}

/// Classify a string as IPv4, IPv6, or invalid. Total: every input string
/// produces exactly one variant (spec §8).
pub fn classify(addr: &str) -> Family {
    if addr.parse::<Ipv4Addr>().is_ok() {
        return Family::V4;
    }
    if addr.parse::<Ipv6Addr>().is_ok() {
        return Family::V6;
    }
    Family::Invalid
}

/// Stable sort of `addrs` by preference. Invalid addresses always sort last.
/// When `prefer_v6`, v6 addresses precede v4; otherwise v4 precedes v6.
/// Idempotent: `sort_by_preference(sort_by_preference(xs, p), p) == sort_by_preference(xs, p)`.
pub fn sort_by_preference(addrs: &[String], prefer_v6: bool) -> Vec<String> {
    let mut out = addrs.to_vec();
    out.sort_by_key(|a| rank(a, prefer_v6));
    out
}

fn rank(addr: &str, prefer_v6: bool) -> u8 {
    match classify(addr) {
        Family::V6 if prefer_v6 => 0,
        Family::V4 if !prefer_v6 => 0,
        Family::V6 => 1,
        Family::V4 => 1,
        Family::Invalid => 2,
    }
}

/// Resolve the concrete socket family to open for `addr`. When `addr` does
/// not unambiguously determine a family (i.e. it's invalid), falls back to
/// `prefer_v6`.
pub fn socket_family(addr: &str, protocol: Protocol, prefer_v6: bool) -> SocketFamily {
    let family = match classify(addr) {
        Family::V4 => Family::V4,
        Family::V6 => Family::V6,
        Family::Invalid => {
            if prefer_v6 {
                Family::V6
            } else {
                Family::V4
            }
        }
    };
    match (family, protocol) {
        (Family::V4, Protocol::Stream) => SocketFamily::Stream4,
        (Family::V6, Protocol::Stream) => SocketFamily::Stream6,
        (Family::V4, Protocol::Datagram) => SocketFamily::Datagram4,
        (Family::V6, Protocol::Datagram) => SocketFamily::Datagram6,
        // unreachable because we only ever match V4/V6 above
        (Family::Invalid, _) => unreachable!("family resolved above"),
    }
}

/// The wildcard bind address for a family.
pub fn wildcard(family: Family) -> &'static str {
    match family {
        Family::V6 => "::",
        _ => "0.0.0.0",
    }
}

/// RFC1918 / RFC3927 private-range test for IPv4, RFC4193 for IPv6. Public
/// addresses and invalid strings return false.
pub fn is_private(addr: &str) -> bool {
    match addr.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            v4.is_private() || v4.is_link_local() // RFC1918 + RFC3927 (169.254/16)
        }
        Ok(IpAddr::V6(v6)) => {
            // RFC4193 unique local addresses: fc00::/7
            v6.segments()[0] & 0xfe00 == 0xfc00
        }
        Err(_) => false,
    }
}

/// fe80::/10 link-local test for IPv6.
pub fn is_link_local_v6(addr: &str) -> bool {
    match addr.parse::<Ipv6Addr>() {
        Ok(v6) => v6.segments()[0] & 0xffc0 == 0xfe80,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_is_total() {
        for s in ["1.2.3.4", "::1", "not-an-address", "", "999.1.1.1", "fe80::1"] {
            match classify(s) {
                Family::V4 | Family::V6 | Family::Invalid => {}
            }
        }
    }

    #[test]
    fn classify_rejects_out_of_range_octet() {
        assert_eq!(classify("256.1.1.1"), Family::Invalid);
    }

    #[test]
    fn classify_accepts_valid_v4_and_v6() {
        assert_eq!(classify("10.0.0.1"), Family::V4);
        assert_eq!(classify("2001:db8::1"), Family::V6);
    }

    #[test]
    fn sort_is_idempotent_and_stable() {
        let xs = vec![
            "10.0.0.1".to_string(),
            "2001:db8::1".to_string(),
            "garbage".to_string(),
            "10.0.0.2".to_string(),
        ];
        let once = sort_by_preference(&xs, true);
        let twice = sort_by_preference(&once, true);
        assert_eq!(once, twice);
        assert_eq!(once.last().unwrap(), "garbage");
        assert_eq!(once[0], "2001:db8::1");
    }

    #[test]
    fn sort_prefers_v4_when_not_prefer_v6() {
        let xs = vec!["2001:db8::1".to_string(), "10.0.0.1".to_string()];
        let sorted = sort_by_preference(&xs, false);
        assert_eq!(sorted[0], "10.0.0.1");
    }

    #[test]
    fn wildcard_matches_family() {
        assert_eq!(wildcard(Family::V4), "0.0.0.0");
        assert_eq!(wildcard(Family::V6), "::");
    }

    #[test]
    fn private_ranges() {
        assert!(is_private("192.168.1.1"));
        assert!(is_private("10.1.2.3"));
        assert!(is_private("169.254.1.1"));
        assert!(!is_private("8.8.8.8"));
        assert!(is_private("fc00::1"));
    }

    #[test]
    fn link_local_v6() {
        assert!(is_link_local_v6("fe80::1"));
        assert!(!is_link_local_v6("2001:db8::1"));
    }

    #[test]
    fn socket_family_ambiguous_falls_back_to_prefer_v6() {
        assert_eq!(
            socket_family("garbage", Protocol::Stream, true),
            SocketFamily::Stream6
        );
        assert_eq!(
            socket_family("garbage", Protocol::Stream, false),
            SocketFamily::Stream4
        );
    }
}
