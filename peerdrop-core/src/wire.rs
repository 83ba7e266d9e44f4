//! Wire message schema and framing (spec §6, §9).
//!
//! Grounded on the teacher's `pea-core/src/wire.rs`: a 4-byte little-endian
//! length prefix followed by a serialized payload. The payload encoding
//! changes from `bincode` to JSON to match spec §6's "UTF-8 JSON object...
//! with a `type` field" wire schema; this is the documented resolution of
//! the §9 framing open question (length-prefixed, not newline-delimited).

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

const LEN_SIZE: usize = 4;
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Encode a chunk payload for [`WireMessage::ChunkResponse`]'s `data` field
/// (spec §6: `data: base64[]`).
pub fn encode_chunk_payload(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode a [`WireMessage::ChunkResponse`]'s `data` field back into raw bytes.
pub fn decode_chunk_payload(data: &str) -> Result<Vec<u8>, WireError> {
    Ok(STANDARD.decode(data)?)
}

/// All wire message types (spec §6). `#[serde(tag = "type")]` reproduces the
/// `{type: "...", ...}` JSON envelope the spec describes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum WireMessage {
    #[serde(rename = "handshake")]
    Handshake {
        #[serde(rename = "clientId")]
        client_id: String,
        #[serde(rename = "requestId")]
        request_id: String,
        timestamp: u64,
    },
    #[serde(rename = "handshake-response")]
    HandshakeResponse {
        #[serde(rename = "connectionOptions")]
        connection_options: Vec<crate::endpoint::Endpoint>,
        timestamp: u64,
    },
    #[serde(rename = "metadata")]
    Metadata { digest: String },
    #[serde(rename = "metadata-response")]
    MetadataResponse {
        digest: String,
        total_bytes: u64,
        chunk_size: u64,
        total_chunks: u64,
    },
    #[serde(rename = "metadata-error")]
    MetadataError { digest: String, error: String },
    #[serde(rename = "chunk")]
    ChunkRequest { digest: String, start_chunk: u64 },
    #[serde(rename = "chunk-response")]
    ChunkResponse {
        digest: String,
        start_chunk: u64,
        /// Base64-encoded chunk payload, per spec §6.
        data: String,
    },
    #[serde(rename = "chunk-error")]
    ChunkError {
        digest: String,
        start_chunk: u64,
        error: String,
    },
    #[serde(rename = "cancel")]
    Cancel { file_hash: String, piece_index: u64 },
}

impl WireMessage {
    pub fn type_name(&self) -> &'static str {
        match self {
            WireMessage::Handshake { .. } => "handshake",
            WireMessage::HandshakeResponse { .. } => "handshake-response",
            WireMessage::Metadata { .. } => "metadata",
            WireMessage::MetadataResponse { .. } => "metadata-response",
            WireMessage::MetadataError { .. } => "metadata-error",
            WireMessage::ChunkRequest { .. } => "chunk",
            WireMessage::ChunkResponse { .. } => "chunk-response",
            WireMessage::ChunkError { .. } => "chunk-error",
            WireMessage::Cancel { .. } => "cancel",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("json encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Encode a message into a single frame: 4-byte LE length + JSON payload.
pub fn encode_frame(msg: &WireMessage) -> Result<Vec<u8>, WireError> {
    let payload = serde_json::to_vec(msg)?;
    if payload.len() as u64 > MAX_FRAME_LEN as u64 {
        return Err(WireError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Decode one frame from the front of `bytes`, returning the message and the
/// number of bytes consumed. Returns [`WireError::NeedMore`] on a partial
/// buffer so the caller (an I/O driver task reading from a stream) can wait
/// for more bytes and retry — this is what prevents the framing bug the
/// source had, where two messages landing in one `recv` buffer produced a
/// parse failure.
pub fn decode_frame(bytes: &[u8]) -> Result<(WireMessage, usize), WireError> {
    if bytes.len() < LEN_SIZE {
        return Err(WireError::NeedMore);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if len > MAX_FRAME_LEN {
        return Err(WireError::TooLarge);
    }
    let len = len as usize;
    if bytes.len() < LEN_SIZE + len {
        return Err(WireError::NeedMore);
    }
    let msg: WireMessage = serde_json::from_slice(&bytes[LEN_SIZE..LEN_SIZE + len])?;
    Ok((msg, LEN_SIZE + len))
}

/// Encode a single datagram payload (no length prefix needed — the datagram
/// boundary already delimits one message, per spec §4.6).
pub fn encode_datagram(msg: &WireMessage) -> Result<Vec<u8>, WireError> {
    Ok(serde_json::to_vec(msg)?)
}

pub fn decode_datagram(bytes: &[u8]) -> Result<WireMessage, WireError> {
    Ok(serde_json::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_metadata_response() -> WireMessage {
        WireMessage::MetadataResponse {
            digest: "abc123".into(),
            total_bytes: 5000,
            chunk_size: 1000,
            total_chunks: 5,
        }
    }

    #[test]
    fn roundtrip_every_message_type() {
        let samples = vec![
            WireMessage::Handshake {
                client_id: "c1".into(),
                request_id: "r1".into(),
                timestamp: 1,
            },
            WireMessage::HandshakeResponse {
                connection_options: vec![],
                timestamp: 1,
            },
            WireMessage::Metadata {
                digest: "abc".into(),
            },
            sample_metadata_response(),
            WireMessage::MetadataError {
                digest: "abc".into(),
                error: "not found".into(),
            },
            WireMessage::ChunkRequest {
                digest: "abc".into(),
                start_chunk: 0,
            },
            WireMessage::ChunkResponse {
                digest: "abc".into(),
                start_chunk: 0,
                data: "aGVsbG8=".into(),
            },
            WireMessage::ChunkError {
                digest: "abc".into(),
                start_chunk: 0,
                error: "missing".into(),
            },
            WireMessage::Cancel {
                file_hash: "abc".into(),
                piece_index: 2,
            },
        ];
        for msg in samples {
            let frame = encode_frame(&msg).unwrap();
            let (decoded, n) = decode_frame(&frame).unwrap();
            assert_eq!(n, frame.len());
            assert_eq!(msg, decoded);
        }
    }

    #[test]
    fn partial_buffer_needs_more() {
        let frame = encode_frame(&sample_metadata_response()).unwrap();
        assert!(matches!(decode_frame(&frame[..2]), Err(WireError::NeedMore)));
        assert!(matches!(
            decode_frame(&frame[..LEN_SIZE]),
            Err(WireError::NeedMore)
        ));
    }

    #[test]
    fn two_messages_in_one_buffer_decode_independently() {
        let a = WireMessage::Metadata {
            digest: "abc".into(),
        };
        let b = WireMessage::Cancel {
            file_hash: "abc".into(),
            piece_index: 0,
        };
        let fa = encode_frame(&a).unwrap();
        let fb = encode_frame(&b).unwrap();
        let mut buf = Vec::new();
        buf.extend_from_slice(&fa);
        buf.extend_from_slice(&fb);
        let (m1, n1) = decode_frame(&buf).unwrap();
        assert_eq!(m1, a);
        let (m2, n2) = decode_frame(&buf[n1..]).unwrap();
        assert_eq!(m2, b);
        assert_eq!(n1 + n2, buf.len());
    }

    #[test]
    fn json_envelope_has_type_field() {
        let msg = WireMessage::Metadata {
            digest: "abc".into(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "metadata");
        assert_eq!(json["digest"], "abc");
    }

    #[test]
    fn chunk_payload_roundtrips_through_base64() {
        let payload = b"arbitrary chunk bytes \x00\x01\xff";
        let encoded = encode_chunk_payload(payload);
        let decoded = decode_chunk_payload(&encoded).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn datagram_roundtrip() {
        let msg = WireMessage::ChunkRequest {
            digest: "abc".into(),
            start_chunk: 3,
        };
        let bytes = encode_datagram(&msg).unwrap();
        let decoded = decode_datagram(&bytes).unwrap();
        assert_eq!(msg, decoded);
    }
}
