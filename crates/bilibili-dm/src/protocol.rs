//! Danmaku wire protocol: frame layout, constants, and encode/decode.
//!
//! Every frame starts with a fixed 16-byte big-endian header:
//!
//! ```text
//! 0..4    total frame size (header included)
//! 4..6    header size, always 16
//! 6..8    protocol version (see [`protover`])
//! 8..12   operation (see [`op`])
//! 12..16  sequence
//! 16..    body
//! ```
//!
//! Compressed frames carry a body that is itself a run of frames, so decoding
//! is recursive.

use std::io::Read;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;

use crate::types::HeartbeatData;

pub const HEADER_SIZE: usize = 16;

const HEARTBEAT_BODY: &[u8] = b"[Object object]";
const BROTLI_BUFFER_SIZE: usize = 4096;

/// Envelopes inside envelopes beyond this depth are skipped.
pub const MAX_NESTING_DEPTH: usize = 4;
/// Inflated size limit for a single compressed frame.
pub const MAX_DECOMPRESSED_LEN: usize = 8 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Protocol constants
// ---------------------------------------------------------------------------

pub mod protover {
    /// Uncompressed JSON command.
    pub const PLAIN: u16 = 0;
    /// Control packets (heartbeat, auth, popularity).
    pub const SPECIAL: u16 = 1;
    /// Zlib envelope around nested frames.
    pub const ZLIB: u16 = 2;
    /// Brotli envelope around nested frames.
    pub const BROTLI: u16 = 3;
}

pub mod op {
    pub const HEARTBEAT: u32 = 2;
    pub const HEARTBEAT_REPLY: u32 = 3;
    pub const COMMAND: u32 = 5;
    pub const AUTH: u32 = 7;
    pub const AUTH_REPLY: u32 = 8;
}

// ---------------------------------------------------------------------------
// Packet
// ---------------------------------------------------------------------------

/// A decoded frame. After [`decode`] no packet carries a compressed protocol
/// version: envelopes are unpacked and their contents flattened in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub protocol: u16,
    pub operation: u32,
    pub sequence: u32,
    pub body: Bytes,
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("buffer too short for a frame header: {0} bytes")]
    TooShort(usize),

    #[error("invalid frame size {declared} (remaining {remaining})")]
    Framing { declared: usize, remaining: usize },

    #[error("{codec} decompress failed: {source}")]
    Decompress {
        codec: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{codec} frame inflates past {limit} bytes")]
    TooLarge { codec: &'static str, limit: usize },

    #[error("compressed frames nested deeper than {0} levels")]
    TooDeep(usize),
}

// ---------------------------------------------------------------------------
// Encode
// ---------------------------------------------------------------------------

pub fn encode(packet: &Packet) -> Vec<u8> {
    let total = HEADER_SIZE + packet.body.len();
    let mut buf = BytesMut::with_capacity(total);
    buf.put_u32(total as u32);
    buf.put_u16(HEADER_SIZE as u16);
    buf.put_u16(packet.protocol);
    buf.put_u32(packet.operation);
    buf.put_u32(packet.sequence);
    buf.put_slice(&packet.body);
    buf.to_vec()
}

#[derive(Serialize)]
struct AuthBody<'a> {
    uid: i64,
    roomid: i64,
    key: &'a str,
    protover: u16,
}

/// Build the auth packet sent as the first message on a fresh socket.
///
/// Without a token the server only accepts the zlib stream, so brotli is
/// negotiated only when one is present.
pub fn auth_packet(room_id: i64, token: &str) -> Result<Packet, serde_json::Error> {
    let protover = if token.is_empty() {
        protover::ZLIB
    } else {
        protover::BROTLI
    };
    let body = serde_json::to_vec(&AuthBody {
        uid: 0,
        roomid: room_id,
        key: token,
        protover,
    })?;
    Ok(Packet {
        protocol: protover::SPECIAL,
        operation: op::AUTH,
        sequence: 1,
        body: body.into(),
    })
}

pub fn heartbeat_packet() -> Packet {
    Packet {
        protocol: protover::SPECIAL,
        operation: op::HEARTBEAT,
        sequence: 1,
        body: Bytes::from_static(HEARTBEAT_BODY),
    }
}

/// Popularity counter from a heartbeat reply. Bodies under 4 bytes carry no data.
pub fn parse_heartbeat_reply(body: &[u8]) -> Option<HeartbeatData> {
    let raw: [u8; 4] = body.get(..4)?.try_into().ok()?;
    Some(HeartbeatData {
        popularity: u32::from_be_bytes(raw),
    })
}

// ---------------------------------------------------------------------------
// Decode
// ---------------------------------------------------------------------------

pub fn decode(data: &[u8]) -> Result<Vec<Packet>, CodecError> {
    decode_bytes(Bytes::copy_from_slice(data))
}

/// Decode every frame in `data`, in wire order.
///
/// A bad size field fails the whole buffer. A compressed frame that cannot be
/// inflated, inflates past [`MAX_DECOMPRESSED_LEN`], sits deeper than
/// [`MAX_NESTING_DEPTH`] or whose contents do not decode is skipped; its
/// siblings are kept.
pub fn decode_bytes(data: Bytes) -> Result<Vec<Packet>, CodecError> {
    decode_nested(data, 0)
}

fn decode_nested(mut data: Bytes, depth: usize) -> Result<Vec<Packet>, CodecError> {
    if data.len() < HEADER_SIZE {
        return Err(CodecError::TooShort(data.len()));
    }

    let mut packets = Vec::new();
    while data.len() >= HEADER_SIZE {
        let mut header = data.slice(..HEADER_SIZE);
        let total = header.get_u32() as usize;
        let _header_len = header.get_u16();
        let protocol = header.get_u16();
        let operation = header.get_u32();
        let sequence = header.get_u32();

        if total < HEADER_SIZE || total > data.len() {
            return Err(CodecError::Framing {
                declared: total,
                remaining: data.len(),
            });
        }
        let body = data.slice(HEADER_SIZE..total);

        match protocol {
            protover::ZLIB | protover::BROTLI => {
                let nested = if depth >= MAX_NESTING_DEPTH {
                    Err(CodecError::TooDeep(MAX_NESTING_DEPTH))
                } else {
                    decompress(protocol, &body)
                        .and_then(|raw| decode_nested(raw.into(), depth + 1))
                };
                match nested {
                    Ok(nested) => packets.extend(nested),
                    Err(e) => {
                        tracing::warn!(protocol, sequence, error = %e, "Skipping compressed frame");
                    }
                }
            }
            _ => packets.push(Packet {
                protocol,
                operation,
                sequence,
                body,
            }),
        }

        data.advance(total);
    }

    Ok(packets)
}

fn decompress(protocol: u16, body: &[u8]) -> Result<Vec<u8>, CodecError> {
    // One byte past the limit tells "exactly at the limit" from "over it".
    let cap = MAX_DECOMPRESSED_LEN as u64 + 1;
    let mut out = Vec::new();
    let (codec, result) = if protocol == protover::ZLIB {
        (
            "zlib",
            flate2::read::ZlibDecoder::new(body)
                .take(cap)
                .read_to_end(&mut out),
        )
    } else {
        (
            "brotli",
            brotli::Decompressor::new(body, BROTLI_BUFFER_SIZE)
                .take(cap)
                .read_to_end(&mut out),
        )
    };
    result.map_err(|source| CodecError::Decompress { codec, source })?;
    if out.len() > MAX_DECOMPRESSED_LEN {
        return Err(CodecError::TooLarge {
            codec,
            limit: MAX_DECOMPRESSED_LEN,
        });
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
