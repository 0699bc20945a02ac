// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! WebSocket framing (§4.10, §6): RFC 6455 frame encode/decode with
//! masking, plus a minimal HTTP/1.1 upgrade handshake.
//!
//! The frame model mirrors what `tokio-tungstenite` exposes publicly
//! (see `DESIGN.md`), hand-rolled here since framing itself stays in scope
//! while the payload codec is treated opaquely (`net::codec::Codec`).

use anyhow::{Result, bail};
use rand::Rng;

/// WebSocket opcodes used by this crate (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    fn to_bits(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
        }
    }

    fn from_bits(bits: u8) -> Result<Self> {
        Ok(match bits {
            0x0 => Opcode::Continuation,
            0x1 => Opcode::Text,
            0x2 => Opcode::Binary,
            0x8 => Opcode::Close,
            0x9 => Opcode::Ping,
            0xA => Opcode::Pong,
            other => bail!("unsupported websocket opcode 0x{other:x}"),
        })
    }
}

/// One decoded WebSocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

/// Encodes `frame` on the wire. `mask` must be `true` for client-to-server
/// frames and `false` for server-to-client frames (§6 "client frames must
/// be masked; server frames must not").
pub fn encode(frame: &Frame, mask: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(frame.payload.len() + 14);
    let first = (frame.fin as u8) << 7 | frame.opcode.to_bits();
    out.push(first);

    let len = frame.payload.len();
    let mask_bit = (mask as u8) << 7;
    if len < 126 {
        out.push(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        out.push(mask_bit | 126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(mask_bit | 127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }

    if mask {
        let key: [u8; 4] = rand::rng().random();
        out.extend_from_slice(&key);
        out.extend(
            frame
                .payload
                .iter()
                .enumerate()
                .map(|(i, b)| b ^ key[i % 4]),
        );
    } else {
        out.extend_from_slice(&frame.payload);
    }
    out
}

/// Result of attempting to decode one frame from a buffer: either a
/// complete frame plus the number of bytes it consumed, or a request for
/// more bytes.
pub enum Decoded {
    Frame { frame: Frame, consumed: usize },
    NeedMore,
}

/// Decodes the first complete frame out of `buf`, if any. Does not mutate
/// `buf` — callers advance past `consumed` bytes themselves (matching the
/// façade's non-consuming-until-complete convention, §4.9).
pub fn decode(buf: &[u8]) -> Result<Decoded> {
    if buf.len() < 2 {
        return Ok(Decoded::NeedMore);
    }
    let fin = buf[0] & 0x80 != 0;
    let opcode = Opcode::from_bits(buf[0] & 0x0F)?;
    let masked = buf[1] & 0x80 != 0;
    let mut len = (buf[1] & 0x7F) as usize;
    let mut pos = 2usize;

    if len == 126 {
        if buf.len() < pos + 2 {
            return Ok(Decoded::NeedMore);
        }
        len = u16::from_be_bytes([buf[pos], buf[pos + 1]]) as usize;
        pos += 2;
    } else if len == 127 {
        if buf.len() < pos + 8 {
            return Ok(Decoded::NeedMore);
        }
        len = u64::from_be_bytes(buf[pos..pos + 8].try_into().expect("len checked")) as usize;
        pos += 8;
    }

    let mask_key = if masked {
        if buf.len() < pos + 4 {
            return Ok(Decoded::NeedMore);
        }
        let key = [buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]];
        pos += 4;
        Some(key)
    } else {
        None
    };

    if buf.len() < pos + len {
        return Ok(Decoded::NeedMore);
    }

    let mut payload = buf[pos..pos + len].to_vec();
    if let Some(key) = mask_key {
        for (i, b) in payload.iter_mut().enumerate() {
            *b ^= key[i % 4];
        }
    }

    Ok(Decoded::Frame {
        frame: Frame { fin, opcode, payload },
        consumed: pos + len,
    })
}

/// Decodes every complete frame's payload, reassembling fragmented
/// messages across `Continuation` frames, and concatenates all delivered
/// message bodies — the round-trip law §8 checks
/// (`decode(encode(P, k)) == P` for fragmentation factor `k`).
pub fn decode_all_reassembled(mut buf: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        match decode(buf)? {
            Decoded::Frame { frame, consumed } => {
                out.extend_from_slice(&frame.payload);
                buf = &buf[consumed..];
                if buf.is_empty() {
                    break;
                }
            }
            Decoded::NeedMore => break,
        }
    }
    Ok(out)
}

/// Splits `payload` into `k` frames (`k >= 1`), the first `Binary`/`Text`
/// and the rest `Continuation`, the last with `fin = true`.
pub fn fragment(payload: &[u8], k: usize, text: bool, mask: bool) -> Vec<u8> {
    let k = k.max(1);
    let chunk_len = payload.len().div_ceil(k).max(1);
    let chunks: Vec<&[u8]> = if payload.is_empty() {
        vec![&[]]
    } else {
        payload.chunks(chunk_len).collect()
    };

    let mut out = Vec::new();
    let last = chunks.len() - 1;
    for (i, chunk) in chunks.iter().enumerate() {
        let opcode = if i == 0 {
            if text { Opcode::Text } else { Opcode::Binary }
        } else {
            Opcode::Continuation
        };
        out.extend(encode(
            &Frame {
                fin: i == last,
                opcode,
                payload: chunk.to_vec(),
            },
            mask,
        ));
    }
    out
}

/// Computes the `Sec-WebSocket-Accept` header value for a client's
/// `Sec-WebSocket-Key` (RFC 6455 §1.3).
pub fn accept_key(client_key: &str) -> String {
    use base64::Engine;
    use sha1::{Digest, Sha1};
    const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}
