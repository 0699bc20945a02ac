// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Fixed wire headers (§3, §6): the 16-byte TCP/TLS/KCP frame header and
//! the 16-byte shared-memory frame header, both little-endian.
//!
//! A `#[repr(C)]` struct deriving zerocopy's
//! `FromBytes`/`IntoBytes`/`KnownLayout`/`Immutable`, read and written
//! in place without an intermediate byte-by-byte encoder.

use anyhow::{Result, bail};
use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout,
    little_endian::{U16, U32, U64},
};

/// Fixed framing sentinel for [`NetHeader`]. The original's exact byte was
/// filtered out of the retrieval pack; this crate picks `0xA5` and treats
/// it as an internal protocol constant (see `DESIGN.md`).
pub const SENTINEL: u8 = 0xA5;

/// Maximum payload length accepted on a framed TCP/TLS/KCP stream (§4.11).
pub const MAX_PAYLOAD_LEN: u32 = 10 * 1024 * 1024;

pub const NET_HEADER_LEN: usize = 16;
pub const SHM_HEADER_LEN: usize = 16;

/// 16-byte header prefixing every framed message on a TCP/TLS/KCP stream.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct NetHeader {
    pub sentinel: u8,
    pub reserved: u8,
    pub msg_id: U16,
    pub length: U32,
    pub session: U64,
}

impl NetHeader {
    /// Builds a header for a payload of `length` bytes and the given
    /// `msg_id`/`session`, with `sentinel` already set and `reserved`
    /// zeroed.
    pub fn new(msg_id: u16, length: u32, session: u64) -> Self {
        Self {
            sentinel: SENTINEL,
            reserved: 0,
            msg_id: U16::new(msg_id),
            length: U32::new(length),
            session: U64::new(session),
        }
    }

    pub fn to_bytes(&self) -> [u8; NET_HEADER_LEN] {
        let mut buf = [0u8; NET_HEADER_LEN];
        buf.copy_from_slice(self.as_bytes());
        buf
    }

    /// Parses a header out of exactly [`NET_HEADER_LEN`] bytes, validating
    /// the sentinel and the payload length ceiling (§4.11 "oversize closes
    /// the connection").
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() != NET_HEADER_LEN {
            bail!("net header must be {NET_HEADER_LEN} bytes, got {}", buf.len());
        }
        let hdr = Self::read_from_bytes(buf)
            .map_err(|e| anyhow::anyhow!("malformed net header: {e}"))?;
        if hdr.sentinel != SENTINEL {
            bail!("net header sentinel mismatch: got 0x{:02x}", hdr.sentinel);
        }
        if hdr.length.get() > MAX_PAYLOAD_LEN {
            bail!(
                "net header length {} exceeds max {MAX_PAYLOAD_LEN}",
                hdr.length.get()
            );
        }
        Ok(hdr)
    }

    pub fn msg_id(&self) -> u16 {
        self.msg_id.get()
    }

    pub fn length(&self) -> u32 {
        self.length.get()
    }

    pub fn session(&self) -> u64 {
        self.session.get()
    }
}

/// 16-byte header on every shared-memory ring entry, adding explicit
/// service-id routing absent from [`NetHeader`].
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ShmHeader {
    pub from_service: U16,
    pub to_service: U16,
    pub msg_id: U16,
    pub flag: U16,
    pub session: U64,
}

impl ShmHeader {
    pub fn new(from_service: u16, to_service: u16, msg_id: u16, session: u64) -> Self {
        Self {
            from_service: U16::new(from_service),
            to_service: U16::new(to_service),
            msg_id: U16::new(msg_id),
            flag: U16::new(0),
            session: U64::new(session),
        }
    }

    pub fn to_bytes(&self) -> [u8; SHM_HEADER_LEN] {
        let mut buf = [0u8; SHM_HEADER_LEN];
        buf.copy_from_slice(self.as_bytes());
        buf
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() != SHM_HEADER_LEN {
            bail!("shm header must be {SHM_HEADER_LEN} bytes, got {}", buf.len());
        }
        Self::read_from_bytes(buf).map_err(|e| anyhow::anyhow!("malformed shm header: {e}"))
    }

    pub fn from_service(&self) -> u16 {
        self.from_service.get()
    }

    pub fn to_service(&self) -> u16 {
        self.to_service.get()
    }

    pub fn msg_id(&self) -> u16 {
        self.msg_id.get()
    }

    pub fn session(&self) -> u64 {
        self.session.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn net_header_round_trips() {
        let hdr = NetHeader::new(42, 11, 0xDEAD_BEEF);
        let bytes = hdr.to_bytes();
        let parsed = NetHeader::parse(&bytes).expect("parse");
        assert_eq!(parsed, hdr);
        assert_eq!(parsed.msg_id(), 42);
        assert_eq!(parsed.length(), 11);
        assert_eq!(parsed.session(), 0xDEAD_BEEF);
    }

    #[test]
    fn net_header_rejects_bad_sentinel() {
        let hdr = NetHeader::new(1, 0, 0);
        let mut bytes = hdr.to_bytes();
        bytes[0] = !SENTINEL;
        assert!(NetHeader::parse(&bytes).is_err());
    }

    #[test]
    fn net_header_accepts_max_and_rejects_oversize() {
        let ok = NetHeader::new(1, MAX_PAYLOAD_LEN, 0);
        assert!(NetHeader::parse(&ok.to_bytes()).is_ok());

        let too_big = NetHeader::new(1, MAX_PAYLOAD_LEN + 1, 0);
        assert!(NetHeader::parse(&too_big.to_bytes()).is_err());
    }

    #[test]
    fn shm_header_round_trips() {
        let hdr = ShmHeader::new(20, 10, 42, 7);
        let bytes = hdr.to_bytes();
        let parsed = ShmHeader::parse(&bytes).expect("parse");
        assert_eq!(parsed, hdr);
        assert_eq!(parsed.from_service(), 20);
        assert_eq!(parsed.to_service(), 10);
    }
}
