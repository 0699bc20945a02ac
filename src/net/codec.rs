// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Opaque payload codec (§1 "Protocol Buffers wire encoding ... treated as
//! an opaque byte-level codec"). This crate models the payload layer as a
//! trait rather than assuming protobuf; a `serde_json`-backed default lets
//! tests and the reference binary run without a real protobuf schema.
//! Swapping in `prost` is a one-impl exercise, intentionally not done here
//! (see `DESIGN.md`).

use anyhow::Result;
use serde::{Serialize, de::DeserializeOwned};

/// Serializes a message to bytes and parses bytes back into a message.
/// Implemented once per concrete payload type; the gate/RPC layers never
/// interpret the bytes themselves.
pub trait Codec: Sized {
    fn serialize(&self) -> Result<Vec<u8>>;
    fn parse(bytes: &[u8]) -> Result<Self>;
}

/// Default codec for any `Serialize + DeserializeOwned` type, backed by
/// `serde_json` (already a teacher dependency, used the same way the
/// teacher's models round-trip through `serde`).
impl<T> Codec for T
where
    T: Serialize + DeserializeOwned,
{
    fn serialize(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    fn parse(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Ping {
        ts: u64,
    }

    #[test]
    fn default_codec_round_trips() {
        let msg = Ping { ts: 12345 };
        let bytes = msg.serialize().expect("serialize");
        let back = Ping::parse(&bytes).expect("parse");
        assert_eq!(msg, back);
    }
}
