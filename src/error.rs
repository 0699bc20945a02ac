// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Error taxonomy for the mesh runtime.
//!
//! These are the *kinds* named in the design, not an exhaustive list of
//! every failure site. Call sites that don't need to branch on a specific
//! kind should keep using `anyhow::Result`; these variants exist for the
//! handful of places (RPC timeout-vs-error, framing violations) where the
//! caller needs to tell kinds apart.

use thiserror::Error;

/// Failure kinds that cross an await boundary by value rather than by
/// `anyhow::Error`, because a caller needs to match on them.
#[derive(Debug, Error)]
pub enum MeshError {
    /// The operation was interrupted by a cancellation token. Never logged
    /// as an error at the suspension site; it is expected control flow.
    #[error("operation canceled")]
    Canceled,

    /// An awaited task completed without ever producing a result (the
    /// coroutine body never ran). Indicates a programmer error.
    #[error("broken promise: task produced no result")]
    BrokenPromise,

    /// API misuse: awaiting a completed session twice, using a closed
    /// socket, registering a duplicate service ID, and similar.
    #[error("invalid action: {0}")]
    InvalidAction(String),

    /// The peer closed the connection in the ordinary course of business.
    #[error("peer disconnected ({reason})")]
    PeerDisconnected {
        /// `eof` or `initiative_disconnect`.
        reason: &'static str,
    },

    /// The wire framing was violated: bad sentinel, oversize length, a KCP
    /// magic mismatch, or a WebSocket protocol violation. The connection
    /// must be closed.
    #[error("framing violated: {0}")]
    FramingViolated(&'static str),

    /// A protocol-layer handshake or decode failed (TLS handshake, KCP
    /// segment). The connection must be closed.
    #[error("protocol layer failure: {0}")]
    ProtocolLayer(String),

    /// A payload did not decode to the message type expected for its
    /// `msg_id`. Treated as an unknown message: dropped, logged as a
    /// warning, never propagated as a hard failure.
    #[error("failed to parse payload for msg_id {msg_id}")]
    ParseFailed {
        /// The `msg_id` the payload was parsed against.
        msg_id: u16,
    },

    /// Bubbled up from the OS or allocator: bind failure, address
    /// resolution failure, out of memory.
    #[error("system error: {0}")]
    System(#[from] std::io::Error),
}

/// Result alias used at the handful of call sites that branch on
/// [`MeshError`]'s kind rather than just propagating with `anyhow`.
pub type MeshResult<T> = Result<T, MeshError>;

impl MeshError {
    /// Build an [`MeshError::InvalidAction`] from any displayable message.
    pub fn invalid_action(msg: impl Into<String>) -> Self {
        MeshError::InvalidAction(msg.into())
    }

    /// True for errors that represent ordinary connection teardown rather
    /// than a genuine fault — callers generally downgrade these to `info`
    /// level logging instead of `warn`/`error`.
    pub fn is_ordinary_close(&self) -> bool {
        matches!(self, MeshError::PeerDisconnected { .. } | MeshError::Canceled)
    }
}
