/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Error types for the Gapless FIX session engine.
//!
//! This module provides a unified error hierarchy using `thiserror`.
//! Sequence gaps and duplicates are deliberately absent: they are normal
//! protocol conditions handled inside the state machine, not errors. Only
//! protocol violations, logon rejections, store failures, and terminal
//! disconnects cross the session boundary, always wrapped in a
//! [`SessionFailure`] that carries the session identity and state.

use crate::types::SessionKey;
use thiserror::Error;

/// Result type alias using [`EngineError`] as the error type.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Top-level error type for all Gapless operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Error in wire-level parsing or construction.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Error in session layer operations.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Error in message store operations.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// I/O error from underlying storage or transport.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors in wire-level message handling.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Message buffer ends before the message does.
    #[error("truncated message")]
    Truncated,

    /// Message does not start with a BeginString field (tag 8).
    #[error("invalid begin string: message must start with 8=")]
    InvalidBeginString,

    /// BodyLength (tag 9) missing or not second.
    #[error("missing body length field (tag 9)")]
    MissingBodyLength,

    /// MsgType (tag 35) missing or not first in body.
    #[error("missing msg type field (tag 35)")]
    MissingMsgType,

    /// Missing required field.
    #[error("missing required field: tag {tag}")]
    MissingField {
        /// The tag number of the missing field.
        tag: u32,
    },

    /// Field value cannot be interpreted.
    #[error("invalid value for tag {tag}: {reason}")]
    InvalidField {
        /// The tag number of the field.
        tag: u32,
        /// Description of why the value is invalid.
        reason: String,
    },

    /// Checksum mismatch between calculated and declared values.
    #[error("checksum mismatch: calculated {calculated}, declared {declared}")]
    ChecksumMismatch {
        /// Calculated checksum value.
        calculated: u8,
        /// Declared checksum value in message.
        declared: u8,
    },
}

/// Errors in FIX session layer operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Malformed or out-of-contract inbound message. Session-fatal.
    #[error("protocol violation: {reason}")]
    ProtocolViolation {
        /// Description of the violation.
        reason: String,
    },

    /// Logon was rejected before the session reached Active.
    #[error("logon rejected: {reason}")]
    LogonRejected {
        /// Reason for rejection.
        reason: String,
    },

    /// No response to a TestRequest within the configured window.
    #[error("heartbeat timeout after {elapsed_ms} milliseconds")]
    HeartbeatTimeout {
        /// Elapsed milliseconds since the TestRequest was sent.
        elapsed_ms: u64,
    },

    /// Counterparty rejected one of our messages with a session-level Reject.
    #[error("rejected by peer: ref_seq={ref_seq}, reason={reason}")]
    RejectedByPeer {
        /// Sequence number of the rejected message.
        ref_seq: u64,
        /// Rejection text, if any.
        reason: String,
    },

    /// Operation requires an established session.
    #[error("session not established: state is {state}")]
    NotEstablished {
        /// Current session state name.
        state: String,
    },

    /// No session registered under the given key.
    #[error("unknown session: {key}")]
    UnknownSession {
        /// Display form of the session key.
        key: String,
    },

    /// The message store cannot serve an append or replay read.
    #[error("store unavailable: {0}")]
    StoreUnavailable(StoreError),
}

/// Errors in message store operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Message not found in the log.
    #[error("message not found: seq={seq}")]
    NotFound {
        /// Sequence number of the missing record.
        seq: u64,
    },

    /// No part of a requested range is available.
    #[error("messages not available for range [{begin}, {end}]")]
    RangeUnavailable {
        /// Begin sequence number of the requested range.
        begin: u64,
        /// End sequence number of the requested range.
        end: u64,
    },

    /// Log content failed validation.
    #[error("store corrupted: {reason}")]
    Corrupted {
        /// Description of the corruption.
        reason: String,
    },

    /// Serialization of a persisted record failed.
    #[error("store serialization error: {0}")]
    Serialization(String),

    /// I/O error in persistent store.
    #[error("store i/o error: {0}")]
    Io(String),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// A failure surfaced across the session boundary.
///
/// Everything the application layer sees carries the session identity and
/// the state the session was in when the failure occurred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionFailure {
    /// Identity of the failing session.
    pub key: SessionKey,
    /// Session state name at the time of failure.
    pub state: String,
    /// The underlying failure.
    pub error: SessionError,
}

impl SessionFailure {
    /// Creates a new session failure.
    #[must_use]
    pub fn new(key: SessionKey, state: impl Into<String>, error: SessionError) -> Self {
        Self {
            key,
            state: state.into(),
            error,
        }
    }
}

impl std::fmt::Display for SessionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session {} in state {}: {}", self.key, self.state, self.error)
    }
}

impl std::error::Error for SessionFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}
