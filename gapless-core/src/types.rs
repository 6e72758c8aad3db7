/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Core types for the FIX session layer.
//!
//! This module provides the fundamental vocabulary shared by every Gapless
//! crate:
//! - [`SeqNum`]: Per-direction message sequence number
//! - [`SeqRange`]: Inclusive sequence interval used by resend handling
//! - [`CompId`]: Component identifier (SenderCompID, TargetCompID)
//! - [`SessionKey`]: Identity of one counterparty relationship
//! - [`Timestamp`]: FIX-formatted UTC timestamp
//! - [`MsgKind`]: Session-level message classification

use arrayvec::ArrayString;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Maximum length for CompID strings in bytes.
pub const COMP_ID_MAX_LEN: usize = 32;

/// FIX message sequence number.
///
/// Sequence numbers are strictly positive, start at 1, and increase
/// monotonically per direction within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct SeqNum(u64);

impl SeqNum {
    /// Creates a new sequence number.
    ///
    /// # Arguments
    /// * `value` - The sequence number value (>= 1 for valid FIX traffic)
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw sequence number value.
    #[inline]
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Returns the next sequence number.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Checks if this sequence number is valid (>= 1).
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 >= 1
    }
}

impl Default for SeqNum {
    fn default() -> Self {
        Self(1)
    }
}

impl From<u64> for SeqNum {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<SeqNum> for u64 {
    fn from(seq: SeqNum) -> Self {
        seq.0
    }
}

impl fmt::Display for SeqNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Inclusive sequence number interval `[begin, end]`.
///
/// Used for gap descriptions, resend requests, and chunk planning. A wire
/// `EndSeqNo` of 0 ("through infinity") must be resolved to a concrete end
/// before constructing a range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SeqRange {
    /// First sequence number in the range.
    pub begin: u64,
    /// Last sequence number in the range (inclusive).
    pub end: u64,
}

impl SeqRange {
    /// Creates a new range. `begin` must not exceed `end`.
    #[inline]
    #[must_use]
    pub const fn new(begin: u64, end: u64) -> Self {
        Self { begin, end }
    }

    /// Creates a range covering a single sequence number.
    #[inline]
    #[must_use]
    pub const fn single(seq: u64) -> Self {
        Self { begin: seq, end: seq }
    }

    /// Returns the number of sequence slots covered.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> u64 {
        if self.end < self.begin {
            0
        } else {
            self.end - self.begin + 1
        }
    }

    /// Returns true if the range covers no slots.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.end < self.begin
    }

    /// Returns true if `seq` falls within the range.
    #[inline]
    #[must_use]
    pub const fn contains(&self, seq: u64) -> bool {
        seq >= self.begin && seq <= self.end
    }

    /// Returns true if the two ranges share at least one slot.
    #[inline]
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.begin <= other.end && other.begin <= self.end
    }
}

impl fmt::Display for SeqRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.begin, self.end)
    }
}

/// Component identifier for FIX sessions.
///
/// Used for SenderCompID (tag 49), TargetCompID (tag 56), and related fields.
/// Maximum length is 32 characters as per FIX specification.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct CompId(ArrayString<COMP_ID_MAX_LEN>);

impl CompId {
    /// Creates a new CompId from a string slice.
    ///
    /// # Returns
    /// `Some(CompId)` if the string fits within the maximum length, `None`
    /// otherwise.
    #[must_use]
    pub fn new(s: &str) -> Option<Self> {
        ArrayString::from(s).ok().map(Self)
    }

    /// Returns the CompId as a string slice.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Returns the length of the CompId in bytes.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the CompId is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl AsRef<str> for CompId {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for CompId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CompId {
    type Err = arrayvec::CapacityError<()>;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ArrayString::try_from(s)
            .map(Self)
            .map_err(|_| arrayvec::CapacityError::new(()))
    }
}

/// Identity of one logical counterparty relationship.
///
/// A session is keyed by BeginString plus the sender/target CompID pair and
/// optional sub-IDs. The key is stable across transport reconnects; it is the
/// lookup key for the session registry and the message store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    /// FIX version BeginString (e.g., "FIX.4.4").
    pub begin_string: String,
    /// Our CompID (tag 49 on outbound messages).
    pub sender: CompId,
    /// Counterparty CompID (tag 56 on outbound messages).
    pub target: CompId,
    /// Optional sender sub ID (tag 50).
    pub sender_sub: Option<String>,
    /// Optional target sub ID (tag 57).
    pub target_sub: Option<String>,
}

impl SessionKey {
    /// Creates a new session key without sub-IDs.
    #[must_use]
    pub fn new(begin_string: impl Into<String>, sender: CompId, target: CompId) -> Self {
        Self {
            begin_string: begin_string.into(),
            sender,
            target,
            sender_sub: None,
            target_sub: None,
        }
    }

    /// Sets the sender sub ID.
    #[must_use]
    pub fn with_sender_sub(mut self, sub: impl Into<String>) -> Self {
        self.sender_sub = Some(sub.into());
        self
    }

    /// Sets the target sub ID.
    #[must_use]
    pub fn with_target_sub(mut self, sub: impl Into<String>) -> Self {
        self.target_sub = Some(sub.into());
        self
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}->{}", self.begin_string, self.sender, self.target)
    }
}

/// FIX protocol timestamp with nanosecond precision.
///
/// Formatted on the wire as `YYYYMMDD-HH:MM:SS.sss`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    /// Nanoseconds since Unix epoch (1970-01-01 00:00:00 UTC).
    nanos_since_epoch: u64,
}

impl Timestamp {
    /// Creates a timestamp from nanoseconds since Unix epoch.
    #[inline]
    #[must_use]
    pub const fn from_nanos(nanos: u64) -> Self {
        Self {
            nanos_since_epoch: nanos,
        }
    }

    /// Creates a timestamp from milliseconds since Unix epoch.
    #[inline]
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self {
            nanos_since_epoch: millis * 1_000_000,
        }
    }

    /// Returns the current UTC timestamp.
    #[inline]
    #[must_use]
    pub fn now() -> Self {
        let dt = Utc::now();
        Self {
            nanos_since_epoch: dt.timestamp_nanos_opt().unwrap_or(0) as u64,
        }
    }

    /// Returns nanoseconds since Unix epoch.
    #[inline]
    #[must_use]
    pub const fn as_nanos(self) -> u64 {
        self.nanos_since_epoch
    }

    /// Returns milliseconds since Unix epoch.
    #[inline]
    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.nanos_since_epoch / 1_000_000
    }

    /// Converts to a chrono `DateTime<Utc>`.
    #[must_use]
    pub fn to_datetime(self) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(self.nanos_since_epoch as i64)
    }

    /// Formats the timestamp in FIX format with millisecond precision.
    ///
    /// Format: `YYYYMMDD-HH:MM:SS.sss`
    #[must_use]
    pub fn format_millis(self) -> ArrayString<21> {
        let dt = self.to_datetime();
        let mut buf = ArrayString::new();
        let _ = std::fmt::write(
            &mut buf,
            format_args!("{}", dt.format("%Y%m%d-%H:%M:%S%.3f")),
        );
        buf
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Self::now()
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self {
            nanos_since_epoch: dt.timestamp_nanos_opt().unwrap_or(0) as u64,
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format_millis())
    }
}

/// Session-level classification of a FIX message.
///
/// The session core only dispatches on the administrative message types plus
/// an opaque application carrier; business payloads are never interpreted
/// beyond their sequencing metadata.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MsgKind {
    /// Heartbeat (0).
    Heartbeat,
    /// Test Request (1).
    TestRequest,
    /// Resend Request (2).
    ResendRequest,
    /// Reject (3).
    Reject,
    /// Sequence Reset (4) - gap fill or reset mode.
    SequenceReset,
    /// Logout (5).
    Logout,
    /// Logon (A).
    Logon,
    /// Any application-level message, carrying its MsgType value.
    App(String),
}

impl MsgKind {
    /// Classifies a wire MsgType value (tag 35). Never fails: unknown values
    /// are application messages.
    #[must_use]
    pub fn from_wire(s: &str) -> Self {
        match s {
            "0" => Self::Heartbeat,
            "1" => Self::TestRequest,
            "2" => Self::ResendRequest,
            "3" => Self::Reject,
            "4" => Self::SequenceReset,
            "5" => Self::Logout,
            "A" => Self::Logon,
            other => Self::App(other.to_string()),
        }
    }

    /// Returns the wire MsgType value (tag 35).
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Heartbeat => "0",
            Self::TestRequest => "1",
            Self::ResendRequest => "2",
            Self::Reject => "3",
            Self::SequenceReset => "4",
            Self::Logout => "5",
            Self::Logon => "A",
            Self::App(s) => s.as_str(),
        }
    }

    /// Returns true if this is an administrative (session-level) message.
    #[must_use]
    pub const fn is_admin(&self) -> bool {
        !matches!(self, Self::App(_))
    }

    /// Returns true if this is an application message.
    #[must_use]
    pub const fn is_app(&self) -> bool {
        matches!(self, Self::App(_))
    }
}

impl FromStr for MsgKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_wire(s))
    }
}

impl fmt::Display for MsgKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seq_num_operations() {
        let seq = SeqNum::new(5);
        assert_eq!(seq.value(), 5);
        assert_eq!(seq.next().value(), 6);
        assert!(seq.is_valid());
        assert!(!SeqNum::new(0).is_valid());
    }

    #[test]
    fn test_seq_num_default() {
        assert_eq!(SeqNum::default().value(), 1);
    }

    #[test]
    fn test_seq_range_len_and_contains() {
        let range = SeqRange::new(5, 9);
        assert_eq!(range.len(), 5);
        assert!(range.contains(5));
        assert!(range.contains(9));
        assert!(!range.contains(10));
        assert!(!range.is_empty());

        assert_eq!(SeqRange::single(7).len(), 1);
    }

    #[test]
    fn test_seq_range_overlaps() {
        let a = SeqRange::new(1, 10);
        let b = SeqRange::new(10, 20);
        let c = SeqRange::new(11, 20);
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn test_comp_id() {
        let id = CompId::new("SENDER").unwrap();
        assert_eq!(id.as_str(), "SENDER");
        assert_eq!(id.len(), 6);
        assert!(!id.is_empty());
    }

    #[test]
    fn test_comp_id_too_long() {
        let long = "A".repeat(COMP_ID_MAX_LEN + 1);
        assert!(CompId::new(&long).is_none());
    }

    #[test]
    fn test_session_key_display() {
        let key = SessionKey::new(
            "FIX.4.4",
            CompId::new("SENDER").unwrap(),
            CompId::new("TARGET").unwrap(),
        );
        assert_eq!(key.to_string(), "FIX.4.4:SENDER->TARGET");
    }

    #[test]
    fn test_timestamp_conversions() {
        let ts = Timestamp::from_millis(1000);
        assert_eq!(ts.as_millis(), 1000);
        assert_eq!(ts.as_nanos(), 1_000_000_000);
    }

    #[test]
    fn test_timestamp_format() {
        let ts = Timestamp::from_millis(0);
        assert!(ts.format_millis().starts_with("19700101-00:00:00"));
    }

    #[test]
    fn test_msg_kind_roundtrip() {
        assert_eq!("0".parse::<MsgKind>().unwrap(), MsgKind::Heartbeat);
        assert_eq!("A".parse::<MsgKind>().unwrap(), MsgKind::Logon);
        assert_eq!(MsgKind::ResendRequest.as_str(), "2");

        let app: MsgKind = "D".parse().unwrap();
        assert_eq!(app, MsgKind::App("D".to_string()));
        assert_eq!(app.as_str(), "D");
    }

    #[test]
    fn test_msg_kind_is_admin() {
        assert!(MsgKind::Heartbeat.is_admin());
        assert!(MsgKind::SequenceReset.is_admin());
        assert!(!MsgKind::App("D".to_string()).is_admin());
        assert!(MsgKind::App("8".to_string()).is_app());
    }
}
