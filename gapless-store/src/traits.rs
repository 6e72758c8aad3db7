/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Message store trait definition.
//!
//! The store is shared by all sessions of an engine. It owns two things per
//! session: the append-only log of outbound wire messages (replayed on
//! resend requests) and the persisted sequence record that lets a session
//! continue across process restarts.
//!
//! Concurrency contract: implementations must support concurrent appends
//! from different sessions and a replay read concurrent with appends on the
//! same session. Callers guarantee that no two tasks append to the *same*
//! session's log concurrently (single writer per session).

use async_trait::async_trait;
use bytes::Bytes;
use gapless_core::error::StoreError;
use gapless_core::types::{SeqNum, SeqRange, SessionKey, Timestamp};
use serde::{Deserialize, Serialize};

/// One immutable entry in a session's outbound log.
///
/// Records are never mutated after append; replay returns the stored bytes
/// verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Sequence number of the recorded message.
    pub seq: SeqNum,
    /// The wire bytes exactly as transmitted.
    pub bytes: Bytes,
    /// Time the record was appended.
    pub timestamp: Timestamp,
}

impl LogRecord {
    /// Creates a new log record.
    #[must_use]
    pub fn new(seq: SeqNum, bytes: Bytes, timestamp: Timestamp) -> Self {
        Self {
            seq,
            bytes,
            timestamp,
        }
    }
}

/// Persisted per-session sequence record.
///
/// Updated atomically on every sequence advance so a "continue" reconnect
/// resumes exactly where the previous process stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Session identity.
    pub key: SessionKey,
    /// Next sequence number we will send.
    pub next_outbound: u64,
    /// Next sequence number we expect to receive.
    pub next_inbound: u64,
    /// Session state label at the time of the update.
    pub state: String,
}

/// Abstract interface for session-layer persistence.
///
/// `append` and `read_range` may suspend (durability wait, I/O-bound
/// replay); they are the only suspension points the session core relies on.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Appends one outbound message to the session's log.
    ///
    /// The record must be durable when this returns: under write-then-send
    /// ordering the caller transmits only after a successful append.
    ///
    /// # Errors
    /// Returns `StoreError` if the record cannot be made durable.
    async fn append(&self, key: &SessionKey, record: LogRecord) -> Result<(), StoreError>;

    /// Reads the stored records within `range`, ascending by sequence.
    ///
    /// Sequences that were never written (non-persistent message policy) are
    /// simply absent from the result; the caller substitutes gap fills.
    /// Callers read one chunk at a time, which keeps replay bounded and
    /// restartable.
    ///
    /// # Errors
    /// Returns `StoreError` if the log cannot be read.
    async fn read_range(
        &self,
        key: &SessionKey,
        range: SeqRange,
    ) -> Result<Vec<LogRecord>, StoreError>;

    /// Returns true if a record exists for `seq`.
    ///
    /// # Errors
    /// Returns `StoreError` if the log cannot be consulted.
    async fn exists(&self, key: &SessionKey, seq: SeqNum) -> Result<bool, StoreError>;

    /// Atomically persists the session's sequence record.
    ///
    /// # Errors
    /// Returns `StoreError` if the record cannot be written.
    async fn save_session(&self, record: &SessionRecord) -> Result<(), StoreError>;

    /// Loads the persisted sequence record, if one exists.
    ///
    /// # Errors
    /// Returns `StoreError` if the record exists but cannot be read.
    async fn load_session(&self, key: &SessionKey) -> Result<Option<SessionRecord>, StoreError>;

    /// Clears the session's log and sequence record (sequence reset).
    ///
    /// # Errors
    /// Returns `StoreError` if the reset fails.
    async fn reset(&self, key: &SessionKey) -> Result<(), StoreError>;

    /// Records one inbound message for audit purposes.
    ///
    /// Never read back by the engine; default implementation discards.
    ///
    /// # Errors
    /// Returns `StoreError` if the journal write fails.
    async fn journal_inbound(
        &self,
        _key: &SessionKey,
        _record: LogRecord,
    ) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullStore;

    #[async_trait]
    impl MessageStore for NullStore {
        async fn append(&self, _key: &SessionKey, _record: LogRecord) -> Result<(), StoreError> {
            Ok(())
        }

        async fn read_range(
            &self,
            _key: &SessionKey,
            _range: SeqRange,
        ) -> Result<Vec<LogRecord>, StoreError> {
            Ok(vec![])
        }

        async fn exists(&self, _key: &SessionKey, _seq: SeqNum) -> Result<bool, StoreError> {
            Ok(false)
        }

        async fn save_session(&self, _record: &SessionRecord) -> Result<(), StoreError> {
            Ok(())
        }

        async fn load_session(
            &self,
            _key: &SessionKey,
        ) -> Result<Option<SessionRecord>, StoreError> {
            Ok(None)
        }

        async fn reset(&self, _key: &SessionKey) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn test_key() -> SessionKey {
        use gapless_core::types::CompId;
        SessionKey::new(
            "FIX.4.4",
            CompId::new("SENDER").unwrap(),
            CompId::new("TARGET").unwrap(),
        )
    }

    #[tokio::test]
    async fn test_default_journal_inbound_is_noop() {
        let store = NullStore;
        let record = LogRecord::new(SeqNum::new(1), Bytes::from_static(b"x"), Timestamp::from_millis(0));
        assert!(store.journal_inbound(&test_key(), record).await.is_ok());
    }

    #[test]
    fn test_session_record_json_roundtrip() {
        let record = SessionRecord {
            key: test_key(),
            next_outbound: 51,
            next_inbound: 49,
            state: "Active".to_string(),
        };
        let json = serde_json::to_string(&record).unwrap();
        let back: SessionRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
