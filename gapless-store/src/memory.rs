/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! In-memory message store implementation.
//!
//! Suitable for tests and sessions that accept losing recovery state on
//! restart. All data is lost when the process exits.

use crate::traits::{LogRecord, MessageStore, SessionRecord};
use async_trait::async_trait;
use gapless_core::error::StoreError;
use gapless_core::types::{SeqNum, SeqRange, SessionKey};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

/// Per-session in-memory state.
#[derive(Debug, Default)]
struct SessionSlot {
    /// Outbound log indexed by sequence number.
    log: BTreeMap<u64, LogRecord>,
    /// Inbound audit journal.
    inbound: Vec<LogRecord>,
    /// Persisted sequence record.
    record: Option<SessionRecord>,
}

/// In-memory message store.
///
/// Messages are kept in a `BTreeMap` per session for efficient range
/// queries. Appends and reads on different sessions never contend beyond
/// the brief map lock.
#[derive(Debug, Default)]
pub struct MemoryStore {
    sessions: RwLock<HashMap<SessionKey, SessionSlot>>,
}

impl MemoryStore {
    /// Creates a new empty memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of log records held for a session.
    #[must_use]
    pub fn message_count(&self, key: &SessionKey) -> usize {
        self.sessions
            .read()
            .get(key)
            .map_or(0, |slot| slot.log.len())
    }

    /// Returns the number of journaled inbound messages for a session.
    #[must_use]
    pub fn inbound_count(&self, key: &SessionKey) -> usize {
        self.sessions
            .read()
            .get(key)
            .map_or(0, |slot| slot.inbound.len())
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn append(&self, key: &SessionKey, record: LogRecord) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write();
        let slot = sessions.entry(key.clone()).or_default();
        slot.log.insert(record.seq.value(), record);
        Ok(())
    }

    async fn read_range(
        &self,
        key: &SessionKey,
        range: SeqRange,
    ) -> Result<Vec<LogRecord>, StoreError> {
        let sessions = self.sessions.read();
        let Some(slot) = sessions.get(key) else {
            return Ok(vec![]);
        };
        Ok(slot
            .log
            .range(range.begin..=range.end)
            .map(|(_, record)| record.clone())
            .collect())
    }

    async fn exists(&self, key: &SessionKey, seq: SeqNum) -> Result<bool, StoreError> {
        Ok(self
            .sessions
            .read()
            .get(key)
            .is_some_and(|slot| slot.log.contains_key(&seq.value())))
    }

    async fn save_session(&self, record: &SessionRecord) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write();
        let slot = sessions.entry(record.key.clone()).or_default();
        slot.record = Some(record.clone());
        Ok(())
    }

    async fn load_session(&self, key: &SessionKey) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self
            .sessions
            .read()
            .get(key)
            .and_then(|slot| slot.record.clone()))
    }

    async fn reset(&self, key: &SessionKey) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write();
        if let Some(slot) = sessions.get_mut(key) {
            slot.log.clear();
            slot.inbound.clear();
            slot.record = None;
        }
        Ok(())
    }

    async fn journal_inbound(&self, key: &SessionKey, record: LogRecord) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write();
        let slot = sessions.entry(key.clone()).or_default();
        slot.inbound.push(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use gapless_core::types::{CompId, Timestamp};

    fn test_key() -> SessionKey {
        SessionKey::new(
            "FIX.4.4",
            CompId::new("SENDER").unwrap(),
            CompId::new("TARGET").unwrap(),
        )
    }

    fn record(seq: u64) -> LogRecord {
        LogRecord::new(
            SeqNum::new(seq),
            Bytes::from(format!("msg-{seq}")),
            Timestamp::from_millis(seq * 1000),
        )
    }

    #[tokio::test]
    async fn test_append_and_read_range() {
        let store = MemoryStore::new();
        let key = test_key();

        for seq in [1, 2, 3, 5] {
            store.append(&key, record(seq)).await.unwrap();
        }

        let found = store.read_range(&key, SeqRange::new(2, 5)).await.unwrap();
        assert_eq!(
            found.iter().map(|r| r.seq.value()).collect::<Vec<_>>(),
            vec![2, 3, 5]
        );
        // Sequence 4 was never written; it is simply absent.
        assert!(!store.exists(&key, SeqNum::new(4)).await.unwrap());
        assert!(store.exists(&key, SeqNum::new(5)).await.unwrap());
    }

    #[tokio::test]
    async fn test_read_range_unknown_session() {
        let store = MemoryStore::new();
        let found = store
            .read_range(&test_key(), SeqRange::new(1, 10))
            .await
            .unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_session_record_roundtrip() {
        let store = MemoryStore::new();
        let key = test_key();
        assert!(store.load_session(&key).await.unwrap().is_none());

        let record = SessionRecord {
            key: key.clone(),
            next_outbound: 51,
            next_inbound: 49,
            state: "Active".to_string(),
        };
        store.save_session(&record).await.unwrap();
        assert_eq!(store.load_session(&key).await.unwrap(), Some(record));
    }

    #[tokio::test]
    async fn test_reset_clears_session() {
        let store = MemoryStore::new();
        let key = test_key();

        store.append(&key, record(1)).await.unwrap();
        store
            .save_session(&SessionRecord {
                key: key.clone(),
                next_outbound: 10,
                next_inbound: 20,
                state: "Active".to_string(),
            })
            .await
            .unwrap();

        store.reset(&key).await.unwrap();
        assert_eq!(store.message_count(&key), 0);
        assert!(store.load_session(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sessions_are_independent() {
        let store = MemoryStore::new();
        let a = test_key();
        let b = SessionKey::new(
            "FIX.4.4",
            CompId::new("OTHER").unwrap(),
            CompId::new("TARGET").unwrap(),
        );

        store.append(&a, record(1)).await.unwrap();
        assert_eq!(store.message_count(&a), 1);
        assert_eq!(store.message_count(&b), 0);
    }

    #[tokio::test]
    async fn test_inbound_journal() {
        let store = MemoryStore::new();
        let key = test_key();
        store.journal_inbound(&key, record(7)).await.unwrap();
        store.journal_inbound(&key, record(8)).await.unwrap();
        assert_eq!(store.inbound_count(&key), 2);
        // Journal is audit-only; it never shows up in replay reads.
        assert!(store.read_range(&key, SeqRange::new(7, 8)).await.unwrap().is_empty());
    }
}
