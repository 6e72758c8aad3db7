/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Durable file-backed message store.
//!
//! Layout: one directory per session under the store root.
//!
//! ```text
//! <root>/<session>/journal.log   append-only outbound log
//! <root>/<session>/inbound.log   append-only inbound audit journal
//! <root>/<session>/session.json  persisted sequence record
//! ```
//!
//! The journal is a sequence of length-prefixed frames:
//! `seq (u64 LE) | timestamp nanos (u64 LE) | len (u32 LE) | payload | crc32 (u32 LE)`
//! preceded by a file magic. `sync_data` after each append is the durability
//! point. On open the index is rebuilt by scanning; a torn tail (partial
//! frame or CRC mismatch, e.g. after a crash mid-append) is truncated back
//! to the last complete frame.
//!
//! Replay reads use their own file handle, so an append on the same session
//! is never blocked by a replay in progress.

use crate::traits::{LogRecord, MessageStore, SessionRecord};
use async_trait::async_trait;
use bytes::Bytes;
use gapless_core::error::StoreError;
use gapless_core::types::{SeqNum, SeqRange, SessionKey, Timestamp};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const JOURNAL_FILE: &str = "journal.log";
const INBOUND_FILE: &str = "inbound.log";
const RECORD_FILE: &str = "session.json";
const JOURNAL_MAGIC: &[u8] = b"GPLS1\0";

/// Frame header: seq + timestamp + payload length.
const FRAME_HEADER_LEN: u64 = 8 + 8 + 4;
/// Trailing CRC32 of the payload.
const FRAME_TRAILER_LEN: u64 = 4;

/// Location of one frame's payload within the journal.
#[derive(Debug, Clone, Copy)]
struct FrameLoc {
    /// Offset of the frame start.
    offset: u64,
    /// Payload length in bytes.
    len: u32,
    /// Timestamp recorded in the frame header.
    timestamp_nanos: u64,
}

/// Open state for one session's directory.
#[derive(Debug)]
struct SessionFiles {
    dir: PathBuf,
    /// Append handle plus the current journal end offset.
    writer: Mutex<(File, u64)>,
    /// Lazily opened inbound journal append handle.
    inbound: Mutex<Option<File>>,
    /// Sequence index over the journal.
    index: RwLock<BTreeMap<u64, FrameLoc>>,
}

/// Durable file-backed message store.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    sessions: RwLock<HashMap<SessionKey, Arc<SessionFiles>>>,
}

impl FileStore {
    /// Opens (or creates) a store rooted at `root`.
    ///
    /// # Errors
    /// Returns `StoreError` if the root directory cannot be created.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    /// Returns the directory name used for a session.
    fn session_dir_name(key: &SessionKey) -> String {
        let mut name = format!("{}-{}-{}", key.begin_string, key.sender, key.target);
        if let Some(sub) = &key.sender_sub {
            name.push('-');
            name.push_str(sub);
        }
        if let Some(sub) = &key.target_sub {
            name.push('-');
            name.push_str(sub);
        }
        name.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }

    /// Gets or opens the per-session files, scanning the journal on first
    /// access to rebuild the index.
    fn files(&self, key: &SessionKey) -> Result<Arc<SessionFiles>, StoreError> {
        if let Some(files) = self.sessions.read().get(key) {
            return Ok(Arc::clone(files));
        }

        let mut sessions = self.sessions.write();
        if let Some(files) = sessions.get(key) {
            return Ok(Arc::clone(files));
        }

        let dir = self.root.join(Self::session_dir_name(key));
        fs::create_dir_all(&dir)?;
        let journal_path = dir.join(JOURNAL_FILE);

        let mut writer = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&journal_path)?;
        if writer.metadata()?.len() < JOURNAL_MAGIC.len() as u64 {
            writer.set_len(0)?;
            writer.write_all(JOURNAL_MAGIC)?;
            writer.sync_data()?;
        }

        let (index, end) = Self::scan_journal(&journal_path)?;
        // Drop a torn tail so the next append starts on a frame boundary.
        let disk_len = writer.metadata()?.len();
        if disk_len > end {
            tracing::warn!(
                path = %journal_path.display(),
                valid = end,
                total = disk_len,
                "truncating torn journal tail"
            );
            writer.set_len(end)?;
            writer.sync_data()?;
        }

        let files = Arc::new(SessionFiles {
            dir,
            writer: Mutex::new((writer, end)),
            inbound: Mutex::new(None),
            index: RwLock::new(index),
        });
        sessions.insert(key.clone(), Arc::clone(&files));
        Ok(files)
    }

    /// Scans a journal file, returning the rebuilt index and the offset of
    /// the last complete frame's end.
    fn scan_journal(path: &Path) -> Result<(BTreeMap<u64, FrameLoc>, u64), StoreError> {
        let mut reader = File::open(path)?;
        let mut magic = [0u8; JOURNAL_MAGIC.len()];
        if let Err(err) = reader.read_exact(&mut magic) {
            return if err.kind() == std::io::ErrorKind::UnexpectedEof {
                // Empty or torn before the magic; treat as fresh.
                Ok((BTreeMap::new(), JOURNAL_MAGIC.len() as u64))
            } else {
                Err(err.into())
            };
        }
        if magic != JOURNAL_MAGIC {
            return Err(StoreError::Corrupted {
                reason: "bad journal magic".to_string(),
            });
        }

        let mut index = BTreeMap::new();
        let mut offset = JOURNAL_MAGIC.len() as u64;
        loop {
            let mut header = [0u8; FRAME_HEADER_LEN as usize];
            match reader.read_exact(&mut header) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(err) => return Err(err.into()),
            }
            let seq = u64::from_le_bytes(header[0..8].try_into().unwrap_or_default());
            let timestamp_nanos = u64::from_le_bytes(header[8..16].try_into().unwrap_or_default());
            let len = u32::from_le_bytes(header[16..20].try_into().unwrap_or_default());

            let mut payload = vec![0u8; len as usize];
            let mut crc_buf = [0u8; 4];
            if reader.read_exact(&mut payload).is_err() || reader.read_exact(&mut crc_buf).is_err()
            {
                break;
            }
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&payload);
            if hasher.finalize() != u32::from_le_bytes(crc_buf) {
                break;
            }

            index.insert(
                seq,
                FrameLoc {
                    offset,
                    len,
                    timestamp_nanos,
                },
            );
            offset += FRAME_HEADER_LEN + u64::from(len) + FRAME_TRAILER_LEN;
        }
        Ok((index, offset))
    }

    /// Appends one frame to an open file, returning the frame's byte length.
    fn write_frame(file: &mut File, record: &LogRecord) -> Result<u64, StoreError> {
        let payload = record.bytes.as_ref();
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(payload);
        let crc = hasher.finalize();

        let mut frame =
            Vec::with_capacity(FRAME_HEADER_LEN as usize + payload.len() + FRAME_TRAILER_LEN as usize);
        frame.extend_from_slice(&record.seq.value().to_le_bytes());
        frame.extend_from_slice(&record.timestamp.as_nanos().to_le_bytes());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(payload);
        frame.extend_from_slice(&crc.to_le_bytes());

        file.write_all(&frame)?;
        file.sync_data()?;
        Ok(frame.len() as u64)
    }

    /// Reads one frame's payload through an independent handle.
    fn read_frame(path: &Path, loc: FrameLoc) -> Result<Bytes, StoreError> {
        let mut reader = File::open(path)?;
        reader.seek(SeekFrom::Start(loc.offset + FRAME_HEADER_LEN))?;
        let mut payload = vec![0u8; loc.len as usize];
        reader.read_exact(&mut payload)?;

        let mut crc_buf = [0u8; 4];
        reader.read_exact(&mut crc_buf)?;
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&payload);
        if hasher.finalize() != u32::from_le_bytes(crc_buf) {
            return Err(StoreError::Corrupted {
                reason: format!("crc mismatch at offset {}", loc.offset),
            });
        }
        Ok(Bytes::from(payload))
    }
}

#[async_trait]
impl MessageStore for FileStore {
    async fn append(&self, key: &SessionKey, record: LogRecord) -> Result<(), StoreError> {
        let files = self.files(key)?;
        let mut writer = files.writer.lock();
        let offset = writer.1;
        let frame_len = Self::write_frame(&mut writer.0, &record)?;
        writer.1 += frame_len;
        drop(writer);

        files.index.write().insert(
            record.seq.value(),
            FrameLoc {
                offset,
                len: record.bytes.len() as u32,
                timestamp_nanos: record.timestamp.as_nanos(),
            },
        );
        Ok(())
    }

    async fn read_range(
        &self,
        key: &SessionKey,
        range: SeqRange,
    ) -> Result<Vec<LogRecord>, StoreError> {
        let files = self.files(key)?;
        let locs: Vec<(u64, FrameLoc)> = files
            .index
            .read()
            .range(range.begin..=range.end)
            .map(|(seq, loc)| (*seq, *loc))
            .collect();

        let path = files.dir.join(JOURNAL_FILE);
        let mut records = Vec::with_capacity(locs.len());
        for (seq, loc) in locs {
            let bytes = Self::read_frame(&path, loc)?;
            records.push(LogRecord::new(
                SeqNum::new(seq),
                bytes,
                Timestamp::from_nanos(loc.timestamp_nanos),
            ));
        }
        Ok(records)
    }

    async fn exists(&self, key: &SessionKey, seq: SeqNum) -> Result<bool, StoreError> {
        let files = self.files(key)?;
        Ok(files.index.read().contains_key(&seq.value()))
    }

    async fn save_session(&self, record: &SessionRecord) -> Result<(), StoreError> {
        let files = self.files(&record.key)?;
        let json = serde_json::to_vec_pretty(record)
            .map_err(|err| StoreError::Serialization(err.to_string()))?;

        // Write-then-rename keeps the record atomic under crashes.
        let tmp = files.dir.join(format!("{RECORD_FILE}.tmp"));
        let path = files.dir.join(RECORD_FILE);
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&json)?;
            file.sync_data()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    async fn load_session(&self, key: &SessionKey) -> Result<Option<SessionRecord>, StoreError> {
        let files = self.files(key)?;
        let path = files.dir.join(RECORD_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let json = fs::read(&path)?;
        serde_json::from_slice(&json)
            .map(Some)
            .map_err(|err| StoreError::Serialization(err.to_string()))
    }

    async fn reset(&self, key: &SessionKey) -> Result<(), StoreError> {
        let files = self.files(key)?;
        let mut writer = files.writer.lock();
        writer.0.set_len(0)?;
        writer.0.write_all(JOURNAL_MAGIC)?;
        writer.0.sync_data()?;
        writer.1 = JOURNAL_MAGIC.len() as u64;
        drop(writer);

        files.index.write().clear();

        let record_path = files.dir.join(RECORD_FILE);
        if record_path.exists() {
            fs::remove_file(&record_path)?;
        }
        let inbound_path = files.dir.join(INBOUND_FILE);
        let mut inbound = files.inbound.lock();
        if let Some(file) = inbound.as_mut() {
            file.set_len(0)?;
        } else if inbound_path.exists() {
            fs::remove_file(&inbound_path)?;
        }
        Ok(())
    }

    async fn journal_inbound(&self, key: &SessionKey, record: LogRecord) -> Result<(), StoreError> {
        let files = self.files(key)?;
        let mut inbound = files.inbound.lock();
        if inbound.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(files.dir.join(INBOUND_FILE))?;
            *inbound = Some(file);
        }
        if let Some(file) = inbound.as_mut() {
            Self::write_frame(file, &record)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gapless_core::types::CompId;

    fn test_key() -> SessionKey {
        SessionKey::new(
            "FIX.4.4",
            CompId::new("SENDER").unwrap(),
            CompId::new("TARGET").unwrap(),
        )
    }

    fn record(seq: u64, payload: &str) -> LogRecord {
        LogRecord::new(
            SeqNum::new(seq),
            Bytes::from(payload.to_string()),
            Timestamp::from_millis(seq * 1000),
        )
    }

    #[tokio::test]
    async fn test_append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let key = test_key();

        store.append(&key, record(1, "first")).await.unwrap();
        store.append(&key, record(2, "second")).await.unwrap();

        let found = store.read_range(&key, SeqRange::new(1, 2)).await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].bytes.as_ref(), b"first");
        assert_eq!(found[1].bytes.as_ref(), b"second");
        assert_eq!(found[1].timestamp, Timestamp::from_millis(2000));
    }

    #[tokio::test]
    async fn test_reopen_recovers_index() {
        let dir = tempfile::tempdir().unwrap();
        let key = test_key();

        {
            let store = FileStore::open(dir.path()).unwrap();
            for seq in 1..=5 {
                store
                    .append(&key, record(seq, &format!("msg-{seq}")))
                    .await
                    .unwrap();
            }
        }

        let store = FileStore::open(dir.path()).unwrap();
        let found = store.read_range(&key, SeqRange::new(2, 4)).await.unwrap();
        assert_eq!(
            found.iter().map(|r| r.seq.value()).collect::<Vec<_>>(),
            vec![2, 3, 4]
        );
        assert!(store.exists(&key, SeqNum::new(5)).await.unwrap());
    }

    #[tokio::test]
    async fn test_torn_tail_truncated_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let key = test_key();

        {
            let store = FileStore::open(dir.path()).unwrap();
            store.append(&key, record(1, "complete")).await.unwrap();
            store.append(&key, record(2, "also-complete")).await.unwrap();
        }

        // Simulate a crash mid-append: chop bytes off the final frame.
        let journal = dir
            .path()
            .join(FileStore::session_dir_name(&key))
            .join(JOURNAL_FILE);
        let len = fs::metadata(&journal).unwrap().len();
        let file = OpenOptions::new().write(true).open(&journal).unwrap();
        file.set_len(len - 5).unwrap();

        let store = FileStore::open(dir.path()).unwrap();
        let found = store.read_range(&key, SeqRange::new(1, 2)).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].seq.value(), 1);

        // New appends land cleanly after the truncated tail.
        store.append(&key, record(2, "rewritten")).await.unwrap();
        let found = store.read_range(&key, SeqRange::new(2, 2)).await.unwrap();
        assert_eq!(found[0].bytes.as_ref(), b"rewritten");
    }

    #[tokio::test]
    async fn test_session_record_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let key = test_key();

        {
            let store = FileStore::open(dir.path()).unwrap();
            store
                .save_session(&SessionRecord {
                    key: key.clone(),
                    next_outbound: 51,
                    next_inbound: 49,
                    state: "Active".to_string(),
                })
                .await
                .unwrap();
        }

        let store = FileStore::open(dir.path()).unwrap();
        let loaded = store.load_session(&key).await.unwrap().unwrap();
        assert_eq!(loaded.next_outbound, 51);
        assert_eq!(loaded.next_inbound, 49);
    }

    #[tokio::test]
    async fn test_reset_clears_everything() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let key = test_key();

        store.append(&key, record(1, "msg")).await.unwrap();
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
        assert!(store.read_range(&key, SeqRange::new(1, 10)).await.unwrap().is_empty());
        assert!(store.load_session(&key).await.unwrap().is_none());

        // Still usable after reset.
        store.append(&key, record(1, "fresh")).await.unwrap();
        let found = store.read_range(&key, SeqRange::new(1, 1)).await.unwrap();
        assert_eq!(found[0].bytes.as_ref(), b"fresh");
    }

    #[tokio::test]
    async fn test_inbound_journal_separate_from_replay() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let key = test_key();

        store.journal_inbound(&key, record(9, "inbound")).await.unwrap();
        assert!(store.read_range(&key, SeqRange::new(9, 9)).await.unwrap().is_empty());

        let inbound = dir
            .path()
            .join(FileStore::session_dir_name(&key))
            .join(INBOUND_FILE);
        assert!(inbound.exists());
    }
}
