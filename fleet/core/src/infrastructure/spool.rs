// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Command Spool
//!
//! Durable FIFO of guaranteed commands that have not been acknowledged yet.
//!
//! ## File format
//!
//! The spool file is an append-only log of framed records:
//!
//! ```text
//! ┌────────────┬───────────────┬──────────────────┬─────────────────┐
//! │ magic u32  │ hdr_len u16   │ RecordHeader     │ payload         │
//! │ (LE)       │ (LE)          │ (bincode)        │ (hdr.payload_len)│
//! └────────────┴───────────────┴──────────────────┴─────────────────┘
//! ```
//!
//! An `Entry` record carries a serialized command; an `Ack` record carries no
//! payload and cancels the entry with the same sequence. A `Mark` record only
//! carries the sequence high-water mark written by compaction and never
//! cancels an entry. Replay stops at the
//! first frame that is incomplete or fails its checksum and truncates the file
//! there, so a write torn by a crash is discarded instead of replayed.
//!
//! Acked records stay in the file until compaction rewrites the live entries
//! into a fresh file and renames it over the log.

use bytes::{Buf, BufMut, BytesMut};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::domain::node_config::SpoolConfig;
use crate::domain::spool::{Sequence, Spool, SpoolEntry, SpoolError, SpoolUsage};

const MAGIC: u32 = 0x5445_5350; // "TESP"
const PREFIX_LEN: usize = 4 + 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum RecordKind {
    Entry,
    Ack,
    Mark,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RecordHeader {
    kind: RecordKind,
    sequence: Sequence,
    enqueued_at_ms: i64,
    payload_len: u32,
    checksum: u32,
}

fn checksum(kind: RecordKind, sequence: Sequence, payload: &[u8]) -> u32 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[kind as u8]);
    hasher.update(&sequence.to_le_bytes());
    hasher.update(payload);
    let digest = hasher.finalize();
    let bytes = digest.as_bytes();
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn encode_record(kind: RecordKind, sequence: Sequence, enqueued_at: DateTime<Utc>, payload: &[u8]) -> Result<BytesMut, SpoolError> {
    let header = RecordHeader {
        kind,
        sequence,
        enqueued_at_ms: enqueued_at.timestamp_millis(),
        payload_len: u32::try_from(payload.len())
            .map_err(|_| SpoolError::Encoding(format!("payload of {} bytes is too large", payload.len())))?,
        checksum: checksum(kind, sequence, payload),
    };
    let header_bytes = bincode::serialize(&header).map_err(|e| SpoolError::Encoding(e.to_string()))?;
    let header_len =
        u16::try_from(header_bytes.len()).map_err(|_| SpoolError::Encoding("record header too large".to_string()))?;

    let mut buf = BytesMut::with_capacity(PREFIX_LEN + header_bytes.len() + payload.len());
    buf.put_u32_le(MAGIC);
    buf.put_u16_le(header_len);
    buf.put_slice(&header_bytes);
    buf.put_slice(payload);
    Ok(buf)
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

/// Result of scanning a spool log.
#[derive(Debug, Default)]
struct ScanResult {
    live: BTreeMap<Sequence, SpoolEntry>,
    max_sequence: Sequence,
    entry_records: usize,
    ack_records: usize,
    /// Offset just past the last valid frame.
    valid_len: u64,
    /// Why scanning stopped early, if it did.
    stopped: Option<SpoolError>,
}

fn scan(bytes: &[u8]) -> ScanResult {
    let mut result = ScanResult::default();
    let mut cursor = bytes;

    while !cursor.is_empty() {
        let offset = (bytes.len() - cursor.len()) as u64;
        match read_frame(&mut cursor) {
            Ok((header, payload)) => {
                result.max_sequence = result.max_sequence.max(header.sequence);
                match header.kind {
                    RecordKind::Entry => {
                        result.entry_records += 1;
                        result.live.insert(
                            header.sequence,
                            SpoolEntry {
                                sequence: header.sequence,
                                serialized_command: payload,
                                enqueued_at: millis_to_datetime(header.enqueued_at_ms),
                            },
                        );
                    }
                    RecordKind::Ack => {
                        result.ack_records += 1;
                        result.live.remove(&header.sequence);
                    }
                    RecordKind::Mark => {}
                }
                result.valid_len = (bytes.len() - cursor.len()) as u64;
            }
            Err(reason) => {
                result.stopped = Some(SpoolError::Corrupt { offset, reason });
                break;
            }
        }
    }
    result
}

fn read_frame(cursor: &mut &[u8]) -> Result<(RecordHeader, Vec<u8>), String> {
    if cursor.remaining() < PREFIX_LEN {
        return Err("truncated frame prefix".to_string());
    }
    let magic = cursor.get_u32_le();
    if magic != MAGIC {
        return Err(format!("bad magic {:#010x}", magic));
    }
    let header_len = cursor.get_u16_le() as usize;
    if cursor.remaining() < header_len {
        return Err("truncated record header".to_string());
    }
    let header: RecordHeader =
        bincode::deserialize(&cursor[..header_len]).map_err(|e| format!("undecodable header: {}", e))?;
    cursor.advance(header_len);

    let payload_len = header.payload_len as usize;
    if cursor.remaining() < payload_len {
        return Err("truncated payload".to_string());
    }
    let payload = cursor[..payload_len].to_vec();
    cursor.advance(payload_len);

    if checksum(header.kind, header.sequence, &payload) != header.checksum {
        return Err(format!("checksum mismatch for sequence {}", header.sequence));
    }
    Ok((header, payload))
}

struct FileSpoolState {
    file: File,
    live: BTreeMap<Sequence, SpoolEntry>,
    next_sequence: Sequence,
    live_bytes: u64,
    file_bytes: u64,
    /// Makes the next write stop after this many bytes and fail.
    #[cfg(test)]
    fail_write_after: Option<usize>,
}

/// Crash-safe spool backed by a single append-only file.
pub struct FileSpool {
    path: PathBuf,
    max_entries: usize,
    max_bytes: u64,
    compact_threshold_percent: u8,
    fsync: bool,
    state: Mutex<FileSpoolState>,
}

impl FileSpool {
    /// Open (or create) the spool file and recover its live entries.
    pub fn open(config: &SpoolConfig) -> Result<Self, SpoolError> {
        let path = config.path.clone();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new().read(true).append(true).create(true).open(&path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let scanned = scan(&bytes);
        if let Some(reason) = &scanned.stopped {
            warn!(
                path = %path.display(),
                discarded_bytes = bytes.len() as u64 - scanned.valid_len,
                "Discarding damaged spool tail: {}",
                reason
            );
            file.set_len(scanned.valid_len)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::End(0))?;

        let live_bytes = scanned.live.values().map(|e| e.serialized_command.len() as u64).sum();
        info!(
            path = %path.display(),
            live_entries = scanned.live.len(),
            next_sequence = scanned.max_sequence + 1,
            "Spool opened"
        );

        Ok(Self {
            path,
            max_entries: config.max_entries,
            max_bytes: config.max_bytes,
            compact_threshold_percent: config.compact_threshold_percent,
            fsync: config.fsync,
            state: Mutex::new(FileSpoolState {
                file,
                live: scanned.live,
                next_sequence: scanned.max_sequence + 1,
                live_bytes,
                file_bytes: scanned.valid_len,
                #[cfg(test)]
                fail_write_after: None,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one frame. A failed write leaves no partial frame behind, so
    /// later records never sit after a torn one.
    fn write_record(&self, state: &mut FileSpoolState, record: &[u8]) -> Result<(), SpoolError> {
        if let Err(e) = self.write_frame(state, record) {
            let good_len = state.file_bytes;
            match state.file.set_len(good_len).and_then(|_| state.file.seek(SeekFrom::End(0))) {
                Ok(_) => warn!(path = %self.path.display(), good_len, "Spool write failed, partial frame removed: {}", e),
                Err(truncate) => warn!(
                    path = %self.path.display(),
                    good_len,
                    "Spool write failed and the partial frame could not be removed: {} ({})",
                    e,
                    truncate
                ),
            }
            return Err(e);
        }
        state.file_bytes += record.len() as u64;
        Ok(())
    }

    fn write_frame(&self, state: &mut FileSpoolState, record: &[u8]) -> Result<(), SpoolError> {
        #[cfg(test)]
        if let Some(limit) = state.fail_write_after.take() {
            state.file.write_all(&record[..limit.min(record.len())])?;
            return Err(SpoolError::Io(std::io::Error::other("injected write failure")));
        }
        state.file.write_all(record)?;
        if self.fsync {
            state.file.sync_data()?;
        }
        Ok(())
    }

    fn should_compact(&self, state: &FileSpoolState) -> bool {
        if state.file_bytes <= self.max_bytes {
            return false;
        }
        let dead = state.file_bytes.saturating_sub(state.live_bytes);
        dead * 100 >= state.file_bytes * u64::from(self.compact_threshold_percent)
    }

    /// Rewrite the log with only the live entries.
    pub fn compact(&self) -> Result<(), SpoolError> {
        let mut state = self.state.lock();
        self.compact_locked(&mut state)
    }

    fn compact_locked(&self, state: &mut FileSpoolState) -> Result<(), SpoolError> {
        let before = state.file_bytes;
        let tmp_path = self.path.with_extension("compact");

        let mut buf = BytesMut::new();
        // The high-water mark keeps sequences monotonic once acked entries are gone.
        let high_water = state.next_sequence - 1;
        if high_water > 0 {
            buf.extend_from_slice(&encode_record(RecordKind::Mark, high_water, Utc::now(), &[])?);
        }
        for entry in state.live.values() {
            buf.extend_from_slice(&encode_record(
                RecordKind::Entry,
                entry.sequence,
                entry.enqueued_at,
                &entry.serialized_command,
            )?);
        }
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(&buf)?;
            tmp.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;
        sync_parent_dir(&self.path)?;

        let mut file = OpenOptions::new().read(true).append(true).open(&self.path)?;
        file.seek(SeekFrom::End(0))?;
        state.file = file;
        state.file_bytes = buf.len() as u64;

        info!(
            path = %self.path.display(),
            before_bytes = before,
            after_bytes = state.file_bytes,
            live_entries = state.live.len(),
            "Spool compacted"
        );
        Ok(())
    }
}

/// Make a rename in `path`'s directory durable.
#[cfg(unix)]
fn sync_parent_dir(path: &Path) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    File::open(parent)?.sync_all()
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

impl Spool for FileSpool {
    fn append(&self, serialized_command: &[u8]) -> Result<Sequence, SpoolError> {
        let mut state = self.state.lock();
        if state.live.len() >= self.max_entries {
            return Err(SpoolError::Capacity(format!("{} entries (max {})", state.live.len(), self.max_entries)));
        }
        let len = serialized_command.len() as u64;
        if state.live_bytes + len > self.max_bytes {
            return Err(SpoolError::Capacity(format!(
                "{} live bytes + {} (max {})",
                state.live_bytes, len, self.max_bytes
            )));
        }

        let sequence = state.next_sequence;
        let enqueued_at = Utc::now();
        let record = encode_record(RecordKind::Entry, sequence, enqueued_at, serialized_command)?;
        self.write_record(&mut state, &record)?;

        state.next_sequence += 1;
        state.live_bytes += len;
        state.live.insert(
            sequence,
            SpoolEntry {
                sequence,
                serialized_command: serialized_command.to_vec(),
                enqueued_at,
            },
        );
        debug!(sequence, bytes = len, "Spooled entry");
        Ok(sequence)
    }

    fn peek_oldest(&self) -> Result<Option<SpoolEntry>, SpoolError> {
        Ok(self.state.lock().live.values().next().cloned())
    }

    fn remove(&self, sequence: Sequence) -> Result<(), SpoolError> {
        let mut state = self.state.lock();
        let Some(entry) = state.live.get(&sequence) else {
            return Ok(());
        };
        let len = entry.serialized_command.len() as u64;

        let record = encode_record(RecordKind::Ack, sequence, Utc::now(), &[])?;
        self.write_record(&mut state, &record)?;
        state.live.remove(&sequence);
        state.live_bytes = state.live_bytes.saturating_sub(len);
        debug!(sequence, "Acked spool entry");

        if self.should_compact(&state) {
            self.compact_locked(&mut state)?;
        }
        Ok(())
    }

    fn replay_all(&self) -> Result<Vec<SpoolEntry>, SpoolError> {
        Ok(self.state.lock().live.values().cloned().collect())
    }

    fn usage(&self) -> SpoolUsage {
        let state = self.state.lock();
        SpoolUsage {
            entries: state.live.len(),
            live_bytes: state.live_bytes,
            file_bytes: state.file_bytes,
            max_entries: self.max_entries,
            max_bytes: self.max_bytes,
        }
    }
}

struct MemorySpoolState {
    live: BTreeMap<Sequence, SpoolEntry>,
    next_sequence: Sequence,
    live_bytes: u64,
}

/// Volatile spool for nodes running with `spool.enabled: false` and for tests.
pub struct InMemorySpool {
    max_entries: usize,
    max_bytes: u64,
    state: Mutex<MemorySpoolState>,
}

impl InMemorySpool {
    pub fn new(max_entries: usize, max_bytes: u64) -> Self {
        Self {
            max_entries,
            max_bytes,
            state: Mutex::new(MemorySpoolState {
                live: BTreeMap::new(),
                next_sequence: 1,
                live_bytes: 0,
            }),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(usize::MAX, u64::MAX)
    }
}

impl Spool for InMemorySpool {
    fn append(&self, serialized_command: &[u8]) -> Result<Sequence, SpoolError> {
        let mut state = self.state.lock();
        let len = serialized_command.len() as u64;
        if state.live.len() >= self.max_entries || state.live_bytes.saturating_add(len) > self.max_bytes {
            return Err(SpoolError::Capacity(format!("{} entries in memory spool", state.live.len())));
        }
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.live_bytes += len;
        state.live.insert(
            sequence,
            SpoolEntry {
                sequence,
                serialized_command: serialized_command.to_vec(),
                enqueued_at: Utc::now(),
            },
        );
        Ok(sequence)
    }

    fn peek_oldest(&self) -> Result<Option<SpoolEntry>, SpoolError> {
        Ok(self.state.lock().live.values().next().cloned())
    }

    fn remove(&self, sequence: Sequence) -> Result<(), SpoolError> {
        let mut state = self.state.lock();
        if let Some(entry) = state.live.remove(&sequence) {
            state.live_bytes = state.live_bytes.saturating_sub(entry.serialized_command.len() as u64);
        }
        Ok(())
    }

    fn replay_all(&self) -> Result<Vec<SpoolEntry>, SpoolError> {
        Ok(self.state.lock().live.values().cloned().collect())
    }

    fn usage(&self) -> SpoolUsage {
        let state = self.state.lock();
        SpoolUsage {
            entries: state.live.len(),
            live_bytes: state.live_bytes,
            file_bytes: 0,
            max_entries: self.max_entries,
            max_bytes: self.max_bytes,
        }
    }
}

/// Offline view of a spool file, produced without modifying it.
#[derive(Debug, Clone, Serialize)]
pub struct SpoolDump {
    pub path: PathBuf,
    pub file_bytes: u64,
    pub entry_records: usize,
    pub ack_records: usize,
    pub damaged_tail_bytes: u64,
    pub live: Vec<SpoolEntry>,
}

/// Read a spool file for inspection. A damaged tail is reported, not repaired.
pub fn dump_file(path: impl AsRef<Path>) -> Result<SpoolDump, SpoolError> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)?;
    let scanned = scan(&bytes);
    Ok(SpoolDump {
        path: path.to_path_buf(),
        file_bytes: bytes.len() as u64,
        entry_records: scanned.entry_records,
        ack_records: scanned.ack_records,
        damaged_tail_bytes: bytes.len() as u64 - scanned.valid_len,
        live: scanned.live.into_values().collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &Path) -> SpoolConfig {
        SpoolConfig {
            path: dir.join("spool.dat"),
            fsync: false,
            ..SpoolConfig::default()
        }
    }

    #[test]
    fn test_replay_after_restart_returns_unremoved_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        {
            let spool = FileSpool::open(&cfg).unwrap();
            for payload in [b"c1".as_slice(), b"c2", b"c3", b"c4"] {
                spool.append(payload).unwrap();
            }
            spool.remove(2).unwrap();
        }

        let spool = FileSpool::open(&cfg).unwrap();
        let replayed: Vec<_> = spool.replay_all().unwrap().into_iter().map(|e| e.serialized_command).collect();
        assert_eq!(replayed, vec![b"c1".to_vec(), b"c3".to_vec(), b"c4".to_vec()]);
        assert_eq!(spool.append(b"c5").unwrap(), 5);
    }

    #[test]
    fn test_torn_trailing_record_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        {
            let spool = FileSpool::open(&cfg).unwrap();
            spool.append(b"first").unwrap();
            spool.append(b"second").unwrap();
        }
        let full_len = std::fs::metadata(&cfg.path).unwrap().len();

        // Simulate a crash halfway through writing a third record.
        let partial = encode_record(RecordKind::Entry, 3, Utc::now(), b"third-never-finished").unwrap();
        let mut file = OpenOptions::new().append(true).open(&cfg.path).unwrap();
        file.write_all(&partial[..partial.len() / 2]).unwrap();
        drop(file);

        let spool = FileSpool::open(&cfg).unwrap();
        assert_eq!(spool.len(), 2);
        assert_eq!(std::fs::metadata(&cfg.path).unwrap().len(), full_len);
        assert_eq!(spool.append(b"third").unwrap(), 3);
    }

    #[test]
    fn test_checksum_failure_truncates_from_damaged_frame() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        {
            let spool = FileSpool::open(&cfg).unwrap();
            spool.append(b"keep").unwrap();
            spool.append(b"flip").unwrap();
        }
        let mut bytes = std::fs::read(&cfg.path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&cfg.path, &bytes).unwrap();

        let dump = dump_file(&cfg.path).unwrap();
        assert_eq!(dump.live.len(), 1);
        assert!(dump.damaged_tail_bytes > 0);

        let spool = FileSpool::open(&cfg).unwrap();
        let replayed = spool.replay_all().unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].serialized_command, b"keep");
    }

    #[test]
    fn test_capacity_is_reported_not_evicted() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = SpoolConfig {
            max_entries: 2,
            ..config(dir.path())
        };
        let spool = FileSpool::open(&cfg).unwrap();
        spool.append(b"a").unwrap();
        spool.append(b"b").unwrap();
        assert!(matches!(spool.append(b"c"), Err(SpoolError::Capacity(_))));
        assert_eq!(spool.peek_oldest().unwrap().unwrap().serialized_command, b"a");
    }

    #[test]
    fn test_compaction_keeps_live_entries_and_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = SpoolConfig {
            max_bytes: 512,
            compact_threshold_percent: 50,
            ..config(dir.path())
        };
        let spool = FileSpool::open(&cfg).unwrap();
        let payload = vec![7u8; 64];
        for _ in 0..6 {
            let seq = spool.append(&payload).unwrap();
            spool.remove(seq).unwrap();
        }
        let keep = spool.append(b"survivor").unwrap();
        assert!(spool.usage().file_bytes < 512);
        drop(spool);

        let spool = FileSpool::open(&cfg).unwrap();
        let replayed = spool.replay_all().unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].sequence, keep);
        assert_eq!(spool.append(b"next").unwrap(), keep + 1);
    }

    #[test]
    fn test_sequence_survives_compaction_of_empty_spool() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        {
            let spool = FileSpool::open(&cfg).unwrap();
            let seq = spool.append(b"x").unwrap();
            spool.remove(seq).unwrap();
            spool.compact().unwrap();
        }
        let spool = FileSpool::open(&cfg).unwrap();
        assert!(spool.is_empty());
        assert_eq!(spool.append(b"y").unwrap(), 2);
    }

    #[test]
    fn test_compaction_keeps_newest_pending_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        {
            let spool = FileSpool::open(&cfg).unwrap();
            for _ in 0..6 {
                let seq = spool.append(b"done").unwrap();
                spool.remove(seq).unwrap();
            }
            assert_eq!(spool.append(b"pending-7").unwrap(), 7);
            assert_eq!(spool.append(b"pending-8").unwrap(), 8);
            spool.compact().unwrap();
        }

        let spool = FileSpool::open(&cfg).unwrap();
        let sequences: Vec<_> = spool.replay_all().unwrap().into_iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![7, 8]);
        assert_eq!(spool.append(b"next").unwrap(), 9);

        let dump = dump_file(&cfg.path).unwrap();
        assert_eq!(dump.ack_records, 0);
    }

    #[test]
    fn test_failed_write_leaves_no_partial_frame() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        {
            let spool = FileSpool::open(&cfg).unwrap();
            spool.append(b"before").unwrap();
            let good_len = spool.usage().file_bytes;

            spool.state.lock().fail_write_after = Some(10);
            assert!(matches!(spool.append(b"torn"), Err(SpoolError::Io(_))));
            assert_eq!(std::fs::metadata(&cfg.path).unwrap().len(), good_len);
            assert_eq!(spool.len(), 1);

            spool.append(b"after").unwrap();
            spool.remove(1).unwrap();
        }

        let dump = dump_file(&cfg.path).unwrap();
        assert_eq!(dump.damaged_tail_bytes, 0);
        let spool = FileSpool::open(&cfg).unwrap();
        let replayed = spool.replay_all().unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].serialized_command, b"after");
    }

    #[test]
    fn test_in_memory_spool_fifo_and_capacity() {
        let spool = InMemorySpool::new(2, 1024);
        let a = spool.append(b"a").unwrap();
        spool.append(b"b").unwrap();
        assert!(spool.append(b"c").is_err());
        spool.remove(a).unwrap();
        spool.remove(a).unwrap();
        assert_eq!(spool.peek_oldest().unwrap().unwrap().serialized_command, b"b");
    }
}
