//! On-disk journal for the mutation queue.
//!
//! Every queue transition is appended as a length-prefixed, CRC32-checked
//! MessagePack entry. On open the journal is replayed to rebuild the queue.
//! A torn entry at the tail (crash mid-write) ends the replay; everything
//! before it is kept and the torn bytes are cut off before new appends.

use super::record::MutationRecord;
use crate::clock::Clock;
use crate::command::MutationCommand;
use crate::error::{PipelineError, RemoteError, Result};
use crate::types::{MutationId, MutationStatus, Timestamp};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

/// Magic bytes for the journal file.
const JOURNAL_MAGIC: &[u8; 4] = b"MQJ\0";

/// Current journal format version.
const JOURNAL_VERSION: u8 = 1;

/// Largest entry accepted on replay.
const MAX_ENTRY_BYTES: usize = 16 * 1024 * 1024;

/// Magic plus version byte.
const HEADER_LEN: u64 = 5;

/// Length prefix plus trailing checksum.
const ENTRY_OVERHEAD: u64 = 8;

/// A queue transition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum JournalOp {
    /// Written first after a rewrite so ids keep growing.
    Checkpoint { next_id: u64 },
    Enqueued(MutationRecord),
    Updated {
        id: MutationId,
        status: MutationStatus,
        retry_count: u32,
        last_error: Option<RemoteError>,
        /// Present when the command itself was replaced.
        payload: Option<MutationCommand>,
    },
    Removed(MutationId),
}

/// A single journal entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub seq: u64,
    pub timestamp: Timestamp,
    pub op: JournalOp,
}

/// State rebuilt from a journal.
#[derive(Debug, Default)]
pub struct Replayed {
    pub entries: BTreeMap<MutationId, MutationRecord>,
    pub next_id: u64,
    /// Entries read (live or not), used to decide on compaction.
    pub ops: usize,
}

/// Append-only journal file, exclusively locked while open.
pub struct QueueJournal {
    path: PathBuf,
    clock: Arc<dyn Clock>,
    _lock_file: File,
    writer: BufWriter<File>,
    next_seq: u64,
    #[cfg(test)]
    fail_appends_after: Option<usize>,
}

impl QueueJournal {
    /// Open or create a journal and replay its contents.
    pub fn open(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<(Self, Replayed)> {
        let path = path.as_ref().to_path_buf();
        let lock_file = Self::acquire_lock(&path)?;

        let replayed = if path.exists() {
            let (replayed, valid_len) = Self::replay(&path)?;
            Self::truncate_tail(&path, valid_len)?;
            replayed
        } else {
            Self::write_header(&mut File::create(&path)?)?;
            Replayed {
                next_id: 1,
                ..Default::default()
            }
        };

        let writer = BufWriter::new(OpenOptions::new().append(true).open(&path)?);
        Ok((
            Self {
                path,
                clock,
                _lock_file: lock_file,
                writer,
                next_seq: replayed.ops as u64 + 1,
                #[cfg(test)]
                fail_appends_after: None,
            },
            replayed,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one transition and flush it to disk.
    pub fn append(&mut self, op: JournalOp) -> Result<()> {
        #[cfg(test)]
        if let Some(remaining) = self.fail_appends_after.as_mut() {
            if *remaining == 0 {
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "journal write refused").into());
            }
            *remaining -= 1;
        }

        let entry = JournalEntry {
            seq: self.next_seq,
            timestamp: self.clock.now(),
            op,
        };
        self.next_seq += 1;

        Self::write_entry(&mut self.writer, &entry)?;
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }

    /// Replace the journal with a checkpoint plus the live entries.
    ///
    /// Written to a side file and renamed over the journal, so a crash
    /// leaves either the old or the new file intact.
    pub fn rewrite<'a>(
        &mut self,
        next_id: u64,
        live: impl Iterator<Item = &'a MutationRecord>,
    ) -> Result<()> {
        let tmp_path = self.path.with_extension("compact");
        {
            let mut tmp = BufWriter::new(File::create(&tmp_path)?);
            tmp.write_all(JOURNAL_MAGIC)?;
            tmp.write_all(&[JOURNAL_VERSION])?;

            let mut seq = 1;
            let now = self.clock.now();
            Self::write_entry(
                &mut tmp,
                &JournalEntry {
                    seq,
                    timestamp: now,
                    op: JournalOp::Checkpoint { next_id },
                },
            )?;
            for record in live {
                seq += 1;
                Self::write_entry(
                    &mut tmp,
                    &JournalEntry {
                        seq,
                        timestamp: now,
                        op: JournalOp::Enqueued(record.clone()),
                    },
                )?;
            }
            tmp.flush()?;
            tmp.get_ref().sync_all()?;
            self.next_seq = seq + 1;
        }

        fs::rename(&tmp_path, &self.path)?;
        self.writer = BufWriter::new(OpenOptions::new().append(true).open(&self.path)?);
        Ok(())
    }

    /// Let `remaining` more appends through, then fail every append.
    #[cfg(test)]
    pub(crate) fn fail_appends_after(&mut self, remaining: Option<usize>) {
        self.fail_appends_after = remaining;
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.with_extension("lock"))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| PipelineError::Locked)?;
        Ok(lock_file)
    }

    fn write_header(file: &mut File) -> Result<()> {
        file.write_all(JOURNAL_MAGIC)?;
        file.write_all(&[JOURNAL_VERSION])?;
        file.sync_all()?;
        Ok(())
    }

    /// Cut off anything past the last readable entry.
    fn truncate_tail(path: &Path, valid_len: u64) -> Result<()> {
        let file = OpenOptions::new().write(true).open(path)?;
        let file_len = file.metadata()?.len();
        if file_len > valid_len {
            warn!(
                path = %path.display(),
                discarded = file_len - valid_len,
                "truncating torn journal tail"
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        Ok(())
    }

    /// Rebuild state; also returns the byte length of the readable prefix.
    fn replay(path: &Path) -> Result<(Replayed, u64)> {
        let mut reader = BufReader::new(File::open(path)?);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != JOURNAL_MAGIC {
            return Err(PipelineError::InvalidFormat("Invalid journal magic".into()));
        }

        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != JOURNAL_VERSION {
            return Err(PipelineError::InvalidFormat(format!(
                "Unsupported journal version: {}",
                version[0]
            )));
        }

        let mut replayed = Replayed {
            next_id: 1,
            ..Default::default()
        };
        let mut valid_len = HEADER_LEN;
        loop {
            let (entry, len) = match Self::read_entry(&mut reader) {
                Ok(Some(read)) => read,
                Ok(None) => break,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "journal tail unreadable, stopping replay");
                    break;
                }
            };
            valid_len += ENTRY_OVERHEAD + len as u64;
            replayed.ops += 1;
            apply(&mut replayed, entry.op);
        }
        Ok((replayed, valid_len))
    }

    fn write_entry<W: Write>(writer: &mut W, entry: &JournalEntry) -> Result<()> {
        let encoded = rmp_serde::to_vec_named(entry)?;

        let len = encoded.len() as u32;
        writer.write_all(&len.to_le_bytes())?;
        writer.write_all(&encoded)?;

        let checksum = crc32fast::hash(&encoded);
        writer.write_all(&checksum.to_le_bytes())?;

        Ok(())
    }

    /// Read the next entry and its encoded length; `None` at end of file.
    fn read_entry<R: Read>(reader: &mut R) -> Result<Option<(JournalEntry, usize)>> {
        let mut len_bytes = [0u8; 4];
        match reader.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_ENTRY_BYTES {
            return Err(PipelineError::Corruption("journal entry too large".into()));
        }

        let mut encoded = vec![0u8; len];
        reader.read_exact(&mut encoded)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        if u32::from_le_bytes(checksum_bytes) != crc32fast::hash(&encoded) {
            return Err(PipelineError::Corruption("journal checksum mismatch".into()));
        }

        Ok(Some((rmp_serde::from_slice(&encoded)?, len)))
    }
}

fn apply(replayed: &mut Replayed, op: JournalOp) {
    match op {
        JournalOp::Checkpoint { next_id } => {
            replayed.next_id = replayed.next_id.max(next_id);
        }
        JournalOp::Enqueued(record) => {
            replayed.next_id = replayed.next_id.max(record.id.0 + 1);
            replayed.entries.insert(record.id, record);
        }
        JournalOp::Updated {
            id,
            status,
            retry_count,
            last_error,
            payload,
        } => {
            if let Some(record) = replayed.entries.get_mut(&id) {
                record.status = status;
                record.retry_count = retry_count;
                record.last_error = last_error;
                if let Some(payload) = payload {
                    record.kind = payload.kind();
                    record.entity_type = payload.entity_type().to_string();
                    record.payload = payload;
                }
            }
        }
        JournalOp::Removed(id) => {
            replayed.entries.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::ErrorKind;
    use crate::types::{Actor, Fields};
    use tempfile::TempDir;

    fn clock() -> Arc<dyn Clock> {
        Arc::new(ManualClock::new(Timestamp(7_000)))
    }

    fn open(path: &Path) -> Result<(QueueJournal, Replayed)> {
        QueueJournal::open(path, clock())
    }

    fn record(id: u64) -> MutationRecord {
        MutationRecord::new(
            MutationId(id),
            Actor::new("u-1", "Guru"),
            MutationCommand::create("students", format!("s-{}", id), Fields::new()),
            Timestamp(id as i64),
        )
    }

    #[test]
    fn test_replay_rebuilds_entries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.journal");

        {
            let (mut journal, replayed) = open(&path).unwrap();
            assert!(replayed.entries.is_empty());
            journal.append(JournalOp::Enqueued(record(1))).unwrap();
            journal.append(JournalOp::Enqueued(record(2))).unwrap();
            journal
                .append(JournalOp::Updated {
                    id: MutationId(2),
                    status: MutationStatus::Failed,
                    retry_count: 0,
                    last_error: Some(RemoteError::network("reset")),
                    payload: None,
                })
                .unwrap();
            journal.append(JournalOp::Removed(MutationId(1))).unwrap();
        }

        let (_journal, replayed) = open(&path).unwrap();
        assert_eq!(replayed.ops, 4);
        assert_eq!(replayed.next_id, 3);
        assert_eq!(replayed.entries.len(), 1);
        let entry = &replayed.entries[&MutationId(2)];
        assert_eq!(entry.status, MutationStatus::Failed);
        assert_eq!(entry.last_error.as_ref().unwrap().kind, ErrorKind::Network);
    }

    #[test]
    fn test_second_open_is_locked() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.journal");

        let _first = open(&path).unwrap();
        assert!(matches!(open(&path), Err(PipelineError::Locked)));
    }

    #[test]
    fn test_torn_tail_is_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.journal");

        {
            let (mut journal, _) = open(&path).unwrap();
            journal.append(JournalOp::Enqueued(record(1))).unwrap();
        }
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[42, 0, 0, 0, 1, 2, 3]).unwrap();
        }

        let (_journal, replayed) = open(&path).unwrap();
        assert_eq!(replayed.entries.len(), 1);
    }

    #[test]
    fn test_appends_after_torn_tail_survive() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.journal");

        {
            let (mut journal, _) = open(&path).unwrap();
            journal.append(JournalOp::Enqueued(record(1))).unwrap();
        }
        let clean_len = fs::metadata(&path).unwrap().len();
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[42, 0, 0, 0, 1, 2]).unwrap();
        }
        {
            let (mut journal, replayed) = open(&path).unwrap();
            assert_eq!(replayed.entries.len(), 1);
            assert_eq!(fs::metadata(&path).unwrap().len(), clean_len);
            journal.append(JournalOp::Enqueued(record(2))).unwrap();
        }

        let (_journal, replayed) = open(&path).unwrap();
        assert_eq!(replayed.ops, 2);
        assert!(replayed.entries.contains_key(&MutationId(2)));
    }

    #[test]
    fn test_partial_length_prefix_is_cut() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.journal");

        {
            let (mut journal, _) = open(&path).unwrap();
            journal.append(JournalOp::Enqueued(record(1))).unwrap();
        }
        let clean_len = fs::metadata(&path).unwrap().len();
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[9, 0]).unwrap();
        }

        let _ = open(&path).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), clean_len);
    }

    #[test]
    fn test_entries_carry_injected_time() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.journal");

        {
            let (mut journal, _) = open(&path).unwrap();
            journal.append(JournalOp::Enqueued(record(1))).unwrap();
        }

        let mut reader = BufReader::new(File::open(&path).unwrap());
        let mut header = [0u8; HEADER_LEN as usize];
        reader.read_exact(&mut header).unwrap();
        let (entry, _) = QueueJournal::read_entry(&mut reader).unwrap().unwrap();
        assert_eq!(entry.timestamp, Timestamp(7_000));
    }

    #[test]
    fn test_rewrite_keeps_live_entries_and_id_floor() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.journal");

        {
            let (mut journal, _) = open(&path).unwrap();
            for id in 1..=5 {
                journal.append(JournalOp::Enqueued(record(id))).unwrap();
            }
            let live = [record(2)];
            journal.rewrite(6, live.iter()).unwrap();
        }

        let (_journal, replayed) = open(&path).unwrap();
        assert_eq!(replayed.ops, 2);
        assert_eq!(replayed.next_id, 6);
        assert_eq!(replayed.entries.keys().copied().collect::<Vec<_>>(), vec![MutationId(2)]);
    }

    #[test]
    fn test_bad_magic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.journal");
        fs::write(&path, b"NOPE\x01").unwrap();

        assert!(matches!(
            open(&path),
            Err(PipelineError::InvalidFormat(_))
        ));
    }
}
