//! Write-ahead journal and recovery
//!
//! Two rotating files hold the transactional log. A commit appends the whole
//! batch — begin, the ops in program order, commit — to the active file and
//! does not return before the commit record reached the OS (and stable
//! storage in fsync mode). A checkpoint record marks that everything
//! committed so far is durable in the btree; once the active file grows past
//! the switch threshold and the other file carries nothing newer than a
//! checkpoint, the files swap roles and the new active file is truncated.
//!
//! Record framing, little-endian:
//!
//! ```text
//! u32  total record length
//! u8   record type
//! u8   flags (payload compressed)
//! u16  database name
//! u64  transaction id
//! u64  log sequence number
//! ...  payload
//! u32  crc32 over everything after the length field
//! ```

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::compress::Codec;
use crate::error::{Error, ErrorKind, Result};
use crate::storage::encoding::{read_u16, read_u32, read_u64, write_u32, write_u64};
use crate::txn::{TxnOp, TxnOpKind};
use crate::types::{DbName, EraseFlags, InsertFlags, Lsn, PageId, TxnId};

const JOURNAL_MAGIC: [u8; 4] = *b"brwj";
const JOURNAL_VERSION: u32 = 1;
pub const JOURNAL_HEADER_SIZE: u64 = 32;

/// Fixed bytes around every record payload.
const RECORD_OVERHEAD: usize = 4 + 1 + 1 + 2 + 8 + 8 + 4;

const FLAG_COMPRESSED: u8 = 0x01;

/// Journal record types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    TxnBegin = 1,
    Insert = 2,
    Erase = 3,
    Commit = 4,
    Abort = 5,
    Checkpoint = 6,
    PageImage = 7,
}

impl RecordType {
    fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => RecordType::TxnBegin,
            2 => RecordType::Insert,
            3 => RecordType::Erase,
            4 => RecordType::Commit,
            5 => RecordType::Abort,
            6 => RecordType::Checkpoint,
            7 => RecordType::PageImage,
            _ => return None,
        })
    }
}

/// A decoded journal record.
#[derive(Debug)]
pub struct RawRecord {
    pub rec_type: RecordType,
    pub db: DbName,
    pub txn: TxnId,
    pub lsn: Lsn,
    pub payload: Vec<u8>,
}

/// The two journal file paths for a database file.
pub fn journal_paths(db_path: &Path, log_dir: Option<&Path>) -> [PathBuf; 2] {
    let file_name = db_path.file_name().unwrap_or_default().to_string_lossy().to_string();
    let dir = log_dir
        .map(Path::to_path_buf)
        .unwrap_or_else(|| db_path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf());
    [dir.join(format!("{file_name}.jrn0")), dir.join(format!("{file_name}.jrn1"))]
}

pub struct Journal {
    files: [File; 2],
    sizes: [u64; 2],
    /// The file currently receiving records.
    active: usize,
    /// Whether a file holds committed records newer than the last checkpoint.
    committed_since_checkpoint: [bool; 2],
    lsn: Lsn,
    threshold: u64,
    fsync: bool,
    codec: Codec,
}

impl Journal {
    /// Open (and reset) the journal for appending. Recovery, if needed, runs
    /// before this via [`recover`].
    pub fn open(paths: &[PathBuf; 2], threshold: u64, fsync: bool, codec: Codec) -> Result<Journal> {
        let open_one = |path: &PathBuf| -> Result<File> {
            let mut file =
                OpenOptions::new().read(true).write(true).create(true).open(path)?;
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&file_header())?;
            Ok(file)
        };
        Ok(Journal {
            files: [open_one(&paths[0])?, open_one(&paths[1])?],
            sizes: [JOURNAL_HEADER_SIZE, JOURNAL_HEADER_SIZE],
            active: 0,
            committed_since_checkpoint: [false, false],
            lsn: 1,
            threshold,
            fsync,
            codec,
        })
    }

    fn append(
        &mut self,
        rec_type: RecordType,
        db: DbName,
        txn: TxnId,
        payload: &[u8],
    ) -> Result<()> {
        let (mut flags, body) = if self.codec.is_none() || payload.is_empty() {
            (0u8, payload.to_vec())
        } else {
            (FLAG_COMPRESSED, self.codec.compress(payload)?)
        };
        if body.len() >= payload.len() && flags == FLAG_COMPRESSED {
            // Compression that grows the record is pointless.
            flags = 0;
        }
        let body = if flags == 0 { payload.to_vec() } else { body };

        let total = RECORD_OVERHEAD + body.len();
        let mut record = vec![0u8; total];
        write_u32(&mut record, 0, total as u32);
        record[4] = rec_type as u8;
        record[5] = flags;
        record[6..8].copy_from_slice(&db.to_le_bytes());
        write_u64(&mut record, 8, txn);
        write_u64(&mut record, 16, self.lsn);
        record[24..24 + body.len()].copy_from_slice(&body);
        let crc = crc32fast::hash(&record[4..total - 4]);
        write_u32(&mut record, total - 4, crc);
        self.lsn += 1;

        let file = &mut self.files[self.active];
        file.seek(SeekFrom::Start(self.sizes[self.active]))?;
        file.write_all(&record)?;
        self.sizes[self.active] += total as u64;
        Ok(())
    }

    /// Append a whole transaction batch and make the commit durable.
    pub fn append_commit_batch(&mut self, txn: TxnId, ops: &[TxnOp]) -> Result<()> {
        self.append(RecordType::TxnBegin, 0, txn, &[])?;
        for op in ops {
            match op.kind {
                TxnOpKind::Insert(flags) => {
                    let payload = encode_insert_payload(flags, &op.key, &op.record);
                    self.append(RecordType::Insert, op.db, txn, &payload)?;
                }
                TxnOpKind::Erase(flags) => {
                    let payload = encode_erase_payload(flags, &op.key);
                    self.append(RecordType::Erase, op.db, txn, &payload)?;
                }
            }
        }
        self.append(RecordType::Commit, 0, txn, &[])?;
        // The commit record must be on disk before the commit returns.
        self.files[self.active].flush()?;
        if self.fsync {
            self.files[self.active].sync_data()?;
        }
        self.committed_since_checkpoint[self.active] = true;
        self.maybe_switch()?;
        Ok(())
    }

    /// Record a page before-image (metadata pages around a checkpoint).
    pub fn append_page_image(&mut self, page_id: PageId, data: &[u8]) -> Result<()> {
        let mut payload = vec![0u8; 12 + data.len()];
        write_u64(&mut payload, 0, page_id);
        write_u32(&mut payload, 8, data.len() as u32);
        payload[12..].copy_from_slice(data);
        self.append(RecordType::PageImage, 0, 0, &payload)
    }

    /// Mark everything committed so far as durable in the btree.
    pub fn append_checkpoint(&mut self) -> Result<()> {
        self.append(RecordType::Checkpoint, 0, 0, &[])?;
        self.files[self.active].flush()?;
        if self.fsync {
            self.files[self.active].sync_data()?;
        }
        self.committed_since_checkpoint = [false, false];
        self.maybe_switch()?;
        Ok(())
    }

    /// Swap files once the active one is oversized and the other carries
    /// nothing that recovery would still need.
    fn maybe_switch(&mut self) -> Result<()> {
        let other = 1 - self.active;
        if self.sizes[self.active] <= self.threshold || self.committed_since_checkpoint[other] {
            return Ok(());
        }
        self.files[other].set_len(0)?;
        self.files[other].seek(SeekFrom::Start(0))?;
        self.files[other].write_all(&file_header())?;
        self.sizes[other] = JOURNAL_HEADER_SIZE;
        self.active = other;
        log::debug!("journal switched to file {other}");
        Ok(())
    }

    /// Reset both files to bare headers (clean close, post-recovery).
    pub fn truncate_all(&mut self) -> Result<()> {
        for i in 0..2 {
            self.files[i].set_len(0)?;
            self.files[i].seek(SeekFrom::Start(0))?;
            self.files[i].write_all(&file_header())?;
            self.files[i].flush()?;
            self.sizes[i] = JOURNAL_HEADER_SIZE;
        }
        self.committed_since_checkpoint = [false, false];
        self.active = 0;
        Ok(())
    }
}

fn file_header() -> [u8; JOURNAL_HEADER_SIZE as usize] {
    let mut header = [0u8; JOURNAL_HEADER_SIZE as usize];
    header[0..4].copy_from_slice(&JOURNAL_MAGIC);
    write_u32(&mut header, 4, JOURNAL_VERSION);
    header
}

fn encode_insert_payload(flags: InsertFlags, key: &[u8], record: &[u8]) -> Vec<u8> {
    let mut payload = vec![0u8; 12 + key.len() + record.len()];
    write_u32(&mut payload, 0, flags.bits());
    write_u32(&mut payload, 4, key.len() as u32);
    payload[8..8 + key.len()].copy_from_slice(key);
    write_u32(&mut payload, 8 + key.len(), record.len() as u32);
    payload[12 + key.len()..].copy_from_slice(record);
    payload
}

fn encode_erase_payload(flags: EraseFlags, key: &[u8]) -> Vec<u8> {
    let mut payload = vec![0u8; 8 + key.len()];
    write_u32(&mut payload, 0, flags.bits());
    write_u32(&mut payload, 4, key.len() as u32);
    payload[8..].copy_from_slice(key);
    payload
}

/// Decode an insert payload back into `(flags, key, record)`.
pub fn decode_insert_payload(payload: &[u8]) -> Result<(InsertFlags, Vec<u8>, Vec<u8>)> {
    if payload.len() < 12 {
        return Err(Error::new(ErrorKind::IntegrityViolated));
    }
    let flags = InsertFlags::from_bits_retain(read_u32(payload, 0));
    let key_len = read_u32(payload, 4) as usize;
    if 12 + key_len > payload.len() {
        return Err(Error::new(ErrorKind::IntegrityViolated));
    }
    let key = payload[8..8 + key_len].to_vec();
    let rec_len = read_u32(payload, 8 + key_len) as usize;
    if 12 + key_len + rec_len > payload.len() {
        return Err(Error::new(ErrorKind::IntegrityViolated));
    }
    let record = payload[12 + key_len..12 + key_len + rec_len].to_vec();
    Ok((flags, key, record))
}

/// Decode an erase payload back into `(flags, key)`.
pub fn decode_erase_payload(payload: &[u8]) -> Result<(EraseFlags, Vec<u8>)> {
    if payload.len() < 8 {
        return Err(Error::new(ErrorKind::IntegrityViolated));
    }
    let flags = EraseFlags::from_bits_retain(read_u32(payload, 0));
    let key_len = read_u32(payload, 4) as usize;
    if 8 + key_len > payload.len() {
        return Err(Error::new(ErrorKind::IntegrityViolated));
    }
    Ok((flags, payload[8..8 + key_len].to_vec()))
}

// ============================================================================
// Scanning and recovery
// ============================================================================

/// Read every intact record of one journal file. A torn tail (short record,
/// bad CRC) ends the scan for that file; everything before it is returned.
pub fn scan_file(path: &Path, codec: Codec) -> Result<Vec<RawRecord>> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;
    if data.is_empty() {
        return Ok(Vec::new());
    }
    if data.len() < JOURNAL_HEADER_SIZE as usize || data[0..4] != JOURNAL_MAGIC {
        return Err(Error::with_detail(
            ErrorKind::LogInvalidFileHeader,
            format!("{}", path.display()),
        ));
    }
    if read_u32(&data, 4) != JOURNAL_VERSION {
        return Err(Error::with_detail(
            ErrorKind::LogInvalidFileHeader,
            format!("{}: unsupported version", path.display()),
        ));
    }

    let mut records = Vec::new();
    let mut off = JOURNAL_HEADER_SIZE as usize;
    while off + RECORD_OVERHEAD <= data.len() {
        let total = read_u32(&data, off) as usize;
        if total < RECORD_OVERHEAD || off + total > data.len() {
            log::warn!("journal {}: torn record at offset {off}, stopping scan", path.display());
            break;
        }
        let crc_stored = read_u32(&data, off + total - 4);
        let crc_actual = crc32fast::hash(&data[off + 4..off + total - 4]);
        if crc_stored != crc_actual {
            log::warn!("journal {}: bad crc at offset {off}, stopping scan", path.display());
            break;
        }
        let rec_type = match RecordType::from_u8(data[off + 4]) {
            Some(t) => t,
            None => {
                log::warn!("journal {}: unknown record type at offset {off}", path.display());
                break;
            }
        };
        let flags = data[off + 5];
        let db = read_u16(&data, off + 6);
        let txn = read_u64(&data, off + 8);
        let lsn = read_u64(&data, off + 16);
        let body = &data[off + 24..off + total - 4];
        let payload = if flags & FLAG_COMPRESSED != 0 {
            codec.decompress(body)?
        } else {
            body.to_vec()
        };
        records.push(RawRecord { rec_type, db, txn, lsn, payload });
        off += total;
    }
    Ok(records)
}

/// Whether the journal files hold anything newer than the last checkpoint.
pub fn needs_recovery(paths: &[PathBuf; 2], codec: Codec) -> Result<bool> {
    let mut records = scan_file(&paths[0], codec)?;
    records.extend(scan_file(&paths[1], codec)?);
    let last_checkpoint = records
        .iter()
        .filter(|r| r.rec_type == RecordType::Checkpoint)
        .map(|r| r.lsn)
        .max()
        .unwrap_or(0);
    Ok(records.iter().any(|r| r.rec_type != RecordType::Checkpoint && r.lsn > last_checkpoint))
}

/// Replay the journal: reconstruct per-transaction op-logs in lsn order and
/// hand every transaction whose commit record is newer than the last
/// checkpoint to `apply`, in commit order. Incomplete and aborted
/// transactions are discarded. Returns the number of transactions replayed.
pub fn recover(
    paths: &[PathBuf; 2],
    codec: Codec,
    mut apply: impl FnMut(&TxnOp) -> Result<()>,
) -> Result<usize> {
    let mut records = scan_file(&paths[0], codec)?;
    records.extend(scan_file(&paths[1], codec)?);
    records.sort_by_key(|r| r.lsn);

    let last_checkpoint = records
        .iter()
        .filter(|r| r.rec_type == RecordType::Checkpoint)
        .map(|r| r.lsn)
        .max()
        .unwrap_or(0);

    let mut pending: HashMap<TxnId, Vec<TxnOp>> = HashMap::new();
    let mut replayed = 0usize;
    for record in records {
        match record.rec_type {
            RecordType::TxnBegin => {
                pending.insert(record.txn, Vec::new());
            }
            RecordType::Insert => {
                let (flags, key, rec) = decode_insert_payload(&record.payload)?;
                if let Some(ops) = pending.get_mut(&record.txn) {
                    ops.push(TxnOp {
                        db: record.db,
                        kind: TxnOpKind::Insert(flags),
                        key,
                        record: rec,
                    });
                }
            }
            RecordType::Erase => {
                let (flags, key) = decode_erase_payload(&record.payload)?;
                if let Some(ops) = pending.get_mut(&record.txn) {
                    ops.push(TxnOp {
                        db: record.db,
                        kind: TxnOpKind::Erase(flags),
                        key,
                        record: Vec::new(),
                    });
                }
            }
            RecordType::Commit => {
                if let Some(ops) = pending.remove(&record.txn) {
                    if record.lsn > last_checkpoint {
                        for op in &ops {
                            apply(op)?;
                        }
                        replayed += 1;
                    }
                }
            }
            RecordType::Abort => {
                pending.remove(&record.txn);
            }
            RecordType::Checkpoint | RecordType::PageImage => {}
        }
    }
    if !pending.is_empty() {
        log::info!("recovery discarded {} unfinished transactions", pending.len());
    }
    Ok(replayed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_paths(dir: &tempfile::TempDir) -> [PathBuf; 2] {
        journal_paths(&dir.path().join("test.db"), None)
    }

    fn op(db: DbName, key: &[u8], record: &[u8]) -> TxnOp {
        TxnOp {
            db,
            kind: TxnOpKind::Insert(InsertFlags::empty()),
            key: key.to_vec(),
            record: record.to_vec(),
        }
    }

    #[test]
    fn test_commit_batch_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let paths = temp_paths(&dir);
        {
            let mut journal = Journal::open(&paths, 1 << 20, false, Codec::None).unwrap();
            journal
                .append_commit_batch(1, &[op(3, b"alpha", b"one"), op(3, b"beta", b"two")])
                .unwrap();
        }

        let records = scan_file(&paths[0], Codec::None).unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(records[0].rec_type, RecordType::TxnBegin);
        assert_eq!(records[3].rec_type, RecordType::Commit);
        let (_, key, rec) = decode_insert_payload(&records[1].payload).unwrap();
        assert_eq!(key, b"alpha");
        assert_eq!(rec, b"one");
        assert!(records.windows(2).all(|w| w[0].lsn < w[1].lsn));
    }

    #[test]
    fn test_recover_applies_only_committed() {
        let dir = tempfile::tempdir().unwrap();
        let paths = temp_paths(&dir);
        {
            let mut journal = Journal::open(&paths, 1 << 20, false, Codec::None).unwrap();
            journal.append_commit_batch(1, &[op(1, b"committed", b"v")]).unwrap();
            // A torn batch: begin + op but no commit record.
            journal.append(RecordType::TxnBegin, 0, 2, &[]).unwrap();
            let payload = encode_insert_payload(InsertFlags::empty(), b"lost", b"x");
            journal.append(RecordType::Insert, 1, 2, &payload).unwrap();
            journal.files[0].flush().unwrap();
        }

        assert!(needs_recovery(&paths, Codec::None).unwrap());
        let mut seen = Vec::new();
        let replayed = recover(&paths, Codec::None, |op| {
            seen.push(op.key.clone());
            Ok(())
        })
        .unwrap();
        assert_eq!(replayed, 1);
        assert_eq!(seen, vec![b"committed".to_vec()]);
    }

    #[test]
    fn test_checkpoint_bounds_replay() {
        let dir = tempfile::tempdir().unwrap();
        let paths = temp_paths(&dir);
        {
            let mut journal = Journal::open(&paths, 1 << 20, false, Codec::None).unwrap();
            journal.append_commit_batch(1, &[op(1, b"old", b"v")]).unwrap();
            journal.append_checkpoint().unwrap();
            journal.append_commit_batch(2, &[op(1, b"new", b"v")]).unwrap();
        }

        let mut seen = Vec::new();
        recover(&paths, Codec::None, |op| {
            seen.push(op.key.clone());
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![b"new".to_vec()]);
    }

    #[test]
    fn test_clean_journal_needs_no_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let paths = temp_paths(&dir);
        {
            let mut journal = Journal::open(&paths, 1 << 20, false, Codec::None).unwrap();
            journal.append_commit_batch(1, &[op(1, b"k", b"v")]).unwrap();
            journal.append_checkpoint().unwrap();
        }
        assert!(!needs_recovery(&paths, Codec::None).unwrap());

        // Missing files never require recovery.
        let other = journal_paths(&dir.path().join("absent.db"), None);
        assert!(!needs_recovery(&other, Codec::None).unwrap());
    }

    #[test]
    fn test_switch_rotates_files() {
        let dir = tempfile::tempdir().unwrap();
        let paths = temp_paths(&dir);
        let mut journal = Journal::open(&paths, 256, false, Codec::None).unwrap();

        // Overflow the tiny threshold; the other file is empty, so the
        // switch happens right after the commit.
        journal.append_commit_batch(1, &[op(1, b"k1", &[9u8; 200])]).unwrap();
        assert_eq!(journal.active, 1);
        let records = scan_file(&paths[0], Codec::None).unwrap();
        assert_eq!(records.len(), 3, "switch preserves the committed batch in the old file");

        // File 0 still holds an uncheckpointed commit, so the next oversized
        // batch cannot rotate back onto it.
        journal.append_commit_batch(2, &[op(1, b"k2", &[9u8; 200])]).unwrap();
        assert_eq!(journal.active, 1);

        // A checkpoint clears both files and unblocks the rotation.
        journal.append_checkpoint().unwrap();
        assert_eq!(journal.active, 0);
    }

    #[test]
    fn test_torn_tail_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let paths = temp_paths(&dir);
        {
            let mut journal = Journal::open(&paths, 1 << 20, false, Codec::None).unwrap();
            journal.append_commit_batch(1, &[op(1, b"good", b"v")]).unwrap();
        }
        // Corrupt the tail by appending garbage.
        {
            let mut file = OpenOptions::new().append(true).open(&paths[0]).unwrap();
            file.write_all(&[0xffu8; 10]).unwrap();
        }
        let records = scan_file(&paths[0], Codec::None).unwrap();
        assert_eq!(records.len(), 4);

        let mut seen = Vec::new();
        recover(&paths, Codec::None, |op| {
            seen.push(op.key.clone());
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![b"good".to_vec()]);
    }

    #[test]
    fn test_compressed_payloads() {
        let dir = tempfile::tempdir().unwrap();
        let paths = temp_paths(&dir);
        let big = b"aaaaaaaaaa".repeat(50);
        {
            let mut journal = Journal::open(&paths, 1 << 20, false, Codec::Zlib).unwrap();
            journal.append_commit_batch(1, &[op(1, b"k", &big)]).unwrap();
        }
        let records = scan_file(&paths[0], Codec::Zlib).unwrap();
        let (_, _, rec) = decode_insert_payload(&records[1].payload).unwrap();
        assert_eq!(rec, big);
    }

    #[test]
    fn test_bad_header_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bogus.jrn0");
        std::fs::write(&path, b"this is not a journal file at all").unwrap();
        let err = scan_file(&path, Codec::None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LogInvalidFileHeader);
    }
}
