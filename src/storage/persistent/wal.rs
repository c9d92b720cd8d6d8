//! Write-ahead log of committed batches.
//!
//! Every commit is framed (see `codec`) and appended before it is applied
//! to the in-memory index. On open the log is scanned once; a record left
//! incomplete by a crash is cut off so later appends start on a clean
//! boundary. WAL sequence numbers keep increasing across truncations, so a
//! snapshot can name the last record it already contains.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Cursor, ErrorKind, Result as IoResult, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::index::CommitRecord;

use super::codec;

/// One logged commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct WalRecord {
    pub sequence: u64,
    pub logged_at: DateTime<Utc>,
    pub commit: CommitRecord,
}

#[derive(Debug)]
struct Tail {
    writer: BufWriter<File>,
    sequence: u64,
    size: u64,
}

#[derive(Debug)]
pub(crate) struct WriteAheadLog {
    path: PathBuf,
    tail: Mutex<Tail>,
    sync_on_write: bool,
}

fn poisoned() -> std::io::Error {
    std::io::Error::new(ErrorKind::Other, "poisoned lock: wal.tail")
}

impl WriteAheadLog {
    /// Opens or creates the log and returns it with the records it holds.
    ///
    /// `base_sequence` is the last WAL sequence already captured elsewhere;
    /// new records are numbered after it and after anything in the file.
    pub fn open(path: &Path, sync_on_write: bool, base_sequence: u64) -> IoResult<(Self, Vec<WalRecord>)> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e),
        };

        let (records, valid_len) = if bytes.is_empty() {
            let mut file = OpenOptions::new().write(true).create(true).truncate(true).open(path)?;
            codec::write_header(&mut file)?;
            file.sync_all()?;
            (Vec::new(), codec::HEADER_LEN)
        } else {
            scan(&bytes)?
        };

        if valid_len < bytes.len() as u64 && !bytes.is_empty() {
            tracing::warn!(
                path = %path.display(),
                dropped_bytes = bytes.len() as u64 - valid_len,
                "discarding incomplete WAL tail"
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(valid_len)?;
            file.sync_all()?;
        }

        let last = records.last().map_or(0, |r| r.sequence);
        let file = OpenOptions::new().append(true).open(path)?;
        let wal = Self {
            path: path.to_path_buf(),
            tail: Mutex::new(Tail {
                writer: BufWriter::new(file),
                sequence: last.max(base_sequence),
                size: valid_len,
            }),
            sync_on_write,
        };
        Ok((wal, records))
    }

    /// Appends one commit and returns its WAL sequence.
    ///
    /// A failed append leaves the file as it was before the call.
    pub fn append(&self, commit: &CommitRecord) -> IoResult<u64> {
        let mut tail = self.tail.lock().map_err(|_| poisoned())?;
        let record = WalRecord {
            sequence: tail.sequence + 1,
            logged_at: Utc::now(),
            commit: commit.clone(),
        };
        let bytes = codec::encode(&record)?;

        let written = tail
            .writer
            .write_all(&bytes)
            .and_then(|()| tail.writer.flush())
            .and_then(|()| {
                if self.sync_on_write {
                    tail.writer.get_ref().sync_data()
                } else {
                    Ok(())
                }
            });
        if let Err(e) = written {
            // Drop whatever part of the record reached the file.
            let size = tail.size;
            let file = tail.writer.get_ref().try_clone()?;
            tail.writer = BufWriter::new(file);
            tail.writer.get_ref().set_len(size)?;
            return Err(e);
        }

        tail.sequence = record.sequence;
        tail.size += bytes.len() as u64;
        Ok(record.sequence)
    }

    /// Sequence of the last appended record.
    pub fn sequence(&self) -> IoResult<u64> {
        Ok(self.tail.lock().map_err(|_| poisoned())?.sequence)
    }

    /// Current file size in bytes, header included.
    pub fn size(&self) -> IoResult<u64> {
        Ok(self.tail.lock().map_err(|_| poisoned())?.size)
    }

    /// Drops every record. The sequence counter is kept.
    pub fn truncate(&self) -> IoResult<()> {
        let mut tail = self.tail.lock().map_err(|_| poisoned())?;
        tail.writer.flush()?;
        tail.writer.get_ref().set_len(codec::HEADER_LEN)?;
        tail.writer.get_ref().sync_all()?;
        tail.size = codec::HEADER_LEN;
        Ok(())
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Decodes every complete record and returns them with the length of the
/// valid prefix.
///
/// A truncated record, or a tail of zero bytes left by a preallocating
/// filesystem, ends the log. Damage followed by more data is an error.
fn scan(bytes: &[u8]) -> IoResult<(Vec<WalRecord>, u64)> {
    let mut reader = Cursor::new(bytes);
    codec::read_header(&mut reader)?;
    let mut records = Vec::new();
    let mut valid = codec::HEADER_LEN;

    while valid < bytes.len() as u64 {
        reader.set_position(valid);
        match codec::decode::<WalRecord>(&mut reader) {
            Ok((record, len)) => {
                records.push(record);
                valid += len;
            }
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(_) if bytes[valid as usize..].iter().all(|&b| b == 0) => break,
            Err(e) => {
                return Err(std::io::Error::new(
                    ErrorKind::InvalidData,
                    format!("corrupted WAL record at offset {valid}: {e}"),
                ));
            }
        }
    }
    Ok((records, valid))
}
