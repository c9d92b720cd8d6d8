//! Point-in-time image of the whole index.
//!
//! A snapshot is one framed record after the file header. It is written to
//! a temporary file, synced and renamed over the previous snapshot, so a
//! reader sees either the old image or the new one.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Result as IoResult, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::index::EntryIndex;

use super::codec;

const SNAPSHOT_FILE: &str = "snapshot";
const SNAPSHOT_TMP: &str = "snapshot.tmp";

#[derive(Serialize)]
struct SnapshotRef<'a> {
    wal_sequence: u64,
    taken_at: DateTime<Utc>,
    index: &'a EntryIndex,
}

/// A loaded snapshot.
#[derive(Debug, Deserialize)]
pub(crate) struct Snapshot {
    /// Last WAL record contained in `index`.
    pub wal_sequence: u64,
    pub taken_at: DateTime<Utc>,
    pub index: EntryIndex,
}

/// Writes `index` as the directory's snapshot and returns its size.
pub(crate) fn write(dir: &Path, wal_sequence: u64, index: &EntryIndex) -> IoResult<u64> {
    let tmp = dir.join(SNAPSHOT_TMP);
    let bytes = codec::encode(&SnapshotRef {
        wal_sequence,
        taken_at: Utc::now(),
        index,
    })?;
    {
        let file = OpenOptions::new().write(true).create(true).truncate(true).open(&tmp)?;
        let mut out = BufWriter::new(file);
        codec::write_header(&mut out)?;
        out.write_all(&bytes)?;
        out.flush()?;
        out.get_ref().sync_all()?;
    }
    fs::rename(&tmp, dir.join(SNAPSHOT_FILE))?;
    sync_dir(dir)?;
    Ok(codec::HEADER_LEN + bytes.len() as u64)
}

/// Loads the directory's snapshot, if there is one.
pub(crate) fn load(dir: &Path) -> IoResult<Option<Snapshot>> {
    // A leftover temp file is an unfinished snapshot.
    match fs::remove_file(dir.join(SNAPSHOT_TMP)) {
        Ok(()) => tracing::warn!(dir = %dir.display(), "removed unfinished snapshot"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    let file = match File::open(dir.join(SNAPSHOT_FILE)) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);
    codec::read_header(&mut reader)?;
    let (mut snapshot, _): (Snapshot, u64) = codec::decode(&mut reader)?;
    snapshot.index.rebuild_ids();
    Ok(Some(snapshot))
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> IoResult<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> IoResult<()> {
    Ok(())
}
