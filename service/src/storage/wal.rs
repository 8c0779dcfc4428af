//! CRC-framed append-only record files.
//!
//! Frame layout: `height u64 LE | len u32 LE | payload | crc32 u32 LE`, the
//! checksum covering height, length and payload. A torn or corrupt tail is
//! truncated on read so later appends continue from the last good frame.
//!
//! [`SharedWal`] lets several processes append to one file: every read and
//! append runs under the file's lock, and each handle tracks how far it has
//! read so frames written by others are picked up on the next call.

use super::lock::FileLock;
use crc32fast::Hasher;
use eyre::{Result, WrapErr};
use serde::{de::DeserializeOwned, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct WalRecord {
    pub height: u64,
    pub payload: Vec<u8>,
}

impl WalRecord {
    pub fn json<T: Serialize>(height: u64, value: &T) -> Result<Self> {
        let payload = serde_json::to_vec(value).wrap_err("failed to serialize wal record")?;
        Ok(Self { height, payload })
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.payload).wrap_err("failed to deserialize wal record")
    }
}

fn checksum(height: u64, len: u32, payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&height.to_le_bytes());
    hasher.update(&len.to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}

/// Append `records`, returning the file length afterwards.
pub fn append_records(path: &Path, records: &[WalRecord]) -> Result<u64> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).wrap_err("failed to create wal dir")?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .wrap_err_with(|| format!("failed to open {}", path.display()))?;

    let mut frame = Vec::new();
    for record in records {
        let len = u32::try_from(record.payload.len()).wrap_err("wal record too large")?;
        frame.extend_from_slice(&record.height.to_le_bytes());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&record.payload);
        frame.extend_from_slice(&checksum(record.height, len, &record.payload).to_le_bytes());
    }
    file.write_all(&frame)?;
    file.sync_data().wrap_err("failed to sync wal")?;
    Ok(file.metadata()?.len())
}

/// Next intact frame, or `None` at end of file or on a torn or corrupt frame.
fn next_frame(file: &mut impl Read) -> Option<WalRecord> {
    let mut header = [0u8; 12];
    file.read_exact(&mut header).ok()?;
    let (height_bytes, len_bytes) = header.split_at(8);
    let height = u64::from_le_bytes(height_bytes.try_into().ok()?);
    let len = u32::from_le_bytes(len_bytes.try_into().ok()?);
    let mut payload = vec![0u8; len as usize];
    file.read_exact(&mut payload).ok()?;
    let mut crc = [0u8; 4];
    file.read_exact(&mut crc).ok()?;
    if checksum(height, len, &payload) != u32::from_le_bytes(crc) {
        return None;
    }
    Some(WalRecord { height, payload })
}

#[cfg(test)]
pub fn read_records(path: &Path) -> Result<Vec<WalRecord>> {
    Ok(read_records_from(path, 0)?.0)
}

/// Frames starting at byte `offset`, and the offset just past the last good
/// one. Bytes after it are truncated.
pub fn read_records_from(path: &Path, offset: u64) -> Result<(Vec<WalRecord>, u64)> {
    if !path.exists() {
        return Ok((Vec::new(), 0));
    }
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .wrap_err_with(|| format!("failed to open {}", path.display()))?;
    file.seek(SeekFrom::Start(offset))?;
    let mut records = Vec::new();
    let mut last_good_offset = offset;
    while let Some(record) = next_frame(&mut file) {
        records.push(record);
        last_good_offset = file.stream_position()?;
    }

    if last_good_offset < file.metadata()?.len() {
        tracing::warn!(
            path = %path.display(),
            offset = last_good_offset,
            "truncating torn wal tail"
        );
        file.set_len(last_good_offset)?;
    }

    Ok((records, last_good_offset))
}

/// A WAL file that other processes may append to concurrently.
#[derive(Debug)]
pub struct SharedWal {
    path: PathBuf,
    /// Bytes of the file this handle has already replayed.
    consumed: FileLock<u64>,
}

impl SharedWal {
    pub fn open(path: PathBuf) -> Result<Self> {
        let consumed = FileLock::open(&path, 0)?;
        Ok(Self { path, consumed })
    }

    /// Feed every frame not seen yet to `apply`, returning how many there were.
    pub fn catch_up<T: DeserializeOwned>(&self, mut apply: impl FnMut(T)) -> Result<usize> {
        let mut consumed = self.consumed.acquire()?;
        self.replay(&mut consumed, &mut apply)
    }

    /// Append `value` after replaying foreign frames through `apply`; `value`
    /// itself is applied last.
    pub fn append<T: Serialize + DeserializeOwned>(
        &self,
        height: u64,
        value: T,
        mut apply: impl FnMut(T),
    ) -> Result<()> {
        let mut consumed = self.consumed.acquire()?;
        self.replay(&mut consumed, &mut apply)?;
        *consumed = append_records(&self.path, &[WalRecord::json(height, &value)?])?;
        apply(value);
        Ok(())
    }

    fn replay<T: DeserializeOwned>(
        &self,
        consumed: &mut u64,
        apply: &mut impl FnMut(T),
    ) -> Result<usize> {
        let (records, offset) = read_records_from(&self.path, *consumed)?;
        let values = records
            .iter()
            .map(WalRecord::decode::<T>)
            .collect::<Result<Vec<T>>>()?;
        let replayed = values.len();
        values.into_iter().for_each(apply);
        *consumed = offset;
        Ok(replayed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::temp_dir;

    #[test]
    fn wal_truncates_partial_tail() {
        let dir = temp_dir("wal");
        let path = dir.join("ledger.wal");
        append_records(
            &path,
            &[
                WalRecord {
                    height: 1,
                    payload: b"hello".to_vec(),
                },
                WalRecord {
                    height: 2,
                    payload: b"world".to_vec(),
                },
            ],
        )
        .expect("append records");

        let len = fs::metadata(&path).expect("meta").len();
        let file = OpenOptions::new().write(true).open(&path).expect("open");
        file.set_len(len.saturating_sub(3)).expect("truncate");

        let records = read_records(&path).expect("read records");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].height, 1);

        append_records(
            &path,
            &[WalRecord {
                height: 3,
                payload: b"again".to_vec(),
            }],
        )
        .expect("append after truncate");
        let heights: Vec<u64> = read_records(&path)
            .expect("reread")
            .iter()
            .map(|record| record.height)
            .collect();
        assert_eq!(heights, vec![1, 3]);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn shared_handles_pick_up_each_others_frames() {
        let dir = temp_dir("wal-shared");
        let path = dir.join("results.wal");
        let service = SharedWal::open(path.clone()).expect("open service handle");
        let admin = SharedWal::open(path).expect("open admin handle");
        let mut seen_by_service: Vec<u64> = Vec::new();
        assert_eq!(service.catch_up(|value| seen_by_service.push(value)).unwrap(), 0);

        admin.append(1, 10u64, |_| {}).expect("admin append");
        admin.append(2, 20u64, |_| {}).expect("admin append");
        service
            .append(3, 30u64, |value| seen_by_service.push(value))
            .expect("service append");
        assert_eq!(seen_by_service, vec![10, 20, 30]);

        let mut seen_by_admin: Vec<u64> = Vec::new();
        assert_eq!(admin.catch_up(|value| seen_by_admin.push(value)).unwrap(), 1);
        assert_eq!(seen_by_admin, vec![30]);
        assert_eq!(service.catch_up(|_: u64| {}).unwrap(), 0);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn json_records_decode() {
        let record = WalRecord::json(9, &vec![1u64, 2, 3]).expect("encode");
        let decoded: Vec<u64> = record.decode().expect("decode");
        assert_eq!(decoded, vec![1, 2, 3]);
    }
}
