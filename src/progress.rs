//! On-disk progress record for resumable downloads.
//!
//! One record lives next to the destination file at `<dest>.cfg` and holds
//! everything needed to resume after a stop or a crash. The layout is fixed
//! size, little-endian, `24 + slots * 16` bytes:
//!
//! ```text
//! +--------+------+----------------------------------------------+
//! | offset | size | field                                        |
//! +--------+------+----------------------------------------------+
//! |      0 |    2 | total active download time (seconds)         |
//! |      2 |    1 | thread count in use (0 until negotiated)     |
//! |    3-7 |    5 | reserved                                     |
//! |      8 |    8 | file length (0 until learned)                |
//! |     16 |    8 | high-water mark                              |
//! | 24+16i |    8 | slot i start offset                          |
//! | 32+16i |    8 | slot i end offset                            |
//! +--------+------+----------------------------------------------+
//! ```
//!
//! Every setter writes through to disk and syncs before returning, so a
//! process crash loses at most the chunk that was in flight. The record is
//! deleted when the task completes and left behind on stop or error.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// Size of the fixed header before the range slots.
const HEADER_SIZE: u64 = 24;

/// Size of one `(start, end)` slot pair.
const SLOT_SIZE: u64 = 16;

const TIME_OFFSET: u64 = 0;
const THREAD_COUNT_OFFSET: u64 = 2;
const FILE_LENGTH_OFFSET: u64 = 8;
const HIGH_WATER_OFFSET: u64 = 16;

/// Returns the progress record path for a destination file (`<dest>.cfg`).
#[must_use]
pub fn record_path(dest: &Path) -> PathBuf {
    let mut os = dest.as_os_str().to_os_string();
    os.push(".cfg");
    PathBuf::from(os)
}

/// The persisted ledger of byte ranges for one download.
///
/// Range slots are owned by their worker; the shared fields (file length,
/// high-water mark, thread count) are only mutated through
/// [`claim_next_chunk`](Self::claim_next_chunk) or task setup, both of which
/// run under the task's record lock. The struct itself is not synchronized.
#[derive(Debug)]
pub struct ProgressRecord {
    file: File,
    path: PathBuf,
    slots: usize,
    active_seconds: u16,
    thread_count: u8,
    /// 0 means not yet learned.
    file_length: u64,
    high_water_mark: u64,
    ranges: Vec<(u64, u64)>,
}

impl ProgressRecord {
    /// Opens or creates the record at `path` with room for `slots` ranges.
    ///
    /// Loads any persisted state and repairs the high-water mark against the
    /// slot end offsets (a crash can land between a range claim and the mark
    /// write; the slot write happens first).
    ///
    /// # Errors
    ///
    /// Returns the underlying IO error if the file cannot be created, sized,
    /// or read.
    pub fn open(path: impl Into<PathBuf>, slots: usize) -> std::io::Result<Self> {
        let path = path.into();
        let slots = slots.max(1);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let size = HEADER_SIZE + slots as u64 * SLOT_SIZE;
        if file.metadata()?.len() < size {
            file.set_len(size)?;
        }

        let mut record = Self {
            file,
            path,
            slots,
            active_seconds: 0,
            thread_count: 0,
            file_length: 0,
            high_water_mark: 0,
            ranges: vec![(0, 0); slots],
        };
        record.load()?;
        record.repair_high_water_mark()?;
        Ok(record)
    }

    /// Reads the whole file into the in-memory mirror.
    fn load(&mut self) -> std::io::Result<()> {
        let size = HEADER_SIZE as usize + self.slots * SLOT_SIZE as usize;
        let mut buf = vec![0u8; size];
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_exact(&mut buf)?;

        self.active_seconds = u16::from_le_bytes([buf[0], buf[1]]);
        self.thread_count = buf[THREAD_COUNT_OFFSET as usize];
        self.file_length = read_u64(&buf, FILE_LENGTH_OFFSET as usize);
        self.high_water_mark = read_u64(&buf, HIGH_WATER_OFFSET as usize);
        for i in 0..self.slots {
            let base = HEADER_SIZE as usize + i * SLOT_SIZE as usize;
            self.ranges[i] = (read_u64(&buf, base), read_u64(&buf, base + 8));
        }
        Ok(())
    }

    /// Corrects a high-water mark that lags behind the persisted slot ends.
    fn repair_high_water_mark(&mut self) -> std::io::Result<()> {
        if self.high_water_mark == 0 {
            return Ok(());
        }
        let max_end = self.ranges[..usize::from(self.thread_count).min(self.slots)]
            .iter()
            .map(|&(_, end)| end)
            .max()
            .unwrap_or(0);
        if max_end != self.high_water_mark {
            warn!(
                persisted = self.high_water_mark,
                repaired = max_end,
                "repairing high-water mark from slot end offsets"
            );
            self.set_high_water_mark(max_end)?;
        }
        Ok(())
    }

    /// Number of range slots allocated in the file.
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.slots
    }

    /// The byte range persisted for `slot`.
    #[must_use]
    pub fn range(&self, slot: usize) -> (u64, u64) {
        self.ranges.get(slot).copied().unwrap_or((0, 0))
    }

    /// Persists both offsets of `slot`.
    ///
    /// # Errors
    ///
    /// Returns the underlying IO error if the write or sync fails.
    pub fn set_range(&mut self, slot: usize, start: u64, end: u64) -> std::io::Result<()> {
        self.write_range(slot, start, end)?;
        self.sync()
    }

    /// Persists only the start offset of `slot`. Called after every buffer
    /// flush, so this is the hot path of crash consistency.
    ///
    /// # Errors
    ///
    /// Returns the underlying IO error if the write or sync fails.
    pub fn set_start_offset(&mut self, slot: usize, start: u64) -> std::io::Result<()> {
        if let Some(range) = self.ranges.get_mut(slot) {
            range.0 = start;
        }
        let offset = HEADER_SIZE + slot as u64 * SLOT_SIZE;
        self.write_at(offset, &start.to_le_bytes())?;
        self.sync()
    }

    /// The total remote content length, or 0 while unknown.
    #[must_use]
    pub fn file_length(&self) -> u64 {
        self.file_length
    }

    /// Persists the learned content length.
    ///
    /// # Errors
    ///
    /// Returns the underlying IO error if the write or sync fails.
    pub fn set_file_length(&mut self, length: u64) -> std::io::Result<()> {
        self.file_length = length;
        self.write_at(FILE_LENGTH_OFFSET, &length.to_le_bytes())?;
        self.sync()
    }

    /// The offset just past the largest byte ever claimed.
    #[must_use]
    pub fn high_water_mark(&self) -> u64 {
        self.high_water_mark
    }

    /// Persists the high-water mark.
    ///
    /// # Errors
    ///
    /// Returns the underlying IO error if the write or sync fails.
    pub fn set_high_water_mark(&mut self, mark: u64) -> std::io::Result<()> {
        self.high_water_mark = mark;
        self.write_at(HIGH_WATER_OFFSET, &mark.to_le_bytes())?;
        self.sync()
    }

    /// The number of range slots in use (0 until the first 206 negotiation).
    #[must_use]
    pub fn thread_count(&self) -> u8 {
        self.thread_count
    }

    /// Persists the negotiated thread count.
    ///
    /// # Errors
    ///
    /// Returns the underlying IO error if the write or sync fails.
    pub fn set_thread_count(&mut self, count: u8) -> std::io::Result<()> {
        self.thread_count = count;
        self.write_at(THREAD_COUNT_OFFSET, &[count])?;
        self.sync()
    }

    /// Cumulative active download time across runs, in seconds.
    #[must_use]
    pub fn active_seconds(&self) -> u16 {
        self.active_seconds
    }

    /// Adds to the cumulative active time, saturating at `u16::MAX`.
    ///
    /// # Errors
    ///
    /// Returns the underlying IO error if the write or sync fails.
    pub fn add_active_seconds(&mut self, seconds: u16) -> std::io::Result<()> {
        self.active_seconds = self.active_seconds.saturating_add(seconds);
        self.write_at(TIME_OFFSET, &self.active_seconds.to_le_bytes())?;
        self.sync()
    }

    /// Claims the next unclaimed chunk for `slot`.
    ///
    /// Returns `None` when the high-water mark has reached the file length
    /// (or the length is still unknown). Otherwise writes
    /// `[hwm, hwm + min(remaining, chunk_size))` into the slot, advances and
    /// persists the mark, and returns the new range. Callers serialize this
    /// through the task's record lock; claims are strictly increasing in
    /// offset, so no two chunks ever overlap.
    ///
    /// # Errors
    ///
    /// Returns the underlying IO error if persistence fails.
    pub fn claim_next_chunk(
        &mut self,
        slot: usize,
        chunk_size: u64,
    ) -> std::io::Result<Option<(u64, u64)>> {
        if self.file_length == 0 || self.high_water_mark >= self.file_length {
            return Ok(None);
        }
        let size = (self.file_length - self.high_water_mark).min(chunk_size);
        let start = self.high_water_mark;
        let end = start + size;

        // Slot first, mark second: open() repairs the mark from slot ends
        // if a crash lands between these two writes.
        self.write_range(slot, start, end)?;
        self.high_water_mark = end;
        self.write_at(HIGH_WATER_OFFSET, &end.to_le_bytes())?;
        self.sync()?;

        debug!(slot, start, end, "claimed chunk");
        Ok(Some((start, end)))
    }

    /// Bytes already streamed to disk, derived from the persisted state:
    /// everything below the high-water mark minus what the in-use slots
    /// still owe. Used to rebuild the task's byte counter on resume.
    #[must_use]
    pub fn downloaded_bytes(&self) -> u64 {
        let outstanding: u64 = self.ranges[..usize::from(self.thread_count).min(self.slots)]
            .iter()
            .map(|&(start, end)| end.saturating_sub(start))
            .sum();
        self.high_water_mark.saturating_sub(outstanding)
    }

    /// Zeroes the whole record. Used when a new negotiation reports a file
    /// length different from the persisted one: that is a different remote
    /// resource and none of the old state applies.
    ///
    /// # Errors
    ///
    /// Returns the underlying IO error if the write or sync fails.
    pub fn reset(&mut self) -> std::io::Result<()> {
        self.active_seconds = 0;
        self.thread_count = 0;
        self.file_length = 0;
        self.high_water_mark = 0;
        self.ranges.fill((0, 0));

        let size = HEADER_SIZE as usize + self.slots * SLOT_SIZE as usize;
        self.write_at(0, &vec![0u8; size])?;
        self.sync()
    }

    /// Deletes the record file. Consumes the record; the handle is closed
    /// before the unlink so the delete is effective on every platform.
    ///
    /// # Errors
    ///
    /// Returns the underlying IO error if the unlink fails.
    pub fn delete(self) -> std::io::Result<()> {
        let path = self.path.clone();
        drop(self);
        std::fs::remove_file(path)
    }

    fn write_range(&mut self, slot: usize, start: u64, end: u64) -> std::io::Result<()> {
        if let Some(range) = self.ranges.get_mut(slot) {
            *range = (start, end);
        }
        let offset = HEADER_SIZE + slot as u64 * SLOT_SIZE;
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&start.to_le_bytes());
        bytes[8..].copy_from_slice(&end.to_le_bytes());
        self.write_at(offset, &bytes)
    }

    fn write_at(&mut self, offset: u64, bytes: &[u8]) -> std::io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(bytes)
    }

    fn sync(&self) -> std::io::Result<()> {
        self.file.sync_data()
    }
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record_in(dir: &TempDir, slots: usize) -> ProgressRecord {
        ProgressRecord::open(dir.path().join("out.bin.cfg"), slots).unwrap()
    }

    #[test]
    fn test_record_path_appends_cfg() {
        let path = record_path(Path::new("/downloads/movie.mp4"));
        assert_eq!(path, PathBuf::from("/downloads/movie.mp4.cfg"));
    }

    #[test]
    fn test_new_record_is_zeroed_and_fixed_size() {
        let dir = TempDir::new().unwrap();
        let record = record_in(&dir, 3);
        assert_eq!(record.thread_count(), 0);
        assert_eq!(record.file_length(), 0);
        assert_eq!(record.high_water_mark(), 0);
        assert_eq!(record.active_seconds(), 0);
        assert_eq!(record.range(0), (0, 0));

        let len = std::fs::metadata(dir.path().join("out.bin.cfg"))
            .unwrap()
            .len();
        assert_eq!(len, 24 + 3 * 16);
    }

    #[test]
    fn test_binary_layout_is_byte_exact() {
        let dir = TempDir::new().unwrap();
        let mut record = record_in(&dir, 2);
        record.add_active_seconds(0x0102).unwrap();
        record.set_thread_count(2).unwrap();
        record.set_file_length(0x1122_3344).unwrap();
        record.set_high_water_mark(0x55).unwrap();
        record.set_range(0, 0x10, 0x20).unwrap();
        record.set_range(1, 0x30, 0x40).unwrap();

        let bytes = std::fs::read(dir.path().join("out.bin.cfg")).unwrap();
        assert_eq!(&bytes[0..2], &0x0102u16.to_le_bytes());
        assert_eq!(bytes[2], 2);
        assert_eq!(&bytes[3..8], &[0, 0, 0, 0, 0], "reserved bytes stay zero");
        assert_eq!(&bytes[8..16], &0x1122_3344u64.to_le_bytes());
        assert_eq!(&bytes[16..24], &0x55u64.to_le_bytes());
        assert_eq!(&bytes[24..32], &0x10u64.to_le_bytes());
        assert_eq!(&bytes[32..40], &0x20u64.to_le_bytes());
        assert_eq!(&bytes[40..48], &0x30u64.to_le_bytes());
        assert_eq!(&bytes[48..56], &0x40u64.to_le_bytes());
    }

    #[test]
    fn test_reopen_restores_state() {
        let dir = TempDir::new().unwrap();
        {
            let mut record = record_in(&dir, 3);
            record.set_file_length(10_000).unwrap();
            record.set_thread_count(3).unwrap();
            record.set_range(0, 100, 200).unwrap();
            record.set_range(2, 900, 1000).unwrap();
            record.set_high_water_mark(1000).unwrap();
            record.add_active_seconds(42).unwrap();
        }
        let record = record_in(&dir, 3);
        assert_eq!(record.file_length(), 10_000);
        assert_eq!(record.thread_count(), 3);
        assert_eq!(record.range(0), (100, 200));
        assert_eq!(record.range(2), (900, 1000));
        assert_eq!(record.high_water_mark(), 1000);
        assert_eq!(record.active_seconds(), 42);
    }

    #[test]
    fn test_claim_chunks_are_disjoint_and_monotonic() {
        let dir = TempDir::new().unwrap();
        let mut record = record_in(&dir, 3);
        record.set_file_length(2500).unwrap();
        record.set_thread_count(3).unwrap();

        let first = record.claim_next_chunk(0, 1000).unwrap().unwrap();
        let second = record.claim_next_chunk(1, 1000).unwrap().unwrap();
        let third = record.claim_next_chunk(2, 1000).unwrap().unwrap();

        assert_eq!(first, (0, 1000));
        assert_eq!(second, (1000, 2000));
        assert_eq!(third, (2000, 2500), "final chunk clipped to file length");
        assert_eq!(record.high_water_mark(), 2500);
        assert!(record.claim_next_chunk(0, 1000).unwrap().is_none());
    }

    #[test]
    fn test_claim_without_file_length_yields_nothing() {
        let dir = TempDir::new().unwrap();
        let mut record = record_in(&dir, 2);
        assert!(record.claim_next_chunk(0, 1000).unwrap().is_none());
    }

    #[test]
    fn test_high_water_mark_never_decreases_across_claims() {
        let dir = TempDir::new().unwrap();
        let mut record = record_in(&dir, 2);
        record.set_file_length(5000).unwrap();
        let mut last = 0;
        while let Some((_, end)) = record.claim_next_chunk(0, 700).unwrap() {
            assert!(end > last);
            last = end;
        }
        assert_eq!(record.high_water_mark(), 5000);
    }

    #[test]
    fn test_repair_high_water_mark_on_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut record = record_in(&dir, 2);
            record.set_file_length(4000).unwrap();
            record.set_thread_count(2).unwrap();
            record.set_range(0, 0, 1000).unwrap();
            record.set_range(1, 1000, 2000).unwrap();
            // Simulate a crash after the slot write but before the mark
            // caught up.
            record.set_high_water_mark(1000).unwrap();
        }
        let record = record_in(&dir, 2);
        assert_eq!(record.high_water_mark(), 2000);
    }

    #[test]
    fn test_repair_skips_untouched_record() {
        let dir = TempDir::new().unwrap();
        {
            let mut record = record_in(&dir, 2);
            record.set_file_length(4000).unwrap();
        }
        let record = record_in(&dir, 2);
        assert_eq!(record.high_water_mark(), 0);
    }

    #[test]
    fn test_downloaded_bytes_accounting() {
        let dir = TempDir::new().unwrap();
        let mut record = record_in(&dir, 3);
        record.set_file_length(3000).unwrap();
        record.set_thread_count(3).unwrap();
        record.claim_next_chunk(0, 1000).unwrap();
        record.claim_next_chunk(1, 1000).unwrap();
        record.claim_next_chunk(2, 1000).unwrap();

        // Slot 0 fully streamed, slot 1 halfway, slot 2 untouched.
        record.set_start_offset(0, 1000).unwrap();
        record.set_start_offset(1, 1500).unwrap();
        assert_eq!(record.downloaded_bytes(), 1000 + 500);
    }

    #[test]
    fn test_reset_zeroes_everything() {
        let dir = TempDir::new().unwrap();
        let mut record = record_in(&dir, 2);
        record.set_file_length(9999).unwrap();
        record.set_thread_count(2).unwrap();
        record.set_range(0, 5, 10).unwrap();
        record.add_active_seconds(7).unwrap();

        record.reset().unwrap();
        assert_eq!(record.file_length(), 0);
        assert_eq!(record.thread_count(), 0);
        assert_eq!(record.range(0), (0, 0));
        assert_eq!(record.active_seconds(), 0);

        let bytes = std::fs::read(dir.path().join("out.bin.cfg")).unwrap();
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_active_seconds_saturate() {
        let dir = TempDir::new().unwrap();
        let mut record = record_in(&dir, 1);
        record.add_active_seconds(u16::MAX - 1).unwrap();
        record.add_active_seconds(100).unwrap();
        assert_eq!(record.active_seconds(), u16::MAX);
    }

    #[test]
    fn test_delete_removes_file() {
        let dir = TempDir::new().unwrap();
        let record = record_in(&dir, 1);
        let path = dir.path().join("out.bin.cfg");
        assert!(path.exists());
        record.delete().unwrap();
        assert!(!path.exists());
    }
}
