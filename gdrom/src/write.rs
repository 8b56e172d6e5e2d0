//! [`TrackWriter`] and progress reporting.

use std::io::Write;

use crate::{
    disc::{sector::encode_raw_into, RAW_SECTOR_SIZE, SECTOR_SIZE},
    Result, ResultContext,
};

/// Writes logical sectors to a track file, optionally encoding each one as a raw mode 1
/// frame.
///
/// Input does not need to be sector aligned; a trailing partial sector is zero-padded by
/// [`finish`](Self::finish).
pub struct TrackWriter<W> {
    inner: W,
    raw: bool,
    lba: u32,
    pending: Vec<u8>,
    frame: Box<[u8; RAW_SECTOR_SIZE]>,
    written: u64,
}

impl<W> TrackWriter<W>
where W: Write
{
    /// Creates a writer for a track starting at absolute `start_lba`.
    pub fn new(inner: W, start_lba: u32, raw: bool) -> Self {
        Self {
            inner,
            raw,
            lba: start_lba,
            pending: Vec::with_capacity(SECTOR_SIZE),
            frame: Box::new([0u8; RAW_SECTOR_SIZE]),
            written: 0,
        }
    }

    /// The LBA of the next sector to be written.
    #[inline]
    pub fn next_lba(&self) -> u32 { self.lba }

    /// Bytes written to the underlying writer so far.
    #[inline]
    pub fn bytes_written(&self) -> u64 { self.written }

    fn write_sector(&mut self, sector: &[u8]) -> Result<()> {
        if self.raw {
            encode_raw_into(&mut self.frame, sector, self.lba)?;
            self.inner
                .write_all(self.frame.as_slice())
                .with_context(|| format!("Writing raw sector {}", self.lba))?;
            self.written += RAW_SECTOR_SIZE as u64;
        } else {
            self.inner
                .write_all(sector)
                .with_context(|| format!("Writing sector {}", self.lba))?;
            if sector.len() < SECTOR_SIZE {
                static ZEROES: [u8; SECTOR_SIZE] = [0u8; SECTOR_SIZE];
                self.inner
                    .write_all(&ZEROES[sector.len()..])
                    .with_context(|| format!("Writing sector {}", self.lba))?;
            }
            self.written += SECTOR_SIZE as u64;
        }
        self.lba += 1;
        Ok(())
    }

    /// Writes logical data.
    pub fn write_logical(&mut self, mut data: &[u8]) -> Result<()> {
        if !self.pending.is_empty() {
            let take = (SECTOR_SIZE - self.pending.len()).min(data.len());
            self.pending.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.pending.len() < SECTOR_SIZE {
                return Ok(());
            }
            let sector = std::mem::take(&mut self.pending);
            self.write_sector(&sector)?;
            self.pending = sector;
            self.pending.clear();
        }
        let mut chunks = data.chunks_exact(SECTOR_SIZE);
        for sector in chunks.by_ref() {
            self.write_sector(sector)?;
        }
        self.pending.extend_from_slice(chunks.remainder());
        Ok(())
    }

    /// Pads and writes any partial sector, flushes, and returns the inner writer.
    pub fn finish(mut self) -> Result<W> {
        if !self.pending.is_empty() {
            let sector = std::mem::take(&mut self.pending);
            self.write_sector(&sector)?;
        }
        self.inner.flush().context("Flushing track")?;
        Ok(self.inner)
    }
}

/// Converts byte counts into percentage callbacks.
///
/// The callback receives strictly increasing values no greater than 100, at most once every
/// `interval` calls to [`advance`](Self::advance). [`finish`](Self::finish) always reports
/// 100 unless it was already reported.
pub struct ProgressReporter<F>
where F: FnMut(u8)
{
    callback: F,
    total: u64,
    done: u64,
    interval: u32,
    ticks: u32,
    last: Option<u8>,
}

impl<F> ProgressReporter<F>
where F: FnMut(u8)
{
    /// Creates a reporter for `total` bytes.
    pub fn new(total: u64, interval: u32, callback: F) -> Self {
        Self { callback, total, done: 0, interval: interval.max(1), ticks: 0, last: None }
    }

    fn report(&mut self) {
        let percent = if self.total == 0 {
            100
        } else {
            (self.done.min(self.total) * 100 / self.total) as u8
        };
        if self.last.is_none_or(|last| percent > last) {
            (self.callback)(percent);
            self.last = Some(percent);
        }
    }

    /// Records `bytes` of progress.
    pub fn advance(&mut self, bytes: u64) {
        self.done += bytes;
        self.ticks += 1;
        if self.ticks % self.interval == 0 {
            self.report();
        }
    }

    /// Reports completion.
    pub fn finish(&mut self) {
        self.done = self.total;
        self.report();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disc::sector::{header_lba, verify_raw};

    #[test]
    fn test_raw_track() {
        let mut writer = TrackWriter::new(Vec::new(), 45000, true);
        // Unaligned writes
        writer.write_logical(&[1u8; 1000]).unwrap();
        writer.write_logical(&[2u8; 3000]).unwrap();
        writer.write_logical(&[3u8; 100]).unwrap();
        assert_eq!(writer.next_lba(), 45001);
        let out = writer.finish().unwrap();
        assert_eq!(out.len(), 3 * RAW_SECTOR_SIZE);
        for (i, frame) in out.chunks_exact(RAW_SECTOR_SIZE).enumerate() {
            let frame: &[u8; RAW_SECTOR_SIZE] = frame.try_into().unwrap();
            assert!(verify_raw(frame));
            assert_eq!(header_lba(frame), 45000 + i as u32);
        }
        assert_eq!(out[16 + 999], 1);
        assert_eq!(out[16 + 1000], 2);
        let last = &out[2 * RAW_SECTOR_SIZE + 16..2 * RAW_SECTOR_SIZE + 16 + SECTOR_SIZE];
        assert_eq!(last[0..4], [3, 3, 3, 3]);
        assert!(last[100..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_plain_track() {
        let mut writer = TrackWriter::new(Vec::new(), 0, false);
        writer.write_logical(&[7u8; SECTOR_SIZE + 1]).unwrap();
        assert_eq!(writer.bytes_written(), SECTOR_SIZE as u64);
        let out = writer.finish().unwrap();
        assert_eq!(out.len(), 2 * SECTOR_SIZE);
        assert_eq!(out[SECTOR_SIZE], 7);
        assert_eq!(out[SECTOR_SIZE + 1], 0);
    }

    #[test]
    fn test_progress_monotonic() {
        let mut reported = Vec::new();
        let mut progress = ProgressReporter::new(1000, 2, |p| reported.push(p));
        for _ in 0..10 {
            progress.advance(150);
        }
        progress.finish();
        drop(progress);
        assert!(reported.windows(2).all(|w| w[0] < w[1]));
        assert!(reported.iter().all(|&p| p <= 100));
        assert_eq!(reported.last(), Some(&100));
        // Only every second tick reports: 30, 60, 90, 100 (clamped)
        assert_eq!(reported, vec![30, 60, 90, 100]);
    }
}
