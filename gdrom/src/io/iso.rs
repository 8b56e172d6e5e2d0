use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
};

use tracing::debug;
use zerocopy::FromBytes;

use crate::{
    disc::{
        sector::{user_data_offset, SYNC},
        GD_START_LBA, RAW_SECTOR_SIZE, SECTOR_SIZE,
    },
    iso::{VolumeDescriptor, DESCRIPTOR_START_SECTOR},
    read::{Partition, SectorSource},
    Result, ResultContext,
};

/// A flat image of logical (2048-byte) or raw (2352-byte) sectors whose first sector sits at
/// `base_lba`.
#[derive(Debug)]
pub struct IsoSource {
    path: PathBuf,
    file: File,
    len: u64,
    sector_size: usize,
    base_lba: u32,
}

pub(crate) fn read_exact_at(file: &mut File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileExt;
        file.read_exact_at(buf, offset)
    }
    #[cfg(not(unix))]
    {
        use std::io::{Read, Seek, SeekFrom};
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)
    }
}

impl IsoSource {
    /// Opens an image with an explicit sector size and base LBA.
    pub fn with_base(path: &Path, sector_size: usize, base_lba: u32) -> Result<Self> {
        let file =
            File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        let len = file
            .metadata()
            .with_context(|| format!("Failed to stat file {}", path.display()))?
            .len();
        Ok(Self { path: path.to_path_buf(), file, len, sector_size, base_lba })
    }

    /// Opens an image, detecting raw sectors by their sync pattern and the base LBA from
    /// the root directory location.
    ///
    /// Images built for the high-density area record absolute LBAs from 45000; if the root
    /// directory would lie past the end of the file at base 0, base 45000 is assumed.
    pub fn open(path: &Path) -> Result<Self> {
        let mut source = Self::with_base(path, SECTOR_SIZE, 0)?;
        let mut head = [0u8; SYNC.len()];
        if source.len >= head.len() as u64 {
            read_exact_at(&mut source.file, &mut head, 0)
                .with_context(|| format!("Reading {}", path.display()))?;
        }
        if head == SYNC && source.len % RAW_SECTOR_SIZE as u64 == 0 {
            source.sector_size = RAW_SECTOR_SIZE;
        }
        let mut sector = vec![0u8; source.sector_size];
        if source.read_sector(DESCRIPTOR_START_SECTOR, &mut sector).is_ok() {
            let offset = if source.sector_size == RAW_SECTOR_SIZE {
                user_data_offset(&sector)
            } else {
                0
            };
            if let Ok(desc) =
                VolumeDescriptor::read_from_bytes(&sector[offset..offset + SECTOR_SIZE])
            {
                let root = desc.root.extent.get();
                if desc.is_valid()
                    && root >= GD_START_LBA
                    && root as u64 * source.sector_size as u64 >= source.len
                {
                    source.base_lba = GD_START_LBA;
                }
            }
        }
        debug!(
            "{}: {} byte sectors, base LBA {}",
            path.display(),
            source.sector_size,
            source.base_lba
        );
        Ok(source)
    }

    /// The partition spanning the whole file.
    pub fn partition(&self) -> Partition {
        let sectors = self.len.div_ceil(self.sector_size as u64) as u32;
        Partition { start: self.base_lba, end: self.base_lba + sectors }
    }

    /// The LBA of the first sector in the file.
    #[inline]
    pub fn base_lba(&self) -> u32 { self.base_lba }
}

impl SectorSource for IsoSource {
    fn read_sector(&mut self, lba: u32, out: &mut [u8]) -> io::Result<()> {
        if lba < self.base_lba {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("LBA {lba} precedes image base {}", self.base_lba),
            ));
        }
        let pos = (lba - self.base_lba) as u64 * self.sector_size as u64;
        if pos >= self.len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("LBA {lba} is past the end of {}", self.path.display()),
            ));
        }
        let read = (self.len - pos).min(out.len() as u64) as usize;
        read_exact_at(&mut self.file, &mut out[..read], pos)?;
        // Partial last sector
        out[read..].fill(0);
        Ok(())
    }

    #[inline]
    fn sector_size(&self) -> usize { self.sector_size }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disc::sector::encode_raw;

    #[test]
    fn test_raw_detection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("track.bin");
        let mut data = Vec::new();
        for lba in 0..4 {
            data.extend_from_slice(&encode_raw(&[lba as u8; SECTOR_SIZE], lba).unwrap());
        }
        std::fs::write(&path, &data).unwrap();
        let mut source = IsoSource::open(&path).unwrap();
        assert_eq!(source.sector_size(), RAW_SECTOR_SIZE);
        assert_eq!(source.partition(), Partition { start: 0, end: 4 });
        let mut out = vec![0u8; RAW_SECTOR_SIZE];
        source.read_sector(2, &mut out).unwrap();
        assert_eq!(out[16], 2);
        assert!(source.read_sector(4, &mut out).is_err());
    }

    #[test]
    fn test_base_lba() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("track.iso");
        std::fs::write(&path, vec![0xAAu8; SECTOR_SIZE * 3 + 100]).unwrap();
        let mut source = IsoSource::with_base(&path, SECTOR_SIZE, 45000).unwrap();
        assert_eq!(source.partition(), Partition { start: 45000, end: 45004 });
        let mut out = vec![0u8; SECTOR_SIZE];
        source.read_sector(45003, &mut out).unwrap();
        assert!(out[..100].iter().all(|&b| b == 0xAA));
        assert!(out[100..].iter().all(|&b| b == 0));
        assert!(source.read_sector(44999, &mut out).is_err());
    }
}
