use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
};

use tracing::warn;

use crate::{
    common::TrackKind,
    disc::{
        gdi::{GdiEntry, GdiManifest},
        FIRST_HD_TRACK,
    },
    io::iso::read_exact_at,
    read::{Partition, SectorSource},
    Error, Result,
};

/// A GDI track set: a manifest plus one file per track, addressed by absolute LBA.
#[derive(Debug)]
pub struct GdiSource {
    tracks: Vec<Track<PathBuf>>,
    open_track: Option<Track<File>>,
}

#[derive(Debug, Clone)]
struct Track<T> {
    inner: T,
    entry: GdiEntry,
    size: u64,
}

impl<T> Track<T> {
    fn sectors(&self) -> u32 { self.size.div_ceil(self.entry.sector_size as u64) as u32 }

    fn contains(&self, lba: u32) -> bool {
        self.entry.lba <= lba && lba < self.entry.lba + self.sectors()
    }
}

impl GdiSource {
    /// Opens a manifest. Track files that do not exist are skipped.
    pub fn open(path: &Path) -> Result<Self> {
        let manifest = GdiManifest::load(path)?;
        let dir = path.parent().unwrap_or(Path::new("."));
        let mut tracks = Vec::with_capacity(manifest.entries.len());
        for entry in manifest.entries {
            let track_path = dir.join(&entry.file_name);
            match track_path.metadata() {
                Ok(metadata) => {
                    tracks.push(Track { inner: track_path, size: metadata.len(), entry });
                }
                Err(e) => warn!("Skipping track {} ({}): {}", entry.number, track_path.display(), e),
            }
        }
        Ok(Self { tracks, open_track: None })
    }

    /// The span of the high-density tracks, starting at the first high-density data track.
    pub fn high_density_partition(&self) -> Result<Partition> {
        let high_density = || self.tracks.iter().filter(|t| t.entry.number >= FIRST_HD_TRACK);
        let start = high_density()
            .find(|t| t.entry.kind == TrackKind::Data)
            .map(|t| t.entry.lba)
            .ok_or_else(|| Error::DiscFormat("GDI has no high-density data track".to_string()))?;
        let end = high_density().map(|t| t.entry.lba + t.sectors()).max().unwrap_or(start);
        Ok(Partition { start, end })
    }

    fn data_sector_size(&self) -> usize {
        self.tracks
            .iter()
            .filter(|t| t.entry.number >= FIRST_HD_TRACK && t.entry.kind == TrackKind::Data)
            .chain(self.tracks.iter())
            .map(|t| t.entry.sector_size as usize)
            .next()
            .unwrap_or(crate::disc::RAW_SECTOR_SIZE)
    }
}

impl SectorSource for GdiSource {
    fn read_sector(&mut self, lba: u32, out: &mut [u8]) -> io::Result<()> {
        let track = if self.open_track.as_ref().is_none_or(|t| !t.contains(lba)) {
            let Some(track) = self.tracks.iter().find(|t| t.contains(lba)) else {
                if self.tracks.iter().any(|t| t.entry.lba > lba) {
                    // Pregap between tracks
                    out.fill(0);
                    return Ok(());
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("LBA {lba} is past the last track"),
                ));
            };
            let file = File::open(&track.inner)?;
            self.open_track.insert(Track { inner: file, entry: track.entry.clone(), size: track.size })
        } else {
            match self.open_track.as_mut() {
                Some(track) => track,
                None => return Err(io::Error::from(io::ErrorKind::NotFound)),
            }
        };
        if track.entry.sector_size as usize != out.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "Track {} has {} byte sectors, expected {}",
                    track.entry.number,
                    track.entry.sector_size,
                    out.len()
                ),
            ));
        }
        let pos = track.entry.offset + (lba - track.entry.lba) as u64 * out.len() as u64;
        let read = track.size.saturating_sub(pos).min(out.len() as u64) as usize;
        read_exact_at(&mut track.inner, &mut out[..read], pos)?;
        out[read..].fill(0);
        Ok(())
    }

    #[inline]
    fn sector_size(&self) -> usize { self.data_sector_size() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disc::{sector::encode_raw, RAW_SECTOR_SIZE, SECTOR_SIZE};

    #[test]
    fn test_track_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let mut data = Vec::new();
        for lba in 45000..45004 {
            data.extend_from_slice(&encode_raw(&[(lba - 45000) as u8; SECTOR_SIZE], lba).unwrap());
        }
        std::fs::write(dir.path().join("track03.bin"), &data).unwrap();
        std::fs::write(dir.path().join("track04.bin"), &data[..RAW_SECTOR_SIZE]).unwrap();
        std::fs::write(
            dir.path().join("disc.gdi"),
            "4\n1 0 4 2352 track01.bin 0\n2 756 0 2352 track02.raw 0\n\
             3 45000 4 2352 track03.bin 0\n4 45200 4 2352 track04.bin 0\n",
        )
        .unwrap();
        let mut source = GdiSource::open(&dir.path().join("disc.gdi")).unwrap();
        assert_eq!(source.sector_size(), RAW_SECTOR_SIZE);
        assert_eq!(source.high_density_partition().unwrap(), Partition {
            start: 45000,
            end: 45201
        });
        let mut out = vec![0u8; RAW_SECTOR_SIZE];
        source.read_sector(45003, &mut out).unwrap();
        assert_eq!(out[16], 3);
        source.read_sector(45100, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0));
        source.read_sector(45200, &mut out).unwrap();
        assert_eq!(out[16], 0);
        assert!(source.read_sector(45201, &mut out).is_err());
    }
}
