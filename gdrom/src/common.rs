//! Common types.

use std::{fmt, str::FromStr};

use crate::disc::{RAW_SECTOR_SIZE, SECTOR_SIZE};

/// The kind of a disc track, as stored in the control nibble of a TOC entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    /// CDDA audio track.
    Audio,
    /// Mode 1 data track.
    Data,
}

impl TrackKind {
    /// The numeric track type used in GDI manifests and the TOC control nibble.
    #[inline]
    pub fn value(self) -> u8 {
        match self {
            TrackKind::Audio => 0,
            TrackKind::Data => 4,
        }
    }

    /// Parses a numeric track type.
    #[inline]
    pub fn from_value(value: u8) -> Option<Self> {
        match value {
            0 => Some(TrackKind::Audio),
            4 => Some(TrackKind::Data),
            _ => None,
        }
    }
}

impl fmt::Display for TrackKind {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            TrackKind::Audio => "Audio",
            TrackKind::Data => "Data",
        })
    }
}

/// A track placed in the high-density area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscTrack {
    /// The track number (3 for the first high-density track).
    pub number: u8,
    /// The track file name, relative to the manifest.
    pub file_name: String,
    /// The absolute start LBA.
    pub lba: u32,
    /// The track kind.
    pub kind: TrackKind,
    /// The size of the track file in bytes.
    pub size: u64,
    /// The sector size of the track file (2048 or 2352).
    pub sector_size: u32,
}

impl DiscTrack {
    /// The number of sectors the track occupies.
    #[inline]
    pub fn sector_count(&self) -> u32 { self.size.div_ceil(self.sector_size as u64) as u32 }

    /// The first LBA after the track.
    #[inline]
    pub fn end_lba(&self) -> u32 { self.lba + self.sector_count() }

    /// Whether the track file holds raw 2352-byte frames.
    #[inline]
    pub fn is_raw(&self) -> bool { self.sector_size as usize == RAW_SECTOR_SIZE }
}

/// The character encoding of an ISO9660 directory tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Encoding {
    /// Primary volume descriptor tree (d-characters).
    #[default]
    Primary,
    /// Joliet supplementary tree (UCS-2 big-endian).
    Joliet,
}

impl fmt::Display for Encoding {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Encoding::Primary => write!(f, "ISO9660"),
            Encoding::Joliet => write!(f, "Joliet"),
        }
    }
}

impl FromStr for Encoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "iso" | "iso9660" | "primary" => Ok(Encoding::Primary),
            "joliet" => Ok(Encoding::Joliet),
            _ => Err(format!("Unknown encoding: {s:?}")),
        }
    }
}

/// Byte order of a path table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endian {
    /// Type L path table.
    Little,
    /// Type M path table.
    Big,
}

/// Returns the number of logical sectors needed to hold `len` bytes.
#[inline]
pub fn sectors_for(len: u64) -> u64 { len.div_ceil(SECTOR_SIZE as u64) }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_kind_display() {
        assert_eq!(format!("{:<5}|", TrackKind::Data), "Data |");
        assert_eq!(format!("{:>6}", TrackKind::Audio), " Audio");
    }

    #[test]
    fn test_encoding_from_str() {
        assert_eq!("ISO9660".parse::<Encoding>(), Ok(Encoding::Primary));
        assert_eq!("joliet".parse::<Encoding>(), Ok(Encoding::Joliet));
        assert!("udf".parse::<Encoding>().is_err());
    }
}
