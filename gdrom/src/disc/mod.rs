//! GD-ROM disc format types.

use std::{borrow::Cow, fmt};

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
    common::{DiscTrack, TrackKind},
    util::static_assert,
    Error, Result,
};

pub mod gdi;
pub(crate) mod reader;
pub mod sector;

/// Size in bytes of a logical (mode 1 user data) sector.
pub const SECTOR_SIZE: usize = 2048;

/// Size in bytes of a raw CD sector frame.
pub const RAW_SECTOR_SIZE: usize = 2352;

/// First LBA of the high-density area.
pub const GD_START_LBA: u32 = 45000;

/// End LBA (exclusive) of the high-density area addressable window.
pub const GD_END_LBA: u32 = 549150;

/// Number of sectors in the pregap between two tracks. Also the bias between an LBA and
/// its MSF/TOC representation.
pub const TRACK_GAP: u32 = 150;

/// Track number of the first track in the high-density area.
pub const FIRST_HD_TRACK: u8 = 3;

/// Size in bytes of the boot header (IP.BIN). It occupies the ISO9660 system area.
pub const BOOT_HEADER_SIZE: usize = 0x8000;

/// Offset of the boot file name within the boot header.
pub const BOOT_FILE_OFFSET: usize = 0x60;

/// Offset of the track table within the boot header.
pub const TOC_OFFSET: usize = 0x104;

/// Number of entries in the boot header track table (tracks 3 through 99).
pub const TOC_ENTRIES: usize = 97;

/// Magic bytes preceding the boot header track table.
pub const TOC_MAGIC: [u8; 4] = *b"TOC1";

/// A single boot header track table entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct TocEntry {
    /// LBA + 150, 24-bit little-endian
    lba: [u8; 3],
    /// `(track type << 4) | 1`
    control: u8,
}

static_assert!(size_of::<TocEntry>() == 4);

impl TocEntry {
    /// Sentinel for unused entries.
    pub const UNUSED: TocEntry = TocEntry { lba: [0xFF; 3], control: 0xFF };

    /// Creates an entry for a track starting at `lba`.
    #[inline]
    pub fn new(lba: u32, kind: TrackKind) -> Self {
        let bytes = (lba + TRACK_GAP).to_le_bytes();
        Self { lba: [bytes[0], bytes[1], bytes[2]], control: (kind.value() << 4) | 1 }
    }

    /// Whether the entry is the unused sentinel.
    #[inline]
    pub fn is_unused(&self) -> bool { *self == Self::UNUSED }

    /// The absolute start LBA of the track.
    #[inline]
    pub fn lba(&self) -> u32 {
        u32::from_le_bytes([self.lba[0], self.lba[1], self.lba[2], 0]).wrapping_sub(TRACK_GAP)
    }

    /// The track kind.
    #[inline]
    pub fn kind(&self) -> Option<TrackKind> { TrackKind::from_value(self.control >> 4) }
}

/// The GD-ROM boot header (IP.BIN).
///
/// Always the first 32 KiB of the first high-density data track.
#[derive(Clone, Debug, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct BootHeader {
    /// Hardware identifier ("SEGA SEGAKATANA")
    pub hardware_id: [u8; 16],
    /// Maker identifier
    pub maker_id: [u8; 16],
    /// Device information (CRC, media and disc numbers)
    pub device_info: [u8; 16],
    /// Area symbols (J, U, E)
    pub area_symbols: [u8; 8],
    /// Peripheral flags
    pub peripherals: [u8; 8],
    /// Product number
    pub product_number: [u8; 10],
    /// Product version
    pub product_version: [u8; 6],
    /// Release date (YYYYMMDD)
    pub release_date: [u8; 16],
    /// Boot file name, space padded
    pub boot_file: [u8; 16],
    /// Software maker name
    pub company: [u8; 16],
    /// Software title
    pub title: [u8; 128],
    /// "TOC1"
    pub toc_magic: [u8; 4],
    /// Track table for tracks 3..=99
    pub toc: [TocEntry; TOC_ENTRIES],
    /// Remaining boot code
    _rest: [u8; BOOT_HEADER_SIZE - TOC_OFFSET - TOC_ENTRIES * 4],
}

static_assert!(size_of::<BootHeader>() == BOOT_HEADER_SIZE);
static_assert!(std::mem::offset_of!(BootHeader, boot_file) == BOOT_FILE_OFFSET);
static_assert!(std::mem::offset_of!(BootHeader, toc) == TOC_OFFSET);

fn trimmed(bytes: &[u8]) -> Cow<str> {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    match String::from_utf8_lossy(&bytes[..end]) {
        Cow::Borrowed(s) => Cow::Borrowed(s.trim()),
        Cow::Owned(s) => Cow::Owned(s.trim().to_string()),
    }
}

impl BootHeader {
    /// Parses a boot header from a buffer, which must be exactly [`BOOT_HEADER_SIZE`] bytes.
    pub fn from_slice(data: &[u8]) -> Result<Box<Self>> {
        if data.len() != BOOT_HEADER_SIZE {
            return Err(Error::BootHeader(format!(
                "boot header is {} bytes, expected {}",
                data.len(),
                BOOT_HEADER_SIZE
            )));
        }
        let mut header = <Self as zerocopy::FromZeros>::new_box_zeroed()?;
        header.as_mut_bytes().copy_from_slice(data);
        Ok(header)
    }

    /// Hardware identifier as a string.
    #[inline]
    pub fn hardware_id_str(&self) -> Cow<str> { trimmed(&self.hardware_id) }

    /// Whether the hardware identifier looks like a Dreamcast boot header.
    #[inline]
    pub fn is_dreamcast(&self) -> bool { self.hardware_id.starts_with(b"SEGA SEGAKATANA") }

    /// Maker identifier as a string.
    #[inline]
    pub fn maker_id_str(&self) -> Cow<str> { trimmed(&self.maker_id) }

    /// Product number as a string.
    #[inline]
    pub fn product_number_str(&self) -> Cow<str> { trimmed(&self.product_number) }

    /// Product version as a string.
    #[inline]
    pub fn product_version_str(&self) -> Cow<str> { trimmed(&self.product_version) }

    /// Release date as a string.
    #[inline]
    pub fn release_date_str(&self) -> Cow<str> { trimmed(&self.release_date) }

    /// Software title as a string.
    #[inline]
    pub fn title_str(&self) -> Cow<str> { trimmed(&self.title) }

    /// Company name as a string.
    #[inline]
    pub fn company_str(&self) -> Cow<str> { trimmed(&self.company) }

    /// The name of the boot file that must be placed last in the volume.
    #[inline]
    pub fn boot_file_name(&self) -> Cow<str> { trimmed(&self.boot_file) }

    /// Iterates over the used track table entries, paired with their track numbers.
    pub fn tracks(&self) -> impl Iterator<Item = (u8, &TocEntry)> {
        self.toc
            .iter()
            .enumerate()
            .take_while(|(_, e)| !e.is_unused())
            .map(|(i, e)| (FIRST_HD_TRACK + i as u8, e))
    }

    /// Rewrites the track table from the final track placement and stamps the `TOC1` magic.
    /// Entries past the last track are set to the unused sentinel.
    pub fn patch_toc(&mut self, tracks: &[DiscTrack]) -> Result<()> {
        if tracks.len() > TOC_ENTRIES {
            return Err(Error::DiscFormat(format!(
                "{} tracks do not fit in the boot header track table ({} max)",
                tracks.len(),
                TOC_ENTRIES
            )));
        }
        for (i, entry) in self.toc.iter_mut().enumerate() {
            *entry = match tracks.get(i) {
                Some(track) => TocEntry::new(track.lba, track.kind),
                None => TocEntry::UNUSED,
            };
        }
        self.toc_magic = TOC_MAGIC;
        Ok(())
    }
}

impl fmt::Display for TocEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unused() {
            return write!(f, "[unused]");
        }
        match self.kind() {
            Some(kind) => write!(f, "{} @ LBA {}", kind, self.lba()),
            None => write!(f, "[invalid control {:#04X}] @ LBA {}", self.control, self.lba()),
        }
    }
}

#[cfg(test)]
mod tests {
    use zerocopy::FromZeros;

    use super::*;

    fn track(number: u8, lba: u32, kind: TrackKind) -> DiscTrack {
        DiscTrack {
            number,
            file_name: format!("track{number:02}.bin"),
            lba,
            kind,
            size: 0,
            sector_size: RAW_SECTOR_SIZE as u32,
        }
    }

    #[test]
    fn test_patch_toc() {
        let mut header = BootHeader::new_box_zeroed().unwrap();
        let tracks = [
            track(3, GD_START_LBA, TrackKind::Data),
            track(4, 46000, TrackKind::Audio),
            track(5, 47000, TrackKind::Data),
        ];
        header.patch_toc(&tracks).unwrap();
        let bytes = header.as_bytes();
        assert_eq!(&bytes[TOC_OFFSET - 4..TOC_OFFSET], b"TOC1");
        assert_eq!(&bytes[TOC_OFFSET..TOC_OFFSET + 4], &[0xDE, 0xB0, 0x00, 0x41]);
        let lba = (46000u32 + 150).to_le_bytes();
        assert_eq!(&bytes[TOC_OFFSET + 4..TOC_OFFSET + 8], &[lba[0], lba[1], lba[2], 0x01]);
        for t in tracks.len()..TOC_ENTRIES {
            let offset = TOC_OFFSET + t * 4;
            assert_eq!(&bytes[offset..offset + 4], &[0xFF; 4]);
        }
        let parsed = header.tracks().map(|(n, e)| (n, e.lba(), e.kind())).collect::<Vec<_>>();
        assert_eq!(parsed, vec![
            (3, GD_START_LBA, Some(TrackKind::Data)),
            (4, 46000, Some(TrackKind::Audio)),
            (5, 47000, Some(TrackKind::Data)),
        ]);
    }

    #[test]
    fn test_patch_toc_too_many_tracks() {
        let mut header = BootHeader::new_box_zeroed().unwrap();
        let tracks = (0..98).map(|i| track(3, GD_START_LBA + i, TrackKind::Audio)).collect::<Vec<_>>();
        assert!(header.patch_toc(&tracks).is_err());
    }

    #[test]
    fn test_boot_file_name() {
        let mut data = vec![0u8; BOOT_HEADER_SIZE];
        data[BOOT_FILE_OFFSET..BOOT_FILE_OFFSET + 16].copy_from_slice(b"1ST_READ.BIN    ");
        let header = BootHeader::from_slice(&data).unwrap();
        assert_eq!(header.boot_file_name(), "1ST_READ.BIN");
        assert!(BootHeader::from_slice(&data[..BOOT_HEADER_SIZE - 1]).is_err());
    }
}
