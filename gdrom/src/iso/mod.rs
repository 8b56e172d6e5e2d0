//! ISO9660 on-disc structures.
//!
//! All multi-byte integers in ISO9660 are either stored in one byte order or in "both-endian"
//! form (little-endian immediately followed by big-endian). The structures here are plain
//! [`zerocopy`] views over the raw descriptor and record bytes.

use std::borrow::Cow;

use chrono::{DateTime, Datelike, NaiveDate, TimeDelta, TimeZone, Timelike, Utc};
use zerocopy::{
    big_endian, little_endian, FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout,
};

use crate::{common::Encoding, disc::SECTOR_SIZE, util::static_assert, Result};

pub mod tree;

/// Standard identifier of every volume descriptor.
pub const STANDARD_ID: [u8; 5] = *b"CD001";

/// Sector index (relative to the volume start) of the first volume descriptor.
pub const DESCRIPTOR_START_SECTOR: u32 = 16;

/// Size of a directory record without its identifier.
pub const DIRECTORY_RECORD_HEADER_SIZE: usize = 33;

/// Size of a path table record without its identifier.
pub const PATH_TABLE_RECORD_HEADER_SIZE: usize = 8;

/// Joliet escape sequences (UCS-2 levels 1, 2 and 3).
pub const JOLIET_ESCAPES: [[u8; 3]; 3] = [*b"%/@", *b"%/C", *b"%/E"];

/// Directory record flag: entry is a directory.
pub const FLAG_DIRECTORY: u8 = 0x02;

/// Volume descriptor type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DescriptorType {
    /// Boot record
    Boot = 0,
    /// Primary volume descriptor
    Primary = 1,
    /// Supplementary volume descriptor (Joliet)
    Supplementary = 2,
    /// Volume partition descriptor
    Partition = 3,
    /// Set terminator
    Terminator = 255,
}

impl DescriptorType {
    /// Parses a descriptor type byte.
    #[inline]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Boot),
            1 => Some(Self::Primary),
            2 => Some(Self::Supplementary),
            3 => Some(Self::Partition),
            255 => Some(Self::Terminator),
            _ => None,
        }
    }
}

/// A 32-bit integer stored in both byte orders.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct BothU32 {
    le: little_endian::U32,
    be: big_endian::U32,
}

static_assert!(size_of::<BothU32>() == 8);

impl BothU32 {
    /// Creates a new both-endian value.
    #[inline]
    pub fn new(value: u32) -> Self {
        Self { le: little_endian::U32::new(value), be: big_endian::U32::new(value) }
    }

    /// The little-endian half.
    #[inline]
    pub fn get(&self) -> u32 { self.le.get() }
}

/// A 16-bit integer stored in both byte orders.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct BothU16 {
    le: little_endian::U16,
    be: big_endian::U16,
}

static_assert!(size_of::<BothU16>() == 4);

impl BothU16 {
    /// Creates a new both-endian value.
    #[inline]
    pub fn new(value: u16) -> Self {
        Self { le: little_endian::U16::new(value), be: big_endian::U16::new(value) }
    }

    /// The little-endian half.
    #[inline]
    pub fn get(&self) -> u16 { self.le.get() }
}

/// Seven-byte recording date used in directory records.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct RecordDate {
    /// Years since 1900
    pub year: u8,
    /// 1-12
    pub month: u8,
    /// 1-31
    pub day: u8,
    /// 0-23
    pub hour: u8,
    /// 0-59
    pub minute: u8,
    /// 0-59
    pub second: u8,
    /// Offset from GMT in 15 minute intervals
    pub gmt_offset: i8,
}

static_assert!(size_of::<RecordDate>() == 7);

impl RecordDate {
    /// Converts a UTC timestamp.
    pub fn from_datetime(dt: &DateTime<Utc>) -> Self {
        Self {
            year: (dt.year() - 1900).clamp(0, 255) as u8,
            month: dt.month() as u8,
            day: dt.day() as u8,
            hour: dt.hour() as u8,
            minute: dt.minute() as u8,
            second: dt.second() as u8,
            gmt_offset: 0,
        }
    }

    /// Converts to a UTC timestamp. Returns `None` for unset or invalid dates.
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        let naive = NaiveDate::from_ymd_opt(
            1900 + self.year as i32,
            self.month as u32,
            self.day as u32,
        )?
        .and_hms_opt(self.hour as u32, self.minute as u32, self.second as u32)?;
        let naive = naive.checked_sub_signed(TimeDelta::minutes(self.gmt_offset as i64 * 15))?;
        Some(Utc.from_utc_datetime(&naive))
    }
}

/// Seventeen-byte ASCII date used in volume descriptors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct DescriptorDate {
    /// "YYYYMMDDHHMMSScc"
    pub digits: [u8; 16],
    /// Offset from GMT in 15 minute intervals
    pub gmt_offset: i8,
}

static_assert!(size_of::<DescriptorDate>() == 17);

impl Default for DescriptorDate {
    fn default() -> Self { Self::UNSET }
}

impl DescriptorDate {
    /// An unset date (all digits zero).
    pub const UNSET: DescriptorDate = DescriptorDate { digits: [b'0'; 16], gmt_offset: 0 };

    /// Converts a UTC timestamp.
    pub fn from_datetime(dt: &DateTime<Utc>) -> Self {
        let text = format!(
            "{:04}{:02}{:02}{:02}{:02}{:02}{:02}",
            dt.year().clamp(0, 9999),
            dt.month(),
            dt.day(),
            dt.hour(),
            dt.minute(),
            dt.second(),
            dt.timestamp_subsec_millis() / 10
        );
        let mut digits = [b'0'; 16];
        digits.copy_from_slice(&text.as_bytes()[..16]);
        Self { digits, gmt_offset: 0 }
    }

    /// Converts to a UTC timestamp. Returns `None` for unset or invalid dates.
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        if self.digits.iter().all(|&b| b == b'0' || b == 0) {
            return None;
        }
        let text = std::str::from_utf8(&self.digits).ok()?;
        let field = |range: std::ops::Range<usize>| text.get(range)?.parse::<u32>().ok();
        let naive = NaiveDate::from_ymd_opt(field(0..4)? as i32, field(4..6)?, field(6..8)?)?
            .and_hms_milli_opt(field(8..10)?, field(10..12)?, field(12..14)?, field(14..16)? * 10)?;
        let naive = naive.checked_sub_signed(TimeDelta::minutes(self.gmt_offset as i64 * 15))?;
        Some(Utc.from_utc_datetime(&naive))
    }
}

/// Fixed part of a directory record. The identifier follows immediately.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct DirectoryRecordHeader {
    /// Total record length, including the identifier and padding
    pub length: u8,
    /// Extended attribute record length
    pub ext_attr_length: u8,
    /// Location of the extent (absolute LBA)
    pub extent: BothU32,
    /// Data length in bytes
    pub data_length: BothU32,
    /// Recording date
    pub recorded: RecordDate,
    /// File flags
    pub flags: u8,
    /// Interleaved file unit size
    pub file_unit_size: u8,
    /// Interleave gap size
    pub interleave_gap: u8,
    /// Volume sequence number
    pub volume_sequence_number: BothU16,
    /// Identifier length
    pub name_length: u8,
}

static_assert!(size_of::<DirectoryRecordHeader>() == DIRECTORY_RECORD_HEADER_SIZE);

impl DirectoryRecordHeader {
    /// Creates a header for a record with an identifier of `name_len` bytes.
    pub fn new(
        name_len: usize,
        location: u32,
        data_length: u32,
        recorded: &DateTime<Utc>,
        is_dir: bool,
    ) -> Self {
        Self {
            length: directory_record_size(name_len) as u8,
            ext_attr_length: 0,
            extent: BothU32::new(location),
            data_length: BothU32::new(data_length),
            recorded: RecordDate::from_datetime(recorded),
            flags: if is_dir { FLAG_DIRECTORY } else { 0 },
            file_unit_size: 0,
            interleave_gap: 0,
            volume_sequence_number: BothU16::new(1),
            name_length: name_len as u8,
        }
    }

    /// Whether the record describes a directory.
    #[inline]
    pub fn is_dir(&self) -> bool { self.flags & FLAG_DIRECTORY != 0 }
}

/// Returns the on-disc size of a directory record with an identifier of `name_len` bytes.
#[inline]
pub fn directory_record_size(name_len: usize) -> usize {
    (DIRECTORY_RECORD_HEADER_SIZE + name_len).next_multiple_of(2)
}

/// Returns the on-disc size of a path table record with an identifier of `name_len` bytes.
#[inline]
pub fn path_table_record_size(name_len: usize) -> usize {
    (PATH_TABLE_RECORD_HEADER_SIZE + name_len).next_multiple_of(2)
}

/// Appends a directory record to `out`.
pub fn write_directory_record(
    out: &mut Vec<u8>,
    name: &[u8],
    location: u32,
    data_length: u32,
    recorded: &DateTime<Utc>,
    is_dir: bool,
) {
    let header = DirectoryRecordHeader::new(name.len(), location, data_length, recorded, is_dir);
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(name);
    if name.len() % 2 == 0 {
        out.push(0);
    }
}

/// Parses a directory record from the start of `data`, returning the header and identifier.
///
/// Returns `None` on a zero-length record (end of records in this sector) or truncated data.
pub fn parse_directory_record(data: &[u8]) -> Option<(DirectoryRecordHeader, &[u8])> {
    let (header, _) = DirectoryRecordHeader::read_from_prefix(data).ok()?;
    let length = header.length as usize;
    let name_end = DIRECTORY_RECORD_HEADER_SIZE + header.name_length as usize;
    if length < DIRECTORY_RECORD_HEADER_SIZE || name_end > length || length > data.len() {
        return None;
    }
    Some((header, &data[DIRECTORY_RECORD_HEADER_SIZE..name_end]))
}

/// Primary or supplementary volume descriptor.
#[derive(Clone, Debug, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct VolumeDescriptor {
    /// Descriptor type
    pub descriptor_type: u8,
    /// "CD001"
    pub standard_id: [u8; 5],
    /// Version (1)
    pub version: u8,
    /// Volume flags (supplementary only)
    pub flags: u8,
    /// System identifier
    pub system_id: [u8; 32],
    /// Volume identifier
    pub volume_id: [u8; 32],
    _unused1: [u8; 8],
    /// Volume space size in sectors
    pub volume_space_size: BothU32,
    /// Escape sequences (supplementary only)
    pub escape_sequences: [u8; 32],
    /// Volume set size
    pub volume_set_size: BothU16,
    /// Volume sequence number
    pub volume_sequence_number: BothU16,
    /// Logical block size
    pub logical_block_size: BothU16,
    /// Path table size in bytes
    pub path_table_size: BothU32,
    /// Type L path table location
    pub path_table_l: little_endian::U32,
    /// Optional type L path table location
    pub opt_path_table_l: little_endian::U32,
    /// Type M path table location
    pub path_table_m: big_endian::U32,
    /// Optional type M path table location
    pub opt_path_table_m: big_endian::U32,
    /// Root directory record
    pub root: DirectoryRecordHeader,
    /// Root directory record identifier
    pub root_name: u8,
    /// Volume set identifier
    pub volume_set_id: [u8; 128],
    /// Publisher identifier
    pub publisher_id: [u8; 128],
    /// Data preparer identifier
    pub preparer_id: [u8; 128],
    /// Application identifier
    pub application_id: [u8; 128],
    /// Copyright file identifier
    pub copyright_file_id: [u8; 37],
    /// Abstract file identifier
    pub abstract_file_id: [u8; 37],
    /// Bibliographic file identifier
    pub bibliographic_file_id: [u8; 37],
    /// Volume creation date
    pub creation_date: DescriptorDate,
    /// Volume modification date
    pub modification_date: DescriptorDate,
    /// Volume expiration date
    pub expiration_date: DescriptorDate,
    /// Volume effective date
    pub effective_date: DescriptorDate,
    /// File structure version (1)
    pub file_structure_version: u8,
    _reserved1: u8,
    /// Application use
    pub application_use: [u8; 512],
    _reserved2: [u8; 653],
}

static_assert!(size_of::<VolumeDescriptor>() == SECTOR_SIZE);
static_assert!(std::mem::offset_of!(VolumeDescriptor, volume_space_size) == 80);
static_assert!(std::mem::offset_of!(VolumeDescriptor, path_table_size) == 132);
static_assert!(std::mem::offset_of!(VolumeDescriptor, root) == 156);
static_assert!(std::mem::offset_of!(VolumeDescriptor, volume_set_id) == 190);
static_assert!(std::mem::offset_of!(VolumeDescriptor, creation_date) == 813);
static_assert!(std::mem::offset_of!(VolumeDescriptor, file_structure_version) == 881);

impl VolumeDescriptor {
    /// Creates an empty descriptor of the given type with the standard identifier set.
    pub fn new(descriptor_type: DescriptorType) -> Result<Box<Self>> {
        let mut desc = Self::new_box_zeroed()?;
        desc.descriptor_type = descriptor_type as u8;
        desc.standard_id = STANDARD_ID;
        desc.version = 1;
        Ok(desc)
    }

    /// Whether the standard identifier matches.
    #[inline]
    pub fn is_valid(&self) -> bool { self.standard_id == STANDARD_ID }

    /// Whether this is a Joliet supplementary descriptor.
    pub fn is_joliet(&self) -> bool {
        self.descriptor_type == DescriptorType::Supplementary as u8
            && JOLIET_ESCAPES.iter().any(|esc| self.escape_sequences.starts_with(esc))
    }

    /// The encoding of identifiers in this descriptor and its directory tree.
    #[inline]
    pub fn encoding(&self) -> Encoding {
        if self.is_joliet() {
            Encoding::Joliet
        } else {
            Encoding::Primary
        }
    }

    /// Decodes a fixed-size identifier field of this descriptor.
    #[inline]
    pub fn field_str<'a>(&self, field: &'a [u8]) -> Cow<'a, str> {
        decode_identifier(field, self.encoding())
    }
}

/// Writes a string into a fixed-size descriptor field, padding with spaces.
pub fn write_field(field: &mut [u8], value: &str, encoding: Encoding) {
    match encoding {
        Encoding::Primary => {
            field.fill(b' ');
            for (out, c) in field.iter_mut().zip(value.chars()) {
                *out = if c.is_ascii() && !c.is_ascii_control() { c as u8 } else { b'_' };
            }
        }
        Encoding::Joliet => {
            for pair in field.chunks_exact_mut(2) {
                pair.copy_from_slice(&[0x00, 0x20]);
            }
            for (out, unit) in field.chunks_exact_mut(2).zip(value.encode_utf16()) {
                out.copy_from_slice(&unit.to_be_bytes());
            }
        }
    }
}

/// Decodes an identifier (descriptor field or record name) in the given encoding, trimming
/// trailing padding.
pub fn decode_identifier(data: &[u8], encoding: Encoding) -> Cow<str> {
    match encoding {
        Encoding::Primary => {
            let s = String::from_utf8_lossy(data);
            match s {
                Cow::Borrowed(s) => Cow::Borrowed(s.trim_end_matches([' ', '\0'])),
                Cow::Owned(s) => Cow::Owned(s.trim_end_matches([' ', '\0']).to_string()),
            }
        }
        Encoding::Joliet => {
            let (s, _) = encoding_rs::UTF_16BE.decode_without_bom_handling(data);
            Cow::Owned(s.trim_end_matches([' ', '\0']).to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_both_endian() {
        let v = BothU32::new(0x12345678);
        assert_eq!(v.as_bytes(), &[0x78, 0x56, 0x34, 0x12, 0x12, 0x34, 0x56, 0x78]);
        assert_eq!(BothU16::new(2048).as_bytes(), &[0x00, 0x08, 0x08, 0x00]);
    }

    #[test]
    fn test_directory_record() {
        let dt = Utc.with_ymd_and_hms(1999, 9, 9, 12, 30, 0).unwrap();
        let mut out = Vec::new();
        write_directory_record(&mut out, b"1ST_READ.BIN;1", 45123, 1000, &dt, false);
        assert_eq!(out.len(), 48);
        assert_eq!(out[0], 48);
        let (header, name) = parse_directory_record(&out).unwrap();
        assert_eq!(name, b"1ST_READ.BIN;1");
        assert_eq!(header.extent.get(), 45123);
        assert_eq!(header.data_length.get(), 1000);
        assert!(!header.is_dir());
        assert_eq!(header.recorded.to_datetime(), Some(dt));

        // Odd-length identifiers need no padding
        out.clear();
        write_directory_record(&mut out, &[0], 45020, 2048, &dt, true);
        assert_eq!(out.len(), 34);
        assert!(parse_directory_record(&out).unwrap().0.is_dir());
        assert!(parse_directory_record(&[0u8; 40]).is_none());
    }

    #[test]
    fn test_descriptor_date() {
        let dt = Utc.with_ymd_and_hms(2001, 2, 3, 4, 5, 6).unwrap();
        let date = DescriptorDate::from_datetime(&dt);
        assert_eq!(&date.digits, b"2001020304050600");
        assert_eq!(date.to_datetime(), Some(dt));
        assert_eq!(DescriptorDate::UNSET.to_datetime(), None);
    }

    #[test]
    fn test_write_field() {
        let mut field = [0u8; 8];
        write_field(&mut field, "GDROM", Encoding::Primary);
        assert_eq!(&field, b"GDROM   ");
        write_field(&mut field, "Ab", Encoding::Joliet);
        assert_eq!(&field, &[0, b'A', 0, b'b', 0, 0x20, 0, 0x20]);
        assert_eq!(decode_identifier(&field, Encoding::Joliet), "Ab");
    }
}
