//! [`VolumeReader`] and associated types.
use std::{
    io,
    io::{Read, Seek},
    path::Path,
};

use chrono::{DateTime, Utc};
use dyn_clone::DynClone;

pub use crate::io::{gdi::GdiSource, iso::IsoSource};
use crate::{
    common::Encoding,
    disc::{reader::MountedVolume, BOOT_HEADER_SIZE},
    Error, Result,
};

/// Required trait bounds for streamed file contents.
pub trait DiscStream: Read + Seek + DynClone + Send + Sync {}

impl<T> DiscStream for T where T: Read + Seek + DynClone + Send + Sync + ?Sized {}

dyn_clone::clone_trait_object!(DiscStream);

/// A sector-addressable disc image.
///
/// Implementations map absolute LBAs onto the underlying container. Sectors are either
/// logical (2048 bytes) or raw frames (2352 bytes); the reader extracts user data from raw
/// frames itself.
pub trait SectorSource: Send {
    /// Reads the sector at `lba` into `out`, which is exactly [`sector_size`](Self::sector_size)
    /// bytes long.
    fn read_sector(&mut self, lba: u32, out: &mut [u8]) -> io::Result<()>;

    /// The size of each sector returned by [`read_sector`](Self::read_sector).
    fn sector_size(&self) -> usize;
}

/// The sector range of the volume to mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    /// First absolute LBA of the volume (where the system area begins).
    pub start: u32,
    /// End LBA (exclusive).
    pub end: u32,
}

/// Which directory tree to read when a volume carries more than one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncodingPreference {
    /// Use the Joliet tree if present, otherwise the primary tree.
    #[default]
    Joliet,
    /// Always use the primary tree.
    Primary,
}

/// Options for mounting a volume.
#[derive(Debug, Clone, Default)]
pub struct ReaderOptions {
    /// Directory tree preference.
    pub encoding: EncodingPreference,
}

/// Where the root directory of a mounted volume was located.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootSource {
    /// The root directory record of the volume descriptor.
    FromDescriptor,
    /// The first entry of the type L path table.
    FromPathTable,
}

/// A resolved directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Entry name without version suffix.
    pub name: String,
    /// Absolute LBA of the extent.
    pub location: u32,
    /// Size in bytes.
    pub size: u64,
    /// Whether the entry is a directory.
    pub is_dir: bool,
    /// Recording timestamp.
    pub recorded: Option<DateTime<Utc>>,
}

/// A decoded primary or supplementary volume descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedVolumeDescriptor {
    /// Absolute LBA of the descriptor sector.
    pub lba: u32,
    /// Identifier encoding.
    pub encoding: Encoding,
    /// System identifier.
    pub system_id: String,
    /// Volume identifier.
    pub volume_id: String,
    /// Volume set identifier.
    pub volume_set_id: String,
    /// Publisher identifier.
    pub publisher_id: String,
    /// Data preparer identifier.
    pub preparer_id: String,
    /// Application identifier.
    pub application_id: String,
    /// Volume space size in sectors.
    pub block_count: u32,
    /// Volume creation timestamp.
    pub created: Option<DateTime<Utc>>,
    /// Volume modification timestamp.
    pub modified: Option<DateTime<Utc>>,
    /// Absolute LBA of the root directory extent.
    pub root_location: u32,
    /// Size of the root directory extent in bytes.
    pub root_size: u64,
    /// Absolute LBA of the type L path table.
    pub path_table_location: u32,
    /// Path table size in bytes.
    pub path_table_size: u32,
}

/// A mounted ISO9660 volume.
///
/// This is the primary entry point for reading files from disc images.
pub struct VolumeReader {
    source: Box<dyn SectorSource>,
    partition: Partition,
    volume: Option<MountedVolume>,
}

impl VolumeReader {
    /// Locates the volume descriptors inside `partition` and resolves the root directory.
    pub fn mount(
        mut source: Box<dyn SectorSource>,
        partition: Partition,
        options: &ReaderOptions,
    ) -> Result<Self> {
        let volume = MountedVolume::mount(source.as_mut(), partition, options.encoding)?;
        Ok(Self { source, partition, volume: Some(volume) })
    }

    #[inline]
    fn volume(&self) -> Result<&MountedVolume> { self.volume.as_ref().ok_or(Error::NotMounted) }

    /// The partition this volume was mounted from.
    #[inline]
    pub fn partition(&self) -> Partition { self.partition }

    /// Whether the volume is still mounted.
    #[inline]
    pub fn is_mounted(&self) -> bool { self.volume.is_some() }

    /// The descriptor of the directory tree in use.
    #[inline]
    pub fn descriptor(&self) -> Result<&DecodedVolumeDescriptor> {
        self.volume().map(|v| v.descriptor())
    }

    /// Every primary and supplementary descriptor found, in disc order.
    #[inline]
    pub fn descriptors(&self) -> Result<&[DecodedVolumeDescriptor]> {
        self.volume().map(|v| v.descriptors())
    }

    /// How the root directory was resolved.
    #[inline]
    pub fn root_source(&self) -> Result<RootSource> { self.volume().map(|v| v.root_source()) }

    /// Resolves an absolute path. Lookups are case-insensitive. Returns `None` if the path
    /// does not exist.
    pub fn stat_path(&mut self, path: &str) -> Result<Option<DirEntry>> {
        let volume = self.volume.as_mut().ok_or(Error::NotMounted)?;
        volume.lookup(self.source.as_mut(), path)
    }

    /// Reads `len` bytes at `offset` of the file at `path`. Returns `None` if the path does
    /// not exist; reading past the end of the file is an error.
    pub fn read_path(&mut self, path: &str, offset: u64, len: u64) -> Result<Option<Vec<u8>>> {
        let volume = self.volume.as_mut().ok_or(Error::NotMounted)?;
        let Some(entry) = volume.lookup(self.source.as_mut(), path)? else {
            return Ok(None);
        };
        if offset.checked_add(len).is_none_or(|end| end > entry.size) {
            return Err(Error::OutOfBounds { offset, len, size: entry.size });
        }
        volume.read_extent(self.source.as_mut(), entry.location, offset, len).map(Some)
    }

    /// Lists a directory. Returns `None` if the path does not exist or is not a directory.
    pub fn read_dir(&mut self, path: &str) -> Result<Option<Vec<DirEntry>>> {
        let volume = self.volume.as_mut().ok_or(Error::NotMounted)?;
        volume.list(self.source.as_mut(), path)
    }

    /// Reads the system area (the first 16 sectors of the partition), which holds the boot
    /// header on GD-ROM volumes.
    pub fn read_boot_header(&mut self) -> Result<Vec<u8>> {
        let volume = self.volume.as_mut().ok_or(Error::NotMounted)?;
        volume.read_extent(self.source.as_mut(), self.partition.start, 0, BOOT_HEADER_SIZE as u64)
    }

    /// Discards the descriptor and directory cache. Later queries fail with
    /// [`Error::NotMounted`].
    pub fn unmount(&mut self) { self.volume = None; }
}

/// Opens a disc image from a file path, returning a sector source and the partition holding
/// the high-density volume.
///
/// `.gdi` manifests are opened as track sets; any other file is treated as a flat image of
/// logical or raw sectors.
#[inline]
pub fn open(path: &Path) -> Result<(Box<dyn SectorSource>, Partition)> { crate::io::open(path) }
