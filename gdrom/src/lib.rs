#![warn(missing_docs)]
//! Library for building and reading GD-ROM (Dreamcast) disc images.
//!
//! A GD-ROM exposes a low-density area (tracks 1 and 2, a regular CD session) and a
//! high-density area starting at LBA 45000. This crate authors the high-density area:
//! it lays out an ISO9660 volume (with an optional Joliet tree) at absolute sector
//! addresses, embeds and patches the boot header (IP.BIN), places optional CDDA tracks,
//! and writes the result as a GDI track set. It can also mount any sector-addressable
//! image and resolve single paths to byte ranges.
//!
//! # Examples
//!
//! Building a GDI from an extracted data folder:
//!
//! ```no_run
//! use gdrom::build::gdrom::{GdromBuilder, GdromOptions};
//!
//! let options = GdromOptions { raw: true, ..Default::default() };
//! let mut builder = GdromBuilder::new(options);
//! let output = builder
//!     .build("path/to/data".as_ref(), "path/to/IP.BIN".as_ref(), "path/to/out".as_ref(), |pct| {
//!         println!("{pct}%");
//!     })
//!     .expect("Failed to build disc image");
//! for track in &output.tracks {
//!     println!("{} @ {}", track.file_name, track.lba);
//! }
//! ```
//!
//! Reading a file from a built image:
//!
//! ```no_run
//! use gdrom::read::{ReaderOptions, VolumeReader};
//!
//! let (source, partition) = gdrom::read::open("path/to/disc.gdi".as_ref())
//!     .expect("Failed to open disc");
//! let mut reader = VolumeReader::mount(source, partition, &ReaderOptions::default())
//!     .expect("Failed to mount volume");
//! if let Some(entry) = reader.stat_path("/0GDTEX.PVR").expect("Failed to stat") {
//!     let data = reader.read_path("/0GDTEX.PVR", 0, entry.size).expect("Failed to read");
//!     println!("Texture is {} bytes", data.map_or(0, |d| d.len()));
//! }
//! ```

pub mod build;
pub mod common;
pub mod disc;
pub(crate) mod io;
pub mod iso;
pub mod read;
pub mod util;
pub mod write;

/// Error types for gdrom.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// An error for disc format related issues.
    #[error("disc format error: {0}")]
    DiscFormat(String),
    /// The boot header is malformed.
    #[error("boot header error: {0}")]
    BootHeader(String),
    /// The boot file named in the boot header is not present in the source tree.
    #[error("boot file {0:?} not found in the root of the data directory")]
    BootFileMissing(String),
    /// An entry with the same name already exists in the directory.
    #[error("name collision: {0}")]
    NameCollision(String),
    /// A volume identifier exceeds the length of its field.
    #[error("identifier {field} is too long ({len} > {max})")]
    InvalidIdentifier {
        /// The descriptor field name.
        field: &'static str,
        /// The identifier length in characters.
        len: usize,
        /// The maximum length allowed by the field.
        max: usize,
    },
    /// The content does not fit in the requested sector window.
    #[error("{message} (required: {required} sectors, available: {available} sectors)")]
    Capacity {
        /// A description of the failed constraint.
        message: &'static str,
        /// The number of sectors the layout requires.
        required: i64,
        /// The number of sectors available.
        available: i64,
    },
    /// The volume reader has been unmounted.
    #[error("volume is not mounted")]
    NotMounted,
    /// A read extends past the end of a file.
    #[error("read of {len} bytes at offset {offset} exceeds file size {size}")]
    OutOfBounds {
        /// The requested offset.
        offset: u64,
        /// The requested length.
        len: u64,
        /// The recorded file size.
        size: u64,
    },
    /// A general I/O error.
    #[error("{0}")]
    Io(String, #[source] std::io::Error),
    /// An unknown error.
    #[error("error: {0}")]
    Other(String),
}

impl From<&str> for Error {
    #[inline]
    fn from(s: &str) -> Error { Error::Other(s.to_string()) }
}

impl From<String> for Error {
    #[inline]
    fn from(s: String) -> Error { Error::Other(s) }
}

impl From<zerocopy::AllocError> for Error {
    #[inline]
    fn from(_: zerocopy::AllocError) -> Error {
        Error::Io(
            "allocation failed".to_string(),
            std::io::Error::from(std::io::ErrorKind::OutOfMemory),
        )
    }
}

/// Helper result type for [`Error`].
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Helper trait for adding context to errors.
pub trait ErrorContext {
    /// Adds context to an error.
    fn context(self, context: impl Into<String>) -> Error;
}

impl ErrorContext for std::io::Error {
    #[inline]
    fn context(self, context: impl Into<String>) -> Error { Error::Io(context.into(), self) }
}

/// Helper trait for adding context to result errors.
pub trait ResultContext<T> {
    /// Adds context to a result error.
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Adds context to a result error using a closure.
    fn with_context<F>(self, f: F) -> Result<T>
    where F: FnOnce() -> String;
}

impl<T, E> ResultContext<T> for Result<T, E>
where E: ErrorContext
{
    #[inline]
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(context))
    }

    #[inline]
    fn with_context<F>(self, f: F) -> Result<T>
    where F: FnOnce() -> String {
        self.map_err(|e| e.context(f()))
    }
}

pub(crate) trait IoErrorContext {
    fn io_context(self, context: impl Into<String>) -> std::io::Error;
}

impl IoErrorContext for std::io::Error {
    #[inline]
    fn io_context(self, context: impl Into<String>) -> std::io::Error {
        std::io::Error::new(self.kind(), self.context(context))
    }
}

pub(crate) trait IoResultContext<T> {
    fn io_context(self, context: impl Into<String>) -> std::io::Result<T>;

    fn io_with_context<F>(self, f: F) -> std::io::Result<T>
    where F: FnOnce() -> String;
}

impl<T> IoResultContext<T> for std::io::Result<T> {
    #[inline]
    fn io_context(self, context: impl Into<String>) -> std::io::Result<T> {
        self.map_err(|e| e.io_context(context))
    }

    #[inline]
    fn io_with_context<F>(self, f: F) -> std::io::Result<T>
    where F: FnOnce() -> String {
        self.map_err(|e| e.io_context(f()))
    }
}
