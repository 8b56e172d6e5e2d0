//! GDI track manifest (`disc.gdi`).
//!
//! The first line holds the track count; every following line describes one track:
//! `number lba type sector_size file_name offset`. File names containing spaces are quoted.

use std::{fmt, fs, path::Path, str::FromStr};

use tracing::debug;

use crate::{
    common::{DiscTrack, TrackKind},
    disc::{FIRST_HD_TRACK, RAW_SECTOR_SIZE},
    Error, ErrorContext, Result, ResultContext,
};

/// Default manifest file name.
pub const MANIFEST_NAME: &str = "disc.gdi";

/// One line of a GDI manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GdiEntry {
    /// Track number (1-based).
    pub number: u8,
    /// Absolute start LBA.
    pub lba: u32,
    /// Track kind.
    pub kind: TrackKind,
    /// Sector size of the track file.
    pub sector_size: u32,
    /// Track file name, relative to the manifest.
    pub file_name: String,
    /// Byte offset field (always 0).
    pub offset: u64,
}

impl From<&DiscTrack> for GdiEntry {
    fn from(track: &DiscTrack) -> Self {
        Self {
            number: track.number,
            lba: track.lba,
            kind: track.kind,
            sector_size: track.sector_size,
            file_name: track.file_name.clone(),
            offset: 0,
        }
    }
}

/// A parsed GDI manifest.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GdiManifest {
    /// Track lines in file order.
    pub entries: Vec<GdiEntry>,
}

fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut chars = line.trim().chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '"' {
            chars.next();
            tokens.push(chars.by_ref().take_while(|&c| c != '"').collect());
        } else {
            let mut token = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                token.push(c);
                chars.next();
            }
            tokens.push(token);
        }
    }
    tokens
}

fn parse_field<T: FromStr>(token: &str, line: usize, field: &str) -> Result<T> {
    token.parse::<T>().map_err(|_| {
        Error::DiscFormat(format!("GDI line {line}: invalid {field} {token:?}"))
    })
}

impl GdiManifest {
    /// The low-density track lines used when no manifest exists yet.
    pub fn default_low_density() -> Vec<GdiEntry> {
        vec![
            GdiEntry {
                number: 1,
                lba: 0,
                kind: TrackKind::Data,
                sector_size: RAW_SECTOR_SIZE as u32,
                file_name: "track01.bin".to_string(),
                offset: 0,
            },
            GdiEntry {
                number: 2,
                lba: 756,
                kind: TrackKind::Audio,
                sector_size: RAW_SECTOR_SIZE as u32,
                file_name: "track02.raw".to_string(),
                offset: 0,
            },
        ]
    }

    /// Reads a manifest from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Reading GDI manifest {}", path.display()))?;
        text.parse()
    }

    /// Reads a manifest from disk if it exists.
    pub fn load_existing(path: &Path) -> Result<Option<Self>> {
        match fs::read_to_string(path) {
            Ok(text) => text.parse().map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.context(format!("Reading GDI manifest {}", path.display()))),
        }
    }

    /// Builds a manifest from the leading low-density lines of an existing manifest (or the
    /// defaults) followed by freshly placed high-density tracks.
    pub fn merge(existing: Option<&GdiManifest>, tracks: &[DiscTrack]) -> Self {
        let mut entries = match existing {
            Some(manifest) => manifest
                .entries
                .iter()
                .filter(|e| e.number < FIRST_HD_TRACK)
                .cloned()
                .collect::<Vec<_>>(),
            None => Self::default_low_density(),
        };
        if entries.is_empty() {
            entries = Self::default_low_density();
        }
        debug!("Keeping {} low-density track lines", entries.len());
        entries.extend(tracks.iter().map(GdiEntry::from));
        Self { entries }
    }

    /// Writes the manifest to disk.
    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_string())
            .with_context(|| format!("Writing GDI manifest {}", path.display()))
    }

    /// Returns the entry for a track number.
    #[inline]
    pub fn track(&self, number: u8) -> Option<&GdiEntry> {
        self.entries.iter().find(|e| e.number == number)
    }
}

impl FromStr for GdiManifest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut lines = s.lines().enumerate().filter(|(_, l)| !l.trim().is_empty());
        let Some((_, count_line)) = lines.next() else {
            return Err(Error::DiscFormat("GDI manifest is empty".to_string()));
        };
        let count = parse_field::<usize>(count_line.trim(), 1, "track count")?;
        let mut entries = Vec::with_capacity(count);
        for (idx, line) in lines {
            let line_no = idx + 1;
            let tokens = tokenize(line);
            if tokens.len() < 5 {
                return Err(Error::DiscFormat(format!(
                    "GDI line {line_no}: expected at least 5 fields, found {}",
                    tokens.len()
                )));
            }
            let kind_value = parse_field::<u8>(&tokens[2], line_no, "track type")?;
            let kind = TrackKind::from_value(kind_value).ok_or_else(|| {
                Error::DiscFormat(format!("GDI line {line_no}: unknown track type {kind_value}"))
            })?;
            entries.push(GdiEntry {
                number: parse_field(&tokens[0], line_no, "track number")?,
                lba: parse_field(&tokens[1], line_no, "LBA")?,
                kind,
                sector_size: parse_field(&tokens[3], line_no, "sector size")?,
                file_name: tokens[4].clone(),
                offset: match tokens.get(5) {
                    Some(token) => parse_field(token, line_no, "offset")?,
                    None => 0,
                },
            });
        }
        if entries.len() != count {
            return Err(Error::DiscFormat(format!(
                "GDI manifest declares {count} tracks but lists {}",
                entries.len()
            )));
        }
        Ok(Self { entries })
    }
}

impl fmt::Display for GdiManifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.entries.len())?;
        for e in &self.entries {
            let name = if e.file_name.contains(char::is_whitespace) {
                format!("\"{}\"", e.file_name)
            } else {
                e.file_name.clone()
            };
            writeln!(
                f,
                "{} {} {} {} {} {}",
                e.number,
                e.lba,
                e.kind.value(),
                e.sector_size,
                name,
                e.offset
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(number: u8, lba: u32, kind: TrackKind, name: &str) -> DiscTrack {
        DiscTrack {
            number,
            file_name: name.to_string(),
            lba,
            kind,
            size: 0,
            sector_size: RAW_SECTOR_SIZE as u32,
        }
    }

    #[test]
    fn test_parse() {
        let text = "3\n1 0 4 2352 track01.bin 0\n2 450 0 2352 \"track 02.raw\" 0\n\
                    3 45000 4 2352 track03.bin 0\n";
        let manifest = text.parse::<GdiManifest>().unwrap();
        assert_eq!(manifest.entries.len(), 3);
        assert_eq!(manifest.entries[1].file_name, "track 02.raw");
        assert_eq!(manifest.entries[1].kind, TrackKind::Audio);
        assert_eq!(manifest.track(3).map(|e| e.lba), Some(45000));
        assert!("2\n1 0 4 2352 track01.bin 0\n".parse::<GdiManifest>().is_err());
        assert!("1\n1 0 7 2352 track01.bin 0\n".parse::<GdiManifest>().is_err());
    }

    #[test]
    fn test_merge_defaults() {
        let tracks = [track(3, 45000, TrackKind::Data, "track03.bin")];
        let manifest = GdiManifest::merge(None, &tracks);
        assert_eq!(
            manifest.to_string(),
            "3\n1 0 4 2352 track01.bin 0\n2 756 0 2352 track02.raw 0\n3 45000 4 2352 track03.bin 0\n"
        );
    }

    #[test]
    fn test_merge_existing() {
        let existing = "4\n1 0 4 2352 track01.bin 0\n2 600 0 2352 track02.raw 0\n\
                        3 45000 4 2352 track03.bin 0\n4 50000 0 2352 track04.raw 0\n"
            .parse::<GdiManifest>()
            .unwrap();
        let tracks = [
            track(3, 45000, TrackKind::Data, "track03.iso"),
            track(4, 500000, TrackKind::Data, "track04.iso"),
        ];
        let manifest = GdiManifest::merge(Some(&existing), &tracks);
        assert_eq!(manifest.entries.len(), 4);
        assert_eq!(manifest.entries[1].lba, 600);
        assert_eq!(manifest.entries[3].file_name, "track04.iso");
        assert_eq!(manifest.to_string().parse::<GdiManifest>().unwrap(), manifest);
    }

    #[test]
    fn test_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(MANIFEST_NAME);
        assert_eq!(GdiManifest::load_existing(&path).unwrap(), None);
        let manifest = GdiManifest::merge(None, &[]);
        manifest.save(&path).unwrap();
        assert_eq!(GdiManifest::load(&path).unwrap(), manifest);
    }
}
