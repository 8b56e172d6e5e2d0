//! GD-ROM high-density area assembly: volume layout around the boot file, track
//! placement, TOC patching and GDI output.
use std::{
    fs,
    fs::File,
    io::{BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};
use zerocopy::IntoBytes;

use crate::{
    build::iso::{IsoBuilder, IsoOptions, VolumeIdentifiers},
    common::{sectors_for, DiscTrack, TrackKind},
    disc::{
        gdi::{GdiManifest, MANIFEST_NAME},
        BootHeader, FIRST_HD_TRACK, GD_END_LBA, GD_START_LBA, RAW_SECTOR_SIZE, SECTOR_SIZE,
        TRACK_GAP,
    },
    iso::tree::VolumeTree,
    read::DiscStream,
    util::WindowedReader,
    write::{ProgressReporter, TrackWriter},
    Error, Result, ResultContext,
};

const SECTOR: u64 = SECTOR_SIZE as u64;

/// Size of each read from the volume stream while writing data tracks.
const CHUNK_SIZE: usize = 0x20000;

/// Options for [`GdromBuilder`].
#[derive(Debug, Clone)]
pub struct GdromOptions {
    /// Write data tracks as raw 2352-byte mode 1 sectors (`.bin`) instead of 2048-byte
    /// sectors (`.iso`).
    pub raw: bool,
    /// Always split the volume into a descriptor track and a content track, truncating the
    /// first track after the descriptors.
    pub truncate_data: bool,
    /// Write a Joliet tree.
    pub joliet: bool,
    /// Volume descriptor identifiers.
    pub identifiers: VolumeIdentifiers,
    /// Absolute LBA the high-density area ends at.
    pub end_sector: u32,
    /// Number of streamed chunks between progress reports.
    pub report_interval: u32,
    /// Volume creation time. Defaults to the time of the build.
    pub creation_time: Option<DateTime<Utc>>,
}

impl Default for GdromOptions {
    fn default() -> Self {
        Self {
            raw: false,
            truncate_data: false,
            joliet: false,
            identifiers: VolumeIdentifiers::default(),
            end_sector: GD_END_LBA,
            report_interval: 8,
            creation_time: None,
        }
    }
}

/// Progress of a [`GdromBuilder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblyState {
    /// Nothing has been built.
    Idle,
    /// Computing the ISO9660 layout.
    LayingOutVolume,
    /// Assigning tracks and patching the TOC.
    PlacingTracks,
    /// Writing track files.
    Streaming,
    /// The manifest has been regenerated against the written tracks.
    Patched,
    /// The build completed.
    Done,
    /// The build failed. Output files are unreliable.
    Failed,
}

/// The contents of a placed track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackContent {
    /// A byte range of the volume.
    Data {
        /// Offset into the volume.
        offset: u64,
        /// Length in bytes.
        length: u64,
    },
    /// A CDDA companion file.
    Audio {
        /// Index into the CDDA list.
        index: usize,
        /// Length in bytes.
        length: u64,
    },
}

/// A track with its start LBA assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlacedTrack {
    /// Track number.
    pub number: u8,
    /// Absolute start LBA.
    pub lba: u32,
    /// Track contents.
    pub content: TrackContent,
}

impl PlacedTrack {
    /// Bytes of input the track consumes.
    pub fn input_length(&self) -> u64 {
        match self.content {
            TrackContent::Data { length, .. } | TrackContent::Audio { length, .. } => length,
        }
    }
}

/// Assigns LBAs to the high-density tracks.
///
/// With no audio and no truncation, the whole volume is a single track at 45000. Otherwise
/// the volume is split at `content_start`: the last track holds the content from there to
/// the end, and the audio tracks are placed directly before it (working backwards, each
/// group separated by a 150-sector gap). Track 3 holds the system area and descriptors.
pub fn place_tracks(
    boundary: u64,
    content_start: u64,
    volume_size: u64,
    audio: &[u64],
    truncate_data: bool,
) -> Result<Vec<PlacedTrack>> {
    if audio.is_empty() && !truncate_data {
        return Ok(vec![PlacedTrack {
            number: FIRST_HD_TRACK,
            lba: GD_START_LBA,
            content: TrackContent::Data { offset: 0, length: volume_size },
        }]);
    }

    let audio_sectors =
        audio.iter().map(|len| len.div_ceil(RAW_SECTOR_SIZE as u64)).sum::<u64>();
    let available = content_start / SECTOR;
    let required = boundary / SECTOR + 2 * TRACK_GAP as u64 + audio_sectors;
    if required > available {
        return Err(Error::Capacity {
            message: "not enough room to fit all of the audio after adding the data",
            required: required as i64,
            available: available as i64,
        });
    }

    let last_lba = GD_START_LBA + available as u32;
    let mut lba = last_lba - TRACK_GAP;
    let mut audio_tracks = Vec::with_capacity(audio.len());
    for (index, &length) in audio.iter().enumerate().rev() {
        lba -= length.div_ceil(RAW_SECTOR_SIZE as u64) as u32;
        audio_tracks.push((lba, TrackContent::Audio { index, length }));
    }
    audio_tracks.reverse();
    let track3_end = lba - TRACK_GAP;
    let track3_length =
        if truncate_data { boundary } else { (track3_end - GD_START_LBA) as u64 * SECTOR };

    let mut tracks = Vec::with_capacity(audio.len() + 2);
    tracks.push(PlacedTrack {
        number: FIRST_HD_TRACK,
        lba: GD_START_LBA,
        content: TrackContent::Data { offset: 0, length: track3_length },
    });
    for (lba, content) in audio_tracks {
        let number = FIRST_HD_TRACK + tracks.len() as u8;
        tracks.push(PlacedTrack { number, lba, content });
    }
    tracks.push(PlacedTrack {
        number: FIRST_HD_TRACK + tracks.len() as u8,
        lba: last_lba,
        content: TrackContent::Data {
            offset: content_start,
            length: volume_size - content_start,
        },
    });
    Ok(tracks)
}

/// Result of a successful build.
#[derive(Debug, Clone)]
pub struct GdromOutput {
    /// The high-density tracks, as written.
    pub tracks: Vec<DiscTrack>,
    /// Path of the regenerated GDI manifest.
    pub manifest_path: PathBuf,
    /// Size of the ISO9660 volume in bytes.
    pub volume_size: u64,
}

/// Builds the high-density area of a GD-ROM as a GDI track set.
#[derive(Debug, Clone)]
pub struct GdromBuilder {
    options: GdromOptions,
    cdda: Vec<PathBuf>,
    state: AssemblyState,
}

impl GdromBuilder {
    /// Creates a builder.
    pub fn new(options: GdromOptions) -> Self {
        Self { options, cdda: Vec::new(), state: AssemblyState::Idle }
    }

    /// Adds a CDDA companion track (raw 2352-byte audio sectors). Tracks are placed in the
    /// order they are added.
    pub fn add_cdda(&mut self, path: impl Into<PathBuf>) { self.cdda.push(path.into()); }

    /// The current state.
    #[inline]
    pub fn state(&self) -> AssemblyState { self.state }

    /// Builds from a data directory and a boot header file, writing tracks and `disc.gdi`
    /// into `out_dir`.
    pub fn build(
        &mut self,
        data_dir: &Path,
        boot_header_path: &Path,
        out_dir: &Path,
        progress: impl FnMut(u8),
    ) -> Result<GdromOutput> {
        let inputs = load_inputs(data_dir, boot_header_path, out_dir);
        let (tree, header) = match inputs {
            Ok(inputs) => inputs,
            Err(e) => {
                self.state = AssemblyState::Failed;
                return Err(e);
            }
        };
        self.build_tree(tree, &header, out_dir, progress)
    }

    /// Builds from an already populated tree and boot header bytes. `out_dir` must exist.
    #[instrument(name = "GdromBuilder::build_tree", skip_all)]
    pub fn build_tree(
        &mut self,
        tree: VolumeTree,
        boot_header: &[u8],
        out_dir: &Path,
        progress: impl FnMut(u8),
    ) -> Result<GdromOutput> {
        let result = self.assemble(tree, boot_header, out_dir, progress);
        match &result {
            Ok(_) => self.state = AssemblyState::Done,
            Err(e) => {
                warn!("Build failed in state {:?}: {}", self.state, e);
                self.state = AssemblyState::Failed;
            }
        }
        result
    }

    fn assemble(
        &mut self,
        mut tree: VolumeTree,
        boot_header: &[u8],
        out_dir: &Path,
        progress: impl FnMut(u8),
    ) -> Result<GdromOutput> {
        self.state = AssemblyState::LayingOutVolume;
        let mut header = BootHeader::from_slice(boot_header)?;
        if !header.is_dreamcast() {
            warn!("Boot header hardware ID is {:?}", header.hardware_id_str());
        }
        let boot_name = header.boot_file_name().into_owned();
        if boot_name.is_empty() {
            return Err(Error::BootHeader("boot file name is empty".to_string()));
        }
        let boot_id = tree
            .find_file_ignore_case(VolumeTree::ROOT, &boot_name)
            .ok_or_else(|| Error::BootFileMissing(boot_name.clone()))?;
        tree.set_last_file(boot_id);
        let boot_sectors = sectors_for(tree.file(boot_id).size);

        let mut iso_options = IsoOptions {
            lba_offset: GD_START_LBA,
            end_sector: None,
            last_file_start: None,
            joliet: self.options.joliet,
            identifiers: self.options.identifiers.clone(),
            creation_time: self.options.creation_time.unwrap_or_else(Utc::now),
        };
        let builder = IsoBuilder::new(tree);
        let natural = builder.layout(&iso_options)?;
        let trailing = natural.trailing_after_last_file() / SECTOR;
        let end_sector = self.options.end_sector;
        let last_file_start = (end_sector as u64)
            .checked_sub(boot_sectors + trailing)
            .filter(|&lba| lba >= GD_START_LBA as u64)
            .ok_or(Error::Capacity {
                message: "boot file does not fit before the end sector",
                required: (boot_sectors + trailing) as i64,
                available: end_sector as i64 - GD_START_LBA as i64,
            })?;
        iso_options.end_sector = Some(end_sector);
        iso_options.last_file_start = Some(last_file_start as u32);
        let mut image = builder.build(&iso_options)?;
        info!(
            "Laid out volume: {} at LBA {}, {} sectors",
            boot_name,
            last_file_start,
            image.size() / SECTOR
        );

        self.state = AssemblyState::PlacingTracks;
        let audio = self
            .cdda
            .iter()
            .map(|path| {
                fs::metadata(path)
                    .map(|m| m.len())
                    .with_context(|| format!("Reading metadata of {}", path.display()))
            })
            .collect::<Result<Vec<_>>>()?;
        let layout = image.layout();
        let placed = place_tracks(
            layout.first_data_offset(),
            layout.content_start(),
            image.size(),
            &audio,
            self.options.truncate_data,
        )?;
        let tracks = placed.iter().map(|p| self.describe_track(p)).collect::<Vec<_>>();
        header.patch_toc(&tracks)?;
        image.set_system_area(header.as_bytes())?;
        for track in &tracks {
            info!("Track {}: {} {} at LBA {}", track.number, track.kind, track.file_name, track.lba);
        }

        self.state = AssemblyState::Streaming;
        let total = placed.iter().map(PlacedTrack::input_length).sum();
        let mut reporter = ProgressReporter::new(total, self.options.report_interval, progress);
        let stream = image.stream();
        for (placed, track) in placed.iter().zip(&tracks) {
            let path = out_dir.join(&track.file_name);
            match placed.content {
                TrackContent::Data { offset, length } => write_data_track(
                    stream.clone(),
                    offset,
                    length,
                    track,
                    &path,
                    &mut reporter,
                )?,
                TrackContent::Audio { index, .. } => {
                    copy_audio_track(&self.cdda[index], &path, &mut reporter)?
                }
            }
            debug!("Wrote {}", path.display());
        }

        let manifest_path = out_dir.join(MANIFEST_NAME);
        let existing = GdiManifest::load_existing(&manifest_path)?;
        GdiManifest::merge(existing.as_ref(), &tracks).save(&manifest_path)?;
        self.state = AssemblyState::Patched;
        reporter.finish();
        info!("Wrote {}", manifest_path.display());
        Ok(GdromOutput { tracks, manifest_path, volume_size: image.size() })
    }

    fn describe_track(&self, placed: &PlacedTrack) -> DiscTrack {
        match placed.content {
            TrackContent::Data { length, .. } => {
                let (extension, sector_size) = if self.options.raw {
                    ("bin", RAW_SECTOR_SIZE)
                } else {
                    ("iso", SECTOR_SIZE)
                };
                DiscTrack {
                    number: placed.number,
                    file_name: format!("track{:02}.{}", placed.number, extension),
                    lba: placed.lba,
                    kind: TrackKind::Data,
                    size: sectors_for(length) * sector_size as u64,
                    sector_size: sector_size as u32,
                }
            }
            TrackContent::Audio { length, .. } => DiscTrack {
                number: placed.number,
                file_name: format!("track{:02}.raw", placed.number),
                lba: placed.lba,
                kind: TrackKind::Audio,
                size: length,
                sector_size: RAW_SECTOR_SIZE as u32,
            },
        }
    }
}

fn load_inputs(
    data_dir: &Path,
    boot_header_path: &Path,
    out_dir: &Path,
) -> Result<(VolumeTree, Vec<u8>)> {
    let tree = VolumeTree::from_host_dir(data_dir)?;
    let header = fs::read(boot_header_path)
        .with_context(|| format!("Reading boot header {}", boot_header_path.display()))?;
    fs::create_dir_all(out_dir)
        .with_context(|| format!("Creating directory {}", out_dir.display()))?;
    Ok((tree, header))
}

fn write_data_track<F>(
    stream: Box<dyn DiscStream>,
    offset: u64,
    length: u64,
    track: &DiscTrack,
    path: &Path,
    reporter: &mut ProgressReporter<F>,
) -> Result<()>
where
    F: FnMut(u8),
{
    let mut reader = WindowedReader::new(BufReader::with_capacity(CHUNK_SIZE, stream), offset, length)
        .context("Seeking volume")?;
    let file =
        File::create(path).with_context(|| format!("Creating file {}", path.display()))?;
    let mut writer = TrackWriter::new(BufWriter::new(file), track.lba, track.is_raw());
    loop {
        let buf = reader
            .fill_buf()
            .with_context(|| format!("Reading volume for {}", track.file_name))?;
        if buf.is_empty() {
            break;
        }
        let len = buf.len();
        writer.write_logical(buf)?;
        reader.consume(len);
        reporter.advance(len as u64);
    }
    writer.finish()?;
    Ok(())
}

fn copy_audio_track<F>(
    source: &Path,
    dest: &Path,
    reporter: &mut ProgressReporter<F>,
) -> Result<()>
where
    F: FnMut(u8),
{
    if let (Ok(a), Ok(b)) = (source.canonicalize(), dest.canonicalize()) {
        if a == b {
            let len = fs::metadata(source)
                .with_context(|| format!("Reading metadata of {}", source.display()))?
                .len();
            reporter.advance(len);
            return Ok(());
        }
    }
    let file =
        File::open(source).with_context(|| format!("Opening file {}", source.display()))?;
    let mut reader = BufReader::with_capacity(CHUNK_SIZE, file);
    let file = File::create(dest).with_context(|| format!("Creating file {}", dest.display()))?;
    let mut writer = BufWriter::new(file);
    loop {
        let buf = reader.fill_buf().with_context(|| format!("Reading {}", source.display()))?;
        if buf.is_empty() {
            break;
        }
        let len = buf.len();
        writer.write_all(buf).with_context(|| format!("Writing {}", dest.display()))?;
        reader.consume(len);
        reporter.advance(len as u64);
    }
    writer.flush().with_context(|| format!("Flushing {}", dest.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use chrono::TimeZone;

    use super::*;
    use crate::{disc::BOOT_FILE_OFFSET, iso::tree::FileSource};

    const AUDIO_2S: u64 = 150 * RAW_SECTOR_SIZE as u64;

    fn boot_header(name: &str) -> Vec<u8> {
        let mut data = vec![0u8; crate::disc::BOOT_HEADER_SIZE];
        data[..16].copy_from_slice(b"SEGA SEGAKATANA ");
        let field = &mut data[BOOT_FILE_OFFSET..BOOT_FILE_OFFSET + 16];
        field.fill(b' ');
        field[..name.len()].copy_from_slice(name.as_bytes());
        data
    }

    fn tree() -> VolumeTree {
        let mut tree = VolumeTree::new();
        let boot = Bytes::from(vec![0xB0u8; 5000]);
        tree.add_file("/1st_read.bin", 5000, FileSource::Buffer(boot), None).unwrap();
        let data = Bytes::from(vec![0xDAu8; 3000]);
        tree.add_file("/DATA/LEVEL.DAT", 3000, FileSource::Buffer(data), None).unwrap();
        tree
    }

    fn options() -> GdromOptions {
        GdromOptions {
            end_sector: GD_START_LBA + 1000,
            creation_time: Some(Utc.with_ymd_and_hms(1999, 9, 9, 0, 0, 0).unwrap()),
            ..Default::default()
        }
    }

    #[test]
    fn test_single_track() {
        let tracks = place_tracks(18 * SECTOR, 18 * SECTOR, 1000 * SECTOR, &[], false).unwrap();
        assert_eq!(tracks, vec![PlacedTrack {
            number: 3,
            lba: 45000,
            content: TrackContent::Data { offset: 0, length: 1000 * SECTOR },
        }]);
    }

    #[test]
    fn test_two_audio_tracks() {
        let tracks = place_tracks(
            18 * SECTOR,
            10000 * SECTOR,
            20000 * SECTOR,
            &[AUDIO_2S, AUDIO_2S + 1],
            false,
        )
        .unwrap();
        let lbas = tracks.iter().map(|t| (t.number, t.lba)).collect::<Vec<_>>();
        assert_eq!(lbas, vec![(3, 45000), (4, 54549), (5, 54699), (6, 55000)]);
        assert_eq!(tracks[0].content, TrackContent::Data { offset: 0, length: 9399 * SECTOR });
        assert_eq!(tracks[1].content, TrackContent::Audio { index: 0, length: AUDIO_2S });
        assert_eq!(tracks[3].content, TrackContent::Data {
            offset: 10000 * SECTOR,
            length: 10000 * SECTOR
        });
    }

    #[test]
    fn test_truncated_without_audio() {
        let tracks = place_tracks(18 * SECTOR, 900 * SECTOR, 1000 * SECTOR, &[], true).unwrap();
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].content, TrackContent::Data { offset: 0, length: 18 * SECTOR });
        assert_eq!(tracks[1].lba, 45900);
    }

    #[test]
    fn test_audio_capacity() {
        let err = place_tracks(18 * SECTOR, 300 * SECTOR, 1000 * SECTOR, &[AUDIO_2S], false);
        assert!(matches!(err, Err(Error::Capacity { required: 468, available: 300, .. })));
    }

    #[test]
    fn test_build_single_track() {
        let dir = tempfile::tempdir().unwrap();
        let mut builder = GdromBuilder::new(options());
        let mut reported = Vec::new();
        let output = builder
            .build_tree(tree(), &boot_header("1ST_READ.BIN"), dir.path(), |p| reported.push(p))
            .unwrap();
        assert_eq!(builder.state(), AssemblyState::Done);
        assert_eq!(reported.last(), Some(&100));
        assert!(reported.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(output.tracks.len(), 1);
        assert_eq!(output.tracks[0].file_name, "track03.iso");
        let track = fs::read(dir.path().join("track03.iso")).unwrap();
        assert_eq!(track.len(), 1000 * SECTOR_SIZE);
        // Patched TOC in the system area
        let header = BootHeader::from_slice(&track[..crate::disc::BOOT_HEADER_SIZE]).unwrap();
        let toc = header.tracks().map(|(n, e)| (n, e.lba(), e.kind())).collect::<Vec<_>>();
        assert_eq!(toc, vec![(3, 45000, Some(TrackKind::Data))]);
        // The boot file is followed by the two directories and ends at the end sector
        let boot_start = 995 * SECTOR_SIZE;
        assert!(track[boot_start..boot_start + 5000].iter().all(|&b| b == 0xB0));
        let manifest = fs::read_to_string(&output.manifest_path).unwrap();
        assert_eq!(
            manifest,
            "3\n1 0 4 2352 track01.bin 0\n2 756 0 2352 track02.raw 0\n3 45000 4 2048 track03.iso 0\n"
        );
    }

    #[test]
    fn test_build_with_audio() {
        let dir = tempfile::tempdir().unwrap();
        let audio = dir.path().join("audio.raw");
        fs::write(&audio, vec![0x11u8; AUDIO_2S as usize]).unwrap();
        let out = dir.path().join("out");
        fs::create_dir(&out).unwrap();
        fs::write(out.join(MANIFEST_NAME), "2\n1 0 4 2352 low.bin 0\n2 600 0 2352 low.raw 0\n")
            .unwrap();
        let mut builder = GdromBuilder::new(GdromOptions { raw: true, ..options() });
        builder.add_cdda(&audio);
        let output = builder.build_tree(tree(), &boot_header("1ST_READ.BIN"), &out, |_| {}).unwrap();
        let kinds = output.tracks.iter().map(|t| (t.number, t.kind)).collect::<Vec<_>>();
        assert_eq!(kinds, vec![(3, TrackKind::Data), (4, TrackKind::Audio), (5, TrackKind::Data)]);
        assert_eq!(fs::read(out.join("track04.raw")).unwrap().len(), AUDIO_2S as usize);
        let last = &output.tracks[2];
        assert_eq!(last.file_name, "track05.bin");
        assert_eq!(output.tracks[1].lba, last.lba - 150 - 150);
        let manifest = GdiManifest::load(&output.manifest_path).unwrap();
        assert_eq!(manifest.track(1).unwrap().file_name, "low.bin");
        assert_eq!(manifest.track(2).unwrap().lba, 600);
        assert_eq!(manifest.track(5).unwrap().lba, last.lba);
    }

    #[test]
    fn test_missing_boot_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut builder = GdromBuilder::new(options());
        let err = builder.build_tree(tree(), &boot_header("MISSING.BIN"), dir.path(), |_| {});
        assert!(matches!(err, Err(Error::BootFileMissing(name)) if name == "MISSING.BIN"));
        assert_eq!(builder.state(), AssemblyState::Failed);
        let err = builder.build_tree(tree(), &[0u8; 100], dir.path(), |_| {});
        assert!(matches!(err, Err(Error::BootHeader(_))));
    }

    #[test]
    fn test_end_sector_too_small() {
        let dir = tempfile::tempdir().unwrap();
        let mut builder =
            GdromBuilder::new(GdromOptions { end_sector: GD_START_LBA + 20, ..options() });
        let err = builder.build_tree(tree(), &boot_header("1ST_READ.BIN"), dir.path(), |_| {});
        assert!(matches!(err, Err(Error::Capacity { .. })));
        assert_eq!(builder.state(), AssemblyState::Failed);
    }
}
