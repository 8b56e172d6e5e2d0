//! ISO9660 volume layout and image synthesis.
//!
//! A volume is laid out in fixed stages, each producing a new [`Layout`] snapshot:
//!
//! 1. Files, in placement order, from the first sector after the descriptors.
//! 2. Directories for each tree (primary, then Joliet), in path table order.
//! 3. Path tables (L then M per tree), at the first data sector.
//! 4. Push-back: files and directories move past the path tables.
//! 5. Trailing reserve: everything moves so the last file starts at a requested sector.
//! 6. End sector: the volume is padded to (or rejected for exceeding) a requested end.
//! 7. Descriptors, synthesized last so they can reference final locations.
//!
//! All recorded locations are absolute: `lba_offset` is added to every sector number.
use std::{
    collections::HashMap,
    fmt,
    fs::File,
    io,
    io::{Read, Seek, SeekFrom, Write},
    sync::Arc,
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use tracing::{debug, instrument};
use zerocopy::{big_endian, little_endian, IntoBytes};

use crate::{
    common::{Encoding, Endian},
    disc::{BOOT_HEADER_SIZE, SECTOR_SIZE},
    io::iso::read_exact_at,
    iso::{
        directory_record_size, path_table_record_size,
        tree::{DirId, FileId, FileSource, NodeId, PathTableEntry, VolumeTree},
        write_directory_record, write_field, BothU16, BothU32, DescriptorDate, DescriptorType,
        DirectoryRecordHeader, VolumeDescriptor, DESCRIPTOR_START_SECTOR, JOLIET_ESCAPES,
    },
    read::DiscStream,
    util::Align,
    Error, IoResultContext, Result, ResultContext,
};

const SECTOR: u64 = SECTOR_SIZE as u64;

/// Identifier strings recorded in the volume descriptors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeIdentifiers {
    /// System identifier (32 characters).
    pub system: String,
    /// Volume identifier (32 characters).
    pub volume: String,
    /// Volume set identifier (128 characters).
    pub volume_set: String,
    /// Publisher identifier (128 characters).
    pub publisher: String,
    /// Data preparer identifier (128 characters).
    pub preparer: String,
    /// Application identifier (128 characters).
    pub application: String,
}

impl Default for VolumeIdentifiers {
    fn default() -> Self {
        Self {
            system: "SEGA SEGAKATANA".to_string(),
            volume: "GDROM".to_string(),
            volume_set: String::new(),
            publisher: String::new(),
            preparer: String::new(),
            application: String::new(),
        }
    }
}

impl VolumeIdentifiers {
    /// Checks every identifier against the size of its descriptor field.
    pub fn validate(&self) -> Result<()> {
        let fields: [(&'static str, &str, usize); 6] = [
            ("system", &self.system, 32),
            ("volume", &self.volume, 32),
            ("volume_set", &self.volume_set, 128),
            ("publisher", &self.publisher, 128),
            ("preparer", &self.preparer, 128),
            ("application", &self.application, 128),
        ];
        for (field, value, max) in fields {
            let len = value.chars().count();
            if len > max {
                return Err(Error::InvalidIdentifier { field, len, max });
            }
        }
        Ok(())
    }
}

/// Options for [`IsoBuilder`].
#[derive(Debug, Clone)]
pub struct IsoOptions {
    /// Absolute LBA of the first sector of the volume.
    pub lba_offset: u32,
    /// Absolute LBA the volume must end at. The image is padded up to it; content that
    /// does not fit is an error.
    pub end_sector: Option<u32>,
    /// Absolute LBA the last placed file must start at.
    pub last_file_start: Option<u32>,
    /// Whether to write a Joliet tree alongside the primary tree.
    pub joliet: bool,
    /// Descriptor identifiers.
    pub identifiers: VolumeIdentifiers,
    /// Volume creation time, also used for entries without a timestamp.
    pub creation_time: DateTime<Utc>,
}

impl Default for IsoOptions {
    fn default() -> Self {
        Self {
            lba_offset: 0,
            end_sector: None,
            last_file_start: None,
            joliet: false,
            identifiers: VolumeIdentifiers::default(),
            creation_time: Utc::now(),
        }
    }
}

/// What an extent holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtentKind {
    /// File contents.
    File(FileId),
    /// Directory records of one tree.
    Directory(Encoding, DirId),
    /// A path table of one tree.
    PathTable(Encoding, Endian),
    /// A volume descriptor, by index (the terminator is last).
    Descriptor(u8),
}

/// Handle to an extent in a [`Layout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExtentId(usize);

/// A sector-aligned byte range of the volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    /// What the extent holds.
    pub kind: ExtentKind,
    /// Byte offset from the start of the volume. Always sector aligned.
    pub offset: u64,
    /// Length in bytes.
    pub length: u64,
}

impl Extent {
    /// Bytes reserved for the extent (length rounded up to whole sectors).
    #[inline]
    pub fn reserved(&self) -> u64 { self.length.align_up(SECTOR) }

    /// Offset of the first sector after the extent.
    #[inline]
    pub fn end(&self) -> u64 { self.offset + self.reserved() }
}

/// Sector assignments for every extent of a volume.
#[derive(Debug, Clone)]
pub struct Layout {
    lba_offset: u32,
    first_data_offset: u64,
    extents: Vec<Extent>,
    index: HashMap<ExtentKind, ExtentId>,
    last_file: Option<ExtentId>,
    size: u64,
}

impl Layout {
    fn new(lba_offset: u32, descriptor_count: u32) -> Self {
        let first_data_offset = (DESCRIPTOR_START_SECTOR + descriptor_count) as u64 * SECTOR;
        Self {
            lba_offset,
            first_data_offset,
            extents: Vec::new(),
            index: HashMap::new(),
            last_file: None,
            size: first_data_offset,
        }
    }

    fn push(&mut self, kind: ExtentKind, offset: u64, length: u64) -> ExtentId {
        let id = ExtentId(self.extents.len());
        self.extents.push(Extent { kind, offset, length });
        self.index.insert(kind, id);
        id
    }

    fn shift(&mut self, delta: u64, filter: impl Fn(&ExtentKind) -> bool) {
        for extent in self.extents.iter_mut().filter(|e| filter(&e.kind)) {
            extent.offset += delta;
        }
    }

    fn natural_end(&self) -> u64 {
        self.extents.iter().map(Extent::end).max().unwrap_or(0).max(self.first_data_offset)
    }

    /// Absolute LBA of the first sector of the volume.
    #[inline]
    pub fn lba_offset(&self) -> u32 { self.lba_offset }

    /// Offset of the first sector after the volume descriptors.
    #[inline]
    pub fn first_data_offset(&self) -> u64 { self.first_data_offset }

    /// Total volume size in bytes.
    #[inline]
    pub fn size(&self) -> u64 { self.size }

    /// Every extent in placement order.
    #[inline]
    pub fn extents(&self) -> &[Extent] { &self.extents }

    /// Returns an extent by handle.
    #[inline]
    pub fn extent(&self, id: ExtentId) -> &Extent { &self.extents[id.0] }

    /// Returns the extent holding `kind`, if it was placed. Zero-length files have no
    /// extent.
    #[inline]
    pub fn get(&self, kind: ExtentKind) -> Option<&Extent> {
        self.index.get(&kind).map(|&id| &self.extents[id.0])
    }

    /// Converts a volume byte offset to an absolute LBA.
    #[inline]
    pub fn lba_of(&self, offset: u64) -> u32 { self.lba_offset + (offset / SECTOR) as u32 }

    /// Absolute LBA of the extent holding `kind`.
    #[inline]
    pub fn location(&self, kind: ExtentKind) -> Option<u32> {
        self.get(kind).map(|e| self.lba_of(e.offset))
    }

    /// The highest placed file.
    #[inline]
    pub fn last_file(&self) -> Option<&Extent> { self.last_file.map(|id| &self.extents[id.0]) }

    /// Offset of the first sector after the descriptors that holds data.
    pub fn content_start(&self) -> u64 {
        self.extents
            .iter()
            .filter(|e| !matches!(e.kind, ExtentKind::Descriptor(_)))
            .map(|e| e.offset)
            .min()
            .unwrap_or(self.first_data_offset)
    }

    /// Bytes between the end of the last file and the end of the last extent.
    pub fn trailing_after_last_file(&self) -> u64 {
        self.last_file().map_or(0, |last| self.natural_end().saturating_sub(last.end()))
    }
}

struct Plan<'a> {
    tree: &'a VolumeTree,
    options: &'a IsoOptions,
    encodings: &'static [Encoding],
    path_tables: Vec<Vec<PathTableEntry>>,
}

impl<'a> Plan<'a> {
    fn new(tree: &'a VolumeTree, options: &'a IsoOptions) -> Result<Self> {
        let encodings: &'static [Encoding] = if options.joliet {
            &[Encoding::Primary, Encoding::Joliet]
        } else {
            &[Encoding::Primary]
        };
        for &encoding in encodings {
            tree.check_identifiers(encoding)?;
        }
        let path_tables =
            encodings.iter().map(|&enc| tree.path_table(enc)).collect::<Result<Vec<_>>>()?;
        Ok(Self { tree, options, encodings, path_tables })
    }

    fn trees(&self) -> impl Iterator<Item = (Encoding, &[PathTableEntry])> {
        self.encodings.iter().copied().zip(self.path_tables.iter().map(Vec::as_slice))
    }

    fn recorded(&self, node: NodeId) -> DateTime<Utc> {
        match node {
            NodeId::Dir(id) => self.tree.dir(id).modified,
            NodeId::File(id) => self.tree.file(id).modified,
        }
        .unwrap_or(self.options.creation_time)
    }
}

/// Packs records of the given lengths into sectors without letting any record cross a
/// sector boundary. Returns the total size in whole sectors.
fn pack_records(lengths: impl IntoIterator<Item = usize>) -> u64 {
    let mut pos = 0u64;
    for len in lengths {
        let len = len as u64;
        if pos % SECTOR + len > SECTOR {
            pos = pos.align_up(SECTOR);
        }
        pos += len;
    }
    pos.align_up(SECTOR).max(SECTOR)
}

fn directory_size(tree: &VolumeTree, dir: DirId, encoding: Encoding) -> u64 {
    let dots = [directory_record_size(1); 2];
    let children = tree
        .sorted_children(dir, encoding)
        .into_iter()
        .map(|(identifier, _)| directory_record_size(identifier.len()));
    pack_records(dots.into_iter().chain(children))
}

fn path_table_size(entries: &[PathTableEntry]) -> u64 {
    entries.iter().map(|e| path_table_record_size(e.identifier.len()) as u64).sum()
}

fn place_files(mut layout: Layout, plan: &Plan) -> Result<Layout> {
    let mut offset = layout.first_data_offset;
    for id in plan.tree.placement_order() {
        let file = plan.tree.file(id);
        if file.size == 0 {
            continue;
        }
        if file.size > u32::MAX as u64 {
            return Err(Error::DiscFormat(format!(
                "{} is too large ({} bytes)",
                file.name, file.size
            )));
        }
        let extent = layout.push(ExtentKind::File(id), offset, file.size);
        offset = layout.extent(extent).end();
        layout.last_file = Some(extent);
    }
    debug!("Placed {} files, ending at {:#X}", plan.tree.file_count(), offset);
    Ok(layout)
}

fn place_directories(mut layout: Layout, plan: &Plan) -> Result<Layout> {
    let mut offset = layout.natural_end();
    for &encoding in plan.encodings {
        for (dir, _) in plan.tree.dirs() {
            let length = directory_size(plan.tree, dir, encoding);
            layout.push(ExtentKind::Directory(encoding, dir), offset, length);
            offset += length;
        }
    }
    debug!("Placed directories, ending at {:#X}", offset);
    Ok(layout)
}

fn place_path_tables(mut layout: Layout, plan: &Plan) -> Result<Layout> {
    let mut offset = layout.first_data_offset;
    for (encoding, table) in plan.trees() {
        let length = path_table_size(table);
        if length > u32::MAX as u64 {
            return Err(Error::DiscFormat(format!("{encoding} path table is too large")));
        }
        for endian in [Endian::Little, Endian::Big] {
            let id = layout.push(ExtentKind::PathTable(encoding, endian), offset, length);
            offset = layout.extent(id).end();
        }
    }
    Ok(layout)
}

fn push_back(mut layout: Layout) -> Layout {
    let footprint = layout
        .extents
        .iter()
        .filter(|e| matches!(e.kind, ExtentKind::PathTable(..)))
        .map(Extent::reserved)
        .sum::<u64>();
    layout.shift(footprint, |kind| {
        matches!(kind, ExtentKind::File(_) | ExtentKind::Directory(..))
    });
    debug!("Path tables occupy {} sectors", footprint / SECTOR);
    layout
}

fn reserve_trailing(mut layout: Layout, options: &IsoOptions) -> Result<Layout> {
    let Some(target) = options.last_file_start else {
        return Ok(layout);
    };
    let Some(last) = layout.last_file() else {
        debug!("No files placed; ignoring last file start");
        return Ok(layout);
    };
    let current = layout.lba_of(last.offset);
    let delta = target as i64 - current as i64;
    if delta < 0 {
        return Err(Error::Capacity {
            message: "volume is too large to start the last file at the requested sector",
            required: current as i64,
            available: target as i64,
        });
    }
    debug!("Reserving {} sectors before the content", delta);
    layout.shift(delta as u64 * SECTOR, |kind| !matches!(kind, ExtentKind::Descriptor(_)));
    Ok(layout)
}

fn fit_end_sector(mut layout: Layout, options: &IsoOptions) -> Result<Layout> {
    let natural = layout.natural_end();
    layout.size = natural;
    let Some(end_sector) = options.end_sector else {
        return Ok(layout);
    };
    let required = layout.lba_of(natural) as i64;
    if required > end_sector as i64 {
        return Err(Error::Capacity {
            message: "volume does not fit before the end sector",
            required,
            available: end_sector as i64,
        });
    }
    layout.size = (end_sector - layout.lba_offset) as u64 * SECTOR;
    Ok(layout)
}

fn place_descriptors(mut layout: Layout, plan: &Plan) -> Layout {
    for index in 0..=plan.encodings.len() {
        let offset = (DESCRIPTOR_START_SECTOR as u64 + index as u64) * SECTOR;
        layout.push(ExtentKind::Descriptor(index as u8), offset, SECTOR);
    }
    layout
}

#[instrument(name = "iso::run_layout", skip_all)]
fn run_layout(plan: &Plan) -> Result<Layout> {
    plan.options.identifiers.validate()?;
    let layout = Layout::new(plan.options.lba_offset, plan.encodings.len() as u32 + 1);
    let layout = place_files(layout, plan)?;
    let layout = place_directories(layout, plan)?;
    let layout = place_path_tables(layout, plan)?;
    let layout = push_back(layout);
    let layout = reserve_trailing(layout, plan.options)?;
    let layout = fit_end_sector(layout, plan.options)?;
    let layout = place_descriptors(layout, plan);
    debug!(
        "Volume spans LBA {}..{} (content from LBA {})",
        layout.lba_offset,
        layout.lba_of(layout.size),
        layout.lba_of(layout.content_start())
    );
    Ok(layout)
}

fn push_record(
    out: &mut Vec<u8>,
    name: &[u8],
    location: u32,
    length: u32,
    recorded: &DateTime<Utc>,
    is_dir: bool,
) {
    let used = out.len() % SECTOR_SIZE;
    if used + directory_record_size(name.len()) > SECTOR_SIZE {
        out.resize(out.len().align_up(SECTOR_SIZE), 0);
    }
    write_directory_record(out, name, location, length, recorded, is_dir);
}

fn dir_record(layout: &Layout, encoding: Encoding, dir: DirId) -> Result<(u32, u32)> {
    let extent = layout
        .get(ExtentKind::Directory(encoding, dir))
        .ok_or_else(|| Error::Other(format!("Directory {} was not placed", dir.index())))?;
    Ok((layout.lba_of(extent.offset), extent.length as u32))
}

fn render_directory(
    layout: &Layout,
    plan: &Plan,
    encoding: Encoding,
    dir: DirId,
    length: u64,
) -> Result<Arc<[u8]>> {
    let node = plan.tree.dir(dir);
    let mut out = Vec::with_capacity(length as usize);
    let (location, size) = dir_record(layout, encoding, dir)?;
    push_record(&mut out, &[0], location, size, &plan.recorded(NodeId::Dir(dir)), true);
    let (location, size) = dir_record(layout, encoding, node.parent)?;
    push_record(&mut out, &[1], location, size, &plan.recorded(NodeId::Dir(node.parent)), true);
    for (identifier, child) in plan.tree.sorted_children(dir, encoding) {
        let (location, size, is_dir) = match child {
            NodeId::Dir(id) => {
                let (location, size) = dir_record(layout, encoding, id)?;
                (location, size, true)
            }
            NodeId::File(id) => {
                let location = layout.location(ExtentKind::File(id)).unwrap_or(0);
                (location, plan.tree.file(id).size as u32, false)
            }
        };
        push_record(&mut out, &identifier, location, size, &plan.recorded(child), is_dir);
    }
    if out.len() as u64 > length {
        return Err(Error::Other(format!(
            "Directory {} overflows its extent ({} > {})",
            dir.index(),
            out.len(),
            length
        )));
    }
    out.resize(length as usize, 0);
    Ok(Arc::from(out))
}

fn render_path_table(
    layout: &Layout,
    entries: &[PathTableEntry],
    encoding: Encoding,
    endian: Endian,
) -> Result<Arc<[u8]>> {
    let mut out = Vec::with_capacity(path_table_size(entries) as usize);
    for entry in entries {
        let (location, _) = dir_record(layout, encoding, entry.dir)?;
        out.push(entry.identifier.len() as u8);
        out.push(0);
        match endian {
            Endian::Little => {
                out.extend_from_slice(&location.to_le_bytes());
                out.extend_from_slice(&entry.parent.to_le_bytes());
            }
            Endian::Big => {
                out.extend_from_slice(&location.to_be_bytes());
                out.extend_from_slice(&entry.parent.to_be_bytes());
            }
        }
        out.extend_from_slice(&entry.identifier);
        if entry.identifier.len() % 2 == 1 {
            out.push(0);
        }
    }
    Ok(Arc::from(out))
}

fn render_descriptor(layout: &Layout, plan: &Plan, index: u8) -> Result<Arc<[u8]>> {
    let Some(&encoding) = plan.encodings.get(index as usize) else {
        let desc = VolumeDescriptor::new(DescriptorType::Terminator)?;
        return Ok(Arc::from(desc.as_bytes()));
    };
    let mut desc = VolumeDescriptor::new(match encoding {
        Encoding::Primary => DescriptorType::Primary,
        Encoding::Joliet => DescriptorType::Supplementary,
    })?;
    let ids = &plan.options.identifiers;
    write_field(&mut desc.system_id, &ids.system, encoding);
    write_field(&mut desc.volume_id, &ids.volume, encoding);
    desc.volume_space_size = BothU32::new(layout.lba_of(layout.size));
    if encoding == Encoding::Joliet {
        desc.escape_sequences[..3].copy_from_slice(&JOLIET_ESCAPES[2]);
    }
    desc.volume_set_size = BothU16::new(1);
    desc.volume_sequence_number = BothU16::new(1);
    desc.logical_block_size = BothU16::new(SECTOR_SIZE as u16);

    let table = layout
        .get(ExtentKind::PathTable(encoding, Endian::Little))
        .ok_or_else(|| Error::Other(format!("{encoding} path table was not placed")))?;
    desc.path_table_size = BothU32::new(table.length as u32);
    desc.path_table_l = little_endian::U32::new(layout.lba_of(table.offset));
    let table_m = layout.location(ExtentKind::PathTable(encoding, Endian::Big)).unwrap_or(0);
    desc.path_table_m = big_endian::U32::new(table_m);

    let (location, size) = dir_record(layout, encoding, VolumeTree::ROOT)?;
    let recorded = plan.recorded(NodeId::Dir(VolumeTree::ROOT));
    desc.root = DirectoryRecordHeader::new(1, location, size, &recorded, true);
    desc.root_name = 0;

    write_field(&mut desc.volume_set_id, &ids.volume_set, encoding);
    write_field(&mut desc.publisher_id, &ids.publisher, encoding);
    write_field(&mut desc.preparer_id, &ids.preparer, encoding);
    write_field(&mut desc.application_id, &ids.application, encoding);
    write_field(&mut desc.copyright_file_id, "", encoding);
    write_field(&mut desc.abstract_file_id, "", encoding);
    write_field(&mut desc.bibliographic_file_id, "", encoding);
    desc.creation_date = DescriptorDate::from_datetime(&plan.options.creation_time);
    desc.modification_date = desc.creation_date;
    desc.expiration_date = DescriptorDate::UNSET;
    desc.effective_date = DescriptorDate::UNSET;
    desc.file_structure_version = 1;
    Ok(Arc::from(desc.as_bytes()))
}

/// Contents of a range of the volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteKind {
    /// File contents, read from the file's source.
    File(FileId),
    /// Generated data.
    Static(Arc<[u8]>, &'static str),
}

impl fmt::Display for WriteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteKind::File(id) => write!(f, "file #{}", id.index()),
            WriteKind::Static(_, name) => f.write_str(name),
        }
    }
}

/// A byte range of the volume and its contents.
#[derive(Debug, Clone)]
pub struct WriteInfo {
    /// What the range holds.
    pub kind: WriteKind,
    /// Length in bytes.
    pub size: u64,
    /// Byte offset from the start of the volume.
    pub offset: u64,
}

fn render(layout: &Layout, plan: &Plan) -> Result<Vec<WriteInfo>> {
    let mut write_info = Vec::with_capacity(layout.extents.len());
    for extent in &layout.extents {
        let kind = match extent.kind {
            ExtentKind::File(id) => WriteKind::File(id),
            ExtentKind::Directory(encoding, dir) => WriteKind::Static(
                render_directory(layout, plan, encoding, dir, extent.length)?,
                "[directory]",
            ),
            ExtentKind::PathTable(encoding, endian) => {
                let table = plan
                    .trees()
                    .find(|(enc, _)| *enc == encoding)
                    .map(|(_, table)| table)
                    .unwrap_or_default();
                WriteKind::Static(
                    render_path_table(layout, table, encoding, endian)?,
                    "[path table]",
                )
            }
            ExtentKind::Descriptor(index) => {
                WriteKind::Static(render_descriptor(layout, plan, index)?, "[volume descriptor]")
            }
        };
        write_info.push(WriteInfo { kind, size: extent.length, offset: extent.offset });
    }
    sort_write_info(&mut write_info)?;
    Ok(write_info)
}

fn sort_write_info(write_info: &mut [WriteInfo]) -> Result<()> {
    write_info.sort_unstable_by_key(|info| (info.offset, info.size));
    let overlap = write_info
        .iter()
        .tuple_windows()
        .find(|(prev, cur)| cur.offset < prev.offset + prev.size);
    if let Some((prev, cur)) = overlap {
        return Err(Error::Other(format!(
            "{} ({:#X}-{:#X}) overlaps with {} ({:#X}-{:#X})",
            cur.kind,
            cur.offset,
            cur.offset + cur.size,
            prev.kind,
            prev.offset,
            prev.offset + prev.size
        )));
    }
    Ok(())
}

/// Lays out and renders an ISO9660 volume from a [`VolumeTree`].
#[derive(Debug, Clone)]
pub struct IsoBuilder {
    tree: VolumeTree,
}

impl IsoBuilder {
    /// Creates a builder for a tree.
    #[inline]
    pub fn new(tree: VolumeTree) -> Self { Self { tree } }

    /// The tree being built.
    #[inline]
    pub fn tree(&self) -> &VolumeTree { &self.tree }

    /// Computes the layout without rendering anything.
    pub fn layout(&self, options: &IsoOptions) -> Result<Layout> {
        run_layout(&Plan::new(&self.tree, options)?)
    }

    /// Lays out and renders the volume.
    #[instrument(name = "IsoBuilder::build", skip_all)]
    pub fn build(self, options: &IsoOptions) -> Result<IsoImage> {
        let (layout, write_info) = {
            let plan = Plan::new(&self.tree, options)?;
            let layout = run_layout(&plan)?;
            let write_info = render(&layout, &plan)?;
            (layout, write_info)
        };
        Ok(IsoImage {
            write_info,
            size: layout.size,
            layout,
            sources: Arc::from(self.tree.into_sources()),
        })
    }
}

/// A rendered volume. File contents are read from their sources on demand.
#[derive(Debug, Clone)]
pub struct IsoImage {
    write_info: Vec<WriteInfo>,
    size: u64,
    layout: Layout,
    sources: Arc<[FileSource]>,
}

impl IsoImage {
    /// The final layout.
    #[inline]
    pub fn layout(&self) -> &Layout { &self.layout }

    /// Volume size in bytes.
    #[inline]
    pub fn size(&self) -> u64 { self.size }

    /// Every range of the volume that holds data, sorted by offset.
    #[inline]
    pub fn write_info(&self) -> &[WriteInfo] { &self.write_info }

    /// Places data in the system area (the first 16 sectors), replacing any previous data.
    pub fn set_system_area(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > BOOT_HEADER_SIZE {
            return Err(Error::Other(format!(
                "System area data is too large ({} > {})",
                data.len(),
                BOOT_HEADER_SIZE
            )));
        }
        self.write_info.retain(|info| !matches!(info.kind, WriteKind::Static(_, "[system area]")));
        if !data.is_empty() {
            self.write_info.insert(0, WriteInfo {
                kind: WriteKind::Static(Arc::from(data), "[system area]"),
                size: data.len() as u64,
                offset: 0,
            });
        }
        Ok(())
    }

    /// Returns a seekable stream over the whole volume.
    pub fn stream(&self) -> Box<dyn DiscStream> {
        Box::new(IsoStream {
            write_info: Arc::from(self.write_info.as_slice()),
            sources: self.sources.clone(),
            size: self.size,
            pos: 0,
            open: None,
        })
    }

    fn copy_file(&self, out: &mut dyn Write, id: FileId, size: u64) -> io::Result<u64> {
        match &self.sources[id.index()] {
            FileSource::Buffer(data) => {
                let len = (data.len() as u64).min(size) as usize;
                out.write_all(&data[..len])?;
                Ok(len as u64)
            }
            FileSource::Path(path) => {
                let file = File::open(path)
                    .io_with_context(|| format!("Opening {}", path.display()))?;
                io::copy(&mut file.take(size), out)
            }
            FileSource::Stream(stream) => {
                let mut stream = stream.clone();
                stream.seek(SeekFrom::Start(0))?;
                io::copy(&mut stream.take(size), out)
            }
        }
    }

    /// Writes the whole volume to `out`.
    pub fn write_to<W>(&self, out: &mut W) -> Result<()>
    where W: Write + ?Sized {
        let mut out = WriteCursor { inner: out, position: 0 };
        for info in &self.write_info {
            out.write_zeroes_until(info.offset).context("Writing padding")?;
            match &info.kind {
                WriteKind::File(id) => {
                    self.copy_file(&mut out, *id, info.size).with_context(|| {
                        format!("Writing {:?}", self.sources[id.index()])
                    })?;
                }
                WriteKind::Static(data, name) => out.write_all(data).with_context(|| {
                    format!("Writing {} ({} bytes)", name, data.len())
                })?,
            }
            if out.position != info.offset + info.size {
                return Err(Error::Other(format!(
                    "{}: wrote {} bytes, expected {}",
                    info.kind,
                    out.position - info.offset,
                    info.size
                )));
            }
        }
        out.write_zeroes_until(self.size).context("Writing end of volume")?;
        out.flush().context("Flushing output")?;
        Ok(())
    }
}

struct WriteCursor<W> {
    inner: W,
    position: u64,
}

impl<W> WriteCursor<W>
where W: Write
{
    fn write_zeroes_until(&mut self, until: u64) -> io::Result<()> {
        static ZEROES: [u8; 0x1000] = [0u8; 0x1000];
        let mut remaining = until.saturating_sub(self.position);
        while remaining > 0 {
            let write_len = remaining.min(ZEROES.len() as u64) as usize;
            let written = self.write(&ZEROES[..write_len])?;
            remaining -= written as u64;
        }
        Ok(())
    }
}

impl<W> Write for WriteCursor<W>
where W: Write
{
    #[inline]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let len = self.inner.write(buf)?;
        self.position += len as u64;
        Ok(len)
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> { self.inner.flush() }
}

enum OpenSource {
    Buffer(Bytes),
    File(File),
    Stream(Box<dyn DiscStream>),
}

struct IsoStream {
    write_info: Arc<[WriteInfo]>,
    sources: Arc<[FileSource]>,
    size: u64,
    pos: u64,
    open: Option<(FileId, OpenSource)>,
}

impl Clone for IsoStream {
    fn clone(&self) -> Self {
        Self {
            write_info: self.write_info.clone(),
            sources: self.sources.clone(),
            size: self.size,
            pos: self.pos,
            open: None,
        }
    }
}

impl IsoStream {
    fn open_source(&mut self, id: FileId) -> io::Result<&mut OpenSource> {
        if self.open.as_ref().is_none_or(|(open, _)| *open != id) {
            let source = match &self.sources[id.index()] {
                FileSource::Buffer(data) => OpenSource::Buffer(data.clone()),
                FileSource::Path(path) => OpenSource::File(
                    File::open(path).io_with_context(|| format!("Opening {}", path.display()))?,
                ),
                FileSource::Stream(stream) => OpenSource::Stream(stream.clone()),
            };
            self.open = Some((id, source));
        }
        match &mut self.open {
            Some((_, source)) => Ok(source),
            None => Err(io::Error::other("no open file")),
        }
    }

    fn read_file(&mut self, out: &mut [u8], id: FileId, offset: u64) -> io::Result<()> {
        match self.open_source(id)? {
            OpenSource::Buffer(data) => {
                let start = offset as usize;
                let Some(src) = data.get(start..start + out.len()) else {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "buffer is shorter than the recorded file size",
                    ));
                };
                out.copy_from_slice(src);
                Ok(())
            }
            OpenSource::File(file) => read_exact_at(file, out, offset),
            OpenSource::Stream(stream) => {
                stream.seek(SeekFrom::Start(offset))?;
                stream.read_exact(out)
            }
        }
    }
}

impl Read for IsoStream {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.size {
            return Ok(0);
        }

        let write_info = self.write_info.clone();
        let end = (self.size - self.pos).min(out.len() as u64) as usize;
        let mut buf = &mut out[..end];
        let mut curr = write_info
            .binary_search_by_key(&self.pos, |i| i.offset)
            .unwrap_or_else(|idx| idx.saturating_sub(1));
        let mut pos = self.pos;
        let mut total = 0;
        while !buf.is_empty() {
            let Some(info) = write_info.get(curr) else {
                buf.fill(0);
                total += buf.len();
                break;
            };
            if pos >= info.offset + info.size {
                curr += 1;
                continue;
            }
            let read = if pos < info.offset {
                let read = buf.len().min((info.offset - pos) as usize);
                buf[..read].fill(0);
                read
            } else {
                let read = buf.len().min((info.offset + info.size - pos) as usize);
                match &info.kind {
                    WriteKind::File(id) => {
                        let (id, offset) = (*id, pos - info.offset);
                        self.read_file(&mut buf[..read], id, offset).io_with_context(|| {
                            format!("Reading {:?}", self.sources[id.index()])
                        })?;
                    }
                    WriteKind::Static(data, _) => {
                        let offset = (pos - info.offset) as usize;
                        buf[..read].copy_from_slice(&data[offset..offset + read]);
                    }
                }
                curr += 1;
                read
            };
            buf = &mut buf[read..];
            pos += read as u64;
            total += read;
        }
        self.pos = pos;
        Ok(total)
    }
}

impl Seek for IsoStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.pos = match pos {
            SeekFrom::Start(pos) => pos,
            SeekFrom::End(v) => self.size.saturating_add_signed(v),
            SeekFrom::Current(v) => self.pos.saturating_add_signed(v),
        };
        Ok(self.pos)
    }
}
