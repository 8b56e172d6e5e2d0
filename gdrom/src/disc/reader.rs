use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};
use zerocopy::FromBytes;

use crate::{
    common::Encoding,
    disc::{sector::user_data_offset, RAW_SECTOR_SIZE, SECTOR_SIZE},
    iso::{
        decode_identifier, parse_directory_record, DescriptorType, VolumeDescriptor,
        DESCRIPTOR_START_SECTOR,
    },
    read::{
        DecodedVolumeDescriptor, DirEntry, EncodingPreference, Partition, RootSource, SectorSource,
    },
    util::div_rem,
    Error, Result, ResultContext,
};

/// Reads logical sectors out of a [`SectorSource`], stripping raw frame headers.
struct LogicalReader<'a> {
    source: &'a mut dyn SectorSource,
    buf: Vec<u8>,
}

impl<'a> LogicalReader<'a> {
    fn new(source: &'a mut dyn SectorSource) -> Result<Self> {
        let sector_size = source.sector_size();
        if sector_size != SECTOR_SIZE && sector_size != RAW_SECTOR_SIZE {
            return Err(Error::DiscFormat(format!("Unsupported sector size {sector_size}")));
        }
        Ok(Self { source, buf: vec![0u8; sector_size] })
    }

    fn read(&mut self, lba: u32) -> Result<&[u8]> {
        self.source
            .read_sector(lba, &mut self.buf)
            .with_context(|| format!("Reading sector {lba}"))?;
        let offset = if self.buf.len() == RAW_SECTOR_SIZE { user_data_offset(&self.buf) } else { 0 };
        Ok(&self.buf[offset..offset + SECTOR_SIZE])
    }

    fn read_bytes(&mut self, lba: u32, offset: u64, len: u64) -> Result<Vec<u8>> {
        let (sector, skip) = div_rem(offset, SECTOR_SIZE as u64);
        let mut out = Vec::with_capacity(len as usize);
        let mut lba = lba + sector as u32;
        let mut skip = skip as usize;
        while (out.len() as u64) < len {
            let remaining = (len - out.len() as u64) as usize;
            let data = self.read(lba)?;
            let take = (SECTOR_SIZE - skip).min(remaining);
            out.extend_from_slice(&data[skip..skip + take]);
            skip = 0;
            lba += 1;
        }
        Ok(out)
    }
}

fn decode_descriptor(lba: u32, desc: &VolumeDescriptor) -> DecodedVolumeDescriptor {
    DecodedVolumeDescriptor {
        lba,
        encoding: desc.encoding(),
        system_id: desc.field_str(&desc.system_id).into_owned(),
        volume_id: desc.field_str(&desc.volume_id).into_owned(),
        volume_set_id: desc.field_str(&desc.volume_set_id).into_owned(),
        publisher_id: desc.field_str(&desc.publisher_id).into_owned(),
        preparer_id: desc.field_str(&desc.preparer_id).into_owned(),
        application_id: desc.field_str(&desc.application_id).into_owned(),
        block_count: desc.volume_space_size.get(),
        created: desc.creation_date.to_datetime(),
        modified: desc.modification_date.to_datetime(),
        root_location: desc.root.extent.get(),
        root_size: desc.root.data_length.get() as u64,
        path_table_location: desc.path_table_l.get(),
        path_table_size: desc.path_table_size.get(),
    }
}

/// Scans the volume descriptor set starting 16 sectors into the partition.
fn scan_descriptors(
    reader: &mut LogicalReader,
    partition: Partition,
) -> Result<Vec<DecodedVolumeDescriptor>> {
    let mut found = Vec::new();
    let mut lba = partition.start + DESCRIPTOR_START_SECTOR;
    let mut first = true;
    while lba < partition.end {
        let desc = VolumeDescriptor::read_from_bytes(reader.read(lba)?)
            .map_err(|_| Error::DiscFormat("Short descriptor sector".to_string()))?;
        let kind = DescriptorType::from_u8(desc.descriptor_type);
        if !desc.is_valid() || kind == Some(DescriptorType::Terminator) {
            if first {
                return Err(Error::DiscFormat("no volume descriptor".to_string()));
            }
            break;
        }
        match kind {
            Some(DescriptorType::Primary | DescriptorType::Supplementary) => {
                let decoded = decode_descriptor(lba, &desc);
                debug!(
                    "Found {} volume descriptor at LBA {}: {:?}",
                    decoded.encoding, lba, decoded.volume_id
                );
                found.push(decoded);
            }
            _ => debug!("Skipping volume descriptor type {} at LBA {}", desc.descriptor_type, lba),
        }
        first = false;
        lba += 1;
    }
    if found.is_empty() {
        return Err(Error::DiscFormat("no volume descriptor".to_string()));
    }
    Ok(found)
}

fn select_descriptor(found: &[DecodedVolumeDescriptor], preference: EncodingPreference) -> usize {
    let position = |encoding| found.iter().position(|d| d.encoding == encoding);
    match preference {
        EncodingPreference::Joliet => {
            position(Encoding::Joliet).or_else(|| position(Encoding::Primary))
        }
        EncodingPreference::Primary => position(Encoding::Primary),
    }
    .unwrap_or(0)
}

/// Returns the size of the directory at `location` if its "." record points back at itself.
fn self_consistent_dir(reader: &mut LogicalReader, location: u32) -> Option<u64> {
    let data = match reader.read(location) {
        Ok(data) => data,
        Err(e) => {
            warn!("Failed to read directory at LBA {}: {}", location, e);
            return None;
        }
    };
    let (header, name) = parse_directory_record(data)?;
    (name == [0] && header.is_dir() && header.extent.get() == location)
        .then(|| header.data_length.get() as u64)
}

/// Returns the root location listed in the first type L path table record.
fn path_table_root(reader: &mut LogicalReader, desc: &DecodedVolumeDescriptor) -> Option<u32> {
    if desc.path_table_size < 8 || desc.path_table_location == 0 {
        return None;
    }
    let data = match reader.read(desc.path_table_location) {
        Ok(data) => data,
        Err(e) => {
            warn!("Failed to read path table at LBA {}: {}", desc.path_table_location, e);
            return None;
        }
    };
    (data[0] == 1 && data[8] == 0).then(|| u32::from_le_bytes([data[2], data[3], data[4], data[5]]))
}

/// Best-effort reconciliation of the descriptor root with the path table root.
///
/// The descriptor wins unless its own "." record does not point back at its location, in
/// which case a self-consistent path table root is used instead.
fn resolve_root(
    reader: &mut LogicalReader,
    desc: &DecodedVolumeDescriptor,
) -> Result<(RootSource, DirEntry)> {
    let root = |location, size| DirEntry {
        name: String::new(),
        location,
        size,
        is_dir: true,
        recorded: desc.created,
    };
    let from_descriptor = self_consistent_dir(reader, desc.root_location);
    let from_table = path_table_root(reader, desc);
    match (from_descriptor, from_table) {
        (Some(_), table) => {
            if let Some(location) = table.filter(|&l| l != desc.root_location) {
                warn!(
                    "Path table root (LBA {}) disagrees with descriptor root (LBA {}), using descriptor",
                    location, desc.root_location
                );
            }
            Ok((RootSource::FromDescriptor, root(desc.root_location, desc.root_size)))
        }
        (None, Some(location)) => match self_consistent_dir(reader, location) {
            Some(size) => {
                warn!(
                    "Descriptor root (LBA {}) is inconsistent, using path table root (LBA {})",
                    desc.root_location, location
                );
                Ok((RootSource::FromPathTable, root(location, size)))
            }
            None => Err(Error::DiscFormat("cannot find root directory".to_string())),
        },
        (None, None) => Err(Error::DiscFormat("cannot find root directory".to_string())),
    }
}

/// Normalizes a path to the upper-cased, `/`-separated cache key form.
fn cache_key(path: &str) -> String {
    let parts = path
        .split(['/', '\\'])
        .filter(|s| !s.is_empty() && *s != ".")
        .map(|s| s.to_uppercase())
        .collect::<Vec<_>>();
    format!("/{}", parts.join("/"))
}

fn child_key(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name.to_uppercase())
    } else {
        format!("{}/{}", parent, name.to_uppercase())
    }
}

fn record_name(raw: &[u8], encoding: Encoding) -> String {
    let name = decode_identifier(raw, encoding);
    let name = name.split(';').next().unwrap_or_default();
    match encoding {
        Encoding::Primary => name.strip_suffix('.').unwrap_or(name).to_string(),
        Encoding::Joliet => name.to_string(),
    }
}

/// Descriptor state and directory cache of a mounted volume.
pub(crate) struct MountedVolume {
    descriptors: Vec<DecodedVolumeDescriptor>,
    active: usize,
    root_source: RootSource,
    entries: HashMap<String, DirEntry>,
    children: HashMap<String, Vec<String>>,
    loaded: HashSet<String>,
}

impl MountedVolume {
    pub fn mount(
        source: &mut dyn SectorSource,
        partition: Partition,
        preference: EncodingPreference,
    ) -> Result<Self> {
        let mut reader = LogicalReader::new(source)?;
        let descriptors = scan_descriptors(&mut reader, partition)?;
        let active = select_descriptor(&descriptors, preference);
        let (root_source, root) = resolve_root(&mut reader, &descriptors[active])?;
        debug!(
            "Mounted {} tree, root at LBA {} ({:?})",
            descriptors[active].encoding, root.location, root_source
        );
        let mut entries = HashMap::new();
        entries.insert("/".to_string(), root);
        Ok(Self {
            descriptors,
            active,
            root_source,
            entries,
            children: HashMap::new(),
            loaded: HashSet::new(),
        })
    }

    #[inline]
    pub fn descriptor(&self) -> &DecodedVolumeDescriptor { &self.descriptors[self.active] }

    #[inline]
    pub fn descriptors(&self) -> &[DecodedVolumeDescriptor] { &self.descriptors }

    #[inline]
    pub fn root_source(&self) -> RootSource { self.root_source }

    fn load_dir(&mut self, source: &mut dyn SectorSource, key: &str) -> Result<()> {
        if self.loaded.contains(key) {
            return Ok(());
        }
        let Some(dir) = self.entries.get(key).cloned() else {
            return Ok(());
        };
        let encoding = self.descriptor().encoding;
        let data = LogicalReader::new(source)?.read_bytes(dir.location, 0, dir.size)?;
        let mut names = Vec::new();
        for sector in data.chunks(SECTOR_SIZE) {
            let mut pos = 0;
            while pos < sector.len() && sector[pos] != 0 {
                let Some((header, raw_name)) = parse_directory_record(&sector[pos..]) else {
                    warn!("Malformed directory record in {} at offset {}", key, pos);
                    break;
                };
                pos += header.length as usize;
                if raw_name == [0] || raw_name == [1] {
                    continue;
                }
                let name = record_name(raw_name, encoding);
                let child = child_key(key, &name);
                self.entries.insert(child.clone(), DirEntry {
                    name,
                    location: header.extent.get(),
                    size: header.data_length.get() as u64,
                    is_dir: header.is_dir(),
                    recorded: header.recorded.to_datetime(),
                });
                names.push(child);
            }
        }
        debug!("Loaded directory {} ({} entries)", key, names.len());
        self.children.insert(key.to_string(), names);
        self.loaded.insert(key.to_string());
        Ok(())
    }

    pub fn lookup(
        &mut self,
        source: &mut dyn SectorSource,
        path: &str,
    ) -> Result<Option<DirEntry>> {
        let key = cache_key(path);
        if let Some(entry) = self.entries.get(&key) {
            return Ok(Some(entry.clone()));
        }
        let mut parent = "/".to_string();
        for part in key.split('/').filter(|s| !s.is_empty()) {
            match self.entries.get(&parent) {
                Some(entry) if entry.is_dir => {}
                _ => return Ok(None),
            }
            self.load_dir(source, &parent)?;
            parent = child_key(&parent, part);
        }
        Ok(self.entries.get(&key).cloned())
    }

    pub fn list(
        &mut self,
        source: &mut dyn SectorSource,
        path: &str,
    ) -> Result<Option<Vec<DirEntry>>> {
        let Some(entry) = self.lookup(source, path)? else {
            return Ok(None);
        };
        if !entry.is_dir {
            return Ok(None);
        }
        let key = cache_key(path);
        self.load_dir(source, &key)?;
        Ok(self
            .children
            .get(&key)
            .map(|names| names.iter().filter_map(|n| self.entries.get(n).cloned()).collect()))
    }

    pub fn read_extent(
        &mut self,
        source: &mut dyn SectorSource,
        location: u32,
        offset: u64,
        len: u64,
    ) -> Result<Vec<u8>> {
        LogicalReader::new(source)?.read_bytes(location, offset, len)
    }
}

#[cfg(test)]
mod tests {
    use std::io::{self, Read};

    use bytes::Bytes;
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::{
        build::iso::{IsoBuilder, IsoOptions},
        iso::tree::{FileSource, VolumeTree},
        read::{ReaderOptions, VolumeReader},
    };

    struct MemorySource(Vec<u8>);

    impl SectorSource for MemorySource {
        fn read_sector(&mut self, lba: u32, out: &mut [u8]) -> io::Result<()> {
            let start = lba as usize * SECTOR_SIZE;
            let src = self.0.get(start..start + SECTOR_SIZE).ok_or(io::ErrorKind::UnexpectedEof)?;
            out.copy_from_slice(src);
            Ok(())
        }

        fn sector_size(&self) -> usize { SECTOR_SIZE }
    }

    // PVD at 16, terminator at 17, path tables at 18 and 19, A.BIN at 20, root at 23
    fn image() -> Vec<u8> {
        let mut tree = VolumeTree::new();
        let data = Bytes::from(vec![0x5Au8; 5000]);
        tree.add_file("/A.BIN", 5000, FileSource::Buffer(data), None).unwrap();
        let options = IsoOptions {
            creation_time: Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap(),
            ..Default::default()
        };
        let image = IsoBuilder::new(tree).build(&options).unwrap();
        let mut out = Vec::new();
        image.stream().read_to_end(&mut out).unwrap();
        out
    }

    fn mount(data: Vec<u8>) -> Result<VolumeReader> {
        let end = (data.len() / SECTOR_SIZE) as u32;
        VolumeReader::mount(
            Box::new(MemorySource(data)),
            Partition { start: 0, end },
            &ReaderOptions::default(),
        )
    }

    fn set_root_extent(data: &mut [u8], location: u32) {
        let record = 16 * SECTOR_SIZE + 156;
        data[record + 2..record + 6].copy_from_slice(&location.to_le_bytes());
        data[record + 6..record + 10].copy_from_slice(&location.to_be_bytes());
    }

    #[test]
    fn test_root_from_descriptor() {
        let mut reader = mount(image()).unwrap();
        assert_eq!(reader.root_source().unwrap(), RootSource::FromDescriptor);
        assert_eq!(reader.stat_path("/").unwrap().unwrap().location, 23);
    }

    #[test]
    fn test_root_from_path_table() {
        let mut data = image();
        // Points at the file contents, whose first record is not a "." entry
        set_root_extent(&mut data, 20);
        let mut reader = mount(data).unwrap();
        assert_eq!(reader.root_source().unwrap(), RootSource::FromPathTable);
        assert_eq!(reader.descriptor().unwrap().root_location, 20);
        assert_eq!(reader.stat_path("/A.BIN").unwrap().unwrap().location, 20);
        assert_eq!(reader.read_path("/A.BIN", 4990, 10).unwrap(), Some(vec![0x5A; 10]));
    }

    #[test]
    fn test_root_not_found() {
        let mut data = image();
        set_root_extent(&mut data, 20);
        // Break the type L path table record
        data[18 * SECTOR_SIZE] = 0;
        let err = mount(data);
        assert!(matches!(err, Err(Error::DiscFormat(msg)) if msg == "cannot find root directory"));
    }

    #[test]
    fn test_no_volume_descriptor() {
        let err = mount(vec![0u8; 20 * SECTOR_SIZE]);
        assert!(matches!(err, Err(Error::DiscFormat(msg)) if msg == "no volume descriptor"));

        // A terminator in the first descriptor slot
        let mut data = image();
        data.copy_within(17 * SECTOR_SIZE..18 * SECTOR_SIZE, 16 * SECTOR_SIZE);
        let err = mount(data);
        assert!(matches!(err, Err(Error::DiscFormat(msg)) if msg == "no volume descriptor"));
    }

    #[test]
    fn test_cache_key() {
        assert_eq!(cache_key("/"), "/");
        assert_eq!(cache_key(""), "/");
        assert_eq!(cache_key("/data//sub/File.bin"), "/DATA/SUB/FILE.BIN");
        assert_eq!(cache_key("\\IP.BIN"), "/IP.BIN");
        assert_eq!(child_key("/", "a"), "/A");
        assert_eq!(child_key("/A", "b.bin"), "/A/B.BIN");
    }

    #[test]
    fn test_record_name() {
        assert_eq!(record_name(b"1ST_READ.BIN;1", Encoding::Primary), "1ST_READ.BIN");
        assert_eq!(record_name(b"NOEXT.;1", Encoding::Primary), "NOEXT");
        assert_eq!(record_name(b"DATA", Encoding::Primary), "DATA");
        assert_eq!(record_name(&[0, b'a', 0, b';', 0, b'1'], Encoding::Joliet), "a");
    }
}
