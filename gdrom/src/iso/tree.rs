//! In-memory directory tree of an ISO9660 volume.

use std::{
    fmt,
    fs,
    path::{Path, PathBuf},
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use tracing::debug;

use crate::{
    common::Encoding, iso::decode_identifier, read::DiscStream, Error, Result, ResultContext,
};

/// Maximum length of a primary file or directory identifier, excluding the version suffix.
pub const MAX_PRIMARY_NAME_LEN: usize = 207;

/// Maximum length of a Joliet identifier in UCS-2 characters, excluding the version suffix.
pub const MAX_JOLIET_NAME_LEN: usize = 64;

/// Handle to a directory in a [`VolumeTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DirId(usize);

impl DirId {
    /// Index of the directory in registration order. The root is always 0.
    #[inline]
    pub fn index(self) -> usize { self.0 }
}

/// Handle to a file in a [`VolumeTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(usize);

impl FileId {
    /// Index of the file in registration order.
    #[inline]
    pub fn index(self) -> usize { self.0 }
}

/// Handle to either kind of node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeId {
    /// A directory.
    Dir(DirId),
    /// A file.
    File(FileId),
}

/// Where the contents of a file come from.
#[derive(Clone)]
pub enum FileSource {
    /// An in-memory buffer.
    Buffer(Bytes),
    /// A file on the host filesystem.
    Path(PathBuf),
    /// An existing stream, read from its start.
    Stream(Box<dyn DiscStream>),
}

impl fmt::Debug for FileSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileSource::Buffer(data) => write!(f, "Buffer({} bytes)", data.len()),
            FileSource::Path(path) => write!(f, "Path({})", path.display()),
            FileSource::Stream(_) => write!(f, "Stream"),
        }
    }
}

/// A directory node.
#[derive(Debug, Clone)]
pub struct DirectoryNode {
    /// Name as given by the caller (empty for the root).
    pub name: String,
    /// Parent directory. The root is its own parent.
    pub parent: DirId,
    /// Recording timestamp, if known.
    pub modified: Option<DateTime<Utc>>,
    children: Vec<NodeId>,
}

impl DirectoryNode {
    /// Child nodes in registration order.
    #[inline]
    pub fn children(&self) -> &[NodeId] { &self.children }
}

/// A file node.
#[derive(Debug, Clone)]
pub struct FileNode {
    /// Name as given by the caller.
    pub name: String,
    /// Version suffix (`;1`).
    pub version: u16,
    /// Size in bytes.
    pub size: u64,
    /// Content source.
    pub source: FileSource,
    /// Recording timestamp, if known.
    pub modified: Option<DateTime<Utc>>,
    /// Containing directory.
    pub parent: DirId,
}

/// A path table record before locations are assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTableEntry {
    /// Encoded directory identifier (`[0]` for the root).
    pub identifier: Vec<u8>,
    /// 1-based index of the parent entry.
    pub parent: u16,
    /// The directory this entry describes.
    pub dir: DirId,
}

/// An arena-backed directory tree.
#[derive(Debug, Clone)]
pub struct VolumeTree {
    dirs: Vec<DirectoryNode>,
    files: Vec<FileNode>,
    last_file: Option<FileId>,
}

impl Default for VolumeTree {
    fn default() -> Self { Self::new() }
}

fn split_path(path: &str) -> Vec<&str> {
    path.split(['/', '\\']).filter(|s| !s.is_empty() && *s != ".").collect()
}

impl VolumeTree {
    /// The root directory.
    pub const ROOT: DirId = DirId(0);

    /// Creates a tree containing only the root directory.
    pub fn new() -> Self {
        Self {
            dirs: vec![DirectoryNode {
                name: String::new(),
                parent: Self::ROOT,
                modified: None,
                children: Vec::new(),
            }],
            files: Vec::new(),
            last_file: None,
        }
    }

    /// Populates a tree from a directory on the host filesystem. Entries are added in
    /// name order.
    pub fn from_host_dir(root: &Path) -> Result<Self> {
        let mut tree = Self::new();
        tree.add_host_dir(root, "")?;
        debug!(
            "Loaded {} files and {} directories from {}",
            tree.files.len(),
            tree.dirs.len(),
            root.display()
        );
        Ok(tree)
    }

    fn add_host_dir(&mut self, dir: &Path, prefix: &str) -> Result<()> {
        let mut entries = fs::read_dir(dir)
            .with_context(|| format!("Reading directory {}", dir.display()))?
            .collect::<std::io::Result<Vec<_>>>()
            .with_context(|| format!("Reading directory {}", dir.display()))?;
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            let path = entry.path();
            let metadata = fs::metadata(&path)
                .with_context(|| format!("Reading metadata of {}", path.display()))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let rel = format!("{prefix}/{name}");
            let modified = metadata.modified().ok().map(DateTime::<Utc>::from);
            if metadata.is_dir() {
                let id = self.add_directory(&rel)?;
                self.dirs[id.0].modified = modified;
                self.add_host_dir(&path, &rel)?;
            } else {
                self.add_file(&rel, metadata.len(), FileSource::Path(path), modified)?;
            }
        }
        Ok(())
    }

    fn child(&self, dir: DirId, name: &str) -> Option<NodeId> {
        self.dirs[dir.0].children.iter().copied().find(|&node| match node {
            NodeId::Dir(id) => self.dirs[id.0].name == name,
            NodeId::File(id) => self.files[id.0].name == name,
        })
    }

    fn full_path(&self, dir: DirId, name: &str) -> String {
        let mut parts = vec![name.to_string()];
        let mut cur = dir;
        while cur != Self::ROOT {
            parts.push(self.dirs[cur.0].name.clone());
            cur = self.dirs[cur.0].parent;
        }
        parts.reverse();
        format!("/{}", parts.join("/"))
    }

    fn push_dir(&mut self, parent: DirId, name: &str) -> DirId {
        let id = DirId(self.dirs.len());
        self.dirs.push(DirectoryNode {
            name: name.to_string(),
            parent,
            modified: None,
            children: Vec::new(),
        });
        self.dirs[parent.0].children.push(NodeId::Dir(id));
        id
    }

    /// Walks to the directory containing the last component of `parts`, creating
    /// intermediate directories.
    fn ensure_parent(&mut self, parts: &[&str]) -> Result<DirId> {
        let mut cur = Self::ROOT;
        for &name in parts {
            cur = match self.child(cur, name) {
                Some(NodeId::Dir(id)) => id,
                Some(NodeId::File(_)) => {
                    return Err(Error::NameCollision(format!(
                        "{} is a file",
                        self.full_path(cur, name)
                    )));
                }
                None => self.push_dir(cur, name),
            };
        }
        Ok(cur)
    }

    /// Adds a directory, creating missing parents. Fails if the name already exists.
    pub fn add_directory(&mut self, path: &str) -> Result<DirId> {
        let parts = split_path(path);
        let Some((name, parents)) = parts.split_last() else {
            return Err(Error::NameCollision("/".to_string()));
        };
        let parent = self.ensure_parent(parents)?;
        if self.child(parent, name).is_some() {
            return Err(Error::NameCollision(self.full_path(parent, name)));
        }
        Ok(self.push_dir(parent, name))
    }

    /// Adds a file, creating missing parent directories. Fails if the name already exists.
    pub fn add_file(
        &mut self,
        path: &str,
        size: u64,
        source: FileSource,
        modified: Option<DateTime<Utc>>,
    ) -> Result<FileId> {
        let parts = split_path(path);
        let Some((name, parents)) = parts.split_last() else {
            return Err(Error::Other(format!("Invalid file path {path:?}")));
        };
        let parent = self.ensure_parent(parents)?;
        if self.child(parent, name).is_some() {
            return Err(Error::NameCollision(self.full_path(parent, name)));
        }
        let id = FileId(self.files.len());
        self.files.push(FileNode {
            name: name.to_string(),
            version: 1,
            size,
            source,
            modified,
            parent,
        });
        self.dirs[parent.0].children.push(NodeId::File(id));
        Ok(id)
    }

    /// Looks up a node by its `/`-separated path (case-sensitive).
    pub fn find(&self, path: &str) -> Option<NodeId> {
        let mut cur = NodeId::Dir(Self::ROOT);
        for name in split_path(path) {
            let NodeId::Dir(dir) = cur else {
                return None;
            };
            cur = self.child(dir, name)?;
        }
        Some(cur)
    }

    /// Finds a file directly inside `dir`, ignoring ASCII case.
    pub fn find_file_ignore_case(&self, dir: DirId, name: &str) -> Option<FileId> {
        self.dirs[dir.0].children.iter().find_map(|&node| match node {
            NodeId::File(id) if self.files[id.0].name.eq_ignore_ascii_case(name) => Some(id),
            _ => None,
        })
    }

    /// Marks a file to be placed after every other file.
    #[inline]
    pub fn set_last_file(&mut self, id: FileId) { self.last_file = Some(id); }

    /// The file marked with [`set_last_file`](Self::set_last_file), if any.
    #[inline]
    pub fn last_file(&self) -> Option<FileId> { self.last_file }

    /// Returns a directory node.
    #[inline]
    pub fn dir(&self, id: DirId) -> &DirectoryNode { &self.dirs[id.0] }

    /// Returns a file node.
    #[inline]
    pub fn file(&self, id: FileId) -> &FileNode { &self.files[id.0] }

    /// Directories in registration order, starting with the root.
    pub fn dirs(&self) -> impl Iterator<Item = (DirId, &DirectoryNode)> {
        self.dirs.iter().enumerate().map(|(i, d)| (DirId(i), d))
    }

    /// Number of directories, including the root.
    #[inline]
    pub fn dir_count(&self) -> usize { self.dirs.len() }

    /// Number of files.
    #[inline]
    pub fn file_count(&self) -> usize { self.files.len() }

    /// Files in placement order: registration order with the last file (if set) moved to
    /// the end.
    pub fn placement_order(&self) -> Vec<FileId> {
        let mut order = (0..self.files.len())
            .map(FileId)
            .filter(|&id| Some(id) != self.last_file)
            .collect::<Vec<_>>();
        if let Some(last) = self.last_file {
            order.push(last);
        }
        order
    }

    /// Consumes the tree, returning file sources indexed by [`FileId::index`].
    pub fn into_sources(self) -> Vec<FileSource> {
        self.files.into_iter().map(|f| f.source).collect()
    }

    /// The encoded identifier of a node.
    pub fn identifier(&self, node: NodeId, encoding: Encoding) -> Vec<u8> {
        match node {
            NodeId::Dir(id) if id == Self::ROOT => vec![0],
            NodeId::Dir(id) => encode_identifier(&self.dirs[id.0].name, None, encoding),
            NodeId::File(id) => {
                let file = &self.files[id.0];
                encode_identifier(&file.name, Some(file.version), encoding)
            }
        }
    }

    /// Children of a directory with their encoded identifiers, sorted by identifier.
    pub fn sorted_children(&self, dir: DirId, encoding: Encoding) -> Vec<(Vec<u8>, NodeId)> {
        let mut children = self.dirs[dir.0]
            .children
            .iter()
            .map(|&node| (self.identifier(node, encoding), node))
            .collect::<Vec<_>>();
        children.sort_by(|a, b| a.0.cmp(&b.0));
        children
    }

    /// Fails with [`Error::NameCollision`] if two children of one directory are recorded
    /// under the same name. Names are compared the way lookups see them: ignoring case and
    /// the version suffix.
    pub fn check_identifiers(&self, encoding: Encoding) -> Result<()> {
        for (id, dir) in self.dirs() {
            let mut keys = dir
                .children
                .iter()
                .map(|&node| (lookup_key(&self.identifier(node, encoding), encoding), node))
                .collect::<Vec<_>>();
            keys.sort_by(|a, b| a.0.cmp(&b.0));
            for ((key, a), (next, b)) in keys.iter().tuple_windows() {
                if key == next {
                    return Err(Error::NameCollision(format!(
                        "{} and {} are both recorded as {} in the {} tree",
                        self.full_path(id, self.node_name(*a)),
                        self.full_path(id, self.node_name(*b)),
                        key,
                        encoding
                    )));
                }
            }
        }
        Ok(())
    }

    fn node_name(&self, node: NodeId) -> &str {
        match node {
            NodeId::Dir(id) => &self.dirs[id.0].name,
            NodeId::File(id) => &self.files[id.0].name,
        }
    }

    /// Derives the path table for an encoding, ordered by depth, then parent index, then
    /// identifier.
    pub fn path_table(&self, encoding: Encoding) -> Result<Vec<PathTableEntry>> {
        if self.dirs.len() > u16::MAX as usize {
            return Err(Error::DiscFormat(format!(
                "{} directories exceed the path table limit of {}",
                self.dirs.len(),
                u16::MAX
            )));
        }
        let mut entries =
            vec![PathTableEntry { identifier: vec![0], parent: 1, dir: Self::ROOT }];
        let mut level_start = 0;
        while level_start < entries.len() {
            let level_end = entries.len();
            for idx in level_start..level_end {
                let dir = entries[idx].dir;
                for (identifier, node) in self.sorted_children(dir, encoding) {
                    if let NodeId::Dir(child) = node {
                        entries.push(PathTableEntry {
                            identifier,
                            parent: (idx + 1) as u16,
                            dir: child,
                        });
                    }
                }
            }
            level_start = level_end;
        }
        Ok(entries)
    }
}

/// The name a reader resolves an identifier to, upper-cased.
fn lookup_key(identifier: &[u8], encoding: Encoding) -> String {
    let name = decode_identifier(identifier, encoding);
    let name = name.split(';').next().unwrap_or_default();
    match encoding {
        Encoding::Primary => name.strip_suffix('.').unwrap_or(name).to_uppercase(),
        Encoding::Joliet => name.to_uppercase(),
    }
}

/// Encodes a name as a primary or Joliet identifier. Files carry a version suffix.
pub fn encode_identifier(name: &str, version: Option<u16>, encoding: Encoding) -> Vec<u8> {
    match encoding {
        Encoding::Primary => {
            let mut out = name
                .chars()
                .take(MAX_PRIMARY_NAME_LEN)
                .map(|c| match c.to_ascii_uppercase() {
                    c @ ('A'..='Z' | '0'..='9' | '_' | '.') => c as u8,
                    _ => b'_',
                })
                .collect::<Vec<_>>();
            if let Some(version) = version {
                if !out.contains(&b'.') {
                    out.push(b'.');
                }
                out.extend_from_slice(format!(";{version}").as_bytes());
            }
            out
        }
        Encoding::Joliet => {
            let mut units = name.encode_utf16().take(MAX_JOLIET_NAME_LEN).collect::<Vec<_>>();
            if let Some(version) = version {
                units.extend(format!(";{version}").encode_utf16());
            }
            units.into_iter().flat_map(u16::to_be_bytes).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(len: usize) -> FileSource { FileSource::Buffer(Bytes::from(vec![0u8; len])) }

    #[test]
    fn test_add_and_find() {
        let mut tree = VolumeTree::new();
        let file = tree.add_file("/DATA/SOUND/BGM.BIN", 100, buffer(100), None).unwrap();
        let dir = tree.add_directory("/DATA/MOVIE").unwrap();
        assert_eq!(tree.find("/DATA/SOUND/BGM.BIN"), Some(NodeId::File(file)));
        assert_eq!(tree.find("DATA/MOVIE/"), Some(NodeId::Dir(dir)));
        assert_eq!(tree.find("/data/movie"), None);
        assert_eq!(tree.find("/DATA/SOUND/BGM.BIN/X"), None);
        assert_eq!(tree.dir_count(), 4);
        assert_eq!(tree.find_file_ignore_case(VolumeTree::ROOT, "bgm.bin"), None);
        assert_eq!(tree.file(file).parent, match tree.find("/DATA/SOUND") {
            Some(NodeId::Dir(id)) => id,
            _ => panic!("missing directory"),
        });
    }

    #[test]
    fn test_name_collision() {
        let mut tree = VolumeTree::new();
        tree.add_file("/A.BIN", 1, buffer(1), None).unwrap();
        assert!(matches!(
            tree.add_file("/A.BIN", 1, buffer(1), None),
            Err(Error::NameCollision(_))
        ));
        assert!(matches!(tree.add_directory("/A.BIN"), Err(Error::NameCollision(_))));
        assert!(matches!(
            tree.add_file("/A.BIN/B.BIN", 1, buffer(1), None),
            Err(Error::NameCollision(_))
        ));
        // Case-sensitive
        tree.add_file("/a.bin", 1, buffer(1), None).unwrap();
    }

    #[test]
    fn test_placement_order() {
        let mut tree = VolumeTree::new();
        let boot = tree.add_file("/1ST_READ.BIN", 10, buffer(10), None).unwrap();
        let a = tree.add_file("/A.BIN", 10, buffer(10), None).unwrap();
        let b = tree.add_file("/B.BIN", 10, buffer(10), None).unwrap();
        assert_eq!(tree.placement_order(), vec![boot, a, b]);
        assert_eq!(tree.find_file_ignore_case(VolumeTree::ROOT, "1st_read.bin"), Some(boot));
        tree.set_last_file(boot);
        assert_eq!(tree.placement_order(), vec![a, b, boot]);
    }

    #[test]
    fn test_identifiers() {
        assert_eq!(encode_identifier("1st_read.bin", Some(1), Encoding::Primary), b"1ST_READ.BIN;1");
        assert_eq!(encode_identifier("my file", Some(1), Encoding::Primary), b"MY_FILE.;1");
        assert_eq!(encode_identifier("data", None, Encoding::Primary), b"DATA");
        assert_eq!(encode_identifier("ab", Some(1), Encoding::Joliet), &[
            0, b'a', 0, b'b', 0, b';', 0, b'1'
        ]);
        let long = "x".repeat(100);
        assert_eq!(encode_identifier(&long, None, Encoding::Joliet).len(), 128);
    }

    #[test]
    fn test_path_table_order() {
        let mut tree = VolumeTree::new();
        tree.add_directory("/ZZZ").unwrap();
        tree.add_directory("/AAA/SUB2").unwrap();
        tree.add_directory("/AAA/SUB1").unwrap();
        tree.add_directory("/ZZZ/INNER").unwrap();
        let table = tree.path_table(Encoding::Primary).unwrap();
        let rows = table.iter().map(|e| (e.identifier.clone(), e.parent)).collect::<Vec<_>>();
        assert_eq!(rows, vec![
            (vec![0], 1),
            (b"AAA".to_vec(), 1),
            (b"ZZZ".to_vec(), 1),
            (b"SUB1".to_vec(), 2),
            (b"SUB2".to_vec(), 2),
            (b"INNER".to_vec(), 3),
        ]);
    }

    #[test]
    fn test_from_host_dir() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub").join("b.txt"), b"hello").unwrap();
        fs::write(dir.path().join("a.bin"), [1u8; 10]).unwrap();
        let tree = VolumeTree::from_host_dir(dir.path()).unwrap();
        let Some(NodeId::File(id)) = tree.find("/sub/b.txt") else {
            panic!("missing file");
        };
        assert_eq!(tree.file(id).size, 5);
        assert!(matches!(tree.file(id).source, FileSource::Path(_)));
        assert_eq!(tree.placement_order().len(), 2);
    }
}
