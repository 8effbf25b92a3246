/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::collections::HashMap;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;

use crate::errors::{Error, ErrorKind, Result};
use crate::filesystem::file::{CloseCallback, File, UNSET_FILE_HANDLE};
use crate::filesystem::fs::{Chowner, FileSystem, LinkReader, Linker, SymLinker};
use crate::filesystem::types::{
    FileInfo, FileMode, FileTimeInfo, FsType, OpenFlags, Owner, UsageStat,
};
use crate::fspath;

const MAX_SYMLINK_FOLLOW: usize = 40;
const MEM_TOTAL_BYTES: u64 = 4 << 30;
const MEM_TOTAL_INODES: u64 = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileIndex(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DirIndex(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SymlinkIndex(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MemNode {
    File(FileIndex),
    Dir(DirIndex),
    Symlink(SymlinkIndex),
}

struct MemFileNode {
    content: Vec<u8>,
    mode: FileMode,
    mod_time: SystemTime,
    access_time: SystemTime,
    owner: Option<Owner>,
}

struct MemDirNode {
    children: HashMap<String, MemNode>,
    mode: FileMode,
    mod_time: SystemTime,
    access_time: SystemTime,
    owner: Option<Owner>,
}

struct MemSymlinkNode {
    target: PathBuf,
    mod_time: SystemTime,
}

/// All nodes live in arenas and are addressed by index; removed nodes keep
/// their slot so open handles stay valid, the way unlinked-but-open files
/// behave on a disk filesystem.
struct MemTree {
    dirs: Vec<MemDirNode>,
    files: Vec<MemFileNode>,
    symlinks: Vec<MemSymlinkNode>,
}

impl MemTree {
    fn root() -> DirIndex {
        DirIndex(0)
    }

    fn dir(&self, index: DirIndex) -> &MemDirNode {
        &self.dirs[index.0]
    }

    fn dir_mut(&mut self, index: DirIndex) -> &mut MemDirNode {
        &mut self.dirs[index.0]
    }

    fn file(&self, index: FileIndex) -> &MemFileNode {
        &self.files[index.0]
    }

    fn file_mut(&mut self, index: FileIndex) -> &mut MemFileNode {
        &mut self.files[index.0]
    }

    fn symlink(&self, index: SymlinkIndex) -> &MemSymlinkNode {
        &self.symlinks[index.0]
    }

    /// Resolves a cleaned path to a node, following intermediate symlinks
    /// always and the final one only when `follow_last`.
    fn resolve(&self, path: &Path, follow_last: bool, depth: usize) -> Result<MemNode> {
        if depth > MAX_SYMLINK_FOLLOW {
            return Err(Error::new(
                ErrorKind::Invalid,
                format!("too many levels of symbolic links: '{}'", path.display()),
            ));
        }
        let cleaned = fspath::clean(path);
        let names: Vec<String> = normal_components(&cleaned);
        let mut current = MemNode::Dir(MemTree::root());
        let mut prefix = PathBuf::from("/");
        for (position, name) in names.iter().enumerate() {
            let dir_index = match current {
                MemNode::Dir(index) => index,
                _ => {
                    return Err(Error::new(
                        ErrorKind::NotFound,
                        format!("'{}' is not a directory", prefix.display()),
                    ))
                }
            };
            let child = *self.dir(dir_index).children.get(name).ok_or_else(|| {
                Error::new(
                    ErrorKind::NotFound,
                    format!("no such file or directory: '{}'", prefix.join(name).display()),
                )
            })?;
            let last = position == names.len() - 1;
            current = match child {
                MemNode::Symlink(link_index) if !last || follow_last => {
                    let target = self.symlink(link_index).target.clone();
                    let resolved_target = if target.is_absolute() {
                        target
                    } else {
                        prefix.join(target)
                    };
                    let mut rebuilt = resolved_target;
                    for remaining in &names[position + 1..] {
                        rebuilt.push(remaining);
                    }
                    return self.resolve(&rebuilt, follow_last, depth + 1);
                }
                node => node,
            };
            prefix.push(name);
        }
        Ok(current)
    }

    /// Directory that would hold `path`'s leaf, plus the leaf name.
    fn locate_parent(&self, path: &Path) -> Result<(DirIndex, String)> {
        let cleaned = fspath::clean(path);
        let name = fspath::base(&cleaned);
        if name == "/" {
            return Err(Error::new(ErrorKind::Invalid, "the root has no parent"));
        }
        let parent = fspath::dir(&cleaned);
        match self.resolve(&parent, true, 0)? {
            MemNode::Dir(index) => Ok((index, name)),
            _ => Err(Error::new(
                ErrorKind::NotFound,
                format!("'{}' is not a directory", parent.display()),
            )),
        }
    }

    fn info(&self, name: &str, node: MemNode) -> FileInfo {
        match node {
            MemNode::File(index) => {
                let file = self.file(index);
                let info = FileInfo::new(name, file.content.len() as u64, file.mode, file.mod_time);
                match file.owner {
                    Some(owner) => info.with_owner(owner),
                    None => info,
                }
            }
            MemNode::Dir(index) => {
                let dir = self.dir(index);
                let info = FileInfo::new(name, 0, dir.mode, dir.mod_time);
                match dir.owner {
                    Some(owner) => info.with_owner(owner),
                    None => info,
                }
            }
            MemNode::Symlink(index) => {
                let link = self.symlink(index);
                FileInfo::new(
                    name,
                    link.target.as_os_str().len() as u64,
                    FileMode::symlink(),
                    link.mod_time,
                )
            }
        }
    }
}

fn normal_components(path: &Path) -> Vec<String> {
    path.components()
        .filter_map(|component| match component {
            Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect()
}

/// In-memory filesystem.
///
/// Individual operations are internally locked, but compound sequences are
/// not transactional: concurrent writers to the same tree must be
/// serialised by the caller.
#[derive(Clone)]
pub struct MemFs {
    tree: Arc<RwLock<MemTree>>,
}

impl Default for MemFs {
    fn default() -> Self {
        MemFs::new()
    }
}

impl MemFs {
    pub fn new() -> Self {
        let now = SystemTime::now();
        MemFs {
            tree: Arc::new(RwLock::new(MemTree {
                dirs: vec![MemDirNode {
                    children: HashMap::new(),
                    mode: FileMode::directory(0o755),
                    mod_time: now,
                    access_time: now,
                    owner: None,
                }],
                files: Vec::new(),
                symlinks: Vec::new(),
            })),
        }
    }

    fn set_node_times(
        &self,
        path: &Path,
        access_time: SystemTime,
        mod_time: SystemTime,
    ) -> Result<()> {
        let mut tree = self.tree.write();
        match tree.resolve(path, true, 0)? {
            MemNode::File(index) => {
                let file = tree.file_mut(index);
                file.access_time = access_time;
                file.mod_time = mod_time;
            }
            MemNode::Dir(index) => {
                let dir = tree.dir_mut(index);
                dir.access_time = access_time;
                dir.mod_time = mod_time;
            }
            MemNode::Symlink(index) => {
                tree.symlinks[index.0].mod_time = mod_time;
            }
        }
        Ok(())
    }
}

impl FileSystem for MemFs {
    fn fs_type(&self) -> FsType {
        FsType::InMemory
    }

    fn temp_directory(&self) -> PathBuf {
        PathBuf::from("/tmp")
    }

    fn current_directory(&self) -> Result<PathBuf> {
        Ok(PathBuf::from("/"))
    }

    fn disk_usage(&self, _path: &Path) -> Result<UsageStat> {
        let tree = self.tree.read();
        let used: u64 = tree.files.iter().map(|file| file.content.len() as u64).sum();
        let inodes_used = (tree.dirs.len() + tree.files.len() + tree.symlinks.len()) as u64;
        Ok(UsageStat {
            total_bytes: MEM_TOTAL_BYTES,
            used_bytes: used,
            free_bytes: MEM_TOTAL_BYTES.saturating_sub(used),
            inodes_total: MEM_TOTAL_INODES,
            inodes_used,
            inodes_free: MEM_TOTAL_INODES.saturating_sub(inodes_used),
        })
    }

    fn stat(&self, path: &Path) -> Result<FileInfo> {
        let tree = self.tree.read();
        let node = tree.resolve(path, true, 0)?;
        Ok(tree.info(&fspath::base(path), node))
    }

    fn lstat(&self, path: &Path) -> Result<FileInfo> {
        let tree = self.tree.read();
        let node = tree.resolve(path, false, 0)?;
        Ok(tree.info(&fspath::base(path), node))
    }

    fn stat_times(&self, path: &Path) -> Result<FileTimeInfo> {
        let tree = self.tree.read();
        match tree.resolve(path, true, 0)? {
            MemNode::File(index) => {
                let file = tree.file(index);
                Ok(FileTimeInfo::new(
                    file.mod_time,
                    Some(file.access_time),
                    None,
                    None,
                ))
            }
            MemNode::Dir(index) => {
                let dir = tree.dir(index);
                Ok(FileTimeInfo::new(
                    dir.mod_time,
                    Some(dir.access_time),
                    None,
                    None,
                ))
            }
            MemNode::Symlink(index) => {
                Ok(FileTimeInfo::mod_time_only(tree.symlink(index).mod_time))
            }
        }
    }

    fn open_file(&self, path: &Path, flags: OpenFlags, perm: FileMode) -> Result<Box<dyn File>> {
        let cleaned = fspath::clean(path);
        let mut tree = self.tree.write();
        let existing = tree.resolve(&cleaned, true, 0);
        let node = match existing {
            Ok(node) => {
                if flags.contains(OpenFlags::CREATE | OpenFlags::EXCLUSIVE) {
                    return Err(Error::new(
                        ErrorKind::Exists,
                        format!("'{}' already exists", cleaned.display()),
                    ));
                }
                node
            }
            Err(err) if err.is(ErrorKind::NotFound) && flags.contains(OpenFlags::CREATE) => {
                let (parent, name) = tree.locate_parent(&cleaned)?;
                if tree.dir(parent).children.contains_key(&name) {
                    // the leaf resolved NotFound through a dangling symlink
                    return Err(Error::new(
                        ErrorKind::NotFound,
                        format!("dangling symbolic link: '{}'", cleaned.display()),
                    ));
                }
                let now = SystemTime::now();
                tree.files.push(MemFileNode {
                    content: Vec::new(),
                    mode: FileMode::regular(perm.permissions()),
                    mod_time: now,
                    access_time: now,
                    owner: None,
                });
                let index = FileIndex(tree.files.len() - 1);
                tree.dir_mut(parent)
                    .children
                    .insert(name, MemNode::File(index));
                MemNode::File(index)
            }
            Err(err) => return Err(err),
        };
        match node {
            MemNode::File(index) => {
                if flags.contains(OpenFlags::TRUNCATE) && flags.writable() {
                    tree.file_mut(index).content.clear();
                }
                Ok(Box::new(MemFile {
                    tree: self.tree.clone(),
                    node: MemHandleNode::File(index),
                    path: cleaned,
                    flags,
                    offset: 0,
                    dir_cursor: 0,
                    closed: false,
                    close_callback: None,
                }))
            }
            MemNode::Dir(index) => {
                if flags.writable() {
                    return Err(Error::new(
                        ErrorKind::Invalid,
                        format!("'{}' is a directory", cleaned.display()),
                    ));
                }
                Ok(Box::new(MemFile {
                    tree: self.tree.clone(),
                    node: MemHandleNode::Dir(index),
                    path: cleaned,
                    flags,
                    offset: 0,
                    dir_cursor: 0,
                    closed: false,
                    close_callback: None,
                }))
            }
            MemNode::Symlink(_) => unreachable!("resolve followed the final symlink"),
        }
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<FileInfo>> {
        let tree = self.tree.read();
        match tree.resolve(path, true, 0)? {
            MemNode::Dir(index) => {
                let mut names: Vec<&String> = tree.dir(index).children.keys().collect();
                names.sort();
                Ok(names
                    .into_iter()
                    .map(|name| {
                        let node = tree.dir(index).children[name];
                        tree.info(name, node)
                    })
                    .collect())
            }
            _ => Err(Error::new(
                ErrorKind::Invalid,
                format!("'{}' is not a directory", path.display()),
            )),
        }
    }

    fn create_dir(&self, path: &Path, perm: FileMode) -> Result<()> {
        let mut tree = self.tree.write();
        let (parent, name) = tree.locate_parent(path)?;
        if tree.dir(parent).children.contains_key(&name) {
            return Err(Error::new(
                ErrorKind::Exists,
                format!("'{}' already exists", path.display()),
            ));
        }
        let now = SystemTime::now();
        tree.dirs.push(MemDirNode {
            children: HashMap::new(),
            mode: FileMode::directory(perm.permissions()),
            mod_time: now,
            access_time: now,
            owner: None,
        });
        let index = DirIndex(tree.dirs.len() - 1);
        tree.dir_mut(parent).children.insert(name, MemNode::Dir(index));
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        let mut tree = self.tree.write();
        let (parent, name) = tree.locate_parent(path)?;
        let node = *tree.dir(parent).children.get(&name).ok_or_else(|| {
            Error::new(
                ErrorKind::NotFound,
                format!("no such file or directory: '{}'", path.display()),
            )
        })?;
        match node {
            MemNode::Dir(_) => Err(Error::new(
                ErrorKind::Invalid,
                format!("'{}' is a directory", path.display()),
            )),
            MemNode::File(_) => {
                tree.dir_mut(parent).children.remove(&name);
                Ok(())
            }
            MemNode::Symlink(_) => {
                tree.dir_mut(parent).children.remove(&name);
                Ok(())
            }
        }
    }

    fn remove_dir(&self, path: &Path) -> Result<()> {
        let mut tree = self.tree.write();
        let (parent, name) = tree.locate_parent(path)?;
        let node = *tree.dir(parent).children.get(&name).ok_or_else(|| {
            Error::new(
                ErrorKind::NotFound,
                format!("no such file or directory: '{}'", path.display()),
            )
        })?;
        match node {
            MemNode::Dir(index) => {
                if !tree.dir(index).children.is_empty() {
                    return Err(Error::new(
                        ErrorKind::Invalid,
                        format!("directory '{}' is not empty", path.display()),
                    ));
                }
                tree.dir_mut(parent).children.remove(&name);
                Ok(())
            }
            _ => Err(Error::new(
                ErrorKind::Invalid,
                format!("'{}' is not a directory", path.display()),
            )),
        }
    }

    fn rename(&self, old_path: &Path, new_path: &Path) -> Result<()> {
        let old_cleaned = fspath::clean(old_path);
        let new_cleaned = fspath::clean(new_path);
        if new_cleaned.starts_with(&old_cleaned) && new_cleaned != old_cleaned {
            return Err(Error::new(
                ErrorKind::Invalid,
                format!(
                    "cannot rename '{}' into its own subdirectory '{}'",
                    old_cleaned.display(),
                    new_cleaned.display()
                ),
            ));
        }
        let mut tree = self.tree.write();
        let (old_parent, old_name) = tree.locate_parent(&old_cleaned)?;
        let node = *tree
            .dir(old_parent)
            .children
            .get(&old_name)
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::NotFound,
                    format!("no such file or directory: '{}'", old_cleaned.display()),
                )
            })?;
        let (new_parent, new_name) = tree.locate_parent(&new_cleaned)?;
        if let Some(existing) = tree.dir(new_parent).children.get(&new_name).copied() {
            match existing {
                MemNode::Dir(index) if !tree.dir(index).children.is_empty() => {
                    return Err(Error::new(
                        ErrorKind::Invalid,
                        format!("directory '{}' is not empty", new_cleaned.display()),
                    ));
                }
                _ => {}
            }
        }
        tree.dir_mut(old_parent).children.remove(&old_name);
        tree.dir_mut(new_parent).children.insert(new_name, node);
        Ok(())
    }

    fn chmod(&self, path: &Path, perm: FileMode) -> Result<()> {
        let mut tree = self.tree.write();
        match tree.resolve(path, true, 0)? {
            MemNode::File(index) => {
                let mode = tree.file(index).mode.with_permissions(perm.permissions());
                tree.file_mut(index).mode = mode;
            }
            MemNode::Dir(index) => {
                let mode = tree.dir(index).mode.with_permissions(perm.permissions());
                tree.dir_mut(index).mode = mode;
            }
            MemNode::Symlink(_) => {}
        }
        Ok(())
    }

    fn chtimes(&self, path: &Path, access_time: SystemTime, mod_time: SystemTime) -> Result<()> {
        self.set_node_times(path, access_time, mod_time)
    }

    fn as_chowner(&self) -> Option<&dyn Chowner> {
        Some(self)
    }

    fn as_linker(&self) -> Option<&dyn Linker> {
        Some(self)
    }

    fn as_link_reader(&self) -> Option<&dyn LinkReader> {
        Some(self)
    }

    fn as_symlinker(&self) -> Option<&dyn SymLinker> {
        Some(self)
    }
}

impl Chowner for MemFs {
    fn chown(&self, path: &Path, uid: u32, gid: u32) -> Result<()> {
        let mut tree = self.tree.write();
        let owner = Some(Owner { uid, gid });
        match tree.resolve(path, true, 0)? {
            MemNode::File(index) => tree.file_mut(index).owner = owner,
            MemNode::Dir(index) => tree.dir_mut(index).owner = owner,
            MemNode::Symlink(_) => {}
        }
        Ok(())
    }
}

impl Linker for MemFs {
    fn link(&self, target: &Path, link_path: &Path) -> Result<()> {
        let mut tree = self.tree.write();
        let node = tree.resolve(target, true, 0)?;
        let index = match node {
            MemNode::File(index) => index,
            _ => {
                return Err(Error::new(
                    ErrorKind::Invalid,
                    format!("hard links need a regular file target: '{}'", target.display()),
                ))
            }
        };
        let (parent, name) = tree.locate_parent(link_path)?;
        if tree.dir(parent).children.contains_key(&name) {
            return Err(Error::new(
                ErrorKind::Exists,
                format!("'{}' already exists", link_path.display()),
            ));
        }
        tree.dir_mut(parent).children.insert(name, MemNode::File(index));
        Ok(())
    }
}

impl SymLinker for MemFs {
    fn symlink(&self, target: &Path, link_path: &Path) -> Result<()> {
        let mut tree = self.tree.write();
        let (parent, name) = tree.locate_parent(link_path)?;
        if tree.dir(parent).children.contains_key(&name) {
            return Err(Error::new(
                ErrorKind::Exists,
                format!("'{}' already exists", link_path.display()),
            ));
        }
        tree.symlinks.push(MemSymlinkNode {
            target: target.to_path_buf(),
            mod_time: SystemTime::now(),
        });
        let index = SymlinkIndex(tree.symlinks.len() - 1);
        tree.dir_mut(parent)
            .children
            .insert(name, MemNode::Symlink(index));
        Ok(())
    }
}

impl LinkReader for MemFs {
    fn readlink(&self, path: &Path) -> Result<PathBuf> {
        let tree = self.tree.read();
        match tree.resolve(path, false, 0)? {
            MemNode::Symlink(index) => Ok(tree.symlink(index).target.clone()),
            // hard links are indistinguishable from plain files here
            _ => Err(Error::new(
                ErrorKind::Invalid,
                format!("'{}' is not a symbolic link", path.display()),
            )),
        }
    }
}

enum MemHandleNode {
    File(FileIndex),
    Dir(DirIndex),
}

struct MemFile {
    tree: Arc<RwLock<MemTree>>,
    node: MemHandleNode,
    path: PathBuf,
    flags: OpenFlags,
    offset: u64,
    dir_cursor: usize,
    closed: bool,
    close_callback: Option<CloseCallback>,
}

impl MemFile {
    fn file_index(&self) -> io::Result<FileIndex> {
        match self.node {
            MemHandleNode::File(index) => Ok(index),
            MemHandleNode::Dir(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("'{}' is a directory", self.path.display()),
            )),
        }
    }

    fn check_open(&self) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("file already closed: '{}'", self.path.display()),
            ));
        }
        Ok(())
    }

    fn read_from(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.check_open()?;
        if !self.flags.readable() {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "file not opened for reading",
            ));
        }
        let index = self.file_index()?;
        let mut tree = self.tree.write();
        let file = tree.file_mut(index);
        file.access_time = SystemTime::now();
        let content = &file.content;
        if offset >= content.len() as u64 {
            return Ok(0);
        }
        let available = &content[offset as usize..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        Ok(n)
    }

    fn write_to(&self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        self.check_open()?;
        if !self.flags.writable() {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "file not opened for writing",
            ));
        }
        let index = self.file_index()?;
        let mut tree = self.tree.write();
        let file = tree.file_mut(index);
        let end = offset as usize + buf.len();
        if file.content.len() < end {
            file.content.resize(end, 0);
        }
        file.content[offset as usize..end].copy_from_slice(buf);
        file.mod_time = SystemTime::now();
        Ok(buf.len())
    }

    fn finish(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::closed_file(self.path.display()));
        }
        self.closed = true;
        if let Some(callback) = self.close_callback.take() {
            callback();
        }
        Ok(())
    }
}

impl Read for MemFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.read_from(self.offset, buf)?;
        self.offset += n as u64;
        Ok(n)
    }
}

impl Write for MemFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.flags.contains(OpenFlags::APPEND) {
            let index = self.file_index()?;
            let len = self.tree.read().file(index).content.len() as u64;
            self.offset = len;
        }
        let n = self.write_to(self.offset, buf)?;
        self.offset += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.check_open()
    }
}

impl Seek for MemFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.check_open()?;
        let len = match self.node {
            MemHandleNode::File(index) => self.tree.read().file(index).content.len() as i64,
            MemHandleNode::Dir(_) => 0,
        };
        let target = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::End(delta) => len + delta,
            SeekFrom::Current(delta) => self.offset as i64 + delta,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before the start of the file",
            ));
        }
        self.offset = target as u64;
        Ok(self.offset)
    }
}

impl File for MemFile {
    fn path(&self) -> &Path {
        &self.path
    }

    fn stat(&self) -> Result<FileInfo> {
        if self.closed {
            return Err(Error::closed_file(self.path.display()));
        }
        let tree = self.tree.read();
        let node = match self.node {
            MemHandleNode::File(index) => MemNode::File(index),
            MemHandleNode::Dir(index) => MemNode::Dir(index),
        };
        Ok(tree.info(&fspath::base(&self.path), node))
    }

    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        Ok(self.read_from(offset, buf)?)
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<usize> {
        Ok(self.write_to(offset, buf)?)
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        self.check_open().map_err(Error::from)?;
        let index = self.file_index()?;
        let mut tree = self.tree.write();
        let file = tree.file_mut(index);
        file.content.resize(size as usize, 0);
        file.mod_time = SystemTime::now();
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.check_open().map_err(Error::from)?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.finish()
    }

    fn handle(&self) -> u64 {
        UNSET_FILE_HANDLE
    }

    fn read_dir(&mut self, count: usize) -> Result<Vec<FileInfo>> {
        if self.closed {
            return Err(Error::closed_file(self.path.display()));
        }
        let index = match self.node {
            MemHandleNode::Dir(index) => index,
            MemHandleNode::File(_) => {
                return Err(Error::new(
                    ErrorKind::Invalid,
                    format!("'{}' is not a directory", self.path.display()),
                ))
            }
        };
        let tree = self.tree.read();
        let mut names: Vec<&String> = tree.dir(index).children.keys().collect();
        names.sort();
        let remaining = &names[self.dir_cursor.min(names.len())..];
        let take = if count == 0 { remaining.len() } else { count.min(remaining.len()) };
        let batch: Vec<FileInfo> = remaining[..take]
            .iter()
            .map(|name| tree.info(name, tree.dir(index).children[*name]))
            .collect();
        self.dir_cursor += take;
        Ok(batch)
    }

    fn set_close_callback(&mut self, callback: CloseCallback) {
        self.close_callback = Some(callback);
    }
}

impl Drop for MemFile {
    fn drop(&mut self) {
        let _ = self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::fs::FileSystem;

    #[test]
    fn test_write_and_read_back() {
        let fs = MemFs::new();
        fs.write_file(Path::new("/a.txt"), b"payload", FileMode::regular(0o644))
            .unwrap();
        assert_eq!(b"payload".to_vec(), fs.read_file(Path::new("/a.txt")).unwrap());
        assert_eq!(7, fs.file_size(Path::new("/a.txt")).unwrap());
    }

    #[test]
    fn test_mk_dir_and_nested_files() {
        let fs = MemFs::new();
        fs.mk_dir(Path::new("/a/b/c")).unwrap();
        assert!(fs.is_dir(Path::new("/a/b/c")).unwrap());
        fs.write_file(Path::new("/a/b/c/f.txt"), b"x", FileMode::regular(0o644))
            .unwrap();
        assert!(fs.exists(Path::new("/a/b/c/f.txt")));
    }

    #[test]
    fn test_create_dir_is_exclusive() {
        let fs = MemFs::new();
        fs.create_dir(Path::new("/d"), FileMode::directory(0o755)).unwrap();
        let err = fs
            .create_dir(Path::new("/d"), FileMode::directory(0o755))
            .unwrap_err();
        assert_eq!(ErrorKind::Exists, err.kind());
    }

    #[test]
    fn test_missing_path_not_found() {
        let fs = MemFs::new();
        let err = fs.stat(Path::new("/missing")).unwrap_err();
        assert_eq!(ErrorKind::NotFound, err.kind());
        assert!(!fs.exists(Path::new("/missing")));
    }

    #[test]
    fn test_stat_directory_reports_zero_size() {
        let fs = MemFs::new();
        fs.mk_dir(Path::new("/d")).unwrap();
        fs.write_file(Path::new("/d/f"), b"1234", FileMode::regular(0o644))
            .unwrap();
        assert_eq!(0, fs.stat(Path::new("/d")).unwrap().size());
    }

    #[test]
    fn test_read_dir_sorted() {
        let fs = MemFs::new();
        fs.mk_dir(Path::new("/d")).unwrap();
        for name in ["zeta", "alpha", "midway"] {
            fs.write_file(&Path::new("/d").join(name), b"", FileMode::regular(0o644))
                .unwrap();
        }
        let names: Vec<String> = fs
            .read_dir(Path::new("/d"))
            .unwrap()
            .into_iter()
            .map(|info| info.name().to_owned())
            .collect();
        assert_eq!(vec!["alpha", "midway", "zeta"], names);
    }

    #[test]
    fn test_double_close_fails_with_stable_kind() {
        let fs = MemFs::new();
        let mut file = fs.create_file(Path::new("/f")).unwrap();
        file.close().unwrap();
        let err = file.close().unwrap_err();
        assert_eq!(ErrorKind::Invalid, err.kind());
        assert!(err.to_string().contains("file already closed"));
    }

    #[test]
    fn test_close_callback_runs_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let counter = Arc::new(AtomicUsize::new(0));
        let fs = MemFs::new();
        let mut file = fs.create_file(Path::new("/f")).unwrap();
        let seen = counter.clone();
        file.set_close_callback(Box::new(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        file.close().unwrap();
        let _ = file.close();
        drop(file);
        assert_eq!(1, counter.load(Ordering::SeqCst));
    }

    #[test]
    fn test_append_writes_at_end() {
        let fs = MemFs::new();
        fs.write_file(Path::new("/f"), b"start", FileMode::regular(0o644))
            .unwrap();
        let mut file = fs
            .open_file(
                Path::new("/f"),
                OpenFlags::WRITE_ONLY | OpenFlags::APPEND,
                FileMode::regular(0o644),
            )
            .unwrap();
        file.write_all(b"+end").unwrap();
        file.close().unwrap();
        assert_eq!(b"start+end".to_vec(), fs.read_file(Path::new("/f")).unwrap());
    }

    #[test]
    fn test_read_write_at_offsets() {
        let fs = MemFs::new();
        fs.write_file(Path::new("/f"), b"abcdef", FileMode::regular(0o644))
            .unwrap();
        let mut file = fs
            .open_file(Path::new("/f"), OpenFlags::READ_WRITE, FileMode::regular(0o644))
            .unwrap();
        let mut buf = [0u8; 3];
        assert_eq!(3, file.read_at(&mut buf, 2).unwrap());
        assert_eq!(b"cde", &buf);
        file.write_at(b"XY", 1).unwrap();
        file.close().unwrap();
        assert_eq!(b"aXYdef".to_vec(), fs.read_file(Path::new("/f")).unwrap());
    }

    #[test]
    fn test_truncate() {
        let fs = MemFs::new();
        fs.write_file(Path::new("/f"), b"abcdef", FileMode::regular(0o644))
            .unwrap();
        let mut file = fs
            .open_file(Path::new("/f"), OpenFlags::READ_WRITE, FileMode::regular(0o644))
            .unwrap();
        file.truncate(2).unwrap();
        file.close().unwrap();
        assert_eq!(b"ab".to_vec(), fs.read_file(Path::new("/f")).unwrap());
    }

    #[test]
    fn test_remove_dir_refuses_non_empty() {
        let fs = MemFs::new();
        fs.mk_dir(Path::new("/d")).unwrap();
        fs.write_file(Path::new("/d/f"), b"", FileMode::regular(0o644))
            .unwrap();
        assert!(fs.remove_dir(Path::new("/d")).is_err());
        fs.remove_file(Path::new("/d/f")).unwrap();
        fs.remove_dir(Path::new("/d")).unwrap();
        assert!(!fs.exists(Path::new("/d")));
    }

    #[test]
    fn test_rename_into_own_subdirectory_fails() {
        let fs = MemFs::new();
        fs.mk_dir(Path::new("/d")).unwrap();
        let err = fs.rename(Path::new("/d"), Path::new("/d/sub")).unwrap_err();
        assert_eq!(ErrorKind::Invalid, err.kind());
    }

    #[test]
    fn test_symlink_resolution() {
        let fs = MemFs::new();
        fs.mk_dir(Path::new("/real")).unwrap();
        fs.write_file(Path::new("/real/f.txt"), b"via link", FileMode::regular(0o644))
            .unwrap();
        FileSystem::symlink(&fs, Path::new("/real"), Path::new("/alias")).unwrap();
        assert_eq!(
            b"via link".to_vec(),
            fs.read_file(Path::new("/alias/f.txt")).unwrap()
        );
        assert!(fs.is_link(Path::new("/alias")).unwrap());
        assert!(fs.stat(Path::new("/alias")).unwrap().is_dir());
        assert_eq!(PathBuf::from("/real"), FileSystem::readlink(&fs, Path::new("/alias")).unwrap());
    }

    #[test]
    fn test_chained_symlinks_eval_to_real_path() {
        let fs = MemFs::new();
        fs.mk_dir(Path::new("/realdir")).unwrap();
        fs.write_file(Path::new("/realdir/file"), b"deep", FileMode::regular(0o644))
            .unwrap();
        FileSystem::symlink(&fs, Path::new("/realdir/file"), Path::new("/first")).unwrap();
        FileSystem::symlink(&fs, Path::new("/first"), Path::new("/second")).unwrap();
        assert_eq!(
            PathBuf::from("/realdir/file"),
            fs.eval_symlinks(Path::new("/second")).unwrap()
        );
        assert_eq!(b"deep".to_vec(), fs.read_file(Path::new("/second")).unwrap());
    }

    #[test]
    fn test_symlink_loop_detected() {
        let fs = MemFs::new();
        FileSystem::symlink(&fs, Path::new("/b"), Path::new("/a")).unwrap();
        FileSystem::symlink(&fs, Path::new("/a"), Path::new("/b")).unwrap();
        let err = fs.read_file(Path::new("/a")).unwrap_err();
        assert_eq!(ErrorKind::Invalid, err.kind());
    }

    #[test]
    fn test_readlink_on_regular_file_fails() {
        let fs = MemFs::new();
        fs.write_file(Path::new("/f"), b"", FileMode::regular(0o644)).unwrap();
        let err = FileSystem::readlink(&fs, Path::new("/f")).unwrap_err();
        assert_eq!(ErrorKind::Invalid, err.kind());
    }

    #[test]
    fn test_hard_link_shares_content() {
        let fs = MemFs::new();
        fs.write_file(Path::new("/original"), b"shared", FileMode::regular(0o644))
            .unwrap();
        FileSystem::link(&fs, Path::new("/original"), Path::new("/linked")).unwrap();
        assert_eq!(b"shared".to_vec(), fs.read_file(Path::new("/linked")).unwrap());
        // readlink must fail on hard links
        assert!(FileSystem::readlink(&fs, Path::new("/linked")).is_err());
        fs.remove_file(Path::new("/original")).unwrap();
        assert_eq!(b"shared".to_vec(), fs.read_file(Path::new("/linked")).unwrap());
    }

    #[test]
    fn test_chtimes_is_honoured_exactly() {
        let fs = MemFs::new();
        fs.write_file(Path::new("/f"), b"", FileMode::regular(0o644)).unwrap();
        let when = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_600_000_000);
        fs.chtimes(Path::new("/f"), when, when).unwrap();
        let times = fs.stat_times(Path::new("/f")).unwrap();
        assert_eq!(when, times.mod_time());
        assert!(times.has_access_time());
        assert_eq!(when, times.access_time());
    }

    #[test]
    fn test_chown_records_owner() {
        let fs = MemFs::new();
        fs.write_file(Path::new("/f"), b"", FileMode::regular(0o644)).unwrap();
        FileSystem::chown(&fs, Path::new("/f"), 1000, 1000).unwrap();
        assert_eq!(
            Owner { uid: 1000, gid: 1000 },
            fs.fetch_file_owner(Path::new("/f")).unwrap()
        );
    }

    #[test]
    fn test_is_empty() {
        let fs = MemFs::new();
        fs.mk_dir(Path::new("/d")).unwrap();
        assert!(fs.is_empty(Path::new("/d")).unwrap());
        fs.write_file(Path::new("/d/f"), b"", FileMode::regular(0o644)).unwrap();
        assert!(!fs.is_empty(Path::new("/d")).unwrap());
        assert!(fs.is_empty(Path::new("/d/f")).unwrap());
    }

    #[test]
    fn test_temp_dir_and_file_are_fresh() {
        let fs = MemFs::new();
        let first = fs.temp_dir(Path::new(""), "test-").unwrap();
        let second = fs.temp_dir(Path::new(""), "test-").unwrap();
        assert_ne!(first, second);
        assert!(fs.is_dir(&first).unwrap());
        let path = fs.touch_temp_file(Path::new(""), "file-").unwrap();
        assert!(fs.is_file(&path).unwrap());
    }

    #[test]
    fn test_cancelled_context_blocks_io() {
        let fs = MemFs::new();
        let (ctx, cancel) = crate::context::Context::background().with_cancel();
        cancel.cancel();
        let err = fs
            .write_file_with_context(&ctx, Path::new("/f"), b"data", FileMode::regular(0o644))
            .unwrap_err();
        assert_eq!(ErrorKind::Cancelled, err.kind());
        assert!(!fs.exists(Path::new("/f")));
        fs.write_file(Path::new("/f"), b"data", FileMode::regular(0o644)).unwrap();
        let err = fs.read_file_with_context(&ctx, Path::new("/f")).unwrap_err();
        assert_eq!(ErrorKind::Cancelled, err.kind());
    }

    #[test]
    fn test_disk_usage_accounts_content() {
        let fs = MemFs::new();
        fs.write_file(Path::new("/f"), &[0u8; 1024], FileMode::regular(0o644))
            .unwrap();
        let usage = fs.disk_usage(Path::new("/")).unwrap();
        assert_eq!(1024, usage.used_bytes);
        assert!(usage.free_bytes < usage.total_bytes);
        assert!(usage.inodes_used >= 2);
    }
}
