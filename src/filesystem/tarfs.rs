/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tar::EntryType;

use crate::errors::{Error, ErrorKind, Result};
use crate::filesystem::file::File;
use crate::filesystem::fs::{FileSystem, LinkReader};
use crate::filesystem::readonly::{archive_times, ReadOnlyEntry, ReadOnlyFile, ReadOnlyIndex};
use crate::filesystem::types::{
    FileInfo, FileMode, FileTimeInfo, FsType, OpenFlags, UsageStat,
};
use crate::fspath;

/// Read-only filesystem over a tar archive.
///
/// The archive bytes are kept in memory; file content is served straight
/// from the entry data regions.
pub struct TarFs {
    bytes: Arc<Vec<u8>>,
    index: ReadOnlyIndex,
    /// entry path -> data region offset in `bytes`
    offsets: HashMap<PathBuf, u64>,
    link_targets: HashMap<PathBuf, PathBuf>,
    source: PathBuf,
    closed: Arc<AtomicBool>,
}

impl TarFs {
    pub fn new<F: FileSystem + ?Sized>(fs: &F, path: &Path) -> Result<Self> {
        let bytes = fs.read_file(path)?;
        Self::from_bytes(path, bytes)
    }

    pub fn from_bytes(source: &Path, bytes: Vec<u8>) -> Result<Self> {
        let mut index = ReadOnlyIndex::new();
        let mut offsets = HashMap::new();
        let mut link_targets = HashMap::new();
        {
            let mut archive = tar::Archive::new(io::Cursor::new(&bytes));
            for entry in archive.entries()? {
                let entry = entry?;
                let header = entry.header();
                let entry_type = header.entry_type();
                if !matches!(
                    entry_type,
                    EntryType::Regular | EntryType::Directory | EntryType::Symlink
                ) {
                    continue;
                }
                let raw_path = entry.path()?.into_owned();
                let cleaned = fspath::clean(Path::new("/").join(raw_path));
                let permissions = header.mode().unwrap_or(0o644);
                let mode = match entry_type {
                    EntryType::Directory => FileMode::directory(permissions),
                    EntryType::Symlink => FileMode::symlink(),
                    _ => FileMode::regular(permissions),
                };
                let mod_time = SystemTime::UNIX_EPOCH
                    + Duration::from_secs(header.mtime().unwrap_or(0));
                if entry_type == EntryType::Symlink {
                    if let Some(target) = entry.link_name()? {
                        link_targets.insert(cleaned.clone(), target.into_owned());
                    }
                }
                offsets.insert(cleaned.clone(), entry.raw_file_position());
                index.insert(ReadOnlyEntry {
                    path: cleaned,
                    position: None,
                    size: header.size().unwrap_or(0),
                    mode,
                    mod_time,
                    is_dir: entry_type == EntryType::Directory,
                });
            }
        }
        Ok(TarFs {
            bytes: Arc::new(bytes),
            index,
            offsets,
            link_targets,
            source: fspath::clean(source),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Invalidates the adapter and every derived handle.
    pub fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::new(ErrorKind::Invalid, "tar filesystem is closed"));
        }
        Ok(())
    }

    fn content_of(&self, path: &Path, size: u64) -> Vec<u8> {
        match self.offsets.get(path) {
            Some(&offset) => {
                let start = offset as usize;
                let end = (offset + size) as usize;
                self.bytes.get(start..end).map(<[u8]>::to_vec).unwrap_or_default()
            }
            None => Vec::new(),
        }
    }
}

impl FileSystem for TarFs {
    fn fs_type(&self) -> FsType {
        FsType::Tar
    }

    fn convert_file_path(&self, path: &Path) -> PathBuf {
        self.index.convert_path(&self.source, path)
    }

    fn temp_directory(&self) -> PathBuf {
        PathBuf::from("/tmp")
    }

    fn current_directory(&self) -> Result<PathBuf> {
        Ok(PathBuf::from("/"))
    }

    fn disk_usage(&self, _path: &Path) -> Result<UsageStat> {
        self.check_open()?;
        Ok(self.index.usage())
    }

    fn stat(&self, path: &Path) -> Result<FileInfo> {
        self.check_open()?;
        let native = self.convert_file_path(path);
        let info = self.index.stat(&native)?;
        if info.is_symlink() {
            if let Some(target) = self.link_targets.get(&native) {
                let resolved = if target.is_absolute() {
                    target.clone()
                } else {
                    fspath::join(fspath::dir(&native), target)
                };
                return self.index.stat(&resolved);
            }
        }
        Ok(info)
    }

    fn lstat(&self, path: &Path) -> Result<FileInfo> {
        self.check_open()?;
        self.index.stat(&self.convert_file_path(path))
    }

    fn stat_times(&self, path: &Path) -> Result<FileTimeInfo> {
        Ok(archive_times(&self.lstat(path)?))
    }

    fn open_file(&self, path: &Path, flags: OpenFlags, _perm: FileMode) -> Result<Box<dyn File>> {
        self.check_open()?;
        if flags.writable() || flags.intersects(OpenFlags::CREATE | OpenFlags::TRUNCATE) {
            return Err(Error::read_only("open for write"));
        }
        let native = self.convert_file_path(path);
        let entry = self.index.lookup(&native)?.clone();
        let content = if entry.is_dir {
            Vec::new()
        } else {
            self.content_of(&entry.path, entry.size)
        };
        Ok(Box::new(ReadOnlyFile::new(
            native,
            entry,
            content,
            self.index.clone_entries(),
            self.closed.clone(),
        )))
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<FileInfo>> {
        self.check_open()?;
        self.index.read_dir(&self.convert_file_path(path))
    }

    fn create_dir(&self, _path: &Path, _perm: FileMode) -> Result<()> {
        Err(Error::read_only("create directory"))
    }

    fn remove_file(&self, _path: &Path) -> Result<()> {
        Err(Error::read_only("remove file"))
    }

    fn remove_dir(&self, _path: &Path) -> Result<()> {
        Err(Error::read_only("remove directory"))
    }

    fn rename(&self, _old_path: &Path, _new_path: &Path) -> Result<()> {
        Err(Error::read_only("rename"))
    }

    fn chmod(&self, _path: &Path, _perm: FileMode) -> Result<()> {
        Err(Error::read_only("chmod"))
    }

    fn chtimes(&self, _path: &Path, _access_time: SystemTime, _mod_time: SystemTime) -> Result<()> {
        Err(Error::read_only("chtimes"))
    }

    fn as_link_reader(&self) -> Option<&dyn LinkReader> {
        Some(self)
    }
}

impl LinkReader for TarFs {
    fn readlink(&self, path: &Path) -> Result<PathBuf> {
        self.check_open()?;
        let native = self.convert_file_path(path);
        self.link_targets.get(&native).cloned().ok_or_else(|| {
            Error::new(
                ErrorKind::Invalid,
                format!("'{}' is not a symbolic link", path.display()),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tar() -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(EntryType::Directory);
        header.set_path("docs/").unwrap();
        header.set_size(0);
        header.set_mode(0o755);
        header.set_mtime(1_600_000_000);
        header.set_cksum();
        builder.append(&header, io::empty()).unwrap();

        let content = b"tar payload";
        let mut header = tar::Header::new_gnu();
        header.set_path("docs/notes.txt").unwrap();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(1_600_000_100);
        header.set_cksum();
        builder.append(&header, &content[..]).unwrap();
        builder.into_inner().unwrap()
    }

    #[test]
    fn test_reads_entries() {
        let fs = TarFs::from_bytes(Path::new("/sample.tar"), sample_tar()).unwrap();
        assert_eq!(FsType::Tar, fs.fs_type());
        assert_eq!(
            b"tar payload".to_vec(),
            fs.read_file(Path::new("/docs/notes.txt")).unwrap()
        );
        assert!(fs.is_dir(Path::new("/docs")).unwrap());
    }

    #[test]
    fn test_times_come_from_headers() {
        let fs = TarFs::from_bytes(Path::new("/sample.tar"), sample_tar()).unwrap();
        let times = fs.stat_times(Path::new("/docs/notes.txt")).unwrap();
        assert_eq!(
            SystemTime::UNIX_EPOCH + Duration::from_secs(1_600_000_100),
            times.mod_time()
        );
        assert!(!times.has_access_time());
    }

    #[test]
    fn test_mutations_are_forbidden() {
        let fs = TarFs::from_bytes(Path::new("/sample.tar"), sample_tar()).unwrap();
        assert_eq!(
            ErrorKind::Forbidden,
            fs.remove_file(Path::new("/docs/notes.txt")).unwrap_err().kind()
        );
    }

    #[test]
    fn test_close_invalidates() {
        let fs = TarFs::from_bytes(Path::new("/sample.tar"), sample_tar()).unwrap();
        fs.close().unwrap();
        assert!(fs.read_file(Path::new("/docs/notes.txt")).is_err());
    }
}
