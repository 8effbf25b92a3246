/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::collections::BTreeMap;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use crate::errors::{Error, ErrorKind, Result};
use crate::filesystem::file::{CloseCallback, File};
use crate::filesystem::types::{FileInfo, FileMode, FileTimeInfo, UsageStat};
use crate::fspath;

/// One node of a read-only archive index.
#[derive(Debug, Clone)]
pub(crate) struct ReadOnlyEntry {
    pub path: PathBuf,
    /// Archive-internal position for content lookup; `None` for implicit
    /// directories.
    pub position: Option<usize>,
    pub size: u64,
    pub mode: FileMode,
    pub mod_time: SystemTime,
    pub is_dir: bool,
}

/// Path index shared by the archive adapters. Paths are cleaned and rooted
/// at `/`; missing intermediate directories are materialised implicitly.
pub(crate) struct ReadOnlyIndex {
    entries: Arc<BTreeMap<PathBuf, ReadOnlyEntry>>,
}

impl ReadOnlyIndex {
    pub fn new() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(
            PathBuf::from("/"),
            ReadOnlyEntry {
                path: PathBuf::from("/"),
                position: None,
                size: 0,
                mode: FileMode::directory(0o755),
                mod_time: SystemTime::UNIX_EPOCH,
                is_dir: true,
            },
        );
        ReadOnlyIndex {
            entries: Arc::new(entries),
        }
    }

    pub fn insert(&mut self, entry: ReadOnlyEntry) {
        let entries = Arc::make_mut(&mut self.entries);
        for ancestor in fspath::parents(&entry.path) {
            entries.entry(ancestor.clone()).or_insert(ReadOnlyEntry {
                path: ancestor,
                position: None,
                size: 0,
                mode: FileMode::directory(0o755),
                mod_time: entry.mod_time,
                is_dir: true,
            });
        }
        entries.insert(entry.path.clone(), entry);
    }

    pub fn clone_entries(&self) -> Arc<BTreeMap<PathBuf, ReadOnlyEntry>> {
        self.entries.clone()
    }

    pub fn lookup(&self, path: &Path) -> Result<&ReadOnlyEntry> {
        self.entries.get(&fspath::clean(path)).ok_or_else(|| {
            Error::new(
                ErrorKind::NotFound,
                format!("no such entry in the archive: '{}'", path.display()),
            )
        })
    }

    pub fn stat(&self, path: &Path) -> Result<FileInfo> {
        Ok(entry_info(self.lookup(path)?))
    }

    pub fn read_dir(&self, path: &Path) -> Result<Vec<FileInfo>> {
        let parent = fspath::clean(path);
        let entry = self.lookup(&parent)?;
        if !entry.is_dir {
            return Err(Error::new(
                ErrorKind::Invalid,
                format!("'{}' is not a directory", path.display()),
            ));
        }
        Ok(self
            .entries
            .values()
            .filter(|candidate| {
                candidate.path != parent && candidate.path.parent() == Some(parent.as_path())
            })
            .map(entry_info)
            .collect())
    }

    pub fn usage(&self) -> UsageStat {
        let total: u64 = self.entries.values().map(|entry| entry.size).sum();
        let inodes = self.entries.len() as u64;
        UsageStat {
            total_bytes: total,
            used_bytes: total,
            free_bytes: 0,
            inodes_total: inodes,
            inodes_used: inodes,
            inodes_free: 0,
        }
    }

    /// Strips the archive's own path from caller paths and roots the result
    /// at `/`, so both `<archive>/inner/f` and `/inner/f` address the same
    /// entry.
    pub fn convert_path(&self, source: &Path, path: &Path) -> PathBuf {
        let cleaned = fspath::clean(path);
        match cleaned.strip_prefix(source) {
            Ok(stripped) => fspath::clean(Path::new("/").join(stripped)),
            Err(_) => fspath::clean(Path::new("/").join(cleaned.strip_prefix("/").unwrap_or(&cleaned))),
        }
    }
}

fn entry_info(entry: &ReadOnlyEntry) -> FileInfo {
    FileInfo::new(
        fspath::base(&entry.path),
        entry.size,
        entry.mode,
        entry.mod_time,
    )
}

/// Handle over a fully materialised read-only entry. Shares its adapter's
/// closed flag: closing the adapter invalidates the handle too.
pub(crate) struct ReadOnlyFile {
    path: PathBuf,
    entry: ReadOnlyEntry,
    content: io::Cursor<Vec<u8>>,
    entries: Arc<BTreeMap<PathBuf, ReadOnlyEntry>>,
    fs_closed: Arc<AtomicBool>,
    closed: bool,
    dir_cursor: usize,
    close_callback: Option<CloseCallback>,
}

impl ReadOnlyFile {
    pub fn new(
        path: PathBuf,
        entry: ReadOnlyEntry,
        content: Vec<u8>,
        entries: Arc<BTreeMap<PathBuf, ReadOnlyEntry>>,
        fs_closed: Arc<AtomicBool>,
    ) -> Self {
        ReadOnlyFile {
            path,
            entry,
            content: io::Cursor::new(content),
            entries,
            fs_closed,
            closed: false,
            dir_cursor: 0,
            close_callback: None,
        }
    }

    fn check_open(&self) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("file already closed: '{}'", self.path.display()),
            ));
        }
        if self.fs_closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "filesystem is closed",
            ));
        }
        Ok(())
    }
}

impl Read for ReadOnlyFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.check_open()?;
        self.content.read(buf)
    }
}

impl Write for ReadOnlyFile {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "read-only filesystem",
        ))
    }

    fn flush(&mut self) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "read-only filesystem",
        ))
    }
}

impl Seek for ReadOnlyFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.check_open()?;
        self.content.seek(pos)
    }
}

impl File for ReadOnlyFile {
    fn path(&self) -> &Path {
        &self.path
    }

    fn stat(&self) -> Result<FileInfo> {
        self.check_open()?;
        Ok(entry_info(&self.entry))
    }

    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.check_open()?;
        let content = self.content.get_ref();
        if offset >= content.len() as u64 {
            return Ok(0);
        }
        let available = &content[offset as usize..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        Ok(n)
    }

    fn write_at(&mut self, _buf: &[u8], _offset: u64) -> Result<usize> {
        Err(Error::read_only("write"))
    }

    fn truncate(&mut self, _size: u64) -> Result<()> {
        Err(Error::read_only("truncate"))
    }

    fn sync(&mut self) -> Result<()> {
        self.check_open()?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::closed_file(self.path.display()));
        }
        self.closed = true;
        if let Some(callback) = self.close_callback.take() {
            callback();
        }
        Ok(())
    }

    fn read_dir(&mut self, count: usize) -> Result<Vec<FileInfo>> {
        self.check_open()?;
        if !self.entry.is_dir {
            return Err(Error::new(
                ErrorKind::Invalid,
                format!("'{}' is not a directory", self.path.display()),
            ));
        }
        let children: Vec<FileInfo> = self
            .entries
            .values()
            .filter(|candidate| candidate.path.parent() == Some(self.entry.path.as_path()))
            .map(entry_info)
            .collect();
        let start = self.dir_cursor.min(children.len());
        let take = if count == 0 {
            children.len() - start
        } else {
            count.min(children.len() - start)
        };
        self.dir_cursor = start + take;
        Ok(children[start..start + take].to_vec())
    }

    fn set_close_callback(&mut self, callback: CloseCallback) {
        self.close_callback = Some(callback);
    }
}

impl Drop for ReadOnlyFile {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            if let Some(callback) = self.close_callback.take() {
                callback();
            }
        }
    }
}

/// Times for read-only backends: only the modification instant is known.
pub(crate) fn archive_times(info: &FileInfo) -> FileTimeInfo {
    FileTimeInfo::mod_time_only(info.mod_time())
}
