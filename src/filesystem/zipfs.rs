/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::collections::BTreeMap;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use zip::ZipArchive;

use crate::errors::{Error, ErrorKind, Result};
use crate::filesystem::file::File;
use crate::filesystem::fs::FileSystem;
use crate::filesystem::readonly::{ReadOnlyEntry, ReadOnlyFile, ReadOnlyIndex};
use crate::filesystem::types::{
    FileInfo, FileMode, FileTimeInfo, FsType, OpenFlags, UsageStat,
};
use crate::fspath;

/// Read-only filesystem over a decoded zip archive.
///
/// The archive bytes are held in memory; entry streams decompress on open.
/// Closing the adapter invalidates every handle derived from it.
pub struct ZipFs {
    archive: Mutex<ZipArchive<io::Cursor<Vec<u8>>>>,
    index: ReadOnlyIndex,
    source: PathBuf,
    closed: Arc<AtomicBool>,
}

impl ZipFs {
    /// Wraps the archive at `path` of `fs`.
    pub fn new<F: FileSystem + ?Sized>(fs: &F, path: &Path) -> Result<Self> {
        let bytes = fs.read_file(path)?;
        Self::from_bytes(path, bytes)
    }

    pub fn from_bytes(source: &Path, bytes: Vec<u8>) -> Result<Self> {
        let mut archive = ZipArchive::new(io::Cursor::new(bytes))?;
        let mut index = ReadOnlyIndex::new();
        for position in 0..archive.len() {
            let entry = archive.by_index_raw(position)?;
            let name = entry.name().to_owned();
            let cleaned = fspath::clean(Path::new("/").join(&name));
            let mode = match entry.unix_mode() {
                Some(raw) if raw & 0o170000 != 0 => FileMode::from_raw(raw),
                Some(raw) if entry.is_dir() => FileMode::directory(raw),
                Some(raw) => FileMode::regular(raw),
                None if entry.is_dir() => FileMode::directory(0o755),
                None => FileMode::regular(0o644),
            };
            let mod_time = entry
                .last_modified()
                .and_then(|dt| time::OffsetDateTime::try_from(dt).ok())
                .map(SystemTime::from)
                .unwrap_or(SystemTime::UNIX_EPOCH);
            index.insert(ReadOnlyEntry {
                path: cleaned,
                position: Some(position),
                size: entry.size(),
                mode,
                mod_time,
                is_dir: entry.is_dir(),
            });
        }
        Ok(ZipFs {
            archive: Mutex::new(archive),
            index,
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
            return Err(Error::new(
                ErrorKind::Invalid,
                "zip filesystem is closed",
            ));
        }
        Ok(())
    }

    fn entry_bytes(&self, position: usize) -> Result<Vec<u8>> {
        let mut archive = self.archive.lock();
        let mut entry = archive.by_index(position)?;
        let mut content = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut content)?;
        Ok(content)
    }
}

impl FileSystem for ZipFs {
    fn fs_type(&self) -> FsType {
        FsType::Zip
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
        self.index.stat(&self.convert_file_path(path))
    }

    fn lstat(&self, path: &Path) -> Result<FileInfo> {
        self.stat(path)
    }

    fn stat_times(&self, path: &Path) -> Result<FileTimeInfo> {
        self.check_open()?;
        let info = self.stat(path)?;
        Ok(FileTimeInfo::mod_time_only(info.mod_time()))
    }

    fn open_file(&self, path: &Path, flags: OpenFlags, _perm: FileMode) -> Result<Box<dyn File>> {
        self.check_open()?;
        if flags.writable() || flags.intersects(OpenFlags::CREATE | OpenFlags::TRUNCATE) {
            return Err(Error::read_only("open for write"));
        }
        let native = self.convert_file_path(path);
        let entry = self.index.lookup(&native)?.clone();
        let content = match entry.position {
            Some(position) if !entry.is_dir => self.entry_bytes(position)?,
            _ => Vec::new(),
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
}
