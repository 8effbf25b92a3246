/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use include_dir::Dir;

use crate::errors::{Error, ErrorKind, Result};
use crate::filesystem::file::File;
use crate::filesystem::fs::FileSystem;
use crate::filesystem::readonly::{archive_times, ReadOnlyEntry, ReadOnlyFile, ReadOnlyIndex};
use crate::filesystem::types::{
    FileInfo, FileMode, FileTimeInfo, FsType, OpenFlags, UsageStat,
};
use crate::fspath;

/// Read-only filesystem over assets embedded at build time with
/// `include_dir!`.
pub struct EmbedFs {
    assets: &'static Dir<'static>,
    index: ReadOnlyIndex,
    closed: Arc<AtomicBool>,
}

impl EmbedFs {
    pub fn new(assets: &'static Dir<'static>) -> Self {
        let mut index = ReadOnlyIndex::new();
        index_dir(&mut index, assets);
        EmbedFs {
            assets,
            index,
            closed: Arc::new(AtomicBool::new(false)),
        }
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
                "embedded filesystem is closed",
            ));
        }
        Ok(())
    }

    fn contents_of(&self, native: &Path) -> Vec<u8> {
        let relative = native.strip_prefix("/").unwrap_or(native);
        self.assets
            .get_file(relative)
            .map(|file| file.contents().to_vec())
            .unwrap_or_default()
    }
}

fn index_dir(index: &mut ReadOnlyIndex, dir: &Dir<'_>) {
    for subdir in dir.dirs() {
        index.insert(ReadOnlyEntry {
            path: fspath::clean(Path::new("/").join(subdir.path())),
            position: None,
            size: 0,
            mode: FileMode::directory(0o555),
            mod_time: SystemTime::UNIX_EPOCH,
            is_dir: true,
        });
        index_dir(index, subdir);
    }
    for file in dir.files() {
        index.insert(ReadOnlyEntry {
            path: fspath::clean(Path::new("/").join(file.path())),
            position: None,
            size: file.contents().len() as u64,
            mode: FileMode::regular(0o444),
            mod_time: SystemTime::UNIX_EPOCH,
            is_dir: false,
        });
    }
}

impl FileSystem for EmbedFs {
    fn fs_type(&self) -> FsType {
        FsType::Embed
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
        self.index.stat(&fspath::clean(Path::new("/").join(path)))
    }

    fn lstat(&self, path: &Path) -> Result<FileInfo> {
        self.stat(path)
    }

    fn stat_times(&self, path: &Path) -> Result<FileTimeInfo> {
        Ok(archive_times(&self.stat(path)?))
    }

    fn open_file(&self, path: &Path, flags: OpenFlags, _perm: FileMode) -> Result<Box<dyn File>> {
        self.check_open()?;
        if flags.writable() || flags.intersects(OpenFlags::CREATE | OpenFlags::TRUNCATE) {
            return Err(Error::read_only("open for write"));
        }
        let native = fspath::clean(Path::new("/").join(path));
        let entry = self.index.lookup(&native)?.clone();
        let content = if entry.is_dir {
            Vec::new()
        } else {
            self.contents_of(&native)
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
        self.index.read_dir(&fspath::clean(Path::new("/").join(path)))
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
