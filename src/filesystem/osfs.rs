/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, SystemTime};

use filetime::FileTime;
use log::debug;

use crate::context::Context;
use crate::errors::{Error, ErrorKind, Result};
use crate::filesystem::file::{CloseCallback, File, UNSET_FILE_HANDLE};
use crate::filesystem::fs::{
    Chowner, FileSystem, ForceRemover, LinkReader, Linker, SymLinker,
};
use crate::filesystem::types::{
    FileInfo, FileMode, FileTimeInfo, FsType, OpenFlags, Owner, UsageStat,
};
use crate::fspath;

/// Disk-backed filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsFs;

static STANDARD: OnceLock<OsFs> = OnceLock::new();

/// Process-wide convenience instance. Tests must not rely on it carrying
/// state across cases.
pub fn standard() -> &'static OsFs {
    STANDARD.get_or_init(|| OsFs)
}

impl OsFs {
    pub fn new() -> Self {
        OsFs
    }
}

fn info_from_metadata(name: &str, metadata: &fs::Metadata) -> FileInfo {
    let mode = raw_mode(metadata);
    let mod_time = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
    let info = FileInfo::new(name, metadata.len(), mode, mod_time);
    match owner_of(metadata) {
        Some(owner) => info.with_owner(owner),
        None => info,
    }
}

#[cfg(unix)]
fn raw_mode(metadata: &fs::Metadata) -> FileMode {
    use std::os::unix::fs::MetadataExt;
    FileMode::from_raw(metadata.mode())
}

#[cfg(not(unix))]
fn raw_mode(metadata: &fs::Metadata) -> FileMode {
    if metadata.is_dir() {
        FileMode::directory(0o755)
    } else if metadata.file_type().is_symlink() {
        FileMode::symlink()
    } else {
        FileMode::regular(0o644)
    }
}

#[cfg(unix)]
fn owner_of(metadata: &fs::Metadata) -> Option<Owner> {
    use std::os::unix::fs::MetadataExt;
    Some(Owner {
        uid: metadata.uid(),
        gid: metadata.gid(),
    })
}

#[cfg(not(unix))]
fn owner_of(_metadata: &fs::Metadata) -> Option<Owner> {
    None
}

#[cfg(unix)]
fn times_from_metadata(metadata: &fs::Metadata) -> FileTimeInfo {
    use std::os::unix::fs::MetadataExt;
    let at_unix = |secs: i64, nanos: i64| {
        if secs >= 0 {
            SystemTime::UNIX_EPOCH + Duration::new(secs as u64, nanos as u32)
        } else {
            SystemTime::UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
        }
    };
    FileTimeInfo::new(
        metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        Some(at_unix(metadata.atime(), metadata.atime_nsec())),
        Some(at_unix(metadata.ctime(), metadata.ctime_nsec())),
        metadata.created().ok(),
    )
}

#[cfg(not(unix))]
fn times_from_metadata(metadata: &fs::Metadata) -> FileTimeInfo {
    FileTimeInfo::new(
        metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        metadata.accessed().ok(),
        None,
        metadata.created().ok(),
    )
}

impl FileSystem for OsFs {
    fn fs_type(&self) -> FsType {
        FsType::Standard
    }

    fn path_separator(&self) -> char {
        std::path::MAIN_SEPARATOR
    }

    fn temp_directory(&self) -> PathBuf {
        std::env::temp_dir()
    }

    fn current_directory(&self) -> Result<PathBuf> {
        Ok(std::env::current_dir()?)
    }

    #[cfg(unix)]
    fn disk_usage(&self, path: &Path) -> Result<UsageStat> {
        let stat = nix::sys::statvfs::statvfs(path)
            .map_err(|errno| Error::from(io::Error::from_raw_os_error(errno as i32)))?;
        let fragment = stat.fragment_size() as u64;
        let total = stat.blocks() as u64 * fragment;
        let free = stat.blocks_available() as u64 * fragment;
        Ok(UsageStat {
            total_bytes: total,
            free_bytes: free,
            used_bytes: total.saturating_sub(stat.blocks_free() as u64 * fragment),
            inodes_total: stat.files() as u64,
            inodes_free: stat.files_available() as u64,
            inodes_used: (stat.files() as u64).saturating_sub(stat.files_free() as u64),
        })
    }

    #[cfg(not(unix))]
    fn disk_usage(&self, _path: &Path) -> Result<UsageStat> {
        Err(Error::not_implemented("disk usage"))
    }

    fn stat(&self, path: &Path) -> Result<FileInfo> {
        let metadata = fs::metadata(path)?;
        Ok(info_from_metadata(&fspath::base(path), &metadata))
    }

    fn lstat(&self, path: &Path) -> Result<FileInfo> {
        let metadata = fs::symlink_metadata(path)?;
        Ok(info_from_metadata(&fspath::base(path), &metadata))
    }

    fn stat_times(&self, path: &Path) -> Result<FileTimeInfo> {
        let metadata = fs::metadata(path)?;
        Ok(times_from_metadata(&metadata))
    }

    fn open_file(&self, path: &Path, flags: OpenFlags, perm: FileMode) -> Result<Box<dyn File>> {
        let mut options = fs::OpenOptions::new();
        options
            .read(flags.readable())
            .write(flags.intersects(OpenFlags::WRITE_ONLY | OpenFlags::READ_WRITE))
            .append(flags.contains(OpenFlags::APPEND))
            .create(flags.contains(OpenFlags::CREATE) && !flags.contains(OpenFlags::EXCLUSIVE))
            .create_new(flags.contains(OpenFlags::CREATE | OpenFlags::EXCLUSIVE))
            .truncate(flags.contains(OpenFlags::TRUNCATE));
        #[cfg(unix)]
        if flags.contains(OpenFlags::CREATE) {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(perm.permissions());
        }
        #[cfg(not(unix))]
        let _ = perm;
        let file = options.open(path)?;
        Ok(Box::new(OsFile {
            file: Some(file),
            path: path.to_path_buf(),
            dir_cursor: 0,
            close_callback: None,
        }))
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<FileInfo>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            entries.push(info_from_metadata(
                &entry.file_name().to_string_lossy(),
                &metadata,
            ));
        }
        entries.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(entries)
    }

    fn create_dir(&self, path: &Path, perm: FileMode) -> Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            fs::DirBuilder::new().mode(perm.permissions()).create(path)?;
        }
        #[cfg(not(unix))]
        {
            let _ = perm;
            fs::create_dir(path)?;
        }
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        fs::remove_file(path)?;
        Ok(())
    }

    fn remove_dir(&self, path: &Path) -> Result<()> {
        fs::remove_dir(path)?;
        Ok(())
    }

    fn rename(&self, old_path: &Path, new_path: &Path) -> Result<()> {
        fs::rename(old_path, new_path)?;
        Ok(())
    }

    fn chmod(&self, path: &Path, perm: FileMode) -> Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(perm.permissions()))?;
        }
        #[cfg(not(unix))]
        {
            let mut permissions = fs::metadata(path)?.permissions();
            permissions.set_readonly(perm.permissions() & 0o200 == 0);
            fs::set_permissions(path, permissions)?;
        }
        Ok(())
    }

    fn chtimes(&self, path: &Path, access_time: SystemTime, mod_time: SystemTime) -> Result<()> {
        filetime::set_file_times(
            path,
            FileTime::from_system_time(access_time),
            FileTime::from_system_time(mod_time),
        )?;
        Ok(())
    }

    #[cfg(unix)]
    fn as_chowner(&self) -> Option<&dyn Chowner> {
        Some(self)
    }

    fn as_linker(&self) -> Option<&dyn Linker> {
        Some(self)
    }

    fn as_link_reader(&self) -> Option<&dyn LinkReader> {
        Some(self)
    }

    #[cfg(unix)]
    fn as_symlinker(&self) -> Option<&dyn SymLinker> {
        Some(self)
    }

    fn as_force_remover(&self) -> Option<&dyn ForceRemover> {
        Some(self)
    }
}

#[cfg(unix)]
impl Chowner for OsFs {
    fn chown(&self, path: &Path, uid: u32, gid: u32) -> Result<()> {
        nix::unistd::chown(
            path,
            Some(nix::unistd::Uid::from_raw(uid)),
            Some(nix::unistd::Gid::from_raw(gid)),
        )
        .map_err(|errno| Error::from(io::Error::from_raw_os_error(errno as i32)))
    }
}

impl Linker for OsFs {
    fn link(&self, target: &Path, link_path: &Path) -> Result<()> {
        fs::hard_link(target, link_path)?;
        Ok(())
    }
}

impl LinkReader for OsFs {
    fn readlink(&self, path: &Path) -> Result<PathBuf> {
        let metadata = fs::symlink_metadata(path)?;
        if !metadata.file_type().is_symlink() {
            return Err(Error::new(
                ErrorKind::Invalid,
                format!("'{}' is not a symbolic link", path.display()),
            ));
        }
        Ok(fs::read_link(path)?)
    }
}

#[cfg(unix)]
impl SymLinker for OsFs {
    fn symlink(&self, target: &Path, link_path: &Path) -> Result<()> {
        std::os::unix::fs::symlink(target, link_path)?;
        Ok(())
    }
}

impl ForceRemover for OsFs {
    /// Best-effort permission escalation before removal: owner rwx on every
    /// node of the tree, then a plain recursive removal.
    fn force_remove(&self, ctx: &Context, path: &Path) -> Result<()> {
        if self.exists(path) {
            let tree = crate::walk::list_dir_tree(ctx, self, path).unwrap_or_default();
            for entry in tree.iter().chain(std::iter::once(&path.to_path_buf())) {
                if let Err(err) = self.chmod(entry, FileMode::regular(0o700)) {
                    debug!("could not escalate permissions on '{}': {}", entry.display(), err);
                }
            }
        }
        crate::transfer::rm(ctx, self, path)
    }
}

struct OsFile {
    file: Option<fs::File>,
    path: PathBuf,
    dir_cursor: usize,
    close_callback: Option<CloseCallback>,
}

impl OsFile {
    fn inner(&self) -> io::Result<&fs::File> {
        self.file.as_ref().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("file already closed: '{}'", self.path.display()),
            )
        })
    }

    fn inner_mut(&mut self) -> io::Result<&mut fs::File> {
        self.file.as_mut().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("file already closed: '{}'", self.path.display()),
            )
        })
    }
}

impl Read for OsFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner_mut()?.read(buf)
    }
}

impl Write for OsFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner_mut()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner_mut()?.flush()
    }
}

impl Seek for OsFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner_mut()?.seek(pos)
    }
}

impl File for OsFile {
    fn path(&self) -> &Path {
        &self.path
    }

    fn stat(&self) -> Result<FileInfo> {
        let metadata = self.inner()?.metadata()?;
        Ok(info_from_metadata(&fspath::base(&self.path), &metadata))
    }

    #[cfg(unix)]
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        use std::os::unix::fs::FileExt;
        Ok(self.inner()?.read_at(buf, offset)?)
    }

    #[cfg(not(unix))]
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let file = self.inner_mut()?;
        let previous = file.stream_position()?;
        file.seek(SeekFrom::Start(offset))?;
        let n = file.read(buf)?;
        file.seek(SeekFrom::Start(previous))?;
        Ok(n)
    }

    #[cfg(unix)]
    fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<usize> {
        use std::os::unix::fs::FileExt;
        Ok(self.inner()?.write_at(buf, offset)?)
    }

    #[cfg(not(unix))]
    fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<usize> {
        let file = self.inner_mut()?;
        let previous = file.stream_position()?;
        file.seek(SeekFrom::Start(offset))?;
        let n = file.write(buf)?;
        file.seek(SeekFrom::Start(previous))?;
        Ok(n)
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        self.inner()?.set_len(size)?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.inner()?.sync_all()?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        match self.file.take() {
            Some(file) => {
                drop(file);
                if let Some(callback) = self.close_callback.take() {
                    callback();
                }
                Ok(())
            }
            None => Err(Error::closed_file(self.path.display())),
        }
    }

    #[cfg(unix)]
    fn handle(&self) -> u64 {
        use std::os::unix::io::AsRawFd;
        match &self.file {
            Some(file) => file.as_raw_fd() as u64,
            None => UNSET_FILE_HANDLE,
        }
    }

    #[cfg(not(unix))]
    fn handle(&self) -> u64 {
        UNSET_FILE_HANDLE
    }

    fn read_dir(&mut self, count: usize) -> Result<Vec<FileInfo>> {
        self.inner()?;
        let mut entries = OsFs.read_dir(&self.path)?;
        let start = self.dir_cursor.min(entries.len());
        let take = if count == 0 {
            entries.len() - start
        } else {
            count.min(entries.len() - start)
        };
        let batch: Vec<FileInfo> = entries.drain(start..start + take).collect();
        self.dir_cursor = start + take;
        Ok(batch)
    }

    fn set_close_callback(&mut self, callback: CloseCallback) {
        self.close_callback = Some(callback);
    }
}

impl Drop for OsFile {
    fn drop(&mut self) {
        if self.file.is_some() {
            let _ = self.close();
        }
    }
}
