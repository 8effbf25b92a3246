/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::context::Context;
use crate::encoding::CharsetDetector;
use crate::errors::{Error, ErrorKind, Result};
use crate::filesystem::file::File;
use crate::filesystem::types::{FileInfo, FileMode, FileTimeInfo, FsType, OpenFlags, Owner, UsageStat};
use crate::hash::FileHasher;
use crate::limits::Limits;
use crate::lock::RemoteLockFile;
use crate::walk::WalkCallback;
use crate::{fspath, hash, transfer, walk, ziputil};

const TEMP_NAME_LEN: usize = 10;
const SYMLINK_FOLLOW_MAX: usize = 40;

/// Optional capability: changing node ownership.
pub trait Chowner {
    fn chown(&self, path: &Path, uid: u32, gid: u32) -> Result<()>;
}

/// Optional capability: hard links.
pub trait Linker {
    fn link(&self, target: &Path, link_path: &Path) -> Result<()>;
}

/// Optional capability: reading symbolic link targets.
pub trait LinkReader {
    fn readlink(&self, path: &Path) -> Result<PathBuf>;
}

/// Optional capability: creating symbolic links.
pub trait SymLinker {
    fn symlink(&self, target: &Path, link_path: &Path) -> Result<()>;
}

/// Optional capability: privileged removal of otherwise protected trees.
pub trait ForceRemover {
    fn force_remove(&self, ctx: &Context, path: &Path) -> Result<()>;
}

/// The filesystem contract.
///
/// Backends implement the required operations; everything else is provided
/// on top of them. Optional capabilities are probed through the `as_*`
/// methods, operations relying on an absent capability fail with
/// `NotImplemented`. All provided `*_with_context` forms are the primary
/// implementations; the no-context forms pass a background context.
pub trait FileSystem: Send + Sync {
    fn fs_type(&self) -> FsType;

    fn path_separator(&self) -> char {
        '/'
    }

    /// Translates a caller path into the backend's native form. Identity for
    /// disk-like backends; archive adapters strip their base prefix.
    fn convert_file_path(&self, path: &Path) -> PathBuf {
        path.to_path_buf()
    }

    fn temp_directory(&self) -> PathBuf;

    fn current_directory(&self) -> Result<PathBuf>;

    fn disk_usage(&self, path: &Path) -> Result<UsageStat>;

    /// Follows symlinks.
    fn stat(&self, path: &Path) -> Result<FileInfo>;

    /// Does not follow symlinks: stats the link itself.
    fn lstat(&self, path: &Path) -> Result<FileInfo>;

    fn stat_times(&self, path: &Path) -> Result<FileTimeInfo>;

    fn open_file(&self, path: &Path, flags: OpenFlags, perm: FileMode) -> Result<Box<dyn File>>;

    /// Entries of a directory, name-sorted.
    fn read_dir(&self, path: &Path) -> Result<Vec<FileInfo>>;

    /// Creates one directory level. Atomic: fails with `Exists` when the
    /// path is already present. This is the primitive the lock builds on.
    fn create_dir(&self, path: &Path, perm: FileMode) -> Result<()>;

    fn remove_file(&self, path: &Path) -> Result<()>;

    /// Removes one empty directory.
    fn remove_dir(&self, path: &Path) -> Result<()>;

    fn rename(&self, old_path: &Path, new_path: &Path) -> Result<()>;

    fn chmod(&self, path: &Path, perm: FileMode) -> Result<()>;

    fn chtimes(&self, path: &Path, access_time: SystemTime, mod_time: SystemTime) -> Result<()>;

    // -- optional capabilities ------------------------------------------------

    fn as_chowner(&self) -> Option<&dyn Chowner> {
        None
    }

    fn as_linker(&self) -> Option<&dyn Linker> {
        None
    }

    fn as_link_reader(&self) -> Option<&dyn LinkReader> {
        None
    }

    fn as_symlinker(&self) -> Option<&dyn SymLinker> {
        None
    }

    fn as_force_remover(&self) -> Option<&dyn ForceRemover> {
        None
    }

    // -- open & create --------------------------------------------------------

    fn generic_open(&self, path: &Path) -> Result<Box<dyn File>> {
        self.open_file(path, OpenFlags::read_only(), FileMode::regular(0))
    }

    fn create_file(&self, path: &Path) -> Result<Box<dyn File>> {
        self.open_file(
            path,
            OpenFlags::READ_WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
            FileMode::regular(0o644),
        )
    }

    // -- existence & metadata -------------------------------------------------

    /// Existence probe. Directories are double-checked by reading one entry,
    /// the only reliable probe on backends with stat false-positives.
    fn exists(&self, path: &Path) -> bool {
        match self.lstat(path) {
            Err(_) => false,
            Ok(info) if info.is_dir() => self.read_dir(path).is_ok(),
            Ok(_) => true,
        }
    }

    fn is_file(&self, path: &Path) -> Result<bool> {
        match self.stat(path) {
            Ok(info) => Ok(info.mode().is_regular()),
            Err(err) if err.is(ErrorKind::NotFound) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn is_dir(&self, path: &Path) -> Result<bool> {
        match self.stat(path) {
            Ok(info) => Ok(info.is_dir()),
            Err(err) if err.is(ErrorKind::NotFound) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn is_link(&self, path: &Path) -> Result<bool> {
        match self.lstat(path) {
            Ok(info) => Ok(info.is_symlink()),
            Err(err) if err.is(ErrorKind::NotFound) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// True for zero-length files and directories without entries.
    fn is_empty(&self, path: &Path) -> Result<bool> {
        let info = self.stat(path)?;
        if info.is_dir() {
            Ok(self.read_dir(path)?.is_empty())
        } else {
            Ok(info.size() == 0)
        }
    }

    fn file_size(&self, path: &Path) -> Result<u64> {
        Ok(self.stat(path)?.size())
    }

    // -- whole-file I/O -------------------------------------------------------

    fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        self.read_file_with_context(&Context::background(), path)
    }

    fn read_file_with_context(&self, ctx: &Context, path: &Path) -> Result<Vec<u8>> {
        ctx.check()?;
        let mut file = self.generic_open(path)?;
        let mut content = Vec::new();
        let read_result = read_all_with_context(ctx, file.as_mut(), &mut content);
        file.close()?;
        read_result?;
        Ok(content)
    }

    /// Like `read_file` but fails with `TooLarge` as soon as the content
    /// exceeds `limits.max_file_size`.
    fn read_file_with_limits(&self, ctx: &Context, path: &Path, limits: &Limits) -> Result<Vec<u8>> {
        ctx.check()?;
        if limits.file_size_exceeded(self.file_size(path)?) {
            return Err(Error::new(
                ErrorKind::TooLarge,
                format!(
                    "file '{}' exceeds the maximum size of {} B",
                    path.display(),
                    limits.max_file_size
                ),
            ));
        }
        let content = self.read_file_with_context(ctx, path)?;
        if limits.file_size_exceeded(content.len() as u64) {
            return Err(Error::new(
                ErrorKind::TooLarge,
                format!(
                    "file '{}' exceeds the maximum size of {} B",
                    path.display(),
                    limits.max_file_size
                ),
            ));
        }
        Ok(content)
    }

    fn write_file(&self, path: &Path, data: &[u8], perm: FileMode) -> Result<()> {
        let mut reader = io::Cursor::new(data);
        self.write_to_file(&Context::background(), path, &mut reader, perm)
    }

    fn write_file_with_context(
        &self,
        ctx: &Context,
        path: &Path,
        data: &[u8],
        perm: FileMode,
    ) -> Result<()> {
        let mut reader = io::Cursor::new(data);
        self.write_to_file(ctx, path, &mut reader, perm)
    }

    /// Write-create-truncate from a stream, chunked and cancellable.
    fn write_to_file(
        &self,
        ctx: &Context,
        path: &Path,
        reader: &mut dyn Read,
        perm: FileMode,
    ) -> Result<()> {
        ctx.check()?;
        let mut file = self.open_file(
            path,
            OpenFlags::WRITE_ONLY | OpenFlags::CREATE | OpenFlags::TRUNCATE,
            perm,
        )?;
        let copy_result = transfer::copy_stream(ctx, reader, file.as_mut());
        let close_result = file.close();
        copy_result?;
        close_result
    }

    // -- directory management -------------------------------------------------

    /// `mkdir -p`. A concurrent creator winning the race between the
    /// existence check and the creation counts as success.
    fn mk_dir(&self, path: &Path) -> Result<()> {
        self.mk_dir_all(path, FileMode::directory(0o755))
    }

    fn mk_dir_all(&self, path: &Path, perm: FileMode) -> Result<()> {
        if path.as_os_str().is_empty() {
            return Err(Error::new(ErrorKind::Empty, "cannot create an empty path"));
        }
        if self.is_dir(path)? {
            return Ok(());
        }
        let mut missing = vec![fspath::clean(path)];
        for parent in fspath::parents(path) {
            if self.is_dir(&parent)? {
                break;
            }
            missing.push(parent);
        }
        for level in missing.into_iter().rev() {
            match self.create_dir(&level, perm) {
                Ok(()) => {}
                // lost the race to a concurrent creator
                Err(err) if err.is(ErrorKind::Exists) && self.is_dir(&level)? => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Creates a fresh directory under `parent` (the backend temp directory
    /// when `parent` is empty) with a randomised name.
    fn temp_dir(&self, parent: &Path, prefix: &str) -> Result<PathBuf> {
        let parent = if parent.as_os_str().is_empty() {
            self.temp_directory()
        } else {
            parent.to_path_buf()
        };
        self.mk_dir(&parent)?;
        loop {
            let path = parent.join(format!("{}{}", prefix, random_name(TEMP_NAME_LEN)));
            match self.create_dir(&path, FileMode::directory(0o755)) {
                Ok(()) => return Ok(path),
                Err(err) if err.is(ErrorKind::Exists) => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Creates and opens a fresh file under `parent`.
    fn temp_file(&self, parent: &Path, prefix: &str) -> Result<Box<dyn File>> {
        let parent = if parent.as_os_str().is_empty() {
            self.temp_directory()
        } else {
            parent.to_path_buf()
        };
        self.mk_dir(&parent)?;
        loop {
            let path = parent.join(format!("{}{}", prefix, random_name(TEMP_NAME_LEN)));
            match self.open_file(
                &path,
                OpenFlags::READ_WRITE | OpenFlags::CREATE | OpenFlags::EXCLUSIVE,
                FileMode::regular(0o600),
            ) {
                Ok(file) => return Ok(file),
                Err(err) if err.is(ErrorKind::Exists) => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Like `temp_file` but returns the path of the created (and closed)
    /// file instead of a handle.
    fn touch_temp_file(&self, parent: &Path, prefix: &str) -> Result<PathBuf> {
        let mut file = self.temp_file(parent, prefix)?;
        let path = file.path().to_path_buf();
        file.close()?;
        Ok(path)
    }

    /// Recursive removal; absent paths are not an error.
    fn rm(&self, path: &Path) -> Result<()> {
        self.rm_with_context(&Context::background(), path)
    }

    fn rm_with_context(&self, ctx: &Context, path: &Path) -> Result<()> {
        transfer::rm(ctx, self, path)
    }

    fn rm_with_exclusions(&self, ctx: &Context, path: &Path, patterns: &[&str]) -> Result<()> {
        transfer::rm_with_exclusions(ctx, self, path, patterns)
    }

    /// Empties a directory without removing it.
    fn clean_dir(&self, path: &Path) -> Result<()> {
        self.clean_dir_with_context(&Context::background(), path)
    }

    fn clean_dir_with_context(&self, ctx: &Context, path: &Path) -> Result<()> {
        transfer::clean_dir(ctx, self, path, &[])
    }

    fn clean_dir_with_exclusions(&self, ctx: &Context, path: &Path, patterns: &[&str]) -> Result<()> {
        transfer::clean_dir(ctx, self, path, patterns)
    }

    // -- tree & selection -----------------------------------------------------

    fn walk(&self, ctx: &Context, root: &Path, callback: &mut WalkCallback<'_>) -> Result<()> {
        walk::walk(ctx, self, root, callback)
    }

    /// Names of a directory's entries.
    fn ls(&self, path: &Path) -> Result<Vec<String>> {
        Ok(self
            .read_dir(path)?
            .into_iter()
            .map(|info| info.name().to_owned())
            .collect())
    }

    fn ls_with_exclusion(&self, path: &Path, patterns: &[&str]) -> Result<Vec<String>> {
        walk::ls_with_exclusion(self, path, patterns)
    }

    /// Entry metadata of a directory (long listing).
    fn lls(&self, path: &Path) -> Result<Vec<FileInfo>> {
        self.read_dir(path)
    }

    /// Every file under `path`; directories are included when
    /// `include_dirs`.
    fn ls_recursive(&self, ctx: &Context, path: &Path, include_dirs: bool) -> Result<Vec<PathBuf>> {
        walk::ls_recursive(ctx, self, path, include_dirs)
    }

    /// Full tree listing, directories included.
    fn list_dir_tree(&self, ctx: &Context, path: &Path) -> Result<Vec<PathBuf>> {
        walk::list_dir_tree(ctx, self, path)
    }

    /// Child directories, hidden (dot) directories excluded.
    fn sub_directories(&self, path: &Path) -> Result<Vec<String>> {
        Ok(self
            .read_dir(path)?
            .into_iter()
            .filter(|info| info.is_dir() && !info.name().starts_with('.'))
            .map(|info| info.name().to_owned())
            .collect())
    }

    /// All files under `dir` carrying one of the extensions (leading dot
    /// optional).
    fn find_all(&self, ctx: &Context, dir: &Path, extensions: &[&str]) -> Result<Vec<PathBuf>> {
        walk::find_all(ctx, self, dir, extensions)
    }

    // -- transforms -----------------------------------------------------------

    /// `cp -r` semantics; permission bits are not preserved, the destination
    /// gets write-create-truncate defaults.
    fn copy(&self, src: &Path, dst: &Path) -> Result<()> {
        self.copy_with_context(&Context::background(), src, dst)
    }

    fn copy_with_context(&self, ctx: &Context, src: &Path, dst: &Path) -> Result<()> {
        transfer::copy(ctx, self, src, dst)
    }

    /// Copies `src` over the file at `dst` (never into it).
    fn copy_to_file(&self, ctx: &Context, src: &Path, dst: &Path) -> Result<()> {
        transfer::copy_to_file(ctx, self, src, dst)
    }

    /// Copies `src` under the directory `dst`.
    fn copy_to_directory(&self, ctx: &Context, src: &Path, dst: &Path) -> Result<()> {
        transfer::copy_to_directory(ctx, self, src, dst)
    }

    /// Rename first; copy-then-remove on any rename failure (cross-device
    /// renames included).
    fn move_path(&self, src: &Path, dst: &Path) -> Result<()> {
        self.move_path_with_context(&Context::background(), src, dst)
    }

    fn move_path_with_context(&self, ctx: &Context, src: &Path, dst: &Path) -> Result<()> {
        transfer::move_path(ctx, self, src, dst)
    }

    /// Removal escalated through the `ForceRemover` capability.
    fn remove_with_privileges(&self, ctx: &Context, path: &Path) -> Result<()> {
        match self.as_force_remover() {
            Some(remover) => remover.force_remove(ctx, path),
            None => Err(Error::not_implemented("force remove")),
        }
    }

    /// Removes files whose access time is older than `max_age`; directories
    /// that become empty are removed when `delete_path`.
    fn garbage_collect(
        &self,
        ctx: &Context,
        root: &Path,
        max_age: std::time::Duration,
        delete_path: bool,
    ) -> Result<()> {
        transfer::garbage_collect(ctx, self, root, max_age, delete_path)
    }

    // -- permissions & ownership ----------------------------------------------

    fn chmod_recursively(&self, ctx: &Context, path: &Path, perm: FileMode) -> Result<()> {
        let paths = self.list_dir_tree(ctx, path)?;
        for entry in paths {
            ctx.check()?;
            self.chmod(&entry, perm)?;
        }
        self.chmod(path, perm)
    }

    fn chown(&self, path: &Path, uid: u32, gid: u32) -> Result<()> {
        match self.as_chowner() {
            Some(chowner) => chowner.chown(path, uid, gid),
            None => Err(Error::not_implemented("chown")),
        }
    }

    fn chown_recursively(&self, ctx: &Context, path: &Path, uid: u32, gid: u32) -> Result<()> {
        let chowner = self
            .as_chowner()
            .ok_or_else(|| Error::not_implemented("chown"))?;
        let paths = self.list_dir_tree(ctx, path)?;
        for entry in paths {
            ctx.check()?;
            chowner.chown(&entry, uid, gid)?;
        }
        chowner.chown(path, uid, gid)
    }

    fn change_ownership(&self, path: &Path, owner: Owner) -> Result<()> {
        self.chown(path, owner.uid, owner.gid)
    }

    fn change_ownership_recursively(&self, ctx: &Context, path: &Path, owner: Owner) -> Result<()> {
        self.chown_recursively(ctx, path, owner.uid, owner.gid)
    }

    /// Owner ids of a node, where the backend records them.
    fn fetch_file_owner(&self, path: &Path) -> Result<Owner> {
        self.stat(path)?.owner().ok_or_else(|| {
            Error::new(
                ErrorKind::Unsupported,
                format!("no ownership information for '{}'", path.display()),
            )
        })
    }

    /// Distinct owners across a whole tree.
    fn fetch_owners(&self, ctx: &Context, path: &Path) -> Result<Vec<Owner>> {
        let mut owners = Vec::new();
        let mut paths = self.list_dir_tree(ctx, path)?;
        paths.push(path.to_path_buf());
        for entry in paths {
            ctx.check()?;
            if let Some(owner) = self.stat(&entry)?.owner() {
                if !owners.contains(&owner) {
                    owners.push(owner);
                }
            }
        }
        Ok(owners)
    }

    // -- links ----------------------------------------------------------------

    fn link(&self, target: &Path, link_path: &Path) -> Result<()> {
        match self.as_linker() {
            Some(linker) => linker.link(target, link_path),
            None => Err(Error::not_implemented("hard link")),
        }
    }

    fn symlink(&self, target: &Path, link_path: &Path) -> Result<()> {
        match self.as_symlinker() {
            Some(symlinker) => symlinker.symlink(target, link_path),
            None => Err(Error::not_implemented("symlink")),
        }
    }

    /// Target of a symbolic link. Fails with `Invalid` on anything else,
    /// hard links included.
    fn readlink(&self, path: &Path) -> Result<PathBuf> {
        match self.as_link_reader() {
            Some(reader) => reader.readlink(path),
            None => Err(Error::not_implemented("readlink")),
        }
    }

    /// Resolves a chain of symbolic links to the real absolute path.
    fn eval_symlinks(&self, path: &Path) -> Result<PathBuf> {
        let reader = match self.as_link_reader() {
            Some(reader) => reader,
            None => return Ok(fspath::clean(path)),
        };
        let mut current = fspath::clean(path);
        for _ in 0..SYMLINK_FOLLOW_MAX {
            if !self.is_link(&current)? {
                return Ok(current);
            }
            let target = reader.readlink(&current)?;
            current = if target.is_absolute() {
                fspath::clean(target)
            } else {
                fspath::join(fspath::dir(&current), target)
            };
        }
        Err(Error::new(
            ErrorKind::Invalid,
            format!("too many levels of symbolic links resolving '{}'", path.display()),
        ))
    }

    // -- archive --------------------------------------------------------------

    /// Structural probe: content sniff when the file exists, extension
    /// fallback when it does not.
    fn is_zip(&self, path: &Path) -> Result<bool> {
        ziputil::is_zip(self, path)
    }

    fn zip_directory(&self, src: &Path, dst: &Path) -> Result<()> {
        self.zip_directory_with_context_and_limits(
            &Context::background(),
            src,
            dst,
            &Limits::default_zip_limits(),
        )
    }

    fn zip_directory_with_context_and_limits(
        &self,
        ctx: &Context,
        src: &Path,
        dst: &Path,
        limits: &Limits,
    ) -> Result<()> {
        ziputil::zip_directory(ctx, self, src, dst, limits)
    }

    fn unzip(&self, src: &Path, dst: &Path) -> Result<Vec<PathBuf>> {
        self.unzip_with_context_and_limits(
            &Context::background(),
            src,
            dst,
            &Limits::default_zip_limits(),
        )
    }

    fn unzip_with_context_and_limits(
        &self,
        ctx: &Context,
        src: &Path,
        dst: &Path,
        limits: &Limits,
    ) -> Result<Vec<PathBuf>> {
        ziputil::unzip(ctx, self, &CharsetDetector::default(), src, dst, limits)
    }

    // -- hashing --------------------------------------------------------------

    fn file_hash(&self, hasher: &dyn FileHasher, path: &Path) -> Result<String> {
        hash::file_hash(self, hasher, path)
    }
}

/// Lock handle factory over a shared filesystem.
pub fn new_remote_lock_file(
    fs: Arc<dyn FileSystem>,
    lock_id: impl Into<String>,
    directory: impl Into<PathBuf>,
) -> RemoteLockFile {
    RemoteLockFile::new(fs, lock_id, directory)
}

fn random_name(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn read_all_with_context(ctx: &Context, file: &mut dyn File, content: &mut Vec<u8>) -> Result<()> {
    let mut chunk = [0u8; 32 * 1024];
    loop {
        ctx.check()?;
        match file.read(&mut chunk) {
            Ok(0) => return Ok(()),
            Ok(n) => content.extend_from_slice(&chunk[..n]),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
}
