/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::io::{Read, Write};
use std::path::Path;
use std::time::{Duration, SystemTime};

use log::debug;
use rayon::prelude::*;
use regex::RegexSet;

use crate::context::Context;
use crate::errors::{Error, ErrorKind, Result};
use crate::filesystem::{FileMode, FileSystem, OpenFlags};
use crate::fspath;
use crate::walk::compile_exclusion_set;

const COPY_CHUNK_SIZE: usize = 32 * 1024;

/// Chunked, cancellable stream copy. Returns the number of bytes written.
pub fn copy_stream<R, W>(ctx: &Context, reader: &mut R, writer: &mut W) -> Result<u64>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut chunk = [0u8; COPY_CHUNK_SIZE];
    let mut written: u64 = 0;
    loop {
        ctx.check()?;
        let n = match reader.read(&mut chunk) {
            Ok(0) => return Ok(written),
            Ok(n) => n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        writer.write_all(&chunk[..n])?;
        written += n as u64;
    }
}

/// Copies exactly `count` bytes; fewer available fails with `Eof`.
pub fn copy_n<R, W>(ctx: &Context, reader: &mut R, writer: &mut W, count: u64) -> Result<u64>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut chunk = [0u8; COPY_CHUNK_SIZE];
    let mut remaining = count;
    while remaining > 0 {
        ctx.check()?;
        let want = remaining.min(COPY_CHUNK_SIZE as u64) as usize;
        let n = match reader.read(&mut chunk[..want]) {
            Ok(0) => {
                return Err(Error::new(
                    ErrorKind::Eof,
                    format!("stream ended {} B short of {}", remaining, count),
                ))
            }
            Ok(n) => n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        writer.write_all(&chunk[..n])?;
        remaining -= n as u64;
    }
    Ok(count)
}

/// `cp -r` on a single filesystem.
pub fn copy<F: FileSystem + ?Sized>(ctx: &Context, fs: &F, src: &Path, dst: &Path) -> Result<()> {
    copy_between_fs(ctx, fs, src, fs, dst)
}

/// `cp -r` across filesystems, through the trait only.
///
/// Fan-out: a file lands under an existing directory destination (or one
/// spelled with a trailing separator), otherwise at the destination path
/// itself; a directory recurses into `dst` when `dst` is new, into
/// `dst/basename(src)` when `dst` exists.
pub fn copy_between_fs<S: FileSystem + ?Sized, D: FileSystem + ?Sized>(
    ctx: &Context,
    src_fs: &S,
    src: &Path,
    dst_fs: &D,
    dst: &Path,
) -> Result<()> {
    ctx.check()?;
    if !src_fs.exists(src) {
        return Err(Error::new(
            ErrorKind::NotFound,
            format!("cannot copy '{}': no such file or directory", src.display()),
        ));
    }
    let forced_directory = has_trailing_separator(dst, dst_fs.path_separator());
    if src_fs.is_dir(src)? {
        let target = if dst_fs.exists(dst) {
            if !dst_fs.is_dir(dst)? {
                return Err(Error::new(
                    ErrorKind::InvalidDestination,
                    format!(
                        "cannot copy directory '{}' over file '{}'",
                        src.display(),
                        dst.display()
                    ),
                ));
            }
            fspath::clean(dst).join(fspath::base(src))
        } else {
            fspath::clean(dst)
        };
        dst_fs.mk_dir(&target)?;
        for entry in src_fs.read_dir(src)? {
            ctx.check()?;
            copy_between_fs(ctx, src_fs, &src.join(entry.name()), dst_fs, &target)?;
        }
        Ok(())
    } else {
        let target = if forced_directory || dst_fs.is_dir(dst)? {
            dst_fs.mk_dir(&fspath::clean(dst))?;
            fspath::clean(dst).join(fspath::base(src))
        } else {
            dst.to_path_buf()
        };
        copy_file_between_fs(ctx, src_fs, src, dst_fs, &target)
    }
}

/// Copies the file `src` over the path `dst`, never into it.
pub fn copy_to_file<F: FileSystem + ?Sized>(
    ctx: &Context,
    fs: &F,
    src: &Path,
    dst: &Path,
) -> Result<()> {
    if !fs.is_file(src)? {
        return Err(Error::new(
            ErrorKind::Invalid,
            format!("'{}' is not a file", src.display()),
        ));
    }
    copy_file_between_fs(ctx, fs, src, fs, dst)
}

/// Copies `src` under the directory `dst`, creating it when missing.
pub fn copy_to_directory<F: FileSystem + ?Sized>(
    ctx: &Context,
    fs: &F,
    src: &Path,
    dst: &Path,
) -> Result<()> {
    fs.mk_dir(dst)?;
    copy_between_fs(ctx, fs, src, fs, dst)
}

fn copy_file_between_fs<S: FileSystem + ?Sized, D: FileSystem + ?Sized>(
    ctx: &Context,
    src_fs: &S,
    src: &Path,
    dst_fs: &D,
    dst: &Path,
) -> Result<()> {
    if let Some(parent) = dst.parent() {
        if !parent.as_os_str().is_empty() {
            dst_fs.mk_dir(parent)?;
        }
    }
    let mut reader = src_fs.generic_open(src)?;
    let mut writer = dst_fs.open_file(
        dst,
        OpenFlags::WRITE_ONLY | OpenFlags::CREATE | OpenFlags::TRUNCATE,
        FileMode::regular(0o644),
    )?;
    let copied = copy_stream(ctx, reader.as_mut(), writer.as_mut());
    let read_close = reader.close();
    let write_close = writer.close();
    copied?;
    read_close?;
    write_close
}

/// Move on one filesystem: native rename first, copy-then-remove on any
/// rename failure (cross-device renames included).
pub fn move_path<F: FileSystem + ?Sized>(ctx: &Context, fs: &F, src: &Path, dst: &Path) -> Result<()> {
    ctx.check()?;
    match fs.rename(src, dst) {
        Ok(()) => Ok(()),
        Err(err) => {
            debug!(
                "rename of '{}' failed ({}), falling back to copy+remove",
                src.display(),
                err
            );
            copy(ctx, fs, src, dst)?;
            rm(ctx, fs, src)
        }
    }
}

/// Move across filesystems: always copy-then-remove.
pub fn move_between_fs<S: FileSystem + ?Sized, D: FileSystem + ?Sized>(
    ctx: &Context,
    src_fs: &S,
    src: &Path,
    dst_fs: &D,
    dst: &Path,
) -> Result<()> {
    copy_between_fs(ctx, src_fs, src, dst_fs, dst)?;
    rm(ctx, src_fs, src)
}

/// Recursive removal; an absent path is not an error.
pub fn rm<F: FileSystem + ?Sized>(ctx: &Context, fs: &F, path: &Path) -> Result<()> {
    rm_tree(ctx, fs, path, None).map(|_| ())
}

/// Recursive removal keeping every path matching an exclusion pattern (and
/// the directories still holding kept entries).
pub fn rm_with_exclusions<F: FileSystem + ?Sized>(
    ctx: &Context,
    fs: &F,
    path: &Path,
    patterns: &[&str],
) -> Result<()> {
    if patterns.is_empty() {
        return rm(ctx, fs, path);
    }
    let exclusions = compile_exclusion_set(fs.path_separator(), patterns)?;
    rm_tree(ctx, fs, path, Some(&exclusions)).map(|_| ())
}

/// Empties a directory, keeping the directory itself.
pub fn clean_dir<F: FileSystem + ?Sized>(
    ctx: &Context,
    fs: &F,
    path: &Path,
    patterns: &[&str],
) -> Result<()> {
    if !fs.exists(path) {
        return Ok(());
    }
    let exclusions = if patterns.is_empty() {
        None
    } else {
        Some(compile_exclusion_set(fs.path_separator(), patterns)?)
    };
    for entry in fs.read_dir(path)? {
        ctx.check()?;
        rm_tree(ctx, fs, &path.join(entry.name()), exclusions.as_ref())?;
    }
    Ok(())
}

/// Returns true when `path` is gone afterwards.
fn rm_tree<F: FileSystem + ?Sized>(
    ctx: &Context,
    fs: &F,
    path: &Path,
    exclusions: Option<&RegexSet>,
) -> Result<bool> {
    ctx.check()?;
    if let Some(set) = exclusions {
        if set.is_match(&path.to_string_lossy()) {
            return Ok(false);
        }
    }
    let info = match fs.lstat(path) {
        Ok(info) => info,
        Err(err) if err.is(ErrorKind::NotFound) => return Ok(true),
        Err(err) => return Err(err),
    };
    if info.is_dir() {
        let mut emptied = true;
        for entry in fs.read_dir(path)? {
            ctx.check()?;
            emptied &= rm_tree(ctx, fs, &path.join(entry.name()), exclusions)?;
        }
        if !emptied {
            return Ok(false);
        }
        fs.remove_dir(path)?;
        Ok(true)
    } else {
        fs.remove_file(path)?;
        Ok(true)
    }
}

/// Removes files whose access time is older than `max_age`. Directories
/// emptied along the way are deleted when `delete_path`; the decision is by
/// emptiness only, never by the directory's own timestamps. Each directory
/// level fans out in parallel, per-file decisions stay isolated.
pub fn garbage_collect<F: FileSystem + ?Sized>(
    ctx: &Context,
    fs: &F,
    root: &Path,
    max_age: Duration,
    delete_path: bool,
) -> Result<()> {
    if !fs.exists(root) {
        return Ok(());
    }
    let cutoff = SystemTime::now() - max_age;
    gc_tree(ctx, fs, root, cutoff, delete_path).map(|_| ())
}

fn gc_tree<F: FileSystem + ?Sized>(
    ctx: &Context,
    fs: &F,
    path: &Path,
    cutoff: SystemTime,
    delete_path: bool,
) -> Result<bool> {
    ctx.check()?;
    let info = fs.lstat(path)?;
    if !info.is_dir() {
        let times = fs.stat_times(path)?;
        let access_time = if times.has_access_time() {
            times.access_time()
        } else {
            times.mod_time()
        };
        if access_time < cutoff {
            fs.remove_file(path)?;
            return Ok(true);
        }
        return Ok(false);
    }
    let entries = fs.read_dir(path)?;
    entries
        .par_iter()
        .map(|entry| gc_tree(ctx, fs, &path.join(entry.name()), cutoff, delete_path))
        .collect::<Result<Vec<bool>>>()?;
    if delete_path && fs.read_dir(path)?.is_empty() {
        fs.remove_dir(path)?;
        return Ok(true);
    }
    Ok(false)
}

fn has_trailing_separator(path: &Path, separator: char) -> bool {
    path.as_os_str()
        .to_string_lossy()
        .ends_with(separator)
}
