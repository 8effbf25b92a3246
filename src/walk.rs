/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::path::{Path, PathBuf};

use regex::RegexSet;

use crate::context::Context;
use crate::errors::{Error, Result};
use crate::filesystem::{FileInfo, FileSystem};
use crate::fspath;

/// Verdict returned by a walk callback for the entry it was handed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkControl {
    Continue,
    /// On a directory: prune its subtree. On a file: skip the remaining
    /// entries of the containing directory.
    SkipDir,
}

pub type WalkCallback<'a> =
    dyn FnMut(&Path, std::result::Result<&FileInfo, &Error>) -> Result<WalkControl> + 'a;

/// Depth-first traversal rooted at `root`, entries name-sorted per
/// directory. The callback sees every entry (the root included) together
/// with its metadata, or with the error that made the metadata unreadable.
/// Any error returned by the callback aborts the walk; the context is
/// polled before every callback and every descent.
pub fn walk<F: FileSystem + ?Sized>(
    ctx: &Context,
    fs: &F,
    root: &Path,
    callback: &mut WalkCallback<'_>,
) -> Result<()> {
    ctx.check()?;
    match fs.lstat(root) {
        Ok(info) => {
            walk_node(ctx, fs, root, &info, callback)?;
            Ok(())
        }
        Err(err) => {
            callback(root, Err(&err))?;
            Ok(())
        }
    }
}

fn walk_node<F: FileSystem + ?Sized>(
    ctx: &Context,
    fs: &F,
    path: &Path,
    info: &FileInfo,
    callback: &mut WalkCallback<'_>,
) -> Result<WalkControl> {
    ctx.check()?;
    let control = callback(path, Ok(info))?;
    if !info.is_dir() {
        return Ok(control);
    }
    if control == WalkControl::SkipDir {
        return Ok(WalkControl::Continue);
    }
    let entries = match fs.read_dir(path) {
        Ok(entries) => entries,
        Err(err) => {
            callback(path, Err(&err))?;
            return Ok(WalkControl::Continue);
        }
    };
    for entry in entries {
        ctx.check()?;
        let child = path.join(entry.name());
        if walk_node(ctx, fs, &child, &entry, callback)? == WalkControl::SkipDir {
            // a file asking for SkipDir skips the rest of its directory
            break;
        }
    }
    Ok(WalkControl::Continue)
}

/// Every path under `root` (the root itself excluded); directories are
/// listed only when `include_dirs`.
pub fn ls_recursive<F: FileSystem + ?Sized>(
    ctx: &Context,
    fs: &F,
    root: &Path,
    include_dirs: bool,
) -> Result<Vec<PathBuf>> {
    let mut collected = Vec::new();
    let root_owned = root.to_path_buf();
    walk(ctx, fs, root, &mut |path, entry| {
        let info = entry.map_err(clone_error)?;
        if path != root_owned && (include_dirs || !info.is_dir()) {
            collected.push(path.to_path_buf());
        }
        Ok(WalkControl::Continue)
    })?;
    Ok(collected)
}

/// Full tree listing: every file and directory under `root`.
pub fn list_dir_tree<F: FileSystem + ?Sized>(
    ctx: &Context,
    fs: &F,
    root: &Path,
) -> Result<Vec<PathBuf>> {
    ls_recursive(ctx, fs, root, true)
}

/// Directory names minus the excluded ones; patterns are applied to the
/// joined path of each entry.
pub fn ls_with_exclusion<F: FileSystem + ?Sized>(
    fs: &F,
    dir: &Path,
    patterns: &[&str],
) -> Result<Vec<String>> {
    let exclusions = compile_exclusion_set(fs.path_separator(), patterns)?;
    Ok(fs
        .read_dir(dir)?
        .into_iter()
        .map(|info| info.name().to_owned())
        .filter(|name| !exclusions.is_match(&dir.join(name).to_string_lossy()))
        .collect())
}

/// Files under `dir` carrying one of `extensions` (the `**/*.<ext>`
/// selection; a leading dot on the extension is optional).
pub fn find_all<F: FileSystem + ?Sized>(
    ctx: &Context,
    fs: &F,
    dir: &Path,
    extensions: &[&str],
) -> Result<Vec<PathBuf>> {
    let wanted: Vec<String> = extensions
        .iter()
        .map(|extension| {
            if let Some(stripped) = extension.strip_prefix('.') {
                format!(".{}", stripped)
            } else {
                format!(".{}", extension)
            }
        })
        .collect();
    let mut collected = Vec::new();
    walk(ctx, fs, dir, &mut |path, entry| {
        let info = entry.map_err(clone_error)?;
        if !info.is_dir() {
            let extension = fspath::ext(path);
            if wanted.iter().any(|candidate| *candidate == extension) {
                collected.push(path.to_path_buf());
            }
        }
        Ok(WalkControl::Continue)
    })?;
    Ok(collected)
}

/// The input paths minus those matching any exclusion pattern.
pub fn exclude_all(
    paths: Vec<PathBuf>,
    separator: char,
    patterns: &[&str],
) -> Result<Vec<PathBuf>> {
    let exclusions = compile_exclusion_set(separator, patterns)?;
    Ok(paths
        .into_iter()
        .filter(|path| !exclusions.is_match(&path.to_string_lossy()))
        .collect())
}

/// Single-path exclusion predicate. A path is excluded when it matches a
/// pattern `P`, `.*/P/.*` or `.*<sep>P<sep>.*`.
pub fn is_path_excluded_from_patterns(
    path: &str,
    separator: char,
    patterns: &[&str],
) -> Result<bool> {
    if patterns.is_empty() {
        return Ok(false);
    }
    Ok(compile_exclusion_set(separator, patterns)?.is_match(path))
}

/// Expands each user pattern `P` into `P`, `.*/P/.*` and `.*<sep>P<sep>.*`
/// and compiles the whole set. Invalid patterns fail with `Invalid`.
pub fn compile_exclusion_set(separator: char, patterns: &[&str]) -> Result<RegexSet> {
    let mut expanded = Vec::with_capacity(patterns.len() * 3);
    let escaped_separator = regex::escape(&separator.to_string());
    for pattern in patterns {
        expanded.push((*pattern).to_owned());
        expanded.push(format!(".*/{}/.*", pattern));
        expanded.push(format!(
            ".*{}{}{}.*",
            escaped_separator, pattern, escaped_separator
        ));
    }
    Ok(RegexSet::new(expanded)?)
}

fn clone_error(err: &Error) -> Error {
    Error::new(err.kind(), err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::MemFs;

    fn sample_tree() -> MemFs {
        let fs = MemFs::new();
        fs.mk_dir(Path::new("/a/b")).unwrap();
        fs.mk_dir(Path::new("/a/.hidden")).unwrap();
        fs.write_file(Path::new("/a/one.txt"), b"1", Default::default())
            .unwrap();
        fs.write_file(Path::new("/a/b/two.txt"), b"22", Default::default())
            .unwrap();
        fs.write_file(Path::new("/a/b/three.log"), b"333", Default::default())
            .unwrap();
        fs
    }

    #[test]
    fn test_walk_visits_everything_sorted() {
        let fs = sample_tree();
        let mut seen = Vec::new();
        walk(
            &Context::background(),
            &fs,
            Path::new("/a"),
            &mut |path, entry| {
                entry.unwrap();
                seen.push(path.to_string_lossy().into_owned());
                Ok(WalkControl::Continue)
            },
        )
        .unwrap();
        assert_eq!(
            vec![
                "/a",
                "/a/.hidden",
                "/a/b",
                "/a/b/three.log",
                "/a/b/two.txt",
                "/a/one.txt"
            ],
            seen
        );
    }

    #[test]
    fn test_walk_skip_dir_prunes_subtree() {
        let fs = sample_tree();
        let mut seen = Vec::new();
        walk(
            &Context::background(),
            &fs,
            Path::new("/a"),
            &mut |path, _entry| {
                seen.push(path.to_string_lossy().into_owned());
                if path == Path::new("/a/b") {
                    Ok(WalkControl::SkipDir)
                } else {
                    Ok(WalkControl::Continue)
                }
            },
        )
        .unwrap();
        assert_eq!(vec!["/a", "/a/.hidden", "/a/b", "/a/one.txt"], seen);
    }

    #[test]
    fn test_walk_callback_error_aborts() {
        let fs = sample_tree();
        let mut count = 0;
        let result = walk(
            &Context::background(),
            &fs,
            Path::new("/a"),
            &mut |_path, _entry| {
                count += 1;
                Err(Error::new(crate::errors::ErrorKind::Invalid, "stop here"))
            },
        );
        assert!(result.is_err());
        assert_eq!(1, count);
    }

    #[test]
    fn test_walk_cancelled_context_returns_immediately() {
        let fs = sample_tree();
        let (ctx, cancel) = Context::background().with_cancel();
        cancel.cancel();
        let result = walk(&ctx, &fs, Path::new("/a"), &mut |_path, _entry| {
            panic!("callback must not run under a cancelled context")
        });
        assert_eq!(
            crate::errors::ErrorKind::Cancelled,
            result.unwrap_err().kind()
        );
    }

    #[test]
    fn test_ls_recursive_files_only() {
        let fs = sample_tree();
        let files = ls_recursive(&Context::background(), &fs, Path::new("/a"), false).unwrap();
        assert_eq!(
            vec![
                PathBuf::from("/a/b/three.log"),
                PathBuf::from("/a/b/two.txt"),
                PathBuf::from("/a/one.txt"),
            ],
            files
        );
    }

    #[test]
    fn test_list_dir_tree_includes_directories() {
        let fs = sample_tree();
        let tree = list_dir_tree(&Context::background(), &fs, Path::new("/a")).unwrap();
        assert!(tree.contains(&PathBuf::from("/a/b")));
        assert!(tree.contains(&PathBuf::from("/a/.hidden")));
        assert!(tree.contains(&PathBuf::from("/a/one.txt")));
        assert!(!tree.contains(&PathBuf::from("/a")));
    }

    #[test]
    fn test_find_all_by_extension() {
        let fs = sample_tree();
        let found = find_all(&Context::background(), &fs, Path::new("/a"), &["txt"]).unwrap();
        assert_eq!(
            vec![PathBuf::from("/a/b/two.txt"), PathBuf::from("/a/one.txt")],
            found
        );
        let found = find_all(&Context::background(), &fs, Path::new("/a"), &[".log"]).unwrap();
        assert_eq!(vec![PathBuf::from("/a/b/three.log")], found);
    }

    #[test]
    fn test_is_path_excluded_matches_pattern_and_fragments() {
        assert!(is_path_excluded_from_patterns("/a/target/b", '/', &["target"]).unwrap());
        assert!(is_path_excluded_from_patterns("/a/b/target", '/', &["target"]).unwrap());
        assert!(!is_path_excluded_from_patterns("/a/b/c", '/', &["target"]).unwrap());
        assert!(is_path_excluded_from_patterns("/a/b.tmp", '/', &[r"\.tmp"]).unwrap());
    }

    #[test]
    fn test_is_path_excluded_empty_patterns() {
        assert!(!is_path_excluded_from_patterns("/a/b", '/', &[]).unwrap());
    }

    #[test]
    fn test_invalid_pattern_fails_invalid() {
        let err = is_path_excluded_from_patterns("/a", '/', &["("]).unwrap_err();
        assert_eq!(crate::errors::ErrorKind::Invalid, err.kind());
    }

    #[test]
    fn test_exclude_all_filters_matches() {
        let paths = vec![
            PathBuf::from("/a/keep.txt"),
            PathBuf::from("/a/target/drop.txt"),
            PathBuf::from("/a/drop.tmp"),
        ];
        let kept = exclude_all(paths, '/', &["target", r"\.tmp$"]).unwrap();
        assert_eq!(vec![PathBuf::from("/a/keep.txt")], kept);
    }

    #[test]
    fn test_ls_with_exclusion() {
        let fs = sample_tree();
        let names = ls_with_exclusion(&fs, Path::new("/a"), &[r"\.hidden"]).unwrap();
        assert_eq!(vec!["b", "one.txt"], names);
    }
}
