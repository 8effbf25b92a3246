/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::path::{Component, Path, PathBuf};

use crate::errors::{Error, ErrorKind, Result};

/// Lexically cleans a path: collapses separators, resolves `.` and `..`
/// components without touching the filesystem. The result never ends with a
/// separator and an empty input cleans to `.`.
pub fn clean(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    let mut components = path.components().peekable();
    let mut cleaned = if let Some(component @ Component::Prefix(..)) = components.peek().cloned() {
        components.next();
        PathBuf::from(component.as_os_str())
    } else {
        PathBuf::new()
    };
    for component in components {
        match component {
            Component::Prefix(..) => unreachable!(),
            Component::RootDir => {
                cleaned.push(component.as_os_str());
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if cleaned.ends_with(Component::ParentDir.as_os_str()) {
                    cleaned.push(Component::ParentDir.as_os_str());
                } else {
                    let popped = cleaned.pop();
                    if !popped && !cleaned.has_root() {
                        cleaned.push(Component::ParentDir.as_os_str());
                    }
                }
            }
            Component::Normal(name) => {
                cleaned.push(name);
            }
        }
    }
    if cleaned.as_os_str().is_empty() {
        cleaned.push(".");
    }
    cleaned
}

/// Joins and cleans.
pub fn join(base: impl AsRef<Path>, child: impl AsRef<Path>) -> PathBuf {
    clean(base.as_ref().join(child.as_ref()))
}

/// Last path element; `.` for an empty path, the root for a bare root.
pub fn base(path: impl AsRef<Path>) -> String {
    let path = path.as_ref();
    match path.file_name() {
        Some(name) => name.to_string_lossy().into_owned(),
        None => clean(path).to_string_lossy().into_owned(),
    }
}

/// Everything but the last path element, cleaned; `.` when there is none.
pub fn dir(path: impl AsRef<Path>) -> PathBuf {
    match path.as_ref().parent() {
        Some(parent) if !parent.as_os_str().is_empty() => clean(parent),
        Some(_) => PathBuf::from("."),
        None => clean(path),
    }
}

/// File name extension including the leading dot, or an empty string.
pub fn ext(path: impl AsRef<Path>) -> String {
    match path.as_ref().extension() {
        Some(extension) => format!(".{}", extension.to_string_lossy()),
        None => String::new(),
    }
}

/// Splits a path into its directory and its last element.
pub fn split(path: impl AsRef<Path>) -> (PathBuf, String) {
    (dir(path.as_ref()), base(path.as_ref()))
}

/// File name with the final extension removed.
pub fn filepath_stem(path: impl AsRef<Path>) -> String {
    match path.as_ref().file_stem() {
        Some(stem) => stem.to_string_lossy().into_owned(),
        None => base(path),
    }
}

/// Parent directories of `path`, nearest first, stopping at the root (or at
/// `.` for relative paths). The path itself is not included.
pub fn parents(path: impl AsRef<Path>) -> Vec<PathBuf> {
    let cleaned = clean(path);
    cleaned
        .ancestors()
        .skip(1)
        .filter(|ancestor| !ancestor.as_os_str().is_empty())
        .map(PathBuf::from)
        .collect()
}

/// Leading volume name (`C:` on Windows); empty on Unix paths.
pub fn volume_name(path: impl AsRef<Path>) -> String {
    match path.as_ref().components().next() {
        Some(component @ Component::Prefix(..)) => {
            component.as_os_str().to_string_lossy().into_owned()
        }
        _ => String::new(),
    }
}

/// Replaces every `separator` with a forward slash.
pub fn to_slash(path: &str, separator: char) -> String {
    if separator == '/' {
        return path.to_owned();
    }
    path.replace(separator, "/")
}

/// Replaces every forward slash with `separator`.
pub fn from_slash(path: &str, separator: char) -> String {
    if separator == '/' {
        return path.to_owned();
    }
    path.replace('/', &separator.to_string())
}

/// Converts between a filesystem's separator and another one.
pub fn convert_separators(path: &str, from: char, to: char) -> String {
    if from == to {
        return path.to_owned();
    }
    path.replace(from, &to.to_string())
}

/// Lexical relative path from `base` to `target` (both cleaned first).
/// Fails with `Invalid` when no purely lexical relative path exists.
pub fn rel(base: impl AsRef<Path>, target: impl AsRef<Path>) -> Result<PathBuf> {
    let base = clean(base);
    let target = clean(target);
    if base == target {
        return Ok(PathBuf::from("."));
    }
    if base.has_root() != target.has_root() {
        return Err(Error::new(
            ErrorKind::Invalid,
            format!(
                "cannot make '{}' relative to '{}'",
                target.display(),
                base.display()
            ),
        ));
    }
    let base_components: Vec<Component<'_>> = base.components().collect();
    let target_components: Vec<Component<'_>> = target.components().collect();
    let mut common = 0;
    while common < base_components.len()
        && common < target_components.len()
        && base_components[common] == target_components[common]
    {
        common += 1;
    }
    let mut relative = PathBuf::new();
    for component in &base_components[common..] {
        if matches!(component, Component::ParentDir) {
            return Err(Error::new(
                ErrorKind::Invalid,
                format!(
                    "cannot make '{}' relative to '{}'",
                    target.display(),
                    base.display()
                ),
            ));
        }
        if !matches!(component, Component::CurDir) {
            relative.push("..");
        }
    }
    for component in &target_components[common..] {
        relative.push(component.as_os_str());
    }
    if relative.as_os_str().is_empty() {
        relative.push(".");
    }
    Ok(relative)
}

/// Absolute, cleaned form of `path`, resolved against the process working
/// directory when relative.
pub fn abs(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    if path.is_absolute() {
        return Ok(clean(path));
    }
    let cwd = std::env::current_dir()?;
    Ok(clean(cwd.join(path)))
}

/// Number of directory levels between `root` and `path` (a file directly in
/// `root` has depth 0). Fails with `Invalid` when `path` is not under
/// `root`.
pub fn file_tree_depth(root: impl AsRef<Path>, path: impl AsRef<Path>) -> Result<i64> {
    let relative = rel(&root, &path)?;
    let mut depth: i64 = 0;
    for component in relative.components() {
        match component {
            Component::ParentDir => {
                return Err(Error::new(
                    ErrorKind::Invalid,
                    format!(
                        "'{}' is not under '{}'",
                        path.as_ref().display(),
                        root.as_ref().display()
                    ),
                ));
            }
            Component::Normal(_) => depth += 1,
            _ => {}
        }
    }
    Ok((depth - 1).max(0))
}

/// Joins a zip entry name onto the extraction root and validates the result
/// against path traversal (CWE-22). The joined path must stay inside
/// `destination`; anything else fails with `Malicious` naming both paths.
pub fn sanitise_zip_extract_path(
    destination: impl AsRef<Path>,
    entry_name: &str,
) -> Result<PathBuf> {
    let destination = clean(destination);
    let candidate = clean(destination.join(entry_name));
    if candidate == destination {
        return Ok(candidate);
    }
    let escaped = !candidate.starts_with(&destination)
        || candidate
            .components()
            .any(|component| matches!(component, Component::ParentDir));
    if escaped {
        return Err(Error::new(
            ErrorKind::Malicious,
            format!(
                "zip entry resolves to '{}' outside of extraction root '{}'",
                candidate.display(),
                destination.display()
            ),
        ));
    }
    Ok(candidate)
}
