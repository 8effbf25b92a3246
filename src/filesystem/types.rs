/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::fmt::Display;
use std::time::SystemTime;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Backend tag of a filesystem handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FsType {
    Standard,
    InMemory,
    Zip,
    Tar,
    Embed,
    Custom,
}

impl Display for FsType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            FsType::Standard => "standard",
            FsType::InMemory => "in-memory",
            FsType::Zip => "zip",
            FsType::Tar => "tar",
            FsType::Embed => "embed",
            FsType::Custom => "custom",
        };
        write!(f, "{}", text)
    }
}

const TYPE_MASK: u32 = 0o170000;
const TYPE_REGULAR: u32 = 0o100000;
const TYPE_DIR: u32 = 0o040000;
const TYPE_SYMLINK: u32 = 0o120000;
const PERM_MASK: u32 = 0o7777;

/// Unix-style mode: permission bits plus a type flag (regular, directory,
/// symlink).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileMode(u32);

impl FileMode {
    pub fn regular(perm: u32) -> Self {
        FileMode(TYPE_REGULAR | (perm & PERM_MASK))
    }

    pub fn directory(perm: u32) -> Self {
        FileMode(TYPE_DIR | (perm & PERM_MASK))
    }

    pub fn symlink() -> Self {
        FileMode(TYPE_SYMLINK | 0o777)
    }

    /// Raw `st_mode`-style bits.
    pub fn from_raw(bits: u32) -> Self {
        FileMode(bits)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn permissions(&self) -> u32 {
        self.0 & PERM_MASK
    }

    pub fn is_dir(&self) -> bool {
        self.0 & TYPE_MASK == TYPE_DIR
    }

    pub fn is_symlink(&self) -> bool {
        self.0 & TYPE_MASK == TYPE_SYMLINK
    }

    pub fn is_regular(&self) -> bool {
        self.0 & TYPE_MASK == TYPE_REGULAR || self.0 & TYPE_MASK == 0
    }

    pub fn with_permissions(&self, perm: u32) -> Self {
        FileMode((self.0 & !PERM_MASK) | (perm & PERM_MASK))
    }
}

impl Display for FileMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:o}", self.0)
    }
}

impl Default for FileMode {
    fn default() -> Self {
        FileMode::regular(0o644)
    }
}

bitflags! {
    /// Open disposition, modelled after the classic open(2) flag set.
    /// The empty set means read-only.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const WRITE_ONLY = 1;
        const READ_WRITE = 1 << 1;
        const APPEND = 1 << 2;
        const CREATE = 1 << 3;
        const EXCLUSIVE = 1 << 4;
        const TRUNCATE = 1 << 5;
    }
}

impl OpenFlags {
    pub fn read_only() -> Self {
        OpenFlags::empty()
    }

    pub fn writable(&self) -> bool {
        self.intersects(OpenFlags::WRITE_ONLY | OpenFlags::READ_WRITE | OpenFlags::APPEND)
    }

    pub fn readable(&self) -> bool {
        !self.contains(OpenFlags::WRITE_ONLY)
    }
}

/// Owner ids recovered from the backend, where supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
}

/// Metadata snapshot of one file node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    name: String,
    size: u64,
    mode: FileMode,
    mod_time: SystemTime,
    owner: Option<Owner>,
}

impl FileInfo {
    pub fn new(name: impl Into<String>, size: u64, mode: FileMode, mod_time: SystemTime) -> Self {
        FileInfo {
            name: name.into(),
            // directories never report a size
            size: if mode.is_dir() { 0 } else { size },
            mode,
            mod_time,
            owner: None,
        }
    }

    pub fn with_owner(mut self, owner: Owner) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn mode(&self) -> FileMode {
        self.mode
    }

    pub fn mod_time(&self) -> SystemTime {
        self.mod_time
    }

    pub fn is_dir(&self) -> bool {
        self.mode.is_dir()
    }

    pub fn is_symlink(&self) -> bool {
        self.mode.is_symlink()
    }

    pub fn owner(&self) -> Option<Owner> {
        self.owner
    }
}

/// Node timestamps with per-field availability flags. Backends that cannot
/// answer a field leave it unset; querying an unset field returns the
/// current instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileTimeInfo {
    mod_time: SystemTime,
    access_time: Option<SystemTime>,
    change_time: Option<SystemTime>,
    birth_time: Option<SystemTime>,
}

impl FileTimeInfo {
    pub fn mod_time_only(mod_time: SystemTime) -> Self {
        FileTimeInfo {
            mod_time,
            access_time: None,
            change_time: None,
            birth_time: None,
        }
    }

    pub fn new(
        mod_time: SystemTime,
        access_time: Option<SystemTime>,
        change_time: Option<SystemTime>,
        birth_time: Option<SystemTime>,
    ) -> Self {
        FileTimeInfo {
            mod_time,
            access_time,
            change_time,
            birth_time,
        }
    }

    pub fn mod_time(&self) -> SystemTime {
        self.mod_time
    }

    pub fn access_time(&self) -> SystemTime {
        self.access_time.unwrap_or_else(SystemTime::now)
    }

    pub fn change_time(&self) -> SystemTime {
        self.change_time.unwrap_or_else(SystemTime::now)
    }

    pub fn birth_time(&self) -> SystemTime {
        self.birth_time.unwrap_or_else(SystemTime::now)
    }

    pub fn has_access_time(&self) -> bool {
        self.access_time.is_some()
    }

    pub fn has_change_time(&self) -> bool {
        self.change_time.is_some()
    }

    pub fn has_birth_time(&self) -> bool {
        self.birth_time.is_some()
    }
}

/// Capacity snapshot of the store backing a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageStat {
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub used_bytes: u64,
    pub inodes_total: u64,
    pub inodes_used: u64,
    pub inodes_free: u64,
}

impl UsageStat {
    pub fn used_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.used_bytes as f64 / self.total_bytes as f64 * 100.0
    }

    pub fn inodes_used_percent(&self) -> f64 {
        if self.inodes_total == 0 {
            return 0.0;
        }
        self.inodes_used as f64 / self.inodes_total as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_type_flags() {
        assert!(FileMode::directory(0o755).is_dir());
        assert!(!FileMode::directory(0o755).is_regular());
        assert!(FileMode::regular(0o644).is_regular());
        assert!(FileMode::symlink().is_symlink());
        assert_eq!(0o644, FileMode::regular(0o644).permissions());
    }

    #[test]
    fn test_mode_with_permissions_keeps_type() {
        let mode = FileMode::directory(0o755).with_permissions(0o700);
        assert!(mode.is_dir());
        assert_eq!(0o700, mode.permissions());
    }

    #[test]
    fn test_directory_info_reports_zero_size() {
        let info = FileInfo::new(
            "d",
            4096,
            FileMode::directory(0o755),
            SystemTime::UNIX_EPOCH,
        );
        assert_eq!(0, info.size());
    }

    #[test]
    fn test_open_flags_readability() {
        assert!(OpenFlags::read_only().readable());
        assert!(!OpenFlags::read_only().writable());
        assert!(!OpenFlags::WRITE_ONLY.readable());
        assert!((OpenFlags::READ_WRITE | OpenFlags::CREATE).writable());
        assert!((OpenFlags::READ_WRITE | OpenFlags::CREATE).readable());
    }

    #[test]
    fn test_time_info_flags() {
        let times = FileTimeInfo::mod_time_only(SystemTime::UNIX_EPOCH);
        assert!(!times.has_access_time());
        assert!(!times.has_change_time());
        assert!(!times.has_birth_time());
        assert_eq!(SystemTime::UNIX_EPOCH, times.mod_time());
        // unqueryable fields answer with the current instant
        assert!(times.access_time() > SystemTime::UNIX_EPOCH);
    }

    #[test]
    fn test_usage_percentages() {
        let usage = UsageStat {
            total_bytes: 1000,
            free_bytes: 250,
            used_bytes: 750,
            inodes_total: 10,
            inodes_used: 5,
            inodes_free: 5,
        };
        assert_eq!(75.0, usage.used_percent());
        assert_eq!(50.0, usage.inodes_used_percent());
    }
}
