/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use serde::{Deserialize, Serialize};

pub const GIBIBYTE: u64 = 1 << 30;

const DEFAULT_MAX_FILE_SIZE: u64 = GIBIBYTE;
const DEFAULT_MAX_TOTAL_SIZE: u64 = 10 * GIBIBYTE;
const DEFAULT_MAX_FILE_COUNT: u64 = 1_000_000;
const DEFAULT_NON_RECURSIVE_MAX_DEPTH: i64 = 10;

/// Resource bounds applied by the archive and tree engines.
///
/// When `apply` is false every size/count/depth field is ignored.
/// `max_depth < 0` means unbounded depth; `max_depth >= 0` bounds both the
/// zip nesting level and the file-tree depth relative to the extraction
/// root. `recursive` expands zip entries that are themselves zip archives
/// into a sibling directory named after the entry's stem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    pub max_file_size: u64,
    pub max_total_size: u64,
    pub max_file_count: u64,
    pub max_depth: i64,
    pub recursive: bool,
    apply: bool,
}

impl Limits {
    pub fn new(
        max_file_size: u64,
        max_total_size: u64,
        max_file_count: u64,
        max_depth: i64,
        recursive: bool,
    ) -> Self {
        Limits {
            max_file_size,
            max_total_size,
            max_file_count,
            max_depth,
            recursive,
            apply: true,
        }
    }

    /// No bounds enforced at all.
    pub fn no_limits() -> Self {
        Limits {
            max_file_size: 0,
            max_total_size: 0,
            max_file_count: 0,
            max_depth: -1,
            recursive: true,
            apply: false,
        }
    }

    pub fn default_limits() -> Self {
        Limits::new(
            DEFAULT_MAX_FILE_SIZE,
            DEFAULT_MAX_TOTAL_SIZE,
            DEFAULT_MAX_FILE_COUNT,
            -1,
            true,
        )
    }

    pub fn default_zip_limits() -> Self {
        Limits::default_limits()
    }

    pub fn default_non_recursive_zip_limits() -> Self {
        Limits::new(
            DEFAULT_MAX_FILE_SIZE,
            DEFAULT_MAX_TOTAL_SIZE,
            DEFAULT_MAX_FILE_COUNT,
            DEFAULT_NON_RECURSIVE_MAX_DEPTH,
            false,
        )
    }

    /// Recursive zip limits bounded at `max_depth` nesting levels.
    pub fn recursive_zip_limits(max_depth: i64) -> Self {
        Limits::new(
            DEFAULT_MAX_FILE_SIZE,
            DEFAULT_MAX_TOTAL_SIZE,
            DEFAULT_MAX_FILE_COUNT,
            max_depth,
            true,
        )
    }

    pub fn apply(&self) -> bool {
        self.apply
    }

    pub fn depth_bounded(&self) -> bool {
        self.apply && self.max_depth >= 0
    }

    pub fn file_size_exceeded(&self, size: u64) -> bool {
        self.apply && size > self.max_file_size
    }

    pub fn total_size_exceeded(&self, total: u64) -> bool {
        self.apply && total > self.max_total_size
    }

    pub fn file_count_exceeded(&self, count: u64) -> bool {
        self.apply && count > self.max_file_count
    }

    pub fn depth_exceeded(&self, depth: i64) -> bool {
        self.depth_bounded() && depth > self.max_depth
    }
}

impl Default for Limits {
    fn default() -> Self {
        Limits::default_limits()
    }
}
