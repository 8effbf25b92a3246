/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::io;
use std::path::Path;

use crate::errors::Result;
use crate::filesystem::types::FileInfo;

/// Marks handles on backends without OS-level descriptors.
pub const UNSET_FILE_HANDLE: u64 = u64::MAX;

/// Invoked exactly once after the underlying close succeeds.
pub type CloseCallback = Box<dyn FnOnce() + Send>;

/// An opened stream on some filesystem.
///
/// Byte I/O goes through the `io` supertraits so handles plug into
/// `io::copy` and friends. `close` is idempotent in effect: the first call
/// releases the handle, every later call (and any other operation on a
/// closed handle) fails with the stable closed error. Dropping an unclosed
/// handle closes it best-effort.
pub trait File: io::Read + io::Write + io::Seek + Send {
    /// Path the handle was opened with.
    fn path(&self) -> &Path;

    fn stat(&self) -> Result<FileInfo>;

    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize>;

    fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<usize>;

    fn truncate(&mut self, size: u64) -> Result<()>;

    fn sync(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()>;

    /// OS descriptor when the backend has one, `UNSET_FILE_HANDLE` otherwise.
    fn handle(&self) -> u64 {
        UNSET_FILE_HANDLE
    }

    /// Entries of the directory the handle points at; `count == 0` lists
    /// everything, otherwise at most `count` entries are returned and the
    /// cursor advances.
    fn read_dir(&mut self, count: usize) -> Result<Vec<FileInfo>>;

    fn read_dir_names(&mut self, count: usize) -> Result<Vec<String>> {
        Ok(self
            .read_dir(count)?
            .into_iter()
            .map(|info| info.name().to_owned())
            .collect())
    }

    /// Registers a callback run once after the underlying close succeeds.
    fn set_close_callback(&mut self, callback: CloseCallback);
}
