/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

mod embedfs;
mod file;
mod fs;
mod memfs;
mod osfs;
mod readonly;
mod tarfs;
mod types;
mod zipfs;

pub use embedfs::EmbedFs;
pub use file::{CloseCallback, File, UNSET_FILE_HANDLE};
pub use fs::{
    new_remote_lock_file, Chowner, FileSystem, ForceRemover, LinkReader, Linker, SymLinker,
};
pub use memfs::MemFs;
pub use osfs::{standard, OsFs};
pub use tarfs::TarFs;
pub use types::{
    FileInfo, FileMode, FileTimeInfo, FsType, OpenFlags, Owner, UsageStat,
};
pub use zipfs::ZipFs;
