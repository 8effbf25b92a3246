/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Portable filesystem abstraction.
//!
//! One [`FileSystem`](filesystem::FileSystem) contract over heterogeneous
//! backing stores (disk, memory, read-only zip/tar archives, embedded
//! assets), with the heavy machinery layered on top of it:
//!
//! * a recursive zip extraction engine hardened against path traversal and
//!   zip bombs ([`ziputil`]),
//! * a distributed lock built from filesystem primitives alone ([`lock`]),
//! * context-cancellable tree walking, copying and garbage collection
//!   ([`walk`], [`transfer`]).
//!
//! Long-running operations take a [`Context`](context::Context) and stop
//! promptly once it is cancelled or its deadline passes.

pub mod context;
pub mod encoding;
pub mod errors;
pub mod filesystem;
pub mod fspath;
pub mod hash;
pub mod limits;
pub mod lock;
pub mod transfer;
pub mod walk;
pub mod ziputil;

pub use context::{CancelFunc, Context};
pub use errors::{Error, ErrorKind, Result};
pub use filesystem::{
    new_remote_lock_file, standard, EmbedFs, File, FileInfo, FileMode, FileSystem, FileTimeInfo,
    FsType, MemFs, OpenFlags, OsFs, Owner, TarFs, UsageStat, ZipFs, UNSET_FILE_HANDLE,
};
pub use limits::Limits;
pub use lock::RemoteLockFile;
