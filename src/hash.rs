/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::hash::Hasher;
use std::io::Read;
use std::path::Path;

use sha2::Digest;
use twox_hash::XxHash64;

use crate::errors::{Error, ErrorKind, Result};
use crate::filesystem::FileSystem;

const HASH_CHUNK_SIZE: usize = 32 * 1024;

/// Streaming hash capability consumed by the filesystem facade.
pub trait FileHasher: Send + Sync {
    fn algorithm(&self) -> &str;

    /// Hex digest of the full stream.
    fn hash(&self, reader: &mut dyn Read) -> Result<String>;
}

/// xxHash64 hasher.
#[derive(Debug, Default)]
pub struct XxFileHasher;

impl FileHasher for XxFileHasher {
    fn algorithm(&self) -> &str {
        "xxhash64"
    }

    fn hash(&self, reader: &mut dyn Read) -> Result<String> {
        let mut hasher = XxHash64::default();
        let mut chunk = [0u8; HASH_CHUNK_SIZE];
        loop {
            match reader.read(&mut chunk) {
                Ok(0) => return Ok(format!("{:016x}", hasher.finish())),
                Ok(n) => hasher.write(&chunk[..n]),
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }
}

/// SHA-256 hasher.
#[derive(Debug, Default)]
pub struct Sha256FileHasher;

impl FileHasher for Sha256FileHasher {
    fn algorithm(&self) -> &str {
        "sha256"
    }

    fn hash(&self, reader: &mut dyn Read) -> Result<String> {
        let mut hasher = sha2::Sha256::new();
        let mut chunk = [0u8; HASH_CHUNK_SIZE];
        loop {
            match reader.read(&mut chunk) {
                Ok(0) => {
                    let digest = hasher.finalize();
                    return Ok(digest
                        .iter()
                        .map(|byte| format!("{:02x}", byte))
                        .collect());
                }
                Ok(n) => hasher.update(&chunk[..n]),
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }
}

/// Opens `path` on `fs` and streams it into the injected hasher.
pub fn file_hash<F: FileSystem + ?Sized>(
    fs: &F,
    hasher: &dyn FileHasher,
    path: &Path,
) -> Result<String> {
    if !fs.is_file(path)? {
        return Err(Error::new(
            ErrorKind::Invalid,
            format!("cannot hash '{}': not a file", path.display()),
        ));
    }
    let mut file = fs.generic_open(path)?;
    let digest = hasher.hash(&mut file);
    file.close()?;
    digest
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::{FileMode, MemFs};

    #[test]
    fn test_sha256_known_digest() {
        let fs = MemFs::new();
        fs.write_file(Path::new("/f"), b"abc", FileMode::regular(0o644)).unwrap();
        let digest = file_hash(&fs, &Sha256FileHasher, Path::new("/f")).unwrap();
        assert_eq!(
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad",
            digest
        );
    }

    #[test]
    fn test_xxhash_is_stable() {
        let fs = MemFs::new();
        fs.write_file(Path::new("/f"), b"same bytes", FileMode::regular(0o644))
            .unwrap();
        let first = file_hash(&fs, &XxFileHasher, Path::new("/f")).unwrap();
        let second = file_hash(&fs, &XxFileHasher, Path::new("/f")).unwrap();
        assert_eq!(first, second);
        assert_eq!(16, first.len());
    }

    #[test]
    fn test_hashing_directory_fails() {
        let fs = MemFs::new();
        fs.mk_dir(Path::new("/d")).unwrap();
        let err = file_hash(&fs, &XxFileHasher, Path::new("/d")).unwrap_err();
        assert_eq!(ErrorKind::Invalid, err.kind());
    }

    #[test]
    fn test_algorithm_names() {
        assert_eq!("xxhash64", XxFileHasher.algorithm());
        assert_eq!("sha256", Sha256FileHasher.algorithm());
    }
}
