/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use log::debug;
use zip::ZipArchive;

use crate::context::Context;
use crate::encoding::{recover_utf8, EncodingDetector};
use crate::errors::{Error, ErrorKind, Result};
use crate::filesystem::{FileMode, FileSystem, OpenFlags};
use crate::fspath;
use crate::limits::Limits;
use crate::transfer::{copy_n, copy_stream};
use crate::walk::{walk, WalkControl};

const SNIFF_LENGTH: usize = 512;

/// MIME types accepted by the structural probe.
const ZIP_MIME_TYPES: [&str; 5] = [
    "application/zip",
    "application/x-zip",
    "application/x-zip-compressed",
    "application/jar",
    "application/epub+zip",
];

/// Extensions accepted by the fallback probe when the file does not exist.
const ZIP_FILE_EXTENSIONS: [&str; 14] = [
    ".zip", ".zipx", ".7z", ".s7z", ".gz", ".tar.gz", ".tgz", ".xz", ".lz", ".lzma", ".rz",
    ".pack", ".z", ".jar",
];

/// Structural zip probe. An existing file is sniffed by content (up to 512
/// bytes) against a closed MIME set; a missing file falls back to a closed
/// extension set.
pub fn is_zip<F: FileSystem + ?Sized>(fs: &F, path: &Path) -> Result<bool> {
    if fs.exists(path) {
        if !fs.is_file(path)? {
            return Ok(false);
        }
        let mut file = fs.generic_open(path)?;
        let mut head = [0u8; SNIFF_LENGTH];
        let mut filled = 0;
        while filled < head.len() {
            match file.read(&mut head[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    let _ = file.close();
                    return Err(err.into());
                }
            }
        }
        file.close()?;
        Ok(sniff_mime(&head[..filled])
            .map(|mime| ZIP_MIME_TYPES.contains(&mime))
            .unwrap_or(false))
    } else {
        let name = fspath::base(path).to_lowercase();
        Ok(ZIP_FILE_EXTENSIONS
            .iter()
            .any(|extension| name.ends_with(extension)))
    }
}

/// Matches the zip container signatures (regular, empty and spanned
/// archives all start with a `PK` record).
fn sniff_mime(head: &[u8]) -> Option<&'static str> {
    if head.len() < 4 {
        return None;
    }
    match &head[..4] {
        b"PK\x03\x04" | b"PK\x05\x06" | b"PK\x07\x08" => {
            // an epub is a zip whose first entry declares its mime type
            if find_subsequence(head, b"application/epub+zip") {
                Some("application/epub+zip")
            } else {
                Some("application/zip")
            }
        }
        _ => None,
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() || haystack.len() < needle.len() {
        return false;
    }
    haystack.windows(needle.len()).any(|window| window == needle)
}

/// Extracts `source` into the directory `destination`.
///
/// Hardened against path traversal (`Malicious`), zip bombs (`TooLarge` on
/// any of total size, file count or nesting depth) and non-UTF-8 entry
/// names (recovered through the injected detector). With
/// `limits.recursive`, entries that are themselves zip archives expand into
/// a sibling directory named after their stem and the intermediate archive
/// is deleted.
///
/// Returns the extracted paths in central-directory order, expanded entries
/// replaced by their children in-line. Partial state left behind by a
/// failed extraction is the caller's to clean up.
pub fn unzip<F: FileSystem + ?Sized>(
    ctx: &Context,
    fs: &F,
    detector: &dyn EncodingDetector,
    source: &Path,
    destination: &Path,
    limits: &Limits,
) -> Result<Vec<PathBuf>> {
    let extraction = unzip_at_depth(ctx, fs, detector, source, destination, limits, 0)?;
    Ok(extraction.paths)
}

struct Extraction {
    paths: Vec<PathBuf>,
    bytes_on_disk: u64,
    files_on_disk: u64,
}

fn unzip_at_depth<F: FileSystem + ?Sized>(
    ctx: &Context,
    fs: &F,
    detector: &dyn EncodingDetector,
    source: &Path,
    destination: &Path,
    limits: &Limits,
    current_depth: i64,
) -> Result<Extraction> {
    ctx.check()?;
    if limits.depth_exceeded(current_depth) {
        return Err(Error::new(
            ErrorKind::TooLarge,
            format!(
                "zip nesting depth {} exceeds the maximum of {}",
                current_depth, limits.max_depth
            ),
        ));
    }
    if !fs.exists(source) {
        return Err(Error::new(
            ErrorKind::NotFound,
            format!("no such archive: '{}'", source.display()),
        ));
    }
    let source_size = fs.file_size(source)?;
    if limits.file_size_exceeded(source_size) {
        return Err(Error::new(
            ErrorKind::TooLarge,
            format!(
                "archive '{}' exceeds the maximum file size of {} B",
                source.display(),
                limits.max_file_size
            ),
        ));
    }

    let reader = fs.generic_open(source)?;
    let mut archive = ZipArchive::new(reader)?;

    let destination = fspath::clean(destination);
    fs.mk_dir(&destination)?;
    debug!(
        "extracting '{}' ({} entries) into '{}'",
        source.display(),
        archive.len(),
        destination.display()
    );

    let mut extraction = Extraction {
        paths: Vec::new(),
        bytes_on_disk: 0,
        files_on_disk: 0,
    };
    let mut directory_times: Vec<(PathBuf, SystemTime)> = Vec::new();

    for position in 0..archive.len() {
        ctx.check()?;
        let (candidate, entry_size, entry_mode, entry_time, is_dir) = {
            let entry = archive.by_index_raw(position)?;
            let raw_name = entry.name_raw().to_vec();
            let entry_name = recover_utf8(detector, &raw_name)?;
            let candidate = fspath::sanitise_zip_extract_path(&destination, &entry_name)?;
            let mode = entry.unix_mode().map(|raw| raw & 0o777).unwrap_or(0o644);
            let time = entry
                .last_modified()
                .and_then(|dt| time::OffsetDateTime::try_from(dt).ok())
                .map(SystemTime::from);
            (candidate, entry.size(), mode, time, entry.is_dir())
        };

        let file_depth = fspath::file_tree_depth(&destination, &candidate)? + current_depth;
        if limits.depth_exceeded(file_depth) {
            return Err(Error::new(
                ErrorKind::TooLarge,
                format!(
                    "entry '{}' sits {} levels deep, deeper than the maximum of {}",
                    candidate.display(),
                    file_depth,
                    limits.max_depth
                ),
            ));
        }

        if is_dir {
            fs.mk_dir(&candidate)?;
            if let Some(time) = entry_time {
                directory_times.push((candidate.clone(), time));
            }
            extraction.paths.push(candidate);
            extraction.files_on_disk += 1;
            check_tallies(limits, &extraction)?;
            continue;
        }

        fs.mk_dir(&fspath::dir(&candidate))?;
        if limits.file_size_exceeded(entry_size) {
            return Err(Error::new(
                ErrorKind::TooLarge,
                format!(
                    "entry '{}' declares {} B, more than the maximum file size of {} B",
                    candidate.display(),
                    entry_size,
                    limits.max_file_size
                ),
            ));
        }
        unzip_entry(ctx, fs, &mut archive, position, &candidate, entry_mode, entry_size)?;
        if let Some(time) = entry_time {
            fs.chtimes(&candidate, time, time)?;
        }

        if limits.recursive && is_zip(fs, &candidate)? {
            let nested_destination =
                fspath::dir(&candidate).join(fspath::filepath_stem(&candidate));
            let nested = unzip_at_depth(
                ctx,
                fs,
                detector,
                &candidate,
                &nested_destination,
                limits,
                file_depth + 1,
            )?;
            fs.remove_file(&candidate)?;
            // the expanded children replace the intermediate archive, and
            // only their on-disk footprint counts
            extraction.paths.extend(nested.paths);
            extraction.bytes_on_disk += nested.bytes_on_disk;
            extraction.files_on_disk += nested.files_on_disk;
        } else {
            extraction.paths.push(candidate);
            extraction.bytes_on_disk += entry_size;
            extraction.files_on_disk += 1;
        }
        check_tallies(limits, &extraction)?;
    }

    for (directory, time) in directory_times {
        ctx.check()?;
        fs.chtimes(&directory, time, time)?;
    }

    Ok(extraction)
}

fn check_tallies(limits: &Limits, extraction: &Extraction) -> Result<()> {
    if limits.total_size_exceeded(extraction.bytes_on_disk) {
        return Err(Error::new(
            ErrorKind::TooLarge,
            format!(
                "extraction reached {} B on disk, more than the maximum total of {} B",
                extraction.bytes_on_disk, limits.max_total_size
            ),
        ));
    }
    if limits.file_count_exceeded(extraction.files_on_disk) {
        return Err(Error::new(
            ErrorKind::TooLarge,
            format!(
                "extraction reached {} entries, more than the maximum of {}",
                extraction.files_on_disk, limits.max_file_count
            ),
        ));
    }
    Ok(())
}

fn unzip_entry<F: FileSystem + ?Sized, R: Read + std::io::Seek>(
    ctx: &Context,
    fs: &F,
    archive: &mut ZipArchive<R>,
    position: usize,
    target: &Path,
    permissions: u32,
    declared_size: u64,
) -> Result<()> {
    let mut writer = fs.open_file(
        target,
        OpenFlags::WRITE_ONLY | OpenFlags::CREATE | OpenFlags::TRUNCATE,
        FileMode::regular(permissions),
    )?;
    let mut entry = archive.by_index(position)?;
    let copied = copy_n(ctx, &mut entry, writer.as_mut(), declared_size);
    drop(entry);
    let closed = writer.close();
    copied?;
    closed
}

/// Archives the directory `source` into the zip file `destination`.
///
/// Entries are DEFLATE-compressed with their source modification times;
/// directories get explicit `/`-suffixed entries, symlinks store their
/// target path. Every regular entry (and the finished archive itself) is
/// bounded by `limits.max_file_size`.
pub fn zip_directory<F: FileSystem + ?Sized>(
    ctx: &Context,
    fs: &F,
    source: &Path,
    destination: &Path,
    limits: &Limits,
) -> Result<()> {
    ctx.check()?;
    if !fs.is_dir(source)? {
        return Err(Error::new(
            ErrorKind::Invalid,
            format!("'{}' is not a directory", source.display()),
        ));
    }
    let source = fspath::clean(source);
    let archive_file = fs.open_file(
        destination,
        OpenFlags::WRITE_ONLY | OpenFlags::CREATE | OpenFlags::TRUNCATE,
        FileMode::regular(0o644),
    )?;
    let mut writer = zip::ZipWriter::new(archive_file);

    let prefix = fspath::base(&source);
    let result = walk(ctx, fs, &source, &mut |path, entry| {
        let info = entry.map_err(|err| Error::new(err.kind(), err.to_string()))?;
        if path == source {
            return Ok(WalkControl::Continue);
        }
        // entries carry the source directory's name as their top level
        let name = Path::new(&prefix)
            .join(fspath::rel(&source, path)?)
            .to_string_lossy()
            .into_owned();
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .unix_permissions(info.mode().permissions())
            .last_modified_time(
                zip::DateTime::try_from(time::OffsetDateTime::from(info.mod_time()))
                    .unwrap_or_default(),
            );
        if info.is_dir() {
            writer.add_directory(name, options)?;
            return Ok(WalkControl::Continue);
        }
        if info.is_symlink() {
            let target = fs.readlink(path)?;
            writer.start_file(name, options)?;
            std::io::Write::write_all(&mut writer, target.to_string_lossy().as_bytes())?;
            return Ok(WalkControl::Continue);
        }
        if limits.file_size_exceeded(info.size()) {
            return Err(Error::new(
                ErrorKind::TooLarge,
                format!(
                    "file '{}' exceeds the maximum size of {} B",
                    path.display(),
                    limits.max_file_size
                ),
            ));
        }
        writer.start_file(name, options)?;
        let mut reader = fs.generic_open(path)?;
        let written = copy_stream(ctx, reader.as_mut(), &mut writer);
        reader.close()?;
        let written = written?;
        if written != info.size() {
            return Err(Error::new(
                ErrorKind::Unexpected,
                format!(
                    "short write archiving '{}': {} of {} B",
                    path.display(),
                    written,
                    info.size()
                ),
            ));
        }
        Ok(WalkControl::Continue)
    });

    match result {
        Ok(()) => {
            let mut archive_file = writer.finish().map_err(Error::from)?;
            archive_file.close()?;
            if limits.file_size_exceeded(fs.file_size(destination)?) {
                return Err(Error::new(
                    ErrorKind::TooLarge,
                    format!(
                        "archive '{}' exceeds the maximum file size of {} B",
                        destination.display(),
                        limits.max_file_size
                    ),
                ));
            }
            Ok(())
        }
        Err(err) => {
            // release the half-written archive handle before surfacing
            if let Ok(mut archive_file) = writer.finish() {
                let _ = archive_file.close();
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::CharsetDetector;
    use crate::filesystem::MemFs;
    use std::io::Write;
    use std::time::Duration;

    fn background() -> Context {
        Context::background()
    }

    fn build_tree(fs: &MemFs, files: &[(&str, &str)]) {
        for (path, content) in files {
            let path = Path::new(path);
            if let Some(parent) = path.parent() {
                fs.mk_dir(parent).unwrap();
            }
            fs.write_file(path, content.as_bytes(), FileMode::regular(0o644))
                .unwrap();
        }
    }

    fn raw_zip_with_entries(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        for (name, content) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(content).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_round_trip_preserves_paths_content_and_times() {
        let fs = MemFs::new();
        build_tree(
            &fs,
            &[
                ("/tree/a.txt", "hello"),
                ("/tree/sub/b.txt", "nested content"),
                ("/tree/sub/deeper/c.bin", "binary-ish"),
            ],
        );
        let stamp = SystemTime::now() - Duration::from_secs(3);
        fs.chtimes(Path::new("/tree/a.txt"), stamp, stamp).unwrap();

        zip_directory(
            &background(),
            &fs,
            Path::new("/tree"),
            Path::new("/out.zip"),
            &Limits::default_zip_limits(),
        )
        .unwrap();
        assert!(is_zip(&fs, Path::new("/out.zip")).unwrap());

        let extracted = unzip(
            &background(),
            &fs,
            &CharsetDetector,
            Path::new("/out.zip"),
            Path::new("/restored"),
            &Limits::default_zip_limits(),
        )
        .unwrap();
        // the archive carries the source directory's name as its top level
        assert!(extracted.contains(&PathBuf::from("/restored/tree/a.txt")));
        assert_eq!(
            b"hello".to_vec(),
            fs.read_file(Path::new("/restored/tree/a.txt")).unwrap()
        );
        assert_eq!(
            b"nested content".to_vec(),
            fs.read_file(Path::new("/restored/tree/sub/b.txt")).unwrap()
        );
        let original = stamp;
        let restored = fs.stat(Path::new("/restored/tree/a.txt")).unwrap().mod_time();
        let drift = match restored.duration_since(original) {
            Ok(duration) => duration,
            Err(err) => err.duration(),
        };
        // zip timestamps have MS-DOS 2-second resolution
        assert!(drift <= Duration::from_secs(2), "drift was {:?}", drift);
    }

    #[test]
    fn test_unzip_missing_source_not_found() {
        let fs = MemFs::new();
        let err = unzip(
            &background(),
            &fs,
            &CharsetDetector,
            Path::new("/absent.zip"),
            Path::new("/out"),
            &Limits::default_zip_limits(),
        )
        .unwrap_err();
        assert_eq!(ErrorKind::NotFound, err.kind());
    }

    #[test]
    fn test_unzip_rejects_zip_slip() {
        let fs = MemFs::new();
        fs.mk_dir(Path::new("/dest")).unwrap();
        let bytes = raw_zip_with_entries(&[("../evil.txt", b"gotcha")]);
        fs.write_file(Path::new("/slip.zip"), &bytes, FileMode::regular(0o644))
            .unwrap();
        let err = unzip(
            &background(),
            &fs,
            &CharsetDetector,
            Path::new("/slip.zip"),
            Path::new("/dest"),
            &Limits::default_zip_limits(),
        )
        .unwrap_err();
        assert_eq!(ErrorKind::Malicious, err.kind());
        assert!(!fs.exists(Path::new("/evil.txt")));
    }

    #[test]
    fn test_unzip_enforces_file_count() {
        let fs = MemFs::new();
        let entries: Vec<(String, Vec<u8>)> = (0..11)
            .map(|i| (format!("f{}.txt", i), vec![b'x'; 4]))
            .collect();
        let borrowed: Vec<(&str, &[u8])> = entries
            .iter()
            .map(|(name, content)| (name.as_str(), content.as_slice()))
            .collect();
        let bytes = raw_zip_with_entries(&borrowed);
        fs.write_file(Path::new("/many.zip"), &bytes, FileMode::regular(0o644))
            .unwrap();

        let strict = Limits::new(crate::limits::GIBIBYTE, crate::limits::GIBIBYTE, 10, -1, false);
        let err = unzip(
            &background(),
            &fs,
            &CharsetDetector,
            Path::new("/many.zip"),
            Path::new("/strict"),
            &strict,
        )
        .unwrap_err();
        assert_eq!(ErrorKind::TooLarge, err.kind());

        let relaxed = Limits::new(crate::limits::GIBIBYTE, crate::limits::GIBIBYTE, 100, -1, false);
        let extracted = unzip(
            &background(),
            &fs,
            &CharsetDetector,
            Path::new("/many.zip"),
            Path::new("/relaxed"),
            &relaxed,
        )
        .unwrap();
        assert_eq!(11, extracted.len());
    }

    #[test]
    fn test_unzip_enforces_total_size() {
        let fs = MemFs::new();
        let big = vec![b'a'; 4096];
        let bytes = raw_zip_with_entries(&[("one.bin", big.as_slice()), ("two.bin", big.as_slice())]);
        fs.write_file(Path::new("/big.zip"), &bytes, FileMode::regular(0o644))
            .unwrap();
        let limits = Limits::new(crate::limits::GIBIBYTE, 5000, 1000, -1, false);
        let err = unzip(
            &background(),
            &fs,
            &CharsetDetector,
            Path::new("/big.zip"),
            Path::new("/out"),
            &limits,
        )
        .unwrap_err();
        assert_eq!(ErrorKind::TooLarge, err.kind());
    }

    #[test]
    fn test_unzip_zero_max_file_size_forbids_all_files() {
        let fs = MemFs::new();
        let bytes = raw_zip_with_entries(&[("f.txt", b"x")]);
        fs.write_file(Path::new("/one.zip"), &bytes, FileMode::regular(0o644))
            .unwrap();
        let limits = Limits::new(0, crate::limits::GIBIBYTE, 1000, -1, false);
        let err = unzip(
            &background(),
            &fs,
            &CharsetDetector,
            Path::new("/one.zip"),
            Path::new("/out"),
            &limits,
        )
        .unwrap_err();
        assert_eq!(ErrorKind::TooLarge, err.kind());
    }

    #[test]
    fn test_recursive_expansion_of_nested_archive() {
        let fs = MemFs::new();
        let inner = raw_zip_with_entries(&[("inner.txt", b"nested payload")]);
        let outer = raw_zip_with_entries(&[("plain.txt", b"top"), ("inner.zip", inner.as_slice())]);
        fs.write_file(Path::new("/outer.zip"), &outer, FileMode::regular(0o644))
            .unwrap();

        let extracted = unzip(
            &background(),
            &fs,
            &CharsetDetector,
            Path::new("/outer.zip"),
            Path::new("/out"),
            &Limits::recursive_zip_limits(5),
        )
        .unwrap();

        assert!(extracted.contains(&PathBuf::from("/out/plain.txt")));
        assert!(extracted.contains(&PathBuf::from("/out/inner/inner.txt")));
        assert!(!extracted.contains(&PathBuf::from("/out/inner.zip")));
        // the intermediate archive is deleted after expansion
        assert!(!fs.exists(Path::new("/out/inner.zip")));
        assert_eq!(
            b"nested payload".to_vec(),
            fs.read_file(Path::new("/out/inner/inner.txt")).unwrap()
        );
    }

    #[test]
    fn test_nested_depth_bound_stops_recursion() {
        let fs = MemFs::new();
        let level0 = raw_zip_with_entries(&[("leaf.txt", b"bottom")]);
        let level1 = raw_zip_with_entries(&[("l1.zip", level0.as_slice())]);
        let level2 = raw_zip_with_entries(&[("l2.zip", level1.as_slice())]);
        fs.write_file(Path::new("/deep.zip"), &level2, FileMode::regular(0o644))
            .unwrap();
        let err = unzip(
            &background(),
            &fs,
            &CharsetDetector,
            Path::new("/deep.zip"),
            Path::new("/out"),
            &Limits::recursive_zip_limits(1),
        )
        .unwrap_err();
        assert_eq!(ErrorKind::TooLarge, err.kind());
    }

    #[test]
    fn test_non_recursive_keeps_nested_archive() {
        let fs = MemFs::new();
        let inner = raw_zip_with_entries(&[("inner.txt", b"nested")]);
        let outer = raw_zip_with_entries(&[("inner.zip", inner.as_slice())]);
        fs.write_file(Path::new("/outer.zip"), &outer, FileMode::regular(0o644))
            .unwrap();
        let extracted = unzip(
            &background(),
            &fs,
            &CharsetDetector,
            Path::new("/outer.zip"),
            Path::new("/out"),
            &Limits::default_non_recursive_zip_limits(),
        )
        .unwrap();
        assert_eq!(vec![PathBuf::from("/out/inner.zip")], extracted);
        assert!(fs.exists(Path::new("/out/inner.zip")));
    }

    #[test]
    fn test_unzip_cancelled_context() {
        let fs = MemFs::new();
        let bytes = raw_zip_with_entries(&[("f.txt", b"x")]);
        fs.write_file(Path::new("/a.zip"), &bytes, FileMode::regular(0o644))
            .unwrap();
        let (ctx, cancel) = Context::background().with_cancel();
        cancel.cancel();
        let err = unzip(
            &ctx,
            &fs,
            &CharsetDetector,
            Path::new("/a.zip"),
            Path::new("/out"),
            &Limits::default_zip_limits(),
        )
        .unwrap_err();
        assert_eq!(ErrorKind::Cancelled, err.kind());
        assert!(!fs.exists(Path::new("/out/f.txt")));
    }

    #[test]
    fn test_corrupt_archive_is_invalid() {
        let fs = MemFs::new();
        fs.write_file(
            Path::new("/junk.zip"),
            b"PK\x03\x04 but then garbage follows here",
            FileMode::regular(0o644),
        )
        .unwrap();
        let err = unzip(
            &background(),
            &fs,
            &CharsetDetector,
            Path::new("/junk.zip"),
            Path::new("/out"),
            &Limits::default_zip_limits(),
        )
        .unwrap_err();
        assert!(err.any(&[ErrorKind::Invalid, ErrorKind::Unsupported]));
    }

    // Minimal stored-entry zip with a raw (non-UTF-8) name, built by hand so
    // the name bytes reach the decoder untouched.
    fn stored_zip_with_raw_name(name: &[u8], content: &[u8]) -> Vec<u8> {
        fn crc32(data: &[u8]) -> u32 {
            let mut crc = 0xFFFF_FFFFu32;
            for &byte in data {
                crc ^= byte as u32;
                for _ in 0..8 {
                    crc = if crc & 1 != 0 {
                        (crc >> 1) ^ 0xEDB8_8320
                    } else {
                        crc >> 1
                    };
                }
            }
            !crc
        }
        let checksum = crc32(content);
        let mut bytes = Vec::new();
        // local file header
        bytes.extend_from_slice(b"PK\x03\x04");
        bytes.extend_from_slice(&20u16.to_le_bytes());
        bytes.extend_from_slice(&0u16.to_le_bytes()); // flags: not UTF-8
        bytes.extend_from_slice(&0u16.to_le_bytes()); // stored
        bytes.extend_from_slice(&0u16.to_le_bytes()); // time
        bytes.extend_from_slice(&0x21u16.to_le_bytes()); // date
        bytes.extend_from_slice(&checksum.to_le_bytes());
        bytes.extend_from_slice(&(content.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&(content.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&(name.len() as u16).to_le_bytes());
        bytes.extend_from_slice(&0u16.to_le_bytes());
        bytes.extend_from_slice(name);
        bytes.extend_from_slice(content);
        let central_offset = bytes.len() as u32;
        // central directory
        bytes.extend_from_slice(b"PK\x01\x02");
        bytes.extend_from_slice(&20u16.to_le_bytes());
        bytes.extend_from_slice(&20u16.to_le_bytes());
        bytes.extend_from_slice(&0u16.to_le_bytes());
        bytes.extend_from_slice(&0u16.to_le_bytes());
        bytes.extend_from_slice(&0u16.to_le_bytes());
        bytes.extend_from_slice(&0x21u16.to_le_bytes());
        bytes.extend_from_slice(&checksum.to_le_bytes());
        bytes.extend_from_slice(&(content.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&(content.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&(name.len() as u16).to_le_bytes());
        bytes.extend_from_slice(&0u16.to_le_bytes()); // extra len
        bytes.extend_from_slice(&0u16.to_le_bytes()); // comment len
        bytes.extend_from_slice(&0u16.to_le_bytes()); // disk start
        bytes.extend_from_slice(&0u16.to_le_bytes()); // internal attrs
        bytes.extend_from_slice(&0u32.to_le_bytes()); // external attrs
        bytes.extend_from_slice(&0u32.to_le_bytes()); // local header offset
        bytes.extend_from_slice(name);
        let central_size = bytes.len() as u32 - central_offset;
        // end of central directory
        bytes.extend_from_slice(b"PK\x05\x06");
        bytes.extend_from_slice(&0u16.to_le_bytes());
        bytes.extend_from_slice(&0u16.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&central_size.to_le_bytes());
        bytes.extend_from_slice(&central_offset.to_le_bytes());
        bytes.extend_from_slice(&0u16.to_le_bytes());
        bytes
    }

    #[test]
    fn test_non_utf8_entry_name_is_recovered() {
        let fs = MemFs::new();
        // "サンプル.txt" in Shift-JIS
        let raw_name = b"\x83T\x83\x93\x83v\x83\x8b.txt";
        let bytes = stored_zip_with_raw_name(raw_name, b"recovered content");
        fs.write_file(Path::new("/sjis.zip"), &bytes, FileMode::regular(0o644))
            .unwrap();
        let extracted = unzip(
            &background(),
            &fs,
            &CharsetDetector,
            Path::new("/sjis.zip"),
            Path::new("/out"),
            &Limits::default_zip_limits(),
        )
        .unwrap();
        assert_eq!(1, extracted.len());
        let name = fspath::base(&extracted[0]);
        assert!(std::str::from_utf8(name.as_bytes()).is_ok());
        assert!(name.contains(".txt"));
        assert_eq!(
            b"recovered content".to_vec(),
            fs.read_file(&extracted[0]).unwrap()
        );
    }

    #[test]
    fn test_is_zip_probes() {
        let fs = MemFs::new();
        let bytes = raw_zip_with_entries(&[("f.txt", b"x")]);
        fs.write_file(Path::new("/real.zip"), &bytes, FileMode::regular(0o644))
            .unwrap();
        fs.write_file(Path::new("/fake.zip"), b"plain text", FileMode::regular(0o644))
            .unwrap();
        assert!(is_zip(&fs, Path::new("/real.zip")).unwrap());
        // content wins over extension for existing files
        assert!(!is_zip(&fs, Path::new("/fake.zip")).unwrap());
        // extension fallback for missing files
        assert!(is_zip(&fs, Path::new("/missing.tar.gz")).unwrap());
        assert!(is_zip(&fs, Path::new("/missing.jar")).unwrap());
        assert!(!is_zip(&fs, Path::new("/missing.txt")).unwrap());
    }

    #[test]
    fn test_zip_directory_bounds_archived_files() {
        let fs = MemFs::new();
        build_tree(&fs, &[("/tree/big.bin", "0123456789")]);
        let limits = Limits::new(5, crate::limits::GIBIBYTE, 1000, -1, false);
        let err = zip_directory(
            &background(),
            &fs,
            Path::new("/tree"),
            Path::new("/out.zip"),
            &limits,
        )
        .unwrap_err();
        assert_eq!(ErrorKind::TooLarge, err.kind());
    }
}
