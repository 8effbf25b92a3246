/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use encoding_rs::Encoding;

use crate::errors::{Error, ErrorKind, Result};

/// Charset detection capability consumed by the zip engine to recover
/// non-UTF-8 entry names.
pub trait EncodingDetector: Send + Sync {
    /// Guesses the charset of `raw`, or `None` when no plausible charset is
    /// found.
    fn detect(&self, raw: &[u8]) -> Option<&'static Encoding>;
}

/// Shipped detector backed by `chardetng`.
#[derive(Debug, Default)]
pub struct CharsetDetector;

impl EncodingDetector for CharsetDetector {
    fn detect(&self, raw: &[u8]) -> Option<&'static Encoding> {
        if raw.is_empty() {
            return None;
        }
        let mut detector = chardetng::EncodingDetector::new();
        detector.feed(raw, true);
        Some(detector.guess(None, true))
    }
}

/// Converts `raw` to UTF-8 through the detector. Already-valid UTF-8 passes
/// through unchanged; detection failure is `Invalid`, conversion failure is
/// `Unexpected`.
pub fn recover_utf8(detector: &dyn EncodingDetector, raw: &[u8]) -> Result<String> {
    if let Ok(text) = std::str::from_utf8(raw) {
        return Ok(text.to_owned());
    }
    let encoding = detector.detect(raw).ok_or_else(|| {
        Error::new(
            ErrorKind::Invalid,
            "could not detect the charset of a non-UTF-8 name",
        )
    })?;
    let (decoded, _, had_errors) = encoding.decode(raw);
    if had_errors {
        return Err(Error::new(
            ErrorKind::Unexpected,
            format!("could not convert a non-UTF-8 name from {}", encoding.name()),
        ));
    }
    Ok(decoded.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utf8_passes_through() {
        let detector = CharsetDetector;
        assert_eq!("héllo.txt", recover_utf8(&detector, "héllo.txt".as_bytes()).unwrap());
    }

    #[test]
    fn test_ascii_passes_through() {
        let detector = CharsetDetector;
        assert_eq!("plain.txt", recover_utf8(&detector, b"plain.txt").unwrap());
    }

    #[test]
    fn test_shift_jis_name_is_recovered() {
        // "サンプル.txt" in Shift-JIS
        let raw = b"\x83T\x83\x93\x83v\x83\x8b.txt";
        let detector = CharsetDetector;
        let recovered = recover_utf8(&detector, raw).unwrap();
        assert!(std::str::from_utf8(recovered.as_bytes()).is_ok());
        assert!(recovered.ends_with(".txt"));
    }

    #[test]
    fn test_detection_failure_is_invalid() {
        struct NoDetector;
        impl EncodingDetector for NoDetector {
            fn detect(&self, _raw: &[u8]) -> Option<&'static Encoding> {
                None
            }
        }
        let err = recover_utf8(&NoDetector, b"\xff\xfe\xfd").unwrap_err();
        assert_eq!(ErrorKind::Invalid, err.kind());
    }
}
