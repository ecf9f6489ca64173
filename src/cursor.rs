// SPDX-License-Identifier: Apache-2.0

#![warn(missing_docs)]

//! Opaque pagination tokens for the _Features_ endpoints.
//!
//! An encoded cursor is the URL-safe base64 form of the byte sequence
//! `minimal-big-endian(fid) '|' checksum` where _checksum_ is a digest of
//! the active (non-cursor) query parameters.  Binding the token to that
//! digest keeps a client from re-using a page position after it changed
//! the filters under its own feet.
//!

use base64::{Engine, engine::general_purpose::URL_SAFE};
use tracing::info;

/// Separator between the feature ID prefix and the checksum suffix.
const SEPARATOR: u8 = b'|';

/// A successfully decoded pagination token.
///
/// Decoding is _total_: any malformed input collapses to the first page
/// (`fid == 0`) carrying the caller-supplied checksum.  Cursor noise is
/// user-facing, never a fault.
#[derive(Debug, PartialEq, Eq)]
pub struct DecodedCursor {
    fid: i64,
    checksum: Vec<u8>,
}

impl DecodedCursor {
    /// Decode `encoded` expecting it to be bound to `checksum`.
    pub fn decode(encoded: &str, checksum: &[u8]) -> Self {
        let start = Self {
            fid: 0,
            checksum: checksum.to_vec(),
        };
        if encoded.is_empty() {
            return start;
        }
        let ba = match URL_SAFE.decode(encoded) {
            Ok(x) => x,
            Err(x) => {
                info!("Failed base64-decoding ({encoded}) cursor: {x}");
                return start;
            }
        };
        // the FID prefix may itself contain the separator byte, so the
        // split counts from the end using the fixed checksum width.
        if ba.len() < checksum.len() + 1 {
            info!("Cursor too short. Resetting to 1st page");
            return start;
        }
        let at = ba.len() - checksum.len() - 1;
        if ba[at] != SEPARATOR {
            info!("Cursor w/o separator. Resetting to 1st page");
            return start;
        }
        let (prefix, suffix) = (&ba[..at], &ba[at + 1..]);
        if prefix.len() > size_of::<u64>() {
            info!("Cursor FID prefix too long. Resetting to 1st page");
            return start;
        }
        let mut be = [0u8; size_of::<u64>()];
        be[size_of::<u64>() - prefix.len()..].copy_from_slice(prefix);
        let fid = match i64::try_from(u64::from_be_bytes(be)) {
            Ok(x) => x,
            Err(_) => {
                info!("Cursor FID overflows i64. Resetting to 1st page");
                return start;
            }
        };
        if suffix != checksum {
            info!("Cursor checksum mismatch. Filters changed; resetting to 1st page");
            return start;
        }
        Self {
            fid,
            checksum: checksum.to_vec(),
        }
    }

    /// Return the feature ID this cursor points at; `0` means first page.
    pub fn fid(&self) -> i64 {
        self.fid
    }

    /// Return the filters checksum this cursor is bound to.
    pub fn checksum(&self) -> &[u8] {
        &self.checksum
    }
}

/// Encode a `(fid, checksum)` pair into its opaque URL-safe form.
///
/// The FID prefix is its big-endian byte representation w/ leading zero
/// bytes stripped; `0` encodes to an empty prefix.  Negative values are
/// possible only through corruption and clamp to `0`.
pub fn encode(fid: i64, checksum: &[u8]) -> String {
    let fid = fid.max(0) as u64;
    let be = fid.to_be_bytes();
    let first = be.iter().position(|x| *x != 0).unwrap_or(be.len());
    let mut ba = Vec::with_capacity(be.len() + 1 + checksum.len());
    ba.extend_from_slice(&be[first..]);
    ba.push(SEPARATOR);
    ba.extend_from_slice(checksum);
    URL_SAFE.encode(ba)
}

/// The pair of navigation tokens attached to a _FeatureCollection_ page.
#[derive(Debug)]
pub struct Cursors {
    /// Token for the page preceding the current one.
    pub prev: String,
    /// Token for the page following the current one.
    pub next: String,
    /// `true` iff a previous page exists.
    pub has_prev: bool,
    /// `true` iff a next page exists.
    pub has_next: bool,
}

impl Cursors {
    /// Wrap the `(prevFid, nextFid)` pair produced by the datasource w/ the
    /// request's filters checksum.  A non-positive FID on either side means
    /// that side has no page.
    pub fn new(prev_fid: i64, next_fid: i64, checksum: &[u8]) -> Self {
        Self {
            prev: encode(prev_fid.max(0), checksum),
            next: encode(next_fid.max(0), checksum),
            has_prev: prev_fid > 0,
            has_next: next_fid > 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    const CS: &[u8] = &[0xAB, 0xCD, 0xEF, 0x01, 0x23, 0x45, 0x67, 0x89];

    #[test]
    fn test_round_trip() {
        for fid in [0, 1, 2, 127, 128, 255, 256, 65_535, 1 << 40, i64::MAX] {
            let it = DecodedCursor::decode(&encode(fid, CS), CS);
            assert_eq!(it.fid(), fid);
            assert_eq!(it.checksum(), CS);
        }
    }

    #[test]
    fn test_round_trip_with_separator_byte_in_fid() {
        // 124 is the separator itself; 97_281 carries it mid-prefix.
        for fid in [124, 97_281, 0x7C7C7C] {
            let it = DecodedCursor::decode(&encode(fid, CS), CS);
            assert_eq!(it.fid(), fid);
        }
    }

    #[test]
    fn test_zero_fid_has_empty_prefix() {
        let ba = URL_SAFE.decode(encode(0, CS)).unwrap();
        assert_eq!(ba[0], SEPARATOR);
        assert_eq!(&ba[1..], CS);
    }

    #[test]
    fn test_empty_input_is_first_page() {
        let it = DecodedCursor::decode("", CS);
        assert_eq!(it.fid(), 0);
        assert_eq!(it.checksum(), CS);
    }

    #[test]
    #[traced_test]
    fn test_garbage_is_first_page() {
        let it = DecodedCursor::decode("not@base64!", CS);
        assert_eq!(it.fid(), 0);
        assert_eq!(it.checksum(), CS);
    }

    #[test]
    fn test_missing_separator_is_first_page() {
        let encoded = URL_SAFE.encode([0x01, 0x02, 0x03]);
        let it = DecodedCursor::decode(&encoded, CS);
        assert_eq!(it.fid(), 0);
    }

    #[test]
    fn test_checksum_mismatch_resets_to_first_page() {
        let other: &[u8] = &[0x00; 8];
        let it = DecodedCursor::decode(&encode(42, other), CS);
        assert_eq!(it.fid(), 0);
        assert_eq!(it.checksum(), CS);
    }

    #[test]
    fn test_negative_fid_clamps_to_zero() {
        let it = DecodedCursor::decode(&encode(-7, CS), CS);
        assert_eq!(it.fid(), 0);
    }

    #[test]
    fn test_oversized_prefix_is_first_page() {
        let mut ba = vec![0xFF; 9];
        ba.push(SEPARATOR);
        ba.extend_from_slice(CS);
        let it = DecodedCursor::decode(&URL_SAFE.encode(ba), CS);
        assert_eq!(it.fid(), 0);
    }

    #[test]
    fn test_cursors_flags() {
        let it = Cursors::new(0, 3, CS);
        assert!(!it.has_prev);
        assert!(it.has_next);
        assert_eq!(DecodedCursor::decode(&it.next, CS).fid(), 3);

        let it = Cursors::new(1, 0, CS);
        assert!(it.has_prev);
        assert!(!it.has_next);
        assert_eq!(DecodedCursor::decode(&it.prev, CS).fid(), 1);
    }
}
