// SPDX-License-Identifier: Apache-2.0

#![warn(missing_docs)]

//! Decoding of GeoPackage geometry BLOBs.
//!
//! Every GeoPackage binary value ([2.1.3.1.1. BLOB Format][1]) starts w/ a
//! header made of...
//! * 2-byte magic = 0x4750 which represents the ASCII 'GP';
//! * 1-byte version, an 8-bit unsigned integer, `0` = version 1;
//! * 1-byte flags w/ the following layout (from left bit #7 to right bit #0)
//!   bits #7 and #6 are reserved and are ignored.
//!   bit #5: X = `0` StandardGeoPackageBinary, or `1` ExtendedGeoPackageBinary.
//!   bit #4: Y = `0` for non-empty geometry, or `1` for an empty one.
//!   bits #3 #2 #1: envelope content indicator.
//!   bit #0: byte-order of the srs_id + envelope. `0` for BE, and `1` for LE.
//! * int32 srs_id;
//! * double[] envelope.
//!
//! The header is validated here; the WKB body that follows it is decoded to
//! a GeoJSON geometry by `geozero`.
//!
//! [1]: https://www.geopackage.org/spec140/index.html
//!

use crate::MyError;
use geozero::{ToJson, wkb::GpkgWkb};
use tracing::error;

/// Validated constituents of a GeoPackage binary header.
#[derive(Debug)]
pub(crate) struct GpkgBlobHeader {
    srs_id: i32,
    empty: bool,
    len: usize,
}

impl GpkgBlobHeader {
    /// SRID found in the header.
    #[allow(dead_code)]
    pub(crate) fn srs_id(&self) -> i32 {
        self.srs_id
    }

    /// Whether the Y flag marks this geometry as empty.
    pub(crate) fn is_empty(&self) -> bool {
        self.empty
    }

    /// Number of bytes this header occupies; the WKB body starts here.
    #[allow(dead_code)]
    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

impl TryFrom<&[u8]> for GpkgBlobHeader {
    type Error = MyError;

    fn try_from(ba: &[u8]) -> Result<Self, Self::Error> {
        if ba.len() < 8 {
            let msg = "Input too short for a GeoPackage binary header";
            error!("{msg}");
            return Err(MyError::Runtime(msg.into()));
        }
        if ba[..2] != *b"GP" {
            let msg = "Input does NOT start w/ expected ('GP') magic";
            error!("{msg}");
            return Err(MyError::Runtime(msg.into()));
        }

        let v = ba[2];
        if v != 0 {
            let msg = format!("Unexpected ({v}) format version");
            error!("{msg}");
            return Err(MyError::Runtime(msg.into()));
        }

        let flags = ba[3] & 0x3F;
        // bit #5 is X: 0 means 'standard' while 1 means 'extended'...
        if flags & 0x20 != 0 {
            let msg = "X flag set => NOT StandardGeoPackageBinary";
            error!("{msg}");
            return Err(MyError::Runtime(msg.into()));
        }

        let empty = (flags & 0x10) >> 4 == 1;
        let le = flags & 0x01 == 1;
        let eci = (flags >> 1) & 0x07;
        let env_len = match eci {
            0 => 0,
            1 => 4,
            2 | 3 => 6,
            4 => 8,
            x => {
                let msg = format!("Invalid ({x}) envelope content indicator");
                error!("{msg}");
                return Err(MyError::Runtime(msg.into()));
            }
        };

        let srs = [ba[4], ba[5], ba[6], ba[7]];
        let srs_id = if le {
            i32::from_le_bytes(srs)
        } else {
            i32::from_be_bytes(srs)
        };

        Ok(Self {
            srs_id,
            empty,
            len: 2 + 1 + 1 + 4 + 8 * env_len,
        })
    }
}

/// Decode a GeoPackage geometry BLOB into a GeoJSON geometry value.
///
/// Returns `None` for a geometry the producer flagged as empty.
pub fn decode_geometry(ba: &[u8]) -> Result<Option<serde_json::Value>, MyError> {
    let header = GpkgBlobHeader::try_from(ba)?;
    if header.is_empty() {
        return Ok(None);
    }
    // geozero re-parses the header to locate the WKB body; ours above is the
    // strict gatekeeper for magic, version + flags.
    let json = GpkgWkb(ba.to_vec()).to_json()?;
    Ok(Some(serde_json::from_str(&json)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    // `POINT (1.1 1.1)` w/ srs_id 4326 and a 4-value LE envelope.
    const POINT_1_1: &str = "47500003E61000009A9999999999F13F9A9999999999F13F9A9999999999F13F9A9999999999F13F01010000009A9999999999F13F9A9999999999F13F";

    fn unhex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    #[test]
    fn test_header_fields() {
        let ba = unhex(POINT_1_1);
        let header = GpkgBlobHeader::try_from(ba.as_slice()).unwrap();
        assert_eq!(header.srs_id(), 4326);
        assert!(!header.is_empty());
        assert_eq!(header.len(), 8 + 8 * 4);
    }

    #[test]
    fn test_decode_point() {
        let it = decode_geometry(&unhex(POINT_1_1)).unwrap().unwrap();
        assert_eq!(it["type"], "Point");
        let xy = it["coordinates"].as_array().unwrap();
        assert!((xy[0].as_f64().unwrap() - 1.1).abs() < 1e-9);
        assert!((xy[1].as_f64().unwrap() - 1.1).abs() < 1e-9);
    }

    #[test]
    fn test_bad_magic_is_rejected() {
        let mut ba = unhex(POINT_1_1);
        ba[0] = b'X';
        assert!(GpkgBlobHeader::try_from(ba.as_slice()).is_err());
    }

    #[test]
    fn test_bad_version_is_rejected() {
        let mut ba = unhex(POINT_1_1);
        ba[2] = 9;
        assert!(GpkgBlobHeader::try_from(ba.as_slice()).is_err());
    }

    #[test]
    fn test_empty_flag_yields_none() {
        let mut ba = unhex(POINT_1_1);
        ba[3] |= 0x10;
        assert!(decode_geometry(&ba).unwrap().is_none());
    }

    #[test]
    fn test_truncated_input_is_rejected() {
        assert!(GpkgBlobHeader::try_from(&b"GP"[..]).is_err());
    }
}
