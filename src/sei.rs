// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Depth-representation SEI parsing.
//!
//! The subtype bytes of a depth auxiliary image's `auxC` property carry a
//! length-prefixed SEI NAL unit. SEI payload 177 (depth_representation_info,
//! ISO 23008-2 § F.14.2.4) describes how depth samples map to physical
//! distances, using a custom sign/exponent/variable-mantissa float encoding.

use bitreader::BitReader;

use crate::{Error, Result};

/// SEI NAL unit types in HEVC (prefix and suffix SEI).
const NAL_SEI_PREFIX: u8 = 39;
const NAL_SEI_SUFFIX: u8 = 40;

const PAYLOAD_DEPTH_REPRESENTATION_INFO: u8 = 177;

/// A decoded depth-range element.
///
/// `unspecified` is set when the encoded exponent is 127, which ISO 23008-2
/// reserves for "value unspecified"; `value` still holds the literal
/// decoding for diagnostic purposes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthValue {
    pub value: f64,
    pub unspecified: bool,
}

/// Depth-representation info attached to a depth auxiliary image.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DepthRepresentationInfo {
    pub z_near: Option<DepthValue>,
    pub z_far: Option<DepthValue>,
    pub d_min: Option<DepthValue>,
    pub d_max: Option<DepthValue>,
    /// depth_representation_type code from the SEI message.
    pub representation_type: u32,
    /// Only meaningful when d_min or d_max is present.
    pub disparity_reference_view: u32,
}

/// Read an unsigned Exp-Golomb code.
fn read_uvlc(reader: &mut BitReader<'_>) -> Result<u32> {
    let mut leading_zeros: u8 = 0;
    while !reader.read_bool()? {
        leading_zeros += 1;
        if leading_zeros > 31 {
            return Err(Error::InvalidData("invalid exp-golomb code"));
        }
    }
    if leading_zeros == 0 {
        return Ok(0);
    }
    let suffix = reader.read_u32(leading_zeros)?;
    Ok((1u32 << leading_zeros) - 1 + suffix)
}

/// Read one depth-rep-info element: 1 sign bit, 7-bit exponent, 5-bit
/// mantissa length (minus one), then the mantissa itself.
///
/// value = 2^(E-31) · (1 + m/2^M) for E > 0, else 2^-(30+M) · m.
fn read_depth_rep_info_element(reader: &mut BitReader<'_>) -> Result<DepthValue> {
    let sign = reader.read_bool()?;
    let exponent = reader.read_u8(7)?;
    let mantissa_len = reader.read_u8(5)? + 1;
    let mantissa = reader.read_u32(mantissa_len)?;

    let value = if exponent > 0 {
        2f64.powi(i32::from(exponent) - 31) * (1.0 + f64::from(mantissa) / 2f64.powi(i32::from(mantissa_len)))
    } else {
        2f64.powi(-(30 + i32::from(mantissa_len))) * f64::from(mantissa)
    };

    Ok(DepthValue {
        value: if sign { -value } else { value },
        unspecified: exponent == 127,
    })
}

/// Read the body of a depth_representation_info SEI message.
fn read_depth_representation_info(reader: &mut BitReader<'_>) -> Result<DepthRepresentationInfo> {
    let mut info = DepthRepresentationInfo::default();

    let has_z_near = reader.read_bool()?;
    let has_z_far = reader.read_bool()?;
    let has_d_min = reader.read_bool()?;
    let has_d_max = reader.read_bool()?;

    info.representation_type = read_uvlc(reader)?;

    if has_d_min || has_d_max {
        info.disparity_reference_view = read_uvlc(reader)?;
    }

    if has_z_near {
        info.z_near = Some(read_depth_rep_info_element(reader)?);
    }
    if has_z_far {
        info.z_far = Some(read_depth_rep_info_element(reader)?);
    }
    if has_d_min {
        info.d_min = Some(read_depth_rep_info_element(reader)?);
    }
    if has_d_max {
        info.d_max = Some(read_depth_rep_info_element(reader)?);
    }

    // representation_type 3 (nonuniform disparity) carries a model table
    // which is not loaded.

    Ok(info)
}

/// Scan the length-prefixed SEI NAL in `auxC` subtype bytes for a
/// depth_representation_info payload.
///
/// Only the first SEI NAL and its first payload are examined.
pub(crate) fn parse_depth_sei(data: &[u8]) -> Result<Option<DepthRepresentationInfo>> {
    if data.is_empty() {
        return Ok(None);
    }

    let mut reader = BitReader::new(data);
    let len = u64::from(reader.read_u32(32)?);

    if len > data.len() as u64 - 4 {
        return Err(Error::InvalidData("SEI length exceeds auxC subtype data"));
    }

    // Only the first SEI NAL is read; a multi-message stream would continue
    // from the end of this NAL.
    if len > 4 {
        let mut sei_reader = BitReader::new(&data[4..]);

        let _nal_size = sei_reader.read_u32(32)?;
        let nal_type = sei_reader.read_u8(8)? >> 1;
        sei_reader.skip(8)?;

        if nal_type == NAL_SEI_PREFIX || nal_type == NAL_SEI_SUFFIX {
            let payload_id = sei_reader.read_u8(8)?;
            let _payload_size = sei_reader.read_u8(8)?;

            if payload_id == PAYLOAD_DEPTH_REPRESENTATION_INFO {
                return Ok(Some(read_depth_representation_info(&mut sei_reader)?));
            }
        }
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Append bits (given most-significant first) to a byte vector.
    struct BitWriter {
        bytes: Vec<u8>,
        used: u8,
    }

    impl BitWriter {
        fn new() -> Self {
            Self { bytes: Vec::new(), used: 0 }
        }

        fn push(&mut self, value: u32, count: u8) {
            for i in (0..count).rev() {
                let bit = (value >> i) & 1;
                if self.used == 0 {
                    self.bytes.push(0);
                }
                let last = self.bytes.last_mut().unwrap();
                *last |= (bit as u8) << (7 - self.used);
                self.used = (self.used + 1) % 8;
            }
        }

        fn finish(self) -> Vec<u8> {
            self.bytes
        }
    }

    #[test]
    fn uvlc_values() {
        // 1 → 0, 010 → 1, 011 → 2, 00100 → 3
        let data = [0b1_010_011_0, 0b0100_0000];
        let mut r = BitReader::new(&data);
        assert_eq!(read_uvlc(&mut r).unwrap(), 0);
        assert_eq!(read_uvlc(&mut r).unwrap(), 1);
        assert_eq!(read_uvlc(&mut r).unwrap(), 2);
        assert_eq!(read_uvlc(&mut r).unwrap(), 3);
    }

    #[test]
    fn depth_element_positive_exponent() {
        let mut w = BitWriter::new();
        w.push(0, 1); // sign
        w.push(1, 7); // exponent 1
        w.push(0, 5); // mantissa_len - 1 = 0
        w.push(1, 1); // mantissa = 1
        let bytes = w.finish();
        let mut r = BitReader::new(&bytes);
        let v = read_depth_rep_info_element(&mut r).unwrap();
        assert!(!v.unspecified);
        // 2^(1-31) · (1 + 1/2)
        assert_eq!(v.value, 1.5 * 2f64.powi(-30));
    }

    #[test]
    fn depth_element_zero_exponent_and_sign() {
        let mut w = BitWriter::new();
        w.push(1, 1); // negative
        w.push(0, 7); // exponent 0
        w.push(3, 5); // mantissa_len = 4
        w.push(5, 4); // mantissa = 5
        let bytes = w.finish();
        let mut r = BitReader::new(&bytes);
        let v = read_depth_rep_info_element(&mut r).unwrap();
        // -(2^-(30+4) · 5)
        assert_eq!(v.value, -(5.0 * 2f64.powi(-34)));
    }

    #[test]
    fn depth_element_unspecified_exponent() {
        let mut w = BitWriter::new();
        w.push(0, 1);
        w.push(127, 7);
        w.push(0, 5);
        w.push(0, 1);
        let bytes = w.finish();
        let mut r = BitReader::new(&bytes);
        assert!(read_depth_rep_info_element(&mut r).unwrap().unspecified);
    }

    fn sei_nal(payload_bits: &[u8]) -> Vec<u8> {
        let mut nal = Vec::new();
        nal.push(39u8 << 1); // prefix SEI
        nal.push(0x01);
        nal.push(177); // depth_representation_info
        nal.push(payload_bits.len() as u8);
        nal.extend_from_slice(payload_bits);

        let mut data = Vec::new();
        let inner = 4 + nal.len() as u32;
        data.extend_from_slice(&inner.to_be_bytes()); // outer length
        data.extend_from_slice(&(nal.len() as u32).to_be_bytes()); // NAL size
        data.extend_from_slice(&nal);
        data
    }

    #[test]
    fn depth_sei_with_z_near() {
        let mut w = BitWriter::new();
        w.push(0b1000, 4); // has_z_near only
        w.push(1, 1); // uvlc rep_type = 0
        w.push(0, 1); // sign
        w.push(1, 7); // exponent
        w.push(0, 5); // mantissa_len 1
        w.push(1, 1); // mantissa
        let payload = w.finish();
        let data = sei_nal(&payload);

        let info = parse_depth_sei(&data).unwrap().expect("depth info");
        assert_eq!(info.representation_type, 0);
        let z_near = info.z_near.expect("z_near");
        assert_eq!(z_near.value, 1.5 * 2f64.powi(-30));
        assert!(info.z_far.is_none());
        assert!(info.d_min.is_none());
    }

    #[test]
    fn depth_sei_ignores_non_sei_nal() {
        // NAL type 32 (VPS) is not SEI; nothing should be found.
        let mut data = Vec::new();
        data.extend_from_slice(&8u32.to_be_bytes());
        data.extend_from_slice(&2u32.to_be_bytes());
        data.extend_from_slice(&[32u8 << 1, 0x01, 0, 0]);
        assert_eq!(parse_depth_sei(&data).unwrap(), None);
    }

    #[test]
    fn depth_sei_rejects_overlong_length() {
        let data = [0u8, 0, 0, 200, 1, 2, 3];
        assert!(matches!(
            parse_depth_sei(&data),
            Err(Error::InvalidData(_))
        ));
    }

    #[test]
    fn depth_sei_empty_subtypes() {
        assert_eq!(parse_depth_sei(&[]).unwrap(), None);
    }
}
