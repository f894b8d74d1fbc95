// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Box-level parsing for HEIF files.
//!
//! The functions here turn a raw byte stream into the flat lookup tables of
//! [`ParsedFile`]: item infos, item locations, properties with their
//! associations, typed item references and the optional `idat` payload.
//! Nothing in this module interprets the tables; that happens in the crate
//! root when a context is built.

use arrayvec::ArrayVec;
use bitreader::BitReader;
use byteorder::ReadBytesExt;
use log::{debug, warn};
use std::io::{Read, Take};
use std::ops::{Range, RangeFrom};

use crate::boxes::{BoxType, FourCC};
use crate::{Error, Fraction, Limits, Result, ToU64, ToUsize, TryString, TryVec};

/// Indicate the current offset (i.e., bytes already read) in a reader
pub(crate) trait Offset {
    fn offset(&self) -> u64;
}

/// Wraps a reader to track the current offset
pub(crate) struct OffsetReader<'a, T> {
    reader: &'a mut T,
    offset: u64,
}

impl<'a, T> OffsetReader<'a, T> {
    pub(crate) fn new(reader: &'a mut T) -> Self {
        Self { reader, offset: 0 }
    }
}

impl<T> Offset for OffsetReader<'_, T> {
    fn offset(&self) -> u64 {
        self.offset
    }
}

impl<T: Read> Read for OffsetReader<'_, T> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let bytes_read = self.reader.read(buf)?;
        self.offset = self
            .offset
            .checked_add(bytes_read.to_u64())
            .ok_or(Error::Unsupported("total bytes read too large for offset type"))?;
        Ok(bytes_read)
    }
}

/// Basic ISO box header.
///
/// HEIF files are a sequence of possibly-nested 'box' structures. Each box
/// begins with a header describing the length of the box's data and a
/// four-byte box type which identifies the type of the box.
///
/// See ISO 14496-12:2015 § 4.2
#[derive(Debug, Clone, Copy)]
pub(crate) struct BoxHeader {
    /// Box type.
    pub(crate) name: BoxType,
    /// Size of the box in bytes.
    pub(crate) size: u64,
    /// Offset to the start of the contained data (or header size).
    pub(crate) offset: u64,
    /// Uuid for extended type.
    #[allow(unused)]
    pub(crate) uuid: Option<[u8; 16]>,
}

impl BoxHeader {
    /// 4-byte size + 4-byte type
    pub(crate) const MIN_SIZE: u64 = 8;
    /// 4-byte size + 4-byte type + 8-byte size
    pub(crate) const MIN_LARGE_SIZE: u64 = 16;
}

/// A box bounded to its declared content range.
///
/// Reads are clamped to the box payload via `Take`; whatever a parser does
/// not consume is skipped by the caller so that the next sibling lines up.
pub(crate) struct BMFFBox<'a, T> {
    pub(crate) head: BoxHeader,
    pub(crate) content: Take<&'a mut T>,
}

impl<T: Read> BMFFBox<'_, T> {
    pub(crate) fn read_into_try_vec(&mut self) -> std::io::Result<TryVec<u8>> {
        let limit = self.content.limit();
        // For size=0 boxes, size is set to u64::MAX, but after subtracting the
        // header the limit will be slightly less. Check for values very close
        // to u64::MAX to detect these cases.
        let mut vec = if limit >= u64::MAX - BoxHeader::MIN_LARGE_SIZE {
            std::vec::Vec::new()
        } else {
            let mut v = std::vec::Vec::new();
            v.try_reserve_exact(limit as usize)
                .map_err(|_| std::io::ErrorKind::OutOfMemory)?;
            v
        };
        self.content.read_to_end(&mut vec)?;
        Ok(vec.into())
    }

    /// Read a NUL-terminated string, not including the terminator.
    ///
    /// Stops at the end of the box if no terminator is found.
    pub(crate) fn read_string(&mut self) -> Result<TryString> {
        let mut out = TryVec::new();
        loop {
            if self.bytes_left() == 0 {
                return Ok(out);
            }
            match self.content.read_u8()? {
                0 => return Ok(out),
                c => out.push(c)?,
            }
        }
    }

    pub(crate) fn bytes_left(&self) -> u64 {
        self.content.limit()
    }

    pub(crate) const fn get_header(&self) -> &BoxHeader {
        &self.head
    }

    pub(crate) fn box_iter(&mut self) -> BoxIter<'_, Self> {
        BoxIter::new(self)
    }
}

impl<T: Read> Read for BMFFBox<'_, T> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.content.read(buf)
    }
}

impl<T: Offset> Offset for BMFFBox<'_, T> {
    fn offset(&self) -> u64 {
        self.content.get_ref().offset()
    }
}

impl<T> Drop for BMFFBox<'_, T> {
    fn drop(&mut self) {
        if self.content.limit() > 0 {
            let name: FourCC = From::from(self.head.name);
            debug!("Dropping {} bytes in '{}'", self.content.limit(), name);
        }
    }
}

pub(crate) struct BoxIter<'a, T> {
    src: &'a mut T,
}

impl<T: Read> BoxIter<'_, T> {
    pub(crate) fn new(src: &mut T) -> BoxIter<'_, T> {
        BoxIter { src }
    }

    pub(crate) fn next_box(&mut self) -> Result<Option<BMFFBox<'_, T>>> {
        let r = read_box_header(self.src);
        match r {
            Ok(h) => Ok(Some(BMFFBox {
                head: h,
                content: self.src.take(h.size - h.offset),
            })),
            Err(Error::UnexpectedEOF) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Read and parse a box header.
///
/// Call this first to determine the type of a particular box and its length.
/// Used internally for dispatching to specific parsers for the internal
/// content, or to get the length to skip unknown or uninteresting boxes.
///
/// See ISO 14496-12:2015 § 4.2
fn read_box_header<T: ReadBytesExt>(src: &mut T) -> Result<BoxHeader> {
    let size32 = be_u32(src)?;
    let name = BoxType::from(be_u32(src)?);
    let size = match size32 {
        // Size=0 means the box extends to EOF; only valid for the last
        // top-level box.
        0 => u64::MAX,
        1 => {
            let size64 = be_u64(src)?;
            if size64 < BoxHeader::MIN_LARGE_SIZE {
                return Err(Error::InvalidData("malformed wide size"));
            }
            size64
        }
        _ => {
            if u64::from(size32) < BoxHeader::MIN_SIZE {
                return Err(Error::InvalidData("malformed size"));
            }
            u64::from(size32)
        }
    };
    let mut offset = match size32 {
        1 => BoxHeader::MIN_LARGE_SIZE,
        _ => BoxHeader::MIN_SIZE,
    };
    let uuid = if name == BoxType::UuidBox {
        if size >= offset + 16 {
            let mut buffer = [0u8; 16];
            let count = src.read(&mut buffer)?;
            offset += count.to_u64();
            if count == 16 {
                Some(buffer)
            } else {
                debug!("malformed uuid (short read), skipping");
                None
            }
        } else {
            debug!("malformed uuid, skipping");
            None
        }
    } else {
        None
    };
    assert!(offset <= size);
    Ok(BoxHeader { name, size, offset, uuid })
}

/// Parse the extra header fields for a full box.
fn read_fullbox_extra<T: ReadBytesExt>(src: &mut T) -> Result<(u8, u32)> {
    let version = src.read_u8()?;
    let flags_a = src.read_u8()?;
    let flags_b = src.read_u8()?;
    let flags_c = src.read_u8()?;
    Ok((
        version,
        u32::from(flags_a) << 16 | u32::from(flags_b) << 8 | u32::from(flags_c),
    ))
}

/// Skip over the entire contents of a box.
fn skip_box_content<T: Read>(src: &mut BMFFBox<'_, T>) -> Result<()> {
    let to_skip = {
        let header = src.get_header();
        debug!("{header:?} (skipped)");
        header
            .size
            .checked_sub(header.offset)
            .ok_or(Error::InvalidData("header offset > size"))?
    };
    assert_eq!(to_skip, src.bytes_left());
    skip(src, to_skip)
}

/// Skip over the remaining data of a box.
fn skip_box_remain<T: Read>(src: &mut BMFFBox<'_, T>) -> Result<()> {
    let remain = {
        let header = src.get_header();
        let len = src.bytes_left();
        debug!("remain {len} (skipped) in {header:?}");
        len
    };
    skip(src, remain)
}

/// Skip a number of bytes that we don't care to parse.
fn skip<T: Read>(src: &mut T, bytes: u64) -> Result<()> {
    std::io::copy(&mut src.take(bytes), &mut std::io::sink())?;
    Ok(())
}

#[cfg_attr(debug_assertions, track_caller)]
fn check_parser_state<T>(header: &BoxHeader, left: &Take<T>) -> Result<()> {
    let limit = left.limit();
    // Allow fully consumed boxes, or size=0 boxes (where original size was u64::MAX)
    if limit == 0 || header.size == u64::MAX {
        Ok(())
    } else {
        debug_assert_eq!(0, limit, "bad parser state bytes left");
        Err(Error::InvalidData("unread box content or bad parser sync"))
    }
}

pub(crate) fn be_u16<T: ReadBytesExt>(src: &mut T) -> Result<u16> {
    src.read_u16::<byteorder::BigEndian>().map_err(From::from)
}

pub(crate) fn be_u32<T: ReadBytesExt>(src: &mut T) -> Result<u32> {
    src.read_u32::<byteorder::BigEndian>().map_err(From::from)
}

pub(crate) fn be_u64<T: ReadBytesExt>(src: &mut T) -> Result<u64> {
    src.read_u64::<byteorder::BigEndian>().map_err(From::from)
}

// ========================================
// Parsed structures
// ========================================

/// File type box 'ftyp'.
#[derive(Debug)]
pub(crate) struct FileTypeBox {
    pub(crate) major_brand: FourCC,
    #[allow(unused)]
    pub(crate) minor_version: u32,
    pub(crate) compatible_brands: TryVec<FourCC>,
}

impl FileTypeBox {
    pub(crate) fn has_compatible_brand(&self, brand: &[u8; 4]) -> bool {
        self.compatible_brands.iter().any(|b| *b == brand)
    }
}

/// Used for 'infe' boxes within 'iinf' boxes.
/// See ISO 14496-12:2015 § 8.11.6. Only versions {2, 3} are supported.
#[derive(Debug)]
pub struct ItemInfo {
    pub(crate) item_id: u32,
    pub(crate) item_type: FourCC,
    pub(crate) name: TryString,
    pub(crate) content_type: TryString,
    pub(crate) content_encoding: TryString,
    pub(crate) item_uri_type: TryString,
    pub(crate) hidden: bool,
}

impl ItemInfo {
    pub fn item_id(&self) -> u32 {
        self.item_id
    }

    pub fn item_type(&self) -> FourCC {
        self.item_type
    }

    pub fn name(&self) -> &[u8] {
        &self.name
    }

    /// MIME content type; only present for `mime` items.
    pub fn content_type(&self) -> &[u8] {
        &self.content_type
    }

    /// Content encoding; only present for `mime` items.
    pub fn content_encoding(&self) -> &[u8] {
        &self.content_encoding
    }

    /// URI type; only present for `uri ` items.
    pub fn item_uri_type(&self) -> &[u8] {
        &self.item_uri_type
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden
    }
}

/// See ISO 14496-12:2015 § 8.11.12.
///
/// References are flattened to one row per target so that the order of a
/// multi-target reference (the `dimg` tile order) survives in
/// `reference_index`.
#[derive(Debug)]
pub(crate) struct SingleItemTypeReference {
    pub(crate) item_type: FourCC,
    pub(crate) from_item_id: u32,
    pub(crate) to_item_id: u32,
    pub(crate) reference_index: u16,
}

/// Potential sizes (in bytes) of variable-sized fields of the 'iloc' box
/// See ISO 14496-12:2015 § 8.11.3
#[derive(Debug)]
enum IlocFieldSize {
    Zero,
    Four,
    Eight,
}

impl IlocFieldSize {
    const fn to_bits(&self) -> u8 {
        match self {
            Self::Zero => 0,
            Self::Four => 32,
            Self::Eight => 64,
        }
    }
}

impl TryFrom<u8> for IlocFieldSize {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Zero),
            4 => Ok(Self::Four),
            8 => Ok(Self::Eight),
            _ => Err(Error::InvalidData("value must be in the set {0, 4, 8}")),
        }
    }
}

#[derive(PartialEq)]
enum IlocVersion {
    Zero,
    One,
    Two,
}

impl TryFrom<u8> for IlocVersion {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Zero),
            1 => Ok(Self::One),
            2 => Ok(Self::Two),
            _ => Err(Error::Unsupported("unsupported version in 'iloc' box")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum ConstructionMethod {
    File,
    Idat,
    Item,
}

#[derive(Clone, Debug)]
pub(crate) enum ExtentRange {
    WithLength(Range<u64>),
    ToEnd(RangeFrom<u64>),
}

impl ExtentRange {
    pub(crate) const fn start(&self) -> u64 {
        match self {
            Self::WithLength(r) => r.start,
            Self::ToEnd(r) => r.start,
        }
    }
}

/// Used for 'iloc' boxes. See ISO 14496-12:2015 § 8.11.3.
///
/// `base_offset` is folded into the ranges in `extents`.
/// `data_reference_index` is omitted, since only 0 (i.e., this file) is
/// supported.
#[derive(Debug)]
pub(crate) struct ItemLocation {
    pub(crate) item_id: u32,
    pub(crate) construction_method: ConstructionMethod,
    pub(crate) extents: TryVec<ExtentRange>,
}

/// Image spatial extents (dimensions)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ImageSpatialExtents {
    pub(crate) width: u32,
    pub(crate) height: u32,
}

/// One NAL-unit array from an 'hvcC' box.
#[derive(Debug)]
pub struct NalArray {
    pub completeness: bool,
    pub nal_unit_type: u8,
    pub units: TryVec<TryVec<u8>>,
}

/// HEVC decoder configuration record from an 'hvcC' box.
/// See ISO 14496-15:2017 § 8.3.3.1.
#[derive(Debug)]
pub struct HevcConfiguration {
    pub configuration_version: u8,
    pub general_profile_space: u8,
    pub general_tier_flag: bool,
    pub general_profile_idc: u8,
    pub general_profile_compatibility_flags: u32,
    /// 48 constraint bits, packed big-endian into the low bits.
    pub general_constraint_indicator_flags: u64,
    pub general_level_idc: u8,
    pub min_spatial_segmentation_idc: u16,
    pub parallelism_type: u8,
    pub chroma_format_idc: u8,
    pub bit_depth_luma: u8,
    pub bit_depth_chroma: u8,
    pub avg_frame_rate: u16,
    pub constant_frame_rate: u8,
    pub num_temporal_layers: u8,
    pub temporal_id_nested: bool,
    pub length_size: u8,
    pub nal_arrays: TryVec<NalArray>,
}

impl HevcConfiguration {
    /// Concatenate all parameter-set NAL units, each prefixed with its
    /// 4-byte big-endian length, ready to prepend to the coded payload.
    pub fn annex_headers(&self) -> Result<TryVec<u8>> {
        let mut dest = TryVec::new();
        for array in &self.nal_arrays {
            for unit in &array.units {
                let len = u32::try_from(unit.len())
                    .map_err(|_| Error::InvalidData("NAL unit too large"))?;
                dest.extend_from_slice(&len.to_be_bytes())?;
                dest.extend_from_slice(unit)?;
            }
        }
        Ok(dest)
    }
}

/// Auxiliary-channel type from an 'auxC' box: a NUL-terminated URN plus
/// codec-specific subtype bytes.
#[derive(Debug)]
pub(crate) struct AuxiliaryTypeProperty {
    pub(crate) aux_type: TryString,
    pub(crate) subtypes: TryVec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MirrorAxis {
    Vertical,
    Horizontal,
}

/// Clean-aperture fractions from a 'clap' box.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CleanAperture {
    pub(crate) width: Fraction,
    pub(crate) height: Fraction,
    pub(crate) horizontal_offset: Fraction,
    pub(crate) vertical_offset: Fraction,
}

#[derive(Debug)]
pub(crate) enum ItemProperty {
    ImageSpatialExtents(ImageSpatialExtents),
    HevcConfiguration(HevcConfiguration),
    AuxiliaryType(AuxiliaryTypeProperty),
    /// Degrees CCW, one of 0/90/180/270.
    Rotation(u16),
    Mirror(MirrorAxis),
    CleanAperture(CleanAperture),
    #[allow(unused)]
    PixelInformation(ArrayVec<u8, 16>),
    Unsupported,
}

/// One `(item, property index, essential)` row from an 'ipma' box.
/// `property_index` is 1-based into the 'ipco' child list; 0 means none.
#[derive(Debug)]
pub(crate) struct Association {
    pub(crate) item_id: u32,
    pub(crate) essential: bool,
    pub(crate) property_index: u16,
}

/// Byte range of a top-level media data box within the file.
#[derive(Debug)]
pub(crate) struct MdatBounds {
    pub(crate) offset: u64,
    pub(crate) length: u64,
}

/// One row of the box-tree dump.
#[derive(Debug)]
pub(crate) struct DumpRow {
    pub(crate) depth: u8,
    pub(crate) name: FourCC,
    pub(crate) size: u64,
}

/// The flat lookup tables extracted from the 'meta' box.
#[derive(Debug)]
pub(crate) struct HeifMeta {
    pub(crate) primary_item_id: u32,
    pub(crate) item_infos: TryVec<ItemInfo>,
    pub(crate) iloc_items: TryVec<ItemLocation>,
    /// The ordered 'ipco' property array; `Unsupported` entries keep their
    /// slot so 1-based 'ipma' indices stay valid.
    pub(crate) properties: TryVec<ItemProperty>,
    pub(crate) associations: TryVec<Association>,
    pub(crate) item_references: TryVec<SingleItemTypeReference>,
    pub(crate) idat: Option<TryVec<u8>>,
}

/// Result of the box-level parse pass over a whole file.
#[derive(Debug)]
pub(crate) struct ParsedFile {
    #[allow(unused)]
    pub(crate) ftyp: FileTypeBox,
    pub(crate) meta: HeifMeta,
    pub(crate) mdat_bounds: TryVec<MdatBounds>,
    pub(crate) dump_rows: TryVec<DumpRow>,
}

// ========================================
// Top-level parse
// ========================================

fn record<T>(rows: &mut TryVec<DumpRow>, depth: u8, b: &BMFFBox<'_, T>) -> Result<()> {
    rows.push(DumpRow {
        depth,
        name: b.head.name.into(),
        size: b.head.size,
    })?;
    Ok(())
}

/// Parse the box structure of a HEIF byte stream into flat tables.
///
/// Top-level parsing is fail-fast per box: a malformed interior aborts that
/// box's subtree, the cursor is advanced to the box's declared end, and
/// later top-level boxes are still attempted. The file is accepted only if
/// all mandatory roots were collected.
pub(crate) fn read_heif(data: &[u8], limits: &Limits) -> Result<ParsedFile> {
    let mut cursor = std::io::Cursor::new(data);
    let mut f = OffsetReader::new(&mut cursor);
    let mut iter = BoxIter::new(&mut f);
    let mut rows = TryVec::new();

    // 'ftyp' box must occur first; see ISO 14496-12:2015 § 4.3.1
    let ftyp = match iter.next_box()? {
        Some(mut b) => {
            if b.head.name != BoxType::FileTypeBox {
                return Err(Error::InvalidData("missing ftyp box"));
            }
            record(&mut rows, 0, &b)?;
            read_ftyp(&mut b)?
        }
        None => return Err(Error::InvalidData("missing ftyp box")),
    };

    if !ftyp.has_compatible_brand(b"heic") {
        warn!("major_brand: {}", ftyp.major_brand);
        return Err(Error::Unsupported("file does not list the 'heic' brand"));
    }

    let mut meta = None;
    let mut mdat_bounds = TryVec::new();
    let mut deferred: Option<Error> = None;

    while let Some(mut b) = iter.next_box()? {
        record(&mut rows, 0, &b)?;
        let r = match b.head.name {
            BoxType::MetadataBox => {
                if meta.is_some() {
                    return Err(Error::InvalidData(
                        "there should be zero or one meta boxes per ISO 14496-12:2015 § 8.11.1.1",
                    ));
                }
                match read_heif_meta(&mut b, limits, &mut rows) {
                    Ok(m) => {
                        meta = Some(m);
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            BoxType::MediaDataBox => {
                if b.bytes_left() > 0 {
                    let offset = b.offset();
                    let length = b.bytes_left();
                    mdat_bounds.push(MdatBounds { offset, length })?;
                }
                // Payload bytes are sliced out of the raw buffer later.
                skip_box_content(&mut b)
            }
            _ => skip_box_content(&mut b),
        };

        match r {
            Ok(()) => check_parser_state(&b.head, &b.content)?,
            Err(e @ (Error::OutOfMemory | Error::ResourceLimitExceeded(_))) => return Err(e),
            Err(e) => {
                debug!("aborted subtree of {:?}: {e}", b.head.name);
                if deferred.is_none() {
                    deferred = Some(e);
                }
                skip_box_remain(&mut b)?;
            }
        }
    }

    let meta = match meta {
        Some(m) => m,
        None => return Err(deferred.unwrap_or(Error::InvalidData("missing meta box"))),
    };

    Ok(ParsedFile {
        ftyp,
        meta,
        mdat_bounds,
        dump_rows: rows,
    })
}

/// Parse an ftyp box.
/// See ISO 14496-12:2015 § 4.3
fn read_ftyp<T: Read>(src: &mut BMFFBox<'_, T>) -> Result<FileTypeBox> {
    let major = be_u32(src)?;
    let minor = be_u32(src)?;
    let bytes_left = src.bytes_left();
    if bytes_left % 4 != 0 {
        return Err(Error::InvalidData("invalid ftyp size"));
    }
    let brand_count = bytes_left / 4;
    let mut brands = TryVec::with_capacity(brand_count.try_into()?)?;
    for _ in 0..brand_count {
        brands.push(be_u32(src)?.into())?;
    }
    Ok(FileTypeBox {
        major_brand: From::from(major),
        minor_version: minor,
        compatible_brands: brands,
    })
}

/// Parse a metadata box in the context of a HEIF image.
/// See ISO 14496-12:2015 § 8.11.1
fn read_heif_meta<T: Read>(
    src: &mut BMFFBox<'_, T>,
    limits: &Limits,
    rows: &mut TryVec<DumpRow>,
) -> Result<HeifMeta> {
    let (version, _flags) = read_fullbox_extra(src)?;
    if version != 0 {
        return Err(Error::Unsupported("unsupported meta version"));
    }

    let mut handler_type = None;
    let mut primary_item_id = None;
    let mut item_infos = None;
    let mut iloc_items = None;
    let mut item_references = TryVec::new();
    let mut properties = None;
    let mut associations = None;
    let mut idat = None;
    let mut children = 0usize;

    let mut iter = src.box_iter();
    while let Some(mut b) = iter.next_box()? {
        children += 1;
        if children > limits.max_children_per_box {
            return Err(Error::ResourceLimitExceeded("child box count exceeds limit"));
        }
        record(rows, 1, &b)?;

        match b.head.name {
            BoxType::HandlerBox => {
                handler_type = Some(read_hdlr(&mut b)?);
            }
            BoxType::PrimaryItemBox => {
                if primary_item_id.is_some() {
                    return Err(Error::InvalidData("there should be zero or one pitm boxes"));
                }
                primary_item_id = Some(read_pitm(&mut b)?);
            }
            BoxType::ItemInfoBox => {
                if item_infos.is_some() {
                    return Err(Error::InvalidData(
                        "there should be zero or one iinf boxes per ISO 14496-12:2015 § 8.11.6.1",
                    ));
                }
                item_infos = Some(read_iinf(&mut b, limits, rows)?);
            }
            BoxType::ItemLocationBox => {
                if iloc_items.is_some() {
                    return Err(Error::InvalidData(
                        "there should be zero or one iloc boxes per ISO 14496-12:2015 § 8.11.3.1",
                    ));
                }
                iloc_items = Some(read_iloc(&mut b, limits)?);
            }
            BoxType::ItemReferenceBox => {
                item_references.append(&mut read_iref(&mut b, rows)?)?;
            }
            BoxType::ItemPropertiesBox => {
                let (props, assocs) = read_iprp(&mut b, limits, rows)?;
                properties = Some(props);
                associations = Some(assocs);
            }
            BoxType::ItemDataBox => {
                if idat.is_some() {
                    return Err(Error::InvalidData("there should be zero or one idat boxes"));
                }
                idat = Some(b.read_into_try_vec()?);
            }
            BoxType::DataInformationBox => {
                read_dinf(&mut b, limits, rows)?;
            }
            BoxType::GroupsListBox => {
                read_grpl(&mut b)?;
            }
            _ => skip_box_content(&mut b)?,
        }

        check_parser_state(&b.head, &b.content)?;
    }

    match handler_type {
        None => return Err(Error::InvalidData("missing hdlr box")),
        Some(h) if h != b"pict" => {
            return Err(Error::InvalidData("meta handler type is not 'pict'"))
        }
        Some(_) => {}
    }

    Ok(HeifMeta {
        primary_item_id: primary_item_id.ok_or(Error::InvalidData("missing pitm box"))?,
        item_infos: item_infos.ok_or(Error::InvalidData("missing iinf box"))?,
        iloc_items: iloc_items.ok_or(Error::InvalidData("missing iloc box"))?,
        properties: properties.ok_or(Error::InvalidData("missing ipco box"))?,
        associations: associations.ok_or(Error::InvalidData("missing ipma box"))?,
        item_references,
        idat,
    })
}

/// Parse a Handler Reference Box, returning the handler type.
/// See ISO 14496-12:2015 § 8.4.3
fn read_hdlr<T: Read>(src: &mut BMFFBox<'_, T>) -> Result<FourCC> {
    let (_version, _flags) = read_fullbox_extra(src)?;

    let _pre_defined = be_u32(src)?;
    let handler_type = FourCC::from(be_u32(src)?);
    for _ in 0..3 {
        let _reserved = be_u32(src)?;
    }
    let _name = src.read_string()?;
    skip_box_remain(src)?;

    Ok(handler_type)
}

/// Parse a Primary Item Box
/// See ISO 14496-12:2015 § 8.11.4
fn read_pitm<T: Read>(src: &mut BMFFBox<'_, T>) -> Result<u32> {
    let (version, _flags) = read_fullbox_extra(src)?;

    let item_id = match version {
        0 => be_u16(src)?.into(),
        1 => be_u32(src)?,
        _ => return Err(Error::Unsupported("unsupported pitm version")),
    };

    Ok(item_id)
}

/// Parse an Item Information Box
/// See ISO 14496-12:2015 § 8.11.6
fn read_iinf<T: Read>(
    src: &mut BMFFBox<'_, T>,
    limits: &Limits,
    rows: &mut TryVec<DumpRow>,
) -> Result<TryVec<ItemInfo>> {
    let (version, _flags) = read_fullbox_extra(src)?;

    match version {
        0 | 1 => (),
        _ => return Err(Error::Unsupported("unsupported iinf version")),
    }

    let entry_count = if version == 0 {
        be_u16(src)?.to_usize()
    } else {
        be_u32(src)?.to_usize()
    };
    if entry_count > limits.max_children_per_box {
        return Err(Error::ResourceLimitExceeded("child box count exceeds limit"));
    }
    let mut item_infos = TryVec::with_capacity(entry_count)?;

    let mut iter = src.box_iter();
    while let Some(mut b) = iter.next_box()? {
        if b.head.name != BoxType::ItemInfoEntry {
            return Err(Error::InvalidData("iinf box should contain only infe boxes"));
        }
        record(rows, 2, &b)?;

        item_infos.push(read_infe(&mut b)?)?;

        check_parser_state(&b.head, &b.content)?;
    }

    Ok(item_infos)
}

/// Parse an Item Info Entry
/// See ISO 14496-12:2015 § 8.11.6.2
fn read_infe<T: Read>(src: &mut BMFFBox<'_, T>) -> Result<ItemInfo> {
    let (version, flags) = read_fullbox_extra(src)?;

    // mif1 brand (see ISO 23008-12:2017 § 10.2.1) only requires v2 and 3
    let item_id = match version {
        2 => be_u16(src)?.into(),
        3 => be_u32(src)?,
        _ => return Err(Error::Unsupported("unsupported version in 'infe' box")),
    };

    let item_protection_index = be_u16(src)?;
    if item_protection_index != 0 {
        return Err(Error::Unsupported(
            "protected items (infe.item_protection_index != 0) are not supported",
        ));
    }

    let item_type = FourCC::from(be_u32(src)?);
    let name = src.read_string()?;

    let mut content_type = TryVec::new();
    let mut content_encoding = TryVec::new();
    let mut item_uri_type = TryVec::new();
    if item_type == b"mime" {
        content_type = src.read_string()?;
        content_encoding = src.read_string()?;
    } else if item_type == b"uri " {
        item_uri_type = src.read_string()?;
    }

    debug!("infe item_id {item_id} item_type: {item_type}");
    skip_box_remain(src)?;

    Ok(ItemInfo {
        item_id,
        item_type,
        name,
        content_type,
        content_encoding,
        item_uri_type,
        hidden: flags & 1 == 1,
    })
}

/// Parse an item location box inside a meta box
/// See ISO 14496-12:2015 § 8.11.3
fn read_iloc<T: Read>(src: &mut BMFFBox<'_, T>, limits: &Limits) -> Result<TryVec<ItemLocation>> {
    let (version, _flags) = read_fullbox_extra(src)?;
    let version: IlocVersion = version.try_into()?;

    let iloc = src.read_into_try_vec()?;
    let mut iloc = BitReader::new(&iloc);

    let offset_size: IlocFieldSize = iloc.read_u8(4)?.try_into()?;
    let length_size: IlocFieldSize = iloc.read_u8(4)?.try_into()?;
    let base_offset_size: IlocFieldSize = iloc.read_u8(4)?.try_into()?;

    let index_size: Option<IlocFieldSize> = match version {
        IlocVersion::One | IlocVersion::Two => Some(iloc.read_u8(4)?.try_into()?),
        IlocVersion::Zero => {
            let _reserved = iloc.read_u8(4)?;
            None
        }
    };

    let item_count = match version {
        IlocVersion::Zero | IlocVersion::One => iloc.read_u32(16)?,
        IlocVersion::Two => iloc.read_u32(32)?,
    };

    if item_count.to_usize() > limits.max_iloc_items {
        return Err(Error::ResourceLimitExceeded("iloc item count exceeds limit"));
    }

    let mut items = TryVec::with_capacity(item_count.to_usize())?;

    for _ in 0..item_count {
        let item_id = match version {
            IlocVersion::Zero | IlocVersion::One => iloc.read_u32(16)?,
            IlocVersion::Two => iloc.read_u32(32)?,
        };

        // For maximum compatibility, version 0 is interpreted as using file
        // offsets (it has no construction_method field).
        let construction_method = match version {
            IlocVersion::Zero => ConstructionMethod::File,
            IlocVersion::One | IlocVersion::Two => {
                let _reserved = iloc.read_u16(12)?;
                match iloc.read_u16(4)? {
                    0 => ConstructionMethod::File,
                    1 => ConstructionMethod::Idat,
                    2 => ConstructionMethod::Item,
                    _ => {
                        return Err(Error::InvalidData(
                            "construction_method is taken from the set 0, 1 or 2 per ISO 14496-12:2015 § 8.11.3.3",
                        ))
                    }
                }
            }
        };

        let data_reference_index = iloc.read_u16(16)?;
        if data_reference_index != 0 {
            return Err(Error::Unsupported(
                "external file references (iloc.data_reference_index != 0) are not supported",
            ));
        }

        let base_offset = iloc.read_u64(base_offset_size.to_bits())?;
        let extent_count = iloc.read_u16(16)?;

        if extent_count < 1 {
            return Err(Error::InvalidData(
                "extent_count must have a value 1 or greater per ISO 14496-12:2015 § 8.11.3.3",
            ));
        }
        if extent_count.to_usize() > limits.max_extents_per_item {
            return Err(Error::ResourceLimitExceeded("iloc extent count exceeds limit"));
        }

        let mut extents = TryVec::with_capacity(extent_count.to_usize())?;

        for _ in 0..extent_count {
            // Only used by construction method 2, which is rejected at
            // data-access time.
            let _extent_index = match &index_size {
                None | Some(IlocFieldSize::Zero) => None,
                Some(index_size) => Some(iloc.read_u64(index_size.to_bits())?),
            };

            // Per ISO 14496-12:2015 § 8.11.3.1:
            // "If the offset is not identified (the field has a length of
            //  zero), then the beginning of the source (offset 0) is implied"
            let extent_offset = iloc.read_u64(offset_size.to_bits())?;
            let extent_length = iloc.read_u64(length_size.to_bits())?;

            // "If the length is not specified, or specified as zero, then the
            //  entire length of the source is implied" (ibid)
            let start = base_offset
                .checked_add(extent_offset)
                .ok_or(Error::InvalidData("offset calculation overflow"))?;
            let extent_range = if extent_length == 0 {
                ExtentRange::ToEnd(RangeFrom { start })
            } else {
                let end = start
                    .checked_add(extent_length)
                    .ok_or(Error::InvalidData("end calculation overflow"))?;
                ExtentRange::WithLength(Range { start, end })
            };

            extents.push(extent_range)?;
        }

        items.push(ItemLocation {
            item_id,
            construction_method,
            extents,
        })?;
    }

    if iloc.remaining() == 0 {
        Ok(items)
    } else {
        Err(Error::InvalidData("invalid iloc size"))
    }
}

/// Parse an Item Reference Box into flattened per-target rows.
/// See ISO 14496-12:2015 § 8.11.12
fn read_iref<T: Read>(
    src: &mut BMFFBox<'_, T>,
    rows: &mut TryVec<DumpRow>,
) -> Result<TryVec<SingleItemTypeReference>> {
    let mut item_references = TryVec::new();
    let (version, _flags) = read_fullbox_extra(src)?;
    if version > 1 {
        return Err(Error::Unsupported("unsupported iref version"));
    }

    let mut iter = src.box_iter();
    while let Some(mut b) = iter.next_box()? {
        record(rows, 2, &b)?;
        let from_item_id = if version == 0 {
            be_u16(&mut b)?.into()
        } else {
            be_u32(&mut b)?
        };
        let reference_count = be_u16(&mut b)?;
        for reference_index in 0..reference_count {
            let to_item_id = if version == 0 {
                be_u16(&mut b)?.into()
            } else {
                be_u32(&mut b)?
            };
            if from_item_id == to_item_id {
                return Err(Error::InvalidData(
                    "from_item_id and to_item_id must be different",
                ));
            }
            item_references.push(SingleItemTypeReference {
                item_type: b.head.name.into(),
                from_item_id,
                to_item_id,
                reference_index,
            })?;
        }
        check_parser_state(&b.head, &b.content)?;
    }
    Ok(item_references)
}

/// Parse an Item Properties Box into the ordered property array and the
/// per-item association rows.
/// See ISO 23008-12:2017 § 9.3
fn read_iprp<T: Read>(
    src: &mut BMFFBox<'_, T>,
    limits: &Limits,
    rows: &mut TryVec<DumpRow>,
) -> Result<(TryVec<ItemProperty>, TryVec<Association>)> {
    let mut properties = None;
    let mut associations = None;

    let mut iter = src.box_iter();
    while let Some(mut b) = iter.next_box()? {
        record(rows, 2, &b)?;
        match b.head.name {
            BoxType::ItemPropertyContainerBox => {
                properties = Some(read_ipco(&mut b, limits, rows)?);
            }
            BoxType::ItemPropertyAssociationBox => {
                associations = Some(read_ipma(&mut b)?);
            }
            _ => return Err(Error::InvalidData("unexpected iprp child")),
        }
        check_parser_state(&b.head, &b.content)?;
    }

    Ok((
        properties.ok_or(Error::InvalidData("missing ipco box"))?,
        associations.ok_or(Error::InvalidData("missing ipma box"))?,
    ))
}

/// Parse an Item Property Container Box. Every child occupies a slot, in
/// order, because 'ipma' refers to properties by 1-based position.
fn read_ipco<T: Read>(
    src: &mut BMFFBox<'_, T>,
    limits: &Limits,
    rows: &mut TryVec<DumpRow>,
) -> Result<TryVec<ItemProperty>> {
    let mut properties = TryVec::new();

    let mut iter = src.box_iter();
    while let Some(mut b) = iter.next_box()? {
        if properties.len() >= limits.max_children_per_box {
            return Err(Error::ResourceLimitExceeded("child box count exceeds limit"));
        }
        record(rows, 3, &b)?;
        let prop = match b.head.name {
            BoxType::ImageSpatialExtentsBox => ItemProperty::ImageSpatialExtents(read_ispe(&mut b)?),
            BoxType::HevcConfigurationBox => ItemProperty::HevcConfiguration(read_hvcc(&mut b)?),
            BoxType::AuxiliaryTypeProperty => ItemProperty::AuxiliaryType(read_auxc(&mut b)?),
            BoxType::ImageRotationBox => ItemProperty::Rotation(read_irot(&mut b)?),
            BoxType::ImageMirrorBox => ItemProperty::Mirror(read_imir(&mut b)?),
            BoxType::CleanApertureBox => ItemProperty::CleanAperture(read_clap(&mut b)?),
            BoxType::PixelInformationBox => ItemProperty::PixelInformation(read_pixi(&mut b)?),
            _ => {
                skip_box_remain(&mut b)?;
                ItemProperty::Unsupported
            }
        };
        // Parsers either consume their payload or error out; trailing
        // extension bytes were skipped by the parser itself.
        check_parser_state(&b.head, &b.content)?;
        properties.push(prop)?;
    }
    Ok(properties)
}

/// Parse an Item Property Association box.
/// See ISO 23008-12:2017 § 9.3.2
fn read_ipma<T: Read>(src: &mut BMFFBox<'_, T>) -> Result<TryVec<Association>> {
    let (version, flags) = read_fullbox_extra(src)?;

    let mut associations = TryVec::new();

    let entry_count = be_u32(src)?;
    for _ in 0..entry_count {
        let item_id = if version == 0 {
            be_u16(src)?.into()
        } else {
            be_u32(src)?
        };
        let association_count = src.read_u8()?;
        for _ in 0..association_count {
            let num_association_bytes = if flags & 1 == 1 { 2 } else { 1 };
            let association = &mut [0; 2][..num_association_bytes];
            src.read_exact(association)?;
            let mut association = BitReader::new(association);
            let essential = association.read_bool()?;
            let property_index = association.read_u16(association.remaining().try_into()?)?;
            associations.push(Association {
                item_id,
                essential,
                property_index,
            })?;
        }
    }
    Ok(associations)
}

/// Parse an Image Spatial Extents property box
/// See ISO 23008-12:2017 § 6.5.3
fn read_ispe<T: Read>(src: &mut BMFFBox<'_, T>) -> Result<ImageSpatialExtents> {
    let (_version, _flags) = read_fullbox_extra(src)?;

    let width = be_u32(src)?;
    let height = be_u32(src)?;

    if width == 0 || height == 0 {
        return Err(Error::InvalidData("ispe dimensions cannot be zero"));
    }

    Ok(ImageSpatialExtents { width, height })
}

/// Parse an HEVC Configuration property box.
/// See ISO 14496-15:2017 § 8.3.3.1
fn read_hvcc<T: Read>(src: &mut BMFFBox<'_, T>) -> Result<HevcConfiguration> {
    let configuration_version = src.read_u8()?;
    let byte = src.read_u8()?;
    let general_profile_space = (byte >> 6) & 0x3;
    let general_tier_flag = (byte >> 5) & 1 == 1;
    let general_profile_idc = byte & 0x1f;

    let general_profile_compatibility_flags = be_u32(src)?;

    let mut constraint_flags = 0u64;
    for _ in 0..6 {
        constraint_flags = (constraint_flags << 8) | u64::from(src.read_u8()?);
    }

    let general_level_idc = src.read_u8()?;
    let min_spatial_segmentation_idc = be_u16(src)? & 0x0fff;
    let parallelism_type = src.read_u8()? & 0x03;
    let chroma_format_idc = src.read_u8()? & 0x03;
    let bit_depth_luma = (src.read_u8()? & 0x07) + 8;
    let bit_depth_chroma = (src.read_u8()? & 0x07) + 8;
    let avg_frame_rate = be_u16(src)?;

    let byte = src.read_u8()?;
    let constant_frame_rate = (byte >> 6) & 0x03;
    let num_temporal_layers = (byte >> 3) & 0x07;
    let temporal_id_nested = (byte >> 2) & 1 == 1;
    let length_size = (byte & 0x03) + 1;

    let num_arrays = src.read_u8()?;
    let mut nal_arrays = TryVec::new();

    for _ in 0..num_arrays {
        let byte = src.read_u8()?;
        let completeness = (byte >> 6) & 1 == 1;
        let nal_unit_type = byte & 0x3f;

        let num_units = be_u16(src)?;
        let mut units = TryVec::new();
        for _ in 0..num_units {
            let size = be_u16(src)?;
            if size == 0 {
                // Ignore empty NAL units.
                continue;
            }
            let mut unit = std::vec::Vec::new();
            unit.try_reserve_exact(size.to_usize())
                .map_err(|_| Error::OutOfMemory)?;
            let got = src.by_ref().take(u64::from(size)).read_to_end(&mut unit)?;
            if got != size.to_usize() {
                return Err(Error::UnexpectedEOF);
            }
            units.push(unit.into())?;
        }

        nal_arrays.push(NalArray {
            completeness,
            nal_unit_type,
            units,
        })?;
    }

    skip_box_remain(src)?;

    Ok(HevcConfiguration {
        configuration_version,
        general_profile_space,
        general_tier_flag,
        general_profile_idc,
        general_profile_compatibility_flags,
        general_constraint_indicator_flags: constraint_flags,
        general_level_idc,
        min_spatial_segmentation_idc,
        parallelism_type,
        chroma_format_idc,
        bit_depth_luma,
        bit_depth_chroma,
        avg_frame_rate,
        constant_frame_rate,
        num_temporal_layers,
        temporal_id_nested,
        length_size,
        nal_arrays,
    })
}

/// Parse an Auxiliary Type property box.
/// See ISO 23008-12:2017 § 6.5.8
fn read_auxc<T: Read>(src: &mut BMFFBox<'_, T>) -> Result<AuxiliaryTypeProperty> {
    let (version, _flags) = read_fullbox_extra(src)?;
    if version != 0 {
        return Err(Error::Unsupported("unsupported auxC version"));
    }

    let aux_type = src.read_string()?;
    let subtypes = src.read_into_try_vec()?;

    Ok(AuxiliaryTypeProperty { aux_type, subtypes })
}

/// Parse an Image Rotation property box. Not a full box.
/// See ISO 23008-12:2017 § 6.5.10
fn read_irot<T: Read>(src: &mut BMFFBox<'_, T>) -> Result<u16> {
    let angle = src.read_u8()? & 0x03;
    skip_box_remain(src)?;
    Ok(u16::from(angle) * 90)
}

/// Parse an Image Mirror property box. Not a full box.
/// See ISO 23008-12:2017 § 6.5.12
fn read_imir<T: Read>(src: &mut BMFFBox<'_, T>) -> Result<MirrorAxis> {
    let axis = src.read_u8()?;
    skip_box_remain(src)?;
    Ok(if axis & 1 == 1 {
        MirrorAxis::Horizontal
    } else {
        MirrorAxis::Vertical
    })
}

/// Parse a Clean Aperture property box. Not a full box.
/// See ISO 14496-12:2015 § 12.1.4
fn read_clap<T: Read>(src: &mut BMFFBox<'_, T>) -> Result<CleanAperture> {
    let mut next = || -> Result<Fraction> {
        let numerator = be_u32(src)? as i32;
        let denominator = be_u32(src)? as i32;
        if denominator <= 0 {
            return Err(Error::InvalidData("invalid clean aperture denominator"));
        }
        Ok(Fraction::new(numerator, denominator))
    };
    Ok(CleanAperture {
        width: next()?,
        height: next()?,
        horizontal_offset: next()?,
        vertical_offset: next()?,
    })
}

/// Parse a Pixel Information property box.
/// See ISO 23008-12:2017 § 6.5.6
fn read_pixi<T: Read>(src: &mut BMFFBox<'_, T>) -> Result<ArrayVec<u8, 16>> {
    let (version, _flags) = read_fullbox_extra(src)?;
    if version != 0 {
        return Err(Error::Unsupported("unsupported pixi version"));
    }

    let num_channels = usize::from(src.read_u8()?);
    let mut channels = ArrayVec::new();
    channels.extend((0..num_channels.min(channels.capacity())).map(|_| 0));
    if num_channels != channels.len() {
        return Err(Error::InvalidData("invalid num_channels"));
    }
    src.read_exact(&mut channels)
        .map_err(|_| Error::InvalidData("invalid num_channels"))?;
    skip_box_remain(src)?;

    Ok(channels)
}

/// Parse a Data Information Box and its dref/url children. Nothing in the
/// image pipeline consumes these; only same-file data references are
/// supported anyway.
/// See ISO 14496-12:2015 § 8.7.1
fn read_dinf<T: Read>(
    src: &mut BMFFBox<'_, T>,
    limits: &Limits,
    rows: &mut TryVec<DumpRow>,
) -> Result<()> {
    let mut iter = src.box_iter();
    while let Some(mut b) = iter.next_box()? {
        record(rows, 2, &b)?;
        match b.head.name {
            BoxType::DataReferenceBox => read_dref(&mut b, limits, rows)?,
            _ => skip_box_content(&mut b)?,
        }
        check_parser_state(&b.head, &b.content)?;
    }
    Ok(())
}

/// Parse a Data Reference Box.
/// See ISO 14496-12:2015 § 8.7.2
fn read_dref<T: Read>(
    src: &mut BMFFBox<'_, T>,
    limits: &Limits,
    rows: &mut TryVec<DumpRow>,
) -> Result<()> {
    let (_version, _flags) = read_fullbox_extra(src)?;
    let entry_count = be_u32(src)?;
    if entry_count.to_usize() > limits.max_children_per_box {
        return Err(Error::ResourceLimitExceeded("child box count exceeds limit"));
    }

    let mut iter = src.box_iter();
    while let Some(mut b) = iter.next_box()? {
        record(rows, 3, &b)?;
        match b.head.name {
            BoxType::DataEntryUrlBox => {
                let (_version, flags) = read_fullbox_extra(&mut b)?;
                // Flag bit 0 means "data in this file"; a location string is
                // only present otherwise.
                if flags & 1 == 0 {
                    let location = b.read_string()?;
                    debug!("dref url location: {}", String::from_utf8_lossy(&location));
                }
                skip_box_remain(&mut b)?;
            }
            _ => skip_box_content(&mut b)?,
        }
        check_parser_state(&b.head, &b.content)?;
    }
    Ok(())
}

/// Parse a Groups List Box: entity groups are logged and discarded.
/// See ISO 14496-12:2015 § 8.18
fn read_grpl<T: Read>(src: &mut BMFFBox<'_, T>) -> Result<()> {
    let mut iter = src.box_iter();
    while let Some(mut b) = iter.next_box()? {
        let (_version, _flags) = read_fullbox_extra(&mut b)?;
        let group_id = be_u32(&mut b)?;
        let num_entities = be_u32(&mut b)?;
        debug!(
            "entity group {:?} id {group_id} with {num_entities} entities (ignored)",
            b.head.name
        );
        skip_box_remain(&mut b)?;
        check_parser_state(&b.head, &b.content)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests_util::{full_box, plain_box};

    fn bmff<'a>(head_name: BoxType, data: &'a mut &'a [u8]) -> BMFFBox<'a, &'a [u8]> {
        let len = data.len() as u64;
        BMFFBox {
            head: BoxHeader {
                name: head_name,
                size: len + 8,
                offset: 8,
                uuid: None,
            },
            content: Read::take(data, len),
        }
    }

    #[test]
    fn box_read_to_end() {
        let tmp = &mut b"1234567890".as_slice();
        let mut src = BMFFBox {
            head: BoxHeader {
                name: BoxType::FileTypeBox,
                size: 5,
                offset: 0,
                uuid: None,
            },
            content: Read::take(tmp, 5),
        };
        let buf = src.read_into_try_vec().unwrap();
        assert_eq!(buf.len(), 5);
        assert_eq!(buf, b"12345".as_ref());
    }

    #[test]
    fn box_read_to_end_oom() {
        let tmp = &mut b"1234567890".as_slice();
        let mut src = BMFFBox {
            head: BoxHeader {
                name: BoxType::FileTypeBox,
                size: 5,
                offset: 0,
                uuid: None,
            },
            // Large but not near u64::MAX (which indicates size=0 boxes)
            content: Read::take(tmp, u64::MAX / 2),
        };
        assert!(src.read_into_try_vec().is_err());
    }

    #[test]
    fn read_string_stops_at_nul() {
        let tmp = &mut b"pict\0trailing".as_slice();
        let mut src = bmff(BoxType::HandlerBox, tmp);
        assert_eq!(src.read_string().unwrap(), b"pict".as_ref());
        assert_eq!(src.read_string().unwrap(), b"trailing".as_ref());
        // Box exhausted; further reads yield the empty string.
        assert_eq!(src.read_string().unwrap(), b"".as_ref());
    }

    #[test]
    fn ipma_one_and_two_byte_associations() {
        // Entry: item 7, two associations; flags bit 0 clear → 1-byte form.
        let mut payload = vec![0, 0, 0, 0]; // version 0, flags 0
        payload.extend_from_slice(&1u32.to_be_bytes());
        payload.extend_from_slice(&7u16.to_be_bytes());
        payload.push(2);
        payload.push(0x81); // essential, index 1
        payload.push(0x02); // non-essential, index 2
        let mut data = payload.as_slice();
        let mut b = bmff(BoxType::ItemPropertyAssociationBox, &mut data);
        let assocs = read_ipma(&mut b).unwrap();
        assert_eq!(assocs.len(), 2);
        assert!(assocs[0].essential);
        assert_eq!(assocs[0].property_index, 1);
        assert!(!assocs[1].essential);
        assert_eq!(assocs[1].property_index, 2);

        // flags bit 0 set → 2-byte form with a 15-bit index.
        let mut payload = vec![0, 0, 0, 1];
        payload.extend_from_slice(&1u32.to_be_bytes());
        payload.extend_from_slice(&9u16.to_be_bytes());
        payload.push(1);
        payload.extend_from_slice(&0x8123u16.to_be_bytes());
        let mut data = payload.as_slice();
        let mut b = bmff(BoxType::ItemPropertyAssociationBox, &mut data);
        let assocs = read_ipma(&mut b).unwrap();
        assert_eq!(assocs.len(), 1);
        assert!(assocs[0].essential);
        assert_eq!(assocs[0].property_index, 0x0123);
    }

    #[test]
    fn iloc_folds_base_offset() {
        // version 1, offset/length size 4, base offset size 4, one item with
        // construction method 0 and one extent.
        let mut payload = vec![1, 0, 0, 0];
        payload.push(0x44); // offset_size=4, length_size=4
        payload.push(0x40); // base_offset_size=4, index_size=0
        payload.extend_from_slice(&1u16.to_be_bytes()); // item count
        payload.extend_from_slice(&1u16.to_be_bytes()); // item id
        payload.extend_from_slice(&0u16.to_be_bytes()); // method 0
        payload.extend_from_slice(&0u16.to_be_bytes()); // data ref index
        payload.extend_from_slice(&100u32.to_be_bytes()); // base offset
        payload.extend_from_slice(&1u16.to_be_bytes()); // extent count
        payload.extend_from_slice(&20u32.to_be_bytes()); // extent offset
        payload.extend_from_slice(&10u32.to_be_bytes()); // extent length
        let mut data = payload.as_slice();
        let mut b = bmff(BoxType::ItemLocationBox, &mut data);
        let items = read_iloc(&mut b, &Limits::default()).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].construction_method, ConstructionMethod::File);
        match &items[0].extents[0] {
            ExtentRange::WithLength(r) => assert_eq!((r.start, r.end), (120, 130)),
            other => panic!("unexpected extent {other:?}"),
        }
    }

    #[test]
    fn hvcc_annex_headers_framing() {
        let mut payload = vec![1u8]; // configuration version
        payload.push(0x60); // profile space/tier/idc
        payload.extend_from_slice(&0u32.to_be_bytes()); // compatibility
        payload.extend_from_slice(&[0; 6]); // constraint flags
        payload.push(93); // level
        payload.extend_from_slice(&0u16.to_be_bytes()); // min spatial seg
        payload.push(0); // parallelism
        payload.push(1); // chroma 4:2:0
        payload.push(0); // luma depth 8
        payload.push(0); // chroma depth 8
        payload.extend_from_slice(&0u16.to_be_bytes()); // avg frame rate
        payload.push(0x03); // length_size_minus_one = 3
        payload.push(2); // two arrays
        for (nal_type, unit) in [(32u8, &[0xAAu8, 0xBB][..]), (33, &[0xCC][..])] {
            payload.push(nal_type);
            payload.extend_from_slice(&1u16.to_be_bytes());
            payload.extend_from_slice(&(unit.len() as u16).to_be_bytes());
            payload.extend_from_slice(unit);
        }
        let mut data = payload.as_slice();
        let mut b = bmff(BoxType::HevcConfigurationBox, &mut data);
        let cfg = read_hvcc(&mut b).unwrap();
        assert_eq!(cfg.length_size, 4);
        assert_eq!(cfg.chroma_format_idc, 1);
        let headers = cfg.annex_headers().unwrap();
        assert_eq!(
            headers,
            [0, 0, 0, 2, 0xAA, 0xBB, 0, 0, 0, 1, 0xCC].as_ref()
        );
    }

    #[test]
    fn ispe_rejects_zero_dimensions() {
        let mut payload = vec![0, 0, 0, 0];
        payload.extend_from_slice(&0u32.to_be_bytes());
        payload.extend_from_slice(&480u32.to_be_bytes());
        let mut data = payload.as_slice();
        let mut b = bmff(BoxType::ImageSpatialExtentsBox, &mut data);
        assert!(matches!(read_ispe(&mut b), Err(Error::InvalidData(_))));
    }

    #[test]
    fn irot_masks_to_quarter_turns() {
        for (raw, expect) in [(0u8, 0u16), (1, 90), (2, 180), (3, 270), (7, 270)] {
            let payload = [raw];
            let mut data = payload.as_slice();
            let mut b = bmff(BoxType::ImageRotationBox, &mut data);
            assert_eq!(read_irot(&mut b).unwrap(), expect);
        }
    }

    #[test]
    fn meta_without_pict_handler_is_rejected() {
        let mut hdlr = Vec::new();
        hdlr.extend_from_slice(&0u32.to_be_bytes()); // pre_defined
        hdlr.extend_from_slice(b"vide");
        hdlr.extend_from_slice(&[0; 12]); // reserved
        hdlr.push(0); // empty name
        // meta payload: its own version/flags, then the hdlr child.
        let mut payload = vec![0, 0, 0, 0];
        payload.extend_from_slice(&full_box(b"hdlr", 0, 0, &hdlr));
        let mut data = payload.as_slice();
        let mut b = bmff(BoxType::MetadataBox, &mut data);
        let mut rows = TryVec::new();
        let err = read_heif_meta(&mut b, &Limits::default(), &mut rows).unwrap_err();
        assert!(matches!(err, Error::InvalidData("meta handler type is not 'pict'")));
    }

    #[test]
    fn unknown_top_level_boxes_are_skipped() {
        let mut ftyp = Vec::new();
        ftyp.extend_from_slice(b"mif1");
        ftyp.extend_from_slice(&0u32.to_be_bytes());
        ftyp.extend_from_slice(b"mif1");
        ftyp.extend_from_slice(b"heic");
        let mut file = plain_box(b"ftyp", &ftyp);
        file.extend_from_slice(&plain_box(b"free", b"junk"));
        // No meta: the parse must fail with the missing-root error, not an
        // unknown-box error.
        let err = read_heif(&file, &Limits::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidData("missing meta box")));
    }
}
