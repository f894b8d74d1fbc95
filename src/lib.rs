#![deny(unsafe_code)]
//! Parser for the HEIF image container (ISO Base Media File Format with a
//! `pict` handler, `heic` brand).
//!
//! From an untrusted byte stream this crate recovers the container's item
//! model (items, properties, locations, references) and interprets it into
//! a catalog of logical images: the primary image, top-level images,
//! thumbnails, alpha and depth auxiliaries, and Exif metadata. Coded
//! payloads are extracted with per-item byte extents and strict resource
//! limits; derived images (`grid` tiling, `iden` aliases, `iovl` overlays)
//! are assembled through a pluggable decoder registry.
//!
//! This crate is written entirely in safe Rust.
//!
//! ```no_run
//! use heif_parse::HeifContext;
//!
//! let bytes = std::fs::read("image.heic")?;
//! let ctx = HeifContext::from_bytes(&bytes)?;
//! let primary = ctx.image(ctx.primary_image_id()).unwrap();
//! println!("{}x{}", primary.width(), primary.height());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use log::{debug, warn};

use fallible_collections::TryReserveError;
use std::borrow::Cow;
use std::fmt::Write as _;
use std::io::Read;

mod boxes;
mod decoder;
mod derived;
mod image;
mod parse;
mod sei;

pub use crate::boxes::FourCC;
pub use crate::decoder::{CompressionFormat, Decoder, DecoderPlugin};
pub use crate::image::{Channel, Chroma, Colorspace, Image, Plane};
pub use crate::parse::{HevcConfiguration, ItemInfo, NalArray};
pub use crate::sei::{DepthRepresentationInfo, DepthValue};

use crate::decoder::DecoderRegistry;
use crate::derived::{compose_grid, compose_overlay, ImageGrid, ImageOverlay};
use crate::parse::{
    CleanAperture, ConstructionMethod, DumpRow, ExtentRange, HeifMeta, ItemLocation, ItemProperty,
    MdatBounds, MirrorAxis, ParsedFile,
};
use crate::sei::parse_depth_sei;

/// A trait to indicate a type can be infallibly converted to `u64`.
/// This should only be implemented for infallible conversions, so only unsigned types are valid.
trait ToU64 {
    fn to_u64(self) -> u64;
}

/// Statically verify that the platform `usize` can fit within a `u64`.
/// If the size won't fit on the given platform, this will fail at compile time, but if a type
/// which can fail `TryInto<usize>` is used, it may panic.
impl ToU64 for usize {
    fn to_u64(self) -> u64 {
        const _: () = assert!(std::mem::size_of::<usize>() <= std::mem::size_of::<u64>());
        self.try_into().ok().unwrap()
    }
}

/// A trait to indicate a type can be infallibly converted to `usize`.
/// This should only be implemented for infallible conversions, so only unsigned types are valid.
pub(crate) trait ToUsize {
    fn to_usize(self) -> usize;
}

/// Statically verify that the given type can fit within a `usize`.
/// If the size won't fit on the given platform, this will fail at compile time, but if a type
/// which can fail `TryInto<usize>` is used, it may panic.
macro_rules! impl_to_usize_from {
    ( $from_type:ty ) => {
        impl ToUsize for $from_type {
            fn to_usize(self) -> usize {
                const _: () = assert!(std::mem::size_of::<$from_type>() <= std::mem::size_of::<usize>());
                self.try_into().ok().unwrap()
            }
        }
    };
}

impl_to_usize_from!(u8);
impl_to_usize_from!(u16);
impl_to_usize_from!(u32);

#[doc(hidden)]
pub type TryVec<T> = fallible_collections::TryVec<T>;
pub(crate) type TryString = fallible_collections::TryVec<u8>;

// To ensure we don't use stdlib allocating types by accident
#[allow(dead_code)]
struct Vec;
#[allow(dead_code)]
struct HashMap;

/// Describes parser failures.
///
/// Each variant is a coarse error kind; the `&'static str` payload names the
/// specific condition.
#[derive(Debug)]
pub enum Error {
    /// Parse error caused by corrupt or malformed data, or an unresolvable
    /// cross-reference between container tables.
    InvalidData(&'static str),
    /// Recognized structure that this parser does not implement.
    Unsupported(&'static str),
    /// Reflect `std::io::ErrorKind::UnexpectedEof` for short data.
    UnexpectedEOF,
    /// Propagate underlying errors from `std::io`.
    Io(std::io::Error),
    /// Out of memory
    OutOfMemory,
    /// A security limit from [`Limits`] was exceeded during parsing.
    ResourceLimitExceeded(&'static str),
    /// The caller violated the API contract (e.g. a nonexistent image id).
    UsageError(&'static str),
    /// A decoder plugin failed to produce an image.
    DecoderError(&'static str),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Self::InvalidData(s)
            | Self::Unsupported(s)
            | Self::ResourceLimitExceeded(s)
            | Self::UsageError(s)
            | Self::DecoderError(s) => s,
            Self::UnexpectedEOF => "EOF",
            Self::Io(err) => return err.fmt(f),
            Self::OutOfMemory => "OOM",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for Error {}

impl From<bitreader::BitReaderError> for Error {
    #[cold]
    #[cfg_attr(debug_assertions, track_caller)]
    fn from(err: bitreader::BitReaderError) -> Self {
        log::warn!("bitreader: {err}");
        debug_assert!(!matches!(err, bitreader::BitReaderError::TooManyBitsForType { .. })); // bug
        Self::InvalidData("truncated bits")
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => Self::UnexpectedEOF,
            _ => Self::Io(err),
        }
    }
}

impl From<std::num::TryFromIntError> for Error {
    fn from(_: std::num::TryFromIntError) -> Self {
        Self::Unsupported("integer conversion failed")
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        let kind = match err {
            Error::InvalidData(_) => std::io::ErrorKind::InvalidData,
            Error::UnexpectedEOF => std::io::ErrorKind::UnexpectedEof,
            Error::Io(io_err) => return io_err,
            _ => std::io::ErrorKind::Other,
        };
        Self::new(kind, err)
    }
}

impl From<TryReserveError> for Error {
    fn from(_: TryReserveError) -> Self {
        Self::OutOfMemory
    }
}

/// Result shorthand using our Error enum.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Security limits enforced while parsing and extracting data.
///
/// Defaults are sized for untrusted input. Any violation surfaces as
/// [`Error::ResourceLimitExceeded`].
///
/// ```rust
/// use heif_parse::Limits;
///
/// // Default limits (suitable for most apps)
/// let limits = Limits::default();
///
/// // Raise the payload cap for very large stills
/// let limits = Limits::default().with_max_item_payload(200 * 1024 * 1024);
///
/// // No limits for trusted input
/// let limits = Limits::unlimited();
/// ```
#[derive(Debug, Clone)]
pub struct Limits {
    /// Maximum total bytes extracted for one item (headers plus extents).
    /// Default: 50 MiB.
    pub max_item_payload: u64,
    /// Maximum number of items in the `iloc` table. Default: 1024.
    pub max_iloc_items: usize,
    /// Maximum extents per `iloc` item. Default: 32.
    pub max_extents_per_item: usize,
    /// Maximum children per container box. Default: 1024.
    pub max_children_per_box: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_item_payload: 50 * 1024 * 1024,
            max_iloc_items: 1024,
            max_extents_per_item: 32,
            max_children_per_box: 1024,
        }
    }
}

impl Limits {
    /// Create limits that never trigger.
    pub fn unlimited() -> Self {
        Self {
            max_item_payload: u64::MAX,
            max_iloc_items: usize::MAX,
            max_extents_per_item: usize::MAX,
            max_children_per_box: usize::MAX,
        }
    }

    pub fn with_max_item_payload(mut self, bytes: u64) -> Self {
        self.max_item_payload = bytes;
        self
    }

    pub fn with_max_iloc_items(mut self, items: usize) -> Self {
        self.max_iloc_items = items;
        self
    }

    pub fn with_max_extents_per_item(mut self, extents: usize) -> Self {
        self.max_extents_per_item = extents;
        self
    }

    pub fn with_max_children_per_box(mut self, children: usize) -> Self {
        self.max_children_per_box = children;
        self
    }
}

/// A signed rational with directed rounding, used by clean-aperture math.
///
/// Arithmetic widens to 64 bits internally and reduces by the gcd, so
/// realistic clean-aperture fractions never lose precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Fraction {
    numerator: i32,
    denominator: i32,
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

impl Fraction {
    pub(crate) const fn new(numerator: i32, denominator: i32) -> Self {
        Self { numerator, denominator }
    }

    fn make(mut n: i64, mut d: i64) -> Self {
        debug_assert!(d > 0);
        let g = gcd(n.unsigned_abs(), d.unsigned_abs());
        if g > 1 {
            n /= g as i64;
            d /= g as i64;
        }
        // Degenerate inputs can still overflow 32 bits; halve until they fit.
        while n > i64::from(i32::MAX) || n < i64::from(i32::MIN) || d > i64::from(i32::MAX) {
            n >>= 1;
            d >>= 1;
        }
        Self {
            numerator: n as i32,
            denominator: d.max(1) as i32,
        }
    }

    /// Truncate toward zero.
    #[allow(unused)]
    pub(crate) fn round_down(self) -> i32 {
        self.numerator / self.denominator
    }

    #[allow(unused)]
    pub(crate) fn round_up(self) -> i32 {
        ((i64::from(self.numerator) + i64::from(self.denominator) - 1) / i64::from(self.denominator))
            as i32
    }

    /// Round to nearest; ties round up.
    pub(crate) fn round(self) -> i32 {
        ((i64::from(self.numerator) + i64::from(self.denominator) / 2) / i64::from(self.denominator))
            as i32
    }
}

impl std::ops::Add for Fraction {
    type Output = Self;

    fn add(self, b: Self) -> Self {
        if self.denominator == b.denominator {
            Self::make(
                i64::from(self.numerator) + i64::from(b.numerator),
                i64::from(self.denominator),
            )
        } else {
            Self::make(
                i64::from(self.numerator) * i64::from(b.denominator)
                    + i64::from(b.numerator) * i64::from(self.denominator),
                i64::from(self.denominator) * i64::from(b.denominator),
            )
        }
    }
}

impl std::ops::Sub for Fraction {
    type Output = Self;

    fn sub(self, b: Self) -> Self {
        if self.denominator == b.denominator {
            Self::make(
                i64::from(self.numerator) - i64::from(b.numerator),
                i64::from(self.denominator),
            )
        } else {
            Self::make(
                i64::from(self.numerator) * i64::from(b.denominator)
                    - i64::from(b.numerator) * i64::from(self.denominator),
                i64::from(self.denominator) * i64::from(b.denominator),
            )
        }
    }
}

impl std::ops::Sub<i32> for Fraction {
    type Output = Self;

    fn sub(self, v: i32) -> Self {
        Self::make(
            i64::from(self.numerator) - i64::from(v) * i64::from(self.denominator),
            i64::from(self.denominator),
        )
    }
}

impl std::ops::Div<i32> for Fraction {
    type Output = Self;

    fn div(self, v: i32) -> Self {
        debug_assert!(v > 0);
        Self::make(
            i64::from(self.numerator),
            i64::from(self.denominator) * i64::from(v),
        )
    }
}

impl CleanAperture {
    /// pcX = horizontal_offset + (width-1)/2; the aperture spans
    /// pcX ± (clap_width-1)/2, rounded to nearest.
    fn left_rounded(&self, image_width: i32) -> i32 {
        let pc_x = self.horizontal_offset + Fraction::new(image_width - 1, 2);
        (pc_x - (self.width - 1) / 2).round()
    }

    fn right_rounded(&self, image_width: i32) -> i32 {
        let pc_x = self.horizontal_offset + Fraction::new(image_width - 1, 2);
        (pc_x + (self.width - 1) / 2).round()
    }

    fn top_rounded(&self, image_height: i32) -> i32 {
        let pc_y = self.vertical_offset + Fraction::new(image_height - 1, 2);
        (pc_y - (self.height - 1) / 2).round()
    }

    fn bottom_rounded(&self, image_height: i32) -> i32 {
        let pc_y = self.vertical_offset + Fraction::new(image_height - 1, 2);
        (pc_y + (self.height - 1) / 2).round()
    }

    /// Intrinsic aperture width, independent of the image size.
    fn width_rounded(&self) -> i32 {
        let left = (Fraction::new(0, 1) - (self.width - 1) / 2).round();
        let right = ((self.width - 1) / 2).round();
        right + 1 - left
    }

    fn height_rounded(&self) -> i32 {
        let top = (Fraction::new(0, 1) - (self.height - 1) / 2).round();
        let bottom = ((self.height - 1) / 2).round();
        bottom + 1 - top
    }
}

const AUX_TYPE_ALPHA_AVC: &[u8] = b"urn:mpeg:avc:2015:auxid:1";
const AUX_TYPE_ALPHA_HEVC: &[u8] = b"urn:mpeg:hevc:2015:auxid:1";
const AUX_TYPE_DEPTH_HEVC: &[u8] = b"urn:mpeg:hevc:2015:auxid:2";

/// The role a logical image plays in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageRole {
    /// A directly presentable image.
    Master,
    /// Thumbnail of the given image id.
    Thumbnail(u32),
    /// Alpha channel of the given image id.
    Alpha(u32),
    /// Depth channel of the given image id.
    Depth(u32),
}

/// A metadata block (e.g. Exif) attached to an image.
#[derive(Debug)]
pub struct MetadataBlock {
    pub item_type: FourCC,
    pub data: TryVec<u8>,
}

/// One interpreted image from the catalog.
///
/// Built during context construction and immutable afterwards.
#[derive(Debug)]
pub struct LogicalImage {
    id: u32,
    primary: bool,
    width: u32,
    height: u32,
    role: ImageRole,
    thumbnails: TryVec<u32>,
    alpha: Option<u32>,
    depth: Option<u32>,
    metadata: TryVec<MetadataBlock>,
    depth_info: Option<DepthRepresentationInfo>,
}

impl LogicalImage {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn is_primary(&self) -> bool {
        self.primary
    }

    /// Logical width after clean-aperture and rotation properties.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Logical height after clean-aperture and rotation properties.
    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn role(&self) -> ImageRole {
        self.role
    }

    pub fn thumbnail_ids(&self) -> &[u32] {
        &self.thumbnails
    }

    pub fn alpha_id(&self) -> Option<u32> {
        self.alpha
    }

    pub fn depth_id(&self) -> Option<u32> {
        self.depth
    }

    pub fn metadata(&self) -> &[MetadataBlock] {
        &self.metadata
    }

    /// Depth-representation info, present on depth auxiliary images whose
    /// `auxC` subtype bytes carried a depth SEI message.
    pub fn depth_representation_info(&self) -> Option<&DepthRepresentationInfo> {
        self.depth_info.as_ref()
    }
}

/// Options for [`HeifContext::decode_image`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DecodeOptions {
    /// Skip irot/imir/clap transformation properties.
    pub ignore_transformations: bool,
    /// Convert the result to this colorspace; `None` preserves the source.
    pub target_colorspace: Option<Colorspace>,
    /// Convert the result to this chroma format; `None` preserves the source.
    pub target_chroma: Option<Chroma>,
}

enum AuxKind {
    Alpha,
    Depth(Option<DepthRepresentationInfo>),
    Other,
}

/// A parsed and interpreted HEIF file backed by a borrowed or owned buffer.
///
/// Construction parses the box tree and interprets the item model in one
/// pass; a returned context is fully interpreted and read-only, except for
/// decoder registration.
///
/// | Constructor | Lifetime | Copies the input? |
/// |-------------|----------|-------------------|
/// | [`from_bytes`](Self::from_bytes) | `'data` | No, borrows the slice |
/// | [`from_owned`](Self::from_owned) | `'static` | No, takes the buffer |
/// | [`from_reader`](Self::from_reader) | `'static` | Reads all, then owns |
/// | [`from_file`](Self::from_file) | `'static` | Reads all, then owns |
pub struct HeifContext<'data> {
    raw: Cow<'data, [u8]>,
    meta: HeifMeta,
    mdat_bounds: TryVec<MdatBounds>,
    dump_rows: TryVec<DumpRow>,
    limits: Limits,
    images: TryVec<LogicalImage>,
    top_level: TryVec<u32>,
    primary_id: u32,
    decoders: DecoderRegistry,
}

impl<'data> HeifContext<'data> {
    // ========================================
    // Constructors
    // ========================================

    /// Parse a HEIF file from a borrowed byte slice.
    pub fn from_bytes(data: &'data [u8]) -> Result<Self> {
        Self::from_bytes_with_limits(data, &Limits::default())
    }

    /// Parse a HEIF file from a borrowed byte slice with custom limits.
    pub fn from_bytes_with_limits(data: &'data [u8], limits: &Limits) -> Result<Self> {
        let parsed = parse::read_heif(data, limits)?;
        Self::build(Cow::Borrowed(data), parsed, limits)
    }

    /// Parse a HEIF file from an owned buffer.
    pub fn from_owned(data: std::vec::Vec<u8>) -> Result<HeifContext<'static>> {
        HeifContext::from_owned_with_limits(data, &Limits::default())
    }

    /// Parse a HEIF file from an owned buffer with custom limits.
    pub fn from_owned_with_limits(
        data: std::vec::Vec<u8>,
        limits: &Limits,
    ) -> Result<HeifContext<'static>> {
        let parsed = parse::read_heif(&data, limits)?;
        HeifContext::build(Cow::Owned(data), parsed, limits)
    }

    /// Parse a HEIF file from a reader (reads all bytes, then parses).
    pub fn from_reader<R: Read>(reader: &mut R) -> Result<HeifContext<'static>> {
        HeifContext::from_reader_with_limits(reader, &Limits::default())
    }

    /// Parse a HEIF file from a reader with custom limits.
    pub fn from_reader_with_limits<R: Read>(
        reader: &mut R,
        limits: &Limits,
    ) -> Result<HeifContext<'static>> {
        let mut buf = std::vec::Vec::new();
        reader.read_to_end(&mut buf)?;
        HeifContext::from_owned_with_limits(buf, limits)
    }

    /// Parse a HEIF file from a path.
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<HeifContext<'static>> {
        let mut file = std::fs::File::open(path)?;
        HeifContext::from_reader(&mut file)
    }

    fn build(raw: Cow<'data, [u8]>, parsed: ParsedFile, limits: &Limits) -> Result<Self> {
        let ParsedFile {
            ftyp: _,
            meta,
            mdat_bounds,
            dump_rows,
        } = parsed;

        let mut ctx = Self {
            raw,
            meta,
            mdat_bounds,
            dump_rows,
            limits: limits.clone(),
            images: TryVec::new(),
            top_level: TryVec::new(),
            primary_id: 0,
            decoders: DecoderRegistry::new(),
        };
        ctx.interpret()?;
        Ok(ctx)
    }

    // ========================================
    // Interpretation
    // ========================================

    fn interpret(&mut self) -> Result<()> {
        // --- reference all image items; hidden ones stay addressable but
        //     are dropped from the top-level list

        for info in self.meta.item_infos.iter() {
            if !item_type_is_image(info.item_type) {
                continue;
            }
            self.images.push(LogicalImage {
                id: info.item_id,
                primary: false,
                width: 0,
                height: 0,
                role: ImageRole::Master,
                thumbnails: TryVec::new(),
                alpha: None,
                depth: None,
                metadata: TryVec::new(),
                depth_info: None,
            })?;
            if !info.hidden {
                self.top_level.push(info.item_id)?;
            }
        }

        let primary_id = self.meta.primary_item_id;
        if !self.top_level.iter().any(|&id| id == primary_id) {
            return Err(Error::InvalidData("pitm box references a non-existing image"));
        }
        self.primary_id = primary_id;
        if let Some(idx) = self.image_index(primary_id) {
            self.images[idx].primary = true;
        }

        // --- remove thumbnails and auxiliaries from the top-level list and
        //     attach them to their master image

        let mut ids = TryVec::with_capacity(self.images.len())?;
        for img in self.images.iter() {
            ids.push(img.id)?;
        }

        for &id in ids.iter() {
            let Some((ref_type, refs)) = first_reference_group(&self.meta, id)? else {
                continue;
            };

            if ref_type == b"thmb" {
                if refs.len() != 1 {
                    return Err(Error::InvalidData("too many thumbnail references"));
                }
                let master = refs[0];
                let master_idx = self
                    .image_index(master)
                    .ok_or(Error::InvalidData("thumbnail references a non-existing image"))?;
                if matches!(self.images[master_idx].role, ImageRole::Thumbnail(_)) {
                    return Err(Error::InvalidData("thumbnail references another thumbnail"));
                }

                let idx = self.image_index(id).expect("catalog id");
                self.images[idx].role = ImageRole::Thumbnail(master);
                self.images[master_idx].thumbnails.push(id)?;
                self.remove_top_level_image(id)?;
            } else if ref_type == b"auxl" {
                let kind = {
                    let props = properties_for_item(&self.meta, id)?;
                    let auxc = props
                        .iter()
                        .find_map(|&(p, _)| match p {
                            ItemProperty::AuxiliaryType(a) => Some(a),
                            _ => None,
                        })
                        .ok_or(Error::InvalidData("no auxC property for auxiliary image"))?;
                    let aux_type: &[u8] = &auxc.aux_type;
                    if aux_type == AUX_TYPE_ALPHA_AVC || aux_type == AUX_TYPE_ALPHA_HEVC {
                        AuxKind::Alpha
                    } else if aux_type == AUX_TYPE_DEPTH_HEVC {
                        AuxKind::Depth(parse_depth_sei(&auxc.subtypes)?)
                    } else {
                        warn!("unhandled auxiliary type for item {id}");
                        AuxKind::Other
                    }
                };

                if refs.len() != 1 {
                    return Err(Error::InvalidData("too many auxiliary image references"));
                }
                let master = refs[0];
                let master_idx = self
                    .image_index(master)
                    .ok_or(Error::InvalidData("auxiliary references a non-existing image"))?;
                let idx = self.image_index(id).expect("catalog id");

                match kind {
                    AuxKind::Alpha => {
                        self.images[idx].role = ImageRole::Alpha(master);
                        self.images[master_idx].alpha = Some(id);
                    }
                    AuxKind::Depth(info) => {
                        self.images[idx].role = ImageRole::Depth(master);
                        self.images[idx].depth_info = info;
                        self.images[master_idx].depth = Some(id);
                    }
                    AuxKind::Other => {}
                }

                self.remove_top_level_image(id)?;
            }
        }

        // --- read each image's properties and extract its resolution

        for idx in 0..self.images.len() {
            let id = self.images[idx].id;
            let (width, height) = resolve_dimensions(&self.meta, id)?;
            self.images[idx].width = width;
            self.images[idx].height = height;
        }

        // --- read metadata items and assign them to their described image

        let mut exif_ids = TryVec::new();
        for info in self.meta.item_infos.iter() {
            if info.item_type == b"Exif" {
                exif_ids.push((info.item_id, info.item_type))?;
            }
        }

        for &(id, item_type) in exif_ids.iter() {
            let data = self.item_data(id)?;

            let Some((ref_type, refs)) = first_reference_group(&self.meta, id)? else {
                continue;
            };
            if ref_type != b"cdsc" {
                continue;
            }
            if refs.len() != 1 {
                return Err(Error::InvalidData("metadata not assigned to exactly one image"));
            }
            let target_idx = self
                .image_index(refs[0])
                .ok_or(Error::InvalidData("metadata assigned to a non-existing image"))?;
            self.images[target_idx]
                .metadata
                .push(MetadataBlock { item_type, data })?;
        }

        Ok(())
    }

    fn image_index(&self, id: u32) -> Option<usize> {
        self.images.iter().position(|img| img.id == id)
    }

    fn remove_top_level_image(&mut self, id: u32) -> Result<()> {
        let mut new_list = TryVec::new();
        for &img in self.top_level.iter() {
            if img != id {
                new_list.push(img)?;
            }
        }
        self.top_level = new_list;
        Ok(())
    }

    // ========================================
    // Queries
    // ========================================

    /// The id named by the `pitm` box. Always a valid image id.
    pub fn primary_image_id(&self) -> u32 {
        self.primary_id
    }

    pub fn primary_image(&self) -> &LogicalImage {
        self.image(self.primary_id).expect("primary image exists")
    }

    /// Non-hidden images that are neither thumbnails nor auxiliaries, in
    /// file order.
    pub fn top_level_image_ids(&self) -> &[u32] {
        &self.top_level
    }

    /// All interpreted images, including hidden, thumbnail and auxiliary
    /// ones.
    pub fn images(&self) -> &[LogicalImage] {
        &self.images
    }

    pub fn image(&self, id: u32) -> Option<&LogicalImage> {
        self.images.iter().find(|img| img.id == id)
    }

    /// Raw `iinf` table entry for an item id, including non-image items.
    pub fn item_info(&self, item_id: u32) -> Option<&ItemInfo> {
        self.meta.item_infos.iter().find(|i| i.item_id == item_id)
    }

    /// The HEVC decoder configuration associated with a coded image, if any.
    pub fn hevc_configuration(&self, item_id: u32) -> Option<&HevcConfiguration> {
        let props = properties_for_item(&self.meta, item_id).ok()?;
        props.iter().find_map(|&(p, _)| match p {
            ItemProperty::HevcConfiguration(c) => Some(c),
            _ => None,
        })
    }

    /// Human-readable dump of the parsed box tree.
    pub fn debug_dump_boxes(&self) -> String {
        let mut out = String::new();
        for row in self.dump_rows.iter() {
            for _ in 0..row.depth {
                out.push_str("  ");
            }
            if row.size == u64::MAX {
                let _ = writeln!(out, "'{}' size to end of file", row.name);
            } else {
                let _ = writeln!(out, "'{}' size {}", row.name, row.size);
            }
        }
        out
    }

    // ========================================
    // Payload extraction
    // ========================================

    /// Extract an item's coded payload.
    ///
    /// For `hvc1` items the parameter-set NAL units from the item's `hvcC`
    /// property are prepended in 4-byte length-prefixed framing. `grid`,
    /// `iovl` and `Exif` payloads are returned verbatim.
    pub fn item_data(&self, item_id: u32) -> Result<TryVec<u8>> {
        let info = self
            .meta
            .item_infos
            .iter()
            .find(|i| i.item_id == item_id)
            .ok_or(Error::UsageError("no item with the requested id"))?;
        let loc = self
            .meta
            .iloc_items
            .iter()
            .find(|l| l.item_id == item_id)
            .ok_or(Error::InvalidData("item has no data location"))?;

        let mut data = TryVec::new();

        if info.item_type == b"hvc1" {
            let props = properties_for_item(&self.meta, item_id)?;
            let hvcc = props
                .iter()
                .find_map(|&(p, _)| match p {
                    ItemProperty::HevcConfiguration(c) => Some(c),
                    _ => None,
                })
                .ok_or(Error::InvalidData("no hvcC property for coded image"))?;
            let mut headers = hvcc.annex_headers()?;
            data.append(&mut headers)?;
        } else if info.item_type == b"grid"
            || info.item_type == b"iovl"
            || info.item_type == b"Exif"
        {
            // Extents verbatim.
        } else {
            return Err(Error::Unsupported("unsupported codec"));
        }

        self.append_extents(loc, &mut data)?;
        Ok(data)
    }

    fn append_extents(&self, loc: &ItemLocation, data: &mut TryVec<u8>) -> Result<()> {
        for extent in loc.extents.iter() {
            let slice = match loc.construction_method {
                ConstructionMethod::File => self.file_extent(extent)?,
                ConstructionMethod::Idat => self.idat_extent(extent)?,
                ConstructionMethod::Item => {
                    return Err(Error::Unsupported(
                        "construction method 'item' is not supported",
                    ))
                }
            };

            let total = data
                .len()
                .to_u64()
                .checked_add(slice.len().to_u64())
                .ok_or(Error::InvalidData("payload size overflow"))?;
            if total > self.limits.max_item_payload {
                return Err(Error::ResourceLimitExceeded("item payload exceeds memory limit"));
            }

            data.extend_from_slice(slice)?;
        }
        Ok(())
    }

    fn file_extent(&self, extent: &ExtentRange) -> Result<&[u8]> {
        let raw = self.raw.as_ref();
        let start = usize::try_from(extent.start())?;

        let end = match extent {
            ExtentRange::WithLength(range) => {
                let len = range
                    .end
                    .checked_sub(range.start)
                    .ok_or(Error::InvalidData("extent range start > end"))?;
                start
                    .checked_add(usize::try_from(len)?)
                    .ok_or(Error::InvalidData("extent end overflow"))?
            }
            ExtentRange::ToEnd(_) => {
                // Zero-length extents span the rest of their mdat.
                let offset = extent.start();
                self.mdat_bounds
                    .iter()
                    .find(|m| offset >= m.offset && offset < m.offset + m.length)
                    .map(|m| usize::try_from(m.offset + m.length))
                    .transpose()?
                    .unwrap_or(raw.len())
            }
        };

        raw.get(start..end)
            .ok_or(Error::InvalidData("extent references data outside of file"))
    }

    fn idat_extent(&self, extent: &ExtentRange) -> Result<&[u8]> {
        let idat = self
            .meta
            .idat
            .as_ref()
            .ok_or(Error::InvalidData("idat box missing but construction method is idat"))?;
        let start = usize::try_from(extent.start())?;

        match extent {
            ExtentRange::WithLength(range) => {
                let len = range
                    .end
                    .checked_sub(range.start)
                    .ok_or(Error::InvalidData("extent range start > end"))?;
                let end = start
                    .checked_add(usize::try_from(len)?)
                    .ok_or(Error::InvalidData("extent end overflow"))?;
                idat.get(start..end)
                    .ok_or(Error::InvalidData("extent exceeds idat size"))
            }
            ExtentRange::ToEnd(_) => idat
                .get(start..)
                .ok_or(Error::InvalidData("extent exceeds idat size")),
        }
    }

    // ========================================
    // Decoding
    // ========================================

    /// Register a decoder plugin with this context.
    pub fn register_decoder(&mut self, plugin: std::boxed::Box<dyn DecoderPlugin>) -> Result<()> {
        self.decoders.register(plugin)
    }

    /// Decode an image to pixels, assembling derived images and applying
    /// transformation properties.
    pub fn decode_image(&self, item_id: u32, options: &DecodeOptions) -> Result<Image> {
        if self.image_index(item_id).is_none() {
            return Err(Error::UsageError("no image with the requested id"));
        }

        let mut visited = std::vec::Vec::new();
        let mut img =
            self.decode_recursive(item_id, &mut visited, options.ignore_transformations)?;

        let target_colorspace = options.target_colorspace.unwrap_or_else(|| img.colorspace());
        let target_chroma = options.target_chroma.unwrap_or_else(|| img.chroma());
        if target_colorspace != img.colorspace() || target_chroma != img.chroma() {
            img = img.convert_colorspace(target_colorspace, target_chroma)?;
        }

        Ok(img)
    }

    fn decode_recursive(
        &self,
        item_id: u32,
        visited: &mut std::vec::Vec<u32>,
        ignore_transformations: bool,
    ) -> Result<Image> {
        if visited.contains(&item_id) {
            return Err(Error::InvalidData("cyclic item references"));
        }
        visited.push(item_id);
        let result = self.decode_inner(item_id, visited, ignore_transformations);
        visited.pop();
        result
    }

    fn decode_inner(
        &self,
        item_id: u32,
        visited: &mut std::vec::Vec<u32>,
        ignore_transformations: bool,
    ) -> Result<Image> {
        let item_type = self
            .meta
            .item_infos
            .iter()
            .find(|i| i.item_id == item_id)
            .map(|i| i.item_type)
            .ok_or(Error::InvalidData("referenced item does not exist"))?;

        let mut img = if item_type == b"hvc1" {
            let plugin = self
                .decoders
                .best_for(CompressionFormat::Hevc)
                .ok_or(Error::Unsupported("no decoder for compression format"))?;
            let data = self.item_data(item_id)?;
            let mut decoder = plugin.new_decoder()?;
            decoder.push_data(&data)?;
            decoder.decode_image()?
        } else if item_type == b"grid" {
            let data = self.item_data(item_id)?;
            let grid = ImageGrid::parse(&data)?;
            let tiles = references_of_type(&self.meta, item_id, FourCC::from(*b"dimg"))?;
            compose_grid(&grid, &tiles, |tile_id| {
                self.decode_recursive(tile_id, visited, false)
            })?
        } else if item_type == b"iden" {
            let refs = references_of_type(&self.meta, item_id, FourCC::from(*b"dimg"))?;
            if refs.len() != 1 {
                return Err(Error::InvalidData("'iden' image must have exactly one reference"));
            }
            self.decode_recursive(refs[0], visited, false)?
        } else if item_type == b"iovl" {
            let data = self.item_data(item_id)?;
            let refs = references_of_type(&self.meta, item_id, FourCC::from(*b"dimg"))?;
            let overlay = ImageOverlay::parse(refs.len(), &data)?;
            compose_overlay(&overlay, &refs, |overlay_id| {
                self.decode_recursive(overlay_id, visited, false)
            })?
        } else {
            return Err(Error::Unsupported("unsupported image type"));
        };

        // --- add the alpha channel, if the catalog attached one

        if let Some(idx) = self.image_index(item_id) {
            if let Some(alpha_id) = self.images[idx].alpha {
                let alpha = self.decode_recursive(alpha_id, visited, false)?;
                if alpha.width() != img.width() || alpha.height() != img.height() {
                    return Err(Error::InvalidData("alpha image size does not match master image"));
                }
                img.transfer_plane_from_image_as(&alpha, Channel::Y, Channel::Alpha)?;
            }
        }

        // --- apply transformation properties in file order

        if !ignore_transformations {
            img = self.apply_transformations(item_id, img)?;
        }

        Ok(img)
    }

    fn apply_transformations(&self, item_id: u32, mut img: Image) -> Result<Image> {
        let props = properties_for_item(&self.meta, item_id)?;

        for &(prop, _essential) in props.iter() {
            match prop {
                ItemProperty::Rotation(degrees) => {
                    if *degrees != 0 {
                        img = img.rotate_ccw(*degrees)?;
                    }
                }
                ItemProperty::Mirror(axis) => {
                    img.mirror_inplace(*axis == MirrorAxis::Horizontal);
                }
                ItemProperty::CleanAperture(clap) => {
                    let img_width = i32::try_from(img.width())?;
                    let img_height = i32::try_from(img.height())?;

                    let mut left = clap.left_rounded(img_width);
                    let mut top = clap.top_rounded(img_height);
                    let mut right = clap.right_rounded(img_width);
                    let mut bottom = clap.bottom_rounded(img_height);

                    if left < 0 {
                        left = 0;
                    }
                    if top < 0 {
                        top = 0;
                    }
                    if right >= img_width {
                        right = img_width - 1;
                    }
                    if bottom >= img_height {
                        bottom = img_height - 1;
                    }

                    if left >= right || top >= bottom {
                        return Err(Error::InvalidData("invalid clean aperture"));
                    }

                    img = img.crop(left as u32, right as u32, top as u32, bottom as u32)?;
                }
                _ => {}
            }
        }

        Ok(img)
    }
}

fn item_type_is_image(item_type: FourCC) -> bool {
    item_type == b"hvc1" || item_type == b"grid" || item_type == b"iden" || item_type == b"iovl"
}

/// Resolve an item's ordered property list through the `ipma` associations.
///
/// Index 0 entries are skipped; indices past the end of the `ipco` array are
/// a parse error.
fn properties_for_item(meta: &HeifMeta, item_id: u32) -> Result<TryVec<(&ItemProperty, bool)>> {
    let mut found = false;
    let mut out = TryVec::new();

    for assoc in meta.associations.iter().filter(|a| a.item_id == item_id) {
        found = true;
        let index = usize::from(assoc.property_index);
        if index == 0 {
            continue;
        }
        if index > meta.properties.len() {
            return Err(Error::InvalidData("ipma references a nonexisting property"));
        }
        out.push((&meta.properties[index - 1], assoc.essential))?;
    }

    if !found {
        return Err(Error::InvalidData("item has no properties assigned to it in ipma box"));
    }

    Ok(out)
}

/// The type and ordered targets of the first reference group originating at
/// `item_id`, if any.
fn first_reference_group(meta: &HeifMeta, item_id: u32) -> Result<Option<(FourCC, TryVec<u32>)>> {
    let Some(first) = meta
        .item_references
        .iter()
        .find(|r| r.from_item_id == item_id)
    else {
        return Ok(None);
    };
    let ref_type = first.item_type;
    let refs = references_of_type(meta, item_id, ref_type)?;
    Ok(Some((ref_type, refs)))
}

/// Targets of all `ref_type` references from `item_id`, ordered by
/// reference index (the `dimg` tile order).
fn references_of_type(meta: &HeifMeta, item_id: u32, ref_type: FourCC) -> Result<TryVec<u32>> {
    let mut with_index: TryVec<(u16, u32)> = TryVec::new();
    for r in meta.item_references.iter() {
        if r.from_item_id == item_id && r.item_type == ref_type {
            with_index.push((r.reference_index, r.to_item_id))?;
        }
    }
    with_index.sort_by_key(|&(idx, _)| idx);

    let mut out = TryVec::with_capacity(with_index.len())?;
    for &(_, to) in with_index.iter() {
        out.push(to)?;
    }
    Ok(out)
}

/// Walk an image's properties and derive its logical dimensions: `ispe`
/// establishes them, `clap` replaces them with the rounded aperture, and a
/// 90°/270° `irot` swaps them.
fn resolve_dimensions(meta: &HeifMeta, item_id: u32) -> Result<(u32, u32)> {
    let props = properties_for_item(meta, item_id)?;

    let mut width = 0u32;
    let mut height = 0u32;
    let mut ispe_read = false;

    for &(prop, _essential) in props.iter() {
        match prop {
            ItemProperty::ImageSpatialExtents(ispe) => {
                if ispe.width >= i32::MAX as u32 || ispe.height >= i32::MAX as u32 {
                    return Err(Error::ResourceLimitExceeded("image size exceeds the maximum"));
                }
                width = ispe.width;
                height = ispe.height;
                ispe_read = true;
            }
            ItemProperty::CleanAperture(clap) if ispe_read => {
                let w = clap.width_rounded();
                let h = clap.height_rounded();
                if w <= 0 || h <= 0 {
                    return Err(Error::InvalidData("invalid clean aperture"));
                }
                width = w as u32;
                height = h as u32;
            }
            ItemProperty::Rotation(degrees) if ispe_read => {
                if *degrees == 90 || *degrees == 270 {
                    std::mem::swap(&mut width, &mut height);
                }
            }
            _ => {}
        }
    }

    debug!("item {item_id} logical size {width}x{height}");
    Ok((width, height))
}

#[cfg(test)]
pub(crate) mod tests_util {
    /// A plain box: 32-bit size, fourcc, payload.
    pub(crate) fn plain_box(name: &[u8; 4], payload: &[u8]) -> std::vec::Vec<u8> {
        let mut out = std::vec::Vec::new();
        out.extend_from_slice(&(payload.len() as u32 + 8).to_be_bytes());
        out.extend_from_slice(name);
        out.extend_from_slice(payload);
        out
    }

    /// A full box: plain box with a version byte and 24-bit flags.
    pub(crate) fn full_box(
        name: &[u8; 4],
        version: u8,
        flags: u32,
        payload: &[u8],
    ) -> std::vec::Vec<u8> {
        let mut body = std::vec::Vec::new();
        body.push(version);
        body.extend_from_slice(&flags.to_be_bytes()[1..]);
        body.extend_from_slice(payload);
        plain_box(name, &body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fraction_arithmetic() {
        let a = Fraction::new(1, 2);
        let b = Fraction::new(1, 3);
        assert_eq!(a + b, Fraction::new(5, 6));
        assert_eq!(a - b, Fraction::new(1, 6));
        assert_eq!(Fraction::new(7, 2) - 1, Fraction::new(5, 2));
        assert_eq!(Fraction::new(7, 2) / 2, Fraction::new(7, 4));
    }

    #[test]
    fn fraction_rounding() {
        assert_eq!(Fraction::new(7, 2).round(), 4);
        assert_eq!(Fraction::new(7, 2).round_down(), 3);
        assert_eq!(Fraction::new(7, 2).round_up(), 4);
        assert_eq!(Fraction::new(6, 2).round(), 3);
        // Truncating division semantics for negative values.
        assert_eq!(Fraction::new(-3, 2).round(), -1);
        assert_eq!(Fraction::new(-99, 2).round(), -49);
    }

    #[test]
    fn fraction_reduces_large_products() {
        // Denominators that would overflow i32 when multiplied reduce away.
        let a = Fraction::new(1, 1 << 20);
        let b = Fraction::new(1, 1 << 20);
        let sum = a + b;
        assert_eq!(sum, Fraction::new(1, 1 << 19));
    }

    #[test]
    fn clap_intrinsic_dimensions() {
        let clap = CleanAperture {
            width: Fraction::new(100, 1),
            height: Fraction::new(50, 1),
            horizontal_offset: Fraction::new(0, 1),
            vertical_offset: Fraction::new(0, 1),
        };
        assert_eq!(clap.width_rounded(), 100);
        assert_eq!(clap.height_rounded(), 50);
    }

    #[test]
    fn clap_centered_window() {
        let clap = CleanAperture {
            width: Fraction::new(50, 1),
            height: Fraction::new(50, 1),
            horizontal_offset: Fraction::new(0, 1),
            vertical_offset: Fraction::new(0, 1),
        };
        // Centered 50px aperture in a 100px image: columns 25..=74.
        assert_eq!(clap.left_rounded(100), 25);
        assert_eq!(clap.right_rounded(100), 74);
        assert_eq!(clap.right_rounded(100) - clap.left_rounded(100) + 1, 50);
    }

    #[test]
    fn limits_builder() {
        let limits = Limits::default()
            .with_max_item_payload(1024)
            .with_max_iloc_items(4)
            .with_max_extents_per_item(2)
            .with_max_children_per_box(16);
        assert_eq!(limits.max_item_payload, 1024);
        assert_eq!(limits.max_iloc_items, 4);
        assert_eq!(limits.max_extents_per_item, 2);
        assert_eq!(limits.max_children_per_box, 16);
    }
}
