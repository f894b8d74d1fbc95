// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Derived images: grid tiling and overlay composition.
//!
//! `grid` and `iovl` items carry a small binary descriptor as their payload
//! and reference their input images through ordered `dimg` edges. The
//! composition loops here are driven by a decode callback so they stay
//! independent of the context's recursion bookkeeping.

use log::debug;

use crate::image::{Channel, Chroma, Colorspace, Image, OVERLAY_OUTSIDE_CANVAS};
use crate::{Error, Result, TryVec};

/// Grid descriptor from a `grid` item payload.
/// See ISO 23008-12:2017 § 6.6.2.3.2
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ImageGrid {
    pub(crate) rows: u16,
    pub(crate) columns: u16,
    pub(crate) output_width: u32,
    pub(crate) output_height: u32,
}

impl ImageGrid {
    /// Rows and columns are stored minus one; flags bit 0 selects 32-bit
    /// output dimensions.
    pub(crate) fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 8 {
            return Err(Error::InvalidData("grid data too short"));
        }

        let _version = data[0];
        let flags = data[1];
        let rows = u16::from(data[2]) + 1;
        let columns = u16::from(data[3]) + 1;

        let (output_width, output_height) = if flags & 1 == 1 {
            if data.len() < 12 {
                return Err(Error::InvalidData("grid data incomplete"));
            }
            (
                u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
                u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            )
        } else {
            (
                u32::from(u16::from_be_bytes([data[4], data[5]])),
                u32::from(u16::from_be_bytes([data[6], data[7]])),
            )
        };

        Ok(Self {
            rows,
            columns,
            output_width,
            output_height,
        })
    }
}

/// Overlay descriptor from an `iovl` item payload.
/// See ISO 23008-12:2017 § 6.6.2.4.2
#[derive(Debug)]
pub(crate) struct ImageOverlay {
    pub(crate) background: [u16; 4],
    pub(crate) canvas_width: u32,
    pub(crate) canvas_height: u32,
    pub(crate) offsets: TryVec<(i32, i32)>,
}

impl ImageOverlay {
    /// `num_images` is the number of `dimg` references; the descriptor must
    /// declare exactly one offset pair per referenced image.
    pub(crate) fn parse(num_images: usize, data: &[u8]) -> Result<Self> {
        if data.len() < 2 + 4 * 2 {
            return Err(Error::InvalidData("overlay data incomplete"));
        }

        let version = data[0];
        let flags = data[1];

        if version != 0 {
            return Err(Error::Unsupported("unsupported overlay data version"));
        }

        let field_len = if flags & 1 == 1 { 4usize } else { 2 };
        let need = 2 + 4 * 2 + 2 * field_len + num_images * 2 * field_len;
        if data.len() < need {
            return Err(Error::InvalidData("overlay data incomplete"));
        }

        let mut ptr = 2;
        let read_u16 = |ptr: &mut usize| {
            let v = u16::from_be_bytes([data[*ptr], data[*ptr + 1]]);
            *ptr += 2;
            v
        };

        let mut background = [0u16; 4];
        for component in background.iter_mut() {
            *component = read_u16(&mut ptr);
        }

        let read_field = |ptr: &mut usize| -> u32 {
            if field_len == 4 {
                let v = u32::from_be_bytes([data[*ptr], data[*ptr + 1], data[*ptr + 2], data[*ptr + 3]]);
                *ptr += 4;
                v
            } else {
                let v = u32::from(u16::from_be_bytes([data[*ptr], data[*ptr + 1]]));
                *ptr += 2;
                v
            }
        };

        let canvas_width = read_field(&mut ptr);
        let canvas_height = read_field(&mut ptr);

        let read_signed = |ptr: &mut usize| -> i32 {
            if field_len == 4 {
                let v = i32::from_be_bytes([data[*ptr], data[*ptr + 1], data[*ptr + 2], data[*ptr + 3]]);
                *ptr += 4;
                v
            } else {
                let v = i16::from_be_bytes([data[*ptr], data[*ptr + 1]]);
                *ptr += 2;
                i32::from(v)
            }
        };

        let mut offsets = TryVec::with_capacity(num_images)?;
        for _ in 0..num_images {
            let x = read_signed(&mut ptr);
            let y = read_signed(&mut ptr);
            offsets.push((x, y))?;
        }

        Ok(Self {
            background,
            canvas_width,
            canvas_height,
            offsets,
        })
    }
}

/// Compose a grid image: decode every referenced tile and place it
/// row-major, accumulating tile widths and heights. The canvas format is
/// taken from the first decoded tile; tiles that disagree are rejected.
pub(crate) fn compose_grid(
    grid: &ImageGrid,
    tile_ids: &[u32],
    mut decode: impl FnMut(u32) -> Result<Image>,
) -> Result<Image> {
    let expected = usize::from(grid.rows) * usize::from(grid.columns);
    if tile_ids.len() != expected {
        return Err(Error::InvalidData("grid tile count does not match references"));
    }

    let w = grid.output_width;
    let h = grid.output_height;
    if w == 0 || h == 0 {
        return Err(Error::InvalidData("grid output dimensions cannot be zero"));
    }

    debug!(
        "grid {}x{} tiles onto {w}x{h} canvas",
        grid.rows, grid.columns
    );

    let first = decode(tile_ids[0])?;
    let mut canvas = Image::create(w, h, first.colorspace(), first.chroma());
    for channel in first.channels() {
        let plane = first.plane(channel).expect("listed channel");
        // Channel extents relative to the tile carry over to the canvas.
        let sub_x = first.width().div_ceil(plane.width.max(1)).max(1);
        let sub_y = first.height().div_ceil(plane.height.max(1)).max(1);
        canvas.add_plane(channel, w.div_ceil(sub_x), h.div_ceil(sub_y), plane.bit_depth)?;
    }

    let mut y0: u32 = 0;
    let mut reference_idx = 0;
    for _row in 0..grid.rows {
        let mut x0: u32 = 0;
        let mut tile_height = 0;
        for _col in 0..grid.columns {
            let tile = if reference_idx == 0 {
                first.try_clone()?
            } else {
                decode(tile_ids[reference_idx])?
            };

            if tile.colorspace() != canvas.colorspace() || tile.chroma() != canvas.chroma() {
                return Err(Error::InvalidData("grid tiles disagree in pixel format"));
            }

            canvas.copy_from(&tile, x0, y0)?;

            x0 = x0.saturating_add(tile.width());
            tile_height = tile.height();
            reference_idx += 1;
        }
        y0 = y0.saturating_add(tile_height);
    }

    Ok(canvas)
}

/// Compose an overlay image: fill an RGB canvas with the background color,
/// then composite each referenced image at its signed offset. Images that
/// land entirely outside the canvas are skipped.
pub(crate) fn compose_overlay(
    overlay: &ImageOverlay,
    image_ids: &[u32],
    mut decode: impl FnMut(u32) -> Result<Image>,
) -> Result<Image> {
    if image_ids.len() != overlay.offsets.len() {
        return Err(Error::InvalidData(
            "number of image offsets does not match the number of image references",
        ));
    }

    let w = overlay.canvas_width;
    let h = overlay.canvas_height;
    if w == 0 || h == 0 {
        return Err(Error::InvalidData("overlay canvas dimensions cannot be zero"));
    }

    // The background color is an RGB value, so composition happens in RGB.
    let mut canvas = Image::create(w, h, Colorspace::Rgb, Chroma::C444);
    canvas.add_plane(Channel::R, w, h, 8)?;
    canvas.add_plane(Channel::G, w, h, 8)?;
    canvas.add_plane(Channel::B, w, h, 8)?;

    let [r, g, b, a] = overlay.background;
    canvas.fill_rgb16(r, g, b, a)?;

    for (i, &id) in image_ids.iter().enumerate() {
        let decoded = decode(id)?;
        let rgb = decoded.convert_colorspace(Colorspace::Rgb, Chroma::C444)?;

        let (dx, dy) = overlay.offsets[i];
        match canvas.overlay(&rgb, i64::from(dx), i64::from(dy)) {
            Ok(()) => {}
            Err(Error::InvalidData(msg)) if msg == OVERLAY_OUTSIDE_CANVAS => {
                debug!("overlay image {id} at ({dx},{dy}) outside canvas, skipped");
            }
            Err(e) => return Err(e),
        }
    }

    Ok(canvas)
}
