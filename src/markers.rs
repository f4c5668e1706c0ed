//! Sync marker extraction.
//!
//! Test footage carries machine-readable markers burned into two corners of
//! the picture: one near the top-left, one near the bottom-right. A frame
//! showing at least one marker is a "valid" frame and produces a log entry.
//!
//! This module is responsible for:
//!
//! - `MarkerPair`: the decoded values, each independently present or absent.
//! - `MarkerDecoder`: the seam between the session and a concrete decoder.
//! - `StripeDecoder`: the built-in codec. A marker is a horizontal stripe of
//!   fixed-width byte cells: an anchor pair (one high cell, one low cell)
//!   followed by 64 data cells, most significant bit first. A cell reads as 1
//!   when its center byte is >= 0x80. The stripe is written and read at the
//!   byte level so it survives any supported pixel packing.
//!
//! Absence is expressed with `Option`; no numeric value is reserved, so a
//! marker genuinely encoding all-ones round-trips like any other value.

use anyhow::{anyhow, Result};
use std::ops::Range;

/// Bytes per stripe cell.
const CELL_BYTES: usize = 4;

/// Anchor cells preceding the data cells.
const ANCHOR_CELLS: usize = 2;

/// Data cells per stripe, one per value bit.
const DATA_CELLS: usize = 64;

/// Total stripe footprint in bytes.
const STRIPE_BYTES: usize = (ANCHOR_CELLS + DATA_CELLS) * CELL_BYTES;

/// Row the upper stripe sits on.
const UPPER_ROW: u32 = 4;

/// Rows from the bottom for the lower stripe.
const LOWER_ROW_FROM_BOTTOM: u32 = 5;

/// Byte margin between a stripe and the nearest row edge.
const EDGE_MARGIN: usize = 16;

// ----------------------------------------------------------------------------
// MarkerPair
// ----------------------------------------------------------------------------

/// Decoded markers for one frame. Either region may be absent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MarkerPair {
    pub upper: Option<u64>,
    pub lower: Option<u64>,
}

impl MarkerPair {
    pub fn new(upper: Option<u64>, lower: Option<u64>) -> Self {
        Self { upper, lower }
    }

    /// No marker in either region.
    pub fn absent() -> Self {
        Self::default()
    }

    /// True when at least one region decoded, which is what promotes a frame
    /// to a log entry.
    pub fn any(&self) -> bool {
        self.upper.is_some() || self.lower.is_some()
    }
}

/// Picture region a marker occupies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MarkerRegion {
    Upper,
    Lower,
}

// ----------------------------------------------------------------------------
// MarkerDecoder seam
// ----------------------------------------------------------------------------

/// Decodes markers out of a frame payload.
///
/// Implementations may keep internal state between frames. They MUST NOT
/// retain the pixel slice beyond the call.
pub trait MarkerDecoder {
    fn name(&self) -> &'static str;

    fn decode(&mut self, pixels: &[u8], width: u32, height: u32, row_bytes: u32) -> MarkerPair;
}

// ----------------------------------------------------------------------------
// StripeDecoder
// ----------------------------------------------------------------------------

/// Byte range a region's stripe occupies, if the geometry can hold one.
fn stripe_range(height: u32, row_bytes: u32, region: MarkerRegion) -> Option<Range<usize>> {
    let row_len = row_bytes as usize;
    if row_len < STRIPE_BYTES + 2 * EDGE_MARGIN {
        return None;
    }
    let row = match region {
        MarkerRegion::Upper => {
            if height <= UPPER_ROW + LOWER_ROW_FROM_BOTTOM {
                return None;
            }
            UPPER_ROW
        }
        MarkerRegion::Lower => {
            if height <= UPPER_ROW + LOWER_ROW_FROM_BOTTOM {
                return None;
            }
            height - LOWER_ROW_FROM_BOTTOM
        }
    };
    let offset = match region {
        MarkerRegion::Upper => EDGE_MARGIN,
        MarkerRegion::Lower => row_len - EDGE_MARGIN - STRIPE_BYTES,
    };
    let start = row as usize * row_len + offset;
    Some(start..start + STRIPE_BYTES)
}

fn cell_is_high(stripe: &[u8], cell: usize) -> bool {
    stripe[cell * CELL_BYTES + CELL_BYTES / 2] >= 0x80
}

fn decode_region(pixels: &[u8], height: u32, row_bytes: u32, region: MarkerRegion) -> Option<u64> {
    let range = stripe_range(height, row_bytes, region)?;
    let stripe = pixels.get(range)?;
    // Anchor pair: first cell high, second cell low.
    if !cell_is_high(stripe, 0) || cell_is_high(stripe, 1) {
        return None;
    }
    let mut value = 0u64;
    for bit in 0..DATA_CELLS {
        value <<= 1;
        if cell_is_high(stripe, ANCHOR_CELLS + bit) {
            value |= 1;
        }
    }
    Some(value)
}

/// Paint a marker stripe into a frame payload. Used by synthetic inputs and
/// by tests that need frames with known marker content.
pub fn paint_stripe(
    pixels: &mut [u8],
    height: u32,
    row_bytes: u32,
    region: MarkerRegion,
    value: u64,
) -> Result<()> {
    let range = stripe_range(height, row_bytes, region).ok_or_else(|| {
        anyhow!(
            "frame geometry {}x{} rows cannot hold a marker stripe",
            row_bytes,
            height
        )
    })?;
    let stripe = pixels
        .get_mut(range)
        .ok_or_else(|| anyhow!("marker stripe range exceeds payload"))?;
    for cell in 0..ANCHOR_CELLS + DATA_CELLS {
        let fill = match cell {
            0 => 0xFF,
            1 => 0x00,
            n => {
                let bit = DATA_CELLS - 1 - (n - ANCHOR_CELLS);
                if (value >> bit) & 1 == 1 {
                    0xFF
                } else {
                    0x00
                }
            }
        };
        stripe[cell * CELL_BYTES..(cell + 1) * CELL_BYTES].fill(fill);
    }
    Ok(())
}

/// Built-in stripe codec decoder.
#[derive(Debug, Default)]
pub struct StripeDecoder;

impl StripeDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl MarkerDecoder for StripeDecoder {
    fn name(&self) -> &'static str {
        "stripe"
    }

    fn decode(&mut self, pixels: &[u8], _width: u32, height: u32, row_bytes: u32) -> MarkerPair {
        MarkerPair {
            upper: decode_region(pixels, height, row_bytes, MarkerRegion::Upper),
            lower: decode_region(pixels, height, row_bytes, MarkerRegion::Lower),
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
