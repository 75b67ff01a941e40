//! Spherical Mercator (EPSG:3857) tile arithmetic.
//!
//! Tiles follow the usual XYZ pyramid convention: the origin is the
//! top-left corner of the projected world, y grows downward, and zoom
//! level `z` subdivides each axis into `2^z` tiles.

/// Half the projected world extent in meters. The full EPSG:3857 square
/// spans `[-ORIGIN_SHIFT, ORIGIN_SHIFT]` on both axes.
pub const ORIGIN_SHIFT: f64 = 20_037_508.342_789_244;

/// A bounding box in projected EPSG:3857 meters.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TileBounds {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

/// Computes the projected envelope of the tile at `(zoom, x, y)`.
///
/// The math stays in meters the whole way through, so neighboring tiles
/// share bit-identical boundary coordinates and every tile at a given zoom
/// has the same span. Callers must pass `x, y < 2^zoom`; out-of-range input
/// yields an envelope outside the world square. Envelopes collapse to zero
/// width once the span drops below f64 resolution (around zoom 52).
pub fn tile_bounds(zoom: u8, x: u32, y: u32) -> TileBounds {
    // Powers of two are exact in f64, and staying in floating point keeps
    // deep zooms and edge addresses free of integer overflow.
    let tile_span = (2.0 * ORIGIN_SHIFT) / 2f64.powi(i32::from(zoom));

    TileBounds {
        west: f64::from(x) * tile_span - ORIGIN_SHIFT,
        east: (f64::from(x) + 1.0) * tile_span - ORIGIN_SHIFT,
        north: ORIGIN_SHIFT - f64::from(y) * tile_span,
        south: ORIGIN_SHIFT - (f64::from(y) + 1.0) * tile_span,
    }
}
