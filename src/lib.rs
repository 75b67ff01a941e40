//! # Simplestyle Tiles
//!
//! Tools for modeling and rendering raster tile sources from simplestyle
//! GeoJSON overlays.
//!
//! ## Current status
//!
//! This crate should be regarded as stable in terms of code
//! reliability/correctness, but not yet stable in terms of trait and method
//! signatures. The interface is small and deliberate, but we reserve the
//! right to rework it as more source formats and rendering backends appear.
//!
//! ## Current features
//!
//! Given a GeoJSON document whose features carry [simplestyle] presentation
//! properties (`marker-size`, `marker-color`, `stroke`, `fill`, ...), this
//! crate compiles the document once into a rendering-engine stylesheet,
//! synthesizes and caches any pin icons the document calls for, and answers
//! slippy-map tile requests in XYZ format through a pluggable rendering
//! engine.
//!
//! ## Known Limitations
//!
//! The actual rasterization is delegated to an external engine behind the
//! [`Renderer`] trait; no engine binding ships with this crate. Interaction
//! grids and source metadata are permanently unsupported by this source
//! type. GeoJSON is validated structurally, not geometrically.
//!
//! [simplestyle]: https://github.com/mapbox/simplestyle-spec

#![deny(warnings)]

// TODO: remove once async fn in traits become stable
use async_trait::async_trait;

use crate::error::Error;
use crate::mercator::TileBounds;
use crate::style::CompiledStylesheet;

/// Tile edge length in pixels handed to the rendering engine.
pub const TILE_SIZE: u32 = 256;

/// The external rendering engine contract. An implementation accepts a
/// compiled stylesheet plus a projected extent and pixel dimensions, and
/// returns an encoded raster image (PNG). This crate treats it as opaque:
/// any failure it reports is surfaced unchanged.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(
        &self,
        stylesheet: &CompiledStylesheet,
        bounds: &TileBounds,
        width: u32,
        height: u32,
    ) -> Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>>;
}

/// The main trait exported by this crate. Deliberately barebones for now,
/// with room to grow if other source formats become relevant.
#[async_trait]
pub trait TileSource: Sized {
    /// Renders the PNG for a slippy map tile in XYZ format.
    async fn render_png(
        &self,
        renderer: &dyn Renderer,
        zoom: u8,
        x: u32,
        y: u32,
    ) -> Result<Vec<u8>, Error>;
}

pub mod error;
pub mod marker;
pub mod mercator;
pub mod simplestyle;
pub mod source;
pub mod style;
