//! The overlay tile source façade and its protocol registration surface.
//!
//! Two URI schemes are supported. `simple:` points at a GeoJSON file on
//! disk and compiles with static attribute styling. `overlaydata:` embeds
//! the document in the URI itself, resolves pin icons through the marker
//! cache, and accepts a `2x:` prefix that switches the whole document to
//! retina marker variants.

use std::collections::HashMap;
use std::env;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use async_trait::async_trait;

use crate::error::Error;
use crate::marker::{MarkerCache, DEFAULT_CONCURRENCY};
use crate::mercator::tile_bounds;
use crate::simplestyle::parse_document;
use crate::style::{compile, required_markers, CompiledStylesheet, Mode};
use crate::{Renderer, TileSource, TILE_SIZE};

/// Construction-time configuration. The marker cache root is explicit
/// rather than a process-wide temp-dir global.
#[derive(Clone, Debug)]
pub struct SourceConfig {
    pub cache_dir: PathBuf,
    pub concurrency: usize,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            cache_dir: env::temp_dir().join("simplestyle-markers"),
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

enum SourceUri<'a> {
    Simple(PathBuf),
    OverlayData { retina: bool, payload: &'a str },
}

fn parse_uri(uri: &str) -> Result<SourceUri<'_>, Error> {
    if let Some(rest) = uri.strip_prefix("simple://") {
        return Ok(SourceUri::Simple(PathBuf::from(rest)));
    }
    if let Some(rest) = uri.strip_prefix("simple:") {
        return Ok(SourceUri::Simple(PathBuf::from(rest)));
    }
    if let Some(rest) = uri.strip_prefix("overlaydata://") {
        let (retina, payload) = match rest.strip_prefix("2x:") {
            Some(payload) => (true, payload),
            None => (false, rest),
        };
        return Ok(SourceUri::OverlayData { retina, payload });
    }
    let scheme = uri.split(':').next().unwrap_or(uri);
    Err(Error::UnsupportedProtocol(scheme.to_string()))
}

/// A ready-to-render tile source over one simplestyle GeoJSON document.
///
/// Construction either yields a fully usable source or an error; no partial
/// state is observable, and a failed construction is not retried here. The
/// compiled stylesheet is immutable, so tile renders may run concurrently.
#[derive(Debug)]
pub struct OverlaySource {
    stylesheet: CompiledStylesheet,
    markers: Vec<PathBuf>,
}

impl OverlaySource {
    /// Builds a source from a `simple:` or `overlaydata:` URI. Validation,
    /// marker resolution, and stylesheet compilation all happen here, in
    /// that order; the first failure wins.
    pub async fn load(uri: &str, config: &SourceConfig) -> Result<Self, Error> {
        match parse_uri(uri)? {
            SourceUri::Simple(path) => {
                let data = tokio::fs::read_to_string(&path).await?;
                let doc = parse_document(&data)?;
                let stylesheet = compile(&doc, Mode::Static)?;
                log::info!("loaded static source from {}", path.display());
                Ok(Self {
                    stylesheet,
                    markers: Vec::new(),
                })
            }
            SourceUri::OverlayData { retina, payload } => {
                let doc = parse_document(payload)?;
                let specs = required_markers(&doc, retina)?;
                let cache = MarkerCache::new(&config.cache_dir)?
                    .with_concurrency(config.concurrency);
                let generated = cache.ensure_all(&specs).await?;
                log::info!(
                    "resolved {} marker assets ({} newly generated)",
                    specs.len(),
                    generated
                );
                let markers = specs.iter().map(|spec| cache.asset_path(spec)).collect();
                let stylesheet = compile(
                    &doc,
                    Mode::Dynamic {
                        retina,
                        markers: &cache,
                    },
                )?;
                Ok(Self { stylesheet, markers })
            }
        }
    }

    pub fn stylesheet(&self) -> &CompiledStylesheet {
        &self.stylesheet
    }

    /// On-disk marker assets this source depends on (dynamic variant only).
    pub fn marker_assets(&self) -> &[PathBuf] {
        &self.markers
    }

    /// This source never produces interaction grids.
    pub fn get_grid(&self, _zoom: u8, _x: u32, _y: u32) -> Result<Vec<u8>, Error> {
        Err(Error::UnsupportedCapability("grids"))
    }

    /// This source never produces metadata.
    pub fn get_info(&self) -> Result<serde_json::Value, Error> {
        Err(Error::UnsupportedCapability("info"))
    }
}

#[async_trait]
impl TileSource for OverlaySource {
    async fn render_png(
        &self,
        renderer: &dyn Renderer,
        zoom: u8,
        x: u32,
        y: u32,
    ) -> Result<Vec<u8>, Error> {
        let bounds = tile_bounds(zoom, x, y);
        renderer
            .render(&self.stylesheet, &bounds, TILE_SIZE, TILE_SIZE)
            .await
            .map_err(Error::Render)
    }
}

/// The URI schemes this source answers to.
pub const PROTOCOLS: [&str; 2] = ["simple", "overlaydata"];

pub type SourceFuture = Pin<Box<dyn Future<Output = Result<OverlaySource, Error>> + Send>>;
pub type SourceFactory = fn(String, SourceConfig) -> SourceFuture;

/// A host tile server's protocol table: scheme name to source constructor.
#[derive(Default)]
pub struct ProtocolRegistry {
    protocols: HashMap<&'static str, SourceFactory>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, scheme: &'static str, factory: SourceFactory) {
        self.protocols.insert(scheme, factory);
    }

    pub fn get(&self, scheme: &str) -> Option<&SourceFactory> {
        self.protocols.get(scheme)
    }
}

/// Registers this source's schemes with a host protocol table.
pub fn register_protocols(registry: &mut ProtocolRegistry) {
    fn construct(uri: String, config: SourceConfig) -> SourceFuture {
        Box::pin(async move { OverlaySource::load(&uri, &config).await })
    }
    for scheme in PROTOCOLS {
        registry.insert(scheme, construct);
    }
}
