//! Marker descriptors, pin icon synthesis, and the on-disk marker cache.
//!
//! A marker identifier takes one of two forms:
//!
//! ```text
//! identifier := pin | url
//! pin        := "pin-" ("s" | "m" | "l") ("-" glyph)? ("+" hex3-or-6)?
//! url        := "url-" reference "-" dx "-" dy
//! ```
//!
//! Anything else is an invalid marker spec and fails document compilation.
//! Tint handling is deliberately lenient (an unparseable color falls back
//! to the default gray) while shape classes are strict.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use once_cell::sync::Lazy;
use tiny_skia::{FillRule, Paint, PathBuilder, Pixmap, Rect, Stroke, Transform};
use tokio::sync::Semaphore;

use crate::error::Error;
use crate::simplestyle::FeatureStyle;

/// Fill used when a pin has no tint, or an unparseable one.
pub const DEFAULT_TINT: (u8, u8, u8) = (0x7e, 0x7e, 0x7e);

/// Default width of the synthesis/fetch pool.
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Shared async HTTP client for URL-form marker fetches. Built once so TLS
/// and connection pool setup are not paid per marker.
static HTTP_CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .user_agent(concat!("simplestyle_tiles/", env!("CARGO_PKG_VERSION")))
        .build()
        .expect("failed to build reqwest client")
});

/// Distinguishes temp files written by concurrent `ensure_all` calls in the
/// same process; the pid component covers other processes sharing the dir.
static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Pin shape-size classes and their base (1x) pixel dimensions.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum MarkerSize {
    Small,
    Medium,
    Large,
}

impl MarkerSize {
    pub fn abbrev(self) -> char {
        match self {
            MarkerSize::Small => 's',
            MarkerSize::Medium => 'm',
            MarkerSize::Large => 'l',
        }
    }

    /// Base (1x) width and height of the pin glyph in pixels.
    pub fn dimensions(self) -> (u32, u32) {
        match self {
            MarkerSize::Small => (20, 50),
            MarkerSize::Medium => (30, 70),
            MarkerSize::Large => (35, 90),
        }
    }

    fn from_abbrev(c: char) -> Option<Self> {
        match c {
            's' => Some(MarkerSize::Small),
            'm' => Some(MarkerSize::Medium),
            'l' => Some(MarkerSize::Large),
            _ => None,
        }
    }

    /// Accepts both the property form ("small") and the abbreviated form.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "small" | "s" => Some(MarkerSize::Small),
            "medium" | "m" => Some(MarkerSize::Medium),
            "large" | "l" => Some(MarkerSize::Large),
            _ => None,
        }
    }
}

/// Normalized identity of one synthesized pin asset. Equality over all
/// fields is the cache key; a retina pin is a distinct descriptor, not a
/// scaling transform.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PinDescriptor {
    pub size: MarkerSize,
    pub label: Option<char>,
    /// 3 or 6 lowercase hex digits, no leading `#`.
    pub tint: Option<String>,
    pub retina: bool,
}

impl PinDescriptor {
    /// Canonical file stem, e.g. `pin-s-a+f00@2x`.
    pub fn slug(&self) -> String {
        let mut slug = format!("pin-{}", self.size.abbrev());
        if let Some(label) = self.label {
            slug.push('-');
            slug.push(label);
        }
        if let Some(tint) = &self.tint {
            slug.push('+');
            slug.push_str(tint);
        }
        if self.retina {
            slug.push_str("@2x");
        }
        slug
    }
}

/// A marker referencing a remote image instead of a synthesized pin. The
/// offset pair is an anchor displacement applied at render time.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct UrlMarker {
    pub url: String,
    pub offset: (i32, i32),
}

/// A parsed marker identifier.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum MarkerSpec {
    Pin(PinDescriptor),
    Url(UrlMarker),
}

impl MarkerSpec {
    /// Parses a marker identifier against the two-form grammar above.
    pub fn parse(id: &str, retina: bool) -> Result<MarkerSpec, Error> {
        if let Some(rest) = id.strip_prefix("url-") {
            return parse_url_marker(id, rest);
        }
        let rest = id
            .strip_prefix("pin-")
            .ok_or_else(|| Error::InvalidMarkerSpec(id.to_string()))?;

        let mut chars = rest.chars();
        let size = chars
            .next()
            .and_then(MarkerSize::from_abbrev)
            .ok_or_else(|| Error::InvalidMarkerSpec(id.to_string()))?;
        let remainder = chars.as_str();

        let (label_part, tint_part) = match remainder.split_once('+') {
            Some((label, tint)) => (label, Some(tint)),
            None => (remainder, None),
        };

        let label = if label_part.is_empty() {
            None
        } else {
            let glyph = label_part
                .strip_prefix('-')
                .ok_or_else(|| Error::InvalidMarkerSpec(id.to_string()))?;
            let mut glyphs = glyph.chars();
            match (glyphs.next(), glyphs.next()) {
                (Some(c), None) if c.is_ascii_alphanumeric() => Some(c.to_ascii_lowercase()),
                _ => return Err(Error::InvalidMarkerSpec(id.to_string())),
            }
        };

        let tint = match tint_part {
            None => None,
            Some(t) => {
                let t = t.to_ascii_lowercase();
                if !is_hex_tint(&t) {
                    return Err(Error::InvalidMarkerSpec(id.to_string()));
                }
                Some(t)
            }
        };

        Ok(MarkerSpec::Pin(PinDescriptor {
            size,
            label,
            tint,
            retina,
        }))
    }

    /// Derives the marker identity requested by a point feature's
    /// simplestyle properties. A `marker-symbol` beginning with `url-` is
    /// the URL form; everything else composes a pin identifier which is run
    /// through the same grammar.
    pub fn for_style(style: &FeatureStyle, retina: bool) -> Result<MarkerSpec, Error> {
        if let Some(symbol) = &style.marker_symbol {
            if symbol.starts_with("url-") {
                return MarkerSpec::parse(symbol, retina);
            }
        }

        let mut id = String::from("pin-");
        match style.marker_size.as_deref() {
            None => id.push('m'),
            Some(name) => match MarkerSize::from_name(name) {
                Some(size) => id.push(size.abbrev()),
                // Let the grammar reject the unknown shape class.
                None => id.push_str(name),
            },
        }
        if let Some(symbol) = &style.marker_symbol {
            id.push('-');
            id.push_str(symbol);
        }
        if let Some(color) = &style.marker_color {
            let hex = color.trim_start_matches('#').to_ascii_lowercase();
            if is_hex_tint(&hex) {
                id.push('+');
                id.push_str(&hex);
            } else {
                log::warn!("ignoring unparseable marker-color {:?}", color);
            }
        }
        MarkerSpec::parse(&id, retina)
    }

    /// Canonical, filesystem-safe file stem for this marker's asset.
    pub fn slug(&self) -> String {
        match self {
            MarkerSpec::Pin(pin) => pin.slug(),
            MarkerSpec::Url(marker) => format!(
                "url-{:016x}-{}-{}",
                fxhash::hash64(&marker.url),
                marker.offset.0,
                marker.offset.1
            ),
        }
    }
}

fn parse_url_marker(id: &str, rest: &str) -> Result<MarkerSpec, Error> {
    // The reference may itself contain dashes; only the trailing two
    // fields are the offset pair.
    let mut parts = rest.rsplitn(3, '-');
    let (dy, dx, reference) = match (parts.next(), parts.next(), parts.next()) {
        (Some(dy), Some(dx), Some(reference)) if !reference.is_empty() => (dy, dx, reference),
        _ => return Err(Error::InvalidMarkerSpec(id.to_string())),
    };
    let dx: i32 = dx
        .parse()
        .map_err(|_| Error::InvalidMarkerSpec(id.to_string()))?;
    let dy: i32 = dy
        .parse()
        .map_err(|_| Error::InvalidMarkerSpec(id.to_string()))?;
    Ok(MarkerSpec::Url(UrlMarker {
        url: reference.to_string(),
        offset: (dx, dy),
    }))
}

fn is_hex_tint(s: &str) -> bool {
    (s.len() == 3 || s.len() == 6) && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Parses a 3- or 6-digit hex color, with or without a leading `#`.
pub fn parse_hex_color(color: &str) -> Option<(u8, u8, u8)> {
    let hex = color.trim_start_matches('#');
    let component = |s: &str| u8::from_str_radix(s, 16).ok();
    match hex.len() {
        3 => {
            let nibble = |s: &str| component(s).map(|v| v * 16 + v);
            Some((
                nibble(&hex[0..1])?,
                nibble(&hex[1..2])?,
                nibble(&hex[2..3])?,
            ))
        }
        6 => Some((
            component(&hex[0..2])?,
            component(&hex[2..4])?,
            component(&hex[4..6])?,
        )),
        _ => None,
    }
}

/// Rasterizes a teardrop pin for the given descriptor and returns encoded
/// PNG bytes. CPU-bound; the cache runs this on a blocking thread.
pub fn synthesize(pin: &PinDescriptor) -> Result<Vec<u8>, Error> {
    let slug = pin.slug();
    let (base_w, base_h) = pin.size.dimensions();
    let scale = if pin.retina { 2 } else { 1 };
    let (width, height) = (base_w * scale, base_h * scale);

    let mut pixmap = Pixmap::new(width, height).ok_or_else(|| Error::AssetGeneration {
        slug: slug.clone(),
        message: "zero-sized pixmap".to_string(),
    })?;

    let margin = scale as f32;
    let cx = width as f32 / 2.0;
    let radius = width as f32 / 2.0 - margin;
    let cy = radius + margin;

    // Round head plus a pointed tail, merged under a winding fill.
    let mut pb = PathBuilder::new();
    pb.push_circle(cx, cy, radius);
    pb.move_to(cx - radius * 0.55, cy + radius * 0.75);
    pb.line_to(cx, height as f32 - margin);
    pb.line_to(cx + radius * 0.55, cy + radius * 0.75);
    pb.close();
    let body = pb.finish().ok_or_else(|| Error::AssetGeneration {
        slug: slug.clone(),
        message: "degenerate pin path".to_string(),
    })?;

    let (r, g, b) = pin
        .tint
        .as_deref()
        .and_then(parse_hex_color)
        .unwrap_or(DEFAULT_TINT);

    let mut fill = Paint::default();
    fill.set_color_rgba8(r, g, b, 0xff);
    fill.anti_alias = true;
    pixmap.fill_path(&body, &fill, FillRule::Winding, Transform::identity(), None);

    let mut outline = Paint::default();
    outline.set_color_rgba8(darken(r), darken(g), darken(b), 0xff);
    outline.anti_alias = true;
    let stroke = Stroke {
        width: margin,
        ..Stroke::default()
    };
    pixmap.stroke_path(&body, &outline, &stroke, Transform::identity(), None);

    if let Some(label) = pin.label {
        draw_label(&mut pixmap, label, cx, cy, radius);
    }

    pixmap.encode_png().map_err(|e| Error::AssetGeneration {
        slug,
        message: e.to_string(),
    })
}

fn darken(channel: u8) -> u8 {
    (f32::from(channel) * 0.7) as u8
}

fn draw_label(pixmap: &mut Pixmap, glyph: char, cx: f32, cy: f32, radius: f32) {
    use font8x8::{UnicodeFonts, BASIC_FONTS};

    let Some(bitmap) = BASIC_FONTS.get(glyph) else {
        log::warn!("no glyph bitmap for marker label {:?}", glyph);
        return;
    };

    let cell = radius * 1.2 / 8.0;
    let origin_x = cx - cell * 4.0;
    let origin_y = cy - cell * 4.0;

    let mut paint = Paint::default();
    paint.set_color_rgba8(0xff, 0xff, 0xff, 0xff);

    for (row, &bits) in bitmap.iter().enumerate() {
        for col in 0..8u8 {
            if bits & (1u8 << col) == 0 {
                continue;
            }
            // Snap each cell to whole pixels, at least 1px wide. Sub-pixel
            // rects trip tiny-skia's hairline rasterizer on small pins.
            let left = (origin_x + f32::from(col) * cell).floor();
            let top = (origin_y + row as f32 * cell).floor();
            let right = (origin_x + (f32::from(col) + 1.0) * cell).ceil().max(left + 1.0);
            let bottom = (origin_y + (row as f32 + 1.0) * cell).ceil().max(top + 1.0);
            if let Some(rect) = Rect::from_ltrb(left, top, right, bottom) {
                pixmap.fill_rect(rect, &paint, Transform::identity(), None);
            }
        }
    }
}

/// Append-only cache of marker assets, one PNG per descriptor slug under a
/// caller-provided root. Never evicts; cleanup is an operator concern.
#[derive(Clone, Debug)]
pub struct MarkerCache {
    cache_dir: PathBuf,
    concurrency: usize,
}

impl MarkerCache {
    /// Creates the cache directory if needed.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Result<Self, Error> {
        let cache_dir = cache_dir.into();
        std::fs::create_dir_all(&cache_dir)?;
        Ok(Self {
            cache_dir,
            concurrency: DEFAULT_CONCURRENCY,
        })
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Deterministic on-disk location of a marker's asset.
    pub fn asset_path(&self, spec: &MarkerSpec) -> PathBuf {
        self.cache_dir.join(format!("{}.png", spec.slug()))
    }

    /// Makes sure every descriptor in `specs` has an asset on disk,
    /// synthesizing or fetching missing ones across a bounded pool.
    /// Returns the number of newly generated assets.
    ///
    /// The first error wins, but in-flight siblings run to completion; the
    /// set input guarantees no two tasks target the same output path.
    pub async fn ensure_all(&self, specs: &BTreeSet<MarkerSpec>) -> Result<usize, Error> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut slugs = Vec::with_capacity(specs.len());
        let mut handles = Vec::with_capacity(specs.len());

        for spec in specs {
            let semaphore = Arc::clone(&semaphore);
            let spec = spec.clone();
            let path = self.asset_path(&spec);
            let cache_dir = self.cache_dir.clone();
            slugs.push(spec.slug());
            handles.push(tokio::spawn(async move {
                let _permit =
                    semaphore
                        .acquire_owned()
                        .await
                        .map_err(|e| Error::AssetGeneration {
                            slug: spec.slug(),
                            message: e.to_string(),
                        })?;
                ensure_one(spec, path, cache_dir).await
            }));
        }

        let mut generated = 0;
        let mut first_err = None;
        for (slug, joined) in slugs.into_iter().zip(join_all(handles).await) {
            match joined {
                Ok(Ok(true)) => generated += 1,
                Ok(Ok(false)) => {}
                Ok(Err(e)) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
                Err(join_err) => {
                    if first_err.is_none() {
                        first_err = Some(Error::AssetGeneration {
                            slug,
                            message: join_err.to_string(),
                        });
                    }
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => {
                log::debug!(
                    "marker cache ready: {} synthesized, {} reused",
                    generated,
                    specs.len() - generated
                );
                Ok(generated)
            }
        }
    }
}

async fn ensure_one(spec: MarkerSpec, path: PathBuf, cache_dir: PathBuf) -> Result<bool, Error> {
    if tokio::fs::metadata(&path).await.is_ok() {
        return Ok(false);
    }

    let bytes = match &spec {
        MarkerSpec::Pin(pin) => {
            let pin = pin.clone();
            tokio::task::spawn_blocking(move || synthesize(&pin))
                .await
                .map_err(|e| Error::AssetGeneration {
                    slug: spec.slug(),
                    message: e.to_string(),
                })??
        }
        MarkerSpec::Url(marker) => fetch(marker).await?,
    };

    // Write-then-rename keeps half-written assets unobservable, even with
    // another process sharing the cache directory.
    let temp = cache_dir.join(format!(
        "{}.{}.{}.tmp",
        spec.slug(),
        std::process::id(),
        TEMP_SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    tokio::fs::write(&temp, &bytes).await?;
    tokio::fs::rename(&temp, &path).await?;
    log::debug!("generated marker {} ({} bytes)", spec.slug(), bytes.len());
    Ok(true)
}

async fn fetch(marker: &UrlMarker) -> Result<Vec<u8>, Error> {
    let slug = MarkerSpec::Url(marker.clone()).slug();
    let failed = |message: String| Error::AssetGeneration {
        slug: slug.clone(),
        message,
    };
    let response = HTTP_CLIENT
        .get(&marker.url)
        .send()
        .await
        .map_err(|e| failed(e.to_string()))?
        .error_for_status()
        .map_err(|e| failed(e.to_string()))?;
    let bytes = response.bytes().await.map_err(|e| failed(e.to_string()))?;
    Ok(bytes.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pin(id: &str) -> PinDescriptor {
        match MarkerSpec::parse(id, false).expect("valid pin id") {
            MarkerSpec::Pin(pin) => pin,
            other => panic!("expected pin, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_pin_forms() {
        assert_eq!(
            pin("pin-m"),
            PinDescriptor {
                size: MarkerSize::Medium,
                label: None,
                tint: None,
                retina: false
            }
        );
        assert_eq!(
            pin("pin-s-a+f00"),
            PinDescriptor {
                size: MarkerSize::Small,
                label: Some('a'),
                tint: Some("f00".to_string()),
                retina: false
            }
        );
        assert_eq!(
            pin("pin-l+0044FF"),
            PinDescriptor {
                size: MarkerSize::Large,
                label: None,
                tint: Some("0044ff".to_string()),
                retina: false
            }
        );
        assert_eq!(pin("pin-m-7").label, Some('7'));
    }

    #[test]
    fn test_parse_url_form() {
        let spec = MarkerSpec::parse("url-https://example.com/a-b.png-4-6", false).unwrap();
        assert_eq!(
            spec,
            MarkerSpec::Url(UrlMarker {
                url: "https://example.com/a-b.png".to_string(),
                offset: (4, 6),
            })
        );
    }

    #[test]
    fn test_parse_rejects_malformed_identifiers() {
        for id in [
            "pin-xl-blob",
            "pin",
            "pin-",
            "pin-s-ab",
            "pin-sX",
            "pin-m+12",
            "pin-m+zzz",
            "peg-s",
            "url-x-notanumber-3",
            "url--1-2",
        ] {
            let err = MarkerSpec::parse(id, false).unwrap_err();
            assert!(
                matches!(err, Error::InvalidMarkerSpec(_)),
                "{} should be invalid",
                id
            );
        }
    }

    #[test]
    fn test_for_style_composes_and_validates() {
        let mut style = FeatureStyle {
            marker_size: Some("small".to_string()),
            marker_color: Some("#FF0000".to_string()),
            marker_symbol: Some("a".to_string()),
            ..FeatureStyle::default()
        };
        let spec = MarkerSpec::for_style(&style, true).unwrap();
        assert_eq!(spec.slug(), "pin-s-a+ff0000@2x");

        // Unparseable colors fall back instead of failing.
        style.marker_color = Some("tomato".to_string());
        let spec = MarkerSpec::for_style(&style, false).unwrap();
        assert_eq!(spec.slug(), "pin-s-a");

        // Unknown shape classes are strict.
        style.marker_size = Some("xl".to_string());
        style.marker_symbol = Some("blob".to_string());
        let err = MarkerSpec::for_style(&style, false).unwrap_err();
        assert!(matches!(err, Error::InvalidMarkerSpec(_)));
    }

    #[test]
    fn test_default_style_is_medium_pin() {
        let spec = MarkerSpec::for_style(&FeatureStyle::default(), false).unwrap();
        assert_eq!(spec.slug(), "pin-m");
    }

    #[test]
    fn test_hex_color_parsing() {
        assert_eq!(parse_hex_color("#ff0000"), Some((0xff, 0, 0)));
        assert_eq!(parse_hex_color("f00"), Some((0xff, 0, 0)));
        assert_eq!(parse_hex_color("#abc"), Some((0xaa, 0xbb, 0xcc)));
        assert_eq!(parse_hex_color("not-a-color"), None);
        assert_eq!(parse_hex_color("#ff00"), None);
    }

    #[test]
    fn test_synthesize_dimensions() {
        let bytes = synthesize(&pin("pin-s+f00")).unwrap();
        assert_eq!(&bytes[..8], b"\x89PNG\r\n\x1a\n");
        let decoded = Pixmap::decode_png(&bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (20, 50));

        let retina = PinDescriptor {
            retina: true,
            ..pin("pin-s+f00")
        };
        let decoded = Pixmap::decode_png(&synthesize(&retina).unwrap()).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (40, 100));
    }

    #[test]
    fn test_synthesize_with_label_differs_from_plain() {
        let plain = synthesize(&pin("pin-l+0044ff")).unwrap();
        let labeled = synthesize(&pin("pin-l-a+0044ff")).unwrap();
        assert_ne!(plain, labeled);
    }

    #[test]
    fn test_synthesize_labeled_pins_at_every_size() {
        // Small pins have sub-2px label cells; make sure rasterization holds
        // up across the whole size range, not just the comfortable ones.
        for id in ["pin-s-a", "pin-s-a+f00", "pin-s-7", "pin-m-a", "pin-l-a"] {
            let bytes = synthesize(&pin(id)).unwrap();
            let decoded = Pixmap::decode_png(&bytes).unwrap();
            assert!(decoded.width() > 0, "{} produced an empty pixmap", id);
        }
    }

    #[tokio::test]
    async fn test_ensure_all_is_idempotent() {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempfile::tempdir().unwrap();
        let cache = MarkerCache::new(dir.path()).unwrap().with_concurrency(4);

        let specs: BTreeSet<MarkerSpec> = [
            MarkerSpec::parse("pin-s-a+f00", false).unwrap(),
            MarkerSpec::parse("pin-m", false).unwrap(),
        ]
        .into_iter()
        .collect();

        assert_eq!(cache.ensure_all(&specs).await.unwrap(), 2);
        for spec in &specs {
            assert!(cache.asset_path(spec).exists());
        }

        // Second run is existence checks only.
        assert_eq!(cache.ensure_all(&specs).await.unwrap(), 0);

        // Overlapping set synthesizes only the new descriptor.
        let mut wider = specs.clone();
        wider.insert(MarkerSpec::parse("pin-l", true).unwrap());
        assert_eq!(cache.ensure_all(&wider).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_ensure_all_empty_set() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MarkerCache::new(dir.path()).unwrap();
        assert_eq!(cache.ensure_all(&BTreeSet::new()).await.unwrap(), 0);
    }
}
