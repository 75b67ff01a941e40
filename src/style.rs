//! Compiles a simplestyle GeoJSON document into a rendering-engine
//! stylesheet.
//!
//! Features are grouped by their resolved symbolizer in first-seen order,
//! and each group becomes one style/layer pair with an inline GeoJSON
//! datasource. Compilation happens exactly once per source instance; the
//! result is reused for every tile render.

use std::collections::{BTreeSet, HashMap};

use serde_json::{Map, Value};

use crate::error::Error;
use crate::marker::{parse_hex_color, MarkerCache, MarkerSize, MarkerSpec};
use crate::simplestyle::{Feature, FeatureStyle, GeoJson, GeometryKind, DEFAULT_COLOR};

const MERCATOR_SRS: &str = "+proj=merc +a=6378137 +b=6378137 +lat_ts=0.0 +lon_0=0.0 \
     +x_0=0.0 +y_0=0.0 +k=1.0 +units=m +nadgrids=@null +wktext +no_defs +over";
const WGS84_SRS: &str = "+proj=longlat +datum=WGS84 +no_defs";

/// Compilation mode. Static styling reads color/stroke attributes only;
/// dynamic styling additionally binds point features to pre-rendered pin
/// icons resolved through the marker cache.
pub enum Mode<'a> {
    Static,
    Dynamic {
        retina: bool,
        markers: &'a MarkerCache,
    },
}

/// The engine-specific stylesheet produced once at construction time.
/// Opaque to everything but the rendering collaborator.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CompiledStylesheet(String);

impl CompiledStylesheet {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for CompiledStylesheet {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Scans the document for the distinct marker descriptors a dynamic
/// compile will reference. Malformed marker identifiers fail the whole
/// document; a silently skipped marker would render as a visual gap.
pub fn required_markers(doc: &GeoJson, retina: bool) -> Result<BTreeSet<MarkerSpec>, Error> {
    let mut specs = BTreeSet::new();
    for feature in doc.features() {
        let kind = feature.geometry.as_ref().and_then(|g| g.kind());
        if kind != Some(GeometryKind::Point) {
            continue;
        }
        let style = FeatureStyle::from_properties(feature.properties.as_ref());
        specs.insert(MarkerSpec::for_style(&style, retina)?);
    }
    Ok(specs)
}

/// Compiles the document into a stylesheet. Deterministic: the same
/// document and mode always produce byte-identical output.
pub fn compile(doc: &GeoJson, mode: Mode<'_>) -> Result<CompiledStylesheet, Error> {
    let mut groups: Vec<(Symbolizer, Vec<&Feature>)> = Vec::new();
    let mut index: HashMap<Symbolizer, usize> = HashMap::new();

    for feature in doc.features() {
        let Some(symbolizer) = classify(feature, &mode)? else {
            continue;
        };
        match index.get(&symbolizer) {
            Some(&i) => groups[i].1.push(feature),
            None => {
                index.insert(symbolizer.clone(), groups.len());
                groups.push((symbolizer, vec![feature]));
            }
        }
    }

    let mut xml = String::new();
    xml.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    xml.push_str(&format!(
        "<Map srs=\"{}\" background-color=\"transparent\">\n",
        MERCATOR_SRS
    ));
    for (i, (symbolizer, _)) in groups.iter().enumerate() {
        xml.push_str(&format!(
            "  <Style name=\"style-{}\">\n    <Rule>\n      {}\n    </Rule>\n  </Style>\n",
            i,
            symbolizer.to_xml()
        ));
    }
    for (i, (_, features)) in groups.iter().enumerate() {
        xml.push_str(&format!(
            "  <Layer name=\"layer-{}\" srs=\"{}\">\n    <StyleName>style-{}</StyleName>\n",
            i, WGS84_SRS, i
        ));
        xml.push_str("    <Datasource>\n      <Parameter name=\"type\">geojson</Parameter>\n");
        xml.push_str(&format!(
            "      <Parameter name=\"inline\">{}</Parameter>\n",
            xml_escape(&inline_collection(features))
        ));
        xml.push_str("    </Datasource>\n  </Layer>\n");
    }
    xml.push_str("</Map>\n");

    log::debug!(
        "compiled stylesheet: {} feature groups, {} bytes",
        groups.len(),
        xml.len()
    );
    Ok(CompiledStylesheet(xml))
}

/// One rule's worth of drawing instructions. Numeric attributes are kept
/// pre-formatted so the whole signature is hashable and grouping stays
/// exact.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
enum Symbolizer {
    Icon {
        file: String,
        dx: i32,
        dy: i32,
    },
    Point {
        fill: String,
        width: String,
    },
    Line {
        stroke: String,
        width: String,
        opacity: String,
    },
    Polygon {
        fill: String,
        fill_opacity: String,
        stroke: String,
        stroke_width: String,
        stroke_opacity: String,
    },
}

impl Symbolizer {
    fn to_xml(&self) -> String {
        match self {
            Symbolizer::Icon { file, dx, dy } => {
                let mut attrs = format!(
                    "file=\"{}\" allow-overlap=\"true\" ignore-placement=\"true\"",
                    xml_escape(file)
                );
                if (*dx, *dy) != (0, 0) {
                    attrs.push_str(&format!(" transform=\"translate({},{})\"", dx, dy));
                }
                format!("<MarkersSymbolizer {}/>", attrs)
            }
            Symbolizer::Point { fill, width } => format!(
                "<MarkersSymbolizer fill=\"{}\" width=\"{}\" height=\"{}\" \
                 allow-overlap=\"true\" ignore-placement=\"true\"/>",
                xml_escape(fill),
                width,
                width
            ),
            Symbolizer::Line {
                stroke,
                width,
                opacity,
            } => format!(
                "<LineSymbolizer stroke=\"{}\" stroke-width=\"{}\" stroke-opacity=\"{}\"/>",
                xml_escape(stroke),
                width,
                opacity
            ),
            Symbolizer::Polygon {
                fill,
                fill_opacity,
                stroke,
                stroke_width,
                stroke_opacity,
            } => format!(
                "<PolygonSymbolizer fill=\"{}\" fill-opacity=\"{}\"/>\
                 <LineSymbolizer stroke=\"{}\" stroke-width=\"{}\" stroke-opacity=\"{}\"/>",
                xml_escape(fill),
                fill_opacity,
                xml_escape(stroke),
                stroke_width,
                stroke_opacity
            ),
        }
    }
}

fn classify(feature: &Feature, mode: &Mode<'_>) -> Result<Option<Symbolizer>, Error> {
    let Some(kind) = feature.geometry.as_ref().and_then(|g| g.kind()) else {
        return Ok(None);
    };
    let style = FeatureStyle::from_properties(feature.properties.as_ref());

    let symbolizer = match kind {
        GeometryKind::Point => match mode {
            Mode::Dynamic { retina, markers } => {
                let spec = MarkerSpec::for_style(&style, *retina)?;
                let (dx, dy) = match &spec {
                    MarkerSpec::Url(marker) => marker.offset,
                    MarkerSpec::Pin(_) => (0, 0),
                };
                Symbolizer::Icon {
                    file: markers.asset_path(&spec).display().to_string(),
                    dx,
                    dy,
                }
            }
            Mode::Static => {
                let size = style
                    .marker_size
                    .as_deref()
                    .and_then(MarkerSize::from_name)
                    .unwrap_or(MarkerSize::Medium);
                // Same lenient color handling as pin composition.
                let fill = match style.marker_color {
                    Some(color) if parse_hex_color(&color).is_some() => color,
                    Some(color) => {
                        log::warn!("ignoring unparseable marker-color {:?}", color);
                        DEFAULT_COLOR.to_string()
                    }
                    None => DEFAULT_COLOR.to_string(),
                };
                Symbolizer::Point {
                    fill,
                    width: (size.dimensions().0 / 2).to_string(),
                }
            }
        },
        GeometryKind::Line => Symbolizer::Line {
            stroke: style.stroke,
            width: fmt_num(style.stroke_width),
            opacity: fmt_num(style.stroke_opacity),
        },
        GeometryKind::Polygon => Symbolizer::Polygon {
            fill: style.fill,
            fill_opacity: fmt_num(style.fill_opacity),
            stroke: style.stroke,
            stroke_width: fmt_num(style.stroke_width),
            stroke_opacity: fmt_num(style.stroke_opacity),
        },
    };
    Ok(Some(symbolizer))
}

fn inline_collection(features: &[&Feature]) -> String {
    let mut collection = Map::new();
    collection.insert("type".to_string(), Value::from("FeatureCollection"));
    collection.insert(
        "features".to_string(),
        Value::Array(features.iter().map(|f| f.to_value()).collect()),
    );
    // A Map of plain values cannot fail to serialize.
    serde_json::to_string(&Value::Object(collection)).unwrap_or_default()
}

fn fmt_num(value: f64) -> String {
    format!("{}", value)
}

fn xml_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::Read;

    use super::*;
    use crate::simplestyle::parse_document;

    fn test_document() -> GeoJson {
        let mut file =
            File::open("test_data/overlay.geojson").expect("unable to open the test document");
        let mut data = String::new();
        file.read_to_string(&mut data).expect("unable to read the file");
        parse_document(&data).expect("test document must be valid")
    }

    fn scratch_cache() -> (tempfile::TempDir, MarkerCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = MarkerCache::new(dir.path()).unwrap();
        (dir, cache)
    }

    #[test]
    fn test_required_markers_dedups_identical_styles() {
        // The test document has three point features: two sharing the same
        // small red pin and one with defaults.
        let specs = required_markers(&test_document(), false).unwrap();
        assert_eq!(specs.len(), 2);
        let slugs: Vec<String> = specs.iter().map(MarkerSpec::slug).collect();
        assert!(slugs.contains(&"pin-s-a+ff0000".to_string()));
        assert!(slugs.contains(&"pin-m".to_string()));
    }

    #[test]
    fn test_required_markers_retina_variants_are_distinct() {
        let normal = required_markers(&test_document(), false).unwrap();
        let retina = required_markers(&test_document(), true).unwrap();
        assert_eq!(normal.len(), retina.len());
        assert!(normal.is_disjoint(&retina));
    }

    #[test]
    fn test_static_compile_is_deterministic() {
        let doc = test_document();
        let first = compile(&doc, Mode::Static).unwrap();
        let second = compile(&doc, Mode::Static).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.as_str(), second.as_str());
    }

    #[test]
    fn test_static_compile_emits_attribute_symbolizers() {
        let sheet = compile(&test_document(), Mode::Static).unwrap();
        let xml = sheet.as_str();
        assert!(xml.contains("<PolygonSymbolizer fill=\"#00ff00\""));
        assert!(xml.contains("<LineSymbolizer stroke=\"#ff8800\" stroke-width=\"3.5\""));
        // Points use plain marker dots, no icon files.
        assert!(xml.contains("<MarkersSymbolizer fill="));
        assert!(!xml.contains("file="));
    }

    #[test]
    fn test_dynamic_compile_binds_icon_paths() {
        let (_dir, cache) = scratch_cache();
        let doc = test_document();
        let sheet = compile(
            &doc,
            Mode::Dynamic {
                retina: false,
                markers: &cache,
            },
        )
        .unwrap();
        let xml = sheet.as_str();
        assert!(xml.contains("pin-s-a+ff0000.png"));
        assert!(xml.contains("pin-m.png"));
        // Two identical point styles collapse into one style/layer group.
        assert_eq!(xml.matches("pin-s-a+ff0000.png").count(), 1);
    }

    #[test]
    fn test_dynamic_compile_retina_uses_2x_assets() {
        let (_dir, cache) = scratch_cache();
        let sheet = compile(
            &test_document(),
            Mode::Dynamic {
                retina: true,
                markers: &cache,
            },
        )
        .unwrap();
        assert!(sheet.as_str().contains("pin-s-a+ff0000@2x.png"));
    }

    #[test]
    fn test_malformed_marker_fails_compile() {
        let doc = parse_document(
            r#"{"type": "Feature",
                "geometry": {"type": "Point", "coordinates": [0.0, 0.0]},
                "properties": {"marker-size": "xl", "marker-symbol": "blob"}}"#,
        )
        .unwrap();
        let (_dir, cache) = scratch_cache();
        let err = compile(
            &doc,
            Mode::Dynamic {
                retina: false,
                markers: &cache,
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidMarkerSpec(_)));
        // Static mode has no marker identifiers to reject.
        assert!(compile(&doc, Mode::Static).is_ok());
    }

    #[test]
    fn test_static_mode_falls_back_on_unparseable_marker_color() {
        let doc = parse_document(
            r#"{"type": "Feature",
                "geometry": {"type": "Point", "coordinates": [0.0, 0.0]},
                "properties": {"marker-color": "tomato"}}"#,
        )
        .unwrap();
        let sheet = compile(&doc, Mode::Static).unwrap();
        assert!(sheet
            .as_str()
            .contains("<MarkersSymbolizer fill=\"#555555\""));
    }

    #[test]
    fn test_unstyled_features_get_defaults() {
        let doc = parse_document(
            r#"{"type": "FeatureCollection", "features": [
                {"type": "Feature",
                 "geometry": {"type": "LineString", "coordinates": [[0.0,0.0],[1.0,1.0]]},
                 "properties": {}}
            ]}"#,
        )
        .unwrap();
        let sheet = compile(&doc, Mode::Static).unwrap();
        assert!(sheet
            .as_str()
            .contains("<LineSymbolizer stroke=\"#555555\" stroke-width=\"2\" stroke-opacity=\"1\"/>"));
    }

    #[test]
    fn test_inline_datasource_escapes_payload() {
        let sheet = compile(&test_document(), Mode::Static).unwrap();
        let xml = sheet.as_str();
        assert!(xml.contains("<Parameter name=\"inline\">{&quot;"));
        assert!(xml.contains("FeatureCollection"));
    }
}
