//! Typed GeoJSON document model with simplestyle property extraction.
//!
//! Parsing through this model doubles as the structural validation step:
//! a document that does not deserialize is rejected as invalid GeoJSON
//! before any compilation or marker work begins. Properties are held in a
//! `serde_json::Map` (BTreeMap-backed), which keeps re-serialization
//! deterministic.

use std::fmt;

use serde::de::{SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::Error;

/// Default simplestyle stroke/fill color.
pub const DEFAULT_COLOR: &str = "#555555";

/// A GeoJSON position. RFC 7946 allows an optional third (altitude)
/// element; it is accepted during parsing and discarded, since rendering
/// is strictly planar.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Position {
    pub lon: f64,
    pub lat: f64,
}

impl Serialize for Position {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        [self.lon, self.lat].serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Position {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct PositionVisitor;

        impl<'de> Visitor<'de> for PositionVisitor {
            type Value = Position;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a position array of 2 or 3 numbers")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Position, A::Error> {
                let lon = seq
                    .next_element()?
                    .ok_or_else(|| serde::de::Error::invalid_length(0, &self))?;
                let lat = seq
                    .next_element()?
                    .ok_or_else(|| serde::de::Error::invalid_length(1, &self))?;
                let _altitude: Option<f64> = seq.next_element()?;
                if seq.next_element::<f64>()?.is_some() {
                    return Err(serde::de::Error::invalid_length(4, &self));
                }
                Ok(Position { lon, lat })
            }
        }

        deserializer.deserialize_seq(PositionVisitor)
    }
}

/// GeoJSON geometry variants.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum Geometry {
    Point { coordinates: Position },
    MultiPoint { coordinates: Vec<Position> },
    LineString { coordinates: Vec<Position> },
    MultiLineString { coordinates: Vec<Vec<Position>> },
    Polygon { coordinates: Vec<Vec<Position>> },
    MultiPolygon { coordinates: Vec<Vec<Vec<Position>>> },
    GeometryCollection { geometries: Vec<Geometry> },
}

/// Symbolizer family a geometry belongs to.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum GeometryKind {
    Point,
    Line,
    Polygon,
}

impl Geometry {
    /// The symbolizer family for this geometry. A `GeometryCollection` is
    /// classified by its first member; an empty collection has no kind.
    pub fn kind(&self) -> Option<GeometryKind> {
        match self {
            Geometry::Point { .. } | Geometry::MultiPoint { .. } => Some(GeometryKind::Point),
            Geometry::LineString { .. } | Geometry::MultiLineString { .. } => {
                Some(GeometryKind::Line)
            }
            Geometry::Polygon { .. } | Geometry::MultiPolygon { .. } => {
                Some(GeometryKind::Polygon)
            }
            Geometry::GeometryCollection { geometries } => {
                geometries.first().and_then(Geometry::kind)
            }
        }
    }
}

/// A GeoJSON feature with geometry and free-form properties.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Feature {
    #[serde(default)]
    pub id: Option<Value>,
    pub geometry: Option<Geometry>,
    #[serde(default)]
    pub properties: Option<Map<String, Value>>,
}

impl Feature {
    /// Serializes this feature back to a tagged GeoJSON value, suitable for
    /// embedding in an inline datasource.
    pub fn to_value(&self) -> Value {
        let mut object = Map::new();
        object.insert("type".to_string(), Value::from("Feature"));
        if let Some(id) = &self.id {
            object.insert("id".to_string(), id.clone());
        }
        let geometry = match &self.geometry {
            // Geometry is internally tagged, so this cannot fail.
            Some(geometry) => serde_json::to_value(geometry).unwrap_or(Value::Null),
            None => Value::Null,
        };
        object.insert("geometry".to_string(), geometry);
        let properties = match &self.properties {
            Some(properties) => Value::Object(properties.clone()),
            None => Value::Object(Map::new()),
        };
        object.insert("properties".to_string(), properties);
        Value::Object(object)
    }
}

/// Root GeoJSON object. Bare geometries are not accepted as documents;
/// a source is always a feature or a collection of them.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum GeoJson {
    Feature(Feature),
    FeatureCollection { features: Vec<Feature> },
}

impl GeoJson {
    pub fn features(&self) -> &[Feature] {
        match self {
            GeoJson::Feature(feature) => std::slice::from_ref(feature),
            GeoJson::FeatureCollection { features } => features,
        }
    }
}

/// Parses and structurally validates a raw GeoJSON document.
pub fn parse_document(data: &str) -> Result<GeoJson, Error> {
    serde_json::from_str(data).map_err(|e| Error::InvalidGeoJson(e.to_string()))
}

/// A feature's simplestyle properties, resolved against the convention's
/// defaults. Marker fields stay optional: their absence selects default pin
/// styling rather than a default value.
#[derive(Clone, Debug, PartialEq)]
pub struct FeatureStyle {
    pub stroke: String,
    pub stroke_width: f64,
    pub stroke_opacity: f64,
    pub fill: String,
    pub fill_opacity: f64,
    pub marker_color: Option<String>,
    pub marker_size: Option<String>,
    pub marker_symbol: Option<String>,
}

impl Default for FeatureStyle {
    fn default() -> Self {
        Self {
            stroke: DEFAULT_COLOR.to_string(),
            stroke_width: 2.0,
            stroke_opacity: 1.0,
            fill: DEFAULT_COLOR.to_string(),
            fill_opacity: 0.6,
            marker_color: None,
            marker_size: None,
            marker_symbol: None,
        }
    }
}

impl FeatureStyle {
    pub fn from_properties(properties: Option<&Map<String, Value>>) -> Self {
        let mut style = Self::default();
        let Some(props) = properties else {
            return style;
        };
        if let Some(v) = string_prop(props, "stroke") {
            style.stroke = v;
        }
        if let Some(v) = numeric_prop(props, "stroke-width") {
            style.stroke_width = v;
        }
        if let Some(v) = numeric_prop(props, "stroke-opacity") {
            style.stroke_opacity = v;
        }
        if let Some(v) = string_prop(props, "fill") {
            style.fill = v;
        }
        if let Some(v) = numeric_prop(props, "fill-opacity") {
            style.fill_opacity = v;
        }
        style.marker_color = string_prop(props, "marker-color");
        style.marker_size = string_prop(props, "marker-size");
        style.marker_symbol = string_prop(props, "marker-symbol");
        style
    }
}

fn string_prop(props: &Map<String, Value>, key: &str) -> Option<String> {
    props.get(key).and_then(Value::as_str).map(str::to_string)
}

// Accepts both JSON numbers and numeric strings; documents in the wild
// quote their widths and opacities often enough to matter.
fn numeric_prop(props: &Map<String, Value>, key: &str) -> Option<f64> {
    let value = props.get(key)?;
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}
