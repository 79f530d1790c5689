use anyhow::{Result, bail};
use geo::{BooleanOps, Intersects, PreparedGeometry, Relate, Validation};
use geo_types::{Geometry, GeometryCollection, LineString, MultiLineString, MultiPoint, MultiPolygon, Polygon};
use serde_json::Value;

/// Geometry type names as they appear in GeoJSON `type` members.
pub const GEOMETRY_TYPES: [&str; 7] = [
    "Point",
    "LineString",
    "Polygon",
    "MultiPoint",
    "MultiLineString",
    "MultiPolygon",
    "GeometryCollection",
];

/// Multi-part counterpart of a single-part type name.
pub fn multi_counterpart(geom_type: &str) -> Option<&'static str> {
    match geom_type {
        "Point" => Some("MultiPoint"),
        "LineString" => Some("MultiLineString"),
        "Polygon" => Some("MultiPolygon"),
        _ => None,
    }
}

/// True when a raw GeoJSON geometry carries no coordinates: `[]`, or a first
/// nested coordinate array that is itself empty.
pub fn is_empty_geometry(geometry: &Value) -> bool {
    if geometry.get("type").and_then(Value::as_str) == Some("GeometryCollection") {
        return match geometry.get("geometries").and_then(Value::as_array) {
            Some(members) => members.is_empty(),
            None => true,
        };
    }
    match geometry.get("coordinates").and_then(Value::as_array) {
        None => true,
        Some(coords) => match coords.first() {
            None => true,
            Some(Value::Array(first)) => first.is_empty(),
            Some(_) => false,
        },
    }
}

pub fn parse_geometry(geometry: &Value) -> Result<Geometry<f64>> {
    let geometry: geojson::Geometry = serde_json::from_value(geometry.clone())?;
    Ok(Geometry::<f64>::try_from(geometry)?)
}

pub fn to_geojson(geometry: &Geometry<f64>) -> Result<Value> {
    Ok(serde_json::to_value(geojson::Geometry::new(geojson::Value::from(geometry)))?)
}

/// Returns the geometry unchanged when valid; polygonal geometries that are
/// not are rebuilt through a boolean union, which resolves self-intersections.
pub fn repair_if_invalid(geometry: Geometry<f64>) -> Result<Geometry<f64>> {
    if geometry.is_valid() {
        return Ok(geometry);
    }
    let polygons = match geometry {
        Geometry::Polygon(polygon) => MultiPolygon::new(vec![polygon]),
        Geometry::MultiPolygon(polygons) => polygons,
        Geometry::Rect(rect) => MultiPolygon::new(vec![rect.to_polygon()]),
        Geometry::Triangle(triangle) => MultiPolygon::new(vec![triangle.to_polygon()]),
        other => bail!("could not repair invalid {}", type_name(&other)),
    };
    let repaired = polygons.union(&MultiPolygon::<f64>::new(Vec::new()));
    if repaired.0.is_empty() || !repaired.is_valid() {
        bail!("could not repair invalid polygon");
    }
    Ok(collapse_polygons(repaired))
}

pub fn type_name(geometry: &Geometry<f64>) -> &'static str {
    match geometry {
        Geometry::Point(_) => "Point",
        Geometry::Line(_) | Geometry::LineString(_) => "LineString",
        Geometry::Polygon(_) | Geometry::Rect(_) | Geometry::Triangle(_) => "Polygon",
        Geometry::MultiPoint(_) => "MultiPoint",
        Geometry::MultiLineString(_) => "MultiLineString",
        Geometry::MultiPolygon(_) => "MultiPolygon",
        Geometry::GeometryCollection(_) => "GeometryCollection",
    }
}

/// Polygonal region prepared for many repeated intersection tests.
pub struct FilterShape {
    region: MultiPolygon<f64>,
    prepared: PreparedGeometry<'static, MultiPolygon<f64>>,
}

impl FilterShape {
    pub fn new(region: MultiPolygon<f64>) -> Self {
        let prepared = PreparedGeometry::from(region.clone());
        Self { region, prepared }
    }

    /// Boundary contact counts as intersecting.
    pub fn intersects(&self, geometry: &Geometry<f64>) -> bool {
        self.prepared.relate(geometry).is_intersects()
    }

    /// Intersection of `geometry` with the region. Single-part results are
    /// returned as single-part geometries.
    pub fn clip(&self, geometry: &Geometry<f64>) -> Geometry<f64> {
        match geometry {
            Geometry::Point(point) => Geometry::Point(*point),
            Geometry::MultiPoint(points) => collapse_points(
                points
                    .iter()
                    .filter(|point| self.region.intersects(*point))
                    .copied()
                    .collect(),
            ),
            Geometry::Line(line) => self.clip_lines(MultiLineString::new(vec![LineString::from(*line)])),
            Geometry::LineString(line) => self.clip_lines(MultiLineString::new(vec![line.clone()])),
            Geometry::MultiLineString(lines) => self.clip_lines(lines.clone()),
            Geometry::Polygon(polygon) => {
                collapse_polygons(self.region.intersection(&MultiPolygon::new(vec![polygon.clone()])))
            }
            Geometry::Rect(rect) => {
                collapse_polygons(self.region.intersection(&MultiPolygon::new(vec![rect.to_polygon()])))
            }
            Geometry::Triangle(triangle) => collapse_polygons(
                self.region
                    .intersection(&MultiPolygon::new(vec![triangle.to_polygon()])),
            ),
            Geometry::MultiPolygon(polygons) => collapse_polygons(self.region.intersection(polygons)),
            Geometry::GeometryCollection(members) => Geometry::GeometryCollection(
                members
                    .iter()
                    .filter(|member| self.intersects(member))
                    .map(|member| self.clip(member))
                    .collect::<GeometryCollection<f64>>(),
            ),
        }
    }

    fn clip_lines(&self, lines: MultiLineString<f64>) -> Geometry<f64> {
        let mut clipped = self.region.clip(&lines, false);
        if clipped.0.len() == 1 {
            Geometry::LineString(clipped.0.remove(0))
        } else {
            Geometry::MultiLineString(clipped)
        }
    }
}

fn collapse_polygons(mut polygons: MultiPolygon<f64>) -> Geometry<f64> {
    if polygons.0.len() == 1 {
        Geometry::Polygon(polygons.0.remove(0))
    } else {
        Geometry::MultiPolygon(polygons)
    }
}

fn collapse_points(mut points: Vec<geo_types::Point<f64>>) -> Geometry<f64> {
    if points.len() == 1 {
        Geometry::Point(points.remove(0))
    } else {
        Geometry::MultiPoint(MultiPoint::new(points))
    }
}

/// Axis-aligned rectangle as a closed polygon ring.
pub fn bounds_polygon(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Polygon<f64> {
    Polygon::new(
        LineString::from(vec![
            (min_x, min_y),
            (max_x, min_y),
            (max_x, max_y),
            (min_x, max_y),
            (min_x, min_y),
        ]),
        vec![],
    )
}
