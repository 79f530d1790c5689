use geo::BoundingRect;
use geo_types::{Geometry, MultiPolygon};
use geojson::GeoJson;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::geometry::{FilterShape, bounds_polygon, repair_if_invalid};

#[derive(Debug, thiserror::Error)]
pub enum FilterConfigError {
    #[error("Invalid bounds format: {0:?}. Expected 'min_lon,min_lat,max_lon,max_lat'")]
    BoundsFormat(String),

    #[error("Bounds values are out of valid range")]
    BoundsRange,

    #[error("Bounds values are not in correct order: min values must be less than max values")]
    BoundsOrder,

    #[error("Only one of --filter-file or --bounds can be used, not both")]
    ConflictingFilters,

    #[error("Filter file not found: {0:?}")]
    FilterFileMissing(PathBuf),

    #[error("Could not read filter file {path:?}: {reason}")]
    FilterFileUnreadable { path: PathBuf, reason: String },

    #[error("Only one of --pick-filter-feature-id or --pick-filter-feature-kv can be used, not both")]
    ConflictingSelectors,

    #[error("Invalid feature index {index}. Filter file contains {available} polygon features")]
    FeatureIndex { index: usize, available: usize },

    #[error("Invalid --pick-filter-feature-kv format: {0:?}. Expected 'key=value'")]
    KeyValueFormat(String),

    #[error("No polygon features in the filter matched the selection criteria")]
    NoMatch,

    #[error(
        "{0} polygon features matched the selection criteria. Refine the selection using --pick-filter-feature-id or --pick-filter-feature-kv"
    )]
    Ambiguous(usize),

    #[error("Filter shape is invalid and could not be repaired: {0}")]
    InvalidShape(String),
}

/// Longitude/latitude rectangle, validated on parse.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl FromStr for Bounds {
    type Err = FilterConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parts: Vec<f64> = value
            .split(',')
            .map(|part| part.trim().parse::<f64>())
            .collect::<Result<_, _>>()
            .map_err(|_| FilterConfigError::BoundsFormat(value.to_string()))?;
        let &[min_lon, min_lat, max_lon, max_lat] = parts.as_slice() else {
            return Err(FilterConfigError::BoundsFormat(value.to_string()));
        };

        let lon_ok = |v: f64| (-180.0..=180.0).contains(&v);
        let lat_ok = |v: f64| (-90.0..=90.0).contains(&v);
        if !(lon_ok(min_lon) && lat_ok(min_lat) && lon_ok(max_lon) && lat_ok(max_lat)) {
            return Err(FilterConfigError::BoundsRange);
        }
        if min_lon >= max_lon || min_lat >= max_lat {
            return Err(FilterConfigError::BoundsOrder);
        }

        Ok(Bounds {
            min_lon,
            min_lat,
            max_lon,
            max_lat,
        })
    }
}

/// How to choose the filter polygon out of a filter file.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FeaturePick {
    #[default]
    Only,
    Index(usize),
    KeyValues(Vec<(String, String)>),
}

impl FeaturePick {
    pub fn from_options(id: Option<usize>, kv: &[String]) -> Result<Self, FilterConfigError> {
        match (id, kv.is_empty()) {
            (Some(_), false) => Err(FilterConfigError::ConflictingSelectors),
            (Some(index), true) => Ok(FeaturePick::Index(index)),
            (None, true) => Ok(FeaturePick::Only),
            (None, false) => kv
                .iter()
                .map(|pair| match pair.split_once('=') {
                    Some((key, value)) => Ok((key.to_string(), value.to_string())),
                    None => Err(FilterConfigError::KeyValueFormat(pair.clone())),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(FeaturePick::KeyValues),
        }
    }
}

struct Candidate {
    index: usize,
    region: MultiPolygon<f64>,
    properties: Map<String, Value>,
}

/// The filter region, immutable for the life of a run.
pub struct FilterSpec {
    shape: FilterShape,
}

impl FilterSpec {
    pub fn from_bounds(bounds: &Bounds) -> Self {
        let polygon = bounds_polygon(bounds.min_lon, bounds.min_lat, bounds.max_lon, bounds.max_lat);
        Self {
            shape: FilterShape::new(MultiPolygon::new(vec![polygon])),
        }
    }

    pub fn from_filter_file(path: &Path, pick: &FeaturePick) -> Result<Self, FilterConfigError> {
        if !path.exists() {
            return Err(FilterConfigError::FilterFileMissing(path.to_path_buf()));
        }
        let unreadable = |reason: String| FilterConfigError::FilterFileUnreadable {
            path: path.to_path_buf(),
            reason,
        };
        let content = std::fs::read_to_string(path).map_err(|err| unreadable(err.to_string()))?;
        let geojson: GeoJson = content.parse().map_err(|err: geojson::Error| unreadable(err.to_string()))?;

        let candidates = polygon_candidates(geojson);
        tracing::debug!("Filter file {:?} has {} polygon features", path, candidates.len());
        let region = pick_region(candidates, pick)?;
        Self::from_region(region)
    }

    pub fn from_region(region: MultiPolygon<f64>) -> Result<Self, FilterConfigError> {
        let repaired = repair_if_invalid(Geometry::MultiPolygon(region))
            .map_err(|err| FilterConfigError::InvalidShape(err.to_string()))?;
        let region = match repaired {
            Geometry::Polygon(polygon) => MultiPolygon::new(vec![polygon]),
            Geometry::MultiPolygon(polygons) => polygons,
            other => return Err(FilterConfigError::InvalidShape(format!("{other:?}"))),
        };
        Ok(Self {
            shape: FilterShape::new(region),
        })
    }

    pub fn shape(&self) -> &FilterShape {
        &self.shape
    }
}

fn polygon_candidates(geojson: GeoJson) -> Vec<Candidate> {
    let features = match geojson {
        GeoJson::FeatureCollection(collection) => collection.features,
        GeoJson::Feature(feature) => vec![feature],
        GeoJson::Geometry(geometry) => vec![geojson::Feature::from(geometry)],
    };

    features
        .into_iter()
        .filter_map(|feature| {
            let geometry = Geometry::<f64>::try_from(feature.geometry?).ok()?;
            let region = match geometry {
                Geometry::Polygon(polygon) => MultiPolygon::new(vec![polygon]),
                Geometry::MultiPolygon(polygons) => polygons,
                _ => return None,
            };
            Some((region, feature.properties.unwrap_or_default()))
        })
        .enumerate()
        .map(|(index, (region, properties))| Candidate {
            index,
            region,
            properties,
        })
        .collect()
}

/// Non-string values compare by their text form. Booleans and null also accept
/// the capitalized `True`, `False` and `None` spellings.
fn property_matches(properties: &Map<String, Value>, key: &str, expected: &str) -> bool {
    match properties.get(key) {
        Some(Value::String(value)) => value == expected,
        Some(Value::Bool(flag)) => expected.eq_ignore_ascii_case(if *flag { "true" } else { "false" }),
        Some(Value::Null) => expected == "None" || expected == "null",
        Some(other) => other.to_string() == expected,
        None => false,
    }
}

fn pick_region(
    candidates: Vec<Candidate>,
    pick: &FeaturePick,
) -> Result<MultiPolygon<f64>, FilterConfigError> {
    let available = candidates.len();
    let mut matched: Vec<Candidate> = match pick {
        FeaturePick::Only => candidates,
        FeaturePick::Index(index) => {
            let found = candidates.into_iter().find(|candidate| candidate.index == *index);
            match found {
                Some(candidate) => vec![candidate],
                None => {
                    return Err(FilterConfigError::FeatureIndex {
                        index: *index,
                        available,
                    });
                }
            }
        }
        FeaturePick::KeyValues(pairs) => candidates
            .into_iter()
            .filter(|candidate| {
                pairs
                    .iter()
                    .all(|(key, value)| property_matches(&candidate.properties, key, value))
            })
            .collect(),
    };

    match matched.len() {
        0 => Err(FilterConfigError::NoMatch),
        1 => Ok(matched.remove(0).region),
        count => {
            log_candidates(&matched);
            Err(FilterConfigError::Ambiguous(count))
        }
    }
}

fn log_candidates(candidates: &[Candidate]) {
    tracing::error!("Available polygon features in the filter file:");
    for candidate in candidates {
        let props = candidate
            .properties
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(", ");
        let bbox = candidate
            .region
            .bounding_rect()
            .map(|rect| {
                format!(
                    "({}, {}, {}, {})",
                    rect.min().x,
                    rect.min().y,
                    rect.max().x,
                    rect.max().y
                )
            })
            .unwrap_or_default();
        tracing::error!("  ID {}: {}, BBOX={}", candidate.index, props, bbox);
    }
}
