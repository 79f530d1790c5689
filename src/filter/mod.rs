use anyhow::Result;
use geo::HasDimensions;
use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::geometry::{self, multi_counterpart};
use crate::schema::SchemaModel;
use crate::sinks::Feature;

pub mod region;

pub use self::region::{Bounds, FeaturePick, FilterConfigError, FilterSpec};

/// Per-pass line counters. A fresh set is created for every pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunStats {
    pub count: u64,
    pub passed: u64,
    pub unparsed: u64,
    pub error_count: u64,
}

/// Restricts features to one geometry type. Outside strict mode a type and
/// its multi-part counterpart match each other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeometryTypeGate {
    pub requested: String,
    pub strict: bool,
}

impl GeometryTypeGate {
    pub fn new(requested: impl Into<String>, strict: bool) -> Self {
        Self {
            requested: requested.into(),
            strict,
        }
    }

    pub fn matches(&self, geom_type: &str) -> bool {
        if self.requested == geom_type {
            return true;
        }
        if self.strict {
            return false;
        }
        multi_counterpart(&self.requested) == Some(geom_type)
            || multi_counterpart(geom_type) == Some(self.requested.as_str())
    }
}

/// Applies schema renames, then rebuilds the property map in schema order.
#[derive(Debug, Clone, Default)]
pub struct PropertyNormalizer {
    renames: IndexMap<String, String>,
    keys: Option<Vec<String>>,
}

impl PropertyNormalizer {
    pub fn new(renames: IndexMap<String, String>, keys: Option<Vec<String>>) -> Self {
        Self { renames, keys }
    }

    pub fn from_schema(schema: &SchemaModel) -> Self {
        Self::new(
            schema.renames.clone(),
            Some(schema.properties.keys().cloned().collect()),
        )
    }

    pub fn apply(&self, mut properties: Map<String, Value>) -> Map<String, Value> {
        for (original, renamed) in &self.renames {
            if let Some(value) = properties.remove(original) {
                properties.insert(renamed.clone(), value);
            }
        }
        match &self.keys {
            None => properties,
            Some(keys) => keys
                .iter()
                .map(|key| {
                    let value = properties.remove(key).unwrap_or(Value::Null);
                    (key.clone(), value)
                })
                .collect(),
        }
    }
}

#[derive(Deserialize)]
struct RawFeature {
    #[serde(default)]
    geometry: Option<Value>,
    #[serde(default)]
    properties: Option<Map<String, Value>>,
}

/// Decodes one line into a feature. Any non-object line is a decode failure.
pub fn parse_feature(line: &[u8]) -> serde_json::Result<Feature> {
    let raw: RawFeature = serde_json::from_slice(line)?;
    Ok(Feature {
        geometry: raw.geometry.filter(|geometry| !geometry.is_null()),
        properties: raw.properties.unwrap_or_default(),
    })
}

/// Strategy chosen once per pass.
pub enum FeatureFilter {
    PassThrough(PassThroughFilter),
    Shape(ShapeFilter),
}

impl FeatureFilter {
    pub fn pass_through(gate: Option<GeometryTypeGate>, normalizer: PropertyNormalizer) -> Self {
        FeatureFilter::PassThrough(PassThroughFilter {
            gate,
            normalizer,
            stats: RunStats::default(),
        })
    }

    pub fn shape(
        spec: FilterSpec,
        clip: bool,
        gate: Option<GeometryTypeGate>,
        normalizer: PropertyNormalizer,
    ) -> Self {
        FeatureFilter::Shape(ShapeFilter {
            spec,
            clip,
            gate,
            normalizer,
            stats: RunStats::default(),
        })
    }

    pub fn process(&mut self, line: &[u8]) -> Option<Feature> {
        match self {
            FeatureFilter::PassThrough(filter) => filter.process(line),
            FeatureFilter::Shape(filter) => filter.process(line),
        }
    }

    pub fn stats(&self) -> RunStats {
        match self {
            FeatureFilter::PassThrough(filter) => filter.stats,
            FeatureFilter::Shape(filter) => filter.stats,
        }
    }
}

fn decode(line: &[u8], stats: &mut RunStats) -> Option<Feature> {
    stats.count += 1;
    match parse_feature(line) {
        Ok(feature) => Some(feature),
        Err(err) => {
            tracing::warn!(
                "Skipping line {}, could not decode JSON ({}): {}",
                stats.count,
                err,
                String::from_utf8_lossy(line)
            );
            stats.unparsed += 1;
            None
        }
    }
}

fn gate_allows(gate: Option<&GeometryTypeGate>, feature: &Feature) -> bool {
    let Some(gate) = gate else {
        return true;
    };
    let geom_type = feature.geometry_type().unwrap_or("");
    if gate.matches(geom_type) {
        return true;
    }
    tracing::debug!(
        "Skipping feature due to geometry type mismatch: expected {}, got {}",
        gate.requested,
        geom_type
    );
    false
}

/// Accepts every decodable feature that clears the optional type gate.
pub struct PassThroughFilter {
    gate: Option<GeometryTypeGate>,
    normalizer: PropertyNormalizer,
    stats: RunStats,
}

impl PassThroughFilter {
    pub fn process(&mut self, line: &[u8]) -> Option<Feature> {
        let mut feature = decode(line, &mut self.stats)?;
        if !gate_allows(self.gate.as_ref(), &feature) {
            return None;
        }
        self.stats.passed += 1;
        feature.properties = self.normalizer.apply(feature.properties);
        Some(feature)
    }
}

/// Keeps features whose geometry intersects the filter region.
pub struct ShapeFilter {
    spec: FilterSpec,
    clip: bool,
    gate: Option<GeometryTypeGate>,
    normalizer: PropertyNormalizer,
    stats: RunStats,
}

impl ShapeFilter {
    pub fn process(&mut self, line: &[u8]) -> Option<Feature> {
        let mut feature = decode(line, &mut self.stats)?;

        let Some(raw_geometry) = feature.geometry.as_ref() else {
            tracing::debug!("Skipping feature {} without geometry", self.stats.count);
            return None;
        };
        if geometry::is_empty_geometry(raw_geometry) {
            tracing::debug!("Skipping feature {} with empty geometry", self.stats.count);
            return None;
        }
        if !gate_allows(self.gate.as_ref(), &feature) {
            return None;
        }

        match self.test_geometry(raw_geometry) {
            Ok(Verdict::Miss) => None,
            Ok(verdict) => {
                self.stats.passed += 1;
                if let Verdict::Replace(clipped) = verdict {
                    feature.geometry = Some(clipped);
                }
                feature.properties = self.normalizer.apply(feature.properties);
                Some(feature)
            }
            Err(err) => {
                tracing::error!("An error occurred processing feature {}: {:#}", self.stats.count, err);
                self.stats.error_count += 1;
                None
            }
        }
    }

    fn test_geometry(&self, raw_geometry: &Value) -> Result<Verdict> {
        let shape = self.spec.shape();
        let parsed = geometry::repair_if_invalid(geometry::parse_geometry(raw_geometry)?)?;
        if !shape.intersects(&parsed) {
            return Ok(Verdict::Miss);
        }
        if !self.clip {
            return Ok(Verdict::Keep);
        }
        // Contact along an edge or at a point leaves nothing to clip to
        let clipped = shape.clip(&parsed);
        if clipped.is_empty() {
            return Ok(Verdict::Keep);
        }
        Ok(Verdict::Replace(geometry::to_geojson(&clipped)?))
    }
}

enum Verdict {
    Miss,
    Keep,
    Replace(Value),
}
