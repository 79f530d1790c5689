use anyhow::Result;
use serde_json::{Map, Value};
use std::io::{self, Write};

use crate::geometry::{multi_counterpart, parse_geometry};
use crate::pipeline::FeatureSink;
use crate::schema::{GeometryTarget, PropertyType, SchemaModel};

pub mod geojson;
pub mod geojsonl;
pub mod geoparquet;
pub mod gpkg;

pub use self::geojson::GeoJsonSink;
pub use self::geojsonl::GeoJsonlSink;
pub use self::geoparquet::GeoParquetSink;
pub use self::gpkg::GpkgSink;

/// One input record: raw GeoJSON geometry plus its ordered properties.
#[derive(Clone, Debug, PartialEq)]
pub struct Feature {
    pub geometry: Option<Value>,
    pub properties: Map<String, Value>,
}

impl Feature {
    pub fn geometry_type(&self) -> Option<&str> {
        self.geometry
            .as_ref()
            .and_then(|geometry| geometry.get("type"))
            .and_then(Value::as_str)
    }

    pub fn to_geojson(&self) -> Result<::geojson::Feature> {
        let geometry = match &self.geometry {
            Some(value) => Some(serde_json::from_value::<::geojson::Geometry>(value.clone())?),
            None => None,
        };
        Ok(::geojson::Feature {
            bbox: None,
            geometry,
            id: None,
            properties: Some(self.properties.clone()),
            foreign_members: None,
        })
    }
}

#[derive(Clone, Debug)]
pub struct ColumnSpec {
    pub name: String,
    pub col_type: PropertyType,
}

impl ColumnSpec {
    pub fn from_schema(schema: &SchemaModel) -> Vec<ColumnSpec> {
        schema
            .properties
            .iter()
            .map(|(name, col_type)| ColumnSpec {
                name: name.clone(),
                col_type: *col_type,
            })
            .collect()
    }
}

/// A vector-format writer.
pub trait DataSink: Send {
    fn add_feature(&mut self, feature: &Feature) -> Result<()>;
    fn finish(&mut self) -> Result<()>;
    /// Bytes handed to the output so far, including buffered ones.
    fn bytes_written(&self) -> u64;
}

/// Counts bytes passing through to the inner writer.
pub struct CountingWriter<W> {
    inner: W,
    count: u64,
}

impl<W: Write> CountingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, count: 0 }
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.count += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Wraps a format writer and coerces each feature's geometry to the schema's
/// target type before writing.
pub struct OutputSink {
    inner: Box<dyn DataSink>,
    target: GeometryTarget,
    written: u64,
    dropped: u64,
    closed: bool,
}

impl OutputSink {
    pub fn new(inner: Box<dyn DataSink>, schema: &SchemaModel) -> Self {
        Self {
            inner,
            target: schema.geometry_target(),
            written: 0,
            dropped: 0,
            closed: false,
        }
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Finalizes the underlying writer. Later calls are no-ops.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.inner.finish()
    }
}

impl FeatureSink for OutputSink {
    /// Writer errors abort the pass. A geometry that cannot be decoded is a
    /// per-feature problem: it is logged and counted as dropped.
    fn write(&mut self, feature: Feature) -> Result<()> {
        let Some(feature) = coerce_geometry(feature, &self.target) else {
            self.dropped += 1;
            return Ok(());
        };
        if let Some(geometry) = &feature.geometry {
            if let Err(err) = parse_geometry(geometry) {
                tracing::error!("Skipping feature, could not encode geometry: {:#}", err);
                self.dropped += 1;
                return Ok(());
            }
        }
        self.inner.add_feature(&feature)?;
        self.written += 1;
        Ok(())
    }

    fn size(&self) -> u64 {
        self.inner.bytes_written()
    }
}

pub(crate) fn coerce_string(value: Option<&Value>) -> Option<String> {
    match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => Some(other.to_string()),
    }
}

pub(crate) fn coerce_i64(value: Option<&Value>) -> Option<i64> {
    match value {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Some(Value::String(s)) => s.parse::<i64>().ok(),
        Some(Value::Bool(b)) => Some(i64::from(*b)),
        _ => None,
    }
}

pub(crate) fn coerce_f64(value: Option<&Value>) -> Option<f64> {
    match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.parse::<f64>().ok(),
        _ => None,
    }
}

pub(crate) fn coerce_bool(value: Option<&Value>) -> Option<bool> {
    match value {
        Some(Value::Bool(b)) => Some(*b),
        Some(Value::String(s)) => s.parse::<bool>().ok(),
        _ => None,
    }
}

/// Promotes single-part geometries to the multi-part type a uniform target
/// demands. Features that still do not fit are dropped with a warning.
pub fn coerce_geometry(mut feature: Feature, target: &GeometryTarget) -> Option<Feature> {
    let Some(geom_type) = feature.geometry_type().map(str::to_string) else {
        return Some(feature);
    };
    if target.accepts(&geom_type) {
        return Some(feature);
    }

    if let GeometryTarget::Uniform(expected) = target {
        if multi_counterpart(&geom_type) == Some(expected.as_str()) {
            if let Some(Value::Object(geometry)) = feature.geometry.as_mut() {
                let coordinates = geometry.remove("coordinates").unwrap_or(Value::Null);
                geometry.insert("type".to_string(), Value::String(expected.clone()));
                geometry.insert("coordinates".to_string(), Value::Array(vec![coordinates]));
                return Some(feature);
            }
        }
    }

    tracing::warn!(
        "Skipping feature with incompatible geometry type: {} (expected {:?})",
        geom_type,
        target
    );
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;
    use serde_json::json;
    use std::collections::BTreeSet;
    use std::sync::{Arc, Mutex};

    fn feature(geometry: Value) -> Feature {
        Feature {
            geometry: Some(geometry),
            properties: Map::new(),
        }
    }

    fn schema(types: &[&str]) -> SchemaModel {
        SchemaModel {
            geometry: types.iter().map(|t| t.to_string()).collect::<BTreeSet<_>>(),
            properties: IndexMap::new(),
            renames: IndexMap::new(),
        }
    }

    #[derive(Clone, Default)]
    struct MemorySink {
        features: Arc<Mutex<Vec<Feature>>>,
        finished: Arc<Mutex<u32>>,
    }

    impl DataSink for MemorySink {
        fn add_feature(&mut self, feature: &Feature) -> Result<()> {
            self.features.lock().unwrap().push(feature.clone());
            Ok(())
        }

        fn finish(&mut self) -> Result<()> {
            *self.finished.lock().unwrap() += 1;
            Ok(())
        }

        fn bytes_written(&self) -> u64 {
            self.features.lock().unwrap().len() as u64 * 10
        }
    }

    #[test]
    fn promotes_polygon_to_multipolygon() {
        let target = schema(&["MultiPolygon", "Polygon"]).geometry_target();
        let ring = json!([[[0, 0], [1, 0], [1, 1], [0, 0]]]);
        let converted =
            coerce_geometry(feature(json!({"type": "Polygon", "coordinates": ring})), &target).unwrap();
        assert_eq!(
            converted.geometry.unwrap(),
            json!({"type": "MultiPolygon", "coordinates": [ring]})
        );
    }

    #[test]
    fn promotes_point_to_multipoint() {
        let target = GeometryTarget::Uniform("MultiPoint".to_string());
        let converted =
            coerce_geometry(feature(json!({"type": "Point", "coordinates": [1, 2]})), &target).unwrap();
        assert_eq!(converted.geometry_type(), Some("MultiPoint"));
        assert_eq!(converted.geometry.unwrap()["coordinates"], json!([[1, 2]]));
    }

    #[test]
    fn keeps_matching_geometry() {
        let target = GeometryTarget::Uniform("LineString".to_string());
        let original = feature(json!({"type": "LineString", "coordinates": [[0, 0], [1, 1]]}));
        assert_eq!(coerce_geometry(original.clone(), &target), Some(original));
    }

    #[test]
    fn drops_incompatible_geometry() {
        let target = GeometryTarget::Uniform("Polygon".to_string());
        assert!(coerce_geometry(feature(json!({"type": "Point", "coordinates": [0, 0]})), &target).is_none());
        let target = GeometryTarget::Uniform("Polygon".to_string());
        assert!(
            coerce_geometry(
                feature(json!({"type": "MultiPolygon", "coordinates": []})),
                &target
            )
            .is_none()
        );
    }

    #[test]
    fn mixed_target_accepts_declared_types_only() {
        let target = schema(&["LineString", "Point"]).geometry_target();
        assert!(coerce_geometry(feature(json!({"type": "Point", "coordinates": [0, 0]})), &target).is_some());
        assert!(coerce_geometry(feature(json!({"type": "Polygon", "coordinates": []})), &target).is_none());
    }

    #[test]
    fn output_sink_counts_and_closes_once() {
        let memory = MemorySink::default();
        let mut sink = OutputSink::new(Box::new(memory.clone()), &schema(&["Point"]));
        sink.write(feature(json!({"type": "Point", "coordinates": [0, 0]}))).unwrap();
        sink.write(feature(json!({"type": "LineString", "coordinates": [[0, 0], [1, 1]]})))
            .unwrap();
        assert_eq!(sink.written(), 1);
        assert_eq!(sink.dropped(), 1);
        assert_eq!(sink.size(), 10);

        sink.close().unwrap();
        sink.close().unwrap();
        assert_eq!(*memory.finished.lock().unwrap(), 1);
    }

    #[test]
    fn undecodable_geometry_is_dropped_not_written() {
        let memory = MemorySink::default();
        let mut sink = OutputSink::new(Box::new(memory.clone()), &schema(&["Point"]));
        sink.write(feature(json!({"type": "Point", "coordinates": "oops"}))).unwrap();
        sink.write(feature(json!({"type": "Point", "coordinates": [1, 2]}))).unwrap();
        sink.write(Feature {
            geometry: None,
            properties: Map::new(),
        })
        .unwrap();
        assert_eq!(sink.written(), 2);
        assert_eq!(sink.dropped(), 1);
        assert_eq!(memory.features.lock().unwrap().len(), 2);
    }

    #[test]
    fn coerce_string_variants() {
        assert_eq!(coerce_string(Some(&json!("hello"))), Some("hello".to_string()));
        assert_eq!(coerce_string(Some(&json!(42))), Some("42".to_string()));
        assert_eq!(coerce_string(Some(&json!({"a": 1}))), Some("{\"a\":1}".to_string()));
        assert_eq!(coerce_string(Some(&Value::Null)), None);
        assert_eq!(coerce_string(None), None);
    }

    #[test]
    fn coerce_i64_variants() {
        assert_eq!(coerce_i64(Some(&json!(42))), Some(42));
        assert_eq!(coerce_i64(Some(&json!(3.9))), Some(3));
        assert_eq!(coerce_i64(Some(&json!(-5.7))), Some(-5));
        assert_eq!(coerce_i64(Some(&json!("123"))), Some(123));
        assert_eq!(coerce_i64(Some(&json!(" 123 "))), None);
        assert_eq!(coerce_i64(Some(&json!("not a number"))), None);
        assert_eq!(coerce_i64(None), None);
    }

    #[test]
    fn coerce_f64_variants() {
        assert_eq!(coerce_f64(Some(&json!(3.5))), Some(3.5));
        assert_eq!(coerce_f64(Some(&json!(42))), Some(42.0));
        assert_eq!(coerce_f64(Some(&json!("2.5"))), Some(2.5));
        assert_eq!(coerce_f64(Some(&Value::Null)), None);
    }

    #[test]
    fn coerce_bool_variants() {
        assert_eq!(coerce_bool(Some(&json!(true))), Some(true));
        assert_eq!(coerce_bool(Some(&json!("false"))), Some(false));
        assert_eq!(coerce_bool(Some(&json!(1))), None);
    }

    #[test]
    fn counting_writer_tracks_bytes() {
        let mut writer = CountingWriter::new(Vec::new());
        writer.write_all(b"hello").unwrap();
        writer.write_all(b" world").unwrap();
        assert_eq!(writer.count(), 11);
    }
}
