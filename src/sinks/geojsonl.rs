use super::{CountingWriter, DataSink, Feature};
use anyhow::Result;
use geojson::GeoJson;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// GeoJSONSeq output: one feature object per line.
pub struct GeoJsonlSink {
    writer: CountingWriter<BufWriter<Box<dyn Write + Send>>>,
}

impl GeoJsonlSink {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            writer: CountingWriter::new(BufWriter::new(Box::new(file))),
        })
    }

    pub fn stdout() -> Result<Self> {
        Ok(Self {
            writer: CountingWriter::new(BufWriter::new(Box::new(std::io::stdout()))),
        })
    }
}

impl DataSink for GeoJsonlSink {
    fn add_feature(&mut self, feature: &Feature) -> Result<()> {
        let geojson = GeoJson::Feature(feature.to_geojson()?);
        serde_json::to_writer(&mut self.writer, &geojson)?;
        writeln!(self.writer)?;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.writer.count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, Value, json};
    use tempfile::NamedTempFile;

    #[test]
    fn writes_one_feature_per_line() {
        let temp_file = NamedTempFile::with_suffix(".geojsonl").unwrap();
        let mut sink = GeoJsonlSink::new(temp_file.path()).unwrap();

        for (name, lon) in [("Bengaluru", 77.59), ("Hyderabad", 78.48)] {
            let mut properties = Map::new();
            properties.insert("name".to_string(), Value::String(name.to_string()));
            sink.add_feature(&Feature {
                geometry: Some(json!({"type": "Point", "coordinates": [lon, 12.0]})),
                properties,
            })
            .unwrap();
        }
        sink.finish().unwrap();

        let content = std::fs::read_to_string(temp_file.path()).unwrap();
        assert_eq!(sink.bytes_written(), content.len() as u64);
        let lines: Vec<Value> = content
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["type"], "Feature");
        assert_eq!(lines[1]["properties"]["name"], "Hyderabad");
    }

    #[test]
    fn writes_null_geometry() {
        let temp_file = NamedTempFile::with_suffix(".geojsonl").unwrap();
        let mut sink = GeoJsonlSink::new(temp_file.path()).unwrap();
        sink.add_feature(&Feature {
            geometry: None,
            properties: Map::new(),
        })
        .unwrap();
        sink.finish().unwrap();

        let content = std::fs::read_to_string(temp_file.path()).unwrap();
        let parsed: Value = serde_json::from_str(content.trim()).unwrap();
        assert!(parsed["geometry"].is_null());
    }
}
