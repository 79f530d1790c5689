use super::{ColumnSpec, DataSink, Feature, coerce_bool, coerce_f64, coerce_i64, coerce_string};
use crate::geometry::parse_geometry;
use crate::schema::PropertyType;
use anyhow::{Context, Result};
use arrow_array::{
    Array, BinaryArray, BooleanArray, Float64Array, Int64Array, RecordBatch, StringArray,
};
use arrow_schema::{DataType, Field, Schema};
use geozero::{CoordDimensions, ToWkb};
use parquet::arrow::ArrowWriter;
use parquet::file::metadata::KeyValue;
use parquet::file::properties::WriterProperties;
use serde_json::Value;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

pub struct GeoParquetSink {
    writer: Option<ArrowWriter<File>>,
    schema: Arc<Schema>,
    columns: Vec<ColumnSpec>,
    column_buffers: Vec<ColumnBuffer>,
    geometry_buf: Vec<Option<Vec<u8>>>,
    batch_size: usize,
    flushed_bytes: u64,
}

enum ColumnBuffer {
    String(Vec<Option<String>>),
    Integer(Vec<Option<i64>>),
    Float(Vec<Option<f64>>),
    Boolean(Vec<Option<bool>>),
}

impl GeoParquetSink {
    pub fn new<P: AsRef<Path>>(
        path: P,
        columns: Vec<ColumnSpec>,
        geometry_types: &[String],
    ) -> Result<Self> {
        let file = File::create(path.as_ref())
            .with_context(|| format!("Failed to create geoparquet file {:?}", path.as_ref()))?;

        let mut fields = vec![Field::new("geometry", DataType::Binary, true)];
        for col in &columns {
            let data_type = match col.col_type {
                PropertyType::Str | PropertyType::Dict | PropertyType::List => DataType::Utf8,
                PropertyType::Int => DataType::Int64,
                PropertyType::Float => DataType::Float64,
                PropertyType::Bool => DataType::Boolean,
            };
            fields.push(Field::new(&col.name, data_type, true));
        }

        let schema = Arc::new(Schema::new(fields));

        let geo_metadata = serde_json::json!({
            "version": "1.0.0",
            "primary_column": "geometry",
            "columns": {
                "geometry": {
                    "encoding": "WKB",
                    "geometry_types": geometry_types,
                    "crs": "EPSG:4326"
                }
            }
        })
        .to_string();

        let kv_metadata = vec![KeyValue::new("geo".to_string(), Some(geo_metadata))];
        let props = WriterProperties::builder()
            .set_key_value_metadata(Some(kv_metadata))
            .build();

        let writer = ArrowWriter::try_new(file, schema.clone(), Some(props))?;

        let column_buffers = columns
            .iter()
            .map(|col| match col.col_type {
                PropertyType::Int => ColumnBuffer::Integer(Vec::new()),
                PropertyType::Float => ColumnBuffer::Float(Vec::new()),
                PropertyType::Bool => ColumnBuffer::Boolean(Vec::new()),
                PropertyType::Str | PropertyType::Dict | PropertyType::List => {
                    ColumnBuffer::String(Vec::new())
                }
            })
            .collect();

        Ok(Self {
            writer: Some(writer),
            schema,
            columns,
            column_buffers,
            geometry_buf: Vec::new(),
            batch_size: 10_000,
            flushed_bytes: 0,
        })
    }

    fn flush(&mut self) -> Result<()> {
        if self.geometry_buf.is_empty() {
            return Ok(());
        }

        let geometry_array: BinaryArray = self.geometry_buf.iter().map(|wkb| wkb.as_deref()).collect();
        let mut arrays: Vec<Arc<dyn Array>> = Vec::new();
        arrays.push(Arc::new(geometry_array));

        for buffer in &mut self.column_buffers {
            match buffer {
                ColumnBuffer::String(values) => {
                    arrays.push(Arc::new(StringArray::from(std::mem::take(values))));
                }
                ColumnBuffer::Integer(values) => {
                    arrays.push(Arc::new(Int64Array::from(std::mem::take(values))));
                }
                ColumnBuffer::Float(values) => {
                    arrays.push(Arc::new(Float64Array::from(std::mem::take(values))));
                }
                ColumnBuffer::Boolean(values) => {
                    arrays.push(Arc::new(BooleanArray::from(std::mem::take(values))));
                }
            }
        }

        let batch = RecordBatch::try_new(self.schema.clone(), arrays)?;

        if let Some(writer) = self.writer.as_mut() {
            writer.write(&batch)?;
            self.flushed_bytes = (writer.bytes_written() + writer.in_progress_size()) as u64;
        }
        self.geometry_buf.clear();

        Ok(())
    }

    fn append_columns(&mut self, feature: &Feature) {
        for (index, col) in self.columns.iter().enumerate() {
            let value = feature.properties.get(&col.name);
            match &mut self.column_buffers[index] {
                ColumnBuffer::String(values) => values.push(coerce_string(value)),
                ColumnBuffer::Integer(values) => values.push(coerce_i64(value)),
                ColumnBuffer::Float(values) => values.push(coerce_f64(value)),
                ColumnBuffer::Boolean(values) => values.push(coerce_bool(value)),
            }
        }
    }
}

impl DataSink for GeoParquetSink {
    fn add_feature(&mut self, feature: &Feature) -> Result<()> {
        let wkb = feature.geometry.as_ref().map(encode_wkb).transpose()?;

        self.geometry_buf.push(wkb);
        self.append_columns(feature);

        if self.geometry_buf.len() >= self.batch_size {
            self.flush()?;
        }

        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.flush()?;
        if let Some(writer) = self.writer.take() {
            writer.close()?;
        }
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.flushed_bytes
    }
}

fn encode_wkb(geometry: &Value) -> Result<Vec<u8>> {
    parse_geometry(geometry)?
        .to_wkb(CoordDimensions::xy())
        .context("Failed to convert geometry to WKB")
}
