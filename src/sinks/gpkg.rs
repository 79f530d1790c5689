use super::{ColumnSpec, DataSink, Feature, coerce_bool, coerce_f64, coerce_i64, coerce_string};
use crate::geometry::parse_geometry;
use crate::schema::PropertyType;
use anyhow::{Context, Result};
use geo::BoundingRect;
use geozero::{CoordDimensions, ToWkb};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, params, params_from_iter};
use serde_json::Value;
use std::path::{Path, PathBuf};

const SRS_ID: i32 = 4326;
const GEOMETRY_COLUMN: &str = "geom";

const CORE_TABLES: &str = r##"
PRAGMA application_id = 1196444487;
PRAGMA user_version = 10400;
CREATE TABLE gpkg_spatial_ref_sys (
    srs_name TEXT NOT NULL,
    srs_id INTEGER NOT NULL PRIMARY KEY,
    organization TEXT NOT NULL,
    organization_coordsys_id INTEGER NOT NULL,
    definition TEXT NOT NULL,
    description TEXT
);
CREATE TABLE gpkg_contents (
    table_name TEXT NOT NULL PRIMARY KEY,
    data_type TEXT NOT NULL,
    identifier TEXT UNIQUE,
    description TEXT DEFAULT '',
    last_change DATETIME NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
    min_x DOUBLE,
    min_y DOUBLE,
    max_x DOUBLE,
    max_y DOUBLE,
    srs_id INTEGER,
    CONSTRAINT fk_gc_r_srs_id FOREIGN KEY (srs_id) REFERENCES gpkg_spatial_ref_sys(srs_id)
);
CREATE TABLE gpkg_geometry_columns (
    table_name TEXT NOT NULL,
    column_name TEXT NOT NULL,
    geometry_type_name TEXT NOT NULL,
    srs_id INTEGER NOT NULL,
    z TINYINT NOT NULL,
    m TINYINT NOT NULL,
    CONSTRAINT pk_geom_cols PRIMARY KEY (table_name, column_name),
    CONSTRAINT fk_gc_tn FOREIGN KEY (table_name) REFERENCES gpkg_contents(table_name),
    CONSTRAINT fk_gc_srs FOREIGN KEY (srs_id) REFERENCES gpkg_spatial_ref_sys(srs_id)
);
INSERT INTO gpkg_spatial_ref_sys VALUES
    ('Undefined cartesian SRS', -1, 'NONE', -1, 'undefined', 'undefined cartesian coordinate reference system'),
    ('Undefined geographic SRS', 0, 'NONE', 0, 'undefined', 'undefined geographic coordinate reference system'),
    ('WGS 84 geodetic', 4326, 'EPSG', 4326,
     'GEOGCS["WGS 84",DATUM["WGS_1984",SPHEROID["WGS 84",6378137,298.257223563,AUTHORITY["EPSG","7030"]],AUTHORITY["EPSG","6326"]],PRIMEM["Greenwich",0,AUTHORITY["EPSG","8901"]],UNIT["degree",0.0174532925199433,AUTHORITY["EPSG","9122"]],AUTHORITY["EPSG","4326"]]',
     'longitude/latitude coordinates in decimal degrees on the WGS 84 spheroid');
"##;

/// GeoPackage output: one feature table in a SQLite database, written inside
/// a single transaction that `finish` commits.
pub struct GpkgSink {
    conn: Option<Connection>,
    path: PathBuf,
    table: String,
    columns: Vec<ColumnSpec>,
    insert_sql: String,
    extent: Option<[f64; 4]>,
    bytes: u64,
}

impl GpkgSink {
    /// `geometry_type` is a GeoJSON type name, or `None` for a mixed layer.
    pub fn new<P: AsRef<Path>>(
        path: P,
        layer: &str,
        columns: Vec<ColumnSpec>,
        geometry_type: Option<&str>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path)
            .with_context(|| format!("Failed to create geopackage file {:?}", path))?;
        conn.execute_batch(CORE_TABLES)
            .context("Failed to initialize geopackage metadata tables")?;

        let column_names = column_names(&columns);
        let mut definitions = vec![
            "fid INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL".to_string(),
            format!("{} {}", quote(GEOMETRY_COLUMN), gpkg_type_name(geometry_type)),
        ];
        for (col, name) in columns.iter().zip(&column_names) {
            let sql_type = match col.col_type {
                PropertyType::Str | PropertyType::Dict | PropertyType::List => "TEXT",
                PropertyType::Int => "INTEGER",
                PropertyType::Float => "REAL",
                PropertyType::Bool => "BOOLEAN",
            };
            definitions.push(format!("{} {}", quote(name), sql_type));
        }
        conn.execute_batch(&format!(
            "CREATE TABLE {} ({});",
            quote(layer),
            definitions.join(", ")
        ))
        .with_context(|| format!("Failed to create feature table {:?}", layer))?;

        conn.execute(
            "INSERT INTO gpkg_contents (table_name, data_type, identifier, srs_id) VALUES (?1, 'features', ?1, ?2)",
            params![layer, SRS_ID],
        )?;
        conn.execute(
            "INSERT INTO gpkg_geometry_columns VALUES (?1, ?2, ?3, ?4, 0, 0)",
            params![layer, GEOMETRY_COLUMN, gpkg_type_name(geometry_type), SRS_ID],
        )?;

        let mut insert_columns = vec![quote(GEOMETRY_COLUMN)];
        insert_columns.extend(column_names.iter().map(|name| quote(name)));
        let placeholders = (1..=insert_columns.len())
            .map(|index| format!("?{index}"))
            .collect::<Vec<_>>()
            .join(", ");
        let insert_sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote(layer),
            insert_columns.join(", "),
            placeholders
        );

        conn.execute_batch("BEGIN")?;

        Ok(Self {
            conn: Some(conn),
            path,
            table: layer.to_string(),
            columns,
            insert_sql,
            extent: None,
            bytes: 0,
        })
    }

    fn encode(&mut self, geometry: &Value) -> Result<Vec<u8>> {
        let geometry = parse_geometry(geometry)?;
        let envelope = match geometry.bounding_rect() {
            Some(rect) => {
                let (min, max) = (rect.min(), rect.max());
                self.extent = Some(match self.extent {
                    Some([min_x, min_y, max_x, max_y]) => [
                        min_x.min(min.x),
                        min_y.min(min.y),
                        max_x.max(max.x),
                        max_y.max(max.y),
                    ],
                    None => [min.x, min.y, max.x, max.y],
                });
                vec![min.x, max.x, min.y, max.y]
            }
            None => Vec::new(),
        };
        geometry
            .to_gpkg_wkb(CoordDimensions::xy(), Some(SRS_ID), envelope)
            .context("Failed to convert geometry to GeoPackage WKB")
    }
}

impl DataSink for GpkgSink {
    fn add_feature(&mut self, feature: &Feature) -> Result<()> {
        let mut values = Vec::with_capacity(self.columns.len() + 1);
        values.push(match &feature.geometry {
            Some(geometry) => SqlValue::Blob(self.encode(geometry)?),
            None => SqlValue::Null,
        });
        for col in &self.columns {
            let value = feature.properties.get(&col.name);
            let value = match col.col_type {
                PropertyType::Str | PropertyType::Dict | PropertyType::List => {
                    coerce_string(value).map(SqlValue::Text)
                }
                PropertyType::Int => coerce_i64(value).map(SqlValue::Integer),
                PropertyType::Float => coerce_f64(value).map(SqlValue::Real),
                PropertyType::Bool => coerce_bool(value).map(|b| SqlValue::Integer(i64::from(b))),
            };
            values.push(value.unwrap_or(SqlValue::Null));
        }

        self.bytes += values
            .iter()
            .map(|value| match value {
                SqlValue::Blob(blob) => blob.len() as u64,
                SqlValue::Text(text) => text.len() as u64,
                SqlValue::Null => 0,
                _ => 8,
            })
            .sum::<u64>();

        let Some(conn) = self.conn.as_ref() else {
            anyhow::bail!("geopackage {:?} is already finished", self.path);
        };
        conn.prepare_cached(&self.insert_sql)?
            .execute(params_from_iter(values.iter()))?;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        let Some(conn) = self.conn.take() else {
            return Ok(());
        };
        if let Some([min_x, min_y, max_x, max_y]) = self.extent {
            conn.execute(
                "UPDATE gpkg_contents SET min_x = ?1, min_y = ?2, max_x = ?3, max_y = ?4 WHERE table_name = ?5",
                params![min_x, min_y, max_x, max_y, self.table],
            )?;
        }
        conn.execute_batch("COMMIT")?;
        conn.close().map_err(|(_, err)| err)?;
        self.bytes = std::fs::metadata(&self.path)?.len();
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.bytes
    }
}

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

fn gpkg_type_name(geometry_type: Option<&str>) -> String {
    geometry_type.unwrap_or("Geometry").to_uppercase()
}

/// SQLite column names are case-insensitive and `fid` / `geom` are taken, so
/// clashing property names get a numeric suffix.
fn column_names(columns: &[ColumnSpec]) -> Vec<String> {
    let mut taken = vec!["fid".to_string(), GEOMETRY_COLUMN.to_string()];
    columns
        .iter()
        .map(|col| {
            let mut name = col.name.clone();
            let mut suffix = 2;
            while taken.contains(&name.to_lowercase()) {
                name = format!("{}_{}", col.name, suffix);
                suffix += 1;
            }
            if name != col.name {
                tracing::warn!("Property {:?} is stored as column {:?}", col.name, name);
            }
            taken.push(name.to_lowercase());
            name
        })
        .collect()
}
