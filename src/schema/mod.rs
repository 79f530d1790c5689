use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use crate::geometry::multi_counterpart;

pub mod infer;

pub use self::infer::SchemaCollector;

/// Output type of a property column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropertyType {
    #[serde(rename = "str", alias = "string")]
    Str,
    #[serde(rename = "int", alias = "integer", alias = "int64")]
    Int,
    #[serde(rename = "float", alias = "double", alias = "float64")]
    Float,
    #[serde(rename = "bool", alias = "boolean")]
    Bool,
    #[serde(rename = "dict", alias = "object")]
    Dict,
    #[serde(rename = "list", alias = "array")]
    List,
}

/// Runtime type of a single JSON property value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ValueKind {
    Null,
    Bool,
    Int,
    Float,
    Str,
    Dict,
    List,
}

impl ValueKind {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::Number(n) if n.is_i64() || n.is_u64() => ValueKind::Int,
            Value::Number(_) => ValueKind::Float,
            Value::String(_) => ValueKind::Str,
            Value::Object(_) => ValueKind::Dict,
            Value::Array(_) => ValueKind::List,
        }
    }

    /// Column type for a property observed with only this kind.
    pub fn as_property_type(self) -> PropertyType {
        match self {
            ValueKind::Null | ValueKind::Str => PropertyType::Str,
            ValueKind::Bool => PropertyType::Bool,
            ValueKind::Int => PropertyType::Int,
            ValueKind::Float => PropertyType::Float,
            ValueKind::Dict => PropertyType::Dict,
            ValueKind::List => PropertyType::List,
        }
    }
}

/// Geometry type the sink must emit, derived from the declared type set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeometryTarget {
    Uniform(String),
    Mixed(BTreeSet<String>),
}

impl GeometryTarget {
    pub fn accepts(&self, geom_type: &str) -> bool {
        match self {
            GeometryTarget::Uniform(target) => target == geom_type,
            GeometryTarget::Mixed(types) => types.contains(geom_type),
        }
    }
}

/// Geometry type set, property types and renames every emitted feature
/// conforms to. Serialized as the schema file format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaModel {
    #[serde(deserialize_with = "one_or_many")]
    pub geometry: BTreeSet<String>,
    #[serde(default)]
    pub properties: IndexMap<String, PropertyType>,
    #[serde(
        default,
        rename = "property_renames",
        skip_serializing_if = "IndexMap::is_empty"
    )]
    pub renames: IndexMap<String, String>,
}

impl SchemaModel {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Schema: Failed to open schema file {:?}", path))?;
        serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Schema: Failed to parse schema file {:?}", path))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path)
            .with_context(|| format!("Schema: Failed to create schema file {:?}", path))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writeln!(writer)?;
        writer.flush()?;
        Ok(())
    }

    /// `{T}` stays `T`, `{T, MultiT}` widens to `MultiT`, anything else is mixed.
    pub fn geometry_target(&self) -> GeometryTarget {
        let types: Vec<&str> = self.geometry.iter().map(String::as_str).collect();
        match types.as_slice() {
            [single] => GeometryTarget::Uniform(single.to_string()),
            [a, b] if multi_counterpart(a) == Some(*b) => GeometryTarget::Uniform(b.to_string()),
            [a, b] if multi_counterpart(b) == Some(*a) => GeometryTarget::Uniform(a.to_string()),
            _ => GeometryTarget::Mixed(self.geometry.clone()),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

fn one_or_many<'de, D>(deserializer: D) -> Result<BTreeSet<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(value) => BTreeSet::from([value]),
        OneOrMany::Many(values) => values.into_iter().collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::NamedTempFile;

    #[test]
    fn value_kinds() {
        assert_eq!(ValueKind::of(&json!(1)), ValueKind::Int);
        assert_eq!(ValueKind::of(&json!(2.2)), ValueKind::Float);
        assert_eq!(ValueKind::of(&json!(1.0)), ValueKind::Float);
        assert_eq!(ValueKind::of(&json!(null)), ValueKind::Null);
        assert_eq!(ValueKind::of(&json!("x")), ValueKind::Str);
        assert_eq!(ValueKind::of(&json!({"a": 1})), ValueKind::Dict);
        assert_eq!(ValueKind::of(&json!([1])), ValueKind::List);
    }

    #[test]
    fn loads_single_geometry_string() {
        let schema: SchemaModel = serde_json::from_value(json!({
            "geometry": "Polygon",
            "properties": {"name": "str", "pop": "integer"}
        }))
        .unwrap();
        assert_eq!(schema.geometry, BTreeSet::from(["Polygon".to_string()]));
        assert_eq!(schema.properties["pop"], PropertyType::Int);
        assert!(schema.renames.is_empty());
    }

    #[test]
    fn writes_sorted_geometry_array_and_renames() {
        let mut schema = SchemaModel {
            geometry: BTreeSet::from(["Polygon".to_string(), "MultiPolygon".to_string()]),
            properties: IndexMap::new(),
            renames: IndexMap::new(),
        };
        schema.properties.insert("zeta".to_string(), PropertyType::Str);
        schema.properties.insert("alpha".to_string(), PropertyType::Float);

        let value = serde_json::to_value(&schema).unwrap();
        assert_eq!(value["geometry"], json!(["MultiPolygon", "Polygon"]));
        assert!(value.get("property_renames").is_none());
        let keys: Vec<&String> = value["properties"].as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["zeta", "alpha"]);

        schema.renames.insert("Name".to_string(), "Name_2".to_string());
        let value = serde_json::to_value(&schema).unwrap();
        assert_eq!(value["property_renames"], json!({"Name": "Name_2"}));
    }

    #[test]
    fn save_then_load() {
        let file = NamedTempFile::with_suffix(".schema.json").unwrap();
        let mut schema = SchemaModel {
            geometry: BTreeSet::from(["Point".to_string()]),
            properties: IndexMap::new(),
            renames: IndexMap::new(),
        };
        schema.properties.insert("name".to_string(), PropertyType::Str);
        schema.renames.insert("NAME".to_string(), "NAME_2".to_string());
        schema.save(file.path()).unwrap();

        assert_eq!(SchemaModel::load(file.path()).unwrap(), schema);
    }

    #[test]
    fn geometry_target_consolidation() {
        let schema = |types: &[&str]| SchemaModel {
            geometry: types.iter().map(|t| t.to_string()).collect(),
            properties: IndexMap::new(),
            renames: IndexMap::new(),
        };
        assert_eq!(
            schema(&["Polygon"]).geometry_target(),
            GeometryTarget::Uniform("Polygon".to_string())
        );
        assert_eq!(
            schema(&["Polygon", "MultiPolygon"]).geometry_target(),
            GeometryTarget::Uniform("MultiPolygon".to_string())
        );
        assert!(matches!(
            schema(&["Point", "Polygon"]).geometry_target(),
            GeometryTarget::Mixed(_)
        ));
    }
}
