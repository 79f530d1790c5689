use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::archive::{DEFAULT_CHUNK_SIZE, DEFAULT_ENTRY_SUFFIX};
use crate::geometry::GEOMETRY_TYPES;

/// Defaults for a run, read from an optional config file and `GEOSIEVE_*`
/// environment variables. Command-line flags are merged on top.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RunConfig {
    pub bounds: Option<String>,
    pub filter_file: Option<PathBuf>,
    pub pick_filter_feature_id: Option<usize>,
    pub pick_filter_feature_kv: Vec<String>,
    pub limit_to_geom_type: Option<String>,
    pub strict_geom_type_check: bool,
    pub no_clip: bool,
    pub chunk_size: usize,
    pub entry_suffix: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            bounds: None,
            filter_file: None,
            pick_filter_feature_id: None,
            pick_filter_feature_kv: Vec::new(),
            limit_to_geom_type: None,
            strict_geom_type_check: false,
            no_clip: false,
            chunk_size: DEFAULT_CHUNK_SIZE,
            entry_suffix: DEFAULT_ENTRY_SUFFIX.to_string(),
        }
    }
}

impl RunConfig {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            if !path.is_file() {
                anyhow::bail!("CLI: Config file not found: {:?}", path);
            }
            builder = builder.add_source(::config::File::from(path));
        }
        let settings = builder
            .add_source(
                ::config::Environment::with_prefix("GEOSIEVE")
                    .try_parsing(true)
                    .list_separator(";")
                    .with_list_parse_key("pick_filter_feature_kv"),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}

/// Accepts any casing of a GeoJSON geometry type name and returns the
/// canonical spelling.
pub fn canonical_geometry_type(value: &str) -> Result<&'static str, String> {
    GEOMETRY_TYPES
        .iter()
        .find(|name| name.eq_ignore_ascii_case(value.trim()))
        .copied()
        .ok_or_else(|| {
            format!(
                "invalid geometry type: {value} (expected one of {})",
                GEOMETRY_TYPES.join(", ")
            )
        })
}
