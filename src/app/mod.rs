use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::archive::ArchiveSource;
use crate::config::{RunConfig, canonical_geometry_type};
use crate::filter::{
    Bounds, FeatureFilter, FeaturePick, FilterConfigError, FilterSpec, GeometryTypeGate,
    PropertyNormalizer,
};
use crate::pipeline::{run_filter_pass, run_schema_pass};
use crate::schema::{GeometryTarget, SchemaModel};
use crate::sinks::{
    ColumnSpec, DataSink, GeoJsonSink, GeoJsonlSink, GeoParquetSink, GpkgSink, OutputSink,
};
use crate::stream::{NoopProgress, ProgressUpdater};
use crate::utils::{ProgressCounter, readable_size};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Extract features from a 7z archive, optionally filtered by a region
    Filter(FilterArgs),
    /// Scan a 7z archive and write the inferred schema as JSON
    InferSchema(InferSchemaArgs),
}

impl Command {
    pub fn common(&self) -> &CommonArgs {
        match self {
            Command::Filter(args) => &args.common,
            Command::InferSchema(args) => &args.common,
        }
    }
}

#[derive(Args)]
pub struct CommonArgs {
    /// Only keep features of this geometry type
    #[arg(short = 'g', long)]
    pub limit_to_geom_type: Option<String>,

    /// Do not let a type match its multi-part counterpart in --limit-to-geom-type
    #[arg(long)]
    pub strict_geom_type_check: bool,

    /// Run configuration file (YAML, JSON or TOML)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Default log level; RUST_LOG takes precedence
    #[arg(short, long, value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Disable the progress line
    #[arg(short, long)]
    pub quiet: bool,
}

#[derive(Args)]
pub struct FilterArgs {
    /// Input 7z archive, or the .001 volume of a split archive
    #[arg(short, long)]
    pub input: PathBuf,

    /// Output file (.geojson, .geojsonl, .parquet, .gpkg), or - for geojsonl on stdout
    #[arg(short, long)]
    pub output: PathBuf,

    /// Output format (auto-detected if omitted)
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,

    /// Schema file to use instead of running an inference pass
    #[arg(short, long)]
    pub schema: Option<PathBuf>,

    /// GeoJSON file holding the polygon to filter by
    #[arg(short, long)]
    pub filter_file: Option<PathBuf>,

    /// 0-based index of the polygon feature to pick from the filter file
    #[arg(long)]
    pub pick_filter_feature_id: Option<usize>,

    /// key=value property match picking the filter feature (repeatable)
    #[arg(long)]
    pub pick_filter_feature_kv: Vec<String>,

    /// Bounding box as min_lon,min_lat,max_lon,max_lat
    #[arg(short, long, allow_hyphen_values = true)]
    pub bounds: Option<String>,

    /// Keep intersecting geometries whole instead of clipping them
    #[arg(long)]
    pub no_clip: bool,

    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Args)]
pub struct InferSchemaArgs {
    /// Input 7z archive, or the .001 volume of a split archive
    #[arg(short, long)]
    pub input: PathBuf,

    /// Schema output path (default: <archive base>.schema.json)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum, Debug)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum OutputFormat {
    #[value(name = "geojson")]
    GeoJson,
    #[value(name = "geojsonl", alias = "geojsonseq")]
    GeoJsonl,
    #[value(name = "geoparquet", alias = "parquet")]
    GeoParquet,
    #[value(name = "gpkg", alias = "geopackage")]
    GeoPackage,
}

impl OutputFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?;
        match ext.to_lowercase().as_str() {
            "geojson" => Some(OutputFormat::GeoJson),
            "geojsonl" | "geojsonseq" | "ndjson" | "jsonl" => Some(OutputFormat::GeoJsonl),
            "parquet" | "geoparquet" => Some(OutputFormat::GeoParquet),
            "gpkg" => Some(OutputFormat::GeoPackage),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            OutputFormat::GeoJson => "geojson",
            OutputFormat::GeoJsonl => "geojsonl",
            OutputFormat::GeoParquet => "geoparquet",
            OutputFormat::GeoPackage => "gpkg",
        }
    }
}

/// Progress rendering for one pass, or nothing when running quiet.
enum PassProgress {
    Quiet(NoopProgress),
    Stderr(ProgressCounter),
}

impl PassProgress {
    fn new(quiet: bool, label: &'static str, total_bytes: u64) -> Self {
        if quiet {
            PassProgress::Quiet(NoopProgress)
        } else {
            PassProgress::Stderr(ProgressCounter::new(label, total_bytes, 10_000))
        }
    }

    fn updater(&self) -> &dyn ProgressUpdater {
        match self {
            PassProgress::Quiet(noop) => noop,
            PassProgress::Stderr(counter) => counter,
        }
    }

    fn finish(&self) {
        if let PassProgress::Stderr(counter) = self {
            counter.finish();
        }
    }
}

fn geometry_gate(common: &CommonArgs, config: &RunConfig) -> Result<Option<GeometryTypeGate>> {
    let Some(requested) = common
        .limit_to_geom_type
        .as_ref()
        .or(config.limit_to_geom_type.as_ref())
    else {
        return Ok(None);
    };
    let canonical = canonical_geometry_type(requested).map_err(|err| anyhow!("CLI: {err}"))?;
    let strict = common.strict_geom_type_check || config.strict_geom_type_check;
    tracing::info!("Limiting to geometry type {} (strict: {})", canonical, strict);
    Ok(Some(GeometryTypeGate::new(canonical, strict)))
}

/// Builds the spatial filter from flags and config. `None` means no spatial
/// filtering.
pub fn resolve_filter_spec(args: &FilterArgs, config: &RunConfig) -> Result<Option<FilterSpec>> {
    let bounds = args.bounds.as_ref().or(config.bounds.as_ref());
    let filter_file = args.filter_file.as_ref().or(config.filter_file.as_ref());

    match (bounds, filter_file) {
        (Some(_), Some(_)) => {
            Err(FilterConfigError::ConflictingFilters).context("CLI: Invalid spatial filter")
        }
        (Some(bounds), None) => {
            let bounds: Bounds = bounds.parse().context("CLI: Invalid --bounds")?;
            tracing::info!(
                "Filtering by bounds ({}, {}, {}, {})",
                bounds.min_lon,
                bounds.min_lat,
                bounds.max_lon,
                bounds.max_lat
            );
            Ok(Some(FilterSpec::from_bounds(&bounds)))
        }
        (None, Some(path)) => {
            let pick_kv = if args.pick_filter_feature_kv.is_empty() {
                &config.pick_filter_feature_kv
            } else {
                &args.pick_filter_feature_kv
            };
            let pick_id = args.pick_filter_feature_id.or(config.pick_filter_feature_id);
            let pick = FeaturePick::from_options(pick_id, pick_kv)
                .context("CLI: Invalid filter feature selection")?;
            tracing::info!("Filtering by shape from {:?}", path);
            let spec = FilterSpec::from_filter_file(path, &pick)
                .with_context(|| format!("CLI: Unusable filter file {:?}", path))?;
            Ok(Some(spec))
        }
        (None, None) => {
            tracing::info!("No spatial filter given, writing every feature");
            Ok(None)
        }
    }
}

/// Opens the writer for `format` at `output`. `layer` names the feature table
/// for formats that have one.
pub fn init_sink(
    format: &OutputFormat,
    output: &Path,
    layer: &str,
    schema: &SchemaModel,
) -> Result<Box<dyn DataSink>> {
    match format {
        OutputFormat::GeoJson => {
            tracing::info!("Sink: {} -> {:?}", format.label(), output);
            Ok(Box::new(GeoJsonSink::new(output)?))
        }
        OutputFormat::GeoJsonl => {
            if output == Path::new("-") {
                tracing::info!("Sink: {} -> stdout", format.label());
                Ok(Box::new(GeoJsonlSink::stdout()?))
            } else {
                tracing::info!("Sink: {} -> {:?}", format.label(), output);
                Ok(Box::new(GeoJsonlSink::new(output)?))
            }
        }
        OutputFormat::GeoParquet => {
            let columns = ColumnSpec::from_schema(schema);
            let geometry_types: Vec<String> = match schema.geometry_target() {
                GeometryTarget::Uniform(geom_type) => vec![geom_type],
                GeometryTarget::Mixed(types) => types.into_iter().collect(),
            };
            tracing::info!(
                "Sink: {} -> {:?} ({} columns)",
                format.label(),
                output,
                columns.len()
            );
            Ok(Box::new(GeoParquetSink::new(output, columns, &geometry_types)?))
        }
        OutputFormat::GeoPackage => {
            let columns = ColumnSpec::from_schema(schema);
            let geometry_type = match schema.geometry_target() {
                GeometryTarget::Uniform(geom_type) => Some(geom_type),
                GeometryTarget::Mixed(_) => None,
            };
            tracing::info!(
                "Sink: {} -> {:?} (layer {}, {} columns)",
                format.label(),
                output,
                layer,
                columns.len()
            );
            Ok(Box::new(GpkgSink::new(
                output,
                layer,
                columns,
                geometry_type.as_deref(),
            )?))
        }
    }
}

/// Feature table name: the output file name without its extension.
pub fn layer_name(output: &Path) -> String {
    output
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .filter(|stem| !stem.is_empty())
        .unwrap_or_else(|| "features".to_string())
}

/// Output staged next to its final path, moved into place on success.
enum Staged {
    Stdout,
    File {
        temp: tempfile::NamedTempFile,
        target: PathBuf,
    },
}

impl Staged {
    fn new(output: &Path, format: &OutputFormat) -> Result<Self> {
        if output == Path::new("-") {
            if *format != OutputFormat::GeoJsonl {
                anyhow::bail!("CLI: Only geojsonl output can be written to stdout");
            }
            return Ok(Staged::Stdout);
        }
        let dir = match output.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let temp = tempfile::Builder::new()
            .prefix(".geosieve-")
            .suffix(&format!(".{}", format.label()))
            .tempfile_in(dir)
            .with_context(|| format!("CLI: Failed to create temporary output in {:?}", dir))?;
        Ok(Staged::File {
            temp,
            target: output.to_path_buf(),
        })
    }

    fn path(&self) -> &Path {
        match self {
            Staged::Stdout => Path::new("-"),
            Staged::File { temp, .. } => temp.path(),
        }
    }

    fn persist(self) -> Result<()> {
        if let Staged::File { temp, target } = self {
            temp.persist(&target)
                .with_context(|| format!("Sink: Failed to move output into {:?}", target))?;
        }
        Ok(())
    }
}

pub fn run_filter(args: &FilterArgs) -> Result<()> {
    let start = Instant::now();
    let config = RunConfig::load(args.common.config.as_deref())?;

    let format = args
        .format
        .or_else(|| OutputFormat::from_path(&args.output))
        .context("CLI: Could not detect output format from extension; use --format")?;
    let gate = geometry_gate(&args.common, &config)?;
    let spec = resolve_filter_spec(args, &config)?;
    let clip = !(args.no_clip || config.no_clip);

    let mut source = ArchiveSource::open(&args.input, &config.entry_suffix, config.chunk_size)?;
    let total_bytes = source.entry().size;

    let schema = match &args.schema {
        Some(path) => {
            tracing::info!("Using schema from {:?}", path);
            SchemaModel::load(path)?
        }
        None => {
            let progress = PassProgress::new(args.common.quiet, "Inferring schema", total_bytes);
            let schema = run_schema_pass(&mut source, gate.clone(), progress.updater());
            progress.finish();
            schema?
        }
    };

    let staged = Staged::new(&args.output, &format)?;
    let layer = layer_name(&args.output);
    let sink = OutputSink::new(init_sink(&format, staged.path(), &layer, &schema)?, &schema);
    let normalizer = PropertyNormalizer::from_schema(&schema);
    let filter = match spec {
        Some(spec) => FeatureFilter::shape(spec, clip, gate, normalizer),
        None => FeatureFilter::pass_through(gate, normalizer),
    };

    let progress = PassProgress::new(args.common.quiet, "Filtering", total_bytes);
    let summary = run_filter_pass(&mut source, filter, sink, progress.updater());
    progress.finish();
    let summary = summary?;
    staged.persist()?;

    let elapsed = start.elapsed();
    tracing::info!(
        "Done! Written {} of {} features ({}) in {:.2}s",
        summary.written,
        summary.stats.count,
        readable_size(summary.output_size),
        elapsed.as_secs_f64()
    );
    Ok(())
}

/// `<dir>/<name>` with `.001` and then `.7z` stripped from the file name.
pub fn base_name(input: &Path) -> PathBuf {
    let name = input
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = name.strip_suffix(".001").unwrap_or(&name);
    let name = name.strip_suffix(".7z").unwrap_or(name);
    input.with_file_name(name)
}

pub fn default_schema_path(input: &Path) -> PathBuf {
    let base = base_name(input);
    let mut name = base.file_name().unwrap_or_default().to_os_string();
    name.push(".schema.json");
    base.with_file_name(name)
}

pub fn run_infer_schema(args: &InferSchemaArgs) -> Result<()> {
    let config = RunConfig::load(args.common.config.as_deref())?;
    let gate = geometry_gate(&args.common, &config)?;
    let output = args
        .output
        .clone()
        .unwrap_or_else(|| default_schema_path(&args.input));

    let mut source = ArchiveSource::open(&args.input, &config.entry_suffix, config.chunk_size)?;
    let progress = PassProgress::new(args.common.quiet, "Inferring schema", source.entry().size);
    let schema = run_schema_pass(&mut source, gate, progress.updater());
    progress.finish();
    let schema = schema?;

    schema.save(&output)?;
    tracing::info!("Schema written to {:?}", output);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_format_from_extension() {
        let cases = [
            ("out.geojson", Some(OutputFormat::GeoJson)),
            ("out.GeoJSONL", Some(OutputFormat::GeoJsonl)),
            ("out.geojsonseq", Some(OutputFormat::GeoJsonl)),
            ("out.ndjson", Some(OutputFormat::GeoJsonl)),
            ("out.jsonl", Some(OutputFormat::GeoJsonl)),
            ("out.parquet", Some(OutputFormat::GeoParquet)),
            ("out.geoparquet", Some(OutputFormat::GeoParquet)),
            ("out.GPKG", Some(OutputFormat::GeoPackage)),
            ("out.shp", None),
            ("out", None),
        ];
        for (path, expected) in cases {
            assert_eq!(OutputFormat::from_path(Path::new(path)), expected, "{path}");
        }
    }

    #[test]
    fn layer_is_named_after_output_file() {
        assert_eq!(layer_name(Path::new("/tmp/india_roads.gpkg")), "india_roads");
        assert_eq!(layer_name(Path::new("-")), "-");
        assert_eq!(layer_name(Path::new("/")), "features");
    }

    #[test]
    fn default_schema_path_strips_archive_suffixes() {
        assert_eq!(
            default_schema_path(Path::new("/data/india.7z")),
            PathBuf::from("/data/india.schema.json")
        );
        assert_eq!(
            default_schema_path(Path::new("/data/india.7z.001")),
            PathBuf::from("/data/india.schema.json")
        );
        assert_eq!(
            default_schema_path(Path::new("buildings.7z")),
            PathBuf::from("buildings.schema.json")
        );
    }

    #[test]
    fn parses_filter_subcommand() {
        let cli = Cli::try_parse_from([
            "geosieve",
            "filter",
            "-i",
            "in.7z",
            "-o",
            "out.parquet",
            "-b",
            "-10,-5,10,5",
            "--pick-filter-feature-kv",
            "a=1",
            "--pick-filter-feature-kv",
            "b=2",
            "-g",
            "polygon",
            "-q",
        ])
        .unwrap();
        let Command::Filter(args) = cli.command else {
            panic!("expected filter subcommand");
        };
        assert_eq!(args.bounds.as_deref(), Some("-10,-5,10,5"));
        assert_eq!(args.pick_filter_feature_kv, vec!["a=1", "b=2"]);
        assert!(args.common.quiet);
        assert_eq!(args.common.log_level, LogLevel::Info);
    }

    #[test]
    fn conflicting_filters_are_rejected() {
        let cli = Cli::try_parse_from([
            "geosieve", "filter", "-i", "in.7z", "-o", "out.geojson", "-b", "0,0,1,1", "-f",
            "shape.geojson",
        ])
        .unwrap();
        let Command::Filter(args) = cli.command else {
            panic!("expected filter subcommand");
        };
        let err = resolve_filter_spec(&args, &RunConfig::default()).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<FilterConfigError>(),
            Some(FilterConfigError::ConflictingFilters)
        ));
    }

    #[test]
    fn config_bounds_apply_when_flag_is_absent() {
        let cli = Cli::try_parse_from(["geosieve", "filter", "-i", "in.7z", "-o", "out.geojson"])
            .unwrap();
        let Command::Filter(args) = cli.command else {
            panic!("expected filter subcommand");
        };
        let config = RunConfig {
            bounds: Some("200,0,1,1".to_string()),
            ..RunConfig::default()
        };
        let err = resolve_filter_spec(&args, &config).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<FilterConfigError>(),
            Some(FilterConfigError::BoundsRange)
        ));
        assert!(resolve_filter_spec(&args, &RunConfig::default()).unwrap().is_none());
    }
}
