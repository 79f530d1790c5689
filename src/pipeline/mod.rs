use anyhow::{Context, Result};
use std::time::Instant;

use crate::filter::{FeatureFilter, GeometryTypeGate, PropertyNormalizer, RunStats};
use crate::schema::{SchemaCollector, SchemaModel};
use crate::sinks::{Feature, OutputSink};
use crate::stream::{ChunkSink, LineHandler, LineReassembler, ProgressUpdater};

/// Receives accepted features at the end of a pass.
pub trait FeatureSink {
    fn write(&mut self, feature: Feature) -> Result<()>;
    fn size(&self) -> u64;
}

impl<S: FeatureSink + ?Sized> FeatureSink for &mut S {
    fn write(&mut self, feature: Feature) -> Result<()> {
        (**self).write(feature)
    }

    fn size(&self) -> u64 {
        (**self).size()
    }
}

/// Something that pushes the bytes of one logical input into a [`ChunkSink`],
/// calling `close` exactly once when the input is exhausted.
pub trait ChunkSource {
    fn pump(&mut self, sink: &mut dyn ChunkSink) -> Result<()>;
}

/// Line handler connecting a filter strategy to a feature sink.
pub struct FeatureStage<'p, S> {
    filter: FeatureFilter,
    sink: S,
    progress: &'p dyn ProgressUpdater,
}

impl<'p, S: FeatureSink> FeatureStage<'p, S> {
    pub fn new(filter: FeatureFilter, sink: S, progress: &'p dyn ProgressUpdater) -> Self {
        Self {
            filter,
            sink,
            progress,
        }
    }

    pub fn stats(&self) -> RunStats {
        self.filter.stats()
    }

    pub fn into_sink(self) -> S {
        self.sink
    }
}

impl<S: FeatureSink> LineHandler for FeatureStage<'_, S> {
    fn handle_line(&mut self, line: &[u8]) -> Result<()> {
        if let Some(feature) = self.filter.process(line) {
            self.sink.write(feature)?;
        }
        let stats = self.filter.stats();
        self.progress
            .on_counters(stats.count, stats.passed, self.sink.size());
        Ok(())
    }
}

/// One full pass over the input: source -> line adapter -> filter -> sink.
pub fn run_pass<S: FeatureSink>(
    label: &str,
    source: &mut dyn ChunkSource,
    filter: FeatureFilter,
    sink: S,
    progress: &dyn ProgressUpdater,
) -> Result<(RunStats, S)> {
    let start = Instant::now();
    let stage = FeatureStage::new(filter, sink, progress);
    let mut adapter = LineReassembler::new(stage, progress);
    source.pump(&mut adapter)?;

    let consumed = adapter.bytes_consumed();
    let stage = adapter.into_handler();
    let stats = stage.stats();
    tracing::info!(
        "{}: {} lines ({} bytes) in {:.2}s, passed: {}, unparsed: {}, errors: {}",
        label,
        stats.count,
        consumed,
        start.elapsed().as_secs_f64(),
        stats.passed,
        stats.unparsed,
        stats.error_count
    );
    Ok((stats, stage.into_sink()))
}

/// Observes every decodable feature (no spatial filter) and returns the
/// unified schema. Fails when the input holds no geometry at all.
pub fn run_schema_pass(
    source: &mut dyn ChunkSource,
    gate: Option<GeometryTypeGate>,
    progress: &dyn ProgressUpdater,
) -> Result<SchemaModel> {
    let filter = FeatureFilter::pass_through(gate, PropertyNormalizer::default());
    let (_, collector) = run_pass("Schema pass", source, filter, SchemaCollector::new(), progress)?;
    let schema = collector.finish()?;
    tracing::info!(
        "Schema: {} geometry types, {} properties, {} renames",
        schema.geometry.len(),
        schema.properties.len(),
        schema.renames.len()
    );
    Ok(schema)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteSummary {
    pub stats: RunStats,
    pub written: u64,
    pub dropped: u64,
    pub output_size: u64,
}

/// Filters the input into `sink`. The sink is closed whether or not the pass
/// succeeds.
pub fn run_filter_pass(
    source: &mut dyn ChunkSource,
    filter: FeatureFilter,
    mut sink: OutputSink,
    progress: &dyn ProgressUpdater,
) -> Result<WriteSummary> {
    let outcome = run_pass("Filter pass", source, filter, &mut sink, progress).map(|(stats, _)| stats);
    let closed = sink.close();
    let stats = outcome?;
    closed.context("Sink: Failed to finalize output")?;

    let summary = WriteSummary {
        stats,
        written: sink.written(),
        dropped: sink.dropped(),
        output_size: sink.size(),
    };
    if summary.dropped > 0 {
        tracing::warn!(
            "{} features were dropped for incompatible or undecodable geometry",
            summary.dropped
        );
    }
    Ok(summary)
}
