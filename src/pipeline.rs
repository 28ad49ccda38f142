//! End-to-end preprocessing run: schema check, normalize, group, resample.

use std::collections::BTreeSet;
use std::io::Read;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info};

use crate::config::PipelineConfig;
use crate::normalize::{group_by_entity, normalize, NormalizeReport, TimestampParser};
use crate::record::{RawRecord, ResampledRecord};
use crate::resample::{resample, ResampleError, ResampleReport};
use crate::schema::{ColumnSchema, SchemaError};
use crate::table::{read_raw_records, CsvIngestError, CsvIngestReport};

pub const INTERPOLATION_METHOD: &str = "linear (time-weighted)";

/// Headline facts for display next to the cleaned table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineSummary {
    pub total_records: u64,
    pub users_found: u64,
    pub timestamp_format: String,
    pub timezone: String,
    pub resampling_frequency: String,
    pub interpolation_method: String,
    pub final_row_count: u64,
    pub schema_fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineDiagnostics {
    pub normalize: NormalizeReport,
    pub resample: ResampleReport,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOutput {
    pub records: Vec<ResampledRecord>,
    pub summary: PipelineSummary,
    pub diagnostics: PipelineDiagnostics,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Csv(#[from] CsvIngestError),
    #[error(transparent)]
    Resample(#[from] ResampleError),
}

/// Runs the whole pipeline with a schema built from `config`.
pub fn run_pipeline(
    raw: Vec<RawRecord>,
    config: &PipelineConfig,
) -> Result<PipelineOutput, PipelineError> {
    let schema = ColumnSchema::from_config(config)?;
    run_pipeline_with_schema(raw, config, &schema)
}

/// Runs the whole pipeline with a schema validated ahead of time, so the same schema can be
/// reused across runs. Declared columns are checked against the input before any row is
/// transformed.
pub fn run_pipeline_with_schema(
    raw: Vec<RawRecord>,
    config: &PipelineConfig,
    schema: &ColumnSchema,
) -> Result<PipelineOutput, PipelineError> {
    if !raw.is_empty() {
        let available: BTreeSet<&str> = raw
            .iter()
            .flat_map(|record| record.fields.keys().map(String::as_str))
            .collect();
        if let Err(err) = schema.check_present(available) {
            error!(
                component = "pipeline",
                event = "pipeline.run.schema_error",
                error = %err
            );
            return Err(err.into());
        }
    }

    let total_records = raw.len() as u64;
    let users_found = raw
        .iter()
        .map(|record| &record.entity_id)
        .collect::<BTreeSet<_>>()
        .len() as u64;

    let parser = TimestampParser::new(config.date_format, config.timezone);
    let normalized = normalize(raw, &parser);
    let groups = group_by_entity(normalized.records);
    let resampled = resample(&groups, config.frequency, schema, &config.imputation())?;

    let summary = PipelineSummary {
        total_records,
        users_found,
        timestamp_format: config.date_format.as_str().to_string(),
        timezone: config.timezone.name().to_string(),
        resampling_frequency: config.frequency.as_str().to_string(),
        interpolation_method: INTERPOLATION_METHOD.to_string(),
        final_row_count: resampled.records.len() as u64,
        schema_fingerprint: schema.fingerprint().to_string(),
    };

    info!(
        component = "pipeline",
        event = "pipeline.run.finish",
        total_records = summary.total_records,
        users_found = summary.users_found,
        dropped_unparsable_timestamps = normalized.report.dropped_unparsable_timestamps,
        final_row_count = summary.final_row_count,
        final_null_count = resampled.report.final_null_count
    );

    Ok(PipelineOutput {
        records: resampled.records,
        summary,
        diagnostics: PipelineDiagnostics {
            normalize: normalized.report,
            resample: resampled.report,
        },
    })
}

/// Reads CSV from `reader` and runs the pipeline on it.
pub fn preprocess_csv<R: Read>(
    reader: R,
    config: &PipelineConfig,
    schema: &ColumnSchema,
) -> Result<(PipelineOutput, CsvIngestReport), PipelineError> {
    let ingest = read_raw_records(reader, config, schema)?;
    let output = run_pipeline_with_schema(ingest.records, config, schema)?;
    Ok((output, ingest.report))
}
