//! FitPulse preprocessing core.
//!
//! Turns irregular per-user wearable logs into a regular, gap-free time series:
//! - timestamp normalization to UTC and per-user grouping
//! - column policies checked before any row is transformed
//! - grid resampling with time-weighted interpolation and edge fills
//! - CSV ingestion/export, z-score flags, and an HTTP front end

mod anomaly;
mod config;
mod normalize;
mod observability;
mod pipeline;
mod record;
mod resample;
mod schema;
mod server;
mod table;

pub use anomaly::{flag_zscore_anomalies, AnomalyFlag, DEFAULT_ZSCORE_THRESHOLD};
pub use config::{
    parse_date_format, parse_frequency, pipeline_config_from_env, DateFormat, Frequency,
    ImputationConfig, InsufficientDataPolicy, PipelineConfig, DEFAULT_CATEGORICAL_FILL,
    DEFAULT_MAX_GRID_CELLS,
};
pub use normalize::{
    group_by_entity, normalize, NormalizeOutput, NormalizeReport, TimestampParser,
};
pub use observability::{
    init_logging, log_app_bind, log_app_start, log_pipeline_config, logging_config_from_env,
    LogFormat, LoggingConfig, LoggingInitError,
};
pub use pipeline::{
    preprocess_csv, run_pipeline, run_pipeline_with_schema, PipelineDiagnostics, PipelineError,
    PipelineOutput, PipelineSummary, INTERPOLATION_METHOD,
};
pub use record::{
    EntityGroup, EntityId, Fields, NormalizedRecord, RawRecord, ResampledRecord, Value,
};
pub use resample::{resample, FillCounts, ResampleError, ResampleOutput, ResampleReport};
pub use schema::{ColumnPolicy, ColumnSchema, ColumnSpec, SchemaError};
pub use server::{
    preprocess_router, ApiError, PipelineConfigView, PreprocessQuery, PreprocessResponse,
};
pub use table::{
    output_headers, read_raw_records, record_cells, records_to_json, write_resampled_csv,
    CsvIngest, CsvIngestError, CsvIngestReport,
};
