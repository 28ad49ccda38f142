//! HTTP routes that run the preprocessing pipeline on uploaded CSV.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use crate::anomaly::{flag_zscore_anomalies, AnomalyFlag};
use crate::config::PipelineConfig;
use crate::pipeline::{
    preprocess_csv, PipelineDiagnostics, PipelineError, PipelineOutput, PipelineSummary,
};
use crate::resample::ResampleError;
use crate::schema::{ColumnSchema, SchemaError};
use crate::table::{
    output_headers, records_to_json, write_resampled_csv, CsvIngestError, CsvIngestReport,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreprocessQuery {
    /// When set, rows whose |z| exceeds this value are returned as anomalies.
    pub zscore_threshold: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocessResponse {
    pub summary: PipelineSummary,
    pub diagnostics: PipelineDiagnostics,
    pub ingest: CsvIngestReport,
    pub columns: Vec<String>,
    pub rows: Vec<serde_json::Value>,
    pub anomalies: Vec<AnomalyFlag>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfigView {
    pub config: PipelineConfig,
    pub schema_fingerprint: String,
    pub columns: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("CSV export failed: {0}")]
    Export(#[from] csv::Error),
    #[error("pipeline worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Pipeline(PipelineError::Schema(_))
            | Self::Pipeline(PipelineError::Csv(CsvIngestError::Schema(_)))
            | Self::Pipeline(PipelineError::Resample(ResampleError::Schema(_)))
            | Self::Pipeline(PipelineError::Resample(ResampleError::InsufficientData { .. }))
            | Self::Pipeline(PipelineError::Resample(ResampleError::GridTooLarge { .. })) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Self::Pipeline(PipelineError::Csv(CsvIngestError::Csv(_))) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self.status() {
            StatusCode::UNPROCESSABLE_ENTITY => "unprocessable",
            StatusCode::BAD_REQUEST => "csv",
            _ => "internal",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = json!({ "error": self.kind(), "message": self.to_string() });
        (status, Json(body)).into_response()
    }
}

#[derive(Clone)]
struct PreprocessAppState {
    config: Arc<PipelineConfig>,
    schema: Arc<ColumnSchema>,
}

/// Builds the router. The schema is validated once here so a bad configuration fails at
/// startup rather than on the first request.
pub fn preprocess_router(config: PipelineConfig) -> Result<Router, SchemaError> {
    let schema = ColumnSchema::from_config(&config)?;
    Ok(Router::new()
        .route("/pipeline/config", get(get_pipeline_config))
        .route("/pipeline/preprocess", post(post_preprocess))
        .route("/pipeline/preprocess.csv", post(post_preprocess_csv))
        .with_state(PreprocessAppState {
            config: Arc::new(config),
            schema: Arc::new(schema),
        }))
}

async fn get_pipeline_config(State(state): State<PreprocessAppState>) -> impl IntoResponse {
    Json(PipelineConfigView {
        config: (*state.config).clone(),
        schema_fingerprint: state.schema.fingerprint().to_string(),
        columns: output_headers(&state.schema, &state.config.timestamp_column),
    })
}

async fn post_preprocess(
    State(state): State<PreprocessAppState>,
    Query(query): Query<PreprocessQuery>,
    body: Bytes,
) -> Result<Json<PreprocessResponse>, ApiError> {
    let route = "/pipeline/preprocess";
    let (output, ingest) = match run_blocking(&state, body).await {
        Ok(done) => done,
        Err(err) => return Err(log_failure(route, err)),
    };

    let anomalies = query
        .zscore_threshold
        .map(|threshold| flag_zscore_anomalies(&output.records, &state.schema, threshold))
        .unwrap_or_default();
    let timestamp_column = &state.config.timestamp_column;

    info!(
        component = "preprocess_server",
        event = "http.preprocess.request",
        route,
        status = StatusCode::OK.as_u16(),
        rows = output.records.len(),
        anomalies = anomalies.len()
    );

    Ok(Json(PreprocessResponse {
        columns: output_headers(&state.schema, timestamp_column),
        rows: records_to_json(&output.records, &state.schema, timestamp_column),
        summary: output.summary,
        diagnostics: output.diagnostics,
        ingest,
        anomalies,
    }))
}

async fn post_preprocess_csv(
    State(state): State<PreprocessAppState>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let route = "/pipeline/preprocess.csv";
    let (output, _) = match run_blocking(&state, body).await {
        Ok(done) => done,
        Err(err) => return Err(log_failure(route, err)),
    };

    let mut csv_body = Vec::new();
    if let Err(err) = write_resampled_csv(
        &mut csv_body,
        &output.records,
        &state.schema,
        &state.config.timestamp_column,
    ) {
        return Err(log_failure(route, err.into()));
    }

    info!(
        component = "preprocess_server",
        event = "http.preprocess.request",
        route,
        status = StatusCode::OK.as_u16(),
        rows = output.records.len()
    );

    Ok(([(header::CONTENT_TYPE, "text/csv; charset=utf-8")], csv_body).into_response())
}

async fn run_blocking(
    state: &PreprocessAppState,
    body: Bytes,
) -> Result<(PipelineOutput, CsvIngestReport), ApiError> {
    let config = Arc::clone(&state.config);
    let schema = Arc::clone(&state.schema);
    let result =
        tokio::task::spawn_blocking(move || preprocess_csv(body.as_ref(), &config, &schema))
            .await?;
    Ok(result?)
}

fn log_failure(route: &'static str, err: ApiError) -> ApiError {
    warn!(
        component = "preprocess_server",
        event = "http.preprocess.request",
        route,
        status = err.status().as_u16(),
        error = %err
    );
    err
}
