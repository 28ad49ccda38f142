//! CSV ingestion into raw records and export of the resampled table.

use std::io::{Read, Write};

use chrono::SecondsFormat;
use csv::StringRecord;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::PipelineConfig;
use crate::record::{EntityId, Fields, RawRecord, ResampledRecord, Value};
use crate::schema::{ColumnPolicy, ColumnSchema, SchemaError};

const MISSING_TOKENS: [&str; 6] = ["", "nan", "na", "n/a", "null", "none"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsvIngestReport {
    pub headers: Vec<String>,
    pub rows_read: u64,
    pub rows_missing_entity: u64,
    /// Non-empty measured cells that were not numbers; treated as missing.
    pub invalid_numeric_cells: u64,
    /// Header columns that carry no policy and are not read.
    pub ignored_columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CsvIngest {
    pub records: Vec<RawRecord>,
    pub report: CsvIngestReport,
}

#[derive(Debug, Error)]
pub enum CsvIngestError {
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/// Reads a headered CSV into raw records, typing each declared column by its policy.
///
/// The header must carry the entity column, the timestamp column, and every declared
/// value column; anything missing is reported together as
/// [`SchemaError::MissingColumns`] before any row is read.
pub fn read_raw_records<R: Read>(
    reader: R,
    config: &PipelineConfig,
    schema: &ColumnSchema,
) -> Result<CsvIngest, CsvIngestError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
    check_header(&headers, config, schema)?;

    let entity_idx = header_index(&headers, &config.entity_column);
    let timestamp_idx = header_index(&headers, &config.timestamp_column);
    let mut columns: Vec<(usize, &str, ColumnPolicy)> = Vec::new();
    let mut ignored_columns = Vec::new();
    for (idx, name) in headers.iter().enumerate() {
        if Some(idx) == entity_idx || Some(idx) == timestamp_idx {
            continue;
        }
        match schema.policy(name) {
            Some(policy) => columns.push((idx, name.as_str(), policy)),
            None => ignored_columns.push(name.clone()),
        }
    }

    let mut report = CsvIngestReport {
        headers: headers.clone(),
        ignored_columns,
        ..CsvIngestReport::default()
    };
    let mut records = Vec::new();

    for row in reader.records() {
        let row = row?;
        report.rows_read += 1;

        let Some(entity_id) = cell(&row, entity_idx).and_then(EntityId::parse) else {
            report.rows_missing_entity += 1;
            debug!(
                component = "table",
                event = "table.read.row_missing_entity",
                row = report.rows_read
            );
            continue;
        };
        let timestamp = cell(&row, timestamp_idx).unwrap_or_default().to_string();

        let mut fields = Fields::new();
        for (idx, name, policy) in &columns {
            let raw = cell(&row, Some(*idx));
            let value = match policy {
                ColumnPolicy::MeasuredNumeric => {
                    let parsed = parse_numeric(raw);
                    if parsed.is_none() && !is_missing(raw) {
                        report.invalid_numeric_cells += 1;
                    }
                    parsed.map(Value::Float)
                }
                ColumnPolicy::Static => parse_typed(raw),
                ColumnPolicy::Categorical => parse_label(raw),
            };
            fields.insert((*name).to_string(), value);
        }

        records.push(RawRecord {
            entity_id,
            timestamp,
            fields,
        });
    }

    info!(
        component = "table",
        event = "table.read.finish",
        rows_read = report.rows_read,
        rows_missing_entity = report.rows_missing_entity,
        invalid_numeric_cells = report.invalid_numeric_cells,
        ignored_columns = ?report.ignored_columns
    );

    Ok(CsvIngest { records, report })
}

/// Output header: entity column, timestamp column, then static, measured, and
/// categorical columns.
pub fn output_headers(schema: &ColumnSchema, timestamp_column: &str) -> Vec<String> {
    let mut headers = vec![
        schema.entity_column().to_string(),
        timestamp_column.to_string(),
    ];
    headers.extend(schema.output_columns().into_iter().map(str::to_string));
    headers
}

/// Text cells in [`output_headers`] order. Timestamps are RFC 3339 UTC with whole
/// seconds; missing static values are empty.
pub fn record_cells(record: &ResampledRecord, schema: &ColumnSchema) -> Vec<String> {
    let mut cells = vec![
        record.entity_id.to_string(),
        record
            .grid_timestamp
            .to_rfc3339_opts(SecondsFormat::Secs, true),
    ];
    cells.extend(
        schema
            .output_columns()
            .into_iter()
            .map(|column| record.value(column).map(Value::to_string).unwrap_or_default()),
    );
    cells
}

/// Writes the resampled table as CSV to a caller-owned writer.
pub fn write_resampled_csv<W: Write>(
    writer: W,
    records: &[ResampledRecord],
    schema: &ColumnSchema,
    timestamp_column: &str,
) -> Result<(), csv::Error> {
    let mut writer = csv::Writer::from_writer(writer);
    writer.write_record(output_headers(schema, timestamp_column))?;
    for record in records {
        writer.write_record(record_cells(record, schema))?;
    }
    writer.flush()?;
    Ok(())
}

/// One JSON object per record, keyed by output header. Values keep their types: integer
/// ids and static integers stay integers.
pub fn records_to_json(
    records: &[ResampledRecord],
    schema: &ColumnSchema,
    timestamp_column: &str,
) -> Vec<serde_json::Value> {
    records
        .iter()
        .map(|record| {
            let mut row = serde_json::Map::new();
            row.insert(
                schema.entity_column().to_string(),
                serde_json::to_value(&record.entity_id).unwrap_or(serde_json::Value::Null),
            );
            row.insert(
                timestamp_column.to_string(),
                serde_json::Value::String(
                    record
                        .grid_timestamp
                        .to_rfc3339_opts(SecondsFormat::Secs, true),
                ),
            );
            for column in schema.output_columns() {
                let value = record
                    .value(column)
                    .and_then(|value| serde_json::to_value(value).ok())
                    .unwrap_or(serde_json::Value::Null);
                row.insert(column.to_string(), value);
            }
            serde_json::Value::Object(row)
        })
        .collect()
}

fn check_header(
    headers: &[String],
    config: &PipelineConfig,
    schema: &ColumnSchema,
) -> Result<(), SchemaError> {
    let mut missing: Vec<String> = [&config.entity_column, &config.timestamp_column]
        .into_iter()
        .filter(|column| !headers.contains(*column))
        .cloned()
        .collect();
    if let Err(SchemaError::MissingColumns { columns }) =
        schema.check_present(headers.iter().map(String::as_str))
    {
        missing.extend(columns);
    }

    if missing.is_empty() {
        Ok(())
    } else {
        Err(SchemaError::MissingColumns { columns: missing })
    }
}

fn header_index(headers: &[String], column: &str) -> Option<usize> {
    headers.iter().position(|header| header == column)
}

fn cell(row: &StringRecord, idx: Option<usize>) -> Option<&str> {
    idx.and_then(|idx| row.get(idx))
}

fn is_missing(raw: Option<&str>) -> bool {
    match raw {
        None => true,
        Some(text) => MISSING_TOKENS.contains(&text.trim().to_ascii_lowercase().as_str()),
    }
}

fn parse_numeric(raw: Option<&str>) -> Option<f64> {
    if is_missing(raw) {
        return None;
    }
    raw?.trim()
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
}

fn parse_typed(raw: Option<&str>) -> Option<Value> {
    if is_missing(raw) {
        return None;
    }
    let text = raw?.trim();
    if let Ok(value) = text.parse::<i64>() {
        return Some(Value::Integer(value));
    }
    match text.parse::<f64>() {
        Ok(value) if value.is_finite() => Some(Value::Float(value)),
        _ => Some(Value::Text(text.to_string())),
    }
}

fn parse_label(raw: Option<&str>) -> Option<Value> {
    if is_missing(raw) {
        return None;
    }
    raw.map(|text| Value::Text(text.trim().to_string()))
}
