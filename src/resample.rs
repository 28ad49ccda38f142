//! Resampling and imputation engine.
//!
//! Each entity group is processed on its own (in parallel across groups):
//! 1. gap repair over the entity's raw timestamps (time-weighted linear interpolation,
//!    then forward-fill, then backward-fill; sentinel for categorical columns)
//! 2. grid construction from floor(first) to floor(last) at the configured step
//! 3. cell reduction (mean for measured, first value for categorical), with a second
//!    interpolation pass over the grid for cells that received no reading
//! 4. a no-null check on measured and categorical output
//!
//! The only cross-entity work is the global-median pre-pass used when an entity has no
//! reading at all in a measured column.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{Frequency, ImputationConfig, InsufficientDataPolicy};
use crate::record::{EntityGroup, EntityId, Fields, ResampledRecord, Value};
use crate::schema::{ColumnSchema, SchemaError};

const MAX_REPORTED_DROPPED_ENTITIES: usize = 256;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillCounts {
    /// Raw readings filled by interpolation between known neighbors.
    pub interpolated: u64,
    pub forward_filled: u64,
    pub backward_filled: u64,
    /// Raw readings filled from the cross-entity median.
    pub median_filled: u64,
    /// Raw categorical readings replaced by the sentinel label.
    pub sentinel_filled: u64,
    /// Empty grid cells filled by interpolation over the grid.
    pub grid_interpolated: u64,
    /// Empty grid cells given the categorical sentinel.
    pub grid_sentinel_filled: u64,
}

impl FillCounts {
    fn absorb(&mut self, other: &FillCounts) {
        self.interpolated += other.interpolated;
        self.forward_filled += other.forward_filled;
        self.backward_filled += other.backward_filled;
        self.median_filled += other.median_filled;
        self.sentinel_filled += other.sentinel_filled;
        self.grid_interpolated += other.grid_interpolated;
        self.grid_sentinel_filled += other.grid_sentinel_filled;
    }

    pub fn total(&self) -> u64 {
        self.interpolated
            + self.forward_filled
            + self.backward_filled
            + self.median_filled
            + self.sentinel_filled
            + self.grid_interpolated
            + self.grid_sentinel_filled
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResampleReport {
    pub frequency: Option<Frequency>,
    pub input_entities: u64,
    pub output_entities: u64,
    pub input_records: u64,
    pub output_records: u64,
    /// Grid cells that reduced more than one reading.
    pub merged_cells: u64,
    /// Later static readings that disagreed with the entity's first observed value.
    pub static_conflicts: u64,
    /// Measured readings that were present but not a finite number; treated as missing.
    pub non_numeric_readings: u64,
    pub entities_dropped: u64,
    pub dropped_entity_ids: Vec<EntityId>,
    pub fills: BTreeMap<String, FillCounts>,
    pub final_null_count: u64,
}

impl ResampleReport {
    pub fn fill_totals(&self) -> FillCounts {
        let mut totals = FillCounts::default();
        for counts in self.fills.values() {
            totals.absorb(counts);
        }
        totals
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResampleOutput {
    pub records: Vec<ResampledRecord>,
    pub report: ResampleReport,
}

#[derive(Debug, Error)]
pub enum ResampleError {
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),
    #[error("entity {entity_id} has no readings in measured column '{column}'")]
    InsufficientData { entity_id: EntityId, column: String },
    #[error("invalid grid timestamp: {0}")]
    InvalidTimestamp(i64),
    #[error("entity {entity_id} spans {cells} grid cells, limit is {limit}")]
    GridTooLarge {
        entity_id: EntityId,
        cells: u64,
        limit: u64,
    },
    #[error("column '{column}' is still null for entity {entity_id} at {grid_timestamp}")]
    NullsRemaining {
        entity_id: EntityId,
        column: String,
        grid_timestamp: DateTime<Utc>,
    },
}

/// Regularizes every entity group onto the `frequency` grid.
///
/// The schema is checked against the input before any row is processed: every declared
/// value column must appear in at least one record. An input with no records yields an
/// empty output.
pub fn resample(
    groups: &[EntityGroup],
    frequency: Frequency,
    schema: &ColumnSchema,
    cfg: &ImputationConfig,
) -> Result<ResampleOutput, ResampleError> {
    let input_records: usize = groups.iter().map(EntityGroup::len).sum();
    if input_records > 0 {
        let available: BTreeSet<&str> = groups
            .iter()
            .flat_map(|group| group.records())
            .flat_map(|record| record.fields.keys().map(String::as_str))
            .collect();
        schema.check_present(available)?;
    }

    info!(
        component = "resample",
        event = "resample.start",
        frequency = frequency.as_str(),
        entities = groups.len(),
        input_records,
        insufficient_data = ?cfg.insufficient_data,
        schema_fingerprint = schema.fingerprint()
    );

    let medians = match cfg.insufficient_data {
        InsufficientDataPolicy::GlobalMedian => global_medians(groups, schema),
        _ => BTreeMap::new(),
    };

    let outcomes = groups
        .par_iter()
        .filter(|group| !group.is_empty())
        .map(|group| resample_entity(group, frequency, schema, cfg, &medians))
        .collect::<Result<Vec<EntityOutcome>, ResampleError>>()?;

    let mut report = ResampleReport {
        frequency: Some(frequency),
        input_entities: groups.len() as u64,
        input_records: input_records as u64,
        ..ResampleReport::default()
    };
    for column in schema
        .measured_columns()
        .into_iter()
        .chain(schema.categorical_columns())
    {
        report
            .fills
            .insert(column.to_string(), FillCounts::default());
    }

    let mut records = Vec::new();
    for outcome in outcomes {
        match outcome {
            EntityOutcome::Dropped(entity_id) => {
                report.entities_dropped += 1;
                if report.dropped_entity_ids.len() < MAX_REPORTED_DROPPED_ENTITIES {
                    report.dropped_entity_ids.push(entity_id);
                }
            }
            EntityOutcome::Resampled(mut entity) => {
                report.output_entities += 1;
                report.merged_cells += entity.merged_cells;
                report.static_conflicts += entity.static_conflicts;
                report.non_numeric_readings += entity.non_numeric_readings;
                for (column, counts) in &entity.fills {
                    report.fills.entry(column.clone()).or_default().absorb(counts);
                }
                records.append(&mut entity.records);
            }
        }
    }

    report.output_records = records.len() as u64;
    report.final_null_count = count_nulls(&records, schema);

    let totals = report.fill_totals();
    info!(
        component = "resample",
        event = "resample.finish",
        frequency = frequency.as_str(),
        output_entities = report.output_entities,
        output_records = report.output_records,
        merged_cells = report.merged_cells,
        non_numeric_readings = report.non_numeric_readings,
        interpolated = totals.interpolated,
        forward_filled = totals.forward_filled,
        backward_filled = totals.backward_filled,
        median_filled = totals.median_filled,
        sentinel_filled = totals.sentinel_filled,
        grid_interpolated = totals.grid_interpolated,
        grid_sentinel_filled = totals.grid_sentinel_filled,
        entities_dropped = report.entities_dropped,
        final_null_count = report.final_null_count
    );

    Ok(ResampleOutput { records, report })
}

enum EntityOutcome {
    Resampled(EntityResample),
    Dropped(EntityId),
}

struct EntityResample {
    records: Vec<ResampledRecord>,
    fills: BTreeMap<String, FillCounts>,
    merged_cells: u64,
    static_conflicts: u64,
    non_numeric_readings: u64,
}

fn resample_entity(
    group: &EntityGroup,
    frequency: Frequency,
    schema: &ColumnSchema,
    cfg: &ImputationConfig,
    medians: &BTreeMap<String, f64>,
) -> Result<EntityOutcome, ResampleError> {
    let entity_id = group.entity_id();
    let source = group.records();
    let times: Vec<i64> = source
        .iter()
        .map(|record| record.timestamp.timestamp_millis())
        .collect();
    let (Some(&first_ts), Some(&last_ts)) = (times.first(), times.last()) else {
        return Ok(EntityOutcome::Resampled(EntityResample {
            records: Vec::new(),
            fills: BTreeMap::new(),
            merged_cells: 0,
            static_conflicts: 0,
            non_numeric_readings: 0,
        }));
    };

    // Sized from the time span alone, so bound it before anything is allocated.
    let step_ms = frequency.step_seconds() * 1_000;
    let grid_start = floor_to_step(first_ts, step_ms);
    let grid_end = floor_to_step(last_ts, step_ms);
    let span_cells = ((grid_end - grid_start) / step_ms + 1) as u64;
    if span_cells > cfg.max_grid_cells {
        warn!(
            component = "resample",
            event = "resample.entity.grid_too_large",
            entity_id = %entity_id,
            cells = span_cells,
            limit = cfg.max_grid_cells
        );
        return Err(ResampleError::GridTooLarge {
            entity_id: entity_id.clone(),
            cells: span_cells,
            limit: cfg.max_grid_cells,
        });
    }
    let cell_count = span_cells as usize;

    let measured = schema.measured_columns();
    let categorical = schema.categorical_columns();
    let mut fills: BTreeMap<String, FillCounts> = BTreeMap::new();
    let mut non_numeric_readings = 0u64;

    // Gap repair over the raw timeline.
    let mut measured_series: Vec<Vec<f64>> = Vec::with_capacity(measured.len());
    for column in &measured {
        let mut series: Vec<Option<f64>> = Vec::with_capacity(source.len());
        for record in source {
            let value = record.value(column);
            let reading = numeric_reading(value);
            if value.is_some() && reading.is_none() {
                non_numeric_readings += 1;
            }
            series.push(reading);
        }
        let counts = fills.entry(column.to_string()).or_default();

        if series.iter().all(Option::is_none) {
            match (cfg.insufficient_data, medians.get(*column)) {
                (InsufficientDataPolicy::GlobalMedian, Some(median)) => {
                    warn!(
                        component = "resample",
                        event = "resample.entity.insufficient_data",
                        entity_id = %entity_id,
                        column = *column,
                        resolution = "global_median",
                        median = *median
                    );
                    counts.median_filled += series.len() as u64;
                    series.iter_mut().for_each(|slot| *slot = Some(*median));
                }
                (InsufficientDataPolicy::DropEntity, _) => {
                    warn!(
                        component = "resample",
                        event = "resample.entity.insufficient_data",
                        entity_id = %entity_id,
                        column = *column,
                        resolution = "drop_entity"
                    );
                    return Ok(EntityOutcome::Dropped(entity_id.clone()));
                }
                _ => {
                    return Err(ResampleError::InsufficientData {
                        entity_id: entity_id.clone(),
                        column: column.to_string(),
                    });
                }
            }
        } else {
            let repaired = repair_series(&times, &mut series);
            counts.interpolated += repaired.interpolated;
            counts.forward_filled += repaired.forward_filled;
            counts.backward_filled += repaired.backward_filled;
        }

        measured_series.push(series.into_iter().flatten().collect());
    }

    let sentinel = Value::Text(cfg.categorical_fill.clone());
    let mut categorical_series: Vec<Vec<Value>> = Vec::with_capacity(categorical.len());
    for column in &categorical {
        let counts = fills.entry(column.to_string()).or_default();
        let series = source
            .iter()
            .map(|record| match record.value(column) {
                Some(value) => value.clone(),
                None => {
                    counts.sentinel_filled += 1;
                    sentinel.clone()
                }
            })
            .collect();
        categorical_series.push(series);
    }

    let mut static_conflicts = 0u64;
    let mut static_values: Vec<(&str, Option<Value>)> = Vec::new();
    for column in schema.static_columns() {
        let mut first: Option<&Value> = None;
        for value in source.iter().filter_map(|record| record.value(column)) {
            match first {
                None => first = Some(value),
                Some(existing) if existing != value => static_conflicts += 1,
                Some(_) => {}
            }
        }
        static_values.push((column, first.cloned()));
    }

    // Grid construction and cell assignment.
    let grid_times: Vec<i64> = (0..cell_count)
        .map(|idx| grid_start + idx as i64 * step_ms)
        .collect();

    let mut cells: Vec<Vec<usize>> = vec![Vec::new(); cell_count];
    for (idx, ts) in times.iter().enumerate() {
        let cell = ((floor_to_step(*ts, step_ms) - grid_start) / step_ms) as usize;
        cells[cell].push(idx);
    }
    let merged_cells = cells.iter().filter(|members| members.len() > 1).count() as u64;

    // Cell reduction, then interpolation over the grid for empty cells.
    let mut measured_cells: Vec<Vec<Option<f64>>> = Vec::with_capacity(measured.len());
    for (column, series) in measured.iter().zip(&measured_series) {
        let mut reduced: Vec<Option<f64>> = cells
            .iter()
            .map(|members| mean(members.iter().map(|idx| series[*idx])))
            .collect();
        let repaired = repair_series(&grid_times, &mut reduced);
        let counts = fills.entry(column.to_string()).or_default();
        counts.grid_interpolated += repaired.interpolated;
        counts.forward_filled += repaired.forward_filled;
        counts.backward_filled += repaired.backward_filled;
        measured_cells.push(reduced);
    }

    let mut categorical_cells: Vec<Vec<Value>> = Vec::with_capacity(categorical.len());
    for (column, series) in categorical.iter().zip(&categorical_series) {
        let counts = fills.entry(column.to_string()).or_default();
        let reduced = cells
            .iter()
            .map(|members| match members.first() {
                Some(idx) => series[*idx].clone(),
                None => {
                    counts.grid_sentinel_filled += 1;
                    sentinel.clone()
                }
            })
            .collect();
        categorical_cells.push(reduced);
    }

    let mut records = Vec::with_capacity(cell_count);
    for (cell, grid_ms) in grid_times.iter().enumerate() {
        let grid_timestamp = DateTime::from_timestamp_millis(*grid_ms)
            .ok_or(ResampleError::InvalidTimestamp(*grid_ms))?;
        let mut values = Fields::new();
        for (column, value) in &static_values {
            values.insert(column.to_string(), value.clone());
        }
        for (column, reduced) in measured.iter().zip(&measured_cells) {
            let Some(value) = reduced[cell] else {
                return Err(ResampleError::NullsRemaining {
                    entity_id: entity_id.clone(),
                    column: column.to_string(),
                    grid_timestamp,
                });
            };
            values.insert(column.to_string(), Some(Value::Float(value)));
        }
        for (column, reduced) in categorical.iter().zip(&categorical_cells) {
            values.insert(column.to_string(), Some(reduced[cell].clone()));
        }
        records.push(ResampledRecord {
            entity_id: entity_id.clone(),
            grid_timestamp,
            values,
        });
    }

    debug!(
        component = "resample",
        event = "resample.entity.finish",
        entity_id = %entity_id,
        input_records = source.len(),
        grid_cells = cell_count,
        merged_cells,
        static_conflicts,
        non_numeric_readings
    );

    Ok(EntityOutcome::Resampled(EntityResample {
        records,
        fills,
        merged_cells,
        static_conflicts,
        non_numeric_readings,
    }))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct RepairCounts {
    pub interpolated: u64,
    pub forward_filled: u64,
    pub backward_filled: u64,
}

/// Fills `values` in place along `times` (same length, ascending).
///
/// Gaps bracketed by two known readings get the time-weighted linear blend of those
/// readings. Trailing gaps are then forward-filled and leading gaps backward-filled. A
/// series with no known reading is left untouched.
pub(crate) fn repair_series(times: &[i64], values: &mut [Option<f64>]) -> RepairCounts {
    let mut counts = RepairCounts::default();
    let anchors: Vec<(usize, f64)> = values
        .iter()
        .enumerate()
        .filter_map(|(idx, value)| value.map(|v| (idx, v)))
        .collect();
    let (Some(&(first_idx, first_value)), Some(&(last_idx, last_value))) =
        (anchors.first(), anchors.last())
    else {
        return counts;
    };

    for pair in anchors.windows(2) {
        let (prev_idx, prev_value) = pair[0];
        let (next_idx, next_value) = pair[1];
        let (t0, t1) = (times[prev_idx], times[next_idx]);
        for idx in prev_idx + 1..next_idx {
            let blended = if t1 == t0 {
                (prev_value + next_value) / 2.0
            } else {
                let weight = (times[idx] - t0) as f64 / (t1 - t0) as f64;
                prev_value + (next_value - prev_value) * weight
            };
            values[idx] = Some(blended);
            counts.interpolated += 1;
        }
    }

    for slot in values.iter_mut().skip(last_idx + 1) {
        *slot = Some(last_value);
        counts.forward_filled += 1;
    }

    for slot in values.iter_mut().take(first_idx) {
        *slot = Some(first_value);
        counts.backward_filled += 1;
    }

    counts
}

fn numeric_reading(value: Option<&Value>) -> Option<f64> {
    value
        .and_then(Value::as_f64)
        .filter(|reading| reading.is_finite())
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let mut sum = 0.0;
    let mut count = 0usize;
    for value in values {
        sum += value;
        count += 1;
    }
    if count == 0 {
        None
    } else {
        Some(sum / count as f64)
    }
}

fn floor_to_step(ts_ms: i64, step_ms: i64) -> i64 {
    ts_ms - ts_ms.rem_euclid(step_ms)
}

fn global_medians(groups: &[EntityGroup], schema: &ColumnSchema) -> BTreeMap<String, f64> {
    let mut out = BTreeMap::new();
    for column in schema.measured_columns() {
        let mut readings: Vec<f64> = groups
            .iter()
            .flat_map(|group| group.records())
            .filter_map(|record| numeric_reading(record.value(column)))
            .collect();
        if let Some(median) = median(&mut readings) {
            out.insert(column.to_string(), median);
        }
    }
    out
}

fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}

fn count_nulls(records: &[ResampledRecord], schema: &ColumnSchema) -> u64 {
    let required: Vec<&str> = schema
        .measured_columns()
        .into_iter()
        .chain(schema.categorical_columns())
        .collect();
    records
        .iter()
        .map(|record| {
            required
                .iter()
                .filter(|column| record.value(column).is_none())
                .count() as u64
        })
        .sum()
}
