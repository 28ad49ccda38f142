//! Z-score outlier flags over the resampled series.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::record::{EntityId, ResampledRecord, Value};
use crate::schema::ColumnSchema;

pub const DEFAULT_ZSCORE_THRESHOLD: f64 = 3.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyFlag {
    pub entity_id: EntityId,
    pub grid_timestamp: DateTime<Utc>,
    pub column: String,
    pub value: f64,
    pub z_score: f64,
}

/// Flags measured readings whose |z| exceeds `threshold`, scored per entity and column
/// against the population mean and standard deviation. Series with zero spread produce
/// no flags. Flags come out by entity, then timestamp, then column declaration order.
pub fn flag_zscore_anomalies(
    records: &[ResampledRecord],
    schema: &ColumnSchema,
    threshold: f64,
) -> Vec<AnomalyFlag> {
    let measured = schema.measured_columns();
    let mut by_entity: BTreeMap<&EntityId, Vec<&ResampledRecord>> = BTreeMap::new();
    for record in records {
        by_entity.entry(&record.entity_id).or_default().push(record);
    }

    let mut flags = Vec::new();
    for (entity_id, rows) in by_entity {
        let mut entity_flags = Vec::new();
        for (column_idx, column) in measured.iter().enumerate() {
            let readings: Vec<(DateTime<Utc>, f64)> = rows
                .iter()
                .filter_map(|row| {
                    row.value(column)
                        .and_then(Value::as_f64)
                        .map(|value| (row.grid_timestamp, value))
                })
                .collect();
            let Some((mean, std_dev)) = population_stats(readings.iter().map(|(_, v)| *v))
            else {
                continue;
            };
            if std_dev == 0.0 {
                continue;
            }

            for (grid_timestamp, value) in readings {
                let z_score = (value - mean) / std_dev;
                if z_score.abs() > threshold {
                    entity_flags.push((
                        grid_timestamp,
                        column_idx,
                        AnomalyFlag {
                            entity_id: entity_id.clone(),
                            grid_timestamp,
                            column: column.to_string(),
                            value,
                            z_score,
                        },
                    ));
                }
            }
        }
        entity_flags.sort_by_key(|(ts, column_idx, _)| (*ts, *column_idx));
        flags.extend(entity_flags.into_iter().map(|(_, _, flag)| flag));
    }

    info!(
        component = "anomaly",
        event = "anomaly.zscore.finish",
        threshold,
        records = records.len(),
        flags = flags.len()
    );

    flags
}

fn population_stats(values: impl Iterator<Item = f64>) -> Option<(f64, f64)> {
    let values: Vec<f64> = values.collect();
    if values.is_empty() {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values
        .iter()
        .map(|v| {
            let d = *v - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    Some((mean, variance.sqrt()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Fields;
    use crate::schema::ColumnPolicy;
    use chrono::TimeZone;

    fn schema() -> ColumnSchema {
        ColumnSchema::new(
            "user",
            vec![
                ("user".to_string(), ColumnPolicy::Static),
                ("hr".to_string(), ColumnPolicy::MeasuredNumeric),
            ],
        )
        .unwrap()
    }

    fn row(id: i64, hour: u32, hr: f64) -> ResampledRecord {
        let mut values = Fields::new();
        values.insert("hr".to_string(), Some(Value::Float(hr)));
        ResampledRecord {
            entity_id: EntityId::from(id),
            grid_timestamp: Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap(),
            values,
        }
    }

    #[test]
    fn spike_is_flagged_within_its_entity_only() {
        let mut records: Vec<ResampledRecord> = (0..10).map(|h| row(1, h, 60.0)).collect();
        records.push(row(1, 10, 180.0));
        // Entity 2 runs hot but steady; it must not be judged against entity 1.
        records.extend((0..5).map(|h| row(2, h, 150.0)));

        let flags = flag_zscore_anomalies(&records, &schema(), 3.0);

        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].entity_id, EntityId::from(1));
        assert_eq!(flags[0].value, 180.0);
        assert!(flags[0].z_score > 3.0);
    }

    #[test]
    fn flat_series_yields_no_flags() {
        let records: Vec<ResampledRecord> = (0..4).map(|h| row(1, h, 72.0)).collect();
        assert!(flag_zscore_anomalies(&records, &schema(), 0.5).is_empty());
    }
}
