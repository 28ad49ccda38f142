//! Ingestion normalizer: timestamp parsing, row dropping, and entity partitioning.

use chrono::{DateTime, Datelike, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::DateFormat;
use crate::record::{EntityGroup, NormalizedRecord, RawRecord};

const ISO_DATETIME_LAYOUTS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];
const ISO_DATE_LAYOUTS: [&str; 1] = ["%Y-%m-%d"];

// `%y` takes exactly two digits, so four-digit years fall through to the `%Y` layouts.
const DAY_FIRST_DATETIME_LAYOUTS: [&str; 12] = [
    "%d/%m/%y %H:%M:%S",
    "%d/%m/%y %H:%M",
    "%d-%m-%y %H:%M:%S",
    "%d-%m-%y %H:%M",
    "%d.%m.%y %H:%M:%S",
    "%d.%m.%y %H:%M",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
    "%d-%m-%Y %H:%M:%S",
    "%d-%m-%Y %H:%M",
    "%d.%m.%Y %H:%M:%S",
    "%d.%m.%Y %H:%M",
];
const DAY_FIRST_DATE_LAYOUTS: [&str; 6] = [
    "%d/%m/%y", "%d-%m-%y", "%d.%m.%y", "%d/%m/%Y", "%d-%m-%Y", "%d.%m.%Y",
];

/// Years outside this range come from truncated or mistyped input and are not trusted.
const PLAUSIBLE_YEARS: std::ops::RangeInclusive<i32> = 1000..=9999;

/// Timestamp convention and zone for one pipeline instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampParser {
    pub format: DateFormat,
    pub timezone: Tz,
}

impl TimestampParser {
    pub fn new(format: DateFormat, timezone: Tz) -> Self {
        Self { format, timezone }
    }

    /// Parses `raw` with the configured convention only. Strings without an offset are
    /// read as local time in `timezone`; ambiguous local times take the earlier instant and
    /// nonexistent ones (DST gaps) fail. Two-digit day-first years map 00-68 to 20xx and
    /// 69-99 to 19xx; any year that is not four digits wide is rejected.
    pub fn parse(&self, raw: &str) -> Option<DateTime<Utc>> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }

        let (datetime_layouts, date_layouts): (&[&str], &[&str]) = match self.format {
            DateFormat::Iso => {
                if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
                    let dt = dt.with_timezone(&Utc);
                    return PLAUSIBLE_YEARS.contains(&dt.year()).then_some(dt);
                }
                (&ISO_DATETIME_LAYOUTS, &ISO_DATE_LAYOUTS)
            }
            DateFormat::DayFirst => (&DAY_FIRST_DATETIME_LAYOUTS, &DAY_FIRST_DATE_LAYOUTS),
        };

        let naive = datetime_layouts
            .iter()
            .find_map(|layout| NaiveDateTime::parse_from_str(trimmed, layout).ok())
            .or_else(|| {
                date_layouts.iter().find_map(|layout| {
                    NaiveDate::parse_from_str(trimmed, layout)
                        .ok()
                        .and_then(|date| date.and_hms_opt(0, 0, 0))
                })
            })
            .filter(|naive| PLAUSIBLE_YEARS.contains(&naive.year()))?;

        match self.timezone.from_local_datetime(&naive) {
            LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
            LocalResult::Ambiguous(earliest, _) => Some(earliest.with_timezone(&Utc)),
            LocalResult::None => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizeReport {
    pub input_records: u64,
    pub output_records: u64,
    pub dropped_unparsable_timestamps: u64,
    /// First few raw strings that failed to parse, for display.
    pub sample_unparsable: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizeOutput {
    pub records: Vec<NormalizedRecord>,
    pub report: NormalizeReport,
}

const MAX_UNPARSABLE_SAMPLES: usize = 8;

/// Resolves every timestamp, drops the rows that do not parse, and stably sorts the
/// survivors by `(entity_id, timestamp)`.
pub fn normalize(raw: Vec<RawRecord>, parser: &TimestampParser) -> NormalizeOutput {
    let mut report = NormalizeReport {
        input_records: raw.len() as u64,
        ..NormalizeReport::default()
    };

    let mut records = Vec::with_capacity(raw.len());
    for record in raw {
        match parser.parse(&record.timestamp) {
            Some(timestamp) => records.push(NormalizedRecord {
                entity_id: record.entity_id,
                timestamp,
                fields: record.fields,
            }),
            None => {
                debug!(
                    component = "normalize",
                    event = "normalize.row_dropped",
                    entity_id = %record.entity_id,
                    timestamp = %record.timestamp,
                    date_format = parser.format.as_str()
                );
                report.dropped_unparsable_timestamps += 1;
                if report.sample_unparsable.len() < MAX_UNPARSABLE_SAMPLES {
                    report.sample_unparsable.push(record.timestamp);
                }
            }
        }
    }

    records.sort_by(|a, b| {
        a.entity_id
            .cmp(&b.entity_id)
            .then_with(|| a.timestamp.cmp(&b.timestamp))
    });
    report.output_records = records.len() as u64;

    info!(
        component = "normalize",
        event = "normalize.finish",
        date_format = parser.format.as_str(),
        timezone = %parser.timezone,
        input_records = report.input_records,
        output_records = report.output_records,
        dropped_unparsable_timestamps = report.dropped_unparsable_timestamps
    );

    NormalizeOutput { records, report }
}

/// Splits records into per-entity groups. Records need not be pre-sorted; groups come out
/// in entity order and each group is ascending by timestamp.
pub fn group_by_entity(records: Vec<NormalizedRecord>) -> Vec<EntityGroup> {
    let mut records = records;
    records.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));

    let mut groups = Vec::new();
    let mut current: Vec<NormalizedRecord> = Vec::new();
    for record in records {
        if let Some(last) = current.last() {
            if last.entity_id != record.entity_id {
                let batch = std::mem::take(&mut current);
                groups.push(EntityGroup::new(batch[0].entity_id.clone(), batch));
            }
        }
        current.push(record);
    }
    if let Some(first) = current.first() {
        let entity_id = first.entity_id.clone();
        groups.push(EntityGroup::new(entity_id, current));
    }

    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{EntityId, Value};
    use chrono::Timelike;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn day_first_reads_day_before_month() {
        let parser = TimestampParser::new(DateFormat::DayFirst, Tz::UTC);
        assert_eq!(parser.parse("03/04/2024"), Some(utc(2024, 4, 3, 0, 0)));
        assert_eq!(parser.parse("03-04-2024 09:30"), Some(utc(2024, 4, 3, 9, 30)));
        assert_eq!(
            parser.parse("25.12.2023 23:59:00"),
            Some(utc(2023, 12, 25, 23, 59))
        );
        assert_eq!(parser.parse("13/13/2024"), None);
    }

    #[test]
    fn day_first_two_digit_year() {
        let parser = TimestampParser::new(DateFormat::DayFirst, Tz::UTC);
        assert_eq!(parser.parse("03/04/24"), Some(utc(2024, 4, 3, 0, 0)));
        assert_eq!(parser.parse("03.04.24 07:15"), Some(utc(2024, 4, 3, 7, 15)));
        assert_eq!(parser.parse("31-12-99 23:00:00"), Some(utc(1999, 12, 31, 23, 0)));
        assert_eq!(parser.parse("03/04/2024"), Some(utc(2024, 4, 3, 0, 0)));

        assert_eq!(parser.parse("03/04/124"), None);
        assert_eq!(parser.parse("03/04/0024 10:00"), None);
        assert_eq!(parser.parse("03/04/20245"), None);

        let iso = TimestampParser::new(DateFormat::Iso, Tz::UTC);
        assert_eq!(iso.parse("0024-04-03"), None);
        assert_eq!(iso.parse("0024-04-03T10:00:00Z"), None);
    }

    #[test]
    fn conventions_are_not_mixed() {
        let day_first = TimestampParser::new(DateFormat::DayFirst, Tz::UTC);
        let iso = TimestampParser::new(DateFormat::Iso, Tz::UTC);

        assert_eq!(day_first.parse("2024-04-03"), None);
        assert_eq!(iso.parse("03/04/2024"), None);
        assert_eq!(iso.parse("2024-04-03"), Some(utc(2024, 4, 3, 0, 0)));
        assert_eq!(iso.parse("2024-04-03T10:15"), Some(utc(2024, 4, 3, 10, 15)));
        assert_eq!(
            iso.parse("2024-04-03 10:15:30.250").map(|dt| dt.second()),
            Some(30)
        );
    }

    #[test]
    fn offsets_and_source_timezone_resolve_to_utc() {
        let iso = TimestampParser::new(DateFormat::Iso, chrono_tz::Europe::Berlin);
        assert_eq!(
            iso.parse("2024-01-15T10:00:00+02:00"),
            Some(utc(2024, 1, 15, 8, 0))
        );
        // Naive strings take the configured zone (CET is UTC+1 in January).
        assert_eq!(iso.parse("2024-01-15 10:00"), Some(utc(2024, 1, 15, 9, 0)));
        // 02:30 does not exist on the spring-forward night.
        assert_eq!(iso.parse("2024-03-31 02:30"), None);
        // 02:30 happens twice on the fall-back night; the earlier one wins.
        assert_eq!(iso.parse("2024-10-27 02:30"), Some(utc(2024, 10, 27, 0, 30)));
    }

    #[test]
    fn normalize_drops_counts_and_sorts() {
        let parser = TimestampParser::new(DateFormat::DayFirst, Tz::UTC);
        let raw = vec![
            RawRecord::new(2, "01/01/2024 10:00").with("hr", Some(Value::Float(70.0))),
            RawRecord::new(1, "not a date"),
            RawRecord::new(1, "01/01/2024 12:00"),
            RawRecord::new(1, "01/01/2024 09:00"),
            RawRecord::new(2, ""),
        ];

        let out = normalize(raw, &parser);

        assert_eq!(out.report.input_records, 5);
        assert_eq!(out.report.output_records, 3);
        assert_eq!(out.report.dropped_unparsable_timestamps, 2);
        assert_eq!(out.report.sample_unparsable, vec!["not a date", ""]);
        let order: Vec<(EntityId, u32)> = out
            .records
            .iter()
            .map(|r| (r.entity_id.clone(), r.timestamp.hour()))
            .collect();
        assert_eq!(
            order,
            vec![
                (EntityId::from(1), 9),
                (EntityId::from(1), 12),
                (EntityId::from(2), 10),
            ]
        );
    }

    #[test]
    fn normalize_sort_is_stable_for_duplicate_timestamps() {
        let parser = TimestampParser::new(DateFormat::Iso, Tz::UTC);
        let raw = vec![
            RawRecord::new(1, "2024-01-01 10:00").with("hr", Some(Value::Float(1.0))),
            RawRecord::new(1, "2024-01-01 10:00").with("hr", Some(Value::Float(2.0))),
        ];
        let out = normalize(raw, &parser);
        assert_eq!(out.records[0].value("hr"), Some(&Value::Float(1.0)));
        assert_eq!(out.records[1].value("hr"), Some(&Value::Float(2.0)));
    }

    #[test]
    fn grouping_partitions_by_entity() {
        let parser = TimestampParser::new(DateFormat::Iso, Tz::UTC);
        let raw = vec![
            RawRecord::new("b", "2024-01-01 10:00"),
            RawRecord::new("a", "2024-01-01 11:00"),
            RawRecord::new("a", "2024-01-01 09:00"),
        ];
        let groups = group_by_entity(normalize(raw, &parser).records);

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].entity_id(), &EntityId::from("a"));
        assert_eq!(groups[0].len(), 2);
        assert_eq!(groups[0].records()[0].timestamp, utc(2024, 1, 1, 9, 0));
        assert_eq!(groups[1].entity_id(), &EntityId::from("b"));
        assert!(group_by_entity(Vec::new()).is_empty());
    }
}
