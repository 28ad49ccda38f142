use std::fs::{self, File};
use std::io::{BufReader, Cursor};
use std::path::PathBuf;

use fitpulse::{
    preprocess_csv, read_raw_records, write_resampled_csv, ColumnSchema, CsvIngestError,
    EntityId, PipelineConfig, PipelineError, SchemaError, Value,
};
use regex::Regex;

const HR: &str = "Heart_Rate (bpm)";
const ACTIVE: &str = "Active_Minutes";
const SLEPT: &str = "Hours_Slept";
const WATER: &str = "Water_Intake (Liters)";

fn fixture_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join("fitness_sample.csv")
}

fn config() -> PipelineConfig {
    PipelineConfig {
        static_columns: vec!["Age".to_string()],
        categorical_columns: vec!["Workout_Type".to_string()],
        ..PipelineConfig::default()
    }
}

fn run_fixture() -> (fitpulse::PipelineOutput, fitpulse::CsvIngestReport, ColumnSchema) {
    let cfg = config();
    let schema = ColumnSchema::from_config(&cfg).unwrap();
    let reader = BufReader::new(File::open(fixture_path()).unwrap());
    let (output, ingest) = preprocess_csv(reader, &cfg, &schema).unwrap();
    (output, ingest, schema)
}

#[test]
fn ingest_report_counts_skipped_and_invalid_cells() {
    let (output, ingest, _) = run_fixture();

    assert_eq!(ingest.rows_read, 8);
    assert_eq!(ingest.rows_missing_entity, 1);
    assert_eq!(ingest.invalid_numeric_cells, 1);
    assert_eq!(ingest.ignored_columns, vec!["Notes".to_string()]);

    assert_eq!(output.summary.total_records, 7);
    assert_eq!(output.summary.users_found, 2);
    assert_eq!(output.diagnostics.normalize.dropped_unparsable_timestamps, 1);
    assert_eq!(
        output.diagnostics.normalize.sample_unparsable,
        vec!["31/02/2024 10:00".to_string()]
    );
}

#[test]
fn fixture_resamples_to_hourly_rows_per_user() {
    let (output, _, _) = run_fixture();

    assert_eq!(output.summary.final_row_count, 8);
    let ids: Vec<&EntityId> = output.records.iter().map(|r| &r.entity_id).collect();
    assert_eq!(ids[0], &EntityId::Integer(17));
    assert_eq!(ids[7], &EntityId::Integer(23));

    let first = &output.records[0];
    assert_eq!(first.value("Age"), Some(&Value::Integer(34)));
    assert_eq!(first.value(HR), Some(&Value::Float(58.0)));
    assert_eq!(first.value(SLEPT), Some(&Value::Float(7.5)));
    assert_eq!(
        first.value("Workout_Type"),
        Some(&Value::from("no activity recorded"))
    );
    assert_eq!(
        output.records[1].value("Workout_Type"),
        Some(&Value::from("Walking"))
    );
    // 08:00 has no reading; the grid pass blends 07:00 (25) with the 09:00 mean of 10 and 40.
    assert_eq!(output.records[2].value(ACTIVE), Some(&Value::Float(25.0)));

    // User 23: a non-numeric Active_Minutes cell is treated as missing and forward-filled.
    for record in &output.records[4..] {
        assert_eq!(record.value("Age"), Some(&Value::Integer(52)));
        assert_eq!(record.value(ACTIVE), Some(&Value::Float(15.0)));
        assert_eq!(record.value(WATER), Some(&Value::Float(2.0)));
    }
}

#[test]
fn export_writes_ordered_header_and_typed_cells() {
    let (output, _, schema) = run_fixture();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("resampled.csv");

    write_resampled_csv(
        File::create(&path).unwrap(),
        &output.records,
        &schema,
        &config().timestamp_column,
    )
    .unwrap();

    let text = fs::read_to_string(&path).unwrap();
    let mut lines = text.lines();
    assert_eq!(
        lines.next(),
        Some(
            "User_ID,Date,Age,Hours_Slept,Water_Intake (Liters),Active_Minutes,Heart_Rate (bpm),Workout_Type"
        )
    );
    assert_eq!(
        lines.next(),
        Some("17,2024-03-01T06:00:00Z,34,7.5,0.5,0,58,no activity recorded")
    );
    assert_eq!(text.lines().count(), 9);
    assert!(!text.contains("17.0"));

    let row_shape = Regex::new(r"^(17|23),\d{4}-\d{2}-\d{2}T\d{2}:00:00Z,(34|52),").unwrap();
    for line in text.lines().skip(1) {
        assert!(row_shape.is_match(line), "unexpected row: {line}");
    }
}

#[test]
fn header_missing_declared_columns_is_a_schema_error() {
    let csv = "User_ID,Date,Hours_Slept,Active_Minutes\n1,01/01/2024 10:00,7,30\n";
    let cfg = PipelineConfig::default();
    let schema = ColumnSchema::from_config(&cfg).unwrap();

    let err = read_raw_records(Cursor::new(csv), &cfg, &schema).unwrap_err();
    match err {
        CsvIngestError::Schema(SchemaError::MissingColumns { columns }) => {
            assert_eq!(columns, vec![WATER.to_string(), HR.to_string()]);
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let err = preprocess_csv(Cursor::new(csv), &cfg, &schema).unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Csv(CsvIngestError::Schema(SchemaError::MissingColumns { .. }))
    ));
}
