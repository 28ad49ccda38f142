//! Usage: `preprocess_csv <input.csv> [output.csv]`
//!
//! Writes the resampled table to `output.csv` (or stdout) and the run summary as JSON to
//! stderr, after the logs. Pipeline settings come from the `FITPULSE_*` environment variables.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};

use fitpulse::{
    init_logging, log_app_start, log_pipeline_config, logging_config_from_env,
    pipeline_config_from_env, preprocess_csv, write_resampled_csv, ColumnSchema,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start("preprocess_csv", &logging_cfg);

    let mut args = std::env::args().skip(1);
    let input = args
        .next()
        .ok_or("usage: preprocess_csv <input.csv> [output.csv]")?;
    let output = args.next();

    let config = pipeline_config_from_env();
    let schema = ColumnSchema::from_config(&config)?;
    log_pipeline_config(&config, schema.fingerprint());

    let reader = BufReader::new(File::open(&input)?);
    let (result, ingest) = preprocess_csv(reader, &config, &schema)?;

    match output {
        Some(path) => {
            let writer = BufWriter::new(File::create(path)?);
            write_resampled_csv(writer, &result.records, &schema, &config.timestamp_column)?;
        }
        None => {
            let stdout = io::stdout();
            write_resampled_csv(
                stdout.lock(),
                &result.records,
                &schema,
                &config.timestamp_column,
            )?;
        }
    }

    let report = serde_json::json!({
        "summary": result.summary,
        "ingest": ingest,
        "diagnostics": result.diagnostics,
    });
    let mut stderr = io::stderr().lock();
    serde_json::to_writer_pretty(&mut stderr, &report)?;
    writeln!(stderr)?;

    Ok(())
}
