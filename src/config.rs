//! Pipeline configuration and environment overrides.

use std::env;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CATEGORICAL_FILL: &str = "no activity recorded";
/// Per-entity grid size limit; about eleven years of hourly cells.
pub const DEFAULT_MAX_GRID_CELLS: u64 = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateFormat {
    DayFirst,
    Iso,
}

impl DateFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DayFirst => "day-first",
            Self::Iso => "iso",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Hourly,
    Daily,
}

impl Frequency {
    pub fn step_seconds(self) -> i64 {
        match self {
            Self::Hourly => 3_600,
            Self::Daily => 86_400,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hourly => "hourly",
            Self::Daily => "daily",
        }
    }
}

/// What to do with an entity that has no reading at all in a measured column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsufficientDataPolicy {
    /// Fill with the median of the column across all entities.
    GlobalMedian,
    /// Leave the entity out of the output.
    DropEntity,
    /// Abort the run.
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub date_format: DateFormat,
    pub frequency: Frequency,
    pub timezone: Tz,
    pub entity_column: String,
    pub timestamp_column: String,
    pub measured_columns: Vec<String>,
    pub static_columns: Vec<String>,
    pub categorical_columns: Vec<String>,
    pub categorical_fill: String,
    pub insufficient_data: InsufficientDataPolicy,
    pub max_grid_cells: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            date_format: DateFormat::DayFirst,
            frequency: Frequency::Hourly,
            timezone: Tz::UTC,
            entity_column: "User_ID".to_string(),
            timestamp_column: "Date".to_string(),
            measured_columns: vec![
                "Hours_Slept".to_string(),
                "Water_Intake (Liters)".to_string(),
                "Active_Minutes".to_string(),
                "Heart_Rate (bpm)".to_string(),
            ],
            static_columns: Vec::new(),
            categorical_columns: Vec::new(),
            categorical_fill: DEFAULT_CATEGORICAL_FILL.to_string(),
            insufficient_data: InsufficientDataPolicy::GlobalMedian,
            max_grid_cells: DEFAULT_MAX_GRID_CELLS,
        }
    }
}

/// Imputation knobs the engine needs beyond the column schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImputationConfig {
    pub categorical_fill: String,
    pub insufficient_data: InsufficientDataPolicy,
    /// An entity whose time span needs more grid cells than this fails the run.
    pub max_grid_cells: u64,
}

impl Default for ImputationConfig {
    fn default() -> Self {
        Self {
            categorical_fill: DEFAULT_CATEGORICAL_FILL.to_string(),
            insufficient_data: InsufficientDataPolicy::GlobalMedian,
            max_grid_cells: DEFAULT_MAX_GRID_CELLS,
        }
    }
}

impl PipelineConfig {
    pub fn imputation(&self) -> ImputationConfig {
        ImputationConfig {
            categorical_fill: self.categorical_fill.clone(),
            insufficient_data: self.insufficient_data,
            max_grid_cells: self.max_grid_cells,
        }
    }
}

pub fn pipeline_config_from_env() -> PipelineConfig {
    let mut config = PipelineConfig::default();

    if let Some(parsed) = env_value("FITPULSE_DATE_FORMAT").and_then(|raw| parse_date_format(&raw))
    {
        config.date_format = parsed;
    }

    if let Some(parsed) = env_value("FITPULSE_FREQUENCY").and_then(|raw| parse_frequency(&raw)) {
        config.frequency = parsed;
    }

    if let Some(parsed) = env_value("FITPULSE_TIMEZONE").and_then(|raw| raw.parse::<Tz>().ok()) {
        config.timezone = parsed;
    }

    if let Some(column) = env_value("FITPULSE_ENTITY_COLUMN") {
        config.entity_column = column;
    }

    if let Some(column) = env_value("FITPULSE_TIMESTAMP_COLUMN") {
        config.timestamp_column = column;
    }

    if let Ok(raw) = env::var("FITPULSE_MEASURED_COLUMNS") {
        let columns = parse_column_list(&raw);
        if !columns.is_empty() {
            config.measured_columns = columns;
        }
    }

    // An empty list is a valid override for the optional column sets.
    if let Ok(raw) = env::var("FITPULSE_STATIC_COLUMNS") {
        config.static_columns = parse_column_list(&raw);
    }

    if let Ok(raw) = env::var("FITPULSE_CATEGORICAL_COLUMNS") {
        config.categorical_columns = parse_column_list(&raw);
    }

    if let Some(fill) = env_value("FITPULSE_CATEGORICAL_FILL") {
        config.categorical_fill = fill;
    }

    if let Some(parsed) = env_value("FITPULSE_INSUFFICIENT_DATA")
        .and_then(|raw| parse_insufficient_data_policy(&raw))
    {
        config.insufficient_data = parsed;
    }

    if let Some(parsed) = env_value("FITPULSE_MAX_GRID_CELLS")
        .and_then(|raw| raw.parse::<u64>().ok())
        .filter(|cells| *cells > 0)
    {
        config.max_grid_cells = parsed;
    }

    config
}

pub fn parse_date_format(raw: &str) -> Option<DateFormat> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "day-first" | "dayfirst" | "day_first" => Some(DateFormat::DayFirst),
        "iso" | "iso8601" | "iso-8601" => Some(DateFormat::Iso),
        _ => None,
    }
}

pub fn parse_frequency(raw: &str) -> Option<Frequency> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "hourly" | "h" | "1h" => Some(Frequency::Hourly),
        "daily" | "d" | "1d" => Some(Frequency::Daily),
        _ => None,
    }
}

fn parse_insufficient_data_policy(raw: &str) -> Option<InsufficientDataPolicy> {
    match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
        "global_median" | "median" => Some(InsufficientDataPolicy::GlobalMedian),
        "drop_entity" | "drop" => Some(InsufficientDataPolicy::DropEntity),
        "fail" | "strict" => Some(InsufficientDataPolicy::Fail),
        _ => None,
    }
}

fn parse_column_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

pub(crate) fn env_value(key: &str) -> Option<String> {
    let raw = env::var(key).ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
