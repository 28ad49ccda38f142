//! Column policy schema, validated once and reused across runs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

use crate::config::PipelineConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnPolicy {
    /// Constant per entity; emitted as the first observed value, never averaged.
    Static,
    /// Continuous reading; interpolated, then averaged per grid cell.
    MeasuredNumeric,
    /// Discrete label; sentinel-filled, first value per grid cell.
    Categorical,
}

impl ColumnPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::MeasuredNumeric => "measured_numeric",
            Self::Categorical => "categorical",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub policy: ColumnPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    entity_column: String,
    columns: Vec<ColumnSpec>,
    fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("column name must not be empty")]
    EmptyColumnName,
    #[error("column '{column}' declared as both {first} and {second}")]
    ConflictingPolicies {
        column: String,
        first: &'static str,
        second: &'static str,
    },
    #[error("entity column '{column}' must be static, found {found}")]
    EntityColumnNotStatic { column: String, found: &'static str },
    #[error("timestamp column '{column}' cannot carry a column policy")]
    TimestampColumnDeclared { column: String },
    #[error("schema declares no measured numeric columns")]
    NoMeasuredColumns,
    #[error("declared columns missing from input: {columns:?}")]
    MissingColumns { columns: Vec<String> },
}

impl ColumnSchema {
    /// Validates `declarations` against `entity_column`. The entity column must be declared
    /// and must be [`ColumnPolicy::Static`]. Repeating a column with the same policy is
    /// harmless; repeating it with a different one is a conflict.
    pub fn new(
        entity_column: &str,
        declarations: impl IntoIterator<Item = (String, ColumnPolicy)>,
    ) -> Result<Self, SchemaError> {
        if entity_column.trim().is_empty() {
            return Err(SchemaError::EmptyColumnName);
        }

        let mut seen: BTreeMap<String, ColumnPolicy> = BTreeMap::new();
        let mut columns = Vec::new();
        for (name, policy) in declarations {
            if name.trim().is_empty() {
                return Err(SchemaError::EmptyColumnName);
            }
            match seen.get(&name) {
                Some(existing) if *existing == policy => continue,
                Some(existing) => {
                    return Err(SchemaError::ConflictingPolicies {
                        column: name,
                        first: existing.as_str(),
                        second: policy.as_str(),
                    });
                }
                None => {
                    seen.insert(name.clone(), policy);
                    columns.push(ColumnSpec { name, policy });
                }
            }
        }

        match seen.get(entity_column) {
            Some(ColumnPolicy::Static) => {}
            Some(other) => {
                return Err(SchemaError::EntityColumnNotStatic {
                    column: entity_column.to_string(),
                    found: other.as_str(),
                });
            }
            None => {
                return Err(SchemaError::EntityColumnNotStatic {
                    column: entity_column.to_string(),
                    found: "undeclared",
                });
            }
        }

        if !columns
            .iter()
            .any(|spec| spec.policy == ColumnPolicy::MeasuredNumeric)
        {
            return Err(SchemaError::NoMeasuredColumns);
        }

        let fingerprint = schema_fingerprint(entity_column, &columns);
        info!(
            component = "schema",
            event = "schema.built",
            entity_column,
            column_count = columns.len(),
            fingerprint = %fingerprint
        );

        Ok(Self {
            entity_column: entity_column.to_string(),
            columns,
            fingerprint,
        })
    }

    /// Builds the schema from a pipeline config: the entity column is static, followed by
    /// the static, measured, and categorical column lists in that order.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, SchemaError> {
        let declared = config
            .static_columns
            .iter()
            .chain(&config.measured_columns)
            .chain(&config.categorical_columns);
        for name in declared.chain(std::iter::once(&config.entity_column)) {
            if *name == config.timestamp_column {
                return Err(SchemaError::TimestampColumnDeclared {
                    column: name.clone(),
                });
            }
        }

        let mut declarations = vec![(config.entity_column.clone(), ColumnPolicy::Static)];
        declarations.extend(
            config
                .static_columns
                .iter()
                .map(|name| (name.clone(), ColumnPolicy::Static)),
        );
        declarations.extend(
            config
                .measured_columns
                .iter()
                .map(|name| (name.clone(), ColumnPolicy::MeasuredNumeric)),
        );
        declarations.extend(
            config
                .categorical_columns
                .iter()
                .map(|name| (name.clone(), ColumnPolicy::Categorical)),
        );

        Self::new(&config.entity_column, declarations)
    }

    pub fn entity_column(&self) -> &str {
        &self.entity_column
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Every declared column in declaration order, entity column included.
    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    pub fn policy(&self, column: &str) -> Option<ColumnPolicy> {
        self.columns
            .iter()
            .find(|spec| spec.name == column)
            .map(|spec| spec.policy)
    }

    /// Value columns (entity column excluded) carrying `policy`, in declaration order.
    pub fn columns_with(&self, policy: ColumnPolicy) -> impl Iterator<Item = &str> {
        self.columns
            .iter()
            .filter(move |spec| spec.policy == policy && spec.name != self.entity_column)
            .map(|spec| spec.name.as_str())
    }

    pub fn measured_columns(&self) -> Vec<&str> {
        self.columns_with(ColumnPolicy::MeasuredNumeric).collect()
    }

    pub fn static_columns(&self) -> Vec<&str> {
        self.columns_with(ColumnPolicy::Static).collect()
    }

    pub fn categorical_columns(&self) -> Vec<&str> {
        self.columns_with(ColumnPolicy::Categorical).collect()
    }

    /// Output column order: static, measured, then categorical.
    pub fn output_columns(&self) -> Vec<&str> {
        let mut out = self.static_columns();
        out.extend(self.measured_columns());
        out.extend(self.categorical_columns());
        out
    }

    /// Fails with every declared value column that `available` does not contain. The
    /// entity column is carried outside the field map and is not checked here.
    pub fn check_present<'a>(
        &self,
        available: impl IntoIterator<Item = &'a str>,
    ) -> Result<(), SchemaError> {
        let available: Vec<&str> = available.into_iter().collect();
        let missing: Vec<String> = self
            .output_columns()
            .into_iter()
            .filter(|column| !available.contains(column))
            .map(str::to_string)
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(SchemaError::MissingColumns { columns: missing })
        }
    }
}

fn schema_fingerprint(entity_column: &str, columns: &[ColumnSpec]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("entity:{entity_column};"));
    hasher.update("columns:");
    for column in columns {
        hasher.update(column.name.as_bytes());
        hasher.update(format!(":{};", column.policy.as_str()));
    }
    hex::encode(hasher.finalize())
}
