//! Catalog table definitions and export locations

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const PARQUET_INPUT_FORMAT: &str = "org.apache.hadoop.hive.ql.io.parquet.MapredParquetInputFormat";
pub const PARQUET_OUTPUT_FORMAT: &str =
    "org.apache.hadoop.hive.ql.io.parquet.MapredParquetOutputFormat";
pub const PARQUET_SERDE: &str = "org.apache.hadoop.hive.ql.io.parquet.serde.ParquetHiveSerDe";

/// A named, typed column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: normalize_type(&data_type.into()),
        }
    }
}

fn normalize_type(data_type: &str) -> String {
    data_type.trim().to_lowercase().replace(' ', "")
}

fn integer_rank(data_type: &str) -> Option<u8> {
    match data_type {
        "tinyint" => Some(0),
        "smallint" => Some(1),
        "int" | "integer" => Some(2),
        "bigint" => Some(3),
        _ => None,
    }
}

/// Whether data stored as `existing` can be read as `declared` without migration.
///
/// Identical types and lossless widenings (integer width, float to double,
/// char/varchar to string) are compatible.
pub fn is_type_compatible(existing: &str, declared: &str) -> bool {
    let existing = normalize_type(existing);
    let declared = normalize_type(declared);
    if existing == declared {
        return true;
    }
    if let (Some(from), Some(to)) = (integer_rank(&existing), integer_rank(&declared)) {
        return from <= to;
    }
    if existing == "float" && declared == "double" {
        return true;
    }
    declared == "string" && (existing.starts_with("varchar") || existing.starts_with("char"))
}

/// Table declared in configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDefinition {
    pub name: String,
    pub columns: Vec<Column>,
}

/// Storage format of a catalog table. Exports are always Snappy Parquet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageFormat {
    pub input_format: String,
    pub output_format: String,
    pub serialization_library: String,
    pub compression: String,
}

impl StorageFormat {
    pub fn parquet_snappy() -> Self {
        Self {
            input_format: PARQUET_INPUT_FORMAT.to_string(),
            output_format: PARQUET_OUTPUT_FORMAT.to_string(),
            serialization_library: PARQUET_SERDE.to_string(),
            compression: "SNAPPY".to_string(),
        }
    }
}

/// A table registered in the external catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogTable {
    pub database: String,
    pub name: String,
    pub columns: Vec<Column>,
    pub format: StorageFormat,
    pub location: String,
    pub table_type: String,
    pub parameters: BTreeMap<String, String>,
}

impl CatalogTable {
    pub fn external_parquet(
        database: &str,
        definition: &TableDefinition,
        location: impl Into<String>,
    ) -> Self {
        let format = StorageFormat::parquet_snappy();
        let mut parameters = BTreeMap::new();
        parameters.insert("EXTERNAL".to_string(), "TRUE".to_string());
        parameters.insert("parquet.compression".to_string(), format.compression.clone());
        Self {
            database: database.to_string(),
            name: definition.name.clone(),
            columns: definition.columns.clone(),
            format,
            location: location.into(),
            table_type: "EXTERNAL_TABLE".to_string(),
            parameters,
        }
    }

    /// First declared column that the existing schema cannot serve, as
    /// `(column, existing type, declared type)`.
    pub fn schema_conflict(&self, declared: &[Column]) -> Option<(String, String, String)> {
        declared.iter().find_map(|column| {
            match self.columns.iter().find(|c| c.name == column.name) {
                Some(existing) if is_type_compatible(&existing.data_type, &column.data_type) => None,
                Some(existing) => Some((
                    column.name.clone(),
                    existing.data_type.clone(),
                    column.data_type.clone(),
                )),
                None => Some((
                    column.name.clone(),
                    "<missing>".to_string(),
                    column.data_type.clone(),
                )),
            }
        })
    }
}

/// Where one Run's export landed in the staging store
///
/// Layout: `<bucket>/<run_prefix>/<task_id>/<database>/<database>.<table>/1/`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportLocation {
    pub bucket: String,
    pub run_prefix: String,
    pub task_id: String,
    pub database: String,
}

impl ExportLocation {
    /// Object key prefix of the whole export (relative to the bucket root).
    pub fn prefix(&self) -> String {
        format!("{}/{}/", self.run_prefix, self.task_id)
    }

    pub fn table_prefix(&self, table: &str) -> String {
        format!("{}{}/{}.{}/", self.prefix(), self.database, self.database, table)
    }

    pub fn uri(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.prefix())
    }

    /// Data location registered for a table.
    pub fn table_location(&self, table: &str) -> String {
        format!("s3://{}/{}1/", self.bucket, self.table_prefix(table))
    }
}
