use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum OtuError {
    #[error("unknown contextual field: {0}")]
    UnknownField(String),

    #[error("term on field {field} expects a {expected} value, got {found}")]
    TermType {
        field: String,
        expected: String,
        found: String,
    },

    #[error("unknown operator: {0}")]
    UnknownOperator(String),

    #[error("unknown contextual filter mode: {0}")]
    UnknownMode(String),

    #[error("sort column {index} out of range ({columns} columns selected)")]
    InvalidSort { index: usize, columns: usize },

    #[error("invalid query request: {0}")]
    InvalidRequest(String),

    #[error("invalid taxonomy state: {0}")]
    InvalidTaxonomyState(String),

    #[error("no ontology entry in {table} for {key}")]
    OntologyNotFound { table: String, key: String },

    #[error("import metadata missing or ambiguous: {0}")]
    MissingMetadata(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("export failed: {0}")]
    Export(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("missing config file otu-query.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),
}

pub(crate) fn db_error(err: rusqlite::Error) -> OtuError {
    OtuError::Database(err.to_string())
}
