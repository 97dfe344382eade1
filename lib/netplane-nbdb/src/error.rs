use thiserror::Error;

use crate::model::Table;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("{table} row not found: {key}")]
    NotFound { table: Table, key: String },

    #[error("expected {expected} {table} row(s), found {found}")]
    RowCount {
        table: Table,
        expected: usize,
        found: usize,
    },

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Transaction failed: {0}")]
    Transaction(String),

    #[error("Transaction returned {results} results for {ops} operations")]
    ResultMismatch { ops: usize, results: usize },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}
