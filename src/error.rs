use thiserror::Error;

#[derive(Error, Debug)]
pub enum OpalError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Duplicate key in index {index}: {key}")]
    DuplicateKey { index: String, key: String },

    #[error("Row not found when deleting from index {index}: {key}")]
    RowNotFound { index: String, key: String },

    #[error("NULL not allowed in primary key column {0}")]
    NullInPrimaryKey(String),

    #[error("File corrupted: page {page_id}, {field}")]
    FileCorrupted { page_id: u64, field: String },

    #[error("Error accessing linked table, SQL: {sql}: {cause}")]
    LinkedTable { sql: String, cause: String },

    #[error("Step size must not be zero")]
    StepSizeZero,

    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Page overflow: data exceeds page capacity")]
    PageOverflow,

    #[error("Page not found: page_id={0}")]
    PageNotFound(u64),

    #[error("Invalid page format")]
    InvalidPage,

    #[error("Undo journal error: {0}")]
    Undo(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Data corruption: {0}")]
    Corruption(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, OpalError>;
