use thiserror::Error;

#[derive(Error, Debug)]
pub enum DqError {
    #[error("Unknown table: {0}")]
    UnknownTable(String),

    #[error("Unknown column {column} in table {table}")]
    UnknownColumn { table: String, column: String },

    #[error("Rule compilation did not converge after {rounds} rounds")]
    CompilationTimeout { rounds: u32 },

    #[error("Ambiguous model response: {0}")]
    AmbiguousModelResponse(String),

    #[error("Query execution error: {0}")]
    QueryExecution(String),

    #[error("Unsafe query rejected: {0}")]
    UnsafeQuery(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Rule store error: {0}")]
    RuleStore(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, DqError>;
