use thiserror::Error;

#[derive(Debug, Error)]
pub enum SleuthError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Transform errors
    #[error("Transform not found: {0}")]
    TransformNotFound(String),

    #[error("Invalid transform parameters: {transform}: {message}")]
    Validation { transform: String, message: String },

    #[error("Transform execution failed: {transform}: {message}")]
    TransformRuntime { transform: String, message: String },

    // Graph store errors
    #[error("Graph store error: {0}")]
    GraphStore(String),

    // Vault errors
    #[error("Secret decryption failed: {0}")]
    SecretAuth(String),

    // Run errors
    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Invalid run transition: {0}")]
    RunTransition(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // Queue errors
    #[error("Task queue error: {0}")]
    Queue(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SleuthError>;
