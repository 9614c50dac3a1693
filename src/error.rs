use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the ipassist crate
#[derive(Error, Debug)]
pub enum IpError {
    /// Configuration related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration validation errors
    #[error("Configuration validation failed: {errors:?}")]
    ConfigValidation { errors: Vec<ValidationError> },

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    /// Invalid configuration value
    #[error("Invalid configuration value at {path}: {message}")]
    InvalidConfigValue { path: String, message: String },

    /// Corpus loading errors (malformed chunk stream, duplicate ids)
    #[error("Corpus error: {0}")]
    Corpus(String),

    /// Both dense and sparse retrieval are unavailable. The only hard
    /// failure surfaced to callers; everything else degrades to warnings.
    #[error("Retrieval unavailable: dense and sparse backends are both down")]
    RetrievalUnavailable,

    /// Coding knowledge base errors
    #[error("Coding KB error: {0}")]
    Kb(String),

    /// LLM client errors
    #[error("LLM error: {0}")]
    Llm(String),

    /// IO errors
    #[error("IO error: {context}: {source}")]
    Io {
        source: std::io::Error,
        context: String,
    },

    /// TOML deserialization errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization errors
    #[error("TOML serialization error: {0}")]
    TomlSerialization(#[from] toml::ser::Error),

    /// JSON errors
    #[error("JSON error: {context}: {source}")]
    Json {
        source: serde_json::Error,
        context: String,
    },

    /// Generic errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration validation error
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// Path to the configuration key that failed validation
    pub path: String,
    /// Error message describing the validation failure
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Result type for ipassist operations
pub type Result<T> = std::result::Result<T, IpError>;
