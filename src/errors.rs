use thiserror::Error;

#[derive(Error, Debug)]
pub enum MontageError {
    #[error("Malformed source entry (expected `node:resource`): {0}")]
    MalformedSource(String),

    #[error("Transaction {0} names no sources")]
    EmptyTransaction(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Artifact name {0} cannot be written")]
    InvalidArtifactName(String),

    #[error("Other error: {0}")]
    Other(String),
}

impl From<bincode::Error> for MontageError {
    fn from(e: bincode::Error) -> Self {
        MontageError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MontageError>;
