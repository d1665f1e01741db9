use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid job document: {0}")]
    Job(#[from] serde_json::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Vault error: {0}")]
    Vault(#[from] keyvault::VaultError),

    #[error("Transport error: {0}")]
    Transport(#[from] tracklift_engine::TransportError),

    #[error("Logging setup failed: {0}")]
    Logging(String),
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        AppError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
