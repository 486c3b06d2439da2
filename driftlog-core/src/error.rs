use thiserror::Error;

#[derive(Error, Debug)]
pub enum DriftError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("Etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid content name: {0}")]
    InvalidContentName(String),

    #[error("Lease lost: {0}")]
    LeaseLost(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, DriftError>;
