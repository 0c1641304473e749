use thiserror::Error;

/// Error taxonomy for the pool, transport and bundle subsystems.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("operation cancelled")]
    Cancelled,

    #[error("pool is closed")]
    PoolClosed,

    #[error("pool is full")]
    PoolFull,

    #[error("client factory failed: {0}")]
    FactoryFailure(String),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("transport setup failed: {0}")]
    TransportSetupFailure(String),

    #[error("protocol failure: {0}")]
    ProtocolFailure(String),

    #[error("upstream failure: {0}")]
    UpstreamFailure(String),

    #[error("security violation: {0}")]
    SecurityViolation(String),
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::TransportSetupFailure(err.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::ProtocolFailure(err.to_string())
    }
}

impl From<zip::result::ZipError> for GatewayError {
    fn from(err: zip::result::ZipError) -> Self {
        GatewayError::SecurityViolation(err.to_string())
    }
}

impl From<bollard::errors::Error> for GatewayError {
    fn from(err: bollard::errors::Error) -> Self {
        GatewayError::TransportSetupFailure(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
