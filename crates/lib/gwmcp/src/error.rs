use gwcore::framing::RpcError;
use gwcore::GatewayError;
use thiserror::Error;

/// Error taxonomy for the registration pipeline and session routing,
/// wrapping `gwcore::GatewayError` for failures that bubble up from the
/// pool/transport/bundle layer.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("no downstream session found")]
    NoDownstreamSession,

    #[error("discovery failed: {0}")]
    DiscoveryFailed(String),
}

impl RegistrationError {
    /// Render as the JSON-RPC error object surfaced back to the upstream
    /// that triggered a failed server-initiated request.
    pub fn to_rpc_error(&self) -> RpcError {
        RpcError {
            code: -32000,
            message: self.to_string(),
            data: None,
        }
    }
}

pub type Result<T> = std::result::Result<T, RegistrationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_downstream_session_renders_expected_message() {
        let err = RegistrationError::NoDownstreamSession;
        assert_eq!(err.to_rpc_error().message, "no downstream session found");
    }
}
