//! HTTP-streamable transport: a `reqwest::Client` with a never-follow
//! redirect policy, set exactly once, the only authoritative setting.

use super::{Connection, Transport};
use crate::error::{GatewayError, Result};
use crate::framing::{self, FramedMessage};
use async_trait::async_trait;
use reqwest::redirect::Policy;
use std::collections::HashMap;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, serde::Deserialize)]
pub struct HttpTransportConfig {
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

pub struct HttpTransport {
    config: HttpTransportConfig,
}

impl HttpTransport {
    pub fn new(config: HttpTransportConfig) -> Self {
        Self { config }
    }

    fn build_client(&self) -> Result<reqwest::Client> {
        let mut headers = reqwest::header::HeaderMap::new();
        for (key, value) in &self.config.headers {
            let name = reqwest::header::HeaderName::from_bytes(key.as_bytes())
                .map_err(|err| GatewayError::ConfigInvalid(err.to_string()))?;
            let value = reqwest::header::HeaderValue::from_str(value)
                .map_err(|err| GatewayError::ConfigInvalid(err.to_string()))?;
            headers.insert(name, value);
        }

        reqwest::Client::builder()
            .redirect(Policy::none())
            .default_headers(headers)
            .build()
            .map_err(|err| GatewayError::TransportSetupFailure(err.to_string()))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn connect(&self, _deadline: Instant) -> Result<Box<dyn Connection>> {
        let client = self.build_client()?;
        Ok(Box::new(HttpConnection {
            session_id: Uuid::new_v4().to_string(),
            client,
            url: self.config.url.clone(),
            pending_response: None,
        }))
    }
}

/// A single request/response exchange over the streamable-HTTP endpoint.
/// Notifications sent over HTTP get a fire-and-forget POST; requests carry
/// their response back as the next `read`.
struct HttpConnection {
    session_id: String,
    client: reqwest::Client,
    url: String,
    pending_response: Option<FramedMessage>,
}

#[async_trait]
impl Connection for HttpConnection {
    async fn read(&mut self, _deadline: Instant) -> Result<FramedMessage> {
        self.pending_response
            .take()
            .ok_or_else(|| GatewayError::ProtocolFailure("no pending HTTP response".into()))
    }

    async fn write(&mut self, _deadline: Instant, message: &FramedMessage) -> Result<()> {
        let body = framing::encode(message)?;
        let response = self
            .client
            .post(&self.url)
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|err| GatewayError::UpstreamFailure(err.to_string()))?;

        if !response.status().is_success() {
            return Err(GatewayError::UpstreamFailure(format!(
                "upstream returned HTTP {}",
                response.status()
            )));
        }

        if matches!(message, FramedMessage::Notification { .. }) {
            return Ok(());
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|err| GatewayError::ProtocolFailure(err.to_string()))?;
        self.pending_response = Some(framing::decode(&bytes)?);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn session_id(&self) -> &str {
        &self.session_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirect_policy_is_never_follow() {
        let transport = HttpTransport::new(HttpTransportConfig {
            url: "https://example.invalid/mcp".into(),
            headers: HashMap::new(),
        });
        // build_client succeeding at all confirms the policy/headers
        // construction path is well-formed; the policy itself is opaque
        // to reqwest's public API past construction, so this test only
        // guards against a panic/regression in header assembly.
        assert!(transport.build_client().is_ok());
    }

    #[test]
    fn invalid_header_name_is_config_invalid() {
        let mut headers = HashMap::new();
        headers.insert("bad header\n".to_string(), "value".to_string());
        let transport = HttpTransport::new(HttpTransportConfig {
            url: "https://example.invalid/mcp".into(),
            headers,
        });
        assert!(matches!(
            transport.build_client(),
            Err(GatewayError::ConfigInvalid(_))
        ));
    }
}
