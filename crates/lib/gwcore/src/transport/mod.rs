pub mod bundle;
pub mod container;
pub mod http;
pub mod local;

use crate::error::Result;
use crate::framing::FramedMessage;
use async_trait::async_trait;
use tokio::time::Instant;

/// Descriptor of how to reach an upstream. A stateless factory: each
/// `connect` call yields a fresh [`Connection`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, deadline: Instant) -> Result<Box<dyn Connection>>;
}

/// A duplex framed-message channel bound to a backing process or HTTP
/// stream. Owned by the caller; `close` must terminate the backing
/// process/container and release every associated OS resource.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn read(&mut self, deadline: Instant) -> Result<FramedMessage>;
    async fn write(&mut self, deadline: Instant, message: &FramedMessage) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
    fn session_id(&self) -> &str;
}

/// Environment variables inherited from the parent process by local and
/// container transports unless explicitly overridden by configuration.
pub const ENV_ALLOW_LIST: &[&str] = &["PATH", "HOME", "USER", "TMPDIR", "TZ", "LANG"];

/// Build the environment map for a child process: the allow-listed parent
/// variables, overlaid by `explicit_env` (which always wins).
pub fn resolve_env(
    explicit_env: &std::collections::HashMap<String, String>,
) -> std::collections::HashMap<String, String> {
    let mut resolved = std::collections::HashMap::new();
    for key in ENV_ALLOW_LIST {
        if let Ok(value) = std::env::var(key) {
            resolved.insert((*key).to_string(), value);
        }
    }
    for (key, value) in explicit_env {
        resolved.insert(key.clone(), value.clone());
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_env_overrides_allow_listed_parent_value() {
        std::env::set_var("PATH", "/parent/path");
        let mut explicit = std::collections::HashMap::new();
        explicit.insert("PATH".to_string(), "/custom/path".to_string());
        explicit.insert("CUSTOM_KEY".to_string(), "value".to_string());
        let resolved = resolve_env(&explicit);
        assert_eq!(resolved.get("PATH"), Some(&"/custom/path".to_string()));
        assert_eq!(resolved.get("CUSTOM_KEY"), Some(&"value".to_string()));
    }

    #[test]
    fn disallowed_parent_vars_are_dropped() {
        std::env::set_var("GWCORE_TEST_SECRET", "leak-me");
        let explicit = std::collections::HashMap::new();
        let resolved = resolve_env(&explicit);
        assert!(!resolved.contains_key("GWCORE_TEST_SECRET"));
    }
}
