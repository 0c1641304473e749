//! Bidirectional mapping between an in-flight upstream session and its
//! originating downstream session, used to route server-initiated
//! requests (e.g. reverse LLM-sampling `CreateMessage`) back.

use crate::error::{RegistrationError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::hash::Hash;

/// Sink that delivers a server-initiated upstream request (e.g. reverse
/// LLM-sampling `CreateMessage`) to the downstream session that caused the
/// upstream session to be opened.
#[async_trait]
pub trait DownstreamSink<D>: Send + Sync {
    async fn deliver_create_message(&self, downstream_session: &D, request: Value) -> gwcore::Result<Value>;
}

/// Maps upstream-session-handle → downstream-session-handle. Every
/// registered entry is expected to be removed on session end; no entry
/// outlives the session it describes.
pub struct SessionRegistry<U, D> {
    forward: DashMap<U, D>,
}

impl<U, D> Default for SessionRegistry<U, D>
where
    U: Eq + Hash,
{
    fn default() -> Self {
        Self {
            forward: DashMap::new(),
        }
    }
}

impl<U, D> SessionRegistry<U, D>
where
    U: Eq + Hash + Clone,
    D: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `upstream_session` was opened on behalf of
    /// `downstream_session`.
    pub fn register(&self, upstream_session: U, downstream_session: D) {
        self.forward.insert(upstream_session, downstream_session);
    }

    /// Look up the downstream session that caused `upstream_session` to
    /// be opened, for routing a server-initiated request back.
    pub fn lookup(&self, upstream_session: &U) -> Option<D> {
        self.forward.get(upstream_session).map(|entry| entry.clone())
    }

    /// Remove the mapping for a session that has ended.
    pub fn remove(&self, upstream_session: &U) {
        self.forward.remove(upstream_session);
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    /// Route a server-initiated upstream request to the downstream session
    /// that caused `upstream_session` to be opened. Absence of a pair is a
    /// hard error; the caller surfaces it as a JSON-RPC error back to the
    /// upstream (see [`RegistrationError::to_rpc_error`]).
    pub async fn route_create_message<S: DownstreamSink<D>>(
        &self,
        upstream_session: &U,
        request: Value,
        sink: &S,
    ) -> Result<Value> {
        let downstream = self
            .lookup(upstream_session)
            .ok_or(RegistrationError::NoDownstreamSession)?;
        sink.deliver_create_message(&downstream, request)
            .await
            .map_err(RegistrationError::Gateway)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_lookup_and_remove_round_trip() {
        let registry: SessionRegistry<String, String> = SessionRegistry::new();
        registry.register("upstream-1".into(), "downstream-1".into());
        assert_eq!(
            registry.lookup(&"upstream-1".to_string()),
            Some("downstream-1".to_string())
        );

        registry.remove(&"upstream-1".to_string());
        assert_eq!(registry.lookup(&"upstream-1".to_string()), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn missing_entry_is_none() {
        let registry: SessionRegistry<String, String> = SessionRegistry::new();
        assert_eq!(registry.lookup(&"nonexistent".to_string()), None);
    }

    struct RecordingSink {
        delivered: std::sync::Mutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl DownstreamSink<String> for RecordingSink {
        async fn deliver_create_message(
            &self,
            downstream_session: &String,
            request: Value,
        ) -> gwcore::Result<Value> {
            self.delivered
                .lock()
                .unwrap()
                .push((downstream_session.clone(), request));
            Ok(serde_json::json!({"role": "assistant", "content": "ok"}))
        }
    }

    #[tokio::test]
    async fn reverse_request_routes_to_registered_downstream() {
        let registry: SessionRegistry<String, String> = SessionRegistry::new();
        registry.register("upstream-1".into(), "downstream-1".into());
        let sink = RecordingSink {
            delivered: std::sync::Mutex::new(vec![]),
        };

        let result = registry
            .route_create_message(&"upstream-1".to_string(), serde_json::json!({"prompt": "hi"}), &sink)
            .await;

        assert!(result.is_ok());
        let delivered = sink.delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0, "downstream-1");
    }

    #[tokio::test]
    async fn reverse_request_without_pair_is_hard_error() {
        let registry: SessionRegistry<String, String> = SessionRegistry::new();
        let sink = RecordingSink {
            delivered: std::sync::Mutex::new(vec![]),
        };

        let result = registry
            .route_create_message(&"unknown-upstream".to_string(), Value::Null, &sink)
            .await;

        assert!(matches!(result, Err(RegistrationError::NoDownstreamSession)));
        assert!(sink.delivered.lock().unwrap().is_empty());
    }
}
