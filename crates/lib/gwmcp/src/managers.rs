//! Interfaces to the external tool/prompt/resource registries the
//! registration pipeline publishes proxy handles to. Each is an
//! `async_trait` object held behind `Arc<dyn _>` so the pipeline can
//! publish to whatever registry implementation the caller supplies.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// A callable handle produced by the registration pipeline. Each proxy
/// closes over the transport factory so every invocation establishes its
/// own session; the pool/transport it references is not held by the
/// external manager, only this handle is.
#[async_trait]
pub trait ProxyHandle: Send + Sync {
    /// The canonicalized name this handle is registered under.
    fn name(&self) -> &str;

    /// Invoke the underlying upstream tool/prompt/resource with `params`.
    async fn invoke(&self, params: Option<Value>) -> gwcore::Result<Value>;
}

#[async_trait]
pub trait ToolManager: Send + Sync {
    async fn register_tool(
        &self,
        service_name: &str,
        handle: Arc<dyn ProxyHandle>,
        description: Option<String>,
        schema: Option<Value>,
        tags: Vec<String>,
    );
}

#[async_trait]
pub trait PromptManager: Send + Sync {
    async fn register_prompt(
        &self,
        service_name: &str,
        handle: Arc<dyn ProxyHandle>,
        description: Option<String>,
    );
}

#[async_trait]
pub trait ResourceManager: Send + Sync {
    /// `produced_by_call_id` is the declared tool-call-id producing this
    /// resource's contents, for dynamic resources. `None` for static
    /// resources.
    async fn register_resource(
        &self,
        service_name: &str,
        handle: Arc<dyn ProxyHandle>,
        uri: String,
        produced_by_call_id: Option<String>,
    );
}
