pub mod manifest;
pub mod reconcile;

use crate::error::{RegistrationError, Result};
use crate::managers::{ProxyHandle, PromptManager, ResourceManager, ToolManager};
use gwcore::bundle::{unzip, staging_dir, ActiveBundleSet, DEFAULT_MAX_UNCOMPRESSED_BYTES};
use gwcore::error::GatewayError;
use gwcore::framing::{FramedMessage, MessageId};
use gwcore::transport::bundle::{BundleDockerTransport, BundleFile};
use gwcore::transport::http::{HttpTransport, HttpTransportConfig};
use gwcore::transport::local::{LocalCommandConfig, LocalCommandTransport};
use gwcore::transport::{Connection, Transport};
use reconcile::{reconcile, DiscoveredItem, ItemOverride, ReconciledItem};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info_span, warn};

/// Default per-request deadline applied by discovery and proxy-handle
/// invocation when the caller does not supply one.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Exactly one of these three slots must be populated on a [`ServiceConfig`].
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct RawTransportConfig {
    pub local: Option<LocalCommandConfig>,
    pub http: Option<HttpTransportConfig>,
    pub bundle: Option<BundleSourceConfig>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct BundleSourceConfig {
    pub archive_path: PathBuf,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

pub enum TransportVariant {
    Local(LocalCommandConfig),
    Http(HttpTransportConfig),
    Bundle(BundleSourceConfig),
}

/// Selects exactly one transport variant from `raw`; zero or more than one
/// populated slot is an error.
pub fn select_transport(raw: RawTransportConfig) -> Result<TransportVariant> {
    let populated = [raw.local.is_some(), raw.http.is_some(), raw.bundle.is_some()]
        .into_iter()
        .filter(|present| *present)
        .count();
    match populated {
        0 => Err(RegistrationError::ConfigInvalid(
            "no transport variant specified (local/http/bundle)".into(),
        )),
        1 => {
            if let Some(local) = raw.local {
                Ok(TransportVariant::Local(local))
            } else if let Some(http) = raw.http {
                Ok(TransportVariant::Http(http))
            } else {
                Ok(TransportVariant::Bundle(raw.bundle.unwrap()))
            }
        }
        _ => Err(RegistrationError::ConfigInvalid(
            "ambiguous transport: more than one of local/http/bundle specified".into(),
        )),
    }
}

/// Canonicalize a service name: lowercased, non-alphanumeric replaced with
/// `_`, bounded to 64 characters. Empty names are rejected.
pub fn canonicalize_name(raw: &str) -> Result<String> {
    if raw.trim().is_empty() {
        return Err(RegistrationError::ConfigInvalid(
            "service name must not be empty".into(),
        ));
    }
    let canonical: String = raw
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .take(64)
        .collect();
    if canonical.is_empty() {
        return Err(RegistrationError::ConfigInvalid(
            "service name has no canonicalizable characters".into(),
        ));
    }
    Ok(canonical)
}

/// Declarative configuration for one upstream service.
pub struct ServiceConfig {
    pub name: String,
    pub transport: TransportVariant,
    pub secrets: HashMap<String, String>,
    pub tool_overrides: HashMap<String, ItemOverride>,
    pub prompt_overrides: HashMap<String, ItemOverride>,
    pub resource_overrides: HashMap<String, ItemOverride>,
    /// resource name → tool-call-id that must produce its contents.
    pub dynamic_resource_call_ids: HashMap<String, String>,
}

#[derive(Default)]
pub struct RegistrationOutcome {
    pub tools_registered: usize,
    pub prompts_registered: usize,
    pub resources_registered: usize,
}

/// Build the concrete [`Transport`] for a service, unzipping and staging a
/// bundle archive first if that variant was selected.
pub async fn build_transport(
    config: &ServiceConfig,
    bundle_base_dir: &Path,
    active_bundles: &ActiveBundleSet,
    docker: Option<bollard::Docker>,
) -> Result<Arc<dyn Transport>> {
    match &config.transport {
        TransportVariant::Local(local) => Ok(Arc::new(LocalCommandTransport::new(
            local.clone(),
            config.secrets.clone(),
        ))),
        TransportVariant::Http(http) => Ok(Arc::new(HttpTransport::new(http.clone()))),
        TransportVariant::Bundle(bundle) => {
            let docker = docker.ok_or_else(|| {
                RegistrationError::ConfigInvalid("bundle transport requires a docker client".into())
            })?;
            active_bundles.insert(config.name.clone());
            let dest = staging_dir(bundle_base_dir, &config.name);
            unzip(&bundle.archive_path, &dest, DEFAULT_MAX_UNCOMPRESSED_BYTES)?;

            let manifest_raw = std::fs::read(dest.join("manifest.json"))
                .map_err(|err| RegistrationError::ConfigInvalid(format!("missing manifest.json: {err}")))?;
            let manifest = manifest::parse_manifest(&manifest_raw)?;
            let bundle_container_path = "/bundle";
            let launch = manifest::derive_launch(&manifest, bundle_container_path, &bundle.env)?;

            let files = vec![BundleFile {
                host_path: dest.clone(),
                container_path: bundle_container_path.to_string(),
            }];
            Ok(Arc::new(BundleDockerTransport::new(
                docker,
                launch.image,
                launch.command,
                launch.args,
                launch.env,
                files,
            )))
        }
    }
}

async fn call(
    conn: &mut dyn Connection,
    method: &str,
    params: Option<Value>,
    deadline: Instant,
) -> Result<Value> {
    conn.write(
        deadline,
        &FramedMessage::Request {
            method: method.to_string(),
            params,
            id: MessageId::Integer(1),
        },
    )
    .await
    .map_err(RegistrationError::Gateway)?;

    match conn.read(deadline).await.map_err(RegistrationError::Gateway)? {
        FramedMessage::Response { result, error, .. } => {
            if let Some(err) = error {
                return Err(RegistrationError::DiscoveryFailed(err.message));
            }
            Ok(result.unwrap_or(Value::Null))
        }
        other => Err(RegistrationError::DiscoveryFailed(format!(
            "unexpected frame in response to {method}: {other:?}"
        ))),
    }
}

fn parse_items(value: &Value, array_key: &str) -> Vec<DiscoveredItem> {
    value
        .get(array_key)
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .filter_map(|raw| {
            let name = raw.get("name")?.as_str()?.to_string();
            Some(DiscoveredItem {
                name,
                description: raw.get("description").and_then(Value::as_str).map(str::to_string),
                title: raw.get("title").and_then(Value::as_str).map(str::to_string),
                schema: raw.get("inputSchema").or_else(|| raw.get("schema")).cloned(),
            })
        })
        .collect()
}

/// Open one discovery session over `transport`, list tools (fatal on
/// failure), prompts and resources (warn-only), and reconcile each list
/// against `config`'s declarative overrides.
pub async fn discover_and_reconcile(
    transport: &dyn Transport,
    config: &ServiceConfig,
    deadline: Instant,
) -> Result<(Vec<ReconciledItem>, Vec<ReconciledItem>, Vec<ReconciledItem>)> {
    let span = info_span!("discover", service = %config.name);
    let _enter = span.enter();

    let mut conn = transport.connect(deadline).await.map_err(RegistrationError::Gateway)?;

    let tools_value = call(conn.as_mut(), "tools/list", None, deadline).await?;
    let tools = reconcile(parse_items(&tools_value, "tools"), &config.tool_overrides);

    let prompts = match call(conn.as_mut(), "prompts/list", None, deadline).await {
        Ok(value) => reconcile(parse_items(&value, "prompts"), &config.prompt_overrides),
        Err(err) => {
            warn!(service = %config.name, error = %err, "listing prompts failed; continuing without them");
            vec![]
        }
    };

    let resources = match call(conn.as_mut(), "resources/list", None, deadline).await {
        Ok(value) => reconcile(parse_items(&value, "resources"), &config.resource_overrides),
        Err(err) => {
            warn!(service = %config.name, error = %err, "listing resources failed; continuing without them");
            vec![]
        }
    };

    conn.close().await.map_err(RegistrationError::Gateway)?;
    Ok((tools, prompts, resources))
}

/// A proxy handle that establishes a fresh transport session on every
/// invocation; it holds a strong reference to the transport, never the
/// reverse.
pub struct TransportProxyHandle {
    name: String,
    method: String,
    call_params: Option<Value>,
    transport: Arc<dyn Transport>,
}

#[async_trait::async_trait]
impl ProxyHandle for TransportProxyHandle {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, params: Option<Value>) -> gwcore::Result<Value> {
        let deadline = Instant::now() + DEFAULT_REQUEST_TIMEOUT;
        let mut conn = self.transport.connect(deadline).await?;
        let merged_params = params.or_else(|| self.call_params.clone());
        conn.write(
            deadline,
            &FramedMessage::Request {
                method: self.method.clone(),
                params: merged_params,
                id: MessageId::Integer(1),
            },
        )
        .await?;
        let response = conn.read(deadline).await;
        let _ = conn.close().await;
        match response? {
            FramedMessage::Response { result, error, .. } => {
                if let Some(err) = error {
                    return Err(GatewayError::UpstreamFailure(err.message));
                }
                Ok(result.unwrap_or(Value::Null))
            }
            other => Err(GatewayError::ProtocolFailure(format!(
                "unexpected frame from proxy invocation: {other:?}"
            ))),
        }
    }
}

fn make_handle(transport: Arc<dyn Transport>, method: &str, item: &ReconciledItem) -> Arc<dyn ProxyHandle> {
    Arc::new(TransportProxyHandle {
        name: item.name.clone(),
        method: method.to_string(),
        call_params: Some(serde_json::json!({ "name": item.name })),
        transport,
    })
}

/// Register the reconciled tools/prompts/resources of one service with
/// the external managers. Dynamic resources are linked only when their
/// declared call-id matches a registered tool; orphans are logged and
/// dropped.
pub async fn publish(
    transport: Arc<dyn Transport>,
    config: &ServiceConfig,
    tools: Vec<ReconciledItem>,
    prompts: Vec<ReconciledItem>,
    resources: Vec<ReconciledItem>,
    tool_manager: &dyn ToolManager,
    prompt_manager: &dyn PromptManager,
    resource_manager: &dyn ResourceManager,
) -> RegistrationOutcome {
    let mut outcome = RegistrationOutcome::default();
    let mut registered_tool_names = std::collections::HashSet::new();

    for tool in &tools {
        let handle = make_handle(transport.clone(), "tools/call", tool);
        tool_manager
            .register_tool(
                &config.name,
                handle,
                tool.description.clone(),
                tool.schema.clone(),
                tool.tags.clone(),
            )
            .await;
        registered_tool_names.insert(tool.name.clone());
        outcome.tools_registered += 1;
    }

    for prompt in &prompts {
        let handle = make_handle(transport.clone(), "prompts/get", prompt);
        prompt_manager
            .register_prompt(&config.name, handle, prompt.description.clone())
            .await;
        outcome.prompts_registered += 1;
    }

    for resource in &resources {
        let call_id = config.dynamic_resource_call_ids.get(&resource.name);
        if let Some(call_id) = call_id {
            if !registered_tool_names.contains(call_id) {
                warn!(
                    service = %config.name,
                    resource = %resource.name,
                    call_id = %call_id,
                    "dynamic resource references an undeclared tool call id; dropping"
                );
                continue;
            }
        }
        let handle = make_handle(transport.clone(), "resources/read", resource);
        resource_manager
            .register_resource(&config.name, handle, resource.name.clone(), call_id.cloned())
            .await;
        outcome.resources_registered += 1;
    }

    outcome
}
