//! Bundle manifest parsing and image/command inference. Wire/config
//! shapes are modeled as plain `#[derive(Deserialize)]` structs, with
//! `serde_json::Value` left open for schema-shaped fields.

use crate::error::{RegistrationError, Result};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, Deserialize)]
pub struct BundleManifest {
    pub manifest_version: u32,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    pub server: ServerDecl,
    #[serde(default)]
    pub tools: Vec<Value>,
    #[serde(default)]
    pub resources: Vec<Value>,
    #[serde(default)]
    pub prompts: Vec<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerDecl {
    #[serde(rename = "type")]
    pub server_type: String,
    #[serde(default)]
    pub entry_point: Option<String>,
    #[serde(default)]
    pub mcp_config: McpConfigDecl,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct McpConfigDecl {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

pub fn parse_manifest(raw: &[u8]) -> Result<BundleManifest> {
    serde_json::from_slice(raw)
        .map_err(|err| RegistrationError::ConfigInvalid(format!("invalid manifest.json: {err}")))
}

/// Derived container launch parameters for a bundle.
pub struct BundleLaunch {
    pub image: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

/// Infer the container image and launch command from a manifest's
/// `server.type`, substituting `${__dirname}` tokens in args with the
/// in-container bundle path, and merging manifest-env under
/// `caller_env` (caller wins).
pub fn derive_launch(
    manifest: &BundleManifest,
    bundle_container_path: &str,
    caller_env: &HashMap<String, String>,
) -> Result<BundleLaunch> {
    let image = match manifest.server.server_type.as_str() {
        "node" => "node:18-alpine",
        "python" => "python:3.11-slim",
        "uv" => "ghcr.io/astral-sh/uv:latest",
        "binary" => "debian:bookworm-slim",
        other => {
            return Err(RegistrationError::ConfigInvalid(format!(
                "unknown bundle server.type `{other}`"
            )))
        }
    }
    .to_string();

    let command = manifest
        .server
        .mcp_config
        .command
        .clone()
        .or_else(|| manifest.server.entry_point.clone())
        .ok_or_else(|| {
            RegistrationError::ConfigInvalid("manifest has no command or entry_point".into())
        })?;

    let args = manifest
        .server
        .mcp_config
        .args
        .iter()
        .map(|arg| arg.replace("${__dirname}", bundle_container_path))
        .collect();

    let mut env = manifest.server.mcp_config.env.clone();
    for (key, value) in caller_env {
        env.insert(key.clone(), value.clone());
    }

    Ok(BundleLaunch {
        image,
        command,
        args,
        env,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_manifest(server_type: &str) -> BundleManifest {
        BundleManifest {
            manifest_version: 1,
            name: "demo".into(),
            version: "0.1.0".into(),
            description: None,
            server: ServerDecl {
                server_type: server_type.into(),
                entry_point: Some("index.js".into()),
                mcp_config: McpConfigDecl {
                    command: Some("node".into()),
                    args: vec!["${__dirname}/index.js".into()],
                    env: HashMap::new(),
                },
            },
            tools: vec![],
            resources: vec![],
            prompts: vec![],
        }
    }

    #[test]
    fn infers_image_per_server_type() {
        for (ty, expected) in [
            ("node", "node:18-alpine"),
            ("python", "python:3.11-slim"),
            ("uv", "ghcr.io/astral-sh/uv:latest"),
            ("binary", "debian:bookworm-slim"),
        ] {
            let manifest = sample_manifest(ty);
            let launch = derive_launch(&manifest, "/bundle", &HashMap::new()).unwrap();
            assert_eq!(launch.image, expected);
        }
    }

    #[test]
    fn unknown_server_type_is_hard_error() {
        let manifest = sample_manifest("ruby");
        let result = derive_launch(&manifest, "/bundle", &HashMap::new());
        assert!(result.is_err());
    }

    #[test]
    fn dirname_token_substituted_and_caller_env_wins() {
        let manifest = sample_manifest("node");
        let mut caller_env = HashMap::new();
        caller_env.insert("FOO".to_string(), "caller".to_string());
        let launch = derive_launch(&manifest, "/opt/bundle", &caller_env).unwrap();
        assert_eq!(launch.args, vec!["/opt/bundle/index.js".to_string()]);
        assert_eq!(launch.env.get("FOO"), Some(&"caller".to_string()));
    }

    #[test]
    fn parses_manifest_json() {
        let raw = br#"{
            "manifest_version": 1,
            "name": "demo",
            "version": "0.1.0",
            "server": {"type": "python", "mcp_config": {"command": "python3", "args": []}}
        }"#;
        let manifest = parse_manifest(raw).unwrap();
        assert_eq!(manifest.server.server_type, "python");
    }
}
