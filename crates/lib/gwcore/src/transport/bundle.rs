//! Bundle-docker transport: identical to the container transport except
//! that image/command/args are manifest-derived and the bundle's unpacked
//! files are copied into the image build context rather than bind-mounted,
//! isolating the container from host filesystem changes.

use super::container::{ContainerConfig, ContainerTransport};
use super::{Connection, Transport};
use crate::error::Result;
use async_trait::async_trait;
use bollard::Docker;
use std::path::PathBuf;
use tokio::time::Instant;

/// A host directory (an unpacked bundle's staging directory, or a subtree
/// of it) to be copied into the container at a fixed destination path.
#[derive(Debug, Clone)]
pub struct BundleFile {
    pub host_path: PathBuf,
    pub container_path: String,
}

pub struct BundleDockerTransport {
    inner: ContainerTransport,
}

impl BundleDockerTransport {
    /// `files` are uploaded into the container's filesystem at connect
    /// time, not bind-mounted; the staging directory itself is per-service
    /// and torn down by the GC once the service is deregistered (see
    /// `gwcore::bundle::gc`).
    pub fn new(docker: Docker, image: String, command: String, args: Vec<String>, env: std::collections::HashMap<String, String>, files: Vec<BundleFile>) -> Self {
        let copy_dirs = files
            .into_iter()
            .map(|f| (f.host_path, f.container_path))
            .collect();
        let config = ContainerConfig {
            image,
            command,
            args,
            env,
            mounts: vec![],
            setup_commands: vec![],
            copy_dirs,
        };
        Self {
            inner: ContainerTransport::new(docker, config),
        }
    }
}

#[async_trait]
impl Transport for BundleDockerTransport {
    async fn connect(&self, deadline: Instant) -> Result<Box<dyn Connection>> {
        self.inner.connect(deadline).await
    }
}
