// ABOUTME: Sandbox controller, the only component that creates and tears down containers
// ABOUTME: Resolves per-type profiles, binds workspaces, publishes ports and reclaims orphans

use crate::error::{Result, SandboxError};
use crate::ports::PortAllocator;
use crate::providers::{ContainerConfig, PortMapping, Provider, VolumeMount};
use crate::settings::SandboxSettings;
use crate::types::{NetworkMode, ResourceLimits, SandboxHandle, SessionType};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Mount point of the session workspace inside every sandbox
pub const WORKSPACE_MOUNT: &str = "/workspace";

#[derive(Debug, Clone, Default)]
pub struct SandboxOptions {
    /// Session the sandbox is created for; pooled sandboxes have none
    pub session_id: Option<String>,
    /// Overrides the profile's memory limit
    pub memory_mb: Option<u64>,
}

/// Outcome of orphan reclamation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReclaimReport {
    pub found: usize,
    pub removed: usize,
    pub errors: Vec<String>,
}

pub struct SandboxController {
    provider: Arc<dyn Provider>,
    ports: Arc<PortAllocator>,
    settings: Arc<SandboxSettings>,
}

impl SandboxController {
    pub fn new(
        provider: Arc<dyn Provider>,
        ports: Arc<PortAllocator>,
        settings: Arc<SandboxSettings>,
    ) -> Self {
        Self {
            provider,
            ports,
            settings,
        }
    }

    fn label(&self, name: &str) -> String {
        format!("{}.{}", self.settings.runtime.label_prefix, name)
    }

    /// Create and start a sandbox of `sandbox_type`
    pub async fn create_sandbox(
        &self,
        sandbox_type: SessionType,
        options: SandboxOptions,
    ) -> Result<SandboxHandle> {
        let id = Uuid::new_v4().to_string();
        let profile = self.settings.profiles.for_type(sandbox_type);

        let limits = ResourceLimits {
            memory_mb: options.memory_mb.unwrap_or(profile.memory_mb),
            cpu_cores: profile.cpu_cores,
            pids_limit: profile.pids_limit,
            nofile: profile.nofile,
            nproc: profile.nproc,
            tmpfs_mb: profile.tmpfs_mb,
            shm_size_mb: profile.shm_size_mb,
        };

        let workspace_path = self.settings.runtime.workspace_root.join(&id);
        prepare_workspace(&workspace_path).await?;

        let mut labels = HashMap::from([
            (self.label("managed"), "true".to_string()),
            (self.label("sandbox_id"), id.clone()),
            (self.label("type"), sandbox_type.as_str().to_string()),
        ]);
        if let Some(session_id) = &options.session_id {
            labels.insert(self.label("session_id"), session_id.clone());
        }

        let mut ports = Vec::new();
        let mut endpoints = BTreeMap::new();
        let mut host_port = None;
        let network_mode = match (
            self.settings.port_range_for(sandbox_type),
            profile.service_port,
        ) {
            (Some(range), Some(container_port)) => {
                let port = self.ports.find_available_port(range);
                ports.push(PortMapping {
                    host_port: port,
                    container_port,
                    protocol: "tcp".to_string(),
                });
                endpoints = self.endpoints_for(sandbox_type, port);
                host_port = Some(port);
                NetworkMode::Published
            }
            _ => NetworkMode::None,
        };

        let config = ContainerConfig {
            image: profile.image.clone(),
            name: format!(
                "{}-{}-{}",
                self.settings.runtime.label_prefix,
                sandbox_type.as_str(),
                &id[..8]
            ),
            env_vars: HashMap::new(),
            volumes: vec![VolumeMount {
                host_path: workspace_path.to_string_lossy().to_string(),
                container_path: WORKSPACE_MOUNT.to_string(),
                readonly: false,
            }],
            ports,
            cpu_cores: limits.cpu_cores,
            memory_mb: limits.memory_mb,
            pids_limit: limits.pids_limit,
            nofile: limits.nofile,
            nproc: limits.nproc,
            tmpfs: HashMap::from([("/tmp".to_string(), limits.tmpfs_mb)]),
            shm_size_mb: limits.shm_size_mb,
            network_enabled: network_mode == NetworkMode::Published,
            drop_all_capabilities: sandbox_type == SessionType::Execution,
            command: profile.command.clone(),
            working_dir: Some(WORKSPACE_MOUNT.to_string()),
            labels: labels.clone(),
        };

        let container_id = match self.provider.create_container(&config).await {
            Ok(container_id) => container_id,
            Err(e) => {
                warn!(sandbox_id = %id, "Failed to create {} sandbox: {}", sandbox_type, e);
                if let Some(port) = host_port {
                    self.ports.release(port);
                }
                remove_workspace(&workspace_path).await;
                return Err(SandboxError::Provider(e));
            }
        };

        info!(
            sandbox_id = %id,
            container_id = %container_id,
            sandbox_type = %sandbox_type,
            host_port = ?host_port,
            "Created sandbox"
        );

        Ok(SandboxHandle {
            id,
            container_id,
            sandbox_type,
            limits,
            network_mode,
            workspace_path,
            labels,
            endpoints,
            host_port,
        })
    }

    fn endpoints_for(&self, sandbox_type: SessionType, port: u16) -> BTreeMap<String, String> {
        let host = &self.settings.runtime.public_host;
        match sandbox_type {
            SessionType::Ide => BTreeMap::from([(
                "vscode".to_string(),
                format!("http://{}:{}/?folder={}", host, port, WORKSPACE_MOUNT),
            )]),
            SessionType::BrowserAutomation => BTreeMap::from([(
                "playwright".to_string(),
                format!("ws://{}:{}/", host, port),
            )]),
            SessionType::Execution => BTreeMap::new(),
        }
    }

    /// Force-kill then remove, and delete the workspace. A container that is already
    /// gone counts as destroyed.
    pub async fn destroy_sandbox(&self, handle: &SandboxHandle) -> Result<()> {
        self.destroy_container(&handle.container_id).await?;
        remove_workspace(&handle.workspace_path).await;
        info!(sandbox_id = %handle.id, container_id = %handle.container_id, "Destroyed sandbox");
        Ok(())
    }

    /// Teardown for a container known only by id, e.g. one created by another process
    pub async fn destroy_container(&self, container_id: &str) -> Result<()> {
        match self.provider.kill_container(container_id).await {
            Ok(()) => {}
            Err(e) if e.is_already_gone() => {
                debug!(container_id = %container_id, "Container already stopped: {}", e);
            }
            Err(e) => return Err(SandboxError::Provider(e)),
        }

        match self.provider.remove_container(container_id).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_already_gone() => {
                debug!(container_id = %container_id, "Container already removed");
                Ok(())
            }
            Err(e) => Err(SandboxError::Provider(e)),
        }
    }

    /// Remove every container carrying this platform's label, left over from a previous process
    pub async fn reclaim_orphans(&self) -> Result<ReclaimReport> {
        let label = self.settings.managed_label();
        let container_ids = self.provider.list_labeled(&label).await?;

        let mut report = ReclaimReport {
            found: container_ids.len(),
            ..Default::default()
        };

        for container_id in container_ids {
            match self.provider.remove_container(&container_id).await {
                Ok(()) => {
                    info!(container_id = %container_id, "Removed orphaned container");
                    report.removed += 1;
                }
                Err(e) if e.is_already_gone() => report.removed += 1,
                Err(e) => {
                    let msg = format!(
                        "Failed to remove orphaned container {}: {}",
                        container_id, e
                    );
                    warn!("{}", msg);
                    report.errors.push(msg);
                }
            }
        }

        info!(
            "Orphan reclamation complete: found {}, removed {} (failed: {})",
            report.found,
            report.removed,
            report.errors.len()
        );
        Ok(report)
    }

    /// Whether the sandbox's container is still running. Inspection failures count as dead.
    pub async fn is_running(&self, handle: &SandboxHandle) -> bool {
        match self.provider.inspect_container(&handle.container_id).await {
            Ok(status) => status.is_running(),
            Err(e) => {
                debug!(container_id = %handle.container_id, "Inspect failed: {}", e);
                false
            }
        }
    }

    /// Write `contents` to `name` in the sandbox workspace, returning the in-container path
    pub async fn write_workspace_file(
        &self,
        handle: &SandboxHandle,
        name: &str,
        contents: &[u8],
    ) -> Result<String> {
        tokio::fs::write(handle.workspace_path.join(name), contents).await?;
        Ok(format!("{}/{}", WORKSPACE_MOUNT, name))
    }

    pub async fn remove_workspace_file(&self, handle: &SandboxHandle, name: &str) -> Result<()> {
        tokio::fs::remove_file(handle.workspace_path.join(name)).await?;
        Ok(())
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }
}

async fn prepare_workspace(path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path).await?;

    // Images run as arbitrary users, so the bind mount must be writable by all
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o777)).await?;
    }

    Ok(())
}

async fn remove_workspace(path: &Path) {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove workspace {}: {}", path.display(), e),
    }
}
