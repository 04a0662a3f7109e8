// ABOUTME: Docker provider implementation for local container-based sandboxes
// ABOUTME: Uses bollard to create hardened containers, run attached execs and reap orphans

use super::{
    ContainerConfig, ContainerStatus, ExecAttachment, OutputChunk, Provider, ProviderError,
    Result,
};
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, KillContainerOptions, ListContainersOptions, LogOutput,
        RemoveContainerOptions, StartContainerOptions, StatsOptions,
    },
    errors::Error as BollardError,
    exec::{CreateExecOptions, StartExecResults},
    image::CreateImageOptions,
    models::{HostConfig, PortBinding, ResourcesUlimits},
    Docker,
};
use futures::{future, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const MB: i64 = 1024 * 1024;

pub struct DockerProvider {
    client: Docker,
    /// Images known to exist locally, with the time they were confirmed
    image_cache: Arc<RwLock<HashMap<String, chrono::DateTime<chrono::Utc>>>>,
    pull_timeout: Duration,
}

impl DockerProvider {
    /// Connect to the local Docker daemon with a 10 minute pull timeout
    pub fn new() -> Result<Self> {
        Self::with_pull_timeout(Duration::from_secs(600))
    }

    pub fn with_pull_timeout(timeout: Duration) -> Result<Self> {
        let client = Docker::connect_with_defaults()
            .map_err(|e| ProviderError::ConnectionError(e.to_string()))?;

        Ok(Self::with_client_and_timeout(client, timeout))
    }

    pub fn with_client_and_timeout(client: Docker, timeout: Duration) -> Self {
        Self {
            client,
            image_cache: Arc::new(RwLock::new(HashMap::new())),
            pull_timeout: timeout,
        }
    }

    /// Convert our config to bollard config
    fn to_bollard_config(config: &ContainerConfig) -> Config<String> {
        let mut exposed_ports = HashMap::new();
        let mut port_bindings = HashMap::new();

        if config.network_enabled {
            for port in &config.ports {
                let container_port = format!("{}/{}", port.container_port, port.protocol);
                exposed_ports.insert(container_port.clone(), HashMap::new());

                let binding = vec![PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: Some(port.host_port.to_string()),
                }];
                port_bindings.insert(container_port, Some(binding));
            }
        }

        let binds: Vec<String> = config
            .volumes
            .iter()
            .map(|v| {
                format!(
                    "{}:{}:{}",
                    v.host_path,
                    v.container_path,
                    if v.readonly { "ro" } else { "rw" }
                )
            })
            .collect();

        let env: Vec<String> = config
            .env_vars
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let tmpfs: HashMap<String, String> = config
            .tmpfs
            .iter()
            .map(|(path, size_mb)| {
                (
                    path.clone(),
                    format!("rw,noexec,nosuid,size={}m", size_mb),
                )
            })
            .collect();

        let ulimits = vec![
            ResourcesUlimits {
                name: Some("nofile".to_string()),
                soft: Some(config.nofile),
                hard: Some(config.nofile),
            },
            ResourcesUlimits {
                name: Some("nproc".to_string()),
                soft: Some(config.nproc),
                hard: Some(config.nproc),
            },
        ];

        let host_config = HostConfig {
            binds: Some(binds),
            port_bindings: if port_bindings.is_empty() {
                None
            } else {
                Some(port_bindings)
            },
            network_mode: Some(if config.network_enabled {
                "bridge".to_string()
            } else {
                "none".to_string()
            }),
            memory: Some(config.memory_mb as i64 * MB),
            // Swap equal to memory disables swap usage
            memory_swap: Some(config.memory_mb as i64 * MB),
            nano_cpus: Some((config.cpu_cores * 1_000_000_000.0) as i64),
            pids_limit: Some(config.pids_limit),
            ulimits: Some(ulimits),
            tmpfs: if tmpfs.is_empty() { None } else { Some(tmpfs) },
            shm_size: config.shm_size_mb.map(|mb| mb as i64 * MB),
            cap_drop: if config.drop_all_capabilities {
                Some(vec!["ALL".to_string()])
            } else {
                None
            },
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            oom_kill_disable: Some(false),
            ..Default::default()
        };

        Config {
            image: Some(config.image.clone()),
            cmd: config.command.clone(),
            env: Some(env),
            working_dir: config.working_dir.clone(),
            labels: Some(config.labels.clone()),
            exposed_ports: if exposed_ports.is_empty() {
                None
            } else {
                Some(exposed_ports)
            },
            network_disabled: Some(!config.network_enabled),
            host_config: Some(host_config),
            ..Default::default()
        }
    }

    /// Convert bollard container status to our status
    fn convert_status(state: &str) -> ContainerStatus {
        match state.to_lowercase().as_str() {
            "created" => ContainerStatus::Created,
            "running" => ContainerStatus::Running,
            "paused" => ContainerStatus::Paused,
            "restarting" => ContainerStatus::Running,
            "removing" => ContainerStatus::Removing,
            "exited" => ContainerStatus::Stopped,
            "dead" => ContainerStatus::Dead,
            _ => ContainerStatus::Error(format!("Unknown status: {}", state)),
        }
    }

    /// Map a daemon error for a container operation onto our error type
    fn container_error(container_id: &str, err: BollardError) -> ProviderError {
        match err {
            BollardError::DockerResponseServerError {
                status_code: 404, ..
            } => ProviderError::NotFound(container_id.to_string()),
            BollardError::DockerResponseServerError {
                status_code: 304 | 409,
                ..
            } => ProviderError::NotRunning(container_id.to_string()),
            other => ProviderError::ContainerError(other.to_string()),
        }
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.client.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(ProviderError::ImageError(e.to_string())),
        }
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.image_cache.read().await.contains_key(image) {
            debug!("Image {} found in cache, skipping pull", image);
            return Ok(());
        }

        if !self.image_exists(image).await? {
            self.pull_image(image).await?;
        }

        self.image_cache
            .write()
            .await
            .insert(image.to_string(), chrono::Utc::now());
        Ok(())
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        info!(
            "Pulling image: {} (timeout: {:?})",
            image, self.pull_timeout
        );

        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };

        let stream = self.client.create_image(Some(options), None, None);

        let result = tokio::time::timeout(self.pull_timeout, async {
            let mut stream = stream;
            let mut last_status = String::new();

            while let Some(result) = stream.next().await {
                let info = result.map_err(|e| {
                    ProviderError::ImageError(format!("Failed to pull image {}: {}", image, e))
                })?;
                if let Some(error) = info.error {
                    return Err(ProviderError::ImageError(format!(
                        "Failed to pull image {}: {}",
                        image, error
                    )));
                }
                if let Some(status) = info.status {
                    if status != last_status {
                        debug!("Pull status: {}", status);
                        last_status = status;
                    }
                }
            }

            Ok(())
        })
        .await;

        match result {
            Ok(Ok(())) => {
                info!("Successfully pulled image: {}", image);
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ProviderError::ImageError(format!(
                "Timeout pulling image {} after {:?}",
                image, self.pull_timeout
            ))),
        }
    }
}

#[async_trait]
impl Provider for DockerProvider {
    async fn ping(&self) -> Result<()> {
        self.client
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| ProviderError::ConnectionError(e.to_string()))
    }

    async fn create_container(&self, config: &ContainerConfig) -> Result<String> {
        info!("Creating container: {}", config.name);

        self.ensure_image(&config.image).await?;

        let options = CreateContainerOptions {
            name: config.name.clone(),
            platform: None,
        };

        let container = self
            .client
            .create_container(Some(options), Self::to_bollard_config(config))
            .await
            .map_err(|e| ProviderError::ContainerError(e.to_string()))?;

        debug!("Created container: {}", container.id);

        if let Err(e) = self
            .client
            .start_container(&container.id, None::<StartContainerOptions<String>>)
            .await
        {
            warn!("Failed to start container {}: {}", container.id, e);
            let _ = self.remove_container(&container.id).await;
            return Err(ProviderError::ContainerError(e.to_string()));
        }

        Ok(container.id)
    }

    async fn kill_container(&self, container_id: &str) -> Result<()> {
        debug!("Killing container: {}", container_id);

        self.client
            .kill_container(container_id, Some(KillContainerOptions { signal: "SIGKILL" }))
            .await
            .map_err(|e| Self::container_error(container_id, e))
    }

    async fn remove_container(&self, container_id: &str) -> Result<()> {
        info!("Removing container: {}", container_id);

        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        self.client
            .remove_container(container_id, Some(options))
            .await
            .map_err(|e| Self::container_error(container_id, e))
    }

    async fn inspect_container(&self, container_id: &str) -> Result<ContainerStatus> {
        let inspect = self
            .client
            .inspect_container(container_id, None)
            .await
            .map_err(|e| Self::container_error(container_id, e))?;

        let state = inspect.state.as_ref().ok_or_else(|| {
            ProviderError::ContainerError("Container has no state information".to_string())
        })?;

        Ok(Self::convert_status(
            state
                .status
                .as_ref()
                .map(|s| s.as_ref())
                .unwrap_or("unknown"),
        ))
    }

    async fn list_labeled(&self, label: &str) -> Result<Vec<String>> {
        let filters = HashMap::from([("label".to_string(), vec![label.to_string()])]);

        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| ProviderError::ContainerError(e.to_string()))?;

        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }

    async fn exec_attach(
        &self,
        container_id: &str,
        command: Vec<String>,
        working_dir: Option<String>,
    ) -> Result<ExecAttachment> {
        debug!(
            "Executing command in container {}: {:?}",
            container_id, command
        );

        let exec_config = CreateExecOptions {
            cmd: Some(command),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            working_dir,
            ..Default::default()
        };

        let exec = self
            .client
            .create_exec(container_id, exec_config)
            .await
            .map_err(|e| match Self::container_error(container_id, e) {
                ProviderError::ContainerError(msg) => ProviderError::ExecError(msg),
                other => other,
            })?;

        let start_result = self
            .client
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| ProviderError::ExecError(e.to_string()))?;

        match start_result {
            StartExecResults::Attached { output, .. } => {
                // bollard decodes the 8-byte multiplexed frame headers for us
                let output = output
                    .filter_map(|msg| {
                        future::ready(match msg {
                            Ok(LogOutput::StdOut { message })
                            | Ok(LogOutput::Console { message }) => {
                                Some(Ok(OutputChunk::stdout(message.to_vec())))
                            }
                            Ok(LogOutput::StdErr { message }) => {
                                Some(Ok(OutputChunk::stderr(message.to_vec())))
                            }
                            Ok(LogOutput::StdIn { .. }) => None,
                            Err(e) => Some(Err(ProviderError::ExecError(e.to_string()))),
                        })
                    })
                    .boxed();

                Ok(ExecAttachment {
                    exec_id: exec.id,
                    output,
                })
            }
            StartExecResults::Detached => Err(ProviderError::ExecError(
                "Exec was detached unexpectedly".to_string(),
            )),
        }
    }

    async fn exec_exit_code(&self, exec_id: &str) -> Result<Option<i64>> {
        let inspect = self
            .client
            .inspect_exec(exec_id)
            .await
            .map_err(|e| ProviderError::ExecError(e.to_string()))?;

        if inspect.running.unwrap_or(false) {
            return Ok(None);
        }
        Ok(inspect.exit_code)
    }

    async fn memory_usage_mb(&self, container_id: &str) -> Result<u64> {
        let options = StatsOptions {
            stream: false,
            one_shot: true,
        };

        let mut stats_stream = self.client.stats(container_id, Some(options));

        match stats_stream.next().await {
            Some(Ok(stats)) => Ok(stats.memory_stats.usage.unwrap_or(0) / (1024 * 1024)),
            Some(Err(e)) => Err(Self::container_error(container_id, e)),
            None => Err(ProviderError::ContainerError(
                "Failed to get container stats".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{PortMapping, VolumeMount};

    fn execution_config() -> ContainerConfig {
        ContainerConfig {
            image: "sandcastle/execution:latest".to_string(),
            name: "sandcastle-test".to_string(),
            env_vars: HashMap::from([("FOO".to_string(), "bar".to_string())]),
            volumes: vec![VolumeMount {
                host_path: "/tmp/host".to_string(),
                container_path: "/workspace".to_string(),
                readonly: false,
            }],
            ports: vec![],
            cpu_cores: 0.5,
            memory_mb: 512,
            pids_limit: 128,
            nofile: 1024,
            nproc: 128,
            tmpfs: HashMap::from([("/tmp".to_string(), 64)]),
            shm_size_mb: None,
            network_enabled: false,
            drop_all_capabilities: true,
            command: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            working_dir: Some("/workspace".to_string()),
            labels: HashMap::from([("sandcastle.managed".to_string(), "true".to_string())]),
        }
    }

    #[test]
    fn test_isolated_container_config() {
        let bollard_config = DockerProvider::to_bollard_config(&execution_config());
        let host = bollard_config.host_config.unwrap();

        assert_eq!(host.network_mode.as_deref(), Some("none"));
        assert_eq!(host.memory, Some(512 * MB));
        assert_eq!(host.nano_cpus, Some(500_000_000));
        assert_eq!(host.pids_limit, Some(128));
        assert_eq!(host.cap_drop, Some(vec!["ALL".to_string()]));
        assert_eq!(
            host.security_opt,
            Some(vec!["no-new-privileges:true".to_string()])
        );
        assert_eq!(
            host.binds,
            Some(vec!["/tmp/host:/workspace:rw".to_string()])
        );
        assert!(host.port_bindings.is_none());
        assert_eq!(
            host.tmpfs.unwrap().get("/tmp").map(String::as_str),
            Some("rw,noexec,nosuid,size=64m")
        );
        assert_eq!(bollard_config.network_disabled, Some(true));
    }

    #[test]
    fn test_published_port_config() {
        let mut config = execution_config();
        config.network_enabled = true;
        config.shm_size_mb = Some(2048);
        config.ports = vec![PortMapping {
            host_port: 9301,
            container_port: 9222,
            protocol: "tcp".to_string(),
        }];

        let bollard_config = DockerProvider::to_bollard_config(&config);
        let host = bollard_config.host_config.unwrap();

        assert_eq!(host.network_mode.as_deref(), Some("bridge"));
        assert_eq!(host.shm_size, Some(2048 * MB));
        let bindings = host.port_bindings.unwrap();
        let binding = bindings["9222/tcp"].as_ref().unwrap();
        assert_eq!(binding[0].host_port.as_deref(), Some("9301"));
        assert!(bollard_config.exposed_ports.unwrap().contains_key("9222/tcp"));
    }

    #[test]
    fn test_container_error_mapping() {
        let not_found = BollardError::DockerResponseServerError {
            status_code: 404,
            message: "no such container".to_string(),
        };
        assert!(matches!(
            DockerProvider::container_error("abc", not_found),
            ProviderError::NotFound(_)
        ));

        let conflict = BollardError::DockerResponseServerError {
            status_code: 409,
            message: "is not running".to_string(),
        };
        assert!(DockerProvider::container_error("abc", conflict).is_already_gone());
    }

    #[test]
    fn test_convert_status() {
        assert!(DockerProvider::convert_status("running").is_running());
        assert_eq!(
            DockerProvider::convert_status("exited"),
            ContainerStatus::Stopped
        );
    }
}
