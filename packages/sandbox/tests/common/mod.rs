// ABOUTME: In-process container runtime used by the integration tests
// ABOUTME: Tracks containers and labels, reads code from the bound workspace and scripts exec output

#![allow(dead_code)]

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use sandcastle_sandbox::providers::{
    ContainerConfig, ContainerStatus, ExecAttachment, OutputChunk, Provider, ProviderError,
    Result,
};
use sandcastle_sandbox::{SandboxSettings, WORKSPACE_MOUNT};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Scripted behaviour of one exec
#[derive(Debug, Clone, Default)]
pub struct FakeRun {
    pub chunks: Vec<OutputChunk>,
    pub exit_code: i64,
    /// Delay before the first chunk
    pub delay: Duration,
    /// Keep the stream open forever after the chunks
    pub hang: bool,
    /// End the stream with a runtime error
    pub fail: bool,
}

impl FakeRun {
    pub fn stdout(text: &str) -> Self {
        Self {
            chunks: vec![OutputChunk::stdout(text)],
            ..Default::default()
        }
    }

    pub fn chunks(chunks: Vec<OutputChunk>) -> Self {
        Self {
            chunks,
            ..Default::default()
        }
    }

    pub fn exit(mut self, code: i64) -> Self {
        self.exit_code = code;
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }
}

type Responder = Arc<dyn Fn(&str) -> FakeRun + Send + Sync>;

struct FakeContainer {
    config: ContainerConfig,
    running: bool,
}

/// Decrements the active exec count when the output stream is dropped
struct ActiveGuard {
    active: Arc<AtomicUsize>,
}

impl ActiveGuard {
    fn new(active: Arc<AtomicUsize>, max_active: &AtomicUsize) -> Self {
        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
        max_active.fetch_max(now, Ordering::SeqCst);
        Self { active }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct FakeProvider {
    containers: Mutex<HashMap<String, FakeContainer>>,
    execs: Mutex<HashMap<String, i64>>,
    responder: Mutex<Responder>,
    next_id: AtomicUsize,
    created: AtomicUsize,
    exec_count: AtomicUsize,
    fail_creates: AtomicBool,
    reachable: AtomicBool,
    /// Kills left to fail before the runtime recovers
    kill_failures: AtomicUsize,
    inspect_delay: Mutex<Duration>,
    fail_inspects: AtomicBool,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self {
            containers: Mutex::new(HashMap::new()),
            execs: Mutex::new(HashMap::new()),
            responder: Mutex::new(Arc::new(|_| FakeRun::stdout("ok\n"))),
            next_id: AtomicUsize::new(1),
            created: AtomicUsize::new(0),
            exec_count: AtomicUsize::new(0),
            fail_creates: AtomicBool::new(false),
            reachable: AtomicBool::new(true),
            kill_failures: AtomicUsize::new(0),
            inspect_delay: Mutex::new(Duration::ZERO),
            fail_inspects: AtomicBool::new(false),
            active: Arc::new(AtomicUsize::new(0)),
            max_active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Script exec output from the submitted code
    pub fn respond_with<F>(&self, responder: F)
    where
        F: Fn(&str) -> FakeRun + Send + Sync + 'static,
    {
        *self.responder.lock().unwrap() = Arc::new(responder);
    }

    pub fn set_fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Make the next `count` kills fail as if the daemon were busy
    pub fn fail_next_kills(&self, count: usize) {
        self.kill_failures.store(count, Ordering::SeqCst);
    }

    /// Slow every inspect down by `delay`, optionally ending it with an error
    pub fn set_inspect_behaviour(&self, delay: Duration, fail: bool) {
        *self.inspect_delay.lock().unwrap() = delay;
        self.fail_inspects.store(fail, Ordering::SeqCst);
    }

    /// Containers ever created through `create_container`
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Containers currently known to the runtime
    pub fn live(&self) -> usize {
        self.containers.lock().unwrap().len()
    }

    pub fn exists(&self, container_id: &str) -> bool {
        self.containers.lock().unwrap().contains_key(container_id)
    }

    pub fn exec_count(&self) -> usize {
        self.exec_count.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn config_of(&self, container_id: &str) -> Option<ContainerConfig> {
        self.containers
            .lock()
            .unwrap()
            .get(container_id)
            .map(|c| c.config.clone())
    }

    /// Ids of containers carrying `label` (`key=value`), sorted
    pub fn list_labeled_sync(&self, label: &str) -> Vec<String> {
        let (key, value) = label.split_once('=').unwrap_or((label, ""));
        let mut ids: Vec<String> = self
            .containers
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, c)| c.config.labels.get(key).map(String::as_str) == Some(value))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Simulate a container that died on its own
    pub fn stop(&self, container_id: &str) {
        if let Some(container) = self.containers.lock().unwrap().get_mut(container_id) {
            container.running = false;
        }
    }

    /// Register a container left behind by an earlier process
    pub fn seed_container(&self, labels: &[(&str, &str)]) -> String {
        let id = self.next_container_id();
        let config = ContainerConfig {
            image: "leftover:latest".to_string(),
            name: format!("leftover-{}", id),
            env_vars: HashMap::new(),
            volumes: Vec::new(),
            ports: Vec::new(),
            cpu_cores: 1.0,
            memory_mb: 512,
            pids_limit: 64,
            nofile: 1024,
            nproc: 64,
            tmpfs: HashMap::new(),
            shm_size_mb: None,
            network_enabled: false,
            drop_all_capabilities: true,
            command: None,
            working_dir: None,
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        };
        self.containers.lock().unwrap().insert(
            id.clone(),
            FakeContainer {
                config,
                running: false,
            },
        );
        id
    }

    fn next_container_id(&self) -> String {
        format!("fake-{:04}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Map a container path under the workspace mount back to the host bind source
    fn read_code(config: &ContainerConfig, command: &[String]) -> String {
        let prefix = format!("{}/", WORKSPACE_MOUNT);
        let Some(file) = command.iter().find_map(|arg| arg.strip_prefix(&prefix)) else {
            return String::new();
        };
        let Some(mount) = config
            .volumes
            .iter()
            .find(|v| v.container_path == WORKSPACE_MOUNT)
        else {
            return String::new();
        };
        std::fs::read_to_string(Path::new(&mount.host_path).join(file)).unwrap_or_default()
    }
}

#[async_trait]
impl Provider for FakeProvider {
    async fn ping(&self) -> Result<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ProviderError::ConnectionError(
                "cannot reach container runtime".to_string(),
            ))
        }
    }

    async fn create_container(&self, config: &ContainerConfig) -> Result<String> {
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(ProviderError::ImageError(format!(
                "image {} unavailable",
                config.image
            )));
        }

        let id = self.next_container_id();
        self.created.fetch_add(1, Ordering::SeqCst);
        self.containers.lock().unwrap().insert(
            id.clone(),
            FakeContainer {
                config: config.clone(),
                running: true,
            },
        );
        Ok(id)
    }

    async fn kill_container(&self, container_id: &str) -> Result<()> {
        let failing = self
            .kill_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ProviderError::ConnectionError("daemon busy".to_string()));
        }

        let mut containers = self.containers.lock().unwrap();
        match containers.get_mut(container_id) {
            Some(container) if container.running => {
                container.running = false;
                Ok(())
            }
            Some(_) => Err(ProviderError::NotRunning(container_id.to_string())),
            None => Err(ProviderError::NotFound(container_id.to_string())),
        }
    }

    async fn remove_container(&self, container_id: &str) -> Result<()> {
        match self.containers.lock().unwrap().remove(container_id) {
            Some(_) => Ok(()),
            None => Err(ProviderError::NotFound(container_id.to_string())),
        }
    }

    async fn inspect_container(&self, container_id: &str) -> Result<ContainerStatus> {
        let delay = *self.inspect_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_inspects.load(Ordering::SeqCst) {
            return Err(ProviderError::ConnectionError("inspect timed out".to_string()));
        }

        match self.containers.lock().unwrap().get(container_id) {
            Some(c) if c.running => Ok(ContainerStatus::Running),
            Some(_) => Ok(ContainerStatus::Stopped),
            None => Err(ProviderError::NotFound(container_id.to_string())),
        }
    }

    async fn list_labeled(&self, label: &str) -> Result<Vec<String>> {
        Ok(self.list_labeled_sync(label))
    }

    async fn exec_attach(
        &self,
        container_id: &str,
        command: Vec<String>,
        _working_dir: Option<String>,
    ) -> Result<ExecAttachment> {
        let code = {
            let containers = self.containers.lock().unwrap();
            match containers.get(container_id) {
                Some(c) if c.running => Self::read_code(&c.config, &command),
                Some(_) => return Err(ProviderError::NotRunning(container_id.to_string())),
                None => return Err(ProviderError::NotFound(container_id.to_string())),
            }
        };

        let responder = self.responder.lock().unwrap().clone();
        let run = responder(&code);

        self.exec_count.fetch_add(1, Ordering::SeqCst);
        let exec_id = format!("exec-{}", self.exec_count.load(Ordering::SeqCst));
        self.execs
            .lock()
            .unwrap()
            .insert(exec_id.clone(), run.exit_code);

        let guard = ActiveGuard::new(Arc::clone(&self.active), &self.max_active);
        let delay = run.delay;

        let body = stream::once(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            None
        })
        .chain(stream::iter(run.chunks.into_iter().map(|c| Some(Ok(c)))))
        .filter_map(|item| async move { item });

        let output = match (run.hang, run.fail) {
            (true, _) => body.chain(stream::pending()).boxed(),
            (false, true) => body
                .chain(stream::once(async {
                    Err(ProviderError::ExecError("exec connection reset".to_string()))
                }))
                .boxed(),
            (false, false) => body.boxed(),
        };

        let output = output
            .map(move |item| {
                let _active = &guard;
                item
            })
            .boxed();

        Ok(ExecAttachment { exec_id, output })
    }

    async fn exec_exit_code(&self, exec_id: &str) -> Result<Option<i64>> {
        Ok(self.execs.lock().unwrap().get(exec_id).copied())
    }

    async fn memory_usage_mb(&self, container_id: &str) -> Result<u64> {
        if self.exists(container_id) {
            Ok(42)
        } else {
            Err(ProviderError::NotFound(container_id.to_string()))
        }
    }
}

/// Settings with empty pools, writing workspaces under `workspace_root`
pub fn test_settings(workspace_root: &Path) -> SandboxSettings {
    let mut settings = SandboxSettings::default();
    settings.pool.execution_target = 0;
    settings.pool.ide_target = 0;
    settings.pool.browser_target = 0;
    settings.runtime.workspace_root = workspace_root.to_path_buf();
    settings.sessions.database_url = String::new();
    settings
}

/// Poll `check` until it holds or `within` elapses
pub async fn eventually<F>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
