// ABOUTME: Sandbox service wiring the gate, registry, controller, pool and scheduler together
// ABOUTME: Exposes the session and execution operations consumed by the transport layer

use crate::controller::{ReclaimReport, SandboxController, SandboxOptions};
use crate::error::{Result, SandboxError};
use crate::pool::PoolManager;
use crate::ports::PortAllocator;
use crate::providers::Provider;
use crate::scheduler::ExecutionScheduler;
use crate::security::SecurityGate;
use crate::sessions::{NewSession, SessionRegistry, SessionStore};
use crate::settings::SandboxSettings;
use crate::types::{
    CreateSessionParams, DestroyOutcome, ExecutionRequest, ExecutionResult, SandboxHandle,
    Session, SessionPatch, SessionStatus, SessionType,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Smallest memory override accepted for a session
const MIN_MEMORY_MB: u64 = 64;

/// A sandbox whose removal the runtime has not confirmed yet
#[derive(Debug, Clone)]
enum Teardown {
    Sandbox(SandboxHandle),
    /// Known only by container id, e.g. from a record written by another process
    Container(String),
}

pub struct SandboxService {
    settings: Arc<SandboxSettings>,
    registry: Arc<SessionRegistry>,
    gate: SecurityGate,
    controller: Arc<SandboxController>,
    pool: Arc<PoolManager>,
    scheduler: ExecutionScheduler,
    /// Session id to the sandbox it holds
    sandboxes: Mutex<HashMap<String, SandboxHandle>>,
    /// Failed teardowns keyed by session id, retried by destroy and the sweeper
    pending_teardowns: Mutex<Vec<(String, Teardown)>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SandboxService {
    pub fn new(
        provider: Arc<dyn Provider>,
        store: Option<Arc<dyn SessionStore>>,
        settings: SandboxSettings,
    ) -> Self {
        let settings = Arc::new(settings);
        let ports = Arc::new(PortAllocator::new(Duration::from_secs(
            settings.ports.reservation_secs,
        )));
        let controller = Arc::new(SandboxController::new(
            provider,
            ports,
            Arc::clone(&settings),
        ));
        let pool = Arc::new(PoolManager::new(Arc::clone(&controller), &settings.pool));
        let scheduler = ExecutionScheduler::new(Arc::clone(&controller), Arc::clone(&settings));

        Self {
            registry: Arc::new(SessionRegistry::new(store, settings.session_ttl())),
            gate: SecurityGate::new(&settings),
            controller,
            pool,
            scheduler,
            sandboxes: Mutex::new(HashMap::new()),
            pending_teardowns: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            settings,
        }
    }

    pub fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    pub fn pool(&self) -> &Arc<PoolManager> {
        &self.pool
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn controller(&self) -> &Arc<SandboxController> {
        &self.controller
    }

    fn sandboxes(&self) -> MutexGuard<'_, HashMap<String, SandboxHandle>> {
        self.sandboxes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pending_teardowns(&self) -> MutexGuard<'_, Vec<(String, Teardown)>> {
        self.pending_teardowns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove a sandbox, queueing it for retry when the runtime call fails
    async fn teardown(&self, session_id: &str, teardown: Teardown) -> Result<()> {
        let result = match &teardown {
            Teardown::Sandbox(handle) => self.controller.destroy_sandbox(handle).await,
            Teardown::Container(container_id) => {
                self.controller.destroy_container(container_id).await
            }
        };

        if let Err(e) = &result {
            warn!(session_id = %session_id, "Sandbox teardown failed, will retry: {}", e);
            self.pending_teardowns().push((session_id.to_string(), teardown));
        }
        result
    }

    fn take_pending_teardowns(&self, session_id: &str) -> Vec<Teardown> {
        let mut pending = self.pending_teardowns();
        let (taken, kept): (Vec<_>, Vec<_>) = pending
            .drain(..)
            .partition(|(owner, _)| owner == session_id);
        *pending = kept;
        taken.into_iter().map(|(_, teardown)| teardown).collect()
    }

    /// Retry every queued teardown, returning how many the runtime confirmed
    pub async fn retry_pending_teardowns(&self) -> usize {
        let pending: Vec<(String, Teardown)> = self.pending_teardowns().drain(..).collect();

        let mut completed = 0;
        for (session_id, teardown) in pending {
            if self.teardown(&session_id, teardown).await.is_ok() {
                completed += 1;
            }
        }
        completed
    }

    /// Teardowns still waiting for the runtime to confirm removal
    pub fn pending_teardown_count(&self) -> usize {
        self.pending_teardowns().len()
    }

    /// Bring the core up: verify the runtime, reclaim orphans, warm the pools and
    /// start background maintenance. An unreachable runtime is fatal.
    pub async fn start(self: &Arc<Self>) -> Result<ReclaimReport> {
        if let Err(e) = self.controller.provider().ping().await {
            error!("Container runtime unreachable: {}", e);
            return Err(SandboxError::Provider(e));
        }

        let report = match self.controller.reclaim_orphans().await {
            Ok(report) => report,
            Err(e) => {
                warn!("Orphan reclamation failed: {}", e);
                ReclaimReport::default()
            }
        };

        self.pool.initialize().await;

        let maintenance = self
            .pool
            .spawn_maintenance(self.settings.pool_maintain_interval());
        let sweeper = self.spawn_sweeper(self.settings.sweep_interval());
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([maintenance, sweeper]);

        info!("Sandbox service started");
        Ok(report)
    }

    fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                service.sweep_expired().await;
            }
        })
    }

    /// Stop background tasks, refuse new executions and destroy every sandbox
    pub async fn shutdown(&self) {
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }

        self.scheduler.close();

        self.retry_pending_teardowns().await;

        let active: Vec<(String, SandboxHandle)> = self.sandboxes().drain().collect();
        for (session_id, handle) in &active {
            if let Err(e) = self
                .teardown(session_id, Teardown::Sandbox(handle.clone()))
                .await
            {
                warn!(sandbox_id = %handle.id, "Failed to destroy sandbox on shutdown: {}", e);
            }
        }

        let pooled = self.pool.drain().await;
        info!(
            "Sandbox service stopped ({} active, {} pooled sandboxes destroyed)",
            active.len(),
            pooled
        );
    }

    pub async fn create_session(&self, params: CreateSessionParams) -> Result<Session> {
        let params = self.sanitize(params)?;

        if params.client_id.trim().is_empty() {
            return Err(SandboxError::Validation("clientId is required".to_string()));
        }
        if let Some(memory_mb) = params.memory_mb {
            if memory_mb < MIN_MEMORY_MB {
                return Err(SandboxError::Validation(format!(
                    "memory must be at least {}MB",
                    MIN_MEMORY_MB
                )));
            }
        }

        let language = self.session_language(params.session_type, params.language.as_deref())?;
        let profile = self.settings.profiles.for_type(params.session_type);

        let session = self
            .registry
            .create(NewSession {
                session_type: params.session_type,
                language,
                memory_mb: params.memory_mb.unwrap_or(profile.memory_mb),
                client_id: params.client_id,
            })
            .await;

        match self.attach_sandbox(&session, params.memory_mb).await {
            Ok(session) => Ok(session),
            Err(e) => {
                warn!(session_id = %session.id, "Session creation failed: {}", e);
                let _ = self
                    .registry
                    .update(&session.id, SessionPatch::status(SessionStatus::Error))
                    .await;
                self.registry.destroy(&session.id).await;
                Err(e)
            }
        }
    }

    fn sanitize(&self, params: CreateSessionParams) -> Result<CreateSessionParams> {
        let value = serde_json::to_value(&params)
            .map_err(|e| SandboxError::Validation(format!("invalid parameters: {}", e)))?;
        serde_json::from_value(self.gate.sanitize_params(value))
            .map_err(|e| SandboxError::Validation(format!("invalid parameters: {}", e)))
    }

    fn session_language(&self, session_type: SessionType, language: Option<&str>) -> Result<String> {
        match (session_type, language) {
            (SessionType::Execution, language) => {
                let requested = language.unwrap_or("python");
                self.settings
                    .language(requested)
                    .map(|spec| spec.name.clone())
                    .ok_or_else(|| {
                        SandboxError::Validation(format!("unsupported language: {}", requested))
                    })
            }
            (_, Some(language)) => Ok(language.trim().to_lowercase()),
            (SessionType::Ide, None) => Ok("typescript".to_string()),
            (SessionType::BrowserAutomation, None) => Ok("javascript".to_string()),
        }
    }

    /// Bind a pooled or fresh sandbox to a `creating` session and mark it ready
    async fn attach_sandbox(&self, session: &Session, memory_mb: Option<u64>) -> Result<Session> {
        let pooled = match memory_mb {
            None => self.pool.acquire(session.session_type),
            Some(_) => None,
        };

        let handle = match pooled {
            Some(handle) => handle,
            None => {
                self.controller
                    .create_sandbox(
                        session.session_type,
                        SandboxOptions {
                            session_id: Some(session.id.clone()),
                            memory_mb,
                        },
                    )
                    .await?
            }
        };

        let patch = SessionPatch {
            status: Some(SessionStatus::Ready),
            container_id: Some(Some(handle.container_id.clone())),
            endpoints: Some(handle.endpoints.clone()),
        };

        match self.registry.update(&session.id, patch).await {
            Ok(ready) => {
                self.sandboxes().insert(session.id.clone(), handle);
                debug!(session_id = %session.id, "Session ready");
                Ok(ready)
            }
            Err(e) => {
                // Destroyed while the sandbox was being created
                let _ = self.teardown(&session.id, Teardown::Sandbox(handle)).await;
                Err(e)
            }
        }
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Session> {
        self.registry.get(session_id).await
    }

    pub async fn list_sessions(&self, owner: Option<&str>) -> Vec<Session> {
        self.registry.list(owner).await
    }

    /// Destroy a session and its sandbox. Repeated calls report `AlreadyGone`
    /// once the runtime has confirmed the sandbox is removed; until then they
    /// retry the teardown.
    pub async fn destroy_session(&self, session_id: &str) -> Result<DestroyOutcome> {
        let removed = self.registry.destroy(session_id).await;
        let handle = self.sandboxes().remove(session_id);

        let mut teardowns = self.take_pending_teardowns(session_id);
        match (handle, removed.as_ref().and_then(|s| s.container_id.clone())) {
            (Some(handle), _) => teardowns.push(Teardown::Sandbox(handle)),
            (None, Some(container_id)) => teardowns.push(Teardown::Container(container_id)),
            (None, None) => {}
        }

        if removed.is_none() && teardowns.is_empty() {
            debug!(session_id = %session_id, "Destroy on missing session");
            return Ok(DestroyOutcome::AlreadyGone);
        }

        let mut failure = None;
        for teardown in teardowns {
            if let Err(e) = self.teardown(session_id, teardown).await {
                if failure.is_none() {
                    failure = Some(e);
                }
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }

        info!(session_id = %session_id, "Destroyed session");
        Ok(DestroyOutcome::Destroyed)
    }

    /// Rebuild the sandbox of a session in `error` state
    pub async fn recover_session(&self, session_id: &str) -> Result<Session> {
        let session = self.registry.get(session_id).await?;
        if session.status != SessionStatus::Error {
            return Ok(session);
        }

        let session = self
            .registry
            .update(session_id, SessionPatch::status(SessionStatus::Creating))
            .await?;

        let stale = self.sandboxes().remove(session_id);
        if let Some(handle) = stale {
            let _ = self.teardown(session_id, Teardown::Sandbox(handle)).await;
        }

        let profile_memory = self.settings.profiles.for_type(session.session_type).memory_mb;
        let memory_override = (session.memory_mb != profile_memory).then_some(session.memory_mb);

        match self.attach_sandbox(&session, memory_override).await {
            Ok(session) => {
                info!(session_id = %session_id, "Recovered session");
                Ok(session)
            }
            Err(e) => {
                let _ = self
                    .registry
                    .update(session_id, SessionPatch::status(SessionStatus::Error))
                    .await;
                Err(e)
            }
        }
    }

    /// Run code for `client_id` in the session named by the request
    pub async fn execute_code(
        &self,
        client_id: &str,
        request: ExecutionRequest,
    ) -> Result<ExecutionResult> {
        self.gate.check_rate_limit(client_id)?;

        let language = self
            .settings
            .language(&request.language)
            .ok_or_else(|| {
                SandboxError::Validation(format!("unsupported language: {}", request.language))
            })?
            .clone();
        self.gate.validate_code(&language.name, &request.code)?;

        let mut session = self.registry.get(&request.session_id).await?;
        if session.client_id != client_id {
            return Err(SandboxError::SessionNotFound(request.session_id.clone()));
        }
        if session.session_type != SessionType::Execution {
            return Err(SandboxError::Validation(format!(
                "session {} is a {} session and cannot run code",
                session.id, session.session_type
            )));
        }
        if session.status == SessionStatus::Error {
            session = self.recover_session(&session.id).await?;
        }

        // Fails with an invalid transition if another execution holds the session
        self.registry
            .update(&session.id, SessionPatch::status(SessionStatus::Busy))
            .await?;

        let handle = self.sandboxes().get(&session.id).cloned();
        let Some(handle) = handle else {
            self.finish_execution(&session.id, SessionStatus::Error).await;
            return Err(SandboxError::SandboxNotFound(session.id.clone()));
        };

        let outcome = self.scheduler.execute(&handle, &language, &request).await;

        // An aborted stream can leave the process running in the sandbox, so
        // timeouts and output overruns also send the session to recovery
        let next = match &outcome {
            Err(SandboxError::Runtime(_))
            | Err(SandboxError::Provider(_))
            | Err(SandboxError::Io(_))
            | Err(SandboxError::Timeout { .. })
            | Err(SandboxError::OutputLimit { .. }) => SessionStatus::Error,
            _ => SessionStatus::Ready,
        };
        self.finish_execution(&session.id, next).await;

        outcome
    }

    async fn finish_execution(&self, session_id: &str, next: SessionStatus) {
        if let Err(e) = self
            .registry
            .update(session_id, SessionPatch::status(next))
            .await
        {
            // The session may have been destroyed mid-execution
            debug!(session_id = %session_id, "Could not mark session {}: {}", next, e);
        }
    }

    pub async fn create_vscode_session(&self, client_id: &str) -> Result<Session> {
        self.create_session(CreateSessionParams::new(SessionType::Ide, client_id))
            .await
    }

    pub async fn get_vscode_url(&self, session_id: &str) -> Result<String> {
        self.endpoint(session_id, SessionType::Ide, "vscode").await
    }

    pub async fn create_playwright_session(&self, client_id: &str) -> Result<Session> {
        self.create_session(CreateSessionParams::new(
            SessionType::BrowserAutomation,
            client_id,
        ))
        .await
    }

    pub async fn get_playwright_endpoint(&self, session_id: &str) -> Result<String> {
        self.endpoint(session_id, SessionType::BrowserAutomation, "playwright")
            .await
    }

    async fn endpoint(&self, session_id: &str, expected: SessionType, name: &str) -> Result<String> {
        let session = self.registry.get(session_id).await?;
        if session.session_type != expected {
            return Err(SandboxError::Validation(format!(
                "session {} is not a {} session",
                session_id, expected
            )));
        }

        // Endpoints of a session being recreated point at a dead sandbox
        if !session.status.holds_sandbox() {
            return Err(SandboxError::SandboxNotFound(session_id.to_string()));
        }

        session
            .endpoints
            .get(name)
            .cloned()
            .ok_or_else(|| SandboxError::SandboxNotFound(session_id.to_string()))
    }

    /// Destroy sessions idle past the TTL together with their sandboxes, and
    /// retry teardowns that failed earlier
    pub async fn sweep_expired(&self) -> usize {
        let retried = self.retry_pending_teardowns().await;
        if retried > 0 {
            info!("Completed {} pending sandbox teardowns", retried);
        }

        let expired = self.registry.sweep_expired(self.settings.session_ttl()).await;

        for session in &expired {
            let handle = self.sandboxes().remove(&session.id);
            let teardown = match (handle, session.container_id.clone()) {
                (Some(handle), _) => Teardown::Sandbox(handle),
                (None, Some(container_id)) => Teardown::Container(container_id),
                (None, None) => continue,
            };
            // A failure is queued and retried by the next sweep
            let _ = self.teardown(&session.id, teardown).await;
        }

        self.gate.prune();
        expired.len()
    }

    /// Sandboxes currently bound to sessions in this process
    pub fn active_sandboxes(&self) -> usize {
        self.sandboxes().len()
    }
}
