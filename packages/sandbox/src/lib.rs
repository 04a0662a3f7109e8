// ABOUTME: Multi-tenant sandbox orchestration core
// ABOUTME: Pools container sandboxes, schedules code execution and tracks session lifecycle

pub mod controller;
pub mod error;
pub mod pool;
pub mod ports;
pub mod providers;
pub mod scheduler;
pub mod security;
pub mod service;
pub mod sessions;
pub mod settings;
pub mod types;

pub use controller::{ReclaimReport, SandboxController, SandboxOptions, WORKSPACE_MOUNT};
pub use error::{ErrorKind, Result, SandboxError};
pub use pool::PoolManager;
pub use ports::{PortAllocator, PortRange};
pub use providers::{DockerProvider, Provider, ProviderError};
pub use scheduler::ExecutionScheduler;
pub use security::{PatternClass, SecurityGate};
pub use service::SandboxService;
pub use sessions::{SessionRegistry, SessionStore, SqliteSessionStore, StoreError};
pub use settings::{ConfigError, LanguageSpec, SandboxSettings};
pub use types::{
    CreateSessionParams, DestroyOutcome, ExecutionRequest, ExecutionResult, NetworkMode,
    ResourceLimits, SandboxHandle, Session, SessionPatch, SessionStatus, SessionType,
};
