// ABOUTME: Core type definitions for sandbox sessions and code execution
// ABOUTME: Defines sessions, sandbox handles, execution requests/results and the session state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Kind of sandbox a session runs in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionType {
    /// Language runtimes for one-shot code execution
    Execution,
    /// Browser-based IDE (code-server)
    Ide,
    /// Headless browser driven over a remote automation protocol
    BrowserAutomation,
}

impl SessionType {
    pub const ALL: [SessionType; 3] = [
        SessionType::Execution,
        SessionType::Ide,
        SessionType::BrowserAutomation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionType::Execution => "execution",
            SessionType::Ide => "ide",
            SessionType::BrowserAutomation => "browser-automation",
        }
    }

    /// Whether sandboxes of this type publish a network endpoint
    pub fn exposes_port(&self) -> bool {
        !matches!(self, SessionType::Execution)
    }
}

impl fmt::Display for SessionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "execution" => Ok(SessionType::Execution),
            "ide" | "vscode" => Ok(SessionType::Ide),
            "browser-automation" | "browser" | "playwright" => Ok(SessionType::BrowserAutomation),
            other => Err(format!("unknown session type: {}", other)),
        }
    }
}

/// Session lifecycle status
///
/// `creating → ready ⇄ busy → destroyed`, with `error` reachable from
/// `creating` or `busy`. From `error` a session is either recreated or destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Creating,
    Ready,
    Busy,
    Error,
    Destroyed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Creating => "creating",
            SessionStatus::Ready => "ready",
            SessionStatus::Busy => "busy",
            SessionStatus::Error => "error",
            SessionStatus::Destroyed => "destroyed",
        }
    }

    /// Check whether moving from `self` to `next` is a valid transition
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Creating, Ready)
                | (Creating, Error)
                | (Creating, Destroyed)
                | (Ready, Busy)
                | (Ready, Destroyed)
                | (Busy, Ready)
                | (Busy, Error)
                | (Busy, Destroyed)
                | (Error, Creating)
                | (Error, Destroyed)
        )
    }

    /// Whether a session in this status holds a sandbox
    pub fn holds_sandbox(&self) -> bool {
        matches!(self, SessionStatus::Ready | SessionStatus::Busy)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A logical unit of sandboxed work, bound to at most one sandbox at a time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    #[serde(rename = "type")]
    pub session_type: SessionType,
    pub language: String,
    pub status: SessionStatus,
    /// Memory limit of the bound sandbox in megabytes
    #[serde(rename = "memory")]
    pub memory_mb: u64,
    pub endpoints: BTreeMap<String, String>,
    pub client_id: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
}

/// Partial update applied by `SessionRegistry::update`
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub status: Option<SessionStatus>,
    /// `Some(None)` clears the container reference
    pub container_id: Option<Option<String>>,
    pub endpoints: Option<BTreeMap<String, String>>,
}

impl SessionPatch {
    pub fn status(status: SessionStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

/// Parameters accepted by `SandboxService::create_session`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionParams {
    #[serde(rename = "type")]
    pub session_type: SessionType,
    #[serde(default)]
    pub language: Option<String>,
    /// Overrides the profile memory; sessions with an override never use the pool
    #[serde(default)]
    pub memory_mb: Option<u64>,
    pub client_id: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl CreateSessionParams {
    pub fn new(session_type: SessionType, client_id: impl Into<String>) -> Self {
        Self {
            session_type,
            language: None,
            memory_mb: None,
            client_id: client_id.into(),
            metadata: None,
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_memory_mb(mut self, memory_mb: u64) -> Self {
        self.memory_mb = Some(memory_mb);
        self
    }
}

/// Outcome of an idempotent destroy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestroyOutcome {
    Destroyed,
    AlreadyGone,
}

/// Network exposure of a sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// No network interface besides loopback
    None,
    /// Bridged network with one published service port
    Published,
}

/// Resource limits applied to a sandbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_mb: u64,
    /// CPU cores (fractional allowed, e.g. 0.5)
    pub cpu_cores: f64,
    pub pids_limit: i64,
    pub nofile: i64,
    pub nproc: i64,
    pub tmpfs_mb: u64,
    pub shm_size_mb: Option<u64>,
}

/// A live, runtime-managed sandbox
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxHandle {
    pub id: String,
    pub container_id: String,
    pub sandbox_type: SessionType,
    pub limits: ResourceLimits,
    pub network_mode: NetworkMode,
    /// Host directory bound read-write at `/workspace` inside the sandbox
    pub workspace_path: PathBuf,
    pub labels: HashMap<String, String>,
    /// Endpoint name to URL, for sandboxes that publish a port
    pub endpoints: BTreeMap<String, String>,
    pub host_port: Option<u16>,
}

/// Request to run one piece of code in a session's sandbox
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub session_id: String,
    pub language: String,
    pub code: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub max_output_bytes: Option<usize>,
}

impl ExecutionRequest {
    pub fn new(
        session_id: impl Into<String>,
        language: impl Into<String>,
        code: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            language: language.into(),
            code: code.into(),
            timeout_ms: None,
            max_output_bytes: None,
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_max_output_bytes(mut self, max_output_bytes: usize) -> Self {
        self.max_output_bytes = Some(max_output_bytes);
        self
    }
}

/// Structured outcome of an execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_usage_mb: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_state_machine_transitions() {
        use SessionStatus::*;

        assert!(Creating.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Busy));
        assert!(Busy.can_transition_to(Ready));
        assert!(Busy.can_transition_to(Error));
        assert!(Error.can_transition_to(Creating));
        assert!(Error.can_transition_to(Destroyed));

        assert!(!Ready.can_transition_to(Error));
        assert!(!Busy.can_transition_to(Busy));
        assert!(!Ready.can_transition_to(Creating));
        for next in [Creating, Ready, Busy, Error, Destroyed] {
            assert!(!Destroyed.can_transition_to(next));
        }

        assert!(Ready.holds_sandbox());
        assert!(Busy.holds_sandbox());
        assert!(!Creating.holds_sandbox());
        assert!(!Error.holds_sandbox());
    }

    #[test]
    fn test_session_wire_shape() {
        let now = Utc::now();
        let session = Session {
            id: "s-1".to_string(),
            session_type: SessionType::BrowserAutomation,
            language: "javascript".to_string(),
            status: SessionStatus::Ready,
            memory_mb: 5120,
            endpoints: BTreeMap::from([(
                "playwright".to_string(),
                "ws://localhost:9222/".to_string(),
            )]),
            client_id: "agent-7".to_string(),
            created_at: now,
            last_accessed_at: now,
            container_id: None,
        };

        let value = serde_json::to_value(&session).unwrap();
        assert_eq!(value["type"], "browser-automation");
        assert_eq!(value["status"], "ready");
        assert_eq!(value["memory"], 5120);
        assert_eq!(value["clientId"], "agent-7");
        assert!(value.get("lastAccessedAt").is_some());
        assert!(value.get("containerId").is_none());

        let back: Session = serde_json::from_value(value).unwrap();
        assert_eq!(back, session);
    }

    #[test]
    fn test_execution_result_omits_missing_memory() {
        let result = ExecutionResult {
            stdout: "4".to_string(),
            exit_code: 0,
            duration_ms: 12,
            ..Default::default()
        };

        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["exitCode"], 0);
        assert_eq!(value["durationMs"], 12);
        assert!(value.get("memoryUsageMb").is_none());
    }

    #[test]
    fn test_session_type_parsing() {
        assert_eq!("vscode".parse::<SessionType>(), Ok(SessionType::Ide));
        assert_eq!(
            "Playwright".parse::<SessionType>(),
            Ok(SessionType::BrowserAutomation)
        );
        assert!("mainframe".parse::<SessionType>().is_err());
        assert!(!SessionType::Execution.exposes_port());
        assert!(SessionType::Ide.exposes_port());
    }
}
