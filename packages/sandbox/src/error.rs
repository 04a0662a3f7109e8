// ABOUTME: Error taxonomy for the sandbox orchestration core
// ABOUTME: Every failure surfaces with a stable error kind and, for execution limits, a partial result

use crate::providers::ProviderError;
use crate::sessions::StoreError;
use crate::settings::ConfigError;
use crate::types::{ExecutionResult, SessionStatus};
use std::fmt;
use thiserror::Error;

/// Stable category of an error, exposed to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Capacity,
    NotFound,
    Timeout,
    OutputLimit,
    Runtime,
    Infrastructure,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "ValidationError",
            ErrorKind::Capacity => "CapacityError",
            ErrorKind::NotFound => "NotFoundError",
            ErrorKind::Timeout => "TimeoutError",
            ErrorKind::OutputLimit => "OutputLimitError",
            ErrorKind::Runtime => "RuntimeError",
            ErrorKind::Infrastructure => "InfrastructureError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Code matched a forbidden pattern class. The pattern itself is never echoed.
    #[error("Code rejected: {class} is not allowed")]
    Blocked { class: &'static str },

    #[error("Rate limit exceeded for client {client_id}, retry after {retry_after_ms}ms")]
    RateLimited {
        client_id: String,
        retry_after_ms: u64,
    },

    #[error("Capacity exhausted: {0}")]
    Capacity(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Sandbox not found: {0}")]
    SandboxNotFound(String),

    #[error("Invalid session transition from {from} to {to}")]
    InvalidTransition {
        from: SessionStatus,
        to: SessionStatus,
    },

    #[error("Execution timed out after {timeout_ms}ms")]
    Timeout {
        timeout_ms: u64,
        partial: Box<ExecutionResult>,
    },

    #[error("Output limit of {limit} bytes exceeded on {stream}")]
    OutputLimit {
        stream: &'static str,
        limit: usize,
        partial: Box<ExecutionResult>,
    },

    #[error("Runtime failure: {0}")]
    Runtime(#[source] ProviderError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Session store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl SandboxError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SandboxError::Validation(_)
            | SandboxError::Blocked { .. }
            | SandboxError::InvalidTransition { .. }
            | SandboxError::Config(_) => ErrorKind::Validation,
            SandboxError::RateLimited { .. } | SandboxError::Capacity(_) => ErrorKind::Capacity,
            SandboxError::SessionNotFound(_) | SandboxError::SandboxNotFound(_) => {
                ErrorKind::NotFound
            }
            SandboxError::Timeout { .. } => ErrorKind::Timeout,
            SandboxError::OutputLimit { .. } => ErrorKind::OutputLimit,
            SandboxError::Runtime(_) => ErrorKind::Runtime,
            SandboxError::Provider(_) | SandboxError::Store(_) | SandboxError::Io(_) => {
                ErrorKind::Infrastructure
            }
        }
    }

    /// Output captured before a timeout or output limit cut the execution short
    pub fn partial_result(&self) -> Option<&ExecutionResult> {
        match self {
            SandboxError::Timeout { partial, .. } | SandboxError::OutputLimit { partial, .. } => {
                Some(&**partial)
            }
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            SandboxError::Validation("empty code".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            SandboxError::RateLimited {
                client_id: "c".into(),
                retry_after_ms: 10
            }
            .kind(),
            ErrorKind::Capacity
        );
        assert_eq!(
            SandboxError::SessionNotFound("s".into()).kind().as_str(),
            "NotFoundError"
        );
        assert_eq!(
            SandboxError::Runtime(ProviderError::ExecError("boom".into())).kind(),
            ErrorKind::Runtime
        );
        assert_eq!(
            SandboxError::Provider(ProviderError::ConnectionError("down".into())).kind(),
            ErrorKind::Infrastructure
        );
    }

    #[test]
    fn test_partial_result_attached_to_limits() {
        let err = SandboxError::OutputLimit {
            stream: "stdout",
            limit: 1024,
            partial: Box::new(ExecutionResult {
                stdout: "x".repeat(1024),
                exit_code: -1,
                ..Default::default()
            }),
        };

        assert_eq!(err.kind(), ErrorKind::OutputLimit);
        assert_eq!(err.partial_result().map(|r| r.stdout.len()), Some(1024));
        assert!(SandboxError::Capacity("queue".into())
            .partial_result()
            .is_none());
    }

    #[test]
    fn test_blocked_message_names_class_only() {
        let err = SandboxError::Blocked {
            class: "process spawning",
        };
        assert_eq!(
            err.to_string(),
            "Code rejected: process spawning is not allowed"
        );
    }
}
