// ABOUTME: Execution scheduler admitting code runs under global concurrency and rate limits
// ABOUTME: Writes code into the workspace, streams exec output with timeout and size caps, then cleans up

use crate::controller::SandboxController;
use crate::error::{Result, SandboxError};
use crate::providers::{OutputChunk, StreamType};
use crate::settings::{LanguageSpec, SandboxSettings};
use crate::types::{ExecutionRequest, ExecutionResult, SandboxHandle};
use futures::StreamExt;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Attempts at reading the exit code after the output stream closed
const EXIT_CODE_ATTEMPTS: u32 = 5;
const EXIT_CODE_RETRY_DELAY: Duration = Duration::from_millis(20);

/// Resolved per-request limits
#[derive(Debug, Clone, Copy)]
struct Limits {
    timeout: Duration,
    max_output_bytes: usize,
}

pub struct ExecutionScheduler {
    controller: Arc<SandboxController>,
    permits: Arc<Semaphore>,
    admissions: DefaultDirectRateLimiter,
    settings: Arc<SandboxSettings>,
}

impl ExecutionScheduler {
    pub fn new(controller: Arc<SandboxController>, settings: Arc<SandboxSettings>) -> Self {
        let per_second = NonZeroU32::new(settings.scheduler.max_admissions_per_sec)
            .unwrap_or(NonZeroU32::MIN);

        Self {
            controller,
            permits: Arc::new(Semaphore::new(settings.scheduler.max_concurrent.max(1))),
            admissions: RateLimiter::direct(Quota::per_second(per_second)),
            settings,
        }
    }

    /// Executions currently holding an admission slot
    pub fn active(&self) -> usize {
        self.settings
            .scheduler
            .max_concurrent
            .max(1)
            .saturating_sub(self.permits.available_permits())
    }

    /// Refuse all queued and future admissions
    pub fn close(&self) {
        self.permits.close();
    }

    fn resolve_limits(&self, request: &ExecutionRequest) -> Result<Limits> {
        let s = &self.settings.scheduler;

        let timeout_ms = request.timeout_ms.unwrap_or(s.default_timeout_ms);
        if timeout_ms == 0 {
            return Err(SandboxError::Validation(
                "timeoutMs must be positive".to_string(),
            ));
        }
        let max_output_bytes = request.max_output_bytes.unwrap_or(s.default_max_output_bytes);
        if max_output_bytes == 0 {
            return Err(SandboxError::Validation(
                "maxOutputBytes must be positive".to_string(),
            ));
        }

        Ok(Limits {
            timeout: Duration::from_millis(timeout_ms.min(s.max_timeout_ms)),
            max_output_bytes: max_output_bytes.min(s.max_output_bytes),
        })
    }

    /// Wait in submission order for a concurrency slot and a rate-limiter cell
    async fn admit(&self) -> Result<OwnedSemaphorePermit> {
        let queue_timeout = Duration::from_millis(self.settings.scheduler.queue_timeout_ms);

        let admitted = tokio::time::timeout(queue_timeout, async {
            let permit = self.permits.clone().acquire_owned().await;
            self.admissions.until_ready().await;
            permit
        })
        .await;

        match admitted {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(SandboxError::Capacity(
                "scheduler is shutting down".to_string(),
            )),
            Err(_) => Err(SandboxError::Capacity(format!(
                "no execution slot within {}ms",
                queue_timeout.as_millis()
            ))),
        }
    }

    /// Run `request.code` with `language` inside `handle` and produce exactly one terminal outcome
    pub async fn execute(
        &self,
        handle: &SandboxHandle,
        language: &LanguageSpec,
        request: &ExecutionRequest,
    ) -> Result<ExecutionResult> {
        let limits = self.resolve_limits(request)?;
        let _permit = self.admit().await?;

        let file_name = format!("exec_{}.{}", Uuid::new_v4().simple(), language.extension);
        let container_path = self
            .controller
            .write_workspace_file(handle, &file_name, request.code.as_bytes())
            .await?;

        debug!(
            sandbox_id = %handle.id,
            language = %language.name,
            file = %container_path,
            "Admitted execution"
        );

        let outcome = self
            .run_attached(handle, language.render_command(&container_path), limits)
            .await;

        self.schedule_cleanup(handle, file_name);

        match &outcome {
            Ok(result) => info!(
                sandbox_id = %handle.id,
                exit_code = result.exit_code,
                duration_ms = result.duration_ms,
                "Execution finished"
            ),
            Err(e) => warn!(sandbox_id = %handle.id, kind = %e.kind(), "Execution failed: {}", e),
        }
        outcome
    }

    async fn run_attached(
        &self,
        handle: &SandboxHandle,
        command: Vec<String>,
        limits: Limits,
    ) -> Result<ExecutionResult> {
        let provider = self.controller.provider();
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + limits.timeout;
        let timeout_ms = limits.timeout.as_millis() as u64;
        let mut capture = OutputCapture::new(limits.max_output_bytes);

        let attachment = match tokio::time::timeout_at(
            deadline,
            provider.exec_attach(
                &handle.container_id,
                command,
                Some(crate::controller::WORKSPACE_MOUNT.to_string()),
            ),
        )
        .await
        {
            Ok(Ok(attachment)) => attachment,
            Ok(Err(e)) => return Err(SandboxError::Runtime(e)),
            Err(_) => {
                return Err(SandboxError::Timeout {
                    timeout_ms,
                    partial: Box::new(capture.into_result(-1, started.elapsed(), None)),
                })
            }
        };

        let mut output = attachment.output;
        loop {
            match tokio::time::timeout_at(deadline, output.next()).await {
                Err(_) => {
                    return Err(SandboxError::Timeout {
                        timeout_ms,
                        partial: Box::new(capture.into_result(-1, started.elapsed(), None)),
                    });
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => return Err(SandboxError::Runtime(e)),
                Ok(Some(Ok(chunk))) => {
                    if let Err(stream) = capture.push(chunk) {
                        return Err(SandboxError::OutputLimit {
                            stream,
                            limit: limits.max_output_bytes,
                            partial: Box::new(capture.into_result(-1, started.elapsed(), None)),
                        });
                    }
                }
            }
        }
        drop(output);

        let exit_code = self.exit_code(&attachment.exec_id).await?;
        let duration = started.elapsed();

        let memory_usage_mb = match provider.memory_usage_mb(&handle.container_id).await {
            Ok(mb) => Some(mb),
            Err(e) => {
                debug!(sandbox_id = %handle.id, "Memory snapshot unavailable: {}", e);
                None
            }
        };

        Ok(capture.into_result(exit_code, duration, memory_usage_mb))
    }

    async fn exit_code(&self, exec_id: &str) -> Result<i64> {
        let provider = self.controller.provider();
        for _ in 0..EXIT_CODE_ATTEMPTS {
            match provider.exec_exit_code(exec_id).await {
                Ok(Some(code)) => return Ok(code),
                Ok(None) => tokio::time::sleep(EXIT_CODE_RETRY_DELAY).await,
                Err(e) => return Err(SandboxError::Runtime(e)),
            }
        }
        warn!(exec_id = %exec_id, "Exec still reported running after its output closed");
        Ok(-1)
    }

    /// Remove the code file in the background; failures are only logged
    fn schedule_cleanup(&self, handle: &SandboxHandle, file_name: String) {
        let controller = Arc::clone(&self.controller);
        let handle = handle.clone();
        tokio::spawn(async move {
            if let Err(e) = controller.remove_workspace_file(&handle, &file_name).await {
                warn!(
                    sandbox_id = %handle.id,
                    "Failed to clean up code file {}: {}",
                    file_name, e
                );
            }
        });
    }
}

/// Per-stream output buffers that never grow past `limit` bytes
pub(crate) struct OutputCapture {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    limit: usize,
}

impl OutputCapture {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            stdout: Vec::new(),
            stderr: Vec::new(),
            limit,
        }
    }

    /// Append a frame, or keep what fits and return the name of the overflowing stream
    pub(crate) fn push(&mut self, chunk: OutputChunk) -> std::result::Result<(), &'static str> {
        let (buf, name) = match chunk.stream {
            StreamType::Stdout => (&mut self.stdout, "stdout"),
            StreamType::Stderr => (&mut self.stderr, "stderr"),
        };

        let room = self.limit.saturating_sub(buf.len());
        if chunk.data.len() > room {
            buf.extend_from_slice(&chunk.data[..room]);
            return Err(name);
        }
        buf.extend_from_slice(&chunk.data);
        Ok(())
    }

    pub(crate) fn into_result(
        self,
        exit_code: i64,
        duration: Duration,
        memory_usage_mb: Option<u64>,
    ) -> ExecutionResult {
        ExecutionResult {
            stdout: decode_within(&self.stdout, self.limit),
            stderr: decode_within(&self.stderr, self.limit),
            exit_code,
            duration_ms: duration.as_millis() as u64,
            memory_usage_mb,
        }
    }
}

/// Lossy UTF-8 decode with trailing whitespace trimmed, never longer than `limit` bytes
fn decode_within(bytes: &[u8], limit: usize) -> String {
    let mut text = String::from_utf8_lossy(bytes).trim_end().to_string();
    if text.len() > limit {
        let mut cut = limit;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_capture_keeps_streams_apart() {
        let mut capture = OutputCapture::new(64);
        capture.push(OutputChunk::stdout("4\n")).unwrap();
        capture.push(OutputChunk::stderr("warning\n")).unwrap();
        capture.push(OutputChunk::stdout("done\n")).unwrap();

        let result = capture.into_result(0, Duration::from_millis(5), Some(12));
        assert_eq!(result.stdout, "4\ndone");
        assert_eq!(result.stderr, "warning");
        assert_eq!(result.memory_usage_mb, Some(12));
    }

    #[test]
    fn test_capture_truncates_at_limit() {
        let mut capture = OutputCapture::new(8);
        capture.push(OutputChunk::stdout("12345")).unwrap();
        assert_eq!(capture.push(OutputChunk::stdout("67890")), Err("stdout"));

        let result = capture.into_result(-1, Duration::ZERO, None);
        assert_eq!(result.stdout, "12345678");
    }

    #[test]
    fn test_limit_is_per_stream() {
        let mut capture = OutputCapture::new(4);
        capture.push(OutputChunk::stdout("abcd")).unwrap();
        capture.push(OutputChunk::stderr("wxyz")).unwrap();
        assert_eq!(capture.push(OutputChunk::stderr("!")), Err("stderr"));
    }

    #[test]
    fn test_decode_never_exceeds_limit() {
        // "é" is two bytes; cutting after the first leaves an invalid sequence
        let bytes = "aé".as_bytes();
        let decoded = decode_within(&bytes[..2], 2);
        assert!(decoded.len() <= 2);
        assert!(decoded.starts_with('a'));
    }
}
