// ABOUTME: Integration tests against a real Docker daemon
// ABOUTME: Skipped by default; run with `--ignored` on a host with Docker and network access for image pulls

use sandcastle_sandbox::providers::Provider;
use sandcastle_sandbox::{
    CreateSessionParams, DockerProvider, ErrorKind, ExecutionRequest, SandboxService,
    SandboxSettings, SessionType,
};
use std::sync::Arc;
use tempfile::TempDir;

async fn docker() -> Option<Arc<DockerProvider>> {
    let provider = DockerProvider::new().ok()?;
    match provider.ping().await {
        Ok(()) => Some(Arc::new(provider)),
        Err(e) => {
            println!("Skipping test: Docker not available ({})", e);
            None
        }
    }
}

fn settings(workspace: &TempDir) -> SandboxSettings {
    let mut settings = SandboxSettings::default();
    settings.pool.execution_target = 0;
    settings.pool.ide_target = 0;
    settings.pool.browser_target = 0;
    settings.profiles.execution.image = "python:3.12-alpine".to_string();
    settings.profiles.execution.memory_mb = 256;
    settings.runtime.workspace_root = workspace.path().to_path_buf();
    settings.runtime.label_prefix = "sandcastle-test".to_string();
    settings
}

#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn test_python_execution_end_to_end() {
    let Some(provider) = docker().await else {
        return;
    };
    let workspace = TempDir::new().unwrap();
    let service = Arc::new(SandboxService::new(provider, None, settings(&workspace)));
    service.start().await.unwrap();

    let session = service
        .create_session(CreateSessionParams::new(SessionType::Execution, "it").with_language("python"))
        .await
        .unwrap();

    let result = service
        .execute_code("it", ExecutionRequest::new(&session.id, "python", "print(2+2)"))
        .await
        .unwrap();
    assert_eq!(result.stdout, "4");
    assert_eq!(result.exit_code, 0);

    let result = service
        .execute_code(
            "it",
            ExecutionRequest::new(&session.id, "python", "import sys\nsys.exit(3)"),
        )
        .await
        .unwrap();
    assert_eq!(result.exit_code, 3);

    let err = service
        .execute_code(
            "it",
            ExecutionRequest::new(&session.id, "python", "import time\ntime.sleep(30)")
                .with_timeout_ms(500),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);

    service.shutdown().await;
}

#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn test_execution_sandbox_has_no_network() {
    let Some(provider) = docker().await else {
        return;
    };
    let workspace = TempDir::new().unwrap();
    let service = Arc::new(SandboxService::new(provider, None, settings(&workspace)));
    service.start().await.unwrap();

    let session = service
        .create_session(CreateSessionParams::new(SessionType::Execution, "it"))
        .await
        .unwrap();

    let code = "import urllib.request\ntry:\n    urllib.request.urlopen('http://example.com', timeout=2)\n    print('online')\nexcept Exception:\n    print('offline')";
    let result = service
        .execute_code("it", ExecutionRequest::new(&session.id, "python", code))
        .await
        .unwrap();
    assert_eq!(result.stdout, "offline");

    service.shutdown().await;
}
