// ABOUTME: Sandcastle command line entry point
// ABOUTME: Runs the orchestration core, executes one-off snippets and inspects sessions and settings

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::*;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, ContentArrangement, Table};
use sandcastle_config::RUST_LOG;
use sandcastle_sandbox::{
    CreateSessionParams, DockerProvider, ExecutionRequest, ExecutionResult, Provider,
    SandboxService, SandboxSettings, SessionStore, SessionType, SqliteSessionStore,
};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "sandcastle")]
#[command(about = "Sandcastle - multi-tenant sandbox orchestration")]
#[command(version)]
struct Cli {
    /// Log filter used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the core: reclaim orphans, warm pools and serve until interrupted
    Serve,
    /// Remove containers left behind by a previous process and exit
    Reclaim,
    /// Run one snippet in a fresh execution sandbox and print its output
    Run {
        /// Language of the snippet
        #[arg(short, long, default_value = "python")]
        language: String,
        /// Code to run
        #[arg(short, long, conflicts_with = "file")]
        code: Option<String>,
        /// File whose contents to run
        #[arg(short, long)]
        file: Option<PathBuf>,
        /// Execution timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Client id the session is created for
        #[arg(long, default_value = "cli")]
        client: String,
    },
    /// List sessions recorded in the session database
    Sessions {
        /// Only show sessions owned by this client
        #[arg(long)]
        client: Option<String>,
    },
    /// Print the effective settings as JSON
    Config,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match handle_command(cli.command).await {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            process::exit(1);
        }
    }
}

fn init_tracing(default_level: &str) {
    let filter = match std::env::var(RUST_LOG) {
        Ok(directives) => tracing_subscriber::EnvFilter::new(directives),
        Err(_) => tracing_subscriber::EnvFilter::new(default_level),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

async fn handle_command(command: Commands) -> anyhow::Result<i32> {
    let settings = SandboxSettings::from_env().context("invalid configuration")?;

    match command {
        Commands::Serve => serve(settings).await,
        Commands::Reclaim => reclaim(settings).await,
        Commands::Run {
            language,
            code,
            file,
            timeout_ms,
            client,
        } => {
            let code = match (code, file) {
                (Some(code), _) => code,
                (None, Some(path)) => std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?,
                (None, None) => anyhow::bail!("pass --code or --file"),
            };
            run_snippet(settings, &client, &language, code, timeout_ms).await
        }
        Commands::Sessions { client } => list_sessions(settings, client.as_deref()).await,
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(0)
        }
    }
}

async fn open_store(settings: &SandboxSettings) -> anyhow::Result<Option<Arc<dyn SessionStore>>> {
    let url = settings.sessions.database_url.trim();
    if url.is_empty() {
        return Ok(None);
    }

    let store = SqliteSessionStore::connect(url)
        .await
        .with_context(|| format!("failed to open session database {}", url))?;
    Ok(Some(Arc::new(store)))
}

fn build_service(
    settings: SandboxSettings,
    store: Option<Arc<dyn SessionStore>>,
) -> anyhow::Result<Arc<SandboxService>> {
    let provider = DockerProvider::with_pull_timeout(Duration::from_secs(
        settings.runtime.image_pull_timeout_secs,
    ))
    .context("failed to connect to Docker")?;

    Ok(Arc::new(SandboxService::new(
        Arc::new(provider),
        store,
        settings,
    )))
}

async fn serve(settings: SandboxSettings) -> anyhow::Result<i32> {
    let store = open_store(&settings).await?;
    let service = build_service(settings, store)?;

    println!("{}", "Starting Sandcastle...".cyan().bold());
    let report = service.start().await?;
    println!(
        "{} Reclaimed {} of {} orphaned containers",
        "✓".green(),
        report.removed,
        report.found
    );
    for session_type in SessionType::ALL {
        println!(
            "{} {} pool: {}/{} ready",
            "✓".green(),
            session_type,
            service.pool().size(session_type),
            service.pool().target(session_type)
        );
    }
    println!("{}", "Press Ctrl+C to stop".dimmed());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    info!("Shutdown requested");
    service.shutdown().await;
    println!("{}", "Sandcastle stopped".cyan());
    Ok(0)
}

async fn reclaim(settings: SandboxSettings) -> anyhow::Result<i32> {
    let service = build_service(settings, None)?;
    let report = service.controller().reclaim_orphans().await?;

    println!(
        "Found {} orphaned containers, removed {}",
        report.found.to_string().bold(),
        report.removed.to_string().green()
    );
    for error in &report.errors {
        println!("  {} {}", "✗".red(), error);
    }

    Ok(if report.errors.is_empty() { 0 } else { 1 })
}

async fn run_snippet(
    mut settings: SandboxSettings,
    client: &str,
    language: &str,
    code: String,
    timeout_ms: Option<u64>,
) -> anyhow::Result<i32> {
    // A one-off run needs no warm pools
    settings.pool.execution_target = 0;
    settings.pool.ide_target = 0;
    settings.pool.browser_target = 0;

    // Skips start() so a running server's sandboxes are not reclaimed as orphans
    let service = build_service(settings, None)?;
    service.controller().provider().ping().await?;

    let outcome = run_in_session(&service, client, language, code, timeout_ms).await;

    service.shutdown().await;

    match outcome {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(i32::try_from(result.exit_code).unwrap_or(1))
        }
        Err(e) => {
            let body = serde_json::json!({
                "kind": e.kind().as_str(),
                "message": e.to_string(),
                "partial": e.partial_result(),
            });
            println!("{}", serde_json::to_string_pretty(&body)?);
            eprintln!("{} {}", "Error:".red().bold(), e);
            Ok(1)
        }
    }
}

async fn run_in_session(
    service: &SandboxService,
    client: &str,
    language: &str,
    code: String,
    timeout_ms: Option<u64>,
) -> sandcastle_sandbox::Result<ExecutionResult> {
    let session = service
        .create_session(
            CreateSessionParams::new(SessionType::Execution, client).with_language(language),
        )
        .await?;

    let mut request = ExecutionRequest::new(&session.id, language, code);
    request.timeout_ms = timeout_ms;
    let result = service.execute_code(client, request).await;

    if let Err(e) = service.destroy_session(&session.id).await {
        warn!("Failed to destroy session {}: {}", session.id, e);
    }
    result
}

async fn list_sessions(settings: SandboxSettings, client: Option<&str>) -> anyhow::Result<i32> {
    let store = open_store(&settings)
        .await?
        .context("no session database configured")?;
    let service = build_service(settings, Some(store))?;

    let sessions = service.list_sessions(client).await;
    if sessions.is_empty() {
        println!("{}", "No sessions found".dimmed());
        return Ok(0);
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);

    table.set_header(vec!["ID", "Type", "Status", "Client", "Language", "Last Access"]);

    for session in &sessions {
        table.add_row(vec![
            session.id.clone(),
            session.session_type.to_string(),
            session.status.to_string(),
            session.client_id.clone(),
            session.language.clone(),
            session.last_accessed_at.format("%Y-%m-%d %H:%M").to_string(),
        ]);
    }

    println!("{table}");
    Ok(0)
}
