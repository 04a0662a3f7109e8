// ABOUTME: Runtime configuration for the orchestration core
// ABOUTME: Defaults for pools, scheduling, rate limits, ports, resource profiles and languages, overlaid from env vars

use crate::ports::PortRange;
use crate::types::SessionType;
use sandcastle_config::*;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Inconsistent settings: {0}")]
    Inconsistent(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    pub execution_target: usize,
    pub ide_target: usize,
    pub browser_target: usize,
    pub maintain_interval_secs: u64,
}

impl PoolSettings {
    pub fn target_for(&self, session_type: SessionType) -> usize {
        match session_type {
            SessionType::Execution => self.execution_target,
            SessionType::Ide => self.ide_target,
            SessionType::BrowserAutomation => self.browser_target,
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            execution_target: 3,
            ide_target: 3,
            browser_target: 3,
            maintain_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    pub max_concurrent: usize,
    pub max_admissions_per_sec: u32,
    /// How long a request may wait for admission before failing with a capacity error
    pub queue_timeout_ms: u64,
    pub default_timeout_ms: u64,
    pub max_timeout_ms: u64,
    pub default_max_output_bytes: usize,
    pub max_output_bytes: usize,
    pub max_code_bytes: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            max_admissions_per_sec: 50,
            queue_timeout_ms: 60_000,
            default_timeout_ms: 30_000,
            max_timeout_ms: 300_000,
            default_max_output_bytes: 10 * 1024 * 1024,
            max_output_bytes: 50 * 1024 * 1024,
            max_code_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    pub points: u32,
    pub window_secs: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            points: 50,
            window_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    pub ttl_secs: u64,
    pub sweep_interval_secs: u64,
    /// SQLite URL of the durable session store; empty keeps sessions in-process only
    pub database_url: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            ttl_secs: 24 * 60 * 60,
            sweep_interval_secs: 60,
            database_url: "sqlite://sandcastle-sessions.db?mode=rwc".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortSettings {
    pub ide: PortRange,
    pub browser: PortRange,
    pub reservation_secs: u64,
}

impl Default for PortSettings {
    fn default() -> Self {
        Self {
            ide: PortRange::new(8080, 9999),
            browser: PortRange::new(9222, 10999),
            reservation_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSettings {
    /// Prefix for every container label this process sets, e.g. `sandcastle.managed`
    pub label_prefix: String,
    pub workspace_root: PathBuf,
    /// Host name used when building endpoint URLs
    pub public_host: String,
    pub image_pull_timeout_secs: u64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            label_prefix: "sandcastle".to_string(),
            workspace_root: std::env::temp_dir().join("sandcastle-workspaces"),
            public_host: "localhost".to_string(),
            image_pull_timeout_secs: 600,
        }
    }
}

/// Container shape for one session type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceProfile {
    pub image: String,
    pub memory_mb: u64,
    pub cpu_cores: f64,
    pub pids_limit: i64,
    pub nofile: i64,
    pub nproc: i64,
    pub tmpfs_mb: u64,
    pub shm_size_mb: Option<u64>,
    /// Port the service listens on inside the container, for exposed types
    pub service_port: Option<u16>,
    pub command: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileSettings {
    pub execution: ResourceProfile,
    pub ide: ResourceProfile,
    pub browser: ResourceProfile,
}

impl ProfileSettings {
    pub fn for_type(&self, session_type: SessionType) -> &ResourceProfile {
        match session_type {
            SessionType::Execution => &self.execution,
            SessionType::Ide => &self.ide,
            SessionType::BrowserAutomation => &self.browser,
        }
    }

    fn for_type_mut(&mut self, session_type: SessionType) -> &mut ResourceProfile {
        match session_type {
            SessionType::Execution => &mut self.execution,
            SessionType::Ide => &mut self.ide,
            SessionType::BrowserAutomation => &mut self.browser,
        }
    }
}

impl Default for ProfileSettings {
    fn default() -> Self {
        Self {
            execution: ResourceProfile {
                image: "sandcastle/execution:latest".to_string(),
                memory_mb: 5120,
                cpu_cores: 1.0,
                pids_limit: 256,
                nofile: 1024,
                nproc: 256,
                tmpfs_mb: 256,
                shm_size_mb: None,
                service_port: None,
                command: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            },
            ide: ResourceProfile {
                image: "codercom/code-server:latest".to_string(),
                memory_mb: 5120,
                cpu_cores: 1.0,
                pids_limit: 1024,
                nofile: 4096,
                nproc: 1024,
                tmpfs_mb: 1024,
                shm_size_mb: None,
                service_port: Some(8080),
                command: Some(vec![
                    "code-server".to_string(),
                    "--bind-addr".to_string(),
                    "0.0.0.0:8080".to_string(),
                    "--auth".to_string(),
                    "none".to_string(),
                    "/workspace".to_string(),
                ]),
            },
            browser: ResourceProfile {
                image: "mcr.microsoft.com/playwright:v1.47.0-jammy".to_string(),
                memory_mb: 5120,
                cpu_cores: 1.0,
                pids_limit: 512,
                nofile: 4096,
                nproc: 512,
                tmpfs_mb: 512,
                shm_size_mb: Some(2048),
                service_port: Some(9222),
                command: Some(vec![
                    "npx".to_string(),
                    "-y".to_string(),
                    "playwright@1.47.0".to_string(),
                    "run-server".to_string(),
                    "--port".to_string(),
                    "9222".to_string(),
                    "--host".to_string(),
                    "0.0.0.0".to_string(),
                ]),
            },
        }
    }
}

/// One row of the language table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageSpec {
    pub name: String,
    pub aliases: Vec<String>,
    pub extension: String,
    /// Run command; `{file}` is replaced with the code file's container path
    pub command: Vec<String>,
}

impl LanguageSpec {
    fn new(name: &str, aliases: &[&str], extension: &str, command: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            aliases: aliases.iter().map(|a| a.to_string()).collect(),
            extension: extension.to_string(),
            command: command.iter().map(|c| c.to_string()).collect(),
        }
    }

    pub fn matches(&self, language: &str) -> bool {
        let language = language.trim().to_lowercase();
        self.name == language || self.aliases.iter().any(|a| *a == language)
    }

    pub fn render_command(&self, file_path: &str) -> Vec<String> {
        self.command
            .iter()
            .map(|part| part.replace("{file}", file_path))
            .collect()
    }
}

pub fn default_languages() -> Vec<LanguageSpec> {
    vec![
        LanguageSpec::new("python", &["python3", "py"], "py", &["python3", "{file}"]),
        LanguageSpec::new("javascript", &["node", "js"], "js", &["node", "{file}"]),
        LanguageSpec::new("typescript", &["ts"], "ts", &["npx", "--yes", "tsx", "{file}"]),
        LanguageSpec::new("bash", &["sh", "shell"], "sh", &["bash", "{file}"]),
        LanguageSpec::new("go", &["golang"], "go", &["go", "run", "{file}"]),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSettings {
    pub pool: PoolSettings,
    pub scheduler: SchedulerSettings,
    pub rate_limit: RateLimitSettings,
    pub sessions: SessionSettings,
    pub ports: PortSettings,
    pub runtime: RuntimeSettings,
    pub profiles: ProfileSettings,
    #[serde(default = "default_languages")]
    pub languages: Vec<LanguageSpec>,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            pool: PoolSettings::default(),
            scheduler: SchedulerSettings::default(),
            rate_limit: RateLimitSettings::default(),
            sessions: SessionSettings::default(),
            ports: PortSettings::default(),
            runtime: RuntimeSettings::default(),
            profiles: ProfileSettings::default(),
            languages: default_languages(),
        }
    }
}

impl SandboxSettings {
    /// Defaults overlaid with `SANDCASTLE_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();
        let env = EnvReader { lookup: &lookup };

        env.read(SANDCASTLE_POOL_SIZE_EXECUTION, &mut settings.pool.execution_target)?;
        env.read(SANDCASTLE_POOL_SIZE_IDE, &mut settings.pool.ide_target)?;
        env.read(SANDCASTLE_POOL_SIZE_BROWSER, &mut settings.pool.browser_target)?;
        env.read(
            SANDCASTLE_POOL_MAINTAIN_INTERVAL_SECS,
            &mut settings.pool.maintain_interval_secs,
        )?;

        let scheduler = &mut settings.scheduler;
        env.read(SANDCASTLE_MAX_CONCURRENT_EXECUTIONS, &mut scheduler.max_concurrent)?;
        env.read(
            SANDCASTLE_MAX_ADMISSIONS_PER_SEC,
            &mut scheduler.max_admissions_per_sec,
        )?;
        env.read(SANDCASTLE_QUEUE_TIMEOUT_MS, &mut scheduler.queue_timeout_ms)?;
        env.read(SANDCASTLE_DEFAULT_TIMEOUT_MS, &mut scheduler.default_timeout_ms)?;
        env.read(SANDCASTLE_MAX_TIMEOUT_MS, &mut scheduler.max_timeout_ms)?;
        env.read(
            SANDCASTLE_DEFAULT_MAX_OUTPUT_BYTES,
            &mut scheduler.default_max_output_bytes,
        )?;
        env.read(SANDCASTLE_MAX_OUTPUT_BYTES, &mut scheduler.max_output_bytes)?;
        env.read(SANDCASTLE_MAX_CODE_BYTES, &mut scheduler.max_code_bytes)?;

        env.read(SANDCASTLE_RATE_LIMIT_POINTS, &mut settings.rate_limit.points)?;
        env.read(
            SANDCASTLE_RATE_LIMIT_WINDOW_SECS,
            &mut settings.rate_limit.window_secs,
        )?;

        env.read(SANDCASTLE_SESSION_TTL_SECS, &mut settings.sessions.ttl_secs)?;
        env.read(
            SANDCASTLE_SWEEP_INTERVAL_SECS,
            &mut settings.sessions.sweep_interval_secs,
        )?;
        if let Some(url) = lookup(SANDCASTLE_DATABASE_URL) {
            settings.sessions.database_url = url.trim().to_string();
        }

        for (session_type, image, memory, cpu) in [
            (
                SessionType::Execution,
                SANDCASTLE_EXECUTION_IMAGE,
                SANDCASTLE_EXECUTION_MEMORY_MB,
                SANDCASTLE_EXECUTION_CPU_CORES,
            ),
            (
                SessionType::Ide,
                SANDCASTLE_IDE_IMAGE,
                SANDCASTLE_IDE_MEMORY_MB,
                SANDCASTLE_IDE_CPU_CORES,
            ),
            (
                SessionType::BrowserAutomation,
                SANDCASTLE_BROWSER_IMAGE,
                SANDCASTLE_BROWSER_MEMORY_MB,
                SANDCASTLE_BROWSER_CPU_CORES,
            ),
        ] {
            let profile = settings.profiles.for_type_mut(session_type);
            env.read(image, &mut profile.image)?;
            env.read(memory, &mut profile.memory_mb)?;
            env.read(cpu, &mut profile.cpu_cores)?;
        }

        env.read(SANDCASTLE_IDE_PORT_RANGE, &mut settings.ports.ide)?;
        env.read(SANDCASTLE_BROWSER_PORT_RANGE, &mut settings.ports.browser)?;
        env.read(
            SANDCASTLE_PORT_RESERVATION_SECS,
            &mut settings.ports.reservation_secs,
        )?;

        env.read(SANDCASTLE_LABEL_PREFIX, &mut settings.runtime.label_prefix)?;
        env.read(SANDCASTLE_WORKSPACE_ROOT, &mut settings.runtime.workspace_root)?;
        env.read(SANDCASTLE_PUBLIC_HOST, &mut settings.runtime.public_host)?;
        env.read(
            SANDCASTLE_IMAGE_PULL_TIMEOUT_SECS,
            &mut settings.runtime.image_pull_timeout_secs,
        )?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.scheduler;
        if s.max_concurrent == 0 {
            return Err(ConfigError::Inconsistent(
                "max concurrent executions must be at least 1".to_string(),
            ));
        }
        if s.max_admissions_per_sec == 0 {
            return Err(ConfigError::Inconsistent(
                "admissions per second must be at least 1".to_string(),
            ));
        }
        if s.default_timeout_ms == 0 || s.default_timeout_ms > s.max_timeout_ms {
            return Err(ConfigError::Inconsistent(format!(
                "default timeout {}ms must be between 1 and the maximum {}ms",
                s.default_timeout_ms, s.max_timeout_ms
            )));
        }
        if s.default_max_output_bytes == 0 || s.default_max_output_bytes > s.max_output_bytes {
            return Err(ConfigError::Inconsistent(format!(
                "default output limit {} must be between 1 and the maximum {}",
                s.default_max_output_bytes, s.max_output_bytes
            )));
        }
        if self.rate_limit.points == 0 || self.rate_limit.window_secs == 0 {
            return Err(ConfigError::Inconsistent(
                "rate limit points and window must be non-zero".to_string(),
            ));
        }
        if self.sessions.ttl_secs == 0 {
            return Err(ConfigError::Inconsistent(
                "session TTL must be non-zero".to_string(),
            ));
        }
        if self.pool.maintain_interval_secs == 0 || self.sessions.sweep_interval_secs == 0 {
            return Err(ConfigError::Inconsistent(
                "background intervals must be non-zero".to_string(),
            ));
        }
        for session_type in SessionType::ALL {
            let profile = self.profiles.for_type(session_type);
            if !profile.cpu_cores.is_finite() || profile.cpu_cores <= 0.0 {
                return Err(ConfigError::Inconsistent(format!(
                    "{} profile CPU cores must be a positive number, got {}",
                    session_type, profile.cpu_cores
                )));
            }
            if profile.memory_mb == 0 {
                return Err(ConfigError::Inconsistent(format!(
                    "{} profile memory must be non-zero",
                    session_type
                )));
            }
            if session_type.exposes_port() && profile.service_port.is_none() {
                return Err(ConfigError::Inconsistent(format!(
                    "{} profile needs a service port",
                    session_type
                )));
            }
        }
        if self.label_prefix_invalid() {
            return Err(ConfigError::Inconsistent(
                "label prefix must be non-empty without '='".to_string(),
            ));
        }
        Ok(())
    }

    fn label_prefix_invalid(&self) -> bool {
        let prefix = &self.runtime.label_prefix;
        prefix.is_empty() || prefix.contains('=')
    }

    pub fn language(&self, language: &str) -> Option<&LanguageSpec> {
        self.languages.iter().find(|spec| spec.matches(language))
    }

    pub fn port_range_for(&self, session_type: SessionType) -> Option<PortRange> {
        match session_type {
            SessionType::Execution => None,
            SessionType::Ide => Some(self.ports.ide),
            SessionType::BrowserAutomation => Some(self.ports.browser),
        }
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.sessions.ttl_secs)
    }

    pub fn pool_maintain_interval(&self) -> Duration {
        Duration::from_secs(self.pool.maintain_interval_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sessions.sweep_interval_secs)
    }

    /// Label identifying every container this platform manages
    pub fn managed_label(&self) -> String {
        format!("{}.managed=true", self.runtime.label_prefix)
    }
}

struct EnvReader<'a, F> {
    lookup: &'a F,
}

impl<F> EnvReader<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Overwrite `target` when `key` is set to a non-empty value
    fn read<T>(&self, key: &str, target: &mut T) -> Result<(), ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        let Some(raw) = (self.lookup)(key) else {
            return Ok(());
        };
        let value = raw.trim();
        if value.is_empty() {
            return Ok(());
        }

        *target = value.parse::<T>().map_err(|e| ConfigError::Invalid {
            key: key.to_string(),
            value: value.to_string(),
            reason: e.to_string(),
        })?;
        Ok(())
    }
}
