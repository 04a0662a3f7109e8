// ABOUTME: Environment variable name constants
// ABOUTME: Centralized definitions of all environment variable names used across Sandcastle

// Pool Configuration
pub const SANDCASTLE_POOL_SIZE_EXECUTION: &str = "SANDCASTLE_POOL_SIZE_EXECUTION";
pub const SANDCASTLE_POOL_SIZE_IDE: &str = "SANDCASTLE_POOL_SIZE_IDE";
pub const SANDCASTLE_POOL_SIZE_BROWSER: &str = "SANDCASTLE_POOL_SIZE_BROWSER";
pub const SANDCASTLE_POOL_MAINTAIN_INTERVAL_SECS: &str = "SANDCASTLE_POOL_MAINTAIN_INTERVAL_SECS";

// Execution Scheduler
pub const SANDCASTLE_MAX_CONCURRENT_EXECUTIONS: &str = "SANDCASTLE_MAX_CONCURRENT_EXECUTIONS";
pub const SANDCASTLE_MAX_ADMISSIONS_PER_SEC: &str = "SANDCASTLE_MAX_ADMISSIONS_PER_SEC";
pub const SANDCASTLE_QUEUE_TIMEOUT_MS: &str = "SANDCASTLE_QUEUE_TIMEOUT_MS";
pub const SANDCASTLE_DEFAULT_TIMEOUT_MS: &str = "SANDCASTLE_DEFAULT_TIMEOUT_MS";
pub const SANDCASTLE_MAX_TIMEOUT_MS: &str = "SANDCASTLE_MAX_TIMEOUT_MS";
pub const SANDCASTLE_DEFAULT_MAX_OUTPUT_BYTES: &str = "SANDCASTLE_DEFAULT_MAX_OUTPUT_BYTES";
pub const SANDCASTLE_MAX_OUTPUT_BYTES: &str = "SANDCASTLE_MAX_OUTPUT_BYTES";
pub const SANDCASTLE_MAX_CODE_BYTES: &str = "SANDCASTLE_MAX_CODE_BYTES";

// Per-client Rate Limiting
pub const SANDCASTLE_RATE_LIMIT_POINTS: &str = "SANDCASTLE_RATE_LIMIT_POINTS";
pub const SANDCASTLE_RATE_LIMIT_WINDOW_SECS: &str = "SANDCASTLE_RATE_LIMIT_WINDOW_SECS";

// Session Lifecycle
pub const SANDCASTLE_SESSION_TTL_SECS: &str = "SANDCASTLE_SESSION_TTL_SECS";
pub const SANDCASTLE_SWEEP_INTERVAL_SECS: &str = "SANDCASTLE_SWEEP_INTERVAL_SECS";
pub const SANDCASTLE_DATABASE_URL: &str = "SANDCASTLE_DATABASE_URL";

// Resource Profiles
pub const SANDCASTLE_EXECUTION_IMAGE: &str = "SANDCASTLE_EXECUTION_IMAGE";
pub const SANDCASTLE_EXECUTION_MEMORY_MB: &str = "SANDCASTLE_EXECUTION_MEMORY_MB";
pub const SANDCASTLE_EXECUTION_CPU_CORES: &str = "SANDCASTLE_EXECUTION_CPU_CORES";
pub const SANDCASTLE_IDE_IMAGE: &str = "SANDCASTLE_IDE_IMAGE";
pub const SANDCASTLE_IDE_MEMORY_MB: &str = "SANDCASTLE_IDE_MEMORY_MB";
pub const SANDCASTLE_IDE_CPU_CORES: &str = "SANDCASTLE_IDE_CPU_CORES";
pub const SANDCASTLE_BROWSER_IMAGE: &str = "SANDCASTLE_BROWSER_IMAGE";
pub const SANDCASTLE_BROWSER_MEMORY_MB: &str = "SANDCASTLE_BROWSER_MEMORY_MB";
pub const SANDCASTLE_BROWSER_CPU_CORES: &str = "SANDCASTLE_BROWSER_CPU_CORES";

// Port Ranges
pub const SANDCASTLE_IDE_PORT_RANGE: &str = "SANDCASTLE_IDE_PORT_RANGE";
pub const SANDCASTLE_BROWSER_PORT_RANGE: &str = "SANDCASTLE_BROWSER_PORT_RANGE";
pub const SANDCASTLE_PORT_RESERVATION_SECS: &str = "SANDCASTLE_PORT_RESERVATION_SECS";

// Runtime
pub const SANDCASTLE_LABEL_PREFIX: &str = "SANDCASTLE_LABEL_PREFIX";
pub const SANDCASTLE_WORKSPACE_ROOT: &str = "SANDCASTLE_WORKSPACE_ROOT";
pub const SANDCASTLE_PUBLIC_HOST: &str = "SANDCASTLE_PUBLIC_HOST";
pub const SANDCASTLE_IMAGE_PULL_TIMEOUT_SECS: &str = "SANDCASTLE_IMAGE_PULL_TIMEOUT_SECS";

// Logging
pub const RUST_LOG: &str = "RUST_LOG";
