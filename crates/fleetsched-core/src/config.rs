use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{FleetError, Result};

pub const DEFAULT_PORT: u16 = 18790;
pub const DEFAULT_BIND: &str = "127.0.0.1";
/// Width of the due window: jobs whose start time is up to this far in the
/// past are still picked up, which absorbs late or jittery triggers.
pub const DEFAULT_DUE_WINDOW_SECS: u64 = 15 * 60;
pub const DEFAULT_MAX_CONCURRENT_JOBS: usize = 8;
pub const DEFAULT_MAX_CONCURRENT_PUSHES: usize = 16;
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Top-level config (fleetsched.toml + FLEETSCHED_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FleetConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub mdm: MdmConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub trigger: TriggerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Remote device-management API. Both fields are required for a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MdmConfig {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_token: String,
    /// Optional directory scope for "list devices".
    #[serde(default)]
    pub directory_id: Option<String>,
    /// Transport-level timeout applied by the HTTP client.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for MdmConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_token: String::new(),
            directory_id: None,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

/// Execution engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_due_window_secs")]
    pub due_window_secs: u64,
    /// Upper bound on jobs processed at once within a single run.
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    /// Upper bound on in-flight profile pushes per job.
    #[serde(default = "default_max_concurrent_pushes")]
    pub max_concurrent_pushes: usize,
    /// Deadline for any single remote call (directory fetch or push).
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    /// When set, the gateway fires the engine itself at this cadence.
    #[serde(default)]
    pub poll_interval_secs: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            due_window_secs: DEFAULT_DUE_WINDOW_SECS,
            max_concurrent_jobs: DEFAULT_MAX_CONCURRENT_JOBS,
            max_concurrent_pushes: DEFAULT_MAX_CONCURRENT_PUSHES,
            call_timeout_secs: DEFAULT_CALL_TIMEOUT_SECS,
            poll_interval_secs: None,
        }
    }
}

/// Authentication for manually issued trigger calls.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TriggerConfig {
    /// Bearer keys accepted on `POST /schedules/execute`. Empty rejects all manual calls.
    #[serde(default)]
    pub api_keys: Vec<String>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_due_window_secs() -> u64 {
    DEFAULT_DUE_WINDOW_SECS
}
fn default_max_concurrent_jobs() -> usize {
    DEFAULT_MAX_CONCURRENT_JOBS
}
fn default_max_concurrent_pushes() -> usize {
    DEFAULT_MAX_CONCURRENT_PUSHES
}
fn default_call_timeout_secs() -> u64 {
    DEFAULT_CALL_TIMEOUT_SECS
}
fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.fleetsched/fleetsched.db", home)
}

impl FleetConfig {
    /// Load config from a TOML file with FLEETSCHED_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g. `FLEETSCHED_MDM__API_TOKEN`,
    /// so that field names containing `_` survive the split.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: FleetConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("FLEETSCHED_").split("__"))
            .extract()
            .map_err(|e| FleetError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Reject configurations that cannot execute a run at all.
    pub fn validate(&self) -> Result<()> {
        if self.mdm.base_url.trim().is_empty() {
            return Err(FleetError::Config("mdm.base_url is not set".to_string()));
        }
        if self.mdm.api_token.trim().is_empty() {
            return Err(FleetError::Config("mdm.api_token is not set".to_string()));
        }
        if self.engine.max_concurrent_jobs == 0 || self.engine.max_concurrent_pushes == 0 {
            return Err(FleetError::Config(
                "engine concurrency limits must be at least 1".to_string(),
            ));
        }
        if self.engine.due_window_secs == 0 {
            return Err(FleetError::Config(
                "engine.due_window_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.fleetsched/fleetsched.toml", home)
}
