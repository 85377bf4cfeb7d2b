//! Configuration management.
//!
//! Supports configuration from:
//! - TOML config files
//! - Environment variables
//! - CLI arguments (for `jimeng serve`)
//!
//! Durations are stored as integer milliseconds or seconds so the TOML stays
//! flat; accessors turn them into [`Duration`]s.

use std::path::PathBuf;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{JimengError, Result};

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Upstream endpoints and client behaviour
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Poll presets per job kind
    #[serde(default)]
    pub poll: PollPresets,

    /// Streaming timers
    #[serde(default)]
    pub stream: StreamConfig,

    /// Whole-flow retry
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Reference uploads
    #[serde(default)]
    pub upload: UploadConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| JimengError::Config(format!("Failed to read config file: {e}")))?;

        toml::from_str(&content)
            .map_err(|e| JimengError::Config(format!("Failed to parse config: {e}")))
    }

    /// Default config file location (`<config dir>/jimeng/config.toml`)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("jimeng").join("config.toml"))
    }

    /// Load the explicit file if given, else the default file if it exists,
    /// else defaults. Environment variables are applied on top.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let base = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_file(path)?,
                _ => Self::default(),
            },
        };
        Ok(base.apply_env())
    }

    /// Override fields from environment variables
    pub fn apply_env(mut self) -> Self {
        if let Ok(host) = std::env::var("JIMENG_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("JIMENG_PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }
        if let Ok(upstream) = std::env::var("JIMENG_UPSTREAM") {
            self.upstream.base_url = upstream;
        }
        if let Ok(storage) = std::env::var("JIMENG_STORAGE") {
            self.upstream.storage_url = storage;
        }
        self
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Maximum request body size in bytes (inline base64 images are large)
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            max_body_size: 100 * 1024 * 1024,
        }
    }
}

impl ServerConfig {
    /// Get the full listen address
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Upstream endpoints and client behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Control-plane base URL
    pub base_url: String,

    /// Object-storage endpoint used for apply/commit calls
    pub storage_url: String,

    /// Per-call timeout in seconds
    pub timeout_secs: u64,

    /// Retries per control-plane call on transport errors
    pub max_call_retries: u32,

    /// App id sent as `aid`
    pub app_id: String,

    /// Client version code (`Appvr`)
    pub version_code: String,

    /// Platform code (`Pf`)
    pub platform_code: String,

    /// Storage service id used when the upload token carries none
    pub fallback_service_id: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://jimeng.jianying.com".to_string(),
            storage_url: "https://imagex.bytedanceapi.com/".to_string(),
            timeout_secs: 45,
            max_call_retries: 3,
            app_id: "513695".to_string(),
            version_code: "5.8.0".to_string(),
            platform_code: "7".to_string(),
            fallback_service_id: "tb4s082cfz".to_string(),
        }
    }
}

impl UpstreamConfig {
    /// Per-call timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Poll loop tuning for one job kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollConfig {
    /// Wait before the first status query
    pub initial_delay_ms: u64,

    /// Base delay while no record exists yet (grows linearly)
    pub missing_base_ms: u64,

    /// Ceiling for the no-record delay
    pub missing_cap_ms: u64,

    /// Step delay while the record is processing
    pub processing_step_ms: u64,

    /// Maximum number of steps the processing delay grows to
    pub processing_max_steps: u32,

    /// Total status queries before giving up
    pub max_attempts: u32,

    /// After this many attempts, alternate with the secondary status endpoint
    pub secondary_after: Option<u32>,
}

impl PollConfig {
    /// Preset for image and composition jobs.
    pub fn image() -> Self {
        Self {
            initial_delay_ms: 1_000,
            missing_base_ms: 1_000,
            missing_cap_ms: 30_000,
            processing_step_ms: 1_000,
            processing_max_steps: 1,
            max_attempts: 600,
            secondary_after: Some(10),
        }
    }

    /// Preset for video jobs.
    pub fn video() -> Self {
        Self {
            initial_delay_ms: 5_000,
            missing_base_ms: 2_000,
            missing_cap_ms: 30_000,
            processing_step_ms: 2_000,
            processing_max_steps: 5,
            max_attempts: 60,
            secondary_after: Some(10),
        }
    }

    /// Delay before the first query.
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    /// Delay after an attempt that found no record: `min(base*(attempt+1), cap)`.
    pub fn missing_delay(&self, attempt: u32) -> Duration {
        let grown = self
            .missing_base_ms
            .saturating_mul(u64::from(attempt) + 1);
        Duration::from_millis(grown.min(self.missing_cap_ms))
    }

    /// Delay after an attempt that found the record still processing:
    /// `step*min(attempt+1, max_steps)`.
    pub fn processing_delay(&self, attempt: u32) -> Duration {
        let steps = (attempt + 1).min(self.processing_max_steps.max(1));
        Duration::from_millis(self.processing_step_ms.saturating_mul(u64::from(steps)))
    }

    /// Whether this attempt goes to the secondary status endpoint.
    pub fn uses_secondary(&self, attempt: u32) -> bool {
        match self.secondary_after {
            Some(threshold) => attempt > threshold && attempt % 2 == 0,
            None => false,
        }
    }
}

/// Poll presets per job kind
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollPresets {
    /// Image and composition jobs
    pub image: PollConfig,
    /// Video jobs
    pub video: PollConfig,
}

impl Default for PollPresets {
    fn default() -> Self {
        Self {
            image: PollConfig::image(),
            video: PollConfig::video(),
        }
    }
}

/// Floor for the heartbeat interval
pub const MIN_HEARTBEAT_MS: u64 = 100;

/// Streaming timers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Heartbeat interval in milliseconds
    pub heartbeat_ms: u64,

    /// One-shot guidance notice after this many milliseconds
    pub deadline_ms: u64,

    /// Hard bound on a stream's background job, in seconds
    pub max_lifetime_secs: u64,

    /// Buffered chunks between the emitter and the transport
    pub channel_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            heartbeat_ms: 5_000,
            deadline_ms: 120_000,
            max_lifetime_secs: 25 * 60,
            channel_capacity: 64,
        }
    }
}

impl StreamConfig {
    /// Heartbeat interval, never shorter than [`MIN_HEARTBEAT_MS`]
    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms.max(MIN_HEARTBEAT_MS))
    }

    /// Guidance deadline
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    /// Lifetime bound
    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_secs)
    }
}

/// Whole-flow retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Re-runs after the first attempt
    pub max_retries: u32,

    /// Fixed delay between runs, in milliseconds
    pub delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            delay_ms: 0,
        }
    }

    /// Delay between runs
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Reference upload configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Largest accepted reference, in bytes
    pub max_file_size: u64,

    /// Timeout for the HEAD probe, in seconds
    pub probe_timeout_secs: u64,

    /// Timeout for downloads and storage transfers, in seconds
    pub transfer_timeout_secs: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_file_size: 100 * 1024 * 1024,
            probe_timeout_secs: 15,
            transfer_timeout_secs: 60,
        }
    }
}

/// Identity fields the upstream expects from a browser session.
///
/// Built once at startup and shared; nothing mutates it afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Device id
    pub device_id: u64,
    /// `_tea_web_id` / `web_id`
    pub web_id: u64,
    /// `uid_tt`
    pub user_id: String,
}

impl DeviceIdentity {
    /// Random identity in the ranges the web client uses.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        Self {
            device_id: rng.gen_range(7_000_000_000_000_000_000..8_000_000_000_000_000_000),
            web_id: rng.gen_range(7_000_000_000_000_000_000..8_000_000_000_000_000_000),
            user_id: uuid::Uuid::new_v4().simple().to_string(),
        }
    }
}
