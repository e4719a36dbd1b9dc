use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use glance_core::LivenessConfig;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Optional TOML file with liveness thresholds (`GLANCE_CONFIG`).
    pub liveness_path: Option<PathBuf>,
    /// Thresholds applied to every new session.
    pub liveness: LivenessConfig,
    /// Maximum number of concurrently open sessions.
    pub max_sessions: usize,
    /// Spoof-blocked sessions per caller before lockout.
    pub lockout_max_blocks: u32,
    /// Window over which blocked sessions are counted.
    pub lockout_window_secs: u64,
    /// How long a locked-out caller must wait.
    pub lockout_secs: u64,
    /// Seconds without a request before a session actor exits.
    pub session_idle_secs: u64,
    /// Whether the daemon is running on the session bus (development mode).
    /// Session ownership is not enforced on the session bus; all callers share the same user.
    pub session_bus: bool,
}

impl Config {
    /// Load configuration from `GLANCE_*` environment variables with defaults.
    pub fn from_env() -> Result<Self> {
        let liveness_path = std::env::var("GLANCE_CONFIG").ok().map(PathBuf::from);
        let liveness = match &liveness_path {
            Some(path) => LivenessConfig::from_file(path)
                .with_context(|| format!("invalid GLANCE_CONFIG {}", path.display()))?,
            None => LivenessConfig::default(),
        };

        Ok(Self {
            liveness_path,
            liveness,
            max_sessions: env_usize("GLANCE_MAX_SESSIONS", 16),
            lockout_max_blocks: env_u32("GLANCE_LOCKOUT_MAX_BLOCKS", 3),
            lockout_window_secs: env_u64("GLANCE_LOCKOUT_WINDOW_SECS", 60),
            lockout_secs: env_u64("GLANCE_LOCKOUT_SECS", 300),
            session_idle_secs: env_u64("GLANCE_SESSION_IDLE_SECS", 120).max(1),
            session_bus: std::env::var("GLANCE_SESSION_BUS").is_ok(),
        })
    }

    pub fn lockout_window(&self) -> Duration {
        Duration::from_secs(self.lockout_window_secs)
    }

    pub fn lockout_duration(&self) -> Duration {
        Duration::from_secs(self.lockout_secs)
    }

    pub fn session_idle(&self) -> Duration {
        Duration::from_secs(self.session_idle_secs)
    }
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
