//! Agent configuration, bound from CLI flags / environment variables.
//!
//! Constructed once in `main` and handed to every component via constructor
//! injection — there is no global config lookup.

use std::time::Duration;

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "backy-agent", about = "Host agent for Linux md RAID pools")]
pub struct AgentConfig {
    /// Shared secret required in the `X-Api-Key` header of every mutating
    /// and inventory request.
    #[arg(long, env = "BACKY_API_KEY")]
    pub api_key: String,

    /// Address the REST/health/metrics servers bind to.
    #[arg(long, env = "BACKY_BIND_ADDR", default_value = "0.0.0.0")]
    pub bind_addr: String,

    /// REST API port.
    #[arg(long, env = "BACKY_LISTEN_PORT", default_value_t = 5151)]
    pub listen_port: u16,

    /// Health check server port.
    #[arg(long, env = "BACKY_HEALTH_PORT", default_value_t = 5152)]
    pub health_port: u16,

    /// Prometheus metrics server port.
    #[arg(long, env = "BACKY_METRICS_PORT", default_value_t = 5153)]
    pub metrics_port: u16,

    /// Device-name or path patterns excluded from drive listings and pool
    /// membership, each optionally ending in `*`.
    #[arg(long = "excluded-drive", env = "BACKY_EXCLUDED_DRIVES", value_delimiter = ',')]
    pub excluded_drives: Vec<String>,

    /// TTL, in seconds, for the FSReader/MdStatReader caches.
    #[arg(long, env = "BACKY_FILE_CACHE_TTL_SECONDS", default_value_t = 5)]
    pub file_cache_ttl_seconds: u64,

    /// How long a completed operation is kept before the sweeper evicts it.
    #[arg(long, env = "BACKY_OPERATION_RETENTION_HOURS", default_value_t = 24)]
    pub operation_retention_hours: u64,

    /// How often the OperationRegistry sweeper runs.
    #[arg(long, env = "BACKY_OPERATION_CLEANUP_INTERVAL_MINUTES", default_value_t = 60)]
    pub operation_cleanup_interval_minutes: u64,

    /// Whether PoolReconciler may run `mount` during startup reconciliation.
    #[arg(long, env = "BACKY_AUTO_MOUNT_ON_RECOVER", default_value_t = true)]
    pub auto_mount_on_recover: bool,

    /// Path to the durable pool-metadata file.
    #[arg(long, env = "BACKY_METADATA_PATH", default_value = "/var/lib/backy/pool-metadata.json")]
    pub metadata_path: String,

    /// Root substituted for `/proc` (overridden in tests).
    #[arg(long, env = "BACKY_PROC_ROOT", default_value = "/proc")]
    pub proc_root: String,

    /// Root substituted for `/sys` (overridden in tests).
    #[arg(long, env = "BACKY_SYSFS_ROOT", default_value = "/sys")]
    pub sysfs_root: String,

    /// Command used to escalate privilege for mutating commands, e.g. `sudo`.
    /// Empty string disables elevation (agent already running as root).
    #[arg(long, env = "BACKY_ELEVATE_COMMAND", default_value = "")]
    pub elevate_command: String,

    /// Log level / `RUST_LOG`-style filter.
    #[arg(long, env = "BACKY_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON instead of human-readable text.
    #[arg(long, env = "BACKY_LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}

impl AgentConfig {
    pub fn file_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.file_cache_ttl_seconds)
    }

    pub fn operation_retention_window(&self) -> Duration {
        Duration::from_secs(self.operation_retention_hours * 3600)
    }

    pub fn operation_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.operation_cleanup_interval_minutes * 60)
    }

    pub fn drive_cache_refresh_interval(&self) -> Duration {
        Duration::from_secs(60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_args() {
        let cfg = AgentConfig::parse_from(["backy-agent", "--api-key", "secret"]);
        assert_eq!(cfg.listen_port, 5151);
        assert_eq!(cfg.operation_retention_hours, 24);
        assert!(cfg.auto_mount_on_recover);
        assert_eq!(cfg.operation_retention_window(), Duration::from_secs(24 * 3600));
    }

    #[test]
    fn parses_excluded_drives_list() {
        let cfg = AgentConfig::parse_from([
            "backy-agent",
            "--api-key",
            "secret",
            "--excluded-drive",
            "sda,loop*",
        ]);
        assert_eq!(cfg.excluded_drives, vec!["sda".to_string(), "loop*".to_string()]);
    }
}
