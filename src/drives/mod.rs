//! DriveCache: periodically refreshed `lsblk -J -b` snapshot, filtered to
//! whole disks with exclusions applied.
//!
//! The JSON shape mirrors real `lsblk -J -O` output: a recursive
//! `blockdevices` tree with optional `children`. Deserialisation into
//! `LsblkDevice` follows the same approach real inspection tools use for
//! this command (structured children, `serial`/`path`/`size` fields, a
//! string for the device type).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{info, warn};

use crate::commands::CommandRunner;
use crate::domain::Drive;
use crate::metrics::Metrics;

#[derive(Debug, Clone, Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Debug, Clone, Deserialize)]
struct LsblkDevice {
    name: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    serial: Option<String>,
    #[serde(rename = "id-link", default)]
    id_link: Option<String>,
    #[serde(default)]
    size: u64,
    #[serde(rename = "type", default)]
    device_type: String,
    #[serde(default)]
    vendor: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    fstype: Option<String>,
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    mountpoint: Option<String>,
    #[serde(default)]
    children: Option<Vec<LsblkDevice>>,
}

impl From<LsblkDevice> for Drive {
    fn from(d: LsblkDevice) -> Self {
        Drive {
            path: d.path.clone().unwrap_or_else(|| format!("/dev/{}", d.name)),
            serial: d.serial.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()),
            id_link: d.id_link,
            size: d.size,
            device_type: d.device_type,
            vendor: d.vendor.map(|v| v.trim().to_string()),
            model: d.model.map(|m| m.trim().to_string()),
            fstype: d.fstype,
            uuid: d.uuid,
            mountpoint: d.mountpoint,
            children: d
                .children
                .unwrap_or_default()
                .into_iter()
                .map(Drive::from)
                .collect(),
            name: d.name,
        }
    }
}

/// A pattern matches a drive's bare name or full path if it equals the
/// pattern, or the pattern ends in `*` and the value starts with the prefix.
fn pattern_matches(pattern: &str, value: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix('*') {
        value.starts_with(prefix)
    } else {
        value == pattern
    }
}

fn is_excluded(drive: &Drive, patterns: &[String]) -> bool {
    let bare_name = drive.name.as_str();
    patterns.iter().any(|p| {
        let path_pattern = p.as_str();
        let name_pattern = p.strip_prefix("/dev/").unwrap_or(p);
        pattern_matches(path_pattern, &drive.path) || pattern_matches(name_pattern, bare_name)
    })
}

#[derive(Debug, Clone)]
pub struct DriveSnapshot {
    pub drives: Vec<Drive>,
    pub refreshed_at: Instant,
}

pub struct DriveCache {
    commands: CommandRunner,
    excluded_patterns: Vec<String>,
    snapshot: RwLock<Arc<DriveSnapshot>>,
    refreshing: AtomicBool,
    metrics: Metrics,
}

impl DriveCache {
    pub fn new(excluded_patterns: Vec<String>, metrics: Metrics) -> Self {
        Self {
            commands: CommandRunner::default(),
            excluded_patterns,
            snapshot: RwLock::new(Arc::new(DriveSnapshot {
                drives: Vec::new(),
                refreshed_at: Instant::now(),
            })),
            refreshing: AtomicBool::new(false),
            metrics,
        }
    }

    pub fn get(&self) -> Arc<DriveSnapshot> {
        self.snapshot.read().clone()
    }

    /// Refreshes the snapshot. Acquires a non-blocking binary gate: if
    /// another refresh is already running, returns `false` immediately
    /// without waiting.
    pub async fn refresh(&self) -> bool {
        if self
            .refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let outcome = self
            .commands
            .run("lsblk", &["-J", "-b", "-O"], false)
            .await;

        if !outcome.success {
            warn!(output = %outcome.sanitised_output, "lsblk invocation failed");
            self.refreshing.store(false, Ordering::Release);
            return false;
        }

        match serde_json::from_str::<LsblkOutput>(&outcome.raw_output) {
            Ok(parsed) => {
                let drives: Vec<Drive> = parsed
                    .blockdevices
                    .into_iter()
                    .map(Drive::from)
                    .filter(|d| d.is_disk())
                    .filter(|d| !is_excluded(d, &self.excluded_patterns))
                    .collect();

                self.metrics.drives_total.set(drives.len() as f64);
                let snapshot = Arc::new(DriveSnapshot {
                    drives,
                    refreshed_at: Instant::now(),
                });
                // Replacing the whole Arc is the atomic-from-a-reader's-view
                // swap: no reader ever observes a half-built list.
                *self.snapshot.write() = snapshot;
                info!("drive cache refreshed");
                self.refreshing.store(false, Ordering::Release);
                true
            }
            Err(e) => {
                warn!(error = %e, "could not parse lsblk output");
                self.refreshing.store(false, Ordering::Release);
                false
            }
        }
    }

    pub fn excluded_patterns(&self) -> &[String] {
        &self.excluded_patterns
    }
}

/// Runs `refresh()` on an interval until `shutdown` fires.
pub async fn run_refresh_loop(
    cache: Arc<DriveCache>,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                cache.refresh().await;
            }
            _ = shutdown.recv() => {
                info!("drive cache refresh loop shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_matches_exact_and_glob() {
        assert!(pattern_matches("sda", "sda"));
        assert!(!pattern_matches("sda", "sdab"));
        assert!(pattern_matches("loop*", "loop0"));
        assert!(!pattern_matches("loop*", "sda"));
    }

    #[test]
    fn exclusion_matches_path_or_bare_name() {
        let drive = Drive {
            name: "sda".into(),
            path: "/dev/sda".into(),
            serial: None,
            id_link: None,
            size: 0,
            device_type: "disk".into(),
            vendor: None,
            model: None,
            fstype: None,
            uuid: None,
            mountpoint: None,
            children: Vec::new(),
        };
        assert!(is_excluded(&drive, &["sda".to_string()]));
        assert!(is_excluded(&drive, &["/dev/sda".to_string()]));
        assert!(!is_excluded(&drive, &["sdb".to_string()]));
    }

    #[test]
    fn deserialises_lsblk_json_with_nested_children() {
        let raw = r#"{
            "blockdevices": [
                {
                    "name": "sda",
                    "path": "/dev/sda",
                    "serial": "S1",
                    "size": 1000,
                    "type": "disk",
                    "children": [
                        {"name": "sda1", "path": "/dev/sda1", "size": 500, "type": "part"}
                    ]
                },
                {"name": "loop0", "path": "/dev/loop0", "size": 0, "type": "loop"}
            ]
        }"#;
        let parsed: LsblkOutput = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.blockdevices.len(), 2);
        let drive: Drive = parsed.blockdevices[0].clone().into();
        assert_eq!(drive.children.len(), 1);
        assert!(drive.is_disk());
    }
}
