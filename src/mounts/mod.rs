//! MountReader: parses `/proc/mounts` and reports filesystem space via the
//! `statvfs` syscall (through the `nix` crate, the idiomatic wrapper for
//! this call on Linux).

use std::path::Path;
use std::sync::Arc;

use tracing::warn;

use crate::fsreader::FSReader;

#[derive(Debug, Clone)]
pub struct MountEntry {
    pub device: String,
    pub mount_point: String,
    pub fs_type: String,
    pub options: String,
}

#[derive(Debug, Clone, Default)]
pub struct SpaceInfo {
    pub size_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub use_percent: String,
}

pub struct MountReader {
    fsreader: Arc<FSReader>,
}

impl MountReader {
    pub fn new(fsreader: Arc<FSReader>) -> Self {
        Self { fsreader }
    }

    pub async fn mounts(&self) -> Vec<MountEntry> {
        let raw = self.fsreader.read_proc("mounts").await;
        parse_mounts(&raw)
    }

    pub async fn find_mount_point(&self, device: &str) -> Option<MountEntry> {
        self.mounts().await.into_iter().find(|m| m.device == device)
    }

    pub async fn is_mounted(&self, mount_point: &str) -> bool {
        self.mounts().await.iter().any(|m| m.mount_point == mount_point)
    }

    /// Derives `(size, used, available, percent)` for a mountpoint via
    /// `statvfs`. Unreadable/not-yet-ready mountpoints degrade to the
    /// `(0,0,0,"0%")` tuple rather than propagating an error.
    pub fn space_info(&self, mount_point: &str) -> SpaceInfo {
        match nix::sys::statvfs::statvfs(Path::new(mount_point)) {
            Ok(stat) => {
                let block_size = stat.fragment_size().max(1) as u64;
                let total = stat.blocks() as u64 * block_size;
                let free_to_root = stat.blocks_free() as u64 * block_size;
                let free_to_non_root = stat.blocks_available() as u64 * block_size;
                let used = total.saturating_sub(free_to_root);
                let percent = if total == 0 {
                    0.0
                } else {
                    (used as f64 / total as f64) * 100.0
                };
                SpaceInfo {
                    size_bytes: total,
                    used_bytes: used,
                    available_bytes: free_to_non_root,
                    use_percent: format!("{percent:.2}%"),
                }
            }
            Err(e) => {
                warn!(mount_point, error = %e, "statvfs failed, mountpoint not ready");
                SpaceInfo {
                    size_bytes: 0,
                    used_bytes: 0,
                    available_bytes: 0,
                    use_percent: "0%".to_string(),
                }
            }
        }
    }
}

/// Parses `/proc/mounts` lines of the form
/// `<device> <mountpoint> <fstype> <options> 0 0`, decoding `\040` escapes
/// in the mountpoint back to spaces.
pub fn parse_mounts(raw: &str) -> Vec<MountEntry> {
    raw.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?.to_string();
            let mount_point = unescape_octal_spaces(fields.next()?);
            let fs_type = fields.next()?.to_string();
            let options = fields.next().unwrap_or("").to_string();
            Some(MountEntry {
                device,
                mount_point,
                fs_type,
                options,
            })
        })
        .collect()
}

fn unescape_octal_spaces(s: &str) -> String {
    s.replace("\\040", " ")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
/dev/md0 /mnt/pool\\040one ext4 rw,relatime 0 0
tmpfs /run tmpfs rw,nosuid 0 0
";

    #[test]
    fn parses_mount_lines_and_unescapes_spaces() {
        let mounts = parse_mounts(SAMPLE);
        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[0].device, "/dev/md0");
        assert_eq!(mounts[0].mount_point, "/mnt/pool one");
        assert_eq!(mounts[0].fs_type, "ext4");
    }

    #[test]
    fn space_info_degrades_for_missing_mountpoint() {
        let dir = tempfile::tempdir().unwrap();
        let fsreader = Arc::new(FSReader::new(
            dir.path().join("proc"),
            dir.path().join("sys"),
            std::time::Duration::from_secs(5),
        ));
        let reader = MountReader::new(fsreader);
        let info = reader.space_info("/path/does/not/exist/at/all");
        assert_eq!(info.size_bytes, 0);
        assert_eq!(info.use_percent, "0%");
    }
}
