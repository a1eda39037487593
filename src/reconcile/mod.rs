//! PoolReconciler: aligns persisted `PoolRecord`s with live kernel md state.
//!
//! Runs once at startup (after the first DriveCache/MdStatReader refresh)
//! and again on demand from `POST /api/v1/pools/validate`, both through the
//! single `reconcile(auto_mount)` entry point.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::commands::CommandRunner;
use crate::domain::MdArray;
use crate::drives::DriveCache;
use crate::mdstat::MdStatReader;
use crate::metadata::MetadataStore;
use crate::mounts::MountReader;

pub struct PoolReconciler {
    metadata: Arc<MetadataStore>,
    drives: Arc<DriveCache>,
    mdstat: Arc<MdStatReader>,
    mounts: Arc<MountReader>,
    commands: CommandRunner,
}

impl PoolReconciler {
    pub fn new(
        metadata: Arc<MetadataStore>,
        drives: Arc<DriveCache>,
        mdstat: Arc<MdStatReader>,
        mounts: Arc<MountReader>,
        commands: CommandRunner,
    ) -> Self {
        Self {
            metadata,
            drives,
            mdstat,
            mounts,
            commands,
        }
    }

    /// Reconciles every persisted pool against the current kernel state.
    /// Returns the count of records whose `lastMdDeviceName` was corrected —
    /// the value `ValidateAndUpdate` reports as `fixedEntries`.
    pub async fn reconcile(&self, auto_mount: bool) -> u32 {
        let serial_to_md = self.serial_to_current_md_name().await;
        let records = self.metadata.all().await;
        let mut fixed = 0;

        for mut record in records {
            let candidate_mds = current_mds_for(&record.drive_serials, &serial_to_md);

            let current_md = match candidate_mds.len() {
                0 => None,
                1 => Some(candidate_mds[0].0.clone()),
                _ => {
                    warn!(
                        pool = %record.pool_group_guid,
                        candidates = ?candidate_mds,
                        "pool serials map to multiple md arrays, picking the best match"
                    );
                    // `Iterator::max_by_key` keeps the *last* maximal element on
                    // ties; the tie-break here is first-in-iteration-order, so
                    // fold manually and only replace the current best on a
                    // strictly greater match count.
                    candidate_mds
                        .iter()
                        .fold(None, |best: Option<&(String, usize)>, candidate| match best {
                            Some(b) if b.1 >= candidate.1 => best,
                            _ => Some(candidate),
                        })
                        .map(|(name, _)| name.clone())
                }
            };

            match current_md {
                Some(name) if Some(&name) != record.last_md_device_name.as_ref() => {
                    info!(pool = %record.pool_group_guid, md = %name, "updating lastMdDeviceName");
                    record.last_md_device_name = Some(name);
                    self.metadata.save(record.clone()).await.ok();
                    fixed += 1;
                }
                Some(_) => {}
                None if record.is_mounted => {
                    if let Some(name) = self.attempt_assembly(&record).await {
                        record.last_md_device_name = Some(name);
                        self.metadata.save(record.clone()).await.ok();
                        fixed += 1;
                    }
                }
                None => {}
            }

            if auto_mount && record.is_mounted {
                self.ensure_mounted(&record).await;
            }
        }

        fixed
    }

    async fn serial_to_current_md_name(&self) -> BTreeMap<String, String> {
        let snapshot = self.drives.get();
        let mut map = BTreeMap::new();
        for disk in &snapshot.drives {
            let Some(serial) = &disk.serial else { continue };
            for md in disk.md_children() {
                map.insert(serial.clone(), md.name.clone());
            }
        }
        map
    }

    async fn attempt_assembly(&self, record: &crate::domain::PoolRecord) -> Option<String> {
        self.commands.run("mdadm", &["--scan"], true).await;

        let snapshot = self.drives.get();
        let device_paths: Vec<String> = snapshot
            .drives
            .iter()
            .filter(|d| {
                d.serial
                    .as_ref()
                    .map(|s| record.drive_serials.contains(s))
                    .unwrap_or(false)
            })
            .map(|d| d.preferred_device_path())
            .collect();

        if device_paths.is_empty() {
            return None;
        }

        let args: Vec<&str> = std::iter::once("--assemble")
            .chain(std::iter::once("--scan"))
            .chain(device_paths.iter().map(|s| s.as_str()))
            .collect();
        let outcome = self.commands.run("mdadm", &args, true).await;
        if !outcome.success {
            warn!(pool = %record.pool_group_guid, "mdadm assemble failed during reconciliation");
            return None;
        }

        let fresh = self.mdstat.snapshot().await;
        fresh
            .arrays
            .values()
            .find(|array| {
                array
                    .bare_device_names()
                    .iter()
                    .any(|name| device_paths.iter().any(|p| p.ends_with(name.as_str())))
            })
            .map(|array: &MdArray| array.name.clone())
    }

    async fn ensure_mounted(&self, record: &crate::domain::PoolRecord) {
        let (Some(md_name), Some(mount_path)) =
            (&record.last_md_device_name, &record.last_mount_path)
        else {
            return;
        };

        if self.mounts.is_mounted(mount_path).await {
            return;
        }

        self.commands
            .run("mkdir", &["-p", mount_path.as_str()], true)
            .await;
        let device = format!("/dev/{md_name}");
        let outcome = self
            .commands
            .run("mount", &[device.as_str(), mount_path.as_str()], true)
            .await;
        if !outcome.success {
            warn!(pool = %record.pool_group_guid, "auto-mount during reconciliation failed");
        }
    }
}

/// `(md_name, matching_serial_count)` pairs, in iteration order, for every
/// md array at least one of `serials` currently belongs to.
fn current_mds_for(
    serials: &indexmap::IndexSet<String>,
    serial_to_md: &BTreeMap<String, String>,
) -> Vec<(String, usize)> {
    let mut counts: Vec<(String, usize)> = Vec::new();
    for serial in serials {
        if let Some(md) = serial_to_md.get(serial) {
            if let Some(entry) = counts.iter_mut().find(|(name, _)| name == md) {
                entry.1 += 1;
            } else {
                counts.push((md.clone(), 1));
            }
        }
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexSet;

    #[test]
    fn current_mds_for_picks_up_all_matching_arrays() {
        let mut serials = IndexSet::new();
        serials.insert("S1".to_string());
        serials.insert("S2".to_string());

        let mut map = BTreeMap::new();
        map.insert("S1".to_string(), "md0".to_string());
        map.insert("S2".to_string(), "md0".to_string());

        let result = current_mds_for(&serials, &map);
        assert_eq!(result, vec![("md0".to_string(), 2)]);
    }

    #[test]
    fn current_mds_for_reports_split_membership() {
        let mut serials = IndexSet::new();
        serials.insert("S1".to_string());
        serials.insert("S2".to_string());

        let mut map = BTreeMap::new();
        map.insert("S1".to_string(), "md0".to_string());
        map.insert("S2".to_string(), "md1".to_string());

        let result = current_mds_for(&serials, &map);
        assert_eq!(result.len(), 2);
    }
}
