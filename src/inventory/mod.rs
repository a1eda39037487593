//! InventoryAPI: read-only composition of MdStatReader + MetadataStore +
//! DriveCache + MountReader into the views the HTTP layer serves.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::domain::{DriveStatus, MdArray, PoolHealthStatus, PoolRecord};
use crate::drives::DriveCache;
use crate::mdstat::MdStatReader;
use crate::metadata::MetadataStore;
use crate::mounts::MountReader;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolDriveView {
    pub serial: String,
    pub label: Option<String>,
    pub status: DriveStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSummary {
    pub pool_group_guid: Uuid,
    pub label: String,
    pub md_device_name: Option<String>,
    pub mount_path: Option<String>,
    pub pool_status: PoolHealthStatus,
    pub drives: Vec<PoolDriveView>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolDetail {
    pub pool_group_guid: Uuid,
    pub label: String,
    pub md_device_name: Option<String>,
    pub pool_status: PoolHealthStatus,
    pub size_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub use_percent: String,
    pub mount_path: Option<String>,
    pub drives: Vec<PoolDriveView>,
    pub resync_percentage: Option<f64>,
    pub resync_time_estimate_minutes: Option<f64>,
}

pub struct InventoryAPI {
    mdstat: Arc<MdStatReader>,
    metadata: Arc<MetadataStore>,
    drives: Arc<DriveCache>,
    mounts: Arc<MountReader>,
}

impl InventoryAPI {
    pub fn new(
        mdstat: Arc<MdStatReader>,
        metadata: Arc<MetadataStore>,
        drives: Arc<DriveCache>,
        mounts: Arc<MountReader>,
    ) -> Self {
        Self {
            mdstat,
            metadata,
            drives,
            mounts,
        }
    }

    pub async fn list_pools(&self) -> Vec<PoolSummary> {
        let snapshot = self.mdstat.snapshot().await;
        let records = self.metadata.all().await;

        records
            .iter()
            .map(|record| self.summarise(record, &snapshot))
            .collect()
    }

    pub async fn get_by_guid(&self, guid: Uuid) -> Option<PoolDetail> {
        let record = self.metadata.get_by_guid(guid).await?;
        Some(self.detail_for(&record).await)
    }

    pub async fn get_by_md_name(&self, name: &str) -> Option<PoolDetail> {
        let record = self.metadata.get_by_md_device_name(name).await?;
        Some(self.detail_for(&record).await)
    }

    fn summarise(&self, record: &PoolRecord, snapshot: &crate::mdstat::MdStatSnapshot) -> PoolSummary {
        let array = record
            .last_md_device_name
            .as_deref()
            .and_then(|name| snapshot.arrays.get(name));

        PoolSummary {
            pool_group_guid: record.pool_group_guid,
            label: record.label.clone(),
            md_device_name: record.last_md_device_name.clone(),
            mount_path: record.last_mount_path.clone(),
            pool_status: pool_health(array),
            drives: self.drive_views(record, array),
        }
    }

    async fn detail_for(&self, record: &PoolRecord) -> PoolDetail {
        let snapshot = self.mdstat.snapshot().await;
        let array = record
            .last_md_device_name
            .as_deref()
            .and_then(|name| snapshot.arrays.get(name));

        let space = match (&record.last_mount_path, record.is_mounted) {
            (Some(path), true) => self.mounts.space_info(path),
            _ => Default::default(),
        };

        PoolDetail {
            pool_group_guid: record.pool_group_guid,
            label: record.label.clone(),
            md_device_name: record.last_md_device_name.clone(),
            pool_status: pool_health(array),
            size_bytes: space.size_bytes,
            used_bytes: space.used_bytes,
            available_bytes: space.available_bytes,
            use_percent: space.use_percent,
            mount_path: record.last_mount_path.clone(),
            drives: self.drive_views(record, array),
            resync_percentage: array.and_then(|a| a.resync.as_ref()).map(|r| r.percent),
            resync_time_estimate_minutes: array
                .and_then(|a| a.resync.as_ref())
                .and_then(|r| r.finish_minutes),
        }
    }

    /// Maps each recorded serial to a status: `active`/`failed`/`spare` from
    /// the md's slot characters when the serial's device is still a member,
    /// `disconnected` when the serial is in metadata but no longer present.
    fn drive_views(&self, record: &PoolRecord, array: Option<&MdArray>) -> Vec<PoolDriveView> {
        let connected = self.drives.get();
        let serial_by_name: BTreeMap<&str, &str> = connected
            .drives
            .iter()
            .filter_map(|d| d.serial.as_deref().map(|s| (d.name.as_str(), s)))
            .collect();

        let mut member_status: BTreeMap<&str, DriveStatus> = BTreeMap::new();
        if let Some(array) = array {
            for (bare_name, slot) in array.bare_device_names().iter().zip(array.slots.iter()) {
                let status = match slot {
                    'U' => DriveStatus::Active,
                    '_' => DriveStatus::Failed,
                    'S' => DriveStatus::Spare,
                    _ => DriveStatus::Unknown,
                };
                if let Some(serial) = serial_by_name.get(bare_name.as_str()) {
                    member_status.insert(serial, status);
                }
            }
        }

        record
            .drive_serials
            .iter()
            .map(|serial| {
                let status = member_status
                    .get(serial.as_str())
                    .copied()
                    .unwrap_or(DriveStatus::Disconnected);
                PoolDriveView {
                    serial: serial.clone(),
                    label: record.drive_labels.get(serial).cloned(),
                    status,
                }
            })
            .collect()
    }
}

fn pool_health(array: Option<&MdArray>) -> PoolHealthStatus {
    let Some(array) = array else {
        return PoolHealthStatus::Inactive;
    };
    if !array.is_active {
        return PoolHealthStatus::Inactive;
    }
    if let Some(resync) = &array.resync {
        return match resync.kind {
            crate::domain::ResyncKind::Resync | crate::domain::ResyncKind::Check => {
                PoolHealthStatus::Resync
            }
            crate::domain::ResyncKind::Recovery => PoolHealthStatus::Recovering,
        };
    }
    if array.failed_devices > 0 {
        return PoolHealthStatus::Degraded;
    }
    if array.active_devices == 0 && array.total_devices == 0 {
        return PoolHealthStatus::Failed;
    }
    PoolHealthStatus::Active
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MdArray, ResyncInfo, ResyncKind};

    #[test]
    fn pool_health_prioritises_resync_over_degraded() {
        let array = MdArray {
            is_active: true,
            failed_devices: 1,
            resync: Some(ResyncInfo {
                kind: ResyncKind::Resync,
                percent: 10.0,
                finish_minutes: None,
                speed: None,
            }),
            ..Default::default()
        };
        assert_eq!(pool_health(Some(&array)), PoolHealthStatus::Resync);
    }

    #[test]
    fn pool_health_inactive_when_array_absent() {
        assert_eq!(pool_health(None), PoolHealthStatus::Inactive);
    }

    #[test]
    fn pool_health_degraded_on_failed_slot() {
        let array = MdArray {
            is_active: true,
            failed_devices: 1,
            ..Default::default()
        };
        assert_eq!(pool_health(Some(&array)), PoolHealthStatus::Degraded);
    }
}
