//! Core domain types.
//!
//! `Drive` and `MdArray` are transient snapshots of kernel state (rebuilt on
//! every cache refresh); `PoolRecord` is the durable record persisted by
//! `MetadataStore`; `Operation` is the ephemeral, in-memory record of one
//! asynchronous lifecycle invocation tracked by `OperationRegistry`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Drive
// ---------------------------------------------------------------------------

/// A block device as reported by `lsblk`. `serial` and `id_link` are the
/// stable identity across reboots; `name`/`path` are not.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Drive {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub serial: Option<String>,
    #[serde(default)]
    pub id_link: Option<String>,
    pub size: u64,
    #[serde(rename = "type")]
    pub device_type: String,
    #[serde(default)]
    pub vendor: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub fstype: Option<String>,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub mountpoint: Option<String>,
    #[serde(default)]
    pub children: Vec<Drive>,
}

impl Drive {
    pub fn is_disk(&self) -> bool {
        self.device_type == "disk"
    }

    /// Child (or self) names beginning with `md`, i.e. an md array built on
    /// top of this disk.
    pub fn md_children(&self) -> impl Iterator<Item = &Drive> {
        self.children.iter().filter(|c| c.name.starts_with("md"))
    }

    /// Preferred device path for passing to mdadm/mkfs/mount: the stable
    /// by-id link, falling back to the lsblk path, falling back to `/dev/<name>`.
    pub fn preferred_device_path(&self) -> String {
        if let Some(id_link) = &self.id_link {
            format!("/dev/disk/by-id/{id_link}")
        } else if !self.path.is_empty() {
            self.path.clone()
        } else {
            format!("/dev/{}", self.name)
        }
    }
}

// ---------------------------------------------------------------------------
// MdArray
// ---------------------------------------------------------------------------

/// A parsed block from `/proc/mdstat`. The name (`md0`, `md127`, ...) is the
/// kernel's current label and is not stable across reboots.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MdArray {
    pub name: String,
    pub state: String,
    pub is_active: bool,
    pub level: Option<String>,
    /// Ordered component device names, e.g. `sdb1[0]`.
    pub devices: Vec<String>,
    /// Per-slot status characters: `U` up, `_` failed, `S` spare.
    pub slots: Vec<char>,
    pub active_devices: u32,
    pub total_devices: u32,
    pub working_devices: u32,
    pub failed_devices: u32,
    pub spare_devices: u32,
    pub size_bytes: u64,
    pub resync: Option<ResyncInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResyncInfo {
    pub kind: ResyncKind,
    pub percent: f64,
    pub finish_minutes: Option<f64>,
    pub speed: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResyncKind {
    Resync,
    Recovery,
    Check,
}

impl MdArray {
    /// Bare device name stripped of the trailing `[role]` slot tag, e.g.
    /// `sdb1[0]` -> `sdb1`.
    pub fn bare_device_names(&self) -> Vec<String> {
        self.devices
            .iter()
            .map(|d| d.split('[').next().unwrap_or(d).to_string())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// PoolRecord (durable)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolRecord {
    pub pool_group_guid: Uuid,
    pub label: String,
    pub drive_serials: IndexSet<String>,
    #[serde(default)]
    pub drive_labels: BTreeMap<String, String>,
    pub last_md_device_name: Option<String>,
    pub last_mount_path: Option<String>,
    pub is_mounted: bool,
    pub created_at: DateTime<Utc>,
}

impl PoolRecord {
    pub fn new(
        pool_group_guid: Uuid,
        label: String,
        drive_serials: IndexSet<String>,
        drive_labels: BTreeMap<String, String>,
    ) -> Self {
        Self {
            pool_group_guid,
            label,
            drive_serials,
            drive_labels,
            last_md_device_name: None,
            last_mount_path: None,
            is_mounted: false,
            created_at: Utc::now(),
        }
    }
}

/// On-disk layout of the metadata file: `{ "pools": [...], "lastUpdated": ... }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataCollection {
    pub pools: Vec<PoolRecord>,
    pub last_updated: DateTime<Utc>,
}

impl Default for MetadataCollection {
    fn default() -> Self {
        Self {
            pools: Vec::new(),
            last_updated: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Operation (ephemeral)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationState {
    Creating,
    Mounting,
    Unmounting,
    Removing,
    Ready,
    Failed,
    Unmounted,
    Removed,
}

impl OperationState {
    /// States in which a mutating operation is considered "in flight" for
    /// the purposes of the per-GUID mutual-exclusion gate.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            OperationState::Creating
                | OperationState::Mounting
                | OperationState::Unmounting
                | OperationState::Removing
        )
    }

    pub fn is_terminal(self) -> bool {
        !self.is_in_flight()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolHealthStatus {
    Active,
    Resync,
    Degraded,
    Recovering,
    Failed,
    Inactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriveStatus {
    Active,
    Failed,
    Spare,
    Disconnected,
    Unknown,
}

/// One line of a command transcript: the invoked command string and its
/// captured (sanitised) output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptLine {
    pub command: String,
    pub output: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub pool_group_guid: Uuid,
    pub state: OperationState,
    pub pool_status: Option<PoolHealthStatus>,
    pub md_device_name: Option<String>,
    pub mount_path: Option<String>,
    pub error_message: Option<String>,
    pub command_transcript: Vec<TranscriptLine>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Operation {
    pub fn new(pool_group_guid: Uuid, state: OperationState) -> Self {
        Self {
            pool_group_guid,
            state,
            pool_status: None,
            md_device_name: None,
            mount_path: None,
            error_message: None,
            command_transcript: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn push_transcript(&mut self, command: impl Into<String>, output: impl Into<String>) {
        self.command_transcript.push(TranscriptLine {
            command: command.into(),
            output: output.into(),
        });
    }

    pub fn complete(&mut self, state: OperationState) {
        self.state = state;
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.error_message = Some(message.into());
        self.complete(OperationState::Failed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_flight_states() {
        assert!(OperationState::Creating.is_in_flight());
        assert!(OperationState::Unmounting.is_in_flight());
        assert!(!OperationState::Ready.is_in_flight());
        assert!(OperationState::Ready.is_terminal());
    }

    #[test]
    fn bare_device_names_strip_slot_tags() {
        let arr = MdArray {
            devices: vec!["sdb1[0]".into(), "sdc1[1]".into()],
            ..Default::default()
        };
        assert_eq!(arr.bare_device_names(), vec!["sdb1", "sdc1"]);
    }

    #[test]
    fn preferred_device_path_prefers_id_link() {
        let drive = Drive {
            name: "sdb".into(),
            path: "/dev/sdb".into(),
            serial: Some("S1".into()),
            id_link: Some("ata-WDC_WD40-S1".into()),
            size: 0,
            device_type: "disk".into(),
            vendor: None,
            model: None,
            fstype: None,
            uuid: None,
            mountpoint: None,
            children: Vec::new(),
        };
        assert_eq!(
            drive.preferred_device_path(),
            "/dev/disk/by-id/ata-WDC_WD40-S1"
        );
    }
}
