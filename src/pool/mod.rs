//! PoolOperator: executes the mutating pool lifecycle sequences
//! (create/mount/unmount/remove), recording each command to the Operation's
//! transcript and unwinding via a LIFO rollback stack on failure.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use indexmap::IndexSet;
use tracing::warn;
use uuid::Uuid;

use crate::commands::CommandRunner;
use crate::domain::{Operation, PoolRecord};
use crate::drives::DriveCache;
use crate::error::{Error, Result};
use crate::inventory::InventoryAPI;
use crate::mdstat::MdStatReader;
use crate::metadata::MetadataStore;
use crate::mounts::MountReader;

type Compensation = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// LIFO stack of compensating actions, drained in reverse on failure.
#[derive(Default)]
struct RollbackStack {
    actions: Vec<Compensation>,
}

impl RollbackStack {
    fn push(&mut self, action: Compensation) {
        self.actions.push(action);
    }

    async fn unwind(self) {
        for action in self.actions.into_iter().rev() {
            action().await;
        }
    }
}

pub struct PoolOperator {
    commands: CommandRunner,
    drives: Arc<DriveCache>,
    metadata: Arc<MetadataStore>,
    mdstat: Arc<MdStatReader>,
    mounts: Arc<MountReader>,
    inventory: Arc<InventoryAPI>,
}

impl PoolOperator {
    pub fn new(
        commands: CommandRunner,
        drives: Arc<DriveCache>,
        metadata: Arc<MetadataStore>,
        mdstat: Arc<MdStatReader>,
        mounts: Arc<MountReader>,
        inventory: Arc<InventoryAPI>,
    ) -> Self {
        Self {
            commands,
            drives,
            metadata,
            mdstat,
            mounts,
            inventory,
        }
    }

    /// Lowest non-negative `n` such that `md<n>` is not a known array.
    async fn next_free_md_name(&self) -> String {
        let snapshot = self.mdstat.snapshot().await;
        let mut n = 0;
        loop {
            let candidate = format!("md{n}");
            if !snapshot.arrays.contains_key(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    pub async fn create_pool(
        &self,
        op: &mut Operation,
        label: String,
        drive_serials: IndexSet<String>,
        drive_labels: BTreeMap<String, String>,
        mount_path: String,
        pool_group_guid: Option<Uuid>,
    ) -> Result<PoolRecord> {
        if label.trim().is_empty() {
            return Err(Error::Validation("label must not be empty".into()));
        }
        if drive_serials.is_empty() {
            return Err(Error::Validation("at least one drive is required".into()));
        }
        if !mount_path.starts_with('/') {
            return Err(Error::Validation("mountPath must be absolute".into()));
        }
        if let Some(guid) = pool_group_guid {
            if self.metadata.get_by_guid(guid).await.is_some() {
                return Err(Error::Validation(format!("pool {guid} already exists")));
            }
        }

        let snapshot = self.drives.get();
        let mut device_paths = Vec::with_capacity(drive_serials.len());
        for serial in &drive_serials {
            let drive = snapshot
                .drives
                .iter()
                .find(|d| d.serial.as_deref() == Some(serial.as_str()))
                .ok_or_else(|| Error::Validation(format!("unknown drive serial '{serial}'")))?;
            device_paths.push(drive.preferred_device_path());
        }

        let mut rollback = RollbackStack::default();
        let md_name = self.next_free_md_name().await;

        let create_args: Vec<String> = std::iter::once(format!("/dev/{md_name}"))
            .chain(["--level=1".to_string(), format!("--raid-devices={}", device_paths.len())])
            .chain(device_paths.iter().cloned())
            .chain(["--run".to_string(), "--force".to_string()])
            .collect();
        let create_refs: Vec<&str> = std::iter::once("--create")
            .chain(create_args.iter().map(|s| s.as_str()))
            .collect();
        let outcome = self.commands.run("mdadm", &create_refs, true).await;
        op.push_transcript(&outcome.command_string, &outcome.sanitised_output);
        if !outcome.success {
            return Err(Error::SystemCommand {
                command: outcome.command_string,
                output: outcome.sanitised_output,
            });
        }
        let stop_device = format!("/dev/{md_name}");
        let commands_for_rollback = self.commands.clone();
        rollback.push(Box::new(move || {
            Box::pin(async move {
                commands_for_rollback.run("mdadm", &["--stop", &stop_device], true).await;
            })
        }));

        let device = format!("/dev/{md_name}");
        let outcome = self.commands.run("mkfs.ext4", &["-F", &device], true).await;
        op.push_transcript(&outcome.command_string, &outcome.sanitised_output);
        if !outcome.success {
            rollback.unwind().await;
            return Err(Error::SystemCommand {
                command: outcome.command_string,
                output: outcome.sanitised_output,
            });
        }

        let outcome = self.commands.run("mkdir", &["-p", &mount_path], true).await;
        op.push_transcript(&outcome.command_string, &outcome.sanitised_output);
        if !outcome.success {
            rollback.unwind().await;
            return Err(Error::SystemCommand {
                command: outcome.command_string,
                output: outcome.sanitised_output,
            });
        }

        let outcome = self.commands.run("mount", &[&device, &mount_path], true).await;
        op.push_transcript(&outcome.command_string, &outcome.sanitised_output);
        if !outcome.success {
            rollback.unwind().await;
            return Err(Error::SystemCommand {
                command: outcome.command_string,
                output: outcome.sanitised_output,
            });
        }
        let unmount_path = mount_path.clone();
        let commands_for_rollback = self.commands.clone();
        rollback.push(Box::new(move || {
            Box::pin(async move {
                commands_for_rollback.run("umount", &[&unmount_path], true).await;
            })
        }));

        let guid = pool_group_guid.unwrap_or_else(Uuid::new_v4);
        let mut record = PoolRecord::new(guid, label, drive_serials, drive_labels);
        record.is_mounted = true;
        record.last_mount_path = Some(mount_path);
        record.last_md_device_name = Some(md_name);
        if let Err(e) = self.metadata.save(record.clone()).await {
            rollback.unwind().await;
            return Err(e);
        }
        self.drives.refresh().await;

        Ok(record)
    }

    pub async fn mount_pool(
        &self,
        op: &mut Operation,
        pool_group_guid: Uuid,
        mount_path: String,
    ) -> Result<PoolRecord> {
        let mut record = self
            .metadata
            .get_by_guid(pool_group_guid)
            .await
            .ok_or_else(|| Error::NotFound(format!("pool {pool_group_guid}")))?;

        if record.is_mounted && record.last_mount_path.as_deref() == Some(mount_path.as_str()) {
            return Ok(record);
        }

        if let Some(existing) = self.inventory.list_pools().await.into_iter().find(|p| {
            p.pool_group_guid != pool_group_guid && p.mount_path.as_deref() == Some(mount_path.as_str())
        }) {
            return Err(Error::Validation(format!(
                "Mount path '{mount_path}' is already in use by pool '{}'",
                existing.md_device_name.unwrap_or_default()
            )));
        }

        let md_name = match &record.last_md_device_name {
            Some(name) => {
                let device = format!("/dev/{name}");
                let outcome = self.commands.run("mdadm", &["--detail", &device], false).await;
                if outcome.success {
                    name.clone()
                } else {
                    self.assemble_fresh(op, &record).await?
                }
            }
            None => self.assemble_fresh(op, &record).await?,
        };

        let outcome = self.commands.run("mkdir", &["-p", &mount_path], true).await;
        op.push_transcript(&outcome.command_string, &outcome.sanitised_output);
        if !outcome.success {
            return Err(Error::SystemCommand {
                command: outcome.command_string,
                output: outcome.sanitised_output,
            });
        }

        let device = format!("/dev/{md_name}");
        let outcome = self.commands.run("mount", &[&device, &mount_path], true).await;
        op.push_transcript(&outcome.command_string, &outcome.sanitised_output);
        if !outcome.success {
            return Err(Error::SystemCommand {
                command: outcome.command_string,
                output: outcome.sanitised_output,
            });
        }

        record.last_md_device_name = Some(md_name);
        record.last_mount_path = Some(mount_path);
        record.is_mounted = true;
        self.metadata.save(record.clone()).await?;
        Ok(record)
    }

    async fn assemble_fresh(&self, op: &mut Operation, record: &PoolRecord) -> Result<String> {
        let md_name = self.next_free_md_name().await;

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

        let device = format!("/dev/{md_name}");
        let args: Vec<&str> = std::iter::once("--assemble")
            .chain(std::iter::once(device.as_str()))
            .chain(device_paths.iter().map(|s| s.as_str()))
            .collect();
        let outcome = self.commands.run("mdadm", &args, true).await;
        op.push_transcript(&outcome.command_string, &outcome.sanitised_output);
        if !outcome.success {
            return Err(Error::SystemCommand {
                command: outcome.command_string,
                output: outcome.sanitised_output,
            });
        }
        Ok(md_name)
    }

    pub async fn unmount_pool(&self, op: &mut Operation, pool_group_guid: Uuid) -> Result<PoolRecord> {
        let mut record = self
            .metadata
            .get_by_guid(pool_group_guid)
            .await
            .ok_or_else(|| Error::NotFound(format!("pool {pool_group_guid}")))?;

        let mount_path = match record.last_mount_path.clone().filter(|_| record.is_mounted) {
            Some(path) => path,
            None => {
                op.push_transcript("unmount", "pool is already not mounted");
                return Ok(record);
            }
        };

        let outcome = self.commands.run("lsof", &["+f", "--", &mount_path], false).await;
        if outcome.success && !outcome.sanitised_output.trim().is_empty() {
            let processes = outcome
                .sanitised_output
                .lines()
                .skip(1)
                .filter_map(|line| {
                    let mut fields = line.split_whitespace();
                    let command = fields.next()?;
                    let pid = fields.next()?;
                    Some(format!("{command}({pid})"))
                })
                .collect::<Vec<_>>()
                .join(", ");
            if !processes.is_empty() {
                return Err(Error::Validation(format!(
                    "Cannot unmount: processes using mount point: {processes}"
                )));
            }
        }

        let outcome = self.commands.run("umount", &[&mount_path], true).await;
        op.push_transcript(&outcome.command_string, &outcome.sanitised_output);
        if !outcome.success {
            return Err(Error::SystemCommand {
                command: outcome.command_string,
                output: outcome.sanitised_output,
            });
        }

        record.is_mounted = false;
        if let Some(md_name) = &record.last_md_device_name {
            let device = format!("/dev/{md_name}");
            let outcome = self.commands.run("mdadm", &["--stop", &device], true).await;
            op.push_transcript(&outcome.command_string, &outcome.sanitised_output);
        }

        self.metadata.save(record.clone()).await?;
        Ok(record)
    }

    pub async fn remove_pool(&self, op: &mut Operation, pool_group_guid: Uuid) -> Result<()> {
        let record = self
            .metadata
            .get_by_guid(pool_group_guid)
            .await
            .ok_or_else(|| Error::NotFound(format!("pool {pool_group_guid}")))?;

        if record.is_mounted {
            if let Some(mount_path) = &record.last_mount_path {
                let outcome = self.commands.run("umount", &[mount_path.as_str()], true).await;
                op.push_transcript(&outcome.command_string, &outcome.sanitised_output);
            }
        }

        if let Some(md_name) = &record.last_md_device_name {
            let device = format!("/dev/{md_name}");
            let detail = self.commands.run("mdadm", &["--detail", &device], false).await;
            if detail.success {
                for line in detail.sanitised_output.lines() {
                    if let Some(dev_path) = line.split_whitespace().find(|tok| tok.starts_with("/dev/")) {
                        let outcome = self.commands.run("wipefs", &["-a", dev_path], true).await;
                        op.push_transcript(&outcome.command_string, &outcome.sanitised_output);
                        if !outcome.success {
                            warn!(device = dev_path, "wipefs failed, continuing removal");
                        }
                    }
                }
            }

            let outcome = self.commands.run("mdadm", &["--remove", &device], true).await;
            op.push_transcript(&outcome.command_string, &outcome.sanitised_output);
        }

        self.metadata.remove(pool_group_guid).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OperationState;
    use crate::fsreader::FSReader;
    use crate::mdstat::MdStatReader;
    use crate::metrics::Metrics;
    use crate::mounts::MountReader;
    use std::time::Duration;

    #[tokio::test]
    async fn rollback_stack_drains_in_reverse_order() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut stack = RollbackStack::default();

        let o1 = order.clone();
        stack.push(Box::new(move || {
            Box::pin(async move { o1.lock().push(1) })
        }));
        let o2 = order.clone();
        stack.push(Box::new(move || {
            Box::pin(async move { o2.lock().push(2) })
        }));

        stack.unwind().await;
        assert_eq!(*order.lock(), vec![2, 1]);
    }

    async fn test_operator(dir: &std::path::Path) -> PoolOperator {
        let metrics = Metrics::for_test();
        let commands = CommandRunner::new("");
        let fsreader = Arc::new(FSReader::new("/proc", "/sys", Duration::from_secs(5)));
        let drives = Arc::new(DriveCache::new(Vec::new(), metrics.clone()));
        let mdstat = Arc::new(MdStatReader::new(fsreader.clone()));
        let mounts = Arc::new(MountReader::new(fsreader));
        let metadata = Arc::new(
            MetadataStore::load(dir.join("pool-metadata.json"))
                .await
                .unwrap(),
        );
        let inventory = Arc::new(InventoryAPI::new(
            mdstat.clone(),
            metadata.clone(),
            drives.clone(),
            mounts.clone(),
        ));
        PoolOperator::new(commands, drives, metadata, mdstat, mounts, inventory)
    }

    #[tokio::test]
    async fn create_pool_rejects_guid_already_in_use() {
        let dir = tempfile::tempdir().unwrap();
        let operator = test_operator(dir.path()).await;

        let guid = Uuid::new_v4();
        let mut serials = IndexSet::new();
        serials.insert("S1".to_string());
        let existing = PoolRecord::new(guid, "existing".into(), serials.clone(), BTreeMap::new());
        operator.metadata.save(existing).await.unwrap();

        let mut op = Operation::new(guid, OperationState::Creating);
        let err = operator
            .create_pool(
                &mut op,
                "new".into(),
                serials,
                BTreeMap::new(),
                "/mnt/new".into(),
                Some(guid),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Validation(_)));
        // No command should have run for the colliding request.
        assert!(op.command_transcript.is_empty());
    }

    #[tokio::test]
    async fn mount_pool_is_a_no_op_when_already_mounted_at_the_same_path() {
        let dir = tempfile::tempdir().unwrap();
        let operator = test_operator(dir.path()).await;

        let guid = Uuid::new_v4();
        let mut serials = IndexSet::new();
        serials.insert("S1".to_string());
        let mut record = PoolRecord::new(guid, "pool1".into(), serials, BTreeMap::new());
        record.is_mounted = true;
        record.last_mount_path = Some("/mnt/pool1".into());
        record.last_md_device_name = Some("md0".into());
        operator.metadata.save(record).await.unwrap();

        let mut op = Operation::new(guid, OperationState::Mounting);
        let result = operator
            .mount_pool(&mut op, guid, "/mnt/pool1".into())
            .await
            .unwrap();

        assert!(result.is_mounted);
        assert_eq!(result.last_mount_path.as_deref(), Some("/mnt/pool1"));
        // No mkdir/mount command should have run for the no-op path.
        assert!(op.command_transcript.is_empty());
    }

    #[tokio::test]
    async fn unmount_pool_is_a_success_no_op_when_already_unmounted() {
        let dir = tempfile::tempdir().unwrap();
        let operator = test_operator(dir.path()).await;

        let guid = Uuid::new_v4();
        let mut serials = IndexSet::new();
        serials.insert("S1".to_string());
        let mut record = PoolRecord::new(guid, "pool1".into(), serials, BTreeMap::new());
        record.is_mounted = false;
        operator.metadata.save(record).await.unwrap();

        let mut op = Operation::new(guid, OperationState::Unmounting);
        let result = operator.unmount_pool(&mut op, guid).await.unwrap();

        assert!(!result.is_mounted);
    }
}
