//! `Agent`: the dependency-injection root. Built once in `main`, holding an
//! `Arc` to every component; handed into the axum `AppState` and to each
//! background worker.

use std::sync::Arc;

use crate::commands::CommandRunner;
use crate::config::AgentConfig;
use crate::drives::DriveCache;
use crate::fsreader::FSReader;
use crate::inventory::InventoryAPI;
use crate::mdstat::MdStatReader;
use crate::metadata::MetadataStore;
use crate::metrics::Metrics;
use crate::mounts::MountReader;
use crate::operations::OperationRegistry;
use crate::pool::PoolOperator;
use crate::reconcile::PoolReconciler;

pub struct Agent {
    pub config: AgentConfig,
    pub commands: CommandRunner,
    pub fsreader: Arc<FSReader>,
    pub drives: Arc<DriveCache>,
    pub mdstat: Arc<MdStatReader>,
    pub mounts: Arc<MountReader>,
    pub metadata: Arc<MetadataStore>,
    pub inventory: Arc<InventoryAPI>,
    pub pool_operator: Arc<PoolOperator>,
    pub operations: Arc<OperationRegistry>,
    pub reconciler: Arc<PoolReconciler>,
    pub metrics: Metrics,
}

impl Agent {
    pub async fn build(config: AgentConfig) -> crate::error::Result<Self> {
        let metrics = Metrics::register()?;
        let commands = CommandRunner::new(config.elevate_command.clone()).with_metrics(metrics.clone());
        let fsreader = Arc::new(FSReader::new(
            config.proc_root.clone(),
            config.sysfs_root.clone(),
            config.file_cache_ttl(),
        ));
        let drives = Arc::new(DriveCache::new(config.excluded_drives.clone(), metrics.clone()));
        let mdstat = Arc::new(MdStatReader::new(fsreader.clone()));
        let mounts = Arc::new(MountReader::new(fsreader.clone()));
        let metadata = Arc::new(MetadataStore::load(config.metadata_path.clone()).await?);
        metrics.pools_total.set(metadata.all().await.len() as f64);

        let inventory = Arc::new(InventoryAPI::new(
            mdstat.clone(),
            metadata.clone(),
            drives.clone(),
            mounts.clone(),
        ));

        let pool_operator = Arc::new(PoolOperator::new(
            commands.clone(),
            drives.clone(),
            metadata.clone(),
            mdstat.clone(),
            mounts.clone(),
            inventory.clone(),
        ));

        let operations = Arc::new(OperationRegistry::new(
            pool_operator.clone(),
            inventory.clone(),
            config.operation_retention_window(),
            metrics.clone(),
        ));

        let reconciler = Arc::new(PoolReconciler::new(
            metadata.clone(),
            drives.clone(),
            mdstat.clone(),
            mounts.clone(),
            commands.clone(),
        ));

        Ok(Self {
            config,
            commands,
            fsreader,
            drives,
            mdstat,
            mounts,
            metadata,
            inventory,
            pool_operator,
            operations,
            reconciler,
            metrics,
        })
    }
}
