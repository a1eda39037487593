//! OperationRegistry: process-wide concurrent map of in-flight and recently
//! completed pool operations, keyed by `poolGroupGuid`.
//!
//! Backed by `dashmap::DashMap` rather than the sharded-registry pattern used
//! elsewhere in the reference stack for a much hotter workload — operation
//! volume here is human-scale, at most a handful of concurrent mutations.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::{Operation, OperationState};
use crate::error::{Error, Result};
use crate::inventory::InventoryAPI;
use crate::metrics::Metrics;
use crate::pool::PoolOperator;

#[derive(Debug, Clone)]
pub enum OperationRequest {
    Create {
        label: String,
        drive_serials: indexmap::IndexSet<String>,
        drive_labels: BTreeMap<String, String>,
        mount_path: String,
        pool_group_guid: Option<Uuid>,
    },
    Mount {
        pool_group_guid: Uuid,
        mount_path: String,
    },
    Unmount {
        pool_group_guid: Uuid,
    },
    Remove {
        pool_group_guid: Uuid,
    },
}

impl OperationRequest {
    fn guid(&self) -> Option<Uuid> {
        match self {
            OperationRequest::Create { pool_group_guid, .. } => *pool_group_guid,
            OperationRequest::Mount { pool_group_guid, .. }
            | OperationRequest::Unmount { pool_group_guid }
            | OperationRequest::Remove { pool_group_guid } => Some(*pool_group_guid),
        }
    }

    fn initial_state(&self) -> OperationState {
        match self {
            OperationRequest::Create { .. } => OperationState::Creating,
            OperationRequest::Mount { .. } => OperationState::Mounting,
            OperationRequest::Unmount { .. } => OperationState::Unmounting,
            OperationRequest::Remove { .. } => OperationState::Removing,
        }
    }

    /// Label for the `backy_agent_operations_total`/`backy_agent_operation_duration_seconds` metrics.
    fn kind(&self) -> &'static str {
        match self {
            OperationRequest::Create { .. } => "create",
            OperationRequest::Mount { .. } => "mount",
            OperationRequest::Unmount { .. } => "unmount",
            OperationRequest::Remove { .. } => "remove",
        }
    }
}

#[derive(Debug, Clone)]
pub struct OperationEvent {
    pub pool_group_guid: Uuid,
    pub state: OperationState,
}

pub struct OperationRegistry {
    operations: Arc<DashMap<Uuid, Operation>>,
    pool_operator: Arc<PoolOperator>,
    inventory: Arc<InventoryAPI>,
    events: broadcast::Sender<OperationEvent>,
    retention: Duration,
    metrics: Metrics,
}

impl OperationRegistry {
    pub fn new(
        pool_operator: Arc<PoolOperator>,
        inventory: Arc<InventoryAPI>,
        retention: Duration,
        metrics: Metrics,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            operations: Arc::new(DashMap::new()),
            pool_operator,
            inventory,
            events,
            retention,
            metrics,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OperationEvent> {
        self.events.subscribe()
    }

    /// Validates, assigns a GUID (generating one if the request omits it for
    /// a create), inserts the initial record, and spawns the worker. Fails
    /// with `Conflict` if an in-flight operation already exists for the GUID.
    pub async fn start(&self, request: OperationRequest) -> Result<Uuid> {
        let guid = match &request {
            OperationRequest::Create { pool_group_guid, .. } => pool_group_guid.unwrap_or_else(Uuid::new_v4),
            _ => request
                .guid()
                .expect("non-create requests always carry a GUID"),
        };

        if let Some(existing) = self.operations.get(&guid) {
            if existing.state.is_in_flight() {
                return Err(Error::Conflict {
                    pool_group_guid: guid.to_string(),
                });
            }
        }

        let operation = Operation::new(guid, request.initial_state());
        self.operations.insert(guid, operation);
        self.events
            .send(OperationEvent {
                pool_group_guid: guid,
                state: request.initial_state(),
            })
            .ok();

        let operations = self.operations.clone();
        let pool_operator = self.pool_operator.clone();
        let inventory = self.inventory.clone();
        let events = self.events.clone();
        let metrics = self.metrics.clone();

        tokio::spawn(async move {
            run_operation(operations, pool_operator, inventory, events, metrics, guid, request).await;
        });

        Ok(guid)
    }

    pub fn get(&self, guid: Uuid) -> Option<Operation> {
        self.operations.get(&guid).map(|entry| entry.clone())
    }

    pub fn get_transcript(&self, guid: Uuid) -> Option<Vec<String>> {
        self.operations.get(&guid).map(|entry| {
            entry
                .command_transcript
                .iter()
                .map(|line| format!("$ {}\n{}", line.command, line.output))
                .collect()
        })
    }

    /// Evicts entries whose `completedAt` predates the retention window.
    pub fn sweep(&self) {
        let cutoff = chrono::Utc::now() - chrono::Duration::from_std(self.retention).unwrap_or_default();
        self.operations.retain(|_, op| match op.completed_at {
            Some(completed_at) => completed_at > cutoff,
            None => true,
        });
    }
}

async fn run_operation(
    operations: Arc<DashMap<Uuid, Operation>>,
    pool_operator: Arc<PoolOperator>,
    inventory: Arc<InventoryAPI>,
    events: broadcast::Sender<OperationEvent>,
    metrics: Metrics,
    guid: Uuid,
    request: OperationRequest,
) {
    // Work on an owned copy rather than holding the DashMap shard guard
    // across the awaits below — a multi-step sequence may run for minutes
    // (mkfs.ext4 on a large array) and must not stall unrelated GUIDs that
    // happen to hash into the same shard.
    let mut local_op = match operations.get(&guid) {
        Some(op) => op.clone(),
        None => return,
    };

    let kind = request.kind();
    let started = tokio::time::Instant::now();

    let result = match request {
        OperationRequest::Create {
            label,
            drive_serials,
            drive_labels,
            mount_path,
            pool_group_guid,
        } => pool_operator
            .create_pool(&mut local_op, label, drive_serials, drive_labels, mount_path, pool_group_guid)
            .await
            .map(|_| ()),
        OperationRequest::Mount {
            pool_group_guid,
            mount_path,
        } => pool_operator
            .mount_pool(&mut local_op, pool_group_guid, mount_path)
            .await
            .map(|_| ()),
        OperationRequest::Unmount { pool_group_guid } => {
            pool_operator.unmount_pool(&mut local_op, pool_group_guid).await.map(|_| ())
        }
        OperationRequest::Remove { pool_group_guid } => {
            pool_operator.remove_pool(&mut local_op, pool_group_guid).await
        }
    };

    let outcome_label = if result.is_ok() { "success" } else { "failure" };
    metrics.operations_total.with_label_values(&[kind, outcome_label]).inc();
    metrics.operation_duration_seconds.observe(started.elapsed().as_secs_f64());

    let final_state = match result {
        Ok(()) => {
            let ready_state = match local_op.state {
                OperationState::Unmounting => OperationState::Unmounted,
                OperationState::Removing => OperationState::Removed,
                _ => OperationState::Ready,
            };
            local_op.complete(ready_state);
            ready_state
        }
        Err(e) => {
            warn!(pool = %guid, error = %e, "operation failed");
            local_op.fail(e.to_string());
            OperationState::Failed
        }
    };
    operations.insert(guid, local_op);

    if final_state == OperationState::Ready || final_state == OperationState::Unmounted {
        wait_for_inventory_visibility(&inventory, guid).await;
    }

    metrics.pools_total.set(inventory.list_pools().await.len() as f64);

    info!(pool = %guid, state = ?final_state, "operation completed");
    events
        .send(OperationEvent {
            pool_group_guid: guid,
            state: final_state,
        })
        .ok();
}

/// Bounded retry (10 x 200ms) so a client polling right after completion
/// always observes consistent detail from InventoryAPI.
async fn wait_for_inventory_visibility(inventory: &InventoryAPI, guid: Uuid) {
    for _ in 0..10 {
        if inventory.get_by_guid(guid).await.is_some() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    warn!(pool = %guid, "inventory visibility wait exhausted retries");
}

/// Runs `sweep()` on an interval until `shutdown` fires.
pub async fn run_sweep_loop(
    registry: Arc<OperationRegistry>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                registry.sweep();
            }
            _ = shutdown.recv() => {
                info!("operation registry sweeper shutting down");
                break;
            }
        }
    }
}
