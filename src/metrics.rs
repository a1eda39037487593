//! Prometheus metric handles, registered once in `main` and cloned into
//! every component that updates them — the same pattern the reference stack
//! uses instead of a name-based lookup at update time.

use prometheus::{CounterVec, Gauge, Histogram};

use crate::error::{Error, Result};

#[derive(Clone)]
pub struct Metrics {
    /// Current number of persisted pools.
    pub pools_total: Gauge,
    /// Current number of discovered drives in the last successful DriveCache refresh.
    pub drives_total: Gauge,
    /// Completed pool operations, by kind (create/mount/unmount/remove) and outcome.
    pub operations_total: CounterVec,
    /// Wall-clock duration of completed pool operations.
    pub operation_duration_seconds: Histogram,
    /// External commands executed, by program and outcome.
    pub commands_total: CounterVec,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Metrics { .. }")
    }
}

impl Metrics {
    pub fn register() -> Result<Self> {
        let pools_total = prometheus::register_gauge!("backy_agent_pools_total", "Total number of known pools")
            .map_err(|e| Error::Internal(e.to_string()))?;
        let drives_total = prometheus::register_gauge!(
            "backy_agent_drives_total",
            "Total number of discovered drives"
        )
        .map_err(|e| Error::Internal(e.to_string()))?;
        let operations_total = prometheus::register_counter_vec!(
            "backy_agent_operations_total",
            "Pool operations by kind and outcome",
            &["kind", "outcome"]
        )
        .map_err(|e| Error::Internal(e.to_string()))?;
        let operation_duration_seconds = prometheus::register_histogram!(
            "backy_agent_operation_duration_seconds",
            "Duration of pool operations"
        )
        .map_err(|e| Error::Internal(e.to_string()))?;
        let commands_total = prometheus::register_counter_vec!(
            "backy_agent_commands_total",
            "External commands executed, by program and outcome",
            &["command", "outcome"]
        )
        .map_err(|e| Error::Internal(e.to_string()))?;

        Ok(Self {
            pools_total,
            drives_total,
            operations_total,
            operation_duration_seconds,
            commands_total,
        })
    }

    /// Unregistered handles for unit tests: usable the same as the real
    /// thing (`.set()`/`.inc()`/`.observe()` don't require registration),
    /// without touching the process-wide default registry other tests in
    /// the same binary may also be registering into.
    #[cfg(test)]
    pub(crate) fn for_test() -> Metrics {
        use prometheus::{HistogramOpts, Opts};
        Metrics {
            pools_total: Gauge::new("test_pools_total", "test").unwrap(),
            drives_total: Gauge::new("test_drives_total", "test").unwrap(),
            operations_total: CounterVec::new(Opts::new("test_operations_total", "test"), &["kind", "outcome"])
                .unwrap(),
            operation_duration_seconds: Histogram::with_opts(HistogramOpts::new(
                "test_operation_duration_seconds",
                "test",
            ))
            .unwrap(),
            commands_total: CounterVec::new(Opts::new("test_commands_total", "test"), &["command", "outcome"])
                .unwrap(),
        }
    }
}
