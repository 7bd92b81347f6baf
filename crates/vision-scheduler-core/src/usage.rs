use serde::{Deserialize, Serialize};

/// Collected-time marker for a task whose worker is no longer bound
pub const TASK_ENDED: &str = "Task has been ended";

/// Collected-time marker for a pod without metrics
pub const POD_NOT_FOUND: &str = "Pod Not Found";

/// Point-in-time resource usage of a worker's pod.
///
/// Quantities are milli-units. Usage is measured over
/// `[collected_time - window, collected_time]`, `window` in milliseconds.
/// `storage` is bound to persistent volumes and survives the pod,
/// `storage_ephemeral` is released with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    #[serde(rename = "CPU")]
    pub cpu: i64,
    #[serde(rename = "Memory")]
    pub memory: i64,
    #[serde(rename = "Storage")]
    pub storage: i64,
    #[serde(rename = "StorageEphemeral")]
    pub storage_ephemeral: i64,
    #[serde(rename = "CollectedTime")]
    pub collected_time: String,
    #[serde(rename = "Window")]
    pub window: i64,
    #[serde(rename = "Available")]
    pub available: bool,
    #[serde(rename = "PodName")]
    pub pod_name: String,
}

impl ResourceUsage {
    /// Usage record for when no metrics can be reported
    pub fn unavailable(reason: impl Into<String>) -> Self {
        ResourceUsage {
            cpu: 0,
            memory: 0,
            storage: 0,
            storage_ephemeral: 0,
            collected_time: reason.into(),
            window: 0,
            available: false,
            pod_name: String::new(),
        }
    }
}
