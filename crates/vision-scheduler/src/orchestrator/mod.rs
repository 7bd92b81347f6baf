//! Access to the platform that runs worker pods.
//!
//! [`Orchestrator`] is the capability the lifecycle manager needs: create,
//! inspect, resize and delete a named pod, and read its resource usage.
//! [`KubernetesOrchestrator`] talks to a cluster API server,
//! [`MemoryOrchestrator`] keeps pods in memory for local runs and tests.

mod kubernetes;
mod memory;

pub use kubernetes::{parse_quantity_millis, KubernetesOrchestrator};
pub use memory::MemoryOrchestrator;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use vision_scheduler_core::{Result, SchedError, TaskType};

/// GPU share requested by a worker container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuLimit {
    /// Percentage of one GPU's cores
    pub cores: u32,
    /// GPU memory in the device plugin's unit
    pub memory: u32,
}

/// Everything needed to create one worker pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodSpec {
    /// Pod and container name
    pub name: String,
    pub task_type: TaskType,
    pub image: String,
    /// Node the pod is pinned to; unset for GPU pods, which the device scheduler places
    pub node_name: Option<String>,
    pub port: u16,
    /// Kubernetes quantity, `"0"` for no limit
    pub cpu_limit: String,
    pub memory_limit: String,
    pub gpu: Option<GpuLimit>,
    pub gpu_core_policy: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    pub fn parse(phase: &str) -> Self {
        match phase {
            "Pending" => PodPhase::Pending,
            "Running" => PodPhase::Running,
            "Succeeded" => PodPhase::Succeeded,
            "Failed" => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }
}

/// Usage sample of a pod's first container, quantities in milli-units
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodMetrics {
    pub cpu: i64,
    pub memory: i64,
    pub storage: i64,
    pub storage_ephemeral: i64,
    pub timestamp: DateTime<Utc>,
    pub window: Duration,
}

#[async_trait]
pub trait Orchestrator: Send + Sync {
    async fn create_pod(&self, spec: &PodSpec) -> Result<()>;

    /// Current phase, `None` once the pod no longer exists
    async fn pod_phase(&self, name: &str) -> Result<Option<PodPhase>>;

    /// Set the CPU limit of the pod's worker container
    async fn set_cpu_limit(&self, name: &str, millicpu: u64) -> Result<()>;

    /// Request deletion; deleting a pod that is already gone succeeds
    async fn delete_pod(&self, name: &str) -> Result<()>;

    /// Latest usage sample, `None` if the metrics server has none for the pod
    async fn pod_metrics(&self, name: &str) -> Result<Option<PodMetrics>>;

    fn backend_name(&self) -> &'static str;
}

/// Run `check` immediately and then every `interval` until it reports done.
///
/// Gives up with [`SchedError::ProvisionTimeout`] once `timeout` has elapsed;
/// an error from `check` ends the poll at once.
pub async fn poll_until<F, Fut>(
    pod: &str,
    target: &'static str,
    interval: Duration,
    timeout: Duration,
    mut check: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let deadline = Instant::now() + timeout;

    loop {
        if check().await? {
            return Ok(());
        }
        if Instant::now() + interval > deadline {
            return Err(SchedError::ProvisionTimeout {
                pod: pod.to_string(),
                target,
                waited_secs: timeout.as_secs(),
            });
        }
        tokio::time::sleep(interval).await;
    }
}
