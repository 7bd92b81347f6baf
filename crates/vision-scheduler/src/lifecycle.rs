use crate::config::SchedulerConfig;
use crate::metrics::SchedulerMetrics;
use crate::orchestrator::{poll_until, GpuLimit, Orchestrator, PodPhase, PodSpec};
use crate::worker_pool::{Worker, WorkerPool};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info};
use vision_scheduler_core::{ResourceUsage, Result, SchedError, TaskType, POD_NOT_FOUND};

/// Resources for one worker pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    pub task_type: TaskType,
    /// Placement key such as `as1` or `gpu1`
    pub node_key: String,
    /// 0 leaves the CPU unlimited
    pub cpu_millis: u32,
    pub gpu: Option<GpuLimit>,
}

impl WorkerSpec {
    pub fn unlimited(task_type: TaskType, node_key: impl Into<String>) -> Self {
        WorkerSpec {
            task_type,
            node_key: node_key.into(),
            cpu_millis: 0,
            gpu: None,
        }
    }

    fn cpu_quantity(&self) -> String {
        if self.cpu_millis == 0 {
            "0".to_string()
        } else {
            format!("{}m", self.cpu_millis)
        }
    }
}

/// Body of `/create_workers`: how many workers of one task type to start per node key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionRequest {
    pub task_name: TaskType,
    #[serde(default)]
    pub worker_numbers: BTreeMap<String, usize>,
    #[serde(default)]
    pub cpu_limit: BTreeMap<String, u32>,
    #[serde(default)]
    pub gpu_limit: BTreeMap<String, u32>,
    #[serde(default)]
    pub gpu_memory: BTreeMap<String, u32>,
}

impl ProvisionRequest {
    pub fn worker_spec(&self, node_key: &str) -> WorkerSpec {
        let gpu = match self.gpu_limit.get(node_key).copied().unwrap_or(0) {
            0 => None,
            cores => Some(GpuLimit {
                cores,
                memory: self.gpu_memory.get(node_key).copied().unwrap_or(0),
            }),
        };
        WorkerSpec {
            task_type: self.task_name,
            node_key: node_key.to_string(),
            cpu_millis: self.cpu_limit.get(node_key).copied().unwrap_or(0),
            gpu,
        }
    }
}

/// Creates, resizes and destroys the pods behind pooled workers
pub struct PodManager {
    config: Arc<SchedulerConfig>,
    pool: Arc<WorkerPool>,
    orchestrator: Arc<dyn Orchestrator>,
    metrics: Arc<SchedulerMetrics>,
}

impl PodManager {
    pub fn new(
        config: Arc<SchedulerConfig>,
        pool: Arc<WorkerPool>,
        orchestrator: Arc<dyn Orchestrator>,
        metrics: Arc<SchedulerMetrics>,
    ) -> Self {
        PodManager {
            config,
            pool,
            orchestrator,
            metrics,
        }
    }

    async fn wait_running(&self, pod: &str) -> Result<()> {
        poll_until(
            pod,
            "running",
            self.config.poll_interval(),
            self.config.ready_timeout(),
            || async { Ok(self.orchestrator.pod_phase(pod).await? == Some(PodPhase::Running)) },
        )
        .await
    }

    /// Register a worker, start its pod and wait until the pod is running.
    ///
    /// The worker only becomes selectable once its pod runs. If provisioning
    /// fails the worker is dropped from the pool again; whatever the platform
    /// already created is left for the operator to clean up.
    pub async fn create_worker(&self, spec: &WorkerSpec) -> Result<Arc<Worker>> {
        let placement = self.config.placement(spec.task_type, &spec.node_key)?;
        let worker = self
            .pool
            .register(spec.task_type, &placement.node_name, &placement.host)?;

        let pod = PodSpec {
            name: worker.pod_name().to_string(),
            task_type: spec.task_type,
            image: self.config.image(spec.task_type).to_string(),
            node_name: match spec.gpu {
                Some(_) => None,
                None => Some(placement.node_name.clone()),
            },
            port: worker.port(),
            cpu_limit: spec.cpu_quantity(),
            memory_limit: "0".to_string(),
            gpu: spec.gpu,
            gpu_core_policy: self.config.orchestrator.gpu_core_policy.clone(),
        };

        let provisioned = match self.orchestrator.create_pod(&pod).await {
            Ok(()) => self.wait_running(&pod.name).await,
            Err(e) => Err(e),
        };
        if let Err(e) = provisioned {
            error!("Provisioning pod {} failed: {}", pod.name, e);
            self.pool.remove(&worker)?;
            return Err(e);
        }

        self.pool.mark_ready(&worker);
        self.metrics.inc_operation("create");
        self.metrics.update_workers(&self.pool.snapshot());
        info!("Pod {} running, worker {} ready", pod.name, worker.describe());

        Ok(worker)
    }

    /// Set a worker's CPU limit and wait for its pod to be running again
    pub async fn update_resource_limit(&self, worker: &Worker, millicpu: u64) -> Result<()> {
        self.orchestrator
            .set_cpu_limit(worker.pod_name(), millicpu)
            .await?;
        self.wait_running(worker.pod_name()).await?;

        self.metrics.inc_operation("update_cpu");
        info!("Pod {}: cpu limit has been updated to {}m", worker.pod_name(), millicpu);
        Ok(())
    }

    /// Remove a free worker from the pool and destroy its pod.
    ///
    /// An occupied worker is refused with [`SchedError::WorkerOccupied`] and
    /// stays registered.
    pub async fn delete_worker(&self, worker: &Worker) -> Result<()> {
        self.pool.remove(worker)?;
        self.metrics.update_workers(&self.pool.snapshot());

        let pod = worker.pod_name();
        self.orchestrator.delete_pod(pod).await?;
        poll_until(
            pod,
            "deletion",
            self.config.poll_interval(),
            self.config.ready_timeout(),
            || async { Ok(self.orchestrator.pod_phase(pod).await?.is_none()) },
        )
        .await?;

        self.metrics.inc_operation("delete");
        info!("Pod {} deleted", pod);
        Ok(())
    }

    /// Latest usage of a pod; a pod without metrics yields an unavailable record
    pub async fn query_resource_usage(&self, pod_name: &str) -> Result<ResourceUsage> {
        let Some(metrics) = self.orchestrator.pod_metrics(pod_name).await? else {
            info!("Pod {} is not found", pod_name);
            return Ok(ResourceUsage::unavailable(POD_NOT_FOUND));
        };

        Ok(ResourceUsage {
            cpu: metrics.cpu,
            memory: metrics.memory,
            storage: metrics.storage,
            storage_ephemeral: metrics.storage_ephemeral,
            collected_time: metrics.timestamp.to_string(),
            window: i64::try_from(metrics.window.as_millis()).unwrap_or(i64::MAX),
            available: true,
            pod_name: pod_name.to_string(),
        })
    }

    /// Create `count` workers one after another, pausing after every batch
    async fn provision_node(&self, spec: WorkerSpec, count: usize) -> Result<Vec<Arc<Worker>>> {
        let batch_size = self.config.batch_size(&spec.node_key);
        let mut workers = Vec::with_capacity(count);

        for created in 1..=count {
            workers.push(self.create_worker(&spec).await?);

            if created % batch_size == 0 && created < count {
                info!("Created {} pods for {}, pausing", created, spec.node_key);
                tokio::time::sleep(self.config.batch_pause()).await;
            }
        }
        Ok(workers)
    }

    /// Handle a `/create_workers` request; node keys are provisioned concurrently
    pub async fn provision(&self, request: &ProvisionRequest) -> Result<Vec<Arc<Worker>>> {
        for node_key in request.worker_numbers.keys() {
            self.config.placement(request.task_name, node_key)?;
        }
        info!(
            "Creating {} workers: {:?}",
            request.task_name, request.worker_numbers
        );

        let per_node = request
            .worker_numbers
            .iter()
            .map(|(node_key, count)| self.provision_node(request.worker_spec(node_key), *count));
        let created = try_join_all(per_node).await?;

        Ok(created.into_iter().flatten().collect())
    }

    /// Create the workers the service always starts with
    pub async fn provision_startup(&self) -> Result<Vec<Arc<Worker>>> {
        let mut workers = Vec::new();
        for startup in &self.config.pool.startup_workers {
            let spec = WorkerSpec::unlimited(startup.task_type, startup.node_key.clone());
            workers.push(self.create_worker(&spec).await?);
        }
        Ok(workers)
    }

    /// Apply a CPU limit to every resizable worker on `node_name`
    pub async fn update_node_cpu(&self, node_name: &str, millicpu: u64) -> Result<usize> {
        let mut updated = 0;
        for task_type in &self.config.pool.cpu_update_task_types {
            let workers = self.pool.workers(*task_type);
            info!("Has {} {} workers", workers.len(), task_type);

            for worker in workers.iter().filter(|w| w.node_name() == node_name) {
                self.update_resource_limit(worker, millicpu).await?;
                updated += 1;
            }
        }
        Ok(updated)
    }

    pub fn orchestrator(&self) -> &Arc<dyn Orchestrator> {
        &self.orchestrator
    }
}

/// Parse the `/update_cpu` body, `"<node name>:<millicpu>"`
pub fn parse_cpu_update(body: &str) -> Result<(String, u64)> {
    let (node_name, millicpu) = body
        .trim()
        .split_once(':')
        .ok_or_else(|| SchedError::InvalidRequest(format!("expected <node>:<millicpu>, got {:?}", body)))?;
    let millicpu = millicpu
        .trim()
        .parse()
        .map_err(|_| SchedError::InvalidRequest(format!("invalid millicpu {:?}", millicpu)))?;
    Ok((node_name.to_string(), millicpu))
}
