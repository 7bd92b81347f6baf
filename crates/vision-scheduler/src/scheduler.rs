use crate::config::{OrchestratorBackend, SchedulerConfig};
use crate::dispatch::{Dispatcher, HttpDispatcher};
use crate::lifecycle::PodManager;
use crate::metrics::SchedulerMetrics;
use crate::notifier::{CompletionHandle, CompletionNotifier};
use crate::orchestrator::{KubernetesOrchestrator, MemoryOrchestrator, Orchestrator};
use crate::stage::{self, RUN_ROUTE};
use crate::worker_pool::{Claim, Worker, WorkerPool};
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use vision_scheduler_core::{
    IdGenerator, MultipartForm, ResourceUsage, Result, SchedError, TaskId, TaskStatus, TaskType,
    TASK_ENDED,
};

/// The scheduler service: owns the worker pool and everything that acts on it
pub struct Scheduler {
    config: Arc<SchedulerConfig>,
    pool: Arc<WorkerPool>,
    pods: Arc<PodManager>,
    notifier: Arc<CompletionNotifier>,
    dispatcher: Arc<dyn Dispatcher>,
    ids: IdGenerator,
    metrics: Arc<SchedulerMetrics>,
    shutdown: Arc<Notify>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        orchestrator: Arc<dyn Orchestrator>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        let pool = Arc::new(WorkerPool::new(config.pool.base_port));
        let metrics = Arc::new(SchedulerMetrics::new()?);
        let pods = PodManager::new(config.clone(), pool.clone(), orchestrator, metrics.clone());

        Ok(Scheduler {
            config,
            pool,
            pods: Arc::new(pods),
            notifier: Arc::new(CompletionNotifier::new()),
            dispatcher,
            ids: IdGenerator::new(),
            metrics,
            shutdown: Arc::new(Notify::new()),
        })
    }

    /// Wire up the orchestrator backend and HTTP dispatcher named in `config`
    pub fn from_config(config: SchedulerConfig) -> anyhow::Result<Self> {
        let orchestrator: Arc<dyn Orchestrator> = match config.orchestrator.backend {
            OrchestratorBackend::Kubernetes => {
                Arc::new(KubernetesOrchestrator::in_cluster(&config.orchestrator)?)
            }
            OrchestratorBackend::Memory => Arc::new(MemoryOrchestrator::new()),
        };
        let dispatcher = Arc::new(HttpDispatcher::new(Duration::from_secs(
            config.client.request_timeout_secs,
        ))?);

        Self::new(config, orchestrator, dispatcher)
    }

    /// Create the startup workers; the pool is usable once this returns
    pub async fn bootstrap(&self) -> Result<usize> {
        info!(
            "Provisioning {} startup workers on {}",
            self.config.pool.startup_workers.len(),
            self.pods.orchestrator().backend_name()
        );
        let workers = self.pods.provision_startup().await?;
        Ok(workers.len())
    }

    pub fn next_task_id(&self) -> TaskId {
        self.ids.next_id()
    }

    /// Claim a free worker of `task_type` at the node behind `node_key`, waiting if none is free
    pub async fn occupy_worker(&self, task_type: TaskType, task_id: &str, node_key: &str) -> Result<Arc<Worker>> {
        let placement = self.config.placement(task_type, node_key)?;
        let worker = self
            .pool
            .occupy(task_type, task_id, &placement.node_name)
            .await?;

        info!("Task {} occupied {} worker {}", task_id, task_type, worker.name());
        self.metrics.update_workers(&self.pool.snapshot());
        Ok(worker)
    }

    /// [`Scheduler::occupy_worker`] that gives up after `timeout`
    pub async fn occupy_worker_timeout(
        &self,
        task_type: TaskType,
        task_id: &str,
        node_key: &str,
        timeout: Duration,
    ) -> Result<Arc<Worker>> {
        let placement = self.config.placement(task_type, node_key)?;
        let worker = self
            .pool
            .occupy_timeout(task_type, task_id, &placement.node_name, timeout)
            .await?;

        info!("Task {} occupied {} worker {}", task_id, task_type, worker.name());
        self.metrics.update_workers(&self.pool.snapshot());
        Ok(worker)
    }

    /// [`Scheduler::occupy_worker`] for a task id that is not yet known to the client.
    ///
    /// The worker goes back to the pool unless the claim is kept.
    pub async fn claim_worker(&self, task_type: TaskType, task_id: &str, node_key: &str) -> Result<Claim> {
        let worker = self.occupy_worker(task_type, task_id, node_key).await?;
        Ok(Claim::new(self.pool.clone(), worker, task_id))
    }

    pub fn worker_by_task_id(&self, task_id: &str) -> Result<Arc<Worker>> {
        self.pool.worker_by_task_id(task_id)
    }

    /// Send a command to a worker's `/run_task`
    pub async fn dispatch(&self, worker: &Worker, form: MultipartForm) -> Result<String> {
        debug!("Dispatching to {}", worker.describe());
        self.dispatcher.post_form(&worker.url(RUN_ROUTE), form).await
    }

    /// Dispatch work whose completion will be called back under `task_id`.
    ///
    /// The wait is registered before the dispatch goes out and withdrawn if
    /// the dispatch fails.
    pub async fn start_stage(&self, worker: &Worker, task_id: &str, form: MultipartForm) -> Result<CompletionHandle> {
        let handle = self.notifier.register_wait(task_id);
        if let Err(e) = self.dispatch(worker, form).await {
            self.notifier.cancel(task_id);
            return Err(e);
        }
        Ok(handle)
    }

    /// Apply the end-of-stage policy to a worker.
    ///
    /// After the last chunk a session-stateful worker is reset, then the
    /// worker goes back to the pool. `delete` destroys it afterwards, which
    /// fails if it is still bound.
    pub async fn finish_worker(&self, worker: &Worker, task_id: &str, status: TaskStatus, delete: bool) -> Result<()> {
        if status.ends_session() {
            if worker.task_type().is_session_stateful() {
                self.dispatch(worker, stage::reset_form(worker.task_type(), task_id))
                    .await?;
            }
            if self.pool.release(worker, task_id) {
                info!("Worker {} returned to pool by task {}", worker.name(), task_id);
            }
        }

        if delete {
            self.pods.delete_worker(worker).await?;
            info!("{} worker {} deleted", worker.task_type(), worker.name());
        }

        self.metrics.update_workers(&self.pool.snapshot());
        Ok(())
    }

    /// POST a result form to `http://<client>:<callback port>/<route>`
    pub async fn send_to_client(&self, client_ip: IpAddr, route: &str, form: MultipartForm) -> Result<()> {
        let address = SocketAddr::new(client_ip, self.config.client.callback_port);
        let url = format!("http://{}/{}", address, route);

        info!("Result sent back to {}", url);
        self.dispatcher.post_form(&url, form).await?;
        Ok(())
    }

    /// Route a worker's finish callback to the flow waiting for it.
    ///
    /// Returns `false` for reset acknowledgements, which nobody waits for.
    pub fn deliver_completion(&self, task_type: TaskType, form: MultipartForm) -> Result<bool> {
        if stage::is_reset_ack(task_type, &form) {
            debug!("Ignoring {} reset acknowledgement", task_type);
            return Ok(false);
        }

        let task_id = form.value("task_id")?.to_string();
        info!("Receive {} result from task id {}", task_type, task_id);
        self.notifier.deliver(&task_id, form)?;
        Ok(true)
    }

    /// Resource usage of the pod serving `task_id`
    pub async fn query_usage(&self, task_id: &str) -> Result<ResourceUsage> {
        match self.pool.worker_by_task_id(task_id) {
            Ok(worker) => self.pods.query_resource_usage(worker.pod_name()).await,
            Err(SchedError::UnknownTaskId(_)) => Ok(ResourceUsage::unavailable(TASK_ENDED)),
            Err(e) => Err(e),
        }
    }

    /// Run a background flow, logging and counting it if it fails
    pub fn spawn_flow<F>(&self, flow: &'static str, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            if let Err(e) = task.await {
                error!("{} flow failed: {}", flow, e);
                metrics.inc_failure(flow);
            }
        });
    }

    pub fn render_metrics(&self) -> anyhow::Result<String> {
        self.metrics.update_workers(&self.pool.snapshot());
        self.metrics.render()
    }

    /// Ask the HTTP server to stop accepting requests
    pub fn shutdown(&self) {
        warn!("Shutdown requested");
        self.shutdown.notify_one();
    }

    /// Resolves once [`Scheduler::shutdown`] has been called
    pub async fn shutdown_requested(&self) {
        self.shutdown.notified().await;
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn pool(&self) -> Arc<WorkerPool> {
        self.pool.clone()
    }

    pub fn pods(&self) -> Arc<PodManager> {
        self.pods.clone()
    }

    pub fn notifier(&self) -> Arc<CompletionNotifier> {
        self.notifier.clone()
    }

    pub fn metrics(&self) -> Arc<SchedulerMetrics> {
        self.metrics.clone()
    }
}
