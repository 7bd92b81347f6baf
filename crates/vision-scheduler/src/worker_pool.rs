use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use vision_scheduler_core::{Result, SchedError, TaskId, TaskType};

/// A pooled worker: one pod dedicated to one pipeline stage
#[derive(Debug)]
pub struct Worker {
    name: String,
    ip: String,
    port: u16,
    task_type: TaskType,
    node_name: String,
    pod_name: String,
    created_at: DateTime<Utc>,
}

impl Worker {
    /// `http://<ip>:<port>/<route>` on the worker
    pub fn url(&self, route: &str) -> String {
        format!("http://{}:{}/{}", self.ip, self.port, route)
    }

    /// Registry key, `<task>-<port>-<node>`
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn task_type(&self) -> TaskType {
        self.task_type
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn pod_name(&self) -> &str {
        &self.pod_name
    }

    pub fn describe(&self) -> String {
        format!("[IP: {}, Task Type: {}]", self.ip, self.task_type)
    }
}

/// Point-in-time view of a worker for listings and gauges
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub name: String,
    pub task_type: TaskType,
    pub ip: String,
    pub port: u16,
    pub node_name: String,
    pub pod_name: String,
    pub ready: bool,
    pub available: bool,
    pub task_id: Option<TaskId>,
    pub created_at: DateTime<Utc>,
}

struct Slot {
    worker: Arc<Worker>,
    /// Set once the backing pod reported running
    ready: bool,
    bound_task: Option<TaskId>,
}

impl Slot {
    fn is_available(&self) -> bool {
        self.bound_task.is_none()
    }
}

#[derive(Default)]
struct PoolState {
    /// Workers per task type, ordered by worker name
    pools: HashMap<TaskType, BTreeMap<String, Slot>>,
    /// Task id -> name of the worker bound to it
    task_index: HashMap<TaskId, (TaskType, String)>,
}

impl PoolState {
    fn slot_mut(&mut self, worker: &Worker) -> Option<&mut Slot> {
        self.pools
            .get_mut(&worker.task_type)
            .and_then(|pool| pool.get_mut(&worker.name))
    }
}

/// Registry of all workers plus the task-id index.
///
/// Both live behind one lock so that claiming, releasing and removing a
/// worker are atomic with respect to each other. Waiters for a free worker
/// are woken through `changed` whenever capacity may have appeared.
pub struct WorkerPool {
    state: Mutex<PoolState>,
    ports: Mutex<HashMap<String, u16>>,
    base_port: u16,
    changed: Notify,
}

impl WorkerPool {
    pub fn new(base_port: u16) -> Self {
        WorkerPool {
            state: Mutex::new(PoolState::default()),
            ports: Mutex::new(HashMap::new()),
            base_port,
            changed: Notify::new(),
        }
    }

    /// Next port on `host`; ports are never reused
    fn assign_port(&self, host: &str) -> Result<u16> {
        let mut ports = self.ports.lock();
        let port = match ports.get(host) {
            None => self.base_port,
            Some(last) => last.checked_add(1).ok_or_else(|| {
                SchedError::Config(format!("port range exhausted on host {}", host))
            })?,
        };
        ports.insert(host.to_string(), port);
        Ok(port)
    }

    /// Add a worker that is not selectable until [`WorkerPool::mark_ready`].
    pub fn register(&self, task_type: TaskType, node_name: &str, host: &str) -> Result<Arc<Worker>> {
        let port = self.assign_port(host)?;
        let name = format!("{}-{}-{}", task_type, port, node_name);

        let worker = Arc::new(Worker {
            name: name.clone(),
            ip: host.to_string(),
            port,
            task_type,
            node_name: node_name.to_string(),
            pod_name: name.clone(),
            created_at: Utc::now(),
        });

        let mut state = self.state.lock();
        state.pools.entry(task_type).or_default().insert(
            name,
            Slot {
                worker: worker.clone(),
                ready: false,
                bound_task: None,
            },
        );
        info!("Worker {} stored in task type {}", worker.name, task_type);

        Ok(worker)
    }

    /// Make a provisioned worker selectable
    pub fn mark_ready(&self, worker: &Worker) {
        {
            let mut state = self.state.lock();
            if let Some(slot) = state.slot_mut(worker) {
                slot.ready = true;
            }
        }
        self.changed.notify_waiters();
    }

    fn ensure_pool(&self, task_type: TaskType) -> Result<()> {
        let state = self.state.lock();
        match state.pools.get(&task_type) {
            Some(pool) if !pool.is_empty() => Ok(()),
            _ => Err(SchedError::EmptyPool(task_type.to_string())),
        }
    }

    /// Claim the lowest-named free worker of `task_type` on `node_name`, if any
    pub fn try_occupy(&self, task_type: TaskType, task_id: &str, node_name: &str) -> Option<Arc<Worker>> {
        let mut state = self.state.lock();
        let pool = state.pools.get_mut(&task_type)?;

        let slot = pool
            .values_mut()
            .find(|slot| slot.ready && slot.is_available() && slot.worker.node_name == node_name)?;
        slot.bound_task = Some(task_id.to_string());
        let worker = slot.worker.clone();

        let previous = state
            .task_index
            .insert(task_id.to_string(), (task_type, worker.name.clone()));
        if let Some((_, name)) = previous {
            warn!("Task id {} was still bound to {}, rebinding", task_id, name);
        }

        debug!("Task {} occupied worker {}", task_id, worker.name);
        Some(worker)
    }

    /// Claim a free worker, waiting for one to be released if necessary.
    ///
    /// The wait has no deadline; dropping the future abandons it.
    pub async fn occupy(&self, task_type: TaskType, task_id: &str, node_name: &str) -> Result<Arc<Worker>> {
        self.ensure_pool(task_type)?;

        loop {
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            if let Some(worker) = self.try_occupy(task_type, task_id, node_name) {
                return Ok(worker);
            }

            debug!("No free {} worker on {}, waiting for a release", task_type, node_name);
            changed.await;
        }
    }

    /// [`WorkerPool::occupy`] with a deadline
    pub async fn occupy_timeout(
        &self,
        task_type: TaskType,
        task_id: &str,
        node_name: &str,
        timeout: Duration,
    ) -> Result<Arc<Worker>> {
        tokio::time::timeout(timeout, self.occupy(task_type, task_id, node_name))
            .await
            .map_err(|_| SchedError::OccupyTimeout {
                task_type: task_type.to_string(),
                node_name: node_name.to_string(),
            })?
    }

    pub fn worker_by_task_id(&self, task_id: &str) -> Result<Arc<Worker>> {
        let state = self.state.lock();
        state
            .task_index
            .get(task_id)
            .and_then(|(task_type, name)| state.pools.get(task_type)?.get(name))
            .map(|slot| slot.worker.clone())
            .ok_or_else(|| SchedError::UnknownTaskId(task_id.to_string()))
    }

    /// Return a worker to the pool.
    ///
    /// Only frees the worker if `task_id` is the id it is bound to; a stale or
    /// repeated release is a logged no-op. Returns whether the worker was freed.
    pub fn release(&self, worker: &Worker, task_id: &str) -> bool {
        let released = {
            let mut state = self.state.lock();

            if matches!(state.task_index.get(task_id), Some((_, name)) if *name == worker.name) {
                state.task_index.remove(task_id);
            }

            match state.slot_mut(worker) {
                Some(slot) if slot.bound_task.as_deref() == Some(task_id) => {
                    slot.bound_task = None;
                    true
                }
                Some(slot) => {
                    warn!(
                        "Ignoring release of {} for task {}: bound to {:?}",
                        worker.name, task_id, slot.bound_task
                    );
                    false
                }
                None => false,
            }
        };

        if released {
            debug!("Worker {} returned to pool", worker.name);
            self.changed.notify_waiters();
        }
        released
    }

    /// Drop a free worker from the registry.
    ///
    /// Fails without touching the registry if the worker is occupied. Returns
    /// whether the worker was still registered.
    pub fn remove(&self, worker: &Worker) -> Result<bool> {
        let mut state = self.state.lock();

        let Some(pool) = state.pools.get_mut(&worker.task_type) else {
            return Ok(false);
        };
        match pool.get(&worker.name) {
            None => return Ok(false),
            Some(slot) if !slot.is_available() => {
                return Err(SchedError::WorkerOccupied(worker.name.clone()));
            }
            Some(_) => {}
        }
        pool.remove(&worker.name);
        state
            .task_index
            .retain(|_, (task_type, name)| !(*task_type == worker.task_type && *name == worker.name));

        Ok(true)
    }

    pub fn is_available(&self, worker: &Worker) -> Option<bool> {
        let mut state = self.state.lock();
        state.slot_mut(worker).map(|slot| slot.is_available())
    }

    pub fn bound_task(&self, worker: &Worker) -> Option<TaskId> {
        let mut state = self.state.lock();
        state.slot_mut(worker).and_then(|slot| slot.bound_task.clone())
    }

    /// All workers of a task type, ordered by name
    pub fn workers(&self, task_type: TaskType) -> Vec<Arc<Worker>> {
        let state = self.state.lock();
        state
            .pools
            .get(&task_type)
            .map(|pool| pool.values().map(|slot| slot.worker.clone()).collect())
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> Vec<WorkerSnapshot> {
        let state = self.state.lock();
        let mut snapshot: Vec<WorkerSnapshot> = state
            .pools
            .values()
            .flat_map(|pool| pool.values())
            .map(|slot| WorkerSnapshot {
                name: slot.worker.name.clone(),
                task_type: slot.worker.task_type,
                ip: slot.worker.ip.clone(),
                port: slot.worker.port,
                node_name: slot.worker.node_name.clone(),
                pod_name: slot.worker.pod_name.clone(),
                ready: slot.ready,
                available: slot.is_available(),
                task_id: slot.bound_task.clone(),
                created_at: slot.worker.created_at,
            })
            .collect();
        snapshot.sort_by(|a, b| (a.task_type, &a.name).cmp(&(b.task_type, &b.name)));
        snapshot
    }

    pub fn bound_task_count(&self) -> usize {
        self.state.lock().task_index.len()
    }
}

/// A worker claimed for a task id the client has not been told about yet.
///
/// Dropping the claim returns the worker to the pool, so a request that is
/// abandoned between claiming and answering leaves nothing bound.
/// [`Claim::keep`] hands the binding over to the task.
pub struct Claim {
    pool: Arc<WorkerPool>,
    worker: Arc<Worker>,
    task_id: TaskId,
    kept: bool,
}

impl Claim {
    pub fn new(pool: Arc<WorkerPool>, worker: Arc<Worker>, task_id: &str) -> Self {
        Claim {
            pool,
            worker,
            task_id: task_id.to_string(),
            kept: false,
        }
    }

    pub fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }

    pub fn keep(mut self) -> Arc<Worker> {
        self.kept = true;
        self.worker.clone()
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        if !self.kept && self.pool.release(&self.worker, &self.task_id) {
            info!(
                "Worker {} released, task {} was never started",
                self.worker.name, self.task_id
            );
        }
    }
}
