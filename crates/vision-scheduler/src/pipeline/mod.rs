//! Client-facing task flows.
//!
//! Both flows answer the client right after dispatching and finish in a
//! background continuation that resumes when the worker calls back.

mod complete;

pub use complete::{CompleteTask, CompleteTaskInfo, CompleteTaskOutcome, PipelineLatencies};

use crate::notifier::CompletionHandle;
use crate::scheduler::Scheduler;
use crate::stage;
use crate::worker_pool::Worker;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::info;
use vision_scheduler_core::{MultipartForm, Result, SchedError, TaskId, TaskStatus, TaskType};

/// Control fields of a `/new_task` submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTaskRequest {
    pub task_type: TaskType,
    /// Placement key of the node to run on
    pub node_key: String,
    pub status: TaskStatus,
    /// Id from an earlier `Begin`; ignored when starting
    pub task_id: TaskId,
    pub delete: bool,
}

impl NewTaskRequest {
    pub fn from_form(form: &MultipartForm) -> Result<Self> {
        let status: TaskStatus = form.value("status")?.parse()?;
        let task_id = match status {
            TaskStatus::Begin => form.first_value("task_id").unwrap_or_default(),
            TaskStatus::Running | TaskStatus::Last => form.value("task_id")?,
        };

        Ok(NewTaskRequest {
            task_type: form.value("task_name")?.parse()?,
            node_key: form.value("node_name")?.to_string(),
            status,
            task_id: task_id.to_string(),
            delete: form.has_field("delete"),
        })
    }
}

/// Start or continue a single-stage task and return its task id.
///
/// `Begin` claims a worker under a fresh id, later chunks go to the worker
/// already bound to the id. The stage result is posted to the client once the
/// worker reports back.
pub async fn submit_task(scheduler: &Arc<Scheduler>, client_ip: IpAddr, form: MultipartForm) -> Result<TaskId> {
    let request = NewTaskRequest::from_form(&form)?;
    scheduler
        .metrics()
        .inc_tasks_total(request.task_type.as_str(), request.status);

    let (task_id, worker, claim) = match request.status {
        TaskStatus::Begin => {
            let task_id = scheduler.next_task_id();
            let claim = scheduler
                .claim_worker(request.task_type, &task_id, &request.node_key)
                .await?;
            (task_id, claim.worker().clone(), Some(claim))
        }
        TaskStatus::Running | TaskStatus::Last => {
            let worker = scheduler.worker_by_task_id(&request.task_id)?;
            if worker.task_type() != request.task_type {
                return Err(SchedError::InvalidRequest(format!(
                    "task {} runs on a {} worker, not {}",
                    request.task_id,
                    worker.task_type(),
                    request.task_type
                )));
            }
            (request.task_id.clone(), worker, None)
        }
    };
    info!(
        "Receive task {}, assigned id {}, worker {}",
        request.task_type,
        task_id,
        worker.describe()
    );

    // A fresh claim is handed back on malformed input or an abandoned request.
    // A failed dispatch leaves the worker in an unknown state, so it stays bound.
    let run = stage::run_form(request.task_type, &task_id, &form)?;
    let started = scheduler.start_stage(&worker, &task_id, run).await;
    if let Some(claim) = claim {
        claim.keep();
    }
    let handle = started?;

    scheduler.spawn_flow(
        "new_task",
        send_back(
            scheduler.clone(),
            worker,
            task_id.clone(),
            request.status,
            request.delete,
            handle,
            client_ip,
        ),
    );

    Ok(task_id)
}

/// Await the worker's callback, settle the worker and forward the result
async fn send_back(
    scheduler: Arc<Scheduler>,
    worker: Arc<Worker>,
    task_id: TaskId,
    status: TaskStatus,
    delete: bool,
    handle: CompletionHandle,
    client_ip: IpAddr,
) -> Result<()> {
    let finish = handle.wait().await?;
    info!("Receive result of task id {}", task_id);

    scheduler
        .finish_worker(&worker, &task_id, status, delete)
        .await?;

    let task_type = worker.task_type();
    let reply = stage::client_reply(task_type, &finish)?;
    scheduler
        .send_to_client(client_ip, task_type.as_str(), reply)
        .await
}
