use crate::scheduler::Scheduler;
use crate::stage;
use crate::worker_pool::Worker;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};
use vision_scheduler_core::{
    format_latency, parse_latency, MultipartForm, Result, SchedError, TaskId, TaskStatus, TaskType,
};

/// JSON control block of a `/complete_task` request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteTaskInfo {
    #[serde(default)]
    pub det_node_name: String,
    #[serde(default)]
    pub det_task_id: String,
    #[serde(default)]
    pub fusion_node_name: String,
    #[serde(default)]
    pub fusion_task_id: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub delete_det_worker: bool,
    #[serde(default)]
    pub delete_fusion_worker: bool,
}

impl CompleteTaskInfo {
    pub fn from_form(form: &MultipartForm) -> Result<Self> {
        let raw = form.value("json")?;
        serde_json::from_str(raw)
            .map_err(|e| SchedError::InvalidRequest(format!("complete_task json: {}", e)))
    }
}

/// What the client is told right away
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompleteTaskOutcome {
    Accepted {
        det_task_id: TaskId,
        fusion_task_id: TaskId,
    },
    /// The ids no longer resolve to workers, e.g. after a duplicate `Last`
    Stale,
}

impl CompleteTaskOutcome {
    /// `"<det id>:<fusion id>"`, or `Failed`
    pub fn body(&self) -> String {
        match self {
            CompleteTaskOutcome::Accepted {
                det_task_id,
                fusion_task_id,
            } => format!("{}:{}", det_task_id, fusion_task_id),
            CompleteTaskOutcome::Stale => "Failed".to_string(),
        }
    }
}

/// Timings of one pipeline run, reported to the client
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineLatencies {
    pub slam_compute: Duration,
    pub slam_io: Duration,
    pub det_compute: Duration,
    pub det_io: Duration,
    pub fusion: Duration,
    pub total: Duration,
}

impl PipelineLatencies {
    fn entries(&self) -> [(&'static str, Duration); 6] {
        [
            ("slam_compute", self.slam_compute),
            ("slam_io", self.slam_io),
            ("det_compute", self.det_compute),
            ("det_io", self.det_io),
            ("fusion", self.fusion),
            ("total", self.total),
        ]
    }

    /// Append `<stage>_latency` fields
    pub fn write_to(&self, form: &mut MultipartForm) {
        for (stage, latency) in self.entries() {
            form.push_text(format!("{}_latency", stage), format_latency(latency));
        }
    }
}

struct Detection {
    result: String,
    io: Duration,
    compute: Duration,
}

struct Fusion {
    result: String,
    slam_compute: Duration,
    fusion: Duration,
}

/// One chunk of the detection + localization + fusion pipeline.
///
/// Detection and localization run concurrently on their own workers; the
/// detection result is then fed into the fusion worker, whose result goes
/// back to the client together with the stage timings.
pub struct CompleteTask {
    scheduler: Arc<Scheduler>,
    det_worker: Arc<Worker>,
    fusion_worker: Arc<Worker>,
    det_task_id: TaskId,
    fusion_task_id: TaskId,
    info: CompleteTaskInfo,
    input: MultipartForm,
    client_ip: IpAddr,
}

impl CompleteTask {
    /// Bind the request to its two workers and start the pipeline in the background.
    ///
    /// `Begin` claims a detection and a fusion worker under fresh ids; later
    /// chunks reuse the workers bound to the ids the client sends back.
    pub async fn accept(scheduler: &Arc<Scheduler>, client_ip: IpAddr, input: MultipartForm) -> Result<CompleteTaskOutcome> {
        let info = CompleteTaskInfo::from_form(&input)?;
        input.file_part(TaskType::Fusion.input_file().0)?;
        scheduler.metrics().inc_tasks_total("complete", info.status);

        let task = match info.status {
            TaskStatus::Begin => {
                let det_task_id = scheduler.next_task_id();
                let fusion_task_id = scheduler.next_task_id();

                // The detection claim is handed back if the fusion wait fails or is abandoned
                let det_claim = scheduler
                    .claim_worker(TaskType::Det, &det_task_id, &info.det_node_name)
                    .await?;
                let fusion_claim = scheduler
                    .claim_worker(TaskType::Fusion, &fusion_task_id, &info.fusion_node_name)
                    .await?;

                CompleteTask {
                    scheduler: scheduler.clone(),
                    det_worker: det_claim.keep(),
                    fusion_worker: fusion_claim.keep(),
                    det_task_id,
                    fusion_task_id,
                    info,
                    input,
                    client_ip,
                }
            }
            TaskStatus::Running | TaskStatus::Last => {
                let workers = (
                    scheduler.worker_by_task_id(&info.det_task_id),
                    scheduler.worker_by_task_id(&info.fusion_task_id),
                );
                let (det_worker, fusion_worker) = match workers {
                    (Ok(det), Ok(fusion)) => (det, fusion),
                    (Err(SchedError::UnknownTaskId(id)), _) | (_, Err(SchedError::UnknownTaskId(id))) => {
                        warn!("Task id {} has no worker, it may have finished already", id);
                        return Ok(CompleteTaskOutcome::Stale);
                    }
                    (Err(e), _) | (_, Err(e)) => return Err(e),
                };

                CompleteTask {
                    scheduler: scheduler.clone(),
                    det_worker,
                    fusion_worker,
                    det_task_id: info.det_task_id.clone(),
                    fusion_task_id: info.fusion_task_id.clone(),
                    info,
                    input,
                    client_ip,
                }
            }
        };

        let outcome = CompleteTaskOutcome::Accepted {
            det_task_id: task.det_task_id.clone(),
            fusion_task_id: task.fusion_task_id.clone(),
        };
        scheduler.spawn_flow("complete_task", task.run());
        Ok(outcome)
    }

    pub async fn run(self) -> Result<()> {
        let started = Instant::now();

        let (detection, slam_io) = tokio::try_join!(self.detect(), self.localize())?;
        let fusion = self.fuse(&detection.result).await?;

        let latencies = PipelineLatencies {
            slam_compute: fusion.slam_compute,
            slam_io,
            det_compute: detection.compute,
            det_io: detection.io,
            fusion: fusion.fusion,
            total: started.elapsed(),
        };
        let metrics = self.scheduler.metrics();
        for (stage, latency) in latencies.entries() {
            metrics.observe_stage(stage, latency);
        }

        let mut reply = MultipartForm::new()
            .text("det_task_id", self.det_task_id.as_str())
            .text("fusion_task_id", self.fusion_task_id.as_str())
            .text("fusion_result", fusion.result);
        latencies.write_to(&mut reply);

        self.scheduler
            .send_to_client(self.client_ip, "complete_task", reply)
            .await
    }

    /// Detection on the det worker, waited for through its callback
    async fn detect(&self) -> Result<Detection> {
        let started = Instant::now();
        let run = stage::run_form(TaskType::Det, &self.det_task_id, &self.input)?;
        let handle = self
            .scheduler
            .start_stage(&self.det_worker, &self.det_task_id, run)
            .await?;
        let io = started.elapsed();

        let finish = handle.wait().await?;
        self.scheduler
            .finish_worker(
                &self.det_worker,
                &self.det_task_id,
                self.info.status,
                self.info.delete_det_worker,
            )
            .await?;

        Ok(Detection {
            result: finish.value("det_result")?.to_string(),
            io,
            compute: parse_latency(finish.value("det_latency")?)?,
        })
    }

    /// Hand the frame to the fusion worker; its result is consumed by the fusion step
    async fn localize(&self) -> Result<Duration> {
        let started = Instant::now();
        let form = stage::localization_form(&self.fusion_task_id, &self.input)?;
        self.scheduler.dispatch(&self.fusion_worker, form).await?;
        Ok(started.elapsed())
    }

    async fn fuse(&self, detect_result: &str) -> Result<Fusion> {
        let form = stage::fusion_form(&self.fusion_task_id, detect_result);
        let handle = self
            .scheduler
            .start_stage(&self.fusion_worker, &self.fusion_task_id, form)
            .await?;

        let finish = handle.wait().await?;
        info!("Fusion of task {} notified", self.fusion_task_id);

        let fusion = Fusion {
            result: finish.value("fusion_result")?.to_string(),
            slam_compute: parse_latency(finish.value("slam_latency")?)?,
            fusion: parse_latency(finish.value("fusion_latency")?)?,
        };

        self.scheduler
            .finish_worker(
                &self.fusion_worker,
                &self.fusion_task_id,
                self.info.status,
                self.info.delete_fusion_worker,
            )
            .await?;
        Ok(fusion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_from_form() {
        let form = MultipartForm::new().text(
            "json",
            r#"{"det_node_name":"gpu1","fusion_node_name":"as1","status":"Begin","delete_det_worker":true}"#,
        );

        let info = CompleteTaskInfo::from_form(&form).unwrap();
        assert_eq!(info.status, TaskStatus::Begin);
        assert_eq!(info.det_node_name, "gpu1");
        assert_eq!(info.det_task_id, "");
        assert!(info.delete_det_worker);
        assert!(!info.delete_fusion_worker);
    }

    #[test]
    fn test_info_rejects_bad_json() {
        let form = MultipartForm::new().text("json", "{not json");
        assert!(matches!(
            CompleteTaskInfo::from_form(&form),
            Err(SchedError::InvalidRequest(_))
        ));
        assert!(matches!(
            CompleteTaskInfo::from_form(&MultipartForm::new()),
            Err(SchedError::FormField { .. })
        ));
    }

    #[test]
    fn test_outcome_bodies() {
        let accepted = CompleteTaskOutcome::Accepted {
            det_task_id: "1".to_string(),
            fusion_task_id: "2".to_string(),
        };
        assert_eq!(accepted.body(), "1:2");
        assert_eq!(CompleteTaskOutcome::Stale.body(), "Failed");
    }

    #[test]
    fn test_latency_fields() {
        let latencies = PipelineLatencies {
            det_compute: Duration::from_millis(120),
            fusion: Duration::from_millis(40),
            ..Default::default()
        };
        let mut form = MultipartForm::new();
        latencies.write_to(&mut form);

        assert_eq!(form.value("det_compute_latency").unwrap(), "120ms");
        assert_eq!(form.value("fusion_latency").unwrap(), "40ms");
        assert_eq!(form.value("total_latency").unwrap(), "0s");
        assert_eq!(form.fields().count(), 6);
    }
}
