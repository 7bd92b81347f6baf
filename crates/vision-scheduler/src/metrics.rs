use crate::worker_pool::WorkerSnapshot;
use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;
use vision_scheduler_core::{TaskStatus, TaskType};

/// Prometheus metrics for the scheduler
pub struct SchedulerMetrics {
    pub registry: Registry,

    // Accepted client requests
    pub tasks_total: CounterVec,

    // Pool occupancy
    pub workers: IntGaugeVec,

    // Per-stage latencies of completed pipelines
    pub stage_latency: HistogramVec,

    // Background flows that ended in an error
    pub pipeline_failures: IntCounterVec,

    // Pod create/delete/resize calls
    pub worker_operations: IntCounterVec,
}

impl SchedulerMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let tasks_total = CounterVec::new(
            Opts::new("vs_tasks_total", "Client requests by task type and status"),
            &["task_type", "status"],
        )?;
        registry.register(Box::new(tasks_total.clone()))?;

        let workers = IntGaugeVec::new(
            Opts::new("vs_workers", "Pooled workers by task type and state"),
            &["task_type", "state"],
        )?;
        registry.register(Box::new(workers.clone()))?;

        let stage_latency = HistogramVec::new(
            HistogramOpts::new("vs_stage_latency_seconds", "Pipeline stage latency in seconds")
                .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
            &["stage"],
        )?;
        registry.register(Box::new(stage_latency.clone()))?;

        let pipeline_failures = IntCounterVec::new(
            Opts::new("vs_pipeline_failures_total", "Background flows aborted by an error"),
            &["flow"],
        )?;
        registry.register(Box::new(pipeline_failures.clone()))?;

        let worker_operations = IntCounterVec::new(
            Opts::new("vs_worker_operations_total", "Worker pod operations"),
            &["operation"],
        )?;
        registry.register(Box::new(worker_operations.clone()))?;

        Ok(SchedulerMetrics {
            registry,
            tasks_total,
            workers,
            stage_latency,
            pipeline_failures,
            worker_operations,
        })
    }

    pub fn inc_tasks_total(&self, task_type: &str, status: TaskStatus) {
        self.tasks_total
            .with_label_values(&[task_type, status.as_str()])
            .inc();
    }

    pub fn observe_stage(&self, stage: &str, latency: Duration) {
        self.stage_latency
            .with_label_values(&[stage])
            .observe(latency.as_secs_f64());
    }

    pub fn inc_failure(&self, flow: &str) {
        self.pipeline_failures.with_label_values(&[flow]).inc();
    }

    pub fn inc_operation(&self, operation: &str) {
        self.worker_operations.with_label_values(&[operation]).inc();
    }

    /// Recompute the pool gauges from a snapshot
    pub fn update_workers(&self, snapshot: &[WorkerSnapshot]) {
        for task_type in TaskType::ALL {
            let (available, occupied) = snapshot
                .iter()
                .filter(|worker| worker.task_type == task_type)
                .fold((0, 0), |(available, occupied), worker| {
                    if worker.available {
                        (available + 1, occupied)
                    } else {
                        (available, occupied + 1)
                    }
                });
            self.workers
                .with_label_values(&[task_type.as_str(), "available"])
                .set(available);
            self.workers
                .with_label_values(&[task_type.as_str(), "occupied"])
                .set(occupied);
        }
    }

    /// Text exposition of every registered metric
    pub fn render(&self) -> anyhow::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_recorded_series() {
        let metrics = SchedulerMetrics::new().unwrap();
        metrics.inc_tasks_total("det", TaskStatus::Begin);
        metrics.observe_stage("fusion", Duration::from_millis(40));
        metrics.inc_failure("complete_task");
        metrics.inc_operation("create");

        let text = metrics.render().unwrap();
        assert!(text.contains("vs_tasks_total{status=\"Begin\",task_type=\"det\"} 1"));
        assert!(text.contains("vs_stage_latency_seconds_count{stage=\"fusion\"} 1"));
        assert!(text.contains("vs_pipeline_failures_total{flow=\"complete_task\"} 1"));
        assert!(text.contains("vs_worker_operations_total{operation=\"create\"} 1"));
    }
}
