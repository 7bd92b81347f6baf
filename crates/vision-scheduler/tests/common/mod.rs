// Shared harness: an in-memory orchestrator plus a dispatcher that plays the workers

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use vision_scheduler::config::OrchestratorBackend;
use vision_scheduler::dispatch::Dispatcher;
use vision_scheduler::lifecycle::WorkerSpec;
use vision_scheduler::orchestrator::MemoryOrchestrator;
use vision_scheduler::worker_pool::Worker;
use vision_scheduler::{Scheduler, SchedulerConfig};
use vision_scheduler_core::{MultipartForm, Result, TaskType};

#[derive(Debug, Clone)]
pub struct Post {
    pub url: String,
    pub form: MultipartForm,
}

/// Records every outbound POST and answers `/run_task` commands the way the
/// stage workers do, by calling the matching finish callback.
#[derive(Default)]
pub struct RecordingDispatcher {
    scheduler: OnceLock<Weak<Scheduler>>,
    posts: Mutex<Vec<Post>>,
}

impl RecordingDispatcher {
    pub fn attach(&self, scheduler: &Arc<Scheduler>) {
        let _ = self.scheduler.set(Arc::downgrade(scheduler));
    }

    pub fn posts(&self) -> Vec<Post> {
        self.posts.lock().clone()
    }

    /// Posts whose URL ends with `/<route>`
    pub fn posts_to(&self, route: &str) -> Vec<Post> {
        let suffix = format!("/{}", route);
        self.posts()
            .into_iter()
            .filter(|post| post.url.ends_with(&suffix))
            .collect()
    }

    /// Wait until at least `count` posts went to `route`
    pub async fn wait_for_posts(&self, route: &str, count: usize) -> Vec<Post> {
        for _ in 0..500 {
            let posts = self.posts_to(route);
            if posts.len() >= count {
                return posts;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("Expected {} posts to /{}, got {}", count, route, self.posts_to(route).len());
    }

    pub async fn wait_for_post(&self, route: &str) -> Post {
        let mut posts = self.wait_for_posts(route, 1).await;
        posts.remove(0)
    }

    fn worker_reply(command: &MultipartForm) -> Option<(TaskType, MultipartForm)> {
        let task_type: TaskType = command.value("task_name").ok()?.parse().ok()?;
        let task_id = command.value("task_id").ok()?;
        let finish = MultipartForm::new().text("task_id", task_id);

        if command.first_value("reset") == Some("True") {
            return Some((task_type, finish));
        }
        if command.first_value("cmd") == Some("slam") {
            return None;
        }

        let finish = match task_type {
            TaskType::Det => finish
                .text("det_result", "boxA")
                .text("det_latency", "120ms"),
            TaskType::Fusion => finish
                .text("fusion_result", "trackA")
                .text("slam_latency", "80ms")
                .text("fusion_latency", "40ms"),
            TaskType::Slam => finish
                .text("slam_result", "pose")
                .text("slam_latency", "80ms"),
            TaskType::Mcmot => finish
                .file("video", "out.mp4", vec![1u8, 2])
                .file("bbox_txt", "out.txt", vec![3u8])
                .file("bbox_xlsx", "out.xlsx", vec![4u8])
                .text("container_output", "tracked 3 objects"),
        };
        Some((task_type, finish))
    }
}

#[async_trait]
impl Dispatcher for RecordingDispatcher {
    async fn post_form(&self, url: &str, form: MultipartForm) -> Result<String> {
        self.posts.lock().push(Post {
            url: url.to_string(),
            form: form.clone(),
        });

        if url.ends_with("/run_task") {
            let scheduler = self.scheduler.get().and_then(Weak::upgrade);
            if let (Some(scheduler), Some((task_type, finish))) = (scheduler, Self::worker_reply(&form)) {
                scheduler.deliver_completion(task_type, finish)?;
            }
        }
        Ok("OK".to_string())
    }
}

pub fn test_config() -> SchedulerConfig {
    let mut config = SchedulerConfig::default();
    config.orchestrator.backend = OrchestratorBackend::Memory;
    config.orchestrator.poll_interval_ms = 1;
    config.orchestrator.ready_timeout_secs = 1;
    config.pool.batch_pause_secs = 0;
    config.pool.startup_workers.clear();
    config
}

pub struct Harness {
    pub scheduler: Arc<Scheduler>,
    pub dispatcher: Arc<RecordingDispatcher>,
    pub orchestrator: Arc<MemoryOrchestrator>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: SchedulerConfig) -> Self {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let orchestrator = Arc::new(MemoryOrchestrator::new());
        let scheduler = Arc::new(
            Scheduler::new(config, orchestrator.clone(), dispatcher.clone())
                .expect("scheduler should build"),
        );
        dispatcher.attach(&scheduler);

        Harness {
            scheduler,
            dispatcher,
            orchestrator,
        }
    }

    pub async fn add_worker(&self, task_type: TaskType, node_key: &str) -> Arc<Worker> {
        self.scheduler
            .pods()
            .create_worker(&WorkerSpec::unlimited(task_type, node_key))
            .await
            .expect("worker should be provisioned")
    }

    /// One detection worker on gpu1 and one fusion worker on as1
    pub async fn with_pipeline_workers(self) -> (Self, Arc<Worker>, Arc<Worker>) {
        let det = self.add_worker(TaskType::Det, "gpu1").await;
        let fusion = self.add_worker(TaskType::Fusion, "as1").await;
        (self, det, fusion)
    }
}

pub fn frame() -> Vec<u8> {
    vec![0x89, b'P', b'N', b'G', 0, 1, 2, 3]
}

pub fn complete_task_form(json: &str) -> MultipartForm {
    MultipartForm::new()
        .text("json", json)
        .file("frame", "frame.png", frame())
}
