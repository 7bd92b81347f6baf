// Scenario tests for the task flows, driven through the scheduler's public API

mod common;

use chrono::Utc;
use common::{complete_task_form, frame, Harness};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use vision_scheduler::orchestrator::PodMetrics;
use vision_scheduler::pipeline::{submit_task, CompleteTask, CompleteTaskOutcome};
use vision_scheduler_core::{MultipartForm, SchedError, TaskType, POD_NOT_FOUND, TASK_ENDED};

const CLIENT: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7));

const BEGIN: &str = r#"{"det_node_name":"gpu1","fusion_node_name":"as1","status":"Begin"}"#;

#[tokio::test]
async fn test_complete_task_happy_path() {
    let (h, det, fusion) = Harness::new().with_pipeline_workers().await;

    let outcome = CompleteTask::accept(&h.scheduler, CLIENT, complete_task_form(BEGIN))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        CompleteTaskOutcome::Accepted {
            det_task_id: "1".to_string(),
            fusion_task_id: "2".to_string(),
        }
    );

    let reply = h.dispatcher.wait_for_post("complete_task").await;
    assert_eq!(reply.url, "http://10.0.0.7:8080/complete_task");
    assert_eq!(reply.form.value("det_task_id").unwrap(), "1");
    assert_eq!(reply.form.value("fusion_task_id").unwrap(), "2");
    assert_eq!(reply.form.value("fusion_result").unwrap(), "trackA");
    assert_eq!(reply.form.value("det_compute_latency").unwrap(), "120ms");
    assert_eq!(reply.form.value("slam_compute_latency").unwrap(), "80ms");
    assert_eq!(reply.form.value("fusion_latency").unwrap(), "40ms");
    for field in ["det_io_latency", "slam_io_latency", "total_latency"] {
        assert!(reply.form.has_field(field), "missing {}", field);
    }

    // The fusion worker got the detection result
    let fusion_runs: Vec<_> = h
        .dispatcher
        .posts()
        .into_iter()
        .filter(|post| post.url == fusion.url("run_task"))
        .collect();
    assert_eq!(fusion_runs.len(), 2);
    assert_eq!(fusion_runs.iter().filter(|p| p.form.first_value("cmd") == Some("slam")).count(), 1);
    let fuse = fusion_runs
        .iter()
        .find(|p| p.form.first_value("cmd") == Some("fusion"))
        .unwrap();
    assert_eq!(fuse.form.value("detect_result").unwrap(), "boxA");

    // Begin keeps both workers bound for the following chunks
    assert_eq!(h.scheduler.pool().bound_task(&det), Some("1".to_string()));
    assert_eq!(h.scheduler.pool().bound_task(&fusion), Some("2".to_string()));
}

#[tokio::test]
async fn test_last_status_releases_workers() {
    let (h, det, fusion) = Harness::new().with_pipeline_workers().await;

    CompleteTask::accept(&h.scheduler, CLIENT, complete_task_form(BEGIN))
        .await
        .unwrap();
    h.dispatcher.wait_for_post("complete_task").await;

    let last = r#"{"det_task_id":"1","fusion_task_id":"2","status":"Last"}"#;
    let outcome = CompleteTask::accept(&h.scheduler, CLIENT, complete_task_form(last))
        .await
        .unwrap();
    assert_eq!(outcome.body(), "1:2");
    h.dispatcher.wait_for_posts("complete_task", 2).await;

    let pool = h.scheduler.pool();
    assert_eq!(pool.is_available(&det), Some(true));
    assert_eq!(pool.is_available(&fusion), Some(true));
    assert!(matches!(
        h.scheduler.worker_by_task_id("1"),
        Err(SchedError::UnknownTaskId(_))
    ));
    assert!(matches!(
        h.scheduler.worker_by_task_id("2"),
        Err(SchedError::UnknownTaskId(_))
    ));
    assert_eq!(pool.bound_task_count(), 0);

    let resets = h
        .dispatcher
        .posts_to("run_task")
        .into_iter()
        .filter(|post| post.form.first_value("reset") == Some("True"))
        .count();
    assert_eq!(resets, 2);

    // A late chunk for the finished pipeline is answered, not failed
    let running = r#"{"det_task_id":"1","fusion_task_id":"2","status":"Running"}"#;
    let outcome = CompleteTask::accept(&h.scheduler, CLIENT, complete_task_form(running))
        .await
        .unwrap();
    assert_eq!(outcome, CompleteTaskOutcome::Stale);
    assert_eq!(outcome.body(), "Failed");
}

#[tokio::test]
async fn test_complete_task_requires_frame() {
    let (h, det, _fusion) = Harness::new().with_pipeline_workers().await;

    let form = MultipartForm::new().text("json", BEGIN);
    let result = CompleteTask::accept(&h.scheduler, CLIENT, form).await;
    assert!(matches!(result, Err(SchedError::MissingFile(_))));
    assert_eq!(h.scheduler.pool().is_available(&det), Some(true));
}

#[tokio::test]
async fn test_unknown_placement_is_rejected() {
    let (h, _det, _fusion) = Harness::new().with_pipeline_workers().await;

    let json = r#"{"det_node_name":"as9","fusion_node_name":"as1","status":"Begin"}"#;
    let result = CompleteTask::accept(&h.scheduler, CLIENT, complete_task_form(json)).await;
    assert!(matches!(result, Err(SchedError::UnknownPlacement { .. })));
}

#[tokio::test]
async fn test_single_stage_slam_session() {
    let h = Harness::new();
    let worker = h.add_worker(TaskType::Slam, "as1").await;

    let begin = MultipartForm::new()
        .text("task_name", "slam")
        .text("node_name", "as1")
        .text("status", "Begin")
        .file("frame", "f0.png", frame());
    let task_id = submit_task(&h.scheduler, CLIENT, begin).await.unwrap();
    assert_eq!(task_id, "1");

    let reply = h.dispatcher.wait_for_post("slam").await;
    assert_eq!(reply.url, "http://10.0.0.7:8080/slam");
    assert_eq!(reply.form.value("slam_result").unwrap(), "pose");
    assert_eq!(h.scheduler.pool().bound_task(&worker), Some("1".to_string()));

    let last = MultipartForm::new()
        .text("task_name", "slam")
        .text("node_name", "as1")
        .text("status", "Last")
        .text("task_id", "1")
        .file("frame", "f1.png", frame());
    submit_task(&h.scheduler, CLIENT, last).await.unwrap();
    h.dispatcher.wait_for_posts("slam", 2).await;

    assert_eq!(h.scheduler.pool().is_available(&worker), Some(true));
}

#[tokio::test]
async fn test_mcmot_last_with_delete_removes_worker() {
    let h = Harness::new();
    let worker = h.add_worker(TaskType::Mcmot, "controller").await;

    let form = MultipartForm::new()
        .text("task_name", "mcmot")
        .text("node_name", "controller")
        .text("status", "Begin")
        .file("video", "cams.avi", vec![7u8; 16]);
    let task_id = submit_task(&h.scheduler, CLIENT, form).await.unwrap();

    let reply = h.dispatcher.wait_for_post("mcmot").await;
    assert_eq!(reply.form.file_part("video").unwrap().file_name, "output.mp4");
    assert_eq!(reply.form.value("container_output").unwrap(), "tracked 3 objects");

    let form = MultipartForm::new()
        .text("task_name", "mcmot")
        .text("node_name", "controller")
        .text("status", "Last")
        .text("task_id", task_id.as_str())
        .text("delete", "")
        .file("video", "cams.avi", vec![7u8; 16]);
    submit_task(&h.scheduler, CLIENT, form).await.unwrap();
    h.dispatcher.wait_for_posts("mcmot", 2).await;

    assert_eq!(h.scheduler.pool().is_available(&worker), None);
    assert!(h.orchestrator.pod(worker.pod_name()).is_none());
}

#[tokio::test]
async fn test_continuation_with_wrong_task_type() {
    let h = Harness::new();
    h.add_worker(TaskType::Slam, "as1").await;

    let begin = MultipartForm::new()
        .text("task_name", "slam")
        .text("node_name", "as1")
        .text("status", "Begin")
        .file("frame", "f0.png", frame());
    let task_id = submit_task(&h.scheduler, CLIENT, begin).await.unwrap();

    let wrong = MultipartForm::new()
        .text("task_name", "det")
        .text("node_name", "gpu1")
        .text("status", "Running")
        .text("task_id", task_id.as_str())
        .file("frame", "f1.png", frame());
    let result = submit_task(&h.scheduler, CLIENT, wrong).await;
    assert!(matches!(result, Err(SchedError::InvalidRequest(_))));
}

#[tokio::test]
async fn test_metrics_for_unknown_task() {
    let h = Harness::new();

    let usage = h.scheduler.query_usage("42").await.unwrap();
    assert!(!usage.available);
    assert_eq!(usage.collected_time, TASK_ENDED);
}

#[tokio::test]
async fn test_metrics_for_bound_task() {
    let h = Harness::new();
    let worker = h.add_worker(TaskType::Det, "gpu1").await;
    h.scheduler
        .occupy_worker(TaskType::Det, "9", "gpu1")
        .await
        .unwrap();

    let usage = h.scheduler.query_usage("9").await.unwrap();
    assert!(!usage.available);
    assert_eq!(usage.collected_time, POD_NOT_FOUND);

    h.orchestrator.set_metrics(
        worker.pod_name(),
        PodMetrics {
            cpu: 250,
            memory: 512_000,
            storage: 0,
            storage_ephemeral: 0,
            timestamp: Utc::now(),
            window: Duration::from_secs(30),
        },
    );
    let usage = h.scheduler.query_usage("9").await.unwrap();
    assert!(usage.available);
    assert_eq!(usage.cpu, 250);
    assert_eq!(usage.window, 30_000);
    assert_eq!(usage.pod_name, worker.pod_name());
}

#[tokio::test]
async fn test_blocked_task_runs_after_release() {
    let (h, det, _fusion) = Harness::new().with_pipeline_workers().await;

    h.scheduler
        .occupy_worker(TaskType::Det, "100", "gpu1")
        .await
        .unwrap();

    let scheduler = h.scheduler.clone();
    let waiter = tokio::spawn(async move {
        scheduler
            .occupy_worker(TaskType::Det, "101", "gpu1")
            .await
            .map(|w| w.name().to_string())
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());

    assert!(h.scheduler.pool().release(&det, "100"));
    let name = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(name, det.name());

    let result = h
        .scheduler
        .occupy_worker_timeout(TaskType::Det, "102", "gpu1", Duration::from_millis(30))
        .await;
    assert!(matches!(result, Err(SchedError::OccupyTimeout { .. })));
}

#[tokio::test]
async fn test_bootstrap_creates_startup_workers() {
    let mut config = common::test_config();
    config.pool.startup_workers = vision_scheduler::SchedulerConfig::default().pool.startup_workers;
    let h = Harness::with_config(config);

    assert_eq!(h.scheduler.bootstrap().await.unwrap(), 4);
    assert_eq!(
        h.orchestrator.pod_names(),
        vec![
            "mcmot-20000-controller",
            "slam-20000-k8s-as1",
            "slam-20000-k8s-as2",
            "slam-20001-controller",
        ]
    );
    assert!(h.scheduler.pool().snapshot().iter().all(|w| w.available));
}

#[tokio::test]
async fn test_abandoned_begin_releases_claimed_worker() {
    let (h, det, fusion) = Harness::new().with_pipeline_workers().await;
    h.scheduler
        .occupy_worker(TaskType::Fusion, "999", "as1")
        .await
        .unwrap();

    // Detection is claimed, then the request gives up waiting for fusion
    let pending = CompleteTask::accept(&h.scheduler, CLIENT, complete_task_form(BEGIN));
    assert!(tokio::time::timeout(Duration::from_millis(50), pending)
        .await
        .is_err());

    let pool = h.scheduler.pool();
    assert_eq!(pool.is_available(&det), Some(true));
    assert_eq!(pool.bound_task_count(), 1);
    assert!(h.dispatcher.posts_to("run_task").is_empty());

    assert!(pool.release(&fusion, "999"));
    assert_eq!(pool.bound_task_count(), 0);
}

#[tokio::test]
async fn test_last_chunk_deletes_only_flagged_worker() {
    let (h, det, fusion) = Harness::new().with_pipeline_workers().await;

    CompleteTask::accept(&h.scheduler, CLIENT, complete_task_form(BEGIN))
        .await
        .unwrap();
    h.dispatcher.wait_for_post("complete_task").await;

    let last = r#"{"det_task_id":"1","fusion_task_id":"2","status":"Last","delete_det_worker":true}"#;
    CompleteTask::accept(&h.scheduler, CLIENT, complete_task_form(last))
        .await
        .unwrap();
    h.dispatcher.wait_for_posts("complete_task", 2).await;

    let pool = h.scheduler.pool();
    assert_eq!(pool.is_available(&det), None);
    assert!(h.orchestrator.pod(det.pod_name()).is_none());
    assert_eq!(pool.is_available(&fusion), Some(true));
    assert!(h.orchestrator.pod(fusion.pod_name()).is_some());
}

#[tokio::test]
async fn test_last_chunk_deletes_fusion_worker() {
    let (h, det, fusion) = Harness::new().with_pipeline_workers().await;

    CompleteTask::accept(&h.scheduler, CLIENT, complete_task_form(BEGIN))
        .await
        .unwrap();
    h.dispatcher.wait_for_post("complete_task").await;

    let last = r#"{"det_task_id":"1","fusion_task_id":"2","status":"Last","delete_fusion_worker":true}"#;
    CompleteTask::accept(&h.scheduler, CLIENT, complete_task_form(last))
        .await
        .unwrap();
    h.dispatcher.wait_for_posts("complete_task", 2).await;

    assert_eq!(h.scheduler.pool().is_available(&fusion), None);
    assert!(h.orchestrator.pod(fusion.pod_name()).is_none());
    assert_eq!(h.scheduler.pool().is_available(&det), Some(true));
    assert!(h.orchestrator.pod(det.pod_name()).is_some());
}

#[tokio::test]
async fn test_delete_on_running_chunk_fails_flow() {
    let (h, det, fusion) = Harness::new().with_pipeline_workers().await;

    CompleteTask::accept(&h.scheduler, CLIENT, complete_task_form(BEGIN))
        .await
        .unwrap();
    h.dispatcher.wait_for_post("complete_task").await;

    let running = r#"{"det_task_id":"1","fusion_task_id":"2","status":"Running","delete_det_worker":true}"#;
    let outcome = CompleteTask::accept(&h.scheduler, CLIENT, complete_task_form(running))
        .await
        .unwrap();
    assert_eq!(outcome.body(), "1:2");

    let failures = h
        .scheduler
        .metrics()
        .pipeline_failures
        .with_label_values(&["complete_task"]);
    for _ in 0..500 {
        if failures.get() > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(failures.get(), 1);

    // A bound worker cannot be deleted, so the registry is left as it was
    let pool = h.scheduler.pool();
    assert_eq!(pool.bound_task(&det), Some("1".to_string()));
    assert_eq!(pool.bound_task(&fusion), Some("2".to_string()));
    assert!(h.orchestrator.pod(det.pod_name()).is_some());
    assert_eq!(h.dispatcher.posts_to("complete_task").len(), 1);
}
