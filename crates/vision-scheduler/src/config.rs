use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use vision_scheduler_core::{Result, SchedError, TaskType};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub orchestrator: OrchestratorConfig,
    pub pool: PoolConfig,
    pub images: ImageConfig,
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub request_timeout_secs: u64,
    /// Body limit for frame-sized forms
    pub max_form_bytes: usize,
    /// Body limit for forms that may carry whole videos
    pub max_video_form_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Port clients listen on for result delivery
    pub callback_port: u16,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrchestratorBackend {
    Kubernetes,
    /// Pods exist only in memory and are running as soon as they are created
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub backend: OrchestratorBackend,
    pub namespace: String,
    pub api_server: String,
    pub token_path: PathBuf,
    pub ca_path: PathBuf,
    pub poll_interval_ms: u64,
    pub ready_timeout_secs: u64,
    /// Value of `GPU_CORE_UTILIZATION_POLICY` handed to every worker
    pub gpu_core_policy: String,
}

/// Where workers of one task type run for a given node key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub task_type: TaskType,
    pub node_key: String,
    pub node_name: String,
    pub host: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartupWorker {
    pub task_type: TaskType,
    pub node_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// First port handed out on every host
    pub base_port: u16,
    pub batch_sizes: BTreeMap<String, usize>,
    pub default_batch_size: usize,
    pub batch_pause_secs: u64,
    pub placements: Vec<Placement>,
    pub startup_workers: Vec<StartupWorker>,
    /// Task types whose CPU limit `/update_cpu` adjusts
    pub cpu_update_task_types: Vec<TaskType>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    pub det: String,
    pub fusion: String,
    pub slam: String,
    pub mcmot: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub prometheus_port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "0.0.0.0".to_string(),
            port: 8081,
            request_timeout_secs: 60,
            max_form_bytes: 2 * 1024 * 1024,
            max_video_form_bytes: 15 * 1024 * 1024,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            callback_port: 8080,
            request_timeout_secs: 60,
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig {
            backend: OrchestratorBackend::Kubernetes,
            namespace: "default".to_string(),
            api_server: "https://kubernetes.default.svc".to_string(),
            token_path: PathBuf::from("/var/run/secrets/kubernetes.io/serviceaccount/token"),
            ca_path: PathBuf::from("/var/run/secrets/kubernetes.io/serviceaccount/ca.crt"),
            poll_interval_ms: 500,
            ready_timeout_secs: 120,
            gpu_core_policy: "force".to_string(),
        }
    }
}

fn placement(task_type: TaskType, node_key: &str, node_name: &str, host: &str) -> Placement {
    Placement {
        task_type,
        node_key: node_key.to_string(),
        node_name: node_name.to_string(),
        host: host.to_string(),
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        let batch_sizes = [("controller", 8), ("as1", 4), ("gpu1", 3)]
            .into_iter()
            .map(|(key, size)| (key.to_string(), size))
            .collect();

        PoolConfig {
            base_port: 20000,
            batch_sizes,
            default_batch_size: 4,
            batch_pause_secs: 30,
            placements: vec![
                placement(TaskType::Slam, "as1", "k8s-as1", "192.168.1.100"),
                placement(TaskType::Fusion, "as1", "k8s-as1", "192.168.1.100"),
                placement(TaskType::Slam, "as2", "k8s-as2", "192.168.1.103"),
                placement(TaskType::Mcmot, "controller", "controller", "192.168.1.101"),
                placement(TaskType::Slam, "controller", "controller", "192.168.1.101"),
                placement(TaskType::Fusion, "controller", "controller", "192.168.1.101"),
                placement(TaskType::Det, "gpu1", "gpu1", "192.168.1.106"),
            ],
            startup_workers: vec![
                StartupWorker { task_type: TaskType::Slam, node_key: "as1".to_string() },
                StartupWorker { task_type: TaskType::Slam, node_key: "as2".to_string() },
                StartupWorker { task_type: TaskType::Mcmot, node_key: "controller".to_string() },
                StartupWorker { task_type: TaskType::Slam, node_key: "controller".to_string() },
            ],
            cpu_update_task_types: vec![TaskType::Fusion],
        }
    }
}

impl Default for ImageConfig {
    fn default() -> Self {
        ImageConfig {
            det: "docker.io/luoxiao23333/task_det:v0".to_string(),
            fusion: "docker.io/luoxiao23333/task_fusion:v0".to_string(),
            slam: "docker.io/luoxiao23333/task_slam:v0".to_string(),
            mcmot: "docker.io/luoxiao23333/task_mcmot:v0".to_string(),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        MonitoringConfig {
            prometheus_port: 9091,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            log_file: None,
        }
    }
}

impl SchedulerConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: SchedulerConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Resolve a node key such as `as1` to the placement of `task_type` there
    pub fn placement(&self, task_type: TaskType, node_key: &str) -> Result<&Placement> {
        self.pool
            .placements
            .iter()
            .find(|p| p.task_type == task_type && p.node_key == node_key)
            .ok_or_else(|| SchedError::UnknownPlacement {
                task_type: task_type.to_string(),
                node_key: node_key.to_string(),
            })
    }

    pub fn image(&self, task_type: TaskType) -> &str {
        match task_type {
            TaskType::Det => &self.images.det,
            TaskType::Fusion => &self.images.fusion,
            TaskType::Slam => &self.images.slam,
            TaskType::Mcmot => &self.images.mcmot,
        }
    }

    pub fn batch_size(&self, node_key: &str) -> usize {
        self.pool
            .batch_sizes
            .get(node_key)
            .copied()
            .unwrap_or(self.pool.default_batch_size)
            .max(1)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.orchestrator.poll_interval_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.orchestrator.ready_timeout_secs)
    }

    pub fn batch_pause(&self) -> Duration {
        Duration::from_secs(self.pool.batch_pause_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_placements_resolve_node_keys() {
        let config = SchedulerConfig::default();

        let fusion = config.placement(TaskType::Fusion, "as1").unwrap();
        assert_eq!(fusion.node_name, "k8s-as1");
        assert_eq!(fusion.host, "192.168.1.100");

        assert!(matches!(
            config.placement(TaskType::Det, "as1"),
            Err(SchedError::UnknownPlacement { .. })
        ));
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
server:
  port: 9000
orchestrator:
  backend: memory
monitoring:
  log_format: json
pool:
  batch_pause_secs: 0
  placements:
    - task_type: det
      node_key: edge
      node_name: edge-node
      host: 10.0.0.5
"#;
        let config: SchedulerConfig = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.orchestrator.backend, OrchestratorBackend::Memory);
        assert_eq!(config.pool.base_port, 20000);
        assert_eq!(config.placement(TaskType::Det, "edge").unwrap().node_name, "edge-node");
        assert_eq!(config.batch_size("controller"), 8);
        assert_eq!(config.batch_size("unknown"), 4);
        assert_eq!(config.client.callback_port, 8080);
        assert_eq!(config.monitoring.log_format, LogFormat::Json);
        assert_eq!(config.monitoring.log_level, "info");
        assert_eq!(SchedulerConfig::default().monitoring.log_format, LogFormat::Text);
    }
}
