use super::{Orchestrator, PodMetrics, PodPhase, PodSpec};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::info;
use vision_scheduler_core::{Result, SchedError};

#[derive(Debug, Clone)]
struct MemoryPod {
    spec: PodSpec,
    phase: PodPhase,
}

/// In-process stand-in for a cluster.
///
/// Pods are running as soon as they are created and vanish as soon as they
/// are deleted. Usage samples are whatever was stored with
/// [`MemoryOrchestrator::set_metrics`].
#[derive(Default)]
pub struct MemoryOrchestrator {
    pods: DashMap<String, MemoryPod>,
    metrics: DashMap<String, PodMetrics>,
}

impl MemoryOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pod(&self, name: &str) -> Option<PodSpec> {
        self.pods.get(name).map(|pod| pod.spec.clone())
    }

    pub fn pod_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pods.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    pub fn set_metrics(&self, name: &str, metrics: PodMetrics) {
        self.metrics.insert(name.to_string(), metrics);
    }
}

#[async_trait]
impl Orchestrator for MemoryOrchestrator {
    async fn create_pod(&self, spec: &PodSpec) -> Result<()> {
        match self.pods.entry(spec.name.clone()) {
            Entry::Occupied(_) => {
                return Err(SchedError::Orchestrator(format!("pod {} already exists", spec.name)));
            }
            Entry::Vacant(slot) => {
                slot.insert(MemoryPod {
                    spec: spec.clone(),
                    phase: PodPhase::Running,
                });
            }
        }
        info!("Created in-memory pod {}", spec.name);
        Ok(())
    }

    async fn pod_phase(&self, name: &str) -> Result<Option<PodPhase>> {
        Ok(self.pods.get(name).map(|pod| pod.phase))
    }

    async fn set_cpu_limit(&self, name: &str, millicpu: u64) -> Result<()> {
        let mut pod = self
            .pods
            .get_mut(name)
            .ok_or_else(|| SchedError::Orchestrator(format!("pod {} not found", name)))?;
        pod.spec.cpu_limit = format!("{}m", millicpu);
        Ok(())
    }

    async fn delete_pod(&self, name: &str) -> Result<()> {
        self.pods.remove(name);
        self.metrics.remove(name);
        Ok(())
    }

    async fn pod_metrics(&self, name: &str) -> Result<Option<PodMetrics>> {
        Ok(self.metrics.get(name).map(|metrics| metrics.clone()))
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vision_scheduler_core::TaskType;

    fn spec(name: &str) -> PodSpec {
        PodSpec {
            name: name.to_string(),
            task_type: TaskType::Slam,
            image: "slam:v0".to_string(),
            node_name: Some("k8s-as1".to_string()),
            port: 20000,
            cpu_limit: "0".to_string(),
            memory_limit: "0".to_string(),
            gpu: None,
            gpu_core_policy: "force".to_string(),
        }
    }

    #[tokio::test]
    async fn test_pod_lifecycle() {
        let orchestrator = MemoryOrchestrator::new();

        orchestrator.create_pod(&spec("slam-20000-k8s-as1")).await.unwrap();
        assert_eq!(
            orchestrator.pod_phase("slam-20000-k8s-as1").await.unwrap(),
            Some(PodPhase::Running)
        );
        assert!(orchestrator.create_pod(&spec("slam-20000-k8s-as1")).await.is_err());

        orchestrator.set_cpu_limit("slam-20000-k8s-as1", 700).await.unwrap();
        assert_eq!(orchestrator.pod("slam-20000-k8s-as1").unwrap().cpu_limit, "700m");

        orchestrator.delete_pod("slam-20000-k8s-as1").await.unwrap();
        assert_eq!(orchestrator.pod_phase("slam-20000-k8s-as1").await.unwrap(), None);
        orchestrator.delete_pod("slam-20000-k8s-as1").await.unwrap();
        assert!(orchestrator.set_cpu_limit("slam-20000-k8s-as1", 1).await.is_err());
    }
}
