use super::{Orchestrator, PodMetrics, PodPhase, PodSpec};
use crate::config::OrchestratorConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde_json::{json, Value};
use tracing::{debug, info};
use vision_scheduler_core::{parse_latency, Result, SchedError};

/// Pod access through the Kubernetes REST API using in-cluster credentials
pub struct KubernetesOrchestrator {
    client: reqwest::Client,
    api_server: String,
    namespace: String,
    token: String,
}

fn api_error(context: &str, err: impl std::fmt::Display) -> SchedError {
    SchedError::Orchestrator(format!("{}: {}", context, err))
}

impl KubernetesOrchestrator {
    /// Build a client from the pod's service-account token and cluster CA
    pub fn in_cluster(config: &OrchestratorConfig) -> Result<Self> {
        let token = std::fs::read_to_string(&config.token_path)
            .map_err(|e| api_error(&format!("reading token {}", config.token_path.display()), e))?;
        let ca = std::fs::read(&config.ca_path)
            .map_err(|e| api_error(&format!("reading CA {}", config.ca_path.display()), e))?;
        let ca = reqwest::Certificate::from_pem(&ca).map_err(|e| api_error("parsing cluster CA", e))?;

        let client = reqwest::Client::builder()
            .add_root_certificate(ca)
            .build()
            .map_err(|e| api_error("building API client", e))?;

        Ok(KubernetesOrchestrator {
            client,
            api_server: config.api_server.trim_end_matches('/').to_string(),
            namespace: config.namespace.clone(),
            token: token.trim().to_string(),
        })
    }

    fn pods_url(&self) -> String {
        format!("{}/api/v1/namespaces/{}/pods", self.api_server, self.namespace)
    }

    fn pod_url(&self, name: &str) -> String {
        format!("{}/{}", self.pods_url(), name)
    }

    fn metrics_url(&self, name: &str) -> String {
        format!(
            "{}/apis/metrics.k8s.io/v1beta1/namespaces/{}/pods/{}",
            self.api_server, self.namespace, name
        )
    }

    /// GET a JSON object, `None` on 404
    async fn get_json(&self, url: &str) -> Result<Option<Value>> {
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| api_error(url, e))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = response
            .error_for_status()
            .map_err(|e| api_error(url, e))?
            .json::<Value>()
            .await
            .map_err(|e| api_error(url, e))?;
        Ok(Some(body))
    }
}

/// Pod manifest for a worker: host networking, one container named after the pod
pub(crate) fn pod_manifest(spec: &PodSpec) -> Value {
    let mut limits = json!({
        "cpu": spec.cpu_limit,
        "memory": spec.memory_limit,
    });
    if let Some(gpu) = spec.gpu {
        limits["nvidia.com/gpucores"] = json!(gpu.cores.to_string());
        limits["nvidia.com/gpu"] = json!("1");
        limits["nvidia.com/gpumem"] = json!(gpu.memory.to_string());
    }

    let mut pod_spec = json!({
        "hostNetwork": true,
        "containers": [{
            "name": spec.name,
            "image": spec.image,
            "resources": {
                "limits": limits,
                "requests": { "cpu": "0", "memory": "0" },
            },
            "env": [
                { "name": "task_name", "value": spec.task_type.as_str() },
                { "name": "port", "value": spec.port.to_string() },
                { "name": "GPU_CORE_UTILIZATION_POLICY", "value": spec.gpu_core_policy },
            ],
        }],
    });
    if let Some(node_name) = &spec.node_name {
        pod_spec["nodeName"] = json!(node_name);
    }
    if spec.gpu.is_some() {
        pod_spec["tolerations"] = json!([{
            "key": "nvidia.com/gpu",
            "operator": "Exists",
            "effect": "NoSchedule",
        }]);
    }

    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": spec.name,
            "labels": { "worker": spec.task_type.as_str() },
        },
        "spec": pod_spec,
    })
}

fn decimal_exponent(suffix: &str) -> Option<i32> {
    match suffix {
        "n" => Some(-9),
        "u" => Some(-6),
        "m" => Some(-3),
        "" => Some(0),
        "k" => Some(3),
        "M" => Some(6),
        "G" => Some(9),
        "T" => Some(12),
        "P" => Some(15),
        "E" => Some(18),
        _ => None,
    }
}

fn binary_multiplier(suffix: &str) -> Option<i128> {
    let power = match suffix {
        "Ki" => 1,
        "Mi" => 2,
        "Gi" => 3,
        "Ti" => 4,
        "Pi" => 5,
        "Ei" => 6,
        _ => return None,
    };
    Some(1i128 << (10 * power))
}

/// Convert a Kubernetes quantity (`"250m"`, `"1.5"`, `"128Mi"`, `"1e3"`) to
/// milli-units, rounding up like the API machinery does.
pub fn parse_quantity_millis(quantity: &str) -> Result<i64> {
    let invalid = || SchedError::InvalidQuantity {
        value: quantity.to_string(),
    };

    let (negative, body) = match quantity.trim().strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, quantity.trim().strip_prefix('+').unwrap_or(quantity.trim())),
    };
    let number_len = body
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(body.len());
    let (number, suffix) = body.split_at(number_len);
    if number.is_empty() || number == "." || number.matches('.').count() > 1 {
        return Err(invalid());
    }

    let (int_part, frac_part) = number.split_once('.').unwrap_or((number, ""));
    let mantissa: i128 = format!("{}{}", int_part, frac_part).parse().map_err(|_| invalid())?;

    let (multiplier, exponent) = if let Some(multiplier) = binary_multiplier(suffix) {
        (multiplier, 0)
    } else if let Some(exponent) = decimal_exponent(suffix) {
        (1, exponent)
    } else if let Some(exp) = suffix.strip_prefix(|c: char| c == 'e' || c == 'E') {
        (1, exp.parse::<i32>().map_err(|_| invalid())?)
    } else {
        return Err(invalid());
    };

    let scale = exponent + 3 - frac_part.len() as i32;
    let scaled = mantissa.checked_mul(multiplier).ok_or_else(invalid)?;
    let millis = if scale >= 0 {
        10i128
            .checked_pow(scale as u32)
            .and_then(|factor| scaled.checked_mul(factor))
            .ok_or_else(invalid)?
    } else {
        match 10i128.checked_pow(scale.unsigned_abs()) {
            Some(divisor) => scaled / divisor + i128::from(scaled % divisor != 0),
            None => i128::from(scaled > 0),
        }
    };

    let millis = if negative { -millis } else { millis };
    i64::try_from(millis).map_err(|_| invalid())
}

fn usage_quantity(usage: &Value, resource: &str) -> Result<i64> {
    match usage.get(resource).and_then(Value::as_str) {
        Some(quantity) => parse_quantity_millis(quantity),
        None => Ok(0),
    }
}

pub(crate) fn parse_pod_metrics(name: &str, body: &Value) -> Result<PodMetrics> {
    let usage = body
        .pointer("/containers/0/usage")
        .ok_or_else(|| SchedError::Orchestrator(format!("metrics for {} list no containers", name)))?;

    let timestamp = body
        .get("timestamp")
        .and_then(Value::as_str)
        .ok_or_else(|| SchedError::Orchestrator(format!("metrics for {} carry no timestamp", name)))?;
    let timestamp = DateTime::parse_from_rfc3339(timestamp)
        .map_err(|e| api_error("parsing metrics timestamp", e))?
        .with_timezone(&Utc);

    let window = match body.get("window").and_then(Value::as_str) {
        Some(window) => parse_latency(window)?,
        None => std::time::Duration::ZERO,
    };

    Ok(PodMetrics {
        cpu: usage_quantity(usage, "cpu")?,
        memory: usage_quantity(usage, "memory")?,
        storage: usage_quantity(usage, "storage")?,
        storage_ephemeral: usage_quantity(usage, "ephemeral-storage")?,
        timestamp,
        window,
    })
}

#[async_trait]
impl Orchestrator for KubernetesOrchestrator {
    async fn create_pod(&self, spec: &PodSpec) -> Result<()> {
        let url = self.pods_url();
        self.client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&pod_manifest(spec))
            .send()
            .await
            .map_err(|e| api_error(&url, e))?
            .error_for_status()
            .map_err(|e| api_error(&format!("creating pod {}", spec.name), e))?;

        info!(
            "Creating pod {} on {}",
            spec.name,
            spec.node_name.as_deref().unwrap_or("a GPU node")
        );
        Ok(())
    }

    async fn pod_phase(&self, name: &str) -> Result<Option<PodPhase>> {
        let Some(pod) = self.get_json(&self.pod_url(name)).await? else {
            return Ok(None);
        };
        let phase = pod
            .pointer("/status/phase")
            .and_then(Value::as_str)
            .map(PodPhase::parse)
            .unwrap_or(PodPhase::Pending);
        debug!("Pod {} is {:?}", name, phase);
        Ok(Some(phase))
    }

    async fn set_cpu_limit(&self, name: &str, millicpu: u64) -> Result<()> {
        let url = self.pod_url(name);
        let mut pod = self
            .get_json(&url)
            .await?
            .ok_or_else(|| SchedError::Orchestrator(format!("pod {} not found", name)))?;

        let containers = pod
            .pointer_mut("/spec/containers")
            .and_then(Value::as_array_mut)
            .ok_or_else(|| SchedError::Orchestrator(format!("pod {} has no containers", name)))?;
        for container in containers.iter_mut() {
            if container.get("name").and_then(Value::as_str) == Some(name) {
                container["resources"]["limits"]["cpu"] = json!(format!("{}m", millicpu));
            }
        }

        self.client
            .put(&url)
            .bearer_auth(&self.token)
            .json(&pod)
            .send()
            .await
            .map_err(|e| api_error(&url, e))?
            .error_for_status()
            .map_err(|e| api_error(&format!("updating pod {}", name), e))?;
        Ok(())
    }

    async fn delete_pod(&self, name: &str) -> Result<()> {
        let url = self.pod_url(name);
        let response = self
            .client
            .delete(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| api_error(&url, e))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        response
            .error_for_status()
            .map_err(|e| api_error(&format!("deleting pod {}", name), e))?;
        Ok(())
    }

    async fn pod_metrics(&self, name: &str) -> Result<Option<PodMetrics>> {
        match self.get_json(&self.metrics_url(name)).await? {
            Some(body) => parse_pod_metrics(name, &body).map(Some),
            None => Ok(None),
        }
    }

    fn backend_name(&self) -> &'static str {
        "kubernetes"
    }
}
