use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchedError {
    #[error("Unknown task type: {0}")]
    UnknownTaskType(String),

    #[error("Unknown task status: {0}")]
    UnknownStatus(String),

    #[error("No placement configured for {task_type} on {node_key}")]
    UnknownPlacement { task_type: String, node_key: String },

    #[error("Task type {0} has no worker pool")]
    EmptyPool(String),

    #[error("Worker bound to task id {0} does not exist")]
    UnknownTaskId(String),

    #[error("Worker {0} is occupied and cannot be deleted")]
    WorkerOccupied(String),

    #[error("No pending completion registered for task id {0}")]
    NoPendingCompletion(String),

    #[error("Completion for task id {0} was abandoned before delivery")]
    CompletionDropped(String),

    #[error("Completion for task id {task_id} did not arrive within {waited_ms}ms")]
    CompletionTimeout { task_id: String, waited_ms: u64 },

    #[error("Expected exactly one value for form field {field}, got {actual}")]
    FormField { field: String, actual: usize },

    #[error("Missing form file {0}")]
    MissingFile(String),

    #[error("Invalid latency {value:?}: {reason}")]
    InvalidLatency { value: String, reason: String },

    #[error("Invalid quantity {value:?}")]
    InvalidQuantity { value: String },

    #[error("Orchestrator error: {0}")]
    Orchestrator(String),

    #[error("Pod {pod} did not reach {target} within {waited_secs}s")]
    ProvisionTimeout {
        pod: String,
        target: &'static str,
        waited_secs: u64,
    },

    #[error("No {task_type} worker freed up on {node_name} in time")]
    OccupyTimeout { task_type: String, node_name: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, SchedError>;
