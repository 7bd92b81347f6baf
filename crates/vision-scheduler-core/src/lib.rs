mod error;
mod form;
mod id;
mod latency;
mod task;
mod usage;

pub use error::{Result, SchedError};
pub use form::{FilePart, MultipartForm};
pub use id::IdGenerator;
pub use latency::{format_latency, parse_latency};
pub use task::{TaskId, TaskStatus, TaskType};
pub use usage::{ResourceUsage, POD_NOT_FOUND, TASK_ENDED};
