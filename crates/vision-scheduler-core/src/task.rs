use crate::SchedError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Correlation id tying a dispatched sub-task to its completion callback
pub type TaskId = String;

/// Pipeline stage a worker is dedicated to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    /// Object detection on single frames
    Det,
    /// Localization followed by fusion with a detection result
    Fusion,
    /// Localization (SLAM) on single frames
    Slam,
    /// Multi-camera multi-object tracking on a whole video
    Mcmot,
}

impl TaskType {
    pub const ALL: [TaskType; 4] = [TaskType::Det, TaskType::Fusion, TaskType::Slam, TaskType::Mcmot];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Det => "det",
            TaskType::Fusion => "fusion",
            TaskType::Slam => "slam",
            TaskType::Mcmot => "mcmot",
        }
    }

    /// Route the worker calls back on once a sub-task is done
    pub fn finish_route(&self) -> &'static str {
        match self {
            TaskType::Det => "det_finish",
            TaskType::Fusion => "fusion_finish",
            TaskType::Slam => "slam_finish",
            TaskType::Mcmot => "mcmot_finish",
        }
    }

    /// Field carrying the stage result in a finish callback.
    ///
    /// Callbacks without it acknowledge a reset command. mcmot has no reset
    /// cycle, so every callback it sends is a result.
    pub fn result_field(&self) -> Option<&'static str> {
        match self {
            TaskType::Det => Some("det_result"),
            TaskType::Fusion => Some("fusion_result"),
            TaskType::Slam => Some("slam_result"),
            TaskType::Mcmot => None,
        }
    }

    /// Form file the stage consumes, with the file name workers expect
    pub fn input_file(&self) -> (&'static str, &'static str) {
        match self {
            TaskType::Mcmot => ("video", "input.avi"),
            _ => ("frame", "input.png"),
        }
    }

    /// Whether the worker keeps per-session state that must be reset before reuse
    pub fn is_session_stateful(&self) -> bool {
        !matches!(self, TaskType::Mcmot)
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = SchedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "det" => Ok(TaskType::Det),
            "fusion" => Ok(TaskType::Fusion),
            "slam" => Ok(TaskType::Slam),
            "mcmot" => Ok(TaskType::Mcmot),
            other => Err(SchedError::UnknownTaskType(other.to_string())),
        }
    }
}

/// Phase of a streamed client request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    /// First chunk: allocate fresh workers and task ids
    Begin,
    /// Intermediate chunk: workers are already bound
    Running,
    /// Final chunk: reset and release workers once it is processed
    Last,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Begin => "Begin",
            TaskStatus::Running => "Running",
            TaskStatus::Last => "Last",
        }
    }

    pub fn ends_session(&self) -> bool {
        *self == TaskStatus::Last
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = SchedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Begin" => Ok(TaskStatus::Begin),
            "Running" => Ok(TaskStatus::Running),
            "Last" => Ok(TaskStatus::Last),
            other => Err(SchedError::UnknownStatus(other.to_string())),
        }
    }
}
