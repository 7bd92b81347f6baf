//! Per-stage message shapes.
//!
//! Every worker exposes `POST /run_task`; what goes into the form, and what
//! the client gets back once the worker reports in, depends on the stage.

use vision_scheduler_core::{MultipartForm, Result, TaskType};

/// Worker route accepting commands
pub const RUN_ROUTE: &str = "run_task";

const FALSE: &str = "False";
const TRUE: &str = "True";

fn command(task_type: TaskType, task_id: &str) -> MultipartForm {
    MultipartForm::new()
        .text("task_name", task_type.as_str())
        .text("task_id", task_id)
}

/// Start one sub-task of `task_type` from the stage input a client submitted
pub fn run_form(task_type: TaskType, task_id: &str, input: &MultipartForm) -> Result<MultipartForm> {
    let (field, file_name) = task_type.input_file();
    let frame = input.file_part(field)?;

    let form = match task_type {
        TaskType::Det | TaskType::Slam => command(task_type, task_id)
            .file(field, file_name, frame.data.clone())
            .text("reset", FALSE),
        TaskType::Fusion => command(task_type, task_id)
            .text("detect_result", input.value("detect_result")?)
            .file(field, file_name, frame.data.clone())
            .text("reset", FALSE),
        TaskType::Mcmot => command(task_type, task_id).file(field, file_name, frame.data.clone()),
    };
    Ok(form)
}

/// Clear the session state a worker keeps for `task_id`
pub fn reset_form(task_type: TaskType, task_id: &str) -> MultipartForm {
    MultipartForm::new()
        .text("reset", TRUE)
        .text("task_name", task_type.as_str())
        .text("task_id", task_id)
}

/// Localization half of a fusion worker's job, fed with the raw frame
pub fn localization_form(task_id: &str, input: &MultipartForm) -> Result<MultipartForm> {
    let (field, file_name) = TaskType::Fusion.input_file();
    let frame = input.file_part(field)?;

    Ok(MultipartForm::new()
        .text("cmd", "slam")
        .text("task_name", TaskType::Fusion.as_str())
        .text("task_id", task_id)
        .text("reset", FALSE)
        .file(field, file_name, frame.data.clone()))
}

/// Fusion half: combine the worker's localization with a detection result
pub fn fusion_form(task_id: &str, detect_result: &str) -> MultipartForm {
    MultipartForm::new()
        .text("cmd", "fusion")
        .text("task_name", TaskType::Fusion.as_str())
        .text("task_id", task_id)
        .text("detect_result", detect_result)
        .text("reset", FALSE)
}

/// Whether a finish callback merely acknowledges a reset command
pub fn is_reset_ack(task_type: TaskType, finish: &MultipartForm) -> bool {
    match task_type.result_field() {
        Some(field) => !finish.has_field(field),
        None => false,
    }
}

/// Result form posted to the client's `/<stage>` route
pub fn client_reply(task_type: TaskType, finish: &MultipartForm) -> Result<MultipartForm> {
    match task_type {
        TaskType::Det | TaskType::Slam | TaskType::Fusion => {
            let mut reply = MultipartForm::new().text("task_id", finish.value("task_id")?);
            if let Some(field) = task_type.result_field() {
                reply.push_text(field, finish.value(field)?);
            }
            Ok(reply)
        }
        TaskType::Mcmot => {
            let mut reply = MultipartForm::new();
            for (field, file_name) in [
                ("video", "output.mp4"),
                ("bbox_txt", "output.txt"),
                ("bbox_xlsx", "output.xlsx"),
            ] {
                reply.push_file(field, file_name, finish.file_part(field)?.data.clone());
            }
            reply.push_text("container_output", finish.value("container_output")?);
            Ok(reply)
        }
    }
}
