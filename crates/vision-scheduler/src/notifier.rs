use dashmap::DashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use vision_scheduler_core::{MultipartForm, Result, SchedError, TaskId};

type PendingTable = DashMap<TaskId, oneshot::Sender<MultipartForm>>;

/// Correlation table from task id to the flow waiting for that task's callback.
///
/// A wait must be registered before the work that triggers the callback is
/// dispatched. Delivery hands the form over through a one-slot channel, so a
/// callback that arrives before the waiter starts waiting is kept, not lost.
#[derive(Default)]
pub struct CompletionNotifier {
    pending: Arc<PendingTable>,
}

/// Receiving end of one registered wait.
///
/// Dropping it without a delivery withdraws the wait from the table.
#[derive(Debug)]
pub struct CompletionHandle {
    task_id: TaskId,
    receiver: oneshot::Receiver<MultipartForm>,
    pending: Weak<PendingTable>,
}

impl CompletionHandle {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Block until the callback for this task id is delivered
    pub async fn wait(mut self) -> Result<MultipartForm> {
        (&mut self.receiver)
            .await
            .map_err(|_| SchedError::CompletionDropped(self.task_id.clone()))
    }

    /// [`CompletionHandle::wait`] with a deadline; a wait that times out is withdrawn
    pub async fn wait_timeout(self, timeout: Duration) -> Result<MultipartForm> {
        let task_id = self.task_id.clone();
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| SchedError::CompletionTimeout {
                task_id,
                waited_ms: timeout.as_millis() as u64,
            })?
    }
}

impl Drop for CompletionHandle {
    fn drop(&mut self) {
        self.receiver.close();
        let Some(pending) = self.pending.upgrade() else {
            return;
        };
        // A newer registration under the same id still has an open channel
        if pending
            .remove_if(&self.task_id, |_, sender| sender.is_closed())
            .is_some()
        {
            debug!("Withdrew abandoned completion wait for task {}", self.task_id);
        }
    }
}

impl CompletionNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a wait for `task_id`, replacing any earlier unconsumed one
    pub fn register_wait(&self, task_id: &str) -> CompletionHandle {
        let (sender, receiver) = oneshot::channel();
        if self.pending.insert(task_id.to_string(), sender).is_some() {
            warn!("Replaced an unconsumed completion wait for task {}", task_id);
        }
        debug!("Registered completion wait for task {}", task_id);

        CompletionHandle {
            task_id: task_id.to_string(),
            receiver,
            pending: Arc::downgrade(&self.pending),
        }
    }

    /// Hand a callback form to the flow waiting on `task_id`.
    ///
    /// The entry is consumed; a second delivery for the same id fails with
    /// [`SchedError::NoPendingCompletion`].
    pub fn deliver(&self, task_id: &str, form: MultipartForm) -> Result<()> {
        let (_, sender) = self
            .pending
            .remove(task_id)
            .ok_or_else(|| SchedError::NoPendingCompletion(task_id.to_string()))?;

        sender
            .send(form)
            .map_err(|_| SchedError::CompletionDropped(task_id.to_string()))?;
        debug!("Delivered completion for task {}", task_id);
        Ok(())
    }

    /// Drop the wait for `task_id` if its dispatch never happened
    pub fn cancel(&self, task_id: &str) -> bool {
        self.pending.remove(task_id).is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
