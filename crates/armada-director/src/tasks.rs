//! Task runner.
//!
//! Every mutating operator request runs as a task with a monotonic id.
//! At most `tasks.max_concurrent` tasks are processing at once; the rest
//! wait queued. Cancellation is cooperative: the work checks its
//! [`Cancellation`] between instance operations, so a cancelled task
//! always unwinds through its lock guards.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use armada_state::{StateStore, TaskRecord, TaskState, now_epoch};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::{DirectorError, DirectorResult};

/// Cooperative cancellation signal handed to task work.
#[derive(Debug, Clone)]
pub struct Cancellation {
    rx: watch::Receiver<bool>,
}

impl Cancellation {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    pub fn check(&self) -> DirectorResult<()> {
        if self.is_cancelled() {
            Err(DirectorError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&mut self) {
        // An error means the sender is gone: nobody can cancel any more.
        if self.rx.wait_for(|c| *c).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// What a running task's work receives.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub id: u64,
    pub cancel: Cancellation,
}

/// A submitted task.
#[derive(Debug)]
pub struct TaskHandle {
    pub id: u64,
    join: JoinHandle<TaskRecord>,
}

impl TaskHandle {
    /// Wait for the task to finish and return its final record.
    pub async fn wait(self) -> DirectorResult<TaskRecord> {
        self.join
            .await
            .map_err(|e| DirectorError::Conflict(format!("task {} aborted: {e}", self.id)))
    }
}

#[derive(Debug, Clone)]
pub struct TaskRunner {
    store: StateStore,
    limit: Arc<Semaphore>,
    cancels: Arc<Mutex<HashMap<u64, watch::Sender<bool>>>>,
}

impl TaskRunner {
    pub fn new(store: StateStore, max_concurrent: usize) -> Self {
        Self {
            store,
            limit: Arc::new(Semaphore::new(max_concurrent.max(1))),
            cancels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn cancels(&self) -> MutexGuard<'_, HashMap<u64, watch::Sender<bool>>> {
        self.cancels.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue `work` as a new task. The returned string becomes the task
    /// result; an error marks the task failed with its message.
    pub fn submit<F, Fut>(
        &self,
        description: &str,
        deployment: Option<&str>,
        work: F,
    ) -> DirectorResult<TaskHandle>
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = DirectorResult<String>> + Send + 'static,
    {
        let record = self.store.create_task(description, deployment)?;
        let id = record.id;
        let (tx, rx) = watch::channel(false);
        self.cancels().insert(id, tx);
        info!(task = id, description, deployment = ?deployment, "task queued");

        let runner = self.clone();
        let join = tokio::spawn(async move {
            let cancel = Cancellation { rx };
            let record = runner.run(record, cancel, work).await;
            runner.cancels().remove(&record.id);
            record
        });
        Ok(TaskHandle { id, join })
    }

    async fn run<F, Fut>(&self, mut record: TaskRecord, cancel: Cancellation, work: F) -> TaskRecord
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = DirectorResult<String>> + Send + 'static,
    {
        let mut waiting = cancel.clone();
        let permit = tokio::select! {
            permit = self.limit.clone().acquire_owned() => permit.ok(),
            _ = waiting.cancelled() => None,
        };
        let Some(_permit) = permit else {
            return self.finish(record, TaskState::Cancelled, Some("cancelled while queued".into()));
        };

        record.state = TaskState::Processing;
        record.started_at = Some(now_epoch());
        self.save(&record);
        debug!(task = record.id, "task processing");

        let outcome = work(TaskContext {
            id: record.id,
            cancel: cancel.clone(),
        })
        .await;
        match outcome {
            Ok(result) => self.finish(record, TaskState::Done, Some(result)),
            Err(DirectorError::Cancelled) => self.finish(record, TaskState::Cancelled, Some("cancelled".into())),
            Err(e) => {
                error!(task = record.id, error = %e, "task failed");
                self.finish(record, TaskState::Error, Some(e.to_string()))
            }
        }
    }

    fn finish(&self, mut record: TaskRecord, state: TaskState, result: Option<String>) -> TaskRecord {
        record.state = state;
        record.result = result;
        record.finished_at = Some(now_epoch());
        self.save(&record);
        info!(task = record.id, state = ?state, "task finished");
        record
    }

    fn save(&self, record: &TaskRecord) {
        if let Err(e) = self.store.put_task(record) {
            error!(task = record.id, error = %e, "failed to persist task state");
        }
    }

    /// Request cancellation of a queued or processing task.
    ///
    /// The state check and the `cancelling` write share one store
    /// transaction, so a task finishing concurrently keeps its final state.
    pub fn cancel(&self, id: u64) -> DirectorResult<TaskRecord> {
        let record = self
            .store
            .update_task(id, |record| {
                if record.state != TaskState::Processing {
                    return false;
                }
                record.state = TaskState::Cancelling;
                true
            })?
            .ok_or_else(|| DirectorError::not_found("task", id.to_string()))?;
        if record.state.is_finished() {
            return Err(DirectorError::Conflict(format!(
                "task {id} already finished ({:?})",
                record.state
            )));
        }
        if let Some(tx) = self.cancels().get(&id) {
            tx.send_replace(true);
        }
        info!(task = id, "task cancellation requested");
        Ok(record)
    }

    pub fn get(&self, id: u64) -> DirectorResult<TaskRecord> {
        self.store
            .get_task(id)?
            .ok_or_else(|| DirectorError::not_found("task", id.to_string()))
    }

    pub fn list(&self, limit: Option<usize>) -> DirectorResult<Vec<TaskRecord>> {
        Ok(self.store.list_tasks(limit)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn runner(max: usize) -> TaskRunner {
        TaskRunner::new(StateStore::open_in_memory().unwrap(), max)
    }

    #[tokio::test]
    async fn successful_and_failed_tasks_record_results() {
        let runner = runner(2);
        let ok = runner
            .submit("deploy", Some("simple"), |_| async { Ok("deployed".to_string()) })
            .unwrap();
        let bad = runner
            .submit("deploy", Some("simple"), |_| async {
                Err(DirectorError::Validation("bad manifest".into()))
            })
            .unwrap();
        assert!(bad.id > ok.id);

        let ok = ok.wait().await.unwrap();
        assert_eq!(ok.state, TaskState::Done);
        assert_eq!(ok.result.as_deref(), Some("deployed"));
        let bad = bad.wait().await.unwrap();
        assert_eq!(bad.state, TaskState::Error);
        assert!(bad.result.unwrap().contains("bad manifest"));
        assert_eq!(runner.list(None).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn cancellation_reaches_running_work() {
        let runner = runner(1);
        let handle = runner
            .submit("recreate", None, |ctx| async move {
                for _ in 0..200 {
                    ctx.cancel.check()?;
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                Ok("finished".to_string())
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        runner.cancel(handle.id).unwrap();
        let record = handle.wait().await.unwrap();
        assert_eq!(record.state, TaskState::Cancelled);
        assert!(runner.cancel(record.id).is_err());
    }

    #[tokio::test]
    async fn cancelling_a_task_that_just_finished_keeps_its_result() {
        let runner = runner(1);
        let handle = runner
            .submit("deploy", None, |_| async { Ok("deployed".to_string()) })
            .unwrap();
        let id = handle.id;
        let done = handle.wait().await.unwrap();
        assert_eq!(done.state, TaskState::Done);

        // A stale processing record must not resurrect the task.
        let err = runner.cancel(id).unwrap_err();
        assert!(matches!(err, DirectorError::Conflict(_)));
        let stored = runner.get(id).unwrap();
        assert_eq!(stored.state, TaskState::Done);
        assert_eq!(stored.result.as_deref(), Some("deployed"));
    }

    #[tokio::test]
    async fn cancel_marks_processing_tasks_cancelling() {
        let runner = runner(1);
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let handle = runner
            .submit("recreate", None, |ctx| async move {
                let _ = started_tx.send(());
                let mut cancel = ctx.cancel.clone();
                cancel.cancelled().await;
                Err(DirectorError::Cancelled)
            })
            .unwrap();
        started_rx.await.unwrap();
        let requested = runner.cancel(handle.id).unwrap();
        assert_eq!(requested.state, TaskState::Cancelling);
        let record = handle.wait().await.unwrap();
        assert_eq!(record.state, TaskState::Cancelled);
    }

    #[tokio::test]
    async fn concurrency_is_bounded_and_queued_tasks_can_be_cancelled() {
        let runner = runner(1);
        let (release, gate) = watch::channel(false);
        let first = runner
            .submit("first", None, move |_| {
                let mut gate = gate.clone();
                async move {
                    let _ = gate.wait_for(|open| *open).await;
                    Ok("first".to_string())
                }
            })
            .unwrap();
        let second = runner.submit("second", None, |_| async { Ok("second".to_string()) }).unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(runner.get(second.id).unwrap().state, TaskState::Queued);
        runner.cancel(second.id).unwrap();
        assert_eq!(second.wait().await.unwrap().state, TaskState::Cancelled);

        release.send_replace(true);
        assert_eq!(first.wait().await.unwrap().state, TaskState::Done);
    }
}
