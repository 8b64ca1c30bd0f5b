//! Named locks whose acquire/release are journaled.
//!
//! At most one holder per name. Release happens when the [`LockGuard`]
//! drops, so a failing or cancelled task can never leave a lock behind.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use armada_state::NewEvent;
use serde_json::json;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::{JournalError, JournalResult};
use crate::events::EventJournal;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockName(String);

impl LockName {
    pub fn deployment(name: &str) -> Self {
        Self(format!("lock:deployment:{name}"))
    }

    pub fn release(name: &str) -> Self {
        Self(format!("lock:release:{name}"))
    }

    pub fn compile(job: &str, package: &str, version: &str) -> Self {
        Self(format!("lock:compile:{job}:{package}/{version}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
struct Holder {
    task: Option<u64>,
}

#[derive(Debug)]
struct Inner {
    held: Mutex<HashMap<LockName, Holder>>,
    released: Notify,
}

#[derive(Debug, Clone)]
pub struct LockManager {
    inner: Arc<Inner>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                held: Mutex::new(HashMap::new()),
                released: Notify::new(),
            }),
        }
    }

    fn held(&self) -> MutexGuard<'_, HashMap<LockName, Holder>> {
        self.inner.held.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Names currently held, with the holding task.
    pub fn holders(&self) -> Vec<(String, Option<u64>)> {
        let mut out: Vec<_> = self
            .held()
            .iter()
            .map(|(name, h)| (name.to_string(), h.task))
            .collect();
        out.sort();
        out
    }

    pub fn is_held(&self, name: &LockName) -> bool {
        self.held().contains_key(name)
    }

    fn try_take(&self, name: &LockName, task: Option<u64>) -> bool {
        let mut held = self.held();
        if held.contains_key(name) {
            return false;
        }
        held.insert(name.clone(), Holder { task });
        true
    }

    /// Take the lock without waiting.
    pub fn try_acquire(
        &self,
        name: LockName,
        journal: &EventJournal,
        deployment: Option<&str>,
    ) -> JournalResult<Option<LockGuard>> {
        if !self.try_take(&name, journal.task()) {
            return Ok(None);
        }
        self.granted(name, journal, deployment).map(Some)
    }

    /// Wait up to `timeout` for the lock.
    pub async fn acquire(
        &self,
        name: LockName,
        journal: &EventJournal,
        deployment: Option<&str>,
        timeout: Duration,
    ) -> JournalResult<LockGuard> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.inner.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.try_take(&name, journal.task()) {
                return self.granted(name, journal, deployment);
            }
            debug!(lock = %name, "waiting for lock");
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(JournalError::LockTimeout {
                    name: name.to_string(),
                    timeout,
                });
            }
        }
    }

    fn granted(
        &self,
        name: LockName,
        journal: &EventJournal,
        deployment: Option<&str>,
    ) -> JournalResult<LockGuard> {
        let acquired = journal.record(NewEvent {
            action: "acquire".to_string(),
            object_type: "lock".to_string(),
            object_name: name.to_string(),
            deployment: deployment.map(str::to_string),
            context: json!({}),
            ..Default::default()
        });
        let acquired = match acquired {
            Ok(event) => event,
            Err(e) => {
                self.release(&name);
                return Err(e);
            }
        };
        debug!(lock = %name, "lock acquired");
        Ok(LockGuard {
            manager: self.clone(),
            name,
            journal: journal.clone(),
            deployment: deployment.map(str::to_string),
            acquire_event: acquired.id,
        })
    }

    fn release(&self, name: &LockName) {
        self.held().remove(name);
        self.inner.released.notify_waiters();
    }
}

/// Held lock; dropping it releases the lock and journals the release.
#[derive(Debug)]
pub struct LockGuard {
    manager: LockManager,
    name: LockName,
    journal: EventJournal,
    deployment: Option<String>,
    acquire_event: u64,
}

impl LockGuard {
    pub fn name(&self) -> &LockName {
        &self.name
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let released = self.journal.record(NewEvent {
            parent_id: Some(self.acquire_event),
            action: "release".to_string(),
            object_type: "lock".to_string(),
            object_name: self.name.to_string(),
            deployment: self.deployment.take(),
            context: json!({}),
            ..Default::default()
        });
        if let Err(e) = released {
            warn!(lock = %self.name, error = %e, "failed to journal lock release");
        }
        self.manager.release(&self.name);
        debug!(lock = %self.name, "lock released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use armada_state::{EventFilter, StateStore};

    fn journal() -> EventJournal {
        EventJournal::new(StateStore::open_in_memory().unwrap()).for_task(1)
    }

    #[test]
    fn lock_names() {
        assert_eq!(LockName::deployment("dep").as_str(), "lock:deployment:dep");
        assert_eq!(LockName::release("r").as_str(), "lock:release:r");
        assert_eq!(
            LockName::compile("web", "nginx", "1.2").as_str(),
            "lock:compile:web:nginx/1.2"
        );
    }

    #[tokio::test]
    async fn acquire_and_release_are_journaled() {
        let journal = journal();
        let locks = LockManager::new();
        {
            let _guard = locks
                .acquire(LockName::deployment("dep"), &journal, Some("dep"), Duration::from_secs(1))
                .await
                .unwrap();
            assert!(locks.is_held(&LockName::deployment("dep")));
        }
        assert!(!locks.is_held(&LockName::deployment("dep")));

        let mut events = journal.list(&EventFilter::default()).unwrap();
        events.reverse();
        let actions: Vec<_> = events.iter().map(|e| e.action.as_str()).collect();
        assert_eq!(actions, vec!["acquire", "release"]);
        assert_eq!(events[1].parent_id, Some(events[0].id));
        assert_eq!(events[0].object_name, "lock:deployment:dep");
    }

    #[tokio::test]
    async fn second_holder_times_out() {
        let journal = journal();
        let locks = LockManager::new();
        let _held = locks
            .acquire(LockName::deployment("dep"), &journal, None, Duration::from_secs(1))
            .await
            .unwrap();
        let err = locks
            .acquire(LockName::deployment("dep"), &journal, None, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, JournalError::LockTimeout { .. }));
        assert!(
            locks
                .try_acquire(LockName::deployment("dep"), &journal, None)
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn waiter_proceeds_after_release() {
        let journal = journal();
        let locks = LockManager::new();
        let held = locks
            .acquire(LockName::release("r"), &journal, None, Duration::from_secs(1))
            .await
            .unwrap();

        let waiter = {
            let locks = locks.clone();
            let journal = journal.clone();
            tokio::spawn(async move {
                locks
                    .acquire(LockName::release("r"), &journal, None, Duration::from_secs(5))
                    .await
                    .map(|_| ())
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn distinct_names_do_not_block() {
        let journal = journal();
        let locks = LockManager::new();
        let _a = locks
            .try_acquire(LockName::compile("web", "a", "1"), &journal, None)
            .unwrap()
            .unwrap();
        let b = locks
            .try_acquire(LockName::compile("web", "b", "1"), &journal, None)
            .unwrap();
        assert!(b.is_some());
        assert_eq!(locks.holders().len(), 2);
    }
}
