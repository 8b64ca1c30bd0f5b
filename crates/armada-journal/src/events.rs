//! Append-only event journal with paired start/finish events.

use std::fmt::Display;

use armada_state::{EventFilter, EventRecord, NewEvent, StateStore};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::JournalResult;

/// Describes an operation about to start.
#[derive(Debug, Clone, Default)]
pub struct EventSpec {
    pub action: String,
    pub object_type: String,
    pub object_name: String,
    pub deployment: Option<String>,
    pub instance: Option<String>,
    pub context: Value,
    /// Start event of the enclosing operation.
    pub parent: Option<u64>,
}

impl EventSpec {
    pub fn new(action: &str, object_type: &str, object_name: impl Into<String>) -> Self {
        Self {
            action: action.to_string(),
            object_type: object_type.to_string(),
            object_name: object_name.into(),
            ..Default::default()
        }
    }

    pub fn deployment(mut self, deployment: impl Into<String>) -> Self {
        self.deployment = Some(deployment.into());
        self
    }

    pub fn instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    pub fn context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    pub fn parent(mut self, parent: Option<u64>) -> Self {
        self.parent = parent;
        self
    }
}

#[derive(Debug, Clone)]
pub struct EventJournal {
    store: StateStore,
    task: Option<u64>,
}

impl EventJournal {
    pub fn new(store: StateStore) -> Self {
        Self { store, task: None }
    }

    /// A journal whose events are all stamped with `task`.
    pub fn for_task(&self, task: u64) -> Self {
        Self {
            store: self.store.clone(),
            task: Some(task),
        }
    }

    pub fn task(&self) -> Option<u64> {
        self.task
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Append a single event.
    pub fn record(&self, mut event: NewEvent) -> JournalResult<EventRecord> {
        if event.task.is_none() {
            event.task = self.task;
        }
        let record = self.store.append_event(event)?;
        debug!(
            id = %record.display_id(),
            action = %record.action,
            object_type = %record.object_type,
            object_name = %record.object_name,
            "event"
        );
        Ok(record)
    }

    /// Emit the start event of an operation.
    pub fn begin(&self, spec: EventSpec) -> JournalResult<EventScope> {
        let start = self.record(NewEvent {
            parent_id: spec.parent,
            action: spec.action.clone(),
            object_type: spec.object_type.clone(),
            object_name: spec.object_name.clone(),
            task: None,
            deployment: spec.deployment.clone(),
            instance: spec.instance.clone(),
            context: spec.context.clone(),
            error: None,
        })?;
        Ok(EventScope {
            journal: self.clone(),
            spec,
            start_id: start.id,
        })
    }

    pub fn list(&self, filter: &EventFilter) -> JournalResult<Vec<EventRecord>> {
        Ok(self.store.list_events(filter)?)
    }
}

/// An operation whose start event has been written. Close it with
/// [`finish`](Self::finish), [`fail`](Self::fail) or
/// [`complete`](Self::complete); the closing event points back at the
/// start event.
#[must_use = "an event scope must be finished or failed"]
#[derive(Debug)]
pub struct EventScope {
    journal: EventJournal,
    spec: EventSpec,
    start_id: u64,
}

impl EventScope {
    pub fn id(&self) -> u64 {
        self.start_id
    }

    fn close(self, context: Option<Value>, error: Option<String>) -> JournalResult<EventRecord> {
        let context = context.unwrap_or(self.spec.context);
        self.journal.record(NewEvent {
            parent_id: Some(self.start_id),
            action: self.spec.action,
            object_type: self.spec.object_type,
            object_name: self.spec.object_name,
            task: None,
            deployment: self.spec.deployment,
            instance: self.spec.instance,
            context,
            error,
        })
    }

    pub fn finish(self) -> JournalResult<EventRecord> {
        self.close(None, None)
    }

    /// Finish with a different context (e.g. the CID that was created).
    pub fn finish_with(self, context: Value) -> JournalResult<EventRecord> {
        self.close(Some(context), None)
    }

    pub fn fail(self, error: impl Display) -> JournalResult<EventRecord> {
        self.close(None, Some(error.to_string()))
    }

    /// Close according to `result`. Journal write failures are logged
    /// rather than masking the operation's own outcome.
    pub fn complete<T, E: Display>(self, result: &Result<T, E>) {
        let closed = match result {
            Ok(_) => self.finish(),
            Err(e) => self.fail(e),
        };
        if let Err(e) = closed {
            warn!(error = %e, "failed to journal event completion");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scope_pairs_start_and_finish() {
        let journal = EventJournal::new(StateStore::open_in_memory().unwrap()).for_task(7);
        let outer = journal
            .begin(EventSpec::new("update", "deployment", "dep").deployment("dep"))
            .unwrap();
        let inner = journal
            .begin(
                EventSpec::new("create", "vm", "")
                    .deployment("dep")
                    .instance("web/uuid")
                    .parent(Some(outer.id())),
            )
            .unwrap();
        let inner_start = inner.id();
        let inner_end = inner.finish_with(json!({"cid": "vm-1"})).unwrap();
        let outer_id = outer.id();
        let outer_end = outer.fail("boom").unwrap();

        let start = journal.store().get_event(inner_start).unwrap().unwrap();
        assert_eq!(start.parent_id, Some(outer_id));
        assert_eq!(inner_end.parent_id, Some(inner_start));
        assert_eq!(inner_end.context["cid"], "vm-1");
        assert_eq!(inner_end.error, None);
        assert_eq!(outer_end.error.as_deref(), Some("boom"));
        assert_eq!(outer_end.task, Some(7));
        assert_eq!(outer_end.display_id(), format!("{} <- {}", outer_end.id, outer_id));
    }

    #[test]
    fn complete_maps_result() {
        let journal = EventJournal::new(StateStore::open_in_memory().unwrap());
        let scope = journal.begin(EventSpec::new("delete", "disk", "disk-1")).unwrap();
        scope.complete(&Err::<(), _>("disk busy"));
        let events = journal.list(&EventFilter::default()).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].error.as_deref(), Some("disk busy"));
    }
}
