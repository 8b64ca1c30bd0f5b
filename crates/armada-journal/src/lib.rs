//! armada-journal: the director's event and lock journal.
//!
//! Every mutating operation is bracketed by a start event and a finish
//! (or failure) event whose parent is the start event. Locks are named
//! (`lock:deployment:<name>`, `lock:release:<name>`,
//! `lock:compile:<job>:<pkg>/<ver>`) and their acquire/release are
//! journaled like any other action.

pub mod error;
pub mod events;
pub mod locks;

pub use error::{JournalError, JournalResult};
pub use events::{EventJournal, EventScope, EventSpec};
pub use locks::{LockGuard, LockManager, LockName};
