//! Sync engine: drains the offline queue against the remote store.

mod engine;
mod events;
mod scheduler;

pub use engine::{DrainOutcome, DrainPhase, DrainReport, SubmitOutcome, SyncEngine};
pub use events::SyncEvent;
pub use scheduler::SyncScheduler;
