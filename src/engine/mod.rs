//! Queue engine: the processor loop, item processors, conflict checks and
//! resumable job state.

pub mod conflict;
pub mod control;
pub mod processor;
pub mod state;
pub mod tier_migrate;

pub use control::{ProcessorRegistry, WorkQueueProcessor};
pub use processor::{ItemProcessor, Outcome, ProcessContext, process_entry};
pub use state::JobState;
pub use tier_migrate::{ProgressTracker, TierMigrateProcessor};
