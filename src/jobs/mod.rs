//! Job scheduling: runnables, the managers that own them and the runner that
//! executes them.
//!
//! # Components
//!
//! - [`Runnable`]: prepare/run/cleanup contract for one unit of work
//! - [`JobManager`]: FIFO of runnables for one logical run, with an
//!   outstanding counter and a "manager complete" event
//! - [`JobRunner`]: pulls jobs from its managers and executes them on a
//!   bounded worker pool
//!
//! # Ordering
//!
//! Managers are drained in registration order without interleaving. For each
//! job the owning manager is notified first, then the runner's listeners.

pub mod events;
pub mod manager;
pub mod runnable;
pub mod runner;

pub use events::EventHandlers;
pub use manager::{JobIter, JobManager, ManagerHooks};
pub use runnable::{
    EmptyJob, JobCompletionRecord, JobError, ManagerCompletionRecord, RunCompletionRecord,
    Runnable, SharedJobError,
};
pub use runner::{JobRunner, RunningJob};
