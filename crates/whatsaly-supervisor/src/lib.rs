//! Supervision of per-session worker processes.
//!
//! [`SessionManager`] is the registry and the entry point for every lifecycle
//! operation. Each accepted start spawns a supervisor task that owns the
//! worker process, feeds its stdout through the event decoder and releases
//! the worker's process slot when the process exits.

pub mod events;
pub mod manager;
pub mod process;
pub mod reconcile;
pub mod supervisor;
pub mod teardown;
pub mod updates;
pub mod worker;

pub use events::{ingest_line, EventEffect, LineOutcome};
pub use manager::{SessionManager, SessionPerfSnapshot};
pub use process::{ExitOutcome, TerminationPolicy, WorkerCommand};
pub use reconcile::ReconcileReport;
pub use supervisor::{RestartPolicy, SupervisorSettings};
pub use updates::SessionUpdate;
pub use worker::{Worker, WorkerSnapshot};
