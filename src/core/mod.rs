pub mod audit;
pub mod clock;
pub mod error;
pub mod executor;
pub mod guards;
pub mod handlers;
pub mod lock;
pub mod models;
pub mod notifications;
pub mod orchestrator;
pub mod repository;
pub mod snapshot;
pub mod staging;
pub mod state_machine;
pub mod store;
pub mod transport;

pub use clock::{Clock, FixedClock, SystemClock};
pub use error::OrchestratorError;
pub use executor::{CommandExecutor, CommandOutput, CommandRequest, ScriptedExecutor, ShellExecutor};
pub use lock::{Lock, LockManager};
pub use models::{
    Host, Job, JobState, JobTemplate, LogEntry, LogLevel, Periodicity, Repository, RepositoryKind,
    RetentionPolicy, SourceType, TransferMetrics,
};
pub use orchestrator::{Orchestrator, Resolution, RunSummary};
pub use state_machine::{JobContext, StateMachine, Transition};
pub use store::JobStore;
