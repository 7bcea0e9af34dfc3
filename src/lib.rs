pub mod config;
pub mod error;
pub mod event_bus;
pub mod lifecycle;
pub mod orchestrator;
pub mod summary;

pub use config::ForemanConfig;
pub use error::{ForemanError, Result};
pub use event_bus::{Event, EventBus, EventKind, EventStream};
pub use lifecycle::Lifecycle;
pub use orchestrator::manager::RunManager;
pub use orchestrator::planner::{AdapterHealth, Plan, Planner, TaskSpec, Verdict};
pub use orchestrator::store::RunStore;
pub use orchestrator::types::*;
pub use orchestrator::worker::{WorkerAgent, WorkerDone, WorkerSpec};
