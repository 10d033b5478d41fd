//! Session connection management: state tracking, polling and lifecycle
//! intents for one gateway session per tenant.

mod busy;
mod events;
mod handle;
mod orchestrator;
mod polling;
mod registry;
mod tracker;

#[cfg(test)]
mod testing;

pub use busy::{BusyGuard, BusySlot, Occupant};
pub use events::EventSink;
pub use handle::{HandleError, SessionHandle, TenantIdentity};
pub use orchestrator::{ConnectOutcome, OrchestratorConfig, SessionError, SessionOrchestrator};
pub use polling::{CycleOutcome, PollingConfig, PollingEngine, StartResult, TickAction, decide};
pub use registry::{RegistryError, SessionRegistry};
pub use tracker::{SessionTracker, StatusSnapshot};
