// Library interface for actioncache
// Cached, sequential execution of multi-stage experiment pipelines

pub mod action;
pub mod cache;
pub mod config;
pub mod device;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod reclaim;
pub mod run_context;
pub mod tracking;

// Re-export commonly used types
pub use action::{Action, ActionHandle, ActionRegistry, RunOutcome, Session, StageContext};
pub use cache::{CacheKey, CacheLookup, CachePolicy, CacheStore, OutputValue, Outputs};
pub use config::{ActionSettings, LayeredConfig};
pub use device::{Device, DeviceBackend, HostBackend};
pub use error::ActionError;
pub use pipeline::{launch, launch_with_backend, Pipeline, PipelineReport};
pub use reclaim::{Releasable, ReclaimReport, ResourceKind, ResourceReclaimer, ResourceSet};
pub use run_context::RunContext;
pub use tracking::{MemoryTracker, NoopTracker, Tracker};
