//! Resource reclamation between pipeline stages
//!
//! Long pipelines load several models and datasets one after another. Once a
//! stage is done, whatever it still holds is released before the next stage
//! starts:
//!
//! 1. the action's own `cleanup` hook runs
//! 2. every resource the action declared in its `ResourceSet` is offloaded
//!    from the accelerator and dropped, in `ResourceKind::ALL` order
//! 3. the device backend purges its allocator cache and synchronizes
//!
//! Every step is best-effort. Failures are logged and collected in the
//! report; reclamation always finishes the full sweep.

use anyhow::Result;
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;
use sysinfo::System;
use tracing::{debug, info, warn};

use crate::action::Action;
use crate::device::{DeviceBackend, HostBackend};
use crate::logging::{operations, status};

/// A large object owned by an action that the framework may release
pub trait Releasable: Send + 'static {
    /// Move the object off any accelerator before it is dropped
    fn offload(&mut self) -> Result<()> {
        Ok(())
    }

    /// Rough size in bytes, for diagnostics only
    fn approx_bytes(&self) -> Option<u64> {
        None
    }
}

trait AnyReleasable: Releasable {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Releasable> AnyReleasable for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Roles a large resource can play in an action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Model,
    Tokenizer,
    Dataset,
    RawDataset,
    TrainDataset,
    TestDataset,
    DataLoader,
    TrainDataLoader,
    TestDataLoader,
    Optimizer,
    Scheduler,
    Criterion,
    Embeddings,
    Features,
    Predictions,
    Logits,
    Cache,
}

impl ResourceKind {
    /// Sweep order
    pub const ALL: [ResourceKind; 17] = [
        Self::Model,
        Self::Tokenizer,
        Self::Dataset,
        Self::RawDataset,
        Self::TrainDataset,
        Self::TestDataset,
        Self::DataLoader,
        Self::TrainDataLoader,
        Self::TestDataLoader,
        Self::Optimizer,
        Self::Scheduler,
        Self::Criterion,
        Self::Embeddings,
        Self::Features,
        Self::Predictions,
        Self::Logits,
        Self::Cache,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Model => "model",
            Self::Tokenizer => "tokenizer",
            Self::Dataset => "dataset",
            Self::RawDataset => "raw_dataset",
            Self::TrainDataset => "train_dataset",
            Self::TestDataset => "test_dataset",
            Self::DataLoader => "dataloader",
            Self::TrainDataLoader => "train_dataloader",
            Self::TestDataLoader => "test_dataloader",
            Self::Optimizer => "optimizer",
            Self::Scheduler => "scheduler",
            Self::Criterion => "criterion",
            Self::Embeddings => "embeddings",
            Self::Features => "features",
            Self::Predictions => "predictions",
            Self::Logits => "logits",
            Self::Cache => "cache",
        }
    }
}

/// Large resources held by one action, released as a unit between stages
#[derive(Default)]
pub struct ResourceSet {
    slots: BTreeMap<ResourceKind, Box<dyn AnyReleasable>>,
}

impl ResourceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold `resource` under `kind`, returning whether a previous one was replaced
    pub fn insert<T: Releasable>(&mut self, kind: ResourceKind, resource: T) -> bool {
        self.slots.insert(kind, Box::new(resource)).is_some()
    }

    /// Borrow the resource under `kind` if it is held and has type `T`
    pub fn get<T: Releasable>(&self, kind: ResourceKind) -> Option<&T> {
        self.slots
            .get(&kind)
            .and_then(|slot| slot.as_any().downcast_ref::<T>())
    }

    pub fn get_mut<T: Releasable>(&mut self, kind: ResourceKind) -> Option<&mut T> {
        self.slots
            .get_mut(&kind)
            .and_then(|slot| slot.as_any_mut().downcast_mut::<T>())
    }

    pub fn is_held(&self, kind: ResourceKind) -> bool {
        self.slots.contains_key(&kind)
    }

    /// Kinds currently held, in sweep order
    pub fn held(&self) -> Vec<ResourceKind> {
        self.slots.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Release everything: offload each resource, then drop it
    fn sweep(&mut self, report: &mut ReclaimReport) {
        for kind in ResourceKind::ALL {
            let Some(mut resource) = self.slots.remove(&kind) else {
                continue;
            };

            if let Some(bytes) = resource.approx_bytes() {
                report.released_bytes += bytes;
            }
            if let Err(e) = resource.offload() {
                warn!(
                    action = %report.action,
                    operation = operations::RECLAIM,
                    status = status::ERROR,
                    "Failed to offload {}: {:#}",
                    kind.as_str(),
                    e
                );
                report
                    .failures
                    .push(format!("offload {}: {:#}", kind.as_str(), e));
            }

            drop(resource);
            report.released.push(kind);
        }
    }
}

impl std::fmt::Debug for ResourceSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceSet")
            .field("held", &self.held())
            .finish()
    }
}

/// What one reclamation pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    pub action: String,
    pub released: Vec<ResourceKind>,
    pub released_bytes: u64,
    pub failures: Vec<String>,
    pub rss_before: Option<u64>,
    pub rss_after: Option<u64>,
    pub device_before: Option<u64>,
    pub device_after: Option<u64>,
}

impl ReclaimReport {
    /// Host memory given back, when both measurements are available
    pub fn rss_freed(&self) -> Option<u64> {
        Some(self.rss_before?.saturating_sub(self.rss_after?))
    }

    pub fn device_freed(&self) -> Option<u64> {
        Some(self.device_before?.saturating_sub(self.device_after?))
    }
}

/// Releases what finished actions hold
#[derive(Clone)]
pub struct ResourceReclaimer {
    backend: Arc<dyn DeviceBackend>,
}

impl ResourceReclaimer {
    pub fn new(backend: Arc<dyn DeviceBackend>) -> Self {
        Self { backend }
    }

    /// Reclaimer for hosts without an accelerator runtime
    pub fn host() -> Self {
        Self::new(Arc::new(HostBackend))
    }

    pub fn backend(&self) -> &Arc<dyn DeviceBackend> {
        &self.backend
    }

    /// Release everything `action` holds; safe to call repeatedly
    pub fn reclaim(&self, action: &mut dyn Action) -> ReclaimReport {
        let mut report = ReclaimReport {
            action: action.name().to_string(),
            rss_before: process_rss(),
            device_before: self.backend.allocated_bytes(),
            ..ReclaimReport::default()
        };

        debug!(
            action = %report.action,
            operation = operations::RECLAIM,
            "Starting memory cleanup for {}",
            report.action
        );

        if let Err(e) = action.cleanup() {
            warn!(
                action = %report.action,
                operation = operations::RECLAIM,
                status = status::ERROR,
                "Error during action-specific cleanup: {:#}",
                e
            );
            report.failures.push(format!("cleanup: {:#}", e));
        }

        if let Some(resources) = action.resources() {
            resources.sweep(&mut report);
        }
        if !report.released.is_empty() {
            let names: Vec<&str> = report.released.iter().map(|k| k.as_str()).collect();
            info!(
                action = %report.action,
                operation = operations::RECLAIM,
                "Released resources: {}",
                names.join(", ")
            );
        }

        if let Err(e) = self.backend.empty_cache() {
            warn!("Failed to clear {} device cache: {:#}", self.backend.name(), e);
            report.failures.push(format!("empty_cache: {:#}", e));
        }
        if let Err(e) = self.backend.synchronize() {
            warn!("Failed to synchronize {} device: {:#}", self.backend.name(), e);
            report.failures.push(format!("synchronize: {:#}", e));
        }

        report.rss_after = process_rss();
        report.device_after = self.backend.allocated_bytes();

        if let Some(freed) = report.device_freed().filter(|b| *b > 0) {
            info!("Freed {:.1} MB of device memory", freed as f64 / (1024.0 * 1024.0));
        }
        if let Some(freed) = report.rss_freed().filter(|b| *b > 100 * 1024 * 1024) {
            info!("Freed {:.2} GB of RAM", freed as f64 / (1024.0 * 1024.0 * 1024.0));
        }

        info!(
            action = %report.action,
            operation = operations::RECLAIM,
            status = status::SUCCESS,
            "Memory cleanup completed for {}",
            report.action
        );

        report
    }
}

impl Default for ResourceReclaimer {
    fn default() -> Self {
        Self::host()
    }
}

impl std::fmt::Debug for ResourceReclaimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceReclaimer")
            .field("backend", &self.backend.name())
            .finish()
    }
}

/// Resident set size of this process in bytes
fn process_rss() -> Option<u64> {
    let pid = sysinfo::get_current_pid().ok()?;
    let mut system = System::new();
    if !system.refresh_process(pid) {
        return None;
    }
    system.process(pid).map(|process| process.memory())
}
