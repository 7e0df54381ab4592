//! Actions and cached execution
//!
//! An `Action` is one unit of work. The framework never calls `run` directly;
//! it wraps each action in an `ActionHandle`, which owns the scope, the cache
//! policy and the derived key, and exposes `run_with_cache` as the single
//! entry point:
//!
//! ```text
//! constructed -> cache check -> hit:  outputs loaded
//!                            -> miss: run -> completed -> outputs saved
//! ```

use anyhow::Result;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use crate::cache::{CacheKey, CachePolicy, CacheStore, Outputs};
use crate::config::{ActionSettings, LayeredConfig, ResolvedScope, ScopeSource, CACHE_CONTROL_KEYS};
use crate::device::{Device, DeviceBackend, HostBackend};
use crate::error::ActionError;
use crate::logging::{operations, status};
use crate::reclaim::{ReclaimReport, ResourceReclaimer, ResourceSet};
use crate::run_context::{RunContext, RUN_DIR_KEY};
use crate::tracking::{cache_hit_key, NoopTracker, Tracker};

/// A unit of work in a pipeline
pub trait Action: Send {
    /// Implementation identity; part of the cache key, so keep it stable
    fn name(&self) -> &str;

    /// Do the work and keep the results as instance state
    fn run(&mut self, ctx: &StageContext<'_>) -> Result<()>;

    /// Named results of the last `run`; empty results are not cached
    fn outputs(&self) -> Outputs {
        Outputs::new()
    }

    /// Release bespoke resources that are not in the `ResourceSet`
    fn cleanup(&mut self) -> Result<()> {
        Ok(())
    }

    /// Large resources the reclaimer may release after the stage
    fn resources(&mut self) -> Option<&mut ResourceSet> {
        None
    }
}

/// What a running action gets to see
#[derive(Debug, Clone, Copy)]
pub struct StageContext<'a> {
    /// The action's own configuration scope
    pub config: &'a Value,
    pub device: Device,
    pub run: &'a RunContext,
    /// Outputs of the stages that ran before, keyed by action name
    pub upstream: &'a BTreeMap<String, Outputs>,
}

impl StageContext<'_> {
    /// Outputs published by an earlier stage
    pub fn upstream_outputs(&self, action_name: &str) -> Option<&Outputs> {
        self.upstream.get(action_name)
    }
}

/// Collaborators shared by every action of a run
#[derive(Clone)]
pub struct Session {
    pub run: RunContext,
    pub tracker: Arc<dyn Tracker>,
    pub backend: Arc<dyn DeviceBackend>,
}

impl Session {
    pub fn new(run: RunContext) -> Self {
        Self {
            run,
            tracker: Arc::new(NoopTracker),
            backend: Arc::new(HostBackend),
        }
    }

    pub fn with_tracker(mut self, tracker: Arc<dyn Tracker>) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn with_backend(mut self, backend: Arc<dyn DeviceBackend>) -> Self {
        self.backend = backend;
        self
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("run", &self.run)
            .field("backend", &self.backend.name())
            .finish()
    }
}

type ActionFactory = Box<dyn Fn(&Value) -> Result<Box<dyn Action>> + Send + Sync>;

/// Maps action names to constructors
#[derive(Default)]
pub struct ActionRegistry {
    factories: BTreeMap<String, ActionFactory>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor; it receives the action's configuration scope
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&Value) -> Result<Box<dyn Action>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Construct the action registered under `name`
    pub fn create(&self, name: &str, scope: &Value) -> Result<Box<dyn Action>, ActionError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| ActionError::UnknownAction(name.to_string()))?;

        factory(scope).map_err(|source| ActionError::Construction {
            action: name.to_string(),
            source,
        })
    }
}

impl fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &self.names())
            .finish()
    }
}

/// How `run_with_cache` obtained the outputs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    CacheHit,
    Computed,
}

/// An action instance bound to its configuration and the run's cache
pub struct ActionHandle {
    action: Box<dyn Action>,
    scope: ResolvedScope,
    settings: ActionSettings,
    policy: CachePolicy,
    device: Device,
    key: CacheKey,
    store: CacheStore,
    run: RunContext,
    tracker: Arc<dyn Tracker>,
    outputs: Option<Outputs>,
}

impl ActionHandle {
    /// Bind `action` to `config`, which must already be resolved
    pub fn new(action: Box<dyn Action>, config: &LayeredConfig, session: &Session) -> Self {
        let scope = config.scope();
        let settings = ActionSettings::from_scope(&scope.config);
        let policy = CachePolicy::from(&settings);
        let device = Device::parse(&settings.device).resolve(session.backend.as_ref());
        let key = CacheKey::derive(action.name(), &key_material(&scope.config));

        debug!(
            action = action.name(),
            cache_key = %key,
            "Resolved {:?} scope, device {}",
            scope.source,
            device
        );

        Self {
            action,
            scope,
            settings,
            policy,
            device,
            key,
            store: CacheStore::for_run(&session.run),
            run: session.run.clone(),
            tracker: Arc::clone(&session.tracker),
            outputs: None,
        }
    }

    /// Construct the action by name from `registry` and bind it
    pub fn from_registry(
        registry: &ActionRegistry,
        name: &str,
        config: &LayeredConfig,
        session: &Session,
    ) -> Result<Self, ActionError> {
        let action = registry.create(name, &config.scope().config)?;
        Ok(Self::new(action, config, session))
    }

    /// Load outputs from the cache, or run the action and cache what it returns
    pub fn run_with_cache(
        &mut self,
        upstream: &BTreeMap<String, Outputs>,
    ) -> Result<RunOutcome, ActionError> {
        let name = self.action.name().to_string();

        if let Some(outputs) = self.store.load(&self.key, &self.policy).into_outputs() {
            self.tracker.set(&cache_hit_key(&name), json!(true));
            self.outputs = Some(outputs);
            return Ok(RunOutcome::CacheHit);
        }

        self.tracker.set(&cache_hit_key(&name), json!(false));
        info!(
            action = %name,
            operation = operations::RUN,
            status = status::MISS,
            "Running {} (cache miss)",
            name
        );

        let ctx = StageContext {
            config: &self.scope.config,
            device: self.device,
            run: &self.run,
            upstream,
        };
        self.action
            .run(&ctx)
            .map_err(|source| ActionError::Execution {
                action: name.clone(),
                source,
            })?;

        let outputs = self.action.outputs();
        if !outputs.is_empty() && self.policy.enabled {
            self.store.save(&self.key, &outputs);
        }
        self.outputs = Some(outputs);

        Ok(RunOutcome::Computed)
    }

    /// Outputs loaded from the cache or produced by the last run
    pub fn outputs(&self) -> Outputs {
        match &self.outputs {
            Some(outputs) => outputs.clone(),
            None => self.action.outputs(),
        }
    }

    pub fn name(&self) -> &str {
        self.action.name()
    }

    pub fn cache_key(&self) -> &CacheKey {
        &self.key
    }

    pub fn settings(&self) -> &ActionSettings {
        &self.settings
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    pub fn scope_source(&self) -> ScopeSource {
        self.scope.source
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    /// Remove this invocation's cache entry
    pub fn clear_cache(&self) -> Result<bool> {
        self.store.invalidate(&self.key)
    }

    /// Release what the action holds before the next stage
    pub fn reclaim(&mut self, reclaimer: &ResourceReclaimer) -> ReclaimReport {
        reclaimer.reclaim(self.action.as_mut())
    }
}

impl fmt::Debug for ActionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionHandle")
            .field("action", &self.action.name())
            .field("key", &self.key.to_string())
            .field("source", &self.scope.source)
            .field("policy", &self.policy)
            .finish()
    }
}

/// Scope without the keys that only steer caching or locate the run.
/// Toggling `force_rerun` or starting a new run must not change the key.
fn key_material(scope: &Value) -> Value {
    match scope {
        Value::Object(map) => {
            let mut map = map.clone();
            for key in CACHE_CONTROL_KEYS.iter().chain(std::iter::once(&RUN_DIR_KEY)) {
                map.remove(*key);
            }
            Value::Object(map)
        }
        other => other.clone(),
    }
}
