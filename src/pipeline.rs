//! Sequential pipeline driver
//!
//! A pipeline is declared as an array of stage tables:
//!
//! ```toml
//! run_dir = ".runs/train/2024-05-01_10-00-00"
//!
//! [[pipeline.actions]]
//! action_name = "Tokenize"
//! vocab_size = 32000
//!
//! [[pipeline.actions]]
//! action_name = "Train"
//! lr = 0.001
//! ```
//!
//! Stages run one at a time in declaration order. Each stage sees the whole
//! tree with `pipeline_config` set to its own table, gets the outputs of every
//! earlier stage, and is reclaimed before the next one starts.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::action::{ActionHandle, ActionRegistry, RunOutcome, Session};
use crate::cache::{CacheKey, Outputs};
use crate::config::LayeredConfig;
use crate::device::{DeviceBackend, HostBackend};
use crate::error::ActionError;
use crate::reclaim::{ReclaimReport, ResourceReclaimer};
use crate::run_context::RunContext;
use crate::tracking::Tracker;

pub const PIPELINE_KEY: &str = "pipeline";
pub const ACTIONS_KEY: &str = "actions";
pub const ACTION_NAME_KEY: &str = "action_name";

/// Tracker key holding the resolved configuration of the run
pub const CONFIG_TRACKING_KEY: &str = "cfg";

/// What happened to one stage
#[derive(Debug, Clone)]
pub struct StageReport {
    pub action: String,
    pub cache_key: CacheKey,
    pub outcome: RunOutcome,
    pub reclaim: ReclaimReport,
}

/// Result of a whole run
#[derive(Debug, Clone, Default)]
pub struct PipelineReport {
    pub stages: Vec<StageReport>,
    /// Outputs of every stage, keyed by action name
    pub outputs: BTreeMap<String, Outputs>,
}

impl PipelineReport {
    pub fn hits(&self) -> usize {
        self.stages
            .iter()
            .filter(|s| s.outcome == RunOutcome::CacheHit)
            .count()
    }

    pub fn misses(&self) -> usize {
        self.stages.len() - self.hits()
    }
}

/// Runs actions strictly in sequence against one run context
pub struct Pipeline<'r> {
    registry: &'r ActionRegistry,
    session: Session,
    reclaimer: ResourceReclaimer,
}

impl<'r> Pipeline<'r> {
    pub fn new(registry: &'r ActionRegistry, session: Session) -> Self {
        let reclaimer = ResourceReclaimer::new(Arc::clone(&session.backend));
        Self {
            registry,
            session,
            reclaimer,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Run every stage in `pipeline.actions` of a resolved configuration
    pub fn run(&self, config: &LayeredConfig) -> Result<PipelineReport, ActionError> {
        let stages = stages(config.root())?;

        // Reject unknown actions before anything runs
        let mut names = Vec::with_capacity(stages.len());
        for (index, stage) in stages.iter().enumerate() {
            let name = stage_name(stage, index)?;
            if !self.registry.contains(name) {
                return Err(ActionError::UnknownAction(name.to_string()));
            }
            names.push(name);
        }

        info!("Running pipeline with {} actions", stages.len());

        let mut report = PipelineReport::default();
        for (stage, name) in stages.iter().zip(names) {
            let stage_config = config.with_stage(stage);
            let stage_report = self.run_stage(name, &stage_config, &mut report.outputs)?;
            report.stages.push(stage_report);
        }

        info!(
            "Pipeline finished: {} cached, {} computed",
            report.hits(),
            report.misses()
        );
        Ok(report)
    }

    /// Run a single action whose scope is taken from `config`
    pub fn run_single(
        &self,
        name: &str,
        config: &LayeredConfig,
    ) -> Result<PipelineReport, ActionError> {
        let mut report = PipelineReport::default();
        let stage_report = self.run_stage(name, config, &mut report.outputs)?;
        report.stages.push(stage_report);
        Ok(report)
    }

    fn run_stage(
        &self,
        name: &str,
        config: &LayeredConfig,
        outputs: &mut BTreeMap<String, Outputs>,
    ) -> Result<StageReport, ActionError> {
        let config = config.stamp_dataset_hash();
        let mut handle = ActionHandle::from_registry(self.registry, name, &config, &self.session)?;

        let outcome = match handle.run_with_cache(outputs) {
            Ok(outcome) => outcome,
            Err(e) => {
                // Release what the failed stage loaded before bailing out
                handle.reclaim(&self.reclaimer);
                return Err(e);
            }
        };

        let stage_outputs = handle.outputs();
        let reclaim = handle.reclaim(&self.reclaimer);
        let cache_key = handle.cache_key().clone();
        drop(handle);

        if outputs.insert(name.to_string(), stage_outputs).is_some() {
            warn!(
                "Action {} ran more than once; later stages see its latest outputs",
                name
            );
        }

        Ok(StageReport {
            action: name.to_string(),
            cache_key,
            outcome,
            reclaim,
        })
    }
}

/// Entry point for a configured run
///
/// Resolves interpolations, stamps the dataset hash, builds the run context
/// from `run_dir` and records the resolved tree under `cfg`. Then runs
/// `pipeline.actions` if present or else the single action named by
/// `action_name`.
pub fn launch(
    config: &LayeredConfig,
    registry: &ActionRegistry,
    tracker: Arc<dyn Tracker>,
) -> Result<PipelineReport, ActionError> {
    launch_with_backend(config, registry, tracker, Arc::new(HostBackend))
}

/// `launch` with an explicit accelerator backend
pub fn launch_with_backend(
    config: &LayeredConfig,
    registry: &ActionRegistry,
    tracker: Arc<dyn Tracker>,
    backend: Arc<dyn DeviceBackend>,
) -> Result<PipelineReport, ActionError> {
    let config = config.resolve()?.stamp_dataset_hash();
    let run = RunContext::from_config(config.root());
    info!(
        "Run directory {}, cache at {}",
        run.run_dir().display(),
        run.cache_dir().display()
    );

    tracker.set(CONFIG_TRACKING_KEY, config.root().clone());
    let session = Session::new(run).with_tracker(tracker).with_backend(backend);
    let pipeline = Pipeline::new(registry, session);

    if config
        .root()
        .get(PIPELINE_KEY)
        .is_some_and(|p| p.get(ACTIONS_KEY).is_some())
    {
        return pipeline.run(&config);
    }

    let name = config
        .root()
        .get(ACTION_NAME_KEY)
        .and_then(Value::as_str)
        .ok_or_else(|| {
            ActionError::Config(format!(
                "Expected '{}.{}' or '{}' in configuration",
                PIPELINE_KEY, ACTIONS_KEY, ACTION_NAME_KEY
            ))
        })?;

    pipeline.run_single(name, &config)
}

fn stages(root: &Value) -> Result<&Vec<Value>, ActionError> {
    let actions = root
        .get(PIPELINE_KEY)
        .and_then(|p| p.get(ACTIONS_KEY))
        .ok_or(ActionError::EmptyPipeline)?;

    match actions {
        Value::Array(stages) if stages.is_empty() => Err(ActionError::EmptyPipeline),
        Value::Array(stages) => Ok(stages),
        _ => Err(ActionError::Config(format!(
            "'{}.{}' must be an array of tables",
            PIPELINE_KEY, ACTIONS_KEY
        ))),
    }
}

fn stage_name(stage: &Value, index: usize) -> Result<&str, ActionError> {
    stage
        .get(ACTION_NAME_KEY)
        .and_then(Value::as_str)
        .ok_or_else(|| {
            ActionError::Config(format!(
                "Stage {} of the pipeline has no '{}'",
                index, ACTION_NAME_KEY
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Action, StageContext};
    use crate::cache::OutputValue;
    use crate::tracking::MemoryTracker;
    use serde_json::json;
    use tempfile::TempDir;

    struct Emit {
        name: &'static str,
        value: Option<i64>,
    }

    impl Action for Emit {
        fn name(&self) -> &str {
            self.name
        }

        fn run(&mut self, ctx: &StageContext<'_>) -> anyhow::Result<()> {
            let base = ctx
                .upstream_outputs("First")
                .and_then(|o| o.get("value"))
                .and_then(OutputValue::as_i64)
                .unwrap_or(0);
            let step = ctx.config.get("step").and_then(Value::as_i64).unwrap_or(1);
            self.value = Some(base + step);
            Ok(())
        }

        fn outputs(&self) -> Outputs {
            self.value
                .map(|v| Outputs::from([("value".to_string(), OutputValue::from(v))]))
                .unwrap_or_default()
        }
    }

    fn registry() -> ActionRegistry {
        let mut registry = ActionRegistry::new();
        registry
            .register("First", |_| {
                Ok(Box::new(Emit {
                    name: "First",
                    value: None,
                }) as Box<dyn Action>)
            })
            .register("Second", |_| {
                Ok(Box::new(Emit {
                    name: "Second",
                    value: None,
                }) as Box<dyn Action>)
            });
        registry
    }

    fn pipeline_config(temp: &TempDir) -> LayeredConfig {
        LayeredConfig::new(json!({
            "run_dir": temp.path().join(".runs/demo/1").to_string_lossy(),
            "pipeline": {
                "actions": [
                    {"action_name": "First", "step": 10},
                    {"action_name": "Second", "step": 5}
                ]
            }
        }))
    }

    #[test]
    fn test_upstream_outputs_flow_between_stages() {
        let temp = TempDir::new().unwrap();
        let tracker = Arc::new(MemoryTracker::new());

        let report = launch(&pipeline_config(&temp), &registry(), tracker.clone()).unwrap();

        assert_eq!(report.stages.len(), 2);
        assert_eq!(report.outputs["First"]["value"], OutputValue::Int(10));
        assert_eq!(report.outputs["Second"]["value"], OutputValue::Int(15));
        assert_eq!(report.misses(), 2);
        assert!(tracker.get(CONFIG_TRACKING_KEY).is_some());
    }

    #[test]
    fn test_unknown_stage_fails_before_running() {
        let temp = TempDir::new().unwrap();
        let config = LayeredConfig::new(json!({
            "run_dir": temp.path().join(".runs/demo/1").to_string_lossy(),
            "pipeline": {"actions": [{"action_name": "First"}, {"action_name": "Third"}]}
        }));

        let err = launch(&config, &registry(), Arc::new(MemoryTracker::new())).unwrap_err();
        assert!(matches!(err, ActionError::UnknownAction(name) if name == "Third"));
        assert!(!temp.path().join(".runs/action_cache").exists());
    }

    #[test]
    fn test_empty_pipeline() {
        let config = LayeredConfig::new(json!({"pipeline": {"actions": []}}));
        let err = launch(&config, &registry(), Arc::new(MemoryTracker::new())).unwrap_err();
        assert!(matches!(err, ActionError::EmptyPipeline));
    }

    #[test]
    fn test_stage_without_name() {
        let config = LayeredConfig::new(json!({"pipeline": {"actions": [{"step": 1}]}}));
        let err = launch(&config, &registry(), Arc::new(MemoryTracker::new())).unwrap_err();
        assert!(matches!(err, ActionError::Config(_)));
    }

    #[test]
    fn test_nothing_to_run() {
        let err = launch(
            &LayeredConfig::new(json!({"lr": 0.1})),
            &registry(),
            Arc::new(MemoryTracker::new()),
        )
        .unwrap_err();
        assert!(matches!(err, ActionError::Config(_)));
    }

    #[test]
    fn test_single_action_from_top_level() {
        let temp = TempDir::new().unwrap();
        let config = LayeredConfig::new(json!({
            "run_dir": temp.path().join(".runs/single/1").to_string_lossy(),
            "action_name": "First",
            "step": 4
        }));

        let report = launch(&config, &registry(), Arc::new(MemoryTracker::new())).unwrap();
        assert_eq!(report.outputs["First"]["value"], OutputValue::Int(4));
    }

    #[test]
    fn test_stage_dataset_hash_is_part_of_the_key() {
        let temp = TempDir::new().unwrap();
        let stage = json!({"action_name": "First", "dataset": {"name": "ioi", "size": 8}});
        let config = LayeredConfig::new(json!({
            "run_dir": temp.path().join(".runs/demo/1").to_string_lossy(),
            "pipeline": {"actions": [stage.clone()]}
        }));
        let tracker = Arc::new(MemoryTracker::new());

        let report = launch(&config, &registry(), tracker.clone()).unwrap();

        let stamped = config.with_stage(&stage).stamp_dataset_hash();
        let hash = stamped
            .lookup("pipeline_config.dataset.hash")
            .and_then(Value::as_str)
            .unwrap();
        assert!(hash.starts_with("ioi_"));
        assert_eq!(
            report.stages[0].cache_key,
            CacheKey::derive("First", &stamped.scope().config)
        );
    }

    #[test]
    fn test_top_level_dataset_hash_is_recorded() {
        let temp = TempDir::new().unwrap();
        let config = LayeredConfig::new(json!({
            "run_dir": temp.path().join(".runs/single/1").to_string_lossy(),
            "action_name": "First",
            "dataset": {"name": "wiki"}
        }));
        let tracker = Arc::new(MemoryTracker::new());

        launch(&config, &registry(), tracker.clone()).unwrap();

        let recorded = tracker.get(CONFIG_TRACKING_KEY).unwrap();
        assert!(recorded["dataset"]["hash"]
            .as_str()
            .unwrap()
            .starts_with("wiki_"));
    }
}
