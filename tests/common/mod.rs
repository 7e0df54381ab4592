// Common test utilities shared across acceptance tests
//
// Each test gets its own temp directory holding a `.runs` root, so runs of
// one test share a cache with each other and with nobody else.

use actioncache::{
    Action, ActionRegistry, OutputValue, Outputs, Releasable, ResourceKind, ResourceSet,
    StageContext,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Isolated project directory with a `.runs` root
pub struct TestWorkspace {
    temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestWorkspace {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        std::fs::create_dir_all(temp_dir.path().join(".runs")).unwrap();
        Self { temp_dir }
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn runs_root(&self) -> PathBuf {
        self.path().join(".runs")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.runs_root().join("action_cache")
    }

    /// Working directory of one run of `pipeline`
    pub fn run_dir(&self, pipeline: &str, run: u32) -> String {
        self.runs_root()
            .join(pipeline)
            .join(format!("run-{}", run))
            .to_string_lossy()
            .into_owned()
    }

    /// Files currently in the cache directory
    pub fn cache_files(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(self.cache_dir()) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

/// Counts executions and releases per action name
#[derive(Default)]
pub struct Counters {
    runs: Mutex<BTreeMap<String, usize>>,
    released: AtomicUsize,
}

#[allow(dead_code)]
impl Counters {
    pub fn runs(&self, name: &str) -> usize {
        self.runs.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    fn record_run(&self, name: &str) {
        *self.runs.lock().unwrap().entry(name.to_string()).or_default() += 1;
    }
}

/// Stand-in for model weights
pub struct FakeModel {
    counters: Arc<Counters>,
}

impl Releasable for FakeModel {
    fn offload(&mut self) -> anyhow::Result<()> {
        self.counters.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn approx_bytes(&self) -> Option<u64> {
        Some(4096)
    }
}

/// Adds `step` to the `total` output of an optional `input` stage
///
/// With `fail = true` it loads its model and then returns an error.
pub struct Accumulate {
    name: String,
    counters: Arc<Counters>,
    resources: ResourceSet,
    total: Option<i64>,
}

impl Action for Accumulate {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&mut self, ctx: &StageContext<'_>) -> anyhow::Result<()> {
        self.counters.record_run(&self.name);
        self.resources.insert(
            ResourceKind::Model,
            FakeModel {
                counters: Arc::clone(&self.counters),
            },
        );

        if ctx.config.get("fail").and_then(Value::as_bool) == Some(true) {
            anyhow::bail!("{} gave up after loading its model", self.name);
        }

        let base = ctx
            .config
            .get("input")
            .and_then(Value::as_str)
            .and_then(|input| ctx.upstream_outputs(input))
            .and_then(|outputs| outputs.get("total"))
            .and_then(OutputValue::as_i64)
            .unwrap_or(0);
        let step = ctx.config.get("step").and_then(Value::as_i64).unwrap_or(1);
        self.total = Some(base + step);
        Ok(())
    }

    fn outputs(&self) -> Outputs {
        let mut outputs = Outputs::new();
        if let Some(total) = self.total {
            outputs.insert("total".to_string(), total.into());
        }
        outputs
    }

    fn resources(&mut self) -> Option<&mut ResourceSet> {
        Some(&mut self.resources)
    }
}

/// Registry with `Load`, `Train` and `Evaluate`, all backed by `Accumulate`
pub fn registry(counters: &Arc<Counters>) -> ActionRegistry {
    let mut registry = ActionRegistry::new();
    for name in ["Load", "Train", "Evaluate"] {
        let counters = Arc::clone(counters);
        registry.register(name, move |_| {
            Ok(Box::new(Accumulate {
                name: name.to_string(),
                counters: Arc::clone(&counters),
                resources: ResourceSet::new(),
                total: None,
            }) as Box<dyn Action>)
        });
    }
    registry
}

/// Three-stage pipeline configuration for `run_dir`
#[allow(dead_code)]
pub fn three_stage_config(run_dir: &str, train_step: i64) -> Value {
    json!({
        "run_dir": run_dir,
        "pipeline": {
            "actions": [
                {"action_name": "Load", "step": 1},
                {"action_name": "Train", "input": "Load", "step": train_step},
                {
                    "action_name": "Evaluate",
                    "input": "Train",
                    "step": 100,
                    // Upstream outputs are not part of a key; pin the dependency explicitly
                    "train_step": "${pipeline.actions.1.step}"
                }
            ]
        }
    })
}
