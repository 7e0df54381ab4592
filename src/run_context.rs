use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Name of the directory that holds every run of every pipeline
pub const RUNS_DIR_NAME: &str = ".runs";

/// Name of the shared cache directory inside the runs root
pub const CACHE_DIR_NAME: &str = "action_cache";

/// Config key holding the working directory of the current run
pub const RUN_DIR_KEY: &str = "run_dir";

/// Filesystem scope of one pipeline execution
///
/// Built once when a run starts and shared read-only by all stages. The runs
/// root is what makes the cache shared across pipelines and runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    run_dir: PathBuf,
    runs_root: PathBuf,
}

impl RunContext {
    /// Discover the runs root from the run's working directory
    pub fn discover(run_dir: impl Into<PathBuf>) -> Self {
        let run_dir = run_dir.into();
        let runs_root = discover_runs_root(&run_dir);
        Self { run_dir, runs_root }
    }

    /// Use an explicitly configured runs root
    pub fn with_runs_root(run_dir: impl Into<PathBuf>, runs_root: impl Into<PathBuf>) -> Self {
        Self {
            run_dir: run_dir.into(),
            runs_root: runs_root.into(),
        }
    }

    /// Build from the `run_dir` entry of a configuration tree (defaults to `.`)
    pub fn from_config(root: &Value) -> Self {
        let run_dir = root
            .get(RUN_DIR_KEY)
            .and_then(Value::as_str)
            .unwrap_or(".");
        Self::discover(run_dir)
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn runs_root(&self) -> &Path {
        &self.runs_root
    }

    /// Directory where action cache entries live
    pub fn cache_dir(&self) -> PathBuf {
        self.runs_root.join(CACHE_DIR_NAME)
    }
}

/// Find the runs root for a run directory
///
/// Checked in order:
/// 1. the run directory or one of its ancestors is itself named `.runs`
/// 2. the run directory or one of its ancestors contains a `.runs` directory
/// 3. `./.runs` relative to the process working directory
///
/// Never fails; caching must degrade gracefully rather than block a run.
pub fn discover_runs_root(run_dir: &Path) -> PathBuf {
    if let Some(found) = run_dir
        .ancestors()
        .find(|ancestor| ancestor.file_name().is_some_and(|name| name == RUNS_DIR_NAME))
    {
        return found.to_path_buf();
    }

    let absolute = if run_dir.is_absolute() {
        run_dir.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(run_dir))
            .unwrap_or_else(|_| run_dir.to_path_buf())
    };

    for ancestor in absolute.ancestors() {
        let candidate = ancestor.join(RUNS_DIR_NAME);
        if candidate.is_dir() {
            return candidate;
        }
    }

    debug!(
        "No {} directory found above {}, using local default",
        RUNS_DIR_NAME,
        run_dir.display()
    );
    PathBuf::from(".").join(RUNS_DIR_NAME)
}
