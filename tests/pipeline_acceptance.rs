/// Acceptance tests for multi-stage pipelines
mod common;

use actioncache::{
    launch, ActionError, LayeredConfig, MemoryTracker, OutputValue, ResourceKind, RunOutcome,
};
use common::{registry, three_stage_config, Counters, TestWorkspace};
use serde_json::json;
use std::fs;
use std::sync::Arc;

#[test]
fn test_pipeline_runs_stages_in_order() {
    let workspace = TestWorkspace::new();
    let counters = Arc::new(Counters::default());
    let config = LayeredConfig::new(three_stage_config(&workspace.run_dir("train", 1), 10));

    let report = launch(&config, &registry(&counters), Arc::new(MemoryTracker::new())).unwrap();

    let order: Vec<&str> = report.stages.iter().map(|s| s.action.as_str()).collect();
    assert_eq!(order, vec!["Load", "Train", "Evaluate"]);
    assert_eq!(report.outputs["Load"]["total"], OutputValue::Int(1));
    assert_eq!(report.outputs["Train"]["total"], OutputValue::Int(11));
    assert_eq!(report.outputs["Evaluate"]["total"], OutputValue::Int(111));
}

#[test]
fn test_every_stage_is_reclaimed() {
    let workspace = TestWorkspace::new();
    let counters = Arc::new(Counters::default());
    let config = LayeredConfig::new(three_stage_config(&workspace.run_dir("train", 1), 10));

    let report = launch(&config, &registry(&counters), Arc::new(MemoryTracker::new())).unwrap();

    assert_eq!(counters.released(), 3);
    for stage in &report.stages {
        assert_eq!(stage.reclaim.released, vec![ResourceKind::Model]);
        assert_eq!(stage.reclaim.released_bytes, 4096);
        assert!(stage.reclaim.failures.is_empty());
    }
}

#[test]
fn test_rerun_is_fully_cached() {
    let workspace = TestWorkspace::new();
    let counters = Arc::new(Counters::default());
    let registry = registry(&counters);

    let first = LayeredConfig::new(three_stage_config(&workspace.run_dir("train", 1), 10));
    launch(&first, &registry, Arc::new(MemoryTracker::new())).unwrap();

    let second = LayeredConfig::new(three_stage_config(&workspace.run_dir("train", 2), 10));
    let tracker = Arc::new(MemoryTracker::new());
    let report = launch(&second, &registry, tracker.clone()).unwrap();

    assert_eq!(report.hits(), 3);
    assert!(report
        .stages
        .iter()
        .all(|s| s.outcome == RunOutcome::CacheHit));
    for name in ["Load", "Train", "Evaluate"] {
        assert_eq!(counters.runs(name), 1);
        assert_eq!(
            tracker.get(&format!("action_{}_cache_hit", name)),
            Some(json!(true))
        );
    }
    // Outputs loaded from the cache still flow to the report
    assert_eq!(report.outputs["Evaluate"]["total"], OutputValue::Int(111));
    // Nothing was loaded, so nothing needed offloading
    assert_eq!(counters.released(), 3);
}

#[test]
fn test_changed_stage_recomputes_downstream_only() {
    let workspace = TestWorkspace::new();
    let counters = Arc::new(Counters::default());
    let registry = registry(&counters);

    let first = LayeredConfig::new(three_stage_config(&workspace.run_dir("train", 1), 10));
    launch(&first, &registry, Arc::new(MemoryTracker::new())).unwrap();

    let changed = LayeredConfig::new(three_stage_config(&workspace.run_dir("train", 2), 20));
    let report = launch(&changed, &registry, Arc::new(MemoryTracker::new())).unwrap();

    let outcomes: Vec<RunOutcome> = report.stages.iter().map(|s| s.outcome).collect();
    assert_eq!(
        outcomes,
        vec![RunOutcome::CacheHit, RunOutcome::Computed, RunOutcome::Computed]
    );
    assert_eq!(counters.runs("Load"), 1);
    assert_eq!(counters.runs("Train"), 2);
    assert_eq!(counters.runs("Evaluate"), 2);
    assert_eq!(report.outputs["Evaluate"]["total"], OutputValue::Int(121));
}

#[test]
fn test_force_rerun_on_one_stage() {
    let workspace = TestWorkspace::new();
    let counters = Arc::new(Counters::default());
    let registry = registry(&counters);

    let first = LayeredConfig::new(three_stage_config(&workspace.run_dir("train", 1), 10));
    launch(&first, &registry, Arc::new(MemoryTracker::new())).unwrap();

    let mut forced = three_stage_config(&workspace.run_dir("train", 2), 10);
    forced["pipeline"]["actions"][1]["force_rerun"] = json!(true);
    let tracker = Arc::new(MemoryTracker::new());
    let report = launch(&LayeredConfig::new(forced), &registry, tracker.clone()).unwrap();

    assert_eq!(report.hits(), 2);
    assert_eq!(counters.runs("Train"), 2);
    assert_eq!(tracker.get("action_Train_cache_hit"), Some(json!(false)));
}

#[test]
fn test_failed_stage_is_still_reclaimed() {
    let workspace = TestWorkspace::new();
    let counters = Arc::new(Counters::default());
    let mut config = three_stage_config(&workspace.run_dir("train", 1), 10);
    config["pipeline"]["actions"][1]["fail"] = json!(true);

    let err = launch(
        &LayeredConfig::new(config),
        &registry(&counters),
        Arc::new(MemoryTracker::new()),
    )
    .unwrap_err();

    assert!(matches!(err, ActionError::Execution { ref action, .. } if action == "Train"));
    assert_eq!(counters.runs("Train"), 1);
    assert_eq!(counters.runs("Evaluate"), 0);
    // Load after its stage, Train after its failure
    assert_eq!(counters.released(), 2);
    // Only the successful stage left an entry behind
    let entries = workspace.cache_files();
    assert!(entries.iter().any(|f| f.starts_with("Load_")));
    assert!(!entries.iter().any(|f| f.starts_with("Train_")));
}

#[test]
fn test_pipeline_from_toml_file() {
    let workspace = TestWorkspace::new();
    let counters = Arc::new(Counters::default());
    let path = workspace.path().join("pipeline.toml");
    fs::write(
        &path,
        format!(
            r#"
run_dir = "{run_dir}"
base_step = 7

[[pipeline.actions]]
action_name = "Load"
step = "${{base_step}}"

[[pipeline.actions]]
action_name = "Train"
input = "Load"
step = 1
"#,
            run_dir = workspace.run_dir("toml", 1).replace('\\', "/")
        ),
    )
    .unwrap();

    let config = LayeredConfig::from_file(&path).unwrap();
    let report = launch(&config, &registry(&counters), Arc::new(MemoryTracker::new())).unwrap();

    assert_eq!(report.outputs["Load"]["total"], OutputValue::Int(7));
    assert_eq!(report.outputs["Train"]["total"], OutputValue::Int(8));
}

#[test]
fn test_unknown_stage_stops_before_any_work() {
    let workspace = TestWorkspace::new();
    let counters = Arc::new(Counters::default());
    let mut config = three_stage_config(&workspace.run_dir("train", 1), 10);
    config["pipeline"]["actions"][2]["action_name"] = json!("Deploy");

    let err = launch(
        &LayeredConfig::new(config),
        &registry(&counters),
        Arc::new(MemoryTracker::new()),
    )
    .unwrap_err();

    assert!(matches!(err, ActionError::UnknownAction(ref name) if name == "Deploy"));
    assert_eq!(counters.runs("Load"), 0);
    assert!(workspace.cache_files().is_empty());
}

#[test]
fn test_dangling_reference_is_a_config_error() {
    let workspace = TestWorkspace::new();
    let counters = Arc::new(Counters::default());
    let config = LayeredConfig::new(json!({
        "run_dir": workspace.run_dir("train", 1),
        "action_name": "Train",
        "step": "${nowhere.to_be.found}"
    }));

    let err = launch(&config, &registry(&counters), Arc::new(MemoryTracker::new())).unwrap_err();
    assert!(matches!(err, ActionError::Config(_)));
    assert_eq!(counters.runs("Train"), 0);
}
