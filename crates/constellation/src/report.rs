//! Execution Report Builder (`spec.md` §4.11, C11).
//!
//! Turns the executor's internal `RunOutcome` into the public
//! `DataSignature` shape. `SignatureMetadata` is populated exactly
//! according to `ExecutionOptions`'s boolean flags — never more, never
//! less, per §4.11 — so every field it can carry is `Option`-gated here
//! rather than always computed.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dag::DagSpec;
use crate::error::{ConstellationError, Result};
use crate::executor::{Cell, ModuleStatus, ResolutionSource, RunOutcome, RunStatus};
use crate::suspension::SuspendedExecution;
use crate::value::CValue;

/// Which optional sections of `SignatureMetadata` to populate.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutionOptions {
    pub include_timings: bool,
    pub include_provenance: bool,
    pub include_blocked_graph: bool,
    pub include_resolution_sources: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignatureMetadata {
    /// Per-node monotonic duration, keyed by the module's registry name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_timings: Option<HashMap<String, Duration>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_duration: Option<Duration>,
    /// Human-readable origin of each declared output: the producing
    /// module's name, or `"input"` / `"inline_transform"` / `"resumed"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provenance: Option<HashMap<String, String>>,
    /// Names of modules that never completed because something upstream
    /// of them failed (`Skipped`, or `Failed` themselves).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_graph: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution_sources: Option<HashMap<String, ResolutionSource>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DataSignature {
    pub status: RunStatus,
    pub outputs: HashMap<String, CValue>,
    pub missing_inputs: Vec<String>,
    pub suspended_state: Option<SuspendedExecution>,
    pub errors: Vec<ConstellationError>,
    pub resumption_count: u32,
    pub metadata: SignatureMetadata,
}

impl Serialize for RunStatus {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let s = match self {
            RunStatus::Completed => "completed",
            RunStatus::Suspended => "suspended",
            RunStatus::Failed => "failed",
        };
        serializer.serialize_str(s)
    }
}

impl<'de> Deserialize<'de> for RunStatus {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        match raw.as_str() {
            "completed" => Ok(RunStatus::Completed),
            "suspended" => Ok(RunStatus::Suspended),
            "failed" => Ok(RunStatus::Failed),
            other => Err(serde::de::Error::unknown_variant(other, &["completed", "suspended", "failed"])),
        }
    }
}

/// Build the public report from a finished run. `suspended` is only
/// attached when `outcome.status != Completed`, matching the scenarios in
/// `spec.md` §8 ("`suspendedState` present" only on `Suspended`/`Failed`).
pub fn build_report(
    outcome: RunOutcome,
    spec: &DagSpec,
    options: ExecutionOptions,
    suspended: Option<SuspendedExecution>,
) -> Result<DataSignature> {
    let mut outputs = HashMap::with_capacity(spec.declared_outputs.len());
    for name in &spec.declared_outputs {
        let data_id = &spec.output_bindings[name];
        if let Some(Cell::Computed(raw)) = outcome.values.get(data_id) {
            let ty = &spec.data[data_id].ty;
            outputs.insert(name.clone(), raw.to_cvalue(ty)?);
        }
    }

    let missing_inputs: Vec<String> = outcome
        .missing_inputs
        .iter()
        .map(|id| spec.data.get(id).map(|d| d.visible_name.clone()).unwrap_or_else(|| id.to_string()))
        .collect();

    let errors: Vec<ConstellationError> = outcome.errors.iter().map(|(_, err)| err.clone()).collect();

    let metadata = SignatureMetadata {
        node_timings: options.include_timings.then(|| {
            outcome
                .node_timings
                .iter()
                .map(|(id, d)| (spec.modules[id].name.clone(), *d))
                .collect()
        }),
        total_duration: options.include_timings.then_some(outcome.total_duration),
        provenance: options.include_provenance.then(|| build_provenance(&outcome, spec)),
        blocked_graph: options.include_blocked_graph.then(|| blocked_module_names(&outcome, spec)),
        resolution_sources: options.include_resolution_sources.then(|| {
            outcome
                .resolution_sources
                .iter()
                .filter_map(|(id, source)| spec.data.get(id).map(|d| (d.visible_name.clone(), *source)))
                .collect()
        }),
    };

    let suspended_state = if matches!(outcome.status, RunStatus::Completed) { None } else { suspended };

    Ok(DataSignature {
        status: outcome.status,
        outputs,
        missing_inputs,
        suspended_state,
        errors,
        resumption_count: outcome.resumption_count,
        metadata,
    })
}

fn build_provenance(outcome: &RunOutcome, spec: &DagSpec) -> HashMap<String, String> {
    let mut provenance = HashMap::new();
    for name in &spec.declared_outputs {
        let data_id = &spec.output_bindings[name];
        let origin = match outcome.resolution_sources.get(data_id) {
            Some(ResolutionSource::Input) => "input".to_string(),
            Some(ResolutionSource::InlineTransform) => "inline_transform".to_string(),
            Some(ResolutionSource::Resumed) => "resumed".to_string(),
            Some(ResolutionSource::Module) => producing_module_name(*data_id, spec).unwrap_or_else(|| "module".to_string()),
            None => "unresolved".to_string(),
        };
        provenance.insert(name.clone(), origin);
    }
    provenance
}

fn producing_module_name(data_id: Uuid, spec: &DagSpec) -> Option<String> {
    spec.out_edges.iter().find(|(_, d)| *d == data_id).map(|(m, _)| spec.modules[m].name.clone())
}

fn blocked_module_names(outcome: &RunOutcome, spec: &DagSpec) -> Vec<String> {
    let mut names: Vec<String> = outcome
        .module_status
        .iter()
        .filter(|(_, status)| matches!(status, ModuleStatus::Skipped | ModuleStatus::Failed))
        .map(|(id, _)| spec.modules[id].name.clone())
        .collect();
    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::executor::scheduler::RunState;
    use crate::registry::{CancellationToken, ModuleImpl};
    use crate::test_support::{double_inc_fixture, double_module, inc_module};
    use std::sync::Arc;

    async fn drive_fixture(
        inputs: HashMap<String, CValue>,
    ) -> (crate::test_support::DoubleIncFixture, RunOutcome) {
        let fixture = double_inc_fixture();
        let mut modules: HashMap<Uuid, Arc<dyn ModuleImpl>> = HashMap::new();
        modules.insert(fixture.double_module, Arc::new(double_module()));
        modules.insert(fixture.inc_module, Arc::new(inc_module()));
        let mut state = RunState::empty(Arc::new(fixture.spec.clone()), Arc::new(HashMap::new()));
        state.bind_inputs(inputs).unwrap();
        state.cascade().unwrap();
        let config = EngineConfig::default();
        let outcome =
            crate::executor::drive(state, Arc::new(modules), &config, CancellationToken::new(), None).await.unwrap();
        (fixture, outcome)
    }

    #[tokio::test]
    async fn completed_run_has_no_suspended_state_and_correct_output() {
        let (fixture, outcome) = drive_fixture(HashMap::from([("x".to_string(), CValue::Int(3))])).await;
        let report = build_report(outcome, &fixture.spec, ExecutionOptions::default(), None).unwrap();
        assert!(matches!(report.status, RunStatus::Completed));
        assert_eq!(report.outputs.get("z"), Some(&CValue::Int(7)));
        assert!(report.suspended_state.is_none());
        assert!(report.metadata.node_timings.is_none());
    }

    #[tokio::test]
    async fn suspended_run_reports_missing_input_by_name() {
        let (fixture, outcome) = drive_fixture(HashMap::new()).await;
        let report = build_report(outcome, &fixture.spec, ExecutionOptions::default(), None).unwrap();
        assert!(matches!(report.status, RunStatus::Suspended));
        assert_eq!(report.missing_inputs, vec!["x".to_string()]);
    }

    #[tokio::test]
    async fn timings_are_only_populated_when_requested() {
        let (fixture, outcome) = drive_fixture(HashMap::from([("x".to_string(), CValue::Int(3))])).await;
        let options = ExecutionOptions { include_timings: true, ..Default::default() };
        let report = build_report(outcome, &fixture.spec, options, None).unwrap();
        let timings = report.metadata.node_timings.unwrap();
        assert_eq!(timings.len(), 2);
        assert!(timings.contains_key("double"));
        assert!(report.metadata.provenance.is_none());
    }

    #[tokio::test]
    async fn blocked_graph_lists_skipped_modules() {
        let fixture = double_inc_fixture();
        let mut modules: HashMap<Uuid, Arc<dyn ModuleImpl>> = HashMap::new();
        modules.insert(
            fixture.double_module,
            Arc::new(crate::test_support::FailingModule::new("double", 10, |_| Ok(HashMap::new()))),
        );
        modules.insert(fixture.inc_module, Arc::new(inc_module()));
        let mut options = HashMap::new();
        options.insert(fixture.double_module, crate::dag::ModuleCallOptions::default());
        let mut state = RunState::empty(Arc::new(fixture.spec.clone()), Arc::new(options));
        state.bind_inputs(HashMap::from([("x".to_string(), CValue::Int(3))])).unwrap();
        state.cascade().unwrap();
        let config = EngineConfig::default();
        let outcome =
            crate::executor::drive(state, Arc::new(modules), &config, CancellationToken::new(), None).await.unwrap();

        let exec_options = ExecutionOptions { include_blocked_graph: true, ..Default::default() };
        let report = build_report(outcome, &fixture.spec, exec_options, None).unwrap();
        assert!(matches!(report.status, RunStatus::Failed));
        assert_eq!(report.metadata.blocked_graph.unwrap(), vec!["double".to_string(), "inc".to_string()]);
    }
}
