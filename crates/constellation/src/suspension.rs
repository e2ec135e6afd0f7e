//! Suspension Protocol (`spec.md` §4.10, C10).
//!
//! A `SuspendedExecution` is the only cross-boundary value a run produces
//! when it can't finish: everything needed to pick it back up later,
//! frozen as plain data. The computed-values map is kept as `CValue`
//! (spec.md §4.10: "for serialization stability"); the engine converts
//! back to `RawValue` on resume via `RunState::restore_snapshot_value`.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dag::{DagSpec, ModuleCallOptions, OnErrorStrategy};
use crate::config::EngineConfig;
use crate::error::{ConstellationError, ErrorContext, Result};
use crate::executor::scheduler::{ModuleStatus, ResolutionSource, RunState};
use crate::executor::RunOutcome;
use crate::value::CValue;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuspendedExecution {
    pub execution_id: Uuid,
    pub structural_hash: String,
    pub resumption_count: u32,
    pub spec: DagSpec,
    pub module_options: HashMap<Uuid, ModuleCallOptions>,
    /// Top-level inputs supplied by name at the point this snapshot was
    /// taken (not the full value table — see `computed_values` for that).
    pub provided_inputs: HashMap<String, CValue>,
    pub computed_values: HashMap<Uuid, CValue>,
    pub module_statuses: HashMap<Uuid, ModuleStatus>,
}

fn codec_err(message: impl Into<String>) -> ConstellationError {
    ConstellationError::Codec { message: message.into(), context: ErrorContext::new() }
}

impl SuspendedExecution {
    /// Build a snapshot from a just-finished (non-`Completed`) run.
    pub fn capture(
        execution_id: Uuid,
        spec: &DagSpec,
        module_options: &HashMap<Uuid, ModuleCallOptions>,
        structural_hash: String,
        provided_inputs: HashMap<String, CValue>,
        outcome: &RunOutcome,
    ) -> Result<Self> {
        let mut computed_values = HashMap::with_capacity(outcome.values.len());
        for (data_id, cell) in &outcome.values {
            if let crate::executor::Cell::Computed(raw) = cell {
                let ty = &spec.data[data_id].ty;
                computed_values.insert(*data_id, raw.to_cvalue(ty)?);
            }
        }
        Ok(Self {
            execution_id,
            structural_hash,
            resumption_count: outcome.resumption_count,
            spec: spec.clone(),
            module_options: module_options.clone(),
            provided_inputs,
            computed_values,
            module_statuses: outcome.module_status.clone(),
        })
    }

    /// Reference encoding (`spec.md` §4.10): JSON, canonical UUID strings,
    /// tagged `CValue`/`CType` payloads — all already how `uuid`/`serde`
    /// represent these types, so this is a thin `serde_json` wrapper.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| codec_err(format!("failed to encode suspended execution: {e}")))
    }

    pub fn decode(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| codec_err(format!("failed to decode suspended execution: {e}")))
    }
}

/// Enforces "only one resume may be in flight per execution"
/// (`spec.md` §4.10). Shared across calls the way the module registry
/// and pipeline store are (§5: "read-mostly... shared across runs").
#[derive(Clone, Default)]
pub struct ResumeGuard {
    in_flight: Arc<DashSet<Uuid>>,
}

/// Held for the duration of one resume; releases its slot on drop so a
/// panicking or cancelled resume doesn't wedge the execution forever.
pub struct ResumeLease {
    guard: Arc<DashSet<Uuid>>,
    execution_id: Uuid,
}

impl Drop for ResumeLease {
    fn drop(&mut self) {
        self.guard.remove(&self.execution_id);
    }
}

impl ResumeGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, execution_id: Uuid) -> Result<ResumeLease> {
        if !self.in_flight.insert(execution_id) {
            tracing::warn!(%execution_id, "resume rejected, another resume already in flight");
            return Err(ConstellationError::ResumeInProgress {
                execution_id: execution_id.to_string(),
                context: ErrorContext::new(),
            });
        }
        Ok(ResumeLease { guard: self.in_flight.clone(), execution_id })
    }
}

/// Run the 4-step resume procedure (`spec.md` §4.10) and return a
/// `RunState` ready to hand to `executor::drive`. `expected_structural_hash`
/// is the hash of the pipeline resolved from the store for this resume
/// call; it must match the snapshot's own hash or the pipeline changed
/// underneath the suspended execution.
pub fn resume_state(
    snapshot: &SuspendedExecution,
    expected_structural_hash: &str,
    additional_inputs: HashMap<String, CValue>,
    resolved_nodes: HashMap<String, CValue>,
    config: &EngineConfig,
) -> Result<RunState> {
    if snapshot.structural_hash != expected_structural_hash {
        tracing::error!(
            expected = %expected_structural_hash,
            actual = %snapshot.structural_hash,
            "pipeline structural hash changed since suspension"
        );
        return Err(ConstellationError::PipelineChanged {
            expected: expected_structural_hash.to_string(),
            actual: snapshot.structural_hash.clone(),
            context: ErrorContext::new(),
        });
    }

    for name in additional_inputs.keys() {
        if snapshot.provided_inputs.contains_key(name) {
            return Err(ConstellationError::InputAlreadyProvided { name: name.clone(), context: ErrorContext::new() });
        }
    }

    let spec = Arc::new(snapshot.spec.clone());
    let module_options = Arc::new(snapshot.module_options.clone());
    let mut state = RunState::empty(spec.clone(), module_options);
    state.resumption_count = snapshot.resumption_count + 1;
    state.debug_mode = config.debug_mode;

    for (data_id, value) in &snapshot.computed_values {
        state.restore_snapshot_value(*data_id, value.clone(), ResolutionSource::Resumed)?;
    }

    state.bind_inputs(additional_inputs)?;

    let by_name: HashMap<&str, Uuid> = spec.data.values().map(|d| (d.visible_name.as_str(), d.id)).collect();
    for (name, value) in resolved_nodes {
        let data_id = *by_name
            .get(name.as_str())
            .ok_or_else(|| ConstellationError::UnknownNode { name: name.clone(), context: ErrorContext::new() })?;
        state.bind_resolved_node(data_id, value)?;
    }

    for (module_id, status) in &snapshot.module_statuses {
        if matches!(status, ModuleStatus::Failed | ModuleStatus::Skipped | ModuleStatus::Completed) {
            let suppressed = *status == ModuleStatus::Failed
                && module_options_on_error(&snapshot.module_options, *module_id) == OnErrorStrategy::Suppress;
            state.restore_module_status(*module_id, *status, suppressed);
        }
    }

    state.cascade()?;
    Ok(state)
}

fn module_options_on_error(module_options: &HashMap<Uuid, ModuleCallOptions>, module_id: Uuid) -> OnErrorStrategy {
    module_options.get(&module_id).and_then(|o| o.on_error).unwrap_or_default()
}
