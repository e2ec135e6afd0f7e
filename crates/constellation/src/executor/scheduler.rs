//! Per-run scheduler state (`spec.md` §4.8).
//!
//! `RunState` is exclusively owned by one execution (`spec.md` §5:
//! "per-run state is not shared; a snapshot is the only cross-boundary
//! value") and mutated only by the driver in `executor::mod`. Nothing
//! here spawns tasks or sleeps; that belongs to the driver loop, which is
//! the only place `spec.md` §5 permits suspension points.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::dag::{BackoffStrategy, DagSpec, ModuleCallOptions, NamedPriority, OnErrorStrategy, Priority};
use crate::error::{ConstellationError, Result};
use crate::executor::retry::RetryState;
use crate::config::{DebugMode, EngineConfig};
use crate::transform::InlineTransform;
use crate::value::{CValue, RawValue};

/// A data node's value slot (`spec.md` §4.8 abstract state).
#[derive(Debug, Clone)]
pub enum Cell {
    Empty,
    Computed(RawValue),
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ModuleStatus {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// Tags why a data node ended up with the value it has (`SPEC_FULL.md`
/// §5: materialized from the Glossary's "resolution source" entry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ResolutionSource {
    Input,
    Module,
    InlineTransform,
    Resumed,
}

/// `ModuleCallOptions` with every `None` resolved against the node's own
/// declared timeouts and the engine default (`spec.md` §3: "absence means
/// inherit default").
#[derive(Debug, Clone)]
pub struct EffectiveOptions {
    pub retry: u32,
    pub module_timeout: Duration,
    pub inputs_timeout: Duration,
    pub delay: Duration,
    pub max_delay: Duration,
    pub backoff: BackoffStrategy,
    pub on_error: OnErrorStrategy,
    pub priority: Priority,
    pub concurrency_limit: Option<usize>,
    pub throttle_count: Option<u32>,
    pub throttle_window: Option<Duration>,
}

fn effective_options(
    module_id: Uuid,
    spec: &DagSpec,
    module_options: &HashMap<Uuid, ModuleCallOptions>,
    config: &EngineConfig,
) -> EffectiveOptions {
    let node = &spec.modules[&module_id];
    let opts = module_options.get(&module_id).cloned().unwrap_or_default();
    EffectiveOptions {
        retry: opts.retry.unwrap_or(config.default_retry),
        module_timeout: opts
            .timeout
            .or(node.module_timeout)
            .unwrap_or(config.default_module_timeout),
        inputs_timeout: node.inputs_timeout.unwrap_or(config.default_inputs_timeout),
        delay: opts.delay.unwrap_or(config.default_backoff_delay),
        max_delay: opts.max_delay.unwrap_or(config.max_backoff_delay),
        backoff: opts.backoff.unwrap_or(BackoffStrategy::Fixed),
        on_error: opts.on_error.unwrap_or_default(),
        priority: opts.priority.unwrap_or_default(),
        concurrency_limit: opts.concurrency_limit,
        throttle_count: opts.throttle_count,
        throttle_window: opts.throttle_window,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    Suspended,
    Failed,
}

pub struct RunState {
    pub spec: Arc<DagSpec>,
    pub module_options: Arc<HashMap<Uuid, ModuleCallOptions>>,
    pub values: HashMap<Uuid, Cell>,
    pub module_status: HashMap<Uuid, ModuleStatus>,
    pub retry_states: HashMap<Uuid, RetryState>,
    pub errors: Vec<(Uuid, ConstellationError)>,
    pub resolution_sources: HashMap<Uuid, ResolutionSource>,
    /// Modules whose exhausted failure used `OnErrorStrategy::Suppress`;
    /// excluded from the "a Failed module blocks a declared output"
    /// status rule (`spec.md` §4.8 failure table note on `onError`).
    pub suppressed_failures: HashSet<Uuid>,
    pub resumption_count: u32,
    /// `CONSTELLATION_DEBUG` (`spec.md` §6), read once by the caller and
    /// stamped onto the state before the first `bind_inputs`/`cascade` —
    /// never polled from the environment here. Defaults to `Errors`,
    /// matching `EngineConfig::default()`, for callers (mostly tests)
    /// that build a `RunState` without plumbing a config through.
    pub debug_mode: DebugMode,
}

impl RunState {
    pub fn empty(spec: Arc<DagSpec>, module_options: Arc<HashMap<Uuid, ModuleCallOptions>>) -> Self {
        let module_status = spec.modules.keys().map(|id| (*id, ModuleStatus::Pending)).collect();
        let values = spec.data.keys().map(|id| (*id, Cell::Empty)).collect();
        Self {
            spec,
            module_options,
            values,
            module_status,
            retry_states: HashMap::new(),
            errors: Vec::new(),
            resolution_sources: HashMap::new(),
            suppressed_failures: HashSet::new(),
            resumption_count: 0,
            debug_mode: DebugMode::default(),
        }
    }

    /// Apply a boundary/node type mismatch according to `self.debug_mode`
    /// (`spec.md` §6): `Off` is silent, `Errors` logs and the caller
    /// proceeds as if the check passed, `Full` returns the mismatch.
    fn check_type(&self, err: ConstellationError) -> Result<()> {
        match self.debug_mode {
            DebugMode::Off => Ok(()),
            DebugMode::Errors => {
                tracing::warn!(error = %err, "type-check violation (CONSTELLATION_DEBUG=errors, continuing)");
                Ok(())
            }
            DebugMode::Full => Err(err),
        }
    }

    pub fn effective_options(&self, module_id: Uuid, config: &EngineConfig) -> EffectiveOptions {
        effective_options(module_id, &self.spec, &self.module_options, config)
    }

    /// Init step 1 (`spec.md` §4.8): bind provided inputs, type-checked
    /// against the data node they name.
    /// Binds `inputs`, type-checked against the data node they name
    /// (`spec.md` §6/§8 S4). A mismatch under `DebugMode::Full` aborts
    /// the whole call; under the default `Errors` it fails only that
    /// boundary node (and everything downstream of it) without running
    /// any module, reported as `RunStatus::Failed` rather than a hard
    /// `Err`; `Off` skips the check entirely.
    pub fn bind_inputs(&mut self, inputs: HashMap<String, CValue>) -> Result<()> {
        let by_name: HashMap<&str, Uuid> =
            self.spec.data.values().map(|d| (d.visible_name.as_str(), d.id)).collect();
        for (name, value) in inputs {
            let data_id = *by_name.get(name.as_str()).ok_or_else(|| ConstellationError::InputValidation {
                message: format!("no data node named `{name}`"),
                context: crate::error::ctx_pairs(&[("input", name.clone())]),
            })?;
            let declared_ty = &self.spec.data[&data_id].ty;
            if &value.type_of() != declared_ty {
                let err = ConstellationError::input_type_mismatch(name, declared_ty.clone(), value.type_of());
                match self.debug_mode {
                    DebugMode::Off => {}
                    DebugMode::Full => return Err(err),
                    DebugMode::Errors => {
                        tracing::warn!(error = %err, "boundary input type mismatch, failing without running any module");
                        self.errors.push((data_id, err));
                        self.values.insert(data_id, Cell::Failed);
                        self.skip_downstream_from_data(vec![data_id]);
                        continue;
                    }
                }
            }
            self.values.insert(data_id, Cell::Computed(RawValue::from_cvalue(value)));
            self.resolution_sources.insert(data_id, ResolutionSource::Input);
        }
        Ok(())
    }

    /// Install a value snapshotted from a prior run, bypassing the
    /// "must currently be Empty" guard `bind_resolved_node` enforces
    /// (`spec.md` §4.10: loading a snapshot is not user input merging).
    pub fn restore_snapshot_value(&mut self, data_id: Uuid, value: CValue, source: ResolutionSource) -> Result<()> {
        let data = self.spec.data.get(&data_id).ok_or_else(|| ConstellationError::UnknownNode {
            name: data_id.to_string(),
            context: crate::error::ErrorContext::new(),
        })?;
        if value.type_of() != data.ty {
            return Err(ConstellationError::node_type_mismatch(data.visible_name.clone(), data.ty.clone(), value.type_of()));
        }
        self.values.insert(data_id, Cell::Computed(RawValue::from_cvalue(value)));
        self.resolution_sources.insert(data_id, source);
        Ok(())
    }

    /// Restore a module's terminal status from a snapshot (`Failed`,
    /// `Skipped`, `Completed`); `suppressed` mirrors whether that failure
    /// used `OnErrorStrategy::Suppress` so `determine_outcome` classifies
    /// it the same way it would have the first time around.
    pub fn restore_module_status(&mut self, module_id: Uuid, status: ModuleStatus, suppressed: bool) {
        self.module_status.insert(module_id, status);
        if suppressed {
            self.suppressed_failures.insert(module_id);
        }
    }

    /// Directly install an already-typed raw value, used by resume to
    /// merge `resolvedNodes` (`spec.md` §4.10 step 3) without re-parsing.
    pub fn bind_resolved_node(&mut self, data_id: Uuid, value: CValue) -> Result<()> {
        if !matches!(self.values.get(&data_id), Some(Cell::Empty)) {
            return Err(ConstellationError::NodeAlreadyResolved {
                name: self.spec.data.get(&data_id).map(|d| d.visible_name.clone()).unwrap_or_default(),
                context: crate::error::ErrorContext::new(),
            });
        }
        let data = self.spec.data.get(&data_id).ok_or_else(|| ConstellationError::UnknownNode {
            name: data_id.to_string(),
            context: crate::error::ErrorContext::new(),
        })?;
        if value.type_of() != data.ty {
            return Err(ConstellationError::node_type_mismatch(data.visible_name.clone(), data.ty.clone(), value.type_of()));
        }
        self.values.insert(data_id, Cell::Computed(RawValue::from_cvalue(value)));
        self.resolution_sources.insert(data_id, ResolutionSource::Resumed);
        Ok(())
    }

    /// Init steps 2-3 and the re-evaluation after every successful write
    /// (`spec.md` §4.8: "this may cascade"). Idempotent: safe to call
    /// repeatedly, only acts on newly-unblocked nodes.
    pub fn cascade(&mut self) -> Result<()> {
        loop {
            let mut progressed = false;

            let pending_transforms: Vec<Uuid> = self
                .spec
                .data
                .values()
                .filter(|d| d.inline_transform.is_some())
                .filter(|d| matches!(self.values.get(&d.id), Some(Cell::Empty)))
                .filter(|d| {
                    d.transform_inputs.values().all(|src| matches!(self.values.get(src), Some(Cell::Computed(_))))
                })
                .map(|d| d.id)
                .collect();

            for data_id in pending_transforms {
                let data = &self.spec.data[&data_id];
                let transform = data.inline_transform.as_ref().unwrap();
                let mut inputs = BTreeMap::new();
                for (name, src_id) in &data.transform_inputs {
                    let src_ty = &self.spec.data[src_id].ty;
                    let raw = match &self.values[src_id] {
                        Cell::Computed(raw) => raw,
                        _ => unreachable!("filtered above"),
                    };
                    inputs.insert(name.clone(), raw.to_cvalue(src_ty)?);
                }
                let result = transform.apply(&inputs)?;
                if result.type_of() != data.ty {
                    return Err(ConstellationError::node_type_mismatch(
                        data.visible_name.clone(),
                        data.ty.clone(),
                        result.type_of(),
                    ));
                }
                self.values.insert(data_id, Cell::Computed(RawValue::from_cvalue(result)));
                self.resolution_sources.insert(data_id, ResolutionSource::InlineTransform);
                progressed = true;
            }

            let newly_ready: Vec<Uuid> = self
                .spec
                .modules
                .keys()
                .copied()
                .filter(|id| matches!(self.module_status.get(id), Some(ModuleStatus::Pending)))
                .filter(|id| self.module_inputs_ready(*id))
                .collect();
            for module_id in newly_ready {
                self.module_status.insert(module_id, ModuleStatus::Ready);
                progressed = true;
            }

            if !progressed {
                break;
            }
        }
        Ok(())
    }

    fn module_inputs_ready(&self, module_id: Uuid) -> bool {
        self.spec
            .in_edges
            .iter()
            .filter(|(_, m)| *m == module_id)
            .all(|(data_id, _)| matches!(self.values.get(data_id), Some(Cell::Computed(_))))
    }

    /// Inputs for a `Ready`/dispatching module, renamed via
    /// `DataNodeSpec::nicknames[moduleId]` as `spec.md` §4.8 step 3 requires.
    pub fn gather_inputs(&self, module_id: Uuid) -> Result<HashMap<String, CValue>> {
        let mut out = HashMap::new();
        for (data_id, m) in &self.spec.in_edges {
            if *m != module_id {
                continue;
            }
            let data = &self.spec.data[data_id];
            let raw = match &self.values[data_id] {
                Cell::Computed(raw) => raw,
                _ => {
                    return Err(ConstellationError::DataNotFound {
                        node_id: data.visible_name.clone(),
                        context: crate::error::ErrorContext::new(),
                    })
                }
            };
            let local_name = data.nicknames.get(&module_id).cloned().unwrap_or_else(|| data.visible_name.clone());
            out.insert(local_name, raw.to_cvalue(&data.ty)?);
        }
        Ok(out)
    }

    /// Apply a successful module call: type-check and write every output,
    /// mark `Completed`, then cascade readiness (`spec.md` §4.8 step 4).
    pub fn apply_success(&mut self, module_id: Uuid, outputs: HashMap<String, CValue>) -> Result<()> {
        let node = &self.spec.modules[&module_id];
        for (out_name, declared_ty) in &node.produces {
            let value = outputs.get(out_name).ok_or_else(|| ConstellationError::NodeTypeMismatch {
                node_name: node.name.clone(),
                expected: declared_ty.clone(),
                actual: crate::types::CType::Unit,
                context: crate::error::ctx_pairs(&[("missingOutput", out_name.clone())]),
            })?;
            if &value.type_of() != declared_ty {
                self.check_type(ConstellationError::node_type_mismatch(
                    format!("{}.{out_name}", node.name),
                    declared_ty.clone(),
                    value.type_of(),
                ))?;
            }
        }
        for (producing_module, data_id) in self.spec.out_edges.clone() {
            if producing_module != module_id {
                continue;
            }
            let data = &self.spec.data[&data_id];
            let local_name = data.nicknames.get(&module_id).cloned().unwrap_or_else(|| data.visible_name.clone());
            // Out-edges are named by the data node's own visible name in
            // `produces` unless a nickname overrides it for this module.
            let value = outputs
                .get(&local_name)
                .or_else(|| outputs.get(&data.visible_name))
                .ok_or_else(|| ConstellationError::NodeNotFound {
                    node_id: data.visible_name.clone(),
                    context: crate::error::ErrorContext::new(),
                })?
                .clone();
            self.values.insert(data_id, Cell::Computed(RawValue::from_cvalue(value)));
            self.resolution_sources.insert(data_id, ResolutionSource::Module);
        }
        self.module_status.insert(module_id, ModuleStatus::Completed);
        self.cascade()
    }

    /// Record a failed attempt. Returns `Some(delay)` if a retry should be
    /// scheduled (the driver awaits it and re-marks the module `Ready`),
    /// or `None` if retries are exhausted (the module is now `Failed` and
    /// its dependents `Skipped`).
    pub fn record_failure(
        &mut self,
        module_id: Uuid,
        err: ConstellationError,
        config: &EngineConfig,
    ) -> Option<Duration> {
        let opts = self.effective_options(module_id, config);
        let retry_state = self.retry_states.entry(module_id).or_default();
        retry_state.record_attempt();
        if retry_state.has_retries_left(opts.retry) {
            let attempt = retry_state.next_attempt_number();
            self.module_status.insert(module_id, ModuleStatus::Ready);
            Some(crate::executor::retry::backoff_delay(opts.backoff, opts.delay, attempt, opts.max_delay))
        } else {
            self.module_status.insert(module_id, ModuleStatus::Failed);
            if opts.on_error == OnErrorStrategy::Suppress {
                self.suppressed_failures.insert(module_id);
            }
            self.errors.push((module_id, err));
            self.skip_downstream(module_id);
            None
        }
    }

    /// Fail a module outright with no retry attempt, e.g. when it exceeds
    /// `inputsTimeout` while still queued (`spec.md` §9: queueing time
    /// counts against `inputsTimeout`, not just time spent running).
    pub fn fail_outright(&mut self, module_id: Uuid, err: ConstellationError) {
        self.module_status.insert(module_id, ModuleStatus::Failed);
        self.errors.push((module_id, err));
        self.skip_downstream(module_id);
    }

    /// Mark every module transitively downstream of `module_id`'s outputs
    /// `Skipped` (`spec.md` §4.8 step 5), unless already terminal.
    fn skip_downstream(&mut self, module_id: Uuid) {
        let frontier: Vec<Uuid> = self
            .spec
            .out_edges
            .iter()
            .filter(|(m, _)| *m == module_id)
            .map(|(_, data_id)| *data_id)
            .collect();
        self.skip_downstream_from_data(frontier);
    }

    /// Mark the module(s) directly consuming each of `frontier`'s data
    /// nodes `Skipped` and cascade transitively, the same way a module
    /// failure's `skip_downstream` does — shared so a boundary-input
    /// failure (`bind_inputs`, no producing module) can skip its
    /// consumers the same way a failed module's output does.
    fn skip_downstream_from_data(&mut self, mut frontier: Vec<Uuid>) {
        let mut visited_data: HashSet<Uuid> = HashSet::new();
        while let Some(data_id) = frontier.pop() {
            if !visited_data.insert(data_id) {
                continue;
            }
            self.values.insert(data_id, Cell::Failed);
            for (d, consuming_module) in self.spec.in_edges.clone() {
                if d != data_id {
                    continue;
                }
                if matches!(
                    self.module_status.get(&consuming_module),
                    Some(ModuleStatus::Completed) | Some(ModuleStatus::Failed)
                ) {
                    continue;
                }
                self.module_status.insert(consuming_module, ModuleStatus::Skipped);
                for (m, out_data) in &self.spec.out_edges {
                    if *m == consuming_module {
                        frontier.push(*out_data);
                    }
                }
            }
        }
    }

    /// Final outcome per `spec.md` §4.8's three-way rule, run once the
    /// driver has no more `Running`/`Ready` modules.
    pub fn determine_outcome(&self) -> RunStatus {
        let mut any_blocking_failure = false;
        let mut any_missing_for_input = false;
        let mut all_outputs_present = true;

        for data_id in self.spec.output_bindings.values() {
            if matches!(self.values.get(data_id), Some(Cell::Computed(_))) {
                continue;
            }
            all_outputs_present = false;
            match self.blocking_cause(*data_id) {
                BlockingCause::PropagatedFailure => any_blocking_failure = true,
                BlockingCause::MissingInput => any_missing_for_input = true,
                BlockingCause::Suppressed => {}
            }
        }

        if all_outputs_present {
            RunStatus::Completed
        } else if any_blocking_failure {
            RunStatus::Failed
        } else if any_missing_for_input {
            RunStatus::Suspended
        } else {
            RunStatus::Completed
        }
    }

    fn blocking_cause(&self, data_id: Uuid) -> BlockingCause {
        let mut seen = HashSet::new();
        let mut stack = vec![data_id];
        let mut saw_missing_input = false;
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            if matches!(self.values.get(&id), Some(Cell::Computed(_))) {
                continue;
            }
            let producer = self.spec.out_edges.iter().find(|(_, d)| *d == id).map(|(m, _)| *m);
            if producer.is_none() && matches!(self.values.get(&id), Some(Cell::Failed)) {
                // No producing module: this is a top-level input that
                // itself failed validation (`bind_inputs`, `DebugMode::Errors`),
                // not a merely-unprovided one.
                return BlockingCause::PropagatedFailure;
            }
            match producer {
                Some(module_id) => {
                    if matches!(self.module_status.get(&module_id), Some(ModuleStatus::Failed)) {
                        if !self.suppressed_failures.contains(&module_id) {
                            return BlockingCause::PropagatedFailure;
                        }
                    } else {
                        for (d, m) in &self.spec.in_edges {
                            if *m == module_id {
                                stack.push(*d);
                            }
                        }
                    }
                }
                None => {
                    let data = &self.spec.data[&id];
                    if let Some(transform_sources) = data.inline_transform.as_ref().map(|_| &data.transform_inputs) {
                        for src in transform_sources.values() {
                            stack.push(*src);
                        }
                    } else {
                        saw_missing_input = true;
                    }
                }
            }
        }
        if saw_missing_input {
            BlockingCause::MissingInput
        } else {
            BlockingCause::Suppressed
        }
    }

    pub fn missing_top_level_inputs(&self) -> Vec<Uuid> {
        self.spec
            .top_level_inputs()
            .into_iter()
            .filter(|id| matches!(self.values.get(id), Some(Cell::Empty) | None))
            .collect()
    }
}

enum BlockingCause {
    PropagatedFailure,
    MissingInput,
    Suppressed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::double_inc_fixture;

    #[test]
    fn bind_inputs_then_cascade_marks_double_ready() {
        let fixture = double_inc_fixture();
        let mut state = RunState::empty(Arc::new(fixture.spec), Arc::new(HashMap::new()));
        state.bind_inputs(HashMap::from([("x".to_string(), CValue::Int(3))])).unwrap();
        state.cascade().unwrap();
        assert_eq!(state.module_status[&fixture.double_module], ModuleStatus::Ready);
        assert_eq!(state.module_status[&fixture.inc_module], ModuleStatus::Pending);
    }

    #[test]
    fn apply_success_cascades_to_next_module() {
        let fixture = double_inc_fixture();
        let mut state = RunState::empty(Arc::new(fixture.spec), Arc::new(HashMap::new()));
        state.bind_inputs(HashMap::from([("x".to_string(), CValue::Int(3))])).unwrap();
        state.cascade().unwrap();
        state
            .apply_success(fixture.double_module, HashMap::from([("y".to_string(), CValue::Int(6))]))
            .unwrap();
        assert_eq!(state.module_status[&fixture.inc_module], ModuleStatus::Ready);
        assert!(matches!(state.values[&fixture.y], Cell::Computed(_)));
    }

    #[test]
    fn missing_input_yields_missing_top_level_list() {
        let fixture = double_inc_fixture();
        let state = RunState::empty(Arc::new(fixture.spec), Arc::new(HashMap::new()));
        assert_eq!(state.missing_top_level_inputs(), vec![fixture.x]);
    }

    #[test]
    fn outcome_is_suspended_when_input_missing() {
        let fixture = double_inc_fixture();
        let state = RunState::empty(Arc::new(fixture.spec), Arc::new(HashMap::new()));
        assert_eq!(state.determine_outcome(), RunStatus::Suspended);
    }

    #[test]
    fn outcome_is_completed_when_all_outputs_present() {
        let fixture = double_inc_fixture();
        let mut state = RunState::empty(Arc::new(fixture.spec), Arc::new(HashMap::new()));
        state.bind_inputs(HashMap::from([("x".to_string(), CValue::Int(3))])).unwrap();
        state.cascade().unwrap();
        state
            .apply_success(fixture.double_module, HashMap::from([("y".to_string(), CValue::Int(6))]))
            .unwrap();
        state.apply_success(fixture.inc_module, HashMap::from([("z".to_string(), CValue::Int(7))])).unwrap();
        assert_eq!(state.determine_outcome(), RunStatus::Completed);
    }

    #[test]
    fn bind_inputs_under_full_debug_mode_rejects_type_mismatch() {
        let fixture = double_inc_fixture();
        let mut state = RunState::empty(Arc::new(fixture.spec), Arc::new(HashMap::new()));
        state.debug_mode = DebugMode::Full;
        let err = state.bind_inputs(HashMap::from([("x".to_string(), CValue::Bool(true))])).unwrap_err();
        assert_eq!(err.error_code(), "INPUT_TYPE_MISMATCH");
    }

    #[test]
    fn bind_inputs_under_errors_debug_mode_fails_without_running_modules() {
        let fixture = double_inc_fixture();
        let mut state = RunState::empty(Arc::new(fixture.spec), Arc::new(HashMap::new()));
        assert_eq!(state.debug_mode, DebugMode::Errors);
        state.bind_inputs(HashMap::from([("x".to_string(), CValue::Bool(true))])).unwrap();
        state.cascade().unwrap();
        assert_eq!(state.module_status[&fixture.double_module], ModuleStatus::Skipped);
        assert_eq!(state.module_status[&fixture.inc_module], ModuleStatus::Skipped);
        assert_eq!(state.errors.len(), 1);
        assert_eq!(state.errors[0].1.error_code(), "INPUT_TYPE_MISMATCH");
        assert_eq!(state.determine_outcome(), RunStatus::Failed);
    }

    #[test]
    fn bind_inputs_under_off_debug_mode_skips_the_check() {
        let fixture = double_inc_fixture();
        let mut state = RunState::empty(Arc::new(fixture.spec), Arc::new(HashMap::new()));
        state.debug_mode = DebugMode::Off;
        state.bind_inputs(HashMap::from([("x".to_string(), CValue::Bool(true))])).unwrap();
        assert!(matches!(state.values[&fixture.x], Cell::Computed(_)));
        assert!(state.errors.is_empty());
    }

    #[test]
    fn exhausted_retry_fails_module_and_skips_downstream() {
        let fixture = double_inc_fixture();
        let config = EngineConfig::default();
        let mut state = RunState::empty(Arc::new(fixture.spec), Arc::new(HashMap::new()));
        state.bind_inputs(HashMap::from([("x".to_string(), CValue::Int(3))])).unwrap();
        state.cascade().unwrap();
        let err = ConstellationError::module_execution("double", "boom");
        let delay = state.record_failure(fixture.double_module, err, &config);
        assert!(delay.is_none());
        assert_eq!(state.module_status[&fixture.double_module], ModuleStatus::Failed);
        assert_eq!(state.module_status[&fixture.inc_module], ModuleStatus::Skipped);
        assert_eq!(state.determine_outcome(), RunStatus::Failed);
    }

    #[test]
    fn retry_with_budget_returns_backoff_and_stays_ready() {
        let fixture = double_inc_fixture();
        let mut options = HashMap::new();
        options.insert(fixture.double_module, ModuleCallOptions { retry: Some(2), ..Default::default() });
        let config = EngineConfig::default();
        let mut state = RunState::empty(Arc::new(fixture.spec), Arc::new(options));
        state.bind_inputs(HashMap::from([("x".to_string(), CValue::Int(3))])).unwrap();
        state.cascade().unwrap();
        let err = ConstellationError::module_execution("double", "boom");
        let delay = state.record_failure(fixture.double_module, err, &config);
        assert!(delay.is_some());
        assert_eq!(state.module_status[&fixture.double_module], ModuleStatus::Ready);
    }
}
