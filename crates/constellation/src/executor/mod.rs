//! Runtime Scheduler & Executor (`spec.md` §4.8, C8).
//!
//! `drive` is the single driver task `spec.md` §5 describes: all state
//! mutation happens here, between `await` points, so `RunState` never
//! needs its own locking. The only suspension points are awaiting a
//! module's completion and awaiting a retry's backoff delay, matching
//! the two named in `spec.md` §5. Dispatch of concurrent module tasks
//! happens through a `tokio::task::JoinSet`; readiness, retries and
//! outcome classification live in `scheduler`, kept pure of tokio so
//! they can be unit-tested without an executor.

pub mod retry;
pub mod scheduler;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinSet;
use uuid::Uuid;

use crate::canonical::assign_canonical_indices;
use crate::config::EngineConfig;
use crate::error::{ConstellationError, Result};
use crate::registry::{CancellationToken, ModuleContext, ModuleImpl};
use crate::value::CValue;

pub use scheduler::{Cell, EffectiveOptions, ModuleStatus, ResolutionSource, RunState, RunStatus};

/// The executor's raw result, before `report` turns it into a
/// `DataSignature` (`spec.md` §4.11). Kept separate from the public
/// report shape so the driver doesn't need to know about
/// `ExecutionOptions` flags.
#[derive(Debug)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub values: HashMap<Uuid, Cell>,
    pub resolution_sources: HashMap<Uuid, ResolutionSource>,
    pub module_status: HashMap<Uuid, ModuleStatus>,
    pub errors: Vec<(Uuid, ConstellationError)>,
    pub node_timings: HashMap<Uuid, Duration>,
    pub missing_inputs: Vec<Uuid>,
    pub total_duration: Duration,
    pub resumption_count: u32,
}

type ModuleCallResult = (Uuid, std::result::Result<(HashMap<String, CValue>, Duration), ConstellationError>);

/// Run `state` to completion against `modules`, honoring per-module
/// priority, concurrency, throttle, timeout and retry policy. Shared by
/// both fresh runs (`RunState::init_fresh`-produced state) and resumed
/// ones (`RunState::init_resumed`-produced state) — the driver doesn't
/// distinguish the two.
pub async fn drive(
    mut state: RunState,
    modules: Arc<HashMap<Uuid, Arc<dyn ModuleImpl>>>,
    config: &EngineConfig,
    cancellation: CancellationToken,
    deadline: Option<Instant>,
) -> Result<RunOutcome> {
    let indices = assign_canonical_indices(&state.spec)?;
    let mut running: JoinSet<ModuleCallResult> = JoinSet::new();
    let mut running_by_name: HashMap<String, usize> = HashMap::new();
    let mut dispatch_log: HashMap<String, VecDeque<Instant>> = HashMap::new();
    let mut ready_since: HashMap<Uuid, Instant> = HashMap::new();
    let mut node_timings: HashMap<Uuid, Duration> = HashMap::new();
    let start = Instant::now();

    loop {
        if let Some(dl) = deadline {
            if Instant::now() >= dl {
                tracing::warn!("run deadline exceeded, cancelling outstanding modules");
                cancellation.cancel();
            }
        }

        for (id, status) in state.module_status.iter() {
            if matches!(status, ModuleStatus::Ready) {
                ready_since.entry(*id).or_insert_with(Instant::now);
            }
        }

        if !cancellation.is_cancelled() {
            let mut candidates: Vec<Uuid> = state
                .module_status
                .iter()
                .filter(|(_, s)| matches!(s, ModuleStatus::Ready))
                .map(|(id, _)| *id)
                .collect();
            candidates.sort_by_key(|id| {
                let opts = state.effective_options(*id, config);
                let (rank, tie) = opts.priority.sort_key();
                (std::cmp::Reverse(rank), std::cmp::Reverse(tie), indices.module_index[id])
            });

            let mut timed_out_in_queue = Vec::new();
            for module_id in candidates {
                if running.len() >= config.worker_pool_size {
                    break;
                }
                let opts = state.effective_options(module_id, config);
                if let Some(since) = ready_since.get(&module_id) {
                    if since.elapsed() > opts.inputs_timeout {
                        timed_out_in_queue.push(module_id);
                        continue;
                    }
                }
                let node_name = state.spec.modules[&module_id].name.clone();
                if let Some(limit) = opts.concurrency_limit {
                    if *running_by_name.get(&node_name).unwrap_or(&0) >= limit {
                        continue;
                    }
                }
                if let (Some(count), Some(window)) = (opts.throttle_count, opts.throttle_window) {
                    let log = dispatch_log.entry(node_name.clone()).or_default();
                    while let Some(&front) = log.front() {
                        if front.elapsed() > window {
                            log.pop_front();
                        } else {
                            break;
                        }
                    }
                    if log.len() as u32 >= count {
                        continue;
                    }
                    log.push_back(Instant::now());
                }

                let module_impl = match modules.get(&module_id).cloned() {
                    Some(m) => m,
                    None => {
                        state.fail_outright(module_id, ConstellationError::module_not_found(node_name));
                        continue;
                    }
                };

                tracing::debug!(module = %node_name, "dispatching module");
                state.module_status.insert(module_id, ModuleStatus::Running);
                ready_since.remove(&module_id);
                *running_by_name.entry(node_name).or_insert(0) += 1;
                let call_inputs = state.gather_inputs(module_id)?;
                let ctx = ModuleContext { cancellation: cancellation.child_token(), deadline };
                let call_timeout = opts.module_timeout;
                running.spawn(async move {
                    let started = Instant::now();
                    let outcome = tokio::time::timeout(call_timeout, module_impl.call(call_inputs, &ctx)).await;
                    let result = match outcome {
                        Ok(inner) => inner.map(|outputs| (outputs, started.elapsed())),
                        Err(_) => {
                            tracing::warn!(
                                module = %module_impl.name(),
                                timeout_ms = call_timeout.as_millis() as u64,
                                "module call exceeded its timeout"
                            );
                            Err(ConstellationError::module_execution(
                                module_impl.name().to_string(),
                                "module call exceeded its timeout",
                            ))
                        }
                    };
                    (module_id, result)
                });
            }

            for module_id in timed_out_in_queue {
                let node_name = state.spec.modules[&module_id].name.clone();
                tracing::warn!(module = %node_name, "inputs timeout exceeded while queued for dispatch");
                let err = ConstellationError::module_execution(
                    node_name,
                    "inputs timeout exceeded while queued for dispatch",
                );
                state.fail_outright(module_id, err);
            }
            state.cascade()?;
        }

        if running.is_empty() {
            break;
        }

        let Some(joined) = running.join_next().await else {
            break;
        };
        match joined {
            Ok((module_id, result)) => {
                let node_name = state.spec.modules[&module_id].name.clone();
                if let Some(count) = running_by_name.get_mut(&node_name) {
                    *count = count.saturating_sub(1);
                }
                match result {
                    Ok((outputs, elapsed)) => {
                        tracing::debug!(module = %node_name, elapsed_ms = elapsed.as_millis() as u64, "module completed");
                        node_timings.insert(module_id, elapsed);
                        state.apply_success(module_id, outputs)?;
                    }
                    Err(err) => {
                        if let Some(delay) = state.record_failure(module_id, err, config) {
                            tracing::warn!(module = %node_name, delay_ms = delay.as_millis() as u64, "module failed, retrying after backoff");
                            if !cancellation.is_cancelled() {
                                tokio::time::sleep(delay).await;
                            }
                            if cancellation.is_cancelled() {
                                state.fail_outright(
                                    module_id,
                                    ConstellationError::module_execution(node_name, "run cancelled during backoff"),
                                );
                            }
                        } else {
                            tracing::error!(module = %node_name, "module failed, retries exhausted");
                        }
                        state.cascade()?;
                    }
                }
            }
            Err(join_err) => {
                return Err(ConstellationError::module_execution("unknown", join_err.to_string()));
            }
        }
    }

    let total_duration = start.elapsed();
    let mut status = state.determine_outcome();
    if cancellation.is_cancelled() && !matches!(status, RunStatus::Completed) {
        status = RunStatus::Failed;
    }
    let missing_inputs = state.missing_top_level_inputs();

    Ok(RunOutcome {
        status,
        values: state.values,
        resolution_sources: state.resolution_sources,
        module_status: state.module_status,
        errors: state.errors,
        node_timings,
        missing_inputs,
        total_duration,
        resumption_count: state.resumption_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{double_inc_fixture, double_module, inc_module, FailingModule};

    fn registry_map(fixture_double: Uuid, fixture_inc: Uuid) -> Arc<HashMap<Uuid, Arc<dyn ModuleImpl>>> {
        let mut map: HashMap<Uuid, Arc<dyn ModuleImpl>> = HashMap::new();
        map.insert(fixture_double, Arc::new(double_module()));
        map.insert(fixture_inc, Arc::new(inc_module()));
        Arc::new(map)
    }

    #[tokio::test]
    async fn full_run_completes_and_produces_declared_output() {
        let fixture = double_inc_fixture();
        let modules = registry_map(fixture.double_module, fixture.inc_module);
        let mut state = RunState::empty(Arc::new(fixture.spec), Arc::new(HashMap::new()));
        state.bind_inputs(HashMap::from([("x".to_string(), CValue::Int(3))])).unwrap();
        state.cascade().unwrap();

        let config = EngineConfig::default();
        let outcome = drive(state, modules, &config, CancellationToken::new(), None).await.unwrap();

        assert_eq!(outcome.status, RunStatus::Completed);
        let z = outcome.values.get(&fixture.z).unwrap();
        assert!(matches!(z, Cell::Computed(_)));
        assert_eq!(outcome.node_timings.len(), 2);
    }

    #[tokio::test]
    async fn missing_input_yields_suspended_outcome() {
        let fixture = double_inc_fixture();
        let modules = registry_map(fixture.double_module, fixture.inc_module);
        let state = RunState::empty(Arc::new(fixture.spec), Arc::new(HashMap::new()));

        let config = EngineConfig::default();
        let outcome = drive(state, modules, &config, CancellationToken::new(), None).await.unwrap();

        assert_eq!(outcome.status, RunStatus::Suspended);
        assert_eq!(outcome.missing_inputs, vec![fixture.x]);
    }

    #[tokio::test]
    async fn retries_exhaust_into_failed_outcome() {
        let fixture = double_inc_fixture();
        let mut modules: HashMap<Uuid, Arc<dyn ModuleImpl>> = HashMap::new();
        modules.insert(
            fixture.double_module,
            Arc::new(FailingModule::new("double", 10, |_| Ok(HashMap::new()))),
        );
        modules.insert(fixture.inc_module, Arc::new(inc_module()));
        let modules = Arc::new(modules);

        let mut options = HashMap::new();
        options.insert(
            fixture.double_module,
            crate::dag::ModuleCallOptions {
                retry: Some(1),
                delay: Some(Duration::from_millis(1)),
                ..Default::default()
            },
        );

        let mut state = RunState::empty(Arc::new(fixture.spec), Arc::new(options));
        state.bind_inputs(HashMap::from([("x".to_string(), CValue::Int(3))])).unwrap();
        state.cascade().unwrap();

        let config = EngineConfig::default();
        let outcome = drive(state, modules, &config, CancellationToken::new(), None).await.unwrap();

        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.module_status[&fixture.double_module], ModuleStatus::Failed);
        assert_eq!(outcome.module_status[&fixture.inc_module], ModuleStatus::Skipped);
        assert_eq!(outcome.errors.len(), 1);
    }

    #[tokio::test]
    async fn retry_then_success_completes() {
        let fixture = double_inc_fixture();
        let mut modules: HashMap<Uuid, Arc<dyn ModuleImpl>> = HashMap::new();
        modules.insert(
            fixture.double_module,
            Arc::new(FailingModule::new("double", 1, |inputs| {
                let x = match inputs.get("x") {
                    Some(CValue::Int(n)) => *n,
                    _ => 0,
                };
                Ok(HashMap::from([("y".to_string(), CValue::Int(x * 2))]))
            })),
        );
        modules.insert(fixture.inc_module, Arc::new(inc_module()));
        let modules = Arc::new(modules);

        let mut options = HashMap::new();
        options.insert(
            fixture.double_module,
            crate::dag::ModuleCallOptions {
                retry: Some(2),
                delay: Some(Duration::from_millis(1)),
                ..Default::default()
            },
        );

        let mut state = RunState::empty(Arc::new(fixture.spec), Arc::new(options));
        state.bind_inputs(HashMap::from([("x".to_string(), CValue::Int(3))])).unwrap();
        state.cascade().unwrap();

        let config = EngineConfig::default();
        let outcome = drive(state, modules, &config, CancellationToken::new(), None).await.unwrap();

        assert_eq!(outcome.status, RunStatus::Completed);
        assert!(matches!(outcome.values[&fixture.z], Cell::Computed(_)));
    }
}
