//! Primary API (`spec.md` §6).
//!
//! `Engine` bundles the shared, read-mostly collaborators — module
//! registry, pipeline image store, suspension store, resume guard — behind
//! the handful of entry points an embedder calls: register modules, run a
//! pipeline, resume a suspended one. Per-run state never crosses this
//! boundary except as a `SuspendedExecution` snapshot.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::Instrument;
use uuid::Uuid;

use crate::canonical::structural_hash;
use crate::config::EngineConfig;
use crate::dag::DagSpec;
use crate::error::{ConstellationError, Result};
use crate::executor::{self};
use crate::registry::{CancellationToken, ModuleImpl, ModuleRegistry};
use crate::report::{build_report, ExecutionOptions};
use crate::store::{LoadedPipeline, PipelineImage, PipelineImageStore};
use crate::suspension::{ResumeGuard, SuspendedExecution};
use crate::synthetic;
use crate::value::CValue;

pub use crate::report::DataSignature;
pub use crate::executor::scheduler::RunState;

/// Per-call options: which `SignatureMetadata` sections to populate, and an
/// optional wall-clock budget for the whole run (`spec.md` §4.8 main loop:
/// the driver checks a deadline once per iteration).
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub report: ExecutionOptions,
    pub deadline: Option<Duration>,
}

/// In-memory suspension store (`spec.md` §6: `save`/`load`/`delete`/`list`).
/// Keyed by the execution id's string form, matching `store.rs`'s content-
/// addressed-by-a-stable-key shape.
#[derive(Default)]
pub struct SuspensionStore {
    snapshots: DashMap<String, SuspendedExecution>,
}

impl SuspensionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save(&self, snapshot: SuspendedExecution) -> String {
        let handle = snapshot.execution_id.to_string();
        tracing::debug!(execution_id = %handle, structural_hash = %snapshot.structural_hash, "saving suspended execution");
        self.snapshots.insert(handle.clone(), snapshot);
        handle
    }

    pub fn load(&self, handle: &str) -> Option<SuspendedExecution> {
        let found = self.snapshots.get(handle).map(|entry| entry.value().clone());
        if found.is_none() {
            tracing::warn!(execution_id = %handle, "no suspended execution found for handle");
        }
        found
    }

    pub fn delete(&self, handle: &str) -> bool {
        self.snapshots.remove(handle).is_some()
    }

    /// Handles of snapshots matching `filter`, sorted for determinism.
    pub fn list(&self, filter: impl Fn(&SuspendedExecution) -> bool) -> Vec<String> {
        let mut handles: Vec<String> =
            self.snapshots.iter().filter(|e| filter(e.value())).map(|e| e.key().clone()).collect();
        handles.sort();
        handles
    }
}

pub struct Engine {
    pub registry: ModuleRegistry,
    pub images: PipelineImageStore,
    pub suspensions: SuspensionStore,
    config: EngineConfig,
    resume_guard: ResumeGuard,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            registry: ModuleRegistry::new(),
            images: PipelineImageStore::new(),
            suspensions: SuspensionStore::new(),
            config,
            resume_guard: ResumeGuard::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn register_module(&self, module: Arc<dyn ModuleImpl>) {
        self.registry.register(module);
    }

    pub fn remove_module(&self, name: &str) -> bool {
        self.registry.deregister(name)
    }

    pub fn list_modules(&self) -> Vec<String> {
        self.registry.list()
    }

    /// Rehydrate a stored `PipelineImage` into a `LoadedPipeline`, running
    /// the one-time defensive acyclicity check (`SPEC_FULL.md` §5) and
    /// reconstructing synthetic built-ins (`spec.md` §4.7).
    pub fn load(&self, image: PipelineImage) -> Result<LoadedPipeline> {
        image.spec.validate()?;
        let synthetic_modules = Arc::new(synthetic::materialize(&image.spec));
        Ok(LoadedPipeline { image, synthetic_modules })
    }

    /// Resolve `reference` to a stored image: a `sha256:`-prefixed
    /// structural hash, or an alias name (`spec.md` §6).
    pub fn resolve_image(&self, reference: &str) -> Result<PipelineImage> {
        let hash = if reference.starts_with("sha256:") {
            reference.to_string()
        } else {
            self.images
                .resolve(reference)
                .ok_or_else(|| ConstellationError::PipelineNotFound {
                    reference: reference.to_string(),
                    context: crate::error::ErrorContext::new(),
                })?
        };
        self.images.get(&hash).ok_or_else(|| ConstellationError::PipelineNotFound {
            reference: reference.to_string(),
            context: crate::error::ErrorContext::new(),
        })
    }

    pub async fn run(
        &self,
        loaded: &LoadedPipeline,
        inputs: HashMap<String, CValue>,
        options: RunOptions,
    ) -> Result<DataSignature> {
        let execution_id = Uuid::new_v4();
        self.run_inner(execution_id, loaded, inputs, options, 0).await
    }

    /// `run(ref, inputs, options)` (`spec.md` §6): resolve then run.
    pub async fn run_ref(
        &self,
        reference: &str,
        inputs: HashMap<String, CValue>,
        options: RunOptions,
    ) -> Result<DataSignature> {
        let image = self.resolve_image(reference)?;
        let loaded = self.load(image)?;
        self.run(&loaded, inputs, options).await
    }

    /// `resumeFromStore(handle, additionalInputs, resolvedNodes, options)`
    /// (`spec.md` §6). `loaded` is the pipeline version to resume against —
    /// the caller resolves it the same way `run_ref` does, so a
    /// `PipelineChangedError` reflects the structural hash actually in
    /// force now, not merely the snapshot echoing its own hash back at
    /// itself. (`SPEC_FULL.md`/open question in `spec.md` §9: the
    /// signature doesn't name this explicitly, so this is a recorded
    /// design decision, not a literal transcription.)
    pub async fn resume_from_store(
        &self,
        handle: &str,
        loaded: &LoadedPipeline,
        additional_inputs: HashMap<String, CValue>,
        resolved_nodes: HashMap<String, CValue>,
        options: RunOptions,
    ) -> Result<DataSignature> {
        let snapshot = self.suspensions.load(handle).ok_or_else(|| ConstellationError::PipelineNotFound {
            reference: handle.to_string(),
            context: crate::error::ErrorContext::new(),
        })?;
        let execution_id = snapshot.execution_id;
        let span = tracing::info_span!(
            "run",
            %execution_id,
            structural_hash = %loaded.image.structural_hash,
            resumption_count = snapshot.resumption_count + 1,
        );
        async move {
            let lease = self.resume_guard.acquire(execution_id)?;

            let state = crate::suspension::resume_state(
                &snapshot,
                &loaded.image.structural_hash,
                additional_inputs,
                resolved_nodes,
                &self.config,
            )?;

            let modules = self.registry.init_modules(&loaded.image.spec, &loaded.synthetic_modules)?;
            let cancellation = CancellationToken::new();
            let deadline = options.deadline.map(|d| std::time::Instant::now() + d);
            tracing::debug!("resuming suspended execution");
            let outcome = executor::drive(state, Arc::new(modules), &self.config, cancellation, deadline).await?;
            drop(lease);

            self.finish(execution_id, &loaded.image.spec, &loaded.image.module_options, &loaded.image.structural_hash, snapshot.provided_inputs.clone(), outcome, options)
        }
        .instrument(span)
        .await
    }

    async fn run_inner(
        &self,
        execution_id: Uuid,
        loaded: &LoadedPipeline,
        inputs: HashMap<String, CValue>,
        options: RunOptions,
        resumption_count: u32,
    ) -> Result<DataSignature> {
        let span = tracing::info_span!(
            "run",
            %execution_id,
            structural_hash = %loaded.image.structural_hash,
            resumption_count,
        );
        async move {
            let spec = loaded.image.spec.clone();
            let module_options = loaded.image.module_options.clone();
            let modules = self.registry.init_modules(&spec, &loaded.synthetic_modules)?;

            let mut state = RunState::empty(spec.clone(), module_options.clone());
            state.resumption_count = resumption_count;
            state.debug_mode = self.config.debug_mode;
            state.bind_inputs(inputs.clone())?;
            state.cascade()?;

            let cancellation = CancellationToken::new();
            let deadline = options.deadline.map(|d| std::time::Instant::now() + d);
            let outcome = executor::drive(state, Arc::new(modules), &self.config, cancellation, deadline).await?;

            self.finish(execution_id, &spec, &module_options, &loaded.image.structural_hash, inputs, outcome, options)
        }
        .instrument(span)
        .await
    }

    fn finish(
        &self,
        execution_id: Uuid,
        spec: &DagSpec,
        module_options: &HashMap<Uuid, crate::dag::ModuleCallOptions>,
        hash: &str,
        provided_inputs: HashMap<String, CValue>,
        outcome: executor::RunOutcome,
        options: RunOptions,
    ) -> Result<DataSignature> {
        match outcome.status {
            executor::RunStatus::Completed => {
                tracing::debug!(%execution_id, "run completed");
            }
            executor::RunStatus::Suspended => {
                tracing::warn!(%execution_id, missing_inputs = outcome.missing_inputs.len(), "run suspended on missing inputs");
            }
            executor::RunStatus::Failed => {
                tracing::error!(%execution_id, errors = outcome.errors.len(), "run failed");
            }
        }
        let suspended = if matches!(outcome.status, executor::RunStatus::Completed) {
            None
        } else {
            Some(SuspendedExecution::capture(
                execution_id,
                spec,
                module_options,
                hash.to_string(),
                provided_inputs,
                &outcome,
            )?)
        };
        build_report(outcome, spec, options.report, suspended)
    }
}

/// Compute the `PipelineImage` for a freshly compiled `DagSpec`, storing it
/// under its structural hash (`spec.md` §4.5).
pub fn compile_and_store(
    store: &PipelineImageStore,
    spec: DagSpec,
    module_options: HashMap<Uuid, crate::dag::ModuleCallOptions>,
    syntactic_hash: Option<String>,
    source_hash: Option<String>,
) -> Result<PipelineImage> {
    spec.validate()?;
    let hash = structural_hash(&spec, &module_options)?;
    tracing::debug!(pipeline = %spec.name, structural_hash = %hash, "compiled pipeline spec");
    let image = PipelineImage {
        structural_hash: hash,
        syntactic_hash,
        spec: Arc::new(spec),
        module_options: Arc::new(module_options),
        compiled_at: chrono::Utc::now(),
        source_hash,
    };
    store.store(image.clone());
    Ok(image)
}
