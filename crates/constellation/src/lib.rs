//! Constellation: a typed dataflow execution engine for DAGs of typed
//! modules and data nodes (`spec.md` / `SPEC_FULL.md`).
//!
//! Module layout mirrors the component map in `SPEC_FULL.md` §6: the
//! type algebra and value representation (`types`, `value`) sit at the
//! bottom, `dag` describes the immutable graph shape, `canonical` and
//! `store` give pipelines stable identity, `registry` and `synthetic`
//! resolve module implementations, `executor` drives a run, `suspension`
//! freezes and thaws one, `report` turns the result into the public
//! response shape, and `api` wires all of it into the embedder-facing
//! `Engine`.

pub mod api;
pub mod canonical;
pub mod config;
pub mod dag;
pub mod error;
pub mod executor;
pub mod json_boundary;
pub mod registry;
pub mod report;
pub mod store;
pub mod suspension;
pub mod synthetic;
pub mod transform;
pub mod types;
pub mod value;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use api::{Engine, RunOptions, SuspensionStore};
pub use config::{DebugMode, EngineConfig};
pub use dag::{
    BackoffStrategy, DagSpec, DataNodeSpec, ModuleCallOptions, ModuleNodeSpec, NamedPriority,
    OnErrorStrategy, Priority,
};
pub use error::{ConstellationError, ErrorCategory, Result};
pub use report::{DataSignature, ExecutionOptions, SignatureMetadata};
pub use store::{LoadedPipeline, PipelineImage, PipelineImageStore};
pub use types::CType;
pub use value::{CValue, RawValue};
