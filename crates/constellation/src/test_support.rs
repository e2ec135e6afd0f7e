//! Test doubles and fixture builders shared across this crate's unit and
//! integration tests (`SPEC_FULL.md` §4, Test Tooling). Not part of the
//! public API surface consumed by embedders; gated behind `cfg(test)` /
//! the `test-support` feature so integration tests in `tests/` can reuse
//! the same fixtures instead of rebuilding them per file.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::dag::{DagSpec, DataNodeSpec, ModuleNodeSpec};
use crate::error::{ConstellationError, Result};
use crate::registry::{ModuleContext, ModuleImpl};
use crate::types::CType;
use crate::value::CValue;

/// Wraps a plain closure as a `ModuleImpl`. The closure runs synchronously;
/// `call` just awaits nothing around it, which is enough for scheduler and
/// registry tests that don't exercise real concurrency.
pub struct FnModule<F>
where
    F: Fn(&HashMap<String, CValue>) -> Result<HashMap<String, CValue>> + Send + Sync,
{
    name: String,
    f: F,
    call_count: AtomicUsize,
}

impl<F> FnModule<F>
where
    F: Fn(&HashMap<String, CValue>) -> Result<HashMap<String, CValue>> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self { name: name.into(), f, call_count: AtomicUsize::new(0) }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }
}

impl FnModule<fn(&HashMap<String, CValue>) -> Result<HashMap<String, CValue>>> {
    /// A module with no inputs or outputs, useful wherever a registry only
    /// needs a name to resolve against and never actually gets called.
    pub fn identity(name: impl Into<String>) -> Self {
        fn noop(_inputs: &HashMap<String, CValue>) -> Result<HashMap<String, CValue>> {
            Ok(HashMap::new())
        }
        FnModule::new(name, noop)
    }
}

#[async_trait]
impl<F> ModuleImpl for FnModule<F>
where
    F: Fn(&HashMap<String, CValue>) -> Result<HashMap<String, CValue>> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(
        &self,
        inputs: HashMap<String, CValue>,
        _ctx: &ModuleContext,
    ) -> Result<HashMap<String, CValue>> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        (self.f)(&inputs)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Fails its first `fail_times` invocations with a `ModuleExecution` error,
/// then delegates to `then`. Used to exercise retry/backoff monotonicity
/// (`spec.md` §8, "retries are observed in order with non-decreasing
/// delay").
pub struct FailingModule<F>
where
    F: Fn(&HashMap<String, CValue>) -> Result<HashMap<String, CValue>> + Send + Sync,
{
    name: String,
    fail_times: usize,
    attempts: AtomicUsize,
    then: F,
}

impl<F> FailingModule<F>
where
    F: Fn(&HashMap<String, CValue>) -> Result<HashMap<String, CValue>> + Send + Sync,
{
    pub fn new(name: impl Into<String>, fail_times: usize, then: F) -> Self {
        Self { name: name.into(), fail_times, attempts: AtomicUsize::new(0), then }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<F> ModuleImpl for FailingModule<F>
where
    F: Fn(&HashMap<String, CValue>) -> Result<HashMap<String, CValue>> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(
        &self,
        inputs: HashMap<String, CValue>,
        _ctx: &ModuleContext,
    ) -> Result<HashMap<String, CValue>> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.fail_times {
            return Err(ConstellationError::module_execution(
                self.name.clone(),
                format!("synthetic failure on attempt {attempt}"),
            ));
        }
        (self.then)(&inputs)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Node ids for the canonical two-module `double`/`inc` fixture pipeline
/// used across S1-S3 (`spec.md` §8): `x -> double -> y -> inc -> z`.
pub struct DoubleIncFixture {
    pub x: Uuid,
    pub double_module: Uuid,
    pub y: Uuid,
    pub inc_module: Uuid,
    pub z: Uuid,
    pub spec: DagSpec,
}

/// Builds `x: Int -> [double] -> y: Int -> [inc] -> z: Int`, with `z`
/// declared as the sole output.
pub fn double_inc_fixture() -> DoubleIncFixture {
    let x = Uuid::new_v4();
    let y = Uuid::new_v4();
    let z = Uuid::new_v4();
    let double_module = Uuid::new_v4();
    let inc_module = Uuid::new_v4();

    let modules = BTreeMap::from([
        (
            double_module,
            ModuleNodeSpec {
                id: double_module,
                name: "double".to_string(),
                version: "1.0.0".to_string(),
                tags: vec![],
                consumes: BTreeMap::from([("x".to_string(), CType::Int)]),
                produces: BTreeMap::from([("y".to_string(), CType::Int)]),
                inputs_timeout: None,
                module_timeout: None,
                definition_context: None,
            },
        ),
        (
            inc_module,
            ModuleNodeSpec {
                id: inc_module,
                name: "inc".to_string(),
                version: "1.0.0".to_string(),
                tags: vec![],
                consumes: BTreeMap::from([("y".to_string(), CType::Int)]),
                produces: BTreeMap::from([("z".to_string(), CType::Int)]),
                inputs_timeout: None,
                module_timeout: None,
                definition_context: None,
            },
        ),
    ]);

    let data = BTreeMap::from([
        (x, data_node(x, "x", CType::Int)),
        (y, data_node(y, "y", CType::Int)),
        (z, data_node(z, "z", CType::Int)),
    ]);

    let spec = DagSpec {
        name: "double_inc".to_string(),
        version: "1.0.0".to_string(),
        modules,
        data,
        in_edges: vec![(x, double_module), (y, inc_module)],
        out_edges: vec![(double_module, y), (inc_module, z)],
        declared_outputs: vec!["z".to_string()],
        output_bindings: BTreeMap::from([("z".to_string(), z)]),
    };

    DoubleIncFixture { x, double_module, y, inc_module, z, spec }
}

fn data_node(id: Uuid, visible_name: &str, ty: CType) -> DataNodeSpec {
    DataNodeSpec {
        id,
        visible_name: visible_name.to_string(),
        nicknames: HashMap::new(),
        ty,
        inline_transform: None,
        transform_inputs: BTreeMap::new(),
    }
}

/// A `double` implementation: `y = x * 2`, errors if `x` is missing or not
/// an `Int`.
pub fn double_module() -> FnModule<impl Fn(&HashMap<String, CValue>) -> Result<HashMap<String, CValue>> + Send + Sync> {
    FnModule::new("double", |inputs| {
        let x = match inputs.get("x") {
            Some(CValue::Int(n)) => *n,
            Some(other) => {
                return Err(ConstellationError::input_type_mismatch("x", CType::Int, other.type_of()))
            }
            None => {
                return Err(ConstellationError::InputValidation {
                    message: "missing input `x`".to_string(),
                    context: crate::error::ctx_pairs(&[]),
                })
            }
        };
        Ok(HashMap::from([("y".to_string(), CValue::Int(x * 2))]))
    })
}

/// An `inc` implementation: `z = y + 1`.
pub fn inc_module() -> FnModule<impl Fn(&HashMap<String, CValue>) -> Result<HashMap<String, CValue>> + Send + Sync> {
    FnModule::new("inc", |inputs| {
        let y = match inputs.get("y") {
            Some(CValue::Int(n)) => *n,
            Some(other) => {
                return Err(ConstellationError::input_type_mismatch("y", CType::Int, other.type_of()))
            }
            None => {
                return Err(ConstellationError::InputValidation {
                    message: "missing input `y`".to_string(),
                    context: crate::error::ctx_pairs(&[]),
                })
            }
        };
        Ok(HashMap::from([("z".to_string(), CValue::Int(y + 1))]))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn double_module_doubles_its_input() {
        let module = double_module();
        let ctx = ModuleContext { cancellation: crate::registry::CancellationToken::new(), deadline: None };
        let out = module.call(HashMap::from([("x".to_string(), CValue::Int(4))]), &ctx).await.unwrap();
        assert_eq!(out.get("y"), Some(&CValue::Int(8)));
    }

    #[tokio::test]
    async fn failing_module_succeeds_after_exhausting_failures() {
        let module = FailingModule::new("flaky", 2, |_inputs| {
            Ok(HashMap::from([("done".to_string(), CValue::Bool(true))]))
        });
        let ctx = ModuleContext { cancellation: crate::registry::CancellationToken::new(), deadline: None };
        assert!(module.call(HashMap::new(), &ctx).await.is_err());
        assert!(module.call(HashMap::new(), &ctx).await.is_err());
        assert!(module.call(HashMap::new(), &ctx).await.is_ok());
        assert_eq!(module.attempts(), 3);
    }

    #[test]
    fn double_inc_fixture_is_acyclic_and_validates() {
        let fixture = double_inc_fixture();
        assert!(fixture.spec.validate().is_ok());
    }
}
