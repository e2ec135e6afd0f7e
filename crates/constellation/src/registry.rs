//! Module Registry (`spec.md` §4.6, C6).
//!
//! A name → implementation map. `initModules` binds every module UUID
//! referenced by a `DagSpec` to a concrete implementation by name, failing
//! with `ModuleNotFoundError` if any reference is unresolved. The
//! `ModuleImpl` trait itself is grounded on the teacher's `Node<State>`
//! trait (`execute`/`name`/`as_any`/`as_any_mut`), generalized from a single
//! state type to named, independently-typed inputs/outputs.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use crate::dag::DagSpec;
use crate::error::{ConstellationError, Result};
use crate::value::CValue;

/// A hierarchical, cooperatively-checked cancellation signal (`spec.md` §5:
/// "cancelling the run cancels all outstanding module tasks"). Flat rather
/// than tree-shaped: every child token observes the same underlying flag,
/// which is sufficient for single-process, single-run fan-out.
#[derive(Clone, Default)]
pub struct CancellationToken {
    flag: Arc<std::sync::atomic::AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn child_token(&self) -> Self {
        self.clone()
    }

    pub fn cancel(&self) {
        self.flag.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// Cooperative cancellation + deadline contract handed to every module
/// invocation (`spec.md` §4.8 main loop, §9 "Coroutine/IO effects").
#[derive(Clone)]
pub struct ModuleContext {
    pub cancellation: CancellationToken,
    pub deadline: Option<std::time::Instant>,
}

impl ModuleContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// A registered module implementation. Inputs/outputs are shaped as
/// `name -> CValue` maps, matching `ModuleNodeSpec::consumes`/`produces`.
#[async_trait]
pub trait ModuleImpl: Send + Sync {
    /// Stable registry name; must match the name module nodes reference.
    fn name(&self) -> &str;

    async fn call(
        &self,
        inputs: HashMap<String, CValue>,
        ctx: &ModuleContext,
    ) -> Result<HashMap<String, CValue>>;

    fn as_any(&self) -> &dyn Any {
        // Default: no downcasting support. Overridden by implementations
        // that need it (e.g. test doubles that inspect call counts).
        &()
    }
}

/// Name → implementation map shared read-mostly across runs.
#[derive(Default, Clone)]
pub struct ModuleRegistry {
    modules: Arc<DashMap<String, Arc<dyn ModuleImpl>>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a module implementation. Names are case-sensitive.
    pub fn register(&self, module: Arc<dyn ModuleImpl>) {
        let name = module.name().to_string();
        let replaced = self.modules.insert(name.clone(), module).is_some();
        if replaced {
            tracing::debug!(module = %name, "replaced existing module registration");
        } else {
            tracing::debug!(module = %name, "registered module");
        }
    }

    pub fn deregister(&self, name: &str) -> bool {
        let removed = self.modules.remove(name).is_some();
        if removed {
            tracing::debug!(module = %name, "deregistered module");
        }
        removed
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ModuleImpl>> {
        self.modules.get(name).map(|entry| entry.value().clone())
    }

    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.modules.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Resolve every module node in `spec` to an implementation by name.
    /// Synthetic module names (present in `synthetic`) are also accepted,
    /// so callers may pass the synthetic map produced by
    /// `crate::synthetic::materialize`.
    pub fn init_modules(
        &self,
        spec: &DagSpec,
        synthetic: &HashMap<Uuid, Arc<dyn ModuleImpl>>,
    ) -> Result<HashMap<Uuid, Arc<dyn ModuleImpl>>> {
        let mut resolved = HashMap::with_capacity(spec.modules.len());
        for (module_id, node) in &spec.modules {
            if let Some(synth) = synthetic.get(module_id) {
                resolved.insert(*module_id, synth.clone());
                continue;
            }
            let implementation = self.get(&node.name).ok_or_else(|| {
                tracing::error!(module = %node.name, "module not found in registry");
                ConstellationError::module_not_found(node.name.clone())
            })?;
            resolved.insert(*module_id, implementation);
        }
        Ok(resolved)
    }

    /// Hash of the set of registered module identities, used as the
    /// `registryHash` half of the syntactic-hash index key (`spec.md` §4.5):
    /// two identical source texts compiled against different registries
    /// must miss the cache.
    pub fn registry_hash(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut names = self.list();
        names.sort();
        let mut hasher = Sha256::new();
        for name in &names {
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }
}
