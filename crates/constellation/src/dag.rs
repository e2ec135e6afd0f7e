//! Immutable DAG specification (`spec.md` §3, C3).
//!
//! `DagSpec` is produced once by an external compiler (out of scope here)
//! and consumed as a finished artifact. Everything in this module is a
//! plain data description; no behavior lives here beyond structural
//! validation helpers the scheduler and canonicalizer both need.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ConstellationError, Result};
use crate::transform::InlineTransform;
use crate::types::CType;

/// A processing node. `consumes`/`produces` name input/output slots by a
/// per-module local name; `DataNodeSpec::nicknames` maps a data node's
/// global identity to that local name for a given module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleNodeSpec {
    pub id: Uuid,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub consumes: BTreeMap<String, CType>,
    pub produces: BTreeMap<String, CType>,
    #[serde(default)]
    pub inputs_timeout: Option<std::time::Duration>,
    #[serde(default)]
    pub module_timeout: Option<std::time::Duration>,
    /// Free-form metadata captured at module-definition time (e.g. branch
    /// descriptors for the synthetic factory, §4.7).
    #[serde(default)]
    pub definition_context: Option<serde_json::Value>,
}

/// A typed value slot. At most one producer: either an upstream module's
/// out-edge, or an `inline_transform` whose `transform_inputs` are fully
/// supplied — never both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataNodeSpec {
    pub id: Uuid,
    pub visible_name: String,
    /// Per-module local name this data node is bound to, keyed by the
    /// consuming or producing module's id.
    #[serde(default)]
    pub nicknames: HashMap<Uuid, String>,
    pub ty: CType,
    #[serde(default)]
    pub inline_transform: Option<InlineTransform>,
    /// Required only when `inline_transform` is set; maps the transform's
    /// named inputs to the data nodes supplying them.
    #[serde(default)]
    pub transform_inputs: BTreeMap<String, Uuid>,
}

impl DataNodeSpec {
    fn validate(&self) -> Result<()> {
        match &self.inline_transform {
            Some(transform) => {
                let required = transform.required_input_names();
                for name in &required {
                    if !self.transform_inputs.contains_key(name) {
                        return Err(ConstellationError::UndefinedVariable {
                            name: name.clone(),
                            context: crate::error::ctx_pairs(&[(
                                "dataNode",
                                self.visible_name.clone(),
                            )]),
                        });
                    }
                }
            }
            None => {
                if !self.transform_inputs.is_empty() {
                    return Err(ConstellationError::UnsupportedOperation {
                        operation: "transform_inputs set without inline_transform".to_string(),
                        context: crate::error::ctx_pairs(&[(
                            "dataNode",
                            self.visible_name.clone(),
                        )]),
                    });
                }
            }
        }
        Ok(())
    }
}

/// An immutable, already-compiled pipeline graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagSpec {
    pub name: String,
    pub version: String,
    pub modules: BTreeMap<Uuid, ModuleNodeSpec>,
    pub data: BTreeMap<Uuid, DataNodeSpec>,
    /// Data node → consuming module.
    pub in_edges: Vec<(Uuid, Uuid)>,
    /// Producing module → data node.
    pub out_edges: Vec<(Uuid, Uuid)>,
    pub declared_outputs: Vec<String>,
    pub output_bindings: BTreeMap<String, Uuid>,
}

impl DagSpec {
    /// Structural validation independent of canonicalization: every edge
    /// references an existing node, every declared output binds to an
    /// existing data node, and no data node is produced twice.
    pub fn validate(&self) -> Result<()> {
        for (data_id, module_id) in &self.in_edges {
            self.require_data(*data_id)?;
            self.require_module(*module_id)?;
        }
        for (module_id, data_id) in &self.out_edges {
            self.require_module(*module_id)?;
            self.require_data(*data_id)?;
        }
        for name in &self.declared_outputs {
            let data_id = self.output_bindings.get(name).ok_or_else(|| {
                ConstellationError::NodeNotFound {
                    node_id: name.clone(),
                    context: crate::error::ctx_pairs(&[("declaredOutput", name.clone())]),
                }
            })?;
            self.require_data(*data_id)?;
        }

        let mut producer: HashMap<Uuid, ()> = HashMap::new();
        for (module_id, data_id) in &self.out_edges {
            if producer.insert(*data_id, ()).is_some() {
                return Err(ConstellationError::Validation {
                    errors: vec![format!(
                        "data node {data_id} produced by more than one out-edge (module {module_id})"
                    )],
                    context: crate::error::ErrorContext::new(),
                });
            }
        }
        for data in self.data.values() {
            data.validate()?;
            if data.inline_transform.is_some() && producer.contains_key(&data.id) {
                return Err(ConstellationError::Validation {
                    errors: vec![format!(
                        "data node {} has both an inline transform and a module producer",
                        data.id
                    )],
                    context: crate::error::ErrorContext::new(),
                });
            }
        }

        self.check_acyclic()?;
        Ok(())
    }

    fn require_data(&self, id: Uuid) -> Result<()> {
        if self.data.contains_key(&id) {
            Ok(())
        } else {
            Err(ConstellationError::NodeNotFound {
                node_id: id.to_string(),
                context: crate::error::ErrorContext::new(),
            })
        }
    }

    fn require_module(&self, id: Uuid) -> Result<()> {
        if self.modules.contains_key(&id) {
            Ok(())
        } else {
            Err(ConstellationError::NodeNotFound {
                node_id: id.to_string(),
                context: crate::error::ErrorContext::new(),
            })
        }
    }

    /// Defensive cycle check (`spec.md` §4.8 failure table: "should not
    /// occur if spec is valid"). Run once at `LoadedPipeline` construction,
    /// not on every `run` (`SPEC_FULL.md` §5).
    fn check_acyclic(&self) -> Result<()> {
        use std::collections::HashSet;

        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        enum Node {
            Module(Uuid),
            Data(Uuid),
        }

        let mut adjacency: HashMap<Node, Vec<Node>> = HashMap::new();
        for (data_id, module_id) in &self.in_edges {
            adjacency
                .entry(Node::Data(*data_id))
                .or_default()
                .push(Node::Module(*module_id));
        }
        for (module_id, data_id) in &self.out_edges {
            adjacency
                .entry(Node::Module(*module_id))
                .or_default()
                .push(Node::Data(*data_id));
        }
        for data in self.data.values() {
            for (_, source_id) in &data.transform_inputs {
                adjacency
                    .entry(Node::Data(*source_id))
                    .or_default()
                    .push(Node::Data(data.id));
            }
        }

        let mut visiting: HashSet<Node> = HashSet::new();
        let mut done: HashSet<Node> = HashSet::new();

        fn visit(
            node: Node,
            adjacency: &HashMap<Node, Vec<Node>>,
            visiting: &mut HashSet<Node>,
            done: &mut HashSet<Node>,
            module_name: &dyn Fn(Uuid) -> String,
        ) -> Result<()> {
            if done.contains(&node) {
                return Ok(());
            }
            if !visiting.insert(node) {
                let name = match node {
                    Node::Module(id) => module_name(id),
                    Node::Data(id) => id.to_string(),
                };
                return Err(ConstellationError::cycle_detected(name));
            }
            if let Some(next) = adjacency.get(&node) {
                for &n in next {
                    visit(n, adjacency, visiting, done, module_name)?;
                }
            }
            visiting.remove(&node);
            done.insert(node);
            Ok(())
        }

        let module_name = |id: Uuid| {
            self.modules
                .get(&id)
                .map(|m| m.name.clone())
                .unwrap_or_else(|| id.to_string())
        };

        let all_nodes: Vec<Node> = self
            .modules
            .keys()
            .map(|id| Node::Module(*id))
            .chain(self.data.keys().map(|id| Node::Data(*id)))
            .collect();

        for node in all_nodes {
            visit(node, &adjacency, &mut visiting, &mut done, &module_name)?;
        }
        Ok(())
    }

    /// Data nodes with no inbound producer: neither an out-edge source nor
    /// an inline transform. These are the "top-level" inputs the scheduler
    /// expects the caller to provide (`spec.md` §4.8 init step 1).
    pub fn top_level_inputs(&self) -> Vec<Uuid> {
        let produced: std::collections::HashSet<Uuid> = self
            .out_edges
            .iter()
            .map(|(_, data_id)| *data_id)
            .chain(
                self.data
                    .values()
                    .filter(|d| d.inline_transform.is_some())
                    .map(|d| d.id),
            )
            .collect();
        self.data
            .keys()
            .copied()
            .filter(|id| !produced.contains(id))
            .collect()
    }
}

/// Per-module execution options (`spec.md` §3). Every field is optional;
/// absence means "inherit the engine default" (`EngineConfig`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ModuleCallOptions {
    pub retry: Option<u32>,
    #[serde(default, with = "duration_millis_opt")]
    pub timeout: Option<std::time::Duration>,
    #[serde(default, with = "duration_millis_opt")]
    pub delay: Option<std::time::Duration>,
    pub backoff: Option<BackoffStrategy>,
    #[serde(default, with = "duration_millis_opt")]
    pub max_delay: Option<std::time::Duration>,
    #[serde(default, with = "duration_millis_opt")]
    pub cache_ttl: Option<std::time::Duration>,
    pub cache_backend: Option<String>,
    pub throttle_count: Option<u32>,
    #[serde(default, with = "duration_millis_opt")]
    pub throttle_window: Option<std::time::Duration>,
    pub concurrency_limit: Option<usize>,
    pub on_error: Option<OnErrorStrategy>,
    pub lazy: Option<bool>,
    pub priority: Option<Priority>,
}

mod duration_millis_opt {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        value.map(|d| d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackoffStrategy {
    Fixed,
    Linear,
    Exponential,
}

/// What happens when a module exhausts its retries. `Propagate` (default)
/// fails the run when a declared output transitively depends on the
/// failed module; `Suppress` marks the module and its downstream
/// dependents `Skipped` without failing the overall run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OnErrorStrategy {
    Propagate,
    Suppress,
}

impl Default for OnErrorStrategy {
    fn default() -> Self {
        OnErrorStrategy::Propagate
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NamedPriority {
    Low,
    Normal,
    High,
}

impl NamedPriority {
    fn rank(self) -> i64 {
        match self {
            NamedPriority::Low => 0,
            NamedPriority::Normal => 50,
            NamedPriority::High => 100,
        }
    }
}

/// Resolved per-run dispatch priority. Open question in `spec.md` §9: how
/// custom numeric priorities and named levels compare when mixed.
/// Decision (recorded in `DESIGN.md`): both resolve to an `i64` rank via
/// `sort_key`; on a numeric tie a `Custom` priority is treated as higher
/// than a `Named` one, matching the spec's "`CustomPriority(n)` taking
/// precedence" note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Priority {
    Named(NamedPriority),
    Custom(i64),
}

impl Priority {
    /// `(numeric rank, tie-break discriminator)`; larger sorts first.
    pub fn sort_key(self) -> (i64, u8) {
        match self {
            Priority::Named(named) => (named.rank(), 0),
            Priority::Custom(n) => (n, 1),
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Named(NamedPriority::Normal)
    }
}
