//! Canonicalization & structural hashing (`spec.md` §4.4, C4).
//!
//! Turns a `DagSpec` plus its resolved `ModuleCallOptions` into a
//! deterministic byte string and a SHA-256 structural hash. UUIDs are
//! rewritten to stable indices derived from a topological traversal so
//! that two graphs differing only by UUID choice hash identically
//! (testable property 1), while any semantic change — an edge, a
//! `CType`, a module version, a call option value — changes the hash
//! (testable property 2). The call options are folded into the same
//! canonical document precisely so property 2's "changed module call
//! option value" clause holds; `spec.md` §3 files them under
//! `PipelineImage`, not `DagSpec`, but both feed the one hash that
//! identifies a `PipelineImage`.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::dag::{DagSpec, ModuleCallOptions};
use crate::error::{ConstellationError, Result};
use crate::transform::InlineTransform;
use crate::types::CType;

/// Stable per-graph indices assigned by topological order. Kept separate
/// per node kind: module indices and data indices are independent
/// sequences, each starting at 0.
pub struct CanonicalIndices {
    pub module_index: HashMap<Uuid, u64>,
    pub data_index: HashMap<Uuid, u64>,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
enum NodeRef {
    Module(Uuid),
    Data(Uuid),
}

/// Assign canonical indices via Kahn's algorithm over the combined
/// module/data/transform graph, breaking ties by (in order): kind (data
/// before module), visible name / module name lexicographically, `CType`
/// canonical form, module version.
pub fn assign_canonical_indices(spec: &DagSpec) -> Result<CanonicalIndices> {
    let mut adjacency: HashMap<NodeRef, Vec<NodeRef>> = HashMap::new();
    let mut indegree: HashMap<NodeRef, u32> = HashMap::new();

    let all_nodes: Vec<NodeRef> = spec
        .modules
        .keys()
        .map(|id| NodeRef::Module(*id))
        .chain(spec.data.keys().map(|id| NodeRef::Data(*id)))
        .collect();
    for &node in &all_nodes {
        indegree.entry(node).or_insert(0);
        adjacency.entry(node).or_default();
    }

    let mut add_edge = |from: NodeRef, to: NodeRef| {
        adjacency.entry(from).or_default().push(to);
        *indegree.entry(to).or_insert(0) += 1;
    };

    for (data_id, module_id) in &spec.in_edges {
        add_edge(NodeRef::Data(*data_id), NodeRef::Module(*module_id));
    }
    for (module_id, data_id) in &spec.out_edges {
        add_edge(NodeRef::Module(*module_id), NodeRef::Data(*data_id));
    }
    for data in spec.data.values() {
        for source_id in data.transform_inputs.values() {
            add_edge(NodeRef::Data(*source_id), NodeRef::Data(data.id));
        }
    }

    let tie_break = |node: NodeRef| -> (u8, String, String, String) {
        match node {
            NodeRef::Data(id) => {
                let data = &spec.data[&id];
                (0, data.visible_name.clone(), canonical_type_string(&data.ty), String::new())
            }
            NodeRef::Module(id) => {
                let module = &spec.modules[&id];
                (1, module.name.clone(), String::new(), module.version.clone())
            }
        }
    };

    let mut ready: Vec<NodeRef> = indegree
        .iter()
        .filter(|(_, &deg)| deg == 0)
        .map(|(&node, _)| node)
        .collect();

    let mut module_index = HashMap::new();
    let mut data_index = HashMap::new();
    let mut remaining_indegree = indegree.clone();
    let mut visited: HashSet<NodeRef> = HashSet::new();
    let mut next_module_idx: u64 = 0;
    let mut next_data_idx: u64 = 0;

    while !ready.is_empty() {
        ready.sort_by_key(|&n| tie_break(n));
        let node = ready.remove(0);
        if !visited.insert(node) {
            continue;
        }
        match node {
            NodeRef::Module(id) => {
                module_index.insert(id, next_module_idx);
                next_module_idx += 1;
            }
            NodeRef::Data(id) => {
                data_index.insert(id, next_data_idx);
                next_data_idx += 1;
            }
        }
        if let Some(next) = adjacency.get(&node) {
            for &succ in next {
                let deg = remaining_indegree.get_mut(&succ).unwrap();
                *deg -= 1;
                if *deg == 0 {
                    ready.push(succ);
                }
            }
        }
    }

    if visited.len() != all_nodes.len() {
        let unresolved = all_nodes
            .iter()
            .find(|n| !visited.contains(n))
            .map(|n| match n {
                NodeRef::Module(id) => spec.modules[id].name.clone(),
                NodeRef::Data(id) => spec.data[id].visible_name.clone(),
            })
            .unwrap_or_default();
        return Err(ConstellationError::cycle_detected(unresolved));
    }

    Ok(CanonicalIndices { module_index, data_index })
}

fn canonical_type_string(ty: &CType) -> String {
    let mut out = String::new();
    write_type_tag(ty, &mut out);
    out
}

fn write_type_tag(ty: &CType, out: &mut String) {
    out.push(ty.tag() as char);
    match ty {
        CType::Unit | CType::Bool | CType::Int | CType::Float | CType::String => {}
        CType::Option(inner) | CType::List(inner) => write_type_tag(inner, out),
        CType::Map(k, v) => {
            write_type_tag(k, out);
            write_type_tag(v, out);
        }
        CType::Product(fields) => {
            for (name, field_ty) in fields {
                out.push('|');
                out.push_str(name);
                out.push(':');
                write_type_tag(field_ty, out);
            }
        }
    }
}

#[derive(Serialize)]
struct CanonicalModule {
    index: u64,
    name: String,
    version: String,
    tags: Vec<String>,
    consumes: BTreeMap<String, String>,
    produces: BTreeMap<String, String>,
    inputs_timeout_ms: Option<u128>,
    module_timeout_ms: Option<u128>,
    definition_context: Option<serde_json::Value>,
    call_options: CanonicalCallOptions,
}

#[derive(Serialize, Default)]
struct CanonicalCallOptions {
    retry: Option<u32>,
    timeout_ms: Option<u128>,
    delay_ms: Option<u128>,
    backoff: Option<String>,
    max_delay_ms: Option<u128>,
    cache_ttl_ms: Option<u128>,
    cache_backend: Option<String>,
    throttle_count: Option<u32>,
    throttle_window_ms: Option<u128>,
    concurrency_limit: Option<usize>,
    on_error: Option<String>,
    lazy: Option<bool>,
    priority: Option<String>,
}

#[derive(Serialize)]
struct CanonicalData {
    index: u64,
    visible_name: String,
    #[serde(rename = "type")]
    ty: String,
    inline_transform: Option<CanonicalTransform>,
}

#[derive(Serialize)]
struct CanonicalTransform {
    kind: String,
    inputs: BTreeMap<String, u64>,
}

#[derive(Serialize)]
struct CanonicalDag {
    name: String,
    version: String,
    modules: Vec<CanonicalModule>,
    data: Vec<CanonicalData>,
    in_edges: Vec<(u64, u64)>,
    out_edges: Vec<(u64, u64)>,
    declared_outputs: Vec<String>,
    output_bindings: BTreeMap<String, u64>,
}

fn transform_kind_name(transform: &InlineTransform) -> String {
    match transform {
        InlineTransform::Project { field } => format!("Project({field})"),
        InlineTransform::Merge => "Merge".to_string(),
        InlineTransform::And => "And".to_string(),
        InlineTransform::Or => "Or".to_string(),
        InlineTransform::Not => "Not".to_string(),
        InlineTransform::Conditional => "Conditional".to_string(),
        InlineTransform::Compare(op) => format!("Compare({op:?})"),
        InlineTransform::Arithmetic(op) => format!("Arithmetic({op:?})"),
        InlineTransform::ListFilter(p) => format!("ListFilter({p:?})"),
        InlineTransform::ListMap(p) => format!("ListMap({p:?})"),
        InlineTransform::ListAll(p) => format!("ListAll({p:?})"),
        InlineTransform::ListAny(p) => format!("ListAny({p:?})"),
    }
}

fn build_canonical_document(
    spec: &DagSpec,
    options: &HashMap<Uuid, ModuleCallOptions>,
    indices: &CanonicalIndices,
) -> CanonicalDag {
    let mut modules: Vec<CanonicalModule> = spec
        .modules
        .values()
        .map(|m| {
            let opts = options.get(&m.id).cloned().unwrap_or_default();
            CanonicalModule {
                index: indices.module_index[&m.id],
                name: m.name.clone(),
                version: m.version.clone(),
                tags: {
                    let mut tags = m.tags.clone();
                    tags.sort();
                    tags
                },
                consumes: m.consumes.iter().map(|(k, v)| (k.clone(), canonical_type_string(v))).collect(),
                produces: m.produces.iter().map(|(k, v)| (k.clone(), canonical_type_string(v))).collect(),
                inputs_timeout_ms: m.inputs_timeout.map(|d| d.as_millis()),
                module_timeout_ms: m.module_timeout.map(|d| d.as_millis()),
                definition_context: m.definition_context.as_ref().map(canonicalize_json),
                call_options: CanonicalCallOptions {
                    retry: opts.retry,
                    timeout_ms: opts.timeout.map(|d| d.as_millis()),
                    delay_ms: opts.delay.map(|d| d.as_millis()),
                    backoff: opts.backoff.map(|b| format!("{b:?}")),
                    max_delay_ms: opts.max_delay.map(|d| d.as_millis()),
                    cache_ttl_ms: opts.cache_ttl.map(|d| d.as_millis()),
                    cache_backend: opts.cache_backend,
                    throttle_count: opts.throttle_count,
                    throttle_window_ms: opts.throttle_window.map(|d| d.as_millis()),
                    concurrency_limit: opts.concurrency_limit,
                    on_error: opts.on_error.map(|o| format!("{o:?}")),
                    lazy: opts.lazy,
                    priority: opts.priority.map(|p| format!("{p:?}")),
                },
            }
        })
        .collect();
    modules.sort_by_key(|m| m.index);

    let mut data: Vec<CanonicalData> = spec
        .data
        .values()
        .map(|d| CanonicalData {
            index: indices.data_index[&d.id],
            visible_name: d.visible_name.clone(),
            ty: canonical_type_string(&d.ty),
            inline_transform: d.inline_transform.as_ref().map(|t| CanonicalTransform {
                kind: transform_kind_name(t),
                inputs: d
                    .transform_inputs
                    .iter()
                    .map(|(name, id)| (name.clone(), indices.data_index[id]))
                    .collect(),
            }),
        })
        .collect();
    data.sort_by_key(|d| d.index);

    let mut in_edges: Vec<(u64, u64)> = spec
        .in_edges
        .iter()
        .map(|(data_id, module_id)| (indices.data_index[data_id], indices.module_index[module_id]))
        .collect();
    in_edges.sort();

    let mut out_edges: Vec<(u64, u64)> = spec
        .out_edges
        .iter()
        .map(|(module_id, data_id)| (indices.module_index[module_id], indices.data_index[data_id]))
        .collect();
    out_edges.sort();

    let mut declared_outputs = spec.declared_outputs.clone();
    declared_outputs.sort();

    let output_bindings = spec
        .output_bindings
        .iter()
        .map(|(name, id)| (name.clone(), indices.data_index[id]))
        .collect();

    CanonicalDag {
        name: spec.name.clone(),
        version: spec.version.clone(),
        modules,
        data,
        in_edges,
        out_edges,
        declared_outputs,
        output_bindings,
    }
}

/// Recursively sort object keys and apply canonical number formatting
/// (`spec.md` §4.4: "no leading zeros, no trailing fractional zeros,
/// exponent as e±NN or absent") to a free-form `definitionContext` value.
fn canonicalize_json(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let sorted: BTreeMap<String, serde_json::Value> =
                map.iter().map(|(k, v)| (k.clone(), canonicalize_json(v))).collect();
            serde_json::to_value(sorted).unwrap()
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(canonicalize_json).collect())
        }
        serde_json::Value::Number(n) => serde_json::Value::String(canonical_number(n)),
        other => other.clone(),
    }
}

fn canonical_number(n: &serde_json::Number) -> String {
    if let Some(i) = n.as_i64() {
        return i.to_string();
    }
    if let Some(u) = n.as_u64() {
        return u.to_string();
    }
    let f = n.as_f64().unwrap_or(0.0);
    let mut s = format!("{f:e}");
    // Rust's `{:e}` always emits an exponent; strip it when the value has
    // no fractional/exponent need (e.g. prefer "1.5" over "1.5e0").
    if let Some(pos) = s.find('e') {
        let exponent: i32 = s[pos + 1..].parse().unwrap_or(0);
        if exponent == 0 {
            s.truncate(pos);
        } else {
            s = format!("{}e{}{}", &s[..pos], if exponent > 0 { "+" } else { "-" }, exponent.abs());
        }
    }
    s
}

/// Compute the structural hash of `spec` combined with its resolved
/// `moduleOptions`. UUID-invariant; sensitive to any semantic change.
pub fn structural_hash(spec: &DagSpec, options: &HashMap<Uuid, ModuleCallOptions>) -> Result<String> {
    let indices = assign_canonical_indices(spec)?;
    let doc = build_canonical_document(spec, options, &indices);
    let bytes = serde_json::to_vec(&doc).map_err(|e| ConstellationError::Codec {
        message: e.to_string(),
        context: crate::error::ErrorContext::new(),
    })?;
    let digest = Sha256::digest(&bytes);
    Ok(format!("sha256:{}", hex::encode(digest)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{DataNodeSpec, ModuleNodeSpec};
    use std::collections::HashMap as StdHashMap;

    fn module(id: Uuid, name: &str) -> ModuleNodeSpec {
        ModuleNodeSpec {
            id,
            name: name.to_string(),
            version: "1.0.0".to_string(),
            tags: vec![],
            consumes: BTreeMap::from([("x".to_string(), CType::Int)]),
            produces: BTreeMap::from([("y".to_string(), CType::Int)]),
            inputs_timeout: None,
            module_timeout: None,
            definition_context: None,
        }
    }

    fn data(id: Uuid, name: &str) -> DataNodeSpec {
        DataNodeSpec {
            id,
            visible_name: name.to_string(),
            nicknames: StdHashMap::new(),
            ty: CType::Int,
            inline_transform: None,
            transform_inputs: BTreeMap::new(),
        }
    }

    fn build(seed_offset: u8) -> DagSpec {
        let module_id = Uuid::from_bytes([seed_offset + 1; 16]);
        let x_id = Uuid::from_bytes([seed_offset + 2; 16]);
        let y_id = Uuid::from_bytes([seed_offset + 3; 16]);
        DagSpec {
            name: "pipeline".to_string(),
            version: "1".to_string(),
            modules: BTreeMap::from([(module_id, module(module_id, "double"))]),
            data: BTreeMap::from([(x_id, data(x_id, "x")), (y_id, data(y_id, "y"))]),
            in_edges: vec![(x_id, module_id)],
            out_edges: vec![(module_id, y_id)],
            declared_outputs: vec!["y".to_string()],
            output_bindings: BTreeMap::from([("y".to_string(), y_id)]),
        }
    }

    #[test]
    fn hash_is_invariant_under_uuid_reshuffling() {
        let a = build(0);
        let b = build(50);
        let h1 = structural_hash(&a, &StdHashMap::new()).unwrap();
        let h2 = structural_hash(&b, &StdHashMap::new()).unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn hash_changes_when_data_type_changes() {
        let mut a = build(0);
        let h1 = structural_hash(&a, &StdHashMap::new()).unwrap();
        let y_id = *a.output_bindings.get("y").unwrap();
        a.data.get_mut(&y_id).unwrap().ty = CType::Float;
        let h2 = structural_hash(&a, &StdHashMap::new()).unwrap();
        assert_ne!(h1, h2);
    }

    #[test]
    fn hash_changes_when_call_option_changes() {
        let spec = build(0);
        let module_id = *spec.modules.keys().next().unwrap();
        let h1 = structural_hash(&spec, &StdHashMap::new()).unwrap();
        let mut options = StdHashMap::new();
        options.insert(module_id, ModuleCallOptions { retry: Some(3), ..Default::default() });
        let h2 = structural_hash(&spec, &options).unwrap();
        assert_ne!(h1, h2);
    }

    #[test]
    fn canonical_number_formatting() {
        assert_eq!(canonical_number(&serde_json::Number::from(42)), "42");
        assert_eq!(canonical_number(&serde_json::json!(1.5).as_number().unwrap().clone()), "1.5");
    }
}
