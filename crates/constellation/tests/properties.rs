//! Property-based tests for the testable properties in `spec.md` §8 that
//! hold across many inputs rather than one fixed scenario: structural-hash
//! stability/sensitivity (properties 1-2) and suspension round-tripping
//! (property 3).

use std::collections::HashMap;

use constellation::canonical::structural_hash;
use constellation::dag::{DagSpec, DataNodeSpec, ModuleCallOptions, ModuleNodeSpec};
use constellation::executor::{Cell, RunOutcome, RunStatus};
use constellation::suspension::SuspendedExecution;
use constellation::types::CType;
use constellation::value::{CValue, RawValue};
use proptest::prelude::*;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Builds `x: Int -> [double] -> y: Int` with `double` implemented as a
/// single module node, reassigning fresh UUIDs every call so tests can
/// check that identity doesn't leak into the hash.
fn single_module_spec() -> DagSpec {
    let x = Uuid::new_v4();
    let y = Uuid::new_v4();
    let module = Uuid::new_v4();
    DagSpec {
        name: "single".to_string(),
        version: "1.0.0".to_string(),
        modules: BTreeMap::from([(
            module,
            ModuleNodeSpec {
                id: module,
                name: "double".to_string(),
                version: "1.0.0".to_string(),
                tags: vec![],
                consumes: BTreeMap::from([("x".to_string(), CType::Int)]),
                produces: BTreeMap::from([("y".to_string(), CType::Int)]),
                inputs_timeout: None,
                module_timeout: None,
                definition_context: None,
            },
        )]),
        data: BTreeMap::from([
            (
                x,
                DataNodeSpec {
                    id: x,
                    visible_name: "x".to_string(),
                    nicknames: HashMap::new(),
                    ty: CType::Int,
                    inline_transform: None,
                    transform_inputs: BTreeMap::new(),
                },
            ),
            (
                y,
                DataNodeSpec {
                    id: y,
                    visible_name: "y".to_string(),
                    nicknames: HashMap::new(),
                    ty: CType::Int,
                    inline_transform: None,
                    transform_inputs: BTreeMap::new(),
                },
            ),
        ]),
        in_edges: vec![(x, module)],
        out_edges: vec![(module, y)],
        declared_outputs: vec!["y".to_string()],
        output_bindings: BTreeMap::from([("y".to_string(), y)]),
    }
}

proptest! {
    /// Property 1: the structural hash of a spec is invariant under
    /// rebuilding it with fresh UUIDs for every node (same shape, same
    /// names, same types).
    #[test]
    fn structural_hash_is_invariant_under_uuid_reassignment(_seed in 0u32..64) {
        let a = single_module_spec();
        let b = single_module_spec();
        let hash_a = structural_hash(&a, &HashMap::new()).unwrap();
        let hash_b = structural_hash(&b, &HashMap::new()).unwrap();
        prop_assert_eq!(hash_a, hash_b);
    }

    /// Property 2: changing a single data node's `CType` always changes
    /// the structural hash, for any of the scalar types.
    #[test]
    fn structural_hash_is_sensitive_to_type_changes(
        ty in prop_oneof![
            Just(CType::Bool),
            Just(CType::Float),
            Just(CType::String),
        ]
    ) {
        let mut spec = single_module_spec();
        let original_hash = structural_hash(&spec, &HashMap::new()).unwrap();
        let x_id = *spec.data.keys().find(|id| spec.data[*id].visible_name == "x").unwrap();
        spec.data.get_mut(&x_id).unwrap().ty = ty.clone();
        let changed_hash = structural_hash(&spec, &HashMap::new()).unwrap();
        prop_assert_ne!(original_hash, changed_hash);
    }

    /// Property 2b: changing `retry` in `ModuleCallOptions` changes the
    /// hash too, since behavior-affecting options are folded in.
    #[test]
    fn structural_hash_is_sensitive_to_call_option_changes(retry in 0u32..8) {
        let spec = single_module_spec();
        let module_id = *spec.modules.keys().next().unwrap();
        let base_hash = structural_hash(&spec, &HashMap::new()).unwrap();
        let mut options = HashMap::new();
        options.insert(module_id, ModuleCallOptions { retry: Some(retry), ..Default::default() });
        let with_retry_hash = structural_hash(&spec, &options).unwrap();
        prop_assert_ne!(base_hash, with_retry_hash);
    }

    /// Property 3: a `SuspendedExecution` survives an encode/decode round
    /// trip with every field intact, for arbitrary small `Int` payloads.
    #[test]
    fn suspended_execution_round_trips_through_json(
        value in any::<i64>(),
        resumption_count in 0u32..16,
    ) {
        let spec = single_module_spec();
        let x_id = *spec.data.keys().find(|id| spec.data[*id].visible_name == "x").unwrap();
        let execution_id = Uuid::new_v4();

        let outcome = RunOutcome {
            status: RunStatus::Suspended,
            values: HashMap::from([(x_id, Cell::Computed(RawValue::from_cvalue(CValue::Int(value))))]),
            resolution_sources: HashMap::new(),
            module_status: HashMap::new(),
            errors: Vec::new(),
            node_timings: HashMap::new(),
            missing_inputs: Vec::new(),
            total_duration: std::time::Duration::from_millis(0),
            resumption_count,
        };

        let snapshot = SuspendedExecution::capture(
            execution_id,
            &spec,
            &HashMap::new(),
            "sha256:deadbeef".to_string(),
            HashMap::new(),
            &outcome,
        ).unwrap();

        let encoded = snapshot.encode().unwrap();
        let decoded = SuspendedExecution::decode(&encoded).unwrap();

        prop_assert_eq!(decoded.execution_id, execution_id);
        prop_assert_eq!(decoded.resumption_count, resumption_count);
        prop_assert_eq!(decoded.computed_values.get(&x_id), Some(&CValue::Int(value)));
    }
}
