//! Synthetic Module Factory (`spec.md` §4.7, C7).
//!
//! Reconstructs built-in "branch" modules from a `DagSpec` during
//! rehydration: a boolean condition plus N typed branch expressions of a
//! common type, producing one output of that type. Module nodes whose
//! metadata doesn't mark them as a recognized built-in are left alone —
//! the embedder supplies those implementations directly in the
//! `LoadedPipeline` (`spec.md` §4.7: "the external collaborator must
//! provide them").

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::dag::{DagSpec, ModuleNodeSpec};
use crate::error::{ConstellationError, Result};
use crate::registry::{ModuleContext, ModuleImpl};
use crate::value::CValue;

const BRANCH_TAG: &str = "synthetic:branch";

/// A reconstructed branch selector: `condition: Bool`, `branches: [name]`
/// of a shared `CType`, `output: name` of the same type.
pub struct BranchModule {
    name: String,
    branch_names: Vec<String>,
    output_name: String,
}

#[async_trait]
impl ModuleImpl for BranchModule {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(
        &self,
        mut inputs: HashMap<String, CValue>,
        _ctx: &ModuleContext,
    ) -> Result<HashMap<String, CValue>> {
        let condition = match inputs.remove("condition") {
            Some(CValue::Bool(b)) => b,
            Some(other) => {
                return Err(ConstellationError::input_type_mismatch(
                    "condition",
                    crate::types::CType::Bool,
                    other.type_of(),
                ))
            }
            None => {
                return Err(ConstellationError::InputValidation {
                    message: "branch module missing `condition` input".to_string(),
                    context: crate::error::ctx_pairs(&[("moduleName", self.name.clone())]),
                })
            }
        };
        // A binary branch selects `branches[0]` on true, `branches[1]`
        // otherwise; N-ary branch sets beyond two are not reconstructible
        // here and must be supplied as a regular module (`spec.md` §4.7).
        let selected_name = if condition {
            self.branch_names.first()
        } else {
            self.branch_names.get(1)
        }
        .ok_or_else(|| ConstellationError::ModuleExecution {
            module_name: self.name.clone(),
            cause: "branch module requires exactly two branch inputs".to_string(),
            context: crate::error::ErrorContext::new(),
        })?;
        let selected = inputs.remove(selected_name).ok_or_else(|| ConstellationError::InputValidation {
            message: format!("branch module missing `{selected_name}` input"),
            context: crate::error::ctx_pairs(&[("moduleName", self.name.clone())]),
        })?;
        Ok(HashMap::from([(self.output_name.clone(), selected)]))
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

fn is_branch_node(node: &ModuleNodeSpec) -> bool {
    node.tags.iter().any(|t| t == BRANCH_TAG)
        || node
            .definition_context
            .as_ref()
            .and_then(|ctx| ctx.get("kind"))
            .and_then(|k| k.as_str())
            .map(|k| k == "branch")
            .unwrap_or(false)
}

/// Reconstruct every recognized built-in module node in `spec`, returning
/// a map suitable for `LoadedPipeline::synthetic_modules`.
pub fn materialize(spec: &DagSpec) -> HashMap<Uuid, Arc<dyn ModuleImpl>> {
    let mut out: HashMap<Uuid, Arc<dyn ModuleImpl>> = HashMap::new();
    for node in spec.modules.values() {
        if !is_branch_node(node) {
            continue;
        }
        let mut branch_names: Vec<String> =
            node.consumes.keys().filter(|k| *k != "condition").cloned().collect();
        branch_names.sort();
        let output_name = node.produces.keys().next().cloned().unwrap_or_else(|| "output".to_string());
        out.insert(
            node.id,
            Arc::new(BranchModule {
                name: node.name.clone(),
                branch_names,
                output_name,
            }),
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::CancellationToken;
    use crate::types::CType;
    use std::collections::BTreeMap;

    fn branch_module_node(id: Uuid) -> ModuleNodeSpec {
        ModuleNodeSpec {
            id,
            name: "choose".to_string(),
            version: "1.0.0".to_string(),
            tags: vec![BRANCH_TAG.to_string()],
            consumes: BTreeMap::from([
                ("condition".to_string(), CType::Bool),
                ("then_branch".to_string(), CType::Int),
                ("else_branch".to_string(), CType::Int),
            ]),
            produces: BTreeMap::from([("result".to_string(), CType::Int)]),
            inputs_timeout: None,
            module_timeout: None,
            definition_context: None,
        }
    }

    fn minimal_spec_with(node: ModuleNodeSpec) -> DagSpec {
        DagSpec {
            name: "t".to_string(),
            version: "1".to_string(),
            modules: BTreeMap::from([(node.id, node)]),
            data: BTreeMap::new(),
            in_edges: vec![],
            out_edges: vec![],
            declared_outputs: vec![],
            output_bindings: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn branch_module_selects_then_branch_on_true() {
        let id = Uuid::new_v4();
        let spec = minimal_spec_with(branch_module_node(id));
        let modules = materialize(&spec);
        let module = modules.get(&id).unwrap();
        let ctx = ModuleContext { cancellation: CancellationToken::new(), deadline: None };
        let out = module
            .call(
                HashMap::from([
                    ("condition".to_string(), CValue::Bool(true)),
                    ("then_branch".to_string(), CValue::Int(1)),
                    ("else_branch".to_string(), CValue::Int(2)),
                ]),
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(out.get("result"), Some(&CValue::Int(1)));
    }

    #[tokio::test]
    async fn branch_module_selects_else_branch_on_false() {
        let id = Uuid::new_v4();
        let spec = minimal_spec_with(branch_module_node(id));
        let modules = materialize(&spec);
        let module = modules.get(&id).unwrap();
        let ctx = ModuleContext { cancellation: CancellationToken::new(), deadline: None };
        let out = module
            .call(
                HashMap::from([
                    ("condition".to_string(), CValue::Bool(false)),
                    ("then_branch".to_string(), CValue::Int(1)),
                    ("else_branch".to_string(), CValue::Int(2)),
                ]),
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(out.get("result"), Some(&CValue::Int(2)));
    }

    #[test]
    fn non_branch_nodes_are_left_to_the_embedder() {
        let id = Uuid::new_v4();
        let mut node = branch_module_node(id);
        node.tags.clear();
        let spec = minimal_spec_with(node);
        assert!(materialize(&spec).is_empty());
    }
}
