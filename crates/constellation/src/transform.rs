//! Inline Transform Engine (`spec.md` §4.9, C9).
//!
//! An `InlineTransform` is a closed catalog of pure, total (once inputs are
//! computed) operations attached directly to a data node and evaluated
//! inline in the scheduler's task — never a runtime-loaded plugin, and
//! never a user-supplied closure (`spec.md` §9: "user-supplied closures
//! must be regular modules").

use serde::{Deserialize, Serialize};

use crate::error::{ConstellationError, Result};
use crate::types::CType;
use crate::value::CValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// A primitive, closed-form predicate list HOFs apply to each element:
/// comparison against a constant. Keeps list transforms pure and total
/// without admitting arbitrary closures into a `DagSpec`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub op: CompareOp,
    pub constant: CValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InlineTransform {
    /// One product input named `value`, plus a static field name.
    Project { field: String },
    /// Two product inputs (`a`, `b`) with disjoint field sets.
    Merge,
    And,
    Or,
    Not,
    /// `condition`, `then_branch`, `else_branch` of the same type.
    Conditional,
    Compare(CompareOp),
    Arithmetic(ArithOp),
    ListFilter(Predicate),
    ListMap(Predicate),
    ListAll(Predicate),
    ListAny(Predicate),
}

impl InlineTransform {
    /// Input names a `DataNodeSpec::transform_inputs` map must fully supply.
    pub fn required_input_names(&self) -> Vec<String> {
        match self {
            InlineTransform::Project { .. } => vec!["value".to_string()],
            InlineTransform::Merge => vec!["a".to_string(), "b".to_string()],
            InlineTransform::And | InlineTransform::Or => vec!["a".to_string(), "b".to_string()],
            InlineTransform::Not => vec!["value".to_string()],
            InlineTransform::Conditional => vec![
                "condition".to_string(),
                "then_branch".to_string(),
                "else_branch".to_string(),
            ],
            InlineTransform::Compare(_) => vec!["a".to_string(), "b".to_string()],
            InlineTransform::Arithmetic(_) => vec!["a".to_string(), "b".to_string()],
            InlineTransform::ListFilter(_)
            | InlineTransform::ListMap(_)
            | InlineTransform::ListAll(_)
            | InlineTransform::ListAny(_) => vec!["list".to_string()],
        }
    }

    /// Evaluate the transform given its already-`Computed` inputs, keyed by
    /// the names `required_input_names` lists.
    pub fn apply(
        &self,
        inputs: &std::collections::BTreeMap<String, CValue>,
    ) -> Result<CValue> {
        let get = |name: &str| -> Result<&CValue> {
            inputs.get(name).ok_or_else(|| {
                ConstellationError::TypeConversion {
                    message: format!("inline transform missing input `{name}`"),
                    context: crate::error::ctx_pairs(&[("input", name.to_string())]),
                }
            })
        };

        match self {
            InlineTransform::Project { field } => {
                let value = get("value")?;
                match value {
                    CValue::Product(fields) => fields.get(field).cloned().ok_or_else(|| {
                        ConstellationError::type_mismatch(
                            CType::product([]),
                            value.type_of(),
                            format!("product has no field `{field}`"),
                        )
                    }),
                    other => Err(ConstellationError::type_mismatch(
                        CType::product([]),
                        other.type_of(),
                        "Project requires a Product input".to_string(),
                    )),
                }
            }
            InlineTransform::Merge => {
                let a = get("a")?;
                let b = get("b")?;
                match (a, b) {
                    (CValue::Product(fa), CValue::Product(fb)) => {
                        let overlap: Vec<_> = fa.keys().filter(|k| fb.contains_key(*k)).collect();
                        if !overlap.is_empty() {
                            return Err(ConstellationError::TypeConversion {
                                message: format!("Merge operands share field(s): {overlap:?}"),
                                context: crate::error::ErrorContext::new(),
                            });
                        }
                        let mut merged = fa.clone();
                        merged.extend(fb.clone());
                        Ok(CValue::Product(merged))
                    }
                    _ => Err(ConstellationError::type_mismatch(
                        CType::product([]),
                        a.type_of(),
                        "Merge requires two Product inputs".to_string(),
                    )),
                }
            }
            InlineTransform::And => bool_binop(get("a")?, get("b")?, |x, y| x && y),
            InlineTransform::Or => bool_binop(get("a")?, get("b")?, |x, y| x || y),
            InlineTransform::Not => match get("value")? {
                CValue::Bool(b) => Ok(CValue::Bool(!b)),
                other => Err(ConstellationError::type_mismatch(
                    CType::Bool,
                    other.type_of(),
                    "Not requires a Bool input".to_string(),
                )),
            },
            InlineTransform::Conditional => {
                let condition = get("condition")?;
                let then_branch = get("then_branch")?;
                let else_branch = get("else_branch")?;
                let cond = match condition {
                    CValue::Bool(b) => *b,
                    other => {
                        return Err(ConstellationError::type_mismatch(
                            CType::Bool,
                            other.type_of(),
                            "Conditional requires a Bool condition".to_string(),
                        ))
                    }
                };
                if then_branch.type_of() != else_branch.type_of() {
                    return Err(ConstellationError::type_mismatch(
                        then_branch.type_of(),
                        else_branch.type_of(),
                        "Conditional branches must share a type".to_string(),
                    ));
                }
                Ok(if cond { then_branch.clone() } else { else_branch.clone() })
            }
            InlineTransform::Compare(op) => {
                let a = get("a")?;
                let b = get("b")?;
                compare(*op, a, b).map(CValue::Bool)
            }
            InlineTransform::Arithmetic(op) => arithmetic(*op, get("a")?, get("b")?),
            InlineTransform::ListFilter(pred) => {
                let items = list_items(get("list")?)?;
                let element_type = element_type(get("list")?)?;
                let mut kept = Vec::new();
                for item in items {
                    if eval_predicate(pred, item)? {
                        kept.push(item.clone());
                    }
                }
                Ok(CValue::list(element_type, kept))
            }
            InlineTransform::ListMap(pred) => {
                let items = list_items(get("list")?)?;
                let mut mapped = Vec::with_capacity(items.len());
                for item in items {
                    mapped.push(CValue::Bool(eval_predicate(pred, item)?));
                }
                Ok(CValue::list(CType::Bool, mapped))
            }
            InlineTransform::ListAll(pred) => {
                let items = list_items(get("list")?)?;
                let mut all = true;
                for item in items {
                    if !eval_predicate(pred, item)? {
                        all = false;
                        break;
                    }
                }
                Ok(CValue::Bool(all))
            }
            InlineTransform::ListAny(pred) => {
                let items = list_items(get("list")?)?;
                let mut any = false;
                for item in items {
                    if eval_predicate(pred, item)? {
                        any = true;
                        break;
                    }
                }
                Ok(CValue::Bool(any))
            }
        }
    }
}

fn bool_binop(a: &CValue, b: &CValue, f: impl Fn(bool, bool) -> bool) -> Result<CValue> {
    match (a, b) {
        (CValue::Bool(x), CValue::Bool(y)) => Ok(CValue::Bool(f(*x, *y))),
        _ => Err(ConstellationError::type_mismatch(
            CType::Bool,
            a.type_of(),
            "expected two Bool inputs".to_string(),
        )),
    }
}

fn list_items(value: &CValue) -> Result<&[CValue]> {
    match value {
        CValue::List { items, .. } => Ok(items),
        other => Err(ConstellationError::type_mismatch(
            CType::list(CType::Unit),
            other.type_of(),
            "expected a List input".to_string(),
        )),
    }
}

fn element_type(value: &CValue) -> Result<CType> {
    match value {
        CValue::List { element_type, .. } => Ok(element_type.clone()),
        other => Err(ConstellationError::type_mismatch(
            CType::list(CType::Unit),
            other.type_of(),
            "expected a List input".to_string(),
        )),
    }
}

fn eval_predicate(pred: &Predicate, value: &CValue) -> Result<bool> {
    compare(pred.op, value, &pred.constant)
}

fn compare(op: CompareOp, a: &CValue, b: &CValue) -> Result<bool> {
    if a.type_of() != b.type_of() {
        return Err(ConstellationError::type_mismatch(
            a.type_of(),
            b.type_of(),
            "Compare requires operands of the same type".to_string(),
        ));
    }
    let ordering = match (a, b) {
        (CValue::Int(x), CValue::Int(y)) => x.partial_cmp(y),
        (CValue::Float(x), CValue::Float(y)) => x.partial_cmp(y),
        (CValue::String(x), CValue::String(y)) => x.partial_cmp(y),
        (CValue::Bool(x), CValue::Bool(y)) => x.partial_cmp(y),
        _ => {
            return match op {
                CompareOp::Eq => Ok(a == b),
                CompareOp::Ne => Ok(a != b),
                _ => Err(ConstellationError::UnsupportedOperation {
                    operation: format!("{op:?} on {}", a.type_of()),
                    context: crate::error::ErrorContext::new(),
                }),
            }
        }
    };
    let ordering = ordering.ok_or_else(|| ConstellationError::UnsupportedOperation {
        operation: format!("{op:?} on non-comparable NaN operand"),
        context: crate::error::ErrorContext::new(),
    })?;
    Ok(match op {
        CompareOp::Eq => ordering == std::cmp::Ordering::Equal,
        CompareOp::Ne => ordering != std::cmp::Ordering::Equal,
        CompareOp::Lt => ordering == std::cmp::Ordering::Less,
        CompareOp::Le => ordering != std::cmp::Ordering::Greater,
        CompareOp::Gt => ordering == std::cmp::Ordering::Greater,
        CompareOp::Ge => ordering != std::cmp::Ordering::Less,
    })
}

fn arithmetic(op: ArithOp, a: &CValue, b: &CValue) -> Result<CValue> {
    match (a, b) {
        (CValue::Int(x), CValue::Int(y)) => {
            let result = match op {
                ArithOp::Add => x.checked_add(*y),
                ArithOp::Sub => x.checked_sub(*y),
                ArithOp::Mul => x.checked_mul(*y),
                ArithOp::Div => {
                    if *y == 0 {
                        None
                    } else {
                        x.checked_div(*y)
                    }
                }
            };
            result.map(CValue::Int).ok_or_else(|| ConstellationError::TypeConversion {
                message: format!("arithmetic overflow or division by zero in {op:?}"),
                context: crate::error::ErrorContext::new(),
            })
        }
        (CValue::Float(x), CValue::Float(y)) => {
            let result = match op {
                ArithOp::Add => x + y,
                ArithOp::Sub => x - y,
                ArithOp::Mul => x * y,
                ArithOp::Div => x / y,
            };
            Ok(CValue::Float(result))
        }
        _ => Err(ConstellationError::type_mismatch(
            CType::Int,
            a.type_of(),
            "Arithmetic requires two numerics of the same type".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn inputs(pairs: &[(&str, CValue)]) -> BTreeMap<String, CValue> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn project_extracts_field() {
        let product = CValue::Product(BTreeMap::from([
            ("a".to_string(), CValue::Int(1)),
            ("b".to_string(), CValue::Bool(true)),
        ]));
        let transform = InlineTransform::Project { field: "b".to_string() };
        let result = transform.apply(&inputs(&[("value", product)])).unwrap();
        assert_eq!(result, CValue::Bool(true));
    }

    #[test]
    fn merge_rejects_overlapping_fields() {
        let a = CValue::Product(BTreeMap::from([("x".to_string(), CValue::Int(1))]));
        let b = CValue::Product(BTreeMap::from([("x".to_string(), CValue::Int(2))]));
        let err = InlineTransform::Merge.apply(&inputs(&[("a", a), ("b", b)])).unwrap_err();
        assert_eq!(err.error_code(), "TYPE_CONVERSION");
    }

    #[test]
    fn arithmetic_add_ints() {
        let result = InlineTransform::Arithmetic(ArithOp::Add)
            .apply(&inputs(&[("a", CValue::Int(3)), ("b", CValue::Int(4))]))
            .unwrap();
        assert_eq!(result, CValue::Int(7));
    }

    #[test]
    fn arithmetic_div_by_zero_errors() {
        let err = InlineTransform::Arithmetic(ArithOp::Div)
            .apply(&inputs(&[("a", CValue::Int(3)), ("b", CValue::Int(0))]))
            .unwrap_err();
        assert_eq!(err.error_code(), "TYPE_CONVERSION");
    }

    #[test]
    fn conditional_picks_branch() {
        let result = InlineTransform::Conditional
            .apply(&inputs(&[
                ("condition", CValue::Bool(false)),
                ("then_branch", CValue::Int(1)),
                ("else_branch", CValue::Int(2)),
            ]))
            .unwrap();
        assert_eq!(result, CValue::Int(2));
    }

    #[test]
    fn list_filter_keeps_matching_elements() {
        let list = CValue::list(CType::Int, vec![CValue::Int(1), CValue::Int(5), CValue::Int(9)]);
        let pred = Predicate { op: CompareOp::Gt, constant: CValue::Int(3) };
        let result = InlineTransform::ListFilter(pred).apply(&inputs(&[("list", list)])).unwrap();
        assert_eq!(
            result,
            CValue::list(CType::Int, vec![CValue::Int(5), CValue::Int(9)])
        );
    }

    #[test]
    fn list_all_and_any() {
        let list = CValue::list(CType::Int, vec![CValue::Int(2), CValue::Int(4)]);
        let pred = Predicate { op: CompareOp::Ge, constant: CValue::Int(2) };
        assert_eq!(
            InlineTransform::ListAll(pred.clone())
                .apply(&inputs(&[("list", list.clone())]))
                .unwrap(),
            CValue::Bool(true)
        );
        let pred_none = Predicate { op: CompareOp::Gt, constant: CValue::Int(10) };
        assert_eq!(
            InlineTransform::ListAny(pred_none).apply(&inputs(&[("list", list)])).unwrap(),
            CValue::Bool(false)
        );
    }
}
