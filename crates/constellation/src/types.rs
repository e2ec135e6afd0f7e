//! The runtime type algebra (`spec.md` §3, "Type algebra (`CType`)").
//!
//! `CType` is a closed sum of the shapes a data node can carry. Equality is
//! structural, and `Product` fields are stored in a `BTreeMap` so that two
//! independently-built `CType`s with the same fields always compare equal
//! and canonicalize (`crate::canonical`) identically regardless of
//! construction order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A runtime type. Closed sum per `spec.md` §3.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CType {
    Unit,
    Bool,
    Int,
    Float,
    String,
    Option(Box<CType>),
    List(Box<CType>),
    Map(Box<CType>, Box<CType>),
    /// Unordered by semantics, ordered by canonical form (`BTreeMap`).
    Product(BTreeMap<String, CType>),
}

impl CType {
    pub fn option(inner: CType) -> Self {
        CType::Option(Box::new(inner))
    }

    pub fn list(inner: CType) -> Self {
        CType::List(Box::new(inner))
    }

    pub fn map(key: CType, value: CType) -> Self {
        CType::Map(Box::new(key), Box::new(value))
    }

    pub fn product<I: IntoIterator<Item = (String, CType)>>(fields: I) -> Self {
        CType::Product(fields.into_iter().collect())
    }

    /// True for `Int`/`Float`, the two numeric shapes arithmetic transforms
    /// (`crate::transform`) accept.
    pub fn is_numeric(&self) -> bool {
        matches!(self, CType::Int | CType::Float)
    }

    /// Tag byte used by canonical serialization (`spec.md` §4.4) and by
    /// the suspension codec (`spec.md` §4.10).
    pub fn tag(&self) -> u8 {
        match self {
            CType::Unit => b'U',
            CType::Bool => b'B',
            CType::Int => b'I',
            CType::Float => b'F',
            CType::String => b'S',
            CType::Option(_) => b'O',
            CType::List(_) => b'L',
            CType::Map(_, _) => b'M',
            CType::Product(_) => b'P',
        }
    }
}

impl std::fmt::Display for CType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CType::Unit => write!(f, "Unit"),
            CType::Bool => write!(f, "Bool"),
            CType::Int => write!(f, "Int"),
            CType::Float => write!(f, "Float"),
            CType::String => write!(f, "String"),
            CType::Option(inner) => write!(f, "Option<{inner}>"),
            CType::List(inner) => write!(f, "List<{inner}>"),
            CType::Map(k, v) => write!(f, "Map<{k}, {v}>"),
            CType::Product(fields) => {
                write!(f, "Product{{")?;
                for (i, (name, ty)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{name}: {ty}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn product_equality_is_field_order_independent() {
        let a = CType::product([("x".to_string(), CType::Int), ("y".to_string(), CType::Int)]);
        let b = CType::product([("y".to_string(), CType::Int), ("x".to_string(), CType::Int)]);
        assert_eq!(a, b);
    }

    #[test]
    fn nested_types_compare_structurally() {
        let a = CType::list(CType::option(CType::String));
        let b = CType::list(CType::option(CType::String));
        assert_eq!(a, b);
        assert_ne!(a, CType::list(CType::String));
    }

    #[test]
    fn display_renders_product_fields_sorted() {
        let t = CType::product([("b".to_string(), CType::Bool), ("a".to_string(), CType::Int)]);
        assert_eq!(t.to_string(), "Product{a: Int, b: Bool}");
    }
}
