//! JSON Boundary (`spec.md` §4.2, C2).
//!
//! Converts JSON payloads into typed `CValue`s using one of three
//! strategies selected by payload size: eager recursive (< 10 KiB), lazy
//! with materialize-on-first-access caching (10–100 KiB), and a
//! streaming, event-driven converter that walks `serde_json`'s pull
//! parser directly rather than materializing an intermediate
//! `serde_json::Value` tree (> 100 KiB). All three enforce the same
//! configurable byte/array-element/nesting-depth limits and share the
//! same number and missing-field policy, so the observable result is
//! identical regardless of which strategy parsed it.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::de::DeserializeSeed;

use crate::config::EngineConfig;
use crate::error::{ConstellationError, Result};
use crate::types::CType;
use crate::value::CValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonStrategy {
    Eager,
    Lazy,
    Streaming,
}

#[derive(Debug, Clone, Copy)]
pub struct JsonLimits {
    pub max_bytes: usize,
    pub max_array_elements: usize,
    pub max_nesting_depth: usize,
}

impl From<&EngineConfig> for JsonLimits {
    fn from(config: &EngineConfig) -> Self {
        JsonLimits {
            max_bytes: config.json_max_bytes,
            max_array_elements: config.json_max_array_elements,
            max_nesting_depth: config.json_max_nesting_depth,
        }
    }
}

/// Selects a strategy by payload size (`spec.md` §4.2 table).
pub fn select_strategy(byte_len: usize) -> JsonStrategy {
    const EAGER_CEILING: usize = 10 * 1024;
    const LAZY_CEILING: usize = 100 * 1024;
    if byte_len < EAGER_CEILING {
        JsonStrategy::Eager
    } else if byte_len < LAZY_CEILING {
        JsonStrategy::Lazy
    } else {
        JsonStrategy::Streaming
    }
}

fn codec_err(message: impl Into<String>) -> ConstellationError {
    ConstellationError::Codec { message: message.into(), context: crate::error::ErrorContext::new() }
}

/// Convert a JSON payload to a `CValue` of the declared `ty`, choosing a
/// strategy by size and enforcing `limits` deterministically: a violation
/// fails the whole conversion, never exposing a partial value.
pub fn json_to_cvalue(bytes: &[u8], ty: &CType, limits: JsonLimits) -> Result<(CValue, JsonStrategy)> {
    if bytes.len() > limits.max_bytes {
        return Err(codec_err(format!(
            "payload of {} bytes exceeds max_bytes {}",
            bytes.len(),
            limits.max_bytes
        )));
    }
    let strategy = select_strategy(bytes.len());
    let value = match strategy {
        JsonStrategy::Eager => {
            let parsed: serde_json::Value =
                serde_json::from_slice(bytes).map_err(|e| codec_err(e.to_string()))?;
            convert_tree(&parsed, ty, limits, 0)?
        }
        JsonStrategy::Lazy => {
            let parsed: serde_json::Value =
                serde_json::from_slice(bytes).map_err(|e| codec_err(e.to_string()))?;
            let lazy = LazyDocument::new(parsed);
            lazy.materialize(&[], ty, limits)?
        }
        JsonStrategy::Streaming => {
            let mut deserializer = serde_json::Deserializer::from_slice(bytes);
            let seed = TypedSeed { ty, limits, depth: 0 };
            let value = seed.deserialize(&mut deserializer).map_err(|e| codec_err(e.to_string()))?;
            deserializer.end().map_err(|e| codec_err(e.to_string()))?;
            value
        }
    };
    Ok((value, strategy))
}

/// Recursive conversion shared by the eager and lazy strategies, operating
/// on an already-parsed `serde_json::Value` tree.
fn convert_tree(value: &serde_json::Value, ty: &CType, limits: JsonLimits, depth: usize) -> Result<CValue> {
    if depth > limits.max_nesting_depth {
        return Err(codec_err(format!("nesting depth exceeds max_nesting_depth {}", limits.max_nesting_depth)));
    }
    match (ty, value) {
        (CType::Unit, serde_json::Value::Null) => Ok(CValue::Unit),
        (CType::Bool, serde_json::Value::Bool(b)) => Ok(CValue::Bool(*b)),
        (CType::Int, serde_json::Value::Number(n)) => {
            let i = n.as_i64().ok_or_else(|| {
                codec_err(format!("JSON number {n} is not a 64-bit integer, required by Int"))
            })?;
            Ok(CValue::Int(i))
        }
        (CType::Float, serde_json::Value::Number(n)) => {
            let f = n.as_f64().ok_or_else(|| codec_err(format!("JSON number {n} does not fit in f64")))?;
            if !f.is_finite() {
                return Err(codec_err("NaN/Infinity are rejected by the Float policy".to_string()));
            }
            Ok(CValue::Float(f))
        }
        (CType::String, serde_json::Value::String(s)) => Ok(CValue::String(s.clone())),
        (CType::Option(inner), serde_json::Value::Null) => Ok(CValue::none((**inner).clone())),
        (CType::Option(inner), other) => {
            let converted = convert_tree(other, inner, limits, depth + 1)?;
            Ok(CValue::some((**inner).clone(), converted))
        }
        (CType::List(inner), serde_json::Value::Array(items)) => {
            if items.len() > limits.max_array_elements {
                return Err(codec_err(format!(
                    "array of {} elements exceeds max_array_elements {}",
                    items.len(),
                    limits.max_array_elements
                )));
            }
            let converted = items
                .iter()
                .map(|item| convert_tree(item, inner, limits, depth + 1))
                .collect::<Result<Vec<_>>>()?;
            Ok(CValue::list((**inner).clone(), converted))
        }
        (CType::Map(key_ty, value_ty), serde_json::Value::Object(map)) => {
            if **key_ty != CType::String {
                return Err(codec_err("JSON objects only decode into Map<String, _>".to_string()));
            }
            if map.len() > limits.max_array_elements {
                return Err(codec_err(format!(
                    "object of {} entries exceeds max_array_elements {}",
                    map.len(),
                    limits.max_array_elements
                )));
            }
            let entries = map
                .iter()
                .map(|(k, v)| {
                    Ok((CValue::String(k.clone()), convert_tree(v, value_ty, limits, depth + 1)?))
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(CValue::Map { key_type: CType::String, value_type: (**value_ty).clone(), entries })
        }
        (CType::Product(fields), serde_json::Value::Object(map)) => {
            let mut out = BTreeMap::new();
            for (name, field_ty) in fields {
                match map.get(name) {
                    Some(v) => {
                        out.insert(name.clone(), convert_tree(v, field_ty, limits, depth + 1)?);
                    }
                    None => match field_ty {
                        CType::Option(inner) => {
                            out.insert(name.clone(), CValue::none((**inner).clone()));
                        }
                        _ => {
                            return Err(ConstellationError::type_mismatch(
                                field_ty.clone(),
                                CType::Unit,
                                format!("missing required field `{name}`"),
                            ))
                        }
                    },
                }
            }
            Ok(CValue::Product(out))
        }
        (expected, actual) => Err(ConstellationError::type_mismatch(
            expected.clone(),
            json_shape_guess(actual),
            "JSON shape disagrees with declared type".to_string(),
        )),
    }
}

fn json_shape_guess(value: &serde_json::Value) -> CType {
    match value {
        serde_json::Value::Null => CType::Unit,
        serde_json::Value::Bool(_) => CType::Bool,
        serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => CType::Int,
        serde_json::Value::Number(_) => CType::Float,
        serde_json::Value::String(_) => CType::String,
        serde_json::Value::Array(_) => CType::list(CType::Unit),
        serde_json::Value::Object(_) => CType::product([]),
    }
}

/// Lazy wrapper: materializes sub-values on first access and caches the
/// result, keyed by JSON-pointer-style path (`spec.md` §4.2: "wrap
/// values; materialize on first access; cache after materialization").
struct LazyDocument {
    root: serde_json::Value,
    cache: DashMap<Vec<String>, CValue>,
}

impl LazyDocument {
    fn new(root: serde_json::Value) -> Self {
        Self { root, cache: DashMap::new() }
    }

    fn materialize(&self, path: &[String], ty: &CType, limits: JsonLimits) -> Result<CValue> {
        if let Some(cached) = self.cache.get(path) {
            return Ok(cached.clone());
        }
        let node = self.navigate(path)?;
        let value = convert_tree(node, ty, limits, path.len())?;
        self.cache.insert(path.to_vec(), value.clone());
        Ok(value)
    }

    fn navigate(&self, path: &[String]) -> Result<&serde_json::Value> {
        let mut node = &self.root;
        for segment in path {
            node = node
                .get(segment)
                .ok_or_else(|| codec_err(format!("no such path segment `{segment}`")))?;
        }
        Ok(node)
    }
}

/// A `DeserializeSeed` that decodes directly into a `CValue` of a known
/// `CType`, enforcing limits as `serde_json`'s pull parser emits events —
/// avoids materializing a full `serde_json::Value` tree for large
/// payloads, which is the point of the streaming strategy.
struct TypedSeed<'a> {
    ty: &'a CType,
    limits: JsonLimits,
    depth: usize,
}

impl<'de, 'a> DeserializeSeed<'de> for TypedSeed<'a> {
    type Value = CValue;

    fn deserialize<D>(self, deserializer: D) -> std::result::Result<Self::Value, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error as _;
        if self.depth > self.limits.max_nesting_depth {
            return Err(D::Error::custom(format!(
                "nesting depth exceeds max_nesting_depth {}",
                self.limits.max_nesting_depth
            )));
        }
        struct TypedVisitor<'a> {
            ty: &'a CType,
            limits: JsonLimits,
            depth: usize,
        }

        impl<'de, 'a> serde::de::Visitor<'de> for TypedVisitor<'a> {
            type Value = CValue;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                write!(f, "a JSON value matching {}", self.ty)
            }

            fn visit_unit<E: serde::de::Error>(self) -> std::result::Result<CValue, E> {
                match self.ty {
                    CType::Unit => Ok(CValue::Unit),
                    CType::Option(inner) => Ok(CValue::none((**inner).clone())),
                    other => Err(E::custom(format!("expected {other}, found null"))),
                }
            }

            fn visit_bool<E: serde::de::Error>(self, v: bool) -> std::result::Result<CValue, E> {
                match self.ty {
                    CType::Bool => Ok(CValue::Bool(v)),
                    other => Err(E::custom(format!("expected {other}, found bool"))),
                }
            }

            fn visit_i64<E: serde::de::Error>(self, v: i64) -> std::result::Result<CValue, E> {
                match self.ty {
                    CType::Int => Ok(CValue::Int(v)),
                    CType::Float => Ok(CValue::Float(v as f64)),
                    other => Err(E::custom(format!("expected {other}, found integer"))),
                }
            }

            fn visit_u64<E: serde::de::Error>(self, v: u64) -> std::result::Result<CValue, E> {
                match self.ty {
                    CType::Int => i64::try_from(v)
                        .map(CValue::Int)
                        .map_err(|_| E::custom("integer exceeds i64 range")),
                    CType::Float => Ok(CValue::Float(v as f64)),
                    other => Err(E::custom(format!("expected {other}, found integer"))),
                }
            }

            fn visit_f64<E: serde::de::Error>(self, v: f64) -> std::result::Result<CValue, E> {
                match self.ty {
                    CType::Float if v.is_finite() => Ok(CValue::Float(v)),
                    CType::Float => Err(E::custom("NaN/Infinity are rejected by the Float policy")),
                    other => Err(E::custom(format!("expected {other}, found float"))),
                }
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> std::result::Result<CValue, E> {
                match self.ty {
                    CType::String => Ok(CValue::String(v.to_string())),
                    other => Err(E::custom(format!("expected {other}, found string"))),
                }
            }

            fn visit_some<D>(self, deserializer: D) -> std::result::Result<CValue, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                match self.ty {
                    CType::Option(inner) => {
                        let seed = TypedSeed { ty: inner, limits: self.limits, depth: self.depth + 1 };
                        let value = seed.deserialize(deserializer)?;
                        Ok(CValue::some((**inner).clone(), value))
                    }
                    other => Err(serde::de::Error::custom(format!("expected {other}, found a present Option"))),
                }
            }

            fn visit_none<E: serde::de::Error>(self) -> std::result::Result<CValue, E> {
                self.visit_unit()
            }

            fn visit_seq<A>(self, mut seq: A) -> std::result::Result<CValue, A::Error>
            where
                A: serde::de::SeqAccess<'de>,
            {
                let inner = match self.ty {
                    CType::List(inner) => inner,
                    other => return Err(serde::de::Error::custom(format!("expected {other}, found array"))),
                };
                let mut items = Vec::new();
                while let Some(item) = seq.next_element_seed(TypedSeed {
                    ty: inner,
                    limits: self.limits,
                    depth: self.depth + 1,
                })? {
                    items.push(item);
                    if items.len() > self.limits.max_array_elements {
                        return Err(serde::de::Error::custom(format!(
                            "array exceeds max_array_elements {}",
                            self.limits.max_array_elements
                        )));
                    }
                }
                Ok(CValue::list((**inner).clone(), items))
            }

            fn visit_map<A>(self, mut map: A) -> std::result::Result<CValue, A::Error>
            where
                A: serde::de::MapAccess<'de>,
            {
                match self.ty {
                    CType::Map(key_ty, value_ty) => {
                        if **key_ty != CType::String {
                            return Err(serde::de::Error::custom("JSON objects only decode into Map<String, _>"));
                        }
                        let mut entries = Vec::new();
                        while let Some(key) = map.next_key::<String>()? {
                            let value = map.next_value_seed(TypedSeed {
                                ty: value_ty,
                                limits: self.limits,
                                depth: self.depth + 1,
                            })?;
                            entries.push((CValue::String(key), value));
                            if entries.len() > self.limits.max_array_elements {
                                return Err(serde::de::Error::custom(format!(
                                    "object exceeds max_array_elements {}",
                                    self.limits.max_array_elements
                                )));
                            }
                        }
                        Ok(CValue::Map { key_type: CType::String, value_type: (**value_ty).clone(), entries })
                    }
                    CType::Product(fields) => {
                        let mut seen = BTreeMap::new();
                        while let Some(key) = map.next_key::<String>()? {
                            if let Some(field_ty) = fields.get(&key) {
                                let value = map.next_value_seed(TypedSeed {
                                    ty: field_ty,
                                    limits: self.limits,
                                    depth: self.depth + 1,
                                })?;
                                seen.insert(key, value);
                            } else {
                                let _ignored: serde::de::IgnoredAny = map.next_value()?;
                            }
                        }
                        for (name, field_ty) in fields {
                            if !seen.contains_key(name) {
                                match field_ty {
                                    CType::Option(inner) => {
                                        seen.insert(name.clone(), CValue::none((**inner).clone()));
                                    }
                                    _ => {
                                        return Err(serde::de::Error::custom(format!(
                                            "missing required field `{name}`"
                                        )))
                                    }
                                }
                            }
                        }
                        Ok(CValue::Product(seen))
                    }
                    other => Err(serde::de::Error::custom(format!("expected {other}, found object"))),
                }
            }
        }

        deserializer.deserialize_any(TypedVisitor { ty: self.ty, limits: self.limits, depth: self.depth })
    }
}

/// Shared arc-wrapped limits for embedding into long-lived engine state.
pub type SharedJsonLimits = Arc<JsonLimits>;

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> JsonLimits {
        JsonLimits { max_bytes: 1 << 20, max_array_elements: 100, max_nesting_depth: 10 }
    }

    #[test]
    fn strategy_selection_matches_size_bands() {
        assert_eq!(select_strategy(100), JsonStrategy::Eager);
        assert_eq!(select_strategy(50 * 1024), JsonStrategy::Lazy);
        assert_eq!(select_strategy(200 * 1024), JsonStrategy::Streaming);
    }

    #[test]
    fn eager_round_trip_for_small_product() {
        let ty = CType::product([("x".to_string(), CType::Int), ("y".to_string(), CType::Bool)]);
        let (value, strategy) = json_to_cvalue(br#"{"x": 3, "y": true}"#, &ty, limits()).unwrap();
        assert_eq!(strategy, JsonStrategy::Eager);
        assert_eq!(
            value,
            CValue::Product(BTreeMap::from([
                ("x".to_string(), CValue::Int(3)),
                ("y".to_string(), CValue::Bool(true)),
            ]))
        );
    }

    #[test]
    fn missing_optional_field_becomes_none() {
        let ty = CType::product([("x".to_string(), CType::option(CType::Int))]);
        let (value, _) = json_to_cvalue(br#"{}"#, &ty, limits()).unwrap();
        assert_eq!(value, CValue::Product(BTreeMap::from([("x".to_string(), CValue::none(CType::Int))])));
    }

    #[test]
    fn missing_required_field_fails() {
        let ty = CType::product([("x".to_string(), CType::Int)]);
        assert!(json_to_cvalue(br#"{}"#, &ty, limits()).is_err());
    }

    #[test]
    fn nan_and_infinity_are_rejected() {
        let ty = CType::Float;
        assert!(json_to_cvalue(b"NaN", &ty, limits()).is_err());
    }

    #[test]
    fn non_integral_number_rejected_for_int() {
        let ty = CType::Int;
        assert!(json_to_cvalue(b"3.5", &ty, limits()).is_err());
    }

    #[test]
    fn array_element_limit_enforced_eagerly() {
        let ty = CType::list(CType::Int);
        let json = format!("[{}]", (0..200).map(|i| i.to_string()).collect::<Vec<_>>().join(","));
        assert!(json_to_cvalue(json.as_bytes(), &ty, limits()).is_err());
    }

    #[test]
    fn streaming_strategy_produces_same_result_as_eager() {
        let ty = CType::product([("x".to_string(), CType::Int)]);
        let small = br#"{"x": 1}"#;
        let mut padded = small.to_vec();
        // Pad well past the lazy ceiling with whitespace so selection picks
        // Streaming while the semantic JSON stays identical.
        padded.extend(std::iter::repeat(b' ').take(200 * 1024));
        let reordered = format!(r#"{{"x": 1{}}}"#, " ".repeat(200 * 1024));
        let (value, strategy) = json_to_cvalue(reordered.as_bytes(), &ty, limits()).unwrap();
        assert_eq!(strategy, JsonStrategy::Streaming);
        assert_eq!(value, CValue::Product(BTreeMap::from([("x".to_string(), CValue::Int(1))])));
    }

    #[test]
    fn lazy_document_caches_materialized_subtree() {
        let root: serde_json::Value = serde_json::json!({"a": {"b": 1}});
        let doc = LazyDocument::new(root);
        let ty = CType::product([("b".to_string(), CType::Int)]);
        let first = doc.materialize(&["a".to_string()], &ty, limits()).unwrap();
        let second = doc.materialize(&["a".to_string()], &ty, limits()).unwrap();
        assert_eq!(first, second);
        assert_eq!(doc.cache.len(), 1);
    }
}
