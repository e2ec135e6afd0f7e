//! Error taxonomy (`spec.md` §7).
//!
//! Every abstract error kind from the spec is a variant of a single
//! `thiserror`-derived enum rather than a trait-object bag, so callers can
//! match on `ConstellationError::error_code()` for a stable wire identifier
//! instead of downcasting. Every variant carries a free-form `context` map
//! used for diagnostics, and serializes to the `{errorCode, category,
//! message, context}` shape required by `spec.md` §7.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::types::CType;

pub type Result<T> = std::result::Result<T, ConstellationError>;

/// Free-form diagnostic context, e.g. `{"moduleName": "double", "input": "x"}`.
pub type ErrorContext = HashMap<String, String>;

fn ctx(pairs: &[(&str, String)]) -> ErrorContext {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

/// Build an `ErrorContext` from `(key, value)` pairs. Exposed for callers
/// outside this module that construct `ConstellationError` variants
/// directly rather than through one of the constructor helpers below.
pub fn ctx_pairs(pairs: &[(&str, String)]) -> ErrorContext {
    ctx(pairs)
}

/// Broad error family, used for retry classification and wire serialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorCategory {
    Type,
    Spec,
    Runtime,
    Suspension,
    PipelineLookup,
}

#[derive(Error, Debug, Clone)]
pub enum ConstellationError {
    // ---- Type errors ----
    #[error("type mismatch: expected {expected:?}, found {actual:?} ({context_msg})")]
    TypeMismatch {
        expected: CType,
        actual: CType,
        context_msg: String,
        context: ErrorContext,
    },
    #[error("input type mismatch on `{input_name}`: expected {expected:?}, found {actual:?}")]
    InputTypeMismatch {
        input_name: String,
        expected: CType,
        actual: CType,
        context: ErrorContext,
    },
    #[error("node type mismatch on `{node_name}`: expected {expected:?}, found {actual:?}")]
    NodeTypeMismatch {
        node_name: String,
        expected: CType,
        actual: CType,
        context: ErrorContext,
    },
    #[error("type conversion failed: {message}")]
    TypeConversion { message: String, context: ErrorContext },

    // ---- Compilation / spec errors (core sees them only on bad input) ----
    #[error("cycle detected in DAG at module `{module_name}`")]
    CycleDetected { module_name: String, context: ErrorContext },
    #[error("node not found: {node_id}")]
    NodeNotFound { node_id: String, context: ErrorContext },
    #[error("undefined variable: {name}")]
    UndefinedVariable { name: String, context: ErrorContext },
    #[error("unsupported operation: {operation}")]
    UnsupportedOperation { operation: String, context: ErrorContext },

    // ---- Runtime errors ----
    #[error("module not found: {name}")]
    ModuleNotFound { name: String, context: ErrorContext },
    #[error("module `{module_name}` execution failed: {cause}")]
    ModuleExecution {
        module_name: String,
        cause: String,
        context: ErrorContext,
    },
    #[error("data node not found: {node_id}")]
    DataNotFound { node_id: String, context: ErrorContext },
    #[error("runtime not initialized")]
    RuntimeNotInitialized { context: ErrorContext },
    #[error("validation failed: {errors:?}")]
    Validation {
        errors: Vec<String>,
        context: ErrorContext,
    },
    #[error("input validation failed: {message}")]
    InputValidation { message: String, context: ErrorContext },

    // ---- Suspension errors ----
    #[error("pipeline changed: expected structural hash {expected}, found {actual}")]
    PipelineChanged {
        expected: String,
        actual: String,
        context: ErrorContext,
    },
    #[error("resume already in progress for execution {execution_id}")]
    ResumeInProgress {
        execution_id: String,
        context: ErrorContext,
    },
    #[error("input `{name}` already provided")]
    InputAlreadyProvided { name: String, context: ErrorContext },
    #[error("node `{name}` already resolved")]
    NodeAlreadyResolved { name: String, context: ErrorContext },
    #[error("unknown node: {name}")]
    UnknownNode { name: String, context: ErrorContext },
    #[error("codec error: {message}")]
    Codec { message: String, context: ErrorContext },

    // ---- Pipeline-lookup errors ----
    #[error("pipeline not found: {reference}")]
    PipelineNotFound { reference: String, context: ErrorContext },
}

impl ConstellationError {
    /// Stable wire identifier, independent of enum discriminant order.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::TypeMismatch { .. } => "TYPE_MISMATCH",
            Self::InputTypeMismatch { .. } => "INPUT_TYPE_MISMATCH",
            Self::NodeTypeMismatch { .. } => "NODE_TYPE_MISMATCH",
            Self::TypeConversion { .. } => "TYPE_CONVERSION",
            Self::CycleDetected { .. } => "CYCLE_DETECTED",
            Self::NodeNotFound { .. } => "NODE_NOT_FOUND",
            Self::UndefinedVariable { .. } => "UNDEFINED_VARIABLE",
            Self::UnsupportedOperation { .. } => "UNSUPPORTED_OPERATION",
            Self::ModuleNotFound { .. } => "MODULE_NOT_FOUND",
            Self::ModuleExecution { .. } => "MODULE_EXECUTION_ERROR",
            Self::DataNotFound { .. } => "DATA_NOT_FOUND",
            Self::RuntimeNotInitialized { .. } => "RUNTIME_NOT_INITIALIZED",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::InputValidation { .. } => "INPUT_VALIDATION_ERROR",
            Self::PipelineChanged { .. } => "PIPELINE_CHANGED",
            Self::ResumeInProgress { .. } => "RESUME_IN_PROGRESS",
            Self::InputAlreadyProvided { .. } => "INPUT_ALREADY_PROVIDED",
            Self::NodeAlreadyResolved { .. } => "NODE_ALREADY_RESOLVED",
            Self::UnknownNode { .. } => "UNKNOWN_NODE",
            Self::Codec { .. } => "CODEC_ERROR",
            Self::PipelineNotFound { .. } => "PIPELINE_NOT_FOUND",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::TypeMismatch { .. }
            | Self::InputTypeMismatch { .. }
            | Self::NodeTypeMismatch { .. }
            | Self::TypeConversion { .. } => ErrorCategory::Type,
            Self::CycleDetected { .. }
            | Self::NodeNotFound { .. }
            | Self::UndefinedVariable { .. }
            | Self::UnsupportedOperation { .. } => ErrorCategory::Spec,
            Self::ModuleNotFound { .. }
            | Self::ModuleExecution { .. }
            | Self::DataNotFound { .. }
            | Self::RuntimeNotInitialized { .. }
            | Self::Validation { .. }
            | Self::InputValidation { .. } => ErrorCategory::Runtime,
            Self::PipelineChanged { .. }
            | Self::ResumeInProgress { .. }
            | Self::InputAlreadyProvided { .. }
            | Self::NodeAlreadyResolved { .. }
            | Self::UnknownNode { .. }
            | Self::Codec { .. } => ErrorCategory::Suspension,
            Self::PipelineNotFound { .. } => ErrorCategory::PipelineLookup,
        }
    }

    pub fn context(&self) -> &ErrorContext {
        match self {
            Self::TypeMismatch { context, .. }
            | Self::InputTypeMismatch { context, .. }
            | Self::NodeTypeMismatch { context, .. }
            | Self::TypeConversion { context, .. }
            | Self::CycleDetected { context, .. }
            | Self::NodeNotFound { context, .. }
            | Self::UndefinedVariable { context, .. }
            | Self::UnsupportedOperation { context, .. }
            | Self::ModuleNotFound { context, .. }
            | Self::ModuleExecution { context, .. }
            | Self::DataNotFound { context, .. }
            | Self::RuntimeNotInitialized { context }
            | Self::Validation { context, .. }
            | Self::InputValidation { context, .. }
            | Self::PipelineChanged { context, .. }
            | Self::ResumeInProgress { context, .. }
            | Self::InputAlreadyProvided { context, .. }
            | Self::NodeAlreadyResolved { context, .. }
            | Self::UnknownNode { context, .. }
            | Self::Codec { context, .. }
            | Self::PipelineNotFound { context, .. } => context,
        }
    }

    pub fn type_mismatch(expected: CType, actual: CType, context_msg: impl Into<String>) -> Self {
        Self::TypeMismatch {
            expected,
            actual,
            context_msg: context_msg.into(),
            context: ErrorContext::new(),
        }
    }

    pub fn input_type_mismatch(input_name: impl Into<String>, expected: CType, actual: CType) -> Self {
        let input_name = input_name.into();
        Self::InputTypeMismatch {
            context: ctx(&[("inputName", input_name.clone())]),
            input_name,
            expected,
            actual,
        }
    }

    pub fn node_type_mismatch(node_name: impl Into<String>, expected: CType, actual: CType) -> Self {
        let node_name = node_name.into();
        Self::NodeTypeMismatch {
            context: ctx(&[("nodeName", node_name.clone())]),
            node_name,
            expected,
            actual,
        }
    }

    pub fn module_not_found(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::ModuleNotFound {
            context: ctx(&[("moduleName", name.clone())]),
            name,
        }
    }

    pub fn module_execution(module_name: impl Into<String>, cause: impl Into<String>) -> Self {
        let module_name = module_name.into();
        let cause = cause.into();
        Self::ModuleExecution {
            context: ctx(&[("moduleName", module_name.clone())]),
            module_name,
            cause,
        }
    }

    pub fn cycle_detected(module_name: impl Into<String>) -> Self {
        let module_name = module_name.into();
        Self::CycleDetected {
            context: ctx(&[("moduleName", module_name.clone())]),
            module_name,
        }
    }
}

/// Stable JSON wire shape: `{errorCode, category, message, context}`.
impl Serialize for ConstellationError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("ConstellationError", 4)?;
        s.serialize_field("errorCode", self.error_code())?;
        s.serialize_field("category", &self.category())?;
        s.serialize_field("message", &self.to_string())?;
        s.serialize_field("context", self.context())?;
        s.end()
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCategory::Type => "type",
            ErrorCategory::Spec => "spec",
            ErrorCategory::Runtime => "runtime",
            ErrorCategory::Suspension => "suspension",
            ErrorCategory::PipelineLookup => "pipeline_lookup",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_is_stable_string_not_discriminant() {
        let e = ConstellationError::module_not_found("double");
        assert_eq!(e.error_code(), "MODULE_NOT_FOUND");
        assert_eq!(e.category(), ErrorCategory::Runtime);
    }

    #[test]
    fn serializes_to_stable_shape() {
        let e = ConstellationError::cycle_detected("inc");
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["errorCode"], "CYCLE_DETECTED");
        assert_eq!(json["category"], "spec");
        assert!(json["context"]["moduleName"] == "inc");
    }
}
