//! Typed views over the JSON values returned by flag evaluation.
use derive_more::Display;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Reason codes reported alongside a resolved value.
pub mod reason {
    /// The caller-supplied default was used.
    pub const DEFAULT: &str = "DEFAULT";
    /// The value is static (no targeting involved).
    pub const STATIC: &str = "STATIC";
    /// The value was picked by a targeting rule.
    pub const TARGETING_MATCH: &str = "TARGETING_MATCH";
    /// The value was picked by a percentage rollout.
    pub const SPLIT: &str = "SPLIT";
    /// The flag is disabled.
    pub const DISABLED: &str = "DISABLED";
    /// Evaluation failed.
    pub const ERROR: &str = "ERROR";
}

/// Type requested by a `resolve_*` accessor.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[allow(missing_docs)]
pub enum FlagType {
    #[display(fmt = "boolean")]
    Boolean,
    #[display(fmt = "string")]
    String,
    #[display(fmt = "integer")]
    Integer,
    #[display(fmt = "float")]
    Float,
    #[display(fmt = "object")]
    Object,
}

/// A Rust type that a flag can resolve to.
pub trait FlagValue: Sized + Clone {
    /// Type tag used for error reporting.
    const TYPE: FlagType;

    /// Convert a resolved JSON value, returning `None` when the runtime type does not match.
    fn from_json(value: &Value) -> Option<Self>;

    /// Convert back to JSON (used for the module input and for events).
    fn to_json(&self) -> Value;
}

impl FlagValue for bool {
    const TYPE: FlagType = FlagType::Boolean;

    fn from_json(value: &Value) -> Option<Self> {
        value.as_bool()
    }

    fn to_json(&self) -> Value {
        Value::Bool(*self)
    }
}

impl FlagValue for String {
    const TYPE: FlagType = FlagType::String;

    fn from_json(value: &Value) -> Option<Self> {
        value.as_str().map(ToOwned::to_owned)
    }

    fn to_json(&self) -> Value {
        Value::String(self.clone())
    }
}

impl FlagValue for i64 {
    const TYPE: FlagType = FlagType::Integer;

    fn from_json(value: &Value) -> Option<Self> {
        value.as_i64()
    }

    fn to_json(&self) -> Value {
        Value::from(*self)
    }
}

/// Floats accept integer values too.
impl FlagValue for f64 {
    const TYPE: FlagType = FlagType::Float;

    fn from_json(value: &Value) -> Option<Self> {
        value.as_f64()
    }

    fn to_json(&self) -> Value {
        Value::from(*self)
    }
}

/// Objects are JSON maps or lists.
impl FlagValue for Value {
    const TYPE: FlagType = FlagType::Object;

    fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Object(_) | Value::Array(_) => Some(value.clone()),
            _ => None,
        }
    }

    fn to_json(&self) -> Value {
        self.clone()
    }
}

/// Name of the JSON type of `value`.
pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

/// Outcome of a successful resolution.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionDetails<T> {
    /// Resolved value, or the caller default when the module returned none.
    pub value: T,
    /// Variation picked by the module.
    pub variant: Option<String>,
    /// One of the [`reason`] codes.
    pub reason: String,
    /// Metadata attached to the flag.
    pub flag_metadata: Map<String, Value>,
}
