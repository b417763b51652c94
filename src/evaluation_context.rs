use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Key under which the targeting key is placed in a flattened context.
pub const TARGETING_KEY: &str = "targetingKey";

/// Attributes describing who a flag is evaluated for.
///
/// ```
/// # use gofeatureflag::EvaluationContext;
/// let context = EvaluationContext::new("user-123").with_attribute("role", "admin");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationContext {
    /// Unique key of the subject (user id, session id, ...).
    pub targeting_key: Option<String>,
    /// Free-form attributes used by targeting rules.
    pub attributes: HashMap<String, Value>,
}

impl EvaluationContext {
    /// Create a context for the given targeting key.
    pub fn new(targeting_key: impl Into<String>) -> EvaluationContext {
        EvaluationContext {
            targeting_key: Some(targeting_key.into()),
            attributes: HashMap::new(),
        }
    }

    /// Add an attribute, replacing any previous value under `key`.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// `true` when the context carries `anonymous: true`.
    pub fn is_anonymous(&self) -> bool {
        self.attributes
            .get("anonymous")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Merge the targeting key and attributes into a single map.
    ///
    /// An attribute named `targetingKey` wins over the targeting key.
    pub fn flatten(&self) -> Map<String, Value> {
        let mut ctx = Map::new();
        if let Some(targeting_key) = self.targeting_key.as_deref().filter(|k| !k.is_empty()) {
            ctx.insert(TARGETING_KEY.to_owned(), targeting_key.into());
        }
        ctx.extend(
            self.attributes
                .iter()
                .map(|(key, value)| (key.clone(), value.clone())),
        );
        ctx
    }
}
