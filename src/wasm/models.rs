use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Request sent to the evaluation module.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WasmInput<'a> {
    /// Key of the evaluated flag.
    pub flag_key: &'a str,
    /// Flag definition, as served by the relay proxy.
    pub flag: &'a Value,
    /// Flattened evaluation context.
    pub eval_context: Map<String, Value>,
    /// Extra evaluation inputs.
    pub flag_context: WasmFlagContext<'a>,
}

/// Part of [`WasmInput`] that is not about the flag or the subject.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WasmFlagContext<'a> {
    /// Value the caller falls back to.
    pub default_sdk_value: Value,
    /// Attributes merged into the evaluation context by the module.
    pub evaluation_context_enrichment: &'a Map<String, Value>,
}

/// Response returned by the evaluation module.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WasmEvaluationResponse {
    /// Resolved value. `None` means "use the caller default".
    pub value: Option<Value>,
    /// Variation picked.
    pub variation_type: Option<String>,
    /// Reason code.
    pub reason: Option<String>,
    /// Error code; empty or absent on success.
    pub error_code: Option<String>,
    /// Human readable error details.
    pub error_details: Option<String>,
    /// Whether usage of this flag should be reported.
    pub track_events: Option<bool>,
    /// Flag metadata.
    pub metadata: Option<Map<String, Value>>,
}

impl WasmEvaluationResponse {
    /// Error code, if the module reported one.
    pub fn error_code(&self) -> Option<&str> {
        self.error_code.as_deref().filter(|code| !code.is_empty())
    }
}
