//! Flag usage events reported to the relay proxy data collector.
use derive_more::From;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub mod event_publisher;

/// Metadata sent alongside every batch of events.
pub type ExporterMetadata = Map<String, Value>;

/// Build exporter metadata from user-provided entries, tagging it with the provider name.
pub fn exporter_metadata<I>(user_metadata: I) -> ExporterMetadata
where
    I: IntoIterator<Item = (String, Value)>,
{
    let mut meta: ExporterMetadata = user_metadata.into_iter().collect();
    meta.insert("provider".to_owned(), "rust".into());
    meta.insert("openfeature".to_owned(), true.into());
    meta
}

/// An event waiting to be sent to the collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, From)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Event {
    /// A flag evaluation.
    Feature(FeatureEvent),
    /// A custom tracking call.
    Tracking(TrackingEvent),
}

impl Event {
    /// Key of the flag or tracking event.
    pub fn key(&self) -> &str {
        match self {
            Event::Feature(event) => &event.key,
            Event::Tracking(event) => &event.key,
        }
    }

    /// Key of the user the event was generated for.
    pub fn user_key(&self) -> &str {
        match self {
            Event::Feature(event) => &event.user_key,
            Event::Tracking(event) => &event.user_key,
        }
    }
}

/// Records one flag evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureEvent {
    /// `"anonymousUser"` or `"user"`.
    pub context_kind: String,
    /// Targeting key of the evaluation context.
    pub user_key: String,
    /// Unix timestamp (seconds) of the evaluation.
    pub creation_date: i64,
    /// Flag key.
    pub key: String,
    /// Variation returned, or `"SdkDefault"` when the caller default was used.
    pub variation: String,
    /// Value returned to the caller.
    pub value: Value,
    /// `true` if evaluation failed and the caller default was returned.
    pub default: bool,
    /// Where the event was evaluated.
    pub source: String,
    /// Flag metadata reported by the evaluation.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl FeatureEvent {
    /// Source for events evaluated in-process.
    pub const SOURCE_PROVIDER_CACHE: &'static str = "PROVIDER_CACHE";
    /// Variation reported when the caller default was used.
    pub const SDK_DEFAULT_VARIATION: &'static str = "SdkDefault";
}

/// Records one custom tracking call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingEvent {
    /// `"anonymousUser"` or `"user"`.
    pub context_kind: String,
    /// Targeting key of the evaluation context.
    pub user_key: String,
    /// Unix timestamp (seconds) of the call.
    pub creation_date: i64,
    /// Name of the tracked event.
    pub key: String,
    /// Flattened evaluation context.
    pub evaluation_context: Map<String, Value>,
    /// User-provided details.
    pub tracking_event_details: Map<String, Value>,
}
