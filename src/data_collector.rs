//! Turns evaluation outcomes and tracking calls into events for the data collector.
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::{
    evaluator::InProcessEvaluator,
    events::{event_publisher::EventPublisher, FeatureEvent, TrackingEvent},
    flag_types::FlagValue,
    EvaluationContext, ResolutionDetails, Result,
};

/// User key reported for contexts without a targeting key.
pub const DEFAULT_TARGETING_KEY: &str = "undefined-targetingKey";

const CONTEXT_KIND_ANONYMOUS: &str = "anonymousUser";
const CONTEXT_KIND_USER: &str = "user";

/// Records flag usage through an [`EventPublisher`].
///
/// Evaluations of flags that are not trackable are skipped. Nothing is recorded when data
/// collection is disabled.
pub struct DataCollectorHook {
    publisher: EventPublisher,
    evaluator: Arc<InProcessEvaluator>,
    disabled: bool,
}

impl DataCollectorHook {
    /// Create a hook that checks trackability against `evaluator`.
    pub fn new(
        publisher: EventPublisher,
        evaluator: Arc<InProcessEvaluator>,
        disabled: bool,
    ) -> DataCollectorHook {
        DataCollectorHook {
            publisher,
            evaluator,
            disabled,
        }
    }

    /// Start periodic publishing.
    pub fn initialize(&self) -> Result<()> {
        self.publisher.start()
    }

    /// Stop periodic publishing and flush buffered events.
    pub fn shutdown(&self) -> Result<()> {
        self.publisher.stop()
    }

    /// Record a successful evaluation.
    pub fn after<T: FlagValue>(
        &self,
        flag_key: &str,
        context: &EvaluationContext,
        details: &ResolutionDetails<T>,
    ) {
        if !self.should_record(flag_key) {
            return;
        }
        self.publisher.add_event(FeatureEvent {
            context_kind: context_kind(context).to_owned(),
            user_key: user_key(context),
            creation_date: now(),
            key: flag_key.to_owned(),
            variation: details
                .variant
                .clone()
                .unwrap_or_else(|| FeatureEvent::SDK_DEFAULT_VARIATION.to_owned()),
            value: details.value.to_json(),
            default: false,
            source: FeatureEvent::SOURCE_PROVIDER_CACHE.to_owned(),
            metadata: details.flag_metadata.clone(),
        });
    }

    /// Record a failed evaluation that fell back to `default_value`.
    pub fn error<T: FlagValue>(
        &self,
        flag_key: &str,
        context: &EvaluationContext,
        default_value: &T,
    ) {
        if !self.should_record(flag_key) {
            return;
        }
        self.publisher.add_event(FeatureEvent {
            context_kind: context_kind(context).to_owned(),
            user_key: user_key(context),
            creation_date: now(),
            key: flag_key.to_owned(),
            variation: FeatureEvent::SDK_DEFAULT_VARIATION.to_owned(),
            value: default_value.to_json(),
            default: true,
            source: FeatureEvent::SOURCE_PROVIDER_CACHE.to_owned(),
            metadata: Map::new(),
        });
    }

    /// Record a custom tracking event.
    pub fn track(
        &self,
        event_name: &str,
        context: &EvaluationContext,
        details: Map<String, Value>,
    ) {
        if self.disabled {
            return;
        }
        self.publisher.add_event(TrackingEvent {
            context_kind: context_kind(context).to_owned(),
            user_key: user_key(context),
            creation_date: now(),
            key: event_name.to_owned(),
            evaluation_context: context.flatten(),
            tracking_event_details: details,
        });
    }

    /// Number of events waiting to be published.
    pub fn pending_events(&self) -> usize {
        self.publisher.pending_events()
    }

    fn should_record(&self, flag_key: &str) -> bool {
        !self.disabled && self.evaluator.is_flag_trackable(flag_key)
    }
}

fn context_kind(context: &EvaluationContext) -> &'static str {
    if context.is_anonymous() {
        CONTEXT_KIND_ANONYMOUS
    } else {
        CONTEXT_KIND_USER
    }
}

fn user_key(context: &EvaluationContext) -> String {
    context
        .targeting_key
        .as_deref()
        .filter(|key| !key.is_empty())
        .unwrap_or(DEFAULT_TARGETING_KEY)
        .to_owned()
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}
