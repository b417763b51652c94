use std::sync::Arc;

use serde_json::{Map, Value};

use crate::{
    api::{CollectorApi, ConfigurationApi, GoFeatureFlagApi},
    data_collector::DataCollectorHook,
    evaluator::{EvaluatorState, InProcessEvaluator, InProcessEvaluatorConfig},
    events::{
        event_publisher::{EventPublisher, EventPublisherConfig},
        exporter_metadata,
    },
    flag_types::FlagValue,
    poller_thread::PollerThreadConfig,
    wasm::{EvaluationEngine, WasmBridge},
    EvaluationContext, ProviderOptions, ResolutionDetails, Result,
};

/// Static information about the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderMetadata {
    /// Provider name.
    pub name: &'static str,
}

/// Evaluates GO Feature Flag flags in-process and reports their usage to the relay proxy.
///
/// # Examples
/// ```no_run
/// # fn main() -> gofeatureflag::Result<()> {
/// use gofeatureflag::{EvaluationContext, GoFeatureFlagProvider, ProviderOptions};
///
/// let provider = GoFeatureFlagProvider::new(ProviderOptions::from_endpoint("http://localhost:1031"))?;
/// provider.initialize()?;
///
/// let context = EvaluationContext::new("user-123");
/// let details = provider.resolve_boolean_details("new-checkout", false, &context)?;
/// println!("new-checkout = {}", details.value);
///
/// provider.shutdown()?;
/// # Ok(())
/// # }
/// ```
pub struct GoFeatureFlagProvider {
    evaluator: Arc<InProcessEvaluator>,
    data_collector: DataCollectorHook,
}

impl GoFeatureFlagProvider {
    /// Name reported in [`ProviderMetadata`].
    pub const NAME: &'static str = "GO Feature Flag";

    /// Create a provider talking to the relay proxy described by `options`.
    ///
    /// Nothing is fetched or loaded until [`GoFeatureFlagProvider::initialize`] is called.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidOptions`](crate::Error::InvalidOptions) or
    ///   [`Error::InvalidEndpoint`](crate::Error::InvalidEndpoint) if `options` are invalid.
    /// - [`Error::Network`](crate::Error::Network) if the HTTP client cannot be built.
    pub fn new(options: ProviderOptions) -> Result<GoFeatureFlagProvider> {
        options.validate()?;
        let api = Arc::new(GoFeatureFlagApi::new(&options)?);
        let engine = Arc::new(WasmBridge::new(
            options.wasm_file_path.clone(),
            options.wasm_pool_size,
        ));
        Ok(GoFeatureFlagProvider::from_parts(
            &options,
            api.clone(),
            api,
            engine,
        ))
    }

    /// Create a provider from explicit collaborators. Only the tuning knobs of `options` are
    /// used; the endpoint and module path are ignored.
    pub fn from_parts(
        options: &ProviderOptions,
        configuration_api: Arc<dyn ConfigurationApi>,
        collector_api: Arc<dyn CollectorApi>,
        engine: Arc<dyn EvaluationEngine>,
    ) -> GoFeatureFlagProvider {
        let evaluator = Arc::new(InProcessEvaluator::new(
            configuration_api,
            engine,
            InProcessEvaluatorConfig {
                poller: PollerThreadConfig::new()
                    .with_interval(options.flag_config_poll_interval)
                    .with_jitter(options.poll_jitter),
                flags: options.evaluation_flag_list.clone(),
            },
        ));

        let publisher = EventPublisher::new(
            collector_api,
            EventPublisherConfig {
                flush_interval: options.data_flush_interval,
                max_pending_events: options.max_pending_events,
                ..EventPublisherConfig::default()
            },
            exporter_metadata(options.exporter_metadata.clone()),
        );
        let data_collector = DataCollectorHook::new(
            publisher,
            Arc::clone(&evaluator),
            options.disable_data_collection,
        );

        GoFeatureFlagProvider {
            evaluator,
            data_collector,
        }
    }

    /// Provider metadata.
    pub fn metadata(&self) -> ProviderMetadata {
        ProviderMetadata {
            name: GoFeatureFlagProvider::NAME,
        }
    }

    /// Load the evaluation module, fetch the flag configuration and start background work.
    ///
    /// # Errors
    ///
    /// Fails if the module cannot be loaded or the configuration cannot be fetched. The provider
    /// stays unusable and `initialize()` may be retried.
    pub fn initialize(&self) -> Result<()> {
        self.evaluator.initialize()?;
        self.data_collector.initialize()?;
        log::info!(target: "gofeatureflag", "provider initialized");
        Ok(())
    }

    /// Flush pending events, stop background work and release the evaluation module.
    pub fn shutdown(&self) -> Result<()> {
        let flushed = self.data_collector.shutdown();
        let stopped = self.evaluator.shutdown();
        flushed.and(stopped)
    }

    /// Lifecycle state of the underlying evaluator.
    pub fn state(&self) -> EvaluatorState {
        self.evaluator.state()
    }

    /// The underlying evaluator, for diagnostics.
    pub fn evaluator(&self) -> &InProcessEvaluator {
        &self.evaluator
    }

    /// Resolve a boolean flag and record its usage.
    pub fn resolve_boolean_details(
        &self,
        flag_key: &str,
        default_value: bool,
        context: &EvaluationContext,
    ) -> Result<ResolutionDetails<bool>> {
        self.resolve_details(flag_key, default_value, context)
    }

    /// Resolve a string flag and record its usage.
    pub fn resolve_string_details(
        &self,
        flag_key: &str,
        default_value: String,
        context: &EvaluationContext,
    ) -> Result<ResolutionDetails<String>> {
        self.resolve_details(flag_key, default_value, context)
    }

    /// Resolve an integer flag and record its usage.
    pub fn resolve_integer_details(
        &self,
        flag_key: &str,
        default_value: i64,
        context: &EvaluationContext,
    ) -> Result<ResolutionDetails<i64>> {
        self.resolve_details(flag_key, default_value, context)
    }

    /// Resolve a float flag and record its usage.
    pub fn resolve_float_details(
        &self,
        flag_key: &str,
        default_value: f64,
        context: &EvaluationContext,
    ) -> Result<ResolutionDetails<f64>> {
        self.resolve_details(flag_key, default_value, context)
    }

    /// Resolve an object flag and record its usage.
    pub fn resolve_object_details(
        &self,
        flag_key: &str,
        default_value: Value,
        context: &EvaluationContext,
    ) -> Result<ResolutionDetails<Value>> {
        self.resolve_details(flag_key, default_value, context)
    }

    /// Record a custom tracking event.
    pub fn track(&self, event_name: &str, context: &EvaluationContext, details: Map<String, Value>) {
        self.data_collector.track(event_name, context, details);
    }

    fn resolve_details<T: FlagValue>(
        &self,
        flag_key: &str,
        default_value: T,
        context: &EvaluationContext,
    ) -> Result<ResolutionDetails<T>> {
        match self
            .evaluator
            .resolve(flag_key, default_value.clone(), context)
        {
            Ok(details) => {
                self.data_collector.after(flag_key, context, &details);
                Ok(details)
            }
            Err(err) => {
                self.data_collector.error(flag_key, context, &default_value);
                Err(err)
            }
        }
    }
}
