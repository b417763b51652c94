//! Evaluates flags in-process with the evaluation module, against a locally cached flag
//! configuration that is kept fresh by a background poller.
use std::{
    collections::HashSet,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use chrono::{DateTime, Utc};

use crate::{
    api::ConfigurationApi,
    configuration_store::{ConfigurationStore, FlagConfiguration},
    flag_types::{json_type_name, reason, FlagValue},
    poller_thread::{PollerThread, PollerThreadConfig},
    wasm::{EvaluationEngine, WasmEvaluationResponse, WasmFlagContext, WasmInput},
    Error, EvaluationContext, ResolutionDetails, Result,
};

const ERROR_CODE_FLAG_NOT_FOUND: &str = "FLAG_NOT_FOUND";
const ERROR_CODE_TYPE_MISMATCH: &str = "TYPE_MISMATCH";

/// Lifecycle of an [`InProcessEvaluator`]. Only `Ready` permits resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluatorState {
    /// Created, `initialize()` not called yet.
    Uninitialized,
    /// `initialize()` is running.
    Initializing,
    /// Configuration loaded, poller running.
    Ready,
    /// `shutdown()` is running.
    ShuttingDown,
    /// Shut down. `initialize()` may be called again.
    Stopped,
}

impl EvaluatorState {
    fn as_str(self) -> &'static str {
        match self {
            EvaluatorState::Uninitialized => "uninitialized",
            EvaluatorState::Initializing => "initializing",
            EvaluatorState::Ready => "ready",
            EvaluatorState::ShuttingDown => "shutting down",
            EvaluatorState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for EvaluatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for [`InProcessEvaluator`].
#[derive(Debug, Clone, Default)]
pub struct InProcessEvaluatorConfig {
    /// How often, and how promptly, the configuration poller runs.
    pub poller: PollerThreadConfig,
    /// Restrict fetched configuration to these flags. Empty means all flags.
    pub flags: Vec<String>,
}

/// Evaluates flags locally.
///
/// `initialize()` loads the evaluation engine, fetches the flag configuration (failing if it
/// can't) and starts polling for updates. Poll failures keep the last good configuration.
pub struct InProcessEvaluator {
    api: Arc<dyn ConfigurationApi>,
    engine: Arc<dyn EvaluationEngine>,
    store: Arc<ConfigurationStore>,
    config: InProcessEvaluatorConfig,
    state: Mutex<EvaluatorState>,
    poller: Mutex<Option<PollerThread>>,
}

impl InProcessEvaluator {
    /// Create an evaluator. Nothing happens until [`InProcessEvaluator::initialize`] is called.
    pub fn new(
        api: Arc<dyn ConfigurationApi>,
        engine: Arc<dyn EvaluationEngine>,
        config: InProcessEvaluatorConfig,
    ) -> InProcessEvaluator {
        InProcessEvaluator {
            api,
            engine,
            store: Arc::new(ConfigurationStore::new()),
            config,
            state: Mutex::new(EvaluatorState::Uninitialized),
            poller: Mutex::new(None),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EvaluatorState {
        *lock(&self.state)
    }

    /// Load the engine, fetch the initial configuration and start polling.
    ///
    /// # Errors
    ///
    /// - Any engine load error ([`Error::BridgeLoad`], [`Error::BridgeExportMissing`], ...).
    /// - The configuration fetch error ([`Error::Unauthorized`], [`Error::ConfigUnavailable`]).
    /// - [`Error::NotReady`] if the evaluator is already initialized or busy.
    pub fn initialize(&self) -> Result<()> {
        {
            let mut state = lock(&self.state);
            match *state {
                EvaluatorState::Uninitialized | EvaluatorState::Stopped => {
                    *state = EvaluatorState::Initializing;
                }
                EvaluatorState::Ready => return Ok(()),
                other => {
                    return Err(Error::NotReady {
                        state: other.as_str(),
                    })
                }
            }
        }

        match self.start() {
            Ok(()) => {
                *lock(&self.state) = EvaluatorState::Ready;
                log::debug!(target: "gofeatureflag", "in-process evaluator is ready");
                Ok(())
            }
            Err(err) => {
                log::warn!(target: "gofeatureflag", "failed to initialize in-process evaluator: {}", err);
                self.engine.dispose();
                self.store.clear();
                *lock(&self.state) = EvaluatorState::Uninitialized;
                Err(err)
            }
        }
    }

    fn start(&self) -> Result<()> {
        self.engine.initialize()?;

        let response = self.api.retrieve_flag_configuration(None, &self.config.flags)?;
        self.store
            .set_configuration(FlagConfiguration::from_server_response(response));

        let api = Arc::clone(&self.api);
        let store = Arc::clone(&self.store);
        let flags = self.config.flags.clone();
        let poller = PollerThread::start(
            "gofeatureflag-poller",
            self.config.poller.clone(),
            move || refresh_flag_configuration(api.as_ref(), &store, &flags),
        )?;
        *lock(&self.poller) = Some(poller);
        Ok(())
    }

    /// Stop polling, dispose the engine and drop the cached configuration. Calling it more than
    /// once is a no-op.
    pub fn shutdown(&self) -> Result<()> {
        {
            let mut state = lock(&self.state);
            match *state {
                EvaluatorState::Ready => *state = EvaluatorState::ShuttingDown,
                _ => return Ok(()),
            }
        }

        let result = match lock(&self.poller).take() {
            Some(poller) => poller.shutdown(),
            None => Ok(()),
        };
        self.engine.dispose();
        self.store.clear();
        *lock(&self.state) = EvaluatorState::Stopped;
        log::debug!(target: "gofeatureflag", "in-process evaluator stopped");
        result
    }

    /// Resolve a boolean flag.
    pub fn resolve_boolean(
        &self,
        flag_key: &str,
        default_value: bool,
        context: &EvaluationContext,
    ) -> Result<ResolutionDetails<bool>> {
        self.resolve(flag_key, default_value, context)
    }

    /// Resolve a string flag.
    pub fn resolve_string(
        &self,
        flag_key: &str,
        default_value: String,
        context: &EvaluationContext,
    ) -> Result<ResolutionDetails<String>> {
        self.resolve(flag_key, default_value, context)
    }

    /// Resolve an integer flag.
    pub fn resolve_integer(
        &self,
        flag_key: &str,
        default_value: i64,
        context: &EvaluationContext,
    ) -> Result<ResolutionDetails<i64>> {
        self.resolve(flag_key, default_value, context)
    }

    /// Resolve a float flag. Integer values are accepted.
    pub fn resolve_float(
        &self,
        flag_key: &str,
        default_value: f64,
        context: &EvaluationContext,
    ) -> Result<ResolutionDetails<f64>> {
        self.resolve(flag_key, default_value, context)
    }

    /// Resolve an object (JSON map or list) flag.
    pub fn resolve_object(
        &self,
        flag_key: &str,
        default_value: serde_json::Value,
        context: &EvaluationContext,
    ) -> Result<ResolutionDetails<serde_json::Value>> {
        self.resolve(flag_key, default_value, context)
    }

    /// Resolve `flag_key` as a `T`.
    ///
    /// # Errors
    ///
    /// - [`Error::NotReady`] unless the evaluator is ready.
    /// - [`Error::FlagNotFound`] if the flag is not in the configuration.
    /// - [`Error::TypeMismatch`] if the flag resolves to another type.
    /// - [`Error::General`] for any other error code reported by the engine.
    /// - Engine errors ([`Error::BridgeCall`], [`Error::BridgeInvalidResult`], ...).
    pub fn resolve<T: FlagValue>(
        &self,
        flag_key: &str,
        default_value: T,
        context: &EvaluationContext,
    ) -> Result<ResolutionDetails<T>> {
        let configuration = self.ready_configuration()?;

        let Some(flag) = configuration.get_flag(flag_key) else {
            return Err(Error::FlagNotFound {
                flag_key: flag_key.to_owned(),
                details: Some("flag not found in local configuration".to_owned()),
            });
        };

        let input = WasmInput {
            flag_key,
            flag,
            eval_context: context.flatten(),
            flag_context: WasmFlagContext {
                default_sdk_value: default_value.to_json(),
                evaluation_context_enrichment: &configuration.evaluation_context_enrichment,
            },
        };

        // `configuration` is an immutable snapshot; no lock is held across the engine call.
        let response = self.engine.evaluate(&input).map_err(|err| {
            log::warn!(target: "gofeatureflag", flag_key; "error occurred while evaluating a flag: {}", err);
            err
        })?;

        let details = into_resolution_details(flag_key, default_value, response)?;
        log::trace!(target: "gofeatureflag",
            flag_key,
            variant = details.variant.as_deref(),
            reason = details.reason.as_str();
            "evaluated a flag");
        Ok(details)
    }

    /// Whether usage of `flag_key` should be reported.
    ///
    /// Unknown flags are reported: a flag missing locally most likely has not propagated yet.
    pub fn is_flag_trackable(&self, flag_key: &str) -> bool {
        let Some(configuration) = self.store.get_configuration() else {
            return true;
        };
        match configuration.get_flag(flag_key) {
            Some(flag) => flag
                .get("trackEvents")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false),
            None => {
                log::warn!(target: "gofeatureflag", flag_key; "flag not found, treating it as trackable");
                true
            }
        }
    }

    /// Etag of the active configuration.
    pub fn etag(&self) -> Option<String> {
        self.store.get_configuration()?.etag.clone()
    }

    /// When the relay proxy last changed the active configuration.
    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.store.get_configuration()?.last_updated
    }

    /// Keys of all flags in the active configuration.
    pub fn flag_keys(&self) -> HashSet<String> {
        self.store
            .get_configuration()
            .map(|configuration| configuration.flags.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn ready_configuration(&self) -> Result<Arc<FlagConfiguration>> {
        let state = self.state();
        if state != EvaluatorState::Ready {
            return Err(Error::NotReady {
                state: state.as_str(),
            });
        }
        self.store.get_configuration().ok_or(Error::NotReady {
            state: EvaluatorState::Stopped.as_str(),
        })
    }

    #[cfg(test)]
    pub(crate) fn store(&self) -> &ConfigurationStore {
        &self.store
    }
}

impl Drop for InProcessEvaluator {
    fn drop(&mut self) {
        if let Some(poller) = lock(&self.poller).take() {
            poller.stop();
        }
    }
}

/// Fetch configuration with the current etag and merge the response into `store`.
///
/// Errors are logged and leave the store untouched.
fn refresh_flag_configuration(
    api: &dyn ConfigurationApi,
    store: &ConfigurationStore,
    flags: &[String],
) {
    let etag = store
        .get_configuration()
        .and_then(|configuration| configuration.etag.clone());

    log::debug!(target: "gofeatureflag", etag = etag.as_deref(); "polling flag configuration");
    match api.retrieve_flag_configuration(etag.as_deref(), flags) {
        Ok(response) => store.update(|current| current.refreshed_with(response)),
        Err(err) => {
            log::warn!(target: "gofeatureflag", "failed to refresh flag configuration: {}", err);
        }
    }
}

fn into_resolution_details<T: FlagValue>(
    flag_key: &str,
    default_value: T,
    response: WasmEvaluationResponse,
) -> Result<ResolutionDetails<T>> {
    if let Some(code) = response.error_code() {
        let details = response.error_details.clone();
        return Err(match code {
            ERROR_CODE_FLAG_NOT_FOUND => Error::FlagNotFound {
                flag_key: flag_key.to_owned(),
                details,
            },
            ERROR_CODE_TYPE_MISMATCH => Error::TypeMismatch {
                flag_key: flag_key.to_owned(),
                expected: T::TYPE,
                found: details.unwrap_or_else(|| "unknown".to_owned()),
            },
            code => Error::General {
                flag_key: flag_key.to_owned(),
                code: code.to_owned(),
                message: details.unwrap_or_else(|| format!("error evaluating flag: {code}")),
            },
        });
    }

    let value = match &response.value {
        None | Some(serde_json::Value::Null) => default_value,
        Some(value) => T::from_json(value).ok_or_else(|| Error::TypeMismatch {
            flag_key: flag_key.to_owned(),
            expected: T::TYPE,
            found: json_type_name(value).to_owned(),
        })?,
    };

    Ok(ResolutionDetails {
        value,
        variant: response.variation_type,
        reason: response.reason.unwrap_or_else(|| reason::DEFAULT.to_owned()),
        flag_metadata: response.metadata.unwrap_or_default(),
    })
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
