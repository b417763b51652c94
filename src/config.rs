use std::{collections::HashMap, path::PathBuf, time::Duration};

use serde_json::Value;
use url::Url;

use crate::{Error, Result};

/// Configuration for [`GoFeatureFlagProvider`](crate::GoFeatureFlagProvider) and the components
/// it is built from.
///
/// # Examples
/// ```
/// # use std::time::Duration;
/// # use gofeatureflag::ProviderOptions;
/// let mut options = ProviderOptions::from_endpoint("http://localhost:1031");
/// options
///     .api_key("my-api-key")
///     .flag_config_poll_interval(Duration::from_secs(30));
/// ```
#[derive(Debug, Clone)]
pub struct ProviderOptions {
    pub(crate) endpoint: String,
    pub(crate) api_key: Option<String>,
    pub(crate) timeout: Duration,
    pub(crate) flag_config_poll_interval: Duration,
    pub(crate) poll_jitter: Duration,
    pub(crate) data_flush_interval: Duration,
    pub(crate) max_pending_events: usize,
    pub(crate) wasm_file_path: PathBuf,
    pub(crate) wasm_pool_size: usize,
    pub(crate) disable_data_collection: bool,
    pub(crate) exporter_metadata: HashMap<String, Value>,
    pub(crate) evaluation_flag_list: Vec<String>,
}

impl ProviderOptions {
    /// Default timeout for HTTP calls to the relay proxy.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
    /// Default interval between two flag configuration polls.
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);
    /// Default interval between two periodic event flushes.
    pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(60_000);
    /// Default number of buffered events that triggers an immediate flush.
    pub const DEFAULT_MAX_PENDING_EVENTS: usize = 10_000;
    /// Location of the evaluation module shipped with the crate.
    pub const DEFAULT_WASM_FILE_PATH: &'static str = concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/wasm-releases/evaluation/gofeatureflag-evaluation.wasi"
    );

    /// Create default options for a relay proxy reachable at `endpoint`.
    pub fn from_endpoint(endpoint: impl Into<String>) -> Self {
        ProviderOptions {
            endpoint: endpoint.into(),
            api_key: None,
            timeout: ProviderOptions::DEFAULT_TIMEOUT,
            flag_config_poll_interval: ProviderOptions::DEFAULT_POLL_INTERVAL,
            poll_jitter: Duration::ZERO,
            data_flush_interval: ProviderOptions::DEFAULT_FLUSH_INTERVAL,
            max_pending_events: ProviderOptions::DEFAULT_MAX_PENDING_EVENTS,
            wasm_file_path: PathBuf::from(ProviderOptions::DEFAULT_WASM_FILE_PATH),
            wasm_pool_size: 1,
            disable_data_collection: false,
            exporter_metadata: HashMap::new(),
            evaluation_flag_list: Vec::new(),
        }
    }

    /// API key sent as `X-API-Key` when the relay proxy requires authentication.
    pub fn api_key(&mut self, api_key: impl Into<String>) -> &mut Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Timeout applied to every HTTP call.
    pub fn timeout(&mut self, timeout: Duration) -> &mut Self {
        self.timeout = timeout;
        self
    }

    /// Interval between two flag configuration polls.
    pub fn flag_config_poll_interval(&mut self, interval: Duration) -> &mut Self {
        self.flag_config_poll_interval = interval;
        self
    }

    /// Random duration subtracted from each poll interval so that many processes do not poll in
    /// lockstep.
    pub fn poll_jitter(&mut self, jitter: Duration) -> &mut Self {
        self.poll_jitter = jitter;
        self
    }

    /// Interval between two periodic event flushes.
    pub fn data_flush_interval(&mut self, interval: Duration) -> &mut Self {
        self.data_flush_interval = interval;
        self
    }

    /// Number of buffered events that triggers an immediate flush. Twice this number is the hard
    /// cap of the event buffer.
    pub fn max_pending_events(&mut self, max_pending_events: usize) -> &mut Self {
        self.max_pending_events = max_pending_events;
        self
    }

    /// Path to the evaluation module.
    pub fn wasm_file_path(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.wasm_file_path = path.into();
        self
    }

    /// Number of isolated module instances used for concurrent evaluation.
    pub fn wasm_pool_size(&mut self, pool_size: usize) -> &mut Self {
        self.wasm_pool_size = pool_size;
        self
    }

    /// Do not report flag usage to the data collector.
    pub fn disable_data_collection(&mut self, disable: bool) -> &mut Self {
        self.disable_data_collection = disable;
        self
    }

    /// Extra metadata sent along with every batch of events.
    pub fn exporter_metadata(
        &mut self,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> &mut Self {
        self.exporter_metadata.insert(key.into(), value.into());
        self
    }

    /// Restrict configuration fetches to these flags. Empty means all flags.
    pub fn evaluation_flag_list(&mut self, flags: Vec<String>) -> &mut Self {
        self.evaluation_flag_list = flags;
        self
    }

    /// Check that the options are usable.
    pub fn validate(&self) -> Result<()> {
        let endpoint = Url::parse(&self.endpoint).map_err(Error::InvalidEndpoint)?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(Error::InvalidOptions(format!(
                "endpoint scheme must be http or https, got {:?}",
                endpoint.scheme()
            )));
        }
        if self.flag_config_poll_interval.is_zero() {
            return Err(Error::InvalidOptions(
                "flag_config_poll_interval must be positive".to_owned(),
            ));
        }
        if self.data_flush_interval.is_zero() {
            return Err(Error::InvalidOptions(
                "data_flush_interval must be positive".to_owned(),
            ));
        }
        if self.max_pending_events == 0 {
            return Err(Error::InvalidOptions(
                "max_pending_events must be positive".to_owned(),
            ));
        }
        Ok(())
    }
}
