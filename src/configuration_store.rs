//! A thread-safe in-memory storage for the currently active flag configuration.
//! [`ConfigurationStore`] provides concurrent access for readers (flag evaluation) and writers
//! (the configuration poller).
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::api::FlagConfigResponse;

/// Flag configuration served by the relay proxy, together with the etag it was served with.
///
/// `FlagConfiguration` is immutable; a refresh builds a new one.
#[derive(Debug, Clone, PartialEq)]
pub struct FlagConfiguration {
    /// Flag definitions by key. Opaque to this crate, interpreted by the evaluation module.
    pub flags: Arc<HashMap<String, Value>>,
    /// Validator for conditional requests.
    pub etag: Option<String>,
    /// Attributes merged into every evaluation context.
    pub evaluation_context_enrichment: Arc<Map<String, Value>>,
    /// When the relay proxy last changed the configuration.
    pub last_updated: Option<DateTime<Utc>>,
    /// When the configuration was fetched.
    pub fetched_at: DateTime<Utc>,
}

impl FlagConfiguration {
    /// Build a configuration from a full (non "not modified") server response.
    pub fn from_server_response(response: FlagConfigResponse) -> FlagConfiguration {
        FlagConfiguration {
            flags: Arc::new(response.flags),
            etag: response.etag,
            evaluation_context_enrichment: Arc::new(response.evaluation_context_enrichment),
            last_updated: response.last_updated,
            fetched_at: Utc::now(),
        }
    }

    /// Apply a poll response on top of this configuration.
    ///
    /// Non-empty flags replace flags and enrichment. An empty response ("not modified") keeps
    /// them. The etag is updated whenever the response carries one.
    pub fn refreshed_with(&self, response: FlagConfigResponse) -> FlagConfiguration {
        let mut next = self.clone();
        if !response.flags.is_empty() {
            next.flags = Arc::new(response.flags);
            next.evaluation_context_enrichment = Arc::new(response.evaluation_context_enrichment);
            next.last_updated = response.last_updated;
            next.fetched_at = Utc::now();
        }
        if response.etag.is_some() {
            next.etag = response.etag;
        }
        next
    }

    /// Flag definition for `flag_key`.
    pub fn get_flag(&self, flag_key: &str) -> Option<&Value> {
        self.flags.get(flag_key)
    }
}

/// `ConfigurationStore` provides a thread-safe (`Sync`) storage for flag configuration that allows
/// concurrent access for readers and writers.
///
/// Readers get a snapshot: flags, etag and enrichment always belong to the same fetch.
#[derive(Default)]
pub struct ConfigurationStore {
    configuration: RwLock<Option<Arc<FlagConfiguration>>>,
}

impl ConfigurationStore {
    /// Create a new empty configuration store.
    pub fn new() -> Self {
        ConfigurationStore::default()
    }

    /// Get currently-active configuration. Returns None if configuration hasn't been stored yet
    /// or has been cleared.
    pub fn get_configuration(&self) -> Option<Arc<FlagConfiguration>> {
        // self.configuration.read() should always return Ok(). Err() is possible only if the lock
        // is poisoned (writer panicked while holding the lock), which should never happen.
        let configuration = self
            .configuration
            .read()
            .expect("thread holding configuration lock should not panic");

        configuration.clone()
    }

    /// Set new configuration.
    pub fn set_configuration(&self, config: FlagConfiguration) {
        // Constructing new value before requesting the lock to minimize lock span.
        let new_value = Some(Arc::new(config));

        let mut configuration_slot = self
            .configuration
            .write()
            .expect("thread holding configuration lock should not panic");

        *configuration_slot = new_value;
    }

    /// Replace the current configuration with `f(current)`, under the write lock. Does nothing if
    /// the store is empty.
    pub fn update(&self, f: impl FnOnce(&FlagConfiguration) -> FlagConfiguration) {
        let mut configuration_slot = self
            .configuration
            .write()
            .expect("thread holding configuration lock should not panic");

        let next = configuration_slot
            .as_deref()
            .map(|current| Arc::new(f(current)));
        if next.is_some() {
            *configuration_slot = next;
        }
    }

    /// Remove the stored configuration.
    pub fn clear(&self) {
        let mut configuration_slot = self
            .configuration
            .write()
            .expect("thread holding configuration lock should not panic");

        *configuration_slot = None;
    }
}
