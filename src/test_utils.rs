//! In-memory fakes for the crate's seams, shared by unit tests.
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};

use serde_json::{json, Value};

use crate::{
    api::{CollectorApi, ConfigurationApi, FlagConfigResponse},
    events::{Event, ExporterMetadata},
    wasm::{EvaluationEngine, WasmEvaluationResponse, WasmInput},
    Error, Result,
};

/// A boolean flag whose default rule serves `"on"`, with event tracking enabled.
pub(crate) fn bool_flag(on: bool) -> Value {
    json!({
        "variations": {"on": on, "off": !on},
        "defaultRule": {"variation": "on"},
        "trackEvents": true,
    })
}

/// Serves queued responses in order. The last one is repeated forever.
pub(crate) struct FakeConfigurationApi {
    responses: Mutex<VecDeque<Result<FlagConfigResponse>>>,
    requests: Mutex<Vec<(Option<String>, Vec<String>)>>,
}

impl FakeConfigurationApi {
    pub(crate) fn with_flags(etag: &str, flags: &[(&str, Value)]) -> FakeConfigurationApi {
        let response = FlagConfigResponse {
            etag: Some(etag.to_owned()),
            flags: flags
                .iter()
                .map(|(key, flag)| (key.to_string(), flag.clone()))
                .collect(),
            ..FlagConfigResponse::default()
        };
        FakeConfigurationApi {
            responses: Mutex::new(VecDeque::from([Ok(response)])),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn failing(err: Error) -> FakeConfigurationApi {
        FakeConfigurationApi {
            responses: Mutex::new(VecDeque::from([Err(err)])),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Set the enrichment of the first queued response.
    pub(crate) fn with_enrichment(self, enrichment: Value) -> FakeConfigurationApi {
        if let Some(Ok(response)) = self.responses.lock().unwrap().front_mut() {
            response.evaluation_context_enrichment =
                enrichment.as_object().cloned().unwrap_or_default();
        }
        self
    }

    pub(crate) fn push_response(&self, response: Result<FlagConfigResponse>) {
        self.responses.lock().unwrap().push_back(response);
    }

    /// Etag sent with the most recent request.
    pub(crate) fn last_etag(&self) -> Option<String> {
        self.requests
            .lock()
            .unwrap()
            .last()
            .and_then(|(etag, _)| etag.clone())
    }

    /// Flag filter of every request so far.
    pub(crate) fn requested_flags(&self) -> Vec<Vec<String>> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|(_, flags)| flags.clone())
            .collect()
    }
}

impl ConfigurationApi for FakeConfigurationApi {
    fn retrieve_flag_configuration(
        &self,
        etag: Option<&str>,
        flags: &[String],
    ) -> Result<FlagConfigResponse> {
        self.requests
            .lock()
            .unwrap()
            .push((etag.map(ToOwned::to_owned), flags.to_vec()));

        let mut responses = self.responses.lock().unwrap();
        if responses.len() > 1 {
            responses.pop_front().unwrap()
        } else {
            responses.front().cloned().unwrap()
        }
    }
}

/// Evaluates `defaultRule` only, unless told to return a canned response.
#[derive(Default)]
pub(crate) struct FakeEngine {
    pub(crate) initialized: AtomicUsize,
    pub(crate) disposed: AtomicUsize,
    pub(crate) evaluations: AtomicUsize,
    initialize_error: Mutex<Option<Error>>,
    canned: Mutex<Option<Value>>,
    last_input: Mutex<Option<Value>>,
}

impl FakeEngine {
    pub(crate) fn failing_initialize(err: Error) -> FakeEngine {
        FakeEngine {
            initialize_error: Mutex::new(Some(err)),
            ..FakeEngine::default()
        }
    }

    /// Return `response` (module output JSON) from every following evaluation.
    pub(crate) fn respond_with(&self, response: Value) {
        *self.canned.lock().unwrap() = Some(response);
    }

    /// JSON of the last input received.
    pub(crate) fn last_input(&self) -> Option<Value> {
        self.last_input.lock().unwrap().clone()
    }
}

impl EvaluationEngine for FakeEngine {
    fn initialize(&self) -> Result<()> {
        if let Some(err) = self.initialize_error.lock().unwrap().clone() {
            return Err(err);
        }
        self.initialized.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn evaluate(&self, input: &WasmInput<'_>) -> Result<WasmEvaluationResponse> {
        self.evaluations.fetch_add(1, Ordering::SeqCst);
        *self.last_input.lock().unwrap() = Some(serde_json::to_value(input)?);

        if let Some(canned) = self.canned.lock().unwrap().clone() {
            return Ok(serde_json::from_value(canned)?);
        }

        let variation = input.flag["defaultRule"]["variation"].as_str();
        Ok(WasmEvaluationResponse {
            value: variation.map(|variation| input.flag["variations"][variation].clone()),
            variation_type: variation.map(ToOwned::to_owned),
            reason: Some("STATIC".to_owned()),
            track_events: input.flag["trackEvents"].as_bool(),
            ..WasmEvaluationResponse::default()
        })
    }

    fn dispose(&self) {
        self.disposed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Records every batch it receives.
#[derive(Default)]
pub(crate) struct RecordingCollector {
    pub(crate) batches: Mutex<Vec<Vec<Event>>>,
    pub(crate) metadata: Mutex<Option<ExporterMetadata>>,
}

impl RecordingCollector {
    pub(crate) fn events(&self) -> Vec<Event> {
        self.batches.lock().unwrap().iter().flatten().cloned().collect()
    }

    pub(crate) fn sent_user_keys(&self) -> Vec<String> {
        self.events()
            .iter()
            .map(|event| event.user_key().to_owned())
            .collect()
    }
}

impl CollectorApi for RecordingCollector {
    fn send_events(&self, events: &[Event], metadata: &ExporterMetadata) -> Result<()> {
        self.batches.lock().unwrap().push(events.to_vec());
        *self.metadata.lock().unwrap() = Some(metadata.clone());
        Ok(())
    }
}
