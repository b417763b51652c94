//! An HTTP client for the relay proxy: retrieves flag configuration and sends usage events.
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use reqwest::{
    blocking::{RequestBuilder, Response},
    header::{ETAG, IF_NONE_MATCH, LAST_MODIFIED},
    StatusCode, Url,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    events::{Event, ExporterMetadata},
    Error, ProviderOptions, Result,
};

const FLAG_CONFIGURATION_ENDPOINT: &str = "v1/flag/configuration";
const DATA_COLLECTOR_ENDPOINT: &str = "v1/data/collector";
const API_KEY_HEADER: &str = "X-API-Key";

/// Source of flag configuration.
pub trait ConfigurationApi: Send + Sync {
    /// Fetch the flag configuration.
    ///
    /// When `etag` is set, the server may answer "not modified", which yields a response with
    /// empty `flags`. An empty `flags` filter requests every flag.
    fn retrieve_flag_configuration(
        &self,
        etag: Option<&str>,
        flags: &[String],
    ) -> Result<FlagConfigResponse>;
}

/// Destination of usage events.
pub trait CollectorApi: Send + Sync {
    /// Deliver one batch of events.
    fn send_events(&self, events: &[Event], metadata: &ExporterMetadata) -> Result<()>;
}

/// Flag configuration as returned by the relay proxy.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlagConfigResponse {
    /// Validator to send back on the next request.
    pub etag: Option<String>,
    /// Value of the `Last-Modified` header.
    pub last_updated: Option<DateTime<Utc>>,
    /// Flag definitions by key. Empty on "not modified".
    pub flags: HashMap<String, Value>,
    /// Attributes merged into every evaluation context.
    pub evaluation_context_enrichment: Map<String, Value>,
}

#[derive(Debug, Serialize)]
struct FlagConfigRequest<'a> {
    flags: &'a [String],
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FlagConfigBody {
    #[serde(default)]
    flags: Option<HashMap<String, Value>>,
    #[serde(default)]
    evaluation_context_enrichment: Option<Map<String, Value>>,
}

#[derive(Debug, Serialize)]
struct DataCollectorRequest<'a> {
    meta: &'a ExporterMetadata,
    events: &'a [Event],
}

/// A client for the relay proxy API.
///
/// It's best to save and reuse the same instance, so it can reuse the connection.
pub struct GoFeatureFlagApi {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::blocking::Client,
    flag_configuration_url: Url,
    data_collector_url: Url,
    api_key: Option<String>,
}

impl GoFeatureFlagApi {
    /// Create a client from provider options.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidEndpoint`] if the endpoint is not a valid URL.
    /// - [`Error::Network`] if the HTTP client cannot be built.
    pub fn new(options: &ProviderOptions) -> Result<GoFeatureFlagApi> {
        let mut endpoint = Url::parse(&options.endpoint).map_err(Error::InvalidEndpoint)?;
        if !endpoint.path().ends_with('/') {
            let path = format!("{}/", endpoint.path());
            endpoint.set_path(&path);
        }

        let client = reqwest::blocking::Client::builder()
            .timeout(options.timeout)
            .build()?;

        Ok(GoFeatureFlagApi {
            client,
            flag_configuration_url: endpoint
                .join(FLAG_CONFIGURATION_ENDPOINT)
                .map_err(Error::InvalidEndpoint)?,
            data_collector_url: endpoint
                .join(DATA_COLLECTOR_ENDPOINT)
                .map_err(Error::InvalidEndpoint)?,
            api_key: options.api_key.clone(),
        })
    }

    fn authenticate(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(api_key) => request.header(API_KEY_HEADER, api_key),
            None => request,
        }
    }
}

impl ConfigurationApi for GoFeatureFlagApi {
    fn retrieve_flag_configuration(
        &self,
        etag: Option<&str>,
        flags: &[String],
    ) -> Result<FlagConfigResponse> {
        let mut request = self.authenticate(
            self.client
                .post(self.flag_configuration_url.clone())
                .json(&FlagConfigRequest { flags }),
        );
        if let Some(etag) = etag {
            request = request.header(IF_NONE_MATCH, etag);
        }

        log::debug!(target: "gofeatureflag", etag; "fetching flag configuration");
        let response = request.send().map_err(|err| {
            Error::ConfigUnavailable(format!("network error: {}", err.without_url()))
        })?;

        let status = response.status();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                log::warn!(target: "gofeatureflag", "client is not authorized. Check your API key");
                return Err(Error::Unauthorized);
            }
            StatusCode::NOT_FOUND => {
                return Err(Error::ConfigUnavailable(
                    "flag configuration endpoint not found".to_owned(),
                ));
            }
            StatusCode::BAD_REQUEST => {
                return Err(Error::ConfigUnavailable(format!(
                    "retrieve flag configuration error: bad request: {}",
                    body_text(response)
                )));
            }
            StatusCode::OK | StatusCode::NOT_MODIFIED => {}
            code => {
                return Err(Error::ConfigUnavailable(format!(
                    "retrieve flag configuration error: unexpected http code {}: {}",
                    code.as_u16(),
                    body_text(response)
                )));
            }
        }

        let mut result = FlagConfigResponse {
            etag: parse_etag(&response),
            last_updated: parse_last_modified(&response),
            ..FlagConfigResponse::default()
        };
        if status == StatusCode::NOT_MODIFIED {
            log::debug!(target: "gofeatureflag", "flag configuration not modified");
            return Ok(result);
        }

        let body: FlagConfigBody = response.json().map_err(|err| {
            Error::ConfigUnavailable(format!(
                "failed to parse flag configuration response: {}",
                err.without_url()
            ))
        })?;
        result.flags = body.flags.unwrap_or_default();
        result.evaluation_context_enrichment = body.evaluation_context_enrichment.unwrap_or_default();

        log::debug!(target: "gofeatureflag", flags = result.flags.len(); "successfully fetched flag configuration");
        Ok(result)
    }
}

impl CollectorApi for GoFeatureFlagApi {
    fn send_events(&self, events: &[Event], metadata: &ExporterMetadata) -> Result<()> {
        let request = self.authenticate(
            self.client
                .post(self.data_collector_url.clone())
                .json(&DataCollectorRequest {
                    meta: metadata,
                    events,
                }),
        );

        let response = request
            .send()
            .map_err(|err| Error::DataCollector(format!("network error: {}", err.without_url())))?;

        match response.status() {
            StatusCode::OK => Ok(()),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(Error::Unauthorized),
            StatusCode::BAD_REQUEST => Err(Error::DataCollector(format!(
                "bad request: {}",
                body_text(response)
            ))),
            code => Err(Error::DataCollector(format!(
                "send data to the collector error: unexpected http code {}: {}",
                code.as_u16(),
                body_text(response)
            ))),
        }
    }
}

fn body_text(response: Response) -> String {
    response.text().unwrap_or_default()
}

/// ETag header value without its surrounding quotes.
fn parse_etag(response: &Response) -> Option<String> {
    let etag = response.headers().get(ETAG)?.to_str().ok()?;
    let etag = etag
        .strip_prefix('"')
        .and_then(|it| it.strip_suffix('"'))
        .unwrap_or(etag);
    Some(etag.to_owned())
}

fn parse_last_modified(response: &Response) -> Option<DateTime<Utc>> {
    let last_modified = response.headers().get(LAST_MODIFIED)?.to_str().ok()?;
    DateTime::parse_from_rfc2822(last_modified)
        .ok()
        .map(|it| it.with_timezone(&Utc))
}
