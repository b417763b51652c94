//! A GO Feature Flag provider that evaluates flags in-process.
//!
//! # Overview
//!
//! The [`GoFeatureFlagProvider`] fetches the flag configuration from a GO Feature Flag relay proxy,
//! keeps it fresh by polling in the background, and evaluates flags locally by calling into the
//! precompiled GO Feature Flag evaluation module (a WASI binary hosted with `wasmtime`). Flag
//! usage is buffered and reported to the relay proxy data collector.
//!
//! Flags are evaluated for an [`EvaluationContext`]: a targeting key plus arbitrary attributes.
//! A successful evaluation returns [`ResolutionDetails`] with the value, the variation picked and
//! the reason.
//!
//! The building blocks are public as well: [`InProcessEvaluator`] (configuration polling and
//! evaluation), [`WasmBridge`] (the evaluation module host) and [`EventPublisher`] (batched event
//! delivery).
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum. [`Error::error_code`] maps each error to the
//! standard flag evaluation error code.
//!
//! In production, it is recommended to fall back to the default value on any error, as feature
//! flag evaluation should not be critical enough to cause system crashes. However, the returned
//! errors are valuable for debugging and usually indicate that developer's attention is needed.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging messages, under
//! the `gofeatureflag` target. Consider integrating a `log`-compatible logger implementation for
//! better visibility into provider operations.

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

pub mod api;
mod config;
mod configuration_store;
pub mod data_collector;
mod error;
mod evaluation_context;
pub mod evaluator;
pub mod events;
mod flag_types;
pub mod poller_thread;
mod provider;
pub mod wasm;

#[cfg(test)]
mod test_utils;

pub use config::ProviderOptions;
pub use configuration_store::{ConfigurationStore, FlagConfiguration};
pub use error::{Error, Result};
pub use evaluation_context::{EvaluationContext, TARGETING_KEY};
pub use evaluator::{EvaluatorState, InProcessEvaluator};
pub use events::event_publisher::EventPublisher;
pub use flag_types::{reason, FlagType, FlagValue, ResolutionDetails};
pub use provider::{GoFeatureFlagProvider, ProviderMetadata};
pub use wasm::WasmBridge;
