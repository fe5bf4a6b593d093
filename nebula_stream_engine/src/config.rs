// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Engine configuration.
//!
//! The configuration is a plain data object. It can be built in code, or deserialized from a
//! JSON document with [`EngineConfig::from_json`]. Outer configuration surfaces (CLI flags,
//! YAML files) are collaborators that produce this object; the engine only validates it.

use serde::Deserialize;

use crate::ErrorKind;

/// Rule used by the global-query-plan update phase when admitting new queries.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
pub enum QueryMergerRule {
    /// No sharing: every query gets its own shared query plan.
    #[default]
    DefaultMerger,
    /// Merge a new query into a shared query plan whose signature is semantically equal.
    SignatureEquality,
    /// Merge on equality or on either direction of signature containment.
    SignatureContainment,
}

/// Memory layout forced onto the tuple buffers of generated pipelines.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
pub enum MemoryLayoutPolicy {
    #[default]
    ForceRowLayout,
    ForceColumnLayout,
}

/// Log verbosity, translated into a `tracing` env-filter directive by the embedder.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// The env-filter directive equivalent of this level.
    pub fn as_filter_directive(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct EngineConfig {
    pub rest_port: u16,
    pub rpc_port: u16,
    pub data_port: u16,
    /// Size of the process-wide pooled-buffer tier.
    pub number_of_buffers_in_global_buffer_manager: usize,
    /// Buffers reserved per worker thread out of the global pool.
    pub number_of_buffers_per_worker: usize,
    /// Buffers reserved per source out of the global pool.
    pub number_of_buffers_in_source_local_buffer_pool: usize,
    pub buffer_size_in_bytes: usize,
    pub num_worker_threads: usize,
    pub query_merger_rule: QueryMergerRule,
    /// Number of queued run-query requests drained per update cycle.
    pub query_batch_size: usize,
    pub memory_layout_policy: MemoryLayoutPolicy,
    /// Re-place only the changed subtree when a query is merged into an already placed plan.
    pub incremental_placement: bool,
    pub log_level: LogLevel,
    /// Per-call budget for the containment solver, in milliseconds.
    pub solver_timeout_ms: u64,
    /// Budget for blocking buffer acquisition, in milliseconds. Zero waits forever.
    pub buffer_acquisition_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rest_port: 8081,
            rpc_port: 4000,
            data_port: 3001,
            number_of_buffers_in_global_buffer_manager: 1024,
            number_of_buffers_per_worker: 128,
            number_of_buffers_in_source_local_buffer_pool: 64,
            buffer_size_in_bytes: 4096,
            num_worker_threads: 1,
            query_merger_rule: QueryMergerRule::default(),
            query_batch_size: 1,
            memory_layout_policy: MemoryLayoutPolicy::default(),
            incremental_placement: false,
            log_level: LogLevel::default(),
            solver_timeout_ms: 1000,
            buffer_acquisition_timeout_ms: 1000,
        }
    }
}

impl EngineConfig {
    /// Deserializes a configuration from a JSON document and validates it.
    pub fn from_json(json: &str) -> crate::Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ErrorKind::ConfigurationError.with_source(e))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the option values for consistency.
    ///
    /// The buffer size must hold at least the buffer header, and the per-worker and per-source
    /// reservations must fit into the global pool.
    pub fn validate(&self) -> crate::Result<()> {
        if self.buffer_size_in_bytes < crate::runtime::buffer::BUFFER_HEADER_SIZE {
            return Err(ErrorKind::ConfigurationError.with_message(format!(
                "bufferSizeInBytes must be at least {} bytes",
                crate::runtime::buffer::BUFFER_HEADER_SIZE
            )));
        }
        if self.num_worker_threads == 0 {
            return Err(
                ErrorKind::ConfigurationError.with_message("numWorkerThreads must be non-zero")
            );
        }
        if self.query_batch_size == 0 {
            return Err(
                ErrorKind::ConfigurationError.with_message("queryBatchSize must be non-zero")
            );
        }
        let reserved = self.number_of_buffers_per_worker * self.num_worker_threads
            + self.number_of_buffers_in_source_local_buffer_pool;
        if reserved > self.number_of_buffers_in_global_buffer_manager {
            return Err(ErrorKind::ConfigurationError.with_message(format!(
                "worker and source pools reserve {} buffers but the global pool holds only {}",
                reserved, self.number_of_buffers_in_global_buffer_manager
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        EngineConfig::default().validate().expect("default config must validate");
    }

    #[test]
    fn from_json_applies_defaults() -> crate::Result<()> {
        let config = EngineConfig::from_json(r#"{"bufferSizeInBytes": 8192}"#)?;
        assert_eq!(config.buffer_size_in_bytes, 8192);
        assert_eq!(config.query_batch_size, 1);
        assert_eq!(config.query_merger_rule, QueryMergerRule::DefaultMerger);
        Ok(())
    }

    #[test]
    fn rejects_unknown_options() {
        let err = EngineConfig::from_json(r#"{"bufferSize": 1}"#).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigurationError);
    }

    #[test]
    fn rejects_oversubscribed_pools() {
        let config = EngineConfig {
            number_of_buffers_in_global_buffer_manager: 16,
            number_of_buffers_per_worker: 128,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigurationError);
    }

    #[test]
    fn merger_rule_names_match_wire_form() -> crate::Result<()> {
        let config =
            EngineConfig::from_json(r#"{"queryMergerRule": "SignatureContainment"}"#)?;
        assert_eq!(config.query_merger_rule, QueryMergerRule::SignatureContainment);
        Ok(())
    }
}
