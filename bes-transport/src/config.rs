//! Host-facing configuration for the transport.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Options the build tool hands to the transport at construction.
///
/// Identifiers (`build_request_id`, `invocation_id`, `command_name`) are
/// inserted verbatim into every envelope and must match what the build tool
/// announced to the service out of band.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Unique id of the build request.
    pub build_request_id: String,
    /// Id of this invocation attempt.
    pub invocation_id: String,
    /// Command the user ran, e.g. `build` or `test`.
    pub command_name: String,
    /// Project the service should account the build to.
    #[serde(default)]
    pub project_id: Option<String>,
    /// Extra notification keywords, beyond the generated
    /// `command_name=…` / `protocol_name=BEP` pair.
    #[serde(default)]
    pub additional_keywords: BTreeSet<String>,
    /// Maximum wall time `close()` waits for the upload. Zero waits forever.
    #[serde(default)]
    pub upload_timeout: Duration,
    /// Whether to frame the stream with lifecycle events.
    #[serde(default = "default_true")]
    pub publish_lifecycle_events: bool,
    /// Whether an upload failure fails the build instead of warning.
    #[serde(default)]
    pub errors_should_fail_the_build: bool,
    /// URL under which the collector exposes results, if any.
    #[serde(default)]
    pub bes_results_url: Option<String>,
}

fn default_true() -> bool {
    true
}

impl TransportConfig {
    /// Config with required identifiers set and everything else defaulted.
    pub fn new(
        build_request_id: impl Into<String>,
        invocation_id: impl Into<String>,
        command_name: impl Into<String>,
    ) -> Self {
        Self {
            build_request_id: build_request_id.into(),
            invocation_id: invocation_id.into(),
            command_name: command_name.into(),
            project_id: None,
            additional_keywords: BTreeSet::new(),
            upload_timeout: Duration::ZERO,
            publish_lifecycle_events: true,
            errors_should_fail_the_build: false,
            bes_results_url: None,
        }
    }
}
