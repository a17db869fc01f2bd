//! Interfaces to the hosting build tool.
//!
//! The transport never talks to the terminal, the wall clock, or the process
//! exit path directly; the build tool injects these so tests can drive time
//! and observe what a user would see.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tonic::async_trait;

/// Source of wall-clock time for event and envelope timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Sleeps between retry attempts; injected so tests run instantly.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Sleeper backed by the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Severity of a message shown on the build tool's command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSeverity {
    Info,
    Warning,
    Error,
}

/// Sink for user-visible progress and error messages.
pub trait CommandLineReporter: Send + Sync {
    fn handle(&self, severity: EventSeverity, message: String);
}

/// Exit kinds the transport may request from its host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ExitKind {
    /// Publishing build events failed and the build is configured to care.
    PublishError,
}

/// Hook into the build tool's lifecycle, used to abort the build when
/// `errors_should_fail_the_build` is set.
pub trait ModuleEnvironment: Send + Sync {
    fn exit(&self, message: String, kind: ExitKind);
}
