//! Retry with exponential backoff around lifecycle sends and stream attempts.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tonic::Status;
use tracing::{debug, info};

use crate::error::{UploadError, CODES_NOT_TO_RETRY};
use crate::host::Sleeper;
use crate::shutdown::Interrupt;

/// Retries after the initial attempt; 6 attempts in total.
const MAX_RETRIES: u32 = 5;
/// Base of the backoff schedule; roughly matches the gRPC connection backoff.
const DELAY_MILLIS: f64 = 1000.0;
const BACKOFF_FACTOR: f64 = 1.6;

/// Wraps fallible upload operations with the transport's retry policy.
///
/// Transient transport statuses are retried with backoff; permanent codes,
/// artifact-upload failures, and interruption pass straight through. A stream
/// that recorded ACK progress since its last failure gets its attempt budget
/// back, so a slow but advancing upload is never starved out.
pub(crate) struct Retrier {
    sleeper: Arc<dyn Sleeper>,
    interrupt: Interrupt,
    /// ACKs recorded by the stream driver since the last retry.
    acks_since_last_retry: Arc<AtomicU32>,
    /// Most recent retryable failure; reported when a later timeout fires.
    last_retry_error: Arc<Mutex<Option<Status>>>,
}

impl Retrier {
    pub(crate) fn new(
        sleeper: Arc<dyn Sleeper>,
        interrupt: Interrupt,
        acks_since_last_retry: Arc<AtomicU32>,
        last_retry_error: Arc<Mutex<Option<Status>>>,
    ) -> Self {
        Self {
            sleeper,
            interrupt,
            acks_since_last_retry,
            last_retry_error,
        }
    }

    /// Runs `operation` until it succeeds, fails permanently, or the attempt
    /// budget is exhausted.
    pub(crate) async fn retry<F, Fut>(&self, mut operation: F) -> Result<(), UploadError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), UploadError>>,
    {
        let mut tries: u32 = 0;
        while tries <= MAX_RETRIES {
            self.acks_since_last_retry.store(0, Ordering::SeqCst);
            let status = match operation().await {
                Ok(()) => {
                    *self.last_retry_error.lock() = None;
                    return Ok(());
                }
                Err(error @ (UploadError::LocalFileUpload(_) | UploadError::Interrupted)) => {
                    return Err(error);
                }
                Err(UploadError::Transport(status)) => {
                    if CODES_NOT_TO_RETRY.contains(&status.code()) {
                        return Err(UploadError::Transport(status));
                    }
                    status
                }
            };

            let acks = self.acks_since_last_retry.load(Ordering::SeqCst);
            if acks > 0 {
                debug!(acks, "stream progressed since last retry, resetting attempt budget");
                tries = 0;
            }
            tries += 1;
            *self.last_retry_error.lock() = Some(status.clone());

            let backoff = backoff_delay(tries);
            info!(
                backoff_ms = backoff.as_millis() as u64,
                error = %status,
                "retrying rpc to the build event service"
            );
            tokio::select! {
                () = self.sleeper.sleep(backoff) => {}
                () = self.interrupt.triggered() => return Err(UploadError::Interrupted),
            }
        }

        let last = self.last_retry_error.lock().clone();
        match last {
            Some(status) => Err(UploadError::Transport(status)),
            // Every path into exhaustion records an error first.
            None => Err(UploadError::Transport(Status::internal(
                "retry budget exhausted without a recorded error",
            ))),
        }
    }
}

/// First attempt retries immediately; attempt n then backs off
/// `1000 · 1.6^n` ms.
fn backoff_delay(tries: u32) -> Duration {
    if tries == 1 {
        Duration::ZERO
    } else {
        Duration::from_millis((DELAY_MILLIS * BACKOFF_FACTOR.powi(tries as i32)) as u64)
    }
}
