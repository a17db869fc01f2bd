//! The transport façade handed to the build tool.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use bes_proto::build_status;
use parking_lot::Mutex;
use prost_types::Timestamp;
use tokio::sync::watch;
use tonic::Status;
use tracing::info;

use crate::artifact::BuildEventArtifactUploader;
use crate::client::BuildEventServiceClient;
use crate::config::TransportConfig;
use crate::envelope::EnvelopeBuilder;
use crate::error::UploadError;
use crate::event::{BuildEvent, EventRecord};
use crate::host::{
    Clock, CommandLineReporter, EventSeverity, ExitKind, ModuleEnvironment, Sleeper, SystemClock,
    TokioSleeper,
};
use crate::queue::PendingSend;
use crate::retry::Retrier;
use crate::shutdown::{Interrupt, ShutdownCell, ShutdownHandle};
use crate::stream::StreamPublisher;
use crate::upload::{BuildEventUpload, InvocationResult};

/// Reported when the upload drains cleanly.
pub const UPLOAD_SUCCEEDED_MESSAGE: &str = "Build Event Protocol upload finished successfully.";
/// Reported while the guardian waits for the upload after `close`.
pub const WAITING_FOR_UPLOAD_MESSAGE: &str = "Waiting for Build Event Protocol upload to finish.";

/// How the upload came apart, from the guardian's point of view.
enum CloseFailure {
    Upload(UploadError),
    TimedOut,
}

/// Streams build tool events to a Build Event Service collector.
///
/// `send_event` may be called from any thread; events are queued and uploaded
/// by a background task that frames them with lifecycle events, retries
/// transient stream failures, and resumes from the last acknowledged event.
/// `close` flushes the queue and waits up to the configured upload timeout.
pub struct BuildEventServiceTransport {
    inner: Arc<TransportInner>,
}

struct SendState {
    /// Set once the terminator is enqueued; later sends are dropped.
    closing: bool,
    upload_started: bool,
}

struct TransportInner {
    config: TransportConfig,
    client: Arc<dyn BuildEventServiceClient>,
    artifact_uploader: Arc<dyn BuildEventArtifactUploader>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    reporter: Arc<dyn CommandLineReporter>,
    environment: Arc<dyn ModuleEnvironment>,
    runtime: tokio::runtime::Handle,
    envelopes: Arc<EnvelopeBuilder>,
    pending_send: Arc<PendingSend>,
    invocation_result: Arc<InvocationResult>,
    interrupt: Interrupt,
    acks_since_last_retry: Arc<AtomicU32>,
    last_retry_error: Arc<Mutex<Option<Status>>>,
    errors_reported: AtomicBool,
    send_state: Mutex<SendState>,
    /// Resolves with the upload task's outcome; `None` until the task starts.
    upload_result: Mutex<Option<watch::Receiver<Option<Result<(), UploadError>>>>>,
    shutdown: Mutex<Option<ShutdownCell>>,
}

impl BuildEventServiceTransport {
    /// Creates a transport on the ambient tokio runtime with the system
    /// clock and timer.
    ///
    /// # Panics
    /// Panics if called outside a tokio runtime.
    pub fn new(
        client: Arc<dyn BuildEventServiceClient>,
        artifact_uploader: Arc<dyn BuildEventArtifactUploader>,
        config: TransportConfig,
        reporter: Arc<dyn CommandLineReporter>,
        environment: Arc<dyn ModuleEnvironment>,
    ) -> Self {
        Self::with_host(
            client,
            artifact_uploader,
            config,
            reporter,
            environment,
            Arc::new(SystemClock),
            Arc::new(TokioSleeper),
            tokio::runtime::Handle::current(),
        )
    }

    /// Creates a transport with an injected clock, sleeper, and runtime
    /// handle, so tests control time.
    #[allow(clippy::too_many_arguments)]
    pub fn with_host(
        client: Arc<dyn BuildEventServiceClient>,
        artifact_uploader: Arc<dyn BuildEventArtifactUploader>,
        config: TransportConfig,
        reporter: Arc<dyn CommandLineReporter>,
        environment: Arc<dyn ModuleEnvironment>,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
        runtime: tokio::runtime::Handle,
    ) -> Self {
        let envelopes = Arc::new(EnvelopeBuilder::new(
            config.build_request_id.clone(),
            config.invocation_id.clone(),
            config.project_id.clone(),
            config.command_name.clone(),
            config.additional_keywords.clone(),
        ));
        Self {
            inner: Arc::new(TransportInner {
                config,
                client,
                artifact_uploader,
                clock,
                sleeper,
                reporter,
                environment,
                runtime,
                envelopes,
                pending_send: Arc::new(PendingSend::new()),
                invocation_result: Arc::new(InvocationResult::new()),
                interrupt: Interrupt::new(),
                acks_since_last_retry: Arc::new(AtomicU32::new(0)),
                last_retry_error: Arc::new(Mutex::new(None)),
                errors_reported: AtomicBool::new(false),
                send_state: Mutex::new(SendState {
                    closing: false,
                    upload_started: false,
                }),
                upload_result: Mutex::new(None),
                shutdown: Mutex::new(None),
            }),
        }
    }

    /// Display name of this transport.
    pub fn name(&self) -> &'static str {
        "Build Event Service"
    }

    /// Whether the event stream is currently open.
    pub fn is_streaming(&self) -> bool {
        self.inner.client.is_stream_active()
    }

    /// Queues one event for upload. Never blocks.
    ///
    /// Events arriving after `close` are dropped; if the upload already
    /// failed, the failure is reported once and the event dropped.
    pub fn send_event(&self, event: Box<dyn BuildEvent>) {
        if let Some(completion) = event.build_completion() {
            match completion.exit_code {
                Some(0) => self
                    .inner
                    .invocation_result
                    .set(build_status::Result::CommandSucceeded),
                Some(_) => self
                    .inner
                    .invocation_result
                    .set(build_status::Result::CommandFailed),
                None => {}
            }
        }

        // Targets can reference the same artifact under several owners; one
        // upload per path is enough.
        let mut local_files = HashMap::new();
        for file in event.referenced_local_files() {
            local_files.entry(file.path.clone()).or_insert(file);
        }
        let upload = self.inner.artifact_uploader.upload(local_files);
        let timestamp = self.inner.timestamp();
        self.send_ordered(|sequence| EventRecord::event(sequence, timestamp, event, upload));
    }

    /// Flushes the queue and returns a handle that resolves once the upload
    /// finished (or gave up) and the transport shut down. Idempotent.
    pub fn close(&self) -> ShutdownHandle {
        self.close_inner(false)
    }

    /// Forced shutdown: cancels the upload and completes the shutdown handle
    /// immediately. Idempotent.
    pub fn close_now(&self) {
        self.close_inner(true);
    }

    fn close_inner(&self, now: bool) -> ShutdownHandle {
        let mut shutdown = self.inner.shutdown.lock();
        if let Some(cell) = shutdown.clone() {
            drop(shutdown);
            if now {
                self.inner.cancel_upload();
                cell.complete();
            }
            return cell.handle();
        }

        info!("closing the build event service transport");
        let cell = ShutdownCell::new();
        let handle = cell.handle();
        *shutdown = Some(cell.clone());
        drop(shutdown);

        if now {
            self.inner.cancel_upload();
            cell.complete();
            return handle;
        }

        let timestamp = self.inner.timestamp();
        self.enqueue_terminator(timestamp);

        let inner = Arc::clone(&self.inner);
        self.inner.runtime.spawn(async move {
            inner.guard_upload().await;
            cell.complete();
        });
        handle
    }

    /// Enqueues the stream terminator and refuses all later sends.
    fn enqueue_terminator(&self, timestamp: Timestamp) {
        let mut state = self.inner.send_state.lock();
        if state.closing {
            return;
        }
        state.closing = true;

        if self.inner.upload_outcome().is_some() {
            drop(state);
            self.inner.maybe_report_upload_error();
            return;
        }

        let record = Arc::new(EventRecord::terminator(
            self.inner.envelopes.next_sequence_number(),
            timestamp,
        ));
        self.inner.pending_send.push(record);
        if !state.upload_started {
            state.upload_started = true;
            drop(state);
            self.start_upload();
        }
    }

    /// Sequence assignment and enqueue happen under one lock, so producer
    /// contention cannot reorder records.
    fn send_ordered(&self, make: impl FnOnce(i64) -> EventRecord) {
        let mut state = self.inner.send_state.lock();
        if state.closing {
            return;
        }
        if self.inner.upload_outcome().is_some() {
            drop(state);
            self.inner.maybe_report_upload_error();
            return;
        }

        let record = Arc::new(make(self.inner.envelopes.next_sequence_number()));
        self.inner.pending_send.push(record);
        if !state.upload_started {
            state.upload_started = true;
            drop(state);
            self.start_upload();
        }
    }

    /// Spawns the upload task on first use.
    fn start_upload(&self) {
        let (result_tx, result_rx) = watch::channel(None);
        *self.inner.upload_result.lock() = Some(result_rx);

        let inner = Arc::clone(&self.inner);
        self.inner.runtime.spawn(async move {
            let retrier = Retrier::new(
                Arc::clone(&inner.sleeper),
                inner.interrupt.clone(),
                Arc::clone(&inner.acks_since_last_retry),
                Arc::clone(&inner.last_retry_error),
            );
            let publisher = StreamPublisher::new(
                Arc::clone(&inner.client),
                Arc::clone(&inner.envelopes),
                Arc::clone(&inner.pending_send),
                Arc::clone(&inner.acks_since_last_retry),
                inner.interrupt.clone(),
            );
            let upload = BuildEventUpload::new(
                Arc::clone(&inner.client),
                Arc::clone(&inner.artifact_uploader),
                Arc::clone(&inner.envelopes),
                Arc::clone(&inner.clock),
                retrier,
                publisher,
                inner.config.publish_lifecycle_events,
                Arc::clone(&inner.invocation_result),
                inner.interrupt.clone(),
            );
            let result = upload.run().await;
            result_tx.send_replace(Some(result));
        });
    }
}

impl TransportInner {
    fn timestamp(&self) -> Timestamp {
        bes_proto::datetime_to_timestamp(self.clock.now())
    }

    /// Outcome of the upload task, if it has finished.
    fn upload_outcome(&self) -> Option<Result<(), UploadError>> {
        self.upload_result
            .lock()
            .as_ref()
            .and_then(|rx| rx.borrow().clone())
    }

    /// The guardian: waits for the upload with the configured timeout and
    /// reports what happened.
    async fn guard_upload(&self) {
        if self.errors_reported.load(Ordering::SeqCst) {
            // The failure was already shown when an event was dropped.
            return;
        }

        self.report(EventSeverity::Info, WAITING_FOR_UPLOAD_MESSAGE);
        match self.await_upload().await {
            Ok(()) => {
                self.report(EventSeverity::Info, UPLOAD_SUCCEEDED_MESSAGE);
                if let Some(url) = &self.config.bes_results_url {
                    self.report(
                        EventSeverity::Info,
                        format!("Build Event Protocol results available at {url}"),
                    );
                }
            }
            Err(failure) => {
                self.cancel_upload();
                self.report_error_once(&failure);
                if let Some(url) = &self.config.bes_results_url {
                    self.report(
                        EventSeverity::Info,
                        format!("Partial Build Event Protocol results may be available at {url}"),
                    );
                }
            }
        }
    }

    async fn await_upload(&self) -> Result<(), CloseFailure> {
        let receiver = self.upload_result.lock().clone();
        let Some(mut receiver) = receiver else {
            // close() always starts the upload before the guardian runs.
            return Ok(());
        };

        let outcome = async move {
            match receiver.wait_for(|outcome| outcome.is_some()).await {
                Ok(outcome) => outcome.clone().unwrap_or(Err(UploadError::Interrupted)),
                // The upload task died without reporting; treat as cancelled.
                Err(_) => Err(UploadError::Interrupted),
            }
        };

        let result = if self.config.upload_timeout.is_zero() {
            outcome.await
        } else {
            match tokio::time::timeout(self.config.upload_timeout, outcome).await {
                Ok(result) => result,
                Err(_elapsed) => return Err(CloseFailure::TimedOut),
            }
        };
        result.map_err(CloseFailure::Upload)
    }

    fn cancel_upload(&self) {
        if !self.interrupt.is_triggered() {
            info!("forcefully closing the build event service transport");
        }
        self.interrupt.trigger();
    }

    fn maybe_report_upload_error(&self) {
        if let Some(Err(error)) = self.upload_outcome() {
            self.report_error_once(&CloseFailure::Upload(error));
        }
    }

    /// At-most-once error surfacing per transport instance.
    fn report_error_once(&self, failure: &CloseFailure) {
        if self
            .errors_reported
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let message = self.error_message(failure);
        if self.config.errors_should_fail_the_build {
            self.report(EventSeverity::Error, message);
            self.environment.exit(
                "Build Event Service upload failed".to_owned(),
                ExitKind::PublishError,
            );
        } else {
            self.report(EventSeverity::Warning, message);
        }
    }

    fn error_message(&self, failure: &CloseFailure) -> String {
        match failure {
            CloseFailure::TimedOut => {
                let mut message = "Build Event Protocol upload timed out.".to_owned();
                // A timeout after several retries usually has an underlying
                // transport cause worth showing.
                if let Some(status) = self.last_retry_error.lock().clone() {
                    message.push_str(" Transport errors caused the upload to be retried.");
                    message.push_str(&format!(
                        " Last known reason for retry: {}",
                        self.client.user_readable_error(&status)
                    ));
                }
                message
            }
            CloseFailure::Upload(UploadError::Transport(status)) => format!(
                "Build Event Protocol upload failed: {}",
                self.client.user_readable_error(status)
            ),
            CloseFailure::Upload(UploadError::LocalFileUpload(cause)) => {
                format!("Build Event Protocol upload failed: {cause}")
            }
            CloseFailure::Upload(error @ UploadError::Interrupted) => {
                format!("Build Event Protocol upload failed: {error}")
            }
        }
    }

    fn report(&self, severity: EventSeverity, message: impl Into<String>) {
        self.reporter.handle(severity, message.into());
    }
}
