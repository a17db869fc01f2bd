//! The upload task: lifecycle framing around the retried event stream.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use bes_proto::{build_status, datetime_to_timestamp, PublishLifecycleEventRequest};
use prost_types::Timestamp;
use tracing::warn;

use crate::artifact::BuildEventArtifactUploader;
use crate::client::BuildEventServiceClient;
use crate::envelope::EnvelopeBuilder;
use crate::error::UploadError;
use crate::host::Clock;
use crate::retry::Retrier;
use crate::shutdown::Interrupt;
use crate::stream::StreamPublisher;

/// Register holding the result reported in the closing lifecycle events.
///
/// Written by the producer that submits the build-completing event, read once
/// at finalisation.
pub(crate) struct InvocationResult(AtomicI32);

impl InvocationResult {
    pub(crate) fn new() -> Self {
        Self(AtomicI32::new(build_status::Result::UnknownStatus as i32))
    }

    pub(crate) fn set(&self, result: build_status::Result) {
        self.0.store(result as i32, Ordering::SeqCst);
    }

    pub(crate) fn get(&self) -> build_status::Result {
        build_status::Result::try_from(self.0.load(Ordering::SeqCst))
            .unwrap_or(build_status::Result::UnknownStatus)
    }
}

/// One run of the whole upload: lifecycle framing, the retried stream, and a
/// guaranteed client-then-uploader shutdown.
pub(crate) struct BuildEventUpload {
    client: Arc<dyn BuildEventServiceClient>,
    artifact_uploader: Arc<dyn BuildEventArtifactUploader>,
    envelopes: Arc<EnvelopeBuilder>,
    clock: Arc<dyn Clock>,
    retrier: Retrier,
    publisher: StreamPublisher,
    publish_lifecycle_events: bool,
    invocation_result: Arc<InvocationResult>,
    interrupt: Interrupt,
}

impl BuildEventUpload {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        client: Arc<dyn BuildEventServiceClient>,
        artifact_uploader: Arc<dyn BuildEventArtifactUploader>,
        envelopes: Arc<EnvelopeBuilder>,
        clock: Arc<dyn Clock>,
        retrier: Retrier,
        publisher: StreamPublisher,
        publish_lifecycle_events: bool,
        invocation_result: Arc<InvocationResult>,
        interrupt: Interrupt,
    ) -> Self {
        Self {
            client,
            artifact_uploader,
            envelopes,
            clock,
            retrier,
            publisher,
            publish_lifecycle_events,
            invocation_result,
            interrupt,
        }
    }

    /// Runs the upload to completion. The RPC client and the artifact
    /// uploader are shut down, in that order, no matter how publishing went.
    pub(crate) async fn run(&self) -> Result<(), UploadError> {
        let result = self.publish_all().await;
        self.client.shutdown().await;
        self.artifact_uploader.shutdown().await;
        result
    }

    async fn publish_all(&self) -> Result<(), UploadError> {
        self.send_lifecycle(self.envelopes.build_enqueued(self.timestamp()))
            .await?;
        self.send_lifecycle(self.envelopes.invocation_started(self.timestamp()))
            .await?;

        let stream_result = self
            .retrier
            .retry(|| self.publisher.publish_event_stream())
            .await;

        // Finalisation runs even when the stream failed; the stream error
        // stays the primary one.
        let result = self.invocation_result.get();
        let finish_result = self.send_finish_events(result).await;
        if let Err(error) = &finish_result {
            warn!(error = %error, "failed to publish lifecycle finish events");
        }
        stream_result.and(finish_result)
    }

    async fn send_finish_events(
        &self,
        result: build_status::Result,
    ) -> Result<(), UploadError> {
        self.send_lifecycle(self.envelopes.invocation_finished(self.timestamp(), result))
            .await?;
        self.send_lifecycle(self.envelopes.build_finished(self.timestamp(), result))
            .await
    }

    async fn send_lifecycle(
        &self,
        request: PublishLifecycleEventRequest,
    ) -> Result<(), UploadError> {
        if !self.publish_lifecycle_events {
            return Ok(());
        }
        if self.interrupt.is_triggered() {
            return Err(UploadError::Interrupted);
        }
        self.retrier
            .retry(|| {
                let request = request.clone();
                async move {
                    tokio::select! {
                        () = self.interrupt.triggered() => Err(UploadError::Interrupted),
                        sent = self.client.publish_lifecycle_event(request) => {
                            sent.map_err(UploadError::from)
                        }
                    }
                }
            })
            .await
    }

    fn timestamp(&self) -> Timestamp {
        datetime_to_timestamp(self.clock.now())
    }
}
