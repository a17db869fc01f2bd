//! One bidirectional stream attempt and its ACK callback.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bes_proto::PublishBuildToolEventStreamResponse;
use parking_lot::Mutex;
use tonic::{Code, Status};
use tracing::{debug, info, warn};

use crate::client::{AckCallback, BuildEventServiceClient, StreamStatus};
use crate::envelope::EnvelopeBuilder;
use crate::error::{augment_status, UploadError};
use crate::queue::{AckOutcome, PendingAck, PendingSend};
use crate::shutdown::Interrupt;

/// Wait between checks of the send queue and the stream status.
const STREAMING_RPC_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Wait for the stream to finish after the terminator was sent.
const STREAM_FINISHED_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs single stream attempts; the retry controller re-invokes it.
///
/// State carried across attempts (the send queue and the ACK-progress
/// counter) lives behind `Arc`s shared with the transport. The pending-ack
/// deque does not survive attempts: each one drains the survivor back into
/// the send queue and installs a fresh deque, so an ACK callback left over
/// from an aborted stream cannot pop records from the live attempt.
pub(crate) struct StreamPublisher {
    client: Arc<dyn BuildEventServiceClient>,
    envelopes: Arc<EnvelopeBuilder>,
    pending_send: Arc<PendingSend>,
    pending_ack: Mutex<Arc<PendingAck>>,
    acks_since_last_retry: Arc<AtomicU32>,
    interrupt: Interrupt,
    poll_interval: Duration,
    finish_timeout: Duration,
}

impl StreamPublisher {
    pub(crate) fn new(
        client: Arc<dyn BuildEventServiceClient>,
        envelopes: Arc<EnvelopeBuilder>,
        pending_send: Arc<PendingSend>,
        acks_since_last_retry: Arc<AtomicU32>,
        interrupt: Interrupt,
    ) -> Self {
        Self {
            client,
            envelopes,
            pending_send,
            pending_ack: Mutex::new(Arc::new(PendingAck::new())),
            acks_since_last_retry,
            interrupt,
            poll_interval: STREAMING_RPC_POLL_INTERVAL,
            finish_timeout: STREAM_FINISHED_TIMEOUT,
        }
    }

    /// One complete stream attempt: replay survivors, drain the send queue
    /// onto the wire, then wait for the collector to finish the stream.
    pub(crate) async fn publish_event_stream(&self) -> Result<(), UploadError> {
        let pending_ack = {
            let mut slot = self.pending_ack.lock();
            let survivors = slot.drain();
            self.pending_send.requeue_front(survivors);
            let fresh = Arc::new(PendingAck::new());
            *slot = Arc::clone(&fresh);
            fresh
        };

        let mut stream = self
            .client
            .open_stream(self.ack_callback(Arc::clone(&pending_ack)))
            .await?;
        info!(
            pending_send = self.pending_send.len(),
            "started publish build tool event stream rpc"
        );

        if let Err(error) = self.send_loop(&pending_ack, &stream).await {
            match &error {
                UploadError::Interrupted => self.client.abort_stream(Status::cancelled(
                    "The build event upload was interrupted.",
                )),
                UploadError::Transport(status) => self.client.abort_stream(status.clone()),
                UploadError::LocalFileUpload(_) => self
                    .client
                    .abort_stream(Status::internal("Local file upload failed.")),
            }
            return Err(error);
        }

        tokio::select! {
            () = self.interrupt.triggered() => {
                self.client
                    .abort_stream(Status::cancelled("Waiting for ACK messages."));
                Err(UploadError::Interrupted)
            }
            finished = tokio::time::timeout(self.finish_timeout, stream.wait()) => {
                match finished {
                    Ok(status) if status.code() == Code::Ok => {
                        debug!("publish build tool event stream finished cleanly");
                        Ok(())
                    }
                    Ok(status) => Err(UploadError::Transport(status)),
                    Err(_elapsed) => {
                        let detail = "timed out waiting for ACK messages";
                        warn!("cancelling publish build tool event stream rpc: {detail}");
                        self.client.abort_stream(Status::cancelled(detail));
                        Err(UploadError::Transport(Status::deadline_exceeded(detail)))
                    }
                }
            }
        }
    }

    /// Drains the send queue onto the wire until the terminator goes out.
    async fn send_loop(
        &self,
        pending_ack: &Arc<PendingAck>,
        stream: &StreamStatus,
    ) -> Result<(), UploadError> {
        loop {
            let record = tokio::select! {
                () = self.interrupt.triggered() => return Err(UploadError::Interrupted),
                record = self.pending_send.poll(self.poll_interval) => record,
            };

            if let Some(record) = record {
                pending_ack.push(Arc::clone(&record));

                let converter = tokio::select! {
                    () = self.interrupt.triggered() => return Err(UploadError::Interrupted),
                    converted = record.path_converter() => converted.map_err(|cause| {
                        warn!(
                            error = %cause,
                            "failed to upload local files referenced by build event"
                        );
                        UploadError::LocalFileUpload(cause)
                    })?,
                };

                let request = record.serialize(converter.as_ref(), &self.envelopes);
                tokio::select! {
                    () = self.interrupt.triggered() => return Err(UploadError::Interrupted),
                    sent = self.client.send_over_stream(request) => sent?,
                }

                if record.is_terminator() {
                    return Ok(());
                }
            }

            // The poll tick doubles as the check for a stream that the
            // collector tore down while we still have events to send.
            if let Some(status) = stream.now() {
                return Err(UploadError::Transport(augment_status(
                    &status,
                    "Stream closed prematurely.",
                )));
            }
        }
    }

    /// Builds the callback the RPC client invokes for each inbound ACK.
    ///
    /// The attempt's deque is passed in explicitly; the callback owns no
    /// reference back to the publisher.
    fn ack_callback(&self, pending_ack: Arc<PendingAck>) -> AckCallback {
        let client = Arc::clone(&self.client);
        let acks_since_last_retry = Arc::clone(&self.acks_since_last_retry);
        Arc::new(move |ack: PublishBuildToolEventStreamResponse| {
            match pending_ack.ack(ack.sequence_number) {
                AckOutcome::Mismatch { expected } => {
                    client.abort_stream(Status::internal(format!(
                        "Expected ACK {expected} but was {}.",
                        ack.sequence_number
                    )));
                }
                AckOutcome::Matched(record) => {
                    if record.is_terminator() {
                        debug!("last ack received");
                        client.close_stream();
                    }
                    acks_since_last_retry.fetch_add(1, Ordering::SeqCst);
                }
            }
        })
    }
}
