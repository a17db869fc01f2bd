//! The RPC-client capability consumed by the upload pipeline.
//!
//! The concrete gRPC client lives with the host build tool; the pipeline only
//! needs the operations below. A single logical stream is open at a time:
//! `open_stream` replaces any previous one, and `send_over_stream` /
//! `close_stream` / `abort_stream` act on the current stream.

use std::sync::Arc;

use bes_proto::{
    PublishBuildToolEventStreamRequest, PublishBuildToolEventStreamResponse,
    PublishLifecycleEventRequest,
};
use tokio::sync::watch;
use tonic::{async_trait, Status};

/// Callback invoked by the client for every inbound ACK, on the client's
/// receive task.
pub type AckCallback = Arc<dyn Fn(PublishBuildToolEventStreamResponse) + Send + Sync>;

/// Completion handle for one stream attempt.
///
/// Resolves exactly once, with the stream's final status. This is split from
/// the client trait so the stream driver can both poll it from its send loop
/// and await it with a deadline after the terminator.
#[derive(Clone)]
pub struct StreamStatus {
    rx: watch::Receiver<Option<Status>>,
}

/// Writer half of a [`StreamStatus`], held by the client implementation.
pub struct StreamStatusSender {
    tx: watch::Sender<Option<Status>>,
}

impl StreamStatus {
    /// Creates a connected sender/handle pair for one stream attempt.
    pub fn channel() -> (StreamStatusSender, StreamStatus) {
        let (tx, rx) = watch::channel(None);
        (StreamStatusSender { tx }, StreamStatus { rx })
    }

    /// Returns the final status if the stream has already terminated.
    pub fn now(&self) -> Option<Status> {
        self.rx.borrow().clone()
    }

    /// Waits for the stream to terminate and returns its final status.
    pub async fn wait(&mut self) -> Status {
        loop {
            if let Some(status) = self.rx.borrow_and_update().clone() {
                return status;
            }
            if self.rx.changed().await.is_err() {
                // Sender dropped without resolving; treat as an aborted stream.
                return Status::cancelled("stream status sender dropped");
            }
        }
    }
}

impl StreamStatusSender {
    /// Resolves the handle. Later calls are ignored; the first status wins.
    pub fn resolve(&self, status: Status) {
        self.tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(status);
                true
            } else {
                false
            }
        });
    }

    /// Whether the stream has already been resolved.
    pub fn is_resolved(&self) -> bool {
        self.tx.borrow().is_some()
    }
}

/// Client for the Build Event Service publisher API.
#[async_trait]
pub trait BuildEventServiceClient: Send + Sync {
    /// Publishes one lifecycle event on the unary endpoint.
    async fn publish_lifecycle_event(
        &self,
        request: PublishLifecycleEventRequest,
    ) -> Result<(), Status>;

    /// Opens the bidirectional event stream, registering `on_ack` for inbound
    /// ACKs, and returns a handle resolving to the stream's final status.
    async fn open_stream(&self, on_ack: AckCallback) -> Result<StreamStatus, Status>;

    /// Sends one framed request on the current stream. May suspend on flow
    /// control.
    async fn send_over_stream(
        &self,
        request: PublishBuildToolEventStreamRequest,
    ) -> Result<(), Status>;

    /// Half-closes the current stream; the collector then finishes it.
    fn close_stream(&self);

    /// Aborts the current stream with the given status.
    fn abort_stream(&self, status: Status);

    /// Whether the current stream is still open.
    fn is_stream_active(&self) -> bool;

    /// Renders a status for the command line, including any transport detail
    /// the user can act on.
    fn user_readable_error(&self, status: &Status) -> String;

    /// Tears down the underlying channel. Called exactly once, after the last
    /// lifecycle event.
    async fn shutdown(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    #[tokio::test]
    async fn stream_status_resolves_once() {
        let (tx, mut rx) = StreamStatus::channel();
        assert!(rx.now().is_none());

        tx.resolve(Status::new(Code::Ok, ""));
        tx.resolve(Status::unavailable("late, ignored"));

        assert_eq!(rx.now().unwrap().code(), Code::Ok);
        assert_eq!(rx.wait().await.code(), Code::Ok);
    }

    #[tokio::test]
    async fn stream_status_wait_sees_later_resolution() {
        let (tx, mut rx) = StreamStatus::channel();
        let waiter = tokio::spawn(async move { rx.wait().await });
        tx.resolve(Status::unavailable("gone"));
        assert_eq!(waiter.await.unwrap().code(), Code::Unavailable);
    }
}
