//! Client-side transport that streams a build tool's event log to a Build
//! Event Service collector.
//!
//! The build tool hands events to [`BuildEventServiceTransport::send_event`]
//! as they occur and calls [`BuildEventServiceTransport::close`] at the end
//! of the build. In between, a background task frames the stream with
//! lifecycle events, co-ordinates per-event artifact uploads, sends events in
//! sequence order on a single bidirectional stream, tracks outstanding ACKs,
//! and retries transient failures by resuming from the last acknowledged
//! event.
//!
//! The RPC client and the artifact uploader are capabilities the host
//! provides, via [`BuildEventServiceClient`] and
//! [`BuildEventArtifactUploader`]; so are the clock, the retry sleeper, the
//! command-line reporter, and the fatal-exit hook (see [`host`]).

mod artifact;
mod client;
mod config;
mod envelope;
mod error;
mod event;
pub mod host;
mod queue;
mod retry;
mod shutdown;
mod stream;
mod transport;
mod upload;

pub use artifact::{
    BuildEventArtifactUploader, LocalFile, LocalFileKind, NoConversion, PathConverter,
    PathConverterFuture,
};
pub use client::{AckCallback, BuildEventServiceClient, StreamStatus, StreamStatusSender};
pub use config::TransportConfig;
pub use error::UploadError;
pub use event::{BuildCompletion, BuildEvent};
pub use shutdown::ShutdownHandle;
pub use transport::{
    BuildEventServiceTransport, UPLOAD_SUCCEEDED_MESSAGE, WAITING_FOR_UPLOAD_MESSAGE,
};
