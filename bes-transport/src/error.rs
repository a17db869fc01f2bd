//! Error types surfaced by the upload pipeline.

use std::sync::Arc;

use thiserror::Error;
use tonic::{Code, Status};

/// Status codes that are never retried by the stream retry loop.
pub const CODES_NOT_TO_RETRY: [Code; 2] = [Code::InvalidArgument, Code::FailedPrecondition];

/// Terminal outcome of the upload task.
///
/// `Transport` covers both lifecycle RPC failures and event-stream failures,
/// including the protocol violations the stream driver converts to `INTERNAL`
/// statuses. `LocalFileUpload` wraps the artifact uploader's underlying cause
/// and is never retried.
#[derive(Debug, Clone, Error)]
pub enum UploadError {
    /// An RPC failed with a gRPC status after any applicable retries.
    #[error("{}", .0.message())]
    Transport(#[from] Status),

    /// Uploading local files referenced by a build event failed.
    #[error("local file upload failed: {0}")]
    LocalFileUpload(Arc<anyhow::Error>),

    /// The upload task was cancelled before it could finish.
    #[error("the build event upload was interrupted")]
    Interrupted,
}

/// Appends detail to a status description, keeping its code.
pub(crate) fn augment_status(status: &Status, detail: &str) -> Status {
    if status.message().is_empty() {
        Status::new(status.code(), detail.to_owned())
    } else {
        Status::new(status.code(), format!("{} {detail}", status.message()))
    }
}
