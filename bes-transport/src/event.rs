//! Build-tool events and the in-memory records the pipeline queues.

use std::sync::Arc;

use bes_proto::PublishBuildToolEventStreamRequest;
use parking_lot::Mutex;
use prost_types::Timestamp;
use tokio::sync::OnceCell;

use crate::artifact::{LocalFile, NoConversion, PathConverter, PathConverterFuture};
use crate::envelope::EnvelopeBuilder;

/// Exit-code signal carried by an event that marks the build as completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildCompletion {
    /// Numeric exit code, if the event knows it yet.
    pub exit_code: Option<i32>,
}

/// An event produced by the build tool, opaque to the pipeline except for the
/// three capabilities below.
pub trait BuildEvent: Send + Sync {
    /// Local files that must be uploaded before this event is serialised.
    fn referenced_local_files(&self) -> Vec<LocalFile>;

    /// Packs the event into its wire form, rewriting local paths via `paths`.
    fn as_packed_proto(&self, paths: &dyn PathConverter) -> prost_types::Any;

    /// Signals that the build is completing, with its exit code if known.
    fn build_completion(&self) -> Option<BuildCompletion> {
        None
    }
}

/// Resolves an event's artifact-upload future once and caches the outcome,
/// so a record replayed by a retried stream does not re-await a consumed
/// future.
pub(crate) struct UploadHandle {
    future: Mutex<Option<PathConverterFuture>>,
    resolved: OnceCell<Result<Arc<dyn PathConverter>, Arc<anyhow::Error>>>,
}

impl UploadHandle {
    pub(crate) fn new(future: PathConverterFuture) -> Self {
        Self {
            future: Mutex::new(Some(future)),
            resolved: OnceCell::new(),
        }
    }

    pub(crate) async fn wait(&self) -> Result<Arc<dyn PathConverter>, Arc<anyhow::Error>> {
        self.resolved
            .get_or_init(|| async {
                let future = self.future.lock().take();
                match future {
                    Some(future) => future.await.map_err(Arc::new),
                    // Unreachable: the OnceCell runs this at most once.
                    None => Err(Arc::new(anyhow::anyhow!("upload future already consumed"))),
                }
            })
            .await
            .clone()
    }
}

enum RecordKind {
    /// A build-tool event together with its artifact-upload progress.
    Event {
        event: Box<dyn BuildEvent>,
        upload: UploadHandle,
    },
    /// Sentinel marking the end of the stream.
    Terminator,
}

/// One queued event, bound to its stream position and timestamp.
///
/// Records are immutable after construction and shared between the send queue,
/// the pending-ack deque, and the ACK callback.
pub(crate) struct EventRecord {
    sequence_number: i64,
    event_time: Timestamp,
    kind: RecordKind,
}

impl EventRecord {
    pub(crate) fn event(
        sequence_number: i64,
        event_time: Timestamp,
        event: Box<dyn BuildEvent>,
        upload: PathConverterFuture,
    ) -> Self {
        Self {
            sequence_number,
            event_time,
            kind: RecordKind::Event {
                event,
                upload: UploadHandle::new(upload),
            },
        }
    }

    pub(crate) fn terminator(sequence_number: i64, event_time: Timestamp) -> Self {
        Self {
            sequence_number,
            event_time,
            kind: RecordKind::Terminator,
        }
    }

    pub(crate) fn sequence_number(&self) -> i64 {
        self.sequence_number
    }

    pub(crate) fn is_terminator(&self) -> bool {
        matches!(self.kind, RecordKind::Terminator)
    }

    /// Waits for the record's artifact uploads and returns the converter to
    /// serialise with. The terminator resolves immediately.
    pub(crate) async fn path_converter(
        &self,
    ) -> Result<Arc<dyn PathConverter>, Arc<anyhow::Error>> {
        match &self.kind {
            RecordKind::Event { upload, .. } => upload.wait().await,
            RecordKind::Terminator => Ok(Arc::new(NoConversion)),
        }
    }

    /// Serialises the record into its stream request.
    pub(crate) fn serialize(
        &self,
        paths: &dyn PathConverter,
        envelopes: &EnvelopeBuilder,
    ) -> PublishBuildToolEventStreamRequest {
        match &self.kind {
            RecordKind::Event { event, .. } => envelopes.bazel_event(
                self.sequence_number,
                self.event_time.clone(),
                event.as_packed_proto(paths),
            ),
            RecordKind::Terminator => {
                envelopes.stream_finished(self.sequence_number, self.event_time.clone())
            }
        }
    }
}
