//! The artifact-uploader capability consumed by the pipeline.
//!
//! Events may reference files on the local disk; those must be visible to
//! whoever consumes the event stream, so the uploader copies them to a remote
//! namespace and hands back a [`PathConverter`] that rewrites local paths to
//! remote URIs during serialisation.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use tonic::async_trait;

/// Why an event references a local file; uploaders may use this to pick a
/// storage class or retention policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalFileKind {
    /// A declared build output.
    Output,
    Stdout,
    Stderr,
    Log,
}

/// A local file referenced by a build event.
#[derive(Debug, Clone)]
pub struct LocalFile {
    pub path: PathBuf,
    pub kind: LocalFileKind,
}

impl LocalFile {
    pub fn new(path: impl Into<PathBuf>, kind: LocalFileKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// Maps local file paths to the identifiers events carry on the wire.
pub trait PathConverter: Send + Sync + std::fmt::Debug {
    /// Remote URI for `path`, or `None` if the file was not uploaded.
    fn convert(&self, path: &Path) -> Option<String>;
}

/// Converter for events that reference no local files.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoConversion;

impl PathConverter for NoConversion {
    fn convert(&self, _path: &Path) -> Option<String> {
        None
    }
}

/// Handle resolving to the path converter for one event's upload batch.
pub type PathConverterFuture =
    Pin<Box<dyn Future<Output = anyhow::Result<Arc<dyn PathConverter>>> + Send>>;

/// Uploads the local files referenced by build events.
#[async_trait]
pub trait BuildEventArtifactUploader: Send + Sync {
    /// Begins uploading `files` and returns a handle that resolves once all
    /// of them are remotely addressable. Must not block.
    fn upload(&self, files: HashMap<PathBuf, LocalFile>) -> PathConverterFuture;

    /// Releases resources held by the uploader. Called exactly once, after
    /// the RPC client has shut down.
    async fn shutdown(&self);
}
