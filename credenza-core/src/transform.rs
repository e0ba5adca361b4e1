//! Content transform pipeline.
//!
//! Transforms are ordered optional converters applied to raw bytes before
//! serving and caching. Each transform distinguishes "does not apply"
//! (checked up front, falls through to the next stage) from a transform
//! failure (an `Err` the caller logs before serving the verbatim bytes).
//! Transforms may declare dependency paths, which the server registers
//! with the watcher so derived output is invalidated when its sources
//! change.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use flate2::Compression;
use flate2::write::GzEncoder;
use tracing::debug;

use crate::error::{AssetError, Result};

/// Result of one transform stage.
#[derive(Debug, Clone)]
pub struct TransformOutput {
    pub bytes: Bytes,
    /// Replacement content type, when the transform changes it.
    pub content_type: Option<String>,
    /// `Content-Encoding` value, when the transform encodes.
    pub content_encoding: Option<String>,
    /// Source paths this output was derived from.
    pub dependencies: Vec<PathBuf>,
}

/// One converter in the pipeline.
#[async_trait]
pub trait ContentTransform: Send + Sync {
    /// Whether this transform applies to the given resource. False means
    /// fall through; it is not an error.
    fn applies(&self, path: &Path, content_type: &str, accept_encoding: Option<&str>) -> bool;

    /// Converts `bytes`. An `Err` is a transform failure; the caller falls
    /// back to the verbatim bytes.
    async fn apply(&self, path: &Path, bytes: Bytes) -> Result<TransformOutput>;
}

/// Ordered set of transforms. Applicable stages feed each other in
/// registration order.
#[derive(Clone, Default)]
pub struct TransformPipeline {
    transforms: Vec<Arc<dyn ContentTransform>>,
}

impl std::fmt::Debug for TransformPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformPipeline")
            .field("stages", &self.transforms.len())
            .finish()
    }
}

impl TransformPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, transform: Arc<dyn ContentTransform>) {
        self.transforms.push(transform);
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }

    /// Whether any stage would apply, so callers can avoid buffering a
    /// file that will be streamed verbatim.
    pub fn wants(&self, path: &Path, content_type: &str, accept_encoding: Option<&str>) -> bool {
        self.transforms
            .iter()
            .any(|t| t.applies(path, content_type, accept_encoding))
    }

    /// Runs every applicable transform in order over `bytes`.
    ///
    /// `Ok(None)` means no transform applied and the caller should serve
    /// the raw bytes verbatim. `Err` means a stage failed.
    pub async fn run(
        &self,
        path: &Path,
        content_type: &str,
        accept_encoding: Option<&str>,
        bytes: Bytes,
    ) -> Result<Option<TransformOutput>> {
        let mut current = bytes;
        let mut current_type = content_type.to_owned();
        let mut content_encoding = None;
        let mut dependencies = Vec::new();
        let mut applied = false;

        for transform in &self.transforms {
            if !transform.applies(path, &current_type, accept_encoding) {
                continue;
            }
            let output = transform.apply(path, current.clone()).await?;
            applied = true;
            current = output.bytes;
            if let Some(ct) = output.content_type {
                current_type = ct;
            }
            if output.content_encoding.is_some() {
                content_encoding = output.content_encoding;
            }
            dependencies.extend(output.dependencies);
        }

        if !applied {
            return Ok(None);
        }

        debug!(path = %path.display(), content_type = %current_type, "transform pipeline applied");
        Ok(Some(TransformOutput {
            bytes: current,
            content_type: Some(current_type),
            content_encoding,
            dependencies,
        }))
    }
}

/// Gzip encoder for textual content, gated on the request's
/// `Accept-Encoding`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GzipTransform;

fn is_compressible(content_type: &str) -> bool {
    content_type.starts_with("text/")
        || content_type.contains("javascript")
        || content_type.contains("json")
        || content_type.contains("xml")
}

#[async_trait]
impl ContentTransform for GzipTransform {
    fn applies(&self, _path: &Path, content_type: &str, accept_encoding: Option<&str>) -> bool {
        let accepts_gzip = accept_encoding.is_some_and(|enc| enc.contains("gzip"));
        accepts_gzip && is_compressible(content_type)
    }

    async fn apply(&self, _path: &Path, bytes: Bytes) -> Result<TransformOutput> {
        let gzip = |err| AssetError::TransformFailed(format!("gzip: {err}"));
        let mut encoder =
            GzEncoder::new(Vec::with_capacity(bytes.len() / 2), Compression::default());
        encoder.write_all(&bytes).map_err(gzip)?;
        let compressed = encoder.finish().map_err(gzip)?;
        Ok(TransformOutput {
            bytes: Bytes::from(compressed),
            content_type: None,
            content_encoding: Some("gzip".to_owned()),
            dependencies: Vec::new(),
        })
    }
}
