//! Reference asset upload.
//!
//! [`AssetUploader`] is the seam the generator depends on;
//! [`UploadPipeline`] is the real implementation. [`upload_references`]
//! applies the failure policy: the primary reference must upload, secondary
//! references are best effort.

pub mod pipeline;

use futures::future::BoxFuture;

use crate::error::Result;
use crate::job::{AssetRole, AssetSource, ReferenceAsset};

pub use pipeline::{UploadAddress, UploadPipeline, UploadTicket};

/// Moves one asset into upstream storage and returns its logical URI.
pub trait AssetUploader: Send + Sync {
    /// Upload `source`. Errors are always [`crate::JimengError::UploadFailed`].
    fn upload<'a>(&'a self, source: &'a AssetSource, role: AssetRole) -> BoxFuture<'a, Result<String>>;
}

/// Upload every reference in order and fill in its URI.
///
/// A failed primary aborts with its error before anything else is uploaded.
/// A failed secondary is logged and dropped from the returned list.
pub async fn upload_references(
    uploader: &dyn AssetUploader,
    references: Vec<ReferenceAsset>,
) -> Result<Vec<ReferenceAsset>> {
    let total = references.len();
    let mut uploaded = Vec::with_capacity(total);

    for (index, mut reference) in references.into_iter().enumerate() {
        match uploader.upload(&reference.source, reference.role).await {
            Ok(uri) => {
                tracing::info!(index, total, %uri, "reference stored");
                reference.uri = Some(uri);
                uploaded.push(reference);
            },
            Err(err) if reference.role == AssetRole::Primary => {
                tracing::error!(index, source = %reference.source.describe(), error = %err, "primary reference upload failed");
                return Err(err);
            },
            Err(err) => {
                tracing::warn!(index, source = %reference.source.describe(), error = %err, "skipping secondary reference");
            },
        }
    }

    Ok(uploaded)
}
