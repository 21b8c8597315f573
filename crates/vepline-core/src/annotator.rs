use async_trait::async_trait;

use crate::errors::AnnotationError;
use crate::mode::ProcessingMode;
use crate::result::AnnotationRecord;

/// External annotation endpoint, treated as an opaque RPC.
///
/// Implementations take a batch of normalized notations and return zero or
/// more records. An empty response is a valid answer, not an error.
#[async_trait]
pub trait AnnotationService: Send + Sync {
    /// Identifier stamped on results as their source service.
    fn name(&self) -> &str;

    /// Largest batch accepted by one call.
    fn batch_limit(&self) -> usize {
        1000
    }

    async fn annotate(&self, notations: &[String]) -> Result<Vec<AnnotationRecord>, AnnotationError>;

    /// Call on behalf of a request in `mode`. Services with no per-mode
    /// policy ignore it.
    async fn annotate_for(
        &self,
        notations: &[String],
        _mode: ProcessingMode,
    ) -> Result<Vec<AnnotationRecord>, AnnotationError> {
        self.annotate(notations).await
    }

    /// Cheap readiness probe. Defaults to healthy for services without one.
    async fn ping(&self) -> Result<(), AnnotationError> {
        Ok(())
    }
}
