pub mod annotator;
pub mod envelope;
pub mod errors;
pub mod ids;
pub mod mode;
pub mod result;

pub use annotator::AnnotationService;
pub use envelope::{EnvelopeBuilder, EventEnvelope, Payload};
pub use errors::{AnnotationError, EnvelopeError, ValidationError};
pub use ids::{ConnectionId, CorrelationId, EnvelopeId};
pub use mode::{Lane, ProcessingMode};
pub use result::{AnnotationRecord, AnnotationResult, AnnotationStatus, SequenceRequest, TranscriptConsequence};
