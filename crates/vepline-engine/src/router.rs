use bytes::Bytes;
use serde_json::json;

use vepline_core::envelope::ext;
use vepline_core::{
    CorrelationId, EventEnvelope, Lane, ProcessingMode, SequenceRequest, ValidationError,
};

/// Source attribute stamped on inbound envelopes.
pub const ROUTER_SOURCE: &str = "/vepline/frontend";

/// One row of the routing table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Route {
    pub lane: Lane,
    pub event_type: &'static str,
    /// Leading phrase of the submission acknowledgment.
    pub ack_label: &'static str,
}

/// Strict mode -> route table. Every mode has exactly one entry.
pub fn route_for(mode: ProcessingMode) -> Route {
    match mode {
        ProcessingMode::Standard => Route {
            lane: Lane::Standard,
            event_type: "com.redhat.healthcare.genetic.sequence.raw",
            ack_label: "🧬 Sequence queued for standard VEP analysis",
        },
        ProcessingMode::HighVolume => Route {
            lane: Lane::HighVolume,
            event_type: "com.redhat.healthcare.genetic.sequence.bigdata",
            ack_label: "🚀 Sequence queued for high-volume analysis",
        },
        ProcessingMode::ClusterScale => Route {
            lane: Lane::ClusterScale,
            event_type: "com.redhat.healthcare.genetic.sequence.nodescale",
            ack_label: "⚡ Sequence queued for cluster-scale analysis",
        },
        ProcessingMode::LagProbe => Route {
            lane: Lane::LagProbe,
            event_type: "com.redhat.healthcare.genetic.sequence.kafkalag",
            ack_label: "📊 Sequence queued for lag-probe analysis",
        },
    }
}

/// A client submission before routing.
#[derive(Clone, Debug, Default)]
pub struct Submission {
    pub payload: Bytes,
    pub mode: Option<String>,
    pub correlation_id: Option<CorrelationId>,
    pub resource_profile: Option<String>,
}

impl Submission {
    pub fn text(sequence: impl Into<String>) -> Self {
        Self {
            payload: Bytes::from(sequence.into()),
            ..Default::default()
        }
    }

    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = Some(mode.into());
        self
    }

    pub fn with_correlation_id(mut self, id: CorrelationId) -> Self {
        self.correlation_id = Some(id);
        self
    }
}

/// Routing output: the envelope and where it goes.
#[derive(Clone, Debug)]
pub struct Routed {
    pub lane: Lane,
    pub mode: ProcessingMode,
    pub correlation_id: CorrelationId,
    pub envelope: EventEnvelope,
    pub sequence_length: usize,
    /// The submitted mode tag was present but unrecognized.
    pub fell_back: bool,
    pub ack: String,
}

/// Pure mapping from a submission to `(lane, envelope)`.
#[derive(Clone, Debug)]
pub struct ModeRouter {
    max_payload_bytes: usize,
}

impl ModeRouter {
    pub fn new(max_payload_bytes: usize) -> Self {
        Self { max_payload_bytes }
    }

    /// Only payload problems are errors. An unknown mode tag routes to the
    /// standard lane and a missing correlation id is generated.
    pub fn route(&self, submission: &Submission) -> Result<Routed, ValidationError> {
        let raw = &submission.payload;
        if raw.len() > self.max_payload_bytes {
            return Err(ValidationError::PayloadTooLarge {
                len: raw.len(),
                max: self.max_payload_bytes,
            });
        }
        let text = std::str::from_utf8(raw).map_err(|_| ValidationError::NotText)?;
        let sequence = text.trim();
        if sequence.is_empty() {
            return Err(ValidationError::EmptyPayload);
        }

        let (mode, fell_back) = ProcessingMode::resolve(submission.mode.as_deref());
        let route = route_for(mode);
        let correlation_id = submission.correlation_id.clone().unwrap_or_default();
        let resource_profile = submission
            .resource_profile
            .clone()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| mode.default_resource_profile().to_string());

        let mut request = SequenceRequest::new(correlation_id.clone(), sequence, mode);
        request.resource_profile = Some(resource_profile.clone());
        let sequence_length = request.sequence_length;

        let envelope = EventEnvelope::builder(route.event_type, ROUTER_SOURCE)
            .subject(format!("sequence-{}", mode.as_str()))
            .correlation_id(&correlation_id)
            .extension(ext::PROCESSING_MODE, mode.as_str())
            .extension(ext::PAYLOAD_LENGTH, sequence_length.to_string())
            .extension(ext::RESOURCE_PROFILE, resource_profile)
            .json_payload(&json!(request))
            .build();

        let ack = format!(
            "{} on lane {} ({} chars, correlation id {})",
            route.ack_label, route.lane, sequence_length, correlation_id
        );

        Ok(Routed {
            lane: route.lane,
            mode,
            correlation_id,
            envelope,
            sequence_length,
            fell_back,
            ack,
        })
    }
}
