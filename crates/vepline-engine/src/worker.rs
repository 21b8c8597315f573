use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vepline_core::envelope::ext;
use vepline_core::{
    AnnotationError, AnnotationResult, AnnotationService, AnnotationStatus, CorrelationId,
    EventEnvelope, Lane, SequenceRequest,
};
use vepline_telemetry::PipelineMetrics;

use crate::bus::{LaneReceiver, MessageBus};
use crate::error::BusError;
use crate::hgvs::NotationConverter;

pub const RESULT_EVENT_TYPE: &str = "com.redhat.healthcare.genetic.sequence.annotated";
pub const WORKER_SOURCE: &str = "/vepline/annotation-worker";

/// Turns one inbound envelope into one annotated envelope.
///
/// Never fails: service errors become degraded results and unreadable
/// responses become error results, so the annotated lane keeps flowing.
pub struct AnnotationWorker {
    service: Arc<dyn AnnotationService>,
    converter: NotationConverter,
    metrics: Arc<PipelineMetrics>,
}

impl AnnotationWorker {
    pub fn new(
        service: Arc<dyn AnnotationService>,
        converter: NotationConverter,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            service,
            converter,
            metrics,
        }
    }

    pub async fn annotate(&self, envelope: &EventEnvelope) -> EventEnvelope {
        let request = extract_request(envelope);
        let id = request.correlation_id.clone();
        let source = self.service.name().to_string();

        let notations = self
            .converter
            .convert(&request.sequence, self.service.batch_limit());
        debug!(
            correlation_id = %id,
            mode = %request.processing_mode,
            variants = notations.len(),
            "calling annotation service"
        );

        let result = match self
            .service
            .annotate_for(&notations, request.processing_mode)
            .await
        {
            Ok(records) => AnnotationResult::completed(&request, records, source),
            Err(e @ AnnotationError::Mapping(_)) => {
                warn!(correlation_id = %id, error = %e, "annotation response unreadable");
                AnnotationResult::error(&request, source, e.to_string())
            }
            Err(e) => {
                warn!(
                    correlation_id = %id,
                    error_kind = e.error_kind(),
                    error = %e,
                    "annotation service unavailable, returning degraded result"
                );
                AnnotationResult::degraded(&request, source, e.to_string())
            }
        };

        self.metrics.record_outcome(result.status.as_str());
        info!(
            correlation_id = %id,
            status = result.status.as_str(),
            variants = result.variant_count(),
            "annotation finished"
        );
        result_envelope(&request, &result)
    }
}

/// Read the request out of an inbound envelope. A payload that is not the
/// expected JSON is taken as the raw sequence.
fn extract_request(envelope: &EventEnvelope) -> SequenceRequest {
    let data = &envelope.payload().data;
    let parsed: Option<Value> = serde_json::from_slice(data).ok();
    let sequence = parsed
        .as_ref()
        .and_then(|v| v.get("sequence"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| String::from_utf8_lossy(data).trim().to_string());

    let correlation_id = envelope
        .correlation_id()
        .or_else(|| {
            parsed
                .as_ref()
                .and_then(|v| v.get("correlationId"))
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(CorrelationId::from_raw)
        })
        .unwrap_or_else(|| {
            let generated = CorrelationId::new();
            warn!(
                envelope_id = %envelope.id(),
                correlation_id = %generated,
                "envelope has no correlation id, result cannot be delivered"
            );
            generated
        });

    let mut request = SequenceRequest::new(correlation_id, sequence, envelope.processing_mode());
    request.resource_profile = envelope.extension(ext::RESOURCE_PROFILE).map(str::to_string);
    request
}

fn result_envelope(request: &SequenceRequest, result: &AnnotationResult) -> EventEnvelope {
    let payload = match serde_json::to_value(result) {
        Ok(v) => v,
        Err(e) => {
            warn!(correlation_id = %request.correlation_id, error = %e, "result not serializable");
            Value::Null
        }
    };
    let mode = request.processing_mode;
    let mut builder = EventEnvelope::builder(RESULT_EVENT_TYPE, WORKER_SOURCE)
        .subject(format!("annotated-{}", mode.as_str()))
        .correlation_id(&request.correlation_id)
        .extension(ext::PROCESSING_MODE, mode.as_str())
        .extension(ext::PAYLOAD_LENGTH, result.sequence_length.to_string())
        .extension(
            ext::RESOURCE_PROFILE,
            request
                .resource_profile
                .clone()
                .unwrap_or_else(|| mode.default_resource_profile().to_string()),
        );
    if result.status == AnnotationStatus::Error {
        builder = builder.extension(ext::ERROR_TYPE, "mapping");
    }
    builder.json_payload(&payload).build()
}

/// One consumer per inbound lane, each envelope annotated on its own task.
/// A shared semaphore bounds how many annotation calls run at once.
pub struct WorkerPool {
    worker: Arc<AnnotationWorker>,
    bus: Arc<dyn MessageBus>,
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(worker: Arc<AnnotationWorker>, bus: Arc<dyn MessageBus>, concurrency: usize) -> Self {
        Self {
            worker,
            bus,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    /// Subscribe to every inbound lane and start consuming.
    pub fn spawn(&self, cancel: CancellationToken) -> Result<Vec<JoinHandle<()>>, BusError> {
        let mut tasks = Vec::with_capacity(Lane::INBOUND.len());
        for lane in Lane::INBOUND {
            let rx = self.bus.subscribe(lane)?;
            tasks.push(self.spawn_lane(lane, rx, cancel.clone()));
        }
        Ok(tasks)
    }

    fn spawn_lane(
        &self,
        lane: Lane,
        mut rx: LaneReceiver,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let worker = self.worker.clone();
        let bus = self.bus.clone();
        let permits = self.permits.clone();

        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = cancel.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Some(m) => m,
                        None => break,
                    },
                };

                let permit = tokio::select! {
                    _ = cancel.cancelled() => break,
                    p = permits.clone().acquire_owned() => match p {
                        Ok(p) => p,
                        Err(_) => break,
                    },
                };

                let worker = worker.clone();
                let bus = bus.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    process(&worker, bus.as_ref(), lane, &message).await;
                });
            }
            debug!(lane = %lane, "lane consumer stopped");
        })
    }
}

async fn process(worker: &AnnotationWorker, bus: &dyn MessageBus, lane: Lane, message: &Bytes) {
    let envelope = match EventEnvelope::decode(message) {
        Ok(env) => env,
        Err(e) => {
            warn!(lane = %lane, bytes = message.len(), error = %e, "dropping undecodable envelope");
            return;
        }
    };
    let annotated = worker.annotate(&envelope).await;
    if let Err(e) = bus.publish(Lane::Annotated, Bytes::from(annotated.encode())).await {
        warn!(
            correlation_id = ?annotated.correlation_id(),
            error = %e,
            "failed to publish annotated result"
        );
    }
}
