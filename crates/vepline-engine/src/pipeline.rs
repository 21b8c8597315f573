use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use vepline_annotator::{ReliabilityStats, ReliableAnnotator};
use vepline_core::{AnnotationService, ConnectionId, CorrelationId, Lane, ProcessingMode};
use vepline_settings::Settings;
use vepline_telemetry::{MetricsSnapshot, PipelineMetrics};

use crate::bus::{InMemoryBus, MessageBus};
use crate::correlator::ResultCorrelator;
use crate::error::{BusError, SubmitError};
use crate::heartbeat::HeartbeatScheduler;
use crate::hgvs::NotationConverter;
use crate::router::{ModeRouter, Submission};
use crate::session::{Session, SessionHandle, SessionRegistry};
use crate::worker::{AnnotationWorker, WorkerPool};

/// Immediate reply to a submission.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    pub correlation_id: CorrelationId,
    pub lane: String,
    pub processing_mode: ProcessingMode,
    pub message: String,
    pub fell_back: bool,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub active_sessions: usize,
    pub in_flight_heartbeats: usize,
    /// Topic name -> messages waiting.
    pub lanes: BTreeMap<String, usize>,
    pub reliability: ReliabilityStats,
    pub metrics: MetricsSnapshot,
}

/// Every pipeline component, built once and shared by reference.
pub struct Pipeline {
    router: ModeRouter,
    bus: Arc<dyn MessageBus>,
    sessions: Arc<SessionRegistry>,
    heartbeats: Arc<HeartbeatScheduler>,
    correlator: Arc<ResultCorrelator>,
    workers: WorkerPool,
    annotator: Arc<ReliableAnnotator>,
    metrics: Arc<PipelineMetrics>,
    ping_timeout: Duration,
}

impl Pipeline {
    /// Pipeline over a process-local bus.
    pub fn new(
        settings: &Settings,
        annotator: Arc<ReliableAnnotator>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        let bus = Arc::new(InMemoryBus::new(settings.pipeline.lane_capacity));
        Self::with_bus(settings, annotator, metrics, bus)
    }

    pub fn with_bus(
        settings: &Settings,
        annotator: Arc<ReliableAnnotator>,
        metrics: Arc<PipelineMetrics>,
        bus: Arc<dyn MessageBus>,
    ) -> Self {
        let sessions = Arc::new(SessionRegistry::new(settings.server.client_timeout()));
        let heartbeats = Arc::new(HeartbeatScheduler::new(
            sessions.clone(),
            metrics.clone(),
            settings.heartbeat.interval(),
            settings.heartbeat.ceiling(),
        ));
        let correlator = Arc::new(ResultCorrelator::new(
            sessions.clone(),
            heartbeats.clone(),
            metrics.clone(),
        ));
        let worker = Arc::new(AnnotationWorker::new(
            annotator.clone(),
            NotationConverter::new(settings.pipeline.conversion_seed),
            metrics.clone(),
        ));
        let workers = WorkerPool::new(worker, bus.clone(), settings.pipeline.worker_concurrency);

        Self {
            router: ModeRouter::new(settings.pipeline.max_payload_bytes),
            bus,
            sessions,
            heartbeats,
            correlator,
            workers,
            annotator,
            metrics,
            ping_timeout: settings.reliability.ping_timeout(),
        }
    }

    /// Spawn lane consumers, the result correlator and the heartbeat timer.
    /// Fails if called twice on the same bus.
    pub fn start(&self, cancel: CancellationToken) -> Result<Vec<JoinHandle<()>>, BusError> {
        let mut tasks = self.workers.spawn(cancel.clone())?;
        tasks.push(self.correlator.clone().spawn(self.bus.as_ref(), cancel.clone())?);
        tasks.push(self.heartbeats.clone().spawn(cancel));
        info!(tasks = tasks.len(), "pipeline started");
        Ok(tasks)
    }

    /// Validate, route and publish a submission. With a session handle the
    /// request is registered for delivery and its heartbeat starts before
    /// the envelope reaches the bus.
    pub async fn submit(
        &self,
        submission: Submission,
        session: Option<SessionHandle>,
    ) -> Result<Ack, SubmitError> {
        let routed = match self.router.route(&submission) {
            Ok(r) => r,
            Err(e) => {
                self.metrics.record_rejected();
                warn!(error = %e, bytes = submission.payload.len(), "submission rejected");
                return Err(e.into());
            }
        };
        self.metrics.record_submitted();
        if routed.fell_back {
            self.metrics.record_mode_fallback();
            warn!(
                correlation_id = %routed.correlation_id,
                requested = submission.mode.as_deref().unwrap_or_default(),
                "unrecognized processing mode, using standard"
            );
        }

        let id = routed.correlation_id.clone();
        if let Some(handle) = &session {
            self.sessions.register(Session::new(
                id.clone(),
                handle.clone(),
                routed.mode,
                routed.sequence_length,
            ));
            self.heartbeats
                .start(id.clone(), handle, routed.mode, routed.sequence_length);
        }

        if let Err(e) = self
            .bus
            .publish(routed.lane, Bytes::from(routed.envelope.encode()))
            .await
        {
            self.sessions.unregister(&id);
            self.heartbeats.stop(&id);
            warn!(correlation_id = %id, lane = %routed.lane, error = %e, "publish failed");
            return Err(e.into());
        }

        info!(
            correlation_id = %id,
            lane = %routed.lane,
            mode = %routed.mode,
            payload_size = routed.sequence_length,
            with_session = session.is_some(),
            "submission accepted"
        );

        Ok(Ack {
            correlation_id: id,
            lane: routed.lane.topic().to_string(),
            processing_mode: routed.mode,
            message: routed.ack,
            fell_back: routed.fell_back,
        })
    }

    /// Forget every request bound to a closing connection. Their heartbeats
    /// drop out on the next tick.
    pub fn connection_closed(&self, connection_id: &ConnectionId) -> usize {
        let removed = self.sessions.unregister_connection(connection_id);
        if removed > 0 {
            info!(connection_id = %connection_id, removed, "connection closed with requests in flight");
        }
        removed
    }

    pub fn health(&self) -> HealthReport {
        HealthReport {
            active_sessions: self.sessions.len(),
            in_flight_heartbeats: self.heartbeats.in_flight(),
            lanes: Lane::ALL
                .iter()
                .map(|lane| (lane.topic().to_string(), self.bus.depth(*lane)))
                .collect(),
            reliability: self.annotator.stats(),
            metrics: self.metrics.snapshot(),
        }
    }

    /// Ping the annotation service. A slow answer counts as down.
    pub async fn annotator_ready(&self) -> bool {
        match tokio::time::timeout(self.ping_timeout, self.annotator.ping()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(error_kind = e.error_kind(), error = %e, "annotation service ping failed");
                false
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.ping_timeout.as_millis() as u64,
                    "annotation service ping timed out"
                );
                false
            }
        }
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn heartbeats(&self) -> &Arc<HeartbeatScheduler> {
        &self.heartbeats
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use vepline_annotator::{MockAnnotator, MockResponse, ReliableConfig};
    use vepline_core::ValidationError;

    use crate::session::Frame;

    fn pipeline_with(mock: MockAnnotator) -> Pipeline {
        let mut settings = Settings::default();
        settings.pipeline.conversion_seed = Some(7);
        let annotator = Arc::new(ReliableAnnotator::new(
            Arc::new(mock),
            ReliableConfig::from(&settings.reliability),
        ));
        Pipeline::new(&settings, annotator, Arc::new(PipelineMetrics::new()))
    }

    async fn next_result(rx: &mut mpsc::Receiver<Frame>) -> Option<String> {
        while let Some(frame) = rx.recv().await {
            if let Frame::Text(t) = frame {
                if t.starts_with("Genetic Analysis Complete") {
                    return Some(t);
                }
            }
        }
        None
    }

    // ── End-to-end ──

    #[tokio::test]
    async fn standard_submission_is_acked_and_delivered() {
        let pipeline = pipeline_with(MockAnnotator::always(MockResponse::echo()));
        let cancel = CancellationToken::new();
        let tasks = pipeline.start(cancel.clone()).unwrap();
        let (handle, mut rx) = SessionHandle::channel(64);

        let ack = pipeline
            .submit(Submission::text("ATCGATCGATCG").with_mode("standard"), Some(handle))
            .await
            .unwrap();
        assert!(ack.message.contains("genetic-data-raw"));
        assert_eq!(ack.lane, "genetic-data-raw");

        let frame = tokio::time::timeout(Duration::from_secs(5), next_result(&mut rx))
            .await
            .unwrap()
            .unwrap();
        assert!(frame.contains("VEP Annotations Found"));
        assert!(frame.lines().last().unwrap().contains("Analysis completed at"));

        let health = pipeline.health();
        assert_eq!(health.active_sessions, 0);
        assert_eq!(health.in_flight_heartbeats, 0);
        assert_eq!(health.metrics.delivered, 1);

        cancel.cancel();
        for t in tasks {
            t.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cluster_scale_timeouts_deliver_degraded_frame() {
        let mock = MockAnnotator::always(MockResponse::delayed(
            Duration::from_secs(600),
            MockResponse::echo(),
        ));
        let pipeline = pipeline_with(mock);
        let cancel = CancellationToken::new();
        pipeline.start(cancel.clone()).unwrap();
        let (handle, mut rx) = SessionHandle::channel(256);

        let ack = pipeline
            .submit(Submission::text("ATCGATCGATCG").with_mode("cluster-scale"), Some(handle))
            .await
            .unwrap();
        assert_eq!(ack.processing_mode, ProcessingMode::ClusterScale);

        let frame = tokio::time::timeout(Duration::from_secs(250), next_result(&mut rx))
            .await
            .unwrap()
            .unwrap();
        assert!(frame.starts_with("Genetic Analysis Complete (cluster-scale)"));
        assert!(frame.to_lowercase().contains("no annotations available"));

        let health = pipeline.health();
        assert_eq!(health.metrics.degraded, 1);
        assert!(health.reliability.total_retries >= 1);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn session_gone_before_result_stops_heartbeat() {
        let pipeline = pipeline_with(MockAnnotator::always(MockResponse::echo()));
        let (handle, _rx) = SessionHandle::channel(64);

        // Not started: the request stays in flight.
        let ack = pipeline
            .submit(Submission::text("ATCGATCGATCG"), Some(handle))
            .await
            .unwrap();
        assert_eq!(pipeline.heartbeats().in_flight(), 1);

        pipeline.sessions().unregister(&ack.correlation_id);
        tokio::time::advance(Duration::from_secs(15)).await;
        pipeline.heartbeats().tick();
        assert_eq!(pipeline.heartbeats().in_flight(), 0);
    }

    #[tokio::test]
    async fn closing_connection_drops_its_requests() {
        let pipeline = pipeline_with(MockAnnotator::always(MockResponse::echo()));
        let (handle, _rx) = SessionHandle::channel(64);
        let conn = handle.connection_id().clone();
        for _ in 0..3 {
            pipeline
                .submit(Submission::text("ACGT"), Some(handle.clone()))
                .await
                .unwrap();
        }
        assert_eq!(pipeline.connection_closed(&conn), 3);
        assert!(pipeline.sessions().is_empty());
    }

    // ── Submission ──

    #[tokio::test]
    async fn invalid_payload_is_rejected_synchronously() {
        let pipeline = pipeline_with(MockAnnotator::always(MockResponse::echo()));
        let (handle, _rx) = SessionHandle::channel(8);
        let err = pipeline
            .submit(Submission::text("  "), Some(handle))
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::Validation(ValidationError::EmptyPayload)));
        assert!(pipeline.sessions().is_empty());
        assert_eq!(pipeline.metrics().snapshot().rejected, 1);
        assert_eq!(pipeline.health().lanes["genetic-data-raw"], 0);
    }

    #[tokio::test]
    async fn unknown_mode_is_counted_and_routed_standard() {
        let pipeline = pipeline_with(MockAnnotator::always(MockResponse::echo()));
        let ack = pipeline
            .submit(Submission::text("ACGT").with_mode("warp"), None)
            .await
            .unwrap();
        assert!(ack.fell_back);
        assert_eq!(ack.processing_mode, ProcessingMode::Standard);
        assert_eq!(pipeline.metrics().snapshot().mode_fallbacks, 1);
        assert_eq!(pipeline.health().lanes["genetic-data-raw"], 1);
    }

    #[tokio::test]
    async fn sessionless_result_is_dropped() {
        let pipeline = pipeline_with(MockAnnotator::always(MockResponse::echo()));
        let cancel = CancellationToken::new();
        pipeline.start(cancel.clone()).unwrap();

        pipeline.submit(Submission::text("ACGT"), None).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while pipeline.metrics().snapshot().dropped == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(pipeline.metrics().snapshot().delivered, 0);
        cancel.cancel();
    }

    #[tokio::test]
    async fn second_start_fails() {
        let pipeline = pipeline_with(MockAnnotator::always(MockResponse::echo()));
        let cancel = CancellationToken::new();
        pipeline.start(cancel.clone()).unwrap();
        assert!(matches!(
            pipeline.start(cancel.clone()),
            Err(BusError::AlreadySubscribed(_))
        ));
        cancel.cancel();
    }

    // ── Readiness ──

    struct StalledPing;

    #[async_trait::async_trait]
    impl vepline_core::AnnotationService for StalledPing {
        fn name(&self) -> &str {
            "stalled"
        }

        async fn annotate(
            &self,
            _notations: &[String],
        ) -> Result<Vec<vepline_core::AnnotationRecord>, vepline_core::AnnotationError> {
            Ok(Vec::new())
        }

        async fn ping(&self) -> Result<(), vepline_core::AnnotationError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn healthy_service_is_ready() {
        let pipeline = pipeline_with(MockAnnotator::always(MockResponse::echo()));
        assert!(pipeline.annotator_ready().await);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_ping_counts_as_down() {
        let settings = Settings::default();
        let annotator = Arc::new(ReliableAnnotator::with_defaults(Arc::new(StalledPing)));
        let pipeline = Pipeline::new(&settings, annotator, Arc::new(PipelineMetrics::new()));
        assert!(!pipeline.annotator_ready().await);
    }
}
