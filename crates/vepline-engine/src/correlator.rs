use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vepline_core::{AnnotationResult, CorrelationId, EventEnvelope, Lane};
use vepline_telemetry::PipelineMetrics;

use crate::bus::MessageBus;
use crate::error::BusError;
use crate::format;
use crate::heartbeat::HeartbeatScheduler;
use crate::session::SessionRegistry;

/// How many delivered ids are remembered to tell duplicates from misses.
const RECENT_CAPACITY: usize = 4096;

/// How long a result frame may wait for room in a busy connection's queue.
pub const DEFAULT_DELIVERY_WAIT: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// No session registered for the id.
    Absent,
    /// Session registered but its connection failed the probe.
    NotLive,
    /// Live session, but the frame could not be queued in time.
    SendFailed,
    /// The id was already delivered.
    Duplicate,
    /// Envelope or correlation id could not be read.
    Undecodable,
}

#[derive(Default)]
struct RecentIds {
    set: HashSet<CorrelationId>,
    order: VecDeque<CorrelationId>,
}

impl RecentIds {
    fn insert(&mut self, id: CorrelationId) {
        if !self.set.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        if self.order.len() > RECENT_CAPACITY {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
    }
}

/// Routes annotated results back to the session that asked for them.
///
/// Delivery is at most once: the registry entry is claimed with one atomic
/// remove and only the claimant sends. Results for absent or dead sessions
/// are logged and dropped.
pub struct ResultCorrelator {
    sessions: Arc<SessionRegistry>,
    heartbeats: Arc<HeartbeatScheduler>,
    metrics: Arc<PipelineMetrics>,
    recent: Mutex<RecentIds>,
    delivery_wait: Duration,
}

impl ResultCorrelator {
    pub fn new(
        sessions: Arc<SessionRegistry>,
        heartbeats: Arc<HeartbeatScheduler>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            sessions,
            heartbeats,
            metrics,
            recent: Mutex::new(RecentIds::default()),
            delivery_wait: DEFAULT_DELIVERY_WAIT,
        }
    }

    pub fn with_delivery_wait(mut self, wait: Duration) -> Self {
        self.delivery_wait = wait;
        self
    }

    /// Handle one message from the annotated lane.
    pub async fn handle(&self, message: &[u8]) -> DeliveryOutcome {
        match EventEnvelope::decode(message) {
            Ok(envelope) => self.handle_envelope(&envelope).await,
            Err(e) => {
                warn!(bytes = message.len(), error = %e, "dropping undecodable result envelope");
                self.metrics.record_dropped();
                DeliveryOutcome::Undecodable
            }
        }
    }

    pub async fn handle_envelope(&self, envelope: &EventEnvelope) -> DeliveryOutcome {
        let Some(id) = envelope.correlation_id() else {
            warn!(envelope_id = %envelope.id(), "result envelope has no correlation id");
            self.metrics.record_dropped();
            return DeliveryOutcome::Undecodable;
        };

        // Stopped whatever happens next.
        self.heartbeats.stop(&id);

        let message = match serde_json::from_slice::<AnnotationResult>(&envelope.payload().data) {
            Ok(result) => format::result_message(&result),
            Err(e) => {
                warn!(correlation_id = %id, error = %e, "result payload unreadable");
                format::unreadable_result_message()
            }
        };

        let Some(session) = self.sessions.claim(&id) else {
            if self.recent.lock().set.contains(&id) {
                info!(correlation_id = %id, "duplicate result dropped");
                self.metrics.record_duplicate();
                return DeliveryOutcome::Duplicate;
            }
            info!(correlation_id = %id, "no session for result, dropped");
            self.metrics.record_dropped();
            return DeliveryOutcome::Absent;
        };

        if !self.sessions.is_live(&session.handle) {
            info!(
                correlation_id = %id,
                connection_id = %session.handle.connection_id(),
                "session not live, result dropped"
            );
            self.metrics.record_dropped();
            return DeliveryOutcome::NotLive;
        }

        if !session.handle.deliver(message, self.delivery_wait).await {
            warn!(correlation_id = %id, "result frame could not be queued");
            self.metrics.record_dropped();
            return DeliveryOutcome::SendFailed;
        }

        self.recent.lock().insert(id.clone());
        self.metrics.record_delivered();
        info!(
            correlation_id = %id,
            connection_id = %session.handle.connection_id(),
            mode = %session.mode,
            "result delivered"
        );
        DeliveryOutcome::Delivered
    }

    /// Consume the annotated lane until cancelled. Each result is delivered
    /// on its own task so one slow connection cannot hold up the rest.
    pub fn spawn(
        self: Arc<Self>,
        bus: &dyn MessageBus,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>, BusError> {
        let mut rx = bus.subscribe(Lane::Annotated)?;
        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Some(m) => {
                            let correlator = self.clone();
                            tokio::spawn(async move {
                                correlator.handle(&m).await;
                            });
                        }
                        None => break,
                    },
                }
            }
            debug!("result correlator stopped");
        }))
    }
}
