use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vepline_core::{ConnectionId, CorrelationId, ProcessingMode};
use vepline_telemetry::PipelineMetrics;

use crate::format;
use crate::session::{SessionHandle, SessionRegistry};

#[derive(Debug)]
struct Tracked {
    mode: ProcessingMode,
    payload_size: usize,
    started: Instant,
}

/// What a single tick did for one tracked id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    Sent,
    /// Session absent or failed its probe; entry removed.
    Lost,
    /// Ceiling reached; notice sent (if still live) and entry removed.
    TimedOut,
    /// Entry already gone.
    Gone,
}

/// Periodic status frames for in-flight requests.
///
/// Each tracked id is either present (active) or absent (stopped, lost or
/// timed out). Every transition out of active is one atomic map removal, so
/// a tick racing `stop` can send at most the frame it already held the
/// entry for.
pub struct HeartbeatScheduler {
    entries: DashMap<CorrelationId, Tracked>,
    sessions: Arc<SessionRegistry>,
    metrics: Arc<PipelineMetrics>,
    interval: Duration,
    ceiling: Duration,
}

impl HeartbeatScheduler {
    pub fn new(
        sessions: Arc<SessionRegistry>,
        metrics: Arc<PipelineMetrics>,
        interval: Duration,
        ceiling: Duration,
    ) -> Self {
        Self {
            entries: DashMap::new(),
            sessions,
            metrics,
            interval,
            ceiling,
        }
    }

    /// Send the start frame now and begin tracking. Restarting an id resets
    /// its clock.
    pub fn start(
        &self,
        id: CorrelationId,
        handle: &SessionHandle,
        mode: ProcessingMode,
        payload_size: usize,
    ) {
        handle.send_text(format::start_message(mode, payload_size));
        self.metrics.record_heartbeat_frame();
        self.entries.insert(
            id.clone(),
            Tracked {
                mode,
                payload_size,
                started: Instant::now(),
            },
        );
        debug!(correlation_id = %id, mode = %mode, payload_size, "heartbeat started");
    }

    /// Idempotent. True if the id was being tracked.
    pub fn stop(&self, id: &CorrelationId) -> bool {
        let removed = self.entries.remove(id).is_some();
        if removed {
            debug!(correlation_id = %id, "heartbeat stopped");
        }
        removed
    }

    pub fn is_tracking(&self, id: &CorrelationId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn in_flight(&self) -> usize {
        self.entries.len()
    }

    /// One pass over every tracked id. Each connection is probed once per
    /// pass no matter how many of its requests are in flight.
    pub fn tick(&self) {
        let ids: Vec<CorrelationId> = self.entries.iter().map(|e| e.key().clone()).collect();
        let mut probed = HashMap::new();
        for id in ids {
            self.tick_with(&id, &mut probed);
        }
    }

    pub fn tick_one(&self, id: &CorrelationId) -> TickOutcome {
        self.tick_with(id, &mut HashMap::new())
    }

    fn tick_with(
        &self,
        id: &CorrelationId,
        probed: &mut HashMap<ConnectionId, bool>,
    ) -> TickOutcome {
        let elapsed = match self.entries.get(id) {
            Some(entry) => entry.started.elapsed(),
            None => return TickOutcome::Gone,
        };

        if elapsed >= self.ceiling {
            return self.time_out(id, probed);
        }

        let Some(handle) = self.sessions.live_handle_cached(id, probed) else {
            if self.entries.remove(id).is_some() {
                info!(correlation_id = %id, "session gone, heartbeat removed");
                return TickOutcome::Lost;
            }
            return TickOutcome::Gone;
        };

        // Send while holding the entry so a concurrent stop() waits for us.
        match self.entries.get(id) {
            Some(entry) => {
                handle.send_text(format::progress_message(entry.mode, elapsed));
                self.metrics.record_heartbeat_frame();
                debug!(
                    correlation_id = %id,
                    elapsed_secs = elapsed.as_secs(),
                    payload_size = entry.payload_size,
                    "heartbeat sent"
                );
                TickOutcome::Sent
            }
            None => TickOutcome::Gone,
        }
    }

    /// The notice goes out under the entry's write lock, so a result
    /// delivery (which stops the heartbeat first) always lands after it.
    fn time_out(
        &self,
        id: &CorrelationId,
        probed: &mut HashMap<ConnectionId, bool>,
    ) -> TickOutcome {
        let Entry::Occupied(entry) = self.entries.entry(id.clone()) else {
            return TickOutcome::Gone;
        };
        let elapsed = entry.get().started.elapsed();
        if let Some(handle) = self.sessions.live_handle_cached(id, probed) {
            handle.send_text(format::timeout_notice());
        }
        let (_, tracked) = entry.remove_entry();
        self.metrics.record_heartbeat_timeout();
        warn!(
            correlation_id = %id,
            mode = %tracked.mode,
            elapsed_secs = elapsed.as_secs(),
            "heartbeat ceiling reached, annotation still running"
        );
        TickOutcome::TimedOut
    }

    /// Drive `tick` on the configured interval until cancelled.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await; // first tick is immediate

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("heartbeat scheduler stopping");
                        break;
                    }
                    _ = ticker.tick() => self.tick(),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Frame, Session};
    use tokio::sync::mpsc;

    const INTERVAL: Duration = Duration::from_secs(15);
    const CEILING: Duration = Duration::from_secs(60);

    struct Fixture {
        scheduler: Arc<HeartbeatScheduler>,
        sessions: Arc<SessionRegistry>,
        metrics: Arc<PipelineMetrics>,
    }

    fn fixture() -> Fixture {
        // Long pong timeout: these tests are about the ceiling, not liveness.
        let sessions = Arc::new(SessionRegistry::new(Duration::from_secs(3600)));
        let metrics = Arc::new(PipelineMetrics::new());
        let scheduler = Arc::new(HeartbeatScheduler::new(
            sessions.clone(),
            metrics.clone(),
            INTERVAL,
            CEILING,
        ));
        Fixture {
            scheduler,
            sessions,
            metrics,
        }
    }

    fn connect(f: &Fixture, id: &str) -> (CorrelationId, SessionHandle, mpsc::Receiver<Frame>) {
        let (handle, rx) = SessionHandle::channel(256);
        let id = CorrelationId::from_raw(id);
        f.sessions
            .register(Session::new(id.clone(), handle.clone(), ProcessingMode::Standard, 12));
        (id, handle, rx)
    }

    fn texts(rx: &mut mpsc::Receiver<Frame>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if let Frame::Text(t) = frame {
                out.push(t);
            }
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn start_emits_immediately() {
        let f = fixture();
        let (id, handle, mut rx) = connect(&f, "a");
        f.scheduler.start(id.clone(), &handle, ProcessingMode::Standard, 12);

        let frames = texts(&mut rx);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].contains("Starting VEP annotation analysis"));
        assert!(f.scheduler.is_tracking(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn tick_sends_progress_while_live() {
        let f = fixture();
        let (id, handle, mut rx) = connect(&f, "a");
        f.scheduler.start(id.clone(), &handle, ProcessingMode::Standard, 12);
        texts(&mut rx);

        tokio::time::advance(INTERVAL).await;
        assert_eq!(f.scheduler.tick_one(&id), TickOutcome::Sent);
        let frames = texts(&mut rx);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].contains("scaling up"));
        assert_eq!(f.metrics.snapshot().heartbeat_frames, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn ceiling_emits_one_notice_then_nothing() {
        let f = fixture();
        let (id, handle, mut rx) = connect(&f, "a");
        f.scheduler.start(id.clone(), &handle, ProcessingMode::Standard, 12);

        for _ in 0..3 {
            tokio::time::advance(INTERVAL).await;
            assert_eq!(f.scheduler.tick_one(&id), TickOutcome::Sent);
        }
        texts(&mut rx);

        tokio::time::advance(INTERVAL).await;
        assert_eq!(f.scheduler.tick_one(&id), TickOutcome::TimedOut);
        let frames = texts(&mut rx);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].contains("taking longer than expected"));

        for _ in 0..4 {
            tokio::time::advance(INTERVAL).await;
            f.scheduler.tick();
        }
        assert!(texts(&mut rx).is_empty());
        assert!(!f.scheduler.is_tracking(&id));
        assert_eq!(f.metrics.snapshot().heartbeat_timeouts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unregistered_session_is_dropped_on_next_tick() {
        let f = fixture();
        let (id, handle, mut rx) = connect(&f, "a");
        f.scheduler.start(id.clone(), &handle, ProcessingMode::ClusterScale, 12);
        texts(&mut rx);

        f.sessions.unregister(&id);
        tokio::time::advance(INTERVAL).await;
        assert_eq!(f.scheduler.tick_one(&id), TickOutcome::Lost);
        assert!(texts(&mut rx).is_empty());
        assert_eq!(f.scheduler.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_connection_is_dropped_on_next_tick() {
        let f = fixture();
        let (id, handle, rx) = connect(&f, "a");
        f.scheduler.start(id.clone(), &handle, ProcessingMode::Standard, 12);
        drop(rx);

        f.scheduler.tick();
        assert!(!f.scheduler.is_tracking(&id));
        assert!(f.sessions.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent_and_silences_ticks() {
        let f = fixture();
        let (id, handle, mut rx) = connect(&f, "a");
        f.scheduler.start(id.clone(), &handle, ProcessingMode::Standard, 12);
        texts(&mut rx);

        assert!(f.scheduler.stop(&id));
        assert!(!f.scheduler.stop(&id));
        tokio::time::advance(INTERVAL).await;
        assert_eq!(f.scheduler.tick_one(&id), TickOutcome::Gone);
        assert!(texts(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_loop_ticks_until_cancelled() {
        let f = fixture();
        let (id, handle, mut rx) = connect(&f, "a");
        f.scheduler.start(id.clone(), &handle, ProcessingMode::HighVolume, 5000);
        texts(&mut rx);

        let cancel = CancellationToken::new();
        let task = f.scheduler.clone().spawn(cancel.clone());

        tokio::time::sleep(INTERVAL * 2 + Duration::from_millis(10)).await;
        let progress: Vec<_> = texts(&mut rx);
        assert_eq!(progress.len(), 2, "{progress:?}");

        cancel.cancel();
        task.await.unwrap();
        tokio::time::sleep(INTERVAL * 2).await;
        assert!(texts(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn one_ping_per_connection_per_tick() {
        let f = fixture();
        let (handle, mut rx) = SessionHandle::channel(256);
        for i in 0..200 {
            let id = CorrelationId::from_raw(format!("id-{i}"));
            f.sessions
                .register(Session::new(id.clone(), handle.clone(), ProcessingMode::Standard, 12));
            f.scheduler.start(id, &handle, ProcessingMode::Standard, 12);
        }
        texts(&mut rx);

        tokio::time::advance(INTERVAL).await;
        f.scheduler.tick();

        let mut pings = 0;
        let mut progress = 0;
        while let Ok(frame) = rx.try_recv() {
            match frame {
                Frame::Ping => pings += 1,
                Frame::Text(_) => progress += 1,
            }
        }
        assert_eq!(pings, 1);
        assert_eq!(progress, 200);
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_at_the_ceiling_sends_no_notice() {
        let f = fixture();
        let (id, handle, mut rx) = connect(&f, "a");
        f.scheduler.start(id.clone(), &handle, ProcessingMode::Standard, 12);
        texts(&mut rx);

        tokio::time::advance(CEILING).await;
        assert!(f.scheduler.stop(&id));
        f.sessions.claim(&id);
        assert_eq!(f.scheduler.tick_one(&id), TickOutcome::Gone);
        assert!(texts(&mut rx).is_empty());
        assert_eq!(f.metrics.snapshot().heartbeat_timeouts, 0);
    }

    #[tokio::test]
    async fn concurrent_ticks_and_stops_do_not_panic() {
        let f = fixture();
        let mut ids = Vec::new();
        let mut receivers = Vec::new();
        for i in 0..32 {
            let (id, handle, rx) = connect(&f, &format!("id-{i}"));
            f.scheduler.start(id.clone(), &handle, ProcessingMode::Standard, 1);
            ids.push(id);
            receivers.push(rx);
        }

        let mut tasks = Vec::new();
        for id in ids.clone() {
            let s = f.scheduler.clone();
            tasks.push(tokio::spawn(async move { s.stop(&id) }));
            let s = f.scheduler.clone();
            tasks.push(tokio::spawn(async move {
                s.tick();
                true
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(f.scheduler.in_flight(), 0);
    }
}
