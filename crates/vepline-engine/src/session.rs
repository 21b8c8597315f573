use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use vepline_core::{ConnectionId, CorrelationId, ProcessingMode};

/// Outbound frame queued for a connection's writer task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    /// Transport-level keepalive probe.
    Ping,
}

impl Frame {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(t) => Some(t),
            Self::Ping => None,
        }
    }
}

#[derive(Debug)]
struct Liveness {
    opened: Instant,
    last_pong_ms: AtomicU64,
}

/// Cheap, cloneable handle to a live connection's outbound queue.
///
/// The connection owns the receiving side; registry entries and heartbeat
/// ticks only ever hold clones of this handle.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    connection_id: ConnectionId,
    tx: mpsc::Sender<Frame>,
    liveness: Arc<Liveness>,
}

impl SessionHandle {
    pub fn new(connection_id: ConnectionId, tx: mpsc::Sender<Frame>) -> Self {
        Self {
            connection_id,
            tx,
            liveness: Arc::new(Liveness {
                opened: Instant::now(),
                last_pong_ms: AtomicU64::new(0),
            }),
        }
    }

    /// Handle plus the receiver a writer task would drain.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(ConnectionId::new(), tx), rx)
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    pub fn record_pong(&self) {
        let ms = self.liveness.opened.elapsed().as_millis() as u64;
        self.liveness.last_pong_ms.store(ms, Ordering::Relaxed);
    }

    /// Time since the last pong, or since the connection opened.
    pub fn since_last_pong(&self) -> Duration {
        let now = self.liveness.opened.elapsed();
        now.saturating_sub(Duration::from_millis(
            self.liveness.last_pong_ms.load(Ordering::Relaxed),
        ))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Queue a text frame. False if the queue is full or the writer is gone.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        match self.tx.try_send(Frame::Text(text.into())) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(frame)) => {
                warn!(
                    connection_id = %self.connection_id,
                    frame_len = frame.as_text().map(str::len).unwrap_or(0),
                    "send queue full, dropping frame"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Queue a text frame, waiting up to `wait` for room. False only if the
    /// writer is gone or stayed blocked for the whole wait.
    pub async fn deliver(&self, text: impl Into<String>, wait: Duration) -> bool {
        match tokio::time::timeout(wait, self.tx.send(Frame::Text(text.into()))).await {
            Ok(Ok(())) => true,
            Ok(Err(_)) => false,
            Err(_) => {
                warn!(
                    connection_id = %self.connection_id,
                    wait_ms = wait.as_millis() as u64,
                    "send queue stayed full"
                );
                false
            }
        }
    }

    /// Active probe: push a ping through the outbound queue and require a
    /// recent pong. A full queue is not a failure on its own.
    pub fn probe(&self, pong_timeout: Duration) -> bool {
        match self.tx.try_send(Frame::Ping) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => {}
            Err(mpsc::error::TrySendError::Closed(_)) => return false,
        }
        self.since_last_pong() < pong_timeout
    }
}

/// One in-flight request's binding to a connection.
#[derive(Clone, Debug)]
pub struct Session {
    pub correlation_id: CorrelationId,
    pub handle: SessionHandle,
    pub mode: ProcessingMode,
    pub payload_size: usize,
    pub registered_at: DateTime<Utc>,
}

impl Session {
    pub fn new(
        correlation_id: CorrelationId,
        handle: SessionHandle,
        mode: ProcessingMode,
        payload_size: usize,
    ) -> Self {
        Self {
            correlation_id,
            handle,
            mode,
            payload_size,
            registered_at: Utc::now(),
        }
    }
}

/// Correlation id -> live connection. Per-key atomicity, no global lock.
pub struct SessionRegistry {
    sessions: DashMap<CorrelationId, Session>,
    pong_timeout: Duration,
}

impl SessionRegistry {
    pub fn new(pong_timeout: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            pong_timeout,
        }
    }

    /// Last writer wins. Returns true if an older entry was replaced.
    pub fn register(&self, session: Session) -> bool {
        let id = session.correlation_id.clone();
        let replaced = self.sessions.insert(id.clone(), session).is_some();
        debug!(correlation_id = %id, replaced, "session registered");
        replaced
    }

    /// Idempotent. Returns true if an entry was removed.
    pub fn unregister(&self, id: &CorrelationId) -> bool {
        self.sessions.remove(id).is_some()
    }

    /// Drop every entry bound to a closing connection.
    pub fn unregister_connection(&self, connection_id: &ConnectionId) -> usize {
        let mut removed = 0;
        self.sessions.retain(|_, s| {
            let keep = s.handle.connection_id() != connection_id;
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    pub fn get(&self, id: &CorrelationId) -> Option<SessionHandle> {
        self.sessions.get(id).map(|s| s.handle.clone())
    }

    pub fn is_live(&self, handle: &SessionHandle) -> bool {
        handle.probe(self.pong_timeout)
    }

    /// Look up and probe. A failed probe removes the entry, unless it was
    /// replaced by a different connection in the meantime.
    pub fn live_handle(&self, id: &CorrelationId) -> Option<SessionHandle> {
        self.live_handle_cached(id, &mut HashMap::new())
    }

    /// [`live_handle`](Self::live_handle) that probes each connection at
    /// most once per `probed` map. Many ids share one connection, so a
    /// sweep over all of them sends a single ping per socket.
    pub fn live_handle_cached(
        &self,
        id: &CorrelationId,
        probed: &mut HashMap<ConnectionId, bool>,
    ) -> Option<SessionHandle> {
        let handle = self.get(id)?;
        let live = match probed.get(handle.connection_id()) {
            Some(live) => *live,
            None => {
                let live = self.is_live(&handle);
                probed.insert(handle.connection_id().clone(), live);
                live
            }
        };
        if live {
            return Some(handle);
        }
        let conn = handle.connection_id().clone();
        if self
            .sessions
            .remove_if(id, |_, s| s.handle.connection_id() == &conn)
            .is_some()
        {
            debug!(correlation_id = %id, connection_id = %conn, "removed dead session");
        }
        None
    }

    /// Atomically take the entry. At most one caller gets it.
    pub fn claim(&self, id: &CorrelationId) -> Option<Session> {
        self.sessions.remove(id).map(|(_, s)| s)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
