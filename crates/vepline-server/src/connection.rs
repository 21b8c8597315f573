use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use vepline_engine::{Frame, Pipeline, SessionHandle, SubmitError};

use crate::submission::parse_submission;

pub const GREETING: &str = "🧬 Connected to vepline genetic analysis. Send a DNA sequence (plain text or JSON) to begin.";

/// Per-connection knobs taken from server settings.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    pub max_send_queue: usize,
    pub ping_interval: Duration,
}

/// Text sent back for one client frame.
pub async fn reply_to(pipeline: &Pipeline, text: &str, handle: &SessionHandle) -> String {
    let submission = match parse_submission(text) {
        Ok(s) => s,
        Err(e) => {
            pipeline.metrics().record_rejected();
            return format!("❌ Submission rejected: {e}");
        }
    };
    match pipeline.submit(submission, Some(handle.clone())).await {
        Ok(ack) => ack.message,
        Err(SubmitError::Validation(e)) => format!("❌ Submission rejected: {e}"),
        Err(e) => format!("❌ Submission failed: {e}"),
    }
}

/// Run one WebSocket connection to completion: split into reader and
/// writer, route client frames into the pipeline, and drop the
/// connection's pending requests when either side ends.
pub async fn handle_connection(socket: WebSocket, pipeline: Arc<Pipeline>, config: ConnectionConfig) {
    let (handle, rx) = SessionHandle::channel(config.max_send_queue);
    let connection_id = handle.connection_id().clone();
    info!(connection_id = %connection_id, "client connected");

    let (ws_tx, mut ws_rx) = socket.split();
    handle.send_text(GREETING);

    let writer = tokio::spawn(write_frames(ws_tx, rx, config.ping_interval));

    let reader_handle = handle.clone();
    let reader_pipeline = pipeline.clone();
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => {
                    let reply = reply_to(&reader_pipeline, text.as_str(), &reader_handle).await;
                    reader_handle.send_text(reply);
                }
                WsMessage::Pong(_) => {
                    reader_handle.record_pong();
                    trace!(connection_id = %reader_handle.connection_id(), "pong");
                }
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = writer => {},
        _ = reader => {},
    }

    pipeline.connection_closed(&connection_id);
    info!(connection_id = %connection_id, "client disconnected");
}

async fn write_frames<S>(mut ws_tx: S, mut rx: mpsc::Receiver<Frame>, ping_interval: Duration)
where
    S: futures::Sink<WsMessage> + Unpin,
{
    let mut ping = tokio::time::interval(ping_interval);
    ping.tick().await; // first tick is immediate

    loop {
        let outgoing = tokio::select! {
            frame = rx.recv() => match frame {
                Some(Frame::Text(text)) => WsMessage::Text(text.into()),
                Some(Frame::Ping) => WsMessage::Ping(Default::default()),
                None => break,
            },
            _ = ping.tick() => WsMessage::Ping(Default::default()),
        };
        if ws_tx.send(outgoing).await.is_err() {
            debug!("socket closed while writing");
            break;
        }
    }
    if ws_tx.close().await.is_err() {
        warn!("failed to close socket cleanly");
    }
}
