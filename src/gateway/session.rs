use std::{fmt, sync::Arc};

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::auth::CallerIdentity;

use super::{dispatch::SessionContext, protocol, AppState};

const OUTBOUND_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Connecting => "connecting",
            SessionState::Open => "open",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

struct Session {
    id: String,
    state: SessionState,
}

impl Session {
    fn transition(&mut self, next: SessionState) {
        tracing::debug!(session = %self.id, from = %self.state, to = %next, "Session state change");
        self.state = next;
    }
}

/// Drives one WebSocket connection until either side goes away.
///
/// Replies and heartbeats share a single outbound queue drained by a writer
/// task; when that task fails to send, the whole session is torn down.
pub async fn run(socket: WebSocket, identity: CallerIdentity, state: Arc<AppState>) {
    let mut session = Session {
        id: Uuid::new_v4().to_string(),
        state: SessionState::Connecting,
    };
    metrics::increment_counter!("gateway_sessions_total");
    tracing::info!(session = %session.id, user = %identity.name, role = %identity.role, "Client connected");

    let (mut sink, mut stream) = socket.split();
    let ack = protocol::connection_ack(&identity.name, &session.id);
    if let Err(e) = sink.send(Message::Text(ack)).await {
        tracing::warn!(session = %session.id, error = %e, "Failed to send connection ack");
        session.transition(SessionState::Closed);
        return;
    }
    session.transition(SessionState::Open);

    let (out_tx, mut out_rx) = mpsc::channel::<Message>(OUTBOUND_BUFFER);
    let writer_session = session.id.clone();
    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if let Err(e) = sink.send(msg).await {
                tracing::debug!(session = %writer_session, error = %e, "Outbound send failed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    let heartbeat_tx = out_tx.clone();
    let interval = state.gateway.heartbeat_interval();
    let heartbeat = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let beat = protocol::heartbeat(OffsetDateTime::now_utc().unix_timestamp());
            if heartbeat_tx.send(Message::Text(beat)).await.is_err() {
                break;
            }
        }
    });

    let mut ctx = SessionContext::new(identity);
    loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            _ = out_tx.closed() => {
                tracing::debug!(session = %session.id, "Outbound side closed");
                break;
            }
        };

        match frame {
            Some(Ok(Message::Text(text))) => {
                let dispatcher = state.dispatcher.clone();
                let mut working = ctx.clone();
                let handled = tokio::task::spawn_blocking(move || {
                    let reply = dispatcher.handle_text(&mut working, &text);
                    (working, reply)
                })
                .await;
                // A failed handler leaves the context as it was before the frame.
                let reply = match handled {
                    Ok((returned, reply)) => {
                        ctx = returned;
                        reply
                    }
                    Err(e) => {
                        tracing::error!(session = %session.id, error = %e, "Message handler failed");
                        metrics::increment_counter!("gateway_errors_total", "kind" => "internal_error");
                        protocol::error_reply("internal_error", "request handler failed", None, None)
                    }
                };
                if out_tx.send(Message::Text(reply)).await.is_err() {
                    break;
                }
            }
            Some(Ok(Message::Binary(_))) => {
                let reply = protocol::error_reply("invalid_json", "binary frames are not supported", None, None);
                metrics::increment_counter!("gateway_errors_total", "kind" => "invalid_json");
                if out_tx.send(Message::Text(reply)).await.is_err() {
                    break;
                }
            }
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) | None => {
                tracing::debug!(session = %session.id, "Client closed the connection");
                break;
            }
            Some(Err(e)) => {
                tracing::warn!(session = %session.id, error = %e, "WebSocket error");
                break;
            }
        }
    }

    session.transition(SessionState::Closing);
    heartbeat.abort();
    drop(out_tx);
    let _ = writer.await;
    session.transition(SessionState::Closed);
    tracing::info!(session = %session.id, "Client disconnected");
}
