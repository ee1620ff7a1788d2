use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Message as WsMessage},
};
use tracing::{debug, info, warn};

use crate::{
    consts::{
        AUTH_HEADER, STREAM_CONNECT_TIMEOUT_SECS, STREAM_LIVENESS_CHECK_INTERVAL_SECS,
        STREAM_LIVENESS_IDLE_SECS, STREAM_LIVENESS_PING_GRACE_SECS,
    },
    core::{redact_ws_url, truncate_message, unix_now_secs},
    model::Message,
};

/// Events produced by the live stream. Consumed on the controller's loop.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Opened,
    Message(Message),
    /// The session ended without a transport error (stop requested or clean close).
    Closed(String),
    Error(String),
}

/// A stream event tagged with the listener session that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamUpdate {
    pub session: u64,
    pub event: StreamEvent,
}

/// Owns the websocket session behind `RemoteClient::listen`.
///
/// Every `start` that opens a new websocket gets a fresh session number.
/// A session only clears listener state that still belongs to it, so a
/// stopped session winding down cannot disturb its successor.
pub struct Listener {
    /// Session whose websocket is open, 0 while none is.
    live_session: Arc<AtomicU64>,
    state: Arc<Mutex<ListenerState>>,
}

#[derive(Default)]
struct ListenerState {
    stop_tx: Option<watch::Sender<bool>>,
    session: u64,
}

fn lock_state(state: &Mutex<ListenerState>) -> MutexGuard<'_, ListenerState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Marks `session` closed unless a newer session already owns the flag.
fn end_session(live_session: &AtomicU64, session: u64) {
    let _ = live_session.compare_exchange(session, 0, Ordering::AcqRel, Ordering::Acquire);
}

impl Default for Listener {
    fn default() -> Self {
        Self::new()
    }
}

impl Listener {
    pub fn new() -> Self {
        Self {
            live_session: Arc::new(AtomicU64::new(0)),
            state: Arc::new(Mutex::new(ListenerState::default())),
        }
    }

    pub fn is_listening(&self) -> bool {
        self.live_session.load(Ordering::Acquire) != 0
    }

    /// Opens a session unless one is already running, and returns the
    /// number of the session that is now current.
    pub fn start(
        &self,
        ws_url: String,
        token: String,
        events: mpsc::UnboundedSender<StreamUpdate>,
    ) -> u64 {
        let (stop_rx, session) = {
            let mut state = lock_state(&self.state);
            if state.stop_tx.is_some() {
                debug!("listener already running (session {})", state.session);
                return state.session;
            }
            let (tx, rx) = watch::channel(false);
            state.stop_tx = Some(tx);
            state.session = state.session.wrapping_add(1).max(1);
            (rx, state.session)
        };

        let live_session = Arc::clone(&self.live_session);
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let mut stop_rx = stop_rx;
            let result =
                stream_once(&ws_url, &token, session, &live_session, &events, &mut stop_rx).await;
            end_session(&live_session, session);
            {
                let mut state = lock_state(&state);
                if state.session == session {
                    state.stop_tx = None;
                }
            }
            let event = match result {
                Ok(reason) => {
                    info!("stream session {session} closed: {reason}");
                    StreamEvent::Closed(reason)
                }
                Err(error) => {
                    warn!("stream session {session} error: {error}");
                    StreamEvent::Error(truncate_message(&error, 300))
                }
            };
            let _ = events.send(StreamUpdate { session, event });
        });
        session
    }

    pub fn stop(&self) {
        if let Some(stop_tx) = lock_state(&self.state).stop_tx.take() {
            let _ = stop_tx.send(true);
        }
    }
}

/// Runs one websocket session. `Ok` carries the reason for a clean end.
async fn stream_once(
    ws_url: &str,
    token: &str,
    session: u64,
    live_session: &AtomicU64,
    events: &mpsc::UnboundedSender<StreamUpdate>,
    stop_rx: &mut watch::Receiver<bool>,
) -> Result<String, String> {
    debug!("ws connect {}", redact_ws_url(ws_url));
    let mut ws_request = ws_url
        .into_client_request()
        .map_err(|error| format!("Failed to build websocket request: {error}"))?;
    let token_header = HeaderValue::from_str(token.trim())
        .map_err(|error| format!("Invalid token for websocket header: {error}"))?;
    ws_request.headers_mut().insert(AUTH_HEADER, token_header);

    let connect = tokio::time::timeout(
        Duration::from_secs(STREAM_CONNECT_TIMEOUT_SECS),
        connect_async(ws_request),
    );
    let (mut ws_stream, _) = tokio::select! {
        _ = stop_rx.changed() => return Ok("stop requested while connecting".to_string()),
        connected = connect => connected
            .map_err(|_| format!("Stream connection timed out after {STREAM_CONNECT_TIMEOUT_SECS} seconds"))?
            .map_err(|error| format!("Stream connection failed: {error}"))?,
    };

    info!("ws connected (session {session})");
    live_session.store(session, Ordering::Release);
    let _ = events.send(StreamUpdate {
        session,
        event: StreamEvent::Opened,
    });

    let mut liveness_interval =
        tokio::time::interval(Duration::from_secs(STREAM_LIVENESS_CHECK_INTERVAL_SECS));
    liveness_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    liveness_interval.tick().await;
    let mut last_activity_at = unix_now_secs();
    let mut pending_ping_since: Option<u64> = None;

    loop {
        tokio::select! {
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    let _ = ws_stream.close(None).await;
                    return Ok("stop requested".to_string());
                }
            }
            incoming = ws_stream.next() => {
                let event_now = unix_now_secs();
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        last_activity_at = event_now;
                        pending_ping_since = None;
                        debug!("ws text frame bytes={}", text.len());
                        match serde_json::from_str::<Message>(text.as_ref()) {
                            Ok(message) => {
                                let _ = events.send(StreamUpdate {
                                    session,
                                    event: StreamEvent::Message(message),
                                });
                            }
                            Err(error) => debug!(
                                "stream decode failed: {error} payload={}",
                                truncate_message(text.as_ref(), 140)
                            ),
                        }
                    }
                    Some(Ok(WsMessage::Ping(payload))) => {
                        last_activity_at = event_now;
                        pending_ping_since = None;
                        ws_stream.send(WsMessage::Pong(payload)).await
                            .map_err(|error| format!("Failed to send pong: {error}"))?;
                    }
                    Some(Ok(WsMessage::Close(_))) => {
                        return Ok("Stream closed by server".to_string());
                    }
                    Some(Ok(_)) => {
                        last_activity_at = event_now;
                        pending_ping_since = None;
                    }
                    Some(Err(error)) => return Err(format!("Stream read error: {error}")),
                    None => return Err("Stream ended unexpectedly".to_string()),
                }
            }
            _ = liveness_interval.tick() => {
                let event_now = unix_now_secs();
                if event_now.saturating_sub(last_activity_at) < STREAM_LIVENESS_IDLE_SECS {
                    continue;
                }
                match pending_ping_since {
                    None => {
                        debug!("ws liveness ping sent");
                        ws_stream
                            .send(WsMessage::Ping(Vec::<u8>::new().into()))
                            .await
                            .map_err(|error| format!("Failed to send liveness ping: {error}"))?;
                        pending_ping_since = Some(event_now);
                    }
                    Some(started) => {
                        if event_now.saturating_sub(started) >= STREAM_LIVENESS_PING_GRACE_SECS {
                            return Err(format!(
                                "Stream liveness timeout after {}s idle",
                                event_now.saturating_sub(last_activity_at)
                            ));
                        }
                    }
                }
            }
        }
    }
}
