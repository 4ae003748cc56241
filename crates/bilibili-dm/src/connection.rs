//! Per-room connection supervisor: resolve, connect, authenticate, stream,
//! back off, repeat until cancelled.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::{COOKIE, USER_AGENT};
use tokio_util::sync::CancellationToken;

use crate::api::{self, RoomApi};
use crate::dispatch::Dispatcher;
use crate::protocol;
use crate::types::{ClientConfig, Credentials, Error, TimingConfig};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

pub(crate) type WsRead = futures_util::stream::SplitStream<WsStream>;
pub(crate) type WsWrite = futures_util::stream::SplitSink<WsStream, tungstenite::Message>;

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// `min(max_backoff, base_backoff * 2^(attempt - 1))`; attempt 0 is treated as 1.
pub(crate) fn backoff_delay(timing: &TimingConfig, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(30);
    timing
        .base_backoff
        .saturating_mul(1u32 << exp)
        .min(timing.max_backoff)
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

pub(crate) struct RoomConnection {
    short_id: i64,
    /// Set by the first successful lookup and kept across reconnects.
    resolved_id: Option<i64>,
    /// Failed cycles since the last time the room reached streaming.
    attempt: u32,
    api: Arc<dyn RoomApi>,
    dispatcher: Arc<Dispatcher>,
    timing: TimingConfig,
    ws_scheme: String,
    credentials: Option<Credentials>,
}

impl RoomConnection {
    pub(crate) fn new(
        short_id: i64,
        api: Arc<dyn RoomApi>,
        dispatcher: Arc<Dispatcher>,
        config: &ClientConfig,
    ) -> Self {
        Self {
            short_id,
            resolved_id: None,
            attempt: 0,
            api,
            dispatcher,
            timing: config.timing.clone(),
            ws_scheme: config.api.ws_scheme.clone(),
            credentials: config.credentials.clone(),
        }
    }

    /// Keep the room connected until `cancel` fires. Never gives up on its own.
    pub(crate) async fn run(mut self, cancel: CancellationToken) {
        loop {
            match self.cycle(&cancel).await {
                Ok(()) | Err(Error::Cancelled) => {
                    tracing::info!(room = self.short_id, "Room connection stopped");
                    return;
                }
                Err(e) => {
                    tracing::warn!(
                        room = self.short_id,
                        attempt = self.attempt,
                        "Connection cycle failed: {e}"
                    );
                }
            }

            self.attempt = self.attempt.saturating_add(1);
            let backoff = backoff_delay(&self.timing, self.attempt);
            tracing::info!(
                room = self.short_id,
                attempt = self.attempt,
                backoff = ?backoff,
                "Reconnecting after backoff"
            );
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = cancel.cancelled() => {
                    tracing::info!(room = self.short_id, "Close requested during backoff");
                    return;
                }
            }
        }
    }

    /// One pass through resolve → connect → auth → stream. Returns `Ok(())`
    /// only when cancelled while streaming; any other exit is an error.
    async fn cycle(&mut self, cancel: &CancellationToken) -> Result<(), Error> {
        let room_id = match self.resolved_id {
            Some(id) => id,
            None => {
                let id = cancel
                    .run_until_cancelled(self.api.resolve_room(self.short_id))
                    .await
                    .ok_or(Error::Cancelled)??;
                if id != self.short_id {
                    tracing::info!(room = self.short_id, "Resolved to room {id}");
                }
                self.resolved_id = Some(id);
                id
            }
        };

        let info = cancel
            .run_until_cancelled(self.api.connection_info(room_id))
            .await
            .ok_or(Error::Cancelled)??;
        let url = info.ws_url(&self.ws_scheme);

        let (mut write, read) = cancel
            .run_until_cancelled(self.connect(&url))
            .await
            .ok_or(Error::Cancelled)??;

        // Auth must be the first frame on the socket.
        let auth = protocol::auth_packet(room_id, &info.token)?;
        write
            .send(tungstenite::Message::Binary(protocol::encode(&auth).into()))
            .await?;
        tracing::info!(
            room = self.short_id,
            authenticated = !info.token.is_empty(),
            "Connected to {url}"
        );
        self.attempt = 0;

        self.stream(room_id, Arc::new(Mutex::new(write)), read, cancel)
            .await
    }

    async fn connect(&self, url: &str) -> Result<(WsWrite, WsRead), Error> {
        let mut request = url.into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(USER_AGENT, HeaderValue::from_static(api::USER_AGENT));
        if let Some(creds) = &self.credentials {
            match HeaderValue::from_str(&creds.cookie_header()) {
                Ok(v) => {
                    headers.insert(COOKIE, v);
                }
                Err(_) => {
                    tracing::warn!(room = self.short_id, "Cookie is not a valid header value");
                }
            }
        }

        let (ws, _resp) = tokio::time::timeout(
            self.timing.handshake_timeout,
            tokio_tungstenite::connect_async(request),
        )
        .await
        .map_err(|_| Error::Timeout("WebSocket handshake"))??;
        Ok(ws.split())
    }

    async fn stream(
        &self,
        room_id: i64,
        write: Arc<Mutex<WsWrite>>,
        mut read: WsRead,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let heartbeat_cancel = cancel.child_token();
        // Stops the heartbeat task however this session ends.
        let _heartbeat_guard = heartbeat_cancel.clone().drop_guard();
        let mut heartbeat = tokio::spawn(heartbeat_loop(
            write.clone(),
            self.timing.heartbeat_interval,
            heartbeat_cancel,
        ));

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    tracing::info!(room = self.short_id, "Close requested");
                    let close = async {
                        let _ = write.lock().await.send(tungstenite::Message::Close(None)).await;
                    };
                    let _ = tokio::time::timeout(self.timing.handshake_timeout, close).await;
                    return Ok(());
                }

                res = &mut heartbeat => {
                    return Err(match res {
                        Ok(Err(e)) => e,
                        _ => Error::HeartbeatStopped,
                    });
                }

                frame = read.next() => match frame {
                    Some(Ok(tungstenite::Message::Binary(data))) => {
                        self.handle_binary(room_id, data);
                    }
                    Some(Ok(tungstenite::Message::Close(frame))) => {
                        tracing::info!(room = self.short_id, "Server closed connection: {frame:?}");
                        return Err(Error::ConnectionClosed);
                    }
                    Some(Ok(_)) => {
                        // Text, ping and pong frames carry nothing for us
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => {
                        tracing::info!(room = self.short_id, "WebSocket stream ended");
                        return Err(Error::ConnectionClosed);
                    }
                },
            }
        }
    }

    fn handle_binary(&self, room_id: i64, data: Bytes) {
        match protocol::decode_bytes(data) {
            Ok(packets) => {
                for packet in &packets {
                    self.dispatcher.dispatch(room_id, packet);
                }
            }
            Err(e) => {
                tracing::warn!(room = self.short_id, "Skipping undecodable message: {e}");
            }
        }
    }
}

async fn heartbeat_loop(
    write: Arc<Mutex<WsWrite>>,
    period: Duration,
    cancel: CancellationToken,
) -> Result<(), Error> {
    let frame = Bytes::from(protocol::encode(&protocol::heartbeat_packet()));
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = ticker.tick() => {
                write
                    .lock()
                    .await
                    .send(tungstenite::Message::Binary(frame.clone()))
                    .await?;
                tracing::trace!("Heartbeat sent");
            }
        }
    }
}
