//! Public types for the bilibili-dm crate.

use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio_tungstenite::tungstenite;

use crate::protocol::CodecError;

pub(crate) const DEFAULT_API_BASE: &str = "https://api.live.bilibili.com";
pub(crate) const DEFAULT_NAV_BASE: &str = "https://api.bilibili.com";
pub(crate) const DEFAULT_DANMAKU_HOST: &str = "broadcastlv.chat.bilibili.com";
pub(crate) const DEFAULT_DANMAKU_PORT: u16 = 443;
pub(crate) const DEFAULT_SUBSCRIPTION_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Event payloads
// ---------------------------------------------------------------------------

/// A chat message (`DANMU_MSG`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Danmaku {
    pub sender: String,
    pub uid: i64,
    pub content: String,
    /// Server send time; `None` when the metadata array carries no timestamp.
    pub timestamp: Option<DateTime<Utc>>,
    pub medal_name: String,
    pub medal_level: i64,
    pub emoticon_url: String,
}

/// A gift event (`SEND_GIFT`). Price is in the coin unit named by `coin_type`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Gift {
    pub user: String,
    pub uid: i64,
    pub gift_name: String,
    pub gift_id: i64,
    pub num: i64,
    pub price: i64,
    pub coin_type: String,
    pub action: String,
}

/// A paid Super Chat message (`SUPER_CHAT_MESSAGE`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SuperChat {
    pub user: String,
    pub uid: i64,
    pub message: String,
    /// Price in CNY.
    pub price: i64,
    /// Pinned display time in seconds.
    pub duration: i64,
}

/// A guard (captain/admiral/governor) purchase (`GUARD_BUY`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuardPurchase {
    pub user: String,
    pub uid: i64,
    /// 1 = governor, 2 = admiral, 3 = captain.
    pub guard_level: i64,
    pub price: i64,
    pub num: i64,
}

/// A room going live (`LIVE`) or offline (`PREPARING`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveStateChange {
    pub room_id: i64,
    pub live: bool,
}

/// A viewer interaction (`INTERACT_WORD`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InteractWord {
    pub user: String,
    pub uid: i64,
    /// Raw interaction code as sent by the server; see [`InteractWord::kind`].
    pub msg_type: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteractKind {
    Entry,
    Follow,
    Share,
    Other(i64),
}

impl InteractWord {
    pub fn kind(&self) -> InteractKind {
        match self.msg_type {
            1 => InteractKind::Entry,
            2 => InteractKind::Follow,
            3 => InteractKind::Share,
            other => InteractKind::Other(other),
        }
    }
}

/// Popularity counter carried by heartbeat replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatData {
    pub popularity: u32,
}

/// A command the dispatcher has no typed mapping for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCommand {
    /// The `cmd` field, or empty when the body was not JSON.
    pub cmd: String,
    pub body: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Danmaku(Danmaku),
    Gift(Gift),
    SuperChat(SuperChat),
    GuardPurchase(GuardPurchase),
    LiveStateChange(LiveStateChange),
    InteractWord(InteractWord),
    Heartbeat(HeartbeatData),
    Unrecognized(RawCommand),
}

/// Envelope delivered to [`Subscription`](crate::Subscription)s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Resolved (canonical) room id.
    pub room_id: i64,
    pub kind: EventKind,
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// `SESSDATA` / `bili_jct` cookie pair. `bili_jct` doubles as the CSRF token.
#[derive(Clone, Default)]
pub struct Credentials {
    pub sessdata: String,
    pub bili_jct: String,
}

impl Credentials {
    pub fn new(sessdata: impl Into<String>, bili_jct: impl Into<String>) -> Self {
        Self {
            sessdata: sessdata.into(),
            bili_jct: bili_jct.into(),
        }
    }

    pub(crate) fn is_complete(&self) -> bool {
        !self.sessdata.is_empty() && !self.bili_jct.is_empty()
    }

    pub(crate) fn cookie_header(&self) -> String {
        format!("SESSDATA={}; bili_jct={}", self.sessdata, self.bili_jct)
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("sessdata", &"<redacted>")
            .field("bili_jct", &"<redacted>")
            .finish()
    }
}

/// Connection timing knobs. Defaults match the live web client.
#[derive(Debug, Clone)]
pub struct TimingConfig {
    pub heartbeat_interval: Duration,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub handshake_timeout: Duration,
    /// Timeout applied to every HTTP request.
    pub http_timeout: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(120),
            handshake_timeout: Duration::from_secs(10),
            http_timeout: Duration::from_secs(15),
        }
    }
}

/// Where the HTTP collaborators and the danmaku socket live.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Base URL for `room_init`, `getDanmuInfo` and `msg/send`.
    pub api_base: String,
    /// Base URL for the `nav` endpoint that publishes WBI keys.
    pub nav_base: String,
    /// Used when `getDanmuInfo` returns no host list.
    pub default_host: String,
    pub default_port: u16,
    /// `wss` in production.
    pub ws_scheme: String,
    /// WBI-sign the `getDanmuInfo` query.
    pub sign_requests: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            nav_base: DEFAULT_NAV_BASE.to_string(),
            default_host: DEFAULT_DANMAKU_HOST.to_string(),
            default_port: DEFAULT_DANMAKU_PORT,
            ws_scheme: "wss".to_string(),
            sign_requests: true,
        }
    }
}

/// Outbound message settings.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Maximum characters per message; longer input is split.
    /// 20 by default; UL20+ accounts may use 30.
    pub max_length: usize,
    /// Minimum interval between two sends to the same room.
    pub cooldown: Duration,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            max_length: 20,
            cooldown: Duration::from_secs(5),
        }
    }
}

/// Configuration for [`Client`](crate::Client).
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Rooms to join on [`start`](crate::Client::start). Short ids are resolved.
    pub rooms: Vec<i64>,
    /// Optional login cookies. Authenticated sockets get richer payloads, and
    /// sending requires them.
    pub credentials: Option<Credentials>,
    pub timing: TimingConfig,
    pub api: ApiConfig,
    pub sender: SenderConfig,
    /// Subscription queue size. Defaults to 256 when zero.
    pub subscription_capacity: usize,
    /// Shared HTTP client; one is built from `timing.http_timeout` if absent.
    pub http: Option<reqwest::Client>,
}

impl ClientConfig {
    pub fn new(rooms: impl IntoIterator<Item = i64>) -> Self {
        Self {
            rooms: rooms.into_iter().collect(),
            ..Default::default()
        }
    }
}

/// Display position of an outbound message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DanmakuMode {
    #[default]
    Scroll,
    Bottom,
    Top,
}

impl DanmakuMode {
    pub fn code(self) -> u8 {
        match self {
            DanmakuMode::Scroll => 1,
            DanmakuMode::Bottom => 4,
            DanmakuMode::Top => 5,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("WebSocket error: {0}")]
    WebSocket(Box<tungstenite::Error>),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Packet decode error: {0}")]
    Codec(#[from] CodecError),

    #[error("{endpoint} returned code {code}: {message}")]
    Api {
        endpoint: &'static str,
        code: i64,
        message: String,
    },

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("Connection closed by server")]
    ConnectionClosed,

    #[error("Heartbeat task stopped")]
    HeartbeatStopped,

    #[error("Credentials required: set SESSDATA and bili_jct before sending")]
    MissingCredentials,

    #[error("Send rejected: code={code}, {message}")]
    Remote { code: i64, message: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("No rooms configured")]
    NoRooms,

    #[error("Room {0} already added")]
    RoomExists(i64),

    #[error("Client already started")]
    AlreadyStarted,
}

impl From<tungstenite::Error> for Error {
    fn from(e: tungstenite::Error) -> Self {
        Error::WebSocket(Box::new(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interact_kind_passes_unknown_codes_through() {
        let word = |msg_type| InteractWord {
            msg_type,
            ..Default::default()
        };
        assert_eq!(word(1).kind(), InteractKind::Entry);
        assert_eq!(word(2).kind(), InteractKind::Follow);
        assert_eq!(word(3).kind(), InteractKind::Share);
        assert_eq!(word(6).kind(), InteractKind::Other(6));
    }

    #[test]
    fn danmaku_mode_codes() {
        assert_eq!(DanmakuMode::default().code(), 1);
        assert_eq!(DanmakuMode::Bottom.code(), 4);
        assert_eq!(DanmakuMode::Top.code(), 5);
    }

    #[test]
    fn credentials_debug_is_redacted() {
        let creds = Credentials::new("secret-sess", "secret-jct");
        let shown = format!("{creds:?}");
        assert!(!shown.contains("secret"));
        assert_eq!(
            creds.cookie_header(),
            "SESSDATA=secret-sess; bili_jct=secret-jct"
        );
    }

    #[test]
    fn credentials_require_both_cookies() {
        assert!(Credentials::new("a", "b").is_complete());
        assert!(!Credentials::new("a", "").is_complete());
        assert!(!Credentials::default().is_complete());
    }

    #[test]
    fn client_config_new_keeps_defaults() {
        let config = ClientConfig::new([510, 21452505]);
        assert_eq!(config.rooms, vec![510, 21452505]);
        assert_eq!(config.timing.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.timing.max_backoff, Duration::from_secs(120));
        assert_eq!(config.sender.max_length, 20);
        assert_eq!(config.api.default_port, 443);
        assert!(config.credentials.is_none());
    }
}
