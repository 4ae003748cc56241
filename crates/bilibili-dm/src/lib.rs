//! Bilibili live-room danmaku client.
//!
//! Connects to one or more live rooms over the binary danmaku WebSocket
//! protocol, decodes the framed (and possibly zlib/brotli compressed) packet
//! stream, and fans events out to callbacks and bounded subscription queues.
//! Chat messages can be sent back through the rate-limited HTTP endpoint.
//!
//! # Features
//! - Per-room supervisors with exponential backoff and no retry cap
//! - Short room id resolution and WBI-signed endpoint lookup
//! - Typed events for chat, gifts, Super Chat, guard purchases, live state
//!   and viewer interactions; raw access to everything else
//! - Non-blocking fan-out: a slow subscriber drops events instead of stalling
//!   the connection
//! - Message splitting with a per-room cooldown for sending
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), bilibili_dm::Error> {
//! use bilibili_dm::{Client, ClientConfig, EventKind};
//! use tokio_util::sync::CancellationToken;
//!
//! let client = Client::new(ClientConfig::new([21452505]))?;
//! client.on_danmaku(|d| println!("{}: {}", d.sender, d.content));
//!
//! let mut sub = client.subscribe();
//! tokio::spawn(async move {
//!     while let Some(event) = sub.next().await {
//!         if let EventKind::Gift(g) = &event.kind {
//!             println!("[{}] {} x{} from {}", event.room_id, g.gift_name, g.num, g.user);
//!         }
//!     }
//! });
//!
//! let cancel = CancellationToken::new();
//! client.start(cancel).await?;
//! # Ok(())
//! # }
//! ```

mod api;
mod client;
mod command;
mod connection;
mod dispatch;
pub mod protocol;
mod sender;
mod types;
mod wbi;

pub use api::{ConnectionInfo, HttpRoomApi, RoomApi};
pub use client::Client;
pub use command::cmd;
pub use dispatch::{Dispatcher, Subscription};
pub use sender::{Sender, split_message};
pub use types::{
    ApiConfig, ClientConfig, Credentials, Danmaku, DanmakuMode, Error, Event, EventKind, Gift,
    GuardPurchase, HeartbeatData, InteractKind, InteractWord, LiveStateChange, RawCommand,
    SenderConfig, SuperChat, TimingConfig,
};
