//! Outbound danmaku: splitting, per-room cooldown, and the `msg/send` call.

use std::sync::Arc;

use dashmap::DashMap;
use serde::de::IgnoredAny;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::api::{Envelope, with_common_headers};
use crate::types::{Credentials, DanmakuMode, Error, SenderConfig};

const COLOR_WHITE: &str = "16777215";
const FONT_SIZE: &str = "25";

/// Break `message` into chunks of at most `max_len` characters, in order.
///
/// Splits on `char` boundaries only. An empty message yields one empty chunk,
/// and a `max_len` of zero is treated as one.
pub fn split_message(message: &str, max_len: usize) -> Vec<String> {
    let max_len = max_len.max(1);
    let chars: Vec<char> = message.chars().collect();
    if chars.is_empty() {
        return vec![String::new()];
    }
    chars
        .chunks(max_len)
        .map(|chunk| chunk.iter().collect())
        .collect()
}

/// Sends chat messages to live rooms with a per-room cooldown.
///
/// Safe to share across tasks. Two concurrent sends to the same room are
/// serialized for their whole duration, so their chunks never interleave.
pub struct Sender {
    config: SenderConfig,
    credentials: Option<Credentials>,
    http: reqwest::Client,
    api_base: String,
    /// Room id → time of the last send attempt.
    last_sent: DashMap<i64, Arc<Mutex<Option<Instant>>>>,
}

impl Sender {
    pub fn new(
        config: SenderConfig,
        credentials: Option<Credentials>,
        http: reqwest::Client,
        api_base: impl Into<String>,
    ) -> Self {
        Self {
            config,
            credentials,
            http,
            api_base: api_base.into(),
            last_sent: DashMap::new(),
        }
    }

    /// Send `message` to `room_id`, splitting it as needed and waiting out the
    /// cooldown before every chunk. Stops at the first failing chunk.
    pub async fn send(
        &self,
        room_id: i64,
        message: &str,
        mode: DanmakuMode,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let creds = self
            .credentials
            .as_ref()
            .filter(|c| c.is_complete())
            .ok_or(Error::MissingCredentials)?;

        let slot = self.last_sent.entry(room_id).or_default().clone();
        let mut last_sent = cancel
            .run_until_cancelled(slot.lock())
            .await
            .ok_or(Error::Cancelled)?;

        let chunks = split_message(message, self.config.max_length);
        let total = chunks.len();
        for (i, chunk) in chunks.iter().enumerate() {
            if let Some(last) = *last_sent {
                let ready = last + self.config.cooldown;
                if ready > Instant::now() {
                    tracing::debug!(
                        room = room_id,
                        wait = ?(ready - Instant::now()),
                        "Waiting for send cooldown"
                    );
                    cancel
                        .run_until_cancelled(tokio::time::sleep_until(ready))
                        .await
                        .ok_or(Error::Cancelled)?;
                }
            }

            let result = cancel
                .run_until_cancelled(self.post(room_id, chunk, mode, creds))
                .await;
            // Recorded even on failure so a rejected chunk still counts
            // against the room's rate limit.
            *last_sent = Some(Instant::now());

            match result {
                None => return Err(Error::Cancelled),
                Some(Err(e)) => {
                    tracing::warn!(room = room_id, "Chunk {}/{total} failed: {e}", i + 1);
                    return Err(e);
                }
                Some(Ok(())) => {
                    tracing::debug!(room = room_id, "Sent chunk {}/{total}", i + 1);
                }
            }
        }
        Ok(())
    }

    async fn post(
        &self,
        room_id: i64,
        chunk: &str,
        mode: DanmakuMode,
        creds: &Credentials,
    ) -> Result<(), Error> {
        let rnd = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
            .to_string();
        let mode = mode.code().to_string();
        let room = room_id.to_string();
        let form = [
            ("bubble", "0"),
            ("msg", chunk),
            ("color", COLOR_WHITE),
            ("mode", mode.as_str()),
            ("fontsize", FONT_SIZE),
            ("rnd", rnd.as_str()),
            ("roomid", room.as_str()),
            ("csrf", creds.bili_jct.as_str()),
            ("csrf_token", creds.bili_jct.as_str()),
        ];

        let url = format!("{}/msg/send", self.api_base);
        let resp = with_common_headers(self.http.post(&url), Some(creds))
            .form(&form)
            .send()
            .await?
            .error_for_status()?
            .json::<Envelope<IgnoredAny>>()
            .await?;

        if resp.code != 0 {
            return Err(Error::Remote {
                code: resp.code,
                message: resp.into_message(),
            });
        }
        Ok(())
    }
}
