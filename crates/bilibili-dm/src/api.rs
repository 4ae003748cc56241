//! HTTP collaborators: room id resolution, danmaku endpoint lookup, WBI keys.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;

use crate::types::{ApiConfig, Credentials, Error};
use crate::wbi;

pub(crate) const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const ORIGIN: &str = "https://live.bilibili.com";
const REFERER: &str = "https://live.bilibili.com/";

/// Where to open the danmaku socket for a room, and the token to auth with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// May be empty; the server then only offers the zlib stream.
    pub token: String,
    pub host: String,
    pub port: u16,
}

impl ConnectionInfo {
    pub(crate) fn ws_url(&self, scheme: &str) -> String {
        format!("{scheme}://{}:{}/sub", self.host, self.port)
    }
}

/// Lookups the connection supervisor needs before it can open a socket.
#[async_trait]
pub trait RoomApi: Send + Sync {
    /// Resolve a (possibly short) room id to the canonical room id.
    async fn resolve_room(&self, short_id: i64) -> Result<i64, Error>;

    /// Fetch a fresh endpoint and auth token for a canonical room id.
    async fn connection_info(&self, room_id: i64) -> Result<ConnectionInfo, Error>;
}

// ---------------------------------------------------------------------------
// Response shapes
// ---------------------------------------------------------------------------

/// Common `{code, message, msg, data}` wrapper. Endpoints disagree on which
/// of `message`/`msg` they fill, and some send both.
#[derive(Debug, Deserialize)]
pub(crate) struct Envelope<T> {
    #[serde(default)]
    pub(crate) code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    msg: String,
    pub(crate) data: Option<T>,
}

impl<T> Envelope<T> {
    pub(crate) fn into_message(self) -> String {
        if self.message.is_empty() {
            self.msg
        } else {
            self.message
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RoomInit {
    room_id: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DanmuInfo {
    token: String,
    host_list: Vec<DanmuHost>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DanmuHost {
    host: String,
    wss_port: u16,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Nav {
    wbi_img: WbiImg,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WbiImg {
    img_url: String,
    sub_url: String,
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// Attach the browser-like headers every Bilibili endpoint expects.
pub(crate) fn with_common_headers(
    req: reqwest::RequestBuilder,
    credentials: Option<&Credentials>,
) -> reqwest::RequestBuilder {
    let req = req
        .header(reqwest::header::USER_AGENT, USER_AGENT)
        .header(reqwest::header::REFERER, REFERER)
        .header(reqwest::header::ORIGIN, ORIGIN);
    match credentials {
        Some(c) => req.header(reqwest::header::COOKIE, c.cookie_header()),
        None => req,
    }
}

/// [`RoomApi`] backed by the public live-room HTTP API.
pub struct HttpRoomApi {
    http: reqwest::Client,
    config: ApiConfig,
    credentials: Option<Credentials>,
    /// WBI mixin key, fetched on first use and dropped when a signed call fails.
    mixin_key: Mutex<Option<String>>,
}

impl HttpRoomApi {
    pub fn new(http: reqwest::Client, config: ApiConfig, credentials: Option<Credentials>) -> Self {
        Self {
            http,
            config,
            credentials,
            mixin_key: Mutex::new(None),
        }
    }

    async fn get<T: DeserializeOwned>(&self, url: &str) -> Result<Envelope<T>, Error> {
        let resp = with_common_headers(self.http.get(url), self.credentials.as_ref())
            .send()
            .await?
            .error_for_status()?
            .json::<Envelope<T>>()
            .await?;
        Ok(resp)
    }

    async fn mixin_key(&self) -> Result<String, Error> {
        let mut cached = self.mixin_key.lock().await;
        if let Some(key) = cached.as_ref() {
            return Ok(key.clone());
        }
        let url = format!("{}/x/web-interface/nav", self.config.nav_base);
        // nav answers -101 for anonymous callers but still publishes the keys.
        let nav = self.get::<Nav>(&url).await?.data.unwrap_or_default();
        let img = wbi::key_from_url(&nav.wbi_img.img_url);
        let sub = wbi::key_from_url(&nav.wbi_img.sub_url);
        if img.is_empty() || sub.is_empty() {
            return Err(Error::Api {
                endpoint: "nav",
                code: -1,
                message: "response carried no WBI keys".to_string(),
            });
        }
        let key = wbi::mixin_key(img, sub);
        tracing::debug!("Fetched WBI keys");
        *cached = Some(key.clone());
        Ok(key)
    }

    async fn danmu_info_url(&self, room_id: i64) -> Result<String, Error> {
        let base = format!(
            "{}/xlive/web-room/v1/index/getDanmuInfo",
            self.config.api_base
        );
        let params = BTreeMap::from([
            ("id".to_string(), room_id.to_string()),
            ("type".to_string(), "0".to_string()),
        ]);
        if !self.config.sign_requests {
            return Ok(format!("{base}?id={room_id}&type=0"));
        }
        let key = self.mixin_key().await?;
        let wts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        Ok(format!("{base}?{}", wbi::sign(&params, &key, wts)))
    }
}

#[async_trait]
impl RoomApi for HttpRoomApi {
    async fn resolve_room(&self, short_id: i64) -> Result<i64, Error> {
        let url = format!("{}/room/v1/Room/room_init?id={short_id}", self.config.api_base);
        let mut resp = self.get::<RoomInit>(&url).await?;
        match resp.data.take() {
            Some(init) if resp.code == 0 && init.room_id != 0 => Ok(init.room_id),
            _ => Err(Error::Api {
                endpoint: "room_init",
                code: resp.code,
                message: format!("room {short_id} may not exist: {}", resp.into_message()),
            }),
        }
    }

    async fn connection_info(&self, room_id: i64) -> Result<ConnectionInfo, Error> {
        let url = self.danmu_info_url(room_id).await?;
        let mut resp = self.get::<DanmuInfo>(&url).await?;
        if resp.code != 0 {
            if self.config.sign_requests {
                // Possibly rotated keys; refetch on the next attempt.
                *self.mixin_key.lock().await = None;
            }
            return Err(Error::Api {
                endpoint: "getDanmuInfo",
                code: resp.code,
                message: resp.into_message(),
            });
        }

        let info = resp.data.take().unwrap_or_default();
        let (host, port) = match info.host_list.into_iter().next() {
            Some(h) if !h.host.is_empty() => (h.host, h.wss_port),
            _ => (
                self.config.default_host.clone(),
                self.config.default_port,
            ),
        };
        Ok(ConnectionInfo {
            token: info.token,
            host,
            port,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_url_format() {
        let info = ConnectionInfo {
            token: String::new(),
            host: "broadcastlv.chat.bilibili.com".to_string(),
            port: 443,
        };
        assert_eq!(
            info.ws_url("wss"),
            "wss://broadcastlv.chat.bilibili.com:443/sub"
        );
    }

    #[test]
    fn envelope_falls_back_to_msg_and_tolerates_missing_data() {
        let env: Envelope<RoomInit> =
            serde_json::from_str(r#"{"code":60004,"msg":"直播间不存在"}"#).unwrap();
        assert_eq!(env.code, 60004);
        assert!(env.data.is_none());
        assert_eq!(env.into_message(), "直播间不存在");
    }

    #[test]
    fn envelope_prefers_message_when_both_present() {
        let env: Envelope<serde_json::Value> =
            serde_json::from_str(r#"{"code":10030,"message":"too fast","msg":"","data":[]}"#)
                .unwrap();
        assert_eq!(env.into_message(), "too fast");
    }

    #[test]
    fn danmu_info_tolerates_extra_fields() {
        let env: Envelope<DanmuInfo> = serde_json::from_str(
            r#"{"code":0,"data":{"token":"t","group":"live","host_list":[{"host":"a","port":2243,"wss_port":443,"ws_port":2244}]}}"#,
        )
        .unwrap();
        let data = env.data.unwrap();
        assert_eq!(data.token, "t");
        assert_eq!(data.host_list[0].host, "a");
        assert_eq!(data.host_list[0].wss_port, 443);
    }
}
