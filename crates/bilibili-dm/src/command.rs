//! Command JSON → typed payload projection.
//!
//! Each field is read independently from a `serde_json::Value`; anything
//! missing or of the wrong type falls back to its zero value instead of
//! failing the whole command.

use chrono::DateTime;
use serde_json::Value;

use crate::types::{
    Danmaku, EventKind, Gift, GuardPurchase, InteractWord, LiveStateChange, SuperChat,
};

pub mod cmd {
    pub const DANMU_MSG: &str = "DANMU_MSG";
    pub const SEND_GIFT: &str = "SEND_GIFT";
    pub const SUPER_CHAT_MESSAGE: &str = "SUPER_CHAT_MESSAGE";
    pub const GUARD_BUY: &str = "GUARD_BUY";
    pub const LIVE: &str = "LIVE";
    pub const PREPARING: &str = "PREPARING";
    pub const INTERACT_WORD: &str = "INTERACT_WORD";
}

/// Pull the `cmd` field out of a command body. Empty when the body is not a
/// JSON object or has no string `cmd`.
pub(crate) fn command_name(doc: Option<&Value>) -> String {
    doc.and_then(|d| d.get("cmd"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Map a parsed command document to a typed event, or `None` when the command
/// is not one we model.
///
/// The server decorates some names with protocol suffixes
/// (`DANMU_MSG:4:0:2:2:2:0`), so only the part before the first `:` is matched.
pub(crate) fn parse_command(room_id: i64, name: &str, doc: &Value) -> Option<EventKind> {
    let base = name.split(':').next().unwrap_or_default();
    match base {
        cmd::DANMU_MSG => parse_danmaku(doc.get("info")?).map(EventKind::Danmaku),
        cmd::SEND_GIFT => data_object(doc).map(|d| EventKind::Gift(parse_gift(d))),
        cmd::SUPER_CHAT_MESSAGE => {
            data_object(doc).map(|d| EventKind::SuperChat(parse_super_chat(d)))
        }
        cmd::GUARD_BUY => data_object(doc).map(|d| EventKind::GuardPurchase(parse_guard(d))),
        cmd::LIVE => Some(EventKind::LiveStateChange(LiveStateChange {
            room_id,
            live: true,
        })),
        cmd::PREPARING => Some(EventKind::LiveStateChange(LiveStateChange {
            room_id,
            live: false,
        })),
        cmd::INTERACT_WORD => {
            data_object(doc).map(|d| EventKind::InteractWord(parse_interact(d)))
        }
        _ => None,
    }
}

fn data_object(doc: &Value) -> Option<&Value> {
    doc.get("data").filter(|d| d.is_object())
}

// ---------------------------------------------------------------------------
// Field projections
// ---------------------------------------------------------------------------

fn int(v: Option<&Value>) -> i64 {
    match v {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or_default(),
        // Some payloads quote large ids.
        Some(Value::String(s)) => s.parse().unwrap_or_default(),
        _ => 0,
    }
}

fn text(v: Option<&Value>) -> String {
    v.and_then(Value::as_str).unwrap_or_default().to_string()
}

// ---------------------------------------------------------------------------
// Per-command parsers
// ---------------------------------------------------------------------------

/// `info` is positional:
/// `[meta, text, [uid, name, ..], [medal_level, medal_name, ..], ..]`
/// with `meta[4]` the send time in ms and `meta[13]` an optional emoticon object.
fn parse_danmaku(info: &Value) -> Option<Danmaku> {
    let info = info.as_array().filter(|a| a.len() >= 3)?;
    let meta = info.first();
    let user = info.get(2);
    let medal = info.get(3).and_then(Value::as_array).filter(|m| m.len() >= 2);

    let ts = int(meta.and_then(|m| m.get(4)));
    Some(Danmaku {
        sender: text(user.and_then(|u| u.get(1))),
        uid: int(user.and_then(|u| u.get(0))),
        content: text(info.get(1)),
        timestamp: if ts > 0 {
            DateTime::from_timestamp_millis(ts)
        } else {
            None
        },
        medal_name: text(medal.and_then(|m| m.get(1))),
        medal_level: int(medal.and_then(|m| m.first())),
        emoticon_url: text(meta.and_then(|m| m.get(13)).and_then(|e| e.get("url"))),
    })
}

fn parse_gift(data: &Value) -> Gift {
    Gift {
        user: text(data.get("uname")),
        uid: int(data.get("uid")),
        gift_name: text(data.get("giftName")),
        gift_id: int(data.get("giftId")),
        num: int(data.get("num")),
        price: int(data.get("price")),
        coin_type: text(data.get("coin_type")),
        action: text(data.get("action")),
    }
}

fn parse_super_chat(data: &Value) -> SuperChat {
    SuperChat {
        user: text(data.get("user_info").and_then(|u| u.get("uname"))),
        uid: int(data.get("uid")),
        message: text(data.get("message")),
        price: int(data.get("price")),
        duration: int(data.get("time")),
    }
}

fn parse_guard(data: &Value) -> GuardPurchase {
    GuardPurchase {
        user: text(data.get("username")),
        uid: int(data.get("uid")),
        guard_level: int(data.get("guard_level")),
        price: int(data.get("price")),
        num: int(data.get("num")),
    }
}

fn parse_interact(data: &Value) -> InteractWord {
    InteractWord {
        user: text(data.get("uname")),
        uid: int(data.get("uid")),
        msg_type: int(data.get("msg_type")),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn parse(doc: Value) -> Option<EventKind> {
        let name = command_name(Some(&doc));
        parse_command(1, &name, &doc)
    }

    #[test]
    fn danmaku_scenario() {
        let doc = json!({
            "cmd": "DANMU_MSG",
            "info": [[0, 1, 25, 16777215, 1700000000000u64], "hello world", [123, "alice"], []]
        });
        let Some(EventKind::Danmaku(d)) = parse(doc) else {
            panic!("expected danmaku");
        };
        assert_eq!(d.sender, "alice");
        assert_eq!(d.uid, 123);
        assert_eq!(d.content, "hello world");
        assert_eq!(
            d.timestamp.map(|t| t.to_rfc3339()),
            Some("2023-11-14T22:13:20+00:00".to_string())
        );
        assert_eq!(d.medal_name, "");
        assert_eq!(d.emoticon_url, "");
    }

    #[test]
    fn danmaku_with_medal_and_emoticon() {
        let mut meta = vec![json!(0); 14];
        meta[4] = json!(1700000000123u64);
        meta[13] = json!({"url": "https://i0.hdslb.com/emote.png", "width": 20});
        let doc = json!({
            "cmd": "DANMU_MSG:4:0:2:2:2:0",
            "info": [meta, "[dog]", [7, "bob", 0], [21, "Fans", "anchor", 510]]
        });
        let Some(EventKind::Danmaku(d)) = parse(doc) else {
            panic!("expected danmaku");
        };
        assert_eq!(d.medal_level, 21);
        assert_eq!(d.medal_name, "Fans");
        assert_eq!(d.emoticon_url, "https://i0.hdslb.com/emote.png");
        assert_eq!(d.timestamp.map(|t| t.timestamp_millis()), Some(1700000000123));
    }

    #[test]
    fn danmaku_tolerates_short_arrays() {
        let doc = json!({"cmd": "DANMU_MSG", "info": [[], "hi", []]});
        let Some(EventKind::Danmaku(d)) = parse(doc) else {
            panic!("expected danmaku");
        };
        assert_eq!(d.content, "hi");
        assert_eq!(d.uid, 0);
        assert!(d.timestamp.is_none());
    }

    #[test]
    fn danmaku_with_too_few_positions_is_unrecognized() {
        assert!(parse(json!({"cmd": "DANMU_MSG", "info": [[], "hi"]})).is_none());
        assert!(parse(json!({"cmd": "DANMU_MSG"})).is_none());
    }

    #[test]
    fn gift_fields() {
        let doc = json!({"cmd": "SEND_GIFT", "data": {
            "uid": 42, "uname": "carol", "giftName": "辣条", "giftId": 1,
            "num": 3, "price": 100, "coin_type": "silver", "action": "投喂",
            "unexpected": {"nested": true}
        }});
        let Some(EventKind::Gift(g)) = parse(doc) else {
            panic!("expected gift");
        };
        assert_eq!(
            g,
            Gift {
                user: "carol".into(),
                uid: 42,
                gift_name: "辣条".into(),
                gift_id: 1,
                num: 3,
                price: 100,
                coin_type: "silver".into(),
                action: "投喂".into(),
            }
        );
    }

    #[test]
    fn gift_missing_fields_default() {
        let Some(EventKind::Gift(g)) = parse(json!({"cmd": "SEND_GIFT", "data": {"uid": "99"}}))
        else {
            panic!("expected gift");
        };
        assert_eq!(g.uid, 99);
        assert_eq!(g.num, 0);
        assert_eq!(g.gift_name, "");
    }

    #[test]
    fn super_chat_and_guard() {
        let sc = parse(json!({"cmd": "SUPER_CHAT_MESSAGE", "data": {
            "uid": 5, "user_info": {"uname": "dave"}, "message": "gg", "price": 30, "time": 60
        }}));
        assert_eq!(
            sc,
            Some(EventKind::SuperChat(SuperChat {
                user: "dave".into(),
                uid: 5,
                message: "gg".into(),
                price: 30,
                duration: 60,
            }))
        );

        let guard = parse(json!({"cmd": "GUARD_BUY", "data": {
            "uid": 6, "username": "erin", "guard_level": 3, "price": 198000, "num": 1
        }}));
        assert_eq!(
            guard,
            Some(EventKind::GuardPurchase(GuardPurchase {
                user: "erin".into(),
                uid: 6,
                guard_level: 3,
                price: 198000,
                num: 1,
            }))
        );
    }

    #[test]
    fn live_state_comes_from_command_name() {
        assert_eq!(
            parse(json!({"cmd": "LIVE", "live_key": "x"})),
            Some(EventKind::LiveStateChange(LiveStateChange {
                room_id: 1,
                live: true
            }))
        );
        assert_eq!(
            parse(json!({"cmd": "PREPARING"})),
            Some(EventKind::LiveStateChange(LiveStateChange {
                room_id: 1,
                live: false
            }))
        );
    }

    #[test]
    fn interact_word_keeps_unknown_code() {
        let Some(EventKind::InteractWord(w)) = parse(json!({"cmd": "INTERACT_WORD", "data": {
            "uid": 8, "uname": "frank", "msg_type": 5
        }})) else {
            panic!("expected interact word");
        };
        assert_eq!(w.msg_type, 5);
        assert_eq!(w.user, "frank");
    }

    #[test]
    fn keyed_command_without_object_data_is_unrecognized() {
        assert!(parse(json!({"cmd": "SEND_GIFT", "data": [1, 2]})).is_none());
        assert!(parse(json!({"cmd": "INTERACT_WORD"})).is_none());
    }

    #[test]
    fn unknown_command_is_none() {
        assert!(parse(json!({"cmd": "FOO_BAR", "data": {}})).is_none());
    }

    #[test]
    fn command_name_best_effort() {
        assert_eq!(command_name(Some(&json!({"cmd": "X"}))), "X");
        assert_eq!(command_name(Some(&json!({"cmd": 5}))), "");
        assert_eq!(command_name(Some(&json!([1, 2]))), "");
        assert_eq!(command_name(None), "");
    }
}
