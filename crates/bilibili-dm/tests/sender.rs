use std::time::{Duration, Instant};

use bilibili_dm::{Credentials, DanmakuMode, Error, Sender, SenderConfig};
use httpmock::prelude::*;
use serde_json::json;
use tokio_util::sync::CancellationToken;

const COOLDOWN: Duration = Duration::from_millis(200);

fn sender(server: &MockServer, cooldown: Duration) -> Sender {
    let config = SenderConfig {
        max_length: 20,
        cooldown,
    };
    Sender::new(
        config,
        Some(Credentials::new("sess", "csrf-token")),
        reqwest::Client::new(),
        server.base_url(),
    )
}

async fn mock_ok(server: &MockServer) -> httpmock::Mock<'_> {
    server
        .mock_async(|when, then| {
            when.method(POST).path("/msg/send");
            then.status(200)
                .json_body(json!({"code": 0, "data": {}, "message": "", "msg": ""}));
        })
        .await
}

#[tokio::test]
async fn long_message_is_split_and_spaced() {
    let server = MockServer::start_async().await;
    let message: String = ('a'..='z').cycle().take(45).collect();
    let chars: Vec<char> = message.chars().collect();
    let chunks: Vec<String> = chars.chunks(20).map(|c| c.iter().collect()).collect();

    let mut mocks = Vec::new();
    for chunk in &chunks {
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/msg/send")
                    .header("cookie", "SESSDATA=sess; bili_jct=csrf-token")
                    .header("origin", "https://live.bilibili.com")
                    .x_www_form_urlencoded_tuple("msg", chunk)
                    .x_www_form_urlencoded_tuple("roomid", "510")
                    .x_www_form_urlencoded_tuple("mode", "4")
                    .x_www_form_urlencoded_tuple("color", "16777215")
                    .x_www_form_urlencoded_tuple("fontsize", "25")
                    .x_www_form_urlencoded_tuple("bubble", "0")
                    .x_www_form_urlencoded_tuple("csrf", "csrf-token")
                    .x_www_form_urlencoded_tuple("csrf_token", "csrf-token")
                    .x_www_form_urlencoded_key_exists("rnd");
                then.status(200).json_body(json!({"code": 0, "message": ""}));
            })
            .await;
        mocks.push(mock);
    }

    let started = Instant::now();
    sender(&server, COOLDOWN)
        .send(510, &message, DanmakuMode::Bottom, &CancellationToken::new())
        .await
        .unwrap();

    // Two cooldown waits between three chunks.
    assert!(started.elapsed() >= COOLDOWN * 2);
    assert_eq!(chunks.iter().map(String::len).collect::<Vec<_>>(), [20, 20, 5]);
    for mock in &mocks {
        mock.assert_async().await;
    }
}

#[tokio::test]
async fn remote_rejection_stops_remaining_chunks() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/msg/send");
            then.status(200)
                .json_body(json!({"code": 10030, "message": "", "msg": "您发送弹幕的频率过快"}));
        })
        .await;

    let message = "x".repeat(30);
    let result = sender(&server, COOLDOWN)
        .send(1, &message, DanmakuMode::Scroll, &CancellationToken::new())
        .await;
    match result {
        Err(Error::Remote { code, message }) => {
            assert_eq!(code, 10030);
            assert_eq!(message, "您发送弹幕的频率过快");
        }
        other => panic!("expected Remote error, got {other:?}"),
    }
    assert_eq!(mock.hits_async().await, 1);
}

#[tokio::test]
async fn failed_send_still_counts_toward_cooldown() {
    let server = MockServer::start_async().await;
    let reject = server
        .mock_async(|when, then| {
            when.method(POST).path("/msg/send");
            then.status(200).json_body(json!({"code": -111, "message": "csrf"}));
        })
        .await;

    let sender = sender(&server, COOLDOWN);
    let cancel = CancellationToken::new();
    assert!(sender.send(1, "a", DanmakuMode::Scroll, &cancel).await.is_err());
    reject.delete_async().await;
    mock_ok(&server).await;

    let started = Instant::now();
    sender.send(1, "b", DanmakuMode::Scroll, &cancel).await.unwrap();
    assert!(started.elapsed() >= COOLDOWN / 2);
}

#[tokio::test]
async fn rooms_do_not_share_cooldown() {
    let server = MockServer::start_async().await;
    let mock = mock_ok(&server).await;
    let sender = sender(&server, Duration::from_secs(2));
    let cancel = CancellationToken::new();

    sender.send(1, "first", DanmakuMode::Scroll, &cancel).await.unwrap();

    let started = Instant::now();
    sender.send(2, "other room", DanmakuMode::Scroll, &cancel).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(mock.hits_async().await, 2);
}

#[tokio::test]
async fn cancel_during_cooldown() {
    let server = MockServer::start_async().await;
    let mock = mock_ok(&server).await;
    let sender = sender(&server, Duration::from_secs(10));

    sender
        .send(1, "first", DanmakuMode::Scroll, &CancellationToken::new())
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let result = sender.send(1, "second", DanmakuMode::Scroll, &cancel).await;
    assert!(matches!(result, Err(Error::Cancelled)), "got {result:?}");
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(mock.hits_async().await, 1);
}

#[tokio::test]
async fn same_room_callers_are_serialized() {
    let server = MockServer::start_async().await;
    let mock = mock_ok(&server).await;
    let sender = sender(&server, COOLDOWN);
    let cancel = CancellationToken::new();

    let started = Instant::now();
    let (a, b) = tokio::join!(
        sender.send(1, "from a", DanmakuMode::Scroll, &cancel),
        sender.send(1, "from b", DanmakuMode::Scroll, &cancel),
    );
    a.unwrap();
    b.unwrap();
    // The second caller waits out the first caller's cooldown.
    assert!(started.elapsed() >= COOLDOWN);
    assert_eq!(mock.hits_async().await, 2);
}
