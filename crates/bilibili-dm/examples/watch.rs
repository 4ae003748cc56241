//! Print the live chat of a room.
//!
//! ```sh
//! cargo run -p bilibili-dm --example watch -- --room 510
//! ```
//!
//! Pass cookies to get full user names and to send a message once connected:
//! ```sh
//! SESSDATA=... BILI_JCT=... cargo run -p bilibili-dm --example watch \
//!     -- --room 510 --send "hello"
//! ```
//!
//! Set `RUST_LOG=bilibili_dm=debug` for connection details.

use std::time::Duration;

use bilibili_dm::{Client, ClientConfig, Credentials, DanmakuMode, InteractKind};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

#[derive(Parser)]
struct Args {
    /// Live room id (short ids are resolved).
    #[arg(long, default_value_t = 510)]
    room: i64,

    /// SESSDATA cookie.
    #[arg(long, env = "SESSDATA")]
    sessdata: Option<String>,

    /// bili_jct cookie.
    #[arg(long, env = "BILI_JCT")]
    bili_jct: Option<String>,

    /// Send this message a few seconds after connecting.
    #[arg(long)]
    send: Option<String>,

    /// Characters per message (30 for UL20+ accounts).
    #[arg(long, default_value_t = 20)]
    max_length: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();
    let args = Args::parse();

    let mut config = ClientConfig::new([args.room]);
    config.sender.max_length = args.max_length;
    if let (Some(sessdata), Some(bili_jct)) = (args.sessdata, args.bili_jct) {
        config.credentials = Some(Credentials::new(sessdata, bili_jct));
    }
    let client = Client::new(config)?;

    client.on_danmaku(|d| {
        let medal = if d.medal_name.is_empty() {
            String::new()
        } else {
            format!("[{} {}] ", d.medal_name, d.medal_level)
        };
        println!("[弹幕] {medal}{}: {}", d.sender, d.content);
    });
    client.on_gift(|g| println!("[礼物] {} {} {} x{}", g.user, g.action, g.gift_name, g.num));
    client.on_super_chat(|sc| println!("[SC ¥{}] {}: {}", sc.price, sc.user, sc.message));
    client.on_guard_purchase(|gb| {
        let level = match gb.guard_level {
            1 => "总督",
            2 => "提督",
            3 => "舰长",
            _ => "大航海",
        };
        println!("[上舰] {} 开通了 {level}", gb.user);
    });
    client.on_live(|le| println!("[开播] 房间 {} 开始直播", le.room_id));
    client.on_preparing(|le| println!("[下播] 房间 {} 停止直播", le.room_id));
    client.on_interact_word(|iw| {
        let action = match iw.kind() {
            InteractKind::Entry => "进入".to_string(),
            InteractKind::Follow => "关注".to_string(),
            InteractKind::Share => "分享".to_string(),
            InteractKind::Other(code) => format!("互动({code})"),
        };
        println!("[互动] {} {action}了直播间", iw.user);
    });
    client.on_heartbeat(|hb| tracing::debug!(popularity = hb.popularity, "Heartbeat"));

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            cancel.cancel();
        }
    });

    if let Some(message) = args.send {
        let client = client.clone();
        let cancel = cancel.clone();
        let room = args.room;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            match client
                .send_message(room, &message, DanmakuMode::Scroll, &cancel)
                .await
            {
                Ok(()) => tracing::info!("Message sent"),
                Err(e) => tracing::error!("Send failed: {e}"),
            }
        });
    }

    client.start(cancel).await?;
    tracing::info!("Stopped");
    Ok(())
}
