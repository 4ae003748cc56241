//! The hub: owns the room table, the shared dispatcher and the sender.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::api::{HttpRoomApi, RoomApi};
use crate::connection::RoomConnection;
use crate::dispatch::{Dispatcher, Subscription};
use crate::sender::Sender;
use crate::types::{
    ClientConfig, DEFAULT_SUBSCRIPTION_CAPACITY, Danmaku, DanmakuMode, Error, Gift, GuardPurchase,
    HeartbeatData, InteractWord, LiveStateChange, SuperChat,
};

/// Multi-room danmaku client.
///
/// Cheap to clone; clones share rooms, handlers and subscriptions. Register
/// handlers and call [`subscribe`](Client::subscribe) before
/// [`start`](Client::start) so no early events are missed.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

struct Inner {
    config: ClientConfig,
    http: reqwest::Client,
    api: Arc<dyn RoomApi>,
    dispatcher: Arc<Dispatcher>,
    rooms: Mutex<RoomTable>,
    sender: OnceLock<Sender>,
}

#[derive(Default)]
struct RoomTable {
    /// Set once by `start`; never cleared.
    running: Option<Running>,
    /// Rooms added before `start`.
    pending: Vec<i64>,
    active: HashMap<i64, ActiveRoom>,
    next_generation: u64,
}

struct Running {
    cancel: CancellationToken,
    tracker: TaskTracker,
    /// Lets `add_room` spawn from threads outside the runtime.
    runtime: tokio::runtime::Handle,
}

struct ActiveRoom {
    /// Distinguishes a re-added room from the task it replaced.
    generation: u64,
    cancel: CancellationToken,
}

impl Client {
    /// Build a client talking to the live HTTP API.
    pub fn new(config: ClientConfig) -> Result<Self, Error> {
        let http = build_http(&config)?;
        let api = Arc::new(HttpRoomApi::new(
            http.clone(),
            config.api.clone(),
            config.credentials.clone(),
        ));
        Ok(Self::build(config, http, api))
    }

    /// Build a client with a custom room lookup backend.
    pub fn with_api(config: ClientConfig, api: Arc<dyn RoomApi>) -> Result<Self, Error> {
        let http = build_http(&config)?;
        Ok(Self::build(config, http, api))
    }

    fn build(config: ClientConfig, http: reqwest::Client, api: Arc<dyn RoomApi>) -> Self {
        let capacity = match config.subscription_capacity {
            0 => DEFAULT_SUBSCRIPTION_CAPACITY,
            n => n,
        };
        let mut pending: Vec<i64> = Vec::with_capacity(config.rooms.len());
        for &room in &config.rooms {
            if !pending.contains(&room) {
                pending.push(room);
            }
        }
        Self {
            inner: Arc::new(Inner {
                config,
                http,
                api,
                dispatcher: Arc::new(Dispatcher::new(capacity)),
                rooms: Mutex::new(RoomTable {
                    pending,
                    ..Default::default()
                }),
                sender: OnceLock::new(),
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Handler registration
    // -----------------------------------------------------------------------

    pub fn on_danmaku(&self, f: impl Fn(&Danmaku) + Send + Sync + 'static) {
        self.inner.dispatcher.on_danmaku(f);
    }

    pub fn on_gift(&self, f: impl Fn(&Gift) + Send + Sync + 'static) {
        self.inner.dispatcher.on_gift(f);
    }

    pub fn on_super_chat(&self, f: impl Fn(&SuperChat) + Send + Sync + 'static) {
        self.inner.dispatcher.on_super_chat(f);
    }

    pub fn on_guard_purchase(&self, f: impl Fn(&GuardPurchase) + Send + Sync + 'static) {
        self.inner.dispatcher.on_guard_purchase(f);
    }

    pub fn on_live(&self, f: impl Fn(&LiveStateChange) + Send + Sync + 'static) {
        self.inner.dispatcher.on_live(f);
    }

    pub fn on_preparing(&self, f: impl Fn(&LiveStateChange) + Send + Sync + 'static) {
        self.inner.dispatcher.on_preparing(f);
    }

    pub fn on_interact_word(&self, f: impl Fn(&InteractWord) + Send + Sync + 'static) {
        self.inner.dispatcher.on_interact_word(f);
    }

    pub fn on_heartbeat(&self, f: impl Fn(&HeartbeatData) + Send + Sync + 'static) {
        self.inner.dispatcher.on_heartbeat(f);
    }

    pub fn on_raw(&self, f: impl Fn(&str, &[u8]) + Send + Sync + 'static) {
        self.inner.dispatcher.on_raw(f);
    }

    pub fn subscribe(&self) -> Subscription {
        self.inner.dispatcher.subscribe()
    }

    /// Events dropped so far because a subscriber was not keeping up.
    pub fn dropped_events(&self) -> u64 {
        self.inner.dispatcher.dropped_events()
    }

    // -----------------------------------------------------------------------
    // Room management
    // -----------------------------------------------------------------------

    /// Join another room. Before `start` the room is queued; afterwards it is
    /// connected immediately.
    pub fn add_room(&self, room: i64) -> Result<(), Error> {
        let mut table = self.inner.rooms.lock();
        if table.pending.contains(&room) || table.active.contains_key(&room) {
            return Err(Error::RoomExists(room));
        }
        if table.running.is_some() {
            spawn_room(&self.inner, &mut table, room);
        } else {
            table.pending.push(room);
        }
        Ok(())
    }

    /// Leave a room. Returns `false` if the room was not known.
    pub fn remove_room(&self, room: i64) -> bool {
        let mut table = self.inner.rooms.lock();
        if let Some(pos) = table.pending.iter().position(|&r| r == room) {
            table.pending.remove(pos);
            return true;
        }
        match table.active.remove(&room) {
            Some(entry) => {
                entry.cancel.cancel();
                tracing::info!(room, "Room removed");
                true
            }
            None => false,
        }
    }

    /// Connect every configured room and run until `cancel` fires.
    ///
    /// Waits for all room tasks to finish, then closes every subscription.
    pub async fn start(&self, cancel: CancellationToken) -> Result<(), Error> {
        let tracker = TaskTracker::new();
        {
            let mut table = self.inner.rooms.lock();
            if table.running.is_some() {
                return Err(Error::AlreadyStarted);
            }
            if table.pending.is_empty() {
                return Err(Error::NoRooms);
            }
            table.running = Some(Running {
                cancel: cancel.clone(),
                tracker: tracker.clone(),
                runtime: tokio::runtime::Handle::current(),
            });
            let rooms = std::mem::take(&mut table.pending);
            tracing::info!(rooms = rooms.len(), "Client started");
            for room in rooms {
                spawn_room(&self.inner, &mut table, room);
            }
        }

        cancel.cancelled().await;
        tracker.close();
        tracker.wait().await;
        self.inner.dispatcher.close_subscriptions();
        tracing::info!("Client stopped");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    /// Send a chat message to `room`. Requires credentials.
    pub async fn send_message(
        &self,
        room: i64,
        message: &str,
        mode: DanmakuMode,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let inner = &self.inner;
        let sender = inner.sender.get_or_init(|| {
            Sender::new(
                inner.config.sender.clone(),
                inner.config.credentials.clone(),
                inner.http.clone(),
                inner.config.api.api_base.clone(),
            )
        });
        sender.send(room, message, mode, cancel).await
    }
}

fn build_http(config: &ClientConfig) -> Result<reqwest::Client, Error> {
    match &config.http {
        Some(http) => Ok(http.clone()),
        None => Ok(reqwest::Client::builder()
            .timeout(config.timing.http_timeout)
            .build()?),
    }
}

/// Spawn a supervisor for `room`. Caller holds the table lock and has checked
/// that the client is running.
fn spawn_room(inner: &Arc<Inner>, table: &mut RoomTable, room: i64) {
    let (cancel, tracker, runtime) = match &table.running {
        Some(running) => (
            running.cancel.child_token(),
            running.tracker.clone(),
            running.runtime.clone(),
        ),
        None => return,
    };
    let generation = table.next_generation;
    table.next_generation += 1;
    table.active.insert(
        room,
        ActiveRoom {
            generation,
            cancel: cancel.clone(),
        },
    );

    let conn = RoomConnection::new(
        room,
        Arc::clone(&inner.api),
        Arc::clone(&inner.dispatcher),
        &inner.config,
    );
    let owner = Arc::clone(inner);
    tracker.spawn_on(
        async move {
            conn.run(cancel).await;
            let mut table = owner.rooms.lock();
            if table
                .active
                .get(&room)
                .is_some_and(|entry| entry.generation == generation)
            {
                table.active.remove(&room);
            }
        },
        &runtime,
    );
}
