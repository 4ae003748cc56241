//! Event fan-out: raw callbacks, typed callbacks, and subscriber queues.
//!
//! [`Dispatcher::dispatch`] runs on each room's read task. Handler lists are
//! snapshotted under a read lock and invoked after it is released, so a
//! callback may register further callbacks without deadlocking.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::command::{command_name, parse_command};
use crate::protocol::{Packet, op, parse_heartbeat_reply};
use crate::types::{
    Danmaku, Event, EventKind, Gift, GuardPurchase, HeartbeatData, InteractWord,
    LiveStateChange, RawCommand, SuperChat,
};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;
type RawCallback = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    danmaku: Vec<Callback<Danmaku>>,
    gift: Vec<Callback<Gift>>,
    super_chat: Vec<Callback<SuperChat>>,
    guard: Vec<Callback<GuardPurchase>>,
    live: Vec<Callback<LiveStateChange>>,
    preparing: Vec<Callback<LiveStateChange>>,
    interact: Vec<Callback<InteractWord>>,
    heartbeat: Vec<Callback<HeartbeatData>>,
    raw: Vec<RawCallback>,
}

#[derive(Default)]
struct Subscribers {
    queues: Vec<mpsc::Sender<Arc<Event>>>,
    closed: bool,
}

/// Handle to a bounded event queue created by [`Dispatcher::subscribe`].
///
/// Events are dropped for this subscriber while its queue is full.
pub struct Subscription {
    rx: mpsc::Receiver<Arc<Event>>,
}

impl Subscription {
    /// Receive the next event. Returns `None` once the client has stopped and
    /// the queue is drained.
    pub async fn next(&mut self) -> Option<Arc<Event>> {
        self.rx.recv().await
    }

    /// Non-blocking variant of [`next`](Subscription::next).
    pub fn try_next(&mut self) -> Option<Arc<Event>> {
        self.rx.try_recv().ok()
    }
}

pub struct Dispatcher {
    handlers: RwLock<Handlers>,
    subscribers: RwLock<Subscribers>,
    capacity: usize,
    dropped: AtomicU64,
}

impl Dispatcher {
    pub fn new(capacity: usize) -> Self {
        Self {
            handlers: RwLock::new(Handlers::default()),
            subscribers: RwLock::new(Subscribers::default()),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn on_danmaku(&self, f: impl Fn(&Danmaku) + Send + Sync + 'static) {
        self.handlers.write().danmaku.push(Arc::new(f));
    }

    pub fn on_gift(&self, f: impl Fn(&Gift) + Send + Sync + 'static) {
        self.handlers.write().gift.push(Arc::new(f));
    }

    pub fn on_super_chat(&self, f: impl Fn(&SuperChat) + Send + Sync + 'static) {
        self.handlers.write().super_chat.push(Arc::new(f));
    }

    pub fn on_guard_purchase(&self, f: impl Fn(&GuardPurchase) + Send + Sync + 'static) {
        self.handlers.write().guard.push(Arc::new(f));
    }

    /// Room went live.
    pub fn on_live(&self, f: impl Fn(&LiveStateChange) + Send + Sync + 'static) {
        self.handlers.write().live.push(Arc::new(f));
    }

    /// Room went offline.
    pub fn on_preparing(&self, f: impl Fn(&LiveStateChange) + Send + Sync + 'static) {
        self.handlers.write().preparing.push(Arc::new(f));
    }

    pub fn on_interact_word(&self, f: impl Fn(&InteractWord) + Send + Sync + 'static) {
        self.handlers.write().interact.push(Arc::new(f));
    }

    pub fn on_heartbeat(&self, f: impl Fn(&HeartbeatData) + Send + Sync + 'static) {
        self.handlers.write().heartbeat.push(Arc::new(f));
    }

    /// Catch-all for every command packet, typed or not: `(cmd, body)`.
    pub fn on_raw(&self, f: impl Fn(&str, &[u8]) + Send + Sync + 'static) {
        self.handlers.write().raw.push(Arc::new(f));
    }

    /// Create a queue that receives every event. After the client has stopped
    /// the returned subscription is already closed.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        let mut subs = self.subscribers.write();
        if !subs.closed {
            subs.queues.retain(|q| !q.is_closed());
            subs.queues.push(tx);
        }
        Subscription { rx }
    }

    /// Number of events dropped because a subscriber queue was full.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Route one decoded packet from `room_id`.
    pub fn dispatch(&self, room_id: i64, packet: &Packet) {
        match packet.operation {
            op::HEARTBEAT_REPLY => {
                if let Some(hb) = parse_heartbeat_reply(&packet.body) {
                    fire(self.snapshot(|h| &h.heartbeat), &hb);
                    self.publish(Event {
                        room_id,
                        kind: EventKind::Heartbeat(hb),
                    });
                }
            }
            op::AUTH_REPLY => {
                let code = serde_json::from_slice::<Value>(&packet.body)
                    .ok()
                    .and_then(|v| v.get("code").and_then(Value::as_i64));
                match code {
                    Some(0) | None => tracing::info!(room = room_id, "Authenticated"),
                    Some(code) => tracing::warn!(room = room_id, code, "Auth rejected"),
                }
            }
            op::COMMAND => self.dispatch_command(room_id, &packet.body),
            other => {
                tracing::debug!(room = room_id, operation = other, "Ignoring packet");
            }
        }
    }

    fn dispatch_command(&self, room_id: i64, body: &Bytes) {
        let doc = serde_json::from_slice::<Value>(body).ok();
        let name = command_name(doc.as_ref());

        for f in self.snapshot(|h| &h.raw) {
            f(&name, body);
        }

        let kind = doc
            .as_ref()
            .and_then(|d| parse_command(room_id, &name, d));
        let kind = match kind {
            Some(kind) => {
                self.notify(&kind);
                kind
            }
            None => {
                tracing::trace!(room = room_id, cmd = %name, "Unrecognized command");
                EventKind::Unrecognized(RawCommand {
                    cmd: name,
                    body: body.clone(),
                })
            }
        };
        self.publish(Event { room_id, kind });
    }

    fn notify(&self, kind: &EventKind) {
        match kind {
            EventKind::Danmaku(d) => fire(self.snapshot(|h| &h.danmaku), d),
            EventKind::Gift(g) => fire(self.snapshot(|h| &h.gift), g),
            EventKind::SuperChat(sc) => fire(self.snapshot(|h| &h.super_chat), sc),
            EventKind::GuardPurchase(gp) => fire(self.snapshot(|h| &h.guard), gp),
            EventKind::LiveStateChange(ls) if ls.live => fire(self.snapshot(|h| &h.live), ls),
            EventKind::LiveStateChange(ls) => fire(self.snapshot(|h| &h.preparing), ls),
            EventKind::InteractWord(iw) => fire(self.snapshot(|h| &h.interact), iw),
            EventKind::Heartbeat(hb) => fire(self.snapshot(|h| &h.heartbeat), hb),
            EventKind::Unrecognized(_) => {}
        }
    }

    fn snapshot<T: Clone>(&self, pick: impl FnOnce(&Handlers) -> &Vec<T>) -> Vec<T> {
        pick(&self.handlers.read()).clone()
    }

    /// Non-blocking fan-out. The read lock is held across the sends so a
    /// concurrent [`close_subscriptions`](Self::close_subscriptions) cannot
    /// interleave with them.
    fn publish(&self, event: Event) {
        let event = Arc::new(event);
        let subs = self.subscribers.read();
        for queue in &subs.queues {
            match queue.try_send(Arc::clone(&event)) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::trace!(total_dropped = total, "Subscriber queue full, dropping event");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }

    /// Close every subscriber queue. Only the first call has any effect.
    pub(crate) fn close_subscriptions(&self) {
        let queues = {
            let mut subs = self.subscribers.write();
            subs.closed = true;
            std::mem::take(&mut subs.queues)
        };
        tracing::debug!(count = queues.len(), "Closing subscriptions");
    }
}

fn fire<T>(handlers: Vec<Callback<T>>, value: &T) {
    for f in handlers {
        f(value);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
