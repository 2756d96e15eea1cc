//! Watcher registry: coalesced write/rotate event fan-out from the WAL
//! thread to subscriber endpoints (replication relays).
//!
//! Each watcher has at most one notification en route. Events raised
//! while one is in flight are OR-ed into a pending set and delivered when
//! the notification returns to the WAL thread, so edges are coalesced but
//! never lost or reordered. A watcher that detaches first is simply
//! missing when its last completion arrives, and nothing is resent.

use std::ops::{BitOr, BitOrAssign};

use crate::bus::{Envelope, Handler, Hop, Pipe};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WalEvents(u8);

impl WalEvents {
    pub const NONE: WalEvents = WalEvents(0);
    /// A batch was flushed to the current segment.
    pub const WRITE: WalEvents = WalEvents(1);
    /// A fresh segment was opened.
    pub const ROTATE: WalEvents = WalEvents(2);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: WalEvents) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for WalEvents {
    type Output = WalEvents;

    fn bitor(self, rhs: WalEvents) -> WalEvents {
        WalEvents(self.0 | rhs.0)
    }
}

impl BitOrAssign for WalEvents {
    fn bitor_assign(&mut self, rhs: WalEvents) {
        self.0 |= rhs.0;
    }
}

pub type WatcherId = u64;

/// Notification payload delivered to the watcher's endpoint.
pub struct WatcherNotice {
    pub watcher_id: WatcherId,
    pub events: WalEvents,
}

struct Watcher {
    id: WatcherId,
    /// Pipe to the subscriber's endpoint.
    target: Pipe,
    /// Subscriber-side handler for the notice.
    perform: Handler,
    in_flight: bool,
    pending: WalEvents,
}

pub struct WatcherRegistry {
    watchers: Vec<Watcher>,
    next_id: WatcherId,
    /// WAL-side completion handler; clears in-flight and resends pending.
    complete: Handler,
    /// Pipe back to the WAL endpoint, the notification's return hop.
    back: Pipe,
}

impl WatcherRegistry {
    pub fn new(complete: Handler, back: Pipe) -> Self {
        Self {
            watchers: Vec::new(),
            next_id: 1,
            complete,
            back,
        }
    }

    /// Register a watcher and immediately notify a rotate so it can
    /// process the already existing segments.
    pub fn attach(&mut self, target: Pipe, perform: Handler) -> WatcherId {
        let id = self.next_id;
        self.next_id += 1;
        self.watchers.push(Watcher {
            id,
            target,
            perform,
            in_flight: false,
            pending: WalEvents::NONE,
        });
        self.notify_id(id, WalEvents::ROTATE);
        id
    }

    pub fn detach(&mut self, id: WatcherId) {
        self.watchers.retain(|w| w.id != id);
    }

    pub fn is_attached(&self, id: WatcherId) -> bool {
        self.watchers.iter().any(|w| w.id == id)
    }

    pub fn notify_all(&mut self, events: WalEvents) {
        let ids: Vec<WatcherId> = self.watchers.iter().map(|w| w.id).collect();
        for id in ids {
            self.notify_id(id, events);
        }
    }

    fn notify_id(&mut self, id: WatcherId, events: WalEvents) {
        let complete = self.complete;
        let back = self.back.clone();
        let Some(watcher) = self.watchers.iter_mut().find(|w| w.id == id) else {
            return;
        };
        if watcher.in_flight {
            watcher.pending |= events;
            return;
        }
        watcher.in_flight = true;
        let env = Envelope::new(
            WatcherNotice {
                watcher_id: watcher.id,
                events,
            },
            vec![
                Hop {
                    perform: watcher.perform,
                    next: Some(back),
                },
                Hop {
                    perform: complete,
                    next: None,
                },
            ],
        );
        if watcher.target.push(env).is_err() {
            // the subscriber endpoint is gone; drop the watcher
            let gone = watcher.id;
            self.detach(gone);
        }
    }

    /// The notification for `id` came back to the WAL thread.
    pub fn on_notify_returned(&mut self, id: WatcherId) {
        let Some(watcher) = self.watchers.iter_mut().find(|w| w.id == id) else {
            // detached while the notice was en route
            return;
        };
        watcher.in_flight = false;
        let pending = std::mem::take(&mut watcher.pending);
        if !pending.is_empty() {
            self.notify_id(id, pending);
        }
    }
}
