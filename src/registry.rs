//! Subscription records and the per-channel callback registries.
//!
//! A subscription issued for several channels produces a single
//! [`SubscriptionRecord`] referenced from one registry slot per channel.
//! Records are shared between slots with `Arc`, so the slot count is the
//! record's attach count and the record is released when the last slot
//! drops. Dispatch order within a channel is subscribe order: slots form a
//! FIFO per registry node.

use crate::error::Error;
use resp_core::Reply;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::task::JoinHandle;

/// Continuation invoked with a reply or an error. Invoked any number of
/// times for subscriptions and monitor mode, exactly once for plain
/// commands.
pub type ReplyHandler = Box<dyn FnMut(Result<Reply, Error>) + Send + 'static>;

/// What a subscription channel is keyed by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelKey {
    /// A (rewritten) channel or pattern name on the wire.
    Name(Vec<u8>),
    /// A client-local timer period in milliseconds.
    Period(u64),
}

/// One channel of a subscription record, with its acknowledgement state.
#[derive(Debug)]
pub struct SubscriptionChannel {
    pub key: ChannelKey,
    pub subscribed: bool,
}

impl SubscriptionChannel {
    pub fn name(name: Vec<u8>) -> Self {
        Self {
            key: ChannelKey::Name(name),
            subscribed: false,
        }
    }

    pub fn period(period: u64) -> Self {
        Self {
            key: ChannelKey::Period(period),
            subscribed: false,
        }
    }
}

/// A user continuation plus the channels it is waiting on.
///
/// Command-queue records carry no channels at all. A record with channels
/// becomes initialized exactly once, when every channel has been
/// acknowledged (or, for timer channels, started).
pub struct SubscriptionRecord {
    handler: Option<ReplyHandler>,
    pub initialized: bool,
    pub channels: Vec<SubscriptionChannel>,
}

impl SubscriptionRecord {
    pub fn new(handler: Option<ReplyHandler>, channels: Vec<SubscriptionChannel>) -> Self {
        Self {
            handler,
            initialized: false,
            channels,
        }
    }

    pub fn all_subscribed(&self) -> bool {
        self.channels.iter().all(|ch| ch.subscribed)
    }

    /// Call the continuation, ignoring anything it does or fails to do.
    pub fn invoke(&mut self, result: Result<Reply, Error>) {
        if let Some(handler) = self.handler.as_mut() {
            handler(result);
        }
    }

    pub fn has_handler(&self) -> bool {
        self.handler.is_some()
    }
}

impl std::fmt::Debug for SubscriptionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRecord")
            .field("initialized", &self.initialized)
            .field("channels", &self.channels)
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

/// A record as held by registry slots and the command queue.
pub type SharedRecord = Arc<Mutex<SubscriptionRecord>>;

pub fn shared(record: SubscriptionRecord) -> SharedRecord {
    Arc::new(Mutex::new(record))
}

/// In-order FIFO of pending command continuations; the head owns the next
/// reply on the command transport.
pub type CommandQueue = VecDeque<SharedRecord>;

// ---------------------------------------------------------------------------
// Name registry (exact channels and patterns)
// ---------------------------------------------------------------------------

/// Per-name FIFO of subscription records. Channels and patterns live in two
/// disjoint instances of this registry.
#[derive(Debug, Default)]
pub struct NameRegistry {
    nodes: BTreeMap<Vec<u8>, VecDeque<SharedRecord>>,
}

impl NameRegistry {
    /// Append a slot for `record` under `name`, creating the node when
    /// absent. Returns whether the node was created.
    pub fn insert(&mut self, name: &[u8], record: &SharedRecord) -> bool {
        match self.nodes.get_mut(name) {
            Some(fifo) => {
                fifo.push_back(Arc::clone(record));
                false
            }
            None => {
                self.nodes
                    .insert(name.to_vec(), VecDeque::from([Arc::clone(record)]));
                true
            }
        }
    }

    /// Records attached to `name`, head first.
    pub fn search(&self, name: &[u8]) -> Option<Vec<SharedRecord>> {
        self.nodes
            .get(name)
            .map(|fifo| fifo.iter().map(Arc::clone).collect())
    }

    /// Remove and return the head record for `name`, releasing its slot.
    // TODO: wire this up once unsubscribe dispatch is implemented.
    #[allow(dead_code)]
    pub fn shift(&mut self, name: &[u8]) -> Option<SharedRecord> {
        let fifo = self.nodes.get_mut(name)?;
        fifo.pop_front()
    }

    /// Drop every node and slot.
    pub fn destroy_all(&mut self) {
        self.nodes.clear();
    }

    #[cfg(test)]
    fn slot_count(&self, name: &[u8]) -> usize {
        self.nodes.get(name).map_or(0, VecDeque::len)
    }
}

// ---------------------------------------------------------------------------
// Timer registry
// ---------------------------------------------------------------------------

/// A timer node: the FIFO of records attached to one period, plus the
/// running ticker once the period has been started.
#[derive(Debug, Default)]
pub struct TimerNode {
    pub records: VecDeque<SharedRecord>,
    pub ticker: Option<JoinHandle<()>>,
    pub started_at: Option<Instant>,
}

impl TimerNode {
    pub fn stop(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
        self.started_at = None;
    }
}

/// Registry of client-local periodic timers keyed by period.
#[derive(Debug, Default)]
pub struct TimerRegistry {
    nodes: BTreeMap<u64, TimerNode>,
}

impl TimerRegistry {
    /// Append a slot for `record` under `period`, creating the node when
    /// absent. Returns whether the node was created.
    pub fn insert(&mut self, period: u64, record: &SharedRecord) -> bool {
        let created = !self.nodes.contains_key(&period);
        self.nodes
            .entry(period)
            .or_default()
            .records
            .push_back(Arc::clone(record));
        created
    }

    pub fn node_mut(&mut self, period: u64) -> Option<&mut TimerNode> {
        self.nodes.get_mut(&period)
    }

    /// Stop every ticker and drop every node and slot.
    pub fn destroy_all(&mut self) {
        for node in self.nodes.values_mut() {
            node.stop();
        }
        self.nodes.clear();
    }
}
