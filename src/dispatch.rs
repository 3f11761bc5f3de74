//! The dispatch core.
//!
//! One driver task per connection session owns every piece of mutable
//! client state: the per-transport RESP readers, the three subscription
//! registries, the command queue, and the write halves. Client handles and
//! the spawned pump/ticker tasks only ever talk to it through channels, so
//! every user continuation runs inline on this task in a well-defined
//! order — the cooperative single-threaded model of the public contract.

use crate::client::Shared;
use crate::conn::{self, TransportKind};
use crate::error::Error;
use crate::events::rewrite_sub_reply;
use crate::registry::{
    ChannelKey, CommandQueue, NameRegistry, SharedRecord, TimerRegistry,
};
use crate::timers::spawn_ticker;
use resp_core::{Reply, ReplyReader};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Input from the pump and ticker tasks.
#[derive(Debug)]
pub enum DriverEvent {
    Bytes {
        kind: TransportKind,
        chunk: Vec<u8>,
    },
    TransportClosed {
        kind: TransportKind,
        error: Option<String>,
    },
    TimerTick {
        period: u64,
    },
}

/// Input from client handles.
pub enum Op {
    /// Write a formatted command; `record` joins the command queue when the
    /// command expects a reply on the command transport.
    Command {
        wire: Vec<u8>,
        sub: bool,
        monitor: bool,
        record: Option<SharedRecord>,
    },
    /// Register a subscription record under its channels, then write the
    /// subscribe frame. `wire` is `None` for timer-only subscriptions,
    /// which never touch the server.
    Subscribe {
        wire: Option<Vec<u8>>,
        pattern: bool,
        names: Vec<Vec<u8>>,
        periods: Vec<u64>,
        record: SharedRecord,
    },
    Disconnect,
    Exit,
}

/// The record an op carries, for error delivery when the op cannot be
/// accepted.
pub fn op_record(op: Op) -> Option<SharedRecord> {
    match op {
        Op::Command { record, .. } => record,
        Op::Subscribe { record, .. } => Some(record),
        Op::Disconnect | Op::Exit => None,
    }
}

/// Split both transports, start their read pumps, and spawn the driver.
/// Returns the op channel the client handle keeps.
pub(crate) fn spawn_driver(
    shared: Arc<Shared>,
    command: UnixStream,
    subscription: UnixStream,
) -> UnboundedSender<Op> {
    let (op_tx, op_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (cmd_read, cmd_write) = command.into_split();
    let (sub_read, sub_write) = subscription.into_split();
    let cmd_pump = conn::spawn_read_pump(
        TransportKind::Command,
        cmd_read,
        event_tx.clone(),
        shutdown_rx.clone(),
    );
    let sub_pump = conn::spawn_read_pump(
        TransportKind::Subscription,
        sub_read,
        event_tx.clone(),
        shutdown_rx,
    );

    let ignore_sub_ack = shared.config.ignore_sub_ack;
    let fail_dropped_commands = shared.config.fail_dropped_commands;
    let driver = Driver {
        shared,
        ops: op_rx,
        events: event_rx,
        event_tx,
        shutdown: shutdown_tx,
        cmd_writer: Some(cmd_write),
        sub_writer: Some(sub_write),
        cmd_pump: Some(cmd_pump),
        sub_pump: Some(sub_pump),
        cmd_reader: ReplyReader::new(),
        sub_reader: ReplyReader::new(),
        channels: NameRegistry::default(),
        patterns: NameRegistry::default(),
        timers: TimerRegistry::default(),
        command_queue: CommandQueue::new(),
        monitoring: false,
        ignore_sub_ack,
        fail_dropped_commands,
    };
    tokio::spawn(driver.run());
    op_tx
}

struct Driver {
    shared: Arc<Shared>,
    ops: UnboundedReceiver<Op>,
    events: UnboundedReceiver<DriverEvent>,
    /// Kept for handing to newly started tickers.
    event_tx: UnboundedSender<DriverEvent>,
    shutdown: watch::Sender<bool>,
    cmd_writer: Option<OwnedWriteHalf>,
    sub_writer: Option<OwnedWriteHalf>,
    cmd_pump: Option<JoinHandle<()>>,
    sub_pump: Option<JoinHandle<()>>,
    // One reader per transport: the two connections carry independent RESP
    // streams and must never share parse state.
    cmd_reader: ReplyReader,
    sub_reader: ReplyReader,
    channels: NameRegistry,
    patterns: NameRegistry,
    timers: TimerRegistry,
    command_queue: CommandQueue,
    monitoring: bool,
    ignore_sub_ack: bool,
    fail_dropped_commands: bool,
}

impl Driver {
    async fn run(mut self) {
        loop {
            tokio::select! {
                op = self.ops.recv() => match op {
                    // Every client handle is gone; tear down silently.
                    None => {
                        self.release_everything();
                        break;
                    }
                    Some(op) => {
                        if self.handle_op(op).await {
                            break;
                        }
                    }
                },
                event = self.events.recv() => match event {
                    None => break,
                    Some(event) => {
                        if self.handle_event(event) {
                            break;
                        }
                    }
                },
            }
        }
    }

    /// Returns true when the driver should terminate.
    async fn handle_op(&mut self, op: Op) -> bool {
        match op {
            Op::Command {
                wire,
                sub,
                monitor,
                record,
            } => {
                if monitor {
                    self.monitoring = true;
                }
                if let Some(record) = record {
                    self.command_queue.push_back(record);
                }
                self.write(&wire, sub).await;
                false
            }
            Op::Subscribe {
                wire,
                pattern,
                names,
                periods,
                record,
            } => {
                {
                    let registry = if pattern {
                        &mut self.patterns
                    } else {
                        &mut self.channels
                    };
                    for name in &names {
                        registry.insert(name, &record);
                    }
                }
                for &period in &periods {
                    self.timers.insert(period, &record);
                }
                match wire {
                    Some(wire) => self.write(&wire, true).await,
                    None => self.activate_timer_only(&periods, &record),
                }
                false
            }
            Op::Disconnect => {
                self.begin_disconnect();
                false
            }
            Op::Exit => {
                self.release_everything();
                true
            }
        }
    }

    fn handle_event(&mut self, event: DriverEvent) -> bool {
        match event {
            DriverEvent::Bytes { kind, chunk } => self.on_bytes(kind, &chunk),
            DriverEvent::TransportClosed { kind, error } => self.on_transport_closed(kind, error),
            DriverEvent::TimerTick { period } => {
                self.on_timer_tick(period);
                false
            }
        }
    }

    // -----------------------------------------------------------------------
    // Write path
    // -----------------------------------------------------------------------

    async fn write(&mut self, wire: &[u8], sub: bool) {
        let writer = if sub {
            self.sub_writer.as_mut()
        } else {
            self.cmd_writer.as_mut()
        };
        let result = match writer {
            None => Err(std::io::Error::from(std::io::ErrorKind::NotConnected)),
            Some(writer) => writer.write_all(wire).await,
        };
        if let Err(err) = result {
            warn!(%err, sub, "transport write failed");
            // A failed write costs the queue head its reply.
            if let Some(record) = self.command_queue.pop_front() {
                record
                    .lock()
                    .unwrap()
                    .invoke(Err(Error::Io(err.to_string())));
            }
        }
    }

    // -----------------------------------------------------------------------
    // Read path
    // -----------------------------------------------------------------------

    fn on_bytes(&mut self, kind: TransportKind, chunk: &[u8]) -> bool {
        if self.shared.state.lock().unwrap().disconnecting {
            // Late traffic during teardown gets no dispatch.
            return false;
        }
        let feed = match kind {
            TransportKind::Command => self.cmd_reader.feed(chunk),
            TransportKind::Subscription => self.sub_reader.feed(chunk),
        };
        if let Err(err) = feed {
            return self.on_protocol_error(kind, err);
        }
        loop {
            let next = match kind {
                TransportKind::Command => self.cmd_reader.next_reply(),
                TransportKind::Subscription => self.sub_reader.next_reply(),
            };
            match next {
                Err(err) => return self.on_protocol_error(kind, err),
                Ok(None) => return false,
                Ok(Some(reply)) => match kind {
                    TransportKind::Command => self.dispatch_command_reply(reply),
                    TransportKind::Subscription => self.dispatch_sub_reply(&reply),
                },
            }
        }
    }

    fn dispatch_command_reply(&mut self, reply: Reply) {
        let Some(record) = self.command_queue.pop_front() else {
            // More replies than commands; the server is allowed to be
            // chatty, the client just drops them.
            debug!("discarding reply with no pending continuation");
            return;
        };
        let result = match reply {
            Reply::Error(text) => Err(Error::Server(String::from_utf8_lossy(&text).into_owned())),
            other => Ok(other),
        };
        record.lock().unwrap().invoke(result);
        if self.monitoring {
            // Monitor output is a stream of unsolicited replies; keep the
            // continuation enqueued so each one finds a recipient.
            self.command_queue.push_back(record);
        }
    }

    fn dispatch_sub_reply(&mut self, reply: &Reply) {
        if let Reply::Error(text) = reply {
            warn!(error = %String::from_utf8_lossy(text), "error reply on subscription transport");
            return;
        }
        let Some(items) = reply.as_array() else {
            warn!("non-array reply on subscription transport");
            return;
        };
        let (Some(kind_tag), Some(name)) = (
            items.first().and_then(Reply::as_bytes),
            items.get(1).and_then(Reply::as_bytes),
        ) else {
            warn!("malformed subscription reply shape");
            return;
        };

        let pvariant = kind_tag.first() == Some(&b'p');
        let base = if pvariant { &kind_tag[1..] } else { kind_tag };
        if base == b"unsubscribe" {
            // Removal is owed to a future extension.
            return;
        }

        let registry = if pvariant { &self.patterns } else { &self.channels };
        let Some(records) = registry.search(name) else {
            debug!(
                channel = %String::from_utf8_lossy(name),
                "subscription traffic for unknown channel"
            );
            return;
        };

        if base == b"subscribe" {
            self.apply_subscribe_ack(&records, name, reply);
        } else {
            self.deliver_event(&records, reply);
        }
    }

    /// Consume a `(p)subscribe` acknowledgement: the first record waiting on
    /// this channel claims it. Timer channels met on the walk are started
    /// along the way, and a record whose channels are all active becomes
    /// initialized.
    fn apply_subscribe_ack(&mut self, records: &[SharedRecord], name: &[u8], reply: &Reply) {
        let mut done = false;
        for record in records {
            if done {
                break;
            }
            let mut rec = record.lock().unwrap();
            if rec.initialized {
                continue;
            }
            for ch in &mut rec.channels {
                if ch.subscribed {
                    continue;
                }
                match &ch.key {
                    ChannelKey::Name(n) if !done && n == name => {
                        ch.subscribed = true;
                        done = true;
                    }
                    ChannelKey::Period(period) => {
                        let period = *period;
                        ch.subscribed = true;
                        self.start_timer(period);
                    }
                    ChannelKey::Name(_) => {}
                }
            }
            if rec.all_subscribed() {
                rec.initialized = true;
            }
            if done && !self.ignore_sub_ack {
                rec.invoke(Ok(rewrite_sub_reply(reply)));
            }
        }
    }

    /// Deliver a `(p)message` (or any other server push) to every record on
    /// the channel, in subscribe order.
    fn deliver_event(&mut self, records: &[SharedRecord], reply: &Reply) {
        for record in records {
            let mut rec = record.lock().unwrap();
            if rec.initialized {
                rec.invoke(Ok(rewrite_sub_reply(reply)));
            } else {
                rec.invoke(Err(Error::NotInitialized));
            }
        }
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    /// Start the ticker for `period` unless it is already running.
    fn start_timer(&mut self, period: u64) {
        match self.timers.node_mut(period) {
            None => warn!(period, "timer channel without a registry node"),
            Some(node) => {
                if node.ticker.is_none() {
                    node.started_at = Some(Instant::now());
                    node.ticker = Some(spawn_ticker(period, self.event_tx.clone()));
                }
            }
        }
    }

    /// A subscription that carried only timer periods never reaches the
    /// server: activate it locally so it fires without any ack.
    fn activate_timer_only(&mut self, periods: &[u64], record: &SharedRecord) {
        for &period in periods {
            self.start_timer(period);
        }
        let mut rec = record.lock().unwrap();
        for ch in &mut rec.channels {
            if matches!(ch.key, ChannelKey::Period(_)) {
                ch.subscribed = true;
            }
        }
        if rec.all_subscribed() {
            rec.initialized = true;
        }
    }

    fn on_timer_tick(&mut self, period: u64) {
        if self.shared.state.lock().unwrap().disconnecting {
            return;
        }
        let Some(node) = self.timers.node_mut(period) else {
            return;
        };
        let elapsed = node
            .started_at
            .map_or(0, |started| started.elapsed().as_millis() as i64);
        let records: Vec<SharedRecord> = node.records.iter().cloned().collect();
        for record in records {
            let mut rec = record.lock().unwrap();
            if rec.initialized {
                rec.invoke(Ok(Reply::Array(vec![
                    Reply::String(b"timer".to_vec()),
                    Reply::Integer(period as i64),
                    Reply::Integer(elapsed),
                ])));
            } else {
                rec.invoke(Err(Error::NotInitialized));
            }
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    fn on_protocol_error(&mut self, kind: TransportKind, err: resp_core::ReaderError) -> bool {
        self.shared.fire_error(Error::Protocol(err));
        self.close_transport(kind)
    }

    fn on_transport_closed(&mut self, kind: TransportKind, error: Option<String>) -> bool {
        if let Some(message) = error {
            let disconnecting = self.shared.state.lock().unwrap().disconnecting;
            if !disconnecting {
                self.shared.fire_error(Error::Io(message));
            }
        }
        self.close_transport(kind)
    }

    /// Tear down one transport and run the close bookkeeping. Returns true
    /// once both transports are down and the session has been freed.
    fn close_transport(&mut self, kind: TransportKind) -> bool {
        match kind {
            TransportKind::Command => {
                if let Some(pump) = self.cmd_pump.take() {
                    pump.abort();
                }
                self.cmd_writer = None;
            }
            TransportKind::Subscription => {
                if let Some(pump) = self.sub_pump.take() {
                    pump.abort();
                }
                self.sub_writer = None;
            }
        }
        let both_closed = {
            let mut state = self.shared.state.lock().unwrap();
            match kind {
                TransportKind::Command => state.cmd_connected = false,
                TransportKind::Subscription => state.sub_connected = false,
            }
            state.connected = state.cmd_connected && state.sub_connected;
            !state.cmd_connected && !state.sub_connected
        };
        if both_closed {
            self.finish_disconnect();
            true
        } else {
            false
        }
    }

    fn begin_disconnect(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.disconnecting {
                return;
            }
            state.disconnecting = true;
        }
        debug!("disconnecting both transports");
        let _ = self.shutdown.send(true);
        self.cmd_writer = None;
        self.sub_writer = None;
        // The pumps observe the shutdown signal and report their close;
        // finish_disconnect runs once both have.
    }

    /// Both transports are down: free the registries, settle the queue, and
    /// tell the user.
    fn finish_disconnect(&mut self) {
        self.shared.state.lock().unwrap().freeing = true;
        self.timers.destroy_all();
        self.channels.destroy_all();
        self.patterns.destroy_all();
        let dropped: Vec<SharedRecord> = self.command_queue.drain(..).collect();
        if self.fail_dropped_commands {
            for record in dropped {
                record.lock().unwrap().invoke(Err(Error::Disconnected));
            }
        }
        self.shared.fire_disconnect();
        self.shared.reset_session();
    }

    /// Unconditional teardown: no callbacks, no bookkeeping left behind.
    fn release_everything(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(pump) = self.cmd_pump.take() {
            pump.abort();
        }
        if let Some(pump) = self.sub_pump.take() {
            pump.abort();
        }
        self.cmd_writer = None;
        self.sub_writer = None;
        self.timers.destroy_all();
        self.channels.destroy_all();
        self.patterns.destroy_all();
        self.command_queue.clear();
        self.shared.reset_session();
        self.shared.clear_hooks();
    }
}
