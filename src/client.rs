//! Public client surface.
//!
//! A [`Client`] is a cheap cloneable handle. `connect()` opens the two
//! transports and spawns the session driver; `command()` and `subscribe()`
//! hand work to the driver and return immediately, with replies delivered
//! to the supplied continuations on the driver task.

use crate::conn;
use crate::dispatch::{self, op_record, Op};
use crate::error::Error;
use crate::events::{rewrite_topic, timer_token_period, Topic};
use crate::registry::{shared, ReplyHandler, SubscriptionChannel, SubscriptionRecord};
use resp_core::format_command;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

/// Hard cap on wire arguments accepted by a single `command()` call.
const MAX_COMMAND_ARGS: usize = 8000;

fn default_true() -> bool {
    true
}

/// Client configuration. Deserializable so applications can embed it in
/// their own config files.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Filesystem path of the server's Unix domain socket.
    pub path: PathBuf,
    /// Swallow `(p)subscribe` acknowledgements instead of delivering them
    /// to subscription handlers. On by default.
    #[serde(default = "default_true")]
    pub ignore_sub_ack: bool,
    /// Complete queued continuations with a `disconnected` error on
    /// `disconnect()` instead of dropping them silently.
    #[serde(default)]
    pub fail_dropped_commands: bool,
}

impl Config {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Config {
            path: path.into(),
            ignore_sub_ack: true,
            fail_dropped_commands: false,
        }
    }
}

/// One token of a command: text, an integer, raw bytes, or a list whose
/// elements expand in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    Text(String),
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<String>),
}

impl Arg {
    fn append_tokens(self, out: &mut Vec<Vec<u8>>) {
        match self {
            Arg::Text(s) => out.push(s.into_bytes()),
            Arg::Int(n) => out.push(n.to_string().into_bytes()),
            Arg::Bytes(b) => out.push(b),
            Arg::List(items) => out.extend(items.into_iter().map(String::into_bytes)),
        }
    }
}

impl From<&str> for Arg {
    fn from(s: &str) -> Self {
        Arg::Text(s.to_owned())
    }
}

impl From<String> for Arg {
    fn from(s: String) -> Self {
        Arg::Text(s)
    }
}

impl From<i64> for Arg {
    fn from(n: i64) -> Self {
        Arg::Int(n)
    }
}

impl From<&[u8]> for Arg {
    fn from(b: &[u8]) -> Self {
        Arg::Bytes(b.to_vec())
    }
}

impl From<Vec<u8>> for Arg {
    fn from(b: Vec<u8>) -> Self {
        Arg::Bytes(b)
    }
}

impl From<Vec<String>> for Arg {
    fn from(items: Vec<String>) -> Self {
        Arg::List(items)
    }
}

// ---------------------------------------------------------------------------
// Shared handle/driver state
// ---------------------------------------------------------------------------

/// Lifecycle hooks registered through `on_connect` and friends.
#[derive(Default)]
pub(crate) struct Hooks {
    pub connect: Option<Box<dyn FnMut() + Send>>,
    pub error: Option<Box<dyn FnMut(Error) + Send>>,
    pub disconnect: Option<Box<dyn FnMut() + Send>>,
}

/// Connection flags plus the live op channel, guarded by one lock so the
/// connected check and the enqueue are atomic.
#[derive(Default)]
pub(crate) struct State {
    pub connecting: bool,
    pub connected: bool,
    pub cmd_connected: bool,
    pub sub_connected: bool,
    pub disconnecting: bool,
    pub freeing: bool,
    pub ops: Option<UnboundedSender<Op>>,
}

pub(crate) struct Shared {
    pub config: Config,
    pub state: Mutex<State>,
    pub hooks: Mutex<Hooks>,
}

impl Shared {
    // Hooks run outside the hooks lock so they may re-register themselves
    // (or call anything else on the client) without deadlocking; the hook
    // is put back afterwards unless the user installed a replacement.

    pub(crate) fn fire_connect(&self) {
        let hook = self.hooks.lock().unwrap().connect.take();
        if let Some(mut hook) = hook {
            hook();
            let mut hooks = self.hooks.lock().unwrap();
            if hooks.connect.is_none() {
                hooks.connect = Some(hook);
            }
        }
    }

    pub(crate) fn fire_disconnect(&self) {
        let hook = self.hooks.lock().unwrap().disconnect.take();
        if let Some(mut hook) = hook {
            hook();
            let mut hooks = self.hooks.lock().unwrap();
            if hooks.disconnect.is_none() {
                hooks.disconnect = Some(hook);
            }
        }
    }

    pub(crate) fn fire_error(&self, err: Error) {
        let hook = self.hooks.lock().unwrap().error.take();
        if let Some(mut hook) = hook {
            hook(err);
            let mut hooks = self.hooks.lock().unwrap();
            if hooks.error.is_none() {
                hooks.error = Some(hook);
            }
        }
    }

    /// Forget the session: flags back to idle, op channel gone. A later
    /// `connect()` starts fresh.
    pub(crate) fn reset_session(&self) {
        *self.state.lock().unwrap() = State::default();
    }

    pub(crate) fn clear_hooks(&self) {
        *self.hooks.lock().unwrap() = Hooks::default();
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Asynchronous keyspace-notification client handle.
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
}

impl Client {
    pub fn new(config: Config) -> Self {
        Client {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(State::default()),
                hooks: Mutex::new(Hooks::default()),
            }),
        }
    }

    /// Register the hook fired once both transports are connected.
    pub fn on_connect(&self, hook: impl FnMut() + Send + 'static) -> &Self {
        self.shared.hooks.lock().unwrap().connect = Some(Box::new(hook));
        self
    }

    /// Register the hook fired on transport and protocol errors.
    pub fn on_error(&self, hook: impl FnMut(Error) + Send + 'static) -> &Self {
        self.shared.hooks.lock().unwrap().error = Some(Box::new(hook));
        self
    }

    /// Register the hook fired once both transports have closed.
    pub fn on_disconnect(&self, hook: impl FnMut() + Send + 'static) -> &Self {
        self.shared.hooks.lock().unwrap().disconnect = Some(Box::new(hook));
        self
    }

    /// Open both transports in the background. `on_connect` fires when both
    /// are up; a connect failure goes to `on_error`. Must be called from
    /// within a tokio runtime.
    pub fn connect(&self) -> &Self {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.connecting || state.connected {
                debug!("connect() ignored: session already live");
                return self;
            }
            *state = State::default();
            state.connecting = true;
        }
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            match conn::connect_pair(&shared.config.path).await {
                Err(err) => {
                    shared.state.lock().unwrap().connecting = false;
                    shared.fire_error(Error::Io(err.to_string()));
                }
                Ok((command, subscription)) => {
                    let ops = dispatch::spawn_driver(Arc::clone(&shared), command, subscription);
                    {
                        let mut state = shared.state.lock().unwrap();
                        state.connecting = false;
                        state.cmd_connected = true;
                        state.sub_connected = true;
                        state.connected = true;
                        state.ops = Some(ops);
                    }
                    shared.fire_connect();
                }
            }
        });
        self
    }

    /// Issue a command. The continuation, when given, receives the reply
    /// (or the error) in command order.
    ///
    /// List arguments expand in place. `__timer@0__:<n>` tokens never reach
    /// the wire: they attach client-local timer channels to the current
    /// subscription record.
    pub fn command<I, A>(&self, args: I, handler: Option<ReplyHandler>) -> Result<&Self, Error>
    where
        I: IntoIterator<Item = A>,
        A: Into<Arg>,
    {
        let mut tokens: Vec<Vec<u8>> = Vec::new();
        for arg in args {
            arg.into().append_tokens(&mut tokens);
        }

        let mut wire_args: Vec<Vec<u8>> = Vec::new();
        let mut periods: Vec<u64> = Vec::new();
        for token in tokens {
            match timer_token_period(&token) {
                Some(Ok(period)) => periods.push(period),
                Some(Err(())) => {
                    return Err(Error::Usage("command: Invalid timer period".to_owned()));
                }
                None => wire_args.push(token),
            }
        }
        if wire_args.is_empty() {
            return Err(Error::Usage("command: Missing command name".to_owned()));
        }
        if wire_args.len() > MAX_COMMAND_ARGS - 1 {
            return Err(Error::Usage("command: Stack Overflow".to_owned()));
        }

        let sender = {
            let state = self.shared.state.lock().unwrap();
            if state.connected && !state.disconnecting && !state.freeing {
                state.ops.clone()
            } else {
                None
            }
        };
        let Some(sender) = sender else {
            return match handler {
                Some(mut handler) => {
                    handler(Err(Error::NotConnected));
                    Ok(self)
                }
                None => Err(Error::NotConnected),
            };
        };

        let first = wire_args[0].to_ascii_lowercase();
        let pvariant = first.starts_with(b"p");
        let base: &[u8] = if pvariant { &first[1..] } else { &first };

        let op = if base == b"subscribe" {
            let names = wire_args[1..].to_vec();
            let mut channels: Vec<SubscriptionChannel> = names
                .iter()
                .map(|name| SubscriptionChannel::name(name.clone()))
                .collect();
            channels.extend(periods.iter().map(|&p| SubscriptionChannel::period(p)));
            // A purely local subscription has nothing to say to the server.
            let wire = if names.is_empty() && !periods.is_empty() {
                None
            } else {
                Some(format_wire(&wire_args))
            };
            Op::Subscribe {
                wire,
                pattern: pvariant,
                names,
                periods,
                record: shared(SubscriptionRecord::new(handler, channels)),
            }
        } else if base == b"unsubscribe" {
            // No reply of its own arrives on the command transport, so no
            // continuation is queued.
            Op::Command {
                wire: format_wire(&wire_args),
                sub: true,
                monitor: false,
                record: None,
            }
        } else {
            Op::Command {
                wire: format_wire(&wire_args),
                sub: false,
                monitor: first == b"monitor",
                record: Some(shared(SubscriptionRecord::new(handler, Vec::new()))),
            }
        };

        if let Err(rejected) = sender.send(op) {
            // The driver went away between the check and the send.
            match op_record(rejected.0) {
                Some(record) => {
                    let mut record = record.lock().unwrap();
                    if !record.has_handler() {
                        return Err(Error::NotConnected);
                    }
                    record.invoke(Err(Error::NotConnected));
                }
                None => return Err(Error::NotConnected),
            }
        }
        Ok(self)
    }

    /// Subscribe to keyspace/keyevent notifications and local timers.
    ///
    /// Plain names become keyspace channels, known notification event names
    /// become keyevent channels, numeric topics become local timer periods;
    /// already-prefixed names pass through untouched.
    pub fn subscribe<I, T>(&self, topics: I, handler: ReplyHandler) -> Result<&Self, Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<Topic>,
    {
        let mut args = vec![Arg::Text("subscribe".to_owned())];
        args.extend(
            topics
                .into_iter()
                .map(|topic| Arg::Text(rewrite_topic(&topic.into()))),
        );
        self.command(args, Some(handler))
    }

    /// Close both transports. Queued continuations are dropped (or failed,
    /// per config); `on_disconnect` fires once both halves have closed.
    pub fn disconnect(&self) -> &Self {
        let ops = self.shared.state.lock().unwrap().ops.clone();
        if let Some(ops) = ops {
            let _ = ops.send(Op::Disconnect);
        }
        self
    }

    /// Release every resource unconditionally: transports, registries,
    /// queued continuations, and lifecycle hooks. No callbacks fire.
    pub fn exit(&self) {
        let ops = self.shared.state.lock().unwrap().ops.take();
        match ops {
            Some(ops) => {
                let _ = ops.send(Op::Exit);
            }
            None => {
                self.shared.reset_session();
                self.shared.clear_hooks();
            }
        }
    }
}

fn format_wire(args: &[Vec<u8>]) -> Vec<u8> {
    let argv: Vec<&[u8]> = args.iter().map(Vec::as_slice).collect();
    format_command(&argv)
}
