//! keywatch: an async client for Redis-compatible servers, specialized for
//! keyspace/keyevent notifications and client-local timer subscriptions.
//!
//! The client keeps two independent Unix-socket connections to the server —
//! one for ordinary commands, one for pub/sub traffic — and dispatches
//! replies, notifications, and timer ticks to user-registered continuations
//! on a single driver task.
//!
//! ```no_run
//! use keywatch::{Client, Config};
//!
//! # async fn example() {
//! let client = Client::new(Config::new("/var/run/redis.sock"));
//! client
//!     .on_connect(|| println!("connected"))
//!     .on_error(|err| eprintln!("client error: {err}"))
//!     .connect();
//!
//! // Keyspace notifications for "mykey", plus a local 500 ms timer.
//! # let _ =
//! client.subscribe(
//!     vec![keywatch::Topic::from("mykey"), keywatch::Topic::from(500u64)],
//!     Box::new(|event| println!("{event:?}")),
//! );
//! # }
//! ```

mod client;
mod conn;
mod dispatch;
mod error;
mod events;
mod registry;
mod timers;

pub use client::{Arg, Client, Config};
pub use error::Error;
pub use events::Topic;
pub use registry::ReplyHandler;
pub use resp_core::{Reply, ReplyReader};
