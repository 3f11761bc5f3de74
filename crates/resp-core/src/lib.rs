//! RESP wire protocol support.
//!
//! This crate contains the protocol-level pieces of the client and nothing
//! else: the typed reply tree, a streaming reader that turns an arbitrarily
//! fragmented byte stream into reply trees, and the outbound command
//! formatter. It does no I/O and spawns no tasks, so it can be exercised
//! byte-by-byte in tests.

mod command;
mod reader;
mod reply;

pub use command::format_command;
pub use reader::{ReaderError, ReplyReader};
pub use reply::Reply;
