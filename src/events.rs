//! Subscription name rewriting.
//!
//! User-facing subscription names are translated onto the database-0
//! keyspace/keyevent notification channels, or onto the client-local timer
//! namespace for numeric periods. Replies travelling the other way have the
//! prefixes stripped again so user code never sees them.

use resp_core::Reply;

pub const KEY_SPACE_PREFIX: &[u8] = b"__keyspace@0__:";
pub const KEY_EVENT_PREFIX: &[u8] = b"__keyevent@0__:";
pub const TIMER_PREFIX: &[u8] = b"__timer@0__:";

/// Notification operation names published on keyevent channels. A bare
/// subscription name equal to one of these is taken as a keyevent
/// subscription rather than a key name.
const NOTIFICATION_EVENTS: [&str; 35] = [
    "append",
    "del",
    "expire",
    "evicted",
    "incrby",
    "incrbyfloat",
    "hdel",
    "hincrby",
    "hincrbyfloat",
    "hset",
    "linsert",
    "lpop",
    "lpush",
    "lset",
    "ltrim",
    "rename_from",
    "rename_to",
    "rpop",
    "rpush",
    "sadd",
    "sdiffstore",
    "set",
    "setrange",
    "sinterstore",
    "sortstore",
    "spop",
    "srem",
    "sunionostore",
    "zadd",
    "zincr",
    "zinterstore",
    "zrem",
    "zrembyrank",
    "zrembyscore",
    "zunionstore",
];

/// A single `subscribe()` argument: a channel-ish name, or a timer period
/// in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topic {
    Name(String),
    Period(u64),
}

impl From<&str> for Topic {
    fn from(name: &str) -> Self {
        Topic::Name(name.to_owned())
    }
}

impl From<String> for Topic {
    fn from(name: String) -> Self {
        Topic::Name(name)
    }
}

impl From<u64> for Topic {
    fn from(period: u64) -> Self {
        Topic::Period(period)
    }
}

/// Rewrite one topic to its wire token.
///
/// Periods map into the timer namespace; names already carrying one of the
/// three prefixes pass through; known notification event names become
/// keyevent channels; everything else becomes a keyspace channel.
pub fn rewrite_topic(topic: &Topic) -> String {
    match topic {
        Topic::Period(n) => format!("__timer@0__:{n}"),
        Topic::Name(name) => {
            let bytes = name.as_bytes();
            if bytes.starts_with(KEY_SPACE_PREFIX)
                || bytes.starts_with(KEY_EVENT_PREFIX)
                || bytes.starts_with(TIMER_PREFIX)
            {
                name.clone()
            } else if NOTIFICATION_EVENTS.contains(&name.as_str()) {
                format!("__keyevent@0__:{name}")
            } else {
                format!("__keyspace@0__:{name}")
            }
        }
    }
}

/// Period of a `__timer@0__:<n>` wire token, or `None` for ordinary tokens.
pub fn timer_token_period(token: &[u8]) -> Option<Result<u64, ()>> {
    let digits = token.strip_prefix(TIMER_PREFIX)?;
    match std::str::from_utf8(digits).ok().and_then(|s| s.parse().ok()) {
        Some(0) | None => Some(Err(())),
        Some(period) => Some(Ok(period)),
    }
}

fn strip_notification_prefix(bytes: &[u8]) -> &[u8] {
    bytes
        .strip_prefix(KEY_SPACE_PREFIX)
        .or_else(|| bytes.strip_prefix(KEY_EVENT_PREFIX))
        .unwrap_or(bytes)
}

/// Rewrite a subscription-path reply for delivery to user code.
///
/// Strings lose their keyspace/keyevent prefix; each array level drops its
/// leading kind tag and rewrites the remaining elements recursively, so the
/// user sees `(channel, payload, …)` without the `message` tag.
pub fn rewrite_sub_reply(reply: &Reply) -> Reply {
    match reply {
        Reply::String(bytes) => Reply::String(strip_notification_prefix(bytes).to_vec()),
        Reply::Array(items) => Reply::Array(items.iter().skip(1).map(rewrite_sub_reply).collect()),
        other => other.clone(),
    }
}
