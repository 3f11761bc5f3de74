//! Streaming RESP reply reader.
//!
//! Bytes are appended with [`ReplyReader::feed`] and complete replies are
//! pulled out with [`ReplyReader::next_reply`], at most one per call. The
//! reader tolerates arbitrary fragmentation: a reply split across any number
//! of feeds parses identically to the same bytes fed at once. A protocol
//! error is sticky — the partial reply and buffer are discarded and every
//! later call fails until a fresh reader is created.

use crate::reply::Reply;

/// Consumed prefix length at which the buffer is compacted.
const COMPACT_THRESHOLD: usize = 1024;

/// An empty buffer larger than this is released on the next feed.
const IDLE_BUF_LIMIT: usize = 16 * 1024;

/// Array frames may occupy stack indices 0..=7; an array header parsed at
/// index 8 (the ninth nesting level) is a protocol error.
const MAX_ARRAY_DEPTH: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReaderError {
    /// The reply type byte was not one of `- + : $ *`. The payload is the
    /// offending byte, quoted and hex-escaped when unprintable.
    #[error("Protocol error, got {0} as reply type byte")]
    BadTypeByte(String),
    #[error("No support for nested multi bulk replies with depth > 7")]
    NestedTooDeep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemType {
    Error,
    Status,
    Integer,
    Bulk,
    Array,
}

/// An array whose elements are still being parsed.
#[derive(Debug)]
struct PartialArray {
    expected: usize,
    items: Vec<Reply>,
}

/// Incremental RESP parser over an internal append-only buffer.
#[derive(Debug, Default)]
pub struct ReplyReader {
    buf: Vec<u8>,
    pos: usize,
    /// Type byte already consumed for the item currently being parsed.
    pending: Option<ItemType>,
    /// Enclosing arrays, outermost first.
    arrays: Vec<PartialArray>,
    err: Option<ReaderError>,
}

impl ReplyReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes from the transport.
    ///
    /// Fails with the stored error once the reader is in an error state.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<(), ReaderError> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        if bytes.is_empty() {
            return Ok(());
        }
        // Release an oversized buffer that has gone idle.
        if self.buf.is_empty() && self.buf.capacity() > IDLE_BUF_LIMIT {
            self.buf = Vec::new();
            self.pos = 0;
        }
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    /// Pull the next complete reply, or `None` when more bytes are needed.
    pub fn next_reply(&mut self) -> Result<Option<Reply>, ReaderError> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        if self.buf.is_empty() {
            return Ok(None);
        }
        let parsed = self.parse_one();
        if parsed.is_ok() {
            self.maybe_compact();
        }
        parsed
    }

    fn parse_one(&mut self) -> Result<Option<Reply>, ReaderError> {
        loop {
            let ty = match self.pending.take() {
                Some(ty) => ty,
                None => match self.read_type_byte()? {
                    Some(ty) => ty,
                    None => return Ok(None),
                },
            };

            let item = match ty {
                ItemType::Error | ItemType::Status | ItemType::Integer => self.read_line_item(ty),
                ItemType::Bulk => self.read_bulk_item(),
                ItemType::Array => {
                    if self.arrays.len() == MAX_ARRAY_DEPTH {
                        return Err(self.set_error(ReaderError::NestedTooDeep));
                    }
                    match self.read_line() {
                        None => None,
                        Some(header) => {
                            let count = parse_line_integer(&header);
                            if count < 0 {
                                Some(Reply::Nil)
                            } else if count == 0 {
                                Some(Reply::Array(Vec::new()))
                            } else {
                                // Capacity grows with actual elements, not
                                // the declared count, so a hostile header
                                // cannot force a giant allocation.
                                self.arrays.push(PartialArray {
                                    expected: count as usize,
                                    items: Vec::new(),
                                });
                                continue;
                            }
                        }
                    }
                }
            };

            match item {
                None => {
                    // Incomplete: remember the decoded type and wait for
                    // the next feed.
                    self.pending = Some(ty);
                    return Ok(None);
                }
                Some(reply) => {
                    if let Some(root) = self.complete(reply) {
                        return Ok(Some(root));
                    }
                }
            }
        }
    }

    /// Attach a finished item to its enclosing array, closing arrays whose
    /// last element it was. Returns the root reply when the stack empties.
    fn complete(&mut self, reply: Reply) -> Option<Reply> {
        let mut reply = reply;
        loop {
            match self.arrays.last_mut() {
                None => return Some(reply),
                Some(parent) => {
                    parent.items.push(reply);
                    if parent.items.len() < parent.expected {
                        return None;
                    }
                    let done = self.arrays.pop().expect("non-empty array stack");
                    reply = Reply::Array(done.items);
                }
            }
        }
    }

    fn read_type_byte(&mut self) -> Result<Option<ItemType>, ReaderError> {
        let Some(&byte) = self.buf.get(self.pos) else {
            return Ok(None);
        };
        self.pos += 1;
        let ty = match byte {
            b'-' => ItemType::Error,
            b'+' => ItemType::Status,
            b':' => ItemType::Integer,
            b'$' => ItemType::Bulk,
            b'*' => ItemType::Array,
            other => {
                return Err(self.set_error(ReaderError::BadTypeByte(escape_byte(other))));
            }
        };
        Ok(Some(ty))
    }

    fn read_line_item(&mut self, ty: ItemType) -> Option<Reply> {
        let line = self.read_line()?;
        Some(match ty {
            ItemType::Integer => Reply::Integer(parse_line_integer(&line)),
            ItemType::Error => Reply::Error(line),
            _ => Reply::Status(line),
        })
    }

    fn read_bulk_item(&mut self) -> Option<Reply> {
        let header_end = seek_newline(&self.buf[self.pos..])?;
        let len = parse_line_integer(&self.buf[self.pos..self.pos + header_end]);
        if len < 0 {
            self.pos += header_end + 2;
            return Some(Reply::Nil);
        }
        let len = len as usize;
        let body = self.pos + header_end + 2;
        // The whole payload plus its trailing CRLF must be buffered before
        // any of it is consumed.
        if body + len + 2 > self.buf.len() {
            return None;
        }
        let bytes = self.buf[body..body + len].to_vec();
        self.pos = body + len + 2;
        Some(Reply::String(bytes))
    }

    /// Consume one `\r\n`-terminated line, excluding the terminator.
    fn read_line(&mut self) -> Option<Vec<u8>> {
        let end = seek_newline(&self.buf[self.pos..])?;
        let line = self.buf[self.pos..self.pos + end].to_vec();
        self.pos += end + 2;
        Some(line)
    }

    fn maybe_compact(&mut self) {
        if self.pos >= COMPACT_THRESHOLD {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
    }

    fn set_error(&mut self, err: ReaderError) -> ReaderError {
        self.buf = Vec::new();
        self.pos = 0;
        self.pending = None;
        self.arrays.clear();
        self.err = Some(err.clone());
        err
    }
}

/// Position of the `\r` of the first `\r\n` in `bytes`.
fn seek_newline(bytes: &[u8]) -> Option<usize> {
    let mut pos = 0;
    while pos + 1 < bytes.len() {
        match bytes[pos..].iter().position(|&b| b == b'\r') {
            None => return None,
            Some(offset) => {
                pos += offset;
                if pos + 1 >= bytes.len() {
                    return None;
                }
                if bytes[pos + 1] == b'\n' {
                    return Some(pos);
                }
                pos += 1;
            }
        }
    }
    None
}

/// Parse a signed base-10 integer spanning the whole slice.
///
/// Malformed digits yield `-1` rather than an error so a bad length or
/// integer line does not abort the stream.
fn parse_line_integer(bytes: &[u8]) -> i64 {
    let (sign, digits) = match bytes.first() {
        Some(b'-') => (-1, &bytes[1..]),
        Some(b'+') => (1, &bytes[1..]),
        _ => (1, bytes),
    };
    let mut value: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return -1;
        }
        value = value.wrapping_mul(10).wrapping_add(i64::from(b - b'0'));
    }
    sign * value
}

/// Render a byte for the protocol error message: printable bytes are
/// quoted, control characters use their escape, anything else is `"\xNN"`.
fn escape_byte(byte: u8) -> String {
    match byte {
        b'\\' | b'"' => format!("\"\\{}\"", byte as char),
        b'\n' => "\"\\n\"".to_owned(),
        b'\r' => "\"\\r\"".to_owned(),
        b'\t' => "\"\\t\"".to_owned(),
        b if b.is_ascii_graphic() || b == b' ' => format!("\"{}\"", b as char),
        b => format!("\"\\x{b:02x}\""),
    }
}
