use std::fmt;

/// A single parsed server reply.
///
/// Arrays own their children by value; dropping a reply drops the whole
/// tree. Status, error, and string payloads are raw bytes — Redis channel
/// names and payloads are not required to be UTF-8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `+OK\r\n` style single-line status.
    Status(Vec<u8>),
    /// `-ERR …\r\n` server error line.
    Error(Vec<u8>),
    /// `:123\r\n` signed integer.
    Integer(i64),
    /// `$5\r\nhello\r\n` bulk string.
    String(Vec<u8>),
    /// Null bulk (`$-1`) or null array (`*-1`).
    Nil,
    /// `*N\r\n…` multi bulk.
    Array(Vec<Reply>),
}

impl Reply {
    /// Byte payload of a `Status`, `Error`, or `String` reply.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Reply::Status(b) | Reply::Error(b) | Reply::String(b) => Some(b),
            _ => None,
        }
    }

    /// Lossless `&str` view of the payload, when it is UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Reply::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Reply]> {
        match self {
            Reply::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Reply::Nil)
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Status(b) => write!(f, "{}", String::from_utf8_lossy(b)),
            Reply::Error(b) => write!(f, "(error) {}", String::from_utf8_lossy(b)),
            Reply::Integer(n) => write!(f, "{n}"),
            Reply::String(b) => write!(f, "{:?}", String::from_utf8_lossy(b)),
            Reply::Nil => write!(f, "(nil)"),
            Reply::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
        }
    }
}
