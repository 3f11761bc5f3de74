//! Outbound command encoding.

/// Decimal digit count of `n`, matching the bytes `itoa`-style formatting
/// will produce.
fn decimal_len(n: usize) -> usize {
    let mut len = 1;
    let mut n = n / 10;
    while n > 0 {
        len += 1;
        n /= 10;
    }
    len
}

/// Encode a command as a RESP bulk array: `*<argc>\r\n` followed by
/// `$<len>\r\n<bytes>\r\n` per argument.
///
/// Arguments are binary-safe; their slice lengths are authoritative. The
/// exact output size is computed up front so the frame is built in a single
/// allocation.
pub fn format_command(args: &[&[u8]]) -> Vec<u8> {
    let mut total = 1 + decimal_len(args.len()) + 2;
    for arg in args {
        total += 1 + decimal_len(arg.len()) + 2 + arg.len() + 2;
    }

    let mut wire = Vec::with_capacity(total);
    wire.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        wire.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        wire.extend_from_slice(arg);
        wire.extend_from_slice(b"\r\n");
    }
    debug_assert_eq!(wire.len(), total);
    wire
}
