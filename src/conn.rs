//! Dual-transport connection plumbing.
//!
//! The client keeps two independent Unix-socket connections to the same
//! endpoint: one carries ordinary commands and their replies, the other
//! carries subscribe traffic and server-pushed events. Each connection gets
//! a read pump task that forwards raw chunks to the driver; the driver owns
//! the write halves.

use crate::dispatch::DriverEvent;
use std::io;
use std::path::Path;
use tokio::io::AsyncReadExt;
use tokio::net::unix::OwnedReadHalf;
use tokio::net::UnixStream;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

const READ_CHUNK: usize = 4096;

/// Which of the two transports a chunk or close event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Command,
    Subscription,
}

/// Open both connections to `path`, command transport first. The client
/// counts as connected only once both succeed, so a failure of either
/// fails the whole connect.
pub async fn connect_pair(path: &Path) -> io::Result<(UnixStream, UnixStream)> {
    let command = UnixStream::connect(path).await?;
    let subscription = UnixStream::connect(path).await?;
    Ok((command, subscription))
}

/// Pump one transport's read side into the driver.
///
/// Emits `Bytes` per chunk and a final `TransportClosed` on remote close,
/// read error, or shutdown signal; the remote-close case carries the
/// end-of-file error text so the driver can surface it.
pub fn spawn_read_pump(
    kind: TransportKind,
    mut read_half: OwnedReadHalf,
    events: UnboundedSender<DriverEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK];
        let error = loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break None;
                    }
                }
                read = read_half.read(&mut buf) => match read {
                    Ok(0) => break Some("end of file".to_owned()),
                    Ok(n) => {
                        if events
                            .send(DriverEvent::Bytes { kind, chunk: buf[..n].to_vec() })
                            .is_err()
                        {
                            return;
                        }
                    }
                    Err(e) => break Some(e.to_string()),
                },
            }
        };
        debug!(?kind, ?error, "transport read side closed");
        let _ = events.send(DriverEvent::TransportClosed { kind, error });
    })
}
