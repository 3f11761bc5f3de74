//! Shared scaffolding for the client integration suites: a scripted
//! Unix-socket server speaking raw RESP, wire-frame builders, and
//! capture-channel continuations.
#![allow(dead_code)]

use keywatch::{Client, Config, Error, Reply};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// Opt-in debug logging for test runs: `RUST_LOG=keywatch=debug cargo test`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// A listener the tests script by hand: the client's command transport is
/// accepted first, the subscription transport second.
pub struct MockServer {
    _dir: TempDir,
    path: PathBuf,
    listener: UnixListener,
}

impl MockServer {
    pub fn bind() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("keywatch.sock");
        let listener = UnixListener::bind(&path).expect("bind mock server socket");
        MockServer {
            _dir: dir,
            path,
            listener,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn accept_pair(&self) -> (UnixStream, UnixStream) {
        let (command, _) = self.listener.accept().await.expect("accept command");
        let (subscription, _) = self.listener.accept().await.expect("accept subscription");
        (command, subscription)
    }
}

/// Connect a client against a fresh mock server and wait until the client
/// reports itself connected.
pub async fn connected_client(mut config_for: impl FnMut(&Path) -> Config)
-> (Client, UnixStream, UnixStream, MockServer) {
    let server = MockServer::bind();
    let client = Client::new(config_for(server.path()));
    let (tx, mut rx) = mpsc::unbounded_channel();
    client.on_connect(move || {
        let _ = tx.send(());
    });
    client.connect();
    let (command, subscription) = server.accept_pair().await;
    tokio::time::timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("connect within timeout")
        .expect("on_connect fired");
    (client, command, subscription, server)
}

pub async fn default_client() -> (Client, UnixStream, UnixStream, MockServer) {
    connected_client(|path| Config::new(path)).await
}

/// Read exactly `expected.len()` bytes and assert they match.
pub async fn expect_wire(stream: &mut UnixStream, expected: &[u8]) {
    let mut buf = vec![0u8; expected.len()];
    tokio::time::timeout(RECV_TIMEOUT, stream.read_exact(&mut buf))
        .await
        .expect("frame within timeout")
        .expect("read expected frame");
    assert_eq!(
        String::from_utf8_lossy(&buf),
        String::from_utf8_lossy(expected),
        "wire frame mismatch"
    );
}

/// Assert that nothing arrives on `stream` for a little while.
pub async fn expect_silence(stream: &mut UnixStream) {
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_millis(150), stream.read(&mut buf)).await;
    assert!(read.is_err(), "unexpected bytes on transport");
}

// ---------------------------------------------------------------------------
// RESP frame builders
// ---------------------------------------------------------------------------

fn bulk(arg: &str) -> String {
    format!("${}\r\n{}\r\n", arg.len(), arg)
}

/// The client's own outbound encoding of a command.
pub fn command_frame(args: &[&str]) -> Vec<u8> {
    let mut frame = format!("*{}\r\n", args.len());
    for arg in args {
        frame.push_str(&bulk(arg));
    }
    frame.into_bytes()
}

/// A `subscribe`/`psubscribe` acknowledgement.
pub fn ack_frame(kind: &str, channel: &str, count: i64) -> Vec<u8> {
    format!("*3\r\n{}{}:{count}\r\n", bulk(kind), bulk(channel)).into_bytes()
}

/// A pub/sub `message` push.
pub fn message_frame(channel: &str, payload: &str) -> Vec<u8> {
    format!("*3\r\n{}{}{}", bulk("message"), bulk(channel), bulk(payload)).into_bytes()
}

/// A pub/sub `pmessage` push.
pub fn pmessage_frame(pattern: &str, channel: &str, payload: &str) -> Vec<u8> {
    format!(
        "*4\r\n{}{}{}{}",
        bulk("pmessage"),
        bulk(pattern),
        bulk(channel),
        bulk(payload)
    )
    .into_bytes()
}

// ---------------------------------------------------------------------------
// Continuations
// ---------------------------------------------------------------------------

pub type Captured = mpsc::UnboundedReceiver<Result<Reply, Error>>;

/// A continuation that forwards everything it receives into a channel.
pub fn capture() -> (keywatch::ReplyHandler, Captured) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
        rx,
    )
}

pub async fn recv(rx: &mut Captured) -> Result<Reply, Error> {
    tokio::time::timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("delivery within timeout")
        .expect("continuation invoked")
}

/// Convenience constructors for expected replies.
pub fn s(text: &str) -> Reply {
    Reply::String(text.as_bytes().to_vec())
}

pub fn array(items: Vec<Reply>) -> Reply {
    Reply::Array(items)
}
