#![allow(clippy::unwrap_used, reason = "test code can panic on errors")]
#![allow(dead_code, reason = "not every suite uses every helper")]

use std::time::Duration;

use futures_util::{SinkExt as _, StreamExt as _};
use lsp_mux::registry;
use lsp_mux::{LspCodec, Message, Mux, MuxConfig, MuxExit, MuxHandle, ServerIo};
use serde_json::Value;
use tokio::io::{DuplexStream, duplex};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// One framed endpoint of a duplex pipe: either a fake client or the fake
/// server sitting where the child process would be.
pub struct Peer {
    framed: Framed<DuplexStream, LspCodec>,
}

impl Peer {
    pub fn new(stream: DuplexStream) -> Self {
        Self {
            framed: Framed::new(stream, LspCodec::new()),
        }
    }

    pub async fn send(&mut self, value: Value) {
        let message = Message::from_value(value).unwrap();
        self.framed.send(message).await.unwrap();
    }

    pub async fn recv(&mut self) -> Value {
        tokio::time::timeout(TIMEOUT, self.framed.next())
            .await
            .expect("timed out waiting for a message")
            .expect("stream ended")
            .expect("framing error")
            .into_value()
    }

    /// Returns the next message, or `None` when nothing arrives within `window`.
    pub async fn try_recv(&mut self, window: Duration) -> Option<Value> {
        match tokio::time::timeout(window, self.framed.next()).await {
            Ok(Some(Ok(message))) => Some(message.into_value()),
            Ok(Some(Err(error))) => panic!("framing error: {error}"),
            Ok(None) => panic!("stream ended"),
            Err(_) => None,
        }
    }

    pub async fn expect_closed(&mut self) {
        let next = tokio::time::timeout(TIMEOUT, self.framed.next())
            .await
            .expect("timed out waiting for stream end");
        assert!(next.is_none(), "expected stream end, got {next:?}");
    }
}

pub struct TestMux {
    pub handle: MuxHandle,
    /// The fake language server: the other side of the child's stdio.
    pub server: Peer,
    pub task: JoinHandle<anyhow::Result<MuxExit>>,
}

pub fn spawn_mux(spec_name: &str, cfg: MuxConfig) -> TestMux {
    let (mux_side, server_side) = duplex(64 * 1024);
    let (reader, writer) = tokio::io::split(mux_side);

    let spec = registry::find(spec_name).unwrap();
    let (mux, handle) = Mux::new(ServerIo::from_io(reader, writer), spec);
    let task = tokio::spawn(mux.with_config(cfg).run());

    TestMux {
        handle,
        server: Peer::new(server_side),
        task,
    }
}

pub async fn attach_client(handle: &MuxHandle) -> Peer {
    let (ours, theirs) = duplex(64 * 1024);
    handle.attach(theirs).await.unwrap();
    Peer::new(ours)
}

/// Raw (unframed) client stream, for feeding the mux malformed bytes.
pub async fn attach_raw(handle: &MuxHandle) -> DuplexStream {
    let (ours, theirs) = duplex(64 * 1024);
    handle.attach(theirs).await.unwrap();
    ours
}

/// Config for tests that must not hit the idle shutdown path.
pub fn long_idle() -> MuxConfig {
    MuxConfig {
        idle_timeout: Duration::from_secs(30),
        ..Default::default()
    }
}
