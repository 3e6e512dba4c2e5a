//! Shared integration-test harness: an in-process experiment server that
//! speaks the WebSocket event protocol, plus helpers for running the
//! `econagents` binary.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

/// Default timeout for waiting on a single frame.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

enum Command {
    Frame(String),
    Close,
}

/// A WebSocket server accepting exactly one client.
///
/// Frames the client sends are buffered in arrival order; frames pushed by
/// the test are written to the client as text messages.
pub struct ExperimentServer {
    addr: SocketAddr,
    commands: mpsc::UnboundedSender<Command>,
    received: mpsc::UnboundedReceiver<String>,
    handle: JoinHandle<()>,
}

impl ExperimentServer {
    /// Binds to an ephemeral loopback port and starts accepting.
    #[allow(clippy::missing_panics_doc)]
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind test listener");
        let addr = listener.local_addr().expect("listener has no address");
        let (commands, mut command_rx) = mpsc::unbounded_channel();
        let (received_tx, received) = mpsc::unbounded_channel();

        let handle = tokio::spawn(async move {
            let Ok((stream, _peer)) = listener.accept().await else {
                return;
            };
            let Ok(ws) = accept_async(stream).await else {
                return;
            };
            let (mut writer, mut reader) = ws.split();
            loop {
                tokio::select! {
                    msg = reader.next() => match msg {
                        Some(Ok(Message::Text(text))) => {
                            let _ = received_tx.send(text);
                        }
                        Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                        Some(Ok(_)) => {}
                    },
                    cmd = command_rx.recv() => match cmd {
                        Some(Command::Frame(text)) => {
                            if writer.send(Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                        Some(Command::Close) | None => {
                            let _ = writer.send(Message::Close(None)).await;
                            let _ = writer.close().await;
                            break;
                        }
                    },
                }
            }
        });

        Self {
            addr,
            commands,
            received,
            handle,
        }
    }

    /// `ws://` URL clients should connect to.
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Pushes a raw text frame to the client.
    pub fn push(&self, frame: impl Into<String>) {
        let _ = self.commands.send(Command::Frame(frame.into()));
    }

    /// Pushes an event envelope to the client.
    pub fn push_event(&self, event_type: &str, data: Value) {
        self.push(json!({"type": "event", "eventType": event_type, "data": data}).to_string());
    }

    /// Closes the connection from the server side.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    /// Waits for the next frame sent by the client, parsed as JSON.
    ///
    /// Panics if nothing arrives within `timeout` or the client went away.
    #[allow(clippy::missing_panics_doc)]
    pub async fn next_frame(&mut self, timeout: Duration) -> Value {
        let text = tokio::time::timeout(timeout, self.received.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("client connection ended");
        serde_json::from_str(&text)
            .unwrap_or_else(|e| panic!("client sent invalid JSON: {e}\nframe: {text}"))
    }

    /// Returns `None` if the client sends nothing within `window`.
    pub async fn try_next_frame(&mut self, window: Duration) -> Option<Value> {
        match tokio::time::timeout(window, self.received.recv()).await {
            Ok(Some(text)) => serde_json::from_str(&text).ok(),
            Ok(None) | Err(_) => None,
        }
    }

    /// Waits until the connection task finishes.
    #[allow(clippy::missing_panics_doc)]
    pub async fn finished(self, timeout: Duration) {
        tokio::time::timeout(timeout, self.handle)
            .await
            .expect("server connection did not finish")
            .expect("server task panicked");
    }
}

/// Runs the `econagents` binary to completion with the given arguments.
#[allow(clippy::missing_panics_doc)]
pub async fn run_binary(args: &[&str], timeout: Duration) -> Output {
    let bin = env!("CARGO_BIN_EXE_econagents");
    let child = tokio::process::Command::new(bin)
        .args(args)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .expect("failed to spawn econagents");
    tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .expect("econagents did not exit in time")
        .expect("failed to collect econagents output")
}

/// Writes `contents` to `name` inside `dir` and returns the path.
#[allow(clippy::missing_panics_doc)]
pub fn write_file(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).expect("failed to write fixture");
    path
}
