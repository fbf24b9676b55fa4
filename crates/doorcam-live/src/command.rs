//! Remote command channel to the door unit.
//!
//! ```text
//!   SessionCore ──dispatch(Start|Stop)──► CommandQueue (mpsc)
//!                                              │
//!                                         writer_task  ← owns the CommandChannel,
//!                                              │          runs one command at a time
//!                                              └──► oneshot reply to the caller
//! ```
//!
//! The queue is what keeps remote commands in the order the session issued
//! them: a `Stop` for an abandoned attempt always reaches the device before
//! the `Start` of the next one.

use std::future::Future;
use std::time::Duration;

use doorcam_proto::config::DeviceConfig;
use doorcam_proto::protocol::{DeviceReply, StreamAction};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::CommandError;

/// Positive acknowledgement from the door unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub action: StreamAction,
    /// Streaming flag echoed by the device, when it sends one.
    pub streaming: Option<bool>,
}

/// Something that can deliver a start/stop command to the door unit.
///
/// Implementations hold no remote-side state and never retry.
pub trait CommandChannel: Send + Sync + 'static {
    fn send_command(
        &self,
        action: StreamAction,
    ) -> impl Future<Output = Result<Ack, CommandError>> + Send;
}

// ── HTTP implementation ───────────────────────────────────────────────────────

/// `POST /start_stream` / `POST /stop_stream` against the door unit's control
/// port, bounded by the configured command timeout.
#[derive(Clone)]
pub struct HttpCommandClient {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpCommandClient {
    pub fn new(device: &DeviceConfig) -> anyhow::Result<Self> {
        let timeout = device.command_timeout();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: device.base_url(),
            timeout,
        })
    }

    fn classify(&self, err: reqwest::Error) -> CommandError {
        if err.is_timeout() {
            CommandError::Timeout(self.timeout)
        } else {
            CommandError::Unreachable(err.to_string())
        }
    }

    async fn post(&self, action: StreamAction) -> Result<Ack, CommandError> {
        let url = format!("{}{}", self.base_url, action.path());
        debug!("command: POST {}", url);

        let response = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| self.classify(e))?;
        let status = response.status();
        let body = response.text().await.map_err(|e| self.classify(e))?;

        if !status.is_success() {
            return Err(CommandError::Rejected(format!("HTTP {}", status)));
        }

        let reply: DeviceReply = serde_json::from_str(&body)
            .map_err(|e| CommandError::Rejected(format!("unreadable reply: {}", e)))?;
        if !reply.is_success() {
            return Err(CommandError::Rejected(
                reply.message.unwrap_or(reply.status),
            ));
        }

        Ok(Ack {
            action,
            streaming: reply.streaming,
        })
    }
}

impl CommandChannel for HttpCommandClient {
    fn send_command(
        &self,
        action: StreamAction,
    ) -> impl Future<Output = Result<Ack, CommandError>> + Send {
        self.post(action)
    }
}

// ── ordered queue ─────────────────────────────────────────────────────────────

struct PendingCommand {
    action: StreamAction,
    reply: oneshot::Sender<Result<Ack, CommandError>>,
}

/// Handle to the command writer task.
pub struct CommandQueue {
    tx: mpsc::Sender<PendingCommand>,
    writer: JoinHandle<()>,
}

/// Reply to a dispatched command.  Dropping it does not cancel the command.
pub struct PendingReply {
    rx: oneshot::Receiver<Result<Ack, CommandError>>,
}

impl CommandQueue {
    /// Spawn the writer task that owns `channel`.  The task exits once the
    /// queue is dropped or drained and the backlog is empty.
    pub fn spawn<C: CommandChannel>(channel: C) -> Self {
        let (tx, rx) = mpsc::channel::<PendingCommand>(32);
        let writer = tokio::spawn(writer_task(channel, rx));
        Self { tx, writer }
    }

    /// Enqueue `action`.  Returns once the command is queued, not when it
    /// completes.
    pub async fn dispatch(&self, action: StreamAction) -> PendingReply {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = PendingCommand {
            action,
            reply: reply_tx,
        };
        if let Err(mpsc::error::SendError(request)) = self.tx.send(request).await {
            let _ = request.reply.send(Err(CommandError::Unreachable(
                "command queue closed".to_string(),
            )));
        }
        PendingReply { rx: reply_rx }
    }

    /// Close the queue and give the backlog up to `bound` to reach the
    /// device.  Returns false if commands were still pending at the bound.
    pub async fn drain(self, bound: Duration) -> bool {
        let Self { tx, mut writer } = self;
        drop(tx);
        match tokio::time::timeout(bound, &mut writer).await {
            Ok(_) => true,
            Err(_) => {
                warn!("command: backlog not flushed within {:?}, abandoning", bound);
                writer.abort();
                false
            }
        }
    }
}

impl PendingReply {
    pub async fn wait(self) -> Result<Ack, CommandError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(CommandError::Unreachable(
                "command writer dropped the reply".to_string(),
            )),
        }
    }
}

async fn writer_task<C: CommandChannel>(channel: C, mut rx: mpsc::Receiver<PendingCommand>) {
    while let Some(request) = rx.recv().await {
        let result = channel.send_command(request.action).await;
        match &result {
            Ok(ack) => info!(
                "command: {} acknowledged (streaming={:?})",
                request.action, ack.streaming
            ),
            Err(e) => warn!("command: {} failed: {}", request.action, e),
        }
        let _ = request.reply.send(result);
    }
    debug!("command writer: task exiting");
}
