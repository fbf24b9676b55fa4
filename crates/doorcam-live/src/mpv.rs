//! mpv-backed stream decoder.
//!
//! Architecture (one set per decoder instance):
//!
//! ```text
//!   MpvDecoder::initialize()
//!         │
//!         ├── spawn `mpv --idle=yes --pause --input-ipc-server=<per-instance socket>`
//!         ├── writer_task   ← receives PendingRequest via mpsc, serialises → socket
//!         └── reader_task   ← reads JSON lines from socket
//!                                ├── response (has request_id) → matched oneshot::Sender
//!                                └── event                     → event channel
//!         then `loadfile <url>` and wait for `file-loaded` (or `end-file` = failure)
//! ```
//!
//! `dispose()` asks mpv to quit, kills it if it lingers, and removes the
//! socket.  The child is also `kill_on_drop` so a dropped decoder never leaves
//! a window behind.
//!
//! Platform notes:
//! - Unix:    Unix domain sockets
//! - Windows: Named pipes  \\.\pipe\<name>

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use doorcam_proto::config::DecoderConfig;
use doorcam_proto::platform;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::decoder::{DecoderFactory, StreamDecoder};
use crate::error::DecoderError;

// ── counters / timings ────────────────────────────────────────────────────────

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

const IPC_REPLY_TIMEOUT: Duration = Duration::from_secs(5);
const SOCKET_POLL: Duration = Duration::from_millis(100);
const SOCKET_ATTEMPTS: u32 = 50;
const QUIT_GRACE: Duration = Duration::from_secs(1);

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, DecoderError>>>>>;

// ── internal channel types ────────────────────────────────────────────────────

struct PendingRequest {
    req_id: u64,
    payload: String, // serialised JSON line (already has '\n')
    reply: oneshot::Sender<Result<Value, DecoderError>>,
}

/// An unsolicited mpv event (no request_id).
#[derive(Debug, Clone)]
struct MpvEvent {
    raw: Value,
}

impl MpvEvent {
    fn event_name(&self) -> Option<&str> {
        self.raw.get("event")?.as_str()
    }

    fn end_reason(&self) -> Option<&str> {
        self.raw.get("reason")?.as_str()
    }
}

#[derive(Clone)]
struct MpvHandle {
    tx: mpsc::Sender<PendingRequest>,
}

impl MpvHandle {
    async fn send(&self, command: Value) -> Result<Value, DecoderError> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let msg = json!({ "command": command, "request_id": req_id });
        let mut raw = serde_json::to_string(&msg).map_err(|e| DecoderError::Ipc(e.to_string()))?;
        raw.push('\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PendingRequest {
                req_id,
                payload: raw,
                reply: reply_tx,
            })
            .await
            .map_err(|_| DecoderError::Ipc("mpv writer task gone".to_string()))?;

        tokio::time::timeout(IPC_REPLY_TIMEOUT, reply_rx)
            .await
            .map_err(|_| DecoderError::Ipc(format!("mpv IPC timeout for req={}", req_id)))?
            .map_err(|_| DecoderError::Ipc(format!("mpv reply channel dropped req={}", req_id)))?
    }
}

// ── factory ───────────────────────────────────────────────────────────────────

/// Creates one `MpvDecoder` per start attempt.
#[derive(Debug, Clone, Default)]
pub struct MpvFactory {
    configured_binary: Option<PathBuf>,
    extra_args: Vec<String>,
}

impl MpvFactory {
    pub fn new(config: &DecoderConfig) -> Self {
        Self {
            configured_binary: config.mpv_path.clone(),
            extra_args: config.extra_args.clone(),
        }
    }
}

impl DecoderFactory for MpvFactory {
    type Decoder = MpvDecoder;

    fn create(&self, url: &str) -> MpvDecoder {
        let instance = NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed);
        MpvDecoder {
            url: url.to_string(),
            socket_name: platform::mpv_socket_name(instance),
            configured_binary: self.configured_binary.clone(),
            extra_args: self.extra_args.clone(),
            process: None,
            handle: None,
            events: None,
        }
    }
}

// ── decoder ───────────────────────────────────────────────────────────────────

pub struct MpvDecoder {
    url: String,
    socket_name: String,
    configured_binary: Option<PathBuf>,
    extra_args: Vec<String>,
    process: Option<tokio::process::Child>,
    handle: Option<MpvHandle>,
    /// Only read while waiting for `file-loaded`; dropped afterwards so the
    /// reader never blocks on a full event queue.
    events: Option<mpsc::Receiver<MpvEvent>>,
}

impl MpvDecoder {
    fn spawn_process(&mut self) -> Result<(), DecoderError> {
        let mpv_binary = platform::find_mpv_binary(self.configured_binary.as_ref())
            .ok_or_else(|| DecoderError::Spawn("mpv binary not found".to_string()))?;

        info!("mpv: spawning {} for {}", mpv_binary.display(), self.url);
        let child = tokio::process::Command::new(mpv_binary)
            .arg("--idle=yes")
            .arg("--pause")
            .arg("--force-window=yes")
            .arg("--no-terminal")
            .arg("--cache=no")
            .arg("--profile=low-latency")
            .arg("--title=Door camera")
            .arg(platform::mpv_socket_arg(&self.socket_name))
            .args(&self.extra_args)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DecoderError::Spawn(e.to_string()))?;
        self.process = Some(child);
        Ok(())
    }

    fn check_alive(&mut self) -> Result<(), DecoderError> {
        if let Some(child) = self.process.as_mut() {
            if let Ok(Some(status)) = child.try_wait() {
                return Err(DecoderError::InitFailed(format!("mpv exited: {}", status)));
            }
        }
        Ok(())
    }

    #[cfg(unix)]
    async fn connect(&mut self) -> Result<(), DecoderError> {
        let mut last_err = String::from("socket did not appear");
        for _ in 0..SOCKET_ATTEMPTS {
            tokio::time::sleep(SOCKET_POLL).await;
            self.check_alive()?;
            match tokio::net::UnixStream::connect(&self.socket_name).await {
                Ok(stream) => {
                    debug!("mpv: connected to {}", self.socket_name);
                    self.start_io_tasks(stream);
                    return Ok(());
                }
                Err(e) => last_err = e.to_string(),
            }
        }
        Err(DecoderError::Ipc(format!("mpv IPC socket: {}", last_err)))
    }

    #[cfg(windows)]
    async fn connect(&mut self) -> Result<(), DecoderError> {
        use tokio::net::windows::named_pipe::ClientOptions;

        let pipe_path = format!(r"\\.\pipe\{}", self.socket_name);
        let mut last_err = String::from("pipe did not appear");
        for _ in 0..SOCKET_ATTEMPTS {
            tokio::time::sleep(SOCKET_POLL).await;
            self.check_alive()?;
            match ClientOptions::new().open(&pipe_path) {
                Ok(client) => {
                    debug!("mpv: connected to {}", pipe_path);
                    self.start_io_tasks(client);
                    return Ok(());
                }
                Err(e) => last_err = e.to_string(),
            }
        }
        Err(DecoderError::Ipc(format!("mpv named pipe: {}", last_err)))
    }

    fn start_io_tasks<S>(&mut self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let reader = BufReader::new(read_half);

        // req_id → reply channel.  Writer inserts, reader resolves.
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (cmd_tx, cmd_rx) = mpsc::channel::<PendingRequest>(16);
        let (event_tx, event_rx) = mpsc::channel::<MpvEvent>(64);

        tokio::spawn(writer_task(write_half, cmd_rx, pending.clone()));
        tokio::spawn(reader_task(reader, pending, event_tx));

        self.handle = Some(MpvHandle { tx: cmd_tx });
        self.events = Some(event_rx);
    }

    fn handle(&self) -> Result<&MpvHandle, DecoderError> {
        self.handle
            .as_ref()
            .ok_or_else(|| DecoderError::Ipc("mpv not initialised".to_string()))
    }

    async fn load(&mut self) -> Result<(), DecoderError> {
        self.handle()?.send(json!(["loadfile", self.url])).await?;

        let mut events = self
            .events
            .take()
            .ok_or_else(|| DecoderError::Ipc("mpv event channel missing".to_string()))?;
        while let Some(evt) = events.recv().await {
            match evt.event_name() {
                Some("file-loaded") => {
                    info!("mpv: stream opened {}", self.url);
                    return Ok(());
                }
                Some("end-file") => {
                    let reason = evt.end_reason().unwrap_or("unknown");
                    let detail = evt
                        .raw
                        .get("file_error")
                        .and_then(|v| v.as_str())
                        .unwrap_or(reason);
                    return Err(DecoderError::InitFailed(detail.to_string()));
                }
                Some(other) => debug!("mpv: event {} while loading", other),
                None => {}
            }
        }
        Err(DecoderError::InitFailed(
            "mpv closed the IPC connection".to_string(),
        ))
    }

    async fn shutdown(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = tokio::time::timeout(QUIT_GRACE, handle.send(json!(["quit"]))).await;
        }
        if let Some(mut child) = self.process.take() {
            match tokio::time::timeout(QUIT_GRACE, child.wait()).await {
                Ok(Ok(status)) => debug!("mpv: exited {}", status),
                _ => {
                    warn!("mpv: did not quit, killing");
                    let _ = child.kill().await;
                }
            }
        }
        #[cfg(unix)]
        {
            let _ = tokio::fs::remove_file(&self.socket_name).await;
        }
    }
}

impl StreamDecoder for MpvDecoder {
    fn initialize(&mut self) -> impl Future<Output = Result<(), DecoderError>> + Send {
        async move {
            self.spawn_process()?;
            self.connect().await?;
            self.load().await
        }
    }

    fn play(&mut self) -> impl Future<Output = Result<(), DecoderError>> + Send {
        async move {
            self.handle()?
                .send(json!(["set_property", "pause", false]))
                .await?;
            Ok(())
        }
    }

    fn set_looping(
        &mut self,
        looping: bool,
    ) -> impl Future<Output = Result<(), DecoderError>> + Send {
        async move {
            let value = if looping { "inf" } else { "no" };
            self.handle()?
                .send(json!(["set_property", "loop-file", value]))
                .await?;
            Ok(())
        }
    }

    fn dispose(self) -> impl Future<Output = ()> + Send {
        self.shutdown()
    }
}

// ── reader task ───────────────────────────────────────────────────────────────

async fn fail_all(pending: &PendingMap, reason: &str) {
    let mut map = pending.lock().await;
    for (_, tx) in map.drain() {
        let _ = tx.send(Err(DecoderError::Ipc(reason.to_string())));
    }
}

async fn reader_task<R>(
    mut reader: BufReader<R>,
    pending: PendingMap,
    event_tx: mpsc::Sender<MpvEvent>,
) where
    R: AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("mpv reader: connection closed");
                fail_all(&pending, "mpv IPC connection closed").await;
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let val: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("mpv reader: invalid json '{}': {}", trimmed, e);
                        continue;
                    }
                };

                if let Some(req_id) = val.get("request_id").and_then(|v| v.as_u64()) {
                    let mut map = pending.lock().await;
                    if let Some(tx) = map.remove(&req_id) {
                        let result = if val["error"].as_str() == Some("success") {
                            Ok(val)
                        } else {
                            let err = val["error"].as_str().unwrap_or("unknown error");
                            debug!("mpv reader: response req={} err={}", req_id, err);
                            Err(DecoderError::Ipc(format!("mpv error: {}", err)))
                        };
                        let _ = tx.send(result);
                    }
                } else {
                    // Nobody listens once the stream is open; that's fine.
                    let _ = event_tx.send(MpvEvent { raw: val }).await;
                }
            }
            Err(e) => {
                warn!("mpv reader: read error: {}", e);
                fail_all(&pending, "mpv IPC read error").await;
                break;
            }
        }
    }
}

// ── writer task ───────────────────────────────────────────────────────────────

async fn writer_task<W>(
    mut writer: W,
    mut rx: mpsc::Receiver<PendingRequest>,
    pending: PendingMap,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // Register before writing so the reader can match the reply
        pending.lock().await.insert(req.req_id, req.reply);
        debug!("mpv writer: send req={} payload={}", req.req_id, req.payload.trim());
        if let Err(e) = writer.write_all(req.payload.as_bytes()).await {
            warn!("mpv writer: write error: {}", e);
            if let Some(tx) = pending.lock().await.remove(&req.req_id) {
                let _ = tx.send(Err(DecoderError::Ipc(format!("mpv write error: {}", e))));
            }
            break;
        }
    }
    debug!("mpv writer: task exiting");
}
