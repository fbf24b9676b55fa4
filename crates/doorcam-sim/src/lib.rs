//! Door unit emulator.
//!
//! Serves the same control surface as the camera board at the door:
//!
//! ```text
//!   GET|POST /start_stream   {"status":"success","streaming":true}
//!   GET|POST /stop_stream    {"status":"success","streaming":false}
//!   GET      /stream         multipart/x-mixed-replace MJPEG, frames only
//!                            while streaming is on
//!   GET      /healthz        200
//! ```
//!
//! Every `/stream` client gets its own frame generator, like the board does.
//! Failure injection (`reject_commands`, `command_delay`) lets the session
//! be driven into its error paths.

use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use doorcam_proto::protocol::{DeviceReply, StreamAction, MJPEG_BOUNDARY};
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use tokio::net::TcpListener;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

const FRAME_WIDTH: u32 = 320;
const FRAME_HEIGHT: u32 = 240;
const JPEG_QUALITY: u8 = 75;

#[derive(Debug, Clone)]
pub struct SimOptions {
    /// Answer every command with `{"status":"error"}`.
    pub reject_commands: bool,
    /// Hold every command this long before answering.
    pub command_delay: Duration,
    pub fps: u32,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            reject_commands: false,
            command_delay: Duration::ZERO,
            fps: 15,
        }
    }
}

struct SimInner {
    options: SimOptions,
    streaming: AtomicBool,
    commands: Mutex<Vec<StreamAction>>,
}

/// Shared device state.  Clones see the same device.
#[derive(Clone)]
pub struct SimState {
    inner: Arc<SimInner>,
}

impl SimState {
    pub fn new(options: SimOptions) -> Self {
        Self {
            inner: Arc::new(SimInner {
                options,
                streaming: AtomicBool::new(false),
                commands: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.inner.streaming.load(Ordering::SeqCst)
    }

    /// Every command received so far, in arrival order.
    pub fn command_log(&self) -> Vec<StreamAction> {
        match self.inner.commands.lock() {
            Ok(log) => log.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn record(&self, action: StreamAction) {
        match self.inner.commands.lock() {
            Ok(mut log) => log.push(action),
            Err(poisoned) => poisoned.into_inner().push(action),
        }
    }

    async fn command(&self, action: StreamAction) -> Json<DeviceReply> {
        self.record(action);
        let delay = self.inner.options.command_delay;
        if !delay.is_zero() {
            debug!("sim: holding {} for {:?}", action, delay);
            tokio::time::sleep(delay).await;
        }
        if self.inner.options.reject_commands {
            warn!("sim: rejecting {}", action);
            return Json(DeviceReply::error(format!("{} refused by simulator", action)));
        }

        let streaming = action == StreamAction::Start;
        self.inner.streaming.store(streaming, Ordering::SeqCst);
        info!("sim: {} -> streaming={}", action, streaming);
        Json(DeviceReply::success(streaming))
    }
}

pub fn router(state: SimState) -> Router {
    Router::new()
        .route("/start_stream", get(start_stream).post(start_stream))
        .route("/stop_stream", get(stop_stream).post(stop_stream))
        .route("/stream", get(stream))
        .route("/healthz", get(healthz))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state)
}

/// Serve on an already-bound listener (port 0 works for tests).
pub fn start_server(listener: TcpListener, state: SimState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        match listener.local_addr() {
            Ok(addr) => info!("sim: door unit listening on http://{}", addr),
            Err(e) => warn!("sim: listener has no local address: {}", e),
        }
        if let Err(e) = axum::serve(listener, router(state)).await {
            error!("sim: server error: {}", e);
        }
    })
}

async fn start_stream(State(state): State<SimState>) -> Json<DeviceReply> {
    state.command(StreamAction::Start).await
}

async fn stop_stream(State(state): State<SimState>) -> Json<DeviceReply> {
    state.command(StreamAction::Stop).await
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn stream(State(state): State<SimState>) -> Response {
    info!("sim: client connected to /stream");
    let fps = state.inner.options.fps.max(1);
    let mut ticker = tokio::time::interval(Duration::from_secs(1) / fps);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let frames = futures_util::stream::unfold((state, ticker, 0u64), |(state, mut ticker, mut n)| async move {
        loop {
            ticker.tick().await;
            if !state.is_streaming() {
                continue;
            }
            n += 1;
            match encode_frame(n) {
                Ok(jpeg) => {
                    return Some((Ok::<_, Infallible>(multipart_part(&jpeg)), (state, ticker, n)));
                }
                Err(e) => warn!("sim: frame {} failed to encode: {}", n, e),
            }
        }
    });

    (
        [
            (
                header::CONTENT_TYPE,
                format!("multipart/x-mixed-replace; boundary={}", MJPEG_BOUNDARY),
            ),
            (
                header::CACHE_CONTROL,
                "no-cache, no-store, must-revalidate".to_string(),
            ),
        ],
        Body::from_stream(frames),
    )
        .into_response()
}

fn multipart_part(jpeg: &[u8]) -> Bytes {
    let mut part = Vec::with_capacity(jpeg.len() + 64);
    part.extend_from_slice(format!("--{}\r\nContent-Type: image/jpeg\r\n\r\n", MJPEG_BOUNDARY).as_bytes());
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    Bytes::from(part)
}

/// Test card: a colour gradient with a bar sweeping across it, so a viewer
/// can tell the feed is live.
pub fn encode_frame(n: u64) -> image::ImageResult<Vec<u8>> {
    let bar = (n * 8 % u64::from(FRAME_WIDTH)) as u32;
    let img = RgbImage::from_fn(FRAME_WIDTH, FRAME_HEIGHT, |x, y| {
        if x.abs_diff(bar) < 6 {
            Rgb([240, 240, 240])
        } else {
            Rgb([
                (x * 255 / FRAME_WIDTH) as u8,
                (y * 255 / FRAME_HEIGHT) as u8,
                (n % 256) as u8,
            ])
        }
    });

    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY).encode_image(&img)?;
    Ok(jpeg)
}
