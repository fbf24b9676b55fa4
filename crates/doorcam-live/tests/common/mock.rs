#![allow(dead_code)]

//! In-memory door unit and decoder for driving `SessionCore` under paused
//! time.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use doorcam_live::command::{Ack, CommandChannel, CommandQueue};
use doorcam_live::decoder::{DecoderFactory, StreamDecoder};
use doorcam_live::error::{CommandError, DecoderError};
use doorcam_live::readiness::Settle;
use doorcam_live::session::{SessionCore, SessionHandle, SessionOptions};
use doorcam_proto::protocol::{Phase, SessionSnapshot, StreamAction};
use tokio::task::JoinHandle;

pub const STREAM_URL: &str = "http://door.test:8080/stream";

/// How the fake door unit answers `start_stream`.  `stop_stream` is always
/// acknowledged immediately.
#[derive(Debug, Clone)]
pub enum StartReply {
    Ack,
    AckAfter(Duration),
    Fail(CommandError),
    FailAfter(Duration, CommandError),
}

#[derive(Clone)]
pub struct FakeDevice {
    pub log: Arc<Mutex<Vec<StreamAction>>>,
    pub start_reply: Arc<Mutex<StartReply>>,
}

impl FakeDevice {
    pub fn new(start_reply: StartReply) -> Self {
        Self {
            log: Arc::new(Mutex::new(Vec::new())),
            start_reply: Arc::new(Mutex::new(start_reply)),
        }
    }

    pub fn commands(&self) -> Vec<StreamAction> {
        self.log.lock().unwrap().clone()
    }

    pub fn set_start_reply(&self, reply: StartReply) {
        *self.start_reply.lock().unwrap() = reply;
    }
}

impl CommandChannel for FakeDevice {
    fn send_command(
        &self,
        action: StreamAction,
    ) -> impl Future<Output = Result<Ack, CommandError>> + Send {
        self.log.lock().unwrap().push(action);
        let reply = match action {
            StreamAction::Start => self.start_reply.lock().unwrap().clone(),
            StreamAction::Stop => StartReply::Ack,
        };
        async move {
            let ack = Ack {
                action,
                streaming: Some(action == StreamAction::Start),
            };
            match reply {
                StartReply::Ack => Ok(ack),
                StartReply::AckAfter(delay) => {
                    tokio::time::sleep(delay).await;
                    Ok(ack)
                }
                StartReply::Fail(e) => Err(e),
                StartReply::FailAfter(delay, e) => {
                    tokio::time::sleep(delay).await;
                    Err(e)
                }
            }
        }
    }
}

/// Lifecycle counters shared by every decoder a factory hands out.
#[derive(Default)]
pub struct DecoderStats {
    pub created: AtomicUsize,
    pub initialized: AtomicUsize,
    pub played: AtomicUsize,
    pub disposed: AtomicUsize,
    pub alive: AtomicUsize,
    pub max_alive: AtomicUsize,
    pub looping: AtomicBool,
    pub urls: Mutex<Vec<String>>,
}

impl DecoderStats {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn disposed(&self) -> usize {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn alive(&self) -> usize {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn max_alive(&self) -> usize {
        self.max_alive.load(Ordering::SeqCst)
    }

    pub fn played(&self) -> usize {
        self.played.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
pub struct FakeFactory {
    pub stats: Arc<DecoderStats>,
    pub init_delay: Duration,
    pub init_error: Option<DecoderError>,
    pub play_error: Option<DecoderError>,
    pub dispose_delay: Duration,
}

impl FakeFactory {
    pub fn new() -> Self {
        Self {
            stats: Arc::new(DecoderStats::default()),
            init_delay: Duration::from_millis(200),
            init_error: None,
            play_error: None,
            dispose_delay: Duration::from_millis(50),
        }
    }

    pub fn with_init_delay(mut self, delay: Duration) -> Self {
        self.init_delay = delay;
        self
    }

    pub fn with_init_error(mut self, error: DecoderError) -> Self {
        self.init_error = Some(error);
        self
    }

    pub fn with_play_error(mut self, error: DecoderError) -> Self {
        self.play_error = Some(error);
        self
    }

    pub fn with_dispose_delay(mut self, delay: Duration) -> Self {
        self.dispose_delay = delay;
        self
    }
}

impl DecoderFactory for FakeFactory {
    type Decoder = FakeDecoder;

    fn create(&self, url: &str) -> FakeDecoder {
        let stats = &self.stats;
        stats.created.fetch_add(1, Ordering::SeqCst);
        let alive = stats.alive.fetch_add(1, Ordering::SeqCst) + 1;
        stats.max_alive.fetch_max(alive, Ordering::SeqCst);
        stats.urls.lock().unwrap().push(url.to_string());
        FakeDecoder {
            stats: Arc::clone(stats),
            init_delay: self.init_delay,
            init_error: self.init_error.clone(),
            play_error: self.play_error.clone(),
            dispose_delay: self.dispose_delay,
        }
    }
}

pub struct FakeDecoder {
    stats: Arc<DecoderStats>,
    init_delay: Duration,
    init_error: Option<DecoderError>,
    play_error: Option<DecoderError>,
    dispose_delay: Duration,
}

impl StreamDecoder for FakeDecoder {
    fn initialize(&mut self) -> impl Future<Output = Result<(), DecoderError>> + Send {
        let delay = self.init_delay;
        let error = self.init_error.clone();
        let stats = Arc::clone(&self.stats);
        async move {
            tokio::time::sleep(delay).await;
            match error {
                Some(e) => Err(e),
                None => {
                    stats.initialized.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }
        }
    }

    fn play(&mut self) -> impl Future<Output = Result<(), DecoderError>> + Send {
        let result = match &self.play_error {
            Some(e) => Err(e.clone()),
            None => {
                self.stats.played.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        };
        async move { result }
    }

    fn set_looping(&mut self, looping: bool) -> impl Future<Output = Result<(), DecoderError>> + Send {
        self.stats.looping.store(looping, Ordering::SeqCst);
        async { Ok(()) }
    }

    /// Counts as alive until the delay has passed, like a player process
    /// that takes a while to exit.
    fn dispose(self) -> impl Future<Output = ()> + Send {
        let stats = self.stats;
        let delay = self.dispose_delay;
        async move {
            tokio::time::sleep(delay).await;
            stats.disposed.fetch_add(1, Ordering::SeqCst);
            stats.alive.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

pub fn options() -> SessionOptions {
    SessionOptions {
        stream_url: STREAM_URL.to_string(),
        start_timeout: Duration::from_secs(15),
        teardown_grace: Duration::from_secs(3),
        command_drain: Duration::from_secs(10),
        settle: Settle::Fixed(Duration::from_secs(1)),
    }
}

pub fn spawn_session(device: &FakeDevice, factory: &FakeFactory) -> (SessionHandle, JoinHandle<()>) {
    SessionCore::spawn(
        CommandQueue::spawn(device.clone()),
        factory.clone(),
        options(),
    )
}

/// Wait (in virtual time) until the session reports `phase`.
pub async fn wait_for_phase(session: &SessionHandle, phase: Phase) -> SessionSnapshot {
    wait_until(session, |s| s.phase == phase).await
}

/// Wait (in virtual time) for the first snapshot matching `ready`.
pub async fn wait_until(
    session: &SessionHandle,
    ready: impl FnMut(&SessionSnapshot) -> bool,
) -> SessionSnapshot {
    let mut watch = session.watch();
    let waited = tokio::time::timeout(Duration::from_secs(120), watch.wait_for(ready))
        .await
        .unwrap_or_else(|_| panic!("session never got there; last {:?}", session.snapshot()));
    let snapshot = waited
        .expect("session core dropped its snapshot channel")
        .clone();
    snapshot
}

/// Let every pending timer and task run for `span` of virtual time.
pub async fn settle_for(span: Duration) {
    tokio::time::sleep(span).await;
}
