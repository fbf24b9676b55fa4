//! SessionCore: single-owner event loop for the live-view session.
//!
//! Owns the [`Session`] state, the adopted decoder and the command queue;
//! no other task touches them.  Intents arrive from [`SessionHandle`]s,
//! completions from the tasks the core spawns.  Each one runs through
//! [`transition`] and the resulting effects are executed here, in order.
//!
//! Start attempts run in their own task:
//!
//! ```text
//!   ack of remote Start ─► settle ─► lease decoder slot ─► initialize
//!        (all under one start deadline, each step raced against the
//!         session generation moving on)
//! ```
//!
//! An attempt that fails disposes whatever it created before it reports.
//! A ready or superseded attempt hands its decoder back to the core, so
//! `Stopping` only ends once every decoder of the session is gone.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use doorcam_proto::config::Config;
use doorcam_proto::protocol::{Intent, Phase, SessionSnapshot, StreamAction};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::command::{Ack, CommandQueue, PendingReply};
use crate::decoder::{DecoderFactory, DecoderLease, DecoderSlot, StreamDecoder};
use crate::error::{CommandError, DecoderError, SessionClosed, StartError};
use crate::machine::{transition, Effect, Event, Session};
use crate::readiness::Settle;

// ── options ───────────────────────────────────────────────────────────────────

pub struct SessionOptions {
    pub stream_url: String,
    /// Bound on ack + settle + initialize.
    pub start_timeout: Duration,
    /// Bound on waiting for in-flight work during teardown.
    pub teardown_grace: Duration,
    /// Bound on flushing queued remote commands once the session is down.
    pub command_drain: Duration,
    pub settle: Settle,
}

impl SessionOptions {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let stream_url = config.device.stream_url();
        Ok(Self {
            settle: Settle::from_config(&config.session, &stream_url)?,
            start_timeout: config.session.start_timeout(),
            teardown_grace: config.session.teardown_grace(),
            // A start still in flight plus the stop queued behind it.
            command_drain: config.device.command_timeout() * 2,
            stream_url,
        })
    }
}

// ── handle ────────────────────────────────────────────────────────────────────

enum Control {
    Intent(Intent),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable front door to a running [`SessionCore`].
#[derive(Clone)]
pub struct SessionHandle {
    control_tx: mpsc::Sender<Control>,
    snapshot_rx: watch::Receiver<SessionSnapshot>,
    updates_tx: broadcast::Sender<SessionSnapshot>,
}

impl SessionHandle {
    pub async fn send_intent(&self, intent: Intent) -> Result<(), SessionClosed> {
        self.control_tx
            .send(Control::Intent(intent))
            .await
            .map_err(|_| SessionClosed)
    }

    pub async fn expand(&self) -> Result<(), SessionClosed> {
        self.send_intent(Intent::Expand).await
    }

    pub async fn collapse(&self) -> Result<(), SessionClosed> {
        self.send_intent(Intent::Collapse).await
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Receiver that always holds the latest snapshot.
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot_rx.clone()
    }

    /// Every published snapshot, in order.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionSnapshot> {
        self.updates_tx.subscribe()
    }

    /// Tear the session down and wait until the core has finished.
    pub async fn shutdown(&self) -> Result<(), SessionClosed> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.control_tx
            .send(Control::Shutdown(ack_tx))
            .await
            .map_err(|_| SessionClosed)?;
        ack_rx.await.map_err(|_| SessionClosed)
    }
}

// ── completions ───────────────────────────────────────────────────────────────

enum Completion<D: StreamDecoder> {
    Started {
        generation: u64,
        lease: DecoderLease<D>,
    },
    StartFailed {
        generation: u64,
        error: StartError,
    },
    Abandoned {
        generation: u64,
        lease: Option<DecoderLease<D>>,
    },
    StopSettled {
        generation: u64,
        result: Result<Ack, CommandError>,
    },
}

// ── core ──────────────────────────────────────────────────────────────────────

pub struct SessionCore<F: DecoderFactory> {
    session: Session,
    options: SessionOptions,
    commands: CommandQueue,
    factory: Arc<F>,
    slot: DecoderSlot,
    /// Adopted decoder; `Some` only while `Playing`.
    decoder: Option<DecoderLease<F::Decoder>>,
    generation_tx: watch::Sender<u64>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    updates_tx: broadcast::Sender<SessionSnapshot>,
    completion_tx: mpsc::Sender<Completion<F::Decoder>>,
    /// Start attempts and stop waiters.
    tasks: JoinSet<()>,
}

impl<F: DecoderFactory> SessionCore<F> {
    /// Start the core on the current runtime.  The returned join handle
    /// resolves after teardown, which runs on `shutdown()` or once every
    /// handle is dropped.
    pub fn spawn(
        commands: CommandQueue,
        factory: F,
        options: SessionOptions,
    ) -> (SessionHandle, JoinHandle<()>) {
        let session = Session::new();
        let (control_tx, control_rx) = mpsc::channel(32);
        let (completion_tx, completion_rx) = mpsc::channel(32);
        let (snapshot_tx, snapshot_rx) = watch::channel(session.snapshot());
        let (updates_tx, _) = broadcast::channel(64);
        let (generation_tx, _) = watch::channel(session.generation);

        let core = Self {
            session,
            options,
            commands,
            factory: Arc::new(factory),
            slot: DecoderSlot::new(),
            decoder: None,
            generation_tx,
            snapshot_tx,
            updates_tx: updates_tx.clone(),
            completion_tx,
            tasks: JoinSet::new(),
        };
        let handle = SessionHandle {
            control_tx,
            snapshot_rx,
            updates_tx,
        };
        let task = tokio::spawn(core.run(control_rx, completion_rx));
        (handle, task)
    }

    async fn run(
        mut self,
        mut control_rx: mpsc::Receiver<Control>,
        mut completion_rx: mpsc::Receiver<Completion<F::Decoder>>,
    ) {
        info!("session: event loop started");

        let shutdown_ack = loop {
            tokio::select! {
                control = control_rx.recv() => match control {
                    Some(Control::Intent(intent)) => {
                        debug!("session: intent {:?}", intent);
                        self.apply(Event::Intent(intent), None).await;
                    }
                    Some(Control::Shutdown(ack)) => {
                        info!("session: shutdown requested");
                        break Some(ack);
                    }
                    None => {
                        info!("session: all handles dropped");
                        break None;
                    }
                },
                Some(completion) = completion_rx.recv() => {
                    self.on_completion(completion).await;
                }
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(e) = joined {
                        warn!("session: background task ended abnormally: {}", e);
                    }
                }
            }
        };

        self.teardown(&mut completion_rx).await;
        if !self.commands.drain(self.options.command_drain).await {
            warn!("session: remote stop may not have reached the door unit");
        }
        if let Some(ack) = shutdown_ack {
            let _ = ack.send(());
        }
        info!("session: event loop stopped");
    }

    async fn on_completion(&mut self, completion: Completion<F::Decoder>) {
        match completion {
            Completion::Started { generation, lease } => {
                self.apply(Event::StartSucceeded { generation }, Some(lease))
                    .await;
            }
            Completion::StartFailed { generation, error } => {
                self.apply(Event::StartFailed { generation, error }, None)
                    .await;
            }
            Completion::Abandoned { generation, lease } => {
                self.apply(Event::StartAbandoned { generation }, lease).await;
            }
            Completion::StopSettled { generation, result } => {
                if let Err(e) = result {
                    debug!("session: stop for generation {} failed: {}", generation, e);
                }
                self.apply(Event::StopSettled { generation }, None).await;
            }
        }
    }

    /// Run `event` (and any follow-up it causes) through the machine.
    async fn apply(&mut self, event: Event, mut arrival: Option<DecoderLease<F::Decoder>>) {
        let mut pending = VecDeque::from([event]);

        while let Some(event) = pending.pop_front() {
            let (next, effects) = transition(&self.session, &event);
            if next.phase() != self.session.phase() {
                info!(
                    "session: {} -> {} (generation {})",
                    self.session.phase().label(),
                    next.phase().label(),
                    next.generation
                );
            } else if effects.is_empty() {
                debug!(
                    "session: {:?} ignored while {}",
                    event,
                    self.session.phase().label()
                );
            }
            self.session = next;
            // Published before any effect runs so a freshly spawned attempt
            // never sees the previous generation.
            self.generation_tx.send_replace(self.session.generation);

            for effect in effects {
                if let Some(follow_up) = self.execute(effect, &mut arrival).await {
                    pending.push_back(follow_up);
                }
            }
        }

        if let Some(lease) = arrival {
            warn!("session: completion decoder left unclaimed, disposing");
            lease.dispose().await;
        }
    }

    async fn execute(
        &mut self,
        effect: Effect,
        arrival: &mut Option<DecoderLease<F::Decoder>>,
    ) -> Option<Event> {
        match effect {
            Effect::Publish => self.publish(),

            Effect::BeginStart { generation } => self.begin_start(generation).await,

            Effect::AdoptDecoder => {
                let Some(mut lease) = arrival.take() else {
                    warn!("session: ready event carried no decoder");
                    return None;
                };
                let started = start_playback(&mut lease).await;
                self.decoder = Some(lease);
                if let Err(e) = started {
                    warn!("session: playback did not begin: {}", e);
                    return Some(Event::PlaybackFailed {
                        generation: self.session.generation,
                        error: e.into(),
                    });
                }
            }

            Effect::DiscardArrival => {
                if let Some(lease) = arrival.take() {
                    debug!("session: disposing decoder of a superseded attempt");
                    lease.dispose().await;
                }
            }

            Effect::DisposeDecoder => {
                if let Some(lease) = self.decoder.take() {
                    lease.dispose().await;
                }
            }

            Effect::SendStop { generation } => {
                let reply = self.commands.dispatch(StreamAction::Stop).await;
                let completion_tx = self.completion_tx.clone();
                self.tasks.spawn(async move {
                    let result = reply.wait().await;
                    let _ = completion_tx
                        .send(Completion::StopSettled { generation, result })
                        .await;
                });
            }
        }
        None
    }

    async fn begin_start(&mut self, generation: u64) {
        let reply = self.commands.dispatch(StreamAction::Start).await;
        let attempt = StartAttempt {
            generation,
            current: self.generation_tx.subscribe(),
            factory: Arc::clone(&self.factory),
            slot: self.slot.clone(),
            settle: self.options.settle.clone(),
            url: self.options.stream_url.clone(),
            start_timeout: self.options.start_timeout,
            completion_tx: self.completion_tx.clone(),
        };
        self.tasks.spawn(attempt.run(reply));
    }

    fn publish(&mut self) {
        let snapshot = self.session.snapshot();
        self.snapshot_tx.send_replace(snapshot.clone());
        // No subscribers is fine.
        let _ = self.updates_tx.send(snapshot);
    }

    /// Force the session down, then give in-flight work `teardown_grace` to
    /// finish (stops to settle, attempts to hand back their decoders).
    async fn teardown(&mut self, completion_rx: &mut mpsc::Receiver<Completion<F::Decoder>>) {
        info!(
            "session: teardown from {} with {} task(s) in flight",
            self.session.phase().label(),
            self.tasks.len()
        );
        self.apply(Event::Teardown, None).await;

        let deadline = Instant::now() + self.options.teardown_grace;
        while !self.tasks.is_empty() {
            tokio::select! {
                Some(completion) = completion_rx.recv() => {
                    self.on_completion(completion).await;
                }
                joined = self.tasks.join_next() => {
                    if let Some(Err(e)) = joined {
                        warn!("session: background task ended abnormally: {}", e);
                    }
                }
                _ = sleep_until(deadline) => {
                    warn!(
                        "session: teardown grace expired, abandoning {} task(s)",
                        self.tasks.len()
                    );
                    self.tasks.abort_all();
                    break;
                }
            }
        }

        // Completions that landed after their task was joined.
        while let Ok(completion) = completion_rx.try_recv() {
            self.on_completion(completion).await;
        }

        if self.session.phase() != Phase::Idle {
            self.apply(Event::GraceExpired, None).await;
        }
        if let Some(lease) = self.decoder.take() {
            lease.dispose().await;
        }
    }
}

async fn start_playback<D: StreamDecoder>(lease: &mut DecoderLease<D>) -> Result<(), DecoderError> {
    lease.play().await?;
    lease.set_looping(true).await
}

// ── start attempt ─────────────────────────────────────────────────────────────

enum Outcome<D: StreamDecoder> {
    Ready(DecoderLease<D>),
    Failed(StartError),
    Superseded(Option<DecoderLease<D>>),
}

struct StartAttempt<F: DecoderFactory> {
    generation: u64,
    current: watch::Receiver<u64>,
    factory: Arc<F>,
    slot: DecoderSlot,
    settle: Settle,
    url: String,
    start_timeout: Duration,
    completion_tx: mpsc::Sender<Completion<F::Decoder>>,
}

impl<F: DecoderFactory> StartAttempt<F> {
    async fn run(mut self, reply: PendingReply) {
        let generation = self.generation;
        let completion = match self.attempt(reply).await {
            Outcome::Ready(lease) => Completion::Started { generation, lease },
            Outcome::Failed(error) => {
                warn!("session: start attempt {} failed: {}", generation, error);
                Completion::StartFailed { generation, error }
            }
            Outcome::Superseded(lease) => {
                debug!("session: start attempt {} superseded", generation);
                Completion::Abandoned { generation, lease }
            }
        };

        if let Err(mpsc::error::SendError(completion)) = self.completion_tx.send(completion).await
        {
            match completion {
                Completion::Started { lease, .. }
                | Completion::Abandoned {
                    lease: Some(lease), ..
                } => lease.dispose().await,
                _ => {}
            }
        }
    }

    async fn attempt(&mut self, reply: PendingReply) -> Outcome<F::Decoder> {
        let generation = self.generation;
        let deadline = Instant::now() + self.start_timeout;

        let acked = tokio::select! {
            _ = superseded(&mut self.current, generation) => return Outcome::Superseded(None),
            acked = timeout_at(deadline, reply.wait()) => acked,
        };
        match acked {
            Err(_) => return Outcome::Failed(CommandError::Timeout(self.start_timeout).into()),
            Ok(Err(e)) => return Outcome::Failed(e.into()),
            Ok(Ok(ack)) => debug!(
                "session: attempt {} acked (streaming={:?})",
                generation, ack.streaming
            ),
        }

        // From here on the remote side is up; running out of time is the
        // feed's fault.
        let start_timeout = self.start_timeout;
        let timed_out = move || Outcome::Failed(DecoderError::InitTimeout(start_timeout).into());

        let settled = tokio::select! {
            _ = superseded(&mut self.current, generation) => return Outcome::Superseded(None),
            settled = timeout_at(deadline, self.settle.wait()) => settled,
        };
        if settled.is_err() {
            return timed_out();
        }

        let leased = tokio::select! {
            _ = superseded(&mut self.current, generation) => return Outcome::Superseded(None),
            leased = timeout_at(deadline, self.slot.lease(&*self.factory, &self.url)) => leased,
        };
        let mut lease = match leased {
            Err(_) => return timed_out(),
            Ok(Err(e)) => return Outcome::Failed(e.into()),
            Ok(Ok(lease)) => lease,
        };

        let initialized = tokio::select! {
            _ = superseded(&mut self.current, generation) => None,
            initialized = timeout_at(deadline, lease.initialize()) => Some(initialized),
        };
        match initialized {
            Some(Ok(Ok(()))) => Outcome::Ready(lease),
            Some(Ok(Err(e))) => {
                lease.dispose().await;
                Outcome::Failed(e.into())
            }
            Some(Err(_)) => {
                lease.dispose().await;
                timed_out()
            }
            None => Outcome::Superseded(Some(lease)),
        }
    }
}

/// Resolves once the session has moved past `generation` (or the core is
/// gone).
async fn superseded(current: &mut watch::Receiver<u64>, generation: u64) {
    let _ = current.wait_for(|now| *now != generation).await;
}
