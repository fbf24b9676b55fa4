//! Pure session transitions.
//!
//! `transition(session, event)` returns the next session plus the effects the
//! controller has to run.  Nothing here touches the network, the decoder or
//! the clock, so every ordering of intents and completions can be checked in
//! plain unit tests.
//!
//! ```text
//!   Idle ──expand──► Starting ──ready──► Playing
//!    ▲                 │  │                 │
//!    │          collapse  fail          collapse
//!    │                 ▼  ▼                 │
//!    └──settled── Stopping  Failed ◄────────┘(via Stopping)
//!                    ▲       │
//!                    └───────┘ expand → Starting, collapse → Idle
//! ```

use doorcam_proto::protocol::{Intent, Phase, SessionSnapshot};

use crate::error::StartError;

/// Closed set of session states.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum State {
    #[default]
    Idle,
    Starting,
    Playing,
    Stopping,
    Failed { error: String },
}

impl State {
    pub fn phase(&self) -> Phase {
        match self {
            State::Idle => Phase::Idle,
            State::Starting => Phase::Starting,
            State::Playing => Phase::Playing,
            State::Stopping => Phase::Stopping,
            State::Failed { .. } => Phase::Failed,
        }
    }
}

/// State plus the generation every in-flight operation is checked against.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Session {
    pub state: State,
    pub generation: u64,
    /// Start attempts launched but not yet reported back, current or not.
    pub attempts: u32,
    /// The stop issued on entering `Stopping` has not settled yet.
    pub stop_outstanding: bool,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    pub fn last_error(&self) -> Option<&str> {
        match &self.state {
            State::Failed { error } => Some(error),
            _ => None,
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            generation: self.generation,
            phase: self.phase(),
            last_error: self.last_error().map(str::to_string),
        }
    }

    /// Nothing launched by this session is still running.
    pub fn is_quiescent(&self) -> bool {
        self.attempts == 0 && !self.stop_outstanding
    }

    fn advance(&self, state: State) -> Session {
        Session {
            state,
            generation: self.generation + 1,
            ..self.clone()
        }
    }

    fn with_state(&self, state: State) -> Session {
        Session {
            state,
            ..self.clone()
        }
    }

    fn attempt_reported(&self) -> Session {
        Session {
            attempts: self.attempts.saturating_sub(1),
            ..self.clone()
        }
    }

    fn stopping(&self) -> Session {
        Session {
            stop_outstanding: true,
            ..self.advance(State::Stopping)
        }
    }
}

/// Everything that can move the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Intent(Intent),
    /// The start attempt of `generation` has an initialised decoder.
    StartSucceeded { generation: u64 },
    /// The start attempt of `generation` gave up; it already disposed
    /// whatever it created.
    StartFailed { generation: u64, error: StartError },
    /// The start attempt of `generation` saw the session move on.  Any
    /// decoder it created comes back with this event.
    StartAbandoned { generation: u64 },
    /// The adopted decoder of `generation` refused to play.
    PlaybackFailed { generation: u64, error: StartError },
    /// The remote stop issued at `generation` got an answer (or failed).
    StopSettled { generation: u64 },
    /// Host is going away.
    Teardown,
    /// Teardown ran out of time; whatever is still in flight was abandoned.
    GraceExpired,
}

/// Work the controller performs after a transition, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Dispatch the remote `Start` and launch the start attempt.
    BeginStart { generation: u64 },
    /// Take ownership of the decoder that came with the completion, then
    /// `play` and `set_looping(true)`.
    AdoptDecoder,
    /// Dispose the decoder that came with a completion nobody wants.
    DiscardArrival,
    /// Dispose the decoder the session owns.
    DisposeDecoder,
    /// Dispatch the remote `Stop`; report `StopSettled { generation }`.
    SendStop { generation: u64 },
    /// Push the new snapshot to observers.
    Publish,
}

pub fn transition(session: &Session, event: &Event) -> (Session, Vec<Effect>) {
    use Effect::*;

    match (&session.state, event) {
        // ── intents ───────────────────────────────────────────────────────────
        (State::Idle | State::Failed { .. } | State::Stopping, Event::Intent(Intent::Expand)) => {
            let next = Session {
                attempts: session.attempts + 1,
                stop_outstanding: false,
                ..session.advance(State::Starting)
            };
            let generation = next.generation;
            (next, vec![Publish, BeginStart { generation }])
        }
        (State::Starting | State::Playing, Event::Intent(Intent::Expand)) => {
            (session.clone(), Vec::new())
        }

        (State::Starting, Event::Intent(Intent::Collapse) | Event::Teardown) => {
            // The attempt sees the new generation and hands back whatever it
            // created; `Stopping` holds until it has.
            let next = session.stopping();
            let generation = next.generation;
            (next, vec![Publish, SendStop { generation }])
        }
        (State::Playing, Event::Intent(Intent::Collapse) | Event::Teardown) => {
            let next = session.stopping();
            let generation = next.generation;
            (next, vec![Publish, SendStop { generation }, DisposeDecoder])
        }
        (State::Failed { .. }, Event::Intent(Intent::Collapse) | Event::Teardown) => {
            let next = Session {
                stop_outstanding: false,
                ..session.advance(State::Stopping)
            };
            settle(next, vec![Publish])
        }
        (State::Idle | State::Stopping, Event::Intent(Intent::Collapse)) => {
            (session.clone(), Vec::new())
        }

        // ── completions ───────────────────────────────────────────────────────
        (State::Starting, Event::StartSucceeded { generation })
            if *generation == session.generation =>
        {
            (
                session.attempt_reported().with_state(State::Playing),
                vec![AdoptDecoder, Publish],
            )
        }
        (_, Event::StartSucceeded { .. } | Event::StartAbandoned { .. }) => {
            settle(session.attempt_reported(), vec![DiscardArrival])
        }

        (State::Starting, Event::StartFailed { generation, error })
            if *generation == session.generation =>
        {
            let next = session.attempt_reported().with_state(State::Failed {
                error: error.user_message(),
            });
            (
                next,
                vec![
                    Publish,
                    SendStop {
                        generation: session.generation,
                    },
                ],
            )
        }
        (_, Event::StartFailed { .. }) => settle(session.attempt_reported(), Vec::new()),

        (State::Playing, Event::PlaybackFailed { generation, error })
            if *generation == session.generation =>
        {
            let next = session.with_state(State::Failed {
                error: error.user_message(),
            });
            (
                next,
                vec![
                    DisposeDecoder,
                    SendStop {
                        generation: session.generation,
                    },
                    Publish,
                ],
            )
        }
        (_, Event::PlaybackFailed { .. }) => (session.clone(), Vec::new()),

        (State::Stopping, Event::StopSettled { generation })
            if *generation == session.generation =>
        {
            let next = Session {
                stop_outstanding: false,
                ..session.clone()
            };
            settle(next, Vec::new())
        }
        (_, Event::StopSettled { .. }) => (session.clone(), Vec::new()),

        // ── teardown ──────────────────────────────────────────────────────────
        // Already on the way down; the pending work finishes it.
        (State::Stopping | State::Idle, Event::Teardown) => (session.clone(), Vec::new()),

        (State::Idle, Event::GraceExpired) => (session.clone(), Vec::new()),
        (_, Event::GraceExpired) => {
            let next = Session {
                attempts: 0,
                stop_outstanding: false,
                ..session.advance(State::Idle)
            };
            (next, vec![Publish])
        }
    }
}

/// `Stopping` ends once nothing it waits on is left.
fn settle(session: Session, mut effects: Vec<Effect>) -> (Session, Vec<Effect>) {
    if session.state == State::Stopping && session.is_quiescent() {
        let idle = session.with_state(State::Idle);
        if !effects.contains(&Effect::Publish) {
            effects.push(Effect::Publish);
        }
        return (idle, effects);
    }
    (session, effects)
}
