//! Headless live-view panel.
//!
//! Turns header taps into intents and renders session snapshots into a one
//! line status.  Only reads snapshots; never talks to the door unit or the
//! decoder.

use doorcam_proto::protocol::{Intent, Phase, SessionSnapshot};

const SPINNER_FRAMES: &[&str] = &["⣾", "⣽", "⣻", "⢿", "⡿", "⣟", "⣯", "⣷"];

/// What the header icon shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Indicator {
    /// Starting or stopping.
    Spinner,
    /// Feed is playing.
    Live,
    /// Nothing running (idle or failed).
    Inert,
}

impl Indicator {
    pub fn for_phase(phase: Phase) -> Self {
        if phase.is_transitional() {
            Indicator::Spinner
        } else if phase == Phase::Playing {
            Indicator::Live
        } else {
            Indicator::Inert
        }
    }

    fn glyph(&self, tick: usize) -> &'static str {
        match self {
            Indicator::Spinner => SPINNER_FRAMES[tick % SPINNER_FRAMES.len()],
            Indicator::Live => "●",
            Indicator::Inert => "○",
        }
    }
}

/// Render model for one snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanelView {
    pub indicator: Indicator,
    pub phase: Phase,
    /// Shown only next to an inert icon.
    pub error: Option<String>,
}

impl PanelView {
    pub fn from_snapshot(snapshot: &SessionSnapshot) -> Self {
        let indicator = Indicator::for_phase(snapshot.phase);
        let error = match indicator {
            Indicator::Inert => snapshot.last_error.clone(),
            _ => None,
        };
        Self {
            indicator,
            phase: snapshot.phase,
            error,
        }
    }

    /// `tick` advances the spinner frame.
    pub fn render(&self, tick: usize) -> String {
        let mut line = format!(
            "[door camera] {} {}",
            self.indicator.glyph(tick),
            self.phase.label()
        );
        if let Some(error) = &self.error {
            line.push_str(" - ");
            line.push_str(error);
        }
        line
    }
}

/// Expanded/collapsed state of the panel as the user sees it.
#[derive(Debug, Default)]
pub struct Panel {
    expanded: bool,
}

impl Panel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_expanded(&self) -> bool {
        self.expanded
    }

    /// Header tap: collapsed panels expand, expanded ones collapse.
    pub fn tap(&mut self) -> Intent {
        if self.expanded {
            self.close()
        } else {
            self.open()
        }
    }

    pub fn open(&mut self) -> Intent {
        self.expanded = true;
        Intent::Expand
    }

    pub fn close(&mut self) -> Intent {
        self.expanded = false;
        Intent::Collapse
    }
}
