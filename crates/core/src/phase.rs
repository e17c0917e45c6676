//! Scan cycle progress.
//!
//! The cycle phase only moves forward until the next cycle begins; protocol
//! phases are set by their tasks and stay put once terminal.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;

/// Phase of the current (or last) scan cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    #[default]
    Idle,
    Discovering,
    Evaluating,
    /// At least one eligible position is being quoted
    Quoting,
    Ranking,
    Completed,
    Canceled,
}

impl CyclePhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Canceled)
    }
}

/// Phase of one protocol within a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolPhase {
    #[default]
    Idle,
    Discovering,
    Evaluating,
    Quoting,
    Completed,
    Unavailable,
    DeadlineExceeded,
}

impl ProtocolPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Unavailable | Self::DeadlineExceeded)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PhaseSnapshot {
    pub cycle: CyclePhase,
    pub protocols: BTreeMap<String, ProtocolPhase>,
}

/// Shared view of cycle progress, read by `status()`.
#[derive(Debug, Default)]
pub struct PhaseTracker {
    state: RwLock<PhaseSnapshot>,
}

impl PhaseTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset for a new cycle over `protocols`.
    pub fn begin<'a>(&self, protocols: impl IntoIterator<Item = &'a String>) {
        let mut state = self.state.write();
        state.cycle = CyclePhase::Discovering;
        state.protocols = protocols
            .into_iter()
            .map(|p| (p.clone(), ProtocolPhase::Discovering))
            .collect();
    }

    /// Move the cycle forward. Earlier phases are ignored.
    pub fn advance(&self, phase: CyclePhase) {
        let mut state = self.state.write();
        if phase > state.cycle && !state.cycle.is_terminal() {
            state.cycle = phase;
        }
    }

    /// Set a protocol's phase and advance the cycle to match. A protocol in a
    /// terminal phase keeps it until the next cycle.
    pub fn set_protocol(&self, protocol: &str, phase: ProtocolPhase) {
        let mut state = self.state.write();
        match state.protocols.get_mut(protocol) {
            Some(current) if current.is_terminal() => return,
            Some(current) => *current = phase,
            None => {}
        }
        let cycle = match phase {
            ProtocolPhase::Evaluating => CyclePhase::Evaluating,
            ProtocolPhase::Quoting => CyclePhase::Quoting,
            _ => return,
        };
        if cycle > state.cycle && !state.cycle.is_terminal() {
            state.cycle = cycle;
        }
    }

    pub fn cycle(&self) -> CyclePhase {
        self.state.read().cycle
    }

    pub fn protocol(&self, protocol: &str) -> Option<ProtocolPhase> {
        self.state.read().protocols.get(protocol).copied()
    }

    pub fn snapshot(&self) -> PhaseSnapshot {
        self.state.read().clone()
    }
}
