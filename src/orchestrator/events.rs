//! State-transition events for external observers.
//!
//! The engine core stays headless: every run and phase transition is
//! emitted on a broadcast channel, and dashboards or CLIs subscribe
//! without the orchestrator knowing they exist. Emission never blocks and
//! never fails the engine; an event with no subscribers is simply dropped.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::run::{PhaseState, RunState};

/// One observable transition.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StateEvent {
    RunStarted {
        run_id: Uuid,
    },
    RunFinished {
        run_id: Uuid,
        state: RunState,
    },
    PhaseTransition {
        run_id: Uuid,
        phase_id: String,
        state: PhaseState,
    },
}

/// Broadcast fan-out for state events.
#[derive(Debug)]
pub struct EventBus {
    tx: broadcast::Sender<StateEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.tx.subscribe()
    }

    /// Emit an event. Lagging or absent subscribers never affect the run.
    pub fn emit(&self, event: StateEvent) {
        debug!(?event, "state event");
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
