//! Link Scheduler
//!
//! Per-session state deciding what the single write slot of the link is used
//! for next. Critical commands drain first, in submission order; movement is
//! a single "latest wins" slot behind them.

use std::collections::VecDeque;

use crate::codec::{CommandKind, EncodedCommand};
use crate::intent::Movement;

/// Operator inputs that outlive a connection session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlInputs {
    /// Latest movement requested by the control surface
    pub target: Option<Movement>,
    /// Whether movement may be written at all (manual control on)
    pub movement_enabled: bool,
}

impl ControlInputs {
    /// Store a new target, returning whether it differs from the previous one
    pub fn set_target(&mut self, movement: Movement) -> bool {
        let changed = self.target != Some(movement);
        self.target = Some(movement);
        changed
    }
}

/// The write currently occupying the link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InFlight {
    Command(CommandKind),
    Movement(Movement),
}

/// Decision of a single tick
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Write the head of the critical queue
    Critical(EncodedCommand),
    /// Write this movement sample
    Movement(Movement),
    /// A write is already outstanding
    Busy,
    /// Nothing to send
    Idle,
}

/// State of one connection session
#[derive(Debug, Default)]
pub struct LinkState {
    in_flight: Option<InFlight>,
    critical_queue: VecDeque<EncodedCommand>,
    last_sent: Option<Movement>,
    pending_movement: bool,
}

impl LinkState {
    /// Fresh state for a newly connected link
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_flight(&self) -> Option<InFlight> {
        self.in_flight
    }

    pub fn queued_critical(&self) -> usize {
        self.critical_queue.len()
    }

    pub fn last_sent(&self) -> Option<Movement> {
        self.last_sent
    }

    pub fn pending_movement(&self) -> bool {
        self.pending_movement
    }

    /// Append a critical command to the tail of the queue
    pub fn enqueue_critical(&mut self, command: EncodedCommand) {
        self.critical_queue.push_back(command);
    }

    /// Ask for a movement write even if the target equals what was last sent
    pub fn request_movement(&mut self) {
        self.pending_movement = true;
    }

    fn movement_due(&self, inputs: &ControlInputs) -> Option<Movement> {
        if !inputs.movement_enabled {
            return None;
        }
        let target = inputs.target?;
        if self.last_sent != Some(target) || self.pending_movement {
            Some(target)
        } else {
            None
        }
    }

    /// Evaluate one tick. Any write returned here occupies the link until
    /// [`complete`](Self::complete) is called.
    pub fn next_step(&mut self, inputs: &ControlInputs) -> Step {
        if self.in_flight.is_some() {
            return Step::Busy;
        }

        if let Some(command) = self.critical_queue.pop_front() {
            self.in_flight = Some(InFlight::Command(command.kind()));
            return Step::Critical(command);
        }

        match self.movement_due(inputs) {
            Some(movement) => {
                // Cleared on attempt so a failing link does not spin
                self.pending_movement = false;
                self.in_flight = Some(InFlight::Movement(movement));
                Step::Movement(movement)
            }
            None => Step::Idle,
        }
    }

    /// Record completion of the outstanding write, successful or not
    pub fn complete(&mut self) -> Option<InFlight> {
        let finished = self.in_flight.take()?;
        match finished {
            InFlight::Command(kind) if kind.is_mode_change() => {
                self.last_sent = None;
            }
            InFlight::Command(_) => {}
            InFlight::Movement(movement) => {
                self.last_sent = Some(movement);
            }
        }
        Some(finished)
    }
}
