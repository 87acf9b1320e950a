//! Node membership state machine.
//!
//! Transitions are driven by views and by state-transfer events. The
//! table below is deliberately strict: an illegal shift is a logic error
//! in the caller, surfaced as `InvalidTransition` instead of silently
//! corrupting the protocol state.

use std::fmt;
use std::sync::Mutex;

use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    /// Not part of a primary component.
    NonPrimary,
    /// Part of a primary component, membership not yet settled.
    Primary,
    /// Receiving a state transfer.
    Joiner,
    /// Serving a state transfer.
    Donor,
    /// State complete, not yet caught up with the replication stream.
    Joined,
    /// Fully caught up.
    Synced,
    /// Shutting down.
    Closing,
    Closed,
}

impl NodeState {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeState::NonPrimary => "NON_PRIMARY",
            NodeState::Primary => "PRIMARY",
            NodeState::Joiner => "JOINER",
            NodeState::Donor => "DONOR",
            NodeState::Joined => "JOINED",
            NodeState::Synced => "SYNCED",
            NodeState::Closing => "CLOSING",
            NodeState::Closed => "CLOSED",
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("invalid node state transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: NodeState,
    pub to: NodeState,
}

fn allowed(from: NodeState, to: NodeState) -> bool {
    use NodeState::*;
    // Loss of the primary component can hit at any point before shutdown.
    if to == NonPrimary {
        return !matches!(from, Closing | Closed);
    }
    if to == Closing {
        return from != Closed;
    }
    match (from, to) {
        (NonPrimary, Primary) => true,
        (Primary, Joiner) | (Primary, Donor) | (Primary, Joined) => true,
        (Joiner, Joined) => true,
        (Donor, Joined) => true,
        (Joined, Synced) | (Joined, Donor) => true,
        (Synced, Donor) => true,
        (Closing, Closed) => true,
        _ => false,
    }
}

pub struct StateMachine {
    current: Mutex<NodeState>,
}

impl StateMachine {
    pub fn new(initial: NodeState) -> Self {
        Self {
            current: Mutex::new(initial),
        }
    }

    pub fn get(&self) -> NodeState {
        *self.current.lock().expect("node state lock")
    }

    /// Shift to `next`, returning the previous state. Shifting to the
    /// current state is a no-op.
    pub fn shift_to(&self, next: NodeState) -> Result<NodeState, InvalidTransition> {
        let mut current = self.current.lock().expect("node state lock");
        let from = *current;
        if from == next {
            return Ok(from);
        }
        if !allowed(from, next) {
            return Err(InvalidTransition { from, to: next });
        }
        tracing::info!("shifting node state {from} -> {next}");
        *current = next;
        Ok(from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joiner_lifecycle() {
        let sm = StateMachine::new(NodeState::NonPrimary);
        sm.shift_to(NodeState::Primary).unwrap();
        sm.shift_to(NodeState::Joiner).unwrap();
        sm.shift_to(NodeState::Joined).unwrap();
        sm.shift_to(NodeState::Synced).unwrap();
        assert_eq!(sm.get(), NodeState::Synced);
    }

    #[test]
    fn donor_lifecycle_from_synced() {
        let sm = StateMachine::new(NodeState::Synced);
        sm.shift_to(NodeState::Donor).unwrap();
        sm.shift_to(NodeState::Joined).unwrap();
        sm.shift_to(NodeState::Synced).unwrap();
        assert_eq!(sm.get(), NodeState::Synced);
    }

    #[test]
    fn joiner_cannot_become_donor() {
        let sm = StateMachine::new(NodeState::Joiner);
        let err = sm.shift_to(NodeState::Donor).unwrap_err();
        assert_eq!(
            err,
            InvalidTransition {
                from: NodeState::Joiner,
                to: NodeState::Donor
            }
        );
        assert_eq!(sm.get(), NodeState::Joiner);
    }

    #[test]
    fn primary_loss_from_any_live_state() {
        for from in [
            NodeState::Primary,
            NodeState::Joiner,
            NodeState::Donor,
            NodeState::Joined,
            NodeState::Synced,
        ] {
            let sm = StateMachine::new(from);
            sm.shift_to(NodeState::NonPrimary).unwrap();
        }
        let sm = StateMachine::new(NodeState::Closing);
        assert!(sm.shift_to(NodeState::NonPrimary).is_err());
    }

    #[test]
    fn same_state_shift_is_noop() {
        let sm = StateMachine::new(NodeState::Synced);
        assert_eq!(sm.shift_to(NodeState::Synced).unwrap(), NodeState::Synced);
    }
}
