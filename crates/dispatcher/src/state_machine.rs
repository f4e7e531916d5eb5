use bulksend_core::error::{DispatchError, DispatchResult};
use bulksend_core::types::CampaignStatus;
use serde::Serialize;

/// Describes a single valid campaign status transition.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StateTransition {
    pub from: CampaignStatus,
    pub to: CampaignStatus,
    pub trigger: &'static str,
}

const TRANSITIONS: &[StateTransition] = &[
    // Draft ->
    StateTransition {
        from: CampaignStatus::Draft,
        to: CampaignStatus::Running,
        trigger: "start",
    },
    StateTransition {
        from: CampaignStatus::Draft,
        to: CampaignStatus::Completed,
        trigger: "nothing_pending",
    },
    // Running ->
    StateTransition {
        from: CampaignStatus::Running,
        to: CampaignStatus::Paused,
        trigger: "pause",
    },
    StateTransition {
        from: CampaignStatus::Running,
        to: CampaignStatus::Completed,
        trigger: "all_recipients_processed",
    },
    // A persisted `running` with no live loop is left over from a crash.
    StateTransition {
        from: CampaignStatus::Running,
        to: CampaignStatus::Running,
        trigger: "recover",
    },
    // Paused ->
    StateTransition {
        from: CampaignStatus::Paused,
        to: CampaignStatus::Running,
        trigger: "resume",
    },
    StateTransition {
        from: CampaignStatus::Paused,
        to: CampaignStatus::Completed,
        trigger: "nothing_pending",
    },
];

/// Guards campaign lifecycle by enforcing a finite set of valid transitions.
/// `completed` and `cancelled` have no outgoing edges; nothing enters
/// `cancelled` yet.
#[derive(Debug, Clone)]
pub struct CampaignStateMachine {
    pub state: CampaignStatus,
}

impl CampaignStateMachine {
    pub fn new(state: CampaignStatus) -> Self {
        Self { state }
    }

    pub fn can_transition(from: CampaignStatus, to: CampaignStatus) -> bool {
        TRANSITIONS.iter().any(|t| t.from == from && t.to == to)
    }

    /// The trigger name of the edge `from -> to`, if it exists.
    pub fn trigger(from: CampaignStatus, to: CampaignStatus) -> Option<&'static str> {
        TRANSITIONS
            .iter()
            .find(|t| t.from == from && t.to == to)
            .map(|t| t.trigger)
    }

    /// Moves to `to`, or fails with `InvalidTransition`.
    pub fn transition(&mut self, to: CampaignStatus) -> DispatchResult<()> {
        if Self::can_transition(self.state, to) {
            self.state = to;
            Ok(())
        } else {
            Err(DispatchError::InvalidTransition {
                from: self.state,
                to,
            })
        }
    }
}
