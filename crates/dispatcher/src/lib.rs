//! Bulk campaign dispatcher: drives a campaign's pending recipients
//! through one outbound channel with pacing, pause/resume and crash-safe
//! per-recipient persistence.

pub mod dispatcher;
mod log_buffer;
mod retry;
mod send_loop;
pub mod state_machine;

pub use dispatcher::CampaignDispatcher;
pub use send_loop::LoopOutcome;
pub use state_machine::CampaignStateMachine;
