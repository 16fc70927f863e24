//! Agent runtime — owns all shared state and drives the check-in loop.

mod agent_loop;
mod dispatch;

pub use agent_loop::{Agent, ExitReason};
pub use dispatch::Disposition;
