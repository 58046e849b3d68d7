//! The protocol state machine: event processor, peer-connection registry,
//! address cache and transfer manager.

pub mod addrmgr;
pub mod event;
pub mod handler;
pub mod output;
pub mod peermgr;
pub mod transfer;
pub mod transfermgr;

pub use event::{Command, Event, Notification};
pub use handler::StateMachine;
pub use output::{Io, Outbox, TimerKey};
