//! Outbound delivery: scheduling, the send worker, and per-job dispatch.

pub mod dispatcher;
pub mod schedule;
pub mod worker;

pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use schedule::{Scheduler, spawn_removal_listener};
pub use worker::spawn_dispatch_worker;
