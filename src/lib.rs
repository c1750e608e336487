//! fundmail: inbound reply reconciliation and outbound delivery for the
//! fundraising CRM.

pub mod api;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod ingest;
pub mod mail;
pub mod messages;
pub mod oauth;
pub mod queue;
pub mod store;
pub mod transport;
