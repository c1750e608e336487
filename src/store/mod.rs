//! Persistence layer: libSQL-backed storage for users, messages, and shortlists.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{AnsweredKey, Database, SentMessageQuery};
