//! Persistence layer: libSQL-backed storage for jobs, task history and the journal.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::JobStore;
