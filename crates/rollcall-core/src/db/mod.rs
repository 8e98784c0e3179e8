//! Durable local storage on libSQL

mod backend;
mod connection;
mod migrations;

pub use backend::LibSqlBackend;
pub use connection::Database;
