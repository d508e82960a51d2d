//! PlateLog: offline-first meal logging.
//!
//! The client records meals into a local SQLite database and a durable
//! mutation queue; a background processor drains the queue to the sync
//! server whenever connectivity allows. The server applies mutations with
//! optimistic concurrency (last write in, with stale writes rejected and
//! reconciled server-wins on the client).

pub mod config;
pub mod db;
pub mod models;
pub mod server;
pub mod sync;
