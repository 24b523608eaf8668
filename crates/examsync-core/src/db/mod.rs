//! Local durable store for examsync

mod connection;
mod migrations;
mod service;
mod store;

pub use connection::Database;
pub use service::StoreService;
pub use store::{LocalStore, SqliteLocalStore};
