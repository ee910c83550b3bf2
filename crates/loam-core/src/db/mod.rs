//! Database layer for loam

mod connection;
mod migrations;
mod store;

pub use connection::Database;
pub use store::{LocalStore, QueryWatch, RowMap, StoreTxn};
