//! `sdig`: an embedded SQLite access layer.
//!
//! A [`Session`] owns one connection and compiles SQL into a [`Statement`],
//! stepping it row by row through a [`Row`] cursor. [`Transaction`] and
//! [`Savepoint`] give nested units of work with automatic busy-retry and
//! commit/rollback hooks. [`crate::idset::IdSet`] is an in-memory sorted set
//! of 64-bit IDs that can attach itself to a session as an ordinary-looking
//! SQL table.

pub mod blob;
pub mod collation;
pub mod config;
pub mod error;
pub mod idset;
pub mod registry;
pub mod savepoint;
pub mod session;
pub mod statement;
pub mod transaction;
pub mod utils;
pub mod value;

pub use error::{Error, Result};
pub use idset::IdSet;
pub use savepoint::Savepoint;
pub use session::Session;
pub use statement::{Row, Statement};
pub use transaction::Transaction;
pub use value::Value;
