//! Database layer behind the embedded row store.
//!
//! # Usage
//!
//! ```no_run
//! use smartmark::database::Database;
//!
//! let db = Database::open("smartmark.db").expect("failed to open database");
//! let db = Database::open_in_memory().expect("failed to open in-memory database");
//! let conn = db.connection();
//! ```

pub mod connection;
pub mod migrations;

pub use connection::Database;
