//! Smartmark: personal URL bookmarks behind a sign-in gate, kept in sync
//! across every session of the same user through a change feed.
//!
//! This library crate exposes all modules for use by the binaries and integration tests.

pub mod app;
pub mod database;
pub mod managers;
pub mod remote;
pub mod rpc_handler;
pub mod services;
pub mod types;
