// Smartmark state managers
// Managers own the two pieces of client state: the session and the bookmark list.

pub mod bookmark_sync;
pub mod session_manager;
