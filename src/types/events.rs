use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::bookmark::Bookmark;
use super::session::Session;

/// Row-level change kinds delivered on a change feed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A change-feed notification. The synchronizer treats any event as a cue
/// to refresh and never reads the rows.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub table: String,
    pub old_row: Option<Bookmark>,
    pub new_row: Option<Bookmark>,
}

impl ChangeEvent {
    /// The row a subscription filter is matched against.
    pub fn row(&self) -> Option<&Bookmark> {
        self.new_row.as_ref().or(self.old_row.as_ref())
    }
}

/// Identifies one open change-feed subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionHandle {
    pub id: Uuid,
    pub channel: String,
}

/// Identity provider state transitions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthEventKind {
    SignedIn,
    SignedOut,
    TokenRefreshed,
    UserUpdated,
    Expired,
}

/// Auth state change together with the session value after it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthEvent {
    pub kind: AuthEventKind,
    pub session: Option<Session>,
}
