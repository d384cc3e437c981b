//! Remote store client.
//!
//! The core talks to the outside world through two capability traits:
//! [`RowStore`] for owner-scoped bookmark rows and their change feed, and
//! [`AuthBackend`] for the identity provider. [`SqliteStore`] and
//! [`LocalAuth`] are in-process implementations of both.

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use crate::types::bookmark::{Bookmark, NewBookmark, Order, RowFilter};
use crate::types::errors::{AuthError, StoreError};
use crate::types::events::{AuthEvent, ChangeEvent, SubscriptionHandle};
use crate::types::session::{ProviderConfig, Session};

pub mod local_auth;
pub mod sqlite_store;

pub use local_auth::LocalAuth;
pub use sqlite_store::SqliteStore;

/// An open change-feed subscription. Events stop (the receiver yields `None`)
/// once the subscription is unsubscribed.
#[derive(Debug)]
pub struct ChangeFeed {
    pub handle: SubscriptionHandle,
    pub events: mpsc::UnboundedReceiver<ChangeEvent>,
}

/// Row-oriented store holding every user's bookmarks.
#[async_trait]
pub trait RowStore: Send + Sync {
    async fn query(&self, table: &str, filter: &RowFilter, order: Order) -> Result<Vec<Bookmark>, StoreError>;
    /// Inserts a row; the store assigns `id` and `created_at` and returns the stored row.
    async fn insert(&self, table: &str, row: NewBookmark) -> Result<Bookmark, StoreError>;
    /// Deletes every row matching `filter` on behalf of `acting_owner`.
    /// Returns the number of rows removed. The store refuses to delete rows
    /// owned by anyone else.
    async fn delete(&self, table: &str, filter: &RowFilter, acting_owner: &str) -> Result<usize, StoreError>;
    async fn subscribe_change_feed(
        &self,
        channel: &str,
        table: &str,
        filter: RowFilter,
    ) -> Result<ChangeFeed, StoreError>;
    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<(), StoreError>;
}

/// Identity provider capabilities.
#[async_trait]
pub trait AuthBackend: Send + Sync {
    async fn get_session(&self) -> Result<Option<Session>, AuthError>;
    /// Stream of auth state changes. Dropping the receiver unsubscribes.
    fn auth_events(&self) -> broadcast::Receiver<AuthEvent>;
    /// Starts the provider exchange. Completion only shows up as an [`AuthEvent`].
    async fn sign_in_with_provider(&self, config: &ProviderConfig) -> Result<(), AuthError>;
    async fn sign_out(&self) -> Result<(), AuthError>;
}
