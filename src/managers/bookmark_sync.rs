//! Bookmark Synchronizer.
//!
//! Keeps the displayed bookmark list of the signed-in user consistent with the
//! row store. The list is only ever replaced wholesale by a refresh; change
//! feed events and session changes are cues to refresh, never patches.
//!
//! A binding epoch guards the list: every rebind bumps it and clears the list,
//! and a refresh only applies its rows if the epoch it started under is still
//! current. Results that complete after a rebind or teardown are discarded.

use std::future::Future;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::managers::session_manager::{SessionManager, SessionManagerTrait};
use crate::remote::{ChangeFeed, RowStore};
use crate::types::bookmark::{Bookmark, NewBookmark, Order, RowFilter, BOOKMARKS_TABLE};
use crate::types::errors::SyncError;
use crate::types::events::{ChangeEvent, SubscriptionHandle};
use crate::types::session::Session;

/// Trait defining bookmark synchronization operations.
#[async_trait]
pub trait BookmarkSynchronizerTrait {
    fn bookmarks(&self) -> Vec<Bookmark>;
    fn watch(&self) -> watch::Receiver<Vec<Bookmark>>;
    fn binding(&self) -> watch::Receiver<BindingState>;
    fn bound_owner(&self) -> Option<String>;
    async fn refresh(&self, owner: &str) -> Result<Vec<Bookmark>, SyncError>;
    async fn add(&self, owner: &str, title: &str, url: &str) -> Result<Bookmark, SyncError>;
    /// `owner` is the acting identity handed to the store, not a local check.
    async fn remove(&self, owner: &str, bookmark_id: &str) -> Result<(), SyncError>;
    async fn subscribe_to_changes<F, Fut>(&self, owner: &str, on_change: F) -> Result<FeedSubscription, SyncError>
    where
        F: Fn(ChangeEvent) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static;
    async fn unsubscribe(&self, subscription: FeedSubscription);
    async fn bind(&self, session: Option<&Session>) -> Result<(), SyncError>;
    async fn teardown(&self);
    fn follow_sessions(&self, sessions: &SessionManager) -> SessionBinding;
}

/// Which owner the synchronizer is bound to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindingState {
    pub epoch: u64,
    pub owner: Option<String>,
    /// True while the owner's change feed is open.
    pub subscribed: bool,
}

/// An open change-feed subscription with its listener task.
pub struct FeedSubscription {
    handle: SubscriptionHandle,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl FeedSubscription {
    pub fn handle(&self) -> &SubscriptionHandle {
        &self.handle
    }

    pub fn channel(&self) -> &str {
        &self.handle.channel
    }

    pub fn is_listening(&self) -> bool {
        !self.cancel.is_cancelled() && !self.task.is_finished()
    }

    /// Stops the listener, then closes the subscription at the store.
    async fn close(self, store: &dyn RowStore) {
        self.cancel.cancel();
        if let Err(e) = store.unsubscribe(&self.handle).await {
            warn!(channel = %self.handle.channel, error = %e, "unsubscribe failed");
        }
    }
}

impl Drop for FeedSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Binding {
    owner: String,
    subscription: FeedSubscription,
}

struct SyncInner {
    store: Arc<dyn RowStore>,
    channel_prefix: String,
    bookmarks: watch::Sender<Vec<Bookmark>>,
    scope: watch::Sender<BindingState>,
    binding: Mutex<Option<Binding>>,
}

impl SyncInner {
    fn channel_for(&self, owner: &str) -> String {
        format!("{}-{}", self.channel_prefix, owner)
    }

    /// Epoch under which rows for `owner` may be applied, if `owner` is bound.
    fn epoch_for(&self, owner: &str) -> Option<u64> {
        let scope = self.scope.borrow();
        (scope.owner.as_deref() == Some(owner)).then_some(scope.epoch)
    }

    /// Replaces the list if the binding has not moved since `epoch`.
    fn apply(&self, epoch: Option<u64>, owner: &str, rows: &[Bookmark]) -> bool {
        let Some(epoch) = epoch else {
            debug!(owner, "refresh for unbound owner not applied");
            return false;
        };

        // Holding the scope borrow keeps a concurrent rebind from interleaving.
        let scope = self.scope.borrow();
        if scope.epoch != epoch {
            debug!(owner, epoch, current = scope.epoch, "stale refresh discarded");
            return false;
        }

        // Rows outside the ownership filter are never displayed.
        let owned: Vec<Bookmark> = rows.iter().filter(|b| b.user_id == owner).cloned().collect();
        if owned.len() != rows.len() {
            warn!(owner, dropped = rows.len() - owned.len(), "store returned rows of another owner");
        }
        debug!(owner, count = owned.len(), "bookmark list replaced");
        self.bookmarks.send_replace(owned);
        true
    }

    /// Moves to a new binding epoch and clears the list.
    fn rescope(&self, owner: Option<String>) {
        self.scope.send_modify(|scope| {
            scope.epoch += 1;
            scope.owner = owner;
            scope.subscribed = false;
            self.bookmarks.send_replace(Vec::new());
        });
    }

    fn set_subscribed(&self, epoch: u64, subscribed: bool) {
        self.scope.send_if_modified(|scope| {
            if scope.epoch == epoch && scope.subscribed != subscribed {
                scope.subscribed = subscribed;
                true
            } else {
                false
            }
        });
    }

    async fn refresh(&self, owner: &str) -> Result<Vec<Bookmark>, SyncError> {
        let epoch = self.epoch_for(owner);
        let rows = self
            .store
            .query(BOOKMARKS_TABLE, &RowFilter::owner(owner), Order::NewestFirst)
            .await
            .map_err(|e| {
                warn!(owner, error = %e, "bookmark query failed");
                e
            })?;
        self.apply(epoch, owner, &rows);
        Ok(rows)
    }

    /// Opens `owner`'s feed and spawns its listener. `on_closed` runs only
    /// when the store ends the feed, not on cancellation.
    async fn open_feed<F, Fut, C>(&self, owner: &str, on_change: F, on_closed: C) -> Result<FeedSubscription, SyncError>
    where
        F: Fn(ChangeEvent) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        let channel = self.channel_for(owner);
        let ChangeFeed { handle, events } = self
            .store
            .subscribe_change_feed(&channel, BOOKMARKS_TABLE, RowFilter::owner(owner))
            .await?;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(listen(channel, events, cancel.clone(), on_change, on_closed));

        Ok(FeedSubscription {
            handle,
            cancel,
            task,
        })
    }
}

async fn listen<F, Fut, C>(
    channel: String,
    mut events: UnboundedReceiver<ChangeEvent>,
    cancel: CancellationToken,
    on_change: F,
    on_closed: C,
) where
    F: Fn(ChangeEvent) -> Fut,
    Fut: Future<Output = ()>,
    C: FnOnce(),
{
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Some(event) => {
                debug!(channel = %channel, kind = ?event.kind, "change feed event");
                let handled = on_change(event);
                handled.await;
            }
            None => {
                // TODO: reconnect with backoff once a networked store exists.
                warn!(channel = %channel, "change feed closed by store");
                on_closed();
                break;
            }
        }
    }
}

/// Owns the bookmark list of the current session. Cheap to clone.
#[derive(Clone)]
pub struct BookmarkSynchronizer {
    inner: Arc<SyncInner>,
}

impl BookmarkSynchronizer {
    pub fn new(store: Arc<dyn RowStore>, channel_prefix: &str) -> Self {
        let (bookmarks, _) = watch::channel(Vec::new());
        let (scope, _) = watch::channel(BindingState::default());
        Self {
            inner: Arc::new(SyncInner {
                store,
                channel_prefix: channel_prefix.to_string(),
                bookmarks,
                scope,
                binding: Mutex::new(None),
            }),
        }
    }
}

#[async_trait]
impl BookmarkSynchronizerTrait for BookmarkSynchronizer {
    /// The displayed list, newest first.
    fn bookmarks(&self) -> Vec<Bookmark> {
        self.inner.bookmarks.borrow().clone()
    }

    /// Observes every replacement of the displayed list.
    fn watch(&self) -> watch::Receiver<Vec<Bookmark>> {
        self.inner.bookmarks.subscribe()
    }

    fn binding(&self) -> watch::Receiver<BindingState> {
        self.inner.scope.subscribe()
    }

    fn bound_owner(&self) -> Option<String> {
        self.inner.scope.borrow().owner.clone()
    }

    /// Fetches every bookmark of `owner`, newest first, and replaces the
    /// displayed list with it when `owner` is the bound owner.
    ///
    /// Concurrent refreshes apply in completion order.
    async fn refresh(&self, owner: &str) -> Result<Vec<Bookmark>, SyncError> {
        self.inner.refresh(owner).await
    }

    /// Stores a new bookmark and refreshes. Empty fields are rejected before
    /// any remote call.
    async fn add(&self, owner: &str, title: &str, url: &str) -> Result<Bookmark, SyncError> {
        if title.is_empty() {
            return Err(SyncError::EmptyField("title"));
        }
        if url.is_empty() {
            return Err(SyncError::EmptyField("url"));
        }

        let bookmark = self
            .inner
            .store
            .insert(BOOKMARKS_TABLE, NewBookmark::new(owner, title, url))
            .await
            .map_err(|e| {
                warn!(owner, error = %e, "bookmark insert rejected");
                e
            })?;
        info!(owner, id = %bookmark.id, "bookmark added");

        if let Err(e) = self.refresh(owner).await {
            warn!(owner, error = %e, "refresh after add failed");
        }
        Ok(bookmark)
    }

    /// Deletes a bookmark by id. Ownership is enforced by the store, not here.
    async fn remove(&self, owner: &str, bookmark_id: &str) -> Result<(), SyncError> {
        let removed = self
            .inner
            .store
            .delete(BOOKMARKS_TABLE, &RowFilter::id(bookmark_id), owner)
            .await
            .map_err(|e| {
                warn!(owner, id = bookmark_id, error = %e, "bookmark delete rejected");
                e
            })?;
        info!(owner, id = bookmark_id, removed, "bookmark removed");

        if let Err(e) = self.refresh(owner).await {
            warn!(owner, error = %e, "refresh after remove failed");
        }
        Ok(())
    }

    /// Opens a change feed on `owner`'s rows and calls `on_change` for every
    /// event on it. Events are handled one at a time in delivery order.
    async fn subscribe_to_changes<F, Fut>(&self, owner: &str, on_change: F) -> Result<FeedSubscription, SyncError>
    where
        F: Fn(ChangeEvent) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner.open_feed(owner, on_change, || {}).await
    }

    /// Closes a subscription opened with `subscribe_to_changes`.
    async fn unsubscribe(&self, subscription: FeedSubscription) {
        subscription.close(self.inner.store.as_ref()).await;
    }

    /// Binds the list and the change feed to `session`'s owner.
    ///
    /// A different owner closes the old feed before the new one is opened;
    /// `None` closes it and clears the list. Binding the already bound owner
    /// does nothing while its feed is open.
    async fn bind(&self, session: Option<&Session>) -> Result<(), SyncError> {
        let owner = session.map(|s| s.user_id.clone());
        let mut binding = self.inner.binding.lock().await;

        let current = self.inner.scope.borrow().clone();
        if current.owner == owner && (owner.is_none() || current.subscribed) {
            return Ok(());
        }

        if let Some(old) = binding.take() {
            old.subscription.close(self.inner.store.as_ref()).await;
            info!(owner = %old.owner, "unbound bookmark feed");
        }
        self.inner.rescope(owner.clone());

        let Some(owner) = owner else {
            return Ok(());
        };
        let epoch = self.inner.scope.borrow().epoch;

        let weak: Weak<SyncInner> = Arc::downgrade(&self.inner);
        let closed = weak.clone();
        let feed_owner = owner.clone();
        let subscription = self
            .inner
            .open_feed(
                &owner,
                move |_event| {
                    let weak = weak.clone();
                    let owner = feed_owner.clone();
                    async move {
                        let Some(inner) = weak.upgrade() else { return };
                        if let Err(e) = inner.refresh(&owner).await {
                            warn!(owner = %owner, error = %e, "refresh after change event failed");
                        }
                    }
                },
                move || {
                    // The next bind for this owner reopens the feed.
                    if let Some(inner) = closed.upgrade() {
                        inner.set_subscribed(epoch, false);
                    }
                },
            )
            .await?;

        info!(owner = %owner, channel = subscription.channel(), "bound bookmark feed");
        *binding = Some(Binding {
            owner: owner.clone(),
            subscription,
        });
        self.inner.set_subscribed(epoch, true);
        drop(binding);

        self.refresh(&owner).await?;
        Ok(())
    }

    /// Closes the feed and clears the list.
    async fn teardown(&self) {
        if let Err(e) = self.bind(None).await {
            warn!(error = %e, "teardown failed");
        }
    }

    /// Keeps the binding in step with `sessions`: binds the current session
    /// once, then rebinds on every change until the returned handle stops.
    fn follow_sessions(&self, sessions: &SessionManager) -> SessionBinding {
        let mut rx = sessions.watch();
        let sync = self.clone();
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            loop {
                let session = rx.borrow_and_update().clone();
                if let Err(e) = sync.bind(session.as_ref()).await {
                    warn!(error = %e, "binding to session failed");
                }
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            sync.teardown().await;
        });

        SessionBinding { cancel, task }
    }
}

/// Background task driving [`BookmarkSynchronizerTrait::bind`] from session changes.
pub struct SessionBinding {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SessionBinding {
    /// Stops following and waits for the feed to be torn down.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "session binding task ended abnormally");
        }
    }
}
