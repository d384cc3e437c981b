//! Unit tests for the BookmarkSynchronizer.
//!
//! Exercises refresh, add, remove, change-feed reactivity and subscription
//! rebinding against the embedded SQLite store, wrapped in a recording double
//! so remote calls can be counted, failed or held back.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rstest::rstest;
use tokio::sync::Notify;

use smartmark::managers::bookmark_sync::{BookmarkSynchronizer, BookmarkSynchronizerTrait};
use smartmark::remote::{ChangeFeed, RowStore, SqliteStore};
use smartmark::types::bookmark::{Bookmark, NewBookmark, Order, RowFilter, BOOKMARKS_TABLE};
use smartmark::types::errors::{StoreError, SyncError};
use smartmark::types::events::SubscriptionHandle;
use smartmark::types::session::{Session, UserProfile};

const WAIT: Duration = Duration::from_secs(2);

/// Delegates to a real store while recording calls and injecting failures.
struct RecordingStore {
    inner: Arc<SqliteStore>,
    queried: Mutex<Vec<String>>,
    inserts: AtomicUsize,
    deletes: AtomicUsize,
    fail_writes: AtomicBool,
    fail_queries: AtomicBool,
    /// When set, queries for this owner wait for `release`.
    hold_owner: Mutex<Option<String>>,
    release: Notify,
    opened: Mutex<Vec<SubscriptionHandle>>,
}

impl RecordingStore {
    fn new(inner: Arc<SqliteStore>) -> Self {
        Self {
            inner,
            queried: Mutex::new(Vec::new()),
            inserts: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(false),
            fail_queries: AtomicBool::new(false),
            hold_owner: Mutex::new(None),
            release: Notify::new(),
            opened: Mutex::new(Vec::new()),
        }
    }

    fn query_count(&self) -> usize {
        self.queried.lock().unwrap().len()
    }

    fn queries_for(&self, owner: &str) -> usize {
        self.queried.lock().unwrap().iter().filter(|o| *o == owner).count()
    }

    /// Ends every feed from the store side, as a dropped connection would.
    async fn close_feeds(&self) {
        let handles: Vec<SubscriptionHandle> = self.opened.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = self.inner.unsubscribe(&handle).await;
        }
    }
}

#[async_trait]
impl RowStore for RecordingStore {
    async fn query(&self, table: &str, filter: &RowFilter, order: Order) -> Result<Vec<Bookmark>, StoreError> {
        let owner = match filter {
            RowFilter::Owner(o) => o.clone(),
            RowFilter::Id(id) => id.clone(),
        };
        // Decided before the call is recorded, so a caller that saw the
        // record may clear `hold_owner` without releasing this query.
        let hold = self.hold_owner.lock().unwrap().as_deref() == Some(owner.as_str());
        self.queried.lock().unwrap().push(owner.clone());
        if self.fail_queries.load(AtomicOrdering::SeqCst) {
            return Err(StoreError::Unavailable("query failed".to_string()));
        }
        // Read the rows first so a held query returns data from before the release.
        let rows = self.inner.query(table, filter, order).await;
        if hold {
            self.release.notified().await;
        }
        rows
    }

    async fn insert(&self, table: &str, row: NewBookmark) -> Result<Bookmark, StoreError> {
        self.inserts.fetch_add(1, AtomicOrdering::SeqCst);
        if self.fail_writes.load(AtomicOrdering::SeqCst) {
            return Err(StoreError::Rejected("insert refused".to_string()));
        }
        self.inner.insert(table, row).await
    }

    async fn delete(&self, table: &str, filter: &RowFilter, acting_owner: &str) -> Result<usize, StoreError> {
        self.deletes.fetch_add(1, AtomicOrdering::SeqCst);
        if self.fail_writes.load(AtomicOrdering::SeqCst) {
            return Err(StoreError::Rejected("delete refused".to_string()));
        }
        self.inner.delete(table, filter, acting_owner).await
    }

    async fn subscribe_change_feed(
        &self,
        channel: &str,
        table: &str,
        filter: RowFilter,
    ) -> Result<ChangeFeed, StoreError> {
        let feed = self.inner.subscribe_change_feed(channel, table, filter).await?;
        self.opened.lock().unwrap().push(feed.handle.clone());
        Ok(feed)
    }

    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<(), StoreError> {
        self.inner.unsubscribe(handle).await
    }
}

fn session(user: &str) -> Session {
    Session::from_profile(UserProfile::new(user, None), None)
}

fn setup() -> (Arc<SqliteStore>, Arc<RecordingStore>, BookmarkSynchronizer) {
    let sqlite = Arc::new(SqliteStore::open_in_memory().expect("open store"));
    let recording = Arc::new(RecordingStore::new(sqlite.clone()));
    let sync = BookmarkSynchronizer::new(recording.clone(), "bookmarks");
    (sqlite, recording, sync)
}

async fn wait_for_list<F>(sync: &BookmarkSynchronizer, pred: F)
where
    F: FnMut(&Vec<Bookmark>) -> bool,
{
    let mut rx = sync.watch();
    tokio::time::timeout(WAIT, rx.wait_for(pred))
        .await
        .expect("timed out waiting for bookmark list")
        .expect("list channel closed");
}

async fn external_insert(store: &SqliteStore, owner: &str, title: &str) -> Bookmark {
    store
        .insert(BOOKMARKS_TABLE, NewBookmark::new(owner, title, "https://example.com"))
        .await
        .expect("external insert")
}

#[tokio::test]
async fn add_then_list_puts_new_bookmark_first() {
    let (_sqlite, _rec, sync) = setup();
    sync.bind(Some(&session("alice"))).await.unwrap();

    sync.add("alice", "Older", "https://older.example").await.unwrap();
    sync.add("alice", "T", "http://x").await.unwrap();

    let list = sync.bookmarks();
    assert_eq!(list.len(), 2);
    assert_eq!(list[0].title, "T");
    assert_eq!(list[0].url, "http://x");
    assert_eq!(list.iter().filter(|b| b.title == "T").count(), 1);
}

#[tokio::test]
async fn add_returns_store_assigned_row() {
    let (_sqlite, _rec, sync) = setup();
    sync.bind(Some(&session("alice"))).await.unwrap();

    let added = sync.add("alice", "Rust", "https://rust-lang.org").await.unwrap();
    assert!(!added.id.is_empty());
    assert_eq!(added.user_id, "alice");
    assert_eq!(sync.bookmarks(), vec![added]);
}

#[tokio::test]
async fn delete_then_list_drops_the_bookmark() {
    let (_sqlite, _rec, sync) = setup();
    sync.bind(Some(&session("alice"))).await.unwrap();

    let keep = sync.add("alice", "Keep", "https://keep.example").await.unwrap();
    let gone = sync.add("alice", "Gone", "https://gone.example").await.unwrap();

    sync.remove("alice", &gone.id).await.unwrap();

    let list = sync.bookmarks();
    assert!(list.iter().all(|b| b.id != gone.id));
    assert_eq!(list, vec![keep]);
}

#[rstest]
#[case("", "http://x", "title")]
#[case("T", "", "url")]
#[tokio::test]
async fn add_with_empty_field_makes_no_remote_call(
    #[case] title: &str,
    #[case] url: &str,
    #[case] field: &str,
) {
    let (_sqlite, rec, sync) = setup();
    sync.bind(Some(&session("alice"))).await.unwrap();
    sync.add("alice", "Existing", "https://e.example").await.unwrap();
    let before = sync.bookmarks();
    let inserts = rec.inserts.load(AtomicOrdering::SeqCst);
    let queries = rec.query_count();

    let err = sync.add("alice", title, url).await.unwrap_err();

    assert!(matches!(err, SyncError::EmptyField(f) if f == field));
    assert_eq!(rec.inserts.load(AtomicOrdering::SeqCst), inserts);
    assert_eq!(rec.query_count(), queries);
    assert_eq!(sync.bookmarks(), before);
}

#[tokio::test]
async fn rejected_insert_leaves_list_untouched() {
    let (_sqlite, rec, sync) = setup();
    sync.bind(Some(&session("alice"))).await.unwrap();
    sync.add("alice", "One", "https://one.example").await.unwrap();
    let before = sync.bookmarks();

    rec.fail_writes.store(true, AtomicOrdering::SeqCst);
    let err = sync.add("alice", "Two", "https://two.example").await.unwrap_err();

    assert!(matches!(err, SyncError::Store(StoreError::Rejected(_))));
    assert_eq!(sync.bookmarks(), before);
}

#[tokio::test]
async fn rejected_delete_leaves_list_untouched() {
    let (_sqlite, rec, sync) = setup();
    sync.bind(Some(&session("alice"))).await.unwrap();
    let one = sync.add("alice", "One", "https://one.example").await.unwrap();
    let before = sync.bookmarks();

    rec.fail_writes.store(true, AtomicOrdering::SeqCst);
    assert!(sync.remove("alice", &one.id).await.is_err());
    assert_eq!(rec.deletes.load(AtomicOrdering::SeqCst), 1);
    assert_eq!(sync.bookmarks(), before);
}

#[tokio::test]
async fn failed_refresh_keeps_previous_list() {
    let (_sqlite, rec, sync) = setup();
    sync.bind(Some(&session("alice"))).await.unwrap();
    sync.add("alice", "One", "https://one.example").await.unwrap();
    let before = sync.bookmarks();

    rec.fail_queries.store(true, AtomicOrdering::SeqCst);
    assert!(sync.refresh("alice").await.is_err());
    assert_eq!(sync.bookmarks(), before);
}

#[tokio::test]
async fn refresh_twice_yields_equal_lists() {
    let (sqlite, _rec, sync) = setup();
    for title in ["a", "b", "c"] {
        external_insert(&sqlite, "alice", title).await;
    }
    sync.bind(Some(&session("alice"))).await.unwrap();

    let first = sync.refresh("alice").await.unwrap();
    let second = sync.refresh("alice").await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.iter().map(|b| b.title.as_str()).collect::<Vec<_>>(), ["c", "b", "a"]);
}

#[tokio::test]
async fn refresh_for_unbound_owner_is_not_displayed() {
    let (sqlite, _rec, sync) = setup();
    external_insert(&sqlite, "bob", "Bob's").await;
    sync.bind(Some(&session("alice"))).await.unwrap();

    let rows = sync.refresh("bob").await.unwrap();
    assert_eq!(rows.len(), 1);
    assert!(sync.bookmarks().is_empty());
}

#[tokio::test]
async fn external_insert_triggers_refresh_for_owner() {
    let (sqlite, rec, sync) = setup();
    sync.bind(Some(&session("alice"))).await.unwrap();
    let before = rec.queries_for("alice");

    let added = external_insert(&sqlite, "alice", "From another device").await;

    wait_for_list(&sync, |list| list.iter().any(|b| b.id == added.id)).await;
    assert!(rec.queries_for("alice") > before);
}

#[tokio::test]
async fn other_owners_changes_do_not_trigger_refresh() {
    let (sqlite, rec, sync) = setup();
    sync.bind(Some(&session("alice"))).await.unwrap();
    let before = rec.query_count();

    external_insert(&sqlite, "bob", "Not yours").await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(rec.query_count(), before);
    assert!(sync.bookmarks().is_empty());
}

#[tokio::test]
async fn external_delete_triggers_refresh() {
    let (sqlite, _rec, sync) = setup();
    let row = external_insert(&sqlite, "alice", "Short-lived").await;
    sync.bind(Some(&session("alice"))).await.unwrap();
    assert_eq!(sync.bookmarks().len(), 1);

    sqlite.delete(BOOKMARKS_TABLE, &RowFilter::id(&row.id), "alice").await.unwrap();

    wait_for_list(&sync, |list| list.is_empty()).await;
}

#[tokio::test]
async fn switching_user_rebinds_feed_before_new_events() {
    let (sqlite, _rec, sync) = setup();
    external_insert(&sqlite, "alice", "Alice's").await;

    sync.bind(Some(&session("alice"))).await.unwrap();
    assert_eq!(sqlite.channels(), vec!["bookmarks-alice".to_string()]);

    sync.bind(Some(&session("bob"))).await.unwrap();
    assert_eq!(sqlite.channels(), vec!["bookmarks-bob".to_string()]);
    assert_eq!(sqlite.subscription_count(), 1);
    assert_eq!(sync.bound_owner().as_deref(), Some("bob"));
    assert!(sync.bookmarks().is_empty());

    let bobs = external_insert(&sqlite, "bob", "Bob's").await;
    wait_for_list(&sync, |list| list.iter().any(|b| b.id == bobs.id)).await;

    external_insert(&sqlite, "alice", "Alice again").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(sync.bookmarks().iter().all(|b| b.user_id == "bob"));
}

#[tokio::test]
async fn binding_same_owner_twice_keeps_one_subscription() {
    let (sqlite, _rec, sync) = setup();
    sync.bind(Some(&session("alice"))).await.unwrap();
    let epoch = sync.binding().borrow().epoch;

    sync.bind(Some(&session("alice"))).await.unwrap();

    assert_eq!(sqlite.subscription_count(), 1);
    assert_eq!(sync.binding().borrow().epoch, epoch);
}

#[tokio::test]
async fn unbinding_closes_feed_and_clears_list() {
    let (sqlite, _rec, sync) = setup();
    external_insert(&sqlite, "alice", "Mine").await;
    sync.bind(Some(&session("alice"))).await.unwrap();
    assert_eq!(sync.bookmarks().len(), 1);

    sync.teardown().await;

    assert_eq!(sqlite.subscription_count(), 0);
    assert!(sync.bookmarks().is_empty());
    assert_eq!(sync.bound_owner(), None);
}

#[tokio::test]
async fn refresh_completing_after_rebind_is_discarded() {
    let (sqlite, rec, sync) = setup();
    external_insert(&sqlite, "alice", "Alice's").await;
    external_insert(&sqlite, "bob", "Bob's").await;
    sync.bind(Some(&session("alice"))).await.unwrap();

    *rec.hold_owner.lock().unwrap() = Some("alice".to_string());
    let started = rec.queries_for("alice");
    let slow = {
        let sync = sync.clone();
        tokio::spawn(async move { sync.refresh("alice").await })
    };
    // Let the held query start before rebinding.
    tokio::time::timeout(WAIT, async {
        while rec.queries_for("alice") == started {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("held query never started");

    sync.bind(Some(&session("bob"))).await.unwrap();
    rec.release.notify_one();
    let rows = slow.await.unwrap().unwrap();

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].user_id, "alice");
    let shown = sync.bookmarks();
    assert_eq!(shown.len(), 1);
    assert_eq!(shown[0].user_id, "bob");
}

#[tokio::test]
async fn subscribe_to_changes_invokes_callback_per_event() {
    let (sqlite, _rec, sync) = setup();
    let seen = Arc::new(AtomicUsize::new(0));
    let notify = Arc::new(Notify::new());

    let counter = seen.clone();
    let signal = notify.clone();
    let sub = sync
        .subscribe_to_changes("alice", move |_event| {
            let counter = counter.clone();
            let signal = signal.clone();
            async move {
                counter.fetch_add(1, AtomicOrdering::SeqCst);
                signal.notify_one();
            }
        })
        .await
        .unwrap();
    assert_eq!(sub.channel(), "bookmarks-alice");
    assert!(sub.is_listening());

    external_insert(&sqlite, "alice", "One").await;
    tokio::time::timeout(WAIT, notify.notified()).await.unwrap();
    assert_eq!(seen.load(AtomicOrdering::SeqCst), 1);

    sync.unsubscribe(sub).await;
    assert_eq!(sqlite.subscription_count(), 0);

    external_insert(&sqlite, "alice", "Two").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(seen.load(AtomicOrdering::SeqCst), 1);
}

#[tokio::test]
async fn two_clients_of_same_user_converge() {
    let sqlite = Arc::new(SqliteStore::open_in_memory().unwrap());
    let laptop = BookmarkSynchronizer::new(sqlite.clone(), "bookmarks");
    let phone = BookmarkSynchronizer::new(sqlite.clone(), "bookmarks");
    laptop.bind(Some(&session("alice"))).await.unwrap();
    phone.bind(Some(&session("alice"))).await.unwrap();

    let added = laptop.add("alice", "Shared", "https://shared.example").await.unwrap();
    wait_for_list(&phone, |list| list.len() == 1).await;
    assert_eq!(phone.bookmarks(), laptop.bookmarks());

    phone.remove("alice", &added.id).await.unwrap();
    wait_for_list(&laptop, |list| list.is_empty()).await;
}

#[tokio::test]
async fn following_sessions_binds_on_sign_in_and_tears_down_on_sign_out() {
    use smartmark::managers::session_manager::{SessionManager, SessionManagerTrait};
    use smartmark::remote::{AuthBackend, LocalAuth};
    use smartmark::types::settings::ClientSettings;

    let (sqlite, _rec, sync) = setup();
    external_insert(&sqlite, "alice", "Waiting").await;
    let auth = Arc::new(LocalAuth::new());
    let sessions = SessionManager::start(auth.clone() as Arc<dyn AuthBackend>, &ClientSettings::default())
        .await
        .unwrap();
    let following = sync.follow_sessions(&sessions);

    sessions.sign_in().await.unwrap();
    auth.complete_sign_in(UserProfile::new("alice", None), None).unwrap();
    let mut binding = sync.binding();
    tokio::time::timeout(WAIT, binding.wait_for(|b| b.subscribed && b.owner.as_deref() == Some("alice")))
        .await
        .unwrap()
        .unwrap();
    wait_for_list(&sync, |list| list.len() == 1).await;

    sessions.sign_out().await.unwrap();
    tokio::time::timeout(WAIT, binding.wait_for(|b| b.owner.is_none()))
        .await
        .unwrap()
        .unwrap();
    assert!(sync.bookmarks().is_empty());
    assert_eq!(sqlite.subscription_count(), 0);

    following.stop().await;
}

#[tokio::test]
async fn removing_another_users_bookmark_is_refused_by_store() {
    let (sqlite, rec, sync) = setup();
    let alices = external_insert(&sqlite, "alice", "Alice's").await;
    sync.bind(Some(&session("bob"))).await.unwrap();

    let err = sync.remove("bob", &alices.id).await.unwrap_err();

    assert!(matches!(err, SyncError::Store(StoreError::Rejected(_))));
    assert_eq!(rec.deletes.load(AtomicOrdering::SeqCst), 1, "the store decides, not the client");
    let left = sqlite
        .query(BOOKMARKS_TABLE, &RowFilter::owner("alice"), Order::NewestFirst)
        .await
        .unwrap();
    assert_eq!(left, vec![alices]);
}

#[tokio::test]
async fn last_completed_refresh_wins_within_a_binding() {
    let (sqlite, rec, sync) = setup();
    let first = external_insert(&sqlite, "alice", "First").await;
    sync.bind(Some(&session("alice"))).await.unwrap();

    // Refresh one reads the single-row state, then stalls.
    *rec.hold_owner.lock().unwrap() = Some("alice".to_string());
    let started = rec.queries_for("alice");
    let older = {
        let sync = sync.clone();
        tokio::spawn(async move { sync.refresh("alice").await })
    };
    tokio::time::timeout(WAIT, async {
        while rec.queries_for("alice") == started {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("held query never started");
    *rec.hold_owner.lock().unwrap() = None;

    // Refresh two is the feed's, it sees the new row and completes first.
    external_insert(&sqlite, "alice", "Second").await;
    wait_for_list(&sync, |list| list.len() == 2).await;

    rec.release.notify_one();
    let stale = older.await.unwrap().unwrap();
    assert_eq!(stale, vec![first.clone()]);
    assert_eq!(sync.bookmarks(), vec![first], "the refresh that finished last is shown");

    // The next change event brings the list back up to date.
    let third = external_insert(&sqlite, "alice", "Third").await;
    wait_for_list(&sync, |list| list.len() == 3).await;
    assert_eq!(sync.bookmarks()[0], third);
}

#[tokio::test]
async fn feed_closed_by_store_is_reopened_on_next_bind() {
    let (sqlite, rec, sync) = setup();
    sync.bind(Some(&session("alice"))).await.unwrap();
    let mut binding = sync.binding();
    assert!(binding.borrow_and_update().subscribed);

    rec.close_feeds().await;
    tokio::time::timeout(WAIT, binding.wait_for(|b| !b.subscribed))
        .await
        .expect("closed feed still reported as subscribed")
        .unwrap();
    assert_eq!(sync.bound_owner().as_deref(), Some("alice"));

    sync.bind(Some(&session("alice"))).await.unwrap();
    assert!(sync.binding().borrow().subscribed);
    assert_eq!(sqlite.subscription_count(), 1);

    let added = external_insert(&sqlite, "alice", "After reconnect").await;
    wait_for_list(&sync, |list| list.iter().any(|b| b.id == added.id)).await;
}
