//! Property-based tests for bookmark synchronization.
//!
//! For any mix of owners and titles written to a shared store, the displayed
//! list of a bound client holds exactly that owner's rows, newest first, and
//! refreshing again without writes yields the same list.

use std::sync::Arc;

use proptest::prelude::*;

use smartmark::managers::bookmark_sync::{BookmarkSynchronizer, BookmarkSynchronizerTrait};
use smartmark::remote::{RowStore, SqliteStore};
use smartmark::types::bookmark::{NewBookmark, BOOKMARKS_TABLE};
use smartmark::types::session::{Session, UserProfile};

fn arb_title() -> impl Strategy<Value = String> {
    "[a-zA-Z][a-zA-Z0-9 ]{0,20}"
}

fn arb_writes() -> impl Strategy<Value = Vec<(String, String)>> {
    proptest::collection::vec((prop_oneof![Just("ada"), Just("grace"), Just("linus")].prop_map(String::from), arb_title()), 0..15)
}

async fn run(viewer: String, writes: Vec<(String, String)>) -> Result<(), TestCaseError> {
    let store = Arc::new(SqliteStore::open_in_memory().map_err(|e| TestCaseError::fail(e.to_string()))?);
    for (owner, title) in &writes {
        store
            .insert(BOOKMARKS_TABLE, NewBookmark::new(owner, title, "https://example.com"))
            .await
            .map_err(|e| TestCaseError::fail(e.to_string()))?;
    }

    let sync = BookmarkSynchronizer::new(store.clone(), "bookmarks");
    let session = Session::from_profile(UserProfile::new(&viewer, None), None);
    sync.bind(Some(&session)).await.map_err(|e| TestCaseError::fail(e.to_string()))?;

    let shown = sync.bookmarks();
    let expected: Vec<&str> = writes
        .iter()
        .rev()
        .filter(|(owner, _)| *owner == viewer)
        .map(|(_, title)| title.as_str())
        .collect();
    let titles: Vec<&str> = shown.iter().map(|b| b.title.as_str()).collect();
    prop_assert_eq!(titles, expected);
    prop_assert!(shown.iter().all(|b| b.user_id == viewer));
    prop_assert!(shown.windows(2).all(|w| w[0].created_at > w[1].created_at));

    let again = sync.refresh(&viewer).await.map_err(|e| TestCaseError::fail(e.to_string()))?;
    prop_assert_eq!(&again, &shown);
    prop_assert_eq!(sync.bookmarks(), shown);
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn bound_list_is_owner_scoped_and_stable(
        viewer in prop_oneof![Just("ada"), Just("grace")].prop_map(String::from),
        writes in arb_writes(),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime");
        runtime.block_on(run(viewer, writes))?;
    }
}
