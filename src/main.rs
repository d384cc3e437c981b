//! Smartmark: personal bookmarks gated by sign-in and synced live across clients.
//!
//! Entry point: runs a console walkthrough with two clients of the same user
//! sharing one row store, showing sign-in gating and realtime sync.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};

use smartmark::app::App;
use smartmark::managers::bookmark_sync::BookmarkSynchronizerTrait;
use smartmark::managers::session_manager::{Route, SessionManagerTrait};
use smartmark::remote::{LocalAuth, SqliteStore};
use smartmark::services::logging;
use smartmark::services::settings_engine::{SettingsEngine, SettingsEngineTrait};
use smartmark::types::session::UserProfile;

const SETTLE: Duration = Duration::from_secs(5);

fn section(name: &str) {
    println!("───────────────────────────────────────────────────────────────");
    println!("  {}", name);
    println!("───────────────────────────────────────────────────────────────");
}

/// Waits until `app` is subscribed to `user`'s change feed.
async fn wait_bound(app: &App, user: &str) -> anyhow::Result<()> {
    let mut rx = app.bookmarks.binding();
    tokio::time::timeout(
        SETTLE,
        rx.wait_for(|b| b.subscribed && b.owner.as_deref() == Some(user)),
    )
    .await
    .context("timed out waiting for feed binding")??;
    Ok(())
}

/// Waits until `app` displays exactly `count` bookmarks.
async fn wait_count(app: &App, count: usize) -> anyhow::Result<()> {
    let mut rx = app.bookmarks.watch();
    tokio::time::timeout(SETTLE, rx.wait_for(|list| list.len() == count))
        .await
        .context("timed out waiting for bookmark list")??;
    Ok(())
}

fn print_list(label: &str, app: &App) {
    let list = app.bookmarks.bookmarks();
    println!("  {} shows {} bookmark(s):", label, list.len());
    for b in list {
        println!("    • {} <{}>", b.title, b.url);
    }
}

async fn sign_in(app: &App, profile: UserProfile) -> anyhow::Result<()> {
    let user = profile.user_id.clone();
    app.sessions.sign_in().await?;
    app.auth.complete_sign_in(profile, None)?;
    wait_bound(app, &user).await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let mut engine = SettingsEngine::new(std::env::var("SMARTMARK_CONFIG").ok());
    engine.load().context("loading settings")?;
    engine.apply_env_overrides().context("applying environment overrides")?;
    let settings = engine.get_settings().clone();
    logging::init(&settings.log_filter);

    println!();
    println!("  Smartmark v{} walkthrough", env!("CARGO_PKG_VERSION"));
    println!();

    let store = Arc::new(match &settings.database_path {
        Some(path) => SqliteStore::open(path)?,
        None => SqliteStore::open_in_memory()?,
    });
    let mut laptop = App::with_backends(settings.clone(), store.clone(), Arc::new(LocalAuth::new())).await?;
    let mut phone = App::with_backends(settings.clone(), store.clone(), Arc::new(LocalAuth::new())).await?;

    section("Gate");
    match laptop.sessions.gate() {
        Route::SignIn => println!("  No session: dashboard redirects to {:?}", laptop.sessions.redirect_for(&settings.dashboard_path)),
        Route::Dashboard(_) => bail!("fresh client should not have a session"),
    }

    section("Sign-in");
    let ada = || {
        UserProfile::new("ada", Some("ada@example.com"))
            .with("full_name", "Ada Lovelace")
    };
    sign_in(&laptop, ada()).await?;
    sign_in(&phone, ada()).await?;
    let session = laptop.sessions.require_session()?;
    println!("  Signed in as {} ({})", session.display_name, session.avatar_url);
    println!("  Open feeds: {:?}", store.channels());

    section("Add on laptop, see it on phone");
    let owner = session.user_id.clone();
    laptop.bookmarks.add(&owner, "Rust", "https://www.rust-lang.org").await?;
    laptop.bookmarks.add(&owner, "Tokio", "https://tokio.rs").await?;
    wait_count(&phone, 2).await?;
    print_list("phone", &phone);

    section("Delete on phone, see it on laptop");
    let oldest = phone.bookmarks.bookmarks().last().map(|b| b.id.clone()).context("phone list is empty")?;
    phone.bookmarks.remove(&owner, &oldest).await?;
    wait_count(&laptop, 1).await?;
    print_list("laptop", &laptop);

    section("Validation");
    match laptop.bookmarks.add(&owner, "", "https://example.com").await {
        Err(e) => println!("  Rejected locally: {}", e),
        Ok(_) => bail!("empty title should be rejected"),
    }

    section("Sign-out");
    laptop.sessions.sign_out().await?;
    wait_count(&laptop, 0).await?;
    println!("  Laptop gate: {:?}", laptop.sessions.redirect_for(&settings.dashboard_path));
    println!("  Open feeds: {:?}", store.channels());

    laptop.shutdown().await;
    phone.shutdown().await;
    println!();
    println!("  Done.");
    Ok(())
}
