//! Smartmark RPC Server: JSON-lines over stdin/stdout for a view process.
//!
//! Protocol: one JSON object per line.
//! Request:  {"id":1, "method":"bookmark.add", "params":{"title":"...","url":"..."}}
//! Response: {"id":1, "result":{...}} or {"id":1, "error":"..."}
//! Push:     {"event":"session","session":{...}} and {"event":"bookmarks","items":[...]}
//!           whenever the session or the displayed list changes.

use std::sync::Arc;

use anyhow::Context;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{info, warn};

use smartmark::app::App;
use smartmark::managers::bookmark_sync::BookmarkSynchronizerTrait;
use smartmark::managers::session_manager::SessionManagerTrait;
use smartmark::rpc_handler::{bookmarks_json, handle_method, session_json};
use smartmark::services::logging;
use smartmark::services::settings_engine::{SettingsEngine, SettingsEngineTrait};

type Stdout = Arc<Mutex<tokio::io::Stdout>>;

async fn emit(out: &Stdout, value: &Value) {
    let mut line = value.to_string();
    line.push('\n');
    let mut out = out.lock().await;
    if let Err(e) = out.write_all(line.as_bytes()).await {
        warn!(error = %e, "stdout write failed");
        return;
    }
    let _ = out.flush().await;
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let mut engine = SettingsEngine::new(std::env::var("SMARTMARK_CONFIG").ok());
    engine.load().context("loading settings")?;
    engine.apply_env_overrides().context("applying environment overrides")?;
    let settings = engine.get_settings().clone();
    logging::init(&settings.log_filter);

    let mut app = App::new(settings).await?;
    let out: Stdout = Arc::new(Mutex::new(tokio::io::stdout()));

    // Push session and list changes to the view.
    let mut sessions = app.sessions.watch();
    let session_out = out.clone();
    let session_push = tokio::spawn(async move {
        while sessions.changed().await.is_ok() {
            let session = sessions.borrow_and_update().clone();
            emit(&session_out, &json!({"event": "session", "session": session_json(session.as_ref())})).await;
        }
    });
    let mut list = app.bookmarks.watch();
    let list_out = out.clone();
    let list_push = tokio::spawn(async move {
        while list.changed().await.is_ok() {
            let items = bookmarks_json(&list.borrow_and_update());
            emit(&list_out, &json!({"event": "bookmarks", "items": items})).await;
        }
    });

    emit(&out, &json!({"event": "ready", "version": env!("CARGO_PKG_VERSION")})).await;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("reading stdin")? {
        if line.trim().is_empty() {
            continue;
        }

        let req: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                emit(&out, &json!({"id": null, "error": format!("parse error: {}", e)})).await;
                continue;
            }
        };

        let id = req.get("id").cloned().unwrap_or(Value::Null);
        let method = req.get("method").and_then(|v| v.as_str()).unwrap_or("");
        let params = req.get("params").cloned().unwrap_or(json!({}));

        let response = match handle_method(&app, method, &params).await {
            Ok(val) => json!({"id": id, "result": val}),
            Err(err) => json!({"id": id, "error": err}),
        };
        emit(&out, &response).await;
    }

    info!("stdin closed, shutting down");
    app.shutdown().await;
    session_push.abort();
    list_push.abort();
    Ok(())
}
