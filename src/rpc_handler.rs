//! RPC method handler for the Smartmark JSON-lines protocol.
//!
//! Translates view intents (sign in, add, delete, ...) into calls on the
//! session manager and the bookmark synchronizer. Every bookmark method goes
//! through the gate first and is scoped to the live session's user.

use std::time::Duration;

use serde_json::{json, Map, Value};

use crate::app::App;
use crate::managers::bookmark_sync::BookmarkSynchronizerTrait;
use crate::managers::session_manager::{Route, SessionManagerTrait};
use crate::types::bookmark::Bookmark;
use crate::types::session::{Session, UserProfile};

/// How long `session.complete` waits for the session manager to observe the sign-in.
const SIGN_IN_SETTLE: Duration = Duration::from_secs(5);

fn bookmark_json(b: &Bookmark) -> Value {
    json!({
        "id": b.id,
        "title": b.title,
        "url": b.url,
        "created_at": b.created_at.to_rfc3339(),
    })
}

pub fn bookmarks_json(list: &[Bookmark]) -> Value {
    Value::Array(list.iter().map(bookmark_json).collect())
}

pub fn session_json(session: Option<&Session>) -> Value {
    match session {
        Some(s) => json!({
            "user_id": s.user_id,
            "email": s.email,
            "display_name": s.display_name,
            "avatar_url": s.avatar_url,
        }),
        None => Value::Null,
    }
}

fn str_param<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(|v| v.as_str())
}

fn require_session(app: &App) -> Result<Session, String> {
    app.sessions.require_session().map_err(|e| e.to_string())
}

/// Dispatch a JSON-RPC method call.
///
/// Returns `Ok(Value)` on success or `Err(String)` with an error message.
pub async fn handle_method(app: &App, method: &str, params: &Value) -> Result<Value, String> {
    match method {
        "ping" => Ok(json!({"pong": true})),

        // ─── Session ───
        "session.get" => {
            let session = app.sessions.current_session();
            Ok(json!({"session": session_json(session.as_ref())}))
        }
        "session.sign_in" => {
            app.sessions.sign_in().await.map_err(|e| e.to_string())?;
            Ok(json!({"ok": true, "redirect_to": app.sessions.provider().redirect_to}))
        }
        "session.complete" => {
            let user_id = str_param(params, "user_id").ok_or("missing user_id")?;
            if user_id.is_empty() {
                return Err("user_id must not be empty".to_string());
            }
            let metadata = match params.get("metadata") {
                Some(Value::Object(map)) => map.clone(),
                Some(_) => return Err("metadata must be an object".to_string()),
                None => Map::new(),
            };
            let profile = UserProfile {
                user_id: user_id.to_string(),
                email: str_param(params, "email").map(str::to_string),
                metadata,
            };
            let session = app
                .auth
                .complete_sign_in(profile, None)
                .map_err(|e| e.to_string())?;

            let mut rx = app.sessions.watch();
            tokio::time::timeout(
                SIGN_IN_SETTLE,
                rx.wait_for(|s| s.as_ref().map(|s| s.user_id.as_str()) == Some(user_id)),
            )
            .await
            .map_err(|_| "timed out waiting for session".to_string())?
            .map_err(|e| e.to_string())?;

            Ok(json!({"session": session_json(Some(&session))}))
        }
        "session.sign_out" => {
            app.sessions.sign_out().await.map_err(|e| e.to_string())?;
            Ok(json!({"ok": true, "redirect": app.settings.sign_in_path}))
        }
        "gate.route" => {
            let path = str_param(params, "path").unwrap_or(&app.settings.dashboard_path);
            let route = match app.sessions.gate() {
                Route::Dashboard(_) => "dashboard",
                Route::SignIn => "sign_in",
            };
            Ok(json!({"route": route, "redirect": app.sessions.redirect_for(path)}))
        }

        // ─── Bookmarks ───
        "bookmark.list" => {
            require_session(app)?;
            Ok(json!({"items": bookmarks_json(&app.bookmarks.bookmarks())}))
        }
        "bookmark.refresh" => {
            let session = require_session(app)?;
            let rows = app
                .bookmarks
                .refresh(&session.user_id)
                .await
                .map_err(|e| e.to_string())?;
            Ok(json!({"items": bookmarks_json(&rows)}))
        }
        "bookmark.add" => {
            let session = require_session(app)?;
            let title = str_param(params, "title").unwrap_or("");
            let url = str_param(params, "url").unwrap_or("");
            let bookmark = app
                .bookmarks
                .add(&session.user_id, title, url)
                .await
                .map_err(|e| e.to_string())?;
            Ok(bookmark_json(&bookmark))
        }
        "bookmark.delete" => {
            let session = require_session(app)?;
            let id = str_param(params, "id").ok_or("missing id")?;
            app.bookmarks
                .remove(&session.user_id, id)
                .await
                .map_err(|e| e.to_string())?;
            Ok(json!({"ok": true}))
        }

        _ => Err(format!("unknown method: {}", method)),
    }
}
