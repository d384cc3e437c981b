//! Session Manager.
//!
//! Owns the client's view of the authentication state. The current session is
//! published on a `tokio::sync::watch` channel fed by the auth backend's event
//! stream; the gate policy reads it to decide whether protected views are
//! reachable.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::remote::AuthBackend;
use crate::types::errors::{AuthError, GateError, SettingsError};
use crate::types::events::{AuthEvent, AuthEventKind};
use crate::types::session::{ProviderConfig, Session};
use crate::types::settings::ClientSettings;

/// Trait defining session and gate operations.
#[async_trait]
pub trait SessionManagerTrait {
    fn current_session(&self) -> Option<Session>;
    fn watch(&self) -> watch::Receiver<Option<Session>>;
    fn on_session_change<F>(&self, handler: F) -> ListenerHandle
    where
        F: Fn(Option<Session>) + Send + 'static;
    async fn sign_in(&self) -> Result<(), AuthError>;
    async fn sign_out(&self) -> Result<(), AuthError>;
    fn gate(&self) -> Route;
    fn require_session(&self) -> Result<Session, GateError>;
    fn redirect_for(&self, path: &str) -> Option<String>;
    fn provider(&self) -> &ProviderConfig;
    fn shutdown(&self);
}

/// Where the gate sends the user.
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    /// No live session; only the sign-in page is reachable.
    SignIn,
    /// The protected bookmark view for this session.
    Dashboard(Session),
}

/// A registered session-change listener. Dropping it unsubscribes as well.
pub struct ListenerHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn unsubscribe(self) {
        self.token.cancel();
    }

    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled() && !self.task.is_finished()
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

pub struct SessionManager {
    auth: Arc<dyn AuthBackend>,
    state: Arc<watch::Sender<Option<Session>>>,
    /// Set between a confirmed sign-out and the provider's `SignedOut` event.
    signing_out: Arc<AtomicBool>,
    provider: ProviderConfig,
    sign_in_path: String,
    dashboard_path: String,
    shutdown: CancellationToken,
}

impl SessionManager {
    /// Subscribes to the backend's auth events, then reads the current
    /// session once. Subscribing first means no event between that read and
    /// the subscription can be missed.
    ///
    /// An unreachable provider leaves the manager with no session.
    pub async fn start(auth: Arc<dyn AuthBackend>, settings: &ClientSettings) -> Result<Self, SettingsError> {
        let provider = settings.provider_config()?;
        let events = auth.auth_events();

        let initial = match auth.get_session().await {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "initial session lookup failed");
                None
            }
        };
        info!(
            user = initial.as_ref().map(|s| s.user_id.as_str()).unwrap_or("-"),
            "session manager started"
        );

        let (tx, _) = watch::channel(initial);
        let state = Arc::new(tx);
        let signing_out = Arc::new(AtomicBool::new(false));
        let shutdown = CancellationToken::new();

        tokio::spawn(pump_events(
            auth.clone(),
            events,
            state.clone(),
            signing_out.clone(),
            shutdown.child_token(),
        ));

        Ok(Self {
            auth,
            state,
            signing_out,
            provider,
            sign_in_path: settings.sign_in_path.clone(),
            dashboard_path: settings.dashboard_path.clone(),
            shutdown,
        })
    }
}

#[async_trait]
impl SessionManagerTrait for SessionManager {
    /// The most recently observed session.
    fn current_session(&self) -> Option<Session> {
        self.state.borrow().clone()
    }

    /// A receiver that sees the current value and every later change.
    fn watch(&self) -> watch::Receiver<Option<Session>> {
        self.state.subscribe()
    }

    /// Calls `handler` with the new value after every session change.
    /// Bursts collapse to the latest value.
    fn on_session_change<F>(&self, handler: F) -> ListenerHandle
    where
        F: Fn(Option<Session>) + Send + 'static,
    {
        let mut rx = self.state.subscribe();
        let token = self.shutdown.child_token();
        let cancel = token.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let session = rx.borrow_and_update().clone();
                        handler(session);
                    }
                }
            }
        });

        ListenerHandle { token, task }
    }

    /// Starts the provider sign-in. The result shows up later as a session change.
    async fn sign_in(&self) -> Result<(), AuthError> {
        info!(provider = %self.provider.provider, "starting sign-in");
        self.auth.sign_in_with_provider(&self.provider).await.map_err(|e| {
            warn!(error = %e, "sign-in could not be started");
            e
        })
    }

    /// Ends the session. The local session is dropped even when the provider
    /// call fails, so the gate closes before this returns. Session-bearing
    /// events queued ahead of the provider's `SignedOut` are ignored.
    async fn sign_out(&self) -> Result<(), AuthError> {
        self.signing_out.store(true, Ordering::SeqCst);
        let result = self.auth.sign_out().await;
        if result.is_err() {
            // No `SignedOut` will follow a failed call.
            self.signing_out.store(false, Ordering::SeqCst);
        }
        publish(&self.state, None);
        match &result {
            Ok(()) => info!("signed out"),
            Err(e) => warn!(error = %e, "provider sign-out failed; local session dropped"),
        }
        result
    }

    fn gate(&self) -> Route {
        match self.current_session() {
            Some(session) => Route::Dashboard(session),
            None => Route::SignIn,
        }
    }

    /// The live session, or the redirect to sign-in.
    fn require_session(&self) -> Result<Session, GateError> {
        self.current_session()
            .ok_or_else(|| GateError::SignInRequired(self.sign_in_path.clone()))
    }

    /// Redirect target for a visit to `path`, if the visitor must be moved.
    fn redirect_for(&self, path: &str) -> Option<String> {
        let signed_in = self.state.borrow().is_some();
        if signed_in && path == self.sign_in_path {
            Some(self.dashboard_path.clone())
        } else if !signed_in && path == self.dashboard_path {
            Some(self.sign_in_path.clone())
        } else {
            None
        }
    }

    fn provider(&self) -> &ProviderConfig {
        &self.provider
    }

    /// Stops the event pump and every listener.
    fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Replaces the session if it differs. Returns true when a change was published.
fn publish(state: &watch::Sender<Option<Session>>, session: Option<Session>) -> bool {
    state.send_if_modified(|current| {
        if *current == session {
            false
        } else {
            *current = session;
            true
        }
    })
}

async fn pump_events(
    auth: Arc<dyn AuthBackend>,
    mut events: broadcast::Receiver<AuthEvent>,
    state: Arc<watch::Sender<Option<Session>>>,
    signing_out: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            received = events.recv() => received,
        };

        match received {
            Ok(event) => {
                if event.kind == AuthEventKind::SignedOut {
                    signing_out.store(false, Ordering::SeqCst);
                } else if event.session.is_some() && signing_out.load(Ordering::SeqCst) {
                    debug!(kind = ?event.kind, "auth event from before sign-out ignored");
                    continue;
                }
                let user = event.session.as_ref().map(|s| s.user_id.clone());
                if publish(&state, event.session) {
                    info!(kind = ?event.kind, user = user.as_deref().unwrap_or("-"), "session changed");
                } else {
                    debug!(kind = ?event.kind, "auth event without session change");
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                // Missed events; the provider's current answer supersedes them.
                warn!(skipped, "auth events lagged, re-probing session");
                signing_out.store(false, Ordering::SeqCst);
                match auth.get_session().await {
                    Ok(session) => {
                        publish(&state, session);
                    }
                    Err(e) => warn!(error = %e, "session re-read failed"),
                }
            }
            Err(broadcast::error::RecvError::Closed) => {
                debug!("auth event stream closed");
                break;
            }
        }
    }
}
