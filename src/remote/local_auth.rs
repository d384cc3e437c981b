//! In-process identity provider.
//!
//! Models the redirect-based provider flow: [`AuthBackend::sign_in_with_provider`]
//! only records the request, and [`LocalAuth::complete_sign_in`] plays the
//! part of the provider redirecting back with a confirmed profile.

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::AuthBackend;
use crate::types::errors::AuthError;
use crate::types::events::{AuthEvent, AuthEventKind};
use crate::types::session::{ProviderConfig, Session, UserProfile};

const EVENT_CAPACITY: usize = 64;

#[derive(Default)]
struct AuthState {
    session: Option<Session>,
    pending: Option<ProviderConfig>,
    unreachable: bool,
}

pub struct LocalAuth {
    state: Mutex<AuthState>,
    events: broadcast::Sender<AuthEvent>,
}

impl Default for LocalAuth {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalAuth {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Mutex::new(AuthState::default()),
            events,
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, AuthState>, AuthError> {
        self.state
            .lock()
            .map_err(|_| AuthError::Provider("auth state lock poisoned".to_string()))
    }

    fn ensure_reachable(state: &AuthState) -> Result<(), AuthError> {
        if state.unreachable {
            Err(AuthError::Unreachable("local provider offline".to_string()))
        } else {
            Ok(())
        }
    }

    fn emit(&self, kind: AuthEventKind, session: Option<Session>) {
        // No receivers is fine; the event is simply not observed.
        let _ = self.events.send(AuthEvent { kind, session });
    }

    /// Simulates the provider going down or coming back.
    pub fn set_reachable(&self, reachable: bool) -> Result<(), AuthError> {
        self.state()?.unreachable = !reachable;
        Ok(())
    }

    /// Returns the provider config of the sign-in awaiting completion, if any.
    pub fn pending_sign_in(&self) -> Result<Option<ProviderConfig>, AuthError> {
        Ok(self.state()?.pending.clone())
    }

    /// The provider redirect: confirms the pending sign-in and announces the new session.
    pub fn complete_sign_in(
        &self,
        profile: UserProfile,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Session, AuthError> {
        let session = {
            let mut state = self.state()?;
            Self::ensure_reachable(&state)?;
            let config = state.pending.take().ok_or(AuthError::NoPendingSignIn)?;
            let session = Session::from_profile(profile, expires_at);
            info!(user = %session.user_id, provider = %config.provider, "sign-in completed");
            state.session = Some(session.clone());
            session
        };
        self.emit(AuthEventKind::SignedIn, Some(session.clone()));
        Ok(session)
    }

    /// The user backed out at the provider. No event is produced.
    pub fn cancel_sign_in(&self) -> Result<(), AuthError> {
        if self.state()?.pending.take().is_some() {
            debug!("pending sign-in cancelled");
        }
        Ok(())
    }

    /// Provider-side expiry or revocation of the current session.
    pub fn expire(&self) -> Result<(), AuthError> {
        let had_session = self.state()?.session.take().is_some();
        if had_session {
            info!("session expired");
            self.emit(AuthEventKind::Expired, None);
        }
        Ok(())
    }

    /// Token refresh keeping the same identity; pushes a new expiry.
    pub fn refresh_token(&self, expires_at: Option<DateTime<Utc>>) -> Result<(), AuthError> {
        let refreshed = {
            let mut state = self.state()?;
            Self::ensure_reachable(&state)?;
            match state.session.as_mut() {
                Some(session) => {
                    session.expires_at = expires_at;
                    Some(session.clone())
                }
                None => None,
            }
        };
        if let Some(session) = refreshed {
            self.emit(AuthEventKind::TokenRefreshed, Some(session));
        }
        Ok(())
    }
}

#[async_trait]
impl AuthBackend for LocalAuth {
    async fn get_session(&self) -> Result<Option<Session>, AuthError> {
        let state = self.state()?;
        Self::ensure_reachable(&state)?;
        Ok(state.session.clone())
    }

    fn auth_events(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }

    async fn sign_in_with_provider(&self, config: &ProviderConfig) -> Result<(), AuthError> {
        let mut state = self.state()?;
        Self::ensure_reachable(&state)?;
        debug!(provider = %config.provider, redirect_to = %config.redirect_to, "sign-in started");
        state.pending = Some(config.clone());
        Ok(())
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        let had_session = {
            let mut state = self.state()?;
            Self::ensure_reachable(&state)?;
            state.session.take().is_some()
        };
        if had_session {
            info!("signed out");
        }
        self.emit(AuthEventKind::SignedOut, None);
        Ok(())
    }
}
