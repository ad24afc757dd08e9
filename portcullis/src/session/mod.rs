//! Server-side sessions keyed by a signed cookie.
//!
//! The [`session_middleware`] resolves the session cookie into a [`Session`] handle, places it in
//! the request extensions, and after the handler has run persists whatever changed and writes the
//! cookie back. Components that need session state take the handle explicitly, either through the
//! [`Session`] extractor or from the request extensions inside middleware.
//!
//! The cookie value is `<session id>.<hmac>`; a cookie whose signature does not verify is ignored
//! and the request proceeds with a fresh session. A fresh session that nothing writes to is never
//! persisted and never issues a cookie.

pub mod store;

use axum::{
    extract::{FromRequestParts, Request, State},
    http::{Extensions, HeaderMap, HeaderValue, header, request::Parts},
    middleware::Next,
    response::Response,
};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, instrument, trace};

use crate::{AppState, config::Config, crypto::random_token, errors::Error};
use store::{SessionRecord, SessionStore, SessionStoreError};

#[derive(Debug)]
struct SessionState {
    id: String,
    record: SessionRecord,
    /// The id exists in the store
    persisted: bool,
    dirty: bool,
    /// The id changed during this request and the client must learn it
    issue_cookie: bool,
    destroyed: bool,
}

/// Handle on the current request's session.
///
/// Clones share state, so middleware and handlers observe each other's writes.
#[derive(Clone)]
pub struct Session {
    state: Arc<Mutex<SessionState>>,
    store: Arc<dyn SessionStore>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("Session")
            .field("persisted", &state.persisted)
            .field("dirty", &state.dirty)
            .field("destroyed", &state.destroyed)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// A new, not yet persisted session.
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self::with_state(
            store,
            SessionState {
                id: random_token::<32>(),
                record: SessionRecord::default(),
                persisted: false,
                dirty: false,
                issue_cookie: false,
                destroyed: false,
            },
        )
    }

    /// A session previously loaded from `store` under `id`.
    pub fn restore(store: Arc<dyn SessionStore>, id: String, record: SessionRecord) -> Self {
        Self::with_state(
            store,
            SessionState {
                id,
                record,
                persisted: true,
                dirty: false,
                issue_cookie: false,
                destroyed: false,
            },
        )
    }

    fn with_state(store: Arc<dyn SessionStore>, state: SessionState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
            store,
        }
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> String {
        self.state().id.clone()
    }

    /// The stored principal, unvalidated
    pub fn raw_user(&self) -> Option<Value> {
        self.state().record.user.clone()
    }

    pub fn set_user(&self, user: Option<Value>) {
        let mut state = self.state();
        state.record.user = user;
        state.dirty = true;
    }

    pub fn csrf_secret(&self) -> Option<String> {
        self.state().record.csrf_secret.clone()
    }

    pub fn set_csrf_secret(&self, secret: Option<String>) {
        let mut state = self.state();
        state.record.csrf_secret = secret;
        state.dirty = true;
    }

    /// Epoch milliseconds of the last completed login
    pub fn last_auth_at(&self) -> Option<i64> {
        self.state().record.last_auth_at
    }

    pub fn set_last_auth_at(&self, epoch_ms: Option<i64>) {
        let mut state = self.state();
        state.record.last_auth_at = epoch_ms;
        state.dirty = true;
    }

    /// The session placed in the request extensions by [`session_middleware`].
    pub fn from_extensions(extensions: &Extensions) -> Result<Self, Error> {
        extensions.get::<Session>().cloned().ok_or_else(|| Error::Internal {
            operation: "read session: session middleware is not installed".to_string(),
        })
    }

    pub fn is_destroyed(&self) -> bool {
        self.state().destroyed
    }

    /// Replace the session id and start from an empty record.
    ///
    /// The old id is removed from the store first; if that fails the session is left untouched.
    #[instrument(skip_all, err)]
    pub async fn regenerate(&self) -> Result<(), SessionStoreError> {
        let (old_id, persisted) = {
            let state = self.state();
            (state.id.clone(), state.persisted)
        };

        if persisted {
            self.store.delete(&old_id).await?;
        }

        let mut state = self.state();
        state.id = random_token::<32>();
        state.record = SessionRecord::default();
        state.persisted = false;
        state.dirty = true;
        state.issue_cookie = true;
        state.destroyed = false;
        trace!("Session id regenerated");
        Ok(())
    }

    /// Write the record to the store, restarting its time-to-live.
    #[instrument(skip_all, err)]
    pub async fn save(&self) -> Result<(), SessionStoreError> {
        let (id, record, was_persisted) = {
            let state = self.state();
            if state.destroyed {
                return Ok(());
            }
            (state.id.clone(), state.record.clone(), state.persisted)
        };

        self.store.save(&id, &record).await?;

        let mut state = self.state();
        // A regeneration may have raced this write; only settle the id that was written
        if state.id == id {
            state.persisted = true;
            state.dirty = false;
            if !was_persisted {
                state.issue_cookie = true;
            }
        }
        Ok(())
    }

    /// Remove the session from the store and clear it. The cookie is cleared on the way out.
    #[instrument(skip_all, err)]
    pub async fn destroy(&self) -> Result<(), SessionStoreError> {
        let (id, persisted) = {
            let state = self.state();
            (state.id.clone(), state.persisted)
        };

        if persisted {
            self.store.delete(&id).await?;
        }

        let mut state = self.state();
        state.record = SessionRecord::default();
        state.persisted = false;
        state.dirty = false;
        state.destroyed = true;
        debug!("Session destroyed");
        Ok(())
    }
}

impl<S> FromRequestParts<S> for Session
where
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Session::from_extensions(&parts.extensions)
    }
}

/// Find a cookie by name across every `Cookie` header.
pub fn read_cookie<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|cookie| cookie.trim().split_once('='))
        .find(|(cookie_name, _)| *cookie_name == name)
        .map(|(_, value)| value)
}

fn session_cookie(value: &str, max_age_secs: u64, config: &Config) -> String {
    let secure = if config.environment.is_production() { "; Secure" } else { "" };
    format!(
        "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}{}",
        config.session.cookie_name, value, max_age_secs, secure
    )
}

/// Resolve the session for an incoming request.
#[instrument(skip_all)]
pub async fn load_session(state: &AppState, headers: &HeaderMap) -> Result<Session, Error> {
    let Some(id) = read_cookie(headers, &state.config.session.cookie_name).and_then(|sealed| state.signer.unseal(sealed)) else {
        return Ok(Session::new(state.sessions.clone()));
    };

    match state.sessions.load(id).await? {
        Some(record) => Ok(Session::restore(state.sessions.clone(), id.to_string(), record)),
        None => {
            trace!("Session cookie refers to an expired session");
            Ok(Session::new(state.sessions.clone()))
        }
    }
}

/// Persist the session after the handler ran and write the cookie.
#[instrument(skip_all)]
pub async fn commit_session(state: &AppState, session: &Session, response: &mut Response) -> Result<(), Error> {
    let config = &state.config;

    if session.is_destroyed() {
        let cookie = session_cookie("", 0, config);
        append_cookie(response, &cookie)?;
        return Ok(());
    }

    let (dirty, persisted) = {
        let s = session.state();
        (s.dirty, s.persisted)
    };

    if dirty || (persisted && config.session.rolling) {
        session.save().await?;
    }

    let (issue_cookie, persisted, id) = {
        let mut s = session.state();
        let issue = s.issue_cookie;
        s.issue_cookie = false;
        (issue, s.persisted, s.id.clone())
    };

    if issue_cookie || (persisted && config.session.rolling) {
        let cookie = session_cookie(&state.signer.seal(&id), config.session.max_age.as_secs(), config);
        append_cookie(response, &cookie)?;
    }

    Ok(())
}

fn append_cookie(response: &mut Response, cookie: &str) -> Result<(), Error> {
    let value = HeaderValue::from_str(cookie).map_err(|e| Error::Internal {
        operation: format!("encode session cookie: {e}"),
    })?;
    response.headers_mut().append(header::SET_COOKIE, value);
    Ok(())
}

/// Attach a [`Session`] to every request and persist it afterwards.
pub async fn session_middleware(State(state): State<AppState>, mut request: Request, next: Next) -> Result<Response, Error> {
    let session = load_session(&state, request.headers()).await?;
    request.extensions_mut().insert(session.clone());

    let mut response = next.run(request).await;
    commit_session(&state, &session, &mut response).await?;
    Ok(response)
}
