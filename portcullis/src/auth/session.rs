//! Binding an authenticated principal to the session.

use chrono::Utc;
use tracing::{info, instrument};

use crate::{
    auth::principal::{self, Principal},
    errors::Error,
    session::Session,
};

/// Store `principal` in the session after a completed login.
///
/// The session id is regenerated so a pre-login id planted by an attacker is worthless
/// afterwards. The CSRF secret belongs to the session lineage rather than the principal, so it is
/// carried across the new id. If regeneration or the final write fails nothing is committed and
/// the login must be treated as incomplete.
#[instrument(skip_all, fields(user_id = %principal.id), err)]
pub async fn establish_session(session: &Session, principal: &Principal) -> Result<(), Error> {
    let csrf_secret = session.csrf_secret();

    session.regenerate().await?;

    session.set_csrf_secret(csrf_secret);
    session.set_user(Some(principal::encode(principal)));
    session.set_last_auth_at(Some(Utc::now().timestamp_millis()));

    if let Err(e) = session.save().await {
        // Leave nothing behind that a later request could mistake for a login
        session.set_user(None);
        session.set_last_auth_at(None);
        return Err(e.into());
    }

    info!("Session established");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::store::{MemorySessionStore, SessionRecord, SessionStore, SessionStoreError};
    use async_trait::async_trait;
    use std::{sync::Arc, time::Duration};

    /// Store whose deletes always fail, so regeneration of a persisted session fails
    struct BrokenDeleteStore(MemorySessionStore);

    #[async_trait]
    impl SessionStore for BrokenDeleteStore {
        async fn load(&self, id: &str) -> Result<Option<SessionRecord>, SessionStoreError> {
            self.0.load(id).await
        }

        async fn save(&self, id: &str, record: &SessionRecord) -> Result<(), SessionStoreError> {
            self.0.save(id, record).await
        }

        async fn delete(&self, _id: &str) -> Result<(), SessionStoreError> {
            Err(SessionStoreError::Unavailable("connection reset".to_string()))
        }
    }

    fn memory_store() -> Arc<dyn SessionStore> {
        Arc::new(MemorySessionStore::new(Duration::from_secs(60), 100))
    }

    fn principal() -> Principal {
        Principal::new("u-1", "ada@example.com", "Ada").with_roles(["user"])
    }

    #[tokio::test]
    async fn test_establish_preserves_csrf_secret_and_regenerates_id() {
        let store = memory_store();
        let session = Session::new(store.clone());
        session.set_csrf_secret(Some("lineage-secret".to_string()));
        session.save().await.unwrap();
        let pre_login_id = session.id();

        let before = Utc::now().timestamp_millis();
        establish_session(&session, &principal()).await.unwrap();
        let after = Utc::now().timestamp_millis();

        assert_ne!(session.id(), pre_login_id);
        assert_eq!(session.csrf_secret().as_deref(), Some("lineage-secret"));
        let last_auth_at = session.last_auth_at().unwrap();
        assert!(before <= last_auth_at && last_auth_at <= after);

        // The pre-login id is gone and the new id holds the principal
        assert!(store.load(&pre_login_id).await.unwrap().is_none());
        let stored = store.load(&session.id()).await.unwrap().unwrap();
        assert_eq!(stored.csrf_secret.as_deref(), Some("lineage-secret"));
        assert_eq!(principal::decode(&stored.user.unwrap()), Some(principal()));
    }

    #[tokio::test]
    async fn test_failed_regeneration_commits_no_principal() {
        let store: Arc<dyn SessionStore> = Arc::new(BrokenDeleteStore(MemorySessionStore::new(Duration::from_secs(60), 100)));
        let session = Session::new(store.clone());
        session.set_csrf_secret(Some("lineage-secret".to_string()));
        session.save().await.unwrap();
        let id = session.id();

        let result = establish_session(&session, &principal()).await;

        assert!(matches!(result, Err(Error::SessionStore(_))));
        assert!(session.raw_user().is_none());
        assert_eq!(session.id(), id);
        let stored = store.load(&id).await.unwrap().unwrap();
        assert!(stored.user.is_none());
        assert!(stored.last_auth_at.is_none());
    }

    #[tokio::test]
    async fn test_establish_on_fresh_session_without_secret() {
        let session = Session::new(memory_store());
        establish_session(&session, &principal()).await.unwrap();
        assert!(session.csrf_secret().is_none());
        assert!(session.raw_user().is_some());
    }
}
