use crate::attributes::AttributeMap;
use crate::authn_context::AuthnLevel;
use crate::error::SessionError;
use crate::sp::acs::{Assertion, NameId};
use crate::sp::after;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

const TOKEN_BYTES: usize = 32;
const CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Opaque session handle given to the host application.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SessionToken(String);

impl SessionToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl From<String> for SessionToken {
    fn from(token: String) -> Self {
        Self(token)
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionToken(..)")
    }
}

fn new_token() -> Result<SessionToken, SessionError> {
    let mut buf = [0u8; TOKEN_BYTES];
    openssl::rand::rand_bytes(&mut buf).map_err(|e| SessionError::Entropy(e.to_string()))?;
    Ok(SessionToken(URL_SAFE_NO_PAD.encode(buf)))
}

/// Snapshot of a validated assertion, bound to one token.
#[derive(Debug, Clone)]
pub struct Session {
    pub token: SessionToken,
    pub subject: String,
    pub name_id: NameId,
    pub session_index: Option<String>,
    pub idp_entity_id: String,
    pub authn_level: AuthnLevel,
    pub attributes: AttributeMap,
    pub created_at: DateTime<Utc>,
    /// Never later than the assertion's `NotOnOrAfter`.
    pub expires_at: DateTime<Utc>,
}

/// Owns every session record. A subject has at most one live session; a new
/// login replaces the previous one.
#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<DashMap<String, Session>>,
    by_subject: Arc<DashMap<String, SessionToken>>,
    max_lifetime: Duration,
}

impl SessionManager {
    pub fn new(max_lifetime: Duration) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            by_subject: Arc::new(DashMap::new()),
            max_lifetime,
        }
    }

    pub fn create_session(&self, assertion: &Assertion) -> Result<SessionToken, SessionError> {
        self.create_session_at(assertion, Utc::now())
    }

    /// Expiry is the earliest of the assertion's `NotOnOrAfter`, its
    /// `SessionNotOnOrAfter`, the bearer confirmation's `NotOnOrAfter` and
    /// `now` plus the maximum lifetime.
    pub fn create_session_at(
        &self,
        assertion: &Assertion,
        now: DateTime<Utc>,
    ) -> Result<SessionToken, SessionError> {
        let expires_at = [
            assertion.not_on_or_after,
            assertion.session_not_on_or_after,
            assertion.confirmation_not_on_or_after,
        ]
        .into_iter()
        .flatten()
        .fold(after(now, self.max_lifetime), |earliest, limit| earliest.min(limit));
        if expires_at <= now {
            return Err(SessionError::AlreadyExpired);
        }

        let token = new_token()?;
        let session = Session {
            token: token.clone(),
            subject: assertion.subject.clone(),
            name_id: assertion.name_id.clone(),
            session_index: assertion.session_index.clone(),
            idp_entity_id: assertion.issuer.clone(),
            authn_level: assertion.authn_level,
            attributes: assertion.attributes.clone(),
            created_at: now,
            expires_at,
        };
        self.sessions.insert(token.as_str().to_owned(), session);

        if let Some(previous) = self
            .by_subject
            .insert(assertion.subject.clone(), token.clone())
            && previous != token
        {
            self.sessions.remove(previous.as_str());
            tracing::info!(idp = %assertion.issuer, "replaced previous session for subject");
        }

        tracing::info!(
            idp = %assertion.issuer,
            level = %assertion.authn_level,
            %expires_at,
            "created session"
        );
        Ok(token)
    }

    pub fn get_session(&self, token: &str) -> Result<Session, SessionError> {
        self.get_session_at(token, Utc::now())
    }

    /// Returns a copy of the session. An expired session is removed and
    /// reported as not found.
    pub fn get_session_at(&self, token: &str, now: DateTime<Utc>) -> Result<Session, SessionError> {
        let entry = self.sessions.get(token).ok_or(SessionError::NotFound)?;
        if now < entry.expires_at {
            return Ok(entry.clone());
        }
        drop(entry);

        if let Some((_, session)) = self.sessions.remove_if(token, |_, s| now >= s.expires_at) {
            self.unlink_subject(&session);
        }
        Err(SessionError::NotFound)
    }

    /// Removes the session and returns it. A second delete of the same token
    /// reports `NotFound`.
    pub fn delete_session(&self, token: &str) -> Result<Session, SessionError> {
        let (_, session) = self.sessions.remove(token).ok_or(SessionError::NotFound)?;
        self.unlink_subject(&session);
        tracing::info!(idp = %session.idp_entity_id, "deleted session");
        Ok(session)
    }

    pub fn session_for_subject(&self, subject: &str) -> Option<Session> {
        let token = self.by_subject.get(subject)?.clone();
        self.sessions.get(token.as_str()).map(|s| s.clone())
    }

    /// Deletes the subject's session. When `session_index` is given it must
    /// match the one the session was created with.
    pub fn delete_by_subject(&self, subject: &str, session_index: Option<&str>) -> Option<Session> {
        let session = self.session_for_subject(subject)?;
        if let (Some(wanted), Some(actual)) = (session_index, session.session_index.as_deref())
            && wanted != actual
        {
            tracing::debug!("session index does not match, keeping session");
            return None;
        }
        self.delete_session(session.token.as_str()).ok()
    }

    fn unlink_subject(&self, session: &Session) {
        self.by_subject
            .remove_if(&session.subject, |_, token| *token == session.token);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drops every session past its expiry. Returns how many went away.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, s| now < s.expires_at);
        self.by_subject
            .retain(|_, token| self.sessions.contains_key(token.as_str()));
        before.saturating_sub(self.sessions.len())
    }
}

pub async fn session_cleanup_task(manager: SessionManager) {
    let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
    loop {
        interval.tick().await;
        let removed = manager.purge_expired(Utc::now());
        if removed > 0 {
            tracing::info!(removed, "cleaned up expired sessions");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::FISCAL_NUMBER;
    use std::collections::{BTreeMap, HashSet};

    const MAX: Duration = Duration::from_secs(8 * 60 * 60);

    fn assertion(subject: &str, now: DateTime<Utc>, validity: Duration) -> Assertion {
        Assertion {
            id: "_a1".into(),
            issuer: "https://idp.example.it".into(),
            subject: subject.into(),
            name_id: NameId {
                value: subject.into(),
                format: None,
                name_qualifier: None,
                sp_name_qualifier: None,
            },
            session_index: Some("_s1".into()),
            authn_level: AuthnLevel::L2,
            issue_instant: now,
            not_before: Some(now),
            not_on_or_after: Some(after(now, validity)),
            session_not_on_or_after: None,
            confirmation_not_on_or_after: Some(after(now, validity)),
            audiences: vec!["https://sp.example.it".into()],
            attributes: BTreeMap::from([(FISCAL_NUMBER.to_owned(), vec!["TINIT-X".to_owned()])]),
            in_response_to: "_r1".into(),
        }
    }

    #[test]
    fn session_snapshots_assertion() {
        let now = Utc::now();
        let manager = SessionManager::new(MAX);
        let token = manager
            .create_session_at(&assertion("AB12CD34", now, Duration::from_secs(300)), now)
            .unwrap();

        let session = manager.get_session_at(token.as_str(), now).unwrap();
        assert_eq!(session.subject, "AB12CD34");
        assert_eq!(session.authn_level, AuthnLevel::L2);
        assert_eq!(session.expires_at, after(now, Duration::from_secs(300)));
        assert!(session.attributes.contains_key(FISCAL_NUMBER));
    }

    #[test]
    fn expiry_is_capped_by_max_lifetime() {
        let now = Utc::now();
        let manager = SessionManager::new(Duration::from_secs(60));
        let token = manager
            .create_session_at(&assertion("s", now, Duration::from_secs(3600)), now)
            .unwrap();
        let session = manager.get_session_at(token.as_str(), now).unwrap();
        assert_eq!(session.expires_at, after(now, Duration::from_secs(60)));
    }

    #[test]
    fn session_not_on_or_after_also_caps_expiry() {
        let now = Utc::now();
        let manager = SessionManager::new(MAX);
        let mut a = assertion("s", now, Duration::from_secs(3600));
        a.session_not_on_or_after = Some(after(now, Duration::from_secs(10)));
        let token = manager.create_session_at(&a, now).unwrap();
        assert_eq!(
            manager.get_session_at(token.as_str(), now).unwrap().expires_at,
            after(now, Duration::from_secs(10))
        );
    }

    #[test]
    fn bearer_confirmation_also_caps_expiry() {
        let now = Utc::now();
        let manager = SessionManager::new(MAX);
        let mut a = assertion("s", now, Duration::from_secs(3600));
        a.confirmation_not_on_or_after = Some(after(now, Duration::from_secs(120)));
        let token = manager.create_session_at(&a, now).unwrap();
        assert_eq!(
            manager.get_session_at(token.as_str(), now).unwrap().expires_at,
            after(now, Duration::from_secs(120))
        );
    }

    #[test]
    fn expired_assertion_yields_no_session() {
        let now = Utc::now();
        let manager = SessionManager::new(MAX);
        assert_eq!(
            manager
                .create_session_at(&assertion("s", now, Duration::ZERO), now)
                .unwrap_err(),
            SessionError::AlreadyExpired
        );
        assert!(manager.is_empty());
    }

    #[test]
    fn delete_is_idempotent() {
        let now = Utc::now();
        let manager = SessionManager::new(MAX);
        let token = manager
            .create_session_at(&assertion("s", now, Duration::from_secs(60)), now)
            .unwrap();

        assert!(manager.delete_session(token.as_str()).is_ok());
        assert_eq!(
            manager.delete_session(token.as_str()).unwrap_err(),
            SessionError::NotFound
        );
        assert!(manager.session_for_subject("s").is_none());
    }

    #[test]
    fn lookup_after_expiry_is_not_found() {
        let now = Utc::now();
        let manager = SessionManager::new(MAX);
        let token = manager
            .create_session_at(&assertion("s", now, Duration::from_secs(60)), now)
            .unwrap();
        let later = after(now, Duration::from_secs(60));
        assert_eq!(
            manager.get_session_at(token.as_str(), later).unwrap_err(),
            SessionError::NotFound
        );
        assert!(manager.is_empty());
        assert!(manager.session_for_subject("s").is_none());
    }

    #[test]
    fn new_login_replaces_previous_session() {
        let now = Utc::now();
        let manager = SessionManager::new(MAX);
        let first = manager
            .create_session_at(&assertion("s", now, Duration::from_secs(60)), now)
            .unwrap();
        let mut stronger = assertion("s", now, Duration::from_secs(60));
        stronger.authn_level = AuthnLevel::L3;
        let second = manager.create_session_at(&stronger, now).unwrap();

        assert_ne!(first, second);
        assert_eq!(
            manager.get_session_at(first.as_str(), now).unwrap_err(),
            SessionError::NotFound
        );
        assert_eq!(
            manager.session_for_subject("s").unwrap().authn_level,
            AuthnLevel::L3
        );
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn delete_by_subject_checks_session_index() {
        let now = Utc::now();
        let manager = SessionManager::new(MAX);
        manager
            .create_session_at(&assertion("s", now, Duration::from_secs(60)), now)
            .unwrap();

        assert!(manager.delete_by_subject("s", Some("_other")).is_none());
        assert!(manager.delete_by_subject("s", Some("_s1")).is_some());
        assert!(manager.delete_by_subject("s", None).is_none());
    }

    #[test]
    fn tokens_are_unique_and_url_safe() {
        let now = Utc::now();
        let manager = SessionManager::new(MAX);
        let mut seen = HashSet::new();
        for i in 0..1000 {
            let token = manager
                .create_session_at(&assertion(&format!("s{i}"), now, Duration::from_secs(60)), now)
                .unwrap();
            assert_eq!(token.as_str().len(), 43);
            assert!(
                token
                    .as_str()
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            );
            assert!(seen.insert(token.into_string()));
        }
    }

    #[test]
    fn token_debug_is_redacted() {
        let token = SessionToken::from("secret".to_owned());
        assert_eq!(format!("{token:?}"), "SessionToken(..)");
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_task_purges_expired_sessions() {
        let now = Utc::now();
        let manager = SessionManager::new(MAX);
        manager
            .create_session_at(&assertion("s", now, Duration::from_millis(1)), now)
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));

        let handle = tokio::spawn(session_cleanup_task(manager.clone()));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(manager.is_empty());
        handle.abort();
    }
}
