use crate::authn_context::RequestedAuthnContext;
use crate::error::ValidationError;
use crate::sp::after;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::time::Duration;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Authn,
    Logout,
}

/// A request this SP issued and is still waiting on.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub id: String,
    pub kind: RequestKind,
    /// Policy the answering assertion is held to. Only set for AuthnRequests.
    pub authn_context: Option<RequestedAuthnContext>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PendingRequest {
    pub fn authn(
        id: impl Into<String>,
        authn_context: RequestedAuthnContext,
        issued_at: DateTime<Utc>,
        validity: Duration,
    ) -> Self {
        Self {
            id: id.into(),
            kind: RequestKind::Authn,
            authn_context: Some(authn_context),
            issued_at,
            expires_at: after(issued_at, validity),
        }
    }

    pub fn logout(id: impl Into<String>, issued_at: DateTime<Utc>, validity: Duration) -> Self {
        Self {
            id: id.into(),
            kind: RequestKind::Logout,
            authn_context: None,
            issued_at,
            expires_at: after(issued_at, validity),
        }
    }
}

/// Request IDs awaiting an answer, and the expiring set of IDs already
/// answered. Moving an ID from one to the other is the single atomic step
/// that lets exactly one of several concurrent submissions of the same
/// response through.
#[derive(Clone)]
pub struct RequestTracker {
    pending: Arc<DashMap<String, PendingRequest>>,
    consumed: Arc<DashMap<String, DateTime<Utc>>>,
    retention: Duration,
}

impl RequestTracker {
    /// `retention` is how long a consumed ID is remembered; it should match
    /// the request validity window.
    pub fn new(retention: Duration) -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
            consumed: Arc::new(DashMap::new()),
            retention,
        }
    }

    pub fn track(&self, request: PendingRequest) {
        self.pending.insert(request.id.clone(), request);
    }

    /// Looks up a pending request without consuming it.
    pub fn peek(
        &self,
        id: &str,
        kind: RequestKind,
        now: DateTime<Utc>,
    ) -> Result<PendingRequest, ValidationError> {
        if self.is_consumed(id, now) {
            return Err(ValidationError::ReplayedResponse(id.to_owned()));
        }
        let request = self
            .pending
            .get(id)
            .map(|r| r.clone())
            .filter(|r| r.kind == kind)
            .ok_or_else(|| ValidationError::UnsolicitedResponse(format!("unknown request {id}")))?;
        if now >= request.expires_at {
            return Err(ValidationError::UnsolicitedResponse(format!(
                "request {id} expired at {}",
                request.expires_at
            )));
        }
        Ok(request)
    }

    /// Moves `id` from pending to consumed. Of any number of concurrent
    /// callers, exactly one succeeds; the rest see `ReplayedResponse`.
    pub fn consume(
        &self,
        id: &str,
        kind: RequestKind,
        now: DateTime<Utc>,
    ) -> Result<PendingRequest, ValidationError> {
        match self.consumed.entry(id.to_owned()) {
            Entry::Occupied(mut entry) => {
                if now < *entry.get() {
                    return Err(ValidationError::ReplayedResponse(id.to_owned()));
                }
                let request = self.take_pending(id, kind)?;
                entry.insert(after(now, self.retention));
                Ok(request)
            }
            Entry::Vacant(entry) => {
                let request = self.take_pending(id, kind)?;
                entry.insert(after(now, self.retention));
                Ok(request)
            }
        }
    }

    /// Records the ID of an inbound message (an IdP-initiated LogoutRequest)
    /// so that the same message cannot be processed twice. The ID is kept
    /// for the usual retention and at least until `acceptable_until`, the
    /// last instant the message itself would still be accepted.
    pub fn record_inbound(
        &self,
        id: &str,
        now: DateTime<Utc>,
        acceptable_until: DateTime<Utc>,
    ) -> Result<(), ValidationError> {
        let until = after(now, self.retention).max(acceptable_until);
        match self.consumed.entry(id.to_owned()) {
            Entry::Occupied(entry) if now < *entry.get() => {
                Err(ValidationError::ReplayedResponse(id.to_owned()))
            }
            Entry::Occupied(mut entry) => {
                entry.insert(until);
                Ok(())
            }
            Entry::Vacant(entry) => {
                entry.insert(until);
                Ok(())
            }
        }
    }

    fn take_pending(&self, id: &str, kind: RequestKind) -> Result<PendingRequest, ValidationError> {
        self.pending
            .remove_if(id, |_, r| r.kind == kind)
            .map(|(_, r)| r)
            .ok_or_else(|| ValidationError::UnsolicitedResponse(format!("unknown request {id}")))
    }

    fn is_consumed(&self, id: &str, now: DateTime<Utc>) -> bool {
        self.consumed.get(id).is_some_and(|until| now < *until)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn consumed_len(&self) -> usize {
        self.consumed.len()
    }

    /// Drops expired pending requests and forgotten consumed IDs. Returns
    /// how many entries went away.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.pending.len() + self.consumed.len();
        self.pending.retain(|_, r| now < r.expires_at);
        self.consumed.retain(|_, until| now < *until);
        before.saturating_sub(self.pending.len() + self.consumed.len())
    }
}

pub async fn request_cleanup_task(tracker: RequestTracker) {
    let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
    loop {
        interval.tick().await;
        let removed = tracker.purge_expired(Utc::now());
        if removed > 0 {
            tracing::info!(removed, "cleaned up expired request IDs");
        }
    }
}
