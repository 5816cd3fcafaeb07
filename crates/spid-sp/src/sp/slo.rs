use crate::authn_context::AuthnLevel;
use crate::bindings::{EncodedMessage, InboundMessage};
use crate::config::ServiceProviderConfig;
use crate::error::{Error, ValidationError};
use crate::idp::metadata::IdentityProviderMetadata;
use crate::session::{Session, SessionManager};
use crate::sp::acs::{issuer_of, malformed, name_id_from, required_instant, verify_if_signed};
use crate::sp::request::{OutboundRequest, RequestBuilder};
use crate::sp::tracker::{PendingRequest, RequestKind, RequestTracker};
use crate::sp::{SAML_SUCCESS, after, parse_instant};
use crate::xml::{self, Element, SAML_ASSERTION_NS, SAML_PROTOCOL_NS};
use chrono::{DateTime, Utc};

/// Which logout exchange a session gets, decided by the level it was
/// authenticated at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogoutProfile {
    /// Signed LogoutRequest sent to the IdP; its answer is not awaited.
    Simple,
    /// Local teardown first, then optionally the signed request/response
    /// round trip with the IdP.
    SignedRoundTrip,
}

impl LogoutProfile {
    pub fn for_level(level: AuthnLevel) -> Self {
        match level {
            AuthnLevel::L1 => LogoutProfile::Simple,
            AuthnLevel::L2 | AuthnLevel::L3 => LogoutProfile::SignedRoundTrip,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogoutState {
    Idle,
    LocalTeardownPending,
    RemoteLogoutPending,
    Completed,
    Failed,
}

/// Result of one logout step: where to send the user agent next.
#[derive(Debug, Clone)]
pub struct LogoutOutcome {
    pub profile: Option<LogoutProfile>,
    pub state: LogoutState,
    /// ID of the LogoutRequest sent to the IdP, if one was.
    pub request_id: Option<String>,
    pub redirect: EncodedMessage,
}

struct LogoutAttempt {
    profile: Option<LogoutProfile>,
    state: LogoutState,
}

impl LogoutAttempt {
    fn new() -> Self {
        Self {
            profile: None,
            state: LogoutState::Idle,
        }
    }

    fn advance(&mut self, next: LogoutState) {
        tracing::debug!(profile = ?self.profile, from = ?self.state, to = ?next, "logout transition");
        self.state = next;
    }

    fn finish(mut self, next: LogoutState, request_id: Option<String>, redirect: EncodedMessage) -> LogoutOutcome {
        self.advance(next);
        LogoutOutcome {
            profile: self.profile,
            state: self.state,
            request_id,
            redirect,
        }
    }
}

/// Drives SP-initiated logout and answers IdP-initiated logout. Local
/// teardown always happens, whatever the IdP does.
pub struct LogoutOrchestrator<'a> {
    config: &'a ServiceProviderConfig,
    idp: &'a IdentityProviderMetadata,
    tracker: &'a RequestTracker,
    sessions: &'a SessionManager,
}

impl<'a> LogoutOrchestrator<'a> {
    pub fn new(
        config: &'a ServiceProviderConfig,
        idp: &'a IdentityProviderMetadata,
        tracker: &'a RequestTracker,
        sessions: &'a SessionManager,
    ) -> Self {
        Self {
            config,
            idp,
            tracker,
            sessions,
        }
    }

    fn landing(&self) -> EncodedMessage {
        EncodedMessage::Redirect {
            url: self.config.landing_url.clone(),
        }
    }

    /// Starts logout for the session behind `token`. Never fails: any error
    /// past this point is logged and the user still ends up logged out.
    pub fn begin(&self, token: &str, relay_state: Option<&str>, now: DateTime<Utc>) -> LogoutOutcome {
        let mut attempt = LogoutAttempt::new();
        let session = match self.sessions.get_session_at(token, now) {
            Ok(session) => session,
            Err(_) => {
                tracing::debug!("logout without a live session");
                return attempt.finish(LogoutState::Completed, None, self.landing());
            }
        };

        let profile = LogoutProfile::for_level(session.authn_level);
        attempt.profile = Some(profile);

        match profile {
            LogoutProfile::Simple => {
                let request = self.send_logout_request(&session, relay_state, now);
                attempt.advance(LogoutState::LocalTeardownPending);
                self.teardown(token);
                match request {
                    Some(request) => {
                        tracing::info!(request_id = %request.id, "logged out, notifying identity provider");
                        attempt.finish(LogoutState::Completed, Some(request.id), request.message)
                    }
                    None => attempt.finish(LogoutState::Failed, None, self.landing()),
                }
            }
            LogoutProfile::SignedRoundTrip => {
                attempt.advance(LogoutState::LocalTeardownPending);
                self.teardown(token);
                if !self.config.remote_slo {
                    tracing::info!("logged out locally");
                    return attempt.finish(LogoutState::Completed, None, self.landing());
                }
                match self.send_logout_request(&session, relay_state, now) {
                    Some(request) => {
                        tracing::info!(request_id = %request.id, "logged out locally, awaiting identity provider");
                        attempt.finish(
                            LogoutState::RemoteLogoutPending,
                            Some(request.id),
                            request.message,
                        )
                    }
                    None => attempt.finish(LogoutState::Failed, None, self.landing()),
                }
            }
        }
    }

    fn send_logout_request(
        &self,
        session: &Session,
        relay_state: Option<&str>,
        now: DateTime<Utc>,
    ) -> Option<OutboundRequest> {
        let built = RequestBuilder::new(self.config, self.idp).build_logout_request(
            &session.name_id,
            session.session_index.as_deref(),
            relay_state,
            now,
        );
        match built {
            Ok(request) => {
                self.tracker.track(PendingRequest::logout(
                    request.id.clone(),
                    now,
                    self.config.request_validity,
                ));
                Some(request)
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to build LogoutRequest, continuing with local logout");
                None
            }
        }
    }

    fn teardown(&self, token: &str) {
        if let Err(e) = self.sessions.delete_session(token) {
            tracing::error!(error = %e, "local session teardown failed, continuing logout");
        }
    }

    pub fn complete(&self, message: &InboundMessage) -> Result<LogoutOutcome, ValidationError> {
        self.complete_at(message, Utc::now())
    }

    /// Validates the IdP's LogoutResponse to a round-trip logout. A rejected
    /// response never brings the local session back.
    pub fn complete_at(
        &self,
        message: &InboundMessage,
        now: DateTime<Utc>,
    ) -> Result<LogoutOutcome, ValidationError> {
        let result = xml::parse(message.xml())
            .map_err(|e| malformed(e.to_string()))
            .and_then(|root| self.check_logout_response(&root, message, now));
        match result {
            Ok(request_id) => {
                tracing::info!(request_id = %request_id, "logout completed");
                let mut attempt = LogoutAttempt::new();
                attempt.profile = Some(LogoutProfile::SignedRoundTrip);
                attempt.advance(LogoutState::RemoteLogoutPending);
                Ok(attempt.finish(LogoutState::Completed, Some(request_id), self.landing()))
            }
            Err(error) => {
                tracing::warn!(kind = error.kind(), error = %error, "rejected LogoutResponse");
                Err(error)
            }
        }
    }

    fn check_logout_response(
        &self,
        root: &Element,
        message: &InboundMessage,
        now: DateTime<Utc>,
    ) -> Result<String, ValidationError> {
        self.check_envelope(root, message, "LogoutResponse", now)?;

        let in_response_to = root
            .attr("InResponseTo")
            .ok_or_else(|| ValidationError::UnsolicitedResponse("no InResponseTo".into()))?;
        self.tracker
            .consume(in_response_to, RequestKind::Logout, now)?;

        let status = root
            .child(SAML_PROTOCOL_NS, "Status")
            .ok_or_else(|| malformed("LogoutResponse has no Status"))?;
        let code = status
            .child(SAML_PROTOCOL_NS, "StatusCode")
            .and_then(|c| c.attr("Value"))
            .ok_or_else(|| malformed("LogoutResponse has no StatusCode"))?;
        if code != SAML_SUCCESS {
            return Err(ValidationError::StatusNotSuccess {
                status: code.to_owned(),
                message: status
                    .child(SAML_PROTOCOL_NS, "StatusMessage")
                    .map(|m| m.text()),
            });
        }
        Ok(in_response_to.to_owned())
    }

    pub fn handle_logout_request(&self, message: &InboundMessage) -> Result<OutboundRequest, Error> {
        self.handle_logout_request_at(message, Utc::now())
    }

    /// Answers an IdP-initiated LogoutRequest: ends the subject's session
    /// and returns the signed LogoutResponse to send back.
    pub fn handle_logout_request_at(
        &self,
        message: &InboundMessage,
        now: DateTime<Utc>,
    ) -> Result<OutboundRequest, Error> {
        let root = xml::parse(message.xml()).map_err(|e| malformed(e.to_string()));
        let (request_id, ended) = match root.and_then(|root| self.apply_logout_request(&root, message, now)) {
            Ok(applied) => applied,
            Err(error) => {
                tracing::warn!(kind = error.kind(), error = %error, "rejected LogoutRequest");
                return Err(error.into());
            }
        };
        tracing::info!(request_id = %request_id, ended, "identity provider ended session");

        let response = RequestBuilder::new(self.config, self.idp).build_logout_response(
            &request_id,
            SAML_SUCCESS,
            message.relay_state(),
            now,
        )?;
        Ok(response)
    }

    fn apply_logout_request(
        &self,
        root: &Element,
        message: &InboundMessage,
        now: DateTime<Utc>,
    ) -> Result<(String, bool), ValidationError> {
        let acceptable_until = self.check_envelope(root, message, "LogoutRequest", now)?;

        if let Some(value) = root.attr("NotOnOrAfter") {
            let expires = parse_instant(value)
                .ok_or_else(|| malformed(format!("invalid NotOnOrAfter {value:?}")))?;
            if now >= after(expires, self.config.clock_skew) {
                return Err(ValidationError::ExpiredAssertion(format!(
                    "logout request expired at {expires}"
                )));
            }
        }

        let name_id = root
            .child(SAML_ASSERTION_NS, "NameID")
            .ok_or_else(|| malformed("LogoutRequest has no NameID"))
            .and_then(name_id_from)?;
        let id = root
            .attr("ID")
            .ok_or_else(|| malformed("LogoutRequest has no ID"))?;
        self.tracker.record_inbound(id, now, acceptable_until)?;

        let indexes: Vec<String> = root
            .children_named(SAML_PROTOCOL_NS, "SessionIndex")
            .map(|i| i.text())
            .collect();
        let ended = if indexes.is_empty() {
            self.sessions.delete_by_subject(&name_id.value, None).is_some()
        } else {
            indexes
                .iter()
                .any(|index| self.sessions.delete_by_subject(&name_id.value, Some(index)).is_some())
        };
        Ok((id.to_owned(), ended))
    }

    /// Checks shared by inbound logout messages: type, signature, issuer,
    /// destination and issue instant. Returns the instant from which the
    /// message counts as too old.
    fn check_envelope(
        &self,
        root: &Element,
        message: &InboundMessage,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, ValidationError> {
        if !root.is(SAML_PROTOCOL_NS, name) {
            return Err(malformed(format!(
                "expected samlp:{name}, got {}",
                root.local_name()
            )));
        }
        if root.attr("Version") != Some("2.0") {
            return Err(malformed("unsupported SAML version"));
        }
        root.ensure_unique_ids()
            .map_err(|e| malformed(e.to_string()))?;

        let trusted = self.idp.signing_certificates();
        let detached = message.verify_detached(trusted)?;
        let enveloped = verify_if_signed(root, root, trusted)?;
        if !(detached || enveloped) {
            return Err(ValidationError::SignatureInvalid(format!(
                "{name} is not signed"
            )));
        }

        let issuer = issuer_of(root);
        if issuer.as_deref() != Some(self.idp.entity_id()) {
            return Err(ValidationError::IssuerMismatch {
                expected: self.idp.entity_id().to_owned(),
                actual: issuer,
            });
        }

        let destination = root.attr("Destination");
        if destination != Some(self.config.slo_url.as_str()) {
            return Err(ValidationError::DestinationMismatch {
                expected: self.config.slo_url.clone(),
                actual: destination.map(str::to_owned),
            });
        }

        let issued = required_instant(root, "IssueInstant")?;
        if issued > after(now, self.config.clock_skew) {
            return Err(ValidationError::NotYetValid(format!(
                "{name} issued in the future at {issued}"
            )));
        }
        let max_age = self.config.request_validity.saturating_add(self.config.clock_skew);
        let too_old = after(issued, max_age);
        if now >= too_old {
            return Err(ValidationError::ExpiredAssertion(format!(
                "{name} issued at {issued} is too old"
            )));
        }
        Ok(too_old)
    }
}
