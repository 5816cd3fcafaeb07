use crate::bindings::InboundMessage;
use crate::config::ServiceProviderConfig;
use crate::error::{ConfigurationError, Error, MetadataError, RequestError, SessionError, ValidationError};
use crate::idp::metadata::{IdentityProviderMetadata, MetadataStore};
use crate::session::{Session, SessionManager, SessionToken};
use crate::sp::acs::{Assertion, ResponseValidator};
use crate::sp::metadata::build_metadata;
use crate::sp::request::{OutboundRequest, RequestBuilder};
use crate::sp::slo::{LogoutOrchestrator, LogoutOutcome};
use crate::sp::tracker::{PendingRequest, RequestTracker};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Everything one service provider needs at runtime: its configuration, the
/// IdP metadata, outstanding requests and live sessions. Share it behind an
/// `Arc`; every method takes `&self`.
pub struct ServiceProvider {
    config: ServiceProviderConfig,
    metadata: MetadataStore,
    tracker: RequestTracker,
    sessions: SessionManager,
}

impl ServiceProvider {
    pub fn new(
        config: ServiceProviderConfig,
        idp: IdentityProviderMetadata,
    ) -> Result<Self, ConfigurationError> {
        for (name, value) in [
            ("entity_id", &config.entity_id),
            ("acs_url", &config.acs_url),
            ("slo_url", &config.slo_url),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigurationError::InvalidSetting {
                    name,
                    reason: "must not be empty".into(),
                });
            }
        }
        if idp.sso_endpoints().is_empty() {
            return Err(MetadataError::MissingEndpoint(idp.entity_id().to_owned()).into());
        }

        tracing::info!(
            sp = %config.entity_id,
            idp = %idp.entity_id(),
            authn_context = %config.requested_authn_context,
            "service provider ready"
        );
        Ok(Self {
            tracker: RequestTracker::new(config.request_validity),
            sessions: SessionManager::new(config.max_session_lifetime),
            metadata: MetadataStore::new(idp),
            config,
        })
    }

    pub fn config(&self) -> &ServiceProviderConfig {
        &self.config
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn tracker(&self) -> &RequestTracker {
        &self.tracker
    }

    pub fn idp_metadata(&self) -> Arc<IdentityProviderMetadata> {
        self.metadata.current()
    }

    /// Swaps in reloaded IdP metadata. Requests already in flight finish
    /// against the snapshot they started with.
    pub fn replace_idp_metadata(&self, idp: IdentityProviderMetadata) {
        self.metadata.replace(idp);
    }

    pub fn build_authn_request(
        &self,
        relay_state: Option<&str>,
    ) -> Result<OutboundRequest, RequestError> {
        self.build_authn_request_at(relay_state, Utc::now())
    }

    /// Builds an AuthnRequest and records its ID as pending, along with the
    /// authentication context the answer will be held to.
    pub fn build_authn_request_at(
        &self,
        relay_state: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<OutboundRequest, RequestError> {
        let idp = self.metadata.current();
        let request = RequestBuilder::new(&self.config, &idp).build_authn_request(relay_state, now)?;
        self.tracker.track(PendingRequest::authn(
            request.id.clone(),
            self.config.requested_authn_context,
            now,
            self.config.request_validity,
        ));
        Ok(request)
    }

    pub fn validate_response(
        &self,
        message: &InboundMessage,
        expected_in_response_to: Option<&str>,
    ) -> Result<Assertion, ValidationError> {
        self.validate_response_at(message, expected_in_response_to, Utc::now())
    }

    pub fn validate_response_at(
        &self,
        message: &InboundMessage,
        expected_in_response_to: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Assertion, ValidationError> {
        let idp = self.metadata.current();
        ResponseValidator::new(&self.config, &idp, &self.tracker).validate_at(
            message,
            expected_in_response_to,
            now,
        )
    }

    pub fn login(
        &self,
        message: &InboundMessage,
        expected_in_response_to: Option<&str>,
    ) -> Result<SessionToken, Error> {
        self.login_at(message, expected_in_response_to, Utc::now())
    }

    /// Validates the response and opens a session for its subject.
    pub fn login_at(
        &self,
        message: &InboundMessage,
        expected_in_response_to: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<SessionToken, Error> {
        let assertion = self.validate_response_at(message, expected_in_response_to, now)?;
        Ok(self.sessions.create_session_at(&assertion, now)?)
    }

    pub fn get_session(&self, token: &str) -> Result<Session, SessionError> {
        self.sessions.get_session(token)
    }

    pub fn delete_session(&self, token: &str) -> Result<(), SessionError> {
        self.sessions.delete_session(token).map(|_| ())
    }

    pub fn logout(&self, token: &str, relay_state: Option<&str>) -> LogoutOutcome {
        self.logout_at(token, relay_state, Utc::now())
    }

    pub fn logout_at(
        &self,
        token: &str,
        relay_state: Option<&str>,
        now: DateTime<Utc>,
    ) -> LogoutOutcome {
        let idp = self.metadata.current();
        self.orchestrator(&idp).begin(token, relay_state, now)
    }

    pub fn complete_logout(&self, message: &InboundMessage) -> Result<LogoutOutcome, ValidationError> {
        self.complete_logout_at(message, Utc::now())
    }

    pub fn complete_logout_at(
        &self,
        message: &InboundMessage,
        now: DateTime<Utc>,
    ) -> Result<LogoutOutcome, ValidationError> {
        let idp = self.metadata.current();
        self.orchestrator(&idp).complete_at(message, now)
    }

    pub fn handle_logout_request(&self, message: &InboundMessage) -> Result<OutboundRequest, Error> {
        self.handle_logout_request_at(message, Utc::now())
    }

    pub fn handle_logout_request_at(
        &self,
        message: &InboundMessage,
        now: DateTime<Utc>,
    ) -> Result<OutboundRequest, Error> {
        let idp = self.metadata.current();
        self.orchestrator(&idp).handle_logout_request_at(message, now)
    }

    pub fn metadata_xml(&self) -> anyhow::Result<String> {
        build_metadata(&self.config)
    }

    fn orchestrator<'a>(&'a self, idp: &'a IdentityProviderMetadata) -> LogoutOrchestrator<'a> {
        LogoutOrchestrator::new(&self.config, idp, &self.tracker, &self.sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::tests::generate_identity;
    use crate::sp::test_support::{idp, idp_metadata_with, sp_config};

    #[test]
    fn rejects_idp_without_sso_endpoint() {
        let (_, cert) = generate_identity("idp");
        let slo_only = r#"<md:SingleLogoutService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect" Location="https://idp.example.it/slo"/>"#;
        let metadata = idp_metadata_with(&cert, true, slo_only);
        assert!(matches!(
            ServiceProvider::new(sp_config(), metadata),
            Err(ConfigurationError::Metadata(MetadataError::MissingEndpoint(_)))
        ));
    }

    #[test]
    fn built_requests_are_tracked() {
        let (_, metadata) = idp();
        let sp = ServiceProvider::new(sp_config(), metadata).unwrap();
        let request = sp.build_authn_request(None).unwrap();
        assert_eq!(sp.tracker().pending_len(), 1);
        assert!(
            sp.tracker()
                .peek(&request.id, crate::sp::tracker::RequestKind::Authn, Utc::now())
                .is_ok()
        );
    }

    #[test]
    fn metadata_reload_swaps_snapshot() {
        let (_, first) = idp();
        let (_, second) = idp();
        let sp = ServiceProvider::new(sp_config(), first).unwrap();
        let before = sp.idp_metadata();
        sp.replace_idp_metadata(second);
        let after = sp.idp_metadata();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_ne!(
            before.signing_certificates()[0].to_der().unwrap(),
            after.signing_certificates()[0].to_der().unwrap()
        );
    }
}
