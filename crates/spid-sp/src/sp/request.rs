use crate::authn_context::Comparison;
use crate::bindings::{self, Binding, EncodedMessage, MessageKind};
use crate::config::ServiceProviderConfig;
use crate::error::RequestError;
use crate::idp::metadata::{Endpoint, IdentityProviderMetadata};
use crate::sp::acs::NameId;
use crate::sp::{NAMEID_ENTITY, NAMEID_TRANSIENT, after, format_instant};
use crate::xml::{SAML_ASSERTION_NS, SAML_PROTOCOL_NS};
use chrono::{DateTime, Utc};
use quick_xml::Writer;
use quick_xml::escape::escape;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use samael::schema::{
    AuthnContextClassRef, AuthnContextComparison, AuthnRequest, Issuer, LogoutResponse,
    NameIdPolicy, RequestedAuthnContext, Status, StatusCode,
};
use samael::traits::ToXml;
use std::io::Cursor;

const REQUEST_ID_BYTES: usize = 20;

const LOGOUT_REQUEST: &str = "saml2p:LogoutRequest";
const SESSION_INDEX: &str = "saml2p:SessionIndex";
const NAME_ID: &str = "saml2:NameID";

/// A request ready to send, together with the ID its answer must carry in
/// `InResponseTo`.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub id: String,
    pub message: EncodedMessage,
}

/// 160 random bits, hex encoded behind a leading underscore so the value is
/// a valid `xs:ID`.
pub fn new_request_id() -> Result<String, RequestError> {
    let mut buf = [0u8; REQUEST_ID_BYTES];
    openssl::rand::rand_bytes(&mut buf).map_err(|e| RequestError::Entropy(e.to_string()))?;
    let hex: String = buf.iter().map(|b| format!("{b:02x}")).collect();
    Ok(format!("_{hex}"))
}

fn pick(endpoints: &[Endpoint], preferred: Binding) -> Option<&Endpoint> {
    endpoints
        .iter()
        .find(|e| e.binding == preferred)
        .or_else(|| endpoints.first())
}

fn comparison(value: Comparison) -> AuthnContextComparison {
    match value {
        Comparison::Exact => AuthnContextComparison::Exact,
        Comparison::Minimum => AuthnContextComparison::Minimum,
        Comparison::Maximum => AuthnContextComparison::Maximum,
        Comparison::Better => AuthnContextComparison::Better,
    }
}

fn serialize<'a, T>(document: &'a T) -> Result<String, RequestError>
where
    T: ToXml<'a, Error = Box<dyn std::error::Error>>,
{
    document
        .to_string()
        .map_err(|e| RequestError::Encoding(e.to_string()))
}

/// The SP's LogoutRequest. samael's `LogoutRequest` has no `NotOnOrAfter`,
/// drops the NameID qualifiers and writes `SessionIndex` ahead of `NameID`,
/// so this one is serialized here in the same `Event` style.
struct LogoutRequestDocument<'a> {
    id: &'a str,
    issue_instant: DateTime<Utc>,
    not_on_or_after: DateTime<Utc>,
    destination: &'a str,
    issuer: Issuer,
    name_id: &'a NameId,
    session_index: Option<&'a str>,
}

impl TryFrom<&LogoutRequestDocument<'_>> for Event<'_> {
    type Error = Box<dyn std::error::Error>;

    fn try_from(value: &LogoutRequestDocument<'_>) -> Result<Self, Self::Error> {
        let mut write_buf = Vec::new();
        let mut writer = Writer::new(Cursor::new(&mut write_buf));
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        let mut root = BytesStart::new(LOGOUT_REQUEST);
        root.push_attribute(("xmlns:saml2p", SAML_PROTOCOL_NS));
        root.push_attribute(("xmlns:saml2", SAML_ASSERTION_NS));
        root.push_attribute(("ID", value.id));
        root.push_attribute(("Version", "2.0"));
        root.push_attribute(("IssueInstant", format_instant(value.issue_instant).as_str()));
        root.push_attribute(("Destination", value.destination));
        root.push_attribute((
            "NotOnOrAfter",
            format_instant(value.not_on_or_after).as_str(),
        ));
        writer.write_event(Event::Start(root))?;

        let issuer: Event<'_> = (&value.issuer).try_into()?;
        writer.write_event(issuer)?;

        let name_id = value.name_id;
        let mut start = BytesStart::new(NAME_ID);
        if let Some(format) = &name_id.format {
            start.push_attribute(("Format", format.as_str()));
        }
        if let Some(qualifier) = &name_id.name_qualifier {
            start.push_attribute(("NameQualifier", qualifier.as_str()));
        }
        if let Some(qualifier) = &name_id.sp_name_qualifier {
            start.push_attribute(("SPNameQualifier", qualifier.as_str()));
        }
        writer.write_event(Event::Start(start))?;
        writer.write_event(Event::Text(BytesText::new(&name_id.value)))?;
        writer.write_event(Event::End(BytesEnd::new(NAME_ID)))?;

        if let Some(session_index) = value.session_index {
            writer.write_event(Event::Start(BytesStart::new(SESSION_INDEX)))?;
            writer.write_event(Event::Text(BytesText::new(session_index)))?;
            writer.write_event(Event::End(BytesEnd::new(SESSION_INDEX)))?;
        }

        writer.write_event(Event::End(BytesEnd::new(LOGOUT_REQUEST)))?;
        Ok(Event::Text(BytesText::from_escaped(String::from_utf8(
            write_buf,
        )?)))
    }
}

pub struct RequestBuilder<'a> {
    config: &'a ServiceProviderConfig,
    idp: &'a IdentityProviderMetadata,
}

impl<'a> RequestBuilder<'a> {
    pub fn new(config: &'a ServiceProviderConfig, idp: &'a IdentityProviderMetadata) -> Self {
        Self { config, idp }
    }

    /// Builds a fresh AuthnRequest for the IdP's SSO endpoint, preferring the
    /// configured binding.
    pub fn build_authn_request(
        &self,
        relay_state: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<OutboundRequest, RequestError> {
        let endpoint = pick(self.idp.sso_endpoints(), self.config.preferred_binding)
            .ok_or(RequestError::NoEndpoint("SSO"))?;
        let id = new_request_id()?;
        let document = serialize(&self.authn_request(&id, &endpoint.location, now))?;
        let message = self.encode(
            endpoint.binding,
            &endpoint.location,
            MessageKind::Request,
            &document,
            &id,
            relay_state,
        )?;

        tracing::info!(
            request_id = %id,
            idp = %self.idp.entity_id(),
            binding = ?endpoint.binding,
            authn_context = %self.config.requested_authn_context,
            "built AuthnRequest"
        );
        Ok(OutboundRequest { id, message })
    }

    /// Builds a LogoutRequest for `name_id` addressed to the IdP's SLO
    /// endpoint.
    pub fn build_logout_request(
        &self,
        name_id: &NameId,
        session_index: Option<&str>,
        relay_state: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<OutboundRequest, RequestError> {
        let endpoint = pick(self.idp.slo_endpoints(), self.config.preferred_binding)
            .ok_or(RequestError::NoEndpoint("SLO"))?;
        let id = new_request_id()?;

        let document = serialize(&LogoutRequestDocument {
            id: &id,
            issue_instant: now,
            not_on_or_after: after(now, self.config.request_validity),
            destination: &endpoint.location,
            issuer: self.issuer(),
            name_id,
            session_index,
        })?;

        let message = self.encode(
            endpoint.binding,
            &endpoint.location,
            MessageKind::Request,
            &document,
            &id,
            relay_state,
        )?;

        tracing::info!(
            request_id = %id,
            idp = %self.idp.entity_id(),
            binding = ?endpoint.binding,
            "built LogoutRequest"
        );
        Ok(OutboundRequest { id, message })
    }

    /// Builds the LogoutResponse answering an IdP-initiated LogoutRequest.
    pub fn build_logout_response(
        &self,
        in_response_to: &str,
        status: &str,
        relay_state: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<OutboundRequest, RequestError> {
        let endpoint = pick(self.idp.slo_endpoints(), self.config.preferred_binding)
            .ok_or(RequestError::NoEndpoint("SLO"))?;
        let destination = endpoint
            .response_location
            .as_deref()
            .unwrap_or(&endpoint.location);
        let id = new_request_id()?;

        let response = LogoutResponse {
            id: Some(id.clone()),
            in_response_to: Some(in_response_to.to_owned()),
            version: Some("2.0".to_owned()),
            issue_instant: Some(now),
            destination: Some(destination.to_owned()),
            consent: None,
            issuer: Some(self.issuer()),
            signature: None,
            status: Some(Status {
                status_code: StatusCode {
                    value: Some(status.to_owned()),
                },
                status_message: None,
                status_detail: None,
            }),
        };
        let document = serialize(&response)?;

        let message = self.encode(
            endpoint.binding,
            destination,
            MessageKind::Response,
            &document,
            &id,
            relay_state,
        )?;
        Ok(OutboundRequest { id, message })
    }

    fn authn_request(&self, id: &str, destination: &str, now: DateTime<Utc>) -> AuthnRequest {
        let ctx = self.config.requested_authn_context;
        AuthnRequest {
            id: id.to_owned(),
            version: "2.0".to_owned(),
            issue_instant: now,
            destination: Some(destination.to_owned()),
            issuer: Some(self.issuer()),
            name_id_policy: Some(NameIdPolicy {
                format: Some(NAMEID_TRANSIENT.to_owned()),
                ..Default::default()
            }),
            requested_authn_context: Some(RequestedAuthnContext {
                authn_context_class_refs: Some(vec![AuthnContextClassRef {
                    value: Some(ctx.level.class_ref().to_owned()),
                }]),
                authn_context_decl_refs: None,
                comparison: Some(comparison(ctx.comparison)),
            }),
            force_authn: self.config.force_authn.then_some(true),
            assertion_consumer_service_url: Some(self.config.acs_url.clone()),
            protocol_binding: Some(Binding::HttpPost.uri().to_owned()),
            attribute_consuming_service_index: self
                .config
                .attribute_consuming_service_index
                .map(usize::from),
            ..Default::default()
        }
    }

    // samael writes the Issuer text as-is.
    fn issuer(&self) -> Issuer {
        Issuer {
            name_qualifier: Some(self.config.entity_id.clone()),
            format: Some(NAMEID_ENTITY.to_owned()),
            value: Some(escape(self.config.entity_id.as_str()).into_owned()),
            ..Default::default()
        }
    }

    /// Redirect messages carry a detached query signature; POST messages an
    /// enveloped one.
    fn encode(
        &self,
        binding: Binding,
        location: &str,
        kind: MessageKind,
        document: &str,
        id: &str,
        relay_state: Option<&str>,
    ) -> Result<EncodedMessage, RequestError> {
        let sign = self.config.sign_requests || self.idp.want_authn_requests_signed();
        let signer = sign.then(|| self.config.signer());
        match binding {
            Binding::HttpRedirect => {
                bindings::encode_redirect(location, kind, document, relay_state, signer.as_ref())
            }
            Binding::HttpPost => {
                let document = match &signer {
                    Some(signer) => signer
                        .sign_enveloped(document, id)
                        .map_err(|e| RequestError::Signing(e.to_string()))?,
                    None => document.to_owned(),
                };
                Ok(bindings::encode_post(location, kind, &document, relay_state))
            }
        }
    }
}
