use crate::attributes::AttributeMap;
use crate::authn_context::AuthnLevel;
use crate::config::ServiceProviderConfig;
use crate::idp::metadata::IdentityProviderMetadata;
use crate::signature::tests::generate_identity;
use crate::signature::{SignatureAlgorithm, XmlSigner};
use crate::sp::acs::{Assertion, NameId};
use crate::sp::{SAML_SUCCESS, after, format_instant};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use openssl::x509::X509;
use std::time::Duration;

pub(crate) const IDP_ENTITY: &str = "https://idp.example.it";
pub(crate) const SP_ENTITY: &str = "https://sp.example.it";
pub(crate) const ACS_URL: &str = "https://sp.example.it/saml/acs";
pub(crate) const SLO_URL: &str = "https://sp.example.it/saml/slo";

pub(crate) const ALL_SERVICES: &str = concat!(
    r#"<md:SingleLogoutService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect" Location="https://idp.example.it/slo" ResponseLocation="https://idp.example.it/slo/response"/>"#,
    r#"<md:SingleSignOnService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST" Location="https://idp.example.it/sso/post"/>"#,
    r#"<md:SingleSignOnService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect" Location="https://idp.example.it/sso"/>"#,
);

pub(crate) fn sp_config() -> ServiceProviderConfig {
    let (key, cert) = generate_identity("sp");
    ServiceProviderConfig::new(SP_ENTITY, ACS_URL, SLO_URL, key, cert).unwrap()
}

pub(crate) fn idp_metadata_with(
    cert: &X509,
    want_signed: bool,
    services: &str,
) -> IdentityProviderMetadata {
    let xml = format!(
        r#"<md:EntityDescriptor xmlns:md="urn:oasis:names:tc:SAML:2.0:metadata" xmlns:ds="http://www.w3.org/2000/09/xmldsig#" entityID="{IDP_ENTITY}"><md:IDPSSODescriptor protocolSupportEnumeration="urn:oasis:names:tc:SAML:2.0:protocol" WantAuthnRequestsSigned="{want_signed}"><md:KeyDescriptor use="signing"><ds:KeyInfo><ds:X509Data><ds:X509Certificate>{}</ds:X509Certificate></ds:X509Data></ds:KeyInfo></md:KeyDescriptor>{services}</md:IDPSSODescriptor></md:EntityDescriptor>"#,
        STANDARD.encode(cert.to_der().unwrap())
    );
    IdentityProviderMetadata::load(xml.as_bytes()).unwrap()
}

/// IdP metadata with every endpoint, plus a signer holding the IdP key.
pub(crate) fn idp() -> (XmlSigner, IdentityProviderMetadata) {
    let (key, cert) = generate_identity("idp");
    let metadata = idp_metadata_with(&cert, true, ALL_SERVICES);
    (XmlSigner::new(key, cert, SignatureAlgorithm::RsaSha256), metadata)
}

pub(crate) struct ResponseParams {
    pub in_response_to: String,
    pub issue_instant: DateTime<Utc>,
    pub not_on_or_after: DateTime<Utc>,
    pub destination: String,
    pub audience: String,
    pub class_ref: String,
    pub subject: String,
    pub status: String,
}

impl ResponseParams {
    pub(crate) fn new(in_response_to: &str, now: DateTime<Utc>) -> Self {
        Self {
            in_response_to: in_response_to.to_owned(),
            issue_instant: now,
            not_on_or_after: after(now, Duration::from_secs(300)),
            destination: ACS_URL.to_owned(),
            audience: SP_ENTITY.to_owned(),
            class_ref: "https://www.spid.gov.it/SpidL2".to_owned(),
            subject: "AB12CD34".to_owned(),
            status: SAML_SUCCESS.to_owned(),
        }
    }
}

pub(crate) fn response_xml(p: &ResponseParams) -> String {
    let instant = format_instant(p.issue_instant);
    let expiry = format_instant(p.not_on_or_after);
    format!(
        concat!(
            r#"<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="_resp1" Version="2.0" IssueInstant="{instant}" Destination="{destination}" InResponseTo="{irt}">"#,
            r#"<saml:Issuer Format="urn:oasis:names:tc:SAML:2.0:nameid-format:entity">{idp}</saml:Issuer>"#,
            r#"<samlp:Status><samlp:StatusCode Value="{status}"/></samlp:Status>"#,
            r#"<saml:Assertion ID="_assert1" Version="2.0" IssueInstant="{instant}">"#,
            r#"<saml:Issuer Format="urn:oasis:names:tc:SAML:2.0:nameid-format:entity">{idp}</saml:Issuer>"#,
            r#"<saml:Subject><saml:NameID Format="urn:oasis:names:tc:SAML:2.0:nameid-format:transient" NameQualifier="{idp}">{subject}</saml:NameID>"#,
            r#"<saml:SubjectConfirmation Method="urn:oasis:names:tc:SAML:2.0:cm:bearer"><saml:SubjectConfirmationData Recipient="{acs}" InResponseTo="{irt}" NotOnOrAfter="{expiry}"/></saml:SubjectConfirmation></saml:Subject>"#,
            r#"<saml:Conditions NotBefore="{instant}" NotOnOrAfter="{expiry}"><saml:AudienceRestriction><saml:Audience>{audience}</saml:Audience></saml:AudienceRestriction></saml:Conditions>"#,
            r#"<saml:AuthnStatement AuthnInstant="{instant}" SessionIndex="_session1"><saml:AuthnContext><saml:AuthnContextClassRef>{class_ref}</saml:AuthnContextClassRef></saml:AuthnContext></saml:AuthnStatement>"#,
            r#"<saml:AttributeStatement><saml:Attribute Name="fiscalNumber"><saml:AttributeValue>TINIT-{subject}</saml:AttributeValue></saml:Attribute></saml:AttributeStatement>"#,
            "</saml:Assertion></samlp:Response>",
        ),
        instant = instant,
        expiry = expiry,
        destination = p.destination,
        irt = p.in_response_to,
        idp = IDP_ENTITY,
        status = p.status,
        subject = p.subject,
        acs = ACS_URL,
        audience = p.audience,
        class_ref = p.class_ref,
    )
}

/// Signs the assertion, then the response around it.
pub(crate) fn signed_response(signer: &XmlSigner, p: &ResponseParams) -> String {
    let document = signer.sign_enveloped(&response_xml(p), "_assert1").unwrap();
    signer.sign_enveloped(&document, "_resp1").unwrap()
}

/// A validated-looking assertion for driving the session and logout paths
/// without a signed response.
pub(crate) fn assertion(subject: &str, level: AuthnLevel, now: DateTime<Utc>) -> Assertion {
    Assertion {
        id: "_assert1".into(),
        issuer: IDP_ENTITY.into(),
        subject: subject.into(),
        name_id: NameId {
            value: subject.into(),
            format: Some(crate::sp::NAMEID_TRANSIENT.into()),
            name_qualifier: Some(IDP_ENTITY.into()),
            sp_name_qualifier: None,
        },
        session_index: Some("_session1".into()),
        authn_level: level,
        issue_instant: now,
        not_before: Some(now),
        not_on_or_after: Some(after(now, Duration::from_secs(300))),
        session_not_on_or_after: None,
        confirmation_not_on_or_after: Some(after(now, Duration::from_secs(300))),
        audiences: vec![SP_ENTITY.into()],
        attributes: AttributeMap::new(),
        in_response_to: "_r1".into(),
    }
}
