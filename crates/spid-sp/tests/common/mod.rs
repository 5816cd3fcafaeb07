#![allow(dead_code)]

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::{X509, X509NameBuilder};
use spid_sp::signature::{SignatureAlgorithm, XmlSigner};
use spid_sp::{InboundMessage, IdentityProviderMetadata, ServiceProvider, ServiceProviderConfig};
use std::sync::OnceLock;

pub const IDP_ENTITY: &str = "https://idp.example.it";
pub const SP_ENTITY: &str = "https://sp.example.it";
pub const ACS_URL: &str = "https://sp.example.it/saml/acs";
pub const SLO_URL: &str = "https://sp.example.it/saml/slo";
pub const SUCCESS: &str = "urn:oasis:names:tc:SAML:2.0:status:Success";
pub const SPID_L1: &str = "https://www.spid.gov.it/SpidL1";
pub const SPID_L2: &str = "https://www.spid.gov.it/SpidL2";
pub const SPID_L3: &str = "https://www.spid.gov.it/SpidL3";

pub fn generate_identity(common_name: &str) -> (PKey<Private>, X509) {
    let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", common_name).unwrap();
    let name = name.build();

    let mut serial = BigNum::new().unwrap();
    serial.rand(64, MsbOption::MAYBE_ZERO, false).unwrap();

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    builder
        .set_serial_number(&serial.to_asn1_integer().unwrap())
        .unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(365).unwrap())
        .unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();
    (key, builder.build())
}

fn cached(cell: &'static OnceLock<(PKey<Private>, X509)>, common_name: &str) -> (PKey<Private>, X509) {
    cell.get_or_init(|| generate_identity(common_name)).clone()
}

pub fn sp_identity() -> (PKey<Private>, X509) {
    static SP: OnceLock<(PKey<Private>, X509)> = OnceLock::new();
    cached(&SP, "sp")
}

/// The current time truncated to the millisecond precision used on the wire.
pub fn now() -> DateTime<Utc> {
    DateTime::from_timestamp_millis(Utc::now().timestamp_millis()).unwrap()
}

pub fn instant(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn plus(t: DateTime<Utc>, millis: i64) -> DateTime<Utc> {
    t + TimeDelta::milliseconds(millis)
}

/// An identity provider that signs whatever the tests ask it to.
pub struct TestIdp {
    signer: XmlSigner,
    certificate: X509,
}

impl TestIdp {
    pub fn new() -> Self {
        static IDP: OnceLock<(PKey<Private>, X509)> = OnceLock::new();
        let (key, certificate) = cached(&IDP, "idp");
        Self::with_identity(key, certificate)
    }

    /// An IdP with a fresh key nobody trusts.
    pub fn rogue() -> Self {
        let (key, certificate) = generate_identity("rogue");
        Self::with_identity(key, certificate)
    }

    fn with_identity(key: PKey<Private>, certificate: X509) -> Self {
        Self {
            signer: XmlSigner::new(key, certificate.clone(), SignatureAlgorithm::RsaSha256),
            certificate,
        }
    }

    pub fn metadata_xml(&self) -> String {
        format!(
            concat!(
                r#"<md:EntityDescriptor xmlns:md="urn:oasis:names:tc:SAML:2.0:metadata" xmlns:ds="http://www.w3.org/2000/09/xmldsig#" entityID="{entity}">"#,
                r#"<md:IDPSSODescriptor protocolSupportEnumeration="urn:oasis:names:tc:SAML:2.0:protocol" WantAuthnRequestsSigned="true">"#,
                r#"<md:KeyDescriptor use="signing"><ds:KeyInfo><ds:X509Data><ds:X509Certificate>{cert}</ds:X509Certificate></ds:X509Data></ds:KeyInfo></md:KeyDescriptor>"#,
                r#"<md:SingleLogoutService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect" Location="https://idp.example.it/slo" ResponseLocation="https://idp.example.it/slo/response"/>"#,
                r#"<md:SingleSignOnService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect" Location="https://idp.example.it/sso"/>"#,
                r#"<md:SingleSignOnService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST" Location="https://idp.example.it/sso"/>"#,
                r#"</md:IDPSSODescriptor></md:EntityDescriptor>"#,
            ),
            entity = IDP_ENTITY,
            cert = STANDARD.encode(self.certificate.to_der().unwrap()),
        )
    }

    pub fn metadata(&self) -> IdentityProviderMetadata {
        IdentityProviderMetadata::load(self.metadata_xml().as_bytes()).unwrap()
    }

    pub fn sign(&self, document: &str, id: &str) -> String {
        self.signer.sign_enveloped(document, id).unwrap()
    }

    /// A response signed the way SPID identity providers sign: the
    /// assertion first, then the response around it.
    pub fn signed_response(&self, params: &ResponseParams) -> String {
        let document = self.sign(&params.to_xml(), &params.assertion_id);
        self.sign(&document, &params.response_id)
    }
}

pub fn sp_config() -> ServiceProviderConfig {
    let (key, cert) = sp_identity();
    ServiceProviderConfig::new(SP_ENTITY, ACS_URL, SLO_URL, key, cert).unwrap()
}

pub fn service_provider(idp: &TestIdp) -> ServiceProvider {
    service_provider_with(idp, |_| {})
}

pub fn service_provider_with(
    idp: &TestIdp,
    configure: impl FnOnce(&mut ServiceProviderConfig),
) -> ServiceProvider {
    let mut config = sp_config();
    configure(&mut config);
    ServiceProvider::new(config, idp.metadata()).unwrap()
}

pub fn post(document: &str) -> InboundMessage {
    InboundMessage::from_post(&STANDARD.encode(document), None).unwrap()
}

/// Decodes the SAML message carried by a redirect URL.
pub fn redirect_document(url: &str) -> String {
    let (_, query) = url.split_once('?').unwrap();
    InboundMessage::from_redirect_query(query)
        .unwrap()
        .xml()
        .to_owned()
}

pub struct ResponseParams {
    pub response_id: String,
    pub assertion_id: String,
    pub in_response_to: String,
    pub issue_instant: DateTime<Utc>,
    pub not_on_or_after: DateTime<Utc>,
    /// Bearer confirmation expiry; defaults to `not_on_or_after`.
    pub confirmation_not_on_or_after: Option<DateTime<Utc>>,
    pub subject: String,
    pub class_ref: String,
    pub session_index: String,
    pub attributes: Vec<(String, String)>,
}

impl ResponseParams {
    pub fn new(in_response_to: &str, now: DateTime<Utc>) -> Self {
        Self {
            response_id: "_response-1".into(),
            assertion_id: "_assertion-1".into(),
            in_response_to: in_response_to.into(),
            issue_instant: now,
            not_on_or_after: plus(now, 5 * 60 * 1000),
            confirmation_not_on_or_after: None,
            subject: "AB12CD34".into(),
            class_ref: SPID_L2.into(),
            session_index: "_session-1".into(),
            attributes: vec![("fiscalNumber".into(), "TINIT-AB12CD34".into())],
        }
    }

    pub fn to_xml(&self) -> String {
        let attributes: String = self
            .attributes
            .iter()
            .map(|(name, value)| {
                format!(
                    r#"<saml:Attribute Name="{name}"><saml:AttributeValue>{value}</saml:AttributeValue></saml:Attribute>"#
                )
            })
            .collect();
        let issued = instant(self.issue_instant);
        let expiry = instant(self.not_on_or_after);
        let confirmation_expiry =
            instant(self.confirmation_not_on_or_after.unwrap_or(self.not_on_or_after));

        format!(
            concat!(
                r#"<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="{rid}" Version="2.0" IssueInstant="{instant}" Destination="{acs}" InResponseTo="{irt}">"#,
                r#"<saml:Issuer Format="urn:oasis:names:tc:SAML:2.0:nameid-format:entity">{idp}</saml:Issuer>"#,
                r#"<samlp:Status><samlp:StatusCode Value="{success}"/></samlp:Status>"#,
                r#"<saml:Assertion ID="{aid}" Version="2.0" IssueInstant="{instant}">"#,
                r#"<saml:Issuer Format="urn:oasis:names:tc:SAML:2.0:nameid-format:entity">{idp}</saml:Issuer>"#,
                r#"<saml:Subject><saml:NameID Format="urn:oasis:names:tc:SAML:2.0:nameid-format:transient" NameQualifier="{idp}">{subject}</saml:NameID>"#,
                r#"<saml:SubjectConfirmation Method="urn:oasis:names:tc:SAML:2.0:cm:bearer"><saml:SubjectConfirmationData Recipient="{acs}" InResponseTo="{irt}" NotOnOrAfter="{confirmation_expiry}"/></saml:SubjectConfirmation></saml:Subject>"#,
                r#"<saml:Conditions NotBefore="{instant}" NotOnOrAfter="{expiry}"><saml:AudienceRestriction><saml:Audience>{sp}</saml:Audience></saml:AudienceRestriction></saml:Conditions>"#,
                r#"<saml:AuthnStatement AuthnInstant="{instant}" SessionIndex="{session_index}"><saml:AuthnContext><saml:AuthnContextClassRef>{class_ref}</saml:AuthnContextClassRef></saml:AuthnContext></saml:AuthnStatement>"#,
                r#"<saml:AttributeStatement>{attributes}</saml:AttributeStatement>"#,
                "</saml:Assertion></samlp:Response>",
            ),
            rid = self.response_id,
            aid = self.assertion_id,
            instant = issued,
            expiry = expiry,
            confirmation_expiry = confirmation_expiry,
            acs = ACS_URL,
            irt = self.in_response_to,
            idp = IDP_ENTITY,
            success = SUCCESS,
            subject = self.subject,
            sp = SP_ENTITY,
            session_index = self.session_index,
            class_ref = self.class_ref,
            attributes = attributes,
        )
    }
}

pub fn logout_response_xml(in_response_to: &str, status: &str, now: DateTime<Utc>) -> String {
    format!(
        concat!(
            r#"<samlp:LogoutResponse xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="_logout-response-1" Version="2.0" IssueInstant="{instant}" Destination="{slo}" InResponseTo="{irt}">"#,
            "<saml:Issuer>{idp}</saml:Issuer>",
            r#"<samlp:Status><samlp:StatusCode Value="{status}"/></samlp:Status>"#,
            "</samlp:LogoutResponse>",
        ),
        instant = instant(now),
        slo = SLO_URL,
        irt = in_response_to,
        idp = IDP_ENTITY,
        status = status,
    )
}

pub fn logout_request_xml(subject: &str, session_index: &str, now: DateTime<Utc>) -> String {
    format!(
        concat!(
            r#"<samlp:LogoutRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="_idp-logout-1" Version="2.0" IssueInstant="{instant}" Destination="{slo}" NotOnOrAfter="{expiry}">"#,
            "<saml:Issuer>{idp}</saml:Issuer>",
            r#"<saml:NameID Format="urn:oasis:names:tc:SAML:2.0:nameid-format:transient">{subject}</saml:NameID>"#,
            "<samlp:SessionIndex>{session_index}</samlp:SessionIndex>",
            "</samlp:LogoutRequest>",
        ),
        instant = instant(now),
        slo = SLO_URL,
        expiry = instant(plus(now, 60_000)),
        idp = IDP_ENTITY,
        subject = subject,
        session_index = session_index,
    )
}
