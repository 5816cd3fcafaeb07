use crate::authn_context::{AuthnLevel, Comparison, RequestedAuthnContext};
use crate::bindings::Binding;
use crate::error::ConfigurationError;
use crate::signature::{SignatureAlgorithm, XmlSigner};
use anyhow::{Context, Result};
use openssl::pkey::{Id, PKey, Private};
use openssl::x509::X509;
use std::time::Duration;

const DEFAULT_MAX_SESSION_LIFETIME: Duration = Duration::from_secs(8 * 60 * 60);
const DEFAULT_CLOCK_SKEW: Duration = Duration::from_secs(60);
const DEFAULT_REQUEST_VALIDITY: Duration = Duration::from_secs(10 * 60);

/// Service-provider settings. Built once at startup and never mutated while
/// requests are being served.
#[cfg_attr(test, derive(Debug))]
pub struct ServiceProviderConfig {
    pub entity_id: String,
    pub acs_url: String,
    pub slo_url: String,
    key: PKey<Private>,
    certificate: X509,
    pub sign_requests: bool,
    pub requested_authn_context: RequestedAuthnContext,
    pub force_authn: bool,
    pub max_session_lifetime: Duration,
    pub clock_skew: Duration,
    /// How long an issued request may wait for its response. Also bounds how
    /// long consumed request IDs are remembered.
    pub request_validity: Duration,
    pub want_assertions_signed: bool,
    pub signature_algorithm: SignatureAlgorithm,
    pub preferred_binding: Binding,
    pub attribute_consuming_service_index: Option<u16>,
    pub landing_url: String,
    /// Run the signed LogoutRequest/LogoutResponse exchange for L2/L3
    /// sessions instead of only tearing down locally.
    pub remote_slo: bool,
}

impl ServiceProviderConfig {
    /// Takes the SP key pair and fills every other setting with the SPID
    /// defaults: signed requests, `minimum` SpidL2, ForceAuthn.
    pub fn new(
        entity_id: impl Into<String>,
        acs_url: impl Into<String>,
        slo_url: impl Into<String>,
        key: PKey<Private>,
        certificate: X509,
    ) -> Result<Self, ConfigurationError> {
        if key.id() != Id::RSA {
            return Err(ConfigurationError::InvalidKey("key must be RSA".into()));
        }
        let public_key = certificate
            .public_key()
            .map_err(|e| ConfigurationError::InvalidCertificate(e.to_string()))?;
        if !public_key.public_eq(&key) {
            return Err(ConfigurationError::KeyMismatch);
        }

        Ok(Self {
            entity_id: entity_id.into(),
            acs_url: acs_url.into(),
            slo_url: slo_url.into(),
            key,
            certificate,
            sign_requests: true,
            requested_authn_context: RequestedAuthnContext::default(),
            force_authn: true,
            max_session_lifetime: DEFAULT_MAX_SESSION_LIFETIME,
            clock_skew: DEFAULT_CLOCK_SKEW,
            request_validity: DEFAULT_REQUEST_VALIDITY,
            want_assertions_signed: true,
            signature_algorithm: SignatureAlgorithm::RsaSha256,
            preferred_binding: Binding::HttpRedirect,
            attribute_consuming_service_index: None,
            landing_url: "/".into(),
            remote_slo: false,
        })
    }

    pub fn from_pem(
        entity_id: impl Into<String>,
        acs_url: impl Into<String>,
        slo_url: impl Into<String>,
        key_pem: &[u8],
        cert_pem: &[u8],
    ) -> Result<Self, ConfigurationError> {
        let certificate = X509::from_pem(cert_pem)
            .map_err(|e| ConfigurationError::InvalidCertificate(e.to_string()))?;
        let key = PKey::private_key_from_pem(key_pem)
            .map_err(|e| ConfigurationError::InvalidKey(e.to_string()))?;
        Self::new(entity_id, acs_url, slo_url, key, certificate)
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from `SP_*` variables looked up through
    /// `lookup`. Certificate and key are read from the paths it names.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let entity_id = lookup("SP_ENTITY_ID").context("SP_ENTITY_ID must be set")?;
        let base_url = lookup("SP_BASE_URL").context("SP_BASE_URL must be set")?;
        let cert_path = lookup("SP_CERT_PATH").context("SP_CERT_PATH must be set")?;
        let key_path = lookup("SP_KEY_PATH").context("SP_KEY_PATH must be set")?;

        let cert_pem = std::fs::read(&cert_path)
            .with_context(|| format!("failed to read SP certificate {cert_path}"))?;
        let key_pem = std::fs::read(&key_path)
            .with_context(|| format!("failed to read SP private key {key_path}"))?;

        let base_url = base_url.trim_end_matches('/');
        let mut config = Self::from_pem(
            entity_id,
            format!("{base_url}/saml/acs"),
            format!("{base_url}/saml/slo"),
            &key_pem,
            &cert_pem,
        )
        .context("invalid SP key material")?;
        config.apply_overrides(&lookup)?;
        Ok(config)
    }

    /// Applies the optional settings, keeping defaults for unset variables.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("SP_SIGN_REQUESTS") {
            self.sign_requests = parse_flag("SP_SIGN_REQUESTS", &v)?;
        }
        if let Some(v) = lookup("SP_AUTHN_CONTEXT") {
            self.requested_authn_context.level = v
                .parse::<AuthnLevel>()
                .map_err(|reason| invalid("SP_AUTHN_CONTEXT", reason))?;
        }
        if let Some(v) = lookup("SP_AUTHN_COMPARISON") {
            self.requested_authn_context.comparison = v
                .parse::<Comparison>()
                .map_err(|reason| invalid("SP_AUTHN_COMPARISON", reason))?;
        }
        if let Some(v) = lookup("SP_FORCE_AUTHN") {
            self.force_authn = parse_flag("SP_FORCE_AUTHN", &v)?;
        }
        if let Some(v) = lookup("SP_MAX_SESSION_SECS") {
            self.max_session_lifetime = parse_secs("SP_MAX_SESSION_SECS", &v)?;
        }
        if let Some(v) = lookup("SP_CLOCK_SKEW_SECS") {
            self.clock_skew = parse_secs("SP_CLOCK_SKEW_SECS", &v)?;
        }
        if let Some(v) = lookup("SP_REQUEST_VALIDITY_SECS") {
            self.request_validity = parse_secs("SP_REQUEST_VALIDITY_SECS", &v)?;
        }
        if let Some(v) = lookup("SP_LANDING_URL") {
            self.landing_url = v;
        }
        if let Some(v) = lookup("SP_REMOTE_SLO") {
            self.remote_slo = parse_flag("SP_REMOTE_SLO", &v)?;
        }
        Ok(())
    }

    pub fn certificate(&self) -> &X509 {
        &self.certificate
    }

    pub(crate) fn signer(&self) -> XmlSigner {
        XmlSigner::new(
            self.key.clone(),
            self.certificate.clone(),
            self.signature_algorithm,
        )
    }
}

fn invalid(name: &'static str, reason: String) -> ConfigurationError {
    ConfigurationError::InvalidSetting { name, reason }
}

fn parse_flag(name: &'static str, value: &str) -> Result<bool, ConfigurationError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(invalid(name, format!("expected a boolean, got {other:?}"))),
    }
}

fn parse_secs(name: &'static str, value: &str) -> Result<Duration, ConfigurationError> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|e| invalid(name, e.to_string()))
}
