use crate::attributes::{self, AttributeMap};
use crate::authn_context::AuthnLevel;
use crate::bindings::InboundMessage;
use crate::config::ServiceProviderConfig;
use crate::error::ValidationError;
use crate::idp::metadata::IdentityProviderMetadata;
use crate::signature::{self, SignatureError};
use crate::sp::tracker::{RequestKind, RequestTracker};
use crate::sp::{BEARER, SAML_SUCCESS, after, before, parse_instant};
use crate::xml::{self, Element, SAML_ASSERTION_NS, SAML_PROTOCOL_NS};
use chrono::{DateTime, Utc};
use openssl::x509::X509;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameId {
    pub value: String,
    pub format: Option<String>,
    pub name_qualifier: Option<String>,
    pub sp_name_qualifier: Option<String>,
}

/// A validated assertion. Every field was read from a node covered by a
/// verified signature.
#[derive(Debug, Clone)]
pub struct Assertion {
    pub id: String,
    pub issuer: String,
    /// The NameID value.
    pub subject: String,
    pub name_id: NameId,
    pub session_index: Option<String>,
    pub authn_level: AuthnLevel,
    pub issue_instant: DateTime<Utc>,
    pub not_before: Option<DateTime<Utc>>,
    pub not_on_or_after: Option<DateTime<Utc>>,
    pub session_not_on_or_after: Option<DateTime<Utc>>,
    /// `NotOnOrAfter` of the bearer `SubjectConfirmationData`.
    pub confirmation_not_on_or_after: Option<DateTime<Utc>>,
    pub audiences: Vec<String>,
    pub attributes: AttributeMap,
    /// ID of the AuthnRequest this assertion answers.
    pub in_response_to: String,
}

pub(crate) fn malformed(reason: impl Into<String>) -> ValidationError {
    ValidationError::MalformedResponse(reason.into())
}

pub(crate) fn signature_invalid(e: SignatureError) -> ValidationError {
    ValidationError::SignatureInvalid(e.to_string())
}

/// Verifies the enveloped signature of `target`, if it has one. Returns
/// whether one was present.
pub(crate) fn verify_if_signed(
    root: &Element,
    target: &Element,
    trusted: &[X509],
) -> Result<bool, ValidationError> {
    match signature::enveloped_signature(target).map_err(signature_invalid)? {
        Some(_) => {
            signature::verify_enveloped(root, target, trusted).map_err(signature_invalid)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

pub(crate) fn issuer_of(element: &Element) -> Option<String> {
    element
        .child(SAML_ASSERTION_NS, "Issuer")
        .map(|issuer| issuer.text())
}

pub(crate) fn required_instant(
    element: &Element,
    name: &str,
) -> Result<DateTime<Utc>, ValidationError> {
    let value = element
        .attr(name)
        .ok_or_else(|| malformed(format!("{} has no {name}", element.local_name())))?;
    parse_instant(value).ok_or_else(|| malformed(format!("invalid {name} {value:?}")))
}

fn optional_instant(
    element: &Element,
    name: &str,
) -> Result<Option<DateTime<Utc>>, ValidationError> {
    element.attr(name).map_or(Ok(None), |value| {
        parse_instant(value)
            .map(Some)
            .ok_or_else(|| malformed(format!("invalid {name} {value:?}")))
    })
}

pub(crate) fn name_id_from(element: &Element) -> Result<NameId, ValidationError> {
    let value = element.text();
    if value.is_empty() {
        return Err(malformed("empty NameID"));
    }
    Ok(NameId {
        value,
        format: element.attr("Format").map(str::to_owned),
        name_qualifier: element.attr("NameQualifier").map(str::to_owned),
        sp_name_qualifier: element.attr("SPNameQualifier").map(str::to_owned),
    })
}

/// Validates `Response` messages delivered to the ACS.
pub struct ResponseValidator<'a> {
    config: &'a ServiceProviderConfig,
    idp: &'a IdentityProviderMetadata,
    tracker: &'a RequestTracker,
}

impl<'a> ResponseValidator<'a> {
    pub fn new(
        config: &'a ServiceProviderConfig,
        idp: &'a IdentityProviderMetadata,
        tracker: &'a RequestTracker,
    ) -> Self {
        Self {
            config,
            idp,
            tracker,
        }
    }

    pub fn validate(
        &self,
        message: &InboundMessage,
        expected_in_response_to: Option<&str>,
    ) -> Result<Assertion, ValidationError> {
        self.validate_at(message, expected_in_response_to, Utc::now())
    }

    /// Runs every check against `now`. On success the answered request is
    /// consumed, so the same response is never accepted twice.
    pub fn validate_at(
        &self,
        message: &InboundMessage,
        expected_in_response_to: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Assertion, ValidationError> {
        let root = match xml::parse(message.xml()) {
            Ok(root) => root,
            Err(e) => {
                let error = malformed(e.to_string());
                tracing::warn!(kind = error.kind(), error = %error, "rejected SAML response");
                return Err(error);
            }
        };

        let result = self.check(&root, message, expected_in_response_to, now);
        match &result {
            Ok(assertion) => tracing::debug!(
                assertion_id = %assertion.id,
                in_response_to = %assertion.in_response_to,
                level = %assertion.authn_level,
                "accepted SAML response"
            ),
            Err(error) => tracing::warn!(
                kind = error.kind(),
                response_id = root.attr("ID"),
                in_response_to = root.attr("InResponseTo"),
                issuer = issuer_of(&root).as_deref(),
                binding = ?message.binding(),
                error = %error,
                "rejected SAML response"
            ),
        }
        result
    }

    fn check(
        &self,
        root: &Element,
        message: &InboundMessage,
        expected_in_response_to: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Assertion, ValidationError> {
        if !root.is(SAML_PROTOCOL_NS, "Response") {
            return Err(malformed(format!(
                "expected samlp:Response, got {}",
                root.local_name()
            )));
        }
        if root.attr("Version") != Some("2.0") {
            return Err(malformed("unsupported SAML version"));
        }
        root.ensure_unique_ids()
            .map_err(|e| malformed(e.to_string()))?;

        let trusted = self.idp.signing_certificates();
        let detached_signed = message.verify_detached(trusted)?;
        let response_signed = verify_if_signed(root, root, trusted)?;

        let status = root
            .child(SAML_PROTOCOL_NS, "Status")
            .ok_or_else(|| malformed("response has no Status"))?;
        let code = status
            .child(SAML_PROTOCOL_NS, "StatusCode")
            .and_then(|c| c.attr("Value"))
            .ok_or_else(|| malformed("response has no StatusCode"))?;
        if code != SAML_SUCCESS {
            return Err(ValidationError::StatusNotSuccess {
                status: code.to_owned(),
                message: status
                    .child(SAML_PROTOCOL_NS, "StatusMessage")
                    .map(|m| m.text()),
            });
        }

        let assertion = self.sole_assertion(root)?;
        let assertion_signed = verify_if_signed(root, assertion, trusted)?;
        if self.config.want_assertions_signed && !assertion_signed {
            return Err(ValidationError::SignatureInvalid(
                "assertion is not signed".into(),
            ));
        }
        if !(assertion_signed || response_signed || detached_signed) {
            return Err(ValidationError::SignatureInvalid(
                "response carries no signature".into(),
            ));
        }

        let destination = root.attr("Destination");
        if destination != Some(self.config.acs_url.as_str()) {
            return Err(ValidationError::DestinationMismatch {
                expected: self.config.acs_url.clone(),
                actual: destination.map(str::to_owned),
            });
        }

        self.check_issuer(issuer_of(root))?;
        let issuer = issuer_of(assertion);
        self.check_issuer(issuer.clone())?;
        let issuer = issuer.unwrap_or_default();

        let in_response_to = root
            .attr("InResponseTo")
            .ok_or_else(|| ValidationError::UnsolicitedResponse("no InResponseTo".into()))?;
        if let Some(expected) = expected_in_response_to
            && expected != in_response_to
        {
            return Err(ValidationError::UnsolicitedResponse(format!(
                "answers {in_response_to}, expected {expected}"
            )));
        }
        let pending = self.tracker.peek(in_response_to, RequestKind::Authn, now)?;

        let skew = self.config.clock_skew;
        let issued = required_instant(root, "IssueInstant")?;
        if issued > after(now, skew) {
            return Err(ValidationError::NotYetValid(format!(
                "response issued in the future at {issued}"
            )));
        }
        if now >= after(issued, self.config.request_validity.saturating_add(skew)) {
            return Err(ValidationError::ExpiredAssertion(format!(
                "response issued at {issued} is too old"
            )));
        }

        let conditions = assertion
            .child(SAML_ASSERTION_NS, "Conditions")
            .ok_or_else(|| malformed("assertion has no Conditions"))?;
        let not_before = optional_instant(conditions, "NotBefore")?;
        let not_on_or_after = optional_instant(conditions, "NotOnOrAfter")?;
        if let Some(not_before) = not_before
            && now < before(not_before, skew)
        {
            return Err(ValidationError::NotYetValid(format!(
                "assertion valid from {not_before}"
            )));
        }
        if let Some(not_on_or_after) = not_on_or_after
            && now >= after(not_on_or_after, skew)
        {
            return Err(ValidationError::ExpiredAssertion(format!(
                "assertion expired at {not_on_or_after}"
            )));
        }

        let subject = assertion
            .child(SAML_ASSERTION_NS, "Subject")
            .ok_or_else(|| malformed("assertion has no Subject"))?;
        let name_id = subject
            .child(SAML_ASSERTION_NS, "NameID")
            .ok_or_else(|| malformed("subject has no NameID"))
            .and_then(name_id_from)?;
        let confirmation_expires = self.check_subject_confirmation(subject, in_response_to, now)?;

        let audiences = self.check_audience(conditions)?;

        let statement = assertion
            .child(SAML_ASSERTION_NS, "AuthnStatement")
            .ok_or_else(|| malformed("assertion has no AuthnStatement"))?;
        let class_ref = statement
            .child(SAML_ASSERTION_NS, "AuthnContext")
            .and_then(|c| c.child(SAML_ASSERTION_NS, "AuthnContextClassRef"))
            .map(|c| c.text())
            .ok_or_else(|| malformed("AuthnStatement has no AuthnContextClassRef"))?;
        let requested = pending
            .authn_context
            .unwrap_or(self.config.requested_authn_context);
        let authn_level = AuthnLevel::from_class_ref(&class_ref)
            .filter(|level| requested.is_satisfied_by(*level))
            .ok_or_else(|| ValidationError::InsufficientAuthnContext {
                requested: requested.to_string(),
                actual: class_ref.clone(),
            })?;

        let assertion_id = assertion
            .attr("ID")
            .ok_or_else(|| malformed("assertion has no ID"))?
            .to_owned();
        let issue_instant = required_instant(assertion, "IssueInstant")?;

        let validated = Assertion {
            id: assertion_id,
            issuer,
            subject: name_id.value.clone(),
            name_id,
            session_index: statement.attr("SessionIndex").map(str::to_owned),
            authn_level,
            issue_instant,
            not_before,
            not_on_or_after,
            session_not_on_or_after: optional_instant(statement, "SessionNotOnOrAfter")?,
            confirmation_not_on_or_after: Some(confirmation_expires),
            audiences,
            attributes: attributes::extract_attributes(assertion),
            in_response_to: in_response_to.to_owned(),
        };

        self.tracker
            .consume(in_response_to, RequestKind::Authn, now)?;
        Ok(validated)
    }

    /// The one assertion that is a direct child of the response. Any other
    /// assertion anywhere in the document is treated as a wrapping attempt.
    fn sole_assertion<'r>(&self, root: &'r Element) -> Result<&'r Element, ValidationError> {
        let descendants = root.descendants();
        if descendants
            .iter()
            .any(|e| e.is(SAML_ASSERTION_NS, "EncryptedAssertion"))
        {
            return Err(malformed("encrypted assertions are not supported"));
        }

        let mut direct = root.children_named(SAML_ASSERTION_NS, "Assertion");
        let assertion = direct
            .next()
            .ok_or_else(|| malformed("response has no Assertion"))?;
        if direct.next().is_some() {
            return Err(malformed("response has more than one Assertion"));
        }

        let total = descendants
            .iter()
            .filter(|e| e.is(SAML_ASSERTION_NS, "Assertion"))
            .count();
        if total != 1 {
            return Err(ValidationError::SignatureInvalid(
                "assertion found outside the response body".into(),
            ));
        }
        Ok(assertion)
    }

    fn check_issuer(&self, actual: Option<String>) -> Result<(), ValidationError> {
        if actual.as_deref() == Some(self.idp.entity_id()) {
            return Ok(());
        }
        Err(ValidationError::IssuerMismatch {
            expected: self.idp.entity_id().to_owned(),
            actual,
        })
    }

    fn check_subject_confirmation(
        &self,
        subject: &Element,
        in_response_to: &str,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, ValidationError> {
        let data = subject
            .children_named(SAML_ASSERTION_NS, "SubjectConfirmation")
            .find(|c| c.attr("Method") == Some(BEARER))
            .and_then(|c| c.child(SAML_ASSERTION_NS, "SubjectConfirmationData"))
            .ok_or_else(|| malformed("no bearer SubjectConfirmationData"))?;

        let recipient = data.attr("Recipient");
        if recipient != Some(self.config.acs_url.as_str()) {
            return Err(ValidationError::DestinationMismatch {
                expected: self.config.acs_url.clone(),
                actual: recipient.map(str::to_owned),
            });
        }
        if data.attr("InResponseTo") != Some(in_response_to) {
            return Err(ValidationError::UnsolicitedResponse(
                "subject confirmation answers a different request".into(),
            ));
        }
        let expires = required_instant(data, "NotOnOrAfter")?;
        if now >= after(expires, self.config.clock_skew) {
            return Err(ValidationError::ExpiredAssertion(format!(
                "subject confirmation expired at {expires}"
            )));
        }
        Ok(expires)
    }

    /// Every AudienceRestriction must name this SP.
    fn check_audience(&self, conditions: &Element) -> Result<Vec<String>, ValidationError> {
        let restrictions: Vec<Vec<String>> = conditions
            .children_named(SAML_ASSERTION_NS, "AudienceRestriction")
            .map(|r| {
                r.children_named(SAML_ASSERTION_NS, "Audience")
                    .map(|a| a.text())
                    .collect()
            })
            .collect();

        let entity_id = &self.config.entity_id;
        let satisfied = !restrictions.is_empty()
            && restrictions.iter().all(|r| r.iter().any(|a| a == entity_id));
        let audiences: Vec<String> = restrictions.into_iter().flatten().collect();
        if !satisfied {
            return Err(ValidationError::AudienceMismatch {
                expected: entity_id.clone(),
                actual: audiences,
            });
        }
        Ok(audiences)
    }
}
