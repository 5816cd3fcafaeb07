//! HTTP-Redirect and HTTP-POST bindings for outbound requests and inbound
//! responses.

use crate::error::{RequestError, ValidationError};
use crate::signature::{self, SignatureAlgorithm, XmlSigner};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use openssl::x509::X509;
use quick_xml::escape::escape;
use std::io::{Read, Write};

pub use samael::metadata::{HTTP_POST_BINDING, HTTP_REDIRECT_BINDING};

const MAX_MESSAGE_BYTES: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    HttpRedirect,
    HttpPost,
}

impl Binding {
    pub fn uri(&self) -> &'static str {
        match self {
            Binding::HttpRedirect => HTTP_REDIRECT_BINDING,
            Binding::HttpPost => HTTP_POST_BINDING,
        }
    }

    pub fn from_uri(uri: &str) -> Option<Self> {
        match uri {
            HTTP_REDIRECT_BINDING => Some(Binding::HttpRedirect),
            HTTP_POST_BINDING => Some(Binding::HttpPost),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
}

impl MessageKind {
    pub fn parameter(&self) -> &'static str {
        match self {
            MessageKind::Request => "SAMLRequest",
            MessageKind::Response => "SAMLResponse",
        }
    }
}

/// An outbound protocol message, ready to hand to the user agent either as a
/// `Location` header or as an auto-submitting form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodedMessage {
    Redirect {
        url: String,
    },
    Post {
        action: String,
        parameter: &'static str,
        value: String,
        relay_state: Option<String>,
    },
}

impl EncodedMessage {
    pub fn location(&self) -> Option<&str> {
        match self {
            EncodedMessage::Redirect { url } => Some(url),
            EncodedMessage::Post { .. } => None,
        }
    }

    /// Auto-submitting HTML form that POSTs the message to its destination.
    pub fn to_html_form(&self) -> Option<String> {
        let EncodedMessage::Post {
            action,
            parameter,
            value,
            relay_state,
        } = self
        else {
            return None;
        };

        let relay_state_input = relay_state
            .as_ref()
            .map(|rs| {
                format!(
                    r#"<input type="hidden" name="RelayState" value="{}" />"#,
                    escape(rs)
                )
            })
            .unwrap_or_default();

        Some(format!(
            r#"<!DOCTYPE html>
<html><body onload="document.forms[0].submit()">
<form method="POST" action="{action}">
<input type="hidden" name="{parameter}" value="{value}" />
{relay_state_input}
<noscript><input type="submit" value="Continue" /></noscript>
</form></body></html>"#,
            action = escape(action.as_str()),
        ))
    }
}

/// Deflates, base64-encodes and URL-encodes `document` onto `endpoint`. With
/// a signer, appends `SigAlg` and a detached `Signature` computed over
/// `SAMLRequest=..&RelayState=..&SigAlg=..` exactly as sent.
pub fn encode_redirect(
    endpoint: &str,
    kind: MessageKind,
    document: &str,
    relay_state: Option<&str>,
    signer: Option<&XmlSigner>,
) -> Result<EncodedMessage, RequestError> {
    let deflated = deflate(document.as_bytes())?;
    let mut query = format!(
        "{}={}",
        kind.parameter(),
        urlencoding::encode(&STANDARD.encode(deflated))
    );
    if let Some(rs) = relay_state {
        query.push_str("&RelayState=");
        query.push_str(&urlencoding::encode(rs));
    }
    if let Some(signer) = signer {
        query.push_str("&SigAlg=");
        query.push_str(&urlencoding::encode(signer.algorithm().uri()));
        let signature = signer
            .sign_bytes(query.as_bytes())
            .map_err(|e| RequestError::Signing(e.to_string()))?;
        query.push_str("&Signature=");
        query.push_str(&urlencoding::encode(&STANDARD.encode(signature)));
    }

    let separator = if endpoint.contains('?') { '&' } else { '?' };
    Ok(EncodedMessage::Redirect {
        url: format!("{endpoint}{separator}{query}"),
    })
}

pub fn encode_post(
    endpoint: &str,
    kind: MessageKind,
    document: &str,
    relay_state: Option<&str>,
) -> EncodedMessage {
    EncodedMessage::Post {
        action: endpoint.to_owned(),
        parameter: kind.parameter(),
        value: STANDARD.encode(document.as_bytes()),
        relay_state: relay_state.map(str::to_owned),
    }
}

fn deflate(data: &[u8]) -> Result<Vec<u8>, RequestError> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| RequestError::Encoding(format!("deflate failed: {e}")))?;
    encoder
        .finish()
        .map_err(|e| RequestError::Encoding(format!("deflate failed: {e}")))
}

/// Decodes HTTP-Redirect binding: base64 -> DEFLATE decompress -> XML string.
fn decode_redirect_binding(encoded: &str) -> Result<String, ValidationError> {
    let compressed = STANDARD
        .decode(encoded)
        .map_err(|e| ValidationError::MalformedResponse(format!("base64 decode failed: {e}")))?;

    let decoder = DeflateDecoder::new(&compressed[..]);
    let mut xml = String::new();
    decoder
        .take(MAX_MESSAGE_BYTES as u64 + 1)
        .read_to_string(&mut xml)
        .map_err(|e| ValidationError::MalformedResponse(format!("deflate decompress failed: {e}")))?;
    if xml.len() > MAX_MESSAGE_BYTES {
        return Err(ValidationError::MalformedResponse("message too large".into()));
    }

    Ok(xml)
}

/// Decodes HTTP-POST binding: base64 -> XML string (no compression).
fn decode_post_binding(encoded: &str) -> Result<String, ValidationError> {
    // Some IdPs wrap the base64 body at 76 columns.
    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.len() > MAX_MESSAGE_BYTES * 4 / 3 + 4 {
        return Err(ValidationError::MalformedResponse("message too large".into()));
    }
    let bytes = STANDARD
        .decode(compact)
        .map_err(|e| ValidationError::MalformedResponse(format!("base64 decode failed: {e}")))?;

    String::from_utf8(bytes)
        .map_err(|e| ValidationError::MalformedResponse(format!("invalid UTF-8: {e}")))
}

#[derive(Debug, Clone)]
struct DetachedSignature {
    signed_content: String,
    algorithm: String,
    value: String,
}

/// A SAML message received from the IdP, decoded from whichever binding
/// carried it.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    xml: String,
    relay_state: Option<String>,
    binding: Binding,
    detached: Option<DetachedSignature>,
}

impl InboundMessage {
    /// `value` is the `SAMLResponse` (or `SAMLRequest`) form field.
    pub fn from_post(value: &str, relay_state: Option<&str>) -> Result<Self, ValidationError> {
        Ok(Self {
            xml: decode_post_binding(value)?,
            relay_state: relay_state.map(str::to_owned),
            binding: Binding::HttpPost,
            detached: None,
        })
    }

    /// `query` is the raw query string, without the leading `?`, exactly as
    /// the user agent sent it.
    pub fn from_redirect_query(query: &str) -> Result<Self, ValidationError> {
        let mut message: Option<(&str, &str)> = None;
        let mut relay_state = None;
        let mut sig_alg = None;
        let mut signature = None;

        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            match key {
                "SAMLRequest" | "SAMLResponse" => {
                    if message.replace((key, value)).is_some() {
                        return Err(ValidationError::MalformedResponse(
                            "more than one SAML message in query".into(),
                        ));
                    }
                }
                "RelayState" => relay_state = Some(value),
                "SigAlg" => sig_alg = Some(value),
                "Signature" => signature = Some(value),
                _ => {}
            }
        }

        let (key, raw) = message.ok_or_else(|| {
            ValidationError::MalformedResponse("no SAMLRequest or SAMLResponse in query".into())
        })?;
        let encoded = url_decode(raw)?;
        let xml = decode_redirect_binding(&encoded)?;

        let detached = match (sig_alg, signature) {
            (Some(alg), Some(sig)) => {
                let mut signed_content = format!("{key}={raw}");
                if let Some(rs) = relay_state {
                    signed_content.push_str("&RelayState=");
                    signed_content.push_str(rs);
                }
                signed_content.push_str("&SigAlg=");
                signed_content.push_str(alg);
                Some(DetachedSignature {
                    signed_content,
                    algorithm: url_decode(alg)?,
                    value: url_decode(sig)?,
                })
            }
            (None, None) => None,
            _ => {
                return Err(ValidationError::SignatureInvalid(
                    "SigAlg and Signature must appear together".into(),
                ));
            }
        };

        Ok(Self {
            xml,
            relay_state: relay_state.map(url_decode).transpose()?,
            binding: Binding::HttpRedirect,
            detached,
        })
    }

    pub fn xml(&self) -> &str {
        &self.xml
    }

    pub fn relay_state(&self) -> Option<&str> {
        self.relay_state.as_deref()
    }

    pub fn binding(&self) -> Binding {
        self.binding
    }

    /// Verifies the redirect-binding signature, if the message carried one.
    /// Returns whether a detached signature was present.
    pub(crate) fn verify_detached(&self, trusted: &[X509]) -> Result<bool, ValidationError> {
        let Some(detached) = &self.detached else {
            return Ok(false);
        };
        let algorithm = SignatureAlgorithm::from_uri(&detached.algorithm).ok_or_else(|| {
            ValidationError::SignatureInvalid(format!(
                "unsupported SigAlg {}",
                detached.algorithm
            ))
        })?;
        let value = STANDARD
            .decode(detached.value.trim())
            .map_err(|e| ValidationError::SignatureInvalid(format!("invalid Signature: {e}")))?;
        signature::verify_with_any(
            algorithm,
            detached.signed_content.as_bytes(),
            &value,
            trusted,
        )
        .map_err(|e| ValidationError::SignatureInvalid(e.to_string()))?;
        Ok(true)
    }
}

/// `application/x-www-form-urlencoded` decoding: `+` is a space, `%2B` a plus.
fn url_decode(value: &str) -> Result<String, ValidationError> {
    urlencoding::decode(&value.replace('+', " "))
        .map(|v| v.into_owned())
        .map_err(|e| ValidationError::MalformedResponse(format!("invalid URL encoding: {e}")))
}
