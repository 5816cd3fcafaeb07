use crate::xml::{self, Element, SAML_ASSERTION_NS, XMLDSIG_NS};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::sign::{Signer, Verifier};
use openssl::x509::X509;
use quick_xml::escape::escape;

const EXC_C14N: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";
const ENVELOPED_SIGNATURE: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";

#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    #[error("no signature present")]
    Missing,
    #[error("malformed signature: {0}")]
    Malformed(String),
    #[error("unsupported algorithm {0}")]
    UnsupportedAlgorithm(String),
    #[error("reference does not cover the signed element")]
    ReferenceMismatch,
    #[error("digest mismatch")]
    DigestMismatch,
    #[error("no trusted certificate verifies the signature")]
    Untrusted,
    #[error(transparent)]
    Xml(#[from] xml::XmlError),
    #[error(transparent)]
    OpenSsl(#[from] openssl::error::ErrorStack),
}

/// RSA signature methods accepted on both sides. SHA-1 is not supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignatureAlgorithm {
    #[default]
    RsaSha256,
    RsaSha384,
    RsaSha512,
}

impl SignatureAlgorithm {
    pub fn uri(&self) -> &'static str {
        match self {
            SignatureAlgorithm::RsaSha256 => "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256",
            SignatureAlgorithm::RsaSha384 => "http://www.w3.org/2001/04/xmldsig-more#rsa-sha384",
            SignatureAlgorithm::RsaSha512 => "http://www.w3.org/2001/04/xmldsig-more#rsa-sha512",
        }
    }

    pub fn digest_uri(&self) -> &'static str {
        match self {
            SignatureAlgorithm::RsaSha256 => "http://www.w3.org/2001/04/xmlenc#sha256",
            SignatureAlgorithm::RsaSha384 => "http://www.w3.org/2001/04/xmldsig-more#sha384",
            SignatureAlgorithm::RsaSha512 => "http://www.w3.org/2001/04/xmlenc#sha512",
        }
    }

    pub fn from_uri(uri: &str) -> Option<Self> {
        [Self::RsaSha256, Self::RsaSha384, Self::RsaSha512]
            .into_iter()
            .find(|alg| alg.uri() == uri)
    }

    fn message_digest(&self) -> MessageDigest {
        match self {
            SignatureAlgorithm::RsaSha256 => MessageDigest::sha256(),
            SignatureAlgorithm::RsaSha384 => MessageDigest::sha384(),
            SignatureAlgorithm::RsaSha512 => MessageDigest::sha512(),
        }
    }
}

fn digest_from_uri(uri: &str) -> Option<MessageDigest> {
    [
        SignatureAlgorithm::RsaSha256,
        SignatureAlgorithm::RsaSha384,
        SignatureAlgorithm::RsaSha512,
    ]
    .into_iter()
    .find(|alg| alg.digest_uri() == uri)
    .map(|alg| alg.message_digest())
}

/// Produces enveloped XML signatures and detached binding signatures with a
/// single RSA key.
pub struct XmlSigner {
    key: PKey<Private>,
    certificate: X509,
    algorithm: SignatureAlgorithm,
}

impl XmlSigner {
    pub fn new(key: PKey<Private>, certificate: X509, algorithm: SignatureAlgorithm) -> Self {
        Self {
            key,
            certificate,
            algorithm,
        }
    }

    pub fn algorithm(&self) -> SignatureAlgorithm {
        self.algorithm
    }

    /// Raw RSA signature over `data`, as used by the redirect binding.
    pub fn sign_bytes(&self, data: &[u8]) -> Result<Vec<u8>, SignatureError> {
        let mut signer = Signer::new(self.algorithm.message_digest(), &self.key)?;
        Ok(signer.sign_oneshot_to_vec(data)?)
    }

    /// Signs the element whose `ID` is `id` and returns the document with a
    /// `ds:Signature` inserted right after that element's `saml:Issuer`, or
    /// as its first child when it has none.
    pub fn sign_enveloped(&self, document: &str, id: &str) -> Result<String, SignatureError> {
        let root = xml::parse(document)?;
        root.ensure_unique_ids()?;
        let target = root
            .find_by_id(id)
            .ok_or_else(|| SignatureError::Malformed(format!("no element with ID {id}")))?;
        if target.span().end == target.content_start() {
            return Err(SignatureError::Malformed(format!(
                "element {id} is empty and cannot hold a signature"
            )));
        }

        let canonical = xml::canonicalize(target, None, &[]);
        let digest = openssl::hash::hash(self.algorithm.message_digest(), canonical.as_bytes())?;

        let signed_info = format!(
            concat!(
                r#"<ds:SignedInfo xmlns:ds="{ns}">"#,
                r#"<ds:CanonicalizationMethod Algorithm="{c14n}"/>"#,
                r#"<ds:SignatureMethod Algorithm="{sig}"/>"#,
                r##"<ds:Reference URI="#{id}">"##,
                r#"<ds:Transforms>"#,
                r#"<ds:Transform Algorithm="{enveloped}"/>"#,
                r#"<ds:Transform Algorithm="{c14n}"/>"#,
                r#"</ds:Transforms>"#,
                r#"<ds:DigestMethod Algorithm="{digest_method}"/>"#,
                r#"<ds:DigestValue>{digest}</ds:DigestValue>"#,
                r#"</ds:Reference>"#,
                r#"</ds:SignedInfo>"#,
            ),
            ns = XMLDSIG_NS,
            c14n = EXC_C14N,
            sig = self.algorithm.uri(),
            id = escape(id),
            enveloped = ENVELOPED_SIGNATURE,
            digest_method = self.algorithm.digest_uri(),
            digest = STANDARD.encode(&digest[..]),
        );
        let signed_info_canonical = xml::canonicalize(&xml::parse(&signed_info)?, None, &[]);
        let signature_value = STANDARD.encode(self.sign_bytes(signed_info_canonical.as_bytes())?);
        let certificate = STANDARD.encode(self.certificate.to_der()?);

        let signature = format!(
            concat!(
                r#"<ds:Signature xmlns:ds="{ns}">{signed_info}"#,
                r#"<ds:SignatureValue>{value}</ds:SignatureValue>"#,
                r#"<ds:KeyInfo><ds:X509Data><ds:X509Certificate>{cert}</ds:X509Certificate></ds:X509Data></ds:KeyInfo>"#,
                r#"</ds:Signature>"#,
            ),
            ns = XMLDSIG_NS,
            signed_info = signed_info,
            value = signature_value,
            cert = certificate,
        );

        let insert_at = target
            .child(SAML_ASSERTION_NS, "Issuer")
            .map(|issuer| issuer.span().end)
            .unwrap_or_else(|| target.content_start());

        let mut out = String::with_capacity(document.len() + signature.len());
        out.push_str(&document[..insert_at]);
        out.push_str(&signature);
        out.push_str(&document[insert_at..]);
        Ok(out)
    }
}

/// The single `ds:Signature` placed directly inside `element`, if any.
pub fn enveloped_signature(element: &Element) -> Result<Option<&Element>, SignatureError> {
    let mut signatures = element.children_named(XMLDSIG_NS, "Signature");
    let first = signatures.next();
    if signatures.next().is_some() {
        return Err(SignatureError::Malformed(
            "more than one signature on one element".into(),
        ));
    }
    Ok(first)
}

/// Verifies the enveloped signature carried directly by `target` against each
/// trusted certificate in turn, succeeding on the first that matches. The
/// certificate in the signature's own `KeyInfo` is never consulted.
///
/// The signature must reference `target` itself, either by its `ID` or, for
/// a document root, with an empty URI.
pub fn verify_enveloped(
    root: &Element,
    target: &Element,
    trusted: &[X509],
) -> Result<(), SignatureError> {
    root.ensure_unique_ids()?;
    let signature = enveloped_signature(target)?.ok_or(SignatureError::Missing)?;
    let signed_info = signature
        .child(XMLDSIG_NS, "SignedInfo")
        .ok_or_else(|| SignatureError::Malformed("missing SignedInfo".into()))?;

    let c14n = signed_info
        .child(XMLDSIG_NS, "CanonicalizationMethod")
        .ok_or_else(|| SignatureError::Malformed("missing CanonicalizationMethod".into()))?;
    if c14n.attr("Algorithm") != Some(EXC_C14N) {
        return Err(SignatureError::UnsupportedAlgorithm(
            c14n.attr("Algorithm").unwrap_or_default().to_owned(),
        ));
    }
    let signed_info_prefixes = inclusive_prefixes(c14n);

    let method = signed_info
        .child(XMLDSIG_NS, "SignatureMethod")
        .and_then(|m| m.attr("Algorithm"))
        .ok_or_else(|| SignatureError::Malformed("missing SignatureMethod".into()))?;
    let algorithm = SignatureAlgorithm::from_uri(method)
        .ok_or_else(|| SignatureError::UnsupportedAlgorithm(method.to_owned()))?;

    let mut references = signed_info.children_named(XMLDSIG_NS, "Reference");
    let reference = references
        .next()
        .ok_or_else(|| SignatureError::Malformed("missing Reference".into()))?;
    if references.next().is_some() {
        return Err(SignatureError::Malformed("more than one Reference".into()));
    }

    let uri = reference.attr("URI").unwrap_or_default();
    let covers_target = match uri.strip_prefix('#') {
        Some(id) => target.attr("ID") == Some(id),
        None => uri.is_empty() && std::ptr::eq(root, target),
    };
    if !covers_target {
        return Err(SignatureError::ReferenceMismatch);
    }

    let mut enveloped = false;
    let mut prefixes = Vec::new();
    if let Some(transforms) = reference.child(XMLDSIG_NS, "Transforms") {
        for transform in transforms.children_named(XMLDSIG_NS, "Transform") {
            match transform.attr("Algorithm") {
                Some(ENVELOPED_SIGNATURE) => enveloped = true,
                Some(EXC_C14N) => prefixes = inclusive_prefixes(transform),
                other => {
                    return Err(SignatureError::UnsupportedAlgorithm(
                        other.unwrap_or_default().to_owned(),
                    ));
                }
            }
        }
    }
    if !enveloped {
        return Err(SignatureError::Malformed(
            "enveloped-signature transform missing".into(),
        ));
    }

    let digest_uri = reference
        .child(XMLDSIG_NS, "DigestMethod")
        .and_then(|d| d.attr("Algorithm"))
        .ok_or_else(|| SignatureError::Malformed("missing DigestMethod".into()))?;
    let digest_alg = digest_from_uri(digest_uri)
        .ok_or_else(|| SignatureError::UnsupportedAlgorithm(digest_uri.to_owned()))?;
    let expected_digest = decode_base64(
        &reference
            .child(XMLDSIG_NS, "DigestValue")
            .ok_or_else(|| SignatureError::Malformed("missing DigestValue".into()))?
            .text(),
    )?;

    let canonical = xml::canonicalize(target, Some(signature), &prefixes);
    let actual_digest = openssl::hash::hash(digest_alg, canonical.as_bytes())?;
    if actual_digest.len() != expected_digest.len()
        || !openssl::memcmp::eq(&actual_digest[..], &expected_digest)
    {
        return Err(SignatureError::DigestMismatch);
    }

    let signature_value = decode_base64(
        &signature
            .child(XMLDSIG_NS, "SignatureValue")
            .ok_or_else(|| SignatureError::Malformed("missing SignatureValue".into()))?
            .text(),
    )?;
    let signed_info_canonical = xml::canonicalize(signed_info, None, &signed_info_prefixes);

    verify_with_any(
        algorithm,
        signed_info_canonical.as_bytes(),
        &signature_value,
        trusted,
    )
}

/// Checks a raw signature against every trusted certificate, returning on
/// the first one that verifies.
pub fn verify_with_any(
    algorithm: SignatureAlgorithm,
    data: &[u8],
    signature: &[u8],
    trusted: &[X509],
) -> Result<(), SignatureError> {
    for (index, certificate) in trusted.iter().enumerate() {
        let public_key = certificate.public_key()?;
        let mut verifier = Verifier::new(algorithm.message_digest(), &public_key)?;
        match verifier.verify_oneshot(signature, data) {
            Ok(true) => return Ok(()),
            Ok(false) => tracing::debug!(certificate = index, "certificate did not verify signature"),
            Err(e) => tracing::debug!(certificate = index, error = %e, "signature check failed"),
        }
    }
    Err(SignatureError::Untrusted)
}

fn inclusive_prefixes(element: &Element) -> Vec<String> {
    element
        .child(EXC_C14N, "InclusiveNamespaces")
        .and_then(|ns| ns.attr("PrefixList"))
        .map(|list| list.split_whitespace().map(str::to_owned).collect())
        .unwrap_or_default()
}

fn decode_base64(text: &str) -> Result<Vec<u8>, SignatureError> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD
        .decode(compact)
        .map_err(|e| SignatureError::Malformed(format!("invalid base64: {e}")))
}
