use crate::bindings::Binding;
use crate::error::MetadataError;
use crate::signature;
use crate::xml::{self, Element, SAML_METADATA_NS, SAML_PROTOCOL_NS, XMLDSIG_NS};
use openssl::x509::X509;
use samael::metadata::{self as md, EntityDescriptor, IdpSsoDescriptor};
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub binding: Binding,
    pub location: String,
    pub response_location: Option<String>,
}

/// Parsed metadata of one identity provider. Immutable once loaded.
#[derive(Debug, Clone)]
pub struct IdentityProviderMetadata {
    entity_id: String,
    signing_certificates: Vec<X509>,
    sso_endpoints: Vec<Endpoint>,
    slo_endpoints: Vec<Endpoint>,
    want_authn_requests_signed: bool,
}

impl IdentityProviderMetadata {
    /// Loads an `EntityDescriptor`, or the first identity provider of an
    /// `EntitiesDescriptor` aggregate.
    pub fn load(source: &[u8]) -> Result<Self, MetadataError> {
        let root = parse_document(source)?;
        let entity = idp_entities(&root)
            .into_iter()
            .next()
            .ok_or_else(|| MetadataError::EntityNotFound("(any)".into()))?;
        Self::from_entity(entity)
    }

    /// Loads the identity provider `entity_id` out of a single descriptor or
    /// an aggregate.
    pub fn load_entity(source: &[u8], entity_id: &str) -> Result<Self, MetadataError> {
        let root = parse_document(source)?;
        let entity = idp_entities(&root)
            .into_iter()
            .find(|e| e.attr("entityID") == Some(entity_id))
            .ok_or_else(|| MetadataError::EntityNotFound(entity_id.to_owned()))?;
        Self::from_entity(entity)
    }

    /// Like [`load`](Self::load), but first requires the document's root
    /// signature to verify against one of `trust_anchors`, as registries
    /// such as the SPID one publish signed metadata.
    pub fn load_verified(source: &[u8], trust_anchors: &[X509]) -> Result<Self, MetadataError> {
        let root = parse_document(source)?;
        signature::verify_enveloped(&root, &root, trust_anchors)
            .map_err(|e| MetadataError::SignatureInvalid(e.to_string()))?;
        let entity = idp_entities(&root)
            .into_iter()
            .next()
            .ok_or_else(|| MetadataError::EntityNotFound("(any)".into()))?;
        Self::from_entity(entity)
    }

    /// Reads the entity, minus its enveloped signature, as a samael
    /// `EntityDescriptor`.
    fn from_entity(entity: &Element) -> Result<Self, MetadataError> {
        let fragment = xml::canonicalize(entity, entity.child(XMLDSIG_NS, "Signature"), &[]);
        let descriptor = EntityDescriptor::from_str(&fragment)
            .map_err(|e| MetadataError::MalformedXml(e.to_string()))?;

        let entity_id = descriptor
            .entity_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| MetadataError::MalformedXml("EntityDescriptor without entityID".into()))?;

        let idp = descriptor
            .idp_sso_descriptors
            .unwrap_or_default()
            .into_iter()
            .find(supports_saml2)
            .ok_or_else(|| {
                MetadataError::MalformedXml(format!("{entity_id} has no SAML 2.0 IDPSSODescriptor"))
            })?;

        let mut signing_certificates = Vec::new();
        let signing_keys = idp
            .key_descriptors
            .iter()
            .filter(|key| matches!(key.key_use.as_deref(), None | Some("signing")));
        for key in signing_keys {
            let Some(data) = &key.key_info.x509_data else {
                continue;
            };
            for cert in &data.certificates {
                signing_certificates.push(decode_certificate(&entity_id, cert)?);
            }
        }
        if signing_certificates.is_empty() {
            return Err(MetadataError::MissingCertificate(entity_id));
        }

        let sso_endpoints = endpoints(&idp.single_sign_on_services);
        let slo_endpoints = endpoints(&idp.single_logout_services);
        if sso_endpoints.is_empty() && slo_endpoints.is_empty() {
            return Err(MetadataError::MissingEndpoint(entity_id));
        }

        let want_authn_requests_signed = idp.want_authn_requests_signed.unwrap_or(false);

        tracing::info!(
            idp = %entity_id,
            certificates = signing_certificates.len(),
            sso_endpoints = sso_endpoints.len(),
            slo_endpoints = slo_endpoints.len(),
            "loaded identity provider metadata"
        );

        Ok(Self {
            entity_id,
            signing_certificates,
            sso_endpoints,
            slo_endpoints,
            want_authn_requests_signed,
        })
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// Trusted signing certificates, in metadata order. Several are listed
    /// while a key rollover is in progress.
    pub fn signing_certificates(&self) -> &[X509] {
        &self.signing_certificates
    }

    pub fn sso_endpoint(&self, binding: Binding) -> Option<&Endpoint> {
        self.sso_endpoints.iter().find(|e| e.binding == binding)
    }

    pub fn slo_endpoint(&self, binding: Binding) -> Option<&Endpoint> {
        self.slo_endpoints.iter().find(|e| e.binding == binding)
    }

    pub fn sso_endpoints(&self) -> &[Endpoint] {
        &self.sso_endpoints
    }

    pub fn slo_endpoints(&self) -> &[Endpoint] {
        &self.slo_endpoints
    }

    pub fn want_authn_requests_signed(&self) -> bool {
        self.want_authn_requests_signed
    }
}

fn parse_document(source: &[u8]) -> Result<Element, MetadataError> {
    let text = std::str::from_utf8(source)
        .map_err(|e| MetadataError::MalformedXml(format!("invalid UTF-8: {e}")))?;
    xml::parse(text).map_err(|e| MetadataError::MalformedXml(e.to_string()))
}

/// Every EntityDescriptor with an IDPSSODescriptor, at any depth of nested
/// EntitiesDescriptor groups.
fn idp_entities(root: &Element) -> Vec<&Element> {
    root.descendants()
        .into_iter()
        .filter(|e| e.is(SAML_METADATA_NS, "EntityDescriptor"))
        .filter(|e| e.child(SAML_METADATA_NS, "IDPSSODescriptor").is_some())
        .collect()
}

fn supports_saml2(descriptor: &IdpSsoDescriptor) -> bool {
    descriptor
        .protocol_support_enumeration
        .as_deref()
        .is_some_and(|list| list.split_whitespace().any(|p| p == SAML_PROTOCOL_NS))
}

fn endpoints(services: &[md::Endpoint]) -> Vec<Endpoint> {
    services
        .iter()
        .filter(|e| !e.location.is_empty())
        .filter_map(|e| {
            Some(Endpoint {
                binding: Binding::from_uri(&e.binding)?,
                location: e.location.clone(),
                response_location: e.response_location.clone(),
            })
        })
        .collect()
}

fn decode_certificate(entity_id: &str, text: &str) -> Result<X509, MetadataError> {
    let invalid = |reason: String| MetadataError::InvalidCertificate {
        entity_id: entity_id.to_owned(),
        reason,
    };
    let der = samael::crypto::decode_x509_cert(text)
        .map_err(|e| invalid(format!("invalid base64: {e}")))?;
    X509::from_der(&der).map_err(|e| invalid(e.to_string()))
}

/// Holds the current IdP metadata. Readers get a cheap snapshot; a reload
/// swaps the whole structure at once and never mutates it in place.
pub struct MetadataStore {
    current: RwLock<Arc<IdentityProviderMetadata>>,
}

impl MetadataStore {
    pub fn new(metadata: IdentityProviderMetadata) -> Self {
        Self {
            current: RwLock::new(Arc::new(metadata)),
        }
    }

    pub fn current(&self) -> Arc<IdentityProviderMetadata> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn replace(&self, metadata: IdentityProviderMetadata) {
        let entity_id = metadata.entity_id.clone();
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(metadata);
        tracing::info!(idp = %entity_id, "replaced identity provider metadata");
    }
}
