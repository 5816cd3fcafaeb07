use crate::bindings::{HTTP_POST_BINDING, HTTP_REDIRECT_BINDING};
use crate::config::ServiceProviderConfig;
use crate::sp::NAMEID_TRANSIENT;
use crate::xml::SAML_PROTOCOL_NS;
use anyhow::Context;
use samael::key_info::{KeyInfo, X509Data};
use samael::metadata::{Endpoint, EntityDescriptor, IndexedEndpoint, KeyDescriptor, SpSsoDescriptor};
use samael::traits::ToXml;

/// Generates the SP metadata document (EntityDescriptor with
/// SPSSODescriptor) to register with the identity provider federation.
pub fn build_metadata(config: &ServiceProviderConfig) -> anyhow::Result<String> {
    let cert_der = config
        .certificate()
        .to_der()
        .context("failed to encode SP certificate")?;
    let cert_b64 = samael::crypto::mime_encode_x509_cert(&cert_der);

    let key_descriptor = KeyDescriptor {
        key_use: Some("signing".to_string()),
        key_info: KeyInfo {
            id: None,
            x509_data: Some(X509Data {
                certificates: vec![cert_b64],
            }),
        },
        encryption_methods: None,
    };

    let single_logout_services = [HTTP_REDIRECT_BINDING, HTTP_POST_BINDING]
        .into_iter()
        .map(|binding| Endpoint {
            binding: binding.to_string(),
            location: config.slo_url.clone(),
            response_location: None,
        })
        .collect();

    let sp_descriptor = SpSsoDescriptor {
        authn_requests_signed: Some(config.sign_requests),
        want_assertions_signed: Some(config.want_assertions_signed),
        protocol_support_enumeration: Some(SAML_PROTOCOL_NS.to_string()),
        key_descriptors: Some(vec![key_descriptor]),
        name_id_formats: Some(vec![NAMEID_TRANSIENT.to_string()]),
        assertion_consumer_services: vec![IndexedEndpoint {
            binding: HTTP_POST_BINDING.to_string(),
            location: config.acs_url.clone(),
            response_location: None,
            index: 0,
            is_default: Some(true),
        }],
        single_logout_services: Some(single_logout_services),
        ..Default::default()
    };

    let entity_descriptor = EntityDescriptor {
        entity_id: Some(config.entity_id.clone()),
        sp_sso_descriptors: Some(vec![sp_descriptor]),
        ..Default::default()
    };

    let xml = entity_descriptor
        .to_string()
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    Ok(xml)
}
