use crate::xml::{Element, SAML_ASSERTION_NS};
use std::collections::BTreeMap;

// Attribute names from the SPID technical rules (Tabella attributi).
pub const SPID_CODE: &str = "spidCode";
pub const NAME: &str = "name";
pub const FAMILY_NAME: &str = "familyName";
pub const FISCAL_NUMBER: &str = "fiscalNumber";
pub const EMAIL: &str = "email";
pub const MOBILE_PHONE: &str = "mobilePhone";
pub const DATE_OF_BIRTH: &str = "dateOfBirth";
pub const PLACE_OF_BIRTH: &str = "placeOfBirth";
pub const GENDER: &str = "gender";
pub const DIGITAL_ADDRESS: &str = "digitalAddress";
pub const SUBJECT_ID: &str = "urn:oasis:names:tc:SAML:attribute:subject-id";

const FISCAL_NUMBER_PREFIX: &str = "TINIT-";

/// Attribute name -> values, in name order. Values keep document order.
pub type AttributeMap = BTreeMap<String, Vec<String>>;

/// Collects every attribute from an assertion's attribute statements.
/// Attributes without any value are skipped.
pub fn extract_attributes(assertion: &Element) -> AttributeMap {
    let mut attrs = AttributeMap::new();
    for stmt in assertion.children_named(SAML_ASSERTION_NS, "AttributeStatement") {
        for attr in stmt.children_named(SAML_ASSERTION_NS, "Attribute") {
            let Some(name) = attr.attr("Name") else {
                continue;
            };
            let values: Vec<String> = attr
                .children_named(SAML_ASSERTION_NS, "AttributeValue")
                .map(|v| v.text())
                .collect();
            if values.is_empty() {
                continue;
            }
            attrs.entry(name.to_owned()).or_default().extend(values);
        }
    }
    attrs
}

/// First value of `name`, if present.
pub fn first<'a>(attrs: &'a AttributeMap, name: &str) -> Option<&'a str> {
    attrs
        .get(name)
        .and_then(|values| values.first())
        .map(String::as_str)
}

/// The fiscal number without the `TINIT-` prefix SPID IdPs put on it.
pub fn fiscal_number(attrs: &AttributeMap) -> Option<&str> {
    first(attrs, FISCAL_NUMBER).map(|v| v.strip_prefix(FISCAL_NUMBER_PREFIX).unwrap_or(v))
}
