//! A small namespace-aware element tree over quick-xml, plus exclusive XML
//! canonicalization (`http://www.w3.org/2001/10/xml-exc-c14n#`) of any
//! subtree. Signatures are computed and checked against this tree, and every
//! value the engine trusts is read back from the same nodes that were
//! verified.

use quick_xml::Reader;
use quick_xml::escape::{EscapeError, unescape};
use quick_xml::events::{BytesStart, Event};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::collections::HashSet;
use std::ops::Range;

pub const SAML_ASSERTION_NS: &str = "urn:oasis:names:tc:SAML:2.0:assertion";
pub const SAML_PROTOCOL_NS: &str = "urn:oasis:names:tc:SAML:2.0:protocol";
pub const SAML_METADATA_NS: &str = "urn:oasis:names:tc:SAML:2.0:metadata";
pub const XMLDSIG_NS: &str = "http://www.w3.org/2000/09/xmldsig#";
pub const XML_NS: &str = "http://www.w3.org/XML/1998/namespace";

const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct XmlError(String);

impl XmlError {
    fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

#[derive(Debug, Clone)]
pub struct Attribute {
    prefix: Option<String>,
    name: String,
    namespace: Option<String>,
    value: String,
}

#[derive(Debug, Clone)]
pub enum Node {
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone)]
pub struct Element {
    prefix: Option<String>,
    name: String,
    namespace: Option<String>,
    attributes: Vec<Attribute>,
    children: Vec<Node>,
    // Every binding in scope at this element, "" being the default namespace.
    namespaces: BTreeMap<String, String>,
    span: Range<usize>,
    content_start: usize,
}

/// Parses a complete document into its root element.
///
/// Document type declarations are refused outright, which also rules out
/// custom entities. Comments and processing instructions are dropped.
pub fn parse(xml: &str) -> Result<Element, XmlError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(false);

    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        let start = reader.buffer_position() as usize;
        let event = reader
            .read_event()
            .map_err(|e| XmlError::new(format!("parse error at byte {start}: {e}")))?;
        let end = reader.buffer_position() as usize;

        match event {
            Event::Start(e) => {
                if stack.len() >= MAX_DEPTH {
                    return Err(XmlError::new("document nesting too deep"));
                }
                let element = open_element(&e, stack.last(), start, end)?;
                stack.push(element);
            }
            Event::Empty(e) => {
                let element = open_element(&e, stack.last(), start, end)?;
                attach(element, &mut stack, &mut root)?;
            }
            Event::End(_) => {
                let mut element = stack
                    .pop()
                    .ok_or_else(|| XmlError::new("unbalanced end tag"))?;
                element.span.end = end;
                attach(element, &mut stack, &mut root)?;
            }
            Event::Text(t) => {
                let raw = std::str::from_utf8(&t)
                    .map_err(|e| XmlError::new(format!("invalid text content: {e}")))?;
                let raw = normalize_line_ends(raw);
                let text = unescape(&raw)
                    .map_err(|e| XmlError::new(format!("invalid text content: {e}")))?;
                match stack.last_mut() {
                    Some(parent) => parent.push_text(&text),
                    None if text.trim().is_empty() => {}
                    None => return Err(XmlError::new("text outside the root element")),
                }
            }
            Event::CData(c) => {
                let text = String::from_utf8(c.into_inner().into_owned())
                    .map_err(|e| XmlError::new(format!("invalid CDATA: {e}")))?;
                match stack.last_mut() {
                    Some(parent) => parent.push_text(&text),
                    None => return Err(XmlError::new("CDATA outside the root element")),
                }
            }
            Event::DocType(_) => return Err(XmlError::new("DOCTYPE is not allowed")),
            Event::Decl(_) | Event::Comment(_) | Event::PI(_) => {}
            Event::Eof => break,
        }
    }

    if !stack.is_empty() {
        return Err(XmlError::new("unexpected end of document"));
    }
    root.ok_or_else(|| XmlError::new("document has no root element"))
}

fn attach(
    element: Element,
    stack: &mut [Element],
    root: &mut Option<Element>,
) -> Result<(), XmlError> {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(Node::Element(element));
        return Ok(());
    }
    if root.is_some() {
        return Err(XmlError::new("more than one root element"));
    }
    *root = Some(element);
    Ok(())
}

fn open_element(
    start: &BytesStart<'_>,
    parent: Option<&Element>,
    at: usize,
    content_start: usize,
) -> Result<Element, XmlError> {
    let qname = std::str::from_utf8(start.name().as_ref())
        .map_err(|e| XmlError::new(format!("invalid element name: {e}")))?
        .to_owned();

    let mut namespaces = parent.map(|p| p.namespaces.clone()).unwrap_or_default();
    let mut raw = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| XmlError::new(format!("invalid attribute in <{qname}>: {e}")))?;
        let key = std::str::from_utf8(attr.key.as_ref())
            .map_err(|e| XmlError::new(format!("invalid attribute name: {e}")))?
            .to_owned();
        let value = std::str::from_utf8(&attr.value)
            .map_err(|e| e.to_string())
            .and_then(|raw| attribute_value(raw).map_err(|e| e.to_string()))
            .map_err(|e| XmlError::new(format!("invalid value for {key}: {e}")))?;

        if key == "xmlns" {
            if value.is_empty() {
                namespaces.remove("");
            } else {
                namespaces.insert(String::new(), value);
            }
        } else if let Some(prefix) = key.strip_prefix("xmlns:") {
            if value.is_empty() {
                return Err(XmlError::new(format!("empty binding for prefix {prefix}")));
            }
            namespaces.insert(prefix.to_owned(), value);
        } else {
            raw.push((key, value));
        }
    }

    let (prefix, name) = split_qname(&qname);
    let namespace = match prefix {
        Some(p) => Some(resolve(&namespaces, p)?),
        None => namespaces.get("").cloned(),
    };

    let mut attributes = Vec::with_capacity(raw.len());
    for (key, value) in raw {
        let (prefix, name) = split_qname(&key);
        let namespace = match prefix {
            Some(p) => Some(resolve(&namespaces, p)?),
            None => None,
        };
        attributes.push(Attribute {
            prefix: prefix.map(str::to_owned),
            name: name.to_owned(),
            namespace,
            value,
        });
    }

    Ok(Element {
        prefix: prefix.map(str::to_owned),
        name: name.to_owned(),
        namespace,
        attributes,
        children: Vec::new(),
        namespaces,
        span: at..content_start,
        content_start,
    })
}

/// End-of-line handling: `\r\n` and a lone `\r` are read as `\n`. Offsets
/// into the source are unaffected, only decoded content changes.
fn normalize_line_ends(raw: &str) -> Cow<'_, str> {
    if raw.contains('\r') {
        Cow::Owned(raw.replace("\r\n", "\n").replace('\r', "\n"))
    } else {
        Cow::Borrowed(raw)
    }
}

/// CDATA attribute-value normalization: literal tab, CR and LF become a
/// space before references are expanded, so `&#xA;` and friends survive.
fn attribute_value(raw: &str) -> Result<String, EscapeError> {
    let spaced: String = normalize_line_ends(raw)
        .chars()
        .map(|c| if matches!(c, '\t' | '\n') { ' ' } else { c })
        .collect();
    Ok(unescape(&spaced)?.into_owned())
}

fn split_qname(qname: &str) -> (Option<&str>, &str) {
    match qname.split_once(':') {
        Some((prefix, local)) => (Some(prefix), local),
        None => (None, qname),
    }
}

fn resolve(namespaces: &BTreeMap<String, String>, prefix: &str) -> Result<String, XmlError> {
    if prefix == "xml" {
        return Ok(XML_NS.to_owned());
    }
    namespaces
        .get(prefix)
        .cloned()
        .ok_or_else(|| XmlError::new(format!("unbound namespace prefix {prefix}")))
}

impl Element {
    fn push_text(&mut self, text: &str) {
        if let Some(Node::Text(last)) = self.children.last_mut() {
            last.push_str(text);
        } else {
            self.children.push(Node::Text(text.to_owned()));
        }
    }

    pub fn local_name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn is(&self, namespace: &str, name: &str) -> bool {
        self.name == name && self.namespace.as_deref() == Some(namespace)
    }

    /// Value of an unqualified attribute.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.namespace.is_none() && a.name == name)
            .map(|a| a.value.as_str())
    }

    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|n| match n {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    pub fn children_named<'a, 'b>(
        &'a self,
        namespace: &'b str,
        name: &'b str,
    ) -> impl Iterator<Item = &'a Element> {
        self.elements().filter(move |e| e.is(namespace, name))
    }

    pub fn child(&self, namespace: &str, name: &str) -> Option<&Element> {
        self.children_named(namespace, name).next()
    }

    /// Concatenated direct text content, trimmed.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for node in &self.children {
            if let Node::Text(t) = node {
                out.push_str(t);
            }
        }
        out.trim().to_owned()
    }

    /// This element and everything below it, in document order.
    pub fn descendants(&self) -> Vec<&Element> {
        fn collect<'a>(element: &'a Element, out: &mut Vec<&'a Element>) {
            out.push(element);
            for child in element.elements() {
                collect(child, out);
            }
        }
        let mut out = Vec::new();
        collect(self, &mut out);
        out
    }

    pub fn find_by_id(&self, id: &str) -> Option<&Element> {
        self.descendants()
            .into_iter()
            .find(|e| e.attr("ID") == Some(id))
    }

    /// Rejects documents in which two elements carry the same `ID`, the
    /// precondition for resolving a signature reference unambiguously.
    pub fn ensure_unique_ids(&self) -> Result<(), XmlError> {
        let mut seen = HashSet::new();
        for element in self.descendants() {
            if let Some(id) = element.attr("ID")
                && !seen.insert(id)
            {
                return Err(XmlError::new(format!("duplicate ID {id}")));
            }
        }
        Ok(())
    }

    /// Byte range of the whole element in the parsed source.
    pub fn span(&self) -> Range<usize> {
        self.span.clone()
    }

    /// Byte offset just past the start tag.
    pub fn content_start(&self) -> usize {
        self.content_start
    }

    fn qname(&self) -> String {
        match &self.prefix {
            Some(p) => format!("{p}:{}", self.name),
            None => self.name.clone(),
        }
    }
}

impl Attribute {
    fn qname(&self) -> String {
        match &self.prefix {
            Some(p) => format!("{p}:{}", self.name),
            None => self.name.clone(),
        }
    }
}

/// Exclusive canonical form of `element`, leaving out `exclude` (the
/// enveloped signature) wherever it occurs below. `inclusive_prefixes` is the
/// InclusiveNamespaces PrefixList, `#default` naming the default namespace.
pub fn canonicalize(
    element: &Element,
    exclude: Option<&Element>,
    inclusive_prefixes: &[String],
) -> String {
    let mut out = String::new();
    write_canonical(element, &BTreeMap::new(), exclude, inclusive_prefixes, &mut out);
    out
}

fn write_canonical<'a>(
    element: &'a Element,
    rendered: &BTreeMap<&'a str, &'a str>,
    exclude: Option<&Element>,
    inclusive_prefixes: &[String],
    out: &mut String,
) {
    let mut utilized: BTreeMap<&'a str, &'a str> = BTreeMap::new();
    utilized.insert(
        element.prefix.as_deref().unwrap_or(""),
        element.namespace.as_deref().unwrap_or(""),
    );
    for attr in &element.attributes {
        if let (Some(prefix), Some(ns)) = (attr.prefix.as_deref(), attr.namespace.as_deref())
            && prefix != "xml"
        {
            utilized.insert(prefix, ns);
        }
    }
    for prefix in inclusive_prefixes {
        let key = if prefix == "#default" { "" } else { prefix.as_str() };
        if let Some((k, uri)) = element.namespaces.get_key_value(key) {
            utilized.insert(k.as_str(), uri.as_str());
        }
    }

    let mut scope = rendered.clone();
    let mut declarations = Vec::new();
    for (prefix, uri) in utilized {
        let current = rendered.get(prefix).copied();
        let satisfied = match current {
            Some(value) => value == uri,
            None => prefix.is_empty() && uri.is_empty(),
        };
        if !satisfied {
            declarations.push((prefix, uri));
            scope.insert(prefix, uri);
        }
    }

    let qname = element.qname();
    out.push('<');
    out.push_str(&qname);
    for (prefix, uri) in declarations {
        if prefix.is_empty() {
            out.push_str(" xmlns=\"");
        } else {
            out.push_str(" xmlns:");
            out.push_str(prefix);
            out.push_str("=\"");
        }
        escape_attr_into(uri, out);
        out.push('"');
    }

    let mut attributes: Vec<&Attribute> = element.attributes.iter().collect();
    attributes.sort_by(|a, b| {
        let ka = (a.namespace.as_deref().unwrap_or(""), a.name.as_str());
        let kb = (b.namespace.as_deref().unwrap_or(""), b.name.as_str());
        ka.cmp(&kb)
    });
    for attr in attributes {
        out.push(' ');
        out.push_str(&attr.qname());
        out.push_str("=\"");
        escape_attr_into(&attr.value, out);
        out.push('"');
    }
    out.push('>');

    for child in &element.children {
        match child {
            Node::Text(text) => escape_text_into(text, out),
            Node::Element(e) => {
                if exclude.is_some_and(|x| std::ptr::eq(x, e)) {
                    continue;
                }
                write_canonical(e, &scope, exclude, inclusive_prefixes, out);
            }
        }
    }

    out.push_str("</");
    out.push_str(&qname);
    out.push('>');
}

fn escape_text_into(text: &str, out: &mut String) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\r' => out.push_str("&#xD;"),
            _ => out.push(c),
        }
    }
}

fn escape_attr_into(value: &str, out: &mut String) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '"' => out.push_str("&quot;"),
            '\t' => out.push_str("&#x9;"),
            '\n' => out.push_str("&#xA;"),
            '\r' => out.push_str("&#xD;"),
            _ => out.push(c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_prefixed_and_default_namespaces() {
        let root = parse(
            r#"<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" ID="_r"><Issuer xmlns="urn:oasis:names:tc:SAML:2.0:assertion">idp</Issuer></samlp:Response>"#,
        )
        .unwrap();

        assert!(root.is(SAML_PROTOCOL_NS, "Response"));
        assert_eq!(root.attr("ID"), Some("_r"));
        let issuer = root.child(SAML_ASSERTION_NS, "Issuer").unwrap();
        assert_eq!(issuer.text(), "idp");
    }

    #[test]
    fn rejects_doctype() {
        let err = parse(r#"<!DOCTYPE foo [<!ENTITY x "y">]><foo>&x;</foo>"#).unwrap_err();
        assert!(err.to_string().contains("DOCTYPE"));
    }

    #[test]
    fn rejects_unbound_prefix() {
        assert!(parse("<a:b/>").is_err());
    }

    #[test]
    fn rejects_trailing_garbage_root() {
        assert!(parse("<a/><b/>").is_err());
    }

    #[test]
    fn rejects_duplicate_ids() {
        let root = parse(r#"<a ID="x"><b ID="x"/></a>"#).unwrap();
        assert!(root.ensure_unique_ids().is_err());
    }

    #[test]
    fn canonical_form_sorts_attributes_and_expands_empty_elements() {
        let root = parse(r#"<a xmlns="urn:x" z="1" b="2&amp;"><c/></a>"#).unwrap();
        assert_eq!(
            canonicalize(&root, None, &[]),
            r#"<a xmlns="urn:x" b="2&amp;" z="1"><c></c></a>"#
        );
    }

    #[test]
    fn canonical_subtree_only_declares_utilized_namespaces() {
        let root = parse(
            r#"<p:a xmlns:p="urn:p" xmlns:q="urn:q" xmlns:unused="urn:u"><q:b p:attr="v">text</q:b></p:a>"#,
        )
        .unwrap();
        let child = root.elements().next().unwrap();
        assert_eq!(
            canonicalize(child, None, &[]),
            r#"<q:b xmlns:p="urn:p" xmlns:q="urn:q" p:attr="v">text</q:b>"#
        );
    }

    #[test]
    fn canonical_form_honors_inclusive_prefixes() {
        let root = parse(
            r#"<a xmlns:xs="http://www.w3.org/2001/XMLSchema"><b>xs:string</b></a>"#,
        )
        .unwrap();
        let child = root.elements().next().unwrap();
        assert_eq!(canonicalize(child, None, &[]), "<b>xs:string</b>");
        assert_eq!(
            canonicalize(child, None, &["xs".to_owned()]),
            r#"<b xmlns:xs="http://www.w3.org/2001/XMLSchema">xs:string</b>"#
        );
    }

    #[test]
    fn canonical_form_omits_excluded_element() {
        let root = parse(r#"<a><sig/><b>1</b></a>"#).unwrap();
        let sig = root.elements().next().unwrap();
        assert_eq!(canonicalize(&root, Some(sig), &[]), "<a><b>1</b></a>");
    }

    #[test]
    fn canonical_form_undeclares_default_namespace() {
        let root = parse(r#"<a xmlns="urn:x"><b xmlns=""/></a>"#).unwrap();
        assert_eq!(
            canonicalize(&root, None, &[]),
            r#"<a xmlns="urn:x"><b xmlns=""></b></a>"#
        );
    }

    #[test]
    fn spans_cover_source_text() {
        let xml = r#"<a><b x="1">t</b><c/></a>"#;
        let root = parse(xml).unwrap();
        let b = root.elements().next().unwrap();
        assert_eq!(&xml[b.span()], r#"<b x="1">t</b>"#);
        assert_eq!(&xml[b.content_start()..], r#"t</b><c/></a>"#);
    }

    #[test]
    fn descendants_are_in_document_order() {
        let root = parse("<a><b><c/></b><d/></a>").unwrap();
        let names: Vec<&str> = root.descendants().iter().map(|e| e.local_name()).collect();
        assert_eq!(names, ["a", "b", "c", "d"]);
    }

    #[test]
    fn line_ends_read_as_line_feeds() {
        let root = parse("<a>one\r\ntwo\rthree&#xD;</a>").unwrap();
        let Node::Text(text) = &root.children[0] else {
            panic!("expected text");
        };
        assert_eq!(text, "one\ntwo\nthree\r");
        assert_eq!(canonicalize(&root, None, &[]), "<a>one\ntwo\nthree&#xD;</a>");
    }

    #[test]
    fn attribute_whitespace_reads_as_spaces() {
        let root = parse("<a v=\"x\r\ny\tz\nw&#xA;\"/>").unwrap();
        assert_eq!(root.attr("v"), Some("x y z w\n"));
        assert_eq!(canonicalize(&root, None, &[]), r#"<a v="x y z w&#xA;"></a>"#);
    }
}
