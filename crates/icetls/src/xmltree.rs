use std::borrow::Cow;

use quick_xml::Reader;
use quick_xml::escape::{escape, unescape};
use quick_xml::events::Event;

use crate::error::{Error, Result};

// Raw payloads are stored exactly as they appear between their delimiters
// (entities left encoded, whitespace intact) so untouched regions serialize
// back byte-identically. Only tool-inserted text goes through `escape`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XmlNode {
    Element(Element),
    Text(String),
    Comment(String),
    CData(String),
    ProcInst(String),
    DocType(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    name: String,
    // Verbatim tag text after the name, leading whitespace included.
    attrs_raw: String,
    self_closing: bool,
    pub children: Vec<XmlNode>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attrs_raw: String::new(),
            self_closing: false,
            children: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn push(&mut self, node: XmlNode) {
        self.children.push(node);
    }

    // Concatenated text payload, entities decoded. None when the element has
    // no text children at all.
    pub fn text(&self) -> Option<String> {
        let mut raw = String::new();
        let mut found = false;
        for child in &self.children {
            if let XmlNode::Text(t) = child {
                raw.push_str(t);
                found = true;
            }
        }
        if !found {
            return None;
        }
        match unescape(raw.as_str()) {
            Ok(cow) => Some(cow.into_owned()),
            Err(_) => Some(raw),
        }
    }

    // Replace the text payload in place: the first text child takes the new
    // value, surplus text children are dropped, other node kinds stay put.
    pub fn set_text(&mut self, value: &str) {
        let escaped = escaped_text(value);
        let mut replaced = false;
        self.children.retain_mut(|child| match child {
            XmlNode::Text(raw) => {
                if replaced {
                    false
                } else {
                    *raw = escaped.clone();
                    replaced = true;
                    true
                }
            }
            _ => true,
        });
        if !replaced {
            self.children.push(XmlNode::Text(escaped));
        }
    }
}

fn escaped_text(value: &str) -> String {
    match escape(value) {
        Cow::Borrowed(s) => s.to_string(),
        Cow::Owned(s) => s,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlDocument {
    pub prolog: Vec<XmlNode>,
    pub root: Element,
    pub trailing: Vec<XmlNode>,
}

pub fn parse(input: &str) -> Result<XmlDocument> {
    let mut reader = Reader::from_str(input);

    let mut prolog: Vec<XmlNode> = Vec::new();
    let mut root: Option<Element> = None;
    let mut trailing: Vec<XmlNode> = Vec::new();
    let mut stack: Vec<Element> = Vec::new();

    fn push_node(
        node: XmlNode,
        stack: &mut [Element],
        root: &Option<Element>,
        prolog: &mut Vec<XmlNode>,
        trailing: &mut Vec<XmlNode>,
    ) {
        if let Some(top) = stack.last_mut() {
            top.children.push(node);
        } else if root.is_none() {
            prolog.push(node);
        } else {
            trailing.push(node);
        }
    }

    loop {
        let ev = reader
            .read_event()
            .map_err(|e| Error::Parse(format!("{e} at byte {}", reader.buffer_position())))?;
        match ev {
            Event::Eof => break,
            Event::Start(e) => {
                if stack.is_empty() && root.is_some() {
                    return Err(Error::Parse("multiple root elements".to_string()));
                }
                stack.push(element_from_tag(str_of(&e)?, e.name().as_ref().len(), false));
            }
            Event::Empty(e) => {
                let el = element_from_tag(str_of(&e)?, e.name().as_ref().len(), true);
                if stack.is_empty() && root.is_some() {
                    return Err(Error::Parse("multiple root elements".to_string()));
                }
                push_node(
                    XmlNode::Element(el),
                    &mut stack,
                    &root,
                    &mut prolog,
                    &mut trailing,
                );
            }
            Event::End(_) => {
                let el = stack
                    .pop()
                    .ok_or_else(|| Error::Parse("unexpected closing tag".to_string()))?;
                if stack.is_empty() {
                    root = Some(el);
                } else {
                    push_node(
                        XmlNode::Element(el),
                        &mut stack,
                        &root,
                        &mut prolog,
                        &mut trailing,
                    );
                }
            }
            Event::Text(e) => push_node(
                XmlNode::Text(str_of(&e)?.to_string()),
                &mut stack,
                &root,
                &mut prolog,
                &mut trailing,
            ),
            Event::GeneralRef(e) => push_node(
                XmlNode::Text(format!("&{};", str_of(&e)?)),
                &mut stack,
                &root,
                &mut prolog,
                &mut trailing,
            ),
            Event::CData(e) => push_node(
                XmlNode::CData(str_of(&e)?.to_string()),
                &mut stack,
                &root,
                &mut prolog,
                &mut trailing,
            ),
            Event::Comment(e) => push_node(
                XmlNode::Comment(str_of(&e)?.to_string()),
                &mut stack,
                &root,
                &mut prolog,
                &mut trailing,
            ),
            Event::Decl(e) => push_node(
                XmlNode::ProcInst(str_of(&e)?.to_string()),
                &mut stack,
                &root,
                &mut prolog,
                &mut trailing,
            ),
            Event::PI(e) => push_node(
                XmlNode::ProcInst(str_of(&e)?.to_string()),
                &mut stack,
                &root,
                &mut prolog,
                &mut trailing,
            ),
            Event::DocType(e) => push_node(
                XmlNode::DocType(str_of(&e)?.to_string()),
                &mut stack,
                &root,
                &mut prolog,
                &mut trailing,
            ),
        }
    }

    if !stack.is_empty() {
        return Err(Error::Parse("unclosed element at end of input".to_string()));
    }
    let root = root.ok_or_else(|| Error::Parse("document has no root element".to_string()))?;
    Ok(XmlDocument {
        prolog,
        root,
        trailing,
    })
}

fn element_from_tag(tag: &str, name_len: usize, self_closing: bool) -> Element {
    Element {
        name: tag[..name_len].to_string(),
        attrs_raw: tag[name_len..].to_string(),
        self_closing,
        children: Vec::new(),
    }
}

fn str_of(bytes: &[u8]) -> Result<&str> {
    std::str::from_utf8(bytes).map_err(|e| Error::Parse(format!("invalid UTF-8: {e}")))
}

pub fn serialize(doc: &XmlDocument) -> Vec<u8> {
    let mut out = String::new();
    for node in &doc.prolog {
        write_node(&mut out, node);
    }
    write_element(&mut out, &doc.root);
    for node in &doc.trailing {
        write_node(&mut out, node);
    }
    out.into_bytes()
}

fn write_node(out: &mut String, node: &XmlNode) {
    match node {
        XmlNode::Element(el) => write_element(out, el),
        XmlNode::Text(raw) => out.push_str(raw),
        XmlNode::Comment(raw) => {
            out.push_str("<!--");
            out.push_str(raw);
            out.push_str("-->");
        }
        XmlNode::CData(raw) => {
            out.push_str("<![CDATA[");
            out.push_str(raw);
            out.push_str("]]>");
        }
        XmlNode::ProcInst(raw) => {
            out.push_str("<?");
            out.push_str(raw);
            out.push_str("?>");
        }
        XmlNode::DocType(raw) => {
            out.push_str("<!DOCTYPE ");
            out.push_str(raw);
            out.push('>');
        }
    }
}

fn write_element(out: &mut String, el: &Element) {
    out.push('<');
    out.push_str(&el.name);
    out.push_str(&el.attrs_raw);
    if el.self_closing && el.children.is_empty() {
        out.push_str("/>");
        return;
    }
    out.push('>');
    for child in &el.children {
        write_node(out, child);
    }
    out.push_str("</");
    out.push_str(&el.name);
    out.push('>');
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0"?>
<!-- server config -->
<icecast>
    <hostname>stream.example.org</hostname>
    <limits clients="100" />
    <listen-socket>
        <port>8000</port>
    </listen-socket>
    <note>a &amp; b</note>
</icecast>
"#;

    #[test]
    fn round_trip_is_byte_identical() {
        let doc = parse(SAMPLE).expect("parse");
        assert_eq!(serialize(&doc), SAMPLE.as_bytes());
    }

    #[test]
    fn round_trip_preserves_attribute_spacing_and_empty_tags() {
        let input = "<a><b  x=\"1\"   y='2'/><c/><d >t</d></a>";
        let doc = parse(input).expect("parse");
        assert_eq!(serialize(&doc), input.as_bytes());
    }

    #[test]
    fn malformed_input_is_a_parse_error() {
        let err = parse("<a><b></a>").expect_err("mismatched tags");
        assert!(matches!(err, Error::Parse(_)), "unexpected: {err}");

        let err = parse("no markup at all").expect_err("no root");
        assert!(matches!(err, Error::Parse(_)), "unexpected: {err}");

        let err = parse("<a>").expect_err("unclosed");
        assert!(matches!(err, Error::Parse(_)), "unexpected: {err}");
    }

    #[test]
    fn text_decodes_entities() {
        let doc = parse(SAMPLE).expect("parse");
        let note = doc
            .root
            .children
            .iter()
            .find_map(|n| match n {
                XmlNode::Element(el) if el.name() == "note" => Some(el),
                _ => None,
            })
            .expect("note element");
        assert_eq!(note.text().as_deref(), Some("a & b"));
    }

    #[test]
    fn set_text_replaces_payload_and_escapes() {
        let mut el = Element::new("ssl-certificate");
        el.set_text("/etc/old.pem");
        el.set_text("/etc/a&b.pem");
        assert_eq!(el.children.len(), 1);
        assert_eq!(el.children[0], XmlNode::Text("/etc/a&amp;b.pem".into()));
        assert_eq!(el.text().as_deref(), Some("/etc/a&b.pem"));
    }

    #[test]
    fn text_is_none_without_text_children() {
        let el = Element::new("paths");
        assert_eq!(el.text(), None);
    }
}
