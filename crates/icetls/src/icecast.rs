use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::fsutil::atomic_write;
use crate::navigate::{find_child, find_child_mut, resolve_path_mut};
use crate::xmltree::{self, Element, XmlDocument, XmlNode};

const CERT_COMMENT: &str = "ssl-certificate inserted by icetls";
const SOCKET_COMMENT: &str = "ssl socket inserted by icetls";

// What a mutation actually did. The installer turns these into checkpoint
// notes and log lines; the document itself never prints anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOutcome {
    CertificateInserted { path: String },
    CertificateReplaced { path: String, previous: String },
    CertificateUnchanged { path: String },
    SslEnabled { port: Option<String> },
    SslOverwritten { previous: String, port: Option<String> },
    SslAlreadyEnabled { port: Option<String> },
    SocketCreated { port: u16 },
}

pub struct IcecastConfig {
    doc: XmlDocument,
    source_path: PathBuf,
}

impl IcecastConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read(path)
            .map_err(|e| Error::msg(format!("failed to read {}: {e}", path.display())))?;
        let text = String::from_utf8(raw)
            .map_err(|_| Error::Parse(format!("{} is not valid UTF-8", path.display())))?;
        Self::from_str(&text, path)
    }

    pub fn from_str(text: &str, source_path: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            doc: xmltree::parse(text)?,
            source_path: source_path.into(),
        })
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    // "No hostname" is a reportable state for the caller, not an error.
    pub fn hostname(&self) -> Option<String> {
        find_child(&self.doc.root, "hostname")?.text()
    }

    pub fn has_ssl_listen_socket(&self) -> bool {
        self.listen_sockets().any(|socket| {
            find_child(socket, "ssl").and_then(Element::text).as_deref() == Some("1")
        })
    }

    // Index into the root child list, usable with `enable_ssl_on_socket`.
    pub fn first_listen_socket_index(&self) -> Option<usize> {
        self.doc.root.children.iter().position(|node| {
            matches!(node, XmlNode::Element(el) if el.name() == "listen-socket")
        })
    }

    fn listen_sockets(&self) -> impl Iterator<Item = &Element> {
        self.doc.root.children.iter().filter_map(|node| match node {
            XmlNode::Element(el) if el.name() == "listen-socket" => Some(el),
            _ => None,
        })
    }

    // Idempotent: a second call with the same path reports
    // `CertificateUnchanged` and leaves the tree as-is. A missing <paths>
    // element means the configuration is malformed for our purposes and the
    // whole deploy must abort.
    pub fn set_ssl_certificate(&mut self, path: &str) -> Result<MutationOutcome> {
        let paths = resolve_path_mut(&mut self.doc.root, &["paths"])?;
        match find_child_mut(paths, "ssl-certificate") {
            Some(cert) => {
                let previous = cert.text().unwrap_or_default();
                if previous == path {
                    return Ok(MutationOutcome::CertificateUnchanged {
                        path: path.to_string(),
                    });
                }
                cert.set_text(path);
                Ok(MutationOutcome::CertificateReplaced {
                    path: path.to_string(),
                    previous,
                })
            }
            None => {
                let mut cert = Element::new("ssl-certificate");
                cert.set_text(path);
                paths.push(XmlNode::Text("    ".into()));
                paths.push(XmlNode::Comment(CERT_COMMENT.into()));
                paths.push(XmlNode::Text("\n        ".into()));
                paths.push(XmlNode::Element(cert));
                paths.push(XmlNode::Text("\n    ".into()));
                Ok(MutationOutcome::CertificateInserted {
                    path: path.to_string(),
                })
            }
        }
    }

    // Idempotent: running on an already-SSL socket changes nothing.
    pub fn enable_ssl_on_socket(&mut self, root_child_index: usize) -> Result<MutationOutcome> {
        let Some(XmlNode::Element(socket)) = self.doc.root.children.get_mut(root_child_index)
        else {
            return Err(Error::msg(format!(
                "root child {root_child_index} is not an element"
            )));
        };
        if socket.name() != "listen-socket" {
            return Err(Error::msg(format!(
                "root child {root_child_index} is a <{}>, not a <listen-socket>",
                socket.name()
            )));
        }
        let port = find_child(socket, "port").and_then(Element::text);
        match find_child_mut(socket, "ssl") {
            Some(ssl) => {
                let previous = ssl.text().unwrap_or_default();
                if previous == "1" {
                    return Ok(MutationOutcome::SslAlreadyEnabled { port });
                }
                ssl.set_text("1");
                Ok(MutationOutcome::SslOverwritten { previous, port })
            }
            None => {
                let mut ssl = Element::new("ssl");
                ssl.set_text("1");
                socket.push(XmlNode::Element(ssl));
                socket.push(XmlNode::Text("\n    ".into()));
                Ok(MutationOutcome::SslEnabled { port })
            }
        }
    }

    // Deliberately not idempotent: every call appends another socket.
    // Callers gate on `has_ssl_listen_socket()` first.
    pub fn create_ssl_socket(&mut self, port: u16) -> MutationOutcome {
        let mut port_el = Element::new("port");
        port_el.set_text(&port.to_string());
        let mut ssl = Element::new("ssl");
        ssl.set_text("1");

        let mut socket = Element::new("listen-socket");
        socket.push(XmlNode::Text("\n        ".into()));
        socket.push(XmlNode::Element(port_el));
        socket.push(XmlNode::Text("\n        ".into()));
        socket.push(XmlNode::Element(ssl));
        socket.push(XmlNode::Text("\n    ".into()));

        let root = &mut self.doc.root;
        root.push(XmlNode::Text("    ".into()));
        root.push(XmlNode::Comment(SOCKET_COMMENT.into()));
        root.push(XmlNode::Text("\n    ".into()));
        root.push(XmlNode::Element(socket));
        root.push(XmlNode::Text("\n    ".into()));

        MutationOutcome::SocketCreated { port }
    }

    pub fn serialize(&self) -> Vec<u8> {
        xmltree::serialize(&self.doc)
    }

    pub fn save(&self) -> Result<()> {
        atomic_write(&self.source_path, &self.serialize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BARE: &str = r#"<?xml version="1.0"?>
<icecast>
    <hostname>stream.example.org</hostname>
    <paths>
        <basedir>/usr/share/icecast2</basedir>
    </paths>
</icecast>
"#;

    const WITH_SOCKET: &str = r#"<?xml version="1.0"?>
<icecast>
    <hostname>stream.example.org</hostname>
    <paths>
        <basedir>/usr/share/icecast2</basedir>
    </paths>
    <listen-socket>
        <port>8000</port>
    </listen-socket>
</icecast>
"#;

    fn doc(text: &str) -> IcecastConfig {
        IcecastConfig::from_str(text, "/tmp/icecast.xml").expect("parse")
    }

    #[test]
    fn hostname_present_and_absent() {
        assert_eq!(doc(BARE).hostname().as_deref(), Some("stream.example.org"));
        assert_eq!(doc("<icecast><paths/></icecast>").hostname(), None);
    }

    #[test]
    fn ssl_socket_detection_requires_payload_exactly_one() {
        assert!(!doc(WITH_SOCKET).has_ssl_listen_socket());
        assert!(
            doc("<icecast><listen-socket><ssl>1</ssl></listen-socket></icecast>")
                .has_ssl_listen_socket()
        );
        assert!(
            !doc("<icecast><listen-socket><ssl>0</ssl></listen-socket></icecast>")
                .has_ssl_listen_socket()
        );
    }

    #[test]
    fn set_ssl_certificate_inserts_then_is_idempotent() {
        let mut cfg = doc(BARE);
        let first = cfg.set_ssl_certificate("/etc/bundle.pem").expect("insert");
        assert_eq!(
            first,
            MutationOutcome::CertificateInserted {
                path: "/etc/bundle.pem".into()
            }
        );
        let after_first = cfg.serialize();

        let second = cfg.set_ssl_certificate("/etc/bundle.pem").expect("repeat");
        assert_eq!(
            second,
            MutationOutcome::CertificateUnchanged {
                path: "/etc/bundle.pem".into()
            }
        );
        assert_eq!(cfg.serialize(), after_first);

        let out = String::from_utf8(after_first).expect("utf8");
        assert_eq!(out.matches("<ssl-certificate>").count(), 1);
        assert!(out.contains("<ssl-certificate>/etc/bundle.pem</ssl-certificate>"));
        assert!(out.contains(CERT_COMMENT));
    }

    #[test]
    fn set_ssl_certificate_replaces_existing_value() {
        let mut cfg = doc(
            "<icecast><paths><ssl-certificate>/old.pem</ssl-certificate></paths></icecast>",
        );
        let outcome = cfg.set_ssl_certificate("/new.pem").expect("replace");
        assert_eq!(
            outcome,
            MutationOutcome::CertificateReplaced {
                path: "/new.pem".into(),
                previous: "/old.pem".into()
            }
        );
        let out = String::from_utf8(cfg.serialize()).expect("utf8");
        assert_eq!(out.matches("<ssl-certificate>").count(), 1);
        assert!(out.contains("<ssl-certificate>/new.pem</ssl-certificate>"));
    }

    #[test]
    fn set_ssl_certificate_without_paths_fails_and_leaves_doc_alone() {
        let mut cfg = doc("<icecast><hostname>h</hostname></icecast>");
        let before = cfg.serialize();
        let err = cfg.set_ssl_certificate("/etc/bundle.pem").expect_err("no paths");
        assert!(matches!(err, Error::PathNotFound(_)), "unexpected: {err}");
        assert_eq!(cfg.serialize(), before);
    }

    #[test]
    fn enable_ssl_adds_child_and_keeps_port() {
        let mut cfg = doc(WITH_SOCKET);
        let idx = cfg.first_listen_socket_index().expect("socket index");
        let outcome = cfg.enable_ssl_on_socket(idx).expect("enable");
        assert_eq!(
            outcome,
            MutationOutcome::SslEnabled {
                port: Some("8000".into())
            }
        );
        let out = String::from_utf8(cfg.serialize()).expect("utf8");
        assert!(out.contains("<ssl>1</ssl>"));
        assert!(out.contains("<port>8000</port>"));
        assert!(cfg.has_ssl_listen_socket());
    }

    #[test]
    fn enable_ssl_twice_equals_once() {
        let mut cfg = doc(WITH_SOCKET);
        let idx = cfg.first_listen_socket_index().expect("socket index");
        cfg.enable_ssl_on_socket(idx).expect("first");
        let once = cfg.serialize();
        let again = cfg.enable_ssl_on_socket(idx).expect("second");
        assert!(matches!(again, MutationOutcome::SslAlreadyEnabled { .. }));
        assert_eq!(cfg.serialize(), once);
    }

    #[test]
    fn enable_ssl_overwrites_disabled_value() {
        let mut cfg =
            doc("<icecast><listen-socket><ssl>0</ssl></listen-socket></icecast>");
        let idx = cfg.first_listen_socket_index().expect("socket index");
        let outcome = cfg.enable_ssl_on_socket(idx).expect("enable");
        assert_eq!(
            outcome,
            MutationOutcome::SslOverwritten {
                previous: "0".into(),
                port: None
            }
        );
        assert!(cfg.has_ssl_listen_socket());
    }

    #[test]
    fn create_ssl_socket_twice_creates_two_sockets() {
        let mut cfg = doc(BARE);
        cfg.create_ssl_socket(8443);
        cfg.create_ssl_socket(8443);
        let out = String::from_utf8(cfg.serialize()).expect("utf8");
        assert_eq!(out.matches("<listen-socket>").count(), 2);
    }

    #[test]
    fn fresh_deploy_scenario_produces_expected_document() {
        let mut cfg = doc(BARE);
        cfg.set_ssl_certificate("/etc/bundle.pem").expect("cert");
        assert!(!cfg.has_ssl_listen_socket());
        cfg.create_ssl_socket(8443);
        let out = String::from_utf8(cfg.serialize()).expect("utf8");
        assert_eq!(out.matches("<ssl-certificate>").count(), 1);
        assert_eq!(out.matches("<listen-socket>").count(), 1);
        assert!(out.contains("<ssl-certificate>/etc/bundle.pem</ssl-certificate>"));
        assert!(out.contains("<port>8443</port>"));
        assert!(out.contains("<ssl>1</ssl>"));
        assert!(cfg.has_ssl_listen_socket());
    }

    #[test]
    fn untouched_document_round_trips_byte_identically() {
        let cfg = doc(WITH_SOCKET);
        assert_eq!(cfg.serialize(), WITH_SOCKET.as_bytes());
    }
}
