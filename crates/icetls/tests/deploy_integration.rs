use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use icetls::icecast::IcecastConfig;
use icetls::installer::{Installer, LogSink};
use icetls::settings::InstallerSettings;

const BARE_CONFIG: &str = r#"<?xml version="1.0"?>
<icecast>
    <hostname>stream.example.org</hostname>
    <limits>
        <clients>100</clients>
    </limits>
    <paths>
        <basedir>/usr/share/icecast2</basedir>
        <logdir>/var/log/icecast2</logdir>
    </paths>
</icecast>
"#;

const CONFIG_WITH_SOCKET: &str = r#"<?xml version="1.0"?>
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

fn setup(tmp: &Path, config_body: &str) -> (InstallerSettings, PathBuf, PathBuf, PathBuf) {
    let config = tmp.join("icecast.xml");
    fs::write(&config, config_body).expect("write config");
    let cert = tmp.join("cert.pem");
    let key = tmp.join("key.pem");
    fs::write(&cert, "-----CERT-----\n").expect("write cert");
    fs::write(&key, "-----KEY-----\n").expect("write key");

    let settings = InstallerSettings {
        configuration_file: Some(config.display().to_string()),
        cert_and_key_file: tmp.join("bundle.pem").display().to_string(),
        state_dir: tmp.join("state").display().to_string(),
        ..Default::default()
    };
    (settings, config, cert, key)
}

fn installer(settings: InstallerSettings) -> Installer {
    Installer::new(settings, Arc::new(LogSink)).expect("installer")
}

#[test]
fn fresh_deploy_creates_certificate_entry_and_ssl_socket() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let (settings, config, cert, key) = setup(tmp.path(), BARE_CONFIG);
    let bundle = PathBuf::from(&settings.cert_and_key_file);
    let ins = installer(settings);

    let report = ins.deploy(&cert, &key).expect("deploy");
    assert_eq!(report.hostname.as_deref(), Some("stream.example.org"));
    assert_eq!(report.checkpoint_id, "0001");

    let out = fs::read_to_string(&config).expect("read config");
    assert_eq!(out.matches("<ssl-certificate>").count(), 1);
    assert!(out.contains(&format!(
        "<ssl-certificate>{}</ssl-certificate>",
        bundle.display()
    )));
    assert_eq!(out.matches("<listen-socket>").count(), 1);
    assert!(out.contains("<port>8443</port>"));
    assert!(out.contains("<ssl>1</ssl>"));

    let parsed = IcecastConfig::load(&config).expect("reparse");
    assert!(parsed.has_ssl_listen_socket());

    assert_eq!(
        fs::read(&bundle).expect("read bundle"),
        b"-----CERT-----\n-----KEY-----\n"
    );

    let history = ins.store().history().expect("history");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].title, "enable TLS for stream.example.org");
}

#[test]
fn convert_policy_enables_ssl_on_the_existing_socket() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let (mut settings, config, cert, key) = setup(tmp.path(), CONFIG_WITH_SOCKET);
    settings.create_ssl_socket = false;
    let ins = installer(settings);

    ins.deploy(&cert, &key).expect("deploy");

    let out = fs::read_to_string(&config).expect("read config");
    assert_eq!(out.matches("<listen-socket>").count(), 1);
    assert!(out.contains("<port>8000</port>"));
    assert!(out.contains("<ssl>1</ssl>"));
}

#[test]
fn convert_policy_without_any_socket_still_creates_one() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let (mut settings, config, cert, key) = setup(tmp.path(), BARE_CONFIG);
    settings.create_ssl_socket = false;
    settings.new_ssl_socket_port = 9443;
    let ins = installer(settings);

    ins.deploy(&cert, &key).expect("deploy");

    let out = fs::read_to_string(&config).expect("read config");
    assert_eq!(out.matches("<listen-socket>").count(), 1);
    assert!(out.contains("<port>9443</port>"));
}

#[test]
fn repeated_deploy_does_not_duplicate_document_structure() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let (settings, config, cert, key) = setup(tmp.path(), BARE_CONFIG);
    let ins = installer(settings);

    ins.deploy(&cert, &key).expect("first deploy");
    ins.deploy(&cert, &key).expect("second deploy");

    let out = fs::read_to_string(&config).expect("read config");
    assert_eq!(out.matches("<ssl-certificate>").count(), 1);
    assert_eq!(out.matches("<listen-socket>").count(), 1);
    assert_eq!(ins.store().history().expect("history").len(), 2);
}

#[test]
fn missing_paths_element_aborts_without_touching_the_config() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let body = "<icecast>\n    <hostname>h</hostname>\n</icecast>\n";
    let (settings, config, cert, key) = setup(tmp.path(), body);
    let ins = installer(settings);

    let err = ins.deploy(&cert, &key).expect_err("no paths element");
    assert!(
        matches!(err, icetls::Error::PathNotFound(_)),
        "unexpected: {err}"
    );
    assert_eq!(fs::read_to_string(&config).expect("read config"), body);
}

#[test]
fn malformed_config_aborts_before_any_write() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let body = "<icecast><paths></icecast>";
    let (settings, _config, cert, key) = setup(tmp.path(), body);
    let bundle = PathBuf::from(&settings.cert_and_key_file);
    let ins = installer(settings);

    let err = ins.deploy(&cert, &key).expect_err("malformed config");
    assert!(matches!(err, icetls::Error::Parse(_)), "unexpected: {err}");
    assert!(!bundle.exists());
    assert_eq!(ins.store().history().expect("history").len(), 0);
}

#[test]
fn missing_hostname_is_reported_not_fatal() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let body = "<icecast>\n    <paths>\n    </paths>\n</icecast>\n";
    let (settings, _config, cert, key) = setup(tmp.path(), body);
    let ins = installer(settings);

    let report = ins.deploy(&cert, &key).expect("deploy");
    assert_eq!(report.hostname, None);
    assert_eq!(
        ins.store().history().expect("history")[0].title,
        "enable TLS"
    );
}

#[test]
fn preexisting_bundle_is_checkpointed_and_restored_on_rollback() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let (settings, config, cert, key) = setup(tmp.path(), BARE_CONFIG);
    let bundle = PathBuf::from(&settings.cert_and_key_file);
    fs::write(&bundle, "stale bundle").expect("seed bundle");
    let original_config = fs::read(&config).expect("read config");
    let ins = installer(settings);

    ins.deploy(&cert, &key).expect("deploy");
    assert_ne!(fs::read(&bundle).expect("read bundle"), b"stale bundle");

    ins.rollback(1).expect("rollback");
    assert_eq!(fs::read(&bundle).expect("read bundle"), b"stale bundle");
    assert_eq!(fs::read(&config).expect("read config"), original_config);
}
