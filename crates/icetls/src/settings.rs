use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

fn default_cert_and_key_file() -> String {
    "icecast_cert_key.pem".into()
}

fn default_true() -> bool {
    true
}

fn default_ssl_port() -> u16 {
    8443
}

fn default_state_dir() -> String {
    "/var/lib/icetls".into()
}

fn default_restart_command() -> Vec<String> {
    vec!["systemctl".into(), "restart".into(), "icecast2".into()]
}

// Knobs the installer honors but never invents: the caller (CLI flags or a
// TOML settings file) supplies them.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InstallerSettings {
    // Icecast configuration file; discovered in common locations when unset.
    pub configuration_file: Option<String>,
    // Where the concatenated cert+key bundle is written.
    #[serde(default = "default_cert_and_key_file")]
    pub cert_and_key_file: String,
    // When no SSL socket exists: create a new one (true) or convert the
    // first existing socket (false). With no socket at all a new one is
    // created regardless.
    #[serde(default = "default_true")]
    pub create_ssl_socket: bool,
    #[serde(default = "default_ssl_port")]
    pub new_ssl_socket_port: u16,
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
    #[serde(default = "default_restart_command")]
    pub restart_command: Vec<String>,
}

impl Default for InstallerSettings {
    fn default() -> Self {
        Self {
            configuration_file: None,
            cert_and_key_file: default_cert_and_key_file(),
            create_ssl_socket: default_true(),
            new_ssl_socket_port: default_ssl_port(),
            state_dir: default_state_dir(),
            restart_command: default_restart_command(),
        }
    }
}

pub fn load(path: &Path) -> Result<InstallerSettings> {
    let raw = fs::read_to_string(path)
        .map_err(|e| Error::msg(format!("failed to read settings {}: {e}", path.display())))?;
    toml::from_str(&raw)
        .map_err(|e| Error::msg(format!("TOML parse error in {}: {e}", path.display())))
}
