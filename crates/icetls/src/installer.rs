use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::checkpoints::{CheckpointStore, RollbackEntry};
use crate::error::{Error, Result};
use crate::fsutil::{atomic_write, ensure_dir};
use crate::icecast::{IcecastConfig, MutationOutcome};
use crate::settings::InstallerSettings;

// Checked in order when no configuration file is given; the first hit wins.
pub const COMMON_CONFIG_PATHS: &[&str] = &[
    "/etc/icecast2/icecast.xml",
    "/etc/icecast/icecast.xml",
    "/usr/local/etc/icecast.xml",
    "/usr/local/etc/icecast2/icecast.xml",
];

#[derive(Debug, Clone)]
pub enum DeployEvent {
    ConfigLocated { path: PathBuf },
    HostnameReported { hostname: Option<String> },
    BundleWritten { path: PathBuf },
    ConfigChanged { outcome: MutationOutcome },
    Saved { path: PathBuf },
    CheckpointFinalized { id: String, title: String },
    RestartRequested,
}

pub trait ReportSink: Send + Sync {
    fn emit(&self, ev: DeployEvent);
}

// Default sink: everything goes to the log. The core never prints.
#[derive(Default)]
pub struct LogSink;

impl ReportSink for LogSink {
    fn emit(&self, ev: DeployEvent) {
        match ev {
            DeployEvent::ConfigLocated { path } => {
                tracing::info!(config = %path.display(), "using icecast configuration");
            }
            DeployEvent::HostnameReported { hostname: Some(h) } => {
                tracing::info!(hostname = %h, "hostname configured");
            }
            DeployEvent::HostnameReported { hostname: None } => {
                tracing::warn!("no hostname configured; nothing to certify against");
            }
            DeployEvent::BundleWritten { path } => {
                tracing::info!(bundle = %path.display(), "wrote cert+key bundle");
            }
            DeployEvent::ConfigChanged { outcome } => {
                tracing::info!("{}", note_for(&outcome));
            }
            DeployEvent::Saved { path } => {
                tracing::info!(config = %path.display(), "configuration saved");
            }
            DeployEvent::CheckpointFinalized { id, title } => {
                tracing::info!(%id, %title, "checkpoint finalized");
            }
            DeployEvent::RestartRequested => {
                tracing::info!("configuration changed; icecast restart requested");
            }
        }
    }
}

pub fn note_for(outcome: &MutationOutcome) -> String {
    match outcome {
        MutationOutcome::CertificateInserted { path } => {
            format!("added ssl-certificate {path}")
        }
        MutationOutcome::CertificateReplaced { path, previous } => {
            format!("changed ssl-certificate from {previous} to {path}")
        }
        MutationOutcome::CertificateUnchanged { path } => {
            format!("ssl-certificate already set to {path}")
        }
        MutationOutcome::SslEnabled { port } => match port {
            Some(p) => format!("enabled ssl on the listen-socket for port {p}"),
            None => "enabled ssl on an existing listen-socket".to_string(),
        },
        MutationOutcome::SslOverwritten { previous, port } => match port {
            Some(p) => format!("changed ssl from {previous} to 1 on the listen-socket for port {p}"),
            None => format!("changed ssl from {previous} to 1 on an existing listen-socket"),
        },
        MutationOutcome::SslAlreadyEnabled { port } => match port {
            Some(p) => format!("listen-socket for port {p} already has ssl enabled"),
            None => "listen-socket already has ssl enabled".to_string(),
        },
        MutationOutcome::SocketCreated { port } => {
            format!("created ssl listen-socket on port {port}")
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeployReport {
    pub checkpoint_id: String,
    pub config_path: PathBuf,
    pub bundle_path: PathBuf,
    pub hostname: Option<String>,
    pub notes: Vec<String>,
}

pub struct Installer {
    settings: InstallerSettings,
    store: CheckpointStore,
    sink: Arc<dyn ReportSink>,
}

impl Installer {
    pub fn new(settings: InstallerSettings, sink: Arc<dyn ReportSink>) -> Result<Self> {
        let state_dir = PathBuf::from(&settings.state_dir);
        ensure_dir(&state_dir)?;
        let store = CheckpointStore::new(state_dir.join("checkpoints"))?;
        Ok(Self {
            settings,
            store,
            sink,
        })
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    fn state_dir(&self) -> PathBuf {
        PathBuf::from(&self.settings.state_dir)
    }

    fn recover_with_log(&self) -> Result<()> {
        if let Some(report) = self.store.recover()? {
            tracing::warn!(
                files = report.restored.len(),
                "restored an interrupted change left by a previous run"
            );
        }
        Ok(())
    }

    // The whole deploy pipeline: checkpoint the files about to change, write
    // the bundle, mutate the document, save, finalize. Any error before the
    // save leaves the configuration file untouched on disk.
    pub fn deploy(&self, cert: &Path, key: &Path) -> Result<DeployReport> {
        let _lock = DeployLock::acquire(&self.state_dir())?;
        self.recover_with_log()?;

        let config_path = self.locate_config()?;
        self.sink.emit(DeployEvent::ConfigLocated {
            path: config_path.clone(),
        });

        let mut config = IcecastConfig::load(&config_path)?;
        let hostname = config.hostname();
        self.sink.emit(DeployEvent::HostnameReported {
            hostname: hostname.clone(),
        });

        let bundle_path = self.bundle_path()?;

        // Register everything about to be rewritten before the first write.
        let mut tracked = vec![config_path.clone()];
        if bundle_path.exists() {
            tracked.push(bundle_path.clone());
        }
        self.store.add_to_checkpoint(
            &tracked,
            &format!("enable TLS in {}", config_path.display()),
        )?;

        write_bundle(cert, key, &bundle_path)?;
        self.sink.emit(DeployEvent::BundleWritten {
            path: bundle_path.clone(),
        });

        let mut outcomes =
            vec![config.set_ssl_certificate(&bundle_path.display().to_string())?];
        if !config.has_ssl_listen_socket() {
            match config.first_listen_socket_index() {
                Some(idx) if !self.settings.create_ssl_socket => {
                    outcomes.push(config.enable_ssl_on_socket(idx)?);
                }
                _ => {
                    outcomes.push(config.create_ssl_socket(self.settings.new_ssl_socket_port));
                }
            }
        }

        let notes: Vec<String> = outcomes.iter().map(note_for).collect();
        for outcome in &outcomes {
            self.sink.emit(DeployEvent::ConfigChanged {
                outcome: outcome.clone(),
            });
        }
        self.store.add_to_checkpoint(&[], &notes.join("; "))?;

        config.save()?;
        self.sink.emit(DeployEvent::Saved {
            path: config_path.clone(),
        });

        let title = match &hostname {
            Some(h) => format!("enable TLS for {h}"),
            None => "enable TLS".to_string(),
        };
        let checkpoint_id = self.store.finalize_checkpoint(&title)?;
        self.sink.emit(DeployEvent::CheckpointFinalized {
            id: checkpoint_id.clone(),
            title,
        });
        self.sink.emit(DeployEvent::RestartRequested);

        Ok(DeployReport {
            checkpoint_id,
            config_path,
            bundle_path,
            hostname,
            notes,
        })
    }

    pub fn rollback(&self, n: usize) -> Result<Vec<RollbackEntry>> {
        let _lock = DeployLock::acquire(&self.state_dir())?;
        self.recover_with_log()?;
        self.store.rollback(n)
    }

    pub fn recover(&self) -> Result<Option<crate::checkpoints::RecoveryReport>> {
        let _lock = DeployLock::acquire(&self.state_dir())?;
        self.store.recover()
    }

    pub fn locate_config(&self) -> Result<PathBuf> {
        if let Some(raw) = &self.settings.configuration_file {
            let p = PathBuf::from(raw);
            if !p.is_file() {
                return Err(Error::msg(format!(
                    "configuration file {} does not exist",
                    p.display()
                )));
            }
            return absolutize(&p);
        }
        discover_config_path()
    }

    fn bundle_path(&self) -> Result<PathBuf> {
        absolutize(Path::new(&self.settings.cert_and_key_file))
    }
}

pub fn discover_config_path() -> Result<PathBuf> {
    for candidate in COMMON_CONFIG_PATHS {
        let p = Path::new(candidate);
        if p.is_file() {
            return Ok(p.to_path_buf());
        }
    }
    Err(Error::msg(
        "no icecast configuration found in the usual locations; pass one explicitly",
    ))
}

// Icecast reads the public certificate and the private key from a single
// file, certificate first.
pub fn write_bundle(cert: &Path, key: &Path, out: &Path) -> Result<()> {
    let mut data = fs::read(cert)
        .map_err(|e| Error::msg(format!("failed to read certificate {}: {e}", cert.display())))?;
    let mut key_data = fs::read(key)
        .map_err(|e| Error::msg(format!("failed to read private key {}: {e}", key.display())))?;
    data.append(&mut key_data);
    atomic_write(out, &data)
}

fn absolutize(p: &Path) -> Result<PathBuf> {
    std::path::absolute(p)
        .map_err(|e| Error::msg(format!("cannot resolve {}: {e}", p.display())))
}

// One deploy at a time. The lock file guards the whole mutate-save-finalize
// sequence, not individual store calls.
struct DeployLock {
    path: PathBuf,
}

impl DeployLock {
    fn acquire(state_dir: &Path) -> Result<Self> {
        ensure_dir(state_dir)?;
        let path = state_dir.join(".deploy.lock");
        let deadline = Instant::now() + Duration::from_secs(15);
        loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(_) => return Ok(Self { path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if Instant::now() >= deadline {
                        return Err(Error::msg(format!(
                            "timed out waiting for deploy lock {} (another deploy in progress?)",
                            path.display()
                        )));
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(e) => {
                    return Err(Error::msg(format!(
                        "failed to acquire deploy lock {}: {e}",
                        path.display()
                    )));
                }
            }
        }
    }
}

impl Drop for DeployLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
