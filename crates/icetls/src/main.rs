use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};

use icetls::Result;
use icetls::installer::{Installer, LogSink};
use icetls::settings::{self, InstallerSettings};

const DEFAULT_SETTINGS_PATH: &str = "/etc/icetls.toml";

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to an installer settings TOML (default: /etc/icetls.toml if present)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
    /// Directory for checkpoints and the deploy lock
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Bundle cert+key, enable TLS in the configuration, checkpoint the change
    Deploy {
        /// Public certificate (PEM)
        #[arg(long)]
        cert: PathBuf,
        /// Private key (PEM)
        #[arg(long)]
        key: PathBuf,
        /// Icecast configuration file (discovered in common locations when omitted)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Where to write the concatenated cert+key bundle
        #[arg(long)]
        bundle_out: Option<PathBuf>,
        /// Convert the first existing socket instead of creating a new one
        #[arg(long)]
        convert_existing: bool,
        /// Port for a newly created ssl socket
        #[arg(long)]
        ssl_port: Option<u16>,
        /// Skip the service restart after a successful save
        #[arg(long)]
        no_restart: bool,
    },
    /// Undo the most recent finalized checkpoints
    Rollback {
        /// How many checkpoints to undo
        #[arg(default_value_t = 1)]
        count: usize,
    },
    /// Show the changes recorded in the open (unfinalized) checkpoint
    Pending,
    /// List finalized checkpoints, oldest first
    History,
    /// Print the hostname configured in the icecast configuration
    Hostname {
        /// Icecast configuration file (discovered in common locations when omitted)
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Roll back any change left unfinished by an interrupted run
    Recover,
}

fn main() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let mut settings = load_settings(args.settings.as_deref())?;
    if let Some(dir) = &args.state_dir {
        settings.state_dir = dir.display().to_string();
    }

    match args.cmd {
        Command::Deploy {
            cert,
            key,
            config,
            bundle_out,
            convert_existing,
            ssl_port,
            no_restart,
        } => {
            if let Some(p) = config {
                settings.configuration_file = Some(p.display().to_string());
            }
            if let Some(p) = bundle_out {
                settings.cert_and_key_file = p.display().to_string();
            }
            if convert_existing {
                settings.create_ssl_socket = false;
            }
            if let Some(p) = ssl_port {
                settings.new_ssl_socket_port = p;
            }
            cmd_deploy(settings, &cert, &key, no_restart)
        }
        Command::Rollback { count } => cmd_rollback(settings, count),
        Command::Pending => cmd_pending(settings),
        Command::History => cmd_history(settings),
        Command::Hostname { config } => {
            if let Some(p) = config {
                settings.configuration_file = Some(p.display().to_string());
            }
            cmd_hostname(settings)
        }
        Command::Recover => cmd_recover(settings),
    }
}

fn load_settings(path: Option<&Path>) -> Result<InstallerSettings> {
    match path {
        Some(p) => settings::load(p),
        None => {
            let default_path = Path::new(DEFAULT_SETTINGS_PATH);
            if default_path.is_file() {
                settings::load(default_path)
            } else {
                Ok(InstallerSettings::default())
            }
        }
    }
}

fn cmd_deploy(
    settings: InstallerSettings,
    cert: &Path,
    key: &Path,
    no_restart: bool,
) -> Result<()> {
    let restart_command = settings.restart_command.clone();
    let installer = Installer::new(settings, Arc::new(LogSink))?;
    let report = installer.deploy(cert, key)?;

    println!("deployed: {}", report.config_path.display());
    println!("bundle:   {}", report.bundle_path.display());
    println!("checkpoint {} recorded:", report.checkpoint_id);
    for note in &report.notes {
        println!("  - {note}");
    }

    if no_restart {
        println!("restart skipped (--no-restart); restart icecast to pick up the change");
        return Ok(());
    }
    let outcome = icetls::service::restart_service(&restart_command)?;
    if outcome.ok {
        println!("icecast restarted");
    } else {
        // The save already stands; a failed restart is reported, not fatal.
        tracing::warn!(
            "icecast restart failed ({}); the configuration change is saved and stands",
            outcome.detail
        );
    }
    Ok(())
}

fn cmd_rollback(settings: InstallerSettings, count: usize) -> Result<()> {
    let installer = Installer::new(settings, Arc::new(LogSink))?;
    let entries = installer.rollback(count)?;
    for entry in &entries {
        println!("rolled back {} ({})", entry.id, entry.title);
        for path in &entry.restored {
            println!("  restored {}", path.display());
        }
    }
    if !entries.is_empty() {
        println!("restart icecast to pick up the restored configuration");
    }
    Ok(())
}

fn cmd_pending(settings: InstallerSettings) -> Result<()> {
    let installer = Installer::new(settings, Arc::new(LogSink))?;
    let listing = installer.store().list_pending_changes()?;
    println!("{}", listing.trim_end());
    Ok(())
}

fn cmd_history(settings: InstallerSettings) -> Result<()> {
    let installer = Installer::new(settings, Arc::new(LogSink))?;
    let history = installer.store().history()?;
    if history.is_empty() {
        println!("no checkpoints recorded");
        return Ok(());
    }
    for entry in &history {
        println!(
            "{}  {}  {} ({} file{})",
            entry.id,
            entry.finalized_at,
            entry.title,
            entry.file_count,
            if entry.file_count == 1 { "" } else { "s" }
        );
    }
    Ok(())
}

fn cmd_hostname(settings: InstallerSettings) -> Result<()> {
    let installer = Installer::new(settings, Arc::new(LogSink))?;
    let config_path = installer.locate_config()?;
    let config = icetls::icecast::IcecastConfig::load(&config_path)?;
    match config.hostname() {
        Some(hostname) => println!("{hostname}"),
        None => println!("no hostname configured"),
    }
    Ok(())
}

fn cmd_recover(settings: InstallerSettings) -> Result<()> {
    let installer = Installer::new(settings, Arc::new(LogSink))?;
    match installer.recover()? {
        Some(report) => {
            println!("restored an interrupted change:");
            for path in &report.restored {
                println!("  restored {}", path.display());
            }
            for note in &report.notes {
                println!("  note: {note}");
            }
        }
        None => println!("nothing to recover"),
    }
    Ok(())
}
