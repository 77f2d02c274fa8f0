//! relaydrop-cli library
//!
//! Command-line front end for a relaydrop deployment: runs the relay, keeps
//! a peer attached to it, lists the roster and pushes files to roster peers.
//!
//! Configuration
//! - Defaults come from `config.toml` in the platform config directory (see
//!   [`CliConfig`]), or from the file given with `--config`.
//! - Flags override the file.
//!
//! Logging goes through `tracing`; `RUST_LOG` overrides the level chosen by
//! `--verbose`.
//!
//! ```text
//! relaydrop relay --roster roster.txt --staging /var/spool/relaydrop
//! relaydrop listen relay-host --dest ~/Downloads
//! relaydrop roster relay-host
//! relaydrop send --server relay-host --to 1 --to bob-pc report.pdf notes.md
//! relaydrop config show
//! ```

mod config;
mod progress;

use std::{
    net::IpAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use relaydrop_client::{
    ClientSession, ConnectionState, spawn_auto_connect,
};
use relaydrop_entities::Roster;
use relaydrop_relay::RelayEngine;
use tokio::time::{sleep, timeout};
use tracing::{debug, info};

pub use config::CliConfig;
use progress::{ClientProgress, RelayPrinter};

const ROSTER_TIMEOUT: Duration = Duration::from_secs(15);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Fixed-roster file exchange through a central relay
#[derive(Parser, Debug)]
#[command(name = "relaydrop")]
#[command(version)]
#[command(about = "Fixed-roster file exchange through a central relay")]
pub struct Cli {
    /// Print debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file to read instead of the default one
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the relay until Ctrl+C
    Relay {
        /// Roster file, one `<displayName> <hostName>` per line
        #[arg(short, long)]
        roster: Option<PathBuf>,

        /// Directory where uploads wait for their receivers
        #[arg(short, long)]
        staging: Option<PathBuf>,

        /// Address to listen on
        #[arg(short, long)]
        bind: Option<IpAddr>,

        #[arg(long)]
        control_port: Option<u16>,

        #[arg(long)]
        data_port: Option<u16>,
    },

    /// Stay attached to a relay and receive whatever it pushes
    Listen {
        /// Relays to try in order; defaults to `server_host`
        servers: Vec<String>,

        /// Directory for received files
        #[arg(short, long)]
        dest: Option<PathBuf>,

        /// This machine's host name as listed in the roster
        #[arg(long)]
        host_name: Option<String>,

        /// Source address for every connection
        #[arg(short, long)]
        bind: Option<IpAddr>,
    },

    /// Print the relay's roster
    Roster {
        server: Option<String>,
    },

    /// Push files to roster peers through the relay
    Send {
        /// Relay to push through; defaults to `server_host`
        #[arg(short, long)]
        server: Option<String>,

        /// Receiver, by roster index or host name (repeatable)
        #[arg(short, long = "to", required = true, value_name = "PEER")]
        to: Vec<String>,

        /// Files to send
        #[arg(required = true)]
        files: Vec<PathBuf>,

        #[arg(long)]
        host_name: Option<String>,

        #[arg(short, long)]
        bind: Option<IpAddr>,
    },

    /// Inspect the configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Show the configuration file in use and its contents
    Show,
}

fn setup_logging(verbose: bool) {
    let filter = if verbose { "debug" } else { "info" };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

/// Parses the command line and runs the selected command.
pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);
    let config = CliConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Relay {
            roster,
            staging,
            bind,
            control_port,
            data_port,
        } => {
            let mut config = config;
            if let Some(roster) = roster {
                config.roster_file = Some(roster);
            }
            if staging.is_some() {
                config.staging_dir = staging;
            }
            if bind.is_some() {
                config.bind_address = bind;
            }
            if let Some(port) = control_port {
                config.ports.control_port = port;
            }
            if let Some(port) = data_port {
                config.ports.data_port = port;
            }
            run_relay(&config, cli.verbose).await
        }
        Commands::Listen {
            servers,
            dest,
            host_name,
            bind,
        } => {
            let mut config = config;
            apply_client_overrides(&mut config, host_name, bind);
            if dest.is_some() {
                config.destination = dest;
            }
            let servers = if servers.is_empty() {
                vec![config.server(None)?]
            } else {
                servers
            };
            run_listen(&config, servers, cli.verbose).await
        }
        Commands::Roster { server } => {
            let server = config.server(server)?;
            run_roster(&config, &server, cli.verbose).await
        }
        Commands::Send {
            server,
            to,
            files,
            host_name,
            bind,
        } => {
            let mut config = config;
            apply_client_overrides(&mut config, host_name, bind);
            validate_files(&files)?;
            let server = config.server(server)?;
            run_send(&config, &server, &to, &files, cli.verbose).await
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => show_config(cli.config.as_deref(), &config),
        },
    }
}

fn apply_client_overrides(
    config: &mut CliConfig,
    host_name: Option<String>,
    bind: Option<IpAddr>,
) {
    if host_name.is_some() {
        config.host_name = host_name;
    }
    if bind.is_some() {
        config.bind_address = bind;
    }
}

fn validate_files(files: &[PathBuf]) -> Result<()> {
    for path in files {
        if !path.exists() {
            return Err(anyhow!("File does not exist: {}", path.display()));
        }
        if !path.is_file() {
            return Err(anyhow!("Path is not a file: {}", path.display()));
        }
    }
    Ok(())
}

async fn run_relay(config: &CliConfig, verbose: bool) -> Result<()> {
    let roster_file = config.roster_file.as_ref().ok_or_else(|| {
        anyhow!("No roster given: pass --roster or set roster_file")
    })?;
    let roster = Roster::load(roster_file).with_context(|| {
        format!("Invalid roster file: {}", roster_file.display())
    })?;
    if roster.is_empty() {
        return Err(anyhow!(
            "Roster file lists no peers: {}",
            roster_file.display()
        ));
    }

    let engine = RelayEngine::with_resolver(
        roster,
        config.relay_config(),
        Arc::new(config.resolver()),
    );
    engine.subscribe(Arc::new(RelayPrinter::new(verbose)));
    engine.start().context("Failed to start the relay")?;
    println!("Staging uploads in {}", engine.staging_dir().display());
    println!("Press Ctrl+C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for Ctrl+C")?;
    engine.stop();
    let pending = engine.pending_jobs();
    if !pending.is_empty() {
        println!(
            "{} job(s) were still waiting for their receivers",
            pending.len()
        );
    }
    Ok(())
}

fn new_session(config: &CliConfig) -> ClientSession {
    ClientSession::with_resolver(
        config.client_config(),
        Arc::new(config.resolver()),
    )
}

async fn run_listen(
    config: &CliConfig,
    servers: Vec<String>,
    verbose: bool,
) -> Result<()> {
    let session = new_session(config);
    session.subscribe(Arc::new(ClientProgress::new(verbose, true)));
    println!("Files will be saved to: {}", session.destination().display());
    println!("Listening... (Press Ctrl+C to stop)");

    let interval = config.client_config().retry_interval;
    let auto_connect = spawn_auto_connect(session.clone(), servers, interval);
    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for Ctrl+C")?;
    auto_connect.abort();
    session.disconnect();
    Ok(())
}

/// Connects and waits until the relay's roster has arrived.
async fn connect_with_roster(
    session: &ClientSession,
    server: &str,
) -> Result<Roster> {
    session
        .connect(server)
        .await
        .with_context(|| format!("Failed to connect to relay {}", server))?;
    session
        .request_roster()
        .await
        .context("Failed to request the roster")?;
    timeout(ROSTER_TIMEOUT, async {
        loop {
            let roster = session.roster();
            if !roster.is_empty() {
                return Ok(roster);
            }
            if session.state() == ConnectionState::Disconnected {
                return Err(anyhow!("Relay {} went away", server));
            }
            sleep(POLL_INTERVAL).await;
        }
    })
    .await
    .map_err(|_| anyhow!("Relay {} did not send its roster", server))?
}

async fn run_roster(
    config: &CliConfig,
    server: &str,
    verbose: bool,
) -> Result<()> {
    let session = new_session(config);
    if verbose {
        session.subscribe(Arc::new(ClientProgress::new(verbose, false)));
    }
    let roster = connect_with_roster(&session, server).await?;
    session.disconnect();

    for (index, peer) in roster.iter().enumerate() {
        println!(
            "{:>3}  {:<20} {}",
            index,
            peer.display_name(),
            peer.host_name()
        );
    }
    Ok(())
}

/// Turns `--to` values into roster indices. Numbers are indices; anything
/// else must be a roster host name.
fn resolve_receivers(
    roster: &Roster,
    selection: &[String],
) -> Result<Vec<usize>> {
    selection
        .iter()
        .map(|token| match token.parse::<usize>() {
            Ok(index) => Ok(index),
            Err(_) => roster
                .index_of(token)
                .ok_or_else(|| anyhow!("Unknown receiver: {}", token)),
        })
        .collect()
}

async fn run_send(
    config: &CliConfig,
    server: &str,
    to: &[String],
    files: &[PathBuf],
    verbose: bool,
) -> Result<()> {
    let session = new_session(config);
    session.subscribe(Arc::new(ClientProgress::new(verbose, false)));
    let roster = connect_with_roster(&session, server).await?;
    let receivers = resolve_receivers(&roster, to)?;
    debug!("Sending {} files to indices {:?}", files.len(), receivers);

    println!("Waiting for the relay to collect the files...");
    let sent = session.send(files, &receivers).await;
    session.disconnect();
    let sent = sent.context("Failed to send files")?;

    info!("Sent {} files to {}", sent.files.len(), sent.peer_host_name);
    println!("All files sent successfully!");
    Ok(())
}

fn show_config(explicit: Option<&Path>, config: &CliConfig) -> Result<()> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => CliConfig::config_file()?,
    };
    if path.exists() {
        println!("Configuration file: {}", path.display());
    } else {
        println!("No configuration file at {}, using defaults", path.display());
    }
    let effective = toml::to_string_pretty(config)
        .context("Failed to serialize config")?;
    println!("{}", effective);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaydrop_entities::Peer;

    fn roster() -> Roster {
        Roster::new(vec![
            Peer::new("Ann", "ann-pc"),
            Peer::new("Bob", "bob-pc"),
        ])
        .unwrap()
    }

    #[test]
    fn receivers_by_index_or_host_name() {
        let selection = ["1".to_string(), "ann-pc".to_string()];
        assert_eq!(
            resolve_receivers(&roster(), &selection).unwrap(),
            vec![1, 0]
        );
    }

    #[test]
    fn unknown_host_name_is_rejected() {
        let err = resolve_receivers(&roster(), &["zed-pc".to_string()])
            .unwrap_err();
        assert!(err.to_string().contains("zed-pc"));
    }

    #[test]
    fn out_of_range_indices_are_left_to_the_session() {
        assert_eq!(
            resolve_receivers(&roster(), &["7".to_string()]).unwrap(),
            vec![7]
        );
    }

    #[test]
    fn send_requires_receivers_and_files() {
        assert!(Cli::try_parse_from(["relaydrop", "send", "a.txt"]).is_err());
        assert!(
            Cli::try_parse_from(["relaydrop", "send", "--to", "1"]).is_err()
        );
        let cli = Cli::try_parse_from([
            "relaydrop", "send", "-s", "relay", "--to", "1", "--to", "bob-pc",
            "a.txt", "b.txt",
        ])
        .unwrap();
        let Commands::Send {
            to, files, server, ..
        } = cli.command
        else {
            panic!("expected send");
        };
        assert_eq!(server.as_deref(), Some("relay"));
        assert_eq!(to, vec!["1", "bob-pc"]);
        assert_eq!(
            files,
            vec![PathBuf::from("a.txt"), PathBuf::from("b.txt")]
        );
    }

    #[test]
    fn send_falls_back_to_the_configured_relay() {
        let cli =
            Cli::try_parse_from(["relaydrop", "send", "--to", "1", "a.txt"])
                .unwrap();
        let Commands::Send { server, .. } = cli.command else {
            panic!("expected send");
        };
        assert_eq!(server, None);
        let config = CliConfig {
            server_host: Some("relay-host".to_string()),
            ..CliConfig::default()
        };
        assert_eq!(config.server(server).unwrap(), "relay-host");
    }
}
