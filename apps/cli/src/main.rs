use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use deck_core::ipc::{IpcClient, IpcServer};
use deck_core::{Broker, BrokerConfig, Command, DeviceState, SerialTransport};
use tracing::{error, info};

mod output;

use output::{OutputMode, print_event, print_state};

#[derive(Parser, Debug)]
#[command(author, version, about = "Control a serial cassette deck shared between many clients", long_about = None)]
struct Args {
    /// Path to a TOML config file
    #[arg(short = 'C', long)]
    config: Option<PathBuf>,

    /// Serial port the deck is connected to
    #[arg(long)]
    port: Option<String>,

    /// Broker socket path
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Output either human-friendly text or JSON
    #[arg(long, value_enum, default_value_t = OutputMode::Text)]
    output: OutputMode,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Side {
    A,
    B,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run the broker: own the serial port and serve clients
    Serve,
    /// Play a side of the tape
    Play {
        #[arg(value_enum)]
        side: Side,
    },
    /// Fast-forward the tape
    FastForward,
    /// Rewind the tape
    Rewind,
    /// Pause if playing, resume if paused
    Pause,
    /// Stop the tape
    Stop,
    /// Eject the tape
    Eject,
    /// Start status reporting
    Up,
    /// Stop status reporting
    Down,
    /// Print the current state
    State,
    /// Wait for a state
    Expect {
        /// State to wait for, e.g. `stopped` or `playing-a`
        state: DeviceState,
        /// Give up after this many milliseconds; 0 waits forever
        #[arg(long, default_value_t = 5000)]
        timeout: u64,
    },
    /// Make the broker re-read its config and reopen the deck
    Reload,
    /// Print state changes as they happen
    Subscribe {
        /// Stop after this many seconds
        #[arg(long = "for")]
        for_secs: Option<f64>,
    },
    /// Configuration commands
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Print one parameter
    Get { name: String },
    /// Set a parameter in the config file
    Set { name: String, value: String },
    /// Reset a parameter in the config file to its default
    Unset { name: String },
}

fn load_config(args: &Args) -> Result<BrokerConfig> {
    let mut config = match &args.config {
        Some(path) => BrokerConfig::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => BrokerConfig::default(),
    }
    .with_env_overrides();
    if let Some(port) = &args.port {
        config.port = port.clone();
    }
    if let Some(socket) = &args.socket {
        config.socket_path = socket.clone();
    }
    Ok(config)
}

/// Edit the config file named by `--config`, without env or flag overrides.
fn edit_config_file(args: &Args, edit: impl FnOnce(&mut BrokerConfig) -> Result<()>) -> Result<()> {
    let Some(path) = &args.config else {
        bail!("--config is required to change settings");
    };
    let mut config = if path.exists() {
        BrokerConfig::load_from_file(path).with_context(|| format!("loading {}", path.display()))?
    } else {
        BrokerConfig::default()
    };
    edit(&mut config)?;
    config
        .save_to_file(path)
        .with_context(|| format!("writing {}", path.display()))?;
    info!("Updated {}", path.display());
    Ok(())
}

async fn serve(config: BrokerConfig, config_file: Option<PathBuf>) -> Result<()> {
    let transport = Arc::new(SerialTransport::with_baud_rate(
        config.port.clone(),
        config.baud_rate,
    ));
    let broker = Arc::new(Broker::start(config, transport).await?);
    let mut server = IpcServer::bind(broker.clone())?;
    if let Some(path) = config_file {
        server = server.with_config_file(path);
    }
    let ipc = tokio::spawn(server.run());

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    broker.shutdown().await;
    ipc.await??;
    Ok(())
}

async fn send(config: &BrokerConfig, command: Command) -> Result<()> {
    let mut client = IpcClient::connect(&config.socket_path).await?;
    client.command(command).await?;
    Ok(())
}

/// How long `subscribe --for` listens. `None` means until the stream ends.
fn listen_window(for_secs: Option<f64>) -> Result<Option<Duration>> {
    for_secs
        .map(|secs| {
            Duration::try_from_secs_f64(secs.max(0.0))
                .with_context(|| format!("--for {secs} is not a usable duration"))
        })
        .transpose()
}

async fn subscribe(config: &BrokerConfig, mode: OutputMode, for_secs: Option<f64>) -> Result<()> {
    let window = listen_window(for_secs)?;
    let mut client = IpcClient::connect(&config.socket_path).await?;
    client.subscribe().await?;

    let listen = async {
        while let Some(event) = client.next_event().await? {
            print_event(mode, &event);
        }
        anyhow::Ok(())
    };
    match window {
        Some(window) => match tokio::time::timeout(window, listen).await {
            Ok(result) => result,
            Err(_) => Ok(()),
        },
        None => listen.await,
    }
}

async fn run(args: Args) -> Result<()> {
    let config = load_config(&args)?;
    let mode = args.output;

    match args.command {
        Cmd::Serve => serve(config, args.config.clone()).await,
        Cmd::Play { side: Side::A } => send(&config, Command::PlaySideA).await,
        Cmd::Play { side: Side::B } => send(&config, Command::PlaySideB).await,
        Cmd::FastForward => send(&config, Command::FastForward).await,
        Cmd::Rewind => send(&config, Command::Rewind).await,
        Cmd::Pause => send(&config, Command::TogglePause).await,
        Cmd::Stop => send(&config, Command::Stop).await,
        Cmd::Eject => send(&config, Command::Eject).await,
        Cmd::Up => send(&config, Command::Up).await,
        Cmd::Down => send(&config, Command::Down).await,
        Cmd::State => {
            let mut client = IpcClient::connect(&config.socket_path).await?;
            print_state(mode, client.get_state().await?);
            Ok(())
        }
        Cmd::Expect { state, timeout } => {
            let mut client = IpcClient::connect(&config.socket_path).await?;
            match client.expect(state, timeout).await {
                Ok(reached) => print_state(mode, reached),
                Err(e) if e.remote_kind() == Some("timeout") => {
                    info!("Timed out after {timeout}ms waiting for {state}");
                }
                Err(e) => return Err(e.into()),
            }
            Ok(())
        }
        Cmd::Reload => {
            let mut client = IpcClient::connect(&config.socket_path).await?;
            client.reload().await?;
            Ok(())
        }
        Cmd::Subscribe { for_secs } => subscribe(&config, mode, for_secs).await,
        Cmd::Config {
            action: ConfigAction::Show,
        } => {
            match mode {
                OutputMode::Text => print!("{}", toml::to_string_pretty(&config)?),
                OutputMode::Json => println!("{}", serde_json::to_string_pretty(&config)?),
            }
            Ok(())
        }
        Cmd::Config {
            action: ConfigAction::Get { ref name },
        } => {
            println!("{}", config.get(name)?);
            Ok(())
        }
        Cmd::Config {
            action: ConfigAction::Set { ref name, ref value },
        } => edit_config_file(&args, |config| config.set(name, value)),
        Cmd::Config {
            action: ConfigAction::Unset { ref name },
        } => edit_config_file(&args, |config| config.unset(name)),
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(args).await {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listen_window() {
        assert_eq!(listen_window(None).unwrap(), None);
        assert_eq!(
            listen_window(Some(1.5)).unwrap(),
            Some(Duration::from_millis(1500))
        );
        assert_eq!(listen_window(Some(-3.0)).unwrap(), Some(Duration::ZERO));
        assert!(listen_window(Some(f64::INFINITY)).is_err());
    }

    #[test]
    fn test_config_edit_commands_parse() {
        let args = Args::try_parse_from(["deck", "-C", "deck.toml", "config", "set", "port", "/dev/ttyS1"])
            .unwrap();
        assert!(matches!(
            args.command,
            Cmd::Config {
                action: ConfigAction::Set { ref name, ref value }
            } if name == "port" && value == "/dev/ttyS1"
        ));
        let args = Args::try_parse_from(["deck", "reload"]).unwrap();
        assert!(matches!(args.command, Cmd::Reload));
    }

    #[test]
    fn test_config_set_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deck.toml");
        let path_arg = path.to_str().unwrap();
        let args = Args::try_parse_from(["deck", "-C", path_arg, "config", "set", "baud_rate", "19200"])
            .unwrap();
        edit_config_file(&args, |config| config.set("baud_rate", "19200")).unwrap();
        assert_eq!(BrokerConfig::load_from_file(&path).unwrap().baud_rate, 19200);

        edit_config_file(&args, |config| config.unset("baud_rate")).unwrap();
        assert_eq!(BrokerConfig::load_from_file(&path).unwrap().baud_rate, 9600);
    }
}
