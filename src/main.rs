//! `learnbro-live`: talk to the LearnBro tutor from a terminal.
//!
//! | Command | Description |
//! |---------|-------------|
//! | `talk` | Start a voice call on the default microphone and speakers |
//! | `devices` | List audio input and output devices |
//! | `config` | Show the effective configuration or its path |

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use learnbro_live::voice::cpal_backend::CpalBackend;
use learnbro_live::{BridgeCallbacks, Config, ConnectionStatus, VoiceBridge, VoiceLanguage};

/// Realtime voice calls with the LearnBro tutor.
#[derive(Parser, Debug)]
#[command(name = "learnbro-live", version, about)]
struct Cli {
    /// Config file (defaults to the per-user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a voice call; Ctrl-C hangs up
    Talk {
        /// english, hindi or bengali (defaults to tutor.language)
        #[arg(short, long)]
        language: Option<VoiceLanguage>,

        /// Join with the microphone muted
        #[arg(long)]
        muted: bool,
    },
    /// List audio devices
    Devices,
    /// Print the effective configuration
    Config {
        /// Only print the config file path
        #[arg(long)]
        path: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("learnbro_live=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Talk { language, muted } => talk(config, language, muted).await,
        Commands::Devices => devices(),
        Commands::Config { path } => show_config(&config, path),
    }
}

async fn talk(config: Config, language: Option<VoiceLanguage>, muted: bool) -> Result<()> {
    let language = language.unwrap_or(config.tutor.language);
    let (closed_tx, mut closed_rx) = tokio::sync::mpsc::unbounded_channel::<()>();

    let callbacks = BridgeCallbacks::new()
        .on_status_change(|status| eprintln!("\n[{status}]"))
        .on_volume_update(|level| {
            let bars = ((level * 4.0).min(1.0) * 24.0) as usize;
            eprint!("\r mic {:<24}", "#".repeat(bars));
            let _ = std::io::stderr().flush();
        })
        .on_close(move || {
            let _ = closed_tx.send(());
        });

    let bridge = VoiceBridge::new(
        config.bridge_config(),
        Arc::new(CpalBackend::new()),
        Arc::new(config.connector()),
        callbacks,
    );
    bridge.set_muted(muted);

    eprintln!("Calling LearnBro in {language}. Press Ctrl-C to hang up.");
    bridge.start(language).await;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Hanging up");
        }
        _ = closed_rx.recv() => {}
    }
    let status = bridge.status();
    bridge.stop().await;

    let stats = bridge.stats();
    eprintln!(
        "\nCall ended ({status}): {} frames sent, {} fragments played, {} interruptions",
        stats.frames_sent, stats.fragments_scheduled, stats.interruptions
    );

    match status {
        ConnectionStatus::Error | ConnectionStatus::FailedToConnect => {
            anyhow::bail!("voice call ended with status: {status}")
        }
        _ => Ok(()),
    }
}

fn devices() -> Result<()> {
    let listing = CpalBackend::list_devices()?;
    let mark = |name: &str, default: &Option<String>| {
        if default.as_deref() == Some(name) {
            " (default)"
        } else {
            ""
        }
    };

    println!("Input devices:");
    for name in &listing.inputs {
        println!("  {name}{}", mark(name, &listing.default_input));
    }
    println!("Output devices:");
    for name in &listing.outputs {
        println!("  {name}{}", mark(name, &listing.default_output));
    }
    Ok(())
}

fn show_config(config: &Config, path_only: bool) -> Result<()> {
    if path_only {
        println!("{}", config.config_path.display());
        return Ok(());
    }

    let mut redacted = config.clone();
    if redacted.live.api_key.is_some() {
        redacted.live.api_key = Some("***".to_string());
    }
    println!("# {}", config.config_path.display());
    println!(
        "# api key source: {}",
        config.api_key_source().unwrap_or("missing")
    );
    print!("{}", redacted.to_toml()?);
    Ok(())
}
