//! xv: streaming file-encryption pipeline
//!
//! Commands:
//!   watch               - observe a source directory and encrypt every file
//!                         into a mirrored target tree
//!   encrypt <in> <out>… - one-shot encryption of a single file
//!   decrypt <in> <out>… - one-shot decryption of a single envelope
//!
//! The passphrase is read from $XV_PASSWORD or prompted interactively.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use secrecy::{ExposeSecret, SecretString};
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

use xv_core::config::XvConfig;
use xv_core::{Mode, Status};
use xv_crypto::{ByteSink, ByteSource, Decoder, Encoder, MasterKey};
use xv_engine::Engine;
use xv_watch::{DirWatcherTap, WatchOptions};

#[derive(Parser, Debug)]
#[command(name = "xv", version, about = "Streaming AES-CFB file vault")]
struct Cli {
    /// Path to the xv.toml configuration file
    #[arg(long, short = 'c', env = "XV_CONFIG", default_value = "xv.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "XV_LOG", default_value = "info")]
    log: String,

    /// Log format
    #[arg(long, env = "XV_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch a source directory and encrypt its files into a target tree
    Watch {
        /// Source directory (overrides the config file)
        #[arg(long)]
        source: Option<PathBuf>,
        /// Target directory (overrides the config file)
        #[arg(long)]
        target: Option<PathBuf>,
        /// Number of parallel cipher workers (0 = cpu count)
        #[arg(long)]
        parallelism: Option<usize>,
        /// Watcher tick in milliseconds; dispatch debounce is 3x this
        #[arg(long)]
        poll_interval_ms: Option<u64>,
        /// Delete source files after successful encryption
        #[arg(long)]
        delete_completed: bool,
    },

    /// Encrypt one file into one or more outputs
    Encrypt {
        input: PathBuf,
        #[arg(required = true)]
        outputs: Vec<PathBuf>,
    },

    /// Decrypt one envelope into one or more outputs
    Decrypt {
        input: PathBuf,
        #[arg(required = true)]
        outputs: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log, &cli.log_format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "xv starting"
    );

    let config = load_config(&cli.config).await?;

    match cli.command {
        Commands::Watch {
            source,
            target,
            parallelism,
            poll_interval_ms,
            delete_completed,
        } => {
            run_watch(
                config,
                source,
                target,
                parallelism,
                poll_interval_ms,
                delete_completed,
            )
            .await
        }
        Commands::Encrypt { input, outputs } => run_cipher(Mode::Encode, &input, &outputs).await,
        Commands::Decrypt { input, outputs } => run_cipher(Mode::Decode, &input, &outputs).await,
    }
}

async fn run_watch(
    config: XvConfig,
    source: Option<PathBuf>,
    target: Option<PathBuf>,
    parallelism: Option<usize>,
    poll_interval_ms: Option<u64>,
    delete_completed: bool,
) -> Result<()> {
    let passphrase = read_passphrase()?;
    let master = Arc::new(MasterKey::from_password(passphrase.expose_secret())?);

    let options = WatchOptions {
        source: source.unwrap_or(config.watch.source),
        target: target.unwrap_or(config.watch.target),
        poll_interval: Duration::from_millis(
            poll_interval_ms.unwrap_or(config.watch.poll_interval_ms),
        ),
        notify_errors: config.watch.notify_errors,
        report_progress: config.watch.report_progress,
        delete_completed: delete_completed || config.watch.delete_completed,
    };
    let parallelism = match parallelism.unwrap_or(config.engine.parallelism) {
        0 => std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4),
        n => n,
    };

    let mut tap = DirWatcherTap::new(options, master)?;

    let mut consumers = Vec::new();
    if let Some(mut errors) = tap.errors() {
        consumers.push(tokio::spawn(async move {
            while let Some(err) = errors.recv().await {
                error!(error = %err, "watcher error");
            }
        }));
    }
    if let Some(mut progress) = tap.progress() {
        consumers.push(tokio::spawn(async move {
            while let Some(record) = progress.recv().await {
                match record.status {
                    Status::Queued => info!(file = %record.input.name, "encrypting"),
                    status => {
                        if let Some(err) = &record.error {
                            warn!(file = %record.input.name, %status, error = %err, "finished");
                        } else {
                            info!(
                                file = %record.input.name,
                                output = %record.output.name,
                                %status,
                                "finished"
                            );
                        }
                    }
                }
            }
        }));
    }

    let mut engine = Engine::new(parallelism, Box::new(tap));
    engine.start();
    info!(parallelism, "engine running; press Ctrl+C to stop");

    wait_for_shutdown().await?;

    engine.stop().await;
    for consumer in consumers {
        let _ = consumer.await;
    }
    info!("engine stopped");
    Ok(())
}

async fn run_cipher(mode: Mode, input: &PathBuf, outputs: &[PathBuf]) -> Result<()> {
    let passphrase = read_passphrase()?;
    let master = MasterKey::from_password(passphrase.expose_secret())?;

    let file = tokio::fs::File::open(input)
        .await
        .with_context(|| format!("opening {}", input.display()))?;
    let mut source: ByteSource = Box::new(file);

    let mut sinks: Vec<ByteSink> = Vec::with_capacity(outputs.len());
    for path in outputs {
        let file = tokio::fs::File::create(path)
            .await
            .with_context(|| format!("creating {}", path.display()))?;
        sinks.push(Box::new(file));
    }

    let status = match mode {
        Mode::Encode => {
            Encoder::new(0, &master, &mut source, &mut sinks)
                .encode()
                .await?
        }
        Mode::Decode => {
            Decoder::new(0, &master, &mut source, &mut sinks)
                .decode()
                .await?
        }
    };
    for mut sink in sinks {
        sink.shutdown().await?;
    }

    info!(input = %input.display(), %status, "finished");
    Ok(())
}

fn read_passphrase() -> Result<SecretString> {
    if let Ok(pass) = std::env::var("XV_PASSWORD") {
        return Ok(SecretString::from(pass));
    }
    let pass =
        rpassword::prompt_password("Master passphrase: ").context("failed to read passphrase")?;
    Ok(SecretString::from(pass))
}

async fn wait_for_shutdown() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).context("registering SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("registering SIGINT handler")?;
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }
    Ok(())
}

async fn load_config(path: &PathBuf) -> Result<XvConfig> {
    if path.exists() {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| anyhow::anyhow!("reading config {}: {e}", path.display()))?;
        toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("parsing config {}: {e}", path.display()))
    } else {
        Ok(XvConfig::default())
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
        }
    }
}
