//! updraft - release update server binary.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use updraft_core::ReleaseSigner;
use updraft_core::diff_cache::{DEFAULT_DIFF_TIMEOUT, apply_patch};
use updraft_core::signing::verify_signature;
use updraft_schema::{Sha256Digest, classify};
use updraft_server::{DiffEngineKind, ServerConfig, run_with_shutdown};

/// Release update server with binary patch delivery
#[derive(Parser)]
#[command(name = "updraft")]
#[command(version, about)]
struct Cli {
    /// Log level (overridden by RUST_LOG)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Enable JSON logging
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve update checks and patches
    Serve(ServeArgs),

    /// Generate an Ed25519 release signing key
    Keygen {
        /// Where to write the secret key
        #[arg(short, long, default_value = "updraft.key")]
        output: PathBuf,

        /// Overwrite an existing key file
        #[arg(long)]
        force: bool,
    },

    /// Rebuild a new binary from an old one and a patch, and verify it
    Apply {
        /// Currently installed binary
        old: PathBuf,

        /// Patch downloaded from the server
        patch: PathBuf,

        /// Where to write the rebuilt binary
        #[arg(short, long)]
        output: PathBuf,

        /// Engine that produced the patch (the response's patch_type)
        #[arg(long, value_enum, default_value_t = DiffEngineKind::Bsdiff)]
        engine: DiffEngineKind,

        /// Expected SHA256 of the result
        #[arg(long)]
        checksum: Option<String>,

        /// Base64 signature over the checksum (requires --public-key)
        #[arg(long, requires_all = ["checksum", "public_key"])]
        signature: Option<String>,

        /// Base64 Ed25519 public key
        #[arg(long)]
        public_key: Option<String>,
    },

    /// Show how release asset names are classified
    Classify {
        /// Asset file names
        #[arg(required = true)]
        names: Vec<String>,
    },
}

#[derive(Args)]
struct ServeArgs {
    /// Configuration file (TOML)
    #[arg(short, long, env = "UPDRAFT_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Base URL clients use to reach this server
    #[arg(long)]
    public_url: Option<String>,

    /// GitHub repository as owner/repo
    #[arg(long)]
    repo: Option<String>,

    /// Cache root (assets/ and patches/ live below it)
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// File holding the Base64 signing key
    #[arg(long)]
    signing_key_file: Option<PathBuf>,

    /// Patch engine
    #[arg(long, value_enum)]
    engine: Option<DiffEngineKind>,

    /// Publish pre-releases too
    #[arg(long)]
    include_prereleases: bool,
}

impl ServeArgs {
    fn into_config(self) -> Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path)?,
            None => ServerConfig::default(),
        };
        config.apply_env()?;

        if let Some(listen) = self.listen {
            config.listen_addr = listen;
        }
        if let Some(url) = self.public_url {
            config.public_url = url;
        }
        if let Some(repo) = self.repo {
            let (owner, name) = repo
                .split_once('/')
                .context("--repo must be in owner/repo form")?;
            config.github.owner = owner.to_string();
            config.github.repo = name.to_string();
        }
        if let Some(dir) = self.cache_dir {
            config.cache_dir = Some(dir);
        }
        if let Some(path) = self.signing_key_file {
            config.signing_key_file = Some(path);
            config.signing_key = None;
        }
        if let Some(engine) = self.engine {
            config.engine = engine;
        }
        if self.include_prereleases {
            config.include_prereleases = true;
        }
        Ok(config)
    }
}

fn setup_logging(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if json {
        subscriber
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        subscriber.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}

fn keygen(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", output.display());
    }

    let signer = ReleaseSigner::generate();
    std::fs::write(output, format!("{}\n", signer.secret_base64()))
        .with_context(|| format!("Failed to write {}", output.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(output, std::fs::Permissions::from_mode(0o600))?;
    }

    println!("Secret key written to {}", output.display());
    println!("Public key (embed in clients):");
    println!("{}", signer.public_key_base64());
    Ok(())
}

async fn apply(
    old: &Path,
    patch: &Path,
    output: &Path,
    engine: DiffEngineKind,
    checksum: Option<&str>,
    signature: Option<&str>,
    public_key: Option<&str>,
) -> Result<()> {
    let engine = engine.build(DEFAULT_DIFF_TIMEOUT);
    apply_patch(engine, old, patch, output, DEFAULT_DIFF_TIMEOUT)
        .await
        .with_context(|| format!("Failed to apply {}", patch.display()))?;

    let actual = Sha256Digest::compute_file(output)?;
    if let Some(expected) = checksum {
        let expected = Sha256Digest::new(expected).context("Invalid --checksum")?;
        if actual != expected {
            std::fs::remove_file(output)?;
            anyhow::bail!("Checksum mismatch: expected {expected}, got {actual}");
        }
    }
    if let (Some(sig), Some(key)) = (signature, public_key) {
        if let Err(e) = verify_signature(key, &actual, sig) {
            std::fs::remove_file(output)?;
            return Err(e).context("Signature verification failed");
        }
    }

    println!("{} {}", actual, output.display());
    Ok(())
}

fn classify_names(names: &[String]) {
    for name in names {
        match classify(name) {
            Ok(info) => println!("{name}\t{}\t{}\t{}", info.platform, info.arch, info.version),
            Err(e) => println!("{name}\terror: {e}"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level, cli.json_logs);

    match cli.command {
        Commands::Serve(args) => {
            let config = args.into_config()?;
            run_with_shutdown(config, shutdown_signal()).await
        }
        Commands::Keygen { output, force } => keygen(&output, force),
        Commands::Apply {
            old,
            patch,
            output,
            engine,
            checksum,
            signature,
            public_key,
        } => apply(
            &old,
            &patch,
            &output,
            engine,
            checksum.as_deref(),
            signature.as_deref(),
            public_key.as_deref(),
        )
        .await,
        Commands::Classify { names } => {
            classify_names(&names);
            Ok(())
        }
    }
}
