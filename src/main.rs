//! `hlsrelay` CLI - run the relay, or exercise its pieces one-shot

use std::io::Read;
use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use hlsrelay::server::{self, AppState};
use hlsrelay::{rewrite, Config};

#[derive(Parser)]
#[command(name = "hlsrelay")]
#[command(about = "Resolve HLS manifests with a headless browser and proxy them")]
#[command(version)]
struct Cli {
    /// Config file (default: ~/.config/hlsrelay/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// Address to bind
    #[arg(long, global = true)]
    bind: Option<IpAddr>,

    /// Chrome/Chromium executable
    #[arg(long, global = true)]
    chrome: Option<PathBuf>,

    /// Public origin written into rewritten playlists
    #[arg(long, global = true)]
    public_url: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server (default)
    Serve,

    /// Resolve one code and print its manifest URL
    Resolve {
        /// Content code
        code: String,
    },

    /// Rewrite a playlist offline
    Rewrite {
        /// URL the playlist was fetched from
        #[arg(long)]
        base: String,

        /// Proxy origin to route references through
        #[arg(long)]
        origin: String,

        /// Playlist file (reads stdin when omitted)
        file: Option<PathBuf>,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hlsrelay=info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let cli = Cli::parse();
    let config = effective_config(&cli)?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => server::serve(&config).await?,
        Commands::Resolve { code } => cmd_resolve(&config, &code).await?,
        Commands::Rewrite { base, origin, file } => cmd_rewrite(&base, &origin, file)?,
        Commands::Config => print!("{}", toml::to_string_pretty(&config)?),
    }

    Ok(())
}

/// Load the config file, then apply command-line overrides.
fn effective_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(bind) = cli.bind {
        config.server.bind = bind.to_string();
    }
    if let Some(chrome) = &cli.chrome {
        config.browser.executable = Some(chrome.clone());
    }
    if let Some(public_url) = &cli.public_url {
        config.server.public_url = Some(public_url.clone());
    }
    config.validate()?;
    Ok(config)
}

async fn cmd_resolve(config: &Config, code: &str) -> Result<()> {
    let state = AppState::from_config(config)?;
    let outcome = state.resolver.resolve(code).await;
    state.resolver.sessions().shutdown().await;
    let url = outcome.with_context(|| format!("failed to resolve '{code}'"))?;
    println!("{url}");
    Ok(())
}

fn cmd_rewrite(base: &str, origin: &str, file: Option<PathBuf>) -> Result<()> {
    let playlist = match file {
        Some(path) => std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("failed to read stdin")?;
            buf
        }
    };
    url::Url::parse(base).with_context(|| format!("invalid --base URL '{base}'"))?;
    print!("{}", rewrite(&playlist, base, origin));
    Ok(())
}
