//! `pageocr` CLI - run the OCR overlay pipeline against live pages

mod cmd;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "pageocr")]
#[command(about = "Find images on a page, OCR and translate them, and save the overlays")]
#[command(version)]
struct Cli {
    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process every qualifying image on a page
    Run {
        /// Page URL
        url: String,

        /// Translation target language (overrides the config file)
        #[arg(short, long)]
        lang: Option<String>,

        /// Directory for translated images
        #[arg(short, long, default_value = "pageocr-out")]
        out: PathBuf,

        /// OCR server base URL (overrides the config file)
        #[arg(short, long)]
        endpoint: Option<String>,
    },

    /// Fetch one image the way the background would
    Fetch {
        /// Image URL
        url: String,

        /// Page the image was found on
        #[arg(short, long)]
        referer: Option<String>,

        /// Save the image bytes here
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Check that the OCR server is up
    Health {
        /// OCR server base URL (overrides the config file)
        #[arg(short, long)]
        endpoint: Option<String>,
    },

    /// Show the config file location and effective settings
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "pageocr=debug" } else { "pageocr=info" };
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    match cli.command {
        Commands::Run {
            url,
            lang,
            out,
            endpoint,
        } => {
            cmd::run::cmd_run(&url, lang, &out, endpoint).await?;
        }
        Commands::Fetch { url, referer, out } => {
            cmd::fetch::cmd_fetch(&url, referer.as_deref(), out).await?;
        }
        Commands::Health { endpoint } => {
            cmd::health::cmd_health(endpoint).await?;
        }
        Commands::Config => {
            cmd::config::cmd_config()?;
        }
    }

    Ok(())
}
