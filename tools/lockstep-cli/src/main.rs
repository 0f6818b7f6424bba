//! Lockstep CLI: inspect, preview, render, and export compositions.
//!
//! Usage:
//!   lockstep init <PATH>                     Write a sample composition document
//!   lockstep info <PATH>                     Show composition information
//!   lockstep active <PATH> --time <SECS>     List layers drawn at a time
//!   lockstep render-frame <PATH> ...         Render one frame to a PNG
//!   lockstep play <PATH> --secs <SECS>       Run live playback headless
//!   lockstep export <PATH> --output <FILE>   Export the composition
//!   lockstep check                           Check system capabilities

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use tracing::Instrument;

use lockstep_common::{AppConfig, ExportFormat, LoggingConfig};

mod commands;

#[derive(Parser)]
#[command(
    name = "lockstep",
    about = "Frame-accurate layered video compositing",
    version,
    author
)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Config file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum FormatArg {
    Webm,
    Mp4,
    Png,
}

impl From<FormatArg> for ExportFormat {
    fn from(format: FormatArg) -> Self {
        match format {
            FormatArg::Webm => ExportFormat::WebmVp9,
            FormatArg::Mp4 => ExportFormat::Mp4H264,
            FormatArg::Png => ExportFormat::PngSequence,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Write the six-layer sample composition document
    Init {
        /// Where to write the document
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Show composition information
    Info {
        /// Path to the composition document
        path: PathBuf,
    },

    /// List the layers drawn at a composition time
    Active {
        /// Path to the composition document
        path: PathBuf,

        /// Composition time (seconds)
        #[arg(short, long)]
        time: f64,
    },

    /// Render a single composite frame to a PNG
    RenderFrame {
        /// Path to the composition document
        path: PathBuf,

        /// Composition time (seconds)
        #[arg(short, long)]
        time: f64,

        /// Output PNG path
        #[arg(short, long)]
        output: PathBuf,

        /// Output width (defaults to the configured compositor width)
        #[arg(long)]
        width: Option<u32>,

        /// Output height (defaults to the configured compositor height)
        #[arg(long)]
        height: Option<u32>,
    },

    /// Run live playback without a display and report drift corrections
    Play {
        /// Path to the composition document
        path: PathBuf,

        /// How long to play (seconds)
        #[arg(long, default_value = "5.0")]
        secs: f64,
    },

    /// Export the composition frame by frame
    Export {
        /// Path to the composition document
        path: PathBuf,

        /// Output file (or directory for png)
        #[arg(short, long)]
        output: PathBuf,

        /// Output format (defaults to the configured format)
        #[arg(long, value_enum)]
        format: Option<FormatArg>,

        /// Output width
        #[arg(long)]
        width: Option<u32>,

        /// Output height
        #[arg(long)]
        height: Option<u32>,
    },

    /// Check system capabilities
    Check,
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Init { .. } => "init",
            Commands::Info { .. } => "info",
            Commands::Active { .. } => "active",
            Commands::RenderFrame { .. } => "render-frame",
            Commands::Play { .. } => "play",
            Commands::Export { .. } => "export",
            Commands::Check => "check",
        }
    }

    fn document(&self) -> Option<&Path> {
        match self {
            Commands::Init { path, .. }
            | Commands::Info { path }
            | Commands::Active { path, .. }
            | Commands::RenderFrame { path, .. }
            | Commands::Play { path, .. }
            | Commands::Export { path, .. } => Some(path),
            Commands::Check => None,
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<AppConfig> {
    let config = match path {
        Some(path) => AppConfig::load_from(path)
            .map_err(|e| anyhow::anyhow!("Failed to load config {}: {e}", path.display()))?,
        None => AppConfig::load(),
    };
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid config: {e}"))?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.clone()
    };
    lockstep_common::logging::init_logging(&LoggingConfig {
        level,
        json: cli.json_logs || config.logging.json,
    });

    let session = lockstep_common::logging::session_span(
        cli.command.name(),
        cli.command.document(),
    );
    dispatch(&config, cli.command).instrument(session).await
}

async fn dispatch(config: &AppConfig, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Init { path, force } => commands::init::run(path, force),
        Commands::Info { path } => commands::info::run(path).await,
        Commands::Active { path, time } => commands::active::run(path, time).await,
        Commands::RenderFrame {
            path,
            time,
            output,
            width,
            height,
        } => commands::render_frame::run(config, path, time, output, width, height).await,
        Commands::Play { path, secs } => commands::play::run(config, path, secs).await,
        Commands::Export {
            path,
            output,
            format,
            width,
            height,
        } => {
            commands::export::run(config, path, output, format.map(Into::into), width, height)
                .await
        }
        Commands::Check => commands::check::run(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_covers_document_commands() {
        let cli = Cli::try_parse_from(["lockstep", "export", "demo/c.json", "-o", "out.webm"])
            .unwrap();
        assert_eq!(cli.command.name(), "export");
        assert_eq!(cli.command.document(), Some(Path::new("demo/c.json")));

        let cli = Cli::try_parse_from(["lockstep", "check"]).unwrap();
        assert_eq!(cli.command.name(), "check");
        assert!(cli.command.document().is_none());
    }
}
