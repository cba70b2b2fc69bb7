//! Exports the first-frame and the temporal decoder head as static graphs.

use anyhow::{Context as _, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use sparse4d_head::config::{ExportConfig, HeadConfig};
use sparse4d_head::export::{export, ExportOptions};

#[derive(Parser)]
#[command(
    name = "export-head",
    version,
    about = "Export the Sparse4D decoder heads as static graphs",
    after_help = "EXAMPLES:\n  \
                  export-head --cfg head.json\n  \
                  export-head --cfg head.json --osec --save-second head2.json\n  \
                  export-head --batch-size 2 --verify --verbose"
)]
struct Cli {
    /// Head config (JSON); defaults to the built-in Sparse4Dv3 layout
    #[arg(long)]
    cfg: Option<PathBuf>,

    /// Output path of the first-frame head
    #[arg(long, default_value = "deploy/graphs/sparse4dhead1st_frame.json")]
    save_first: PathBuf,

    /// Output path of the temporal head
    #[arg(long, default_value = "deploy/graphs/sparse4dhead2nd.json")]
    save_second: PathBuf,

    /// Only export the temporal head
    #[arg(long)]
    osec: bool,

    #[arg(long, default_value_t = 1)]
    batch_size: usize,

    #[arg(long, default_value_t = 6)]
    num_cams: usize,

    #[arg(long, default_value_t = 256)]
    input_h: usize,

    #[arg(long, default_value_t = 704)]
    input_w: usize,

    /// Seed of the dummy inputs
    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Replay the exported graphs against the eager head
    #[arg(long)]
    verify: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    let head_config = match &cli.cfg {
        Some(path) => HeadConfig::from_file(path)
            .with_context(|| format!("Failed to load head config {}", path.display()))?,
        None => HeadConfig::default(),
    };
    let export_config = ExportConfig {
        batch_size: cli.batch_size,
        num_cams: cli.num_cams,
        input_h: cli.input_h,
        input_w: cli.input_w,
        seed: cli.seed,
        ..ExportConfig::default()
    };
    let options = ExportOptions {
        save_first: cli.save_first,
        save_second: cli.save_second,
        only_second: cli.osec,
        verify: cli.verify,
    };

    let report = export(&head_config, &export_config, &options).context("Export failed")?;

    for graph in report.first.iter().chain(Some(&report.second)) {
        info!(
            path = %graph.path.display(),
            nodes = graph.nodes,
            constants = graph.constants,
            folded = graph.stats.folded,
            removed = graph.stats.removed,
            max_abs_diff = ?graph.max_abs_diff,
            "graph written"
        );
    }

    Ok(())
}
