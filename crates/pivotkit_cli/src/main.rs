//! `pivotkit` command line: build a pivot report from a config file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::Parser;
use pivotkit_report::{
    EnumReportSource, LogProgressSink, WorkbookModelFactory, load_report_config,
    resolve_source_file, run_report,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "pivotkit")]
#[command(about = "Build pivot-table workbooks from a YAML or JSON report config")]
struct Args {
    /// Report config (.yaml, .yml or .json)
    #[arg(long, short = 'c')]
    config: PathBuf,

    /// Source data file or base name; overrides `outer_file` from the config
    #[arg(long, short = 'd')]
    data: Option<PathBuf>,

    /// Output directory; overrides `file_path`
    #[arg(long, short = 'o')]
    out_dir: Option<PathBuf>,

    /// Output file name without extension; overrides `file_name`
    #[arg(long, short = 'n')]
    name: Option<String>,

    /// Backend acquisition attempts; overrides `retry.attempts_max`
    #[arg(long)]
    max_attempts: Option<usize>,
}

/// Relative `outer_file` entries resolve against the config file's directory.
fn derive_outer_file(path_config: &Path, outer_file: &Path) -> PathBuf {
    if outer_file.is_absolute() {
        return outer_file.to_path_buf();
    }
    path_config
        .parent()
        .map(|dir| dir.join(outer_file))
        .unwrap_or_else(|| outer_file.to_path_buf())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = load_report_config(&args.config)
        .with_context(|| format!("loading config {}", args.config.display()))?;
    if let Some(out_dir) = args.out_dir {
        config.file_path = out_dir;
    }
    if let Some(name) = args.name {
        config.file_name = name;
    }
    if let Some(n_attempts) = args.max_attempts {
        config.retry.attempts_max = n_attempts;
    }

    let path_data = match (args.data, &config.outer_file) {
        (Some(data), _) => data,
        (None, Some(outer_file)) => derive_outer_file(&args.config, outer_file),
        (None, None) => bail!("no data source: pass --data or set `outer_file` in the config"),
    };
    let path_data = resolve_source_file(&path_data)
        .with_context(|| format!("locating data source {}", path_data.display()))?;
    tracing::info!(
        data = %path_data.display(),
        n_pivots = config.pivots.len(),
        "building report"
    );

    let outcome = run_report(
        &WorkbookModelFactory::new(),
        &config,
        &EnumReportSource::ExternalFile(path_data),
        Some(&LogProgressSink),
    )
    .context("report run failed")?;
    print!("{outcome}");
    Ok(())
}
