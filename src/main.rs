use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;

use patchwire::util::{self, format_bytes};
use patchwire::{
    CompressionAlgorithm, CompressionSettings, Container, DiffOptions, PatchOptions, Progress,
};

#[derive(Parser)]
#[command(name = "patchwire", about = "Streaming binary patch generator and applier")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a patch between two files with the suffix-array diff
    Diff {
        /// Old file (relative path)
        old: PathBuf,
        /// New file (relative path)
        new: PathBuf,
        /// Patch file to write
        #[arg(long, short)]
        output: PathBuf,
        /// Number of partitions to split the old file into
        #[arg(long, default_value_t = 1)]
        partitions: usize,
        /// Suffix sort concurrency
        #[arg(long, default_value_t = 1)]
        concurrency: usize,
        #[arg(long, value_enum, default_value_t = Codec::Brotli)]
        compression: Codec,
        #[arg(long, default_value_t = 1)]
        quality: i32,
    },
    /// Rebuild the new file from the old file and a patch
    Apply {
        /// Old file the patch was generated against
        old: PathBuf,
        /// Path to the patch file
        #[arg(long, short)]
        patch: PathBuf,
        /// Where to write the rebuilt file
        #[arg(long, short)]
        output: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Codec {
    None,
    Brotli,
    Zstd,
}

impl From<Codec> for CompressionAlgorithm {
    fn from(codec: Codec) -> Self {
        match codec {
            Codec::None => CompressionAlgorithm::None,
            Codec::Brotli => CompressionAlgorithm::Brotli,
            Codec::Zstd => CompressionAlgorithm::Zstd,
        }
    }
}

/// Logs every tenth of the way through a stage.
struct LogProgress {
    label: String,
    last_tenth: u64,
}

impl LogProgress {
    fn new() -> Self {
        Self {
            label: String::new(),
            last_tenth: 0,
        }
    }
}

impl Progress for LogProgress {
    fn start(&mut self, label: &str) {
        self.label = label.to_string();
        self.last_tenth = 0;
    }

    fn progress(&mut self, done: u64, total: u64) {
        if total == 0 {
            return;
        }
        let tenth = done.saturating_mul(10) / total;
        if tenth > self.last_tenth {
            self.last_tenth = tenth;
            info!("{} {}%", self.label, tenth * 10);
        }
    }
}

fn relative_path_string(path: &Path) -> Result<String> {
    if path.is_absolute() {
        bail!("{}: diff only works with relative paths", path.display());
    }
    let s = path
        .to_str()
        .with_context(|| format!("Non-UTF8 path: {}", path.display()))?;
    Ok(s.replace('\\', "/"))
}

fn run_diff(
    old: &Path,
    new: &Path,
    output: &Path,
    options: PatchOptions,
) -> Result<()> {
    let old_name = relative_path_string(old)?;
    let new_name = relative_path_string(new)?;

    let old_data = util::mmap_file(old)?;
    let new_data = util::mmap_file(new)?;

    let target = Container::single_file(old_name, old_data.len() as u64);
    let source = Container::single_file(new_name, new_data.len() as u64);
    info!("Before: {} ({})", format_bytes(target.size), target.stats());
    info!(" After: {} ({})", format_bytes(source.size), source.stats());
    info!(
        "Suffix sort concurrency: {}, partitions: {}",
        options.diff.suffix_sort_concurrency, options.diff.partitions
    );

    let file = std::fs::File::create(output)
        .with_context(|| format!("Failed to create output file: {}", output.display()))?;

    let start = Instant::now();
    let (file, summary) = patchwire::write_patch(
        file,
        &target,
        &old_data,
        &source,
        &new_data,
        &options,
        &mut LogProgress::new(),
    )
    .with_context(|| format!("Failed to write patch: {}", output.display()))?;
    file.sync_all().context("Failed to sync patch file")?;
    let elapsed = start.elapsed();

    let patch_size = std::fs::metadata(output)
        .with_context(|| format!("Failed to stat patch file: {}", output.display()))?
        .len();
    let per_sec = patch_size as f64 / elapsed.as_secs_f64().max(f64::EPSILON);

    info!(
        "Wrote {} patch to {} @ {} / s ({:.3}s total)",
        format_bytes(patch_size),
        output.display(),
        format_bytes(per_sec as u64),
        elapsed.as_secs_f64()
    );
    info!("Spent {:?} scanning", summary.stats.time_spent_scanning);
    info!("Spent {:?} sorting", summary.stats.time_spent_sorting);
    Ok(())
}

fn run_apply(old: &Path, patch: &Path, output: &Path) -> Result<()> {
    let old_data = util::mmap_file(old)?;
    let patch_file = std::fs::File::open(patch)
        .with_context(|| format!("Failed to open patch: {}", patch.display()))?;
    let reader = BufReader::with_capacity(256 * 1024, patch_file);

    let start = Instant::now();
    let applied = patchwire::apply_patch(reader, &old_data, &mut LogProgress::new())
        .with_context(|| format!("Failed to apply patch: {}", patch.display()))?;

    if applied.source.files.len() != 1 {
        bail!(
            "Patch rebuilds {} files; apply only handles single-file patches",
            applied.source.files.len()
        );
    }

    let mut out = std::fs::File::create(output)
        .with_context(|| format!("Failed to create output file: {}", output.display()))?;
    out.write_all(applied.file_data(0)?)
        .with_context(|| format!("Failed to write output file: {}", output.display()))?;
    out.flush()?;

    info!(
        "Rebuilt {} ({}) in {:.3}s",
        output.display(),
        format_bytes(applied.source.size),
        start.elapsed().as_secs_f64()
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Diff {
            old,
            new,
            output,
            partitions,
            concurrency,
            compression,
            quality,
        } => {
            let options = PatchOptions {
                compression: CompressionSettings {
                    algorithm: compression.into(),
                    quality,
                },
                diff: DiffOptions {
                    partitions,
                    suffix_sort_concurrency: concurrency,
                    ..DiffOptions::default()
                },
            };
            tokio::task::spawn_blocking(move || run_diff(&old, &new, &output, options)).await??;
        }
        Commands::Apply { old, patch, output } => {
            tokio::task::spawn_blocking(move || run_apply(&old, &patch, &output)).await??;
        }
    }

    Ok(())
}
