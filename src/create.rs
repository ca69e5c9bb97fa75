use std::io::Write;
use tracing::{debug, info, warn};

use crate::binary_diff::{DiffContext, DiffOptions, DiffStats};
use crate::container::Container;
use crate::error::{PatchError, Result};
use crate::patch_format::{
    BsdiffHeader, CompressionSettings, PatchHeader, SyncHeader, SyncOp, SyncType, PATCH_MAGIC,
};
use crate::progress::Progress;
use crate::wire::WireWriter;

/// Files whose diff is mostly literal bytes get a warning: storing them
/// verbatim would be about as small.
const LITERAL_WARN_RATIO: f64 = 0.9;

#[derive(Debug, Clone, Default)]
pub struct PatchOptions {
    pub compression: CompressionSettings,
    pub diff: DiffOptions,
}

#[derive(Debug, Clone, Default)]
pub struct PatchSummary {
    pub files_diffed: usize,
    pub stats: DiffStats,
}

/// Pick the target file that supplies copy bytes for source file `index`:
/// same path first, then the only target file of a single-file pair, then
/// the largest target file.
fn pair_target(target: &Container, source: &Container, index: usize) -> Result<u32> {
    let path = &source.files[index].path;
    let chosen = target.find_by_path(path).or_else(|| {
        if target.files.len() == 1 && source.files.len() == 1 {
            Some(0)
        } else {
            target
                .files
                .iter()
                .enumerate()
                .max_by(|(ia, a), (ib, b)| a.size.cmp(&b.size).then(ib.cmp(ia)))
                .map(|(i, _)| i)
        }
    });

    let chosen = chosen.ok_or_else(|| {
        PatchError::InvalidContainer(format!(
            "{}: target container has no files to diff against",
            path
        ))
    })?;
    u32::try_from(chosen)
        .map_err(|_| PatchError::InvalidContainer("too many target files".to_string()))
}

/// Write a complete patch that turns `target` into `source`.
///
/// `target_data` and `source_data` are the containers' concatenated bytes.
/// Ops are streamed into `out` as the diff engine produces them. Returns the
/// sink once the final compressed frame has been flushed.
pub fn write_patch<W: Write>(
    out: W,
    target: &Container,
    target_data: &[u8],
    source: &Container,
    source_data: &[u8],
    options: &PatchOptions,
    progress: &mut dyn Progress,
) -> Result<(W, PatchSummary)> {
    target.validate()?;
    source.validate()?;
    check_data_len("target", target, target_data)?;
    check_data_len("source", source, source_data)?;

    let mut raw = WireWriter::new(out);
    raw.write_magic(PATCH_MAGIC)?;
    raw.write_message(&PatchHeader {
        compression: options.compression,
    })?;

    let mut wire = raw.compress(&options.compression)?;
    wire.write_message(target)?;
    wire.write_message(source)?;

    let mut ctx = DiffContext::new(options.diff.clone());
    for index in 0..source.files.len() {
        let target_index = pair_target(target, source, index)?;
        let file_index = u32::try_from(index)
            .map_err(|_| PatchError::InvalidContainer("too many source files".to_string()))?;
        let old = target.file_data(target_data, target_index as usize)?;
        let new = source.file_data(source_data, index)?;

        debug!(
            file_index,
            target_index,
            path = %source.files[index].path,
            old_len = old.len(),
            new_len = new.len(),
            "diffing file"
        );

        wire.write_message(&SyncHeader {
            file_index,
            kind: SyncType::Bsdiff,
        })?;
        wire.write_message(&BsdiffHeader { target_index })?;

        let stats = ctx.diff(old, new, |op| wire.write_message(&op), progress)?;
        if !new.is_empty() && stats.literal_ratio() > LITERAL_WARN_RATIO {
            warn!(
                path = %source.files[index].path,
                added = stats.added_bytes,
                "diff is mostly literal bytes; storing the file verbatim may be cheaper"
            );
        }
    }

    wire.write_message(&SyncOp::HeyYouDidIt)?;
    let out = wire.finish()?;

    info!(
        files = source.files.len(),
        copied = ctx.stats.copied_bytes,
        added = ctx.stats.added_bytes,
        "patch written"
    );

    Ok((
        out,
        PatchSummary {
            files_diffed: source.files.len(),
            stats: ctx.stats,
        },
    ))
}

fn check_data_len(side: &str, container: &Container, data: &[u8]) -> Result<()> {
    if data.len() as u64 != container.size {
        return Err(PatchError::InvalidContainer(format!(
            "{} data is {} bytes but its container records {}",
            side,
            data.len(),
            container.size
        )));
    }
    Ok(())
}
