use std::io::BufRead;
use tracing::{debug, info};

use crate::binary_patch::FileApplier;
use crate::container::Container;
use crate::error::{PatchError, Result};
use crate::patch_format::{BsdiffHeader, PatchHeader, SyncHeader, SyncOp, SyncType, PATCH_MAGIC};
use crate::progress::Progress;
use crate::wire::{Message, WireReader};

/// Cap on the up-front output allocation; the rest grows as files are rebuilt.
const MAX_PREALLOC: u64 = 64 * 1024 * 1024;

/// Result of applying a patch: both containers plus the rebuilt source bytes,
/// laid out as the source container describes.
#[derive(Debug, Clone)]
pub struct AppliedPatch {
    pub header: PatchHeader,
    pub target: Container,
    pub source: Container,
    pub data: Vec<u8>,
}

impl AppliedPatch {
    /// Bytes of rebuilt source file `index`.
    pub fn file_data(&self, index: usize) -> Result<&[u8]> {
        self.source.file_data(&self.data, index)
    }
}

/// Read a patch from `patch` and rebuild the source container from
/// `target_data` (the target container's concatenated bytes).
///
/// Nothing is returned unless the whole patch is structurally valid and every
/// file comes out at its recorded size.
pub fn apply_patch<R: BufRead>(
    patch: R,
    target_data: &[u8],
    progress: &mut dyn Progress,
) -> Result<AppliedPatch> {
    let mut raw = WireReader::new(patch);
    raw.read_magic(PATCH_MAGIC)?;
    let header: PatchHeader = raw.expect()?;
    debug!(compression = ?header.compression, "read patch header");

    let mut wire = raw.decompress(&header.compression)?;
    let target: Container = wire.expect()?;
    let source: Container = wire.expect()?;
    target
        .validate()
        .map_err(|e| PatchError::format(format!("target container: {}", e)))?;
    source
        .validate()
        .map_err(|e| PatchError::format(format!("source container: {}", e)))?;

    if target_data.len() as u64 != target.size {
        return Err(PatchError::InvalidContainer(format!(
            "target data is {} bytes but the patch expects {}",
            target_data.len(),
            target.size
        )));
    }

    let mut data = Vec::with_capacity(source.size.min(MAX_PREALLOC) as usize);
    let mut next_file = 0usize;

    progress.start("applying");
    let mut msg = wire.read_message()?;
    loop {
        msg = match msg {
            Message::SyncOp(SyncOp::HeyYouDidIt) => break,
            Message::SyncHeader(sync) => {
                check_sync_header(&sync, next_file, &source)?;
                let bsdiff: BsdiffHeader = wire.expect()?;
                let next = apply_file_group(
                    &mut wire,
                    &sync,
                    &bsdiff,
                    &target,
                    target_data,
                    &source,
                    &mut data,
                )?;
                next_file += 1;
                progress.progress(data.len() as u64, source.size);
                next
            }
            other => {
                return Err(PatchError::format(format!(
                    "expected sync header or terminator, found {}",
                    other.kind()
                )));
            }
        };
    }
    progress.end();

    if next_file != source.files.len() {
        return Err(PatchError::format(format!(
            "patch covers {} of {} source files",
            next_file,
            source.files.len()
        )));
    }
    if !wire.at_eof()? {
        return Err(PatchError::format("trailing data after the terminator"));
    }

    info!(
        files = source.files.len(),
        bytes = data.len(),
        "patch applied"
    );

    Ok(AppliedPatch {
        header,
        target,
        source,
        data,
    })
}

fn check_sync_header(sync: &SyncHeader, next_file: usize, source: &Container) -> Result<()> {
    let index = sync.file_index as usize;
    if index >= source.files.len() {
        return Err(PatchError::format(format!(
            "sync header references file {} but the source container has {} files",
            index,
            source.files.len()
        )));
    }
    if index != next_file {
        return Err(PatchError::format(format!(
            "sync header for file {} out of order, expected file {}",
            index, next_file
        )));
    }
    if sync.kind != SyncType::Bsdiff {
        return Err(PatchError::format(format!(
            "unsupported sync type {:?} for file {}",
            sync.kind, index
        )));
    }
    Ok(())
}

/// Apply one file's ops, returning the message that ended the group.
fn apply_file_group<R: BufRead>(
    wire: &mut WireReader<R>,
    sync: &SyncHeader,
    bsdiff: &BsdiffHeader,
    target: &Container,
    target_data: &[u8],
    source: &Container,
    out: &mut Vec<u8>,
) -> Result<Message> {
    let file_index = sync.file_index as usize;
    let target_index = bsdiff.target_index as usize;
    if target_index >= target.files.len() {
        return Err(PatchError::format(format!(
            "bsdiff header references target file {} but the target container has {} files",
            target_index,
            target.files.len()
        )));
    }

    let old = target.file_data(target_data, target_index)?;
    let expected = source.files[file_index].size;
    debug!(file_index, target_index, expected, "applying file");

    let mut applier = FileApplier::new(old, &mut *out);
    loop {
        match wire.read_message()? {
            Message::SyncOp(SyncOp::HeyYouDidIt) => {
                applier.finish_checked(file_index, expected)?;
                return Ok(Message::SyncOp(SyncOp::HeyYouDidIt));
            }
            Message::SyncOp(op) => {
                applier.apply_op(&op)?;
                if applier.written() > expected {
                    return Err(PatchError::Consistency {
                        file_index,
                        expected,
                        actual: applier.written(),
                    });
                }
            }
            next @ Message::SyncHeader(_) => {
                applier.finish_checked(file_index, expected)?;
                return Ok(next);
            }
            other => {
                return Err(PatchError::format(format!(
                    "unexpected {} inside the ops of file {}",
                    other.kind(),
                    file_index
                )));
            }
        }
    }
}
