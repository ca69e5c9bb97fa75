use std::io::Write;

use crate::error::{PatchError, Result};
use crate::patch_format::SyncOp;

/// Replays COPY/ADD ops for one file against its target bytes.
pub struct FileApplier<'a, W: Write> {
    target: &'a [u8],
    out: W,
    written: u64,
}

impl<'a, W: Write> FileApplier<'a, W> {
    pub fn new(target: &'a [u8], out: W) -> Self {
        Self {
            target,
            out,
            written: 0,
        }
    }

    /// Bytes produced so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn apply_op(&mut self, op: &SyncOp) -> Result<()> {
        match op {
            SyncOp::Copy { offset, length } => {
                let range = offset
                    .checked_add(*length)
                    .filter(|end| *end <= self.target.len() as u64)
                    .map(|end| *offset as usize..end as usize)
                    .ok_or(PatchError::Range {
                        offset: *offset,
                        length: *length,
                        target_size: self.target.len() as u64,
                    })?;
                self.out.write_all(&self.target[range])?;
                self.written += length;
            }
            SyncOp::Add { data } => {
                self.out.write_all(data)?;
                self.written += data.len() as u64;
            }
            SyncOp::HeyYouDidIt => {
                return Err(PatchError::format(
                    "terminator cannot be applied as a file operation",
                ));
            }
        }
        Ok(())
    }

    /// Require exactly `expected` bytes to have been produced for `file_index`.
    pub fn finish_checked(self, file_index: usize, expected: u64) -> Result<W> {
        if self.written != expected {
            return Err(PatchError::Consistency {
                file_index,
                expected,
                actual: self.written,
            });
        }
        Ok(self.out)
    }

    pub fn finish(self) -> W {
        self.out
    }
}

/// Reconstruct a file from its target bytes and an op sequence that must end
/// with [`SyncOp::HeyYouDidIt`].
pub fn apply<I>(target: &[u8], ops: I) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = SyncOp>,
{
    let mut applier = FileApplier::new(target, Vec::new());
    let mut terminated = false;

    for op in ops {
        if terminated {
            return Err(PatchError::format("operation found after the terminator"));
        }
        match op {
            SyncOp::HeyYouDidIt => terminated = true,
            op => applier.apply_op(&op)?,
        }
    }

    if !terminated {
        return Err(PatchError::format(
            "truncated patch: operation stream has no terminator",
        ));
    }

    Ok(applier.finish())
}
