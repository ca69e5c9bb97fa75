use rayon::prelude::*;
use std::ops::Range;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::error::Result;
use crate::patch_format::{SyncOp, MAX_ADD_LEN};
use crate::progress::Progress;
use crate::suffix_array::{match_len, SuffixArray};

/// Shortest match worth a COPY op, unless it runs to the end of the source.
pub const DEFAULT_MIN_MATCH: usize = 8;

/// Source bytes scanned between two progress reports.
const PROGRESS_STEP: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffOptions {
    /// Number of contiguous target segments indexed separately. Matches never
    /// span two partitions.
    pub partitions: usize,
    /// Worker threads used to build the partitions' suffix arrays.
    pub suffix_sort_concurrency: usize,
    pub min_match: usize,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            partitions: 1,
            suffix_sort_concurrency: 1,
            min_match: DEFAULT_MIN_MATCH,
        }
    }
}

/// Diagnostics gathered while diffing. Nothing here influences the output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffStats {
    pub time_spent_sorting: Duration,
    pub time_spent_scanning: Duration,
    pub copy_ops: u64,
    pub add_ops: u64,
    pub copied_bytes: u64,
    pub added_bytes: u64,
}

impl DiffStats {
    /// Fraction of the source that was stored as literal bytes.
    pub fn literal_ratio(&self) -> f64 {
        let total = self.copied_bytes + self.added_bytes;
        if total == 0 {
            0.0
        } else {
            self.added_bytes as f64 / total as f64
        }
    }

    pub fn merge(&mut self, other: &DiffStats) {
        self.time_spent_sorting += other.time_spent_sorting;
        self.time_spent_scanning += other.time_spent_scanning;
        self.copy_ops += other.copy_ops;
        self.add_ops += other.add_ops;
        self.copied_bytes += other.copied_bytes;
        self.added_bytes += other.added_bytes;
    }
}

/// Suffix-array diff engine. Keeps running stats across every file it diffs.
#[derive(Debug, Clone, Default)]
pub struct DiffContext {
    pub options: DiffOptions,
    pub stats: DiffStats,
}

struct Partition<'a> {
    start: usize,
    data: &'a [u8],
    index: SuffixArray,
}

impl DiffContext {
    pub fn new(options: DiffOptions) -> Self {
        Self {
            options,
            stats: DiffStats::default(),
        }
    }

    /// Compute ops that rebuild `source` from `target` and hand them to
    /// `emit` one at a time, in output order.
    ///
    /// Stops at the first error returned by `emit`.
    pub fn diff<E>(
        &mut self,
        target: &[u8],
        source: &[u8],
        mut emit: E,
        progress: &mut dyn Progress,
    ) -> Result<DiffStats>
    where
        E: FnMut(SyncOp) -> Result<()>,
    {
        let mut stats = DiffStats::default();

        let sort_start = Instant::now();
        let partitions = self.sort_partitions(target)?;
        stats.time_spent_sorting = sort_start.elapsed();
        debug!(
            partitions = partitions.len(),
            target_len = target.len(),
            elapsed = ?stats.time_spent_sorting,
            "suffix arrays ready"
        );

        let scan_start = Instant::now();
        progress.start("scanning");
        {
            let mut out = OpEmitter {
                emit: &mut emit,
                pending_copy: None,
                stats: &mut stats,
            };
            scan(
                &partitions,
                source,
                self.options.min_match.max(1),
                &mut out,
                progress,
            )?;
            out.flush()?;
        }
        progress.end();
        stats.time_spent_scanning = scan_start.elapsed();

        debug!(
            source_len = source.len(),
            copy_ops = stats.copy_ops,
            add_ops = stats.add_ops,
            added_bytes = stats.added_bytes,
            elapsed = ?stats.time_spent_scanning,
            "scan finished"
        );

        self.stats.merge(&stats);
        Ok(stats)
    }

    /// Split the target and sort every partition on a dedicated pool.
    /// Results come back in partition order; the first failure wins.
    fn sort_partitions<'a>(&self, target: &'a [u8]) -> Result<Vec<Partition<'a>>> {
        let bounds = partition_bounds(target.len(), self.options.partitions);
        if bounds.is_empty() {
            return Ok(Vec::new());
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.options.suffix_sort_concurrency.max(1))
            .build()?;

        pool.install(|| {
            bounds
                .par_iter()
                .map(|range| -> Result<Partition<'a>> {
                    let data = &target[range.clone()];
                    Ok(Partition {
                        start: range.start,
                        data,
                        index: SuffixArray::new(data)?,
                    })
                })
                .collect::<Result<Vec<_>>>()
        })
    }
}

/// Diff `target` against `source` with a fresh context and no progress reporting.
pub fn diff<E>(target: &[u8], source: &[u8], emit: E, options: &DiffOptions) -> Result<DiffStats>
where
    E: FnMut(SyncOp) -> Result<()>,
{
    let mut ctx = DiffContext::new(options.clone());
    ctx.diff(target, source, emit, &mut crate::progress::NoProgress)
}

/// Split `len` bytes into at most `partitions` contiguous ranges. The last
/// range takes the remainder.
pub fn partition_bounds(len: usize, partitions: usize) -> Vec<Range<usize>> {
    if len == 0 {
        return Vec::new();
    }
    let count = partitions.clamp(1, len);
    let chunk = len / count;
    (0..count)
        .map(|i| {
            let start = i * chunk;
            let end = if i + 1 == count { len } else { start + chunk };
            start..end
        })
        .collect()
}

/// Walk the source left to right, emitting a COPY for every useful match and
/// an ADD for the bytes in between.
fn scan<E>(
    partitions: &[Partition<'_>],
    source: &[u8],
    min_match: usize,
    out: &mut OpEmitter<'_, E>,
    progress: &mut dyn Progress,
) -> Result<()>
where
    E: FnMut(SyncOp) -> Result<()>,
{
    let total = source.len() as u64;
    let mut pos = 0usize;
    let mut literal_start = 0usize;
    let mut last_copy_end: Option<usize> = None;
    let mut next_report = PROGRESS_STEP;

    while pos < source.len() {
        let needle = &source[pos..];
        let found = best_match(partitions, needle, last_copy_end)
            .filter(|&(_, len)| len >= min_match || len == needle.len());

        match found {
            Some((offset, len)) => {
                out.add(&source[literal_start..pos])?;
                out.copy(offset as u64, len as u64)?;
                pos += len;
                literal_start = pos;
                last_copy_end = Some(offset + len);
            }
            None => pos += 1,
        }

        if pos >= next_report {
            progress.progress(pos as u64, total);
            next_report = pos + PROGRESS_STEP;
        }
    }

    out.add(&source[literal_start..])?;
    progress.progress(total, total);
    Ok(())
}

/// Longest match for `needle` over all partitions as `(target_offset, len)`.
///
/// Continuing the previous copy wins ties, then lower partitions.
fn best_match(
    partitions: &[Partition<'_>],
    needle: &[u8],
    last_copy_end: Option<usize>,
) -> Option<(usize, usize)> {
    let mut best: Option<(usize, usize)> = None;

    if let Some(end) = last_copy_end {
        let idx = partitions.partition_point(|p| p.start + p.data.len() <= end);
        if let Some(p) = partitions.get(idx) {
            let len = match_len(&p.data[end - p.start..], needle);
            if len > 0 {
                best = Some((end, len));
            }
        }
    }

    for p in partitions {
        let (pos, len) = p.index.longest_match(p.data, needle);
        if len > best.map_or(0, |(_, l)| l) {
            best = Some((p.start + pos, len));
        }
    }

    best
}

/// Coalesces adjacent copies, chunks long literals and keeps op counts.
struct OpEmitter<'a, E> {
    emit: &'a mut E,
    pending_copy: Option<(u64, u64)>,
    stats: &'a mut DiffStats,
}

impl<E> OpEmitter<'_, E>
where
    E: FnMut(SyncOp) -> Result<()>,
{
    fn copy(&mut self, offset: u64, length: u64) -> Result<()> {
        if let Some((pending_offset, pending_len)) = self.pending_copy.as_mut() {
            if *pending_offset + *pending_len == offset {
                *pending_len += length;
                return Ok(());
            }
        }
        self.flush()?;
        self.pending_copy = Some((offset, length));
        Ok(())
    }

    fn add(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.flush()?;
        for chunk in data.chunks(MAX_ADD_LEN) {
            trace!(len = chunk.len(), "add");
            self.stats.add_ops += 1;
            self.stats.added_bytes += chunk.len() as u64;
            (self.emit)(SyncOp::Add {
                data: chunk.to_vec(),
            })?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if let Some((offset, length)) = self.pending_copy.take() {
            trace!(offset, length, "copy");
            self.stats.copy_ops += 1;
            self.stats.copied_bytes += length;
            (self.emit)(SyncOp::Copy { offset, length })?;
        }
        Ok(())
    }
}
