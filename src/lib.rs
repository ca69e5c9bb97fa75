//! Streaming bsdiff-style binary patches.
//!
//! A patch turns an old *target* container into a new *source* container:
//!
//! - `u32` magic ([`PATCH_MAGIC`])
//! - [`PatchHeader`], uncompressed
//! - compressed from here on:
//!   - target [`Container`], source [`Container`]
//!   - per source file: [`SyncHeader`], [`BsdiffHeader`], then [`SyncOp`]s
//!   - [`SyncOp::HeyYouDidIt`]
//!
//! [`create::write_patch`] produces this stream, [`apply::apply_patch`]
//! consumes it. The per-file engine is [`binary_diff`] with its inverse in
//! [`binary_patch`].

pub mod apply;
pub mod binary_diff;
pub mod binary_patch;
pub mod container;
pub mod create;
pub mod error;
pub mod patch_format;
pub mod progress;
pub mod suffix_array;
pub mod util;
pub mod wire;

pub use apply::{apply_patch, AppliedPatch};
pub use binary_diff::{diff, DiffContext, DiffOptions, DiffStats};
pub use binary_patch::{apply, FileApplier};
pub use container::{Container, FileEntry};
pub use create::{write_patch, PatchOptions, PatchSummary};
pub use error::{PatchError, Result};
pub use patch_format::{
    BsdiffHeader, CompressionAlgorithm, CompressionSettings, PatchHeader, SyncHeader, SyncOp,
    SyncType, PATCH_MAGIC,
};
pub use progress::{NoProgress, Progress};
pub use wire::{Message, MessageKind, WireReader, WireWriter};
