use serde::{Deserialize, Serialize};

/// First four bytes of every patch, little-endian.
pub const PATCH_MAGIC: u32 = 0x0FEF_5F00;

/// Upper bound on a single framed message payload. Anything larger is treated
/// as a corrupt length prefix.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Literal runs longer than this are split over several ADD ops.
pub const MAX_ADD_LEN: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionAlgorithm {
    None,
    Brotli,
    Zstd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionSettings {
    pub algorithm: CompressionAlgorithm,
    pub quality: i32,
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self {
            algorithm: CompressionAlgorithm::Brotli,
            quality: 1,
        }
    }
}

impl CompressionSettings {
    pub fn none() -> Self {
        Self {
            algorithm: CompressionAlgorithm::None,
            quality: 0,
        }
    }
}

/// Written uncompressed right after the magic: it says how to read everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchHeader {
    pub compression: CompressionSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncType {
    Rsync,
    Bsdiff,
}

/// Opens the op group that reconstructs source file `file_index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncHeader {
    pub file_index: u32,
    pub kind: SyncType,
}

/// Names the target file that COPY ops of the current group read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BsdiffHeader {
    pub target_index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncOp {
    Copy { offset: u64, length: u64 },
    Add { data: Vec<u8> },
    /// Ends the op stream of the whole patch.
    HeyYouDidIt,
}

impl SyncOp {
    /// Number of output bytes this op produces.
    pub fn output_len(&self) -> u64 {
        match self {
            SyncOp::Copy { length, .. } => *length,
            SyncOp::Add { data } => data.len() as u64,
            SyncOp::HeyYouDidIt => 0,
        }
    }
}
