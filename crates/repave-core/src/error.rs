use thiserror::Error;

use crate::patch::Architecture;

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed image: {0}")]
    Malformed(String),

    #[error("unsupported magic {0:#010x}")]
    UnsupportedMagic(u32),

    #[error("read of {len:#x} bytes at offset {offset:#x} exceeds buffer of {size:#x} bytes")]
    OutOfBounds { offset: u64, len: u64, size: u64 },

    #[error("architecture {0} not present in fat image")]
    ArchitectureNotFound(Architecture),

    #[error("symbol not found: {0}")]
    SymbolNotFound(String),

    #[error("load slide is not set")]
    SlideNotSet,

    #[error("decompression failed: {0}")]
    Decompression(String),

    #[error("memory protection change failed: {0}")]
    Protection(String),

    #[error("memory access failed at address {address:#x}: {message}")]
    MemoryAccess { address: u64, message: String },

    #[error("header rewritten but command write failed (rolled back: {rolled_back})")]
    PartialInjection { rolled_back: bool },

    #[error("failed to hook required function {0}")]
    HookFailed(String),

    #[error("invalid patch: {0}")]
    InvalidPatch(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Check if this error is a "file not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }

    /// Parse and bounds failures are expected per-image and recoverable at
    /// the call site; the caller skips the image or patch and continues.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Malformed(_)
                | Error::UnsupportedMagic(_)
                | Error::OutOfBounds { .. }
                | Error::ArchitectureNotFound(_)
                | Error::SymbolNotFound(_)
        )
    }
}
