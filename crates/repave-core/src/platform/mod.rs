//! Collaborator seams between the engine and its embedding environment.
//!
//! The matching and fingerprinting logic is fully portable; everything that
//! touches files, privileged CPU state, or another task's address space
//! goes through the narrow traits here so the core can be exercised against
//! synthetic buffers.

use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

#[cfg(test)]
pub mod mock;

#[cfg(test)]
pub use mock::{MockDecompress, MockFiles, MockKernel, MockTask};

/// Random access to the raw bytes of a candidate image.
pub trait ImageSource {
    /// Read exactly `buf.len()` bytes starting at `offset`.
    fn read_range(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Read the whole image.
    fn read_all(&self) -> Result<Vec<u8>>;
}

/// On-disk image backed by the filesystem. Opens the file per read; the
/// engine only touches files during initialization.
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ImageSource for FileSource {
    fn read_range(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut file = fs::File::open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<u8>> {
        Ok(fs::read(&self.path)?)
    }
}

/// In-memory image, used for decompressed payloads and synthetic tests.
impl ImageSource for [u8] {
    fn read_range(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let offset = usize::try_from(offset).map_err(|_| Error::OutOfBounds {
            offset,
            len: buf.len() as u64,
            size: self.len() as u64,
        })?;
        let end = offset.checked_add(buf.len()).filter(|&e| e <= self.len());
        match end {
            Some(end) => {
                buf.copy_from_slice(&self[offset..end]);
                Ok(())
            }
            None => Err(Error::OutOfBounds {
                offset: offset as u64,
                len: buf.len() as u64,
                size: self.len() as u64,
            }),
        }
    }

    fn read_all(&self) -> Result<Vec<u8>> {
        Ok(self.to_vec())
    }
}

/// Decompression of compressed image payloads.
pub trait Decompress {
    fn decompress(&self, algorithm: u32, data: &[u8], expected_len: usize) -> Result<Vec<u8>>;
}

/// Whole-file reads by path, used while compiling patches against on-disk
/// module copies.
pub trait FileRead {
    fn read(&self, path: &Path) -> Result<Vec<u8>>;
}

/// Std filesystem implementation of [`FileRead`].
pub struct Filesystem;

impl FileRead for Filesystem {
    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        Ok(fs::read(path)?)
    }
}

/// Page protection flags of a mapped region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Protection {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl Protection {
    pub const NONE: Self = Self {
        read: false,
        write: false,
        execute: false,
    };
    pub const READ_EXECUTE: Self = Self {
        read: true,
        write: false,
        execute: true,
    };
    pub const READ_WRITE_EXECUTE: Self = Self {
        read: true,
        write: true,
        execute: true,
    };

    pub fn with_write(self) -> Self {
        Self {
            write: true,
            ..self
        }
    }
}

/// Privileged access to the host kernel's own address space and CPU state.
pub trait KernelSpace {
    /// A live address inside the host image, recovered from CPU state
    /// (the trap/interrupt entry point). Zero when unavailable.
    fn privileged_base_hint(&self) -> u64;

    /// Read live kernel memory at an absolute address.
    fn read(&self, address: u64, buf: &mut [u8]) -> Result<()>;

    /// Set or clear the global write-protection bit.
    fn set_write_protection(&self, enable: bool) -> Result<()>;

    /// Disable interrupts, returning whether they were already disabled.
    fn disable_interrupts(&self) -> bool;

    fn enable_interrupts(&self);
}

/// Access to a target task's mapped memory.
pub trait TaskMemory {
    /// Lowest mapped address; the process image header sits here.
    fn base_address(&self) -> u64;

    fn read(&mut self, address: u64, buf: &mut [u8]) -> Result<()>;

    fn write(&mut self, address: u64, data: &[u8]) -> Result<()>;

    /// Protection of the page containing `address`.
    fn protection(&self, address: u64) -> Protection;

    fn set_protection(&mut self, address: u64, len: u64, prot: Protection) -> Result<()>;
}
