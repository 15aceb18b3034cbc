//! Synthetic platform implementations for tests.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

use super::{Decompress, FileRead, KernelSpace, Protection, TaskMemory};

/// In-memory path-to-bytes map standing in for the filesystem.
#[derive(Default)]
pub struct MockFiles {
    files: HashMap<PathBuf, Vec<u8>>,
}

impl MockFiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<P: Into<PathBuf>>(&mut self, path: P, data: Vec<u8>) {
        self.files.insert(path.into(), data);
    }
}

impl FileRead for MockFiles {
    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        self.files.get(path).cloned().ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                path.display().to_string(),
            ))
        })
    }
}

/// Flat memory window standing in for the live kernel address space.
pub struct MockKernel {
    pub base: u64,
    pub memory: Vec<u8>,
    pub base_hint: u64,
    write_protected: Cell<bool>,
    interrupts_on: Cell<bool>,
    /// Recorded (write_protection, interrupts_on) transitions
    pub transitions: RefCell<Vec<(bool, bool)>>,
    pub fail_wp_change: Cell<bool>,
}

impl MockKernel {
    pub fn new(base: u64, memory: Vec<u8>) -> Self {
        let hint = (base + memory.len() as u64).saturating_sub(1);
        Self {
            base,
            memory,
            base_hint: hint,
            write_protected: Cell::new(true),
            interrupts_on: Cell::new(true),
            transitions: RefCell::new(Vec::new()),
            fail_wp_change: Cell::new(false),
        }
    }

    pub fn write_protected(&self) -> bool {
        self.write_protected.get()
    }

    pub fn interrupts_on(&self) -> bool {
        self.interrupts_on.get()
    }
}

impl KernelSpace for MockKernel {
    fn privileged_base_hint(&self) -> u64 {
        self.base_hint
    }

    fn read(&self, address: u64, buf: &mut [u8]) -> Result<()> {
        let off = address.checked_sub(self.base).ok_or(Error::MemoryAccess {
            address,
            message: "below mapped base".into(),
        })? as usize;
        let end = off.checked_add(buf.len()).filter(|&e| e <= self.memory.len());
        match end {
            Some(end) => {
                buf.copy_from_slice(&self.memory[off..end]);
                Ok(())
            }
            None => Err(Error::MemoryAccess {
                address,
                message: "past mapped end".into(),
            }),
        }
    }

    fn set_write_protection(&self, enable: bool) -> Result<()> {
        if self.fail_wp_change.get() {
            return Err(Error::Protection("mock wp change rejected".into()));
        }
        self.write_protected.set(enable);
        self.transitions
            .borrow_mut()
            .push((enable, self.interrupts_on.get()));
        Ok(())
    }

    fn disable_interrupts(&self) -> bool {
        let was_disabled = !self.interrupts_on.get();
        self.interrupts_on.set(false);
        was_disabled
    }

    fn enable_interrupts(&self) {
        self.interrupts_on.set(true);
    }
}

/// One task's mapped memory with per-page protections.
pub struct MockTask {
    pub base: u64,
    pub memory: Vec<u8>,
    protections: HashMap<u64, Protection>,
    pub default_protection: Protection,
    /// Addresses whose writes should fail, for rollback tests
    pub fail_write_at: Option<u64>,
    pub writes: Vec<(u64, usize)>,
}

impl MockTask {
    pub fn new(base: u64, memory: Vec<u8>) -> Self {
        Self {
            base,
            memory,
            protections: HashMap::new(),
            default_protection: Protection::READ_EXECUTE,
            fail_write_at: None,
            writes: Vec::new(),
        }
    }

    fn offset(&self, address: u64, len: usize) -> Result<usize> {
        let off = address.checked_sub(self.base).ok_or(Error::MemoryAccess {
            address,
            message: "below mapped base".into(),
        })? as usize;
        if off.checked_add(len).is_none_or(|e| e > self.memory.len()) {
            return Err(Error::MemoryAccess {
                address,
                message: "past mapped end".into(),
            });
        }
        Ok(off)
    }

    fn page_of(&self, address: u64) -> u64 {
        address & !(crate::patch::PAGE_SIZE as u64 - 1)
    }

    pub fn bytes_at(&self, address: u64, len: usize) -> &[u8] {
        let off = (address - self.base) as usize;
        &self.memory[off..off + len]
    }
}

impl TaskMemory for MockTask {
    fn base_address(&self) -> u64 {
        self.base
    }

    fn read(&mut self, address: u64, buf: &mut [u8]) -> Result<()> {
        let off = self.offset(address, buf.len())?;
        buf.copy_from_slice(&self.memory[off..off + buf.len()]);
        Ok(())
    }

    fn write(&mut self, address: u64, data: &[u8]) -> Result<()> {
        if self.fail_write_at == Some(address) {
            return Err(Error::MemoryAccess {
                address,
                message: "mock write rejected".into(),
            });
        }
        let off = self.offset(address, data.len())?;
        if !self.protection(address).write {
            return Err(Error::Protection(format!(
                "page at {address:#x} is not writable"
            )));
        }
        self.memory[off..off + data.len()].copy_from_slice(data);
        self.writes.push((address, data.len()));
        Ok(())
    }

    fn protection(&self, address: u64) -> Protection {
        self.protections
            .get(&self.page_of(address))
            .copied()
            .unwrap_or(self.default_protection)
    }

    fn set_protection(&mut self, address: u64, len: u64, prot: Protection) -> Result<()> {
        let mut page = self.page_of(address);
        let end = address + len;
        while page < end {
            self.protections.insert(page, prot);
            page += crate::patch::PAGE_SIZE as u64;
        }
        Ok(())
    }
}

/// Decompressor that ignores the algorithm and returns a canned payload.
pub struct MockDecompress {
    pub payload: Vec<u8>,
}

impl Decompress for MockDecompress {
    fn decompress(&self, _algorithm: u32, _data: &[u8], expected_len: usize) -> Result<Vec<u8>> {
        if self.payload.len() != expected_len {
            return Err(Error::Decompression(format!(
                "expected {expected_len} bytes, have {}",
                self.payload.len()
            )));
        }
        Ok(self.payload.clone())
    }
}
