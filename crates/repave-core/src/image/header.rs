//! Bounds-checked field access over raw Mach-O bytes.
//!
//! Every accessor validates against the length of the buffer actually held
//! in memory and fails with [`Error::OutOfBounds`] instead of clamping. No
//! command is trusted beyond its declared size field.

use crate::error::{Error, Result};

use super::constants::*;

pub fn read_u32(buf: &[u8], offset: usize) -> Result<u32> {
    let bytes = slice(buf, offset, 4)?;
    Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
}

pub fn read_u64(buf: &[u8], offset: usize) -> Result<u64> {
    let bytes = slice(buf, offset, 8)?;
    Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
}

/// Checked subslice of `len` bytes at `offset`.
pub fn slice(buf: &[u8], offset: usize, len: usize) -> Result<&[u8]> {
    match offset.checked_add(len) {
        Some(end) if end <= buf.len() => Ok(&buf[offset..end]),
        _ => Err(Error::OutOfBounds {
            offset: offset as u64,
            len: len as u64,
            size: buf.len() as u64,
        }),
    }
}

/// Exact match against a 16-byte NUL-padded name field.
pub fn name_eq(field: &[u8], name: &str) -> bool {
    let name = name.as_bytes();
    if name.len() > field.len() {
        return false;
    }
    field[..name.len()] == *name && field[name.len()..].iter().all(|&b| b == 0)
}

/// Prefix match against a 16-byte name field (`__TEXT` also matches
/// `__TEXT_EXEC`), mirroring how text-like segments are located.
pub fn name_starts_with(field: &[u8], prefix: &str) -> bool {
    let prefix = prefix.as_bytes();
    prefix.len() <= field.len() && field[..prefix.len()] == *prefix
}

#[derive(Debug, Clone, Copy)]
pub struct MachHeader {
    pub magic: u32,
    pub cpu_type: u32,
    pub ncmds: u32,
    pub sizeofcmds: u32,
}

impl MachHeader {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let magic = read_u32(buf, 0)?;
        if magic != MH_MAGIC_64 && magic != MH_MAGIC {
            return Err(Error::UnsupportedMagic(magic));
        }
        Ok(Self {
            magic,
            cpu_type: read_u32(buf, 4)?,
            ncmds: read_u32(buf, 16)?,
            sizeofcmds: read_u32(buf, 20)?,
        })
    }

    pub fn is_64(&self) -> bool {
        self.magic == MH_MAGIC_64
    }

    /// Byte size of the header itself; load commands start right after.
    pub fn size(&self) -> usize {
        if self.is_64() {
            MACH_HEADER_64_SIZE
        } else {
            MACH_HEADER_SIZE
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LoadCommand {
    pub cmd: u32,
    pub cmdsize: u32,
}

impl LoadCommand {
    pub fn parse(buf: &[u8], offset: usize) -> Result<Self> {
        let cmd = read_u32(buf, offset)?;
        let cmdsize = read_u32(buf, offset + 4)?;
        if cmdsize < 8 {
            return Err(Error::Malformed(format!(
                "load command {cmd:#x} declares size {cmdsize}"
            )));
        }
        Ok(Self { cmd, cmdsize })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SegmentCommand {
    pub name: [u8; 16],
    pub vmaddr: u64,
    pub fileoff: u64,
    pub filesize: u64,
    pub nsects: u32,
    pub is_64: bool,
}

impl SegmentCommand {
    pub fn parse(buf: &[u8], offset: usize, is_64: bool) -> Result<Self> {
        let name: [u8; 16] = slice(buf, offset + 8, 16)?.try_into().unwrap();
        if is_64 {
            Ok(Self {
                name,
                vmaddr: read_u64(buf, offset + 24)?,
                fileoff: read_u64(buf, offset + 40)?,
                filesize: read_u64(buf, offset + 48)?,
                nsects: read_u32(buf, offset + 64)?,
                is_64,
            })
        } else {
            Ok(Self {
                name,
                vmaddr: read_u32(buf, offset + 24)? as u64,
                fileoff: read_u32(buf, offset + 32)? as u64,
                filesize: read_u32(buf, offset + 36)? as u64,
                nsects: read_u32(buf, offset + 48)?,
                is_64,
            })
        }
    }

    /// Offset of the first section header following this command.
    pub fn sections_offset(&self, command_offset: usize) -> usize {
        command_offset
            + if self.is_64 {
                SEGMENT_COMMAND_64_SIZE
            } else {
                SEGMENT_COMMAND_SIZE
            }
    }

    pub fn section_size(&self) -> usize {
        if self.is_64 { SECTION_64_SIZE } else { SECTION_SIZE }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SectionHeader {
    pub name: [u8; 16],
    pub addr: u64,
    pub size: u64,
    pub fileoff: u32,
}

impl SectionHeader {
    pub fn parse(buf: &[u8], offset: usize, is_64: bool) -> Result<Self> {
        let name: [u8; 16] = slice(buf, offset, 16)?.try_into().unwrap();
        if is_64 {
            Ok(Self {
                name,
                addr: read_u64(buf, offset + 32)?,
                size: read_u64(buf, offset + 40)?,
                fileoff: read_u32(buf, offset + 48)?,
            })
        } else {
            Ok(Self {
                name,
                addr: read_u32(buf, offset + 32)? as u64,
                size: read_u32(buf, offset + 36)? as u64,
                fileoff: read_u32(buf, offset + 40)?,
            })
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SymtabCommand {
    pub symoff: u32,
    pub nsyms: u32,
    pub stroff: u32,
}

impl SymtabCommand {
    pub fn parse(buf: &[u8], offset: usize) -> Result<Self> {
        Ok(Self {
            symoff: read_u32(buf, offset + 8)?,
            nsyms: read_u32(buf, offset + 12)?,
            stroff: read_u32(buf, offset + 16)?,
        })
    }
}

/// Fat wrapper fields are big-endian on disk; `swapped` is true when the
/// magic read natively as [`FAT_CIGAM`].
#[derive(Debug, Clone, Copy)]
pub struct FatArch {
    pub cpu_type: u32,
    pub offset: u32,
    pub size: u32,
}

impl FatArch {
    pub fn parse(buf: &[u8], offset: usize, swapped: bool) -> Result<Self> {
        let fix = |v: u32| if swapped { v.swap_bytes() } else { v };
        Ok(Self {
            cpu_type: fix(read_u32(buf, offset)?),
            offset: fix(read_u32(buf, offset + 8)?),
            size: fix(read_u32(buf, offset + 12)?),
        })
    }
}

/// One 64-bit symbol table entry; only the string index and value matter
/// for resolution.
#[derive(Debug, Clone, Copy)]
pub struct Nlist64 {
    pub strx: u32,
    pub value: u64,
}

impl Nlist64 {
    pub fn parse(buf: &[u8], offset: usize) -> Result<Self> {
        Ok(Self {
            strx: read_u32(buf, offset)?,
            value: read_u64(buf, offset + 8)?,
        })
    }
}

/// Compressed wrapper header; the size fields are stored big-endian.
#[derive(Debug, Clone, Copy)]
pub struct CompHeader {
    pub algorithm: u32,
    pub decompressed: u32,
    pub compressed: u32,
}

impl CompHeader {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        Ok(Self {
            algorithm: read_u32(buf, 4)?,
            decompressed: read_u32(buf, 8)?.swap_bytes(),
            compressed: read_u32(buf, 12)?.swap_bytes(),
        })
    }
}
