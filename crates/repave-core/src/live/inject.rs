//! Injection of one synthetic load command into a live process header.
//!
//! The combined (command count, command size) field is rewritten as a
//! single 64-bit store, then the new command's bytes land in the free
//! space after the previous last command. If the command write fails after
//! the header was already rewritten, the header is rolled back; the target
//! is reported inconsistent when even that fails.

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::image::constants::*;
use crate::patch::PAGE_SIZE;
use crate::platform::{Protection, TaskMemory};

/// Restrict segment for 64-bit images: a segment command named
/// `__RESTRICT` holding a single `__restrict` section.
pub fn restrict_command_64() -> Vec<u8> {
    let cmdsize = SEGMENT_COMMAND_64_SIZE + SECTION_64_SIZE;
    let mut cmd = Vec::with_capacity(cmdsize);
    cmd.extend_from_slice(&LC_SEGMENT_64.to_le_bytes());
    cmd.extend_from_slice(&(cmdsize as u32).to_le_bytes());
    cmd.extend_from_slice(&name16("__RESTRICT"));
    cmd.extend_from_slice(&[0u8; 32]); // vmaddr, vmsize, fileoff, filesize
    cmd.extend_from_slice(&[0u8; 8]); // maxprot, initprot
    cmd.extend_from_slice(&1u32.to_le_bytes()); // nsects
    cmd.extend_from_slice(&0u32.to_le_bytes()); // flags
    cmd.extend_from_slice(&name16("__restrict"));
    cmd.extend_from_slice(&name16("__RESTRICT"));
    cmd.extend_from_slice(&[0u8; SECTION_64_SIZE - 32]);
    cmd
}

/// Restrict segment for 32-bit images.
pub fn restrict_command_32() -> Vec<u8> {
    let cmdsize = SEGMENT_COMMAND_SIZE + SECTION_SIZE;
    let mut cmd = Vec::with_capacity(cmdsize);
    cmd.extend_from_slice(&LC_SEGMENT.to_le_bytes());
    cmd.extend_from_slice(&(cmdsize as u32).to_le_bytes());
    cmd.extend_from_slice(&name16("__RESTRICT"));
    cmd.extend_from_slice(&[0u8; 16]); // vmaddr, vmsize, fileoff, filesize
    cmd.extend_from_slice(&[0u8; 8]); // maxprot, initprot
    cmd.extend_from_slice(&1u32.to_le_bytes()); // nsects
    cmd.extend_from_slice(&0u32.to_le_bytes()); // flags
    cmd.extend_from_slice(&name16("__restrict"));
    cmd.extend_from_slice(&name16("__RESTRICT"));
    cmd.extend_from_slice(&[0u8; SECTION_SIZE - 32]);
    cmd
}

fn name16(name: &str) -> [u8; 16] {
    let mut field = [0u8; 16];
    field[..name.len()].copy_from_slice(name.as_bytes());
    field
}

/// Rewrite the header at `base` to carry a restrict segment after its
/// current last load command.
pub fn inject_restrict<T: TaskMemory>(task: &mut T, base: u64) -> Result<()> {
    let mut header = [0u8; MACH_HEADER_64_SIZE];
    task.read(base, &mut header)?;

    let magic = u32::from_le_bytes(header[0..4].try_into().unwrap());
    let (header_size, record) = match magic {
        MH_MAGIC_64 => (MACH_HEADER_64_SIZE, restrict_command_64()),
        MH_MAGIC => (MACH_HEADER_SIZE, restrict_command_32()),
        other => {
            warn!(magic = format_args!("{other:#010x}"), "unknown header magic");
            return Err(Error::UnsupportedMagic(other));
        }
    };

    let ncmds = u32::from_le_bytes(header[16..20].try_into().unwrap());
    let sizeofcmds = u32::from_le_bytes(header[20..24].try_into().unwrap());
    let old_bound = header_size as u64 + sizeofcmds as u64;
    let new_bound = old_bound + record.len() as u64;

    // Up to three pages are touched: the header page, the page holding
    // the current end of commands, and the next one when the record
    // straddles a boundary.
    let page = PAGE_SIZE as u64;
    let mut affected = vec![base];
    if old_bound + record.len() as u64 > page {
        let second = base + old_bound - old_bound % page;
        affected.push(second);
        if base + new_bound > second + page {
            affected.push(second + page);
        }
    }

    let mut raised: Vec<(u64, Protection)> = Vec::new();
    for &addr in &affected {
        let prot = task.protection(addr);
        if !prot.write {
            task.set_protection(addr, page, prot.with_write())
                .map_err(|e| Error::Protection(format!("cannot open page {addr:#x}: {e}")))?;
            raised.push((addr, prot));
        }
    }

    let combined_addr = base + 16;
    let old_combined = ((sizeofcmds as u64) << 32) | ncmds as u64;
    let new_combined =
        ((sizeofcmds as u64 + record.len() as u64) << 32) | (ncmds as u64 + 1);

    task.write(combined_addr, &new_combined.to_le_bytes())
        .map_err(|e| Error::Protection(format!("cannot rewrite header counts: {e}")))?;

    if let Err(e) = task.write(base + old_bound, &record) {
        warn!(error = %e, "command write failed, rolling back header");
        let rolled_back = task
            .write(combined_addr, &old_combined.to_le_bytes())
            .is_ok();
        if !rolled_back {
            warn!("header rollback failed, target is inconsistent");
        }
        return Err(Error::PartialInjection { rolled_back });
    }

    for (addr, prot) in raised {
        if let Err(e) = task.set_protection(addr, page, prot) {
            warn!(address = format_args!("{addr:#x}"), error = %e, "failed to restore protection");
        }
    }

    debug!(
        base = format_args!("{base:#x}"),
        ncmds = ncmds + 1,
        sizeofcmds = sizeofcmds as usize + record.len(),
        "injected restrict segment"
    );
    Ok(())
}
