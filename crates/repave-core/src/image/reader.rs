//! Header classification for candidate images.
//!
//! A candidate may be a thin 64-bit image, a fat wrapper holding several
//! architectures, or a compressed wrapper around either. Classification
//! re-probes until it lands on a concrete 64-bit header, recording the
//! container offset so later segment reads hit the right slice.

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::patch::Architecture;
use crate::platform::{Decompress, ImageSource};

use super::constants::*;
use super::header::{CompHeader, FatArch, read_u32};

/// Outcome of classification: the concrete header probe plus enough
/// context to read the rest of the image.
#[derive(Debug)]
pub struct ClassifiedImage {
    /// First [`HEADER_PROBE_SIZE`] bytes of the concrete image
    pub probe: Vec<u8>,
    /// Offset of the concrete image within its container ("fat offset")
    pub slice_offset: u64,
    /// Whole decompressed file when the image sat behind a compressed
    /// wrapper; reads must come from here instead of the source
    pub decompressed: Option<Vec<u8>>,
}

impl ClassifiedImage {
    /// Read `buf.len()` bytes at `offset` relative to the concrete image.
    pub fn read_at<S: ImageSource + ?Sized>(
        &self,
        source: &S,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<()> {
        match &self.decompressed {
            Some(data) => data.as_slice().read_range(self.slice_offset + offset, buf),
            None => source.read_range(self.slice_offset + offset, buf),
        }
    }
}

/// Classify the image in `source`, selecting `arch` out of fat wrappers
/// and unpacking a compressed wrapper when a decompressor is permitted.
///
/// Unknown magic values are a hard failure, never silently substituted.
pub fn classify<S: ImageSource + ?Sized>(
    source: &S,
    arch: Architecture,
    decompressor: Option<&dyn Decompress>,
) -> Result<ClassifiedImage> {
    let mut decompressed: Option<Vec<u8>> = None;
    let mut offset = 0u64;
    let mut probe = vec![0u8; HEADER_PROBE_SIZE];
    source.read_range(offset, &mut probe)?;

    loop {
        let magic = read_u32(&probe, 0)?;
        match magic {
            MH_MAGIC_64 => {
                debug!(offset, "classified thin 64-bit image");
                return Ok(ClassifiedImage {
                    probe,
                    slice_offset: offset,
                    decompressed,
                });
            }
            FAT_MAGIC | FAT_CIGAM => {
                let swapped = magic == FAT_CIGAM;
                let mut count = read_u32(&probe, 4)?;
                if swapped {
                    count = count.swap_bytes();
                }

                let mut selected = None;
                for i in 0..count as usize {
                    let entry = FatArch::parse(&probe, FAT_HEADER_SIZE + i * FAT_ARCH_SIZE, swapped)?;
                    if entry.cpu_type == arch.cpu_type() {
                        selected = Some(entry);
                        break;
                    }
                }

                let Some(entry) = selected else {
                    warn!(%arch, count, "no matching slice in fat image");
                    return Err(Error::ArchitectureNotFound(arch));
                };

                debug!(%arch, offset = entry.offset, "descending into fat slice");
                offset = entry.offset as u64;
                read_probe(&decompressed, source, offset, &mut probe)?;
            }
            COMP_MAGIC => {
                let Some(decomp) = decompressor else {
                    warn!("compressed image but decompression is disabled");
                    return Err(Error::Decompression("decompression disabled".into()));
                };
                if decompressed.is_some() {
                    return Err(Error::Malformed("nested compressed wrapper".into()));
                }

                let comp = CompHeader::parse(&probe)?;
                debug!(
                    compressed = comp.compressed,
                    decompressed = comp.decompressed,
                    algorithm = format_args!("{:#x}", comp.algorithm),
                    "decompressing wrapped image"
                );

                let mut payload = vec![0u8; comp.compressed as usize];
                source.read_range(offset + COMP_HEADER_SIZE as u64, &mut payload)?;
                let data = decomp.decompress(comp.algorithm, &payload, comp.decompressed as usize)?;

                // Re-probe from the decompressed bytes and classify again
                probe.fill(0);
                let head = data.len().min(HEADER_PROBE_SIZE);
                probe[..head].copy_from_slice(&data[..head]);
                offset = 0;
                decompressed = Some(data);
            }
            other => {
                warn!(magic = format_args!("{other:#010x}"), "unsupported image magic");
                return Err(Error::UnsupportedMagic(other));
            }
        }
    }
}

fn read_probe<S: ImageSource + ?Sized>(
    decompressed: &Option<Vec<u8>>,
    source: &S,
    offset: u64,
    probe: &mut [u8],
) -> Result<()> {
    match decompressed {
        Some(data) => data.as_slice().read_range(offset, probe),
        None => source.read_range(offset, probe),
    }
}
