//! Segment layout analysis and the zero-fill remap.
//!
//! A file whose segments can be mapped straight from disk needs no copy. One
//! with zero-fill tails, holes or out-of-order segments has to be expanded
//! into a buffer laid out like the runtime address space first.

use std::ops::Deref;

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::macho::MachOImage;
use crate::util::{align_up, sub_slice};

/// Summary of how the segments sit in the address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentsLayout {
    /// Page-rounded span from the lowest to the highest segment address
    pub vm_space: u64,
    /// Lowest segment vmaddr, ignoring __PAGEZERO
    pub lowest_vm_addr: u64,
    /// A writable segment grows when mapped, or some segment has vmsize 0
    pub write_expansion: bool,
    /// The segments do not tile `vm_space`
    pub has_hole: bool,
    /// __TEXT is not the lowest segment
    pub out_of_order: bool,
}

impl SegmentsLayout {
    /// Returns true if the file cannot be used as its own memory image.
    #[inline]
    pub fn needs_remap(&self) -> bool {
        self.write_expansion || self.has_hole || self.out_of_order
    }
}

impl<'a> MachOImage<'a> {
    pub fn analyze_segments_layout(&self) -> SegmentsLayout {
        let mut write_expansion = false;
        let mut lowest = u64::MAX;
        let mut highest = 0u64;
        let mut sum_vm_sizes = 0u64;
        for seg in self.segments() {
            if seg.name == "__PAGEZERO" {
                continue;
            }
            // zero fill at the end of __DATA
            if seg.writable() && seg.file_size != seg.vm_size {
                write_expansion = true;
            }
            if seg.vm_size == 0 {
                write_expansion = true;
            }
            lowest = lowest.min(seg.vm_addr);
            highest = highest.max(seg.vm_addr.saturating_add(seg.vm_size));
            sum_vm_sizes = sum_vm_sizes.saturating_add(seg.vm_size);
        }
        if lowest > highest {
            lowest = highest;
        }

        // LINKEDIT vmsize need not be page rounded
        let page = if self.uses_16k_pages() { 0x4000 } else { 0x1000 };
        let vm_space = align_up(highest - lowest, page);
        SegmentsLayout {
            vm_space,
            lowest_vm_addr: lowest,
            write_expansion,
            has_hole: vm_space != sum_vm_sizes,
            out_of_order: self.preferred_load_address() != lowest,
        }
    }

    /// Bytes of address space the image occupies once mapped.
    pub fn mapped_size(&self) -> u64 {
        self.analyze_segments_layout().vm_space
    }
}

/// An image copied into its runtime layout.
///
/// Only a shared view is handed out; the bytes never change after the copy.
#[derive(Debug, Clone)]
pub struct RemappedImage {
    bytes: Vec<u8>,
    base_vm_addr: u64,
    header_offset: usize,
}

impl RemappedImage {
    /// vmaddr that offset 0 of the buffer corresponds to.
    pub fn base_vm_addr(&self) -> u64 {
        self.base_vm_addr
    }

    /// Offset of the mach header, non-zero when a segment maps below __TEXT.
    pub fn header_offset(&self) -> usize {
        self.header_offset
    }

    /// Parses the remapped header.
    pub fn image(&self) -> Result<MachOImage<'_>> {
        MachOImage::parse(&self.bytes[self.header_offset..])
    }
}

impl Deref for RemappedImage {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

/// Copies `data` into a fresh buffer laid out like memory, if its layout
/// requires it. Returns `Ok(None)` when the file can be used as is.
///
/// Either every segment is copied and the new buffer is returned, or an error
/// is returned and nothing is kept. `data` is never modified.
pub fn remap_if_zero_fill(data: &[u8]) -> Result<Option<RemappedImage>> {
    let image = MachOImage::parse(data)?;
    let layout = image.analyze_segments_layout();
    if !layout.needs_remap() {
        return Ok(None);
    }
    info!(
        "remapping image into {:#x} bytes (expansion={}, hole={}, out_of_order={})",
        layout.vm_space, layout.write_expansion, layout.has_hole, layout.out_of_order
    );

    let size = usize::try_from(layout.vm_space)
        .map_err(|_| Error::resource_exhaustion(layout.vm_space, "exceeds address space"))?;
    let mut bytes = Vec::new();
    bytes
        .try_reserve_exact(size)
        .map_err(|e| Error::resource_exhaustion(layout.vm_space, e.to_string()))?;
    bytes.resize(size, 0);

    let base = layout.lowest_vm_addr;
    for seg in image.segments() {
        if seg.file_size == 0 || seg.vm_size == 0 {
            continue;
        }
        let src = sub_slice(data, seg.file_offset, seg.file_size).ok_or_else(|| {
            Error::MalformedSegment(format!("segment {} file content extends beyond end of file", seg.name))
        })?;
        let dst_start = seg.vm_addr.wrapping_sub(base);
        let dst = usize::try_from(dst_start)
            .ok()
            .and_then(|start| bytes.get_mut(start..start.checked_add(src.len())?))
            .ok_or_else(|| {
                Error::MalformedSegment(format!("segment {} content does not fit its vm range", seg.name))
            })?;
        dst.copy_from_slice(src);
        debug!("copied {} ({:#x} bytes) to {:#x}", seg.name, src.len(), dst_start);
    }

    let header_offset = image.preferred_load_address().wrapping_sub(base) as usize;
    Ok(Some(RemappedImage {
        bytes,
        base_vm_addr: base,
        header_offset,
    }))
}
