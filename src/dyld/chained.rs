//! Chained fixups.
//!
//! LC_DYLD_CHAINED_FIXUPS replaces the dyld info opcode streams with one
//! blob: a header, a table of chain starts per segment and page, and an
//! import table. The fixups themselves live in place. Every pointer slot in
//! a data page carries its rebase target or import ordinal plus the stride
//! count to the next slot of its chain.

use std::borrow::Cow;
use std::ops::ControlFlow;

use tracing::{debug, trace};

use super::fixup::LibraryOrdinal;
use crate::analyzer::LinkEditInfo;
use crate::diag::Diagnostics;
use crate::error::{Error, Result};
use crate::macho::*;
use crate::util::{get_u16_le, get_u32_le, get_u64_le, greater_than_add_or_overflow, read_cstr};

fn malformed(msg: impl Into<String>) -> Error {
    Error::MalformedFixup(msg.into())
}

// =============================================================================
// Pointer Formats
// =============================================================================

/// Bytes between chained slots per unit of a slot's `next` field.
pub fn chained_pointer_stride(pointer_format: u16) -> Option<u64> {
    match pointer_format {
        DYLD_CHAINED_PTR_ARM64E | DYLD_CHAINED_PTR_ARM64E_USERLAND | DYLD_CHAINED_PTR_ARM64E_USERLAND24 => Some(8),
        DYLD_CHAINED_PTR_ARM64E_KERNEL
        | DYLD_CHAINED_PTR_ARM64E_FIRMWARE
        | DYLD_CHAINED_PTR_64
        | DYLD_CHAINED_PTR_64_OFFSET
        | DYLD_CHAINED_PTR_64_KERNEL_CACHE
        | DYLD_CHAINED_PTR_32
        | DYLD_CHAINED_PTR_32_CACHE
        | DYLD_CHAINED_PTR_32_FIRMWARE => Some(4),
        DYLD_CHAINED_PTR_X86_64_KERNEL_CACHE => Some(1),
        _ => None,
    }
}

#[inline]
fn is_32_bit_format(pointer_format: u16) -> bool {
    matches!(
        pointer_format,
        DYLD_CHAINED_PTR_32 | DYLD_CHAINED_PTR_32_CACHE | DYLD_CHAINED_PTR_32_FIRMWARE
    )
}

/// Largest import count whose ordinals fit the bind slots of a format.
fn max_bind_ordinal(pointer_format: u16) -> u32 {
    match pointer_format {
        DYLD_CHAINED_PTR_32 => 0x0F_FFFF,
        DYLD_CHAINED_PTR_ARM64E | DYLD_CHAINED_PTR_ARM64E_USERLAND => 0xFFFF,
        DYLD_CHAINED_PTR_64 | DYLD_CHAINED_PTR_64_OFFSET | DYLD_CHAINED_PTR_ARM64E_USERLAND24 => 0xFF_FFFF,
        _ => 0,
    }
}

/// Slot layout shared by the arm64e formats.
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct ChainedPtrArm64e(pub u64);

impl ChainedPtrArm64e {
    #[inline]
    pub fn is_auth(&self) -> bool {
        (self.0 >> 63) & 1 != 0
    }

    #[inline]
    pub fn is_bind(&self) -> bool {
        (self.0 >> 62) & 1 != 0
    }

    /// Stride count to the next slot, 0 at the end of the chain.
    #[inline]
    pub fn next(&self) -> u64 {
        (self.0 >> 51) & 0x7FF
    }

    /// Plain rebase target (43 bits).
    #[inline]
    pub fn target(&self) -> u64 {
        self.0 & 0x7FF_FFFF_FFFF
    }

    #[inline]
    pub fn high8(&self) -> u8 {
        ((self.0 >> 43) & 0xFF) as u8
    }

    /// Authenticated rebase target, always a runtime offset.
    #[inline]
    pub fn auth_target(&self) -> u32 {
        self.0 as u32
    }

    #[inline]
    pub fn diversity(&self) -> u16 {
        (self.0 >> 32) as u16
    }

    #[inline]
    pub fn addr_div(&self) -> bool {
        (self.0 >> 48) & 1 != 0
    }

    #[inline]
    pub fn key(&self) -> u8 {
        ((self.0 >> 49) & 0x3) as u8
    }

    #[inline]
    pub fn ordinal(&self) -> u32 {
        (self.0 & 0xFFFF) as u32
    }

    /// Ordinal of the 24-bit userland binds.
    #[inline]
    pub fn ordinal24(&self) -> u32 {
        (self.0 & 0xFF_FFFF) as u32
    }

    /// Plain bind addend, sign-extended from 19 bits.
    #[inline]
    pub fn addend(&self) -> i64 {
        let addend = ((self.0 >> 32) & 0x7_FFFF) as i64;
        if addend & 0x4_0000 != 0 {
            addend - 0x8_0000
        } else {
            addend
        }
    }
}

/// `DYLD_CHAINED_PTR_64` and `DYLD_CHAINED_PTR_64_OFFSET` slot.
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct ChainedPtr64(pub u64);

impl ChainedPtr64 {
    #[inline]
    pub fn is_bind(&self) -> bool {
        (self.0 >> 63) & 1 != 0
    }

    #[inline]
    pub fn next(&self) -> u64 {
        (self.0 >> 51) & 0xFFF
    }

    #[inline]
    pub fn target(&self) -> u64 {
        self.0 & 0xF_FFFF_FFFF
    }

    #[inline]
    pub fn high8(&self) -> u8 {
        ((self.0 >> 36) & 0xFF) as u8
    }

    #[inline]
    pub fn ordinal(&self) -> u32 {
        (self.0 & 0xFF_FFFF) as u32
    }

    #[inline]
    pub fn addend(&self) -> u8 {
        ((self.0 >> 24) & 0xFF) as u8
    }
}

/// Kernel collection slot; rebases only.
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct ChainedPtr64KernelCache(pub u64);

impl ChainedPtr64KernelCache {
    #[inline]
    pub fn is_auth(&self) -> bool {
        (self.0 >> 63) & 1 != 0
    }

    #[inline]
    pub fn next(&self) -> u64 {
        (self.0 >> 51) & 0xFFF
    }

    #[inline]
    pub fn target(&self) -> u64 {
        self.0 & 0x3FFF_FFFF
    }

    #[inline]
    pub fn cache_level(&self) -> u8 {
        ((self.0 >> 30) & 0x3) as u8
    }

    #[inline]
    pub fn diversity(&self) -> u16 {
        (self.0 >> 32) as u16
    }

    #[inline]
    pub fn addr_div(&self) -> bool {
        (self.0 >> 48) & 1 != 0
    }

    #[inline]
    pub fn key(&self) -> u8 {
        ((self.0 >> 49) & 0x3) as u8
    }
}

/// `DYLD_CHAINED_PTR_32` slot.
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct ChainedPtr32(pub u32);

impl ChainedPtr32 {
    #[inline]
    pub fn is_bind(&self) -> bool {
        (self.0 >> 31) & 1 != 0
    }

    #[inline]
    pub fn next(&self) -> u64 {
        ((self.0 >> 26) & 0x1F) as u64
    }

    #[inline]
    pub fn target(&self) -> u32 {
        self.0 & 0x3FF_FFFF
    }

    #[inline]
    pub fn ordinal(&self) -> u32 {
        self.0 & 0xF_FFFF
    }

    #[inline]
    pub fn addend(&self) -> u8 {
        ((self.0 >> 20) & 0x3F) as u8
    }
}

/// `DYLD_CHAINED_PTR_32_CACHE` slot.
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct ChainedPtr32Cache(pub u32);

impl ChainedPtr32Cache {
    #[inline]
    pub fn next(&self) -> u64 {
        ((self.0 >> 30) & 0x3) as u64
    }

    #[inline]
    pub fn target(&self) -> u32 {
        self.0 & 0x3FFF_FFFF
    }
}

/// `DYLD_CHAINED_PTR_32_FIRMWARE` slot.
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct ChainedPtr32Firmware(pub u32);

impl ChainedPtr32Firmware {
    #[inline]
    pub fn next(&self) -> u64 {
        ((self.0 >> 26) & 0x3F) as u64
    }

    #[inline]
    pub fn target(&self) -> u32 {
        self.0 & 0x3FF_FFFF
    }
}

/// Pointer authentication parameters of an arm64e slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PointerAuth {
    pub diversity: u16,
    pub addr_div: bool,
    pub key: u8,
}

/// A decoded chained slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChainedPointer {
    /// Target is a vmaddr or a runtime offset depending on the format
    Rebase { target: u64, high8: u8 },
    /// Target is always a runtime offset
    AuthRebase { target: u64, auth: PointerAuth },
    Bind { ordinal: u32, addend: i64 },
    AuthBind { ordinal: u32, auth: PointerAuth },
    /// A 32-bit slot holding a plain integer, stored biased above
    /// `max_valid_pointer`
    NonPointer(u32),
}

impl ChainedPointer {
    /// Decodes a raw slot and returns it with its next stride count, or
    /// `None` for an unknown format.
    pub fn decode(pointer_format: u16, raw: u64, max_valid_pointer: u32) -> Option<(Self, u64)> {
        let decoded = match pointer_format {
            DYLD_CHAINED_PTR_ARM64E
            | DYLD_CHAINED_PTR_ARM64E_USERLAND
            | DYLD_CHAINED_PTR_ARM64E_USERLAND24
            | DYLD_CHAINED_PTR_ARM64E_KERNEL
            | DYLD_CHAINED_PTR_ARM64E_FIRMWARE => {
                let p = ChainedPtrArm64e(raw);
                let auth = PointerAuth {
                    diversity: p.diversity(),
                    addr_div: p.addr_div(),
                    key: p.key(),
                };
                let ordinal = if pointer_format == DYLD_CHAINED_PTR_ARM64E_USERLAND24 {
                    p.ordinal24()
                } else {
                    p.ordinal()
                };
                let pointer = match (p.is_auth(), p.is_bind()) {
                    (false, false) => ChainedPointer::Rebase {
                        target: p.target(),
                        high8: p.high8(),
                    },
                    (true, false) => ChainedPointer::AuthRebase {
                        target: p.auth_target() as u64,
                        auth,
                    },
                    (false, true) => ChainedPointer::Bind {
                        ordinal,
                        addend: p.addend(),
                    },
                    (true, true) => ChainedPointer::AuthBind { ordinal, auth },
                };
                (pointer, p.next())
            }
            DYLD_CHAINED_PTR_64 | DYLD_CHAINED_PTR_64_OFFSET => {
                let p = ChainedPtr64(raw);
                let pointer = if p.is_bind() {
                    ChainedPointer::Bind {
                        ordinal: p.ordinal(),
                        addend: p.addend() as i64,
                    }
                } else {
                    ChainedPointer::Rebase {
                        target: p.target(),
                        high8: p.high8(),
                    }
                };
                (pointer, p.next())
            }
            DYLD_CHAINED_PTR_64_KERNEL_CACHE | DYLD_CHAINED_PTR_X86_64_KERNEL_CACHE => {
                let p = ChainedPtr64KernelCache(raw);
                let pointer = if p.is_auth() {
                    ChainedPointer::AuthRebase {
                        target: p.target(),
                        auth: PointerAuth {
                            diversity: p.diversity(),
                            addr_div: p.addr_div(),
                            key: p.key(),
                        },
                    }
                } else {
                    ChainedPointer::Rebase {
                        target: p.target(),
                        high8: 0,
                    }
                };
                (pointer, p.next())
            }
            DYLD_CHAINED_PTR_32 => {
                let p = ChainedPtr32(raw as u32);
                let pointer = if p.is_bind() {
                    ChainedPointer::Bind {
                        ordinal: p.ordinal(),
                        addend: p.addend() as i64,
                    }
                } else if max_valid_pointer != 0 && p.target() > max_valid_pointer {
                    let bias = (0x0400_0000 + max_valid_pointer) / 2;
                    ChainedPointer::NonPointer(p.target().wrapping_sub(bias))
                } else {
                    ChainedPointer::Rebase {
                        target: p.target() as u64,
                        high8: 0,
                    }
                };
                (pointer, p.next())
            }
            DYLD_CHAINED_PTR_32_CACHE => {
                let p = ChainedPtr32Cache(raw as u32);
                let target = p.target() as u64;
                (ChainedPointer::Rebase { target, high8: 0 }, p.next())
            }
            DYLD_CHAINED_PTR_32_FIRMWARE => {
                let p = ChainedPtr32Firmware(raw as u32);
                let target = p.target() as u64;
                (ChainedPointer::Rebase { target, high8: 0 }, p.next())
            }
            _ => return None,
        };
        Some(decoded)
    }

    #[inline]
    pub fn is_bind(&self) -> bool {
        matches!(self, ChainedPointer::Bind { .. } | ChainedPointer::AuthBind { .. })
    }
}

/// One slot found by walking the chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChainedFixup {
    pub segment_index: u32,
    pub segment_offset: u64,
    pub pointer_format: u16,
    /// The slot as stored in the file
    pub raw: u64,
    pub pointer: ChainedPointer,
}

impl ChainedFixup {
    /// Rebase target as an offset from the image base, or `None` for binds
    /// and non-pointers.
    pub fn rebase_runtime_offset(&self, preferred_load_address: u64) -> Option<u64> {
        match self.pointer {
            ChainedPointer::AuthRebase { target, .. } => Some(target),
            ChainedPointer::Rebase { target, high8 } => {
                let target = match self.pointer_format {
                    // these formats store unslid vmaddrs
                    DYLD_CHAINED_PTR_ARM64E
                    | DYLD_CHAINED_PTR_ARM64E_FIRMWARE
                    | DYLD_CHAINED_PTR_64
                    | DYLD_CHAINED_PTR_32
                    | DYLD_CHAINED_PTR_32_CACHE
                    | DYLD_CHAINED_PTR_32_FIRMWARE => target.wrapping_sub(preferred_load_address),
                    _ => target,
                };
                Some(((high8 as u64) << 56) | target)
            }
            _ => None,
        }
    }

    /// Index into the chained import table for binds.
    pub fn bind_ordinal(&self) -> Option<u32> {
        match self.pointer {
            ChainedPointer::Bind { ordinal, .. } | ChainedPointer::AuthBind { ordinal, .. } => Some(ordinal),
            _ => None,
        }
    }
}

// =============================================================================
// Chain Starts
// =============================================================================

/// Chain starts of one segment (`dyld_chained_starts_in_segment`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentChainStarts {
    pub segment_index: u32,
    pub page_size: u16,
    pub pointer_format: u16,
    /// vmaddr of the segment minus the image base
    pub segment_offset: u64,
    pub max_valid_pointer: u32,
    pub page_count: u16,
    /// `page_count` page starts followed by the overflow entries
    pub page_starts: Vec<u16>,
}

impl SegmentChainStarts {
    /// In-page offsets of every chain starting on `page`.
    pub fn chain_starts_in_page(&self, page: usize) -> Result<Vec<u16>> {
        let Some(&start) = self.page_starts.get(page) else {
            return Ok(Vec::new());
        };
        if start == DYLD_CHAINED_PTR_START_NONE {
            return Ok(Vec::new());
        }
        if start & DYLD_CHAINED_PTR_START_MULTI == 0 {
            return Ok(vec![start]);
        }
        let mut out = Vec::new();
        let mut index = (start & !DYLD_CHAINED_PTR_START_MULTI) as usize;
        loop {
            let entry = *self.page_starts.get(index).ok_or_else(|| {
                malformed(format!(
                    "chain overflow index out of range {} in segment #{}",
                    index, self.segment_index
                ))
            })?;
            out.push(entry & !DYLD_CHAINED_PTR_START_LAST);
            if entry & DYLD_CHAINED_PTR_START_LAST != 0 {
                return Ok(out);
            }
            index += 1;
        }
    }
}

/// Decoded `dyld_chained_starts_in_image`. Only segments with fixups are
/// listed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainStarts {
    pub seg_count: u32,
    pub segments: Vec<SegmentChainStarts>,
}

impl ChainStarts {
    /// Decodes the starts table at `starts_offset` of a chained fixups blob.
    /// Per-segment records must end at or before `end`.
    pub fn parse(blob: &[u8], starts_offset: u32, end: u64) -> Result<Self> {
        let end = end.min(blob.len() as u64);
        let base = starts_offset as usize;
        let truncated = || malformed("chained fixups, starts_in_image extends beyond LC_DYLD_CHAINED_FIXUPS size");
        let seg_count = get_u32_le(blob, base).ok_or_else(truncated)?;
        let mut segments = Vec::new();
        for i in 0..seg_count {
            let slot = base as u64 + 4 + 4 * i as u64;
            let seg_info_offset = usize::try_from(slot)
                .ok()
                .and_then(|slot| get_u32_le(blob, slot))
                .ok_or_else(truncated)?;
            // no fixups in this segment
            if seg_info_offset == 0 {
                continue;
            }
            let at = starts_offset as u64 + seg_info_offset as u64;
            let overruns = || {
                malformed(format!(
                    "chained fixups, dyld_chained_starts_in_segment for segment #{} overruns imports table",
                    i
                ))
            };
            if greater_than_add_or_overflow(at, ChainedStartsInSegment::SIZE as u64, end) {
                return Err(overruns());
            }
            let at = at as usize;
            let fixed = ChainedStartsInSegment::parse(blob, at).ok_or_else(overruns)?;
            if greater_than_add_or_overflow(at as u64, fixed.size as u64, end) {
                return Err(overruns());
            }
            let fixed_end = ChainedStartsInSegment::SIZE as u64 + 2 * fixed.page_count as u64;
            if fixed_end > fixed.size as u64 {
                return Err(malformed("chained fixups, page_start array overflows size"));
            }
            let entries = (fixed.size as usize - ChainedStartsInSegment::SIZE) / 2;
            let page_starts = (0..entries)
                .map(|e| get_u16_le(blob, at + ChainedStartsInSegment::SIZE + 2 * e).ok_or_else(overruns))
                .collect::<Result<Vec<u16>>>()?;
            segments.push(SegmentChainStarts {
                segment_index: i,
                page_size: fixed.page_size,
                pointer_format: fixed.pointer_format,
                segment_offset: fixed.segment_offset,
                max_valid_pointer: fixed.max_valid_pointer,
                page_count: fixed.page_count,
                page_starts,
            });
        }
        Ok(Self { seg_count, segments })
    }
}

// =============================================================================
// Imports
// =============================================================================

/// One entry of the chained import table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChainedImport<'a> {
    /// Raw library ordinal; see [`ChainedImport::library`]
    pub ordinal: i32,
    pub symbol_name: Cow<'a, str>,
    pub addend: i64,
    pub weak_import: bool,
}

impl ChainedImport<'_> {
    #[inline]
    pub fn library(&self) -> Option<LibraryOrdinal> {
        LibraryOrdinal::from_raw(self.ordinal)
    }

    pub fn into_owned(self) -> ChainedImport<'static> {
        ChainedImport {
            ordinal: self.ordinal,
            symbol_name: Cow::Owned(self.symbol_name.into_owned()),
            addend: self.addend,
            weak_import: self.weak_import,
        }
    }
}

/// Byte size of one import entry, by `imports_format`.
fn import_entry_size(imports_format: u32) -> Option<u32> {
    match imports_format {
        DYLD_CHAINED_IMPORT => Some(4),
        DYLD_CHAINED_IMPORT_ADDEND => Some(8),
        DYLD_CHAINED_IMPORT_ADDEND64 => Some(16),
        _ => None,
    }
}

/// The LC_DYLD_CHAINED_FIXUPS payload and its decoded header.
struct ChainedFixupsBlob<'a> {
    data: &'a [u8],
    header: DyldChainedFixupsHeader,
}

impl<'a> ChainedFixupsBlob<'a> {
    fn locate(image: &MachOImage<'a>, info: &LinkEditInfo) -> Result<Option<Self>> {
        let Some(cmd) = info.chained_fixups else {
            return Ok(None);
        };
        let data = image.linkedit_blob("chained fixups", cmd.dataoff, cmd.datasize as u64)?;
        let header = read_struct::<DyldChainedFixupsHeader>(data, 0)
            .ok_or_else(|| malformed("chained fixups, header extends beyond LC_DYLD_CHAINED_FIXUPS size"))?;
        Ok(Some(Self { data, header }))
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn starts(&self) -> Result<ChainStarts> {
        ChainStarts::parse(self.data, self.header.starts_offset, self.header.imports_offset as u64)
    }

    fn walk_imports<F>(&self, f: &mut F) -> Result<ControlFlow<()>>
    where
        F: FnMut(&ChainedImport<'a>) -> ControlFlow<()>,
    {
        let h = &self.header;
        if h.imports_offset as u64 > self.size() || h.symbols_offset as u64 > self.size() {
            return Err(malformed("malformed import table"));
        }
        let entry_size = import_entry_size(h.imports_format).ok_or_else(|| malformed("unknown imports format"))?;
        if greater_than_add_or_overflow(
            h.imports_offset as u64,
            entry_size as u64 * h.imports_count as u64,
            self.size(),
        ) {
            return Err(malformed("malformed import table"));
        }
        let pool = &self.data[h.symbols_offset as usize..];
        let string_overflow = || malformed("malformed import table, string overflow");

        for i in 0..h.imports_count as usize {
            let at = h.imports_offset as usize + i * entry_size as usize;
            let (ordinal, weak_import, name_offset, addend) = if h.imports_format == DYLD_CHAINED_IMPORT_ADDEND64 {
                let raw = get_u64_le(self.data, at).ok_or_else(string_overflow)?;
                let lib = raw as u16;
                // special ordinals are small negative numbers
                let ordinal = if lib > 0xFFF0 { lib as i16 as i32 } else { lib as i32 };
                let addend = get_u64_le(self.data, at + 8).ok_or_else(string_overflow)? as i64;
                (ordinal, (raw >> 16) & 1 != 0, (raw >> 32) as u32, addend)
            } else {
                let raw = get_u32_le(self.data, at).ok_or_else(string_overflow)?;
                let lib = raw as u8;
                let ordinal = if lib > 0xF0 { lib as i8 as i32 } else { lib as i32 };
                let addend = if h.imports_format == DYLD_CHAINED_IMPORT_ADDEND {
                    get_u32_le(self.data, at + 4).ok_or_else(string_overflow)? as i32 as i64
                } else {
                    0
                };
                (ordinal, (raw >> 8) & 1 != 0, raw >> 9, addend)
            };
            let name = read_cstr(pool, name_offset as usize).ok_or_else(string_overflow)?;
            let import = ChainedImport {
                ordinal,
                symbol_name: String::from_utf8_lossy(name),
                addend,
                weak_import,
            };
            if f(&import).is_break() {
                return Ok(ControlFlow::Break(()));
            }
        }
        Ok(ControlFlow::Continue(()))
    }
}

// =============================================================================
// Validation
// =============================================================================

impl<'a> MachOImage<'a> {
    /// Validates the LC_DYLD_CHAINED_FIXUPS header, starts tables and import
    /// table sizing. Images without chained fixups pass trivially.
    pub fn validate_chained_fixups(&self, diag: &mut Diagnostics) {
        if let Err(err) = self.check_chained_fixups() {
            diag.error(err);
        }
    }

    fn check_chained_fixups(&self) -> Result<()> {
        let info = self.linkedit_info()?;
        let Some(blob) = ChainedFixupsBlob::locate(self, &info)? else {
            return Ok(());
        };
        let h = blob.header;

        if h.fixups_version != 0 {
            return Err(malformed("chained fixups, unknown header version"));
        }
        if h.starts_offset as u64 >= blob.size() {
            return Err(malformed("chained fixups, starts_offset exceeds LC_DYLD_CHAINED_FIXUPS size"));
        }
        if h.imports_offset as u64 > blob.size() {
            return Err(malformed("chained fixups, imports_offset exceeds LC_DYLD_CHAINED_FIXUPS size"));
        }
        let entry_size =
            import_entry_size(h.imports_format).ok_or_else(|| malformed("chained fixups, unknown imports_format"))?;
        if greater_than_add_or_overflow(
            h.imports_offset as u64,
            entry_size as u64 * h.imports_count as u64,
            h.symbols_offset as u64,
        ) {
            return Err(malformed("chained fixups, imports array overlaps symbols"));
        }
        if h.symbols_format != 0 {
            return Err(malformed("chained fixups, symbols_format unknown"));
        }

        let starts = blob.starts()?;
        self.check_chain_seg_count(&info, starts.seg_count)?;

        let base = self.preferred_load_address();
        let mut max_valid_pointer_seen = 0u32;
        let mut pointer_format_for_all: Option<u16> = None;
        for seg in &starts.segments {
            let i = seg.segment_index;
            if seg.page_size != 0x1000 && seg.page_size != 0x4000 {
                return Err(malformed(format!("chained fixups, page_size not 4KB or 16KB in segment #{}", i)));
            }
            if seg.pointer_format == 0 || seg.pointer_format > DYLD_CHAINED_PTR_MAX {
                return Err(malformed(format!("chained fixups, unknown pointer_format in segment #{}", i)));
            }
            let first = *pointer_format_for_all.get_or_insert(seg.pointer_format);
            if seg.pointer_format != first {
                return Err(malformed(format!(
                    "chained fixups, pointer_format not same for all segments {} and {}",
                    seg.pointer_format, first
                )));
            }
            let expected = info.segments.get(i as usize).map(|s| s.vm_addr.wrapping_sub(base));
            if expected != Some(seg.segment_offset) {
                return Err(malformed(format!(
                    "chained fixups, segment_offset does not match vmaddr from LC_SEGMENT in segment #{}",
                    i
                )));
            }
            if seg.max_valid_pointer != 0 {
                if max_valid_pointer_seen == 0 {
                    max_valid_pointer_seen = seg.max_valid_pointer;
                } else if max_valid_pointer_seen != seg.max_valid_pointer {
                    return Err(malformed(
                        "chained fixups, different max_valid_pointer values seen in different segments",
                    ));
                }
            }
            self.check_page_starts(&info, seg)?;
        }

        if h.imports_count != 0 {
            let max = max_bind_ordinal(pointer_format_for_all.unwrap_or(0));
            if h.imports_count >= max {
                return Err(malformed(format!(
                    "chained fixups, imports_count ({}) exceeds max of {}",
                    h.imports_count, max
                )));
            }
        }

        if max_valid_pointer_seen != 0 && !self.in_dyld_cache() {
            let last = info
                .linkedit_index
                .checked_sub(1)
                .and_then(|i| info.segments.get(i as usize))
                .map(|s| s.vm_addr.wrapping_add(s.vm_size))
                .unwrap_or(0);
            if (max_valid_pointer_seen as u64) < last {
                return Err(malformed("chained fixups, max_valid_pointer too small for image"));
            }
        }
        debug!(
            "chained fixups: {} segments with chains, {} imports",
            starts.segments.len(),
            h.imports_count
        );
        Ok(())
    }

    /// The starts table may list fewer segments than the image has, as long
    /// as the missing ones (segments inserted before __LINKEDIT after
    /// linking) are empty.
    fn check_chain_seg_count(&self, info: &LinkEditInfo, seg_count: u32) -> Result<()> {
        let expected = info.linkedit_index + 1;
        if seg_count == expected {
            return Ok(());
        }
        if seg_count > expected {
            return Err(malformed("chained fixups, seg_count exceeds number of segments"));
        }
        let extra = (info.segments.len() as u32).saturating_sub(seg_count);
        let empty = (0..extra)
            .filter(|i| {
                info.linkedit_index
                    .checked_sub(i + 1)
                    .and_then(|index| info.segments.get(index as usize))
                    .is_some_and(|s| s.vm_size == 0)
            })
            .count() as u32;
        if empty != extra {
            return Err(malformed("chained fixups, seg_count does not match number of segments"));
        }
        Ok(())
    }

    fn check_page_starts(&self, info: &LinkEditInfo, seg: &SegmentChainStarts) -> Result<()> {
        let i = seg.segment_index;
        let page_size = seg.page_size;
        let max_index = seg.page_starts.len().saturating_sub(1);
        for page in 0..seg.page_count as usize {
            let start = seg.page_starts[page];
            if start == DYLD_CHAINED_PTR_START_NONE {
                continue;
            }
            if start & DYLD_CHAINED_PTR_START_MULTI == 0 {
                if start > page_size {
                    return Err(malformed(format!(
                        "chained fixups, in segment #{} page_start[{}]=0x{:04X} exceeds page size",
                        i, page, start
                    )));
                }
                continue;
            }
            // an index into the overflow entries; starts within the page
            // must be ascending
            let mut index = (start & !DYLD_CHAINED_PTR_START_MULTI) as usize;
            let mut last = 0u16;
            loop {
                let Some(&entry) = seg.page_starts.get(index) else {
                    let name = info.segments.get(i as usize).map(|s| s.name.as_str()).unwrap_or("?");
                    return Err(malformed(format!(
                        "chain overflow index out of range {} (max={}) in segment {}",
                        index, max_index, name
                    )));
                };
                let offset = entry & !DYLD_CHAINED_PTR_START_LAST;
                if offset > page_size {
                    return Err(malformed(format!(
                        "chained fixups, in segment #{} overflow page_start[{}]=0x{:04X} exceeds page size",
                        i, index, offset
                    )));
                }
                if offset <= last && last != 0 {
                    return Err(malformed(format!(
                        "chained fixups, in segment #{} overflow page_start[{}]=0x{:04X} is before previous at 0x{:04X}",
                        i, index, offset, last
                    )));
                }
                if entry & DYLD_CHAINED_PTR_START_LAST != 0 {
                    break;
                }
                last = offset;
                index += 1;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Targets and Chains
    // =========================================================================

    /// Calls `f` for every entry of the chained import table, in ordinal
    /// order. Old arm64e images get their targets from the threaded bind
    /// opcodes.
    pub fn for_each_chained_fixup_target<F>(&self, diag: &mut Diagnostics, mut f: F)
    where
        F: FnMut(&ChainedImport<'a>) -> ControlFlow<()>,
    {
        let mut walk = || -> Result<ControlFlow<()>> {
            let info = self.linkedit_info()?;
            if info.dyld_info.is_some() && self.is_arm64e() {
                return self.walk_threaded_targets(&info, &mut f);
            }
            match ChainedFixupsBlob::locate(self, &info)? {
                Some(blob) => blob.walk_imports(&mut f),
                None => Ok(ControlFlow::Continue(())),
            }
        };
        if let Err(err) = walk() {
            diag.error(err);
        }
    }

    /// Collects the chained import table.
    pub fn chained_imports(&self, diag: &mut Diagnostics) -> Vec<ChainedImport<'a>> {
        let mut out = Vec::new();
        self.for_each_chained_fixup_target(diag, |import| {
            out.push(import.clone());
            ControlFlow::Continue(())
        });
        out
    }

    /// The starts table of the image: decoded from LC_DYLD_CHAINED_FIXUPS,
    /// or synthesized from the bind opcodes of an old arm64e image. `None`
    /// if the image has neither.
    pub fn chain_starts(&self, diag: &mut Diagnostics) -> Option<ChainStarts> {
        let find = || -> Result<Option<ChainStarts>> {
            let info = self.linkedit_info()?;
            if let Some(blob) = ChainedFixupsBlob::locate(self, &info)? {
                return blob.starts().map(Some);
            }
            if info.dyld_info.is_some() && self.is_arm64e() {
                return self.synthesize_threaded_chain_starts(&info).map(Some);
            }
            Ok(None)
        };
        match find() {
            Ok(starts) => starts,
            Err(err) => {
                diag.error(err);
                None
            }
        }
    }

    /// Walks every chain listed in `starts` and calls `f` for each slot.
    pub fn for_each_fixup_in_chains<F>(&self, diag: &mut Diagnostics, starts: &ChainStarts, mut f: F)
    where
        F: FnMut(&ChainedFixup) -> ControlFlow<()>,
    {
        let mut walk = || -> Result<ControlFlow<()>> {
            let info = self.linkedit_info()?;
            self.walk_chains(&info, starts, &mut f)
        };
        if let Err(err) = walk() {
            diag.error(err);
        }
    }

    /// Walks every chain of the image.
    pub fn for_each_chained_fixup<F>(&self, diag: &mut Diagnostics, f: F)
    where
        F: FnMut(&ChainedFixup) -> ControlFlow<()>,
    {
        if let Some(starts) = self.chain_starts(diag) {
            self.for_each_fixup_in_chains(diag, &starts, f);
        }
    }

    /// Collects every chained slot of the image.
    pub fn chained_fixups(&self, diag: &mut Diagnostics) -> Vec<ChainedFixup> {
        let mut out = Vec::new();
        self.for_each_chained_fixup(diag, |fixup| {
            out.push(*fixup);
            ControlFlow::Continue(())
        });
        out
    }

    fn walk_chains<F>(&self, info: &LinkEditInfo, starts: &ChainStarts, f: &mut F) -> Result<ControlFlow<()>>
    where
        F: FnMut(&ChainedFixup) -> ControlFlow<()>,
    {
        for seg_starts in &starts.segments {
            let i = seg_starts.segment_index;
            let format = seg_starts.pointer_format;
            let stride = chained_pointer_stride(format)
                .ok_or_else(|| malformed(format!("chained fixups, unknown pointer_format in segment #{}", i)))?;
            let seg = info
                .fixup_segment(i)
                .ok_or_else(|| malformed(format!("chained fixups, segment #{} cannot hold fixups", i)))?;
            let width = if is_32_bit_format(format) { 4 } else { 8 };
            trace!(
                "walking chains of {} (format {}, {} pages)",
                seg.name,
                format,
                seg_starts.page_count
            );

            for page in 0..seg_starts.page_count as usize {
                for start in seg_starts.chain_starts_in_page(page)? {
                    let mut offset = page as u64 * seg_starts.page_size as u64 + start as u64;
                    loop {
                        let beyond = || {
                            malformed(format!(
                                "chained fixup at offset 0x{:X} is beyond the content of segment #{}",
                                offset, i
                            ))
                        };
                        if greater_than_add_or_overflow(offset, width, seg.file_size) {
                            return Err(beyond());
                        }
                        let at = usize::try_from(seg.file_offset + offset).map_err(|_| beyond())?;
                        let raw = if width == 4 {
                            get_u32_le(self.data(), at).map(u64::from)
                        } else {
                            get_u64_le(self.data(), at)
                        }
                        .ok_or_else(beyond)?;
                        let (pointer, next) = ChainedPointer::decode(format, raw, seg_starts.max_valid_pointer)
                            .ok_or_else(|| {
                                malformed(format!("chained fixups, unknown pointer_format in segment #{}", i))
                            })?;
                        let fixup = ChainedFixup {
                            segment_index: i,
                            segment_offset: offset,
                            pointer_format: format,
                            raw,
                            pointer,
                        };
                        if f(&fixup).is_break() {
                            return Ok(ControlFlow::Break(()));
                        }
                        if next == 0 {
                            break;
                        }
                        offset += next * stride;
                    }
                }
            }
        }
        Ok(ControlFlow::Continue(()))
    }
}
