//! Threaded binds of pre-release arm64e images.
//!
//! Before LC_DYLD_CHAINED_FIXUPS existed, arm64e images kept the fixup
//! chains in their data pages but described them through the regular bind
//! opcode stream. `BIND_OPCODE_THREADED` declares the size of the bind target
//! table, every `BIND_OPCODE_DO_BIND` appends one target, and
//! `BIND_SUBOPCODE_THREADED_APPLY` marks where a chain starts.

use std::borrow::Cow;
use std::ops::ControlFlow;

use tracing::debug;

use super::chained::{ChainStarts, ChainedImport, SegmentChainStarts};
use crate::analyzer::LinkEditInfo;
use crate::diag::Diagnostics;
use crate::error::{Error, Result};
use crate::macho::*;
use crate::util::{read_sleb128, read_uleb128};

/// Largest target table a threaded stream may declare.
const MAX_THREADED_TARGETS: u64 = 65535;

/// Threaded chains are described in 4KB pages regardless of the hardware
/// page size.
const THREADED_PAGE_SIZE: u64 = 0x1000;

/// What the threaded bind stream declares, in stream order.
enum ThreadedEvent<'a> {
    TableSize(u64),
    Target {
        symbol: Option<Cow<'a, str>>,
        ordinal: i32,
        ordinal_set: bool,
        bind_type: u8,
        addend: i64,
        weak_import: bool,
    },
    ChainStart {
        segment_index: u8,
        segment_set: bool,
        segment_offset: u64,
    },
}

/// Interprets the bind stream of an old arm64e image.
fn parse_threaded<'a, F>(opcodes: &'a [u8], mut on_event: F) -> Result<ControlFlow<()>>
where
    F: FnMut(ThreadedEvent<'a>) -> Result<ControlFlow<()>>,
{
    let end = opcodes.len();
    let mut p = 0usize;
    let mut bind_type = 0u8;
    let mut segment_offset = 0u64;
    let mut segment_index = 0u8;
    let mut segment_set = false;
    let mut symbol: Option<Cow<'a, str>> = None;
    let mut ordinal = 0i32;
    let mut ordinal_set = false;
    let mut addend = 0i64;
    let mut weak_import = false;

    while p < end {
        let byte = opcodes[p];
        let immediate = byte & BIND_IMMEDIATE_MASK;
        let opcode = byte & BIND_OPCODE_MASK;
        p += 1;
        let flow = match opcode {
            BIND_OPCODE_DONE => return Ok(ControlFlow::Continue(())),
            BIND_OPCODE_SET_DYLIB_ORDINAL_IMM => {
                ordinal = immediate as i32;
                ordinal_set = true;
                ControlFlow::Continue(())
            }
            BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB => {
                ordinal = read_uleb128(opcodes, &mut p, end)? as i32;
                ordinal_set = true;
                ControlFlow::Continue(())
            }
            BIND_OPCODE_SET_DYLIB_SPECIAL_IMM => {
                ordinal = if immediate == 0 {
                    0
                } else {
                    (BIND_OPCODE_MASK | immediate) as i8 as i32
                };
                ordinal_set = true;
                ControlFlow::Continue(())
            }
            BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM => {
                weak_import = immediate & BIND_SYMBOL_FLAGS_WEAK_IMPORT != 0;
                let rest = &opcodes[p..];
                let len = memchr::memchr(0, rest).ok_or_else(|| {
                    Error::MalformedFixup(
                        "BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM symbol name extends beyond end of opcodes".into(),
                    )
                })?;
                symbol = Some(String::from_utf8_lossy(&rest[..len]));
                p += len + 1;
                ControlFlow::Continue(())
            }
            BIND_OPCODE_SET_TYPE_IMM => {
                bind_type = immediate;
                ControlFlow::Continue(())
            }
            BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB => {
                segment_index = immediate;
                segment_offset = read_uleb128(opcodes, &mut p, end)?;
                segment_set = true;
                ControlFlow::Continue(())
            }
            BIND_OPCODE_SET_ADDEND_SLEB => {
                addend = read_sleb128(opcodes, &mut p, end)?;
                ControlFlow::Continue(())
            }
            BIND_OPCODE_DO_BIND => on_event(ThreadedEvent::Target {
                symbol: symbol.clone(),
                ordinal,
                ordinal_set,
                bind_type,
                addend,
                weak_import,
            })?,
            BIND_OPCODE_THREADED => match immediate {
                BIND_SUBOPCODE_THREADED_SET_BIND_ORDINAL_TABLE_SIZE_ULEB => {
                    let count = read_uleb128(opcodes, &mut p, end)?;
                    if count > MAX_THREADED_TARGETS {
                        return Err(Error::MalformedFixup(
                            "BIND_SUBOPCODE_THREADED_SET_BIND_ORDINAL_TABLE_SIZE_ULEB size too large".into(),
                        ));
                    }
                    on_event(ThreadedEvent::TableSize(count))?
                }
                BIND_SUBOPCODE_THREADED_APPLY => on_event(ThreadedEvent::ChainStart {
                    segment_index,
                    segment_set,
                    segment_offset,
                })?,
                other => {
                    return Err(Error::MalformedFixup(format!(
                        "bad BIND_OPCODE_THREADED sub-opcode 0x{:02X}",
                        other
                    )))
                }
            },
            _ => return Err(Error::MalformedFixup(format!("bad bind opcode 0x{:02X}", byte))),
        };
        if flow.is_break() {
            return Ok(ControlFlow::Break(()));
        }
    }
    Ok(ControlFlow::Continue(()))
}

impl<'a> MachOImage<'a> {
    fn threaded_opcodes(&self, info: &LinkEditInfo) -> Result<Option<&'a [u8]>> {
        let Some(dyld_info) = info.dyld_info else {
            return Ok(None);
        };
        self.linkedit_blob("bind opcodes", dyld_info.bind_off, dyld_info.bind_size as u64)
            .map(Some)
    }

    /// Checks the location of a `BIND_SUBOPCODE_THREADED_APPLY`.
    fn check_threaded_chain_start(
        &self,
        info: &LinkEditInfo,
        segment_index: u8,
        segment_set: bool,
        segment_offset: u64,
    ) -> Result<()> {
        let fail = |msg: String| Err(Error::MalformedFixup(msg));
        if !segment_set {
            return fail("missing BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB".into());
        }
        let Some(seg) = info.fixup_segment(segment_index as u32) else {
            return fail(format!("segment index {} too large", segment_index));
        };
        if seg.vm_size < 8 || segment_offset > seg.vm_size - 8 {
            return fail(format!(
                "current segment offset 0x{:08X} beyond segment size (0x{:08X})",
                segment_offset, seg.vm_size
            ));
        }
        if !seg.writable() {
            return fail("pointer bind is in non-writable segment".into());
        }
        if seg.executable() {
            return fail("pointer bind is in executable segment".into());
        }
        Ok(())
    }

    /// Validates the threaded bind stream of an old arm64e image: every
    /// target must be complete, no more targets than the declared table
    /// size, and every chain must start inside a writable data segment.
    pub fn validate_threaded_binds(&self, diag: &mut Diagnostics) {
        let check = || -> Result<()> {
            let info = self.linkedit_info()?;
            let Some(opcodes) = self.threaded_opcodes(&info)? else {
                return Ok(());
            };
            let dylib_count = self.dependent_dylib_count() as i32;
            // no declared table size admits no targets
            let mut table_size = 0u64;
            let mut targets = 0u64;
            parse_threaded(opcodes, |event| {
                let fail = |msg: String| Err(Error::MalformedFixup(msg));
                match event {
                    ThreadedEvent::TableSize(count) => table_size = count,
                    ThreadedEvent::Target {
                        symbol,
                        ordinal,
                        ordinal_set,
                        bind_type,
                        ..
                    } => {
                        if symbol.is_none() {
                            return fail("missing BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM".into());
                        }
                        if !ordinal_set {
                            return fail("missing BIND_OPCODE_SET_DYLIB_ORDINAL".into());
                        }
                        if ordinal > dylib_count {
                            return fail(format!(
                                "has library ordinal too large ({}) max ({})",
                                ordinal, dylib_count
                            ));
                        }
                        if ordinal < BIND_SPECIAL_DYLIB_WEAK_LOOKUP {
                            return fail(format!("has unknown library special ordinal ({})", ordinal));
                        }
                        if bind_type != BIND_TYPE_POINTER {
                            return fail(format!("unknown bind type {}", bind_type));
                        }
                        if targets >= table_size {
                            return fail(
                                "chained target counts exceeds BIND_SUBOPCODE_THREADED_SET_BIND_ORDINAL_TABLE_SIZE_ULEB"
                                    .into(),
                            );
                        }
                        targets += 1;
                    }
                    ThreadedEvent::ChainStart {
                        segment_index,
                        segment_set,
                        segment_offset,
                    } => self.check_threaded_chain_start(&info, segment_index, segment_set, segment_offset)?,
                }
                Ok(ControlFlow::Continue(()))
            })?;
            debug!("threaded binds: {} targets", targets);
            Ok(())
        };
        if let Err(err) = check() {
            diag.error(err);
        }
    }

    /// Bind targets of the threaded stream, in table order.
    pub(crate) fn walk_threaded_targets<F>(&self, info: &LinkEditInfo, f: &mut F) -> Result<ControlFlow<()>>
    where
        F: FnMut(&ChainedImport<'a>) -> ControlFlow<()>,
    {
        let Some(opcodes) = self.threaded_opcodes(info)? else {
            return Ok(ControlFlow::Continue(()));
        };
        parse_threaded(opcodes, |event| {
            let ThreadedEvent::Target {
                symbol,
                ordinal,
                addend,
                weak_import,
                ..
            } = event
            else {
                return Ok(ControlFlow::Continue(()));
            };
            let symbol_name = symbol.ok_or_else(|| {
                Error::MalformedFixup("missing BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM".into())
            })?;
            Ok(f(&ChainedImport {
                ordinal,
                symbol_name,
                addend,
                weak_import,
            }))
        })
    }

    /// Locations of every `BIND_SUBOPCODE_THREADED_APPLY` as (segment index,
    /// segment offset), in stream order.
    pub fn threaded_chain_starts(&self, diag: &mut Diagnostics) -> Vec<(u32, u64)> {
        let mut out = Vec::new();
        let walk = |out: &mut Vec<(u32, u64)>| -> Result<()> {
            let info = self.linkedit_info()?;
            let Some(opcodes) = self.threaded_opcodes(&info)? else {
                return Ok(());
            };
            parse_threaded(opcodes, |event| {
                if let ThreadedEvent::ChainStart {
                    segment_index,
                    segment_set,
                    segment_offset,
                } = event
                {
                    self.check_threaded_chain_start(&info, segment_index, segment_set, segment_offset)?;
                    out.push((segment_index as u32, segment_offset));
                }
                Ok(ControlFlow::Continue(()))
            })?;
            Ok(())
        };
        if let Err(err) = walk(&mut out) {
            diag.error(err);
        }
        out
    }

    /// Builds the starts table LC_DYLD_CHAINED_FIXUPS would carry for the
    /// chains of an old arm64e image. Segments and pages must appear in
    /// ascending order, one chain per page.
    ///
    /// This is stricter than the loader, which lets a later
    /// `BIND_SUBOPCODE_THREADED_APPLY` replace the start of a page and never
    /// fails here. A repeated or descending start is an error instead.
    pub(crate) fn synthesize_threaded_chain_starts(&self, info: &LinkEditInfo) -> Result<ChainStarts> {
        let mut starts = ChainStarts {
            seg_count: info.linkedit_index,
            segments: Vec::new(),
        };
        let Some(opcodes) = self.threaded_opcodes(info)? else {
            return Ok(starts);
        };
        let base = self.preferred_load_address();
        parse_threaded(opcodes, |event| {
            let ThreadedEvent::ChainStart {
                segment_index,
                segment_set,
                segment_offset,
            } = event
            else {
                return Ok(ControlFlow::Continue(()));
            };
            self.check_threaded_chain_start(info, segment_index, segment_set, segment_offset)?;
            let index = segment_index as u32;
            let out_of_order = || {
                Error::MalformedFixup(format!(
                    "BIND_SUBOPCODE_THREADED_APPLY at 0x{:X} in segment #{} is out of order",
                    segment_offset, index
                ))
            };
            match starts.segments.last().map(|s| s.segment_index) {
                Some(last) if last > index => return Err(out_of_order()),
                Some(last) if last == index => {}
                _ => {
                    let vm_addr = info.segments.get(index as usize).map(|s| s.vm_addr).unwrap_or(0);
                    starts.segments.push(SegmentChainStarts {
                        segment_index: index,
                        page_size: THREADED_PAGE_SIZE as u16,
                        pointer_format: DYLD_CHAINED_PTR_ARM64E,
                        segment_offset: vm_addr.wrapping_sub(base),
                        max_valid_pointer: 0,
                        page_count: 0,
                        page_starts: Vec::new(),
                    });
                }
            }
            let Some(seg) = starts.segments.last_mut() else {
                return Err(out_of_order());
            };
            let page = segment_offset / THREADED_PAGE_SIZE;
            if page < seg.page_starts.len() as u64 {
                return Err(out_of_order());
            }
            while (seg.page_starts.len() as u64) < page {
                seg.page_starts.push(DYLD_CHAINED_PTR_START_NONE);
            }
            seg.page_starts.push((segment_offset % THREADED_PAGE_SIZE) as u16);
            seg.page_count = seg.page_starts.len() as u16;
            Ok(ControlFlow::Continue(()))
        })?;
        Ok(starts)
    }
}
