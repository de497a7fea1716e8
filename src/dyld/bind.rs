//! Bind opcode interpreter.
//!
//! LC_DYLD_INFO carries three bind streams sharing one opcode set. Regular
//! binds are applied at load, lazy binds on first call through a stub, and
//! weak binds coalesce weak definitions across images. Each stream starts
//! from its own defaults and rejects opcodes that make no sense for it.

use std::borrow::Cow;
use std::ops::ControlFlow;

use tracing::debug;

use super::fixup::{BindRecord, BindTarget, FixupContext, FixupKind, FixupLocation};
use crate::diag::Diagnostics;
use crate::error::{Error, Result};
use crate::macho::*;
use crate::util::{read_sleb128, read_uleb128};

/// Lazy streams end every bind with a DONE; linkers have emitted up to this
/// many extra ones.
const LAZY_DONE_SLACK: u32 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BindStream {
    Regular,
    Lazy,
    Weak,
}

impl BindStream {
    fn name(self) -> &'static str {
        match self {
            BindStream::Regular => "bind opcodes",
            BindStream::Lazy => "lazy bind opcodes",
            BindStream::Weak => "weak bind opcodes",
        }
    }
}

// =============================================================================
// Opcode Machine
// =============================================================================

struct BindMachine<'c, 'i, 'a> {
    ctx: &'c FixupContext<'i, 'a>,
    stream: BindStream,
    at: FixupLocation,
    symbol: Option<Cow<'a, str>>,
    ordinal: i32,
    ordinal_set: bool,
    bind_type: u8,
    addend: i64,
    weak_import: bool,
}

impl<'c, 'i, 'a> BindMachine<'c, 'i, 'a> {
    fn new(ctx: &'c FixupContext<'i, 'a>, stream: BindStream) -> Self {
        let (ordinal, ordinal_set, bind_type) = match stream {
            BindStream::Regular => (0, false, 0),
            BindStream::Lazy => (0, false, BIND_TYPE_POINTER),
            BindStream::Weak => (BIND_SPECIAL_DYLIB_WEAK_LOOKUP, true, BIND_TYPE_POINTER),
        };
        Self {
            ctx,
            stream,
            at: FixupLocation {
                segment_index: 0,
                segment_offset: 0,
                segment_set: false,
            },
            symbol: None,
            ordinal,
            ordinal_set,
            bind_type,
            addend: 0,
            weak_import: false,
        }
    }

    /// Validates and emits one bind at the cursor.
    fn emit<F>(&self, op: &str, f: &mut F) -> Result<ControlFlow<()>>
    where
        F: FnMut(&BindRecord<'a>) -> ControlFlow<()>,
    {
        let target = BindTarget {
            symbol: self.symbol.as_deref(),
            ordinal: self.ordinal,
            ordinal_set: self.ordinal_set,
            bind_type: self.bind_type,
        };
        self.ctx.check_bind(op, &self.at, &target)?;
        let record = BindRecord {
            segment_index: self.at.segment_index,
            segment_offset: self.at.segment_offset,
            runtime_offset: self.ctx.runtime_offset(self.at.segment_index, self.at.segment_offset),
            kind: FixupKind::from_raw(self.bind_type, self.ctx.is_64()),
            symbol_name: self.symbol.clone().unwrap_or_default(),
            ordinal: self.ordinal,
            addend: self.addend,
            weak_import: self.weak_import,
            lazy: self.stream == BindStream::Lazy,
        };
        Ok(f(&record))
    }

    fn advance(&mut self, op: &str, delta: u64) -> Result<()> {
        self.at.segment_offset = self
            .at
            .segment_offset
            .checked_add(delta)
            .ok_or_else(|| Error::MalformedFixup(format!("{} segment offset overflows", op)))?;
        Ok(())
    }

    /// Reads the NUL-terminated symbol name following a set-symbol opcode.
    fn read_symbol(opcodes: &'a [u8], p: &mut usize) -> Result<Cow<'a, str>> {
        let rest = &opcodes[*p..];
        let Some(len) = memchr::memchr(0, rest) else {
            return Err(Error::MalformedFixup(
                "BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM symbol name extends beyond end of opcodes".into(),
            ));
        };
        *p += len + 1;
        Ok(String::from_utf8_lossy(&rest[..len]))
    }

    fn set_ordinal(&mut self, ordinal: i32) -> Result<()> {
        if self.stream == BindStream::Weak {
            return Err(Error::MalformedFixup("unexpected dylib ordinal in weak_bind".into()));
        }
        self.ordinal = ordinal;
        self.ordinal_set = true;
        Ok(())
    }

    fn bad_opcode(&self, byte: u8) -> Error {
        match self.stream {
            BindStream::Lazy => Error::MalformedFixup(format!("bad lazy bind opcode 0x{:02X}", byte)),
            _ => Error::MalformedFixup(format!("bad bind opcode 0x{:02X}", byte)),
        }
    }

    fn run<F, S>(&mut self, opcodes: &'a [u8], on_bind: &mut F, on_strong: &mut S) -> Result<ControlFlow<()>>
    where
        F: FnMut(&BindRecord<'a>) -> ControlFlow<()>,
        S: FnMut(&str),
    {
        let ptr = self.ctx.pointer_size as u64;
        let lazy = self.stream == BindStream::Lazy;
        let end = opcodes.len();
        let mut lazy_done = 0u32;
        let mut lazy_binds = 0u32;
        let mut p = 0usize;
        while p < end {
            let byte = opcodes[p];
            let immediate = byte & BIND_IMMEDIATE_MASK;
            let opcode = byte & BIND_OPCODE_MASK;
            p += 1;
            let flow = match opcode {
                BIND_OPCODE_DONE if lazy => {
                    // each lazy bind is terminated individually
                    lazy_done += 1;
                    ControlFlow::Continue(())
                }
                BIND_OPCODE_DONE => return Ok(ControlFlow::Continue(())),
                BIND_OPCODE_SET_DYLIB_ORDINAL_IMM => {
                    self.set_ordinal(immediate as i32)?;
                    ControlFlow::Continue(())
                }
                BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB => {
                    let ordinal = read_uleb128(opcodes, &mut p, end)?;
                    self.set_ordinal(ordinal as i32)?;
                    ControlFlow::Continue(())
                }
                BIND_OPCODE_SET_DYLIB_SPECIAL_IMM => {
                    // special ordinals are small negative numbers
                    let ordinal = if immediate == 0 {
                        0
                    } else {
                        (BIND_OPCODE_MASK | immediate) as i8 as i32
                    };
                    self.set_ordinal(ordinal)?;
                    ControlFlow::Continue(())
                }
                BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM => {
                    self.weak_import = immediate & BIND_SYMBOL_FLAGS_WEAK_IMPORT != 0;
                    let name = Self::read_symbol(opcodes, &mut p)?;
                    if self.stream == BindStream::Weak && immediate & BIND_SYMBOL_FLAGS_NON_WEAK_DEFINITION != 0 {
                        on_strong(&name);
                    }
                    self.symbol = Some(name);
                    ControlFlow::Continue(())
                }
                BIND_OPCODE_SET_TYPE_IMM if !lazy => {
                    self.bind_type = immediate;
                    ControlFlow::Continue(())
                }
                BIND_OPCODE_SET_ADDEND_SLEB => {
                    self.addend = read_sleb128(opcodes, &mut p, end)?;
                    ControlFlow::Continue(())
                }
                BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB => {
                    self.at.segment_index = immediate as u32;
                    self.at.segment_offset = read_uleb128(opcodes, &mut p, end)?;
                    self.at.segment_set = true;
                    ControlFlow::Continue(())
                }
                BIND_OPCODE_ADD_ADDR_ULEB if !lazy => {
                    let delta = read_uleb128(opcodes, &mut p, end)?;
                    self.at.segment_offset = self.at.segment_offset.wrapping_add(delta);
                    ControlFlow::Continue(())
                }
                BIND_OPCODE_DO_BIND => {
                    let op = "BIND_OPCODE_DO_BIND";
                    let flow = self.emit(op, on_bind)?;
                    self.advance(op, ptr)?;
                    lazy_binds += 1;
                    flow
                }
                BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB if !lazy => {
                    let op = "BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB";
                    let flow = self.emit(op, on_bind)?;
                    let delta = read_uleb128(opcodes, &mut p, end)?;
                    self.advance(op, delta.wrapping_add(ptr))?;
                    flow
                }
                BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED if !lazy => {
                    let op = "BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED";
                    let flow = self.emit(op, on_bind)?;
                    self.advance(op, immediate as u64 * ptr + ptr)?;
                    flow
                }
                BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB if !lazy => {
                    let op = "BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB";
                    let count = read_uleb128(opcodes, &mut p, end)?;
                    let skip = read_uleb128(opcodes, &mut p, end)?;
                    let stride = skip
                        .checked_add(ptr)
                        .ok_or_else(|| Error::MalformedFixup(format!("{} skip too large", op)))?;
                    let mut flow = ControlFlow::Continue(());
                    for _ in 0..count {
                        flow = self.emit(op, on_bind)?;
                        self.advance(op, stride)?;
                        if flow.is_break() {
                            break;
                        }
                    }
                    flow
                }
                _ if lazy => return Err(self.bad_opcode(opcode)),
                _ => return Err(self.bad_opcode(byte)),
            };
            if flow.is_break() {
                return Ok(ControlFlow::Break(()));
            }
        }
        if lazy && lazy_done > lazy_binds + LAZY_DONE_SLACK {
            debug!(
                "lazy bind opcodes have {} terminators for {} binds",
                lazy_done, lazy_binds
            );
        }
        Ok(ControlFlow::Continue(()))
    }
}

// =============================================================================
// Bind Walks
// =============================================================================

impl<'a> MachOImage<'a> {
    /// Calls `on_bind` for every bind the image declares and `on_strong` for
    /// every weak-bind symbol marked as a non-weak definition.
    ///
    /// With LC_DYLD_INFO the regular, lazy and weak streams are walked in
    /// that order. Images with chained fixups carry their binds in the chains
    /// and yield nothing here. Older images fall back to external relocations
    /// and the indirect symbol table.
    ///
    /// Every record is validated before `on_bind` sees it. The first invalid
    /// one is recorded in `diag` and ends the walk.
    pub fn for_each_bind<F, S>(&self, diag: &mut Diagnostics, mut on_bind: F, mut on_strong: S)
    where
        F: FnMut(&BindRecord<'a>) -> ControlFlow<()>,
        S: FnMut(&str),
    {
        let ctx = match FixupContext::new(self) {
            Ok(ctx) => ctx,
            Err(err) => return diag.error(err),
        };

        if let Some(dyld_info) = ctx.info.dyld_info {
            let streams = [
                (BindStream::Regular, dyld_info.bind_off, dyld_info.bind_size),
                (BindStream::Lazy, dyld_info.lazy_bind_off, dyld_info.lazy_bind_size),
                (BindStream::Weak, dyld_info.weak_bind_off, dyld_info.weak_bind_size),
            ];
            for (stream, offset, size) in streams {
                if size == 0 {
                    continue;
                }
                let opcodes = match self.linkedit_blob(stream.name(), offset, size as u64) {
                    Ok(opcodes) => opcodes,
                    Err(err) => return diag.error(err),
                };
                debug!("walking {} bytes of {}", opcodes.len(), stream.name());
                let mut machine = BindMachine::new(&ctx, stream);
                match machine.run(opcodes, &mut on_bind, &mut on_strong) {
                    Ok(ControlFlow::Continue(())) => {}
                    Ok(ControlFlow::Break(())) => return,
                    Err(err) => return diag.error(err),
                }
            }
            return;
        }

        if ctx.info.chained_fixups.is_some() {
            return;
        }

        if ctx.info.dysymtab.is_some() {
            if self.for_each_external_relocation(&ctx, diag, &mut on_bind).is_break() || diag.has_error() {
                return;
            }
            self.for_each_indirect_bind(&ctx, diag, &mut on_bind);
        }
    }

    /// Collects every bind. Stops at the first error.
    pub fn binds(&self, diag: &mut Diagnostics) -> Vec<BindRecord<'a>> {
        let mut out = Vec::new();
        self.for_each_bind(
            diag,
            |b| {
                out.push(b.clone());
                ControlFlow::Continue(())
            },
            |_| {},
        );
        out
    }

    /// Symbols the weak-bind stream declares as non-weak definitions.
    pub fn strong_symbols(&self, diag: &mut Diagnostics) -> Vec<String> {
        let mut out = Vec::new();
        self.for_each_bind(diag, |_| ControlFlow::Continue(()), |name| out.push(name.to_string()));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{BindStream as Opcodes, ImageBuilder};

    fn binds_of(builder: &ImageBuilder) -> (Vec<BindRecord<'static>>, Diagnostics) {
        let data = builder.build();
        let image = MachOImage::parse(&data).unwrap();
        let mut diag = Diagnostics::new();
        let out = image.binds(&mut diag).into_iter().map(BindRecord::into_owned).collect();
        (out, diag)
    }

    #[test]
    fn test_default_bind() {
        let builder = ImageBuilder::dylib_arm64();
        let (binds, diag) = binds_of(&builder);
        assert!(diag.no_error(), "{}", diag.error_message());
        assert_eq!(binds.len(), 1);
        let bind = &binds[0];
        assert_eq!(bind.symbol_name, "_malloc");
        assert_eq!(bind.library(), Some(crate::dyld::LibraryOrdinal::Dylib(1)));
        assert_eq!((bind.segment_index, bind.segment_offset), (1, 8));
        assert_eq!(bind.runtime_offset, builder.page_size() + 8);
        assert_eq!(bind.kind, FixupKind::Pointer64);
        assert!(!bind.lazy && !bind.weak_import);
    }

    #[test]
    fn test_bind_without_symbol_emits_nothing() {
        let mut builder = ImageBuilder::dylib_arm64();
        builder.bind = Opcodes::new()
            .ordinal(1)
            .kind(BIND_TYPE_POINTER)
            .segment(1, 8)
            .do_bind()
            .done()
            .finish();
        let (binds, diag) = binds_of(&builder);
        assert!(binds.is_empty());
        assert_eq!(
            diag.error_message(),
            "BIND_OPCODE_DO_BIND missing preceding BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM"
        );
    }

    #[test]
    fn test_bind_without_ordinal() {
        let mut builder = ImageBuilder::dylib_arm64();
        builder.bind = Opcodes::new()
            .symbol("_malloc", 0)
            .kind(BIND_TYPE_POINTER)
            .segment(1, 8)
            .do_bind()
            .finish();
        let (_, diag) = binds_of(&builder);
        assert_eq!(
            diag.error_message(),
            "BIND_OPCODE_DO_BIND missing preceding BIND_OPCODE_SET_DYLIB_ORDINAL"
        );
    }

    #[test]
    fn test_ordinal_too_large() {
        let mut builder = ImageBuilder::dylib_arm64();
        builder.bind = Opcodes::new()
            .ordinal(2)
            .symbol("_malloc", 0)
            .kind(BIND_TYPE_POINTER)
            .segment(1, 8)
            .do_bind()
            .finish();
        let (_, diag) = binds_of(&builder);
        assert_eq!(
            diag.error_message(),
            "BIND_OPCODE_DO_BIND has library ordinal too large (2) max (1)"
        );
    }

    #[test]
    fn test_special_ordinals() {
        let mut builder = ImageBuilder::dylib_arm64();
        builder.bind = Opcodes::new()
            .symbol("_a", 0)
            .kind(BIND_TYPE_POINTER)
            .special(-1)
            .segment(1, 0x10)
            .do_bind()
            .special(-2)
            .do_bind()
            .special(0)
            .do_bind()
            .special(-4)
            .do_bind()
            .done()
            .finish();
        let (binds, diag) = binds_of(&builder);
        let ordinals: Vec<i32> = binds.iter().map(|b| b.ordinal).collect();
        assert_eq!(
            ordinals,
            vec![
                BIND_SPECIAL_DYLIB_MAIN_EXECUTABLE,
                BIND_SPECIAL_DYLIB_FLAT_LOOKUP,
                BIND_SPECIAL_DYLIB_SELF
            ]
        );
        assert_eq!(
            diag.error_message(),
            "BIND_OPCODE_DO_BIND has unknown library special ordinal (-4)"
        );
    }

    #[test]
    fn test_unknown_bind_type() {
        let mut builder = ImageBuilder::dylib_arm64();
        builder.bind = Opcodes::new()
            .ordinal(1)
            .symbol("_malloc", 0)
            .segment(1, 8)
            .do_bind()
            .finish();
        let (_, diag) = binds_of(&builder);
        assert_eq!(diag.error_message(), "BIND_OPCODE_DO_BIND unknown bind type 0");
    }

    #[test]
    fn test_bind_runs_and_addend() {
        let mut builder = ImageBuilder::dylib_arm64();
        builder.bind = Opcodes::new()
            .ordinal(1)
            .symbol("_malloc", BIND_SYMBOL_FLAGS_WEAK_IMPORT)
            .kind(BIND_TYPE_POINTER)
            .addend(-16)
            .segment(1, 0x20)
            .do_bind_times_skipping(3, 8)
            .raw(BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED | 2)
            .raw(BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB)
            .raw(0x10)
            .add_addr(8)
            .do_bind()
            .done()
            .finish();
        let (binds, diag) = binds_of(&builder);
        assert!(diag.no_error(), "{}", diag.error_message());
        let offsets: Vec<u64> = binds.iter().map(|b| b.segment_offset).collect();
        // 0x20 0x30 0x40 every 16 bytes, 0x50 then +24, 0x68 then +24, +8
        assert_eq!(offsets, vec![0x20, 0x30, 0x40, 0x50, 0x68, 0x88]);
        assert!(binds.iter().all(|b| b.addend == -16 && b.weak_import));
    }

    #[test]
    fn test_bad_bind_opcode() {
        let mut builder = ImageBuilder::dylib_arm64();
        builder.bind = Opcodes::new().raw(0xE3).finish();
        let (_, diag) = binds_of(&builder);
        assert_eq!(diag.error_message(), "bad bind opcode 0xE3");
    }

    #[test]
    fn test_threaded_opcode_outside_arm64e_walk() {
        let mut builder = ImageBuilder::dylib_arm64();
        builder.bind = Opcodes::new().threaded_table_size(1).finish();
        let (_, diag) = binds_of(&builder);
        assert_eq!(diag.error_message(), "bad bind opcode 0xD0");
    }

    #[test]
    fn test_unterminated_symbol() {
        let mut builder = ImageBuilder::dylib_arm64();
        builder.bind = vec![BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM, b'_', b'x'];
        let (_, diag) = binds_of(&builder);
        assert!(diag.error_message().contains("symbol name extends beyond end"));
    }

    #[test]
    fn test_lazy_binds() {
        let mut builder = ImageBuilder::dylib_arm64();
        builder.lazy_bind = Opcodes::new()
            .segment(1, 0x30)
            .ordinal(1)
            .symbol("_free", 0)
            .do_bind()
            .done()
            .segment(1, 0x38)
            .ordinal(1)
            .symbol("_calloc", 0)
            .do_bind()
            .done()
            .done()
            .done()
            .finish();
        let (binds, diag) = binds_of(&builder);
        assert!(diag.no_error(), "{}", diag.error_message());
        let lazy: Vec<(&str, u64)> = binds
            .iter()
            .filter(|b| b.lazy)
            .map(|b| (b.symbol_name.as_ref(), b.segment_offset))
            .collect();
        assert_eq!(lazy, vec![("_free", 0x30), ("_calloc", 0x38)]);
        // regular binds come first
        assert!(!binds[0].lazy);
    }

    #[test]
    fn test_lazy_stream_rejects_type_opcode() {
        let mut builder = ImageBuilder::dylib_arm64();
        builder.lazy_bind = Opcodes::new().kind(BIND_TYPE_POINTER).finish();
        let (_, diag) = binds_of(&builder);
        assert_eq!(diag.error_message(), "bad lazy bind opcode 0x50");
    }

    #[test]
    fn test_lazy_done_slack_is_tolerated() {
        let mut builder = ImageBuilder::dylib_arm64();
        builder.lazy_bind = vec![BIND_OPCODE_DONE; 16];
        let (binds, diag) = binds_of(&builder);
        assert!(diag.no_error());
        assert_eq!(binds.len(), 1);
    }

    #[test]
    fn test_weak_binds_and_strong_symbols() {
        let mut builder = ImageBuilder::dylib_arm64();
        builder.weak_bind = Opcodes::new()
            .symbol("__ZdlPv", 0)
            .kind(BIND_TYPE_POINTER)
            .segment(1, 0x40)
            .do_bind()
            .symbol("__Znwm", BIND_SYMBOL_FLAGS_NON_WEAK_DEFINITION)
            .done()
            .finish();
        let data = builder.build();
        let image = MachOImage::parse(&data).unwrap();
        let mut diag = Diagnostics::new();
        let binds = image.binds(&mut diag);
        let strong = image.strong_symbols(&mut diag);
        assert!(diag.no_error(), "{}", diag.error_message());
        assert_eq!(binds.len(), 2);
        assert_eq!(binds[1].symbol_name, "__ZdlPv");
        assert_eq!(binds[1].library(), Some(crate::dyld::LibraryOrdinal::WeakLookup));
        assert_eq!(strong, vec!["__Znwm".to_string()]);
    }

    #[test]
    fn test_weak_stream_rejects_ordinal() {
        let mut builder = ImageBuilder::dylib_arm64();
        builder.weak_bind = Opcodes::new().ordinal(1).finish();
        let (_, diag) = binds_of(&builder);
        assert_eq!(diag.error_message(), "unexpected dylib ordinal in weak_bind");
    }

    #[test]
    fn test_bind_in_text_segment() {
        let mut builder = ImageBuilder::dylib_arm64();
        builder.bind = Opcodes::new()
            .ordinal(1)
            .symbol("_malloc", 0)
            .kind(BIND_TYPE_POINTER)
            .segment(0, 0x800)
            .do_bind()
            .finish();
        let (_, diag) = binds_of(&builder);
        assert_eq!(
            diag.error_message(),
            "BIND_OPCODE_DO_BIND pointer bind is in non-writable segment"
        );
    }

    #[test]
    fn test_binds_are_repeatable() {
        let data = ImageBuilder::dylib_arm64().build();
        let image = MachOImage::parse(&data).unwrap();
        assert_eq!(
            image.binds(&mut Diagnostics::new()),
            image.binds(&mut Diagnostics::new())
        );
    }

    #[test]
    fn test_chained_images_have_no_opcode_binds() {
        let blob = crate::testutil::ChainedFixupsBlob::new(3).encode();
        let data = ImageBuilder::dylib_arm64().chained_fixups(blob).build();
        let image = MachOImage::parse(&data).unwrap();
        let mut diag = Diagnostics::new();
        assert!(image.binds(&mut diag).is_empty());
        assert!(image.rebases(&mut diag).is_empty());
        assert!(diag.no_error(), "{}", diag.error_message());
    }
}
