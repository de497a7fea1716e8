//! Rebase opcode interpreter.
//!
//! The rebase stream in LC_DYLD_INFO is a small byte code. Each opcode byte
//! carries the opcode in its high nibble and an immediate in its low nibble.
//! Opcodes either move the current (segment, offset) cursor or emit rebases
//! at it.

use std::ops::ControlFlow;

use tracing::debug;

use super::fixup::{FixupContext, FixupKind, FixupLocation, RebaseRecord};
use crate::diag::Diagnostics;
use crate::error::{Error, Result};
use crate::macho::*;
use crate::util::{get_pointer_le, read_uleb128};

/// Bytes allowed after REBASE_OPCODE_DONE before the stream counts as
/// terminated early. The linker pads the stream to pointer alignment.
const DONE_SLACK: usize = 8;

// =============================================================================
// Opcode Machine
// =============================================================================

struct RebaseMachine<'c, 'i, 'a, F> {
    ctx: &'c FixupContext<'i, 'a>,
    on_rebase: F,
    at: FixupLocation,
    kind: FixupKind,
}

impl<'c, 'i, 'a, F> RebaseMachine<'c, 'i, 'a, F>
where
    F: FnMut(&RebaseRecord) -> ControlFlow<()>,
{
    fn new(ctx: &'c FixupContext<'i, 'a>, on_rebase: F) -> Self {
        Self {
            ctx,
            on_rebase,
            at: FixupLocation {
                segment_index: 0,
                segment_offset: 0,
                segment_set: false,
            },
            kind: FixupKind::Unknown(0),
        }
    }

    /// Validates and emits one rebase at the cursor.
    fn emit(&mut self, op: &str) -> Result<ControlFlow<()>> {
        self.ctx.check_rebase(op, &self.at, self.kind)?;
        let record = RebaseRecord {
            segment_index: self.at.segment_index,
            segment_offset: self.at.segment_offset,
            runtime_offset: self.ctx.runtime_offset(self.at.segment_index, self.at.segment_offset),
            kind: self.kind,
        };
        Ok((self.on_rebase)(&record))
    }

    /// Moves the cursor forward after an emitted rebase.
    fn advance(&mut self, op: &str, delta: u64) -> Result<()> {
        self.at.segment_offset = self
            .at
            .segment_offset
            .checked_add(delta)
            .ok_or_else(|| Error::MalformedFixup(format!("{} segment offset overflows", op)))?;
        Ok(())
    }

    /// Emits `count` rebases, each followed by a step of `stride` bytes.
    fn emit_run(&mut self, op: &str, count: u64, stride: u64) -> Result<ControlFlow<()>> {
        for _ in 0..count {
            if self.emit(op)?.is_break() {
                return Ok(ControlFlow::Break(()));
            }
            self.advance(op, stride)?;
        }
        Ok(ControlFlow::Continue(()))
    }

    fn run(&mut self, opcodes: &[u8], diag: &mut Diagnostics) -> Result<()> {
        let ptr = self.ctx.pointer_size as u64;
        let end = opcodes.len();
        let mut p = 0usize;
        while p < end {
            let immediate = opcodes[p] & REBASE_IMMEDIATE_MASK;
            let opcode = opcodes[p] & REBASE_OPCODE_MASK;
            p += 1;
            let flow = match opcode {
                REBASE_OPCODE_DONE => {
                    if end - p > DONE_SLACK {
                        diag.warning(format!(
                            "rebase opcodes terminated early at offset {} of {}",
                            p, end
                        ));
                    }
                    return Ok(());
                }
                REBASE_OPCODE_SET_TYPE_IMM => {
                    self.kind = FixupKind::from_raw(immediate, self.ctx.is_64());
                    ControlFlow::Continue(())
                }
                REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB => {
                    self.at.segment_index = immediate as u32;
                    self.at.segment_offset = read_uleb128(opcodes, &mut p, end)?;
                    self.at.segment_set = true;
                    ControlFlow::Continue(())
                }
                REBASE_OPCODE_ADD_ADDR_ULEB => {
                    let delta = read_uleb128(opcodes, &mut p, end)?;
                    self.at.segment_offset = self.at.segment_offset.wrapping_add(delta);
                    ControlFlow::Continue(())
                }
                REBASE_OPCODE_ADD_ADDR_IMM_SCALED => {
                    self.at.segment_offset =
                        self.at.segment_offset.wrapping_add(immediate as u64 * ptr);
                    ControlFlow::Continue(())
                }
                REBASE_OPCODE_DO_REBASE_IMM_TIMES => {
                    self.emit_run("REBASE_OPCODE_DO_REBASE_IMM_TIMES", immediate as u64, ptr)?
                }
                REBASE_OPCODE_DO_REBASE_ULEB_TIMES => {
                    let count = read_uleb128(opcodes, &mut p, end)?;
                    self.emit_run("REBASE_OPCODE_DO_REBASE_ULEB_TIMES", count, ptr)?
                }
                REBASE_OPCODE_DO_REBASE_ADD_ADDR_ULEB => {
                    let op = "REBASE_OPCODE_DO_REBASE_ADD_ADDR_ULEB";
                    let flow = self.emit(op)?;
                    let delta = read_uleb128(opcodes, &mut p, end)?;
                    self.advance(op, delta.wrapping_add(ptr))?;
                    flow
                }
                REBASE_OPCODE_DO_REBASE_ULEB_TIMES_SKIPPING_ULEB => {
                    let count = read_uleb128(opcodes, &mut p, end)?;
                    let skip = read_uleb128(opcodes, &mut p, end)?;
                    let stride = skip.checked_add(ptr).ok_or_else(|| {
                        Error::MalformedFixup(
                            "REBASE_OPCODE_DO_REBASE_ULEB_TIMES_SKIPPING_ULEB skip too large".into(),
                        )
                    })?;
                    self.emit_run("REBASE_OPCODE_DO_REBASE_ULEB_TIMES_SKIPPING_ULEB", count, stride)?
                }
                _ => {
                    return Err(Error::MalformedFixup(format!(
                        "unknown rebase opcode 0x{:02X}",
                        opcode
                    )))
                }
            };
            if flow.is_break() {
                return Ok(());
            }
        }
        Ok(())
    }
}

// =============================================================================
// Rebase Walks
// =============================================================================

impl<'a> MachOImage<'a> {
    /// Calls `f` for every rebase the image declares, in stream order.
    ///
    /// The rebase opcodes are used when LC_DYLD_INFO is present. Images with
    /// chained fixups carry their rebases inside the chains and yield nothing
    /// here, except kernel collections which may also carry classic local
    /// relocations. Older images fall back to local relocations and the
    /// indirect symbol table.
    ///
    /// Every record is validated before `f` sees it. The first invalid one is
    /// recorded in `diag` and ends the walk.
    pub fn for_each_rebase<F>(&self, diag: &mut Diagnostics, mut f: F)
    where
        F: FnMut(&RebaseRecord) -> ControlFlow<()>,
    {
        let ctx = match FixupContext::new(self) {
            Ok(ctx) => ctx,
            Err(err) => return diag.error(err),
        };

        if let Some(dyld_info) = ctx.info.dyld_info {
            let opcodes = match self.linkedit_blob(
                "rebase opcodes",
                dyld_info.rebase_off,
                dyld_info.rebase_size as u64,
            ) {
                Ok(opcodes) => opcodes,
                Err(err) => return diag.error(err),
            };
            debug!("walking {} bytes of rebase opcodes", opcodes.len());
            let mut machine = RebaseMachine::new(&ctx, &mut f);
            if let Err(err) = machine.run(opcodes, diag) {
                diag.error(err);
            }
            return;
        }

        if ctx.info.chained_fixups.is_some() && !self.is_fileset() {
            return;
        }

        if ctx.info.dysymtab.is_some() {
            if self.for_each_local_relocation(&ctx, diag, &mut f).is_break() || diag.has_error() {
                return;
            }
            self.for_each_indirect_rebase(&ctx, diag, &mut f);
        }
    }

    /// Collects every rebase. Stops at the first error.
    pub fn rebases(&self, diag: &mut Diagnostics) -> Vec<RebaseRecord> {
        let mut out = Vec::new();
        self.for_each_rebase(diag, |r| {
            out.push(*r);
            ControlFlow::Continue(())
        });
        out
    }

    /// Calls `f` with the runtime offset of every pointer rebase and whether
    /// it is a lazy pointer still aimed at its stub helper trampoline.
    pub fn for_each_pointer_rebase<F>(&self, diag: &mut Diagnostics, mut f: F)
    where
        F: FnMut(u64, bool) -> ControlFlow<()>,
    {
        let mut lazy_pointers = 0..0;
        let mut stub_helper = 0..0;
        self.for_each_section(diag, |sect| {
            if sect.section_type() == S_LAZY_SYMBOL_POINTERS {
                lazy_pointers = sect.addr..sect.addr.wrapping_add(sect.size);
            } else if sect.flags & S_ATTR_PURE_INSTRUCTIONS != 0 && sect.name == "__stub_helper" {
                stub_helper = sect.addr..sect.addr.wrapping_add(sect.size);
            }
            ControlFlow::Continue(())
        });
        if diag.has_error() {
            return;
        }

        let segments = self.segments();
        let pointer_size = self.pointer_size();
        self.for_each_rebase(diag, |rebase| {
            if !rebase.kind.is_pointer() {
                return ControlFlow::Continue(());
            }
            let mut is_lazy = false;
            if let Some(seg) = segments.get(rebase.segment_index as usize) {
                let addr = seg.vm_addr.wrapping_add(rebase.segment_offset);
                if lazy_pointers.contains(&addr) {
                    let value = self.read_pointer_at_vm_addr(addr, pointer_size).unwrap_or(0);
                    // a lazy pointer aimed elsewhere resolves a weak def and
                    // still needs its rebase
                    if stub_helper.contains(&value) {
                        is_lazy = self.content_is_regular_stub(value);
                    }
                }
            }
            f(rebase.runtime_offset, is_lazy)
        });
    }

    /// Runtime offsets of every pointer rebase, optionally without the lazy
    /// pointers that point into the stub helper.
    pub fn runtime_rebases(&self, diag: &mut Diagnostics, ignore_lazy_pointers: bool) -> Vec<u64> {
        let mut out = Vec::new();
        self.for_each_pointer_rebase(diag, |offset, is_lazy| {
            if !(is_lazy && ignore_lazy_pointers) {
                out.push(offset);
            }
            ControlFlow::Continue(())
        });
        out
    }

    /// Calls `f` with the runtime offset of every absolute text rebase.
    pub fn for_each_text_rebase<F>(&self, diag: &mut Diagnostics, mut f: F)
    where
        F: FnMut(u64) -> ControlFlow<()>,
    {
        self.for_each_rebase(diag, |rebase| {
            if rebase.kind != FixupKind::TextAbsolute32 {
                return ControlFlow::Continue(());
            }
            f(rebase.runtime_offset)
        });
    }

    /// Returns true if the lazy bind opcodes were zeroed out after linking.
    pub fn has_stomped_lazy_opcodes(&self) -> bool {
        let Ok(info) = self.linkedit_info() else {
            return false;
        };
        let Some(dyld_info) = info.dyld_info else {
            return false;
        };
        if dyld_info.lazy_bind_size <= 8 {
            return false;
        }
        self.linkedit_blob("lazy bind opcodes", dyld_info.lazy_bind_off, 8)
            .map(|head| head.iter().all(|&b| b == 0))
            .unwrap_or(false)
    }

    /// Returns true if the code at `addr` is the standard stub helper
    /// trampoline for this architecture.
    fn content_is_regular_stub(&self, addr: u64) -> bool {
        let Some(offset) = self.vm_addr_to_file_offset(addr) else {
            return false;
        };
        let Some(code) = usize::try_from(offset)
            .ok()
            .and_then(|at| self.data().get(at..at.checked_add(6)?))
        else {
            return false;
        };
        match self.cputype() {
            // push $imm; jmp rel32
            CPU_TYPE_X86_64 => code[0] == 0x68 && code[5] == 0xE9,
            // push $imm; jmp *rel32
            CPU_TYPE_I386 => code[0] == 0x68 && code[5] == 0xFF && code[2] == 0x26,
            // ldr ip, [pc, #0]
            CPU_TYPE_ARM => code[..4] == [0x00, 0xC0, 0x9F, 0xE5],
            // ldr w16, L0
            CPU_TYPE_ARM64 => code[..4] == [0x50, 0x00, 0x00, 0x18],
            _ => false,
        }
    }

    /// Reads a pointer-sized value at a vm address from the file content.
    pub(crate) fn read_pointer_at_vm_addr(&self, addr: u64, pointer_size: u32) -> Option<u64> {
        let offset = usize::try_from(self.vm_addr_to_file_offset(addr)?).ok()?;
        get_pointer_le(self.data(), offset, pointer_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::{validate, ValidationOptions};
    use crate::error::ErrorKind;
    use crate::testutil::ImageBuilder;

    fn rebases_of(builder: &ImageBuilder) -> (Vec<RebaseRecord>, Diagnostics) {
        let data = builder.build();
        let image = MachOImage::parse(&data).unwrap();
        let mut diag = Diagnostics::new();
        let out = image.rebases(&mut diag);
        (out, diag)
    }

    #[test]
    fn test_default_rebase() {
        let builder = ImageBuilder::dylib_arm64();
        let (rebases, diag) = rebases_of(&builder);
        assert!(diag.no_error(), "{}", diag.error_message());
        assert_eq!(
            rebases,
            vec![RebaseRecord {
                segment_index: 1,
                segment_offset: 0,
                runtime_offset: builder.page_size(),
                kind: FixupKind::Pointer64,
            }]
        );
    }

    #[test]
    fn test_rebase_runs() {
        let mut builder = ImageBuilder::dylib_arm64();
        builder.rebase = vec![
            REBASE_OPCODE_SET_TYPE_IMM | REBASE_TYPE_POINTER,
            REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | 1,
            0x10,
            REBASE_OPCODE_DO_REBASE_IMM_TIMES | 2,
            REBASE_OPCODE_ADD_ADDR_IMM_SCALED | 1,
            REBASE_OPCODE_DO_REBASE_ULEB_TIMES_SKIPPING_ULEB,
            2,
            8,
            REBASE_OPCODE_DO_REBASE_ADD_ADDR_ULEB,
            0x20,
            REBASE_OPCODE_DO_REBASE_ULEB_TIMES,
            1,
            REBASE_OPCODE_DONE,
        ];
        let (rebases, diag) = rebases_of(&builder);
        assert!(diag.no_error(), "{}", diag.error_message());
        let offsets: Vec<u64> = rebases.iter().map(|r| r.segment_offset).collect();
        // 0x10, 0x18, skip one pointer, 0x28 and 0x38 with 8-byte gaps,
        // 0x48 then +0x20+8, 0x70
        assert_eq!(offsets, vec![0x10, 0x18, 0x28, 0x38, 0x48, 0x70]);
    }

    #[test]
    fn test_early_termination_is_a_warning() {
        let mut builder = ImageBuilder::dylib_arm64();
        builder.rebase.extend_from_slice(&[0u8; 20]);
        let (rebases, diag) = rebases_of(&builder);
        assert!(diag.no_error());
        assert_eq!(rebases.len(), 1);
        assert_eq!(
            diag.warnings(),
            ["rebase opcodes terminated early at offset 5 of 25"]
        );
    }

    #[test]
    fn test_done_with_padding_is_silent() {
        let mut builder = ImageBuilder::dylib_arm64();
        builder.rebase.extend_from_slice(&[0u8; 3]);
        let (_, diag) = rebases_of(&builder);
        assert!(diag.warnings().is_empty());
    }

    #[test]
    fn test_unknown_opcode() {
        let mut builder = ImageBuilder::dylib_arm64();
        builder.rebase = vec![
            REBASE_OPCODE_SET_TYPE_IMM | REBASE_TYPE_POINTER,
            REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | 1,
            0,
            REBASE_OPCODE_DO_REBASE_IMM_TIMES | 1,
            0xE0,
            REBASE_OPCODE_DO_REBASE_IMM_TIMES | 1,
            REBASE_OPCODE_DONE,
        ];
        let (rebases, diag) = rebases_of(&builder);
        // the record before the bad opcode was already handed out
        assert_eq!(rebases.len(), 1);
        assert_eq!(diag.error_message(), "unknown rebase opcode 0xE0");
    }

    #[test]
    fn test_rebase_without_segment() {
        let mut builder = ImageBuilder::dylib_arm64();
        builder.rebase = vec![
            REBASE_OPCODE_SET_TYPE_IMM | REBASE_TYPE_POINTER,
            REBASE_OPCODE_DO_REBASE_IMM_TIMES | 1,
            REBASE_OPCODE_DONE,
        ];
        let (rebases, diag) = rebases_of(&builder);
        assert!(rebases.is_empty());
        assert_eq!(
            diag.error_message(),
            "REBASE_OPCODE_DO_REBASE_IMM_TIMES missing preceding REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB"
        );
    }

    #[test]
    fn test_rebase_into_linkedit() {
        let mut builder = ImageBuilder::dylib_arm64();
        builder.rebase[1] = REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | 2;
        let (_, diag) = rebases_of(&builder);
        assert_eq!(
            diag.error_message(),
            "REBASE_OPCODE_DO_REBASE_IMM_TIMES segment index 2 too large"
        );
    }

    #[test]
    fn test_rebase_beyond_segment() {
        let mut builder = ImageBuilder::dylib_arm64();
        // offset 0x3FFC is past the last full pointer in a 16KB segment
        builder.rebase = vec![
            REBASE_OPCODE_SET_TYPE_IMM | REBASE_TYPE_POINTER,
            REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | 1,
            0xFC,
            0x7F,
            REBASE_OPCODE_DO_REBASE_IMM_TIMES | 1,
            REBASE_OPCODE_DONE,
        ];
        let (_, diag) = rebases_of(&builder);
        assert_eq!(
            diag.error_message(),
            "REBASE_OPCODE_DO_REBASE_IMM_TIMES current segment offset 0x00003FFC beyond segment size (0x00004000)"
        );
    }

    #[test]
    fn test_rebase_in_text_segment() {
        let mut builder = ImageBuilder::dylib_arm64();
        builder.rebase[1] = REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB;
        let (_, diag) = rebases_of(&builder);
        assert_eq!(
            diag.error_message(),
            "REBASE_OPCODE_DO_REBASE_IMM_TIMES pointer rebase is in non-writable segment"
        );
        assert_eq!(diag.error_ref().map(|e| e.kind()), Some(ErrorKind::MalformedFixup));
    }

    #[test]
    fn test_unknown_rebase_type() {
        let mut builder = ImageBuilder::dylib_arm64();
        builder.rebase[0] = REBASE_OPCODE_SET_TYPE_IMM | 7;
        let (_, diag) = rebases_of(&builder);
        assert_eq!(
            diag.error_message(),
            "REBASE_OPCODE_DO_REBASE_IMM_TIMES unknown rebase type"
        );
    }

    #[test]
    fn test_truncated_uleb() {
        let mut builder = ImageBuilder::dylib_arm64();
        builder.rebase = vec![REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | 1, 0x80];
        let (_, diag) = rebases_of(&builder);
        assert_eq!(diag.error_message(), "malformed uleb128");
    }

    #[test]
    fn test_huge_repeat_count_stops_at_segment_end() {
        let mut builder = ImageBuilder::dylib_arm64();
        builder.rebase = vec![
            REBASE_OPCODE_SET_TYPE_IMM | REBASE_TYPE_POINTER,
            REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | 1,
            0,
            REBASE_OPCODE_DO_REBASE_ULEB_TIMES,
            0xFF,
            0xFF,
            0xFF,
            0xFF,
            0x0F,
            REBASE_OPCODE_DONE,
        ];
        let (rebases, diag) = rebases_of(&builder);
        assert_eq!(rebases.len() as u64, builder.page_size() / 8);
        assert!(diag.error_message().contains("beyond segment size"));
    }

    #[test]
    fn test_early_stop() {
        let mut builder = ImageBuilder::dylib_arm64();
        builder.rebase[3] = REBASE_OPCODE_DO_REBASE_IMM_TIMES | 4;
        let data = builder.build();
        let image = MachOImage::parse(&data).unwrap();
        let mut diag = Diagnostics::new();
        let mut seen = 0;
        image.for_each_rebase(&mut diag, |_| {
            seen += 1;
            ControlFlow::Break(())
        });
        assert_eq!(seen, 1);
        assert!(diag.no_error());
    }

    #[test]
    fn test_walks_are_repeatable() {
        let data = ImageBuilder::dylib_arm64().build();
        let image = MachOImage::parse(&data).unwrap();
        let first = image.rebases(&mut Diagnostics::new());
        let second = image.rebases(&mut Diagnostics::new());
        assert_eq!(first, second);
    }

    #[test]
    fn test_phase_two_accepts_default_image() {
        let data = ImageBuilder::dylib_arm64().build();
        let options = ValidationOptions::loader(GradedArchs::ARM64, Platform::MacOS);
        let mut validated = validate(&data, "/tmp/lib", &options).unwrap();
        let warnings = validated.validate_linkedit().unwrap();
        assert!(warnings.is_empty());
        assert!(validated.linkedit_valid());
    }

    #[test]
    fn test_phase_two_reports_rebase_errors_with_path() {
        let mut builder = ImageBuilder::dylib_arm64();
        builder.rebase[1] = REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB;
        let data = builder.build();
        let options = ValidationOptions::loader(GradedArchs::ARM64, Platform::MacOS);
        let mut validated = validate(&data, "/tmp/lib", &options).unwrap();
        let err = validated.validate_linkedit().unwrap_err();
        assert_eq!(
            err.to_string(),
            "in '/tmp/lib' REBASE_OPCODE_DO_REBASE_IMM_TIMES pointer rebase is in non-writable segment"
        );
    }

    #[test]
    fn test_lazy_pointer_into_stub_helper() {
        let builder = ImageBuilder::dylib_arm64()
            .extra_section("__TEXT", "__stub_helper", 0x20, S_REGULAR | S_ATTR_PURE_INSTRUCTIONS)
            .extra_section("__DATA", "__la_symbol_ptr", 0x10, S_LAZY_SYMBOL_POINTERS);
        let page = builder.page_size();
        // __text ends at page/2 + 0x100, __data at page + 0x100
        let helper = page / 2 + 0x100;
        let lazy = 0x100;
        let mut builder = builder
            .write_bytes("__TEXT", helper, &[0x50, 0x00, 0x00, 0x18, 0, 0])
            .write_pointer("__DATA", lazy, helper)
            .write_pointer("__DATA", lazy + 8, 0x1234);
        builder.rebase = vec![
            REBASE_OPCODE_SET_TYPE_IMM | REBASE_TYPE_POINTER,
            REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | 1,
            0,
            REBASE_OPCODE_DO_REBASE_IMM_TIMES | 1,
            REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | 1,
            0x80,
            0x02,
            REBASE_OPCODE_DO_REBASE_IMM_TIMES | 2,
            REBASE_OPCODE_DONE,
        ];
        let data = builder.build();
        let image = MachOImage::parse(&data).unwrap();
        let mut diag = Diagnostics::new();
        let all = image.runtime_rebases(&mut diag, false);
        let filtered = image.runtime_rebases(&mut diag, true);
        assert!(diag.no_error(), "{}", diag.error_message());
        assert_eq!(all, vec![page, page + lazy, page + lazy + 8]);
        // the second lazy pointer targets a weak def, not the helper
        assert_eq!(filtered, vec![page, page + lazy + 8]);
    }

    #[test]
    fn test_stomped_lazy_opcodes() {
        let mut builder = ImageBuilder::dylib_arm64();
        builder.lazy_bind = vec![0u8; 16];
        let data = builder.build();
        assert!(MachOImage::parse(&data).unwrap().has_stomped_lazy_opcodes());

        builder.lazy_bind = vec![BIND_OPCODE_DONE; 4];
        let data = builder.build();
        assert!(!MachOImage::parse(&data).unwrap().has_stomped_lazy_opcodes());
    }
}
