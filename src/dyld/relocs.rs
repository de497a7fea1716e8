//! Classic relocation fallback.
//!
//! Images linked before dyld info existed describe their fixups with
//! LC_DYSYMTAB relocation entries: local relocations for rebases and
//! external relocations for binds. Kernel collections may carry local
//! relocations next to chained fixups.

use std::borrow::Cow;
use std::ops::ControlFlow;

use tracing::debug;

use super::fixup::{BindRecord, BindTarget, FixupContext, FixupKind, FixupLocation, RebaseRecord};
use crate::analyzer::LinkEditInfo;
use crate::diag::Diagnostics;
use crate::error::{Error, Result};
use crate::macho::*;
use crate::util::{get_u32_le, get_u64_le};

impl<'a> MachOImage<'a> {
    /// Relocation entries of one LC_DYSYMTAB table.
    fn relocation_entries(&self, name: &str, offset: u32, count: u32) -> Result<Vec<RelocationInfo>> {
        let raw = self.linkedit_blob(name, offset, count as u64 * RelocationInfo::SIZE as u64)?;
        Ok((0..count as usize)
            .filter_map(|i| read_struct::<RelocationInfo>(raw, i * RelocationInfo::SIZE))
            .collect())
    }

    fn is_x86_64(&self) -> bool {
        self.cputype() == CPU_TYPE_X86_64
    }

    /// Address local relocation `r_address` values are relative to.
    fn local_reloc_base_address(&self, info: &LinkEditInfo) -> u64 {
        let segments = &info.segments[..(info.linkedit_index as usize).min(info.segments.len())];
        let first = segments.first().map_or(0, |s| s.vm_addr);
        if self.is_x86_64() && !self.is_kext_bundle() {
            if let Some(seg) = segments.iter().find(|s| s.writable()) {
                return seg.vm_addr;
            }
        }
        first
    }

    /// Address external relocation `r_address` values are relative to.
    fn external_reloc_base_address(&self, info: &LinkEditInfo) -> u64 {
        // cache images are too large for a raw r_address
        if self.in_dyld_cache() || self.is_kext_bundle() {
            return self.preferred_load_address();
        }
        if self.is_x86_64() {
            let segments = &info.segments[..(info.linkedit_index as usize).min(info.segments.len())];
            if let Some(seg) = segments.iter().find(|s| s.writable()) {
                return seg.vm_addr;
            }
        }
        0
    }

    /// Kernel collections mix 32-bit relocations into 64-bit images.
    fn allows_short_relocations(&self) -> bool {
        self.is_fileset() || self.is_kext_bundle()
    }

    /// Emits local relocations as rebases, sorted by address.
    pub(crate) fn for_each_local_relocation<F>(
        &self,
        ctx: &FixupContext<'_, 'a>,
        diag: &mut Diagnostics,
        mut f: F,
    ) -> ControlFlow<()>
    where
        F: FnMut(&RebaseRecord) -> ControlFlow<()>,
    {
        match self.walk_local_relocations(ctx, &mut f) {
            Ok(flow) => flow,
            Err(err) => {
                diag.error(err);
                ControlFlow::Break(())
            }
        }
    }

    fn walk_local_relocations<F>(&self, ctx: &FixupContext<'_, 'a>, f: &mut F) -> Result<ControlFlow<()>>
    where
        F: FnMut(&RebaseRecord) -> ControlFlow<()>,
    {
        const OP: &str = "local relocation";
        let Some(dysymtab) = ctx.info.dysymtab else {
            return Ok(ControlFlow::Continue(()));
        };
        let entries = self.relocation_entries("local relocations", dysymtab.locreloff, dysymtab.nlocrel)?;
        let reloc_length = if ctx.is_64() { 3 } else { 2 };

        let mut relocs = Vec::with_capacity(entries.len());
        for reloc in entries {
            if reloc.length() != reloc_length {
                let short_ok = self.allows_short_relocations() && reloc.length() == 2 && reloc_length == 3;
                if !short_ok {
                    return Err(Error::MalformedFixup(format!("{} has wrong r_length", OP)));
                }
            }
            if reloc.kind() != RELOC_UNSIGNED {
                return Err(Error::MalformedFixup(format!("{} has wrong r_type", OP)));
            }
            relocs.push(reloc);
        }
        relocs.sort_by_key(|r| r.r_address);
        debug!("walking {} local relocations", relocs.len());

        let base = self.local_reloc_base_address(&ctx.info);
        // xnu on x86_64 maps __HIB below __DATA, so offsets may be negative
        let signed = self.is_static_executable() || self.is_fileset();
        for reloc in relocs {
            let addr = if signed {
                base.wrapping_add_signed(reloc.r_address as i64)
            } else {
                base.wrapping_add(reloc.r_address as u32 as u64)
            };
            let Some((segment_index, segment_offset)) = ctx.segment_and_offset(addr) else {
                return Err(Error::MalformedFixup(format!("{} has out of range r_address", OP)));
            };
            let mut kind = if reloc.length() == 2 {
                FixupKind::Pointer32
            } else {
                FixupKind::Pointer64
            };
            if self.cputype() == CPU_TYPE_I386
                && ctx.info.segments.get(segment_index as usize).is_some_and(|s| s.executable())
            {
                kind = FixupKind::TextAbsolute32;
            }
            let at = FixupLocation {
                segment_index,
                segment_offset,
                segment_set: true,
            };
            ctx.check_rebase(OP, &at, kind)?;
            let record = RebaseRecord {
                segment_index,
                segment_offset,
                runtime_offset: ctx.runtime_offset(segment_index, segment_offset),
                kind,
            };
            if f(&record).is_break() {
                return Ok(ControlFlow::Break(()));
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    /// Emits external relocations as binds, in table order.
    pub(crate) fn for_each_external_relocation<F>(
        &self,
        ctx: &FixupContext<'_, 'a>,
        diag: &mut Diagnostics,
        mut f: F,
    ) -> ControlFlow<()>
    where
        F: FnMut(&BindRecord<'a>) -> ControlFlow<()>,
    {
        match self.walk_external_relocations(ctx, &mut f) {
            Ok(flow) => flow,
            Err(err) => {
                diag.error(err);
                ControlFlow::Break(())
            }
        }
    }

    fn walk_external_relocations<F>(&self, ctx: &FixupContext<'_, 'a>, f: &mut F) -> Result<ControlFlow<()>>
    where
        F: FnMut(&BindRecord<'a>) -> ControlFlow<()>,
    {
        const OP: &str = "external relocation";
        let Some(dysymtab) = ctx.info.dysymtab else {
            return Ok(ControlFlow::Continue(()));
        };
        let relocs = self.relocation_entries("external relocations", dysymtab.extreloff, dysymtab.nextrel)?;
        if relocs.is_empty() {
            return Ok(ControlFlow::Continue(()));
        }
        let symbols = self.symbol_table(&ctx.info)?;
        let reloc_length = if ctx.is_64() { 3 } else { 2 };
        let base = self.external_reloc_base_address(&ctx.info);
        // kexts may call imports directly
        let branches_allowed = self.is_kext_bundle() && self.is_x86_64();
        debug!("walking {} external relocations", relocs.len());

        for reloc in relocs {
            let is_branch = branches_allowed && reloc.kind() == X86_64_RELOC_BRANCH;
            if is_branch {
                if reloc.length() != 2 {
                    return Err(Error::MalformedFixup(format!("{} has wrong r_length", OP)));
                }
                if !reloc.pcrel() {
                    return Err(Error::MalformedFixup(format!("{} should be pcrel", OP)));
                }
            } else {
                if reloc.length() != reloc_length {
                    return Err(Error::MalformedFixup(format!("{} has wrong r_length", OP)));
                }
                if reloc.kind() != RELOC_UNSIGNED {
                    return Err(Error::MalformedFixup(format!("{} has wrong r_type", OP)));
                }
            }

            let addr = base.wrapping_add_signed(reloc.r_address as i64);
            let Some((segment_index, segment_offset)) = ctx.segment_and_offset(addr) else {
                return Err(Error::MalformedFixup(format!("{} has out of range r_address", OP)));
            };
            let symbol_index = reloc.symbolnum();
            let Some((table, symbol)) = symbols.and_then(|t| Some((t, t.get(symbol_index)?))) else {
                return Err(Error::MalformedFixup(format!("{} has out of range r_symbolnum", OP)));
            };
            let name = if symbol.n_strx < table.string_pool_size() {
                table.name(symbol.n_strx)
            } else {
                None
            };
            let Some(name) = name else {
                return Err(Error::MalformedFixup(format!(
                    "{} has r_symbolnum={} which has out of range n_strx",
                    OP, symbol_index
                )));
            };
            let ordinal = if symbol.is_defined_external() && symbol.is_weak_def() {
                BIND_SPECIAL_DYLIB_WEAK_LOOKUP
            } else {
                self.library_ordinal_from_desc(symbol.n_desc)
            };
            // the addend is stored inline at the fixup location
            let addend = if reloc.length() == 3 {
                self.segment_content(ctx, segment_index, segment_offset, 8)
            } else {
                self.segment_content(ctx, segment_index, segment_offset, 4)
            };
            let bind_type = if is_branch {
                BIND_TYPE_TEXT_PCREL32
            } else {
                BIND_TYPE_POINTER
            };

            let at = FixupLocation {
                segment_index,
                segment_offset,
                segment_set: true,
            };
            let target = BindTarget {
                symbol: Some(name),
                ordinal,
                ordinal_set: true,
                bind_type,
            };
            ctx.check_bind(OP, &at, &target)?;
            let record = BindRecord {
                segment_index,
                segment_offset,
                runtime_offset: ctx.runtime_offset(segment_index, segment_offset),
                kind: FixupKind::from_raw(bind_type, ctx.is_64()),
                symbol_name: Cow::Borrowed(name),
                ordinal,
                addend: addend as i64,
                weak_import: symbol.is_weak_ref(),
                lazy: false,
            };
            if f(&record).is_break() {
                return Ok(ControlFlow::Break(()));
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    /// Reads `width` bytes of file content at a segment location. The zero
    /// fill tail reads as 0.
    fn segment_content(&self, ctx: &FixupContext<'_, 'a>, segment_index: u32, segment_offset: u64, width: u64) -> u64 {
        let Some(seg) = ctx.info.segments.get(segment_index as usize) else {
            return 0;
        };
        if segment_offset.saturating_add(width) > seg.file_size {
            return 0;
        }
        let Ok(at) = usize::try_from(seg.file_offset + segment_offset) else {
            return 0;
        };
        let value = if width == 8 {
            get_u64_le(self.data(), at)
        } else {
            get_u32_le(self.data(), at).map(u64::from)
        };
        value.unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ImageBuilder;

    fn i386_symbols(mut builder: ImageBuilder) -> ImageBuilder {
        builder.symbol("_foo", N_SECT | N_EXT, 1, 0, 0x800);
        builder.symbol("_bar", N_SECT | N_EXT, 1, N_WEAK_DEF, 0x810);
        builder.symbol("_malloc", N_EXT, 0, 1 << 8, 0);
        builder
    }

    fn local(address: i32) -> RelocationInfo {
        RelocationInfo::new(address, 0, false, 2, false, RELOC_UNSIGNED)
    }

    fn external(address: i32, symbol: u32) -> RelocationInfo {
        RelocationInfo::new(address, symbol, false, 2, true, RELOC_UNSIGNED)
    }

    #[test]
    fn test_local_relocations_are_sorted() {
        let builder = ImageBuilder::dylib_i386().local_relocs(vec![local(0x1008), local(0x1000)]);
        let data = builder.build();
        let image = MachOImage::parse(&data).unwrap();
        let mut diag = Diagnostics::new();
        let rebases = image.rebases(&mut diag);
        assert!(diag.no_error(), "{}", diag.error_message());
        let offsets: Vec<(u32, u64, FixupKind)> = rebases
            .iter()
            .map(|r| (r.segment_index, r.segment_offset, r.kind))
            .collect();
        assert_eq!(
            offsets,
            vec![(1, 0, FixupKind::Pointer32), (1, 8, FixupKind::Pointer32)]
        );
        assert_eq!(rebases[1].runtime_offset, 0x1008);
    }

    #[test]
    fn test_local_relocation_wrong_length() {
        let reloc = RelocationInfo::new(0x1000, 0, false, 3, false, RELOC_UNSIGNED);
        let data = ImageBuilder::dylib_i386().local_relocs(vec![reloc]).build();
        let image = MachOImage::parse(&data).unwrap();
        let mut diag = Diagnostics::new();
        image.rebases(&mut diag);
        assert_eq!(diag.error_message(), "local relocation has wrong r_length");
    }

    #[test]
    fn test_local_relocation_wrong_type() {
        let reloc = RelocationInfo::new(0x1000, 0, false, 2, false, 1);
        let data = ImageBuilder::dylib_i386().local_relocs(vec![reloc]).build();
        let image = MachOImage::parse(&data).unwrap();
        let mut diag = Diagnostics::new();
        image.rebases(&mut diag);
        assert_eq!(diag.error_message(), "local relocation has wrong r_type");
    }

    #[test]
    fn test_local_relocation_out_of_range() {
        let data = ImageBuilder::dylib_i386().local_relocs(vec![local(0x10_0000)]).build();
        let image = MachOImage::parse(&data).unwrap();
        let mut diag = Diagnostics::new();
        image.rebases(&mut diag);
        assert_eq!(diag.error_message(), "local relocation has out of range r_address");
    }

    #[test]
    fn test_local_relocation_into_text_needs_text_relocs() {
        // __text has no relocation attributes, so __TEXT does not allow them
        let data = ImageBuilder::dylib_i386().local_relocs(vec![local(0x800)]).build();
        let image = MachOImage::parse(&data).unwrap();
        let mut diag = Diagnostics::new();
        image.rebases(&mut diag);
        assert_eq!(
            diag.error_message(),
            "local relocation text rebase is in segment that does not support text relocations"
        );
    }

    #[test]
    fn test_i386_text_relocation() {
        let mut builder = ImageBuilder::dylib_i386().local_relocs(vec![local(0x804)]);
        builder.section_mut("__TEXT", "__text").flags |= S_ATTR_LOC_RELOC;
        let data = builder.build();
        let image = MachOImage::parse(&data).unwrap();
        let mut diag = Diagnostics::new();
        let mut text = Vec::new();
        image.for_each_text_rebase(&mut diag, |offset| {
            text.push(offset);
            ControlFlow::Continue(())
        });
        assert!(diag.no_error(), "{}", diag.error_message());
        assert_eq!(text, vec![0x804]);
    }

    #[test]
    fn test_x86_64_local_base_is_first_writable_segment() {
        let mut builder = ImageBuilder::dylib_x86_64().clear_fixups();
        builder.dyld_info = false;
        let reloc = RelocationInfo::new(0x10, 0, false, 3, false, RELOC_UNSIGNED);
        let data = builder.local_relocs(vec![reloc]).build();
        let image = MachOImage::parse(&data).unwrap();
        let mut diag = Diagnostics::new();
        let rebases = image.rebases(&mut diag);
        assert!(diag.no_error(), "{}", diag.error_message());
        assert_eq!(rebases.len(), 1);
        assert_eq!(rebases[0].segment_index, 1);
        assert_eq!(rebases[0].segment_offset, 0x10);
        assert_eq!(rebases[0].kind, FixupKind::Pointer64);
    }

    #[test]
    fn test_external_relocations() {
        let builder = i386_symbols(
            ImageBuilder::dylib_i386()
                .external_relocs(vec![external(0x1010, 2), external(0x1014, 1)])
                .write_bytes("__DATA", 0x10, &7u32.to_le_bytes()),
        );
        let data = builder.build();
        let image = MachOImage::parse(&data).unwrap();
        let mut diag = Diagnostics::new();
        let binds = image.binds(&mut diag);
        assert!(diag.no_error(), "{}", diag.error_message());
        assert_eq!(binds.len(), 2);
        assert_eq!(binds[0].symbol_name, "_malloc");
        assert_eq!(binds[0].ordinal, 1);
        assert_eq!(binds[0].addend, 7);
        assert_eq!(binds[0].segment_offset, 0x10);
        assert_eq!(binds[0].kind, FixupKind::Pointer32);
        assert_eq!(binds[1].symbol_name, "_bar");
        assert_eq!(binds[1].ordinal, BIND_SPECIAL_DYLIB_WEAK_LOOKUP);
    }

    #[test]
    fn test_external_relocation_bad_symbol() {
        let builder = i386_symbols(ImageBuilder::dylib_i386().external_relocs(vec![external(0x1010, 3)]));
        let data = builder.build();
        let image = MachOImage::parse(&data).unwrap();
        let mut diag = Diagnostics::new();
        image.binds(&mut diag);
        assert_eq!(diag.error_message(), "external relocation has out of range r_symbolnum");
    }

    #[test]
    fn test_external_relocation_wrong_length() {
        let reloc = RelocationInfo::new(0x1010, 2, false, 3, true, RELOC_UNSIGNED);
        let builder = i386_symbols(ImageBuilder::dylib_i386().external_relocs(vec![reloc]));
        let data = builder.build();
        let image = MachOImage::parse(&data).unwrap();
        let mut diag = Diagnostics::new();
        image.binds(&mut diag);
        assert_eq!(diag.error_message(), "external relocation has wrong r_length");
    }

    #[test]
    fn test_external_relocation_in_text_segment() {
        let builder = i386_symbols(ImageBuilder::dylib_i386().external_relocs(vec![external(0x800, 2)]));
        let data = builder.build();
        let image = MachOImage::parse(&data).unwrap();
        let mut diag = Diagnostics::new();
        image.binds(&mut diag);
        assert_eq!(
            diag.error_message(),
            "external relocation pointer bind is in non-writable segment"
        );
    }

    #[test]
    fn test_indirect_symbols_follow_relocations() {
        let builder = i386_symbols(
            ImageBuilder::dylib_i386()
                .extra_section("__DATA", "__nl_symbol_ptr", 8, S_NON_LAZY_SYMBOL_POINTERS)
                .indirect_symbols(vec![INDIRECT_SYMBOL_LOCAL, 2])
                .local_relocs(vec![local(0x1000)]),
        );
        let data = builder.build();
        let image = MachOImage::parse(&data).unwrap();
        let mut diag = Diagnostics::new();
        let rebases = image.rebases(&mut diag);
        let binds = image.binds(&mut diag);
        assert!(diag.no_error(), "{}", diag.error_message());
        let rebase_offsets: Vec<u64> = rebases.iter().map(|r| r.segment_offset).collect();
        assert_eq!(rebase_offsets, vec![0, 0x100]);
        assert_eq!(binds.len(), 1);
        assert_eq!(binds[0].segment_offset, 0x104);
        assert_eq!(binds[0].symbol_name, "_malloc");
    }
}
