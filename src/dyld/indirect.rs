//! Indirect symbol table walk.
//!
//! Symbol pointer sections and old i386 self-modifying stub sections name the
//! symbol of each slot through the indirect symbol table. Binaries without
//! dyld info get the binds and rebases of those slots from here.

use std::borrow::Cow;
use std::ops::ControlFlow;

use super::fixup::{BindRecord, BindTarget, FixupContext, FixupKind, FixupLocation, RebaseRecord};
use crate::diag::Diagnostics;
use crate::error::{Error, Result};
use crate::macho::*;
use crate::util::greater_than_add_or_overflow;

/// Stub size of an i386 self-modifying `jmp` stub.
const SELF_MODIFYING_STUB_SIZE: u32 = 5;

/// Import named by an indirect symbol table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndirectBind<'a> {
    pub ordinal: i32,
    pub symbol_name: &'a str,
    pub weak_import: bool,
    pub lazy: bool,
}

/// One slot of a symbol pointer or self-modifying stub section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndirectPointer<'a> {
    pub address: u64,
    /// `None` for `INDIRECT_SYMBOL_LOCAL` slots, which only need sliding
    pub bind: Option<IndirectBind<'a>>,
    pub self_modifying_stub: bool,
}

impl<'a> MachOImage<'a> {
    /// Calls `f` for every slot of every lazy or non-lazy symbol pointer
    /// section and every i386 self-modifying stub. Absolute slots are skipped.
    pub fn for_each_indirect_pointer<F>(&self, diag: &mut Diagnostics, mut f: F)
    where
        F: FnMut(&IndirectPointer<'a>) -> ControlFlow<()>,
    {
        if let Err(err) = self.walk_indirect_pointers(&mut f) {
            diag.error(err);
        }
    }

    /// Collects every indirect pointer.
    pub fn indirect_pointers(&self, diag: &mut Diagnostics) -> Vec<IndirectPointer<'a>> {
        let mut out = Vec::new();
        self.for_each_indirect_pointer(diag, |p| {
            out.push(*p);
            ControlFlow::Continue(())
        });
        out
    }

    fn walk_indirect_pointers<F>(&self, f: &mut F) -> Result<()>
    where
        F: FnMut(&IndirectPointer<'a>) -> ControlFlow<()>,
    {
        let info = self.linkedit_info()?;
        if info.dysymtab.is_none() {
            return Ok(());
        }
        let indirect = self.indirect_symbol_table(&info)?;
        // old kexts mark __got lazy without any indirect symbols
        if indirect.is_empty() && self.is_kext_bundle() {
            return Ok(());
        }
        let symbols = self.symbol_table(&info)?;
        let sym_count = symbols.map_or(0, |s| s.len());
        let pool_size = symbols.map_or(0, |s| s.string_pool_size());
        let pointer_size = self.pointer_size();

        for sect in self.sections() {
            let section_type = sect.section_type();
            let self_modifying_stub = section_type == S_SYMBOL_STUBS
                && sect.flags & S_ATTR_SELF_MODIFYING_CODE != 0
                && sect.reserved2 == SELF_MODIFYING_STUB_SIZE
                && self.cputype() == CPU_TYPE_I386;
            if section_type != S_LAZY_SYMBOL_POINTERS
                && section_type != S_NON_LAZY_SYMBOL_POINTERS
                && !self_modifying_stub
            {
                continue;
            }
            if sect.flags & S_ATTR_SELF_MODIFYING_CODE != 0 && !self_modifying_stub {
                return Err(Error::MalformedFixup(
                    "S_ATTR_SELF_MODIFYING_CODE section type only valid in old i386 binaries".into(),
                ));
            }
            let element_size = if self_modifying_stub {
                sect.reserved2
            } else {
                pointer_size
            };
            let element_count = sect.size / element_size as u64;
            if greater_than_add_or_overflow(sect.reserved1 as u64, element_count, indirect.len() as u64) {
                return Err(Error::MalformedFixup(format!(
                    "section {} overflows indirect symbol table",
                    sect.name
                )));
            }

            let lazy = section_type == S_LAZY_SYMBOL_POINTERS;
            for i in 0..element_count as u32 {
                let table_index = sect.reserved1 + i;
                let sym_num = indirect[table_index as usize];
                let address = sect.addr + i as u64 * element_size as u64;
                if sym_num == INDIRECT_SYMBOL_ABS {
                    continue;
                }
                let bind = if sym_num == INDIRECT_SYMBOL_LOCAL {
                    None
                } else {
                    let symbol = symbols.and_then(|t| t.get(sym_num)).filter(|_| sym_num < sym_count);
                    let Some(symbol) = symbol else {
                        return Err(Error::MalformedFixup(format!(
                            "indirect symbol[{}] = {} which is invalid symbol index",
                            table_index, sym_num
                        )));
                    };
                    let name = symbols
                        .filter(|_| symbol.n_strx < pool_size)
                        .and_then(|t| t.name(symbol.n_strx));
                    let Some(name) = name else {
                        return Err(Error::MalformedFixup(format!(
                            "symbol[{}] string offset out of range",
                            table_index
                        )));
                    };
                    let ordinal = if symbol.is_defined_external() && symbol.is_weak_def() {
                        BIND_SPECIAL_DYLIB_WEAK_LOOKUP
                    } else {
                        self.library_ordinal_from_desc(symbol.n_desc)
                    };
                    Some(IndirectBind {
                        ordinal,
                        symbol_name: name,
                        weak_import: symbol.is_weak_ref(),
                        lazy,
                    })
                };
                let pointer = IndirectPointer {
                    address,
                    bind,
                    self_modifying_stub,
                };
                if f(&pointer).is_break() {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Emits the slots that only need sliding as pointer rebases.
    pub(crate) fn for_each_indirect_rebase<F>(
        &self,
        ctx: &FixupContext<'_, 'a>,
        diag: &mut Diagnostics,
        mut f: F,
    ) -> ControlFlow<()>
    where
        F: FnMut(&RebaseRecord) -> ControlFlow<()>,
    {
        const OP: &str = "local relocation";
        let kind = FixupKind::pointer(ctx.pointer_size);
        let mut failure = None;
        let mut stopped = false;
        self.for_each_indirect_pointer(diag, |ptr| {
            if ptr.bind.is_some() {
                return ControlFlow::Continue(());
            }
            let Some((segment_index, segment_offset)) = ctx.segment_and_offset(ptr.address) else {
                failure = Some(Error::MalformedFixup(format!("{} has out of range r_address", OP)));
                return ControlFlow::Break(());
            };
            let at = FixupLocation {
                segment_index,
                segment_offset,
                segment_set: true,
            };
            if let Err(err) = ctx.check_rebase(OP, &at, kind) {
                failure = Some(err);
                return ControlFlow::Break(());
            }
            let flow = f(&RebaseRecord {
                segment_index,
                segment_offset,
                runtime_offset: ctx.runtime_offset(segment_index, segment_offset),
                kind,
            });
            stopped = flow.is_break();
            flow
        });
        if let Some(err) = failure {
            diag.error(err);
            return ControlFlow::Break(());
        }
        if stopped {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    }

    /// Emits the slots that name an import as pointer binds.
    pub(crate) fn for_each_indirect_bind<F>(
        &self,
        ctx: &FixupContext<'_, 'a>,
        diag: &mut Diagnostics,
        mut f: F,
    ) -> ControlFlow<()>
    where
        F: FnMut(&BindRecord<'a>) -> ControlFlow<()>,
    {
        const OP: &str = "indirect symbol";
        let mut failure = None;
        let mut stopped = false;
        self.for_each_indirect_pointer(diag, |ptr| {
            let Some(bind) = ptr.bind else {
                return ControlFlow::Continue(());
            };
            let Some((segment_index, segment_offset)) = ctx.segment_and_offset(ptr.address) else {
                failure = Some(Error::MalformedFixup(format!("{} has out of range address", OP)));
                return ControlFlow::Break(());
            };
            let at = FixupLocation {
                segment_index,
                segment_offset,
                segment_set: true,
            };
            let target = BindTarget {
                symbol: Some(bind.symbol_name),
                ordinal: bind.ordinal,
                ordinal_set: true,
                bind_type: BIND_TYPE_POINTER,
            };
            if let Err(err) = ctx.check_bind(OP, &at, &target) {
                failure = Some(err);
                return ControlFlow::Break(());
            }
            let flow = f(&BindRecord {
                segment_index,
                segment_offset,
                runtime_offset: ctx.runtime_offset(segment_index, segment_offset),
                kind: FixupKind::pointer(ctx.pointer_size),
                symbol_name: Cow::Borrowed(bind.symbol_name),
                ordinal: bind.ordinal,
                addend: 0,
                weak_import: bind.weak_import,
                lazy: bind.lazy,
            });
            stopped = flow.is_break();
            flow
        });
        if let Some(err) = failure {
            diag.error(err);
            return ControlFlow::Break(());
        }
        if stopped {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ImageBuilder;

    /// i386 image with a non-lazy pointer section of three slots: a local
    /// slot, `_malloc`, and an absolute slot.
    fn i386_with_got() -> ImageBuilder {
        ImageBuilder::dylib_i386()
            .extra_section("__DATA", "__nl_symbol_ptr", 12, S_NON_LAZY_SYMBOL_POINTERS)
            .indirect_symbols(vec![INDIRECT_SYMBOL_LOCAL, 2, INDIRECT_SYMBOL_ABS])
    }

    fn with_malloc(mut builder: ImageBuilder) -> ImageBuilder {
        builder.symbol("_foo", N_SECT | N_EXT, 1, 0, 0x800);
        builder.symbol("_bar", N_SECT | N_EXT, 1, 0, 0x810);
        builder.symbol("_malloc", N_EXT, 0, 1 << 8, 0);
        builder
    }

    #[test]
    fn test_indirect_pointers() {
        let data = with_malloc(i386_with_got()).build();
        let image = MachOImage::parse(&data).unwrap();
        let mut diag = Diagnostics::new();
        let pointers = image.indirect_pointers(&mut diag);
        assert!(diag.no_error(), "{}", diag.error_message());
        assert_eq!(pointers.len(), 2);
        assert_eq!(pointers[0].address, 0x1100);
        assert!(pointers[0].bind.is_none());
        let bind = pointers[1].bind.unwrap();
        assert_eq!(pointers[1].address, 0x1104);
        assert_eq!(bind.symbol_name, "_malloc");
        assert_eq!(bind.ordinal, 1);
        assert!(!bind.lazy);
        assert!(!bind.weak_import);
    }

    #[test]
    fn test_flat_namespace_ordinal() {
        let mut builder = with_malloc(i386_with_got());
        builder.flags &= !MachOFlags::TWOLEVEL.bits();
        let data = builder.build();
        let image = MachOImage::parse(&data).unwrap();
        let pointers = image.indirect_pointers(&mut Diagnostics::new());
        assert_eq!(pointers[1].bind.unwrap().ordinal, BIND_SPECIAL_DYLIB_FLAT_LOOKUP);
    }

    #[test]
    fn test_weak_def_uses_weak_lookup() {
        let mut builder = i386_with_got().indirect_symbols(vec![0, 1, 2]);
        builder.symbol("_foo", N_SECT | N_EXT, 1, N_WEAK_DEF, 0x800);
        builder.symbol("_bar", N_SECT | N_EXT, 1, 0, 0x810);
        builder.symbol("_malloc", N_EXT, 0, (1 << 8) | N_WEAK_REF, 0);
        let data = builder.build();
        let image = MachOImage::parse(&data).unwrap();
        let pointers = image.indirect_pointers(&mut Diagnostics::new());
        let ordinals: Vec<i32> = pointers.iter().map(|p| p.bind.unwrap().ordinal).collect();
        // a defined symbol without a library ordinal binds to the image itself
        assert_eq!(
            ordinals,
            vec![BIND_SPECIAL_DYLIB_WEAK_LOOKUP, BIND_SPECIAL_DYLIB_SELF, 1]
        );
        assert!(pointers[2].bind.unwrap().weak_import);
    }

    #[test]
    fn test_section_overflows_table() {
        let data = with_malloc(i386_with_got().indirect_symbols(vec![INDIRECT_SYMBOL_LOCAL])).build();
        let image = MachOImage::parse(&data).unwrap();
        let mut diag = Diagnostics::new();
        image.indirect_pointers(&mut diag);
        assert_eq!(
            diag.error_message(),
            "section __nl_symbol_ptr overflows indirect symbol table"
        );
    }

    #[test]
    fn test_invalid_symbol_index() {
        let data = with_malloc(i386_with_got().indirect_symbols(vec![0, 7, 1])).build();
        let image = MachOImage::parse(&data).unwrap();
        let mut diag = Diagnostics::new();
        let pointers = image.indirect_pointers(&mut diag);
        assert_eq!(pointers.len(), 1);
        assert_eq!(
            diag.error_message(),
            "indirect symbol[1] = 7 which is invalid symbol index"
        );
    }

    #[test]
    fn test_self_modifying_outside_i386() {
        let builder = ImageBuilder::dylib_x86_64().extra_section(
            "__DATA",
            "__la_symbol_ptr",
            8,
            S_LAZY_SYMBOL_POINTERS | S_ATTR_SELF_MODIFYING_CODE,
        );
        let data = builder.indirect_symbols(vec![INDIRECT_SYMBOL_LOCAL]).build();
        let image = MachOImage::parse(&data).unwrap();
        let mut diag = Diagnostics::new();
        image.indirect_pointers(&mut diag);
        assert_eq!(
            diag.error_message(),
            "S_ATTR_SELF_MODIFYING_CODE section type only valid in old i386 binaries"
        );
    }

    #[test]
    fn test_self_modifying_stubs() {
        let mut builder = ImageBuilder::dylib_i386().extra_section(
            "__TEXT",
            "__jump_table",
            10,
            S_SYMBOL_STUBS | S_ATTR_SELF_MODIFYING_CODE | S_ATTR_PURE_INSTRUCTIONS,
        );
        builder.section_mut("__TEXT", "__jump_table").reserved2 = 5;
        let data = with_malloc(builder.indirect_symbols(vec![2, 2])).build();
        let image = MachOImage::parse(&data).unwrap();
        let mut diag = Diagnostics::new();
        let pointers = image.indirect_pointers(&mut diag);
        assert!(diag.no_error(), "{}", diag.error_message());
        assert_eq!(pointers.len(), 2);
        assert!(pointers.iter().all(|p| p.self_modifying_stub));
        assert_eq!(pointers[1].address - pointers[0].address, 5);
    }
}
