//! LINKEDIT locator and layout validation.
//!
//! [`MachOImage::linkedit_info`] gathers every load command that points into
//! LINKEDIT. The layout check then sorts the blobs those commands describe by
//! file offset and proves they neither overlap nor spill out of the segment.

use tracing::debug;

use super::enforce::FormatRule;
use super::validate::Checker;
use crate::error::{Error, Result};
use crate::macho::*;
use crate::util::{read_cstr, sub_slice};

/// Upper bound on symbol and indirect symbol counts.
pub const MAX_SYMBOL_COUNT: u32 = 0x1000_0000;

// =============================================================================
// LinkEdit Info
// =============================================================================

/// Every LINKEDIT-bearing load command of an image, plus the segment layout
/// the fixup walkers check offsets against.
#[derive(Debug, Clone, Default)]
pub struct LinkEditInfo {
    /// LC_DYLD_INFO or LC_DYLD_INFO_ONLY
    pub dyld_info: Option<DyldInfoCommand>,
    pub exports_trie: Option<LinkeditDataCommand>,
    pub chained_fixups: Option<LinkeditDataCommand>,
    pub symtab: Option<SymtabCommand>,
    pub dysymtab: Option<DysymtabCommand>,
    pub split_seg_info: Option<LinkeditDataCommand>,
    pub function_starts: Option<LinkeditDataCommand>,
    pub data_in_code: Option<LinkeditDataCommand>,
    pub code_signature: Option<LinkeditDataCommand>,
    /// All segments, in load command order
    pub segments: Vec<SegmentInfo>,
    /// Index of __LINKEDIT; fixups may only target segments below it
    pub linkedit_index: u32,
    pub linkedit_file_offset: u64,
    pub linkedit_file_size: u64,
}

impl LinkEditInfo {
    /// The segment at `index`, if it is a legal fixup target.
    #[inline]
    pub fn fixup_segment(&self, index: u32) -> Option<&SegmentInfo> {
        if index >= self.linkedit_index {
            return None;
        }
        self.segments.get(index as usize)
    }

    #[inline]
    pub fn has_dyld_info_only(&self) -> bool {
        self.dyld_info.is_some_and(|d| d.cmd == LC_DYLD_INFO_ONLY)
    }

    /// vmaddr of __TEXT, or 0.
    pub fn text_vm_addr(&self) -> u64 {
        self.segments
            .iter()
            .find(|s| s.is_text())
            .map(|s| s.vm_addr)
            .unwrap_or(0)
    }
}

/// Records `cmd` into `slot`, rejecting a wrong size or a second copy.
fn record<T: zerocopy::FromBytes>(
    slot: &mut Option<T>,
    cmd: &LoadCommandRef<'_>,
    size: usize,
    name: &str,
) -> Result<()> {
    if cmd.cmdsize as usize != size {
        return Err(Error::MalformedLinkEdit(format!("{} load command size wrong", name)));
    }
    if slot.is_some() {
        return Err(Error::MalformedLinkEdit(format!("multiple {} load commands", name)));
    }
    *slot = cmd.read::<T>();
    Ok(())
}

impl<'a> MachOImage<'a> {
    /// Collects the LINKEDIT load commands and the segment layout.
    pub fn linkedit_info(&self) -> Result<LinkEditInfo> {
        let mut info = LinkEditInfo::default();
        for cmd in self.load_commands() {
            let cmd = cmd?;
            match cmd.cmd {
                LC_DYLD_INFO | LC_DYLD_INFO_ONLY => {
                    record(&mut info.dyld_info, &cmd, DyldInfoCommand::SIZE, "LC_DYLD_INFO")?
                }
                LC_DYLD_EXPORTS_TRIE => record(
                    &mut info.exports_trie,
                    &cmd,
                    LinkeditDataCommand::SIZE,
                    "LC_DYLD_EXPORTS_TRIE",
                )?,
                LC_DYLD_CHAINED_FIXUPS => record(
                    &mut info.chained_fixups,
                    &cmd,
                    LinkeditDataCommand::SIZE,
                    "LC_DYLD_CHAINED_FIXUPS",
                )?,
                LC_SYMTAB => record(&mut info.symtab, &cmd, SymtabCommand::SIZE, "LC_SYMTAB")?,
                LC_DYSYMTAB => record(&mut info.dysymtab, &cmd, DysymtabCommand::SIZE, "LC_DYSYMTAB")?,
                LC_SEGMENT_SPLIT_INFO => record(
                    &mut info.split_seg_info,
                    &cmd,
                    LinkeditDataCommand::SIZE,
                    "LC_SEGMENT_SPLIT_INFO",
                )?,
                LC_FUNCTION_STARTS => record(
                    &mut info.function_starts,
                    &cmd,
                    LinkeditDataCommand::SIZE,
                    "LC_FUNCTION_STARTS",
                )?,
                LC_DATA_IN_CODE => record(
                    &mut info.data_in_code,
                    &cmd,
                    LinkeditDataCommand::SIZE,
                    "LC_DATA_IN_CODE",
                )?,
                LC_CODE_SIGNATURE => record(
                    &mut info.code_signature,
                    &cmd,
                    LinkeditDataCommand::SIZE,
                    "LC_CODE_SIGNATURE",
                )?,
                _ => {}
            }
        }
        if info.dyld_info.is_some() && info.chained_fixups.is_some() {
            return Err(Error::MalformedLinkEdit(
                "can't have LC_DYLD_INFO and LC_DYLD_CHAINED_FIXUPS".into(),
            ));
        }
        if info.dyld_info.is_some() && info.exports_trie.is_some() {
            return Err(Error::MalformedLinkEdit(
                "can't have LC_DYLD_INFO and LC_DYLD_EXPORTS_TRIE".into(),
            ));
        }

        info.segments = self.segments();
        let Some(linkedit) = info.segments.iter().find(|s| s.is_linkedit()) else {
            return Err(Error::MalformedLinkEdit("malformed mach-o missing LINKEDIT".into()));
        };
        info.linkedit_index = linkedit.index;
        info.linkedit_file_offset = linkedit.file_offset;
        info.linkedit_file_size = linkedit.file_size;
        Ok(info)
    }

    /// The file bytes `[offset, offset + size)` of a LINKEDIT blob.
    pub(crate) fn linkedit_blob(&self, name: &str, offset: u32, size: u64) -> Result<&'a [u8]> {
        sub_slice(self.data(), offset as u64, size).ok_or_else(|| {
            Error::MalformedLinkEdit(format!("LINKEDIT content '{}' extends beyond end of file", name))
        })
    }

    /// The symbol and string tables, if the image has LC_SYMTAB.
    pub fn symbol_table(&self, info: &LinkEditInfo) -> Result<Option<SymbolTable<'a>>> {
        let Some(symtab) = info.symtab else {
            return Ok(None);
        };
        let entry_size = if self.is_64() { Nlist64::SIZE } else { Nlist::SIZE };
        let symbols = self.linkedit_blob(
            "symbol table",
            symtab.symoff,
            symtab.nsyms as u64 * entry_size as u64,
        )?;
        let strings = self.linkedit_blob("symbol table strings", symtab.stroff, symtab.strsize as u64)?;
        Ok(Some(SymbolTable {
            symbols,
            strings,
            count: symtab.nsyms,
            is_64: self.is_64(),
        }))
    }

    /// Entries of the indirect symbol table.
    pub fn indirect_symbol_table(&self, info: &LinkEditInfo) -> Result<Vec<u32>> {
        let Some(dysymtab) = info.dysymtab else {
            return Ok(Vec::new());
        };
        let raw = self.linkedit_blob(
            "indirect symbol table",
            dysymtab.indirectsymoff,
            dysymtab.nindirectsyms as u64 * 4,
        )?;
        Ok(raw
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }
}

// =============================================================================
// Symbol Table
// =============================================================================

/// One nlist entry, normalized to 64 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Symbol {
    pub n_strx: u32,
    pub n_type: u8,
    pub n_sect: u8,
    pub n_desc: u16,
    pub n_value: u64,
}

impl Symbol {
    /// Defined in a section and visible outside the image.
    #[inline]
    pub fn is_defined_external(&self) -> bool {
        self.n_type & N_EXT != 0 && self.n_type & N_TYPE == N_SECT
    }

    #[inline]
    pub fn is_weak_def(&self) -> bool {
        self.n_desc & N_WEAK_DEF != 0
    }

    #[inline]
    pub fn is_weak_ref(&self) -> bool {
        self.n_desc & N_WEAK_REF != 0
    }
}

/// Bounds-checked view over the nlist array and its string pool.
#[derive(Debug, Clone, Copy)]
pub struct SymbolTable<'a> {
    symbols: &'a [u8],
    strings: &'a [u8],
    count: u32,
    is_64: bool,
}

impl<'a> SymbolTable<'a> {
    #[inline]
    pub fn len(&self) -> u32 {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Size of the string pool.
    #[inline]
    pub fn string_pool_size(&self) -> u32 {
        self.strings.len() as u32
    }

    /// The symbol at `index`.
    pub fn get(&self, index: u32) -> Option<Symbol> {
        if index >= self.count {
            return None;
        }
        if self.is_64 {
            let n: Nlist64 = read_struct(self.symbols, index as usize * Nlist64::SIZE)?;
            Some(Symbol {
                n_strx: n.n_strx,
                n_type: n.n_type,
                n_sect: n.n_sect,
                n_desc: n.n_desc,
                n_value: n.n_value,
            })
        } else {
            let n: Nlist = read_struct(self.symbols, index as usize * Nlist::SIZE)?;
            Some(Symbol {
                n_strx: n.n_strx,
                n_type: n.n_type,
                n_sect: n.n_sect,
                n_desc: n.n_desc,
                n_value: n.n_value as u64,
            })
        }
    }

    /// The NUL-terminated name at `strx` in the string pool.
    pub fn name(&self, strx: u32) -> Option<&'a str> {
        read_cstr(self.strings, strx as usize).and_then(|s| std::str::from_utf8(s).ok())
    }
}

// =============================================================================
// Layout Validation
// =============================================================================

/// One LINKEDIT blob for the overlap scan.
#[derive(Debug, Clone, Copy)]
struct Blob {
    name: &'static str,
    alignment: u64,
    offset: u64,
    size: u64,
}

impl<'i, 'a> Checker<'i, 'a> {
    pub(crate) fn linkedit_error(&self, msg: impl std::fmt::Display) -> Error {
        Error::MalformedLinkEdit(self.msg(msg))
    }

    pub(crate) fn valid_linkedit_layout(&self) -> Result<()> {
        let image = self.image;
        let info = image.linkedit_info().map_err(|e| e.in_file(self.path))?;
        let ptr = image.pointer_size() as u64;

        let mut blobs = Vec::with_capacity(16);
        let mut push = |name, alignment, offset: u32, size: u64| {
            if size != 0 {
                blobs.push(Blob {
                    name,
                    alignment,
                    offset: offset as u64,
                    size,
                });
            }
        };
        if let Some(d) = info.dyld_info {
            push("rebase opcodes", ptr, d.rebase_off, d.rebase_size as u64);
            push("bind opcodes", ptr, d.bind_off, d.bind_size as u64);
            push("weak bind opcodes", ptr, d.weak_bind_off, d.weak_bind_size as u64);
            push("lazy bind opcodes", ptr, d.lazy_bind_off, d.lazy_bind_size as u64);
            push("exports trie", ptr, d.export_off, d.export_size as u64);
        }
        if let Some(c) = info.exports_trie {
            push("exports trie", ptr, c.dataoff, c.datasize as u64);
        }
        if let Some(c) = info.chained_fixups {
            push("chained fixups", ptr, c.dataoff, c.datasize as u64);
        }
        if let Some(d) = info.dysymtab {
            let reloc = RelocationInfo::SIZE as u64;
            push("local relocations", ptr, d.locreloff, d.nlocrel as u64 * reloc);
            push("external relocations", ptr, d.extreloff, d.nextrel as u64 * reloc);
            push("indirect symbol table", 4, d.indirectsymoff, d.nindirectsyms as u64 * 4);
        }
        if let Some(c) = info.split_seg_info {
            push("shared cache info", ptr, c.dataoff, c.datasize as u64);
        }
        if let Some(c) = info.function_starts {
            push("function starts", ptr, c.dataoff, c.datasize as u64);
        }
        if let Some(c) = info.data_in_code {
            push("data in code", ptr, c.dataoff, c.datasize as u64);
        }
        if let Some(s) = info.symtab {
            let entry = if image.is_64() { Nlist64::SIZE } else { Nlist::SIZE } as u64;
            push("symbol table", ptr, s.symoff, s.nsyms as u64 * entry);
            push("symbol table strings", 1, s.stroff, s.strsize as u64);
        }
        if let Some(c) = info.code_signature {
            push("code signature", ptr, c.dataoff, c.datasize as u64);
        }

        // incompatible combinations
        if let (true, Some(dysymtab)) = (info.has_dyld_info_only(), info.dysymtab) {
            if dysymtab.nlocrel != 0 && self.enforce(FormatRule::DyldInfoAndLocalRelocs) {
                return Err(self.linkedit_error(
                    "malformed mach-o contains LC_DYLD_INFO_ONLY and local relocations",
                ));
            }
            if dysymtab.nextrel != 0 {
                return Err(self.linkedit_error(
                    "malformed mach-o contains LC_DYLD_INFO_ONLY and external relocations",
                ));
            }
        }

        let offline_exempt = self.options.offline
            && (image.is_fileset() || image.is_static_executable() || image.is_kext_bundle());
        if info.dyld_info.is_none() && info.dysymtab.is_none() && !offline_exempt {
            return Err(self.linkedit_error("malformed mach-o misssing LC_DYLD_INFO and LC_DYSYMTAB"));
        }

        // kernel collections lay LINKEDIT out per contained kext
        if self.options.offline && image.is_fileset() {
            return Ok(());
        }

        if blobs.is_empty() {
            return Err(self.linkedit_error("malformed mach-o missing LINKEDIT"));
        }

        let linkedit_end = info.linkedit_file_offset + info.linkedit_file_size;
        blobs.sort_by_key(|b| b.offset);
        let mut prev_end = info.linkedit_file_offset;
        let mut prev_name = "start of LINKEDIT";
        for blob in &blobs {
            if blob.offset < prev_end {
                return Err(self.linkedit_error(format_args!(
                    "LINKEDIT overlap of {} and {}",
                    prev_name, blob.name
                )));
            }
            if crate::util::greater_than_add_or_overflow(blob.offset, blob.size, linkedit_end) {
                return Err(self.linkedit_error(format_args!(
                    "LINKEDIT content '{}' extends beyond end of segment",
                    blob.name
                )));
            }
            if blob.offset % blob.alignment != 0 {
                // older SDKs only guaranteed 4-byte code signature alignment
                let rule = if blob.name == "code signature" {
                    FormatRule::CodeSigAlignment
                } else {
                    FormatRule::LinkeditAlignment
                };
                if self.enforce(rule) {
                    return Err(self.linkedit_error(format_args!(
                        "mis-aligned LINKEDIT content '{}'",
                        blob.name
                    )));
                }
            }
            prev_end = blob.offset + blob.size;
            prev_name = blob.name;
        }

        let (Some(symtab), dysymtab) = (info.symtab, info.dysymtab) else {
            return Ok(());
        };
        if symtab.nsyms > MAX_SYMBOL_COUNT {
            return Err(self.linkedit_error("malformed mach-o image: symbol table too large"));
        }
        if let Some(d) = dysymtab {
            if d.nindirectsyms > MAX_SYMBOL_COUNT {
                return Err(self.linkedit_error(
                    "malformed mach-o image: indirect symbol table too large",
                ));
            }
            let ranges = [
                ("local", d.ilocalsym, d.nlocalsym),
                ("extern", d.iextdefsym, d.nextdefsym),
                ("undefined", d.iundefsym, d.nundefsym),
            ];
            for (what, start, count) in ranges {
                if count > symtab.nsyms || start > symtab.nsyms {
                    return Err(self.linkedit_error(format_args!(
                        "malformed mach-o image: indirect symbol table {} symbol count exceeds total symbols",
                        what
                    )));
                }
                if start.checked_add(count).is_none() {
                    return Err(self.linkedit_error(format_args!(
                        "malformed mach-o image: indirect symbol table {} symbol count wraps",
                        what
                    )));
                }
            }
        }
        debug!("{}: LINKEDIT layout ok ({} blobs)", self.path, blobs.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::{validate, ValidationOptions};
    use crate::testutil::ImageBuilder;

    /// Overwrites the u32 at `field` of the first load command of kind `cmd`.
    fn patch(data: &mut [u8], cmd: u32, field: usize, value: u32) {
        let image = MachOImage::parse(data).unwrap();
        let at = image.find_load_command(cmd).unwrap().offset + field;
        data[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn read_field(data: &[u8], cmd: u32, field: usize) -> u32 {
        let image = MachOImage::parse(data).unwrap();
        let at = image.find_load_command(cmd).unwrap().offset + field;
        u32::from_le_bytes(data[at..at + 4].try_into().unwrap())
    }

    fn layout(data: &[u8]) -> Result<()> {
        let options = ValidationOptions::loader(GradedArchs::ARM64, Platform::MacOS);
        let image = MachOImage::parse(data).unwrap();
        Checker::new(&image, "/tmp/lib", &options).valid_linkedit_layout()
    }

    #[test]
    fn test_linkedit_info() {
        let data = ImageBuilder::dylib_arm64().build();
        let image = MachOImage::parse(&data).unwrap();
        let info = image.linkedit_info().unwrap();
        assert!(info.has_dyld_info_only());
        assert!(info.chained_fixups.is_none());
        assert_eq!(info.linkedit_index, 2);
        assert_eq!(info.segments.len(), 3);
        assert!(info.fixup_segment(1).is_some());
        assert!(info.fixup_segment(2).is_none());

        let symbols = image.symbol_table(&info).unwrap().unwrap();
        assert_eq!(symbols.len(), 3);
        let foo = symbols.get(0).unwrap();
        assert_eq!(symbols.name(foo.n_strx), Some("_foo"));
        assert!(foo.is_defined_external());
        assert!(symbols.get(3).is_none());
        layout(&data).unwrap();
    }

    #[test]
    fn test_duplicate_command() {
        let mut builder = ImageBuilder::dylib_arm64();
        builder.raw_command(LC_FUNCTION_STARTS, vec![0u8; 8]);
        builder.raw_command(LC_FUNCTION_STARTS, vec![0u8; 8]);
        let data = builder.build();
        let image = MachOImage::parse(&data).unwrap();
        let err = image.linkedit_info().unwrap_err();
        assert_eq!(err.to_string(), "multiple LC_FUNCTION_STARTS load commands");
    }

    #[test]
    fn test_wrong_command_size() {
        let mut builder = ImageBuilder::dylib_arm64();
        builder.raw_command(LC_CODE_SIGNATURE, vec![0u8; 16]);
        let data = builder.build();
        let err = layout(&data).unwrap_err();
        assert_eq!(err.to_string(), "in '/tmp/lib' LC_CODE_SIGNATURE load command size wrong");
    }

    #[test]
    fn test_overlap() {
        let mut data = ImageBuilder::dylib_arm64().build();
        // bind_off = rebase_off
        let rebase_off = read_field(&data, LC_DYLD_INFO_ONLY, 8);
        patch(&mut data, LC_DYLD_INFO_ONLY, 16, rebase_off);
        let err = layout(&data).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::MalformedLinkEdit);
        assert_eq!(
            err.to_string(),
            "in '/tmp/lib' LINKEDIT overlap of rebase opcodes and bind opcodes"
        );
    }

    #[test]
    fn test_blob_beyond_segment() {
        let mut data = ImageBuilder::dylib_arm64().build();
        patch(&mut data, LC_DYLD_INFO_ONLY, 44, 0x10_0000);
        let err = layout(&data).unwrap_err();
        assert_eq!(
            err.to_string(),
            "in '/tmp/lib' LINKEDIT content 'exports trie' extends beyond end of segment"
        );
    }

    #[test]
    fn test_misaligned_blob() {
        let mut data = ImageBuilder::dylib_arm64().build();
        let rebase_off = read_field(&data, LC_DYLD_INFO_ONLY, 8);
        patch(&mut data, LC_DYLD_INFO_ONLY, 8, rebase_off + 1);
        let err = layout(&data).unwrap_err();
        assert_eq!(
            err.to_string(),
            "in '/tmp/lib' mis-aligned LINKEDIT content 'rebase opcodes'"
        );
    }

    #[test]
    fn test_misaligned_blob_allowed_for_old_sdk() {
        let mut data = ImageBuilder::dylib_arm64()
            .platform(Platform::MacOS, 0x000A_0D00, 0x000A_0D00)
            .build();
        let rebase_off = read_field(&data, LC_DYLD_INFO_ONLY, 8);
        patch(&mut data, LC_DYLD_INFO_ONLY, 8, rebase_off + 1);
        layout(&data).unwrap();
    }

    #[test]
    fn test_dyld_info_with_external_relocs() {
        let data = ImageBuilder::dylib_arm64()
            .external_relocs(vec![RelocationInfo::new(8, 2, false, 3, true, RELOC_UNSIGNED)])
            .build();
        let err = layout(&data).unwrap_err();
        assert!(err
            .to_string()
            .ends_with("malformed mach-o contains LC_DYLD_INFO_ONLY and external relocations"));
    }

    #[test]
    fn test_missing_dyld_info_and_dysymtab() {
        let mut builder = ImageBuilder::dylib_arm64();
        builder.dyld_info = false;
        builder.dysymtab = false;
        let data = builder.build();
        let err = layout(&data).unwrap_err();
        assert!(err.to_string().contains("misssing LC_DYLD_INFO and LC_DYSYMTAB"));
    }

    #[test]
    fn test_dysymtab_range_exceeds_symbols() {
        let mut data = ImageBuilder::dylib_arm64().build();
        patch(&mut data, LC_DYSYMTAB, 12, 4);
        let err = layout(&data).unwrap_err();
        assert!(err
            .to_string()
            .contains("indirect symbol table local symbol count exceeds total symbols"));
    }

    #[test]
    fn test_dysymtab_ranges_within_symbols() {
        let mut data = ImageBuilder::dylib_arm64().build();
        patch(&mut data, LC_DYSYMTAB, 16, 3);
        patch(&mut data, LC_DYSYMTAB, 20, 3);
        layout(&data).unwrap();
        patch(&mut data, LC_DYSYMTAB, 24, 2);
        patch(&mut data, LC_DYSYMTAB, 28, u32::MAX);
        let err = layout(&data).unwrap_err();
        assert!(err.to_string().contains("undefined symbol count exceeds total symbols"));
    }

    #[test]
    fn test_phase_two_reports_layout_errors() {
        let mut data = ImageBuilder::dylib_arm64().build();
        let rebase_off = read_field(&data, LC_DYLD_INFO_ONLY, 8);
        patch(&mut data, LC_DYLD_INFO_ONLY, 16, rebase_off);
        let options = ValidationOptions::loader(GradedArchs::ARM64, Platform::MacOS);
        let mut validated = validate(&data, "/tmp/lib", &options).unwrap();
        assert!(validated.validate_linkedit().is_err());
        assert!(!validated.linkedit_valid());
    }
}
