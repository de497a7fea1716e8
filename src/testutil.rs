//! Synthetic Mach-O images for unit tests.
//!
//! [`ImageBuilder`] lays out a small but well-formed image (`__TEXT`,
//! `__DATA`, `__LINKEDIT`) and lets tests change one thing at a time before
//! calling [`ImageBuilder::build`].

use zerocopy::IntoBytes;

use crate::macho::*;
use crate::util::{align_up, write_sleb128, write_uleb128};

/// One section of a [`SegmentSpec`].
#[derive(Debug, Clone)]
pub struct SectionSpec {
    pub name: String,
    pub addr: u64,
    pub size: u64,
    pub offset: u32,
    pub align: u32,
    pub reloff: u32,
    pub nreloc: u32,
    pub flags: u32,
    pub reserved1: u32,
    pub reserved2: u32,
}

/// One segment load command to emit.
#[derive(Debug, Clone)]
pub struct SegmentSpec {
    pub name: String,
    pub vm_addr: u64,
    pub vm_size: u64,
    pub file_offset: u64,
    pub file_size: u64,
    pub max_prot: u32,
    pub init_prot: u32,
    pub flags: u32,
    pub sections: Vec<SectionSpec>,
}

/// Entry point command to emit.
#[derive(Debug, Clone, Copy)]
pub enum EntrySpec {
    /// LC_MAIN with this entryoff
    Main(u64),
    /// LC_UNIXTHREAD with this pc
    Thread(u64),
}

#[derive(Debug, Clone)]
struct SymbolSpec {
    name: String,
    n_type: u8,
    n_sect: u8,
    n_desc: u16,
    value: u64,
}

/// Builder for synthetic images.
#[derive(Debug, Clone)]
pub struct ImageBuilder {
    pub cputype: u32,
    pub cpusubtype: u32,
    pub filetype: u32,
    pub flags: u32,
    /// Every segment except __LINKEDIT, in load command order
    pub segments: Vec<SegmentSpec>,
    pub linkedit_init_prot: u32,
    /// Emit LC_DYLD_INFO_ONLY
    pub dyld_info: bool,
    pub rebase: Vec<u8>,
    pub bind: Vec<u8>,
    pub weak_bind: Vec<u8>,
    pub lazy_bind: Vec<u8>,
    pub export: Vec<u8>,
    pub symtab: bool,
    pub dysymtab: bool,
    platforms: Vec<(Platform, u32, u32)>,
    version_mins: Vec<(u32, u32, u32)>,
    install_name: Option<String>,
    dependents: Vec<(u32, String)>,
    rpaths: Vec<String>,
    dylinker: Option<String>,
    entries: Vec<EntrySpec>,
    chained: Option<Vec<u8>>,
    symbols: Vec<SymbolSpec>,
    indirect: Vec<u32>,
    local_relocs: Vec<RelocationInfo>,
    external_relocs: Vec<RelocationInfo>,
    function_starts: Vec<u8>,
    data_in_code: Vec<u8>,
    code_signature: usize,
    routines: Option<u64>,
    raw: Vec<(u32, Vec<u8>)>,
    writes: Vec<(String, u64, Vec<u8>)>,
}

impl ImageBuilder {
    /// An empty image of the given kind with no segments.
    pub fn new(cputype: u32, cpusubtype: u32, filetype: u32) -> Self {
        Self {
            cputype,
            cpusubtype,
            filetype,
            flags: (MachOFlags::NOUNDEFS | MachOFlags::DYLDLINK | MachOFlags::TWOLEVEL).bits(),
            segments: Vec::new(),
            linkedit_init_prot: VM_PROT_READ,
            dyld_info: true,
            rebase: Vec::new(),
            bind: Vec::new(),
            weak_bind: Vec::new(),
            lazy_bind: Vec::new(),
            export: Vec::new(),
            symtab: true,
            dysymtab: true,
            platforms: Vec::new(),
            version_mins: Vec::new(),
            install_name: None,
            dependents: Vec::new(),
            rpaths: Vec::new(),
            dylinker: None,
            entries: Vec::new(),
            chained: None,
            symbols: Vec::new(),
            indirect: Vec::new(),
            local_relocs: Vec::new(),
            external_relocs: Vec::new(),
            function_starts: Vec::new(),
            data_in_code: Vec::new(),
            code_signature: 0,
            routines: None,
            raw: Vec::new(),
            writes: Vec::new(),
        }
    }

    /// arm64 dylib with dyld info, three symbols and a macOS 11 platform.
    pub fn dylib_arm64() -> Self {
        let mut b = Self::new(CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64_ALL, MH_DYLIB);
        b.standard_layout(0, false);
        b.install_name = Some("/usr/lib/libtest.dylib".into());
        b.dependents.push((LC_LOAD_DYLIB, "/usr/lib/libSystem.B.dylib".into()));
        b.platforms.push((Platform::MacOS, 0x000B_0000, 0x000B_0000));
        b.default_fixups();
        b
    }

    /// arm64e dylib; same content as [`ImageBuilder::dylib_arm64`].
    pub fn dylib_arm64e() -> Self {
        let mut b = Self::dylib_arm64();
        b.cpusubtype = CPU_SUBTYPE_ARM64E;
        b
    }

    /// x86_64 dylib without any platform load command.
    pub fn dylib_x86_64() -> Self {
        let mut b = Self::new(CPU_TYPE_X86_64, CPU_SUBTYPE_X86_64_ALL, MH_DYLIB);
        b.standard_layout(0, false);
        b.install_name = Some("/usr/lib/libtest.dylib".into());
        b.dependents.push((LC_LOAD_DYLIB, "/usr/lib/libSystem.B.dylib".into()));
        b.default_fixups();
        b
    }

    /// i386 dylib without any platform load command or dyld info.
    pub fn dylib_i386() -> Self {
        let mut b = Self::new(CPU_TYPE_I386, CPU_SUBTYPE_I386_ALL, MH_DYLIB);
        b.standard_layout(0, false);
        b.install_name = Some("/usr/lib/libtest.dylib".into());
        b.dependents.push((LC_LOAD_DYLIB, "/usr/lib/libSystem.B.dylib".into()));
        b.dyld_info = false;
        b
    }

    /// arm64 main executable with __PAGEZERO, LC_LOAD_DYLINKER and LC_MAIN.
    pub fn executable_arm64() -> Self {
        let mut b = Self::new(CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64_ALL, MH_EXECUTE);
        b.flags |= MachOFlags::PIE.bits();
        b.standard_layout(0x1_0000_0000, true);
        b.dylinker = Some("/usr/lib/dyld".into());
        b.dependents.push((LC_LOAD_DYLIB, "/usr/lib/libSystem.B.dylib".into()));
        b.platforms.push((Platform::MacOS, 0x000B_0000, 0x000B_0000));
        let text_offset = b.page_size() / 2;
        b.entries.push(EntrySpec::Main(text_offset));
        b.default_fixups();
        b
    }

    pub fn is_64(&self) -> bool {
        self.cputype & CPU_ARCH_ABI64 != 0
    }

    pub fn pointer_size(&self) -> u64 {
        if self.is_64() {
            8
        } else {
            4
        }
    }

    pub fn page_size(&self) -> u64 {
        match self.cputype {
            CPU_TYPE_ARM64 | CPU_TYPE_ARM64_32 => 0x4000,
            CPU_TYPE_ARM if self.cpusubtype == CPU_SUBTYPE_ARM_V7K => 0x4000,
            _ => 0x1000,
        }
    }

    fn standard_layout(&mut self, base: u64, pagezero: bool) {
        let page = self.page_size();
        if pagezero {
            self.segments.push(SegmentSpec {
                name: "__PAGEZERO".into(),
                vm_addr: 0,
                vm_size: base,
                file_offset: 0,
                file_size: 0,
                max_prot: 0,
                init_prot: 0,
                flags: 0,
                sections: Vec::new(),
            });
        }
        let rx = VM_PROT_READ | VM_PROT_EXECUTE;
        let rw = VM_PROT_READ | VM_PROT_WRITE;
        self.segments.push(SegmentSpec {
            name: "__TEXT".into(),
            vm_addr: base,
            vm_size: page,
            file_offset: 0,
            file_size: page,
            max_prot: rx,
            init_prot: rx,
            flags: 0,
            sections: vec![SectionSpec::new(
                "__text",
                base + page / 2,
                0x100,
                (page / 2) as u32,
                2,
                S_REGULAR | S_ATTR_PURE_INSTRUCTIONS | S_ATTR_SOME_INSTRUCTIONS,
            )],
        });
        self.segments.push(SegmentSpec {
            name: "__DATA".into(),
            vm_addr: base + page,
            vm_size: page,
            file_offset: page,
            file_size: page,
            max_prot: rw,
            init_prot: rw,
            flags: 0,
            sections: vec![SectionSpec::new("__data", base + page, 0x100, page as u32, 3, S_REGULAR)],
        });
        // __DATA+0 holds a pointer to the start of __text
        let target = base + page / 2;
        let bytes = if self.is_64() {
            target.to_le_bytes().to_vec()
        } else {
            (target as u32).to_le_bytes().to_vec()
        };
        self.writes.push(("__DATA".into(), 0, bytes));
    }

    /// Index of the named segment in load command order.
    pub fn segment_index(&self, name: &str) -> u8 {
        self.segments
            .iter()
            .position(|s| s.name == name)
            .expect("segment exists") as u8
    }

    /// vmaddr of the named segment.
    pub fn segment_vm_addr(&self, name: &str) -> u64 {
        self.segments[self.segment_index(name) as usize].vm_addr
    }

    fn default_fixups(&mut self) {
        let data = self.segment_index("__DATA");
        let page = self.page_size();
        let base = self.segment_vm_addr("__TEXT");
        self.rebase = vec![
            REBASE_OPCODE_SET_TYPE_IMM | REBASE_TYPE_POINTER,
            REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | data,
            0x00,
            REBASE_OPCODE_DO_REBASE_IMM_TIMES | 1,
            REBASE_OPCODE_DONE,
        ];
        self.bind = BindStream::new()
            .ordinal(1)
            .symbol("_malloc", 0)
            .kind(BIND_TYPE_POINTER)
            .segment(data, 8)
            .do_bind()
            .done()
            .finish();
        self.export = export_trie(&[("_foo", page / 2), ("_bar", page / 2 + 0x10)]);
        let text_addr = base + page / 2;
        self.symbol("_foo", N_SECT | N_EXT, 1, 0, text_addr);
        self.symbol("_bar", N_SECT | N_EXT, 1, 0, text_addr + 0x10);
        self.symbol("_malloc", N_EXT, 0, 1 << 8, 0);
    }

    /// Replaces the declared platforms with a single LC_BUILD_VERSION.
    pub fn platform(mut self, platform: Platform, min_os: u32, sdk: u32) -> Self {
        self.platforms = vec![(platform, min_os, sdk)];
        self.version_mins.clear();
        self
    }

    /// Adds another LC_BUILD_VERSION.
    pub fn add_platform(mut self, platform: Platform, min_os: u32, sdk: u32) -> Self {
        self.platforms.push((platform, min_os, sdk));
        self
    }

    /// Replaces the declared platforms with one LC_VERSION_MIN_* command.
    pub fn version_min(mut self, cmd: u32, version: u32, sdk: u32) -> Self {
        self.platforms.clear();
        self.version_mins = vec![(cmd, version, sdk)];
        self
    }

    /// Removes every platform load command.
    pub fn no_platform(mut self) -> Self {
        self.platforms.clear();
        self.version_mins.clear();
        self
    }

    /// Appends a section to `segment`, placed after its existing sections.
    pub fn extra_section(mut self, segment: &str, name: &str, size: u64, flags: u32) -> Self {
        let seg = self.segment_mut(segment);
        let addr = seg
            .sections
            .iter()
            .map(|s| s.addr + s.size)
            .max()
            .unwrap_or(seg.vm_addr);
        let addr = align_up(addr, 8);
        let zero_fill = matches!(
            flags & SECTION_TYPE,
            S_ZEROFILL | S_GB_ZEROFILL | S_THREAD_LOCAL_ZEROFILL
        );
        let offset = if zero_fill {
            0
        } else {
            (seg.file_offset + (addr - seg.vm_addr)) as u32
        };
        seg.sections.push(SectionSpec::new(name, addr, size, offset, 3, flags));
        self
    }

    pub fn segment_mut(&mut self, name: &str) -> &mut SegmentSpec {
        self.segments
            .iter_mut()
            .find(|s| s.name == name)
            .expect("segment exists")
    }

    pub fn section_mut(&mut self, segment: &str, name: &str) -> &mut SectionSpec {
        self.segment_mut(segment)
            .sections
            .iter_mut()
            .find(|s| s.name == name)
            .expect("section exists")
    }

    pub fn install_name(mut self, name: Option<&str>) -> Self {
        self.install_name = name.map(str::to_string);
        self
    }

    pub fn dependent(mut self, cmd: u32, path: &str) -> Self {
        self.dependents.push((cmd, path.to_string()));
        self
    }

    pub fn clear_dependents(mut self) -> Self {
        self.dependents.clear();
        self
    }

    pub fn rpath(mut self, path: &str) -> Self {
        self.rpaths.push(path.to_string());
        self
    }

    pub fn dylinker(mut self, path: Option<&str>) -> Self {
        self.dylinker = path.map(str::to_string);
        self
    }

    pub fn entry(mut self, entry: EntrySpec) -> Self {
        self.entries.push(entry);
        self
    }

    pub fn clear_entries(mut self) -> Self {
        self.entries.clear();
        self
    }

    pub fn routines(mut self, init_address: u64) -> Self {
        self.routines = Some(init_address);
        self
    }

    /// Uses LC_DYLD_CHAINED_FIXUPS instead of dyld info. Exports move to
    /// LC_DYLD_EXPORTS_TRIE.
    pub fn chained_fixups(mut self, blob: Vec<u8>) -> Self {
        self.chained = Some(blob);
        self.dyld_info = false;
        self
    }

    pub fn function_starts(mut self, blob: Vec<u8>) -> Self {
        self.function_starts = blob;
        self
    }

    pub fn data_in_code(mut self, blob: Vec<u8>) -> Self {
        self.data_in_code = blob;
        self
    }

    pub fn code_signature(mut self, size: usize) -> Self {
        self.code_signature = size;
        self
    }

    pub fn indirect_symbols(mut self, entries: Vec<u32>) -> Self {
        self.indirect = entries;
        self
    }

    pub fn local_relocs(mut self, relocs: Vec<RelocationInfo>) -> Self {
        self.local_relocs = relocs;
        self
    }

    pub fn external_relocs(mut self, relocs: Vec<RelocationInfo>) -> Self {
        self.external_relocs = relocs;
        self
    }

    /// Appends a symbol. Callers keep locals, then defined externals, then
    /// undefined symbols in order so the LC_DYSYMTAB ranges line up.
    pub fn symbol(&mut self, name: &str, n_type: u8, n_sect: u8, n_desc: u16, value: u64) -> &mut Self {
        self.symbols.push(SymbolSpec {
            name: name.to_string(),
            n_type,
            n_sect,
            n_desc,
            value,
        });
        self
    }

    pub fn clear_symbols(mut self) -> Self {
        self.symbols.clear();
        self
    }

    /// Appends an arbitrary load command after all others.
    pub fn raw_command(&mut self, cmd: u32, payload: Vec<u8>) -> &mut Self {
        self.raw.push((cmd, payload));
        self
    }

    /// Writes `bytes` at `offset` inside the file content of `segment`.
    pub fn write_bytes(mut self, segment: &str, offset: u64, bytes: &[u8]) -> Self {
        self.writes.push((segment.to_string(), offset, bytes.to_vec()));
        self
    }

    /// Writes a pointer-sized value inside `segment`.
    pub fn write_pointer(self, segment: &str, offset: u64, value: u64) -> Self {
        let bytes = if self.is_64() {
            value.to_le_bytes().to_vec()
        } else {
            (value as u32).to_le_bytes().to_vec()
        };
        self.write_bytes(segment, offset, &bytes)
    }

    /// Removes every dyld info stream.
    pub fn clear_fixups(mut self) -> Self {
        self.rebase.clear();
        self.bind.clear();
        self.weak_bind.clear();
        self.lazy_bind.clear();
        self
    }

    // -------------------------------------------------------------------------
    // Assembly
    // -------------------------------------------------------------------------

    /// Lays out LINKEDIT and the load commands and returns the file bytes.
    pub fn build(&self) -> Vec<u8> {
        let page = self.page_size();
        let file_end = self
            .segments
            .iter()
            .map(|s| s.file_offset + s.file_size)
            .max()
            .unwrap_or(0);
        let vm_end = self
            .segments
            .iter()
            .map(|s| s.vm_addr + s.vm_size)
            .max()
            .unwrap_or(0);
        let linkedit_off = align_up(file_end, page);
        let linkedit_vm = align_up(vm_end, page);

        let mut le = LinkeditBlobs::new(linkedit_off);
        let mut dyld_info = DyldInfoCommand::default();
        if self.dyld_info {
            (dyld_info.rebase_off, dyld_info.rebase_size) = le.place(&self.rebase, 8);
            (dyld_info.bind_off, dyld_info.bind_size) = le.place(&self.bind, 8);
            (dyld_info.weak_bind_off, dyld_info.weak_bind_size) = le.place(&self.weak_bind, 8);
            (dyld_info.lazy_bind_off, dyld_info.lazy_bind_size) = le.place(&self.lazy_bind, 8);
            (dyld_info.export_off, dyld_info.export_size) = le.place(&self.export, 8);
        }
        let chained = self.chained.as_ref().map(|blob| le.place(blob, 8));
        let exports_trie = if self.chained.is_some() && !self.export.is_empty() {
            Some(le.place(&self.export, 8))
        } else {
            None
        };
        let function_starts = le.place(&self.function_starts, 8);
        let data_in_code = le.place(&self.data_in_code, 8);
        let local_relocs = le.place(self.local_relocs.as_bytes(), 8);

        let mut strings = vec![b' ', 0u8];
        let mut nlist = Vec::new();
        for sym in &self.symbols {
            let strx = strings.len() as u32;
            strings.extend_from_slice(sym.name.as_bytes());
            strings.push(0);
            if self.is_64() {
                let entry = Nlist64 {
                    n_strx: strx,
                    n_type: sym.n_type,
                    n_sect: sym.n_sect,
                    n_desc: sym.n_desc,
                    n_value: sym.value,
                };
                nlist.extend_from_slice(entry.as_bytes());
            } else {
                let entry = Nlist {
                    n_strx: strx,
                    n_type: sym.n_type,
                    n_sect: sym.n_sect,
                    n_desc: sym.n_desc,
                    n_value: sym.value as u32,
                };
                nlist.extend_from_slice(entry.as_bytes());
            }
        }
        let symbols = le.place(&nlist, 8);
        let external_relocs = le.place(self.external_relocs.as_bytes(), 8);
        let indirect = le.place(self.indirect.as_bytes(), 8);
        let string_pool = le.place(&strings, 8);
        let signature = le.place(&vec![0u8; self.code_signature], 16);

        let linkedit = SegmentSpec {
            name: "__LINKEDIT".into(),
            vm_addr: linkedit_vm,
            vm_size: align_up(le.len().max(1), page),
            file_offset: linkedit_off,
            file_size: le.len(),
            max_prot: VM_PROT_READ,
            init_prot: self.linkedit_init_prot,
            flags: 0,
            sections: Vec::new(),
        };

        // load commands
        let mut cmds: Vec<Vec<u8>> = Vec::new();
        for seg in self.segments.iter().chain(std::iter::once(&linkedit)) {
            cmds.push(self.segment_command(seg));
        }
        if self.dyld_info {
            cmds.push(dyld_info.as_bytes().to_vec());
        }
        if let Some((off, size)) = chained {
            cmds.push(LinkeditDataCommand::new(LC_DYLD_CHAINED_FIXUPS, off, size).as_bytes().to_vec());
        }
        if let Some((off, size)) = exports_trie {
            cmds.push(LinkeditDataCommand::new(LC_DYLD_EXPORTS_TRIE, off, size).as_bytes().to_vec());
        }
        if self.symtab {
            let symtab = SymtabCommand {
                symoff: symbols.0,
                nsyms: self.symbols.len() as u32,
                stroff: string_pool.0,
                strsize: string_pool.1,
                ..SymtabCommand::default()
            };
            cmds.push(symtab.as_bytes().to_vec());
        }
        if self.dysymtab {
            let nlocal = self.symbols.iter().filter(|s| s.n_type & N_EXT == 0).count() as u32;
            let nundef = self
                .symbols
                .iter()
                .filter(|s| s.n_type & N_EXT != 0 && s.n_type & N_TYPE == N_UNDF)
                .count() as u32;
            let total = self.symbols.len() as u32;
            let mut dysymtab = DysymtabCommand::default();
            dysymtab.ilocalsym = 0;
            dysymtab.nlocalsym = nlocal;
            dysymtab.iextdefsym = nlocal;
            dysymtab.nextdefsym = total - nlocal - nundef;
            dysymtab.iundefsym = total - nundef;
            dysymtab.nundefsym = nundef;
            dysymtab.indirectsymoff = indirect.0;
            dysymtab.nindirectsyms = self.indirect.len() as u32;
            dysymtab.locreloff = local_relocs.0;
            dysymtab.nlocrel = self.local_relocs.len() as u32;
            dysymtab.extreloff = external_relocs.0;
            dysymtab.nextrel = self.external_relocs.len() as u32;
            cmds.push(dysymtab.as_bytes().to_vec());
        }
        if let Some(path) = &self.dylinker {
            cmds.push(self.path_command(LC_LOAD_DYLINKER, DylinkerCommand::SIZE, path, |cmd| {
                cmd[8..12].copy_from_slice(&(DylinkerCommand::SIZE as u32).to_le_bytes());
            }));
        }
        for (platform, min_os, sdk) in &self.platforms {
            let cmd = BuildVersionCommand {
                cmd: LC_BUILD_VERSION,
                cmdsize: BuildVersionCommand::SIZE as u32,
                platform: platform.raw(),
                minos: *min_os,
                sdk: *sdk,
                ntools: 0,
            };
            cmds.push(cmd.as_bytes().to_vec());
        }
        for (kind, version, sdk) in &self.version_mins {
            let cmd = VersionMinCommand {
                cmd: *kind,
                cmdsize: VersionMinCommand::SIZE as u32,
                version: *version,
                sdk: *sdk,
            };
            cmds.push(cmd.as_bytes().to_vec());
        }
        for entry in &self.entries {
            cmds.push(self.entry_command(*entry));
        }
        if let Some(init) = self.routines {
            if self.is_64() {
                let cmd = RoutinesCommand64 {
                    cmd: LC_ROUTINES_64,
                    cmdsize: RoutinesCommand64::SIZE as u32,
                    init_address: init,
                    ..RoutinesCommand64::default()
                };
                cmds.push(cmd.as_bytes().to_vec());
            } else {
                let cmd = RoutinesCommand {
                    cmd: LC_ROUTINES,
                    cmdsize: RoutinesCommand::SIZE as u32,
                    init_address: init as u32,
                    ..RoutinesCommand::default()
                };
                cmds.push(cmd.as_bytes().to_vec());
            }
        }
        if let Some(name) = &self.install_name {
            cmds.push(self.dylib_command(LC_ID_DYLIB, name));
        }
        for (kind, path) in &self.dependents {
            cmds.push(self.dylib_command(*kind, path));
        }
        for path in &self.rpaths {
            cmds.push(self.path_command(LC_RPATH, RpathCommand::SIZE, path, |cmd| {
                cmd[8..12].copy_from_slice(&(RpathCommand::SIZE as u32).to_le_bytes());
            }));
        }
        if function_starts.1 != 0 {
            let (off, size) = function_starts;
            cmds.push(LinkeditDataCommand::new(LC_FUNCTION_STARTS, off, size).as_bytes().to_vec());
        }
        if data_in_code.1 != 0 {
            let (off, size) = data_in_code;
            cmds.push(LinkeditDataCommand::new(LC_DATA_IN_CODE, off, size).as_bytes().to_vec());
        }
        if signature.1 != 0 {
            let (off, size) = signature;
            cmds.push(LinkeditDataCommand::new(LC_CODE_SIGNATURE, off, size).as_bytes().to_vec());
        }
        for (kind, payload) in &self.raw {
            let mut cmd = Vec::with_capacity(8 + payload.len());
            cmd.extend_from_slice(&kind.to_le_bytes());
            cmd.extend_from_slice(&((8 + payload.len()) as u32).to_le_bytes());
            cmd.extend_from_slice(payload);
            cmds.push(cmd);
        }

        let sizeofcmds: usize = cmds.iter().map(Vec::len).sum();
        let header_size = if self.is_64() {
            MachHeader64::SIZE
        } else {
            MachHeader::SIZE
        };
        assert!(
            (header_size + sizeofcmds) as u64 <= page / 2,
            "load commands collide with __text"
        );

        let total = (linkedit_off + le.len()) as usize;
        let mut out = vec![0u8; total];
        if self.is_64() {
            let header = MachHeader64 {
                magic: MH_MAGIC_64,
                cputype: self.cputype,
                cpusubtype: self.cpusubtype,
                filetype: self.filetype,
                ncmds: cmds.len() as u32,
                sizeofcmds: sizeofcmds as u32,
                flags: self.flags,
                reserved: 0,
            };
            out[..header_size].copy_from_slice(header.as_bytes());
        } else {
            let header = MachHeader {
                magic: MH_MAGIC,
                cputype: self.cputype,
                cpusubtype: self.cpusubtype,
                filetype: self.filetype,
                ncmds: cmds.len() as u32,
                sizeofcmds: sizeofcmds as u32,
                flags: self.flags,
            };
            out[..header_size].copy_from_slice(header.as_bytes());
        }
        let mut at = header_size;
        for cmd in &cmds {
            out[at..at + cmd.len()].copy_from_slice(cmd);
            at += cmd.len();
        }
        for (segment, offset, bytes) in &self.writes {
            let seg = self
                .segments
                .iter()
                .find(|s| &s.name == segment)
                .expect("segment exists");
            let start = (seg.file_offset + offset) as usize;
            out[start..start + bytes.len()].copy_from_slice(bytes);
        }
        let le_start = linkedit_off as usize;
        out[le_start..].copy_from_slice(&le.bytes);
        out
    }

    fn segment_command(&self, seg: &SegmentSpec) -> Vec<u8> {
        let mut out = Vec::new();
        if self.is_64() {
            let mut cmd = SegmentCommand64::default();
            cmd.cmdsize = (SegmentCommand64::SIZE + seg.sections.len() * Section64::SIZE) as u32;
            cmd.set_name(&seg.name);
            cmd.vmaddr = seg.vm_addr;
            cmd.vmsize = seg.vm_size;
            cmd.fileoff = seg.file_offset;
            cmd.filesize = seg.file_size;
            cmd.maxprot = seg.max_prot;
            cmd.initprot = seg.init_prot;
            cmd.nsects = seg.sections.len() as u32;
            cmd.flags = seg.flags;
            out.extend_from_slice(cmd.as_bytes());
            for s in &seg.sections {
                let mut sect = Section64 {
                    sectname: [0; 16],
                    segname: [0; 16],
                    addr: s.addr,
                    size: s.size,
                    offset: s.offset,
                    align: s.align,
                    reloff: s.reloff,
                    nreloc: s.nreloc,
                    flags: s.flags,
                    reserved1: s.reserved1,
                    reserved2: s.reserved2,
                    reserved3: 0,
                };
                sect.set_names(&seg.name, &s.name);
                out.extend_from_slice(sect.as_bytes());
            }
        } else {
            let mut cmd = SegmentCommand::default();
            cmd.cmdsize = (SegmentCommand::SIZE + seg.sections.len() * Section::SIZE) as u32;
            cmd.set_name(&seg.name);
            cmd.vmaddr = seg.vm_addr as u32;
            cmd.vmsize = seg.vm_size as u32;
            cmd.fileoff = seg.file_offset as u32;
            cmd.filesize = seg.file_size as u32;
            cmd.maxprot = seg.max_prot;
            cmd.initprot = seg.init_prot;
            cmd.nsects = seg.sections.len() as u32;
            cmd.flags = seg.flags;
            out.extend_from_slice(cmd.as_bytes());
            for s in &seg.sections {
                let mut sect = Section {
                    sectname: [0; 16],
                    segname: [0; 16],
                    addr: s.addr as u32,
                    size: s.size as u32,
                    offset: s.offset,
                    align: s.align,
                    reloff: s.reloff,
                    nreloc: s.nreloc,
                    flags: s.flags,
                    reserved1: s.reserved1,
                    reserved2: s.reserved2,
                };
                sect.set_names(&seg.name, &s.name);
                out.extend_from_slice(sect.as_bytes());
            }
        }
        out
    }

    fn path_command(&self, kind: u32, fixed: usize, path: &str, fill: impl FnOnce(&mut [u8])) -> Vec<u8> {
        let size = align_up((fixed + path.len() + 1) as u64, self.pointer_size()) as usize;
        let mut cmd = vec![0u8; size];
        cmd[0..4].copy_from_slice(&kind.to_le_bytes());
        cmd[4..8].copy_from_slice(&(size as u32).to_le_bytes());
        fill(&mut cmd);
        cmd[fixed..fixed + path.len()].copy_from_slice(path.as_bytes());
        cmd
    }

    fn dylib_command(&self, kind: u32, path: &str) -> Vec<u8> {
        self.path_command(kind, DylibCommand::SIZE, path, |cmd| {
            let header = DylibCommand {
                cmd: kind,
                cmdsize: 0,
                name_offset: DylibCommand::SIZE as u32,
                timestamp: 2,
                current_version: 0x0001_0000,
                compatibility_version: 0x0001_0000,
            };
            let size = cmd[4..8].to_vec();
            cmd[..DylibCommand::SIZE].copy_from_slice(header.as_bytes());
            cmd[4..8].copy_from_slice(&size);
        })
    }

    fn entry_command(&self, entry: EntrySpec) -> Vec<u8> {
        match entry {
            EntrySpec::Main(entryoff) => EntryPointCommand {
                cmd: LC_MAIN,
                cmdsize: EntryPointCommand::SIZE as u32,
                entryoff,
                stacksize: 0,
            }
            .as_bytes()
            .to_vec(),
            EntrySpec::Thread(pc) => {
                // (flavor, count of u32s, pc register index)
                let (flavor, count, index) = match self.cputype {
                    CPU_TYPE_X86_64 => (4u32, 42u32, 16usize),
                    CPU_TYPE_ARM64 => (6, 68, 32),
                    CPU_TYPE_I386 => (1, 16, 10),
                    _ => (1, 17, 15),
                };
                let size = ThreadCommand::SIZE + count as usize * 4;
                let header = ThreadCommand {
                    cmd: LC_UNIXTHREAD,
                    cmdsize: size as u32,
                    flavor,
                    count,
                };
                let mut cmd = vec![0u8; size];
                cmd[..ThreadCommand::SIZE].copy_from_slice(header.as_bytes());
                if self.is_64() {
                    let at = ThreadCommand::SIZE + index * 8;
                    cmd[at..at + 8].copy_from_slice(&pc.to_le_bytes());
                } else {
                    let at = ThreadCommand::SIZE + index * 4;
                    cmd[at..at + 4].copy_from_slice(&(pc as u32).to_le_bytes());
                }
                cmd
            }
        }
    }
}

impl SectionSpec {
    pub fn new(name: &str, addr: u64, size: u64, offset: u32, align: u32, flags: u32) -> Self {
        Self {
            name: name.to_string(),
            addr,
            size,
            offset,
            align,
            reloff: 0,
            nreloc: 0,
            flags,
            reserved1: 0,
            reserved2: 0,
        }
    }
}

/// Accumulates LINKEDIT content at aligned offsets.
struct LinkeditBlobs {
    base: u64,
    bytes: Vec<u8>,
}

impl LinkeditBlobs {
    fn new(base: u64) -> Self {
        Self {
            base,
            bytes: Vec::new(),
        }
    }

    fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// Appends `blob` and returns its (file offset, size). Empty blobs
    /// take no space.
    fn place(&mut self, blob: &[u8], align: u64) -> (u32, u32) {
        let start = align_up(self.len(), align);
        self.bytes.resize(start as usize, 0);
        self.bytes.extend_from_slice(blob);
        ((self.base + start) as u32, blob.len() as u32)
    }
}

// =============================================================================
// Opcode Streams
// =============================================================================

/// Writes bind opcode streams.
#[derive(Debug, Default, Clone)]
pub struct BindStream {
    bytes: Vec<u8>,
}

impl BindStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ordinal(mut self, ordinal: u8) -> Self {
        if ordinal <= 0xF {
            self.bytes.push(BIND_OPCODE_SET_DYLIB_ORDINAL_IMM | ordinal);
        } else {
            self.bytes.push(BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB);
            write_uleb128(ordinal as u64, &mut self.bytes);
        }
        self
    }

    /// BIND_OPCODE_SET_DYLIB_SPECIAL_IMM for 0, -1, -2 or -3.
    pub fn special(mut self, ordinal: i8) -> Self {
        self.bytes
            .push(BIND_OPCODE_SET_DYLIB_SPECIAL_IMM | (ordinal as u8 & BIND_IMMEDIATE_MASK));
        self
    }

    pub fn symbol(mut self, name: &str, flags: u8) -> Self {
        self.bytes.push(BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM | flags);
        self.bytes.extend_from_slice(name.as_bytes());
        self.bytes.push(0);
        self
    }

    pub fn kind(mut self, kind: u8) -> Self {
        self.bytes.push(BIND_OPCODE_SET_TYPE_IMM | kind);
        self
    }

    pub fn addend(mut self, addend: i64) -> Self {
        self.bytes.push(BIND_OPCODE_SET_ADDEND_SLEB);
        write_sleb128(addend, &mut self.bytes);
        self
    }

    pub fn segment(mut self, index: u8, offset: u64) -> Self {
        self.bytes.push(BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | index);
        write_uleb128(offset, &mut self.bytes);
        self
    }

    pub fn add_addr(mut self, delta: u64) -> Self {
        self.bytes.push(BIND_OPCODE_ADD_ADDR_ULEB);
        write_uleb128(delta, &mut self.bytes);
        self
    }

    pub fn do_bind(mut self) -> Self {
        self.bytes.push(BIND_OPCODE_DO_BIND);
        self
    }

    pub fn do_bind_times_skipping(mut self, count: u64, skip: u64) -> Self {
        self.bytes.push(BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB);
        write_uleb128(count, &mut self.bytes);
        write_uleb128(skip, &mut self.bytes);
        self
    }

    pub fn threaded_table_size(mut self, count: u64) -> Self {
        self.bytes
            .push(BIND_OPCODE_THREADED | BIND_SUBOPCODE_THREADED_SET_BIND_ORDINAL_TABLE_SIZE_ULEB);
        write_uleb128(count, &mut self.bytes);
        self
    }

    pub fn threaded_apply(mut self) -> Self {
        self.bytes.push(BIND_OPCODE_THREADED | BIND_SUBOPCODE_THREADED_APPLY);
        self
    }

    pub fn raw(mut self, byte: u8) -> Self {
        self.bytes.push(byte);
        self
    }

    pub fn done(mut self) -> Self {
        self.bytes.push(BIND_OPCODE_DONE);
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.bytes
    }
}

/// Encodes a flat export trie: the root has one edge per symbol.
pub fn export_trie(entries: &[(&str, u64)]) -> Vec<u8> {
    let children: Vec<Vec<u8>> = entries
        .iter()
        .map(|(_, offset)| {
            let mut info = Vec::new();
            write_uleb128(0, &mut info);
            write_uleb128(*offset, &mut info);
            let mut node = Vec::new();
            write_uleb128(info.len() as u64, &mut node);
            node.extend_from_slice(&info);
            node.push(0);
            node
        })
        .collect();

    // the root size depends on the encoded child offsets
    let mut root_len = 2;
    loop {
        let mut root = vec![0u8, entries.len() as u8];
        let mut child_offset = root_len;
        for ((name, _), child) in entries.iter().zip(&children) {
            root.extend_from_slice(name.as_bytes());
            root.push(0);
            write_uleb128(child_offset as u64, &mut root);
            child_offset += child.len();
        }
        if root.len() == root_len {
            root.extend(children.concat());
            return root;
        }
        root_len = root.len();
    }
}

// =============================================================================
// Chained Fixups
// =============================================================================

/// One `dyld_chained_starts_in_segment` to encode.
#[derive(Debug, Clone)]
pub struct SegmentStarts {
    pub segment_index: usize,
    pub pointer_format: u16,
    pub segment_offset: u64,
    pub page_size: u16,
    pub max_valid_pointer: u32,
    pub page_starts: Vec<u16>,
    /// Chain starts for pages with several chains
    pub overflow: Vec<u16>,
}

impl SegmentStarts {
    /// One page of `page_size` whose chain starts at `first`.
    pub fn new(segment_index: usize, pointer_format: u16, segment_offset: u64, page_size: u16, first: u16) -> Self {
        Self {
            segment_index,
            pointer_format,
            segment_offset,
            page_size,
            max_valid_pointer: 0,
            page_starts: vec![first],
            overflow: Vec::new(),
        }
    }
}

/// Encodes an LC_DYLD_CHAINED_FIXUPS payload.
#[derive(Debug, Clone)]
pub struct ChainedFixupsBlob {
    pub seg_count: u32,
    pub segments: Vec<SegmentStarts>,
    pub imports_format: u32,
    /// (lib ordinal, weak import, symbol name, addend)
    pub imports: Vec<(i32, bool, String, i64)>,
    pub fixups_version: u32,
    pub symbols_format: u32,
}

impl ChainedFixupsBlob {
    /// One-segment blob with `DYLD_CHAINED_IMPORT` entries.
    pub fn new(seg_count: u32) -> Self {
        Self {
            seg_count,
            segments: Vec::new(),
            imports_format: DYLD_CHAINED_IMPORT,
            imports: Vec::new(),
            fixups_version: 0,
            symbols_format: 0,
        }
    }

    pub fn segment(mut self, starts: SegmentStarts) -> Self {
        self.segments.push(starts);
        self
    }

    pub fn import(mut self, ordinal: i32, name: &str) -> Self {
        self.imports.push((ordinal, false, name.to_string(), 0));
        self
    }

    pub fn encode(&self) -> Vec<u8> {
        // starts_in_image
        let mut starts = Vec::new();
        starts.extend_from_slice(&self.seg_count.to_le_bytes());
        let table_at = starts.len();
        starts.resize(table_at + 4 * self.seg_count as usize, 0);
        for seg in &self.segments {
            while starts.len() % 8 != 0 {
                starts.push(0);
            }
            let offset = starts.len() as u32;
            let at = table_at + 4 * seg.segment_index;
            starts[at..at + 4].copy_from_slice(&offset.to_le_bytes());
            let fixed = ChainedStartsInSegment {
                size: (ChainedStartsInSegment::SIZE + 2 * (seg.page_starts.len() + seg.overflow.len())) as u32,
                page_size: seg.page_size,
                pointer_format: seg.pointer_format,
                segment_offset: seg.segment_offset,
                max_valid_pointer: seg.max_valid_pointer,
                page_count: seg.page_starts.len() as u16,
            };
            starts.extend_from_slice(&fixed.to_bytes());
            for start in seg.page_starts.iter().chain(&seg.overflow) {
                starts.extend_from_slice(&start.to_le_bytes());
            }
        }

        let mut symbols = vec![0u8];
        let mut imports = Vec::new();
        for (ordinal, weak, name, addend) in &self.imports {
            let name_offset = symbols.len() as u32;
            symbols.extend_from_slice(name.as_bytes());
            symbols.push(0);
            match self.imports_format {
                DYLD_CHAINED_IMPORT_ADDEND64 => {
                    let raw = (*ordinal as u16 as u64)
                        | ((*weak as u64) << 16)
                        | ((name_offset as u64) << 32);
                    imports.extend_from_slice(&raw.to_le_bytes());
                    imports.extend_from_slice(&addend.to_le_bytes());
                }
                format => {
                    let raw = (*ordinal as u8 as u32) | ((*weak as u32) << 8) | (name_offset << 9);
                    imports.extend_from_slice(&raw.to_le_bytes());
                    if format == DYLD_CHAINED_IMPORT_ADDEND {
                        imports.extend_from_slice(&(*addend as i32).to_le_bytes());
                    }
                }
            }
        }

        let starts_offset = DyldChainedFixupsHeader::SIZE as u32 + 4;
        let imports_offset = align_up(starts_offset as u64 + starts.len() as u64, 8) as u32;
        let symbols_offset = imports_offset + imports.len() as u32;
        let header = DyldChainedFixupsHeader {
            fixups_version: self.fixups_version,
            starts_offset,
            imports_offset,
            symbols_offset,
            imports_count: self.imports.len() as u32,
            imports_format: self.imports_format,
            symbols_format: self.symbols_format,
        };
        let mut out = header.as_bytes().to_vec();
        out.resize(starts_offset as usize, 0);
        out.extend_from_slice(&starts);
        out.resize(imports_offset as usize, 0);
        out.extend_from_slice(&imports);
        out.extend_from_slice(&symbols);
        while out.len() % 8 != 0 {
            out.push(0);
        }
        out
    }
}

/// Encodes a `DYLD_CHAINED_PTR_64` rebase: target, next stride count.
pub fn chained_ptr64_rebase(target: u64, next: u64) -> u64 {
    (target & 0xF_FFFF_FFFF) | ((next & 0xFFF) << 51)
}

/// Encodes a `DYLD_CHAINED_PTR_64` bind: import ordinal, next stride count.
pub fn chained_ptr64_bind(ordinal: u32, next: u64) -> u64 {
    (ordinal as u64 & 0xFF_FFFF) | ((next & 0xFFF) << 51) | (1 << 63)
}
