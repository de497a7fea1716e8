//! Export trie parsing.
//!
//! The export trie is a compact representation of exported symbols in a Mach-O file.
//! It uses a trie (prefix tree) structure where each node can contain:
//! - Terminal information (flags, image offset, optional other value)
//! - Children edges (label prefix + offset to child node)
//!
//! Every read is bounded by the trie blob, so a corrupt trie fails with
//! [`Error::MalformedExportTrie`] instead of reading past it.
//!
//! The loader only bounds its walk. Walks here also reject a child that
//! points back at one of its ancestors, and [`MachOImage::find_exported_symbol`]
//! gives up after a fixed number of nodes. Both are extra hardening; keep
//! them even though valid tries never trip them.

use std::ops::ControlFlow;

use crate::analyzer::LinkEditInfo;
use crate::diag::Diagnostics;
use crate::error::{Error, Result};
use crate::macho::MachOImage;
use crate::util::{read_uleb128, LebError};

// =============================================================================
// Export Flags
// =============================================================================

/// Export symbol kind mask.
pub const EXPORT_SYMBOL_FLAGS_KIND_MASK: u64 = 0x03;

/// Regular export.
pub const EXPORT_SYMBOL_FLAGS_KIND_REGULAR: u64 = 0x00;

/// Thread-local variable.
pub const EXPORT_SYMBOL_FLAGS_KIND_THREAD_LOCAL: u64 = 0x01;

/// Absolute symbol (not relative to any section).
pub const EXPORT_SYMBOL_FLAGS_KIND_ABSOLUTE: u64 = 0x02;

/// Weak definition.
pub const EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION: u64 = 0x04;

/// Re-export from another dylib.
pub const EXPORT_SYMBOL_FLAGS_REEXPORT: u64 = 0x08;

/// Stub and resolver.
pub const EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER: u64 = 0x10;

/// Lookups give up after visiting this many nodes.
const MAX_LOOKUP_NODES: usize = 128;

// =============================================================================
// Export Info
// =============================================================================

/// Information about an exported symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportInfo {
    /// Symbol name
    pub name: String,
    /// Export flags
    pub flags: u64,
    /// Offset of the symbol from the start of the image; 0 for re-exports
    pub image_offset: u64,
    /// For re-exports: ordinal of the source dylib
    pub reexport_ordinal: Option<u32>,
    /// For re-exports: imported symbol name, if it differs from `name`
    pub reexport_name: Option<String>,
    /// For stub+resolver: resolver function offset
    pub resolver_offset: Option<u64>,
}

impl ExportInfo {
    /// Returns true if this is a re-export.
    #[inline]
    pub fn is_reexport(&self) -> bool {
        (self.flags & EXPORT_SYMBOL_FLAGS_REEXPORT) != 0
    }

    /// Returns true if this is a weak definition.
    #[inline]
    pub fn is_weak(&self) -> bool {
        (self.flags & EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION) != 0
    }

    /// Returns true if this is a stub with resolver.
    #[inline]
    pub fn is_stub_and_resolver(&self) -> bool {
        (self.flags & EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER) != 0
    }

    #[inline]
    pub fn is_thread_local(&self) -> bool {
        self.kind() == EXPORT_SYMBOL_FLAGS_KIND_THREAD_LOCAL
    }

    #[inline]
    pub fn is_absolute(&self) -> bool {
        self.kind() == EXPORT_SYMBOL_FLAGS_KIND_ABSOLUTE
    }

    /// Returns the symbol kind.
    #[inline]
    pub fn kind(&self) -> u64 {
        self.flags & EXPORT_SYMBOL_FLAGS_KIND_MASK
    }
}

// =============================================================================
// Export Trie Parser
// =============================================================================

fn malformed(msg: String) -> Error {
    Error::MalformedExportTrie(msg)
}

fn leb_error(err: LebError, offset: usize) -> Error {
    malformed(format!("{} at trie offset 0x{:X}", err, offset))
}

/// Children of one node, already bounds checked.
struct Edge<'a> {
    label: &'a [u8],
    child: usize,
}

/// Parser for export tries.
#[derive(Debug, Clone, Copy)]
pub struct ExportTrie<'a> {
    data: &'a [u8],
}

impl<'a> ExportTrie<'a> {
    /// Creates a new parser for the given export trie data.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn uleb(&self, pos: &mut usize, end: usize) -> Result<u64> {
        let at = *pos;
        read_uleb128(self.data, pos, end).map_err(|e| leb_error(e, at))
    }

    /// Splits the node at `offset` into its terminal info range and edges.
    fn node(&self, offset: usize) -> Result<(Option<(usize, usize)>, Vec<Edge<'a>>)> {
        let end = self.data.len();
        if offset >= end {
            return Err(malformed(format!("node offset 0x{:X} beyond end of trie", offset)));
        }
        let mut p = offset;
        let terminal_size = self.uleb(&mut p, end)?;
        let children_start = (p as u64)
            .checked_add(terminal_size)
            .filter(|&c| c < end as u64)
            .ok_or_else(|| {
                malformed(format!("terminal info of node 0x{:X} extends beyond end of trie", offset))
            })? as usize;
        let terminal = (terminal_size != 0).then_some((p, children_start));

        p = children_start;
        let child_count = self.data[p];
        p += 1;
        let mut edges = Vec::with_capacity(child_count as usize);
        for _ in 0..child_count {
            let rest = &self.data[p..];
            let len = memchr::memchr(0, rest).ok_or_else(|| {
                malformed(format!("edge label of node 0x{:X} extends beyond end of trie", offset))
            })?;
            let label = &rest[..len];
            p += len + 1;
            let child = self.uleb(&mut p, end)?;
            if child == 0 {
                return Err(malformed(format!("child offset of node 0x{:X} is zero", offset)));
            }
            if child >= end as u64 {
                return Err(malformed(format!(
                    "child offset 0x{:X} of node 0x{:X} beyond end of trie",
                    child, offset
                )));
            }
            edges.push(Edge {
                label,
                child: child as usize,
            });
        }
        Ok((terminal, edges))
    }

    /// Decodes terminal info occupying `[start, end)`.
    fn terminal(&self, name: &[u8], start: usize, end: usize) -> Result<ExportInfo> {
        let mut p = start;
        let flags = self.uleb(&mut p, end)?;
        let mut export = ExportInfo {
            name: String::from_utf8_lossy(name).into_owned(),
            flags,
            image_offset: 0,
            reexport_ordinal: None,
            reexport_name: None,
            resolver_offset: None,
        };

        if flags & EXPORT_SYMBOL_FLAGS_REEXPORT != 0 {
            let ordinal = self.uleb(&mut p, end)?;
            export.reexport_ordinal = Some(ordinal as u32);
            let rest = &self.data[p..end];
            let len = memchr::memchr(0, rest).ok_or_else(|| {
                malformed(format!("re-export name of '{}' extends beyond terminal info", export.name))
            })?;
            // an empty import name means the symbol keeps its name
            if len != 0 {
                export.reexport_name = Some(String::from_utf8_lossy(&rest[..len]).into_owned());
            }
        } else {
            export.image_offset = self.uleb(&mut p, end)?;
            if flags & EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER != 0 {
                export.resolver_offset = Some(self.uleb(&mut p, end)?);
            }
        }
        Ok(export)
    }

    fn walk<F>(&self, offset: usize, name: &mut Vec<u8>, path: &mut Vec<usize>, f: &mut F) -> Result<ControlFlow<()>>
    where
        F: FnMut(&ExportInfo) -> ControlFlow<()>,
    {
        if path.contains(&offset) {
            return Err(malformed(format!("node 0x{:X} is its own descendant", offset)));
        }
        let (terminal, edges) = self.node(offset)?;
        if let Some((start, end)) = terminal {
            let export = self.terminal(name, start, end)?;
            if f(&export).is_break() {
                return Ok(ControlFlow::Break(()));
            }
        }

        path.push(offset);
        for edge in edges {
            let len = name.len();
            name.extend_from_slice(edge.label);
            let flow = self.walk(edge.child, name, path, f)?;
            name.truncate(len);
            if flow.is_break() {
                return Ok(ControlFlow::Break(()));
            }
        }
        path.pop();
        Ok(ControlFlow::Continue(()))
    }

    /// Calls `f` for each exported symbol, in trie order.
    pub fn for_each<F>(&self, mut f: F) -> Result<ControlFlow<()>>
    where
        F: FnMut(&ExportInfo) -> ControlFlow<()>,
    {
        if self.data.is_empty() {
            return Ok(ControlFlow::Continue(()));
        }
        self.walk(0, &mut Vec::new(), &mut Vec::new(), &mut f)
    }

    /// Parses all exports from the trie.
    pub fn parse_all(&self) -> Result<Vec<ExportInfo>> {
        let mut exports = Vec::new();
        self.for_each(|export| {
            exports.push(export.clone());
            ControlFlow::Continue(())
        })?;
        Ok(exports)
    }

    /// Looks up a single symbol by name.
    pub fn lookup(&self, name: &str) -> Result<Option<ExportInfo>> {
        if self.data.is_empty() {
            return Ok(None);
        }
        let name = name.as_bytes();
        let mut matched = 0;
        let mut offset = 0;
        let mut visited = Vec::new();
        loop {
            if visited.contains(&offset) || visited.len() == MAX_LOOKUP_NODES {
                return Err(malformed(format!("lookup of node 0x{:X} loops", offset)));
            }
            visited.push(offset);

            let (terminal, edges) = self.node(offset)?;
            if matched == name.len() {
                return match terminal {
                    Some((start, end)) => self.terminal(name, start, end).map(Some),
                    None => Ok(None),
                };
            }
            let rest = &name[matched..];
            let Some(edge) = edges.iter().find(|e| !e.label.is_empty() && rest.starts_with(e.label)) else {
                return Ok(None);
            };
            matched += edge.label.len();
            offset = edge.child;
        }
    }
}

// =============================================================================
// Image Integration
// =============================================================================

impl<'a> MachOImage<'a> {
    /// The export trie from LC_DYLD_INFO or LC_DYLD_EXPORTS_TRIE.
    pub fn exports_trie(&self, info: &LinkEditInfo) -> Result<Option<ExportTrie<'a>>> {
        if let Some(dyld_info) = info.dyld_info {
            if dyld_info.export_size == 0 {
                return Ok(None);
            }
            let data = self.linkedit_blob("exports trie", dyld_info.export_off, dyld_info.export_size as u64)?;
            return Ok(Some(ExportTrie::new(data)));
        }
        if let Some(cmd) = info.exports_trie {
            if cmd.datasize == 0 {
                return Ok(None);
            }
            let data = self.linkedit_blob("exports trie", cmd.dataoff, cmd.datasize as u64)?;
            return Ok(Some(ExportTrie::new(data)));
        }
        Ok(None)
    }

    /// Calls `f` for every symbol in the export trie. A malformed trie stops
    /// the walk and records the error in `diag`.
    pub fn for_each_exported_symbol<F>(&self, diag: &mut Diagnostics, f: F)
    where
        F: FnMut(&ExportInfo) -> ControlFlow<()>,
    {
        let walk = || -> Result<()> {
            let info = self.linkedit_info()?;
            if let Some(trie) = self.exports_trie(&info)? {
                trie.for_each(f)?;
            }
            Ok(())
        };
        if let Err(err) = walk() {
            diag.error(err);
        }
    }

    pub fn exports(&self, diag: &mut Diagnostics) -> Vec<ExportInfo> {
        let mut out = Vec::new();
        self.for_each_exported_symbol(diag, |export| {
            out.push(export.clone());
            ControlFlow::Continue(())
        });
        out
    }

    /// Finds `name` in the export trie without walking the whole trie.
    pub fn find_exported_symbol(&self, diag: &mut Diagnostics, name: &str) -> Option<ExportInfo> {
        let find = || -> Result<Option<ExportInfo>> {
            let info = self.linkedit_info()?;
            match self.exports_trie(&info)? {
                Some(trie) => trie.lookup(name),
                None => Ok(None),
            }
        };
        match find() {
            Ok(found) => found,
            Err(err) => {
                diag.error(err);
                None
            }
        }
    }
}
