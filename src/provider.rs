//! Loading files from disk and picking the slice to analyze.
//!
//! A [`FileProvider`] turns a path into a [`LoadedFile`]. Universal (fat)
//! files are narrowed to the best slice for the requested architectures
//! before validation sees them.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::ops::{ControlFlow, Range};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;
use tracing::{debug, info};

use crate::analyzer::{remap_if_zero_fill, validate, RemappedImage, ValidatedImage, ValidationOptions};
use crate::diag::Diagnostics;
use crate::error::{Error, Result};
use crate::macho::*;
use crate::util::greater_than_add_or_overflow;

/// Size of the fixed part of a fat header.
const FAT_HEADER_SIZE: usize = 8;

/// Most `fat_arch` records that fit in the first page.
const MAX_FAT_ARCHS: u32 = ((4096 - FAT_HEADER_SIZE) / FatArch::SIZE) as u32;

// =============================================================================
// Loaded File
// =============================================================================

#[derive(Debug)]
enum Contents {
    Mapped(Mmap),
    Shared(Arc<[u8]>),
}

impl Contents {
    fn bytes(&self) -> &[u8] {
        match self {
            Contents::Mapped(mmap) => &mmap[..],
            Contents::Shared(bytes) => &bytes[..],
        }
    }
}

/// A file handed out by a [`FileProvider`].
///
/// The mapping is released when the value is dropped.
#[derive(Debug)]
pub struct LoadedFile {
    path: PathBuf,
    real_path: PathBuf,
    contents: Contents,
    range: Range<usize>,
}

impl LoadedFile {
    fn new(path: PathBuf, real_path: PathBuf, contents: Contents) -> Self {
        let len = contents.bytes().len();
        Self {
            path,
            real_path,
            contents,
            range: 0..len,
        }
    }

    /// Path the file was requested as.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path after resolving symlinks.
    pub fn real_path(&self) -> &Path {
        &self.real_path
    }

    /// The whole file, regardless of any slice selection.
    pub fn file_bytes(&self) -> &[u8] {
        self.contents.bytes()
    }

    /// The bytes currently selected, the whole file unless narrowed.
    pub fn bytes(&self) -> &[u8] {
        &self.contents.bytes()[self.range.clone()]
    }

    /// Offset of the selected bytes within the file.
    pub fn slice_offset(&self) -> u64 {
        self.range.start as u64
    }

    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    /// Narrows the file to `len` bytes at `offset`, relative to the whole
    /// file. Nothing outside the new range is reachable afterwards.
    pub fn unload_partial_file(&mut self, offset: u64, len: u64) -> Result<()> {
        let file_len = self.contents.bytes().len() as u64;
        if greater_than_add_or_overflow(offset, len, file_len) {
            return Err(Error::MalformedFat(format!(
                "range 0x{:X}+0x{:X} extends beyond end of file",
                offset, len
            )));
        }
        // both fit in file_len, which is a usize
        self.range = offset as usize..(offset + len) as usize;
        Ok(())
    }

    /// Narrows a fat file to its best slice for `archs`. A thin file is left
    /// unchanged.
    pub fn select_slice(&mut self, archs: &GradedArchs, is_os_binary: bool) -> Result<()> {
        let path = self.path.display().to_string();
        if let Some(slice) = select_fat_slice(self.file_bytes(), archs, is_os_binary, &path)? {
            debug!(
                "{}: using slice #{} ({}) at 0x{:X}",
                path,
                slice.index,
                arch_name(slice.cputype, slice.cpusubtype),
                slice.offset
            );
            self.unload_partial_file(slice.offset, slice.size)?;
        }
        Ok(())
    }

    /// Runs both validation phases on the selected bytes.
    ///
    /// When the segments need a zero-fill expansion the memory layout copy is
    /// built between the phases. LINKEDIT content is located by file offset,
    /// so the second phase still reads the file view.
    pub fn validate(&self, options: &ValidationOptions) -> Result<LoadedImage<'_>> {
        let path = self.path.display().to_string();
        let mut validated = validate(self.bytes(), &path, options)?;
        let remapped = remap_if_zero_fill(self.bytes())?;
        let warnings = validated.validate_linkedit()?;
        info!("{}: valid ({} warnings)", path, warnings.len());
        Ok(LoadedImage {
            validated,
            remapped,
            warnings,
        })
    }
}

/// A file that passed both validation phases.
#[derive(Debug)]
pub struct LoadedImage<'a> {
    validated: ValidatedImage<'a>,
    remapped: Option<RemappedImage>,
    warnings: Vec<String>,
}

impl<'a> LoadedImage<'a> {
    pub fn validated(&self) -> &ValidatedImage<'a> {
        &self.validated
    }

    pub fn image(&self) -> &MachOImage<'a> {
        self.validated.image()
    }

    /// The runtime layout copy, if the file could not be used as is.
    pub fn remapped(&self) -> Option<&RemappedImage> {
        self.remapped.as_ref()
    }

    /// Non-fatal findings of the LINKEDIT phase.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}

// =============================================================================
// Providers
// =============================================================================

/// Source of file contents.
pub trait FileProvider: Send + Sync {
    /// Loads the whole file at `path`.
    fn load_file(&self, path: &Path) -> Result<LoadedFile>;

    /// Loads `path` and narrows it to the best slice for `options`.
    fn load_slice(&self, path: &Path, options: &ValidationOptions) -> Result<LoadedFile> {
        let mut file = self.load_file(path)?;
        file.select_slice(&options.archs, options.is_os_binary)?;
        Ok(file)
    }
}

/// Memory maps files read-only.
#[derive(Debug, Clone, Copy, Default)]
pub struct MmapFileProvider;

impl FileProvider for MmapFileProvider {
    fn load_file(&self, path: &Path) -> Result<LoadedFile> {
        let file = File::open(path).map_err(|e| Error::FileOpen {
            path: path.to_path_buf(),
            source: e,
        })?;
        let real_path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());

        let len = file
            .metadata()
            .map_err(|e| Error::FileOpen {
                path: path.to_path_buf(),
                source: e,
            })?
            .len();
        // mapping zero bytes fails on some systems
        let contents = if len == 0 {
            Contents::Shared(Arc::<[u8]>::from(Vec::new()))
        } else {
            let mmap = unsafe { Mmap::map(&file) }.map_err(|e| Error::MemoryMap {
                path: path.to_path_buf(),
                source: e,
            })?;
            Contents::Mapped(mmap)
        };
        debug!("mapped {} ({:#x} bytes)", path.display(), len);
        Ok(LoadedFile::new(path.to_path_buf(), real_path, contents))
    }
}

/// Serves files from memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryFileProvider {
    files: HashMap<PathBuf, Arc<[u8]>>,
}

impl MemoryFileProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<PathBuf>, bytes: impl Into<Arc<[u8]>>) {
        self.files.insert(path.into(), bytes.into());
    }
}

impl FileProvider for MemoryFileProvider {
    fn load_file(&self, path: &Path) -> Result<LoadedFile> {
        let bytes = self.files.get(path).ok_or_else(|| Error::FileOpen {
            path: path.to_path_buf(),
            source: io::Error::from(io::ErrorKind::NotFound),
        })?;
        Ok(LoadedFile::new(
            path.to_path_buf(),
            path.to_path_buf(),
            Contents::Shared(Arc::clone(bytes)),
        ))
    }
}

// =============================================================================
// Fat Files
// =============================================================================

/// One architecture of a fat file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FatSlice {
    pub index: u32,
    pub cputype: u32,
    pub cpusubtype: u32,
    pub offset: u64,
    pub size: u64,
}

/// Returns true if `data` starts with a fat header.
pub fn is_fat(data: &[u8]) -> bool {
    matches!(fat_magic(data), Some(FAT_MAGIC | FAT_MAGIC_64))
}

fn fat_magic(data: &[u8]) -> Option<u32> {
    use byteorder::{BigEndian, ByteOrder};
    data.get(..4).map(BigEndian::read_u32)
}

fn check_slice(data: &[u8], slice: &FatSlice, diag: &mut Diagnostics) -> bool {
    if greater_than_add_or_overflow(slice.offset, slice.size, data.len() as u64) {
        diag.error(Error::MalformedFat(format!(
            "slice {} extends beyond end of file",
            slice.index
        )));
        return false;
    }
    let start = slice.offset as usize;
    let bytes = &data[start..start + slice.size as usize];
    let image = match MachOImage::parse(bytes) {
        Ok(image) => image,
        Err(err) => {
            diag.error(err);
            return false;
        }
    };
    if !image.is_macho(diag) {
        return false;
    }
    if image.cputype() != slice.cputype || image.cpusubtype() != slice.cpusubtype {
        diag.error(Error::MalformedFat("cpu type/subtype mismatch".into()));
        return false;
    }
    let page_mask = if image.uses_16k_pages() { 0x3FFF } else { 0xFFF };
    if slice.offset & page_mask != 0 {
        let message = if bytes.starts_with(b"!<arch>") {
            "file is static library"
        } else {
            "slice is not page aligned"
        };
        diag.error(Error::MalformedFat(message.into()));
        return false;
    }
    true
}

/// Calls `f` with every valid slice of a fat file.
///
/// Invalid slices are reported to `diag` and skipped. Files with the 32-bit
/// header may carry one extra arm64 slice past the declared count.
pub fn for_each_fat_slice<F>(data: &[u8], diag: &mut Diagnostics, mut f: F)
where
    F: FnMut(&FatSlice) -> ControlFlow<()>,
{
    use byteorder::{BigEndian, ByteOrder};

    let is_64 = match fat_magic(data) {
        Some(FAT_MAGIC) => false,
        Some(FAT_MAGIC_64) => true,
        _ => {
            diag.error(Error::MalformedFat("not a fat file".into()));
            return;
        }
    };
    let Some(count) = data.get(4..8).map(BigEndian::read_u32) else {
        diag.error(Error::MalformedFat("fat header truncated".into()));
        return;
    };
    if count > MAX_FAT_ARCHS {
        diag.error(Error::MalformedFat(format!("fat header too large: {} entries", count)));
        return;
    }

    let record = if is_64 { FatArch::SIZE_64 } else { FatArch::SIZE };
    let slice_at = |index: u32| {
        FatArch::parse(data, FAT_HEADER_SIZE + index as usize * record, is_64).map(|arch| FatSlice {
            index,
            cputype: arch.cputype,
            cpusubtype: arch.cpusubtype,
            offset: arch.offset,
            size: arch.size,
        })
    };

    for index in 0..count {
        let Some(slice) = slice_at(index) else {
            diag.error(Error::MalformedFat(format!("slice {} extends beyond end of file", index)));
            continue;
        };
        if check_slice(data, &slice, diag) && f(&slice).is_break() {
            return;
        }
    }

    if !is_64 && count != MAX_FAT_ARCHS {
        if let Some(slice) = slice_at(count) {
            let hidden_arm64 = slice.cputype == CPU_TYPE_ARM64
                && matches!(slice.cpusubtype, CPU_SUBTYPE_ARM64_ALL | CPU_SUBTYPE_ARM64_V8);
            if hidden_arm64 && check_slice(data, &slice, diag) {
                debug!("found arm64 slice past the declared count at 0x{:X}", slice.offset);
                let _ = f(&slice);
            }
        }
    }
}

/// Returns the best graded slice of a fat file, or `None` if `data` is not
/// fat. Any invalid slice fails the whole file.
pub fn select_fat_slice(
    data: &[u8],
    archs: &GradedArchs,
    is_os_binary: bool,
    path: &str,
) -> Result<Option<FatSlice>> {
    if !is_fat(data) {
        return Ok(None);
    }
    let mut diag = Diagnostics::new();
    let mut best: Option<(u32, FatSlice)> = None;
    for_each_fat_slice(data, &mut diag, |slice| {
        let grade = archs.grade(slice.cputype, slice.cpusubtype, is_os_binary);
        if grade != 0 && best.map_or(true, |(g, _)| grade > g) {
            best = Some((grade, *slice));
        }
        ControlFlow::Continue(())
    });
    diag.check()?;
    match best {
        Some((_, slice)) => Ok(Some(slice)),
        None => Err(Error::MalformedArch(format!("missing compatible arch in {}", path))),
    }
}
