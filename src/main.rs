//! machoguard - Mach-O structural validator and inspector.
//!
//! Validate many binaries at once, or dump what a single image declares.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use machoguard::macho::*;
use machoguard::provider::{for_each_fat_slice, is_fat};
use machoguard::{Diagnostics, FileProvider, LoadedFile, MmapFileProvider, ValidationOptions};

/// Structural validator for Mach-O binaries.
#[derive(Parser, Debug)]
#[command(name = "machoguard")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbosity level (0=quiet, 1=warnings, 2=info, 3=debug)
    #[arg(short, long, default_value = "1", global = true)]
    verbosity: u8,

    #[command(subcommand)]
    command: Commands,
}

/// How to pick and judge the image inside a file.
#[derive(Args, Debug, Clone)]
struct ImageArgs {
    /// Architecture to select (e.g., "arm64e", "arm64", "x86_64").
    /// Defaults to the file's own architecture, or arm64 for fat files.
    #[arg(short, long)]
    arch: Option<String>,

    /// Platform the image must support (e.g., "macos", "ios").
    /// Defaults to the first platform the image declares.
    #[arg(short, long)]
    platform: Option<String>,

    /// Inspection rules: also accept dylinkers, kexts, kernel collections
    /// and static executables
    #[arg(long)]
    offline: bool,

    /// Treat the image as part of the OS
    #[arg(long)]
    os_binary: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate one or more files
    Validate {
        #[command(flatten)]
        image: ImageArgs,

        /// Number of parallel jobs (default: number of CPUs)
        #[arg(short, long)]
        jobs: Option<usize>,

        /// Files to validate
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Show a summary of an image
    Info {
        #[command(flatten)]
        image: ImageArgs,
        file: PathBuf,
    },

    /// List the slices of a fat file
    Slices { file: PathBuf },

    /// List segments
    Segments {
        #[command(flatten)]
        image: ImageArgs,
        file: PathBuf,
    },

    /// List sections
    Sections {
        #[command(flatten)]
        image: ImageArgs,
        file: PathBuf,
    },

    /// List rebase locations from the opcode stream
    Rebases {
        #[command(flatten)]
        image: ImageArgs,
        file: PathBuf,
    },

    /// List binds, lazy binds and weak binds
    Binds {
        #[command(flatten)]
        image: ImageArgs,
        file: PathBuf,
    },

    /// List exported symbols
    Exports {
        #[command(flatten)]
        image: ImageArgs,
        file: PathBuf,
    },

    /// List chained fixups and their imports
    Chains {
        #[command(flatten)]
        image: ImageArgs,
        file: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbosity);
    let verbosity = cli.verbosity;

    match cli.command {
        Commands::Validate { image, jobs, files } => cmd_validate(&image, jobs, &files, verbosity),
        Commands::Info { image, file } => cmd_info(&image, &file, verbosity),
        Commands::Slices { file } => cmd_slices(&file),
        Commands::Segments { image, file } => cmd_segments(&image, &file, verbosity),
        Commands::Sections { image, file } => cmd_sections(&image, &file, verbosity),
        Commands::Rebases { image, file } => cmd_rebases(&image, &file, verbosity),
        Commands::Binds { image, file } => cmd_binds(&image, &file, verbosity),
        Commands::Exports { image, file } => cmd_exports(&image, &file, verbosity),
        Commands::Chains { image, file } => cmd_chains(&image, &file, verbosity),
    }
}

fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        _ => Level::DEBUG,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .finish();

    tracing::subscriber::set_global_default(subscriber).ok();
}

/// Loads `path`, picks its slice and works out the options to judge it by.
fn open(path: &Path, args: &ImageArgs, verbosity: u8) -> Result<(LoadedFile, ValidationOptions)> {
    let mut file = MmapFileProvider.load_file(path)?;

    let archs = match &args.arch {
        Some(name) => GradedArchs::from_name(name, false).with_context(|| format!("Unknown architecture: {}", name))?,
        None if is_fat(file.bytes()) => GradedArchs::default(),
        None => MachOImage::parse(file.bytes())
            .ok()
            .and_then(|image| GradedArchs::from_name(image.arch_name(), false))
            .unwrap_or_default(),
    };
    file.select_slice(&archs, args.os_binary)?;

    let platform = match &args.platform {
        Some(name) => Platform::from_name(name).with_context(|| format!("Unknown platform: {}", name))?,
        None => MachOImage::parse(file.bytes())
            .ok()
            .and_then(|image| image.supported_platforms().first().map(|p| p.platform))
            .unwrap_or(Platform::Unknown),
    };

    let options = if args.offline {
        ValidationOptions::offline(archs, platform)
    } else {
        ValidationOptions::loader(archs, platform)
    };
    Ok((
        file,
        options.with_os_binary(args.os_binary).with_verbosity(verbosity),
    ))
}

fn cmd_validate(args: &ImageArgs, jobs: Option<usize>, files: &[PathBuf], verbosity: u8) -> Result<()> {
    let start = Instant::now();

    if let Some(n) = jobs {
        rayon::ThreadPoolBuilder::new().num_threads(n).build_global().ok();
    }

    // a single file reports straight to the terminal
    if let [path] = files {
        let (file, options) = open(path, args, verbosity)?;
        let loaded = file
            .validate(&options)
            .with_context(|| format!("{} is not valid", path.display()))?;
        println!("{}: ok ({} warnings)", path.display(), loaded.warnings().len());
        return Ok(());
    }

    let progress = ProgressBar::new(files.len() as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );

    let warnings = AtomicUsize::new(0);
    let errors: Vec<_> = files
        .par_iter()
        .filter_map(|path| {
            let result = open(path, args, verbosity.saturating_sub(1)).and_then(|(file, options)| {
                let loaded = file.validate(&options)?;
                warnings.fetch_add(loaded.warnings().len(), Ordering::Relaxed);
                Ok(())
            });
            progress.inc(1);
            result.err().map(|e| (path.clone(), e))
        })
        .collect();

    progress.finish_and_clear();

    for (path, err) in &errors {
        error!("{}: {:#}", path.display(), err);
    }

    let elapsed = start.elapsed();
    info!(
        "Validated {} files in {:.2}s ({} warnings)",
        files.len(),
        elapsed.as_secs_f64(),
        warnings.load(Ordering::Relaxed)
    );

    if !errors.is_empty() {
        bail!("{}/{} files failed validation", errors.len(), files.len());
    }
    println!("{} files ok", files.len());
    Ok(())
}

fn cmd_slices(path: &Path) -> Result<()> {
    let file = MmapFileProvider.load_file(path)?;
    if !is_fat(file.bytes()) {
        let image = MachOImage::parse(file.bytes())
            .with_context(|| format!("{} is neither fat nor Mach-O", path.display()))?;
        println!("{}: thin {}", path.display(), image.arch_name());
        return Ok(());
    }

    let mut diag = Diagnostics::new();
    for_each_fat_slice(file.bytes(), &mut diag, |slice| {
        println!(
            "  [{:2}] {:<8} offset {:#010x} size {:>8}",
            slice.index,
            arch_name(slice.cputype, slice.cpusubtype),
            slice.offset,
            format_size(slice.size)
        );
        std::ops::ControlFlow::Continue(())
    });
    diag.check()?;
    Ok(())
}

fn cmd_info(args: &ImageArgs, path: &Path, verbosity: u8) -> Result<()> {
    let (file, options) = open(path, args, verbosity)?;
    let loaded = file.validate(&options)?;
    let image = loaded.image();
    let mut diag = Diagnostics::new().with_verbosity(verbosity);

    println!("Mach-O Image Information");
    println!("========================");
    println!("Path:         {}", path.display());
    if file.slice_offset() != 0 {
        println!("Slice:        {:#x}", file.slice_offset());
    }
    println!("Architecture: {}", image.arch_name());
    println!("File type:    {}", filetype_name(image.filetype()));
    println!("Flags:        {:?}", image.flags());
    if let Some(uuid) = image.uuid() {
        println!("UUID:         {}", format_uuid(&uuid));
    }
    if let Some(id) = image.install_name() {
        println!(
            "Install name: {} (current {}, compat {})",
            id.path,
            packed_version_string(id.current_version),
            packed_version_string(id.compatibility_version)
        );
    }
    println!("Load address: {:#x}", image.preferred_load_address());
    println!("Mapped size:  {}", format_size(image.mapped_size()));
    if let Some(entry) = image.entry() {
        let kind = if entry.uses_crt { "LC_UNIXTHREAD" } else { "LC_MAIN" };
        println!("Entry:        {:#x} ({})", entry.offset, kind);
    }
    if let Some((offset, size)) = image.code_signature() {
        println!("Signature:    {:#x} ({})", offset, format_size(size as u64));
    }
    if let Some(remapped) = loaded.remapped() {
        println!("Remapped:     {} from {:#x}", format_size(remapped.len() as u64), remapped.base_vm_addr());
    }

    let platforms = image.supported_platforms();
    if !platforms.is_empty() {
        println!("\nPlatforms:");
        for p in &platforms {
            println!(
                "  {:<14} min {:<8} sdk {}",
                p.platform,
                packed_version_string(p.min_os),
                packed_version_string(p.sdk)
            );
        }
    }

    let dependents = image.dependent_dylibs(&mut diag);
    if !dependents.is_empty() {
        println!("\nDependents:");
        for (i, dep) in dependents.iter().enumerate() {
            println!("  [{:2}] {} ({:?})", i + 1, dep.dylib.path, dep.kind);
        }
    }
    for rpath in image.rpaths() {
        println!("Rpath:        {}", rpath);
    }

    let initializers = image.initializers(&mut diag);
    if !initializers.is_empty() {
        println!("\nInitializers:");
        for offset in initializers {
            println!("  {:#x}", offset);
        }
    }
    if let Some(objc) = image.objc_image_info() {
        println!("\nObjC:         version {} flags {:#x}", objc.version, objc.flags);
        println!("  classes:    {}", image.objc_classes(&mut diag).len());
        println!("  selrefs:    {}", image.objc_selector_references(&mut diag).len());
        println!("  protocols:  {}", image.objc_protocols(&mut diag).len());
    }
    println!("\nFunction starts: {}", image.function_starts(&mut diag).len());
    println!("Warnings:        {}", loaded.warnings().len());

    diag.check()?;
    Ok(())
}

fn cmd_segments(args: &ImageArgs, path: &Path, verbosity: u8) -> Result<()> {
    let (file, options) = open(path, args, verbosity)?;
    let loaded = file.validate(&options)?;

    for seg in loaded.image().segments() {
        println!(
            "  [{:2}] {:<16} {:#018x} - {:#018x} ({:>8}) file {:#010x} ({:>8}) {}/{}",
            seg.index,
            seg.name,
            seg.vm_addr,
            seg.vm_addr + seg.vm_size,
            format_size(seg.vm_size),
            seg.file_offset,
            format_size(seg.file_size),
            format_prot(seg.init_prot),
            format_prot(seg.max_prot),
        );
    }
    Ok(())
}

fn cmd_sections(args: &ImageArgs, path: &Path, verbosity: u8) -> Result<()> {
    let (file, options) = open(path, args, verbosity)?;
    let loaded = file.validate(&options)?;

    for sect in loaded.image().sections() {
        println!(
            "  {:<32} {:#018x} ({:>8}) file {:#010x} type {:#04x}",
            sect.full_name(),
            sect.addr,
            format_size(sect.size),
            sect.file_offset,
            sect.section_type()
        );
    }
    Ok(())
}

fn cmd_rebases(args: &ImageArgs, path: &Path, verbosity: u8) -> Result<()> {
    let (file, options) = open(path, args, verbosity)?;
    let loaded = file.validate(&options)?;
    let image = loaded.image();
    let segments = image.segments();
    let mut diag = Diagnostics::new().with_verbosity(verbosity);

    for rebase in image.rebases(&mut diag) {
        println!(
            "  {:<16} {:#010x}  {:#010x}  {}",
            segment_name(&segments, rebase.segment_index),
            rebase.segment_offset,
            rebase.runtime_offset,
            rebase.kind
        );
    }
    diag.check()?;
    Ok(())
}

fn cmd_binds(args: &ImageArgs, path: &Path, verbosity: u8) -> Result<()> {
    let (file, options) = open(path, args, verbosity)?;
    let loaded = file.validate(&options)?;
    let image = loaded.image();
    let segments = image.segments();
    let mut diag = Diagnostics::new().with_verbosity(verbosity);

    for bind in image.binds(&mut diag) {
        let library = bind
            .library()
            .map(|l| l.to_string())
            .unwrap_or_else(|| bind.ordinal.to_string());
        let mut notes = Vec::new();
        if bind.lazy {
            notes.push("lazy");
        }
        if bind.weak_import {
            notes.push("weak-import");
        }
        println!(
            "  {:<16} {:#010x}  {:<6} {:>4}  {}{} {}",
            segment_name(&segments, bind.segment_index),
            bind.segment_offset,
            bind.kind,
            library,
            bind.symbol_name,
            if bind.addend != 0 { format!(" + {:#x}", bind.addend) } else { String::new() },
            notes.join(",")
        );
    }
    for symbol in image.strong_symbols(&mut diag) {
        println!("  strong {}", symbol);
    }
    diag.check()?;
    Ok(())
}

fn cmd_exports(args: &ImageArgs, path: &Path, verbosity: u8) -> Result<()> {
    let (file, options) = open(path, args, verbosity)?;
    let loaded = file.validate(&options)?;
    let image = loaded.image();
    let mut diag = Diagnostics::new().with_verbosity(verbosity);

    for export in image.exports(&mut diag) {
        if export.is_reexport() {
            let ordinal = export.reexport_ordinal.unwrap_or(0);
            match &export.reexport_name {
                Some(imported) => println!("  [re-export] {} (from {} as {})", export.name, ordinal, imported),
                None => println!("  [re-export] {} (from {})", export.name, ordinal),
            }
            continue;
        }
        let kind = if export.is_thread_local() {
            "tlv"
        } else if export.is_absolute() {
            "abs"
        } else {
            "reg"
        };
        let mut line = format!("  {:#010x} {} {}", export.image_offset, kind, export.name);
        if export.is_weak() {
            line.push_str(" [weak]");
        }
        if let Some(resolver) = export.resolver_offset {
            line.push_str(&format!(" [resolver {:#x}]", resolver));
        }
        println!("{}", line);
    }
    diag.check()?;
    Ok(())
}

fn cmd_chains(args: &ImageArgs, path: &Path, verbosity: u8) -> Result<()> {
    let (file, options) = open(path, args, verbosity)?;
    let loaded = file.validate(&options)?;
    let image = loaded.image();
    let segments = image.segments();
    let mut diag = Diagnostics::new().with_verbosity(verbosity);

    if !image.has_chained_fixups() {
        println!("{} has no chained fixups", path.display());
        return Ok(());
    }

    let imports = image.chained_imports(&mut diag);
    let base = image.preferred_load_address();
    for fixup in image.chained_fixups(&mut diag) {
        let location = format!("{:<16} {:#010x}", segment_name(&segments, fixup.segment_index), fixup.segment_offset);
        if let Some(ordinal) = fixup.bind_ordinal() {
            let name = imports
                .get(ordinal as usize)
                .map(|i| i.symbol_name.as_ref())
                .unwrap_or("<bad ordinal>");
            println!("  {}  bind   {}", location, name);
            continue;
        }
        match fixup.rebase_runtime_offset(base) {
            Some(target) => println!("  {}  rebase {:#x}", location, target),
            None => println!("  {}  {:?}", location, fixup.pointer),
        }
    }

    if !imports.is_empty() {
        println!("\nImports:");
        for (i, import) in imports.iter().enumerate() {
            let library = import
                .library()
                .map(|l| l.to_string())
                .unwrap_or_else(|| import.ordinal.to_string());
            println!(
                "  [{:4}] {:>4} {}{}",
                i,
                library,
                import.symbol_name,
                if import.weak_import { " [weak]" } else { "" }
            );
        }
    }
    diag.check()?;
    Ok(())
}

fn segment_name(segments: &[SegmentInfo], index: u32) -> &str {
    segments
        .get(index as usize)
        .map(|s| s.name.as_str())
        .unwrap_or("?")
}

fn filetype_name(filetype: u32) -> &'static str {
    match filetype {
        MH_OBJECT => "object",
        MH_EXECUTE => "executable",
        MH_DYLIB => "dylib",
        MH_DYLINKER => "dylinker",
        MH_BUNDLE => "bundle",
        MH_KEXT_BUNDLE => "kext bundle",
        MH_FILESET => "fileset",
        _ => "unknown",
    }
}

fn format_prot(prot: u32) -> String {
    format!(
        "{}{}{}",
        if prot & VM_PROT_READ != 0 { "r" } else { "-" },
        if prot & VM_PROT_WRITE != 0 { "w" } else { "-" },
        if prot & VM_PROT_EXECUTE != 0 { "x" } else { "-" },
    )
}

fn format_uuid(uuid: &[u8; 16]) -> String {
    let hex: Vec<String> = uuid.iter().map(|b| format!("{:02X}", b)).collect();
    format!(
        "{}-{}-{}-{}-{}",
        hex[0..4].concat(),
        hex[4..6].concat(),
        hex[6..8].concat(),
        hex[8..10].concat(),
        hex[10..16].concat()
    )
}

fn format_size(size: u64) -> String {
    if size >= 1024 * 1024 * 1024 {
        format!("{:.1}G", size as f64 / 1024.0 / 1024.0 / 1024.0)
    } else if size >= 1024 * 1024 {
        format!("{:.1}M", size as f64 / 1024.0 / 1024.0)
    } else if size >= 1024 {
        format!("{:.1}K", size as f64 / 1024.0)
    } else {
        format!("{}B", size)
    }
}
