use std::path::{Path, PathBuf};
use std::process::ExitCode;

use bootpack_oxide::{
    extract::read_model, repack_boot_image, repack_ramdisk, Archiver, Codecs, CompressionKind,
    CpioCommand, Error, ExtractOptions, ExtractReport, Extractor, Warnings,
};
use clap::{Parser, ValueEnum};
use log::{info, warn};

/// Unpack, modify, or repack Android boot images.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Operation to perform
    #[arg(value_enum)]
    operation: Operation,

    /// Path to the boot image file
    boot_img: PathBuf,

    /// Directory to store extracted files
    #[arg(long, default_value = "output")]
    output_dir: PathBuf,

    /// Skip ramdisk extraction
    #[arg(long)]
    skip_ramdisk: bool,

    /// Skip DTB/DTBO extraction
    #[arg(long)]
    skip_dtb: bool,

    /// Skip AVB signature scanning (on by default)
    #[arg(long, default_value_t = true)]
    skip_avb: bool,

    /// Force extraction despite errors
    #[arg(long)]
    force: bool,

    /// Log the file list of each unpacked cpio archive
    #[arg(long)]
    debug_cpio: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
enum Operation {
    /// Unpack the image into its components
    Extract,
    /// Rebuild an image from a components directory
    Repack,
    /// Extract, rebuild the ramdisks, and repack
    Full,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("An error occurred: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> bootpack_oxide::Result<()> {
    info!("using output directory: {}", args.output_dir.display());

    let codecs = Codecs::default();
    let archiver = CpioCommand::discover();
    if archiver.is_none() {
        warn!("no cpio archiver found; ramdisk contents will stay packed");
    }

    let image = match args.operation {
        Operation::Extract => {
            extract(args, &codecs, archiver.as_ref())?;
            return Ok(());
        }
        Operation::Full => {
            let report = extract(args, &codecs, archiver.as_ref())?;
            if let Some(archiver) = archiver.as_ref() {
                rebuild_ramdisks(&report, archiver, &codecs);
            }
            report.image
        }
        Operation::Repack => {
            let (image, warnings) = read_model(&args.boot_img, args.force)?;
            report_warnings(&warnings, "header read");
            image
        }
    };

    let output = args.output_dir.join("new-boot.img");
    match repack_boot_image(&image, &args.output_dir, &output) {
        Ok(()) => info!("new boot image created: {}", output.display()),
        Err(Error::TimedOut(phase)) => warn!("{phase} timed out, no image written"),
        Err(err) => return Err(err),
    }
    Ok(())
}

fn extract(
    args: &Args,
    codecs: &Codecs,
    archiver: Option<&CpioCommand>,
) -> bootpack_oxide::Result<ExtractReport> {
    let options = ExtractOptions {
        skip_ramdisk: args.skip_ramdisk,
        skip_dtb: args.skip_dtb,
        skip_avb: args.skip_avb,
        force: args.force,
        debug_cpio: args.debug_cpio,
    };
    let mut extractor = Extractor::new(options).codecs(*codecs);
    if let Some(archiver) = archiver {
        extractor = extractor.archiver(archiver);
    }
    let report = extractor.extract(&args.boot_img, &args.output_dir)?;
    report_warnings(&report.warnings, "extraction");
    info!(
        "extraction complete, files are in {}",
        args.output_dir.display()
    );
    Ok(report)
}

/// Re-packs the unpacked ramdisk directories into their compressed files,
/// preserving each ramdisk's original compression.
fn rebuild_ramdisks(report: &ExtractReport, archiver: &dyn Archiver, codecs: &Codecs) {
    let jobs = [
        (
            &report.ramdisk_dir,
            &report.ramdisk_path,
            match report.image.ramdisk_compression {
                CompressionKind::Unknown => CompressionKind::Gzip,
                kind => kind,
            },
        ),
        (
            &report.vendor_ramdisk_dir,
            &report.vendor_ramdisk_path,
            report
                .vendor_ramdisk_path
                .as_deref()
                .map_or(CompressionKind::Gzip, kind_from_extension),
        ),
    ];
    for (dir, path, kind) in jobs {
        let (Some(dir), Some(path)) = (dir, path) else {
            continue;
        };
        info!("ramdisk directory ready for modification: {}", dir.display());
        let mut warnings = Warnings::default();
        if let Err(err) = repack_ramdisk(archiver, codecs, dir, path, kind, &mut warnings) {
            warn!("failed to repack {}: {err}", path.display());
        }
    }
}

fn kind_from_extension(path: &Path) -> CompressionKind {
    match path.extension().and_then(|e| e.to_str()) {
        Some("lz4") => CompressionKind::Lz4,
        Some("zst") => CompressionKind::Zstd,
        _ => CompressionKind::Gzip,
    }
}

fn report_warnings(warnings: &Warnings, phase: &str) {
    if !warnings.is_empty() {
        warn!("{} finished with {} warning(s)", phase, warnings.len());
    }
}
