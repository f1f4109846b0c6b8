use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    process::ExitCode,
};

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser};
use log::{info, warn};

use genpack_boot::{
    install::{Installer, DEFAULT_BOOT_PARTITION, INSTALLED},
    losetup::LoopbackDetector,
};

/// Install a genpack system image
#[derive(Parser, Debug)]
#[command(version, disable_help_flag = true)]
struct Args {
    #[arg(short, long, help = "Print help")]
    help: bool,

    #[arg(
        short,
        long,
        value_name = "DEVICE",
        help = "Install onto a whole disk instead of the running system's boot partition"
    )]
    disk: Option<PathBuf>,

    #[arg(long, help = "Don't create a data partition (with --disk)")]
    no_data_partition: bool,

    #[arg(help = "System image file")]
    system_image: Option<PathBuf>,

    #[arg(
        long,
        default_value = DEFAULT_BOOT_PARTITION,
        hide = true,
        help = "Boot partition (for testing)"
    )]
    boot_partition: PathBuf,

    #[arg(
        long,
        default_value = "losetup",
        hide = true,
        help = "losetup command (for testing)"
    )]
    losetup: OsString,
}

fn usage() -> ExitCode {
    // failing to print help isn't going to be fixed by reporting it
    let _ = Args::command().print_help();
    ExitCode::FAILURE
}

fn install_self(image: &Path, boot_partition: &Path, losetup: OsString) -> Result<()> {
    let installer = Installer::new(boot_partition, LoopbackDetector::new(losetup));
    installer
        .install_with(image, |info| {
            if let Some(profile) = &info.profile {
                println!("profile: {profile}");
            }
            if let Some(artifact) = &info.artifact {
                println!("artifact: {artifact}");
            }
        })
        .with_context(|| format!("Installing {}", image.display()))?;

    println!("Done.  Reboot system to take effect.");
    Ok(())
}

fn install_to_disk(
    disk: &Path,
    image: Option<PathBuf>,
    data_partition: bool,
    boot_partition: &Path,
) -> Result<()> {
    let image = image.unwrap_or_else(|| {
        let image = boot_partition.join(&*INSTALLED.to_string_lossy());
        warn!("No system image given, using {}", image.display());
        image
    });
    info!(
        "disk: {}, image: {}, data partition: {data_partition}",
        disk.display(),
        image.display()
    );
    bail!("Installing to disk {} is not implemented", disk.display());
}

fn main() -> ExitCode {
    env_logger::init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) if err.use_stderr() => {
            let _ = err.print();
            return ExitCode::FAILURE;
        }
        Err(err) => err.exit(), // --version
    };

    if args.help {
        return usage();
    }

    let result = match (&args.disk, &args.system_image) {
        (Some(disk), image) => install_to_disk(
            disk,
            image.clone(),
            !args.no_data_partition,
            &args.boot_partition,
        ),
        (None, Some(image)) => install_self(image, &args.boot_partition, args.losetup),
        (None, None) => return usage(),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
