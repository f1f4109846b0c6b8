use std::{convert::Infallible, path::PathBuf, process::ExitCode};

use anyhow::Result;
use clap::Parser;
use log::{error, warn};
use rustix::{
    process::getpid,
    system::{reboot, RebootCommand},
};

use genpack_boot::switch_root::{Kernel, RootSwitch, SwitchConfig, SwitchError};

// Command-line arguments
#[derive(Parser, Debug)]
#[command(version)]
struct Args {
    #[arg(
        long,
        default_value = "/dev/vdb",
        help = "Block device holding the system image"
    )]
    system_device: PathBuf,

    #[arg(long, default_value = "/root", help = "Mountpoint for the new root")]
    new_root: PathBuf,

    #[arg(
        long,
        default_value = "/sbin/overlay-init",
        help = "Program to execute in the new root"
    )]
    init: PathBuf,
}

fn switch_root(args: Args) -> Result<Infallible> {
    let config = SwitchConfig {
        system_device: args.system_device,
        new_root: args.new_root,
        init: args.init,
        ..Default::default()
    };
    Ok(RootSwitch::new(config, Kernel).run(getpid())?)
}

fn halt() -> ExitCode {
    if let Err(errno) = reboot(RebootCommand::Halt) {
        error!("Halting failed: {errno}");
    }
    ExitCode::FAILURE
}

fn main() -> ExitCode {
    // nobody sets RUST_LOG for PID 1
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // The kernel hands any command line words it doesn't understand to init.  Those must never
    // keep the machine from booting.
    let args = Args::try_parse().unwrap_or_else(|err| {
        warn!("Ignoring arguments ({:?})", err.kind());
        Args::parse_from([env!("CARGO_BIN_NAME")])
    });

    let err = match switch_root(args) {
        Ok(never) => match never {},
        Err(err) => err,
    };

    if let Some(SwitchError::NotInit { .. }) = err.downcast_ref::<SwitchError>() {
        error!("{err}");
        return ExitCode::FAILURE;
    }

    error!("{err:#}");
    halt()
}
