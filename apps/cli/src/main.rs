use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Args as ClapArgs, Parser, Subcommand};
use stagedfu_core::transport::DfuDeviceSummary;
use stagedfu_core::{
    DirectoryExtractor, FileImage, FlashConfig, FlashEvent, FlashObserver, NusbBus,
    TracingObserver,
};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Staged USB DFU flasher (Pure Rust)", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the USB vendor ID (hex)
    #[arg(long, global = true, value_parser = parse_hex_u16)]
    vid: Option<u16>,

    /// Override the USB product ID (hex)
    #[arg(long, global = true, value_parser = parse_hex_u16)]
    pid: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send the boot chain, then stream the raw image to the storage target
    Flash(FlashArgs),
    /// List DFU-capable devices and their alternate settings
    List,
    /// Print the effective configuration as TOML
    Config,
}

#[derive(ClapArgs, Debug)]
struct FlashArgs {
    /// Raw disk image to write (e.g. sdcard.img)
    #[arg(long)]
    image: PathBuf,

    /// Directory holding the boot binaries (tiboot3.bin, tispl.bin, u-boot.img)
    #[arg(long)]
    boot_dir: PathBuf,

    /// Alternate setting that receives the raw image
    #[arg(long)]
    target: Option<String>,

    /// Number of discovery attempts per stage
    #[arg(long)]
    attempts: Option<u32>,
}

fn parse_hex_u16(s: &str) -> Result<u16, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(digits, 16).map_err(|e| format!("invalid hex ID '{s}': {e}"))
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => FlashConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => FlashConfig::default(),
    };
    if let Some(vid) = args.vid {
        config.vendor_id = vid;
    }
    if let Some(pid) = args.pid {
        config.product_id = pid;
    }

    match args.command {
        Command::Flash(flash) => run_flash(config, flash),
        Command::List => run_list(&config),
        Command::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

fn run_flash(mut config: FlashConfig, args: FlashArgs) -> Result<()> {
    if let Some(target) = args.target {
        config.final_alt_setting = target;
    }
    if let Some(attempts) = args.attempts {
        config.discovery_attempts = attempts;
    }
    if !args.boot_dir.is_dir() {
        bail!("Boot directory not found: {}", args.boot_dir.display());
    }

    info!(
        vid = %format!("{:04X}", config.vendor_id),
        pid = %format!("{:04X}", config.product_id),
        image = %args.image.display(),
        "Starting staged DFU flash (nusb backend)..."
    );

    let handle = stagedfu_core::start(
        config,
        NusbBus::new(),
        DirectoryExtractor::new(args.boot_dir),
        FileImage::new(args.image),
    )?;

    let renderer = TracingObserver;
    for event in handle.events().iter() {
        // The terminal failure is reported from the joined result.
        if !matches!(event, FlashEvent::Failed { .. }) {
            renderer.on_event(&event);
        }
    }

    let report = handle.join()?;
    info!(
        stages = report.stages.len(),
        image_mb = report.image.bytes_sent / (1024 * 1024),
        "Done"
    );
    Ok(())
}

fn run_list(config: &FlashConfig) -> Result<()> {
    let devices = NusbBus::list_dfu_devices(Some(config.vendor_id), Some(config.product_id))?;
    if devices.is_empty() {
        info!(
            vid = %format!("{:04X}", config.vendor_id),
            pid = %format!("{:04X}", config.product_id),
            "No DFU devices found"
        );
        return Ok(());
    }
    for device in &devices {
        print_device(device);
    }
    Ok(())
}

fn print_device(device: &DfuDeviceSummary) {
    println!(
        "{:04x}:{:04x} bus {} addr {}",
        device.vendor_id, device.product_id, device.bus_id, device.address
    );
    for alt in &device.alt_settings {
        println!(
            "  intf={} alt={} name=\"{}\" transfer_size={}",
            alt.interface, alt.alt_setting, alt.name, alt.transfer_size
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_ids() {
        assert_eq!(parse_hex_u16("0451"), Ok(0x0451));
        assert_eq!(parse_hex_u16("0x6165"), Ok(0x6165));
        assert!(parse_hex_u16("zz").is_err());
    }

    #[test]
    fn test_flash_args() {
        let args = Args::try_parse_from([
            "stagedfu",
            "--pid",
            "6166",
            "flash",
            "--image",
            "disk.img",
            "--boot-dir",
            "/mnt/boot",
        ])
        .unwrap();
        assert_eq!(args.pid, Some(0x6166));
        match args.command {
            Command::Flash(flash) => {
                assert_eq!(flash.image, PathBuf::from("disk.img"));
                assert_eq!(flash.target, None);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
