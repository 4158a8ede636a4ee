mod cli;
mod tty;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Command, ImageFormat};
use interface_expander::{i2c::I2cInterface, link::Link, memory::Memory};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

fn main() -> Result<()> {
    let args = Cli::parse();

    tracing_log::LogTracer::init().context("Failed to forward log records to tracing")?;

    let subscriber = FmtSubscriber::builder()
        .with_max_level(match args.verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        })
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set global tracing subscriber")?;

    let port = tty::open(&args.device)
        .with_context(|| format!("Failed to open {}", args.device.display()))?;
    let link = Link::new(port);

    let bus = I2cInterface::open(&link, args.bus.into(), args.bus_config())
        .with_context(|| format!("Failed to configure {:?}", args.bus))?;
    info!("{:?} configured", args.bus);

    match &args.command {
        Command::Dump(transfer) => {
            let mut memory = Memory::new(bus, transfer.memory.slave, transfer.memory.geometry())
                .context("Failed to set up memory")?;

            match transfer.format() {
                ImageFormat::Bin => memory.download_bin(transfer.address, &transfer.path),
                ImageFormat::Hex => memory.download_hex(transfer.address, &transfer.path),
            }
            .with_context(|| format!("Failed to dump memory to {}", transfer.path.display()))?;

            info!(
                "Dumped {} bytes from {:#x} to {}",
                memory.size() - transfer.address,
                transfer.address,
                transfer.path.display()
            );
        }
        Command::Load(transfer) => {
            let mut memory = Memory::new(bus, transfer.memory.slave, transfer.memory.geometry())
                .context("Failed to set up memory")?;

            match transfer.format() {
                ImageFormat::Bin => memory.upload_bin(transfer.address, &transfer.path),
                ImageFormat::Hex => memory.upload_hex(&transfer.path),
            }
            .with_context(|| format!("Failed to load {} into memory", transfer.path.display()))?;

            info!("Loaded {}", transfer.path.display());
        }
    }

    Ok(())
}
