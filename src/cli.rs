//! This module implements the CLI interface.
//!
//! The binary opens the expander's serial device, configures one I2C
//! bus and then copies a memory chip on that bus to or from an image
//! file.
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand, ValueEnum};
use interface_expander::{
    i2c::request::{AddressWidth, BusConfig, ClockFreq, I2cId},
    memory::{MemoryGeometry, MemoryType},
};

#[derive(Parser, Debug)]
#[command(
    name = env!("CARGO_PKG_NAME"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
    about = env!("CARGO_PKG_DESCRIPTION"),
    long_about = None
)]
pub struct Cli {
    /// Enable verbose logging. Can be specified multiple times to
    /// increase verbosity.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// The serial device of the expander, e.g. /dev/ttyACM0.
    #[arg(long, value_name = "PATH")]
    pub device: PathBuf,

    /// The I2C bus the memory is connected to.
    #[arg(long, value_enum, default_value_t = Bus::I2c0)]
    pub bus: Bus,

    /// SCL clock rate.
    #[arg(long, value_enum, default_value_t = Clock::Freq400k)]
    pub clock: Clock,

    /// Our own 7-bit slave address on the bus.
    #[arg(long, value_name = "ADDR", default_value = "0x01", value_parser = parse_u16)]
    pub own_address: u16,

    /// Enable the expander's internal pull-up resistors.
    #[arg(long)]
    pub pullups: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Copy memory contents into an image file.
    Dump(Transfer),

    /// Copy an image file into memory.
    Load(Transfer),
}

#[derive(Args, Debug)]
pub struct Transfer {
    #[command(flatten)]
    pub memory: MemoryArgs,

    /// Memory address the image starts at. Intel HEX images carry their
    /// own addresses and ignore this option on load.
    #[arg(long, value_name = "ADDR", default_value = "0", value_parser = parse_usize)]
    pub address: usize,

    /// Image format. Derived from the file extension if omitted.
    #[arg(long, value_enum)]
    pub format: Option<ImageFormat>,

    /// The image file.
    #[arg(value_name = "FILE")]
    pub path: PathBuf,
}

impl Transfer {
    /// The image format, falling back to the file extension.
    pub fn format(&self) -> ImageFormat {
        self.format.unwrap_or_else(|| ImageFormat::from_path(&self.path))
    }
}

#[derive(Args, Debug)]
pub struct MemoryArgs {
    /// Slave address of the memory chip.
    #[arg(long, value_name = "ADDR", default_value = "0x50", value_parser = parse_u16)]
    pub slave: u16,

    /// Kind of memory chip.
    #[arg(long = "type", value_enum, default_value_t = Chip::Fram)]
    pub chip: Chip,

    /// Number of pages of the chip.
    #[arg(long, default_value_t = 1)]
    pub page_count: usize,

    /// Bytes per page.
    #[arg(long, default_value_t = 32 * 1024)]
    pub page_size: usize,

    /// Bytes of the memory address field (1 to 4).
    #[arg(long, default_value_t = 2)]
    pub address_width: usize,
}

impl MemoryArgs {
    pub fn geometry(&self) -> MemoryGeometry {
        MemoryGeometry {
            memory_type: self.chip.into(),
            page_count: self.page_count,
            page_size: self.page_size,
            address_width: self.address_width,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chip {
    Fram,
    Eeprom,
    Flash,
}

impl From<Chip> for MemoryType {
    fn from(chip: Chip) -> Self {
        match chip {
            Chip::Fram => Self::Fram,
            Chip::Eeprom => Self::Eeprom,
            Chip::Flash => Self::Flash,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bus {
    I2c0,
    I2c1,
}

impl From<Bus> for I2cId {
    fn from(bus: Bus) -> Self {
        match bus {
            Bus::I2c0 => Self::I2c0,
            Bus::I2c1 => Self::I2c1,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Clock {
    #[value(name = "10k")]
    Freq10k,
    #[value(name = "40k")]
    Freq40k,
    #[value(name = "100k")]
    Freq100k,
    #[value(name = "400k")]
    Freq400k,
    #[value(name = "1m")]
    Freq1m,
}

impl From<Clock> for ClockFreq {
    fn from(clock: Clock) -> Self {
        match clock {
            Clock::Freq10k => Self::Freq10K,
            Clock::Freq40k => Self::Freq40K,
            Clock::Freq100k => Self::Freq100K,
            Clock::Freq400k => Self::Freq400K,
            Clock::Freq1m => Self::Freq1M,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    /// Raw bytes.
    Bin,
    /// Intel HEX.
    Hex,
}

impl ImageFormat {
    fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("hex") || ext.eq_ignore_ascii_case("ihex") => {
                Self::Hex
            }
            _ => Self::Bin,
        }
    }
}

impl Cli {
    /// The bus configuration requested on the command line.
    pub fn bus_config(&self) -> BusConfig {
        BusConfig {
            clock_freq: self.clock.into(),
            slave_address: self.own_address,
            slave_address_width: AddressWidth::Bits7,
            memory_address_width: AddressWidth::Bits16,
            pullups_enabled: self.pullups,
        }
    }
}

fn parse_u64(value: &str) -> Result<u64, String> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse(),
    };

    parsed.map_err(|e| format!("invalid number '{value}': {e}"))
}

fn parse_u16(value: &str) -> Result<u16, String> {
    u16::try_from(parse_u64(value)?).map_err(|e| format!("'{value}' is out of range: {e}"))
}

fn parse_usize(value: &str) -> Result<usize, String> {
    usize::try_from(parse_u64(value)?).map_err(|e| format!("'{value}' is out of range: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_accept_hex_and_decimal() {
        assert_eq!(parse_u16("0x50"), Ok(0x50));
        assert_eq!(parse_u16("80"), Ok(80));
        assert!(parse_u16("0x10000").is_err());
        assert!(parse_usize("zz").is_err());
    }

    #[test]
    fn dump_with_defaults() {
        let cli = Cli::try_parse_from([
            "interface-expander",
            "--device",
            "/dev/ttyACM0",
            "dump",
            "image.hex",
        ])
        .unwrap();

        assert_eq!(cli.bus, Bus::I2c0);
        assert_eq!(cli.bus_config().slave_address, 0x01);

        let Command::Dump(transfer) = cli.command else {
            panic!("expected dump");
        };
        assert_eq!(transfer.memory.slave, 0x50);
        assert_eq!(transfer.memory.geometry(), MemoryGeometry::default());
        assert_eq!(transfer.format(), ImageFormat::Hex);
    }

    #[test]
    fn load_with_options() {
        let cli = Cli::try_parse_from([
            "interface-expander",
            "-vv",
            "--device",
            "/dev/ttyACM1",
            "--bus",
            "i2c1",
            "--clock",
            "1m",
            "load",
            "--slave",
            "0x51",
            "--type",
            "eeprom",
            "--page-size",
            "131072",
            "--address",
            "0x100",
            "--format",
            "bin",
            "image.hex",
        ])
        .unwrap();

        assert_eq!(cli.verbose, 2);
        assert_eq!(I2cId::from(cli.bus), I2cId::I2c1);
        assert_eq!(cli.bus_config().clock_freq, ClockFreq::Freq1M);

        let Command::Load(transfer) = cli.command else {
            panic!("expected load");
        };
        assert_eq!(transfer.memory.slave, 0x51);
        assert_eq!(transfer.memory.geometry().memory_type, MemoryType::Eeprom);
        assert_eq!(transfer.memory.geometry().additional_address_bits(), 1);
        assert_eq!(transfer.address, 0x100);
        assert_eq!(transfer.format(), ImageFormat::Bin);
    }
}
