use std::path::{Path, PathBuf};
use std::{thread::sleep, time::Duration};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};

use olsflash::constants::{OLS_BAUD, OLS_PID, OLS_VID};
use olsflash::transport::{SerialTransport, UsbTransport};
use olsflash::{Bootloader, FileFormat, FlashTarget, Flashing, SerialFlash};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Target {
    /// PIC firmware, through the USB bootloader
    Boot,
    /// FPGA bitstream in the SPI flash, through the serial port
    App,
}

#[derive(clap::Parser)]
#[command(
    name = "olsflash",
    version,
    about = "Firmware and bitstream loader for the Open Bench Logic Sniffer"
)]
struct Cli {
    /// Memory to operate on
    #[arg(short, long, value_enum, global = true, default_value_t = Target::App)]
    target: Target,

    /// Serial port of the OLS, e.g. /dev/ttyACM0 or COM3
    #[arg(short, long, global = true)]
    port: Option<String>,

    #[arg(short, long, global = true, default_value_t = OLS_BAUD)]
    baud: u32,

    /// USB vendor id of the bootloader, hex with 0x prefix or decimal
    #[arg(long, global = true, value_parser = parse_u16, default_value_t = OLS_VID)]
    vid: u16,

    /// USB product id of the bootloader, hex with 0x prefix or decimal
    #[arg(long, global = true, value_parser = parse_u16, default_value_t = OLS_PID)]
    pid: u16,

    /// Image file format, guessed from the file extension if omitted
    #[arg(short, long, value_enum, global = true)]
    format: Option<FileFormat>,

    /// Only touch the first N pages of the SPI flash
    #[arg(short, long, global = true)]
    limit: Option<usize>,

    /// Switch a running OLS into its bootloader first (needs --port)
    #[arg(long, global = true)]
    enter_bootloader: bool,

    /// Verbose output
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Identify the connected device
    Info,
    /// Dump memory to a file
    Read { path: PathBuf },
    /// Erase, then program a file
    Write {
        path: PathBuf,
        /// Read back and compare after programming
        #[arg(long)]
        verify: bool,
        /// Leave the bootloader or return to RUN mode afterwards
        #[arg(long)]
        reset: bool,
    },
    /// Compare memory with a file
    Verify { path: PathBuf },
    /// Erase the application region or the whole flash chip
    Erase,
    /// Leave the bootloader or return to RUN mode
    Reset,
    /// Run the OLS board self-test
    Selftest,
    /// Query the OLS status byte
    Status,
    /// List serial ports and connected bootloaders
    Ports,
}

fn parse_u16(s: &str) -> Result<u16, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid id {:?}: {}", s, e))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let _ = simplelog::TermLogger::init(
        if cli.debug {
            simplelog::LevelFilter::Debug
        } else {
            simplelog::LevelFilter::Info
        },
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    if let Command::Ports = cli.command {
        return list_ports(cli.vid, cli.pid);
    }

    match cli.target {
        Target::App => run_app(&cli),
        Target::Boot => run_boot(&cli),
    }
}

fn serial_port(cli: &Cli) -> Result<&str> {
    cli.port
        .as_deref()
        .context("no serial port given, use --port (see `olsflash ports`)")
}

fn list_ports(vid: u16, pid: u16) -> Result<()> {
    let ports = SerialTransport::scan_ports()?;
    if ports.is_empty() {
        log::info!("No serial ports found");
    }
    for port in ports {
        log::info!("Serial port: {}", port);
    }
    let n = UsbTransport::scan_devices(vid, pid)?;
    log::info!("Found {} bootloader(s) at {:04x}:{:04x}", n, vid, pid);
    Ok(())
}

fn run_app(cli: &Cli) -> Result<()> {
    let mut ols = SerialFlash::open(serial_port(cli)?, cli.baud)?;
    ols.set_verbose(cli.debug);

    match cli.command {
        Command::Info => {
            let chip = ols.chip()?;
            log::info!(
                "Flash size: {} bytes ({} pages of {} bytes)",
                chip.size(),
                chip.page_count,
                chip.page_size
            );
            return Ok(());
        }
        Command::Selftest => {
            ols.run_selftest()?;
            return Ok(());
        }
        Command::Status => {
            ols.status()?;
            return Ok(());
        }
        _ => {}
    }

    let mut flashing = Flashing::new(ols)?;
    flashing.set_verbose(cli.debug);
    run(&mut flashing, cli)
}

fn run_boot(cli: &Cli) -> Result<()> {
    if cli.enter_bootloader {
        let port = serial_port(cli)?;
        let mut ols = SerialFlash::new(SerialTransport::open(port, cli.baud)?);
        ols.enter_bootloader()?;
        drop(ols);
        // wait for the bootloader to enumerate
        sleep(Duration::from_secs(2));
    }

    let mut boot = Bootloader::open(cli.vid, cli.pid)?;
    // the first request after enumeration is sometimes lost
    if let Err(e) = boot.version() {
        log::debug!("First version request failed: {}", e);
    }
    boot.version()?;

    match cli.command {
        Command::Info => return Ok(()),
        Command::Selftest | Command::Status => {
            bail!("the OLS answers this in RUN mode only, use --target app")
        }
        _ => {}
    }

    let mut flashing = Flashing::new(boot)?;
    flashing.set_verbose(cli.debug);
    run(&mut flashing, cli)
}

fn file_format(cli: &Cli, path: &Path) -> FileFormat {
    cli.format.unwrap_or_else(|| FileFormat::guess(path))
}

fn run<T: FlashTarget>(flashing: &mut Flashing<T>, cli: &Cli) -> Result<()> {
    match &cli.command {
        Command::Read { path } => {
            let image = flashing.read(cli.limit)?;
            let range = flashing.target().dump_range(cli.limit)?;
            file_format(cli, path).write_file(path, &image.as_slice()[range])?;
            log::info!("Saved to {}", path.display());
        }
        Command::Write {
            path,
            verify,
            reset,
        } => {
            // decode before anything is erased
            let image = flashing.load_image(file_format(cli, path), path)?;
            flashing.write(&image, cli.limit)?;
            if *verify {
                // compare against a fresh decode of the file
                let expected = flashing.load_image(file_format(cli, path), path)?;
                flashing.verify(&expected, cli.limit)?;
            }
            if *reset {
                flashing.reset()?;
            }
            log::info!("Done");
        }
        Command::Verify { path } => {
            let image = flashing.load_image(file_format(cli, path), path)?;
            flashing.verify(&image, cli.limit)?;
        }
        Command::Erase => flashing.erase()?,
        Command::Reset => flashing.reset()?,
        Command::Info | Command::Selftest | Command::Status | Command::Ports => {}
    }
    Ok(())
}
