
#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};

use avr_isp_programmer::{Chip, FuseSet, Options, PageStatus, Programmer, CHIPS};

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// SPI device connected to the target
    #[structopt(long, default_value = "/dev/spidev0.0")]
    spi: PathBuf,

    /// GPIO driving the target reset line
    #[structopt(long, default_value = "25")]
    reset_gpio: u64,

    /// Target part
    #[structopt(long, default_value = "ATtiny85")]
    chip: String,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,

    #[structopt(subcommand)]
    operation: Operation,
}

#[derive(Clone, Debug, StructOpt)]
pub enum Operation {
    /// Read and identify the target signature
    Signature,
    /// Erase flash and lock bits
    Erase,
    /// Erase and program flash from an Intel HEX file
    Program {
        file: PathBuf,

        /// Skip read-back of written pages
        #[structopt(long)]
        no_verify: bool,
    },
    /// Compare flash against an Intel HEX file
    Verify { file: PathBuf },
    /// Read fuses
    ReadFuses,
    /// Write the given fuses
    WriteFuses(FuseArgs),
    /// Check the given fuses
    VerifyFuses(FuseArgs),
}

#[derive(Clone, Debug, StructOpt)]
pub struct FuseArgs {
    /// Low fuse
    #[structopt(long, parse(try_from_str = parse_byte))]
    low: Option<u8>,
    /// High fuse
    #[structopt(long, parse(try_from_str = parse_byte))]
    high: Option<u8>,
    /// Extended fuse
    #[structopt(long, parse(try_from_str = parse_byte))]
    ext: Option<u8>,
    /// Lock bits
    #[structopt(long, parse(try_from_str = parse_byte))]
    lock: Option<u8>,
}

impl From<&FuseArgs> for FuseSet {
    fn from(a: &FuseArgs) -> Self {
        FuseSet {
            low: a.low,
            high: a.high,
            ext: a.ext,
            lock: a.lock,
        }
    }
}

fn parse_byte(s: &str) -> Result<u8, std::num::ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(h) => u8::from_str_radix(h, 16),
        None => s.parse::<u8>(),
    }
}

fn page_bar(chip: &Chip, msg: &str) -> ProgressBar {
    let bar = ProgressBar::new(chip.pages() as u64);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{msg} [{bar:40}] {pos}/{len} pages")
            .progress_chars("=> "),
    );
    bar.set_message(msg);
    bar
}

fn open_image(file: &Path) -> Option<BufReader<File>> {
    match File::open(file) {
        Ok(f) => Some(BufReader::new(f)),
        Err(e) => {
            error!("Error opening {}: {:?}", file.display(), e);
            None
        }
    }
}

fn main() {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    let chip = match Chip::by_name(&o.chip) {
        Some(c) => c,
        None => {
            let names: Vec<_> = CHIPS.iter().map(|c| c.name).collect();
            error!("Unknown chip '{}', supported: {}", o.chip, names.join(", "));
            return;
        }
    };

    info!(
        "Target {} ({} flash, {} byte pages)",
        chip.name,
        bytefmt::format(chip.flash_size as u64),
        chip.page_size
    );

    let mut p = match Programmer::linux(&o.spi, o.reset_gpio, o.options.clone()) {
        Ok(p) => p,
        Err(e) => {
            error!("Error connecting to programmer: {:?}", e);
            return;
        }
    };

    match &o.operation {
        Operation::Signature => match p.read_signature() {
            Ok(sig) => {
                let part = Chip::by_signature(&sig).map(|c| c.name).unwrap_or("unknown part");
                info!("Signature: {} ({})", hex::encode(sig), part);
                if sig != chip.signature {
                    warn!("Expected {} for {}", hex::encode(chip.signature), chip.name);
                }
            }
            Err(e) => error!("Error reading signature: {}", e),
        },
        Operation::Erase => match p.erase_chip() {
            Ok(_) => info!("Chip erased"),
            Err(e) => error!("Error erasing chip: {}", e),
        },
        Operation::Program { file, no_verify } => {
            let image = match open_image(file) {
                Some(i) => i,
                None => return,
            };

            let bar = page_bar(chip, "Programming");
            let res = p.program_file_with(chip, image, !no_verify, |_addr, _status| bar.inc(1));
            bar.finish();

            match res {
                Ok(true) => info!("Programmed {}", file.display()),
                Ok(false) => error!("Verification failed"),
                Err(e) => error!("Error programming chip: {}", e),
            }
        }
        Operation::Verify { file } => {
            let image = match open_image(file) {
                Some(i) => i,
                None => return,
            };

            let bar = page_bar(chip, "Verifying");
            let res = p.verify_file_with(chip, image, |_addr, status| {
                if status == PageStatus::Verified {
                    bar.inc(1)
                }
            });
            bar.finish();

            match res {
                Ok(true) => info!("Flash matches {}", file.display()),
                Ok(false) => error!("Verification failed"),
                Err(e) => error!("Error verifying chip: {}", e),
            }
        }
        Operation::ReadFuses => match p.read_fuses(chip) {
            Ok(f) => info!(
                "Fuses: low 0x{:02x} high 0x{:02x} ext 0x{:02x} lock 0x{:02x}",
                f.low, f.high, f.ext, f.lock
            ),
            Err(e) => error!("Error reading fuses: {}", e),
        },
        Operation::WriteFuses(args) => {
            let fuses = FuseSet::from(args);
            if fuses.is_empty() {
                warn!("No fuses specified");
                return;
            }
            match p.write_fuses(chip, fuses) {
                Ok(_) => info!("Fuses written"),
                Err(e) => error!("Error writing fuses: {}", e),
            }
        }
        Operation::VerifyFuses(args) => match p.verify_fuses(chip, FuseSet::from(args)) {
            Ok(true) => info!("Fuses match"),
            Ok(false) => error!("Fuse verification failed"),
            Err(e) => error!("Error reading fuses: {}", e),
        },
    }
}
