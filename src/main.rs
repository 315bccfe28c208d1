#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use std::path::{Path, PathBuf};

use anyhow::Context;
use indicatif::{ProgressBar, ProgressStyle};

use stm32_spi_loader::{Images, Options, Programmer, Progress};

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// Bootstub image, written to 0x08000000
    bootstub: PathBuf,

    /// Application image, written to 0x08020000
    app: PathBuf,

    /// SPI device to connect to
    #[structopt(long, default_value = "/dev/spidev0.0")]
    device: String,

    /// SPI clock speed in Hz
    #[structopt(long, default_value = "1000000")]
    speed: u32,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,
}

/// Progress bar over the pages of each image
#[derive(Default)]
struct Bar(Option<ProgressBar>);

impl Progress for Bar {
    fn init(&mut self, _addr: u32, total: usize) {
        let pb = ProgressBar::new(total as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("  {wide_bar} {bytes}/{total_bytes} {bytes_per_sec} {eta}  ")
                .progress_chars("#>-"),
        );
        self.0 = Some(pb);
    }

    fn update(&mut self, written: usize) {
        if let Some(pb) = &self.0 {
            pb.set_position(written as u64);
        }
    }

    fn finish(&mut self) {
        if let Some(pb) = self.0.take() {
            pb.finish_and_clear();
        }
    }
}

fn load(path: &Path) -> anyhow::Result<Vec<u8>> {
    let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;

    info!(
        "Loaded {} ({})",
        path.display(),
        bytefmt::format(data.len() as u64)
    );

    Ok(data)
}

fn main() -> anyhow::Result<()> {
    // Parse out arguments
    let Args {
        bootstub,
        app,
        device,
        speed,
        options,
        log_level,
    } = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(log_level, Config::default());

    let bootstub = load(&bootstub)?;
    let app = load(&app)?;

    info!("Connecting to SPI device {}", device);

    let mut p = Programmer::linux(&device, speed, options)
        .with_context(|| format!("opening SPI device {}", device))?;

    let images = Images {
        bootstub: &bootstub,
        app: &app,
    };

    let info = match p.flash(images, &mut Bar::default()) {
        Ok(i) => i,
        Err(e) => {
            error!("Flashing failed: {}", e);
            return Err(e).context("flashing failed");
        }
    };

    info!(
        "Flashed chip 0x{:04x} (bootloader 0x{:02x})",
        info.chip_id, info.bootloader_version
    );

    // Close device
    drop(p.release());

    Ok(())
}
