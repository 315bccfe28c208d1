use std::io::Error as IoError;
use std::path::Path;

use linux_embedded_hal::spidev::{SpiModeFlags, SpidevOptions};
use linux_embedded_hal::{Delay, Spidev};

use crate::{Options, Programmer};

impl Programmer<Spidev, Delay, IoError> {
    /// Create a new linux spidev programmer instance
    pub fn linux<P: AsRef<Path>>(
        device: P,
        speed_hz: u32,
        options: Options,
    ) -> Result<Self, IoError> {
        // Open device
        let mut spi = Spidev::open(device.as_ref())?;

        // Apply settings
        let settings = SpidevOptions::new()
            .bits_per_word(8)
            .max_speed_hz(speed_hz)
            .mode(SpiModeFlags::SPI_MODE_0)
            .build();

        spi.0.configure(&settings)?;

        // Return instance
        Ok(Self::new(spi, Delay {}, options))
    }
}
