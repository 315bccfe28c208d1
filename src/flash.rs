//! Full device flashing sequence

use std::fmt;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::blocking::spi::Transfer;

use crate::{Error, Programmer, Progress};

/// Load address of the bootstub image
pub const BOOTSTUB_ADDRESS: u32 = 0x0800_0000;

/// Load address of the application image
pub const APP_ADDRESS: u32 = 0x0802_0000;

/// Firmware images to be written
#[derive(Clone, Copy, Debug)]
pub struct Images<'a> {
    pub bootstub: &'a [u8],
    pub app: &'a [u8],
}

/// Identification read from the bootloader prior to flashing
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct DeviceInfo {
    pub bootloader_version: u8,
    pub chip_id: u16,
}

impl<T, D, E> Programmer<T, D, E>
where
    T: Transfer<u8, Error = E>,
    D: DelayMs<u32>,
    E: fmt::Debug,
{
    /// Connect, identify, mass erase, then write the bootstub and the
    /// application at their fixed addresses.
    ///
    /// Any failure aborts the sequence. A failure after the erase leaves the
    /// device without valid firmware.
    pub fn flash(
        &mut self,
        images: Images,
        progress: &mut dyn Progress,
    ) -> Result<DeviceInfo, Error<E>> {
        info!("Connecting to bootloader");
        self.connect()?;
        self.settle();

        let bootloader_version = self.bootloader_version()?;
        info!("Bootloader version: 0x{:02x}", bootloader_version);

        let chip_id = self.chip_id()?;
        info!("Chip ID: 0x{:04x}", chip_id);

        self.global_erase()?;

        info!("Programming bootstub at 0x{:08x}", BOOTSTUB_ADDRESS);
        self.program_image_with(images.bootstub, BOOTSTUB_ADDRESS, progress)?;

        info!("Programming application at 0x{:08x}", APP_ADDRESS);
        self.program_image_with(images.app, APP_ADDRESS, progress)?;

        info!("Flashing complete");

        Ok(DeviceInfo {
            bootloader_version,
            chip_id,
        })
    }
}
