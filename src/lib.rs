//! STM32 SPI Bootloader.
//!
//! Based on AN4286 (SPI protocol used in the STM32 bootloader)

use std::convert::TryFrom;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[macro_use]
extern crate log;

extern crate embedded_hal;
use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::blocking::spi::Transfer;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

#[cfg(feature = "linux")]
pub mod linux;

pub mod protocol;
use protocol::*;

pub mod flash;
pub use flash::{DeviceInfo, Images, APP_ADDRESS, BOOTSTUB_ADDRESS};

/// Handshake state of the current session
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum State {
    Idle,
    SyncSent,
    Acked,
    Nacked,
}

/// Resolved acknowledgement
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum AckState {
    Ack,
    Nack,
}

/// Point in an exchange where the device answered with a NACK
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Stage {
    Sync,
    Command(u8),
    Block(usize),
    Response,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Sync => write!(f, "sync"),
            Stage::Command(op) => write!(f, "command 0x{:02x}", op),
            Stage::Block(n) => write!(f, "payload block {}", n),
            Stage::Response => write!(f, "response"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error<E> {
    #[error("transport error: {0:?}")]
    Transport(E),
    #[error("timeout waiting for bootloader acknowledgement")]
    LinkTimeout,
    #[error("bootloader returned NACK to {0}")]
    ProtocolNack(Stage),
    #[error("bootloader rejected connection")]
    HandshakeFailed,
    #[error("unexpected bootloader response")]
    UnexpectedResponse,
    #[error("operation cancelled")]
    Cancelled,
    #[error("image does not fit in the address space")]
    AddressOverflow,
    #[error("page of {0} bytes, expected 1 to 256")]
    InvalidPage(usize),
}

impl<E> From<E> for Error<E> {
    fn from(e: E) -> Self {
        Self::Transport(e)
    }
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Timeout to wait for bootloader acknowledgements
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "5000"))]
    pub response_timeout_ms: u32,

    /// Timeout to wait for a mass erase to complete
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "60000"))]
    pub erase_timeout_ms: u32,

    /// Period to poll for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(skip = 1u32))]
    pub poll_delay_ms: u32,

    /// Period to wait for the bootloader after connecting
    #[cfg_attr(feature = "structopt", structopt(skip = 500u32))]
    pub settle_delay_ms: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            response_timeout_ms: 5000,
            erase_timeout_ms: 60000,
            poll_delay_ms: 1,
            settle_delay_ms: 500,
        }
    }
}

/// Shared flag used to abort a running session from another thread
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Progress callbacks for image programming
pub trait Progress {
    /// Start writing `total` bytes at `addr`
    fn init(&mut self, _addr: u32, _total: usize) {}
    /// Bytes written so far in the current image
    fn update(&mut self, _written: usize) {}
    fn finish(&mut self) {}
}

impl Progress for () {}

pub struct Programmer<T, D, E> {
    state: State,
    options: Options,
    cancel: CancelToken,
    spi: T,
    delay: D,
    _err: core::marker::PhantomData<E>,
}

impl<T, D, E> Programmer<T, D, E>
where
    T: Transfer<u8, Error = E>,
    D: DelayMs<u32>,
    E: fmt::Debug,
{
    /// Create a new programmer instance
    pub fn new(spi: T, delay: D, options: Options) -> Self {
        Self {
            state: State::Idle,
            options,
            cancel: CancelToken::new(),
            spi,
            delay,
            _err: core::marker::PhantomData,
        }
    }

    /// Fetch the handshake state
    pub fn state(&self) -> State {
        self.state
    }

    /// Use an existing cancellation token for this session
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// Fetch a token that aborts pending acknowledgement waits when cancelled
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Release the underlying transport
    pub fn release(self) -> T {
        self.spi
    }

    /// Wait for the bootloader to settle after connecting
    pub fn settle(&mut self) {
        self.delay.delay_ms(self.options.settle_delay_ms);
    }

    fn write(&mut self, data: &[u8]) -> Result<(), Error<E>> {
        let mut buff = data.to_vec();
        let resp = self.spi.transfer(&mut buff)?;

        trace!("out: {} in: {}", hex::encode(data), hex::encode(resp));

        Ok(())
    }

    fn read(&mut self, len: usize) -> Result<Vec<u8>, Error<E>> {
        let mut buff = vec![SPI_DUMMY; len];
        self.spi.transfer(&mut buff)?;

        trace!("read: {}", hex::encode(&buff));

        Ok(buff)
    }

    fn poll_ack(&mut self, timeout_ms: u32) -> Result<AckState, Error<E>> {
        let poll = self.options.poll_delay_ms;
        let mut t = 0;

        let ack = loop {
            if self.cancel.is_cancelled() {
                warn!("Cancelled while awaiting ack");
                return Err(Error::Cancelled);
            }

            // Bytes other than ACK / NACK mean the device is still busy
            match self.read(1)?[0] {
                SPI_ACK => break AckState::Ack,
                SPI_NACK => break AckState::Nack,
                _ => (),
            }

            self.delay.delay_ms(poll);
            t += poll.max(1);

            if t > timeout_ms {
                error!("Timeout awaiting ack after {} ms", t);
                return Err(Error::LinkTimeout);
            }
        };

        // Acknowledge the acknowledgement, whatever it was
        self.write(&[SPI_ACK])?;

        self.state = match ack {
            AckState::Ack => State::Acked,
            AckState::Nack => State::Nacked,
        };

        debug!("Received bootloader {:?}", ack);

        Ok(ack)
    }

    /// Await an acknowledgement, returning true on ACK and false on NACK
    pub fn get_ack(&mut self) -> Result<bool, Error<E>> {
        let timeout = self.options.response_timeout_ms;
        Ok(self.poll_ack(timeout)? == AckState::Ack)
    }

    fn sync(&mut self) -> Result<bool, Error<E>> {
        self.write(&[SPI_SYNC])?;
        self.state = State::SyncSent;
        self.get_ack()
    }

    /// Send the sync byte and await the bootloader response
    pub fn start_comms(&mut self) -> Result<bool, Error<E>> {
        debug!("Sending sync byte");
        self.sync()
    }

    /// Connect to the bootloader
    pub fn connect(&mut self) -> Result<(), Error<E>> {
        if !self.start_comms()? {
            error!("Bootloader rejected sync");
            return Err(Error::HandshakeFailed);
        }

        debug!("Bootloader connected");

        Ok(())
    }

    /// Execute a command, sending each payload block in turn and reading
    /// `response_len` bytes of response if non-zero
    pub fn send_command(
        &mut self,
        opcode: u8,
        blocks: &[&[u8]],
        response_len: usize,
    ) -> Result<Option<Vec<u8>>, Error<E>> {
        let timeout = self.options.response_timeout_ms;
        self.exchange(opcode, blocks, response_len, timeout)
    }

    fn exchange(
        &mut self,
        opcode: u8,
        blocks: &[&[u8]],
        response_len: usize,
        block_timeout_ms: u32,
    ) -> Result<Option<Vec<u8>>, Error<E>> {
        debug!("Sending command 0x{:02x}", opcode);

        if !self.sync()? {
            return Err(Error::ProtocolNack(Stage::Sync));
        }

        self.write(&command_bytes(opcode))?;
        if !self.get_ack()? {
            return Err(Error::ProtocolNack(Stage::Command(opcode)));
        }

        for (i, b) in blocks.iter().enumerate() {
            self.write(b)?;
            if self.poll_ack(block_timeout_ms)? != AckState::Ack {
                return Err(Error::ProtocolNack(Stage::Block(i)));
            }
        }

        if response_len == 0 {
            return Ok(None);
        }

        let mut resp = self.read(response_len + 1)?;
        trace!("Response marker: 0x{:02x}", resp[0]);
        resp.remove(0);

        if !self.get_ack()? {
            return Err(Error::ProtocolNack(Stage::Response));
        }

        Ok(Some(resp))
    }

    fn query(&mut self, command: Command) -> Result<Vec<u8>, Error<E>> {
        let len = command.response_len();
        match self.send_command(command.into(), &[], len)? {
            Some(r) if r.len() == len => Ok(r),
            _ => Err(Error::UnexpectedResponse),
        }
    }

    /// Fetch the bootloader protocol version
    pub fn bootloader_version(&mut self) -> Result<u8, Error<E>> {
        let r = self.query(Command::GetVersion)?;
        Ok(r[0])
    }

    /// Fetch the chip product ID
    pub fn chip_id(&mut self) -> Result<u16, Error<E>> {
        let r = self.query(Command::GetId)?;

        // Length marker, N-1 for a two byte ID
        if r[0] != 1 {
            error!("Unexpected chip ID length marker: {}", r[0]);
            return Err(Error::UnexpectedResponse);
        }

        Ok(u16::from_be_bytes([r[1], r[2]]))
    }

    /// Erase the entire flash memory
    pub fn global_erase(&mut self) -> Result<(), Error<E>> {
        info!("Erasing flash");

        let block = erase_all_block();
        let timeout = self.options.erase_timeout_ms;
        self.exchange(Command::ExtendedErase.into(), &[block.as_slice()], 0, timeout)?;

        info!("Erase complete");

        Ok(())
    }

    /// Write a single page (up to 256 bytes) at `addr`
    pub fn write_page(&mut self, addr: u32, data: &[u8]) -> Result<(), Error<E>> {
        if data.is_empty() || data.len() > MAX_CHUNK {
            return Err(Error::InvalidPage(data.len()));
        }

        let a = address_block(addr);
        let d = write_payload_block(data);

        self.send_command(Command::WriteMemory.into(), &[a.as_slice(), d.as_slice()], 0)?;

        Ok(())
    }

    /// Write an image to `base`, one padded page at a time
    pub fn program_image(&mut self, image: &[u8], base: u32) -> Result<(), Error<E>> {
        self.program_image_with(image, base, &mut ())
    }

    /// Write an image to `base`, reporting progress as pages complete
    pub fn program_image_with(
        &mut self,
        image: &[u8],
        base: u32,
        progress: &mut dyn Progress,
    ) -> Result<(), Error<E>> {
        // Check the final page address before touching the device
        let span = page_count(image.len()) * PAGE_SIZE;
        if span > 0 {
            u32::try_from(span - 1)
                .ok()
                .and_then(|s| base.checked_add(s))
                .ok_or(Error::AddressOverflow)?;
        }

        progress.init(base, image.len());

        let mut addr = base;
        for (i, page) in pages(image).enumerate() {
            self.write_page(addr, &page)?;

            debug!("Written {} bytes to 0x{:08x}", page.len(), addr);

            progress.update(((i + 1) * PAGE_SIZE).min(image.len()));
            addr = addr.wrapping_add(PAGE_SIZE as u32);
        }

        progress.finish();

        Ok(())
    }
}
