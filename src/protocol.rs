//! Wire constants and frame encoding for the SPI bootloader (AN4286)

/// Synchronisation byte, starts every exchange
pub const SPI_SYNC: u8 = 0x5A;

pub const SPI_ACK: u8 = 0x79;
pub const SPI_NACK: u8 = 0x1F;

/// Byte clocked out while reading from the device
pub const SPI_DUMMY: u8 = 0x00;

/// Maximum number of bytes accepted by a single write memory command
pub const MAX_CHUNK: usize = 256;

/// Images are written in whole pages, padded with erased flash
pub const PAGE_SIZE: usize = MAX_CHUNK;
pub const PAGE_FILL: u8 = 0xFF;

/// Extended erase code requesting a mass erase
pub const ERASE_ALL: u16 = 0xFFFF;

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Command {
    /// Gets the bootloader version
    GetVersion = 0x01,

    /// Gets the chip ID
    GetId = 0x02,

    /// Writes up to 256 bytes to the RAM or Flash memory starting from an address specified by the application.
    WriteMemory = 0x31,

    /// Erases from one to all the Flash memory pages using two byte addressing mode.
    ExtendedErase = 0x44,
}

impl Command {
    /// Number of response bytes following the status marker, if any
    pub fn response_len(&self) -> usize {
        match self {
            Command::GetVersion => 1,
            Command::GetId => 3,
            Command::WriteMemory | Command::ExtendedErase => 0,
        }
    }
}

impl From<Command> for u8 {
    fn from(c: Command) -> u8 {
        c as u8
    }
}

/// XOR of every byte in `data`, zero for an empty slice
pub fn fold_xor(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, b| acc ^ b)
}

/// Append the XOR checksum to `data`.
///
/// The resulting block always XORs to zero.
pub fn checksummed_block(data: &[u8]) -> Vec<u8> {
    let mut block = Vec::with_capacity(data.len() + 1);
    block.extend_from_slice(data);
    block.push(fold_xor(data));
    block
}

/// Opcode followed by its complement
pub fn command_bytes(opcode: u8) -> [u8; 2] {
    [opcode, opcode ^ 0xFF]
}

/// Big-endian address with checksum
pub fn address_block(addr: u32) -> Vec<u8> {
    checksummed_block(&addr.to_be_bytes())
}

/// Write memory payload: `N-1`, the data, then the checksum over both.
///
/// `data` must hold between 1 and [`MAX_CHUNK`] bytes.
pub fn write_payload_block(data: &[u8]) -> Vec<u8> {
    debug_assert!(!data.is_empty() && data.len() <= MAX_CHUNK);

    let mut body = Vec::with_capacity(data.len() + 1);
    body.push((data.len() - 1) as u8);
    body.extend_from_slice(data);
    checksummed_block(&body)
}

/// Extended erase payload selecting the whole device
pub fn erase_all_block() -> Vec<u8> {
    checksummed_block(&ERASE_ALL.to_be_bytes())
}

/// Split an image into full pages, padding the last with [`PAGE_FILL`]
pub fn pages(image: &[u8]) -> impl Iterator<Item = [u8; PAGE_SIZE]> + '_ {
    image.chunks(PAGE_SIZE).map(|chunk| {
        let mut page = [PAGE_FILL; PAGE_SIZE];
        page[..chunk.len()].copy_from_slice(chunk);
        page
    })
}

/// Number of pages needed to hold `len` bytes
pub fn page_count(len: usize) -> usize {
    (len + PAGE_SIZE - 1) / PAGE_SIZE
}
