//! Simulated SPI bootloader for exercising the programmer without hardware

use std::collections::VecDeque;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::blocking::spi::Transfer;

use stm32_spi_loader::protocol::{SPI_ACK, SPI_NACK, SPI_SYNC};
use stm32_spi_loader::CancelToken;

/// Dummy byte the device clocks out ahead of a response
pub const MARKER: u8 = 0xA5;

/// Byte clocked out while the device is busy
pub const BUSY: u8 = 0x00;

#[derive(Debug, Clone, PartialEq)]
pub struct SimError;

/// A command seen by the device along with its payload blocks
#[derive(Debug, Clone, PartialEq)]
pub struct Exchange {
    pub opcode: u8,
    pub blocks: Vec<Vec<u8>>,
}

impl Exchange {
    /// Address carried by a write memory command
    pub fn address(&self) -> u32 {
        let a = &self.blocks[0];
        u32::from_be_bytes([a[0], a[1], a[2], a[3]])
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Next {
    Frame,
    Block(usize),
    Respond(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq)]
enum Expect {
    /// Sync or command
    Frame,
    /// Payload block, with the number still to come including this one
    Block(usize),
    /// Host acknowledgement of our ACK / NACK
    Echo(Next),
}

pub struct Bootloader {
    pub version: u8,
    pub id_response: [u8; 3],
    /// Busy bytes returned ahead of every acknowledgement
    pub busy: usize,
    pub nack_sync: bool,
    /// NACK the command byte pair carrying this opcode
    pub nack_command: Option<u8>,
    /// NACK after sending a response
    pub nack_response: bool,
    /// NACK the data block of the nth write memory command
    pub nack_write: Option<usize>,
    /// Never acknowledge the erase payload
    pub stall_erase: bool,
    /// Never respond at all
    pub silent: bool,
    pub fail: bool,

    pub transfers: Vec<Vec<u8>>,
    pub exchanges: Vec<Exchange>,
    pub syncs: usize,
    pub echoes: usize,

    pending: VecDeque<u8>,
    expect: Expect,
    writes: usize,
}

impl Default for Bootloader {
    fn default() -> Self {
        Self {
            version: 0x11,
            id_response: [0x01, 0x04, 0x13],
            busy: 0,
            nack_sync: false,
            nack_command: None,
            nack_response: false,
            nack_write: None,
            stall_erase: false,
            silent: false,
            fail: false,
            transfers: vec![],
            exchanges: vec![],
            syncs: 0,
            echoes: 0,
            pending: VecDeque::new(),
            expect: Expect::Frame,
            writes: 0,
        }
    }
}

impl Bootloader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write memory commands in the order received
    pub fn writes(&self) -> Vec<&Exchange> {
        self.exchanges.iter().filter(|e| e.opcode == 0x31).collect()
    }

    pub fn opcodes(&self) -> Vec<u8> {
        self.exchanges.iter().map(|e| e.opcode).collect()
    }

    fn reply(&mut self, ack: bool, next: Next) {
        if self.silent {
            return;
        }

        for _ in 0..self.busy {
            self.pending.push_back(BUSY);
        }
        self.pending.push_back(if ack { SPI_ACK } else { SPI_NACK });

        self.expect = Expect::Echo(next);
    }

    fn receive(&mut self, out: &[u8]) {
        // Polling with nothing queued
        if out == [BUSY] {
            return;
        }

        match std::mem::replace(&mut self.expect, Expect::Frame) {
            Expect::Echo(next) => {
                assert_eq!(out, &[SPI_ACK], "expected ack echo");
                self.echoes += 1;

                match next {
                    Next::Frame => (),
                    Next::Block(n) => self.expect = Expect::Block(n),
                    Next::Respond(data) => {
                        self.pending.push_back(MARKER);
                        self.pending.extend(data);
                        let ack = !self.nack_response;
                        self.reply(ack, Next::Frame);
                    }
                }
            }
            Expect::Block(n) => self.block(out, n),
            Expect::Frame => self.frame(out),
        }
    }

    fn block(&mut self, out: &[u8], remaining: usize) {
        let last = self.exchanges.last_mut().expect("block without command");
        last.blocks.push(out.to_vec());
        let opcode = last.opcode;

        if opcode == 0x44 && self.stall_erase {
            return;
        }

        let nack = opcode == 0x31 && remaining == 1 && self.nack_write == Some(self.writes - 1);
        let next = if nack || remaining == 1 {
            Next::Frame
        } else {
            Next::Block(remaining - 1)
        };

        self.reply(!nack, next);
    }

    fn frame(&mut self, out: &[u8]) {
        match out {
            [SPI_SYNC] => {
                self.syncs += 1;
                let ack = !self.nack_sync;
                self.reply(ack, Next::Frame);
            }
            [op, c] if op ^ c == 0xFF => {
                let op = *op;
                self.exchanges.push(Exchange {
                    opcode: op,
                    blocks: vec![],
                });

                if self.nack_command == Some(op) {
                    self.reply(false, Next::Frame);
                    return;
                }

                let next = match op {
                    0x01 => Next::Respond(vec![self.version]),
                    0x02 => Next::Respond(self.id_response.to_vec()),
                    0x44 => Next::Block(1),
                    0x31 => {
                        self.writes += 1;
                        Next::Block(2)
                    }
                    _ => Next::Frame,
                };
                self.reply(true, next);
            }
            _ => panic!("unexpected frame {:02x?}", out),
        }
    }
}

impl Transfer<u8> for Bootloader {
    type Error = SimError;

    fn transfer<'w>(&mut self, words: &'w mut [u8]) -> Result<&'w [u8], SimError> {
        if self.fail {
            return Err(SimError);
        }

        let out = words.to_vec();
        self.transfers.push(out.clone());

        if !self.pending.is_empty() {
            for w in words.iter_mut() {
                *w = self.pending.pop_front().unwrap_or(BUSY);
            }
            return Ok(words);
        }

        self.receive(&out);

        for w in words.iter_mut() {
            *w = BUSY;
        }

        Ok(words)
    }
}

/// Delay source that only counts elapsed time, optionally cancelling a
/// token once a threshold is crossed
#[derive(Default)]
pub struct Clock {
    pub elapsed_ms: u64,
    pub cancel_at: Option<(u64, CancelToken)>,
}

impl DelayMs<u32> for Clock {
    fn delay_ms(&mut self, ms: u32) {
        self.elapsed_ms += ms as u64;

        if let Some((at, token)) = &self.cancel_at {
            if self.elapsed_ms >= *at {
                token.cancel();
            }
        }
    }
}
