//! Useful library code for tests

use std::collections::{BTreeMap, VecDeque};

use embedded_hal::delay::DelayNs;
use hex_literal::hex;
use sdmmc_spi_disk::sdcard::proto::{crc16, crc7};
use sdmmc_spi_disk::{Block, DriveStatus, Transport, TransportError, BLOCK_LEN};

/// A 3.9 GB SDHC card (block addressed).
pub const SDHC_CSD: [u8; 16] = hex!("40 0E 00 32 5B 59 00 00 1D 69 7F 80 0A 40 00 8B");
/// A 2 GB standard capacity card, with 1 KiB read and write blocks.
pub const SDSC_CSD: [u8; 16] = hex!("00 7F 00 32 5B 5A 83 AF 7F FF CF 80 16 80 00 6F");
/// A 1 GB SD v1 card.
pub const SD1_CSD: [u8; 16] = hex!("00 26 00 32 5F 59 83 C8 AD DB CF FF D2 40 40 A5");
/// A CID with a readable product name.
pub const TEST_CID: [u8; 16] = hex!("03 53 44 53 55 30 38 47 80 12 34 56 78 01 4A 01");

/// The kinds of card we can pretend to be.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CardKind {
    /// MMC v3: rejects CMD8 and CMD55, comes up with CMD1
    Mmc,
    /// SD v1: rejects CMD8
    Sd1,
    /// SD v2, standard capacity
    Sd2,
    /// SD v2, high capacity
    Sdhc,
}

impl CardKind {
    fn csd(self) -> [u8; 16] {
        match self {
            CardKind::Mmc | CardKind::Sd2 => SDSC_CSD,
            CardKind::Sd1 => SD1_CSD,
            CardKind::Sdhc => SDHC_CSD,
        }
    }

    fn capacity_blocks(self) -> u32 {
        match self {
            CardKind::Mmc | CardKind::Sd2 => 3_864_576,
            CardKind::Sd1 => 1_984_000,
            CardKind::Sdhc => 7_710_720,
        }
    }
}

/// What the card is doing with the bytes it receives.
#[derive(Debug)]
enum Mode {
    /// Waiting for a command frame
    Command,
    /// Streaming blocks for CMD18 until CMD12 arrives
    ReadMulti { next_block: u32 },
    /// Waiting for a data token after CMD24 or CMD25
    AwaitToken { block: u32, multi: bool },
    /// Collecting a data packet (512 bytes and a CRC)
    Receiving {
        block: u32,
        multi: bool,
        data: Vec<u8>,
    },
}

/// A pretend SD card, talking SPI-mode SD protocol one byte at a time.
///
/// Storage is sparse: blocks that have never been written read back as a
/// pattern derived from their index.
pub struct SimCard<'s> {
    kind: CardKind,
    storage: BTreeMap<u32, Block>,
    present: bool,
    powered: bool,
    selected: bool,
    write_protected: bool,
    idle: bool,
    crc_enabled: bool,
    app_command: bool,
    ready_after: u32,
    op_cond_polls: u32,
    stuck_busy: bool,
    stall_after: Option<usize>,
    data_withheld: bool,
    frame: Vec<u8>,
    out: VecDeque<u8>,
    busy: u32,
    mode: Mode,
    remove_after: Option<(usize, &'s DriveStatus)>,
    bounce_at: Option<(u8, &'s DriveStatus)>,
    blocks_transferred: usize,
    /// Every command received, with the `0x80` marker on application
    /// commands.
    pub commands: Vec<u8>,
    /// How many data tokens the host has sent us.
    pub data_tokens: usize,
    /// How many bytes went over the bus while we were powered and present.
    pub exchanges: usize,
    /// The block count from the last ACMD23.
    pub pre_erase: Option<u32>,
}

impl<'s> SimCard<'s> {
    /// A card of the given kind, which finishes initialising on the third
    /// poll.
    pub fn new(kind: CardKind) -> SimCard<'s> {
        SimCard {
            kind,
            storage: BTreeMap::new(),
            present: true,
            powered: false,
            selected: false,
            write_protected: false,
            idle: false,
            crc_enabled: false,
            app_command: false,
            ready_after: 3,
            op_cond_polls: 0,
            stuck_busy: false,
            stall_after: None,
            data_withheld: false,
            frame: Vec::new(),
            out: VecDeque::new(),
            busy: 0,
            mode: Mode::Command,
            remove_after: None,
            bounce_at: None,
            blocks_transferred: 0,
            commands: Vec::new(),
            data_tokens: 0,
            exchanges: 0,
            pre_erase: None,
        }
    }

    /// A card that never leaves the idle state.
    pub fn never_ready(kind: CardKind) -> SimCard<'s> {
        let mut card = SimCard::new(kind);
        card.ready_after = u32::MAX;
        card
    }

    /// Engage the write protect tab.
    pub fn write_protected(mut self) -> SimCard<'s> {
        self.write_protected = true;
        self
    }

    /// Start with an empty socket.
    pub fn absent(mut self) -> SimCard<'s> {
        self.present = false;
        self
    }

    /// Pull the card out once this many data blocks have gone across,
    /// telling the status word the way a card-detect interrupt would.
    pub fn remove_after(mut self, blocks: usize, status: &'s DriveStatus) -> SimCard<'s> {
        self.remove_after = Some((blocks, status));
        self
    }

    /// Report a card-detect edge (the card stays put) when this command
    /// arrives.
    pub fn bounce_at(mut self, command: u8, status: &'s DriveStatus) -> SimCard<'s> {
        self.bounce_at = Some((command, status));
        self
    }

    /// Hold the data line low for good once this many data blocks have
    /// gone across.
    pub fn stall_after(mut self, blocks: usize) -> SimCard<'s> {
        self.stall_after = Some(blocks);
        self
    }

    /// Accept read commands but never send the data packet.
    pub fn set_data_withheld(&mut self, withheld: bool) {
        self.data_withheld = withheld;
    }

    /// Hold the data line low from now on.
    pub fn set_stuck_busy(&mut self, stuck: bool) {
        self.stuck_busy = stuck;
    }

    /// Put the card in (or take it out of) the socket, without telling
    /// anyone.
    pub fn set_present(&mut self, present: bool) {
        self.present = present;
        if !present {
            self.reset();
        }
    }

    /// How many ACMD41 or CMD1 polls we have seen.
    pub fn op_cond_polls(&self) -> u32 {
        self.op_cond_polls
    }

    /// Does the card hold power right now?
    pub fn is_powered(&self) -> bool {
        self.powered
    }

    /// How many times did we see this command?
    pub fn count(&self, command: u8) -> usize {
        self.commands.iter().filter(|&&c| c == command).count()
    }

    /// Fill a block directly.
    pub fn poke(&mut self, block: u32, contents: Block) {
        self.storage.insert(block, contents);
    }

    /// Look at a block directly.
    pub fn peek(&self, block: u32) -> Block {
        self.storage
            .get(&block)
            .copied()
            .unwrap_or_else(|| background(block))
    }

    /// Forget everything about the protocol state, as at power-up.
    fn reset(&mut self) {
        self.idle = false;
        self.crc_enabled = false;
        self.app_command = false;
        self.frame.clear();
        self.out.clear();
        self.busy = 0;
        self.mode = Mode::Command;
    }

    fn remove(&mut self) {
        if let Some((_, status)) = self.remove_after.take() {
            self.set_present(false);
            status.on_presence_changed(false);
        }
    }

    fn count_block(&mut self) {
        self.blocks_transferred += 1;
        if self.stall_after.is_some_and(|n| self.blocks_transferred >= n) {
            self.stuck_busy = true;
        }
        if let Some((limit, _)) = self.remove_after {
            if self.blocks_transferred >= limit {
                self.remove();
            }
        }
    }

    fn r1(&self) -> u8 {
        if self.idle {
            0x01
        } else {
            0x00
        }
    }

    fn respond(&mut self, bytes: &[u8]) {
        // One byte of Ncr before every response
        self.out.push_back(0xFF);
        self.out.extend(bytes.iter().copied());
    }

    fn queue_data(&mut self, data: &[u8]) {
        if self.data_withheld {
            return;
        }
        self.out.push_back(0xFF);
        self.out.push_back(0xFE);
        self.out.extend(data.iter().copied());
        self.out.extend(crc16(data).to_be_bytes());
    }

    /// Turn a command address into a block number, if it is a valid one.
    fn block_for(&self, arg: u32) -> Option<u32> {
        let block = if self.kind == CardKind::Sdhc {
            arg
        } else if arg % BLOCK_LEN as u32 == 0 {
            arg / BLOCK_LEN as u32
        } else {
            return None;
        };
        if block < self.kind.capacity_blocks() {
            Some(block)
        } else {
            None
        }
    }

    fn next_output(&mut self) -> u8 {
        if let Some(b) = self.out.pop_front() {
            return b;
        }
        if self.stuck_busy {
            return 0x00;
        }
        if self.busy > 0 {
            self.busy -= 1;
            return 0x00;
        }
        if let Mode::ReadMulti { next_block } = self.mode {
            if self.data_withheld {
                return 0xFF;
            }
            let removal_due = self
                .remove_after
                .is_some_and(|(n, _)| self.blocks_transferred >= n);
            if self.present && removal_due {
                self.remove();
                return 0xFF;
            }
            if next_block < self.kind.capacity_blocks() {
                let data = self.peek(next_block);
                self.queue_data(&data);
                self.mode = Mode::ReadMulti {
                    next_block: next_block + 1,
                };
                // Counted when queued. Removal is checked before the next
                // block is generated.
                self.blocks_transferred += 1;
            } else {
                // Out of range error token
                self.out.push_back(0x08);
            }
            return self.out.pop_front().unwrap_or(0xFF);
        }
        0xFF
    }

    fn receive_data(&mut self, byte: u8) {
        let Mode::Receiving { block, multi, data } = &mut self.mode else {
            return;
        };
        data.push(byte);
        if data.len() < BLOCK_LEN + 2 {
            return;
        }
        let (block, multi) = (*block, *multi);
        let payload = data[..BLOCK_LEN].to_vec();
        let crc = u16::from_be_bytes([data[BLOCK_LEN], data[BLOCK_LEN + 1]]);
        self.mode = if multi {
            Mode::AwaitToken {
                block: block + 1,
                multi,
            }
        } else {
            Mode::Command
        };
        if self.crc_enabled && crc != crc16(&payload) {
            // Data rejected due to a CRC error
            self.out.push_back(0xEB);
            return;
        }
        if block >= self.kind.capacity_blocks() {
            // Data rejected due to a write error
            self.out.push_back(0xED);
            return;
        }
        let mut contents = [0u8; BLOCK_LEN];
        contents.copy_from_slice(&payload);
        self.storage.insert(block, contents);
        // Data accepted, then busy while programming
        self.out.push_back(0xE5);
        self.busy += 3;
        self.count_block();
    }

    fn handle_command(&mut self) {
        let frame = std::mem::take(&mut self.frame);
        let command = frame[0] & 0x3F;
        let arg = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);
        let crc = frame[5];
        let app = std::mem::take(&mut self.app_command);
        self.commands.push(if app { command | 0x80 } else { command });
        if let Some((_, status)) = self.bounce_at.filter(|(c, _)| *c == command) {
            self.bounce_at = None;
            status.on_presence_changed(true);
        }

        let crc_ok = if self.crc_enabled {
            crc == crc7(&frame[0..5])
        } else {
            match command {
                0 => crc == 0x95,
                8 => crc == 0x87,
                _ => true,
            }
        };
        if !crc_ok {
            let r = self.r1() | 0x08;
            self.respond(&[r]);
            return;
        }

        let illegal = self.r1() | 0x04;
        match (app, command) {
            (_, 0) => {
                self.reset();
                self.idle = true;
                self.respond(&[0x01]);
            }
            (_, 59) => {
                self.crc_enabled = (arg & 1) != 0;
                let r = self.r1();
                self.respond(&[r]);
            }
            (_, 8) => match self.kind {
                CardKind::Mmc | CardKind::Sd1 => self.respond(&[illegal]),
                CardKind::Sd2 | CardKind::Sdhc => {
                    let r = self.r1();
                    self.respond(&[r, 0x00, 0x00, ((arg >> 8) & 0x0F) as u8, arg as u8]);
                }
            },
            (_, 55) => {
                if self.kind == CardKind::Mmc {
                    self.respond(&[illegal]);
                } else {
                    self.app_command = true;
                    let r = self.r1();
                    self.respond(&[r]);
                }
            }
            (true, 41) => {
                self.op_cond_polls += 1;
                if self.op_cond_polls >= self.ready_after {
                    self.idle = false;
                }
                let r = self.r1();
                self.respond(&[r]);
            }
            (false, 1) => {
                if self.kind != CardKind::Mmc {
                    self.respond(&[illegal]);
                    return;
                }
                self.op_cond_polls += 1;
                if self.op_cond_polls >= self.ready_after {
                    self.idle = false;
                }
                let r = self.r1();
                self.respond(&[r]);
            }
            (false, 58) => {
                let r = self.r1();
                let ccs = if self.kind == CardKind::Sdhc { 0x40 } else { 0x00 };
                let busy = if self.idle { 0x00 } else { 0x80 };
                self.respond(&[r, busy | ccs, 0xFF, 0x80, 0x00]);
            }
            (false, 16) => {
                let r = self.r1();
                if arg == BLOCK_LEN as u32 {
                    self.respond(&[r]);
                } else {
                    self.respond(&[r | 0x40]);
                }
            }
            _ if self.idle => self.respond(&[illegal]),
            (false, 9) => {
                self.respond(&[0x00]);
                let csd = self.kind.csd();
                self.queue_data(&csd);
            }
            (false, 10) => {
                self.respond(&[0x00]);
                self.queue_data(&TEST_CID);
            }
            (true, 13) => {
                // R2 is the R1 byte plus a second status byte
                self.respond(&[0x00, 0x00]);
                let mut status = [0u8; 64];
                status[10] = 0x90;
                self.queue_data(&status);
            }
            (true, 23) => {
                self.pre_erase = Some(arg);
                self.respond(&[0x00]);
            }
            (false, 17) => match self.block_for(arg) {
                Some(block) => {
                    self.respond(&[0x00]);
                    let data = self.peek(block);
                    self.queue_data(&data);
                    self.count_block();
                }
                None => self.respond(&[0x20]),
            },
            (false, 18) => match self.block_for(arg) {
                Some(block) => {
                    self.respond(&[0x00]);
                    self.mode = Mode::ReadMulti { next_block: block };
                }
                None => self.respond(&[0x20]),
            },
            (false, 12) => {
                self.mode = Mode::Command;
                self.out.clear();
                // Stuff byte, then R1
                self.out.push_back(0xFF);
                self.respond(&[0x00]);
            }
            (false, 24) | (false, 25) => match self.block_for(arg) {
                Some(block) => {
                    self.respond(&[0x00]);
                    self.mode = Mode::AwaitToken {
                        block,
                        multi: command == 25,
                    };
                }
                None => self.respond(&[0x20]),
            },
            _ => self.respond(&[illegal]),
        }
    }

    fn handle_token(&mut self, token: u8, block: u32, multi: bool) {
        self.data_tokens += 1;
        match (token, multi) {
            (0xFE, false) | (0xFC, true) => {
                self.mode = Mode::Receiving {
                    block,
                    multi,
                    data: Vec::with_capacity(BLOCK_LEN + 2),
                };
            }
            (0xFD, true) => {
                self.mode = Mode::Command;
                self.busy += 3;
            }
            _ => {
                self.mode = Mode::Command;
            }
        }
    }
}

/// The contents of a block nobody has written to.
pub fn background(block: u32) -> Block {
    let mut contents = [0u8; BLOCK_LEN];
    for (i, b) in contents.iter_mut().enumerate() {
        *b = (block as usize).wrapping_add(i) as u8;
    }
    contents
}

impl Transport for SimCard<'_> {
    fn exchange_byte(&mut self, out: u8) -> Result<u8, TransportError> {
        if !self.present || !self.powered {
            return Ok(0xFF);
        }
        self.exchanges += 1;
        if !self.selected {
            return Ok(0xFF);
        }
        if let Mode::Receiving { .. } = self.mode {
            self.receive_data(out);
            return Ok(0xFF);
        }

        let reply = self.next_output();

        if let Mode::AwaitToken { block, multi } = self.mode {
            if out != 0xFF && self.out.is_empty() && self.busy == 0 {
                self.handle_token(out, block, multi);
            }
            return Ok(reply);
        }

        if self.frame.is_empty() {
            if (out & 0xC0) == 0x40 {
                self.frame.push(out);
            }
        } else {
            self.frame.push(out);
            if self.frame.len() == 6 {
                self.handle_command();
            }
        }
        Ok(reply)
    }

    fn select(&mut self) -> Result<(), TransportError> {
        if !self.selected {
            self.selected = true;
            self.out.clear();
            self.frame.clear();
        }
        Ok(())
    }

    fn deselect(&mut self) -> Result<(), TransportError> {
        self.selected = false;
        Ok(())
    }

    fn is_present(&mut self) -> bool {
        self.present
    }

    fn set_power(&mut self, on: bool) -> Result<(), TransportError> {
        if self.powered != on {
            self.reset();
        }
        self.powered = on;
        Ok(())
    }

    fn is_write_protected(&mut self) -> bool {
        self.write_protected
    }
}

/// A delay that doesn't, but keeps score.
#[derive(Debug, Default, Clone)]
pub struct TestDelay {
    /// How many times we were asked to wait
    pub calls: u32,
    /// How long we were asked to wait in total
    pub total_ns: u64,
}

impl DelayNs for TestDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.calls += 1;
        self.total_ns += u64::from(ns);
    }
}

/// Get log output from the driver when a test fails.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A block full of a recognisable pattern.
pub fn pattern(seed: u8) -> Block {
    let mut block = [0u8; BLOCK_LEN];
    for (i, b) in block.iter_mut().enumerate() {
        *b = seed.wrapping_mul(31).wrapping_add(i as u8) ^ (i >> 8) as u8;
    }
    block
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
