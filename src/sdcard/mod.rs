//! The SD/MMC Protocol
//!
//! Implements the SD/MMC protocol on top of a [`Transport`].
//!
//! This is currently optimised for readability and debugability, not
//! performance.

pub mod proto;
pub mod transport;

// ****************************************************************************
// Imports
// ****************************************************************************

use core::cell::RefCell;

use embedded_hal::delay::DelayNs;

use crate::blockdevice::{Block, BlockCount, BlockIdx, BLOCK_LEN_U32};
use crate::status::{DeviceStatus, DriveStatus};
use proto::*;
use transport::{Transport, TransportError};

use crate::{debug, trace, warn};

// ****************************************************************************
// Constants
// ****************************************************************************

/// How many bytes we clock in looking for a command response
const COMMAND_RESPONSE_ATTEMPTS: u32 = 10;

/// Gap between polls of the operating condition
const INIT_POLL_INTERVAL_US: u32 = 1_000;

/// Gap between polls while the card is busy or we wait for data
const BUSY_POLL_INTERVAL_US: u32 = 100;

/// How long we let the supply settle after switching on the socket
const POWER_UP_DELAY_US: u32 = 5_000;

/// 80 clock pulses, to be sure of the 74 the card wants
const POWER_UP_DUMMY_BYTES: usize = 10;

// ****************************************************************************
// Types and Implementations
// ****************************************************************************

/// Driver for an SD Card on an SPI bus.
///
/// Built from a [`Transport`], something to busy-wait with, and a reference
/// to the [`DriveStatus`] word that your card-detect interrupt also updates.
///
/// The card is not initialised when you create this object. Call
/// [`SdCard::initialize`] first; every other operation fails with
/// [`Error::NotReady`] until that has succeeded, and again after the card
/// has been removed.
///
/// All the APIs take `&self` - mutability is handled using an inner
/// `RefCell`, which also stops two operations from interleaving on the bus.
pub struct SdCard<'s, T, D>
where
    T: Transport,
    D: DelayNs,
{
    inner: RefCell<SdCardInner<'s, T, D>>,
    status: &'s DriveStatus,
}

impl<'s, T, D> SdCard<'s, T, D>
where
    T: Transport,
    D: DelayNs,
{
    /// Create a new SD/MMC Card driver.
    ///
    /// Uses the default options.
    pub fn new(transport: T, delayer: D, status: &'s DriveStatus) -> SdCard<'s, T, D> {
        Self::new_with_options(transport, delayer, status, AcquireOpts::default())
    }

    /// Construct a new SD/MMC Card driver, using the given options.
    pub fn new_with_options(
        transport: T,
        delayer: D,
        status: &'s DriveStatus,
        options: AcquireOpts,
    ) -> SdCard<'s, T, D> {
        SdCard {
            inner: RefCell::new(SdCardInner {
                transport,
                delayer,
                status,
                card_type: None,
                powered: false,
                options,
            }),
            status,
        }
    }

    /// Get a temporary borrow on the underlying transport.
    ///
    /// The given closure will be called exactly once, and will be passed a
    /// mutable reference to the transport. Useful if you need to re-clock
    /// the SPI bus after initialisation.
    pub fn transport<R, F>(&self, func: F) -> R
    where
        F: FnOnce(&mut T) -> R,
    {
        let mut inner = self.inner.borrow_mut();
        func(&mut inner.transport)
    }

    /// Get the transport and delay objects back.
    pub fn free(self) -> (T, D) {
        let inner = self.inner.into_inner();
        (inner.transport, inner.delayer)
    }

    /// Get the current drive status.
    pub fn status(&self) -> DeviceStatus {
        self.status.get()
    }

    /// Initialise the card.
    ///
    /// Runs the whole power-up sequence, every time it is called, and
    /// works out what kind of card is in the socket. On success the
    /// returned status no longer contains
    /// [`DeviceStatus::UNINITIALIZED`].
    pub fn initialize(&self) -> DeviceStatus {
        let mut inner = self.inner.borrow_mut();
        inner.initialize()
    }

    /// Get the card type, if the card is initialised.
    pub fn card_type(&self) -> Option<CardType> {
        let inner = self.inner.borrow();
        if self.status.get().is_ready() {
            inner.card_type
        } else {
            None
        }
    }

    /// Read one or more blocks, starting at the given block index.
    pub fn read(&self, blocks: &mut [Block], start_block_idx: BlockIdx) -> Result<(), Error> {
        debug!("Read {} blocks @ {}", blocks.len(), start_block_idx.0);
        self.read_sectors(blocks.iter_mut().map(|b| &mut b[..]), start_block_idx)
    }

    /// Read whole sectors into each of the given buffers in turn.
    pub(crate) fn read_sectors<'b, I>(
        &self,
        sectors: I,
        start_block_idx: BlockIdx,
    ) -> Result<(), Error>
    where
        I: ExactSizeIterator<Item = &'b mut [u8]>,
    {
        if sectors.len() == 0 {
            return Err(Error::ParameterError);
        }
        let mut inner = self.inner.borrow_mut();
        let card_type = inner.check_ready()?;
        inner.read(card_type, sectors, start_block_idx)
    }

    /// Write one or more blocks, starting at the given block index.
    pub fn write(&self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Error> {
        debug!("Writing {} blocks @ {}", blocks.len(), start_block_idx.0);
        self.write_sectors(blocks.iter().map(|b| &b[..]), start_block_idx)
    }

    /// Write each of the given sector buffers in turn.
    pub(crate) fn write_sectors<'b, I>(
        &self,
        sectors: I,
        start_block_idx: BlockIdx,
    ) -> Result<(), Error>
    where
        I: ExactSizeIterator<Item = &'b [u8]>,
    {
        if sectors.len() == 0 {
            return Err(Error::ParameterError);
        }
        let mut inner = self.inner.borrow_mut();
        let card_type = inner.check_ready()?;
        if self.status.get().contains(DeviceStatus::WRITE_PROTECTED) {
            return Err(Error::WriteProtected);
        }
        inner.write(card_type, sectors, start_block_idx)
    }

    /// Wait for any write still in progress inside the card to finish.
    pub fn sync(&self) -> Result<(), Error> {
        let mut inner = self.inner.borrow_mut();
        inner.check_ready()?;
        inner.with_release(|s| s.select())
    }

    /// Determine how many blocks this device can hold.
    ///
    /// Capacities beyond 32-bit sector numbers are clamped.
    pub fn num_blocks(&self) -> Result<BlockCount, Error> {
        let csd = self.read_csd()?;
        let blocks = csd.card_capacity_blocks();
        Ok(BlockCount(u32::try_from(blocks).unwrap_or(u32::MAX)))
    }

    /// Return the usable size of this SD card in bytes.
    pub fn num_bytes(&self) -> Result<u64, Error> {
        let csd = self.read_csd()?;
        Ok(csd.card_capacity_bytes())
    }

    /// The size of a sector. Always 512 bytes.
    pub fn sector_size(&self) -> u16 {
        BLOCK_LEN_U32 as u16
    }

    /// Get the erase block size, in sectors.
    pub fn erase_block_size(&self) -> Result<u32, Error> {
        let mut inner = self.inner.borrow_mut();
        let card_type = inner.check_ready()?;
        inner.with_release(|s| s.erase_block_size(card_type))
    }

    /// Read the 'card specific data' block.
    pub fn read_csd(&self) -> Result<Csd, Error> {
        let mut inner = self.inner.borrow_mut();
        inner.check_ready()?;
        inner.with_release(|s| s.read_csd())
    }

    /// Read the 'card identification' block.
    pub fn read_cid(&self) -> Result<Cid, Error> {
        let mut inner = self.inner.borrow_mut();
        inner.check_ready()?;
        inner.with_release(|s| {
            let mut cid = Cid::default();
            s.read_register(CMD10, &mut cid.data)?;
            Ok(cid)
        })
    }

    /// Read the operating conditions register.
    pub fn read_ocr(&self) -> Result<Ocr, Error> {
        let mut inner = self.inner.borrow_mut();
        inner.check_ready()?;
        inner.with_release(|s| s.read_ocr())
    }

    /// Read the 64-byte SD Status register. SD cards only.
    pub fn read_sd_status(&self) -> Result<SdStatus, Error> {
        let mut inner = self.inner.borrow_mut();
        inner.check_ready()?;
        inner.with_release(|s| s.read_sd_status())
    }

    /// Switch off the power to the socket.
    ///
    /// The card will need initialising again afterwards.
    pub fn power_off(&self) -> Result<(), Error> {
        let mut inner = self.inner.borrow_mut();
        inner.power_off()
    }

    /// Is the socket powered?
    pub fn is_powered(&self) -> bool {
        let inner = self.inner.borrow();
        inner.powered
    }

    /// Mark the card as ejected and release the bus.
    ///
    /// The drive reports [`DeviceStatus::NO_MEDIA`] until the card has been
    /// physically removed and re-inserted.
    pub fn eject(&self) -> Result<(), Error> {
        self.status.eject();
        let mut inner = self.inner.borrow_mut();
        inner.card_type = None;
        inner.deselect()
    }

    /// Has the card been ejected (and not yet physically removed)?
    pub fn is_ejected(&self) -> bool {
        self.status.is_ejected()
    }

    /// Sample the card-detect line and update the drive status.
    ///
    /// For boards where the card-detect switch is not wired to an
    /// interrupt. The driver also does this at the start of each operation.
    pub fn poll_presence(&self) -> DeviceStatus {
        let mut inner = self.inner.borrow_mut();
        inner.poll_presence()
    }
}

/// Inner details for the SD Card driver.
///
/// All the APIs required `&mut self`.
struct SdCardInner<'s, T, D>
where
    T: Transport,
    D: DelayNs,
{
    transport: T,
    delayer: D,
    status: &'s DriveStatus,
    card_type: Option<CardType>,
    powered: bool,
    options: AcquireOpts,
}

impl<T, D> SdCardInner<'_, T, D>
where
    T: Transport,
    D: DelayNs,
{
    /// Check the card is initialised and return its type.
    fn check_ready(&mut self) -> Result<CardType, Error> {
        if !self.poll_presence().is_ready() {
            return Err(Error::NotReady);
        }
        self.card_type.ok_or(Error::NotReady)
    }

    /// Fails if the card has gone away since the operation started.
    fn check_media(&self) -> Result<(), Error> {
        if self.status.get().is_ready() {
            Ok(())
        } else {
            warn!("Card removed during transfer");
            Err(Error::MediaRemoved)
        }
    }

    /// A transfer error caused by the card disappearing is reported as
    /// such.
    fn media_error(&self, e: Error) -> Error {
        if self.status.get().is_ready() {
            e
        } else {
            warn!("Card removed during transfer ({:?})", e);
            Error::MediaRemoved
        }
    }

    fn poll_presence(&mut self) -> DeviceStatus {
        let present = self.transport.is_present();
        let status = self.status.get();
        if present {
            if status.contains(DeviceStatus::NO_MEDIA) && !self.status.is_ejected() {
                debug!("Card inserted");
                self.status.on_presence_changed(true);
            }
        } else if !status.contains(DeviceStatus::NO_MEDIA) || self.status.is_ejected() {
            debug!("Card removed");
            self.status.on_presence_changed(false);
        }
        self.status.get()
    }

    /// Run the initialisation sequence and record the outcome.
    fn initialize(&mut self) -> DeviceStatus {
        self.poll_presence();
        let status = self.status.begin_initialization();
        if status.contains(DeviceStatus::NO_MEDIA) {
            debug!("No card, not initialising");
            return status;
        }
        self.status.mark_uninitialized();
        self.card_type = None;

        let result = self.acquire();
        // Release the bus whatever happened.
        let _ = self.deselect();

        match result {
            Ok(card_type) => {
                debug!("Card version: {:?}", card_type);
                self.card_type = Some(card_type);
                let write_protected = self.transport.is_write_protected();
                self.status.finish_initialization(write_protected)
            }
            Err(_e) => {
                warn!("Card initialisation failed: {:?}", _e);
                self.status.get()
            }
        }
    }

    /// Initializes the card into a known state (or at least tries to).
    fn acquire(&mut self) -> Result<CardType, Error> {
        debug!("acquiring card with opts: {:?}", self.options);
        self.transport.set_power(true)?;
        self.powered = true;
        self.delayer.delay_us(POWER_UP_DELAY_US);

        trace!("Reset card..");
        // Supply minimum of 74 clock cycles without CS asserted.
        self.transport.deselect()?;
        for _ in 0..POWER_UP_DUMMY_BYTES {
            self.transport.exchange_byte(0xFF)?;
        }

        // Enter SPI mode
        let r = self.card_command(CMD0, 0)?;
        if r != R1_IDLE_STATE {
            warn!("Got response: {:x} to CMD0", r);
            return Err(unexpected(CMD0, r));
        }

        if self.options.use_crc {
            debug!("Enable CRC");
            let r = self.card_command(CMD59, 1)?;
            if r != R1_IDLE_STATE {
                return Err(unexpected(CMD59, r));
            }
        }

        // Check card version
        let card_type = if self.card_command(CMD8, IF_COND_ARG)? == R1_IDLE_STATE {
            let mut r7 = [0xFF; 4];
            self.transport.receive_bytes(&mut r7)?;
            trace!("R7: {:?}", r7);
            if r7[2] != 0x01 || r7[3] != 0xAA {
                // Card cannot work at our supply voltage
                return Err(unexpected(CMD8, r7[3]));
            }
            self.wait_for_ready(ACMD41, ACMD41_HCS)?;
            let ocr = self.read_ocr()?;
            if ocr.card_capacity_status() {
                CardType::SDHC
            } else {
                CardType::SD2
            }
        } else {
            let (card_type, command) = if self.card_command(ACMD41, 0)? <= R1_IDLE_STATE {
                (CardType::SD1, ACMD41)
            } else {
                (CardType::MMC, CMD1)
            };
            self.wait_for_ready(command, 0)?;
            card_type
        };

        if !card_type.is_block_addressed() {
            let r = self.card_command(CMD16, BLOCK_LEN_U32)?;
            expect_ready(CMD16, r)?;
        }

        Ok(card_type)
    }

    /// Repeat an operating-condition command until the card leaves the idle
    /// state.
    fn wait_for_ready(&mut self, command: u8, arg: u32) -> Result<(), Error> {
        let mut delay = Delay::new(self.options.init_attempts, INIT_POLL_INTERVAL_US);
        while self.card_command(command, arg)? != R1_READY_STATE {
            delay.delay(&mut self.delayer, Error::TimeoutCommand(command))?;
        }
        Ok(())
    }

    /// Read one or more blocks, starting at the given block index.
    fn read<'b, I>(
        &mut self,
        card_type: CardType,
        mut blocks: I,
        start_block_idx: BlockIdx,
    ) -> Result<(), Error>
    where
        I: ExactSizeIterator<Item = &'b mut [u8]>,
    {
        let start_idx = card_type.address(start_block_idx)?;
        self.with_release(|s| {
            if blocks.len() == 1 {
                // Start a single-block read
                let r = s.card_command(CMD17, start_idx)?;
                expect_ready(CMD17, r)?;
                blocks
                    .try_for_each(|block| s.read_data(block))
                    .map_err(|e| s.media_error(e))
            } else {
                // Start a multi-block read
                let r = s.card_command(CMD18, start_idx)?;
                expect_ready(CMD18, r)?;
                let mut result = Ok(());
                for block in blocks {
                    result = s
                        .check_media()
                        .and_then(|_| s.read_data(block))
                        .map_err(|e| s.media_error(e));
                    if result.is_err() {
                        break;
                    }
                }
                if !matches!(result, Err(Error::MediaRemoved)) {
                    // Stop the read, even if it failed, so the card goes
                    // back to idle.
                    match s.card_command(CMD12, 0) {
                        Ok(R1_READY_STATE) => {}
                        Ok(_r) => {
                            warn!("Got response: {:x} to CMD12", _r);
                        }
                        Err(_e) => {
                            warn!("Stopping read failed: {:?}", _e);
                        }
                    }
                }
                result
            }
        })
    }

    /// Write one or more blocks, starting at the given block index.
    fn write<'b, I>(
        &mut self,
        card_type: CardType,
        mut blocks: I,
        start_block_idx: BlockIdx,
    ) -> Result<(), Error>
    where
        I: ExactSizeIterator<Item = &'b [u8]>,
    {
        let start_idx = card_type.address(start_block_idx)?;
        self.with_release(|s| {
            if blocks.len() == 1 {
                // Start a single-block write
                let r = s.card_command(CMD24, start_idx)?;
                expect_ready(CMD24, r)?;
                blocks
                    .try_for_each(|block| s.write_data(DataToken::StartBlock, block))
                    .map_err(|e| s.media_error(e))
            } else {
                if card_type.is_sd() {
                    // Pre-erase hint. Cards that ignore it still work.
                    let _ = s.card_command(ACMD23, blocks.len() as u32)?;
                }
                // Start a multi-block write
                let r = s.card_command(CMD25, start_idx)?;
                expect_ready(CMD25, r)?;
                let mut result = Ok(());
                for block in blocks {
                    result = s
                        .check_media()
                        .and_then(|_| s.write_data(DataToken::WriteMultiple, block))
                        .map_err(|e| s.media_error(e));
                    if result.is_err() {
                        break;
                    }
                }
                if !matches!(result, Err(Error::MediaRemoved)) {
                    // Stop the write
                    let stop = s
                        .write_data(DataToken::StopTran, &[])
                        .map_err(|e| s.media_error(e));
                    if result.is_ok() {
                        result = stop;
                    }
                }
                result
            }
        })
    }

    /// Read the 'card specific data' block.
    fn read_csd(&mut self) -> Result<Csd, Error> {
        let mut data = [0u8; 16];
        self.read_register(CMD9, &mut data)?;
        let csd = Csd::from_bytes(data);
        debug!("CSD: {:?}", csd.data());
        Ok(csd)
    }

    /// Read a register that comes back as a data block.
    fn read_register(&mut self, command: u8, buffer: &mut [u8]) -> Result<(), Error> {
        let r = self.card_command(command, 0)?;
        expect_ready(command, r)?;
        self.read_data(buffer)
    }

    fn read_ocr(&mut self) -> Result<Ocr, Error> {
        let r = self.card_command(CMD58, 0)?;
        expect_ready(CMD58, r)?;
        let mut ocr = Ocr::default();
        self.transport.receive_bytes(&mut ocr.data)?;
        trace!("OCR: {:?}", ocr.data);
        Ok(ocr)
    }

    fn read_sd_status(&mut self) -> Result<SdStatus, Error> {
        let r = self.card_command(ACMD13, 0)?;
        expect_ready(ACMD13, r)?;
        // Second byte of the R2 response
        self.read_byte()?;
        let mut status = SdStatus::default();
        self.read_data(&mut status.data)?;
        Ok(status)
    }

    /// The erase unit, in 512-byte sectors.
    fn erase_block_size(&mut self, card_type: CardType) -> Result<u32, Error> {
        match card_type {
            CardType::SD2 | CardType::SDHC => {
                let status = self.read_sd_status()?;
                Ok(status.erase_block_sectors())
            }
            CardType::SD1 | CardType::MMC => match self.read_csd()? {
                Csd::V1(csd) if card_type == CardType::SD1 => Ok(csd.sd_erase_block_sectors()),
                Csd::V1(csd) => Ok(csd.mmc_erase_block_sectors()),
                Csd::V2(csd) => Ok(u32::from(csd.erase_sector_size()) + 1),
            },
        }
    }

    fn power_off(&mut self) -> Result<(), Error> {
        debug!("Powering off card");
        let _ = self.deselect();
        self.transport.set_power(false)?;
        self.powered = false;
        self.card_type = None;
        self.status.mark_uninitialized();
        Ok(())
    }

    /// Read an arbitrary number of bytes from the card using the SD Card
    /// protocol and an optional CRC. Always fills the given buffer, so make
    /// sure it's the right size.
    fn read_data(&mut self, buffer: &mut [u8]) -> Result<(), Error> {
        // Get first non-FF byte.
        let mut delay = Delay::new(self.options.read_token_attempts, BUSY_POLL_INTERVAL_US);
        let status = loop {
            let s = self.read_byte()?;
            if s != 0xFF {
                break s;
            }
            delay.delay(&mut self.delayer, Error::TimeoutReadBuffer)?;
        };
        if status != DATA_START_BLOCK {
            return Err(Error::ReadError(status));
        }

        self.transport.receive_bytes(buffer)?;

        // These two bytes are always sent. They are either a valid CRC, or
        // junk, depending on whether CRC mode was enabled.
        let mut crc_bytes = [0xFF; 2];
        self.transport.receive_bytes(&mut crc_bytes)?;
        if self.options.use_crc {
            let crc = u16::from_be_bytes(crc_bytes);
            let calc_crc = crc16(buffer);
            if crc != calc_crc {
                return Err(Error::CrcError(crc, calc_crc));
            }
        }

        Ok(())
    }

    /// Write a data packet to the card using the SD protocol and an
    /// optional CRC.
    ///
    /// A [`DataToken::StopTran`] packet is just the token.
    fn write_data(&mut self, token: DataToken, buffer: &[u8]) -> Result<(), Error> {
        self.wait_not_busy()?;
        self.write_byte(token.value())?;
        if !token.has_payload() {
            return Ok(());
        }
        self.transport.send_bytes(buffer)?;
        let crc_bytes = if self.options.use_crc {
            crc16(buffer).to_be_bytes()
        } else {
            [0xFF, 0xFF]
        };
        self.transport.send_bytes(&crc_bytes)?;

        let status = self.read_byte()?;
        if (status & DATA_RES_MASK) != DATA_RES_ACCEPTED {
            Err(Error::WriteError(status))
        } else {
            Ok(())
        }
    }

    /// Perform a function that talks to the card, then release the bus.
    ///
    /// Always releases the bus, even if the function errors.
    fn with_release<F, R>(&mut self, func: F) -> Result<R, Error>
    where
        F: FnOnce(&mut Self) -> Result<R, Error>,
    {
        let result = func(self);
        let release = self.deselect();
        let value = result?;
        release?;
        Ok(value)
    }

    /// Assert CS and wait for the card to be ready.
    fn select(&mut self) -> Result<(), Error> {
        self.transport.select()?;
        // Dummy clock (force DO enabled)
        self.read_byte()?;
        if let Err(e) = self.wait_not_busy() {
            let _ = self.deselect();
            return Err(e);
        }
        Ok(())
    }

    /// De-assert CS and release the bus.
    fn deselect(&mut self) -> Result<(), Error> {
        self.transport.deselect()?;
        // Dummy clock (force DO hi-z for multiple slave SPI)
        self.read_byte()?;
        Ok(())
    }

    /// Perform a command, sending CMD55 first if it is an
    /// application-specific command.
    ///
    /// Returns the R1 response, or [`R1_NO_RESPONSE`] if the card stayed
    /// silent.
    fn card_command(&mut self, command: u8, arg: u32) -> Result<u8, Error> {
        if (command & ACMD_FLAG) != 0 {
            let r = self.send_command(CMD55, 0)?;
            if r > R1_IDLE_STATE {
                return Ok(r);
            }
        }
        self.send_command(command & !ACMD_FLAG, arg)
    }

    /// Select the card and send a single command frame.
    fn send_command(&mut self, command: u8, arg: u32) -> Result<u8, Error> {
        // The card is still streaming data when we stop a read, so we can't
        // wait for it to go quiet.
        if command != CMD12 {
            self.deselect()?;
            self.select()?;
        }

        let mut buf = [
            0x40 | command,
            (arg >> 24) as u8,
            (arg >> 16) as u8,
            (arg >> 8) as u8,
            arg as u8,
            0,
        ];
        buf[5] = if self.options.use_crc {
            crc7(&buf[0..5])
        } else {
            match command {
                CMD0 => CMD0_CRC,
                CMD8 => CMD8_CRC,
                _ => DUMMY_CRC,
            }
        };

        self.transport.send_bytes(&buf)?;

        // skip stuff byte for stop read
        if command == CMD12 {
            let _result = self.read_byte()?;
        }

        for _ in 0..COMMAND_RESPONSE_ATTEMPTS {
            let result = self.read_byte()?;
            if (result & 0x80) == 0 {
                return Ok(result);
            }
        }
        trace!("No response to CMD{}", command);
        Ok(R1_NO_RESPONSE)
    }

    /// Receive a byte from the card by clocking out an 0xFF byte.
    fn read_byte(&mut self) -> Result<u8, Error> {
        Ok(self.transport.exchange_byte(0xFF)?)
    }

    /// Send a byte to the card and ignore what comes back.
    fn write_byte(&mut self, out: u8) -> Result<(), Error> {
        self.transport.exchange_byte(out)?;
        Ok(())
    }

    /// Spin until the card returns 0xFF, or we spin too many times and
    /// timeout.
    fn wait_not_busy(&mut self) -> Result<(), Error> {
        let mut delay = Delay::new(self.options.busy_attempts, BUSY_POLL_INTERVAL_US);
        while self.read_byte()? != 0xFF {
            delay.delay(&mut self.delayer, Error::TimeoutWaitNotBusy)?;
        }
        Ok(())
    }
}

/// Turn an R1 response into an error unless it says "ready".
fn expect_ready(command: u8, response: u8) -> Result<(), Error> {
    match response {
        R1_READY_STATE => Ok(()),
        R1_NO_RESPONSE => Err(Error::TimeoutCommand(command)),
        _ => Err(unexpected(command, response)),
    }
}

fn unexpected(command: u8, response: u8) -> Error {
    Error::ProtocolError { command, response }
}

/// Options for acquiring the card, and for how long we wait for it.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone)]
pub struct AcquireOpts {
    /// Protect commands and data with CRCs, and check the CRCs the card
    /// sends back.
    ///
    /// Some cards don't support CRC mode. At least a 512MiB Transcend one.
    pub use_crc: bool,
    /// How many times to poll the operating condition, 1 ms apart, before
    /// giving up on initialisation.
    pub init_attempts: u32,
    /// How many times to poll a busy card, 100 us apart, before giving up.
    pub busy_attempts: u32,
    /// How many times to poll for the start of a data block, 100 us apart,
    /// before giving up.
    pub read_token_attempts: u32,
}

impl Default for AcquireOpts {
    fn default() -> Self {
        AcquireOpts {
            use_crc: false,
            init_attempts: 1000,
            busy_attempts: 50,
            read_token_attempts: 2000,
        }
    }
}

/// The possible errors this crate can generate.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    /// We got an error from the transport
    Transport(TransportError),
    /// A bad block count, drive number or request
    ParameterError,
    /// The card is not initialised, or not there
    NotReady,
    /// The card is write protected
    WriteProtected,
    /// The card was removed (or ejected) during the operation
    MediaRemoved,
    /// We didn't get a response when waiting for the card to not be busy
    TimeoutWaitNotBusy,
    /// We didn't get a response when reading data from the card
    TimeoutReadBuffer,
    /// We didn't get a response when executing this command
    TimeoutCommand(u8),
    /// The card gave an unexpected response to a command
    ProtocolError {
        /// The command we sent
        command: u8,
        /// The response we got
        response: u8,
    },
    /// A data block started with this token instead of the start token
    ReadError(u8),
    /// The card did not accept a data block; this is its data response
    WriteError(u8),
    /// We got a CRC mismatch (card gave us, we calculated)
    CrcError(u16, u16),
}

impl Error {
    /// Did we give up waiting for the card?
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::TimeoutWaitNotBusy | Error::TimeoutReadBuffer | Error::TimeoutCommand(_)
        )
    }
}

impl From<TransportError> for Error {
    fn from(value: TransportError) -> Error {
        Error::Transport(value)
    }
}

/// The different types of card we support.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CardType {
    /// An MMC card supporting v3 of the standard.
    ///
    /// Uses byte-addressing internally.
    MMC,
    /// An standard-capacity SD Card supporting v1.x of the standard.
    ///
    /// Uses byte-addressing internally, so limited to 2GiB in size.
    SD1,
    /// An standard-capacity SD Card supporting v2.x of the standard.
    ///
    /// Uses byte-addressing internally, so limited to 2GiB in size.
    SD2,
    /// An high-capacity 'SDHC' Card.
    ///
    /// Uses block-addressing internally to support capacities above 2GiB.
    SDHC,
}

impl CardType {
    /// Type flag for an MMC v3 card
    pub const FLAG_MMC: u8 = 0x01;
    /// Type flag for an SD v1 card
    pub const FLAG_SD1: u8 = 0x02;
    /// Type flag for an SD v2 card
    pub const FLAG_SD2: u8 = 0x04;
    /// Type flag for a block addressed card
    pub const FLAG_BLOCK: u8 = 0x08;

    /// Does the card take sector numbers rather than byte offsets?
    pub fn is_block_addressed(self) -> bool {
        matches!(self, CardType::SDHC)
    }

    /// Is this an SD card (as opposed to MMC)?
    pub fn is_sd(self) -> bool {
        !matches!(self, CardType::MMC)
    }

    /// Convert a block index into the address argument for a read or write
    /// command.
    pub fn address(self, block_idx: BlockIdx) -> Result<u32, Error> {
        match self {
            CardType::SDHC => Ok(block_idx.0),
            CardType::MMC | CardType::SD1 | CardType::SD2 => {
                block_idx.into_bytes().ok_or(Error::ParameterError)
            }
        }
    }

    /// The card type as a set of `FLAG_*` bits.
    pub fn flags(self) -> u8 {
        match self {
            CardType::MMC => Self::FLAG_MMC,
            CardType::SD1 => Self::FLAG_SD1,
            CardType::SD2 => Self::FLAG_SD2,
            CardType::SDHC => Self::FLAG_SD2 | Self::FLAG_BLOCK,
        }
    }
}

/// Bounded busy-waiting for the card to sort itself out.
struct Delay {
    attempts_left: u32,
    interval_us: u32,
}

impl Delay {
    /// Allow `attempts` polls in total, `interval_us` apart.
    fn new(attempts: u32, interval_us: u32) -> Delay {
        Delay {
            attempts_left: attempts,
            interval_us,
        }
    }

    /// Call after a failed poll. Waits before the next poll, or returns
    /// `err` if that was the last one.
    fn delay<T>(&mut self, delayer: &mut T, err: Error) -> Result<(), Error>
    where
        T: DelayNs,
    {
        self.attempts_left = self.attempts_left.saturating_sub(1);
        if self.attempts_left == 0 {
            Err(err)
        } else {
            delayer.delay_us(self.interval_us);
            Ok(())
        }
    }
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
