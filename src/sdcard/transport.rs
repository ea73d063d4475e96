//! The byte-level transport underneath the SD card protocol.
//!
//! The protocol code needs rather more control over the bus than an
//! [`embedded_hal::spi::SpiDevice`] gives you: it clocks bytes out with
//! chip-select de-asserted during power-up, and it holds chip-select low
//! across a whole command-plus-data exchange. So we define our own
//! [`Transport`] trait, and provide implementations on top of an
//! [`embedded_hal::spi::SpiBus`] and some GPIO pins.

use core::cell::RefCell;

use embedded_hal::{
    digital::{InputPin, OutputPin},
    spi::SpiBus,
};

/// The things the SD card driver needs from the hardware.
pub trait Transport {
    /// Clock one byte out to the card, and return the byte clocked in.
    fn exchange_byte(&mut self, out: u8) -> Result<u8, TransportError>;

    /// Assert the card's chip-select line.
    fn select(&mut self) -> Result<(), TransportError>;

    /// De-assert the card's chip-select line.
    fn deselect(&mut self) -> Result<(), TransportError>;

    /// Is there a card in the socket?
    fn is_present(&mut self) -> bool;

    /// Switch power to the socket on or off.
    ///
    /// Does nothing unless your board can switch the power.
    fn set_power(&mut self, _on: bool) -> Result<(), TransportError> {
        Ok(())
    }

    /// Is the write protect tab on the card engaged?
    ///
    /// Reports `false` unless your socket has a write protect switch.
    fn is_write_protected(&mut self) -> bool {
        false
    }

    /// Fill the buffer with bytes from the card, clocking out `0xFF`.
    fn receive_bytes(&mut self, buffer: &mut [u8]) -> Result<(), TransportError> {
        for b in buffer.iter_mut() {
            *b = self.exchange_byte(0xFF)?;
        }
        Ok(())
    }

    /// Send bytes to the card and ignore what comes back.
    fn send_bytes(&mut self, buffer: &[u8]) -> Result<(), TransportError> {
        for &b in buffer.iter() {
            self.exchange_byte(b)?;
        }
        Ok(())
    }
}

/// Errors that can occur when using a [`Transport`].
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[non_exhaustive]
pub enum TransportError {
    /// An operation on the inner SPI bus failed.
    Spi,
    /// Setting the value of the Chip Select (CS) pin failed.
    Cs,
    /// Switching the socket power failed.
    Power,
}

/// A card-detect "pin" for sockets without a card-detect switch.
///
/// Always reports a card as present.
#[derive(Debug, Default, Copy, Clone)]
pub struct NoCardDetect;

impl embedded_hal::digital::ErrorType for NoCardDetect {
    type Error = core::convert::Infallible;
}

impl InputPin for NoCardDetect {
    fn is_high(&mut self) -> Result<bool, Self::Error> {
        Ok(false)
    }

    fn is_low(&mut self) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// A [`Transport`] with exclusive ownership of an SPI bus.
///
/// The card-detect pin is active-low: the socket pulls it to ground when a
/// card is inserted. Use [`NoCardDetect`] if you don't have one.
pub struct SpiTransport<BUS, CS, DET> {
    bus: BUS,
    cs: CS,
    detect: DET,
}

impl<BUS, CS, DET> SpiTransport<BUS, CS, DET> {
    /// Create a new `SpiTransport`.
    pub fn new(bus: BUS, cs: CS, detect: DET) -> Self {
        Self { bus, cs, detect }
    }

    /// Get a mutable reference to the SPI bus, e.g. to change the clock
    /// rate once the card is initialised.
    pub fn bus_mut(&mut self) -> &mut BUS {
        &mut self.bus
    }

    /// Get the bus and pins back.
    pub fn free(self) -> (BUS, CS, DET) {
        (self.bus, self.cs, self.detect)
    }
}

impl<BUS, CS, DET> Transport for SpiTransport<BUS, CS, DET>
where
    BUS: SpiBus,
    CS: OutputPin,
    DET: InputPin,
{
    fn exchange_byte(&mut self, out: u8) -> Result<u8, TransportError> {
        bus_exchange(&mut self.bus, out)
    }

    fn select(&mut self) -> Result<(), TransportError> {
        self.cs.set_low().map_err(|_| TransportError::Cs)
    }

    fn deselect(&mut self) -> Result<(), TransportError> {
        bus_release(&mut self.bus, &mut self.cs)
    }

    fn is_present(&mut self) -> bool {
        self.detect.is_low().unwrap_or(false)
    }
}

/// A [`Transport`] sharing an SPI bus through a `RefCell`.
///
/// This allows sharing the bus with other devices within the same thread.
pub struct RefCellTransport<'a, BUS, CS, DET> {
    bus: &'a RefCell<BUS>,
    cs: CS,
    detect: DET,
}

impl<'a, BUS, CS, DET> RefCellTransport<'a, BUS, CS, DET> {
    /// Create a new `RefCellTransport`.
    pub fn new(bus: &'a RefCell<BUS>, cs: CS, detect: DET) -> Self {
        Self { bus, cs, detect }
    }
}

impl<BUS, CS, DET> Transport for RefCellTransport<'_, BUS, CS, DET>
where
    BUS: SpiBus,
    CS: OutputPin,
    DET: InputPin,
{
    fn exchange_byte(&mut self, out: u8) -> Result<u8, TransportError> {
        let mut bus = self.bus.borrow_mut();
        bus_exchange(&mut *bus, out)
    }

    fn select(&mut self) -> Result<(), TransportError> {
        self.cs.set_low().map_err(|_| TransportError::Cs)
    }

    fn deselect(&mut self) -> Result<(), TransportError> {
        let mut bus = self.bus.borrow_mut();
        bus_release(&mut *bus, &mut self.cs)
    }

    fn is_present(&mut self) -> bool {
        self.detect.is_low().unwrap_or(false)
    }
}

#[cfg(feature = "embassy-sync-06")]
mod embassy_sync_06 {
    use core::cell::RefCell;

    use ::embassy_sync_06::blocking_mutex;

    use super::*;

    /// A [`Transport`] sharing an SPI bus through an `embassy-sync`
    /// blocking mutex.
    ///
    /// The mutex is taken for each byte, so other devices on the bus must
    /// keep their own chip-selects de-asserted while the card is selected.
    /// See [`blocking_mutex::Mutex`] for more details.
    pub struct EmbassyMutexTransport<'a, BUS, CS, DET, M> {
        bus: &'a blocking_mutex::Mutex<M, RefCell<BUS>>,
        cs: CS,
        detect: DET,
    }

    impl<'a, BUS, CS, DET, M> EmbassyMutexTransport<'a, BUS, CS, DET, M> {
        /// Create a new `EmbassyMutexTransport`.
        pub fn new(bus: &'a blocking_mutex::Mutex<M, RefCell<BUS>>, cs: CS, detect: DET) -> Self {
            Self { bus, cs, detect }
        }
    }

    impl<BUS, CS, DET, M> Transport for EmbassyMutexTransport<'_, BUS, CS, DET, M>
    where
        BUS: SpiBus,
        CS: OutputPin,
        DET: InputPin,
        M: blocking_mutex::raw::RawMutex,
    {
        fn exchange_byte(&mut self, out: u8) -> Result<u8, TransportError> {
            self.bus.lock(|bus| {
                let mut bus = bus.borrow_mut();
                bus_exchange(&mut *bus, out)
            })
        }

        fn select(&mut self) -> Result<(), TransportError> {
            self.cs.set_low().map_err(|_| TransportError::Cs)
        }

        fn deselect(&mut self) -> Result<(), TransportError> {
            let cs = &mut self.cs;
            self.bus.lock(|bus| {
                let mut bus = bus.borrow_mut();
                bus_release(&mut *bus, cs)
            })
        }

        fn is_present(&mut self) -> bool {
            self.detect.is_low().unwrap_or(false)
        }
    }
}

#[cfg(feature = "embassy-sync-06")]
pub use embassy_sync_06::*;

/// Send one byte and receive one byte.
fn bus_exchange<BUS>(bus: &mut BUS, out: u8) -> Result<u8, TransportError>
where
    BUS: SpiBus,
{
    let mut buf = [out];
    bus.transfer_in_place(&mut buf)
        .map_err(|_| TransportError::Spi)?;
    Ok(buf[0])
}

/// Let the bus finish what it is doing, then de-assert CS.
fn bus_release<BUS, CS>(bus: &mut BUS, cs: &mut CS) -> Result<(), TransportError>
where
    BUS: SpiBus,
    CS: OutputPin,
{
    // On failure, it's important to still deassert CS.
    let flush_res = bus.flush();
    let cs_res = cs.set_high();

    flush_res.map_err(|_| TransportError::Spi)?;
    cs_res.map_err(|_| TransportError::Cs)?;
    Ok(())
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
