//! # sdmmc-spi-disk
//!
//! > An SD/MMC card block driver written in Embedded Rust
//!
//! This crate drives an SD or MMC card over an SPI bus and presents it as a
//! device made of 512-byte sectors, ready to be glued underneath a FAT
//! filesystem library. It is `#![no_std]` and does not use `alloc`. It
//! handles MMC v3, SD v1, SD v2 (byte addressed) and SDHC/SDXC (block
//! addressed) cards.
//!
//! ## Using the crate
//!
//! You will need something that implements [`Transport`] - a byte exchange
//! plus chip-select and card-detect lines. [`SpiTransport`] builds one from
//! an [`embedded_hal::spi::SpiBus`] and a couple of GPIO pins. Card presence
//! and initialisation state live in a [`DriveStatus`], which you will
//! usually put in a `static` so your card-detect interrupt can reach it.
//!
//! ```rust
//! use sdmmc_spi_disk::{BlockIdx, DriveStatus, Error, SdCard, Transport};
//!
//! static STATUS: DriveStatus = DriveStatus::new();
//!
//! fn example<T, D>(transport: T, delay: D) -> Result<(), Error>
//! where
//!     T: Transport,
//!     D: embedded_hal::delay::DelayNs,
//! {
//!     let sdcard = SdCard::new(transport, delay, &STATUS);
//!     let status = sdcard.initialize();
//!     println!("Card status {:?}, type {:?}", status, sdcard.card_type());
//!     println!("Card size is {} sectors", sdcard.num_blocks()?.0);
//!     let mut blocks = [[0u8; 512]; 2];
//!     sdcard.read(&mut blocks, BlockIdx(0))?;
//!     Ok(())
//! }
//!
//! // From your card-detect interrupt handler:
//! fn on_card_detect_edge(inserted: bool) {
//!     STATUS.on_presence_changed(inserted);
//! }
//! ```
//!
//! If you are porting code written against a FatFs-style `disk_*` API, the
//! [`DiskIo`] trait gives you `disk_status`, `disk_initialize`, `disk_read`,
//! `disk_write` and `disk_ioctl` with a physical drive number.
//!
//! ## Features
//!
//! * `log`: Enabled by default. Generates log messages using the `log` crate.
//! * `defmt-log`: By turning off the default features and enabling the
//!   `defmt-log` feature you can configure this crate to log messages over defmt
//!   instead.
//! * `embassy-sync-06`: Enabled by default. Provides
//!   `EmbassyMutexTransport`, for sharing an SPI bus through an
//!   `embassy-sync` blocking mutex.
//!
//! You cannot enable both the `log` feature and the `defmt-log` feature.

#![cfg_attr(not(test), no_std)]
#![deny(missing_docs)]

#[cfg(test)]
#[macro_use]
extern crate hex_literal;

#[macro_use]
mod structure;

pub mod blockdevice;
pub mod diskio;
pub mod sdcard;
pub mod status;

#[doc(inline)]
pub use blockdevice::{Block, BlockCount, BlockIdx, BLOCK_LEN};

#[doc(inline)]
pub use diskio::{DiskIo, Ioctl, IoctlResponse, DRIVE_SD};

#[doc(inline)]
pub use sdcard::transport::{
    NoCardDetect, RefCellTransport, SpiTransport, Transport, TransportError,
};

#[cfg(feature = "embassy-sync-06")]
#[doc(inline)]
pub use sdcard::transport::EmbassyMutexTransport;

#[doc(inline)]
pub use sdcard::{AcquireOpts, CardType, Error, SdCard};

#[doc(inline)]
pub use status::{DeviceStatus, DriveStatus};

#[cfg(all(feature = "defmt-log", feature = "log"))]
compile_error!("Cannot enable both log and defmt-log");

#[cfg(feature = "log")]
use log::{debug, trace, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, trace, warn};

#[cfg(all(not(feature = "defmt-log"), not(feature = "log")))]
#[macro_export]
/// Like log::debug! but does nothing at all
macro_rules! debug {
    ($($arg:tt)+) => {};
}

#[cfg(all(not(feature = "defmt-log"), not(feature = "log")))]
#[macro_export]
/// Like log::trace! but does nothing at all
macro_rules! trace {
    ($($arg:tt)+) => {};
}

#[cfg(all(not(feature = "defmt-log"), not(feature = "log")))]
#[macro_export]
/// Like log::warn! but does nothing at all
macro_rules! warn {
    ($($arg:tt)+) => {};
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
