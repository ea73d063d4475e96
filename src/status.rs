//! Drive status tracking.
//!
//! The status word is shared between the driver and the card-detect
//! interrupt, so it is a single atomic byte. The interrupt side only ever
//! stores into it; the driver reads it at the start of every operation and
//! between the blocks of a multi-block transfer.

use core::sync::atomic::{AtomicU8, Ordering};

bitflags::bitflags! {
    /// The coarse status of the drive, as reported to the filesystem.
    ///
    /// `NO_MEDIA` always comes with `UNINITIALIZED`.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct DeviceStatus: u8 {
        /// The card has not been (successfully) initialised since it was
        /// inserted or powered up.
        const UNINITIALIZED = 0x01;
        /// There is no card in the socket.
        const NO_MEDIA = 0x02;
        /// The card is write protected.
        const WRITE_PROTECTED = 0x04;
    }
}

#[cfg(feature = "defmt-log")]
impl defmt::Format for DeviceStatus {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "DeviceStatus({=u8:#x})", self.bits())
    }
}

impl DeviceStatus {
    /// Can we talk to the card?
    pub fn is_ready(self) -> bool {
        !self.contains(DeviceStatus::UNINITIALIZED)
    }
}

/// Set whenever the card is inserted, removed or ejected. An
/// initialisation that started before the change must not mark the drive
/// ready.
const CHANGED: u8 = 0x40;

/// Set by [`DriveStatus::eject`], cleared by a physical removal.
const EJECTED: u8 = 0x80;

const UNINIT: u8 = DeviceStatus::UNINITIALIZED.bits();
const NO_MEDIA: u8 = DeviceStatus::NO_MEDIA.bits();
const PROTECT: u8 = DeviceStatus::WRITE_PROTECTED.bits();

/// The status word for one drive.
///
/// Create one as a `static` and hand a reference to the
/// [`SdCard`](crate::SdCard) driver. Your card-detect interrupt handler can
/// then call [`DriveStatus::on_presence_changed`] on the same `static`.
///
/// ```rust
/// use sdmmc_spi_disk::{DeviceStatus, DriveStatus};
///
/// static STATUS: DriveStatus = DriveStatus::new();
///
/// STATUS.on_presence_changed(false);
/// assert!(STATUS.get().contains(DeviceStatus::NO_MEDIA));
/// ```
#[derive(Debug)]
pub struct DriveStatus {
    word: AtomicU8,
}

impl DriveStatus {
    /// A fresh status word. The drive is uninitialised and we do not yet
    /// know whether there is a card in it.
    pub const fn new() -> DriveStatus {
        DriveStatus {
            word: AtomicU8::new(UNINIT),
        }
    }

    /// Get the current status.
    pub fn get(&self) -> DeviceStatus {
        DeviceStatus::from_bits_truncate(self.word.load(Ordering::Acquire))
    }

    /// Report that the card-detect line changed.
    ///
    /// Safe to call from interrupt context: it only touches the atomic
    /// status word. Either way the drive drops back to uninitialised; on
    /// removal it is also marked as having no media and any earlier
    /// [`eject`](Self::eject) is forgotten.
    pub fn on_presence_changed(&self, inserted: bool) {
        if inserted {
            // An ejected card stays ejected until it is physically removed.
            let _ = self
                .word
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| {
                    if (w & EJECTED) != 0 {
                        Some(w | CHANGED)
                    } else {
                        Some(UNINIT | CHANGED)
                    }
                });
        } else {
            self.word
                .store(UNINIT | NO_MEDIA | CHANGED, Ordering::Release);
        }
    }

    /// Mark the card as ejected.
    ///
    /// The drive reports no media until the card is physically removed and
    /// re-inserted.
    pub fn eject(&self) {
        self.word
            .store(UNINIT | NO_MEDIA | CHANGED | EJECTED, Ordering::Release);
    }

    /// Has the card been ejected (and not yet physically removed)?
    pub fn is_ejected(&self) -> bool {
        (self.word.load(Ordering::Acquire) & EJECTED) != 0
    }

    /// Set or clear the write protect flag.
    pub fn set_write_protected(&self, protected: bool) {
        if protected {
            self.word.fetch_or(PROTECT, Ordering::AcqRel);
        } else {
            self.word.fetch_and(!PROTECT, Ordering::AcqRel);
        }
    }

    /// Force the drive back to uninitialised, e.g. because we cut the power.
    pub(crate) fn mark_uninitialized(&self) {
        self.word.fetch_or(UNINIT, Ordering::AcqRel);
    }

    /// Called before the initialisation sequence starts.
    pub(crate) fn begin_initialization(&self) -> DeviceStatus {
        DeviceStatus::from_bits_truncate(self.word.fetch_and(!CHANGED, Ordering::AcqRel))
    }

    /// Called once the initialisation sequence has succeeded.
    ///
    /// Leaves the drive uninitialised if the card was inserted, removed or
    /// ejected while we were busy.
    pub(crate) fn finish_initialization(&self, write_protected: bool) -> DeviceStatus {
        let _ = self
            .word
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| {
                if (w & (CHANGED | NO_MEDIA)) != 0 {
                    None
                } else if write_protected {
                    Some((w & !UNINIT) | PROTECT)
                } else {
                    Some(w & !(UNINIT | PROTECT))
                }
            });
        self.get()
    }
}

impl Default for DriveStatus {
    fn default() -> Self {
        DriveStatus::new()
    }
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
