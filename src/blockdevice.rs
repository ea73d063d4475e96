//! Types for working with sectors on a block device.
//!
//! Generic code for identifying a particular sector on the card by its
//! index, and for counting sectors.

/// A standard 512 byte block (also known as a sector).
///
/// Almost all SD/MMC cards have 512 byte blocks, and this driver always
/// programs the card to use them.
pub type Block = [u8; BLOCK_LEN];

/// All our blocks are a fixed length of 512 bytes.
pub const BLOCK_LEN: usize = 512;

/// Sometimes we want `LEN` as a `u32` and the casts don't look nice.
pub const BLOCK_LEN_U32: u32 = 512;

/// Sometimes we want `LEN` as a `u64` and the casts don't look nice.
pub const BLOCK_LEN_U64: u64 = 512;

/// The linear numeric address of a block (or sector).
///
/// The first block on a disk gets `BlockIdx(0)` (which usually contains the
/// Master Boot Record).
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockIdx(pub u32);

impl BlockIdx {
    /// Convert a block index into a byte offset from the start of the
    /// volume.
    ///
    /// Returns `None` if the offset does not fit in the 32-bit argument of a
    /// card command. Byte addressed cards hold at most 2 GiB, so any sector
    /// that actually exists on such a card will always fit.
    pub fn into_bytes(self) -> Option<u32> {
        self.0.checked_mul(BLOCK_LEN_U32)
    }
}

/// A number of blocks (or sectors).
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockCount(pub u32);


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
