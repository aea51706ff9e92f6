//! Per-page reclamation metadata.

use bitflags::bitflags;

bitflags! {
    /// Auxiliary flags stored for the first page of every allocated run.
    ///
    /// The low bits hold the run's age in reclamation scans, the high bits
    /// are markers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct PageFlags: u8 {
        /// Never reclaimed (heap backing store, stacks handed to hardware).
        const FIXED         = 0x80;
        /// Aged out; freed by the next reclamation scan.
        const NEEDS_COLLECT = 0x40;
        /// Age counter bits.
        const AGE           = 0x3F;
    }
}

impl PageFlags {
    /// Returns the age counter.
    pub fn age(self) -> u8 {
        (self & Self::AGE).bits()
    }

    /// Returns the flags with the age counter replaced by `age`.
    ///
    /// An age that overflows the counter sets [`PageFlags::NEEDS_COLLECT`].
    pub fn with_age(self, age: u8) -> Self {
        let markers = self - Self::AGE;
        if age > Self::AGE.bits() {
            markers | Self::NEEDS_COLLECT
        } else {
            markers | Self::from_bits_truncate(age)
        }
    }
}
