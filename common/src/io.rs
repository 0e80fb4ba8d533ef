//! Word-sized access to memory the hardware can also see: registers and descriptor fields.

use core::ops::{BitAnd, BitOr, Not};

mod mmio;

pub use mmio::*;

/// One hardware-visible word.
pub trait Io {
    type Value: Copy + PartialEq + BitAnd<Output = Self::Value> + BitOr<Output = Self::Value> + Not<Output = Self::Value>;

    fn read(&self) -> Self::Value;
    fn write(&mut self, value: Self::Value);

    /// Replace the bits under `mask` with those of `bits`, leaving the rest of the word alone.
    #[inline(always)]
    fn modify(&mut self, mask: Self::Value, bits: Self::Value) {
        let kept = self.read() & !mask;
        self.write(kept | (bits & mask));
    }
}
