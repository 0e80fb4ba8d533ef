use core::mem::MaybeUninit;
use core::ops::{BitAnd, BitOr, Not};
use core::ptr;

use super::Io;

/// A memory-mapped word, accessed with volatile loads and stores.
///
/// Both device registers and DMA-visible descriptor fields use this type, since in both cases the
/// other side may change the value behind the compiler's back.
#[repr(transparent)]
pub struct Mmio<T> {
    value: MaybeUninit<T>,
}

impl<T> Mmio<T> {
    pub const fn new(value: T) -> Self {
        Self {
            value: MaybeUninit::new(value),
        }
    }
}

impl<T: Copy + Default> Default for Mmio<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> Io for Mmio<T>
where
    T: Copy + PartialEq + BitAnd<Output = T> + BitOr<Output = T> + Not<Output = T>,
{
    type Value = T;

    #[inline(always)]
    fn read(&self) -> T {
        unsafe { ptr::read_volatile(self.value.as_ptr()) }
    }

    #[inline(always)]
    fn write(&mut self, value: T) {
        unsafe { ptr::write_volatile(self.value.as_mut_ptr(), value) }
    }
}

impl<T> core::fmt::Debug for Mmio<T>
where
    T: Copy + PartialEq + BitAnd<Output = T> + BitOr<Output = T> + Not<Output = T> + core::fmt::Debug,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("Mmio").field(&self.read()).finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn modify_keeps_bits_outside_the_mask() {
        let mut reg = Mmio::new(0xABCD_1234u32);
        reg.modify(0x0000_0FFF, 0xFFFF_F567);
        assert_eq!(reg.read(), 0xABCD_1567);
        reg.modify(0xFFFF_F000, 0);
        assert_eq!(reg.read(), 0x0000_0567);
    }
}
