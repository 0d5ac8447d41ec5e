//! Register access and platform primitives.
//!
//! All device registers live in BAR0. The transport only ever talks to BAR0
//! through [`RegisterWindow`], which keeps the register protocol testable
//! against a simulated device.

use core::ptr::NonNull;
use core::sync::atomic::{fence, Ordering};

/// A mapped, little-endian register window.
///
/// Offsets are relative to the start of the window. Implementations must
/// perform each access as a single bus transaction of the given width.
pub trait RegisterWindow: Send + Sync {
    /// Size of the mapping in bytes.
    fn len(&self) -> u64;

    fn read_u8(&self, offset: u32) -> u8;
    fn read_u16(&self, offset: u32) -> u16;
    fn read_u32(&self, offset: u32) -> u32;

    fn write_u8(&self, offset: u32, value: u8);
    fn write_u16(&self, offset: u32, value: u16);
    fn write_u32(&self, offset: u32, value: u32);
}

/// Busy-wait delay provided by the host (`KeStallExecutionProcessor` and friends).
pub trait Stall: Send + Sync {
    fn stall_us(&self, micros: u32);
}

/// Full hardware memory barrier.
#[inline]
pub fn mb() {
    fence(Ordering::SeqCst);
}

/// Orders prior stores before subsequent stores.
#[inline]
pub fn wmb() {
    fence(Ordering::Release);
}

/// Orders prior loads before subsequent loads.
#[inline]
pub fn rmb() {
    fence(Ordering::Acquire);
}

/// Uncached MMIO mapping of a memory BAR.
pub struct MmioWindow {
    base: NonNull<u8>,
    len: u64,
}

// SAFETY: the mapping is device memory owned for the lifetime of the window and
// every access is a single volatile load or store.
unsafe impl Send for MmioWindow {}
unsafe impl Sync for MmioWindow {}

impl MmioWindow {
    /// # Safety
    ///
    /// `base` must point to an uncached mapping of at least `len` bytes that stays
    /// valid for the lifetime of the returned value.
    pub unsafe fn new(base: NonNull<u8>, len: u64) -> Self {
        Self { base, len }
    }

    fn ptr<T>(&self, offset: u32) -> *mut T {
        let width = core::mem::size_of::<T>() as u64;
        assert!(
            u64::from(offset) + width <= self.len,
            "MMIO access at {offset:#x} outside {:#x}-byte window",
            self.len
        );
        // SAFETY: bounds checked above.
        unsafe { self.base.as_ptr().add(offset as usize).cast::<T>() }
    }
}

impl RegisterWindow for MmioWindow {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_u8(&self, offset: u32) -> u8 {
        // SAFETY: `ptr` bounds-checks against the mapping.
        unsafe { self.ptr::<u8>(offset).read_volatile() }
    }

    fn read_u16(&self, offset: u32) -> u16 {
        // SAFETY: `ptr` bounds-checks against the mapping.
        u16::from_le(unsafe { self.ptr::<u16>(offset).read_volatile() })
    }

    fn read_u32(&self, offset: u32) -> u32 {
        // SAFETY: `ptr` bounds-checks against the mapping.
        u32::from_le(unsafe { self.ptr::<u32>(offset).read_volatile() })
    }

    fn write_u8(&self, offset: u32, value: u8) {
        // SAFETY: `ptr` bounds-checks against the mapping.
        unsafe { self.ptr::<u8>(offset).write_volatile(value) }
    }

    fn write_u16(&self, offset: u32, value: u16) {
        // SAFETY: `ptr` bounds-checks against the mapping.
        unsafe { self.ptr::<u16>(offset).write_volatile(value.to_le()) }
    }

    fn write_u32(&self, offset: u32, value: u32) {
        // SAFETY: `ptr` bounds-checks against the mapping.
        unsafe { self.ptr::<u32>(offset).write_volatile(value.to_le()) }
    }
}
