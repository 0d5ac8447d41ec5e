//! Device-visible (DMA-coherent) memory.
//!
//! Ring memory, indirect tables and per-request shared pages are all handed to
//! the device by physical address. The driver touches them only through
//! [`DmaBuffer`], so multi-byte fields are always little-endian regardless of
//! host byte order.

use alloc::boxed::Box;
use core::ptr::NonNull;

use crate::Result;

/// A physically contiguous, cache-coherent allocation shared with the device.
pub trait DmaBuffer: Send + Sync {
    /// Bus address of byte 0.
    fn phys_addr(&self) -> u64;

    fn len(&self) -> usize;

    fn read(&self, offset: usize, dst: &mut [u8]);

    fn write(&self, offset: usize, src: &[u8]);

    fn read_u8(&self, offset: usize) -> u8 {
        let mut b = [0u8; 1];
        self.read(offset, &mut b);
        b[0]
    }

    fn write_u8(&self, offset: usize, value: u8) {
        self.write(offset, &[value]);
    }

    fn read_u16(&self, offset: usize) -> u16 {
        let mut b = [0u8; 2];
        self.read(offset, &mut b);
        u16::from_le_bytes(b)
    }

    fn write_u16(&self, offset: usize, value: u16) {
        self.write(offset, &value.to_le_bytes());
    }

    fn read_u32(&self, offset: usize) -> u32 {
        let mut b = [0u8; 4];
        self.read(offset, &mut b);
        u32::from_le_bytes(b)
    }

    fn write_u32(&self, offset: usize, value: u32) {
        self.write(offset, &value.to_le_bytes());
    }

    fn zero(&self) {
        const CHUNK: [u8; 64] = [0u8; 64];
        let len = self.len();
        let mut off = 0;
        while off < len {
            let n = (len - off).min(CHUNK.len());
            self.write(off, &CHUNK[..n]);
            off += n;
        }
    }
}

/// Source of DMA-coherent allocations (`AllocateCommonBuffer` /
/// `StorPortAllocateContiguousMemorySpecifyCache` on the host).
pub trait DmaAllocator: Send + Sync {
    /// Allocates `len` zeroed bytes whose physical address is a multiple of `align`.
    fn alloc_coherent(&self, len: usize, align: usize) -> Result<Box<dyn DmaBuffer>>;
}

/// A host-provided non-cached mapping.
pub struct CoherentBuffer {
    va: NonNull<u8>,
    pa: u64,
    len: usize,
}

// SAFETY: the mapping is exclusively owned by this value; concurrent access is
// serialized by the engine's queue lock and the device only touches it via DMA.
unsafe impl Send for CoherentBuffer {}
unsafe impl Sync for CoherentBuffer {}

impl CoherentBuffer {
    /// # Safety
    ///
    /// `va` must map `len` bytes of non-cached memory whose bus address is `pa`,
    /// valid for the lifetime of the returned value.
    pub unsafe fn new(va: NonNull<u8>, pa: u64, len: usize) -> Self {
        Self { va, pa, len }
    }

    fn check(&self, offset: usize, len: usize) {
        assert!(
            offset.checked_add(len).is_some_and(|end| end <= self.len),
            "DMA access {offset:#x}+{len} outside {:#x}-byte buffer",
            self.len
        );
    }
}

impl DmaBuffer for CoherentBuffer {
    fn phys_addr(&self) -> u64 {
        self.pa
    }

    fn len(&self) -> usize {
        self.len
    }

    fn read(&self, offset: usize, dst: &mut [u8]) {
        self.check(offset, dst.len());
        for (i, b) in dst.iter_mut().enumerate() {
            // SAFETY: bounds checked above.
            *b = unsafe { self.va.as_ptr().add(offset + i).read_volatile() };
        }
    }

    fn write(&self, offset: usize, src: &[u8]) {
        self.check(offset, src.len());
        for (i, b) in src.iter().enumerate() {
            // SAFETY: bounds checked above.
            unsafe { self.va.as_ptr().add(offset + i).write_volatile(*b) };
        }
    }

    // Ring indices are read while the device may be writing them; use single
    // aligned accesses so they can never tear.
    fn read_u16(&self, offset: usize) -> u16 {
        self.check(offset, 2);
        debug_assert_eq!(offset % 2, 0);
        // SAFETY: bounds checked above; ring fields are naturally aligned.
        u16::from_le(unsafe { self.va.as_ptr().add(offset).cast::<u16>().read_volatile() })
    }

    fn write_u16(&self, offset: usize, value: u16) {
        self.check(offset, 2);
        debug_assert_eq!(offset % 2, 0);
        // SAFETY: bounds checked above; ring fields are naturally aligned.
        unsafe { self.va.as_ptr().add(offset).cast::<u16>().write_volatile(value.to_le()) }
    }
}
