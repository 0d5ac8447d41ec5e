//! Guest-side virtio-pci "modern" (virtio 1.0+) block driver core.
//!
//! Everything here runs inside a kernel driver with no OS virtio support, so
//! the crate is `no_std` and talks to the host only through small traits
//! (register windows, DMA allocation, stalls, interrupt objects). It provides:
//!
//! - [`parse_virtio_caps`]: locates the common/notify/ISR/device register
//!   windows in PCI config space
//! - [`ModernTransport`]: selector-serialized status, feature, queue, doorbell,
//!   ISR and device-config access
//! - [`SplitVirtqueue`]: the driver half of a split ring
//! - [`InterruptMultiplexer`]: line vs. MSI-X cause demultiplexing and
//!   quiesce/resume
//! - [`BlkRequestQueue`] / [`BlkDevice`]: the virtio-blk request engine and
//!   device lifecycle
//!
//! Wire layouts and constants live in `aero-virtio-protocol`.

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod blk;
pub mod caps;
pub mod dma;
mod error;
pub mod hw;
pub mod interrupts;
pub mod transport;
pub mod virtqueue;

pub use blk::{
    BlkDevice, BlkDiagnostics, BlkOptions, BlkRequestQueue, Completion, CompletionSink, DataSegment, DiskGeometry,
    Rejected, RequestKind, SenseData,
};
pub use caps::{parse_virtio_caps, CapWindow, LayoutMode, PciIdentity, VirtioPciCaps};
pub use dma::{CoherentBuffer, DmaAllocator, DmaBuffer};
pub use error::{CapLayoutError, Result, VirtioError};
pub use hw::{MmioWindow, RegisterWindow, Stall};
pub use interrupts::{
    CauseMask, InterruptCallbacks, InterruptMode, InterruptMultiplexer, InterruptObject, InterruptResources,
    InterruptStats, VectorPlan,
};
pub use transport::{DeviceStatus, ModernTransport, QueueInfo, TransportOptions};
pub use virtqueue::{SgEntry, SplitVirtqueue, UsedEntry};
