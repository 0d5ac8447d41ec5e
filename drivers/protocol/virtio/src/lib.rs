//! Wire-level definitions shared by the virtio-pci modern block driver.
//!
//! Everything in here is plain data: `#[repr(C)]` layouts for the split ring,
//! the PCI vendor capabilities and the block device, plus the register offsets
//! and bit values the driver programs. No I/O happens in this crate.
#![no_std]
#![forbid(unsafe_code)]

use core::mem::offset_of;

// ---------------------------------------------------------------------------
// PCI identity
// ---------------------------------------------------------------------------

pub const VIRTIO_PCI_VENDOR_ID: u16 = 0x1AF4;
/// Modern-only device ids start here (`0x1040 + virtio device type`).
pub const VIRTIO_PCI_DEVICE_ID_MODERN_BASE: u16 = 0x1040;
pub const VIRTIO_DEVICE_TYPE_BLK: u16 = 2;
pub const VIRTIO_PCI_DEVICE_ID_BLK_MODERN: u16 = VIRTIO_PCI_DEVICE_ID_MODERN_BASE + VIRTIO_DEVICE_TYPE_BLK;
/// PCI revision id mandated by the device contract.
pub const VIRTIO_PCI_CONTRACT_REVISION: u8 = 0x01;

pub const PCI_CFG_VENDOR_ID: usize = 0x00;
pub const PCI_CFG_DEVICE_ID: usize = 0x02;
pub const PCI_CFG_STATUS: usize = 0x06;
pub const PCI_CFG_REVISION_ID: usize = 0x08;
pub const PCI_CFG_BAR0: usize = 0x10;
pub const PCI_CFG_SUBSYSTEM_VENDOR_ID: usize = 0x2C;
pub const PCI_CFG_SUBSYSTEM_ID: usize = 0x2E;
pub const PCI_CFG_CAP_PTR: usize = 0x34;
pub const PCI_CFG_INTERRUPT_PIN: usize = 0x3D;

pub const PCI_STATUS_CAP_LIST: u16 = 1 << 4;
pub const PCI_CAP_ID_VENDOR: u8 = 0x09;
/// First byte after the standard type-0 header; capabilities never start below it.
pub const PCI_CAP_MIN_OFFSET: u8 = 0x40;

pub const PCI_BAR_IO_SPACE: u32 = 1 << 0;
pub const PCI_BAR_MEM_TYPE_MASK: u32 = 0b110;
pub const PCI_BAR_MEM_TYPE_64: u32 = 0b100;

// ---------------------------------------------------------------------------
// Vendor capabilities
// ---------------------------------------------------------------------------

/// PCI capability header for virtio-pci (`struct virtio_pci_cap`).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct VirtioPciCap {
  pub cap_vndr: u8,
  pub cap_next: u8,
  pub cap_len: u8,
  pub cfg_type: u8,
  pub bar: u8,
  pub id: u8,
  pub padding: [u8; 2],
  pub offset: u32,
  pub length: u32,
}

/// Notification capability (`struct virtio_pci_notify_cap`).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct VirtioPciNotifyCap {
  pub cap: VirtioPciCap,
  pub notify_off_multiplier: u32,
}

pub const VIRTIO_PCI_CAP_COMMON_CFG: u8 = 1;
pub const VIRTIO_PCI_CAP_NOTIFY_CFG: u8 = 2;
pub const VIRTIO_PCI_CAP_ISR_CFG: u8 = 3;
pub const VIRTIO_PCI_CAP_DEVICE_CFG: u8 = 4;
pub const VIRTIO_PCI_CAP_PCI_CFG: u8 = 5;

pub const VIRTIO_PCI_CAP_LEN: u8 = core::mem::size_of::<VirtioPciCap>() as u8;
pub const VIRTIO_PCI_NOTIFY_CAP_LEN: u8 = core::mem::size_of::<VirtioPciNotifyCap>() as u8;

pub const VIRTIO_PCI_CAP_CFG_TYPE_OFFSET: usize = offset_of!(VirtioPciCap, cfg_type);
pub const VIRTIO_PCI_CAP_BAR_OFFSET: usize = offset_of!(VirtioPciCap, bar);
pub const VIRTIO_PCI_CAP_OFFSET_OFFSET: usize = offset_of!(VirtioPciCap, offset);
pub const VIRTIO_PCI_CAP_LENGTH_OFFSET: usize = offset_of!(VirtioPciCap, length);
pub const VIRTIO_PCI_NOTIFY_CAP_MULTIPLIER_OFFSET: usize = offset_of!(VirtioPciNotifyCap, notify_off_multiplier);

// ---------------------------------------------------------------------------
// Fixed BAR0 layout required by the device contract
// ---------------------------------------------------------------------------

pub const CONTRACT_BAR: u8 = 0;
pub const CONTRACT_COMMON_CFG_OFFSET: u32 = 0x0000;
pub const CONTRACT_COMMON_CFG_LEN: u32 = 0x0100;
pub const CONTRACT_NOTIFY_CFG_OFFSET: u32 = 0x1000;
pub const CONTRACT_NOTIFY_CFG_LEN: u32 = 0x0100;
pub const CONTRACT_NOTIFY_OFF_MULTIPLIER: u32 = 4;
pub const CONTRACT_ISR_CFG_OFFSET: u32 = 0x2000;
pub const CONTRACT_ISR_CFG_LEN: u32 = 0x0020;
pub const CONTRACT_DEVICE_CFG_OFFSET: u32 = 0x3000;
pub const CONTRACT_DEVICE_CFG_LEN: u32 = 0x0100;
pub const CONTRACT_BAR0_MIN_LEN: u32 = 0x4000;

// ---------------------------------------------------------------------------
// Common configuration
// ---------------------------------------------------------------------------

/// Common configuration structure (`struct virtio_pci_common_cfg`).
///
/// The driver never maps this struct directly; the register offsets below are
/// derived from it so the two cannot drift apart.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct VirtioPciCommonCfg {
  pub device_feature_select: u32,
  pub device_feature: u32,
  pub driver_feature_select: u32,
  pub driver_feature: u32,
  pub msix_config: u16,
  pub num_queues: u16,
  pub device_status: u8,
  pub config_generation: u8,
  pub queue_select: u16,
  pub queue_size: u16,
  pub queue_msix_vector: u16,
  pub queue_enable: u16,
  pub queue_notify_off: u16,
  pub queue_desc: u64,
  pub queue_avail: u64,
  pub queue_used: u64,
}

pub const COMMON_CFG_DEVICE_FEATURE_SELECT: u32 = offset_of!(VirtioPciCommonCfg, device_feature_select) as u32;
pub const COMMON_CFG_DEVICE_FEATURE: u32 = offset_of!(VirtioPciCommonCfg, device_feature) as u32;
pub const COMMON_CFG_DRIVER_FEATURE_SELECT: u32 = offset_of!(VirtioPciCommonCfg, driver_feature_select) as u32;
pub const COMMON_CFG_DRIVER_FEATURE: u32 = offset_of!(VirtioPciCommonCfg, driver_feature) as u32;
pub const COMMON_CFG_MSIX_CONFIG: u32 = offset_of!(VirtioPciCommonCfg, msix_config) as u32;
pub const COMMON_CFG_NUM_QUEUES: u32 = offset_of!(VirtioPciCommonCfg, num_queues) as u32;
pub const COMMON_CFG_DEVICE_STATUS: u32 = offset_of!(VirtioPciCommonCfg, device_status) as u32;
pub const COMMON_CFG_CONFIG_GENERATION: u32 = offset_of!(VirtioPciCommonCfg, config_generation) as u32;
pub const COMMON_CFG_QUEUE_SELECT: u32 = offset_of!(VirtioPciCommonCfg, queue_select) as u32;
pub const COMMON_CFG_QUEUE_SIZE: u32 = offset_of!(VirtioPciCommonCfg, queue_size) as u32;
pub const COMMON_CFG_QUEUE_MSIX_VECTOR: u32 = offset_of!(VirtioPciCommonCfg, queue_msix_vector) as u32;
pub const COMMON_CFG_QUEUE_ENABLE: u32 = offset_of!(VirtioPciCommonCfg, queue_enable) as u32;
pub const COMMON_CFG_QUEUE_NOTIFY_OFF: u32 = offset_of!(VirtioPciCommonCfg, queue_notify_off) as u32;
pub const COMMON_CFG_QUEUE_DESC: u32 = offset_of!(VirtioPciCommonCfg, queue_desc) as u32;
pub const COMMON_CFG_QUEUE_AVAIL: u32 = offset_of!(VirtioPciCommonCfg, queue_avail) as u32;
pub const COMMON_CFG_QUEUE_USED: u32 = offset_of!(VirtioPciCommonCfg, queue_used) as u32;
pub const COMMON_CFG_LEN: u32 = core::mem::size_of::<VirtioPciCommonCfg>() as u32;

pub const VIRTIO_STATUS_ACKNOWLEDGE: u8 = 1;
pub const VIRTIO_STATUS_DRIVER: u8 = 2;
pub const VIRTIO_STATUS_DRIVER_OK: u8 = 4;
pub const VIRTIO_STATUS_FEATURES_OK: u8 = 8;
pub const VIRTIO_STATUS_DEVICE_NEEDS_RESET: u8 = 64;
pub const VIRTIO_STATUS_FAILED: u8 = 128;

/// MSI-X "no vector" sentinel for `msix_config` / `queue_msix_vector`.
pub const VIRTIO_MSI_NO_VECTOR: u16 = 0xFFFF;

pub const VIRTIO_PCI_ISR_QUEUE: u8 = 0x01;
pub const VIRTIO_PCI_ISR_CONFIG: u8 = 0x02;

// ---------------------------------------------------------------------------
// Feature bits
// ---------------------------------------------------------------------------

pub const VIRTIO_F_RING_INDIRECT_DESC: u64 = 1 << 28;
pub const VIRTIO_F_RING_EVENT_IDX: u64 = 1 << 29;
pub const VIRTIO_F_VERSION_1: u64 = 1 << 32;
pub const VIRTIO_F_RING_PACKED: u64 = 1 << 34;
pub const VIRTIO_F_IN_ORDER: u64 = 1 << 35;

pub const VIRTIO_BLK_F_SIZE_MAX: u64 = 1 << 1;
pub const VIRTIO_BLK_F_SEG_MAX: u64 = 1 << 2;
pub const VIRTIO_BLK_F_GEOMETRY: u64 = 1 << 4;
pub const VIRTIO_BLK_F_RO: u64 = 1 << 5;
pub const VIRTIO_BLK_F_BLK_SIZE: u64 = 1 << 6;
pub const VIRTIO_BLK_F_FLUSH: u64 = 1 << 9;
pub const VIRTIO_BLK_F_DISCARD: u64 = 1 << 13;
pub const VIRTIO_BLK_F_WRITE_ZEROES: u64 = 1 << 14;

// ---------------------------------------------------------------------------
// Split virtqueue
// ---------------------------------------------------------------------------

/// Virtqueue descriptor table entry (`struct virtq_desc`).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct VirtqDesc {
  pub addr: u64,
  pub len: u32,
  pub flags: u16,
  pub next: u16,
}

impl VirtqDesc {
  pub const SIZE: usize = core::mem::size_of::<Self>();

  pub fn to_le_bytes(&self) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[0..8].copy_from_slice(&self.addr.to_le_bytes());
    out[8..12].copy_from_slice(&self.len.to_le_bytes());
    out[12..14].copy_from_slice(&self.flags.to_le_bytes());
    out[14..16].copy_from_slice(&self.next.to_le_bytes());
    out
  }

  pub fn from_le_bytes(bytes: &[u8; 16]) -> Self {
    Self {
      addr: u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
      ]),
      len: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
      flags: u16::from_le_bytes([bytes[12], bytes[13]]),
      next: u16::from_le_bytes([bytes[14], bytes[15]]),
    }
  }
}

pub const VIRTQ_DESC_F_NEXT: u16 = 1;
pub const VIRTQ_DESC_F_WRITE: u16 = 2;
pub const VIRTQ_DESC_F_INDIRECT: u16 = 4;

/// Virtqueue available ring header (does not include the variable-length ring array).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct VirtqAvailHeader {
  pub flags: u16,
  pub idx: u16,
}

pub const VIRTQ_AVAIL_F_NO_INTERRUPT: u16 = 1;

/// Virtqueue used ring header (does not include the variable-length ring array).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct VirtqUsedHeader {
  pub flags: u16,
  pub idx: u16,
}

pub const VIRTQ_USED_F_NO_NOTIFY: u16 = 1;

/// Virtqueue used ring element (`struct virtq_used_elem`).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct VirtqUsedElem {
  pub id: u32,
  pub len: u32,
}

pub const VIRTQ_DESC_ALIGN: u64 = 16;
pub const VIRTQ_AVAIL_ALIGN: u64 = 2;
pub const VIRTQ_USED_ALIGN: u64 = 4;

/// Byte sizes of the three split-ring areas for a queue of `size` entries,
/// including the trailing `used_event` / `avail_event` words.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SplitRingLayout {
  pub desc_offset: usize,
  pub avail_offset: usize,
  pub used_offset: usize,
  pub total_len: usize,
}

impl SplitRingLayout {
  pub const fn new(size: u16) -> Self {
    let q = size as usize;
    let desc_offset = 0;
    let avail_offset = desc_offset + VirtqDesc::SIZE * q;
    let avail_len = 4 + 2 * q + 2;
    let used_unaligned = avail_offset + avail_len;
    let align = VIRTQ_USED_ALIGN as usize;
    let used_offset = (used_unaligned + align - 1) & !(align - 1);
    let used_len = 4 + core::mem::size_of::<VirtqUsedElem>() * q + 2;
    Self {
      desc_offset,
      avail_offset,
      used_offset,
      total_len: used_offset + used_len,
    }
  }

  pub const fn avail_ring_entry(&self, slot: u16) -> usize {
    self.avail_offset + 4 + 2 * slot as usize
  }

  pub const fn used_event(&self, size: u16) -> usize {
    self.avail_offset + 4 + 2 * size as usize
  }

  pub const fn used_ring_entry(&self, slot: u16) -> usize {
    self.used_offset + 4 + core::mem::size_of::<VirtqUsedElem>() * slot as usize
  }

  pub const fn avail_event(&self, size: u16) -> usize {
    self.used_offset + 4 + core::mem::size_of::<VirtqUsedElem>() * size as usize
  }
}

/// `vring_need_event`: should the side that published `new` (previously `old`)
/// signal a peer that asked to be woken at `event`?
pub const fn vring_need_event(event: u16, new: u16, old: u16) -> bool {
  new.wrapping_sub(event).wrapping_sub(1) < new.wrapping_sub(old)
}

// ---------------------------------------------------------------------------
// virtio-blk
// ---------------------------------------------------------------------------

/// Virtio-blk request header (`struct virtio_blk_req` header portion).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct VirtioBlkReqHeader {
  pub req_type: u32,
  pub reserved: u32,
  pub sector: u64,
}

impl VirtioBlkReqHeader {
  pub const SIZE: usize = core::mem::size_of::<Self>();

  pub fn to_le_bytes(&self) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[0..4].copy_from_slice(&self.req_type.to_le_bytes());
    out[4..8].copy_from_slice(&self.reserved.to_le_bytes());
    out[8..16].copy_from_slice(&self.sector.to_le_bytes());
    out
  }
}

pub const VIRTIO_BLK_T_IN: u32 = 0;
pub const VIRTIO_BLK_T_OUT: u32 = 1;
pub const VIRTIO_BLK_T_FLUSH: u32 = 4;
pub const VIRTIO_BLK_T_GET_ID: u32 = 8;

pub const VIRTIO_BLK_S_OK: u8 = 0;
pub const VIRTIO_BLK_S_IOERR: u8 = 1;
pub const VIRTIO_BLK_S_UNSUPP: u8 = 2;

/// Capacity and sector offsets are always expressed in 512-byte units.
pub const VIRTIO_BLK_SECTOR_SIZE: u32 = 512;
/// Length of the serial string returned by `VIRTIO_BLK_T_GET_ID`.
pub const VIRTIO_BLK_ID_BYTES: u32 = 20;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct VirtioBlkGeometry {
  pub cylinders: u16,
  pub heads: u8,
  pub sectors: u8,
}

/// Leading part of `struct virtio_blk_config` that the driver consumes.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct VirtioBlkConfig {
  pub capacity: u64,
  pub size_max: u32,
  pub seg_max: u32,
  pub geometry: VirtioBlkGeometry,
  pub blk_size: u32,
}

impl VirtioBlkConfig {
  pub const SIZE: usize = core::mem::size_of::<Self>();

  pub fn from_le_bytes(bytes: &[u8; Self::SIZE]) -> Self {
    let u32_at = |off: usize| u32::from_le_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]]);
    Self {
      capacity: u64::from(u32_at(0)) | (u64::from(u32_at(4)) << 32),
      size_max: u32_at(8),
      seg_max: u32_at(12),
      geometry: VirtioBlkGeometry {
        cylinders: u16::from_le_bytes([bytes[16], bytes[17]]),
        heads: bytes[18],
        sectors: bytes[19],
      },
      blk_size: u32_at(20),
    }
  }
}

pub const VIRTIO_BLK_CFG_CAPACITY: u32 = offset_of!(VirtioBlkConfig, capacity) as u32;
pub const VIRTIO_BLK_CFG_SIZE_MAX: u32 = offset_of!(VirtioBlkConfig, size_max) as u32;
pub const VIRTIO_BLK_CFG_SEG_MAX: u32 = offset_of!(VirtioBlkConfig, seg_max) as u32;
pub const VIRTIO_BLK_CFG_BLK_SIZE: u32 = offset_of!(VirtioBlkConfig, blk_size) as u32;

#[cfg(test)]
extern crate std;
