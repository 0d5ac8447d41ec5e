#![allow(dead_code)]

//! Simulated virtio-pci modern blk function used by the integration tests.
//!
//! BAR0 follows the fixed contract layout (common 0x0000, notify 0x1000,
//! ISR 0x2000, device config 0x3000). Queue processing is explicit: tests call
//! [`SimDevice::process_queue`] to play the device side, then
//! [`Harness::deliver_interrupts`] to run the top and bottom halves.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use aero_virtio_blk_driver::{
    BlkDevice, BlkOptions, Completion, CompletionSink, DataSegment, DmaAllocator, DmaBuffer, InterruptObject,
    InterruptResources, RegisterWindow, Stall,
};
use aero_virtio_protocol::*;

pub const GUEST_BASE: u64 = 0x10_0000;
pub const BAR0_BASE: u64 = 0xFEBF_0000;
pub const BAR0_LEN: u64 = CONTRACT_BAR0_MIN_LEN as u64;
pub const BARS: [u64; 6] = [BAR0_BASE, 0, 0, 0, 0, 0];

pub const DISK_SECTORS: u64 = 2048;
pub const SERIAL: &[u8; 20] = b"AERO-VBLK-0001\0\0\0\0\0\0";

pub const STANDARD_FEATURES: u64 = VIRTIO_F_VERSION_1
    | VIRTIO_F_RING_INDIRECT_DESC
    | VIRTIO_BLK_F_SEG_MAX
    | VIRTIO_BLK_F_BLK_SIZE
    | VIRTIO_BLK_F_FLUSH;

// ---------------------------------------------------------------------------
// Guest memory
// ---------------------------------------------------------------------------

/// Flat guest-physical memory starting at [`GUEST_BASE`] with a bump allocator.
#[derive(Clone, Default)]
pub struct GuestMemory {
    bytes: Arc<Mutex<Vec<u8>>>,
}

struct GuestBuffer {
    mem: GuestMemory,
    pa: u64,
    len: usize,
}

impl DmaBuffer for GuestBuffer {
    fn phys_addr(&self) -> u64 {
        self.pa
    }

    fn len(&self) -> usize {
        self.len
    }

    fn read(&self, offset: usize, dst: &mut [u8]) {
        assert!(offset + dst.len() <= self.len);
        dst.copy_from_slice(&self.mem.read(self.pa + offset as u64, dst.len()));
    }

    fn write(&self, offset: usize, src: &[u8]) {
        assert!(offset + src.len() <= self.len);
        self.mem.write(self.pa + offset as u64, src);
    }
}

impl DmaAllocator for GuestMemory {
    fn alloc_coherent(&self, len: usize, align: usize) -> aero_virtio_blk_driver::Result<Box<dyn DmaBuffer>> {
        let pa = self.alloc(len, align);
        Ok(Box::new(GuestBuffer {
            mem: self.clone(),
            pa,
            len,
        }))
    }
}

impl GuestMemory {
    /// Reserves zeroed guest memory and returns its physical address.
    pub fn alloc(&self, len: usize, align: usize) -> u64 {
        let mut bytes = self.bytes.lock().unwrap();
        let align = align.max(1);
        let start = (bytes.len() + align - 1) / align * align;
        bytes.resize(start + len, 0);
        GUEST_BASE + start as u64
    }

    pub fn read(&self, pa: u64, len: usize) -> Vec<u8> {
        let bytes = self.bytes.lock().unwrap();
        let start = (pa - GUEST_BASE) as usize;
        bytes[start..start + len].to_vec()
    }

    pub fn write(&self, pa: u64, data: &[u8]) {
        let mut bytes = self.bytes.lock().unwrap();
        let start = (pa - GUEST_BASE) as usize;
        bytes[start..start + data.len()].copy_from_slice(data);
    }

    pub fn read_u16(&self, pa: u64) -> u16 {
        u16::from_le_bytes(self.read(pa, 2).try_into().unwrap())
    }

    pub fn read_u32(&self, pa: u64) -> u32 {
        u32::from_le_bytes(self.read(pa, 4).try_into().unwrap())
    }

    pub fn read_u64(&self, pa: u64) -> u64 {
        u64::from_le_bytes(self.read(pa, 8).try_into().unwrap())
    }

    pub fn write_u16(&self, pa: u64, value: u16) {
        self.write(pa, &value.to_le_bytes());
    }

    pub fn write_u32(&self, pa: u64, value: u32) {
        self.write(pa, &value.to_le_bytes());
    }

    pub fn allocated(&self) -> usize {
        self.bytes.lock().unwrap().len()
    }
}

// ---------------------------------------------------------------------------
// Platform
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct NoStall {
    pub total_us: AtomicU64,
}

impl Stall for NoStall {
    fn stall_us(&self, micros: u32) {
        self.total_us.fetch_add(u64::from(micros), Ordering::Relaxed);
    }
}

/// Interrupt object whose deferred unit is run by hand.
#[derive(Default)]
pub struct FakeInterrupt {
    queued: AtomicBool,
    enabled: AtomicBool,
    pub queue_calls: AtomicU32,
    pub disables: AtomicU32,
    pub enables: AtomicU32,
}

impl InterruptObject for FakeInterrupt {
    fn queue_deferred(&self) -> bool {
        self.queue_calls.fetch_add(1, Ordering::SeqCst);
        !self.queued.swap(true, Ordering::SeqCst)
    }

    fn disable(&self) {
        self.disables.fetch_add(1, Ordering::SeqCst);
        self.enabled.store(false, Ordering::SeqCst);
    }

    fn enable(&self) {
        self.enables.fetch_add(1, Ordering::SeqCst);
        self.enabled.store(true, Ordering::SeqCst);
    }
}

impl FakeInterrupt {
    /// Clears and returns the "deferred unit queued" flag.
    pub fn take_queued(&self) -> bool {
        self.queued.swap(false, Ordering::SeqCst)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

/// Completion sink that records everything it is handed.
#[derive(Default)]
pub struct Recorder {
    done: Mutex<Vec<(u32, Completion)>>,
}

impl CompletionSink<u32> for Recorder {
    fn complete(&self, request: u32, completion: Completion) {
        self.done.lock().unwrap().push((request, completion));
    }
}

impl Recorder {
    pub fn take(&self) -> Vec<(u32, Completion)> {
        std::mem::take(&mut *self.done.lock().unwrap())
    }

    pub fn len(&self) -> usize {
        self.done.lock().unwrap().len()
    }
}

// ---------------------------------------------------------------------------
// PCI config space
// ---------------------------------------------------------------------------

/// Builds a 256-byte type 0 config header with a capability chain.
pub struct PciConfigBuilder {
    cfg: [u8; 256],
    next_ptr: usize,
    last: Option<usize>,
}

impl Default for PciConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PciConfigBuilder {
    pub fn new() -> Self {
        let mut cfg = [0u8; 256];
        cfg[PCI_CFG_VENDOR_ID..PCI_CFG_VENDOR_ID + 2].copy_from_slice(&VIRTIO_PCI_VENDOR_ID.to_le_bytes());
        cfg[PCI_CFG_DEVICE_ID..PCI_CFG_DEVICE_ID + 2]
            .copy_from_slice(&VIRTIO_PCI_DEVICE_ID_BLK_MODERN.to_le_bytes());
        cfg[PCI_CFG_STATUS..PCI_CFG_STATUS + 2].copy_from_slice(&PCI_STATUS_CAP_LIST.to_le_bytes());
        cfg[PCI_CFG_REVISION_ID] = VIRTIO_PCI_CONTRACT_REVISION;
        cfg[PCI_CFG_BAR0..PCI_CFG_BAR0 + 4]
            .copy_from_slice(&(BAR0_BASE as u32 | PCI_BAR_MEM_TYPE_64).to_le_bytes());
        cfg[PCI_CFG_SUBSYSTEM_VENDOR_ID..PCI_CFG_SUBSYSTEM_VENDOR_ID + 2]
            .copy_from_slice(&VIRTIO_PCI_VENDOR_ID.to_le_bytes());
        cfg[PCI_CFG_SUBSYSTEM_ID..PCI_CFG_SUBSYSTEM_ID + 2].copy_from_slice(&2u16.to_le_bytes());
        cfg[PCI_CFG_INTERRUPT_PIN] = 1;
        Self {
            cfg,
            next_ptr: 0x40,
            last: None,
        }
    }

    fn link(&mut self, ptr: usize) {
        match self.last {
            None => self.cfg[PCI_CFG_CAP_PTR] = ptr as u8,
            Some(prev) => self.cfg[prev + 1] = ptr as u8,
        }
        self.last = Some(ptr);
    }

    /// MSI-X capability (id 0x11) with `table_size` entries in BAR 0.
    pub fn msix(mut self, table_size: u16) -> Self {
        let ptr = self.next_ptr;
        self.cfg[ptr] = 0x11;
        self.cfg[ptr + 2..ptr + 4].copy_from_slice(&(table_size - 1).to_le_bytes());
        self.link(ptr);
        self.next_ptr = ptr + 12;
        self
    }

    pub fn virtio(mut self, cfg_type: u8, bar: u8, offset: u32, length: u32, multiplier: Option<u32>) -> Self {
        let ptr = self.next_ptr;
        let cap_len = if multiplier.is_some() {
            VIRTIO_PCI_NOTIFY_CAP_LEN
        } else {
            VIRTIO_PCI_CAP_LEN
        };
        self.cfg[ptr] = PCI_CAP_ID_VENDOR;
        self.cfg[ptr + 2] = cap_len;
        self.cfg[ptr + VIRTIO_PCI_CAP_CFG_TYPE_OFFSET] = cfg_type;
        self.cfg[ptr + VIRTIO_PCI_CAP_BAR_OFFSET] = bar;
        self.cfg[ptr + VIRTIO_PCI_CAP_OFFSET_OFFSET..ptr + VIRTIO_PCI_CAP_OFFSET_OFFSET + 4]
            .copy_from_slice(&offset.to_le_bytes());
        self.cfg[ptr + VIRTIO_PCI_CAP_LENGTH_OFFSET..ptr + VIRTIO_PCI_CAP_LENGTH_OFFSET + 4]
            .copy_from_slice(&length.to_le_bytes());
        if let Some(m) = multiplier {
            let off = ptr + VIRTIO_PCI_NOTIFY_CAP_MULTIPLIER_OFFSET;
            self.cfg[off..off + 4].copy_from_slice(&m.to_le_bytes());
        }
        self.link(ptr);
        self.next_ptr = (ptr + usize::from(cap_len) + 3) & !3;
        self
    }

    /// The four contract-fixed windows, preceded by an MSI-X capability.
    pub fn contract(self) -> Self {
        self.msix(2)
            .virtio(
                VIRTIO_PCI_CAP_COMMON_CFG,
                0,
                CONTRACT_COMMON_CFG_OFFSET,
                CONTRACT_COMMON_CFG_LEN,
                None,
            )
            .virtio(
                VIRTIO_PCI_CAP_NOTIFY_CFG,
                0,
                CONTRACT_NOTIFY_CFG_OFFSET,
                CONTRACT_NOTIFY_CFG_LEN,
                Some(CONTRACT_NOTIFY_OFF_MULTIPLIER),
            )
            .virtio(VIRTIO_PCI_CAP_ISR_CFG, 0, CONTRACT_ISR_CFG_OFFSET, CONTRACT_ISR_CFG_LEN, None)
            .virtio(
                VIRTIO_PCI_CAP_DEVICE_CFG,
                0,
                CONTRACT_DEVICE_CFG_OFFSET,
                CONTRACT_DEVICE_CFG_LEN,
                None,
            )
    }

    pub fn set_u8(mut self, offset: usize, value: u8) -> Self {
        self.cfg[offset] = value;
        self
    }

    pub fn build(self) -> [u8; 256] {
        self.cfg
    }
}

pub fn contract_config_space() -> [u8; 256] {
    PciConfigBuilder::new().contract().build()
}

// ---------------------------------------------------------------------------
// Device model
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct SimQueue {
    pub size: u16,
    pub msix_vector: u16,
    pub enable: bool,
    pub notify_off: u16,
    pub desc: u64,
    pub avail: u64,
    pub used: u64,
    pub last_avail: u16,
    pub used_idx: u16,
}

impl SimQueue {
    fn new(size: u16, notify_off: u16) -> Self {
        Self {
            size,
            msix_vector: VIRTIO_MSI_NO_VECTOR,
            enable: false,
            notify_off,
            desc: 0,
            avail: 0,
            used: 0,
            last_avail: 0,
            used_idx: 0,
        }
    }

    fn reset(&mut self) {
        *self = Self::new(self.size, self.notify_off);
    }
}

pub struct SimState {
    pub device_features: u64,
    pub device_feature_select: u32,
    pub driver_feature_select: u32,
    pub driver_features: u64,
    pub msix_config: u16,
    pub status: u8,
    pub config_generation: u8,
    pub queue_select: u16,
    pub queues: Vec<SimQueue>,
    pub isr: u8,
    pub config: [u8; 0x100],
    pub disk: Vec<u8>,
    pub flushes: u32,
    /// Queue indices written to the notify window.
    pub notifications: Vec<u16>,
    /// Every register write as (BAR offset, value).
    pub writes: Vec<(u32, u32)>,
    /// Vectors raised since the last take (`VIRTIO_MSI_NO_VECTOR` = INTx).
    pub raised: Vec<u16>,

    pub accept_features_ok: bool,
    pub accept_queue_enable: bool,
    /// MSI-X table size; vectors at or beyond it read back as "no vector".
    pub msix_table_size: u16,
    pub reset_stuck: bool,
    /// Status byte reported for every request instead of executing it.
    pub forced_status: Option<u8>,
    /// Bump `config_generation` on this many upcoming device-config reads.
    pub config_churn: u32,
    /// Device-side `VIRTQ_USED_F_NO_NOTIFY`.
    pub suppress_notify: bool,
    /// Register reads of any width, counted per byte.
    pub register_reads: u32,
    /// `(n, sectors)`: resize the disk to `sectors` just before the `n`-th
    /// upcoming `config_generation` read (0 = the next one).
    pub resize_before_generation_read: Option<(u32, u64)>,
}

impl SimState {
    fn resize(&mut self, sectors: u64) {
        self.config[VIRTIO_BLK_CFG_CAPACITY as usize..][..8].copy_from_slice(&sectors.to_le_bytes());
        self.disk.resize(sectors as usize * 512, 0);
        self.config_generation = self.config_generation.wrapping_add(1);
        self.isr |= VIRTIO_PCI_ISR_CONFIG;
        let vector = self.msix_config;
        self.raised.push(vector);
    }

    fn reset(&mut self) {
        if self.reset_stuck {
            return;
        }
        self.device_feature_select = 0;
        self.driver_feature_select = 0;
        self.driver_features = 0;
        self.msix_config = VIRTIO_MSI_NO_VECTOR;
        self.status = 0;
        self.queue_select = 0;
        self.isr = 0;
        for q in &mut self.queues {
            q.reset();
        }
    }

    fn selected_queue(&self) -> Option<&SimQueue> {
        self.queues.get(usize::from(self.queue_select))
    }

    fn selected_queue_mut(&mut self) -> Option<&mut SimQueue> {
        self.queues.get_mut(usize::from(self.queue_select))
    }

    fn common_bytes(&self) -> [u8; COMMON_CFG_LEN as usize] {
        let mut buf = [0u8; COMMON_CFG_LEN as usize];
        let put = |buf: &mut [u8], reg: u32, bytes: &[u8]| {
            buf[reg as usize..reg as usize + bytes.len()].copy_from_slice(bytes)
        };
        put(&mut buf, COMMON_CFG_DEVICE_FEATURE_SELECT, &self.device_feature_select.to_le_bytes());
        let df = match self.device_feature_select {
            0 => self.device_features as u32,
            1 => (self.device_features >> 32) as u32,
            _ => 0,
        };
        put(&mut buf, COMMON_CFG_DEVICE_FEATURE, &df.to_le_bytes());
        put(&mut buf, COMMON_CFG_DRIVER_FEATURE_SELECT, &self.driver_feature_select.to_le_bytes());
        let drf = match self.driver_feature_select {
            0 => self.driver_features as u32,
            1 => (self.driver_features >> 32) as u32,
            _ => 0,
        };
        put(&mut buf, COMMON_CFG_DRIVER_FEATURE, &drf.to_le_bytes());
        put(&mut buf, COMMON_CFG_MSIX_CONFIG, &self.msix_config.to_le_bytes());
        put(&mut buf, COMMON_CFG_NUM_QUEUES, &(self.queues.len() as u16).to_le_bytes());
        put(&mut buf, COMMON_CFG_DEVICE_STATUS, &[self.status]);
        put(&mut buf, COMMON_CFG_CONFIG_GENERATION, &[self.config_generation]);
        put(&mut buf, COMMON_CFG_QUEUE_SELECT, &self.queue_select.to_le_bytes());
        if let Some(q) = self.selected_queue() {
            put(&mut buf, COMMON_CFG_QUEUE_SIZE, &q.size.to_le_bytes());
            put(&mut buf, COMMON_CFG_QUEUE_MSIX_VECTOR, &q.msix_vector.to_le_bytes());
            put(&mut buf, COMMON_CFG_QUEUE_ENABLE, &u16::from(q.enable).to_le_bytes());
            put(&mut buf, COMMON_CFG_QUEUE_NOTIFY_OFF, &q.notify_off.to_le_bytes());
            put(&mut buf, COMMON_CFG_QUEUE_DESC, &q.desc.to_le_bytes());
            put(&mut buf, COMMON_CFG_QUEUE_AVAIL, &q.avail.to_le_bytes());
            put(&mut buf, COMMON_CFG_QUEUE_USED, &q.used.to_le_bytes());
        }
        buf
    }

    fn accept_vector(&self, vector: u16) -> u16 {
        if vector == VIRTIO_MSI_NO_VECTOR || vector < self.msix_table_size {
            vector
        } else {
            VIRTIO_MSI_NO_VECTOR
        }
    }

    fn common_write(&mut self, reg: u32, width: usize, value: u32) {
        let set_half = |word: u64, select: u32, value: u32| match select {
            0 => (word & 0xFFFF_FFFF_0000_0000) | u64::from(value),
            1 => (word & 0x0000_0000_FFFF_FFFF) | (u64::from(value) << 32),
            _ => word,
        };
        let set_addr = |addr: u64, high: bool, value: u32| {
            if high {
                set_half(addr, 1, value)
            } else {
                set_half(addr, 0, value)
            }
        };

        match (reg, width) {
            (COMMON_CFG_DEVICE_FEATURE_SELECT, 4) => self.device_feature_select = value,
            (COMMON_CFG_DRIVER_FEATURE_SELECT, 4) => self.driver_feature_select = value,
            (COMMON_CFG_DRIVER_FEATURE, 4) => {
                self.driver_features = set_half(self.driver_features, self.driver_feature_select, value);
            }
            (COMMON_CFG_MSIX_CONFIG, 2) => self.msix_config = self.accept_vector(value as u16),
            (COMMON_CFG_DEVICE_STATUS, 1) => {
                let status = value as u8;
                if status == 0 {
                    self.reset();
                    return;
                }
                let newly_ok = status & VIRTIO_STATUS_FEATURES_OK != 0 && self.status & VIRTIO_STATUS_FEATURES_OK == 0;
                self.status = status;
                if newly_ok && (!self.accept_features_ok || self.driver_features & !self.device_features != 0) {
                    self.status &= !VIRTIO_STATUS_FEATURES_OK;
                }
            }
            (COMMON_CFG_QUEUE_SELECT, 2) => self.queue_select = value as u16,
            (COMMON_CFG_QUEUE_MSIX_VECTOR, 2) => {
                let vector = self.accept_vector(value as u16);
                if let Some(q) = self.selected_queue_mut() {
                    q.msix_vector = vector;
                }
            }
            (COMMON_CFG_QUEUE_ENABLE, 2) => {
                let accept = self.accept_queue_enable;
                if let Some(q) = self.selected_queue_mut() {
                    if value == 0 {
                        q.enable = false;
                    } else if accept {
                        q.enable = true;
                        q.last_avail = 0;
                        q.used_idx = 0;
                    }
                }
            }
            (reg, 4) if (COMMON_CFG_QUEUE_DESC..COMMON_CFG_QUEUE_USED + 8).contains(&reg) => {
                let Some(q) = self.selected_queue_mut() else {
                    return;
                };
                let high = reg % 8 == 4;
                let field = match reg & !7 {
                    COMMON_CFG_QUEUE_DESC => &mut q.desc,
                    COMMON_CFG_QUEUE_AVAIL => &mut q.avail,
                    _ => &mut q.used,
                };
                *field = set_addr(*field, high, value);
            }
            _ => {}
        }
    }
}

/// BAR0 of the simulated function.
pub struct SimDevice {
    state: Mutex<SimState>,
    mem: GuestMemory,
}

impl SimDevice {
    pub fn new(mem: GuestMemory) -> Self {
        let mut config = [0u8; 0x100];
        config[VIRTIO_BLK_CFG_CAPACITY as usize..][..8].copy_from_slice(&DISK_SECTORS.to_le_bytes());
        config[VIRTIO_BLK_CFG_SEG_MAX as usize..][..4].copy_from_slice(&128u32.to_le_bytes());
        config[VIRTIO_BLK_CFG_BLK_SIZE as usize..][..4].copy_from_slice(&512u32.to_le_bytes());

        let disk = (0..DISK_SECTORS as usize * 512).map(|i| (i % 251) as u8).collect();
        Self {
            state: Mutex::new(SimState {
                device_features: STANDARD_FEATURES,
                device_feature_select: 0,
                driver_feature_select: 0,
                driver_features: 0,
                msix_config: VIRTIO_MSI_NO_VECTOR,
                status: 0,
                config_generation: 0,
                queue_select: 0,
                queues: vec![SimQueue::new(128, 0)],
                isr: 0,
                config,
                disk,
                flushes: 0,
                notifications: Vec::new(),
                writes: Vec::new(),
                raised: Vec::new(),
                accept_features_ok: true,
                accept_queue_enable: true,
                msix_table_size: 2,
                reset_stuck: false,
                forced_status: None,
                config_churn: 0,
                suppress_notify: false,
                register_reads: 0,
                resize_before_generation_read: None,
            }),
            mem,
        }
    }

    pub fn with<T>(&self, f: impl FnOnce(&mut SimState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    pub fn set_config_u32(&self, offset: u32, value: u32) {
        self.with(|s| s.config[offset as usize..][..4].copy_from_slice(&value.to_le_bytes()));
    }

    /// Resizes the disk and raises a config-change interrupt.
    pub fn set_capacity(&self, sectors: u64) {
        self.with(|s| s.resize(sectors));
    }

    pub fn take_raised(&self) -> Vec<u16> {
        self.with(|s| std::mem::take(&mut s.raised))
    }

    pub fn take_writes(&self) -> Vec<(u32, u32)> {
        self.with(|s| std::mem::take(&mut s.writes))
    }

    pub fn status(&self) -> u8 {
        self.with(|s| s.status)
    }

    pub fn disk(&self, sector: u64, len: usize) -> Vec<u8> {
        self.with(|s| s.disk[sector as usize * 512..][..len].to_vec())
    }

    /// Plays the device side of queue `q`: executes every newly available
    /// chain, fills the used ring and raises the queue interrupt.
    pub fn process_queue(&self, q: u16) -> usize {
        let mut state = self.state.lock().unwrap();
        let s = &mut *state;
        let Some(queue) = s.queues.get_mut(usize::from(q)) else {
            return 0;
        };
        if !queue.enable {
            return 0;
        }
        self.mem
            .write_u16(queue.used, if s.suppress_notify { VIRTQ_USED_F_NO_NOTIFY } else { 0 });

        let avail_idx = self.mem.read_u16(queue.avail + 2);
        let mut processed = 0;
        while queue.last_avail != avail_idx {
            let slot = u64::from(queue.last_avail % queue.size);
            let head = self.mem.read_u16(queue.avail + 4 + 2 * slot);
            queue.last_avail = queue.last_avail.wrapping_add(1);

            let chain = read_chain(&self.mem, queue, head);
            let written = execute(&self.mem, &mut s.disk, &mut s.flushes, s.forced_status, &chain);

            let elem = queue.used + 4 + 8 * u64::from(queue.used_idx % queue.size);
            self.mem.write_u32(elem, u32::from(head));
            self.mem.write_u32(elem + 4, written);
            queue.used_idx = queue.used_idx.wrapping_add(1);
            self.mem.write_u16(queue.used + 2, queue.used_idx);
            processed += 1;
        }

        if processed != 0 {
            let vector = queue.msix_vector;
            s.isr |= VIRTIO_PCI_ISR_QUEUE;
            s.raised.push(vector);
        }
        processed
    }

    /// Pushes a raw used-ring entry, bypassing the avail ring.
    pub fn push_raw_used(&self, q: u16, id: u32, len: u32) {
        self.with(|s| {
            let queue = &mut s.queues[usize::from(q)];
            let elem = queue.used + 4 + 8 * u64::from(queue.used_idx % queue.size);
            self.mem.write_u32(elem, id);
            self.mem.write_u32(elem + 4, len);
            queue.used_idx = queue.used_idx.wrapping_add(1);
            self.mem.write_u16(queue.used + 2, queue.used_idx);
        });
    }
}

fn read_desc(mem: &GuestMemory, pa: u64) -> VirtqDesc {
    let bytes: [u8; 16] = mem.read(pa, VirtqDesc::SIZE).try_into().unwrap();
    VirtqDesc::from_le_bytes(&bytes)
}

fn read_chain(mem: &GuestMemory, queue: &SimQueue, head: u16) -> Vec<VirtqDesc> {
    let first = read_desc(mem, queue.desc + 16 * u64::from(head));
    let (table, mut desc) = if first.flags & VIRTQ_DESC_F_INDIRECT != 0 {
        (first.addr, read_desc(mem, first.addr))
    } else {
        (queue.desc, first)
    };
    let mut chain = Vec::new();
    loop {
        chain.push(desc);
        assert!(chain.len() <= 1024, "descriptor chain does not terminate");
        if desc.flags & VIRTQ_DESC_F_NEXT == 0 {
            return chain;
        }
        desc = read_desc(mem, table + 16 * u64::from(desc.next));
    }
}

/// Executes one blk request and returns the used length.
fn execute(mem: &GuestMemory, disk: &mut [u8], flushes: &mut u32, forced: Option<u8>, chain: &[VirtqDesc]) -> u32 {
    assert!(chain.len() >= 2, "blk chain needs a header and a status descriptor");
    let header = chain[0];
    let status = chain[chain.len() - 1];
    let data = &chain[1..chain.len() - 1];
    assert_eq!(header.len, 16);
    assert_eq!(header.flags & VIRTQ_DESC_F_WRITE, 0);
    assert_eq!(status.len, 1);
    assert_ne!(status.flags & VIRTQ_DESC_F_WRITE, 0);

    let req_type = mem.read_u32(header.addr);
    let sector = mem.read_u64(header.addr + 8);
    let total: u64 = data.iter().map(|d| u64::from(d.len)).sum();

    let (code, written) = match forced {
        Some(code) => (code, 0),
        None => match req_type {
            VIRTIO_BLK_T_IN | VIRTIO_BLK_T_OUT => {
                let start = sector * 512;
                if start + total > disk.len() as u64 {
                    (VIRTIO_BLK_S_IOERR, 0)
                } else {
                    let mut off = start as usize;
                    for d in data {
                        let len = d.len as usize;
                        if req_type == VIRTIO_BLK_T_IN {
                            assert_ne!(d.flags & VIRTQ_DESC_F_WRITE, 0);
                            mem.write(d.addr, &disk[off..off + len]);
                        } else {
                            assert_eq!(d.flags & VIRTQ_DESC_F_WRITE, 0);
                            disk[off..off + len].copy_from_slice(&mem.read(d.addr, len));
                        }
                        off += len;
                    }
                    let written = if req_type == VIRTIO_BLK_T_IN { total as u32 } else { 0 };
                    (VIRTIO_BLK_S_OK, written)
                }
            }
            VIRTIO_BLK_T_FLUSH => {
                *flushes += 1;
                (VIRTIO_BLK_S_OK, 0)
            }
            VIRTIO_BLK_T_GET_ID => {
                let len = (data[0].len as usize).min(SERIAL.len());
                mem.write(data[0].addr, &SERIAL[..len]);
                (VIRTIO_BLK_S_OK, len as u32)
            }
            _ => (VIRTIO_BLK_S_UNSUPP, 0),
        },
    };
    mem.write(status.addr, &[code]);
    written + 1
}

impl RegisterWindow for SimDevice {
    fn len(&self) -> u64 {
        BAR0_LEN
    }

    fn read_u8(&self, offset: u32) -> u8 {
        let mut s = self.state.lock().unwrap();
        s.register_reads += 1;
        if offset == COMMON_CFG_CONFIG_GENERATION {
            match s.resize_before_generation_read {
                Some((0, sectors)) => {
                    s.resize_before_generation_read = None;
                    s.resize(sectors);
                }
                Some((n, sectors)) => s.resize_before_generation_read = Some((n - 1, sectors)),
                None => {}
            }
        }
        match offset {
            o if o < CONTRACT_COMMON_CFG_LEN => s.common_bytes().get(o as usize).copied().unwrap_or(0),
            CONTRACT_ISR_CFG_OFFSET => std::mem::take(&mut s.isr),
            o if (CONTRACT_DEVICE_CFG_OFFSET..CONTRACT_DEVICE_CFG_OFFSET + CONTRACT_DEVICE_CFG_LEN).contains(&o) => {
                let v = s.config[(o - CONTRACT_DEVICE_CFG_OFFSET) as usize];
                if s.config_churn > 0 {
                    s.config_churn -= 1;
                    s.config_generation = s.config_generation.wrapping_add(1);
                }
                v
            }
            _ => 0,
        }
    }

    fn read_u16(&self, offset: u32) -> u16 {
        u16::from_le_bytes([self.read_u8(offset), self.read_u8(offset + 1)])
    }

    fn read_u32(&self, offset: u32) -> u32 {
        u32::from_le_bytes([
            self.read_u8(offset),
            self.read_u8(offset + 1),
            self.read_u8(offset + 2),
            self.read_u8(offset + 3),
        ])
    }

    fn write_u8(&self, offset: u32, value: u8) {
        let mut s = self.state.lock().unwrap();
        s.writes.push((offset, value.into()));
        match offset {
            o if o < CONTRACT_COMMON_CFG_LEN => s.common_write(o, 1, value.into()),
            o if (CONTRACT_DEVICE_CFG_OFFSET..CONTRACT_DEVICE_CFG_OFFSET + CONTRACT_DEVICE_CFG_LEN).contains(&o) => {
                s.config[(o - CONTRACT_DEVICE_CFG_OFFSET) as usize] = value;
            }
            _ => {}
        }
    }

    fn write_u16(&self, offset: u32, value: u16) {
        let mut s = self.state.lock().unwrap();
        s.writes.push((offset, value.into()));
        match offset {
            o if o < CONTRACT_COMMON_CFG_LEN => s.common_write(o, 2, value.into()),
            o if (CONTRACT_NOTIFY_CFG_OFFSET..CONTRACT_NOTIFY_CFG_OFFSET + CONTRACT_NOTIFY_CFG_LEN).contains(&o) => {
                s.notifications.push(value);
            }
            _ => {}
        }
    }

    fn write_u32(&self, offset: u32, value: u32) {
        let mut s = self.state.lock().unwrap();
        s.writes.push((offset, value));
        if offset < CONTRACT_COMMON_CFG_LEN {
            s.common_write(offset, 4, value);
        }
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub mem: GuestMemory,
    pub sim: Arc<SimDevice>,
    pub stall: Arc<NoStall>,
    pub recorder: Arc<Recorder>,
    pub line: Arc<FakeInterrupt>,
    pub messages: Vec<Arc<FakeInterrupt>>,
    pub device: BlkDevice<u32>,
}

impl Harness {
    /// Attached but not initialized; `tweak` adjusts the device model first.
    pub fn attach_with(options: BlkOptions, messages: usize, tweak: impl FnOnce(&mut SimState)) -> Self {
        let mem = GuestMemory::default();
        let sim = Arc::new(SimDevice::new(mem.clone()));
        sim.with(tweak);
        let stall = Arc::new(NoStall::default());
        let recorder = Arc::new(Recorder::default());
        let device = BlkDevice::attach(
            &contract_config_space(),
            &BARS,
            sim.clone(),
            stall.clone(),
            Arc::new(mem.clone()),
            recorder.clone(),
            options,
        )
        .expect("attach");
        Self {
            mem,
            sim,
            stall,
            recorder,
            line: Arc::new(FakeInterrupt::default()),
            messages: (0..messages).map(|_| Arc::new(FakeInterrupt::default())).collect(),
            device,
        }
    }

    pub fn resources(&self) -> InterruptResources {
        InterruptResources {
            line: Some(self.line.clone()),
            messages: self
                .messages
                .iter()
                .map(|m| m.clone() as Arc<dyn InterruptObject>)
                .collect(),
        }
    }

    /// Default options, two MSI-X messages, initialized.
    pub fn new() -> Self {
        Self::with_messages(2)
    }

    pub fn with_messages(messages: usize) -> Self {
        let mut h = Self::attach_with(BlkOptions::default(), messages, |_| {});
        h.initialize().expect("initialize");
        h
    }

    pub fn initialize(&mut self) -> aero_virtio_blk_driver::Result<()> {
        let resources = self.resources();
        self.device.initialize(&resources)
    }

    /// Allocates a guest buffer of `len` bytes.
    pub fn buffer(&self, len: usize) -> DataSegment {
        DataSegment {
            addr: self.mem.alloc(len, 512),
            len: len as u32,
        }
    }

    /// Runs top and bottom halves for every interrupt the device raised.
    pub fn deliver_interrupts(&self) {
        for vector in self.sim.take_raised() {
            if vector == VIRTIO_MSI_NO_VECTOR {
                if self.device.service_interrupt(0) && self.line.take_queued() {
                    self.device.run_deferred(0);
                }
            } else if self.device.service_interrupt(vector) && self.messages[usize::from(vector)].take_queued() {
                self.device.run_deferred(vector);
            }
        }
    }

    /// Device processes queue 0, then interrupts are delivered.
    pub fn complete_all(&self) -> Vec<(u32, Completion)> {
        self.sim.process_queue(0);
        self.deliver_interrupts();
        self.recorder.take()
    }
}
