//! Driver side of a split virtqueue.
//!
//! The descriptor table, available ring and used ring live in one DMA buffer
//! laid out by [`SplitRingLayout`]. Free descriptors are threaded through a
//! host-side `next` array that mirrors the `next` fields written to the table,
//! so a completed chain can be returned without reading device-writable memory.

use alloc::boxed::Box;
use alloc::vec::Vec;

use aero_virtio_protocol::*;

use crate::dma::{DmaAllocator, DmaBuffer};
use crate::hw::{mb, rmb, wmb};
use crate::{Result, VirtioError};

/// One scatter/gather element of a request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SgEntry {
    pub addr: u64,
    pub len: u32,
    /// The device writes into this buffer (`VIRTQ_DESC_F_WRITE`).
    pub device_writes: bool,
}

/// A completed chain popped from the used ring.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct UsedEntry {
    pub cookie: u16,
    pub len: u32,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IndirectConfig {
    pub tables: u16,
    pub max_desc: u16,
}

#[derive(Clone, Copy, Debug, Default)]
struct InFlight {
    cookie: Option<u16>,
    chain_len: u16,
    indirect_table: Option<u16>,
}

struct IndirectPool {
    buf: Box<dyn DmaBuffer>,
    config: IndirectConfig,
    free: Vec<u16>,
}

impl IndirectPool {
    fn table_bytes(&self) -> usize {
        usize::from(self.config.max_desc) * VirtqDesc::SIZE
    }

    fn refill(&mut self) {
        self.free.clear();
        self.free.extend((0..self.config.tables).rev());
    }
}

pub struct SplitVirtqueue {
    index: u16,
    size: u16,
    layout: SplitRingLayout,
    ring: Box<dyn DmaBuffer>,
    event_idx: bool,

    desc_next: Vec<u16>,
    free_head: u16,
    num_free: u16,

    avail_idx: u16,
    last_kick_avail: u16,
    last_used_idx: u16,

    in_flight: Vec<InFlight>,
    indirect: Option<IndirectPool>,
    malformed_used: u32,
}

impl SplitVirtqueue {
    pub fn new(
        index: u16,
        size: u16,
        alloc: &dyn DmaAllocator,
        event_idx: bool,
        indirect: Option<IndirectConfig>,
    ) -> Result<Self> {
        if size == 0 || !size.is_power_of_two() {
            return Err(VirtioError::InvalidRequest("queue size must be a non-zero power of two"));
        }
        let layout = SplitRingLayout::new(size);
        let ring = alloc.alloc_coherent(layout.total_len, VIRTQ_DESC_ALIGN as usize)?;

        let indirect = match indirect {
            Some(config) if config.tables != 0 && config.max_desc >= 2 => {
                let bytes = usize::from(config.tables) * usize::from(config.max_desc) * VirtqDesc::SIZE;
                let buf = alloc.alloc_coherent(bytes, VIRTQ_DESC_ALIGN as usize)?;
                let mut pool = IndirectPool {
                    buf,
                    config,
                    free: Vec::with_capacity(usize::from(config.tables)),
                };
                pool.refill();
                Some(pool)
            }
            _ => None,
        };

        let mut vq = Self {
            index,
            size,
            layout,
            ring,
            event_idx,
            desc_next: Vec::with_capacity(usize::from(size)),
            free_head: 0,
            num_free: 0,
            avail_idx: 0,
            last_kick_avail: 0,
            last_used_idx: 0,
            in_flight: alloc::vec![InFlight::default(); usize::from(size)],
            indirect,
            malformed_used: 0,
        };
        vq.reset();
        Ok(vq)
    }

    /// Returns the queue to its freshly-allocated state. The device must not be
    /// using the ring (reset it first).
    pub fn reset(&mut self) {
        self.ring.zero();
        self.desc_next.clear();
        self.desc_next.extend((1..=self.size).map(|n| n % self.size));
        self.free_head = 0;
        self.num_free = self.size;
        self.avail_idx = 0;
        self.last_kick_avail = 0;
        self.last_used_idx = 0;
        self.in_flight.iter_mut().for_each(|s| *s = InFlight::default());
        if let Some(pool) = self.indirect.as_mut() {
            pool.buf.zero();
            pool.refill();
        }
        self.malformed_used = 0;
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    pub fn desc_addr(&self) -> u64 {
        self.ring.phys_addr() + self.layout.desc_offset as u64
    }

    pub fn avail_addr(&self) -> u64 {
        self.ring.phys_addr() + self.layout.avail_offset as u64
    }

    pub fn used_addr(&self) -> u64 {
        self.ring.phys_addr() + self.layout.used_offset as u64
    }

    pub fn num_free(&self) -> u16 {
        self.num_free
    }

    pub fn avail_idx(&self) -> u16 {
        self.avail_idx
    }

    /// The device's current `used.idx`.
    pub fn used_idx(&self) -> u16 {
        self.ring.read_u16(self.layout.used_offset + 2)
    }

    pub fn last_used_idx(&self) -> u16 {
        self.last_used_idx
    }

    pub fn indirect_num_free(&self) -> u16 {
        self.indirect.as_ref().map_or(0, |p| p.free.len() as u16)
    }

    pub fn uses_indirect(&self) -> bool {
        self.indirect.is_some()
    }

    /// Used entries that named an unknown or out-of-range head since the last reset.
    pub fn malformed_used(&self) -> u32 {
        self.malformed_used
    }

    fn write_desc(buf: &dyn DmaBuffer, offset: usize, desc: VirtqDesc) {
        buf.write(offset, &desc.to_le_bytes());
    }

    fn desc_offset(&self, id: u16) -> usize {
        self.layout.desc_offset + usize::from(id) * VirtqDesc::SIZE
    }

    fn alloc_descs(&mut self, count: u16) -> u16 {
        let head = self.free_head;
        let mut last = head;
        for _ in 1..count {
            last = self.desc_next[usize::from(last)];
        }
        self.free_head = self.desc_next[usize::from(last)];
        self.num_free -= count;
        head
    }

    /// Writes `sg` as a descriptor chain and publishes it on the available ring.
    ///
    /// Chains longer than one element go through an indirect table when the
    /// pool has one free. Fails with `Busy` when neither path has room; nothing
    /// is modified in that case.
    pub fn add_sg(&mut self, sg: &[SgEntry], cookie: u16) -> Result<u16> {
        let count = u16::try_from(sg.len()).map_err(|_| VirtioError::InvalidRequest("scatter/gather list too long"))?;
        if count == 0 {
            return Err(VirtioError::InvalidRequest("empty scatter/gather list"));
        }

        let use_indirect = count > 1
            && self
                .indirect
                .as_ref()
                .is_some_and(|p| count <= p.config.max_desc && !p.free.is_empty());

        let head = if use_indirect {
            if self.num_free == 0 {
                return Err(VirtioError::Busy("virtqueue descriptors exhausted"));
            }
            let Some(pool) = self.indirect.as_mut() else {
                return Err(VirtioError::Busy("indirect tables exhausted"));
            };
            let Some(table) = pool.free.pop() else {
                return Err(VirtioError::Busy("indirect tables exhausted"));
            };
            let base = usize::from(table) * pool.table_bytes();
            for (i, seg) in sg.iter().enumerate() {
                let last = i + 1 == sg.len();
                let mut flags = if last { 0 } else { VIRTQ_DESC_F_NEXT };
                if seg.device_writes {
                    flags |= VIRTQ_DESC_F_WRITE;
                }
                let desc = VirtqDesc {
                    addr: seg.addr,
                    len: seg.len,
                    flags,
                    next: if last { 0 } else { (i + 1) as u16 },
                };
                Self::write_desc(pool.buf.as_ref(), base + i * VirtqDesc::SIZE, desc);
            }
            let table_addr = pool.buf.phys_addr() + base as u64;

            let head = self.alloc_descs(1);
            let desc = VirtqDesc {
                addr: table_addr,
                len: u32::from(count) * VirtqDesc::SIZE as u32,
                flags: VIRTQ_DESC_F_INDIRECT,
                next: 0,
            };
            Self::write_desc(self.ring.as_ref(), self.desc_offset(head), desc);
            self.in_flight[usize::from(head)] = InFlight {
                cookie: Some(cookie),
                chain_len: 1,
                indirect_table: Some(table),
            };
            head
        } else {
            if count > self.size {
                return Err(VirtioError::InvalidRequest("chain longer than the queue"));
            }
            if count > self.num_free {
                return Err(VirtioError::Busy("virtqueue descriptors exhausted"));
            }
            let head = self.alloc_descs(count);
            let mut id = head;
            for (i, seg) in sg.iter().enumerate() {
                let last = i + 1 == sg.len();
                let next = self.desc_next[usize::from(id)];
                let mut flags = if last { 0 } else { VIRTQ_DESC_F_NEXT };
                if seg.device_writes {
                    flags |= VIRTQ_DESC_F_WRITE;
                }
                let desc = VirtqDesc {
                    addr: seg.addr,
                    len: seg.len,
                    flags,
                    next: if last { 0 } else { next },
                };
                Self::write_desc(self.ring.as_ref(), self.desc_offset(id), desc);
                id = next;
            }
            self.in_flight[usize::from(head)] = InFlight {
                cookie: Some(cookie),
                chain_len: count,
                indirect_table: None,
            };
            head
        };

        let slot = self.avail_idx % self.size;
        self.ring.write_u16(self.layout.avail_ring_entry(slot), head);
        // The ring entry must be visible before the index that publishes it.
        wmb();
        self.avail_idx = self.avail_idx.wrapping_add(1);
        self.ring.write_u16(self.layout.avail_offset + 2, self.avail_idx);
        Ok(head)
    }

    /// Decides whether chains published since the last call need a doorbell.
    pub fn kick_prepare(&mut self) -> bool {
        mb();
        let new = self.avail_idx;
        let old = self.last_kick_avail;
        self.last_kick_avail = new;
        if new == old {
            return false;
        }
        if self.event_idx {
            let event = self.ring.read_u16(self.layout.avail_event(self.size));
            vring_need_event(event, new, old)
        } else {
            self.ring.read_u16(self.layout.used_offset) & VIRTQ_USED_F_NO_NOTIFY == 0
        }
    }

    fn free_chain(&mut self, head: u16, entry: InFlight) {
        if let (Some(table), Some(pool)) = (entry.indirect_table, self.indirect.as_mut()) {
            pool.free.push(table);
        }
        let mut last = head;
        for _ in 1..entry.chain_len {
            last = self.desc_next[usize::from(last)];
        }
        self.desc_next[usize::from(last)] = self.free_head;
        self.free_head = head;
        self.num_free += entry.chain_len;
    }

    /// Pops the next completed chain, if any.
    pub fn pop_used(&mut self) -> Option<UsedEntry> {
        loop {
            let used_idx = self.used_idx();
            rmb();
            if used_idx == self.last_used_idx {
                return None;
            }

            let slot = self.last_used_idx % self.size;
            let elem = self.layout.used_ring_entry(slot);
            let id = self.ring.read_u32(elem);
            let len = self.ring.read_u32(elem + 4);
            self.last_used_idx = self.last_used_idx.wrapping_add(1);

            let entry = u16::try_from(id)
                .ok()
                .filter(|&id| id < self.size)
                .map(|id| (id, self.in_flight[usize::from(id)]))
                .filter(|(_, e)| e.cookie.is_some());
            let Some((head, entry)) = entry else {
                self.malformed_used = self.malformed_used.saturating_add(1);
                tracing::warn!(queue = self.index, id, "ignoring malformed used ring entry");
                continue;
            };

            self.in_flight[usize::from(head)] = InFlight::default();
            self.free_chain(head, entry);
            return entry.cookie.map(|cookie| UsedEntry { cookie, len });
        }
    }

    /// Publishes `used_event` (event-index mode) after a drain and reports
    /// whether more completions arrived meanwhile.
    pub fn finish_drain(&mut self) -> bool {
        if self.event_idx {
            self.ring
                .write_u16(self.layout.used_event(self.size), self.last_used_idx);
        }
        mb();
        self.used_idx() != self.last_used_idx
    }
}
