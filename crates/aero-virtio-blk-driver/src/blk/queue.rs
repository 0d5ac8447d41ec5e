//! Request engine for the single blk request queue.
//!
//! Each request context owns a small DMA page holding the request header and
//! the device-written status byte. Contexts live in a fixed arena threaded by
//! an intrusive free list; a context is either free or owned by exactly one
//! in-flight request, and the virtqueue cookie of a chain is its context index.
//!
//! Completions (drained or synthesized aborts) are collected under the queue
//! lock and handed to the [`CompletionSink`] after it is released, so a sink
//! may submit again from inside `complete`.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use aero_virtio_protocol::*;
use spin::Mutex;

use super::{read_blk_config, Completion, CompletionSink, DataSegment, DiskGeometry, Rejected, RequestKind};
use crate::dma::{DmaAllocator, DmaBuffer};
use crate::interrupts::InterruptCallbacks;
use crate::transport::{ModernTransport, QueueInfo};
use crate::virtqueue::{IndirectConfig, SgEntry, SplitVirtqueue};
use crate::{Result, VirtioError};

/// The only request queue of a blk device.
pub const REQUEST_QUEUE: u16 = 0;

const CONTEXT_PAGE_LEN: usize = 64;
const CONTEXT_PAGE_ALIGN: usize = 64;
const HEADER_OFFSET: usize = 0;
const STATUS_OFFSET: usize = VirtioBlkReqHeader::SIZE;
/// Written before publishing; a device that never answers leaves it in place.
const STATUS_PENDING: u8 = 0xFF;

struct RequestContext<R> {
    page: Box<dyn DmaBuffer>,
    owner: Option<(R, RequestKind)>,
    next_free: Option<u16>,
}

struct ContextPool<R> {
    contexts: Vec<RequestContext<R>>,
    free_head: Option<u16>,
    free_count: u16,
}

impl<R> ContextPool<R> {
    fn new(alloc: &dyn DmaAllocator, count: u16) -> Result<Self> {
        let mut contexts = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            contexts.push(RequestContext {
                page: alloc.alloc_coherent(CONTEXT_PAGE_LEN, CONTEXT_PAGE_ALIGN)?,
                owner: None,
                next_free: None,
            });
        }
        let mut pool = Self {
            contexts,
            free_head: None,
            free_count: 0,
        };
        pool.rebuild_free_list();
        Ok(pool)
    }

    fn len(&self) -> u16 {
        self.contexts.len() as u16
    }

    /// Every context must be unowned.
    fn rebuild_free_list(&mut self) {
        self.free_head = None;
        self.free_count = 0;
        for idx in (0..self.len()).rev() {
            self.push_free(idx);
        }
    }

    fn pop_free(&mut self) -> Option<u16> {
        let idx = self.free_head?;
        self.free_head = self.contexts[usize::from(idx)].next_free.take();
        self.free_count -= 1;
        Some(idx)
    }

    fn push_free(&mut self, idx: u16) {
        let ctx = &mut self.contexts[usize::from(idx)];
        debug_assert!(ctx.owner.is_none());
        ctx.next_free = self.free_head;
        self.free_head = Some(idx);
        self.free_count += 1;
    }

    /// Releases the context behind a used-ring cookie. `None` if the cookie
    /// does not name an in-flight request.
    fn complete(&mut self, idx: u16) -> Option<(R, RequestKind, u8)> {
        let ctx = self.contexts.get_mut(usize::from(idx))?;
        let (request, kind) = ctx.owner.take()?;
        let status = ctx.page.read_u8(STATUS_OFFSET);
        self.push_free(idx);
        Some((request, kind, status))
    }

    fn take_all(&mut self, out: &mut Vec<R>) {
        for ctx in &mut self.contexts {
            if let Some((request, _)) = ctx.owner.take() {
                out.push(request);
            }
        }
        self.rebuild_free_list();
    }
}

/// Ring addresses to program with `SetupQueue`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RingAddresses {
    pub desc: u64,
    pub avail: u64,
    pub used: u64,
}

/// Lock-protected engine snapshot.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct QueueDiagnostics {
    pub negotiated_features: u64,
    pub queue_size: u16,
    pub free_contexts: u16,
    pub free_descriptors: u16,
    pub avail_idx: u16,
    pub used_idx: u16,
    pub last_used_idx: u16,
    pub indirect_free: u16,
    pub malformed_used: u32,
    pub capacity_sectors: u64,
    pub logical_block_size: u32,
    pub seg_max: u32,
    pub completed: u32,
    pub aborted: u32,
    pub capacity_change_events: u32,
}

struct QueueState<R> {
    vq: Option<SplitVirtqueue>,
    indirect: Option<IndirectConfig>,
    notify_off: u16,
    pool: Option<ContextPool<R>>,
    /// Chain under construction; capacity reserved up front.
    scratch: Vec<SgEntry>,
    geometry: Option<DiskGeometry>,
    negotiated: u64,
    config_generation: Option<u8>,
}

pub struct BlkRequestQueue<R> {
    transport: Arc<ModernTransport>,
    sink: Arc<dyn CompletionSink<R>>,
    max_sg_elements: u32,
    /// `min(max_sg_elements, seg_max)`; checked before taking the lock.
    seg_limit: AtomicU32,
    state: Mutex<QueueState<R>>,
    removed: AtomicBool,
    failed: AtomicBool,
    resetting: AtomicBool,
    completed: AtomicU32,
    aborted: AtomicU32,
    capacity_changes: AtomicU32,
}

impl<R: Send> BlkRequestQueue<R> {
    pub fn new(transport: Arc<ModernTransport>, sink: Arc<dyn CompletionSink<R>>, max_sg_elements: u32) -> Self {
        Self {
            transport,
            sink,
            max_sg_elements,
            seg_limit: AtomicU32::new(max_sg_elements),
            state: Mutex::new(QueueState {
                vq: None,
                indirect: None,
                notify_off: 0,
                pool: None,
                scratch: Vec::with_capacity(max_sg_elements as usize + 2),
                geometry: None,
                negotiated: 0,
                config_generation: None,
            }),
            removed: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            resetting: AtomicBool::new(false),
            completed: AtomicU32::new(0),
            aborted: AtomicU32::new(0),
            capacity_changes: AtomicU32::new(0),
        }
    }

    pub fn max_sg_elements(&self) -> u32 {
        self.max_sg_elements
    }

    pub fn seg_limit(&self) -> u32 {
        self.seg_limit.load(Ordering::Acquire)
    }

    pub fn geometry(&self) -> Option<DiskGeometry> {
        self.state.lock().geometry
    }

    pub fn negotiated_features(&self) -> u64 {
        self.state.lock().negotiated
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_removed(&self) {
        self.removed.store(true, Ordering::Release);
    }

    pub(crate) fn mark_failed(&self) {
        self.failed.store(true, Ordering::Release);
    }

    pub(crate) fn set_resetting(&self, resetting: bool) {
        self.resetting.store(resetting, Ordering::Release);
    }

    /// Sizes the ring and the context pool for a freshly negotiated device.
    ///
    /// The ring is reused when its size and indirect configuration are
    /// unchanged. Requests still owned by a context are aborted first.
    pub fn prepare(
        &self,
        alloc: &dyn DmaAllocator,
        queue: QueueInfo,
        negotiated: u64,
        geometry: DiskGeometry,
        config_generation: u8,
    ) -> Result<RingAddresses> {
        self.abort_all();

        let indirect = (negotiated & VIRTIO_F_RING_INDIRECT_DESC != 0).then(|| IndirectConfig {
            tables: queue.size,
            max_desc: (geometry.seg_max + 2).min(u32::from(u16::MAX)) as u16,
        });

        let mut guard = self.state.lock();
        let state = &mut *guard;
        match state.vq.as_mut() {
            Some(vq) if vq.size() == queue.size && state.indirect == indirect => vq.reset(),
            _ => state.vq = Some(SplitVirtqueue::new(REQUEST_QUEUE, queue.size, alloc, false, indirect)?),
        }
        if state.pool.as_ref().map_or(true, |pool| pool.len() != queue.size) {
            state.pool = Some(ContextPool::new(alloc, queue.size)?);
        }

        state.indirect = indirect;
        state.notify_off = queue.notify_off;
        state.geometry = Some(geometry);
        state.negotiated = negotiated;
        state.config_generation = Some(config_generation);
        let mut seg_limit = geometry.seg_max.min(self.max_sg_elements);
        if indirect.is_none() {
            // Header and status take two ring slots.
            seg_limit = seg_limit.min(u32::from(queue.size).saturating_sub(2));
        }
        self.seg_limit.store(seg_limit, Ordering::Release);
        self.failed.store(false, Ordering::Release);

        let vq = state
            .vq
            .as_ref()
            .ok_or(VirtioError::NotReady("request queue not initialized"))?;
        Ok(RingAddresses {
            desc: vq.desc_addr(),
            avail: vq.avail_addr(),
            used: vq.used_addr(),
        })
    }

    /// Releases the ring after a failed bring-up. Outstanding requests are aborted.
    pub(crate) fn teardown(&self) {
        self.abort_all();
        let mut state = self.state.lock();
        state.vq = None;
        state.indirect = None;
    }

    /// Submits one request.
    ///
    /// On `Err` the request is handed back untouched and will never be
    /// completed; on `Ok` it reaches the [`CompletionSink`] exactly once.
    /// `Busy` means every context is in flight: retry after a completion.
    pub fn queue_request(
        &self,
        request: R,
        kind: RequestKind,
        sector: u64,
        data: &[DataSegment],
    ) -> core::result::Result<(), Rejected<R>> {
        let bytes = match self.validate(kind, data) {
            Ok(bytes) => bytes,
            Err(err) => return Err(Rejected::new(err, request)),
        };

        let mut guard = self.state.lock();
        let state = &mut *guard;
        if let Err(err) = self.check_ready() {
            return Err(Rejected::new(err, request));
        }
        let (Some(vq), Some(pool), Some(geometry)) = (state.vq.as_mut(), state.pool.as_mut(), state.geometry) else {
            return Err(Rejected::new(
                VirtioError::NotReady("request queue not initialized"),
                request,
            ));
        };
        let sector = match kind {
            RequestKind::Read | RequestKind::Write => sector,
            RequestKind::Flush | RequestKind::GetId => 0,
        };
        if let Err(err) = geometry.check_transfer(kind, sector, bytes) {
            return Err(Rejected::new(err, request));
        }

        let Some(idx) = pool.pop_free() else {
            return Err(Rejected::new(VirtioError::Busy("all request contexts are in flight"), request));
        };
        let page = &pool.contexts[usize::from(idx)].page;
        let header = VirtioBlkReqHeader {
            req_type: kind.req_type(),
            reserved: 0,
            sector,
        };
        page.write(HEADER_OFFSET, &header.to_le_bytes());
        page.write_u8(STATUS_OFFSET, STATUS_PENDING);
        let page_pa = page.phys_addr();

        let scratch = &mut state.scratch;
        scratch.clear();
        scratch.push(SgEntry {
            addr: page_pa + HEADER_OFFSET as u64,
            len: VirtioBlkReqHeader::SIZE as u32,
            device_writes: false,
        });
        let device_writes = kind.device_writes_data();
        scratch.extend(data.iter().map(|seg| SgEntry {
            addr: seg.addr,
            len: seg.len,
            device_writes,
        }));
        scratch.push(SgEntry {
            addr: page_pa + STATUS_OFFSET as u64,
            len: 1,
            device_writes: true,
        });

        if let Err(err) = vq.add_sg(scratch, idx) {
            pool.push_free(idx);
            return Err(Rejected::new(err, request));
        }
        pool.contexts[usize::from(idx)].owner = Some((request, kind));

        if vq.kick_prepare() {
            self.transport.notify_queue(vq.index(), state.notify_off);
        }
        Ok(())
    }

    fn validate(&self, kind: RequestKind, data: &[DataSegment]) -> Result<u64> {
        let count = data.len();
        if count > self.max_sg_elements as usize || count > self.seg_limit() as usize {
            return Err(VirtioError::InvalidRequest("scatter/gather list exceeds the segment limit"));
        }
        match kind {
            RequestKind::Flush if count != 0 => {
                return Err(VirtioError::InvalidRequest("flush requests carry no data"));
            }
            RequestKind::Read | RequestKind::Write | RequestKind::GetId if count == 0 => {
                return Err(VirtioError::InvalidRequest("request has no data segments"));
            }
            _ => {}
        }
        if data.iter().any(|seg| seg.len == 0) {
            return Err(VirtioError::InvalidRequest("zero-length data segment"));
        }
        let bytes = data.iter().map(|seg| u64::from(seg.len)).sum::<u64>();
        if kind == RequestKind::GetId && bytes < u64::from(VIRTIO_BLK_ID_BYTES) {
            return Err(VirtioError::InvalidRequest("GET_ID buffer is shorter than the device id"));
        }
        Ok(bytes)
    }

    fn check_ready(&self) -> Result<()> {
        if self.is_removed() {
            return Err(VirtioError::NotReady("device removed"));
        }
        if self.is_failed() {
            return Err(VirtioError::NotReady("device failed"));
        }
        if self.resetting.load(Ordering::Acquire) {
            return Err(VirtioError::Busy("device reset in progress"));
        }
        Ok(())
    }

    /// Pops every completed chain and delivers its completion. Returns the
    /// number of requests completed.
    pub fn drain(&self) -> usize {
        let mut done = Vec::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let (Some(vq), Some(pool)) = (state.vq.as_mut(), state.pool.as_mut()) else {
                return 0;
            };
            loop {
                while let Some(used) = vq.pop_used() {
                    match pool.complete(used.cookie) {
                        Some((request, kind, status)) => {
                            done.push((request, Completion::from_status(status, kind, used.len)));
                        }
                        None => {
                            tracing::warn!(cookie = used.cookie, "used entry names an idle request context");
                        }
                    }
                }
                if !vq.finish_drain() {
                    break;
                }
            }
        }

        let n = done.len();
        self.completed.fetch_add(n as u32, Ordering::Relaxed);
        for (request, completion) in done {
            self.sink.complete(request, completion);
        }
        n
    }

    /// Completes every in-flight request as [`Completion::Aborted`] and puts
    /// all contexts back on the free list. The ring itself is left alone.
    pub fn abort_all(&self) -> usize {
        let mut aborted = Vec::new();
        if let Some(pool) = self.state.lock().pool.as_mut() {
            pool.take_all(&mut aborted);
        }

        let n = aborted.len();
        if n != 0 {
            tracing::debug!(count = n, "aborting in-flight requests");
            self.aborted.fetch_add(n as u32, Ordering::Relaxed);
        }
        for request in aborted {
            self.sink.complete(request, Completion::Aborted);
        }
        n
    }

    /// Re-reads capacity and block size if `config_generation` moved since the
    /// last read. Does nothing once the device is removed.
    pub fn refresh_config(&self) {
        if self.is_removed() {
            return;
        }
        let generation = self.transport.config_generation();
        if self.state.lock().config_generation == Some(generation) {
            return;
        }
        let (config, generation) = match read_blk_config(&self.transport) {
            Ok(read) => read,
            Err(err) => {
                tracing::warn!(%err, "failed to re-read blk config after a config change");
                return;
            }
        };

        let mut state = self.state.lock();
        state.config_generation = Some(generation);
        let negotiated = state.negotiated;
        let Some(geometry) = state.geometry.as_mut() else {
            return;
        };
        let fresh = DiskGeometry::from_config(&config, negotiated, self.max_sg_elements);
        if fresh.capacity_sectors != geometry.capacity_sectors {
            tracing::debug!(
                old = geometry.capacity_sectors,
                new = fresh.capacity_sectors,
                "blk capacity changed"
            );
            self.capacity_changes.fetch_add(1, Ordering::Relaxed);
        }
        // seg_max sizes the indirect tables and stays fixed until reset.
        geometry.capacity_sectors = fresh.capacity_sectors;
        geometry.logical_block_size = fresh.logical_block_size;
    }

    pub fn diagnostics(&self) -> QueueDiagnostics {
        let state = self.state.lock();
        let mut diag = QueueDiagnostics {
            negotiated_features: state.negotiated,
            completed: self.completed.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            capacity_change_events: self.capacity_changes.load(Ordering::Relaxed),
            seg_max: self.seg_limit(),
            ..QueueDiagnostics::default()
        };
        if let Some(vq) = &state.vq {
            diag.queue_size = vq.size();
            diag.free_descriptors = vq.num_free();
            diag.avail_idx = vq.avail_idx();
            diag.used_idx = vq.used_idx();
            diag.last_used_idx = vq.last_used_idx();
            diag.indirect_free = vq.indirect_num_free();
            diag.malformed_used = vq.malformed_used();
        }
        if let Some(pool) = &state.pool {
            diag.free_contexts = pool.free_count;
        }
        if let Some(geometry) = &state.geometry {
            diag.capacity_sectors = geometry.capacity_sectors;
            diag.logical_block_size = geometry.logical_block_size;
        }
        diag
    }
}

impl<R: Send> InterruptCallbacks for BlkRequestQueue<R> {
    fn config_change(&self) {
        self.refresh_config();
    }

    fn drain_queue(&self, queue: u16) {
        if queue == REQUEST_QUEUE {
            self.drain();
        }
    }
}
