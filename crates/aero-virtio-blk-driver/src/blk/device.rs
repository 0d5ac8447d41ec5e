use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};

use aero_virtio_protocol::*;

use super::{
    read_blk_config, BlkRequestQueue, CompletionSink, DataSegment, DiskGeometry, QueueDiagnostics, Rejected,
    RequestKind, DEFAULT_QUEUE_SIZE, MAX_SG_ELEMENTS, REQUEST_QUEUE,
};
use crate::caps::{parse_virtio_caps, LayoutMode, PciIdentity};
use crate::dma::DmaAllocator;
use crate::error::CapLayoutError;
use crate::hw::{RegisterWindow, Stall};
use crate::interrupts::{
    InterruptCallbacks, InterruptMode, InterruptMultiplexer, InterruptResources, InterruptStats,
};
use crate::transport::{DeviceStatus, ModernTransport, TransportOptions};
use crate::{Result, VirtioError};

/// Features a blk device must offer.
pub const BLK_REQUIRED_FEATURES: u64 = VIRTIO_BLK_F_SEG_MAX | VIRTIO_BLK_F_BLK_SIZE | VIRTIO_BLK_F_FLUSH;

/// Accepted when offered.
const BLK_OPTIONAL_FEATURES: u64 = VIRTIO_BLK_F_SIZE_MAX | VIRTIO_BLK_F_RO;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlkOptions {
    pub transport: TransportOptions,
    /// Strict layouts require queue 0 to report exactly this size.
    pub queue_size: u16,
    pub max_sg_elements: u32,
    /// Require `VIRTIO_F_RING_INDIRECT_DESC` and publish every chain through
    /// an indirect table.
    pub use_indirect: bool,
    /// Try message-signaled interrupts before the line.
    pub use_msix: bool,
}

impl Default for BlkOptions {
    fn default() -> Self {
        Self {
            transport: TransportOptions::default(),
            queue_size: DEFAULT_QUEUE_SIZE,
            max_sg_elements: MAX_SG_ELEMENTS,
            use_indirect: true,
            use_msix: true,
        }
    }
}

impl BlkOptions {
    fn required_features(&self) -> u64 {
        if self.use_indirect {
            BLK_REQUIRED_FEATURES | VIRTIO_F_RING_INDIRECT_DESC
        } else {
            BLK_REQUIRED_FEATURES
        }
    }

    fn validate(&self) -> Result<()> {
        if self.max_sg_elements == 0 || self.max_sg_elements > MAX_SG_ELEMENTS {
            return Err(VirtioError::InvalidRequest("max_sg_elements must be within 1..=128"));
        }
        if self.queue_size == 0 || !self.queue_size.is_power_of_two() {
            return Err(VirtioError::InvalidRequest("queue size must be a non-zero power of two"));
        }
        Ok(())
    }
}

/// Everything the diagnostic query reports. Readable in any device state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlkDiagnostics {
    pub queue: QueueDiagnostics,
    /// `None` once the device is removed.
    pub device_status: Option<DeviceStatus>,
    pub interrupt_mode: Option<InterruptMode>,
    pub msix_config_vector: u16,
    pub msix_queue_vector: u16,
    pub interrupts: InterruptStats,
    pub resets: u32,
    pub removed: bool,
    pub failed: bool,
}

/// One virtio-blk PCI function, from attach to detach.
///
/// Submission and interrupt entry points take `&self`; only
/// [`initialize`](Self::initialize) needs exclusive access.
pub struct BlkDevice<R: Send + 'static> {
    identity: PciIdentity,
    transport: Arc<ModernTransport>,
    queue: Arc<BlkRequestQueue<R>>,
    dma: Arc<dyn DmaAllocator>,
    options: BlkOptions,
    interrupts: Option<InterruptMultiplexer>,
    resets: AtomicU32,
}

impl<R: Send + 'static> BlkDevice<R> {
    /// Validates the PCI identity and capability layout and binds the
    /// transport to the mapped BAR0. The device is not touched.
    pub fn attach(
        pci_config: &[u8; 256],
        bars: &[u64; 6],
        bar0: Arc<dyn RegisterWindow>,
        stall: Arc<dyn Stall>,
        dma: Arc<dyn DmaAllocator>,
        sink: Arc<dyn CompletionSink<R>>,
        options: BlkOptions,
    ) -> Result<Self> {
        options.validate()?;
        let mode = options.transport.layout;
        let identity = PciIdentity::read(pci_config);
        identity.validate(mode)?;
        let caps = parse_virtio_caps(pci_config, bars, mode)?;
        let transport = Arc::new(ModernTransport::new(bar0, caps, options.transport, stall)?);
        let queue = Arc::new(BlkRequestQueue::new(transport.clone(), sink, options.max_sg_elements));

        tracing::debug!(
            device_id = format_args!("{:#06x}", identity.device_id),
            revision = identity.revision_id,
            ?mode,
            "virtio-blk attached"
        );
        Ok(Self {
            identity,
            transport,
            queue,
            dma,
            options,
            interrupts: None,
            resets: AtomicU32::new(0),
        })
    }

    pub fn identity(&self) -> &PciIdentity {
        &self.identity
    }

    pub fn transport(&self) -> &Arc<ModernTransport> {
        &self.transport
    }

    pub fn queue(&self) -> &Arc<BlkRequestQueue<R>> {
        &self.queue
    }

    pub fn options(&self) -> &BlkOptions {
        &self.options
    }

    pub fn interrupts(&self) -> Option<&InterruptMultiplexer> {
        self.interrupts.as_ref()
    }

    pub fn geometry(&self) -> Option<DiskGeometry> {
        self.queue.geometry()
    }

    pub fn negotiated_features(&self) -> u64 {
        self.queue.negotiated_features()
    }

    /// Brings the device to DRIVER_OK.
    ///
    /// Interrupt routing falls back from one vector per cause, to a single
    /// shared message, to the line when MSI-X programming does not read back.
    /// On failure the device is marked FAILED and submissions report
    /// `NotReady`.
    pub fn initialize(&mut self, resources: &InterruptResources) -> Result<()> {
        if self.interrupts.is_some() {
            return Err(VirtioError::InvalidRequest("device already initialized"));
        }
        let result = self.bring_up().and_then(|()| self.connect_interrupts(resources));
        match result {
            Ok(mux) => {
                self.transport.add_status(DeviceStatus::DRIVER_OK);
                tracing::debug!(mode = ?mux.mode(), "virtio-blk ready");
                self.interrupts = Some(mux);
                Ok(())
            }
            Err(err) => {
                self.fail(&err);
                Err(err)
            }
        }
    }

    /// Negotiates, reads the blk config, (re)builds the engine and programs
    /// queue 0. Leaves the device at FEATURES_OK.
    fn bring_up(&self) -> Result<()> {
        let negotiated = self
            .transport
            .negotiate_features(self.options.required_features(), BLK_OPTIONAL_FEATURES)?;
        let (config, generation) = read_blk_config(&self.transport)?;
        let geometry = DiskGeometry::from_config(&config, negotiated, self.options.max_sg_elements);

        let info = self.transport.query_queue(REQUEST_QUEUE)?;
        if self.options.transport.layout == LayoutMode::Strict && info.size != self.options.queue_size {
            return Err(VirtioError::UnsupportedDevice("queue 0 size differs from the configured queue size"));
        }
        let rings = self.queue.prepare(&*self.dma, info, negotiated, geometry, generation)?;
        self.transport.setup_queue(REQUEST_QUEUE, rings.desc, rings.avail, rings.used)?;

        tracing::debug!(
            queue_size = info.size,
            capacity = geometry.capacity_sectors,
            block_size = geometry.logical_block_size,
            seg_max = geometry.seg_max,
            "virtio-blk queue configured"
        );
        Ok(())
    }

    fn connect_interrupts(&self, resources: &InterruptResources) -> Result<InterruptMultiplexer> {
        let callbacks: Arc<dyn InterruptCallbacks> = self.queue.clone();
        let mut last_err = VirtioError::Configuration(CapLayoutError::NoVectors);

        let messages = &resources.messages;
        if self.options.use_msix && !messages.is_empty() {
            let attempts: &[usize] = if messages.len() > 1 { &[2, 1] } else { &[1] };
            for &count in attempts {
                let mux = InterruptMultiplexer::with_messages(
                    self.transport.clone(),
                    &messages[..count],
                    1,
                    callbacks.clone(),
                )?;
                match mux.resume() {
                    Ok(()) => return Ok(mux),
                    Err(err @ VirtioError::HardwareError { .. }) => {
                        tracing::warn!(%err, vectors = count, "MSI-X routing rejected; falling back");
                        last_err = err;
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        match &resources.line {
            Some(line) => {
                let mux = InterruptMultiplexer::with_line(self.transport.clone(), line.clone(), 1, callbacks)?;
                mux.resume()?;
                Ok(mux)
            }
            None => Err(last_err),
        }
    }

    fn fail(&self, err: &VirtioError) {
        tracing::error!(%err, "virtio-blk bring-up failed");
        self.transport.fail_device();
        self.queue.mark_failed();
        self.queue.teardown();
    }

    /// Submits one request; see [`BlkRequestQueue::queue_request`].
    pub fn submit(
        &self,
        request: R,
        kind: RequestKind,
        sector: u64,
        data: &[DataSegment],
    ) -> core::result::Result<(), Rejected<R>> {
        self.queue.queue_request(request, kind, sector, data)
    }

    /// Top half for `message` (0 in line mode). A removed device claims nothing.
    pub fn service_interrupt(&self, message: u16) -> bool {
        if self.queue.is_removed() {
            return false;
        }
        self.interrupts
            .as_ref()
            .is_some_and(|mux| mux.service_interrupt(message))
    }

    /// Bottom half for `message`.
    pub fn run_deferred(&self, message: u16) {
        if let Some(mux) = &self.interrupts {
            mux.run_deferred(message);
        }
    }

    /// Quiesce, reset the device, abort everything in flight, renegotiate,
    /// rebuild the ring and resume.
    pub fn reset(&self) -> Result<()> {
        let mux = self
            .interrupts
            .as_ref()
            .ok_or(VirtioError::NotReady("device not initialized"))?;

        self.queue.set_resetting(true);
        if let Err(err) = mux.quiesce() {
            tracing::debug!(%err, "continuing reset after quiesce error");
        }
        self.resets.fetch_add(1, Ordering::Relaxed);

        let result = self
            .transport
            .reset()
            .and_then(|()| {
                self.queue.abort_all();
                self.bring_up()
            })
            .and_then(|()| mux.resume());

        let outcome = match result {
            Ok(()) => {
                self.transport.add_status(DeviceStatus::DRIVER_OK);
                tracing::debug!("virtio-blk reset complete");
                Ok(())
            }
            Err(err) => {
                self.fail(&err);
                Err(err)
            }
        };
        self.queue.set_resetting(false);
        outcome
    }

    /// Orderly removal: refuse new work, stop interrupts, stop the device and
    /// abort whatever is still in flight.
    pub fn detach(&self) {
        self.queue.mark_removed();
        if let Some(mux) = &self.interrupts {
            if let Err(err) = mux.quiesce() {
                tracing::debug!(%err, "quiesce failed during detach");
            }
        }
        if let Err(err) = self.transport.reset() {
            tracing::warn!(%err, "device did not complete reset during detach");
        }
        self.queue.abort_all();
    }

    /// The function is already gone: no register access, just refuse new
    /// work and abort what is in flight.
    pub fn surprise_removal(&self) {
        self.queue.mark_removed();
        if let Some(mux) = &self.interrupts {
            mux.halt();
        }
        self.queue.abort_all();
    }

    /// Once the device is removed the register file is not read; the status
    /// is reported as unknown and the vectors as recorded in the routing plan.
    pub fn diagnostics(&self) -> BlkDiagnostics {
        let mux = self.interrupts.as_ref();
        let (device_status, msix_config_vector, msix_queue_vector) = if self.queue.is_removed() {
            let plan = mux.and_then(InterruptMultiplexer::vector_plan);
            (
                None,
                plan.map_or(VIRTIO_MSI_NO_VECTOR, |plan| plan.config_vector),
                plan.and_then(|plan| plan.queue_vectors.get(usize::from(REQUEST_QUEUE)).copied())
                    .unwrap_or(VIRTIO_MSI_NO_VECTOR),
            )
        } else {
            (
                Some(self.transport.get_status()),
                self.transport.read_config_msix_vector(),
                self.transport.read_queue_msix_vector(REQUEST_QUEUE),
            )
        };
        BlkDiagnostics {
            queue: self.queue.diagnostics(),
            device_status,
            interrupt_mode: mux.map(InterruptMultiplexer::mode),
            msix_config_vector,
            msix_queue_vector,
            interrupts: mux.map(InterruptMultiplexer::stats).unwrap_or_default(),
            resets: self.resets.load(Ordering::Relaxed),
            removed: self.queue.is_removed(),
            failed: self.queue.is_failed(),
        }
    }
}
