//! Interrupt demultiplexing and quiesce/resume.
//!
//! A device instance runs in exactly one of two modes, fixed at setup:
//!
//! - **Line**: one shared INTx line. The top half reads the read-to-clear ISR
//!   register, ORs the bits into a pending word and queues the single deferred
//!   unit, which takes-and-clears the word and dispatches per cause.
//! - **Messages**: MSI/MSI-X. With `1 + queue_count` vectors, vector 0 carries
//!   config changes and vector `i` carries queue `i - 1`; with fewer, a single
//!   vector carries everything. The top half never touches the ISR register.
//!
//! Deferred work runs config callbacks under the config lock and queue
//! callbacks under that queue's lock. Every deferred unit checks the reset flag
//! before doing anything and again after taking each lock, so after
//! [`InterruptMultiplexer::quiesce`] returns no callback runs until
//! [`InterruptMultiplexer::resume`].

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use aero_virtio_protocol::{VIRTIO_MSI_NO_VECTOR, VIRTIO_PCI_ISR_CONFIG, VIRTIO_PCI_ISR_QUEUE};
use spin::Mutex;

use crate::error::CapLayoutError;
use crate::transport::ModernTransport;
use crate::Result;

/// Queue masks are 64-bit.
pub const MAX_QUEUES: u16 = 64;

/// A host interrupt object (ISR + deferred procedure pair).
pub trait InterruptObject: Send + Sync {
    /// Queues the deferred unit. Returns `false` if it was already queued; the
    /// already-queued run will observe everything accumulated so far.
    fn queue_deferred(&self) -> bool;

    /// Stops delivery and waits until no ISR or deferred unit of this object is
    /// running.
    fn disable(&self);

    fn enable(&self);
}

/// Work dispatched from deferred context. Must not block indefinitely.
pub trait InterruptCallbacks: Send + Sync {
    fn config_change(&self);

    fn drain_queue(&self, queue: u16);
}

/// Interrupt objects the host connected for this function.
#[derive(Clone, Default)]
pub struct InterruptResources {
    pub line: Option<Arc<dyn InterruptObject>>,
    /// Indexed by message number.
    pub messages: Vec<Arc<dyn InterruptObject>>,
}

/// Which causes a vector (or the shared line) carries.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CauseMask {
    pub config: bool,
    pub queues: u64,
}

impl CauseMask {
    pub fn everything(queue_count: u16) -> Self {
        let queues = if queue_count >= 64 {
            u64::MAX
        } else {
            (1u64 << queue_count) - 1
        };
        Self { config: true, queues }
    }

    pub fn config_only() -> Self {
        Self {
            config: true,
            queues: 0,
        }
    }

    pub fn queue(queue: u16) -> Self {
        Self {
            config: false,
            queues: 1u64 << queue,
        }
    }

    pub fn serves_queue(&self, queue: u16) -> bool {
        queue < 64 && self.queues & (1u64 << queue) != 0
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InterruptMode {
    Line,
    Messages { vectors: u16 },
}

/// Vector assignment for message-signaled mode.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VectorPlan {
    pub causes: Vec<CauseMask>,
    pub config_vector: u16,
    /// `queue_vectors[q]` is the MSI-X entry programmed for queue `q`.
    pub queue_vectors: Vec<u16>,
}

impl VectorPlan {
    /// Uses one vector per cause when enough are available, otherwise a single
    /// shared vector.
    pub fn new(available: usize, queue_count: u16) -> Self {
        if available > usize::from(queue_count) {
            let mut causes = Vec::with_capacity(usize::from(queue_count) + 1);
            causes.push(CauseMask::config_only());
            causes.extend((0..queue_count).map(CauseMask::queue));
            Self {
                causes,
                config_vector: 0,
                queue_vectors: (1..=queue_count).collect(),
            }
        } else {
            Self {
                causes: alloc::vec![CauseMask::everything(queue_count)],
                config_vector: 0,
                queue_vectors: alloc::vec![0; usize::from(queue_count)],
            }
        }
    }
}

struct Vector {
    object: Arc<dyn InterruptObject>,
    causes: CauseMask,
}

enum Routing {
    Line { vector: Vector, pending: AtomicU8 },
    Messages { vectors: Vec<Vector>, plan: VectorPlan },
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct InterruptStats {
    pub interrupts: u32,
    pub deferred: u32,
    pub spurious: u32,
}

pub struct InterruptMultiplexer {
    transport: Arc<ModernTransport>,
    callbacks: Arc<dyn InterruptCallbacks>,
    routing: Routing,
    queue_count: u16,
    resetting: AtomicBool,
    config_lock: Mutex<()>,
    queue_locks: Vec<Mutex<()>>,
    interrupts: AtomicU32,
    deferred: AtomicU32,
    spurious: AtomicU32,
}

impl InterruptMultiplexer {
    /// Picks message-signaled mode when the host granted any messages,
    /// otherwise the line.
    ///
    /// The multiplexer starts quiesced; call [`resume`](Self::resume) to program
    /// routing and enable delivery.
    pub fn new(
        transport: Arc<ModernTransport>,
        resources: &InterruptResources,
        queue_count: u16,
        callbacks: Arc<dyn InterruptCallbacks>,
    ) -> Result<Self> {
        if !resources.messages.is_empty() {
            Self::with_messages(transport, &resources.messages, queue_count, callbacks)
        } else if let Some(line) = resources.line.clone() {
            Self::with_line(transport, line, queue_count, callbacks)
        } else {
            Err(CapLayoutError::NoVectors.into())
        }
    }

    pub fn with_line(
        transport: Arc<ModernTransport>,
        line: Arc<dyn InterruptObject>,
        queue_count: u16,
        callbacks: Arc<dyn InterruptCallbacks>,
    ) -> Result<Self> {
        check_queue_count(queue_count)?;
        let routing = Routing::Line {
            vector: Vector {
                object: line,
                causes: CauseMask::everything(queue_count),
            },
            pending: AtomicU8::new(0),
        };
        Ok(Self::build(transport, routing, queue_count, callbacks))
    }

    pub fn with_messages(
        transport: Arc<ModernTransport>,
        messages: &[Arc<dyn InterruptObject>],
        queue_count: u16,
        callbacks: Arc<dyn InterruptCallbacks>,
    ) -> Result<Self> {
        check_queue_count(queue_count)?;
        if messages.is_empty() {
            return Err(CapLayoutError::NoVectors.into());
        }
        let plan = VectorPlan::new(messages.len(), queue_count);
        let vectors = plan
            .causes
            .iter()
            .zip(messages)
            .map(|(&causes, object)| Vector {
                object: object.clone(),
                causes,
            })
            .collect();
        let routing = Routing::Messages { vectors, plan };
        Ok(Self::build(transport, routing, queue_count, callbacks))
    }

    fn build(
        transport: Arc<ModernTransport>,
        routing: Routing,
        queue_count: u16,
        callbacks: Arc<dyn InterruptCallbacks>,
    ) -> Self {
        let mode = match &routing {
            Routing::Line { .. } => InterruptMode::Line,
            Routing::Messages { vectors, .. } => InterruptMode::Messages {
                vectors: vectors.len() as u16,
            },
        };
        tracing::debug!(?mode, queue_count, "interrupt routing selected");
        Self {
            transport,
            callbacks,
            routing,
            queue_count,
            resetting: AtomicBool::new(true),
            config_lock: Mutex::new(()),
            queue_locks: (0..queue_count).map(|_| Mutex::new(())).collect(),
            interrupts: AtomicU32::new(0),
            deferred: AtomicU32::new(0),
            spurious: AtomicU32::new(0),
        }
    }

    pub fn mode(&self) -> InterruptMode {
        match &self.routing {
            Routing::Line { .. } => InterruptMode::Line,
            Routing::Messages { vectors, .. } => InterruptMode::Messages {
                vectors: vectors.len() as u16,
            },
        }
    }

    pub fn queue_count(&self) -> u16 {
        self.queue_count
    }

    /// Causes carried by `message` (always message 0 in line mode).
    pub fn cause_mask(&self, message: u16) -> Option<CauseMask> {
        match &self.routing {
            Routing::Line { vector, .. } => (message == 0).then_some(vector.causes),
            Routing::Messages { vectors, .. } => vectors.get(usize::from(message)).map(|v| v.causes),
        }
    }

    /// The recorded vector assignment; `None` in line mode.
    pub fn vector_plan(&self) -> Option<&VectorPlan> {
        match &self.routing {
            Routing::Line { .. } => None,
            Routing::Messages { plan, .. } => Some(plan),
        }
    }

    pub fn is_resetting(&self) -> bool {
        self.resetting.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> InterruptStats {
        InterruptStats {
            interrupts: self.interrupts.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            spurious: self.spurious.load(Ordering::Relaxed),
        }
    }

    fn objects(&self) -> impl Iterator<Item = &Arc<dyn InterruptObject>> {
        let vectors: &[Vector] = match &self.routing {
            Routing::Line { vector, .. } => core::slice::from_ref(vector),
            Routing::Messages { vectors, .. } => vectors,
        };
        vectors.iter().map(|v| &v.object)
    }

    /// Writes the recorded routing into `msix_config` / `queue_msix_vector`.
    ///
    /// Line mode routes everything to "no vector" so the device signals INTx.
    pub fn program_vectors(&self) -> Result<()> {
        match &self.routing {
            Routing::Line { .. } => self.clear_vectors(),
            Routing::Messages { plan, .. } => {
                self.transport.set_config_msix_vector(plan.config_vector)?;
                for (queue, &vector) in plan.queue_vectors.iter().enumerate() {
                    self.transport.set_queue_msix_vector(queue as u16, vector)?;
                }
                Ok(())
            }
        }
    }

    fn clear_vectors(&self) -> Result<()> {
        self.transport.set_config_msix_vector(VIRTIO_MSI_NO_VECTOR)?;
        for queue in 0..self.queue_count {
            self.transport.set_queue_msix_vector(queue, VIRTIO_MSI_NO_VECTOR)?;
        }
        Ok(())
    }

    /// Top half. Returns whether the interrupt belonged to this device.
    pub fn service_interrupt(&self, message: u16) -> bool {
        match &self.routing {
            Routing::Line { vector, pending } => {
                let isr = self.transport.read_isr();
                if isr == 0 {
                    self.spurious.fetch_add(1, Ordering::Relaxed);
                    return false;
                }
                self.interrupts.fetch_add(1, Ordering::Relaxed);
                if self.is_resetting() {
                    return true;
                }
                pending.fetch_or(isr, Ordering::AcqRel);
                vector.object.queue_deferred();
                true
            }
            Routing::Messages { vectors, .. } => {
                let Some(vector) = vectors.get(usize::from(message)) else {
                    return false;
                };
                self.interrupts.fetch_add(1, Ordering::Relaxed);
                if !self.is_resetting() {
                    vector.object.queue_deferred();
                }
                true
            }
        }
    }

    /// Bottom half for `message`.
    pub fn run_deferred(&self, message: u16) {
        self.deferred.fetch_add(1, Ordering::Relaxed);

        let (config, queues) = match &self.routing {
            Routing::Line { vector, pending } => {
                if self.is_resetting() {
                    pending.store(0, Ordering::Release);
                    return;
                }
                let isr = pending.swap(0, Ordering::AcqRel);
                let config = vector.causes.config && isr & VIRTIO_PCI_ISR_CONFIG != 0;
                let queues = if isr & VIRTIO_PCI_ISR_QUEUE != 0 {
                    vector.causes.queues
                } else {
                    0
                };
                (config, queues)
            }
            Routing::Messages { vectors, .. } => {
                if self.is_resetting() {
                    return;
                }
                let Some(vector) = vectors.get(usize::from(message)) else {
                    return;
                };
                (vector.causes.config, vector.causes.queues)
            }
        };

        if config {
            let _guard = self.config_lock.lock();
            if self.is_resetting() {
                return;
            }
            self.callbacks.config_change();
        }

        for (queue, lock) in self.queue_locks.iter().enumerate() {
            if queues & (1u64 << queue) == 0 {
                continue;
            }
            let _guard = lock.lock();
            if self.is_resetting() {
                return;
            }
            self.callbacks.drain_queue(queue as u16);
        }
    }

    /// Stops all interrupt-driven work.
    ///
    /// Sets the reset flag, disables every interrupt object, unroutes the MSI-X
    /// vectors (message mode) and finally takes and drops every config/queue lock
    /// so no deferred unit that got past its flag check is still running.
    /// Vector read-back failures are reported after the lock convoy completes.
    pub fn quiesce(&self) -> Result<()> {
        self.resetting.store(true, Ordering::SeqCst);
        for object in self.objects() {
            object.disable();
        }

        let unrouted = match &self.routing {
            Routing::Line { pending, .. } => {
                pending.store(0, Ordering::Release);
                Ok(())
            }
            Routing::Messages { .. } => self.clear_vectors(),
        };

        drop(self.config_lock.lock());
        for lock in &self.queue_locks {
            drop(lock.lock());
        }

        if let Err(err) = &unrouted {
            tracing::warn!(%err, "failed to unroute MSI-X vectors during quiesce");
        }
        unrouted
    }

    /// [`quiesce`](Self::quiesce) for a function that is already gone: stops
    /// delivery and waits out running deferred units, without touching the
    /// vector registers. Only [`resume`](Self::resume) undoes it.
    pub fn halt(&self) {
        self.resetting.store(true, Ordering::SeqCst);
        for object in self.objects() {
            object.disable();
        }
        if let Routing::Line { pending, .. } = &self.routing {
            pending.store(0, Ordering::Release);
        }

        drop(self.config_lock.lock());
        for lock in &self.queue_locks {
            drop(lock.lock());
        }
    }

    /// Re-programs the recorded routing, re-enables delivery and clears the
    /// reset flag. On a routing failure the multiplexer stays quiesced.
    pub fn resume(&self) -> Result<()> {
        self.program_vectors()?;
        for object in self.objects() {
            object.enable();
        }
        self.resetting.store(false, Ordering::SeqCst);
        Ok(())
    }
}

fn check_queue_count(queue_count: u16) -> Result<()> {
    if queue_count > MAX_QUEUES {
        return Err(CapLayoutError::TooManyQueues {
            queues: queue_count,
            limit: MAX_QUEUES,
        }
        .into());
    }
    Ok(())
}
