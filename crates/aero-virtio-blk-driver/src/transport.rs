//! virtio-pci modern transport: status, features, queues, doorbells, ISR and
//! device-specific config.
//!
//! The common-config block has two selector registers (feature half and queue
//! index) whose value changes the meaning of later accesses. Every sequence
//! that depends on a selector runs under [`ModernTransport`]'s selector lock,
//! so callers only ever see whole operations.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};

use aero_virtio_protocol::*;
use bitflags::bitflags;
use spin::Mutex;

use crate::caps::{LayoutMode, VirtioPciCaps};
use crate::error::CapLayoutError;
use crate::hw::{mb, rmb, RegisterWindow, Stall};
use crate::{Result, VirtioError};

bitflags! {
    /// `device_status` register bits.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct DeviceStatus: u8 {
        const ACKNOWLEDGE = VIRTIO_STATUS_ACKNOWLEDGE;
        const DRIVER = VIRTIO_STATUS_DRIVER;
        const DRIVER_OK = VIRTIO_STATUS_DRIVER_OK;
        const FEATURES_OK = VIRTIO_STATUS_FEATURES_OK;
        const DEVICE_NEEDS_RESET = VIRTIO_STATUS_DEVICE_NEEDS_RESET;
        const FAILED = VIRTIO_STATUS_FAILED;
    }
}

/// Ring features this transport never negotiates: split rings only, and the
/// engine always notifies.
pub const FORBIDDEN_RING_FEATURES: u64 = VIRTIO_F_RING_EVENT_IDX | VIRTIO_F_RING_PACKED;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TransportOptions {
    pub layout: LayoutMode,
    /// Upper bound on waiting for `device_status` to read 0 after a reset.
    pub reset_timeout_us: u32,
    pub reset_poll_interval_us: u32,
    /// Attempts at a generation-stable device-config read before giving up.
    pub config_read_retries: u32,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            layout: LayoutMode::Strict,
            reset_timeout_us: 1_000_000,
            reset_poll_interval_us: 1_000,
            config_read_retries: 10,
        }
    }
}

impl TransportOptions {
    pub fn compat() -> Self {
        Self {
            layout: LayoutMode::Compat,
            ..Self::default()
        }
    }
}

/// What the device reports for one queue.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct QueueInfo {
    pub size: u16,
    pub notify_off: u16,
}

const NUM_QUEUES_UNKNOWN: u32 = u32::MAX;

pub struct ModernTransport {
    bar: Arc<dyn RegisterWindow>,
    caps: VirtioPciCaps,
    options: TransportOptions,
    stall: Arc<dyn Stall>,
    selector: Mutex<()>,
    /// `num_queues` latched after FEATURES_OK; cleared by reset.
    num_queues: AtomicU32,
}

impl ModernTransport {
    /// Binds to the mapped BAR that holds every window in `caps`.
    pub fn new(
        bar: Arc<dyn RegisterWindow>,
        caps: VirtioPciCaps,
        options: TransportOptions,
        stall: Arc<dyn Stall>,
    ) -> Result<Self> {
        caps.check_bar_len(bar.len(), options.layout)?;
        Ok(Self {
            bar,
            caps,
            options,
            stall,
            selector: Mutex::new(()),
            num_queues: AtomicU32::new(NUM_QUEUES_UNKNOWN),
        })
    }

    pub fn caps(&self) -> &VirtioPciCaps {
        &self.caps
    }

    pub fn options(&self) -> &TransportOptions {
        &self.options
    }

    fn common_read_u8(&self, reg: u32) -> u8 {
        self.bar.read_u8(self.caps.common.offset + reg)
    }

    fn common_read_u16(&self, reg: u32) -> u16 {
        self.bar.read_u16(self.caps.common.offset + reg)
    }

    fn common_read_u32(&self, reg: u32) -> u32 {
        self.bar.read_u32(self.caps.common.offset + reg)
    }

    fn common_write_u8(&self, reg: u32, value: u8) {
        self.bar.write_u8(self.caps.common.offset + reg, value);
        mb();
    }

    fn common_write_u16(&self, reg: u32, value: u16) {
        self.bar.write_u16(self.caps.common.offset + reg, value);
        mb();
    }

    fn common_write_u32(&self, reg: u32, value: u32) {
        self.bar.write_u32(self.caps.common.offset + reg, value);
        mb();
    }

    fn common_write_u64(&self, reg: u32, value: u64) {
        self.common_write_u32(reg, value as u32);
        self.common_write_u32(reg + 4, (value >> 32) as u32);
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    pub fn get_status(&self) -> DeviceStatus {
        mb();
        DeviceStatus::from_bits_retain(self.common_read_u8(COMMON_CFG_DEVICE_STATUS))
    }

    pub fn set_status(&self, status: DeviceStatus) {
        self.common_write_u8(COMMON_CFG_DEVICE_STATUS, status.bits());
    }

    pub fn add_status(&self, bits: DeviceStatus) {
        let status = self.get_status() | bits;
        self.set_status(status);
    }

    /// Marks the device FAILED without clearing any other status bit.
    pub fn fail_device(&self) {
        tracing::error!(status = ?self.get_status(), "marking virtio device FAILED");
        self.add_status(DeviceStatus::FAILED);
    }

    /// Writes 0 to `device_status` and waits, bounded, for the device to finish
    /// resetting.
    pub fn reset(&self) -> Result<()> {
        self.num_queues.store(NUM_QUEUES_UNKNOWN, Ordering::Release);
        self.set_status(DeviceStatus::empty());
        if self.get_status().is_empty() {
            return Ok(());
        }

        let interval = self.options.reset_poll_interval_us.max(1);
        let polls = (self.options.reset_timeout_us / interval).max(1);
        for _ in 0..polls {
            self.stall.stall_us(interval);
            if self.get_status().is_empty() {
                return Ok(());
            }
        }

        tracing::warn!(
            timeout_us = self.options.reset_timeout_us,
            status = ?self.get_status(),
            "virtio device did not complete reset"
        );
        Err(VirtioError::Timeout("device reset"))
    }

    pub fn config_generation(&self) -> u8 {
        mb();
        self.common_read_u8(COMMON_CFG_CONFIG_GENERATION)
    }

    // -----------------------------------------------------------------------
    // Features
    // -----------------------------------------------------------------------

    pub fn read_device_features(&self) -> u64 {
        let _selector = self.selector.lock();
        self.common_write_u32(COMMON_CFG_DEVICE_FEATURE_SELECT, 0);
        let lo = self.common_read_u32(COMMON_CFG_DEVICE_FEATURE);
        self.common_write_u32(COMMON_CFG_DEVICE_FEATURE_SELECT, 1);
        let hi = self.common_read_u32(COMMON_CFG_DEVICE_FEATURE);
        u64::from(lo) | (u64::from(hi) << 32)
    }

    pub fn write_driver_features(&self, features: u64) {
        let _selector = self.selector.lock();
        self.common_write_u32(COMMON_CFG_DRIVER_FEATURE_SELECT, 0);
        self.common_write_u32(COMMON_CFG_DRIVER_FEATURE, features as u32);
        self.common_write_u32(COMMON_CFG_DRIVER_FEATURE_SELECT, 1);
        self.common_write_u32(COMMON_CFG_DRIVER_FEATURE, (features >> 32) as u32);
    }

    /// Reads back the driver feature word the device latched.
    pub fn read_driver_features(&self) -> u64 {
        let _selector = self.selector.lock();
        self.common_write_u32(COMMON_CFG_DRIVER_FEATURE_SELECT, 0);
        let lo = self.common_read_u32(COMMON_CFG_DRIVER_FEATURE);
        self.common_write_u32(COMMON_CFG_DRIVER_FEATURE_SELECT, 1);
        let hi = self.common_read_u32(COMMON_CFG_DRIVER_FEATURE);
        u64::from(lo) | (u64::from(hi) << 32)
    }

    /// Runs the virtio 1.0 initialization sequence up to FEATURES_OK.
    ///
    /// `VIRTIO_F_VERSION_1` is always required. On return the status register
    /// has either FEATURES_OK or FAILED set.
    pub fn negotiate_features(&self, required: u64, wanted: u64) -> Result<u64> {
        if required & FORBIDDEN_RING_FEATURES != 0 {
            self.fail_device();
            return Err(VirtioError::InvalidRequest("required features include a forbidden ring feature"));
        }
        let required = required | VIRTIO_F_VERSION_1;
        let wanted = wanted & !FORBIDDEN_RING_FEATURES;

        if let Err(err) = self.reset() {
            self.fail_device();
            return Err(err);
        }
        self.add_status(DeviceStatus::ACKNOWLEDGE);
        self.add_status(DeviceStatus::DRIVER);

        let device = self.read_device_features();
        if device & VIRTIO_F_VERSION_1 == 0 {
            self.fail_device();
            return Err(VirtioError::UnsupportedDevice("device does not offer VIRTIO_F_VERSION_1"));
        }
        if self.options.layout == LayoutMode::Strict && device & VIRTIO_F_RING_PACKED != 0 {
            self.fail_device();
            return Err(VirtioError::UnsupportedDevice("device offers VIRTIO_F_RING_PACKED"));
        }
        if device & required != required {
            tracing::warn!(
                device = format_args!("{device:#x}"),
                missing = format_args!("{:#x}", required & !device),
                "virtio device lacks required features"
            );
            self.fail_device();
            return Err(VirtioError::UnsupportedDevice("device does not offer every required feature"));
        }

        let negotiated = (device & wanted) | required;
        self.write_driver_features(negotiated);
        self.add_status(DeviceStatus::FEATURES_OK);
        if !self.get_status().contains(DeviceStatus::FEATURES_OK) {
            self.fail_device();
            return Err(VirtioError::UnsupportedDevice("device rejected FEATURES_OK"));
        }

        let num_queues = self.common_read_u16(COMMON_CFG_NUM_QUEUES);
        self.num_queues.store(u32::from(num_queues), Ordering::Release);

        tracing::debug!(
            device = format_args!("{device:#x}"),
            negotiated = format_args!("{negotiated:#x}"),
            num_queues,
            "virtio features negotiated"
        );
        Ok(negotiated)
    }

    /// `num_queues` as latched at FEATURES_OK, or the live register before that.
    pub fn num_queues(&self) -> u16 {
        match self.num_queues.load(Ordering::Acquire) {
            NUM_QUEUES_UNKNOWN => self.common_read_u16(COMMON_CFG_NUM_QUEUES),
            n => n as u16,
        }
    }

    // -----------------------------------------------------------------------
    // Queues
    // -----------------------------------------------------------------------

    /// Selects `queue` and returns its size and notify offset. Caller holds the selector lock.
    fn select_queue_locked(&self, queue: u16) -> Result<QueueInfo> {
        self.common_write_u16(COMMON_CFG_QUEUE_SELECT, queue);
        let size = self.common_read_u16(COMMON_CFG_QUEUE_SIZE);
        if size == 0 {
            return Err(VirtioError::NotFound(queue));
        }
        let notify_off = self.common_read_u16(COMMON_CFG_QUEUE_NOTIFY_OFF);
        self.check_notify_off(queue, notify_off)?;
        Ok(QueueInfo { size, notify_off })
    }

    fn check_notify_off(&self, queue: u16, notify_off: u16) -> Result<()> {
        let end = u64::from(notify_off) * u64::from(self.caps.notify_off_multiplier) + 2;
        let strict_mismatch = self.options.layout == LayoutMode::Strict && notify_off != queue;
        if strict_mismatch || end > u64::from(self.caps.notify.length) {
            return Err(CapLayoutError::NotifyOffset { queue, notify_off }.into());
        }
        Ok(())
    }

    pub fn query_queue(&self, queue: u16) -> Result<QueueInfo> {
        if queue >= self.num_queues() {
            return Err(VirtioError::NotFound(queue));
        }
        let _selector = self.selector.lock();
        self.select_queue_locked(queue)
    }

    /// Programs the three ring addresses of `queue` and enables it.
    pub fn setup_queue(&self, queue: u16, desc: u64, avail: u64, used: u64) -> Result<QueueInfo> {
        if queue >= self.num_queues() {
            return Err(VirtioError::NotFound(queue));
        }
        let _selector = self.selector.lock();
        let info = self.select_queue_locked(queue)?;

        self.common_write_u64(COMMON_CFG_QUEUE_DESC, desc);
        self.common_write_u64(COMMON_CFG_QUEUE_AVAIL, avail);
        self.common_write_u64(COMMON_CFG_QUEUE_USED, used);
        mb();
        self.common_write_u16(COMMON_CFG_QUEUE_ENABLE, 1);

        let enabled = self.common_read_u16(COMMON_CFG_QUEUE_ENABLE);
        if enabled != 1 {
            return Err(VirtioError::HardwareError {
                register: "queue_enable",
                wrote: 1,
                read: enabled.into(),
            });
        }
        Ok(info)
    }

    /// Disables an existing queue. Absent queues are left alone.
    pub fn disable_queue(&self, queue: u16) -> Result<()> {
        if queue >= self.num_queues() {
            return Err(VirtioError::NotFound(queue));
        }
        let _selector = self.selector.lock();
        self.common_write_u16(COMMON_CFG_QUEUE_SELECT, queue);
        if self.common_read_u16(COMMON_CFG_QUEUE_SIZE) != 0 {
            self.common_write_u16(COMMON_CFG_QUEUE_ENABLE, 0);
        }
        Ok(())
    }

    /// Rings the doorbell for `queue`. Out-of-range offsets are dropped.
    pub fn notify_queue(&self, queue: u16, notify_off: u16) {
        let off = u64::from(notify_off) * u64::from(self.caps.notify_off_multiplier);
        if off + 2 > u64::from(self.caps.notify.length) {
            return;
        }
        mb();
        self.bar.write_u16(self.caps.notify.offset + off as u32, queue);
        mb();
    }

    // -----------------------------------------------------------------------
    // Interrupt routing
    // -----------------------------------------------------------------------

    /// Reads (and thereby clears) the ISR status byte.
    pub fn read_isr(&self) -> u8 {
        mb();
        self.bar.read_u8(self.caps.isr.offset)
    }

    pub fn set_config_msix_vector(&self, vector: u16) -> Result<()> {
        let _selector = self.selector.lock();
        self.common_write_u16(COMMON_CFG_MSIX_CONFIG, vector);
        check_vector("msix_config", vector, self.common_read_u16(COMMON_CFG_MSIX_CONFIG))
    }

    pub fn set_queue_msix_vector(&self, queue: u16, vector: u16) -> Result<()> {
        let _selector = self.selector.lock();
        self.common_write_u16(COMMON_CFG_QUEUE_SELECT, queue);
        self.common_write_u16(COMMON_CFG_QUEUE_MSIX_VECTOR, vector);
        check_vector("queue_msix_vector", vector, self.common_read_u16(COMMON_CFG_QUEUE_MSIX_VECTOR))
    }

    pub fn read_config_msix_vector(&self) -> u16 {
        let _selector = self.selector.lock();
        self.common_read_u16(COMMON_CFG_MSIX_CONFIG)
    }

    pub fn read_queue_msix_vector(&self, queue: u16) -> u16 {
        let _selector = self.selector.lock();
        self.common_write_u16(COMMON_CFG_QUEUE_SELECT, queue);
        self.common_read_u16(COMMON_CFG_QUEUE_MSIX_VECTOR)
    }

    // -----------------------------------------------------------------------
    // Device-specific config
    // -----------------------------------------------------------------------

    fn device_cfg_range(&self, offset: u32, len: usize) -> Result<u32> {
        let end = u64::from(offset) + len as u64;
        if end > u64::from(self.caps.device.length) {
            return Err(VirtioError::InvalidRequest("device config access out of range"));
        }
        Ok(self.caps.device.offset + offset)
    }

    fn copy_from_device_cfg(&self, base: u32, buf: &mut [u8]) {
        let mut i = 0usize;
        while i < buf.len() {
            let addr = base + i as u32;
            let left = buf.len() - i;
            if addr % 4 == 0 && left >= 4 {
                buf[i..i + 4].copy_from_slice(&self.bar.read_u32(addr).to_le_bytes());
                i += 4;
            } else if addr % 2 == 0 && left >= 2 {
                buf[i..i + 2].copy_from_slice(&self.bar.read_u16(addr).to_le_bytes());
                i += 2;
            } else {
                buf[i] = self.bar.read_u8(addr);
                i += 1;
            }
        }
    }

    /// Generation-guarded read of device-specific config.
    ///
    /// Returns the `config_generation` the copy is consistent with.
    pub fn read_device_config(&self, offset: u32, buf: &mut [u8]) -> Result<u8> {
        let base = self.device_cfg_range(offset, buf.len())?;
        for _ in 0..self.options.config_read_retries.max(1) {
            let before = self.config_generation();
            rmb();
            self.copy_from_device_cfg(base, buf);
            rmb();
            if self.config_generation() == before {
                return Ok(before);
            }
        }
        Err(VirtioError::Timeout("stable device config generation"))
    }

    /// Writes device-specific config, retrying if the generation moves underneath.
    pub fn write_device_config(&self, offset: u32, data: &[u8]) -> Result<()> {
        let base = self.device_cfg_range(offset, data.len())?;
        for _ in 0..self.options.config_read_retries.max(1) {
            let before = self.config_generation();
            for (i, b) in data.iter().enumerate() {
                self.bar.write_u8(base + i as u32, *b);
            }
            mb();
            if self.config_generation() == before {
                return Ok(());
            }
        }
        Err(VirtioError::Timeout("stable device config generation"))
    }
}

fn check_vector(register: &'static str, wrote: u16, read: u16) -> Result<()> {
    if read != wrote {
        return Err(VirtioError::HardwareError {
            register,
            wrote: wrote.into(),
            read: read.into(),
        });
    }
    Ok(())
}
