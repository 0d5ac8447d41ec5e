//! Virtio vendor-capability discovery from a snapshot of PCI config space.
//!
//! Parsing is a pure function of the 256-byte config block and the BAR base
//! table; the caller performs the config-space read.

use aero_virtio_protocol::*;

use crate::error::CapLayoutError;
use crate::Result;

/// Hard bound on the capability walk, independent of loop detection.
pub const MAX_CAPABILITIES: usize = 64;

/// How strictly the BAR0 layout is checked.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum LayoutMode {
    /// The fixed contract layout: every window in BAR0 at its fixed offset,
    /// notify multiplier 4, `queue_notify_off == queue index`.
    #[default]
    Strict,
    /// Any well-formed virtio 1.0 layout whose windows share one memory BAR.
    Compat,
}

/// One register window: `length` bytes at `offset` into BAR `bar`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CapWindow {
    pub bar: u8,
    pub offset: u32,
    pub length: u32,
}

impl CapWindow {
    pub fn end(&self) -> u64 {
        u64::from(self.offset) + u64::from(self.length)
    }
}

/// The four windows a modern virtio-pci device must expose.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct VirtioPciCaps {
    pub common: CapWindow,
    pub notify: CapWindow,
    pub notify_off_multiplier: u32,
    pub isr: CapWindow,
    pub device: CapWindow,
}

impl VirtioPciCaps {
    pub fn windows(&self) -> [(&'static str, CapWindow); 4] {
        [
            ("common", self.common),
            ("notify", self.notify),
            ("isr", self.isr),
            ("device", self.device),
        ]
    }

    /// Checks that every window lies inside a mapping of `bar_len` bytes.
    pub fn check_bar_len(&self, bar_len: u64, mode: LayoutMode) -> Result<()> {
        if mode == LayoutMode::Strict && bar_len < u64::from(CONTRACT_BAR0_MIN_LEN) {
            return Err(CapLayoutError::WindowOutsideBar {
                window: "bar0",
                end: u64::from(CONTRACT_BAR0_MIN_LEN),
                bar_len,
            }
            .into());
        }
        for (window, w) in self.windows() {
            if w.end() > bar_len {
                return Err(CapLayoutError::WindowOutsideBar {
                    window,
                    end: w.end(),
                    bar_len,
                }
                .into());
            }
        }
        Ok(())
    }
}

/// PCI identity fields relevant to binding.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PciIdentity {
    pub vendor_id: u16,
    pub device_id: u16,
    pub revision_id: u8,
    pub subsystem_vendor_id: u16,
    pub subsystem_id: u16,
    pub interrupt_pin: u8,
}

impl PciIdentity {
    pub fn read(cfg: &[u8; 256]) -> Self {
        Self {
            vendor_id: cfg_u16(cfg, PCI_CFG_VENDOR_ID),
            device_id: cfg_u16(cfg, PCI_CFG_DEVICE_ID),
            revision_id: cfg[PCI_CFG_REVISION_ID],
            subsystem_vendor_id: cfg_u16(cfg, PCI_CFG_SUBSYSTEM_VENDOR_ID),
            subsystem_id: cfg_u16(cfg, PCI_CFG_SUBSYSTEM_ID),
            interrupt_pin: cfg[PCI_CFG_INTERRUPT_PIN],
        }
    }

    /// Rejects anything that is not a modern virtio-blk function.
    pub fn validate(&self, mode: LayoutMode) -> Result<()> {
        if self.vendor_id != VIRTIO_PCI_VENDOR_ID {
            return Err(identity("vendor_id", self.vendor_id.into()));
        }
        if self.device_id != VIRTIO_PCI_DEVICE_ID_BLK_MODERN {
            return Err(identity("device_id", self.device_id.into()));
        }
        if mode == LayoutMode::Strict {
            if self.revision_id != VIRTIO_PCI_CONTRACT_REVISION {
                return Err(identity("revision_id", self.revision_id.into()));
            }
            // The contract requires a working INTx line.
            if self.interrupt_pin != 1 {
                return Err(identity("interrupt_pin", self.interrupt_pin.into()));
            }
        }
        Ok(())
    }
}

fn identity(field: &'static str, value: u32) -> crate::VirtioError {
    CapLayoutError::Identity { field, value }.into()
}

fn cfg_u16(cfg: &[u8; 256], off: usize) -> u16 {
    u16::from_le_bytes([cfg[off], cfg[off + 1]])
}

fn cfg_u32(cfg: &[u8; 256], off: usize) -> u32 {
    u32::from_le_bytes([cfg[off], cfg[off + 1], cfg[off + 2], cfg[off + 3]])
}

/// Walks the capability list and returns the four virtio windows.
///
/// The first capability of each type wins, as virtio 1.0 section 4.1.4 recommends.
/// `bars` holds the decoded base address of each BAR (0 = not present).
pub fn parse_virtio_caps(cfg: &[u8; 256], bars: &[u64; 6], mode: LayoutMode) -> Result<VirtioPciCaps> {
    if cfg_u16(cfg, PCI_CFG_STATUS) & PCI_STATUS_CAP_LIST == 0 {
        return Err(CapLayoutError::NoCapabilityList.into());
    }
    if mode == LayoutMode::Strict && cfg_u32(cfg, PCI_CFG_BAR0) & PCI_BAR_IO_SPACE != 0 {
        return Err(CapLayoutError::Bar0NotMemory.into());
    }

    let mut common = None;
    let mut notify = None;
    let mut isr = None;
    let mut device = None;

    let mut seen: u64 = 0;
    let mut walked = 0usize;
    let mut ptr = cfg[PCI_CFG_CAP_PTR];
    while ptr != 0 {
        if ptr & 0x3 != 0 || ptr < PCI_CAP_MIN_OFFSET {
            return Err(CapLayoutError::BadCapabilityPointer { ptr }.into());
        }
        let bit = 1u64 << (ptr >> 2);
        if seen & bit != 0 {
            return Err(CapLayoutError::CapabilityLoop { ptr }.into());
        }
        seen |= bit;
        walked += 1;
        if walked > MAX_CAPABILITIES {
            return Err(CapLayoutError::TooManyCapabilities { limit: MAX_CAPABILITIES }.into());
        }

        let base = usize::from(ptr);
        let cap_id = cfg[base];
        let next = cfg[base + 1];

        if cap_id == PCI_CAP_ID_VENDOR {
            let cap_len = cfg[base + 2];
            if cap_len < VIRTIO_PCI_CAP_LEN || base + usize::from(cap_len) > cfg.len() {
                return Err(CapLayoutError::TruncatedCapability { ptr, cap_len }.into());
            }

            let cfg_type = cfg[base + VIRTIO_PCI_CAP_CFG_TYPE_OFFSET];
            let slot = match cfg_type {
                VIRTIO_PCI_CAP_COMMON_CFG => Some(&mut common),
                VIRTIO_PCI_CAP_NOTIFY_CFG => Some(&mut notify),
                VIRTIO_PCI_CAP_ISR_CFG => Some(&mut isr),
                VIRTIO_PCI_CAP_DEVICE_CFG => Some(&mut device),
                _ => None,
            };

            if let Some(slot) = slot.filter(|s| s.is_none()) {
                let bar = cfg[base + VIRTIO_PCI_CAP_BAR_OFFSET];
                if usize::from(bar) >= bars.len() || bars[usize::from(bar)] == 0 {
                    return Err(CapLayoutError::BadBar { ptr, bar }.into());
                }
                let window = CapWindow {
                    bar,
                    offset: cfg_u32(cfg, base + VIRTIO_PCI_CAP_OFFSET_OFFSET),
                    length: cfg_u32(cfg, base + VIRTIO_PCI_CAP_LENGTH_OFFSET),
                };
                let multiplier = if cfg_type == VIRTIO_PCI_CAP_NOTIFY_CFG {
                    if cap_len < VIRTIO_PCI_NOTIFY_CAP_LEN {
                        return Err(CapLayoutError::TruncatedCapability { ptr, cap_len }.into());
                    }
                    cfg_u32(cfg, base + VIRTIO_PCI_NOTIFY_CAP_MULTIPLIER_OFFSET)
                } else {
                    0
                };
                *slot = Some((window, multiplier));
            }
        }

        ptr = next;
    }

    let (common, _) = common.ok_or(CapLayoutError::MissingCapability("common"))?;
    let (notify, notify_off_multiplier) = notify.ok_or(CapLayoutError::MissingCapability("notify"))?;
    let (isr, _) = isr.ok_or(CapLayoutError::MissingCapability("isr"))?;
    let (device, _) = device.ok_or(CapLayoutError::MissingCapability("device"))?;

    let caps = VirtioPciCaps {
        common,
        notify,
        notify_off_multiplier,
        isr,
        device,
    };

    match mode {
        LayoutMode::Strict => check_contract_layout(&caps)?,
        LayoutMode::Compat => {
            for (window, w) in caps.windows() {
                if w.bar != caps.common.bar || w.length == 0 {
                    return Err(CapLayoutError::WindowMismatch {
                        window,
                        bar: w.bar,
                        offset: w.offset,
                        length: w.length,
                    }
                    .into());
                }
            }
        }
    }

    Ok(caps)
}

fn check_contract_layout(caps: &VirtioPciCaps) -> Result<()> {
    if caps.notify_off_multiplier != CONTRACT_NOTIFY_OFF_MULTIPLIER {
        return Err(CapLayoutError::NotifyMultiplier {
            found: caps.notify_off_multiplier,
            expected: CONTRACT_NOTIFY_OFF_MULTIPLIER,
        }
        .into());
    }

    let expected = [
        (CONTRACT_COMMON_CFG_OFFSET, CONTRACT_COMMON_CFG_LEN),
        (CONTRACT_NOTIFY_CFG_OFFSET, CONTRACT_NOTIFY_CFG_LEN),
        (CONTRACT_ISR_CFG_OFFSET, CONTRACT_ISR_CFG_LEN),
        (CONTRACT_DEVICE_CFG_OFFSET, CONTRACT_DEVICE_CFG_LEN),
    ];
    for ((window, w), (offset, min_len)) in caps.windows().into_iter().zip(expected) {
        if w.bar != CONTRACT_BAR || w.offset != offset || w.length < min_len {
            return Err(CapLayoutError::WindowMismatch {
                window,
                bar: w.bar,
                offset: w.offset,
                length: w.length,
            }
            .into());
        }
    }
    Ok(())
}
