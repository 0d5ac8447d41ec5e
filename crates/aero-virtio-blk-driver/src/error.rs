use thiserror::Error;

pub type Result<T, E = VirtioError> = core::result::Result<T, E>;

/// Reason a capability layout or PCI identity was rejected at attach time.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
pub enum CapLayoutError {
    #[error("unexpected PCI identity: {field} = {value:#x}")]
    Identity { field: &'static str, value: u32 },

    #[error("BAR0 is an I/O BAR; a memory BAR is required")]
    Bar0NotMemory,

    #[error("PCI status does not advertise a capability list")]
    NoCapabilityList,

    #[error("capability pointer {ptr:#04x} is misaligned or out of range")]
    BadCapabilityPointer { ptr: u8 },

    #[error("capability list loops back to {ptr:#04x}")]
    CapabilityLoop { ptr: u8 },

    #[error("capability list exceeds {limit} entries")]
    TooManyCapabilities { limit: usize },

    #[error("vendor capability at {ptr:#04x} is truncated (cap_len={cap_len})")]
    TruncatedCapability { ptr: u8, cap_len: u8 },

    #[error("capability at {ptr:#04x} references BAR {bar} which is not present")]
    BadBar { ptr: u8, bar: u8 },

    #[error("required {0} capability is missing")]
    MissingCapability(&'static str),

    #[error("notify_off_multiplier is {found}, expected {expected}")]
    NotifyMultiplier { found: u32, expected: u32 },

    #[error("{window} window is bar={bar} offset={offset:#x} len={length:#x}, outside the fixed layout")]
    WindowMismatch {
        window: &'static str,
        bar: u8,
        offset: u32,
        length: u32,
    },

    #[error("{window} window ends at {end:#x}, past the mapped BAR length {bar_len:#x}")]
    WindowOutsideBar {
        window: &'static str,
        end: u64,
        bar_len: u64,
    },

    #[error("queue {queue} notify_off {notify_off} is not usable with this notify window")]
    NotifyOffset { queue: u16, notify_off: u16 },

    #[error("device reports {queues} queues, more than the supported {limit}")]
    TooManyQueues { queues: u16, limit: u16 },

    #[error("message-signaled mode was selected with no vectors")]
    NoVectors,
}

/// Error taxonomy of the virtio-pci modern block driver.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
pub enum VirtioError {
    /// Malformed or missing capability layout; fatal at attach.
    #[error("invalid device configuration: {0}")]
    Configuration(#[from] CapLayoutError),

    /// Required feature missing or FEATURES_OK rejected. The device has been marked FAILED.
    #[error("unsupported device: {0}")]
    UnsupportedDevice(&'static str),

    /// A register write did not read back as written.
    #[error("hardware error: {register} wrote {wrote:#x}, read back {read:#x}")]
    HardwareError {
        register: &'static str,
        wrote: u32,
        read: u32,
    },

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("queue {0} does not exist")]
    NotFound(u16),

    /// Transient resource exhaustion; retry after a completion.
    #[error("resource busy: {0}")]
    Busy(&'static str),

    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),

    #[error("device not ready: {0}")]
    NotReady(&'static str),
}

impl VirtioError {
    /// Whether the caller should retry the same operation later.
    pub fn is_transient(&self) -> bool {
        matches!(self, VirtioError::Busy(_))
    }
}
