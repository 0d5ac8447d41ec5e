//! virtio-blk on top of the modern transport.
//!
//! [`BlkRequestQueue`] is the request engine for the single request queue;
//! [`BlkDevice`] owns a device instance from attach to detach.

mod device;
mod queue;

use aero_virtio_protocol::*;

use crate::transport::ModernTransport;
use crate::{Result, VirtioError};

pub use device::{BlkDevice, BlkDiagnostics, BlkOptions, BLK_REQUIRED_FEATURES};
pub use queue::{BlkRequestQueue, QueueDiagnostics, RingAddresses, REQUEST_QUEUE};

/// Absolute cap on data segments per request, independent of `seg_max`.
pub const MAX_SG_ELEMENTS: u32 = 128;

/// Queue size fixed by the device contract.
pub const DEFAULT_QUEUE_SIZE: u16 = 128;

pub const SCSI_SENSE_MEDIUM_ERROR: u8 = 0x03;
pub const SCSI_SENSE_ILLEGAL_REQUEST: u8 = 0x05;
pub const SCSI_SENSE_ABORTED_COMMAND: u8 = 0x0B;

pub const SCSI_ASC_WRITE_ERROR: u8 = 0x0C;
pub const SCSI_ASC_UNRECOVERED_READ_ERROR: u8 = 0x11;
pub const SCSI_ASC_INVALID_COMMAND_OPCODE: u8 = 0x20;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RequestKind {
    Read,
    Write,
    Flush,
    /// 20-byte device serial number.
    GetId,
}

impl RequestKind {
    pub fn req_type(self) -> u32 {
        match self {
            RequestKind::Read => VIRTIO_BLK_T_IN,
            RequestKind::Write => VIRTIO_BLK_T_OUT,
            RequestKind::Flush => VIRTIO_BLK_T_FLUSH,
            RequestKind::GetId => VIRTIO_BLK_T_GET_ID,
        }
    }

    /// Direction used when classifying a failed request.
    pub fn is_write(self) -> bool {
        matches!(self, RequestKind::Write | RequestKind::Flush)
    }

    /// Whether the device writes into the data segments.
    pub fn device_writes_data(self) -> bool {
        matches!(self, RequestKind::Read | RequestKind::GetId)
    }
}

/// One guest-physical data buffer of a request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DataSegment {
    pub addr: u64,
    pub len: u32,
}

/// Terminal outcome of a queued request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Completion {
    /// `bytes` is the used length minus the status byte.
    Success { bytes: u32 },
    /// The device answered `VIRTIO_BLK_S_UNSUPP`.
    IllegalRequest,
    /// Any other status, including a status byte the device never wrote.
    MediumError { write: bool },
    /// Synthesized while quiescing or resetting.
    Aborted,
}

/// Fixed-format SCSI sense triple reported for a failed completion.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SenseData {
    pub key: u8,
    pub asc: u8,
    pub ascq: u8,
}

impl Completion {
    pub(crate) fn from_status(status: u8, kind: RequestKind, used_len: u32) -> Self {
        match status {
            VIRTIO_BLK_S_OK => Completion::Success {
                bytes: used_len.saturating_sub(1),
            },
            VIRTIO_BLK_S_UNSUPP => Completion::IllegalRequest,
            _ => Completion::MediumError {
                write: kind.is_write(),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Completion::Success { .. })
    }

    pub fn sense(&self) -> Option<SenseData> {
        let (key, asc) = match *self {
            Completion::Success { .. } => return None,
            Completion::IllegalRequest => (SCSI_SENSE_ILLEGAL_REQUEST, SCSI_ASC_INVALID_COMMAND_OPCODE),
            Completion::MediumError { write: true } => (SCSI_SENSE_MEDIUM_ERROR, SCSI_ASC_WRITE_ERROR),
            Completion::MediumError { write: false } => (SCSI_SENSE_MEDIUM_ERROR, SCSI_ASC_UNRECOVERED_READ_ERROR),
            Completion::Aborted => (SCSI_SENSE_ABORTED_COMMAND, 0),
        };
        Some(SenseData { key, asc, ascq: 0 })
    }
}

/// A submission that was refused synchronously. The request is handed back
/// and will never reach the completion path.
#[derive(Debug)]
pub struct Rejected<R> {
    pub error: VirtioError,
    pub request: R,
}

impl<R> Rejected<R> {
    pub(crate) fn new(error: VirtioError, request: R) -> Self {
        Self { error, request }
    }
}

/// Receives every accepted request exactly once. Called from deferred
/// context (drain) or from the thread running reset/detach (aborts), never
/// with an engine lock held.
pub trait CompletionSink<R>: Send + Sync {
    fn complete(&self, request: R, completion: Completion);
}

impl<R, F> CompletionSink<R> for F
where
    F: Fn(R, Completion) + Send + Sync,
{
    fn complete(&self, request: R, completion: Completion) {
        self(request, completion)
    }
}

/// Disk parameters derived from the blk device config.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DiskGeometry {
    /// In 512-byte sectors.
    pub capacity_sectors: u64,
    pub logical_block_size: u32,
    /// Effective data-segment limit per request.
    pub seg_max: u32,
    pub size_max: u32,
    pub flush: bool,
    pub read_only: bool,
}

impl DiskGeometry {
    pub fn from_config(config: &VirtioBlkConfig, negotiated: u64, max_sg_elements: u32) -> Self {
        let logical_block_size = if negotiated & VIRTIO_BLK_F_BLK_SIZE != 0
            && config.blk_size != 0
            && config.blk_size % VIRTIO_BLK_SECTOR_SIZE == 0
        {
            config.blk_size
        } else {
            VIRTIO_BLK_SECTOR_SIZE
        };
        let seg_max = if negotiated & VIRTIO_BLK_F_SEG_MAX != 0 && config.seg_max != 0 {
            config.seg_max.min(max_sg_elements)
        } else {
            max_sg_elements
        };
        let size_max = if negotiated & VIRTIO_BLK_F_SIZE_MAX != 0 {
            config.size_max
        } else {
            0
        };
        Self {
            capacity_sectors: config.capacity,
            logical_block_size,
            seg_max,
            size_max,
            flush: negotiated & VIRTIO_BLK_F_FLUSH != 0,
            read_only: negotiated & VIRTIO_BLK_F_RO != 0,
        }
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_sectors.saturating_mul(u64::from(VIRTIO_BLK_SECTOR_SIZE))
    }

    pub(crate) fn check_transfer(&self, kind: RequestKind, sector: u64, bytes: u64) -> Result<()> {
        match kind {
            RequestKind::Flush if !self.flush => Err(VirtioError::InvalidRequest("flush was not negotiated")),
            RequestKind::Write if self.read_only => Err(VirtioError::InvalidRequest("device is read-only")),
            RequestKind::Read | RequestKind::Write => {
                let block = u64::from(self.logical_block_size);
                let sectors_per_block = block / u64::from(VIRTIO_BLK_SECTOR_SIZE);
                if bytes % block != 0 {
                    return Err(VirtioError::InvalidRequest(
                        "transfer length is not a whole number of logical blocks",
                    ));
                }
                if sector % sectors_per_block != 0 {
                    return Err(VirtioError::InvalidRequest(
                        "transfer does not start on a logical block boundary",
                    ));
                }
                let end = sector.checked_add(bytes / u64::from(VIRTIO_BLK_SECTOR_SIZE));
                if end.map_or(true, |end| end > self.capacity_sectors) {
                    return Err(VirtioError::InvalidRequest("transfer extends past the end of the device"));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// Generation-guarded read of the whole blk config block, returned with the
/// `config_generation` it is consistent with.
pub fn read_blk_config(transport: &ModernTransport) -> Result<(VirtioBlkConfig, u8)> {
    let mut raw = [0u8; VirtioBlkConfig::SIZE];
    let generation = transport.read_device_config(0, &mut raw)?;
    Ok((VirtioBlkConfig::from_le_bytes(&raw), generation))
}
