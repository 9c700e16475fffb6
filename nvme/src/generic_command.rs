//! Data shared between all Command types
//!

use core::mem::size_of;

use bit_field::BitField;
use shared_derive::U8Enum;
use static_assertions::const_assert_eq;
use thiserror::Error;

use crate::{dma::DeviceCopy, queue::QueueIdentifier};

#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct CommandIdentifier(pub(crate) u16);

impl CommandIdentifier {
    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    pub const fn as_u16(self) -> u16 {
        self.0
    }
}

impl core::fmt::LowerHex for CommandIdentifier {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::LowerHex::fmt(&self.0, f)
    }
}

impl core::fmt::UpperHex for CommandIdentifier {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::UpperHex::fmt(&self.0, f)
    }
}

/// The size of all submission command entries
pub const SUBMISSION_COMMAND_ENTRY_SIZE: usize = size_of::<CommonCommand>();
const_assert_eq!(SUBMISSION_COMMAND_ENTRY_SIZE, 64);

/// Command layout shared by all commands
///
/// See: NVM Express Base Spec: Figure 88: Common Command Format
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommonCommand {
    pub(crate) dword0: CDW0,
    // NSID
    pub(crate) namespace_ident: u32,
    pub(crate) dword2: u32,
    pub(crate) dword3: u32,
    pub(crate) metadata_ptr: u64,
    pub(crate) data_ptr: DataPtr,
    pub(crate) dword10: u32,
    pub(crate) dword11: u32,
    pub(crate) dword12: u32,
    pub(crate) dword13: u32,
    pub(crate) dword14: u32,
    pub(crate) dword15: u32,
}

// Safety: repr(C), only integer fields without padding
unsafe impl DeviceCopy for CommonCommand {}

impl CommonCommand {
    /// A zeroed command with `opcode`
    pub fn with_opcode(opcode: u8) -> Self {
        let mut command = Self::default();
        command.dword0.set_opcode(opcode);
        command
    }

    pub fn opcode(&self) -> u8 {
        self.dword0.opcode()
    }

    pub fn command_identifier(&self) -> CommandIdentifier {
        self.dword0.command_identifier()
    }

    pub(crate) fn set_command_identifier(&mut self, ident: CommandIdentifier) {
        self.dword0.set_command_identifier(ident);
    }

    pub fn prp_or_sgl(&self) -> Option<PrpOrSgl> {
        self.dword0.prp_or_sgl()
    }

    pub fn namespace(&self) -> u32 {
        self.namespace_ident
    }

    pub fn prp1(&self) -> u64 {
        self.data_ptr.prp_entry_1
    }

    pub fn prp2(&self) -> u64 {
        self.data_ptr.prp_entry_2
    }

    pub(crate) fn set_prp(&mut self, prp1: u64, prp2: u64) {
        self.dword0.set_prp_or_sgl(PrpOrSgl::Prp);
        self.data_ptr = DataPtr {
            prp_entry_1: prp1,
            prp_entry_2: prp2,
        };
    }

    /// Command dwords 10 to 15
    pub fn command_dwords(&self) -> [u32; 6] {
        [
            self.dword10,
            self.dword11,
            self.dword12,
            self.dword13,
            self.dword14,
            self.dword15,
        ]
    }
}

/// The first command dword in a [CommonCommand]
///
/// this implementation is shared between all commands
///
/// See: NVM Express Base Spec: Figure 87: Command Dword 0
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct CDW0(u32);

#[allow(dead_code)]
impl CDW0 {
    pub(crate) fn opcode(&self) -> u8 {
        self.0.get_bits(0..=7) as u8
    }

    pub(crate) fn set_opcode(&mut self, value: u8) {
        self.0.set_bits(0..=7, value as u32);
    }

    pub(crate) fn fuse(&self) -> u8 {
        self.0.get_bits(8..=9) as u8
    }

    pub(crate) fn set_fuse(&mut self, value: u8) {
        self.0.set_bits(8..=9, value as u32);
    }

    /// PSDT
    pub(crate) fn prp_or_sgl(&self) -> Option<PrpOrSgl> {
        PrpOrSgl::try_from(self.0.get_bits(14..=15) as u8).ok()
    }

    pub(crate) fn set_prp_or_sgl(&mut self, value: PrpOrSgl) {
        self.0.set_bits(14..=15, value as u8 as u32);
    }

    pub(crate) fn command_identifier(&self) -> CommandIdentifier {
        CommandIdentifier(self.0.get_bits(16..=31) as u16)
    }

    pub(crate) fn set_command_identifier(&mut self, value: CommandIdentifier) {
        self.0.set_bits(16..=31, value.0 as u32);
    }
}

/// specifies whether a command uses PRPs or SGLs for data transfer
///
/// Only PRPs are ever submitted. The SGL variants exist so that a command
/// read back from a queue can be decoded.
///
/// See: NVM Express Base Spec: Figure 87: Command Dword 0
#[repr(u8)]
#[derive(Debug, U8Enum, Clone, Copy, PartialEq, Eq)]
pub enum PrpOrSgl {
    Prp = 0,
    SglMetaContiguBuffer = 0b01,
    SglIncludingMeta = 0b10,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DataPtr {
    pub(crate) prp_entry_1: u64,
    pub(crate) prp_entry_2: u64,
}

/// The size of all completion command entries
pub const COMPLETION_COMMAND_ENTRY_SIZE: usize = size_of::<CommonCompletionEntry>();
const_assert_eq!(COMPLETION_COMMAND_ENTRY_SIZE, 16);

/// Offset of [StatusAndPhase] within a [CommonCompletionEntry]
pub(crate) const COMPLETION_STATUS_OFFSET: usize = 14;

/// Common layout shared by all completion entries
///
/// See: NVM Express Base Spec: Figure 90: Common Completion Queue Entry Layout
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommonCompletionEntry {
    pub(crate) dword0: u32,
    pub(crate) dword1: u32,
    pub(crate) submission_queue_head: u16,
    pub(crate) submission_queue_ident: u16,
    pub(crate) command_ident: CommandIdentifier,
    pub(crate) status_and_phase: StatusAndPhase,
}

// Safety: repr(C), only integer fields without padding
unsafe impl DeviceCopy for CommonCompletionEntry {}

impl CommonCompletionEntry {
    pub fn new(
        dword0: u32,
        submission_queue_head: u16,
        submission_queue: QueueIdentifier,
        command_ident: CommandIdentifier,
        status_and_phase: StatusAndPhase,
    ) -> Self {
        Self {
            dword0,
            dword1: 0,
            submission_queue_head,
            submission_queue_ident: submission_queue.as_u16(),
            command_ident,
            status_and_phase,
        }
    }

    /// Command specific result
    pub fn dword0(&self) -> u32 {
        self.dword0
    }

    pub fn submission_queue_head(&self) -> u16 {
        self.submission_queue_head
    }

    /// The raw SQID as reported by the controller
    pub fn submission_queue_ident(&self) -> u16 {
        self.submission_queue_ident
    }

    pub fn command_ident(&self) -> CommandIdentifier {
        self.command_ident
    }

    pub fn status_and_phase(&self) -> StatusAndPhase {
        self.status_and_phase
    }

    pub fn phase(&self) -> bool {
        self.status_and_phase.phase()
    }

    pub fn status(&self) -> CommandStatusCode {
        let status = self.status_and_phase;
        let code = status.status_code();
        match status.status_code_type() {
            0 => match GenericCommandStatus::try_from(code) {
                Ok(status) => CommandStatusCode::GenericStatus(status),
                Err(_) => CommandStatusCode::UnknownGenericStatus(code),
            },
            1 => CommandStatusCode::CommandSpecificStatus(code),
            2 => CommandStatusCode::MediaAndDataIntegrityError(code),
            3 => CommandStatusCode::PathRelatedStatus(code),
            7 => CommandStatusCode::VendorSpecific(code),
            typ => CommandStatusCode::Reserved { typ, status: code },
        }
    }
}

/// Status and Phase of a [CommonCompletionEntry]
///
/// See: NVM Express Base Spec: Figure 93: Completion Queue Entry: Status Field
// This struct uses a u16. The spec combines this field, with the command identifier
// into a u32. Therefor bit 16 in the spec is represented as bit 0 in this struct.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusAndPhase(u16);

impl StatusAndPhase {
    pub fn new(phase: bool, status_code_type: u8, status_code: u8) -> Self {
        let mut value = 0u16;
        value.set_bit(0, phase);
        value.set_bits(1..=8, status_code as u16);
        value.set_bits(9..=11, (status_code_type & 0b111) as u16);
        Self(value)
    }

    /// A successful status with `phase`
    pub fn success(phase: bool) -> Self {
        Self::new(phase, 0, GenericCommandStatus::Success as u8)
    }

    pub fn from_raw(value: u16) -> Self {
        Self(value)
    }

    pub fn raw(&self) -> u16 {
        self.0
    }

    pub fn phase(&self) -> bool {
        self.0.get_bit(0)
    }

    pub fn status_code(&self) -> u8 {
        self.0.get_bits(1..=8) as u8
    }

    pub fn status_code_type(&self) -> u8 {
        self.0.get_bits(9..=11) as u8
    }

    pub fn common_retry_delay(&self) -> u8 {
        self.0.get_bits(12..=13) as u8
    }

    pub fn more(&self) -> bool {
        self.0.get_bit(14)
    }

    pub fn do_not_retry(&self) -> bool {
        self.0.get_bit(15)
    }
}

/// StatusCode of an [CommonCompletionEntry]
///
/// See: NVM Express Base Spec: Figure 94: Status Code Type Values
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CommandStatusCode {
    #[error("Generic Command Error: {0:?}")]
    GenericStatus(GenericCommandStatus),
    #[error("Unknown Generic Command Error: {0:#x}")]
    UnknownGenericStatus(u8),
    #[error("Command specific error: {0:#x}")]
    CommandSpecificStatus(u8),
    #[error("Media and Data integrity error: {0:#x}")]
    MediaAndDataIntegrityError(u8),
    #[error("Path related error: {0:#x}")]
    PathRelatedStatus(u8),
    #[error("Reserved error: type {typ:#x}, code {status:#x}")]
    Reserved { typ: u8, status: u8 },
    #[error("Vendor specific error: {0:#x}")]
    VendorSpecific(u8),
}

impl CommandStatusCode {
    /// returns `true` if the status represents any type of error
    #[inline]
    pub fn is_err(self) -> bool {
        !self.is_success()
    }

    /// returns `true` if the status does not represents any type of error
    ///
    /// This is `true` for [GenericCommandStatus::Success]
    #[inline]
    pub fn is_success(self) -> bool {
        self == CommandStatusCode::GenericStatus(GenericCommandStatus::Success)
    }
}

/// Generic Error Code of an [CommonCompletionEntry]
///
/// See: NVM Express Base Spec: Figure 95: Generic Command Status Values
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, U8Enum)]
pub enum GenericCommandStatus {
    Success = 0,
    InvalidCommandOpcode = 1,
    InvalidFieldInCommand = 2,
    CommandIdConflict = 3,
    DataTransferError = 4,
    CommandAbortedPowerLoss = 5,
    InternalError = 6,
    AbortRequested = 7,
    AbortSQDeletion = 8,
    AbortFailedFuse = 9,
    AbortMissingFuse = 0xa,
    InvalidNamespaceFormat = 0xb,
    SequenceError = 0xc,
    InvalidSgl = 0xd,
    InvalidSglCount = 0xe,
    InvalidSglLength = 0xf,
    InvalidMetadataSglLength = 0x10,
    InvalidSglType = 0x11,
    InvalidUseOfControllerMemBuf = 0x12,
    InvalidPrpOffset = 0x13,
    AtomicWriteExceeded = 0x14,
    OperationDenied = 0x15,
    InvalidSglOffset = 0x16,
    // reserved 0x17
    HostIdInconsistentFormat = 0x18,
    KeepAliveExpired = 0x19,
    InvalidKeepAliveTimeout = 0x1a,
    AbortDueToPreemptAbort = 0x1b,
    SanitizeFailed = 0x1c,
    SanitizeInProgress = 0x1d,
    InvalidSglBlockGranularity = 0x1e,
    NotSupportedForQueueInCMB = 0x1f,
    NamespaceWriteProtected = 0x20,
    Interrupted = 0x21,
    TransientTransportError = 0x22,
    ProhibitedByLockdown = 0x23,
    AdminCommandMediaNotReady = 0x24,
    // reserved 0x25 .. 0x7f
    LbaOutOfRange = 0x80,
    CapacityExceeded = 0x81,
    NamespaceNotReady = 0x82,
    ReservationConflict = 0x83,
    FormatInProgress = 0x84,
    // reserved 0x85 .. 0xbf
    // vendor specific 0xc0 .. 0xff
}
