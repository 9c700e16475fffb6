//! Errors reported by the driver

use thiserror::Error;

use crate::{
    controller::ControllerState, dma::DmaError, generic_command::CommandIdentifier,
    generic_command::CommandStatusCode, queue::QueueIdentifier,
};

/// Error type for all driver operations
#[allow(missing_docs)]
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NvmeError {
    /// A bounded wait on a register or a polled command expired
    #[error("operation timed out")]
    Timeout,
    /// The controller completed the command with a non success status
    #[error("device error: {0}")]
    DeviceError(CommandStatusCode),
    #[error("out of resources: {0}")]
    OutOfResources(Resource),
    /// The controller broke the protocol. The controller is dead after this.
    #[error("protocol violation: {0}")]
    ProtocolViolation(Violation),
    /// The command was discarded because its queue was deleted
    #[error("command aborted")]
    Aborted,
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("device not supported: {0}")]
    DeviceNotSupported(&'static str),
    #[error("operation not possible in controller state {0:?}")]
    InvalidState(ControllerState),
}

/// The resource that was exhausted in [NvmeError::OutOfResources]
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    #[error("no free command context")]
    CommandContexts,
    #[error("DMA memory")]
    Dma,
}

/// Ways in which a controller can break the protocol
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
    #[error("completion for unknown command {cid:#x} on queue {queue:?}")]
    UnknownCommandIdentifier {
        queue: QueueIdentifier,
        cid: CommandIdentifier,
    },
    #[error("completion on queue {completion_queue:?} names submission queue {submission_queue:#x}")]
    QueueMismatch {
        completion_queue: QueueIdentifier,
        submission_queue: u16,
    },
    #[error("controller fatal status")]
    ControllerFatalStatus,
    #[error("controller registers are unreadable")]
    ControllerNotResponding,
}

impl From<DmaError> for NvmeError {
    fn from(_value: DmaError) -> Self {
        NvmeError::OutOfResources(Resource::Dma)
    }
}

impl From<CommandStatusCode> for NvmeError {
    fn from(value: CommandStatusCode) -> Self {
        NvmeError::DeviceError(value)
    }
}
