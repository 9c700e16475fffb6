use bit_field::BitField;
use bitflags::bitflags;
use shared_derive::U8Enum;

use crate::{generic_command::CommonCommand, queue::QueueIdentifier};

use super::CommandOpcode;

#[allow(unused_imports)]
use log::trace;

/// Interrupt routing of a new completion queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionInterrupt {
    Disabled,
    Vector(u16),
}

/// Create the [CommonCommand] data structure for a create io completion queue command
///
/// `memory` must be the device address of physically contiguous memory for
/// `queue_size` entries.
///
/// See: NVM Express Base Spec: 5.4
pub fn create_io_completion_queue(
    queue_ident: QueueIdentifier,
    queue_size: u32,
    memory: u64,
    interrupt: CompletionInterrupt,
) -> CommonCommand {
    trace!(
        "create io completion queue command, ident: {:?}, size: {}",
        queue_ident,
        queue_size
    );
    assert!(queue_size > 1 && queue_size <= 1 << 16);

    let mut command = CommonCommand::with_opcode(CommandOpcode::CreateIOCompletionQueue as u8);
    command.set_prp(memory, 0);

    command.dword10.set_bits(0..=15, queue_ident.as_u16() as u32);
    // Convert into 0 based value
    command.dword10.set_bits(16..=31, queue_size - 1);

    command.dword11.set_bit(0, true); // memory is phys contiguous
    if let CompletionInterrupt::Vector(vector) = interrupt {
        command.dword11.set_bit(1, true);
        command.dword11.set_bits(16..=31, vector as u32);
    }

    command
}

/// Create the [CommonCommand] data structure for a create io submission queue command
///
/// The queue completes into the completion queue with the same identifier.
///
/// See: NVM Express Base Spec: 5.5
pub fn create_io_submission_queue(
    queue_ident: QueueIdentifier,
    queue_size: u32,
    memory: u64,
) -> CommonCommand {
    trace!(
        "create io submission queue command, ident: {:?}, size: {}",
        queue_ident,
        queue_size
    );
    assert!(queue_size > 1 && queue_size <= 1 << 16);

    let mut command = CommonCommand::with_opcode(CommandOpcode::CreateIOSubmissionQueue as u8);
    command.set_prp(memory, 0);

    command.dword10.set_bits(0..=15, queue_ident.as_u16() as u32);
    // Convert into 0 based value
    command.dword10.set_bits(16..=31, queue_size - 1);

    command.dword11.set_bit(0, true); // memory is phys contiguous
    command
        .dword11
        .set_bits(1..=2, QueuePriority::Medium as u32); // ignored without weighted round robin
    command.dword11.set_bits(16..=31, queue_ident.as_u16() as u32); // 1:1 mapping
    command
}

/// Create the [CommonCommand] data structure for a delete io completion queue command
///
/// See: NVM Express Base Spec: 5.6
pub fn delete_io_completion_queue(queue_ident: QueueIdentifier) -> CommonCommand {
    let mut command = CommonCommand::with_opcode(CommandOpcode::DeleteIOCompletionQueue as u8);
    command.dword10.set_bits(0..=15, queue_ident.as_u16() as u32);
    command
}

/// Create the [CommonCommand] data structure for a delete io submission queue command
///
/// See: NVM Express Base Spec: 5.7
pub fn delete_io_submission_queue(queue_ident: QueueIdentifier) -> CommonCommand {
    let mut command = CommonCommand::with_opcode(CommandOpcode::DeleteIOSubmissionQueue as u8);
    command.dword10.set_bits(0..=15, queue_ident.as_u16() as u32);
    command
}

/// QPRIO of a submission queue
#[allow(missing_docs)]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, U8Enum)]
pub enum QueuePriority {
    Urgent = 0b00,
    High = 0b01,
    Medium = 0b10,
    Low = 0b11,
}

bitflags! {
    /// Command specific status codes of the create io completion queue command
    #[allow(missing_docs)]
    #[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Clone, Copy)]
    pub struct CompletionQueueCreationStatus: u8 {
        const InvalidIdentifier = 0x1;
        const InvalidSize = 0x2;
        const InvalidInterruptVector = 0x8;
    }
}

/// Command specific status codes of the create io submission queue command
#[allow(missing_docs)]
#[repr(u8)]
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Clone, Copy, U8Enum)]
pub enum SubmissionQueueCreationStatus {
    InvalidCompletionQueue = 0x0,
    InvalidIdentifier = 0x1,
    InvalidSize = 0x2,
}
