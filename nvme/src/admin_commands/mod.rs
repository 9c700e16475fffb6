//! NVMe admin command set
//!
//! The specification documents can be found at <https://nvmexpress.org/specifications/>
//! specifically: NVM Express Base Specification

use bit_field::BitField;
use shared_derive::U8Enum;

use crate::{
    generic_command::{CommandIdentifier, CommonCommand},
    queue::QueueIdentifier,
};

mod features;
mod identify;
mod io_queue;

pub use features::*;
pub use identify::*;
pub use io_queue::*;

/// Opcode for the different commands
#[allow(missing_docs)]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, U8Enum)]
pub enum CommandOpcode {
    DeleteIOSubmissionQueue = 0x0,
    CreateIOSubmissionQueue = 0x1,
    GetLogPage = 0x2,
    DeleteIOCompletionQueue = 0x4,
    CreateIOCompletionQueue = 0x5,
    Identify = 0x6,
    Abort = 0x8,
    SetFeatures = 0x9,
    GetFeatures = 0xa,
    AsynchronousEventRequest = 0xc,
    KeepAlive = 0x18,
}

/// Create the [CommonCommand] data structure for an abort command
///
/// Bit 0 of the completion dword 0 is cleared if the command was aborted.
///
/// See: NVM Express Base Spec: 5.1
pub fn create_abort_command(
    submission_queue: QueueIdentifier,
    command: CommandIdentifier,
) -> CommonCommand {
    let mut abort = CommonCommand::with_opcode(CommandOpcode::Abort as u8);
    abort.dword10.set_bits(0..=15, submission_queue.as_u16() as u32);
    abort.dword10.set_bits(16..=31, command.as_u16() as u32);
    abort
}

/// Whether the completion dword 0 of an abort command reports that the
/// command was not aborted
pub fn abort_not_performed(dword0: u32) -> bool {
    dword0.get_bit(0)
}
