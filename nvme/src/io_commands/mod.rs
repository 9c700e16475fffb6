//! NVMe io command set
//!
//! The specification documents can be found at <https://nvmexpress.org/specifications/>
//! specifically: NVM Command Set

use core::fmt::{Debug, LowerHex, UpperHex};

use bit_field::BitField;
use shared_derive::U8Enum;

use crate::generic_command::CommonCommand;

/// Opcode for the different commands
#[allow(missing_docs)]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, U8Enum)]
pub enum CommandOpcode {
    Flush = 0x0,
    Write = 0x1,
    Read = 0x2,
    WriteUncorrectable = 0x4,
    Compare = 0x5,
    WriteZeroes = 0x8,
    DatasetManagment = 0x9,
    Verify = 0xc,
}

/// The maximum number of blocks a single read or write can transfer
pub const MAX_BLOCKS_PER_COMMAND: u32 = 1 << 16;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LBA(u64);

impl LBA {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl From<u64> for LBA {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<LBA> for u64 {
    fn from(value: LBA) -> Self {
        value.0
    }
}

impl Debug for LBA {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "LBA({:#x})", self.0)
    }
}

impl LowerHex for LBA {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        LowerHex::fmt(&self.0, f)
    }
}

impl UpperHex for LBA {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        UpperHex::fmt(&self.0, f)
    }
}

/// Create the [CommonCommand] data structure for a read or write command
///
/// See: NVM Command Spec: 3.2.4 and 3.2.6
pub fn create_read_write_command(
    opcode: CommandOpcode,
    nsid: u32,
    slba: LBA,
    block_count: u32,
    prp1: u64,
    prp2: u64,
) -> CommonCommand {
    assert!(matches!(opcode, CommandOpcode::Read | CommandOpcode::Write));
    assert!(block_count > 0 && block_count <= MAX_BLOCKS_PER_COMMAND);

    let mut command = CommonCommand::with_opcode(opcode as u8);
    command.namespace_ident = nsid;
    command.set_prp(prp1, prp2);

    let slba = slba.value();
    command.dword10 = (slba & 0xffff_ffff) as u32;
    command.dword11 = (slba >> 32) as u32;

    // set block count as 0 based value
    // bit 30 FUA and bit 31 limited retry are never set
    command.dword12.set_bits(0..=15, block_count - 1);

    command
}

/// Create the [CommonCommand] data structure for a flush command
///
/// See: NVM Command Spec: 3.2.2
pub fn create_flush_command(nsid: u32) -> CommonCommand {
    let mut command = CommonCommand::with_opcode(CommandOpcode::Flush as u8);
    command.namespace_ident = nsid;
    command
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn write_command_layout() {
        let command = create_read_write_command(
            CommandOpcode::Write,
            1,
            LBA::new(0x1_0000_0064),
            8,
            0x4000,
            0,
        );
        let dwords = command.command_dwords();
        assert_eq!(command.opcode(), 0x1);
        assert_eq!(command.namespace(), 1);
        assert_eq!(command.prp1(), 0x4000);
        assert_eq!(dwords[0], 0x64);
        assert_eq!(dwords[1], 0x1);
        assert_eq!(dwords[2], 7);
    }

    #[test]
    fn maximum_block_count() {
        let command =
            create_read_write_command(CommandOpcode::Read, 2, LBA::new(0), 1 << 16, 0x1000, 0);
        assert_eq!(command.command_dwords()[2], 0xffff);
    }

    #[test]
    fn flush_layout() {
        let command = create_flush_command(5);
        assert_eq!(command.opcode(), 0);
        assert_eq!(command.namespace(), 5);
        assert_eq!(command.prp1(), 0);
    }

    #[test]
    fn lba_debug() {
        assert_eq!(std::format!("{:?}", LBA::new(0x20)), "LBA(0x20)");
    }
}
