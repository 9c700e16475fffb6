use alloc::{string::String, vec::Vec};
use bit_field::BitField;

use crate::{generic_command::CommonCommand, properties::Version};

use super::CommandOpcode;

/// The size of every identify data structure
pub const IDENTIFY_DATA_SIZE: usize = 4096;

#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
/// CNS Value
/// See: NVM Express Base Spec: Figure 274: Identify CNS Value
pub enum IdentifyTarget {
    Namespace { nsid: u32 },
    Controller,
    ActiveNamespaceList { start_after: u32 },
}

impl IdentifyTarget {
    pub fn cns(&self) -> u8 {
        match self {
            IdentifyTarget::Namespace { .. } => 0x0,
            IdentifyTarget::Controller => 0x1,
            IdentifyTarget::ActiveNamespaceList { .. } => 0x2,
        }
    }
}

/// Create the [CommonCommand] data structure for an identify command
///
/// `data` must be the device address of a [IDENTIFY_DATA_SIZE] buffer
///
/// See: NVM Express Base Spec: 5.17
pub fn create_identify_command(target: IdentifyTarget, data: u64) -> CommonCommand {
    let mut command = CommonCommand::with_opcode(CommandOpcode::Identify as u8);
    command.set_prp(data, 0);
    command.dword10.set_bits(0..=7, target.cns() as u32);

    match target {
        IdentifyTarget::Namespace { nsid } => command.namespace_ident = nsid,
        IdentifyTarget::ActiveNamespaceList { start_after } => {
            command.namespace_ident = start_after
        }
        IdentifyTarget::Controller => {
            // NSID, CNTID and CSI not used
        }
    }

    command
}

fn le_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

fn le_u32(data: &[u8], offset: usize) -> u32 {
    let mut bytes = [0; 4];
    bytes.copy_from_slice(&data[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

fn le_u64(data: &[u8], offset: usize) -> u64 {
    let mut bytes = [0; 8];
    bytes.copy_from_slice(&data[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

/// Converts a space padded ASCII field into a printable string.
///
/// Trailing spaces and NULs are dropped, other non printable bytes are
/// replaced by `?`.
pub fn ascii_field(data: &[u8]) -> String {
    let end = data
        .iter()
        .rposition(|byte| *byte != b' ' && *byte != 0)
        .map_or(0, |index| index + 1);
    data[..end]
        .iter()
        .map(|byte| {
            if byte.is_ascii_graphic() || *byte == b' ' {
                *byte as char
            } else {
                '?'
            }
        })
        .collect()
}

/// Information about a Controller
///
/// Only the fields the driver uses are decoded.
///
/// See: NVM Express Base Spec: Figure 276: Identify Controller Data Structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifyControllerData {
    pub pci_vendor_id: u16,
    pub pci_subsystem_vendor_id: u16,
    pub serial_number: String,
    pub model_number: String,
    pub firmware_revision: String,
    /// MDTS, as a power of two in units of the minimum page size. 0 means no limit
    pub maximum_data_transfer_size: u8,
    pub controller_id: u16,
    pub version: Version,
    /// SQES, required (bits 0..=3) and maximum (bits 4..=7) entry size as power of two
    pub submission_queue_entry_size: u8,
    /// CQES, see [Self::submission_queue_entry_size]
    pub completion_queue_entry_size: u8,
    /// NN, the highest namespace identifier
    pub number_of_namespaces: u32,
    /// VWC bit 0
    pub volatile_write_cache: bool,
}

impl IdentifyControllerData {
    pub fn parse(data: &[u8]) -> Self {
        assert!(data.len() >= IDENTIFY_DATA_SIZE);
        Self {
            pci_vendor_id: le_u16(data, 0),
            pci_subsystem_vendor_id: le_u16(data, 2),
            serial_number: ascii_field(&data[4..24]),
            model_number: ascii_field(&data[24..64]),
            firmware_revision: ascii_field(&data[64..72]),
            maximum_data_transfer_size: data[77],
            controller_id: le_u16(data, 78),
            version: Version::from(le_u32(data, 80)),
            submission_queue_entry_size: data[512],
            completion_queue_entry_size: data[513],
            number_of_namespaces: le_u32(data, 516),
            volatile_write_cache: data[525].get_bit(0),
        }
    }

    /// The required submission queue entry size in bytes
    pub fn required_submission_entry_size(&self) -> usize {
        1 << self.submission_queue_entry_size.get_bits(0..=3)
    }

    /// The required completion queue entry size in bytes
    pub fn required_completion_entry_size(&self) -> usize {
        1 << self.completion_queue_entry_size.get_bits(0..=3)
    }
}

/// A LBA format of a namespace
///
/// See: NVM Command Set Spec: Figure 116: LBA Format Data Structure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LbaFormat {
    pub metadata_size: u16,
    /// LBADS, the block size as a power of two
    pub data_shift: u8,
    pub relative_performance: u8,
}

impl LbaFormat {
    fn parse(value: u32) -> Self {
        Self {
            metadata_size: value.get_bits(0..=15) as u16,
            data_shift: value.get_bits(16..=23) as u8,
            relative_performance: value.get_bits(24..=25) as u8,
        }
    }
}

/// Information about a namespace
///
/// See: NVM Command Set Spec: Figure 114: Identify Namespace Data Structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifyNamespaceData {
    /// NSZE in blocks
    pub size: u64,
    /// NCAP in blocks
    pub capacity: u64,
    /// NUSE in blocks
    pub utilization: u64,
    /// FLBAS
    pub formatted_lba_size: u8,
    pub lba_formats: Vec<LbaFormat>,
}

impl IdentifyNamespaceData {
    pub fn parse(data: &[u8]) -> Self {
        assert!(data.len() >= IDENTIFY_DATA_SIZE);
        // NLBAF is 0 based
        let format_count = data[25] as usize + 1;
        let lba_formats = (0..format_count.min(64))
            .map(|index| LbaFormat::parse(le_u32(data, 128 + 4 * index)))
            .collect();
        Self {
            size: le_u64(data, 0),
            capacity: le_u64(data, 8),
            utilization: le_u64(data, 16),
            formatted_lba_size: data[26],
            lba_formats,
        }
    }

    /// An inactive namespace reports a size of 0
    pub fn is_active(&self) -> bool {
        self.size != 0
    }

    /// The LBA format the namespace is formatted with
    pub fn active_format(&self) -> Option<LbaFormat> {
        let index = self.formatted_lba_size.get_bits(0..=3) as usize;
        self.lba_formats.get(index).copied()
    }
}

/// Parses the list returned by [IdentifyTarget::ActiveNamespaceList]
pub fn parse_namespace_list(data: &[u8]) -> Vec<u32> {
    data[..IDENTIFY_DATA_SIZE]
        .chunks_exact(4)
        .map(|chunk| le_u32(chunk, 0))
        .take_while(|nsid| *nsid != 0)
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use std::vec;

    #[test]
    fn identify_command_layout() {
        let command = create_identify_command(IdentifyTarget::Namespace { nsid: 3 }, 0x8000);
        assert_eq!(command.opcode(), 0x6);
        assert_eq!(command.namespace(), 3);
        assert_eq!(command.prp1(), 0x8000);
        assert_eq!(command.command_dwords()[0], 0);

        let command = create_identify_command(IdentifyTarget::Controller, 0x9000);
        assert_eq!(command.namespace(), 0);
        assert_eq!(command.command_dwords()[0], 1);
    }

    #[test]
    fn parse_controller() {
        let mut data = vec![0u8; IDENTIFY_DATA_SIZE];
        data[0..2].copy_from_slice(&0x1b36u16.to_le_bytes());
        data[4..24].copy_from_slice(b"SN-0001             ");
        data[24..33].copy_from_slice(b"QEMU NVMe");
        data[64..72].copy_from_slice(b"1.0\x01    ");
        data[77] = 5;
        data[78..80].copy_from_slice(&7u16.to_le_bytes());
        data[80..84].copy_from_slice(&0x0001_0400u32.to_le_bytes());
        data[512] = 0x66;
        data[513] = 0x44;
        data[516..520].copy_from_slice(&4u32.to_le_bytes());
        data[525] = 1;

        let parsed = IdentifyControllerData::parse(&data);
        assert_eq!(parsed.pci_vendor_id, 0x1b36);
        assert_eq!(parsed.serial_number, "SN-0001");
        assert_eq!(parsed.model_number, "QEMU NVMe");
        assert_eq!(parsed.firmware_revision, "1.0?");
        assert_eq!(parsed.maximum_data_transfer_size, 5);
        assert_eq!(parsed.controller_id, 7);
        assert_eq!(parsed.version, Version::new(1, 4, 0));
        assert_eq!(parsed.required_submission_entry_size(), 64);
        assert_eq!(parsed.required_completion_entry_size(), 16);
        assert_eq!(parsed.number_of_namespaces, 4);
        assert!(parsed.volatile_write_cache);
    }

    #[test]
    fn parse_namespace() {
        let mut data = vec![0u8; IDENTIFY_DATA_SIZE];
        data[0..8].copy_from_slice(&1000u64.to_le_bytes());
        data[8..16].copy_from_slice(&900u64.to_le_bytes());
        data[16..24].copy_from_slice(&10u64.to_le_bytes());
        data[25] = 1;
        data[26] = 1;
        data[128..132].copy_from_slice(&(9u32 << 16).to_le_bytes());
        data[132..136].copy_from_slice(&(12u32 << 16 | 8).to_le_bytes());

        let parsed = IdentifyNamespaceData::parse(&data);
        assert!(parsed.is_active());
        assert_eq!(parsed.size, 1000);
        assert_eq!(parsed.capacity, 900);
        assert_eq!(parsed.utilization, 10);
        assert_eq!(parsed.lba_formats.len(), 2);
        let format = parsed.active_format().unwrap();
        assert_eq!(format.data_shift, 12);
        assert_eq!(format.metadata_size, 8);

        let empty = IdentifyNamespaceData::parse(&vec![0u8; IDENTIFY_DATA_SIZE]);
        assert!(!empty.is_active());
    }

    #[test]
    fn namespace_list_stops_at_zero() {
        let mut data = vec![0u8; IDENTIFY_DATA_SIZE];
        data[0..4].copy_from_slice(&1u32.to_le_bytes());
        data[4..8].copy_from_slice(&3u32.to_le_bytes());
        data[12..16].copy_from_slice(&9u32.to_le_bytes());
        assert_eq!(parse_namespace_list(&data), vec![1, 3]);
    }
}
