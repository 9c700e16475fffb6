//! PRP - Physical Region Page Entry

use core::mem::size_of;

use alloc::vec::Vec;
use thiserror::Error;

use crate::dma::Segment;

/// A prp entry for the [CommonCommand](super::generic_command::CommonCommand)
///
/// Transfers spanning 1 or 2 pages are described inline, everything larger
/// uses a list stored in the page list of the command context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prp {
    Entry(PrpEntry),
    DoubleEntry(PrpEntry, PrpEntry),
    List {
        /// passed as the first prp entry in the command
        first: PrpEntry,
        /// written to the page list, the list address is the second entry
        rest: Vec<PrpEntry>,
    },
}

#[derive(Error, Debug, PartialEq, Eq, Clone, Copy)]
#[allow(missing_docs)]
pub enum PrpError {
    #[error("transfer is empty")]
    Empty,
    #[error("buffer of {available:#x} bytes is shorter than the transfer of {required:#x} bytes")]
    BufferTooSmall { available: usize, required: usize },
    #[error("PrpEntries must be dword aligned")]
    NotDwordAligned,
    #[error("only the first segment may start and only the last may end inside of a page")]
    MisalignedSegment,
}

impl Prp {
    /// Describes the first `transfer_len` bytes of `segments`.
    ///
    /// Only the first segment may start at an offset into a page and every
    /// segment but the last must end on a page boundary.
    pub fn from_segments(
        segments: &[Segment],
        transfer_len: usize,
        page_size: usize,
    ) -> Result<Prp, PrpError> {
        assert!(page_size.is_power_of_two());
        if transfer_len == 0 {
            return Err(PrpError::Empty);
        }
        let available = segments.iter().map(|segment| segment.length).sum();
        if available < transfer_len {
            return Err(PrpError::BufferTooSmall {
                available,
                required: transfer_len,
            });
        }

        let page_mask = page_size as u64 - 1;
        let mut entries = Vec::new();
        let mut remaining = transfer_len;

        for (index, segment) in segments.iter().enumerate() {
            if remaining == 0 {
                break;
            }
            if segment.length == 0 {
                continue;
            }
            if segment.address & 0b11 != 0 {
                return Err(PrpError::NotDwordAligned);
            }
            if index > 0 && segment.address & page_mask != 0 {
                return Err(PrpError::MisalignedSegment);
            }

            let length = segment.length.min(remaining);
            let end = segment.address + length as u64;
            remaining -= length;
            if remaining > 0 && end & page_mask != 0 {
                return Err(PrpError::MisalignedSegment);
            }

            entries.push(PrpEntry(segment.address));
            let mut page = (segment.address & !page_mask) + page_size as u64;
            while page < end {
                entries.push(PrpEntry(page));
                page += page_size as u64;
            }
        }

        let mut entries = entries.into_iter();
        // at least one entry, transfer_len is not 0
        let first = entries.next().ok_or(PrpError::Empty)?;
        let rest: Vec<PrpEntry> = entries.collect();
        Ok(match rest.len() {
            0 => Prp::Entry(first),
            1 => Prp::DoubleEntry(first, rest[0]),
            _ => Prp::List { first, rest },
        })
    }

    /// The first prp entry for the command
    pub fn entry_1(&self) -> PrpEntry {
        match self {
            Prp::Entry(entry) => *entry,
            Prp::DoubleEntry(entry, _) => *entry,
            Prp::List { first, .. } => *first,
        }
    }

    /// The entries that have to be written into a page list
    pub fn list_entries(&self) -> Option<&[PrpEntry]> {
        match self {
            Prp::List { rest, .. } => Some(rest),
            Prp::Entry(_) | Prp::DoubleEntry(..) => None,
        }
    }

    /// The total number of page entries
    pub fn entry_count(&self) -> usize {
        match self {
            Prp::Entry(_) => 1,
            Prp::DoubleEntry(..) => 2,
            Prp::List { rest, .. } => 1 + rest.len(),
        }
    }
}

/// A Prp Entry
///
/// See: NVM Express Base Specification: 4.1.1
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrpEntry(u64);

/// The size of a single entry within a prp list
pub const PRP_ENTRY_SIZE: usize = size_of::<PrpEntry>();

impl PrpEntry {
    pub const fn zero() -> PrpEntry {
        Self(0)
    }

    pub fn offset(&self, page_size: usize) -> u64 {
        self.0 & (page_size as u64 - 1)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}
