//! Command contexts
//!
//! Every command in flight on a [Queue](crate::queue::Queue) owns one
//! [CommandContext]. The context carries the command identifier and a
//! private slice of a shared page list used for PRP lists.

use alloc::{collections::VecDeque, sync::Arc};
use shared::lockcell::{LockCell, SpinLock};

#[allow(unused_imports)]
use log::{debug, trace, warn};

use crate::{
    dma::{DmaAllocator, DmaBuffer, SyncDirection},
    error::NvmeError,
    generic_command::CommandIdentifier,
    prp::{PrpEntry, PRP_ENTRY_SIZE},
    queue::QueueIdentifier,
};

/// Per command state
///
/// A context is either in the free list of its [CcbPool] or owned by exactly
/// one in flight command. It is intentionally not [Clone].
#[derive(Debug, PartialEq, Eq)]
pub struct CommandContext {
    id: CommandIdentifier,
    queue: QueueIdentifier,
    page_list_offset: usize,
    page_list_address: u64,
    page_list_entries: usize,
}

impl CommandContext {
    /// The identifier used for the command in the submission entry
    pub fn id(&self) -> CommandIdentifier {
        self.id
    }

    /// The queue this context belongs to
    pub fn queue(&self) -> QueueIdentifier {
        self.queue
    }

    /// The device address of the page list slice of this context
    pub fn page_list_address(&self) -> u64 {
        self.page_list_address
    }

    /// The number of PRP entries that fit into the page list slice
    pub fn page_list_entries(&self) -> usize {
        self.page_list_entries
    }
}

/// The fixed set of [CommandContext]s of a single queue
#[derive(Debug)]
pub struct CcbPool {
    queue: QueueIdentifier,
    capacity: u16,
    free: SpinLock<VecDeque<CommandContext>>,
    page_list: DmaBuffer,
    page_list_stride: usize,
}

impl CcbPool {
    /// Creates `capacity` contexts, each with room for `max_list_entries` PRP entries.
    ///
    /// The slice of each context is a power of two no larger than a page, so a
    /// page list never crosses a page boundary.
    pub fn new(
        allocator: &Arc<dyn DmaAllocator>,
        queue: QueueIdentifier,
        capacity: u16,
        max_list_entries: usize,
        page_size: usize,
    ) -> Result<Self, NvmeError> {
        if capacity == 0 {
            return Err(NvmeError::InvalidArgument("command context pool can not be empty"));
        }
        let stride = (max_list_entries.max(1).next_power_of_two() * PRP_ENTRY_SIZE).min(page_size);
        let entries_per_ccb = stride / PRP_ENTRY_SIZE;

        let page_list = DmaBuffer::allocate(allocator, capacity as usize * stride, page_size)?;

        let free = (0..capacity)
            .map(|index| {
                let offset = index as usize * stride;
                CommandContext {
                    id: CommandIdentifier::new(index),
                    queue,
                    page_list_offset: offset,
                    page_list_address: page_list.device_address() + offset as u64,
                    page_list_entries: entries_per_ccb.min(max_list_entries),
                }
            })
            .collect();

        trace!(
            "command context pool for {:?}: {} contexts, {} list entries each",
            queue,
            capacity,
            entries_per_ccb
        );

        Ok(Self {
            queue,
            capacity,
            free: SpinLock::new(free),
            page_list,
            page_list_stride: stride,
        })
    }

    /// Takes a free context, `None` if all contexts are in flight
    pub fn acquire(&self) -> Option<CommandContext> {
        self.free.lock().pop_front()
    }

    /// Returns a context to the free list
    pub fn release(&self, ccb: CommandContext) {
        debug_assert_eq!(ccb.queue, self.queue, "context released to the wrong pool");
        debug_assert!(ccb.page_list_offset % self.page_list_stride == 0);
        let mut free = self.free.lock();
        debug_assert!(free.len() < self.capacity as usize);
        free.push_back(ccb);
    }

    /// The number of contexts currently free
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    /// The total number of contexts
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Writes `entries` into the page list of `ccb`.
    ///
    /// Returns the device address of the list, which is used as the second
    /// PRP entry of the command.
    pub fn write_page_list(
        &self,
        ccb: &CommandContext,
        entries: &[PrpEntry],
    ) -> Result<u64, NvmeError> {
        if entries.len() > ccb.page_list_entries {
            return Err(NvmeError::InvalidArgument(
                "transfer needs more PRP entries than a command context holds",
            ));
        }
        for (index, entry) in entries.iter().enumerate() {
            self.page_list
                .write(ccb.page_list_offset + index * PRP_ENTRY_SIZE, entry.as_u64())?;
        }
        self.page_list.sync_range(
            ccb.page_list_offset,
            entries.len() * PRP_ENTRY_SIZE,
            SyncDirection::BeforeDeviceRead,
        );
        Ok(ccb.page_list_address)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        prp::{Prp, PrpEntry},
        sim::SimMemory,
        Segment,
    };
    use std::{collections::HashSet, vec::Vec};

    fn pool(capacity: u16, entries: usize) -> (Arc<SimMemory>, CcbPool) {
        let memory = Arc::new(SimMemory::new());
        let allocator: Arc<dyn DmaAllocator> = memory.clone();
        let pool = CcbPool::new(&allocator, QueueIdentifier::new(1), capacity, entries, 4096)
            .unwrap();
        (memory, pool)
    }

    #[test]
    fn acquire_until_empty() {
        let (_memory, pool) = pool(4, 32);
        let taken: Vec<_> = core::iter::from_fn(|| pool.acquire()).collect();
        assert_eq!(taken.len(), 4);
        assert_eq!(pool.available(), 0);
        assert!(pool.acquire().is_none());

        let ids: HashSet<_> = taken.iter().map(|ccb| ccb.id()).collect();
        assert_eq!(ids.len(), 4);

        for ccb in taken {
            pool.release(ccb);
        }
        assert_eq!(pool.available(), pool.capacity());
    }

    #[test]
    fn page_lists_do_not_overlap() {
        let (_memory, pool) = pool(8, 30);
        let first = pool.acquire().unwrap();
        let second = pool.acquire().unwrap();
        assert_eq!(first.page_list_entries(), 30);
        // 30 entries are rounded up to a 256 byte slice
        assert_eq!(
            second.page_list_address() - first.page_list_address(),
            256
        );
    }

    #[test]
    fn write_page_list() {
        let (_memory, pool) = pool(2, 4);
        let ccb = pool.acquire().unwrap();

        let segments = [Segment::new(0x10_0000, 4 * 4096)];
        let prp = Prp::from_segments(&segments, 4 * 4096, 4096).unwrap();
        let entries = prp.list_entries().unwrap();
        let address = pool.write_page_list(&ccb, entries).unwrap();
        assert_eq!(address, ccb.page_list_address());
        assert_eq!(pool.page_list.read::<u64>(0).unwrap(), 0x10_1000);
        assert_eq!(pool.page_list.read::<u64>(16).unwrap(), 0x10_3000);

        let too_many = [PrpEntry::zero(); 5];
        assert!(matches!(
            pool.write_page_list(&ccb, &too_many),
            Err(NvmeError::InvalidArgument(_))
        ));
    }
}
