//! Host memory that doubles as device memory

use core::{
    mem::size_of,
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};
use std::alloc::{alloc_zeroed, dealloc, Layout};

use alloc::collections::BTreeMap;
use shared::lockcell::{LockCell, SpinLock};

#[allow(unused_imports)]
use log::{trace, warn};

use crate::dma::{DeviceCopy, DmaAllocator, DmaError, DmaRegion, SyncDirection};

#[derive(Debug, Default)]
struct Regions {
    /// start address to layout
    live: BTreeMap<u64, Layout>,
    fail_after: Option<usize>,
    total: usize,
}

/// A [DmaAllocator] backed by the global allocator.
///
/// The device address of a region is its CPU address, which lets a
/// simulated device access the memory directly.
#[derive(Debug, Default)]
pub struct SimMemory {
    regions: SpinLock<Regions>,
    syncs: AtomicUsize,
}

impl SimMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of regions currently allocated
    pub fn live_allocations(&self) -> usize {
        self.regions.lock().live.len()
    }

    /// The number of regions ever allocated
    pub fn total_allocations(&self) -> usize {
        self.regions.lock().total
    }

    /// Lets the next `count` allocations succeed and fails all later ones
    pub fn fail_allocations_after(&self, count: usize) {
        self.regions.lock().fail_after = Some(count);
    }

    pub fn stop_failing_allocations(&self) {
        self.regions.lock().fail_after = None;
    }

    /// The number of cache maintenance operations performed
    pub fn sync_count(&self) -> usize {
        self.syncs.load(Ordering::Relaxed)
    }

    fn check_range(&self, address: u64, len: usize) -> Result<(), DmaError> {
        let regions = self.regions.lock();
        let inside = regions
            .live
            .range(..=address)
            .next_back()
            .is_some_and(|(start, layout)| {
                address + len as u64 <= start + layout.size() as u64
            });
        if inside {
            Ok(())
        } else {
            Err(DmaError::OutOfBounds {
                offset: address as usize,
                len,
                size: 0,
            })
        }
    }

    /// Reads memory the way the device sees it
    pub fn device_read(&self, address: u64, data: &mut [u8]) -> Result<(), DmaError> {
        self.check_range(address, data.len())?;
        let base = address as *const u8;
        for (index, byte) in data.iter_mut().enumerate() {
            *byte = unsafe {
                // Safety: the range is inside of a live region
                base.add(index).read_volatile()
            };
        }
        Ok(())
    }

    /// Writes memory the way the device does
    pub fn device_write(&self, address: u64, data: &[u8]) -> Result<(), DmaError> {
        self.check_range(address, data.len())?;
        let base = address as *mut u8;
        for (index, byte) in data.iter().enumerate() {
            unsafe {
                // Safety: the range is inside of a live region
                base.add(index).write_volatile(*byte);
            }
        }
        Ok(())
    }

    /// Reads a `T` at `address`.
    ///
    /// # Panics
    ///
    /// if the address is not inside of a live region
    pub fn device_read_value<T: DeviceCopy>(&self, address: u64) -> T {
        self.try_device_read_value(address)
            .expect("device read outside of DMA memory")
    }

    pub fn try_device_read_value<T: DeviceCopy>(&self, address: u64) -> Result<T, DmaError> {
        self.check_range(address, size_of::<T>())?;
        Ok(unsafe {
            // Safety: the range is inside of a live region
            (address as *const T).read_volatile()
        })
    }

    /// Writes a `T` at `address`.
    ///
    /// # Panics
    ///
    /// if the address is not inside of a live region
    pub fn device_write_value<T: DeviceCopy>(&self, address: u64, value: T) {
        self.try_device_write_value(address, value)
            .expect("device write outside of DMA memory")
    }

    pub fn try_device_write_value<T: DeviceCopy>(
        &self,
        address: u64,
        value: T,
    ) -> Result<(), DmaError> {
        self.check_range(address, size_of::<T>())?;
        unsafe {
            // Safety: the range is inside of a live region
            (address as *mut T).write_volatile(value);
        }
        Ok(())
    }
}

impl DmaAllocator for SimMemory {
    fn allocate(&self, size: usize, align: usize) -> Result<DmaRegion, DmaError> {
        let layout =
            Layout::from_size_align(size, align).map_err(|_| DmaError::InvalidLayout { size, align })?;
        if layout.size() == 0 {
            return Err(DmaError::InvalidLayout { size, align });
        }

        let mut regions = self.regions.lock();
        if let Some(remaining) = regions.fail_after.as_mut() {
            if *remaining == 0 {
                trace!("simulated allocation failure for {size:#x} bytes");
                return Err(DmaError::OutOfMemory);
            }
            *remaining -= 1;
        }

        let ptr = unsafe {
            // Safety: layout has a non zero size
            alloc_zeroed(layout)
        };
        let ptr = NonNull::new(ptr).ok_or(DmaError::OutOfMemory)?;
        let address = ptr.as_ptr() as u64;
        regions.live.insert(address, layout);
        regions.total += 1;

        Ok(unsafe {
            // Safety: freshly allocated, device address is identical to the cpu address
            DmaRegion::new(ptr, address, size)
        })
    }

    unsafe fn free(&self, region: DmaRegion) {
        let layout = self.regions.lock().live.remove(&region.device_address());
        match layout {
            Some(layout) => unsafe {
                // Safety: allocated in [Self::allocate] with this layout
                dealloc(region.cpu_address().as_ptr(), layout)
            },
            None => warn!(
                "free of unknown DMA region at {:#x}",
                region.device_address()
            ),
        }
    }

    fn sync(&self, _region: &DmaRegion, _offset: usize, _len: usize, _direction: SyncDirection) {
        self.syncs.fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for SimMemory {
    fn drop(&mut self) {
        let regions = core::mem::take(&mut self.regions.lock().live);
        for (address, layout) in regions {
            unsafe {
                // Safety: every live region was allocated with its layout.
                // Nothing can reference the memory once the allocator is gone,
                // because every DmaBuffer holds an Arc to it.
                dealloc(address as *mut u8, layout);
            }
        }
    }
}
