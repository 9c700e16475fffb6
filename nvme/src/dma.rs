//! Device visible memory
//!
//! The environment owns the actual allocator ([DmaAllocator]). This module
//! provides the owned [DmaBuffer] used for queues, page lists and identify
//! data, and the [IoBuffer] view the driver needs from host I/O buffers.

use core::{
    fmt::Debug,
    mem::{align_of, size_of},
    ptr::NonNull,
};

use alloc::{sync::Arc, vec::Vec};
use thiserror::Error;

#[allow(missing_docs)]
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaError {
    #[error("out of DMA memory")]
    OutOfMemory,
    #[error("invalid DMA layout: size {size:#x}, align {align:#x}")]
    InvalidLayout { size: usize, align: usize },
    #[error("access at {offset:#x}+{len:#x} outside of buffer of size {size:#x}")]
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },
}

/// Cache maintenance points around a device transfer.
///
/// [SyncDirection::BeforeDeviceWrite] must be used before handing a buffer
/// to the device to write into, [SyncDirection::AfterDeviceWrite] once the
/// device is known to have written into it and before the CPU reads it.
/// The `*DeviceRead` pair is the same for data produced by the CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    /// PREWRITE, the CPU wrote data the device is about to read
    BeforeDeviceRead,
    /// POSTWRITE, the device finished reading
    AfterDeviceRead,
    /// PREREAD, the device is about to write
    BeforeDeviceWrite,
    /// POSTREAD, the device wrote data the CPU is about to read
    AfterDeviceWrite,
}

/// A physically contiguous region handed out by a [DmaAllocator]
#[derive(Debug)]
pub struct DmaRegion {
    cpu_address: NonNull<u8>,
    device_address: u64,
    size: usize,
}

impl DmaRegion {
    /// # Safety
    ///
    /// `cpu_address` must be valid for reads and writes of `size` bytes until the
    /// region is freed and the device must see the same memory at `device_address`.
    pub unsafe fn new(cpu_address: NonNull<u8>, device_address: u64, size: usize) -> Self {
        Self {
            cpu_address,
            device_address,
            size,
        }
    }

    pub fn cpu_address(&self) -> NonNull<u8> {
        self.cpu_address
    }

    pub fn device_address(&self) -> u64 {
        self.device_address
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

/// Allocator for memory shared between the CPU and the controller
pub trait DmaAllocator: Send + Sync {
    /// Allocates `size` bytes of zeroed, physically contiguous memory aligned to `align`
    fn allocate(&self, size: usize, align: usize) -> Result<DmaRegion, DmaError>;

    /// Releases a region.
    ///
    /// # Safety
    ///
    /// `region` must have been allocated by this allocator and no outstanding
    /// hardware command may reference it.
    unsafe fn free(&self, region: DmaRegion);

    /// Performs the cache maintenance for `len` bytes at `offset` of `region`
    fn sync(&self, region: &DmaRegion, offset: usize, len: usize, direction: SyncDirection);
}

/// Types that can be copied in and out of device memory.
///
/// # Safety
///
/// Every bit pattern must be a valid value and the type must not contain padding.
pub unsafe trait DeviceCopy: Copy {}

unsafe impl DeviceCopy for u8 {}
unsafe impl DeviceCopy for u16 {}
unsafe impl DeviceCopy for u32 {}
unsafe impl DeviceCopy for u64 {}

/// An owned [DmaRegion], freed on drop
pub struct DmaBuffer {
    region: DmaRegion,
    allocator: Arc<dyn DmaAllocator>,
    segment: Segment,
    page_size: usize,
}

// Safety: the buffer is only accessed through volatile reads and writes.
// Ordering between CPU and device is established through [DmaBuffer::sync].
unsafe impl Send for DmaBuffer {}
unsafe impl Sync for DmaBuffer {}

impl Debug for DmaBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("device_address", &format_args!("{:#x}", self.region.device_address))
            .field("size", &format_args!("{:#x}", self.region.size))
            .finish()
    }
}

impl DmaBuffer {
    /// Allocates a zeroed buffer of at least `size` bytes.
    ///
    /// `size` is rounded up to a multiple of `page_size` and the buffer is
    /// aligned to `page_size`.
    pub fn allocate(
        allocator: &Arc<dyn DmaAllocator>,
        size: usize,
        page_size: usize,
    ) -> Result<Self, DmaError> {
        if size == 0 || !page_size.is_power_of_two() {
            return Err(DmaError::InvalidLayout {
                size,
                align: page_size,
            });
        }
        let size = size
            .checked_next_multiple_of(page_size)
            .ok_or(DmaError::InvalidLayout {
                size,
                align: page_size,
            })?;

        let region = allocator.allocate(size, page_size)?;
        if region.size < size || region.device_address % page_size as u64 != 0 {
            unsafe {
                // Safety: we just got the region and never handed it to the device
                allocator.free(region);
            }
            return Err(DmaError::InvalidLayout {
                size,
                align: page_size,
            });
        }

        let buffer = Self {
            segment: Segment::new(region.device_address, size),
            region,
            allocator: allocator.clone(),
            page_size,
        };
        buffer.zero();
        Ok(buffer)
    }

    /// The size in bytes
    pub fn size(&self) -> usize {
        self.segment.length
    }

    /// The alignment this buffer was allocated with
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// The address the device uses to access this buffer
    pub fn device_address(&self) -> u64 {
        self.region.device_address
    }

    /// Cache maintenance for the whole buffer
    pub fn sync(&self, direction: SyncDirection) {
        self.allocator
            .sync(&self.region, 0, self.size(), direction);
    }

    /// Cache maintenance for `len` bytes at `offset`
    pub fn sync_range(&self, offset: usize, len: usize, direction: SyncDirection) {
        debug_assert!(offset + len <= self.size());
        self.allocator.sync(&self.region, offset, len, direction);
    }

    fn check_bounds(&self, offset: usize, len: usize) -> Result<(), DmaError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size() => Ok(()),
            _ => Err(DmaError::OutOfBounds {
                offset,
                len,
                size: self.size(),
            }),
        }
    }

    /// Reads a `T` at `offset`
    pub fn read<T: DeviceCopy>(&self, offset: usize) -> Result<T, DmaError> {
        self.check_bounds(offset, size_of::<T>())?;
        debug_assert!(offset % align_of::<T>() == 0);
        let value = unsafe {
            // Safety: bounds checked above, alignment is guaranteed by callers
            // because the buffer is page aligned
            self.region
                .cpu_address
                .add(offset)
                .cast::<T>()
                .read_volatile()
        };
        Ok(value)
    }

    /// Writes a `T` at `offset`
    pub fn write<T: DeviceCopy>(&self, offset: usize, value: T) -> Result<(), DmaError> {
        self.check_bounds(offset, size_of::<T>())?;
        debug_assert!(offset % align_of::<T>() == 0);
        unsafe {
            // Safety: see [Self::read]
            self.region
                .cpu_address
                .add(offset)
                .cast::<T>()
                .write_volatile(value);
        }
        Ok(())
    }

    /// Copies `data` into the buffer at `offset`
    pub fn write_bytes(&self, offset: usize, data: &[u8]) -> Result<(), DmaError> {
        self.check_bounds(offset, data.len())?;
        for (index, byte) in data.iter().enumerate() {
            unsafe {
                // Safety: bounds checked above
                self.region
                    .cpu_address
                    .add(offset + index)
                    .write_volatile(*byte);
            }
        }
        Ok(())
    }

    /// Copies bytes starting at `offset` into `data`
    pub fn read_bytes(&self, offset: usize, data: &mut [u8]) -> Result<(), DmaError> {
        self.check_bounds(offset, data.len())?;
        for (index, byte) in data.iter_mut().enumerate() {
            *byte = unsafe {
                // Safety: bounds checked above
                self.region.cpu_address.add(offset + index).read_volatile()
            };
        }
        Ok(())
    }

    /// Copies the whole buffer into a new [Vec]
    pub fn to_vec(&self) -> Vec<u8> {
        let mut data = alloc::vec![0; self.size()];
        // can not fail, data has exactly our size
        let _ = self.read_bytes(0, &mut data);
        data
    }

    /// Sets every byte to 0
    pub fn zero(&self) {
        let qwords = self.size() / size_of::<u64>();
        for index in 0..qwords {
            unsafe {
                // Safety: size is a multiple of the page size and therefor of 8
                self.region
                    .cpu_address
                    .add(index * size_of::<u64>())
                    .cast::<u64>()
                    .write_volatile(0);
            }
        }
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        let region = DmaRegion {
            cpu_address: self.region.cpu_address,
            device_address: self.region.device_address,
            size: self.region.size,
        };
        unsafe {
            // Safety: the region came from this allocator. Owners of a buffer
            // keep it alive while a command references it.
            self.allocator.free(region);
        }
    }
}

/// One device visible piece of an I/O buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub address: u64,
    pub length: usize,
}

impl Segment {
    pub const fn new(address: u64, length: usize) -> Self {
        Self { address, length }
    }
}

/// A host buffer mapped for a device transfer
///
/// This is whatever the environments DMA mapping facility produced. The driver
/// only needs the device visible segments and the cache maintenance.
pub trait IoBuffer: Send {
    /// The device visible segments in transfer order
    fn segments(&self) -> &[Segment];

    /// The total length in bytes
    fn len(&self) -> usize {
        self.segments().iter().map(|segment| segment.length).sum()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cache maintenance for the whole buffer
    fn sync(&self, direction: SyncDirection);
}

impl IoBuffer for DmaBuffer {
    fn segments(&self) -> &[Segment] {
        core::slice::from_ref(&self.segment)
    }

    fn len(&self) -> usize {
        self.size()
    }

    fn sync(&self, direction: SyncDirection) {
        DmaBuffer::sync(self, direction)
    }
}
