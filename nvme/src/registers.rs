//! Access to the memory mapped controller registers

use core::{
    ptr::NonNull,
    sync::atomic::{fence, Ordering},
};

use crate::queue::QueueIdentifier;

/// CAP, 64 bit
pub const CAPABILITIES: usize = 0x00;
/// VS
pub const VERSION: usize = 0x08;
/// INTMS
pub const INTERRUPT_MASK_SET: usize = 0x0c;
/// INTMC
pub const INTERRUPT_MASK_CLEAR: usize = 0x10;
/// CC
pub const CONTROLLER_CONFIGURATION: usize = 0x14;
/// CSTS
pub const CONTROLLER_STATUS: usize = 0x1c;
/// AQA
pub const ADMIN_QUEUE_ATTRIBUTES: usize = 0x24;
/// ASQ, 64 bit
pub const ADMIN_SUBMISSION_QUEUE: usize = 0x28;
/// ACQ, 64 bit
pub const ADMIN_COMPLETION_QUEUE: usize = 0x30;
/// Offset of the first doorbell register
pub const DOORBELL_BASE: usize = 0x1000;

/// The offset of the submission queue tail doorbell for `queue`
///
/// See: NVM Express Base Spec: 3.1.4.23: SQyTDBL
pub fn submission_tail_doorbell(queue: QueueIdentifier, stride: usize) -> usize {
    DOORBELL_BASE + (2 * queue.as_u16() as usize) * stride
}

/// The offset of the completion queue head doorbell for `queue`
///
/// See: NVM Express Base Spec: 3.1.4.24: CQyHDBL
pub fn completion_head_doorbell(queue: QueueIdentifier, stride: usize) -> usize {
    DOORBELL_BASE + (2 * queue.as_u16() as usize + 1) * stride
}

/// The register window of a single controller.
///
/// Offsets are in bytes from the start of the mapped BAR. Reads are side
/// effect free for every register except the doorbells, so the window can
/// be shared between threads. Writes that must reach the device before a
/// later access are followed by [RegisterWindow::barrier].
pub trait RegisterWindow: Send + Sync {
    fn read32(&self, offset: usize) -> u32;

    fn write32(&self, offset: usize, value: u32);

    fn read64(&self, offset: usize) -> u64 {
        let low = self.read32(offset) as u64;
        let high = self.read32(offset + 4) as u64;
        high << 32 | low
    }

    /// Writes the low dword first, as required for ASQ and ACQ on
    /// controllers that only support 32 bit accesses.
    fn write64(&self, offset: usize, value: u64) {
        self.write32(offset, value as u32);
        self.write32(offset + 4, (value >> 32) as u32);
    }

    /// Orders all previous register accesses before any later access
    fn barrier(&self) {
        fence(Ordering::SeqCst);
    }
}

/// A [RegisterWindow] backed by mapped device memory
#[derive(Debug)]
pub struct MmioRegisters {
    base: NonNull<u8>,
    len: usize,
}

// Safety: all accesses are volatile reads and writes of aligned dwords.
// Concurrent access to MMIO is serialized by the device.
unsafe impl Send for MmioRegisters {}
unsafe impl Sync for MmioRegisters {}

impl MmioRegisters {
    /// Creates a new register window.
    ///
    /// # Safety
    ///
    /// `base` must point to `len` bytes of uncached memory mapped controller
    /// registers that stay mapped for the lifetime of this object and are not
    /// accessed through any other reference.
    pub unsafe fn new(base: NonNull<u8>, len: usize) -> Self {
        assert!(
            base.as_ptr() as usize % 4 == 0,
            "register base must be dword aligned"
        );
        Self { base, len }
    }

    fn dword(&self, offset: usize) -> NonNull<u32> {
        assert!(
            offset % 4 == 0 && offset + 4 <= self.len,
            "register offset {offset:#x} outside of window"
        );
        // Safety: offset is inside of the mapped window
        unsafe { self.base.add(offset).cast() }
    }
}

impl RegisterWindow for MmioRegisters {
    fn read32(&self, offset: usize) -> u32 {
        // Safety: dword checks the offset, the window is mapped for our lifetime.
        // No reference to the register is created, concurrent accesses only
        // race on the device.
        unsafe { self.dword(offset).as_ptr().read_volatile() }
    }

    fn write32(&self, offset: usize, value: u32) {
        // Safety: see read32
        unsafe { self.dword(offset).as_ptr().write_volatile(value) }
    }
}
